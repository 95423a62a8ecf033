// config.rs — Integrator configuration and one-call context setup.
//
// Defaults can be overridden from the environment:
//
//   AZIMINT_DEVICE      cpu | gpu | acc | all
//   AZIMINT_EXTENSIONS  comma-separated extension tags, e.g. "shader_f64"
//   AZIMINT_FP64        1/0, true/false, yes/no, on/off
//   AZIMINT_SAFE        same; false selects CachePolicy::TrustCaller
//   AZIMINT_WG          GPU workgroup size (u32 > 0)

use log::info;

use crate::context::{CachePolicy, ContextOptions, IntegrationContext};
use crate::device::{self, DeviceCatalog, DeviceRequest};
use crate::engine::Precision;
use crate::error::{IntegrationError, Result};
use crate::host::DEFAULT_CHUNK;
use crate::validate::DEFAULT_THRESHOLD;

pub const ENV_DEVICE: &str = "AZIMINT_DEVICE";
pub const ENV_EXTENSIONS: &str = "AZIMINT_EXTENSIONS";
pub const ENV_FP64: &str = "AZIMINT_FP64";
pub const ENV_SAFE: &str = "AZIMINT_SAFE";
pub const ENV_WG: &str = "AZIMINT_WG";

/// Everything needed to go from "some device" to a ready context.
#[derive(Debug, Clone, PartialEq)]
pub struct IntegratorConfig {
    pub request: DeviceRequest,
    /// Preferred precision; downgraded to fp32 when the device lacks fp64.
    pub precision: Precision,
    pub policy: CachePolicy,
    pub workgroup_size: u32,
    pub host_chunk: usize,
    /// Rwp acceptance threshold, in percent.
    pub threshold: f64,
}

impl Default for IntegratorConfig {
    fn default() -> Self {
        IntegratorConfig {
            request: DeviceRequest::default(),
            precision: Precision::Fp64,
            policy: CachePolicy::ValidateBeforeUse,
            workgroup_size: 128,
            host_chunk: DEFAULT_CHUNK,
            threshold: DEFAULT_THRESHOLD,
        }
    }
}

fn parse_bool(key: &str, v: &str) -> Result<bool> {
    match v.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(IntegrationError::InvalidConfiguration(format!(
            "{key}: expected a boolean, got '{other}'"
        ))),
    }
}

impl IntegratorConfig {
    /// Defaults overlaid with the `AZIMINT_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::default().overlay(|k| std::env::var(k).ok())
    }

    /// Overlay values from `lookup` (an environment-like key → value map).
    pub fn overlay(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(v) = lookup(ENV_DEVICE) {
            self.request.class = v.parse()?;
        }
        if let Some(v) = lookup(ENV_EXTENSIONS) {
            self.request.extensions = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_ascii_lowercase)
                .collect();
        }
        if let Some(v) = lookup(ENV_FP64) {
            let fp64 = parse_bool(ENV_FP64, &v)?;
            self.precision = if fp64 { Precision::Fp64 } else { Precision::Fp32 };
        }
        if let Some(v) = lookup(ENV_SAFE) {
            self.policy = CachePolicy::from_safe(parse_bool(ENV_SAFE, &v)?);
        }
        if let Some(v) = lookup(ENV_WG) {
            self.workgroup_size = match v.trim().parse::<u32>() {
                Ok(wg) if wg > 0 => wg,
                _ => {
                    return Err(IntegrationError::InvalidConfiguration(format!(
                        "{ENV_WG}: expected a positive integer, got '{v}'"
                    )))
                }
            };
        }
        Ok(self)
    }

    pub fn context_options(&self) -> ContextOptions {
        ContextOptions {
            workgroup_size: self.workgroup_size,
            host_chunk: self.host_chunk,
            buffer_limit: None,
        }
    }
}

/// Select a device, negotiate precision and acquire a context.
///
/// The device request is used as-is: `require_fp64` in the request makes
/// selection skip devices without fp64, while an fp64 `precision` on its own
/// only expresses a preference and is downgraded where unsupported.
pub fn open_context(config: &IntegratorConfig, catalog: &dyn DeviceCatalog) -> Result<IntegrationContext> {
    let desc = device::select(catalog, &config.request)?;
    let precision = Precision::negotiate(config.precision, &desc);
    let mut ctx = IntegrationContext::acquire_with(&desc, precision, config.context_options())?;
    ctx.set_policy(config.policy);
    info!("integrating on {desc} with {precision} accumulation ({:?})", config.policy);
    Ok(ctx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceClass, SystemCatalog};
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn overlay_reads_every_key() {
        let cfg = IntegratorConfig::default()
            .overlay(env(&[
                (ENV_DEVICE, "cpu"),
                (ENV_EXTENSIONS, "Shader_F64, host_threads,"),
                (ENV_FP64, "no"),
                (ENV_SAFE, "0"),
                (ENV_WG, "64"),
            ]))
            .unwrap();
        assert_eq!(cfg.request.class, DeviceClass::Cpu);
        assert_eq!(cfg.request.extensions.len(), 2);
        assert!(cfg.request.extensions.contains("shader_f64"));
        assert_eq!(cfg.precision, Precision::Fp32);
        assert_eq!(cfg.policy, CachePolicy::TrustCaller);
        assert_eq!(cfg.workgroup_size, 64);
    }

    #[test]
    fn bad_values_are_invalid_configuration() {
        for pairs in [[(ENV_WG, "0")], [(ENV_FP64, "maybe")], [(ENV_DEVICE, "fpga")]] {
            let err = IntegratorConfig::default().overlay(env(&pairs)).unwrap_err();
            assert!(matches!(err, IntegrationError::InvalidConfiguration(_)), "{err}");
        }
    }

    #[test]
    fn open_context_on_host() {
        let mut cfg = IntegratorConfig::default();
        cfg.request = DeviceRequest::new(DeviceClass::Cpu);
        cfg.policy = CachePolicy::TrustCaller;
        let ctx = open_context(&cfg, &SystemCatalog::host_only()).unwrap();
        assert_eq!(ctx.precision(), Precision::Fp64);
        assert_eq!(ctx.policy(), CachePolicy::TrustCaller);
    }
}
