// context.rs — Integration context: one device, one precision, cached state.
//
// A context owns everything that is expensive to rebuild between calls:
//
//   backend      the opened device with compiled kernels (or the host pool)
//   geometry     the bin map currently resident on the backend
//   corrections  the user's correction arrays, and which revision of them
//                is resident on the backend
//
// LIFECYCLE
// ─────────
//   acquire ──► live ──► release ──► released ──► integrate ──► live
//                 │                                 (lazy reopen)
//                 └──► reset (keep device, drop resident geometry/corrections)
//
// `release` is idempotent. A released context remembers its descriptor,
// precision, policy and correction settings, so the next integration simply
// reopens the same device.
//
// CACHE POLICY
// ────────────
// ValidateBeforeUse compares the call's bin map with the resident one element
// by element and re-uploads on any difference. TrustCaller skips the
// comparison: a changed bin map with the same pixel count is silently
// ignored. The pixel count is still checked, so a stale table can give wrong
// numbers but never index out of range.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::corrections::{Corrections, Dummy};
use crate::device::{DeviceDescriptor, Platform};
use crate::engine::{IntegrationResult, Precision, ReductionBackend};
use crate::error::{IntegrationError, Result};
use crate::geometry::BinMap;
use crate::gpu::device::GpuDevice;
use crate::gpu::reduce::GpuReducer;
use crate::host::{HostReducer, DEFAULT_CHUNK};

/// Whether a context re-validates its cached bin map before each call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CachePolicy {
    /// Compare against the cached bin map; rebuild on any difference.
    #[default]
    ValidateBeforeUse,
    /// Reuse the cached bin map without comparing.
    TrustCaller,
}

impl CachePolicy {
    /// `true` → ValidateBeforeUse, `false` → TrustCaller.
    pub fn from_safe(safe: bool) -> Self {
        if safe {
            CachePolicy::ValidateBeforeUse
        } else {
            CachePolicy::TrustCaller
        }
    }
}

/// Backend tuning fixed at acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextOptions {
    /// Invocations per workgroup for GPU kernels.
    pub workgroup_size: u32,
    /// Pixels per partial histogram on the host pool.
    pub host_chunk: usize,
    /// Cap on any single device buffer, in bytes. Tightens the device's
    /// `max_storage_buffer_binding_size`; never raises it. wgpu only.
    pub buffer_limit: Option<u32>,
}

impl Default for ContextOptions {
    fn default() -> Self {
        ContextOptions {
            workgroup_size: 128,
            host_chunk: DEFAULT_CHUNK,
            buffer_limit: None,
        }
    }
}

/// Counters accumulated across integrations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecStats {
    pub integrations: u64,
    /// Time spent uploading geometry and corrections.
    pub upload: Duration,
    /// Time spent in reduction, including image upload and readback.
    pub execute: Duration,
}

impl fmt::Display for ExecStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} integration(s), upload {:.3} ms, execute {:.3} ms",
            self.integrations,
            self.upload.as_secs_f64() * 1e3,
            self.execute.as_secs_f64() * 1e3
        )
    }
}

fn open_backend(
    desc: &DeviceDescriptor,
    precision: Precision,
    options: &ContextOptions,
) -> Result<Box<dyn ReductionBackend>> {
    if precision.is_fp64() && !desc.supports_fp64 {
        return Err(IntegrationError::init(desc.to_string(), "fp64 requested but not supported"));
    }
    if desc.platform == Platform::Host {
        return Ok(Box::new(HostReducer::new(
            desc.to_string(),
            precision,
            options.host_chunk,
        )?));
    }
    let mut gpu = GpuDevice::open(desc, precision, options.workgroup_size)?;
    if let Some(cap) = options.buffer_limit {
        let limits = &mut gpu.limits;
        limits.max_storage_buffer_binding_size = limits.max_storage_buffer_binding_size.min(cap);
    }
    Ok(Box::new(GpuReducer::new(gpu, precision)?))
}

/// An initialized binding to one compute device.
pub struct IntegrationContext {
    descriptor: DeviceDescriptor,
    precision: Precision,
    options: ContextOptions,
    policy: CachePolicy,
    corrections: Corrections,
    backend: Option<Box<dyn ReductionBackend>>,
    geometry: Option<Arc<BinMap>>,
    resident_corrections: Option<u64>,
    stats: ExecStats,
}

macro_rules! context_correction {
    ($set:ident, $unset:ident, $what:literal, $ty:ty) => {
        #[doc = concat!("Configure the ", $what, " array (one value per pixel).")]
        pub fn $set(&mut self, values: Vec<$ty>) -> Result<()> {
            self.check_correction_len($what, values.len())?;
            self.corrections.$set(values);
            Ok(())
        }

        pub fn $unset(&mut self) -> bool {
            self.corrections.$unset()
        }
    };
}

impl IntegrationContext {
    /// Open `device` for `precision` with default options.
    ///
    /// # Errors
    /// `DeviceInit` when the device cannot be opened, lacks fp64 for
    /// `Precision::Fp64`, or rejects kernel compilation.
    pub fn acquire(device: &DeviceDescriptor, precision: Precision) -> Result<Self> {
        Self::acquire_with(device, precision, ContextOptions::default())
    }

    pub fn acquire_with(
        device: &DeviceDescriptor,
        precision: Precision,
        options: ContextOptions,
    ) -> Result<Self> {
        if options.workgroup_size == 0 {
            return Err(IntegrationError::InvalidConfiguration(
                "workgroup size must be at least 1".into(),
            ));
        }
        let backend = open_backend(device, precision, &options)?;
        info!("acquired {}", backend.describe());
        Ok(IntegrationContext {
            descriptor: device.clone(),
            precision,
            options,
            policy: CachePolicy::default(),
            corrections: Corrections::default(),
            backend: Some(backend),
            geometry: None,
            resident_corrections: None,
            stats: ExecStats::default(),
        })
    }

    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    pub fn precision(&self) -> Precision {
        self.precision
    }

    pub fn options(&self) -> ContextOptions {
        self.options
    }

    pub fn policy(&self) -> CachePolicy {
        self.policy
    }

    pub fn set_policy(&mut self, policy: CachePolicy) {
        self.policy = policy;
    }

    /// True while device resources are held.
    pub fn is_live(&self) -> bool {
        self.backend.is_some()
    }

    /// The bin map resident on the device, if any.
    pub fn cached_geometry(&self) -> Option<&BinMap> {
        self.geometry.as_deref()
    }

    /// Free all device-side resources. Safe to call repeatedly.
    pub fn release(&mut self) {
        if self.backend.take().is_some() {
            debug!("released {}", self.descriptor);
        }
        self.geometry = None;
        self.resident_corrections = None;
    }

    /// Keep the device open but forget resident geometry and corrections.
    /// The next integration uploads both again.
    pub fn reset(&mut self) {
        self.geometry = None;
        self.resident_corrections = None;
    }

    pub fn stats(&self) -> ExecStats {
        self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats = ExecStats::default();
    }

    // --- corrections ---

    pub fn corrections(&self) -> &Corrections {
        &self.corrections
    }

    context_correction!(set_mask, unset_mask, "mask", bool);
    context_correction!(set_dark, unset_dark, "dark", f32);
    context_correction!(set_flat, unset_flat, "flat", f32);
    context_correction!(set_solid_angle, unset_solid_angle, "solid angle", f32);
    context_correction!(set_polarization, unset_polarization, "polarization", f32);

    /// Exclude pixels whose raw value is within `delta` of `value`.
    pub fn set_dummy(&mut self, value: f32, delta: f32) {
        self.corrections.set_dummy(Dummy::new(value, delta));
    }

    pub fn unset_dummy(&mut self) -> bool {
        self.corrections.unset_dummy()
    }

    fn check_correction_len(&self, what: &'static str, len: usize) -> Result<()> {
        match &self.geometry {
            Some(g) if g.len() != len => Err(IntegrationError::shape(what, g.len(), len)),
            _ => Ok(()),
        }
    }

    // --- integration ---

    /// Integrate with the context's cache policy.
    pub fn integrate(&mut self, image: &[f32], bin_map: &BinMap) -> Result<IntegrationResult> {
        self.integrate_with(image, bin_map, self.policy)
    }

    /// Integrate with an explicit cache policy for this call only.
    pub fn integrate_with(
        &mut self,
        image: &[f32],
        bin_map: &BinMap,
        policy: CachePolicy,
    ) -> Result<IntegrationResult> {
        if image.len() != bin_map.len() {
            return Err(IntegrationError::shape("image vs bin map", bin_map.len(), image.len()));
        }

        let result = self.run(image, bin_map, policy);
        if let Err(e @ IntegrationError::AccelerationFailure { .. }) = &result {
            warn!("{e}; releasing context");
            self.release();
        }
        result
    }

    fn run(&mut self, image: &[f32], bin_map: &BinMap, policy: CachePolicy) -> Result<IntegrationResult> {
        if self.backend.is_none() {
            info!("reopening {} ({})", self.descriptor, self.precision);
            self.backend = Some(open_backend(&self.descriptor, self.precision, &self.options)?);
        }
        let backend = match self.backend.as_mut() {
            Some(b) => b,
            None => return Err(IntegrationError::init(self.descriptor.to_string(), "no backend")),
        };

        let t0 = Instant::now();
        let upload = match (&self.geometry, policy) {
            (None, _) => true,
            (Some(g), CachePolicy::ValidateBeforeUse) => !g.same_geometry(bin_map),
            (Some(g), CachePolicy::TrustCaller) => {
                if g.len() != image.len() {
                    return Err(IntegrationError::shape(
                        "image vs cached bin map",
                        g.len(),
                        image.len(),
                    ));
                }
                false
            }
        };
        if upload {
            let map = Arc::new(bin_map.clone());
            backend.load_geometry(Arc::clone(&map))?;
            self.geometry = Some(map);
            self.resident_corrections = None;
        }

        let revision = self.corrections.revision();
        if self.resident_corrections != Some(revision) {
            let prepared = self.corrections.prepare(image.len())?;
            backend.load_corrections(&prepared)?;
            self.resident_corrections = Some(revision);
        }
        let t1 = Instant::now();

        let totals = backend.reduce(image)?;
        let t2 = Instant::now();

        self.stats.integrations += 1;
        self.stats.upload += t1 - t0;
        self.stats.execute += t2 - t1;

        Ok(IntegrationResult::from_totals(totals, self.precision))
    }
}

impl fmt::Debug for IntegrationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IntegrationContext")
            .field("descriptor", &self.descriptor.to_string())
            .field("precision", &self.precision)
            .field("policy", &self.policy)
            .field("live", &self.is_live())
            .field("cached_pixels", &self.geometry.as_ref().map(|g| g.len()))
            .field("stats", &self.stats)
            .finish()
    }
}
