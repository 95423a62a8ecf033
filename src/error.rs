// error.rs — Error taxonomy for device selection, context setup and integration.
//
// Every failure mode the engine can hit maps to exactly one variant, so callers
// can match on the condition instead of parsing messages:
//
//   NotFound             selection found no device       → fall back / skip
//   DeviceInit           device would not open/compile   → relax request / fall back
//   ShapeMismatch        caller passed inconsistent data → fix the call
//   AccelerationFailure  device faulted mid-integration  → release + reacquire
//   InvalidConfiguration parameters make no sense        → fix the config
//
// None of these are retried or swallowed inside the crate.

use thiserror::Error;

use crate::device::DeviceRequest;

/// Errors returned by the integration engine.
#[derive(Debug, Error)]
pub enum IntegrationError {
    /// No device in the catalog satisfies the request.
    #[error("no compute device matches {request}")]
    NotFound { request: DeviceRequest },

    /// The device could not be opened, does not support the requested
    /// precision, or rejected program compilation.
    #[error("cannot initialise {device}: {reason}")]
    DeviceInit { device: String, reason: String },

    /// Two inputs that must agree in length do not.
    #[error("{what}: expected {expected} elements, got {actual}")]
    ShapeMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    /// The device failed while executing an integration.
    #[error("acceleration failure on {device}: {reason}")]
    AccelerationFailure { device: String, reason: String },

    /// A parameter is out of its meaningful range.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
}

impl IntegrationError {
    pub(crate) fn shape(what: &'static str, expected: usize, actual: usize) -> Self {
        IntegrationError::ShapeMismatch { what, expected, actual }
    }

    pub(crate) fn init(device: impl Into<String>, reason: impl Into<String>) -> Self {
        IntegrationError::DeviceInit {
            device: device.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn accel(device: impl Into<String>, reason: impl Into<String>) -> Self {
        IntegrationError::AccelerationFailure {
            device: device.into(),
            reason: reason.into(),
        }
    }

    /// True for conditions a caller is expected to handle quietly by
    /// falling back to the reference path.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            IntegrationError::NotFound { .. } | IntegrationError::DeviceInit { .. }
        )
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, IntegrationError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceClass, DeviceRequest};

    #[test]
    fn not_found_message_names_request() {
        let req = DeviceRequest::new(DeviceClass::Gpu).with_extension("shader_f64");
        let err = IntegrationError::NotFound { request: req };
        let msg = err.to_string();
        assert!(msg.contains("gpu"), "{msg}");
        assert!(msg.contains("shader_f64"), "{msg}");
        assert!(err.is_recoverable());
    }

    #[test]
    fn shape_mismatch_is_not_recoverable() {
        let err = IntegrationError::shape("image vs bin map", 4, 3);
        assert_eq!(err.to_string(), "image vs bin map: expected 4 elements, got 3");
        assert!(!err.is_recoverable());
    }
}
