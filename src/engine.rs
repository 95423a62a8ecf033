// engine.rs — The binned reduction abstraction and its result type.
//
// Integration is a keyed reduction: every pixel contributes its corrected
// intensity and a count of one to the bin the geometry assigns it. The
// reduction itself is delegated to a backend:
//
//   HostReducer (host.rs)      rayon, fixed-size chunks, ordered merge
//   GpuReducer  (gpu/reduce.rs) wgpu, one invocation per bin over the LUT
//
// Backends return raw per-bin totals. Turning totals into means (and the
// value reported for empty bins) happens once, here, so both paths agree.
//
// Precision
// ─────────
// Fp64 accumulates in double precision end to end. Fp32 accumulates in
// single precision on the device; totals are widened to f64 only after the
// reduction. Corrected pixel values are f32 in both modes.

use std::fmt;
use std::sync::Arc;

use log::warn;

use crate::context::IntegrationContext;
use crate::corrections::PreparedCorrections;
use crate::device::DeviceDescriptor;
use crate::error::Result;
use crate::geometry::BinMap;
use crate::image::{Image, Pixel};

/// Mean reported for a bin that received no pixels.
pub const EMPTY_BIN_MEAN: f64 = 0.0;

/// Accumulation precision of a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Precision {
    Fp32,
    #[default]
    Fp64,
}

impl Precision {
    /// The best precision `device` can honour, given the caller's preference.
    ///
    /// Fp64 on a device without double support falls back to Fp32 with a
    /// warning. Fp32 is always honoured as requested.
    pub fn negotiate(requested: Precision, device: &DeviceDescriptor) -> Precision {
        match requested {
            Precision::Fp64 if !device.supports_fp64 => {
                warn!("{} has no fp64 support; falling back to fp32 accumulation", device.name);
                Precision::Fp32
            }
            p => p,
        }
    }

    pub fn is_fp64(self) -> bool {
        self == Precision::Fp64
    }

    /// WGSL scalar type used for accumulation.
    pub(crate) fn wgsl_type(self) -> &'static str {
        match self {
            Precision::Fp32 => "f32",
            Precision::Fp64 => "f64",
        }
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Precision::Fp32 => write!(f, "fp32"),
            Precision::Fp64 => write!(f, "fp64"),
        }
    }
}

// ---------------------------------------------------------------------------
// Backend contract
// ---------------------------------------------------------------------------

/// Per-bin totals produced by a backend.
#[derive(Debug, Clone, PartialEq)]
pub struct BinTotals {
    pub sum: Vec<f64>,
    pub count: Vec<u64>,
}

/// A device that can reduce an image into per-bin totals.
///
/// Geometry and corrections are loaded separately from the image so a
/// context can keep them resident across calls.
pub(crate) trait ReductionBackend: Send {
    /// Replace the resident geometry.
    fn load_geometry(&mut self, map: Arc<BinMap>) -> Result<()>;

    /// Replace the resident corrections. Called after `load_geometry`.
    fn load_corrections(&mut self, corrections: &PreparedCorrections) -> Result<()>;

    /// Reduce one image against the resident geometry and corrections.
    /// `image.len()` has already been checked against the geometry.
    fn reduce(&mut self, image: &[f32]) -> Result<BinTotals>;

    fn describe(&self) -> String;
}

// ---------------------------------------------------------------------------
// IntegrationResult
// ---------------------------------------------------------------------------

/// A 1D radial profile.
#[derive(Debug, Clone, PartialEq)]
pub struct IntegrationResult {
    /// `sum / count`, or [`EMPTY_BIN_MEAN`] where `count == 0`.
    pub mean: Vec<f64>,
    pub count: Vec<u64>,
    pub sum: Vec<f64>,
    pub precision: Precision,
}

impl IntegrationResult {
    pub fn from_totals(totals: BinTotals, precision: Precision) -> Self {
        let mean = totals
            .sum
            .iter()
            .zip(&totals.count)
            .map(|(&s, &c)| if c == 0 { EMPTY_BIN_MEAN } else { s / c as f64 })
            .collect();
        IntegrationResult {
            mean,
            count: totals.count,
            sum: totals.sum,
            precision,
        }
    }

    pub fn bin_count(&self) -> usize {
        self.mean.len()
    }

    /// Number of pixels that contributed to any bin.
    pub fn total_count(&self) -> u64 {
        self.count.iter().sum()
    }
}

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

/// Integrate a flat intensity buffer with the context's cache policy.
pub fn integrate(
    ctx: &mut IntegrationContext,
    image: &[f32],
    bin_map: &BinMap,
) -> Result<IntegrationResult> {
    ctx.integrate(image, bin_map)
}

/// Integrate a 2D image of any pixel type. Row padding is dropped.
pub fn integrate_image<T: Pixel>(
    ctx: &mut IntegrationContext,
    image: &Image<T>,
    bin_map: &BinMap,
) -> Result<IntegrationResult> {
    ctx.integrate(&image.to_f32_vec(), bin_map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceDescriptor;

    #[test]
    fn means_from_totals() {
        let r = IntegrationResult::from_totals(
            BinTotals {
                sum: vec![30.0, 0.0, 70.0],
                count: vec![2, 0, 2],
            },
            Precision::Fp64,
        );
        assert_eq!(r.mean, vec![15.0, EMPTY_BIN_MEAN, 35.0]);
        assert_eq!(r.bin_count(), 3);
        assert_eq!(r.total_count(), 4);
    }

    #[test]
    fn negotiate_downgrades_without_fp64() {
        let mut d = DeviceDescriptor::host(0);
        assert_eq!(Precision::negotiate(Precision::Fp64, &d), Precision::Fp64);
        d.supports_fp64 = false;
        assert_eq!(Precision::negotiate(Precision::Fp64, &d), Precision::Fp32);
        assert_eq!(Precision::negotiate(Precision::Fp32, &d), Precision::Fp32);
    }
}
