// validate.rs — Rwp consistency check between two radial profiles.
//
// The weighted residual of a candidate profile c against a reference r, in
// percent, over the n bins whose mean value m = (r + c) / 2 is not ~zero:
//
//   Rwp = 100 * sqrt( Σ ((r - c) / m)² / n )
//
// Bins where both profiles are (close to) zero carry no information and are
// skipped. The verdict passes when Rwp is strictly below the threshold.

use std::fmt;

use crate::engine::IntegrationResult;
use crate::error::{IntegrationError, Result};

/// Rwp threshold, in percent, used by the acceptance check.
pub const DEFAULT_THRESHOLD: f64 = 6.0;

/// Bins with |mean| at or below this are not compared.
const MIN_MEAN: f64 = 1e-10;

/// Outcome of [`compare`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Verdict {
    /// Weighted residual, in percent.
    pub rwp: f64,
    pub threshold: f64,
    pub passed: bool,
    /// Bins that entered the sum.
    pub compared_bins: usize,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Rwp = {:.4}% over {} bin(s) (threshold {}%): {}",
            self.rwp,
            self.compared_bins,
            self.threshold,
            if self.passed { "PASS" } else { "FAIL" }
        )
    }
}

/// Rwp of `candidate` against `reference` over their per-bin means.
pub fn rwp(reference: &[f64], candidate: &[f64]) -> Result<(f64, usize)> {
    if reference.len() != candidate.len() {
        return Err(IntegrationError::shape("profile bins", reference.len(), candidate.len()));
    }
    let mut acc = 0.0;
    let mut n = 0usize;
    for (&r, &c) in reference.iter().zip(candidate) {
        let mean = 0.5 * (r + c);
        if mean.abs() > MIN_MEAN {
            let rel = (r - c) / mean;
            acc += rel * rel;
            n += 1;
        }
    }
    if n == 0 {
        return Ok((0.0, 0));
    }
    Ok((100.0 * (acc / n as f64).sqrt(), n))
}

/// Compare two integration results bin by bin.
///
/// # Errors
/// `ShapeMismatch` if the profiles have different bin counts.
pub fn compare(
    reference: &IntegrationResult,
    candidate: &IntegrationResult,
    threshold: f64,
) -> Result<Verdict> {
    let (rwp, compared_bins) = rwp(&reference.mean, &candidate.mean)?;
    Ok(Verdict {
        rwp,
        threshold,
        passed: rwp < threshold,
        compared_bins,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn identical_profiles_give_zero() {
        let (v, n) = rwp(&[1.0, 2.0, 3.0], &[1.0, 2.0, 3.0]).unwrap();
        assert_eq!(v, 0.0);
        assert_eq!(n, 3);
    }

    #[test]
    fn known_value() {
        // One bin, r = 11, c = 9: mean 10, rel 0.2 → 20%.
        let (v, _) = rwp(&[11.0], &[9.0]).unwrap();
        assert_relative_eq!(v, 20.0, epsilon = 1e-12);
    }

    #[test]
    fn zero_bins_skipped() {
        let (v, n) = rwp(&[0.0, 11.0], &[0.0, 9.0]).unwrap();
        assert_eq!(n, 1);
        assert_relative_eq!(v, 20.0, epsilon = 1e-12);

        assert_eq!(rwp(&[0.0, 0.0], &[0.0, 0.0]).unwrap(), (0.0, 0));
    }

    #[test]
    fn length_mismatch() {
        assert!(matches!(
            rwp(&[1.0], &[1.0, 2.0]),
            Err(IntegrationError::ShapeMismatch { .. })
        ));
    }
}
