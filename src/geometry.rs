// geometry.rs — Pixel → bin assignment and its compiled lookup table.
//
// The calibration collaborator hands us one bin index per pixel. We never
// interpret the geometry ourselves; all we need is:
//
//   BinMap  — the per-pixel bin index (or SENTINEL for "no bin") plus the
//             declared bin count. Owned by the caller, cached by a context.
//
//   BinLut  — the same information inverted into a CSR table: for every bin,
//             the list of pixels that land in it, in ascending pixel order.
//             This is what the device walks during reduction.
//
// CSR LAYOUT
// ──────────
//   bin_map  = [1, 0, S, 1, 0]          (S = sentinel)
//   offsets  = [0, 2, 4]                (bin b owns pixels[offsets[b]..offsets[b+1]])
//   pixels   = [1, 4, 0, 3]
//
// Built with a counting sort: one pass to histogram, one prefix sum, one pass
// to scatter. Stable, so each bin's pixel list stays in ascending order and
// the per-bin summation order is fixed for a given bin map.

use log::warn;

use crate::error::{IntegrationError, Result};

/// Per-pixel bin assignment supplied by the geometry provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinMap {
    bins: Vec<u32>,
    bin_count: usize,
}

impl BinMap {
    /// Marks a pixel that belongs to no bin. Excluded from accumulation.
    pub const SENTINEL: u32 = u32::MAX;

    /// Wrap a per-pixel bin index vector.
    ///
    /// Indices are trusted: anything other than [`BinMap::SENTINEL`] is
    /// expected to be below `bin_count`.
    pub fn new(bins: Vec<u32>, bin_count: usize) -> Result<Self> {
        if bin_count == 0 {
            return Err(IntegrationError::InvalidConfiguration(
                "bin count must be at least 1".into(),
            ));
        }
        // Pixel and bin indices travel to the device as u32.
        if bin_count >= Self::SENTINEL as usize || bins.len() > u32::MAX as usize {
            return Err(IntegrationError::InvalidConfiguration(format!(
                "geometry too large for 32-bit indexing ({} pixels, {} bins)",
                bins.len(),
                bin_count
            )));
        }
        Ok(BinMap { bins, bin_count })
    }

    /// Assign bins from per-pixel radial positions (e.g. 2θ in degrees).
    ///
    /// The range `[lo, hi]` is split into `bin_count` equal bins. A position
    /// exactly at `hi` falls in the last bin. Positions outside the range or
    /// non-finite get [`BinMap::SENTINEL`].
    pub fn from_positions(positions: &[f32], range: (f32, f32), bin_count: usize) -> Result<Self> {
        let (lo, hi) = range;
        if !(lo.is_finite() && hi.is_finite() && hi > lo) {
            return Err(IntegrationError::InvalidConfiguration(format!(
                "radial range [{lo}, {hi}] is empty or not finite"
            )));
        }
        if bin_count == 0 {
            return Err(IntegrationError::InvalidConfiguration(
                "bin count must be at least 1".into(),
            ));
        }

        let lo = lo as f64;
        let hi = hi as f64;
        let scale = bin_count as f64 / (hi - lo);
        let last = (bin_count - 1) as u32;
        let bins = positions
            .iter()
            .map(|&p| {
                let p = p as f64;
                if !p.is_finite() || p < lo || p > hi {
                    Self::SENTINEL
                } else {
                    (((p - lo) * scale) as u32).min(last)
                }
            })
            .collect();
        Self::new(bins, bin_count)
    }

    /// Number of pixels covered.
    pub fn len(&self) -> usize {
        self.bins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bins.is_empty()
    }

    /// Declared number of output bins.
    pub fn bin_count(&self) -> usize {
        self.bin_count
    }

    pub fn as_slice(&self) -> &[u32] {
        &self.bins
    }

    /// Bin of pixel `i`, or `None` for sentinel pixels and `i >= len()`.
    pub fn get(&self, i: usize) -> Option<usize> {
        match self.bins.get(i) {
            None | Some(&Self::SENTINEL) => None,
            Some(&b) => Some(b as usize),
        }
    }

    /// Exact equality of both the bin count and every pixel assignment.
    pub fn same_geometry(&self, other: &BinMap) -> bool {
        self.bin_count == other.bin_count && self.bins == other.bins
    }
}

// ---------------------------------------------------------------------------
// BinLut
// ---------------------------------------------------------------------------

/// Bin-major lookup table compiled from a [`BinMap`].
#[derive(Debug, Clone)]
pub(crate) struct BinLut {
    /// Length `bin_count + 1`. Bin `b` owns `pixels[offsets[b]..offsets[b + 1]]`.
    pub offsets: Vec<u32>,
    /// Pixel indices grouped by bin, ascending within each bin.
    pub pixels: Vec<u32>,
    pub bin_count: usize,
    pub pixel_count: usize,
}

impl BinLut {
    pub fn build(map: &BinMap) -> Self {
        let bin_count = map.bin_count();
        let mut counts = vec![0u32; bin_count];
        let mut ignored = 0usize;

        for &b in map.as_slice() {
            match b {
                BinMap::SENTINEL => {}
                b if (b as usize) < bin_count => counts[b as usize] += 1,
                _ => ignored += 1,
            }
        }
        if ignored > 0 {
            warn!("bin map has {ignored} pixel(s) outside [0, {bin_count}); they are skipped");
        }

        let mut offsets = Vec::with_capacity(bin_count + 1);
        let mut running = 0u32;
        offsets.push(0);
        for &c in &counts {
            running += c;
            offsets.push(running);
        }

        let mut cursor: Vec<u32> = offsets[..bin_count].to_vec();
        let mut pixels = vec![0u32; running as usize];
        for (pixel, &b) in map.as_slice().iter().enumerate() {
            if (b as usize) < bin_count {
                let slot = &mut cursor[b as usize];
                pixels[*slot as usize] = pixel as u32;
                *slot += 1;
            }
        }

        BinLut {
            offsets,
            pixels,
            bin_count,
            pixel_count: map.len(),
        }
    }

    /// Pixel indices assigned to bin `b`.
    #[cfg(test)]
    pub fn bin(&self, b: usize) -> &[u32] {
        &self.pixels[self.offsets[b] as usize..self.offsets[b + 1] as usize]
    }

    /// Number of pixels that land in some bin.
    pub fn assigned(&self) -> usize {
        self.pixels.len()
    }
}
