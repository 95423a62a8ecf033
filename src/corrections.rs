// corrections.rs — Per-pixel intensity corrections applied before binning.
//
// A raw detector value goes through, in order:
//
//   1. mask          pixel flagged → excluded
//   2. dummy         |raw - dummy| <= delta (== when delta is 0) → excluded
//   3. dark          raw - dark[i]
//   4. normalization (raw - dark[i]) / (flat[i] * solid_angle[i] * polarization[i])
//
// A zero normalization factor excludes the pixel instead of producing inf.
//
// `Corrections` is the mutable, user-facing configuration held by a context.
// It carries a revision counter that bumps on every set/unset so the context
// knows when a device-side copy is stale. `prepare` folds it into the flat
// arrays the backends consume (`PreparedCorrections`): the three divisors
// multiply into one `norm` vector, the mask becomes a u32 flag vector.

use crate::error::{IntegrationError, Result};

/// Sentinel intensity marking a pixel as "no data".
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Dummy {
    pub value: f32,
    /// Tolerance. `0.0` means exact equality.
    pub delta: f32,
}

impl Dummy {
    pub fn new(value: f32, delta: f32) -> Self {
        Dummy { value, delta: delta.abs() }
    }

    #[inline]
    pub fn matches(&self, v: f32) -> bool {
        if self.delta == 0.0 {
            v == self.value
        } else {
            (v - self.value).abs() <= self.delta
        }
    }
}

/// Correction arrays configured on a context. All arrays are per pixel.
#[derive(Debug, Clone, Default)]
pub struct Corrections {
    mask: Option<Vec<bool>>,
    dark: Option<Vec<f32>>,
    flat: Option<Vec<f32>>,
    solid_angle: Option<Vec<f32>>,
    polarization: Option<Vec<f32>>,
    dummy: Option<Dummy>,
    revision: u64,
}

macro_rules! array_correction {
    ($set:ident, $unset:ident, $field:ident, $ty:ty) => {
        pub fn $set(&mut self, values: Vec<$ty>) {
            self.$field = Some(values);
            self.revision += 1;
        }

        /// Returns whether the correction was active.
        pub fn $unset(&mut self) -> bool {
            let was = self.$field.take().is_some();
            if was {
                self.revision += 1;
            }
            was
        }
    };
}

impl Corrections {
    array_correction!(set_mask, unset_mask, mask, bool);
    array_correction!(set_dark, unset_dark, dark, f32);
    array_correction!(set_flat, unset_flat, flat, f32);
    array_correction!(set_solid_angle, unset_solid_angle, solid_angle, f32);
    array_correction!(set_polarization, unset_polarization, polarization, f32);

    pub fn set_dummy(&mut self, dummy: Dummy) {
        self.dummy = Some(dummy);
        self.revision += 1;
    }

    pub fn unset_dummy(&mut self) -> bool {
        let was = self.dummy.take().is_some();
        if was {
            self.revision += 1;
        }
        was
    }

    pub fn dummy(&self) -> Option<Dummy> {
        self.dummy
    }

    /// Monotonic counter bumped by every change.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// True when no correction is configured.
    pub fn is_identity(&self) -> bool {
        self.mask.is_none()
            && self.dark.is_none()
            && self.flat.is_none()
            && self.solid_angle.is_none()
            && self.polarization.is_none()
            && self.dummy.is_none()
    }

    /// Length of every configured array, paired with its name.
    fn lengths(&self) -> impl Iterator<Item = (&'static str, usize)> + '_ {
        [
            ("mask", self.mask.as_ref().map(Vec::len)),
            ("dark", self.dark.as_ref().map(Vec::len)),
            ("flat", self.flat.as_ref().map(Vec::len)),
            ("solid angle", self.solid_angle.as_ref().map(Vec::len)),
            ("polarization", self.polarization.as_ref().map(Vec::len)),
        ]
        .into_iter()
        .filter_map(|(name, len)| len.map(|l| (name, l)))
    }

    /// Check every configured array against `pixel_count`.
    pub fn check_len(&self, pixel_count: usize) -> Result<()> {
        for (what, len) in self.lengths() {
            if len != pixel_count {
                return Err(IntegrationError::shape(what, pixel_count, len));
            }
        }
        Ok(())
    }

    /// Fold into backend-ready arrays for `pixel_count` pixels.
    pub fn prepare(&self, pixel_count: usize) -> Result<PreparedCorrections> {
        self.check_len(pixel_count)?;

        let divisors: Vec<&Vec<f32>> = [&self.flat, &self.solid_angle, &self.polarization]
            .into_iter()
            .flatten()
            .collect();
        let norm = if divisors.is_empty() {
            None
        } else {
            Some(
                (0..pixel_count)
                    .map(|i| divisors.iter().map(|d| d[i]).product::<f32>())
                    .collect(),
            )
        };

        let excluded = self
            .mask
            .as_ref()
            .map(|m| m.iter().map(|&b| b as u32).collect());

        Ok(PreparedCorrections {
            pixel_count,
            dark: self.dark.clone(),
            norm,
            excluded,
            dummy: self.dummy,
            revision: self.revision,
        })
    }
}

/// Corrections resolved for a fixed pixel count.
#[derive(Debug, Clone)]
pub struct PreparedCorrections {
    pub pixel_count: usize,
    pub dark: Option<Vec<f32>>,
    /// Product of flat, solid angle and polarization.
    pub norm: Option<Vec<f32>>,
    /// 1 where the pixel is masked out.
    pub excluded: Option<Vec<u32>>,
    pub dummy: Option<Dummy>,
    pub revision: u64,
}

impl PreparedCorrections {
    /// No-op corrections for `pixel_count` pixels.
    pub fn identity(pixel_count: usize) -> Self {
        PreparedCorrections {
            pixel_count,
            dark: None,
            norm: None,
            excluded: None,
            dummy: None,
            revision: 0,
        }
    }

    pub fn is_identity(&self) -> bool {
        self.dark.is_none() && self.norm.is_none() && self.excluded.is_none() && self.dummy.is_none()
    }

    /// Corrected value of pixel `i`, or `None` if it must not be accumulated.
    #[inline]
    pub fn apply(&self, i: usize, raw: f32) -> Option<f32> {
        if let Some(ex) = &self.excluded {
            if ex[i] != 0 {
                return None;
            }
        }
        if let Some(d) = &self.dummy {
            if d.matches(raw) {
                return None;
            }
        }
        let mut v = raw;
        if let Some(dark) = &self.dark {
            v -= dark[i];
        }
        if let Some(norm) = &self.norm {
            let n = norm[i];
            if n == 0.0 {
                return None;
            }
            v /= n;
        }
        Some(v)
    }
}
