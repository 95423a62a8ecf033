// host.rs — Reduction backend on the in-process rayon pool.
//
// The image is cut into fixed-size pixel chunks. Each chunk builds its own
// partial histogram (sum and count per bin) in parallel; the partials are
// collected in chunk order and merged sequentially. Chunk boundaries depend
// only on `chunk_size`, never on the number of threads, so the summation
// order and therefore the result is the same on every run and machine.
//
//   pixels  : |--- chunk 0 ---|--- chunk 1 ---|--- chunk 2 -|
//   partials:     h0              h1              h2          (parallel)
//   totals  : ((h0 + h1) + h2)                                (sequential)

use std::ops::AddAssign;
use std::sync::Arc;

use rayon::prelude::*;

use crate::corrections::PreparedCorrections;
use crate::engine::{BinTotals, Precision, ReductionBackend};
use crate::error::{IntegrationError, Result};
use crate::geometry::BinMap;

/// Pixels per chunk when none is configured.
pub const DEFAULT_CHUNK: usize = 1 << 16;

/// Accumulator scalar: `f32` or `f64`.
trait Accum: Copy + Default + Send + Sync + AddAssign + From<f32> + Into<f64> {}
impl Accum for f32 {}
impl Accum for f64 {}

pub(crate) struct HostReducer {
    precision: Precision,
    chunk_size: usize,
    map: Option<Arc<BinMap>>,
    corrections: PreparedCorrections,
    label: String,
}

impl HostReducer {
    pub fn new(label: impl Into<String>, precision: Precision, chunk_size: usize) -> Result<Self> {
        if chunk_size == 0 {
            return Err(IntegrationError::InvalidConfiguration(
                "host chunk size must be at least 1".into(),
            ));
        }
        Ok(HostReducer {
            precision,
            chunk_size,
            map: None,
            corrections: PreparedCorrections::identity(0),
            label: label.into(),
        })
    }

    fn reduce_as<A: Accum>(&self, map: &BinMap, image: &[f32]) -> BinTotals {
        let bins = map.bin_count();
        let corr = &self.corrections;
        let assign = map.as_slice();

        let partials: Vec<(Vec<A>, Vec<u64>)> = image
            .par_chunks(self.chunk_size)
            .enumerate()
            .map(|(ci, chunk)| {
                let base = ci * self.chunk_size;
                let mut sum = vec![A::default(); bins];
                let mut count = vec![0u64; bins];
                for (off, &raw) in chunk.iter().enumerate() {
                    let i = base + off;
                    let b = assign[i] as usize;
                    if b >= bins {
                        continue;
                    }
                    if let Some(v) = corr.apply(i, raw) {
                        sum[b] += A::from(v);
                        count[b] += 1;
                    }
                }
                (sum, count)
            })
            .collect();

        let mut sum = vec![A::default(); bins];
        let mut count = vec![0u64; bins];
        for (ps, pc) in partials {
            for b in 0..bins {
                sum[b] += ps[b];
                count[b] += pc[b];
            }
        }

        BinTotals {
            sum: sum.into_iter().map(Into::into).collect(),
            count,
        }
    }
}

impl ReductionBackend for HostReducer {
    fn load_geometry(&mut self, map: Arc<BinMap>) -> Result<()> {
        self.map = Some(map);
        Ok(())
    }

    fn load_corrections(&mut self, corrections: &PreparedCorrections) -> Result<()> {
        self.corrections = corrections.clone();
        Ok(())
    }

    fn reduce(&mut self, image: &[f32]) -> Result<BinTotals> {
        let map = self
            .map
            .as_ref()
            .ok_or_else(|| IntegrationError::accel(&self.label, "no geometry loaded"))?;
        if image.len() != map.len() {
            return Err(IntegrationError::shape("image vs bin map", map.len(), image.len()));
        }
        if !self.corrections.is_identity() && self.corrections.pixel_count != image.len() {
            return Err(IntegrationError::shape(
                "corrections vs image",
                image.len(),
                self.corrections.pixel_count,
            ));
        }
        Ok(match self.precision {
            Precision::Fp64 => self.reduce_as::<f64>(map, image),
            Precision::Fp32 => self.reduce_as::<f32>(map, image),
        })
    }

    fn describe(&self) -> String {
        format!("{} ({}, chunk {})", self.label, self.precision, self.chunk_size)
    }
}
