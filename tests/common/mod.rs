// tests/common/mod.rs — Shared fixtures: synthetic frames and a serial
// reference integrator.
#![allow(dead_code)]

use azimint::{
    BinMap, ContextOptions, DeviceCatalog, DeviceDescriptor, IntegrationContext, IntegrationResult, Platform,
    Precision, SystemCatalog, EMPTY_BIN_MEAN,
};
use azimint::{select, DeviceClass, DeviceRequest};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Straight-line f64 integration, one pixel after another.
pub fn reference_integrate(image: &[f32], map: &BinMap) -> IntegrationResult {
    let n = map.bin_count();
    let mut sum = vec![0.0f64; n];
    let mut count = vec![0u64; n];
    for (i, &v) in image.iter().enumerate() {
        if let Some(b) = map.get(i) {
            sum[b] += v as f64;
            count[b] += 1;
        }
    }
    let mean = sum
        .iter()
        .zip(&count)
        .map(|(&s, &c)| if c == 0 { EMPTY_BIN_MEAN } else { s / c as f64 })
        .collect();
    IntegrationResult { mean, count, sum, precision: Precision::Fp64 }
}

/// A `w × h` powder-like frame: concentric rings around the centre plus
/// uniform noise, binned by radius into `bins` bins.
pub fn ring_frame(w: usize, h: usize, bins: usize, seed: u64) -> (Vec<f32>, BinMap) {
    let mut rng = StdRng::seed_from_u64(seed);
    let (cx, cy) = (w as f32 / 2.0, h as f32 / 2.0);
    let mut image = Vec::with_capacity(w * h);
    let mut radius = Vec::with_capacity(w * h);
    for y in 0..h {
        for x in 0..w {
            let r = ((x as f32 - cx).powi(2) + (y as f32 - cy).powi(2)).sqrt();
            let ring = 100.0 + 400.0 * (-(((r % 25.0) - 12.5).powi(2)) / 4.0).exp();
            image.push(ring + rng.gen_range(0.0..10.0));
            radius.push(r);
        }
    }
    let r_max = cx.min(cy);
    let map = BinMap::from_positions(&radius, (0.0, r_max), bins).unwrap();
    (image, map)
}

/// Integer-valued random frame with a random bin map (some sentinels).
pub fn integer_frame(pixels: usize, bins: usize, seed: u64) -> (Vec<f32>, BinMap) {
    let mut rng = StdRng::seed_from_u64(seed);
    let image = (0..pixels).map(|_| rng.gen_range(0..1000) as f32).collect();
    let assign = (0..pixels)
        .map(|_| {
            if rng.gen_bool(0.05) {
                BinMap::SENTINEL
            } else {
                rng.gen_range(0..bins as u32)
            }
        })
        .collect();
    (image, BinMap::new(assign, bins).unwrap())
}

pub fn host_context(precision: Precision) -> IntegrationContext {
    let catalog = SystemCatalog::host_only();
    let desc = select(&catalog, &DeviceRequest::new(DeviceClass::Cpu)).unwrap();
    IntegrationContext::acquire(&desc, precision).unwrap()
}

/// Context on the first wgpu adapter of any kind (software rasterisers such
/// as llvmpipe report as Cpu), for `#[ignore]`d tests.
pub fn wgpu_context(precision: Precision, options: ContextOptions) -> IntegrationContext {
    let desc = wgpu_descriptor(precision);
    IntegrationContext::acquire_with(&desc, precision, options).expect("acquire wgpu context")
}

pub fn wgpu_descriptor(precision: Precision) -> DeviceDescriptor {
    SystemCatalog::enumerate()
        .devices()
        .into_iter()
        .find(|d| d.platform != Platform::Host && (!precision.is_fp64() || d.supports_fp64))
        .expect("no wgpu adapter")
}
