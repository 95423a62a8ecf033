// tests/test_accelerator.rs — wgpu backend on whatever adapter is present.
//
// These open a real wgpu adapter (hardware or a software rasteriser such as
// llvmpipe/lavapipe) and are #[ignore]d so `cargo test` passes without one:
//   cargo test -- --include-ignored

mod common;

use approx::assert_relative_eq;
use azimint::{integrate, BinMap, ContextOptions, IntegrationContext, IntegrationError, Precision};
use common::{host_context, reference_integrate, ring_frame, wgpu_context, wgpu_descriptor};

// ===== Device limits =====

#[test]
#[ignore = "requires a wgpu adapter"]
fn oversized_geometry_fails_then_context_reopens() {
    let opts = ContextOptions { buffer_limit: Some(1024), ..Default::default() };
    let mut ctx = wgpu_context(Precision::Fp32, opts);

    // 1000 assigned pixels → 4000-byte pixel list, over the 1 KiB cap.
    let big = BinMap::new(vec![0; 1000], 1).unwrap();
    let err = integrate(&mut ctx, &vec![1.0; 1000], &big).unwrap_err();
    assert!(matches!(err, IntegrationError::AccelerationFailure { .. }), "{err}");
    assert!(!ctx.is_live());
    assert!(ctx.cached_geometry().is_none());

    let small = BinMap::new(vec![0, 1], 2).unwrap();
    let r = integrate(&mut ctx, &[1.0, 2.0], &small).unwrap();
    assert_eq!(r.mean, vec![1.0, 2.0]);
    assert!(ctx.is_live());
}

#[test]
#[ignore = "requires a wgpu adapter"]
fn resource_failure_during_acquire_is_device_init() {
    // Even the 4-byte correction placeholders exceed a 2-byte cap.
    let opts = ContextOptions { buffer_limit: Some(2), ..Default::default() };
    let err = IntegrationContext::acquire_with(&wgpu_descriptor(Precision::Fp32), Precision::Fp32, opts)
        .unwrap_err();
    assert!(matches!(err, IntegrationError::DeviceInit { .. }), "{err}");
    assert!(err.is_recoverable());
}

// ===== Dispatch shape =====

#[test]
#[ignore = "requires a wgpu adapter"]
fn folded_dispatch_matches_reference() {
    // Workgroup size 1 forces more than 65535 groups along x for both
    // kernels, so the launch folds into a 2D grid.
    let opts = ContextOptions { workgroup_size: 1, ..Default::default() };
    let mut ctx = wgpu_context(Precision::Fp32, opts);

    let bins = 70_000usize;
    let pixels = 70_001usize;
    let map = BinMap::new((0..pixels).map(|i| (i % bins) as u32).collect(), bins).unwrap();
    let image: Vec<f32> = (0..pixels).map(|i| (i % 1000) as f32).collect();

    let got = integrate(&mut ctx, &image, &map).unwrap();
    let expected = reference_integrate(&image, &map);
    assert_eq!(got.count, expected.count);
    assert_eq!(got.sum, expected.sum);
}

// ===== Corrections =====

#[test]
#[ignore = "requires a wgpu adapter"]
fn corrections_agree_with_host() {
    let (mut image, map) = ring_frame(96, 80, 24, 31);
    let n = image.len();
    for i in (0..n).step_by(29) {
        image[i] = -1.0;
    }
    let dark: Vec<f32> = (0..n).map(|i| (i % 7) as f32).collect();
    let flat: Vec<f32> = (0..n).map(|i| 0.8 + (i % 5) as f32 * 0.1).collect();
    let solid: Vec<f32> = (0..n).map(|i| 0.9 + (i % 3) as f32 * 0.05).collect();
    let polar: Vec<f32> = (0..n).map(|i| if i % 23 == 0 { 0.0 } else { 0.95 }).collect();
    let mask: Vec<bool> = (0..n).map(|i| i % 13 == 0).collect();

    let mut host = host_context(Precision::Fp64);
    let mut gpu = wgpu_context(Precision::Fp32, ContextOptions::default());
    for ctx in [&mut host, &mut gpu] {
        ctx.set_dark(dark.clone()).unwrap();
        ctx.set_flat(flat.clone()).unwrap();
        ctx.set_solid_angle(solid.clone()).unwrap();
        ctx.set_polarization(polar.clone()).unwrap();
        ctx.set_mask(mask.clone()).unwrap();
        ctx.set_dummy(-1.0, 0.0);
    }

    let h = integrate(&mut host, &image, &map).unwrap();
    let g = integrate(&mut gpu, &image, &map).unwrap();
    assert_eq!(g.count, h.count);
    assert!(h.total_count() < map.len() as u64);
    for (a, b) in g.mean.iter().zip(&h.mean) {
        assert_relative_eq!(*a, *b, max_relative = 1e-4);
    }
}
