// tests/test_engine.rs — Binned reduction on the host pool, checked against
// a serial reference.

mod common;

use approx::assert_relative_eq;
use azimint::{
    integrate, integrate_image, BinMap, ContextOptions, IntegrationContext, IntegrationError,
    DeviceDescriptor, Image, Precision, EMPTY_BIN_MEAN,
};
use common::{host_context, integer_frame, reference_integrate, ring_frame};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

// ===== Worked example =====

#[test]
fn two_bin_example() {
    for precision in [Precision::Fp64, Precision::Fp32] {
        let mut ctx = host_context(precision);
        let map = BinMap::new(vec![0, 0, 1, 1], 2).unwrap();
        let r = integrate(&mut ctx, &[10.0, 20.0, 30.0, 40.0], &map).unwrap();
        assert_eq!(r.mean, vec![15.0, 35.0]);
        assert_eq!(r.count, vec![2, 2]);
        assert_eq!(r.sum, vec![30.0, 70.0]);
        assert_eq!(r.precision, precision);
    }
}

#[test]
fn result_length_is_bin_count() {
    let mut ctx = host_context(Precision::Fp64);
    let map = BinMap::new(vec![0, 3], 10).unwrap();
    let r = integrate(&mut ctx, &[1.0, 2.0], &map).unwrap();
    assert_eq!(r.bin_count(), 10);
    assert_eq!(r.count.len(), 10);
    assert_eq!(r.sum.len(), 10);
}

#[test]
fn empty_bins_report_zero_mean() {
    let mut ctx = host_context(Precision::Fp64);
    let map = BinMap::new(vec![0, 0, 2, BinMap::SENTINEL], 4).unwrap();
    let r = integrate(&mut ctx, &[1.0, 3.0, 5.0, 7.0], &map).unwrap();
    assert_eq!(r.mean, vec![2.0, EMPTY_BIN_MEAN, 5.0, EMPTY_BIN_MEAN]);
    assert_eq!(r.count, vec![2, 0, 1, 0]);
    let again = integrate(&mut ctx, &[1.0, 3.0, 5.0, 7.0], &map).unwrap();
    assert_eq!(r, again);
}

#[test]
fn shape_mismatch_reported() {
    let mut ctx = host_context(Precision::Fp64);
    let map = BinMap::new(vec![0, 0, 1], 2).unwrap();
    let err = integrate(&mut ctx, &[1.0, 2.0], &map).unwrap_err();
    assert!(matches!(err, IntegrationError::ShapeMismatch { expected: 3, actual: 2, .. }));
}

// ===== Agreement with the reference =====

#[test]
fn matches_serial_reference_on_ring_frame() {
    let (image, map) = ring_frame(256, 192, 100, 7);
    let expected = reference_integrate(&image, &map);

    let mut ctx = host_context(Precision::Fp64);
    let got = integrate(&mut ctx, &image, &map).unwrap();
    assert_eq!(got.count, expected.count);
    for (g, e) in got.mean.iter().zip(&expected.mean) {
        assert_relative_eq!(*g, *e, max_relative = 1e-12);
    }
}

#[test]
fn fp32_accumulation_stays_close() {
    let (image, map) = ring_frame(256, 256, 64, 11);
    let expected = reference_integrate(&image, &map);

    let mut ctx = host_context(Precision::Fp32);
    let got = integrate(&mut ctx, &image, &map).unwrap();
    assert_eq!(got.count, expected.count);
    for (g, e) in got.mean.iter().zip(&expected.mean) {
        assert_relative_eq!(*g, *e, max_relative = 1e-4);
    }
}

// ===== Determinism and order independence =====

#[test]
fn repeated_runs_are_bit_identical() {
    let (image, map) = ring_frame(300, 300, 150, 3);
    let mut ctx = host_context(Precision::Fp32);
    let a = integrate(&mut ctx, &image, &map).unwrap();
    let b = integrate(&mut ctx, &image, &map).unwrap();
    let bits = |v: &[f64]| v.iter().map(|x| x.to_bits()).collect::<Vec<_>>();
    assert_eq!(bits(&a.sum), bits(&b.sum));
    assert_eq!(a.count, b.count);
}

#[test]
fn chunk_size_does_not_change_result() {
    let (image, map) = ring_frame(128, 128, 40, 5);
    let host = DeviceDescriptor::host(0);
    let mut small = IntegrationContext::acquire_with(
        &host,
        Precision::Fp64,
        ContextOptions { host_chunk: 97, ..Default::default() },
    )
    .unwrap();
    let mut large = IntegrationContext::acquire(&host, Precision::Fp64).unwrap();

    let a = integrate(&mut small, &image, &map).unwrap();
    let b = integrate(&mut large, &image, &map).unwrap();
    assert_eq!(a.count, b.count);
    for (x, y) in a.sum.iter().zip(&b.sum) {
        assert_relative_eq!(*x, *y, max_relative = 1e-12);
    }
}

#[test]
fn permuting_pixels_preserves_totals() {
    let (image, map) = integer_frame(50_000, 37, 42);
    let mut order: Vec<usize> = (0..image.len()).collect();
    order.shuffle(&mut StdRng::seed_from_u64(99));

    let shuffled_image: Vec<f32> = order.iter().map(|&i| image[i]).collect();
    let shuffled_map = BinMap::new(
        order.iter().map(|&i| map.as_slice()[i]).collect(),
        map.bin_count(),
    )
    .unwrap();

    let mut ctx = host_context(Precision::Fp64);
    let a = integrate(&mut ctx, &image, &map).unwrap();
    let b = integrate(&mut ctx, &shuffled_image, &shuffled_map).unwrap();
    // Integer intensities: sums are exact in either order.
    assert_eq!(a.count, b.count);
    assert_eq!(a.sum, b.sum);
}

// ===== 2D images =====

#[test]
fn integrate_u16_image_with_padding() {
    let img = Image::<u16>::from_vec_with_stride(2, 2, 4, vec![10, 20, 0, 0, 30, 40, 0, 0]).unwrap();
    let map = BinMap::new(vec![0, 0, 1, 1], 2).unwrap();
    let mut ctx = host_context(Precision::Fp64);
    let r = integrate_image(&mut ctx, &img, &map).unwrap();
    assert_eq!(r.mean, vec![15.0, 35.0]);
}

// ===== Corrections =====

#[test]
fn corrections_match_manual_preprocessing() {
    let (image, map) = ring_frame(64, 64, 16, 21);
    let n = image.len();
    let dark: Vec<f32> = (0..n).map(|i| (i % 5) as f32).collect();
    let flat: Vec<f32> = (0..n).map(|i| 0.5 + (i % 3) as f32 * 0.25).collect();
    let mask: Vec<bool> = (0..n).map(|i| i % 17 == 0).collect();

    let mut ctx = host_context(Precision::Fp64);
    ctx.set_dark(dark.clone()).unwrap();
    ctx.set_flat(flat.clone()).unwrap();
    ctx.set_mask(mask.clone()).unwrap();
    let got = integrate(&mut ctx, &image, &map).unwrap();

    let manual: Vec<f32> = (0..n).map(|i| (image[i] - dark[i]) / flat[i]).collect();
    let manual_map = BinMap::new(
        (0..n)
            .map(|i| if mask[i] { BinMap::SENTINEL } else { map.as_slice()[i] })
            .collect(),
        map.bin_count(),
    )
    .unwrap();
    let expected = reference_integrate(&manual, &manual_map);

    assert_eq!(got.count, expected.count);
    for (g, e) in got.mean.iter().zip(&expected.mean) {
        assert_relative_eq!(*g, *e, max_relative = 1e-9);
    }
}

#[test]
fn dummy_pixels_are_skipped() {
    let mut ctx = host_context(Precision::Fp64);
    ctx.set_dummy(-2.0, 0.5);
    let map = BinMap::new(vec![0, 0, 0], 1).unwrap();
    let r = integrate(&mut ctx, &[-2.2, 4.0, 6.0], &map).unwrap();
    assert_eq!(r.count, vec![2]);
    assert_eq!(r.mean, vec![5.0]);
}
