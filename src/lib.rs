// azimint: accelerated azimuthal integration of 2D detector images
//
// A detector frame is reduced to a 1D radial profile by sending every pixel
// to the bin its precomputed scattering angle falls in and averaging per bin.
// The reduction runs on a wgpu adapter or on the host rayon pool; the host
// path is the reference every GPU kernel is validated against.
//
// Typical flow:
//
//   let catalog = SystemCatalog::enumerate();
//   let mut ctx = open_context(&IntegratorConfig::from_env()?, &catalog)?;
//   let profile = integrate(&mut ctx, &frame, &bin_map)?;
//   let verdict = compare(&reference, &profile, DEFAULT_THRESHOLD)?;

pub mod config;
pub mod context;
pub mod corrections;
pub mod device;
pub mod engine;
pub mod error;
pub mod geometry;
pub mod gpu;
pub mod host;
pub mod image;
pub mod validate;

pub use config::{open_context, IntegratorConfig};
pub use context::{CachePolicy, ContextOptions, ExecStats, IntegrationContext};
pub use corrections::{Corrections, Dummy};
pub use device::{
    select, DeviceCatalog, DeviceClass, DeviceDescriptor, DeviceKind, DeviceRequest, Platform,
    StaticCatalog, SystemCatalog,
};
pub use engine::{integrate, integrate_image, IntegrationResult, Precision, EMPTY_BIN_MEAN};
pub use error::{IntegrationError, Result};
pub use geometry::BinMap;
pub use image::{Image, Pixel};
pub use validate::{compare, Verdict, DEFAULT_THRESHOLD};
