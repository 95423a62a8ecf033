// gpu/mod.rs — wgpu acceleration layer.
//
// Mirrors the host reduction in host.rs on any wgpu adapter. The host path
// remains the reference: every kernel here is validated against it bin for
// bin.
//
// Split of work:
//
//   device  : adapter enumeration, device opening, error scopes, readback
//   reduce  : corrections + per-bin gather kernels (shaders/*.wgsl)
//
// Everything the context keeps between calls (LUT, corrections, scratch and
// output buffers) lives inside `reduce::GpuReducer`; dropping it releases
// all device memory.

pub mod device;
pub(crate) mod reduce;
