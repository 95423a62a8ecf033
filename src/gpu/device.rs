// gpu/device.rs — wgpu adapter enumeration and device opening.
//
// Responsibilities:
//   - Enumerate adapters per native backend and summarise each one as the
//     capability set the catalog needs (name, kind, feature tags, fp64).
//   - Re-open a specific adapter from a `DeviceDescriptor` when a context is
//     acquired, requesting SHADER_F64 only when the context needs it.
//   - Wrap the resulting wgpu device with the helpers every kernel shares:
//     1D dispatch sizing, error scopes, buffer readback.
//
// ADAPTER IDENTITY:
// wgpu has no stable adapter IDs. We identify an adapter by its position in
// `enumerate_adapters(backend)` and double-check the name on reopen. If the
// driver reordered adapters between enumeration and acquisition the name
// check fails and the context reports DeviceInit instead of silently binding
// to another card.
//
// ERROR SCOPES:
// wgpu reports validation and out-of-memory errors asynchronously and, by
// default, panics on errors nobody captured. Every resource creation and
// submission in this crate runs inside `GpuDevice::scoped`, which pushes a
// Validation and an OutOfMemory scope, runs the closure, and pops both.
// Anything that still escapes goes to the uncaptured-error handler, which
// logs it and marks the device as faulted.
//
// DISPATCH SHAPE:
// Reductions are 1D, but a single dimension is capped at
// `max_compute_workgroups_per_dimension` (65535 by default). Large launches
// fold into a 2D grid; the kernels rebuild the linear index from
// `gid.y * row_pitch + gid.x`.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytemuck::Pod;
use log::{debug, error};

use crate::device::{DeviceDescriptor, DeviceKind, Platform};
use crate::engine::Precision;
use crate::error::{IntegrationError, Result};

/// wgpu backends scanned by the catalog, in platform order.
const PLATFORMS: [(Platform, wgpu::Backends); 4] = [
    (Platform::Vulkan, wgpu::Backends::VULKAN),
    (Platform::Metal, wgpu::Backends::METAL),
    (Platform::Dx12, wgpu::Backends::DX12),
    (Platform::Gl, wgpu::Backends::GL),
];

fn backend_for(platform: Platform) -> Option<wgpu::Backends> {
    PLATFORMS
        .iter()
        .find(|(p, _)| *p == platform)
        .map(|(_, b)| *b)
}

fn make_instance(backends: wgpu::Backends) -> wgpu::Instance {
    // Validation in debug builds for shader error feedback. Non-compliant
    // adapters (dzn on WSL2) are listed so the caller can choose them.
    let flags = if cfg!(debug_assertions) {
        wgpu::InstanceFlags::VALIDATION
            | wgpu::InstanceFlags::ALLOW_UNDERLYING_NONCOMPLIANT_ADAPTER
    } else {
        wgpu::InstanceFlags::ALLOW_UNDERLYING_NONCOMPLIANT_ADAPTER
    };
    wgpu::Instance::new(wgpu::InstanceDescriptor {
        backends,
        flags,
        ..Default::default()
    })
}

// ============================================================
// Enumeration
// ============================================================

/// Capability summary of one wgpu adapter.
#[derive(Debug, Clone)]
pub(crate) struct AdapterSummary {
    pub name: String,
    pub kind: DeviceKind,
    pub extensions: BTreeSet<String>,
    pub supports_fp64: bool,
}

/// Map wgpu's device type onto the catalog's kinds.
///
/// VirtualGpu (VM pass-through) behaves like any other GPU. `Other` covers
/// translation layers and exotic devices and is reported as an accelerator.
pub(crate) fn kind_of(device_type: wgpu::DeviceType) -> DeviceKind {
    match device_type {
        wgpu::DeviceType::DiscreteGpu
        | wgpu::DeviceType::IntegratedGpu
        | wgpu::DeviceType::VirtualGpu => DeviceKind::Gpu,
        wgpu::DeviceType::Cpu => DeviceKind::Cpu,
        wgpu::DeviceType::Other => DeviceKind::Accelerator,
    }
}

/// Lowercase tags for every feature flag set in `features`.
pub(crate) fn feature_tags(features: wgpu::Features) -> BTreeSet<String> {
    features
        .iter_names()
        .map(|(name, _)| name.to_ascii_lowercase())
        .collect()
}

/// Adapters on each native backend, in platform order. Backends with no
/// adapters are still listed (with an empty vector).
pub(crate) fn enumerate_adapters() -> Vec<(Platform, Vec<AdapterSummary>)> {
    PLATFORMS
        .iter()
        .map(|&(platform, backends)| {
            let instance = make_instance(backends);
            let adapters = instance
                .enumerate_adapters(backends)
                .into_iter()
                .map(|a| {
                    let info = a.get_info();
                    let features = a.features();
                    debug!(
                        "wgpu adapter: {} ({:?}, {:?})",
                        info.name, info.backend, info.device_type
                    );
                    AdapterSummary {
                        name: info.name,
                        kind: kind_of(info.device_type),
                        extensions: feature_tags(features),
                        supports_fp64: features.contains(wgpu::Features::SHADER_F64),
                    }
                })
                .collect();
            (platform, adapters)
        })
        .collect()
}

// ============================================================
// GpuDevice
// ============================================================

/// An opened wgpu device bound to one catalog descriptor.
///
/// # Field drop order
/// `_instance` is declared last so the `wgpu::Instance` outlives `device`
/// and `queue` (some Vulkan layers crash if the instance goes first).
pub struct GpuDevice {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    pub limits: wgpu::Limits,
    /// Invocations per workgroup for every 1D kernel.
    pub workgroup_size: u32,
    label: String,
    faulted: Arc<AtomicBool>,
    _instance: wgpu::Instance,
}

impl GpuDevice {
    /// Open the adapter named by `desc`.
    ///
    /// # Errors
    /// `DeviceInit` if the descriptor is not a wgpu platform, the adapter is
    /// gone or renamed, fp64 is requested but unsupported, the workgroup size
    /// exceeds the adapter's limits, or the device request fails.
    pub fn open(desc: &DeviceDescriptor, precision: Precision, workgroup_size: u32) -> Result<Self> {
        pollster::block_on(Self::open_async(desc, precision, workgroup_size))
    }

    async fn open_async(
        desc: &DeviceDescriptor,
        precision: Precision,
        workgroup_size: u32,
    ) -> Result<Self> {
        let label = desc.to_string();
        let backends = backend_for(desc.platform)
            .ok_or_else(|| IntegrationError::init(&label, "not a wgpu platform"))?;

        let instance = make_instance(backends);
        let adapter = instance
            .enumerate_adapters(backends)
            .into_iter()
            .nth(desc.device_index)
            .ok_or_else(|| IntegrationError::init(&label, "adapter is no longer present"))?;

        let info = adapter.get_info();
        if info.name != desc.name {
            return Err(IntegrationError::init(
                &label,
                format!("adapter at this index now reports '{}'", info.name),
            ));
        }

        let mut required_features = wgpu::Features::empty();
        if precision == Precision::Fp64 {
            if !adapter.features().contains(wgpu::Features::SHADER_F64) {
                return Err(IntegrationError::init(&label, "adapter lacks SHADER_F64"));
            }
            required_features |= wgpu::Features::SHADER_F64;
        }

        let limits = adapter.limits();
        let max_wg = limits
            .max_compute_invocations_per_workgroup
            .min(limits.max_compute_workgroup_size_x);
        if workgroup_size == 0 || workgroup_size > max_wg {
            return Err(IntegrationError::init(
                &label,
                format!("workgroup size {workgroup_size} outside 1..={max_wg}"),
            ));
        }

        let (device, queue): (wgpu::Device, wgpu::Queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("azimint"),
                    required_features,
                    required_limits: limits.clone(),
                    memory_hints: wgpu::MemoryHints::default(),
                },
                None,
            )
            .await
            .map_err(|e| IntegrationError::init(&label, format!("device request failed: {e}")))?;

        let faulted = Arc::new(AtomicBool::new(false));
        {
            let flag = Arc::clone(&faulted);
            let name = label.clone();
            device.on_uncaptured_error(Box::new(move |e| {
                error!("uncaptured wgpu error on {name}: {e}");
                flag.store(true, Ordering::SeqCst);
            }));
        }
        {
            let flag = Arc::clone(&faulted);
            let name = label.clone();
            device.set_device_lost_callback(move |reason, message| {
                error!("wgpu device lost on {name}: {reason:?} {message}");
                flag.store(true, Ordering::SeqCst);
            });
        }

        Ok(GpuDevice {
            device,
            queue,
            limits,
            workgroup_size,
            label,
            faulted,
            _instance: instance,
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// True once an uncaptured error or device loss has been observed.
    pub fn is_faulted(&self) -> bool {
        self.faulted.load(Ordering::SeqCst)
    }

    /// Workgroup grid covering `items` invocations: `(groups_x, groups_y)`.
    pub fn dispatch_1d(&self, items: u32) -> (u32, u32) {
        split_workgroups(
            items.div_ceil(self.workgroup_size).max(1),
            self.limits.max_compute_workgroups_per_dimension,
        )
    }

    /// Run `f` inside Validation and OutOfMemory error scopes.
    ///
    /// Returns `AccelerationFailure` carrying `what` if either scope caught
    /// an error, or if the device had already faulted.
    pub fn scoped<T>(&self, what: &str, f: impl FnOnce() -> T) -> Result<T> {
        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let out = f();
        let validation = pollster::block_on(self.device.pop_error_scope());
        let oom = pollster::block_on(self.device.pop_error_scope());

        if let Some(e) = validation.or(oom) {
            return Err(IntegrationError::accel(&self.label, format!("{what}: {e}")));
        }
        if self.is_faulted() {
            return Err(IntegrationError::accel(&self.label, format!("{what}: device faulted")));
        }
        Ok(out)
    }

    /// Copy `len` elements of `src` into a fresh mappable buffer and read
    /// them back. Blocks until the GPU has finished all submitted work.
    pub fn read_back<T: Pod>(&self, src: &wgpu::Buffer, len: usize) -> Result<Vec<T>> {
        let size = (len * std::mem::size_of::<T>()) as u64;
        if size == 0 {
            return Ok(Vec::new());
        }

        let rb = self.scoped("readback submit", || {
            let rb = self.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("azimint readback"),
                size,
                usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            });
            let mut encoder = self
                .device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("azimint readback"),
                });
            encoder.copy_buffer_to_buffer(src, 0, &rb, 0, size);
            self.queue.submit(std::iter::once(encoder.finish()));
            rb
        })?;

        let slice = rb.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |r| {
            let _ = tx.send(r);
        });
        self.device.poll(wgpu::Maintain::Wait);

        match rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(IntegrationError::accel(&self.label, format!("map failed: {e}"))),
            Err(_) => return Err(IntegrationError::accel(&self.label, "map callback dropped")),
        }

        let out = {
            let mapped = slice.get_mapped_range();
            bytemuck::cast_slice::<u8, T>(&mapped).to_vec()
        };
        rb.unmap();
        Ok(out)
    }
}

impl fmt::Display for GpuDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GpuDevice {{ {}, workgroup: {} }}", self.label, self.workgroup_size)
    }
}

/// Fold `total_groups` workgroups into an `(x, y)` grid with `x <= limit`.
fn split_workgroups(total_groups: u32, limit: u32) -> (u32, u32) {
    if total_groups <= limit {
        (total_groups, 1)
    } else {
        (limit, total_groups.div_ceil(limit))
    }
}

// ============================================================
// Tests
// ============================================================
