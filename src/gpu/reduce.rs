// gpu/reduce.rs — wgpu reduction backend.
//
// Two kernels per integration, recorded into one command buffer:
//
//   correct      (per pixel)  raw → corrected intensity + validity flag
//   reduce_bins  (per bin)    gather over the CSR lookup table
//
// RESIDENCY
// ─────────
// Geometry (offsets, pixel list) and corrections (dark, norm, mask) are
// uploaded once and stay on the device until the context replaces them.
// Per call only the raw image goes up and the per-bin sums and counts come
// back. The corrected/valid scratch buffers and the output buffers are sized
// with the geometry and reused.
//
// MEMORY CHECK
// ────────────
// Every storage buffer must fit in `max_storage_buffer_binding_size`
// (128 MiB by default, often raised to the adapter's limit). Oversized
// geometry is refused up front with AccelerationFailure instead of
// surfacing as a validation error halfway through a submission.

use std::sync::Arc;

use log::debug;
use wgpu::util::DeviceExt;

use crate::corrections::PreparedCorrections;
use crate::engine::{BinTotals, Precision, ReductionBackend};
use crate::error::{IntegrationError, Result};
use crate::geometry::{BinLut, BinMap};
use crate::gpu::device::GpuDevice;

const HAS_DARK: u32 = 1;
const HAS_NORM: u32 = 2;
const HAS_MASK: u32 = 4;
const HAS_DUMMY: u32 = 8;

// ---------------------------------------------------------------------------
// Uniform params (must match the WGSL structs exactly)
// ---------------------------------------------------------------------------

#[repr(C)]
#[derive(Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
struct CorrectParams {
    n:         u32,
    flags:     u32,
    row_pitch: u32,
    _pad0:     u32,
    dummy:     f32,
    delta:     f32,
    _pad1:     u32,
    _pad2:     u32,
}

#[repr(C)]
#[derive(Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
struct ReduceParams {
    bins:      u32,
    row_pitch: u32,
    _pad0:     u32,
    _pad1:     u32,
}

// ---------------------------------------------------------------------------
// Resident state
// ---------------------------------------------------------------------------

struct GpuGeometry {
    pixel_count: usize,
    bin_count:   usize,
    offsets:     wgpu::Buffer,
    pixels:      wgpu::Buffer,
    corrected:   wgpu::Buffer,
    valid:       wgpu::Buffer,
    sums:        wgpu::Buffer,
    counts:      wgpu::Buffer,
}

struct GpuCorrections {
    pixel_count: usize,
    flags:       u32,
    dummy:       f32,
    delta:       f32,
    dark:        wgpu::Buffer,
    norm:        wgpu::Buffer,
    excluded:    wgpu::Buffer,
}

// ---------------------------------------------------------------------------
// GpuReducer
// ---------------------------------------------------------------------------

pub(crate) struct GpuReducer {
    gpu:              GpuDevice,
    precision:        Precision,
    correct_pipeline: wgpu::ComputePipeline,
    correct_bgl:      wgpu::BindGroupLayout,
    reduce_pipeline:  wgpu::ComputePipeline,
    reduce_bgl:       wgpu::BindGroupLayout,
    geometry:         Option<GpuGeometry>,
    corrections:      GpuCorrections,
}

fn storage_entry(binding: u32, read_only: bool) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

fn uniform_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

/// Build a pipeline whose bindings are six storage buffers followed by one
/// uniform. `writable` lists the storage bindings the kernel writes.
fn build_pipeline(
    gpu:         &GpuDevice,
    label:       &str,
    source:      String,
    entry_point: &str,
    writable:    &[u32],
) -> (wgpu::ComputePipeline, wgpu::BindGroupLayout) {
    let shader = gpu.device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label:  Some(label),
        source: wgpu::ShaderSource::Wgsl(source.into()),
    });

    let entries: Vec<wgpu::BindGroupLayoutEntry> = (0..6)
        .map(|b| storage_entry(b, !writable.contains(&b)))
        .chain(std::iter::once(uniform_entry(6)))
        .collect();
    let bgl = gpu.device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label:   Some(label),
        entries: &entries,
    });

    let layout = gpu.device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label:                Some(label),
        bind_group_layouts:   &[&bgl],
        push_constant_ranges: &[],
    });

    let pipeline = gpu.device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
        label:               Some(entry_point),
        layout:              Some(&layout),
        module:              &shader,
        entry_point,
        compilation_options: wgpu::PipelineCompilationOptions::default(),
        cache:               None,
    });

    (pipeline, bgl)
}

impl GpuReducer {
    /// Compile both kernels for `precision` on an opened device.
    ///
    /// # Errors
    /// `DeviceInit` if shader or pipeline creation is rejected.
    pub fn new(gpu: GpuDevice, precision: Precision) -> Result<Self> {
        let wg = gpu.workgroup_size.to_string();
        let correct_src = include_str!("../shaders/corrections.wgsl").replace("{{WG}}", &wg);
        let reduce_src = include_str!("../shaders/reduce.wgsl")
            .replace("{{WG}}", &wg)
            .replace("{{ACC}}", precision.wgsl_type());

        let compiled = gpu.scoped("kernel compilation", || {
            let correct = build_pipeline(&gpu, "corrections.wgsl", correct_src, "correct", &[4, 5]);
            let reduce = build_pipeline(&gpu, "reduce.wgsl", reduce_src, "reduce_bins", &[4, 5]);
            (correct, reduce)
        });
        let ((correct_pipeline, correct_bgl), (reduce_pipeline, reduce_bgl)) = match compiled {
            Ok(c) => c,
            Err(e) => return Err(IntegrationError::init(gpu.label(), e.to_string())),
        };

        let corrections = Self::upload_corrections(&gpu, &PreparedCorrections::identity(0))
            .map_err(|e| IntegrationError::init(gpu.label(), e.to_string()))?;
        debug!("compiled reduction kernels on {gpu} ({precision})");

        Ok(GpuReducer {
            gpu,
            precision,
            correct_pipeline,
            correct_bgl,
            reduce_pipeline,
            reduce_bgl,
            geometry: None,
            corrections,
        })
    }

    fn check_size(gpu: &GpuDevice, what: &str, bytes: u64) -> Result<()> {
        let limit = gpu.limits.max_storage_buffer_binding_size as u64;
        if bytes > limit || bytes > gpu.limits.max_buffer_size {
            return Err(IntegrationError::accel(
                gpu.label(),
                format!("{what} needs {bytes} bytes, device limit is {limit}"),
            ));
        }
        Ok(())
    }

    /// Storage buffer holding `data`, or a single zero element when empty
    /// (zero-sized bindings are invalid).
    fn storage_init<T: bytemuck::Pod>(
        gpu: &GpuDevice,
        label: &str,
        data: &[T],
    ) -> Result<wgpu::Buffer> {
        let zero = [T::zeroed()];
        let contents: &[T] = if data.is_empty() { &zero } else { data };
        Self::check_size(gpu, label, std::mem::size_of_val(contents) as u64)?;
        Ok(gpu.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label:    Some(label),
            contents: bytemuck::cast_slice(contents),
            usage:    wgpu::BufferUsages::STORAGE,
        }))
    }

    fn storage_rw(gpu: &GpuDevice, label: &str, elems: usize, elem_size: usize) -> Result<wgpu::Buffer> {
        let bytes = (elems.max(1) * elem_size) as u64;
        Self::check_size(gpu, label, bytes)?;
        Ok(gpu.device.create_buffer(&wgpu::BufferDescriptor {
            label:              Some(label),
            size:               bytes,
            usage:              wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        }))
    }

    fn upload_corrections(gpu: &GpuDevice, c: &PreparedCorrections) -> Result<GpuCorrections> {
        let empty_f: &[f32] = &[];
        let empty_u: &[u32] = &[];
        let mut flags = 0;
        if c.dark.is_some() {
            flags |= HAS_DARK;
        }
        if c.norm.is_some() {
            flags |= HAS_NORM;
        }
        if c.excluded.is_some() {
            flags |= HAS_MASK;
        }
        if c.dummy.is_some() {
            flags |= HAS_DUMMY;
        }

        let (dark, norm, excluded) = gpu
            .scoped("corrections upload", || -> Result<_> {
                Ok((
                    Self::storage_init(gpu, "dark", c.dark.as_deref().unwrap_or(empty_f))?,
                    Self::storage_init(gpu, "norm", c.norm.as_deref().unwrap_or(empty_f))?,
                    Self::storage_init(gpu, "mask", c.excluded.as_deref().unwrap_or(empty_u))?,
                ))
            })??;

        Ok(GpuCorrections {
            pixel_count: c.pixel_count,
            flags,
            dummy: c.dummy.map_or(0.0, |d| d.value),
            delta: c.dummy.map_or(0.0, |d| d.delta),
            dark,
            norm,
            excluded,
        })
    }

    fn read_sums(&self, geo: &GpuGeometry) -> Result<Vec<f64>> {
        Ok(match self.precision {
            Precision::Fp64 => self.gpu.read_back::<f64>(&geo.sums, geo.bin_count)?,
            Precision::Fp32 => self
                .gpu
                .read_back::<f32>(&geo.sums, geo.bin_count)?
                .into_iter()
                .map(f64::from)
                .collect(),
        })
    }

    fn acc_size(&self) -> usize {
        match self.precision {
            Precision::Fp64 => std::mem::size_of::<f64>(),
            Precision::Fp32 => std::mem::size_of::<f32>(),
        }
    }
}

impl ReductionBackend for GpuReducer {
    fn load_geometry(&mut self, map: Arc<BinMap>) -> Result<()> {
        let lut = BinLut::build(&map);
        let gpu = &self.gpu;
        let acc = self.acc_size();

        let estimate = (lut.offsets.len() + lut.pixels.len()) * 4
            + lut.pixel_count * (4 + 4 + 4)
            + lut.bin_count * (acc + 4);
        debug!(
            "uploading geometry to {}: {} pixels ({} assigned), {} bins, ~{} KiB resident",
            gpu.label(),
            lut.pixel_count,
            lut.assigned(),
            lut.bin_count,
            estimate / 1024
        );

        let geometry = gpu.scoped("geometry upload", || -> Result<GpuGeometry> {
            Ok(GpuGeometry {
                pixel_count: lut.pixel_count,
                bin_count:   lut.bin_count,
                offsets:     Self::storage_init(gpu, "lut offsets", &lut.offsets)?,
                pixels:      Self::storage_init(gpu, "lut pixels", &lut.pixels)?,
                corrected:   Self::storage_rw(gpu, "corrected", lut.pixel_count, 4)?,
                valid:       Self::storage_rw(gpu, "valid", lut.pixel_count, 4)?,
                sums:        Self::storage_rw(gpu, "bin sums", lut.bin_count, acc)?,
                counts:      Self::storage_rw(gpu, "bin counts", lut.bin_count, 4)?,
            })
        })??;

        self.geometry = Some(geometry);
        Ok(())
    }

    fn load_corrections(&mut self, corrections: &PreparedCorrections) -> Result<()> {
        self.corrections = Self::upload_corrections(&self.gpu, corrections)?;
        Ok(())
    }

    fn reduce(&mut self, image: &[f32]) -> Result<BinTotals> {
        let gpu = &self.gpu;
        let geo = self
            .geometry
            .as_ref()
            .ok_or_else(|| IntegrationError::accel(gpu.label(), "no geometry loaded"))?;
        if image.len() != geo.pixel_count {
            return Err(IntegrationError::shape("image vs bin map", geo.pixel_count, image.len()));
        }
        let corr = &self.corrections;
        if corr.flags != 0 && corr.pixel_count != image.len() {
            return Err(IntegrationError::shape(
                "corrections vs image",
                image.len(),
                corr.pixel_count,
            ));
        }

        let n = image.len() as u32;
        let bins = geo.bin_count as u32;
        let (px_x, px_y) = gpu.dispatch_1d(n);
        let (bin_x, bin_y) = gpu.dispatch_1d(bins);

        gpu.scoped("integration", || -> Result<()> {
            let raw = Self::storage_init(gpu, "raw image", image)?;

            let cparams = CorrectParams {
                n,
                flags:     corr.flags,
                row_pitch: px_x * gpu.workgroup_size,
                _pad0:     0,
                dummy:     corr.dummy,
                delta:     corr.delta,
                _pad1:     0,
                _pad2:     0,
            };
            let cparams_buf = gpu.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label:    Some("correct params"),
                contents: bytemuck::bytes_of(&cparams),
                usage:    wgpu::BufferUsages::UNIFORM,
            });
            let rparams = ReduceParams {
                bins,
                row_pitch: bin_x * gpu.workgroup_size,
                _pad0:     0,
                _pad1:     0,
            };
            let rparams_buf = gpu.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label:    Some("reduce params"),
                contents: bytemuck::bytes_of(&rparams),
                usage:    wgpu::BufferUsages::UNIFORM,
            });

            let correct_bg = gpu.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label:  Some("correct BG"),
                layout: &self.correct_bgl,
                entries: &[
                    wgpu::BindGroupEntry { binding: 0, resource: raw.as_entire_binding() },
                    wgpu::BindGroupEntry { binding: 1, resource: corr.dark.as_entire_binding() },
                    wgpu::BindGroupEntry { binding: 2, resource: corr.norm.as_entire_binding() },
                    wgpu::BindGroupEntry { binding: 3, resource: corr.excluded.as_entire_binding() },
                    wgpu::BindGroupEntry { binding: 4, resource: geo.corrected.as_entire_binding() },
                    wgpu::BindGroupEntry { binding: 5, resource: geo.valid.as_entire_binding() },
                    wgpu::BindGroupEntry { binding: 6, resource: cparams_buf.as_entire_binding() },
                ],
            });
            let reduce_bg = gpu.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label:  Some("reduce BG"),
                layout: &self.reduce_bgl,
                entries: &[
                    wgpu::BindGroupEntry { binding: 0, resource: geo.corrected.as_entire_binding() },
                    wgpu::BindGroupEntry { binding: 1, resource: geo.valid.as_entire_binding() },
                    wgpu::BindGroupEntry { binding: 2, resource: geo.offsets.as_entire_binding() },
                    wgpu::BindGroupEntry { binding: 3, resource: geo.pixels.as_entire_binding() },
                    wgpu::BindGroupEntry { binding: 4, resource: geo.sums.as_entire_binding() },
                    wgpu::BindGroupEntry { binding: 5, resource: geo.counts.as_entire_binding() },
                    wgpu::BindGroupEntry { binding: 6, resource: rparams_buf.as_entire_binding() },
                ],
            });

            let mut encoder = gpu.device.create_command_encoder(
                &wgpu::CommandEncoderDescriptor { label: Some("integrate") },
            );
            {
                let mut pass = encoder.begin_compute_pass(
                    &wgpu::ComputePassDescriptor { label: Some("correct"), timestamp_writes: None },
                );
                pass.set_pipeline(&self.correct_pipeline);
                pass.set_bind_group(0, &correct_bg, &[]);
                pass.dispatch_workgroups(px_x, px_y, 1);
            }
            {
                let mut pass = encoder.begin_compute_pass(
                    &wgpu::ComputePassDescriptor { label: Some("reduce_bins"), timestamp_writes: None },
                );
                pass.set_pipeline(&self.reduce_pipeline);
                pass.set_bind_group(0, &reduce_bg, &[]);
                pass.dispatch_workgroups(bin_x, bin_y, 1);
            }
            gpu.queue.submit(std::iter::once(encoder.finish()));
            Ok(())
        })??;

        let sum = self.read_sums(geo)?;
        let count = gpu
            .read_back::<u32>(&geo.counts, geo.bin_count)?
            .into_iter()
            .map(u64::from)
            .collect();
        Ok(BinTotals { sum, count })
    }

    fn describe(&self) -> String {
        format!("{} ({})", self.gpu, self.precision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceCatalog, Platform, SystemCatalog};

    fn open_gpu(precision: Precision) -> GpuReducer {
        let desc = SystemCatalog::enumerate()
            .devices()
            .into_iter()
            .find(|d| d.platform != Platform::Host && (!precision.is_fp64() || d.supports_fp64))
            .expect("no wgpu adapter");
        let gpu = GpuDevice::open(&desc, precision, 128).expect("open");
        GpuReducer::new(gpu, precision).expect("compile")
    }

    #[test]
    fn params_layout_matches_wgsl() {
        assert_eq!(std::mem::size_of::<CorrectParams>(), 32);
        assert_eq!(std::mem::size_of::<ReduceParams>(), 16);
    }

    #[test]
    #[ignore = "requires a real wgpu adapter"]
    fn gpu_two_bin_example() {
        let mut r = open_gpu(Precision::Fp32);
        r.load_geometry(Arc::new(BinMap::new(vec![0, 0, 1, 1], 2).unwrap())).unwrap();
        let t = r.reduce(&[10.0, 20.0, 30.0, 40.0]).unwrap();
        assert_eq!(t.sum, vec![30.0, 70.0]);
        assert_eq!(t.count, vec![2, 2]);
    }

    #[test]
    #[ignore = "requires a real wgpu adapter"]
    fn gpu_applies_mask_and_dummy() {
        use crate::corrections::{Corrections, Dummy};
        let mut r = open_gpu(Precision::Fp32);
        r.load_geometry(Arc::new(BinMap::new(vec![0, 0, 0, BinMap::SENTINEL], 1).unwrap()))
            .unwrap();
        let mut c = Corrections::default();
        c.set_mask(vec![true, false, false, false]);
        c.set_dummy(Dummy::new(-1.0, 0.0));
        r.load_corrections(&c.prepare(4).unwrap()).unwrap();
        let t = r.reduce(&[5.0, -1.0, 7.0, 9.0]).unwrap();
        assert_eq!(t.sum, vec![7.0]);
        assert_eq!(t.count, vec![1]);
    }
}
