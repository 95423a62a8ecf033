// device.rs — Device catalog and capability-constrained selection.
//
// A device is described by a plain value (`DeviceDescriptor`) carrying the
// handful of capabilities selection cares about. Where the descriptors come
// from is hidden behind the `DeviceCatalog` trait:
//
//   SystemCatalog  — real hardware: every wgpu adapter, grouped by backend
//                    (Vulkan, Metal, DX12, GL), followed by the host thread
//                    pool as its own platform.
//   StaticCatalog  — a fixed list, used to inject fake hardware in tests.
//
// Selection (`select`) is a pure filter over the catalog order:
// platform-major, device-minor, first match wins. Nothing is opened here;
// opening happens when a context is acquired.
//
// PLATFORM INDICES
// ────────────────
// Platforms are numbered in enumeration order, counting only platforms that
// expose at least one device. On a laptop with one Vulkan GPU this gives:
//
//   platform 0 (Vulkan): device 0 = "NVIDIA GeForce RTX 3060"
//   platform 1 (Host)  : device 0 = "host thread pool (16 threads)"
//
// Indices are stable within a process run. Re-enumeration (building a new
// SystemCatalog) may renumber if drivers change; we do not try to detect it.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use log::{debug, info};

use crate::error::{IntegrationError, Result};
use crate::gpu;

// ---------------------------------------------------------------------------
// Classes and platforms
// ---------------------------------------------------------------------------

/// The kind of a concrete device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    Cpu,
    Gpu,
    Accelerator,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceKind::Cpu => write!(f, "cpu"),
            DeviceKind::Gpu => write!(f, "gpu"),
            DeviceKind::Accelerator => write!(f, "accelerator"),
        }
    }
}

/// The device class requested by a caller. `All` accepts any kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DeviceClass {
    Cpu,
    Gpu,
    Accelerator,
    #[default]
    All,
}

impl DeviceClass {
    pub fn accepts(self, kind: DeviceKind) -> bool {
        match self {
            DeviceClass::All => true,
            DeviceClass::Cpu => kind == DeviceKind::Cpu,
            DeviceClass::Gpu => kind == DeviceKind::Gpu,
            DeviceClass::Accelerator => kind == DeviceKind::Accelerator,
        }
    }
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceClass::Cpu => write!(f, "cpu"),
            DeviceClass::Gpu => write!(f, "gpu"),
            DeviceClass::Accelerator => write!(f, "accelerator"),
            DeviceClass::All => write!(f, "any"),
        }
    }
}

impl FromStr for DeviceClass {
    type Err = IntegrationError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cpu" => Ok(DeviceClass::Cpu),
            "gpu" => Ok(DeviceClass::Gpu),
            "acc" | "accelerator" => Ok(DeviceClass::Accelerator),
            "all" | "any" | "def" | "default" => Ok(DeviceClass::All),
            other => Err(IntegrationError::InvalidConfiguration(format!(
                "unknown device class '{other}' (expected cpu|gpu|accelerator|all)"
            ))),
        }
    }
}

/// A group of devices driven by the same runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Platform {
    Vulkan,
    Metal,
    Dx12,
    Gl,
    /// The in-process rayon thread pool.
    Host,
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Platform::Vulkan => write!(f, "Vulkan"),
            Platform::Metal => write!(f, "Metal"),
            Platform::Dx12 => write!(f, "DX12"),
            Platform::Gl => write!(f, "GL"),
            Platform::Host => write!(f, "Host"),
        }
    }
}

// ---------------------------------------------------------------------------
// DeviceDescriptor
// ---------------------------------------------------------------------------

/// Immutable description of one compute device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub platform_index: usize,
    pub device_index: usize,
    pub platform: Platform,
    pub name: String,
    pub kind: DeviceKind,
    pub extensions: BTreeSet<String>,
    pub supports_fp64: bool,
}

impl DeviceDescriptor {
    /// Extension tags advertised by the host platform.
    pub const HOST_EXTENSIONS: [&'static str; 3] = ["host_threads", "shader_f64", "shader_int64"];

    /// Descriptor for the host thread pool at the given platform index.
    pub fn host(platform_index: usize) -> Self {
        DeviceDescriptor {
            platform_index,
            device_index: 0,
            platform: Platform::Host,
            name: format!("host thread pool ({} threads)", rayon::current_num_threads()),
            kind: DeviceKind::Cpu,
            extensions: Self::HOST_EXTENSIONS.iter().map(|s| s.to_string()).collect(),
            supports_fp64: true,
        }
    }

    /// `(platform_index, device_index)` pair identifying this device.
    pub fn ids(&self) -> (usize, usize) {
        (self.platform_index, self.device_index)
    }

    pub fn matches_class(&self, class: DeviceClass) -> bool {
        class.accepts(self.kind)
    }

    pub fn has_extension(&self, ext: &str) -> bool {
        self.extensions.contains(ext)
    }

    pub fn has_extensions<'a>(&self, exts: impl IntoIterator<Item = &'a String>) -> bool {
        exts.into_iter().all(|e| self.has_extension(e))
    }

    /// True if this descriptor satisfies every constraint of `request`.
    pub fn satisfies(&self, request: &DeviceRequest) -> bool {
        self.matches_class(request.class)
            && self.has_extensions(&request.extensions)
            && (!request.require_fp64 || self.supports_fp64)
    }
}

impl fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}:{} {} {}]",
            self.name, self.platform_index, self.device_index, self.platform, self.kind
        )
    }
}

// ---------------------------------------------------------------------------
// DeviceRequest
// ---------------------------------------------------------------------------

/// Constraints a caller places on device selection.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeviceRequest {
    pub class: DeviceClass,
    pub extensions: BTreeSet<String>,
    pub require_fp64: bool,
}

impl DeviceRequest {
    pub fn new(class: DeviceClass) -> Self {
        DeviceRequest {
            class,
            ..Default::default()
        }
    }

    pub fn with_extension(mut self, ext: impl Into<String>) -> Self {
        self.extensions.insert(ext.into());
        self
    }

    pub fn with_fp64(mut self, require: bool) -> Self {
        self.require_fp64 = require;
        self
    }
}

impl fmt::Display for DeviceRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} device", self.class)?;
        if !self.extensions.is_empty() {
            let exts: Vec<&str> = self.extensions.iter().map(String::as_str).collect();
            write!(f, " with [{}]", exts.join(", "))?;
        }
        if self.require_fp64 {
            write!(f, " (fp64 required)")?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Catalogs
// ---------------------------------------------------------------------------

/// Source of device descriptors, in catalog order.
pub trait DeviceCatalog {
    fn devices(&self) -> Vec<DeviceDescriptor>;
}

/// A fixed list of descriptors.
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog(pub Vec<DeviceDescriptor>);

impl DeviceCatalog for StaticCatalog {
    fn devices(&self) -> Vec<DeviceDescriptor> {
        self.0.clone()
    }
}

/// The devices actually present: wgpu adapters, then the host thread pool.
#[derive(Debug, Clone)]
pub struct SystemCatalog {
    devices: Vec<DeviceDescriptor>,
}

impl SystemCatalog {
    /// Enumerate wgpu adapters on every native backend plus the host pool.
    pub fn enumerate() -> Self {
        let mut devices = Vec::new();
        let mut platform_index = 0;

        for (platform, adapters) in gpu::device::enumerate_adapters() {
            if adapters.is_empty() {
                continue;
            }
            for (device_index, a) in adapters.into_iter().enumerate() {
                devices.push(DeviceDescriptor {
                    platform_index,
                    device_index,
                    platform,
                    name: a.name,
                    kind: a.kind,
                    extensions: a.extensions,
                    supports_fp64: a.supports_fp64,
                });
            }
            platform_index += 1;
        }
        devices.push(DeviceDescriptor::host(platform_index));

        for d in &devices {
            debug!("catalog: {d} fp64={} extensions={:?}", d.supports_fp64, d.extensions);
        }
        SystemCatalog { devices }
    }

    /// Only the host thread pool. Useful where touching graphics drivers is
    /// undesirable (CI, headless containers).
    pub fn host_only() -> Self {
        SystemCatalog {
            devices: vec![DeviceDescriptor::host(0)],
        }
    }
}

impl DeviceCatalog for SystemCatalog {
    fn devices(&self) -> Vec<DeviceDescriptor> {
        self.devices.clone()
    }
}

// ---------------------------------------------------------------------------
// Selection
// ---------------------------------------------------------------------------

/// First descriptor in `devices` satisfying `request`.
pub fn first_match<'a>(
    devices: &'a [DeviceDescriptor],
    request: &DeviceRequest,
) -> Option<&'a DeviceDescriptor> {
    devices.iter().find(|d| d.satisfies(request))
}

/// Pick the first catalog device satisfying `request`.
///
/// Returns [`IntegrationError::NotFound`] when nothing matches. That is a
/// normal outcome on machines without suitable hardware; it is logged at
/// `info`, not as an error.
pub fn select(catalog: &dyn DeviceCatalog, request: &DeviceRequest) -> Result<DeviceDescriptor> {
    let devices = catalog.devices();
    match first_match(&devices, request) {
        Some(d) => {
            debug!("selected {d} for {request}");
            Ok(d.clone())
        }
        None => {
            info!("no device among {} matches {request}", devices.len());
            Err(IntegrationError::NotFound {
                request: request.clone(),
            })
        }
    }
}
