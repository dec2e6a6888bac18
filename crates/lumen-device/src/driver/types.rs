use std::fmt;
use std::num::NonZeroU64;

/// Device-side address. Never null; absence is expressed with `Option`.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DevicePtr(NonZeroU64);

impl DevicePtr {
    pub fn new(addr: u64) -> Option<Self> {
        NonZeroU64::new(addr).map(Self)
    }

    pub fn addr(self) -> u64 {
        self.0.get()
    }

    /// Pointer `bytes` past this one.
    pub fn offset(self, bytes: u64) -> Self {
        Self(self.0.saturating_add(bytes))
    }
}

impl fmt::Debug for DevicePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DevicePtr({:#x})", self.0)
    }
}

macro_rules! handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(NonZeroU64);

        impl $name {
            pub fn from_raw(raw: NonZeroU64) -> Self {
                Self(raw)
            }

            pub fn raw(self) -> NonZeroU64 {
                self.0
            }
        }
    };
}

handle!(
    /// Driver context.
    ContextHandle
);
handle!(
    /// Loaded module image.
    ModuleHandle
);
handle!(
    /// Kernel entry point inside a module.
    FunctionHandle
);
handle!(
    /// Texture array storage.
    ArrayHandle
);
handle!(
    /// Bindless texture object.
    TextureObject
);
handle!(
    /// Display buffer registered for interop.
    GraphicsResource
);

/// Failure of a single driver call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DriverError {
    #[error("driver is not initialized")]
    NotInitialized,
    #[error("no device with ordinal {0}")]
    InvalidDevice(usize),
    #[error("no context is current on this thread")]
    NoCurrentContext,
    #[error("invalid context")]
    InvalidContext,
    #[error("invalid handle")]
    InvalidHandle,
    #[error("invalid value: {0}")]
    InvalidValue(String),
    #[error("out of memory ({requested} bytes requested)")]
    OutOfMemory { requested: usize },
    #[error("symbol \"{0}\" not found")]
    NotFound(String),
    #[error("invalid module image: {0}")]
    InvalidImage(String),
    #[error("launch failed: {0}")]
    LaunchFailed(String),
    #[error("{0} is not supported by this driver")]
    NotSupported(&'static str),
    #[error("graphics interop is unavailable")]
    InteropUnavailable,
}

/// Kernel launch argument.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum KernelArg {
    Ptr(Option<DevicePtr>),
    I32(i32),
    U32(u32),
    F32(f32),
    Int4([i32; 4]),
}

impl From<DevicePtr> for KernelArg {
    fn from(ptr: DevicePtr) -> Self {
        Self::Ptr(Some(ptr))
    }
}

impl From<Option<DevicePtr>> for KernelArg {
    fn from(ptr: Option<DevicePtr>) -> Self {
        Self::Ptr(ptr)
    }
}

impl From<i32> for KernelArg {
    fn from(v: i32) -> Self {
        Self::I32(v)
    }
}

impl From<u32> for KernelArg {
    fn from(v: u32) -> Self {
        Self::U32(v)
    }
}

impl From<f32> for KernelArg {
    fn from(v: f32) -> Self {
        Self::F32(v)
    }
}

impl From<[i32; 4]> for KernelArg {
    fn from(v: [i32; 4]) -> Self {
        Self::Int4(v)
    }
}

/// Grid or block extent.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Dim3 {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl Dim3 {
    pub const fn linear(x: u32) -> Self {
        Self { x, y: 1, z: 1 }
    }

    pub const fn plane(x: u32, y: u32) -> Self {
        Self { x, y, z: 1 }
    }

    pub fn volume(&self) -> u64 {
        self.x as u64 * self.y as u64 * self.z as u64
    }
}

/// Occupancy hint for a kernel.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Occupancy {
    /// Smallest grid that keeps every multiprocessor busy.
    pub min_grid_blocks: u32,
    /// Threads per block achieving that occupancy.
    pub block_size: u32,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MemInfo {
    pub free: usize,
    pub total: usize,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct ContextFlags {
    /// Share buffers with the display (graphics interop).
    pub display_sharing: bool,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CachePreference {
    PreferL1,
    PreferShared,
}

/// Static properties of a device.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceAttributes {
    pub name: String,
    pub compute_major: u32,
    pub compute_minor: u32,
    pub pci_domain: u32,
    pub pci_bus: u32,
    pub pci_device: u32,
    /// Kernels are killed by a watchdog after a timeout.
    pub kernel_exec_timeout: bool,
    pub compute_preemption: bool,
    pub multiprocessor_count: u32,
    pub max_threads_per_block: u32,
    pub warp_size: u32,
    pub max_shared_memory_per_block: usize,
    pub clock_rate_khz: u32,
    pub total_memory: usize,
}

/// Element format of a texture array.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ArrayFormat {
    U8,
    U16,
    Half,
    U32,
    I32,
    F32,
}

impl ArrayFormat {
    pub fn size(self) -> usize {
        match self {
            Self::U8 => 1,
            Self::U16 | Self::Half => 2,
            Self::U32 | Self::I32 | Self::F32 => 4,
        }
    }
}

/// Shape of a 1D, 2D or 3D texture array. Unused dimensions are 0.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ArrayDesc {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub format: ArrayFormat,
    pub channels: u32,
}

impl ArrayDesc {
    pub fn byte_size(&self) -> usize {
        self.width as usize
            * self.height.max(1) as usize
            * self.depth.max(1) as usize
            * self.format.size()
            * self.channels as usize
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AddressMode {
    Wrap,
    Clamp,
    Border,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FilterMode {
    Point,
    Linear,
}

/// Sampler state of a texture binding.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Sampling {
    pub address: AddressMode,
    pub filter: FilterMode,
    pub normalized_coords: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_pointer_is_unrepresentable() {
        assert!(DevicePtr::new(0).is_none());
        let p = DevicePtr::new(0x1000).unwrap();
        assert_eq!(p.offset(0x20).addr(), 0x1020);
    }

    #[test]
    fn array_size_counts_unused_dimensions_as_one() {
        let desc = ArrayDesc {
            width: 16,
            height: 0,
            depth: 0,
            format: ArrayFormat::F32,
            channels: 4,
        };
        assert_eq!(desc.byte_size(), 16 * 4 * 4);
    }
}
