use bytemuck::Pod;

use crate::device::{DisplayBuffer, PixelFormat};
use crate::driver::{ArrayFormat, ArrayHandle, DevicePtr};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum MemoryKind {
    /// Flat buffer addressed by kernels through a pointer.
    Linear,
    /// Display-shareable RGBA pixels.
    Pixels,
    /// Image data sampled through a texture.
    Texture,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum DataType {
    U8,
    U16,
    Half,
    U32,
    I32,
    F32,
    U64,
}

impl DataType {
    pub fn size(self) -> usize {
        match self {
            Self::U8 => 1,
            Self::U16 | Self::Half => 2,
            Self::U32 | Self::I32 | Self::F32 => 4,
            Self::U64 => 8,
        }
    }

    /// Array element format, if textures can hold this type.
    pub(crate) fn array_format(self) -> Option<ArrayFormat> {
        match self {
            Self::U8 => Some(ArrayFormat::U8),
            Self::U16 => Some(ArrayFormat::U16),
            Self::Half => Some(ArrayFormat::Half),
            Self::U32 => Some(ArrayFormat::U32),
            Self::I32 => Some(ArrayFormat::I32),
            Self::F32 => Some(ArrayFormat::F32),
            Self::U64 => None,
        }
    }
}

/// Texture filtering policy. `None` means the data is read as a plain buffer.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
#[repr(u32)]
pub enum Interpolation {
    None = 0,
    #[default]
    Linear = 1,
    Closest = 2,
    Cubic = 3,
    Smart = 4,
}

/// Texture addressing outside `[0, 1]`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
#[repr(u32)]
pub enum Extension {
    #[default]
    Repeat = 0,
    Extend = 1,
    Clip = 2,
}

/// Where a resident allocation lives.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Residency {
    Buffer(DevicePtr),
    Array(ArrayHandle),
    Display(DisplayBuffer),
}

/// Descriptor of one device allocation and its optional host copy.
///
/// The caller owns the value; the memory manager only fills in residency
/// and size. `width × height × depth` elements of `channels` components each;
/// unused dimensions are 1 (linear data uses `width` only).
#[derive(Debug)]
pub struct DeviceMemory {
    name: String,
    kind: MemoryKind,
    data_type: DataType,
    channels: u32,
    width: usize,
    height: u32,
    depth: u32,
    pub interpolation: Interpolation,
    pub extension: Extension,
    host: Option<Vec<u8>>,
    pub(crate) residency: Option<Residency>,
    pub(crate) device_size: usize,
}

impl DeviceMemory {
    fn with_shape(name: &str, kind: MemoryKind, data_type: DataType, channels: u32, width: usize, dims: [u32; 2]) -> Self {
        let mut mem = Self {
            name: name.to_string(),
            kind,
            data_type,
            channels,
            width,
            height: dims[0].max(1),
            depth: dims[1].max(1),
            interpolation: Interpolation::default(),
            extension: Extension::default(),
            host: None,
            residency: None,
            device_size: 0,
        };
        mem.host = Some(vec![0; mem.memory_size()]);
        mem
    }

    /// Linear buffer of `len` elements with a zeroed host copy.
    pub fn linear(name: &str, data_type: DataType, channels: u32, len: usize) -> Self {
        Self::with_shape(name, MemoryKind::Linear, data_type, channels, len, [1, 1])
    }

    /// Linear buffer of `len` elements that lives on the device only.
    pub fn device_linear(name: &str, data_type: DataType, channels: u32, len: usize) -> Self {
        let mut mem = Self::linear(name, data_type, channels, 0);
        mem.width = len;
        mem.host = None;
        mem
    }

    /// Linear buffer holding a copy of `data`.
    pub fn from_slice<T: Pod>(name: &str, data_type: DataType, channels: u32, data: &[T]) -> Self {
        let mut mem = Self::linear(name, data_type, channels, 0);
        mem.set_host(data);
        mem
    }

    /// RGBA pixel buffer for display.
    pub fn pixels(name: &str, format: PixelFormat, width: u32, height: u32) -> Self {
        let data_type = match format {
            PixelFormat::Rgba8 => DataType::U8,
            PixelFormat::RgbaHalf => DataType::Half,
        };
        Self::with_shape(name, MemoryKind::Pixels, data_type, 4, width as usize, [height, 1])
    }

    /// Texture of `width × height × depth` texels.
    pub fn texture(name: &str, data_type: DataType, channels: u32, width: u32, height: u32, depth: u32) -> Self {
        Self::with_shape(name, MemoryKind::Texture, data_type, channels, width as usize, [height, depth])
    }

    /// Drops the host copy; the allocation then exists on the device only.
    pub fn device_only(mut self) -> Self {
        self.host = None;
        self
    }

    pub fn with_interpolation(mut self, interpolation: Interpolation) -> Self {
        self.interpolation = interpolation;
        self
    }

    pub fn with_extension(mut self, extension: Extension) -> Self {
        self.extension = extension;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> MemoryKind {
        self.kind
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    pub fn channels(&self) -> u32 {
        self.channels
    }

    /// Elements per row; the element count of linear data.
    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    /// `[width, height, depth]` of a texture or pixel buffer.
    ///
    /// Those are built from `u32` sizes; only linear data grows past them.
    pub fn extent(&self) -> [u32; 3] {
        [u32::try_from(self.width).unwrap_or(u32::MAX), self.height, self.depth]
    }

    /// 1, 2 or 3.
    pub fn dimensions(&self) -> u32 {
        if self.depth > 1 {
            3
        } else if self.height > 1 {
            2
        } else {
            1
        }
    }

    pub fn element_size(&self) -> usize {
        self.data_type.size() * self.channels as usize
    }

    pub fn len(&self) -> usize {
        self.width * self.height as usize * self.depth as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes needed on the device.
    pub fn memory_size(&self) -> usize {
        self.len() * self.element_size()
    }

    pub fn host(&self) -> Option<&[u8]> {
        self.host.as_deref()
    }

    pub fn host_mut(&mut self) -> Option<&mut [u8]> {
        self.host.as_deref_mut()
    }

    /// Replaces the host copy with `data`, resizing a linear buffer to fit.
    pub fn set_host<T: Pod>(&mut self, data: &[T]) {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        if self.kind == MemoryKind::Linear && self.element_size() > 0 {
            self.width = bytes.len() / self.element_size();
        }
        self.host = Some(bytes.to_vec());
    }

    /// Host copy reinterpreted as `T`s.
    pub fn read_host<T: Pod>(&self) -> Vec<T> {
        self.host
            .as_deref()
            .map(|bytes| bytemuck::pod_collect_to_vec(&bytes[..bytes.len() / size_of::<T>() * size_of::<T>()]))
            .unwrap_or_default()
    }

    /// Changes the shape; the host copy is resized and zero-filled.
    ///
    /// A resident allocation keeps its old size until it is reallocated.
    pub fn resize(&mut self, width: u32, height: u32, depth: u32) {
        self.width = width as usize;
        self.height = height.max(1);
        self.depth = depth.max(1);
        if self.host.is_some() {
            self.host = Some(vec![0; self.memory_size()]);
        }
    }

    pub fn residency(&self) -> Option<Residency> {
        self.residency
    }

    pub fn is_resident(&self) -> bool {
        self.residency.is_some()
    }

    /// Device address of a resident linear allocation.
    pub fn device_ptr(&self) -> Option<DevicePtr> {
        match self.residency {
            Some(Residency::Buffer(ptr)) => Some(ptr),
            _ => None,
        }
    }

    /// Bytes currently allocated on the device.
    pub fn device_size(&self) -> usize {
        self.device_size
    }
}
