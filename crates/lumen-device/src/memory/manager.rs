use std::collections::HashMap;
use std::sync::Arc;

use super::allocation::{DataType, DeviceMemory, Extension, Interpolation, MemoryKind, Residency};
use super::slots::{legacy_bind_name, texture_slot, TextureInfo, TextureSlots};
use super::stats::MemStats;
use crate::device::{ContextScope, DisplayBuffer, DisplayInterop, PixelFormat};
use crate::driver::{
    AddressMode, ArrayDesc, ArrayHandle, DevicePtr, DriverError, FilterMode, GraphicsResource,
    ModuleHandle, Sampling, TextureObject,
};
use crate::error::DeviceError;
use crate::logging::{human_number, human_size};
use crate::module::kernels;

/// How a resident texture is reached by kernels.
#[derive(Debug)]
enum TextureBinding {
    /// Buffer whose address is stored in the module global of that name.
    Global(String),
    /// Array bound to a texture reference of the render module.
    Reference(String),
    /// Array sampled through a bindless object held in `slot`.
    Object { object: TextureObject, slot: usize },
}

/// Tracking entry of one resident allocation.
#[derive(Debug)]
enum Registration {
    Linear,
    Texture { binding: TextureBinding },
    Pixels { resource: GraphicsResource, format: PixelFormat },
}

/// Result of a pixel-interop allocation attempt.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PixelAlloc {
    /// Registered with the display; kernels write straight into it.
    Shared,
    /// Display sharing failed; nothing was allocated.
    Fallback,
}

/// Performs allocation, transfer and texture binding, and tracks every
/// resident allocation in a single registry keyed by its residency.
///
/// All operations take a [`ContextScope`] and report driver failures to its
/// error latch as well as returning them.
pub struct MemoryManager {
    registry: HashMap<Residency, Registration>,
    slots: TextureSlots,
    slot_buffer: Option<DeviceMemory>,
    bindless: bool,
    stats: Arc<MemStats>,
}

impl MemoryManager {
    pub fn new(bindless: bool, slot_chunk: usize, stats: Arc<MemStats>) -> Self {
        Self {
            registry: HashMap::new(),
            slots: TextureSlots::new(slot_chunk),
            slot_buffer: Some(DeviceMemory::linear(kernels::TEXTURE_INFO, DataType::U64, 4, 0)),
            bindless,
            stats,
        }
    }

    pub fn is_bindless(&self) -> bool {
        self.bindless
    }

    pub fn texture_slots(&self) -> &TextureSlots {
        &self.slots
    }

    /// Number of resident allocations being tracked.
    pub fn tracked(&self) -> usize {
        self.registry.len()
    }

    pub fn stats(&self) -> &Arc<MemStats> {
        &self.stats
    }

    // ── linear memory ───────────────────────────────────────────────────────

    /// Allocates a flat device buffer for `mem`.
    ///
    /// A resident allocation of the right size is kept; one of a different
    /// size is freed and allocated again.
    pub fn alloc(&mut self, scope: &ContextScope<'_>, mem: &mut DeviceMemory) -> Result<(), DeviceError> {
        scope.ensure_clear()?;

        let bytes = mem.memory_size();
        if mem.is_resident() {
            if mem.device_size == bytes {
                return Ok(());
            }
            self.free(scope, mem, None)?;
        }
        if bytes == 0 {
            return Err(scope
                .errors()
                .raise(DeviceError::InvalidRequest(format!("\"{}\" has no elements to allocate", mem.name()))));
        }

        log::debug!(
            "Buffer allocate: {}, {} bytes ({})",
            mem.name(),
            human_number(bytes as u64),
            human_size(bytes)
        );

        let ptr = scope.driver().mem_alloc(bytes).map_err(|source| {
            scope.errors().raise(DeviceError::Allocation {
                name: mem.name().to_string(),
                bytes,
                source,
            })
        })?;

        mem.residency = Some(Residency::Buffer(ptr));
        mem.device_size = bytes;
        self.registry.insert(Residency::Buffer(ptr), Registration::Linear);
        self.stats.mem_alloc(bytes);
        Ok(())
    }

    /// Uploads the host copy, allocating first if needed.
    pub fn copy_to_device(&mut self, scope: &ContextScope<'_>, mem: &mut DeviceMemory) -> Result<(), DeviceError> {
        scope.ensure_clear()?;
        if matches!(mem.residency, Some(Residency::Display(_))) {
            return Err(invalid(scope, format!("\"{}\" is a display buffer and cannot be uploaded", mem.name())));
        }

        self.alloc(scope, mem)?;
        let ptr = resident_ptr(scope, mem)?;
        let host = mem
            .host()
            .ok_or_else(|| invalid(scope, format!("\"{}\" has no host data to upload", mem.name())))?;

        log::debug!("Buffer copy to device: {}, {} bytes", mem.name(), human_number(host.len() as u64));
        scope.check("memcpy_htod", scope.driver().memcpy_htod(ptr, host))
    }

    /// Downloads rows `y..y + h` of `w` elements of `elem` bytes each.
    ///
    /// When `mem` is not resident the range is zero-filled instead.
    pub fn copy_from_device(
        &self,
        scope: &ContextScope<'_>,
        mem: &mut DeviceMemory,
        y: usize,
        w: usize,
        h: usize,
        elem: usize,
    ) -> Result<(), DeviceError> {
        scope.ensure_clear()?;

        let offset = elem * y * w;
        let size = elem * w * h;
        let residency = mem.residency;
        let name = mem.name().to_string();
        let host = mem
            .host_mut()
            .and_then(|host| host.get_mut(offset..offset + size))
            .ok_or_else(|| invalid(scope, format!("rows {y}..{} are outside the host copy of \"{name}\"", y + h)))?;

        match residency {
            Some(Residency::Buffer(ptr)) => {
                scope.check("memcpy_dtoh", scope.driver().memcpy_dtoh(host, ptr.offset(offset as u64)))
            }
            Some(_) => Err(invalid(scope, format!("\"{name}\" is not a linear buffer"))),
            None => {
                host.fill(0);
                Ok(())
            }
        }
    }

    /// Zeroes the host copy and the device allocation, allocating if needed.
    pub fn zero(&mut self, scope: &ContextScope<'_>, mem: &mut DeviceMemory) -> Result<(), DeviceError> {
        scope.ensure_clear()?;

        if !mem.is_resident() {
            self.alloc(scope, mem)?;
        }
        if let Some(host) = mem.host_mut() {
            host.fill(0);
        }

        let bytes = mem.device_size;
        match mem.residency {
            Some(Residency::Buffer(ptr)) => scope.check("memset_d8", scope.driver().memset_d8(ptr, 0, bytes)),
            Some(residency @ Residency::Display(_)) => {
                let ptr = self.map_pixels(scope, residency)?;
                let result = scope.check("memset_d8", scope.driver().memset_d8(ptr, 0, bytes));
                self.unmap_pixels(scope, residency)?;
                result
            }
            _ => Err(invalid(scope, format!("\"{}\" cannot be zeroed", mem.name()))),
        }
    }

    /// Releases `mem` whatever its kind. Freeing twice is a no-op.
    pub fn free(
        &mut self,
        scope: &ContextScope<'_>,
        mem: &mut DeviceMemory,
        interop: Option<&dyn DisplayInterop>,
    ) -> Result<(), DeviceError> {
        let Some(residency) = mem.residency.take() else {
            return Ok(());
        };
        let bytes = std::mem::take(&mut mem.device_size);
        self.stats.mem_free(bytes);

        let driver = scope.driver();
        match (residency, self.registry.remove(&residency)) {
            (Residency::Buffer(ptr), _) => scope.check("mem_free", driver.mem_free(ptr)),
            (Residency::Array(array), Some(Registration::Texture { binding })) => {
                let object = match binding {
                    TextureBinding::Object { object, slot } => {
                        self.slots.clear(slot);
                        scope.check("texture_object_destroy", driver.texture_object_destroy(object))
                    }
                    _ => Ok(()),
                };
                // The array goes even when its object did not.
                let array = scope.check("array_destroy", driver.array_destroy(array));
                object.and(array)
            }
            (Residency::Array(array), _) => scope.check("array_destroy", driver.array_destroy(array)),
            (Residency::Display(buffer), registration) => {
                let result = match registration {
                    Some(Registration::Pixels { resource, .. }) => {
                        scope.check("graphics_unregister", driver.graphics_unregister(resource))
                    }
                    _ => Ok(()),
                };
                if let Some(interop) = interop {
                    interop.destroy_pixel_buffer(buffer);
                }
                result
            }
        }
    }

    /// Device pointer `offset` elements into a resident linear allocation.
    pub fn sub_ptr(&self, mem: &DeviceMemory, offset: usize) -> Option<DevicePtr> {
        mem.device_ptr().map(|ptr| ptr.offset((offset * mem.element_size()) as u64))
    }

    /// Writes `data` into the module global `name`.
    pub fn const_copy_to(
        &self,
        scope: &ContextScope<'_>,
        module: ModuleHandle,
        name: &str,
        data: &[u8],
    ) -> Result<(), DeviceError> {
        scope.ensure_clear()?;
        let (ptr, size) = scope.check("module_global", scope.driver().module_global(module, name))?;
        if data.len() > size {
            return Err(invalid(
                scope,
                format!("{} bytes do not fit the {size}-byte global \"{name}\"", data.len()),
            ));
        }
        scope.check("memcpy_htod", scope.driver().memcpy_htod(ptr, data))
    }

    // ── textures ────────────────────────────────────────────────────────────

    /// Uploads a texture and binds it for kernels.
    ///
    /// Uninterpolated data becomes a linear buffer whose address is written to
    /// the render module global of the same name. Everything else goes into a
    /// 1D/2D/3D array sampled through a bindless object (slot parsed from the
    /// name) or a legacy texture reference of the render module.
    pub fn tex_alloc(
        &mut self,
        scope: &ContextScope<'_>,
        render: Option<ModuleHandle>,
        mem: &mut DeviceMemory,
    ) -> Result<(), DeviceError> {
        scope.ensure_clear()?;
        if mem.is_resident() {
            self.free(scope, mem, None)?;
        }

        if mem.interpolation == Interpolation::None {
            return self.tex_alloc_linear(scope, render, mem);
        }

        let driver = scope.driver();
        let host = mem
            .host()
            .ok_or_else(|| invalid(scope, format!("texture \"{}\" has no host data", mem.name())))?;
        let format = mem
            .data_type()
            .array_format()
            .ok_or_else(|| invalid(scope, format!("texture \"{}\" has an unsupported element type", mem.name())))?;

        let dims = mem.dimensions();
        let [width, height, depth] = mem.extent();
        let desc = ArrayDesc {
            width,
            height: if dims >= 2 { height } else { 0 },
            depth: if dims == 3 { depth } else { 0 },
            format,
            channels: mem.channels(),
        };
        let bytes = mem.memory_size();
        log::debug!(
            "Texture allocate: {}, {} bytes ({}), {}D",
            mem.name(),
            human_number(bytes as u64),
            human_size(bytes),
            dims
        );

        let array = driver.array_create(&desc).map_err(|source| {
            scope.errors().raise(DeviceError::Allocation {
                name: mem.name().to_string(),
                bytes,
                source,
            })
        })?;

        let binding = match self.bind_array(scope, render, mem, array, host) {
            Ok(binding) => binding,
            Err(e) => {
                let _ = driver.array_destroy(array);
                return Err(e);
            }
        };

        mem.residency = Some(Residency::Array(array));
        mem.device_size = bytes;
        self.registry.insert(Residency::Array(array), Registration::Texture { binding });
        self.stats.mem_alloc(bytes);
        Ok(())
    }

    /// Releases a texture uploaded with [`tex_alloc`](Self::tex_alloc),
    /// emptying its bindless slot.
    pub fn tex_free(&mut self, scope: &ContextScope<'_>, mem: &mut DeviceMemory) -> Result<(), DeviceError> {
        if mem.kind() != MemoryKind::Texture {
            return Err(invalid(scope, format!("\"{}\" is not a texture", mem.name())));
        }
        self.free(scope, mem, None)
    }

    fn bind_array(
        &mut self,
        scope: &ContextScope<'_>,
        render: Option<ModuleHandle>,
        mem: &DeviceMemory,
        array: ArrayHandle,
        host: &[u8],
    ) -> Result<TextureBinding, DeviceError> {
        let driver = scope.driver();
        scope.check("array_upload", driver.array_upload(array, host))?;
        let sampling = sampling(mem.interpolation, mem.extension);

        if self.bindless {
            let slot = texture_slot(mem.name())
                .ok_or_else(|| invalid(scope, format!("texture \"{}\" does not name a slot", mem.name())))?;
            let object = scope.check("texture_object_create", driver.texture_object_create(array, sampling))?;
            self.slots.insert(
                slot,
                TextureInfo {
                    data: object.raw().get(),
                    interpolation: mem.interpolation as u32,
                    extension: mem.extension as u32,
                    width: mem.extent()[0],
                    height: mem.height(),
                    depth: mem.depth(),
                    _pad: 0,
                },
            );
            Ok(TextureBinding::Object { object, slot })
        } else {
            let module = render_module(scope, render)?;
            let bind_name = legacy_bind_name(mem.name(), mem.dimensions());
            scope.check("texture_ref_bind", driver.texture_ref_bind(module, &bind_name, array, sampling))?;
            Ok(TextureBinding::Reference(bind_name))
        }
    }

    fn tex_alloc_linear(
        &mut self,
        scope: &ContextScope<'_>,
        render: Option<ModuleHandle>,
        mem: &mut DeviceMemory,
    ) -> Result<(), DeviceError> {
        let module = render_module(scope, render)?;
        self.copy_to_device(scope, mem)?;
        let ptr = resident_ptr(scope, mem)?;

        let (global, size) = scope.check("module_global", scope.driver().module_global(module, mem.name()))?;
        let addr = ptr.addr();
        let written = match size {
            8 => scope.driver().memcpy_htod(global, &addr.to_ne_bytes()),
            4 => scope.driver().memcpy_htod(global, &(addr as u32).to_ne_bytes()),
            _ => Err(DriverError::InvalidValue(format!(
                "global \"{}\" is {size} bytes, expected a pointer",
                mem.name()
            ))),
        };
        scope.check("memcpy_htod", written)?;

        self.registry.insert(
            Residency::Buffer(ptr),
            Registration::Texture {
                binding: TextureBinding::Global(mem.name().to_string()),
            },
        );
        Ok(())
    }

    /// Uploads the texture slot array if it changed since the last sync.
    pub fn load_texture_info(&mut self, scope: &ContextScope<'_>, render: Option<ModuleHandle>) -> Result<(), DeviceError> {
        if !self.bindless || !self.slots.is_dirty() {
            return Ok(());
        }
        let Some(mut buffer) = self.slot_buffer.take() else {
            return Ok(());
        };

        buffer.set_host(self.slots.as_slice());
        let result = self.tex_alloc_linear(scope, render, &mut buffer);
        self.slot_buffer = Some(buffer);

        if result.is_ok() {
            self.slots.mark_clean();
        }
        result
    }

    /// Frees the device copy of the texture slot array.
    pub(crate) fn release_texture_info(&mut self, scope: &ContextScope<'_>) -> Result<(), DeviceError> {
        let Some(mut buffer) = self.slot_buffer.take() else {
            return Ok(());
        };
        let result = self.free(scope, &mut buffer, None);
        self.slot_buffer = Some(buffer);
        result
    }

    // ── pixel interop ───────────────────────────────────────────────────────

    /// Creates a display-shareable buffer for `mem` and registers it.
    ///
    /// Any failure is reported as [`PixelAlloc::Fallback`] with nothing left
    /// allocated; the caller then switches to offscreen mode.
    pub fn pixels_alloc(
        &mut self,
        scope: &ContextScope<'_>,
        interop: &dyn DisplayInterop,
        mem: &mut DeviceMemory,
    ) -> Result<PixelAlloc, DeviceError> {
        scope.ensure_clear()?;
        if mem.is_resident() {
            self.free(scope, mem, Some(interop))?;
        }

        let format = pixel_format(mem);
        let bytes = mem.memory_size();
        let Some(buffer) = interop.create_pixel_buffer(mem.extent()[0], mem.height(), format) else {
            log::warn!("display refused a pixel buffer for \"{}\"", mem.name());
            return Ok(PixelAlloc::Fallback);
        };

        match scope.driver().graphics_register_buffer(buffer.pixel_buffer, bytes) {
            Ok(resource) => {
                log::debug!("Pixel buffer allocate: {}, {}x{}", mem.name(), mem.width(), mem.height());
                mem.residency = Some(Residency::Display(buffer));
                mem.device_size = bytes;
                self.registry
                    .insert(Residency::Display(buffer), Registration::Pixels { resource, format });
                self.stats.mem_alloc(bytes);
                Ok(PixelAlloc::Shared)
            }
            Err(e) => {
                log::warn!("failed to register display buffer for \"{}\": {e}", mem.name());
                interop.destroy_pixel_buffer(buffer);
                Ok(PixelAlloc::Fallback)
            }
        }
    }

    /// Reads rows `y..y + h` of `w` pixels back from a shared display buffer.
    pub fn pixels_copy_from(
        &self,
        scope: &ContextScope<'_>,
        interop: &dyn DisplayInterop,
        mem: &mut DeviceMemory,
        y: usize,
        w: usize,
        h: usize,
    ) -> Result<(), DeviceError> {
        scope.ensure_clear()?;
        let Some(Residency::Display(buffer)) = mem.residency else {
            return Err(invalid(scope, format!("\"{}\" is not a display buffer", mem.name())));
        };

        let bpp = pixel_format(mem).bytes_per_pixel();
        let offset = bpp * y * w;
        let size = bpp * w * h;
        let name = mem.name().to_string();
        let host = mem
            .host_mut()
            .and_then(|host| host.get_mut(offset..offset + size))
            .ok_or_else(|| invalid(scope, format!("rows {y}..{} are outside \"{name}\"", y + h)))?;

        if interop.read_pixels(buffer, offset, host) {
            Ok(())
        } else {
            Err(scope.errors().raise(DeviceError::Runtime {
                call: "read_pixels",
                source: DriverError::InteropUnavailable,
            }))
        }
    }

    /// Device pointer kernels write pixels through, mapping a shared buffer.
    pub fn map_pixels(&self, scope: &ContextScope<'_>, residency: Residency) -> Result<DevicePtr, DeviceError> {
        match (residency, self.registry.get(&residency)) {
            (Residency::Buffer(ptr), _) => Ok(ptr),
            (Residency::Display(_), Some(Registration::Pixels { resource, .. })) => {
                scope.check("graphics_map", scope.driver().graphics_map(*resource))
            }
            _ => Err(invalid(scope, format!("{residency:?} is not a pixel buffer"))),
        }
    }

    pub fn unmap_pixels(&self, scope: &ContextScope<'_>, residency: Residency) -> Result<(), DeviceError> {
        match (residency, self.registry.get(&residency)) {
            (Residency::Display(_), Some(Registration::Pixels { resource, .. })) => {
                scope.check("graphics_unmap", scope.driver().graphics_unmap(*resource))
            }
            _ => Ok(()),
        }
    }

    /// Format of a shared display buffer, if `residency` is one.
    pub fn display_format(&self, residency: Residency) -> Option<(DisplayBuffer, PixelFormat)> {
        match (residency, self.registry.get(&residency)) {
            (Residency::Display(buffer), Some(Registration::Pixels { format, .. })) => Some((buffer, *format)),
            _ => None,
        }
    }
}

fn invalid(scope: &ContextScope<'_>, message: String) -> DeviceError {
    scope.errors().raise(DeviceError::InvalidRequest(message))
}

fn resident_ptr(scope: &ContextScope<'_>, mem: &DeviceMemory) -> Result<DevicePtr, DeviceError> {
    mem.device_ptr()
        .ok_or_else(|| invalid(scope, format!("\"{}\" is not a resident linear buffer", mem.name())))
}

fn render_module(scope: &ContextScope<'_>, render: Option<ModuleHandle>) -> Result<ModuleHandle, DeviceError> {
    render.ok_or_else(|| invalid(scope, "render module is not loaded".to_string()))
}

pub(crate) fn pixel_format(mem: &DeviceMemory) -> PixelFormat {
    match mem.data_type() {
        DataType::Half => PixelFormat::RgbaHalf,
        _ => PixelFormat::Rgba8,
    }
}

fn sampling(interpolation: Interpolation, extension: Extension) -> Sampling {
    Sampling {
        address: match extension {
            Extension::Repeat => AddressMode::Wrap,
            Extension::Extend => AddressMode::Clamp,
            Extension::Clip => AddressMode::Border,
        },
        filter: match interpolation {
            Interpolation::Closest => FilterMode::Point,
            _ => FilterMode::Linear,
        },
        normalized_coords: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceContext;
    use crate::driver::emulated::{EmulatedDevice, EmulatedDriver, ModuleImage};
    use crate::driver::Driver;

    struct Fixture {
        driver: Arc<EmulatedDriver>,
        ctx: DeviceContext,
    }

    fn fixture() -> Fixture {
        let driver = Arc::new(EmulatedDriver::new(vec![EmulatedDevice::new("test").memory(1 << 20)]));
        driver.register_image(
            ModuleImage::new("render")
                .global("__lookup_table", 8)
                .global("__narrow", 4)
                .global("__odd", 2)
                .global(kernels::TEXTURE_INFO, 8)
                .texture_ref("__tex_image_float4_001")
                .texture_ref("__tex_image_float4_3d_002"),
        );
        let ctx = DeviceContext::create(driver.clone(), 0, false);
        Fixture { driver, ctx }
    }

    fn manager(bindless: bool) -> MemoryManager {
        MemoryManager::new(bindless, 128, Arc::new(MemStats::new()))
    }

    fn load_render(scope: &ContextScope<'_>) -> ModuleHandle {
        scope.driver().module_load(b"render").unwrap()
    }

    // ── linear ──────────────────────────────────────────────────────────────

    #[test]
    fn linear_round_trip() {
        let fx = fixture();
        let scope = ContextScope::enter(&fx.ctx);
        let mut mm = manager(true);

        let mut mem = DeviceMemory::from_slice("values", DataType::F32, 1, &[1.0f32, 2.0, 3.0, 4.0]);
        mm.copy_to_device(&scope, &mut mem).unwrap();
        assert!(mem.is_resident());
        assert_eq!(mm.tracked(), 1);

        mem.host_mut().unwrap().fill(0);
        mm.copy_from_device(&scope, &mut mem, 0, 4, 1, 4).unwrap();
        assert_eq!(mem.read_host::<f32>(), vec![1.0, 2.0, 3.0, 4.0]);

        mm.free(&scope, &mut mem, None).unwrap();
        assert_eq!(fx.driver.bytes_in_use(), 0);
        assert_eq!(mm.stats().current(), 0);
    }

    #[test]
    fn partial_download_reads_only_requested_rows() {
        let fx = fixture();
        let scope = ContextScope::enter(&fx.ctx);
        let mut mm = manager(true);

        let data: Vec<u32> = (0..12).collect();
        let mut mem = DeviceMemory::from_slice("grid", DataType::U32, 1, &data);
        mm.copy_to_device(&scope, &mut mem).unwrap();
        mem.host_mut().unwrap().fill(0);

        mm.copy_from_device(&scope, &mut mem, 1, 4, 1, 4).unwrap();
        assert_eq!(mem.read_host::<u32>(), vec![0, 0, 0, 0, 4, 5, 6, 7, 0, 0, 0, 0]);
    }

    #[test]
    fn download_of_non_resident_memory_zero_fills() {
        let fx = fixture();
        let scope = ContextScope::enter(&fx.ctx);
        let mm = manager(true);

        let mut mem = DeviceMemory::from_slice("stale", DataType::U8, 1, &[7u8; 8]);
        mm.copy_from_device(&scope, &mut mem, 0, 8, 1, 1).unwrap();
        assert_eq!(mem.host(), Some(&[0u8; 8][..]));
    }

    #[test]
    fn free_twice_is_a_no_op() {
        let fx = fixture();
        let scope = ContextScope::enter(&fx.ctx);
        let mut mm = manager(true);

        let mut mem = DeviceMemory::linear("once", DataType::U8, 1, 64);
        mm.alloc(&scope, &mut mem).unwrap();
        mm.free(&scope, &mut mem, None).unwrap();
        mm.free(&scope, &mut mem, None).unwrap();

        assert!(!mem.is_resident());
        assert_eq!(mem.device_size(), 0);
        assert_eq!(mm.tracked(), 0);
        assert!(!fx.ctx.errors().have_error());
    }

    #[test]
    fn resize_reallocates() {
        let fx = fixture();
        let scope = ContextScope::enter(&fx.ctx);
        let mut mm = manager(true);

        let mut mem = DeviceMemory::linear("grow", DataType::F32, 1, 4);
        mm.zero(&scope, &mut mem).unwrap();
        mem.resize(16, 1, 1);
        mm.alloc(&scope, &mut mem).unwrap();

        assert_eq!(mem.device_size(), 64);
        assert_eq!(fx.driver.bytes_in_use(), 64);
        assert_eq!(mm.tracked(), 1);
    }

    #[test]
    fn sub_ptr_offsets_by_elements() {
        let fx = fixture();
        let scope = ContextScope::enter(&fx.ctx);
        let mut mm = manager(true);

        let mut mem = DeviceMemory::linear("pairs", DataType::F32, 2, 8);
        assert_eq!(mm.sub_ptr(&mem, 1), None);
        mm.alloc(&scope, &mut mem).unwrap();

        let base = mem.device_ptr().unwrap();
        assert_eq!(mm.sub_ptr(&mem, 3), Some(base.offset(24)));
    }

    #[test]
    fn allocation_failure_is_latched() {
        let fx = fixture();
        let scope = ContextScope::enter(&fx.ctx);
        let mut mm = manager(true);

        let mut huge = DeviceMemory::linear("huge", DataType::U8, 1, 4 << 20).device_only();
        let err = mm.alloc(&scope, &mut huge).unwrap_err();
        assert!(matches!(err, DeviceError::Allocation { bytes, .. } if bytes == 4 << 20));
        assert!(!huge.is_resident());
        assert!(fx.ctx.errors().message().is_some_and(|m| m.contains("\"huge\"")));

        let mut small = DeviceMemory::linear("small", DataType::U8, 1, 4);
        assert!(matches!(mm.alloc(&scope, &mut small), Err(DeviceError::Aborted(_))));
    }

    // ── textures ────────────────────────────────────────────────────────────

    #[test]
    fn uninterpolated_texture_writes_pointer_global() {
        let fx = fixture();
        let scope = ContextScope::enter(&fx.ctx);
        let mut mm = manager(true);
        let render = load_render(&scope);

        let mut wide = DeviceMemory::texture("__lookup_table", DataType::F32, 1, 16, 1, 1)
            .with_interpolation(Interpolation::None);
        mm.tex_alloc(&scope, Some(render), &mut wide).unwrap();

        let (global, _) = fx.driver.module_global(render, "__lookup_table").unwrap();
        let mut stored = [0u8; 8];
        fx.driver.memcpy_dtoh(&mut stored, global).unwrap();
        assert_eq!(u64::from_ne_bytes(stored), wide.device_ptr().unwrap().addr());

        let mut narrow = DeviceMemory::texture("__narrow", DataType::F32, 1, 4, 1, 1)
            .with_interpolation(Interpolation::None);
        mm.tex_alloc(&scope, Some(render), &mut narrow).unwrap();
        let (global, _) = fx.driver.module_global(render, "__narrow").unwrap();
        let mut stored = [0u8; 4];
        fx.driver.memcpy_dtoh(&mut stored, global).unwrap();
        assert_eq!(u32::from_ne_bytes(stored), narrow.device_ptr().unwrap().addr() as u32);

        let mut odd = DeviceMemory::texture("__odd", DataType::F32, 1, 4, 1, 1)
            .with_interpolation(Interpolation::None);
        assert!(mm.tex_alloc(&scope, Some(render), &mut odd).is_err());
    }

    #[test]
    fn bindless_texture_fills_its_slot() {
        let fx = fixture();
        let scope = ContextScope::enter(&fx.ctx);
        let mut mm = manager(true);
        let render = load_render(&scope);

        let mut tex = DeviceMemory::texture("__tex_image_float4_130", DataType::F32, 4, 4, 4, 1)
            .with_interpolation(Interpolation::Closest)
            .with_extension(Extension::Clip);
        mm.tex_alloc(&scope, Some(render), &mut tex).unwrap();

        let slots = mm.texture_slots();
        assert_eq!(slots.len(), 256);
        assert!(slots.is_dirty());
        let info = *slots.get(130).unwrap();
        assert_ne!(info.data, 0);
        assert_eq!((info.width, info.height, info.depth), (4, 4, 1));
        assert_eq!(info.interpolation, Interpolation::Closest as u32);
        assert_eq!(info.extension, Extension::Clip as u32);

        mm.load_texture_info(&scope, Some(render)).unwrap();
        assert!(!mm.texture_slots().is_dirty());

        let (global, _) = fx.driver.module_global(render, kernels::TEXTURE_INFO).unwrap();
        let mut stored = [0u8; 8];
        fx.driver.memcpy_dtoh(&mut stored, global).unwrap();
        let table = DevicePtr::new(u64::from_ne_bytes(stored)).unwrap();
        let mut bytes = vec![0u8; size_of::<TextureInfo>()];
        fx.driver
            .memcpy_dtoh(&mut bytes, table.offset(130 * size_of::<TextureInfo>() as u64))
            .unwrap();
        assert_eq!(bytemuck::pod_read_unaligned::<TextureInfo>(&bytes), info);

        mm.tex_free(&scope, &mut tex).unwrap();
        mm.tex_free(&scope, &mut tex).unwrap();
        assert_eq!(fx.driver.live_objects(), (0, 0));
        assert_eq!(mm.texture_slots().get(130), Some(&TextureInfo::default()));

        let mut linear = DeviceMemory::linear("plain", DataType::F32, 1, 4);
        assert!(mm.tex_free(&scope, &mut linear).is_err());
    }

    #[test]
    fn a_failed_object_destroy_still_destroys_the_array() {
        let fx = fixture();
        let scope = ContextScope::enter(&fx.ctx);
        let mut mm = manager(true);
        let render = load_render(&scope);

        let mut tex = DeviceMemory::texture("__tex_image_float4_007", DataType::F32, 4, 2, 2, 1);
        mm.tex_alloc(&scope, Some(render), &mut tex).unwrap();
        let object = mm
            .registry
            .values()
            .find_map(|r| match r {
                Registration::Texture {
                    binding: TextureBinding::Object { object, .. },
                } => Some(*object),
                _ => None,
            })
            .unwrap();

        // Pull the object out from under the manager.
        fx.driver.texture_object_destroy(object).unwrap();
        assert_eq!(fx.driver.live_objects(), (1, 0));

        assert!(mm.tex_free(&scope, &mut tex).is_err());
        assert!(!tex.is_resident());
        assert_eq!(fx.driver.live_objects(), (0, 0));
        assert_eq!(mm.tracked(), 0);
    }

    #[test]
    fn legacy_textures_bind_references() {
        let fx = fixture();
        let scope = ContextScope::enter(&fx.ctx);
        let mut mm = manager(false);
        let render = load_render(&scope);

        let mut flat = DeviceMemory::texture("__tex_image_float4_001", DataType::F32, 4, 2, 2, 1);
        let mut volume = DeviceMemory::texture("__tex_image_float4_002", DataType::F32, 4, 2, 2, 2);
        mm.tex_alloc(&scope, Some(render), &mut flat).unwrap();
        mm.tex_alloc(&scope, Some(render), &mut volume).unwrap();

        assert_eq!(
            fx.driver.bound_texture_refs(render),
            vec!["__tex_image_float4_001".to_string(), "__tex_image_float4_3d_002".to_string()]
        );
        assert!(mm.texture_slots().is_empty());

        let mut unknown = DeviceMemory::texture("__tex_image_float4_009", DataType::F32, 4, 2, 2, 1);
        assert!(mm.tex_alloc(&scope, Some(render), &mut unknown).is_err());
        assert_eq!(fx.driver.live_objects(), (2, 0));
    }

    // ── pixels ──────────────────────────────────────────────────────────────

    #[test]
    fn pixels_share_display_buffers() {
        let fx = fixture();
        let display = fx.driver.display();
        let scope = ContextScope::enter(&fx.ctx);
        let mut mm = manager(true);

        let mut rgba = DeviceMemory::pixels("rgba", PixelFormat::Rgba8, 4, 4);
        assert_eq!(mm.pixels_alloc(&scope, &display, &mut rgba).unwrap(), PixelAlloc::Shared);
        let residency = rgba.residency().unwrap();

        let ptr = mm.map_pixels(&scope, residency).unwrap();
        fx.driver.memset_d8(ptr.offset(16), 200, 16).unwrap();
        mm.unmap_pixels(&scope, residency).unwrap();

        mm.pixels_copy_from(&scope, &display, &mut rgba, 1, 4, 1).unwrap();
        let host = rgba.host().unwrap();
        assert_eq!(host[..16], [0; 16]);
        assert_eq!(host[16..32], [200; 16]);

        mm.free(&scope, &mut rgba, Some(&display)).unwrap();
        assert_eq!(display.buffer_count(), 0);
    }

    #[test]
    fn pixels_fall_back_without_interop() {
        let driver = Arc::new(EmulatedDriver::new(vec![EmulatedDevice::new("headless").interop(false)]));
        let display = driver.display();
        let ctx = DeviceContext::create(driver.clone(), 0, false);
        let scope = ContextScope::enter(&ctx);
        let mut mm = manager(true);

        let mut rgba = DeviceMemory::pixels("rgba", PixelFormat::Rgba8, 4, 4);
        assert_eq!(mm.pixels_alloc(&scope, &display, &mut rgba).unwrap(), PixelAlloc::Fallback);
        assert!(!rgba.is_resident());
        assert_eq!(display.buffer_count(), 0);
        assert!(!ctx.errors().have_error());
    }
}
