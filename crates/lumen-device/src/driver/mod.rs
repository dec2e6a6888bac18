//! GPU driver abstraction.
//!
//! The backend talks to the GPU only through the [`Driver`] trait: context
//! management, linear memory, module loading, launches, arrays and textures,
//! and display interop. Two implementations ship with the crate:
//! - [`emulated::EmulatedDriver`]: host-memory device running reference kernels
//! - `wgpu_driver::WgpuDriver` (feature `wgpu`): compute-only driver over wgpu

mod types;

pub mod emulated;
#[cfg(feature = "wgpu")]
pub mod wgpu_driver;

pub use types::{
    AddressMode, ArrayDesc, ArrayFormat, ArrayHandle, CachePreference, ContextFlags,
    ContextHandle, DeviceAttributes, DevicePtr, Dim3, DriverError, FilterMode, FunctionHandle,
    GraphicsResource, KernelArg, MemInfo, ModuleHandle, Occupancy, Sampling, TextureObject,
};

/// Low-level GPU driver operations.
///
/// Contexts are stacked per thread: [`context_push`](Driver::context_push)
/// makes a context current on the calling thread and
/// [`context_pop`](Driver::context_pop) restores the previous one. Every memory,
/// module and launch call acts on the calling thread's current context and
/// fails with [`DriverError::NoCurrentContext`] when there is none.
pub trait Driver: Send + Sync {
    /// Short backend name used in logs.
    fn name(&self) -> &str;

    // ── devices & contexts ──────────────────────────────────────────────────

    fn device_count(&self) -> Result<usize, DriverError>;
    fn device_attributes(&self, ordinal: usize) -> Result<DeviceAttributes, DriverError>;

    /// Creates a context on device `ordinal`. The new context is not current.
    fn context_create(&self, ordinal: usize, flags: ContextFlags) -> Result<ContextHandle, DriverError>;
    fn context_destroy(&self, ctx: ContextHandle) -> Result<(), DriverError>;
    fn context_push(&self, ctx: ContextHandle) -> Result<(), DriverError>;
    fn context_pop(&self) -> Result<ContextHandle, DriverError>;

    /// Blocks until all work submitted in the current context has finished.
    fn synchronize(&self) -> Result<(), DriverError>;

    // ── linear memory ───────────────────────────────────────────────────────

    fn mem_alloc(&self, bytes: usize) -> Result<DevicePtr, DriverError>;
    fn mem_free(&self, ptr: DevicePtr) -> Result<(), DriverError>;
    fn memcpy_htod(&self, dst: DevicePtr, src: &[u8]) -> Result<(), DriverError>;
    fn memcpy_dtoh(&self, dst: &mut [u8], src: DevicePtr) -> Result<(), DriverError>;
    fn memset_d8(&self, dst: DevicePtr, value: u8, bytes: usize) -> Result<(), DriverError>;
    fn mem_info(&self) -> Result<MemInfo, DriverError>;

    // ── modules & launches ──────────────────────────────────────────────────

    /// Loads a compiled module image.
    fn module_load(&self, image: &[u8]) -> Result<ModuleHandle, DriverError>;
    fn module_unload(&self, module: ModuleHandle) -> Result<(), DriverError>;
    fn module_function(&self, module: ModuleHandle, name: &str) -> Result<FunctionHandle, DriverError>;

    /// Address and size in bytes of a module global.
    fn module_global(&self, module: ModuleHandle, name: &str) -> Result<(DevicePtr, usize), DriverError>;

    fn function_max_threads(&self, func: FunctionHandle) -> Result<u32, DriverError>;

    fn function_set_cache_preference(
        &self,
        _func: FunctionHandle,
        _preference: CachePreference,
    ) -> Result<(), DriverError> {
        Ok(())
    }

    /// Launch configuration that maximizes occupancy for `func`.
    fn occupancy(&self, func: FunctionHandle) -> Result<Occupancy, DriverError>;

    fn launch(&self, func: FunctionHandle, grid: Dim3, block: Dim3, args: &[KernelArg]) -> Result<(), DriverError>;

    // ── arrays & textures ───────────────────────────────────────────────────

    fn array_create(&self, desc: &ArrayDesc) -> Result<ArrayHandle, DriverError>;
    fn array_upload(&self, array: ArrayHandle, src: &[u8]) -> Result<(), DriverError>;
    fn array_destroy(&self, array: ArrayHandle) -> Result<(), DriverError>;

    /// Creates a bindless texture object sampling `array`.
    fn texture_object_create(&self, array: ArrayHandle, sampling: Sampling) -> Result<TextureObject, DriverError>;
    fn texture_object_destroy(&self, tex: TextureObject) -> Result<(), DriverError>;

    /// Binds `array` to the texture reference `name` declared by `module`.
    fn texture_ref_bind(
        &self,
        module: ModuleHandle,
        name: &str,
        array: ArrayHandle,
        sampling: Sampling,
    ) -> Result<(), DriverError>;

    // ── display interop ─────────────────────────────────────────────────────

    /// Registers the display-owned pixel buffer `display_buffer` of `bytes`.
    fn graphics_register_buffer(&self, display_buffer: u32, bytes: usize) -> Result<GraphicsResource, DriverError>;

    /// Maps a registered buffer for kernel access.
    fn graphics_map(&self, res: GraphicsResource) -> Result<DevicePtr, DriverError>;
    fn graphics_unmap(&self, res: GraphicsResource) -> Result<(), DriverError>;
    fn graphics_unregister(&self, res: GraphicsResource) -> Result<(), DriverError>;
}
