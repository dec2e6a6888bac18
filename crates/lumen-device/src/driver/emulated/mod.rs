//! Host-memory driver.
//!
//! `EmulatedDriver` implements [`Driver`] on top of ordinary host memory. It
//! keeps per-thread context stacks, byte-addressed allocations (interior
//! pointers included), texture arrays, texture objects and references, and
//! display buffers. Modules are [`ModuleImage`]s whose kernels are host
//! functions; [`reference`] provides images with CPU reference kernels for
//! everything the backend launches.
//!
//! Every launch is recorded, which lets tests assert on launch order and
//! launch shapes.

mod display;
mod heap;
mod image;
pub mod reference;

use std::collections::HashMap;
use std::num::NonZeroU64;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::ThreadId;

use heap::HostHeap;

pub use display::{DrawRecord, EmulatedDisplay};
pub use image::{KernelContext, KernelFn, ModuleImage};

use super::{
    ArrayDesc, ArrayHandle, ContextFlags, ContextHandle, DeviceAttributes, DevicePtr, Dim3,
    Driver, DriverError, FunctionHandle, GraphicsResource, KernelArg, MemInfo, ModuleHandle,
    Occupancy, Sampling, TextureObject,
};
use crate::module::{CompileError, CompileRequest, KernelCompiler};

/// Description of one emulated device.
#[derive(Debug, Clone)]
pub struct EmulatedDevice {
    pub attributes: DeviceAttributes,
    /// Accepts display-sharing contexts and buffer registration.
    pub interop: bool,
    pub occupancy: Occupancy,
}

impl EmulatedDevice {
    /// A compute 6.1 device with 256 MiB that does not drive a display.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            attributes: DeviceAttributes {
                name: name.into(),
                compute_major: 6,
                compute_minor: 1,
                pci_domain: 0,
                pci_bus: 1,
                pci_device: 0,
                kernel_exec_timeout: false,
                compute_preemption: true,
                multiprocessor_count: 8,
                max_threads_per_block: 1024,
                warp_size: 32,
                max_shared_memory_per_block: 48 * 1024,
                clock_rate_khz: 1_500_000,
                total_memory: 256 << 20,
            },
            interop: true,
            occupancy: Occupancy {
                min_grid_blocks: 8,
                block_size: 256,
            },
        }
    }

    pub fn compute(mut self, major: u32, minor: u32) -> Self {
        self.attributes.compute_major = major;
        self.attributes.compute_minor = minor;
        self
    }

    /// Marks the device as driving a display (watchdog on, no preemption).
    pub fn display(mut self, display: bool) -> Self {
        self.attributes.kernel_exec_timeout = display;
        self.attributes.compute_preemption = !display;
        self
    }

    pub fn memory(mut self, bytes: usize) -> Self {
        self.attributes.total_memory = bytes;
        self
    }

    pub fn interop(mut self, interop: bool) -> Self {
        self.interop = interop;
        self
    }

    pub fn occupancy(mut self, min_grid_blocks: u32, block_size: u32) -> Self {
        self.occupancy = Occupancy { min_grid_blocks, block_size };
        self
    }

    pub fn pci(mut self, domain: u32, bus: u32, device: u32) -> Self {
        self.attributes.pci_domain = domain;
        self.attributes.pci_bus = bus;
        self.attributes.pci_device = device;
        self
    }
}

/// One recorded kernel launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRecord {
    pub kernel: String,
    pub grid: Dim3,
    pub block: Dim3,
}

struct ContextRecord {
    ordinal: usize,
}

struct LoadedModule {
    image: Arc<ModuleImage>,
    globals: HashMap<String, (DevicePtr, usize)>,
    bound: HashMap<String, (ArrayHandle, Sampling)>,
}

struct FunctionRecord {
    module: ModuleHandle,
    name: String,
}

struct ArrayRecord {
    desc: ArrayDesc,
    data: Vec<u8>,
}

struct GraphicsRecord {
    backing: DevicePtr,
    mapped: bool,
}

#[derive(Default)]
struct HandleCounter(u64);

impl HandleCounter {
    fn next(&mut self) -> NonZeroU64 {
        self.0 += 1;
        NonZeroU64::MIN.saturating_add(self.0)
    }
}

pub(crate) struct EmulatedState {
    heap: HostHeap,
    handles: HandleCounter,
    contexts: HashMap<ContextHandle, ContextRecord>,
    stacks: HashMap<ThreadId, Vec<ContextHandle>>,
    images: HashMap<String, Arc<ModuleImage>>,
    modules: HashMap<ModuleHandle, LoadedModule>,
    functions: HashMap<FunctionHandle, FunctionRecord>,
    arrays: HashMap<ArrayHandle, ArrayRecord>,
    textures: HashMap<TextureObject, (ArrayHandle, Sampling)>,
    graphics: HashMap<GraphicsResource, GraphicsRecord>,
    display_buffers: HashMap<u32, DevicePtr>,
    draws: Vec<DrawRecord>,
    launches: Vec<LaunchRecord>,
}

impl EmulatedState {
    fn current(&self) -> Result<ContextHandle, DriverError> {
        self.stacks
            .get(&std::thread::current().id())
            .and_then(|stack| stack.last().copied())
            .ok_or(DriverError::NoCurrentContext)
    }

    fn current_ordinal(&self) -> Result<usize, DriverError> {
        let ctx = self.current()?;
        self.contexts
            .get(&ctx)
            .map(|c| c.ordinal)
            .ok_or(DriverError::InvalidContext)
    }
}

/// Host-memory implementation of [`Driver`].
pub struct EmulatedDriver {
    devices: Vec<EmulatedDevice>,
    state: Arc<Mutex<EmulatedState>>,
}

impl EmulatedDriver {
    pub fn new(devices: Vec<EmulatedDevice>) -> Self {
        let capacity = devices.iter().map(|d| d.attributes.total_memory).sum();
        Self {
            devices,
            state: Arc::new(Mutex::new(EmulatedState {
                heap: HostHeap::new(capacity),
                handles: HandleCounter::default(),
                contexts: HashMap::new(),
                stacks: HashMap::new(),
                images: HashMap::new(),
                modules: HashMap::new(),
                functions: HashMap::new(),
                arrays: HashMap::new(),
                textures: HashMap::new(),
                graphics: HashMap::new(),
                display_buffers: HashMap::new(),
                draws: Vec::new(),
                launches: Vec::new(),
            })),
        }
    }

    /// A single default device with the reference render and filter images.
    pub fn with_reference_images() -> Self {
        Self::new(vec![EmulatedDevice::new("Emulated GPU")]).reference_images()
    }

    /// Registers the reference render and filter images.
    pub fn reference_images(self) -> Self {
        self.register_image(reference::render_image());
        self.register_image(reference::filter_image());
        self
    }

    fn lock(&self) -> MutexGuard<'_, EmulatedState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Makes `image` loadable under its name.
    pub fn register_image(&self, image: ModuleImage) {
        self.lock().images.insert(image.name.clone(), Arc::new(image));
    }

    /// Display collaborator sharing this driver's memory.
    pub fn display(&self) -> EmulatedDisplay {
        EmulatedDisplay::new(Arc::clone(&self.state))
    }

    /// Launches recorded so far, oldest first.
    pub fn launches(&self) -> Vec<LaunchRecord> {
        self.lock().launches.clone()
    }

    /// Names of launched kernels, oldest first.
    pub fn launched_kernels(&self) -> Vec<String> {
        self.lock().launches.iter().map(|l| l.kernel.clone()).collect()
    }

    pub fn clear_launches(&self) {
        self.lock().launches.clear();
    }

    /// Bytes currently allocated across all contexts.
    pub fn bytes_in_use(&self) -> usize {
        self.lock().heap.used()
    }

    /// Live texture arrays and texture objects.
    pub fn live_objects(&self) -> (usize, usize) {
        let state = self.lock();
        (state.arrays.len(), state.textures.len())
    }

    /// Depth of the calling thread's context stack.
    pub fn context_depth(&self) -> usize {
        self.lock()
            .stacks
            .get(&std::thread::current().id())
            .map_or(0, Vec::len)
    }

    /// Texture references bound in `module`, by name.
    pub fn bound_texture_refs(&self, module: ModuleHandle) -> Vec<String> {
        let state = self.lock();
        let mut names: Vec<String> = state
            .modules
            .get(&module)
            .map(|m| m.bound.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    fn device(&self, ordinal: usize) -> Result<&EmulatedDevice, DriverError> {
        self.devices.get(ordinal).ok_or(DriverError::InvalidDevice(ordinal))
    }
}

impl Driver for EmulatedDriver {
    fn name(&self) -> &str {
        "emulated"
    }

    fn device_count(&self) -> Result<usize, DriverError> {
        Ok(self.devices.len())
    }

    fn device_attributes(&self, ordinal: usize) -> Result<DeviceAttributes, DriverError> {
        Ok(self.device(ordinal)?.attributes.clone())
    }

    fn context_create(&self, ordinal: usize, flags: ContextFlags) -> Result<ContextHandle, DriverError> {
        let device = self.device(ordinal)?;
        if flags.display_sharing && !device.interop {
            return Err(DriverError::InteropUnavailable);
        }

        let mut state = self.lock();
        let ctx = ContextHandle::from_raw(state.handles.next());
        state.contexts.insert(ctx, ContextRecord { ordinal });
        Ok(ctx)
    }

    fn context_destroy(&self, ctx: ContextHandle) -> Result<(), DriverError> {
        let mut state = self.lock();
        state.contexts.remove(&ctx).ok_or(DriverError::InvalidContext)?;
        for stack in state.stacks.values_mut() {
            stack.retain(|c| *c != ctx);
        }
        Ok(())
    }

    fn context_push(&self, ctx: ContextHandle) -> Result<(), DriverError> {
        let mut state = self.lock();
        if !state.contexts.contains_key(&ctx) {
            return Err(DriverError::InvalidContext);
        }
        state
            .stacks
            .entry(std::thread::current().id())
            .or_default()
            .push(ctx);
        Ok(())
    }

    fn context_pop(&self) -> Result<ContextHandle, DriverError> {
        let mut state = self.lock();
        state
            .stacks
            .get_mut(&std::thread::current().id())
            .and_then(Vec::pop)
            .ok_or(DriverError::NoCurrentContext)
    }

    fn synchronize(&self) -> Result<(), DriverError> {
        // Launches run to completion inside `launch`.
        self.lock().current().map(|_| ())
    }

    fn mem_alloc(&self, bytes: usize) -> Result<DevicePtr, DriverError> {
        let mut state = self.lock();
        let ordinal = state.current_ordinal()?;
        let total = self.device(ordinal)?.attributes.total_memory;
        if state.heap.used() + bytes > total {
            return Err(DriverError::OutOfMemory { requested: bytes });
        }
        state.heap.alloc(bytes)
    }

    fn mem_free(&self, ptr: DevicePtr) -> Result<(), DriverError> {
        let mut state = self.lock();
        state.current()?;
        state.heap.free(ptr)
    }

    fn memcpy_htod(&self, dst: DevicePtr, src: &[u8]) -> Result<(), DriverError> {
        let mut state = self.lock();
        state.current()?;
        state.heap.bytes_mut(dst, src.len())?.copy_from_slice(src);
        Ok(())
    }

    fn memcpy_dtoh(&self, dst: &mut [u8], src: DevicePtr) -> Result<(), DriverError> {
        let state = self.lock();
        state.current()?;
        dst.copy_from_slice(state.heap.bytes(src, dst.len())?);
        Ok(())
    }

    fn memset_d8(&self, dst: DevicePtr, value: u8, bytes: usize) -> Result<(), DriverError> {
        let mut state = self.lock();
        state.current()?;
        state.heap.bytes_mut(dst, bytes)?.fill(value);
        Ok(())
    }

    fn mem_info(&self) -> Result<MemInfo, DriverError> {
        let state = self.lock();
        let total = self.device(state.current_ordinal()?)?.attributes.total_memory;
        let used = state.heap.used().min(state.heap.capacity());
        Ok(MemInfo {
            free: total.saturating_sub(used),
            total,
        })
    }

    fn module_load(&self, image: &[u8]) -> Result<ModuleHandle, DriverError> {
        let name = std::str::from_utf8(image)
            .map_err(|_| DriverError::InvalidImage("image name is not UTF-8".into()))?
            .trim();

        let mut state = self.lock();
        state.current()?;
        let image = state
            .images
            .get(name)
            .cloned()
            .ok_or_else(|| DriverError::InvalidImage(format!("unknown image \"{name}\"")))?;

        let mut globals = HashMap::new();
        for (global, bytes) in &image.globals {
            let ptr = state.heap.alloc(*bytes)?;
            globals.insert(global.clone(), (ptr, *bytes));
        }

        let handle = ModuleHandle::from_raw(state.handles.next());
        state.modules.insert(
            handle,
            LoadedModule {
                image,
                globals,
                bound: HashMap::new(),
            },
        );
        Ok(handle)
    }

    fn module_unload(&self, module: ModuleHandle) -> Result<(), DriverError> {
        let mut state = self.lock();
        let loaded = state.modules.remove(&module).ok_or(DriverError::InvalidHandle)?;
        for (ptr, _) in loaded.globals.values() {
            state.heap.free(*ptr)?;
        }
        state.functions.retain(|_, f| f.module != module);
        Ok(())
    }

    fn module_function(&self, module: ModuleHandle, name: &str) -> Result<FunctionHandle, DriverError> {
        let mut state = self.lock();
        let loaded = state.modules.get(&module).ok_or(DriverError::InvalidHandle)?;
        if !loaded.image.kernels.contains_key(name) {
            return Err(DriverError::NotFound(name.to_string()));
        }

        let handle = FunctionHandle::from_raw(state.handles.next());
        state.functions.insert(
            handle,
            FunctionRecord {
                module,
                name: name.to_string(),
            },
        );
        Ok(handle)
    }

    fn module_global(&self, module: ModuleHandle, name: &str) -> Result<(DevicePtr, usize), DriverError> {
        let state = self.lock();
        let loaded = state.modules.get(&module).ok_or(DriverError::InvalidHandle)?;
        loaded
            .globals
            .get(name)
            .copied()
            .ok_or_else(|| DriverError::NotFound(name.to_string()))
    }

    fn function_max_threads(&self, func: FunctionHandle) -> Result<u32, DriverError> {
        let state = self.lock();
        let record = state.functions.get(&func).ok_or(DriverError::InvalidHandle)?;
        let image = &state.modules[&record.module].image;
        let device_limit = self.device(state.current_ordinal()?)?.attributes.max_threads_per_block;
        Ok(image.max_threads.min(device_limit))
    }

    fn occupancy(&self, func: FunctionHandle) -> Result<Occupancy, DriverError> {
        let state = self.lock();
        let record = state.functions.get(&func).ok_or(DriverError::InvalidHandle)?;
        let image = &state.modules[&record.module].image;
        match image.occupancy {
            Some(occupancy) => Ok(occupancy),
            None => Ok(self.device(state.current_ordinal()?)?.occupancy),
        }
    }

    fn launch(&self, func: FunctionHandle, grid: Dim3, block: Dim3, args: &[KernelArg]) -> Result<(), DriverError> {
        let mut state = self.lock();
        let ordinal = state.current_ordinal()?;
        let max_threads = self.device(ordinal)?.attributes.max_threads_per_block;

        let record = state.functions.get(&func).ok_or(DriverError::InvalidHandle)?;
        let image = Arc::clone(&state.modules[&record.module].image);
        let name = record.name.clone();
        let kernel = image.kernels[&name];

        if grid.volume() == 0 || block.volume() == 0 {
            return Err(DriverError::LaunchFailed(format!("{name}: empty launch {grid:?} x {block:?}")));
        }
        if block.volume() > max_threads as u64 {
            return Err(DriverError::LaunchFailed(format!(
                "{name}: block of {} threads exceeds the limit of {max_threads}",
                block.volume()
            )));
        }

        state.launches.push(LaunchRecord {
            kernel: name,
            grid,
            block,
        });

        let mut ctx = KernelContext::new(&mut state.heap, args, grid, block);
        kernel(&mut ctx)
    }

    fn array_create(&self, desc: &ArrayDesc) -> Result<ArrayHandle, DriverError> {
        let mut state = self.lock();
        state.current()?;
        if desc.width == 0 || desc.channels == 0 {
            return Err(DriverError::InvalidValue("empty texture array".into()));
        }
        let handle = ArrayHandle::from_raw(state.handles.next());
        state.arrays.insert(
            handle,
            ArrayRecord {
                desc: *desc,
                data: vec![0; desc.byte_size()],
            },
        );
        Ok(handle)
    }

    fn array_upload(&self, array: ArrayHandle, src: &[u8]) -> Result<(), DriverError> {
        let mut state = self.lock();
        state.current()?;
        let record = state.arrays.get_mut(&array).ok_or(DriverError::InvalidHandle)?;
        if src.len() != record.data.len() {
            return Err(DriverError::InvalidValue(format!(
                "array upload of {} bytes into {} bytes ({:?})",
                src.len(),
                record.data.len(),
                record.desc
            )));
        }
        record.data.copy_from_slice(src);
        Ok(())
    }

    fn array_destroy(&self, array: ArrayHandle) -> Result<(), DriverError> {
        let mut state = self.lock();
        state.arrays.remove(&array).ok_or(DriverError::InvalidHandle)?;
        Ok(())
    }

    fn texture_object_create(&self, array: ArrayHandle, sampling: Sampling) -> Result<TextureObject, DriverError> {
        let mut state = self.lock();
        state.current()?;
        if !state.arrays.contains_key(&array) {
            return Err(DriverError::InvalidHandle);
        }
        let tex = TextureObject::from_raw(state.handles.next());
        state.textures.insert(tex, (array, sampling));
        Ok(tex)
    }

    fn texture_object_destroy(&self, tex: TextureObject) -> Result<(), DriverError> {
        let mut state = self.lock();
        state.textures.remove(&tex).ok_or(DriverError::InvalidHandle)?;
        Ok(())
    }

    fn texture_ref_bind(
        &self,
        module: ModuleHandle,
        name: &str,
        array: ArrayHandle,
        sampling: Sampling,
    ) -> Result<(), DriverError> {
        let mut state = self.lock();
        if !state.arrays.contains_key(&array) {
            return Err(DriverError::InvalidHandle);
        }
        let loaded = state.modules.get_mut(&module).ok_or(DriverError::InvalidHandle)?;
        if !loaded.image.texture_refs.iter().any(|t| t == name) {
            return Err(DriverError::NotFound(name.to_string()));
        }
        loaded.bound.insert(name.to_string(), (array, sampling));
        Ok(())
    }

    fn graphics_register_buffer(&self, display_buffer: u32, bytes: usize) -> Result<GraphicsResource, DriverError> {
        let mut state = self.lock();
        let ordinal = state.current_ordinal()?;
        if !self.device(ordinal)?.interop {
            return Err(DriverError::InteropUnavailable);
        }

        let backing = *state
            .display_buffers
            .get(&display_buffer)
            .ok_or_else(|| DriverError::NotFound(format!("display buffer {display_buffer}")))?;
        if state.heap.tail(backing)?.len() < bytes {
            return Err(DriverError::InvalidValue(format!(
                "display buffer {display_buffer} is smaller than {bytes} bytes"
            )));
        }

        let res = GraphicsResource::from_raw(state.handles.next());
        state.graphics.insert(res, GraphicsRecord { backing, mapped: false });
        Ok(res)
    }

    fn graphics_map(&self, res: GraphicsResource) -> Result<DevicePtr, DriverError> {
        let mut state = self.lock();
        let record = state.graphics.get_mut(&res).ok_or(DriverError::InvalidHandle)?;
        if record.mapped {
            return Err(DriverError::InvalidValue("resource is already mapped".into()));
        }
        record.mapped = true;
        Ok(record.backing)
    }

    fn graphics_unmap(&self, res: GraphicsResource) -> Result<(), DriverError> {
        let mut state = self.lock();
        let record = state.graphics.get_mut(&res).ok_or(DriverError::InvalidHandle)?;
        if !record.mapped {
            return Err(DriverError::InvalidValue("resource is not mapped".into()));
        }
        record.mapped = false;
        Ok(())
    }

    fn graphics_unregister(&self, res: GraphicsResource) -> Result<(), DriverError> {
        self.lock()
            .graphics
            .remove(&res)
            .map(|_| ())
            .ok_or(DriverError::InvalidHandle)
    }
}

/// Compiler collaborator for the emulated driver.
///
/// "Compiling" writes a module file naming the reference image for the
/// requested module kind, which the driver then loads by name.
#[derive(Debug)]
pub struct EmulatedCompiler {
    dir: PathBuf,
    counter: AtomicU64,
}

impl EmulatedCompiler {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            counter: AtomicU64::new(0),
        }
    }
}

impl Default for EmulatedCompiler {
    /// A compiler writing to its own directory under the system temp dir.
    fn default() -> Self {
        static INSTANCES: AtomicU64 = AtomicU64::new(0);
        let n = INSTANCES.fetch_add(1, Ordering::Relaxed);
        Self::new(std::env::temp_dir().join(format!("lumen-emulated-{}-{n}", std::process::id())))
    }
}

impl KernelCompiler for EmulatedCompiler {
    fn compile(&self, request: &CompileRequest) -> Result<PathBuf, CompileError> {
        std::fs::create_dir_all(&self.dir).map_err(|e| CompileError::CompileFailed(e.to_string()))?;

        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let path = self.dir.join(format!(
            "{}_{}_{n}.bin",
            request.kind.file_stem(),
            request.architecture
        ));
        std::fs::write(&path, reference::image_name(request.kind))
            .map_err(|e| CompileError::CompileFailed(e.to_string()))?;

        log::debug!("emulated compile of {} module with \"{}\"", request.kind, request.build_options);
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{AddressMode, ArrayFormat, FilterMode};

    fn driver() -> EmulatedDriver {
        EmulatedDriver::new(vec![EmulatedDevice::new("test").memory(1 << 20)])
    }

    fn with_context<R>(driver: &EmulatedDriver, f: impl FnOnce() -> R) -> R {
        let ctx = driver.context_create(0, ContextFlags::default()).unwrap();
        driver.context_push(ctx).unwrap();
        let r = f();
        driver.context_pop().unwrap();
        r
    }

    // ── contexts ────────────────────────────────────────────────────────────

    #[test]
    fn memory_requires_a_current_context() {
        let d = driver();
        assert_eq!(d.mem_alloc(16), Err(DriverError::NoCurrentContext));
        with_context(&d, || assert!(d.mem_alloc(16).is_ok()));
    }

    #[test]
    fn context_stack_is_per_thread() {
        let d = Arc::new(driver());
        let ctx = d.context_create(0, ContextFlags::default()).unwrap();
        d.context_push(ctx).unwrap();

        let other = Arc::clone(&d);
        let depth = std::thread::spawn(move || other.context_depth()).join().unwrap();
        assert_eq!(depth, 0);
        assert_eq!(d.context_depth(), 1);
        assert_eq!(d.context_pop(), Ok(ctx));
        assert_eq!(d.context_pop(), Err(DriverError::NoCurrentContext));
    }

    #[test]
    fn display_sharing_needs_interop() {
        let d = EmulatedDriver::new(vec![EmulatedDevice::new("headless").interop(false)]);
        let flags = ContextFlags { display_sharing: true };
        assert_eq!(d.context_create(0, flags), Err(DriverError::InteropUnavailable));
        assert!(d.context_create(0, ContextFlags::default()).is_ok());
    }

    // ── memory ──────────────────────────────────────────────────────────────

    #[test]
    fn copies_round_trip_through_interior_pointers() {
        let d = driver();
        with_context(&d, || {
            let p = d.mem_alloc(16).unwrap();
            d.memcpy_htod(p.offset(8), &[9; 8]).unwrap();
            let mut out = [0u8; 16];
            d.memcpy_dtoh(&mut out, p).unwrap();
            assert_eq!(out, [0, 0, 0, 0, 0, 0, 0, 0, 9, 9, 9, 9, 9, 9, 9, 9]);
            d.memset_d8(p, 1, 4).unwrap();
            d.memcpy_dtoh(&mut out[..4], p).unwrap();
            assert_eq!(out[..4], [1; 4]);
        });
    }

    #[test]
    fn allocation_beyond_device_memory_fails() {
        let d = driver();
        with_context(&d, || {
            assert_eq!(
                d.mem_alloc(2 << 20),
                Err(DriverError::OutOfMemory { requested: 2 << 20 })
            );
            let info = d.mem_info().unwrap();
            assert_eq!(info.free, info.total);
        });
    }

    // ── modules & launches ──────────────────────────────────────────────────

    fn fill_kernel(ctx: &mut KernelContext<'_>) -> Result<(), DriverError> {
        let out = ctx.arg_ptr(0)?;
        let value = ctx.arg_u32(1)?;
        for i in 0..ctx.num_threads() as usize {
            ctx.write(out, i, value)?;
        }
        Ok(())
    }

    #[test]
    fn launches_run_host_kernels_and_are_recorded() {
        let d = driver();
        d.register_image(ModuleImage::new("fill").kernel("kernel_fill", fill_kernel).max_threads(64));

        with_context(&d, || {
            let module = d.module_load(b"fill").unwrap();
            assert_eq!(
                d.module_function(module, "kernel_missing"),
                Err(DriverError::NotFound("kernel_missing".into()))
            );
            let f = d.module_function(module, "kernel_fill").unwrap();
            assert_eq!(d.function_max_threads(f), Ok(64));

            let out = d.mem_alloc(4 * 8).unwrap();
            d.launch(f, Dim3::linear(2), Dim3::linear(4), &[out.into(), 7u32.into()])
                .unwrap();

            let mut bytes = [0u8; 32];
            d.memcpy_dtoh(&mut bytes, out).unwrap();
            let values: Vec<u32> = bytemuck::pod_collect_to_vec(&bytes);
            assert_eq!(values, vec![7; 8]);

            assert!(d.launch(f, Dim3::linear(1), Dim3::linear(2048), &[]).is_err());
        });

        assert_eq!(
            d.launches(),
            vec![LaunchRecord {
                kernel: "kernel_fill".into(),
                grid: Dim3::linear(2),
                block: Dim3::linear(4),
            }]
        );
    }

    #[test]
    fn unknown_images_are_rejected() {
        let d = driver();
        with_context(&d, || {
            assert!(matches!(d.module_load(b"nope"), Err(DriverError::InvalidImage(_))));
        });
    }

    // ── textures ────────────────────────────────────────────────────────────

    #[test]
    fn texture_refs_must_be_declared() {
        let d = driver();
        d.register_image(ModuleImage::new("tex").texture_ref("__tex_a"));
        let sampling = Sampling {
            address: AddressMode::Wrap,
            filter: FilterMode::Linear,
            normalized_coords: true,
        };

        with_context(&d, || {
            let module = d.module_load(b"tex").unwrap();
            let array = d
                .array_create(&ArrayDesc {
                    width: 4,
                    height: 4,
                    depth: 0,
                    format: ArrayFormat::U8,
                    channels: 4,
                })
                .unwrap();
            assert!(d.array_upload(array, &[0; 3]).is_err());
            d.array_upload(array, &[0; 64]).unwrap();

            assert!(d.texture_ref_bind(module, "__tex_b", array, sampling).is_err());
            d.texture_ref_bind(module, "__tex_a", array, sampling).unwrap();
            assert_eq!(d.bound_texture_refs(module), vec!["__tex_a".to_string()]);
        });
    }
}
