//! The GPU device backend.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard};

use super::context::{ContextScope, DeviceContext};
use super::info::{DeviceInfo, MIN_COMPUTE_MAJOR};
use super::interop::{DisplayInterop, DrawHooks, DrawRect};
use crate::config::BackendConfig;
use crate::denoise::denoise_tile;
use crate::driver::{DevicePtr, Driver};
use crate::error::DeviceError;
use crate::memory::{DataType, DeviceMemory, MemStats, MemoryKind, MemoryManager, PixelAlloc, Residency};
use crate::module::{CompileRequest, Kernel, KernelCompiler, KernelModules, ModuleKind, RequestedFeatures};
use crate::render::{film_convert, path_trace, shader, WorkTile};
use crate::split::SplitKernel;
use crate::task::{
    CancelToken, DeviceTask, RenderParams, TaskHandle, TaskKind, TaskOutcome, TaskPool, TileWork,
};

/// State shared between the device handle and its workers.
pub(crate) struct DeviceShared {
    pub(crate) info: DeviceInfo,
    pub(crate) config: BackendConfig,
    modules: RwLock<KernelModules>,
    memory: Mutex<MemoryManager>,
    split: Mutex<Option<Arc<SplitKernel>>>,
    interop: Option<Arc<dyn DisplayInterop>>,
    background: AtomicBool,
    stats: Arc<MemStats>,
    // Dropped last: everything above may still need it.
    context: DeviceContext,
}

impl DeviceShared {
    pub(crate) fn scope(&self) -> ContextScope<'_> {
        ContextScope::enter(&self.context)
    }

    /// The memory manager. Never held across a launch.
    pub(crate) fn memory(&self) -> MutexGuard<'_, MemoryManager> {
        self.memory.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn modules(&self) -> RwLockReadGuard<'_, KernelModules> {
        self.modules.read().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn render_kernel(&self, scope: &ContextScope<'_>, name: &str) -> Result<Kernel, DeviceError> {
        let modules = self.modules();
        let render = modules.render().map_err(|e| scope.errors().raise(e))?;
        render.resolve(scope, name)
    }

    pub(crate) fn filter_kernel(&self, scope: &ContextScope<'_>, name: &str) -> Result<Kernel, DeviceError> {
        let modules = self.modules();
        let filter = modules.filter().map_err(|e| scope.errors().raise(e))?;
        filter.resolve(scope, name)
    }

    /// Uploads the texture slot array if bindless textures changed.
    pub(crate) fn sync_textures(&self, scope: &ContextScope<'_>) -> Result<(), DeviceError> {
        let render = self.modules().render_handle();
        self.memory().load_texture_info(scope, render)
    }

    /// Split stage kernels, resolved on first use.
    pub(crate) fn split_kernel(&self, scope: &ContextScope<'_>) -> Result<Arc<SplitKernel>, DeviceError> {
        let mut split = self.split.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(kernel) = split.as_ref() {
            return Ok(Arc::clone(kernel));
        }

        let modules = self.modules();
        let render = modules.render().map_err(|e| scope.errors().raise(e))?;
        let kernel = Arc::new(SplitKernel::load(scope, render, &self.config)?);
        *split = Some(Arc::clone(&kernel));
        Ok(kernel)
    }

    fn is_background(&self) -> bool {
        self.background.load(Ordering::Acquire)
    }

    /// Latches an error unless the device is too old for the kernels.
    fn support_device(&self) {
        let arch = self.info.architecture;
        if arch.major < MIN_COMPUTE_MAJOR {
            self.context.errors().raise(DeviceError::UnsupportedDevice {
                major: arch.major,
                minor: arch.minor,
                required: MIN_COMPUTE_MAJOR,
            });
        }
    }
}

impl Drop for DeviceShared {
    fn drop(&mut self) {
        if self.context.handle().is_none() {
            return;
        }
        let scope = ContextScope::enter(&self.context);

        let memory = self.memory.get_mut().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = memory.release_texture_info(&scope) {
            log::warn!("failed to release texture info: {e}");
        }
        if memory.tracked() > 0 {
            log::warn!("{} allocations still resident when the device closed", memory.tracked());
        }

        self.split.get_mut().unwrap_or_else(|e| e.into_inner()).take();
        self.modules
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .unload(&scope);
    }
}

/// A GPU device: one driver context, its memory, kernels and workers.
///
/// Memory operations run on the calling thread; render, denoise and shader
/// tasks run on the worker pool, film conversion on the submitting thread.
/// Failures are latched: after the first one every further device call fails
/// fast and [`error_message`](Self::error_message) reports the root cause.
pub struct GpuDevice {
    // Joined before the shared state goes away.
    pool: TaskPool,
    shared: Arc<DeviceShared>,
}

impl GpuDevice {
    /// Opens device `info.num` of `driver`.
    ///
    /// With `interop` the context is created for display sharing; when that
    /// fails, or without `interop`, the device works offscreen
    /// ([`is_background`](Self::is_background)).
    pub fn new(
        driver: Arc<dyn Driver>,
        info: DeviceInfo,
        config: BackendConfig,
        interop: Option<Arc<dyn DisplayInterop>>,
    ) -> Result<Self, DeviceError> {
        let context = DeviceContext::create(driver, info.num, interop.is_some());
        let background = !context.is_display_shared();
        let stats = Arc::new(MemStats::new());
        let memory = MemoryManager::new(info.has_bindless_textures, config.texture_slot_chunk, Arc::clone(&stats));

        log::info!(
            "opening {} ({}, {}, {})",
            info.description,
            info.architecture,
            if info.has_bindless_textures { "bindless" } else { "legacy textures" },
            if background { "offscreen" } else { "display sharing" }
        );

        let pool = TaskPool::new(&format!("lumen-gpu{}", info.num), config.worker_threads)
            .map_err(|e| DeviceError::WorkerSpawn(e.to_string()))?;

        let shared = Arc::new(DeviceShared {
            info,
            config,
            modules: RwLock::new(KernelModules::new()),
            memory: Mutex::new(memory),
            split: Mutex::new(None),
            interop,
            background: AtomicBool::new(background),
            stats,
            context,
        });
        shared.support_device();

        Ok(Self { pool, shared })
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.shared.info
    }

    pub fn config(&self) -> &BackendConfig {
        &self.shared.config
    }

    pub fn have_error(&self) -> bool {
        self.shared.context.errors().have_error()
    }

    /// The first error latched on this device.
    pub fn error_message(&self) -> Option<String> {
        self.shared.context.errors().message()
    }

    /// Pixels are rendered offscreen and drawn from host copies.
    pub fn is_background(&self) -> bool {
        self.shared.is_background()
    }

    pub fn stats(&self) -> &Arc<MemStats> {
        &self.shared.stats
    }

    #[cfg(test)]
    pub(crate) fn shared(&self) -> &DeviceShared {
        &self.shared
    }

    // ── kernels ─────────────────────────────────────────────────────────────

    /// Compiles and loads the render and filter modules.
    ///
    /// The render module is the split variant when the split kernel is
    /// enabled. Loading twice is rejected.
    pub fn load_kernels(
        &self,
        features: &RequestedFeatures,
        compiler: &dyn KernelCompiler,
    ) -> Result<(), DeviceError> {
        let dev = &self.shared;
        let render_kind = if dev.config.split_kernel {
            ModuleKind::SplitRender
        } else {
            ModuleKind::Render
        };
        let arch = dev.info.architecture;
        let render = CompileRequest::new(render_kind, arch, features, &dev.config);
        let filter = CompileRequest::new(ModuleKind::Filter, arch, features, &dev.config);

        let scope = dev.scope();
        let mut modules = dev.modules.write().unwrap_or_else(|e| e.into_inner());
        modules.load(&scope, compiler, &render, &filter)?;
        log::info!("kernels loaded for {}", dev.info.description);
        Ok(())
    }

    // ── memory ──────────────────────────────────────────────────────────────

    /// Allocates device memory for `mem`.
    ///
    /// Pixel buffers are shared with the display when possible. The first
    /// refused share switches the device to offscreen mode for good and the
    /// buffer becomes a plain allocation.
    pub fn mem_alloc(&self, mem: &mut DeviceMemory) -> Result<(), DeviceError> {
        let dev = &self.shared;
        let scope = dev.scope();

        match (mem.kind(), dev.interop.as_deref()) {
            (MemoryKind::Texture, _) => Err(scope.errors().raise(DeviceError::InvalidRequest(format!(
                "texture \"{}\" is allocated when copied to the device",
                mem.name()
            )))),
            (MemoryKind::Pixels, Some(interop)) if !dev.is_background() => {
                let mut memory = dev.memory();
                match memory.pixels_alloc(&scope, interop, mem)? {
                    PixelAlloc::Shared => Ok(()),
                    PixelAlloc::Fallback => {
                        log::warn!("display sharing failed; switching to offscreen rendering");
                        dev.background.store(true, Ordering::Release);
                        memory.alloc(&scope, mem)
                    }
                }
            }
            _ => dev.memory().alloc(&scope, mem),
        }
    }

    /// Uploads the host copy of `mem`; textures are (re)bound for kernels.
    pub fn mem_copy_to(&self, mem: &mut DeviceMemory) -> Result<(), DeviceError> {
        let dev = &self.shared;
        let scope = dev.scope();
        if mem.kind() == MemoryKind::Texture {
            let render = dev.modules().render_handle();
            dev.memory().tex_alloc(&scope, render, mem)
        } else {
            dev.memory().copy_to_device(&scope, mem)
        }
    }

    /// Downloads rows `y..y + h` of `w` elements of `elem` bytes.
    pub fn mem_copy_from(
        &self,
        mem: &mut DeviceMemory,
        y: usize,
        w: usize,
        h: usize,
        elem: usize,
    ) -> Result<(), DeviceError> {
        let dev = &self.shared;
        let scope = dev.scope();
        match (mem.residency(), dev.interop.as_deref()) {
            (Some(Residency::Display(_)), Some(interop)) => dev.memory().pixels_copy_from(&scope, interop, mem, y, w, h),
            _ => dev.memory().copy_from_device(&scope, mem, y, w, h, elem),
        }
    }

    pub fn mem_zero(&self, mem: &mut DeviceMemory) -> Result<(), DeviceError> {
        let dev = &self.shared;
        let scope = dev.scope();
        dev.memory().zero(&scope, mem)
    }

    /// Releases `mem`. Freeing twice is a no-op.
    pub fn mem_free(&self, mem: &mut DeviceMemory) -> Result<(), DeviceError> {
        let dev = &self.shared;
        let scope = dev.scope();
        if mem.kind() == MemoryKind::Texture {
            dev.memory().tex_free(&scope, mem)
        } else {
            dev.memory().free(&scope, mem, dev.interop.as_deref())
        }
    }

    /// Device pointer `offset` elements into `mem`.
    pub fn sub_ptr(&self, mem: &DeviceMemory, offset: usize) -> Option<DevicePtr> {
        self.shared.memory().sub_ptr(mem, offset)
    }

    /// Writes `data` into the render module global `name`.
    pub fn const_copy_to(&self, name: &str, data: &[u8]) -> Result<(), DeviceError> {
        let dev = &self.shared;
        let scope = dev.scope();
        let module = dev.modules().render_handle().ok_or_else(|| {
            scope
                .errors()
                .raise(DeviceError::InvalidRequest("render module is not loaded".into()))
        })?;
        dev.memory().const_copy_to(&scope, module, name, data)
    }

    // ── tasks ───────────────────────────────────────────────────────────────

    /// Submits `task`.
    ///
    /// Film conversion runs before this returns; everything else is queued.
    /// A task that fails stops early and its failure is latched.
    pub fn task_add(&self, task: DeviceTask) -> TaskHandle {
        if let TaskKind::FilmConvert(params) = &task.kind {
            let dev = &self.shared;
            let scope = dev.scope();
            let result = film_convert(dev, &scope, params).map(|()| TaskOutcome::Completed);
            return TaskHandle::finished(settle(dev, result));
        }

        let dev = Arc::clone(&self.shared);
        self.pool.push(move |cancel| thread_run(&dev, &task, cancel))
    }

    /// Blocks until every queued task has finished.
    pub fn task_wait(&self) {
        self.pool.wait();
    }

    /// Drops queued tasks and stops running ones at their next checkpoint.
    pub fn task_cancel(&self) {
        self.pool.cancel();
    }

    // ── display ─────────────────────────────────────────────────────────────

    /// Draws rows of a pixel buffer through the display collaborator.
    ///
    /// Shared buffers are drawn directly; offscreen buffers are read back
    /// and drawn from host memory. `hooks` run immediately around the draw.
    pub fn draw_pixels(
        &self,
        mem: &mut DeviceMemory,
        rect: DrawRect,
        transparent: bool,
        hooks: &DrawHooks<'_>,
    ) -> Result<(), DeviceError> {
        let dev = &self.shared;
        let Some(interop) = dev.interop.as_deref() else {
            let scope = dev.scope();
            return Err(scope
                .errors()
                .raise(DeviceError::InvalidRequest("no display to draw to".into())));
        };

        let shared = mem.residency().and_then(|r| dev.memory().display_format(r));
        if let Some((buffer, format)) = shared {
            hooks.around(|| interop.draw_buffer(buffer, format, rect, transparent));
            return Ok(());
        }

        let elem = mem.element_size();
        let (y, w, h) = (rect.y as usize, rect.w as usize, rect.h as usize);
        self.mem_copy_from(mem, y, w, h, elem)?;

        let format = crate::memory::pixel_format(mem);
        let offset = y * w * elem;
        let pixels = mem
            .host()
            .and_then(|host| host.get(offset..offset + w * h * elem))
            .ok_or_else(|| DeviceError::InvalidRequest(format!("\"{}\" has no host pixels to draw", mem.name())))?;
        hooks.around(|| interop.draw_host_pixels(pixels, format, rect, transparent));
        Ok(())
    }

    // ── split kernel ────────────────────────────────────────────────────────

    /// Split state bytes for `num_threads` threads.
    pub fn split_state_size(&self, num_threads: u32) -> Result<u64, DeviceError> {
        let dev = &self.shared;
        let scope = dev.scope();
        dev.split_kernel(&scope)?.state_buffer_size(dev, &scope, num_threads)
    }

    /// Split global work size fitting the free device memory.
    pub fn split_global_size(&self) -> Result<[u32; 2], DeviceError> {
        let dev = &self.shared;
        let scope = dev.scope();
        dev.split_kernel(&scope)?.global_size(dev, &scope)
    }

    pub fn split_local_size(&self) -> [u32; 2] {
        self.shared.config.split_local_size
    }
}

/// Turns a task result into its outcome, latching unlatched failures.
fn settle(dev: &DeviceShared, result: Result<TaskOutcome, DeviceError>) -> TaskOutcome {
    match result {
        Ok(outcome) => outcome,
        Err(e) => {
            let errors = dev.context.errors();
            if !errors.have_error() {
                errors.report(e.to_string());
            }
            TaskOutcome::Cancelled
        }
    }
}

/// Body of every queued task.
fn thread_run(dev: &DeviceShared, task: &DeviceTask, cancel: &CancelToken) -> TaskOutcome {
    let scope = dev.scope();
    let result = match &task.kind {
        TaskKind::Render(params) => render_tiles(dev, &scope, task, params, cancel, false),
        TaskKind::Denoise(params) => render_tiles(dev, &scope, task, params, cancel, true),
        TaskKind::Shader(params) => shader(dev, &scope, task, cancel, params)
            .and_then(|outcome| scope.synchronize().map(|()| outcome)),
        TaskKind::FilmConvert(params) => film_convert(dev, &scope, params).map(|()| TaskOutcome::Completed),
    };
    settle(dev, result)
}

/// Works through every tile the source hands out.
///
/// Every acquired tile is released, whatever happens while working on it.
fn render_tiles(
    dev: &DeviceShared,
    scope: &ContextScope<'_>,
    task: &DeviceTask,
    params: &RenderParams,
    cancel: &CancelToken,
    denoise_only: bool,
) -> Result<TaskOutcome, DeviceError> {
    let mut work_tiles = DeviceMemory::linear("work_tiles", DataType::U8, size_of::<WorkTile>() as u32, 1);

    let result = (|| {
        while let Some(mut tile) = params.tiles.acquire_tile() {
            let work = if denoise_only { TileWork::Denoise } else { tile.work };
            let outcome = match work {
                TileWork::PathTrace if dev.config.split_kernel => dev
                    .split_kernel(scope)
                    .and_then(|split| split.path_trace(dev, scope, task, cancel, &mut tile)),
                TileWork::PathTrace => path_trace(dev, scope, task, cancel, &mut tile, &mut work_tiles, params.branched),
                TileWork::Denoise => denoise_tile(dev, scope, params.tiles.as_ref(), &tile, &params.denoise).map(|()| {
                    tile.sample = tile.end_sample();
                    task.progress.update(Some(&tile), tile.pixel_count());
                    TaskOutcome::Completed
                }),
            };
            params.tiles.release_tile(tile);

            if outcome? == TaskOutcome::Cancelled || task.should_stop(cancel) {
                return Ok(TaskOutcome::Cancelled);
            }
        }
        Ok(TaskOutcome::Completed)
    })();

    if let Err(e) = dev.memory().free(scope, &mut work_tiles, None) {
        log::warn!("failed to free work tiles: {e}");
    }
    result
}
