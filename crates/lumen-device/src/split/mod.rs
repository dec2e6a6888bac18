//! Split-kernel launcher.
//!
//! Instead of one megakernel, a tile is rendered by a chain of stage kernels
//! sharing a per-thread state buffer. The state size is only known to the
//! kernels, so it is probed at runtime; the global work size is then derived
//! from the device memory that is free.

use crate::config::BackendConfig;
use crate::device::{ContextScope, DeviceShared};
use crate::driver::{DevicePtr, Dim3, DriverError, KernelArg};
use crate::error::DeviceError;
use crate::memory::{DataType, DeviceMemory};
use crate::module::{kernels, Kernel, LoadedModule};
use crate::render::sample_batches;
use crate::task::{CancelToken, DeviceTask, RenderTile, TaskOutcome};

/// Ray state value of a thread that still has work.
pub const RAY_ACTIVE: u8 = 1;
pub const RAY_INACTIVE: u8 = 0;

/// Number of stage queues.
pub const NUM_QUEUES: usize = 4;

/// Threads the state-size probe is run for.
const PROBE_THREADS: u32 = 1024;

/// Stage kernels of the split render module, resolved once.
#[derive(Debug)]
pub struct SplitKernel {
    state_buffer_size: Kernel,
    data_init: Kernel,
    path_init: Kernel,
    stages: Vec<Kernel>,
    local_size: [u32; 2],
    alignment: [u32; 2],
}

impl SplitKernel {
    pub fn load(scope: &ContextScope<'_>, render: &LoadedModule, config: &BackendConfig) -> Result<Self, DeviceError> {
        let stage = |name: &str| render.resolve(scope, &format!("{}{name}", kernels::SPLIT_PREFIX));

        let stages = kernels::SPLIT_STAGES
            .iter()
            .map(|name| stage(name))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            state_buffer_size: render.resolve(scope, kernels::STATE_BUFFER_SIZE)?,
            data_init: render.resolve(scope, kernels::DATA_INIT)?,
            path_init: stage(kernels::SPLIT_PATH_INIT)?,
            stages,
            local_size: config.split_local_size,
            alignment: config.split_global_alignment,
        })
    }

    /// Local work size reported to callers.
    ///
    /// Launches are 1D and ignore it.
    pub fn local_size(&self) -> [u32; 2] {
        self.local_size
    }

    /// Launches `kernel` over `global[0] × global[1]` threads.
    pub fn enqueue(
        &self,
        scope: &ContextScope<'_>,
        kernel: &Kernel,
        global: [u32; 2],
        args: &[KernelArg],
    ) -> Result<(), DeviceError> {
        scope.ensure_clear()?;
        let driver = scope.driver();
        let threads_per_block = scope
            .check("function_max_threads", driver.function_max_threads(kernel.func))?
            .max(1);
        let total = global[0] as u64 * global[1] as u64;
        let blocks = total.div_ceil(threads_per_block as u64).max(1) as u32;

        scope.check(
            "launch",
            driver.launch(kernel.func, Dim3::linear(blocks), Dim3::linear(threads_per_block), args),
        )
    }

    /// Bytes of split state needed for `num_threads` threads.
    ///
    /// Runs the probe kernel on a single thread and reads its answer back.
    pub(crate) fn state_buffer_size(
        &self,
        dev: &DeviceShared,
        scope: &ContextScope<'_>,
        num_threads: u32,
    ) -> Result<u64, DeviceError> {
        let mut size = DeviceMemory::linear("split_state_size", DataType::U64, 1, 1);
        let result = (|| {
            dev.memory().zero(scope, &mut size)?;
            let ptr = resident(&size)?;
            scope.check(
                "launch",
                scope.driver().launch(
                    self.state_buffer_size.func,
                    Dim3::linear(1),
                    Dim3::linear(1),
                    &[num_threads.into(), ptr.into()],
                ),
            )?;
            scope.synchronize()?;
            dev.memory().copy_from_device(scope, &mut size, 0, 1, 1, 8)?;
            Ok(size.read_host::<u64>().first().copied().unwrap_or(0))
        })();

        dev.memory().free(scope, &mut size, None)?;
        result
    }

    /// Largest global size whose state fits in half of the free memory.
    pub(crate) fn global_size(&self, dev: &DeviceShared, scope: &ContextScope<'_>) -> Result<[u32; 2], DeviceError> {
        let per_thread = self
            .state_buffer_size(dev, scope, PROBE_THREADS)?
            .div_ceil(PROBE_THREADS as u64)
            .max(1);
        let info = scope.check("mem_info", scope.driver().mem_info())?;

        global_size_for_budget(info.free as u64 / 2, per_thread, self.alignment).ok_or_else(|| {
            scope.errors().raise(DeviceError::Allocation {
                name: "split kernel state".into(),
                bytes: (per_thread * self.alignment[0] as u64 * self.alignment[1] as u64) as usize,
                source: DriverError::OutOfMemory {
                    requested: info.free / 2,
                },
            })
        })
    }

    /// Renders every remaining sample of `tile` through the stage chain.
    pub(crate) fn path_trace(
        &self,
        dev: &DeviceShared,
        scope: &ContextScope<'_>,
        task: &DeviceTask,
        cancel: &CancelToken,
        tile: &mut RenderTile,
    ) -> Result<TaskOutcome, DeviceError> {
        scope.ensure_clear()?;
        dev.sync_textures(scope)?;

        let global = self.global_size(dev, scope)?;
        let num_threads = global[0] * global[1];
        let state_bytes = self.state_buffer_size(dev, scope, num_threads)?;
        let work_groups = num_threads.div_ceil(self.local_size[0] * self.local_size[1]).max(1);
        log::debug!(
            "split kernel: global {}x{}, {} bytes of state",
            global[0],
            global[1],
            state_bytes
        );

        let mut buffers = SplitBuffers::new(state_bytes as usize, num_threads as usize, work_groups as usize);
        let result = buffers
            .allocate(dev, scope)
            .and_then(|()| self.render_tile(dev, scope, task, cancel, tile, &mut buffers, global));
        buffers.free(dev, scope);
        result
    }

    #[allow(clippy::too_many_arguments)]
    fn render_tile(
        &self,
        dev: &DeviceShared,
        scope: &ContextScope<'_>,
        task: &DeviceTask,
        cancel: &CancelToken,
        tile: &mut RenderTile,
        buffers: &mut SplitBuffers,
        global: [u32; 2],
    ) -> Result<TaskOutcome, DeviceError> {
        let num_threads = global[0] * global[1];
        let [split_data, ray_state, queue_index, use_queues, work_pool] = buffers.pointers()?;
        let buffer = tile
            .buffer
            .ok_or_else(|| DeviceError::InvalidRequest("tile has no render buffer".into()))?;

        let stage_args: [KernelArg; 6] = [
            split_data.into(),
            ray_state.into(),
            queue_index.into(),
            use_queues.into(),
            work_pool.into(),
            num_threads.into(),
        ];

        // One batch keeps every thread busy for about one path.
        let pixels = tile.pixel_count();
        let step = (num_threads as u64).div_ceil(pixels.max(1)).min(i32::MAX as u64) as i32;

        for (sample, count) in sample_batches(tile.sample, tile.end_sample(), step) {
            let init_args: [KernelArg; 18] = [
                split_data.into(),
                num_threads.into(),
                ray_state.into(),
                sample.into(),
                (sample + count).into(),
                tile.x.into(),
                tile.y.into(),
                tile.w.into(),
                tile.h.into(),
                tile.offset.into(),
                tile.stride.into(),
                queue_index.into(),
                (NUM_QUEUES as i32).into(),
                use_queues.into(),
                work_pool.into(),
                count.into(),
                buffer.into(),
                tile.pass_stride.into(),
            ];
            self.enqueue(scope, &self.data_init, global, &init_args)?;
            self.enqueue(scope, &self.path_init, global, &stage_args)?;

            loop {
                for stage in &self.stages {
                    self.enqueue(scope, stage, global, &stage_args)?;
                }
                scope.synchronize()?;

                dev.memory()
                    .copy_from_device(scope, &mut buffers.ray_state, 0, num_threads as usize, 1, 1)?;
                let active = buffers
                    .ray_state
                    .host()
                    .is_some_and(|states| states.iter().any(|&s| s == RAY_ACTIVE));
                if !active {
                    break;
                }
                // The batch in flight is abandoned; finished batches stay counted.
                if task.should_stop(cancel) {
                    return Ok(TaskOutcome::Cancelled);
                }
            }

            tile.sample = sample + count;
            task.progress.update(Some(tile), pixels * count as u64);

            if tile.sample < tile.end_sample() && task.should_stop(cancel) {
                return Ok(TaskOutcome::Cancelled);
            }
        }

        Ok(TaskOutcome::Completed)
    }
}

/// `(side, rows)` with `side = ⌊√n⌋` rounded down to `alignment[0]` and
/// `rows = n / side` rounded down to `alignment[1]`, where `n` is the number
/// of threads whose state fits in `budget` bytes.
pub fn global_size_for_budget(budget: u64, per_thread: u64, alignment: [u32; 2]) -> Option<[u32; 2]> {
    let elements = budget / per_thread.max(1);
    let side = round_down((elements as f64).sqrt() as u64, alignment[0] as u64);
    if side == 0 {
        return None;
    }
    let rows = round_down(elements / side, alignment[1] as u64);
    if rows == 0 {
        return None;
    }
    Some([side.min(u32::MAX as u64) as u32, rows.min(u32::MAX as u64) as u32])
}

fn round_down(value: u64, multiple: u64) -> u64 {
    let multiple = multiple.max(1);
    value / multiple * multiple
}

fn resident(mem: &DeviceMemory) -> Result<DevicePtr, DeviceError> {
    mem.device_ptr()
        .ok_or_else(|| DeviceError::InvalidRequest(format!("\"{}\" is not resident", mem.name())))
}

/// Device buffers of one split render.
struct SplitBuffers {
    split_data: DeviceMemory,
    ray_state: DeviceMemory,
    queue_index: DeviceMemory,
    use_queues: DeviceMemory,
    work_pool: DeviceMemory,
}

impl SplitBuffers {
    fn new(state_bytes: usize, num_threads: usize, work_groups: usize) -> Self {
        Self {
            split_data: DeviceMemory::device_linear("split_data", DataType::U8, 1, state_bytes),
            ray_state: DeviceMemory::linear("ray_state", DataType::U8, 1, num_threads),
            queue_index: DeviceMemory::linear("queue_index", DataType::I32, 1, NUM_QUEUES),
            use_queues: DeviceMemory::linear("use_queues_flag", DataType::I32, 1, 1),
            work_pool: DeviceMemory::linear("work_pool_wgs", DataType::U32, 1, work_groups),
        }
    }

    fn all(&mut self) -> [&mut DeviceMemory; 5] {
        [
            &mut self.split_data,
            &mut self.ray_state,
            &mut self.queue_index,
            &mut self.use_queues,
            &mut self.work_pool,
        ]
    }

    fn allocate(&mut self, dev: &DeviceShared, scope: &ContextScope<'_>) -> Result<(), DeviceError> {
        let mut memory = dev.memory();
        memory.alloc(scope, &mut self.split_data)?;
        for mem in [&mut self.ray_state, &mut self.queue_index, &mut self.use_queues, &mut self.work_pool] {
            memory.zero(scope, mem)?;
        }
        Ok(())
    }

    fn pointers(&self) -> Result<[DevicePtr; 5], DeviceError> {
        Ok([
            resident(&self.split_data)?,
            resident(&self.ray_state)?,
            resident(&self.queue_index)?,
            resident(&self.use_queues)?,
            resident(&self.work_pool)?,
        ])
    }

    fn free(&mut self, dev: &DeviceShared, scope: &ContextScope<'_>) {
        let mut memory = dev.memory();
        for mem in self.all() {
            if let Err(e) = memory.free(scope, mem, None) {
                log::warn!("failed to free split buffer: {e}");
            }
        }
    }
}
