use bytemuck::{Pod, Zeroable};

use crate::device::{ContextScope, DeviceShared};
use crate::driver::{CachePreference, Dim3, Occupancy};
use crate::error::DeviceError;
use crate::memory::DeviceMemory;
use crate::module::kernels;
use crate::task::{CancelToken, DeviceTask, RenderTile, TaskOutcome};

/// Per-launch tile descriptor read by the path-trace kernels.
#[repr(C)]
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct WorkTile {
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
    pub start_sample: i32,
    pub num_samples: i32,
    pub offset: i32,
    pub stride: i32,
    pub pass_stride: i32,
    pub _pad: i32,
    pub buffer: u64,
}

impl WorkTile {
    /// Descriptor for samples `start_sample..start_sample + num_samples` of `tile`.
    pub fn new(tile: &RenderTile, start_sample: i32, num_samples: i32) -> Self {
        Self {
            x: tile.x,
            y: tile.y,
            w: tile.w,
            h: tile.h,
            start_sample,
            num_samples,
            offset: tile.offset,
            stride: tile.stride,
            pass_stride: tile.pass_stride,
            _pad: 0,
            buffer: tile.buffer.map_or(0, |p| p.addr()),
        }
    }
}

/// Samples per launch so that one launch fills the device.
///
/// Devices that do not drive a display take `block_scale` times more blocks,
/// trading interactivity for throughput.
pub fn step_samples(occupancy: Occupancy, display_device: bool, block_scale: u32, pixels: u64) -> i32 {
    let mut min_blocks = occupancy.min_grid_blocks as u64;
    if !display_device {
        min_blocks *= block_scale as u64;
    }
    let threads = min_blocks * occupancy.block_size as u64;
    threads.div_ceil(pixels.max(1)).clamp(1, i32::MAX as u64) as i32
}

/// Sample batches covering `start..end`: `(first_sample, count)` pairs of
/// `step` samples, the last one shortened to fit.
#[derive(Debug, Clone)]
pub struct SampleBatches {
    next: i32,
    end: i32,
    step: i32,
}

pub fn sample_batches(start: i32, end: i32, step: i32) -> SampleBatches {
    SampleBatches {
        next: start,
        end,
        step: step.max(1),
    }
}

impl Iterator for SampleBatches {
    type Item = (i32, i32);

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.end {
            return None;
        }
        let sample = self.next;
        let count = self.step.min(self.end - sample);
        self.next += count;
        Some((sample, count))
    }
}

/// Renders every remaining sample of `tile` with the megakernel.
///
/// `work_tiles` is the descriptor buffer reused across tiles.
pub(crate) fn path_trace(
    dev: &DeviceShared,
    scope: &ContextScope<'_>,
    task: &DeviceTask,
    cancel: &CancelToken,
    tile: &mut RenderTile,
    work_tiles: &mut DeviceMemory,
    branched: bool,
) -> Result<TaskOutcome, DeviceError> {
    scope.ensure_clear()?;
    dev.sync_textures(scope)?;

    let name = if branched {
        kernels::BRANCHED_PATH_TRACE
    } else {
        kernels::PATH_TRACE
    };
    let kernel = dev.render_kernel(scope, name)?;
    let driver = scope.driver();
    scope.check(
        "function_set_cache_preference",
        driver.function_set_cache_preference(kernel.func, CachePreference::PreferL1),
    )?;

    let occupancy = scope.check("occupancy", driver.occupancy(kernel.func))?;
    let threads_per_block = occupancy.block_size.max(1);
    let pixels = tile.pixel_count();
    let step = step_samples(
        occupancy,
        dev.info.display_device,
        dev.config.throughput_block_scale,
        pixels,
    );
    log::debug!(
        "path trace tile {}x{} at ({}, {}): {} samples per launch, {} threads per block",
        tile.w,
        tile.h,
        tile.x,
        tile.y,
        step,
        threads_per_block
    );

    for (sample, count) in sample_batches(tile.sample, tile.end_sample(), step) {
        work_tiles.set_host(&[WorkTile::new(tile, sample, count)]);
        dev.memory().copy_to_device(scope, work_tiles)?;
        let Some(descriptor) = work_tiles.device_ptr() else {
            return Err(DeviceError::InvalidRequest("work tile buffer is not resident".into()));
        };

        let total_work = pixels * count as u64;
        let blocks = total_work.div_ceil(threads_per_block as u64) as u32;
        scope.check(
            "launch",
            driver.launch(
                kernel.func,
                Dim3::linear(blocks),
                Dim3::linear(threads_per_block),
                &[descriptor.into(), (total_work as u32).into()],
            ),
        )?;
        scope.synchronize()?;

        tile.sample = sample + count;
        task.progress.update(Some(tile), total_work);

        if tile.sample < tile.end_sample() && task.should_stop(cancel) {
            return Ok(TaskOutcome::Cancelled);
        }
    }

    Ok(TaskOutcome::Completed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn occupancy(min_grid_blocks: u32, block_size: u32) -> Occupancy {
        Occupancy {
            min_grid_blocks,
            block_size,
        }
    }

    #[test]
    fn step_fills_the_device() {
        // 64 blocks × 256 threads over a 64×64 tile.
        assert_eq!(step_samples(occupancy(64, 256), true, 8, 64 * 64), 4);
        assert_eq!(step_samples(occupancy(8, 256), false, 8, 64 * 64), 4);
        assert_eq!(step_samples(occupancy(8, 256), true, 8, 64 * 64), 1);
    }

    #[test]
    fn step_is_at_least_one() {
        assert_eq!(step_samples(occupancy(1, 32), true, 8, 1 << 20), 1);
        assert_eq!(step_samples(occupancy(4, 64), false, 8, 0), 2048);
    }

    #[test]
    fn batches_sum_to_the_requested_range() {
        let batches: Vec<_> = sample_batches(0, 16, 4).collect();
        assert_eq!(batches, vec![(0, 4), (4, 4), (8, 4), (12, 4)]);

        let batches: Vec<_> = sample_batches(3, 13, 4).collect();
        assert_eq!(batches, vec![(3, 4), (7, 4), (11, 2)]);
        assert_eq!(batches.iter().map(|(_, n)| n).sum::<i32>(), 10);

        assert_eq!(sample_batches(5, 5, 4).count(), 0);
    }

    #[test]
    fn work_tile_layout_is_stable() {
        assert_eq!(size_of::<WorkTile>(), 48);
    }
}
