//! Device tasks and the worker pool running them.
//!
//! A [`DeviceTask`] is one unit of work submitted to a device: rendering or
//! denoising tiles pulled from a [`TileSource`], shader evaluation, or film
//! conversion. Workers report through [`Progress`] and stop cooperatively
//! when cancelled.

mod pool;
mod tile;

use std::sync::Arc;

pub use pool::{CancelToken, TaskHandle, TaskOutcome, TaskPool, TaskState};
pub use tile::{NeighborTiles, RenderTile, TileSource, TileWork};

use crate::denoise::DenoiseParams;
use crate::driver::DevicePtr;
use crate::memory::Residency;

/// Progress sink and cancellation authority of a task.
pub trait Progress: Send + Sync {
    /// Reports `pixel_samples` newly finished pixel samples, optionally for `tile`.
    fn update(&self, tile: Option<&RenderTile>, pixel_samples: u64);

    /// The user asked to stop.
    fn cancel_requested(&self) -> bool;

    /// Queued work must be finished even when cancelled.
    fn finish_queue(&self) -> bool {
        false
    }
}

/// Kind of shader evaluation.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ShaderEvalType {
    Background,
    Displace,
    /// Bake pass with its numeric pass type.
    Bake(i32),
}

#[derive(Debug, Clone)]
pub struct ShaderParams {
    pub input: DevicePtr,
    pub output: DevicePtr,
    pub eval_type: ShaderEvalType,
    /// Bake filter flags.
    pub filter: i32,
    /// First work item.
    pub x: i32,
    /// Number of work items.
    pub w: i32,
    pub offset: i32,
    pub num_samples: i32,
}

#[derive(Debug, Clone)]
pub struct FilmConvertParams {
    /// Render buffer to convert.
    pub buffer: DevicePtr,
    /// Destination pixels (a display buffer or a linear fallback).
    pub rgba: Residency,
    /// Write half floats instead of bytes.
    pub half_float: bool,
    /// Samples accumulated so far, minus one.
    pub sample: i32,
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
    pub offset: i32,
    pub stride: i32,
    pub pass_stride: i32,
}

#[derive(Clone)]
pub struct RenderParams {
    pub tiles: Arc<dyn TileSource>,
    /// Use the branched path integrator.
    pub branched: bool,
    pub denoise: DenoiseParams,
}

impl std::fmt::Debug for RenderParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderParams")
            .field("branched", &self.branched)
            .field("denoise", &self.denoise)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub enum TaskKind {
    /// Path trace (or denoise, per tile) every tile the source hands out.
    Render(RenderParams),
    /// Denoise every tile the source hands out.
    Denoise(RenderParams),
    Shader(ShaderParams),
    FilmConvert(FilmConvertParams),
}

/// A task submitted to a device.
#[derive(Clone)]
pub struct DeviceTask {
    pub kind: TaskKind,
    pub progress: Arc<dyn Progress>,
}

impl DeviceTask {
    pub fn new(kind: TaskKind, progress: Arc<dyn Progress>) -> Self {
        Self { kind, progress }
    }

    /// Whether the task should stop at its next checkpoint.
    ///
    /// Cancellation from the pool or the progress sink is ignored while the
    /// sink asks for the queue to be finished.
    pub fn should_stop(&self, cancel: &CancelToken) -> bool {
        (cancel.is_cancelled() || self.progress.cancel_requested()) && !self.progress.finish_queue()
    }
}

impl std::fmt::Debug for DeviceTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceTask").field("kind", &self.kind).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Flags {
        cancel: AtomicBool,
        finish: AtomicBool,
    }

    impl Progress for Flags {
        fn update(&self, _: Option<&RenderTile>, _: u64) {}

        fn cancel_requested(&self) -> bool {
            self.cancel.load(Ordering::Relaxed)
        }

        fn finish_queue(&self) -> bool {
            self.finish.load(Ordering::Relaxed)
        }
    }

    fn task(progress: Arc<Flags>) -> DeviceTask {
        let params = ShaderParams {
            input: DevicePtr::new(0x100).unwrap(),
            output: DevicePtr::new(0x200).unwrap(),
            eval_type: ShaderEvalType::Background,
            filter: 0,
            x: 0,
            w: 1,
            offset: 0,
            num_samples: 1,
        };
        DeviceTask::new(TaskKind::Shader(params), progress)
    }

    #[test]
    fn finish_queue_overrides_cancellation() {
        let flags = Arc::new(Flags {
            cancel: AtomicBool::new(false),
            finish: AtomicBool::new(false),
        });
        let task = task(flags.clone());
        let token = CancelToken::default();
        assert!(!task.should_stop(&token));

        flags.cancel.store(true, Ordering::Relaxed);
        assert!(task.should_stop(&token));

        flags.finish.store(true, Ordering::Relaxed);
        assert!(!task.should_stop(&token));

        flags.finish.store(false, Ordering::Relaxed);
        flags.cancel.store(false, Ordering::Relaxed);
        token.cancel();
        assert!(task.should_stop(&token));
    }
}
