//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use lumen_device::denoise::DenoiseParams;
use lumen_device::device::DisplayInterop;
use lumen_device::driver::emulated::{EmulatedCompiler, EmulatedDriver};
use lumen_device::driver::DevicePtr;
use lumen_device::module::RequestedFeatures;
use lumen_device::task::{
    DeviceTask, NeighborTiles, Progress, RenderParams, RenderTile, TaskKind, TileSource, TileWork,
};
use lumen_device::{enumerate_devices, BackendConfig, GpuDevice};

/// Opens device 0 of `driver` and loads the kernels.
pub fn open(driver: &Arc<EmulatedDriver>, config: BackendConfig) -> GpuDevice {
    open_with(driver, config, None)
}

pub fn open_with(
    driver: &Arc<EmulatedDriver>,
    config: BackendConfig,
    interop: Option<Arc<dyn DisplayInterop>>,
) -> GpuDevice {
    let info = enumerate_devices(driver.as_ref()).unwrap().remove(0);
    let device = GpuDevice::new(driver.clone(), info, config, interop).unwrap();
    device
        .load_kernels(&RequestedFeatures::default(), &EmulatedCompiler::default())
        .unwrap();
    device
}

/// A frame cut into a grid of tiles sharing one render buffer.
pub struct GridTiles {
    all: Vec<RenderTile>,
    pending: Mutex<Vec<RenderTile>>,
    pub released: Mutex<Vec<RenderTile>>,
    pub mapped: AtomicUsize,
    pub unmapped: AtomicUsize,
}

impl GridTiles {
    /// `width × height` frame with `tile`-sized tiles; every tile renders
    /// samples `0..samples` into `buffer` with `pass_stride` floats per pixel.
    pub fn new(width: i32, height: i32, tile: i32, samples: i32, pass_stride: i32, buffer: DevicePtr) -> Self {
        let mut all = Vec::new();
        for y in (0..height).step_by(tile as usize) {
            for x in (0..width).step_by(tile as usize) {
                let mut t = RenderTile::new(x, y, tile.min(width - x), tile.min(height - y), width);
                t.num_samples = samples;
                t.pass_stride = pass_stride;
                t.buffer = Some(buffer);
                all.push(t);
            }
        }
        let mut pending = all.clone();
        pending.reverse();

        Self {
            all,
            pending: Mutex::new(pending),
            released: Mutex::new(Vec::new()),
            mapped: AtomicUsize::new(0),
            unmapped: AtomicUsize::new(0),
        }
    }

    /// Points every tile at `buffer` instead.
    pub fn with_buffer(mut self, buffer: Option<DevicePtr>) -> Self {
        for tile in self.all.iter_mut().chain(self.pending.get_mut().unwrap().iter_mut()) {
            tile.buffer = buffer;
        }
        self
    }

    /// Hands out every tile again with `work`, marked as fully sampled.
    pub fn rewind(&self, work: TileWork) {
        let mut pending: Vec<RenderTile> = self
            .all
            .iter()
            .map(|t| RenderTile {
                work,
                sample: t.end_sample(),
                ..*t
            })
            .collect();
        pending.reverse();
        *self.pending.lock().unwrap() = pending;
        self.released.lock().unwrap().clear();
    }

    pub fn tile_count(&self) -> usize {
        self.all.len()
    }

    fn containing(&self, x: i32, y: i32) -> Option<RenderTile> {
        self.all
            .iter()
            .find(|t| x >= t.x && x < t.x + t.w && y >= t.y && y < t.y + t.h)
            .map(|t| RenderTile {
                sample: t.end_sample(),
                ..*t
            })
    }
}

impl TileSource for GridTiles {
    fn acquire_tile(&self) -> Option<RenderTile> {
        self.pending.lock().unwrap().pop()
    }

    fn release_tile(&self, tile: RenderTile) {
        self.released.lock().unwrap().push(tile);
    }

    fn map_neighbors(&self, center: &RenderTile) -> NeighborTiles {
        self.mapped.fetch_add(1, Ordering::SeqCst);
        let mut tiles = NeighborTiles::default();
        for (i, slot) in tiles.iter_mut().enumerate() {
            let (dx, dy) = (i as i32 % 3 - 1, i as i32 / 3 - 1);
            let x = match dx {
                -1 => center.x - 1,
                0 => center.x,
                _ => center.x + center.w,
            };
            let y = match dy {
                -1 => center.y - 1,
                0 => center.y,
                _ => center.y + center.h,
            };
            *slot = self.containing(x, y);
        }
        tiles
    }

    fn unmap_neighbors(&self, _tiles: NeighborTiles) {
        self.unmapped.fetch_add(1, Ordering::SeqCst);
    }
}

/// Progress sink counting pixel samples, optionally asking to stop after a
/// number of updates.
#[derive(Default)]
pub struct Recorder {
    pub pixel_samples: AtomicU64,
    pub updates: AtomicU64,
    /// Pixel samples of every update, in order.
    pub steps: Mutex<Vec<u64>>,
    pub cancel_after: Option<u64>,
    pub cancel: AtomicBool,
    pub finish_queue: bool,
}

impl Recorder {
    pub fn cancelling_after(updates: u64) -> Self {
        Self {
            cancel_after: Some(updates),
            ..Self::default()
        }
    }

    /// Asks to stop from the start while insisting the queue is finished.
    pub fn finishing_queue() -> Self {
        Self {
            cancel: AtomicBool::new(true),
            finish_queue: true,
            ..Self::default()
        }
    }

    pub fn steps(&self) -> Vec<u64> {
        self.steps.lock().unwrap().clone()
    }

    pub fn total(&self) -> u64 {
        self.pixel_samples.load(Ordering::SeqCst)
    }
}

impl Progress for Recorder {
    fn update(&self, _tile: Option<&RenderTile>, pixel_samples: u64) {
        self.pixel_samples.fetch_add(pixel_samples, Ordering::SeqCst);
        self.steps.lock().unwrap().push(pixel_samples);
        let updates = self.updates.fetch_add(1, Ordering::SeqCst) + 1;
        if self.cancel_after.is_some_and(|n| updates >= n) {
            self.cancel.store(true, Ordering::SeqCst);
        }
    }

    fn cancel_requested(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    fn finish_queue(&self) -> bool {
        self.finish_queue
    }
}

pub fn render_task(tiles: &Arc<GridTiles>, progress: &Arc<Recorder>) -> DeviceTask {
    DeviceTask::new(
        TaskKind::Render(RenderParams {
            tiles: tiles.clone(),
            branched: false,
            denoise: DenoiseParams::default(),
        }),
        progress.clone(),
    )
}
