mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use common::{open, GridTiles, Recorder};
use lumen_device::denoise::{render_passes, DenoiseParams};
use lumen_device::driver::emulated::EmulatedDriver;
use lumen_device::memory::{DataType, DeviceMemory};
use lumen_device::module::kernels::filter;
use lumen_device::task::{DeviceTask, RenderParams, TaskKind, TaskState, TileWork};
use lumen_device::{BackendConfig, GpuDevice};

const FRAME: i32 = 16;
const TILE: i32 = 8;
const SAMPLES: i32 = 4;
const OFFSET: i32 = 4;
const PASS_STRIDE: i32 = OFFSET + render_passes::SIZE;

const COLOR: [f32; 3] = [0.5, 0.25, 1.0];

/// Render buffer whose colour pass holds `color` accumulated over
/// `SAMPLES` samples with no variance.
fn constant_buffer(color: [f32; 3]) -> Vec<f32> {
    let mut data = vec![0.0f32; (FRAME * FRAME * PASS_STRIDE) as usize];
    for pixel in data.chunks_exact_mut(PASS_STRIDE as usize) {
        for c in 0..3 {
            pixel[(OFFSET + render_passes::COLOR) as usize + c] = color[c] * SAMPLES as f32;
            pixel[(OFFSET + render_passes::COLOR_VARIANCE) as usize + c] = color[c] * color[c] * SAMPLES as f32;
        }
    }
    data
}

fn params(radius: i32) -> DenoiseParams {
    DenoiseParams {
        radius,
        denoising_offset: OFFSET,
        ..DenoiseParams::default()
    }
}

fn task(kind: fn(RenderParams) -> TaskKind, tiles: &Arc<GridTiles>, progress: &Arc<Recorder>, radius: i32) -> DeviceTask {
    DeviceTask::new(
        kind(RenderParams {
            tiles: tiles.clone(),
            branched: false,
            denoise: params(radius),
        }),
        progress.clone(),
    )
}

/// Runs one denoise task over a `FRAME × FRAME` buffer and returns it.
fn denoise(
    device: &GpuDevice,
    data: &[f32],
    kind: fn(RenderParams) -> TaskKind,
    work: TileWork,
    radius: i32,
) -> (Vec<f32>, Arc<GridTiles>, Arc<Recorder>) {
    let mut buffer = DeviceMemory::from_slice("render_buffer", DataType::F32, PASS_STRIDE as u32, data);
    device.mem_copy_to(&mut buffer).unwrap();

    let tiles = Arc::new(GridTiles::new(
        FRAME,
        FRAME,
        TILE,
        SAMPLES,
        PASS_STRIDE,
        buffer.device_ptr().unwrap(),
    ));
    tiles.rewind(work);

    let progress = Arc::new(Recorder::default());
    let handle = device.task_add(task(kind, &tiles, &progress, radius));
    device.task_wait();
    assert_eq!(handle.state(), TaskState::Completed, "{:?}", device.error_message());

    let elem = buffer.element_size();
    device.mem_copy_from(&mut buffer, 0, (FRAME * FRAME) as usize, 1, elem).unwrap();
    let values = buffer.read_host::<f32>();
    device.mem_free(&mut buffer).unwrap();
    (values, tiles, progress)
}

fn assert_combined(values: &[f32], color: [f32; 3]) {
    for (i, pixel) in values.chunks_exact(PASS_STRIDE as usize).enumerate() {
        for c in 0..3 {
            let expected = color[c] * SAMPLES as f32;
            assert!(
                (pixel[c] - expected).abs() < 1e-4,
                "pixel {i} channel {c}: {} != {expected}",
                pixel[c]
            );
        }
    }
}

#[test]
fn render_pixels_carry_the_denoising_data_after_the_offset() {
    assert_eq!(PASS_STRIDE, 30);
    assert_eq!(DenoiseParams::default().denoising_offset, OFFSET);
}

#[test]
fn constant_color_survives_denoising() {
    let driver = Arc::new(EmulatedDriver::with_reference_images());
    let device = open(&driver, BackendConfig::default());

    let data = constant_buffer(COLOR);
    let (values, tiles, progress) = denoise(&device, &data, TaskKind::Render, TileWork::Denoise, 2);
    assert!(!device.have_error());
    assert_combined(&values, COLOR);

    // Only the combined pass is written.
    for (out, input) in values.chunks_exact(PASS_STRIDE as usize).zip(data.chunks_exact(PASS_STRIDE as usize)) {
        assert_eq!(out[3..], input[3..]);
    }

    let count = tiles.tile_count();
    assert_eq!(count, 4);
    assert_eq!(tiles.released.lock().unwrap().len(), count);
    assert!(tiles.released.lock().unwrap().iter().all(|t| t.sample == SAMPLES));
    assert_eq!(progress.total(), (FRAME * FRAME) as u64);

    let kernels = driver.launched_kernels();
    assert_eq!(kernels.iter().filter(|k| k.as_str() == filter::FINALIZE).count(), count);
    assert!(!kernels.iter().any(|k| k == "kernel_path_trace"));
}

#[test]
fn denoise_tasks_denoise_whatever_the_tile_says() {
    let driver = Arc::new(EmulatedDriver::with_reference_images());
    let device = open(&driver, BackendConfig::default());

    let data = constant_buffer(COLOR);
    let (values, tiles, _) = denoise(&device, &data, TaskKind::Denoise, TileWork::PathTrace, 1);
    assert_combined(&values, COLOR);
    assert_eq!(tiles.released.lock().unwrap().len(), tiles.tile_count());
    assert!(!driver.launched_kernels().iter().any(|k| k == "kernel_path_trace"));
}

#[test]
fn zero_radius_keeps_each_pixel() {
    let driver = Arc::new(EmulatedDriver::with_reference_images());
    let device = open(&driver, BackendConfig::default());

    let data = constant_buffer(COLOR);
    let (values, _, _) = denoise(&device, &data, TaskKind::Render, TileWork::Denoise, 0);
    assert_combined(&values, COLOR);
}

#[test]
fn empty_accumulators_denoise_to_black() {
    let driver = Arc::new(EmulatedDriver::with_reference_images());
    let device = open(&driver, BackendConfig::default());

    let data = constant_buffer([0.0; 3]);
    let (values, _, _) = denoise(&device, &data, TaskKind::Render, TileWork::Denoise, 1);
    assert!(values.iter().all(|v| v.is_finite()));
    assert_combined(&values, [0.0; 3]);
}

#[test]
fn every_mapped_neighbourhood_is_unmapped() {
    let driver = Arc::new(EmulatedDriver::with_reference_images());
    let device = open(&driver, BackendConfig::default());

    let data = constant_buffer(COLOR);
    let (_, tiles, _) = denoise(&device, &data, TaskKind::Render, TileWork::Denoise, 1);
    let mapped = tiles.mapped.load(Ordering::SeqCst);
    assert_eq!(mapped, tiles.tile_count());
    assert_eq!(tiles.unmapped.load(Ordering::SeqCst), mapped);
}

#[test]
fn a_failed_denoise_still_unmaps_and_releases() {
    let driver = Arc::new(EmulatedDriver::with_reference_images());
    let device = open(&driver, BackendConfig::default());
    let baseline = device.stats().current();

    let mut buffer = DeviceMemory::linear("render_buffer", DataType::F32, PASS_STRIDE as u32, 16);
    device.mem_zero(&mut buffer).unwrap();
    let tiles = Arc::new(
        GridTiles::new(FRAME, FRAME, TILE, SAMPLES, PASS_STRIDE, buffer.device_ptr().unwrap()).with_buffer(None),
    );
    tiles.rewind(TileWork::Denoise);

    let progress = Arc::new(Recorder::default());
    let handle = device.task_add(task(TaskKind::Denoise, &tiles, &progress, 2));
    device.task_wait();

    assert_eq!(handle.state(), TaskState::Cancelled);
    assert!(device.error_message().is_some_and(|m| m.contains("render buffer")));
    assert_eq!(tiles.released.lock().unwrap().len(), 1);
    assert_eq!(tiles.mapped.load(Ordering::SeqCst), 1);
    assert_eq!(tiles.unmapped.load(Ordering::SeqCst), 1);
    assert_eq!(progress.total(), 0);

    device.mem_free(&mut buffer).unwrap();
    assert_eq!(device.stats().current(), baseline);
}
