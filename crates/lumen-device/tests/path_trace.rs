mod common;

use std::sync::Arc;

use common::{open, render_task, GridTiles, Recorder};
use lumen_device::driver::emulated::reference::radiance;
use lumen_device::driver::emulated::{EmulatedDevice, EmulatedDriver};
use lumen_device::memory::{DataType, DeviceMemory};
use lumen_device::task::TaskState;
use lumen_device::BackendConfig;

/// A device small enough that the split state stays a few MiB.
fn small_driver() -> Arc<EmulatedDriver> {
    Arc::new(EmulatedDriver::new(vec![EmulatedDevice::new("small").memory(16 << 20)]).reference_images())
}

fn render(config: BackendConfig, size: i32, tile: i32, samples: i32) -> (Arc<EmulatedDriver>, Vec<f32>, Arc<Recorder>) {
    let driver = small_driver();
    let device = open(&driver, config);

    let pixels = (size * size) as usize;
    let mut buffer = DeviceMemory::linear("render_buffer", DataType::F32, 4, pixels);
    device.mem_zero(&mut buffer).unwrap();

    let tiles = Arc::new(GridTiles::new(size, size, tile, samples, 4, buffer.device_ptr().unwrap()));
    let progress = Arc::new(Recorder::default());
    let handle = device.task_add(render_task(&tiles, &progress));
    device.task_wait();

    assert!(!device.have_error(), "{:?}", device.error_message());
    assert_eq!(handle.state(), TaskState::Completed);
    assert_eq!(tiles.released.lock().unwrap().len(), tiles.tile_count());

    device.mem_copy_from(&mut buffer, 0, pixels, 1, 16).unwrap();
    let values = buffer.read_host::<f32>();
    device.mem_free(&mut buffer).unwrap();
    (driver, values, progress)
}

fn expected(size: i32, samples: i32) -> Vec<f32> {
    let mut values = Vec::with_capacity((size * size * 4) as usize);
    for y in 0..size {
        for x in 0..size {
            let mut sum = 0.0f32;
            for sample in 0..samples {
                sum += radiance(x, y, sample);
            }
            values.extend([sum, sum, sum, samples as f32]);
        }
    }
    values
}

#[test]
fn one_tile_renders_in_four_launches_of_four_samples() {
    let (driver, values, progress) = render(BackendConfig::default(), 64, 64, 16);

    let launches: Vec<_> = driver
        .launches()
        .into_iter()
        .filter(|l| l.kernel == "kernel_path_trace")
        .collect();
    assert_eq!(launches.len(), 4);
    for launch in &launches {
        // 64 × 64 pixels × 4 samples over blocks of 256 threads.
        assert_eq!(launch.block.x, 256);
        assert_eq!(launch.grid.x, 64 * 64 * 4 / 256);
    }
    // Each launch reports its whole batch.
    assert_eq!(progress.steps(), vec![64 * 64 * 4; 4]);
    assert_eq!(progress.total(), 64 * 64 * 16);
    assert_eq!(values, expected(64, 16));
}

#[test]
fn every_tile_of_the_frame_is_rendered() {
    let (_, values, progress) = render(BackendConfig::default(), 48, 20, 3);
    assert_eq!(progress.total(), 48 * 48 * 3);
    assert_eq!(values, expected(48, 3));
}

#[test]
fn split_kernel_matches_the_megakernel() {
    let split = BackendConfig {
        split_kernel: true,
        ..BackendConfig::default()
    };
    let (driver, split_values, progress) = render(split, 40, 16, 5);
    let (_, mega_values, _) = render(BackendConfig::default(), 40, 16, 5);

    assert_eq!(progress.total(), 40 * 40 * 5);
    assert_eq!(split_values, mega_values);

    let kernels = driver.launched_kernels();
    assert!(kernels.iter().any(|k| k == "kernel_data_init"));
    assert!(kernels.iter().any(|k| k == "kernel_buffer_update"));
    assert!(!kernels.iter().any(|k| k == "kernel_path_trace"));
}

#[test]
fn split_sizes_follow_the_state_probe() {
    let driver = small_driver();
    let config = BackendConfig {
        split_kernel: true,
        ..BackendConfig::default()
    };
    let device = open(&driver, config);

    assert_eq!(device.split_state_size(1000).unwrap(), 64_000);
    assert_eq!(device.split_local_size(), [32, 1]);

    let [gx, gy] = device.split_global_size().unwrap();
    assert_eq!(gx % 32, 0);
    assert_eq!(gy % 16, 0);
    assert!(gx as u64 * gy as u64 * 64 <= 8 << 20);
    assert!(!device.have_error());
}

#[test]
fn cancelled_split_render_keeps_the_finished_batches() {
    let driver = small_driver();
    let config = BackendConfig {
        split_kernel: true,
        ..BackendConfig::default()
    };
    let device = open(&driver, config);

    let mut buffer = DeviceMemory::linear("render_buffer", DataType::F32, 4, 64 * 64);
    device.mem_zero(&mut buffer).unwrap();

    // The split state holds far fewer threads than 64 × 64 × 64 paths.
    let [gx, gy] = device.split_global_size().unwrap();
    assert!((gx * gy).div_ceil(64 * 64) < 64);

    let tiles = Arc::new(GridTiles::new(64, 64, 64, 64, 4, buffer.device_ptr().unwrap()));
    let progress = Arc::new(Recorder::cancelling_after(1));
    let handle = device.task_add(render_task(&tiles, &progress));
    device.task_wait();

    assert_eq!(handle.state(), TaskState::Cancelled);
    assert!(!device.have_error());
    let released = tiles.released.lock().unwrap().clone();
    assert_eq!(released.len(), 1);
    let done = released[0].sample;
    assert!(done > 0 && done < 64, "{done} samples");
    assert_eq!(progress.steps(), vec![64 * 64 * done as u64]);

    device.mem_free(&mut buffer).unwrap();
}
