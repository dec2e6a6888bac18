mod common;

use std::sync::Arc;

use common::{open, render_task, GridTiles, Recorder};
use lumen_device::driver::emulated::EmulatedDriver;
use lumen_device::memory::{DataType, DeviceMemory};
use lumen_device::task::{
    DeviceTask, FilmConvertParams, ShaderEvalType, ShaderParams, TaskKind, TaskState,
};
use lumen_device::BackendConfig;

#[test]
fn cancelled_render_releases_what_it_acquired() {
    let driver = Arc::new(EmulatedDriver::with_reference_images());
    let device = open(&driver, BackendConfig::default());

    let mut buffer = DeviceMemory::linear("render_buffer", DataType::F32, 4, 128 * 64);
    device.mem_zero(&mut buffer).unwrap();

    // Two 64 × 64 tiles of 16 samples, four samples per launch.
    let tiles = Arc::new(GridTiles::new(128, 64, 64, 16, 4, buffer.device_ptr().unwrap()));
    let progress = Arc::new(Recorder::cancelling_after(1));
    let handle = device.task_add(render_task(&tiles, &progress));
    device.task_wait();

    assert_eq!(handle.state(), TaskState::Cancelled);
    assert!(!device.have_error());

    let released = tiles.released.lock().unwrap().clone();
    assert_eq!(released.len(), 1);
    assert_eq!(released[0].sample, 4);
    assert_eq!(progress.total(), 64 * 64 * 4);

    device.mem_free(&mut buffer).unwrap();
}

#[test]
fn finishing_the_queue_outlasts_a_cancel_request() {
    let driver = Arc::new(EmulatedDriver::with_reference_images());
    let device = open(&driver, BackendConfig::default());

    let mut buffer = DeviceMemory::linear("render_buffer", DataType::F32, 4, 128 * 64);
    device.mem_zero(&mut buffer).unwrap();

    let tiles = Arc::new(GridTiles::new(128, 64, 64, 16, 4, buffer.device_ptr().unwrap()));
    let progress = Arc::new(Recorder::finishing_queue());
    let handle = device.task_add(render_task(&tiles, &progress));
    device.task_wait();

    assert_eq!(handle.state(), TaskState::Completed);
    let released = tiles.released.lock().unwrap().clone();
    assert_eq!(released.len(), 2);
    assert!(released.iter().all(|t| t.sample == 16));
    assert_eq!(progress.steps(), vec![64 * 64 * 4; 8]);

    device.mem_free(&mut buffer).unwrap();
}

#[test]
fn failed_task_latches_its_error_and_later_calls_fail_fast() {
    let driver = Arc::new(EmulatedDriver::with_reference_images());
    let device = open(&driver, BackendConfig::default());

    // Tiles without a render buffer make the kernel fail.
    let mut buffer = DeviceMemory::linear("render_buffer", DataType::F32, 4, 16);
    device.mem_alloc(&mut buffer).unwrap();
    let tiles = Arc::new(GridTiles::new(4, 4, 4, 1, 4, buffer.device_ptr().unwrap()).with_buffer(None));

    let progress = Arc::new(Recorder::default());
    let handle = device.task_add(render_task(&tiles, &progress));
    device.task_wait();

    assert_eq!(handle.state(), TaskState::Cancelled);
    assert!(device.have_error());
    let message = device.error_message().unwrap();
    assert_eq!(tiles.released.lock().unwrap().len(), 1);

    let mut other = DeviceMemory::linear("other", DataType::F32, 1, 4);
    assert!(device.mem_alloc(&mut other).is_err());
    assert_eq!(device.error_message().unwrap(), message);

    // Releasing still goes through.
    device.mem_free(&mut buffer).unwrap();
    assert!(!buffer.is_resident());
}

#[test]
fn shader_evaluation_runs_every_sample_in_chunks() {
    let driver = Arc::new(EmulatedDriver::with_reference_images());
    let config = BackendConfig {
        shader_chunk_size: 3,
        ..BackendConfig::default()
    };
    let device = open(&driver, config);

    let mut input = DeviceMemory::linear("shader_input", DataType::U32, 4, 8);
    let mut output = DeviceMemory::linear("shader_output", DataType::F32, 4, 8);
    device.mem_copy_to(&mut input).unwrap();
    device.mem_zero(&mut output).unwrap();

    let progress = Arc::new(Recorder::default());
    let params = ShaderParams {
        input: input.device_ptr().unwrap(),
        output: output.device_ptr().unwrap(),
        eval_type: ShaderEvalType::Background,
        filter: 0,
        x: 1,
        w: 7,
        offset: 0,
        num_samples: 2,
    };
    let handle = device.task_add(DeviceTask::new(TaskKind::Shader(params), progress.clone()));
    device.task_wait();
    assert_eq!(handle.state(), TaskState::Completed);

    // Chunks of 3, 3 and 1 items for each of the two samples.
    let launches = driver.launched_kernels();
    assert_eq!(launches.iter().filter(|k| *k == "kernel_background").count(), 6);
    assert_eq!(progress.total(), 14);

    device.mem_copy_from(&mut output, 0, 8, 1, 16).unwrap();
    let values = output.read_host::<[f32; 4]>();
    assert_eq!(values[0], [0.0; 4]);
    assert!(values[1..].iter().all(|v| *v == [2.0; 4]));

    device.mem_free(&mut input).unwrap();
    device.mem_free(&mut output).unwrap();
}

#[test]
fn film_convert_finishes_before_task_add_returns() {
    let driver = Arc::new(EmulatedDriver::with_reference_images());
    let device = open(&driver, BackendConfig::default());

    let mut buffer = DeviceMemory::from_slice("render_buffer", DataType::F32, 4, &[[2.0f32, 1.0, 0.0, 2.0]; 4]);
    device.mem_copy_to(&mut buffer).unwrap();
    let mut rgba = DeviceMemory::pixels("rgba", lumen_device::device::PixelFormat::Rgba8, 2, 2);
    device.mem_alloc(&mut rgba).unwrap();
    assert!(device.is_background());

    let params = FilmConvertParams {
        buffer: buffer.device_ptr().unwrap(),
        rgba: rgba.residency().unwrap(),
        half_float: false,
        // Two samples accumulated.
        sample: 1,
        x: 0,
        y: 0,
        w: 2,
        h: 2,
        offset: 0,
        stride: 2,
        pass_stride: 4,
    };
    let handle = device.task_add(DeviceTask::new(TaskKind::FilmConvert(params), Arc::new(Recorder::default())));
    assert_eq!(handle.state(), TaskState::Completed);

    device.mem_copy_from(&mut rgba, 0, 2, 2, 4).unwrap();
    let pixels = rgba.host().unwrap();
    assert_eq!(&pixels[..4], &[255, 128, 0, 255]);
    assert_eq!(pixels.len(), 16);

    device.mem_free(&mut rgba).unwrap();
    device.mem_free(&mut buffer).unwrap();
}

#[test]
fn device_keeps_working_after_task_cancel() {
    let driver = Arc::new(EmulatedDriver::with_reference_images());
    let device = open(&driver, BackendConfig::default());
    device.task_cancel();

    let mut buffer = DeviceMemory::linear("render_buffer", DataType::F32, 4, 16 * 16);
    device.mem_zero(&mut buffer).unwrap();
    let tiles = Arc::new(GridTiles::new(16, 16, 8, 2, 4, buffer.device_ptr().unwrap()));
    let progress = Arc::new(Recorder::default());
    let handle = device.task_add(render_task(&tiles, &progress));
    device.task_wait();

    assert_eq!(handle.state(), TaskState::Completed);
    assert_eq!(tiles.released.lock().unwrap().len(), 4);
    assert_eq!(progress.total(), 16 * 16 * 2);
    device.mem_free(&mut buffer).unwrap();
}
