//! Device probe: lists devices, prints capabilities, runs a smoke render.
//!
//! ```text
//! lumen-probe list
//! lumen-probe caps
//! lumen-probe render [--size N] [--samples N] [--tile N] [--split] [--out image.png]
//! ```
//!
//! Without the `wgpu` feature every command runs on the emulated driver with
//! the reference kernels, so the probe works on machines without a GPU.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{bail, Context, Result};
use lumen_device::denoise::DenoiseParams;
use lumen_device::device::PixelFormat;
use lumen_device::driver::emulated::{EmulatedCompiler, EmulatedDriver};
use lumen_device::driver::Driver;
use lumen_device::logging::{human_number, init_logging, LoggingConfig};
use lumen_device::memory::{DataType, DeviceMemory};
use lumen_device::module::RequestedFeatures;
use lumen_device::task::{
    DeviceTask, FilmConvertParams, NeighborTiles, Progress, RenderParams, RenderTile, TaskKind, TileSource,
};
use lumen_device::{capabilities_report, enumerate_devices, BackendConfig, GpuDevice};

#[derive(Debug)]
struct RenderArgs {
    size: u32,
    samples: i32,
    tile: u32,
    split: bool,
    out: Option<PathBuf>,
}

impl Default for RenderArgs {
    fn default() -> Self {
        Self {
            size: 128,
            samples: 16,
            tile: 32,
            split: false,
            out: None,
        }
    }
}

fn parse_render_args(args: &[String]) -> Result<RenderArgs> {
    let mut parsed = RenderArgs::default();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        let mut value = |name: &str| iter.next().with_context(|| format!("{name} needs a value"));
        match arg.as_str() {
            "--size" => parsed.size = value("--size")?.parse().context("--size")?,
            "--samples" => parsed.samples = value("--samples")?.parse().context("--samples")?,
            "--tile" => parsed.tile = value("--tile")?.parse().context("--tile")?,
            "--out" => parsed.out = Some(PathBuf::from(value("--out")?)),
            "--split" => parsed.split = true,
            other => bail!("unknown render option {other}"),
        }
    }
    if parsed.size == 0 || parsed.tile == 0 || parsed.samples <= 0 {
        bail!("size, tile and samples must be positive");
    }
    Ok(parsed)
}

fn main() -> Result<()> {
    init_logging(LoggingConfig::default());

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = args.first().map(String::as_str).unwrap_or("list");

    match command {
        "list" => list(open_driver()?.as_ref()),
        "caps" => {
            print!("{}", capabilities_report(open_driver()?.as_ref())?);
            Ok(())
        }
        "render" => render(parse_render_args(&args[1..])?),
        other => bail!("unknown command {other} (expected list, caps or render)"),
    }
}

#[cfg(feature = "wgpu")]
fn open_driver() -> Result<Arc<dyn Driver>> {
    let driver = lumen_device::driver::wgpu_driver::WgpuDriver::new().context("failed to open wgpu")?;
    Ok(Arc::new(driver))
}

#[cfg(not(feature = "wgpu"))]
fn open_driver() -> Result<Arc<dyn Driver>> {
    Ok(Arc::new(EmulatedDriver::with_reference_images()))
}

fn list(driver: &dyn Driver) -> Result<()> {
    let devices = enumerate_devices(driver)?;
    if devices.is_empty() {
        println!("no usable devices on the {} driver", driver.name());
    }
    for info in devices {
        println!(
            "{:>2}  {:<12} {} (compute {}{})",
            info.num,
            info.id,
            info.description,
            info.architecture,
            if info.display_device { ", display" } else { "" }
        );
    }
    Ok(())
}

// ── smoke render ────────────────────────────────────────────────────────────

/// Hands out a frame's tiles in scanline order.
struct FrameTiles {
    pending: Mutex<Vec<RenderTile>>,
    released: AtomicU64,
}

impl FrameTiles {
    fn new(size: u32, tile: u32, samples: i32, buffer: &DeviceMemory) -> Result<Self> {
        let ptr = buffer.device_ptr().context("render buffer is not resident")?;
        let (size, tile) = (size as i32, tile as i32);

        let mut tiles = Vec::new();
        for y in (0..size).step_by(tile as usize) {
            for x in (0..size).step_by(tile as usize) {
                let mut t = RenderTile::new(x, y, tile.min(size - x), tile.min(size - y), size);
                t.num_samples = samples;
                t.buffer = Some(ptr);
                tiles.push(t);
            }
        }
        tiles.reverse();

        Ok(Self {
            pending: Mutex::new(tiles),
            released: AtomicU64::new(0),
        })
    }
}

impl TileSource for FrameTiles {
    fn acquire_tile(&self) -> Option<RenderTile> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).pop()
    }

    fn release_tile(&self, _tile: RenderTile) {
        self.released.fetch_add(1, Ordering::Relaxed);
    }

    fn map_neighbors(&self, center: &RenderTile) -> NeighborTiles {
        let mut tiles = NeighborTiles::default();
        tiles[4] = Some(*center);
        tiles
    }

    fn unmap_neighbors(&self, _tiles: NeighborTiles) {}
}

#[derive(Default)]
struct Counter {
    pixel_samples: AtomicU64,
}

impl Progress for Counter {
    fn update(&self, _tile: Option<&RenderTile>, pixel_samples: u64) {
        self.pixel_samples.fetch_add(pixel_samples, Ordering::Relaxed);
    }

    fn cancel_requested(&self) -> bool {
        false
    }
}

fn render(args: RenderArgs) -> Result<()> {
    let driver = Arc::new(EmulatedDriver::with_reference_images());
    let info = enumerate_devices(driver.as_ref())?
        .into_iter()
        .next()
        .context("no usable device")?;

    let config = BackendConfig {
        split_kernel: args.split,
        ..BackendConfig::from_env()
    };
    let device = GpuDevice::new(driver, info, config, None)?;
    device.load_kernels(&RequestedFeatures::default(), &EmulatedCompiler::default())?;

    let (size, pixels) = (args.size, args.size as usize * args.size as usize);
    let mut buffer = DeviceMemory::linear("render_buffer", DataType::F32, 4, pixels);
    device.mem_alloc(&mut buffer)?;
    device.mem_zero(&mut buffer)?;

    let tiles = Arc::new(FrameTiles::new(size, args.tile, args.samples, &buffer)?);
    let progress = Arc::new(Counter::default());
    let started = Instant::now();

    device.task_add(DeviceTask::new(
        TaskKind::Render(RenderParams {
            tiles: tiles.clone(),
            branched: false,
            denoise: DenoiseParams::default(),
        }),
        progress.clone(),
    ));
    device.task_wait();
    if let Some(message) = device.error_message() {
        bail!("render failed: {message}");
    }

    println!(
        "rendered {size}x{size} at {} samples: {} pixel samples, {} tiles in {:.2?}",
        args.samples,
        human_number(progress.pixel_samples.load(Ordering::Relaxed)),
        tiles.released.load(Ordering::Relaxed),
        started.elapsed()
    );

    if let Some(out) = &args.out {
        let mut rgba = DeviceMemory::pixels("rgba", PixelFormat::Rgba8, size, size);
        device.mem_alloc(&mut rgba)?;
        let convert = FilmConvertParams {
            buffer: buffer.device_ptr().context("render buffer is not resident")?,
            rgba: rgba.residency().context("pixel buffer is not resident")?,
            half_float: false,
            sample: args.samples - 1,
            x: 0,
            y: 0,
            w: size as i32,
            h: size as i32,
            offset: 0,
            stride: size as i32,
            pass_stride: 4,
        };
        device.task_add(DeviceTask::new(TaskKind::FilmConvert(convert), progress.clone()));
        if let Some(message) = device.error_message() {
            bail!("film conversion failed: {message}");
        }

        device.mem_copy_from(&mut rgba, 0, pixels, 1, 4)?;
        let bytes = rgba.host().context("pixel buffer has no host copy")?;
        image::save_buffer(out, bytes, size, size, image::ColorType::Rgba8)
            .with_context(|| format!("failed to write {}", out.display()))?;
        println!("wrote {}", out.display());
        device.mem_free(&mut rgba)?;
    }

    device.mem_free(&mut buffer)?;
    Ok(())
}
