//! Lumen GPU device backend.
//!
//! This crate runs the compute side of a tiled path tracer on a GPU: it
//! loads the render and filter kernels, manages device memory and textures,
//! and executes render, denoise, shader and film-convert tasks on a worker
//! pool. Hardware access goes through the [`driver::Driver`] trait.

pub mod config;
pub mod denoise;
pub mod device;
pub mod driver;
pub mod error;
pub mod logging;
pub mod memory;
pub mod module;
pub mod render;
pub mod split;
pub mod task;

pub use config::BackendConfig;
pub use device::{capabilities_report, enumerate_devices, DeviceInfo, GpuDevice};
pub use error::DeviceError;
