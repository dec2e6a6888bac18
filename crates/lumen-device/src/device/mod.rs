//! GPU device: context scope, enumeration, display interop and the backend.
//!
//! This module is responsible for:
//! - creating the driver context and making it current around every call
//! - enumerating usable devices and reporting their capabilities
//! - owning memory, kernels and the task pool of an open device

mod context;
mod gpu;
mod info;
mod interop;

pub use context::{ContextScope, DeviceContext};
pub use gpu::GpuDevice;
pub use info::{
    capabilities_report, enumerate_devices, DeviceInfo, BINDLESS_COMPUTE_MAJOR, MIN_COMPUTE_MAJOR,
};
pub use interop::{DisplayBuffer, DisplayInterop, DrawHooks, DrawRect, PixelFormat};

pub(crate) use gpu::DeviceShared;
