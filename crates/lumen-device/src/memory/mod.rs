//! Device memory.
//!
//! [`DeviceMemory`] describes one allocation and is owned by the caller;
//! [`MemoryManager`] performs the driver work and tracks what is resident.
//! Textures go either to bindless texture objects indexed through
//! [`TextureSlots`] or to texture references bound in the render module.

mod allocation;
mod manager;
mod slots;
mod stats;

pub use allocation::{DataType, DeviceMemory, Extension, Interpolation, MemoryKind, Residency};
pub use manager::{MemoryManager, PixelAlloc};
pub(crate) use manager::pixel_format;
pub use slots::{legacy_bind_name, texture_slot, TextureInfo, TextureSlots};
pub use stats::MemStats;
