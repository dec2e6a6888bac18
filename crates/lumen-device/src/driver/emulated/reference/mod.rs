//! CPU reference kernels for every kernel the backend launches.
//!
//! The render image accumulates a deterministic per-pixel radiance instead of
//! tracing rays, so results are predictable; the filter image implements the
//! denoising stages in simplified but self-consistent form.

mod filter;
mod render;

pub use filter::filter_image;
pub use render::{radiance, render_image, SplitHeader};

use crate::driver::{DevicePtr, DriverError};
use crate::module::ModuleKind;

use super::image::KernelContext;

pub const RENDER_IMAGE: &str = "render";
pub const FILTER_IMAGE: &str = "filter";

/// Name of the reference image serving modules of `kind`.
pub fn image_name(kind: ModuleKind) -> &'static str {
    match kind {
        ModuleKind::Render | ModuleKind::SplitRender => RENDER_IMAGE,
        ModuleKind::Filter => FILTER_IMAGE,
    }
}

/// Fails unless the launch covers `w × h` threads in 2D.
fn covers(ctx: &KernelContext<'_>, w: i32, h: i32) -> Result<(), DriverError> {
    let (tx, ty) = (
        ctx.grid.x as u64 * ctx.block.x as u64,
        ctx.grid.y as u64 * ctx.block.y as u64,
    );
    if tx < w.max(0) as u64 || ty < h.max(0) as u64 {
        return Err(DriverError::LaunchFailed(format!(
            "launch of {tx}x{ty} threads does not cover {w}x{h}"
        )));
    }
    Ok(())
}

/// A float array read from device memory and written back on demand.
///
/// Only the prefix up to the last element set is written back.
struct Plane {
    ptr: DevicePtr,
    data: Vec<f32>,
    dirty_end: usize,
}

impl Plane {
    fn load(ctx: &KernelContext<'_>, ptr: DevicePtr) -> Result<Self, DriverError> {
        Ok(Self {
            ptr,
            data: ctx.read_f32s(ptr)?,
            dirty_end: 0,
        })
    }

    fn get(&self, index: usize) -> Result<f32, DriverError> {
        self.data.get(index).copied().ok_or_else(|| out_of_range(self.ptr, index))
    }

    fn set(&mut self, index: usize, value: f32) -> Result<(), DriverError> {
        let slot = self.data.get_mut(index).ok_or_else(|| out_of_range(self.ptr, index))?;
        *slot = value;
        self.dirty_end = self.dirty_end.max(index + 1);
        Ok(())
    }

    fn add(&mut self, index: usize, value: f32) -> Result<(), DriverError> {
        let current = self.get(index)?;
        self.set(index, current + value)
    }

    fn store(self, ctx: &mut KernelContext<'_>) -> Result<(), DriverError> {
        ctx.write_f32s(self.ptr, &self.data[..self.dirty_end])
    }
}

fn out_of_range(ptr: DevicePtr, index: usize) -> DriverError {
    DriverError::LaunchFailed(format!("float {index} past {ptr:?} is outside its allocation"))
}
