use super::square_blocks;
use crate::device::{ContextScope, DeviceShared};
use crate::error::DeviceError;
use crate::module::kernels;
use crate::task::FilmConvertParams;

/// Converts accumulated radiance into display pixels.
///
/// A shared display buffer is mapped around the launch; a linear fallback
/// buffer is written directly.
pub(crate) fn film_convert(
    dev: &DeviceShared,
    scope: &ContextScope<'_>,
    params: &FilmConvertParams,
) -> Result<(), DeviceError> {
    scope.ensure_clear()?;
    dev.sync_textures(scope)?;

    let name = if params.half_float {
        kernels::CONVERT_TO_HALF_FLOAT
    } else {
        kernels::CONVERT_TO_BYTE
    };
    let kernel = dev.render_kernel(scope, name)?;
    let driver = scope.driver();
    let max_threads = scope.check("function_max_threads", driver.function_max_threads(kernel.func))?;
    let (grid, block) = square_blocks(max_threads, params.w.max(0) as u32, params.h.max(0) as u32);
    let sample_scale = 1.0 / (params.sample + 1) as f32;

    let rgba = dev.memory().map_pixels(scope, params.rgba)?;
    let launched = scope
        .check(
            "launch",
            driver.launch(
                kernel.func,
                grid,
                block,
                &[
                    rgba.into(),
                    params.buffer.into(),
                    sample_scale.into(),
                    params.x.into(),
                    params.y.into(),
                    params.w.into(),
                    params.h.into(),
                    params.offset.into(),
                    params.stride.into(),
                    params.pass_stride.into(),
                ],
            ),
        )
        .and_then(|()| scope.synchronize());
    let unmapped = dev.memory().unmap_pixels(scope, params.rgba);

    launched.and(unmapped)
}
