use super::{covers, Plane, FILTER_IMAGE};
use crate::denoise::{passes, render_passes, TilesInfo, TRANSFORM_SIZE, XTWX_SIZE, XTWY_SIZE};
use crate::driver::emulated::image::{KernelContext, ModuleImage};
use crate::driver::{DevicePtr, DriverError};
use crate::module::kernels::filter;

/// The filter module image.
pub fn filter_image() -> ModuleImage {
    ModuleImage::new(FILTER_IMAGE)
        .kernel(filter::NLM_CALC_DIFFERENCE, nlm_calc_difference)
        .kernel(filter::NLM_BLUR, nlm_blur)
        .kernel(filter::NLM_CALC_WEIGHT, nlm_calc_weight)
        .kernel(filter::NLM_UPDATE_OUTPUT, nlm_update_output)
        .kernel(filter::NLM_NORMALIZE, nlm_normalize)
        .kernel(filter::NLM_CONSTRUCT_GRAMIAN, nlm_construct_gramian)
        .kernel(filter::CONSTRUCT_TRANSFORM, construct_transform)
        .kernel(filter::FINALIZE, finalize)
        .kernel(filter::DIVIDE_SHADOW, divide_shadow)
        .kernel(filter::GET_FEATURE, get_feature)
        .kernel(filter::DETECT_OUTLIERS, detect_outliers)
        .kernel(filter::COMBINE_HALVES, combine_halves)
}

/// Pixels `(x, y)` of a `[x0, y0, x1, y1]` rect.
fn pixels(rect: [i32; 4]) -> impl Iterator<Item = (i32, i32)> {
    (rect[1]..rect[3]).flat_map(move |y| (rect[0]..rect[2]).map(move |x| (x, y)))
}

fn at(x: i32, y: i32, stride: i32) -> usize {
    (y * stride + x) as usize
}

fn align_up(value: i32, alignment: i32) -> i32 {
    (value + alignment - 1) / alignment * alignment
}

fn luminance(rgb: [f32; 3]) -> f32 {
    0.2126 * rgb[0] + 0.7152 * rgb[1] + 0.0722 * rgb[2]
}

// ── non-local means ─────────────────────────────────────────────────────────

fn nlm_calc_difference(ctx: &mut KernelContext<'_>) -> Result<(), DriverError> {
    let dx = ctx.arg_i32(0)?;
    let dy = ctx.arg_i32(1)?;
    let guide = Plane::load(ctx, ctx.arg_ptr(2)?)?;
    let variance = Plane::load(ctx, ctx.arg_ptr(3)?)?;
    let mut difference = Plane::load(ctx, ctx.arg_ptr(4)?)?;
    let rect = ctx.arg_int4(5)?;
    let stride = ctx.arg_i32(6)?;
    let channel_offset = ctx.arg_i32(7)?.max(0) as usize;
    let a = ctx.arg_f32(8)?;
    let k_2 = ctx.arg_f32(9)?;
    covers(ctx, rect[2], rect[3])?;

    let channels = if channel_offset == 0 { 1 } else { 3 };
    for (x, y) in pixels(rect) {
        let p = at(x, y, stride);
        let q = at(x + dx, y + dy, stride);
        let mut sum = 0.0;
        for c in 0..channels {
            let o = c * channel_offset;
            let (gp, gq) = (guide.get(p + o)?, guide.get(q + o)?);
            let (vp, vq) = (variance.get(p + o)?, variance.get(q + o)?);
            sum += ((gp - gq) * (gp - gq) - a * (vp + vp.min(vq))) / (1e-10 + k_2 * (vp + vq));
        }
        difference.set(p, sum / channels as f32)?;
    }
    difference.store(ctx)
}

/// Vertical box filter of radius `f`.
fn nlm_blur(ctx: &mut KernelContext<'_>) -> Result<(), DriverError> {
    let difference = Plane::load(ctx, ctx.arg_ptr(0)?)?;
    let mut out = Plane::load(ctx, ctx.arg_ptr(1)?)?;
    let rect = ctx.arg_int4(2)?;
    let stride = ctx.arg_i32(3)?;
    let f = ctx.arg_i32(4)?;
    covers(ctx, rect[2], rect[3])?;

    for (x, y) in pixels(rect) {
        let (low, high) = ((y - f).max(rect[1]), (y + f + 1).min(rect[3]));
        let mut sum = 0.0;
        for yy in low..high {
            sum += difference.get(at(x, yy, stride))?;
        }
        out.set(at(x, y, stride), sum / (high - low) as f32)?;
    }
    out.store(ctx)
}

/// Horizontal box filter of radius `f`, then `exp(-max(d, 0))`.
fn nlm_calc_weight(ctx: &mut KernelContext<'_>) -> Result<(), DriverError> {
    let difference = Plane::load(ctx, ctx.arg_ptr(0)?)?;
    let mut out = Plane::load(ctx, ctx.arg_ptr(1)?)?;
    let rect = ctx.arg_int4(2)?;
    let stride = ctx.arg_i32(3)?;
    let f = ctx.arg_i32(4)?;
    covers(ctx, rect[2], rect[3])?;

    for (x, y) in pixels(rect) {
        let (low, high) = ((x - f).max(rect[0]), (x + f + 1).min(rect[2]));
        let mut sum = 0.0;
        for xx in low..high {
            sum += difference.get(at(xx, y, stride))?;
        }
        let mean: f32 = sum / (high - low) as f32;
        out.set(at(x, y, stride), (-mean.max(0.0)).exp())?;
    }
    out.store(ctx)
}

fn nlm_update_output(ctx: &mut KernelContext<'_>) -> Result<(), DriverError> {
    let dx = ctx.arg_i32(0)?;
    let dy = ctx.arg_i32(1)?;
    let weight = Plane::load(ctx, ctx.arg_ptr(2)?)?;
    let image = Plane::load(ctx, ctx.arg_ptr(3)?)?;
    let mut out = Plane::load(ctx, ctx.arg_ptr(4)?)?;
    let mut accum = Plane::load(ctx, ctx.arg_ptr(5)?)?;
    let rect = ctx.arg_int4(6)?;
    let stride = ctx.arg_i32(7)?;
    ctx.arg_i32(8)?;
    covers(ctx, rect[2], rect[3])?;

    for (x, y) in pixels(rect) {
        let p = at(x, y, stride);
        let w = weight.get(p)?;
        out.add(p, w * image.get(at(x + dx, y + dy, stride))?)?;
        accum.add(p, w)?;
    }
    out.store(ctx)?;
    accum.store(ctx)
}

fn nlm_normalize(ctx: &mut KernelContext<'_>) -> Result<(), DriverError> {
    let mut out = Plane::load(ctx, ctx.arg_ptr(0)?)?;
    let accum = Plane::load(ctx, ctx.arg_ptr(1)?)?;
    let rect = ctx.arg_int4(2)?;
    let stride = ctx.arg_i32(3)?;
    covers(ctx, rect[2], rect[3])?;

    for (x, y) in pixels(rect) {
        let p = at(x, y, stride);
        let weight = accum.get(p)?;
        if weight > 0.0 {
            let value = out.get(p)?;
            out.set(p, value / weight)?;
        }
    }
    out.store(ctx)
}

// ── reconstruction ──────────────────────────────────────────────────────────

/// Identity transform of rank one per filtered pixel.
fn construct_transform(ctx: &mut KernelContext<'_>) -> Result<(), DriverError> {
    ctx.arg_ptr(0)?;
    let mut transform = Plane::load(ctx, ctx.arg_ptr(1)?)?;
    let rank = ctx.arg_ptr(2)?;
    let filter_area = ctx.arg_int4(3)?;
    ctx.arg_int4(4)?;
    ctx.arg_i32(5)?;
    ctx.arg_f32(6)?;
    ctx.arg_i32(7)?;
    covers(ctx, filter_area[2], filter_area[3])?;

    let count = (filter_area[2] * filter_area[3]).max(0) as usize;
    for pixel in 0..count {
        for i in 0..TRANSFORM_SIZE {
            transform.set(pixel * TRANSFORM_SIZE + i, if i == 0 { 1.0 } else { 0.0 })?;
        }
        ctx.write(rank, pixel, 1i32)?;
    }
    transform.store(ctx)
}

fn nlm_construct_gramian(ctx: &mut KernelContext<'_>) -> Result<(), DriverError> {
    let dx = ctx.arg_i32(0)?;
    let dy = ctx.arg_i32(1)?;
    let weight = Plane::load(ctx, ctx.arg_ptr(2)?)?;
    let buffer = Plane::load(ctx, ctx.arg_ptr(3)?)?;
    ctx.arg_ptr(4)?;
    let rank = ctx.arg_ptr(5)?;
    let mut xtwx = Plane::load(ctx, ctx.arg_ptr(6)?)?;
    let mut xtwy = Plane::load(ctx, ctx.arg_ptr(7)?)?;
    let rect = ctx.arg_int4(8)?;
    let [fx, fy, fw, fh] = ctx.arg_int4(9)?;
    let stride = ctx.arg_i32(10)?;
    ctx.arg_i32(11)?;
    ctx.arg_i32(12)?;
    let pass_stride = ctx.arg_i32(13)?.max(0) as usize;
    covers(ctx, rect[2], rect[3])?;

    let inside = [rect[0].max(fx), rect[1].max(fy), rect[2].min(fx + fw), rect[3].min(fy + fh)];
    for (x, y) in pixels(inside) {
        let storage = ((y - fy) * fw + (x - fx)) as usize;
        let pixel_rank: i32 = ctx.read(rank, storage)?;
        if pixel_rank < 1 {
            continue;
        }
        let w = weight.get(at(x, y, stride))?;
        let q = at(x + dx, y + dy, stride);
        xtwx.add(storage * XTWX_SIZE, w)?;
        for c in 0..3 {
            xtwy.add(storage * XTWY_SIZE + c, w * buffer.get((passes::COLOR + c) * pass_stride + q)?)?;
        }
    }
    xtwx.store(ctx)?;
    xtwy.store(ctx)
}

/// Solves the per-pixel system and writes `color × sample` into the render
/// buffer.
fn finalize(ctx: &mut KernelContext<'_>) -> Result<(), DriverError> {
    ctx.arg_i32(0)?;
    ctx.arg_i32(1)?;
    let mut output = Plane::load(ctx, ctx.arg_ptr(2)?)?;
    let rank = ctx.arg_ptr(3)?;
    let xtwx = Plane::load(ctx, ctx.arg_ptr(4)?)?;
    let xtwy = Plane::load(ctx, ctx.arg_ptr(5)?)?;
    let [x0, y0, w, h] = ctx.arg_int4(6)?;
    let [offset, stride, pass_stride, _] = ctx.arg_int4(7)?;
    let sample = ctx.arg_i32(8)? as f32;
    covers(ctx, w, h)?;

    for (x, y) in pixels([0, 0, w, h]) {
        let storage = (y * w + x) as usize;
        let pixel_rank: i32 = ctx.read(rank, storage)?;
        let weight = xtwx.get(storage * XTWX_SIZE)?;
        if pixel_rank < 1 || weight <= 0.0 {
            continue;
        }
        let index = ((offset + x0 + x + (y0 + y) * stride) * pass_stride) as usize;
        for c in 0..3 {
            output.set(index + c, xtwy.get(storage * XTWY_SIZE + c)? / weight * sample)?;
        }
    }
    output.store(ctx)
}

// ── feature extraction ──────────────────────────────────────────────────────

/// Reads denoising data of frame pixels through the neighbourhood tiles.
struct TileReader {
    tiles: TilesInfo,
    pass_stride: i32,
    denoising_offset: i32,
}

impl TileReader {
    fn new(ctx: &KernelContext<'_>, tiles: DevicePtr, pass_stride: i32, denoising_offset: i32) -> Result<Self, DriverError> {
        Ok(Self {
            tiles: ctx.read(tiles, 0)?,
            pass_stride,
            denoising_offset,
        })
    }

    /// Float `pass` of the denoising data of `(x, y)`; zero outside every tile.
    fn read(&self, ctx: &KernelContext<'_>, x: i32, y: i32, pass: i32) -> Result<f32, DriverError> {
        let Some(tile) = self.tiles.tile_index(x, y) else {
            return Ok(0.0);
        };
        let Some(buffer) = DevicePtr::new(self.tiles.buffers[tile]) else {
            return Ok(0.0);
        };
        let pixel = self.tiles.offsets[tile] + x + y * self.tiles.strides[tile];
        let index = pixel * self.pass_stride + self.denoising_offset + pass;
        ctx.read(buffer, index as usize)
    }
}

fn rect_index(rect: [i32; 4], x: i32, y: i32) -> usize {
    let w = align_up(rect[2] - rect[0], 4);
    ((y - rect[1]) * w + (x - rect[0])) as usize
}

fn divide_shadow(ctx: &mut KernelContext<'_>) -> Result<(), DriverError> {
    ctx.arg_i32(0)?;
    let rect = ctx.arg_int4(7)?;
    let reader = TileReader::new(ctx, ctx.arg_ptr(1)?, ctx.arg_i32(8)?, ctx.arg_i32(9)?)?;
    let mut a = Plane::load(ctx, ctx.arg_ptr(2)?)?;
    let mut b = Plane::load(ctx, ctx.arg_ptr(3)?)?;
    let mut sample_variance = Plane::load(ctx, ctx.arg_ptr(4)?)?;
    let mut sv_variance = Plane::load(ctx, ctx.arg_ptr(5)?)?;
    let mut buffer_variance = Plane::load(ctx, ctx.arg_ptr(6)?)?;
    covers(ctx, rect[2] - rect[0], rect[3] - rect[1])?;

    for (x, y) in pixels(rect) {
        let half = |pass: i32| -> Result<f32, DriverError> {
            let unoccluded = reader.read(ctx, x, y, pass)?;
            let total = reader.read(ctx, x, y, pass + 1)?;
            Ok(if total > 0.0 { unoccluded / total } else { 0.0 })
        };
        let va = half(render_passes::SHADOW_A)?;
        let vb = half(render_passes::SHADOW_B)?;
        let spread = (va - vb) * (va - vb);

        let i = rect_index(rect, x, y);
        a.set(i, va)?;
        b.set(i, vb)?;
        sample_variance.set(i, 0.25 * spread)?;
        sv_variance.set(i, 0.5 * (0.25 * spread) * (0.25 * spread))?;
        buffer_variance.set(i, 0.5 * spread)?;
    }
    for plane in [a, b, sample_variance, sv_variance, buffer_variance] {
        plane.store(ctx)?;
    }
    Ok(())
}

/// Mean and variance of the mean of one accumulated feature channel.
fn get_feature(ctx: &mut KernelContext<'_>) -> Result<(), DriverError> {
    let sample = ctx.arg_i32(0)?.max(1) as f32;
    let mean_offset = ctx.arg_i32(2)?;
    let variance_offset = ctx.arg_i32(3)?;
    let rect = ctx.arg_int4(6)?;
    let reader = TileReader::new(ctx, ctx.arg_ptr(1)?, ctx.arg_i32(7)?, ctx.arg_i32(8)?)?;
    let mut mean = Plane::load(ctx, ctx.arg_ptr(4)?)?;
    let mut variance = Plane::load(ctx, ctx.arg_ptr(5)?)?;
    covers(ctx, rect[2] - rect[0], rect[3] - rect[1])?;

    for (x, y) in pixels(rect) {
        let m = reader.read(ctx, x, y, mean_offset)? / sample;
        let squares = reader.read(ctx, x, y, variance_offset)? / sample;
        let i = rect_index(rect, x, y);
        mean.set(i, m)?;
        variance.set(i, (squares - m * m).max(0.0) / (sample - 1.0).max(1.0))?;
    }
    mean.store(ctx)?;
    variance.store(ctx)
}

/// Clamps pixels far brighter than their 3 × 3 neighbourhood.
fn detect_outliers(ctx: &mut KernelContext<'_>) -> Result<(), DriverError> {
    let image = Plane::load(ctx, ctx.arg_ptr(0)?)?;
    ctx.arg_ptr(1)?;
    ctx.arg_ptr(2)?;
    let mut output = Plane::load(ctx, ctx.arg_ptr(3)?)?;
    let rect = ctx.arg_int4(4)?;
    let pass_stride = ctx.arg_i32(5)?.max(0) as usize;
    covers(ctx, rect[2] - rect[0], rect[3] - rect[1])?;

    let color = |i: usize| -> Result<[f32; 3], DriverError> {
        Ok([image.get(i)?, image.get(i + pass_stride)?, image.get(i + 2 * pass_stride)?])
    };

    for (x, y) in pixels(rect) {
        let i = rect_index(rect, x, y);
        let rgb = color(i)?;

        let mut sum = 0.0;
        let mut count = 0;
        for (nx, ny) in pixels([x - 1, y - 1, x + 2, y + 2]) {
            let inside = nx >= rect[0] && nx < rect[2] && ny >= rect[1] && ny < rect[3];
            if inside && (nx, ny) != (x, y) {
                sum += luminance(color(rect_index(rect, nx, ny))?);
                count += 1;
            }
        }

        let lum = luminance(rgb);
        let limit = 4.0 * sum / count.max(1) as f32 + 1.0;
        let scale = if count > 0 && lum > limit { limit / lum } else { 1.0 };
        for (c, value) in rgb.iter().enumerate() {
            output.set(i + c * pass_stride, value * scale)?;
        }
    }
    output.store(ctx)
}

/// Mean of two halves and the variance estimated from their spread.
fn combine_halves(ctx: &mut KernelContext<'_>) -> Result<(), DriverError> {
    let mean_ptr = ctx.arg_opt_ptr(0)?;
    let variance_ptr = ctx.arg_opt_ptr(1)?;
    let a = Plane::load(ctx, ctx.arg_ptr(2)?)?;
    let b = Plane::load(ctx, ctx.arg_ptr(3)?)?;
    let rect = ctx.arg_int4(4)?;
    let r = ctx.arg_i32(5)?;
    covers(ctx, rect[2] - rect[0], rect[3] - rect[1])?;

    let mut mean = mean_ptr.map(|p| Plane::load(ctx, p)).transpose()?;
    let mut variance = variance_ptr.map(|p| Plane::load(ctx, p)).transpose()?;

    for (x, y) in pixels(rect) {
        let i = rect_index(rect, x, y);
        if let Some(mean) = mean.as_mut() {
            mean.set(i, 0.5 * (a.get(i)? + b.get(i)?))?;
        }
        if let Some(variance) = variance.as_mut() {
            let window = [(x - r).max(rect[0]), (y - r).max(rect[1]), (x + r + 1).min(rect[2]), (y + r + 1).min(rect[3])];
            let mut sum = 0.0;
            let mut count = 0;
            for (wx, wy) in pixels(window) {
                let j = rect_index(rect, wx, wy);
                let d = a.get(j)? - b.get(j)?;
                sum += 0.25 * d * d;
                count += 1;
            }
            variance.set(i, sum / count.max(1) as f32)?;
        }
    }
    if let Some(mean) = mean {
        mean.store(ctx)?;
    }
    if let Some(variance) = variance {
        variance.store(ctx)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rect_pixels_are_row_major() {
        let all: Vec<_> = pixels([1, 2, 3, 4]).collect();
        assert_eq!(all, vec![(1, 2), (2, 2), (1, 3), (2, 3)]);
        assert_eq!(pixels([0, 0, 0, 5]).count(), 0);
    }

    #[test]
    fn rect_rows_are_padded_to_four() {
        assert_eq!(rect_index([10, 20, 15, 30], 10, 20), 0);
        assert_eq!(rect_index([10, 20, 15, 30], 11, 21), 9);
    }
}
