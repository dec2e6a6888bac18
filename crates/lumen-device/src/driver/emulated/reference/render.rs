use bytemuck::{Pod, Zeroable};

use super::{covers, Plane, RENDER_IMAGE};
use crate::driver::emulated::image::{KernelContext, KernelFn, ModuleImage};
use crate::driver::{DevicePtr, DriverError};
use crate::module::kernels;
use crate::render::WorkTile;
use crate::split::{RAY_ACTIVE, RAY_INACTIVE};

/// Split state bytes per thread reported by the size probe.
pub const SPLIT_STATE_PER_THREAD: u64 = 64;

/// Work distribution header the split kernels keep at the start of the
/// state buffer.
#[repr(C)]
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct SplitHeader {
    pub next_work: u32,
    pub total_work: u32,
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
    pub offset: i32,
    pub stride: i32,
    pub start_sample: i32,
    pub pass_stride: i32,
    pub buffer: u64,
}

/// Radiance of one sample of pixel `(x, y)`, in `[0, 1)`.
pub fn radiance(x: i32, y: i32, sample: i32) -> f32 {
    let mut h = (x as u32).wrapping_mul(0x9e37_79b1)
        ^ (y as u32).wrapping_mul(0x85eb_ca77)
        ^ (sample as u32).wrapping_mul(0xc2b2_ae3d);
    h ^= h >> 15;
    h = h.wrapping_mul(0x2c1b_3c6d);
    h ^= h >> 12;
    (h >> 8) as f32 / (1 << 24) as f32
}

/// The render module image: megakernels, split stages, film conversion and
/// shader evaluation, plus the globals and texture references kernels use.
pub fn render_image() -> ModuleImage {
    let mut image = ModuleImage::new(RENDER_IMAGE)
        .global(kernels::DATA, 4096)
        .global(kernels::TEXTURE_INFO, 8)
        .global("__lookup_table", 8)
        .global("__bvh_nodes", 8)
        .global("__objects", 8)
        .kernel(kernels::PATH_TRACE, path_trace)
        .kernel(kernels::BRANCHED_PATH_TRACE, path_trace)
        .kernel(kernels::CONVERT_TO_BYTE, convert_to_byte)
        .kernel(kernels::CONVERT_TO_HALF_FLOAT, convert_to_half_float)
        .kernel(kernels::SHADER_BAKE, shader_bake)
        .kernel(kernels::SHADER_DISPLACE, shader)
        .kernel(kernels::SHADER_BACKGROUND, shader)
        .kernel(kernels::STATE_BUFFER_SIZE, state_buffer_size)
        .kernel(kernels::DATA_INIT, data_init)
        .kernel(format!("{}{}", kernels::SPLIT_PREFIX, kernels::SPLIT_PATH_INIT), split_stage);

    for stage in kernels::SPLIT_STAGES {
        let f: KernelFn = if *stage == "buffer_update" { buffer_update } else { split_stage };
        image = image.kernel(format!("{}{stage}", kernels::SPLIT_PREFIX), f);
    }
    for ty in ["float4", "byte4", "half4", "float", "byte", "half"] {
        for num in 0..8 {
            image = image
                .texture_ref(format!("__tex_image_{ty}_{num:03}"))
                .texture_ref(format!("__tex_image_{ty}_3d_{num:03}"));
        }
    }
    image
}

fn pixel_index(offset: i32, stride: i32, pass_stride: i32, x: i32, y: i32) -> Result<usize, DriverError> {
    let index = (offset as i64 + x as i64 + y as i64 * stride as i64) * pass_stride as i64;
    usize::try_from(index).map_err(|_| DriverError::LaunchFailed(format!("pixel ({x}, {y}) maps before its buffer")))
}

fn accumulate(buffer: &mut Plane, index: usize, value: f32) -> Result<(), DriverError> {
    for channel in 0..3 {
        buffer.add(index + channel, value)?;
    }
    buffer.add(index + 3, 1.0)
}

// ── megakernel ──────────────────────────────────────────────────────────────

fn path_trace(ctx: &mut KernelContext<'_>) -> Result<(), DriverError> {
    let tile: WorkTile = ctx.read(ctx.arg_ptr(0)?, 0)?;
    let total_work = ctx.arg_u32(1)? as u64;
    let pixels = tile.w.max(0) as u64 * tile.h.max(0) as u64;

    if total_work != pixels * tile.num_samples.max(0) as u64 {
        return Err(DriverError::LaunchFailed(format!(
            "total work {total_work} does not match the {}x{}x{} tile",
            tile.w, tile.h, tile.num_samples
        )));
    }
    if ctx.num_threads() < total_work {
        return Err(DriverError::LaunchFailed(format!(
            "{} threads launched for {total_work} work items",
            ctx.num_threads()
        )));
    }

    let ptr = DevicePtr::new(tile.buffer).ok_or_else(|| DriverError::LaunchFailed("null render buffer".into()))?;
    let mut buffer = Plane::load(ctx, ptr)?;
    for sample in tile.start_sample..tile.start_sample + tile.num_samples {
        for y in tile.y..tile.y + tile.h {
            for x in tile.x..tile.x + tile.w {
                let index = pixel_index(tile.offset, tile.stride, tile.pass_stride, x, y)?;
                accumulate(&mut buffer, index, radiance(x, y, sample))?;
            }
        }
    }
    buffer.store(ctx)
}

// ── film conversion ─────────────────────────────────────────────────────────

struct ConvertArgs {
    rgba: DevicePtr,
    buffer: Plane,
    scale: f32,
    rect: [i32; 4],
    offset: i32,
    stride: i32,
    pass_stride: i32,
}

impl ConvertArgs {
    fn read(ctx: &KernelContext<'_>) -> Result<Self, DriverError> {
        let rect = [ctx.arg_i32(3)?, ctx.arg_i32(4)?, ctx.arg_i32(5)?, ctx.arg_i32(6)?];
        covers(ctx, rect[2], rect[3])?;
        Ok(Self {
            rgba: ctx.arg_ptr(0)?,
            buffer: Plane::load(ctx, ctx.arg_ptr(1)?)?,
            scale: ctx.arg_f32(2)?,
            rect,
            offset: ctx.arg_i32(7)?,
            stride: ctx.arg_i32(8)?,
            pass_stride: ctx.arg_i32(9)?,
        })
    }

    /// Scaled RGBA of every pixel with its index in the output.
    fn pixels(&self) -> Result<Vec<(usize, [f32; 4])>, DriverError> {
        let [x0, y0, w, h] = self.rect;
        let mut out = Vec::with_capacity((w.max(0) * h.max(0)) as usize);
        for y in y0..y0 + h {
            for x in x0..x0 + w {
                let index = pixel_index(self.offset, self.stride, self.pass_stride, x, y)?;
                let mut rgba = [0.0; 4];
                for (c, value) in rgba.iter_mut().enumerate() {
                    *value = self.buffer.get(index + c)? * self.scale;
                }
                out.push((pixel_index(self.offset, self.stride, 1, x, y)?, rgba));
            }
        }
        Ok(out)
    }
}

fn convert_to_byte(ctx: &mut KernelContext<'_>) -> Result<(), DriverError> {
    let args = ConvertArgs::read(ctx)?;
    for (index, rgba) in args.pixels()? {
        let bytes = rgba.map(|v| (v.clamp(0.0, 1.0) * 255.0 + 0.5) as u8);
        ctx.write(args.rgba, index, bytes)?;
    }
    Ok(())
}

fn convert_to_half_float(ctx: &mut KernelContext<'_>) -> Result<(), DriverError> {
    let args = ConvertArgs::read(ctx)?;
    for (index, rgba) in args.pixels()? {
        ctx.write(args.rgba, index, rgba.map(half_bits))?;
    }
    Ok(())
}

/// IEEE half-precision bits of `value`, flushing subnormals to zero.
pub(crate) fn half_bits(value: f32) -> u16 {
    let bits = value.to_bits();
    let sign = ((bits >> 16) & 0x8000) as u16;
    let exponent = ((bits >> 23) & 0xff) as i32 - 127 + 15;
    let mantissa = bits & 0x7f_ffff;

    if value.is_nan() {
        sign | 0x7e00
    } else if exponent >= 0x1f {
        sign | 0x7c00
    } else if exponent <= 0 {
        sign
    } else {
        sign | ((exponent as u16) << 10) | (mantissa >> 13) as u16
    }
}

// ── shader evaluation ───────────────────────────────────────────────────────

/// Adds one to every channel of the float4 output of items `x..x + w`.
fn evaluate(ctx: &mut KernelContext<'_>, first: usize) -> Result<(), DriverError> {
    let input = ctx.arg_ptr(0)?;
    let output = ctx.arg_ptr(1)?;
    let x = ctx.arg_i32(first)?;
    let w = ctx.arg_i32(first + 1)?;
    let offset = ctx.arg_i32(first + 2)?;
    ctx.arg_i32(first + 3)?;

    if ctx.num_threads() < w.max(0) as u64 {
        return Err(DriverError::LaunchFailed(format!("{} threads for {w} items", ctx.num_threads())));
    }
    for item in x..x + w {
        let _: [u32; 4] = ctx.read(input, item as usize)?;
        let index = (offset + item) as usize;
        let value: [f32; 4] = ctx.read(output, index)?;
        ctx.write(output, index, value.map(|v| v + 1.0))?;
    }
    Ok(())
}

fn shader(ctx: &mut KernelContext<'_>) -> Result<(), DriverError> {
    ctx.arg_i32(2)?;
    evaluate(ctx, 3)
}

fn shader_bake(ctx: &mut KernelContext<'_>) -> Result<(), DriverError> {
    ctx.arg_i32(2)?;
    ctx.arg_i32(3)?;
    evaluate(ctx, 4)
}

// ── split kernels ───────────────────────────────────────────────────────────

fn state_buffer_size(ctx: &mut KernelContext<'_>) -> Result<(), DriverError> {
    let threads = ctx.arg_u32(0)? as u64;
    let size = ctx.arg_ptr(1)?;
    ctx.write(size, 0, threads * SPLIT_STATE_PER_THREAD)
}

fn data_init(ctx: &mut KernelContext<'_>) -> Result<(), DriverError> {
    let split_data = ctx.arg_ptr(0)?;
    let num_elements = ctx.arg_u32(1)? as usize;
    let ray_state = ctx.arg_ptr(2)?;
    let start_sample = ctx.arg_i32(3)?;
    let end_sample = ctx.arg_i32(4)?;
    let [x, y, w, h] = [ctx.arg_i32(5)?, ctx.arg_i32(6)?, ctx.arg_i32(7)?, ctx.arg_i32(8)?];
    let num_samples = ctx.arg_i32(15)?;

    if end_sample - start_sample != num_samples {
        return Err(DriverError::LaunchFailed(format!(
            "samples {start_sample}..{end_sample} do not match a count of {num_samples}"
        )));
    }

    let header = SplitHeader {
        next_work: 0,
        total_work: (w.max(0) * h.max(0) * num_samples.max(0)) as u32,
        x,
        y,
        w,
        h,
        offset: ctx.arg_i32(9)?,
        stride: ctx.arg_i32(10)?,
        start_sample,
        pass_stride: ctx.arg_i32(17)?,
        buffer: ctx.arg_ptr(16)?.addr(),
    };
    ctx.write(split_data, 0, header)?;
    ctx.write_bytes(ray_state, &vec![RAY_ACTIVE; num_elements])
}

fn split_stage(ctx: &mut KernelContext<'_>) -> Result<(), DriverError> {
    ctx.arg_ptr(0)?;
    ctx.arg_u32(5)?;
    Ok(())
}

/// Every active thread takes the next work item, or retires when none is
/// left.
fn buffer_update(ctx: &mut KernelContext<'_>) -> Result<(), DriverError> {
    let split_data = ctx.arg_ptr(0)?;
    let ray_state = ctx.arg_ptr(1)?;
    let num_elements = ctx.arg_u32(5)? as usize;

    let mut header: SplitHeader = ctx.read(split_data, 0)?;
    let mut states = ctx.read_bytes(ray_state, num_elements)?;
    let ptr = DevicePtr::new(header.buffer).ok_or_else(|| DriverError::LaunchFailed("null render buffer".into()))?;
    let mut buffer = Plane::load(ctx, ptr)?;
    let pixels = (header.w * header.h).max(1) as u32;

    for state in states.iter_mut().filter(|s| **s == RAY_ACTIVE) {
        if header.next_work >= header.total_work {
            *state = RAY_INACTIVE;
            continue;
        }
        let work = header.next_work;
        header.next_work += 1;

        let sample = header.start_sample + (work / pixels) as i32;
        let pixel = (work % pixels) as i32;
        let x = header.x + pixel % header.w;
        let y = header.y + pixel / header.w;
        let index = pixel_index(header.offset, header.stride, header.pass_stride, x, y)?;
        accumulate(&mut buffer, index, radiance(x, y, sample))?;
    }

    buffer.store(ctx)?;
    ctx.write_bytes(ray_state, &states)?;
    ctx.write(split_data, 0, header)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn radiance_is_deterministic_and_bounded() {
        for (x, y, s) in [(0, 0, 0), (17, 3, 9), (-4, 1000, 123)] {
            let v = radiance(x, y, s);
            assert_eq!(v, radiance(x, y, s));
            assert!((0.0..1.0).contains(&v));
        }
        assert_ne!(radiance(1, 0, 0), radiance(0, 1, 0));
    }

    #[test]
    fn half_conversion() {
        assert_eq!(half_bits(0.0), 0);
        assert_eq!(half_bits(1.0), 0x3c00);
        assert_eq!(half_bits(-2.0), 0xc000);
        assert_eq!(half_bits(0.5), 0x3800);
        assert_eq!(half_bits(1e9), 0x7c00);
    }

    #[test]
    fn split_header_layout_is_stable() {
        assert_eq!(size_of::<SplitHeader>(), 48);
    }

    #[test]
    fn image_has_every_split_stage() {
        let image = render_image();
        for stage in kernels::SPLIT_STAGES {
            assert!(image.kernels.contains_key(&format!("kernel_{stage}")));
        }
        assert!(image.kernels.contains_key("kernel_path_init"));
    }
}
