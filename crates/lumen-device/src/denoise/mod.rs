//! Feature-guided denoising of finished tiles.
//!
//! A tile is denoised together with its 3 × 3 neighbourhood: feature passes
//! are prefiltered with non-local means, a per-pixel feature transform is
//! built, and the colour is reconstructed by weighted least squares. The
//! stage order lives in [`DenoisePipeline`]; the launches behind each stage
//! in [`FilterLauncher`].

mod gpu;
mod pipeline;

pub use gpu::FilterLauncher;
pub use pipeline::{DenoiseOps, DenoisePipeline, DenoisePlanes, NlmParams};

use bytemuck::{Pod, Zeroable};

use crate::device::{ContextScope, DeviceShared};
use crate::driver::DevicePtr;
use crate::error::DeviceError;
use crate::memory::{DataType, DeviceMemory};
use crate::task::{NeighborTiles, RenderTile, TileSource};

/// Features per pixel of the reconstruction system.
pub const DENOISE_FEATURES: usize = 10;
/// Floats of the feature transform per pixel.
pub const TRANSFORM_SIZE: usize = DENOISE_FEATURES * DENOISE_FEATURES;
/// Floats of the packed symmetric XtWX per pixel.
pub const XTWX_SIZE: usize = (DENOISE_FEATURES + 1) * (DENOISE_FEATURES + 2) / 2;
/// Floats of XtWY per pixel (one RGB triple per feature plus constant).
pub const XTWY_SIZE: usize = (DENOISE_FEATURES + 1) * 3;

/// Planes of the prefiltered feature buffer.
pub mod passes {
    pub const DEPTH: usize = 0;
    pub const NORMAL: usize = 1;
    pub const SHADOW: usize = 4;
    pub const ALBEDO: usize = 5;
    pub const COLOR: usize = 8;
    pub const COLOR_VARIANCE: usize = 11;
    pub const COUNT: usize = 14;

    /// Planes of the scratch buffer.
    pub const SCRATCH_COUNT: usize = 8;
}

/// Float offsets of the denoising data within one render-buffer pixel,
/// relative to the denoising data offset.
pub mod render_passes {
    pub const NORMAL: i32 = 0;
    pub const NORMAL_VARIANCE: i32 = 3;
    pub const ALBEDO: i32 = 6;
    pub const ALBEDO_VARIANCE: i32 = 9;
    pub const DEPTH: i32 = 12;
    pub const DEPTH_VARIANCE: i32 = 13;
    /// Unoccluded light, total light and sample count of the even half.
    pub const SHADOW_A: i32 = 14;
    pub const SHADOW_B: i32 = 17;
    pub const COLOR: i32 = 20;
    pub const COLOR_VARIANCE: i32 = 23;
    pub const SIZE: i32 = 26;
}

/// User-facing denoiser settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DenoiseParams {
    /// Half width of the search window.
    pub radius: i32,
    /// 0..1, higher removes more noise.
    pub strength: f32,
    /// 0..1, higher discards more feature detail.
    pub feature_strength: f32,
    /// Interpret the PCA threshold relative to the largest eigenvalue.
    pub relative_pca: bool,
    /// Float offset of the denoising data in a render-buffer pixel.
    pub denoising_offset: i32,
}

impl Default for DenoiseParams {
    fn default() -> Self {
        Self {
            radius: 8,
            strength: 0.5,
            feature_strength: 0.5,
            relative_pca: false,
            denoising_offset: 4,
        }
    }
}

impl DenoiseParams {
    /// Variance scale of the colour NLM weights.
    pub fn nlm_k_2(&self) -> f32 {
        2f32.powf(lerp(-5.0, 3.0, self.strength))
    }

    /// Eigenvalue cutoff of the feature transform; negative when relative.
    pub fn pca_threshold(&self) -> f32 {
        if self.relative_pca {
            -10f32.powf(lerp(-8.0, 0.0, self.feature_strength))
        } else {
            10f32.powf(lerp(-5.0, 3.0, self.feature_strength))
        }
    }
}

fn lerp(a: f32, b: f32, t: f32) -> f32 {
    a + (b - a) * t
}

/// Neighbourhood description read by the filter kernels.
///
/// `x` and `y` hold the column and row boundaries of the 3 × 3 tile grid.
/// Missing neighbours have a null buffer.
#[repr(C)]
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct TilesInfo {
    pub offsets: [i32; 9],
    pub strides: [i32; 9],
    pub x: [i32; 4],
    pub y: [i32; 4],
    pub buffers: [u64; 9],
}

impl TilesInfo {
    pub fn from_tiles(tiles: &NeighborTiles, center: &RenderTile) -> Self {
        let mut info = Self::default();
        for (i, tile) in tiles.iter().enumerate() {
            if let Some(tile) = tile {
                info.offsets[i] = tile.offset;
                info.strides[i] = tile.stride;
                info.buffers[i] = tile.buffer.map_or(0, |p| p.addr());
            }
        }

        info.x = [
            tiles[3].map_or(center.x, |t| t.x),
            center.x,
            center.x + center.w,
            tiles[5].map_or(center.x + center.w, |t| t.x + t.w),
        ];
        info.y = [
            tiles[1].map_or(center.y, |t| t.y),
            center.y,
            center.y + center.h,
            tiles[7].map_or(center.y + center.h, |t| t.y + t.h),
        ];
        info
    }

    /// Index in the 3 × 3 grid of the tile holding frame pixel `(x, y)`.
    pub fn tile_index(&self, x: i32, y: i32) -> Option<usize> {
        if x < self.x[0] || x >= self.x[3] || y < self.y[0] || y >= self.y[3] {
            return None;
        }
        let col = if x < self.x[1] { 0 } else if x < self.x[2] { 1 } else { 2 };
        let row = if y < self.y[1] { 0 } else if y < self.y[2] { 1 } else { 2 };
        Some(row * 3 + col)
    }
}

/// Geometry and transient buffers of one denoise call.
///
/// Buffers live exactly as long as the call; [`DenoisingState::release`]
/// must run on every path out of it.
#[derive(Debug)]
pub struct DenoisingState {
    /// `[x, y, w, h]` of the tile being denoised.
    pub filter_area: [i32; 4],
    /// `[x0, y0, x1, y1]` of the region read around it.
    pub rect: [i32; 4],
    pub radius: i32,
    pub nlm_k_2: f32,
    pub pca_threshold: f32,
    /// Samples accumulated in the render buffers.
    pub sample: i32,
    /// Floats per pixel of the render buffers.
    pub render_pass_stride: i32,
    pub denoising_offset: i32,
    /// The tile whose buffer receives the result.
    pub target: RenderTile,
    pub tiles: TilesInfo,
    buffer: DeviceMemory,
    scratch: DeviceMemory,
    nlm: DeviceMemory,
    transform: DeviceMemory,
    rank: DeviceMemory,
    xtwx: DeviceMemory,
    xtwy: DeviceMemory,
    tiles_mem: DeviceMemory,
}

impl DenoisingState {
    pub fn new(tiles: &NeighborTiles, params: &DenoiseParams) -> Result<Self, DeviceError> {
        let target = tiles[4].ok_or_else(|| DeviceError::InvalidRequest("denoise without a center tile".into()))?;
        if target.buffer.is_none() {
            return Err(DeviceError::InvalidRequest("center tile has no render buffer".into()));
        }
        if target.w <= 0 || target.h <= 0 {
            return Err(DeviceError::InvalidRequest(format!(
                "cannot denoise an empty {}x{} tile",
                target.w, target.h
            )));
        }

        let info = TilesInfo::from_tiles(tiles, &target);
        let r = params.radius.max(0);
        let rect = [
            (target.x - r).max(info.x[0]),
            (target.y - r).max(info.y[0]),
            (target.x + target.w + r).min(info.x[3]),
            (target.y + target.h + r).min(info.y[3]),
        ];

        let w = align_up(rect[2] - rect[0], 4) as usize;
        let h = (rect[3] - rect[1]) as usize;
        let pass_stride = w * h;
        let pixels = (target.w * target.h) as usize;

        Ok(Self {
            filter_area: [target.x, target.y, target.w, target.h],
            rect,
            radius: r,
            nlm_k_2: params.nlm_k_2(),
            pca_threshold: params.pca_threshold(),
            sample: target.sample,
            render_pass_stride: target.pass_stride,
            denoising_offset: params.denoising_offset,
            target,
            tiles: info,
            buffer: DeviceMemory::device_linear("denoising_buffer", DataType::F32, 1, pass_stride * passes::COUNT),
            scratch: DeviceMemory::device_linear("denoising_scratch", DataType::F32, 1, pass_stride * passes::SCRATCH_COUNT),
            nlm: DeviceMemory::device_linear("denoising_nlm", DataType::F32, 1, pass_stride * 3),
            transform: DeviceMemory::device_linear("denoising_transform", DataType::F32, 1, pixels * TRANSFORM_SIZE),
            rank: DeviceMemory::device_linear("denoising_rank", DataType::I32, 1, pixels),
            xtwx: DeviceMemory::device_linear("denoising_xtwx", DataType::F32, 1, pixels * XTWX_SIZE),
            xtwy: DeviceMemory::device_linear("denoising_xtwy", DataType::F32, 1, pixels * XTWY_SIZE),
            tiles_mem: DeviceMemory::from_slice("denoising_tiles", DataType::U8, 1, &[info]),
        })
    }

    /// Row length of the planes, padded to a multiple of four.
    pub fn width(&self) -> i32 {
        align_up(self.rect[2] - self.rect[0], 4)
    }

    pub fn height(&self) -> i32 {
        self.rect[3] - self.rect[1]
    }

    /// Floats per plane.
    pub fn pass_stride(&self) -> usize {
        (self.width() * self.height()) as usize
    }

    /// `[x, y, w, h]` of the filter area relative to `rect`.
    pub fn local_filter_rect(&self) -> [i32; 4] {
        [
            self.filter_area[0] - self.rect[0],
            self.filter_area[1] - self.rect[1],
            self.filter_area[2],
            self.filter_area[3],
        ]
    }

    fn buffers(&mut self) -> [&mut DeviceMemory; 8] {
        [
            &mut self.tiles_mem,
            &mut self.buffer,
            &mut self.scratch,
            &mut self.nlm,
            &mut self.transform,
            &mut self.rank,
            &mut self.xtwx,
            &mut self.xtwy,
        ]
    }

    /// Allocates every buffer; the feature buffer starts zeroed.
    pub(crate) fn allocate(&mut self, dev: &DeviceShared, scope: &ContextScope<'_>) -> Result<(), DeviceError> {
        let mut memory = dev.memory();
        memory.zero(scope, &mut self.buffer)?;
        for mem in [
            &mut self.scratch,
            &mut self.nlm,
            &mut self.transform,
            &mut self.rank,
            &mut self.xtwx,
            &mut self.xtwy,
            &mut self.tiles_mem,
        ] {
            memory.alloc(scope, mem)?;
        }
        Ok(())
    }

    pub fn planes(&self) -> Result<DenoisePlanes, DeviceError> {
        Ok(DenoisePlanes {
            buffer: resident(&self.buffer)?,
            scratch: resident(&self.scratch)?,
            target: self
                .target
                .buffer
                .ok_or_else(|| DeviceError::InvalidRequest("center tile has no render buffer".into()))?,
            pass_stride: self.pass_stride(),
            rect: self.rect,
        })
    }

    /// `[difference, blurred difference, weight accumulator]`.
    pub fn nlm_planes(&self) -> Result<[DevicePtr; 3], DeviceError> {
        let base = resident(&self.nlm)?;
        let plane = (self.pass_stride() * 4) as u64;
        Ok([base, base.offset(plane), base.offset(2 * plane)])
    }

    pub fn transform(&self) -> Result<DevicePtr, DeviceError> {
        resident(&self.transform)
    }

    pub fn rank(&self) -> Result<DevicePtr, DeviceError> {
        resident(&self.rank)
    }

    pub fn tiles_ptr(&self) -> Result<DevicePtr, DeviceError> {
        resident(&self.tiles_mem)
    }

    /// XtWX and XtWY with their sizes in bytes.
    pub fn normal_equations(&self) -> Result<[(DevicePtr, usize); 2], DeviceError> {
        Ok([
            (resident(&self.xtwx)?, self.xtwx.device_size()),
            (resident(&self.xtwy)?, self.xtwy.device_size()),
        ])
    }

    /// Frees every buffer. Safe to call more than once.
    pub(crate) fn release(&mut self, dev: &DeviceShared, scope: &ContextScope<'_>) {
        let mut memory = dev.memory();
        for mem in self.buffers() {
            if let Err(e) = memory.free(scope, mem, None) {
                log::warn!("failed to free denoising buffer: {e}");
            }
        }
    }
}

fn align_up(value: i32, alignment: i32) -> i32 {
    (value + alignment - 1) / alignment * alignment
}

fn resident(mem: &DeviceMemory) -> Result<DevicePtr, DeviceError> {
    mem.device_ptr()
        .ok_or_else(|| DeviceError::InvalidRequest(format!("\"{}\" is not resident", mem.name())))
}

/// Denoises `tile` in place using its neighbourhood from `tiles`.
pub(crate) fn denoise_tile(
    dev: &DeviceShared,
    scope: &ContextScope<'_>,
    tiles: &dyn TileSource,
    tile: &RenderTile,
    params: &DenoiseParams,
) -> Result<(), DeviceError> {
    scope.ensure_clear()?;

    let mut neighbors = tiles.map_neighbors(tile);
    neighbors[4] = Some(*tile);

    let result = DenoisingState::new(&neighbors, params).and_then(|mut state| {
        log::debug!(
            "denoise tile {}x{} at ({}, {}), radius {}, {} samples",
            tile.w,
            tile.h,
            tile.x,
            tile.y,
            state.radius,
            state.sample
        );
        let run = state.allocate(dev, scope).and_then(|()| {
            let launcher = FilterLauncher::new(dev, scope, &state)?;
            DenoisePipeline::new(state.planes()?, state.tiles).run(&launcher)
        });
        state.release(dev, scope);
        run
    });

    tiles.unmap_neighbors(neighbors);
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tile(x: i32, y: i32, w: i32, h: i32) -> RenderTile {
        let mut tile = RenderTile::new(x, y, w, h, 256);
        tile.buffer = DevicePtr::new(0x1000);
        tile
    }

    #[test]
    fn tiles_info_layout_is_stable() {
        assert_eq!(size_of::<TilesInfo>(), 176);
    }

    #[test]
    fn rect_is_clipped_to_the_neighbourhood() {
        let mut tiles: NeighborTiles = [None; 9];
        tiles[4] = Some(tile(0, 0, 32, 32));
        tiles[5] = Some(tile(32, 0, 32, 32));
        tiles[7] = Some(tile(0, 32, 32, 32));

        let state = DenoisingState::new(&tiles, &DenoiseParams::default()).unwrap();
        assert_eq!(state.tiles.x, [0, 0, 32, 64]);
        assert_eq!(state.tiles.y, [0, 0, 32, 64]);
        assert_eq!(state.rect, [0, 0, 40, 40]);
        assert_eq!(state.local_filter_rect(), [0, 0, 32, 32]);
        assert_eq!(state.pass_stride(), 40 * 40);
    }

    #[test]
    fn plane_rows_are_padded() {
        let mut tiles: NeighborTiles = [None; 9];
        tiles[4] = Some(tile(10, 10, 5, 3));
        let params = DenoiseParams {
            radius: 0,
            ..DenoiseParams::default()
        };

        let state = DenoisingState::new(&tiles, &params).unwrap();
        assert_eq!(state.rect, [10, 10, 15, 13]);
        assert_eq!(state.width(), 8);
        assert_eq!(state.pass_stride(), 24);
    }

    #[test]
    fn tile_lookup_follows_the_grid() {
        let info = TilesInfo {
            x: [0, 16, 32, 48],
            y: [0, 8, 16, 24],
            ..TilesInfo::default()
        };
        assert_eq!(info.tile_index(0, 0), Some(0));
        assert_eq!(info.tile_index(20, 10), Some(4));
        assert_eq!(info.tile_index(47, 23), Some(8));
        assert_eq!(info.tile_index(48, 0), None);
    }

    #[test]
    fn missing_center_is_rejected() {
        let tiles: NeighborTiles = [None; 9];
        assert!(matches!(
            DenoisingState::new(&tiles, &DenoiseParams::default()),
            Err(DeviceError::InvalidRequest(_))
        ));
    }

    #[test]
    fn strength_controls_the_weights() {
        let params = DenoiseParams {
            strength: 0.625,
            feature_strength: 0.5,
            ..DenoiseParams::default()
        };
        assert_eq!(params.nlm_k_2(), 1.0);
        assert!((params.pca_threshold() - 0.1).abs() < 1e-6);

        let relative = DenoiseParams {
            relative_pca: true,
            feature_strength: 1.0,
            ..params
        };
        assert_eq!(relative.pca_threshold(), -1.0);
    }
}
