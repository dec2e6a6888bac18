use crate::driver::DevicePtr;

/// What a worker does with an acquired tile.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum TileWork {
    #[default]
    PathTrace,
    Denoise,
}

/// A rectangle of the frame and its slice of a render buffer.
///
/// Pixel `(x, y)` starts at float `(offset + x + y * stride) * pass_stride`
/// of `buffer`. Only `sample` changes while the tile is worked on.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct RenderTile {
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
    pub start_sample: i32,
    pub num_samples: i32,
    /// Next sample to render; `start_sample + num_samples` when done.
    pub sample: i32,
    pub offset: i32,
    pub stride: i32,
    /// Floats per pixel in `buffer`.
    pub pass_stride: i32,
    pub buffer: Option<DevicePtr>,
    pub work: TileWork,
}

impl RenderTile {
    /// Tile covering `w × h` pixels at `(x, y)` of a frame `stride` pixels wide.
    pub fn new(x: i32, y: i32, w: i32, h: i32, stride: i32) -> Self {
        Self {
            x,
            y,
            w,
            h,
            start_sample: 0,
            num_samples: 1,
            sample: 0,
            offset: 0,
            stride,
            pass_stride: 4,
            buffer: None,
            work: TileWork::PathTrace,
        }
    }

    pub fn pixel_count(&self) -> u64 {
        self.w.max(0) as u64 * self.h.max(0) as u64
    }

    /// One past the last sample of the tile.
    pub fn end_sample(&self) -> i32 {
        self.start_sample + self.num_samples
    }
}

/// A tile's 3 × 3 neighbourhood in row-major order; the tile itself is at
/// index 4. Missing neighbours (frame edges) are `None`.
pub type NeighborTiles = [Option<RenderTile>; 9];

/// Hands out tiles to render and takes them back.
///
/// Every acquired tile is released exactly once, cancellation included.
pub trait TileSource: Send + Sync {
    fn acquire_tile(&self) -> Option<RenderTile>;

    fn release_tile(&self, tile: RenderTile);

    /// Neighbourhood of `center` with buffers valid until unmapped.
    fn map_neighbors(&self, center: &RenderTile) -> NeighborTiles;

    fn unmap_neighbors(&self, tiles: NeighborTiles);
}
