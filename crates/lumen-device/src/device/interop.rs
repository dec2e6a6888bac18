//! Display buffer-sharing contract.

/// Display-owned pixel buffer and the texture it is drawn through.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct DisplayBuffer {
    pub pixel_buffer: u32,
    pub texture: u32,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// 4 × u8 per pixel.
    Rgba8,
    /// 4 × f16 per pixel.
    RgbaHalf,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            Self::Rgba8 => 4,
            Self::RgbaHalf => 8,
        }
    }
}

/// Region of a pixel buffer to draw and where to put it.
///
/// Rows `y..y + h` of the buffer, `w` wide, are drawn at `(dx, dy)` scaled to
/// `width × height`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DrawRect {
    pub y: u32,
    pub w: u32,
    pub h: u32,
    pub dx: i32,
    pub dy: i32,
    pub width: u32,
    pub height: u32,
}

/// Minimal display collaborator used for pixel interop.
pub trait DisplayInterop: Send + Sync {
    /// Creates a pixel buffer and its display texture; `None` on failure.
    fn create_pixel_buffer(&self, width: u32, height: u32, format: PixelFormat) -> Option<DisplayBuffer>;

    fn destroy_pixel_buffer(&self, buffer: DisplayBuffer);

    /// Copies `dst.len()` bytes starting at byte `offset` of the buffer.
    fn read_pixels(&self, buffer: DisplayBuffer, offset: usize, dst: &mut [u8]) -> bool;

    /// Draws straight from a shared pixel buffer.
    fn draw_buffer(&self, buffer: DisplayBuffer, format: PixelFormat, rect: DrawRect, transparent: bool);

    /// Draws host pixels (offscreen fallback).
    fn draw_host_pixels(&self, pixels: &[u8], format: PixelFormat, rect: DrawRect, transparent: bool);
}

/// Callbacks invoked immediately before and after a draw.
#[derive(Default)]
pub struct DrawHooks<'a> {
    pub bind_display_shader: Option<&'a dyn Fn()>,
    pub unbind_display_shader: Option<&'a dyn Fn()>,
}

impl DrawHooks<'_> {
    pub(crate) fn around<R>(&self, draw: impl FnOnce() -> R) -> R {
        if let Some(bind) = self.bind_display_shader {
            bind();
        }
        let r = draw();
        if let Some(unbind) = self.unbind_display_shader {
            unbind();
        }
        r
    }
}
