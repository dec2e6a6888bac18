use std::sync::{Arc, Mutex, MutexGuard};

use super::EmulatedState;
use crate::device::{DisplayBuffer, DisplayInterop, DrawRect, PixelFormat};

/// One draw performed through [`EmulatedDisplay`].
#[derive(Debug, Clone, PartialEq)]
pub enum DrawRecord {
    Buffer { buffer: DisplayBuffer, rect: DrawRect, transparent: bool },
    Host { bytes: usize, rect: DrawRect, transparent: bool },
}

/// Display collaborator whose pixel buffers live in the emulated heap, so
/// registered buffers can be mapped for kernels.
pub struct EmulatedDisplay {
    state: Arc<Mutex<EmulatedState>>,
}

impl EmulatedDisplay {
    pub(crate) fn new(state: Arc<Mutex<EmulatedState>>) -> Self {
        Self { state }
    }

    fn lock(&self) -> MutexGuard<'_, EmulatedState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Draws performed so far.
    pub fn draws(&self) -> Vec<DrawRecord> {
        self.lock().draws.clone()
    }

    /// Live pixel buffers.
    pub fn buffer_count(&self) -> usize {
        self.lock().display_buffers.len()
    }
}

impl DisplayInterop for EmulatedDisplay {
    fn create_pixel_buffer(&self, width: u32, height: u32, format: PixelFormat) -> Option<DisplayBuffer> {
        let bytes = width as usize * height as usize * format.bytes_per_pixel();
        let mut state = self.lock();
        let backing = state.heap.alloc(bytes).ok()?;
        let id = state.handles.next().get() as u32;
        state.display_buffers.insert(id, backing);
        Some(DisplayBuffer {
            pixel_buffer: id,
            texture: id,
        })
    }

    fn destroy_pixel_buffer(&self, buffer: DisplayBuffer) {
        let mut state = self.lock();
        if let Some(backing) = state.display_buffers.remove(&buffer.pixel_buffer) {
            let _ = state.heap.free(backing);
        }
    }

    fn read_pixels(&self, buffer: DisplayBuffer, offset: usize, dst: &mut [u8]) -> bool {
        let state = self.lock();
        let Some(backing) = state.display_buffers.get(&buffer.pixel_buffer) else {
            return false;
        };
        match state.heap.bytes(backing.offset(offset as u64), dst.len()) {
            Ok(src) => {
                dst.copy_from_slice(src);
                true
            }
            Err(_) => false,
        }
    }

    fn draw_buffer(&self, buffer: DisplayBuffer, _format: PixelFormat, rect: DrawRect, transparent: bool) {
        self.lock().draws.push(DrawRecord::Buffer { buffer, rect, transparent });
    }

    fn draw_host_pixels(&self, pixels: &[u8], _format: PixelFormat, rect: DrawRect, transparent: bool) {
        self.lock().draws.push(DrawRecord::Host {
            bytes: pixels.len(),
            rect,
            transparent,
        });
    }
}
