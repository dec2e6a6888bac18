//! Render launches: tiled path tracing, film conversion, shader evaluation.

mod film;
mod path_trace;
mod shader;

pub(crate) use film::film_convert;
pub(crate) use path_trace::path_trace;
pub use path_trace::{sample_batches, step_samples, SampleBatches, WorkTile};
pub(crate) use shader::shader;
pub use shader::eval_type_code;

use crate::driver::Dim3;

/// Grid and square block covering `w × h` threads.
///
/// The block side is `⌊√max_threads⌋`.
pub(crate) fn square_blocks(max_threads: u32, w: u32, h: u32) -> (Dim3, Dim3) {
    let side = ((max_threads as f64).sqrt() as u32).max(1);
    (
        Dim3::plane(w.div_ceil(side).max(1), h.div_ceil(side).max(1)),
        Dim3::plane(side, side),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn square_blocks_cover_the_rect() {
        let (grid, block) = square_blocks(1024, 100, 33);
        assert_eq!(block, Dim3::plane(32, 32));
        assert_eq!(grid, Dim3::plane(4, 2));

        let (grid, block) = square_blocks(200, 10, 10);
        assert_eq!(block, Dim3::plane(14, 14));
        assert_eq!(grid, Dim3::plane(1, 1));
    }
}
