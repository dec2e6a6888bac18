use super::{passes, render_passes, TilesInfo};
use crate::driver::DevicePtr;
use crate::error::DeviceError;

/// Parameters of one non-local-means pass.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct NlmParams {
    /// Search window radius.
    pub r: i32,
    /// Patch radius.
    pub f: i32,
    /// Variance cancellation factor.
    pub a: f32,
    /// Variance scale of the weights.
    pub k_2: f32,
}

impl NlmParams {
    pub const fn new(r: i32, f: i32, a: f32, k_2: f32) -> Self {
        Self { r, f, a, k_2 }
    }
}

/// One method per denoising stage.
///
/// Every method runs its stage to completion (synchronized) before
/// returning.
pub trait DenoiseOps {
    fn set_tiles(&self, tiles: &TilesInfo) -> Result<(), DeviceError>;

    fn non_local_means(
        &self,
        nlm: NlmParams,
        image: DevicePtr,
        guide: DevicePtr,
        variance: DevicePtr,
        out: DevicePtr,
    ) -> Result<(), DeviceError>;

    fn construct_transform(&self) -> Result<(), DeviceError>;

    fn reconstruct(&self, color: DevicePtr, color_variance: DevicePtr, output: DevicePtr) -> Result<(), DeviceError>;

    fn divide_shadow(
        &self,
        a: DevicePtr,
        b: DevicePtr,
        sample_variance: DevicePtr,
        sv_variance: DevicePtr,
        buffer_variance: DevicePtr,
    ) -> Result<(), DeviceError>;

    fn get_feature(
        &self,
        mean_offset: i32,
        variance_offset: i32,
        mean: DevicePtr,
        variance: DevicePtr,
    ) -> Result<(), DeviceError>;

    fn detect_outliers(
        &self,
        image: DevicePtr,
        variance: DevicePtr,
        depth: DevicePtr,
        output: DevicePtr,
    ) -> Result<(), DeviceError>;

    #[allow(clippy::too_many_arguments)]
    fn combine_halves(
        &self,
        a: DevicePtr,
        b: DevicePtr,
        mean: Option<DevicePtr>,
        variance: Option<DevicePtr>,
        r: i32,
        rect: [i32; 4],
    ) -> Result<(), DeviceError>;
}

/// Device addresses of the planes a denoise call works on.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct DenoisePlanes {
    /// Prefiltered features, [`passes::COUNT`] planes.
    pub buffer: DevicePtr,
    /// Temporaries, [`passes::SCRATCH_COUNT`] planes.
    pub scratch: DevicePtr,
    /// Render buffer receiving the result.
    pub target: DevicePtr,
    /// Floats per plane.
    pub pass_stride: usize,
    /// `[x0, y0, x1, y1]` covered by the planes.
    pub rect: [i32; 4],
}

impl DenoisePlanes {
    pub fn buffer(&self, pass: usize) -> DevicePtr {
        self.buffer.offset((pass * self.pass_stride * 4) as u64)
    }

    pub fn scratch(&self, plane: usize) -> DevicePtr {
        self.scratch.offset((plane * self.pass_stride * 4) as u64)
    }
}

/// Drives the stages of a denoise call in order.
#[derive(Debug, Clone)]
pub struct DenoisePipeline {
    planes: DenoisePlanes,
    tiles: TilesInfo,
}

/// Feature passes: render-buffer mean and variance offsets and the
/// destination plane.
const FEATURES: [(i32, i32, usize); 7] = [
    (render_passes::DEPTH, render_passes::DEPTH_VARIANCE, passes::DEPTH),
    (render_passes::NORMAL, render_passes::NORMAL_VARIANCE, passes::NORMAL),
    (render_passes::NORMAL + 1, render_passes::NORMAL_VARIANCE + 1, passes::NORMAL + 1),
    (render_passes::NORMAL + 2, render_passes::NORMAL_VARIANCE + 2, passes::NORMAL + 2),
    (render_passes::ALBEDO, render_passes::ALBEDO_VARIANCE, passes::ALBEDO),
    (render_passes::ALBEDO + 1, render_passes::ALBEDO_VARIANCE + 1, passes::ALBEDO + 1),
    (render_passes::ALBEDO + 2, render_passes::ALBEDO_VARIANCE + 2, passes::ALBEDO + 2),
];

impl DenoisePipeline {
    pub fn new(planes: DenoisePlanes, tiles: TilesInfo) -> Self {
        Self { planes, tiles }
    }

    pub fn run(&self, ops: &dyn DenoiseOps) -> Result<(), DeviceError> {
        ops.set_tiles(&self.tiles)?;
        self.prefilter_shadowing(ops)?;
        self.prefilter_features(ops)?;
        self.prefilter_color(ops)?;
        ops.construct_transform()?;
        ops.reconstruct(
            self.planes.buffer(passes::COLOR),
            self.planes.buffer(passes::COLOR_VARIANCE),
            self.planes.target,
        )
    }

    /// Shadow feature from the two half-sample buffers, each filtered with
    /// the other as guide.
    fn prefilter_shadowing(&self, ops: &dyn DenoiseOps) -> Result<(), DeviceError> {
        let p = &self.planes;
        let unfiltered_a = p.scratch(0);
        let unfiltered_b = p.scratch(1);
        let sample_var = p.scratch(2);
        let sample_var_var = p.scratch(3);
        let buffer_var = p.scratch(4);
        let filtered_var = p.scratch(5);

        ops.divide_shadow(unfiltered_a, unfiltered_b, sample_var, sample_var_var, buffer_var)?;

        // Smooth the noisy buffer variance guided by the sample variance.
        ops.non_local_means(NlmParams::new(6, 3, 4.0, 1.0), buffer_var, sample_var, sample_var_var, filtered_var)?;

        let filtered_a = buffer_var;
        let filtered_b = sample_var;
        let first = NlmParams::new(5, 3, 1.0, 0.25);
        ops.non_local_means(first, unfiltered_a, unfiltered_b, filtered_var, filtered_a)?;
        ops.non_local_means(first, unfiltered_b, unfiltered_a, filtered_var, filtered_b)?;

        let residual_var = sample_var_var;
        ops.combine_halves(filtered_a, filtered_b, None, Some(residual_var), 2, p.rect)?;

        let final_a = unfiltered_a;
        let final_b = unfiltered_b;
        let second = NlmParams::new(4, 2, 1.0, 0.5);
        ops.non_local_means(second, filtered_a, filtered_b, residual_var, final_a)?;
        ops.non_local_means(second, filtered_b, filtered_a, residual_var, final_b)?;

        ops.combine_halves(final_a, final_b, Some(p.buffer(passes::SHADOW)), None, 0, p.rect)
    }

    fn prefilter_features(&self, ops: &dyn DenoiseOps) -> Result<(), DeviceError> {
        let unfiltered = self.planes.scratch(6);
        let variance = self.planes.scratch(7);
        for (mean_offset, variance_offset, pass) in FEATURES {
            ops.get_feature(mean_offset, variance_offset, unfiltered, variance)?;
            ops.non_local_means(
                NlmParams::new(2, 2, 1.0, 0.25),
                unfiltered,
                unfiltered,
                variance,
                self.planes.buffer(pass),
            )?;
        }
        Ok(())
    }

    /// Colour and its variance, with fireflies clamped.
    fn prefilter_color(&self, ops: &dyn DenoiseOps) -> Result<(), DeviceError> {
        let p = &self.planes;
        let temporary_color = p.scratch(0);
        for channel in 0..3 {
            ops.get_feature(
                render_passes::COLOR + channel as i32,
                render_passes::COLOR_VARIANCE + channel as i32,
                temporary_color.offset((channel * p.pass_stride * 4) as u64),
                p.buffer(passes::COLOR_VARIANCE + channel),
            )?;
        }
        ops.detect_outliers(
            temporary_color,
            p.buffer(passes::COLOR_VARIANCE),
            p.buffer(passes::DEPTH),
            p.buffer(passes::COLOR),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        SetTiles,
        Nlm(NlmParams, u64, u64),
        Transform,
        Reconstruct(u64),
        DivideShadow,
        Feature(i32, i32),
        Outliers(u64),
        Combine(Option<u64>, Option<u64>, i32),
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<Call>>);

    impl Recorder {
        fn push(&self, call: Call) -> Result<(), DeviceError> {
            self.0.lock().unwrap().push(call);
            Ok(())
        }
    }

    impl DenoiseOps for Recorder {
        fn set_tiles(&self, _: &TilesInfo) -> Result<(), DeviceError> {
            self.push(Call::SetTiles)
        }

        fn non_local_means(
            &self,
            nlm: NlmParams,
            image: DevicePtr,
            _: DevicePtr,
            _: DevicePtr,
            out: DevicePtr,
        ) -> Result<(), DeviceError> {
            self.push(Call::Nlm(nlm, image.addr(), out.addr()))
        }

        fn construct_transform(&self) -> Result<(), DeviceError> {
            self.push(Call::Transform)
        }

        fn reconstruct(&self, _: DevicePtr, _: DevicePtr, output: DevicePtr) -> Result<(), DeviceError> {
            self.push(Call::Reconstruct(output.addr()))
        }

        fn divide_shadow(&self, _: DevicePtr, _: DevicePtr, _: DevicePtr, _: DevicePtr, _: DevicePtr) -> Result<(), DeviceError> {
            self.push(Call::DivideShadow)
        }

        fn get_feature(&self, mean: i32, variance: i32, _: DevicePtr, _: DevicePtr) -> Result<(), DeviceError> {
            self.push(Call::Feature(mean, variance))
        }

        fn detect_outliers(&self, _: DevicePtr, _: DevicePtr, _: DevicePtr, output: DevicePtr) -> Result<(), DeviceError> {
            self.push(Call::Outliers(output.addr()))
        }

        fn combine_halves(
            &self,
            _: DevicePtr,
            _: DevicePtr,
            mean: Option<DevicePtr>,
            variance: Option<DevicePtr>,
            r: i32,
            _: [i32; 4],
        ) -> Result<(), DeviceError> {
            self.push(Call::Combine(mean.map(|p| p.addr()), variance.map(|p| p.addr()), r))
        }
    }

    fn planes() -> DenoisePlanes {
        DenoisePlanes {
            buffer: DevicePtr::new(0x10000).unwrap(),
            scratch: DevicePtr::new(0x20000).unwrap(),
            target: DevicePtr::new(0x30000).unwrap(),
            pass_stride: 16,
            rect: [0, 0, 4, 4],
        }
    }

    #[test]
    fn stages_run_in_order() {
        let recorder = Recorder::default();
        DenoisePipeline::new(planes(), TilesInfo::default()).run(&recorder).unwrap();
        let calls = recorder.0.into_inner().unwrap();

        assert_eq!(calls[0], Call::SetTiles);
        assert_eq!(calls[1], Call::DivideShadow);
        assert!(matches!(calls[2], Call::Nlm(NlmParams { r: 6, f: 3, .. }, _, _)));
        assert_eq!(calls[5], Call::Combine(None, Some(0x20000 + 3 * 64), 2));
        assert_eq!(calls[8], Call::Combine(Some(0x10000 + passes::SHADOW as u64 * 64), None, 0));

        let features = calls.iter().filter(|c| matches!(c, Call::Feature(..))).count();
        assert_eq!(features, 10);

        let n = calls.len();
        assert_eq!(calls[n - 3], Call::Outliers(0x10000 + passes::COLOR as u64 * 64));
        assert_eq!(calls[n - 2], Call::Transform);
        assert_eq!(calls[n - 1], Call::Reconstruct(0x30000));
    }

    #[test]
    fn features_are_filtered_into_their_planes() {
        let recorder = Recorder::default();
        DenoisePipeline::new(planes(), TilesInfo::default()).run(&recorder).unwrap();
        let calls = recorder.0.into_inner().unwrap();

        let outputs: Vec<u64> = calls
            .iter()
            .filter_map(|c| match c {
                Call::Nlm(NlmParams { r: 2, f: 2, .. }, _, out) => Some((out - 0x10000) / 64),
                _ => None,
            })
            .collect();
        assert_eq!(outputs, vec![0, 1, 2, 3, 5, 6, 7]);
    }

    struct Failing;

    impl DenoiseOps for Failing {
        fn set_tiles(&self, _: &TilesInfo) -> Result<(), DeviceError> {
            Ok(())
        }

        fn non_local_means(&self, _: NlmParams, _: DevicePtr, _: DevicePtr, _: DevicePtr, _: DevicePtr) -> Result<(), DeviceError> {
            Err(DeviceError::Aborted("launch failed".into()))
        }

        fn construct_transform(&self) -> Result<(), DeviceError> {
            panic!("stage after a failure");
        }

        fn reconstruct(&self, _: DevicePtr, _: DevicePtr, _: DevicePtr) -> Result<(), DeviceError> {
            panic!("stage after a failure");
        }

        fn divide_shadow(&self, _: DevicePtr, _: DevicePtr, _: DevicePtr, _: DevicePtr, _: DevicePtr) -> Result<(), DeviceError> {
            Ok(())
        }

        fn get_feature(&self, _: i32, _: i32, _: DevicePtr, _: DevicePtr) -> Result<(), DeviceError> {
            panic!("stage after a failure");
        }

        fn detect_outliers(&self, _: DevicePtr, _: DevicePtr, _: DevicePtr, _: DevicePtr) -> Result<(), DeviceError> {
            panic!("stage after a failure");
        }

        fn combine_halves(
            &self,
            _: DevicePtr,
            _: DevicePtr,
            _: Option<DevicePtr>,
            _: Option<DevicePtr>,
            _: i32,
            _: [i32; 4],
        ) -> Result<(), DeviceError> {
            panic!("stage after a failure");
        }
    }

    #[test]
    fn a_failed_stage_stops_the_pipeline() {
        let err = DenoisePipeline::new(planes(), TilesInfo::default()).run(&Failing).unwrap_err();
        assert_eq!(err, DeviceError::Aborted("launch failed".into()));
    }
}
