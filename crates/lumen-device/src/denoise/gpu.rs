use super::pipeline::{DenoiseOps, NlmParams};
use super::{DenoisingState, TilesInfo};
use crate::device::{ContextScope, DeviceShared};
use crate::driver::{CachePreference, DevicePtr, KernelArg};
use crate::error::DeviceError;
use crate::module::kernels::filter;
use crate::module::Kernel;
use crate::render::square_blocks;

/// Filter kernels of one denoise call.
struct FilterKernels {
    nlm_calc_difference: Kernel,
    nlm_blur: Kernel,
    nlm_calc_weight: Kernel,
    nlm_update_output: Kernel,
    nlm_normalize: Kernel,
    nlm_construct_gramian: Kernel,
    construct_transform: Kernel,
    finalize: Kernel,
    divide_shadow: Kernel,
    get_feature: Kernel,
    detect_outliers: Kernel,
    combine_halves: Kernel,
}

/// [`DenoiseOps`] backed by the filter module.
///
/// Every stage launches 2D grids of square blocks over the denoising rect
/// and synchronizes before returning.
pub struct FilterLauncher<'a> {
    scope: &'a ContextScope<'a>,
    state: &'a DenoisingState,
    kernels: FilterKernels,
}

impl<'a> FilterLauncher<'a> {
    pub(crate) fn new(
        dev: &DeviceShared,
        scope: &'a ContextScope<'a>,
        state: &'a DenoisingState,
    ) -> Result<Self, DeviceError> {
        let resolve = |name: &str, preference: CachePreference| -> Result<Kernel, DeviceError> {
            let kernel = dev.filter_kernel(scope, name)?;
            scope.check(
                "function_set_cache_preference",
                scope.driver().function_set_cache_preference(kernel.func, preference),
            )?;
            Ok(kernel)
        };
        let l1 = CachePreference::PreferL1;
        let shared = CachePreference::PreferShared;

        Ok(Self {
            scope,
            state,
            kernels: FilterKernels {
                nlm_calc_difference: resolve(filter::NLM_CALC_DIFFERENCE, l1)?,
                nlm_blur: resolve(filter::NLM_BLUR, l1)?,
                nlm_calc_weight: resolve(filter::NLM_CALC_WEIGHT, l1)?,
                nlm_update_output: resolve(filter::NLM_UPDATE_OUTPUT, l1)?,
                nlm_normalize: resolve(filter::NLM_NORMALIZE, l1)?,
                nlm_construct_gramian: resolve(filter::NLM_CONSTRUCT_GRAMIAN, shared)?,
                construct_transform: resolve(filter::CONSTRUCT_TRANSFORM, shared)?,
                finalize: resolve(filter::FINALIZE, l1)?,
                divide_shadow: resolve(filter::DIVIDE_SHADOW, l1)?,
                get_feature: resolve(filter::GET_FEATURE, l1)?,
                detect_outliers: resolve(filter::DETECT_OUTLIERS, l1)?,
                combine_halves: resolve(filter::COMBINE_HALVES, l1)?,
            },
        })
    }

    fn rect_size(&self) -> (u32, u32) {
        let rect = self.state.rect;
        ((rect[2] - rect[0]).max(0) as u32, (rect[3] - rect[1]).max(0) as u32)
    }

    /// Launches `kernel` over `w × h` threads without synchronizing.
    fn launch(&self, kernel: &Kernel, (w, h): (u32, u32), args: &[KernelArg]) -> Result<(), DeviceError> {
        let driver = self.scope.driver();
        let max_threads = self
            .scope
            .check("function_max_threads", driver.function_max_threads(kernel.func))?;
        let (grid, block) = square_blocks(max_threads, w, h);
        self.scope.check("launch", driver.launch(kernel.func, grid, block, args))
    }

    fn zero(&self, ptr: DevicePtr, bytes: usize) -> Result<(), DeviceError> {
        self.scope.check("memset_d8", self.scope.driver().memset_d8(ptr, 0, bytes))
    }

    fn begin(&self) -> Result<(), DeviceError> {
        self.scope.ensure_clear()
    }

    /// `local_rect` of the window offset `(dx, dy)` in a `w × h` region.
    fn local_rect(dx: i32, dy: i32, w: i32, h: i32) -> [i32; 4] {
        [0.max(-dx), 0.max(-dy), w - 0.max(dx), h - 0.max(dy)]
    }

    fn offsets(r: i32) -> impl Iterator<Item = (i32, i32)> {
        let side = 2 * r + 1;
        (0..side * side).map(move |i| (i % side - r, i / side - r))
    }
}

impl DenoiseOps for FilterLauncher<'_> {
    fn set_tiles(&self, tiles: &TilesInfo) -> Result<(), DeviceError> {
        self.begin()?;
        let ptr = self.state.tiles_ptr()?;
        self.scope.check(
            "memcpy_htod",
            self.scope.driver().memcpy_htod(ptr, bytemuck::bytes_of(tiles)),
        )
    }

    fn non_local_means(
        &self,
        nlm: NlmParams,
        image: DevicePtr,
        guide: DevicePtr,
        variance: DevicePtr,
        out: DevicePtr,
    ) -> Result<(), DeviceError> {
        self.begin()?;
        let (w, h) = self.rect_size();
        let stride = self.state.width();
        let plane_bytes = self.state.pass_stride() * 4;
        let [difference, blurred, weight_accum] = self.state.nlm_planes()?;

        self.zero(weight_accum, plane_bytes)?;
        self.zero(out, plane_bytes)?;

        let k = &self.kernels;
        let channel_offset = 0i32;
        for (dx, dy) in Self::offsets(nlm.r) {
            let local_rect = Self::local_rect(dx, dy, w as i32, h as i32);
            let calc_difference: [KernelArg; 10] = [
                dx.into(),
                dy.into(),
                guide.into(),
                variance.into(),
                difference.into(),
                local_rect.into(),
                stride.into(),
                channel_offset.into(),
                nlm.a.into(),
                nlm.k_2.into(),
            ];
            let blur: [KernelArg; 5] = [
                difference.into(),
                blurred.into(),
                local_rect.into(),
                stride.into(),
                nlm.f.into(),
            ];
            let calc_weight: [KernelArg; 5] = [
                blurred.into(),
                difference.into(),
                local_rect.into(),
                stride.into(),
                nlm.f.into(),
            ];
            let update_output: [KernelArg; 9] = [
                dx.into(),
                dy.into(),
                blurred.into(),
                image.into(),
                out.into(),
                weight_accum.into(),
                local_rect.into(),
                stride.into(),
                nlm.f.into(),
            ];

            self.launch(&k.nlm_calc_difference, (w, h), &calc_difference)?;
            self.launch(&k.nlm_blur, (w, h), &blur)?;
            self.launch(&k.nlm_calc_weight, (w, h), &calc_weight)?;
            self.launch(&k.nlm_blur, (w, h), &blur)?;
            self.launch(&k.nlm_update_output, (w, h), &update_output)?;
        }

        let full: [i32; 4] = [0, 0, w as i32, h as i32];
        self.launch(
            &k.nlm_normalize,
            (w, h),
            &[out.into(), weight_accum.into(), full.into(), stride.into()],
        )?;
        self.scope.synchronize()
    }

    fn construct_transform(&self) -> Result<(), DeviceError> {
        self.begin()?;
        let s = self.state;
        let planes = s.planes()?;
        self.launch(
            &self.kernels.construct_transform,
            (s.filter_area[2] as u32, s.filter_area[3] as u32),
            &[
                planes.buffer.into(),
                s.transform()?.into(),
                s.rank()?.into(),
                s.filter_area.into(),
                s.rect.into(),
                s.radius.into(),
                s.pca_threshold.into(),
                (planes.pass_stride as i32).into(),
            ],
        )?;
        self.scope.synchronize()
    }

    fn reconstruct(&self, color: DevicePtr, color_variance: DevicePtr, output: DevicePtr) -> Result<(), DeviceError> {
        self.begin()?;
        let s = self.state;
        let [(xtwx, xtwx_bytes), (xtwy, xtwy_bytes)] = s.normal_equations()?;
        self.zero(xtwx, xtwx_bytes)?;
        self.zero(xtwy, xtwy_bytes)?;

        let planes = s.planes()?;
        let (w, h) = self.rect_size();
        let stride = s.width();
        let height = s.height();
        let pass_stride = planes.pass_stride as i32;
        let [difference, blurred, _] = s.nlm_planes()?;
        let filter_rect = s.local_filter_rect();
        let (transform, rank) = (s.transform()?, s.rank()?);
        let f = 4i32;
        let a = 1.0f32;

        let k = &self.kernels;
        for (dx, dy) in Self::offsets(s.radius) {
            let local_rect = Self::local_rect(dx, dy, w as i32, h as i32);
            let blur: [KernelArg; 5] = [
                difference.into(),
                blurred.into(),
                local_rect.into(),
                stride.into(),
                f.into(),
            ];

            self.launch(
                &k.nlm_calc_difference,
                (w, h),
                &[
                    dx.into(),
                    dy.into(),
                    color.into(),
                    color_variance.into(),
                    difference.into(),
                    local_rect.into(),
                    stride.into(),
                    pass_stride.into(),
                    a.into(),
                    s.nlm_k_2.into(),
                ],
            )?;
            self.launch(&k.nlm_blur, (w, h), &blur)?;
            self.launch(
                &k.nlm_calc_weight,
                (w, h),
                &[
                    blurred.into(),
                    difference.into(),
                    local_rect.into(),
                    stride.into(),
                    f.into(),
                ],
            )?;
            self.launch(&k.nlm_blur, (w, h), &blur)?;
            self.launch(
                &k.nlm_construct_gramian,
                (w, h),
                &[
                    dx.into(),
                    dy.into(),
                    blurred.into(),
                    planes.buffer.into(),
                    transform.into(),
                    rank.into(),
                    xtwx.into(),
                    xtwy.into(),
                    local_rect.into(),
                    filter_rect.into(),
                    stride.into(),
                    height.into(),
                    f.into(),
                    pass_stride.into(),
                ],
            )?;
        }

        let target = &s.target;
        let buffer_params: [i32; 4] = [target.offset, target.stride, target.pass_stride, 0];
        self.launch(
            &k.finalize,
            (s.filter_area[2] as u32, s.filter_area[3] as u32),
            &[
                stride.into(),
                height.into(),
                output.into(),
                rank.into(),
                xtwx.into(),
                xtwy.into(),
                s.filter_area.into(),
                buffer_params.into(),
                s.sample.into(),
            ],
        )?;
        self.scope.synchronize()
    }

    fn divide_shadow(
        &self,
        a: DevicePtr,
        b: DevicePtr,
        sample_variance: DevicePtr,
        sv_variance: DevicePtr,
        buffer_variance: DevicePtr,
    ) -> Result<(), DeviceError> {
        self.begin()?;
        let s = self.state;
        self.launch(
            &self.kernels.divide_shadow,
            self.rect_size(),
            &[
                s.sample.into(),
                s.tiles_ptr()?.into(),
                a.into(),
                b.into(),
                sample_variance.into(),
                sv_variance.into(),
                buffer_variance.into(),
                s.rect.into(),
                s.render_pass_stride.into(),
                s.denoising_offset.into(),
            ],
        )?;
        self.scope.synchronize()
    }

    fn get_feature(
        &self,
        mean_offset: i32,
        variance_offset: i32,
        mean: DevicePtr,
        variance: DevicePtr,
    ) -> Result<(), DeviceError> {
        self.begin()?;
        let s = self.state;
        self.launch(
            &self.kernels.get_feature,
            self.rect_size(),
            &[
                s.sample.into(),
                s.tiles_ptr()?.into(),
                mean_offset.into(),
                variance_offset.into(),
                mean.into(),
                variance.into(),
                s.rect.into(),
                s.render_pass_stride.into(),
                s.denoising_offset.into(),
            ],
        )?;
        self.scope.synchronize()
    }

    fn detect_outliers(
        &self,
        image: DevicePtr,
        variance: DevicePtr,
        depth: DevicePtr,
        output: DevicePtr,
    ) -> Result<(), DeviceError> {
        self.begin()?;
        let s = self.state;
        self.launch(
            &self.kernels.detect_outliers,
            self.rect_size(),
            &[
                image.into(),
                variance.into(),
                depth.into(),
                output.into(),
                s.rect.into(),
                (s.pass_stride() as i32).into(),
            ],
        )?;
        self.scope.synchronize()
    }

    fn combine_halves(
        &self,
        a: DevicePtr,
        b: DevicePtr,
        mean: Option<DevicePtr>,
        variance: Option<DevicePtr>,
        r: i32,
        rect: [i32; 4],
    ) -> Result<(), DeviceError> {
        self.begin()?;
        self.launch(
            &self.kernels.combine_halves,
            self.rect_size(),
            &[mean.into(), variance.into(), a.into(), b.into(), rect.into(), r.into()],
        )?;
        self.scope.synchronize()
    }
}
