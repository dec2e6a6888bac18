use crate::device::{ContextScope, DeviceShared};
use crate::driver::{Dim3, KernelArg};
use crate::error::DeviceError;
use crate::module::kernels;
use crate::task::{CancelToken, DeviceTask, ShaderEvalType, ShaderParams, TaskOutcome};

/// Numeric evaluation type passed to the shader kernels.
pub fn eval_type_code(eval_type: ShaderEvalType) -> i32 {
    match eval_type {
        ShaderEvalType::Displace => 1,
        ShaderEvalType::Background => 2,
        ShaderEvalType::Bake(pass) => 16 + pass,
    }
}

/// Evaluates shaders for `params.w` work items, every sample in turn.
///
/// Items are launched in chunks of the configured size; cancellation is
/// checked after each chunk and progress reported after each sample.
pub(crate) fn shader(
    dev: &DeviceShared,
    scope: &ContextScope<'_>,
    task: &DeviceTask,
    cancel: &CancelToken,
    params: &ShaderParams,
) -> Result<TaskOutcome, DeviceError> {
    scope.ensure_clear()?;
    dev.sync_textures(scope)?;

    let name = match params.eval_type {
        ShaderEvalType::Bake(_) => kernels::SHADER_BAKE,
        ShaderEvalType::Displace => kernels::SHADER_DISPLACE,
        ShaderEvalType::Background => kernels::SHADER_BACKGROUND,
    };
    let kernel = dev.render_kernel(scope, name)?;
    let driver = scope.driver();
    let threads_per_block = scope
        .check("function_max_threads", driver.function_max_threads(kernel.func))?
        .max(1);

    let chunk = dev.config.shader_chunk_size.clamp(1, i32::MAX as usize) as i32;
    let eval_type = eval_type_code(params.eval_type);
    let end = params.x + params.w;

    for sample in 0..params.num_samples {
        let mut shader_x = params.x;
        while shader_x < end {
            let shader_w = chunk.min(end - shader_x);
            let blocks = (shader_w as u32).div_ceil(threads_per_block);

            let mut args: Vec<KernelArg> = vec![params.input.into(), params.output.into(), eval_type.into()];
            if let ShaderEvalType::Bake(_) = params.eval_type {
                args.push(params.filter.into());
            }
            args.extend([
                KernelArg::from(shader_x),
                shader_w.into(),
                params.offset.into(),
                sample.into(),
            ]);

            scope.check(
                "launch",
                driver.launch(kernel.func, Dim3::linear(blocks), Dim3::linear(threads_per_block), &args),
            )?;
            scope.synchronize()?;

            shader_x += shader_w;
            if task.should_stop(cancel) {
                return Ok(TaskOutcome::Cancelled);
            }
        }
        task.progress.update(None, params.w.max(0) as u64);
    }

    Ok(TaskOutcome::Completed)
}
