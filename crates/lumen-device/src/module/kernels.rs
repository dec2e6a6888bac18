//! Names of the kernels and module globals the backend uses.

pub const PATH_TRACE: &str = "kernel_path_trace";
pub const BRANCHED_PATH_TRACE: &str = "kernel_branched_path_trace";

pub const CONVERT_TO_BYTE: &str = "kernel_convert_to_byte";
pub const CONVERT_TO_HALF_FLOAT: &str = "kernel_convert_to_half_float";

pub const SHADER_BAKE: &str = "kernel_bake";
pub const SHADER_DISPLACE: &str = "kernel_displace";
pub const SHADER_BACKGROUND: &str = "kernel_background";

/// Probe reporting the split state size for a thread count.
pub const STATE_BUFFER_SIZE: &str = "kernel_state_buffer_size";
pub const DATA_INIT: &str = "kernel_data_init";

/// Split stage `<stage>` is the kernel `kernel_<stage>`.
pub const SPLIT_PREFIX: &str = "kernel_";

/// Runs once per tile after data init.
pub const SPLIT_PATH_INIT: &str = "path_init";

/// Stages of one split iteration, in launch order.
pub const SPLIT_STAGES: &[&str] = &[
    "scene_intersect",
    "lamp_emission",
    "queue_enqueue",
    "shader_setup",
    "shader_eval",
    "direct_lighting",
    "shadow_blocked",
    "next_iteration_setup",
    "buffer_update",
];

pub mod filter {
    pub const NLM_CALC_DIFFERENCE: &str = "kernel_filter_nlm_calc_difference";
    pub const NLM_BLUR: &str = "kernel_filter_nlm_blur";
    pub const NLM_CALC_WEIGHT: &str = "kernel_filter_nlm_calc_weight";
    pub const NLM_UPDATE_OUTPUT: &str = "kernel_filter_nlm_update_output";
    pub const NLM_NORMALIZE: &str = "kernel_filter_nlm_normalize";
    pub const NLM_CONSTRUCT_GRAMIAN: &str = "kernel_filter_nlm_construct_gramian";
    pub const CONSTRUCT_TRANSFORM: &str = "kernel_filter_construct_transform";
    pub const FINALIZE: &str = "kernel_filter_finalize";
    pub const DIVIDE_SHADOW: &str = "kernel_filter_divide_shadow";
    pub const GET_FEATURE: &str = "kernel_filter_get_feature";
    pub const DETECT_OUTLIERS: &str = "kernel_filter_detect_outliers";
    pub const COMBINE_HALVES: &str = "kernel_filter_combine_halves";
}

/// Constant kernel data.
pub const DATA: &str = "__data";

/// Address of the bindless texture slot array.
pub const TEXTURE_INFO: &str = "__texture_info";
