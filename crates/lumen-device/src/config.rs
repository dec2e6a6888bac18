//! Backend configuration.

/// Tunables for a [`GpuDevice`](crate::GpuDevice).
///
/// Defaults match what the kernels are built and tuned for. Use
/// [`BackendConfig::from_env`] to let the `LUMEN_*` environment variables
/// override individual fields.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendConfig {
    /// Compile kernels for the requested feature set instead of using the
    /// precompiled full-feature modules.
    pub adaptive_compile: bool,

    /// Render through the staged split kernel instead of the megakernel.
    pub split_kernel: bool,

    /// Number of worker threads executing queued tasks.
    pub worker_threads: usize,

    /// Multiplier applied to the occupancy block count when the device does
    /// not drive a display.
    ///
    /// Display devices keep the raw count so the desktop stays responsive.
    pub throughput_block_scale: u32,

    /// Granularity in which the bindless texture slot array grows.
    pub texture_slot_chunk: usize,

    /// Work items per shader evaluation launch.
    pub shader_chunk_size: usize,

    /// Local work size reported by the split launcher.
    pub split_local_size: [u32; 2],

    /// Alignment of the split global work size, per axis.
    pub split_global_alignment: [u32; 2],

    /// Closure limit baked into non-adaptive split modules.
    pub max_closure: u32,

    /// Extra flags appended to every compile request.
    pub extra_cflags: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            adaptive_compile: false,
            split_kernel: false,
            worker_threads: 1,
            throughput_block_scale: 8,
            texture_slot_chunk: 128,
            shader_chunk_size: 65536,
            split_local_size: [32, 1],
            split_global_alignment: [32, 16],
            max_closure: 64,
            extra_cflags: String::new(),
        }
    }
}

impl BackendConfig {
    /// Defaults overlaid with `LUMEN_ADAPTIVE_COMPILE`, `LUMEN_SPLIT_KERNEL`,
    /// `LUMEN_WORKER_THREADS` and `LUMEN_EXTRA_CFLAGS`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an explicit variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(v) = lookup("LUMEN_ADAPTIVE_COMPILE") {
            config.adaptive_compile = parse_flag("LUMEN_ADAPTIVE_COMPILE", &v, config.adaptive_compile);
        }
        if let Some(v) = lookup("LUMEN_SPLIT_KERNEL") {
            config.split_kernel = parse_flag("LUMEN_SPLIT_KERNEL", &v, config.split_kernel);
        }
        if let Some(v) = lookup("LUMEN_WORKER_THREADS") {
            match v.trim().parse::<usize>() {
                Ok(n) if n > 0 => config.worker_threads = n,
                _ => log::warn!("ignoring LUMEN_WORKER_THREADS={v:?}: expected a positive integer"),
            }
        }
        if let Some(v) = lookup("LUMEN_EXTRA_CFLAGS") {
            config.extra_cflags = v.trim().to_string();
        }

        config
    }
}

fn parse_flag(key: &str, value: &str, fallback: bool) -> bool {
    match value.trim().to_ascii_lowercase().as_str() {
        "" | "0" | "false" | "off" | "no" => false,
        "1" | "true" | "on" | "yes" => true,
        _ => {
            log::warn!("ignoring {key}={value:?}: expected a boolean");
            fallback
        }
    }
}
