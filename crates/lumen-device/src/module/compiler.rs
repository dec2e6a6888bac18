use std::fmt;
use std::path::{Path, PathBuf};

use crate::config::BackendConfig;

/// Compute architecture of a device (`major.minor`).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Architecture {
    pub major: u32,
    pub minor: u32,
}

impl Architecture {
    pub fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// Two-digit code, e.g. 61 for 6.1.
    pub fn code(self) -> u32 {
        self.major * 10 + self.minor
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sm_{}", self.code())
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ModuleKind {
    /// Megakernel render module.
    Render,
    /// Render module split into stage kernels.
    SplitRender,
    /// Denoising filter module.
    Filter,
}

impl ModuleKind {
    /// Base name of module files of this kind.
    pub fn file_stem(self) -> &'static str {
        match self {
            Self::Render => "kernel",
            Self::SplitRender => "kernel_split",
            Self::Filter => "filter",
        }
    }

    /// Name used in messages.
    pub fn label(self) -> &'static str {
        match self {
            Self::Render | Self::SplitRender => "render",
            Self::Filter => "filter",
        }
    }
}

impl fmt::Display for ModuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Render => "render",
            Self::SplitRender => "split render",
            Self::Filter => "filter",
        })
    }
}

/// Scene features the render kernels must support.
///
/// With adaptive compilation the module is built for exactly these;
/// otherwise the full feature set is used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestedFeatures {
    pub max_closure: u32,
    pub max_nodes_group: u32,
    pub nodes_features: u32,
    pub hair: bool,
    pub object_motion: bool,
    pub camera_motion: bool,
    pub baking: bool,
    pub subsurface: bool,
    pub volume: bool,
    pub branched_integrator: bool,
    pub patch_evaluation: bool,
    pub transparent_shadows: bool,
    pub shadow_catcher: bool,
    pub principled: bool,
    pub denoising: bool,
}

impl Default for RequestedFeatures {
    fn default() -> Self {
        Self {
            max_closure: 64,
            max_nodes_group: u32::MAX,
            nodes_features: u32::MAX,
            hair: true,
            object_motion: true,
            camera_motion: true,
            baking: true,
            subsurface: true,
            volume: true,
            branched_integrator: true,
            patch_evaluation: true,
            transparent_shadows: true,
            shadow_catcher: true,
            principled: true,
            denoising: true,
        }
    }
}

impl RequestedFeatures {
    /// Preprocessor options selecting exactly these features.
    pub fn build_options(&self) -> String {
        let mut options = vec![
            format!("-DLUMEN_NODES_MAX_GROUP={}", self.max_nodes_group),
            format!("-DLUMEN_NODES_FEATURES={}", self.nodes_features),
            format!("-DLUMEN_MAX_CLOSURE={}", self.max_closure),
        ];

        let disabled = [
            (self.hair, "HAIR"),
            (self.object_motion, "OBJECT_MOTION"),
            (self.camera_motion, "CAMERA_MOTION"),
            (self.baking, "BAKING"),
            (self.subsurface, "SUBSURFACE"),
            (self.volume, "VOLUME"),
            (self.branched_integrator, "BRANCHED_PATH"),
            (self.patch_evaluation, "PATCH_EVAL"),
            (self.transparent_shadows, "TRANSPARENT"),
            (self.shadow_catcher, "SHADOW_CATCHER"),
            (self.principled, "PRINCIPLED"),
            (self.denoising, "DENOISING"),
        ];
        options.extend(
            disabled
                .iter()
                .filter(|(enabled, _)| !enabled)
                .map(|(_, name)| format!("-DLUMEN_NO_{name}")),
        );

        options.join(" ")
    }
}

/// Everything the compiler collaborator needs to produce one module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileRequest {
    pub kind: ModuleKind,
    pub architecture: Architecture,
    pub features: RequestedFeatures,
    /// Full option string passed to the compiler.
    pub build_options: String,
}

impl CompileRequest {
    pub fn new(kind: ModuleKind, architecture: Architecture, features: &RequestedFeatures, config: &BackendConfig) -> Self {
        let mut options = Vec::new();
        match kind {
            ModuleKind::Filter => {}
            _ if config.adaptive_compile => options.push(features.build_options()),
            ModuleKind::SplitRender => options.push(format!("-DLUMEN_MAX_CLOSURE={}", config.max_closure)),
            ModuleKind::Render => {}
        }
        if kind == ModuleKind::SplitRender {
            options.push("-DLUMEN_SPLIT_KERNEL".to_string());
        }
        if !config.extra_cflags.is_empty() {
            options.push(config.extra_cflags.clone());
        }

        Self {
            kind,
            architecture,
            features: features.clone(),
            build_options: options.join(" "),
        }
    }
}

/// Failures of the compiler collaborator. All are fatal for the session.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CompileError {
    #[error("kernel compiler not found: {0}")]
    CompilerNotFound(String),
    #[error("kernel compiler version {found} is unsupported, {required} is required")]
    UnsupportedVersion { found: String, required: String },
    #[error("kernel compilation failed: {0}")]
    CompileFailed(String),
    #[error("no precompiled {kind} kernels for {architecture}")]
    PrecompiledMissing { kind: ModuleKind, architecture: Architecture },
}

/// Produces loadable module files.
pub trait KernelCompiler: Send + Sync {
    /// Path of a module file satisfying `request`, compiling it if needed.
    fn compile(&self, request: &CompileRequest) -> Result<PathBuf, CompileError>;
}

/// Compiler that only finds prebuilt modules named
/// `<stem>_sm_<MM>.bin` in a directory.
///
/// Prebuilt modules carry the full feature set, so build options are ignored.
#[derive(Debug, Clone)]
pub struct PrecompiledKernels {
    dir: PathBuf,
}

impl PrecompiledKernels {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, kind: ModuleKind, architecture: Architecture) -> PathBuf {
        self.dir
            .join(format!("{}_sm_{}.bin", kind.file_stem(), architecture.code()))
    }
}

impl KernelCompiler for PrecompiledKernels {
    fn compile(&self, request: &CompileRequest) -> Result<PathBuf, CompileError> {
        let path = self.path_for(request.kind, request.architecture);
        if path.is_file() {
            log::info!("using precompiled {} kernels: {}", request.kind, path.display());
            Ok(path)
        } else {
            Err(CompileError::PrecompiledMissing {
                kind: request.kind,
                architecture: request.architecture,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn architecture_formats_as_sm_code() {
        assert_eq!(Architecture::new(6, 1).to_string(), "sm_61");
        assert_eq!(Architecture::new(3, 0).code(), 30);
    }

    #[test]
    fn build_options_list_disabled_features() {
        let features = RequestedFeatures {
            max_closure: 8,
            hair: false,
            volume: false,
            ..RequestedFeatures::default()
        };
        let options = features.build_options();
        assert!(options.contains("-DLUMEN_MAX_CLOSURE=8"));
        assert!(options.contains("-DLUMEN_NO_HAIR"));
        assert!(options.contains("-DLUMEN_NO_VOLUME"));
        assert!(!options.contains("-DLUMEN_NO_BAKING"));
    }

    #[test]
    fn split_requests_pin_the_closure_limit() {
        let config = BackendConfig {
            extra_cflags: "-g".into(),
            ..BackendConfig::default()
        };
        let features = RequestedFeatures {
            max_closure: 4,
            ..RequestedFeatures::default()
        };
        let arch = Architecture::new(6, 1);

        let split = CompileRequest::new(ModuleKind::SplitRender, arch, &features, &config);
        assert_eq!(split.build_options, "-DLUMEN_MAX_CLOSURE=64 -DLUMEN_SPLIT_KERNEL -g");

        let filter = CompileRequest::new(ModuleKind::Filter, arch, &features, &config);
        assert_eq!(filter.build_options, "-g");

        let adaptive = BackendConfig {
            adaptive_compile: true,
            ..BackendConfig::default()
        };
        let render = CompileRequest::new(ModuleKind::Render, arch, &features, &adaptive);
        assert!(render.build_options.contains("-DLUMEN_MAX_CLOSURE=4"));
    }

    #[test]
    fn precompiled_modules_are_looked_up_by_architecture() {
        let dir = std::env::temp_dir().join(format!("lumen-precompiled-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let kernels = PrecompiledKernels::new(&dir);
        let arch = Architecture::new(7, 5);
        std::fs::write(dir.join("filter_sm_75.bin"), b"filter").unwrap();

        let request = |kind| CompileRequest::new(kind, arch, &RequestedFeatures::default(), &BackendConfig::default());
        assert_eq!(kernels.compile(&request(ModuleKind::Filter)), Ok(dir.join("filter_sm_75.bin")));
        assert_eq!(
            kernels.compile(&request(ModuleKind::Render)),
            Err(CompileError::PrecompiledMissing {
                kind: ModuleKind::Render,
                architecture: arch,
            })
        );
    }
}
