use std::path::{Path, PathBuf};

use super::compiler::{CompileRequest, KernelCompiler, ModuleKind};
use crate::device::ContextScope;
use crate::driver::{DriverError, FunctionHandle, ModuleHandle};
use crate::error::DeviceError;

/// A module loaded into the backend context.
#[derive(Debug)]
pub struct LoadedModule {
    handle: ModuleHandle,
    kind: ModuleKind,
    path: PathBuf,
}

/// A resolved kernel entry point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Kernel {
    pub func: FunctionHandle,
    pub name: String,
}

impl LoadedModule {
    /// Reads the module file at `path` and loads it.
    pub fn load(scope: &ContextScope<'_>, kind: ModuleKind, path: &Path) -> Result<Self, DeviceError> {
        let module_error = |reason: String| {
            scope.errors().raise(DeviceError::ModuleLoad {
                module: kind.label(),
                path: path.display().to_string(),
                reason,
            })
        };

        let image = std::fs::read(path).map_err(|e| module_error(e.to_string()))?;
        let handle = scope
            .driver()
            .module_load(&image)
            .map_err(|e| module_error(e.to_string()))?;

        log::info!("loaded {kind} module from {}", path.display());
        Ok(Self {
            handle,
            kind,
            path: path.to_path_buf(),
        })
    }

    pub fn handle(&self) -> ModuleHandle {
        self.handle
    }

    pub fn kind(&self) -> ModuleKind {
        self.kind
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Looks up kernel `name`.
    ///
    /// Lookups go through the driver, so callers resolve once and keep the
    /// handle outside their launch loops.
    pub fn resolve(&self, scope: &ContextScope<'_>, name: &str) -> Result<Kernel, DeviceError> {
        scope.ensure_clear()?;
        match scope.driver().module_function(self.handle, name) {
            Ok(func) => Ok(Kernel {
                func,
                name: name.to_string(),
            }),
            Err(DriverError::NotFound(_)) => Err(scope.errors().raise(DeviceError::KernelNotFound {
                name: name.to_string(),
                module: self.kind.label(),
            })),
            Err(source) => Err(scope.errors().raise(DeviceError::Runtime {
                call: "module_function",
                source,
            })),
        }
    }

    fn unload(self, scope: &ContextScope<'_>) {
        if let Err(e) = scope.driver().module_unload(self.handle) {
            log::warn!("failed to unload {} module: {e}", self.kind);
        }
    }
}

/// The render and filter modules of a device.
#[derive(Debug, Default)]
pub struct KernelModules {
    render: Option<LoadedModule>,
    filter: Option<LoadedModule>,
}

impl KernelModules {
    pub fn new() -> Self {
        Self::default()
    }

    /// Both modules are live.
    pub fn is_loaded(&self) -> bool {
        self.render.is_some() && self.filter.is_some()
    }

    /// Compiles and loads the render and filter modules.
    ///
    /// Modules load once: a request while both are live is rejected. Either
    /// both modules end up loaded or neither does.
    pub fn load(
        &mut self,
        scope: &ContextScope<'_>,
        compiler: &dyn KernelCompiler,
        render: &CompileRequest,
        filter: &CompileRequest,
    ) -> Result<(), DeviceError> {
        if self.is_loaded() {
            let err = DeviceError::ReloadRejected;
            log::error!("{err}");
            return Err(err);
        }
        scope.ensure_clear()?;

        let compile = |request: &CompileRequest| {
            log::info!("compiling {} kernels for {}", request.kind, request.architecture);
            compiler
                .compile(request)
                .map_err(|e| scope.errors().raise(DeviceError::from(e)))
        };

        let render_module = LoadedModule::load(scope, render.kind, &compile(render)?)?;
        let filter_module = compile(filter).and_then(|path| LoadedModule::load(scope, filter.kind, &path));

        match filter_module {
            Ok(filter_module) => {
                self.render = Some(render_module);
                self.filter = Some(filter_module);
                Ok(())
            }
            Err(e) => {
                render_module.unload(scope);
                Err(e)
            }
        }
    }

    /// The render module, or an error if it is not loaded.
    pub fn render(&self) -> Result<&LoadedModule, DeviceError> {
        self.render
            .as_ref()
            .ok_or_else(|| DeviceError::InvalidRequest("render module is not loaded".into()))
    }

    pub fn filter(&self) -> Result<&LoadedModule, DeviceError> {
        self.filter
            .as_ref()
            .ok_or_else(|| DeviceError::InvalidRequest("filter module is not loaded".into()))
    }

    pub fn render_handle(&self) -> Option<ModuleHandle> {
        self.render.as_ref().map(LoadedModule::handle)
    }

    /// Unloads both modules.
    pub fn unload(&mut self, scope: &ContextScope<'_>) {
        for module in [self.render.take(), self.filter.take()].into_iter().flatten() {
            module.unload(scope);
        }
    }
}
