//! Kernel modules: compile requests, loading, and kernel lookup.

mod compiler;
pub mod kernels;
mod resolver;

pub use compiler::{
    Architecture, CompileError, CompileRequest, KernelCompiler, ModuleKind, PrecompiledKernels,
    RequestedFeatures,
};
pub use resolver::{Kernel, KernelModules, LoadedModule};
