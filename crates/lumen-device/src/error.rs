//! Backend error types and the first-error latch.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::driver::DriverError;
use crate::module::CompileError;

/// Failures surfaced by backend operations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DeviceError {
    #[error("failed to create GPU context: {0}")]
    ContextInit(DriverError),

    #[error(
        "GPU rendering is supported only with compute capability {required}.0 or up, found {major}.{minor}"
    )]
    UnsupportedDevice { major: u32, minor: u32, required: u32 },

    #[error(transparent)]
    Compilation(#[from] CompileError),

    #[error("failed to load {module} module from {path}: {reason}")]
    ModuleLoad {
        module: &'static str,
        path: String,
        reason: String,
    },

    #[error("kernel \"{name}\" not found in {module} module")]
    KernelNotFound { name: String, module: &'static str },

    #[error("failed to allocate {bytes} bytes for \"{name}\": {source}")]
    Allocation {
        name: String,
        bytes: usize,
        source: DriverError,
    },

    #[error("GPU driver call {call} failed: {source}")]
    Runtime {
        call: &'static str,
        source: DriverError,
    },

    #[error("kernel modules are already loaded; reloading them is not supported")]
    ReloadRejected,

    #[error("{0}")]
    InvalidRequest(String),

    #[error("device is in an error state: {0}")]
    Aborted(String),

    #[error("failed to start worker threads: {0}")]
    WorkerSpawn(String),
}

/// Records the first error raised on a device.
///
/// Later errors are still logged but never replace the latched message, so
/// the user sees the root cause rather than the cascade that follows it.
#[derive(Debug, Default)]
pub struct ErrorLatch {
    first: Mutex<Option<String>>,
    raised: AtomicBool,
    hinted: AtomicBool,
}

impl ErrorLatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Logs `message` and latches it if it is the first one.
    pub fn report(&self, message: impl Into<String>) {
        let message = message.into();
        log::error!("{message}");

        {
            let mut first = self.first.lock().unwrap_or_else(|e| e.into_inner());
            if first.is_none() {
                *first = Some(message);
            }
        }
        self.raised.store(true, Ordering::Release);

        if !self.hinted.swap(true, Ordering::AcqRel) {
            log::info!(
                "GPU errors are often caused by running out of device memory or by an \
                 outdated driver; run with RUST_LOG=lumen_device=debug for allocation \
                 and launch traces"
            );
        }
    }

    /// Latches `err` and hands it back for propagation.
    pub fn raise(&self, err: DeviceError) -> DeviceError {
        self.report(err.to_string());
        err
    }

    /// Converts a driver result, latching the failure under `call`.
    pub fn check<T>(&self, call: &'static str, result: Result<T, DriverError>) -> Result<T, DeviceError> {
        result.map_err(|source| self.raise(DeviceError::Runtime { call, source }))
    }

    pub fn have_error(&self) -> bool {
        self.raised.load(Ordering::Acquire)
    }

    /// The latched message, if any.
    pub fn message(&self) -> Option<String> {
        self.first.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// `Err(Aborted)` once an error has been latched.
    ///
    /// Operations call this before touching the device.
    pub fn ensure_clear(&self) -> Result<(), DeviceError> {
        if self.have_error() {
            Err(DeviceError::Aborted(self.message().unwrap_or_default()))
        } else {
            Ok(())
        }
    }
}
