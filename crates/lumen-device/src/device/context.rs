//! Backend context and the scope that makes it current.

use std::marker::PhantomData;
use std::sync::Arc;

use crate::driver::{ContextFlags, ContextHandle, Driver, DriverError};
use crate::error::{DeviceError, ErrorLatch};

/// The backend's driver context plus its error latch.
///
/// Created once per device and destroyed when dropped. Device work runs
/// inside a [`ContextScope`].
pub struct DeviceContext {
    driver: Arc<dyn Driver>,
    handle: Option<ContextHandle>,
    display_shared: bool,
    errors: ErrorLatch,
}

impl DeviceContext {
    /// Creates a context on device `ordinal`.
    ///
    /// With `display_sharing` a display-sharing context is tried first; if the
    /// driver refuses, a plain context is created instead and
    /// [`is_display_shared`](Self::is_display_shared) reports `false`. A
    /// context that cannot be created at all is latched as an error; the
    /// value is still returned so the device can report it.
    pub fn create(driver: Arc<dyn Driver>, ordinal: usize, display_sharing: bool) -> Self {
        let errors = ErrorLatch::new();
        let mut display_shared = false;
        let mut handle = None;

        if display_sharing {
            match driver.context_create(ordinal, ContextFlags { display_sharing: true }) {
                Ok(ctx) => {
                    handle = Some(ctx);
                    display_shared = true;
                }
                Err(e) => log::warn!("display sharing unavailable on device {ordinal} ({e}); rendering offscreen"),
            }
        }

        if handle.is_none() {
            match driver.context_create(ordinal, ContextFlags::default()) {
                Ok(ctx) => handle = Some(ctx),
                Err(e) => {
                    errors.raise(DeviceError::ContextInit(e));
                }
            }
        }

        Self {
            driver,
            handle,
            display_shared,
            errors,
        }
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    pub fn handle(&self) -> Option<ContextHandle> {
        self.handle
    }

    pub fn errors(&self) -> &ErrorLatch {
        &self.errors
    }

    /// Whether the context shares buffers with the display.
    pub fn is_display_shared(&self) -> bool {
        self.display_shared
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        if let Some(ctx) = self.handle.take() {
            if let Err(e) = self.driver.context_destroy(ctx) {
                log::warn!("failed to destroy GPU context: {e}");
            }
        }
    }
}

/// Guard keeping the backend context current on this thread.
///
/// Entering pushes the context, dropping pops it, so the previous context is
/// restored on every exit path. Scopes nest. A scope is the token required by
/// everything that issues driver calls; it cannot leave its thread.
pub struct ContextScope<'a> {
    ctx: &'a DeviceContext,
    pushed: bool,
    _thread_bound: PhantomData<*const ()>,
}

impl<'a> ContextScope<'a> {
    pub fn enter(ctx: &'a DeviceContext) -> Self {
        let pushed = match ctx.handle {
            Some(handle) => ctx.errors.check("context_push", ctx.driver.context_push(handle)).is_ok(),
            None => false,
        };

        Self {
            ctx,
            pushed,
            _thread_bound: PhantomData,
        }
    }

    pub fn driver(&self) -> &'a dyn Driver {
        self.ctx.driver.as_ref()
    }

    pub fn errors(&self) -> &'a ErrorLatch {
        &self.ctx.errors
    }

    /// Converts a driver result, latching a failure of `call`.
    pub fn check<T>(&self, call: &'static str, result: Result<T, DriverError>) -> Result<T, DeviceError> {
        self.ctx.errors.check(call, result)
    }

    /// Fails fast once the device has latched an error.
    pub fn ensure_clear(&self) -> Result<(), DeviceError> {
        self.ctx.errors.ensure_clear()
    }

    pub fn synchronize(&self) -> Result<(), DeviceError> {
        self.check("synchronize", self.driver().synchronize())
    }
}

impl Drop for ContextScope<'_> {
    fn drop(&mut self) {
        if self.pushed {
            if let Err(e) = self.ctx.driver.context_pop() {
                self.ctx.errors.report(format!("GPU driver call context_pop failed: {e}"));
            }
        }
    }
}
