//! Process-wide worker runtime.
//!
//! Connections used outside of a tokio runtime dispatch their blocking
//! transport work onto a shared multi-threaded runtime owned by this module.
//! `init` is idempotent and `shutdown` tears the runtime down once; a later
//! `init` starts a fresh one.

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tokio::runtime::{Builder, Handle, Runtime};
use tracing::{debug, info};

use crate::error::{DriverError, Result};

/// An init-once, teardown-once runtime slot.
pub struct SharedRuntime {
    runtime: Mutex<Option<Runtime>>,
}

impl Default for SharedRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedRuntime {
    pub fn new() -> Self {
        Self {
            runtime: Mutex::new(None),
        }
    }

    /// Start the runtime if it is not running and return its handle.
    pub fn init(&self) -> Result<Handle> {
        let mut runtime = self.runtime.lock();
        if let Some(rt) = runtime.as_ref() {
            return Ok(rt.handle().clone());
        }

        let rt = Builder::new_multi_thread()
            .thread_name("pgkit-worker")
            .enable_all()
            .build()
            .map_err(|e| {
                DriverError::ConnectionError(format!("Failed to start worker runtime: {}", e))
            })?;
        let handle = rt.handle().clone();
        *runtime = Some(rt);
        info!("Worker runtime started");
        Ok(handle)
    }

    pub fn is_running(&self) -> bool {
        self.runtime.lock().is_some()
    }

    /// Stop the runtime. Blocking work already running is not awaited.
    pub fn shutdown(&self) {
        let runtime = self.runtime.lock().take();
        if let Some(rt) = runtime {
            rt.shutdown_background();
            debug!("Worker runtime shut down");
        }
    }
}

static SHARED: Lazy<SharedRuntime> = Lazy::new(SharedRuntime::new);

/// Start the shared runtime if needed and return its handle.
pub fn init() -> Result<Handle> {
    SHARED.init()
}

pub fn is_running() -> bool {
    SHARED.is_running()
}

/// Stop the shared runtime.
pub fn shutdown() {
    SHARED.shutdown()
}

/// The handle operations should run on: the ambient runtime when called
/// from inside one, the shared runtime otherwise.
pub(crate) fn current_or_shared() -> Result<Handle> {
    match Handle::try_current() {
        Ok(handle) => Ok(handle),
        Err(_) => init(),
    }
}
