//! Process-wide handle registry
//!
//! One coordinator runs per process. Components that cannot receive the
//! handle through construction (signal handlers, platform callbacks) look
//! it up here instead of reaching for ad-hoc globals.

use std::sync::OnceLock;

use crate::coordinator::CoordinatorHandle;
use crate::{Error, Result};

/// Holds the process-lifetime [`CoordinatorHandle`]
#[derive(Default)]
pub struct HandleRegistry {
    slot: OnceLock<CoordinatorHandle>,
}

impl HandleRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the coordinator handle.
    ///
    /// # Errors
    ///
    /// Returns error if a handle was already installed.
    pub fn install(&self, handle: CoordinatorHandle) -> Result<()> {
        self.slot
            .set(handle)
            .map_err(|_| Error::Config("coordinator handle already installed".into()))
    }

    /// Look up the installed handle, if any
    #[must_use]
    pub fn handle(&self) -> Option<CoordinatorHandle> {
        self.slot.get().cloned()
    }
}

static REGISTRY: OnceLock<HandleRegistry> = OnceLock::new();

/// The process-wide registry
#[must_use]
pub fn global() -> &'static HandleRegistry {
    REGISTRY.get_or_init(HandleRegistry::new)
}
