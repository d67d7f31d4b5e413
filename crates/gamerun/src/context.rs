//! Store context for a running guest.

use wasmtime::StoreLimits;
use wasmtime::StoreLimitsBuilder;

use crate::fault::ProtocolViolation;
use crate::system::System;

/// Per-guest data stored in wasmtime's `Store`.
///
/// The platform adapter is present only while a bridge call is running; the
/// guard in [`crate::game`] installs it and clears it again on every exit
/// path. Host functions reach it through the wasmtime `Caller`.
pub struct GameCtx<S> {
    system: Option<S>,
    pub(crate) limits: StoreLimits,
}

impl<S: System> GameCtx<S> {
    pub fn new(max_memory: Option<usize>) -> Self {
        let mut limits = StoreLimitsBuilder::new();
        if let Some(bytes) = max_memory {
            limits = limits.memory_size(bytes);
        }
        Self {
            system: None,
            limits: limits.build(),
        }
    }

    /// The adapter of the bridge call in progress.
    pub fn system(&self) -> Result<S, ProtocolViolation> {
        self.system.clone().ok_or(ProtocolViolation::NoActiveSystem)
    }

    pub(crate) fn install(&mut self, system: S) {
        self.system = Some(system);
    }

    pub(crate) fn clear(&mut self) {
        self.system = None;
    }

    pub fn is_active(&self) -> bool {
        self.system.is_some()
    }
}
