//! Cooperative cancellation shared by every loop and blocking transport call

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::{Result, TransportError};

/// Process-wide stop flag, cloned into each thread that needs to observe it
#[derive(Debug, Clone, Default)]
pub struct ShutdownToken {
    stopped: Arc<AtomicBool>,
}

impl ShutdownToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request shutdown; idempotent
    pub fn trigger(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// `Err(Shutdown)` once triggered, for use with `?` inside polling loops
    pub fn check(&self) -> Result<()> {
        if self.is_triggered() {
            Err(TransportError::Shutdown)
        } else {
            Ok(())
        }
    }
}
