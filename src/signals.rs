//! SIGINT / SIGTERM handling.
//!
//! Signals only set a flag; the control loop polls it at tick boundaries and
//! while sleeping, so a stop lands within one tick plus one input event.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

/// Shared stop flag.
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    requested: Arc<AtomicBool>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route Ctrl+C and SIGTERM to this flag. Callable once per process.
    pub fn install(&self) -> Result<(), ctrlc::Error> {
        let flag = self.requested.clone();
        ctrlc::set_handler(move || {
            if !flag.swap(true, Ordering::SeqCst) {
                info!("Stop requested, finishing current tick");
            }
        })
    }

    pub fn requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Request a stop without a signal.
    pub fn trigger(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_is_shared_across_clones() {
        let shutdown = Shutdown::new();
        let observer = shutdown.clone();
        assert!(!observer.requested());

        shutdown.trigger();
        assert!(observer.requested());
    }
}
