//! Interrupt controller halt latch
//!
//! The only interrupt-controller state the kernel consults is the clean
//! shutdown latch tripped by the `Halt` system call.

use std::sync::atomic::{AtomicBool, Ordering};

use log::debug;

pub struct Interrupt {
    halted: AtomicBool,
}

impl Interrupt {
    pub fn new() -> Self {
        Self { halted: AtomicBool::new(false) }
    }

    /// Initiate a clean machine shutdown.
    pub fn halt(&self) {
        debug!(target: "machine", "machine halting");
        self.halted.store(true, Ordering::SeqCst);
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }
}

impl Default for Interrupt {
    fn default() -> Self {
        Self::new()
    }
}
