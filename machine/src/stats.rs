//! Performance counters
//!
//! Cheap global counters the kernel bumps on interesting events; a process
//! exit may log them.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Statistics {
    disk_reads: AtomicU64,
    disk_writes: AtomicU64,
    console_chars_read: AtomicU64,
    console_chars_written: AtomicU64,
    page_faults: AtomicU64,
    syscalls: AtomicU64,
}

impl Statistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_disk_read(&self) {
        self.disk_reads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_disk_write(&self) {
        self.disk_writes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_console_read(&self) {
        self.console_chars_read.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_console_write(&self) {
        self.console_chars_written.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_page_fault(&self) {
        self.page_faults.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_syscall(&self) {
        self.syscalls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn page_faults(&self) -> u64 {
        self.page_faults.load(Ordering::Relaxed)
    }

    pub fn disk_reads(&self) -> u64 {
        self.disk_reads.load(Ordering::Relaxed)
    }

    pub fn disk_writes(&self) -> u64 {
        self.disk_writes.load(Ordering::Relaxed)
    }
}

impl fmt::Display for Statistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "disk I/O: {} reads, {} writes; console: {} in, {} out; \
             page faults: {}; syscalls: {}",
            self.disk_reads.load(Ordering::Relaxed),
            self.disk_writes.load(Ordering::Relaxed),
            self.console_chars_read.load(Ordering::Relaxed),
            self.console_chars_written.load(Ordering::Relaxed),
            self.page_faults.load(Ordering::Relaxed),
            self.syscalls.load(Ordering::Relaxed),
        )
    }
}
