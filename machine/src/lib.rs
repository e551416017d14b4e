//! Simulated machine devices for the tapas kernel
//!
//! # Purpose
//! Emulates the hardware the kernel runs on: main memory behind an MMU with
//! a software-managed TLB, a raw sector disk, a character console, the
//! interrupt halt latch and the performance counters. The devices behave the
//! same on every host, so the kernel and its tests never need real hardware.
//!
//! # Integration Points
//! - Depends on: nothing outside the workspace
//! - Provides to: the kernel crate (`tapas-kernel`) and its tests
//!
//! # Architecture
//! One [`Machine`] value aggregates the devices. Every device takes `&self`
//! and synchronizes internally, so kernel threads share a `Machine` through a
//! plain `Arc`. The MIPS instruction interpreter is deliberately absent:
//! user code is driven through the kernel's user-program seam, while loads
//! and stores still travel through [`Mmu::read_mem`]/[`Mmu::write_mem`] so
//! translation faults surface exactly where an interpreter would raise them.

use std::sync::Arc;

use thiserror::Error;

mod console;
mod disk;
mod interrupt;
mod mmu;
mod registers;
mod stats;

pub use console::Console;
pub use disk::Disk;
pub use interrupt::Interrupt;
pub use mmu::{Access, Mmu, TlbEntry, TlbFlags};
pub use registers::Registers;
pub use stats::Statistics;

/// Bytes per virtual/physical page.
pub const PAGE_SIZE: usize = 128;

/// Bytes per disk sector.
pub const SECTOR_SIZE: usize = 128;

// Pages and sectors trade places constantly (swap traffic, demand loads);
// the kernel assumes they are the same size.
static_assertions::const_assert_eq!(PAGE_SIZE, SECTOR_SIZE);

/// Number of physical page frames in main memory.
pub const NUM_PHYS_PAGES: usize = 32;

/// Total bytes of emulated main memory.
pub const MEMORY_SIZE: usize = NUM_PHYS_PAGES * PAGE_SIZE;

/// Number of entries in the hardware TLB.
pub const TLB_SIZE: usize = 4;

/// Number of sectors on the raw disk.
pub const NUM_SECTORS: usize = 1024;

/// Total bytes on the raw disk.
pub const DISK_SIZE: usize = NUM_SECTORS * SECTOR_SIZE;

/// MIPS register file size: 32 general purpose plus the special registers.
pub const NUM_TOTAL_REGS: usize = 40;

/// Syscall id goes in, result comes out.
pub const SYSCALL_RET_REG: usize = 2;
/// First syscall argument register; arguments occupy r4..r7.
pub const ARG1_REG: usize = 4;
pub const ARG2_REG: usize = 5;
pub const ARG3_REG: usize = 6;
pub const ARG4_REG: usize = 7;
/// Stack pointer.
pub const STACK_REG: usize = 29;
/// Program counter triple, kept three-deep for the branch delay slot.
pub const PC_REG: usize = 34;
pub const NEXT_PC_REG: usize = 35;
pub const PREV_PC_REG: usize = 36;
/// Faulting virtual address of the last translation failure.
pub const BAD_VADDR_REG: usize = 39;

/// Translation and device faults raised by the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MachineError {
    #[error("page fault at virtual address {vaddr:#x}")]
    PageFault { vaddr: u32 },

    #[error("write to read-only page at virtual address {vaddr:#x}")]
    ReadOnly { vaddr: u32 },

    #[error("invalid virtual address {vaddr:#x}")]
    AddressError { vaddr: u32 },
}

pub type Result<T> = core::result::Result<T, MachineError>;

/// The assembled machine: every device the kernel talks to.
pub struct Machine {
    pub mmu: Mmu,
    pub disk: Disk,
    pub console: Console,
    pub interrupt: Interrupt,
    pub stats: Arc<Statistics>,
}

impl Machine {
    pub fn new() -> Self {
        let stats = Arc::new(Statistics::new());
        Self {
            mmu: Mmu::new(),
            disk: Disk::new(Arc::clone(&stats)),
            console: Console::new(Arc::clone(&stats)),
            interrupt: Interrupt::new(),
            stats,
        }
    }
}

impl Default for Machine {
    fn default() -> Self {
        Self::new()
    }
}
