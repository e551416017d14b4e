//! tapas kernel - multiprogramming for guest user processes on a simulated machine
//!
//! # Purpose
//! Glues the simulated devices of `tapas-machine` into a multiprogramming
//! system: per-process address spaces with demand paging and swap, a
//! synchronized file system over the raw disk, the system-call layer, and
//! the process table tying it all to joinable kernel threads.
//!
//! # Integration Points
//! - Depends on: `tapas-machine` (MMU/TLB, disk, console, counters)
//! - Provides to: hosted user programs through the [`usercode`] seam and to
//!   the integration tests
//!
//! # Architecture
//! One [`Kernel`] record is created by [`Kernel::boot`] and passed by
//! reference to every component; there are no free-standing globals. Kernel
//! threads are host threads; a single logical CPU is modeled by a mutex the
//! user-memory paths hold while they touch the MMU, so the shared TLB only
//! ever maps the active address space.
//!
//! # Testing Strategy
//! - Unit tests: per-module `#[cfg(test)]` blocks
//! - Integration tests: end-to-end workflows under `tests/`
//! - Benchmarks: the paging hot path under `benches/`

pub mod bitmap;
pub mod config;
pub mod console;
pub mod context;
pub mod fs;
pub mod loader;
pub mod process;
pub mod sync;
pub mod syscall;
pub mod transfer;
pub mod usercode;
pub mod vm;

pub use config::{KernelConfig, PagingMode};
pub use context::Kernel;
pub use process::SpaceId;
