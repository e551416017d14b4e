//! Boot-time kernel configuration
//!
//! The paging strategy is a runtime choice handed to [`crate::Kernel::boot`],
//! so uniprogramming and demand-paging builds are two configurations of one
//! binary and the tests can exercise both.

/// How address spaces back their pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagingMode {
    /// Whole address space resident at construction; no TLB, no swap.
    /// Construction fails when physical memory cannot hold the program.
    Eager,
    /// Pages load on first fault and spill to a per-process swap file; the
    /// TLB is refilled by the page-fault handler.
    Demand,
}

#[derive(Debug, Clone)]
pub struct KernelConfig {
    pub paging: PagingMode,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self { paging: PagingMode::Demand }
    }
}

impl KernelConfig {
    pub fn eager() -> Self {
        Self { paging: PagingMode::Eager }
    }

    pub fn demand() -> Self {
        Self { paging: PagingMode::Demand }
    }
}
