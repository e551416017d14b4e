//! Virtual memory: page tables, the frame map, and address spaces

use std::sync::Mutex;

use bitflags::bitflags;
use thiserror::Error;

use tapas_machine::{NUM_PHYS_PAGES, PAGE_SIZE};

use crate::bitmap::Bitmap;
use crate::fs::FsError;
use crate::loader::ExecError;

pub mod addrspace;
pub mod descriptors;

pub use addrspace::AddressSpace;
pub use descriptors::{DescriptorTable, MAX_PROCESS_FILES};

/// Bytes of user stack appended to every address space.
pub const USER_STACK_SIZE: usize = 1024;

bitflags! {
    /// Kernel-side state of one virtual page.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PageFlags: u8 {
        /// The page has been loaded at least once; its bytes exist in
        /// memory or in swap.
        const VALID      = 1 << 0;
        /// A physical frame currently holds the page.
        const IN_MEMORY  = 1 << 1;
        /// The hardware TLB mirrors the page.
        const IN_TLB     = 1 << 2;
        const DIRTY      = 1 << 3;
        const REFERENCED = 1 << 4;
        const READ_ONLY  = 1 << 5;
    }
}

/// One row of a per-process page table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PageTableEntry {
    pub frame: Option<u32>,
    pub flags: PageFlags,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VmError {
    #[error("not enough free physical frames")]
    OutOfFrames,

    #[error("bad user address {vaddr:#x}")]
    BadAddress { vaddr: u32 },

    #[error("invalid user transfer: {0}")]
    InvalidTransfer(&'static str),

    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error(transparent)]
    Fs(#[from] FsError),
}

pub type Result<T> = core::result::Result<T, VmError>;

/// Process-wide map of free physical frames.
pub struct FrameMap {
    map: Mutex<Bitmap>,
}

impl FrameMap {
    pub fn new() -> Self {
        Self { map: Mutex::new(Bitmap::new(NUM_PHYS_PAGES)) }
    }

    /// Claim a free frame.
    pub fn find(&self) -> Option<u32> {
        self.map.lock().unwrap().find().map(|f| f as u32)
    }

    pub fn release(&self, frame: u32) {
        self.map.lock().unwrap().clear(frame as usize);
    }

    pub fn count_clear(&self) -> usize {
        self.map.lock().unwrap().count_clear()
    }
}

impl Default for FrameMap {
    fn default() -> Self {
        Self::new()
    }
}

/// Linear translation through a page table: frame base plus page offset.
pub fn address_translation(vaddr: u32, table: &[PageTableEntry]) -> Option<usize> {
    let vpn = vaddr as usize / PAGE_SIZE;
    let frame = table.get(vpn)?.frame?;
    Some(frame as usize * PAGE_SIZE + vaddr as usize % PAGE_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_map_exhaustion() {
        let frames = FrameMap::new();
        for _ in 0..NUM_PHYS_PAGES {
            assert!(frames.find().is_some());
        }
        assert_eq!(frames.find(), None);
        frames.release(5);
        assert_eq!(frames.find(), Some(5));
    }

    #[test]
    fn test_address_translation() {
        let mut table = vec![PageTableEntry::default(); 2];
        table[0].frame = Some(7);
        table[1].frame = Some(3);
        assert_eq!(address_translation(4, &table), Some(7 * PAGE_SIZE + 4));
        assert_eq!(
            address_translation(PAGE_SIZE as u32 + 1, &table),
            Some(3 * PAGE_SIZE + 1)
        );
        assert_eq!(address_translation(2 * PAGE_SIZE as u32, &table), None);
    }
}
