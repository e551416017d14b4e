//! Memory management unit: main memory, translation, and the software TLB
//!
//! Translation runs in one of two hardware modes. With a linear page table
//! installed (uniprogramming builds) the table is consulted directly and the
//! TLB is bypassed. Without one, every access goes through the TLB and a
//! miss raises [`MachineError::PageFault`] for the kernel to resolve.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use bitflags::bitflags;

use crate::{MachineError, Result, MEMORY_SIZE, NUM_PHYS_PAGES, PAGE_SIZE, TLB_SIZE};

bitflags! {
    /// Hardware flag bits of a translation entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TlbFlags: u8 {
        const VALID     = 1 << 0;
        const READ_ONLY = 1 << 1;
        /// Set by the hardware on any access through the entry.
        const USE       = 1 << 2;
        /// Set by the hardware on any write through the entry.
        const DIRTY     = 1 << 3;
    }
}

/// One virtual-to-physical page mapping, as the hardware sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TlbEntry {
    pub vpn: u32,
    pub ppn: u32,
    pub flags: TlbFlags,
}

impl TlbEntry {
    pub fn is_valid(&self) -> bool {
        self.flags.contains(TlbFlags::VALID)
    }
}

/// Kind of memory access, for read-only enforcement and dirty tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}

pub struct Mmu {
    memory: Mutex<Box<[u8]>>,
    tlb: Mutex<[TlbEntry; TLB_SIZE]>,
    page_table: Mutex<Option<Vec<TlbEntry>>>,
    victim_cursor: AtomicUsize,
}

impl Mmu {
    pub fn new() -> Self {
        Self {
            memory: Mutex::new(vec![0u8; MEMORY_SIZE].into_boxed_slice()),
            tlb: Mutex::new([TlbEntry::default(); TLB_SIZE]),
            page_table: Mutex::new(None),
            victim_cursor: AtomicUsize::new(0),
        }
    }

    /// Translate a virtual address, updating USE/DIRTY on the hit entry.
    fn translate(&self, vaddr: u32, access: Access) -> Result<usize> {
        let vpn = vaddr as usize / PAGE_SIZE;
        let offset = vaddr as usize % PAGE_SIZE;

        let ppn = if let Some(table) = self.page_table.lock().unwrap().as_mut() {
            let entry = table
                .get_mut(vpn)
                .filter(|e| e.is_valid())
                .ok_or(MachineError::AddressError { vaddr })?;
            if access == Access::Write && entry.flags.contains(TlbFlags::READ_ONLY) {
                return Err(MachineError::ReadOnly { vaddr });
            }
            entry.flags.insert(TlbFlags::USE);
            if access == Access::Write {
                entry.flags.insert(TlbFlags::DIRTY);
            }
            entry.ppn as usize
        } else {
            let mut tlb = self.tlb.lock().unwrap();
            let entry = tlb
                .iter_mut()
                .find(|e| e.is_valid() && e.vpn as usize == vpn)
                .ok_or(MachineError::PageFault { vaddr })?;
            if access == Access::Write && entry.flags.contains(TlbFlags::READ_ONLY) {
                return Err(MachineError::ReadOnly { vaddr });
            }
            entry.flags.insert(TlbFlags::USE);
            if access == Access::Write {
                entry.flags.insert(TlbFlags::DIRTY);
            }
            entry.ppn as usize
        };

        if ppn >= NUM_PHYS_PAGES {
            return Err(MachineError::AddressError { vaddr });
        }
        Ok(ppn * PAGE_SIZE + offset)
    }

    /// Read `size` bytes (1, 2 or 4) at a `size`-aligned virtual address.
    pub fn read_mem(&self, vaddr: u32, size: u32) -> Result<u32> {
        debug_assert!(matches!(size, 1 | 2 | 4));
        if vaddr % size != 0 {
            return Err(MachineError::AddressError { vaddr });
        }
        let paddr = self.translate(vaddr, Access::Read)?;
        let memory = self.memory.lock().unwrap();
        let mut value = 0u32;
        for i in (0..size as usize).rev() {
            value = (value << 8) | memory[paddr + i] as u32;
        }
        Ok(value)
    }

    /// Write `size` bytes (1, 2 or 4) at a `size`-aligned virtual address.
    pub fn write_mem(&self, vaddr: u32, size: u32, value: u32) -> Result<()> {
        debug_assert!(matches!(size, 1 | 2 | 4));
        if vaddr % size != 0 {
            return Err(MachineError::AddressError { vaddr });
        }
        let paddr = self.translate(vaddr, Access::Write)?;
        let mut memory = self.memory.lock().unwrap();
        for i in 0..size as usize {
            memory[paddr + i] = (value >> (8 * i)) as u8;
        }
        Ok(())
    }

    /// Copy bytes out of physical memory. Kernel-side path for loaders and
    /// swap traffic; out-of-range access is a machine-contract violation.
    pub fn read_phys(&self, paddr: usize, buf: &mut [u8]) {
        assert!(paddr + buf.len() <= MEMORY_SIZE, "physical read out of range");
        let memory = self.memory.lock().unwrap();
        buf.copy_from_slice(&memory[paddr..paddr + buf.len()]);
    }

    /// Copy bytes into physical memory.
    pub fn write_phys(&self, paddr: usize, buf: &[u8]) {
        assert!(paddr + buf.len() <= MEMORY_SIZE, "physical write out of range");
        let mut memory = self.memory.lock().unwrap();
        memory[paddr..paddr + buf.len()].copy_from_slice(buf);
    }

    /// Zero one physical frame.
    pub fn zero_frame(&self, ppn: usize) {
        self.write_phys(ppn * PAGE_SIZE, &[0u8; PAGE_SIZE]);
    }

    pub fn tlb_entry(&self, slot: usize) -> TlbEntry {
        self.tlb.lock().unwrap()[slot]
    }

    pub fn set_tlb_entry(&self, slot: usize, entry: TlbEntry) {
        self.tlb.lock().unwrap()[slot] = entry;
    }

    /// Invalidate every TLB entry.
    pub fn invalidate_tlb(&self) {
        let mut tlb = self.tlb.lock().unwrap();
        for entry in tlb.iter_mut() {
            entry.flags.remove(TlbFlags::VALID);
        }
    }

    /// The TLB replacement oracle: the slot the kernel should refill next.
    /// Prefers an invalid slot, then rotates round-robin.
    pub fn tlb_victim(&self) -> usize {
        let tlb = self.tlb.lock().unwrap();
        if let Some(slot) = tlb.iter().position(|e| !e.is_valid()) {
            return slot;
        }
        self.victim_cursor.fetch_add(1, Ordering::Relaxed) % TLB_SIZE
    }

    /// Install a linear page table; translation bypasses the TLB until
    /// [`Mmu::clear_page_table`] is called.
    pub fn install_page_table(&self, table: Vec<TlbEntry>) {
        *self.page_table.lock().unwrap() = Some(table);
    }

    pub fn clear_page_table(&self) {
        *self.page_table.lock().unwrap() = None;
    }
}

impl Default for Mmu {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapped_mmu() -> Mmu {
        let mmu = Mmu::new();
        mmu.set_tlb_entry(
            0,
            TlbEntry { vpn: 0, ppn: 3, flags: TlbFlags::VALID },
        );
        mmu
    }

    #[test]
    fn test_tlb_miss_is_page_fault() {
        let mmu = Mmu::new();
        assert_eq!(
            mmu.read_mem(0x10, 1),
            Err(MachineError::PageFault { vaddr: 0x10 })
        );
    }

    #[test]
    fn test_tlb_hit_reads_mapped_frame() {
        let mmu = mapped_mmu();
        mmu.write_phys(3 * PAGE_SIZE + 4, &[0xAB]);
        assert_eq!(mmu.read_mem(4, 1), Ok(0xAB));
    }

    #[test]
    fn test_word_access_little_endian() {
        let mmu = mapped_mmu();
        mmu.write_mem(8, 4, 0x1122_3344).unwrap();
        assert_eq!(mmu.read_mem(8, 4), Ok(0x1122_3344));
        assert_eq!(mmu.read_mem(8, 1), Ok(0x44));
        assert_eq!(mmu.read_mem(11, 1), Ok(0x11));
    }

    #[test]
    fn test_unaligned_access_rejected() {
        let mmu = mapped_mmu();
        assert_eq!(
            mmu.read_mem(2, 4),
            Err(MachineError::AddressError { vaddr: 2 })
        );
    }

    #[test]
    fn test_write_sets_dirty_and_use() {
        let mmu = mapped_mmu();
        mmu.write_mem(0, 1, 7).unwrap();
        let entry = mmu.tlb_entry(0);
        assert!(entry.flags.contains(TlbFlags::USE));
        assert!(entry.flags.contains(TlbFlags::DIRTY));
    }

    #[test]
    fn test_read_only_write_faults() {
        let mmu = Mmu::new();
        mmu.set_tlb_entry(
            0,
            TlbEntry { vpn: 0, ppn: 1, flags: TlbFlags::VALID | TlbFlags::READ_ONLY },
        );
        assert_eq!(mmu.read_mem(0, 1), Ok(0));
        assert_eq!(
            mmu.write_mem(0, 1, 1),
            Err(MachineError::ReadOnly { vaddr: 0 })
        );
    }

    #[test]
    fn test_victim_prefers_invalid_slots() {
        let mmu = mapped_mmu();
        // Slot 0 is valid, the rest are not.
        assert_eq!(mmu.tlb_victim(), 1);
        for slot in 0..TLB_SIZE {
            mmu.set_tlb_entry(
                slot,
                TlbEntry { vpn: slot as u32, ppn: slot as u32, flags: TlbFlags::VALID },
            );
        }
        let first = mmu.tlb_victim();
        let second = mmu.tlb_victim();
        assert_ne!(first, second);
    }

    #[test]
    fn test_installed_page_table_bypasses_tlb() {
        let mmu = Mmu::new();
        mmu.install_page_table(vec![TlbEntry {
            vpn: 0,
            ppn: 5,
            flags: TlbFlags::VALID,
        }]);
        mmu.write_phys(5 * PAGE_SIZE, &[0x7F]);
        assert_eq!(mmu.read_mem(0, 1), Ok(0x7F));
        // Out of table range is an address error, not a page fault.
        assert_eq!(
            mmu.read_mem((PAGE_SIZE * 2) as u32, 1),
            Err(MachineError::AddressError { vaddr: PAGE_SIZE as u32 * 2 })
        );
    }
}
