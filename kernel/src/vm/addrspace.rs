//! Per-process address spaces
//!
//! An address space owns its page table, the executable it was loaded
//! from, a private swap file, and the per-process descriptor table. Two
//! backing strategies exist:
//!
//! * **Eager**: the whole image is copied into physical frames at
//!   construction and a linear page table is handed to the MMU. No swap,
//!   no TLB, no faults.
//! * **Demand**: nothing is resident at construction. The page-fault
//!   handler pulls pages from the executable (first touch) or the swap
//!   file, evicting a victim when physical memory is full, and installs
//!   the mapping in a TLB slot chosen by the hardware oracle.
//!
//! Pages loaded from the executable are written straight to swap, so every
//! later reload comes uniformly from the swap file. A page's swap copy
//! goes stale only while the page is dirty in memory; eviction writes it
//! back and clears the bit.

use std::sync::{Arc, Mutex};

use log::{debug, warn};

use tapas_machine::{Registers, TlbEntry, TlbFlags, NEXT_PC_REG, PAGE_SIZE, PC_REG, STACK_REG, TLB_SIZE};

use crate::config::PagingMode;
use crate::context::Kernel;
use crate::fs::OpenFile;
use crate::loader::Executable;
use crate::process::SpaceId;
use crate::vm::{
    address_translation, DescriptorTable, PageFlags, PageTableEntry, Result, VmError,
    USER_STACK_SIZE,
};

pub struct AddressSpace {
    pid: SpaceId,
    mode: PagingMode,
    num_pages: usize,
    swap_name: Option<String>,
    inner: Mutex<SpaceInner>,
    /// Per-process open-file descriptors (0/1 reserved for the console).
    pub files: DescriptorTable,
}

struct SpaceInner {
    page_table: Vec<PageTableEntry>,
    exe: Executable,
    swap: Option<OpenFile>,
}

impl AddressSpace {
    /// Build the address space for `exe_file`, sized to its image plus the
    /// user stack.
    pub fn new(kernel: &Kernel, exe_file: OpenFile, pid: SpaceId) -> Result<Arc<Self>> {
        let exe = Executable::new(exe_file)?;
        let size = exe.size() as usize + USER_STACK_SIZE;
        let num_pages = size.div_ceil(PAGE_SIZE);
        debug!(target: "vm", "space {pid}: {num_pages} pages ({size} bytes), {:?} paging",
               kernel.config.paging);

        let mut page_table = vec![PageTableEntry::default(); num_pages];
        let mut swap = None;
        let mut swap_name = None;

        match kernel.config.paging {
            PagingMode::Eager => {
                let mut claimed = Vec::with_capacity(num_pages);
                for entry in page_table.iter_mut() {
                    match kernel.frames.find() {
                        Some(frame) => {
                            kernel.machine.mmu.zero_frame(frame as usize);
                            entry.frame = Some(frame);
                            entry.flags = PageFlags::VALID | PageFlags::IN_MEMORY;
                            claimed.push(frame);
                        }
                        None => {
                            for frame in claimed {
                                kernel.frames.release(frame);
                            }
                            return Err(VmError::OutOfFrames);
                        }
                    }
                }
                copy_segment(kernel, &page_table, &exe, SegmentKind::Code)?;
                copy_segment(kernel, &page_table, &exe, SegmentKind::Data)?;
            }
            PagingMode::Demand => {
                let name = format!("swap{pid}.asid");
                debug!(target: "vm", "space {pid}: creating swap file `{name}`");
                kernel
                    .file_system
                    .create(&name, (num_pages * PAGE_SIZE) as u32)?;
                swap = Some(kernel.file_system.open(&name)?);
                swap_name = Some(name);
            }
        }

        Ok(Arc::new(Self {
            pid,
            mode: kernel.config.paging,
            num_pages,
            swap_name,
            inner: Mutex::new(SpaceInner { page_table, exe, swap }),
            files: DescriptorTable::new(),
        }))
    }

    pub fn pid(&self) -> SpaceId {
        self.pid
    }

    pub fn num_pages(&self) -> usize {
        self.num_pages
    }

    /// Initial user register state: execution starts at address zero with
    /// the stack pointer just below the top of the address space.
    pub fn init_registers(&self, regs: &mut Registers) {
        for r in 0..tapas_machine::NUM_TOTAL_REGS {
            regs.write(r, 0);
        }
        regs.write(PC_REG, 0);
        regs.write(NEXT_PC_REG, 4);
        regs.write(STACK_REG, (self.num_pages * PAGE_SIZE - 16) as i32);
        debug!(target: "vm", "space {}: stack register at {}", self.pid,
               self.num_pages * PAGE_SIZE - 16);
    }

    /// The page-fault handler. Picks a TLB slot via the hardware oracle,
    /// finds a frame (free, or evicted from this space's resident pages),
    /// loads the page from the executable or swap, and installs the
    /// mapping.
    pub fn load_page(&self, kernel: &Kernel, vpn: usize) -> Result<()> {
        if self.mode != PagingMode::Demand || vpn >= self.num_pages {
            return Err(VmError::BadAddress { vaddr: (vpn * PAGE_SIZE) as u32 });
        }
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        let mmu = &kernel.machine.mmu;
        kernel.machine.stats.add_page_fault();

        let slot = mmu.tlb_victim();
        let displaced = mmu.tlb_entry(slot);
        if displaced.is_valid() {
            // The displaced mapping belongs to this space (the TLB is
            // flushed on every space switch); retire it into the table.
            fold_hw_flags(&mut inner.page_table, &displaced);
            inner.page_table[displaced.vpn as usize]
                .flags
                .remove(PageFlags::IN_TLB);
        }

        let entry = inner.page_table[vpn];
        let frame = if entry.flags.contains(PageFlags::IN_MEMORY) {
            // Resident but fell out of the TLB; just remap it.
            entry.frame.expect("resident page owns a frame")
        } else {
            let frame = match kernel.frames.find() {
                Some(frame) => frame,
                None => {
                    let victim = choose_victim(&inner.page_table, &displaced)?;
                    debug!(target: "vm", "space {}: evicting page {victim} for page {vpn}",
                           self.pid);
                    evict_page(kernel, inner, victim)?
                }
            };
            if !inner.page_table[vpn].flags.contains(PageFlags::VALID) {
                load_from_exe(kernel, inner, vpn, frame)?;
                // Seed the swap copy so every later reload takes one path.
                write_to_swap(kernel, inner, vpn, frame)?;
            } else {
                load_from_swap(kernel, inner, vpn, frame)?;
            }
            inner.page_table[vpn].frame = Some(frame);
            frame
        };

        let entry = &mut inner.page_table[vpn];
        entry.flags.insert(
            PageFlags::VALID | PageFlags::IN_MEMORY | PageFlags::IN_TLB | PageFlags::REFERENCED,
        );
        let mut flags = TlbFlags::VALID;
        if entry.flags.contains(PageFlags::READ_ONLY) {
            flags |= TlbFlags::READ_ONLY;
        }
        mmu.set_tlb_entry(slot, TlbEntry { vpn: vpn as u32, ppn: frame, flags });
        debug!(target: "vm", "space {}: page {vpn} in frame {frame}, TLB slot {slot}", self.pid);
        Ok(())
    }

    /// Outgoing side of a space switch: push every resident page to swap
    /// and flush the TLB. Nothing to do for an eager space, whose frames
    /// stay put.
    pub fn save_state(&self, kernel: &Kernel) -> Result<()> {
        if self.mode == PagingMode::Eager {
            return Ok(());
        }
        debug!(target: "vm", "space {}: saving state", self.pid);
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        for vpn in 0..self.num_pages {
            if inner.page_table[vpn]
                .flags
                .contains(PageFlags::VALID | PageFlags::IN_MEMORY)
            {
                let frame = evict_page(kernel, inner, vpn)?;
                kernel.frames.release(frame);
            }
        }
        kernel.machine.mmu.invalidate_tlb();
        Ok(())
    }

    /// Incoming side of a space switch. An eager space hands its linear
    /// page table to the MMU; a demand space relies on faults to refill
    /// the already-flushed TLB.
    pub fn restore_state(&self, kernel: &Kernel) {
        debug!(target: "vm", "space {}: restoring state", self.pid);
        match self.mode {
            PagingMode::Demand => {}
            PagingMode::Eager => {
                let inner = self.inner.lock().unwrap();
                let table = inner
                    .page_table
                    .iter()
                    .enumerate()
                    .map(|(vpn, entry)| {
                        let mut flags = TlbFlags::empty();
                        if entry.flags.contains(PageFlags::VALID | PageFlags::IN_MEMORY) {
                            flags |= TlbFlags::VALID;
                        }
                        if entry.flags.contains(PageFlags::READ_ONLY) {
                            flags |= TlbFlags::READ_ONLY;
                        }
                        TlbEntry {
                            vpn: vpn as u32,
                            ppn: entry.frame.unwrap_or(0),
                            flags,
                        }
                    })
                    .collect();
                kernel.machine.mmu.install_page_table(table);
            }
        }
    }

    /// Teardown: give back resident frames, drop and delete the swap file,
    /// and close every descriptor. The executable handle closes when the
    /// space itself drops.
    pub fn release(&self, kernel: &Kernel) {
        debug!(target: "vm", "space {}: releasing", self.pid);
        kernel.retire_space(self.pid);
        {
            let mut guard = self.inner.lock().unwrap();
            let inner = &mut *guard;
            for entry in inner.page_table.iter_mut() {
                if entry.flags.contains(PageFlags::IN_MEMORY) {
                    if let Some(frame) = entry.frame.take() {
                        kernel.frames.release(frame);
                    }
                    entry.flags.remove(PageFlags::IN_MEMORY | PageFlags::IN_TLB);
                }
            }
            // Close the swap handle before asking for its removal.
            inner.swap = None;
        }
        if let Some(name) = &self.swap_name {
            if let Err(e) = kernel.file_system.remove(name) {
                warn!(target: "vm", "space {}: could not remove swap file: {e}", self.pid);
            }
        }
        self.files.clear();
    }

    /// Snapshot of the page table, for tests and diagnostics.
    pub fn page_snapshot(&self) -> Vec<PageTableEntry> {
        self.inner.lock().unwrap().page_table.clone()
    }
}

enum SegmentKind {
    Code,
    Data,
}

/// Copy one executable segment into the (fully resident) address space,
/// page piece by page piece through the linear translation.
fn copy_segment(
    kernel: &Kernel,
    table: &[PageTableEntry],
    exe: &Executable,
    kind: SegmentKind,
) -> Result<()> {
    let segment = match kind {
        SegmentKind::Code => exe.code(),
        SegmentKind::Data => exe.init_data(),
    };
    if segment.size == 0 {
        return Ok(());
    }
    debug!(target: "vm", "copying segment at {:#x}, {} bytes", segment.virtual_addr, segment.size);

    let mut copied = 0usize;
    while copied < segment.size as usize {
        let vaddr = segment.virtual_addr + copied as u32;
        let paddr =
            address_translation(vaddr, table).ok_or(VmError::BadAddress { vaddr })?;
        let chunk = (PAGE_SIZE - vaddr as usize % PAGE_SIZE)
            .min(segment.size as usize - copied);
        let mut buf = vec![0u8; chunk];
        match kind {
            SegmentKind::Code => exe.read_code_block(&mut buf, copied as u32)?,
            SegmentKind::Data => exe.read_data_block(&mut buf, copied as u32)?,
        };
        kernel.machine.mmu.write_phys(paddr, &buf);
        copied += chunk;
    }
    Ok(())
}

/// Fold the hardware USE/DIRTY bits of a retiring TLB entry back into the
/// page table.
fn fold_hw_flags(table: &mut [PageTableEntry], tlb_entry: &TlbEntry) {
    if let Some(entry) = table.get_mut(tlb_entry.vpn as usize) {
        if tlb_entry.flags.contains(TlbFlags::USE) {
            entry.flags.insert(PageFlags::REFERENCED);
        }
        if tlb_entry.flags.contains(TlbFlags::DIRTY) {
            entry.flags.insert(PageFlags::DIRTY);
        }
    }
}

/// Page-replacement policy: reuse the frame of the page just displaced
/// from the TLB when it is resident (approximate second chance), else the
/// first resident page in table order.
fn choose_victim(table: &[PageTableEntry], displaced: &TlbEntry) -> Result<usize> {
    if displaced.is_valid() {
        let vpn = displaced.vpn as usize;
        if table
            .get(vpn)
            .is_some_and(|e| e.flags.contains(PageFlags::IN_MEMORY))
        {
            return Ok(vpn);
        }
    }
    table
        .iter()
        .position(|e| e.flags.contains(PageFlags::VALID | PageFlags::IN_MEMORY))
        .ok_or(VmError::OutOfFrames)
}

/// Evict one resident page: retire any TLB entry naming it, write it to
/// swap when dirty, and hand back its frame.
fn evict_page(kernel: &Kernel, inner: &mut SpaceInner, vpn: usize) -> Result<u32> {
    let mmu = &kernel.machine.mmu;
    for slot in 0..TLB_SIZE {
        let tlb_entry = mmu.tlb_entry(slot);
        if tlb_entry.is_valid() && tlb_entry.vpn as usize == vpn {
            fold_hw_flags(&mut inner.page_table, &tlb_entry);
            mmu.set_tlb_entry(slot, TlbEntry::default());
        }
    }

    let (frame, dirty) = {
        let entry = &mut inner.page_table[vpn];
        let frame = entry.frame.take().expect("evicting a non-resident page");
        let dirty = entry.flags.contains(PageFlags::DIRTY);
        entry
            .flags
            .remove(PageFlags::IN_MEMORY | PageFlags::IN_TLB | PageFlags::DIRTY);
        (frame, dirty)
    };

    if dirty {
        let mut buf = [0u8; PAGE_SIZE];
        mmu.read_phys(frame as usize * PAGE_SIZE, &mut buf);
        swap_file(inner).write_at(&buf, (vpn * PAGE_SIZE) as u32)?;
    }
    Ok(frame)
}

/// First touch of a never-loaded page: executable bytes for code and
/// initialized data, zero fill for the stack and uninitialized data.
fn load_from_exe(kernel: &Kernel, inner: &mut SpaceInner, vpn: usize, frame: u32) -> Result<()> {
    let mut buf = [0u8; PAGE_SIZE];
    let vaddr = (vpn * PAGE_SIZE) as u32;
    let code = inner.exe.code();
    let data = inner.exe.init_data();
    if vaddr < code.size {
        inner.exe.read_code_block(&mut buf, vaddr)?;
    } else if vaddr < code.size + data.size {
        inner.exe.read_data_block(&mut buf, vaddr - data.virtual_addr)?;
    }
    kernel.machine.mmu.write_phys(frame as usize * PAGE_SIZE, &buf);
    Ok(())
}

fn load_from_swap(kernel: &Kernel, inner: &mut SpaceInner, vpn: usize, frame: u32) -> Result<()> {
    let mut buf = [0u8; PAGE_SIZE];
    swap_file(inner).read_at(&mut buf, (vpn * PAGE_SIZE) as u32)?;
    kernel.machine.mmu.write_phys(frame as usize * PAGE_SIZE, &buf);
    Ok(())
}

fn write_to_swap(kernel: &Kernel, inner: &mut SpaceInner, vpn: usize, frame: u32) -> Result<()> {
    let mut buf = [0u8; PAGE_SIZE];
    kernel.machine.mmu.read_phys(frame as usize * PAGE_SIZE, &mut buf);
    swap_file(inner).write_at(&buf, (vpn * PAGE_SIZE) as u32)?;
    Ok(())
}

fn swap_file(inner: &SpaceInner) -> &OpenFile {
    inner.swap.as_ref().expect("demand-paged space has a swap file")
}
