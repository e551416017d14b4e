//! User-memory transfer routines
//!
//! Every byte moves through the MMU, so TLB refills and paging
//! side-effects happen exactly as they would under user instructions. A
//! translation fault in demand mode is handed to the page-fault handler
//! and the access retried once; anything still failing surfaces as a
//! [`VmError`] for the syscall layer to report.
//!
//! Each public operation holds the kernel CPU for its duration, which
//! keeps the shared TLB mapped to this address space from the first byte
//! to the last.

use std::sync::Arc;

use tapas_machine::{MachineError, PAGE_SIZE};

use crate::config::PagingMode;
use crate::context::Kernel;
use crate::vm::{AddressSpace, Result, VmError};

pub struct UserMemory<'a> {
    kernel: &'a Kernel,
    space: &'a Arc<AddressSpace>,
}

impl<'a> UserMemory<'a> {
    pub fn new(kernel: &'a Kernel, space: &'a Arc<AddressSpace>) -> Self {
        Self { kernel, space }
    }

    /// Read exactly `len` bytes from guest memory.
    pub fn read_buffer(&self, addr: u32, len: usize) -> Result<Vec<u8>> {
        if addr == 0 {
            return Err(VmError::InvalidTransfer("null buffer address"));
        }
        if len == 0 {
            return Err(VmError::InvalidTransfer("empty transfer"));
        }
        self.kernel.with_cpu(self.space, || {
            let mut out = Vec::with_capacity(len);
            for i in 0..len {
                out.push(self.read_byte(addr + i as u32)?);
            }
            Ok(out)
        })
    }

    /// Read up to `max_len` bytes or until a NUL. The flag reports whether
    /// the NUL was seen, i.e. whether the string arrived untruncated.
    pub fn read_cstring(&self, addr: u32, max_len: usize) -> Result<(Vec<u8>, bool)> {
        if addr == 0 {
            return Err(VmError::InvalidTransfer("null string address"));
        }
        self.kernel.with_cpu(self.space, || {
            let mut out = Vec::new();
            for i in 0..max_len {
                let b = self.read_byte(addr + i as u32)?;
                if b == 0 {
                    return Ok((out, true));
                }
                out.push(b);
            }
            Ok((out, false))
        })
    }

    /// Write `bytes` into guest memory.
    pub fn write_buffer(&self, bytes: &[u8], addr: u32) -> Result<()> {
        if addr == 0 {
            return Err(VmError::InvalidTransfer("null buffer address"));
        }
        if bytes.is_empty() {
            return Err(VmError::InvalidTransfer("empty transfer"));
        }
        self.kernel.with_cpu(self.space, || {
            for (i, &b) in bytes.iter().enumerate() {
                self.write_byte(addr + i as u32, b)?;
            }
            Ok(())
        })
    }

    /// Write `bytes` plus a terminating NUL.
    pub fn write_cstring(&self, bytes: &[u8], addr: u32) -> Result<()> {
        if addr == 0 {
            return Err(VmError::InvalidTransfer("null string address"));
        }
        self.kernel.with_cpu(self.space, || {
            for (i, &b) in bytes.iter().enumerate() {
                self.write_byte(addr + i as u32, b)?;
            }
            self.write_byte(addr + bytes.len() as u32, 0)
        })
    }

    /// Read one aligned 32-bit word (argv pointers).
    pub fn read_word(&self, addr: u32) -> Result<u32> {
        self.kernel.with_cpu(self.space, || {
            self.retrying(addr, || self.kernel.machine.mmu.read_mem(addr, 4))
        })
    }

    /// Write one aligned 32-bit word.
    pub fn write_word(&self, addr: u32, value: u32) -> Result<()> {
        self.kernel
            .with_cpu(self.space, || {
                self.retrying(addr, || {
                    self.kernel.machine.mmu.write_mem(addr, 4, value).map(|()| 0)
                })
            })
            .map(|_| ())
    }

    fn read_byte(&self, addr: u32) -> Result<u8> {
        self.retrying(addr, || self.kernel.machine.mmu.read_mem(addr, 1))
            .map(|v| v as u8)
    }

    fn write_byte(&self, addr: u32, value: u8) -> Result<()> {
        self.retrying(addr, || {
            self.kernel.machine.mmu.write_mem(addr, 1, value as u32).map(|()| 0)
        })
        .map(|_| ())
    }

    /// Run one MMU access, resolving a single page fault through the
    /// fault handler before giving up.
    fn retrying(
        &self,
        addr: u32,
        access: impl Fn() -> tapas_machine::Result<u32>,
    ) -> Result<u32> {
        match access() {
            Ok(v) => Ok(v),
            Err(MachineError::PageFault { vaddr })
                if self.kernel.config.paging == PagingMode::Demand =>
            {
                self.space
                    .load_page(self.kernel, vaddr as usize / PAGE_SIZE)?;
                access().map_err(|_| VmError::BadAddress { vaddr: addr })
            }
            Err(_) => Err(VmError::BadAddress { vaddr: addr }),
        }
    }
}
