//! The user-code seam
//!
//! The machine contract deliberately leaves out the MIPS instruction
//! interpreter, so guest executables are paired with host bodies: a
//! [`UserProgram`] registered on the kernel under the executable's name.
//! `Exec` still opens and validates the real executable and builds the
//! real address space from its bytes; only the instruction stream is
//! stood in for.
//!
//! A body sees exactly the user-visible surface: its register file,
//! system calls through the real dispatcher, and guest memory through the
//! real MMU path, so its loads and stores fault and page like
//! instructions would.

use std::sync::Arc;

use tapas_machine::{Registers, ARG1_REG, ARG2_REG, ARG3_REG, ARG4_REG, PAGE_SIZE, SYSCALL_RET_REG};

use crate::context::Kernel;
use crate::process::SpaceId;
use crate::syscall::{dispatch, SyscallOutcome};
use crate::transfer::UserMemory;
use crate::vm::{self, AddressSpace};

/// Control transfers that end a body's run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trap {
    /// The program issued `Exit(status)`.
    Exit(i32),
    /// The program issued `Halt`.
    Halt,
}

/// A host body standing in for a guest executable's code. Returning
/// `Ok(status)` is equivalent to falling off `main`.
pub trait UserProgram: Send + Sync {
    fn run(&self, ctx: &mut UserContext) -> Result<i32, Trap>;
}

impl<F> UserProgram for F
where
    F: Fn(&mut UserContext) -> Result<i32, Trap> + Send + Sync,
{
    fn run(&self, ctx: &mut UserContext) -> Result<i32, Trap> {
        self(ctx)
    }
}

/// Execution context of one running user program.
pub struct UserContext {
    kernel: Arc<Kernel>,
    pid: SpaceId,
    space: Arc<AddressSpace>,
    pub regs: Registers,
}

impl UserContext {
    pub(crate) fn new(
        kernel: Arc<Kernel>,
        pid: SpaceId,
        space: Arc<AddressSpace>,
        regs: Registers,
    ) -> Self {
        Self { kernel, pid, space, regs }
    }

    pub fn kernel(&self) -> &Arc<Kernel> {
        &self.kernel
    }

    pub fn pid(&self) -> SpaceId {
        self.pid
    }

    pub fn space(&self) -> &Arc<AddressSpace> {
        &self.space
    }

    /// Issue one system call through the real dispatcher: id in r2,
    /// arguments in r4..r7, result read back from r2.
    pub fn syscall(&mut self, id: i32, args: [i32; 4]) -> Result<i32, Trap> {
        self.regs.write(SYSCALL_RET_REG, id);
        self.regs.write(ARG1_REG, args[0]);
        self.regs.write(ARG2_REG, args[1]);
        self.regs.write(ARG3_REG, args[2]);
        self.regs.write(ARG4_REG, args[3]);
        let kernel = Arc::clone(&self.kernel);
        match dispatch(&kernel, self) {
            SyscallOutcome::Continue => Ok(self.regs.read(SYSCALL_RET_REG)),
            SyscallOutcome::Exit(status) => Err(Trap::Exit(status)),
            SyscallOutcome::Halt => Err(Trap::Halt),
        }
    }

    /// A user-side store: bytes into this program's guest memory.
    pub fn poke(&self, addr: u32, bytes: &[u8]) -> vm::Result<()> {
        UserMemory::new(&self.kernel, &self.space).write_buffer(bytes, addr)
    }

    /// A user-side store of a NUL-terminated string.
    pub fn poke_cstr(&self, addr: u32, s: &str) -> vm::Result<()> {
        UserMemory::new(&self.kernel, &self.space).write_cstring(s.as_bytes(), addr)
    }

    /// A user-side load: bytes out of this program's guest memory.
    pub fn peek(&self, addr: u32, len: usize) -> vm::Result<Vec<u8>> {
        UserMemory::new(&self.kernel, &self.space).read_buffer(addr, len)
    }

    /// A user-side load of a NUL-terminated string.
    pub fn peek_cstr(&self, addr: u32, max_len: usize) -> vm::Result<Vec<u8>> {
        UserMemory::new(&self.kernel, &self.space)
            .read_cstring(addr, max_len)
            .map(|(bytes, _)| bytes)
    }

    /// A user-side aligned word load.
    pub fn peek_word(&self, addr: u32) -> vm::Result<u32> {
        UserMemory::new(&self.kernel, &self.space).read_word(addr)
    }

    /// One past the highest user address; the stack grows down from here.
    pub fn stack_top(&self) -> u32 {
        (self.space.num_pages() * PAGE_SIZE) as u32
    }
}
