//! Exec argument marshalling
//!
//! `save_args` copies a NUL-terminated argv pointer array out of the
//! calling process's memory into kernel buffers; `write_args` lays the
//! strings and a fresh pointer array onto the new process's stack before
//! its registers are initialized. Both enforce the argv caps.

use tapas_machine::{Registers, STACK_REG};

use crate::transfer::UserMemory;
use crate::vm::{Result, VmError};

/// Most arguments one `Exec` may pass.
pub const MAX_ARG_COUNT: usize = 32;

/// Longest single argument, terminator included.
pub const MAX_ARG_LENGTH: usize = 128;

/// Cap on the total argv bytes copied per `Exec`.
pub const MAX_ARG_TOTAL: usize = 1024;

/// Stack bytes left below the argv array for the callee's register saves.
const REGISTER_SAVE_AREA: u32 = 24;

/// Copy the argv array at `argv_addr` out of the caller's memory. A null
/// `argv_addr` means no arguments.
pub fn save_args(um: &UserMemory<'_>, argv_addr: u32) -> Result<Vec<Vec<u8>>> {
    if argv_addr == 0 {
        return Ok(Vec::new());
    }
    let mut args = Vec::new();
    let mut total = 0usize;
    loop {
        if args.len() == MAX_ARG_COUNT {
            return Err(VmError::InvalidTransfer("too many exec arguments"));
        }
        let ptr = um.read_word(argv_addr + 4 * args.len() as u32)?;
        if ptr == 0 {
            return Ok(args);
        }
        let (bytes, terminated) = um.read_cstring(ptr, MAX_ARG_LENGTH)?;
        if !terminated {
            return Err(VmError::InvalidTransfer("exec argument not terminated"));
        }
        total += bytes.len() + 1;
        if total > MAX_ARG_TOTAL {
            return Err(VmError::InvalidTransfer("exec arguments too large"));
        }
        args.push(bytes);
    }
}

/// Write `args` into the new process's stack: the strings first, then the
/// 4-aligned pointer array with its NUL terminator. Returns `(argc, argv)`
/// and leaves the stack register below the register-save area.
pub fn write_args(
    um: &UserMemory<'_>,
    regs: &mut Registers,
    args: &[Vec<u8>],
) -> Result<(u32, u32)> {
    let mut sp = regs.read(STACK_REG) as u32;

    let mut addrs = Vec::with_capacity(args.len());
    for arg in args {
        sp -= arg.len() as u32 + 1;
        um.write_cstring(arg, sp)?;
        addrs.push(sp);
    }

    sp &= !3;
    sp -= 4 * (args.len() as u32 + 1);
    for (i, addr) in addrs.iter().enumerate() {
        um.write_word(sp + 4 * i as u32, *addr)?;
    }
    um.write_word(sp + 4 * args.len() as u32, 0)?;

    regs.write(STACK_REG, (sp - REGISTER_SAVE_AREA) as i32);
    Ok((args.len() as u32, sp))
}
