//! System call dispatcher
//!
//! # Purpose
//! Entry point for traps out of user code. Decodes the call id from r2 and
//! the arguments from r4..r7, marshals buffers and strings across the
//! user/kernel boundary, and writes the result back into r2. Every path
//! advances the PC triple before returning.
//!
//! # Error policy
//! User-visible failures (null required pointers, oversize names, unknown
//! descriptors or ids, exhausted tables) put `-1` in r2; the dispatcher
//! never panics on user input. Only `Exit` and `Halt` end the calling
//! program, reported through [`SyscallOutcome`].

use std::sync::Arc;

use log::{debug, warn};

use tapas_machine::{ARG1_REG, ARG2_REG, ARG3_REG, ARG4_REG, SYSCALL_RET_REG};

use crate::context::Kernel;
use crate::fs::path;
use crate::fs::FILE_NAME_MAX_LEN;
use crate::process;
use crate::transfer::UserMemory;
use crate::usercode::UserContext;
use crate::vm::AddressSpace;

pub mod args;
pub mod numbers;

use args::save_args;
use numbers::*;

/// What the dispatcher tells the thread that trapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallOutcome {
    Continue,
    Exit(i32),
    Halt,
}

pub fn dispatch(kernel: &Arc<Kernel>, ctx: &mut UserContext) -> SyscallOutcome {
    kernel.machine.stats.add_syscall();
    let id = ctx.regs.read(SYSCALL_RET_REG);

    let outcome = match id {
        SYS_HALT => {
            debug!(target: "syscall", "shutdown initiated by user program");
            kernel.halt();
            SyscallOutcome::Halt
        }
        SYS_EXIT => {
            let status = ctx.regs.read(ARG1_REG);
            debug!(target: "syscall", "process {} exiting with status {status}; {}",
                   ctx.pid(), kernel.machine.stats);
            SyscallOutcome::Exit(status)
        }
        SYS_EXEC => {
            sys_exec(kernel, ctx);
            SyscallOutcome::Continue
        }
        SYS_JOIN => {
            sys_join(kernel, ctx);
            SyscallOutcome::Continue
        }
        SYS_CREATE => {
            sys_create(kernel, ctx);
            SyscallOutcome::Continue
        }
        SYS_REMOVE => {
            sys_remove(kernel, ctx);
            SyscallOutcome::Continue
        }
        SYS_OPEN => {
            sys_open(kernel, ctx);
            SyscallOutcome::Continue
        }
        SYS_CLOSE => {
            sys_close(ctx);
            SyscallOutcome::Continue
        }
        SYS_READ => {
            sys_read(kernel, ctx);
            SyscallOutcome::Continue
        }
        SYS_WRITE => {
            sys_write(kernel, ctx);
            SyscallOutcome::Continue
        }
        unknown => {
            warn!(target: "syscall", "unexpected system call id {unknown}");
            reply(ctx, -1);
            SyscallOutcome::Continue
        }
    };

    ctx.regs.advance_pc();
    outcome
}

fn reply(ctx: &mut UserContext, value: i32) {
    ctx.regs.write(SYSCALL_RET_REG, value);
}

/// Read and normalize a file-name argument down to its leaf component.
/// `None` covers every invalid shape: null pointer, unterminated (too
/// long) string, non-UTF-8 bytes, or an empty path.
fn user_path(kernel: &Arc<Kernel>, ctx: &UserContext, addr: i32) -> Option<String> {
    if addr == 0 {
        warn!(target: "syscall", "null file-name address");
        return None;
    }
    let space = Arc::clone(ctx.space());
    let um = UserMemory::new(kernel, &space);
    let (bytes, terminated) = um.read_cstring(addr as u32, FILE_NAME_MAX_LEN + 1).ok()?;
    if !terminated {
        warn!(target: "syscall", "file name longer than {FILE_NAME_MAX_LEN} bytes");
        return None;
    }
    let s = String::from_utf8(bytes).ok()?;
    path::leaf(&s)
}

fn sys_exec(kernel: &Arc<Kernel>, ctx: &mut UserContext) {
    let path_addr = ctx.regs.read(ARG1_REG);
    let argv_addr = ctx.regs.read(ARG2_REG) as u32;
    let joinable = ctx.regs.read(ARG3_REG) != 0;

    let Some(name) = user_path(kernel, ctx, path_addr) else {
        return reply(ctx, -1);
    };
    let space: Arc<AddressSpace> = Arc::clone(ctx.space());
    let um = UserMemory::new(kernel, &space);
    let args = match save_args(&um, argv_addr) {
        Ok(args) => args,
        Err(e) => {
            warn!(target: "syscall", "exec `{name}`: bad argv: {e}");
            return reply(ctx, -1);
        }
    };

    match process::exec(kernel, &name, args, joinable) {
        Ok(id) => reply(ctx, id),
        Err(e) => {
            warn!(target: "syscall", "exec `{name}` failed: {e}");
            reply(ctx, -1);
        }
    }
}

fn sys_join(kernel: &Arc<Kernel>, ctx: &mut UserContext) {
    let id = ctx.regs.read(ARG1_REG);
    debug!(target: "syscall", "process {} joining {id}", ctx.pid());
    match kernel.processes.join(id) {
        Ok(status) => reply(ctx, status),
        Err(e) => {
            warn!(target: "syscall", "join {id} failed: {e}");
            reply(ctx, -1);
        }
    }
}

fn sys_create(kernel: &Arc<Kernel>, ctx: &mut UserContext) {
    let Some(name) = user_path(kernel, ctx, ctx.regs.read(ARG1_REG)) else {
        return reply(ctx, -1);
    };
    match kernel.file_system.create(&name, INIT_FILE_SIZE) {
        Ok(()) => reply(ctx, 0),
        Err(e) => {
            warn!(target: "syscall", "create `{name}` failed: {e}");
            reply(ctx, -1);
        }
    }
}

fn sys_remove(kernel: &Arc<Kernel>, ctx: &mut UserContext) {
    let Some(name) = user_path(kernel, ctx, ctx.regs.read(ARG1_REG)) else {
        return reply(ctx, -1);
    };
    match kernel.file_system.remove(&name) {
        Ok(()) => reply(ctx, 0),
        Err(e) => {
            warn!(target: "syscall", "remove `{name}` failed: {e}");
            reply(ctx, -1);
        }
    }
}

fn sys_open(kernel: &Arc<Kernel>, ctx: &mut UserContext) {
    let Some(name) = user_path(kernel, ctx, ctx.regs.read(ARG1_REG)) else {
        return reply(ctx, -1);
    };
    let file = match kernel.file_system.open(&name) {
        Ok(file) => file,
        Err(e) => {
            debug!(target: "syscall", "open `{name}` failed: {e}");
            return reply(ctx, -1);
        }
    };
    match ctx.space().files.add(file) {
        Some(fd) => {
            debug!(target: "syscall", "`{name}` open as descriptor {fd}");
            reply(ctx, fd);
        }
        None => {
            warn!(target: "syscall", "descriptor table full opening `{name}`");
            reply(ctx, -1);
        }
    }
}

fn sys_close(ctx: &mut UserContext) {
    let fd = ctx.regs.read(ARG1_REG);
    match ctx.space().files.remove(fd) {
        Some(_) => reply(ctx, 0),
        None => {
            warn!(target: "syscall", "close of invalid descriptor {fd}");
            reply(ctx, -1);
        }
    }
}

fn sys_read(kernel: &Arc<Kernel>, ctx: &mut UserContext) {
    let addr = ctx.regs.read(ARG1_REG);
    let size = ctx.regs.read(ARG2_REG);
    let fd = ctx.regs.read(ARG3_REG);
    let offset = ctx.regs.read(ARG4_REG);
    if addr == 0 || size <= 0 {
        return reply(ctx, -1);
    }
    let space = Arc::clone(ctx.space());
    let um = UserMemory::new(kernel, &space);

    if fd == CONSOLE_INPUT {
        // Console reads deliver exactly `size` characters, blocking for
        // each one; the offset is meaningless here.
        let mut buf = Vec::with_capacity(size as usize);
        for _ in 0..size {
            buf.push(kernel.console.get_char());
        }
        match um.write_buffer(&buf, addr as u32) {
            Ok(()) => reply(ctx, size),
            Err(e) => {
                warn!(target: "syscall", "read: bad user buffer: {e}");
                reply(ctx, -1);
            }
        }
        return;
    }

    if offset < 0 {
        return reply(ctx, -1);
    }
    let Some(file) = ctx.space().files.get(fd) else {
        warn!(target: "syscall", "read from invalid descriptor {fd}");
        return reply(ctx, -1);
    };
    let mut buf = vec![0u8; size as usize];
    match file.read_at(&mut buf, offset as u32) {
        Ok(n) => {
            if n > 0 && um.write_buffer(&buf[..n], addr as u32).is_err() {
                return reply(ctx, -1);
            }
            reply(ctx, n as i32);
        }
        Err(e) => {
            warn!(target: "syscall", "read from descriptor {fd} failed: {e}");
            reply(ctx, -1);
        }
    }
}

fn sys_write(kernel: &Arc<Kernel>, ctx: &mut UserContext) {
    let addr = ctx.regs.read(ARG1_REG);
    let size = ctx.regs.read(ARG2_REG);
    let fd = ctx.regs.read(ARG3_REG);
    if addr == 0 || size <= 0 {
        return reply(ctx, -1);
    }
    let space = Arc::clone(ctx.space());
    let um = UserMemory::new(kernel, &space);
    let bytes = match um.read_buffer(addr as u32, size as usize) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(target: "syscall", "write: bad user buffer: {e}");
            return reply(ctx, -1);
        }
    };

    if fd == CONSOLE_OUTPUT {
        // Console writes stop at the first NUL; file writes do not.
        let mut written = 0;
        for &b in &bytes {
            if b == 0 {
                break;
            }
            kernel.console.put_char(b);
            written += 1;
        }
        return reply(ctx, written);
    }

    let Some(file) = ctx.space().files.get(fd) else {
        warn!(target: "syscall", "write to invalid descriptor {fd}");
        return reply(ctx, -1);
    };
    match file.write(&bytes) {
        Ok(n) => reply(ctx, n as i32),
        Err(e) => {
            warn!(target: "syscall", "write to descriptor {fd} failed: {e}");
            reply(ctx, -1);
        }
    }
}
