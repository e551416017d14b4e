//! Process table and lifecycle
//!
//! A spawned process is a kernel thread plus an address space plus a
//! `SpaceId` slot in the bounded process table. `exec` wires them
//! together; `Exit` stores the status and wakes joiners; a non-joinable
//! process frees its slot immediately on exit, a joinable one when the
//! first `join` returns.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use log::{debug, warn};
use thiserror::Error;

use tapas_machine::{Registers, ARG1_REG, ARG2_REG};

use crate::context::Kernel;
use crate::fs::FsError;
use crate::syscall::args::write_args;
use crate::transfer::UserMemory;
use crate::usercode::{Trap, UserContext};
use crate::vm::{AddressSpace, VmError};

pub type SpaceId = i32;

/// Bound on concurrently tracked processes.
pub const MAX_PROCESSES: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProcessError {
    #[error("process table is full")]
    TableFull,

    #[error("unknown process {id}")]
    UnknownProcess { id: SpaceId },

    #[error("process {id} is not joinable")]
    NotJoinable { id: SpaceId },

    #[error("could not spawn a kernel thread")]
    SpawnFailed,
}

/// Everything that can make `exec` fail.
#[derive(Debug, Error)]
pub enum SpawnError {
    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error(transparent)]
    Fs(#[from] FsError),

    #[error(transparent)]
    Vm(#[from] VmError),
}

struct ExitCell {
    status: Mutex<Option<i32>>,
    exited: Condvar,
}

struct ProcessRecord {
    space: Arc<AddressSpace>,
    exit: Arc<ExitCell>,
    joinable: bool,
    thread: Option<JoinHandle<()>>,
}

enum Slot {
    Empty,
    Reserved,
    Running(ProcessRecord),
}

pub struct ProcessTable {
    slots: Mutex<Vec<Slot>>,
}

impl ProcessTable {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new((0..MAX_PROCESSES).map(|_| Slot::Empty).collect()),
        }
    }

    /// Claim a slot before the address space exists; the id names the
    /// process (and its swap file) from here on.
    pub fn reserve(&self) -> Result<SpaceId, ProcessError> {
        let mut slots = self.slots.lock().unwrap();
        let id = slots
            .iter()
            .position(|s| matches!(s, Slot::Empty))
            .ok_or(ProcessError::TableFull)?;
        slots[id] = Slot::Reserved;
        Ok(id as SpaceId)
    }

    /// Give a reserved slot back (failed spawn).
    pub fn cancel(&self, id: SpaceId) {
        self.slots.lock().unwrap()[id as usize] = Slot::Empty;
    }

    fn install(&self, id: SpaceId, space: Arc<AddressSpace>, joinable: bool) -> Arc<ExitCell> {
        let exit = Arc::new(ExitCell {
            status: Mutex::new(None),
            exited: Condvar::new(),
        });
        self.slots.lock().unwrap()[id as usize] = Slot::Running(ProcessRecord {
            space,
            exit: Arc::clone(&exit),
            joinable,
            thread: None,
        });
        exit
    }

    fn attach_thread(&self, id: SpaceId, handle: JoinHandle<()>) {
        if let Slot::Running(record) = &mut self.slots.lock().unwrap()[id as usize] {
            record.thread = Some(handle);
        }
        // A non-joinable process may already have exited; the handle just
        // drops and the thread runs detached.
    }

    /// Record the exit status and wake joiners. Non-joinable slots recycle
    /// immediately.
    pub fn exit(&self, id: SpaceId, status: i32) {
        let mut slots = self.slots.lock().unwrap();
        if let Slot::Running(record) = &slots[id as usize] {
            *record.exit.status.lock().unwrap() = Some(status);
            record.exit.exited.notify_all();
            debug!(target: "syscall", "process {id} exited with status {status}");
            if !record.joinable {
                slots[id as usize] = Slot::Empty;
            }
        }
    }

    /// Block until the process exits, return its status and release the
    /// slot.
    pub fn join(&self, id: SpaceId) -> Result<i32, ProcessError> {
        if id < 0 {
            return Err(ProcessError::UnknownProcess { id });
        }
        let cell = {
            let slots = self.slots.lock().unwrap();
            match slots
                .get(id as usize)
                .ok_or(ProcessError::UnknownProcess { id })?
            {
                Slot::Running(record) if record.joinable => Arc::clone(&record.exit),
                Slot::Running(_) => return Err(ProcessError::NotJoinable { id }),
                _ => return Err(ProcessError::UnknownProcess { id }),
            }
        };

        let status = {
            let mut status = cell.status.lock().unwrap();
            while status.is_none() {
                status = cell.exited.wait(status).unwrap();
            }
            status.unwrap_or(-1)
        };

        let record = {
            let mut slots = self.slots.lock().unwrap();
            if matches!(&slots[id as usize], Slot::Running(r) if Arc::ptr_eq(&r.exit, &cell)) {
                match std::mem::replace(&mut slots[id as usize], Slot::Empty) {
                    Slot::Running(record) => Some(record),
                    _ => None,
                }
            } else {
                None
            }
        };
        // Reap the kernel thread; the status was published as its last act,
        // so this cannot block for long.
        if let Some(mut record) = record {
            if let Some(handle) = record.thread.take() {
                let _ = handle.join();
            }
        }
        Ok(status)
    }

    /// The address space registered under `id`, if the process is live.
    pub fn space(&self, id: SpaceId) -> Option<Arc<AddressSpace>> {
        if id < 0 {
            return None;
        }
        match self.slots.lock().unwrap().get(id as usize) {
            Some(Slot::Running(record)) => Some(Arc::clone(&record.space)),
            _ => None,
        }
    }
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawn a user process from the executable `name`: open it, build the
/// address space, and fork a kernel thread that sets up argv and runs the
/// user code. Returns the new `SpaceId`.
pub fn exec(
    kernel: &Arc<Kernel>,
    name: &str,
    args: Vec<Vec<u8>>,
    joinable: bool,
) -> Result<SpaceId, SpawnError> {
    let exe_file = kernel.file_system.open(name)?;
    let id = kernel.processes.reserve()?;
    let space = match AddressSpace::new(kernel, exe_file, id) {
        Ok(space) => space,
        Err(e) => {
            kernel.processes.cancel(id);
            return Err(e.into());
        }
    };
    kernel.processes.install(id, Arc::clone(&space), joinable);
    debug!(target: "syscall", "exec `{name}`: process {id}, joinable={joinable}");

    let thread = {
        let kernel = Arc::clone(kernel);
        let space = Arc::clone(&space);
        let name = name.to_string();
        thread::Builder::new()
            .name(format!("user-{name}"))
            .spawn(move || {
                let status = start_process(&kernel, id, &space, &name, &args);
                space.release(&kernel);
                kernel.processes.exit(id, status);
            })
    };
    match thread {
        Ok(handle) => {
            kernel.processes.attach_thread(id, handle);
            Ok(id)
        }
        Err(_) => {
            kernel.processes.cancel(id);
            Err(ProcessError::SpawnFailed.into())
        }
    }
}

/// Body of a freshly forked user thread: initial registers, argv written
/// into the new stack, then the user code itself.
fn start_process(
    kernel: &Arc<Kernel>,
    id: SpaceId,
    space: &Arc<AddressSpace>,
    name: &str,
    args: &[Vec<u8>],
) -> i32 {
    let mut regs = Registers::new();
    space.init_registers(&mut regs);

    let um = UserMemory::new(kernel, space);
    let (argc, argv_addr) = match write_args(&um, &mut regs, args) {
        Ok(v) => v,
        Err(e) => {
            warn!(target: "syscall", "process {id}: writing argv failed: {e}");
            return -1;
        }
    };
    regs.write(ARG1_REG, argc as i32);
    regs.write(ARG2_REG, argv_addr as i32);

    match kernel.program(name) {
        None => {
            debug!(target: "syscall", "process {id}: no body registered for `{name}`, exiting 0");
            0
        }
        Some(program) => {
            let mut ctx = UserContext::new(Arc::clone(kernel), id, Arc::clone(space), regs);
            match program.run(&mut ctx) {
                Ok(status) => status,
                Err(Trap::Exit(status)) => status,
                Err(Trap::Halt) => 0,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_until_full() {
        let table = ProcessTable::new();
        for i in 0..MAX_PROCESSES {
            assert_eq!(table.reserve().unwrap(), i as SpaceId);
        }
        assert_eq!(table.reserve(), Err(ProcessError::TableFull));
        table.cancel(3);
        assert_eq!(table.reserve().unwrap(), 3);
    }

    #[test]
    fn test_join_unknown_id() {
        let table = ProcessTable::new();
        assert_eq!(
            table.join(5),
            Err(ProcessError::UnknownProcess { id: 5 })
        );
        assert_eq!(
            table.join(-1),
            Err(ProcessError::UnknownProcess { id: -1 })
        );
        assert_eq!(
            table.join(MAX_PROCESSES as SpaceId),
            Err(ProcessError::UnknownProcess { id: MAX_PROCESSES as SpaceId })
        );
    }
}
