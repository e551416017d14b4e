//! Global kernel context
//!
//! One [`Kernel`] record replaces free-standing globals: created by
//! [`Kernel::boot`] in a fixed order and passed by reference to every
//! component. Teardown runs in reverse as the record drops.
//!
//! The record also models the single logical CPU: user-memory paths run
//! under [`Kernel::with_cpu`], which lazily switches the MMU between
//! address spaces (saving the outgoing space's pages to swap, flushing
//! the TLB) so the shared translation hardware only ever maps the active
//! space.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock, Weak};

use log::debug;

use tapas_machine::Machine;

use crate::config::KernelConfig;
use crate::console::SynchConsole;
use crate::fs::{FileSystem, FsError};
use crate::process::{ProcessTable, SpaceId};
use crate::usercode::UserProgram;
use crate::vm::{AddressSpace, FrameMap};

struct Cpu {
    active: Option<(SpaceId, Weak<AddressSpace>)>,
}

pub struct Kernel {
    pub config: KernelConfig,
    pub machine: Arc<Machine>,
    pub console: SynchConsole,
    pub file_system: Arc<FileSystem>,
    pub frames: FrameMap,
    pub processes: ProcessTable,
    programs: RwLock<HashMap<String, Arc<dyn UserProgram>>>,
    cpu: Mutex<Cpu>,
}

impl Kernel {
    /// Bring up the shared singletons in dependency order: machine devices
    /// first, then the synchronized console, then a freshly formatted file
    /// system, frame map and process table.
    pub fn boot(config: KernelConfig) -> Result<Arc<Self>, FsError> {
        let machine = Arc::new(Machine::new());
        let console = SynchConsole::new(Arc::clone(&machine));
        let file_system = FileSystem::format(Arc::clone(&machine))?;
        debug!(target: "machine", "kernel booted with {:?} paging", config.paging);
        Ok(Arc::new(Self {
            config,
            machine,
            console,
            file_system,
            frames: FrameMap::new(),
            processes: ProcessTable::new(),
            programs: RwLock::new(HashMap::new()),
            cpu: Mutex::new(Cpu { active: None }),
        }))
    }

    /// Register the host body standing in for a guest executable's code.
    pub fn register_program(&self, name: &str, program: Arc<dyn UserProgram>) {
        self.programs
            .write()
            .unwrap()
            .insert(name.to_string(), program);
    }

    pub(crate) fn program(&self, name: &str) -> Option<Arc<dyn UserProgram>> {
        self.programs.read().unwrap().get(name).cloned()
    }

    /// Run `f` holding the logical CPU with `space` active. Switching
    /// spaces saves the outgoing one (its pages go to swap, the TLB is
    /// flushed) and restores the incoming one.
    pub fn with_cpu<R>(
        &self,
        space: &Arc<AddressSpace>,
        f: impl FnOnce() -> crate::vm::Result<R>,
    ) -> crate::vm::Result<R> {
        let mut cpu = self.cpu.lock().unwrap();
        let current = matches!(&cpu.active, Some((pid, _)) if *pid == space.pid());
        if !current {
            if let Some((pid, weak)) = cpu.active.take() {
                debug!(target: "vm", "switching CPU from space {pid} to {}", space.pid());
                if let Some(prev) = weak.upgrade() {
                    if let Err(e) = prev.save_state(self) {
                        self.machine.mmu.invalidate_tlb();
                        return Err(e);
                    }
                } else {
                    self.machine.mmu.invalidate_tlb();
                    self.machine.mmu.clear_page_table();
                }
            }
            space.restore_state(self);
            cpu.active = Some((space.pid(), Arc::downgrade(space)));
        }
        f()
    }

    /// Make `space` the active one without doing any work under the CPU.
    pub fn activate(&self, space: &Arc<AddressSpace>) -> crate::vm::Result<()> {
        self.with_cpu(space, || Ok(()))
    }

    /// Forget a space at teardown, flushing whatever it had in the MMU.
    pub(crate) fn retire_space(&self, pid: SpaceId) {
        let mut cpu = self.cpu.lock().unwrap();
        if matches!(&cpu.active, Some((p, _)) if *p == pid) {
            cpu.active = None;
            self.machine.mmu.invalidate_tlb();
            self.machine.mmu.clear_page_table();
        }
    }

    /// Trip the interrupt latch for a clean machine shutdown.
    pub fn halt(&self) {
        self.machine.interrupt.halt();
    }

    pub fn is_halted(&self) -> bool {
        self.machine.interrupt.is_halted()
    }
}
