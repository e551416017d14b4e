//! Synchronized access to the raw disk
//!
//! Sector operations are the only globally ordered events in the file
//! system; this wrapper serializes them behind one lock.

use std::sync::{Arc, Mutex};

use tapas_machine::Machine;

pub struct SynchDisk {
    machine: Arc<Machine>,
    lock: Mutex<()>,
}

impl SynchDisk {
    pub fn new(machine: Arc<Machine>) -> Self {
        Self {
            machine,
            lock: Mutex::new(()),
        }
    }

    pub fn read_sector(&self, sector: u32, buf: &mut [u8]) {
        let _guard = self.lock.lock().unwrap();
        self.machine.disk.read_sector(sector as usize, buf);
    }

    pub fn write_sector(&self, sector: u32, buf: &[u8]) {
        let _guard = self.lock.lock().unwrap();
        self.machine.disk.write_sector(sector as usize, buf);
    }
}
