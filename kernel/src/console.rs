//! Synchronized console
//!
//! Serializes access to the single character console. Reads and writes
//! hold separate locks, so one reader and one writer can progress
//! concurrently; the semaphores are released from the device interrupt
//! callbacks.

use std::sync::{Arc, Mutex};

use tapas_machine::Machine;

use crate::sync::Semaphore;

pub struct SynchConsole {
    machine: Arc<Machine>,
    read_lock: Mutex<()>,
    write_lock: Mutex<()>,
    read_avail: Arc<Semaphore>,
    write_done: Arc<Semaphore>,
}

impl SynchConsole {
    pub fn new(machine: Arc<Machine>) -> Self {
        let read_avail = Arc::new(Semaphore::new(0));
        let write_done = Arc::new(Semaphore::new(0));
        {
            let ra = Arc::clone(&read_avail);
            let wd = Arc::clone(&write_done);
            machine
                .console
                .set_handlers(Box::new(move || ra.release()), Box::new(move || wd.release()));
        }
        Self {
            machine,
            read_lock: Mutex::new(()),
            write_lock: Mutex::new(()),
            read_avail,
            write_done,
        }
    }

    /// Block until an input character arrives, then take it.
    pub fn get_char(&self) -> u8 {
        let _guard = self.read_lock.lock().unwrap();
        loop {
            self.read_avail.acquire();
            if let Some(c) = self.machine.console.get_char() {
                return c;
            }
        }
    }

    /// Emit one character, blocking until the device signals completion.
    pub fn put_char(&self, c: u8) {
        let _guard = self.write_lock.lock().unwrap();
        self.machine.console.put_char(c);
        self.write_done.acquire();
    }
}
