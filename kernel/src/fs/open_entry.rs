//! Per-file open coordination
//!
//! One shared entry exists per open file name: it carries the materialized
//! header chain plus the counters coordinating many readers, one writer,
//! and safe removal. Writers hold the reader-count lock for the duration
//! of the write; removal marks the entry and waits out every user.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use crate::fs::header::FileHeader;
use crate::fs::{FsError, Result};

/// System-wide open file table capacity.
pub const MAX_OPEN_FILES: usize = 64;

struct ReadState {
    readers: u32,
}

struct UseState {
    users: u32,
    removing: bool,
}

pub struct OpenFileEntry {
    name: String,
    header_sector: u32,
    pub(crate) header: Mutex<FileHeader>,
    read_state: Mutex<ReadState>,
    can_write: Condvar,
    use_state: Mutex<UseState>,
    can_remove: Condvar,
}

/// Held for the duration of a write; readers are shut out by the lock and
/// the writer waited for them to drain before it was handed the guard.
pub struct WriteGuard<'a> {
    entry: &'a OpenFileEntry,
    guard: Option<MutexGuard<'a, ReadState>>,
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.entry.can_write.notify_all();
    }
}

impl OpenFileEntry {
    pub fn new(name: &str, header_sector: u32, header: FileHeader) -> Self {
        Self {
            name: name.to_string(),
            header_sector,
            header: Mutex::new(header),
            read_state: Mutex::new(ReadState { readers: 0 }),
            can_write: Condvar::new(),
            use_state: Mutex::new(UseState { users: 0, removing: false }),
            can_remove: Condvar::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn header_sector(&self) -> u32 {
        self.header_sector
    }

    pub fn start_reading(&self) {
        self.read_state.lock().unwrap().readers += 1;
    }

    pub fn stop_reading(&self) {
        let mut state = self.read_state.lock().unwrap();
        state.readers -= 1;
        if state.readers == 0 {
            self.can_write.notify_all();
        }
    }

    /// Wait until no readers are active, then return holding the write
    /// guard; readers block on the lock until the guard drops.
    pub fn start_writing(&self) -> WriteGuard<'_> {
        let mut state = self.read_state.lock().unwrap();
        while state.readers != 0 {
            state = self.can_write.wait(state).unwrap();
        }
        WriteGuard { entry: self, guard: Some(state) }
    }

    /// Register one more user, unless the file is being removed.
    pub fn try_open_ref(&self) -> bool {
        let mut state = self.use_state.lock().unwrap();
        if state.removing {
            return false;
        }
        state.users += 1;
        true
    }

    /// Drop one user; the last one out wakes pending removers. Returns the
    /// remaining user count.
    pub fn close_ref(&self) -> u32 {
        let mut state = self.use_state.lock().unwrap();
        state.users -= 1;
        if state.users == 0 {
            self.can_remove.notify_all();
        }
        state.users
    }

    /// Mark the entry as being removed (new opens fail from here on) and
    /// wait until every user has closed.
    pub fn begin_remove(&self) {
        let mut state = self.use_state.lock().unwrap();
        state.removing = true;
        while state.users != 0 {
            state = self.can_remove.wait(state).unwrap();
        }
    }

    pub fn users(&self) -> u32 {
        self.use_state.lock().unwrap().users
    }

    pub fn readers(&self) -> u32 {
        self.read_state.lock().unwrap().readers
    }

    pub fn is_removing(&self) -> bool {
        self.use_state.lock().unwrap().removing
    }
}

/// The system open-file table: at most one entry per name.
pub struct OpenFileList {
    slots: Mutex<Vec<Option<Arc<OpenFileEntry>>>>,
}

impl OpenFileList {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new((0..MAX_OPEN_FILES).map(|_| None).collect()),
        }
    }

    pub fn find(&self, name: &str) -> Option<Arc<OpenFileEntry>> {
        self.slots
            .lock()
            .unwrap()
            .iter()
            .flatten()
            .find(|e| e.name() == name)
            .cloned()
    }

    pub fn insert(&self, entry: Arc<OpenFileEntry>) -> Result<()> {
        let mut slots = self.slots.lock().unwrap();
        let slot = slots
            .iter_mut()
            .find(|s| s.is_none())
            .ok_or(FsError::OpenTableFull)?;
        *slot = Some(entry);
        Ok(())
    }

    /// Free the slot for `name` if nobody uses it and no remover claims it.
    pub fn release_if_idle(&self, name: &str) {
        let mut slots = self.slots.lock().unwrap();
        for slot in slots.iter_mut() {
            let idle = matches!(slot, Some(e)
                if e.name() == name && e.users() == 0 && !e.is_removing());
            if idle {
                *slot = None;
            }
        }
    }

    /// Unconditionally drop the slot holding exactly `entry`; the
    /// remover's final step. Matching by identity keeps a recreated file's
    /// fresh entry safe.
    pub fn clear_entry(&self, entry: &Arc<OpenFileEntry>) {
        let mut slots = self.slots.lock().unwrap();
        for slot in slots.iter_mut() {
            if matches!(slot, Some(e) if Arc::ptr_eq(e, entry)) {
                *slot = None;
            }
        }
    }
}

impl Default for OpenFileList {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::thread;
    use std::time::Duration;

    fn entry() -> Arc<OpenFileEntry> {
        Arc::new(OpenFileEntry::new("t", 2, FileHeader::new()))
    }

    #[test]
    fn test_writer_waits_for_readers() {
        let e = entry();
        e.start_reading();
        e.start_reading();

        let writing = Arc::new(AtomicBool::new(false));
        let writer = {
            let e = Arc::clone(&e);
            let writing = Arc::clone(&writing);
            thread::spawn(move || {
                let _guard = e.start_writing();
                writing.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(20));
        assert!(!writing.load(Ordering::SeqCst));

        e.stop_reading();
        thread::sleep(Duration::from_millis(20));
        assert!(!writing.load(Ordering::SeqCst));

        e.stop_reading();
        writer.join().unwrap();
        assert!(writing.load(Ordering::SeqCst));
    }

    #[test]
    fn test_readers_blocked_while_writer_active() {
        let e = entry();
        let guard = e.start_writing();

        let peak = Arc::new(AtomicU32::new(0));
        let reader = {
            let e = Arc::clone(&e);
            let peak = Arc::clone(&peak);
            thread::spawn(move || {
                e.start_reading();
                peak.store(e.readers(), Ordering::SeqCst);
                e.stop_reading();
            })
        };

        thread::sleep(Duration::from_millis(20));
        assert_eq!(peak.load(Ordering::SeqCst), 0);
        drop(guard);
        reader.join().unwrap();
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_remove_waits_for_users() {
        let e = entry();
        assert!(e.try_open_ref());

        let removed = Arc::new(AtomicBool::new(false));
        let remover = {
            let e = Arc::clone(&e);
            let removed = Arc::clone(&removed);
            thread::spawn(move || {
                e.begin_remove();
                removed.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(20));
        assert!(!removed.load(Ordering::SeqCst));
        // New opens already fail while the remover waits.
        assert!(!e.try_open_ref());

        e.close_ref();
        remover.join().unwrap();
        assert!(removed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_list_one_entry_per_name() {
        let list = OpenFileList::new();
        let e = entry();
        assert!(e.try_open_ref());
        list.insert(Arc::clone(&e)).unwrap();
        assert!(list.find("t").is_some());
        assert!(list.find("u").is_none());

        // Busy entries survive release_if_idle.
        list.release_if_idle("t");
        assert!(list.find("t").is_some());

        e.close_ref();
        list.release_if_idle("t");
        assert!(list.find("t").is_none());
    }
}
