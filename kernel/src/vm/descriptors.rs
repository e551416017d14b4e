//! Per-process open-file descriptor table
//!
//! Small-integer descriptors, with 0 and 1 reserved for console input and
//! output; those slots never hold a file.

use std::sync::{Arc, Mutex};

use crate::fs::OpenFile;

/// Descriptors per process, the two console slots included.
pub const MAX_PROCESS_FILES: usize = 16;

pub struct DescriptorTable {
    slots: Mutex<Vec<Option<Arc<OpenFile>>>>,
}

impl DescriptorTable {
    pub fn new() -> Self {
        Self { slots: Mutex::new(vec![None; MAX_PROCESS_FILES]) }
    }

    /// Hand out the lowest free descriptor, or `None` when the table is
    /// full.
    pub fn add(&self, file: OpenFile) -> Option<i32> {
        let mut slots = self.slots.lock().unwrap();
        let fd = (2..MAX_PROCESS_FILES).find(|&fd| slots[fd].is_none())?;
        slots[fd] = Some(Arc::new(file));
        Some(fd as i32)
    }

    pub fn get(&self, fd: i32) -> Option<Arc<OpenFile>> {
        if fd < 2 {
            return None;
        }
        self.slots.lock().unwrap().get(fd as usize)?.clone()
    }

    /// Release a descriptor, returning its file (the last handle drop
    /// closes it).
    pub fn remove(&self, fd: i32) -> Option<Arc<OpenFile>> {
        if fd < 2 {
            return None;
        }
        self.slots.lock().unwrap().get_mut(fd as usize)?.take()
    }

    /// Drop every open descriptor; process teardown.
    pub fn clear(&self) {
        let mut slots = self.slots.lock().unwrap();
        for slot in slots.iter_mut() {
            *slot = None;
        }
    }
}

impl Default for DescriptorTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tapas_machine::Machine;

    use crate::fs::FileSystem;

    fn open_file(fs: &Arc<FileSystem>, name: &str) -> OpenFile {
        fs.create(name, 16).unwrap();
        fs.open(name).unwrap()
    }

    #[test]
    fn test_console_slots_reserved() {
        let fs = FileSystem::format(Arc::new(Machine::new())).unwrap();
        let table = DescriptorTable::new();
        let fd = table.add(open_file(&fs, "a")).unwrap();
        assert_eq!(fd, 2);
        assert!(table.get(0).is_none());
        assert!(table.get(1).is_none());
        assert!(table.remove(0).is_none());
    }

    #[test]
    fn test_descriptors_recycle() {
        let fs = FileSystem::format(Arc::new(Machine::new())).unwrap();
        let table = DescriptorTable::new();
        let a = table.add(open_file(&fs, "a")).unwrap();
        let b = table.add(open_file(&fs, "b")).unwrap();
        assert_ne!(a, b);
        table.remove(a);
        let c = table.add(open_file(&fs, "c")).unwrap();
        assert_eq!(c, a);
    }

    #[test]
    fn test_table_capacity() {
        let fs = FileSystem::format(Arc::new(Machine::new())).unwrap();
        let table = DescriptorTable::new();
        for i in 0..MAX_PROCESS_FILES - 2 {
            assert!(table.add(open_file(&fs, &format!("f{i}"))).is_some());
        }
        assert!(table.add(open_file(&fs, "overflow")).is_none());
    }
}
