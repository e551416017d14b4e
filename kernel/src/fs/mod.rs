//! Synchronized file system over the raw disk
//!
//! # Purpose
//! Names, allocates and coordinates files: header chains locate data on
//! disk, a flat directory maps names to header sectors, a free map tracks
//! sectors, and a system open-file table layers reader/writer/remover
//! coordination over every open name.
//!
//! # Architecture
//! Facade operations (`create`/`open`/`remove`) are atomic with respect to
//! each other under one state lock. Blocking coordination (writers waiting
//! for readers, removers waiting for users) always happens with the state
//! lock released, so the facade never stalls behind a slow remover.
//!
//! The free map and directory are rewritten in place on every mutation;
//! there is no journal, so a crash mid-update is not survivable.

use std::sync::{Arc, Mutex};

use log::debug;
use thiserror::Error;

use tapas_machine::{Machine, NUM_SECTORS, SECTOR_SIZE};

use crate::bitmap::Bitmap;

pub mod directory;
pub mod header;
pub mod open_entry;
pub mod open_file;
pub mod path;
pub mod synch_disk;

pub use directory::{Directory, DIRECTORY_FILE_SIZE, FILE_NAME_MAX_LEN, NUM_DIR_ENTRIES};
pub use header::{FileHeader, NUM_DIRECT};
pub use open_entry::{OpenFileEntry, OpenFileList, MAX_OPEN_FILES};
pub use open_file::OpenFile;
pub use path::Path;
pub use synch_disk::SynchDisk;

/// Sector of the free-map file header.
pub const FREE_MAP_SECTOR: u32 = 0;

/// Sector of the directory file header.
pub const DIRECTORY_SECTOR: u32 = 1;

/// Encoded size of the free map: one bit per sector.
pub const FREE_MAP_FILE_SIZE: usize = NUM_SECTORS / 8;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FsError {
    #[error("file not found: {name}")]
    NotFound { name: String },

    #[error("file already exists: {name}")]
    AlreadyExists { name: String },

    #[error("file name too long: {name}")]
    NameTooLong { name: String },

    #[error("directory is full")]
    DirectoryFull,

    #[error("no free disk sectors")]
    DiskFull,

    #[error("system open-file table is full")]
    OpenTableFull,

    #[error("corrupt file header at sector {sector}")]
    CorruptHeader { sector: u32 },

    #[error("corrupt directory image")]
    CorruptDirectory,
}

pub type Result<T> = core::result::Result<T, FsError>;

struct FsState {
    free_map: Bitmap,
    directory: Directory,
    free_map_header: FileHeader,
    directory_header: FileHeader,
}

pub struct FileSystem {
    disk: SynchDisk,
    state: Mutex<FsState>,
    open_files: OpenFileList,
}

impl FileSystem {
    /// Lay down a fresh file system: free-map and directory headers at
    /// their fixed sectors, both files allocated and persisted.
    pub fn format(machine: Arc<Machine>) -> Result<Arc<Self>> {
        let disk = SynchDisk::new(machine);

        let mut free_map = Bitmap::new(NUM_SECTORS);
        free_map.set(FREE_MAP_SECTOR as usize);
        free_map.set(DIRECTORY_SECTOR as usize);

        let free_map_header = FileHeader::allocate(FREE_MAP_FILE_SIZE as u32, &mut free_map)?;
        let directory_header =
            FileHeader::allocate(DIRECTORY_FILE_SIZE as u32, &mut free_map)?;
        free_map_header.write_back(&disk, FREE_MAP_SECTOR)?;
        directory_header.write_back(&disk, DIRECTORY_SECTOR)?;

        let fs = Arc::new(Self {
            disk,
            state: Mutex::new(FsState {
                free_map,
                directory: Directory::new(),
                free_map_header,
                directory_header,
            }),
            open_files: OpenFileList::new(),
        });
        let mut state = fs.state.lock().unwrap();
        fs.persist(&mut state)?;
        drop(state);
        debug!(target: "fs", "file system formatted: {NUM_SECTORS} sectors of {SECTOR_SIZE} bytes");
        Ok(fs)
    }

    /// Create `name` with `initial_size` bytes allocated. The free map and
    /// directory are restored untouched on any failure.
    pub fn create(&self, name: &str, initial_size: u32) -> Result<()> {
        if name.is_empty() || name.len() > FILE_NAME_MAX_LEN {
            return Err(FsError::NameTooLong { name: name.to_string() });
        }
        let mut state = self.state.lock().unwrap();
        if state.directory.find(name).is_some() {
            return Err(FsError::AlreadyExists { name: name.to_string() });
        }

        let header_sector = state.free_map.find().ok_or(FsError::DiskFull)? as u32;
        let header = match FileHeader::allocate(initial_size, &mut state.free_map) {
            Ok(header) => header,
            Err(e) => {
                state.free_map.clear(header_sector as usize);
                return Err(e);
            }
        };
        if let Err(e) = state.directory.add(name, header_sector) {
            header.deallocate(&mut state.free_map);
            state.free_map.clear(header_sector as usize);
            return Err(e);
        }

        header.write_back(&self.disk, header_sector)?;
        self.persist(&mut state)?;
        debug!(target: "fs", "created `{name}`: {initial_size} bytes at header sector {header_sector}");
        Ok(())
    }

    /// Open `name`, registering it in the system open-file table or
    /// joining the entry already there. A file being removed reads as
    /// absent.
    pub fn open(self: &Arc<Self>, name: &str) -> Result<OpenFile> {
        let state = self.state.lock().unwrap();
        let sector = state
            .directory
            .find(name)
            .ok_or_else(|| FsError::NotFound { name: name.to_string() })?;

        let entry = match self.open_files.find(name) {
            Some(entry) => {
                if !entry.try_open_ref() {
                    return Err(FsError::NotFound { name: name.to_string() });
                }
                entry
            }
            None => {
                let header = FileHeader::fetch_from(&self.disk, sector)?;
                let entry = Arc::new(OpenFileEntry::new(name, sector, header));
                entry.try_open_ref();
                self.open_files.insert(Arc::clone(&entry))?;
                entry
            }
        };
        drop(state);
        debug!(target: "fs", "opened `{name}` ({} user(s))", entry.users());
        Ok(OpenFile::new(Arc::clone(self), entry))
    }

    /// Remove `name`: wait until nobody has it open, then release its
    /// sectors and directory entry. Opens issued while the wait is in
    /// progress already observe the file as absent.
    pub fn remove(self: &Arc<Self>, name: &str) -> Result<()> {
        let state = self.state.lock().unwrap();
        let sector = state
            .directory
            .find(name)
            .ok_or_else(|| FsError::NotFound { name: name.to_string() })?;

        // Claim an entry in the open-file table so concurrent opens see
        // the removing mark even if the file was not open.
        let entry = match self.open_files.find(name) {
            Some(entry) => entry,
            None => {
                let header = FileHeader::fetch_from(&self.disk, sector)?;
                let entry = Arc::new(OpenFileEntry::new(name, sector, header));
                self.open_files.insert(Arc::clone(&entry))?;
                entry
            }
        };
        drop(state);

        entry.begin_remove();

        let mut state = self.state.lock().unwrap();
        if state.directory.find(name) != Some(sector) {
            // Another remover finished while this one waited.
            self.open_files.clear_entry(&entry);
            return Ok(());
        }
        {
            let header = entry.header.lock().unwrap();
            header.deallocate(&mut state.free_map);
        }
        state.free_map.clear(sector as usize);
        state.directory.remove(name);
        self.persist(&mut state)?;
        self.open_files.clear_entry(&entry);
        debug!(target: "fs", "removed `{name}`");
        Ok(())
    }

    /// Names currently in the directory.
    pub fn list(&self) -> Vec<String> {
        self.state.lock().unwrap().directory.list()
    }

    /// Sectors still free, for tests and accounting.
    pub fn free_sectors(&self) -> usize {
        self.state.lock().unwrap().free_map.count_clear()
    }

    pub(crate) fn disk(&self) -> &SynchDisk {
        &self.disk
    }

    /// Grow an open file's header chain and persist it plus the free map.
    pub(crate) fn grow(&self, entry: &OpenFileEntry, additional: u32) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        {
            let mut header = entry.header.lock().unwrap();
            header.extend(additional, &mut state.free_map)?;
            header.write_back(&self.disk, entry.header_sector())?;
        }
        self.persist_free_map(&mut state)
    }

    /// Called by the last handle dropping an entry's user reference.
    pub(crate) fn release_handle(&self, entry: &Arc<OpenFileEntry>) {
        if entry.close_ref() == 0 {
            self.open_files.release_if_idle(entry.name());
        }
    }

    fn persist(&self, state: &mut FsState) -> Result<()> {
        self.persist_directory(state)?;
        self.persist_free_map(state)
    }

    fn persist_directory(&self, state: &mut FsState) -> Result<()> {
        let bytes = state.directory.encode();
        write_file_bytes(&self.disk, &state.directory_header, &bytes)
    }

    fn persist_free_map(&self, state: &mut FsState) -> Result<()> {
        let mut bytes = vec![0u8; FREE_MAP_FILE_SIZE];
        state.free_map.write_to(&mut bytes);
        write_file_bytes(&self.disk, &state.free_map_header, &bytes)
    }
}

/// Overwrite a system file's contents, padding the trailing sector.
fn write_file_bytes(disk: &SynchDisk, header: &FileHeader, bytes: &[u8]) -> Result<()> {
    let mut temp = [0u8; SECTOR_SIZE];
    for (i, chunk) in bytes.chunks(SECTOR_SIZE).enumerate() {
        let sector = header
            .byte_to_sector((i * SECTOR_SIZE) as u32)
            .ok_or(FsError::CorruptDirectory)?;
        temp.fill(0);
        temp[..chunk.len()].copy_from_slice(chunk);
        disk.write_sector(sector, &temp);
    }
    Ok(())
}
