//! Open file handles
//!
//! A handle pairs the shared per-name entry with a private seek cursor.
//! All data moves sector-at-a-time through the synchronized disk, with
//! read-modify-write at partial sector boundaries. Writing past the end
//! grows the header chain. Every read and write is bracketed by the
//! entry's reader/writer coordination.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tapas_machine::SECTOR_SIZE;

use crate::fs::open_entry::OpenFileEntry;
use crate::fs::{FileSystem, FsError, Result};

struct ReadBracket<'a>(&'a OpenFileEntry);

impl Drop for ReadBracket<'_> {
    fn drop(&mut self) {
        self.0.stop_reading();
    }
}

pub struct OpenFile {
    fs: Arc<FileSystem>,
    entry: Arc<OpenFileEntry>,
    seek: Mutex<u32>,
    released: AtomicBool,
}

impl OpenFile {
    pub(crate) fn new(fs: Arc<FileSystem>, entry: Arc<OpenFileEntry>) -> Self {
        Self {
            fs,
            entry,
            seek: Mutex::new(0),
            released: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> String {
        self.entry.name().to_string()
    }

    pub fn length(&self) -> u32 {
        self.entry.header.lock().unwrap().file_length()
    }

    /// Readers currently inside this file, across all handles.
    pub fn readers(&self) -> u32 {
        self.entry.readers()
    }

    /// Processes holding this file open.
    pub fn users(&self) -> u32 {
        self.entry.users()
    }

    /// Read at an absolute offset, clamping at end of file. Returns the
    /// number of bytes actually read.
    pub fn read_at(&self, buf: &mut [u8], offset: u32) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.entry.start_reading();
        let _bracket = ReadBracket(&self.entry);

        let header = self.entry.header.lock().unwrap();
        let length = header.file_length();
        if offset >= length {
            return Ok(0);
        }
        let offset = offset as usize;
        let num = buf.len().min(length as usize - offset);

        let first = offset / SECTOR_SIZE;
        let last = (offset + num - 1) / SECTOR_SIZE;
        let mut temp = [0u8; SECTOR_SIZE];
        for s in first..=last {
            let sector = header
                .byte_to_sector((s * SECTOR_SIZE) as u32)
                .ok_or(FsError::CorruptHeader { sector: self.entry.header_sector() })?;
            self.fs.disk().read_sector(sector, &mut temp);
            let lo = (s * SECTOR_SIZE).max(offset);
            let hi = ((s + 1) * SECTOR_SIZE).min(offset + num);
            buf[lo - offset..hi - offset]
                .copy_from_slice(&temp[lo - s * SECTOR_SIZE..hi - s * SECTOR_SIZE]);
        }
        Ok(num)
    }

    /// Write at an absolute offset, growing the file when the write runs
    /// past the current end. Returns the number of bytes written.
    pub fn write_at(&self, buf: &[u8], offset: u32) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let _writer = self.entry.start_writing();

        let offset = offset as usize;
        let end = offset + buf.len();
        let length = self.entry.header.lock().unwrap().file_length() as usize;
        if end > length {
            self.fs.grow(&self.entry, (end - length) as u32)?;
        }

        let header = self.entry.header.lock().unwrap();
        let first = offset / SECTOR_SIZE;
        let last = (end - 1) / SECTOR_SIZE;
        let mut temp = [0u8; SECTOR_SIZE];
        for s in first..=last {
            let sector = header
                .byte_to_sector((s * SECTOR_SIZE) as u32)
                .ok_or(FsError::CorruptHeader { sector: self.entry.header_sector() })?;
            let lo = (s * SECTOR_SIZE).max(offset);
            let hi = ((s + 1) * SECTOR_SIZE).min(end);
            if hi - lo == SECTOR_SIZE {
                self.fs.disk().write_sector(sector, &buf[lo - offset..hi - offset]);
            } else {
                self.fs.disk().read_sector(sector, &mut temp);
                temp[lo - s * SECTOR_SIZE..hi - s * SECTOR_SIZE]
                    .copy_from_slice(&buf[lo - offset..hi - offset]);
                self.fs.disk().write_sector(sector, &temp);
            }
        }
        Ok(buf.len())
    }

    /// Sequential read from the seek cursor.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let mut seek = self.seek.lock().unwrap();
        let num = self.read_at(buf, *seek)?;
        *seek += num as u32;
        Ok(num)
    }

    /// Sequential write at the seek cursor.
    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        let mut seek = self.seek.lock().unwrap();
        let num = self.write_at(buf, *seek)?;
        *seek += num as u32;
        Ok(num)
    }

    pub fn seek(&self, position: u32) {
        *self.seek.lock().unwrap() = position;
    }

    /// Explicit close; dropping the handle is equivalent.
    pub fn close(self) {}
}

impl Drop for OpenFile {
    fn drop(&mut self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.fs.release_handle(&self.entry);
        }
    }
}
