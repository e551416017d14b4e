//! On-disk file headers (inodes)
//!
//! A file is located by a chain of fixed-size header records. Each record
//! holds up to [`NUM_DIRECT`] direct sector pointers and the sector of the
//! next record in the chain, `-1` terminating it. A record encodes to
//! exactly one sector. The in-memory [`FileHeader`] materializes the whole
//! chain as a vector of records, so there is no pointer chasing.
//!
//! Chain invariant: every record except the last is full
//! (`num_sectors == NUM_DIRECT`, byte count at capacity); the tail record
//! carries the exact byte count, so [`FileHeader::file_length`] reports the
//! precise file size.

use log::debug;
use serde::{Deserialize, Serialize};

use tapas_machine::{NUM_SECTORS, SECTOR_SIZE};

use crate::bitmap::Bitmap;
use crate::fs::synch_disk::SynchDisk;
use crate::fs::{FsError, Result};

/// Direct sector pointers per header record.
pub const NUM_DIRECT: usize = 29;

/// Sentinel for the end of a header chain.
pub const NO_NEXT_HEADER: i32 = -1;

/// Encoded size: num_bytes + num_sectors + direct pointers + next link.
pub const RAW_HEADER_SIZE: usize = 4 + 4 + 4 * NUM_DIRECT + 4;

// A header record must occupy exactly one disk sector.
static_assertions::const_assert_eq!(RAW_HEADER_SIZE, SECTOR_SIZE);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawFileHeader {
    pub num_bytes: u32,
    pub num_sectors: u32,
    pub data_sectors: [u32; NUM_DIRECT],
    pub next_header: i32,
}

impl Default for RawFileHeader {
    fn default() -> Self {
        Self {
            num_bytes: 0,
            num_sectors: 0,
            data_sectors: [0; NUM_DIRECT],
            next_header: NO_NEXT_HEADER,
        }
    }
}

impl RawFileHeader {
    fn capacity(&self) -> usize {
        self.num_sectors as usize * SECTOR_SIZE
    }
}

/// A materialized header chain. `chain[0]` lives at the sector the
/// directory names; `chain[i + 1]` lives at `chain[i].next_header`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    chain: Vec<RawFileHeader>,
}

impl FileHeader {
    pub fn new() -> Self {
        Self { chain: vec![RawFileHeader::default()] }
    }

    /// Build a fresh chain covering `size` bytes, claiming sectors from
    /// `free_map`. Fails without claiming anything if the map cannot cover
    /// the data sectors plus the continuation-header sectors.
    pub fn allocate(size: u32, free_map: &mut Bitmap) -> Result<Self> {
        let mut header = Self::new();
        header.extend(size, free_map)?;
        Ok(header)
    }

    /// Grow the chain by `additional` bytes: first the tail's slack bytes,
    /// then fresh sectors, then continuation records (one extra sector
    /// each). All-or-nothing with respect to `free_map`.
    pub fn extend(&mut self, additional: u32, free_map: &mut Bitmap) -> Result<()> {
        if additional == 0 {
            return Ok(());
        }

        let new_length = self.file_length() as usize + additional as usize;
        let new_sectors = new_length.div_ceil(SECTOR_SIZE);
        let current_sectors: usize =
            self.chain.iter().map(|r| r.num_sectors as usize).sum();
        let new_records = new_sectors.div_ceil(NUM_DIRECT).max(1) - self.chain.len();
        let needed = (new_sectors - current_sectors) + new_records;
        if free_map.count_clear() < needed {
            return Err(FsError::DiskFull);
        }

        let mut remaining = additional as usize;
        let mut idx = self.chain.len() - 1;
        loop {
            let record = &mut self.chain[idx];

            // Unused bytes in already-allocated sectors.
            let slack = record.capacity() - record.num_bytes as usize;
            let take = remaining.min(slack);
            record.num_bytes += take as u32;
            remaining -= take;

            // Fresh sectors in this record.
            while remaining > 0 && (record.num_sectors as usize) < NUM_DIRECT {
                let sector = free_map.find().ok_or(FsError::DiskFull)?;
                record.data_sectors[record.num_sectors as usize] = sector as u32;
                record.num_sectors += 1;
                let take = remaining.min(SECTOR_SIZE);
                record.num_bytes += take as u32;
                remaining -= take;
            }

            if remaining == 0 {
                return Ok(());
            }

            // Chain a continuation record.
            let next = free_map.find().ok_or(FsError::DiskFull)?;
            self.chain[idx].next_header = next as i32;
            self.chain.push(RawFileHeader::default());
            idx += 1;
        }
    }

    /// Release every data sector and every continuation-header sector.
    pub fn deallocate(&self, free_map: &mut Bitmap) {
        for record in &self.chain {
            for i in 0..record.num_sectors as usize {
                free_map.clear(record.data_sectors[i] as usize);
            }
            if record.next_header != NO_NEXT_HEADER {
                free_map.clear(record.next_header as usize);
            }
        }
    }

    /// Read the chain rooted at `sector` back from disk. A link outside
    /// the media or a chain that never terminates (an unformatted or
    /// damaged disk) is reported as corrupt.
    pub fn fetch_from(disk: &SynchDisk, sector: u32) -> Result<Self> {
        let mut chain = Vec::new();
        let mut next = sector as i32;
        let mut buf = [0u8; SECTOR_SIZE];
        while next != NO_NEXT_HEADER {
            if next < 0 || next as usize >= NUM_SECTORS || chain.len() >= NUM_SECTORS {
                return Err(FsError::CorruptHeader { sector });
            }
            disk.read_sector(next as u32, &mut buf);
            let record: RawFileHeader = bincode::deserialize(&buf)
                .map_err(|_| FsError::CorruptHeader { sector: next as u32 })?;
            next = record.next_header;
            chain.push(record);
        }
        debug!(target: "fs", "fetched header chain of {} record(s) from sector {sector}", chain.len());
        Ok(Self { chain })
    }

    /// Write the chain to disk, rooted at `sector`.
    pub fn write_back(&self, disk: &SynchDisk, sector: u32) -> Result<()> {
        let mut at = sector;
        for record in &self.chain {
            let bytes = bincode::serialize(record)
                .map_err(|_| FsError::CorruptHeader { sector: at })?;
            disk.write_sector(at, &bytes);
            if record.next_header != NO_NEXT_HEADER {
                at = record.next_header as u32;
            }
        }
        Ok(())
    }

    /// The disk sector holding the byte at `offset`.
    pub fn byte_to_sector(&self, offset: u32) -> Option<u32> {
        let index = offset as usize / SECTOR_SIZE;
        let record = self.chain.get(index / NUM_DIRECT)?;
        let slot = index % NUM_DIRECT;
        if slot < record.num_sectors as usize {
            Some(record.data_sectors[slot])
        } else {
            None
        }
    }

    /// Precise file length: the byte counts summed along the chain.
    pub fn file_length(&self) -> u32 {
        self.chain.iter().map(|r| r.num_bytes).sum()
    }

    /// Log the chain layout on the `fs` channel.
    pub fn print(&self, title: &str) {
        for (i, record) in self.chain.iter().enumerate() {
            debug!(target: "fs",
                "{title} header {i}: {} bytes over sectors {:?}, next {}",
                record.num_bytes,
                &record.data_sectors[..record.num_sectors as usize],
                record.next_header);
        }
    }

    pub fn num_records(&self) -> usize {
        self.chain.len()
    }

    pub fn num_sectors(&self) -> usize {
        self.chain.iter().map(|r| r.num_sectors as usize).sum()
    }
}

impl Default for FileHeader {
    fn default() -> Self {
        Self::new()
    }
}
