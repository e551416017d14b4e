//! Raw sector disk
//!
//! Synchronous sector reads and writes against in-memory media. The device
//! contract treats I/O as reliable; a request outside the media is fatal.

use std::sync::{Arc, Mutex};

use log::trace;

use crate::{Statistics, NUM_SECTORS, SECTOR_SIZE};

pub struct Disk {
    sectors: Mutex<Vec<[u8; SECTOR_SIZE]>>,
    stats: Arc<Statistics>,
}

impl Disk {
    pub fn new(stats: Arc<Statistics>) -> Self {
        Self {
            sectors: Mutex::new(vec![[0u8; SECTOR_SIZE]; NUM_SECTORS]),
            stats,
        }
    }

    pub fn read_sector(&self, sector: usize, buf: &mut [u8]) {
        assert!(sector < NUM_SECTORS, "disk read outside media: sector {sector}");
        assert_eq!(buf.len(), SECTOR_SIZE);
        trace!(target: "machine", "disk read sector {sector}");
        buf.copy_from_slice(&self.sectors.lock().unwrap()[sector]);
        self.stats.add_disk_read();
    }

    pub fn write_sector(&self, sector: usize, buf: &[u8]) {
        assert!(sector < NUM_SECTORS, "disk write outside media: sector {sector}");
        assert_eq!(buf.len(), SECTOR_SIZE);
        trace!(target: "machine", "disk write sector {sector}");
        self.sectors.lock().unwrap()[sector].copy_from_slice(buf);
        self.stats.add_disk_write();
    }
}
