//! Executable images
//!
//! The fixed executable format: a little-endian header naming the code and
//! initialized-data blocks inside the file plus the size of the
//! uninitialized segment. [`Executable`] keeps the backing file open so the
//! pager can demand-load blocks long after construction.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::fs::{FileSystem, FsError, OpenFile};
use std::sync::Arc;

pub const NOFF_MAGIC: u32 = 0x00BA_DFAD;

/// Encoded header size: magic + two segments + uninit size.
pub const NOFF_HEADER_SIZE: usize = 4 + 2 * 12 + 4;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Segment {
    pub virtual_addr: u32,
    pub size: u32,
    pub in_file_addr: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct NoffHeader {
    pub magic: u32,
    pub code: Segment,
    pub init_data: Segment,
    pub uninit_data_size: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecError {
    #[error("bad executable magic {found:#x}")]
    BadMagic { found: u32 },

    #[error("truncated executable header")]
    Truncated,

    #[error(transparent)]
    Fs(#[from] FsError),
}

pub struct Executable {
    file: OpenFile,
    header: NoffHeader,
}

impl Executable {
    /// Validate the header of an opened executable file.
    pub fn new(file: OpenFile) -> Result<Self, ExecError> {
        let mut buf = [0u8; NOFF_HEADER_SIZE];
        let n = file.read_at(&mut buf, 0)?;
        if n < NOFF_HEADER_SIZE {
            return Err(ExecError::Truncated);
        }
        let header: NoffHeader =
            bincode::deserialize(&buf).map_err(|_| ExecError::Truncated)?;
        if header.magic != NOFF_MAGIC {
            return Err(ExecError::BadMagic { found: header.magic });
        }
        Ok(Self { file, header })
    }

    /// Total bytes of address space the image needs, stack excluded.
    pub fn size(&self) -> u32 {
        self.header.code.size + self.header.init_data.size + self.header.uninit_data_size
    }

    pub fn code(&self) -> Segment {
        self.header.code
    }

    pub fn init_data(&self) -> Segment {
        self.header.init_data
    }

    /// Read from the code block at a block-relative offset.
    pub fn read_code_block(&self, buf: &mut [u8], offset: u32) -> crate::fs::Result<usize> {
        self.file.read_at(buf, self.header.code.in_file_addr + offset)
    }

    /// Read from the initialized-data block at a block-relative offset.
    pub fn read_data_block(&self, buf: &mut [u8], offset: u32) -> crate::fs::Result<usize> {
        self.file.read_at(buf, self.header.init_data.in_file_addr + offset)
    }
}

/// Assembles executable images, mainly for tests and tooling. Code lands
/// at virtual address 0 with initialized data directly after it.
#[derive(Debug, Default)]
pub struct ExecutableBuilder {
    code: Vec<u8>,
    data: Vec<u8>,
    uninit_size: u32,
}

impl ExecutableBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn code(mut self, bytes: &[u8]) -> Self {
        self.code = bytes.to_vec();
        self
    }

    pub fn data(mut self, bytes: &[u8]) -> Self {
        self.data = bytes.to_vec();
        self
    }

    pub fn uninit(mut self, size: u32) -> Self {
        self.uninit_size = size;
        self
    }

    pub fn image(&self) -> Vec<u8> {
        let header = NoffHeader {
            magic: NOFF_MAGIC,
            code: Segment {
                virtual_addr: 0,
                size: self.code.len() as u32,
                in_file_addr: NOFF_HEADER_SIZE as u32,
            },
            init_data: Segment {
                virtual_addr: self.code.len() as u32,
                size: self.data.len() as u32,
                in_file_addr: (NOFF_HEADER_SIZE + self.code.len()) as u32,
            },
            uninit_data_size: self.uninit_size,
        };
        // Fixed-size header of plain integers; encoding cannot fail.
        let mut image = bincode::serialize(&header).unwrap_or_default();
        image.extend_from_slice(&self.code);
        image.extend_from_slice(&self.data);
        image
    }

    /// Create `name` on the file system and write the image into it.
    pub fn install(&self, fs: &Arc<FileSystem>, name: &str) -> crate::fs::Result<()> {
        let image = self.image();
        fs.create(name, image.len() as u32)?;
        let file = fs.open(name)?;
        file.write_at(&image, 0)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tapas_machine::Machine;

    fn test_fs() -> Arc<FileSystem> {
        FileSystem::format(Arc::new(Machine::new())).unwrap()
    }

    #[test]
    fn test_image_round_trip() {
        let fs = test_fs();
        ExecutableBuilder::new()
            .code(&[1, 2, 3, 4])
            .data(&[9, 9])
            .uninit(64)
            .install(&fs, "prog")
            .unwrap();

        let exe = Executable::new(fs.open("prog").unwrap()).unwrap();
        assert_eq!(exe.size(), 4 + 2 + 64);
        assert_eq!(exe.code().virtual_addr, 0);
        assert_eq!(exe.init_data().virtual_addr, 4);

        let mut buf = [0u8; 4];
        assert_eq!(exe.read_code_block(&mut buf, 0).unwrap(), 4);
        assert_eq!(buf, [1, 2, 3, 4]);
        let mut buf = [0u8; 2];
        assert_eq!(exe.read_data_block(&mut buf, 0).unwrap(), 2);
        assert_eq!(buf, [9, 9]);
    }

    #[test]
    fn test_bad_magic_rejected() {
        let fs = test_fs();
        fs.create("junk", 64).unwrap();
        let file = fs.open("junk").unwrap();
        file.write_at(&[0xFFu8; NOFF_HEADER_SIZE], 0).unwrap();

        let result = Executable::new(fs.open("junk").unwrap());
        assert!(matches!(result, Err(ExecError::BadMagic { .. })));
    }

    #[test]
    fn test_truncated_header_rejected() {
        let fs = test_fs();
        fs.create("tiny", 4).unwrap();
        let result = Executable::new(fs.open("tiny").unwrap());
        assert_eq!(result.err(), Some(ExecError::Truncated));
    }
}
