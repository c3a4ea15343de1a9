//! Block-device interface. The real IDE driver is an external
//! collaborator; the kernel only needs 512-byte sector reads and
//! writes against whatever is attached.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use spin::Mutex;

pub const SECT_SIZE: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum IdeError {
    BadSector,
    BufferTooSmall,
    NoDevice,
}

pub trait BlockDevice: Send {
    fn read_sector(&mut self, secno: u32, buf: &mut [u8]) -> Result<(), IdeError>;
    fn write_sector(&mut self, secno: u32, buf: &[u8]) -> Result<(), IdeError>;
    fn sectors(&self) -> u32;
}

/// Shared handle to a disk: the formatter writes it, the kernel's IDE
/// attachment reads and writes it, tests inspect it afterwards.
pub type DiskRef = Arc<Mutex<dyn BlockDevice>>;

/// An in-memory disk image.
pub struct MemDisk {
    data: Vec<u8>,
}

impl MemDisk {
    pub fn new(sectors: u32) -> Self {
        Self {
            data: vec![0u8; sectors as usize * SECT_SIZE],
        }
    }

    /// A shared handle sized in whole 4 KiB blocks.
    pub fn with_blocks(nblocks: u32) -> DiskRef {
        Arc::new(Mutex::new(MemDisk::new(nblocks * 8)))
    }
}

impl BlockDevice for MemDisk {
    fn read_sector(&mut self, secno: u32, buf: &mut [u8]) -> Result<(), IdeError> {
        if buf.len() < SECT_SIZE {
            return Err(IdeError::BufferTooSmall);
        }
        let off = secno as usize * SECT_SIZE;
        if off + SECT_SIZE > self.data.len() {
            return Err(IdeError::BadSector);
        }
        buf[..SECT_SIZE].copy_from_slice(&self.data[off..off + SECT_SIZE]);
        Ok(())
    }

    fn write_sector(&mut self, secno: u32, buf: &[u8]) -> Result<(), IdeError> {
        if buf.len() < SECT_SIZE {
            return Err(IdeError::BufferTooSmall);
        }
        let off = secno as usize * SECT_SIZE;
        if off + SECT_SIZE > self.data.len() {
            return Err(IdeError::BadSector);
        }
        self.data[off..off + SECT_SIZE].copy_from_slice(&buf[..SECT_SIZE]);
        Ok(())
    }

    fn sectors(&self) -> u32 {
        (self.data.len() / SECT_SIZE) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sector_round_trip() {
        let mut disk = MemDisk::new(4);
        let mut sector = [0u8; SECT_SIZE];
        sector[0] = 0xA5;
        sector[511] = 0x5A;
        disk.write_sector(2, &sector).unwrap();
        let mut back = [0u8; SECT_SIZE];
        disk.read_sector(2, &mut back).unwrap();
        assert_eq!(sector, back);
    }

    #[test]
    fn out_of_range_sector_is_rejected() {
        let mut disk = MemDisk::new(2);
        let mut buf = [0u8; SECT_SIZE];
        assert_eq!(disk.read_sector(2, &mut buf), Err(IdeError::BadSector));
        assert_eq!(disk.write_sector(9, &buf), Err(IdeError::BadSector));
    }

    #[test]
    fn short_buffer_is_rejected() {
        let mut disk = MemDisk::new(1);
        let mut buf = [0u8; 16];
        assert_eq!(disk.read_sector(0, &mut buf), Err(IdeError::BufferTooSmall));
    }
}
