//! Disk formatter: lay down the super block and the free bitmap.
//!
//! This is the host-side tool the server expects to have run before
//! boot; it writes the disk directly, without a block cache.

use crate::fs::layout::{wu32, DiskFile, BIT2BLK, BY2BLK, FS_MAGIC, FTYPE_DIR, SECT2BLK};
use crate::ide::{DiskRef, IdeError, SECT_SIZE};

#[derive(Debug)]
pub enum MkfsError {
    Io(IdeError),
    DiskTooSmall,
}

impl From<IdeError> for MkfsError {
    fn from(e: IdeError) -> Self {
        MkfsError::Io(e)
    }
}

pub struct MkfsReport {
    pub nblocks: u32,
    pub nbitmap: u32,
    pub free_blocks: u32,
}

struct Writer {
    disk: DiskRef,
}

impl Writer {
    fn write_block(&mut self, block: u32, data: &[u8]) -> Result<(), MkfsError> {
        let mut disk = self.disk.lock();
        let base = block * SECT2BLK;
        for s in 0..SECT2BLK {
            let off = (s as usize) * SECT_SIZE;
            let mut sec = [0u8; SECT_SIZE];
            if off < data.len() {
                let end = (off + SECT_SIZE).min(data.len());
                sec[..end - off].copy_from_slice(&data[off..end]);
            }
            disk.write_sector(base + s, &sec)?;
        }
        Ok(())
    }
}

/// Format `nblocks` worth of file system onto `disk`: boot block left
/// alone, super block in block 1, the bitmap from block 2, everything
/// else free.
pub fn format(disk: &DiskRef, nblocks: u32) -> Result<MkfsReport, MkfsError> {
    let nbitmap = nblocks.div_ceil(BIT2BLK);
    if nblocks < 2 + nbitmap + 1 {
        return Err(MkfsError::DiskTooSmall);
    }
    if disk.lock().sectors() < nblocks * SECT2BLK {
        return Err(MkfsError::DiskTooSmall);
    }
    let mut w = Writer { disk: disk.clone() };

    // Super block with an empty root directory.
    let mut super_blk = [0u8; BY2BLK as usize];
    wu32(&mut super_blk, 0, FS_MAGIC);
    wu32(&mut super_blk, 4, nblocks);
    let mut root = DiskFile::empty();
    root.set_name("/").expect("root name fits");
    root.ftype = FTYPE_DIR;
    super_blk[8..8 + 256].copy_from_slice(&root.to_bytes());
    w.write_block(1, &super_blk)?;

    // Bitmap: bit set means free. Reserved blocks and the tail past
    // nblocks stay in-use.
    let reserved = 2 + nbitmap;
    for i in 0..nbitmap {
        let mut bits = [0u8; BY2BLK as usize];
        for word_idx in 0..(BY2BLK as usize / 4) {
            let mut word = 0u32;
            for bit in 0..32u32 {
                let blockno = i * BIT2BLK + (word_idx as u32) * 32 + bit;
                if blockno >= reserved && blockno < nblocks {
                    word |= 1 << bit;
                }
            }
            wu32(&mut bits, word_idx * 4, word);
        }
        w.write_block(2 + i, &bits)?;
    }

    log::info!(
        "[mkfs] formatted {} blocks, {} bitmap block(s), {} free",
        nblocks,
        nbitmap,
        nblocks - reserved
    );
    Ok(MkfsReport {
        nblocks,
        nbitmap,
        free_blocks: nblocks - reserved,
    })
}
