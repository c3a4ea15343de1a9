//! The block cache: disk block `b` lives at `DISKMAP + b * BY2BLK` in
//! the server's address space, demand-loaded from the IDE disk.
//!
//! The hardware has no dirty bit, so the cache keeps an explicit dirty
//! set: anything that mutates a cached block records the block number,
//! `write_block` clears it.

use crate::error::{Error, Result};
use crate::fork::{vpd_entry, vpt_entry};
use crate::fs::layout::{BIT2BLK, BY2BLK, FS_MAGIC, SECT2BLK};
use crate::fs::Fs;
use crate::mmu::{pdx, vpn, PteFlags};
use crate::Kernel;

/// Bottom of the window the server dedicates to cached disk blocks.
pub const DISKMAP: u32 = 0x1000_0000;
/// Size of that window; the disk must fit inside it.
pub const DISKMAX: u32 = 0x4000_0000;

impl Fs {
    /// Virtual address of a disk block in the cache window.
    pub fn diskaddr(&self, blockno: u32) -> u32 {
        if self.nblocks != 0 && blockno >= self.nblocks {
            panic!("bad block number {:08x} in diskaddr", blockno);
        }
        assert!(blockno < DISKMAX / BY2BLK, "block {:08x} outside cache window", blockno);
        DISKMAP + blockno * BY2BLK
    }

    pub fn va_is_mapped(&self, k: &Kernel, va: u32) -> bool {
        let pde = match vpd_entry(k, self.env, pdx(va)) {
            Ok(pde) => pde,
            Err(_) => return false,
        };
        if pde & PteFlags::V.bits() == 0 {
            return false;
        }
        match vpt_entry(k, self.env, vpn(va)) {
            Ok(pte) => pte & PteFlags::V.bits() != 0,
            Err(_) => false,
        }
    }

    /// The cache address of a block, if it is resident.
    pub fn block_is_mapped(&self, k: &Kernel, blockno: u32) -> Option<u32> {
        let va = self.diskaddr(blockno);
        if self.va_is_mapped(k, va) {
            Some(va)
        } else {
            None
        }
    }

    pub fn block_is_dirty(&self, blockno: u32) -> bool {
        self.dirty.contains(&blockno)
    }

    /// Record that a cached block diverged from its on-disk copy.
    pub fn set_dirty(&mut self, blockno: u32) {
        self.dirty.insert(blockno);
    }

    /// Make sure a page backs the block, without reading the disk.
    pub fn map_block(&mut self, k: &mut Kernel, blockno: u32) -> Result<()> {
        if self.block_is_mapped(k, blockno).is_some() {
            return Ok(());
        }
        let va = self.diskaddr(blockno);
        k.sys_mem_alloc(self.env, 0, va, PteFlags::V | PteFlags::R)
    }

    /// Make sure the block is resident, loading it from disk on a miss.
    /// Returns its cache address and whether it was just loaded.
    pub fn read_block(&mut self, k: &mut Kernel, blockno: u32) -> Result<(u32, bool)> {
        if self.nblocks != 0 && blockno >= self.nblocks {
            panic!("reading non-existent block {:08x}", blockno);
        }
        if self.nbitmap != 0 && self.block_is_free(k, blockno) {
            panic!("reading free block {:08x}", blockno);
        }

        let va = self.diskaddr(blockno);
        if self.va_is_mapped(k, va) {
            return Ok((va, false));
        }
        k.sys_mem_alloc(self.env, 0, va, PteFlags::V | PteFlags::R)?;
        let mut buf = [0u8; BY2BLK as usize];
        k.ide_read(self.diskno, blockno * SECT2BLK, &mut buf, SECT2BLK)?;
        k.user_write(self.env, va, &buf)?;
        Ok((va, true))
    }

    /// Flush a resident block back to disk and mark it clean.
    pub fn write_block(&mut self, k: &mut Kernel, blockno: u32) -> Result<()> {
        let va = match self.block_is_mapped(k, blockno) {
            Some(va) => va,
            None => panic!("write unmapped block {:08x}", blockno),
        };
        let mut buf = [0u8; BY2BLK as usize];
        k.user_read(self.env, va, &mut buf)?;
        k.ide_write(self.diskno, blockno * SECT2BLK, &buf, SECT2BLK)?;
        // Re-map the page shared-writable; on real hardware this would
        // clear a dirty bit, here the dirty set is authoritative.
        k.sys_mem_map(
            self.env,
            0,
            va,
            0,
            va,
            PteFlags::V | PteFlags::R | PteFlags::LIBRARY,
        )?;
        self.dirty.remove(&blockno);
        Ok(())
    }

    /// Evict a block from the cache. The block must be either free or
    /// clean; data would be lost otherwise.
    pub fn unmap_block(&mut self, k: &mut Kernel, blockno: u32) -> Result<()> {
        if self.block_is_mapped(k, blockno).is_none() {
            return Ok(());
        }
        assert!(
            self.block_is_free(k, blockno) || !self.block_is_dirty(blockno),
            "unmapping dirty block {:08x}",
            blockno
        );
        k.sys_mem_unmap(self.env, 0, self.diskaddr(blockno))?;
        debug_assert!(self.block_is_mapped(k, blockno).is_none());
        Ok(())
    }

    /// Bit set in the bitmap means the block is free. Before the super
    /// block and bitmap are loaded, everything counts as in-use.
    pub fn block_is_free(&self, k: &Kernel, blockno: u32) -> bool {
        if self.nblocks == 0 || self.nbitmap == 0 || blockno >= self.nblocks {
            return false;
        }
        let word = match k.user_read_u32(self.env, self.diskaddr(2) + (blockno / 32) * 4) {
            Ok(word) => word,
            Err(_) => return false,
        };
        word & (1 << (blockno % 32)) != 0
    }

    /// Mark a block free. Block 0 is the null block number and can
    /// never be freed.
    pub fn free_block(&mut self, k: &mut Kernel, blockno: u32) -> Result<()> {
        if blockno == 0 {
            panic!("attempt to free zero block");
        }
        let va = self.diskaddr(2) + (blockno / 32) * 4;
        let word = k.user_read_u32(self.env, va)?;
        k.user_write_u32(self.env, va, word | (1 << (blockno % 32)))?;
        self.set_dirty(2 + blockno / BIT2BLK);
        Ok(())
    }

    /// Scan the bitmap for a free block, claim it, and flush the
    /// affected bitmap block so the on-disk state never lags an
    /// allocation.
    pub fn alloc_block_num(&mut self, k: &mut Kernel) -> Result<u32> {
        for blockno in 3..self.nblocks {
            if self.block_is_free(k, blockno) {
                let va = self.diskaddr(2) + (blockno / 32) * 4;
                let word = k.user_read_u32(self.env, va)?;
                k.user_write_u32(self.env, va, word & !(1 << (blockno % 32)))?;
                self.write_block(k, 2 + blockno / BIT2BLK)?;
                return Ok(blockno);
            }
        }
        Err(Error::NoDisk)
    }

    /// Allocate a block and give it a cache page.
    pub fn alloc_block(&mut self, k: &mut Kernel) -> Result<u32> {
        let bno = self.alloc_block_num(k)?;
        if let Err(e) = self.map_block(k, bno) {
            self.free_block(k, bno)?;
            return Err(e);
        }
        Ok(bno)
    }

    /// Read and validate the super block.
    pub fn read_super(&mut self, k: &mut Kernel) -> Result<()> {
        let (va, _) = self.read_block(k, 1)?;
        let magic = k.user_read_u32(self.env, va)?;
        let nblocks = k.user_read_u32(self.env, va + 4)?;
        if magic != FS_MAGIC {
            panic!("bad file system magic number {:x} {:x}", magic, FS_MAGIC);
        }
        if nblocks > DISKMAX / BY2BLK {
            panic!("file system is too large");
        }
        self.nblocks = nblocks;
        Ok(())
    }

    /// Map every bitmap block and check the reserved blocks are marked
    /// in-use.
    pub fn read_bitmap(&mut self, k: &mut Kernel) -> Result<()> {
        let nbitmap = self.nblocks.div_ceil(BIT2BLK);
        for i in 0..nbitmap {
            self.read_block(k, 2 + i)?;
        }
        self.nbitmap = nbitmap;

        assert!(!self.block_is_free(k, 0), "boot block marked free");
        assert!(!self.block_is_free(k, 1), "super block marked free");
        for i in 0..nbitmap {
            assert!(!self.block_is_free(k, 2 + i), "bitmap block {} marked free", i);
        }
        Ok(())
    }

    /// Bring the file system up: super block, then the bitmap.
    pub fn fs_init(&mut self, k: &mut Kernel) -> Result<()> {
        self.read_super(k)?;
        self.read_bitmap(k)
    }

    /// Flush every dirty block.
    pub fn fs_sync(&mut self, k: &mut Kernel) -> Result<()> {
        for blockno in 0..self.nblocks {
            if self.block_is_dirty(blockno) {
                self.write_block(k, blockno)?;
            }
        }
        Ok(())
    }
}
