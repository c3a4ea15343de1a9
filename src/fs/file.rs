//! File and directory layer on top of the block cache.
//!
//! A file record lives either inside the super block (the root
//! directory) or in some slot of a directory data block. [`FileRef`]
//! carries that location plus the in-memory-only parent reference; the
//! record bytes themselves are loaded and stored through the cache, so
//! every mutation lands in a mapped page and the dirty set.

use alloc::string::String;

use crate::error::{Error, Result};
use crate::fs::layout::{
    DiskFile, BY2BLK, BY2FILE, FILE2BLK, FTYPE_DIR, FTYPE_REG, MAXNAMELEN, NDIRECT, NINDIRECT,
    SUPER_ROOT_OFF,
};
use crate::fs::Fs;
use crate::Kernel;

/// Where a file record lives on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileLoc {
    /// The root directory record embedded in the super block.
    Root,
    /// Record `slot` of directory data block `block`.
    Slot { block: u32, slot: u32 },
}

/// A located file plus its parent directory. The parent is meaningful
/// only in memory and is never written to disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileRef {
    pub loc: FileLoc,
    pub dir: Option<FileLoc>,
}

impl FileRef {
    pub fn root() -> Self {
        Self {
            loc: FileLoc::Root,
            dir: None,
        }
    }
}

/// Result of a path walk: either the file, or, when only the final
/// component is missing, the directory it would live in.
pub enum Walk {
    Found(FileRef),
    Missing { dir: FileRef, last: String },
}

/// Where the disk-block-number slot for one file block lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockSlot {
    Direct(usize),
    Indirect { block: u32, idx: u32 },
}

impl Fs {
    /// Load a file record through the cache.
    pub fn file_load(&mut self, k: &mut Kernel, loc: FileLoc) -> Result<DiskFile> {
        let (block, off) = self.loc_addr(loc);
        let (va, _) = self.read_block(k, block)?;
        let mut buf = [0u8; BY2FILE];
        k.user_read(self.env, va + off, &mut buf)?;
        Ok(DiskFile::from_bytes(&buf))
    }

    /// Store a file record back and mark its block dirty.
    pub fn file_store(&mut self, k: &mut Kernel, loc: FileLoc, f: &DiskFile) -> Result<()> {
        let (block, off) = self.loc_addr(loc);
        let (va, _) = self.read_block(k, block)?;
        k.user_write(self.env, va + off, &f.to_bytes())?;
        self.set_dirty(block);
        Ok(())
    }

    fn loc_addr(&self, loc: FileLoc) -> (u32, u32) {
        match loc {
            FileLoc::Root => (1, SUPER_ROOT_OFF),
            FileLoc::Slot { block, slot } => (block, slot * BY2FILE as u32),
        }
    }

    /// Find the slot holding the disk block number for the
    /// `filebno`'th block of `f`, allocating the indirect block on the
    /// way when `alloc` is set. File block numbers past `NINDIRECT`
    /// are out of range for any file.
    pub fn file_block_walk(
        &mut self,
        k: &mut Kernel,
        f: FileRef,
        filebno: u32,
        alloc: bool,
    ) -> Result<BlockSlot> {
        if (filebno as usize) < NDIRECT {
            return Ok(BlockSlot::Direct(filebno as usize));
        }
        if (filebno as usize) >= NINDIRECT {
            return Err(Error::Invalid);
        }
        let mut rec = self.file_load(k, f.loc)?;
        if rec.indirect == 0 {
            if !alloc {
                return Err(Error::NotFound);
            }
            let bno = self.alloc_block(k)?;
            rec.indirect = bno;
            self.file_store(k, f.loc, &rec)?;
        }
        self.read_block(k, rec.indirect)?;
        Ok(BlockSlot::Indirect {
            block: rec.indirect,
            idx: filebno,
        })
    }

    fn slot_read(&mut self, k: &mut Kernel, f: FileRef, slot: BlockSlot) -> Result<u32> {
        match slot {
            BlockSlot::Direct(i) => Ok(self.file_load(k, f.loc)?.direct[i]),
            BlockSlot::Indirect { block, idx } => {
                let va = self.diskaddr(block) + idx * 4;
                k.user_read_u32(self.env, va)
            }
        }
    }

    fn slot_write(&mut self, k: &mut Kernel, f: FileRef, slot: BlockSlot, value: u32) -> Result<()> {
        match slot {
            BlockSlot::Direct(i) => {
                let mut rec = self.file_load(k, f.loc)?;
                rec.direct[i] = value;
                self.file_store(k, f.loc, &rec)
            }
            BlockSlot::Indirect { block, idx } => {
                let va = self.diskaddr(block) + idx * 4;
                k.user_write_u32(self.env, va, value)?;
                self.set_dirty(block);
                Ok(())
            }
        }
    }

    /// The disk block number backing the `filebno`'th block of `f`,
    /// allocating one when `alloc` is set.
    pub fn file_map_block(
        &mut self,
        k: &mut Kernel,
        f: FileRef,
        filebno: u32,
        alloc: bool,
    ) -> Result<u32> {
        let slot = self.file_block_walk(k, f, filebno, alloc)?;
        let mut bno = self.slot_read(k, f, slot)?;
        if bno == 0 {
            if !alloc {
                return Err(Error::NotFound);
            }
            bno = self.alloc_block(k)?;
            self.slot_write(k, f, slot, bno)?;
        }
        Ok(bno)
    }

    /// Drop the `filebno`'th block of `f`; silently succeeds when the
    /// block (or the whole indirect block) was never there.
    pub fn file_clear_block(&mut self, k: &mut Kernel, f: FileRef, filebno: u32) -> Result<()> {
        let slot = match self.file_block_walk(k, f, filebno, false) {
            Ok(slot) => slot,
            Err(Error::NotFound) => return Ok(()),
            Err(e) => return Err(e),
        };
        let bno = self.slot_read(k, f, slot)?;
        if bno != 0 {
            self.free_block(k, bno)?;
            self.slot_write(k, f, slot, 0)?;
        }
        Ok(())
    }

    /// Cache address of the `filebno`'th block of `f`, allocating and
    /// loading as needed. Allocation happens even on reads, so files
    /// never have holes.
    pub fn file_get_block(&mut self, k: &mut Kernel, f: FileRef, filebno: u32) -> Result<u32> {
        let bno = self.file_map_block(k, f, filebno, true)?;
        let (va, _) = self.read_block(k, bno)?;
        Ok(va)
    }

    /// Mark the block containing `offset` dirty.
    pub fn file_dirty(&mut self, k: &mut Kernel, f: FileRef, offset: u32) -> Result<()> {
        let filebno = offset / BY2BLK;
        let bno = self.file_map_block(k, f, filebno, true)?;
        self.read_block(k, bno)?;
        self.set_dirty(bno);
        Ok(())
    }

    /// Scan a directory for `name`.
    pub fn dir_lookup(&mut self, k: &mut Kernel, dir: FileRef, name: &str) -> Result<FileRef> {
        let rec = self.file_load(k, dir.loc)?;
        let nblock = rec.nblocks();
        for i in 0..nblock {
            let bno = self.file_map_block(k, dir, i, false)?;
            let (va, _) = self.read_block(k, bno)?;
            for j in 0..FILE2BLK as u32 {
                let mut namebuf = [0u8; MAXNAMELEN];
                k.user_read(self.env, va + j * BY2FILE as u32, &mut namebuf)?;
                let len = namebuf.iter().position(|&c| c == 0).unwrap_or(MAXNAMELEN);
                if &namebuf[..len] == name.as_bytes() {
                    return Ok(FileRef {
                        loc: FileLoc::Slot { block: bno, slot: j },
                        dir: Some(dir.loc),
                    });
                }
            }
        }
        Err(Error::NotFound)
    }

    /// Find a free record slot in `dir`, growing the directory by one
    /// zeroed block when every slot is taken.
    pub fn dir_alloc_file(&mut self, k: &mut Kernel, dir: FileRef) -> Result<FileRef> {
        let rec = self.file_load(k, dir.loc)?;
        let nblock = rec.nblocks();
        for i in 0..nblock {
            let bno = self.file_map_block(k, dir, i, false)?;
            let (va, _) = self.read_block(k, bno)?;
            for j in 0..FILE2BLK as u32 {
                let mut first = [0u8; 1];
                k.user_read(self.env, va + j * BY2FILE as u32, &mut first)?;
                if first[0] == 0 {
                    return Ok(FileRef {
                        loc: FileLoc::Slot { block: bno, slot: j },
                        dir: Some(dir.loc),
                    });
                }
            }
        }
        let mut rec = self.file_load(k, dir.loc)?;
        rec.size += BY2BLK;
        self.file_store(k, dir.loc, &rec)?;
        let bno = self.file_map_block(k, dir, nblock, true)?;
        let (va, _) = self.read_block(k, bno)?;
        // A recycled block may still carry stale cache contents.
        k.user_bzero(self.env, va, BY2BLK)?;
        self.set_dirty(bno);
        Ok(FileRef {
            loc: FileLoc::Slot { block: bno, slot: 0 },
            dir: Some(dir.loc),
        })
    }

    /// Walk a slash-separated path from the root. When only the final
    /// component is missing, the parent directory and that component
    /// come back in `Walk::Missing` so creation can pick up from there.
    pub fn walk_path(&mut self, k: &mut Kernel, path: &str) -> Result<Walk> {
        let mut file = FileRef::root();
        let mut components = path.split('/').filter(|c| !c.is_empty()).peekable();

        while let Some(name) = components.next() {
            if name.len() >= MAXNAMELEN {
                return Err(Error::BadPath);
            }
            let dir = file;
            let rec = self.file_load(k, dir.loc)?;
            if rec.ftype != FTYPE_DIR {
                return Err(Error::NotFound);
            }
            match self.dir_lookup(k, dir, name) {
                Ok(found) => file = found,
                Err(Error::NotFound) if components.peek().is_none() => {
                    return Ok(Walk::Missing {
                        dir,
                        last: String::from(name),
                    });
                }
                Err(e) => return Err(e),
            }
        }
        Ok(Walk::Found(file))
    }

    /// Open an existing file.
    pub fn file_open(&mut self, k: &mut Kernel, path: &str) -> Result<FileRef> {
        match self.walk_path(k, path)? {
            Walk::Found(f) => Ok(f),
            Walk::Missing { .. } => Err(Error::NotFound),
        }
    }

    /// Create a regular file; fails when the path already exists.
    pub fn file_create(&mut self, k: &mut Kernel, path: &str) -> Result<FileRef> {
        let (dir, last) = match self.walk_path(k, path)? {
            Walk::Found(_) => return Err(Error::FileExists),
            Walk::Missing { dir, last } => (dir, last),
        };
        let f = self.dir_alloc_file(k, dir)?;
        let mut rec = self.file_load(k, f.loc)?;
        rec.set_name(&last)?;
        rec.ftype = FTYPE_REG;
        rec.size = 0;
        self.file_store(k, f.loc, &rec)?;
        Ok(f)
    }

    /// Free the blocks past `newsize`. When the file shrinks into the
    /// direct range, the indirect block goes too.
    pub fn file_truncate(&mut self, k: &mut Kernel, f: FileRef, newsize: u32) -> Result<()> {
        let rec = self.file_load(k, f.loc)?;
        let old_nblocks = rec.nblocks();
        let new_nblocks = newsize.div_ceil(BY2BLK);
        for bno in new_nblocks..old_nblocks {
            self.file_clear_block(k, f, bno)?;
        }
        let mut rec = self.file_load(k, f.loc)?;
        if new_nblocks <= NDIRECT as u32 && rec.indirect != 0 {
            self.free_block(k, rec.indirect)?;
            rec.indirect = 0;
        }
        rec.size = newsize;
        self.file_store(k, f.loc, &rec)
    }

    /// Change the file size, truncating on shrink, and push the change
    /// out through the parent directory.
    pub fn file_set_size(&mut self, k: &mut Kernel, f: FileRef, newsize: u32) -> Result<()> {
        let rec = self.file_load(k, f.loc)?;
        if rec.size > newsize {
            self.file_truncate(k, f, newsize)?;
        }
        let mut rec = self.file_load(k, f.loc)?;
        rec.size = newsize;
        self.file_store(k, f.loc, &rec)?;
        if let Some(dir) = f.dir {
            self.file_flush(k, FileRef { loc: dir, dir: None })?;
        }
        Ok(())
    }

    /// Write the file's dirty blocks out to disk.
    pub fn file_flush(&mut self, k: &mut Kernel, f: FileRef) -> Result<()> {
        let rec = self.file_load(k, f.loc)?;
        for bno in 0..rec.nblocks() {
            let diskbno = match self.file_map_block(k, f, bno, false) {
                Ok(diskbno) => diskbno,
                Err(Error::NotFound) => continue,
                Err(e) => return Err(e),
            };
            if self.block_is_dirty(diskbno) {
                self.write_block(k, diskbno)?;
            }
        }
        Ok(())
    }

    /// Flush the file, then the directory holding its record.
    pub fn file_close(&mut self, k: &mut Kernel, f: FileRef) -> Result<()> {
        self.file_flush(k, f)?;
        if let Some(dir) = f.dir {
            self.file_flush(k, FileRef { loc: dir, dir: None })?;
        }
        Ok(())
    }

    /// Remove a file: truncate to zero, clear the name, flush.
    pub fn file_remove(&mut self, k: &mut Kernel, path: &str) -> Result<()> {
        let f = self.file_open(k, path)?;
        self.file_truncate(k, f, 0)?;
        let mut rec = self.file_load(k, f.loc)?;
        rec.name = [0; MAXNAMELEN];
        self.file_store(k, f.loc, &rec)?;
        self.file_flush(k, f)?;
        if let Some(dir) = f.dir {
            self.file_flush(k, FileRef { loc: dir, dir: None })?;
        }
        Ok(())
    }
}
