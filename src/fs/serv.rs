//! The file-system server: an ordinary environment that owns the block
//! cache and answers IPC requests.
//!
//! Each request arrives as a page mapped at `REQVA` plus a type code in
//! the IPC scalar. One [`FsServer::serve_step`] is one iteration of the
//! original server loop: take a delivered request, dispatch, reply,
//! unmap the request page, and park in `ipc_recv` again. The scheduler
//! decides when that happens, like any other environment.

use alloc::vec::Vec;

use crate::env::EnvId;
use crate::error::{Error, Result};
use crate::fs::file::FileRef;
use crate::fs::layout::{
    decode_fileid_arg, decode_open, decode_path, DiskFile, BY2BLK, FSREQ_CLOSE, FSREQ_DIRTY,
    FSREQ_MAP, FSREQ_OPEN, FSREQ_REMOVE, FSREQ_SET_SIZE, FSREQ_SYNC, MAXPATHLEN, O_CREAT, O_TRUNC,
};
use crate::fs::Fs;
use crate::mmu::{PteFlags, BY2PG};
use crate::Kernel;

/// Virtual address at which request pages are received.
pub const REQVA: u32 = 0x0fff_f000;
/// Base of the ladder of Filefd pages, one per open-table entry.
pub const FILEVA: u32 = 0x6000_0000;
/// Max number of open files in the whole system at once.
pub const MAXOPEN: usize = 1024;

/// Byte offsets inside a Filefd page.
pub const FILEFD_DEVID: u32 = 0;
pub const FILEFD_OFFSET: u32 = 4;
pub const FILEFD_OMODE: u32 = 8;
pub const FILEFD_FILEID: u32 = 12;
pub const FILEFD_FILE: u32 = 16;

/// Device id of the file device, stamped into every Filefd.
pub const DEVFILE_ID: u32 = 0;

struct Open {
    fileid: u32,
    ff_va: u32,
    file: Option<FileRef>,
    mode: u32,
}

pub struct FsServer {
    pub fs: Fs,
    opentab: Vec<Open>,
    parked: bool,
}

impl FsServer {
    /// Create the server environment, bring the file system up, and
    /// park it in `ipc_recv` waiting for the first request.
    pub fn boot(k: &mut Kernel, diskno: u32) -> Result<FsServer> {
        let env = k.env_alloc(0)?;
        log::info!("[serv] FS is running as {:08x}", env);

        let mut opentab = Vec::with_capacity(MAXOPEN);
        for i in 0..MAXOPEN {
            opentab.push(Open {
                fileid: i as u32,
                ff_va: FILEVA + (i as u32) * BY2PG,
                file: None,
                mode: 0,
            });
        }

        let mut fs = Fs::new(env, diskno);
        fs.fs_init(k)?;
        k.sys_ipc_recv(env, REQVA)?;
        Ok(FsServer {
            fs,
            opentab,
            parked: true,
        })
    }

    pub fn env(&self) -> EnvId {
        self.fs.env
    }

    /// Allocate an open-table entry and its Filefd page. An entry whose
    /// page nobody maps is unused; one mapped only by us is clean and
    /// can be recycled. Either way the fileid moves to a fresh
    /// generation and the page starts zeroed.
    fn open_alloc(&mut self, k: &mut Kernel) -> Result<usize> {
        let env = self.fs.env;
        for i in 0..MAXOPEN {
            let o = &mut self.opentab[i];
            match k.pageref(env, o.ff_va) {
                0 => {
                    k.sys_mem_alloc(
                        env,
                        0,
                        o.ff_va,
                        PteFlags::V | PteFlags::R | PteFlags::LIBRARY,
                    )?;
                }
                1 => {}
                _ => continue,
            }
            o.fileid += MAXOPEN as u32;
            let va = o.ff_va;
            k.user_bzero(env, va, BY2PG)?;
            return Ok(i);
        }
        Err(Error::MaxOpen)
    }

    /// Find the open entry behind a client-supplied fileid. The client
    /// must still hold the Filefd page and the generation must match.
    fn open_lookup(&self, k: &Kernel, fileid: u32) -> Result<usize> {
        let i = (fileid as usize) % MAXOPEN;
        let o = &self.opentab[i];
        if k.pageref(self.fs.env, o.ff_va) < 2 || o.fileid != fileid {
            return Err(Error::Invalid);
        }
        Ok(i)
    }

    /// One pass of the server loop. A no-op while parked with no
    /// delivered request.
    pub fn serve_step(&mut self, k: &mut Kernel) -> Result<()> {
        let env = self.fs.env;
        if !self.parked {
            k.sys_ipc_recv(env, REQVA)?;
            self.parked = true;
            return Ok(());
        }
        if k.env_ref(env).ipc_recving {
            return Ok(());
        }
        self.parked = false;

        let (req, whom, perm) = k.ipc_result(env);
        if !perm.contains(PteFlags::V) {
            log::error!(
                "[serv] invalid request from {:08x}: no argument page",
                whom
            );
            k.sys_ipc_recv(env, REQVA)?;
            self.parked = true;
            return Ok(());
        }

        let mut reqbuf = [0u8; MAXPATHLEN + 4];
        k.user_read(env, REQVA, &mut reqbuf)?;

        match req {
            FSREQ_OPEN => self.serve_open(k, whom, &reqbuf)?,
            FSREQ_MAP => self.serve_map(k, whom, &reqbuf)?,
            FSREQ_SET_SIZE => self.serve_set_size(k, whom, &reqbuf)?,
            FSREQ_CLOSE => self.serve_close(k, whom, &reqbuf)?,
            FSREQ_DIRTY => self.serve_dirty(k, whom, &reqbuf)?,
            FSREQ_REMOVE => self.serve_remove(k, whom, &reqbuf)?,
            FSREQ_SYNC => self.serve_sync(k, whom)?,
            _ => log::error!("[serv] invalid request code {} from {:08x}", req, whom),
        }

        k.sys_mem_unmap(env, 0, REQVA)?;
        k.sys_ipc_recv(env, REQVA)?;
        self.parked = true;
        Ok(())
    }

    /// Reply to a client. A receiver that went away is logged and
    /// dropped; a bad client must not take the server down.
    fn reply(&mut self, k: &mut Kernel, whom: EnvId, value: i32, srcva: u32, perm: PteFlags) -> Result<()> {
        match k.sys_ipc_can_send(self.fs.env, whom, value as u32, srcva, perm) {
            Ok(()) => Ok(()),
            Err(Error::IpcNotRecv) | Err(Error::BadEnv) => {
                log::error!("[serv] dropping reply to {:08x}", whom);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn reply_err(&mut self, k: &mut Kernel, whom: EnvId, e: Error) -> Result<()> {
        self.reply(k, whom, -e.code(), 0, PteFlags::empty())
    }

    fn serve_open(&mut self, k: &mut Kernel, whom: EnvId, req: &[u8]) -> Result<()> {
        let (path, omode) = decode_open(req);
        log::info!("[serv] serve_open {:08x} {} {:#x}", whom, path, omode);

        let i = match self.open_alloc(k) {
            Ok(i) => i,
            Err(e) => {
                log::error!("[serv] open_alloc failed: {}", e);
                return self.reply_err(k, whom, e);
            }
        };

        let file = if omode & O_CREAT != 0 {
            match self.fs.file_create(k, &path) {
                Ok(f) => Ok(f),
                Err(Error::FileExists) => self.fs.file_open(k, &path),
                Err(e) => Err(e),
            }
        } else {
            self.fs.file_open(k, &path)
        };
        let file = match file {
            Ok(f) => f,
            Err(e) => {
                log::error!("[serv] file_open failed: {}", e);
                return self.reply_err(k, whom, e);
            }
        };
        if omode & O_TRUNC != 0 {
            if let Err(e) = self.fs.file_set_size(k, file, 0) {
                return self.reply_err(k, whom, e);
            }
        }

        // Fill out the Filefd page shared with the client.
        let (fileid, ff_va) = {
            let o = &mut self.opentab[i];
            o.file = Some(file);
            o.mode = omode;
            (o.fileid, o.ff_va)
        };
        let env = self.fs.env;
        let rec: DiskFile = self.fs.file_load(k, file.loc)?;
        k.user_write_u32(env, ff_va + FILEFD_DEVID, DEVFILE_ID)?;
        k.user_write_u32(env, ff_va + FILEFD_OMODE, omode)?;
        k.user_write_u32(env, ff_va + FILEFD_FILEID, fileid)?;
        k.user_write(env, ff_va + FILEFD_FILE, &rec.to_bytes())?;

        self.reply(
            k,
            whom,
            0,
            ff_va,
            PteFlags::V | PteFlags::R | PteFlags::LIBRARY,
        )
    }

    fn serve_map(&mut self, k: &mut Kernel, whom: EnvId, req: &[u8]) -> Result<()> {
        let (fileid, offset) = decode_fileid_arg(req);
        let i = match self.open_lookup(k, fileid) {
            Ok(i) => i,
            Err(e) => return self.reply_err(k, whom, e),
        };
        let file = self.opentab[i].file.expect("open entry without file");
        let filebno = offset / BY2BLK;
        match self.fs.file_get_block(k, file, filebno) {
            Ok(va) => self.reply(
                k,
                whom,
                0,
                va,
                PteFlags::V | PteFlags::R | PteFlags::LIBRARY,
            ),
            Err(e) => self.reply_err(k, whom, e),
        }
    }

    fn serve_set_size(&mut self, k: &mut Kernel, whom: EnvId, req: &[u8]) -> Result<()> {
        let (fileid, size) = decode_fileid_arg(req);
        let i = match self.open_lookup(k, fileid) {
            Ok(i) => i,
            Err(e) => return self.reply_err(k, whom, e),
        };
        let file = self.opentab[i].file.expect("open entry without file");
        match self.fs.file_set_size(k, file, size) {
            Ok(()) => self.reply(k, whom, 0, 0, PteFlags::empty()),
            Err(e) => self.reply_err(k, whom, e),
        }
    }

    fn serve_close(&mut self, k: &mut Kernel, whom: EnvId, req: &[u8]) -> Result<()> {
        let (fileid, _) = decode_fileid_arg(req);
        let i = match self.open_lookup(k, fileid) {
            Ok(i) => i,
            Err(e) => return self.reply_err(k, whom, e),
        };
        let file = self.opentab[i].file.expect("open entry without file");
        match self.fs.file_close(k, file) {
            Ok(()) => self.reply(k, whom, 0, 0, PteFlags::empty()),
            Err(e) => self.reply_err(k, whom, e),
        }
    }

    fn serve_dirty(&mut self, k: &mut Kernel, whom: EnvId, req: &[u8]) -> Result<()> {
        let (fileid, offset) = decode_fileid_arg(req);
        let i = match self.open_lookup(k, fileid) {
            Ok(i) => i,
            Err(e) => return self.reply_err(k, whom, e),
        };
        let file = self.opentab[i].file.expect("open entry without file");
        match self.fs.file_dirty(k, file, offset) {
            Ok(()) => self.reply(k, whom, 0, 0, PteFlags::empty()),
            Err(e) => self.reply_err(k, whom, e),
        }
    }

    fn serve_remove(&mut self, k: &mut Kernel, whom: EnvId, req: &[u8]) -> Result<()> {
        let path = decode_path(req);
        log::info!("[serv] serve_remove {:08x} {}", whom, path);
        match self.fs.file_remove(k, &path) {
            Ok(()) => self.reply(k, whom, 0, 0, PteFlags::empty()),
            Err(e) => self.reply_err(k, whom, e),
        }
    }

    fn serve_sync(&mut self, k: &mut Kernel, whom: EnvId) -> Result<()> {
        match self.fs.fs_sync(k) {
            Ok(()) => self.reply(k, whom, 0, 0, PteFlags::empty()),
            Err(e) => self.reply_err(k, whom, e),
        }
    }
}
