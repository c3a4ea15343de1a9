//! The file device: client-side operations that talk to the FS server
//! over IPC.
//!
//! Opening a file yields a Filefd page shared with the server; reads
//! and writes go through per-block MAP requests that map cache pages
//! straight into the descriptor's data window, so file contents are
//! the same frames the server flushes to disk.

use crate::env::EnvId;
use crate::error::{Error, Result};
use crate::fd::{fd2data, fd2num, fd_alloc, fd_lookup, Dev, Stat};
use crate::fs::layout::{
    encode_fileid_arg, encode_open, encode_remove, BY2BLK, FSREQ_CLOSE, FSREQ_DIRTY, FSREQ_MAP,
    FSREQ_OPEN, FSREQ_REMOVE, FSREQ_SET_SIZE, FSREQ_SYNC, FTYPE_DIR, MAXFILESIZE, MAXNAMELEN,
    MAXPATHLEN,
};
use crate::fs::serv::{FILEFD_FILE, FILEFD_FILEID};
use crate::fork::vpt_entry;
use crate::mmu::{vpn, PteFlags, BY2PG, PDMAP};
use crate::os::Os;
use crate::Kernel;

/// The one-page request buffer every client keeps mapped.
pub const FSIPCBUF: u32 = 0x0fff_e000;

/// Bounded retries against a busy server before giving up.
const SEND_RETRIES: u32 = 128;

// Filefd field offsets past the Fd header.
const FILE_SIZE_OFF: u32 = FILEFD_FILE + MAXNAMELEN as u32;
const FILE_TYPE_OFF: u32 = FILE_SIZE_OFF + 4;

pub static DEVFILE: Dev = Dev {
    id: 0,
    name: "file",
    read: devfile_read,
    write: devfile_write,
    close: devfile_close,
    stat: devfile_stat,
    seek: devfile_seek,
};

/// Exchange one request with the server: map the request page over,
/// block for the reply, decode the scalar.
fn fsipc(os: &mut Os, env: EnvId, req_type: u32, req: &[u8], dstva: u32) -> Result<u32> {
    let fsenv = os.fs.env();
    if os.kernel.pageref(env, FSIPCBUF) == 0 {
        os.kernel
            .sys_mem_alloc(env, 0, FSIPCBUF, PteFlags::V | PteFlags::R)?;
    }
    os.kernel.user_bzero(env, FSIPCBUF, BY2PG)?;
    os.kernel.user_write(env, FSIPCBUF, req)?;

    let mut sent = false;
    for _ in 0..SEND_RETRIES {
        match os
            .kernel
            .sys_ipc_can_send(env, fsenv, req_type, FSIPCBUF, PteFlags::V | PteFlags::R)
        {
            Ok(()) => {
                sent = true;
                break;
            }
            Err(Error::IpcNotRecv) => {
                os.kernel.sys_yield(env);
                os.pump_server()?;
            }
            Err(e) => return Err(e),
        }
    }
    if !sent {
        return Err(Error::IpcNotRecv);
    }

    os.kernel.sys_ipc_recv(env, dstva)?;
    os.run_until(env)?;
    let (value, _, _) = os.kernel.ipc_result(env);
    Error::from_ipc(value as i32)
}

/// Open (and with `O_CREAT`, create) a file, returning the descriptor
/// number. The server's reply maps the shared Filefd page into the
/// descriptor slot.
pub fn open(os: &mut Os, env: EnvId, path: &str, omode: u32) -> Result<u32> {
    if path.len() >= MAXPATHLEN {
        return Err(Error::BadPath);
    }
    let fdva = fd_alloc(&os.kernel, env)?;
    let req = encode_open(path, omode)?;
    fsipc(os, env, FSREQ_OPEN, &req, fdva)?;
    Ok(fd2num(fdva))
}

pub fn filefd_fileid(k: &Kernel, env: EnvId, fdva: u32) -> Result<u32> {
    k.user_read_u32(env, fdva + FILEFD_FILEID)
}

pub fn filefd_size(k: &Kernel, env: EnvId, fdva: u32) -> Result<u32> {
    k.user_read_u32(env, fdva + FILE_SIZE_OFF)
}

fn filefd_set_size(k: &mut Kernel, env: EnvId, fdva: u32, size: u32) -> Result<()> {
    k.user_write_u32(env, fdva + FILE_SIZE_OFF, size)
}

/// Map the block containing `offset` into the descriptor's data
/// window.
fn fsipc_map(os: &mut Os, env: EnvId, fileid: u32, fdva: u32, filebno: u32) -> Result<u32> {
    let dstva = fd2data(fdva) + filebno * BY2PG;
    let req = encode_fileid_arg(fileid, filebno * BY2BLK);
    fsipc(os, env, FSREQ_MAP, &req, dstva)?;
    Ok(dstva)
}

fn devfile_read(os: &mut Os, env: EnvId, fdva: u32, buf: &mut [u8], offset: u32) -> Result<usize> {
    let size = filefd_size(&os.kernel, env, fdva)?;
    if offset >= size {
        return Ok(0);
    }
    let fileid = filefd_fileid(&os.kernel, env, fdva)?;
    let n = (buf.len() as u32).min(size - offset);

    let mut done = 0u32;
    while done < n {
        let pos = offset + done;
        let va = fsipc_map(os, env, fileid, fdva, pos / BY2BLK)?;
        let chunk = (BY2BLK - pos % BY2BLK).min(n - done);
        os.kernel.user_read(
            env,
            va + pos % BY2BLK,
            &mut buf[done as usize..(done + chunk) as usize],
        )?;
        done += chunk;
    }
    Ok(n as usize)
}

fn devfile_write(os: &mut Os, env: EnvId, fdva: u32, buf: &[u8], offset: u32) -> Result<usize> {
    let end = offset
        .checked_add(buf.len() as u32)
        .filter(|&e| e <= MAXFILESIZE)
        .ok_or(Error::NoDisk)?;
    let fileid = filefd_fileid(&os.kernel, env, fdva)?;
    let size = filefd_size(&os.kernel, env, fdva)?;

    let mut done = 0u32;
    while done < buf.len() as u32 {
        let pos = offset + done;
        let va = fsipc_map(os, env, fileid, fdva, pos / BY2BLK)?;
        let chunk = (BY2BLK - pos % BY2BLK).min(buf.len() as u32 - done);
        os.kernel.user_write(
            env,
            va + pos % BY2BLK,
            &buf[done as usize..(done + chunk) as usize],
        )?;
        let req = encode_fileid_arg(fileid, pos);
        fsipc(os, env, FSREQ_DIRTY, &req, 0)?;
        done += chunk;
    }

    if end > size {
        let req = encode_fileid_arg(fileid, end);
        fsipc(os, env, FSREQ_SET_SIZE, &req, 0)?;
        filefd_set_size(&mut os.kernel, env, fdva, end)?;
    }
    Ok(buf.len())
}

fn devfile_close(os: &mut Os, env: EnvId, fdva: u32) -> Result<()> {
    let fileid = filefd_fileid(&os.kernel, env, fdva)?;
    let req = encode_fileid_arg(fileid, 0);
    fsipc(os, env, FSREQ_CLOSE, &req, 0)?;

    // Drop the data window mappings; the fd page itself is the
    // caller's to unmap.
    let data = fd2data(fdva);
    let mut off = 0;
    while off < PDMAP {
        if matches!(vpt_entry(&os.kernel, env, vpn(data + off)), Ok(pte) if pte & PteFlags::V.bits() != 0)
        {
            os.kernel.sys_mem_unmap(env, 0, data + off)?;
        }
        off += BY2PG;
    }
    Ok(())
}

fn devfile_stat(os: &mut Os, env: EnvId, fdva: u32, st: &mut Stat) -> Result<()> {
    let mut name = [0u8; MAXNAMELEN];
    os.kernel.user_read(env, fdva + FILEFD_FILE, &mut name)?;
    let len = name.iter().position(|&c| c == 0).unwrap_or(MAXNAMELEN);
    st.name = alloc::string::String::from_utf8_lossy(&name[..len]).into_owned();
    st.size = filefd_size(&os.kernel, env, fdva)?;
    st.isdir = os.kernel.user_read_u32(env, fdva + FILE_TYPE_OFF)? == FTYPE_DIR;
    Ok(())
}

fn devfile_seek(_os: &mut Os, _env: EnvId, _fdva: u32, _offset: u32) -> Result<()> {
    Ok(())
}

/// Shrink or grow an open file, keeping the shared Filefd in step.
pub fn ftruncate(os: &mut Os, env: EnvId, fdnum: u32, size: u32) -> Result<()> {
    let fdva = fd_lookup(&os.kernel, env, fdnum)?;
    let fileid = filefd_fileid(&os.kernel, env, fdva)?;
    let req = encode_fileid_arg(fileid, size);
    fsipc(os, env, FSREQ_SET_SIZE, &req, 0)?;
    filefd_set_size(&mut os.kernel, env, fdva, size)
}

/// Delete a file by path.
pub fn remove(os: &mut Os, env: EnvId, path: &str) -> Result<()> {
    let req = encode_remove(path)?;
    fsipc(os, env, FSREQ_REMOVE, &req, 0).map(|_| ())
}

/// Flush the whole file system to disk.
pub fn sync(os: &mut Os, env: EnvId) -> Result<()> {
    fsipc(os, env, FSREQ_SYNC, &[0u8; 4], 0).map(|_| ())
}
