//! Per-process file descriptors and device dispatch.
//!
//! A descriptor is one page at a well-known slot of the fd table
//! region; slot `i` is allocated exactly when its page is mapped. The
//! first words of the page are the `Fd` proper (device id, offset,
//! open mode); for files the rest is the server-shared Filefd.
//! Devices are capability records of plain function pointers.

use alloc::string::String;

use crate::env::EnvId;
use crate::error::{Error, Result};
use crate::fork::{vpd_entry, vpt_entry};
use crate::fs::layout::{O_ACCMODE, O_RDONLY, O_WRONLY};
use crate::mmu::{pdx, vpn, PteFlags, BY2PG, PDMAP};
use crate::os::Os;
use crate::Kernel;

pub const MAXFD: u32 = 32;
/// Base of the per-descriptor data regions, 4 MiB each.
pub const FILEBASE: u32 = 0x6000_0000;
/// Base of the descriptor pages themselves.
pub const FDTABLE: u32 = FILEBASE - PDMAP;

#[inline]
pub fn index2fd(i: u32) -> u32 {
    FDTABLE + i * BY2PG
}

#[inline]
pub fn index2data(i: u32) -> u32 {
    FILEBASE + i * PDMAP
}

#[inline]
pub fn fd2num(fdva: u32) -> u32 {
    (fdva - FDTABLE) / BY2PG
}

#[inline]
pub fn fd2data(fdva: u32) -> u32 {
    index2data(fd2num(fdva))
}

// Fd field offsets within the descriptor page.
pub const FD_DEVID: u32 = 0;
pub const FD_OFFSET: u32 = 4;
pub const FD_OMODE: u32 = 8;

pub struct Stat {
    pub name: String,
    pub size: u32,
    pub isdir: bool,
    pub dev_id: u32,
}

impl Stat {
    pub fn empty() -> Self {
        Self {
            name: String::new(),
            size: 0,
            isdir: false,
            dev_id: 0,
        }
    }
}

/// A device: an id, a name, and the operations a descriptor on it
/// supports.
pub struct Dev {
    pub id: u32,
    pub name: &'static str,
    pub read: fn(&mut Os, EnvId, u32, &mut [u8], u32) -> Result<usize>,
    pub write: fn(&mut Os, EnvId, u32, &[u8], u32) -> Result<usize>,
    pub close: fn(&mut Os, EnvId, u32) -> Result<()>,
    pub stat: fn(&mut Os, EnvId, u32, &mut Stat) -> Result<()>,
    pub seek: fn(&mut Os, EnvId, u32, u32) -> Result<()>,
}

/// The fixed device table: file and console. Device id 2 stays
/// reserved for the pipe device, which lives outside this core.
static DEVTAB: [&Dev; 2] = [&crate::file::DEVFILE, &crate::console::DEVCONS];

pub fn dev_lookup(env: EnvId, dev_id: u32) -> Result<&'static Dev> {
    for dev in DEVTAB {
        if dev.id == dev_id {
            return Ok(dev);
        }
    }
    log::error!("[fd] [{:08x}] unknown device type {}", env, dev_id);
    Err(Error::Invalid)
}

fn fd_is_mapped(k: &Kernel, env: EnvId, va: u32) -> bool {
    match vpd_entry(k, env, pdx(va)) {
        Ok(pde) if pde & PteFlags::V.bits() != 0 => {}
        _ => return false,
    }
    matches!(vpt_entry(k, env, vpn(va)), Ok(pte) if pte & PteFlags::V.bits() != 0)
}

/// The smallest unmapped descriptor slot. The page itself is not
/// allocated; whoever opens the descriptor decides how it gets its
/// page (the FS server sends one, the console allocates one).
pub fn fd_alloc(k: &Kernel, env: EnvId) -> Result<u32> {
    for fdno in 0..MAXFD {
        let va = index2fd(fdno);
        if !fd_is_mapped(k, env, va) {
            return Ok(va);
        }
    }
    Err(Error::MaxOpen)
}

pub fn fd_lookup(k: &Kernel, env: EnvId, fdnum: u32) -> Result<u32> {
    if fdnum >= MAXFD {
        return Err(Error::Invalid);
    }
    let va = index2fd(fdnum);
    if fd_is_mapped(k, env, va) {
        Ok(va)
    } else {
        Err(Error::Invalid)
    }
}

/// Drop the descriptor page; the device-specific close is the
/// caller's business.
pub fn fd_close(k: &mut Kernel, env: EnvId, fdva: u32) -> Result<()> {
    k.sys_mem_unmap(env, 0, fdva)
}

pub fn fd_devid(k: &Kernel, env: EnvId, fdva: u32) -> Result<u32> {
    k.user_read_u32(env, fdva + FD_DEVID)
}

pub fn fd_offset(k: &Kernel, env: EnvId, fdva: u32) -> Result<u32> {
    k.user_read_u32(env, fdva + FD_OFFSET)
}

pub fn fd_set_offset(k: &mut Kernel, env: EnvId, fdva: u32, offset: u32) -> Result<()> {
    k.user_write_u32(env, fdva + FD_OFFSET, offset)
}

pub fn fd_omode(k: &Kernel, env: EnvId, fdva: u32) -> Result<u32> {
    k.user_read_u32(env, fdva + FD_OMODE)
}

/// Close a descriptor: device close first, then the local unmap.
pub fn close(os: &mut Os, env: EnvId, fdnum: u32) -> Result<()> {
    let fdva = fd_lookup(&os.kernel, env, fdnum)?;
    let dev = dev_lookup(env, fd_devid(&os.kernel, env, fdva)?)?;
    let r = (dev.close)(os, env, fdva);
    fd_close(&mut os.kernel, env, fdva)?;
    r
}

pub fn close_all(os: &mut Os, env: EnvId) {
    for fdnum in 0..MAXFD {
        let _ = close(os, env, fdnum);
    }
}

/// Read up to `buf.len()` bytes at the descriptor's offset, advancing
/// it by what the device delivered.
pub fn read(os: &mut Os, env: EnvId, fdnum: u32, buf: &mut [u8]) -> Result<usize> {
    let fdva = fd_lookup(&os.kernel, env, fdnum)?;
    let dev = dev_lookup(env, fd_devid(&os.kernel, env, fdva)?)?;
    if fd_omode(&os.kernel, env, fdva)? & O_ACCMODE == O_WRONLY {
        log::error!("[fd] [{:08x}] read {} -- bad mode", env, fdnum);
        return Err(Error::Invalid);
    }
    let offset = fd_offset(&os.kernel, env, fdva)?;
    let n = (dev.read)(os, env, fdva, buf, offset)?;
    fd_set_offset(&mut os.kernel, env, fdva, offset + n as u32)?;
    Ok(n)
}

/// Keep reading until `buf` is full or the device runs dry.
pub fn readn(os: &mut Os, env: EnvId, fdnum: u32, buf: &mut [u8]) -> Result<usize> {
    let mut tot = 0;
    while tot < buf.len() {
        let m = read(os, env, fdnum, &mut buf[tot..])?;
        if m == 0 {
            break;
        }
        tot += m;
    }
    Ok(tot)
}

pub fn write(os: &mut Os, env: EnvId, fdnum: u32, buf: &[u8]) -> Result<usize> {
    let fdva = fd_lookup(&os.kernel, env, fdnum)?;
    let dev = dev_lookup(env, fd_devid(&os.kernel, env, fdva)?)?;
    if fd_omode(&os.kernel, env, fdva)? & O_ACCMODE == O_RDONLY {
        log::error!("[fd] [{:08x}] write {} -- bad mode", env, fdnum);
        return Err(Error::Invalid);
    }
    let offset = fd_offset(&os.kernel, env, fdva)?;
    let n = (dev.write)(os, env, fdva, buf, offset)?;
    fd_set_offset(&mut os.kernel, env, fdva, offset + n as u32)?;
    Ok(n)
}

pub fn seek(k: &mut Kernel, env: EnvId, fdnum: u32, offset: u32) -> Result<()> {
    let fdva = fd_lookup(k, env, fdnum)?;
    fd_set_offset(k, env, fdva, offset)
}

pub fn fstat(os: &mut Os, env: EnvId, fdnum: u32) -> Result<Stat> {
    let fdva = fd_lookup(&os.kernel, env, fdnum)?;
    let dev = dev_lookup(env, fd_devid(&os.kernel, env, fdva)?)?;
    let mut st = Stat::empty();
    st.dev_id = dev.id;
    (dev.stat)(os, env, fdva, &mut st)?;
    Ok(st)
}

pub fn stat(os: &mut Os, env: EnvId, path: &str) -> Result<Stat> {
    let fdnum = crate::file::open(os, env, path, O_RDONLY)?;
    let r = fstat(os, env, fdnum);
    close(os, env, fdnum)?;
    r
}

/// Duplicate `oldfdnum` onto `newfdnum`: the descriptor page and its
/// one-slot data window are re-mapped shared. Files wider than the
/// 4 MiB window keep only that much visible through the copy.
pub fn dup(os: &mut Os, env: EnvId, oldfdnum: u32, newfdnum: u32) -> Result<u32> {
    let oldfd = fd_lookup(&os.kernel, env, oldfdnum)?;
    if newfdnum >= MAXFD {
        return Err(Error::Invalid);
    }
    let newfd = index2fd(newfdnum);
    let ova = fd2data(oldfd);
    let nva = fd2data(newfd);
    let _ = close(os, env, newfdnum);

    let share = PteFlags::V | PteFlags::R | PteFlags::LIBRARY;
    let r = (|| -> Result<()> {
        if vpd_entry(&os.kernel, env, pdx(ova))? & PteFlags::V.bits() != 0 {
            let mut off = 0;
            while off < PDMAP {
                let pte = vpt_entry(&os.kernel, env, vpn(ova + off))?;
                if pte & PteFlags::V.bits() != 0 {
                    let perm = PteFlags::from_bits_truncate(pte) & share;
                    os.kernel.sys_mem_map(env, 0, ova + off, 0, nva + off, perm)?;
                }
                off += BY2PG;
            }
        }
        let pte = vpt_entry(&os.kernel, env, vpn(oldfd))?;
        let perm = PteFlags::from_bits_truncate(pte) & share;
        os.kernel.sys_mem_map(env, 0, oldfd, 0, newfd, perm)?;
        Ok(())
    })();

    if let Err(e) = r {
        let _ = os.kernel.sys_mem_unmap(env, 0, newfd);
        let mut off = 0;
        while off < PDMAP {
            let _ = os.kernel.sys_mem_unmap(env, 0, nva + off);
            off += BY2PG;
        }
        return Err(e);
    }
    Ok(newfdnum)
}
