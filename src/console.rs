//! The console device.
//!
//! The real machine's console driver is out of scope; the kernel keeps
//! a capture buffer instead, which the demo and the tests drain. The
//! client side is an ordinary device-table entry.

use alloc::collections::VecDeque;
use alloc::string::String;
use alloc::vec::Vec;

use crate::env::EnvId;
use crate::error::Result;
use crate::fd::{fd2num, fd_alloc, Dev, Stat, FD_DEVID, FD_OFFSET, FD_OMODE};
use crate::fs::layout::O_RDWR;
use crate::mmu::PteFlags;
use crate::os::Os;

/// Kernel-side console state: everything written, anything queued to
/// be read.
pub struct ConsoleBuf {
    out: Vec<u8>,
    input: VecDeque<u8>,
}

impl ConsoleBuf {
    pub fn new() -> Self {
        Self {
            out: Vec::new(),
            input: VecDeque::new(),
        }
    }

    pub fn putc(&mut self, c: u8) {
        self.out.push(c);
    }

    pub fn getc(&mut self) -> Option<u8> {
        self.input.pop_front()
    }

    /// Queue bytes for console reads.
    pub fn feed_input(&mut self, bytes: &[u8]) {
        self.input.extend(bytes.iter().copied());
    }

    /// Drain everything written so far.
    pub fn take_output(&mut self) -> String {
        let out = core::mem::take(&mut self.out);
        String::from_utf8_lossy(&out).into_owned()
    }
}

impl Default for ConsoleBuf {
    fn default() -> Self {
        Self::new()
    }
}

pub static DEVCONS: Dev = Dev {
    id: 1,
    name: "cons",
    read: devcons_read,
    write: devcons_write,
    close: devcons_close,
    stat: devcons_stat,
    seek: devcons_seek,
};

/// Open a descriptor on the console.
pub fn opencons(os: &mut Os, env: EnvId) -> Result<u32> {
    let fdva = fd_alloc(&os.kernel, env)?;
    os.kernel
        .sys_mem_alloc(env, 0, fdva, PteFlags::V | PteFlags::R | PteFlags::LIBRARY)?;
    os.kernel.user_write_u32(env, fdva + FD_DEVID, DEVCONS.id)?;
    os.kernel.user_write_u32(env, fdva + FD_OFFSET, 0)?;
    os.kernel.user_write_u32(env, fdva + FD_OMODE, O_RDWR)?;
    Ok(fd2num(fdva))
}

fn devcons_read(os: &mut Os, env: EnvId, _fdva: u32, buf: &mut [u8], _offset: u32) -> Result<usize> {
    let mut n = 0;
    while n < buf.len() {
        match os.kernel.sys_cgetc(env) {
            Some(c) => {
                buf[n] = c;
                n += 1;
            }
            None => break,
        }
    }
    Ok(n)
}

fn devcons_write(os: &mut Os, env: EnvId, _fdva: u32, buf: &[u8], _offset: u32) -> Result<usize> {
    for &c in buf {
        os.kernel.sys_putchar(env, c);
    }
    Ok(buf.len())
}

fn devcons_close(_os: &mut Os, _env: EnvId, _fdva: u32) -> Result<()> {
    Ok(())
}

fn devcons_stat(_os: &mut Os, _env: EnvId, _fdva: u32, st: &mut Stat) -> Result<()> {
    st.name = String::from("<cons>");
    Ok(())
}

fn devcons_seek(_os: &mut Os, _env: EnvId, _fdva: u32, _offset: u32) -> Result<()> {
    Ok(())
}
