//! The system-call surface, plus the user-memory access path that
//! stands in for user-mode loads and stores.
//!
//! Every call names the environment it runs as (`caller`); an `envid`
//! argument of 0 resolves to the caller, exactly like the real ABI.
//! Return values are `Result` here and become negative scalars on the
//! IPC wire.

use crate::env::{EnvId, EnvStatus, PgfaultEntry, REG_V0};
use crate::error::{Error, Result};
use crate::ide::{DiskRef, SECT_SIZE};
use crate::mmu::{round_down, PteFlags, BY2PG, USTACKTOP, UTOP};
use crate::vmm::{page_insert, page_lookup, page_remove, translate};
use crate::Kernel;

impl Kernel {
    pub fn sys_getenvid(&self, caller: EnvId) -> EnvId {
        self.envs.get(caller).id
    }

    /// Give up the CPU for the rest of the quantum.
    pub fn sys_yield(&mut self, caller: EnvId) {
        if self.cur == Some(caller) {
            self.cur = None;
        }
    }

    /// Destroy the caller itself or one of its immediate children.
    pub fn sys_env_destroy(&mut self, caller: EnvId, envid: EnvId) -> Result<()> {
        let e = self.envid2env(caller, envid, true)?;
        log::info!("[env] [{:08x}] destroying {:08x}", caller, e);
        self.env_destroy(e);
        Ok(())
    }

    /// Record the user-mode page-fault re-entry point and its stack.
    pub fn sys_set_pgfault_handler(
        &mut self,
        caller: EnvId,
        envid: EnvId,
        entry: PgfaultEntry,
        xstacktop: u32,
    ) -> Result<()> {
        let e = self.envid2env(caller, envid, false)?;
        let env = self.envs.get_mut(e);
        env.pgfault_entry = Some(entry);
        env.xstacktop = xstacktop;
        Ok(())
    }

    /// Allocate a zeroed page and map it at `va`. `perm` must contain
    /// `V` and must not contain `COW`; only addresses below `UTOP` can
    /// be manipulated.
    pub fn sys_mem_alloc(&mut self, caller: EnvId, envid: EnvId, va: u32, perm: PteFlags) -> Result<()> {
        if !perm.contains(PteFlags::V) || perm.contains(PteFlags::COW) || va >= UTOP {
            return Err(Error::Invalid);
        }
        let e = self.envid2env(caller, envid, false)?;
        let pgdir = self.envs.get(e).pgdir;
        let ppn = self.pm.page_alloc()?;
        if let Err(err) = page_insert(&mut self.pm, pgdir, ppn, round_down(va, BY2PG), perm) {
            // Return the orphaned frame to the free list.
            self.pm.page_incref(ppn);
            self.pm.page_decref(ppn);
            return Err(err);
        }
        Ok(())
    }

    /// Share the frame mapped at `srcva` in `srcid` into `dstid` at
    /// `dstva` with permissions `perm`.
    pub fn sys_mem_map(
        &mut self,
        caller: EnvId,
        srcid: EnvId,
        srcva: u32,
        dstid: EnvId,
        dstva: u32,
        perm: PteFlags,
    ) -> Result<()> {
        if !perm.contains(PteFlags::V) || srcva >= UTOP || dstva >= UTOP {
            return Err(Error::Invalid);
        }
        let src = self.envid2env(caller, srcid, false)?;
        let dst = self.envid2env(caller, dstid, false)?;
        let src_pgdir = self.envs.get(src).pgdir;
        let dst_pgdir = self.envs.get(dst).pgdir;
        let (ppn, _) = page_lookup(&self.pm, src_pgdir, round_down(srcva, BY2PG))
            .ok_or(Error::Invalid)?;
        page_insert(&mut self.pm, dst_pgdir, ppn, round_down(dstva, BY2PG), perm)
    }

    /// Unmap `va`; silently succeeds when nothing is mapped there.
    pub fn sys_mem_unmap(&mut self, caller: EnvId, envid: EnvId, va: u32) -> Result<()> {
        if va >= UTOP {
            return Err(Error::Invalid);
        }
        let e = self.envid2env(caller, envid, false)?;
        let pgdir = self.envs.get(e).pgdir;
        page_remove(&mut self.pm, pgdir, round_down(va, BY2PG));
        Ok(())
    }

    /// Allocate a child environment. The child gets a copy of the
    /// caller's register state with `v0` forced to 0, inherits the
    /// page-fault handler setup, and receives a private copy of the
    /// caller's user-stack page. It starts `NotRunnable`.
    pub fn sys_env_alloc(&mut self, caller: EnvId) -> Result<EnvId> {
        let parent_id = self.envs.get(caller).id;
        let child = self.env_alloc(parent_id)?;

        let (parent_tf, parent_handler, parent_xstack, parent_pgdir) = {
            let p = self.envs.get(caller);
            (p.tf.clone(), p.pgfault_entry, p.xstacktop, p.pgdir)
        };
        {
            let c = self.envs.get_mut(child);
            c.status = EnvStatus::NotRunnable;
            c.tf = parent_tf;
            c.tf.regs[REG_V0] = 0;
            c.pgfault_entry = parent_handler;
            c.xstacktop = parent_xstack;
        }

        let stack_va = USTACKTOP - BY2PG;
        if let Some((ppn, flags)) = page_lookup(&self.pm, parent_pgdir, stack_va) {
            let copy = self.pm.page_alloc()?;
            let mut buf = [0u8; BY2PG as usize];
            buf.copy_from_slice(self.pm.frame(ppn));
            self.pm.frame_mut(copy).copy_from_slice(&buf);
            let child_pgdir = self.envs.get(child).pgdir;
            page_insert(&mut self.pm, child_pgdir, copy, stack_va, flags)?;
        }
        Ok(child)
    }

    /// Move an environment between the runnable and blocked sets.
    /// Requires the target to be the caller or an immediate child.
    pub fn sys_set_env_status(&mut self, caller: EnvId, envid: EnvId, status: EnvStatus) -> Result<()> {
        let e = self.envid2env(caller, envid, true)?;
        self.envs.get_mut(e).status = status;
        Ok(())
    }

    /// Block until somebody sends. A page sent along will be mapped at
    /// `dstva` (0 means no page wanted).
    pub fn sys_ipc_recv(&mut self, caller: EnvId, dstva: u32) -> Result<()> {
        if dstva != 0 && dstva >= UTOP {
            return Err(Error::Invalid);
        }
        let env = self.envs.get_mut(caller);
        env.ipc_recving = true;
        env.ipc_dstva = dstva;
        env.status = EnvStatus::NotRunnable;
        self.sys_yield(caller);
        Ok(())
    }

    /// Deliver `value` (and optionally the page at `srcva`) to a
    /// blocked receiver. Fails fast with `IpcNotRecv` when the target
    /// is not waiting.
    pub fn sys_ipc_can_send(
        &mut self,
        caller: EnvId,
        envid: EnvId,
        value: u32,
        srcva: u32,
        perm: PteFlags,
    ) -> Result<()> {
        let target = self.envid2env(caller, envid, false)?;
        let (recving, dstva) = {
            let t = self.envs.get(target);
            (t.ipc_recving, t.ipc_dstva)
        };
        if !recving {
            return Err(Error::IpcNotRecv);
        }
        if srcva != 0 {
            self.sys_mem_map(caller, 0, srcva, target, dstva, perm)?;
        }
        let from = self.envs.get(caller).id;
        let t = self.envs.get_mut(target);
        t.ipc_recving = false;
        t.ipc_from = from;
        t.ipc_value = value;
        t.ipc_perm = perm;
        t.status = EnvStatus::Runnable;
        Ok(())
    }

    /// What the last successful receive delivered: value, sender, and
    /// the permission bits the sender passed (senders that transfer no
    /// page pass none).
    pub fn ipc_result(&self, env: EnvId) -> (u32, EnvId, PteFlags) {
        let e = self.envs.get(env);
        (e.ipc_value, e.ipc_from, e.ipc_perm)
    }

    /// Reference count of the frame mapped at `va`, 0 when unmapped.
    pub fn pageref(&self, env: EnvId, va: u32) -> u32 {
        let pgdir = self.envs.get(env).pgdir;
        match page_lookup(&self.pm, pgdir, round_down(va, BY2PG)) {
            Some((ppn, _)) => self.pm.page_refcount(ppn) as u32,
            None => 0,
        }
    }

    // ─── user-memory access: the modeled load/store path ───

    /// Read user memory. Faults (unmapped pages) surface as `Invalid`.
    pub fn user_read(&self, env: EnvId, va: u32, buf: &mut [u8]) -> Result<()> {
        let pgdir = self.envs.get(env).pgdir;
        let mut done = 0usize;
        while done < buf.len() {
            let cur = va + done as u32;
            let (pa, flags) = translate(&self.pm, pgdir, cur).ok_or(Error::Invalid)?;
            if !flags.contains(PteFlags::V) {
                return Err(Error::Invalid);
            }
            let in_page = (BY2PG - (cur & (BY2PG - 1))) as usize;
            let n = in_page.min(buf.len() - done);
            self.pm.read_bytes(pa, &mut buf[done..done + n]);
            done += n;
        }
        Ok(())
    }

    /// Write user memory. A store that reaches a present but
    /// non-writable page re-enters the environment's page-fault
    /// handler on its exception stack, then retries once. This is
    /// the mechanism copy-on-write is built on.
    pub fn user_write(&mut self, env: EnvId, va: u32, buf: &[u8]) -> Result<()> {
        let mut done = 0usize;
        while done < buf.len() {
            let cur = va + done as u32;
            let pgdir = self.envs.get(env).pgdir;
            let writable = match translate(&self.pm, pgdir, cur) {
                Some((_, flags)) => flags.contains(PteFlags::R),
                None => false,
            };
            if !writable {
                self.page_fault(env, cur)?;
                let pgdir = self.envs.get(env).pgdir;
                match translate(&self.pm, pgdir, cur) {
                    Some((_, flags)) if flags.contains(PteFlags::R) => {}
                    _ => return Err(Error::Invalid),
                }
            }
            let pgdir = self.envs.get(env).pgdir;
            let (pa, _) = translate(&self.pm, pgdir, cur).ok_or(Error::Invalid)?;
            let in_page = (BY2PG - (cur & (BY2PG - 1))) as usize;
            let n = in_page.min(buf.len() - done);
            self.pm.write_bytes(pa, &buf[done..done + n]);
            done += n;
        }
        Ok(())
    }

    fn page_fault(&mut self, env: EnvId, va: u32) -> Result<()> {
        let handler = self.envs.get(env).pgfault_entry.ok_or(Error::Invalid)?;
        // The trampoline would switch to the exception stack here; the
        // handler itself runs as ordinary user code.
        handler(self, env, va);
        Ok(())
    }

    pub fn user_bzero(&mut self, env: EnvId, va: u32, len: u32) -> Result<()> {
        let zeros = [0u8; 256];
        let mut done = 0u32;
        while done < len {
            let n = (len - done).min(zeros.len() as u32);
            self.user_write(env, va + done, &zeros[..n as usize])?;
            done += n;
        }
        Ok(())
    }

    pub fn user_read_u32(&self, env: EnvId, va: u32) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.user_read(env, va, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    pub fn user_write_u32(&mut self, env: EnvId, va: u32, value: u32) -> Result<()> {
        self.user_write(env, va, &value.to_le_bytes())
    }

    // ─── console ───

    pub fn sys_putchar(&mut self, _caller: EnvId, c: u8) {
        self.console.putc(c);
    }

    pub fn sys_cgetc(&mut self, _caller: EnvId) -> Option<u8> {
        self.console.getc()
    }

    // ─── IDE interface (the block driver itself is external) ───

    pub fn attach_disk(&mut self, disk: DiskRef) -> u32 {
        let diskno = self.disks.len() as u32;
        let sectors = disk.lock().sectors();
        log::info!("[ide] disk {} attached: {} sectors", diskno, sectors);
        self.disks.push(disk);
        diskno
    }

    /// Read `nsecs` sectors starting at `secno` into `dst`.
    pub fn ide_read(&mut self, diskno: u32, secno: u32, dst: &mut [u8], nsecs: u32) -> Result<()> {
        let disk = self.disks.get(diskno as usize).ok_or(Error::Invalid)?;
        let mut disk = disk.lock();
        for s in 0..nsecs as usize {
            disk.read_sector(secno + s as u32, &mut dst[s * SECT_SIZE..(s + 1) * SECT_SIZE])
                .map_err(|_| Error::Unspecified)?;
        }
        Ok(())
    }

    /// Write `nsecs` sectors starting at `secno` from `src`.
    pub fn ide_write(&mut self, diskno: u32, secno: u32, src: &[u8], nsecs: u32) -> Result<()> {
        let disk = self.disks.get(diskno as usize).ok_or(Error::Invalid)?;
        let mut disk = disk.lock();
        for s in 0..nsecs as usize {
            disk.write_sector(secno + s as u32, &src[s * SECT_SIZE..(s + 1) * SECT_SIZE])
                .map_err(|_| Error::Unspecified)?;
        }
        Ok(())
    }
}
