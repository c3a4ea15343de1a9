//! The environment (process) table.
//!
//! An environment is an address space plus a saved register file and a
//! little metadata. Environments are allocated out of a fixed table
//! through a free list; ids carry a generation in the high bits so a
//! stale id never resolves to a recycled slot.

use alloc::vec::Vec;

use crate::error::{Error, Result};
use crate::mmu::{pdx, pte_flags, pte_ppn, PteFlags, PDSHIFT, PGSHIFT, USTACKTOP, UTOP, UVPT, VPT};
use crate::vmm::page_remove;
use crate::Kernel;

pub const NENV: usize = 64;
pub const LOG2NENV: u32 = 6;

pub type EnvId = u32;

/// Page-fault upcall: re-enters user code with the faulting address.
pub type PgfaultEntry = fn(&mut Kernel, EnvId, u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvStatus {
    Free,
    Runnable,
    NotRunnable,
}

/// Saved MIPS register file. `regs[29]` is the stack pointer and
/// `regs[2]` (v0) carries syscall return values.
#[derive(Debug, Clone)]
pub struct TrapFrame {
    pub regs: [u32; 32],
    pub pc: u32,
    pub cp0_status: u32,
}

pub const REG_V0: usize = 2;
pub const REG_SP: usize = 29;

/// CP0 status for user mode with interrupts enabled.
const CP0_STATUS_USER: u32 = 0x1000_1004;

impl TrapFrame {
    pub const fn new() -> Self {
        Self {
            regs: [0; 32],
            pc: 0,
            cp0_status: 0,
        }
    }
}

impl Default for TrapFrame {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Env {
    pub id: EnvId,
    pub parent_id: EnvId,
    pub status: EnvStatus,
    pub runs: u64,
    pub tf: TrapFrame,
    /// Physical address of the page directory; 0 while free.
    pub pgdir: u32,
    pub pgfault_entry: Option<PgfaultEntry>,
    pub xstacktop: u32,
    pub ipc_recving: bool,
    pub ipc_dstva: u32,
    pub ipc_from: EnvId,
    pub ipc_value: u32,
    pub ipc_perm: PteFlags,
}

impl Env {
    const fn empty() -> Self {
        Self {
            id: 0,
            parent_id: 0,
            status: EnvStatus::Free,
            runs: 0,
            tf: TrapFrame::new(),
            pgdir: 0,
            pgfault_entry: None,
            xstacktop: 0,
            ipc_recving: false,
            ipc_dstva: 0,
            ipc_from: 0,
            ipc_value: 0,
            ipc_perm: PteFlags::empty(),
        }
    }
}

pub struct EnvTable {
    envs: Vec<Env>,
    free_list: Vec<usize>,
    next_id: u32,
}

/// Slot index encoded in an environment id.
#[inline]
pub fn envx(id: EnvId) -> usize {
    (id as usize) & (NENV - 1)
}

impl EnvTable {
    pub fn new() -> Self {
        let mut envs = Vec::with_capacity(NENV);
        envs.resize_with(NENV, Env::empty);
        // Reverse order so the first allocation hands out slot 0.
        let free_list = (0..NENV).rev().collect();
        Self {
            envs,
            free_list,
            next_id: 0,
        }
    }

    fn mkenvid(&mut self, slot: usize) -> EnvId {
        self.next_id += 1;
        (self.next_id << (1 + LOG2NENV)) | slot as u32
    }

    pub fn get(&self, id: EnvId) -> &Env {
        &self.envs[envx(id)]
    }

    pub fn get_mut(&mut self, id: EnvId) -> &mut Env {
        &mut self.envs[envx(id)]
    }

    pub fn slot(&self, slot: usize) -> &Env {
        &self.envs[slot]
    }
}

impl Default for EnvTable {
    fn default() -> Self {
        Self::new()
    }
}

impl Kernel {
    /// Resolve an env id as seen from `caller`; id 0 means the caller
    /// itself. With `check_perm`, the target must be the caller or one
    /// of its immediate children.
    pub fn envid2env(&self, caller: EnvId, envid: EnvId, check_perm: bool) -> Result<EnvId> {
        if envid == 0 {
            return Ok(caller);
        }
        let e = self.envs.get(envid);
        if e.status == EnvStatus::Free || e.id != envid {
            return Err(Error::BadEnv);
        }
        if check_perm && e.id != caller && e.parent_id != caller {
            return Err(Error::BadEnv);
        }
        Ok(e.id)
    }

    /// Set up the page directory: the user portion starts empty and the
    /// two self-map slots expose the env's own page tables, writable
    /// through `VPT` and read-only through `UVPT`.
    fn env_setup_vm(&mut self) -> Result<u32> {
        let ppn = self.pm.page_alloc()?;
        self.pm.page_incref(ppn);
        let pgdir_pa = ppn << PGSHIFT;
        self.pm.write_u32(
            pgdir_pa + (pdx(VPT) as u32) * 4,
            pgdir_pa | (PteFlags::V | PteFlags::R).bits(),
        );
        self.pm
            .write_u32(pgdir_pa + (pdx(UVPT) as u32) * 4, pgdir_pa | PteFlags::V.bits());
        Ok(pgdir_pa)
    }

    /// Allocate an environment with a fresh address space. The trap
    /// frame starts at the user stack top, in user mode with interrupts
    /// enabled.
    pub fn env_alloc(&mut self, parent_id: EnvId) -> Result<EnvId> {
        let slot = *self.envs.free_list.last().ok_or(Error::NoFreeEnv)?;
        let pgdir = self.env_setup_vm()?;
        self.envs.free_list.pop();

        let id = self.envs.mkenvid(slot);
        let e = &mut self.envs.envs[slot];
        e.id = id;
        e.parent_id = parent_id;
        e.status = EnvStatus::Runnable;
        e.runs = 0;
        e.tf = TrapFrame::new();
        e.tf.regs[REG_SP] = USTACKTOP;
        e.tf.cp0_status = CP0_STATUS_USER;
        e.pgdir = pgdir;
        e.pgfault_entry = None;
        e.xstacktop = 0;
        e.ipc_recving = false;
        e.ipc_dstva = 0;
        e.ipc_from = 0;
        e.ipc_value = 0;
        e.ipc_perm = PteFlags::empty();
        Ok(id)
    }

    /// Allocate a runnable environment with one stack page mapped, the
    /// way the boot-time loader leaves a fresh program.
    pub fn env_create(&mut self) -> Result<EnvId> {
        let id = self.env_alloc(0)?;
        let pgdir = self.envs.get(id).pgdir;
        let stack = self.pm.page_alloc()?;
        crate::vmm::page_insert(
            &mut self.pm,
            pgdir,
            stack,
            USTACKTOP - crate::mmu::BY2PG,
            PteFlags::V | PteFlags::R,
        )?;
        Ok(id)
    }

    /// Release every user mapping, the page tables, the directory, and
    /// finally the table slot.
    pub fn env_free(&mut self, id: EnvId) {
        let slot = envx(id);
        let pgdir = self.envs.envs[slot].pgdir;
        log::info!(
            "[env] [{:08x}] free env {:08x}",
            self.cur.map(|c| self.envs.get(c).id).unwrap_or(0),
            id
        );
        for pdeno in 0..pdx(UTOP) {
            let pde = self.pm.read_u32(pgdir + (pdeno as u32) * 4);
            if !pte_flags(pde).contains(PteFlags::V) {
                continue;
            }
            for pteno in 0..1024u32 {
                let va = ((pdeno as u32) << PDSHIFT) | (pteno << PGSHIFT);
                page_remove(&mut self.pm, pgdir, va);
            }
            self.pm.write_u32(pgdir + (pdeno as u32) * 4, 0);
            self.pm.page_decref(pte_ppn(pde));
        }
        self.pm.page_decref(pgdir >> PGSHIFT);

        let e = &mut self.envs.envs[slot];
        e.pgdir = 0;
        e.status = EnvStatus::Free;
        e.ipc_recving = false;
        self.envs.free_list.push(slot);
    }

    /// Free `id`; when it was the current environment, the CPU is left
    /// idle for the scheduler to claim.
    pub fn env_destroy(&mut self, id: EnvId) {
        self.env_free(id);
        if self.cur == Some(id) {
            self.cur = None;
        }
    }

    pub fn env_ref(&self, id: EnvId) -> &Env {
        self.envs.get(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mmu::BY2PG;

    #[test]
    fn ids_encode_slot_and_generation() {
        let mut k = Kernel::new(64);
        let a = k.env_alloc(0).unwrap();
        let b = k.env_alloc(0).unwrap();
        assert_eq!(envx(a), 0);
        assert_eq!(envx(b), 1);
        assert_ne!(a, b);
        // A recycled slot gets a fresh generation.
        k.env_destroy(a);
        let c = k.env_alloc(0).unwrap();
        assert_eq!(envx(c), 0);
        assert_ne!(c, a);
    }

    #[test]
    fn envid2env_checks() {
        let mut k = Kernel::new(64);
        let parent = k.env_alloc(0).unwrap();
        let child = k.env_alloc(parent).unwrap();
        let other = k.env_alloc(0).unwrap();

        assert_eq!(k.envid2env(parent, 0, false), Ok(parent));
        assert_eq!(k.envid2env(parent, child, true), Ok(child));
        assert_eq!(k.envid2env(parent, parent, true), Ok(parent));
        assert_eq!(k.envid2env(parent, other, true), Err(Error::BadEnv));

        k.env_destroy(child);
        assert_eq!(k.envid2env(parent, child, false), Err(Error::BadEnv));
    }

    #[test]
    fn env_free_releases_every_frame() {
        let mut k = Kernel::new(64);
        let (used0, _) = k.pm.stats();
        let e = k.env_create().unwrap();
        let pgdir = k.env_ref(e).pgdir;
        // Map something extra in a second page table.
        let p = k.pm.page_alloc().unwrap();
        crate::vmm::page_insert(&mut k.pm, pgdir, p, 5 * crate::mmu::PDMAP + BY2PG, PteFlags::V | PteFlags::R)
            .unwrap();
        k.env_destroy(e);
        assert_eq!(k.pm.stats().0, used0);
    }

    #[test]
    fn every_live_env_resolves_to_itself() {
        let mut k = Kernel::new(64);
        let mut ids = alloc::vec::Vec::new();
        for _ in 0..8 {
            ids.push(k.env_alloc(0).unwrap());
        }
        for id in ids {
            assert_eq!(k.envid2env(0, id, false), Ok(id));
        }
    }
}
