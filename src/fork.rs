//! User-level copy-on-write fork.
//!
//! Everything here is user code: it inspects its own page tables
//! through the `UVPT` self-map window and builds the child purely out
//! of syscalls. The kernel's only contributions are `sys_env_alloc`
//! and the page-fault upcall.

use crate::env::EnvId;
use crate::error::Result;
use crate::mmu::{
    pdx, pte_flags, round_down, vpn, PteFlags, BY2PG, PFTEMP, USTACKTOP, UVPD, UVPT, UXSTACKTOP,
};
use crate::Kernel;

/// Read `vpt[pn]`, the caller's own PTE for virtual page `pn`,
/// through the self-map window.
pub fn vpt_entry(k: &Kernel, env: EnvId, pn: u32) -> Result<u32> {
    k.user_read_u32(env, UVPT + pn * 4)
}

/// Read `vpd[pdeno]`, the caller's own PDE, through the self-map.
pub fn vpd_entry(k: &Kernel, env: EnvId, pdeno: usize) -> Result<u32> {
    k.user_read_u32(env, UVPD + (pdeno as u32) * 4)
}

/// Install the copy-on-write fault handler, allocating the exception
/// stack on first use.
pub fn set_pgfault_handler(k: &mut Kernel, env: EnvId) -> Result<()> {
    if k.env_ref(env).xstacktop == 0 {
        k.sys_mem_alloc(env, 0, UXSTACKTOP - BY2PG, PteFlags::V | PteFlags::R)?;
    }
    k.sys_set_pgfault_handler(env, 0, pgfault, UXSTACKTOP)
}

/// The page-fault handler: turn a faulting copy-on-write page into a
/// private writable copy. Entered on the exception stack with the
/// faulting address; a fault on anything that is not copy-on-write is
/// a bug in the program, not a recoverable condition.
pub fn pgfault(k: &mut Kernel, env: EnvId, va: u32) {
    let pte = vpt_entry(k, env, vpn(va)).expect("pgfault: cannot read own pte");
    let mut perm = pte_flags(pte);
    if !perm.contains(PteFlags::COW) {
        panic!("pgfault: not a copy-on-write page at {:08x}", va);
    }
    perm.remove(PteFlags::COW);
    perm.insert(PteFlags::R);

    // Fresh frame at the scratch address, copy through the still-shared
    // mapping, then swing the faulting page over and drop the scratch.
    let page = round_down(va, BY2PG);
    k.sys_mem_alloc(env, 0, PFTEMP, perm)
        .expect("pgfault: mem_alloc");
    let mut buf = [0u8; BY2PG as usize];
    k.user_read(env, page, &mut buf).expect("pgfault: read");
    k.user_write(env, PFTEMP, &buf).expect("pgfault: write");
    k.sys_mem_map(env, 0, PFTEMP, 0, page, perm)
        .expect("pgfault: mem_map");
    k.sys_mem_unmap(env, 0, PFTEMP).expect("pgfault: mem_unmap");
}

/// Share one page with the child. Writable or copy-on-write pages
/// (unless marked `LIBRARY`) become copy-on-write in both address
/// spaces: child first, then our own mapping is downgraded to match.
fn duppage(k: &mut Kernel, env: EnvId, child: EnvId, pn: u32) -> Result<()> {
    let va = pn * BY2PG;
    let mut perm = pte_flags(vpt_entry(k, env, pn)?);
    if (perm.contains(PteFlags::COW) || perm.contains(PteFlags::R))
        && !perm.contains(PteFlags::LIBRARY)
    {
        perm.remove(PteFlags::R);
        perm.insert(PteFlags::COW);
    }
    k.sys_mem_map(env, 0, va, child, va, perm)?;
    k.sys_mem_map(env, 0, va, 0, va, perm)?;
    Ok(())
}

/// Create a child sharing our address space copy-on-write.
///
/// Returns the child's env id. The child observes a return value of 0
/// through `v0` in its trap frame; read-only pages stay physically
/// shared, everything writable is snapshotted lazily by [`pgfault`].
pub fn fork(k: &mut Kernel, env: EnvId) -> Result<EnvId> {
    set_pgfault_handler(k, env)?;
    let child = k.sys_env_alloc(env)?;
    // The child needs its own exception stack before its first fault.
    k.sys_mem_alloc(env, child, UXSTACKTOP - BY2PG, PteFlags::V | PteFlags::R)?;

    // Walk every mapped page below the user stack page (the stack page
    // itself was already copied by sys_env_alloc), skipping whole page
    // tables that were never populated.
    let mut pn = 0u32;
    let top = vpn(USTACKTOP - BY2PG);
    while pn < top {
        if vpd_entry(k, env, pdx(pn * BY2PG))? & PteFlags::V.bits() == 0 {
            pn += 1024;
            continue;
        }
        if vpt_entry(k, env, pn)? & PteFlags::V.bits() != 0 {
            duppage(k, env, child, pn)?;
        }
        pn += 1;
    }

    k.sys_set_env_status(env, child, crate::env::EnvStatus::Runnable)?;
    Ok(child)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::EnvStatus;
    use crate::mmu::PteFlags as F;

    #[test]
    fn self_map_reads_own_ptes() {
        let mut k = Kernel::new(128);
        let e = k.env_create().unwrap();
        k.sys_mem_alloc(e, 0, 0x40_0000, F::V | F::R).unwrap();
        let pte = vpt_entry(&k, e, vpn(0x40_0000)).unwrap();
        assert!(pte_flags(pte).contains(F::V | F::R));
        let pde = vpd_entry(&k, e, pdx(0x40_0000)).unwrap();
        assert!(pte_flags(pde).contains(F::V));
    }

    #[test]
    fn fork_shares_pages_copy_on_write() {
        let mut k = Kernel::new(128);
        let parent = k.env_create().unwrap();
        k.sys_mem_alloc(parent, 0, 0x1000, F::V | F::R).unwrap();
        k.user_write(parent, 0x1000, &0xCAFE_F00Du32.to_le_bytes())
            .unwrap();

        let child = fork(&mut k, parent).unwrap();
        assert_eq!(k.env_ref(child).status, EnvStatus::Runnable);
        assert_eq!(k.env_ref(child).tf.regs[crate::env::REG_V0], 0);

        // Both mappings are now COW onto one shared frame.
        let pte = vpt_entry(&k, parent, vpn(0x1000)).unwrap();
        assert!(pte_flags(pte).contains(F::COW));
        assert!(!pte_flags(pte).contains(F::R));
        assert_eq!(k.pageref(parent, 0x1000), 2);
    }

    #[test]
    fn cow_write_isolates_parent_and_child() {
        let mut k = Kernel::new(128);
        let parent = k.env_create().unwrap();
        k.sys_mem_alloc(parent, 0, 0x1000, F::V | F::R).unwrap();
        k.user_write(parent, 0x1000, &0x1111_1111u32.to_le_bytes())
            .unwrap();
        let child = fork(&mut k, parent).unwrap();

        // Parent writes: resolves its fault, child still sees old data.
        k.user_write(parent, 0x1000, &0xDEAD_BEEFu32.to_le_bytes())
            .unwrap();
        assert_eq!(k.user_read_u32(child, 0x1000).unwrap(), 0x1111_1111);
        assert_eq!(k.user_read_u32(parent, 0x1000).unwrap(), 0xDEAD_BEEF);

        // Exactly one fresh frame: each side now holds its own.
        assert_eq!(k.pageref(parent, 0x1000), 1);
        assert_eq!(k.pageref(child, 0x1000), 1);

        // Child's own write works and stays private too.
        k.user_write(child, 0x1000, &0x2222_2222u32.to_le_bytes())
            .unwrap();
        assert_eq!(k.user_read_u32(parent, 0x1000).unwrap(), 0xDEAD_BEEF);
        assert_eq!(k.user_read_u32(child, 0x1000).unwrap(), 0x2222_2222);
    }

    #[test]
    fn library_pages_stay_shared_writable() {
        let mut k = Kernel::new(128);
        let parent = k.env_create().unwrap();
        k.sys_mem_alloc(parent, 0, 0x2000, F::V | F::R | F::LIBRARY)
            .unwrap();
        let child = fork(&mut k, parent).unwrap();

        k.user_write(parent, 0x2000, b"both sides see this").unwrap();
        let mut buf = [0u8; 19];
        k.user_read(child, 0x2000, &mut buf).unwrap();
        assert_eq!(&buf, b"both sides see this");
        assert_eq!(k.pageref(parent, 0x2000), 2);
    }

    #[test]
    fn read_only_pages_remain_physically_shared() {
        let mut k = Kernel::new(128);
        let parent = k.env_create().unwrap();
        k.sys_mem_alloc(parent, 0, 0x5000, F::V | F::R).unwrap();
        // Downgrade to read-only before forking (code-page shape).
        k.sys_mem_map(parent, 0, 0x5000, 0, 0x5000, F::V).unwrap();
        let child = fork(&mut k, parent).unwrap();
        assert_eq!(k.pageref(parent, 0x5000), 2);
        let pte = vpt_entry(&k, child, vpn(0x5000)).unwrap();
        assert!(!pte_flags(pte).contains(F::COW));
    }

    #[test]
    #[should_panic(expected = "not a copy-on-write page")]
    fn pgfault_on_non_cow_page_is_fatal() {
        let mut k = Kernel::new(128);
        let e = k.env_create().unwrap();
        k.sys_mem_alloc(e, 0, 0x3000, F::V | F::R).unwrap();
        pgfault(&mut k, e, 0x3000);
    }
}
