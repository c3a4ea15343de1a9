//! Two-level page tables stored inside the physical arena.
//!
//! A page directory is one frame of 1024 little-endian PDEs; each valid
//! PDE points at one frame of 1024 PTEs. All walks operate on real
//! memory in [`PhysMem`], which is what makes the self-map window work:
//! an address inside `UVPT` resolves through the directory's own slot
//! and lands on a page-table frame.

use crate::error::{Error, Result};
use crate::mmu::{make_pte, pdx, pte_flags, pte_ppn, ptx, PteFlags, BY2PG, PGSHIFT};
use crate::pmm::PhysMem;

/// Find the physical address of the PTE for `va`, optionally creating
/// the page table on the way. Returns `None` when the table is absent
/// and `create` is false.
pub fn pgdir_walk(
    pm: &mut PhysMem,
    pgdir_pa: u32,
    va: u32,
    create: bool,
) -> Result<Option<u32>> {
    let pde_pa = pgdir_pa + (pdx(va) as u32) * 4;
    let pde = pm.read_u32(pde_pa);
    let table_ppn = if pte_flags(pde).contains(PteFlags::V) {
        pte_ppn(pde)
    } else {
        if !create {
            return Ok(None);
        }
        let ppn = pm.page_alloc()?;
        pm.page_incref(ppn);
        // No write bit: page tables stay read-only when user code looks
        // at them through the self-map window.
        pm.write_u32(pde_pa, make_pte(ppn, PteFlags::V));
        ppn
    };
    Ok(Some((table_ppn << PGSHIFT) + (ptx(va) as u32) * 4))
}

fn pgdir_lookup_pte(pm: &PhysMem, pgdir_pa: u32, va: u32) -> Option<u32> {
    let pde = pm.read_u32(pgdir_pa + (pdx(va) as u32) * 4);
    if !pte_flags(pde).contains(PteFlags::V) {
        return None;
    }
    Some((pte_ppn(pde) << PGSHIFT) + (ptx(va) as u32) * 4)
}

/// Install `ppn` at `va` with `perm | V`, taking a reference.
///
/// Re-inserting the same frame at the same address only updates the
/// permission bits; the refcount stays untouched. A different frame
/// already mapped there is removed first.
pub fn page_insert(
    pm: &mut PhysMem,
    pgdir_pa: u32,
    ppn: u32,
    va: u32,
    perm: PteFlags,
) -> Result<()> {
    let pte_pa = pgdir_walk(pm, pgdir_pa, va, true)?.ok_or(Error::NoMem)?;
    let pte = pm.read_u32(pte_pa);
    if pte_flags(pte).contains(PteFlags::V) {
        if pte_ppn(pte) == ppn {
            pm.write_u32(pte_pa, make_pte(ppn, perm | PteFlags::V));
            return Ok(());
        }
        page_remove(pm, pgdir_pa, va);
    }
    pm.page_incref(ppn);
    pm.write_u32(pte_pa, make_pte(ppn, perm | PteFlags::V));
    Ok(())
}

/// Drop the mapping at `va`; silent when nothing is mapped.
pub fn page_remove(pm: &mut PhysMem, pgdir_pa: u32, va: u32) {
    if let Some(pte_pa) = pgdir_lookup_pte(pm, pgdir_pa, va) {
        let pte = pm.read_u32(pte_pa);
        if pte_flags(pte).contains(PteFlags::V) {
            pm.write_u32(pte_pa, 0);
            pm.page_decref(pte_ppn(pte));
        }
    }
}

/// The frame and flags mapped at `va`, if any.
pub fn page_lookup(pm: &PhysMem, pgdir_pa: u32, va: u32) -> Option<(u32, PteFlags)> {
    let pte_pa = pgdir_lookup_pte(pm, pgdir_pa, va)?;
    let pte = pm.read_u32(pte_pa);
    let flags = pte_flags(pte);
    if !flags.contains(PteFlags::V) {
        return None;
    }
    Some((pte_ppn(pte), flags))
}

/// Translate a virtual address to a physical one.
pub fn translate(pm: &PhysMem, pgdir_pa: u32, va: u32) -> Option<(u32, PteFlags)> {
    let (ppn, flags) = page_lookup(pm, pgdir_pa, va & !(BY2PG - 1))?;
    Some(((ppn << PGSHIFT) | (va & (BY2PG - 1)), flags))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mmu::{PteFlags as F, UVPD, UVPT};

    fn new_space(npage: u32) -> (PhysMem, u32) {
        let mut pm = PhysMem::new(npage);
        let pgdir = pm.page_alloc().unwrap();
        pm.page_incref(pgdir);
        (pm, pgdir << PGSHIFT)
    }

    #[test]
    fn insert_lookup_remove() {
        let (mut pm, pgdir) = new_space(8);
        let p = pm.page_alloc().unwrap();
        page_insert(&mut pm, pgdir, p, 0x40_0000, F::V | F::R).unwrap();
        assert_eq!(pm.page_refcount(p), 1);
        let (ppn, flags) = page_lookup(&pm, pgdir, 0x40_0000).unwrap();
        assert_eq!(ppn, p);
        assert!(flags.contains(F::R));
        page_remove(&mut pm, pgdir, 0x40_0000);
        assert!(page_lookup(&pm, pgdir, 0x40_0000).is_none());
        assert_eq!(pm.page_refcount(p), 0);
        // Removing again is silent.
        page_remove(&mut pm, pgdir, 0x40_0000);
    }

    #[test]
    fn reinsert_same_frame_is_idempotent() {
        let (mut pm, pgdir) = new_space(8);
        let p = pm.page_alloc().unwrap();
        page_insert(&mut pm, pgdir, p, 0x1000, F::V | F::R).unwrap();
        page_insert(&mut pm, pgdir, p, 0x1000, F::V | F::COW).unwrap();
        assert_eq!(pm.page_refcount(p), 1);
        let (_, flags) = page_lookup(&pm, pgdir, 0x1000).unwrap();
        assert!(flags.contains(F::COW) && !flags.contains(F::R));
    }

    #[test]
    fn insert_over_other_frame_replaces_it() {
        let (mut pm, pgdir) = new_space(8);
        let a = pm.page_alloc().unwrap();
        let b = pm.page_alloc().unwrap();
        // Hold b so the replaced insert cannot recycle it mid-flight.
        pm.page_incref(b);
        page_insert(&mut pm, pgdir, a, 0x1000, F::V | F::R).unwrap();
        page_insert(&mut pm, pgdir, b, 0x1000, F::V | F::R).unwrap();
        assert_eq!(pm.page_refcount(a), 0);
        assert_eq!(pm.page_refcount(b), 2);
        assert_eq!(page_lookup(&pm, pgdir, 0x1000).unwrap().0, b);
    }

    #[test]
    fn shared_frame_counts_both_mappings() {
        let (mut pm, pgdir) = new_space(8);
        let p = pm.page_alloc().unwrap();
        page_insert(&mut pm, pgdir, p, 0x1000, F::V | F::R).unwrap();
        page_insert(&mut pm, pgdir, p, 0x2000, F::V).unwrap();
        assert_eq!(pm.page_refcount(p), 2);
    }

    #[test]
    fn self_map_exposes_ptes() {
        let (mut pm, pgdir_pa) = new_space(8);
        // Install the user-readable self-map slot the way env_setup_vm does.
        let pde_pa = pgdir_pa + (pdx(UVPT) as u32) * 4;
        pm.write_u32(pde_pa, pgdir_pa | F::V.bits());
        let p = pm.page_alloc().unwrap();
        page_insert(&mut pm, pgdir_pa, p, 0x40_2000, F::V | F::R).unwrap();

        // vpt[vpn(va)] read through ordinary translation.
        let slot_va = UVPT + crate::mmu::vpn(0x40_2000) * 4;
        let (pa, _) = translate(&pm, pgdir_pa, slot_va).unwrap();
        let pte = pm.read_u32(pa);
        assert_eq!(pte_ppn(pte), p);
        assert!(pte_flags(pte).contains(F::R));

        // vpd[pdx(va)] sees the page-directory entry.
        let pde_va = UVPD + (pdx(0x40_2000) as u32) * 4;
        let (pa, _) = translate(&pm, pgdir_pa, pde_va).unwrap();
        assert!(pte_flags(pm.read_u32(pa)).contains(F::V));
    }
}
