//! Page geometry and the user half of the virtual memory map.
//!
//! The machine is MIPS-class: 32-bit addresses, 4 KiB pages, a two-level
//! page table with 1024-entry directories and tables. Everything above
//! `ULIM` belongs to the kernel and is identical in every address space.

use bitflags::bitflags;

pub const BY2PG: u32 = 4096;
pub const PGSHIFT: u32 = 12;
pub const PDSHIFT: u32 = 22;
/// Bytes mapped by one page-directory entry (one page table).
pub const PDMAP: u32 = 1 << PDSHIFT;

/// Top of the user segment; the kernel lives above.
pub const ULIM: u32 = 0x8000_0000;
/// Kernel-writable window onto the current page tables.
pub const VPT: u32 = 0x7fc0_0000;
/// User-readable window onto the current page tables.
pub const UVPT: u32 = 0x7f80_0000;
/// Top of the space an environment may manipulate with syscalls.
pub const UTOP: u32 = 0x7f40_0000;
/// One byte past the exception stack.
pub const UXSTACKTOP: u32 = UTOP;
/// Top of the normal user stack. The page between the two stacks is
/// left unmapped so a runaway user stack faults instead of corrupting
/// the exception stack.
pub const USTACKTOP: u32 = UTOP - 2 * BY2PG;
/// Scratch page used by the copy-on-write fault resolver.
pub const PFTEMP: u32 = USTACKTOP;

/// The page directory seen as an array of PDEs inside the user-readable
/// self-map window.
pub const UVPD: u32 = UVPT + (UVPT >> 10);

bitflags! {
    /// Low permission bits of a page-table entry.
    ///
    /// `COW` and `R` never coexist in an installed mapping; a write to a
    /// `COW` page must produce a private frame before it can proceed.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: u32 {
        /// Entry is valid.
        const V = 0x0001;
        /// Page is writable.
        const R = 0x0002;
        /// Copy-on-write: shared until the first write.
        const COW = 0x0004;
        /// Shared-writable library page; never snapshotted by fork.
        const LIBRARY = 0x0008;
    }
}

/// Mask of the permission bits within a PTE.
pub const PTE_FLAG_MASK: u32 = 0xfff;

#[inline]
pub fn pdx(va: u32) -> usize {
    ((va >> PDSHIFT) & 0x3ff) as usize
}

#[inline]
pub fn ptx(va: u32) -> usize {
    ((va >> PGSHIFT) & 0x3ff) as usize
}

/// Virtual page number of `va`.
#[inline]
pub fn vpn(va: u32) -> u32 {
    va >> PGSHIFT
}

/// Physical frame number encoded in a PTE (or a PDE).
#[inline]
pub fn pte_ppn(pte: u32) -> u32 {
    pte >> PGSHIFT
}

#[inline]
pub fn pte_flags(pte: u32) -> PteFlags {
    PteFlags::from_bits_truncate(pte & PTE_FLAG_MASK)
}

#[inline]
pub fn make_pte(ppn: u32, flags: PteFlags) -> u32 {
    (ppn << PGSHIFT) | flags.bits()
}

#[inline]
pub fn round_down(va: u32, align: u32) -> u32 {
    va & !(align - 1)
}

#[inline]
pub fn round_up(va: u32, align: u32) -> u32 {
    (va + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_consistent() {
        assert_eq!(UVPT % PDMAP, 0);
        assert_eq!(VPT % PDMAP, 0);
        assert!(UTOP < UVPT);
        assert_eq!(USTACKTOP, UTOP - 2 * BY2PG);
        // The self-map windows must not be reachable through the
        // user-manipulable part of the address space.
        assert!(UTOP <= UVPT && UTOP <= VPT);
    }

    #[test]
    fn index_extraction() {
        let va = 0x7f80_3004;
        assert_eq!(pdx(va), 0x1fe);
        assert_eq!(ptx(va), 3);
        assert_eq!(vpn(va), va >> 12);
        assert_eq!(round_down(va, BY2PG), 0x7f80_3000);
        assert_eq!(round_up(va, BY2PG), 0x7f80_4000);
    }

    #[test]
    fn self_map_window_math() {
        // Reading UVPD + pdx*4 must land inside the UVPT window on the
        // page-table page that is the directory itself.
        assert_eq!(pdx(UVPD), pdx(UVPT));
        assert_eq!(ptx(UVPD), pdx(UVPT));
        // vpt[vpn] address for some va.
        let va = 0x0040_2000;
        let vpt_slot = UVPT + vpn(va) * 4;
        assert_eq!(pdx(vpt_slot), pdx(UVPT));
        assert_eq!(ptx(vpt_slot), pdx(va));
    }

    #[test]
    fn pte_packing() {
        let pte = make_pte(0x1234, PteFlags::V | PteFlags::R);
        assert_eq!(pte_ppn(pte), 0x1234);
        assert_eq!(pte_flags(pte), PteFlags::V | PteFlags::R);
    }
}
