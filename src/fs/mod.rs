//! The file-system server side: block cache, file and directory layer,
//! and the request loop. All of it is user code running in the server
//! environment's address space; disk blocks are pages mapped at fixed
//! addresses and every access goes through the kernel like any other
//! user memory.

pub mod cache;
pub mod file;
pub mod layout;
pub mod serv;

use alloc::collections::BTreeSet;

use crate::env::EnvId;

/// Per-server file-system state: which environment we are, which disk
/// we own, what the super block said, and which cached blocks have
/// been written since their last flush.
pub struct Fs {
    pub env: EnvId,
    pub diskno: u32,
    /// Total blocks on disk; 0 until the super block is read.
    pub nblocks: u32,
    /// Number of bitmap blocks; 0 until the bitmap is loaded.
    pub nbitmap: u32,
    dirty: BTreeSet<u32>,
}

impl Fs {
    pub fn new(env: EnvId, diskno: u32) -> Self {
        Self {
            env,
            diskno,
            nblocks: 0,
            nbitmap: 0,
            dirty: BTreeSet::new(),
        }
    }
}
