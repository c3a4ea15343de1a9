//! End-to-end scenarios: a client environment driving the file-system
//! server over IPC, plus fork interacting with the descriptor layer.

use koto_os::env::REG_V0;
use koto_os::error::Error;
use koto_os::fd;
use koto_os::file;
use koto_os::fork;
use koto_os::fs::layout::{BY2BLK, NDIRECT, O_CREAT, O_RDONLY, O_RDWR, O_WRONLY};
use koto_os::ide::{DiskRef, MemDisk};
use koto_os::mkfs;
use koto_os::os::Os;

fn boot(nblocks: u32) -> (Os, koto_os::env::EnvId) {
    let disk = MemDisk::with_blocks(nblocks);
    mkfs::format(&disk, nblocks).unwrap();
    boot_on(disk)
}

fn boot_on(disk: DiskRef) -> (Os, koto_os::env::EnvId) {
    let mut os = Os::boot(disk, 4096).unwrap();
    let env = os.kernel.env_create().unwrap();
    (os, env)
}

#[test]
fn formatted_disk_comes_up_with_reserved_blocks() {
    let (os, _) = boot(256);
    let fs = &os.fs.fs;
    assert_eq!(fs.nblocks, 256);
    assert!(!fs.block_is_free(&os.kernel, 0));
    assert!(!fs.block_is_free(&os.kernel, 1));
    assert!(!fs.block_is_free(&os.kernel, 2));
    assert!(fs.block_is_free(&os.kernel, 3));
}

#[test]
fn create_write_close_reopen_read() {
    let (mut os, env) = boot(256);

    let fdnum = file::open(&mut os, env, "/a.txt", O_CREAT | O_RDWR).unwrap();
    assert_eq!(fd::write(&mut os, env, fdnum, b"hello").unwrap(), 5);
    fd::close(&mut os, env, fdnum).unwrap();

    let fdnum = file::open(&mut os, env, "/a.txt", O_RDONLY).unwrap();
    let mut buf = [0u8; 16];
    assert_eq!(fd::read(&mut os, env, fdnum, &mut buf).unwrap(), 5);
    assert_eq!(&buf[..5], b"hello");
    let st = fd::fstat(&mut os, env, fdnum).unwrap();
    assert_eq!(st.size, 5);
    assert_eq!(st.name, "a.txt");
    assert!(!st.isdir);
    fd::close(&mut os, env, fdnum).unwrap();
}

#[test]
fn five_thousand_bytes_stay_in_direct_blocks() {
    let (mut os, env) = boot(256);
    let data = vec![0x5Au8; 5000];

    let fdnum = file::open(&mut os, env, "/big", O_CREAT | O_RDWR).unwrap();
    assert_eq!(fd::write(&mut os, env, fdnum, &data).unwrap(), 5000);
    fd::close(&mut os, env, fdnum).unwrap();

    // Inspect the record through the server's own file layer.
    let f = os.fs.fs.file_open(&mut os.kernel, "/big").unwrap();
    let rec = os.fs.fs.file_load(&mut os.kernel, f.loc).unwrap();
    assert_eq!(rec.size, 5000);
    assert_ne!(rec.direct[0], 0);
    assert_ne!(rec.direct[1], 0);
    for i in 2..NDIRECT {
        assert_eq!(rec.direct[i], 0);
    }
    assert_eq!(rec.indirect, 0);
}

#[test]
fn remove_makes_file_unreachable_and_frees_blocks() {
    let (mut os, env) = boot(256);

    let fdnum = file::open(&mut os, env, "/a.txt", O_CREAT | O_RDWR).unwrap();
    fd::write(&mut os, env, fdnum, b"doomed data").unwrap();
    fd::close(&mut os, env, fdnum).unwrap();

    let f = os.fs.fs.file_open(&mut os.kernel, "/a.txt").unwrap();
    let data_block = os.fs.fs.file_load(&mut os.kernel, f.loc).unwrap().direct[0];
    assert_ne!(data_block, 0);

    file::remove(&mut os, env, "/a.txt").unwrap();
    assert_eq!(
        file::open(&mut os, env, "/a.txt", O_RDONLY),
        Err(Error::NotFound)
    );
    assert!(os.fs.fs.block_is_free(&os.kernel, data_block));
}

#[test]
fn fork_isolates_writes_both_ways() {
    let (mut os, env) = boot(64);
    let flags = koto_os::mmu::PteFlags::V | koto_os::mmu::PteFlags::R;
    os.kernel.sys_mem_alloc(env, 0, 0x10_0000, flags).unwrap();
    os.kernel.user_write_u32(env, 0x10_0000, 0x0BAD_F00D).unwrap();

    let child = fork::fork(&mut os.kernel, env).unwrap();
    assert_eq!(os.kernel.env_ref(child).tf.regs[REG_V0], 0);

    os.kernel.user_write_u32(env, 0x10_0000, 0xDEAD_BEEF).unwrap();
    assert_eq!(os.kernel.user_read_u32(child, 0x10_0000).unwrap(), 0x0BAD_F00D);
    assert_eq!(os.kernel.user_read_u32(env, 0x10_0000).unwrap(), 0xDEAD_BEEF);
}

#[test]
fn read_four_bytes_advances_offset() {
    let (mut os, env) = boot(256);

    let fdnum = file::open(&mut os, env, "/x", O_CREAT | O_RDWR).unwrap();
    fd::write(&mut os, env, fdnum, b"ABCD\0").unwrap();
    fd::close(&mut os, env, fdnum).unwrap();

    let fdnum = file::open(&mut os, env, "/x", O_RDWR).unwrap();
    let mut buf = [0u8; 4];
    assert_eq!(fd::read(&mut os, env, fdnum, &mut buf).unwrap(), 4);
    assert_eq!(&buf, b"ABCD");
    let fdva = fd::fd_lookup(&os.kernel, env, fdnum).unwrap();
    assert_eq!(fd::fd_offset(&os.kernel, env, fdva).unwrap(), 4);
    fd::close(&mut os, env, fdnum).unwrap();
}

#[test]
fn data_survives_sync_and_reboot() {
    let disk = MemDisk::with_blocks(256);
    mkfs::format(&disk, 256).unwrap();

    {
        let (mut os, env) = boot_on(disk.clone());
        let fdnum = file::open(&mut os, env, "/persist", O_CREAT | O_RDWR).unwrap();
        fd::write(&mut os, env, fdnum, b"still here after reboot").unwrap();
        fd::close(&mut os, env, fdnum).unwrap();
        file::sync(&mut os, env).unwrap();
    }

    let (mut os, env) = boot_on(disk);
    let fdnum = file::open(&mut os, env, "/persist", O_RDONLY).unwrap();
    let mut buf = [0u8; 64];
    let n = fd::read(&mut os, env, fdnum, &mut buf).unwrap();
    assert_eq!(&buf[..n], b"still here after reboot");
}

#[test]
fn write_spanning_blocks_reads_back_intact() {
    let (mut os, env) = boot(256);
    let mut data = vec![0u8; 3 * BY2BLK as usize + 100];
    for (i, b) in data.iter_mut().enumerate() {
        *b = (i % 251) as u8;
    }

    let fdnum = file::open(&mut os, env, "/span", O_CREAT | O_RDWR).unwrap();
    assert_eq!(fd::write(&mut os, env, fdnum, &data).unwrap(), data.len());
    fd::close(&mut os, env, fdnum).unwrap();

    let fdnum = file::open(&mut os, env, "/span", O_RDONLY).unwrap();
    let mut back = vec![0u8; data.len()];
    assert_eq!(fd::readn(&mut os, env, fdnum, &mut back).unwrap(), data.len());
    assert_eq!(back, data);
    fd::close(&mut os, env, fdnum).unwrap();
}

#[test]
fn seek_repositions_reads() {
    let (mut os, env) = boot(256);
    let fdnum = file::open(&mut os, env, "/seek", O_CREAT | O_RDWR).unwrap();
    fd::write(&mut os, env, fdnum, b"0123456789").unwrap();
    fd::seek(&mut os.kernel, env, fdnum, 6).unwrap();
    let mut buf = [0u8; 4];
    assert_eq!(fd::read(&mut os, env, fdnum, &mut buf).unwrap(), 4);
    assert_eq!(&buf, b"6789");
    fd::close(&mut os, env, fdnum).unwrap();
}

#[test]
fn write_on_readonly_descriptor_is_rejected() {
    let (mut os, env) = boot(256);
    let fdnum = file::open(&mut os, env, "/ro", O_CREAT | O_RDWR).unwrap();
    fd::write(&mut os, env, fdnum, b"data").unwrap();
    fd::close(&mut os, env, fdnum).unwrap();

    let fdnum = file::open(&mut os, env, "/ro", O_RDONLY).unwrap();
    assert_eq!(fd::write(&mut os, env, fdnum, b"nope"), Err(Error::Invalid));
    fd::close(&mut os, env, fdnum).unwrap();

    let fdnum = file::open(&mut os, env, "/ro", O_WRONLY).unwrap();
    let mut buf = [0u8; 4];
    assert_eq!(fd::read(&mut os, env, fdnum, &mut buf), Err(Error::Invalid));
    fd::close(&mut os, env, fdnum).unwrap();
}

#[test]
fn open_table_slot_is_recycled_with_a_fresh_generation() {
    let (mut os, env) = boot(256);

    let fdnum = file::open(&mut os, env, "/gen", O_CREAT | O_RDWR).unwrap();
    let fdva = fd::fd_lookup(&os.kernel, env, fdnum).unwrap();
    let first = file::filefd_fileid(&os.kernel, env, fdva).unwrap();
    fd::close(&mut os, env, fdnum).unwrap();

    let fdnum = file::open(&mut os, env, "/gen", O_RDONLY).unwrap();
    let fdva = fd::fd_lookup(&os.kernel, env, fdnum).unwrap();
    let second = file::filefd_fileid(&os.kernel, env, fdva).unwrap();
    // Same slot, bumped generation.
    assert_eq!(first % 1024, second % 1024);
    assert_ne!(first, second);
    fd::close(&mut os, env, fdnum).unwrap();
}

#[test]
fn two_clients_interleave_against_one_server() {
    let (mut os, a) = boot(256);
    let b = os.kernel.env_create().unwrap();

    let fd_a = file::open(&mut os, a, "/from_a", O_CREAT | O_RDWR).unwrap();
    let fd_b = file::open(&mut os, b, "/from_b", O_CREAT | O_RDWR).unwrap();
    fd::write(&mut os, a, fd_a, b"alpha").unwrap();
    fd::write(&mut os, b, fd_b, b"bravo").unwrap();
    fd::close(&mut os, a, fd_a).unwrap();
    fd::close(&mut os, b, fd_b).unwrap();

    let fd_b = file::open(&mut os, b, "/from_a", O_RDONLY).unwrap();
    let mut buf = [0u8; 5];
    fd::read(&mut os, b, fd_b, &mut buf).unwrap();
    assert_eq!(&buf, b"alpha");
    fd::close(&mut os, b, fd_b).unwrap();
}

#[test]
fn dup_shares_the_descriptor_and_its_offset() {
    let (mut os, env) = boot(256);
    let fdnum = file::open(&mut os, env, "/dup", O_CREAT | O_RDWR).unwrap();
    fd::write(&mut os, env, fdnum, b"0123456789").unwrap();
    fd::seek(&mut os.kernel, env, fdnum, 0).unwrap();

    let other = fd::dup(&mut os, env, fdnum, 7).unwrap();
    let mut buf = [0u8; 4];
    fd::read(&mut os, env, fdnum, &mut buf).unwrap();
    assert_eq!(&buf, b"0123");
    // The dup'd descriptor shares the page, so the offset moved too.
    fd::read(&mut os, env, other, &mut buf).unwrap();
    assert_eq!(&buf, b"4567");

    fd::close(&mut os, env, other).unwrap();
    fd::close(&mut os, env, fdnum).unwrap();
}

#[test]
fn forked_child_shares_library_descriptor_pages() {
    let (mut os, env) = boot(256);
    let fdnum = file::open(&mut os, env, "/shared", O_CREAT | O_RDWR).unwrap();
    fd::write(&mut os, env, fdnum, b"parent and child").unwrap();
    fd::seek(&mut os.kernel, env, fdnum, 0).unwrap();

    let child = fork::fork(&mut os.kernel, env).unwrap();

    // The Filefd page is LIBRARY, so the child reads through the same
    // descriptor and the offset is shared with the parent.
    let mut buf = [0u8; 6];
    fd::read(&mut os, child, fdnum, &mut buf).unwrap();
    assert_eq!(&buf, b"parent");
    let fdva = fd::fd_lookup(&os.kernel, env, fdnum).unwrap();
    assert_eq!(fd::fd_offset(&os.kernel, env, fdva).unwrap(), 6);

    fd::close(&mut os, env, fdnum).unwrap();
}

#[test]
fn console_round_trip() {
    let (mut os, env) = boot(64);
    let fdnum = koto_os::console::opencons(&mut os, env).unwrap();
    fd::write(&mut os, env, fdnum, b"to the console\n").unwrap();
    assert_eq!(os.kernel.console.take_output(), "to the console\n");

    os.kernel.console.feed_input(b"typed");
    let mut buf = [0u8; 16];
    let n = fd::read(&mut os, env, fdnum, &mut buf).unwrap();
    assert_eq!(&buf[..n], b"typed");
    fd::close(&mut os, env, fdnum).unwrap();
}

#[test]
fn truncate_then_regrow_through_the_server() {
    let (mut os, env) = boot(256);
    let fdnum = file::open(&mut os, env, "/t", O_CREAT | O_RDWR).unwrap();
    fd::write(&mut os, env, fdnum, b"a long first version").unwrap();
    file::ftruncate(&mut os, env, fdnum, 0).unwrap();
    let st = fd::fstat(&mut os, env, fdnum).unwrap();
    assert_eq!(st.size, 0);

    fd::seek(&mut os.kernel, env, fdnum, 0).unwrap();
    fd::write(&mut os, env, fdnum, b"v2").unwrap();
    fd::seek(&mut os.kernel, env, fdnum, 0).unwrap();
    let mut buf = [0u8; 8];
    let n = fd::read(&mut os, env, fdnum, &mut buf).unwrap();
    assert_eq!(&buf[..n], b"v2");
    fd::close(&mut os, env, fdnum).unwrap();
}

#[test]
fn stat_by_path() {
    let (mut os, env) = boot(256);
    let fdnum = file::open(&mut os, env, "/st", O_CREAT | O_RDWR).unwrap();
    fd::write(&mut os, env, fdnum, b"123").unwrap();
    fd::close(&mut os, env, fdnum).unwrap();

    let st = fd::stat(&mut os, env, "/st").unwrap();
    assert_eq!(st.size, 3);
    assert_eq!(st.name, "st");
}
