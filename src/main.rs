//! Demo: boot the machine, format a disk, and drive the whole stack
//! from a client environment: files over IPC, then a fork with
//! copy-on-write isolation.

use koto_os::env::REG_V0;
use koto_os::fd;
use koto_os::file;
use koto_os::fork;
use koto_os::fs::layout::{O_CREAT, O_RDONLY, O_RDWR};
use koto_os::ide::MemDisk;
use koto_os::mkfs;
use koto_os::os::Os;

fn main() {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    // A 1 MiB disk: 256 blocks.
    let disk = MemDisk::with_blocks(256);
    let report = mkfs::format(&disk, 256).expect("format");
    println!(
        "formatted: {} blocks, {} free",
        report.nblocks, report.free_blocks
    );

    let mut os = Os::boot(disk, 2048).expect("boot");
    let env = os.kernel.env_create().expect("env_create");

    // Create a file, write it, read it back.
    let fdnum = file::open(&mut os, env, "/motd", O_CREAT | O_RDWR).expect("open");
    let n = fd::write(&mut os, env, fdnum, b"Hello from the file server!\n").expect("write");
    println!("wrote {} bytes to /motd", n);
    fd::close(&mut os, env, fdnum).expect("close");

    let fdnum = file::open(&mut os, env, "/motd", O_RDONLY).expect("reopen");
    let mut buf = [0u8; 64];
    let n = fd::read(&mut os, env, fdnum, &mut buf).expect("read");
    print!("read {} bytes back: {}", n, String::from_utf8_lossy(&buf[..n]));
    let st = fd::fstat(&mut os, env, fdnum).expect("fstat");
    println!("stat: name={} size={} dir={}", st.name, st.size, st.isdir);
    fd::close(&mut os, env, fdnum).expect("close");

    file::sync(&mut os, env).expect("sync");

    // Fork: the child shares our pages copy-on-write.
    os.kernel
        .sys_mem_alloc(env, 0, 0x10_0000, koto_os::mmu::PteFlags::V | koto_os::mmu::PteFlags::R)
        .expect("mem_alloc");
    os.kernel
        .user_write_u32(env, 0x10_0000, 0x1111_1111)
        .expect("seed");
    let child = fork::fork(&mut os.kernel, env).expect("fork");
    println!(
        "forked child {:08x} (v0={})",
        child,
        os.kernel.env_ref(child).tf.regs[REG_V0]
    );
    os.kernel
        .user_write_u32(env, 0x10_0000, 0xDEAD_BEEF)
        .expect("parent write");
    let parent_sees = os.kernel.user_read_u32(env, 0x10_0000).unwrap();
    let child_sees = os.kernel.user_read_u32(child, 0x10_0000).unwrap();
    println!(
        "after parent write: parent sees {:08x}, child sees {:08x}",
        parent_sees, child_sees
    );

    file::remove(&mut os, env, "/motd").expect("remove");
    match file::open(&mut os, env, "/motd", O_RDONLY) {
        Err(e) => println!("reopen after remove: {}", e),
        Ok(_) => println!("unexpected: /motd still exists"),
    }

    let (used, total) = os.kernel.pm.stats();
    println!("frames in use: {}/{}", used, total);
}
