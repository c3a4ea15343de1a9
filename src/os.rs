//! Boot and the timer loop.
//!
//! `Os` wires the kernel to the file-system server environment and
//! plays the role of the timer interrupt: every iteration of
//! [`Os::run_until`] is one quantum handed to whatever the scheduler
//! picks. The server runs when it is picked; an environment driven
//! from outside (a test, the demo shell) gets the CPU back when it is
//! picked.

use crate::env::{EnvId, EnvStatus};
use crate::error::Result;
use crate::fs::serv::FsServer;
use crate::ide::DiskRef;
use crate::Kernel;

/// Quanta burned with nothing runnable before the machine declares
/// itself wedged; a blocked receiver with no sender left is a bug in
/// the caller, not a state to spin in.
const IDLE_LIMIT: u32 = 64;
/// Hard bound on quanta per `run_until`, against livelock.
const STEP_LIMIT: u32 = 100_000;

pub struct Os {
    pub kernel: Kernel,
    pub fs: FsServer,
}

impl Os {
    /// Bring the machine up with one disk attached and the file-system
    /// server parked on it.
    pub fn boot(disk: DiskRef, npage: u32) -> Result<Os> {
        let mut kernel = Kernel::new(npage);
        let diskno = kernel.attach_disk(disk);
        let fs = FsServer::boot(&mut kernel, diskno)?;
        Ok(Os { kernel, fs })
    }

    /// Run the scheduler until `env` gets the CPU.
    pub fn run_until(&mut self, env: EnvId) -> Result<()> {
        let mut idle = 0u32;
        for _ in 0..STEP_LIMIT {
            match self.kernel.sched_next() {
                Some(picked) if picked == env => return Ok(()),
                Some(picked) if picked == self.fs.env() => {
                    self.fs.serve_step(&mut self.kernel)?;
                }
                Some(_) => {
                    // An externally driven environment burns its
                    // quantum without making progress here.
                }
                None => {
                    idle += 1;
                    if idle > IDLE_LIMIT {
                        panic!("sched: no runnable envs, {:08x} never woke up", env);
                    }
                }
            }
        }
        panic!("sched: env {:08x} starved", env);
    }

    /// Give the server a quantum if it has work; used by senders
    /// spinning on a busy server.
    pub fn pump_server(&mut self) -> Result<()> {
        if self.kernel.env_ref(self.fs.env()).status == EnvStatus::Runnable {
            self.fs.serve_step(&mut self.kernel)?;
        }
        Ok(())
    }
}
