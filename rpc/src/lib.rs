//! Service-boundary types for forwarding guest syscalls out of process.
//!
//! The real service — the thing that actually owns the guest's virtual
//! filesystem, process table, and namespaces — is explicitly out of scope
//! for this crate (see the core crate's docs). What lives here is the wire
//! shape a real transport would serialize ([`SyscallRequest`] /
//! [`SyscallResponse`]) and a [`LoopbackService`] test double that answers
//! a handful of syscalls in-process, standing in for that transport in
//! tests and in `lx32-runtime`'s standalone demo mode.

use lx32_core::syscall_bridge::ServiceChannel;
use std::io::Write;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

/// One `int 0x80` as it would cross the wire to a real service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyscallRequest {
    pub pid: u32,
    pub tid: u32,
    pub nr: u32,
    pub args: [u32; 6],
}

/// A real service's answer to a [`SyscallRequest`]: the raw value to place
/// in `EAX`, which by Linux convention may itself be a negative errno.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyscallResponse {
    pub eax: i32,
}

const SYS_WRITE: u32 = 4;
const SYS_CLOSE: u32 = 6;
const SYS_GETPID: u32 = 20;

/// Answers a minimal slice of syscalls directly in this process: `write`
/// (to the host's real stdout/stderr, since those file descriptors are
/// meaningful here even without a real service behind them), `close`
/// (always succeeds), and `getpid` (a fixed per-process counter). Every
/// other syscall number returns `ENOSYS`. This exists so the core crate's
/// own tests, and `lx32-runtime` run without `--service-addr`, have
/// something to talk to.
pub struct LoopbackService {
    pid: AtomicU32,
    stdout: Mutex<std::io::Stdout>,
    stderr: Mutex<std::io::Stderr>,
}

impl LoopbackService {
    pub fn new() -> LoopbackService {
        LoopbackService {
            pid: AtomicU32::new(1),
            stdout: Mutex::new(std::io::stdout()),
            stderr: Mutex::new(std::io::stderr()),
        }
    }
}

impl Default for LoopbackService {
    fn default() -> LoopbackService {
        LoopbackService::new()
    }
}

const ENOSYS: i32 = -38;
const EBADF: i32 = -9;

impl ServiceChannel for LoopbackService {
    fn attach_process(&self, pid: u32) -> Result<(), i32> {
        self.pid.store(pid, Ordering::SeqCst);
        log::debug!(target: "lx32::rpc", "loopback: attach_process({pid})");
        Ok(())
    }

    fn attach_thread(&self, tid: u32) -> Result<(), i32> {
        log::debug!(target: "lx32::rpc", "loopback: attach_thread({tid})");
        Ok(())
    }

    fn syscall(&self, nr: u32, args: [u32; 6]) -> i32 {
        match nr {
            SYS_WRITE => {
                let fd = args[0];
                let ptr = args[1] as *const u8;
                let len = args[2] as usize;
                let bytes = unsafe { std::slice::from_raw_parts(ptr, len) };
                let written = match fd {
                    1 => self.stdout.lock().unwrap().write(bytes),
                    2 => self.stderr.lock().unwrap().write(bytes),
                    _ => return EBADF,
                };
                written.map(|n| n as i32).unwrap_or(EBADF)
            }
            SYS_CLOSE => 0,
            SYS_GETPID => self.pid.load(Ordering::SeqCst) as i32,
            _ => ENOSYS,
        }
    }
}
