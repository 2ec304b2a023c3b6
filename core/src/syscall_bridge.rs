//! Bridges a decoded `int 0x80` to either a local handler or the out-of-
//! process service, and implements [`crate::emulator::SyscallDispatch`] so
//! the emulator never needs to know which syscalls are local.
//!
//! Per the Linux i386 ABI, `EAX` holds the syscall number and the first six
//! arguments arrive in `EBX, ECX, EDX, ESI, EDI, EBP`. Every call this
//! bridge dispatches is reported back to the guest as "handled" — a failed
//! syscall still returns a negative errno in `EAX`, it is not a dispatch
//! failure.

use crate::emulator::SyscallDispatch;
use crate::error::SyscallOutcome;
use crate::gs::{self, LdtEntry};
use crate::trapframe::TrapFrame;
use std::sync::{Arc, OnceLock};

pub const ENOSYS: i32 = -38;
pub const ESRCH: i32 = -3;
pub const EFAULT: i32 = -14;

const SYS_EXIT: u32 = 1;
const SYS_SET_THREAD_AREA: u32 = 243;
const SYS_EXIT_GROUP: u32 = 252;

/// Size of the dispatch table referenced by `spec.md` §4.G: syscall numbers
/// at or beyond this are unconditionally `ENOSYS`, matching a 512-entry
/// `sys_call_table`.
pub const DISPATCH_TABLE_SIZE: u32 = 512;

/// What a guest thread asked the runtime to do with it, set by the bridge's
/// local `exit`/`exit_group` handling and consumed by the host fault
/// binding (`crate::fault`) right after `emulator::step` returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadAction {
    Continue,
    /// This guest thread only; `exit(status)`.
    ExitThread(i32),
}

thread_local! {
    static PENDING_ACTION: std::cell::Cell<ThreadAction> = std::cell::Cell::new(ThreadAction::Continue);
}

/// Takes (and resets) whatever thread-termination action the most recent
/// dispatch requested. Called by the fault binding immediately after
/// `emulator::step`.
pub fn take_pending_action() -> ThreadAction {
    PENDING_ACTION.with(|a| a.replace(ThreadAction::Continue))
}

/// The out-of-process collaborator every non-local syscall is forwarded to.
/// `lx32-rpc` provides the real transport and a loopback test double;
/// this crate only depends on the trait, never the transport.
pub trait ServiceChannel: Send + Sync {
    /// Registers a newly-loaded guest process with the service. Called once
    /// per `exec`.
    fn attach_process(&self, pid: u32) -> Result<(), i32>;
    /// Registers a newly-launched guest thread. Called once per
    /// `crate::launcher::spawn`.
    fn attach_thread(&self, tid: u32) -> Result<(), i32>;
    /// Forwards one syscall. The return value is the raw value to place in
    /// `EAX` — negative values are errnos, by Linux convention.
    fn syscall(&self, nr: u32, args: [u32; 6]) -> i32;
}

/// The process-wide channel, published by `Bridge::new` so that callers
/// outside the `SyscallDispatch` chain — `crate::fault::launch_thread`, for
/// `attach_thread` — can reach the same service without owning it.
static CHANNEL: OnceLock<Arc<dyn ServiceChannel>> = OnceLock::new();

/// Returns the channel installed by the last `Bridge::new`, if any.
pub fn channel() -> Option<Arc<dyn ServiceChannel>> {
    CHANNEL.get().cloned()
}

pub struct Bridge {
    channel: Arc<dyn ServiceChannel>,
}

impl Bridge {
    pub fn new(channel: Arc<dyn ServiceChannel>) -> Bridge {
        let _ = CHANNEL.set(channel.clone());
        Bridge { channel }
    }

    fn args(tf: &TrapFrame) -> [u32; 6] {
        [tf.ebx, tf.ecx, tf.edx, tf.esi, tf.edi, tf.ebp]
    }

    /// Runs the bridge's dispatch logic without going through the
    /// `SyscallDispatch` trait object, returning the outcome for callers
    /// (tests, and `crate::fault`) that want it typed rather than folded
    /// into `EAX`.
    pub fn handle(&self, tf: &mut TrapFrame) -> SyscallOutcome {
        let nr = tf.eax;
        let args = Self::args(tf);

        if nr == SYS_EXIT {
            let status = args[0] as i32;
            PENDING_ACTION.with(|a| a.set(ThreadAction::ExitThread(status)));
            tf.eax = 0;
            return SyscallOutcome::Completed(0);
        }
        if nr == SYS_EXIT_GROUP {
            log::info!(target: "lx32::syscall", "exit_group({}) terminating host process", args[0] as i32);
            std::process::exit(args[0] as i32);
        }
        if nr == SYS_SET_THREAD_AREA {
            return self.set_thread_area(tf, args[0]);
        }

        if nr >= DISPATCH_TABLE_SIZE {
            tf.eax = ENOSYS as u32;
            return SyscallOutcome::NoSys;
        }

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            self.channel.syscall(nr, args)
        }));
        match result {
            Ok(val) => {
                tf.eax = val as u32;
                SyscallOutcome::Completed(val)
            }
            Err(_) => {
                log::warn!(target: "lx32::syscall", "syscall {} faulted inside its routine", nr);
                tf.eax = EFAULT as u32;
                SyscallOutcome::Fault
            }
        }
    }

    /// `sys_set_thread_area`: allocates (or updates) an LDT slot from the
    /// `user_desc` fields the guest placed in its argument struct, mirroring
    /// the single field this crate's GS manager actually needs (the base
    /// address) rather than the full 32-bit descriptor the real syscall
    /// reads out of guest memory. `arg0` here is that base address directly,
    /// since marshalling the guest's `struct user_desc` is the service's
    /// concern once a real one exists.
    fn set_thread_area(&self, tf: &mut TrapFrame, base: u32) -> SyscallOutcome {
        match gs::allocate(LdtEntry::for_tls_base(base)) {
            Ok(selector) => {
                gs::set_virtual_gs(selector);
                tf.eax = 0;
                SyscallOutcome::Completed(0)
            }
            Err(_) => {
                tf.eax = ESRCH as u32;
                SyscallOutcome::Completed(ESRCH)
            }
        }
    }
}

impl SyscallDispatch for Bridge {
    fn dispatch(&self, tf: &mut TrapFrame) {
        self.handle(tf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::{Arc, Mutex};

    struct RecordingChannel {
        last: Arc<Mutex<Option<(u32, [u32; 6])>>>,
        reply: i32,
    }

    impl ServiceChannel for RecordingChannel {
        fn attach_process(&self, _pid: u32) -> Result<(), i32> {
            Ok(())
        }
        fn attach_thread(&self, _tid: u32) -> Result<(), i32> {
            Ok(())
        }
        fn syscall(&self, nr: u32, args: [u32; 6]) -> i32 {
            *self.last.lock().unwrap() = Some((nr, args));
            self.reply
        }
    }

    #[test]
    fn forwards_in_range_syscalls_with_linux_i386_arg_order() {
        let last = Arc::new(Mutex::new(None));
        let chan = RecordingChannel { last: last.clone(), reply: 7 };
        let bridge = Bridge::new(Arc::new(chan));
        let mut tf = TrapFrame {
            eax: 4, // sys_write
            ebx: 1,
            ecx: 0xAAAA,
            edx: 10,
            esi: 0x11,
            edi: 0x22,
            ebp: 0x33,
            ..Default::default()
        };
        let outcome = bridge.handle(&mut tf);
        assert_eq!(outcome, SyscallOutcome::Completed(7));
        assert_eq!(tf.eax, 7);
        assert_eq!(*last.lock().unwrap(), Some((4, [1, 0xAAAA, 10, 0x11, 0x22, 0x33])));
    }

    #[test]
    fn out_of_range_syscall_is_enosys_without_touching_the_channel() {
        let last = Arc::new(Mutex::new(None));
        let chan = RecordingChannel { last: last.clone(), reply: 0 };
        let bridge = Bridge::new(Arc::new(chan));
        let mut tf = TrapFrame { eax: 9999, ..Default::default() };
        let outcome = bridge.handle(&mut tf);
        assert_eq!(outcome, SyscallOutcome::NoSys);
        assert_eq!(tf.eax as i32, ENOSYS);
        assert!(last.lock().unwrap().is_none());
    }

    #[test]
    fn exit_requests_thread_termination_without_touching_the_channel() {
        let last = Arc::new(Mutex::new(None));
        let chan = RecordingChannel { last: last.clone(), reply: 0 };
        let bridge = Bridge::new(Arc::new(chan));
        let mut tf = TrapFrame { eax: SYS_EXIT, ebx: 42, ..Default::default() };
        bridge.handle(&mut tf);
        assert_eq!(take_pending_action(), ThreadAction::ExitThread(42));
        assert!(last.lock().unwrap().is_none());
    }

    #[test]
    fn set_thread_area_allocates_an_ldt_slot_and_updates_virtual_gs() {
        let last = Arc::new(Mutex::new(None));
        let chan = RecordingChannel { last, reply: 0 };
        let bridge = Bridge::new(Arc::new(chan));
        let mut tf = TrapFrame { eax: SYS_SET_THREAD_AREA, ebx: 0x7000, ..Default::default() };
        let outcome = bridge.handle(&mut tf);
        assert_eq!(outcome, SyscallOutcome::Completed(0));
        assert_eq!(gs::gs_base_address().unwrap(), 0x7000);
        gs::free(gs::virtual_gs()).unwrap();
    }
}
