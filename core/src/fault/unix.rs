//! POSIX signal-based fault binding.
//!
//! Two mechanisms share one signal handler:
//!
//! - **Launch**: [`launch_thread`] spawns an OS thread, stashes the guest's
//!   initial register state in a thread-local, and raises [`LAUNCH_SIGNAL`]
//!   against itself. The handler sees the pending launch state, overwrites
//!   the signal's machine context with it, and returns — the kernel's
//!   `sigreturn` then lands the thread at the guest's entry point with the
//!   guest's registers, never by returning through a Rust call frame.
//! - **Resume**: guest code then runs natively until it raises `SIGILL`
//!   (an unrecognized opcode, e.g. a GS-relative access) or `SIGSEGV`
//!   (e.g. `int 0x80`, which many hosts deliver as a protection fault). The
//!   handler builds a [`TrapFrame`] from the context, offers the faulting
//!   bytes to [`crate::emulator::step`], writes the result back into the
//!   context, and returns the same way.
//!
//! `sys_exit` is handled by leaving the signal handler via `pthread_exit`
//! instead of returning, since there is no instruction to resume into.

use crate::emulator::{self, SyscallDispatch};
use crate::launcher::InitialTaskState;
use crate::syscall_bridge::ThreadAction;
use crate::trapframe::TrapFrame;
use std::cell::Cell;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::OnceLock;

/// Reused to ask a freshly-spawned thread's own signal handler to install
/// its initial guest register state. Not `SIGUSR1`/`SIGUSR2` so user code
/// forwarded those by the service is never confused with it.
const LAUNCH_SIGNAL: i32 = libc::SIGUSR2;

thread_local! {
    static PENDING_LAUNCH: Cell<Option<TrapFrame>> = Cell::new(None);
}

static DISPATCH: OnceLock<Box<dyn SyscallDispatch + Send + Sync>> = OnceLock::new();

/// Guest thread IDs have no stable numeric source on the host side (unlike
/// a real kernel's task struct), so this crate hands out its own, starting
/// at 1 for the process's first thread.
static NEXT_TID: AtomicU32 = AtomicU32::new(1);

/// Installs the process-wide signal handlers. Must run before the first
/// call to [`launch_thread`]; idempotent after the first call.
pub fn install(dispatch: Box<dyn SyscallDispatch + Send + Sync>) {
    let _ = DISPATCH.set(dispatch);
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = handle_fault as usize;
        action.sa_flags = libc::SA_SIGINFO;
        libc::sigemptyset(&mut action.sa_mask);
        for sig in [libc::SIGSEGV, libc::SIGILL, LAUNCH_SIGNAL] {
            libc::sigaction(sig, &action, std::ptr::null_mut());
        }
    }
}

/// Spawns a guest thread with `state` as its starting register file and
/// blocks until it terminates, returning its exit status. Registers the
/// thread with the service channel (`attach_thread`) before raising the
/// launch signal.
pub fn launch_thread(state: InitialTaskState) -> std::thread::JoinHandle<i32> {
    let tid = NEXT_TID.fetch_add(1, Ordering::SeqCst);
    std::thread::spawn(move || {
        if let Some(channel) = crate::syscall_bridge::channel() {
            if let Err(errno) = channel.attach_thread(tid) {
                log::error!(target: "lx32::fault", "attach_thread({tid}) rejected: errno {errno}");
                return errno;
            }
        }
        let regs = crate::launcher::prepare(&state);
        PENDING_LAUNCH.with(|p| p.set(Some(regs)));
        unsafe {
            libc::raise(LAUNCH_SIGNAL);
        }
        // Unreachable under normal operation: the launch signal handler
        // overwrites this thread's context and never returns here. If
        // installation failed, fall through so the thread still ends
        // cleanly instead of spinning.
        -1
    })
}

#[cfg(target_arch = "x86")]
mod regs {
    pub const EAX: usize = libc::REG_EAX as usize;
    pub const EBX: usize = libc::REG_EBX as usize;
    pub const ECX: usize = libc::REG_ECX as usize;
    pub const EDX: usize = libc::REG_EDX as usize;
    pub const ESI: usize = libc::REG_ESI as usize;
    pub const EDI: usize = libc::REG_EDI as usize;
    pub const EBP: usize = libc::REG_EBP as usize;
    pub const ESP: usize = libc::REG_ESP as usize;
    pub const EIP: usize = libc::REG_EIP as usize;
    pub const EFL: usize = libc::REG_EFL as usize;
}

#[cfg(target_arch = "x86")]
unsafe fn read_context(ctx: *mut libc::ucontext_t) -> TrapFrame {
    let g = &(*ctx).uc_mcontext.gregs;
    TrapFrame {
        eax: g[regs::EAX] as u32,
        ebx: g[regs::EBX] as u32,
        ecx: g[regs::ECX] as u32,
        edx: g[regs::EDX] as u32,
        esi: g[regs::ESI] as u32,
        edi: g[regs::EDI] as u32,
        ebp: g[regs::EBP] as u32,
        esp: g[regs::ESP] as u32,
        eip: g[regs::EIP] as u32,
        eflags: g[regs::EFL] as u32,
    }
}

#[cfg(target_arch = "x86")]
unsafe fn write_context(ctx: *mut libc::ucontext_t, tf: &TrapFrame) {
    let g = &mut (*ctx).uc_mcontext.gregs;
    g[regs::EAX] = tf.eax as i32;
    g[regs::EBX] = tf.ebx as i32;
    g[regs::ECX] = tf.ecx as i32;
    g[regs::EDX] = tf.edx as i32;
    g[regs::ESI] = tf.esi as i32;
    g[regs::EDI] = tf.edi as i32;
    g[regs::EBP] = tf.ebp as i32;
    g[regs::ESP] = tf.esp as i32;
    g[regs::EIP] = tf.eip as i32;
    g[regs::EFL] = tf.eflags as i32;
}

#[cfg(not(target_arch = "x86"))]
unsafe fn read_context(_ctx: *mut libc::ucontext_t) -> TrapFrame {
    unimplemented!("the unix fault binding requires an x86 (32-bit) host process")
}

#[cfg(not(target_arch = "x86"))]
unsafe fn write_context(_ctx: *mut libc::ucontext_t, _tf: &TrapFrame) {
    unimplemented!("the unix fault binding requires an x86 (32-bit) host process")
}

/// Maximum length of any instruction this crate's handler table recognizes;
/// used only to bound how much of guest memory the handler reads at `EIP`.
const MAX_DECODED_LEN: usize = 16;

extern "C" fn handle_fault(_sig: i32, _info: *mut libc::siginfo_t, ctx: *mut libc::c_void) {
    let ctx = ctx as *mut libc::ucontext_t;

    let pending = PENDING_LAUNCH.with(|p| p.take());
    if let Some(initial) = pending {
        unsafe { write_context(ctx, &initial) };
        return;
    }

    let mut tf = unsafe { read_context(ctx) };
    let code = unsafe { std::slice::from_raw_parts(tf.eip as *const u8, MAX_DECODED_LEN) };

    let dispatch = match DISPATCH.get() {
        Some(d) => d.as_ref(),
        None => {
            log::error!(target: "lx32::fault", "fault delivered before install()");
            std::process::abort();
        }
    };

    let outcome = emulator::step(&mut tf, code, dispatch);

    match crate::syscall_bridge::take_pending_action() {
        ThreadAction::ExitThread(status) => unsafe {
            let mut code = status as libc::c_int;
            libc::pthread_exit(&mut code as *mut _ as *mut libc::c_void);
        },
        ThreadAction::Continue => {}
    }

    match outcome {
        crate::error::EmulatorOutcome::Handled => unsafe { write_context(ctx, &tf) },
        crate::error::EmulatorOutcome::Unrecognized => {
            log::error!(target: "lx32::fault", "unhandled instruction at {:#x}, terminating guest thread", tf.eip);
            unsafe {
                let mut code = 139i32; // 128 + SIGSEGV, conventional "killed" status
                libc::pthread_exit(&mut code as *mut _ as *mut libc::c_void);
            }
        }
    }
}
