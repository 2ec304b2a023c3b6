//! Guest-thread launcher.
//!
//! Builds the Initial Task State for a guest thread (general-purpose
//! registers, stack pointer, entry IP, a freshly-seeded virtual GS/LDT) and
//! hands it to the host fault binding (`crate::fault`) to install on a
//! fresh OS thread. The launcher itself never executes guest code — it only
//! prepares state and asks the binding to start the thread.

use crate::gs::LdtEntry;
use crate::trapframe::TrapFrame;

/// Registers and initial GS/LDT state a guest thread starts with.
#[derive(Debug, Clone)]
pub struct InitialTaskState {
    pub regs: TrapFrame,
    /// TLS base to seed the thread's virtual GS with before entry, if the
    /// loader or exec path already knows one (absent for the process's very
    /// first thread, whose `set_thread_area` call — if any — happens after
    /// entry like on real Linux).
    pub initial_tls_base: Option<u32>,
}

impl InitialTaskState {
    /// Builds the initial state for a process's first thread from a freshly
    /// loaded image: `EIP` at the entry point, stack pointer at the top of
    /// `stack_top` with `argc`/`argv`/`envp` already written below it by the
    /// caller, and all other general-purpose registers zeroed (matching
    /// what the Linux ELF ABI guarantees on entry).
    pub fn for_process_entry(entry: u32, stack_top: u32) -> InitialTaskState {
        InitialTaskState {
            regs: TrapFrame { eip: entry, esp: stack_top, eflags: 0x0000_0202, ..Default::default() },
            initial_tls_base: None,
        }
    }
}

/// Installs `state` on the calling OS thread's virtual GS/LDT (if a TLS
/// base was provided) and returns the register state the host fault binding
/// should hand to the kernel as this thread's starting context.
///
/// This crate never performs the actual context switch itself — that is
/// unavoidably host-specific (`sigreturn` on the Unix binding, in
/// `crate::fault::unix`) — but every guest thread's GS/LDT must exist
/// before that switch happens, since the very first instruction executed
/// could already be GS-relative.
pub fn prepare(state: &InitialTaskState) -> TrapFrame {
    if let Some(base) = state.initial_tls_base {
        if let Ok(selector) = crate::gs::allocate(LdtEntry::for_tls_base(base)) {
            crate::gs::set_virtual_gs(selector);
        }
    }
    state.regs
}
