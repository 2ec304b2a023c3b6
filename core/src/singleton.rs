//! Process-wide, write-once initialization.
//!
//! The only mutable global state this crate needs process-wide is "which
//! service channel do syscalls go to" and "are the fault handlers
//! installed." Both are set exactly once, from the runtime's startup path,
//! before any guest thread is launched; nothing after that point ever
//! mutates them, so a plain [`std::sync::OnceLock`] guard is enough and no
//! `lazy_static`/`spin`-style lock is needed (unlike the no_std kernel this
//! crate is modeled on, which has no such guarantee available to it).

use crate::syscall_bridge::{Bridge, ServiceChannel};
use std::sync::{Arc, OnceLock};

static INITIALIZED: OnceLock<()> = OnceLock::new();

/// Registers this process with `channel` (the `attach_process` startup RPC,
/// called once by the main host thread), then installs the fault handlers
/// and wires `channel` as the syscall bridge's destination. Must be called
/// exactly once, before the first call to [`crate::fault::launch_thread`].
/// Subsequent calls are no-ops and report success without re-attaching.
pub fn init(channel: Arc<dyn ServiceChannel>) -> Result<(), i32> {
    if INITIALIZED.get().is_some() {
        return Ok(());
    }
    channel.attach_process(std::process::id())?;
    INITIALIZED.get_or_init(|| {
        let bridge = Bridge::new(channel);
        crate::fault::install(Box::new(bridge));
    });
    Ok(())
}

pub fn is_initialized() -> bool {
    INITIALIZED.get().is_some()
}
