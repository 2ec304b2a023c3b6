//! Host fault binding: translates a host OS exception into a [`TrapFrame`],
//! offers it to [`crate::emulator::step`], and turns the result back into
//! whatever the host OS needs to resume (or terminate) the faulting thread.
//!
//! The core crate only depends on the `unix` binding below. A different
//! host (e.g. one using vectored exception handlers instead of signals)
//! would add a sibling module here and nothing else in the crate would
//! need to change, since every other component only ever sees a
//! [`TrapFrame`].

use crate::trapframe::TrapFrame;

#[cfg(unix)]
pub mod unix;

#[cfg(unix)]
pub use self::unix::{install, launch_thread};

/// What the fault binding should do with the faulting thread once
/// `emulator::step` has had its say.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Resume guest execution at the (possibly mutated) trap frame.
    Resume(TrapFrame),
    /// Tear down this thread only; the host process continues.
    TerminateThread(i32),
}
