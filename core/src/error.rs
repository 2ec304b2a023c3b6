//! Error kinds for the guest-process substrate.
//!
//! Each component gets its own error enum rather than one shared type, since
//! the failure domains don't overlap (a malformed ELF header and an
//! exhausted LDT are never confused for one another at a call site).

use core::fmt;

/// Errors raised while parsing or mapping an ELF32 image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoaderError {
    TooShort,
    BadMagic,
    WrongClass,
    WrongEndianness,
    UnsupportedVersion,
    UnsupportedType,
    WrongMachine,
    BadHeaderSize,
    BadProgramHeaderSize,
    BadSectionHeaderSize,
    ExecutableStack,
    BadInterp,
    NoLoadSegments,
    MapFailed(&'static str),
    ProtectFailed(&'static str),
}

impl fmt::Display for LoaderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoaderError::TooShort => write!(f, "file too short to contain an ELF header"),
            LoaderError::BadMagic => write!(f, "missing ELF magic"),
            LoaderError::WrongClass => write!(f, "not a 32-bit ELF image"),
            LoaderError::WrongEndianness => write!(f, "not a little-endian ELF image"),
            LoaderError::UnsupportedVersion => write!(f, "unsupported ELF version"),
            LoaderError::UnsupportedType => write!(f, "e_type is not ET_EXEC or ET_DYN"),
            LoaderError::WrongMachine => write!(f, "e_machine is not EM_386"),
            LoaderError::BadHeaderSize => write!(f, "e_ehsize does not match Elf32_Ehdr"),
            LoaderError::BadProgramHeaderSize => {
                write!(f, "e_phentsize is smaller than Elf32_Phdr")
            }
            LoaderError::BadSectionHeaderSize => {
                write!(f, "e_shentsize is smaller than Elf32_Shdr")
            }
            LoaderError::ExecutableStack => write!(f, "executable-stack segment (PT_GNU_STACK has PF_X)"),
            LoaderError::BadInterp => write!(f, "invalid interpreter string"),
            LoaderError::NoLoadSegments => write!(f, "image has no PT_LOAD segments"),
            LoaderError::MapFailed(why) => write!(f, "failed to reserve guest memory: {why}"),
            LoaderError::ProtectFailed(why) => write!(f, "failed to set segment protection: {why}"),
        }
    }
}

impl std::error::Error for LoaderError {}

pub type LoaderResult<T> = Result<T, LoaderError>;

/// Errors raised by the virtual GS / LDT manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GsError {
    /// The LDT has no free slots left to allocate.
    Exhausted,
    /// A GS value decoded to a slot index outside the allocated table.
    SlotOutOfRange,
    /// The slot a GS value named was never allocated.
    SlotNotAllocated,
}

impl fmt::Display for GsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GsError::Exhausted => write!(f, "LDT has no free entries"),
            GsError::SlotOutOfRange => write!(f, "GS selector names a slot outside the LDT"),
            GsError::SlotNotAllocated => write!(f, "GS selector names an unallocated LDT slot"),
        }
    }
}

impl std::error::Error for GsError {}

/// Outcome of offering one instruction to the emulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmulatorOutcome {
    /// A handler matched, mutated the trap frame, and advanced IP.
    Handled,
    /// No handler recognized the bytes at IP; IP was left untouched.
    Unrecognized,
}

/// Outcome of dispatching one `int 0x80` to the syscall bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallOutcome {
    /// The call was dispatched; EAX holds the guest-visible result (which
    /// may itself be a negative errno — that is still "handled").
    Completed(i32),
    /// The syscall number was out of range or had no bound routine.
    NoSys,
    /// The bound routine, or the RPC transport underneath it, faulted.
    Fault,
}
