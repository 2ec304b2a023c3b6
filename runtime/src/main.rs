//! Host-process shim: loads a 32-bit Linux ELF binary and runs it under
//! this crate's guest-process substrate, bridging its syscalls to a
//! loopback service by default.
//!
//! ```text
//! lx32-runtime --trace ./hello
//! ```

use clap::Parser;
use lx32_core::elf::{HostMemory, LoaderResult};
use lx32_core::error::LoaderError;
use lx32_core::launcher::InitialTaskState;
use lx32_rpc::LoopbackService;
use std::io::Read;
use std::sync::Arc;

/// Runs a 32-bit Linux ELF binary against the guest-process substrate.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Path to the guest ELF binary.
    binary: std::path::PathBuf,

    /// Arguments passed through to the guest as argv[1..].
    #[arg(last = true)]
    guest_args: Vec<String>,

    /// Raise the log level to trace (per-instruction dispatch tracing).
    #[arg(long)]
    trace: bool,

    /// Size, in bytes, of the guest's initial stack.
    #[arg(long, default_value_t = 8 * 1024 * 1024)]
    stack_size: u32,
}

fn init_logging(trace: bool) {
    let default_level = if trace { "trace" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();
}

/// `HostMemory` backed by real `mmap`/`mprotect`, the only implementation
/// `lx32-runtime` ships (the in-memory fake in `lx32_core::elf`'s own tests
/// exists solely to keep the mapping algorithm unit-testable).
struct MmapMemory;

fn prot_flags(elf_flags: u32) -> libc::c_int {
    let mut prot = 0;
    if elf_flags & lx32_core::elf::PF_R != 0 {
        prot |= libc::PROT_READ;
    }
    if elf_flags & lx32_core::elf::PF_W != 0 {
        prot |= libc::PROT_WRITE;
    }
    if elf_flags & lx32_core::elf::PF_X != 0 {
        prot |= libc::PROT_EXEC;
    }
    prot
}

impl HostMemory for MmapMemory {
    fn reserve(&mut self, at: Option<u32>, size: u32) -> LoaderResult<u32> {
        let hint = at.map(|a| a as usize).unwrap_or(0) as *mut libc::c_void;
        let flags = libc::MAP_PRIVATE
            | libc::MAP_ANONYMOUS
            | if at.is_some() { libc::MAP_FIXED } else { 0 };
        let ptr = unsafe {
            libc::mmap(hint, size as usize, libc::PROT_READ | libc::PROT_WRITE, flags, -1, 0)
        };
        if ptr == libc::MAP_FAILED {
            return Err(LoaderError::MapFailed("mmap returned MAP_FAILED"));
        }
        Ok(ptr as usize as u32)
    }

    fn write(&mut self, addr: u32, data: &[u8]) {
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), addr as *mut u8, data.len());
        }
    }

    fn zero(&mut self, addr: u32, len: u32) {
        unsafe {
            std::ptr::write_bytes(addr as *mut u8, 0, len as usize);
        }
    }

    fn protect(&mut self, addr: u32, len: u32, flags: u32) -> LoaderResult<()> {
        let rc = unsafe {
            libc::mprotect(addr as usize as *mut libc::c_void, len as usize, prot_flags(flags))
        };
        if rc != 0 {
            return Err(LoaderError::ProtectFailed("mprotect failed"));
        }
        Ok(())
    }
}

/// Lays out `argc`/`argv`/`envp` at the top of the guest stack the way the
/// Linux ELF ABI expects to find them at entry, and returns the resulting
/// stack pointer.
fn build_initial_stack(mem: &mut MmapMemory, stack_top: u32, argv: &[String]) -> u32 {
    // A minimal, null-terminated argv with no envp entries is enough to
    // satisfy a libc-free or musl-static guest's _start; a guest linked
    // against glibc that inspects envp would need more than this crate's
    // scope provides (see Non-goals).
    let mut sp = stack_top;
    let mut arg_ptrs = Vec::with_capacity(argv.len());
    for arg in argv {
        let bytes = arg.as_bytes();
        sp -= (bytes.len() + 1) as u32;
        mem.write(sp, bytes);
        mem.zero(sp + bytes.len() as u32, 1);
        arg_ptrs.push(sp);
    }
    sp &= !0xF; // 16-byte align before the pointer table, as the ABI expects

    let words = 1 + arg_ptrs.len() + 1 + 1; // argc, argv[...], NULL, envp NULL
    sp -= (words * 4) as u32;
    let table_base = sp;
    mem.write(table_base, &(arg_ptrs.len() as u32).to_le_bytes());
    for (i, ptr) in arg_ptrs.iter().enumerate() {
        mem.write(table_base + 4 + (i as u32) * 4, &ptr.to_le_bytes());
    }
    let null_off = table_base + 4 + (arg_ptrs.len() as u32) * 4;
    mem.write(null_off, &0u32.to_le_bytes());
    mem.write(null_off + 4, &0u32.to_le_bytes());
    sp
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_logging(args.trace);

    let mut file = std::fs::File::open(&args.binary)?;
    let mut image = Vec::new();
    file.read_to_end(&mut image)?;

    let mut mem = MmapMemory;
    let loaded = lx32_core::elf::load(&image, &mut mem)?;
    log::info!(target: "lx32::runtime", "loaded {:?} at entry {:#x} (delta {:#x})", args.binary, loaded.entry, loaded.load_delta);

    const STACK_TOP_HINT: u32 = 0xB000_0000;
    let stack_base = mem.reserve(Some(STACK_TOP_HINT), args.stack_size)?;
    let stack_top = stack_base + args.stack_size;

    let mut argv = vec![args.binary.display().to_string()];
    argv.extend(args.guest_args.iter().cloned());
    let initial_sp = build_initial_stack(&mut mem, stack_top, &argv);

    lx32_core::singleton::init(Arc::new(LoopbackService::new()))
        .map_err(|errno| format!("attach_process rejected by service: errno {errno}"))?;

    let state = InitialTaskState::for_process_entry(loaded.entry, initial_sp);
    let handle = lx32_core::fault::launch_thread(state);
    let status = handle.join().unwrap_or(-1);
    std::process::exit(status);
}
