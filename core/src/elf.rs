//! ELF32 loader.
//!
//! Validates a little-endian, 32-bit, `ET_EXEC`/`ET_DYN`, `EM_386` image and
//! maps its `PT_LOAD` segments into host memory via [`HostMemory`]. The
//! two-pass algorithm (measure the image's vaddr span, then reserve one
//! contiguous host region for it) mirrors how a real Linux loader avoids
//! leaving gaps between segments addressable by nothing.

use crate::error::{LoaderError, LoaderResult};

const EI_NIDENT: usize = 16;
const ELFMAG: &[u8; 4] = b"\x7FELF";
const ELFCLASS32: u8 = 1;
const ELFDATA2LSB: u8 = 1;
const EV_CURRENT: u8 = 1;
const ET_EXEC: u16 = 2;
const ET_DYN: u16 = 3;
const EM_386: u16 = 3;
const PT_LOAD: u32 = 1;
const PT_INTERP: u32 = 3;
const PT_PHDR: u32 = 6;
const PT_GNU_STACK: u32 = 0x6474_e551;

pub const PF_X: u32 = 1 << 0;
pub const PF_W: u32 = 1 << 1;
pub const PF_R: u32 = 1 << 2;

const EHDR_SIZE: usize = 52;
const PHDR_SIZE: usize = 32;
const SHDR_SIZE: usize = 40;

#[derive(Debug, Clone, Copy)]
struct Elf32Header {
    e_type: u16,
    e_machine: u16,
    e_entry: u32,
    e_phoff: u32,
    e_phentsize: u16,
    e_phnum: u16,
}

impl Elf32Header {
    fn parse(bytes: &[u8]) -> LoaderResult<Elf32Header> {
        if bytes.len() < EHDR_SIZE {
            return Err(LoaderError::TooShort);
        }
        if &bytes[0..4] != ELFMAG {
            return Err(LoaderError::BadMagic);
        }
        if bytes[4] != ELFCLASS32 {
            return Err(LoaderError::WrongClass);
        }
        if bytes[5] != ELFDATA2LSB {
            return Err(LoaderError::WrongEndianness);
        }
        if bytes[6] != EV_CURRENT {
            return Err(LoaderError::UnsupportedVersion);
        }
        let e_type = u16::from_le_bytes(bytes[EI_NIDENT..EI_NIDENT + 2].try_into().unwrap());
        if e_type != ET_EXEC && e_type != ET_DYN {
            return Err(LoaderError::UnsupportedType);
        }
        let e_machine = u16::from_le_bytes(bytes[18..20].try_into().unwrap());
        if e_machine != EM_386 {
            return Err(LoaderError::WrongMachine);
        }
        let e_entry = u32::from_le_bytes(bytes[24..28].try_into().unwrap());
        let e_phoff = u32::from_le_bytes(bytes[28..32].try_into().unwrap());
        let e_ehsize = u16::from_le_bytes(bytes[40..42].try_into().unwrap());
        if e_ehsize as usize != EHDR_SIZE {
            return Err(LoaderError::BadHeaderSize);
        }
        let e_phentsize = u16::from_le_bytes(bytes[42..44].try_into().unwrap());
        if (e_phentsize as usize) < PHDR_SIZE {
            return Err(LoaderError::BadProgramHeaderSize);
        }
        let e_phnum = u16::from_le_bytes(bytes[44..46].try_into().unwrap());
        let e_shentsize = u16::from_le_bytes(bytes[46..48].try_into().unwrap());
        if e_shentsize != 0 && (e_shentsize as usize) < SHDR_SIZE {
            return Err(LoaderError::BadSectionHeaderSize);
        }
        Ok(Elf32Header { e_type, e_machine, e_entry, e_phoff, e_phentsize, e_phnum })
    }
}

#[derive(Debug, Clone, Copy)]
struct Elf32Phdr {
    p_type: u32,
    p_offset: u32,
    p_vaddr: u32,
    p_filesz: u32,
    p_memsz: u32,
    p_flags: u32,
}

impl Elf32Phdr {
    fn parse(bytes: &[u8]) -> Elf32Phdr {
        Elf32Phdr {
            p_type: u32::from_le_bytes(bytes[0..4].try_into().unwrap()),
            p_offset: u32::from_le_bytes(bytes[4..8].try_into().unwrap()),
            p_vaddr: u32::from_le_bytes(bytes[8..12].try_into().unwrap()),
            p_filesz: u32::from_le_bytes(bytes[16..20].try_into().unwrap()),
            p_memsz: u32::from_le_bytes(bytes[20..24].try_into().unwrap()),
            p_flags: u32::from_le_bytes(bytes[24..28].try_into().unwrap()),
        }
    }
}

/// One mapped `PT_LOAD` segment, in load-address (post-relocation) terms.
#[derive(Debug, Clone, Copy)]
pub struct LoadedSegment {
    pub addr: u32,
    pub size: u32,
    pub flags: u32,
}

/// The result of a successful load: enough to build the guest's initial
/// task state (`crate::launcher`) and to answer PT_INTERP/PT_PHDR queries a
/// dynamic linker would need.
#[derive(Debug, Clone)]
pub struct LoadedImage {
    pub entry: u32,
    pub load_delta: i64,
    pub segments: Vec<LoadedSegment>,
    pub program_break: u32,
    pub interp: Option<String>,
    pub phdr_addr: Option<u32>,
    pub phnum: u16,
    pub phentsize: u16,
}

/// Host memory reservation backend used by the loader. Split out as a trait
/// so the mapping algorithm can be unit-tested against an in-memory fake
/// without actually calling into `mmap`.
pub trait HostMemory {
    /// Reserves `size` bytes, optionally at `at` (required for `ET_EXEC`,
    /// `None` lets the backend choose for `ET_DYN`). Returns the base
    /// address of the reservation.
    fn reserve(&mut self, at: Option<u32>, size: u32) -> LoaderResult<u32>;
    fn write(&mut self, addr: u32, data: &[u8]);
    fn zero(&mut self, addr: u32, len: u32);
    fn protect(&mut self, addr: u32, len: u32, flags: u32) -> LoaderResult<()>;
}

const PAGE_SIZE: u32 = 4096;

fn page_align_down(x: u32) -> u32 {
    x & !(PAGE_SIZE - 1)
}

fn page_align_up(x: u32) -> u32 {
    page_align_down(x.wrapping_add(PAGE_SIZE - 1))
}

/// Parses and maps `image`, a complete ELF32 file, using `mem` as the host
/// memory backend.
pub fn load(image: &[u8], mem: &mut dyn HostMemory) -> LoaderResult<LoadedImage> {
    let hdr = Elf32Header::parse(image)?;

    let phoff = hdr.e_phoff as usize;
    let phentsize = hdr.e_phentsize as usize;
    let phnum = hdr.e_phnum as usize;
    let mut phdrs = Vec::with_capacity(phnum);
    for i in 0..phnum {
        let start = phoff + i * phentsize;
        let bytes = image.get(start..start + PHDR_SIZE).ok_or(LoaderError::TooShort)?;
        phdrs.push(Elf32Phdr::parse(bytes));
    }

    if phdrs.iter().any(|p| p.p_type == PT_GNU_STACK && p.p_flags & PF_X != 0) {
        return Err(LoaderError::ExecutableStack);
    }

    let loads: Vec<&Elf32Phdr> = phdrs.iter().filter(|p| p.p_type == PT_LOAD).collect();
    if loads.is_empty() {
        return Err(LoaderError::NoLoadSegments);
    }

    // Pass 1: measure the vaddr span so we reserve one region with no gaps.
    let min_vaddr = loads.iter().map(|p| page_align_down(p.p_vaddr)).min().unwrap();
    let max_vaddr = loads
        .iter()
        .map(|p| p.p_vaddr.wrapping_add(p.p_memsz))
        .max()
        .unwrap();
    let span = page_align_up(max_vaddr - min_vaddr);

    let requested_at = if hdr.e_type == ET_EXEC { Some(min_vaddr) } else { None };
    let region_base = mem.reserve(requested_at, span)?;
    let load_delta = region_base as i64 - min_vaddr as i64;

    // Pass 2: commit/copy/zero-fill/protect each PT_LOAD segment.
    let mut segments = Vec::with_capacity(loads.len());
    for p in &loads {
        let seg_addr = (p.p_vaddr as i64 + load_delta) as u32;
        let file_bytes = image
            .get(p.p_offset as usize..(p.p_offset + p.p_filesz) as usize)
            .ok_or(LoaderError::TooShort)?;
        mem.write(seg_addr, file_bytes);
        if p.p_memsz > p.p_filesz {
            mem.zero(seg_addr + p.p_filesz, p.p_memsz - p.p_filesz);
        }
        let prot_start = page_align_down(seg_addr);
        let prot_len = page_align_up(seg_addr + p.p_memsz) - prot_start;
        mem.protect(prot_start, prot_len, p.p_flags)?;
        segments.push(LoadedSegment { addr: seg_addr, size: p.p_memsz, flags: p.p_flags });
    }

    let interp = match phdrs.iter().find(|p| p.p_type == PT_INTERP) {
        Some(p) => {
            let bytes = image
                .get(p.p_offset as usize..(p.p_offset + p.p_filesz) as usize)
                .ok_or(LoaderError::TooShort)?;
            let nul = bytes.iter().position(|&b| b == 0).ok_or(LoaderError::BadInterp)?;
            Some(String::from_utf8_lossy(&bytes[..nul]).into_owned())
        }
        None => None,
    };

    let phdr_addr = phdrs
        .iter()
        .find(|p| p.p_type == PT_PHDR)
        .map(|p| (p.p_vaddr as i64 + load_delta) as u32)
        .or_else(|| {
            // No PT_PHDR: the headers are still at e_phoff inside the first
            // loaded segment's file image for an ET_EXEC binary.
            if hdr.e_type == ET_EXEC {
                Some((min_vaddr as i64 + load_delta) as u32 + hdr.e_phoff)
            } else {
                None
            }
        });

    let program_break = page_align_up(
        segments.iter().map(|s| s.addr + s.size).max().unwrap_or(region_base),
    );

    Ok(LoadedImage {
        entry: (hdr.e_entry as i64 + load_delta) as u32,
        load_delta,
        segments,
        program_break,
        interp,
        phdr_addr,
        phnum: hdr.e_phnum,
        phentsize: hdr.e_phentsize,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    /// In-memory fake so the mapping algorithm can be exercised without a
    /// real `mmap`.
    #[derive(Default)]
    struct FakeMemory {
        next_addr: u32,
        bytes: HashMap<u32, u8>,
        protects: Vec<(u32, u32, u32)>,
    }

    impl HostMemory for FakeMemory {
        fn reserve(&mut self, at: Option<u32>, size: u32) -> LoaderResult<u32> {
            match at {
                Some(addr) => Ok(addr),
                None => {
                    let base = self.next_addr;
                    self.next_addr += size;
                    Ok(base)
                }
            }
        }
        fn write(&mut self, addr: u32, data: &[u8]) {
            for (i, b) in data.iter().enumerate() {
                self.bytes.insert(addr + i as u32, *b);
            }
        }
        fn zero(&mut self, addr: u32, len: u32) {
            for i in 0..len {
                self.bytes.insert(addr + i, 0);
            }
        }
        fn protect(&mut self, addr: u32, len: u32, flags: u32) -> LoaderResult<()> {
            self.protects.push((addr, len, flags));
            Ok(())
        }
    }

    fn build_et_exec(vaddr: u32, entry_offset: u32, body: &[u8]) -> Vec<u8> {
        let mut f = vec![0u8; EHDR_SIZE + PHDR_SIZE];
        f[0..4].copy_from_slice(ELFMAG);
        f[4] = ELFCLASS32;
        f[5] = ELFDATA2LSB;
        f[6] = EV_CURRENT;
        f[EI_NIDENT..EI_NIDENT + 2].copy_from_slice(&ET_EXEC.to_le_bytes());
        f[18..20].copy_from_slice(&EM_386.to_le_bytes());
        let entry = vaddr + entry_offset;
        f[24..28].copy_from_slice(&entry.to_le_bytes());
        f[28..32].copy_from_slice(&(EHDR_SIZE as u32).to_le_bytes());
        f[40..42].copy_from_slice(&(EHDR_SIZE as u16).to_le_bytes());
        f[42..44].copy_from_slice(&(PHDR_SIZE as u16).to_le_bytes());
        f[44..46].copy_from_slice(&1u16.to_le_bytes());

        let phdr_off = EHDR_SIZE as u32;
        let file_off = (EHDR_SIZE + PHDR_SIZE) as u32;
        f[phdr_off as usize..phdr_off as usize + 4].copy_from_slice(&PT_LOAD.to_le_bytes());
        f[phdr_off as usize + 4..phdr_off as usize + 8].copy_from_slice(&file_off.to_le_bytes());
        f[phdr_off as usize + 8..phdr_off as usize + 12].copy_from_slice(&vaddr.to_le_bytes());
        f[phdr_off as usize + 16..phdr_off as usize + 20]
            .copy_from_slice(&(body.len() as u32).to_le_bytes());
        f[phdr_off as usize + 20..phdr_off as usize + 24]
            .copy_from_slice(&(body.len() as u32).to_le_bytes());
        f[phdr_off as usize + 24..phdr_off as usize + 28]
            .copy_from_slice(&(PF_R | PF_X).to_le_bytes());
        f.extend_from_slice(body);
        f
    }

    /// Like `build_et_exec`, but with a second program header of `extra_type`
    /// whose content is `extra_content` and whose flags are `extra_flags` —
    /// used to exercise `PT_GNU_STACK`/`PT_INTERP` handling.
    fn build_with_extra_phdr(
        vaddr: u32,
        entry_offset: u32,
        body: &[u8],
        extra_type: u32,
        extra_flags: u32,
        extra_content: &[u8],
    ) -> Vec<u8> {
        let mut f = vec![0u8; EHDR_SIZE + PHDR_SIZE * 2];
        f[0..4].copy_from_slice(ELFMAG);
        f[4] = ELFCLASS32;
        f[5] = ELFDATA2LSB;
        f[6] = EV_CURRENT;
        f[EI_NIDENT..EI_NIDENT + 2].copy_from_slice(&ET_EXEC.to_le_bytes());
        f[18..20].copy_from_slice(&EM_386.to_le_bytes());
        let entry = vaddr + entry_offset;
        f[24..28].copy_from_slice(&entry.to_le_bytes());
        f[28..32].copy_from_slice(&(EHDR_SIZE as u32).to_le_bytes());
        f[40..42].copy_from_slice(&(EHDR_SIZE as u16).to_le_bytes());
        f[42..44].copy_from_slice(&(PHDR_SIZE as u16).to_le_bytes());
        f[44..46].copy_from_slice(&2u16.to_le_bytes());

        let load_off = EHDR_SIZE;
        let extra_off = load_off + PHDR_SIZE;
        let file_off = (EHDR_SIZE + PHDR_SIZE * 2) as u32;
        let extra_file_off = file_off + body.len() as u32;

        f[load_off..load_off + 4].copy_from_slice(&PT_LOAD.to_le_bytes());
        f[load_off + 4..load_off + 8].copy_from_slice(&file_off.to_le_bytes());
        f[load_off + 8..load_off + 12].copy_from_slice(&vaddr.to_le_bytes());
        f[load_off + 16..load_off + 20].copy_from_slice(&(body.len() as u32).to_le_bytes());
        f[load_off + 20..load_off + 24].copy_from_slice(&(body.len() as u32).to_le_bytes());
        f[load_off + 24..load_off + 28].copy_from_slice(&(PF_R | PF_X).to_le_bytes());

        f[extra_off..extra_off + 4].copy_from_slice(&extra_type.to_le_bytes());
        f[extra_off + 4..extra_off + 8].copy_from_slice(&extra_file_off.to_le_bytes());
        f[extra_off + 16..extra_off + 20]
            .copy_from_slice(&(extra_content.len() as u32).to_le_bytes());
        f[extra_off + 20..extra_off + 24]
            .copy_from_slice(&(extra_content.len() as u32).to_le_bytes());
        f[extra_off + 24..extra_off + 28].copy_from_slice(&extra_flags.to_le_bytes());

        f.extend_from_slice(body);
        f.extend_from_slice(extra_content);
        f
    }

    #[test]
    fn rejects_bad_magic() {
        let mut mem = FakeMemory::default();
        let image = vec![0u8; 64];
        assert_eq!(load(&image, &mut mem), Err(LoaderError::BadMagic));
    }

    #[test]
    fn loads_et_exec_at_its_linked_address_with_zero_delta() {
        let image = build_et_exec(0x0804_8000, 0x10, &[0x90, 0x90, 0x90, 0x90]);
        let mut mem = FakeMemory::default();
        let loaded = load(&image, &mut mem).unwrap();
        assert_eq!(loaded.load_delta, 0);
        assert_eq!(loaded.entry, 0x0804_8010);
        assert_eq!(loaded.segments.len(), 1);
        assert_eq!(loaded.segments[0].addr, 0x0804_8000);
    }

    #[test]
    fn loading_twice_preserves_the_vaddr_to_loadaddr_relation() {
        let image = build_et_exec(0x0804_8000, 0x10, &[0x90; 16]);
        let mut mem_a = FakeMemory::default();
        let a = load(&image, &mut mem_a).unwrap();
        let mut mem_b = FakeMemory::default();
        let b = load(&image, &mut mem_b).unwrap();
        assert_eq!(a.entry as i64 - a.load_delta, b.entry as i64 - b.load_delta);
    }

    #[test]
    fn program_break_is_page_aligned_past_the_last_segment() {
        let image = build_et_exec(0x0804_8000, 0x0, &[0xCC; 10]);
        let mut mem = FakeMemory::default();
        let loaded = load(&image, &mut mem).unwrap();
        assert_eq!(loaded.program_break % PAGE_SIZE, 0);
        assert!(loaded.program_break >= loaded.segments[0].addr + loaded.segments[0].size);
    }

    #[test]
    fn rejects_an_executable_gnu_stack_segment() {
        let image =
            build_with_extra_phdr(0x0804_8000, 0x10, &[0x90; 4], PT_GNU_STACK, PF_R | PF_W | PF_X, &[]);
        let mut mem = FakeMemory::default();
        assert_eq!(load(&image, &mut mem), Err(LoaderError::ExecutableStack));
    }

    #[test]
    fn non_executable_gnu_stack_segment_is_accepted() {
        let image =
            build_with_extra_phdr(0x0804_8000, 0x10, &[0x90; 4], PT_GNU_STACK, PF_R | PF_W, &[]);
        let mut mem = FakeMemory::default();
        assert!(load(&image, &mut mem).is_ok());
    }

    #[test]
    fn rejects_a_non_null_terminated_interp_string() {
        let image = build_with_extra_phdr(
            0x0804_8000,
            0x10,
            &[0x90; 4],
            PT_INTERP,
            0,
            b"/lib/ld-linux.so.2", // no trailing NUL
        );
        let mut mem = FakeMemory::default();
        assert_eq!(load(&image, &mut mem), Err(LoaderError::BadInterp));
    }

    #[test]
    fn accepts_a_null_terminated_interp_string() {
        let image = build_with_extra_phdr(
            0x0804_8000,
            0x10,
            &[0x90; 4],
            PT_INTERP,
            0,
            b"/lib/ld-linux.so.2\0",
        );
        let mut mem = FakeMemory::default();
        let loaded = load(&image, &mut mem).unwrap();
        assert_eq!(loaded.interp.as_deref(), Some("/lib/ld-linux.so.2"));
    }
}
