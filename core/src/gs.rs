//! Virtual GS segment and per-thread LDT.
//!
//! The host OS reserves the real GS segment register for its own use, so a
//! guest thread's `%gs` never touches hardware segmentation. Instead each
//! host thread keeps a private LDT (a flat table of up to [`LDT_CAPACITY`]
//! descriptors) and a "virtual GS" value that names a slot in it. The
//! instruction emulator (`crate::emulator`) is the only consumer of
//! `gs_base_address`; everything else here is bookkeeping.
//!
//! Selector encoding: slot `n` is named by the selector `n*8 + 3` (RPL 3,
//! table bit clear, index `n`) — the inverse of `decode_selector` below.

use crate::error::GsError;
use std::cell::RefCell;

/// Matches the real x86 LDT's 13-bit index field.
pub const LDT_CAPACITY: usize = 8192;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct LdtFlags: u32 {
        /// Descriptor describes a 32-bit (vs. 16-bit) segment.
        const SEG_32BIT = 1 << 0;
        /// Segment is present (usable). Cleared entries are never observed
        /// by callers since `allocate`/`get` only ever hand out present ones.
        const PRESENT   = 1 << 1;
        /// Limit is in 4 KiB pages rather than bytes.
        const PAGE_GRANULAR = 1 << 2;
    }
}

/// One LDT descriptor, in the fields this crate actually models (base
/// address and limit, plus the handful of flag bits the GS-relative memory
/// accesses in `crate::emulator` care about). Access/type bytes that a real
/// LDT descriptor carries but nothing here reads are not represented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LdtEntry {
    pub base: u32,
    pub limit: u32,
    pub flags: LdtFlags,
}

impl LdtEntry {
    pub fn for_tls_base(base: u32) -> LdtEntry {
        LdtEntry { base, limit: 0xFFFF_FFFF, flags: LdtFlags::SEG_32BIT | LdtFlags::PRESENT }
    }
}

#[derive(Default)]
struct GsState {
    ldt: Vec<Option<LdtEntry>>,
    virtual_gs: u16,
}

impl GsState {
    fn new() -> GsState {
        GsState { ldt: vec![None; LDT_CAPACITY], virtual_gs: 0 }
    }
}

thread_local! {
    static STATE: RefCell<GsState> = RefCell::new(GsState::new());
}

/// Decodes a GS selector value into an LDT slot index.
pub fn decode_selector(gs_value: u16) -> Result<usize, GsError> {
    if gs_value < 3 || (gs_value - 3) % 8 != 0 {
        return Err(GsError::SlotOutOfRange);
    }
    let slot = ((gs_value - 3) >> 3) as usize;
    if slot >= LDT_CAPACITY {
        return Err(GsError::SlotOutOfRange);
    }
    Ok(slot)
}

/// Encodes an LDT slot index back into the GS selector value that names it.
pub fn encode_selector(slot: usize) -> u16 {
    (slot as u16) * 8 + 3
}

/// Allocates the first free LDT slot for the calling thread, installs
/// `entry` there, and returns the GS selector value that names it.
pub fn allocate(entry: LdtEntry) -> Result<u16, GsError> {
    STATE.with(|s| {
        let mut s = s.borrow_mut();
        let slot = s.ldt.iter().position(Option::is_none).ok_or(GsError::Exhausted)?;
        s.ldt[slot] = Some(entry);
        Ok(encode_selector(slot))
    })
}

/// Frees the LDT slot named by `gs_value` on the calling thread.
pub fn free(gs_value: u16) -> Result<(), GsError> {
    let slot = decode_selector(gs_value)?;
    STATE.with(|s| {
        let mut s = s.borrow_mut();
        if s.ldt[slot].take().is_none() {
            return Err(GsError::SlotNotAllocated);
        }
        Ok(())
    })
}

/// Looks up the LDT entry named by `gs_value` on the calling thread.
pub fn get(gs_value: u16) -> Result<LdtEntry, GsError> {
    let slot = decode_selector(gs_value)?;
    STATE.with(|s| s.borrow().ldt[slot].ok_or(GsError::SlotNotAllocated))
}

/// Resolves the current virtual GS selector's base address, for use as the
/// segment base in a GS-relative effective-address computation.
pub fn gs_base_address() -> Result<u32, GsError> {
    let gs = STATE.with(|s| s.borrow().virtual_gs);
    get(gs).map(|e| e.base)
}

pub fn virtual_gs() -> u16 {
    STATE.with(|s| s.borrow().virtual_gs)
}

pub fn set_virtual_gs(gs_value: u16) {
    STATE.with(|s| s.borrow_mut().virtual_gs = gs_value);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trip_over_full_range() {
        for slot in [0usize, 1, 2, 100, LDT_CAPACITY - 1] {
            let sel = encode_selector(slot);
            assert_eq!(decode_selector(sel).unwrap(), slot);
        }
    }

    #[test]
    fn decode_rejects_values_not_on_an_eight_byte_boundary_past_three() {
        assert_eq!(decode_selector(0), Err(GsError::SlotOutOfRange));
        assert_eq!(decode_selector(2), Err(GsError::SlotOutOfRange));
        assert_eq!(decode_selector(5), Err(GsError::SlotOutOfRange));
    }

    #[test]
    fn allocate_hands_out_first_free_slot_and_free_reclaims_it() {
        let sel_a = allocate(LdtEntry::for_tls_base(0x1000)).unwrap();
        let sel_b = allocate(LdtEntry::for_tls_base(0x2000)).unwrap();
        assert_ne!(sel_a, sel_b);
        assert_eq!(get(sel_a).unwrap().base, 0x1000);
        free(sel_a).unwrap();
        let sel_c = allocate(LdtEntry::for_tls_base(0x3000)).unwrap();
        assert_eq!(sel_c, sel_a, "freed slot should be reused before a new one");
        free(sel_b).unwrap();
        free(sel_c).unwrap();
    }

    #[test]
    fn double_free_is_rejected() {
        let sel = allocate(LdtEntry::for_tls_base(0x4000)).unwrap();
        free(sel).unwrap();
        assert_eq!(free(sel), Err(GsError::SlotNotAllocated));
    }

    #[test]
    fn set_and_read_virtual_gs() {
        let sel = allocate(LdtEntry::for_tls_base(0x5000)).unwrap();
        set_virtual_gs(sel);
        assert_eq!(virtual_gs(), sel);
        assert_eq!(gs_base_address().unwrap(), 0x5000);
        free(sel).unwrap();
    }
}
