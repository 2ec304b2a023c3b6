//! ModR/M + SIB decoding for the small slice of 32-bit x86 instructions this
//! crate emulates (`int 0x80`, `mov`/`add`/`xor`/`cmp` against a GS-relative
//! operand, and `mov sreg, r/m16`).
//!
//! This follows the effective-address rules in the Intel SDM volume 2,
//! table 2-2/2-3, exactly as the reference ModR/M implementation this crate
//! was grounded on computes them — including the SIB `base == 5` special
//! case (no base register when `mod == 00`, `EBP + disp` otherwise) and the
//! register-direct byte-operand aliasing quirk below.

use crate::trapframe::{GpReg, TrapFrame};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandSize {
    Byte,
    Word,
    Dword,
}

/// A decoded ModR/M operand: either a register (already resolved to which
/// *part* of the register, since byte operands alias differently than
/// word/dword ones) or a memory effective address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    RegLow(GpReg),
    RegHigh(GpReg),
    Reg16(GpReg),
    Reg32(GpReg),
    Mem(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedModRm {
    /// Number of bytes consumed starting at (and including) the ModR/M byte
    /// itself: 1 for a bare ModR/M byte, plus 1 for a SIB byte and 1/4 for a
    /// displacement when present.
    pub len: usize,
    /// The ModR/M `reg` field, resolved to a GP register. Callers treat this
    /// either as the second operand or as an opcode-extension field
    /// depending on the instruction.
    pub reg_field: GpReg,
    pub operand: Operand,
}

/// Decodes a ModR/M byte (and any SIB byte / displacement that follows it)
/// at the start of `bytes`, resolving any memory operand's effective
/// address against the general-purpose registers in `tf`.
///
/// Returns `None` only if `bytes` is too short to contain the encoding the
/// leading mod/rm bits promise (truncated instruction stream).
pub fn decode_modrm(bytes: &[u8], tf: &TrapFrame, size: OperandSize) -> Option<DecodedModRm> {
    let modrm = *bytes.first()?;
    let md = modrm >> 6;
    let reg = (modrm >> 3) & 0b111;
    let rm = modrm & 0b111;
    let reg_field = GpReg::from_index(reg);

    if md == 0b11 {
        let operand = match size {
            OperandSize::Byte if rm < 4 => Operand::RegLow(GpReg::from_index(rm)),
            // mod=11 register-direct byte operands alias rm 4..7 onto the
            // *high* byte of EAX/ECX/EDX/EBX, not onto ESP/EBP/ESI/EDI.
            OperandSize::Byte => Operand::RegHigh(GpReg::from_index(rm - 4)),
            OperandSize::Word => Operand::Reg16(GpReg::from_index(rm)),
            OperandSize::Dword => Operand::Reg32(GpReg::from_index(rm)),
        };
        return Some(DecodedModRm { len: 1, reg_field, operand });
    }

    // Memory operand.
    if rm == 0b100 {
        // SIB byte follows.
        let sib = *bytes.get(1)?;
        let scale = sib >> 6;
        let index = (sib >> 3) & 0b111;
        let base = sib & 0b111;

        let index_val: u32 = if index == 0b100 {
            0
        } else {
            tf.reg32(GpReg::from_index(index)) << scale
        };

        let (base_val, disp_len): (u32, usize) = if base == 0b101 && md == 0b00 {
            let disp = i32::from_le_bytes(bytes.get(2..6)?.try_into().ok()?);
            (disp as u32, 4)
        } else {
            let base_val = tf.reg32(GpReg::from_index(base));
            match md {
                0b00 => (base_val, 0),
                0b01 => {
                    let disp = *bytes.get(2)? as i8 as i32;
                    (base_val.wrapping_add(disp as u32), 1)
                }
                _ => {
                    let disp = i32::from_le_bytes(bytes.get(2..6)?.try_into().ok()?);
                    (base_val.wrapping_add(disp as u32), 4)
                }
            }
        };

        let addr = base_val.wrapping_add(index_val);
        return Some(DecodedModRm { len: 2 + disp_len, reg_field, operand: Operand::Mem(addr) });
    }

    if rm == 0b101 && md == 0b00 {
        // Absolute disp32, no base register.
        let disp = i32::from_le_bytes(bytes.get(1..5)?.try_into().ok()?);
        return Some(DecodedModRm { len: 5, reg_field, operand: Operand::Mem(disp as u32) });
    }

    let base_val = tf.reg32(GpReg::from_index(rm));
    let (addr, disp_len) = match md {
        0b01 => {
            let disp = *bytes.get(1)? as i8 as i32;
            (base_val.wrapping_add(disp as u32), 1)
        }
        _ => {
            let disp = i32::from_le_bytes(bytes.get(1..5)?.try_into().ok()?);
            (base_val.wrapping_add(disp as u32), 4)
        }
    };
    Some(DecodedModRm { len: 1 + disp_len, reg_field, operand: Operand::Mem(addr) })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tf_with(reg: GpReg, val: u32) -> TrapFrame {
        let mut tf = TrapFrame::default();
        tf.set_reg32(reg, val);
        tf
    }

    #[test]
    fn register_direct_dword_maps_rm_to_named_register() {
        let tf = TrapFrame::default();
        // mod=11, reg=000, rm=100 (ESP)
        let d = decode_modrm(&[0b11_000_100], &tf, OperandSize::Dword).unwrap();
        assert_eq!(d.len, 1);
        assert_eq!(d.operand, Operand::Reg32(GpReg::Esp));
    }

    #[test]
    fn register_direct_byte_aliases_high_four_to_ah_ch_dh_bh() {
        let tf = TrapFrame::default();
        // mod=11, reg=000, rm=100 -> AH, not ESP
        let d = decode_modrm(&[0b11_000_100], &tf, OperandSize::Byte).unwrap();
        assert_eq!(d.operand, Operand::RegHigh(GpReg::Eax));
        // rm=000 -> AL
        let d = decode_modrm(&[0b11_000_000], &tf, OperandSize::Byte).unwrap();
        assert_eq!(d.operand, Operand::RegLow(GpReg::Eax));
    }

    #[test]
    fn disp32_no_base_is_absolute_address() {
        let tf = TrapFrame::default();
        // mod=00, reg=000, rm=101, disp32 = 0x1000
        let bytes = [0b00_000_101, 0x00, 0x10, 0x00, 0x00];
        let d = decode_modrm(&bytes, &tf, OperandSize::Dword).unwrap();
        assert_eq!(d.len, 5);
        assert_eq!(d.operand, Operand::Mem(0x1000));
    }

    #[test]
    fn mod01_rm_register_adds_signed_disp8() {
        let tf = tf_with(GpReg::Esi, 0x2000);
        // mod=01, reg=000, rm=110 (ESI), disp8 = -1
        let bytes = [0b01_000_110, 0xFF];
        let d = decode_modrm(&bytes, &tf, OperandSize::Dword).unwrap();
        assert_eq!(d.len, 2);
        assert_eq!(d.operand, Operand::Mem(0x1FFF));
    }

    #[test]
    fn sib_with_base5_mod0_is_disp32_only() {
        let tf = TrapFrame::default();
        // mod=00, rm=100 -> SIB; sib: scale=00,index=100(none),base=101
        let bytes = [0b00_000_100, 0b00_100_101, 0x10, 0x00, 0x00, 0x00];
        let d = decode_modrm(&bytes, &tf, OperandSize::Dword).unwrap();
        assert_eq!(d.len, 6);
        assert_eq!(d.operand, Operand::Mem(0x10));
    }

    #[test]
    fn sib_with_base5_mod1_uses_ebp_plus_disp8() {
        let tf = tf_with(GpReg::Ebp, 0x3000);
        let bytes = [0b01_000_100, 0b00_100_101, 0x04];
        let d = decode_modrm(&bytes, &tf, OperandSize::Dword).unwrap();
        assert_eq!(d.len, 3);
        assert_eq!(d.operand, Operand::Mem(0x3004));
    }

    #[test]
    fn sib_scales_index_register() {
        let mut tf = tf_with(GpReg::Edx, 0x10);
        tf.set_reg32(GpReg::Eax, 0x1000);
        // base=000(EAX), index=010(EDX), scale=10 (x4)
        let bytes = [0b00_000_100, 0b10_010_000];
        let d = decode_modrm(&bytes, &tf, OperandSize::Dword).unwrap();
        assert_eq!(d.operand, Operand::Mem(0x1000 + 0x10 * 4));
    }

    #[test]
    fn decoded_length_sums_modrm_sib_and_displacement_bytes() {
        let tf = TrapFrame::default();
        let bytes = [0b10_000_100, 0b00_000_000, 0x01, 0x00, 0x00, 0x00, 0xCC];
        let d = decode_modrm(&bytes, &tf, OperandSize::Dword).unwrap();
        // modrm(1) + sib(1) + disp32(4) == 6, trailing 0xCC not consumed
        assert_eq!(d.len, 6);
    }
}
