//! Fault-driven instruction emulator.
//!
//! A guest thread never executes `int 0x80` or a GS-relative access on real
//! hardware GS — both fault (invalid opcode or segment-not-present,
//! depending on the host) the instant the CPU hits them. The host fault
//! binding (`crate::fault`) catches that fault, hands us the trap frame and
//! a byte slice starting at the faulting `EIP`, and we try each handler in
//! [`STEP_TABLE`] order until one recognizes the bytes.
//!
//! Guest and emulator share one address space: a GS-relative operand's
//! effective address, once the segment base is folded in, is a plain
//! pointer into this process's memory, not a separate guest memory object.

use crate::decoder::{decode_modrm, Operand, OperandSize};
use crate::error::EmulatorOutcome;
use crate::gs;
use crate::trapframe::{Flag, GpReg, TrapFrame};

/// Receives a fully-decoded `int 0x80` and fills in `tf.eax` with the
/// guest-visible result. Implemented by `crate::syscall_bridge::Bridge`;
/// kept as a trait here so this module never depends on the RPC crate.
pub trait SyscallDispatch {
    fn dispatch(&self, tf: &mut TrapFrame);
}

/// Offers the bytes at `tf.eip` (read from `code`, which must start at
/// `tf.eip`) to each handler in turn. On a match, the handler mutates `tf`
/// (including advancing `eip` past the whole instruction) and `Handled` is
/// returned. On no match, `tf` is left byte-for-byte as it was.
pub fn step(tf: &mut TrapFrame, code: &[u8], dispatch: &dyn SyscallDispatch) -> EmulatorOutcome {
    for handler in STEP_TABLE {
        if let Some(consumed) = handler(tf, code, dispatch) {
            tf.eip = tf.eip.wrapping_add(consumed as u32);
            return EmulatorOutcome::Handled;
        }
    }
    EmulatorOutcome::Unrecognized
}

type Handler = fn(&mut TrapFrame, &[u8], &dyn SyscallDispatch) -> Option<usize>;

/// Order matters only in that every entry here has a distinct, unambiguous
/// leading byte (`0xCD`, `0x8E`, or `0x65`) so there is nothing to prioritize.
static STEP_TABLE: &[Handler] = &[
    int_80,
    mov_sreg_rm16,
    add_r32_gsrm32,
    xor_r32_gsrm32,
    cmp_gsrm32_imm8,
    mov_gsrm32_r32,
    mov_r32_gsrm32,
    mov_eax_gsmoffs32,
    mov_gsmoffs32_eax,
    mov_gsrm32_imm32,
];

fn int_80(tf: &mut TrapFrame, code: &[u8], dispatch: &dyn SyscallDispatch) -> Option<usize> {
    if code.first().copied()? != 0xCD || code.get(1).copied()? != 0x80 {
        return None;
    }
    dispatch.dispatch(tf);
    Some(2)
}

/// `mov gs, r/m16` (opcode `0x8E /5`). Other `mov Sreg, r/m16` forms (ES,
/// CS, SS, DS, FS) are not ours to emulate and are left unrecognized.
fn mov_sreg_rm16(tf: &mut TrapFrame, code: &[u8], _d: &dyn SyscallDispatch) -> Option<usize> {
    if code.first().copied()? != 0x8E {
        return None;
    }
    let rest = &code[1..];
    let d = decode_modrm(rest, tf, OperandSize::Word)?;
    if d.reg_field as u8 != GpReg::Ebp as u8 {
        // reg field 5 == GS in the Sreg encoding; GpReg::Ebp also happens to
        // be index 5, reused here only to get the numeric compare for free.
        return None;
    }
    let value = read16(&d.operand, tf);
    gs::set_virtual_gs(value);
    Some(1 + d.len)
}

fn add_r32_gsrm32(tf: &mut TrapFrame, code: &[u8], _d: &dyn SyscallDispatch) -> Option<usize> {
    gs_prefixed_rm_op(tf, code, 0x03, |tf, dst_reg, mem_val| {
        let a = tf.reg32(dst_reg);
        let result = a.wrapping_add(mem_val);
        tf.set_reg32(dst_reg, result);
        set_add_flags(tf, a, mem_val, result);
    })
}

fn xor_r32_gsrm32(tf: &mut TrapFrame, code: &[u8], _d: &dyn SyscallDispatch) -> Option<usize> {
    gs_prefixed_rm_op(tf, code, 0x33, |tf, dst_reg, mem_val| {
        let result = tf.reg32(dst_reg) ^ mem_val;
        tf.set_reg32(dst_reg, result);
        tf.set_flag(Flag::Carry, false);
        tf.set_flag(Flag::Overflow, false);
        tf.set_flag(Flag::Zero, result == 0);
        tf.set_flag(Flag::Sign, (result as i32) < 0);
        tf.set_flag(Flag::Parity, parity_even(result as u8));
    })
}

/// Sets CF/OF/SF/ZF/PF/AF as real hardware does for `a + b == result`.
fn set_add_flags(tf: &mut TrapFrame, a: u32, b: u32, result: u32) {
    let carry = (a as u64 + b as u64) > u32::MAX as u64;
    let overflow = (!(a ^ b) & (a ^ result)) >> 31 != 0;
    tf.set_flag(Flag::Carry, carry);
    tf.set_flag(Flag::Overflow, overflow);
    tf.set_flag(Flag::Zero, result == 0);
    tf.set_flag(Flag::Sign, (result as i32) < 0);
    tf.set_flag(Flag::Parity, parity_even(result as u8));
    tf.set_flag(Flag::Adjust, (a ^ b ^ result) & 0x10 != 0);
}

/// Sets CF/OF/SF/ZF/PF/AF as real hardware does for `a - b == result`,
/// `borrow` being the already-computed unsigned-subtraction borrow.
fn set_sub_flags(tf: &mut TrapFrame, a: u32, b: u32, result: u32, borrow: bool) {
    let overflow = ((a ^ b) & (a ^ result)) >> 31 != 0;
    tf.set_flag(Flag::Carry, borrow);
    tf.set_flag(Flag::Overflow, overflow);
    tf.set_flag(Flag::Zero, result == 0);
    tf.set_flag(Flag::Sign, (result as i32) < 0);
    tf.set_flag(Flag::Parity, parity_even(result as u8));
    tf.set_flag(Flag::Adjust, (a ^ b ^ result) & 0x10 != 0);
}

fn parity_even(low_byte: u8) -> bool {
    low_byte.count_ones() % 2 == 0
}

fn mov_r32_gsrm32(tf: &mut TrapFrame, code: &[u8], _d: &dyn SyscallDispatch) -> Option<usize> {
    gs_prefixed_rm_op(tf, code, 0x8B, |tf, dst_reg, mem_val| {
        tf.set_reg32(dst_reg, mem_val);
    })
}

/// `cmp dword ptr gs:[r/m32], imm8` (opcode `0x83 /7 ib`, GS-prefixed). Sets
/// flags as if by subtraction; the memory operand is left unmodified.
fn cmp_gsrm32_imm8(tf: &mut TrapFrame, code: &[u8], _d: &dyn SyscallDispatch) -> Option<usize> {
    if code.first().copied()? != 0x65 || code.get(1).copied()? != 0x83 {
        return None;
    }
    let rest = &code[2..];
    let d = decode_modrm(rest, tf, OperandSize::Dword)?;
    if d.reg_field as u8 != 7 {
        return None;
    }
    let imm = *rest.get(d.len)? as i8 as i32 as u32;
    let mem_val = read_mem_dword(&d.operand, tf)?;
    let (result, borrow) = mem_val.overflowing_sub(imm);
    set_sub_flags(tf, mem_val, imm, result, borrow);
    Some(2 + d.len + 1)
}

fn mov_gsrm32_r32(tf: &mut TrapFrame, code: &[u8], _d: &dyn SyscallDispatch) -> Option<usize> {
    if code.first().copied()? != 0x65 || code.get(1).copied()? != 0x89 {
        return None;
    }
    let rest = &code[2..];
    let d = decode_modrm(rest, tf, OperandSize::Dword)?;
    let addr = mem_addr(&d.operand)?;
    let value = tf.reg32(d.reg_field);
    write_mem_dword(addr, value);
    Some(2 + d.len)
}

fn mov_gsrm32_imm32(tf: &mut TrapFrame, code: &[u8], _d: &dyn SyscallDispatch) -> Option<usize> {
    if code.first().copied()? != 0x65 || code.get(1).copied()? != 0xC7 {
        return None;
    }
    let rest = &code[2..];
    let d = decode_modrm(rest, tf, OperandSize::Dword)?;
    if d.reg_field as u8 != 0 {
        return None;
    }
    let addr = mem_addr(&d.operand)?;
    let imm = u32::from_le_bytes(rest.get(d.len..d.len + 4)?.try_into().ok()?);
    write_mem_dword(addr, imm);
    Some(2 + d.len + 4)
}

fn mov_eax_gsmoffs32(tf: &mut TrapFrame, code: &[u8], _d: &dyn SyscallDispatch) -> Option<usize> {
    if code.first().copied()? != 0x65 || code.get(1).copied()? != 0xA1 {
        return None;
    }
    let disp = u32::from_le_bytes(code.get(2..6)?.try_into().ok()?);
    let base = gs::gs_base_address().ok()?;
    let value = unsafe { std::ptr::read_volatile(base.wrapping_add(disp) as *const u32) };
    tf.eax = value;
    Some(6)
}

fn mov_gsmoffs32_eax(tf: &mut TrapFrame, code: &[u8], _d: &dyn SyscallDispatch) -> Option<usize> {
    if code.first().copied()? != 0x65 || code.get(1).copied()? != 0xA3 {
        return None;
    }
    let disp = u32::from_le_bytes(code.get(2..6)?.try_into().ok()?);
    let base = gs::gs_base_address().ok()?;
    unsafe { std::ptr::write_volatile(base.wrapping_add(disp) as *mut u32, tf.eax) };
    Some(6)
}

/// Shared shape for the `0x65 <op> /r` family: decode a dword ModR/M, fold
/// in the GS base, read the memory operand, and hand it plus the `reg`
/// field's register to `apply`.
fn gs_prefixed_rm_op(
    tf: &mut TrapFrame,
    code: &[u8],
    opcode: u8,
    apply: impl FnOnce(&mut TrapFrame, GpReg, u32),
) -> Option<usize> {
    if code.first().copied()? != 0x65 || code.get(1).copied()? != opcode {
        return None;
    }
    let rest = &code[2..];
    let d = decode_modrm(rest, tf, OperandSize::Dword)?;
    let mem_val = read_mem_dword(&d.operand, tf)?;
    apply(tf, d.reg_field, mem_val);
    Some(2 + d.len)
}

fn mem_addr(op: &Operand) -> Option<u32> {
    match op {
        Operand::Mem(addr) => Some(*addr),
        _ => None,
    }
}

fn read_mem_dword(op: &Operand, _tf: &TrapFrame) -> Option<u32> {
    let offset = mem_addr(op)?;
    let base = gs::gs_base_address().ok()?;
    Some(unsafe { std::ptr::read_volatile(base.wrapping_add(offset) as *const u32) })
}

fn write_mem_dword(offset: u32, value: u32) {
    if let Ok(base) = gs::gs_base_address() {
        unsafe { std::ptr::write_volatile(base.wrapping_add(offset) as *mut u32, value) };
    }
}

fn read16(op: &Operand, tf: &TrapFrame) -> u16 {
    match op {
        Operand::Reg16(r) => tf.reg16(*r),
        Operand::Mem(addr) => {
            let base = gs::gs_base_address().unwrap_or(0);
            unsafe { std::ptr::read_volatile(base.wrapping_add(*addr) as *const u16) }
        }
        _ => 0,
    }
}
