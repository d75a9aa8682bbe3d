//! Raw x86-64 instruction encoding.
//!
//! One free function per instruction form, each appending bytes directly to
//! a [`Vec<u8>`] (see DESIGN.md for the encoder's grounding). `cranelift-codegen`
//! contributed the higher-level structure this module plugs into (label
//! buffer, relocations, ABI tables); this module only emits bytes.
//!
//! Only the instruction forms the instruction/control/invoke emitters
//! actually need are implemented — this is not a general-purpose assembler.

use crate::regs::{Reg, Xmm};

#[inline]
fn rex(w: bool, r: bool, x: bool, b: bool) -> u8 {
    0x40 | ((w as u8) << 3) | ((r as u8) << 2) | ((x as u8) << 1) | (b as u8)
}

#[inline]
fn modrm(modbits: u8, reg: u8, rm: u8) -> u8 {
    (modbits << 6) | ((reg & 7) << 3) | (rm & 7)
}

/// Emits a REX prefix iff one of the W/R/X/B bits is set, or either
/// register touches the sil/dil/bpl/spl byte-register trap (not relevant
/// here since we never emit 8-bit operand forms other than SETcc's
/// destination, which is always encoded through a temp register).
fn push_rex_if_needed(out: &mut Vec<u8>, w: bool, r: bool, x: bool, b: bool) {
    if w || r || x || b {
        out.push(rex(w, r, x, b));
    }
}

/// A memory operand `[base + disp32]`, always encoded with a 32-bit
/// displacement (mod=10) for simplicity — emitted code is never so
/// size-sensitive that omitting a redundant zero-displacement byte matters.
#[derive(Debug, Clone, Copy)]
pub struct Mem {
    pub base: Reg,
    pub disp: i32,
}

impl Mem {
    pub const fn new(base: Reg, disp: i32) -> Self {
        Mem { base, disp }
    }

    fn encode(self, out: &mut Vec<u8>, reg_field: u8) {
        out.push(modrm(0b10, reg_field, self.base.low_bits()));
        // rsp/r12 as a base needs a SIB byte encoding "base, no index".
        if self.base.low_bits() == 0b100 {
            out.push(0x24);
        }
        out.extend_from_slice(&self.disp.to_le_bytes());
    }
}

/// `mov dst, src` (64-bit register to register).
pub fn mov_rr(out: &mut Vec<u8>, dst: Reg, src: Reg) {
    push_rex_if_needed(out, true, src.is_extended(), false, dst.is_extended());
    out.push(0x89);
    out.push(modrm(0b11, src.low_bits(), dst.low_bits()));
}

/// `mov dst, imm64` (materializes a 64-bit immediate).
pub fn mov_ri64(out: &mut Vec<u8>, dst: Reg, imm: i64) {
    push_rex_if_needed(out, true, false, false, dst.is_extended());
    out.push(0xB8 + dst.low_bits());
    out.extend_from_slice(&imm.to_le_bytes());
}

/// `mov dword_or_qword dst, [base+disp]` (load).
pub fn mov_rm(out: &mut Vec<u8>, dst: Reg, mem: Mem) {
    push_rex_if_needed(out, true, dst.is_extended(), false, mem.base.is_extended());
    out.push(0x8B);
    mem.encode(out, dst.low_bits());
}

/// `mov [base+disp], src` (store, 64-bit).
pub fn mov_mr(out: &mut Vec<u8>, mem: Mem, src: Reg) {
    push_rex_if_needed(out, true, src.is_extended(), false, mem.base.is_extended());
    out.push(0x89);
    mem.encode(out, src.low_bits());
}

/// `mov [base+disp], imm32` (store a sign-extended 32-bit immediate into a
/// 64-bit slot).
pub fn mov_mi32(out: &mut Vec<u8>, mem: Mem, imm: i32) {
    push_rex_if_needed(out, true, false, false, mem.base.is_extended());
    out.push(0xC7);
    mem.encode(out, 0);
    out.extend_from_slice(&imm.to_le_bytes());
}

/// `mov word [base+disp], imm16` — used for the 16-bit `header.size` field.
pub fn mov_mi16(out: &mut Vec<u8>, mem: Mem, imm: u16) {
    out.push(0x66);
    push_rex_if_needed(out, false, false, false, mem.base.is_extended());
    out.push(0xC7);
    mem.encode(out, 0);
    out.extend_from_slice(&imm.to_le_bytes());
}

/// `mov dword [base+disp], src32` — used for 32-bit fields like
/// `header.owner`/`return_type`.
pub fn mov_m_r32(out: &mut Vec<u8>, mem: Mem, src: Reg) {
    push_rex_if_needed(out, false, src.is_extended(), false, mem.base.is_extended());
    out.push(0x89);
    mem.encode(out, src.low_bits());
}

/// `mov dword [base+disp], imm32` (no sign extension; true 32-bit store).
pub fn mov_m_imm32(out: &mut Vec<u8>, mem: Mem, imm: i32) {
    push_rex_if_needed(out, false, false, false, mem.base.is_extended());
    out.push(0xC7);
    mem.encode(out, 0);
    out.extend_from_slice(&imm.to_le_bytes());
}

/// `movzx dst32, [base+disp] (dword)` — used to read 32-bit fields like
/// `thread_id` without sign-extending.
pub fn mov_r32_m(out: &mut Vec<u8>, dst: Reg, mem: Mem) {
    push_rex_if_needed(out, false, dst.is_extended(), false, mem.base.is_extended());
    out.push(0x8B);
    mem.encode(out, dst.low_bits());
}

macro_rules! alu_rr {
    ($name:ident, $opcode:expr) => {
        /// ALU register-register form (dst is the r/m operand).
        pub fn $name(out: &mut Vec<u8>, dst: Reg, src: Reg) {
            push_rex_if_needed(out, true, src.is_extended(), false, dst.is_extended());
            out.push($opcode);
            out.push(modrm(0b11, src.low_bits(), dst.low_bits()));
        }
    };
}

alu_rr!(add_rr, 0x01);
alu_rr!(sub_rr, 0x29);
alu_rr!(xor_rr, 0x31);
alu_rr!(and_rr, 0x21);
alu_rr!(cmp_rr, 0x39);
alu_rr!(test_rr, 0x85);

/// `imul dst, src` (two-operand signed multiply).
pub fn imul_rr(out: &mut Vec<u8>, dst: Reg, src: Reg) {
    push_rex_if_needed(out, true, dst.is_extended(), false, src.is_extended());
    out.push(0x0F);
    out.push(0xAF);
    out.push(modrm(0b11, dst.low_bits(), src.low_bits()));
}

/// `add dst, imm32` (sign-extended).
pub fn add_ri32(out: &mut Vec<u8>, dst: Reg, imm: i32) {
    push_rex_if_needed(out, true, false, false, dst.is_extended());
    out.push(0x81);
    out.push(modrm(0b11, 0, dst.low_bits()));
    out.extend_from_slice(&imm.to_le_bytes());
}

/// `sub dst, imm32`.
pub fn sub_ri32(out: &mut Vec<u8>, dst: Reg, imm: i32) {
    push_rex_if_needed(out, true, false, false, dst.is_extended());
    out.push(0x81);
    out.push(modrm(0b11, 5, dst.low_bits()));
    out.extend_from_slice(&imm.to_le_bytes());
}

/// `cmp dst, imm32`.
pub fn cmp_ri32(out: &mut Vec<u8>, dst: Reg, imm: i32) {
    push_rex_if_needed(out, true, false, false, dst.is_extended());
    out.push(0x81);
    out.push(modrm(0b11, 7, dst.low_bits()));
    out.extend_from_slice(&imm.to_le_bytes());
}

/// `cmp qword [base+disp], imm32`.
pub fn cmp_mi32(out: &mut Vec<u8>, mem: Mem, imm: i32) {
    push_rex_if_needed(out, true, false, false, mem.base.is_extended());
    out.push(0x81);
    mem.encode(out, 7);
    out.extend_from_slice(&imm.to_le_bytes());
}

/// `test word [base+disp], imm16` — the write-barrier/flags bit test.
pub fn test_mi16(out: &mut Vec<u8>, mem: Mem, imm: u16) {
    out.push(0x66);
    push_rex_if_needed(out, false, false, false, mem.base.is_extended());
    out.push(0xF7);
    mem.encode(out, 0);
    out.extend_from_slice(&imm.to_le_bytes());
}

/// `inc qword [base+disp]`.
pub fn inc_m(out: &mut Vec<u8>, mem: Mem) {
    push_rex_if_needed(out, true, false, false, mem.base.is_extended());
    out.push(0xFF);
    mem.encode(out, 0);
}

/// `dec qword [base+disp]`.
pub fn dec_m(out: &mut Vec<u8>, mem: Mem) {
    push_rex_if_needed(out, true, false, false, mem.base.is_extended());
    out.push(0xFF);
    mem.encode(out, 1);
}

/// `cqo` (sign-extend RAX into RDX:RAX).
pub fn cqo(out: &mut Vec<u8>) {
    out.push(rex(true, false, false, false));
    out.push(0x99);
}

/// `idiv divisor` (RDX:RAX / divisor; quotient in RAX, remainder in RDX).
pub fn idiv_r(out: &mut Vec<u8>, divisor: Reg) {
    push_rex_if_needed(out, true, false, false, divisor.is_extended());
    out.push(0xF7);
    out.push(modrm(0b11, 7, divisor.low_bits()));
}

/// SETcc condition codes used by the comparison opcodes (spec.md §4.E).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cond {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Zero,
    NotZero,
}

impl Cond {
    fn setcc_opcode(self) -> u8 {
        match self {
            Cond::Eq | Cond::Zero => 0x94,
            Cond::Ne | Cond::NotZero => 0x95,
            Cond::Lt => 0x9C,
            Cond::Ge => 0x9D,
            Cond::Le => 0x9E,
            Cond::Gt => 0x9F,
        }
    }

    fn jcc_opcode(self) -> u8 {
        // Jcc rel32 second opcode byte is SETcc's opcode + 0x10.
        self.setcc_opcode() + 0x10
    }
}

/// `setcc dst8` then `movzx dst64, dst8` — always paired per spec.md §4.E
/// ("copy the right comparison bit... zero extend"), so exposed as a single
/// helper rather than two calls a caller could forget to pair.
pub fn setcc_and_zero_extend(out: &mut Vec<u8>, cond: Cond, dst: Reg) {
    // setcc r/m8. Registers 4..=7 (rsp/rbp/rsi/rdi) need a REX prefix to
    // address their low byte instead of ah/ch/dh/bh; emitting REX
    // unconditionally when dst is extended, or whenever dst is in 4..=7,
    // keeps this correct for every temp register we actually use.
    let needs_rex_for_low_byte = matches!(dst, Reg::Rsp | Reg::Rbp | Reg::Rsi | Reg::Rdi);
    if dst.is_extended() || needs_rex_for_low_byte {
        out.push(rex(false, false, false, dst.is_extended()));
    }
    out.push(0x0F);
    out.push(cond.setcc_opcode());
    out.push(modrm(0b11, 0, dst.low_bits()));
    // movzx dst64, dst8
    push_rex_if_needed(out, true, dst.is_extended(), false, dst.is_extended());
    out.push(0x0F);
    out.push(0xB6);
    out.push(modrm(0b11, dst.low_bits(), dst.low_bits()));
}

/// `jmp rel32` with a placeholder displacement; returns the byte offset of
/// the 4-byte displacement field for later patching.
pub fn jmp_rel32_placeholder(out: &mut Vec<u8>) -> usize {
    out.push(0xE9);
    let at = out.len();
    out.extend_from_slice(&0i32.to_le_bytes());
    at
}

/// `jcc rel32` with a placeholder displacement; returns the patch offset.
pub fn jcc_rel32_placeholder(out: &mut Vec<u8>, cond: Cond) -> usize {
    out.push(0x0F);
    out.push(cond.jcc_opcode());
    let at = out.len();
    out.extend_from_slice(&0i32.to_le_bytes());
    at
}

/// Patches a previously emitted rel32 displacement so that it lands on
/// `target_offset`, given the instruction's displacement field sits at
/// `patch_offset` within `buf`.
pub fn patch_rel32(buf: &mut [u8], patch_offset: usize, target_offset: usize) {
    let rel = (target_offset as i64) - (patch_offset as i64 + 4);
    let rel = rel as i32;
    buf[patch_offset..patch_offset + 4].copy_from_slice(&rel.to_le_bytes());
}

/// `push r64`.
pub fn push_r(out: &mut Vec<u8>, r: Reg) {
    if r.is_extended() {
        out.push(rex(false, false, false, true));
    }
    out.push(0x50 + r.low_bits());
}

/// `pop r64`.
pub fn pop_r(out: &mut Vec<u8>, r: Reg) {
    if r.is_extended() {
        out.push(rex(false, false, false, true));
    }
    out.push(0x58 + r.low_bits());
}

/// `lea dst, [base+disp]`.
pub fn lea(out: &mut Vec<u8>, dst: Reg, mem: Mem) {
    push_rex_if_needed(out, true, dst.is_extended(), false, mem.base.is_extended());
    out.push(0x8D);
    mem.encode(out, dst.low_bits());
}

/// `lea dst, [rip + disp32]` with a placeholder displacement; returns the
/// patch offset. `patch_rel32`'s `target - (patch_at + 4)` arithmetic is
/// exactly RIP-relative addressing, so the same fixup machinery used for
/// `jmp`/`jcc` also resolves this — used to materialize a label's absolute
/// address (e.g. a re-entry point stashed in a frame field) without a
/// separate post-link relocation pass.
pub fn lea_rip_placeholder(out: &mut Vec<u8>, dst: Reg) -> usize {
    push_rex_if_needed(out, true, dst.is_extended(), false, false);
    out.push(0x8D);
    out.push(modrm(0b00, dst.low_bits(), 0b101));
    let at = out.len();
    out.extend_from_slice(&0i32.to_le_bytes());
    at
}

/// `call dst` (indirect, through a register).
pub fn call_r(out: &mut Vec<u8>, dst: Reg) {
    push_rex_if_needed(out, false, false, false, dst.is_extended());
    out.push(0xFF);
    out.push(modrm(0b11, 2, dst.low_bits()));
}

/// `jmp dst` (indirect, through a register) — used for the tail jump into
/// a block's entry label at the end of the prologue.
pub fn jmp_r(out: &mut Vec<u8>, dst: Reg) {
    push_rex_if_needed(out, false, false, false, dst.is_extended());
    out.push(0xFF);
    out.push(modrm(0b11, 4, dst.low_bits()));
}

/// `ret`.
pub fn ret(out: &mut Vec<u8>) {
    out.push(0xC3);
}

/// `push rbp; mov rbp, rsp`.
pub fn push_rbp_and_move(out: &mut Vec<u8>) {
    push_r(out, Reg::Rbp);
    mov_rr(out, Reg::Rbp, Reg::Rsp);
}

/// `mov rsp, rbp; pop rbp`.
pub fn restore_rsp_and_pop_rbp(out: &mut Vec<u8>) {
    mov_rr(out, Reg::Rsp, Reg::Rbp);
    pop_r(out, Reg::Rbp);
}

// --- SSE2 scalar double-precision forms -------------------------------

fn sse_prefix(out: &mut Vec<u8>, needs_rex: bool, r: bool, b: bool) {
    out.push(0xF2);
    if needs_rex || r || b {
        out.push(rex(false, r, false, b));
    }
}

/// `movsd xmm_dst, [base+disp]`.
pub fn movsd_load(out: &mut Vec<u8>, dst: Xmm, mem: Mem) {
    sse_prefix(out, false, dst.enc() >= 8, mem.base.is_extended());
    out.push(0x0F);
    out.push(0x10);
    mem.encode(out, dst.enc() & 7);
}

/// `movsd [base+disp], xmm_src`.
pub fn movsd_store(out: &mut Vec<u8>, mem: Mem, src: Xmm) {
    sse_prefix(out, false, src.enc() >= 8, mem.base.is_extended());
    out.push(0x0F);
    out.push(0x11);
    mem.encode(out, src.enc() & 7);
}

macro_rules! sse_arith {
    ($name:ident, $opcode:expr) => {
        /// Scalar double-precision arithmetic, memory right-hand side.
        pub fn $name(out: &mut Vec<u8>, dst: Xmm, mem: Mem) {
            sse_prefix(out, false, dst.enc() >= 8, mem.base.is_extended());
            out.push(0x0F);
            out.push($opcode);
            mem.encode(out, dst.enc() & 7);
        }
    };
}

sse_arith!(addsd_mem, 0x58);
sse_arith!(subsd_mem, 0x5C);
sse_arith!(mulsd_mem, 0x59);
sse_arith!(divsd_mem, 0x5E);

/// `cvtsi2sd xmm_dst, qword [base+disp]` (int64 memory operand -> double).
pub fn cvtsi2sd_mem(out: &mut Vec<u8>, dst: Xmm, mem: Mem) {
    out.push(0xF2);
    out.push(rex(true, dst.enc() >= 8, false, mem.base.is_extended()));
    out.push(0x0F);
    out.push(0x2A);
    mem.encode(out, dst.enc() & 7);
}

/// `cvttsd2si dst64, qword [base+disp]` (double memory operand -> int64,
/// truncating toward zero).
pub fn cvttsd2si_mem(out: &mut Vec<u8>, dst: Reg, mem: Mem) {
    out.push(0xF2);
    out.push(rex(true, dst.is_extended(), false, mem.base.is_extended()));
    out.push(0x0F);
    out.push(0x2C);
    mem.encode(out, dst.low_bits());
}
