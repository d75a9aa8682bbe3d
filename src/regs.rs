//! The fixed x86-64 register assignment.
//!
//! This backend does not run a register allocator (spec.md Non-goals): four
//! callee-saved host registers are permanently pinned to VM roles, saved in
//! the prologue and restored in the epilogue. Everything else is drawn from
//! a small pool of named temporaries. Mirrors the `PINNED_REG` convention in
//! `cranelift-codegen`'s AArch64 backend (one fixed register reserved for a
//! VM-wide role), generalized to four roles and a temp pool instead of one.

/// A general-purpose x86-64 register, identified by its 4-bit encoding
/// (0-7 need no REX bit, 8-15 set REX.B/X/R).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Reg {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl Reg {
    /// Low 3 bits of the encoding, used directly in a ModRM/opcode byte.
    pub const fn low_bits(self) -> u8 {
        (self as u8) & 0x7
    }

    /// Whether this register needs REX.B/X/R set (encoding >= 8).
    pub const fn is_extended(self) -> bool {
        (self as u8) & 0x8 != 0
    }

    pub const fn enc(self) -> u8 {
        self as u8
    }
}

/// An SSE register used for the two floating-point roles this backend needs
/// (`RVF` and the scratch float accumulator); argument marshaling addresses
/// the rest positionally through [`crate::abi::Abi`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Xmm {
    Xmm0 = 0,
    Xmm1 = 1,
    Xmm2 = 2,
    Xmm3 = 3,
    Xmm4 = 4,
    Xmm5 = 5,
    Xmm6 = 6,
    Xmm7 = 7,
}

impl Xmm {
    pub const fn enc(self) -> u8 {
        self as u8
    }
}

/// The four pinned VM-role registers (spec.md §3 "Fixed register assignment
/// (invariant)" / §4.C). Saved on entry, restored on exit; emitted code must
/// never clobber these except through the documented prologue/epilogue.
pub const TC: Reg = Reg::R14;
pub const WORK: Reg = Reg::Rbx;
pub const ARGS: Reg = Reg::R12;
pub const CU: Reg = Reg::R13;

/// Indirect-call target register: caller-saved, not used for argument
/// passing on either ABI profile, so it never needs to be preserved across
/// the marshaling sequence.
pub const FUNCTION: Reg = Reg::R10;

/// Integer return register.
pub const RV: Reg = Reg::Rax;
/// Floating-point return register.
pub const RVF: Xmm = Xmm::Xmm0;

/// The six caller-saved scratch registers available to the emitter. TMP1-4
/// double as the first four SysV integer argument registers; code that
/// needs a value to survive a call sequence must use TMP5/TMP6, or push/pop
/// around the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tmp {
    Tmp1,
    Tmp2,
    Tmp3,
    Tmp4,
    Tmp5,
    Tmp6,
}

impl Tmp {
    pub const fn reg(self) -> Reg {
        match self {
            Tmp::Tmp1 => Reg::Rcx,
            Tmp::Tmp2 => Reg::Rdx,
            Tmp::Tmp3 => Reg::R8,
            Tmp::Tmp4 => Reg::R9,
            Tmp::Tmp5 => Reg::R10,
            Tmp::Tmp6 => Reg::R11,
        }
    }
}

/// Size in bytes of a single VM register slot (`WORK`/`ARGS` are arrays of
/// these).
pub const REG_SIZE: i32 = 8;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pinned_registers_are_callee_saved_and_distinct() {
        let pinned = [TC, WORK, ARGS, CU];
        for (i, a) in pinned.iter().enumerate() {
            for (j, b) in pinned.iter().enumerate() {
                if i != j {
                    assert_ne!(a, b, "pinned registers must not alias");
                }
            }
        }
        // rbx, r12, r13, r14 are callee-saved under both SysV and Win64.
        for r in pinned {
            assert!(matches!(r, Reg::Rbx | Reg::R12 | Reg::R13 | Reg::R14));
        }
    }

    #[test]
    fn function_register_is_not_an_argument_register() {
        // FUNCTION (r10) must not collide with TMP1..TMP4, which double as
        // SysV argument registers.
        assert_ne!(FUNCTION, Tmp::Tmp1.reg());
        assert_ne!(FUNCTION, Tmp::Tmp2.reg());
        assert_ne!(FUNCTION, Tmp::Tmp3.reg());
        assert_ne!(FUNCTION, Tmp::Tmp4.reg());
    }

    #[test]
    fn extended_register_encoding() {
        assert!(!Reg::Rax.is_extended());
        assert!(!Reg::Rdi.is_extended());
        assert!(Reg::R8.is_extended());
        assert!(Reg::R15.is_extended());
        assert_eq!(Reg::R12.low_bits(), 0x4);
    }
}
