//! Per-platform calling-convention tables.
//!
//! Two profiles only (spec.md §4.B): System-V AMD64 and Windows x64. Unlike
//! `cranelift-codegen`'s [`crate::abi`]-style legalizer, which splits and
//! converts arbitrary-width arguments across an arbitrary number of ISAs,
//! this table is small and closed: exactly two profiles, a fixed integer
//! and float register count each, and no stack-spill path (spec.md
//! Non-goals: "variadic C calls"; exceeding the table is a fatal build
//! error, not a spill).

use crate::error::JitError;
use crate::regs::{Reg, Xmm};

/// Which native calling convention the emitted trampolines target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Abi {
    SysV,
    Win64,
}

impl Abi {
    /// The ABI of the host this crate was compiled for. This backend only
    /// ever targets the host (spec.md Non-goals: "architectures other than
    /// x86-64"), so there is no cross-compilation knob.
    pub const fn host() -> Abi {
        if cfg!(windows) {
            Abi::Win64
        } else {
            Abi::SysV
        }
    }

    /// Integer argument registers, in order.
    pub const fn int_args(self) -> &'static [Reg] {
        match self {
            Abi::SysV => &[Reg::Rdi, Reg::Rsi, Reg::Rdx, Reg::Rcx, Reg::R8, Reg::R9],
            Abi::Win64 => &[Reg::Rcx, Reg::Rdx, Reg::R8, Reg::R9],
        }
    }

    /// Floating-point argument registers, in order.
    pub const fn float_args(self) -> &'static [Xmm] {
        match self {
            Abi::SysV => &[
                Xmm::Xmm0,
                Xmm::Xmm1,
                Xmm::Xmm2,
                Xmm::Xmm3,
                Xmm::Xmm4,
                Xmm::Xmm5,
                Xmm::Xmm6,
                Xmm::Xmm7,
            ],
            Abi::Win64 => &[Xmm::Xmm0, Xmm::Xmm1, Xmm::Xmm2, Xmm::Xmm3],
        }
    }

    /// Bytes of shadow space the caller must reserve below the call before
    /// issuing `call`, and release afterward.
    pub const fn shadow_space(self) -> i32 {
        match self {
            Abi::SysV => 0,
            Abi::Win64 => 32,
        }
    }

    /// Integer return register.
    pub const fn int_return(self) -> Reg {
        Reg::Rax
    }

    /// Float return register.
    pub const fn float_return(self) -> Xmm {
        Xmm::Xmm0
    }

    /// Look up the integer argument register for position `index`, or a
    /// "too many args" error (spec.md §4.B: "Exceeding the per-profile
    /// register count raises a fatal ... error (no spill to stack)").
    pub fn int_arg(self, index: usize) -> Result<Reg, JitError> {
        self.int_args()
            .get(index)
            .copied()
            .ok_or(JitError::TooManyArguments {
                index,
                max: self.int_args().len(),
            })
    }

    /// Look up the float argument register for position `index`.
    pub fn float_arg(self, index: usize) -> Result<Xmm, JitError> {
        self.float_args()
            .get(index)
            .copied()
            .ok_or(JitError::TooManyArguments {
                index,
                max: self.float_args().len(),
            })
    }
}
