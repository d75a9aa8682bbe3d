//! Compile-time error conditions.
//!
//! Every variant here corresponds to a "fatal at compile time" condition in
//! the original design: the block being JITed is abandoned and the caller
//! falls back to interpreting it. None of these represent runtime behavior
//! (guard mismatches and deopts are not errors; see [`crate::emit::control`]).

use crate::buffer::LabelId;
use thiserror::Error;

/// Reasons a basic block cannot be compiled.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JitError {
    /// No emitter (or tree template) exists for this opcode.
    #[error("can't JIT opcode {0}")]
    UnsupportedOpcode(u16),

    /// A C-call spec carried a varargs flag; this backend never supports it.
    #[error("JIT can't handle varargs")]
    Varargs,

    /// A C-call or invoke tried to pass more arguments than the target
    /// ABI profile has registers for.
    #[error("can't JIT more than {max} arguments (got index {index})")]
    TooManyArguments { index: usize, max: usize },

    /// A branch or guard referenced a label that was never bound before
    /// `link()` was called.
    #[error("unresolved label {0:?}")]
    UnresolvedLabel(LabelId),

    /// The host's `MVMReturnType`-equivalent field isn't 32 bits wide.
    /// Indicates a mismatched runtime layout, not a recoverable condition.
    #[error("return_type field must be 32 bits wide, layout reports {actual}")]
    ReturnTypeWidth { actual: usize },
}
