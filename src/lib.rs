//! The x86-64 JIT back-end core for a speshed VM IR (spec.md §1): a
//! structured emitter ([`emit`]) that lowers a linear sequence of IR nodes
//! ([`ir`]) into a growing code buffer ([`buffer`]), an optional
//! expression-tree forward path ([`expr`]), and the per-thread profiler log
//! ([`profiler`]) the emitted code's entry/exit hooks call into.
//!
//! Two pipelines coexist (spec.md §9): [`emit::instructions`] is the
//! baseline linear emitter; [`expr`] is a template-driven tree builder that
//! may replace parts of it. Both bottom out in the same register file and
//! frame layout described in [`frame`] and [`regs`].

pub mod abi;
pub mod asm;
pub mod buffer;
pub mod emit;
pub mod error;
pub mod expr;
pub mod frame;
pub mod ir;
pub mod opcodes;
pub mod profiler;
pub mod regs;

pub use abi::Abi;
pub use buffer::ExecutableBuffer;
pub use emit::{compile_block, num_globals, CompiledBlock, Runtime};
#[cfg(target_arch = "x86_64")]
pub use emit::support;
pub use error::JitError;
pub use ir::Block;
