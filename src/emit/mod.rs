//! The structured emitter: turns a [`crate::ir::Block`] into machine code
//! (spec.md §2 components D/E/F/G). Split the same way the spec's share
//! table splits it: [`prologue`] for the primitives every block needs
//! once, [`instructions`] for per-opcode emission, [`control`] for
//! branch/label/guard/C-call marshaling, [`invoke`] for the invoke
//! protocol.

pub mod control;
pub mod instructions;
pub mod invoke;
pub mod prologue;

use crate::abi::Abi;
use crate::buffer::{Assembler, LabelId};
use crate::error::JitError;
use crate::frame::Frame;
use crate::ir::Block;
use crate::regs::{ARGS, WORK};

/// Offsets within [`Frame`], computed once and threaded through every
/// emitter module rather than hardcoded at each call site.
pub struct FrameLayout {
    pub work: i32,
    pub params_args: i32,
    pub args: i32,
    pub outer: i32,
    pub env: i32,
    pub effective_spesh_slots: i32,
    pub return_type: i32,
    pub return_value: i32,
    pub return_address: i32,
    pub jit_entry_label: i32,
}

impl FrameLayout {
    pub fn host() -> Self {
        use std::mem::offset_of;
        FrameLayout {
            work: offset_of!(Frame, work) as i32,
            params_args: offset_of!(Frame, params_args) as i32,
            args: offset_of!(Frame, args) as i32,
            outer: offset_of!(Frame, outer) as i32,
            env: offset_of!(Frame, env) as i32,
            effective_spesh_slots: offset_of!(Frame, effective_spesh_slots) as i32,
            return_type: offset_of!(Frame, return_type) as i32,
            return_value: offset_of!(Frame, return_value) as i32,
            return_address: offset_of!(Frame, return_address) as i32,
            jit_entry_label: offset_of!(Frame, jit_entry_label) as i32,
        }
    }
}

/// Offsets within [`crate::frame::ThreadContext`].
pub struct TcLayout {
    pub cur_frame: i32,
    pub cur_dispatcher: i32,
    pub instance: i32,
    pub interp_cur_op: i32,
    pub thread_id: i32,
}

impl TcLayout {
    pub fn host() -> Self {
        use crate::frame::ThreadContext;
        use std::mem::offset_of;
        TcLayout {
            cur_frame: offset_of!(ThreadContext, cur_frame) as i32,
            cur_dispatcher: offset_of!(ThreadContext, cur_dispatcher) as i32,
            instance: offset_of!(ThreadContext, instance) as i32,
            interp_cur_op: offset_of!(ThreadContext, interp_cur_op) as i32,
            thread_id: offset_of!(ThreadContext, thread_id) as i32,
        }
    }
}

/// Offsets within [`crate::frame::HeapObject`].
pub struct ObjectLayout {
    pub header_flags: i32,
    pub st: i32,
    pub body_replaced: i32,
    pub body_start: i32,
}

impl ObjectLayout {
    pub fn host() -> Self {
        use crate::frame::HeapObject;
        use std::mem::offset_of;
        ObjectLayout {
            header_flags: offset_of!(HeapObject, header) as i32,
            st: offset_of!(HeapObject, st) as i32,
            body_replaced: offset_of!(HeapObject, body_replaced) as i32,
            body_start: offset_of!(HeapObject, body_start) as i32,
        }
    }
}

/// Absolute addresses of the external C helpers emitted code calls into
/// (spec.md §6 "External C functions emitted calls to"). Supplied by
/// whatever embeds this crate; a test build points these at mock hooks.
#[derive(Debug, Clone, Copy)]
pub struct Runtime {
    pub write_barrier_hit: usize,
    pub gc_allocate_zeroed: usize,
    pub vivify_lexical: usize,
    pub repr_clone: usize,
    pub deopt_one_direct: usize,
    pub args_prepare: usize,
    pub find_invokee_multi_ok: usize,
    pub frame_invoke_code: usize,
}

/// Shared state threaded through every per-block emission pass: the growing
/// buffer, the ABI profile, and the layout/runtime tables. Mirrors
/// `FunctionBuilder` bundling a `FunctionBuilderContext` in the frontend
/// crate this backend takes its structuring cue from.
pub struct Emitter {
    pub asm: Assembler,
    pub abi: Abi,
    pub frame: FrameLayout,
    pub tc: TcLayout,
    pub obj: ObjectLayout,
    pub runtime: Runtime,
}

impl Emitter {
    pub fn new(abi: Abi, runtime: Runtime) -> Self {
        Emitter {
            asm: Assembler::new(),
            abi,
            frame: FrameLayout::host(),
            tc: TcLayout::host(),
            obj: ObjectLayout::host(),
            runtime,
        }
    }

    pub fn label_alloc(&mut self) -> LabelId {
        self.asm.label_alloc()
    }

    pub fn bind(&mut self, label: LabelId) {
        self.asm.bind(label);
    }

    /// Register-file slot address: `WORK + reg * REG_SIZE`.
    pub fn work_slot(&self, reg: u16) -> crate::asm::Mem {
        crate::asm::Mem::new(WORK, reg as i32 * crate::regs::REG_SIZE)
    }

    /// Argument slot address: `ARGS + idx * REG_SIZE`.
    pub fn args_slot(&self, idx: u16) -> crate::asm::Mem {
        crate::asm::Mem::new(ARGS, idx as i32 * crate::regs::REG_SIZE)
    }
}

/// A finished, linked compiled block (spec.md §6 "Executable buffer
/// format"): the code itself, the offset the caller must jump to as `ARG3`
/// of the entry ABI to start running the block's body (right past the
/// shared prologue), and every resolved label's offset for anything that
/// needs to address a specific re-entry point (e.g. OSR).
pub struct CompiledBlock {
    pub code: Vec<u8>,
    pub entry: usize,
    pub labels: rustc_hash::FxHashMap<LabelId, usize>,
}

/// Compiles a fully built block into linked machine code. Consumes the
/// block; a build failure (spec.md §7 "compile-time errors") drops
/// whatever was emitted so far, matching the "no partial tree escapes"
/// cancellation rule for the builder's own failures.
pub fn compile_block(abi: Abi, runtime: Runtime, block: &Block) -> Result<CompiledBlock, JitError> {
    let mut emitter = Emitter::new(abi, runtime);
    prologue::emit_prologue(&mut emitter);
    let entry = emitter.asm.position();
    for node in &block.nodes {
        control::emit_node(&mut emitter, node)?;
    }
    prologue::emit_epilogue(&mut emitter);
    let (code, labels) = emitter.asm.link()?;
    Ok(CompiledBlock { code, entry, labels })
}

/// Whether this backend supports the host it was built for (spec.md §6
/// "Configuration"). Always `true` on x86-64; this crate has no fallback
/// interpreter-only mode to report through this knob on other targets since
/// it is never built for them (Non-goals: "architectures other than
/// x86-64").
#[cfg(target_arch = "x86_64")]
pub const fn support() -> bool {
    true
}

/// Count of well-known labels every compiled block carries regardless of its
/// own content: `exit` and `out` (spec.md §6 "Configuration").
pub const fn num_globals() -> usize {
    2
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn support_and_num_globals_match_the_documented_constants() {
        assert!(support());
        assert_eq!(num_globals(), 2);
    }

    #[test]
    fn frame_layout_matches_struct_field_order() {
        let layout = FrameLayout::host();
        assert_eq!(layout.work, 0);
        assert!(layout.params_args > layout.work);
        assert!(layout.args > layout.params_args);
    }
}

/// A runtime with every hook pointing at address zero, for tests that only
/// exercise code paths which never actually call through (or that patch in
/// their own mock addresses before linking).
#[cfg(test)]
pub fn mock_runtime() -> Runtime {
    Runtime {
        write_barrier_hit: 0,
        gc_allocate_zeroed: 0,
        vivify_lexical: 0,
        repr_clone: 0,
        deopt_one_direct: 0,
        args_prepare: 0,
        find_invokee_multi_ok: 0,
        frame_invoke_code: 0,
    }
}
