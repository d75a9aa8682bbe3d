//! Branch, label, guard/deopt, and C-call argument marshaling (spec.md
//! §4.F). [`emit_node`] is the top-level dispatch `compile_block` drives.

use crate::asm::{self, Cond, Mem};
use crate::buffer::LabelId;
use crate::error::JitError;
use crate::frame::TYPE_OBJECT_BIT;
use crate::ir::{BranchSpec, CallArg, CallSpec, Cmp, GuardKind, GuardSpec, Node, ReturnMode};
use crate::regs::{Reg, Tmp, CU, TC};

use super::prologue::{emit_c_call_trampoline, emit_spesh_slot_fetch};
use super::Emitter;

/// Top-level per-node dispatch driven by [`super::compile_block`].
pub fn emit_node(e: &mut Emitter, node: &Node) -> Result<(), JitError> {
    match node {
        Node::Primitive { opcode, operands } => super::instructions::emit(e, *opcode, operands),
        Node::CallC(spec) => emit_call_c(e, spec),
        Node::Branch(spec) => emit_branch(e, spec),
        Node::Label(id) => {
            e.bind(*id);
            Ok(())
        }
        Node::Guard(spec) => emit_guard(e, spec),
        Node::Invoke(spec) => super::invoke::emit_invoke(e, spec),
    }
}

fn cond_for(cmp: Cmp) -> Cond {
    match cmp {
        Cmp::Eq => Cond::Eq,
        Cmp::Ne => Cond::Ne,
        Cmp::Lt => Cond::Lt,
        Cmp::Le => Cond::Le,
        Cmp::Gt => Cond::Gt,
        Cmp::Ge => Cond::Ge,
    }
}

/// **Branch** (spec.md §4.F). `Exit` jumps to the global `exit` label;
/// `Goto` jumps to a dynamic label. Conditionals load both operands,
/// `cmp`, then `jcc`.
fn emit_branch(e: &mut Emitter, spec: &BranchSpec) -> Result<(), JitError> {
    match spec {
        BranchSpec::Exit => {
            let buf = e.asm.code_mut();
            asm::jmp_rel32_placeholder(buf);
            e.asm.record_fixup(LabelId::Exit);
        }
        BranchSpec::Goto(label) => {
            let buf = e.asm.code_mut();
            asm::jmp_rel32_placeholder(buf);
            e.asm.record_fixup(*label);
        }
        BranchSpec::If {
            cmp,
            left,
            right,
            target,
        } => {
            let left_slot = e.work_slot(*left);
            let right_slot = e.work_slot(*right);
            let buf = e.asm.code_mut();
            asm::mov_rm(buf, Reg::Rax, left_slot);
            asm::mov_rm(buf, Tmp::Tmp1.reg(), right_slot);
            asm::cmp_rr(buf, Reg::Rax, Tmp::Tmp1.reg());
            asm::jcc_rel32_placeholder(buf, cond_for(*cmp));
            e.asm.record_fixup(*target);
        }
    }
    Ok(())
}

/// **Guard** (spec.md §4.F, §4.G): load the object and its STable from the
/// recorded spesh slot, check existence/concreteness/STable match; on
/// mismatch call the deopt helper and return the `DEOPT` sentinel via the
/// global `out` label.
fn emit_guard(e: &mut Emitter, spec: &GuardSpec) -> Result<(), JitError> {
    let obj_slot = e.work_slot(spec.object);
    let obj_reg = Tmp::Tmp2.reg();
    let expected_st_reg = Tmp::Tmp1.reg();
    let actual_st_reg = Tmp::Tmp3.reg();
    let st_off = e.obj.st;

    {
        let buf = e.asm.code_mut();
        asm::mov_rm(buf, obj_reg, obj_slot);
    }
    emit_spesh_slot_fetch(e, expected_st_reg, spec.spesh_slot);

    let ok_label = e.label_alloc();

    {
        let buf = e.asm.code_mut();
        // Non-null check: mismatch is immediate if the object is null.
        asm::test_rr(buf, obj_reg, obj_reg);
        asm::jcc_rel32_placeholder(buf, Cond::Zero);
    }
    let deopt_label = e.label_alloc();
    e.asm.record_fixup(deopt_label);

    {
        let buf = e.asm.code_mut();
        match spec.kind {
            GuardKind::Type => {
                // Must be a type object: TYPE_OBJECT_BIT set.
                asm::test_mi16(buf, Mem::new(obj_reg, 0), TYPE_OBJECT_BIT);
                asm::jcc_rel32_placeholder(buf, Cond::Zero);
            }
            GuardKind::Conc => {
                // Must not be a type object.
                asm::test_mi16(buf, Mem::new(obj_reg, 0), TYPE_OBJECT_BIT);
                asm::jcc_rel32_placeholder(buf, Cond::NotZero);
            }
        }
    }
    e.asm.record_fixup(deopt_label);

    {
        let buf = e.asm.code_mut();
        asm::mov_rm(buf, actual_st_reg, Mem::new(obj_reg, st_off));
        asm::cmp_rr(buf, actual_st_reg, expected_st_reg);
        asm::jcc_rel32_placeholder(buf, Cond::Ne);
    }
    e.asm.record_fixup(deopt_label);

    {
        let buf = e.asm.code_mut();
        asm::jmp_rel32_placeholder(buf);
    }
    e.asm.record_fixup(ok_label);

    e.bind(deopt_label);
    log::debug!(
        "compiling guard {:?} on r{}: deopt offset {} target {}",
        spec.kind,
        spec.object,
        spec.deopt_offset,
        spec.deopt_target
    );
    let tc_arg = e.abi.int_args()[0];
    let offset_arg = e.abi.int_args()[1];
    let target_arg = e.abi.int_args()[2];
    {
        let buf = e.asm.code_mut();
        asm::mov_rr(buf, tc_arg, TC);
        asm::mov_ri64(buf, offset_arg, spec.deopt_offset as i64);
        asm::mov_ri64(buf, target_arg, spec.deopt_target as i64);
    }
    emit_c_call_trampoline(e, e.runtime.deopt_one_direct);
    {
        let buf = e.asm.code_mut();
        // DEOPT sentinel: distinct from 0 (normal exit) and 1 (continue).
        asm::mov_ri64(buf, crate::regs::RV, DEOPT_SENTINEL);
        asm::jmp_rel32_placeholder(buf);
        e.asm.record_fixup(LabelId::Out);
    }

    e.bind(ok_label);
    Ok(())
}

/// Return sentinel for a guard deopt (spec.md §6: "`DEOPT` = fell through a
/// guard"). Distinct from the `0`/`1` exit/continue sentinels.
pub const DEOPT_SENTINEL: i64 = -1;

/// **C-call** (spec.md §4.F): place each argument in the ABI slot for its
/// index, emit the trampoline, and route the return value per `returns`.
fn emit_call_c(e: &mut Emitter, spec: &CallSpec) -> Result<(), JitError> {
    if spec.varargs {
        return Err(JitError::Varargs);
    }
    for (i, arg) in spec.args.iter().enumerate() {
        place_call_arg(e, i, *arg)?;
    }
    emit_c_call_trampoline(e, spec.target);
    match spec.returns {
        ReturnMode::Discard => {}
        ReturnMode::Int(reg) => {
            let slot = e.work_slot(reg);
            let buf = e.asm.code_mut();
            asm::mov_mr(buf, slot, crate::regs::RV);
        }
        ReturnMode::Float(reg) => {
            let slot = e.work_slot(reg);
            let buf = e.asm.code_mut();
            asm::movsd_store(buf, slot, crate::regs::RVF);
        }
    }
    Ok(())
}

/// Places one C-call argument in the ABI slot for position `index`. Float
/// and integer arguments share the index space: `RegValF` at index `i`
/// uses the i-th *float* arg register (spec.md §4.F — "the caller's
/// responsibility that the function signature matches").
///
/// `RegAddr` places the register's *address* (not its contents) in the
/// integer slot and does nothing else — the original C omits the `break`
/// after this case and falls through into the literal path; that is a bug
/// (spec.md §9 Open Question) and is not replicated here.
fn place_call_arg(e: &mut Emitter, index: usize, arg: CallArg) -> Result<(), JitError> {
    match arg {
        CallArg::Tc => {
            let dst = e.abi.int_arg(index)?;
            let buf = e.asm.code_mut();
            asm::mov_rr(buf, dst, TC);
        }
        CallArg::Frame => {
            let dst = e.abi.int_arg(index)?;
            let cur_frame_off = e.tc.cur_frame;
            let buf = e.asm.code_mut();
            asm::mov_rm(buf, dst, Mem::new(TC, cur_frame_off));
        }
        CallArg::Cu => {
            let dst = e.abi.int_arg(index)?;
            let buf = e.asm.code_mut();
            asm::mov_rr(buf, dst, CU);
        }
        CallArg::RegVal(reg) => {
            let dst = e.abi.int_arg(index)?;
            let slot = e.work_slot(reg);
            let buf = e.asm.code_mut();
            asm::mov_rm(buf, dst, slot);
        }
        CallArg::RegValF(reg) => {
            let dst = e.abi.float_arg(index)?;
            let slot = e.work_slot(reg);
            let buf = e.asm.code_mut();
            asm::movsd_load(buf, dst, slot);
        }
        CallArg::RegAddr(reg) => {
            // Fixed: place the address only, no fallthrough into a literal
            // load (spec.md §9 Open Question).
            let dst = e.abi.int_arg(index)?;
            let slot = e.work_slot(reg);
            let buf = e.asm.code_mut();
            asm::lea(buf, dst, slot);
        }
        CallArg::Literal32(v) => {
            let dst = e.abi.int_arg(index)?;
            let buf = e.asm.code_mut();
            asm::mov_ri64(buf, dst, v as i64);
        }
        CallArg::Literal64(v) => {
            let dst = e.abi.int_arg(index)?;
            let buf = e.asm.code_mut();
            asm::mov_ri64(buf, dst, v);
        }
        CallArg::LiteralF(v) => {
            let dst = e.abi.float_arg(index)?;
            let buf = e.asm.code_mut();
            asm::mov_ri64(buf, Tmp::Tmp1.reg(), v.to_bits() as i64);
            // Materialized through a one-word stack scratch since ABI float
            // slots are register-only.
            asm::push_r(buf, Tmp::Tmp1.reg());
            asm::movsd_load(buf, dst, Mem::new(Reg::Rsp, 0));
            asm::pop_r(buf, Tmp::Tmp1.reg());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::Abi;
    use crate::emit::mock_runtime;
    use crate::ir::BranchSpec;

    #[test]
    fn exit_branch_resolves_against_epilogue_label() {
        let mut e = Emitter::new(Abi::SysV, mock_runtime());
        super::super::prologue::emit_prologue(&mut e);
        emit_branch(&mut e, &BranchSpec::Exit).unwrap();
        super::super::prologue::emit_epilogue(&mut e);
        let (code, _labels) = e.asm.link().unwrap();
        assert!(!code.is_empty());
    }
}
