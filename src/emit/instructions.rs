//! Per-opcode emission (spec.md §4.E). One function per primitive group;
//! [`emit`] dispatches by opcode id. Every VM register read/write goes
//! through [`Emitter::work_slot`] — all VM register slots are 8 bytes wide.

use crate::asm::{self, Cond, Mem};
use crate::error::JitError;
use crate::ir::Operand;
use crate::opcodes as op;
use crate::regs::{Reg, Tmp, Xmm, CU, REG_SIZE, TC};

use super::prologue::{
    emit_c_call_trampoline, emit_spesh_slot_fetch, emit_vmnull_fetch, emit_write_barrier_check,
    emit_write_barrier_hit,
};
use super::Emitter;

fn reg_operand(operands: &[Operand], idx: usize) -> Result<u16, JitError> {
    operands
        .get(idx)
        .and_then(|o| o.as_reg())
        .ok_or(JitError::UnsupportedOpcode(idx as u16))
}

/// `dst <- imm` for the three constant-materializing opcodes.
fn emit_const(e: &mut Emitter, opcode: u16, operands: &[Operand]) -> Result<(), JitError> {
    let dst = reg_operand(operands, 0)?;
    let slot = e.work_slot(dst);
    let buf = e.asm.code_mut();
    match (opcode, operands.get(1)) {
        (o, Some(Operand::ImmI16(v))) if o == op::CONST_I64_16 => {
            asm::mov_mi32(buf, slot, *v as i32);
        }
        (o, Some(Operand::ImmI64(v))) if o == op::CONST_I64 => {
            asm::mov_ri64(buf, Tmp::Tmp1.reg(), *v);
            asm::mov_mr(buf, slot, Tmp::Tmp1.reg());
        }
        (o, Some(Operand::ImmF64(v))) if o == op::CONST_N64 => {
            asm::mov_ri64(buf, Tmp::Tmp1.reg(), v.to_bits() as i64);
            asm::mov_mr(buf, slot, Tmp::Tmp1.reg());
        }
        _ => return Err(JitError::UnsupportedOpcode(opcode)),
    }
    Ok(())
}

/// `const_s`: always the conservative indirect load through
/// `CU.body.strings[idx]` (spec.md Open Question, resolved conservatively —
/// see DESIGN.md).
fn emit_const_s(e: &mut Emitter, operands: &[Operand]) -> Result<(), JitError> {
    let dst = reg_operand(operands, 0)?;
    let idx = match operands.get(1) {
        Some(Operand::StringIdx(i)) => *i,
        _ => return Err(JitError::UnsupportedOpcode(op::CONST_S)),
    };
    let slot = e.work_slot(dst);
    let buf = e.asm.code_mut();
    asm::mov_rm(buf, Tmp::Tmp1.reg(), Mem::new(CU, 0));
    asm::mov_rm(buf, Tmp::Tmp1.reg(), Mem::new(Tmp::Tmp1.reg(), idx as i32 * REG_SIZE));
    asm::mov_mr(buf, slot, Tmp::Tmp1.reg());
    Ok(())
}

fn emit_null(e: &mut Emitter, operands: &[Operand]) -> Result<(), JitError> {
    let dst = reg_operand(operands, 0)?;
    emit_vmnull_fetch(e, Tmp::Tmp1.reg());
    let slot = e.work_slot(dst);
    let buf = e.asm.code_mut();
    asm::mov_mr(buf, slot, Tmp::Tmp1.reg());
    Ok(())
}

/// `gethow`/`getwhat`: `dst <- obj.st.{HOW|WHAT}`. The `Stable` record
/// carries only the fields emitted code actually dereferences (spec.md
/// GLOSSARY: "no virtual tables needed"); HOW/WHAT are modeled as two
/// adjacent pointer-sized fields at the head of the STable, selected by
/// `field_offset`.
fn emit_gethow_getwhat(
    e: &mut Emitter,
    operands: &[Operand],
    field_offset: i32,
) -> Result<(), JitError> {
    let dst = reg_operand(operands, 0)?;
    let obj = reg_operand(operands, 1)?;
    let obj_slot = e.work_slot(obj);
    let st_off = e.obj.st;
    let dst_slot = e.work_slot(dst);
    let buf = e.asm.code_mut();
    asm::mov_rm(buf, Tmp::Tmp1.reg(), obj_slot);
    asm::mov_rm(buf, Tmp::Tmp1.reg(), Mem::new(Tmp::Tmp1.reg(), st_off));
    asm::mov_rm(buf, Tmp::Tmp1.reg(), Mem::new(Tmp::Tmp1.reg(), field_offset));
    asm::mov_mr(buf, dst_slot, Tmp::Tmp1.reg());
    Ok(())
}

/// `getlex`: walk `outers` hops through `cur_frame.outer`, then
/// `env[idx]`. If the loaded value is zero, call `MVM_frame_vivify_lexical`
/// and use its return; the frame pointer is preserved across the call via
/// push/pop (spec.md §4.E). The viv path is cold.
fn emit_getlex(e: &mut Emitter, operands: &[Operand]) -> Result<(), JitError> {
    let dst = reg_operand(operands, 0)?;
    let (outers, index) = match operands.get(1) {
        Some(Operand::Lexical { outers, index }) => (*outers, *index),
        _ => return Err(JitError::UnsupportedOpcode(op::GETLEX)),
    };
    let cur_frame_off = e.tc.cur_frame;
    let outer_off = e.frame.outer;
    let env_off = e.frame.env;
    let frame_reg = Tmp::Tmp2.reg();
    let val_reg = Tmp::Tmp1.reg();

    {
        let buf = e.asm.code_mut();
        asm::mov_rm(buf, frame_reg, Mem::new(TC, cur_frame_off));
        for _ in 0..outers {
            asm::mov_rm(buf, frame_reg, Mem::new(frame_reg, outer_off));
        }
        asm::mov_rm(buf, val_reg, Mem::new(frame_reg, env_off));
        asm::mov_rm(buf, val_reg, Mem::new(val_reg, index as i32 * REG_SIZE));
        asm::test_rr(buf, val_reg, val_reg);
        asm::jcc_rel32_placeholder(buf, Cond::Eq);
    }
    let viv_label = e.label_alloc();
    e.asm.record_fixup(viv_label);
    {
        let buf = e.asm.code_mut();
        asm::jmp_rel32_placeholder(buf);
    }
    let after_label = e.label_alloc();
    e.asm.record_fixup(after_label);

    e.bind(viv_label);
    {
        let buf = e.asm.code_mut();
        asm::push_r(buf, frame_reg);
    }
    let tc_arg = e.abi.int_args()[0];
    let frame_arg = e.abi.int_args()[1];
    let idx_arg = e.abi.int_args()[2];
    {
        let buf = e.asm.code_mut();
        asm::mov_rr(buf, tc_arg, TC);
        asm::mov_rr(buf, frame_arg, frame_reg);
        asm::mov_ri64(buf, idx_arg, index as i64);
    }
    emit_c_call_trampoline(e, e.runtime.vivify_lexical);
    {
        let buf = e.asm.code_mut();
        asm::mov_rr(buf, val_reg, crate::regs::RV);
        asm::pop_r(buf, frame_reg);
    }

    e.bind(after_label);
    let slot = e.work_slot(dst);
    let buf = e.asm.code_mut();
    asm::mov_mr(buf, slot, val_reg);
    Ok(())
}

/// `bindlex`: symmetric to `getlex` without vivification.
fn emit_bindlex(e: &mut Emitter, operands: &[Operand]) -> Result<(), JitError> {
    let src = reg_operand(operands, 0)?;
    let (outers, index) = match operands.get(1) {
        Some(Operand::Lexical { outers, index }) => (*outers, *index),
        _ => return Err(JitError::UnsupportedOpcode(op::BINDLEX)),
    };
    let cur_frame_off = e.tc.cur_frame;
    let outer_off = e.frame.outer;
    let env_off = e.frame.env;
    let frame_reg = Tmp::Tmp2.reg();
    let src_slot = e.work_slot(src);
    let buf = e.asm.code_mut();
    asm::mov_rm(buf, frame_reg, Mem::new(TC, cur_frame_off));
    for _ in 0..outers {
        asm::mov_rm(buf, frame_reg, Mem::new(frame_reg, outer_off));
    }
    asm::mov_rm(buf, frame_reg, Mem::new(frame_reg, env_off));
    asm::mov_rm(buf, Tmp::Tmp1.reg(), src_slot);
    asm::mov_mr(buf, Mem::new(frame_reg, index as i32 * REG_SIZE), Tmp::Tmp1.reg());
    Ok(())
}

/// `sp_getarg_{i,n,s,o}`: `WORK[reg] <- ARGS[callsite_idx]`. All four
/// variants move the same 8-byte slot; the distinction is only in what
/// `callsite_idx` means to the caller.
fn emit_getarg(e: &mut Emitter, operands: &[Operand]) -> Result<(), JitError> {
    let dst = reg_operand(operands, 0)?;
    let idx = match operands.get(1) {
        Some(Operand::CallsiteIdx(i)) => *i,
        _ => return Err(JitError::UnsupportedOpcode(op::SP_GETARG_I)),
    };
    let src_slot = e.args_slot(idx);
    let dst_slot = e.work_slot(dst);
    let buf = e.asm.code_mut();
    asm::mov_rm(buf, Tmp::Tmp1.reg(), src_slot);
    asm::mov_mr(buf, dst_slot, Tmp::Tmp1.reg());
    Ok(())
}

/// Computes the effective p6opaque field address into `addr_reg`: `obj +
/// body_start + offset`, or `obj.body_replaced + offset` when
/// `body_replaced` is non-null (spec.md §4.E). `obj_reg` must already hold
/// the object pointer; `addr_reg` and `scratch` are clobbered.
fn emit_p6o_address(
    e: &mut Emitter,
    obj_reg: Reg,
    offset: i32,
    addr_reg: Reg,
) {
    let replaced_off = e.obj.body_replaced;
    let body_start = e.obj.body_start;
    let buf = e.asm.code_mut();
    asm::mov_rm(buf, addr_reg, Mem::new(obj_reg, replaced_off));
    asm::test_rr(buf, addr_reg, addr_reg);
    let use_body_patch = asm::jcc_rel32_placeholder(buf, Cond::Zero);
    // replaced != NULL
    asm::add_ri32(buf, addr_reg, offset);
    let after_patch = asm::jmp_rel32_placeholder(buf);
    let use_body_target = buf.len();
    asm::lea(buf, addr_reg, Mem::new(obj_reg, body_start + offset));
    let after_target = buf.len();
    asm::patch_rel32(buf, use_body_patch, use_body_target);
    asm::patch_rel32(buf, after_patch, after_target);
}

/// `sp_p6oget_{i,n,s,o}`: load the field at the computed address. `_o`
/// (and its vivifying cousins, treated identically at the load step)
/// substitutes `VMNull` for a zero pointer.
fn emit_p6oget_plain(e: &mut Emitter, operands: &[Operand], is_obj: bool) -> Result<(), JitError> {
    let dst = reg_operand(operands, 0)?;
    let obj = reg_operand(operands, 1)?;
    let offset = match operands.get(2) {
        Some(Operand::ImmI16(v)) => *v as i32,
        Some(Operand::ImmI64(v)) => *v as i32,
        _ => return Err(JitError::UnsupportedOpcode(op::SP_P6OGET_I)),
    };
    let obj_slot = e.work_slot(obj);
    let obj_reg = Tmp::Tmp2.reg();
    let addr_reg = Tmp::Tmp3.reg();
    let val_reg = Tmp::Tmp1.reg();

    {
        let buf = e.asm.code_mut();
        asm::mov_rm(buf, obj_reg, obj_slot);
    }
    emit_p6o_address(e, obj_reg, offset, addr_reg);
    {
        let buf = e.asm.code_mut();
        asm::mov_rm(buf, val_reg, Mem::new(addr_reg, 0));
    }

    if is_obj {
        let skip_null_patch;
        {
            let buf = e.asm.code_mut();
            asm::test_rr(buf, val_reg, val_reg);
            skip_null_patch = asm::jcc_rel32_placeholder(buf, Cond::NotZero);
        }
        emit_vmnull_fetch(e, val_reg);
        let buf = e.asm.code_mut();
        let here = buf.len();
        asm::patch_rel32(buf, skip_null_patch, here);
    }

    let dst_slot = e.work_slot(dst);
    let buf = e.asm.code_mut();
    asm::mov_mr(buf, dst_slot, val_reg);
    Ok(())
}

/// `sp_p6oget_vt_o`: like the plain object getter, but a zero field is
/// vivified rather than substituted with `VMNull`: the type is fetched from
/// the recorded spesh slot, the write barrier is checked/hit against it, and
/// it is stored back into the field so a second read sees it directly
/// (spec.md §4.E, §8 "Vivify idempotence"). Operand 3 is the spesh slot
/// holding the type to materialize.
fn emit_p6oget_vt_o(e: &mut Emitter, operands: &[Operand]) -> Result<(), JitError> {
    let dst = reg_operand(operands, 0)?;
    let obj = reg_operand(operands, 1)?;
    let offset = match operands.get(2) {
        Some(Operand::ImmI16(v)) => *v as i32,
        Some(Operand::ImmI64(v)) => *v as i32,
        _ => return Err(JitError::UnsupportedOpcode(op::SP_P6OGET_VT_O)),
    };
    let spesh_slot = match operands.get(3) {
        Some(Operand::SpeshSlot(i)) => *i,
        _ => return Err(JitError::UnsupportedOpcode(op::SP_P6OGET_VT_O)),
    };
    let obj_slot = e.work_slot(obj);
    let obj_reg = Tmp::Tmp2.reg();
    let addr_reg = Tmp::Tmp3.reg();
    let val_reg = Tmp::Tmp1.reg();

    {
        let buf = e.asm.code_mut();
        asm::mov_rm(buf, obj_reg, obj_slot);
    }
    emit_p6o_address(e, obj_reg, offset, addr_reg);
    {
        let buf = e.asm.code_mut();
        asm::mov_rm(buf, val_reg, Mem::new(addr_reg, 0));
        asm::test_rr(buf, val_reg, val_reg);
    }
    let skip_vivify_patch;
    {
        let buf = e.asm.code_mut();
        skip_vivify_patch = asm::jcc_rel32_placeholder(buf, Cond::NotZero);
    }

    emit_spesh_slot_fetch(e, val_reg, spesh_slot);
    emit_write_barrier_check(e, obj_reg, val_reg);
    let skip_barrier_patch;
    {
        let buf = e.asm.code_mut();
        skip_barrier_patch = asm::jcc_rel32_placeholder(buf, Cond::Zero);
    }
    emit_write_barrier_hit(e, e.runtime.write_barrier_hit, obj_reg);
    {
        let buf = e.asm.code_mut();
        let here = buf.len();
        asm::patch_rel32(buf, skip_barrier_patch, here);
    }
    {
        let buf = e.asm.code_mut();
        asm::mov_mr(buf, Mem::new(addr_reg, 0), val_reg);
    }

    let buf = e.asm.code_mut();
    let here = buf.len();
    asm::patch_rel32(buf, skip_vivify_patch, here);

    let dst_slot = e.work_slot(dst);
    let buf = e.asm.code_mut();
    asm::mov_mr(buf, dst_slot, val_reg);
    Ok(())
}

/// `sp_p6oget_vc_o`: like [`emit_p6oget_vt_o`], but a zero field is vivified
/// by cloning the prototype held in the recorded spesh slot through
/// `MVM_repr_clone` rather than fetching a type directly. Operand 3 is the
/// spesh slot holding the prototype to clone.
fn emit_p6oget_vc_o(e: &mut Emitter, operands: &[Operand]) -> Result<(), JitError> {
    let dst = reg_operand(operands, 0)?;
    let obj = reg_operand(operands, 1)?;
    let offset = match operands.get(2) {
        Some(Operand::ImmI16(v)) => *v as i32,
        Some(Operand::ImmI64(v)) => *v as i32,
        _ => return Err(JitError::UnsupportedOpcode(op::SP_P6OGET_VC_O)),
    };
    let spesh_slot = match operands.get(3) {
        Some(Operand::SpeshSlot(i)) => *i,
        _ => return Err(JitError::UnsupportedOpcode(op::SP_P6OGET_VC_O)),
    };
    let obj_slot = e.work_slot(obj);
    let obj_reg = Tmp::Tmp2.reg();
    let addr_reg = Tmp::Tmp3.reg();
    let val_reg = Tmp::Tmp1.reg();

    {
        let buf = e.asm.code_mut();
        asm::mov_rm(buf, obj_reg, obj_slot);
    }
    emit_p6o_address(e, obj_reg, offset, addr_reg);
    {
        let buf = e.asm.code_mut();
        asm::mov_rm(buf, val_reg, Mem::new(addr_reg, 0));
        asm::test_rr(buf, val_reg, val_reg);
    }
    let skip_vivify_patch;
    {
        let buf = e.asm.code_mut();
        skip_vivify_patch = asm::jcc_rel32_placeholder(buf, Cond::NotZero);
    }

    {
        let buf = e.asm.code_mut();
        asm::push_r(buf, obj_reg);
        asm::push_r(buf, addr_reg);
    }
    emit_spesh_slot_fetch(e, Tmp::Tmp1.reg(), spesh_slot);
    let tc_arg = e.abi.int_args()[0];
    let proto_arg = e.abi.int_args()[1];
    {
        let buf = e.asm.code_mut();
        asm::mov_rr(buf, tc_arg, TC);
        asm::mov_rr(buf, proto_arg, Tmp::Tmp1.reg());
    }
    emit_c_call_trampoline(e, e.runtime.repr_clone);
    {
        let buf = e.asm.code_mut();
        asm::mov_rr(buf, val_reg, crate::regs::RV);
        asm::pop_r(buf, addr_reg);
        asm::pop_r(buf, obj_reg);
    }

    emit_write_barrier_check(e, obj_reg, val_reg);
    let skip_barrier_patch;
    {
        let buf = e.asm.code_mut();
        skip_barrier_patch = asm::jcc_rel32_placeholder(buf, Cond::Zero);
    }
    emit_write_barrier_hit(e, e.runtime.write_barrier_hit, obj_reg);
    {
        let buf = e.asm.code_mut();
        let here = buf.len();
        asm::patch_rel32(buf, skip_barrier_patch, here);
    }
    {
        let buf = e.asm.code_mut();
        asm::mov_mr(buf, Mem::new(addr_reg, 0), val_reg);
    }

    let buf = e.asm.code_mut();
    let here = buf.len();
    asm::patch_rel32(buf, skip_vivify_patch, here);

    let dst_slot = e.work_slot(dst);
    let buf = e.asm.code_mut();
    asm::mov_mr(buf, dst_slot, val_reg);
    Ok(())
}

/// `sp_p6obind_{i,n,s,o}`: same address computation as the getter; the
/// `_o` variant checks/hits the write barrier on the host object before
/// the store (spec.md §4.E).
fn emit_p6obind(e: &mut Emitter, operands: &[Operand], is_obj: bool) -> Result<(), JitError> {
    let obj = reg_operand(operands, 0)?;
    let offset = match operands.get(1) {
        Some(Operand::ImmI16(v)) => *v as i32,
        Some(Operand::ImmI64(v)) => *v as i32,
        _ => return Err(JitError::UnsupportedOpcode(op::SP_P6OBIND_I)),
    };
    let src = reg_operand(operands, 2)?;
    let obj_slot = e.work_slot(obj);
    let src_slot = e.work_slot(src);
    let obj_reg = Tmp::Tmp2.reg();
    let addr_reg = Tmp::Tmp3.reg();

    {
        let buf = e.asm.code_mut();
        asm::mov_rm(buf, obj_reg, obj_slot);
    }

    if is_obj {
        {
            let buf = e.asm.code_mut();
            asm::mov_rm(buf, Tmp::Tmp1.reg(), src_slot);
        }
        emit_write_barrier_check(e, obj_reg, Tmp::Tmp1.reg());
        let skip_patch;
        {
            let buf = e.asm.code_mut();
            skip_patch = asm::jcc_rel32_placeholder(buf, Cond::Zero);
        }
        emit_write_barrier_hit(e, e.runtime.write_barrier_hit, obj_reg);
        let buf = e.asm.code_mut();
        let here = buf.len();
        asm::patch_rel32(buf, skip_patch, here);
    }

    emit_p6o_address(e, obj_reg, offset, addr_reg);
    let buf = e.asm.code_mut();
    asm::mov_rm(buf, Tmp::Tmp1.reg(), src_slot);
    asm::mov_mr(buf, Mem::new(addr_reg, 0), Tmp::Tmp1.reg());
    Ok(())
}

/// `set`/`getwhere`: pure register copy.
fn emit_copy(e: &mut Emitter, operands: &[Operand]) -> Result<(), JitError> {
    let dst = reg_operand(operands, 0)?;
    let src = reg_operand(operands, 1)?;
    let dst_slot = e.work_slot(dst);
    let src_slot = e.work_slot(src);
    let buf = e.asm.code_mut();
    asm::mov_rm(buf, Tmp::Tmp1.reg(), src_slot);
    asm::mov_mr(buf, dst_slot, Tmp::Tmp1.reg());
    Ok(())
}

fn emit_getspeshslot(e: &mut Emitter, operands: &[Operand]) -> Result<(), JitError> {
    let dst = reg_operand(operands, 0)?;
    let idx = match operands.get(1) {
        Some(Operand::SpeshSlot(i)) => *i,
        _ => return Err(JitError::UnsupportedOpcode(op::SP_GETSPESHSLOT)),
    };
    emit_spesh_slot_fetch(e, Tmp::Tmp1.reg(), idx);
    let slot = e.work_slot(dst);
    let buf = e.asm.code_mut();
    asm::mov_mr(buf, slot, Tmp::Tmp1.reg());
    Ok(())
}

/// `setdispatcher`/`takedispatcher`: move between `tc.cur_dispatcher` and a
/// register; `take` additionally nulls the field.
fn emit_dispatcher(e: &mut Emitter, operands: &[Operand], is_take: bool) -> Result<(), JitError> {
    let reg = reg_operand(operands, 0)?;
    let cur_dispatcher_off = e.tc.cur_dispatcher;
    let slot = e.work_slot(reg);
    let buf = e.asm.code_mut();
    if is_take {
        asm::mov_rm(buf, Tmp::Tmp1.reg(), Mem::new(TC, cur_dispatcher_off));
        asm::mov_mr(buf, slot, Tmp::Tmp1.reg());
        asm::mov_m_imm32(buf, Mem::new(TC, cur_dispatcher_off), 0);
    } else {
        asm::mov_rm(buf, Tmp::Tmp1.reg(), slot);
        asm::mov_mr(buf, Mem::new(TC, cur_dispatcher_off), Tmp::Tmp1.reg());
    }
    Ok(())
}

/// `getcode`: `dst <- CU.body.coderefs[idx]`.
fn emit_getcode(e: &mut Emitter, operands: &[Operand]) -> Result<(), JitError> {
    let dst = reg_operand(operands, 0)?;
    let idx = match operands.get(1) {
        Some(Operand::CoderefIdx(i)) => *i,
        _ => return Err(JitError::UnsupportedOpcode(op::GETCODE)),
    };
    let slot = e.work_slot(dst);
    let buf = e.asm.code_mut();
    asm::mov_rm(buf, Tmp::Tmp1.reg(), Mem::new(CU, REG_SIZE));
    asm::mov_rm(buf, Tmp::Tmp1.reg(), Mem::new(Tmp::Tmp1.reg(), idx as i32 * REG_SIZE));
    asm::mov_mr(buf, slot, Tmp::Tmp1.reg());
    Ok(())
}

/// Integer arithmetic `add/sub/mul/div/mod_i`: loads `b` into `rax`,
/// applies against `WORK[c]`; `div`/`mod` sign-extend with `cqo` first and
/// use `idiv`, storing `rax` (quotient) or `rdx` (remainder).
fn emit_arith_i(e: &mut Emitter, opcode: u16, operands: &[Operand]) -> Result<(), JitError> {
    let dst = reg_operand(operands, 0)?;
    let b = reg_operand(operands, 1)?;
    let c = reg_operand(operands, 2)?;
    let b_slot = e.work_slot(b);
    let c_slot = e.work_slot(c);
    let dst_slot = e.work_slot(dst);
    let buf = e.asm.code_mut();
    asm::mov_rm(buf, Reg::Rax, b_slot);
    asm::mov_rm(buf, Tmp::Tmp1.reg(), c_slot);
    match opcode {
        o if o == op::ADD_I => {
            asm::add_rr(buf, Reg::Rax, Tmp::Tmp1.reg());
            asm::mov_mr(buf, dst_slot, Reg::Rax);
        }
        o if o == op::SUB_I => {
            asm::sub_rr(buf, Reg::Rax, Tmp::Tmp1.reg());
            asm::mov_mr(buf, dst_slot, Reg::Rax);
        }
        o if o == op::MUL_I => {
            asm::imul_rr(buf, Reg::Rax, Tmp::Tmp1.reg());
            asm::mov_mr(buf, dst_slot, Reg::Rax);
        }
        o if o == op::DIV_I => {
            asm::cqo(buf);
            asm::idiv_r(buf, Tmp::Tmp1.reg());
            asm::mov_mr(buf, dst_slot, Reg::Rax);
        }
        o if o == op::MOD_I => {
            asm::cqo(buf);
            asm::idiv_r(buf, Tmp::Tmp1.reg());
            asm::mov_mr(buf, dst_slot, Reg::Rdx);
        }
        _ => return Err(JitError::UnsupportedOpcode(opcode)),
    }
    Ok(())
}

/// `inc_i`/`dec_i`: memory-form `inc`/`dec qword`.
fn emit_inc_dec(e: &mut Emitter, opcode: u16, operands: &[Operand]) -> Result<(), JitError> {
    let reg = reg_operand(operands, 0)?;
    let slot = e.work_slot(reg);
    let buf = e.asm.code_mut();
    if opcode == op::INC_I {
        asm::inc_m(buf, slot);
    } else {
        asm::dec_m(buf, slot);
    }
    Ok(())
}

/// Float arithmetic `add/sub/mul/div_n`: load `b` into `xmm0`, apply
/// against `WORK[c]` as a memory operand, store back.
fn emit_arith_n(e: &mut Emitter, opcode: u16, operands: &[Operand]) -> Result<(), JitError> {
    let dst = reg_operand(operands, 0)?;
    let b = reg_operand(operands, 1)?;
    let c = reg_operand(operands, 2)?;
    let b_slot = e.work_slot(b);
    let c_slot = e.work_slot(c);
    let dst_slot = e.work_slot(dst);
    let buf = e.asm.code_mut();
    asm::movsd_load(buf, Xmm::Xmm0, b_slot);
    match opcode {
        o if o == op::ADD_N => asm::addsd_mem(buf, Xmm::Xmm0, c_slot),
        o if o == op::SUB_N => asm::subsd_mem(buf, Xmm::Xmm0, c_slot),
        o if o == op::MUL_N => asm::mulsd_mem(buf, Xmm::Xmm0, c_slot),
        o if o == op::DIV_N => asm::divsd_mem(buf, Xmm::Xmm0, c_slot),
        _ => return Err(JitError::UnsupportedOpcode(opcode)),
    }
    asm::movsd_store(buf, dst_slot, Xmm::Xmm0);
    Ok(())
}

/// `coerce_in`/`coerce_ni`: `cvtsi2sd`/`cvttsd2si` against memory operands
/// with a store-back.
fn emit_coerce(e: &mut Emitter, opcode: u16, operands: &[Operand]) -> Result<(), JitError> {
    let dst = reg_operand(operands, 0)?;
    let src = reg_operand(operands, 1)?;
    let src_slot = e.work_slot(src);
    let dst_slot = e.work_slot(dst);
    let buf = e.asm.code_mut();
    if opcode == op::COERCE_IN {
        asm::cvtsi2sd_mem(buf, Xmm::Xmm0, src_slot);
        asm::movsd_store(buf, dst_slot, Xmm::Xmm0);
    } else {
        asm::cvttsd2si_mem(buf, Reg::Rax, src_slot);
        asm::mov_mr(buf, dst_slot, Reg::Rax);
    }
    Ok(())
}

/// Comparisons `eq/ne/lt/le/gt/ge_i, eqaddr`: `cmp`, `setcc` into `al`,
/// `movzx` to the full register, store (spec.md §8: "setcc emits exactly
/// {0,1}").
fn emit_compare(e: &mut Emitter, opcode: u16, operands: &[Operand]) -> Result<(), JitError> {
    let dst = reg_operand(operands, 0)?;
    let b = reg_operand(operands, 1)?;
    let c = reg_operand(operands, 2)?;
    let b_slot = e.work_slot(b);
    let c_slot = e.work_slot(c);
    let dst_slot = e.work_slot(dst);
    let cond = match opcode {
        o if o == op::EQ_I || o == op::EQADDR => Cond::Eq,
        o if o == op::NE_I => Cond::Ne,
        o if o == op::LT_I => Cond::Lt,
        o if o == op::LE_I => Cond::Le,
        o if o == op::GT_I => Cond::Gt,
        o if o == op::GE_I => Cond::Ge,
        _ => return Err(JitError::UnsupportedOpcode(opcode)),
    };
    let buf = e.asm.code_mut();
    asm::mov_rm(buf, Reg::Rax, b_slot);
    asm::mov_rm(buf, Tmp::Tmp1.reg(), c_slot);
    asm::cmp_rr(buf, Reg::Rax, Tmp::Tmp1.reg());
    asm::setcc_and_zero_extend(buf, cond, Reg::Rax);
    asm::mov_mr(buf, dst_slot, Reg::Rax);
    Ok(())
}

/// `sp_fastcreate`: allocate, install the STable from a spesh slot, stamp
/// header size/owner (spec.md §4.E).
fn emit_fastcreate(e: &mut Emitter, operands: &[Operand]) -> Result<(), JitError> {
    let dst = reg_operand(operands, 0)?;
    let size = match operands.get(1) {
        Some(Operand::ImmI64(v)) => *v,
        Some(Operand::ImmI16(v)) => *v as i64,
        _ => return Err(JitError::UnsupportedOpcode(op::SP_FASTCREATE)),
    };
    let spesh_slot = match operands.get(2) {
        Some(Operand::SpeshSlot(i)) => *i,
        _ => return Err(JitError::UnsupportedOpcode(op::SP_FASTCREATE)),
    };

    let tc_arg = e.abi.int_args()[0];
    let size_arg = e.abi.int_args()[1];
    {
        let buf = e.asm.code_mut();
        asm::mov_rr(buf, tc_arg, TC);
        asm::mov_ri64(buf, size_arg, size);
    }
    emit_c_call_trampoline(e, e.runtime.gc_allocate_zeroed);

    let obj_reg = Tmp::Tmp2.reg();
    {
        let buf = e.asm.code_mut();
        asm::mov_rr(buf, obj_reg, crate::regs::RV);
    }
    emit_spesh_slot_fetch(e, Tmp::Tmp1.reg(), spesh_slot);

    let st_off = e.obj.st;
    let header_flags_off = e.obj.header_flags;
    let thread_id_off = e.tc.thread_id;
    let dst_slot = e.work_slot(dst);
    let buf = e.asm.code_mut();
    asm::mov_mr(buf, Mem::new(obj_reg, st_off), Tmp::Tmp1.reg());
    asm::mov_mi16(buf, Mem::new(obj_reg, header_flags_off + 4), size as u16);
    asm::mov_r32_m(buf, Tmp::Tmp3.reg(), Mem::new(TC, thread_id_off));
    asm::mov_m_r32(buf, Mem::new(obj_reg, header_flags_off + 8), Tmp::Tmp3.reg());
    asm::mov_mr(buf, dst_slot, obj_reg);
    Ok(())
}

/// Dispatches a single `Primitive` node by opcode. Unknown opcodes are a
/// fatal build error (spec.md §4.E, §7): the caller aborts compilation of
/// this block and the interpreter takes over.
pub fn emit(e: &mut Emitter, opcode: u16, operands: &[Operand]) -> Result<(), JitError> {
    log::trace!("emit opcode {opcode} ({} operands)", operands.len());
    match opcode {
        o if o == op::CONST_I64_16 || o == op::CONST_I64 || o == op::CONST_N64 => {
            emit_const(e, o, operands)
        }
        o if o == op::CONST_S => emit_const_s(e, operands),
        o if o == op::NULL => emit_null(e, operands),
        o if o == op::GETHOW => emit_gethow_getwhat(e, operands, 0),
        o if o == op::GETWHAT => emit_gethow_getwhat(e, operands, REG_SIZE),
        o if o == op::GETLEX => emit_getlex(e, operands),
        o if o == op::BINDLEX => emit_bindlex(e, operands),
        o if o == op::SP_GETARG_I
            || o == op::SP_GETARG_N
            || o == op::SP_GETARG_S
            || o == op::SP_GETARG_O =>
        {
            emit_getarg(e, operands)
        }
        o if o == op::SP_P6OGET_I || o == op::SP_P6OGET_N || o == op::SP_P6OGET_S => {
            emit_p6oget_plain(e, operands, false)
        }
        o if o == op::SP_P6OGET_O => emit_p6oget_plain(e, operands, true),
        o if o == op::SP_P6OGET_VT_O => emit_p6oget_vt_o(e, operands),
        o if o == op::SP_P6OGET_VC_O => emit_p6oget_vc_o(e, operands),
        o if o == op::SP_P6OBIND_I || o == op::SP_P6OBIND_N || o == op::SP_P6OBIND_S => {
            emit_p6obind(e, operands, false)
        }
        o if o == op::SP_P6OBIND_O => emit_p6obind(e, operands, true),
        o if o == op::SET || o == op::GETWHERE => emit_copy(e, operands),
        o if o == op::SP_GETSPESHSLOT => emit_getspeshslot(e, operands),
        o if o == op::SETDISPATCHER => emit_dispatcher(e, operands, false),
        o if o == op::TAKEDISPATCHER => emit_dispatcher(e, operands, true),
        o if o == op::GETCODE => emit_getcode(e, operands),
        o if o == op::ADD_I || o == op::SUB_I || o == op::MUL_I || o == op::DIV_I || o == op::MOD_I => {
            emit_arith_i(e, o, operands)
        }
        o if o == op::INC_I || o == op::DEC_I => emit_inc_dec(e, o, operands),
        o if o == op::ADD_N || o == op::SUB_N || o == op::MUL_N || o == op::DIV_N => {
            emit_arith_n(e, o, operands)
        }
        o if o == op::COERCE_IN || o == op::COERCE_NI => emit_coerce(e, o, operands),
        o if o == op::EQ_I
            || o == op::NE_I
            || o == op::LT_I
            || o == op::LE_I
            || o == op::GT_I
            || o == op::GE_I
            || o == op::EQADDR =>
        {
            emit_compare(e, o, operands)
        }
        o if o == op::SP_FASTCREATE => emit_fastcreate(e, operands),
        other => {
            log::debug!("no emitter for opcode {other}, block compile aborted");
            Err(JitError::UnsupportedOpcode(other))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::Abi;
    use crate::emit::mock_runtime;
    use crate::ir::Operand;
    use smallvec::smallvec;

    #[test]
    fn const_i64_emits_a_mov_and_store() {
        let mut e = Emitter::new(Abi::SysV, mock_runtime());
        let operands: smallvec::SmallVec<[Operand; 4]> =
            smallvec![Operand::Reg(0), Operand::ImmI64(i64::MIN)];
        emit(&mut e, op::CONST_I64, &operands).unwrap();
        assert!(e.asm.len() > 0);
    }

    #[test]
    fn unknown_opcode_is_rejected() {
        let mut e = Emitter::new(Abi::SysV, mock_runtime());
        let operands: smallvec::SmallVec<[Operand; 4]> = smallvec![];
        assert_eq!(emit(&mut e, 9999, &operands), Err(JitError::UnsupportedOpcode(9999)));
    }

    /// Two back-to-back `sp_p6oget_vt_o`s on the same field must emit the
    /// identical vivify-then-store-back sequence each time: nothing in the
    /// generated code depends on whether the first call already vivified
    /// the field, since that idempotence is enforced by storing the type
    /// back into the field itself rather than by anything the emitter
    /// tracks at compile time.
    #[test]
    fn vivify_type_getter_stores_the_result_back_into_the_field() {
        let mut first = Emitter::new(Abi::SysV, mock_runtime());
        let operands: smallvec::SmallVec<[Operand; 4]> = smallvec![
            Operand::Reg(0),
            Operand::Reg(1),
            Operand::ImmI16(16),
            Operand::SpeshSlot(2),
        ];
        emit(&mut first, op::SP_P6OGET_VT_O, &operands).unwrap();

        let mut second = Emitter::new(Abi::SysV, mock_runtime());
        emit(&mut second, op::SP_P6OGET_VT_O, &operands).unwrap();

        assert!(first.asm.len() > 0);
        assert_eq!(first.asm.len(), second.asm.len());
    }

    #[test]
    fn vivify_clone_getter_calls_repr_clone_and_is_rejected_without_a_spesh_slot() {
        let mut e = Emitter::new(Abi::SysV, mock_runtime());
        let missing_slot: smallvec::SmallVec<[Operand; 4]> =
            smallvec![Operand::Reg(0), Operand::Reg(1), Operand::ImmI16(16)];
        assert_eq!(
            emit(&mut e, op::SP_P6OGET_VC_O, &missing_slot),
            Err(JitError::UnsupportedOpcode(op::SP_P6OGET_VC_O))
        );

        let operands: smallvec::SmallVec<[Operand; 4]> = smallvec![
            Operand::Reg(0),
            Operand::Reg(1),
            Operand::ImmI16(16),
            Operand::SpeshSlot(3),
        ];
        emit(&mut e, op::SP_P6OGET_VC_O, &operands).unwrap();
        assert!(e.asm.len() > 0);
    }
}
