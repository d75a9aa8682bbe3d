//! The invoke protocol (spec.md §4.G): callsite preparation, argument
//! staging, frame wiring, and the fast vs. multi-dispatch call paths.
//! Every step runs within one basic block so the pinned VM-global
//! registers stay intact across the whole sequence.

use crate::asm::Mem;
use crate::error::JitError;
use crate::ir::{InvokeSpec, ReturnType};
use crate::regs::{Reg, Tmp, CU, REG_SIZE, TC};

use super::prologue::emit_c_call_trampoline;
use super::Emitter;

/// Checked once per backend instantiation, not per invoke — see
/// [`check_return_type_width`]. `Frame::return_type` is declared `i32` in
/// [`crate::frame`], so this is a standing invariant rather than a runtime
/// probe; kept as a function so the check has a single, documented home
/// (spec.md §6: "Sizes: `return_type` must be 32 bits; violation is a
/// fatal compile error").
pub fn check_return_type_width() -> Result<(), JitError> {
    let actual = std::mem::size_of::<i32>() * 8;
    if actual != 32 {
        return Err(JitError::ReturnTypeWidth { actual });
    }
    Ok(())
}

fn return_type_tag(rt: ReturnType) -> i32 {
    match rt {
        ReturnType::Void => 0,
        ReturnType::Int => 1,
        ReturnType::Num => 2,
        ReturnType::Str => 3,
        ReturnType::Obj => 4,
    }
}

/// Emits the full nine-step sequence from spec.md §4.G.
pub fn emit_invoke(e: &mut Emitter, spec: &InvokeSpec) -> Result<(), JitError> {
    check_return_type_width()?;
    log::trace!(
        "emit invoke callsite={} fast={} args={}",
        spec.callsite_idx,
        spec.is_fast,
        spec.args.len()
    );

    // 1. MVM_args_prepare(tc, cu, callsite_idx) -> callsite ptr, kept on
    //    the native stack across the sequence (step 8 needs its address).
    let tc_arg = e.abi.int_args()[0];
    let cu_arg = e.abi.int_args()[1];
    let callsite_arg = e.abi.int_args()[2];
    {
        let buf = e.asm.code_mut();
        crate::asm::mov_rr(buf, tc_arg, TC);
        crate::asm::mov_rr(buf, cu_arg, CU);
        crate::asm::mov_ri64(buf, callsite_arg, spec.callsite_idx as i64);
    }
    emit_c_call_trampoline(e, e.runtime.args_prepare);
    {
        let buf = e.asm.code_mut();
        crate::asm::push_r(buf, crate::regs::RV);
    }

    // 2. Load cur_frame and its args buffer.
    let cur_frame_off = e.tc.cur_frame;
    let frame_args_off = e.frame.args;
    let frame_reg = Tmp::Tmp2.reg();
    let args_buf_reg = Tmp::Tmp3.reg();
    {
        let buf = e.asm.code_mut();
        crate::asm::mov_rm(buf, frame_reg, Mem::new(TC, cur_frame_off));
        crate::asm::mov_rm(buf, args_buf_reg, Mem::new(frame_reg, frame_args_off));
    }

    // 3. Stage each argument into args[dst_slot] (dst_slot == position).
    for (dst_slot, arg_reg) in spec.args.iter().enumerate() {
        let src_slot = e.work_slot(*arg_reg);
        let buf = e.asm.code_mut();
        crate::asm::mov_rm(buf, Tmp::Tmp1.reg(), src_slot);
        crate::asm::mov_mr(
            buf,
            Mem::new(args_buf_reg, dst_slot as i32 * REG_SIZE),
            Tmp::Tmp1.reg(),
        );
    }

    // 4. frame.return_type = invoke.return_type (32-bit field).
    let return_type_off = e.frame.return_type;
    {
        let buf = e.asm.code_mut();
        crate::asm::mov_m_imm32(
            buf,
            Mem::new(frame_reg, return_type_off),
            return_type_tag(spec.return_type),
        );
    }

    // 5. frame.return_value <- &WORK[return_register], or NULL for void.
    let return_value_off = e.frame.return_value;
    match spec.return_reg {
        Some(reg) => {
            let slot = e.work_slot(reg);
            let buf = e.asm.code_mut();
            crate::asm::lea(buf, Tmp::Tmp1.reg(), slot);
            crate::asm::mov_mr(buf, Mem::new(frame_reg, return_value_off), Tmp::Tmp1.reg());
        }
        None => {
            let buf = e.asm.code_mut();
            crate::asm::mov_mi32(buf, Mem::new(frame_reg, return_value_off), 0);
        }
    }

    // 6. frame.return_address <- *tc.interp_cur_op (snapshot current IP).
    let interp_cur_op_off = e.tc.interp_cur_op;
    let return_address_off = e.frame.return_address;
    {
        let buf = e.asm.code_mut();
        crate::asm::mov_rm(buf, Tmp::Tmp1.reg(), Mem::new(TC, interp_cur_op_off));
        crate::asm::mov_rm(buf, Tmp::Tmp1.reg(), Mem::new(Tmp::Tmp1.reg(), 0));
        crate::asm::mov_mr(
            buf,
            Mem::new(frame_reg, return_address_off),
            Tmp::Tmp1.reg(),
        );
    }

    // 7. frame.jit_entry_label <- &reentry_label. `lea rip`-relative
    //    addressing resolves through the same fixup list as a `jmp`/`jcc`
    //    displacement (spec.md §4.A labels are positions within this same
    //    code buffer, so no separate post-link relocation pass is needed).
    let jit_entry_label_off = e.frame.jit_entry_label;
    {
        let buf = e.asm.code_mut();
        crate::asm::lea_rip_placeholder(buf, Tmp::Tmp1.reg());
    }
    e.asm.record_fixup(spec.reentry);
    {
        let buf = e.asm.code_mut();
        crate::asm::mov_mr(
            buf,
            Mem::new(frame_reg, jit_entry_label_off),
            Tmp::Tmp1.reg(),
        );
    }

    // 8 & the code/callsite registers needed by either call path.
    let code_slot = e.work_slot(spec.code_reg);
    if spec.is_fast {
        let tc_arg = e.abi.int_args()[0];
        let code_arg = e.abi.int_args()[1];
        let callsite_arg = e.abi.int_args()[2];
        let spesh_arg = e.abi.int_args()[3];
        {
            let buf = e.asm.code_mut();
            crate::asm::mov_rr(buf, tc_arg, TC);
            crate::asm::mov_rm(buf, code_arg, code_slot);
            crate::asm::mov_rm(buf, callsite_arg, Mem::new(Reg::Rsp, 0));
            crate::asm::mov_ri64(
                buf,
                spesh_arg,
                spec.spesh_cand.map(i64::from).unwrap_or(-1),
            );
        }
        emit_c_call_trampoline(e, e.runtime.frame_invoke_code);
    } else {
        let tc_arg = e.abi.int_args()[0];
        let code_arg = e.abi.int_args()[1];
        let callsite_ptr_arg = e.abi.int_args()[2];
        let args_arg = e.abi.int_args()[3];
        {
            let buf = e.asm.code_mut();
            crate::asm::mov_rr(buf, tc_arg, TC);
            crate::asm::mov_rm(buf, code_arg, code_slot);
            // `args_arg` copied out of `args_buf_reg` before
            // `callsite_ptr_arg` is written: on Win64 both land in r8.
            crate::asm::mov_rr(buf, args_arg, args_buf_reg);
            // ARG3 is `&callsite_ptr` itself, not its contents: the callee
            // writes the resolved callsite back through this pointer.
            crate::asm::mov_rr(buf, callsite_ptr_arg, Reg::Rsp);
        }
        emit_c_call_trampoline(e, e.runtime.find_invokee_multi_ok);

        // Every scratch register is caller-saved, so `args_buf_reg` does
        // not survive the call above; reload it from the (callee-saved)
        // `TC` before using it again.
        {
            let buf = e.asm.code_mut();
            crate::asm::mov_rm(buf, frame_reg, Mem::new(TC, cur_frame_off));
            crate::asm::mov_rm(buf, args_buf_reg, Mem::new(frame_reg, frame_args_off));
        }

        // code.st.invoke(tc, code, callsite_idx, args) — indirect through
        // the STable's invoke field (spec.md §9: "no virtual tables
        // needed"). This entry point's signature is fixed by
        // `Stable::invoke` (crate::frame): unlike the two trampolines
        // above, its third argument is the plain `u16` callsite index, not
        // the descriptor `MVM_args_prepare` produced.
        let st_off = e.obj.st;
        let invoke_fn_off = std::mem::offset_of!(crate::frame::Stable, invoke) as i32;
        let callee_reg = Tmp::Tmp2.reg();
        {
            let buf = e.asm.code_mut();
            crate::asm::mov_rm(buf, callee_reg, code_slot);
            crate::asm::mov_rm(buf, Tmp::Tmp4.reg(), Mem::new(callee_reg, st_off));
            crate::asm::mov_rm(
                buf,
                crate::regs::FUNCTION,
                Mem::new(Tmp::Tmp4.reg(), invoke_fn_off),
            );
            crate::asm::mov_rr(buf, tc_arg, TC);
            crate::asm::mov_rr(buf, code_arg, callee_reg);
            // `args_arg` must be copied out of `args_buf_reg` before
            // `callsite_ptr_arg` is overwritten: on Win64 both land in r8.
            crate::asm::mov_rr(buf, args_arg, args_buf_reg);
            crate::asm::mov_ri64(buf, callsite_ptr_arg, spec.callsite_idx as i64);
            crate::asm::call_r(buf, crate::regs::FUNCTION);
        }
    }

    // Pop the callsite slot pushed in step 1.
    {
        let buf = e.asm.code_mut();
        crate::asm::pop_r(buf, Tmp::Tmp1.reg());
    }

    // 9. RV <- 1 (continue-in-interpreter); jump to out.
    {
        let buf = e.asm.code_mut();
        crate::asm::mov_ri64(buf, crate::regs::RV, 1);
        crate::asm::jmp_rel32_placeholder(buf);
        e.asm.record_fixup(crate::buffer::LabelId::Out);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn return_type_width_invariant_holds_on_this_host() {
        assert!(check_return_type_width().is_ok());
    }
}
