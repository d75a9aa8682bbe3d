//! Prologue/epilogue, the C-call trampoline, and the handful of emitter
//! primitives shared by every opcode (spec.md §4.D).

use crate::asm::{self, Cond, Mem};
use crate::buffer::LabelId;
use crate::regs::{Reg, ARGS, CU, FUNCTION, REG_SIZE, TC, WORK};

use super::Emitter;

/// `push rbp; mov rbp, rsp; push {TC,WORK,ARGS,CU}`, then load `TC`/`CU`
/// from the entry ABI's first two integer args, fetch `WORK`/`ARGS` off
/// the current frame, and jump to the entry label passed as the third
/// argument (spec.md §4.D, §6 entry ABI).
pub fn emit_prologue(e: &mut Emitter) {
    let buf = e.asm.code_mut();
    asm::push_rbp_and_move(buf);
    asm::push_r(buf, TC);
    asm::push_r(buf, WORK);
    asm::push_r(buf, ARGS);
    asm::push_r(buf, CU);

    let int_args = e.abi.int_args();
    asm::mov_rr(buf, TC, int_args[0]);
    asm::mov_rr(buf, CU, int_args[1]);

    // WORK <- TC.cur_frame.work; ARGS <- TC.cur_frame.params_args.
    // cur_frame is loaded into FUNCTION as scratch first.
    asm::mov_rm(buf, FUNCTION, Mem::new(TC, e.tc.cur_frame));
    let frame_reg = FUNCTION;
    asm::mov_rm(buf, WORK, Mem::new(frame_reg, e.frame.work));
    asm::mov_rm(buf, ARGS, Mem::new(frame_reg, e.frame.params_args));

    // Tail-jump to the block's entry label, carried in the third arg.
    asm::jmp_r(buf, int_args[2]);
}

/// Binds the two global labels and emits the shared tear-down: restore
/// `{CU,ARGS,WORK,TC}`, restore `rsp`/`rbp`, `ret`. `exit` additionally
/// zeroes `RV` before falling into the shared tail (spec.md §4.D).
pub fn emit_epilogue(e: &mut Emitter) {
    e.bind(LabelId::Exit);
    {
        let buf = e.asm.code_mut();
        asm::xor_rr(buf, crate::regs::RV, crate::regs::RV);
    }
    e.bind(LabelId::Out);
    let buf = e.asm.code_mut();
    asm::pop_r(buf, CU);
    asm::pop_r(buf, ARGS);
    asm::pop_r(buf, WORK);
    asm::pop_r(buf, TC);
    asm::restore_rsp_and_pop_rbp(buf);
    asm::ret(buf);
}

/// Loads a 64-bit absolute function pointer and calls through it, honoring
/// the ABI's shadow-space discipline (spec.md §4.D "C-call trampoline").
pub fn emit_c_call_trampoline(e: &mut Emitter, target: usize) {
    let shadow = e.abi.shadow_space();
    let buf = e.asm.code_mut();
    asm::mov_ri64(buf, FUNCTION, target as i64);
    if shadow > 0 {
        asm::sub_ri32(buf, Reg::Rsp, shadow);
    }
    asm::call_r(buf, FUNCTION);
    if shadow > 0 {
        asm::add_ri32(buf, Reg::Rsp, shadow);
    }
}

/// Emits the write-barrier predicate, leaving flags such that ZF=0 iff the
/// barrier must fire: `root` is old-gen, `reference` is non-null, and
/// `reference` is young (spec.md §4.D). The original packs two `setcc`
/// results into `al`/`ah` and finishes with `test ah, al`; `ah`-style high
/// byte addressing doesn't extend to the R8-R15 file, so this backend
/// folds the same three booleans through caller-saved scratch registers
/// with `and`/`test` instead — flags-equivalent, same call-site contract.
pub fn emit_write_barrier_check(e: &mut Emitter, root: Reg, reference: Reg) {
    use crate::frame::SECOND_GEN_BIT;
    use crate::regs::Tmp;
    let buf = e.asm.code_mut();
    let root_old = Tmp::Tmp5.reg();
    let ref_nonnull = Tmp::Tmp6.reg();
    let ref_young = Tmp::Tmp4.reg();

    asm::test_mi16(buf, Mem::new(root, 0), SECOND_GEN_BIT);
    asm::setcc_and_zero_extend(buf, Cond::NotZero, root_old);

    asm::test_rr(buf, reference, reference);
    asm::setcc_and_zero_extend(buf, Cond::NotZero, ref_nonnull);

    asm::test_mi16(buf, Mem::new(reference, 0), SECOND_GEN_BIT);
    asm::setcc_and_zero_extend(buf, Cond::Eq, ref_young);

    asm::and_rr(buf, ref_nonnull, ref_young);
    asm::and_rr(buf, root_old, ref_nonnull);
    asm::test_rr(buf, root_old, root_old);
}

/// `call MVM_gc_write_barrier_hit(tc, root)`.
pub fn emit_write_barrier_hit(e: &mut Emitter, hit_fn: usize, root: Reg) {
    let tc_arg = e.abi.int_args()[0];
    let root_arg = e.abi.int_args()[1];
    {
        let buf = e.asm.code_mut();
        asm::mov_rr(buf, tc_arg, TC);
        asm::mov_rr(buf, root_arg, root);
    }
    emit_c_call_trampoline(e, hit_fn);
}

/// `dst <- tc.cur_frame.effective_spesh_slots[idx]`. `dst` is reused as the
/// scratch register for the intermediate `cur_frame`/`slots` pointers.
pub fn emit_spesh_slot_fetch(e: &mut Emitter, dst: Reg, idx: u16) {
    let cur_frame_off = e.tc.cur_frame;
    let slots_off = e.frame.effective_spesh_slots;
    let buf = e.asm.code_mut();
    asm::mov_rm(buf, dst, Mem::new(TC, cur_frame_off));
    asm::mov_rm(buf, dst, Mem::new(dst, slots_off));
    asm::mov_rm(buf, dst, Mem::new(dst, idx as i32 * REG_SIZE));
}

/// `dst <- tc.instance.VMNull`.
pub fn emit_vmnull_fetch(e: &mut Emitter, dst: Reg) {
    let instance_off = e.tc.instance;
    let buf = e.asm.code_mut();
    asm::mov_rm(buf, dst, Mem::new(TC, instance_off));
    asm::mov_rm(buf, dst, Mem::new(dst, 0));
}

/// `test word (obj.header.flags), TYPE_OBJECT_BIT`; ZF=0 iff set.
pub fn emit_type_object_test(e: &mut Emitter, obj: Reg) {
    use crate::frame::TYPE_OBJECT_BIT;
    let buf = e.asm.code_mut();
    asm::test_mi16(buf, Mem::new(obj, 0), TYPE_OBJECT_BIT);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::Abi;
    use crate::emit::mock_runtime;

    #[test]
    fn prologue_pushes_all_four_pinned_registers() {
        let mut e = Emitter::new(Abi::SysV, mock_runtime());
        emit_prologue(&mut e);
        let code = e.asm.code_mut();
        // push rbp, then 4 push r64 forms for TC/WORK/ARGS/CU.
        assert_eq!(code[0], 0x55); // push rbp
    }
}
