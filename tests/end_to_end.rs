//! End-to-end scenarios (spec.md §8): build a [`Block`], compile it, wire up
//! a minimal [`Frame`]/[`ThreadContext`], and actually run the generated
//! machine code through the entry ABI.

use moarvm_jit_core::abi::Abi;
use moarvm_jit_core::buffer::LabelId;
use moarvm_jit_core::emit::{compile_block, ObjectLayout, Runtime};
use moarvm_jit_core::frame::{Frame, HeapObject, Instance, ThreadContext, SECOND_GEN_BIT};
use moarvm_jit_core::ir::{Block, BranchSpec, GuardKind, GuardSpec, InvokeSpec, Node, Operand, ReturnType};
use moarvm_jit_core::opcodes;
use moarvm_jit_core::ExecutableBuffer;

use smallvec::smallvec;
use std::sync::atomic::{AtomicU32, Ordering};

fn mock_runtime() -> Runtime {
    Runtime {
        write_barrier_hit: 0,
        gc_allocate_zeroed: 0,
        vivify_lexical: 0,
        repr_clone: 0,
        deopt_one_direct: deopt_probe as usize,
        args_prepare: 0,
        find_invokee_multi_ok: 0,
        frame_invoke_code: 0,
    }
}

/// Stands in for `MVM_jit_deopt_one_direct`: records the `(offset, target)`
/// pair it was called with so the test can assert the guard wired the right
/// values through, instead of actually unwinding a frame.
static DEOPT_CALL: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);

extern "C" fn deopt_probe(_tc: *mut ThreadContext, offset: i64, target: i64) {
    let packed = ((offset as u64) << 32) | (target as u64 & 0xffff_ffff);
    DEOPT_CALL.store(packed, std::sync::atomic::Ordering::SeqCst);
}

/// Builds a frame/thread-context pair with `nwork` work registers, zeroed.
fn make_frame(nwork: usize) -> (Box<[i64]>, Box<Frame>, Box<ThreadContext>, Box<Instance>) {
    let work = vec![0i64; nwork].into_boxed_slice();
    let instance = Box::new(Instance { vm_null: 0 });
    let frame = Box::new(Frame {
        work: work.as_ptr() as *mut i64,
        params_args: std::ptr::null_mut(),
        args: std::ptr::null_mut(),
        outer: std::ptr::null_mut(),
        env: std::ptr::null_mut(),
        effective_spesh_slots: std::ptr::null(),
        return_type: 0,
        return_value: std::ptr::null_mut(),
        return_address: std::ptr::null(),
        jit_entry_label: std::ptr::null(),
    });
    let tc = Box::new(ThreadContext {
        cur_frame: std::ptr::null_mut(),
        cur_dispatcher: std::ptr::null_mut(),
        instance: instance.as_ref() as *const Instance,
        interp_cur_op: std::ptr::null(),
        thread_id: 1,
        prof_data: std::ptr::null_mut(),
        gc_promoted_bytes: 0,
    });
    (work, frame, tc, instance)
}

type EntryFn = extern "C" fn(*mut ThreadContext, *const u8, *const u8) -> i64;

/// Runs a compiled block's entry point and returns `(retval, work[..])`.
fn run(block: &Block, nwork: usize) -> (i64, Vec<i64>) {
    let _ = env_logger::try_init();
    let compiled = compile_block(Abi::SysV, mock_runtime(), block).expect("compile");
    let exec = ExecutableBuffer::new(&compiled.code).expect("mmap");

    let (work, mut frame, mut tc, _instance) = make_frame(nwork);
    frame.work = work.as_ptr() as *mut i64;
    tc.cur_frame = frame.as_mut() as *mut Frame;

    let entry_ptr = unsafe { exec.as_ptr().add(compiled.entry) };
    let f: EntryFn = unsafe { std::mem::transmute(exec.as_ptr()) };
    let rv = f(tc.as_mut() as *mut ThreadContext, std::ptr::null(), entry_ptr);
    (rv, work.to_vec())
}

/// Scenario 1 (spec.md §8): `const_i64 r0,42; add_i r1,r0,r0; exit` ->
/// `WORK[1] == 84`, return `0`.
#[test]
fn const_and_add_then_exit() {
    let mut block = Block::new();
    block.push(Node::Primitive {
        opcode: opcodes::CONST_I64,
        operands: smallvec![Operand::Reg(0), Operand::ImmI64(42)],
    });
    block.push(Node::Primitive {
        opcode: opcodes::ADD_I,
        operands: smallvec![Operand::Reg(1), Operand::Reg(0), Operand::Reg(0)],
    });
    block.push(Node::Branch(BranchSpec::Exit));

    let (rv, work) = run(&block, 2);
    assert_eq!(rv, 0);
    assert_eq!(work[1], 84);
}

/// A comparison chain: `const_i64 r0,5; const_i64 r1,5; eq_i r2,r0,r1; exit`
/// -> `WORK[2] == 1` (setcc zero-extended to exactly 1, never a stray high
/// byte), return `0`.
#[test]
fn comparison_result_is_exactly_zero_or_one() {
    let mut block = Block::new();
    block.push(Node::Primitive {
        opcode: opcodes::CONST_I64,
        operands: smallvec![Operand::Reg(0), Operand::ImmI64(5)],
    });
    block.push(Node::Primitive {
        opcode: opcodes::CONST_I64,
        operands: smallvec![Operand::Reg(1), Operand::ImmI64(5)],
    });
    block.push(Node::Primitive {
        opcode: opcodes::EQ_I,
        operands: smallvec![Operand::Reg(2), Operand::Reg(0), Operand::Reg(1)],
    });
    block.push(Node::Branch(BranchSpec::Exit));

    let (rv, work) = run(&block, 3);
    assert_eq!(rv, 0);
    assert_eq!(work[2], 1);
}

/// Scenario: a failing guard deopts instead of falling through. `r0` is left
/// null, so the guard's non-null check fails immediately and the deopt path
/// runs with the recorded `(offset, target)` pair, returning the `DEOPT`
/// sentinel rather than `0`/`1`.
#[test]
fn failing_guard_deopts_with_its_recorded_offsets() {
    DEOPT_CALL.store(0, std::sync::atomic::Ordering::SeqCst);

    let mut block = Block::new();
    block.push(Node::Guard(GuardSpec {
        kind: GuardKind::Type,
        object: 0,
        spesh_slot: 0,
        deopt_offset: 7,
        deopt_target: 99,
    }));
    block.push(Node::Branch(BranchSpec::Exit));

    let (work, mut frame, mut tc, _instance) = make_frame(1);
    // The guard's spesh-slot fetch runs unconditionally before the null
    // check branches away, so this must point at real (if unused) memory.
    let spesh_slots = [0i64; 1];
    frame.work = work.as_ptr() as *mut i64;
    frame.effective_spesh_slots = spesh_slots.as_ptr();
    tc.cur_frame = frame.as_mut() as *mut Frame;

    let compiled = compile_block(Abi::SysV, mock_runtime(), &block).expect("compile");
    let exec = ExecutableBuffer::new(&compiled.code).expect("mmap");
    let entry_ptr = unsafe { exec.as_ptr().add(compiled.entry) };
    let f: EntryFn = unsafe { std::mem::transmute(exec.as_ptr()) };
    let rv = f(tc.as_mut() as *mut ThreadContext, std::ptr::null(), entry_ptr);

    assert_eq!(rv, -1, "DEOPT sentinel, distinct from 0/1");
    let packed = DEOPT_CALL.load(std::sync::atomic::Ordering::SeqCst);
    assert_eq!(packed >> 32, 7, "deopt_offset must reach the C helper unchanged");
    assert_eq!(packed & 0xffff_ffff, 99, "deopt_target must reach the C helper unchanged");
}

/// Scenario: `sp_getarg_i` reads the caller's staged argument buffer
/// (`params_args`, distinct from `WORK`) and `inc_i` then mutates `WORK` in
/// place.
#[test]
fn getarg_then_inc_reads_the_args_buffer_and_increments_in_place() {
    let mut block = Block::new();
    block.push(Node::Primitive {
        opcode: opcodes::SP_GETARG_I,
        operands: smallvec![Operand::Reg(0), Operand::CallsiteIdx(0)],
    });
    block.push(Node::Primitive {
        opcode: opcodes::INC_I,
        operands: smallvec![Operand::Reg(0)],
    });
    block.push(Node::Branch(BranchSpec::Exit));

    let (mut work, mut frame, mut tc, _instance) = make_frame(1);
    let args = [41i64];
    frame.work = work.as_mut_ptr();
    frame.params_args = args.as_ptr() as *mut i64;
    tc.cur_frame = frame.as_mut() as *mut Frame;

    let compiled = compile_block(Abi::SysV, mock_runtime(), &block).expect("compile");
    let exec = ExecutableBuffer::new(&compiled.code).expect("mmap");
    let entry_ptr = unsafe { exec.as_ptr().add(compiled.entry) };
    let f: EntryFn = unsafe { std::mem::transmute(exec.as_ptr()) };
    let rv = f(tc.as_mut() as *mut ThreadContext, std::ptr::null(), entry_ptr);

    assert_eq!(rv, 0);
    assert_eq!(work[0], 42);
}

/// Scenario: `coerce_in`/`coerce_ni` round-trip an integer through a
/// double and back, truncating toward zero on the way back (spec.md §8).
#[test]
fn coerce_round_trip_through_float_and_back_truncates_toward_zero() {
    let mut block = Block::new();
    block.push(Node::Primitive {
        opcode: opcodes::CONST_I64,
        operands: smallvec![Operand::Reg(0), Operand::ImmI64(7)],
    });
    block.push(Node::Primitive {
        opcode: opcodes::COERCE_IN,
        operands: smallvec![Operand::Reg(1), Operand::Reg(0)],
    });
    block.push(Node::Primitive {
        opcode: opcodes::COERCE_NI,
        operands: smallvec![Operand::Reg(2), Operand::Reg(1)],
    });
    block.push(Node::Branch(BranchSpec::Exit));

    let (rv, work) = run(&block, 3);
    assert_eq!(rv, 0);
    assert_eq!(f64::from_bits(work[1] as u64), 7.0);
    assert_eq!(work[2], 7);
}

/// Builds an `sp_p6obind_o r0, 0, r1` block: binds `WORK[1]` into the first
/// p6opaque body field of the object whose pointer lives in `WORK[0]`.
fn bind_o_block() -> Block {
    let mut block = Block::new();
    block.push(Node::Primitive {
        opcode: opcodes::SP_P6OBIND_O,
        operands: smallvec![Operand::Reg(0), Operand::ImmI16(0), Operand::Reg(1)],
    });
    block.push(Node::Branch(BranchSpec::Exit));
    block
}

/// A minimal heap object backing buffer: just enough trailing bytes past
/// `HeapObject` for the body-field store the bind emitters do, with
/// `body_replaced` left null so the address computation takes the inline
/// body path. `second_gen` sets the bit the write barrier reads off offset
/// 0 (shared with `ObjectHeader::flags`).
fn make_object_buf(second_gen: bool) -> Vec<u8> {
    let body_start = ObjectLayout::host().body_start as usize;
    let mut buf = vec![0u8; body_start + 8];
    let flags: u32 = if second_gen { SECOND_GEN_BIT as u32 } else { 0 };
    unsafe {
        (*(buf.as_mut_ptr() as *mut AtomicU32)).store(flags, Ordering::SeqCst);
    }
    buf
}

/// Oracle for the write-barrier predicate (spec.md §4.D): fires iff the
/// root is old-gen, the reference is non-null, and the reference is young.
fn barrier_should_fire(root_old: bool, ref_nonnull: bool, ref_young: bool) -> bool {
    root_old && ref_nonnull && ref_young
}

static BARRIER_HIT_COUNT: AtomicU32 = AtomicU32::new(0);

extern "C" fn barrier_hit_probe(_tc: *mut ThreadContext, _root: *const HeapObject) {
    BARRIER_HIT_COUNT.fetch_add(1, Ordering::SeqCst);
}

/// Scenario: binding an object field into an old-gen root with a young,
/// non-null value fires the write barrier and stores the value regardless.
#[test]
fn binding_an_object_field_fires_the_write_barrier_when_the_root_is_old_and_the_value_is_young() {
    BARRIER_HIT_COUNT.store(0, Ordering::SeqCst);
    let block = bind_o_block();
    let runtime = Runtime {
        write_barrier_hit: barrier_hit_probe as usize,
        ..mock_runtime()
    };
    let compiled = compile_block(Abi::SysV, runtime, &block).expect("compile");
    let exec = ExecutableBuffer::new(&compiled.code).expect("mmap");

    let root_buf = make_object_buf(true);
    let ref_buf = make_object_buf(false);
    let body_start = ObjectLayout::host().body_start as usize;

    let (mut work, mut frame, mut tc, _instance) = make_frame(2);
    work[0] = root_buf.as_ptr() as i64;
    work[1] = ref_buf.as_ptr() as i64;
    frame.work = work.as_mut_ptr();
    tc.cur_frame = frame.as_mut() as *mut Frame;

    let entry_ptr = unsafe { exec.as_ptr().add(compiled.entry) };
    let f: EntryFn = unsafe { std::mem::transmute(exec.as_ptr()) };
    let _rv = f(tc.as_mut() as *mut ThreadContext, std::ptr::null(), entry_ptr);

    assert_eq!(BARRIER_HIT_COUNT.load(Ordering::SeqCst), 1);
    let stored = unsafe { *(root_buf.as_ptr().add(body_start) as *const i64) };
    assert_eq!(stored, ref_buf.as_ptr() as i64);
}

proptest::proptest! {
    /// The write barrier must fire exactly when the oracle predicate holds,
    /// for every combination of root generation, reference nullness, and
    /// reference generation (spec.md §4.D), not just the one case exercised
    /// above.
    #[test]
    fn write_barrier_fires_exactly_when_the_oracle_predicate_holds(
        root_old in proptest::prelude::any::<bool>(),
        ref_nonnull in proptest::prelude::any::<bool>(),
        ref_young in proptest::prelude::any::<bool>(),
    ) {
        BARRIER_HIT_COUNT.store(0, Ordering::SeqCst);
        let block = bind_o_block();
        let runtime = Runtime {
            write_barrier_hit: barrier_hit_probe as usize,
            ..mock_runtime()
        };
        let compiled = compile_block(Abi::SysV, runtime, &block).expect("compile");
        let exec = ExecutableBuffer::new(&compiled.code).expect("mmap");

        let root_buf = make_object_buf(root_old);
        let ref_buf = make_object_buf(!ref_young);
        let ref_ptr = if ref_nonnull { ref_buf.as_ptr() as i64 } else { 0 };

        let (mut work, mut frame, mut tc, _instance) = make_frame(2);
        work[0] = root_buf.as_ptr() as i64;
        work[1] = ref_ptr;
        frame.work = work.as_mut_ptr();
        tc.cur_frame = frame.as_mut() as *mut Frame;

        let entry_ptr = unsafe { exec.as_ptr().add(compiled.entry) };
        let f: EntryFn = unsafe { std::mem::transmute(exec.as_ptr()) };
        let _rv = f(tc.as_mut() as *mut ThreadContext, std::ptr::null(), entry_ptr);

        let fired = BARRIER_HIT_COUNT.load(Ordering::SeqCst) == 1;
        proptest::prop_assert_eq!(fired, barrier_should_fire(root_old, ref_nonnull, ref_young));
    }
}

static ARGS_PREPARE_CALLS: AtomicU32 = AtomicU32::new(0);
static FRAME_INVOKE_CALLS: AtomicU32 = AtomicU32::new(0);

extern "C" fn args_prepare_probe(_tc: *mut ThreadContext, _cu: *const u8, _callsite_idx: i64) -> i64 {
    ARGS_PREPARE_CALLS.fetch_add(1, Ordering::SeqCst);
    0xab
}

extern "C" fn frame_invoke_code_probe(_tc: *mut ThreadContext, _code: i64, _callsite: i64, _spesh: i64) -> i64 {
    FRAME_INVOKE_CALLS.fetch_add(1, Ordering::SeqCst);
    0
}

/// Scenario: the invoke fast path calls `args_prepare` then
/// `frame_invoke_code` exactly once each, wires the reentry label through
/// `frame.jit_entry_label`, and leaves `RV == 1` ("continue in
/// interpreter") on return (spec.md §4.G steps 1, 8, 9).
#[test]
fn invoke_fast_path_calls_frame_invoke_code_and_returns_continue_in_interpreter() {
    ARGS_PREPARE_CALLS.store(0, Ordering::SeqCst);
    FRAME_INVOKE_CALLS.store(0, Ordering::SeqCst);

    let mut block = Block::new();
    block.push(Node::Invoke(InvokeSpec {
        callsite_idx: 3,
        args: smallvec![],
        code_reg: 0,
        return_type: ReturnType::Void,
        return_reg: None,
        reentry: LabelId::Out,
        is_fast: true,
        spesh_cand: None,
    }));

    let runtime = Runtime {
        args_prepare: args_prepare_probe as usize,
        frame_invoke_code: frame_invoke_code_probe as usize,
        ..mock_runtime()
    };
    let compiled = compile_block(Abi::SysV, runtime, &block).expect("compile");
    let exec = ExecutableBuffer::new(&compiled.code).expect("mmap");

    let (mut work, mut frame, mut tc, _instance) = make_frame(1);
    work[0] = 0x4242;
    frame.work = work.as_mut_ptr();
    let cur_op_slot: *const u8 = std::ptr::null();
    tc.interp_cur_op = &cur_op_slot as *const *const u8;
    tc.cur_frame = frame.as_mut() as *mut Frame;

    let entry_ptr = unsafe { exec.as_ptr().add(compiled.entry) };
    let f: EntryFn = unsafe { std::mem::transmute(exec.as_ptr()) };
    let rv = f(tc.as_mut() as *mut ThreadContext, std::ptr::null(), entry_ptr);

    assert_eq!(rv, 1, "continue-in-interpreter sentinel");
    assert_eq!(ARGS_PREPARE_CALLS.load(Ordering::SeqCst), 1);
    assert_eq!(FRAME_INVOKE_CALLS.load(Ordering::SeqCst), 1);
}
