//! Host-side layout of the runtime structures emitted code reaches into.
//!
//! These are not part of this crate's public contract in the original
//! design (the frame/thread-context layout belongs to the interpreter), but
//! a JIT backend has to agree on exact field offsets with whatever runtime
//! it's linked into. Mirrors the `VM_CTX`/register-file pattern in the
//! `myuon-moca` toy JIT (see DESIGN.md): plain `#[repr(C)]` structs, offsets
//! asserted by a `#[cfg(test)]` layout check rather than trusted blindly.

use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};

/// One VM register slot. `WORK`/`ARGS`/`env` are all arrays of these.
pub type Slot = i64;

/// The interpreter's global, per-runtime-instance state. Only the one field
/// emitted code reads (`VMNull`) is represented.
#[repr(C)]
pub struct Instance {
    pub vm_null: Slot,
}

/// A compilation unit: bytecode, string table, coderefs (spec.md §3, §6).
#[repr(C)]
pub struct CompUnit {
    pub strings: *const Slot,
    pub coderefs: *const Slot,
}

/// The fields of an activation frame that emitted code reads or writes
/// (spec.md §6 "Frame contract consumed"). Field order matches the access
/// pattern in the prologue/epilogue and invoke emitters; it is not meant to
/// match any particular interpreter's real layout.
#[repr(C)]
pub struct Frame {
    /// Register file base (`WORK`).
    pub work: *mut Slot,
    /// Argument-parameter base (`ARGS`), as seen by `sp_getarg_*`.
    pub params_args: *mut Slot,
    /// The staged argument buffer used by the invoke emitter.
    pub args: *mut Slot,
    pub outer: *mut Frame,
    pub env: *mut Slot,
    pub effective_spesh_slots: *const Slot,
    /// Must stay 32 bits wide (spec.md §6); checked at startup by
    /// [`crate::emit::invoke::check_return_type_width`].
    pub return_type: i32,
    pub return_value: *mut Slot,
    pub return_address: *const u8,
    pub jit_entry_label: *const u8,
}

/// Thread-local interpreter state (spec.md §6 "ThreadContext fields").
#[repr(C)]
pub struct ThreadContext {
    pub cur_frame: *mut Frame,
    pub cur_dispatcher: *mut Slot,
    pub instance: *const Instance,
    pub interp_cur_op: *const *const u8,
    pub thread_id: u32,
    /// Owned by this thread alone (spec.md §5); the JIT never reaches into
    /// it directly, only through the hooks on [`crate::profiler::ProfilerLog`].
    pub prof_data: *mut crate::profiler::ProfilerLog,
    pub gc_promoted_bytes: u64,
}

/// The generation bit tested by the write-barrier and type-object checks
/// (spec.md §4.D). Bit layout is a convention shared with the allocator
/// stand-in below; emitted code never interprets the rest of the word.
pub const SECOND_GEN_BIT: u16 = 0x1;
pub const TYPE_OBJECT_BIT: u16 = 0x2;

/// Minimal object header every heap value carries, matching what
/// `sp_fastcreate` writes and what the write-barrier/type-object checks
/// read (spec.md §4.D, §4.E).
#[repr(C)]
pub struct ObjectHeader {
    pub flags: AtomicU32,
    pub size: u32,
    pub owner: u32,
}

/// `sp_gethow`/`sp_getwhat` read `how`/`what` directly off the front of this
/// struct (spec.md §4.E); `invoke` follows them rather than aliasing either.
#[repr(C)]
pub struct Stable {
    pub how: *const HeapObject,
    pub what: *const HeapObject,
    pub invoke: Option<extern "C" fn(*mut ThreadContext, *mut Slot, u16, *mut Slot) -> i64>,
}

/// A heap object: header, STable pointer, inline body. Body fields are
/// accessed by raw byte offset from `body_start`, matching `p6opaque`'s
/// "uniform concrete representation" (spec.md GLOSSARY).
#[repr(C)]
pub struct HeapObject {
    pub header: ObjectHeader,
    pub st: *const Stable,
    pub body_replaced: *mut u8,
    pub body_start: [u8; 0],
}

impl HeapObject {
    pub fn is_second_gen(&self) -> bool {
        self.header.flags.load(Ordering::Relaxed) as u16 & SECOND_GEN_BIT != 0
    }

    pub fn is_type_object(&self) -> bool {
        self.header.flags.load(Ordering::Relaxed) as u16 & TYPE_OBJECT_BIT != 0
    }
}

/// A fatally simple bump allocator standing in for `MVM_gc_allocate_zeroed`,
/// used by tests that exercise `sp_fastcreate` end-to-end.
pub struct Nursery {
    next: AtomicI64,
}

impl Nursery {
    pub fn new() -> Self {
        Nursery {
            next: AtomicI64::new(0),
        }
    }
}

impl Default for Nursery {
    fn default() -> Self {
        Self::new()
    }
}
