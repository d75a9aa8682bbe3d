//! The code buffer: label management, relocation fixups, and the
//! executable-memory backend that turns a finished buffer into callable
//! code.
//!
//! Mirrors `cranelift-codegen`'s `binemit`/`memorysink` split: a `Vec<u8>`
//! grows as instructions are appended, labels are allocated up front and
//! bound once their target address is known, and unresolved references are
//! patched in a single `link()` pass at the end. Unlike cranelift's
//! `CodeSink` trait (pluggable for JIT vs. object-file output), this backend
//! only ever needs one sink: an mmap'd region switched from RW to RX
//! (spec.md §4.K) — so `Assembler` drives allocation directly rather than
//! going through a trait object.

use std::mem;

use crate::error::JitError;

/// A label identifier, either one of the two pre-allocated global exits or a
/// dynamically allocated block-local label (spec.md §4.A: "two named labels,
/// `exit` and `out`, plus a dynamically growable array of block-local
/// labels").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LabelId {
    Exit,
    Out,
    Local(u32),
}

#[derive(Debug, Clone, Copy)]
enum Target {
    Unbound,
    Bound(usize),
}

struct PendingFixup {
    label: LabelId,
    /// Offset of the 4-byte rel32 field within the buffer.
    patch_at: usize,
}

/// Accumulates machine code, tracks label bindings, and resolves
/// cross-references on [`Assembler::link`].
pub struct Assembler {
    code: Vec<u8>,
    exit: Target,
    out: Target,
    locals: Vec<Target>,
    fixups: Vec<PendingFixup>,
}

impl Assembler {
    pub fn new() -> Self {
        Assembler {
            code: Vec::with_capacity(4096),
            exit: Target::Unbound,
            out: Target::Unbound,
            locals: Vec::new(),
            fixups: Vec::new(),
        }
    }

    /// Allocates a new block-local label, unbound until [`Self::bind`].
    pub fn label_alloc(&mut self) -> LabelId {
        let id = LabelId::Local(self.locals.len() as u32);
        self.locals.push(Target::Unbound);
        id
    }

    /// Binds `label` to the current write position ("label here").
    pub fn bind(&mut self, label: LabelId) {
        let here = self.code.len();
        *self.target_mut(label) = Target::Bound(here);
    }

    fn target_mut(&mut self, label: LabelId) -> &mut Target {
        match label {
            LabelId::Exit => &mut self.exit,
            LabelId::Out => &mut self.out,
            LabelId::Local(i) => &mut self.locals[i as usize],
        }
    }

    fn target(&self, label: LabelId) -> Target {
        match label {
            LabelId::Exit => self.exit,
            LabelId::Out => self.out,
            LabelId::Local(i) => self.locals[i as usize],
        }
    }

    /// Appends raw bytes (the instruction encoders in [`crate::asm`] build
    /// these one instruction at a time).
    pub fn emit(&mut self, bytes: &[u8]) {
        self.code.extend_from_slice(bytes);
    }

    pub fn position(&self) -> usize {
        self.code.len()
    }

    /// Records that the rel32 field at the tail of `self.code` (the last 4
    /// bytes just emitted by a `jmp`/`jcc` placeholder) must be patched to
    /// point at `label` once it is bound.
    pub fn record_fixup(&mut self, label: LabelId) {
        let patch_at = self.code.len() - 4;
        self.fixups.push(PendingFixup { label, patch_at });
    }

    /// Resolves every recorded fixup against its label's bound offset, then
    /// returns the finished code alongside every label's resolved offset
    /// (spec.md §6 "Executable buffer format": "delivered as a linked,
    /// relocatable-no-more, page-executable region with an entry offset and
    /// a dense array of resolved label addresses"). Returns
    /// [`JitError::UnresolvedLabel`] if any referenced label was never
    /// bound — this can only happen for a malformed block, since
    /// `exit`/`out` are always bound by the prologue/epilogue emitter.
    pub fn link(mut self) -> Result<(Vec<u8>, rustc_hash::FxHashMap<LabelId, usize>), JitError> {
        for fixup in &self.fixups {
            let target_offset = match self.target(fixup.label) {
                Target::Bound(off) => off,
                Target::Unbound => return Err(JitError::UnresolvedLabel(fixup.label)),
            };
            crate::asm::patch_rel32(&mut self.code, fixup.patch_at, target_offset);
        }
        let mut labels = rustc_hash::FxHashMap::default();
        if let Target::Bound(off) = self.exit {
            labels.insert(LabelId::Exit, off);
        }
        if let Target::Bound(off) = self.out {
            labels.insert(LabelId::Out, off);
        }
        for (i, target) in self.locals.iter().enumerate() {
            if let Target::Bound(off) = target {
                labels.insert(LabelId::Local(i as u32), *off);
            }
        }
        Ok((mem::take(&mut self.code), labels))
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    /// Direct mutable access to the underlying buffer, so instruction
    /// encoders in [`crate::asm`] (which take a plain `&mut Vec<u8>`) can
    /// append to it without copying through `emit`.
    pub fn code_mut(&mut self) -> &mut Vec<u8> {
        &mut self.code
    }
}

impl Default for Assembler {
    fn default() -> Self {
        Self::new()
    }
}

// --- Executable memory backend (spec.md §4.K) --------------------------

/// An mmap'd region holding finished, page-protected code. Dropping it
/// releases the mapping.
pub struct ExecutableBuffer {
    #[cfg(not(windows))]
    map: region::Allocation,
    #[cfg(windows)]
    ptr: *mut std::ffi::c_void,
    #[cfg(windows)]
    len: usize,
}

// SAFETY: the mapping holds immutable machine code once `finalize` has run;
// no interior mutability is exposed, so sharing the pointer across threads
// is sound as long as callers don't race a `call` against a `Drop`.
unsafe impl Send for ExecutableBuffer {}
unsafe impl Sync for ExecutableBuffer {}

impl ExecutableBuffer {
    /// Copies `code` into a fresh page-aligned mapping, then flips
    /// protection from read-write to read-execute. Two-step because most
    /// platforms forbid a single RWX mapping (spec.md §4.K: "never
    /// simultaneously writable and executable").
    pub fn new(code: &[u8]) -> std::io::Result<Self> {
        #[cfg(not(windows))]
        {
            let mut map = region::alloc(code.len().max(1), region::Protection::READ_WRITE)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
            // SAFETY: `map` was just allocated with READ_WRITE protection
            // and is exclusively owned here.
            unsafe {
                let dst = map.as_mut_ptr::<u8>();
                std::ptr::copy_nonoverlapping(code.as_ptr(), dst, code.len());
                region::protect(dst, map.len(), region::Protection::READ_EXECUTE)
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
            }
            Ok(ExecutableBuffer { map })
        }
        #[cfg(windows)]
        {
            use windows_sys::Win32::System::Memory::{
                VirtualAlloc, VirtualProtect, MEM_COMMIT, MEM_RESERVE, PAGE_EXECUTE_READ,
                PAGE_READWRITE,
            };
            let len = code.len().max(1);
            // SAFETY: standard VirtualAlloc usage; null base lets the OS
            // pick an address, RW protection matches the write we do next.
            let ptr = unsafe {
                VirtualAlloc(
                    std::ptr::null(),
                    len,
                    MEM_COMMIT | MEM_RESERVE,
                    PAGE_READWRITE,
                )
            };
            if ptr.is_null() {
                return Err(std::io::Error::last_os_error());
            }
            // SAFETY: `ptr` is a fresh RW mapping of `len` bytes.
            unsafe {
                std::ptr::copy_nonoverlapping(code.as_ptr(), ptr as *mut u8, code.len());
                let mut old_protect = 0u32;
                if VirtualProtect(ptr, len, PAGE_EXECUTE_READ, &mut old_protect) == 0 {
                    return Err(std::io::Error::last_os_error());
                }
            }
            Ok(ExecutableBuffer { ptr, len })
        }
    }

    /// Raw pointer to the first byte of the mapped code.
    pub fn as_ptr(&self) -> *const u8 {
        #[cfg(not(windows))]
        {
            self.map.as_ptr::<u8>()
        }
        #[cfg(windows)]
        {
            self.ptr as *const u8
        }
    }

    pub fn len(&self) -> usize {
        #[cfg(not(windows))]
        {
            self.map.len()
        }
        #[cfg(windows)]
        {
            self.len
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(windows)]
impl Drop for ExecutableBuffer {
    fn drop(&mut self) {
        use windows_sys::Win32::System::Memory::{VirtualFree, MEM_RELEASE};
        // SAFETY: `self.ptr` was allocated by `VirtualAlloc` in `new` and is
        // freed exactly once here.
        unsafe {
            VirtualFree(self.ptr, 0, MEM_RELEASE);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm;
    use crate::regs::Reg;

    #[test]
    fn forward_branch_resolves_to_bound_label() {
        let mut asm_buf = Assembler::new();
        let target = asm_buf.label_alloc();
        asm::jmp_rel32_placeholder(asm_buf.code_mut());
        asm_buf.record_fixup(target);
        asm::mov_ri64(asm_buf.code_mut(), Reg::Rax, 0);
        asm_buf.bind(target);
        let (code, labels) = asm_buf.link().unwrap();
        let rel = i32::from_le_bytes(code[1..5].try_into().unwrap());
        assert_eq!(rel, code.len() as i32 - 5);
        assert_eq!(labels[&target], code.len());
    }

    #[test]
    fn unbound_label_is_reported_as_unresolved() {
        let mut asm_buf = Assembler::new();
        let target = asm_buf.label_alloc();
        asm::jmp_rel32_placeholder(asm_buf.code_mut());
        asm_buf.record_fixup(target);
        assert_eq!(asm_buf.link().unwrap_err(), JitError::UnresolvedLabel(target));
    }

    #[test]
    fn executable_buffer_runs_a_trivial_return_42() {
        let mut buf = Vec::new();
        asm::mov_ri64(&mut buf, Reg::Rax, 42);
        asm::ret(&mut buf);
        let exec = ExecutableBuffer::new(&buf).unwrap();
        let f: extern "C" fn() -> i64 = unsafe { std::mem::transmute(exec.as_ptr()) };
        assert_eq!(f(), 42);
    }
}
