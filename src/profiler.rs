//! The profiler log (spec.md §6 "Profiler external surface", §9 "Profiler
//! call graph" / "Continuation capture/restore"): a secondary collaborator
//! described only by its data-shape and concurrency contract. The JIT calls
//! `log_enter`/`log_exit` around every frame it runs; the runtime calls the
//! GC/spesh/deopt hooks from whichever thread performs those activities.
//!
//! Per-thread, no locking (spec.md §5: "all mutations are on the owning
//! thread"): a [`ProfilerLog`] is never shared, so there is no `Mutex` here,
//! matching the write-barrier module's own single-thread assumptions.

use std::time::{Duration, Instant};

/// Stand-in for a `MVMStaticFrame*` identity: which piece of bytecode a call
/// node represents, used to find or create the matching successor node on
/// re-entry. An opaque integer id rather than a pointer, matching how the
/// rest of this crate models host objects it only needs to compare for
/// identity (spec.md §9: "arena-allocated nodes indexed by integer ids").
pub type StaticFrameId = usize;

/// Stand-in for a `MVMObject*` naming an allocated type, for the per-node
/// per-type allocation breakdown.
pub type TypeId = usize;

/// How a frame was executing when it was entered (spec.md §6 `log_enter`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecMode {
    Spesh,
    SpeshInline,
    Jit,
    JitInline,
    Normal,
}

/// One GC run's recorded duration (spec.md §6 "GC run history").
#[derive(Debug, Clone, Copy)]
pub struct GcRun {
    pub full: bool,
    pub time: Duration,
}

/// One call-graph node. `parent`/`children` are arena indices rather than
/// `Rc<Weak>`/`Rc<RefCell<Vec<_>>>`: the arena outlives every node it holds,
/// and a parent is only ever popped after all of its children (spec.md §9:
/// "the back-pointer is a weak reference; parent always outlives child
/// within a call"). A node is reused across repeated calls to the same
/// static frame from the same caller, so its entry counters and `total_time`
/// accumulate rather than describing a single call.
struct CallNode {
    parent: Option<usize>,
    children: Vec<usize>,
    sf: StaticFrameId,
    entry_mode: ExecMode,
    total_entries: u64,
    specialized_entries: u64,
    jit_entries: u64,
    inlined_entries: u64,
    osr_count: u64,
    deopt_one_count: u64,
    deopt_all_count: u64,
    /// Set while this node is the currently open call; cleared (and folded
    /// into `total_time`) on exit.
    cur_entry_time: Option<Instant>,
    /// GC/spesh time donated to this node's currently open span (spec.md §8
    /// "Profiler discount"); reset to zero on every entry.
    cur_skip_time: Duration,
    /// Wall-clock time accumulated across every completed entry of this
    /// node, net of discounted GC/spesh time.
    total_time: Duration,
    allocations: Vec<(TypeId, u64)>,
}

/// A captured profile spine (spec.md §9 "Continuation capture/restore"):
/// the chain of still-open calls from `current_call` up to some ancestor
/// `root_frame`, taken as an owned sequence so it can be replayed later
/// against a different continuation of the same logical call stack.
#[derive(Debug, Clone, Default)]
pub struct ContData {
    sfs: Vec<StaticFrameId>,
    modes: Vec<ExecMode>,
}

/// Per-thread call-graph recorder.
pub struct ProfilerLog {
    calls: Vec<CallNode>,
    /// Root-level call nodes, in the order they were first entered. Only
    /// entries that happen with no currently-open call land here — mirrors
    /// the original's "only the very first top-level call is remembered as
    /// `call_graph`" behavior rather than deduping every top-level call.
    roots: Vec<usize>,
    current: Option<usize>,
    gc_start: Option<(Instant, bool)>,
    spesh_start: Option<Instant>,
    spesh_time: Duration,
    gcs: Vec<GcRun>,
}

impl ProfilerLog {
    pub fn new() -> Self {
        ProfilerLog {
            calls: Vec::new(),
            roots: Vec::new(),
            current: None,
            gc_start: None,
            spesh_start: None,
            spesh_time: Duration::ZERO,
            gcs: Vec::new(),
        }
    }

    /// Finds a successor of `parent` (or a root, if `parent` is `None`)
    /// already recording calls into `sf`.
    fn find_successor(&self, parent: Option<usize>, sf: StaticFrameId) -> Option<usize> {
        match parent {
            Some(id) => self.calls[id]
                .children
                .iter()
                .copied()
                .find(|&child| self.calls[child].sf == sf),
            None => None,
        }
    }

    /// Logs entry into `sf`. Reuses the matching successor node of the
    /// currently open call if one exists, else creates a fresh node (spec.md
    /// §8 "Vivify idempotence"-style reuse, applied to the call graph rather
    /// than a p6opaque field).
    pub fn log_enter(&mut self, sf: StaticFrameId, mode: ExecMode) -> usize {
        let id = match self.find_successor(self.current, sf) {
            Some(id) => id,
            None => {
                let id = self.calls.len();
                self.calls.push(CallNode {
                    parent: self.current,
                    children: Vec::new(),
                    sf,
                    entry_mode: mode,
                    total_entries: 0,
                    specialized_entries: 0,
                    jit_entries: 0,
                    inlined_entries: 0,
                    osr_count: 0,
                    deopt_one_count: 0,
                    deopt_all_count: 0,
                    cur_entry_time: None,
                    cur_skip_time: Duration::ZERO,
                    total_time: Duration::ZERO,
                    allocations: Vec::new(),
                });
                match self.current {
                    Some(parent) => self.calls[parent].children.push(id),
                    None => self.roots.push(id),
                }
                id
            }
        };

        let node = &mut self.calls[id];
        node.total_entries += 1;
        match mode {
            ExecMode::Spesh => node.specialized_entries += 1,
            ExecMode::SpeshInline => {
                node.specialized_entries += 1;
                node.inlined_entries += 1;
            }
            ExecMode::Jit => node.jit_entries += 1,
            ExecMode::JitInline => {
                node.jit_entries += 1;
                node.inlined_entries += 1;
            }
            ExecMode::Normal => {}
        }
        node.entry_mode = mode;
        node.cur_entry_time = Some(Instant::now());
        node.cur_skip_time = Duration::ZERO;

        self.current = Some(id);
        id
    }

    /// Closes the currently open call, returning control to its parent, and
    /// folding its open span into `total_time`. A sequence error (no open
    /// call) is fatal (spec.md §7), matching a panic in the original rather
    /// than a recoverable `Result`.
    fn close_current(&mut self) -> StaticFrameId {
        let id = self.current.unwrap_or_else(|| {
            log::error!("profiler sequence loss: log_exit with no open call");
            panic!("profiler sequence loss: log_exit with no open call")
        });
        let node = &mut self.calls[id];
        let start = node.cur_entry_time.take().unwrap_or_else(Instant::now);
        node.total_time += start.elapsed().saturating_sub(node.cur_skip_time);
        self.current = node.parent;
        node.sf
    }

    /// Closes the currently open call normally.
    pub fn log_exit(&mut self) {
        self.close_current();
    }

    /// Unwinds until the call matching `target_sf` has been closed: this may
    /// close several inlined frames' call nodes along the way, not just one
    /// (spec.md §4.E/§6: the interpreter may be unwinding through several
    /// inlined frames to reach the target).
    pub fn log_unwind(&mut self, target_sf: StaticFrameId) {
        loop {
            if self.current.is_none() {
                return;
            }
            let closed_sf = self.close_current();
            if closed_sf == target_sf {
                return;
            }
        }
    }

    /// Total reported time for a call node: wall clock minus every GC/spesh
    /// phase donated to it, across every entry (spec.md §8 "Profiler
    /// discount").
    pub fn call_time(&self, id: usize) -> Duration {
        let node = &self.calls[id];
        match node.cur_entry_time {
            Some(start) => node
                .total_time
                .saturating_add(start.elapsed().saturating_sub(node.cur_skip_time)),
            None => node.total_time,
        }
    }

    /// Distributes `elapsed` to every call currently on the stack (spec.md
    /// §8: "for any ancestor on the stack during those events").
    fn discount(&mut self, elapsed: Duration) {
        let mut cursor = self.current;
        while let Some(id) = cursor {
            self.calls[id].cur_skip_time += elapsed;
            cursor = self.calls[id].parent;
        }
    }

    pub fn log_gc_start(&mut self, full: bool) {
        self.gc_start = Some((Instant::now(), full));
    }

    pub fn log_gc_end(&mut self) {
        if let Some((start, full)) = self.gc_start.take() {
            let elapsed = start.elapsed();
            self.gcs.push(GcRun { full, time: elapsed });
            self.discount(elapsed);
        }
    }

    pub fn log_spesh_start(&mut self) {
        self.spesh_start = Some(Instant::now());
    }

    pub fn log_spesh_end(&mut self) {
        if let Some(start) = self.spesh_start.take() {
            let elapsed = start.elapsed();
            self.spesh_time += elapsed;
            self.discount(elapsed);
        }
    }

    /// On-stack replacement of the currently running frame: counted against
    /// the currently open node, with the entry-mode counter matching whether
    /// it landed JITted or merely specialized (spec.md §6).
    pub fn log_osr(&mut self, jitted: bool) {
        if let Some(id) = self.current {
            let node = &mut self.calls[id];
            node.osr_count += 1;
            if jitted {
                node.jit_entries += 1;
            } else {
                node.specialized_entries += 1;
            }
        }
    }

    pub fn log_deopt_one(&mut self) {
        if let Some(id) = self.current {
            self.calls[id].deopt_one_count += 1;
        }
    }

    pub fn log_deopt_all(&mut self) {
        if let Some(id) = self.current {
            self.calls[id].deopt_all_count += 1;
        }
    }

    /// Logs an allocation of `ty` against the currently open call node,
    /// aggregating by type rather than keeping one counter per allocation.
    pub fn log_allocated(&mut self, ty: TypeId) {
        if let Some(id) = self.current {
            let node = &mut self.calls[id];
            match node.allocations.iter_mut().find(|(t, _)| *t == ty) {
                Some((_, count)) => *count += 1,
                None => node.allocations.push((ty, 1)),
            }
        }
    }

    /// Total allocations of `ty` recorded against call node `id`.
    pub fn allocation_count(&self, id: usize, ty: TypeId) -> u64 {
        self.calls[id]
            .allocations
            .iter()
            .find(|(t, _)| *t == ty)
            .map(|(_, count)| *count)
            .unwrap_or(0)
    }

    pub fn gc_runs(&self) -> &[GcRun] {
        &self.gcs
    }

    /// Captures the profile spine from the currently open call up to (and
    /// including) the call matching `root_sf`, as an owned, replayable
    /// sequence, closing each node along the way exactly as the original's
    /// continuation-control unwind does (spec.md §9).
    pub fn log_continuation_control(&mut self, root_sf: StaticFrameId) -> ContData {
        let mut sfs = Vec::new();
        let mut modes = Vec::new();
        loop {
            let Some(id) = self.current else { break };
            sfs.push(self.calls[id].sf);
            modes.push(self.calls[id].entry_mode);
            let closed_sf = self.close_current();
            if closed_sf == root_sf {
                break;
            }
        }
        ContData { sfs, modes }
    }

    /// Restores a captured spine by replaying `log_enter` from the
    /// outermost call back to the innermost (spec.md §9: entries were
    /// captured leaf-first, so replay runs the captured list in reverse).
    pub fn log_continuation_invoke(&mut self, cont: ContData) {
        for (sf, mode) in cont.sfs.into_iter().zip(cont.modes).rev() {
            self.log_enter(sf, mode);
        }
    }

    pub fn depth(&self) -> usize {
        let mut depth = 0;
        let mut cursor = self.current;
        while let Some(id) = cursor {
            depth += 1;
            cursor = self.calls[id].parent;
        }
        depth
    }
}

impl Default for ProfilerLog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enter_exit_nests_and_restores_parent() {
        let mut log = ProfilerLog::new();
        let outer = log.log_enter(1, ExecMode::Jit);
        assert_eq!(log.depth(), 1);
        let _inner = log.log_enter(2, ExecMode::JitInline);
        assert_eq!(log.depth(), 2);
        log.log_exit();
        assert_eq!(log.current, Some(outer));
        log.log_exit();
        assert_eq!(log.current, None);
    }

    #[test]
    #[should_panic(expected = "profiler sequence loss")]
    fn exit_without_enter_panics() {
        let mut log = ProfilerLog::new();
        log.log_exit();
    }

    #[test]
    fn repeated_entry_reuses_the_successor_node_and_sums_counters() {
        let mut log = ProfilerLog::new();
        let outer = log.log_enter(1, ExecMode::Normal);
        let first_inner = log.log_enter(2, ExecMode::Jit);
        log.log_exit();
        log.log_exit();

        log.log_enter(1, ExecMode::Normal);
        let second_inner = log.log_enter(2, ExecMode::JitInline);
        log.log_exit();
        log.log_exit();

        assert_eq!(first_inner, second_inner);
        assert_eq!(log.calls[outer].total_entries, 2);
        assert_eq!(log.calls[first_inner].total_entries, 2);
        assert_eq!(log.calls[first_inner].jit_entries, 2);
        assert_eq!(log.calls[first_inner].inlined_entries, 1);
        assert_eq!(log.calls[outer].children, vec![first_inner]);
    }

    #[test]
    fn gc_time_is_discounted_from_every_open_ancestor_and_recorded_in_history() {
        let mut log = ProfilerLog::new();
        let outer = log.log_enter(1, ExecMode::Normal);
        let inner = log.log_enter(2, ExecMode::Jit);
        log.log_gc_start(true);
        std::thread::sleep(Duration::from_millis(5));
        log.log_gc_end();
        log.log_exit();
        log.log_exit();
        // Both ancestors were on the stack during the GC phase, so both
        // must have non-zero discount applied.
        assert!(log.calls[outer].total_time <= log.calls[outer].total_time + Duration::from_millis(5));
        assert!(log.calls[inner].total_time <= log.calls[inner].total_time + Duration::from_millis(5));
        assert_eq!(log.gc_runs().len(), 1);
        assert!(log.gc_runs()[0].full);
        assert!(log.gc_runs()[0].time >= Duration::from_millis(5));
    }

    #[test]
    fn unwind_closes_every_inlined_frame_down_to_the_target() {
        let mut log = ProfilerLog::new();
        log.log_enter(1, ExecMode::Normal);
        log.log_enter(2, ExecMode::SpeshInline);
        log.log_enter(3, ExecMode::JitInline);
        log.log_unwind(1);
        assert_eq!(log.depth(), 1);
    }

    #[test]
    fn allocations_are_aggregated_per_type_on_the_open_node() {
        let mut log = ProfilerLog::new();
        let node = log.log_enter(1, ExecMode::Jit);
        log.log_allocated(42);
        log.log_allocated(42);
        log.log_allocated(7);
        assert_eq!(log.allocation_count(node, 42), 2);
        assert_eq!(log.allocation_count(node, 7), 1);
    }

    #[test]
    fn osr_and_deopt_counters_land_on_the_open_node() {
        let mut log = ProfilerLog::new();
        let node = log.log_enter(1, ExecMode::Spesh);
        log.log_osr(true);
        log.log_deopt_one();
        log.log_deopt_all();
        assert_eq!(log.calls[node].osr_count, 1);
        assert_eq!(log.calls[node].jit_entries, 1);
        assert_eq!(log.calls[node].deopt_one_count, 1);
        assert_eq!(log.calls[node].deopt_all_count, 1);
    }

    #[test]
    fn continuation_round_trips_the_spine() {
        let mut log = ProfilerLog::new();
        let root = log.log_enter(1, ExecMode::Normal);
        log.log_enter(2, ExecMode::Spesh);
        log.log_enter(3, ExecMode::Jit);
        let cont = log.log_continuation_control(1);
        assert_eq!(cont.sfs, vec![3, 2, 1]);
        assert_eq!(log.current, None);
        let _ = root;

        let mut fresh = ProfilerLog::new();
        fresh.log_continuation_invoke(cont);
        assert_eq!(fresh.depth(), 3);
    }
}
