/*!
Save/restore engine: in-process checkpointing over the choice tree.

`setjmp` creates a node under the current one, snapshotting the machine
(via the simulator's own snapshot facility) and the agent set; `longjmp`
rolls everything back to an *ancestor* node so the next execution of that
point takes a different scheduling path. This is not stack unwinding; the
tree holds checkpoints and metadata only.

`current` only ever moves deeper during a branch; a longjmp resets it to an
ancestor, never a sibling. Violating that is a programming defect and
panics.
*/

use std::time::Instant;

use crate::machine::Cpu;
use crate::opts::GuestLayout;
use crate::sched::{AbortSet, Scheduler, ThreadId};
use crate::stack;
use crate::tree::{ChoiceTree, MemAccessSet, Nobe, NodeId};

#[derive(Clone, Debug)]
pub struct SaveStatistics {
    pub total_choices: u64,
    pub total_jumps: u64,
    pub total_triggers: u64,
    pub depth_total: u64,
    /// When we last arrived at a tree node. Only `setjmp` updates this;
    /// every longjmp immediately follows a setjmp on the last node of the
    /// previous branch, so it needs no timestamp of its own.
    last_save_time: Instant,
    pub total_usecs: u64,
}

impl SaveStatistics {
    fn new() -> Self {
        SaveStatistics {
            total_choices: 0,
            total_jumps: 0,
            total_triggers: 0,
            depth_total: 0,
            last_save_time: Instant::now(),
            total_usecs: 0,
        }
    }

    pub fn average_depth(&self) -> f64 {
        if self.total_choices == 0 {
            0.0
        } else {
            self.depth_total as f64 / self.total_choices as f64
        }
    }
}

/// Everything `setjmp` records about the decision being committed.
#[derive(Clone, Debug, Default)]
pub struct PendingChoice {
    pub next_tid: Option<ThreadId>,
    pub our_choice: bool,
    pub end_of_test: bool,
    pub is_preemption_point: bool,
    pub data_race_eip: Option<u32>,
    pub voluntary: bool,
    pub joined_tid: Option<ThreadId>,
    pub xbegin: bool,
    pub prune_aborts: bool,
    pub check_retry: bool,
}

pub struct SaveState<C: Cpu> {
    tree: ChoiceTree<C::Snapshot>,
    current: Option<NodeId>,
    /// Thread to schedule when the in-flight decision commits.
    pub next_tid: Option<ThreadId>,
    pub next_xabort: bool,
    pub next_xabort_code: u32,
    /// Accesses observed since the last node, waiting to be filed there.
    pending_accesses: MemAccessSet,
    pub stats: SaveStatistics,
}

impl<C: Cpu> SaveState<C> {
    pub fn new() -> Self {
        SaveState {
            tree: ChoiceTree::new(),
            current: None,
            next_tid: None,
            next_xabort: false,
            next_xabort_code: 0,
            pending_accesses: MemAccessSet::default(),
            stats: SaveStatistics::new(),
        }
    }

    #[inline]
    pub fn tree(&self) -> &ChoiceTree<C::Snapshot> {
        &self.tree
    }

    #[inline]
    pub fn tree_mut(&mut self) -> &mut ChoiceTree<C::Snapshot> {
        &mut self.tree
    }

    #[inline]
    pub fn root(&self) -> Option<NodeId> {
        self.tree.root()
    }

    #[inline]
    pub fn current(&self) -> Option<NodeId> {
        self.current
    }

    /// Record one shared-memory access for the in-flight tree segment.
    pub fn record_access(&mut self, addr: u32, write: bool, eip: u32) {
        self.pending_accesses.record(addr, write, eip);
    }

    /// Commit a decision node at the current machine state.
    pub fn setjmp(
        &mut self,
        cpu: &C,
        sched: &Scheduler,
        layout: &GuestLayout,
        choice: PendingChoice,
    ) -> NodeId {
        // Abort-set exclusivity: the committed tid must never be one the
        // node's own abort set defers.
        if let Some(tid) = choice.next_tid {
            assert!(
                !sched.upcoming_aborts.blocks(tid),
                "abort set of the new node blocks its own chosen tid {tid}"
            );
        }

        let nobe = Nobe {
            parent: self.current,
            children: Vec::new(),
            depth: 0, // assigned by the arena
            chosen_tid: choice.next_tid,
            our_choice: choice.our_choice,
            is_preemption_point: choice.is_preemption_point,
            end_of_test: choice.end_of_test,
            data_race_eip: choice.data_race_eip,
            voluntary: choice.voluntary,
            joined_tid: choice.joined_tid,
            xbegin: choice.xbegin,
            prune_aborts: choice.prune_aborts,
            check_retry: choice.check_retry,
            stack: stack::stack_trace(cpu, layout),
            accesses: self.pending_accesses.take(),
            abort_set: sched.upcoming_aborts.clone(),
            forced_xaborts: Vec::new(),
            sched: sched.clone(),
            snapshot: cpu.take_snapshot(),
        };
        let id = self.tree.insert(nobe);
        self.current = Some(id);
        self.next_tid = choice.next_tid;
        self.next_xabort = false;
        self.next_xabort_code = 0;

        self.stats.total_choices += 1;
        if choice.is_preemption_point {
            self.stats.total_triggers += 1;
        }
        self.stats.depth_total += u64::from(self.tree.get(id).depth);
        let now = Instant::now();
        self.stats.total_usecs += now
            .duration_since(self.stats.last_save_time)
            .as_micros() as u64;
        self.stats.last_save_time = now;
        id
    }

    /// Same bookkeeping as a setjmp with no preemption point, for the
    /// arbiter's keep-running-the-current-thread path.
    pub fn recover(&mut self, next_tid: Option<ThreadId>, xabort: bool, xabort_code: u32) {
        self.next_tid = next_tid;
        self.next_xabort = xabort;
        self.next_xabort_code = xabort_code;
    }

    /// Roll the machine and agent set back to `target` (the root when
    /// `None`), priming the revisit to schedule `tid` (and abort its
    /// transaction, when `txn`). `target` must be an ancestor of `current`.
    pub fn longjmp(
        &mut self,
        cpu: &mut C,
        sched: &mut Scheduler,
        target: Option<NodeId>,
        tid: ThreadId,
        txn: bool,
        xabort_code: u32,
        aborts: AbortSet,
    ) {
        let target = target
            .or_else(|| self.tree.root())
            .expect("longjmp before any setjmp");
        let current = self.current.expect("longjmp with no current node");
        assert!(
            self.tree.is_ancestor(target, current),
            "longjmp target is not an ancestor of the current node"
        );

        let nobe = self.tree.get(target);
        cpu.restore_snapshot(&nobe.snapshot);
        *sched = nobe.sched.clone();
        sched.upcoming_aborts = aborts;

        self.current = Some(target);
        self.next_tid = Some(tid);
        self.next_xabort = txn;
        self.next_xabort_code = xabort_code;
        self.pending_accesses = MemAccessSet::default();
        self.stats.total_jumps += 1;
    }

    /// Mark the current node so a replay forces `tid`'s transaction onto
    /// its abort path with `code`.
    pub fn abort_transaction(&mut self, tid: ThreadId, code: u32) {
        let current = self.current.expect("transaction abort before any setjmp");
        self.tree.get_mut(current).forced_xaborts.push((tid, code));
    }

    /// Discard the tree between experiments.
    pub fn reset_tree(&mut self) {
        self.tree.reset();
        self.current = None;
        self.next_tid = None;
        self.next_xabort = false;
        self.next_xabort_code = 0;
        self.pending_accesses = MemAccessSet::default();
    }
}

impl<C: Cpu> Default for SaveState<C> {
    fn default() -> Self {
        Self::new()
    }
}
