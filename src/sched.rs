/*!
Scheduler model: the checker's abstract view of guest threads.

Overview
========
Each guest thread is mirrored by an `Agent`. Agents live on one of two
queues: the runqueue (threads the guest kernel considers runnable) and the
descheduled queue. The arbiter consults the runqueue through the blocked
predicates below; the save/restore engine snapshots the whole `Scheduler` by
`Clone` into choice-tree nodes, which is also what resets per-branch
counters (the false-positive-deadlock budget among them) on backtrack.

Blocked predicates
==================
- `Agent::blocked`: blocked on a userspace address, or yield/xchg-looped to
  the blocking threshold.
- `Scheduler::htm_blocked`: the path committed to defer this thread's
  aborted-transaction retry.
- `AbortSet::blocks`: an ancestor decision suppresses this tid to explore a
  reduced transaction subtree first.
- `Scheduler::icb_blocked`: picking this thread now would be a preemption
  beyond the current iterative context bound.
*/

pub type ThreadId = u32;
pub type GuestAddr = u32;

/// Yield loops beyond this count mean the thread is treated as blocked.
pub const TOO_MANY_YIELDS: u32 = 10;

/// What the guest thread was last seen doing, as reported by the kernel
/// instrumentation hooks.
#[derive(Clone, Debug, Default)]
pub struct ActionFlags {
    pub handling_timer: bool,
    pub kern_mutex_locking: bool,
    pub kern_mutex_unlocking: bool,
    pub user_mutex_locking: bool,
    pub user_mutex_unlocking: bool,
    pub disk_io: bool,
    /// Currently inside a hardware transaction.
    pub user_txn: bool,
}

/// Yield-loop bookkeeping for one thread.
#[derive(Clone, Debug, Default)]
pub struct UserYield {
    pub loop_count: u32,
    pub blocked: bool,
    /// Spinning on an "xchg-continue" mutex; implies `blocked`.
    pub xchg_blocked: bool,
}

impl UserYield {
    #[inline]
    pub fn has_yielded(&self) -> bool {
        self.loop_count > 0 || self.blocked
    }
}

/// How an agent is (or isn't) prevented from running, in the order the
/// arbiter cares about.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Blockage {
    Free,
    OnAddr(GuestAddr),
    XchgMutex,
    YieldLoop,
}

#[derive(Clone, Debug)]
pub struct Agent {
    pub tid: ThreadId,
    pub user_blocked_on_addr: Option<GuestAddr>,
    pub user_yield: UserYield,
    pub action: ActionFlags,
    /// eip of the most recent call instruction, for data-race fingerprints.
    pub last_call: u32,
    pub most_recent_syscall: u32,
    /// Deferred retry of an aborted transaction on this path.
    pub htm_retry_deferred: bool,
    pub last_xbegin_eip: Option<u32>,
    /// Under preempt-everywhere: the last access looked like shared memory.
    pub preempt_for_shm_here: bool,
}

impl Agent {
    pub fn new(tid: ThreadId) -> Self {
        Agent {
            tid,
            user_blocked_on_addr: None,
            user_yield: UserYield::default(),
            action: ActionFlags::default(),
            last_call: 0,
            most_recent_syscall: 0,
            htm_retry_deferred: false,
            last_xbegin_eip: None,
            preempt_for_shm_here: false,
        }
    }

    #[inline]
    pub fn user_yield_blocked(&self) -> bool {
        self.user_yield.blocked
    }

    #[inline]
    pub fn blocked(&self) -> bool {
        self.user_blocked_on_addr.is_some() || self.user_yield.blocked
    }

    /// Single classification the arbiter can match exhaustively.
    pub fn blockage(&self) -> Blockage {
        if let Some(addr) = self.user_blocked_on_addr {
            Blockage::OnAddr(addr)
        } else if self.user_yield.xchg_blocked {
            Blockage::XchgMutex
        } else if self.user_yield.blocked {
            Blockage::YieldLoop
        } else {
            Blockage::Free
        }
    }

    /// Count one trip around a userspace yield loop; crossing the threshold
    /// blocks the thread.
    pub fn record_yield(&mut self) {
        self.user_yield.loop_count += 1;
        if self.user_yield.loop_count >= TOO_MANY_YIELDS {
            self.user_yield.blocked = true;
        }
    }

    pub fn clear_yield_block(&mut self) {
        self.user_yield.loop_count = 0;
        self.user_yield.blocked = false;
        self.user_yield.xchg_blocked = false;
    }
}

/// Suppressed tids for the hardware-transaction abort-set reduction.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AbortSet {
    /// The preempted thread an ancestor plans to revisit; `None` once the
    /// reduction is abandoned.
    pub preempted_evil_ancestor: Option<ThreadId>,
    pub deferred: Vec<ThreadId>,
}

impl AbortSet {
    #[inline]
    pub fn blocks(&self, tid: ThreadId) -> bool {
        self.preempted_evil_ancestor.is_some() && self.deferred.contains(&tid)
    }

    /// Give up on the reduction, unblocking every deferred tid.
    pub fn abandon(&mut self) {
        self.preempted_evil_ancestor = None;
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.preempted_evil_ancestor.is_none()
    }
}

/// Global userspace-sync observations (shared, not per-agent).
#[derive(Clone, Debug, Default)]
pub struct UserSync {
    pub xchg_count: u32,
}

impl UserSync {
    #[inline]
    pub fn has_xchged(&self) -> bool {
        self.xchg_count > 0
    }
}

/// Progress of the test program itself (distinct from checker progress).
#[derive(Clone, Debug, Default)]
pub struct TestState {
    pub test_ever_caused: bool,
    pub start_population: u32,
    /// Set by the arbiter to abandon the rest of the current branch.
    pub end_branch_early: bool,
}

#[derive(Clone, Debug)]
pub struct Scheduler {
    /// Runqueue, in guest enumeration order (the arbiter's tie-breaks and
    /// "last enumerated" rules depend on this order being stable).
    agents: Vec<Agent>,
    /// Threads the guest kernel has descheduled (kernel-level blocked).
    descheduled: Vec<Agent>,
    pub cur_agent: ThreadId,
    pub last_agent: Option<ThreadId>,
    pub voluntary_resched_tid: Option<ThreadId>,
    pub most_agents_ever: u32,
    pub icb_preemption_count: u32,
    pub icb_bound: u32,
    pub deadlock_fp_avoidance_count: u32,
    /// Tids DPOR switched to in this branch, oldest first.
    pub dpor_preferred_tids: Vec<ThreadId>,
    pub upcoming_aborts: AbortSet,
    pub user_sync: UserSync,
}

impl Scheduler {
    pub fn new() -> Self {
        Scheduler {
            agents: Vec::new(),
            descheduled: Vec::new(),
            cur_agent: 0,
            last_agent: None,
            voluntary_resched_tid: None,
            most_agents_ever: 0,
            icb_preemption_count: 0,
            icb_bound: 0,
            deadlock_fp_avoidance_count: 0,
            dpor_preferred_tids: Vec::new(),
            upcoming_aborts: AbortSet::default(),
            user_sync: UserSync::default(),
        }
    }

    // ---------------------------------------------------------------------
    // Agent lifecycle (driven by guest thread create/vanish events)
    // ---------------------------------------------------------------------

    pub fn create_agent(&mut self, tid: ThreadId) -> &mut Agent {
        assert!(
            self.agent(tid).is_none(),
            "guest reported duplicate thread {tid}"
        );
        self.agents.push(Agent::new(tid));
        let population = (self.agents.len() + self.descheduled.len()) as u32;
        self.most_agents_ever = self.most_agents_ever.max(population);
        self.agents.last_mut().unwrap()
    }

    pub fn destroy_agent(&mut self, tid: ThreadId) {
        let before = self.agents.len() + self.descheduled.len();
        self.agents.retain(|a| a.tid != tid);
        self.descheduled.retain(|a| a.tid != tid);
        assert!(
            self.agents.len() + self.descheduled.len() < before,
            "vanish for unknown thread {tid}"
        );
    }

    pub fn deschedule(&mut self, tid: ThreadId) {
        if let Some(pos) = self.agents.iter().position(|a| a.tid == tid) {
            let a = self.agents.remove(pos);
            self.descheduled.push(a);
        }
    }

    pub fn reschedule(&mut self, tid: ThreadId) {
        if let Some(pos) = self.descheduled.iter().position(|a| a.tid == tid) {
            let a = self.descheduled.remove(pos);
            self.agents.push(a);
        }
    }

    // ---------------------------------------------------------------------
    // Lookup
    // ---------------------------------------------------------------------

    pub fn agent(&self, tid: ThreadId) -> Option<&Agent> {
        self.agents
            .iter()
            .chain(self.descheduled.iter())
            .find(|a| a.tid == tid)
    }

    pub fn agent_mut(&mut self, tid: ThreadId) -> Option<&mut Agent> {
        self.agents
            .iter_mut()
            .chain(self.descheduled.iter_mut())
            .find(|a| a.tid == tid)
    }

    pub fn cur(&self) -> &Agent {
        self.agent(self.cur_agent).expect("no current agent")
    }

    /// Runqueue, in enumeration order.
    pub fn runnable(&self) -> impl Iterator<Item = &Agent> {
        self.agents.iter()
    }

    pub fn runnable_mut(&mut self) -> impl Iterator<Item = &mut Agent> {
        self.agents.iter_mut()
    }

    pub fn descheduled_agents(&self) -> impl Iterator<Item = &Agent> {
        self.descheduled.iter()
    }

    pub fn any_agents(&self) -> bool {
        !self.agents.is_empty() || !self.descheduled.is_empty()
    }

    // ---------------------------------------------------------------------
    // Blocked predicates
    // ---------------------------------------------------------------------

    /// A switch to `a` needs no preemption: the transition was voluntary,
    /// `a` already runs, or the current thread cannot continue anyway.
    pub fn no_preemption_required(&self, voluntary: bool, a: &Agent) -> bool {
        voluntary
            || a.tid == self.cur_agent
            || self.agent(self.cur_agent).is_none_or(|cur| cur.blocked())
    }

    pub fn icb_blocked(&self, use_icb: bool, voluntary: bool, a: &Agent) -> bool {
        use_icb
            && !self.no_preemption_required(voluntary, a)
            && self.icb_preemption_count >= self.icb_bound
    }

    #[inline]
    pub fn htm_blocked(&self, a: &Agent) -> bool {
        a.htm_retry_deferred
    }

    /// DPOR committed to exploring a subtree under `tid`; prefer it from now
    /// on in this branch.
    pub fn push_dpor_preference(&mut self, tid: ThreadId) {
        self.dpor_preferred_tids.push(tid);
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}
