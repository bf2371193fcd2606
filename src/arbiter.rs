/*!
Arbiter: the decision procedure of the checker.

Two questions get answered here, between every pair of guest instructions:

1. `interested` - is the instruction about to execute an interleaving-
   relevant point (a preemption point, a suspected data race, a voluntary
   reschedule, an HLT, a transaction boundary)?
2. `choose` - given that it is, which runnable thread runs next?

`choose` honors, in order: externally injected choices, the census of
runnable threads minus every flavor of blockage, stickiness for yielding
threads, DPOR's preferred-tid stack, and the forward/backward exploration
policy. When nothing is runnable it hands off to the deadlock machinery.
*/

use std::collections::VecDeque;

use tracing::debug;

use crate::bug;
use crate::machine::{self, Cpu, Reg, OPCODE_HLT, XABORT_CAPACITY};
use crate::save::PendingChoice;
use crate::sched::{AbortSet, Agent, ThreadId};
use crate::stack;
use crate::Checker;

/// Remember every tid DPOR switched to in this branch, or only the latest?
/// Remembering all of them shrinks some state spaces and inflates others,
/// and the inflation is generally worse, so only the most recent is
/// consulted by default.
const CONSIDER_ONLY_MOST_RECENT_DPOR_PREFERRED_TID: bool = true;

/// Enumerate candidate threads back-to-front instead of front-to-back.
const EXPLORE_BACKWARDS: bool = cfg!(feature = "explore_backwards");

/// An externally dictated scheduling choice (replay, explorer directive).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Choice {
    pub tid: ThreadId,
    pub txn: bool,
    pub xabort_code: u32,
    pub aborts: AbortSet,
}

impl Choice {
    /// A plain switch decided by the arbiter itself.
    pub fn ours(tid: ThreadId) -> Self {
        Choice {
            tid,
            txn: false,
            xabort_code: 0,
            aborts: AbortSet::default(),
        }
    }
}

/// FIFO of dictated choices: pushed at the front, popped from the tail.
#[derive(Debug, Default)]
pub struct ArbiterState {
    choices: VecDeque<Choice>,
}

impl ArbiterState {
    pub fn new() -> Self {
        ArbiterState {
            choices: VecDeque::new(),
        }
    }

    pub fn append_choice(&mut self, choice: Choice) {
        self.choices.push_front(choice);
    }

    pub fn pop_choice(&mut self) -> Option<Choice> {
        self.choices.pop_back()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.choices.is_empty()
    }
}

/// What `interested` concluded about the current instruction.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Interest {
    NotAPp,
    /// An ordinary preemption point.
    Pp,
    /// A suspected data race fired here.
    DataRace { eip: u32 },
    /// A voluntary reschedule is just ending.
    Voluntary,
    /// The kernel is idling in HLT; somebody must wake it.
    Sleep,
    /// Exit of a trusted thread-join.
    Joined,
    /// Transaction boundary; `xbegin` distinguishes entry from commit.
    Txn { xbegin: bool },
}

impl Interest {
    #[inline]
    pub fn is_pp(self) -> bool {
        self != Interest::NotAPp
    }
}

/// One-thread-per-PP: when a preemption point is declared, the running
/// thread must be the one committed at the previous PP (or the root's, if
/// there was none).
fn assert_one_thread_per_pp<C: Cpu>(chk: &Checker<C>) {
    assert!(
        chk.save.next_tid.is_none() || chk.save.next_tid == Some(chk.sched.cur_agent),
        "one thread per preemption point invariant violated"
    );
}

/// Idle-thread exemption: the guest's idle loop never counts as a real
/// choice once the test is underway (it only "runs" when everyone else is
/// wedged, which is its own kind of bug).
pub(crate) fn is_idle<C: Cpu>(chk: &Checker<C>, tid: ThreadId) -> bool {
    chk.layout.idle_tid == Some(tid)
        && chk.opts.bug_on_threads_wedged
        && chk.test.test_ever_caused
        && chk.test.start_population != chk.sched.most_agents_ever
}

fn user_address_space_loaded<C: Cpu>(cpu: &C, chk: &Checker<C>) -> bool {
    chk.layout.init_cr3.is_none_or(|kernel_cr3| cpu.cr3() != kernel_cr3)
}

/// Classify the instruction about to execute.
///
/// `just_finished_reschedule` is the facade's report that the last guest
/// event was a context-switch return.
pub fn interested<C: Cpu>(
    chk: &mut Checker<C>,
    cpu: &C,
    just_finished_reschedule: bool,
) -> Interest {
    let eip = cpu.reg(Reg::Eip);
    let cur_tid = chk.sched.cur_agent;

    // Is a "voluntary" reschedule just ending - did the last thread context
    // switch not because of a timer? Null switches don't count either way.
    if let Some(last_tid) = chk.sched.last_agent {
        let last_handling_timer = chk
            .sched
            .agent(last_tid)
            .is_some_and(|a| a.action.handling_timer);
        if !last_handling_timer && last_tid != cur_tid && just_finished_reschedule {
            debug!("a voluntary reschedule: {last_tid} to {cur_tid}");
            if !chk.layout.is_pintos() {
                // Pintos's semaphore can go a full lap around its
                // anti-paradise-lost loop without interrupts back on,
                // jamming an uninterruptible blocked thread into this
                // transition; skip the invariant there.
                if chk.save.next_tid != Some(last_tid) {
                    assert_one_thread_per_pp(chk);
                }
            }
            assert!(chk.sched.voluntary_resched_tid.is_some());
            return Interest::Voluntary;
        }
    }

    // Is the kernel idling, e.g. waiting for keyboard input?
    if machine::read_byte(cpu, &chk.layout, eip) == OPCODE_HLT {
        debug!("What are you waiting for? (HLT state)");
        assert_one_thread_per_pp(chk);
        return Interest::Sleep;
    }

    // Skip everything before the test case itself gets started.
    if !chk.test.test_ever_caused
        || chk.test.start_population == chk.sched.most_agents_ever
    {
        return Interest::NotAPp;
    }

    let cur = chk
        .sched
        .agent(cur_tid)
        .expect("current agent vanished mid-instruction");
    let (cur_xchg_blocked, cur_in_txn, cur_last_call, cur_syscall, cur_shm_flag) = (
        cur.user_yield.xchg_blocked,
        cur.action.user_txn,
        cur.last_call,
        cur.most_recent_syscall,
        cur.preempt_for_shm_here,
    );

    // Suspected data race?
    let suspected = if chk.opts.preempt_everywhere {
        cur_shm_flag
    } else {
        (chk.layout.is_pintos() || user_address_space_loaded(cpu, chk))
            && chk.pps.is_data_race_here(
                &chk.opts,
                &chk.layout,
                eip,
                cur_tid,
                cur_last_call,
                cur_syscall,
            )
    };
    // An xchg-blocked thread needs no DR PP here; it gets its own below.
    if suspected && !cur_xchg_blocked {
        let withins_ok = if chk.opts.dr_pps_respect_within_functions {
            let st = stack::stack_trace(cpu, &chk.layout);
            if chk.layout.kernel_memory(eip) {
                chk.pps.check_kern_within(&chk.opts, &st)
            } else {
                chk.pps.check_user_within(&chk.opts, &st)
            }
        } else {
            true
        };
        if withins_ok && (!chk.opts.strong_atomicity() || !cur_in_txn) {
            assert_one_thread_per_pp(chk);
            return Interest::DataRace { eip };
        }
    }

    if chk.opts.testing_userspace {
        // User-mode-only preemption points.
        if chk.layout.kernel_memory(eip) {
            if let (Some(yield_enter), Some(yield_exit)) =
                (chk.layout.guest_yield_enter, chk.layout.guest_yield_exit)
            {
                if (eip == yield_enter && machine::read_stack(cpu, &chk.layout, 1) == cur_tid)
                    || (eip == yield_exit && (cpu.reg(Reg::Eax) as i32) < 0)
                {
                    // Busted yield. Pretend it was yield(-1).
                    assert_one_thread_per_pp(chk);
                    return Interest::Pp;
                }
            }
            Interest::NotAPp
        } else if cur_xchg_blocked {
            // Blocked on an "xchg-continue" mutex: analogous to HLT, we
            // must preempt it.
            assert_one_thread_per_pp(chk);
            if chk.opts.strong_atomicity() && cur_in_txn {
                // Under strong atomicity a transaction that blocks can
                // never succeed; fail it and wrap up the branch.
                chk.save.abort_transaction(cur_tid, XABORT_CAPACITY);
                chk.test.end_branch_early = true;
                return Interest::NotAPp;
            }
            Interest::Pp
        } else if !chk.layout.is_pintos() && !user_address_space_loaded(cpu, chk) {
            Interest::NotAPp
        } else if chk.layout.user_mutex_lock_enter == Some(eip)
            || chk.layout.user_mutex_unlock_exit == Some(eip)
        {
            let st = stack::stack_trace(cpu, &chk.layout);
            if !chk.pps.check_user_within(&chk.opts, &st) {
                return Interest::NotAPp;
            }
            assert_one_thread_per_pp(chk);
            if chk.opts.strong_atomicity() && cur_in_txn {
                // Sound to skip: any conflict with this lock would play
                // out the same as the transaction aborting to begin with.
                // (Under weak memory the mutex may guard non-transactional
                // code, so it keeps its PP.)
                return Interest::NotAPp;
            }
            Interest::Pp
        } else if chk.layout.make_runnable_exit == Some(eip) {
            assert_one_thread_per_pp(chk);
            Interest::Pp
        } else if chk.opts.trusted_thr_join && chk.layout.thr_join_exit == Some(eip) {
            // Within-functions don't apply; this PP exists for
            // happens-before purposes, not scheduling.
            assert_one_thread_per_pp(chk);
            Interest::Joined
        } else if chk.layout.xbegin_enter == Some(eip) || chk.layout.xend_enter == Some(eip) {
            // Has to disrespect within-functions to properly respect
            // htm-blocking under contention.
            assert_one_thread_per_pp(chk);
            Interest::Txn {
                xbegin: chk.layout.xbegin_enter == Some(eip),
            }
        } else {
            Interest::NotAPp
        }
    } else {
        // Kernel-mode-only preemption points.
        let kern_within = |chk: &Checker<C>| {
            let st = stack::stack_trace(cpu, &chk.layout);
            chk.pps.check_kern_within(&chk.opts, &st)
        };
        if chk.layout.is_pintos()
            && (chk.layout.sema_down_enter == Some(eip) || chk.layout.sema_up_exit == Some(eip))
            && kern_within(chk)
        {
            assert_one_thread_per_pp(chk);
            Interest::Pp
        } else if chk.layout.is_pintos()
            && (chk.layout.cli_enter == Some(eip) || chk.layout.sti_exit == Some(eip))
            && !chk.sched.cur().action.kern_mutex_locking
            && !chk.sched.cur().action.kern_mutex_unlocking
            && kern_within(chk)
        {
            assert_one_thread_per_pp(chk);
            Interest::Pp
        } else if chk.layout.kern_decision_points.contains(&eip) && kern_within(chk) {
            assert_one_thread_per_pp(chk);
            Interest::Pp
        } else {
            Interest::NotAPp
        }
    }
}

/// Outcome of `choose`.
#[derive(Clone, Debug, PartialEq)]
pub enum ChooseResult {
    Switch {
        choice: Choice,
        /// False when an injected choice dictated the switch.
        our_choice: bool,
    },
    /// Nothing runnable. `deadlock` reports whether a bug was declared.
    NoRunnable { deadlock: bool },
}

fn legal_choice<C: Cpu>(chk: &Checker<C>, voluntary: bool, a: &Agent) -> bool {
    !a.blocked()
        && !is_idle(chk, a.tid)
        && !chk.sched.htm_blocked(a)
        && !chk.sched.upcoming_aborts.blocks(a.tid)
        && !chk.sched.icb_blocked(chk.opts.use_icb, voluntary, a)
}

/// Pick the next thread to schedule, or report that none can run.
pub fn choose<C: Cpu>(chk: &mut Checker<C>, cpu: &C, voluntary: bool) -> ChooseResult {
    // Somebody else (replay, explorer) may have made this choice already.
    if let Some(choice) = chk.arbiter.pop_choice() {
        debug!("using requested tid {}", choice.tid);
        return ChooseResult::Switch {
            choice,
            our_choice: false,
        };
    }

    // Census of available threads.
    let mut count: u32 = 0;
    let mut current_is_legal = false;
    // (index into the preference stack, position in the census)
    let mut dpor_preferred: Option<(usize, u32)> = None;
    let cur_tid = chk.sched.cur_agent;
    {
        let prefs = &chk.sched.dpor_preferred_tids;
        for a in chk.sched.runnable() {
            if !legal_choice(chk, voluntary, a) {
                continue;
            }
            count += 1;
            if a.tid == cur_tid {
                current_is_legal = true;
            }
            // Keep running the tid DPOR last switched to: whoever DPOR put
            // in charge of this subtree outranks whoever was preempted.
            for (i, &pref) in prefs.iter().enumerate() {
                if CONSIDER_ONLY_MOST_RECENT_DPOR_PREFERRED_TID && i + 1 < prefs.len() {
                    continue;
                }
                if a.tid == pref && dpor_preferred.is_none_or(|(pi, _)| i >= pi) {
                    dpor_preferred = Some((i, count));
                }
            }
        }
    }
    debug!("{count} choices available");

    if EXPLORE_BACKWARDS {
        assert!(!chk.opts.use_icb, "for ICB, exploration must run forwards");
    } else {
        count = 1;
    }

    if dpor_preferred.is_some() && !current_is_legal {
        // Don't let a voluntary context switch accidentally land on the
        // preempted evil ancestor before DPOR's child gets to run.
        count = dpor_preferred.unwrap().1;
    }

    // A yielding or xchg-spinning thread keeps the cpu while it legally can.
    let cur_yield = chk
        .sched
        .agent(cur_tid)
        .map(|a| (a.user_yield.has_yielded(), a.user_yield.blocked));
    if let Some((has_yielded, yield_blocked)) = cur_yield {
        if has_yielded || chk.sched.user_sync.has_xchged() {
            if current_is_legal {
                debug!("- Must run yielding thread {cur_tid}");
                // Preemption count doesn't increase.
                return ChooseResult::Switch {
                    choice: Choice::ours(cur_tid),
                    our_choice: true,
                };
            } else if !yield_blocked {
                // Something got the thread ACTUALLY blocked before it
                // finished yield-blocking; any false-positive yield
                // scenario can trigger this. Start the count over.
                chk.sched.agent_mut(cur_tid).unwrap().user_yield.loop_count = 0;
            }
            // Otherwise: the normal too-many-yields block; fall through.
        }
    }

    // Take the count-th available thread.
    let mut seen: u32 = 0;
    let mut found: Option<(ThreadId, bool)> = None;
    for a in chk.sched.runnable() {
        if legal_choice(chk, voluntary, a) {
            seen += 1;
            if seen == count {
                found = Some((a.tid, !chk.sched.no_preemption_required(voluntary, a)));
                break;
            }
        }
    }
    if let Some((tid, preemption)) = found {
        debug!("- Figured I'd look at TID {tid} next.");
        if preemption {
            chk.sched.icb_preemption_count += 1;
            debug!("switching to TID {tid} counts as a preemption for ICB");
        }
        return ChooseResult::Switch {
            choice: Choice::ours(tid),
            our_choice: true,
        };
    }

    // No runnable threads. Is this a bug, or is it expected?
    if bug::deadlock_is_real(chk) {
        if let Some(tid) = bug::try_avoid_fp_deadlock(chk, voluntary) {
            tracing::warn!(
                "System is apparently deadlocked! Let me just try one thing. See you soon."
            );
            // Bypasses the preemption count: this wake is needed for
            // correctness, so ICB can't interfere with it.
            return ChooseResult::Switch {
                choice: Choice::ours(tid),
                our_choice: true,
            };
        }
        if voluntary {
            let terminal = PendingChoice {
                our_choice: true,
                end_of_test: true,
                is_preemption_point: true,
                voluntary: true,
                ..PendingChoice::default()
            };
            chk.save.setjmp(cpu, &chk.sched, &chk.layout, terminal);
        }
        debug!(
            "ICB count {} bound {}",
            chk.sched.icb_preemption_count, chk.sched.icb_bound
        );
        bug::found_a_bug(chk, "Deadlock -- no threads are runnable!");
        ChooseResult::NoRunnable { deadlock: true }
    } else {
        debug!("Deadlock -- no threads are runnable! (expected; not a bug)");
        ChooseResult::NoRunnable { deadlock: false }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::XBEGIN_STARTED;
    use crate::test_utils::{checker_fixture, start_test};

    #[test]
    fn choice_queue_is_fifo_front_to_tail() {
        let mut arb = ArbiterState::new();
        arb.append_choice(Choice::ours(1));
        arb.append_choice(Choice::ours(2));
        assert_eq!(arb.pop_choice().unwrap().tid, 1);
        assert_eq!(arb.pop_choice().unwrap().tid, 2);
        assert!(arb.pop_choice().is_none());
    }

    #[test]
    fn injected_choice_overrides_the_arbiter() {
        let (cpu, mut chk) = checker_fixture(&[1, 2]);
        start_test(&mut chk);
        chk.arbiter.append_choice(Choice {
            tid: 2,
            txn: true,
            xabort_code: XBEGIN_STARTED,
            aborts: AbortSet::default(),
        });
        match choose(&mut chk, &cpu, false) {
            ChooseResult::Switch { choice, our_choice } => {
                assert_eq!(choice.tid, 2);
                assert!(choice.txn);
                assert!(!our_choice);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn hlt_is_a_sleep_point() {
        let (mut cpu, mut chk) = checker_fixture(&[1]);
        cpu.set_reg(Reg::Eip, 0x3000);
        cpu.write_phys(0x3000, OPCODE_HLT as u32, 1);
        assert_eq!(interested(&mut chk, &cpu, false), Interest::Sleep);
    }

    #[test]
    fn quiet_before_test_start() {
        let (mut cpu, mut chk) = checker_fixture(&[1, 2]);
        cpu.set_reg(Reg::Eip, 0x0100_4000);
        // Test never caused: nothing is interesting.
        assert_eq!(interested(&mut chk, &cpu, false), Interest::NotAPp);
        // Caused but the population hasn't grown past its starting value.
        chk.test.test_ever_caused = true;
        chk.test.start_population = 2;
        assert_eq!(interested(&mut chk, &cpu, false), Interest::NotAPp);
    }

    #[test]
    fn voluntary_reschedule_detected() {
        let (cpu, mut chk) = checker_fixture(&[1, 2]);
        start_test(&mut chk);
        chk.sched.cur_agent = 2;
        chk.sched.last_agent = Some(1);
        chk.sched.voluntary_resched_tid = Some(2);
        chk.save.recover(Some(1), false, 0);
        assert_eq!(interested(&mut chk, &cpu, true), Interest::Voluntary);
        // Timer-driven switches are not voluntary.
        chk.sched.agent_mut(1).unwrap().action.handling_timer = true;
        assert_eq!(interested(&mut chk, &cpu, true), Interest::NotAPp);
    }

    #[test]
    fn data_race_pp_fires_with_matching_fingerprint() {
        let (mut cpu, mut chk) = checker_fixture(&[1, 2]);
        start_test(&mut chk);
        let eip = 0x0100_4000;
        cpu.set_reg(Reg::Eip, eip);
        assert_eq!(interested(&mut chk, &cpu, false), Interest::NotAPp);
        chk.pps.add_data_race(crate::pp::PpDataRace {
            eip,
            tid: Some(1),
            last_call: 0,
            most_recent_syscall: 0,
        });
        assert_eq!(interested(&mut chk, &cpu, false), Interest::DataRace { eip });
        // Inside a transaction under strong atomicity: suppressed.
        chk.sched.agent_mut(1).unwrap().action.user_txn = true;
        assert_eq!(interested(&mut chk, &cpu, false), Interest::NotAPp);
    }

    #[test]
    fn mutex_lock_entry_is_a_pp() {
        let (mut cpu, mut chk) = checker_fixture(&[1, 2]);
        start_test(&mut chk);
        let eip = 0x0100_8000;
        chk.layout.user_mutex_lock_enter = Some(eip);
        cpu.set_reg(Reg::Eip, eip);
        assert_eq!(interested(&mut chk, &cpu, false), Interest::Pp);
        // Inside a strong-atomicity transaction the lock PP is skipped.
        chk.sched.agent_mut(1).unwrap().action.user_txn = true;
        assert_eq!(interested(&mut chk, &cpu, false), Interest::NotAPp);
    }

    #[test]
    fn xchg_blocked_transaction_aborts_and_ends_branch() {
        let (mut cpu, mut chk) = checker_fixture(&[1, 2]);
        start_test(&mut chk);
        // Root node so abort_transaction has a nobe to mark.
        let root = chk.save.setjmp(
            &cpu,
            &chk.sched,
            &chk.layout,
            crate::save::PendingChoice {
                next_tid: Some(1),
                our_choice: true,
                is_preemption_point: true,
                ..Default::default()
            },
        );
        cpu.set_reg(Reg::Eip, 0x0100_9000);
        {
            let a = chk.sched.agent_mut(1).unwrap();
            a.user_yield.xchg_blocked = true;
            a.user_yield.blocked = true;
        }
        // Plain xchg-blocked thread: preempt it.
        assert_eq!(interested(&mut chk, &cpu, false), Interest::Pp);
        // In a transaction under strong atomicity: branch is abandoned.
        chk.sched.agent_mut(1).unwrap().action.user_txn = true;
        assert_eq!(interested(&mut chk, &cpu, false), Interest::NotAPp);
        assert!(chk.test.end_branch_early);
        assert_eq!(
            chk.save.tree().get(root).forced_xaborts,
            vec![(1, XABORT_CAPACITY)]
        );
    }

    #[test]
    fn trusted_join_and_txn_boundaries() {
        let (mut cpu, mut chk) = checker_fixture(&[1, 2]);
        start_test(&mut chk);
        chk.opts.trusted_thr_join = true;
        chk.layout.make_runnable_exit = Some(0x0100_a000);
        chk.layout.thr_join_exit = Some(0x0100_b000);
        chk.layout.xbegin_enter = Some(0x0100_c000);
        chk.layout.xend_enter = Some(0x0100_d000);

        cpu.set_reg(Reg::Eip, 0x0100_a000);
        assert_eq!(interested(&mut chk, &cpu, false), Interest::Pp);
        cpu.set_reg(Reg::Eip, 0x0100_b000);
        assert_eq!(interested(&mut chk, &cpu, false), Interest::Joined);
        cpu.set_reg(Reg::Eip, 0x0100_c000);
        assert_eq!(
            interested(&mut chk, &cpu, false),
            Interest::Txn { xbegin: true }
        );
        cpu.set_reg(Reg::Eip, 0x0100_d000);
        assert_eq!(
            interested(&mut chk, &cpu, false),
            Interest::Txn { xbegin: false }
        );
    }

    #[test]
    fn kernel_decision_points_when_testing_kernelspace() {
        let (mut cpu, mut chk) = checker_fixture(&[1, 2]);
        start_test(&mut chk);
        chk.opts.testing_userspace = false;
        chk.layout.kern_decision_points = vec![0x0010_4000];
        cpu.set_reg(Reg::Eip, 0x0010_4000);
        cpu.set_reg(Reg::Ebp, 0); // trivial stack trace
        assert_eq!(interested(&mut chk, &cpu, false), Interest::Pp);
        cpu.set_reg(Reg::Eip, 0x0010_4004);
        assert_eq!(interested(&mut chk, &cpu, false), Interest::NotAPp);
    }

    #[test]
    fn choose_prefers_current_among_blocked_rivals() {
        // T1 ICB-blocked, T2 addr-blocked, T3 current: T3 is the only
        // choice and charging ICB for it would be wrong.
        let (cpu, mut chk) = checker_fixture(&[1, 2, 3]);
        start_test(&mut chk);
        chk.opts.use_icb = true;
        chk.sched.icb_bound = 0;
        chk.sched.cur_agent = 3;
        chk.sched.agent_mut(2).unwrap().user_blocked_on_addr = Some(0x100);
        match choose(&mut chk, &cpu, false) {
            ChooseResult::Switch { choice, our_choice } => {
                assert_eq!(choice.tid, 3);
                assert!(our_choice);
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(chk.sched.icb_preemption_count, 0);
    }

    #[test]
    fn yielding_current_thread_keeps_running() {
        let (cpu, mut chk) = checker_fixture(&[1, 2]);
        start_test(&mut chk);
        chk.sched.cur_agent = 2;
        chk.sched.agent_mut(2).unwrap().user_yield.loop_count = 1;
        match choose(&mut chk, &cpu, false) {
            ChooseResult::Switch { choice, .. } => assert_eq!(choice.tid, 2),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn dpor_preference_wins_when_current_is_blocked() {
        let (cpu, mut chk) = checker_fixture(&[1, 2, 3]);
        start_test(&mut chk);
        chk.sched.cur_agent = 1;
        chk.sched.agent_mut(1).unwrap().user_blocked_on_addr = Some(0x10);
        chk.sched.push_dpor_preference(3);
        match choose(&mut chk, &cpu, false) {
            ChooseResult::Switch { choice, .. } => assert_eq!(choice.tid, 3),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn first_runnable_wins_by_default() {
        let (cpu, mut chk) = checker_fixture(&[1, 2, 3]);
        start_test(&mut chk);
        chk.sched.cur_agent = 3;
        // Current thread not yielding, nobody blocked: enumeration order
        // decides, and forward exploration takes the first.
        match choose(&mut chk, &cpu, false) {
            ChooseResult::Switch { choice, .. } => assert_eq!(choice.tid, 1),
            other => panic!("unexpected: {other:?}"),
        }
        // That switch preempted runnable T3.
        assert_eq!(chk.sched.icb_preemption_count, 1);
    }

    #[test]
    fn deadlock_declared_when_fp_budget_exhausted() {
        let (cpu, mut chk) = checker_fixture(&[1, 2, 3]);
        start_test(&mut chk);
        for tid in [1, 2, 3] {
            chk.sched.agent_mut(tid).unwrap().user_blocked_on_addr = Some(0x100 + tid);
        }
        // First call: false-positive avoidance wakes all three and picks
        // the last enumerated.
        match choose(&mut chk, &cpu, false) {
            ChooseResult::Switch { choice, .. } => assert_eq!(choice.tid, 3),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(chk.sched.runnable().all(|a| !a.blocked()));
        assert_eq!(chk.sched.deadlock_fp_avoidance_count, 1);

        // They all re-block, over and over: the budget runs dry and a
        // genuine deadlock is declared (terminal node on voluntary).
        let mut result = None;
        for _ in 0..bug::DEADLOCK_FP_MAX_ATTEMPTS + 1 {
            for tid in [1, 2, 3] {
                chk.sched.agent_mut(tid).unwrap().user_blocked_on_addr = Some(0x100 + tid);
            }
            result = Some(choose(&mut chk, &cpu, true));
            if matches!(result, Some(ChooseResult::NoRunnable { .. })) {
                break;
            }
        }
        assert_eq!(result, Some(ChooseResult::NoRunnable { deadlock: true }));
        // The voluntary transition left an end-of-test terminal node.
        let terminal = chk.save.current().unwrap();
        assert!(chk.save.tree().get(terminal).end_of_test);
    }

    #[test]
    fn wedged_threads_not_a_bug_when_disk_io_pends() {
        let (cpu, mut chk) = checker_fixture(&[1, 2]);
        start_test(&mut chk);
        for tid in [1, 2] {
            let a = chk.sched.agent_mut(tid).unwrap();
            a.user_blocked_on_addr = Some(0x100);
        }
        chk.sched.agent_mut(2).unwrap().action.disk_io = true;
        assert_eq!(
            choose(&mut chk, &cpu, false),
            ChooseResult::NoRunnable { deadlock: false }
        );
    }

    #[test]
    fn one_thread_per_pp_panics_on_violation() {
        let (mut cpu, mut chk) = checker_fixture(&[1, 2]);
        start_test(&mut chk);
        // Previous PP committed to T2, but T1 is somehow running at this
        // HLT: programming defect.
        chk.save.recover(Some(2), false, 0);
        chk.sched.cur_agent = 1;
        cpu.set_reg(Reg::Eip, 0x3000);
        cpu.write_phys(0x3000, OPCODE_HLT as u32, 1);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            interested(&mut chk, &cpu, false)
        }));
        assert!(result.is_err());
    }

    #[test]
    fn pp_registry_gates_mutex_pps_by_within_functions() {
        let (mut cpu, mut chk) = checker_fixture(&[1, 2]);
        start_test(&mut chk);
        let eip = 0x0100_8000;
        chk.layout.user_mutex_lock_enter = Some(eip);
        // Whitelist a range that does NOT cover the current stack.
        chk.pps.add_within(
            false,
            crate::pp::PpWithin {
                func_start: 0x0200_0000,
                func_end: 0x0200_1000,
                within: true,
            },
        );
        cpu.set_reg(Reg::Eip, eip);
        cpu.set_reg(Reg::Ebp, 0);
        assert_eq!(interested(&mut chk, &cpu, false), Interest::NotAPp);
    }
}
