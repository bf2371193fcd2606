/*!
Bug and deadlock machinery.

Declaring a deadlock is cheap; declaring one *wrongly* wastes a whole
subspace, so this module is mostly about not crying wolf. Tracking
"blocked" by yield-in-mutex observation avoids the expensive loop-counting
heuristic but can leave a thread's blocked-on-addr stale (e.g. a little
lock inside a descheduling mutex_lock); the false-positive avoidance pass
wakes plausible fakers, with a per-branch budget so a real deadlock still
gets reported. The budget lives in the scheduler, which is snapshot-
restored on backtrack, so it resets per branch for free.

The tradeoff in the budget: longer deadlock traces when it's real, versus
how many benign repetitions an adversarial program needs to force a false
report anyway.
*/

use tracing::{debug, error, warn};

use crate::arbiter::is_idle;
use crate::machine::Cpu;
use crate::messaging::ChildMessage;
use crate::sched::ThreadId;
use crate::Checker;

/// False-positive-avoidance attempts per branch.
pub const DEADLOCK_FP_MAX_ATTEMPTS: u32 = 128;

/// Whether "no runnable threads" deserves a bug report at all.
pub fn deadlock_is_real<C: Cpu>(chk: &Checker<C>) -> bool {
    if !chk.opts.bug_on_threads_wedged {
        return false;
    }
    if !chk.sched.any_agents() {
        // No threads exist. Not a deadlock, but rather end of test.
        return false;
    }
    for a in chk.sched.runnable() {
        if a.blocked() && a.action.disk_io {
            warn!(
                "'ad-hoc' yield blocking (mutexes?) is not suitable for disk I/O! (TID {})",
                a.tid
            );
            return false;
        }
    }
    // Now for each *non*-runnable agent...
    for a in chk.sched.descheduled_agents() {
        if a.action.disk_io {
            debug!("TID {} blocked on disk I/O. Allowing idle to run.", a.tid);
            return false;
        }
    }
    true
}

/// Try to wake a thread whose "blocked" marking might be a false positive.
/// Returns the tid to run, or `None` once the budget is spent or nobody
/// qualifies.
pub fn try_avoid_fp_deadlock<C: Cpu>(chk: &mut Checker<C>, voluntary: bool) -> Option<ThreadId> {
    if chk.sched.deadlock_fp_avoidance_count == DEADLOCK_FP_MAX_ATTEMPTS {
        return None;
    }
    chk.sched.deadlock_fp_avoidance_count += 1;

    // ICB-blocked threads first, and exclusively: they won't get run on
    // their own at later PPs, and waking the other categories when an
    // ICB-blocked thread would do produces infinite subtrees. A thread can
    // be several kinds of maybe-blocked at once; only definitely-otherwise-
    // runnable ones qualify here.
    let mut found: Option<ThreadId> = None;
    for a in chk.sched.runnable() {
        if chk.sched.icb_blocked(chk.opts.use_icb, voluntary, a) {
            assert!(!is_idle(chk, a.tid), "that's weird");
            if a.user_blocked_on_addr.is_none() && !a.user_yield_blocked() {
                debug!(
                    "I thought TID {} was ICB-blocked (bound {}), but maybe \
                     preempting is needed here for correctness!",
                    a.tid, chk.sched.icb_bound
                );
                found = Some(a.tid);
            }
        }
    }
    if found.is_some() {
        return found;
    }

    // Abort-set blocking second. This must outrank genuinely mutex-blocked
    // threads or they would consume every remaining attempt.
    if chk.opts.htm_abort_sets {
        let blocked = chk
            .sched
            .runnable()
            .find(|a| chk.sched.upcoming_aborts.blocks(a.tid))
            .map(|a| a.tid);
        if let Some(tid) = blocked {
            warn!("I thought TID {tid} was abort-set blocked, but I could be wrong!");
            // Unblock the to-execute-later tid and let it run, giving up
            // on the reduction.
            chk.sched.upcoming_aborts.abandon();
            return Some(tid);
        }
    }

    // Wake *all* addr/yield-blocked threads, not knowing which was faking
    // it; a true deadlock re-blocks them all. Whichever comes latest in
    // the enumeration is as good a pick as any.
    let idle_active = chk.opts.bug_on_threads_wedged
        && chk.test.test_ever_caused
        && chk.test.start_population != chk.sched.most_agents_ever;
    let idle_tid = chk.layout.idle_tid;
    let mut found: Option<ThreadId> = None;
    for a in chk.sched.runnable_mut() {
        if let Some(addr) = a.user_blocked_on_addr {
            assert!(!(idle_active && idle_tid == Some(a.tid)), "that's weird");
            debug!(
                "I thought TID {} was blocked on {addr:#x}, but I could be wrong!",
                a.tid
            );
            a.user_blocked_on_addr = None;
            found = Some(a.tid);
        } else if a.user_yield_blocked() {
            assert!(!(idle_active && idle_tid == Some(a.tid)), "that's weird");
            debug!(
                "I thought TID {} was blocked yielding (ylc {}), but I could be wrong!",
                a.tid, a.user_yield.loop_count
            );
            a.user_yield.loop_count = 0;
            a.user_yield.blocked = false;
            found = Some(a.tid);
        }
    }
    found
}

fn process_cpu_usecs() -> u64 {
    let mut ru: libc::rusage = unsafe { std::mem::zeroed() };
    if unsafe { libc::getrusage(libc::RUSAGE_SELF, &mut ru) } != 0 {
        return 0;
    }
    let user = ru.ru_utime.tv_sec as u64 * 1_000_000 + ru.ru_utime.tv_usec as u64;
    let sys = ru.ru_stime.tv_sec as u64 * 1_000_000 + ru.ru_stime.tv_usec as u64;
    user + sys
}

/// Declare a bug on the current branch and broadcast it to the parent.
///
/// Rendering the decision trace is the embedder's job; the report names
/// the file the embedder will write it to.
pub fn found_a_bug<C: Cpu>(chk: &mut Checker<C>, desc: &str) {
    let branches = chk.save.stats.total_jumps + 1;
    error!("{desc}");
    error!(
        "**** A bug was found after {branches} interleaving{}! ****",
        if branches == 1 { "" } else { "s" }
    );
    if let Some(messenger) = chk.messenger.as_mut() {
        let msg = ChildMessage::BugFound {
            trace_path: format!("{}-bug{branches}.trace", chk.opts.test_case),
            fab_timestamp: chk.save.stats.total_usecs,
            fab_cputime: process_cpu_usecs(),
        };
        if let Err(err) = messenger.send(&msg) {
            warn!("could not report bug to parent: {err}");
        }
    }
}

/// Tell the parent about a data race observed at runtime, so future jobs
/// can preempt on it.
pub fn report_data_race<C: Cpu>(
    chk: &mut Checker<C>,
    eip: u32,
    tid: Option<ThreadId>,
    last_call: u32,
    most_recent_syscall: u32,
) {
    if let Some(messenger) = chk.messenger.as_mut() {
        let msg = ChildMessage::PpDiscovered {
            eip,
            tid,
            last_call,
            most_recent_syscall,
        };
        if let Err(err) = messenger.send(&msg) {
            warn!("could not report data race to parent: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{checker_fixture, start_test};

    #[test]
    fn no_threads_means_end_of_test_not_deadlock() {
        let (_, mut chk) = checker_fixture(&[1]);
        start_test(&mut chk);
        chk.sched.destroy_agent(1);
        assert!(!deadlock_is_real(&chk));
    }

    #[test]
    fn wedged_flag_gates_deadlock_reports() {
        let (_, mut chk) = checker_fixture(&[1]);
        start_test(&mut chk);
        assert!(deadlock_is_real(&chk));
        chk.opts.bug_on_threads_wedged = false;
        assert!(!deadlock_is_real(&chk));
    }

    #[test]
    fn descheduled_disk_io_excuses_the_wedge() {
        let (_, mut chk) = checker_fixture(&[1, 2]);
        start_test(&mut chk);
        chk.sched.deschedule(2);
        chk.sched.agent_mut(2).unwrap().action.disk_io = true;
        assert!(!deadlock_is_real(&chk));
    }

    #[test]
    fn icb_blocked_wins_over_addr_blocked() {
        let (_, mut chk) = checker_fixture(&[1, 2, 3]);
        start_test(&mut chk);
        chk.opts.use_icb = true;
        chk.sched.icb_bound = 0;
        chk.sched.cur_agent = 3;
        chk.sched.agent_mut(2).unwrap().user_blocked_on_addr = Some(0x100);
        // T1 is ICB-blocked but otherwise runnable; T2 stays blocked.
        let woken = try_avoid_fp_deadlock(&mut chk, false);
        assert_eq!(woken, Some(1));
        assert_eq!(chk.sched.agent(2).unwrap().user_blocked_on_addr, Some(0x100));
        assert_eq!(chk.sched.deadlock_fp_avoidance_count, 1);
    }

    #[test]
    fn abort_set_block_abandons_the_reduction() {
        let (_, mut chk) = checker_fixture(&[1, 2]);
        start_test(&mut chk);
        chk.opts.htm_abort_sets = true;
        chk.sched.upcoming_aborts.preempted_evil_ancestor = Some(2);
        chk.sched.upcoming_aborts.deferred = vec![1];
        let woken = try_avoid_fp_deadlock(&mut chk, false);
        assert_eq!(woken, Some(1));
        assert!(chk.sched.upcoming_aborts.is_empty());
    }

    #[test]
    fn wakes_every_addr_and_yield_blocked_thread() {
        let (_, mut chk) = checker_fixture(&[1, 2, 3]);
        start_test(&mut chk);
        chk.sched.agent_mut(1).unwrap().user_blocked_on_addr = Some(0x10);
        {
            let a = chk.sched.agent_mut(2).unwrap();
            a.user_yield.loop_count = 99;
            a.user_yield.blocked = true;
        }
        chk.sched.agent_mut(3).unwrap().user_blocked_on_addr = Some(0x30);
        let woken = try_avoid_fp_deadlock(&mut chk, false);
        // Last in enumeration wins; everyone got unblocked.
        assert_eq!(woken, Some(3));
        assert!(chk.sched.runnable().all(|a| !a.blocked()));
    }

    #[test]
    fn budget_exhaustion_returns_none() {
        let (_, mut chk) = checker_fixture(&[1]);
        start_test(&mut chk);
        chk.sched.agent_mut(1).unwrap().user_blocked_on_addr = Some(0x10);
        chk.sched.deadlock_fp_avoidance_count = DEADLOCK_FP_MAX_ATTEMPTS;
        assert_eq!(try_avoid_fp_deadlock(&mut chk, false), None);
        // And the thread stayed blocked.
        assert!(chk.sched.agent(1).unwrap().blocked());
    }
}
