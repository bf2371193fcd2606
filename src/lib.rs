#![doc = r#"
Interlace library crate.

A stateless model checker for concurrent programs: it rides along inside a
cycle-accurate machine simulator, decides at every interleaving-relevant
instruction which guest thread runs next, and systematically explores
distinct thread schedules hunting for assertion failures, deadlocks, and
data races. A parent fleet controller (the `interlace` binary) spawns many
simulator children, each exploring the sub-space carved out by one
preemption-point set.

Modules:
- machine: `Cpu` trait facade over the simulator; page walks, opcode
  classification, event injection
- stack: guest stack traces and within-function range checks
- pp: preemption-point registry and the dynamic PP file loader
- sched: agents, blocked predicates, ICB counting, abort sets
- tree: choice-tree arena of committed scheduling decisions
- save: setjmp/longjmp checkpointing over the choice tree
- arbiter: is this instruction a preemption point, and who runs next
- bug: deadlock legitimacy, false-positive avoidance, bug reporting
- messaging: line-oriented RPC between child checker and fleet parent
- opts: frozen checker options and guest symbol layout
- ppset, bugs, job: parent-side PP sets, the global bug ledger, and the
  per-job worker lifecycle

In tests, a reference `TestCpu` and builders live under `crate::test_utils`.
"#]

// Checker (child) side
pub mod arbiter;
pub mod bug;
pub mod machine;
pub mod messaging;
pub mod opts;
pub mod pp;
pub mod save;
pub mod sched;
pub mod stack;
pub mod tree;

// Fleet (parent) side
pub mod bugs;
pub mod job;
pub mod ppset;

// Re-export commonly used types at the crate root for convenience.
pub use machine::Cpu;
pub use sched::{Agent, Scheduler, TestState, ThreadId};
pub use tree::{ChoiceTree, NodeId};

use arbiter::ArbiterState;
use messaging::ChildMessenger;
use opts::{GuestLayout, Options};
use pp::PpRegistry;
use save::SaveState;

/// The checker-side singletons, bundled the way the simulator embeds them.
///
/// The arbiter and bug modules operate on this through free functions, so
/// the decision path stays a synchronous call chain with no hidden state
/// beyond these fields.
pub struct Checker<C: Cpu> {
    pub opts: Options,
    pub layout: GuestLayout,
    pub sched: Scheduler,
    pub test: TestState,
    pub pps: PpRegistry,
    pub arbiter: ArbiterState,
    pub save: SaveState<C>,
    pub messenger: Option<ChildMessenger>,
}

impl<C: Cpu> Checker<C> {
    pub fn new(opts: Options, layout: GuestLayout, pps: PpRegistry) -> Self {
        // Config sanity: these combinations are defects, not runtime
        // conditions, so they fail loudly at startup.
        if opts.trusted_thr_join && opts.testing_userspace {
            assert!(
                layout.make_runnable_exit.is_some(),
                "make-runnable preemption point required for trusted join soundness"
            );
        }
        if opts.preempt_everywhere {
            assert!(
                opts.dr_pps_respect_within_functions,
                "preempt-everywhere requires DR PPs to respect within-functions"
            );
        }
        if opts.htm_dont_retry {
            assert!(opts.htm_abort_codes, "HTM_DONT_RETRY requires HTM_ABORT_CODES");
        }
        if opts.htm_abort_sets {
            assert!(
                !opts.htm_abort_codes && !opts.htm_dont_retry,
                "HTM_ABORT_SETS excludes HTM_ABORT_CODES and HTM_DONT_RETRY"
            );
        }
        if opts.htm_weak_atomicity {
            assert!(opts.htm_dont_retry, "HTM_WEAK_ATOMICITY requires HTM_DONT_RETRY");
        }
        assert!(
            !(opts.use_icb && cfg!(feature = "explore_backwards")),
            "with ICB, exploration must run forwards"
        );

        Checker {
            opts,
            layout,
            sched: Scheduler::new(),
            test: TestState::default(),
            pps,
            arbiter: ArbiterState::new(),
            save: SaveState::new(),
            messenger: None,
        }
    }

    /// Stream a progress estimate to the parent, if one is listening.
    pub fn report_progress(&mut self, branches: u32, proportion: f64, eta_usecs: u64) {
        let elapsed_usecs = self.save.stats.total_usecs;
        let icb_bound = self.sched.icb_bound;
        if let Some(messenger) = self.messenger.as_mut() {
            let msg = messaging::ChildMessage::Progress {
                branches,
                proportion,
                elapsed_usecs,
                eta_usecs,
                icb_bound,
            };
            if let Err(err) = messenger.send(&msg) {
                tracing::warn!("could not report progress to parent: {err}");
            }
        }
    }

    /// Connect to the parent over the pipes the dynamic PP load published.
    /// A checker running standalone (no parent) simply never calls this.
    pub fn connect_messenger(&mut self) -> Result<(), messaging::MessagingError> {
        let (input, output) = self.pps.pipes();
        let (Some(input), Some(output)) = (input, output) else {
            return Ok(());
        };
        let (input, output) = (input.to_path_buf(), output.to_path_buf());
        self.messenger = Some(ChildMessenger::connect(&input, &output)?);
        Ok(())
    }
}

// Shared test utilities (only compiled for tests)
#[cfg(test)]
pub mod test_utils;
