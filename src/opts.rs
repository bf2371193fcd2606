/*!
Frozen checker configuration.

Two records live here. `Options` is the checker's static configuration,
parsed once from the `KEY=VALUE` file the parent materialises and never
reassigned afterwards; every component reads it by reference. `GuestLayout`
carries the guest-kernel facts the checker needs (address-space shape,
well-known symbol addresses); resolving symbol names to addresses happens
outside this crate, so the layout arrives pre-cooked.
*/

use std::fs;
use std::path::Path;

use tracing::warn;

use crate::sched::ThreadId;

/// Which guest-kernel flavor the simulator is running.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum GuestKind {
    Pebbles,
    Pintos,
    Pathos,
}

/// Address-space shape and well-known guest addresses.
#[derive(Clone, Debug)]
pub struct GuestLayout {
    pub kind: GuestKind,
    /// Kernel half is identity-mapped; user addresses still require a walk.
    pub kernel_direct_mapped: bool,
    kernel_boundary: u32,
    kernel_below_boundary: bool,
    /// Pattern some guests scribble into freed page-table entries.
    pub pde_pte_poison: Option<u32>,

    pub timer_entry: u32,
    pub timer_wrap_end: u32,
    /// CR3 of the initial (kernel-only) address space, when known.
    pub init_cr3: Option<u32>,
    pub idle_tid: Option<ThreadId>,

    // Scheduling-relevant guest symbols; `None` when the guest lacks them.
    pub guest_yield_enter: Option<u32>,
    pub guest_yield_exit: Option<u32>,
    pub sema_down_enter: Option<u32>,
    pub sema_up_exit: Option<u32>,
    pub cli_enter: Option<u32>,
    pub sti_exit: Option<u32>,
    pub kern_decision_points: Vec<u32>,
    pub user_mutex_lock_enter: Option<u32>,
    pub user_mutex_unlock_exit: Option<u32>,
    pub make_runnable_exit: Option<u32>,
    pub thr_join_exit: Option<u32>,
    pub xbegin_enter: Option<u32>,
    pub xend_enter: Option<u32>,
    pub htm_xbegin: Option<u32>,
    pub htm_xbegin_end: Option<u32>,
}

impl GuestLayout {
    /// Pebbles-style guest: kernel identity-mapped below 16 MB, userspace
    /// paged above it.
    pub fn pebbles() -> Self {
        GuestLayout {
            kind: GuestKind::Pebbles,
            kernel_direct_mapped: true,
            kernel_boundary: 0x0100_0000,
            kernel_below_boundary: true,
            pde_pte_poison: None,
            timer_entry: 0x0010_181e,
            timer_wrap_end: 0x0010_1866,
            init_cr3: None,
            idle_tid: None,
            guest_yield_enter: None,
            guest_yield_exit: None,
            sema_down_enter: None,
            sema_up_exit: None,
            cli_enter: None,
            sti_exit: None,
            kern_decision_points: Vec::new(),
            user_mutex_lock_enter: None,
            user_mutex_unlock_exit: None,
            make_runnable_exit: None,
            thr_join_exit: None,
            xbegin_enter: None,
            xend_enter: None,
            htm_xbegin: None,
            htm_xbegin_end: None,
        }
    }

    /// Pintos-style guest: kernel mapped at 3 GB, paging on before the
    /// checker ever runs.
    pub fn pintos() -> Self {
        GuestLayout {
            kind: GuestKind::Pintos,
            kernel_direct_mapped: false,
            kernel_boundary: 0xc000_0000,
            kernel_below_boundary: false,
            ..Self::pebbles()
        }
    }

    #[inline]
    pub fn kernel_memory(&self, addr: u32) -> bool {
        if self.kernel_below_boundary {
            addr < self.kernel_boundary
        } else {
            addr >= self.kernel_boundary
        }
    }

    #[inline]
    pub fn user_memory(&self, addr: u32) -> bool {
        !self.kernel_memory(addr)
    }

    #[inline]
    pub fn is_pintos(&self) -> bool {
        self.kind == GuestKind::Pintos
    }
}

/// Static checker options, frozen after parse.
#[derive(Clone, Debug)]
pub struct Options {
    pub test_case: String,
    pub verbose: bool,
    pub use_icb: bool,
    pub preempt_everywhere: bool,
    pub pure_happens_before: bool,
    pub testing_userspace: bool,
    pub testing_mutexes: bool,
    pub bug_on_threads_wedged: bool,
    pub filter_drs_by_tid: bool,
    pub dr_pps_respect_within_functions: bool,
    pub trusted_thr_join: bool,
    pub htm: bool,
    pub htm_abort_codes: bool,
    pub htm_dont_retry: bool,
    pub htm_abort_sets: bool,
    pub htm_weak_atomicity: bool,
    /// Thread-library functions whose memory accesses are trusted wholesale.
    pub thrlib_functions: Vec<String>,
    /// Functions whose data races are ignored (but still conflict for DPOR),
    /// with a report budget each.
    pub ignore_dr_functions: Vec<(String, u32)>,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            test_case: String::new(),
            verbose: false,
            use_icb: false,
            preempt_everywhere: false,
            pure_happens_before: false,
            testing_userspace: true,
            testing_mutexes: false,
            bug_on_threads_wedged: true,
            filter_drs_by_tid: true,
            dr_pps_respect_within_functions: false,
            trusted_thr_join: false,
            htm: false,
            htm_abort_codes: false,
            htm_dont_retry: false,
            htm_abort_sets: false,
            htm_weak_atomicity: false,
            thrlib_functions: Vec::new(),
            ignore_dr_functions: Vec::new(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OptionsError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("bad value for {key}: {value:?}")]
    BadValue { key: String, value: String },
}

fn parse_flag(key: &str, value: &str) -> Result<bool, OptionsError> {
    match value {
        "0" => Ok(false),
        "1" => Ok(true),
        _ => Err(OptionsError::BadValue {
            key: key.to_owned(),
            value: value.to_owned(),
        }),
    }
}

impl Options {
    /// Parse the static `KEY=VALUE` config file. Unrecognised keys warn and
    /// are skipped, so newer parents can talk to older checkers.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, OptionsError> {
        Self::from_str_contents(&fs::read_to_string(path)?)
    }

    pub fn from_str_contents(contents: &str) -> Result<Self, OptionsError> {
        let mut opts = Options::default();
        for line in contents.lines() {
            let line = line.trim_end();
            if line.is_empty() {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                match key {
                    "TEST_CASE" => opts.test_case = value.to_owned(),
                    "VERBOSE" => opts.verbose = parse_flag(key, value)?,
                    "ICB" => opts.use_icb = parse_flag(key, value)?,
                    "PREEMPT_EVERYWHERE" => opts.preempt_everywhere = parse_flag(key, value)?,
                    "PURE_HAPPENS_BEFORE" => opts.pure_happens_before = parse_flag(key, value)?,
                    "TESTING_USERSPACE" => opts.testing_userspace = parse_flag(key, value)?,
                    "TESTING_MUTEXES" => opts.testing_mutexes = parse_flag(key, value)?,
                    "BUG_ON_THREADS_WEDGED" => {
                        opts.bug_on_threads_wedged = parse_flag(key, value)?
                    }
                    "FILTER_DRS_BY_TID" => opts.filter_drs_by_tid = parse_flag(key, value)?,
                    "DR_PPS_RESPECT_WITHIN_FUNCTIONS" => {
                        opts.dr_pps_respect_within_functions = parse_flag(key, value)?
                    }
                    "TRUSTED_THR_JOIN" => opts.trusted_thr_join = parse_flag(key, value)?,
                    "HTM" => opts.htm = parse_flag(key, value)?,
                    "HTM_ABORT_CODES" => opts.htm_abort_codes = parse_flag(key, value)?,
                    "HTM_DONT_RETRY" => opts.htm_dont_retry = parse_flag(key, value)?,
                    "HTM_ABORT_SETS" => opts.htm_abort_sets = parse_flag(key, value)?,
                    "HTM_WEAK_ATOMICITY" => opts.htm_weak_atomicity = parse_flag(key, value)?,
                    _ => warn!("unrecognised config key: {line:?}"),
                }
            } else if let Some(name) = line.strip_prefix("thrlib_function ") {
                opts.thrlib_functions.push(name.to_owned());
            } else if let Some(rest) = line.strip_prefix("ignore_dr_function ") {
                let mut parts = rest.split_whitespace();
                match (parts.next(), parts.next().and_then(|n| n.parse().ok())) {
                    (Some(name), Some(budget)) => {
                        opts.ignore_dr_functions.push((name.to_owned(), budget))
                    }
                    _ => {
                        return Err(OptionsError::BadValue {
                            key: "ignore_dr_function".to_owned(),
                            value: rest.to_owned(),
                        });
                    }
                }
            } else {
                warn!("unrecognised config line: {line:?}");
            }
        }
        Ok(opts)
    }

    /// Strong atomicity is the default HTM model; weak is opt-in.
    #[inline]
    pub fn strong_atomicity(&self) -> bool {
        !self.htm_weak_atomicity
    }
}
