/*!
Preemption-point registry (checker side).

Holds the within-function directives and data-race fingerprints that decide
where the arbiter is allowed to preempt. A static set arrives at
construction; a dynamic set is loaded exactly once from the line-oriented
file the parent materialises (which also names the messaging pipes). The
file grammar, one directive per line:

```text
O <pipe_path>                          one-shot; output pipe
I <pipe_path>                          one-shot; input pipe
K <hex_start> <hex_end> <polarity>     kernel within-function
U <hex_start> <hex_end> <polarity>     user within-function
DR <hex_eip> <tid|-1> <hex_last_call> <syscall>
```

Unknown or malformed lines are warned about and skipped, never fatal. The
file is unlinked after a successful load.
*/

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::machine::{Cpu, Reg, WORD_SIZE};
use crate::opts::{GuestKind, GuestLayout, Options};
use crate::sched::{Agent, ThreadId};
use crate::stack::StackTrace;

/// One within-function directive. Polarity `within == true` means the stack
/// must be inside the range to allow a preemption; false means it must not.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PpWithin {
    pub func_start: u32,
    pub func_end: u32,
    pub within: bool,
}

/// Fingerprint of a previously observed data race.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PpDataRace {
    pub eip: u32,
    /// `None` is the wildcard: any thread matches.
    pub tid: Option<ThreadId>,
    /// 0 matches any call site.
    pub last_call: u32,
    pub most_recent_syscall: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum PpLoadError {
    #[error("dynamic preemption points already loaded")]
    AlreadyLoaded,
    #[error("failed to read dynamic pp file: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Clone, Debug, Default)]
pub struct PpRegistry {
    dynamic_loaded: bool,
    kern_withins: Vec<PpWithin>,
    user_withins: Vec<PpWithin>,
    data_races: Vec<PpDataRace>,
    output_pipe: Option<PathBuf>,
    input_pipe: Option<PathBuf>,
}

impl PpRegistry {
    /// Seed the registry from static configuration (e.g. when running
    /// standalone rather than under a fleet parent).
    pub fn init_static(
        opts: &Options,
        kern_withins: Vec<PpWithin>,
        user_withins: Vec<PpWithin>,
        data_races: Vec<PpDataRace>,
    ) -> Self {
        assert!(
            data_races.is_empty() || !opts.preempt_everywhere,
            "data-race PPs are incompatible with preempt-everywhere mode"
        );
        PpRegistry {
            dynamic_loaded: false,
            kern_withins,
            user_withins,
            data_races,
            output_pipe: None,
            input_pipe: None,
        }
    }

    /// Load the dynamic PP file. Idempotence guard: a second call fails
    /// without touching any state.
    pub fn load_dynamic<P: AsRef<Path>>(
        &mut self,
        opts: &Options,
        filename: P,
    ) -> Result<(), PpLoadError> {
        if self.dynamic_loaded {
            return Err(PpLoadError::AlreadyLoaded);
        }
        let filename = filename.as_ref();
        debug!("using dynamic PPs from {}", filename.display());
        let contents = fs::read_to_string(filename)?;
        for line in contents.lines() {
            self.load_line(opts, line.trim_end());
        }

        if let Err(err) = fs::remove_file(filename) {
            warn!("failed rm temp PP file {}: {err}", filename.display());
        }
        self.dynamic_loaded = true;
        Ok(())
    }

    fn load_line(&mut self, opts: &Options, line: &str) {
        let mut parts = line.split_whitespace();
        match parts.next() {
            Some("O") => match (parts.next(), &self.output_pipe) {
                (Some(path), None) => {
                    debug!("output pipe {path}");
                    self.output_pipe = Some(PathBuf::from(path));
                }
                _ => warn!("bad or duplicate output-pipe directive: {line:?}"),
            },
            Some("I") => match (parts.next(), &self.input_pipe) {
                (Some(path), None) => {
                    debug!("input pipe {path}");
                    self.input_pipe = Some(PathBuf::from(path));
                }
                _ => warn!("bad or duplicate input-pipe directive: {line:?}"),
            },
            Some(kind @ ("K" | "U")) => {
                let fields: Option<(u32, u32, i64)> = (|| {
                    let start = u32::from_str_radix(parts.next()?, 16).ok()?;
                    let end = u32::from_str_radix(parts.next()?, 16).ok()?;
                    let polarity = parts.next()?.parse().ok()?;
                    Some((start, end, polarity))
                })();
                match fields {
                    Some((func_start, func_end, polarity)) => {
                        debug!("new PP: {kind} {func_start:x} {func_end:x} {polarity}");
                        let pp = PpWithin {
                            func_start,
                            func_end,
                            within: polarity != 0,
                        };
                        if kind == "K" {
                            self.kern_withins.push(pp);
                        } else {
                            self.user_withins.push(pp);
                        }
                    }
                    None => warn!("malformed within-function directive: {line:?}"),
                }
            }
            Some("DR") => {
                let fields: Option<(u32, i64, u32, u32)> = (|| {
                    let eip = u32::from_str_radix(parts.next()?, 16).ok()?;
                    let tid = parts.next()?.parse().ok()?;
                    let last_call = u32::from_str_radix(parts.next()?, 16).ok()?;
                    let syscall = parts.next()?.parse().ok()?;
                    Some((eip, tid, last_call, syscall))
                })();
                match fields {
                    Some((eip, tid, last_call, most_recent_syscall)) => {
                        assert!(
                            !opts.preempt_everywhere,
                            "data-race PPs are incompatible with preempt-everywhere mode"
                        );
                        debug!("new PP: dr {eip:x} {tid} {last_call:x} {most_recent_syscall}");
                        self.data_races.push(PpDataRace {
                            eip,
                            tid: u32::try_from(tid).ok(),
                            last_call,
                            most_recent_syscall,
                        });
                    }
                    None => warn!("malformed data-race directive: {line:?}"),
                }
            }
            Some(_) => warn!("unrecognized directive in dynamic pp config file: {line:?}"),
            None => {}
        }
    }

    /// Append a fingerprint discovered at runtime (the parent is told about
    /// it separately, via messaging).
    pub fn add_data_race(&mut self, pp: PpDataRace) {
        self.data_races.push(pp);
    }

    /// Append a within-function directive outside the dynamic-file path.
    pub fn add_within(&mut self, kernel: bool, pp: PpWithin) {
        if kernel {
            self.kern_withins.push(pp);
        } else {
            self.user_withins.push(pp);
        }
    }

    /// Pipe names published by the load, for the messaging layer.
    /// Returned as (input, output).
    pub fn pipes(&self) -> (Option<&Path>, Option<&Path>) {
        (self.input_pipe.as_deref(), self.output_pipe.as_deref())
    }

    #[inline]
    pub fn dynamic_loaded(&self) -> bool {
        self.dynamic_loaded
    }

    pub fn check_kern_within(&self, opts: &Options, stack: &StackTrace) -> bool {
        check_withins(opts, &self.kern_withins, stack)
    }

    pub fn check_user_within(&self, opts: &Options, stack: &StackTrace) -> bool {
        check_withins(opts, &self.user_withins, stack)
    }

    /// Does a recorded data-race fingerprint match right here?
    pub fn is_data_race_here(
        &self,
        opts: &Options,
        layout: &GuestLayout,
        eip: u32,
        tid: ThreadId,
        last_call: u32,
        most_recent_syscall: u32,
    ) -> bool {
        self.data_races.iter().any(|pp| {
            if layout.kernel_memory(pp.eip) {
                assert!(
                    layout.kind == GuestKind::Pintos || pp.most_recent_syscall != 0,
                    "kernel data-race fingerprint without a syscall context"
                );
            } else {
                assert!(
                    pp.most_recent_syscall == 0,
                    "user data-race fingerprint with a syscall context"
                );
            }
            pp.eip == eip
                && (!opts.filter_drs_by_tid || pp.tid.is_none() || pp.tid == Some(tid))
                && (pp.last_call == 0 || pp.last_call == last_call)
                && pp.most_recent_syscall == most_recent_syscall
        })
    }
}

/// Ordered within-function evaluation.
///
/// If no directive has `within` polarity the default answer is yes; the
/// first `within` directive encountered flips the scan into whitelist mode.
/// Later directives override earlier ones, so every directive is compared.
/// Under preempt-everywhere only the blacklist directives apply.
fn check_withins(opts: &Options, pps: &[PpWithin], stack: &StackTrace) -> bool {
    let mut any_withins = false;
    let mut answer = true;
    for pp in pps {
        let inside = stack.within_function(pp.func_start, pp.func_end);
        if pp.within {
            if !opts.preempt_everywhere && !any_withins {
                // Switch to whitelist mode.
                any_withins = true;
                answer = false;
            }
            if inside {
                answer = true;
            }
        } else if inside {
            answer = false;
        }
    }
    answer
}

/// Heuristic offset past ebp treated as still part of the current frame
/// (covers a handful of pushed arguments).
const EBP_OFFSET_HEURISTIC: u32 = 0x10;

/// Under preempt-everywhere: flag the current agent if `addr` looks like a
/// shared-memory access (anything clearly outside the current stack frame).
/// False positives only cost extra preemption points that partial-order
/// reduction will discard; false negatives would miss bugs, so the frame
/// judgment leans narrow.
pub fn maybe_preempt_here<C: Cpu>(cpu: &C, opts: &Options, agent: &mut Agent, addr: u32) {
    if !opts.testing_mutexes
        && (agent.action.user_mutex_locking
            || agent.action.user_mutex_unlocking
            || agent.action.kern_mutex_locking
            || agent.action.kern_mutex_unlocking)
    {
        return;
    }
    let esp = cpu.reg(Reg::Esp);
    let ebp = cpu.reg(Reg::Ebp);
    if addr < esp.wrapping_sub(WORD_SIZE) || addr >= ebp.wrapping_add(EBP_OFFSET_HEURISTIC) {
        agent.preempt_for_shm_here = true;
    }
}
