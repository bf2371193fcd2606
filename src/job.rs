/*!
Worker controller: per-job lifecycle on the fleet side.

Each job owns an OS thread that runs the whole lifecycle end to end:
materialise the two config files, serialise through the simulator compile
lock, spawn the simulator child with its stdout/stderr redirected to log
files, pump its messages, wait for it, and clean up. Two cancellation
predicates are checked after taking the compile lock and before spawning:
a bug already found in a subsumed subspace, and the global deadline.

Locking protocol
- `stats`: reader-writer lock; many printers read, the job thread (and
  the message pump) writes.
- `lifecycle` + `done_cvar`/`blocking_cvar`: status transitions are
  NORMAL -> BLOCKED -> NORMAL -> ... -> DONE, DONE terminal. DONE is
  always stored with a broadcast under the lock, so an observer waking
  under the lock sees every prior stats write.
- `compile lock`: process-wide; at most one job builds the simulator at a
  time. A job releases its CPU reservation before blocking on it.

All cancellation is cooperative; a job always reaches DONE.
*/

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock, RwLockReadGuard};
use tracing::{debug, error, info, warn};

use crate::bugs::BugSet;
use crate::messaging::{ChildMessage, JobComms, ParentMessage};
use crate::ppset::PpSet;

static NEXT_JOB_ID: AtomicU32 = AtomicU32::new(0);

/// While several simulators can run at once, building each one from a
/// fresh config is mutually exclusive; released as soon as the child
/// reports it is up and running.
static COMPILE_SIMULATOR_LOCK: Mutex<()> = Mutex::new(());

const NO_CPU: u64 = u64::MAX;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config i/o failed: {0}")]
    Io(#[from] io::Error),
    #[error("incompatible options: {0}")]
    Incompatible(&'static str),
}

/// Fleet-wide options, set once at startup and immutable afterwards.
#[derive(Clone, Debug)]
pub struct JobOptions {
    pub test_name: String,
    pub trace_dir: Option<PathBuf>,
    pub verbose: bool,
    pub leave_logs: bool,
    pub pintos: bool,
    pub pathos: bool,
    pub use_icb: bool,
    pub preempt_everywhere: bool,
    pub pure_happens_before: bool,
    pub transactions: bool,
    pub abort_codes: bool,
    pub dont_retry: bool,
    pub retry_sets: bool,
    pub weak_atomicity: bool,
    pub verif_mode: bool,
    /// Reproduce the historical (unsound) HTM state spaces for the four
    /// tests measured before thread-library trusting existed.
    pub reproduce_legacy_htm_spaces: bool,
    pub simulator_dir: PathBuf,
    pub simulator_prog: String,
    /// How long a spawned child gets to report `alive`.
    pub alive_timeout: Duration,
}

impl Default for JobOptions {
    fn default() -> Self {
        JobOptions {
            test_name: String::new(),
            trace_dir: None,
            verbose: false,
            leave_logs: false,
            pintos: false,
            pathos: false,
            use_icb: false,
            preempt_everywhere: false,
            pure_happens_before: false,
            transactions: false,
            abort_codes: false,
            dont_retry: false,
            retry_sets: false,
            weak_atomicity: false,
            verif_mode: false,
            reproduce_legacy_htm_spaces: false,
            simulator_dir: PathBuf::from("."),
            simulator_prog: "./simulator".to_owned(),
            alive_timeout: Duration::from_secs(10),
        }
    }
}

impl JobOptions {
    /// Reject mutually exclusive combinations before any config is
    /// materialised.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dont_retry && !self.abort_codes {
            return Err(ConfigError::Incompatible(
                "HTM_DONT_RETRY requires HTM_ABORT_CODES",
            ));
        }
        if self.retry_sets && (self.abort_codes || self.dont_retry) {
            return Err(ConfigError::Incompatible(
                "HTM_ABORT_SETS excludes HTM_ABORT_CODES and HTM_DONT_RETRY",
            ));
        }
        if self.weak_atomicity && !self.dont_retry {
            return Err(ConfigError::Incompatible(
                "HTM_WEAK_ATOMICITY requires HTM_DONT_RETRY",
            ));
        }
        if self.transactions && (self.pintos || self.pathos) {
            return Err(ConfigError::Incompatible(
                "HTM mode supports neither pintos nor pathos",
            ));
        }
        if self.pintos && self.pathos {
            return Err(ConfigError::Incompatible("pick one guest kernel"));
        }
        Ok(())
    }
}

/// Global wall-clock budget for the whole fleet.
#[derive(Clone, Debug)]
pub struct Deadline {
    start: Instant,
    limit: Option<Duration>,
}

impl Deadline {
    pub fn new(limit: Option<Duration>) -> Self {
        Deadline {
            start: Instant::now(),
            limit,
        }
    }

    pub fn expired(&self) -> bool {
        self.limit.is_some_and(|limit| self.start.elapsed() >= limit)
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

/// External CPU-reservation facade. A job must release its reservation
/// before blocking on the compile lock, or runnable jobs starve behind it.
pub trait CpuReservation: Send + Sync {
    fn stop_using(&self, cpu: u64);
    fn start_using(&self, cpu: u64);
}

/// Reservation-less default (fleet smaller than the machine).
pub struct NoCpuReservation;

impl CpuReservation for NoCpuReservation {
    fn stop_using(&self, _cpu: u64) {}
    fn start_using(&self, _cpu: u64) {}
}

/// Everything the job threads share.
pub struct FleetShared {
    pub options: JobOptions,
    pub bugs: BugSet,
    pub deadline: Deadline,
    pub cpus: Box<dyn CpuReservation>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum JobStatus {
    Normal,
    Blocked,
    Done,
}

/// A data race the child discovered, to seed deeper-generation jobs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiscoveredPp {
    pub eip: u32,
    pub tid: Option<u32>,
    pub last_call: u32,
    pub most_recent_syscall: u32,
}

impl DiscoveredPp {
    /// Render as a dynamic-config directive.
    pub fn config_str(&self) -> String {
        format!(
            "DR {:x} {} {:x} {}",
            self.eip,
            self.tid.map_or(-1, |t| t as i64),
            self.last_call,
            self.most_recent_syscall
        )
    }
}

#[derive(Debug, Default)]
pub struct JobStats {
    pub elapsed_branches: u32,
    pub estimate_proportion: f64,
    pub estimate_elapsed_usecs: u64,
    pub estimate_eta_usecs: u64,
    pub estimate_eta_numeric: f64,
    pub icb_current_bound: u32,
    pub cancelled: bool,
    pub complete: bool,
    pub timed_out: bool,
    pub need_rerun: bool,
    pub log_filename: Option<PathBuf>,
    pub trace_filename: Option<String>,
    pub fab_timestamp: u64,
    pub fab_cputime: u64,
}

pub struct Job {
    pub id: u32,
    pub config: PpSet,
    pub generation: u32,
    pub should_reproduce: bool,
    stats: RwLock<JobStats>,
    lifecycle: Mutex<JobStatus>,
    done_cvar: Condvar,
    blocking_cvar: Condvar,
    kill: AtomicBool,
    current_cpu: AtomicU64,
    discovered: Mutex<Vec<DiscoveredPp>>,
}

impl Job {
    pub fn new(config: PpSet, should_reproduce: bool) -> Arc<Self> {
        let generation = config.generation();
        Arc::new(Job {
            id: NEXT_JOB_ID.fetch_add(1, Ordering::Relaxed),
            config,
            generation,
            should_reproduce,
            stats: RwLock::new(JobStats::default()),
            lifecycle: Mutex::new(JobStatus::Normal),
            done_cvar: Condvar::new(),
            blocking_cvar: Condvar::new(),
            kill: AtomicBool::new(false),
            current_cpu: AtomicU64::new(NO_CPU),
            discovered: Mutex::new(Vec::new()),
        })
    }

    pub fn stats(&self) -> RwLockReadGuard<'_, JobStats> {
        self.stats.read()
    }

    pub fn status(&self) -> JobStatus {
        *self.lifecycle.lock()
    }

    /// Ask the message pump to relay a kill to the child.
    pub fn kill(&self) {
        self.kill.store(true, Ordering::Relaxed);
    }

    pub fn assign_cpu(&self, cpu: u64) {
        self.current_cpu.store(cpu, Ordering::Relaxed);
    }

    /// Drain the data races the child reported.
    pub fn take_discovered(&self) -> Vec<DiscoveredPp> {
        std::mem::take(&mut *self.discovered.lock())
    }

    // ---------------------------------------------------------------------
    // Lifecycle (see the locking protocol in the module docs)
    // ---------------------------------------------------------------------

    /// Called by the job thread of its own volition: park until a
    /// controller decides this job should run again.
    pub fn job_block(&self) {
        let mut status = self.lifecycle.lock();
        assert_eq!(*status, JobStatus::Normal, "blocking a non-running job");
        *status = JobStatus::Blocked;
        // Tell the workqueue threads to go find something else to do.
        self.done_cvar.notify_all();
        while *status == JobStatus::Blocked {
            self.blocking_cvar.wait(&mut status);
        }
        assert_eq!(*status, JobStatus::Normal, "woke into a weird state");
    }

    /// Block until the job leaves NORMAL. True iff it merely blocked (and
    /// is therefore resumable), false once it is DONE.
    #[must_use]
    pub fn wait_on_job(&self) -> bool {
        let mut status = self.lifecycle.lock();
        while *status == JobStatus::Normal {
            self.done_cvar.wait(&mut status);
        }
        *status == JobStatus::Blocked
    }

    /// Wake a blocked job; should be followed by another `wait_on_job`.
    pub fn resume_job(&self) {
        let mut status = self.lifecycle.lock();
        assert_eq!(*status, JobStatus::Blocked, "resuming a job that isn't blocked");
        *status = JobStatus::Normal;
        self.blocking_cvar.notify_one();
    }

    /// Terminal transition; stats writes must all be complete first.
    fn finish(&self) {
        let mut status = self.lifecycle.lock();
        assert_ne!(*status, JobStatus::Done, "DONE is terminal");
        *status = JobStatus::Done;
        self.done_cvar.notify_all();
    }
}

/// Total order on jobs by numeric ETA; smaller is more promising.
pub fn compare_job_eta(j0: &Job, j1: &Job) -> std::cmp::Ordering {
    let eta0 = j0.stats.read().estimate_eta_numeric;
    let eta1 = j1.stats.read().estimate_eta_numeric;
    eta0.partial_cmp(&eta1).unwrap_or(std::cmp::Ordering::Equal)
}

// ---------------------------------------------------------------------
// Config materialisation
// ---------------------------------------------------------------------

/// Write the static (`KEY=VALUE`) and dynamic (PP directive) config files
/// for one job. `TEST_CASE` must land in the dynamic file before any PP
/// directive, so it goes first.
pub fn materialise_config(
    opts: &JobOptions,
    config: &PpSet,
    stat: &mut impl Write,
    dynamic: &mut impl Write,
) -> Result<(), ConfigError> {
    opts.validate()?;

    let without = if opts.pintos || opts.pathos {
        "without_function"
    } else {
        "without_user_function"
    };
    let mx_lock = if opts.pintos { "sema_down" } else { "mutex_lock" };
    let mx_unlock = if opts.pintos { "sema_up" } else { "mutex_unlock" };

    writeln!(stat, "TEST_CASE={}", opts.test_name)?;
    writeln!(
        stat,
        "VERBOSE={}",
        if opts.preempt_everywhere {
            0
        } else {
            opts.verbose as u32
        }
    )?;
    writeln!(stat, "ICB={}", opts.use_icb as u32)?;
    writeln!(stat, "PREEMPT_EVERYWHERE={}", opts.preempt_everywhere as u32)?;
    writeln!(stat, "PURE_HAPPENS_BEFORE={}", opts.pure_happens_before as u32)?;

    writeln!(dynamic, "TEST_CASE={}", opts.test_name)?;
    writeln!(dynamic, "{without} {mx_lock}")?;
    writeln!(dynamic, "{without} {mx_unlock}")?;
    if opts.pintos {
        writeln!(dynamic, "{without} intr_disable")?;
        writeln!(dynamic, "{without} intr_enable")?;
    } else if opts.pathos {
        writeln!(dynamic, "{without} preempt_disable")?;
        writeln!(dynamic, "{without} preempt_enable")?;
    }

    for pp in config.iter() {
        writeln!(dynamic, "{}", pp.config_str)?;
    }

    if opts.pathos {
        for func in ["smemalign", "sfree", "console_lock", "vm_map", "vm_free"] {
            writeln!(dynamic, "{without} {func}")?;
        }
    } else {
        for func in ["malloc", "realloc", "calloc", "free"] {
            writeln!(dynamic, "{without} {func}")?;
        }
    }

    if opts.pintos {
        // Basecode sema ups/downs, then basecode clis/stis.
        for func in [
            "block_read",
            "block_write",
            "acquire_console",
            "release_console",
            "palloc_get_multiple",
            "serial_putc",
            "vga_putc",
            "is_runqueue",
            "idle",
        ] {
            writeln!(dynamic, "{without} {func}")?;
        }
        if opts.test_name == "alarm-simultaneous" {
            writeln!(dynamic, "{without} child_done")?;
            writeln!(dynamic, "{without} parent_done")?;
        } else if opts.test_name == "priority-donate-multiple" {
            writeln!(dynamic, "{without} thread_create")?;
        }
    } else if opts.test_name == "mutex_test" {
        // Special cased here rather than as a flag, so running this test
        // needs no extra ceremony: ignore the innards of thr_*, and
        // subject the mutex internals themselves to data-race analysis.
        writeln!(stat, "TESTING_MUTEXES=1")?;
        writeln!(stat, "FILTER_DRS_BY_TID=0")?;
        writeln!(stat, "DR_PPS_RESPECT_WITHIN_FUNCTIONS=1")?;
        writeln!(dynamic, "{without} thr_init")?;
        writeln!(dynamic, "{without} thr_create")?;
        writeln!(dynamic, "{without} thr_exit")?;
    } else if opts.test_name == "paraguay" {
        writeln!(dynamic, "{without} thr_init")?;
        writeln!(dynamic, "{without} thr_create")?;
        writeln!(dynamic, "{without} thr_exit")?;
    } else if opts.test_name == "paradise_lost" {
        writeln!(dynamic, "{without} thr_init")?;
        writeln!(dynamic, "{without} thr_create")?;
        writeln!(dynamic, "{without} thr_exit")?;
        // This may look strange, but see the test case.
        writeln!(dynamic, "{without} critical_section")?;
    } else if opts.test_name == "rwlock_write_write_test" {
        writeln!(stat, "FILTER_DRS_BY_TID=0")?;
        writeln!(stat, "DR_PPS_RESPECT_WITHIN_FUNCTIONS=1")?;
        writeln!(dynamic, "{without} thr_init")?;
        writeln!(dynamic, "{without} thr_create")?;
        writeln!(stat, "thrlib_function thr_create")?;
        // This may look strange, but see the test case.
        writeln!(dynamic, "{without} critical_section")?;
    } else if opts.test_name == "rwlock_dont_starve_writers"
        || opts.test_name == "rwlock_dont_starve_readers"
    {
        writeln!(stat, "FILTER_DRS_BY_TID=0")?;
        writeln!(stat, "DR_PPS_RESPECT_WITHIN_FUNCTIONS=1")?;
        writeln!(dynamic, "{without} thr_init")?;
        writeln!(dynamic, "{without} thr_create")?;
        writeln!(stat, "thrlib_function thr_create")?;
        writeln!(dynamic, "{without} signal_release_ok")?;
        writeln!(dynamic, "{without} wait_release_ok")?;
        writeln!(dynamic, "{without} cond_wait")?;
        writeln!(dynamic, "{without} cond_signal")?;
        writeln!(dynamic, "{without} cond_broadcast")?;
    } else if opts.test_name.starts_with("atomic_") {
        // Atomic-operations tests bypass thr_exit/thr_join with vanish
        // directly, so only the creation side is trusted.
        writeln!(stat, "FILTER_DRS_BY_TID=0")?;
        writeln!(dynamic, "{without} thr_init")?;
        writeln!(dynamic, "{without} thr_create")?;
        writeln!(stat, "thrlib_function thr_create")?;
        for func in [
            "cond_wait",
            "cond_signal",
            "cond_broadcast",
            "cond_init",
            "cond_destroy",
            "mutex_lock",
            "mutex_unlock",
            "mutex_init",
            "mutex_destroy",
            "sem_wait",
            "sem_signal",
            "sem_init",
            "sem_destroy",
        ] {
            writeln!(stat, "thrlib_function {func}")?;
        }
    } else if opts.transactions {
        writeln!(stat, "HTM=1")?;
        writeln!(stat, "FILTER_DRS_BY_TID=0")?;
        if opts.abort_codes {
            writeln!(stat, "HTM_ABORT_CODES=1")?;
        }
        if opts.dont_retry {
            writeln!(stat, "HTM_DONT_RETRY=1")?;
        }
        if opts.retry_sets {
            writeln!(stat, "HTM_ABORT_SETS=1")?;
        }
        if opts.weak_atomicity {
            writeln!(stat, "HTM_WEAK_ATOMICITY=1")?;
        }
        let legacy_htm_test = matches!(
            opts.test_name.as_str(),
            "htm1" | "htm2" | "counter" | "swapbug"
        );
        if opts.reproduce_legacy_htm_spaces && legacy_htm_test {
            // These four tests were measured before the ignore-thrlib
            // feature existed; reproducing those numbers means ignoring
            // their DRs while still counting them as conflicts.
            for func in [
                "thr_create",
                "thr_exit",
                "thr_join",
                "thr_bottom",
                "thr_bottom1",
                "wakeup_thread",
                "remove_thread",
                "cond_wait",
            ] {
                writeln!(stat, "ignore_dr_function {func} 1")?;
            }
        } else {
            // Ignore all the thread library's accesses, even for DPOR.
            writeln!(stat, "TRUSTED_THR_JOIN=1")?;
            for func in [
                "thr_create",
                "thr_exit",
                "thr_join",
                "cond_wait",
                "cond_signal",
                "cond_broadcast",
                "cond_init",
                "cond_destroy",
                "mutex_lock",
                "mutex_unlock",
                "mutex_init",
                "mutex_destroy",
                "sem_wait",
                "sem_signal",
                "sem_init",
                "sem_destroy",
                "thr_bottom",
                "thr_bottom1",
                "thr_getid",
                "get_stack",
                "remove_thread",
                "new_thread",
                "get_thread",
                "child_swexn_init",
                "wakeup_thread",
                "atomic_fetch_add",
                "remove_pages_and_vanish",
                "thr_spawn",
            ] {
                writeln!(stat, "thrlib_function {func}")?;
            }
        }
        // Don't preempt on mutex use arising from the thrlib. (All child
        // thread logic is "within" thr_bottom, so that one stays.)
        writeln!(dynamic, "{without} thr_init")?;
        writeln!(dynamic, "{without} thr_create")?;
        writeln!(dynamic, "{without} thr_exit")?;
        writeln!(dynamic, "{without} thr_join")?;
        writeln!(dynamic, "{without} thr_bottom1")?;
        if opts.test_name == "htm_spinlock" || opts.test_name == "htm_mutex" {
            // Like paradise lost, see the test case.
            writeln!(stat, "ignore_dr_function critical_section 1")?;
        }
    }

    if opts.preempt_everywhere {
        writeln!(stat, "DR_PPS_RESPECT_WITHIN_FUNCTIONS=1")?;
        if opts.pintos {
            // Manually approved shared-memory accesses.
            writeln!(dynamic, "{without} intr_get_level")?;
            writeln!(dynamic, "{without} intr_context")?;
        } else {
            // Known offender to the ">= ebp+0x10" stack-frame heuristic.
            writeln!(dynamic, "{without} _doprnt")?;
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------
// The job thread
// ---------------------------------------------------------------------

fn scratch_file(dir: &Path, prefix: &str) -> io::Result<(File, PathBuf)> {
    tempfile::Builder::new()
        .prefix(prefix)
        .tempfile_in(dir)?
        .keep()
        .map_err(|e| e.error)
}

fn delete_file(path: &Path) {
    if let Err(err) = fs::remove_file(path) {
        warn!("failed to remove {}: {err}", path.display());
    }
}

/// Spawn the job thread.
pub fn start_job(shared: Arc<FleetShared>, job: Arc<Job>) -> thread::JoinHandle<()> {
    thread::spawn(move || run_job(&shared, &job))
}

/// The whole lifecycle, start to DONE.
pub fn run_job(shared: &FleetShared, job: &Job) {
    if let Err(err) = try_run_job(shared, job) {
        // Setup failures (scratch files, fifos) are logged, never thrown;
        // the job still reaches DONE so nobody waits forever.
        error!("[JOB {}] setup failed: {err}", job.id);
        let mut stats = job.stats.write();
        stats.complete = true;
        stats.cancelled = true;
        drop(stats);
        job.finish();
    }
}

fn try_run_job(shared: &FleetShared, job: &Job) -> io::Result<()> {
    let opts = &shared.options;
    let log_dir = opts.trace_dir.as_deref().unwrap_or(&opts.simulator_dir);

    let (mut config_static, static_path) =
        scratch_file(&opts.simulator_dir, "config.interlace.")?;
    let (mut config_dynamic, dynamic_path) = scratch_file(&opts.simulator_dir, "pps.interlace.")?;
    let (log_stdout, stdout_path) = scratch_file(log_dir, "sim-setup.log.")?;
    let (log_stderr, stderr_path) = scratch_file(log_dir, "sim-output.log.")?;

    if let Err(err) = materialise_config(opts, &job.config, &mut config_static, &mut config_dynamic)
    {
        error!("[JOB {}] bad config: {err}", job.id);
        for path in [&static_path, &dynamic_path, &stdout_path, &stderr_path] {
            delete_file(path);
        }
        let mut stats = job.stats.write();
        stats.complete = true;
        stats.cancelled = true;
        drop(stats);
        job.finish();
        return Ok(());
    }

    let mut comms = JobComms::init(&mut config_dynamic, &opts.simulator_dir, job.id)
        .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?;
    config_static.flush()?;
    config_dynamic.flush()?;
    drop(config_static);
    drop(config_dynamic);

    // Building the simulator is non-reentrant; hand the CPU back while we
    // queue for the build so runnable jobs aren't starved.
    let cpu = job.current_cpu.load(Ordering::Relaxed);
    if cpu != NO_CPU {
        shared.cpus.stop_using(cpu);
    }
    let compile_guard = COMPILE_SIMULATOR_LOCK.lock();
    if cpu != NO_CPU {
        shared.cpus.start_using(cpu);
    }

    let bug_in_subspace = shared.bugs.already_found(&job.config);
    let too_late = shared.deadline.expired();
    if bug_in_subspace || too_late {
        debug!(
            "[JOB {}] {}; aborting compilation.",
            job.id,
            if bug_in_subspace {
                "bug already found"
            } else {
                "time ran out"
            }
        );
        drop(compile_guard);
        comms.abort();
        for path in [&static_path, &dynamic_path, &stdout_path, &stderr_path] {
            delete_file(path);
        }
        let mut stats = job.stats.write();
        stats.complete = true;
        stats.cancelled = bug_in_subspace;
        drop(stats);
        job.finish();
        return Ok(());
    }

    {
        let mut stats = job.stats.write();
        stats.log_filename = Some(stderr_path.clone());
        stats.need_rerun = false;
    }

    debug!(
        "[JOB {}] '{} {} {} > {} 2> {}'",
        job.id,
        opts.simulator_prog,
        static_path.display(),
        dynamic_path.display(),
        stdout_path.display(),
        stderr_path.display()
    );
    let mut child = match Command::new(&opts.simulator_prog)
        .arg(&static_path)
        .arg(&dynamic_path)
        .current_dir(&opts.simulator_dir)
        .stdout(Stdio::from(log_stdout))
        .stderr(Stdio::from(log_stderr))
        .spawn()
    {
        Ok(child) => Some(child),
        Err(err) => {
            error!("[JOB {}] failed to exec the simulator: {err}", job.id);
            None
        }
    };

    // Should take a few seconds at most for the child to come alive.
    let child_alive = child.is_some() && comms.wait_for_child(opts.alive_timeout);
    drop(compile_guard);

    if child_alive {
        // May take as long as the state space is large.
        talk_to_child(&mut comms, shared, job);
    } else if child.is_some() {
        error!("[JOB {}] there was a problem setting up the simulator.", job.id);
        error!(
            "[JOB {}] for details see {} and {}",
            job.id,
            stdout_path.display(),
            stderr_path.display()
        );
    }

    let exited_clean = match child.as_mut() {
        Some(child) => {
            let status = child.wait()?;
            debug!("[JOB {}] simulator exited with {status}", job.id);
            status.success()
        }
        None => false,
    };

    comms.finish();

    delete_file(&static_path);
    delete_file(&dynamic_path);
    let delete_logs = !opts.leave_logs && exited_clean;
    if delete_logs {
        delete_file(&stdout_path);
        delete_file(&stderr_path);
    }

    let mut stats = job.stats.write();
    stats.complete = true;
    if stats.need_rerun {
        stats.cancelled = true;
    }
    if delete_logs {
        stats.log_filename = None;
    }
    drop(stats);
    job.finish();
    Ok(())
}

/// Pump child messages until it exits (or we tell it to).
fn talk_to_child(comms: &mut JobComms, shared: &FleetShared, job: &Job) {
    let mut die_sent = false;
    loop {
        if (job.kill.load(Ordering::Relaxed) || shared.deadline.expired()) && !die_sent {
            if comms.send(&ParentMessage::PleaseDie).is_ok() {
                die_sent = true;
            }
        }
        match comms.recv(Duration::from_millis(100)) {
            Ok(ChildMessage::Alive) => {}
            Ok(ChildMessage::Progress {
                branches,
                proportion,
                elapsed_usecs,
                eta_usecs,
                icb_bound,
            }) => {
                let mut stats = job.stats.write();
                stats.elapsed_branches = branches;
                stats.estimate_proportion = proportion;
                stats.estimate_elapsed_usecs = elapsed_usecs;
                stats.estimate_eta_usecs = eta_usecs;
                stats.estimate_eta_numeric = eta_usecs as f64;
                stats.icb_current_bound = icb_bound;
            }
            Ok(ChildMessage::PpDiscovered {
                eip,
                tid,
                last_call,
                most_recent_syscall,
            }) => {
                info!("[JOB {}] child discovered a data race at {eip:#x}", job.id);
                job.discovered.lock().push(DiscoveredPp {
                    eip,
                    tid,
                    last_call,
                    most_recent_syscall,
                });
            }
            Ok(ChildMessage::BugFound {
                trace_path,
                fab_timestamp,
                fab_cputime,
            }) => {
                shared.bugs.publish(&job.config);
                let mut stats = job.stats.write();
                stats.trace_filename = Some(trace_path);
                stats.fab_timestamp = fab_timestamp;
                stats.fab_cputime = fab_cputime;
            }
            Ok(ChildMessage::TimedOut) => {
                job.stats.write().timed_out = true;
            }
            Ok(ChildMessage::NeedRerun) => {
                job.stats.write().need_rerun = true;
            }
            Ok(ChildMessage::Exiting) => break,
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

/// One user-facing outcome line per job (red bug, yellow timeout, green
/// complete), kept deliberately plain.
pub fn print_job_outcome(opts: &JobOptions, job: &Job) {
    let stats = job.stats.read();
    if stats.cancelled && !opts.verbose {
        return;
    }
    let outcome = if stats.cancelled {
        format!(
            "CANCELLED{}",
            if stats.need_rerun { " (need rerun)" } else { "" }
        )
    } else if let Some(trace) = &stats.trace_filename {
        format!(
            "BUG FOUND: {trace} ({} interleaving{} tested)",
            stats.elapsed_branches,
            if stats.elapsed_branches == 1 { "" } else { "s" }
        )
    } else if stats.timed_out {
        format!(
            "TIMED OUT ({:.1}%; ETA {}s)",
            stats.estimate_proportion * 100.0,
            stats.estimate_eta_usecs / 1_000_000
        )
    } else if stats.complete {
        format!(
            "COMPLETE ({} interleaving{} tested)",
            stats.elapsed_branches,
            if stats.elapsed_branches == 1 { "" } else { "s" }
        )
    } else {
        "Running...".to_owned()
    };
    println!("[JOB {}] {outcome}", job.id);
    if let Some(log) = &stats.log_filename {
        println!("        Log: {}", log.display());
    }
    println!("        PPs: {}", job.config);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ppset::PpInterner;

    fn opts_for(test_name: &str) -> JobOptions {
        JobOptions {
            test_name: test_name.to_owned(),
            ..JobOptions::default()
        }
    }

    fn materialise(opts: &JobOptions, config: &PpSet) -> (String, String) {
        let mut stat = Vec::new();
        let mut dynamic = Vec::new();
        materialise_config(opts, config, &mut stat, &mut dynamic).unwrap();
        (
            String::from_utf8(stat).unwrap(),
            String::from_utf8(dynamic).unwrap(),
        )
    }

    #[test]
    fn htm_option_exclusivity() {
        let mut opts = opts_for("htm1");
        opts.transactions = true;
        opts.dont_retry = true;
        assert!(matches!(opts.validate(), Err(ConfigError::Incompatible(_))));
        opts.abort_codes = true;
        assert!(opts.validate().is_ok());
        opts.retry_sets = true;
        assert!(opts.validate().is_err());
        opts.retry_sets = false;
        opts.weak_atomicity = true;
        assert!(opts.validate().is_ok());
        opts.dont_retry = false;
        opts.weak_atomicity = true;
        assert!(opts.validate().is_err());

        let mut opts = opts_for("anything");
        opts.transactions = true;
        opts.pintos = true;
        assert!(opts.validate().is_err());
    }

    #[test]
    fn mutex_test_config_special_cases() {
        let (stat, dynamic) = materialise(&opts_for("mutex_test"), &PpSet::empty());
        assert!(stat.contains("TESTING_MUTEXES=1\n"));
        assert!(stat.contains("FILTER_DRS_BY_TID=0\n"));
        assert!(stat.contains("DR_PPS_RESPECT_WITHIN_FUNCTIONS=1\n"));
        assert!(dynamic.contains("without_user_function thr_init\n"));
        assert!(dynamic.contains("without_user_function thr_create\n"));
        assert!(dynamic.contains("without_user_function thr_exit\n"));
        assert!(dynamic.contains("without_user_function mutex_lock\n"));
        assert!(dynamic.contains("without_user_function mutex_unlock\n"));
        // TEST_CASE precedes every PP directive in the dynamic file.
        assert!(dynamic.starts_with("TEST_CASE=mutex_test\n"));
    }

    #[test]
    fn pintos_alarm_test_config() {
        let mut opts = opts_for("alarm-simultaneous");
        opts.pintos = true;
        let (_, dynamic) = materialise(&opts, &PpSet::empty());
        for func in [
            "sema_down",
            "sema_up",
            "intr_disable",
            "intr_enable",
            "block_read",
            "block_write",
            "child_done",
            "parent_done",
        ] {
            assert!(
                dynamic.contains(&format!("without_function {func}\n")),
                "missing {func} in:\n{dynamic}"
            );
        }
    }

    #[test]
    fn pp_set_directives_land_in_dynamic_config() {
        let interner = PpInterner::new();
        let set = PpSet::empty()
            .with(interner.intern("DR deadbeef -1 0 0", 1))
            .with(interner.intern("K 100 200 1", 0));
        let (_, dynamic) = materialise(&opts_for("thr_exit_join"), &set);
        assert!(dynamic.contains("DR deadbeef -1 0 0\n"));
        assert!(dynamic.contains("K 100 200 1\n"));
        let test_case_pos = dynamic.find("TEST_CASE=").unwrap();
        let first_pp_pos = dynamic.find("DR deadbeef").unwrap();
        assert!(test_case_pos < first_pp_pos);
    }

    #[test]
    fn htm_trusted_thrlib_vs_legacy_reproduction() {
        let mut opts = opts_for("htm2");
        opts.transactions = true;
        let (stat, dynamic) = materialise(&opts, &PpSet::empty());
        assert!(stat.contains("HTM=1\n"));
        assert!(stat.contains("TRUSTED_THR_JOIN=1\n"));
        assert!(stat.contains("thrlib_function thr_join\n"));
        assert!(dynamic.contains("without_user_function thr_join\n"));
        // The historical mode swaps the whitelist for ignore-DR lines.
        opts.reproduce_legacy_htm_spaces = true;
        let (stat, _) = materialise(&opts, &PpSet::empty());
        assert!(!stat.contains("TRUSTED_THR_JOIN=1\n"));
        assert!(stat.contains("ignore_dr_function thr_join 1\n"));
    }

    #[test]
    fn job_lifecycle_block_resume_done() {
        let job = Job::new(PpSet::empty(), false);
        let worker = {
            let job = Arc::clone(&job);
            thread::spawn(move || {
                job.job_block();
                // Resumed; pretend to work, then finish.
                job.stats.write().complete = true;
                job.finish();
            })
        };
        // The worker blocks itself: wait_on_job sees BLOCKED (resumable).
        assert!(job.wait_on_job());
        job.resume_job();
        // Next wait observes the terminal DONE.
        assert!(!job.wait_on_job());
        assert_eq!(job.status(), JobStatus::Done);
        assert!(job.stats().complete);
        worker.join().unwrap();
    }

    #[test]
    fn eta_ordering() {
        let j0 = Job::new(PpSet::empty(), false);
        let j1 = Job::new(PpSet::empty(), false);
        j0.stats.write().estimate_eta_numeric = 10.0;
        j1.stats.write().estimate_eta_numeric = 20.0;
        assert_eq!(compare_job_eta(&j0, &j1), std::cmp::Ordering::Less);
        assert_eq!(compare_job_eta(&j1, &j0), std::cmp::Ordering::Greater);
        j1.stats.write().estimate_eta_numeric = 10.0;
        assert_eq!(compare_job_eta(&j0, &j1), std::cmp::Ordering::Equal);
    }

    fn shared_with(opts: JobOptions, deadline: Deadline) -> Arc<FleetShared> {
        Arc::new(FleetShared {
            options: opts,
            bugs: BugSet::new(),
            deadline,
            cpus: Box::new(NoCpuReservation),
        })
    }

    #[test]
    fn bug_in_subspace_cancels_before_fork() {
        let dir = tempfile::tempdir().unwrap();
        let opts = JobOptions {
            test_name: "mutex_test".to_owned(),
            simulator_dir: dir.path().to_path_buf(),
            simulator_prog: "./definitely-not-a-simulator".to_owned(),
            alive_timeout: Duration::from_millis(100),
            ..JobOptions::default()
        };
        let shared = shared_with(opts, Deadline::new(None));

        let interner = PpInterner::new();
        let p1 = interner.intern("DR 100 -1 0 0", 0);
        let p2 = interner.intern("DR 200 -1 0 0", 0);
        let p3 = interner.intern("DR 300 -1 0 0", 1);
        let found_in = PpSet::empty().with(p1.clone()).with(p2.clone());
        shared.bugs.publish(&found_in);

        // This job's subspace {p1,p2,p3} is subsumed: abort pre-fork.
        let job = Job::new(found_in.with(p3), false);
        run_job(&shared, &job);

        assert_eq!(job.status(), JobStatus::Done);
        let stats = job.stats();
        assert!(stats.complete);
        assert!(stats.cancelled);
        assert!(stats.trace_filename.is_none());
        // Every scratch file was deleted.
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn deadline_elapsed_cancels_without_blame() {
        let dir = tempfile::tempdir().unwrap();
        let opts = JobOptions {
            test_name: "mutex_test".to_owned(),
            simulator_dir: dir.path().to_path_buf(),
            simulator_prog: "./definitely-not-a-simulator".to_owned(),
            alive_timeout: Duration::from_millis(100),
            ..JobOptions::default()
        };
        let shared = shared_with(opts, Deadline::new(Some(Duration::ZERO)));
        let job = Job::new(PpSet::empty(), false);
        run_job(&shared, &job);

        assert_eq!(job.status(), JobStatus::Done);
        let stats = job.stats();
        assert!(stats.complete);
        assert!(!stats.cancelled);
        assert!(stats.trace_filename.is_none());
    }

    #[test]
    fn failed_exec_retains_logs_and_completes() {
        let dir = tempfile::tempdir().unwrap();
        let logs = tempfile::tempdir().unwrap();
        let opts = JobOptions {
            test_name: "paraguay".to_owned(),
            trace_dir: Some(logs.path().to_path_buf()),
            simulator_dir: dir.path().to_path_buf(),
            simulator_prog: "./definitely-not-a-simulator".to_owned(),
            alive_timeout: Duration::from_millis(100),
            ..JobOptions::default()
        };
        let shared = shared_with(opts, Deadline::new(None));
        let job = Job::new(PpSet::empty(), false);
        run_job(&shared, &job);

        assert_eq!(job.status(), JobStatus::Done);
        let stats = job.stats();
        assert!(stats.complete);
        assert!(!stats.cancelled);
        // The child never ran cleanly, so both logs survive.
        assert_eq!(fs::read_dir(logs.path()).unwrap().count(), 2);
        // Config files and fifos are gone regardless.
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
