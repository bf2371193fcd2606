use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use interlace::bugs::BugSet;
use interlace::job::{self, Deadline, FleetShared, Job, JobOptions, NoCpuReservation};
use interlace::ppset::{PpInterner, PpSet};

/// Cap on jobs bred from discovered data races, so a chatty child can't
/// snowball the queue forever.
const DEFAULT_JOB_CAP: usize = 256;

fn usage() -> ! {
    eprintln!(
        "usage: interlace <test_name> [--sim <prog>] [--sim-dir <dir>] [--trace-dir <dir>]\n\
         \t[--time <secs>] [--jobs <n>] [--cap <n>] [--pintos | --pathos]\n\
         \t[--icb] [--verbose] [--leave-logs] [--preempt-everywhere] [--pure-hb]\n\
         \t[--htm] [--abort-codes] [--dont-retry] [--retry-sets] [--weak-atomicity]\n\
         \t[--legacy-htm-spaces] [--verif]"
    );
    std::process::exit(2);
}

fn parse_args() -> Result<(JobOptions, Option<Duration>, usize, usize)> {
    let mut args = std::env::args().skip(1);
    let mut opts = JobOptions::default();
    let mut time_limit = None;
    let mut max_parallel = thread::available_parallelism().map_or(1, |n| n.get());
    let mut job_cap = DEFAULT_JOB_CAP;

    let Some(test_name) = args.next() else { usage() };
    if test_name.starts_with('-') {
        usage();
    }
    opts.test_name = test_name;

    while let Some(arg) = args.next() {
        let mut value = || args.next().with_context(|| format!("{arg} needs a value"));
        match arg.as_str() {
            "--sim" => opts.simulator_prog = value()?,
            "--sim-dir" => opts.simulator_dir = PathBuf::from(value()?),
            "--trace-dir" => opts.trace_dir = Some(PathBuf::from(value()?)),
            "--time" => time_limit = Some(Duration::from_secs(value()?.parse()?)),
            "--jobs" => max_parallel = value()?.parse()?,
            "--cap" => job_cap = value()?.parse()?,
            "--pintos" => opts.pintos = true,
            "--pathos" => opts.pathos = true,
            "--icb" => opts.use_icb = true,
            "--verbose" => opts.verbose = true,
            "--leave-logs" => opts.leave_logs = true,
            "--preempt-everywhere" => opts.preempt_everywhere = true,
            "--pure-hb" => opts.pure_happens_before = true,
            "--htm" => opts.transactions = true,
            "--abort-codes" => opts.abort_codes = true,
            "--dont-retry" => opts.dont_retry = true,
            "--retry-sets" => opts.retry_sets = true,
            "--weak-atomicity" => opts.weak_atomicity = true,
            "--legacy-htm-spaces" => opts.reproduce_legacy_htm_spaces = true,
            "--verif" => opts.verif_mode = true,
            _ => usage(),
        }
    }
    if max_parallel == 0 {
        bail!("--jobs must be at least 1");
    }
    Ok((opts, time_limit, max_parallel, job_cap))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let (options, time_limit, max_parallel, job_cap) = parse_args()?;
    options.validate().context("rejected option combination")?;

    let shared = Arc::new(FleetShared {
        options,
        bugs: BugSet::new(),
        deadline: Deadline::new(time_limit),
        cpus: Box::new(NoCpuReservation),
    });
    let interner = PpInterner::new();

    // Generation 0: the base preemption points only (the mutex lock/unlock
    // lines every dynamic config carries). Deeper generations come from
    // data races the children report.
    let mut pending: VecDeque<Arc<Job>> = VecDeque::new();
    pending.push_back(Job::new(PpSet::empty(), false));
    let mut spawned_total = 1usize;
    let mut completed = 0usize;

    let mut running: VecDeque<(Arc<Job>, thread::JoinHandle<()>)> = VecDeque::new();
    while !pending.is_empty() || !running.is_empty() {
        while running.len() < max_parallel {
            let Some(next) = pending.pop_front() else { break };
            let handle = job::start_job(Arc::clone(&shared), Arc::clone(&next));
            running.push_back((next, handle));
        }

        // Ride the most promising runner (smallest ETA) to completion.
        let idx = (0..running.len())
            .min_by(|&a, &b| job::compare_job_eta(&running[a].0, &running[b].0))
            .unwrap_or(0);
        let (current, handle) = running.remove(idx).expect("nothing running");
        // A self-blocked job has nothing better to yield to in this fleet;
        // resume it straight away.
        while current.wait_on_job() {
            current.resume_job();
        }
        handle.join().ok();
        completed += 1;
        job::print_job_outcome(&shared.options, &current);

        // Breed deeper-generation jobs from the data races it discovered.
        for dr in current.take_discovered() {
            if shared.deadline.expired() || spawned_total >= job_cap {
                break;
            }
            let pp = interner.intern(&dr.config_str(), current.generation + 1);
            if current.config.contains(&pp) {
                continue;
            }
            let config = current.config.with(pp);
            if shared.bugs.already_found(&config) {
                continue;
            }
            pending.push_back(Job::new(config, false));
            spawned_total += 1;
        }
    }

    println!(
        "{completed} job{} completed; {} bug subspace{} recorded; {:?} elapsed",
        if completed == 1 { "" } else { "s" },
        shared.bugs.count(),
        if shared.bugs.count() == 1 { "" } else { "s" },
        shared.deadline.elapsed()
    );
    Ok(())
}
