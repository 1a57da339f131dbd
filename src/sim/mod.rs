/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! The simulation engine.
//!
//! One worker thread per simulated CPU, pinned to a physical core where
//! the machine has one to offer. Each cycle a worker locks its own
//! runqueue, pulls, retires or spawns work at random, pushes, then sleeps
//! until the next absolute cycle boundary. A separate checker thread
//! periodically freezes the world — every runqueue lock, taken in CPU
//! order — and validates each runqueue, each global structure, and the
//! coherence between them.
//!
//! Workers synchronise on a start barrier (so nobody simulates against a
//! half-built world) and an end barrier (so nobody tears down a runqueue
//! another CPU might still lock).

use std::fs::File;
use std::io::{BufWriter, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::time::{Duration, Instant};

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::SimConfig;
use crate::discipline::Discipline;
use crate::index::IndexKind;
use crate::key::SchedKey;
use crate::measure::{Measure, MeasureKind};
use crate::params::CHECKER_PERIOD_MS;
use crate::rq::{RqCell, RqError};
use crate::task::Queued;

/// Set from the SIGINT handler; the checker thread notices, dumps the
/// shared structures and exits the process.
pub static SIGINT_REQUESTED: AtomicBool = AtomicBool::new(false);

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum SimError {
    #[error(transparent)]
    Rq(#[from] RqError),

    #[error("failed to spawn a simulation thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("worker thread for cpu {cpu} panicked")]
    WorkerPanic { cpu: usize },
}

// ── Per-CPU accounting ────────────────────────────────────────────────────────

/// Event counters one worker accumulates over its whole run.
#[derive(Clone, Copy, Debug, Default)]
pub struct Counters {
    pub arrivals: usize,
    pub preemptions: usize,
    pub finishes: usize,
    pub early_finishes: usize,
    pub empty_events: usize,
    pub pushes: usize,
    pub pulls: usize,
}

struct WorkerReport {
    cpu: usize,
    counters: Counters,
    measure: Measure,
}

/// What a completed simulation hands back to the caller.
pub struct Summary {
    pub counters: Vec<Counters>,
    pub measures: Vec<Measure>,
    pub checker_passes: usize,
    pub check_failures: usize,
}

// ── Shared context ────────────────────────────────────────────────────────────

struct SimCtx<D: Discipline> {
    cfg: SimConfig,
    seed: u64,
    cells: Vec<Arc<RqCell<D>>>,
    domain: D::Domain,
    next_pid: AtomicU64,
    start_barrier: Barrier,
    end_barrier: Barrier,
    shutdown: AtomicBool,
    check_failures: AtomicUsize,
}

// ── Random operation mix ──────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Op {
    Arrival,
    Finish,
    Nothing,
}

/// 20% chance of a new arrival, 10% of an early completion, 70% of
/// leaving the queue alone this cycle.
fn select_operation(rng: &mut SmallRng) -> Op {
    let p: f64 = rng.gen();
    if p < 0.2 {
        Op::Arrival
    } else if p < 0.3 {
        Op::Finish
    } else {
        Op::Nothing
    }
}

// ── Worker ────────────────────────────────────────────────────────────────────

fn pin_to_core(cpu: usize) {
    match core_affinity::get_core_ids() {
        Some(cores) => match cores.iter().find(|c| c.id == cpu) {
            Some(&core) => {
                if !core_affinity::set_for_current(core) {
                    warn!(cpu, "failed to set worker affinity");
                }
            }
            None => debug!(cpu, "no physical core to pin to, running unpinned"),
        },
        None => warn!(cpu, "cannot enumerate cores, running unpinned"),
    }
}

fn worker<D: Discipline>(ctx: &SimCtx<D>, cpu: usize) -> Result<WorkerReport, SimError> {
    pin_to_core(cpu);

    let mut wm = Measure::new(&ctx.cfg.measures);
    wm.calibrate();
    let mut rng = SmallRng::seed_from_u64(ctx.seed ^ (cpu as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15));
    let mut counters = Counters::default();
    let cell = &ctx.cells[cpu];

    {
        let _rq = cell.lock();
        D::attach(&ctx.domain, cpu);
        cell.set_attached(true);
    }

    ctx.start_barrier.wait();
    debug!(cpu, "simulation start");

    let loop_result = worker_loop(ctx, cpu, &mut rng, &mut wm, &mut counters);

    // detach before the end barrier: our index nodes must read as absent
    // while other CPUs are still migrating
    {
        let _rq = cell.lock();
        D::detach(&ctx.domain, cpu);
        cell.set_attached(false);
    }
    ctx.end_barrier.wait();

    // with everyone past the barrier nobody will lock us again
    let rq_measure = {
        let mut rq = cell.lock();
        cell.set_offline();
        rq.teardown()
    };
    wm.merge(rq_measure);
    debug!(cpu, "simulation end");

    loop_result.map(|()| WorkerReport {
        cpu,
        counters,
        measure: wm,
    })
}

fn worker_loop<D: Discipline>(
    ctx: &SimCtx<D>,
    cpu: usize,
    rng: &mut SmallRng,
    wm: &mut Measure,
    counters: &mut Counters,
) -> Result<(), SimError> {
    let cell = &ctx.cells[cpu];
    let mut clock = 0u64;
    let mut next_wake = Instant::now();

    for _ in 0..ctx.cfg.cycles {
        let t_cycle = wm.begin(MeasureKind::Cycle);
        clock += 1;

        let rq = cell.lock();

        // pre-schedule: steal work published by overloaded CPUs
        let (mut rq, pulled) = D::pull(&ctx.domain, &ctx.cells, cell, rq, wm)?;
        counters.pulls += pulled;

        // retire the running task if it completed
        let finished = rq
            .peek()
            .map(|t| D::task_finished(t, clock))
            .unwrap_or(false);
        if finished {
            rq.take(&ctx.domain)?;
            counters.finishes += 1;
            if !rq.curr_key().is_valid() {
                counters.empty_events += 1;
            }
        }

        match select_operation(rng) {
            Op::Arrival => {
                counters.arrivals += 1;
                let pid = ctx.next_pid.fetch_add(1, Ordering::Relaxed);
                let task = D::spawn_task(rng, clock, &ctx.cfg, pid);
                let new_key = task.key();
                let old_curr = rq.curr_key();
                rq.add(task, &ctx.domain);
                if new_key.preempts(old_curr) {
                    counters.preemptions += 1;
                }
            }
            Op::Finish => {
                if rq.nrunning() > 0 {
                    counters.early_finishes += 1;
                    rq.take(&ctx.domain)?;
                    counters.finishes += 1;
                    if !rq.curr_key().is_valid() {
                        counters.empty_events += 1;
                    }
                }
            }
            Op::Nothing => {}
        }

        // post-schedule: hand surplus work to less loaded CPUs
        let (mut rq, pushed) = D::push(&ctx.domain, &ctx.cells, cell, rq, wm)?;
        counters.pushes += pushed;

        rq.charge_running();
        drop(rq);

        // absolute-deadline pacing on the monotonic clock
        next_wake += ctx.cfg.cycle_len;
        let t_sleep = wm.begin(MeasureKind::Sleep);
        let now = Instant::now();
        if next_wake > now {
            std::thread::sleep(next_wake - now);
        }
        wm.end(MeasureKind::Sleep, t_sleep);

        wm.end(MeasureKind::Cycle, t_cycle);
    }
    Ok(())
}

// ── Checker ───────────────────────────────────────────────────────────────────

fn checker<D: Discipline>(ctx: &SimCtx<D>) -> usize {
    let log_path = ctx.cfg.out_dir.join("error_log.txt");
    let mut log = match File::create(&log_path) {
        Ok(f) => Some(BufWriter::new(f)),
        Err(e) => {
            error!(path = %log_path.display(), error = %e, "cannot open the checker error log");
            None
        }
    };

    let mut passes = 0usize;
    loop {
        std::thread::sleep(Duration::from_millis(CHECKER_PERIOD_MS));

        if SIGINT_REQUESTED.load(Ordering::Relaxed) {
            eprintln!("\nEXITING!");
            eprint!("{}", D::dump(&ctx.domain));
            std::process::exit(1);
        }
        if ctx.shutdown.load(Ordering::Acquire) {
            break;
        }
        if !ctx.cfg.checker {
            continue;
        }
        // a worker is mid-teardown: skip this pass entirely
        if ctx.cells.iter().any(|c| !c.is_online()) {
            continue;
        }

        // freeze the world: every runqueue lock, in CPU order
        let guards: Vec<_> = ctx.cells.iter().map(|c| c.lock()).collect();
        passes += 1;

        let mut failures = Vec::new();
        for guard in &guards {
            if let Err(e) = guard.check() {
                failures.push((e, Some(guard.describe())));
            }
        }
        if let Err(e) = D::check_domain(&ctx.domain, &ctx.cells, &guards) {
            failures.push((e, None));
        }
        drop(guards);

        if failures.is_empty() {
            continue;
        }

        ctx.check_failures.fetch_add(failures.len(), Ordering::Relaxed);
        for (failure, dump) in &failures {
            error!(pass = passes, error = %failure, "checker found an inconsistency");
            if let Some(log) = log.as_mut() {
                let _ = writeln!(log, "***** pass {passes}: {failure} *****");
                if let Some(dump) = dump {
                    let _ = writeln!(log, "{dump}");
                }
            }
        }
        if let Some(log) = log.as_mut() {
            let _ = writeln!(log, "{}", D::dump(&ctx.domain));
            let _ = log.flush();
        }

        if ctx.cfg.exit_on_errors {
            eprint!("{}", D::dump(&ctx.domain));
            error!("stopping on the first checker failure");
            std::process::exit(2);
        }
    }
    passes
}

// ── Entry point ───────────────────────────────────────────────────────────────

/// Run a full simulation with discipline `D` over the index variant
/// `kind`, returning the per-CPU accounting and the checker verdict.
pub fn run<D: Discipline>(cfg: SimConfig, kind: IndexKind) -> Result<Summary, SimError> {
    let seed = cfg.seed.unwrap_or_else(rand::random);
    let nproc = cfg.cpus;
    info!(
        discipline = D::NAME,
        index = kind.label(),
        cpus = nproc,
        cycles = cfg.cycles,
        seed,
        "simulation starting"
    );

    let cells: Vec<Arc<RqCell<D>>> = (0..nproc)
        .map(|cpu| Arc::new(RqCell::new(cpu, Measure::new(&cfg.measures))))
        .collect();
    let domain = D::make_domain(&cfg, kind, nproc, seed);

    let ctx = Arc::new(SimCtx::<D> {
        cfg,
        seed,
        cells,
        domain,
        next_pid: AtomicU64::new(0),
        start_barrier: Barrier::new(nproc),
        end_barrier: Barrier::new(nproc),
        shutdown: AtomicBool::new(false),
        check_failures: AtomicUsize::new(0),
    });

    let checker_handle = {
        let ctx = Arc::clone(&ctx);
        std::thread::Builder::new()
            .name("checker".into())
            .spawn(move || checker::<D>(&ctx))?
    };

    let mut workers = Vec::with_capacity(nproc);
    for cpu in 0..nproc {
        let ctx = Arc::clone(&ctx);
        workers.push(
            std::thread::Builder::new()
                .name(format!("cpu-{cpu}"))
                .spawn(move || worker::<D>(&ctx, cpu))?,
        );
    }

    let mut reports = Vec::with_capacity(nproc);
    let mut first_error: Option<SimError> = None;
    for (cpu, handle) in workers.into_iter().enumerate() {
        match handle.join() {
            Ok(Ok(report)) => reports.push(report),
            Ok(Err(e)) => {
                error!(cpu, error = %e, "worker failed");
                first_error.get_or_insert(e);
            }
            Err(_) => {
                error!(cpu, "worker panicked");
                first_error.get_or_insert(SimError::WorkerPanic { cpu });
            }
        }
    }

    ctx.shutdown.store(true, Ordering::Release);
    let checker_passes = checker_handle.join().unwrap_or_else(|_| {
        error!("checker thread panicked");
        0
    });

    if let Some(e) = first_error {
        return Err(e);
    }

    reports.sort_by_key(|r| r.cpu);
    for report in &reports {
        let c = &report.counters;
        info!(
            cpu = report.cpu,
            arrivals = c.arrivals,
            preemptions = c.preemptions,
            finishes = c.finishes,
            early_finishes = c.early_finishes,
            empty_events = c.empty_events,
            pushes = c.pushes,
            pulls = c.pulls,
            "worker done"
        );
    }

    let check_failures = ctx.check_failures.load(Ordering::Relaxed);
    info!(checker_passes, check_failures, "simulation complete");

    Ok(Summary {
        counters: reports.iter().map(|r| r.counters).collect(),
        measures: reports.into_iter().map(|r| r.measure).collect(),
        checker_passes,
        check_failures,
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edf::Edf;
    use crate::rt::Rt;

    fn tiny_cfg(dir: &std::path::Path) -> SimConfig {
        SimConfig {
            cpus: 3,
            cycles: 50,
            cycle_len: Duration::from_millis(2),
            seed: Some(7),
            out_dir: dir.to_path_buf(),
            ..SimConfig::default()
        }
    }

    fn run_edf(kind: IndexKind) {
        let dir = tempfile::tempdir().unwrap();
        let summary = run::<Edf>(tiny_cfg(dir.path()), kind).unwrap();
        assert_eq!(
            summary.check_failures, 0,
            "checker failures with {}",
            kind.label()
        );
        let arrivals: usize = summary.counters.iter().map(|c| c.arrivals).sum();
        assert!(arrivals > 0, "the operation mix never produced an arrival");
    }

    #[test]
    fn edf_simulation_is_consistent_over_the_heap_index() {
        run_edf(IndexKind::Heap);
    }

    #[test]
    fn edf_simulation_is_consistent_over_the_array_heap_index() {
        run_edf(IndexKind::ArrayHeap);
    }

    #[test]
    fn edf_simulation_is_consistent_over_the_skiplist_index() {
        run_edf(IndexKind::SkipList);
    }

    #[test]
    fn edf_simulation_is_consistent_over_the_fc_skiplist_index() {
        run_edf(IndexKind::FcSkipList);
    }

    #[test]
    fn edf_simulation_is_consistent_over_the_bitmap_index() {
        run_edf(IndexKind::BmFcSkipList);
    }

    #[test]
    fn rt_simulation_keeps_the_root_domain_consistent() {
        let dir = tempfile::tempdir().unwrap();
        let summary = run::<Rt>(tiny_cfg(dir.path()), IndexKind::Heap).unwrap();
        assert_eq!(summary.check_failures, 0);
    }

    #[test]
    fn operation_mix_is_roughly_as_configured() {
        let mut rng = SmallRng::seed_from_u64(3);
        let mut arrivals = 0;
        for _ in 0..10_000 {
            if select_operation(&mut rng) == Op::Arrival {
                arrivals += 1;
            }
        }
        // 20% ± a generous margin
        assert!((1_600..=2_400).contains(&arrivals));
    }
}
