/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Earliest-deadline-first discipline.
//!
//! Both migration directions are driven by the global indexes: the push
//! index (latest-first over running keys, idle CPUs ranking first) names
//! the most preemptable destination, the pull index (earliest-first over
//! queued keys) names the most urgent source. A CPU stays present in the
//! push index for its whole attached life — an idle queue publishes the
//! reserved idle key rather than withdrawing, because an idle CPU is the
//! best destination a push can hope for. The pull index only ever carries
//! valid queued keys.

use std::sync::Arc;

use parking_lot::MutexGuard;
use rand::rngs::SmallRng;
use rand::Rng;
use tracing::warn;

use crate::check::CheckError;
use crate::config::SimConfig;
use crate::discipline::Discipline;
use crate::index::{format_entries, CpuIndex, IndexKind};
use crate::key::{KeyOrder, SchedKey, IDLE_KEY};
use crate::measure::{Measure, MeasureKind};
use crate::params::{PULL_MAX_TRIES, PUSH_MAX_TRIES};
use crate::rq::{double_lock, RqCell, RqError, RunQueue};
use crate::task::{DlTask, Queued};

pub struct Edf;

pub struct EdfDomain {
    pub push: Box<dyn CpuIndex>,
    pub pull: Box<dyn CpuIndex>,
}

impl Discipline for Edf {
    type Key = u64;
    type Task = DlTask;
    type Domain = EdfDomain;

    const NAME: &'static str = "deadline";
    const RUNNING_PUBLISH_KIND: Option<MeasureKind> = Some(MeasureKind::PushPreempt);
    const NEXT_PUBLISH_KIND: Option<MeasureKind> = Some(MeasureKind::PullPreempt);

    fn make_domain(cfg: &SimConfig, kind: IndexKind, nproc: usize, seed: u64) -> EdfDomain {
        EdfDomain {
            push: kind.build(nproc, KeyOrder::LatestFirst, seed, cfg.bm_slots()),
            pull: kind.build(nproc, KeyOrder::EarliestFirst, seed ^ 1, cfg.bm_slots()),
        }
    }

    fn spawn_task(rng: &mut SmallRng, clock: u64, cfg: &SimConfig, pid: u64) -> Box<DlTask> {
        let deadline = clock + rng.gen_range(cfg.dmin..cfg.dmax);
        Box::new(DlTask::new(pid, deadline))
    }

    /// A task whose absolute deadline has passed is treated as complete.
    fn task_finished(task: &DlTask, clock: u64) -> bool {
        crate::key::dl_time_before(task.deadline, clock)
    }

    fn charge_tick(_task: &mut DlTask) {}

    fn publish_running(dom: &EdfDomain, cpu: usize, key: u64) {
        // stay present while attached; an idle queue publishes IDLE_KEY
        dom.push.preempt(cpu, key, true);
    }

    fn publish_next(dom: &EdfDomain, cpu: usize, key: u64) {
        dom.pull.preempt(cpu, key, key != IDLE_KEY);
    }

    fn overload_changed(_dom: &EdfDomain, _cpu: usize, _overloaded: bool) {}

    fn attach(dom: &EdfDomain, cpu: usize) {
        dom.push.preempt(cpu, IDLE_KEY, true);
        dom.pull.preempt(cpu, IDLE_KEY, false);
    }

    fn detach(dom: &EdfDomain, cpu: usize) {
        dom.pull.preempt(cpu, IDLE_KEY, false);
        dom.push.preempt(cpu, IDLE_KEY, false);
    }

    // ── Pull ──────────────────────────────────────────────────────────────────

    /// Ask the pull index for the most urgent queued task elsewhere and
    /// steal it. One task per invocation; bounded retries absorb the
    /// window between `find` and the double lock.
    fn pull<'a>(
        dom: &EdfDomain,
        cells: &'a [Arc<RqCell<Self>>],
        this: &'a RqCell<Self>,
        mut guard: MutexGuard<'a, RunQueue<Self>>,
        wm: &mut Measure,
    ) -> Result<(MutexGuard<'a, RunQueue<Self>>, usize), RqError> {
        for _ in 0..PULL_MAX_TRIES {
            let t0 = wm.begin(MeasureKind::PullFind);
            let found = dom.pull.find(this.cpu());
            wm.end(MeasureKind::PullFind, t0);
            wm.outcome(MeasureKind::PullFind, found.is_some());

            let Some(cpu) = found else { break };
            if cpu == this.cpu() {
                break;
            }

            let src = &cells[cpu];
            let (g, mut src_guard) = double_lock(this, src, guard);
            guard = g;

            // the index answer is stale by now: the source must still be
            // overloaded and its best queued task must beat ours
            if src_guard.nrunning() >= 2 {
                let candidate = src_guard.peek_next().map(|t| t.key());
                let wins = candidate.is_some_and(|k| {
                    !guard.curr_key().is_valid() || k.preempts(guard.curr_key())
                });
                if wins {
                    let task = src_guard.take_next(dom)?;
                    guard.add(task, dom);
                    drop(src_guard);
                    return Ok((guard, 1));
                }
            }
            drop(src_guard);
        }
        Ok((guard, 0))
    }

    // ── Push ──────────────────────────────────────────────────────────────────

    /// Keep pushing until an attempt fails to move a task.
    fn push<'a>(
        dom: &EdfDomain,
        cells: &'a [Arc<RqCell<Self>>],
        this: &'a RqCell<Self>,
        mut guard: MutexGuard<'a, RunQueue<Self>>,
        wm: &mut Measure,
    ) -> Result<(MutexGuard<'a, RunQueue<Self>>, usize), RqError> {
        let mut count = 0usize;
        loop {
            let (g, progressed) = push_one(dom, cells, this, guard, wm, &mut count)?;
            guard = g;
            if !progressed {
                break;
            }
        }
        Ok((guard, count))
    }

    fn check_domain(
        dom: &EdfDomain,
        cells: &[Arc<RqCell<Self>>],
        rqs: &[MutexGuard<'_, RunQueue<Self>>],
    ) -> Result<(), CheckError> {
        dom.push.check(cells.len())?;
        dom.pull.check(cells.len())?;
        for (cell, rq) in cells.iter().zip(rqs) {
            if !cell.is_attached() {
                continue;
            }
            dom.push.check_cpu(cell.cpu(), Some(rq.curr_key()))?;
            let next = rq.next_key();
            dom.pull.check_cpu(cell.cpu(), next.is_valid().then_some(next))?;
        }
        Ok(())
    }

    fn dump(dom: &EdfDomain) -> String {
        let mut out = format_entries(dom.push.as_ref());
        out.push_str(&format_entries(dom.pull.as_ref()));
        out
    }
}

/// One push attempt. Returns whether the outer loop should try again.
///
/// The shape mirrors the pull side with one extra wrinkle: the double
/// lock can release our own queue, so after reacquisition the candidate
/// must be re-identified, and if it moved under us we either adopt its
/// successor or give up.
fn push_one<'a>(
    dom: &EdfDomain,
    cells: &'a [Arc<RqCell<Edf>>],
    this: &'a RqCell<Edf>,
    mut guard: MutexGuard<'a, RunQueue<Edf>>,
    wm: &mut Measure,
    count: &mut usize,
) -> Result<(MutexGuard<'a, RunQueue<Edf>>, bool), RqError> {
    if !guard.overloaded() {
        return Ok((guard, false));
    }
    let Some(task) = guard.peek_next() else {
        warn!(cpu = guard.cpu(), "overloaded queue with no queued task");
        return Ok((guard, false));
    };
    let (mut pid, mut key) = (task.pid(), task.key());

    loop {
        if guard.peek().map(|t| t.pid()) == Some(pid) {
            warn!(cpu = guard.cpu(), pid, "pushable task equals the running task");
            return Ok((guard, false));
        }

        // a task that would preempt us belongs here, not elsewhere
        if key.preempts(guard.curr_key()) {
            return Ok((guard, false));
        }

        // find and lock a destination the candidate can preempt
        let mut dest: Option<MutexGuard<'a, RunQueue<Edf>>> = None;
        for _ in 0..PUSH_MAX_TRIES {
            let t0 = wm.begin(MeasureKind::PushFind);
            let found = dom.push.find(this.cpu());
            wm.end(MeasureKind::PushFind, t0);
            wm.outcome(MeasureKind::PushFind, found.is_some());

            let Some(cpu) = found else { break };
            if cpu == this.cpu() {
                break;
            }

            let dst = &cells[cpu];
            let (g, dst_guard) = double_lock(this, dst, guard);
            guard = g;

            // our lock may have been dropped in double_lock
            if guard.peek_next().map(|t| t.pid()) != Some(pid) {
                drop(dst_guard);
                break;
            }

            // destination is usable when idle or running something later
            if !dst_guard.curr_key().is_valid() || key.preempts(dst_guard.curr_key()) {
                dest = Some(dst_guard);
                break;
            }
            drop(dst_guard);
        }

        match dest {
            Some(mut dst_guard) => {
                let task = guard.take_next(dom)?;
                dst_guard.add(task, dom);
                drop(dst_guard);
                *count += 1;
                return Ok((guard, true));
            }
            None => {
                // no destination: decide from the candidate's fate
                match guard.peek_next().map(|t| (t.pid(), t.key())) {
                    // still there, stop trying to push it
                    Some((p, _)) if p == pid => return Ok((guard, false)),
                    // it migrated and nothing is queued behind it
                    None => return Ok((guard, true)),
                    // it migrated; retry with its successor
                    Some((p, k)) => {
                        pid = p;
                        key = k;
                    }
                }
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
