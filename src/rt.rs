/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Fixed-priority discipline.
//!
//! RT load balancing does not use the global indexes. The root domain
//! carries everything: an atomic count and bitmask of overloaded
//! runqueues drive the pull side, and the CPU-priority index answers the
//! push side's "which CPU runs something I outrank" — including idle
//! destinations naturally, since an idle CPU would occupy the least
//! urgent slot a scan visits first. Pull iterates the overload mask with
//! an unlocked early-exit filter on each source's published `next` hint,
//! so most non-candidates are skipped without touching their locks.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::MutexGuard;
use rand::rngs::SmallRng;
use rand::Rng;
use tracing::warn;

use crate::check::CheckError;
use crate::config::SimConfig;
use crate::cpumask::AtomicCpuMask;
use crate::cpupri::{convert_prio, CpuPriority, MAX_RT_PRIO};
use crate::discipline::Discipline;
use crate::index::IndexKind;
use crate::key::SchedKey;
use crate::measure::{Measure, MeasureKind};
use crate::params::PUSH_MAX_TRIES;
use crate::rq::{double_lock, RqCell, RqError, RunQueue};
use crate::task::{Queued, RtTask};

pub struct Rt;

/// The set of CPUs cooperating in one load-balancing group.
pub struct RootDomain {
    pub rto_count: AtomicUsize,
    pub rto_mask: AtomicCpuMask,
    pub cpupri: CpuPriority,
}

impl RootDomain {
    pub fn new(nr_cpus: usize) -> Self {
        RootDomain {
            rto_count: AtomicUsize::new(0),
            rto_mask: AtomicCpuMask::new(),
            cpupri: CpuPriority::new(nr_cpus),
        }
    }
}

impl Discipline for Rt {
    type Key = i32;
    type Task = RtTask;
    type Domain = RootDomain;

    const NAME: &'static str = "rt";
    const RUNNING_PUBLISH_KIND: Option<MeasureKind> = Some(MeasureKind::CpupriSet);
    const NEXT_PUBLISH_KIND: Option<MeasureKind> = None;

    /// The index variant selection does not apply here: RT balancing
    /// runs entirely on the root domain.
    fn make_domain(_cfg: &SimConfig, _kind: IndexKind, nproc: usize, _seed: u64) -> RootDomain {
        RootDomain::new(nproc)
    }

    fn spawn_task(rng: &mut SmallRng, _clock: u64, cfg: &SimConfig, pid: u64) -> Box<RtTask> {
        let prio = rng.gen_range(1..MAX_RT_PRIO);
        let runtime = rng.gen_range(cfg.runtime_min..cfg.runtime_max);
        Box::new(RtTask::new(
            pid,
            prio,
            runtime,
            crate::cpumask::CpuMask::filled(cfg.cpus),
        ))
    }

    /// A task completes when its runtime budget is spent.
    fn task_finished(task: &RtTask, _clock: u64) -> bool {
        task.runtime == 0
    }

    fn charge_tick(task: &mut RtTask) {
        task.runtime = task.runtime.saturating_sub(1);
    }

    fn publish_running(dom: &RootDomain, cpu: usize, key: i32) {
        dom.cpupri.set(cpu, key);
    }

    /// No global pull index in RT mode; the hint mirror is maintained by
    /// the runqueue itself.
    fn publish_next(_dom: &RootDomain, _cpu: usize, _key: i32) {}

    fn overload_changed(dom: &RootDomain, cpu: usize, overloaded: bool) {
        if overloaded {
            dom.rto_mask.set(cpu);
            dom.rto_count.fetch_add(1, Ordering::SeqCst);
        } else {
            dom.rto_mask.clear(cpu);
            dom.rto_count.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn attach(_dom: &RootDomain, _cpu: usize) {}

    /// The priority index keeps the departing CPU's last slot: nothing
    /// pulls from it once its queue drains, and the world ends at the
    /// barrier right after.
    fn detach(_dom: &RootDomain, _cpu: usize) {}

    // ── Pull ──────────────────────────────────────────────────────────────────

    /// Walk the overloaded CPUs and steal every queued task that strictly
    /// outranks what we are running.
    fn pull<'a>(
        dom: &RootDomain,
        cells: &'a [Arc<RqCell<Self>>],
        this: &'a RqCell<Self>,
        mut guard: MutexGuard<'a, RunQueue<Self>>,
        _wm: &mut Measure,
    ) -> Result<(MutexGuard<'a, RunQueue<Self>>, usize), RqError> {
        if dom.rto_count.load(Ordering::SeqCst) == 0 {
            return Ok((guard, 0));
        }

        let mut pulled = 0usize;
        for cpu in dom.rto_mask.snapshot().iter() {
            if cpu == this.cpu() {
                continue;
            }
            let src = &cells[cpu];

            // Unlocked read of the source's next hint. Racy on purpose:
            // if the value is about to rise the source will push the task
            // to us anyway, and if it is about to fall we lose nothing.
            if !src.next_hint().preempts(guard.curr_key()) {
                continue;
            }

            let (g, mut src_guard) = double_lock(this, src, guard);
            guard = g;

            // anything still pullable after taking the locks?
            if src_guard.nrunning() > 1 {
                let candidate = src_guard.peek_next().map(|t| t.key());
                if candidate.is_some_and(|k| k.preempts(guard.curr_key())) {
                    let task = src_guard.take_next(dom)?;
                    guard.add(task, dom);
                    pulled += 1;
                }
            }
            drop(src_guard);
        }
        Ok((guard, pulled))
    }

    // ── Push ──────────────────────────────────────────────────────────────────

    fn push<'a>(
        dom: &RootDomain,
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
        dom: &RootDomain,
        cells: &[Arc<RqCell<Self>>],
        rqs: &[MutexGuard<'_, RunQueue<Self>>],
    ) -> Result<(), CheckError> {
        let mask = dom.rto_mask.snapshot();
        for (cell, rq) in cells.iter().zip(rqs) {
            let cpu = cell.cpu();
            if mask.test(cpu) != rq.overloaded() {
                return Err(CheckError::RootDomain {
                    what: format!(
                        "cpu {cpu}: rto_mask bit {} but overloaded {}",
                        mask.test(cpu),
                        rq.overloaded()
                    ),
                });
            }
            let recorded = dom.cpupri.current(cpu);
            if recorded != convert_prio(rq.curr_key()) {
                return Err(CheckError::RootDomain {
                    what: format!(
                        "cpu {cpu}: priority index slot {recorded} but running key {:?}",
                        rq.curr_key()
                    ),
                });
            }
        }
        let count = dom.rto_count.load(Ordering::SeqCst);
        if count != mask.weight() {
            return Err(CheckError::RootDomain {
                what: format!("rto_count {count} but {} mask bits", mask.weight()),
            });
        }
        Ok(())
    }

    fn dump(dom: &RootDomain) -> String {
        use std::fmt::Write;

        let mut out = String::new();
        let _ = writeln!(
            out,
            "----root domain----\nrto_count: {}\nrto_mask: {:?}",
            dom.rto_count.load(Ordering::SeqCst),
            dom.rto_mask.snapshot()
        );
        for (slot, cpus) in dom.cpupri.occupied() {
            let _ = writeln!(out, "slot {slot:3}: {cpus:?}");
        }
        out
    }
}

/// One push attempt; same re-validation shape as the deadline side, with
/// the destination search delegated to the priority index and the
/// affinity mask re-checked after the lock gap.
fn push_one<'a>(
    dom: &RootDomain,
    cells: &'a [Arc<RqCell<Rt>>],
    this: &'a RqCell<Rt>,
    mut guard: MutexGuard<'a, RunQueue<Rt>>,
    wm: &mut Measure,
    count: &mut usize,
) -> Result<(MutexGuard<'a, RunQueue<Rt>>, bool), RqError> {
    if !guard.overloaded() {
        return Ok((guard, false));
    }
    let Some(task) = guard.peek_next() else {
        warn!(cpu = guard.cpu(), "overloaded queue with no queued task");
        return Ok((guard, false));
    };
    let (mut pid, mut prio, mut allowed) = (task.pid(), task.prio, task.cpus_allowed);

    loop {
        if guard.peek().map(|t| t.pid()) == Some(pid) {
            warn!(cpu = guard.cpu(), pid, "pushable task equals the running task");
            return Ok((guard, false));
        }

        if prio.preempts(guard.curr_key()) {
            return Ok((guard, false));
        }

        let mut dest: Option<MutexGuard<'a, RunQueue<Rt>>> = None;
        for _ in 0..PUSH_MAX_TRIES {
            let t0 = wm.begin(MeasureKind::CpupriFind);
            let found = dom.cpupri.find(prio, &allowed);
            wm.end(MeasureKind::CpupriFind, t0);
            wm.outcome(MeasureKind::CpupriFind, found.is_some());

            let Some(cpu) = found.and_then(|mask| mask.first()) else {
                break;
            };
            if cpu == this.cpu() {
                break;
            }

            let dst = &cells[cpu];
            let (g, dst_guard) = double_lock(this, dst, guard);
            guard = g;

            // candidate gone, or the destination fell outside its mask
            let still_next = guard.peek_next().map(|t| t.pid()) == Some(pid);
            if !still_next || !allowed.test(cpu) {
                drop(dst_guard);
                break;
            }

            if prio.preempts(dst_guard.curr_key()) {
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
            None => match guard.peek_next().map(|t| (t.pid(), t.prio, t.cpus_allowed)) {
                Some((p, _, _)) if p == pid => return Ok((guard, false)),
                None => return Ok((guard, true)),
                Some((p, pr, al)) => {
                    pid = p;
                    prio = pr;
                    allowed = al;
                }
            },
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpumask::CpuMask;
    use crate::cpupri::CPUPRI_INVALID;

    fn setup(nproc: usize) -> (RootDomain, Vec<Arc<RqCell<Rt>>>) {
        let dom = RootDomain::new(nproc);
        let cells: Vec<Arc<RqCell<Rt>>> = (0..nproc)
            .map(|cpu| Arc::new(RqCell::new(cpu, Measure::disabled())))
            .collect();
        for cell in &cells {
            cell.set_attached(true);
        }
        (dom, cells)
    }

    fn add(cell: &RqCell<Rt>, dom: &RootDomain, pid: u64, prio: i32) {
        cell.lock().add(
            Box::new(RtTask::new(pid, prio, 10, CpuMask::filled(8))),
            dom,
        );
    }

    #[test]
    fn overload_transitions_drive_the_root_domain() {
        let (dom, cells) = setup(2);
        add(&cells[0], &dom, 1, 30);
        assert_eq!(dom.rto_count.load(Ordering::SeqCst), 0);
        add(&cells[0], &dom, 2, 40);
        assert_eq!(dom.rto_count.load(Ordering::SeqCst), 1);
        assert!(dom.rto_mask.test(0));
        let _ = cells[0].lock().take(&dom).unwrap();
        assert_eq!(dom.rto_count.load(Ordering::SeqCst), 0);
        assert!(!dom.rto_mask.test(0));
    }

    #[test]
    fn pull_filter_skips_sources_that_cannot_preempt_us() {
        // our running slot is 90 (prio 11); the source's next is slot 85
        // (prio 16): 85 cannot preempt 90, no locks are taken
        let (dom, cells) = setup(4);
        add(&cells[0], &dom, 1, 11);
        add(&cells[3], &dom, 2, 10);
        add(&cells[3], &dom, 3, 16);
        assert!(dom.rto_mask.test(3));

        let guard = cells[0].lock();
        let (guard, pulled) =
            Rt::pull(&dom, &cells, &cells[0], guard, &mut Measure::disabled()).unwrap();
        assert_eq!(pulled, 0);
        assert_eq!(guard.nrunning(), 1);
        drop(guard);
        assert_eq!(cells[3].lock().nrunning(), 2);
    }

    #[test]
    fn pull_takes_a_strictly_more_urgent_task() {
        // running slot 80 (prio 21); source's next is slot 85 (prio 16)
        let (dom, cells) = setup(4);
        add(&cells[0], &dom, 1, 21);
        add(&cells[3], &dom, 2, 10);
        add(&cells[3], &dom, 3, 16);

        let guard = cells[0].lock();
        let (guard, pulled) =
            Rt::pull(&dom, &cells, &cells[0], guard, &mut Measure::disabled()).unwrap();
        assert_eq!(pulled, 1);
        assert_eq!(guard.curr_key(), 16);
        drop(guard);
        assert_eq!(cells[3].lock().nrunning(), 1);
        assert!(!dom.rto_mask.test(3));
    }

    #[test]
    fn push_finds_a_lower_priority_cpu_through_the_index() {
        let (dom, cells) = setup(2);
        add(&cells[1], &dom, 9, 80); // slot 21, very preemptable
        add(&cells[0], &dom, 1, 10);
        add(&cells[0], &dom, 2, 30);

        let guard = cells[0].lock();
        let (guard, pushed) =
            Rt::push(&dom, &cells, &cells[0], guard, &mut Measure::disabled()).unwrap();
        assert_eq!(pushed, 1);
        assert_eq!(guard.nrunning(), 1);
        drop(guard);
        let rq1 = cells[1].lock();
        assert_eq!(rq1.curr_key(), 30);
        assert_eq!(rq1.nrunning(), 2);
    }

    #[test]
    fn push_respects_the_affinity_mask() {
        let (dom, cells) = setup(2);
        add(&cells[1], &dom, 9, 80);
        add(&cells[0], &dom, 1, 10);
        // the queued task may only run on cpu 0
        let mut only_zero = CpuMask::empty();
        only_zero.set(0);
        cells[0]
            .lock()
            .add(Box::new(RtTask::new(2, 30, 10, only_zero)), &dom);

        let guard = cells[0].lock();
        let (guard, pushed) =
            Rt::push(&dom, &cells, &cells[0], guard, &mut Measure::disabled()).unwrap();
        assert_eq!(pushed, 0);
        assert_eq!(guard.nrunning(), 2);
    }

    #[test]
    fn domain_check_verifies_mask_count_and_slots() {
        let (dom, cells) = setup(2);
        add(&cells[0], &dom, 1, 30);
        add(&cells[0], &dom, 2, 50);
        let guards: Vec<_> = cells.iter().map(|c| c.lock()).collect();
        Rt::check_domain(&dom, &cells, &guards).unwrap();
        drop(guards);

        // desynchronise the mask on purpose
        dom.rto_mask.clear(0);
        let guards: Vec<_> = cells.iter().map(|c| c.lock()).collect();
        assert!(Rt::check_domain(&dom, &cells, &guards).is_err());
    }

    #[test]
    fn emptied_queue_reports_an_invalid_slot() {
        let (dom, cells) = setup(1);
        add(&cells[0], &dom, 1, 30);
        let _ = cells[0].lock().take(&dom).unwrap();
        assert_eq!(dom.cpupri.current(0), CPUPRI_INVALID);
    }
}
