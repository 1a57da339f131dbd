/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! The scheduling-discipline capability.
//!
//! The harness runs the same worker loop for deadline (EDF) and
//! fixed-priority (RT) scheduling; everything key-domain specific hangs
//! off this trait and is chosen once, at type-instantiation time in
//! `main`. The two implementations live in [`edf`](crate::edf) and
//! [`rt`](crate::rt).

use std::sync::Arc;

use parking_lot::MutexGuard;
use rand::rngs::SmallRng;

use crate::check::CheckError;
use crate::config::SimConfig;
use crate::index::IndexKind;
use crate::key::SchedKey;
use crate::measure::{Measure, MeasureKind};
use crate::rq::{RqCell, RqError, RunQueue};
use crate::task::Queued;

pub trait Discipline: Sized + Send + Sync + 'static {
    type Key: SchedKey;
    type Task: Queued<Key = Self::Key>;
    /// The shared load-balancing state: the push/pull indexes for EDF,
    /// the root domain for RT.
    type Domain: Send + Sync + 'static;

    const NAME: &'static str;

    /// Measurement kind charged for publishing the running key, if any.
    const RUNNING_PUBLISH_KIND: Option<MeasureKind>;
    /// Measurement kind charged for publishing the next key, if any.
    const NEXT_PUBLISH_KIND: Option<MeasureKind>;

    // ── Construction ──────────────────────────────────────────────────────────

    fn make_domain(cfg: &SimConfig, kind: IndexKind, nproc: usize, seed: u64) -> Self::Domain;

    // ── Task generation and lifecycle ─────────────────────────────────────────

    /// Materialise a random arrival for the current simulated clock.
    fn spawn_task(rng: &mut SmallRng, clock: u64, cfg: &SimConfig, pid: u64) -> Box<Self::Task>;

    /// Has the running task completed at this clock?
    fn task_finished(task: &Self::Task, clock: u64) -> bool;

    /// Charge one cycle of execution to the running task.
    fn charge_tick(task: &mut Self::Task);

    // ── Publication hooks (called under the runqueue lock) ───────────────────

    fn publish_running(dom: &Self::Domain, cpu: usize, key: Self::Key);
    fn publish_next(dom: &Self::Domain, cpu: usize, key: Self::Key);
    fn overload_changed(dom: &Self::Domain, cpu: usize, overloaded: bool);

    /// First publication when a worker joins the simulation.
    fn attach(dom: &Self::Domain, cpu: usize);
    /// Final publication before a worker leaves: its nodes must read as
    /// absent afterwards.
    fn detach(dom: &Self::Domain, cpu: usize);

    // ── Migration ─────────────────────────────────────────────────────────────

    /// Pre-schedule: try to steal queued work from other CPUs. Returns
    /// the updated guard (the double-lock dance may release and reacquire
    /// it) and the number of tasks migrated in.
    fn pull<'a>(
        dom: &Self::Domain,
        cells: &'a [Arc<RqCell<Self>>],
        this: &'a RqCell<Self>,
        guard: MutexGuard<'a, RunQueue<Self>>,
        wm: &mut Measure,
    ) -> Result<(MutexGuard<'a, RunQueue<Self>>, usize), RqError>;

    /// Post-schedule: try to hand queued work to other CPUs.
    fn push<'a>(
        dom: &Self::Domain,
        cells: &'a [Arc<RqCell<Self>>],
        this: &'a RqCell<Self>,
        guard: MutexGuard<'a, RunQueue<Self>>,
        wm: &mut Measure,
    ) -> Result<(MutexGuard<'a, RunQueue<Self>>, usize), RqError>;

    // ── Checker hooks (world frozen: every runqueue lock held) ───────────────

    fn check_domain(
        dom: &Self::Domain,
        cells: &[Arc<RqCell<Self>>],
        rqs: &[MutexGuard<'_, RunQueue<Self>>],
    ) -> Result<(), CheckError>;

    /// Render the shared state for the SIGINT dump and the error log.
    fn dump(dom: &Self::Domain) -> String;
}
