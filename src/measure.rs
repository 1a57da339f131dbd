/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Latency sampling and event accounting.
//!
//! The original instrument for this kind of harness is the TSC; here the
//! platform's monotonic clock stands in for it, but the calibration idea
//! is kept: the cost of reading the clock twice back-to-back is measured
//! (minimum of a few runs) and subtracted from every sample.
//!
//! A [`Measure`] is single-owner: each worker thread owns one for the
//! operations it times on its own (cycle, sleep, the find paths), and each
//! runqueue owns one for the operations that happen under its lock
//! (enqueue/dequeue accounting, the index publish latencies). The two are
//! merged per CPU when the simulation is collected.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Runs used to estimate the cost of one clock read pair.
const CALIBRATION_CYCLES: usize = 3;

/// Cap on stored samples per (kind, CPU).
const SAMPLES_MAX: usize = 1_000_000;

// ── MeasureKind ───────────────────────────────────────────────────────────────

/// Everything the harness knows how to measure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeasureKind {
    /// Full simulation cycle latency.
    Cycle,
    /// Time spent in the end-of-cycle absolute sleep.
    Sleep,
    /// Push-side `find()` latency (with success/fail outcome counts).
    PushFind,
    /// Pull-side `find()` latency (with success/fail outcome counts).
    PullFind,
    /// Push-side `preempt()` publish latency.
    PushPreempt,
    /// Pull-side `preempt()` publish latency.
    PullPreempt,
    /// Priority-index `set()` latency (RT mode).
    CpupriSet,
    /// Priority-index `find()` latency (RT mode, with outcomes).
    CpupriFind,
    /// Number of enqueues on each runqueue.
    EnqueueNumber,
    /// Number of dequeues on each runqueue.
    DequeueNumber,
}

impl MeasureKind {
    pub const ALL: [MeasureKind; 10] = [
        MeasureKind::Cycle,
        MeasureKind::Sleep,
        MeasureKind::PushFind,
        MeasureKind::PullFind,
        MeasureKind::PushPreempt,
        MeasureKind::PullPreempt,
        MeasureKind::CpupriSet,
        MeasureKind::CpupriFind,
        MeasureKind::EnqueueNumber,
        MeasureKind::DequeueNumber,
    ];

    pub const COUNT: usize = Self::ALL.len();

    fn idx(self) -> usize {
        Self::ALL.iter().position(|&k| k == self).unwrap_or(0)
    }

    pub fn file_stem(self) -> &'static str {
        match self {
            MeasureKind::Cycle => "cycle",
            MeasureKind::Sleep => "sleep",
            MeasureKind::PushFind => "push_find",
            MeasureKind::PullFind => "pull_find",
            MeasureKind::PushPreempt => "push_preempt",
            MeasureKind::PullPreempt => "pull_preempt",
            MeasureKind::CpupriSet => "cpupri_set",
            MeasureKind::CpupriFind => "cpupri_find",
            MeasureKind::EnqueueNumber => "enqueue_number",
            MeasureKind::DequeueNumber => "dequeue_number",
        }
    }

    /// Kinds that record latency samples (everything but the bare event
    /// counters).
    pub fn is_timed(self) -> bool {
        !matches!(self, MeasureKind::EnqueueNumber | MeasureKind::DequeueNumber)
    }

    /// Kinds whose operation can succeed or fail and where the split is
    /// worth recording.
    pub fn has_outcome(self) -> bool {
        matches!(
            self,
            MeasureKind::PushFind | MeasureKind::PullFind | MeasureKind::CpupriFind
        )
    }
}

// ── Measure ───────────────────────────────────────────────────────────────────

/// Sample buffers and counters for one owner (a worker or a runqueue).
#[derive(Debug)]
pub struct Measure {
    enabled: [bool; MeasureKind::COUNT],
    overhead_ns: u64,
    samples: Vec<Vec<u64>>,
    counts: [u64; MeasureKind::COUNT],
    success: [u64; MeasureKind::COUNT],
    fail: [u64; MeasureKind::COUNT],
    overflowed: bool,
}

impl Measure {
    pub fn new(kinds: &[MeasureKind]) -> Self {
        let mut enabled = [false; MeasureKind::COUNT];
        for k in kinds {
            enabled[k.idx()] = true;
        }
        Measure {
            enabled,
            overhead_ns: 0,
            samples: (0..MeasureKind::COUNT).map(|_| Vec::new()).collect(),
            counts: [0; MeasureKind::COUNT],
            success: [0; MeasureKind::COUNT],
            fail: [0; MeasureKind::COUNT],
            overflowed: false,
        }
    }

    /// A measure that records nothing.
    pub fn disabled() -> Self {
        Self::new(&[])
    }

    /// Estimate the cost of one begin/end clock pair and remember it so it
    /// can be subtracted from every subsequent sample.
    pub fn calibrate(&mut self) {
        let mut min = u64::MAX;
        for _ in 0..CALIBRATION_CYCLES {
            let t0 = Instant::now();
            let t1 = Instant::now();
            let elapsed = t1.duration_since(t0).as_nanos() as u64;
            min = min.min(elapsed);
        }
        self.overhead_ns = min;
    }

    pub fn is_enabled(&self, kind: MeasureKind) -> bool {
        self.enabled[kind.idx()]
    }

    /// Start a timed sample. `None` when the kind is disabled, so the hot
    /// path pays one branch.
    pub fn begin(&self, kind: MeasureKind) -> Option<Instant> {
        if self.enabled[kind.idx()] {
            Some(Instant::now())
        } else {
            None
        }
    }

    pub fn end(&mut self, kind: MeasureKind, started: Option<Instant>) {
        let Some(t0) = started else { return };
        let elapsed = t0.elapsed().as_nanos() as u64;
        let sample = elapsed.saturating_sub(self.overhead_ns);
        let idx = kind.idx();
        self.counts[idx] += 1;
        let buf = &mut self.samples[idx];
        if buf.len() < SAMPLES_MAX {
            buf.push(sample);
        } else if !self.overflowed {
            self.overflowed = true;
            tracing::warn!(
                kind = kind.file_stem(),
                max = SAMPLES_MAX,
                "sample buffer full, further samples dropped"
            );
        }
    }

    /// Count one occurrence of an untimed event.
    pub fn account(&mut self, kind: MeasureKind) {
        if self.enabled[kind.idx()] {
            self.counts[kind.idx()] += 1;
        }
    }

    /// Record whether a find-style operation produced a candidate.
    pub fn outcome(&mut self, kind: MeasureKind, success: bool) {
        if !self.enabled[kind.idx()] {
            return;
        }
        if success {
            self.success[kind.idx()] += 1;
        } else {
            self.fail[kind.idx()] += 1;
        }
    }

    /// Fold another measure (same CPU, different owner) into this one.
    pub fn merge(&mut self, mut other: Measure) {
        for idx in 0..MeasureKind::COUNT {
            self.enabled[idx] |= other.enabled[idx];
            self.counts[idx] += other.counts[idx];
            self.success[idx] += other.success[idx];
            self.fail[idx] += other.fail[idx];
            self.samples[idx].append(&mut other.samples[idx]);
        }
    }

    pub fn samples(&self, kind: MeasureKind) -> &[u64] {
        &self.samples[kind.idx()]
    }

    pub fn count(&self, kind: MeasureKind) -> u64 {
        self.counts[kind.idx()]
    }

    pub fn outcomes(&self, kind: MeasureKind) -> (u64, u64) {
        (self.success[kind.idx()], self.fail[kind.idx()])
    }
}

// ── Report files ──────────────────────────────────────────────────────────────

/// Write one `out_<name>` file per enabled measurement: a CPU-count header
/// followed by per-CPU blocks of raw samples (and outcome lines for the
/// find paths).
pub fn write_reports(
    dir: &Path,
    kinds: &[MeasureKind],
    cycles: u64,
    cycle_len_secs: f64,
    per_cpu: &[Measure],
) -> io::Result<()> {
    for &kind in kinds {
        let path = dir.join(format!("out_{}", kind.file_stem()));
        let mut out = BufWriter::new(File::create(&path)?);

        writeln!(out, "CPUs number:\t{}", per_cpu.len())?;
        writeln!(out)?;

        for (cpu, m) in per_cpu.iter().enumerate() {
            if kind.is_timed() {
                for sample in m.samples(kind) {
                    writeln!(out, "{sample:7}")?;
                }
            } else {
                let n = m.count(kind);
                writeln!(out, "[{cpu}]: {} occurences: {n}", kind.file_stem())?;
                let rate = n as f64 / (cycles as f64 * cycle_len_secs);
                writeln!(out, "[{cpu}]: {} rate: {rate:.0} event/s", kind.file_stem())?;
            }
            if kind.has_outcome() {
                let (success, fail) = m.outcomes(kind);
                writeln!(out, "[{cpu}]: {} outcome", kind.file_stem())?;
                writeln!(out, "{} successful:\t{success}", kind.file_stem())?;
                writeln!(out, "{} failed:\t{fail}", kind.file_stem())?;
            }
            writeln!(out)?;
        }
    }
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_measure_records_nothing() {
        let mut m = Measure::disabled();
        let t = m.begin(MeasureKind::Cycle);
        assert!(t.is_none());
        m.end(MeasureKind::Cycle, t);
        m.account(MeasureKind::EnqueueNumber);
        m.outcome(MeasureKind::PushFind, true);
        assert!(m.samples(MeasureKind::Cycle).is_empty());
        assert_eq!(m.count(MeasureKind::EnqueueNumber), 0);
        assert_eq!(m.outcomes(MeasureKind::PushFind), (0, 0));
    }

    #[test]
    fn enabled_measure_collects_samples_and_counts() {
        let mut m = Measure::new(&[MeasureKind::Cycle, MeasureKind::EnqueueNumber]);
        let t = m.begin(MeasureKind::Cycle);
        assert!(t.is_some());
        m.end(MeasureKind::Cycle, t);
        m.account(MeasureKind::EnqueueNumber);
        m.account(MeasureKind::EnqueueNumber);
        assert_eq!(m.samples(MeasureKind::Cycle).len(), 1);
        assert_eq!(m.count(MeasureKind::EnqueueNumber), 2);
    }

    #[test]
    fn outcome_counters_split_success_and_failure() {
        let mut m = Measure::new(&[MeasureKind::PullFind]);
        m.outcome(MeasureKind::PullFind, true);
        m.outcome(MeasureKind::PullFind, false);
        m.outcome(MeasureKind::PullFind, false);
        assert_eq!(m.outcomes(MeasureKind::PullFind), (1, 2));
    }

    #[test]
    fn merge_concatenates_buffers_and_sums_counts() {
        let mut a = Measure::new(&[MeasureKind::Sleep]);
        let mut b = Measure::new(&[MeasureKind::Sleep, MeasureKind::DequeueNumber]);
        let t = a.begin(MeasureKind::Sleep);
        a.end(MeasureKind::Sleep, t);
        let t = b.begin(MeasureKind::Sleep);
        b.end(MeasureKind::Sleep, t);
        b.account(MeasureKind::DequeueNumber);
        a.merge(b);
        assert_eq!(a.samples(MeasureKind::Sleep).len(), 2);
        assert_eq!(a.count(MeasureKind::DequeueNumber), 1);
    }

    #[test]
    fn report_files_have_header_and_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = Measure::new(&[MeasureKind::PushFind]);
        let t = m.begin(MeasureKind::PushFind);
        m.end(MeasureKind::PushFind, t);
        m.outcome(MeasureKind::PushFind, true);

        write_reports(dir.path(), &[MeasureKind::PushFind], 10, 0.01, &[m]).unwrap();

        let text = std::fs::read_to_string(dir.path().join("out_push_find")).unwrap();
        assert!(text.starts_with("CPUs number:\t1\n"));
        assert!(text.contains("push_find successful:\t1"));
        assert!(text.contains("push_find failed:\t0"));
    }

    #[test]
    fn calibration_never_underflows_samples() {
        let mut m = Measure::new(&[MeasureKind::Cycle]);
        m.calibrate();
        let t = m.begin(MeasureKind::Cycle);
        m.end(MeasureKind::Cycle, t);
        // the sample may be zero after overhead subtraction, never huge
        assert!(m.samples(MeasureKind::Cycle)[0] < 1_000_000_000);
    }
}
