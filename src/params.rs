/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Compile-time simulation parameters.
//!
//! These are the defaults the harness was tuned with; everything that is
//! meaningful to vary at runtime is mirrored in [`SimConfig`](crate::config)
//! and can be overridden from the command line or a YAML file.

/// Upper bound on the number of simulated CPUs. Sizes the fixed bitsets in
/// [`cpumask`](crate::cpumask).
pub const NR_CPUS: usize = 48;

/// Default number of simulation cycles per worker.
pub const NCYCLES: u64 = 1000;

/// Default cycle period in microseconds (one cycle simulates 10 ms).
pub const CYCLE_LEN_US: u64 = 10_000;

/// Deadline offset window for new EDF arrivals, in simulated clock ticks.
pub const DMIN: u64 = 10;
pub const DMAX: u64 = 100;

/// Runtime window for new fixed-priority arrivals, in simulation cycles.
pub const RUNTIME_MIN: u32 = 5;
pub const RUNTIME_MAX: u32 = 15;

/// Bound on destination re-selection when a push migration keeps racing.
pub const PUSH_MAX_TRIES: usize = 3;

/// Bound on source re-selection when a pull migration keeps racing.
pub const PULL_MAX_TRIES: usize = 3;

/// Checker pass period in milliseconds.
pub const CHECKER_PERIOD_MS: u64 = 50;
