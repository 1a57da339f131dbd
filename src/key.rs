/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Scheduling-key comparisons.
//!
//! Two key domains exist: 64-bit absolute deadlines (EDF) and integer
//! fixed priorities (RT). The global indexes are key-domain agnostic: they
//! store a `u64` per CPU and order it through a [`KeyOrder`] fixed at
//! construction. The runqueue layer is generic over [`SchedKey`], the
//! capability that knows which of two keys wins a preemption.

use std::fmt;

// ── Deadline comparisons ──────────────────────────────────────────────────────

/// Wrap-aware deadline comparison: `true` when `a` is earlier than `b`.
///
/// The subtraction-and-sign form keeps working across a `u64` wrap of the
/// simulated clock, exactly like the kernel's `dl_time_before`.
pub fn dl_time_before(a: u64, b: u64) -> bool {
    (a.wrapping_sub(b) as i64) < 0
}

/// Wrap-aware deadline comparison: `true` when `a` is later than `b`.
pub fn dl_time_after(a: u64, b: u64) -> bool {
    (a.wrapping_sub(b) as i64) > 0
}

// ── Index orientation ─────────────────────────────────────────────────────────

/// The key `0` is reserved inside the global indexes: it marks a CPU whose
/// runqueue is idle, and it orders as an infinitely late deadline. A push
/// index therefore ranks idle CPUs as the most preemptable destinations,
/// while a pull index (which never publishes idle CPUs as valid) would rank
/// them last.
pub const IDLE_KEY: u64 = 0;

/// Orientation of a global index, decided once at construction.
///
/// * `EarliestFirst` — `find()` yields the CPU with the most urgent key
///   (pull side: the best queued task).
/// * `LatestFirst` — `find()` yields the CPU with the least urgent key
///   (push side: the most preemptable running task).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyOrder {
    EarliestFirst,
    LatestFirst,
}

impl KeyOrder {
    /// Strict ordering test: does `a` rank ahead of `b` in this orientation?
    ///
    /// [`IDLE_KEY`] orders as an infinitely late deadline in both
    /// orientations.
    pub fn precedes(self, a: u64, b: u64) -> bool {
        match self {
            KeyOrder::EarliestFirst => {
                if a == IDLE_KEY {
                    false
                } else if b == IDLE_KEY {
                    true
                } else {
                    dl_time_before(a, b)
                }
            }
            KeyOrder::LatestFirst => {
                if a == IDLE_KEY {
                    b != IDLE_KEY
                } else if b == IDLE_KEY {
                    false
                } else {
                    dl_time_after(a, b)
                }
            }
        }
    }
}

// ── Key capability ────────────────────────────────────────────────────────────

/// A scheduling key: the value a runqueue caches for its running and best
/// queued tasks, and the thing preemption decisions compare.
pub trait SchedKey: Copy + PartialEq + Eq + Send + Sync + fmt::Debug + 'static {
    /// The sentinel an empty cache holds.
    const INVALID: Self;

    /// Strict preemption test: would a task with key `self` preempt one
    /// with key `other`?
    ///
    /// The semantics of comparing against [`SchedKey::INVALID`] are
    /// domain-specific and callers must not rely on them; the runqueue
    /// cache rules guard those cases explicitly.
    fn preempts(self, other: Self) -> bool;

    /// Lossless encoding used for the lock-free `next` hint mirror.
    fn to_bits(self) -> u64;
    fn from_bits(bits: u64) -> Self;

    fn is_valid(self) -> bool {
        self != Self::INVALID
    }
}

/// EDF keys are absolute deadlines; `0` doubles as the invalid sentinel.
impl SchedKey for u64 {
    const INVALID: u64 = 0;

    fn preempts(self, other: u64) -> bool {
        dl_time_before(self, other)
    }

    fn to_bits(self) -> u64 {
        self
    }

    fn from_bits(bits: u64) -> u64 {
        bits
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dl_time_before_orders_plain_values() {
        assert!(dl_time_before(10, 20));
        assert!(!dl_time_before(20, 10));
        assert!(!dl_time_before(15, 15));
    }

    #[test]
    fn dl_time_before_survives_wraparound() {
        // a deadline just past the wrap point is still "after" one just
        // before it
        let before_wrap = u64::MAX - 5;
        let after_wrap = 5u64;
        assert!(dl_time_before(before_wrap, after_wrap));
        assert!(dl_time_after(after_wrap, before_wrap));
    }

    #[test]
    fn earliest_first_prefers_smaller_deadline() {
        let o = KeyOrder::EarliestFirst;
        assert!(o.precedes(10, 20));
        assert!(!o.precedes(20, 10));
    }

    #[test]
    fn latest_first_prefers_larger_deadline() {
        let o = KeyOrder::LatestFirst;
        assert!(o.precedes(20, 10));
        assert!(!o.precedes(10, 20));
    }

    #[test]
    fn idle_key_ranks_first_in_push_orientation() {
        let o = KeyOrder::LatestFirst;
        assert!(o.precedes(IDLE_KEY, 1));
        assert!(o.precedes(IDLE_KEY, u64::MAX));
        assert!(!o.precedes(1, IDLE_KEY));
        assert!(!o.precedes(IDLE_KEY, IDLE_KEY));
    }

    #[test]
    fn idle_key_ranks_last_in_pull_orientation() {
        let o = KeyOrder::EarliestFirst;
        assert!(!o.precedes(IDLE_KEY, 1));
        assert!(o.precedes(1, IDLE_KEY));
        assert!(o.precedes(u64::MAX, IDLE_KEY));
    }

    #[test]
    fn u64_key_preemption_is_strict() {
        assert!(50u64.preempts(70));
        assert!(!70u64.preempts(50));
        assert!(!50u64.preempts(50));
        // a valid key does not raw-compare as earlier than the sentinel;
        // the runqueue handles the empty case before comparing
        assert!(!70u64.preempts(u64::INVALID));
    }
}
