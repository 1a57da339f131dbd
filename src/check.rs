/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Structural validation errors shared by the runqueues, the global
//! indexes and the checker thread.
//!
//! Every variant carries enough data for the checker to log a useful
//! diagnostic without re-inspecting the structure; the checker appends the
//! rendered message plus a snapshot dump to `error_log.txt`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CheckError {
    /// The cached next key ranks ahead of the cached running key.
    #[error("runqueue {cpu}: next key is better than the running key")]
    CacheOrder { cpu: usize },

    /// A cached key disagrees with the first or second element of the heap.
    #[error("runqueue {cpu}: cached keys do not match the heap ({what})")]
    CacheHeap { cpu: usize, what: &'static str },

    /// `overloaded` and `nrunning` disagree.
    #[error("runqueue {cpu}: overloaded={overloaded} inconsistent with nrunning={nrunning}")]
    Overload {
        cpu: usize,
        nrunning: usize,
        overloaded: bool,
    },

    /// The binomial forest shape or its heap order is corrupted.
    #[error("runqueue {cpu}: heap structure corrupted ({what})")]
    HeapShape { cpu: usize, what: &'static str },

    /// A global index failed its internal structural check.
    #[error("{index} index: {what}")]
    Index { index: &'static str, what: String },

    /// A global index's view of one CPU disagrees with the runqueue cache.
    #[error("{index} index, cpu {cpu}: recorded {found:?}, runqueue says {expected:?}")]
    CpuMismatch {
        index: &'static str,
        cpu: usize,
        expected: Option<u64>,
        found: Option<u64>,
    },

    /// Root-domain state (overload mask, priority index) out of sync.
    #[error("root domain: {what}")]
    RootDomain { what: String },
}
