/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Flat-combining skip-list variant: the [`SlCore`] list driven through
//! the publication-record protocol of [`fc`](super::fc) instead of a
//! reader-writer lock.

use crate::check::CheckError;
use crate::index::fc::{FcLayer, FcOp};
use crate::index::skiplist::SlCore;
use crate::index::{CpuEntry, CpuIndex};
use crate::key::KeyOrder;

pub struct FcSkipListIndex {
    fc: FcLayer<SlCore>,
}

impl FcSkipListIndex {
    pub fn new(nproc: usize, order: KeyOrder, seed: u64) -> Self {
        FcSkipListIndex {
            fc: FcLayer::new(nproc, SlCore::new(nproc, order, seed)),
        }
    }

    fn apply(core: &mut SlCore, cpu: usize, op: FcOp) -> i64 {
        match op {
            FcOp::Preempt { key, valid } => {
                core.update(cpu, key, valid);
                -1
            }
            FcOp::Find => core.first().map_or(-1, |best| best as i64),
        }
    }
}

impl CpuIndex for FcSkipListIndex {
    fn name(&self) -> &'static str {
        "fc_skiplist"
    }

    fn preempt(&self, cpu: usize, key: u64, valid: bool) {
        self.fc.submit(cpu, FcOp::Preempt { key, valid }, Self::apply);
    }

    fn find(&self, caller: usize) -> Option<usize> {
        let response = self.fc.submit(caller, FcOp::Find, Self::apply);
        (response >= 0).then_some(response as usize)
    }

    fn check(&self, nproc: usize) -> Result<(), CheckError> {
        self.fc.lock_quiesced().check(nproc, "fc_skiplist")
    }

    fn check_cpu(&self, cpu: usize, expected: Option<u64>) -> Result<(), CheckError> {
        let found = self.fc.lock_quiesced().key_of(cpu);
        if found == expected {
            Ok(())
        } else {
            Err(CheckError::CpuMismatch {
                index: "fc_skiplist",
                cpu,
                expected,
                found,
            })
        }
    }

    fn entries(&self) -> Vec<CpuEntry> {
        self.fc.lock_quiesced().entries()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn behaves_like_the_locked_skiplist() {
        let idx = FcSkipListIndex::new(4, KeyOrder::EarliestFirst, 17);
        idx.preempt(0, 40, true);
        idx.preempt(2, 10, true);
        idx.preempt(3, 25, true);
        assert_eq!(idx.find(1), Some(2));
        idx.preempt(2, 0, false);
        assert_eq!(idx.find(1), Some(3));
        idx.check(4).unwrap();
    }

    #[test]
    fn concurrent_publishers_leave_a_sound_list() {
        let nproc = 8;
        let idx = Arc::new(FcSkipListIndex::new(nproc, KeyOrder::LatestFirst, 23));
        let threads: Vec<_> = (0..nproc)
            .map(|cpu| {
                let idx = Arc::clone(&idx);
                std::thread::spawn(move || {
                    for round in 0..200u64 {
                        if round % 5 == 4 {
                            idx.preempt(cpu, 0, false);
                        } else {
                            idx.preempt(cpu, (cpu as u64 + 1) * 1000 + round, true);
                        }
                        idx.find(cpu);
                    }
                    idx.preempt(cpu, cpu as u64 + 1, true);
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        idx.check(nproc).unwrap();
        // keys are 1..=8, latest-first puts cpu 7 on top
        assert_eq!(idx.find(0), Some(7));
    }
}
