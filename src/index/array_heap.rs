/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Indexed array-heap variant.
//!
//! A binary heap laid out in an array, with a secondary `cpu → slot`
//! table. Publishing a new key for a CPU touches its slot in place and
//! restores the heap property with a single sift, so updates stay
//! O(log n) without a search. A coarse mutex serialises everything.

use parking_lot::Mutex;

use crate::check::CheckError;
use crate::index::{CpuEntry, CpuIndex};
use crate::key::KeyOrder;

struct Core {
    order: KeyOrder,
    /// Occupied prefix of the heap: `(cpu, key)` pairs.
    heap: Vec<(usize, u64)>,
    cpu_to_slot: Vec<Option<usize>>,
}

impl Core {
    fn precedes(&self, a: usize, b: usize) -> bool {
        self.order.precedes(self.heap[a].1, self.heap[b].1)
    }

    fn place(&mut self, slot: usize) {
        self.cpu_to_slot[self.heap[slot].0] = Some(slot);
    }

    fn swap(&mut self, a: usize, b: usize) {
        self.heap.swap(a, b);
        self.place(a);
        self.place(b);
    }

    fn sift_up(&mut self, mut slot: usize) -> usize {
        while slot > 0 {
            let parent = (slot - 1) / 2;
            if !self.precedes(slot, parent) {
                break;
            }
            self.swap(slot, parent);
            slot = parent;
        }
        slot
    }

    fn sift_down(&mut self, mut slot: usize) -> usize {
        loop {
            let left = 2 * slot + 1;
            let right = left + 1;
            let mut best = slot;
            if left < self.heap.len() && self.precedes(left, best) {
                best = left;
            }
            if right < self.heap.len() && self.precedes(right, best) {
                best = right;
            }
            if best == slot {
                return slot;
            }
            self.swap(slot, best);
            slot = best;
        }
    }

    fn insert(&mut self, cpu: usize, key: u64) {
        self.heap.push((cpu, key));
        let slot = self.heap.len() - 1;
        self.place(slot);
        self.sift_up(slot);
    }

    fn remove(&mut self, slot: usize) {
        let (cpu, _) = self.heap[slot];
        self.cpu_to_slot[cpu] = None;
        let last = self.heap.len() - 1;
        if slot == last {
            self.heap.pop();
            return;
        }
        self.swap(slot, last);
        self.heap.pop();
        // the displaced element may need to move either way
        let slot = self.sift_up(slot);
        self.sift_down(slot);
    }

    fn update(&mut self, slot: usize, key: u64) {
        self.heap[slot].1 = key;
        let slot = self.sift_up(slot);
        self.sift_down(slot);
    }
}

// ── ArrayHeapIndex ────────────────────────────────────────────────────────────

pub struct ArrayHeapIndex {
    core: Mutex<Core>,
}

impl ArrayHeapIndex {
    pub fn new(nproc: usize, order: KeyOrder) -> Self {
        ArrayHeapIndex {
            core: Mutex::new(Core {
                order,
                heap: Vec::with_capacity(nproc),
                cpu_to_slot: vec![None; nproc],
            }),
        }
    }
}

impl CpuIndex for ArrayHeapIndex {
    fn name(&self) -> &'static str {
        "array_heap"
    }

    fn preempt(&self, cpu: usize, key: u64, valid: bool) {
        let mut core = self.core.lock();
        match (core.cpu_to_slot[cpu], valid) {
            (None, false) => {}
            (None, true) => core.insert(cpu, key),
            (Some(slot), false) => core.remove(slot),
            (Some(slot), true) => {
                if core.heap[slot].1 != key {
                    core.update(slot, key);
                }
            }
        }
    }

    fn find(&self, _caller: usize) -> Option<usize> {
        let core = self.core.lock();
        core.heap.first().map(|&(cpu, _)| cpu)
    }

    fn check(&self, nproc: usize) -> Result<(), CheckError> {
        let core = self.core.lock();
        let fail = |what: String| CheckError::Index {
            index: "array_heap",
            what,
        };

        for slot in 1..core.heap.len() {
            let parent = (slot - 1) / 2;
            if core.precedes(slot, parent) {
                return Err(fail(format!("slot {slot}: heap property violated")));
            }
        }
        for (slot, &(cpu, _)) in core.heap.iter().enumerate() {
            if core.cpu_to_slot.get(cpu).copied().flatten() != Some(slot) {
                return Err(fail(format!("cpu {cpu}: slot table out of step")));
            }
        }
        let mapped = core.cpu_to_slot[..nproc]
            .iter()
            .filter(|s| s.is_some())
            .count();
        if mapped != core.heap.len() {
            return Err(fail(format!(
                "{mapped} mapped CPUs but {} heap entries",
                core.heap.len()
            )));
        }
        Ok(())
    }

    fn check_cpu(&self, cpu: usize, expected: Option<u64>) -> Result<(), CheckError> {
        let core = self.core.lock();
        let found = core.cpu_to_slot[cpu].map(|slot| core.heap[slot].1);
        if found == expected {
            Ok(())
        } else {
            Err(CheckError::CpuMismatch {
                index: "array_heap",
                cpu,
                expected,
                found,
            })
        }
    }

    fn entries(&self) -> Vec<CpuEntry> {
        let core = self.core.lock();
        core.cpu_to_slot
            .iter()
            .enumerate()
            .map(|(cpu, slot)| CpuEntry {
                cpu,
                key: slot.map(|s| core.heap[s].1),
            })
            .collect()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_is_the_best_key() {
        let idx = ArrayHeapIndex::new(4, KeyOrder::EarliestFirst);
        idx.preempt(0, 40, true);
        idx.preempt(1, 10, true);
        idx.preempt(2, 25, true);
        assert_eq!(idx.find(0), Some(1));
        idx.check(4).unwrap();
    }

    #[test]
    fn in_place_update_sifts_both_directions() {
        let idx = ArrayHeapIndex::new(4, KeyOrder::EarliestFirst);
        idx.preempt(0, 10, true);
        idx.preempt(1, 20, true);
        idx.preempt(2, 30, true);
        // worsen the root: it must sink
        idx.preempt(0, 50, true);
        assert_eq!(idx.find(0), Some(1));
        // improve a leaf: it must rise
        idx.preempt(2, 5, true);
        assert_eq!(idx.find(0), Some(2));
        idx.check(4).unwrap();
    }

    #[test]
    fn remove_middle_slot_keeps_the_table_consistent() {
        let idx = ArrayHeapIndex::new(6, KeyOrder::LatestFirst);
        for (cpu, key) in [(0, 3), (1, 9), (2, 5), (3, 7), (4, 1)] {
            idx.preempt(cpu, key, true);
        }
        idx.preempt(2, 0, false);
        idx.check(6).unwrap();
        assert_eq!(idx.find(0), Some(1));
        assert_eq!(idx.entries()[2].key, None);
    }

    #[test]
    fn emptied_heap_finds_nothing() {
        let idx = ArrayHeapIndex::new(2, KeyOrder::EarliestFirst);
        idx.preempt(0, 4, true);
        idx.preempt(0, 0, false);
        assert_eq!(idx.find(0), None);
        idx.check(2).unwrap();
    }
}
