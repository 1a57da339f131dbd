/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Bitmap flat-combining variant.
//!
//! The top of the structure is a bitmap over key slots: one bit per slot,
//! set while the slot's cohort is non-empty. `find()` reduces to locating
//! the first set bit from the orientation's best end; the cohort below
//! each slot is an ordered doubly-linked list of CPUs sharing that slot.
//! Worth its arithmetic when the key cardinality is small — priority
//! slots, or deadlines discretised onto a bounded window.
//!
//! The topmost slot is reserved for idle CPUs (key 0, which orders as an
//! infinitely late deadline); real keys at or past the reserved slot
//! clamp into the one below it and keep full-key order inside the cohort.
//!
//! Mutation and lookup both travel through the flat-combining layer; the
//! combiner refreshes a cached best CPU on every mutation, so `find`
//! answers in O(1).

use crate::check::CheckError;
use crate::index::fc::{FcLayer, FcOp};
use crate::index::{CpuEntry, CpuIndex};
use crate::key::{KeyOrder, IDLE_KEY};

const WORD_BITS: usize = 64;

struct BmNode {
    key: u64,
    slot: usize,
    linked: bool,
    next: Option<usize>,
    /// `None` means this node is its cohort's head.
    prev: Option<usize>,
}

impl BmNode {
    fn unlinked() -> Self {
        BmNode {
            key: 0,
            slot: 0,
            linked: false,
            next: None,
            prev: None,
        }
    }
}

struct BmCore {
    order: KeyOrder,
    nslots: usize,
    words: Vec<u64>,
    heads: Vec<Option<usize>>,
    nodes: Vec<BmNode>,
    cached: Option<usize>,
}

impl BmCore {
    fn new(nproc: usize, order: KeyOrder, nslots: usize) -> Self {
        // at least one real slot plus the reserved idle slot
        let nslots = nslots.max(2);
        BmCore {
            order,
            nslots,
            words: vec![0; nslots.div_ceil(WORD_BITS)],
            heads: vec![None; nslots],
            nodes: (0..nproc).map(|_| BmNode::unlinked()).collect(),
            cached: None,
        }
    }

    fn slot_of(&self, key: u64) -> usize {
        if key == IDLE_KEY {
            self.nslots - 1
        } else {
            (key as usize).min(self.nslots - 2)
        }
    }

    fn set_bit(&mut self, slot: usize) {
        self.words[slot / WORD_BITS] |= 1 << (slot % WORD_BITS);
    }

    fn clear_bit(&mut self, slot: usize) {
        self.words[slot / WORD_BITS] &= !(1 << (slot % WORD_BITS));
    }

    fn bit(&self, slot: usize) -> bool {
        self.words[slot / WORD_BITS] & (1 << (slot % WORD_BITS)) != 0
    }

    /// First occupied slot from the orientation's best end.
    fn best_slot(&self) -> Option<usize> {
        match self.order {
            KeyOrder::EarliestFirst => {
                for (i, &w) in self.words.iter().enumerate() {
                    if w != 0 {
                        return Some(i * WORD_BITS + w.trailing_zeros() as usize);
                    }
                }
                None
            }
            KeyOrder::LatestFirst => {
                for (i, &w) in self.words.iter().enumerate().rev() {
                    if w != 0 {
                        return Some(i * WORD_BITS + (WORD_BITS - 1) - w.leading_zeros() as usize);
                    }
                }
                None
            }
        }
    }

    fn refresh_cached(&mut self) {
        self.cached = self.best_slot().and_then(|slot| self.heads[slot]);
    }

    fn insert(&mut self, cpu: usize, key: u64) {
        debug_assert!(!self.nodes[cpu].linked);
        let slot = self.slot_of(key);

        // cohort insertion point, full-key order
        let mut prev: Option<usize> = None;
        let mut cur = self.heads[slot];
        while let Some(c) = cur {
            if self.order.precedes(self.nodes[c].key, key) {
                prev = Some(c);
                cur = self.nodes[c].next;
            } else {
                break;
            }
        }

        {
            let node = &mut self.nodes[cpu];
            node.key = key;
            node.slot = slot;
            node.linked = true;
            node.next = cur;
            node.prev = prev;
        }
        match prev {
            None => self.heads[slot] = Some(cpu),
            Some(p) => self.nodes[p].next = Some(cpu),
        }
        if let Some(c) = cur {
            self.nodes[c].prev = Some(cpu);
        }

        self.set_bit(slot);
        self.refresh_cached();
    }

    fn remove(&mut self, cpu: usize) {
        debug_assert!(self.nodes[cpu].linked);
        let (slot, prev, next) = {
            let node = &self.nodes[cpu];
            (node.slot, node.prev, node.next)
        };
        match prev {
            None => self.heads[slot] = next,
            Some(p) => self.nodes[p].next = next,
        }
        if let Some(n) = next {
            self.nodes[n].prev = prev;
        }
        if self.heads[slot].is_none() {
            self.clear_bit(slot);
        }
        self.nodes[cpu] = BmNode::unlinked();
        self.refresh_cached();
    }

    fn update(&mut self, cpu: usize, key: u64, valid: bool) {
        match (self.nodes[cpu].linked, valid) {
            (false, false) => {}
            (false, true) => self.insert(cpu, key),
            (true, false) => self.remove(cpu),
            (true, true) => {
                if self.nodes[cpu].key != key {
                    self.remove(cpu);
                    self.insert(cpu, key);
                }
            }
        }
    }

    fn key_of(&self, cpu: usize) -> Option<u64> {
        let node = &self.nodes[cpu];
        node.linked.then_some(node.key)
    }

    fn entries(&self) -> Vec<CpuEntry> {
        (0..self.nodes.len())
            .map(|cpu| CpuEntry {
                cpu,
                key: self.key_of(cpu),
            })
            .collect()
    }

    fn check(&self, nproc: usize) -> Result<(), CheckError> {
        let fail = |what: String| CheckError::Index {
            index: "bm_fc_skiplist",
            what,
        };

        let mut walked = 0usize;
        for slot in 0..self.nslots {
            if self.bit(slot) != self.heads[slot].is_some() {
                return Err(fail(format!("slot {slot}: bitmap and cohort disagree")));
            }
            let mut prev: Option<usize> = None;
            let mut cur = self.heads[slot];
            while let Some(cpu) = cur {
                let node = &self.nodes[cpu];
                if !node.linked {
                    return Err(fail(format!("cpu {cpu}: unlinked node in slot {slot}")));
                }
                if node.slot != slot || self.slot_of(node.key) != slot {
                    return Err(fail(format!("cpu {cpu}: filed in the wrong slot")));
                }
                if node.prev != prev {
                    return Err(fail(format!("cpu {cpu}: backward link broken")));
                }
                if let Some(p) = prev {
                    if self.order.precedes(node.key, self.nodes[p].key) {
                        return Err(fail(format!("cpu {cpu}: cohort order violated")));
                    }
                }
                walked += 1;
                if walked > self.nodes.len() {
                    return Err(fail(format!("cycle detected in slot {slot}")));
                }
                prev = cur;
                cur = node.next;
            }
        }

        let linked = self.nodes.iter().take(nproc).filter(|n| n.linked).count();
        if walked != linked {
            return Err(fail(format!(
                "{linked} linked nodes but {walked} filed in cohorts"
            )));
        }

        let expected = self.best_slot().and_then(|slot| self.heads[slot]);
        if self.cached != expected {
            return Err(fail(format!(
                "cached best {:?} disagrees with bitmap scan {:?}",
                self.cached, expected
            )));
        }
        Ok(())
    }
}

// ── BmFcSkipListIndex ─────────────────────────────────────────────────────────

pub struct BmFcSkipListIndex {
    fc: FcLayer<BmCore>,
}

impl BmFcSkipListIndex {
    pub fn new(nproc: usize, order: KeyOrder, nslots: usize) -> Self {
        BmFcSkipListIndex {
            fc: FcLayer::new(nproc, BmCore::new(nproc, order, nslots)),
        }
    }

    fn apply(core: &mut BmCore, cpu: usize, op: FcOp) -> i64 {
        match op {
            FcOp::Preempt { key, valid } => {
                core.update(cpu, key, valid);
                -1
            }
            FcOp::Find => core.cached.map_or(-1, |best| best as i64),
        }
    }
}

impl CpuIndex for BmFcSkipListIndex {
    fn name(&self) -> &'static str {
        "bm_fc_skiplist"
    }

    fn preempt(&self, cpu: usize, key: u64, valid: bool) {
        self.fc.submit(cpu, FcOp::Preempt { key, valid }, Self::apply);
    }

    fn find(&self, caller: usize) -> Option<usize> {
        let response = self.fc.submit(caller, FcOp::Find, Self::apply);
        (response >= 0).then_some(response as usize)
    }

    fn check(&self, nproc: usize) -> Result<(), CheckError> {
        self.fc.lock_quiesced().check(nproc)
    }

    fn check_cpu(&self, cpu: usize, expected: Option<u64>) -> Result<(), CheckError> {
        let found = self.fc.lock_quiesced().key_of(cpu);
        if found == expected {
            Ok(())
        } else {
            Err(CheckError::CpuMismatch {
                index: "bm_fc_skiplist",
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

    #[test]
    fn first_set_bit_wins() {
        let idx = BmFcSkipListIndex::new(4, KeyOrder::EarliestFirst, 256);
        idx.preempt(0, 90, true);
        idx.preempt(1, 30, true);
        idx.preempt(2, 60, true);
        assert_eq!(idx.find(3), Some(1));
        idx.check(4).unwrap();
    }

    #[test]
    fn cohorts_share_a_slot() {
        let idx = BmFcSkipListIndex::new(4, KeyOrder::EarliestFirst, 128);
        idx.preempt(0, 50, true);
        idx.preempt(1, 50, true);
        idx.preempt(2, 50, true);
        idx.check(4).unwrap();
        let best = idx.find(3).unwrap();
        assert!(idx.entries()[best].key == Some(50));
        idx.preempt(best, 0, false);
        idx.check(4).unwrap();
        assert_eq!(idx.entries()[best].key, None);
        assert!(idx.find(3).is_some());
    }

    #[test]
    fn idle_key_sits_in_the_reserved_top_slot() {
        let idx = BmFcSkipListIndex::new(4, KeyOrder::LatestFirst, 512);
        idx.preempt(0, 400, true);
        idx.preempt(1, IDLE_KEY, true);
        assert_eq!(idx.find(2), Some(1));
        idx.check(4).unwrap();
    }

    #[test]
    fn oversized_keys_clamp_into_the_last_real_slot() {
        let idx = BmFcSkipListIndex::new(4, KeyOrder::EarliestFirst, 64);
        idx.preempt(0, 1000, true);
        idx.preempt(1, 2000, true);
        idx.preempt(2, 10, true);
        idx.check(4).unwrap();
        assert_eq!(idx.find(3), Some(2));
        idx.preempt(2, 0, false);
        // both clamped keys share a slot; full-key order picks cpu 0
        assert_eq!(idx.find(3), Some(0));
    }

    #[test]
    fn latest_first_scans_from_the_top() {
        let idx = BmFcSkipListIndex::new(4, KeyOrder::LatestFirst, 256);
        idx.preempt(0, 10, true);
        idx.preempt(1, 200, true);
        idx.preempt(2, 100, true);
        assert_eq!(idx.find(3), Some(1));
        idx.preempt(1, 0, false);
        assert_eq!(idx.find(3), Some(2));
        idx.check(4).unwrap();
    }
}
