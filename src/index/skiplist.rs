/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Doubly-linked skip-list variant.
//!
//! [`SlCore`] is the unsynchronised list itself: nodes live in an arena
//! indexed by CPU id (there is never more than one node per CPU), forward
//! and backward links are arena indices, and the backward links make
//! removal O(1) per level once the node is in hand. The `cpu → node`
//! mapping is therefore the arena itself.
//!
//! [`SkipListIndex`] wraps the core in a reader-writer lock: publishes
//! take the writer side, `find` takes the reader side and returns the
//! first forward pointer at level 0, which by construction is the best
//! key. The flat-combining variants reuse the same core with their own
//! synchronisation.

use parking_lot::RwLock;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::check::CheckError;
use crate::index::{CpuEntry, CpuIndex};
use crate::key::KeyOrder;

pub(super) const MAX_LEVEL: usize = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Prev {
    None,
    Head,
    Node(usize),
}

struct SlNode {
    key: u64,
    linked: bool,
    height: usize,
    next: [Option<usize>; MAX_LEVEL],
    prev: [Prev; MAX_LEVEL],
}

impl SlNode {
    fn unlinked() -> Self {
        SlNode {
            key: 0,
            linked: false,
            height: 0,
            next: [None; MAX_LEVEL],
            prev: [Prev::None; MAX_LEVEL],
        }
    }
}

// ── SlCore ────────────────────────────────────────────────────────────────────

pub(super) struct SlCore {
    order: KeyOrder,
    /// Levels currently in use, at least 1.
    level: usize,
    head: [Option<usize>; MAX_LEVEL],
    nodes: Vec<SlNode>,
    rng: SmallRng,
}

impl SlCore {
    pub(super) fn new(nproc: usize, order: KeyOrder, seed: u64) -> Self {
        SlCore {
            order,
            level: 1,
            head: [None; MAX_LEVEL],
            nodes: (0..nproc).map(|_| SlNode::unlinked()).collect(),
            rng: SmallRng::seed_from_u64(seed),
        }
    }

    fn next_of(&self, prev: Prev, lvl: usize) -> Option<usize> {
        match prev {
            Prev::Head => self.head[lvl],
            Prev::Node(idx) => self.nodes[idx].next[lvl],
            Prev::None => None,
        }
    }

    fn set_next(&mut self, prev: Prev, lvl: usize, next: Option<usize>) {
        match prev {
            Prev::Head => self.head[lvl] = next,
            Prev::Node(idx) => self.nodes[idx].next[lvl] = next,
            Prev::None => {}
        }
    }

    /// Geometric level draw, p = 1/2, capped at [`MAX_LEVEL`].
    fn draw_height(&mut self) -> usize {
        let mut height = 1;
        while height < MAX_LEVEL && self.rng.gen::<bool>() {
            height += 1;
        }
        height
    }

    fn insert(&mut self, cpu: usize, key: u64) {
        debug_assert!(!self.nodes[cpu].linked);
        let height = self.draw_height();

        let mut preds = [Prev::Head; MAX_LEVEL];
        let mut cur = Prev::Head;
        for lvl in (0..self.level).rev() {
            while let Some(n) = self.next_of(cur, lvl) {
                if self.order.precedes(self.nodes[n].key, key) {
                    cur = Prev::Node(n);
                } else {
                    break;
                }
            }
            preds[lvl] = cur;
        }
        if height > self.level {
            self.level = height;
        }

        for lvl in 0..height {
            let succ = self.next_of(preds[lvl], lvl);
            {
                let node = &mut self.nodes[cpu];
                node.next[lvl] = succ;
                node.prev[lvl] = preds[lvl];
            }
            self.set_next(preds[lvl], lvl, Some(cpu));
            if let Some(s) = succ {
                self.nodes[s].prev[lvl] = Prev::Node(cpu);
            }
        }

        let node = &mut self.nodes[cpu];
        node.key = key;
        node.height = height;
        node.linked = true;
    }

    fn remove(&mut self, cpu: usize) {
        debug_assert!(self.nodes[cpu].linked);
        for lvl in 0..self.nodes[cpu].height {
            let prev = self.nodes[cpu].prev[lvl];
            let next = self.nodes[cpu].next[lvl];
            self.set_next(prev, lvl, next);
            if let Some(n) = next {
                self.nodes[n].prev[lvl] = prev;
            }
            let node = &mut self.nodes[cpu];
            node.next[lvl] = None;
            node.prev[lvl] = Prev::None;
        }
        let node = &mut self.nodes[cpu];
        node.linked = false;
        node.height = 0;
        while self.level > 1 && self.head[self.level - 1].is_none() {
            self.level -= 1;
        }
    }

    pub(super) fn update(&mut self, cpu: usize, key: u64, valid: bool) {
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

    /// The best CPU: the first node of the bottom list.
    pub(super) fn first(&self) -> Option<usize> {
        self.head[0]
    }

    pub(super) fn key_of(&self, cpu: usize) -> Option<u64> {
        let node = &self.nodes[cpu];
        node.linked.then_some(node.key)
    }

    pub(super) fn entries(&self) -> Vec<CpuEntry> {
        (0..self.nodes.len())
            .map(|cpu| CpuEntry {
                cpu,
                key: self.key_of(cpu),
            })
            .collect()
    }

    pub(super) fn check(&self, nproc: usize, index: &'static str) -> Result<(), CheckError> {
        let fail = |what: String| CheckError::Index { index, what };

        if self.level == 0 || self.level > MAX_LEVEL {
            return Err(fail(format!("level {} out of range", self.level)));
        }
        for lvl in self.level..MAX_LEVEL {
            if self.head[lvl].is_some() {
                return Err(fail(format!("head populated above level {}", self.level)));
            }
        }

        for lvl in 0..self.level {
            let mut prev = Prev::Head;
            let mut cur = self.head[lvl];
            let mut walked = 0usize;
            while let Some(idx) = cur {
                let node = &self.nodes[idx];
                if !node.linked {
                    return Err(fail(format!("unlinked node {idx} on level {lvl}")));
                }
                if node.height <= lvl {
                    return Err(fail(format!("node {idx} above its height on level {lvl}")));
                }
                if node.prev[lvl] != prev {
                    return Err(fail(format!("node {idx}: backward link broken on level {lvl}")));
                }
                if let Prev::Node(p) = prev {
                    if self.order.precedes(node.key, self.nodes[p].key) {
                        return Err(fail(format!("ordering violated at node {idx} level {lvl}")));
                    }
                }
                walked += 1;
                if walked > self.nodes.len() {
                    return Err(fail(format!("cycle detected on level {lvl}")));
                }
                prev = Prev::Node(idx);
                cur = node.next[lvl];
            }
        }

        let linked = self.nodes.iter().take(nproc).filter(|n| n.linked).count();
        let mut walked = 0usize;
        let mut cur = self.head[0];
        while let Some(idx) = cur {
            walked += 1;
            if walked > self.nodes.len() {
                break;
            }
            cur = self.nodes[idx].next[0];
        }
        if walked != linked {
            return Err(fail(format!(
                "{linked} linked nodes but {walked} reachable on level 0"
            )));
        }
        Ok(())
    }
}

// ── SkipListIndex ─────────────────────────────────────────────────────────────

pub struct SkipListIndex {
    core: RwLock<SlCore>,
}

impl SkipListIndex {
    pub fn new(nproc: usize, order: KeyOrder, seed: u64) -> Self {
        SkipListIndex {
            core: RwLock::new(SlCore::new(nproc, order, seed)),
        }
    }
}

impl CpuIndex for SkipListIndex {
    fn name(&self) -> &'static str {
        "skiplist"
    }

    fn preempt(&self, cpu: usize, key: u64, valid: bool) {
        self.core.write().update(cpu, key, valid);
    }

    fn find(&self, _caller: usize) -> Option<usize> {
        self.core.read().first()
    }

    fn check(&self, nproc: usize) -> Result<(), CheckError> {
        self.core.read().check(nproc, "skiplist")
    }

    fn check_cpu(&self, cpu: usize, expected: Option<u64>) -> Result<(), CheckError> {
        let found = self.core.read().key_of(cpu);
        if found == expected {
            Ok(())
        } else {
            Err(CheckError::CpuMismatch {
                index: "skiplist",
                cpu,
                expected,
                found,
            })
        }
    }

    fn entries(&self) -> Vec<CpuEntry> {
        self.core.read().entries()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_is_the_best_key() {
        let idx = SkipListIndex::new(8, KeyOrder::EarliestFirst, 1);
        idx.preempt(3, 30, true);
        idx.preempt(5, 10, true);
        idx.preempt(7, 20, true);
        assert_eq!(idx.find(0), Some(5));
        idx.check(8).unwrap();
    }

    #[test]
    fn latest_first_reverses_the_list() {
        let idx = SkipListIndex::new(4, KeyOrder::LatestFirst, 1);
        idx.preempt(0, 30, true);
        idx.preempt(1, 90, true);
        idx.preempt(2, 60, true);
        assert_eq!(idx.find(0), Some(1));
        idx.check(4).unwrap();
    }

    #[test]
    fn removal_uses_backward_links() {
        let idx = SkipListIndex::new(8, KeyOrder::EarliestFirst, 7);
        for cpu in 0..8 {
            idx.preempt(cpu, (cpu as u64 + 1) * 10, true);
        }
        idx.preempt(0, 0, false); // the current head
        idx.preempt(4, 0, false); // somewhere in the middle
        idx.check(8).unwrap();
        assert_eq!(idx.find(0), Some(1));
    }

    #[test]
    fn update_in_place_moves_the_node() {
        let idx = SkipListIndex::new(4, KeyOrder::EarliestFirst, 3);
        idx.preempt(0, 10, true);
        idx.preempt(1, 20, true);
        idx.preempt(0, 30, true);
        assert_eq!(idx.find(0), Some(1));
        idx.check(4).unwrap();
    }

    #[test]
    fn heavy_churn_keeps_the_structure_sound() {
        use rand::rngs::SmallRng;
        use rand::{Rng, SeedableRng};

        let idx = SkipListIndex::new(16, KeyOrder::EarliestFirst, 11);
        let mut rng = SmallRng::seed_from_u64(5);
        for _ in 0..5000 {
            let cpu = rng.gen_range(0..16);
            if rng.gen_bool(0.25) {
                idx.preempt(cpu, 0, false);
            } else {
                idx.preempt(cpu, rng.gen_range(1..500), true);
            }
        }
        idx.check(16).unwrap();
    }
}
