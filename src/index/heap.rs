/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Binomial-heap index variant.
//!
//! A binomial forest over `(cpu, key)` nodes, with a direct `cpu → slot`
//! table so one CPU's node can be located and replaced in O(log n). A
//! single mutex serialises every operation; `find` takes the same lock and
//! reads the best root, so readers always observe a consistent snapshot.

use parking_lot::Mutex;

use crate::check::CheckError;
use crate::index::{CpuEntry, CpuIndex};
use crate::key::KeyOrder;

const MAX_DEGREE: usize = 64;

struct Node {
    cpu: usize,
    key: u64,
    degree: usize,
    parent: Option<usize>,
    child: Option<usize>,
    sibling: Option<usize>,
}

struct Core {
    order: KeyOrder,
    slots: Vec<Option<Node>>,
    free: Vec<usize>,
    head: Option<usize>,
    cpu_to_slot: Vec<Option<usize>>,
}

impl Core {
    fn node(&self, idx: usize) -> &Node {
        self.slots[idx].as_ref().expect("vacant index heap slot")
    }

    fn node_mut(&mut self, idx: usize) -> &mut Node {
        self.slots[idx].as_mut().expect("vacant index heap slot")
    }

    fn precedes(&self, a: usize, b: usize) -> bool {
        self.order.precedes(self.node(a).key, self.node(b).key)
    }

    /// Swap the payloads of two nodes, keeping the `cpu → slot` table in
    /// step.
    fn swap_payload(&mut self, a: usize, b: usize) {
        debug_assert_ne!(a, b);
        let (lo, hi) = if a < b { (a, b) } else { (b, a) };
        let (left, right) = self.slots.split_at_mut(hi);
        let na = left[lo].as_mut().expect("vacant index heap slot");
        let nb = right[0].as_mut().expect("vacant index heap slot");
        std::mem::swap(&mut na.cpu, &mut nb.cpu);
        std::mem::swap(&mut na.key, &mut nb.key);
        let cpu_a = self.node(a).cpu;
        let cpu_b = self.node(b).cpu;
        self.cpu_to_slot[cpu_a] = Some(a);
        self.cpu_to_slot[cpu_b] = Some(b);
    }

    fn roots(&self) -> Vec<usize> {
        let mut out = Vec::new();
        let mut cur = self.head;
        while let Some(idx) = cur {
            out.push(idx);
            cur = self.node(idx).sibling;
        }
        out
    }

    fn link(&mut self, winner: usize, loser: usize) {
        let old_child = self.node(winner).child;
        {
            let l = self.node_mut(loser);
            l.parent = Some(winner);
            l.sibling = old_child;
        }
        let w = self.node_mut(winner);
        w.child = Some(loser);
        w.degree += 1;
    }

    fn union(&mut self, trees: Vec<usize>) {
        let mut buckets: [Option<usize>; MAX_DEGREE] = [None; MAX_DEGREE];
        for tree in trees {
            let mut tree = tree;
            loop {
                let d = self.node(tree).degree;
                match buckets[d].take() {
                    None => {
                        buckets[d] = Some(tree);
                        break;
                    }
                    Some(other) => {
                        let (winner, loser) = if self.precedes(other, tree) {
                            (other, tree)
                        } else {
                            (tree, other)
                        };
                        self.link(winner, loser);
                        tree = winner;
                    }
                }
            }
        }
        self.head = None;
        let mut tail: Option<usize> = None;
        for tree in buckets.into_iter().flatten() {
            {
                let n = self.node_mut(tree);
                n.parent = None;
                n.sibling = None;
            }
            match tail {
                None => self.head = Some(tree),
                Some(prev) => self.node_mut(prev).sibling = Some(tree),
            }
            tail = Some(tree);
        }
    }

    fn best_root(&self) -> Option<usize> {
        let mut best: Option<usize> = None;
        let mut cur = self.head;
        while let Some(idx) = cur {
            best = match best {
                None => Some(idx),
                Some(b) if self.precedes(idx, b) => Some(idx),
                keep => keep,
            };
            cur = self.node(idx).sibling;
        }
        best
    }

    fn insert(&mut self, cpu: usize, key: u64) {
        let node = Node {
            cpu,
            key,
            degree: 0,
            parent: None,
            child: None,
            sibling: None,
        };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(node);
                idx
            }
            None => {
                self.slots.push(Some(node));
                self.slots.len() - 1
            }
        };
        self.cpu_to_slot[cpu] = Some(idx);
        let mut trees = self.roots();
        trees.push(idx);
        self.union(trees);
    }

    fn remove(&mut self, slot: usize) {
        // float the doomed payload to its tree root, then drop the root
        let mut cur = slot;
        while let Some(parent) = self.node(cur).parent {
            self.swap_payload(cur, parent);
            cur = parent;
        }

        let mut trees: Vec<usize> = self.roots().into_iter().filter(|&r| r != cur).collect();
        let mut child = self.node(cur).child;
        while let Some(c) = child {
            child = self.node(c).sibling;
            let n = self.node_mut(c);
            n.parent = None;
            n.sibling = None;
            trees.push(c);
        }
        self.union(trees);

        let node = self.slots[cur].take().expect("vacant index heap slot");
        self.cpu_to_slot[node.cpu] = None;
        self.free.push(cur);
    }

    fn check_tree(&self, idx: usize) -> Result<usize, String> {
        let node = self.node(idx);
        let mut count = 1usize;
        let mut expected = node.degree;
        let mut cur = node.child;
        while let Some(c) = cur {
            let child = self.node(c);
            if expected == 0 {
                return Err(format!("slot {idx}: more children than degree"));
            }
            expected -= 1;
            if child.degree != expected {
                return Err(format!("slot {c}: child degree out of sequence"));
            }
            if child.parent != Some(idx) {
                return Err(format!("slot {c}: parent link broken"));
            }
            if self.order.precedes(child.key, node.key) {
                return Err(format!("slot {c}: heap order violated"));
            }
            count += self.check_tree(c)?;
            cur = child.sibling;
        }
        if expected != 0 {
            return Err(format!("slot {idx}: fewer children than degree"));
        }
        Ok(count)
    }
}

// ── HeapIndex ─────────────────────────────────────────────────────────────────

pub struct HeapIndex {
    core: Mutex<Core>,
}

impl HeapIndex {
    pub fn new(nproc: usize, order: KeyOrder) -> Self {
        HeapIndex {
            core: Mutex::new(Core {
                order,
                slots: Vec::with_capacity(nproc),
                free: Vec::new(),
                head: None,
                cpu_to_slot: vec![None; nproc],
            }),
        }
    }
}

impl CpuIndex for HeapIndex {
    fn name(&self) -> &'static str {
        "heap"
    }

    fn preempt(&self, cpu: usize, key: u64, valid: bool) {
        let mut core = self.core.lock();
        match (core.cpu_to_slot[cpu], valid) {
            (None, false) => {}
            (None, true) => core.insert(cpu, key),
            (Some(slot), false) => core.remove(slot),
            (Some(slot), true) => {
                if core.node(slot).key != key {
                    core.remove(slot);
                    core.insert(cpu, key);
                }
            }
        }
    }

    fn find(&self, _caller: usize) -> Option<usize> {
        let core = self.core.lock();
        core.best_root().map(|idx| core.node(idx).cpu)
    }

    fn check(&self, nproc: usize) -> Result<(), CheckError> {
        let core = self.core.lock();
        let fail = |what: String| CheckError::Index {
            index: "heap",
            what,
        };

        let mut visited = 0usize;
        let mut last_degree: Option<usize> = None;
        let mut cur = core.head;
        while let Some(idx) = cur {
            let node = core.node(idx);
            if node.parent.is_some() {
                return Err(fail(format!("slot {idx}: root with a parent link")));
            }
            if let Some(d) = last_degree {
                if node.degree <= d {
                    return Err(fail("root degrees not strictly ascending".into()));
                }
            }
            last_degree = Some(node.degree);
            visited += core.check_tree(idx).map_err(&fail)?;
            cur = node.sibling;
        }

        let mapped = core.cpu_to_slot[..nproc]
            .iter()
            .filter(|s| s.is_some())
            .count();
        if visited != mapped {
            return Err(fail(format!(
                "{visited} reachable nodes but {mapped} mapped CPUs"
            )));
        }
        for (cpu, slot) in core.cpu_to_slot.iter().enumerate().take(nproc) {
            if let Some(slot) = slot {
                if core.node(*slot).cpu != cpu {
                    return Err(fail(format!("cpu {cpu}: slot table points elsewhere")));
                }
            }
        }
        Ok(())
    }

    fn check_cpu(&self, cpu: usize, expected: Option<u64>) -> Result<(), CheckError> {
        let core = self.core.lock();
        let found = core.cpu_to_slot[cpu].map(|slot| core.node(slot).key);
        if found == expected {
            Ok(())
        } else {
            Err(CheckError::CpuMismatch {
                index: "heap",
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
                key: slot.map(|s| core.node(s).key),
            })
            .collect()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_tracks_the_best_key() {
        let idx = HeapIndex::new(4, KeyOrder::EarliestFirst);
        assert_eq!(idx.find(0), None);
        idx.preempt(0, 30, true);
        idx.preempt(1, 10, true);
        idx.preempt(2, 20, true);
        assert_eq!(idx.find(0), Some(1));
        idx.preempt(1, 40, true);
        assert_eq!(idx.find(0), Some(2));
        idx.check(4).unwrap();
    }

    #[test]
    fn removing_the_best_promotes_the_next() {
        let idx = HeapIndex::new(4, KeyOrder::LatestFirst);
        idx.preempt(0, 5, true);
        idx.preempt(1, 9, true);
        idx.preempt(2, 7, true);
        assert_eq!(idx.find(0), Some(1));
        idx.preempt(1, 0, false);
        assert_eq!(idx.find(0), Some(2));
        idx.check(4).unwrap();
    }

    #[test]
    fn clearing_an_absent_cpu_is_harmless() {
        let idx = HeapIndex::new(2, KeyOrder::EarliestFirst);
        idx.preempt(0, 0, false);
        idx.check(2).unwrap();
        assert_eq!(idx.find(0), None);
    }

    #[test]
    fn entries_snapshot_the_whole_table() {
        let idx = HeapIndex::new(3, KeyOrder::EarliestFirst);
        idx.preempt(1, 15, true);
        let entries = idx.entries();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].key, None);
        assert_eq!(entries[1].key, Some(15));
        assert_eq!(entries[2].key, None);
    }
}
