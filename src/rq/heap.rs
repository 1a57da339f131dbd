/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Arena-backed binomial heap of tasks.
//!
//! The runqueue needs more than a plain priority queue: besides the usual
//! insert / peek / take it must expose the *second* best task (`peek_next`
//! / `take_next`), because that is the task a push migration moves away
//! and a pull migration steals. A binomial forest gives O(log n) for all
//! of it, and the second best is always either another root or a direct
//! child of the best root.
//!
//! Nodes live in an arena indexed by `usize`; parent / child / sibling are
//! arena indices, so the whole structure is safe code with no reference
//! cycles. Tasks are boxed once on arrival and the box moves out intact on
//! removal.

use crate::key::SchedKey;
use crate::task::Queued;

const MAX_DEGREE: usize = 64;

struct Node<T> {
    item: Box<T>,
    degree: usize,
    parent: Option<usize>,
    /// Head of the child list, linked through `sibling`, degrees
    /// descending.
    child: Option<usize>,
    /// Next tree in the root list (degrees ascending) or next child.
    sibling: Option<usize>,
}

pub struct TaskHeap<T: Queued> {
    slots: Vec<Option<Node<T>>>,
    free: Vec<usize>,
    /// Root list head, degrees strictly ascending.
    head: Option<usize>,
    len: usize,
}

impl<T: Queued> TaskHeap<T> {
    pub fn new() -> Self {
        TaskHeap {
            slots: Vec::new(),
            free: Vec::new(),
            head: None,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    // ── Arena helpers ─────────────────────────────────────────────────────────

    fn node(&self, idx: usize) -> &Node<T> {
        self.slots[idx].as_ref().expect("vacant heap arena slot")
    }

    fn node_mut(&mut self, idx: usize) -> &mut Node<T> {
        self.slots[idx].as_mut().expect("vacant heap arena slot")
    }

    fn alloc(&mut self, item: Box<T>) -> usize {
        let node = Node {
            item,
            degree: 0,
            parent: None,
            child: None,
            sibling: None,
        };
        match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(node);
                idx
            }
            None => {
                self.slots.push(Some(node));
                self.slots.len() - 1
            }
        }
    }

    fn release(&mut self, idx: usize) -> Box<T> {
        let node = self.slots[idx].take().expect("vacant heap arena slot");
        self.free.push(idx);
        node.item
    }

    /// Strict "a wins a preemption against b".
    fn better(&self, a: usize, b: usize) -> bool {
        self.node(a).item.key().preempts(self.node(b).item.key())
    }

    fn swap_items(&mut self, a: usize, b: usize) {
        debug_assert_ne!(a, b);
        let (lo, hi) = if a < b { (a, b) } else { (b, a) };
        let (left, right) = self.slots.split_at_mut(hi);
        let na = left[lo].as_mut().expect("vacant heap arena slot");
        let nb = right[0].as_mut().expect("vacant heap arena slot");
        std::mem::swap(&mut na.item, &mut nb.item);
    }

    // ── Forest maintenance ────────────────────────────────────────────────────

    fn roots(&self) -> Vec<usize> {
        let mut out = Vec::new();
        let mut cur = self.head;
        while let Some(idx) = cur {
            out.push(idx);
            cur = self.node(idx).sibling;
        }
        out
    }

    /// Make `loser` the first child of `winner`; degrees must match.
    fn link(&mut self, winner: usize, loser: usize) {
        debug_assert_eq!(self.node(winner).degree, self.node(loser).degree);
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

    /// Rebuild the forest from a set of trees, pairing equal degrees like
    /// binary addition.
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
                        let (winner, loser) = if self.better(other, tree) {
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

        // relink the root list, degrees ascending
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

    /// Detach the children of `idx` and return them as independent trees.
    fn orphan_children(&mut self, idx: usize) -> Vec<usize> {
        let mut children = Vec::new();
        let mut cur = self.node(idx).child;
        while let Some(c) = cur {
            cur = self.node(c).sibling;
            let n = self.node_mut(c);
            n.parent = None;
            n.sibling = None;
            children.push(c);
        }
        self.node_mut(idx).child = None;
        children
    }

    fn best_root(&self) -> Option<usize> {
        let mut best: Option<usize> = None;
        let mut cur = self.head;
        while let Some(idx) = cur {
            best = match best {
                None => Some(idx),
                Some(b) if self.better(idx, b) => Some(idx),
                keep => keep,
            };
            cur = self.node(idx).sibling;
        }
        best
    }

    /// The second-best node: best among the other roots and the direct
    /// children of the best root.
    fn second_best(&self) -> Option<usize> {
        let best = self.best_root()?;
        let mut cand: Option<usize> = None;
        let consider = |heap: &Self, idx: usize, cand: &mut Option<usize>| {
            *cand = match *cand {
                None => Some(idx),
                Some(c) if heap.better(idx, c) => Some(idx),
                keep => keep,
            };
        };

        let mut cur = self.head;
        while let Some(idx) = cur {
            if idx != best {
                consider(self, idx, &mut cand);
            }
            cur = self.node(idx).sibling;
        }
        let mut cur = self.node(best).child;
        while let Some(idx) = cur {
            consider(self, idx, &mut cand);
            cur = self.node(idx).sibling;
        }
        cand
    }

    /// Remove the tree root `idx` from the forest and free it.
    fn remove_root(&mut self, idx: usize) -> Box<T> {
        let mut trees: Vec<usize> = self.roots().into_iter().filter(|&r| r != idx).collect();
        trees.extend(self.orphan_children(idx));
        self.union(trees);
        self.len -= 1;
        self.release(idx)
    }

    /// Remove an arbitrary node: float its item to the root of its tree by
    /// swapping along the parent chain, then remove that root. The items
    /// displaced downwards held better keys, so heap order is preserved.
    fn remove_at(&mut self, idx: usize) -> Box<T> {
        let mut cur = idx;
        while let Some(parent) = self.node(cur).parent {
            self.swap_items(cur, parent);
            cur = parent;
        }
        self.remove_root(cur)
    }

    // ── Public operations ─────────────────────────────────────────────────────

    pub fn insert(&mut self, item: Box<T>) {
        let idx = self.alloc(item);
        let mut trees = self.roots();
        trees.push(idx);
        self.union(trees);
        self.len += 1;
    }

    pub fn peek(&self) -> Option<&T> {
        self.best_root().map(|idx| &*self.node(idx).item)
    }

    pub fn peek_mut(&mut self) -> Option<&mut T> {
        let idx = self.best_root()?;
        Some(&mut *self.node_mut(idx).item)
    }

    pub fn peek_next(&self) -> Option<&T> {
        self.second_best().map(|idx| &*self.node(idx).item)
    }

    pub fn take(&mut self) -> Option<Box<T>> {
        let idx = self.best_root()?;
        Some(self.remove_root(idx))
    }

    pub fn take_next(&mut self) -> Option<Box<T>> {
        let idx = self.second_best()?;
        Some(self.remove_at(idx))
    }

    /// Remove and return every task, best first.
    pub fn drain(&mut self) -> Vec<Box<T>> {
        let mut out = Vec::with_capacity(self.len);
        while let Some(item) = self.take() {
            out.push(item);
        }
        out
    }

    /// All tasks in arena order, for diagnostics.
    pub fn items(&self) -> impl Iterator<Item = &T> {
        self.slots
            .iter()
            .filter_map(|s| s.as_ref().map(|n| &*n.item))
    }

    // ── Structural validation ─────────────────────────────────────────────────

    /// Verify the binomial-forest shape and the heap order. Non-destructive.
    pub fn check(&self) -> Result<(), &'static str> {
        let mut visited = 0usize;
        let mut last_degree: Option<usize> = None;

        let mut cur = self.head;
        while let Some(idx) = cur {
            let node = self.node(idx);
            if node.parent.is_some() {
                return Err("root with a parent link");
            }
            if let Some(d) = last_degree {
                if node.degree <= d {
                    return Err("root degrees not strictly ascending");
                }
            }
            last_degree = Some(node.degree);
            visited += self.check_tree(idx)?;
            cur = node.sibling;
        }

        if visited != self.len {
            return Err("reachable node count disagrees with len");
        }
        Ok(())
    }

    fn check_tree(&self, idx: usize) -> Result<usize, &'static str> {
        let node = self.node(idx);
        let mut count = 1usize;
        let mut expected = node.degree;
        let mut cur = node.child;
        while let Some(c) = cur {
            let child = self.node(c);
            if expected == 0 {
                return Err("more children than degree");
            }
            expected -= 1;
            if child.degree != expected {
                return Err("child degree out of sequence");
            }
            if child.parent != Some(idx) {
                return Err("child parent link broken");
            }
            if child.item.key().preempts(node.item.key()) {
                return Err("heap order violated");
            }
            count += self.check_tree(c)?;
            cur = child.sibling;
        }
        if expected != 0 {
            return Err("fewer children than degree");
        }
        Ok(count)
    }
}

impl<T: Queued> Default for TaskHeap<T> {
    fn default() -> Self {
        Self::new()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
