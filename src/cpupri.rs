/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Root-domain CPU priority index for the fixed-priority discipline.
//!
//! One vector per priority slot, each holding an atomic member count and a
//! bitmask of the CPUs currently running at that slot. `set` is called with
//! the target CPU's runqueue lock held; `find` scans with no lock at all,
//! which is why the mask/count update order and the fences matter: a
//! scanner must see a moving CPU in its old slot or its new slot, never in
//! both and never in neither.

use std::sync::atomic::{fence, AtomicI32, AtomicUsize, Ordering};

use crate::cpumask::{AtomicCpuMask, CpuMask};
use crate::key::SchedKey;

pub const MAX_RT_PRIO: i32 = 100;
pub const CPUPRI_NR_PRIORITIES: usize = (MAX_RT_PRIO + 2) as usize;

pub const CPUPRI_INVALID: i32 = -1;
pub const CPUPRI_IDLE: i32 = 0;
pub const CPUPRI_NORMAL: i32 = 1;

pub const MAX_PRIO: i32 = MAX_RT_PRIO + 40;

/// Map a raw priority from the 0..=140 scale onto the slot scale:
/// `-1` invalid, `0` idle, `1` normal, `2..=101` the RT priorities with
/// higher slot numbers meaning more urgent.
pub fn convert_prio(prio: i32) -> i32 {
    if prio == CPUPRI_INVALID {
        CPUPRI_INVALID
    } else if prio == MAX_PRIO {
        CPUPRI_IDLE
    } else if prio >= MAX_RT_PRIO {
        CPUPRI_NORMAL
    } else {
        MAX_RT_PRIO - prio + 1
    }
}

/// Fixed-priority keys are raw priorities on the 0..=140 scale.
impl SchedKey for i32 {
    const INVALID: i32 = CPUPRI_INVALID;

    fn preempts(self, other: i32) -> bool {
        convert_prio(self) > convert_prio(other)
    }

    fn to_bits(self) -> u64 {
        self as u32 as u64
    }

    fn from_bits(bits: u64) -> i32 {
        bits as u32 as i32
    }
}

// ── CpuPriority ───────────────────────────────────────────────────────────────

struct PriVec {
    count: AtomicUsize,
    mask: AtomicCpuMask,
}

/// The per-root-domain priority index: slot → CPUs at that slot.
pub struct CpuPriority {
    pri_to_cpu: Vec<PriVec>,
    cpu_to_pri: Vec<AtomicI32>,
}

impl CpuPriority {
    pub fn new(nr_cpus: usize) -> Self {
        let pri_to_cpu = (0..CPUPRI_NR_PRIORITIES)
            .map(|_| PriVec {
                count: AtomicUsize::new(0),
                mask: AtomicCpuMask::new(),
            })
            .collect();
        let cpu_to_pri = (0..nr_cpus).map(|_| AtomicI32::new(CPUPRI_INVALID)).collect();
        CpuPriority {
            pri_to_cpu,
            cpu_to_pri,
        }
    }

    /// Record that `cpu` now runs at raw priority `newpri`.
    ///
    /// Caller holds `cpu`'s runqueue lock. Slot membership is updated
    /// add-first: the new slot's mask before its count, a full fence, then
    /// the old slot's count before its mask, so the lock-free scan in
    /// [`find`](Self::find) never loses the CPU entirely.
    pub fn set(&self, cpu: usize, newpri: i32) {
        let newpri = convert_prio(newpri);
        let oldpri = self.cpu_to_pri[cpu].load(Ordering::Relaxed);

        if newpri == oldpri {
            return;
        }

        let mut did_mb = false;
        if newpri != CPUPRI_INVALID {
            let vec = &self.pri_to_cpu[newpri as usize];
            vec.mask.set(cpu);
            fence(Ordering::SeqCst);
            vec.count.fetch_add(1, Ordering::SeqCst);
            did_mb = true;
        }
        if oldpri != CPUPRI_INVALID {
            let vec = &self.pri_to_cpu[oldpri as usize];
            if did_mb {
                fence(Ordering::SeqCst);
            }
            vec.count.fetch_sub(1, Ordering::SeqCst);
            fence(Ordering::SeqCst);
            vec.mask.clear(cpu);
        }

        self.cpu_to_pri[cpu].store(newpri, Ordering::Relaxed);
    }

    /// Find CPUs running below raw priority `prio` that intersect
    /// `allowed`, scanning slots from the least urgent upwards.
    ///
    /// The result reflects one racy pass; callers double-lock and
    /// re-validate before migrating, so a stale answer costs a retry and
    /// nothing else.
    pub fn find(&self, prio: i32, allowed: &CpuMask) -> Option<CpuMask> {
        let task_pri = convert_prio(prio);
        if task_pri >= MAX_RT_PRIO {
            return None;
        }

        for idx in 0..task_pri.max(0) as usize {
            let vec = &self.pri_to_cpu[idx];
            let skip = vec.count.load(Ordering::SeqCst) == 0;

            // count first, fence, then mask: pairs with the order in set()
            fence(Ordering::SeqCst);

            if skip {
                continue;
            }

            let lowest = allowed.and(&vec.mask.snapshot());
            // the slot may have emptied between the count and mask reads;
            // treat that as if the slot was never populated
            if lowest.is_empty() {
                continue;
            }

            return Some(lowest);
        }

        None
    }

    /// The slot currently recorded for `cpu`.
    pub fn current(&self, cpu: usize) -> i32 {
        self.cpu_to_pri[cpu].load(Ordering::Relaxed)
    }

    /// Occupied slots and their member CPUs, least urgent first.
    pub fn occupied(&self) -> Vec<(usize, CpuMask)> {
        self.pri_to_cpu
            .iter()
            .enumerate()
            .filter(|(_, v)| v.count.load(Ordering::SeqCst) != 0)
            .map(|(i, v)| (i, v.mask.snapshot()))
            .collect()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn convert_prio_maps_the_linux_scale() {
        assert_eq!(convert_prio(CPUPRI_INVALID), CPUPRI_INVALID);
        assert_eq!(convert_prio(MAX_PRIO), CPUPRI_IDLE);
        assert_eq!(convert_prio(100), CPUPRI_NORMAL);
        assert_eq!(convert_prio(120), CPUPRI_NORMAL);
        // RT priorities: numerically lower raw prio is more urgent
        assert_eq!(convert_prio(1), 100);
        assert_eq!(convert_prio(99), 2);
    }

    #[test]
    fn rt_key_preemption_follows_converted_slots() {
        // prio 10 is more urgent than prio 50
        assert!(10i32.preempts(50));
        assert!(!50i32.preempts(10));
        assert!(!10i32.preempts(10));
        // anything valid preempts an idle queue
        assert!(99i32.preempts(CPUPRI_INVALID));
    }

    #[test]
    fn set_then_find_locates_lower_priority_cpu() {
        let cp = CpuPriority::new(4);
        // cpu 2 runs at prio 50 (slot 51)
        cp.set(2, 50);
        // a prio-10 task (slot 91) should find cpu 2
        let mask = cp.find(10, &CpuMask::filled(4)).expect("cpu 2 findable");
        assert_eq!(mask.iter().collect::<Vec<_>>(), vec![2]);
        // a prio-80 task (slot 21) must not: cpu 2 is more urgent
        assert!(cp.find(80, &CpuMask::filled(4)).is_none());
    }

    #[test]
    fn find_respects_the_affinity_mask() {
        let cp = CpuPriority::new(4);
        cp.set(1, 60);
        cp.set(3, 60);
        let mut allowed = CpuMask::empty();
        allowed.set(3);
        let mask = cp.find(5, &allowed).unwrap();
        assert_eq!(mask.iter().collect::<Vec<_>>(), vec![3]);
    }

    #[test]
    fn moving_a_cpu_between_slots_updates_both_vectors() {
        let cp = CpuPriority::new(2);
        cp.set(0, 40);
        cp.set(0, 90);
        assert_eq!(cp.current(0), convert_prio(90));
        let occupied = cp.occupied();
        assert_eq!(occupied.len(), 1);
        assert_eq!(occupied[0].0, convert_prio(90) as usize);
    }

    #[test]
    fn invalid_priority_removes_the_cpu() {
        let cp = CpuPriority::new(2);
        cp.set(1, 20);
        cp.set(1, CPUPRI_INVALID);
        assert!(cp.find(90, &CpuMask::filled(2)).is_none());
        assert_eq!(cp.current(1), CPUPRI_INVALID);
    }

    #[test]
    fn idempotent_set_is_a_no_op() {
        let cp = CpuPriority::new(2);
        cp.set(0, 30);
        cp.set(0, 30);
        assert_eq!(cp.occupied().len(), 1);
        assert_eq!(cp.occupied()[0].1.weight(), 1);
    }
}
