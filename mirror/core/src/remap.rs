// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};

/// One run: `from + i ↦ to + i` for `0 ≤ i < len`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Run {
    pub from: u64,
    pub to: u64,
    pub len: u64,
}

impl Run {
    fn contains(&self, key: u64) -> bool {
        key >= self.from && key - self.from < self.len
    }

    /// Whether `other` starts exactly where this run ends, on both sides of
    /// the mapping.
    fn abuts(&self, other: &Run) -> bool {
        self.from + self.len == other.from && self.to + self.len == other.to
    }
}

/// Mutable run-length-compressed mapping from ids to ids.
///
/// Runs are non-empty, disjoint, strictly ascending by `from`, and maximal:
/// no two adjacent runs are mergeable. Point lookups are O(log R); a remap
/// splits and fuses runs atomically within the call.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CompactRemapTable {
    runs: Vec<Run>,
}

impl CompactRemapTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    /// Number of mapped keys.
    pub fn len(&self) -> u64 {
        self.runs.iter().map(|r| r.len).sum()
    }

    pub fn get(&self, key: u64) -> Option<u64> {
        let idx = self.runs.partition_point(|r| r.from <= key);
        if idx == 0 {
            return None;
        }
        let run = &self.runs[idx - 1];
        run.contains(key).then(|| run.to + (key - run.from))
    }

    /// Inserts or updates the mapping for one key.
    pub fn remap(&mut self, key: u64, value: u64) {
        let idx = self.runs.partition_point(|r| r.from <= key);
        if idx > 0 && self.runs[idx - 1].contains(key) {
            self.remap_within(idx - 1, key, value);
        } else {
            self.runs.insert(
                idx,
                Run {
                    from: key,
                    to: value,
                    len: 1,
                },
            );
            self.fuse_around(idx);
        }
        debug_assert!(self.invariants_hold());
    }

    /// Drops the mapping for one key, splitting its run when it sits in the
    /// middle. No-op for unmapped keys.
    pub fn unmap(&mut self, key: u64) {
        let idx = self.runs.partition_point(|r| r.from <= key);
        if idx == 0 || !self.runs[idx - 1].contains(key) {
            return;
        }
        let run = self.runs[idx - 1];
        let offset = key - run.from;
        let mut replacement = Vec::with_capacity(2);
        if offset > 0 {
            replacement.push(Run {
                from: run.from,
                to: run.to,
                len: offset,
            });
        }
        if offset + 1 < run.len {
            replacement.push(Run {
                from: key + 1,
                to: run.to + offset + 1,
                len: run.len - offset - 1,
            });
        }
        self.runs.splice(idx - 1..idx, replacement);
        debug_assert!(self.invariants_hold());
    }

    /// Iterates runs in `from`-ascending order.
    pub fn runs(&self) -> impl Iterator<Item = &Run> {
        self.runs.iter()
    }

    /// The key falls inside `runs[idx]`; rewrite its mapping.
    fn remap_within(&mut self, idx: usize, key: u64, value: u64) {
        let run = self.runs[idx];
        let offset = key - run.from;
        if run.to + offset == value {
            return;
        }

        let left_len = offset;
        let right_len = run.len - offset - 1;
        let mid = Run {
            from: key,
            to: value,
            len: 1,
        };

        let mut replacement = Vec::with_capacity(3);
        if left_len > 0 {
            replacement.push(Run {
                from: run.from,
                to: run.to,
                len: left_len,
            });
        }
        replacement.push(mid);
        if right_len > 0 {
            replacement.push(Run {
                from: key + 1,
                to: run.to + offset + 1,
                len: right_len,
            });
        }

        let mid_idx = idx + usize::from(left_len > 0);
        self.runs.splice(idx..=idx, replacement);
        self.fuse_around(mid_idx);
    }

    /// Fuses the run at `idx` with its neighbors where the merge rule allows.
    fn fuse_around(&mut self, idx: usize) {
        if idx + 1 < self.runs.len() && self.runs[idx].abuts(&self.runs[idx + 1]) {
            self.runs[idx].len += self.runs[idx + 1].len;
            self.runs.remove(idx + 1);
        }
        if idx > 0 && self.runs[idx - 1].abuts(&self.runs[idx]) {
            self.runs[idx - 1].len += self.runs[idx].len;
            self.runs.remove(idx);
        }
    }

    fn invariants_hold(&self) -> bool {
        self.runs.windows(2).all(|pair| {
            pair[0].from + pair[0].len <= pair[1].from && !pair[0].abuts(&pair[1])
        }) && self.runs.iter().all(|r| r.len > 0)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use super::*;

    fn run(from: u64, to: u64, len: u64) -> Run {
        Run { from, to, len }
    }

    fn runs_of(table: &CompactRemapTable) -> Vec<Run> {
        table.runs().copied().collect()
    }

    fn build_base() -> CompactRemapTable {
        let mut table = CompactRemapTable::new();
        table.remap(3, 98);
        table.remap(5, 100);
        table.remap(6, 100);
        for i in 7..107 {
            table.remap(i, i + 493);
        }
        table
    }

    #[test]
    fn update_inside_run_fuses_with_neighbor() {
        let mut table = build_base();
        table.remap(5, 99);
        assert_eq!(
            runs_of(&table),
            vec![run(3, 98, 1), run(5, 99, 2), run(7, 500, 100)]
        );
        assert_eq!(table.get(5), Some(99));
        assert_eq!(table.get(6), Some(100));
    }

    #[test]
    fn update_mid_run_splits_into_before_one_after() {
        let table = build_base();
        assert_eq!(
            runs_of(&table),
            vec![
                run(3, 98, 1),
                run(5, 100, 1),
                run(6, 100, 1),
                run(7, 500, 100)
            ]
        );

        let mut table = table;
        table.remap(27, 107);
        assert_eq!(
            runs_of(&table),
            vec![
                run(3, 98, 1),
                run(5, 100, 1),
                run(6, 100, 1),
                run(7, 500, 20),
                run(27, 107, 1),
                run(28, 521, 79)
            ]
        );
        // The split preserves every other mapping.
        assert_eq!(table.get(26), Some(519));
        assert_eq!(table.get(27), Some(107));
        assert_eq!(table.get(28), Some(521));
        assert_eq!(table.get(106), Some(599));
    }

    #[test]
    fn get_on_empty_and_between_runs() {
        let mut table = CompactRemapTable::new();
        assert_eq!(table.get(0), None);
        table.remap(10, 20);
        table.remap(12, 22);
        assert_eq!(table.get(9), None);
        assert_eq!(table.get(10), Some(20));
        assert_eq!(table.get(11), None);
        assert_eq!(table.get(12), Some(22));
    }

    #[test]
    fn remap_to_same_value_is_a_no_op() {
        let mut table = CompactRemapTable::new();
        for i in 0..10 {
            table.remap(i, i + 5);
        }
        let before = runs_of(&table);
        table.remap(4, 9);
        assert_eq!(runs_of(&table), before);
        assert_eq!(before.len(), 1);
    }

    #[test]
    fn contiguous_inserts_collapse_into_one_run() {
        let mut table = CompactRemapTable::new();
        // Out of order on purpose; 5 arrives last and bridges both sides.
        table.remap(4, 14);
        table.remap(6, 16);
        table.remap(5, 15);
        assert_eq!(runs_of(&table), vec![run(4, 14, 3)]);
    }

    #[test]
    fn clone_is_independent() {
        let mut table = build_base();
        let copy = table.clone();
        table.remap(5, 1);
        assert_eq!(copy.get(5), Some(100));
    }

    #[test]
    fn unmap_splits_and_forgets() {
        let mut table = CompactRemapTable::new();
        for i in 10..20 {
            table.remap(i, i + 100);
        }
        table.unmap(15);
        assert_eq!(table.get(15), None);
        assert_eq!(table.get(14), Some(114));
        assert_eq!(table.get(16), Some(116));
        assert_eq!(runs_of(&table), vec![run(10, 110, 5), run(16, 116, 4)]);

        // Unmapping the edges and unknown keys.
        table.unmap(10);
        table.unmap(19);
        table.unmap(42);
        assert_eq!(runs_of(&table), vec![run(11, 111, 4), run(16, 116, 3)]);
    }

    #[test]
    fn replay_matches_oracle() {
        for seed in 0..20u8 {
            let mut rng = StdRng::from_seed([seed; 32]);
            let mut table = CompactRemapTable::new();
            let mut oracle: BTreeMap<u64, u64> = BTreeMap::new();

            for _ in 0..2_000 {
                let key = rng.gen_range(0..300);
                let value = rng.gen_range(0..300);
                table.remap(key, value);
                oracle.insert(key, value);
            }

            for key in 0..300 {
                assert_eq!(
                    table.get(key),
                    oracle.get(&key).copied(),
                    "seed {seed} key {key}"
                );
            }

            // Runs are disjoint, sorted, and maximal.
            let runs = runs_of(&table);
            for pair in runs.windows(2) {
                assert!(pair[0].from + pair[0].len <= pair[1].from, "seed {seed}");
                assert!(!pair[0].abuts(&pair[1]), "unfused neighbors, seed {seed}");
            }
            assert_eq!(table.len(), oracle.len() as u64, "seed {seed}");
        }
    }
}
