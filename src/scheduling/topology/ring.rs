// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Group layouts, affinity costs and priority walks shared by the whole-chip handlers.
//!
//! Chips on a node are wired into equally sized groups (HCCS rings, cards, die pairs). Chip `i` belongs to group
//! `i / group_size`. Communication inside a group is cheap, across groups expensive, so placement tries to:
//! 1. keep a task inside one group whenever its size allows,
//! 2. pick the group whose free count makes the remainder least awkward for future jobs,
//! 3. keep fully free groups intact for large jobs.
//!
//! Both scoring and selection read from the same per-shape priority arrays, so the node that scores best is also
//! the node on which selection takes the cheapest group.

use std::collections::{BTreeMap, BTreeSet};

use crate::scheduling::resources::ChipId;

/// Cost of a placement that cannot happen inside a single group.
pub const UNREACHABLE_COST: u32 = 1 << 16;

// --------------------
// Layout
// --------------------

/// Static description of one hardware shape.
///
/// # Attributes
/// * `group_size` - Chips in one physically interconnected group.
/// * `group_count` - Groups on a fully populated node.
/// * `valid_counts` - Chip counts a single task may request.
/// * `priorities` - For a request of `k` chips, the free counts of a group in the order they should be taken.
/// * `affinity` - `[k - 1][free - 1]` cost of placing `k` chips in a group with `free` free chips.
#[derive(Debug, Clone)]
pub struct RingLayout {
    pub name: &'static str,
    pub group_size: u32,
    pub group_count: u32,
    valid_counts: BTreeSet<u32>,
    priorities: BTreeMap<u32, Vec<u32>>,
    affinity: Vec<Vec<u32>>,
}

impl RingLayout {
    pub fn new(
        name: &'static str,
        group_size: u32,
        group_count: u32,
        valid_counts: impl IntoIterator<Item = u32>,
        priorities: BTreeMap<u32, Vec<u32>>,
    ) -> Self {
        let affinity = build_affinity_matrix(group_size, &priorities);
        Self {
            name,
            group_size,
            group_count,
            valid_counts: valid_counts.into_iter().collect(),
            priorities,
            affinity,
        }
    }

    pub fn max_per_node(&self) -> u32 {
        self.group_size * self.group_count
    }

    pub fn is_valid_count(&self, count: u32) -> bool {
        self.valid_counts.contains(&count)
    }

    /// Counts in `1..=max_per_node` a task may never ask for on this shape.
    pub fn invalid_counts(&self) -> BTreeSet<u32> {
        (1..=self.max_per_node())
            .filter(|n| !self.is_valid_count(*n))
            .collect()
    }

    pub fn group_of(&self, chip: ChipId) -> Option<u32> {
        let group = chip / self.group_size;
        (group < self.group_count).then_some(group)
    }

    /// Splits `chips` by group, keeping their order. Chips outside the layout are dropped.
    pub fn split_by_group(&self, chips: &[ChipId]) -> Vec<Vec<ChipId>> {
        let mut groups = vec![Vec::new(); self.group_count as usize];
        for chip in chips {
            if let Some(group) = self.group_of(*chip) {
                groups[group as usize].push(*chip);
            }
        }
        groups
    }

    pub fn priority(&self, count: u32) -> Option<&[u32]> {
        self.priorities.get(&count).map(Vec::as_slice)
    }

    pub fn affinity_cost(&self, count: u32, free: u32) -> u32 {
        if count == 0 || free == 0 || count > self.group_size || free > self.group_size {
            return UNREACHABLE_COST;
        }
        self.affinity[(count - 1) as usize][(free - 1) as usize]
    }

    /// True when every group of the node is completely free.
    pub fn is_full_node(&self, usable: &[ChipId]) -> bool {
        self.split_by_group(usable)
            .iter()
            .all(|g| g.len() as u32 == self.group_size)
    }

    /// Groups whose chips are all free, in ascending group order.
    pub fn full_groups(&self, usable: &[ChipId]) -> Vec<Vec<ChipId>> {
        self.split_by_group(usable)
            .into_iter()
            .filter(|g| g.len() as u32 == self.group_size)
            .collect()
    }

    /// Lowest affinity cost of placing `count` chips inside a single group.
    pub fn best_group_cost(&self, usable: &[ChipId], count: u32) -> Option<u32> {
        self.split_by_group(usable)
            .iter()
            .filter(|g| g.len() as u32 >= count)
            .map(|g| self.affinity_cost(count, g.len() as u32))
            .filter(|c| *c < UNREACHABLE_COST)
            .min()
    }
}

// --------------------
// Tables
// --------------------

/// Priority arrays of a four-chip ring.
///
/// A single chip goes to the group with one free chip first, then three (leaving a pair), then two, then four.
/// A pair prefers an exact pair, then a full ring (leaving a pair), then three.
pub fn ring4_priorities() -> BTreeMap<u32, Vec<u32>> {
    BTreeMap::from([(1, vec![1, 3, 2, 4]), (2, vec![2, 4, 3]), (4, vec![4])])
}

/// Best-fit priority arrays: take the group with the fewest free chips that still fits.
pub fn best_fit_priorities(group_size: u32) -> BTreeMap<u32, Vec<u32>> {
    (1..=group_size)
        .map(|k| (k, (k..=group_size).collect()))
        .collect()
}

/// Builds the `[count][free]` cost matrix from the priority arrays.
///
/// The first free count in a priority array costs 0 and each later one costs one more. Free counts not listed in
/// the array fall after the listed ones, ordered by how many chips they would leave behind.
pub fn build_affinity_matrix(group_size: u32, priorities: &BTreeMap<u32, Vec<u32>>) -> Vec<Vec<u32>> {
    let mut matrix = Vec::with_capacity(group_size as usize);
    for count in 1..=group_size {
        let mut row = Vec::with_capacity(group_size as usize);
        for free in 1..=group_size {
            let cost = if free < count {
                UNREACHABLE_COST
            } else if let Some(order) = priorities.get(&count) {
                match order.iter().position(|f| *f == free) {
                    Some(pos) => pos as u32,
                    None => order.len() as u32 + (free - count),
                }
            } else {
                free - count
            };
            row.push(cost);
        }
        matrix.push(row);
    }
    matrix
}

// --------------------
// Selection and scoring
// --------------------

/// Walks the priority array of `count` and returns the first `count` chips of the first matching group.
///
/// A single chip is always served if any usable chip exists, whatever its group.
pub fn select_by_priority(layout: &RingLayout, usable: &[ChipId], count: u32) -> Option<Vec<ChipId>> {
    let groups = layout.split_by_group(usable);
    if let Some(order) = layout.priority(count) {
        for want in order {
            if let Some(group) = groups.iter().find(|g| g.len() as u32 == *want) {
                return Some(group[..count as usize].to_vec());
            }
        }
    }
    if count == 1 {
        return usable.first().map(|c| vec![*c]);
    }
    None
}

/// Takes `groups_needed` fully free groups in ascending order.
pub fn select_full_groups(layout: &RingLayout, usable: &[ChipId], groups_needed: u32) -> Option<Vec<ChipId>> {
    let full = layout.full_groups(usable);
    if (full.len() as u32) < groups_needed {
        return None;
    }
    Some(
        full.into_iter()
            .take(groups_needed as usize)
            .flatten()
            .collect(),
    )
}

/// Node score: prefer the cheapest local placement, then the node left with the fewest loose chips.
///
/// `max_per_node * (healthy - best_cost) + (max_per_node - usable)`
pub fn fragmentation_score(max_per_node: u32, healthy: usize, best_cost: u32, usable: usize) -> f64 {
    let max = max_per_node as f64;
    max * (healthy as f64 - best_cost as f64) + (max - usable as f64)
}

// --------------------
// Tests
// --------------------

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use proptest::prelude::*;

    fn module8() -> RingLayout {
        RingLayout::new("module", 4, 2, [1, 2, 4, 8], ring4_priorities())
    }

    #[test]
    fn test_invalid_counts() {
        assert_eq!(module8().invalid_counts(), BTreeSet::from([3, 5, 6, 7]));
    }

    #[test]
    fn test_affinity_matrix_follows_priorities() {
        let layout = module8();
        // one chip: 1 free first, then 3, 2, 4
        assert_eq!(layout.affinity_cost(1, 1), 0);
        assert_eq!(layout.affinity_cost(1, 3), 1);
        assert_eq!(layout.affinity_cost(1, 2), 2);
        assert_eq!(layout.affinity_cost(1, 4), 3);
        // a pair: 2, then 4, then 3
        assert_eq!(layout.affinity_cost(2, 2), 0);
        assert_eq!(layout.affinity_cost(2, 4), 1);
        assert_eq!(layout.affinity_cost(2, 3), 2);
        assert_eq!(layout.affinity_cost(2, 1), UNREACHABLE_COST);
        assert_eq!(layout.affinity_cost(4, 4), 0);
        assert_eq!(layout.affinity_cost(5, 4), UNREACHABLE_COST);
    }

    #[test]
    fn test_best_fit_matrix() {
        let matrix = build_affinity_matrix(8, &best_fit_priorities(8));
        assert_eq!(matrix[2][2], 0);
        assert_eq!(matrix[2][7], 5);
        assert_eq!(matrix[7][6], UNREACHABLE_COST);
    }

    #[test]
    fn test_split_by_group_drops_out_of_layout_chips() {
        let layout = module8();
        let groups = layout.split_by_group(&[0, 1, 5, 9, 7]);
        assert_eq!(groups, vec![vec![0, 1], vec![5, 7]]);
    }

    #[test]
    fn test_pair_prefers_exact_group_then_full_ring() {
        let layout = module8();
        // group 0 has 3 free, group 1 has 2 free
        assert_eq!(select_by_priority(&layout, &[0, 1, 2, 4, 5], 2), Some(vec![4, 5]));
        // group 0 has 3 free, group 1 is a full ring
        assert_eq!(select_by_priority(&layout, &[0, 1, 2, 4, 5, 6, 7], 2), Some(vec![4, 5]));
        // both groups have 3 free
        assert_eq!(select_by_priority(&layout, &[0, 1, 2, 4, 5, 6], 2), Some(vec![0, 1]));
    }

    #[test]
    fn test_single_chip_goes_to_loneliest_group() {
        let layout = module8();
        assert_eq!(select_by_priority(&layout, &[0, 1, 2, 3, 6], 1), Some(vec![6]));
    }

    #[test]
    fn test_four_needs_a_full_ring() {
        let layout = module8();
        assert_eq!(select_by_priority(&layout, &[0, 1, 4, 5], 4), None);
        assert_eq!(select_by_priority(&layout, &[0, 4, 5, 6, 7], 4), Some(vec![4, 5, 6, 7]));
    }

    #[test]
    fn test_full_groups() {
        let layout = module8();
        assert_eq!(select_full_groups(&layout, &[0, 1, 2, 3, 4, 5, 6, 7], 2).map(|c| c.len()), Some(8));
        assert_eq!(select_full_groups(&layout, &[0, 1, 2, 3, 4, 5, 6], 2), None);
        assert!(layout.is_full_node(&[0, 1, 2, 3, 4, 5, 6, 7]));
        assert!(!layout.is_full_node(&[0, 1, 2, 3]));
    }

    #[test]
    fn test_fragmentation_score() {
        // 8 healthy chips, exact-fit group, 6 usable
        assert_relative_eq!(fragmentation_score(8, 8, 0, 6), 66.0);
        // same node shape but a costlier fit scores lower
        assert!(fragmentation_score(8, 8, 1, 6) < fragmentation_score(8, 8, 0, 6));
    }

    proptest! {
        #[test]
        fn prop_selection_has_exact_size_and_usable_chips(
            free in proptest::collection::vec(any::<bool>(), 8),
            count in prop_oneof![Just(1u32), Just(2u32), Just(4u32)],
        ) {
            let layout = module8();
            let usable: Vec<ChipId> = (0..8u32).filter(|c| free[*c as usize]).collect();
            if let Some(selected) = select_by_priority(&layout, &usable, count) {
                prop_assert_eq!(selected.len() as u32, count);
                for chip in &selected {
                    prop_assert!(usable.contains(chip));
                }
            }
        }

        #[test]
        fn prop_score_never_prefers_more_loose_chips(
            healthy in 1usize..=8,
            cost in 0u32..4,
            usable in 0usize..8,
        ) {
            prop_assert!(fragmentation_score(8, healthy, cost, usable + 1) < fragmentation_score(8, healthy, cost, usable));
            prop_assert!(fragmentation_score(8, healthy, cost + 1, usable) < fragmentation_score(8, healthy, cost, usable));
        }
    }
}
