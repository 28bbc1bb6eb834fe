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

//! Handler for sixteen-chip boards built from two eight-chip groups.
//!
//! Up to eight chips fit inside one group and take the group with the fewest free chips that still fits. Larger
//! requests must be even and are split evenly over both groups, since the groups only talk to each other pairwise.

use std::collections::HashMap;
use std::sync::OnceLock;

use log::debug;

use super::ring::{best_fit_priorities, select_by_priority, RingLayout};
use super::{
    bind_chips, check_chip_count, chip_decision, recovered_chips, release_chips, score_nodes, validate_chip_counts,
};
use crate::scheduling::handler::{JobContext, ScheduleError, TopologyHandler, ValidationResult};
use crate::scheduling::resources::{AllocationDecision, ChipId, NodeTopology, TaskDescriptor};

fn layout() -> &'static RingLayout {
    static LAYOUT: OnceLock<RingLayout> = OnceLock::new();
    LAYOUT.get_or_init(|| {
        RingLayout::new(
            "module-16",
            8,
            2,
            (1..=8).chain([10, 12, 14, 16]),
            best_fit_priorities(8),
        )
    })
}

#[derive(Debug)]
pub struct Module16Handler {
    ctx: JobContext,
}

impl Module16Handler {
    pub fn new(ctx: JobContext) -> Self {
        Self { ctx }
    }

    pub fn boxed(ctx: JobContext) -> Box<dyn TopologyHandler> {
        Box::new(Self::new(ctx))
    }

    /// Cost of splitting `count` chips over both groups: the chips left loose afterwards.
    fn split_cost(usable: &[ChipId], count: u32) -> Option<u32> {
        let half = count / 2;
        let groups = layout().split_by_group(usable);
        if groups.iter().any(|g| (g.len() as u32) < half) {
            return None;
        }
        Some(groups.iter().map(|g| g.len() as u32 - half).sum())
    }

    fn best_cost(usable: &[ChipId], count: u32) -> Option<u32> {
        if count <= layout().group_size {
            layout().best_group_cost(usable, count)
        } else {
            Self::split_cost(usable, count)
        }
    }

    fn pick(usable: &[ChipId], count: u32) -> Option<Vec<ChipId>> {
        if count <= layout().group_size {
            return select_by_priority(layout(), usable, count);
        }
        Self::split_cost(usable, count)?;
        let half = (count / 2) as usize;
        Some(
            layout()
                .split_by_group(usable)
                .into_iter()
                .flat_map(|g| g.into_iter().take(half))
                .collect(),
        )
    }
}

impl TopologyHandler for Module16Handler {
    fn name(&self) -> &'static str {
        layout().name
    }

    fn context(&self) -> &JobContext {
        &self.ctx
    }

    fn validate_job(&self) -> ValidationResult {
        validate_chip_counts(&self.ctx, layout().name, layout().max_per_node(), &layout().invalid_counts())
    }

    fn check_feasible(&self, task: &TaskDescriptor, node: &NodeTopology) -> Result<(), ScheduleError> {
        let (count, usable) = check_chip_count(&self.ctx, task, node)?;
        if count == layout().max_per_node() && !layout().is_full_node(&usable) {
            return Err(ScheduleError::feasibility(
                task,
                node,
                "16 chips requested but the node is not fully free",
            ));
        }
        Ok(())
    }

    fn score(
        &self,
        task: &TaskDescriptor,
        nodes: &[NodeTopology],
        scores: &mut HashMap<String, f64>,
    ) -> Result<(), ScheduleError> {
        score_nodes(&self.ctx, task, nodes, scores, layout().max_per_node(), Self::best_cost)
    }

    fn select(&self, task: &TaskDescriptor, node: &NodeTopology) -> Result<AllocationDecision, ScheduleError> {
        let (count, usable) = check_chip_count(&self.ctx, task, node)?;
        if let Some(chips) = recovered_chips(&self.ctx, task, node, &usable, count) {
            debug!("task {} returns to chips {:?} on node {}", task.name, chips, node.name);
            return Ok(chip_decision(&self.ctx, node, chips));
        }
        let chips = Self::pick(&usable, count).ok_or_else(|| {
            ScheduleError::race(
                task,
                node,
                format!("no group split on node fits {} chips among {:?}", count, usable),
            )
        })?;
        debug!("module-16: task {} takes chips {:?} on node {}", task.name, chips, node.name);
        Ok(chip_decision(&self.ctx, node, chips))
    }

    fn bind(&self, node: &mut NodeTopology, decision: &AllocationDecision) -> Result<(), ScheduleError> {
        bind_chips(&self.ctx, node, decision)
    }

    fn release(&self, task: &TaskDescriptor, node: &mut NodeTopology) -> Result<(), ScheduleError> {
        release_chips(task, node)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::super::test_support::*;
    use super::*;

    fn chips(decision: &AllocationDecision) -> Vec<ChipId> {
        match decision {
            AllocationDecision::Chips { chips, .. } => chips.clone(),
            other => panic!("unexpected decision: {other:?}"),
        }
    }

    #[test]
    fn test_odd_counts_above_a_group_are_invalid() {
        assert_eq!(layout().invalid_counts(), BTreeSet::from([9, 11, 13, 15]));
        assert!(!Module16Handler::new(context(job(9))).validate_job().pass);
        assert!(Module16Handler::new(context(job(12))).validate_job().pass);
        assert!(!Module16Handler::new(context(job(17))).validate_job().pass);
    }

    #[test]
    fn test_small_request_best_fits_one_group() {
        let handler = Module16Handler::new(context(job(3)));
        let task = handler.context().job.tasks[0].clone();
        // group 0 has 8 free, group 1 has 4 free
        let n = node("n0", 16, (0..8).chain(12..16).collect());
        assert_eq!(chips(&handler.select(&task, &n).expect("select")), vec![12, 13, 14]);
    }

    #[test]
    fn test_large_request_splits_evenly() {
        let handler = Module16Handler::new(context(job(10)));
        let task = handler.context().job.tasks[0].clone();
        let n = node("n0", 16, (0..7).chain(8..16).collect());
        assert_eq!(
            chips(&handler.select(&task, &n).expect("select")),
            vec![0, 1, 2, 3, 4, 8, 9, 10, 11, 12]
        );

        // one group short of its half
        let n = node("n1", 16, (0..4).chain(8..16).collect());
        handler.check_feasible(&task, &n).expect("count fits");
        assert!(matches!(
            handler.select(&task, &n),
            Err(ScheduleError::SelectionRace { .. })
        ));
    }

    #[test]
    fn test_full_board() {
        let handler = Module16Handler::new(context(job(16)));
        let task = handler.context().job.tasks[0].clone();
        assert!(handler.check_feasible(&task, &node("n0", 16, (1..16).collect())).is_err());
        let full = node("n1", 16, (0..16).collect());
        handler.check_feasible(&task, &full).expect("feasible");
        assert_eq!(chips(&handler.select(&task, &full).expect("select")).len(), 16);
    }

    #[test]
    fn test_score_skips_unsplittable_nodes() {
        let handler = Module16Handler::new(context(job(12)));
        let task = handler.context().job.tasks[0].clone();
        let nodes = vec![
            node("even", 16, (0..16).collect()),
            node("lopsided", 16, (0..8).chain(8..13).collect()),
        ];
        let mut scores: HashMap<String, f64> = nodes.iter().map(|n| (n.name.clone(), 0.0)).collect();
        handler.score(&task, &nodes, &mut scores).expect("score");
        assert!(scores["even"] > 0.0);
        assert_eq!(scores["lopsided"], 0.0);
    }
}
