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

//! Handlers for boards whose chips sit on four-chip HCCS rings: the single-ring `module-4` board and the two-ring
//! `module` board.

use std::collections::HashMap;
use std::sync::OnceLock;

use log::debug;

use super::ring::{ring4_priorities, select_by_priority, RingLayout};
use super::{
    bind_chips, check_chip_count, chip_decision, recovered_chips, release_chips, score_nodes, validate_chip_counts,
};
use crate::scheduling::handler::{JobContext, ScheduleError, TopologyHandler, ValidationResult};
use crate::scheduling::resources::{AllocationDecision, ChipId, NodeTopology, TaskDescriptor};

fn module4_layout() -> &'static RingLayout {
    static LAYOUT: OnceLock<RingLayout> = OnceLock::new();
    LAYOUT.get_or_init(|| RingLayout::new("module-4", 4, 1, [1, 2, 4], ring4_priorities()))
}

fn module8_layout() -> &'static RingLayout {
    static LAYOUT: OnceLock<RingLayout> = OnceLock::new();
    LAYOUT.get_or_init(|| RingLayout::new("module", 4, 2, [1, 2, 4, 8], ring4_priorities()))
}

/// Places whole chips on one or two four-chip rings.
///
/// A task asking for a whole node gets every ring of it; anything smaller stays inside a single ring.
#[derive(Debug)]
pub struct ModuleHandler {
    ctx: JobContext,
    layout: &'static RingLayout,
}

impl ModuleHandler {
    /// Handler for a board with a single ring of four chips.
    pub fn module4(ctx: JobContext) -> Self {
        Self {
            ctx,
            layout: module4_layout(),
        }
    }

    /// Handler for a board with two rings of four chips.
    pub fn module8(ctx: JobContext) -> Self {
        Self {
            ctx,
            layout: module8_layout(),
        }
    }

    pub fn boxed_module4(ctx: JobContext) -> Box<dyn TopologyHandler> {
        Box::new(Self::module4(ctx))
    }

    pub fn boxed_module8(ctx: JobContext) -> Box<dyn TopologyHandler> {
        Box::new(Self::module8(ctx))
    }

    fn best_cost(&self, usable: &[ChipId], count: u32) -> Option<u32> {
        if count == self.layout.max_per_node() {
            return self.layout.is_full_node(usable).then_some(0);
        }
        self.layout.best_group_cost(usable, count)
    }
}

impl TopologyHandler for ModuleHandler {
    fn name(&self) -> &'static str {
        self.layout.name
    }

    fn context(&self) -> &JobContext {
        &self.ctx
    }

    fn validate_job(&self) -> ValidationResult {
        validate_chip_counts(
            &self.ctx,
            self.layout.name,
            self.layout.max_per_node(),
            &self.layout.invalid_counts(),
        )
    }

    fn check_feasible(&self, task: &TaskDescriptor, node: &NodeTopology) -> Result<(), ScheduleError> {
        let (count, usable) = check_chip_count(&self.ctx, task, node)?;
        if count == self.layout.max_per_node() && !self.layout.is_full_node(&usable) {
            return Err(ScheduleError::feasibility(
                task,
                node,
                format!("{} chips requested but the node is not fully free", count),
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
        score_nodes(&self.ctx, task, nodes, scores, self.layout.max_per_node(), |usable, count| {
            self.best_cost(usable, count)
        })
    }

    fn select(&self, task: &TaskDescriptor, node: &NodeTopology) -> Result<AllocationDecision, ScheduleError> {
        let (count, usable) = check_chip_count(&self.ctx, task, node)?;
        if let Some(chips) = recovered_chips(&self.ctx, task, node, &usable, count) {
            debug!("task {} returns to chips {:?} on node {}", task.name, chips, node.name);
            return Ok(chip_decision(&self.ctx, node, chips));
        }
        let chips = if count == self.layout.max_per_node() {
            self.layout.is_full_node(&usable).then(|| usable.clone())
        } else {
            select_by_priority(self.layout, &usable, count)
        };
        match chips {
            Some(chips) => {
                debug!("{}: task {} takes chips {:?} on node {}", self.name(), task.name, chips, node.name);
                Ok(chip_decision(&self.ctx, node, chips))
            }
            None => Err(ScheduleError::race(
                task,
                node,
                format!("no ring on node has room for {} chips among {:?}", count, usable),
            )),
        }
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
    use super::super::test_support::*;
    use super::*;
    use crate::scheduling::handler::REASON_INVALID_NPU_NUM;
    use proptest::prelude::*;

    fn seeded(nodes: &[NodeTopology]) -> HashMap<String, f64> {
        nodes.iter().map(|n| (n.name.clone(), 0.0)).collect()
    }

    #[test]
    fn test_three_chips_rejected_on_module() {
        let handler = ModuleHandler::module8(context(job(3)));
        let r = handler.validate_job();
        assert!(!r.pass);
        assert_eq!(r.reason, REASON_INVALID_NPU_NUM);
        assert!(ModuleHandler::module8(context(job(8))).validate_job().pass);
        assert!(!ModuleHandler::module4(context(job(8))).validate_job().pass);
    }

    #[test]
    fn test_pair_on_two_half_free_rings() {
        // free [0,1,2,4,5,6], a pair goes to the first ring
        let handler = ModuleHandler::module8(context(job(2)));
        let task = handler.context().job.tasks[0].clone();
        let mut n = node("n0", 8, vec![0, 1, 2, 4, 5, 6]);
        handler.check_feasible(&task, &n).expect("feasible");
        let decision = handler.select(&task, &n).expect("select");
        assert_eq!(
            decision,
            AllocationDecision::Chips {
                node: "n0".into(),
                accelerator: NPU.into(),
                chips: vec![0, 1],
            }
        );
        handler.bind(&mut n, &decision).expect("bind");
        assert_eq!(n.free_chips(NPU), &[2, 4, 5, 6]);
    }

    #[test]
    fn test_whole_node_needs_every_ring() {
        let handler = ModuleHandler::module8(context(job(8)));
        let task = handler.context().job.tasks[0].clone();
        let partial = node("n0", 8, vec![0, 1, 2, 3, 4, 5, 6]);
        let err = handler.check_feasible(&task, &partial).unwrap_err();
        assert!(matches!(err, ScheduleError::Feasibility { .. }));
        let full = node("n1", 8, (0..8).collect());
        let decision = handler.select(&task, &full).expect("select");
        assert_eq!(decision.to_task_annotation().split(',').count(), 8);
    }

    #[test]
    fn test_score_prefers_exact_ring() {
        let handler = ModuleHandler::module8(context(job(4)));
        let task = handler.context().job.tasks[0].clone();
        let nodes = vec![
            node("loose", 8, vec![0, 1, 4, 5, 6, 7]),
            node("tight", 8, vec![4, 5, 6, 7]),
            node("split", 8, vec![0, 1, 4, 5]),
        ];
        let mut scores = seeded(&nodes);
        handler.score(&task, &nodes, &mut scores).expect("score");
        assert!(scores["tight"] > scores["loose"]);
        assert_eq!(scores["split"], 0.0);
    }

    #[test]
    fn test_count_feasible_but_split_rings_is_a_race() {
        let handler = ModuleHandler::module8(context(job(4)));
        let task = handler.context().job.tasks[0].clone();
        let n = node("n0", 8, vec![0, 1, 4, 5]);
        handler.check_feasible(&task, &n).expect("count fits");
        let err = handler.select(&task, &n).unwrap_err();
        assert!(matches!(err, ScheduleError::SelectionRace { .. }));
        assert!(err.excludes_node());
    }

    #[test]
    fn test_restarted_rank_gets_its_chips_back() {
        let ctx = context_with_recovery(job(2), recovery("default/train", 0, "n0", vec![6, 7]));
        let handler = ModuleHandler::module8(ctx);
        let task = handler.context().job.tasks[0].clone();
        let n = node("n0", 8, vec![0, 1, 6, 7]);
        let decision = handler.select(&task, &n).expect("select");
        assert_eq!(decision.to_task_annotation(), "Ascend910-6,Ascend910-7");
    }

    proptest! {
        #[test]
        fn prop_enough_usable_chips_is_feasible(
            free in proptest::collection::vec(any::<bool>(), 8),
            count in prop_oneof![Just(1u32), Just(2u32), Just(4u32), Just(8u32)],
        ) {
            let handler = ModuleHandler::module8(context(job(count)));
            let task = handler.context().job.tasks[0].clone();
            let chips: Vec<ChipId> = (0..8u32).filter(|c| free[*c as usize]).collect();
            let n = node("n0", 8, chips.clone());
            prop_assert_eq!(handler.check_feasible(&task, &n).is_ok(), chips.len() as u32 >= count);
        }

        #[test]
        fn prop_select_then_bind_release_is_identity(
            free in proptest::collection::vec(any::<bool>(), 8),
            count in prop_oneof![Just(1u32), Just(2u32), Just(4u32)],
        ) {
            let handler = ModuleHandler::module8(context(job(count)));
            let task = handler.context().job.tasks[0].clone();
            let chips: Vec<ChipId> = (0..8u32).filter(|c| free[*c as usize]).collect();
            let mut n = node("n0", 8, chips.clone());
            let before = n.clone();
            if let Ok(decision) = handler.select(&task, &n) {
                let AllocationDecision::Chips { chips: selected, .. } = &decision else {
                    panic!("unexpected decision: {decision:?}");
                };
                prop_assert_eq!(selected.len() as u32, count);
                prop_assert!(selected.iter().all(|c| chips.contains(c)));
                handler.bind(&mut n, &decision).expect("bind");
                let bound = task.clone().with_allocation(decision);
                handler.release(&bound, &mut n).expect("release");
                prop_assert_eq!(n, before);
            }
        }
    }

    #[test]
    fn test_release_puts_chips_back() {
        let handler = ModuleHandler::module4(context(job(1)));
        let task = handler.context().job.tasks[0].clone();
        let mut n = node("n0", 4, vec![0, 1, 2, 3]);
        let decision = handler.select(&task, &n).expect("select");
        handler.bind(&mut n, &decision).expect("bind");
        assert_eq!(n.free_chips(NPU).len(), 3);
        let bound = task.with_allocation(decision);
        handler.release(&bound, &mut n).expect("release");
        assert_eq!(n.free_chips(NPU), &[0, 1, 2, 3]);
    }
}
