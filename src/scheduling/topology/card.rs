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

//! Handler for nodes populated with four-chip cards.
//!
//! A node carries up to sixteen cards. Requests of at most one card best-fit a single card; larger requests must be a
//! multiple of four and take whole free cards in ascending card order.

use std::collections::HashMap;
use std::sync::OnceLock;

use log::debug;

use super::ring::{best_fit_priorities, select_by_priority, select_full_groups, RingLayout};
use super::{
    bind_chips, check_chip_count, chip_decision, recovered_chips, release_chips, score_nodes, validate_chip_counts,
};
use crate::scheduling::handler::{
    requested_chips, JobContext, ScheduleError, TopologyHandler, ValidationResult, REASON_INVALID_NPU_NUM,
};
use crate::scheduling::resources::{AllocationDecision, ChipId, NodeTopology, TaskDescriptor};

const CHIPS_PER_CARD: u32 = 4;
const CARDS_PER_NODE: u32 = 16;

fn layout() -> &'static RingLayout {
    static LAYOUT: OnceLock<RingLayout> = OnceLock::new();
    LAYOUT.get_or_init(|| {
        let max = CHIPS_PER_CARD * CARDS_PER_NODE;
        RingLayout::new(
            "card",
            CHIPS_PER_CARD,
            CARDS_PER_NODE,
            (1..=CHIPS_PER_CARD).chain((2 * CHIPS_PER_CARD..=max).step_by(CHIPS_PER_CARD as usize)),
            best_fit_priorities(CHIPS_PER_CARD),
        )
    })
}

#[derive(Debug)]
pub struct CardHandler {
    ctx: JobContext,
}

impl CardHandler {
    pub fn new(ctx: JobContext) -> Self {
        Self { ctx }
    }

    pub fn boxed(ctx: JobContext) -> Box<dyn TopologyHandler> {
        Box::new(Self::new(ctx))
    }

    fn best_cost(usable: &[ChipId], count: u32) -> Option<u32> {
        if count <= CHIPS_PER_CARD {
            return layout().best_group_cost(usable, count);
        }
        let needed = (count / CHIPS_PER_CARD) as usize;
        (layout().full_groups(usable).len() >= needed).then_some(0)
    }
}

impl TopologyHandler for CardHandler {
    fn name(&self) -> &'static str {
        layout().name
    }

    fn context(&self) -> &JobContext {
        &self.ctx
    }

    fn validate_job(&self) -> ValidationResult {
        let result = validate_chip_counts(&self.ctx, layout().name, layout().max_per_node(), &layout().invalid_counts());
        if !result.pass {
            return result;
        }
        // a declared per-card limit only constrains tasks that fit on one card
        let Some(per_card) = self.ctx.job.max_chips_per_card else {
            return result;
        };
        for task in &self.ctx.job.tasks {
            if let Ok(count) = requested_chips(task) {
                if count <= CHIPS_PER_CARD && count > per_card {
                    return ValidationResult::fail(
                        REASON_INVALID_NPU_NUM,
                        format!(
                            "task {} requests {} chips but job {} allows {} per card",
                            task.name,
                            count,
                            self.ctx.job.key(),
                            per_card
                        ),
                    );
                }
            }
        }
        result
    }

    fn check_feasible(&self, task: &TaskDescriptor, node: &NodeTopology) -> Result<(), ScheduleError> {
        let (count, usable) = check_chip_count(&self.ctx, task, node)?;
        if count == layout().max_per_node() && !layout().is_full_node(&usable) {
            return Err(ScheduleError::feasibility(
                task,
                node,
                "a full node of cards requested but the node is not fully free",
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
        let chips = if count <= CHIPS_PER_CARD {
            select_by_priority(layout(), &usable, count)
        } else {
            select_full_groups(layout(), &usable, count / CHIPS_PER_CARD)
        };
        let chips = chips.ok_or_else(|| {
            ScheduleError::race(
                task,
                node,
                format!("not enough free cards for {} chips among {:?}", count, usable),
            )
        })?;
        debug!("card: task {} takes chips {:?} on node {}", task.name, chips, node.name);
        Ok(chip_decision(&self.ctx, node, chips))
    }

    fn bind(&self, node: &mut NodeTopology, decision: &AllocationDecision) -> Result<(), ScheduleError> {
        bind_chips(&self.ctx, node, decision)
    }

    fn release(&self, task: &TaskDescriptor, node: &mut NodeTopology) -> Result<(), ScheduleError> {
        release_chips(task, node)
    }
}
