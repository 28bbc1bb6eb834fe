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

//! Handler for superpod jobs.
//!
//! Superpod nodes expose their chips as die pairs `(2i, 2i + 1)`. Every request of two or more chips takes whole
//! free pairs; a single chip prefers a pair whose other die is already in use. Nodes that belong to the job's
//! superpod are scored above every other node so that all ranks of a job share one interconnect domain.

use std::collections::{BTreeMap, HashMap};

use log::{debug, trace};

use super::ring::{select_by_priority, select_full_groups, RingLayout};
use super::{
    bind_chips, check_chip_count, chip_decision, recovered_chips, release_chips, score_nodes_with_bonus,
    validate_chip_counts,
};
use crate::scheduling::handler::{JobContext, ScheduleError, TopologyHandler, ValidationResult};
use crate::scheduling::resources::{
    AllocationDecision, ChipId, NodeTopology, TaskDescriptor, SUPERPOD_ANNOTATION, SUPERPOD_ID_LABEL,
};

const DIES_PER_PAIR: u32 = 2;

/// Builds the die-pair layout of a node with `chips` chips. Valid requests are powers of two.
pub fn superpod_layout(chips: u32) -> RingLayout {
    let pairs = (chips / DIES_PER_PAIR).max(1);
    let valid = std::iter::successors(Some(1u32), |n| n.checked_mul(2)).take_while(|n| *n <= chips);
    RingLayout::new(
        "superpod",
        DIES_PER_PAIR,
        pairs,
        valid,
        BTreeMap::from([(1, vec![1, 2]), (2, vec![2])]),
    )
}

#[derive(Debug)]
pub struct SuperpodHandler {
    ctx: JobContext,
    layout: RingLayout,
}

impl SuperpodHandler {
    pub fn new(ctx: JobContext) -> Self {
        let layout = superpod_layout(ctx.config().superpod_size);
        Self { ctx, layout }
    }

    pub fn boxed(ctx: JobContext) -> Box<dyn TopologyHandler> {
        Box::new(Self::new(ctx))
    }

    fn best_cost(&self, usable: &[ChipId], count: u32) -> Option<u32> {
        if count == 1 {
            return self.layout.best_group_cost(usable, 1);
        }
        let needed = (count / DIES_PER_PAIR) as usize;
        let full = self.layout.full_groups(usable).len();
        // cost grows with the number of whole pairs left behind
        (full >= needed).then(|| (full - needed) as u32)
    }

    fn pick(&self, usable: &[ChipId], count: u32) -> Option<Vec<ChipId>> {
        if count == 1 {
            select_by_priority(&self.layout, usable, 1)
        } else {
            select_full_groups(&self.layout, usable, count / DIES_PER_PAIR)
        }
    }

    /// Superpod the job should land in: the id named by its annotation, else the one most of its recovered ranks
    /// sit in among `nodes`.
    fn target_superpod<'a>(&'a self, nodes: &'a [NodeTopology]) -> Option<&'a str> {
        if let Some(value) = self.ctx.job.annotations.get(SUPERPOD_ANNOTATION) {
            if !value.is_empty() && value != "true" {
                return Some(value.as_str());
            }
        }
        let recovered = self.ctx.recovery().nodes_for_job(&self.ctx.job.key());
        let mut tally: BTreeMap<&str, usize> = BTreeMap::new();
        for node in nodes.iter().filter(|n| recovered.contains(n.name.as_str())) {
            if let Some(id) = node.labels.get(SUPERPOD_ID_LABEL) {
                *tally.entry(id.as_str()).or_default() += 1;
            }
        }
        // ties go to the lowest id
        tally
            .into_iter()
            .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(a.0)))
            .map(|(id, _)| id)
    }
}

impl TopologyHandler for SuperpodHandler {
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
        let max = self.layout.max_per_node();
        let target = self.target_superpod(nodes);
        trace!("superpod: task {} targets superpod {:?}", task.name, target);
        let bonus = f64::from(max) * f64::from(max);
        score_nodes_with_bonus(
            &self.ctx,
            task,
            nodes,
            scores,
            max,
            |usable, count| self.best_cost(usable, count),
            |node| match (target, node.labels.get(SUPERPOD_ID_LABEL)) {
                (Some(t), Some(id)) if t == id.as_str() => bonus,
                _ => 0.0,
            },
        )
    }

    fn select(&self, task: &TaskDescriptor, node: &NodeTopology) -> Result<AllocationDecision, ScheduleError> {
        let (count, usable) = check_chip_count(&self.ctx, task, node)?;
        if let Some(chips) = recovered_chips(&self.ctx, task, node, &usable, count) {
            debug!("task {} returns to chips {:?} on node {}", task.name, chips, node.name);
            return Ok(chip_decision(&self.ctx, node, chips));
        }
        let chips = self.pick(&usable, count).ok_or_else(|| {
            ScheduleError::race(
                task,
                node,
                format!("not enough free die pairs for {} chips among {:?}", count, usable),
            )
        })?;
        debug!("superpod: task {} takes chips {:?} on node {}", task.name, chips, node.name);
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

    fn superpod_job(request: u32, superpod: &str) -> crate::scheduling::resources::JobDescriptor {
        job(request).with_annotation(SUPERPOD_ANNOTATION, superpod)
    }

    #[test]
    fn test_layout_valid_counts() {
        let layout = superpod_layout(16);
        assert_eq!(layout.max_per_node(), 16);
        assert_eq!(
            layout.invalid_counts(),
            (1..=16).filter(|n| ![1, 2, 4, 8, 16].contains(n)).collect::<BTreeSet<u32>>()
        );
        assert!(!SuperpodHandler::new(context(superpod_job(6, "true"))).validate_job().pass);
        assert!(SuperpodHandler::new(context(superpod_job(8, "true"))).validate_job().pass);
    }

    #[test]
    fn test_single_chip_prefers_half_used_pair() {
        let handler = SuperpodHandler::new(context(superpod_job(1, "true")));
        let task = handler.context().job.tasks[0].clone();
        let n = node("n0", 16, vec![0, 1, 3, 4, 5]);
        assert_eq!(handler.select(&task, &n).expect("select").to_task_annotation(), "Ascend910-3");
    }

    #[test]
    fn test_pairs_stay_whole() {
        let handler = SuperpodHandler::new(context(superpod_job(4, "true")));
        let task = handler.context().job.tasks[0].clone();
        let n = node("n0", 16, vec![1, 2, 3, 4, 5, 7, 8, 9]);
        assert_eq!(
            handler.select(&task, &n).expect("select"),
            chip_decision(handler.context(), &n, vec![2, 3, 4, 5])
        );
        let scattered = node("n1", 16, vec![1, 3, 5, 7]);
        handler.check_feasible(&task, &scattered).expect("count fits");
        assert!(matches!(
            handler.select(&task, &scattered),
            Err(ScheduleError::SelectionRace { .. })
        ));
    }

    #[test]
    fn test_named_superpod_outranks_tidier_node() {
        let handler = SuperpodHandler::new(context(superpod_job(2, "sp-1")));
        let task = handler.context().job.tasks[0].clone();
        let nodes = vec![
            node("tidy", 16, vec![0, 1]).with_label(SUPERPOD_ID_LABEL, "sp-0"),
            node("home", 16, (0..16).collect()).with_label(SUPERPOD_ID_LABEL, "sp-1"),
        ];
        let mut scores: HashMap<String, f64> = nodes.iter().map(|n| (n.name.clone(), 0.0)).collect();
        handler.score(&task, &nodes, &mut scores).expect("score");
        assert!(scores["home"] > scores["tidy"]);
    }

    #[test]
    fn test_recovered_ranks_pick_the_superpod() {
        let recovery = recovery("default/train", 1, "old", vec![0, 1]);
        let handler = SuperpodHandler::new(context_with_recovery(superpod_job(2, "true"), recovery));
        let nodes = vec![
            node("old", 16, vec![]).with_label(SUPERPOD_ID_LABEL, "sp-2"),
            node("other", 16, vec![0, 1]).with_label(SUPERPOD_ID_LABEL, "sp-0"),
        ];
        assert_eq!(handler.target_superpod(&nodes), Some("sp-2"));
    }
}
