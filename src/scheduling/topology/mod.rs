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

//! Whole-chip topology handlers, one per hardware shape, and the helpers they share.

pub mod card;
pub mod module;
pub mod module16;
pub mod ring;
pub mod superpod;

use std::collections::{BTreeSet, HashMap};

use log::trace;

pub use card::CardHandler;
pub use module::ModuleHandler;
pub use module16::Module16Handler;
pub use superpod::SuperpodHandler;

use crate::scheduling::handler::{
    ensure_score_map, requested_chips, JobContext, ScheduleError, ValidationResult, REASON_INVALID_NPU_NUM,
    REASON_INVALID_REQUEST_KIND,
};
use crate::scheduling::resources::{AllocationDecision, ChipId, NodeTopology, TaskDescriptor, TaskRequest};

/// A restarted rank whose old chips are still free outranks every fragmentation score.
const RECOVERY_BONUS_FACTOR: f64 = 2.0;

/// Chips of `node` the task may use: free, healthy and not held for another rank being recovered.
pub(crate) fn usable_chips(
    ctx: &JobContext,
    task: &TaskDescriptor,
    node: &NodeTopology,
) -> Result<Vec<ChipId>, ScheduleError> {
    let accelerator = ctx.accelerator();
    if !node.has_accelerator(accelerator) {
        return Err(ScheduleError::node_argument(
            task,
            node,
            format!("no {} annotation", accelerator),
        ));
    }
    let reserved = ctx.recovery().reserved_chips(&node.name, accelerator, task);
    let unhealthy = node.unhealthy_chips(accelerator);
    Ok(node
        .free_chips(accelerator)
        .iter()
        .copied()
        .filter(|c| !reserved.contains(c))
        .filter(|c| !unhealthy.is_some_and(|u| u.contains(c)))
        .collect())
}

/// Admission check shared by the whole-chip shapes.
///
/// `shape_max` and `shape_invalid` describe the hardware; the job's own declared limits can only tighten them.
pub(crate) fn validate_chip_counts(
    ctx: &JobContext,
    shape: &str,
    shape_max: u32,
    shape_invalid: &BTreeSet<u32>,
) -> ValidationResult {
    let job = &ctx.job;
    let max = job.max_chips_per_node.map_or(shape_max, |m| m.min(shape_max));
    for task in &job.tasks {
        let count = match &task.request {
            TaskRequest::Chips(n) => *n,
            TaskRequest::Virtual { .. } => {
                return ValidationResult::fail(
                    REASON_INVALID_REQUEST_KIND,
                    format!("task {} requests a virtual NPU from the {} handler", task.name, shape),
                );
            }
        };
        if count < 1 || count > max || shape_invalid.contains(&count) || job.invalid_counts.contains(&count) {
            return ValidationResult::fail(
                REASON_INVALID_NPU_NUM,
                format!(
                    "task {} of job {} requests {} chips; {} allows 1..={} except {:?}",
                    task.name,
                    job.key(),
                    count,
                    shape,
                    max,
                    shape_invalid.union(&job.invalid_counts).collect::<Vec<_>>()
                ),
            );
        }
    }
    ValidationResult::ok()
}

/// Returns the usable chips when there are at least as many as the task asks for.
pub(crate) fn check_chip_count(
    ctx: &JobContext,
    task: &TaskDescriptor,
    node: &NodeTopology,
) -> Result<(u32, Vec<ChipId>), ScheduleError> {
    let count = requested_chips(task)?;
    let usable = usable_chips(ctx, task, node)?;
    if (usable.len() as u32) < count {
        return Err(ScheduleError::feasibility(
            task,
            node,
            format!("{} usable chips, {} requested", usable.len(), count),
        ));
    }
    Ok((count, usable))
}

/// The chips this task's rank held on `node` before a restart, if they are all still usable.
pub(crate) fn recovered_chips(
    ctx: &JobContext,
    task: &TaskDescriptor,
    node: &NodeTopology,
    usable: &[ChipId],
    count: u32,
) -> Option<Vec<ChipId>> {
    let slot = ctx.recovery().slot(&task.job, task.rank?)?;
    if slot.node != node.name || slot.accelerator != ctx.accelerator() || slot.chips.len() as u32 != count {
        return None;
    }
    slot.chips
        .iter()
        .all(|c| usable.contains(c))
        .then(|| slot.chips.clone())
}

/// Scores every node on which `best_cost` finds a placement, using [`ring::fragmentation_score`].
///
/// Nodes that cannot host the task are left untouched in `scores`.
pub(crate) fn score_nodes<F>(
    ctx: &JobContext,
    task: &TaskDescriptor,
    nodes: &[NodeTopology],
    scores: &mut HashMap<String, f64>,
    max_per_node: u32,
    best_cost: F,
) -> Result<(), ScheduleError>
where
    F: Fn(&[ChipId], u32) -> Option<u32>,
{
    score_nodes_with_bonus(ctx, task, nodes, scores, max_per_node, best_cost, |_| 0.0)
}

/// Like [`score_nodes`], adding `bonus(node)` to the score of every node that can host the task.
pub(crate) fn score_nodes_with_bonus<F, B>(
    ctx: &JobContext,
    task: &TaskDescriptor,
    nodes: &[NodeTopology],
    scores: &mut HashMap<String, f64>,
    max_per_node: u32,
    best_cost: F,
    bonus: B,
) -> Result<(), ScheduleError>
where
    F: Fn(&[ChipId], u32) -> Option<u32>,
    B: Fn(&NodeTopology) -> f64,
{
    ensure_score_map(task, scores)?;
    let count = requested_chips(task)?;
    for node in nodes {
        let usable = match usable_chips(ctx, task, node) {
            Ok(usable) => usable,
            Err(e) => {
                trace!("skipping node {} for task {}: {}", node.name, task.name, e);
                continue;
            }
        };
        if (usable.len() as u32) < count {
            continue;
        }
        let Some(cost) = best_cost(&usable, count) else {
            trace!(
                "node {} has {} usable chips but no placement for {} chips of task {}",
                node.name,
                usable.len(),
                count,
                task.name
            );
            continue;
        };
        let healthy = node.healthy_chip_count(ctx.accelerator());
        let mut score = ring::fragmentation_score(max_per_node, healthy, cost, usable.len());
        if recovered_chips(ctx, task, node, &usable, count).is_some() {
            score += RECOVERY_BONUS_FACTOR * f64::from(max_per_node) * f64::from(max_per_node);
        }
        score += bonus(node);
        trace!(
            "task {} node {} usable={} cost={} score={}",
            task.name,
            node.name,
            usable.len(),
            cost,
            score
        );
        scores.insert(node.name.clone(), score);
    }
    Ok(())
}

pub(crate) fn chip_decision(ctx: &JobContext, node: &NodeTopology, chips: Vec<ChipId>) -> AllocationDecision {
    AllocationDecision::Chips {
        node: node.name.clone(),
        accelerator: ctx.accelerator().to_string(),
        chips,
    }
}

/// Removes the decided chips from the node's free list.
pub(crate) fn bind_chips(
    ctx: &JobContext,
    node: &mut NodeTopology,
    decision: &AllocationDecision,
) -> Result<(), ScheduleError> {
    let AllocationDecision::Chips {
        node: target,
        accelerator,
        chips,
    } = decision
    else {
        return Err(ScheduleError::Argument(format!(
            "job {} cannot bind a virtual decision on node {}",
            ctx.job.key(),
            node.name
        )));
    };
    if *target != node.name {
        return Err(ScheduleError::Argument(format!(
            "decision for node {} applied to node {}",
            target, node.name
        )));
    }
    node.remove_chips(accelerator, chips)
        .map_err(|e| ScheduleError::topology(&ctx.job.key(), &node.name, e))
}

/// Puts the chips of the task's binding back on the node's free list.
pub(crate) fn release_chips(task: &TaskDescriptor, node: &mut NodeTopology) -> Result<(), ScheduleError> {
    match &task.allocation {
        Some(AllocationDecision::Chips {
            node: target,
            accelerator,
            chips,
        }) if *target == node.name => node
            .restore_chips(accelerator, chips)
            .map_err(|e| ScheduleError::topology(&task.name, &node.name, e)),
        Some(_) => Err(ScheduleError::Argument(format!(
            "task {} is not bound to whole chips on node {}",
            task.name, node.name
        ))),
        None => Err(ScheduleError::Argument(format!(
            "task {} has no binding to release",
            task.name
        ))),
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn test_usable_chips_requires_annotation() {
        let ctx = context(job(1));
        let task = &ctx.job.tasks[0];
        let err = usable_chips(&ctx, task, &NodeTopology::new("bare")).unwrap_err();
        assert!(matches!(err, ScheduleError::NodeArgument { .. }));
        assert!(err.excludes_node());
    }

    #[test]
    fn test_usable_chips_excludes_unhealthy_and_reserved() {
        // rank 0 of another job held chips 4,5 on n0 before its restart
        let ctx = context_with_recovery(job(1), recovery("default/other", 0, "n0", vec![4, 5]));
        let task = &ctx.job.tasks[0];
        let n = node("n0", 8, vec![0, 1, 4, 5, 6]).with_unhealthy_chips(NPU, &[1]);
        assert_eq!(usable_chips(&ctx, task, &n).expect("usable"), vec![0, 6]);
    }

    #[test]
    fn test_own_recovered_chips_are_usable() {
        let ctx = context_with_recovery(job(2), recovery("default/train", 0, "n0", vec![4, 5]));
        let task = &ctx.job.tasks[0];
        let n = node("n0", 8, vec![0, 1, 4, 5, 6]);
        let usable = usable_chips(&ctx, task, &n).expect("usable");
        assert_eq!(usable, vec![0, 1, 4, 5, 6]);
        assert_eq!(recovered_chips(&ctx, task, &n, &usable, 2), Some(vec![4, 5]));
        assert_eq!(recovered_chips(&ctx, task, &n, &usable, 4), None);
    }

    #[test]
    fn test_recovered_node_outranks_better_fit() {
        let ctx = context_with_recovery(job(2), recovery("default/train", 0, "n1", vec![0, 1]));
        let task = &ctx.job.tasks[0];
        let nodes = vec![node("n0", 8, vec![4, 5]), node("n1", 8, vec![0, 1, 2, 4, 5, 6, 7])];
        let mut scores: HashMap<String, f64> = nodes.iter().map(|n| (n.name.clone(), 0.0)).collect();
        let layout = ring::RingLayout::new("module", 4, 2, [1, 2, 4, 8], ring::ring4_priorities());
        score_nodes(&ctx, task, &nodes, &mut scores, 8, |usable, count| {
            layout.best_group_cost(usable, count)
        })
        .expect("score");
        assert!(scores["n1"] > scores["n0"]);
    }

    #[test]
    fn test_declared_limits_tighten_shape() {
        let mut j = job(4);
        j.max_chips_per_node = Some(2);
        let ctx = context(j);
        let r = validate_chip_counts(&ctx, "module", 8, &BTreeSet::from([3, 5, 6, 7]));
        assert!(!r.pass);
        assert_eq!(r.reason, REASON_INVALID_NPU_NUM);

        let mut j = job(2);
        j.invalid_counts.insert(2);
        let r = validate_chip_counts(&context(j), "module", 8, &BTreeSet::new());
        assert!(!r.pass);
    }

    #[test]
    fn test_bind_then_release_restores_free_list() {
        let ctx = context(job(2));
        let mut n = node("n0", 8, vec![0, 1, 2, 4, 5, 6]);
        let before = n.clone();
        let decision = chip_decision(&ctx, &n, vec![4, 5]);
        bind_chips(&ctx, &mut n, &decision).expect("bind");
        assert_eq!(n.free_chips(NPU), &[0, 1, 2, 6]);
        let task = ctx.job.tasks[0].clone().with_allocation(decision);
        release_chips(&task, &mut n).expect("release");
        assert_eq!(n, before);
    }

    #[test]
    fn test_bind_on_wrong_node_is_rejected() {
        let ctx = context(job(1));
        let mut n = node("n0", 8, vec![0]);
        let other = node("n1", 8, vec![0]);
        let decision = chip_decision(&ctx, &other, vec![0]);
        assert!(matches!(
            bind_chips(&ctx, &mut n, &decision),
            Err(ScheduleError::Argument(_))
        ));
    }

    #[test]
    fn test_release_without_binding() {
        let ctx = context(job(1));
        let mut n = node("n0", 8, vec![0]);
        assert!(release_chips(&ctx.job.tasks[0], &mut n).is_err());
    }
}
