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

//! Virtual NPU handler.
//!
//! A chip of the vNPU accelerator is sliced into fractional units. Jobs run in one of two modes:
//! - static template: the node publishes pre-cut slots per template and a task takes one,
//! - dynamic cut: the slice is carved out of a chip's free resource when the task is bound.
//!
//! A dynamic task that asks for one or more whole chips is placed with the whole-card priority walk instead of being
//! carved.
//!
//! Scoring of a node registers the task in the [`ConcurrencyCache`] before reading the node's free resource, so two
//! tasks scored in parallel against the same node see each other's share. When no chip can hold the requested template
//! and downgrades are allowed, the task takes the smaller template and the node is recorded in the
//! [`DowngradeCache`]; later scoring passes give such nodes a neutral score without probing them.

pub mod cache;
pub mod templates;

use std::collections::HashMap;

use log::{debug, trace};

pub use cache::{ConcurrencyCache, DowngradeCache, VnpuCaches};
use templates::{downgrade_target, resolve_request, TaskResource, VnpuTemplate, DOWNGRADE_LABEL};

use crate::scheduling::handler::{
    ensure_score_map, JobContext, ScheduleError, TopologyHandler, ValidationResult, REASON_INVALID_NPU_NUM,
    REASON_INVALID_REQUEST_KIND, REASON_INVALID_VNPU_LABELS,
};
use crate::scheduling::resources::{AllocationDecision, ChipId, NodeTopology, TaskDescriptor, TaskRequest, VResource};
use crate::scheduling::topology::ring::{best_fit_priorities, select_by_priority, select_full_groups, RingLayout};

/// Score of a node whose best chip fits the slice exactly.
const SCORE_CEILING: f64 = 100.0;
/// Subtracted from the score of a node that only fits the downgraded template.
const DOWNGRADE_PENALTY: f64 = 50.0;
/// Score of a node already known to force a downgrade.
const NEUTRAL_SCORE: f64 = 0.0;

/// How a task is placed, decided from its request.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
enum Mode {
    StaticTemplate(&'static VnpuTemplate),
    DynamicSlice(&'static VnpuTemplate),
    WholeCards { chips: u32, resource: VResource },
}

#[derive(Debug)]
pub struct VnpuHandler {
    ctx: JobContext,
}

impl VnpuHandler {
    pub fn new(ctx: JobContext) -> Self {
        Self { ctx }
    }

    pub fn boxed(ctx: JobContext) -> Box<dyn TopologyHandler> {
        Box::new(Self::new(ctx))
    }

    fn caches(&self) -> &VnpuCaches {
        &self.ctx.session.caches
    }

    /// Per-chip capacity of `node`, falling back to the configured capacity when the node publishes no chips.
    fn chip_capacity(&self, node: Option<&NodeTopology>) -> VResource {
        node.and_then(|n| n.vchips().values().next().map(|c| c.total))
            .unwrap_or(self.ctx.config().vnpu_chip_capacity)
    }

    fn mode(&self, task: &TaskDescriptor, node: Option<&NodeTopology>) -> Result<Mode, ScheduleError> {
        let TaskRequest::Virtual { aicore, template } = &task.request else {
            return Err(ScheduleError::Argument(format!(
                "task {} requests whole chips from the vNPU handler",
                task.name
            )));
        };
        let resolved = resolve_request(*aicore, template.as_deref(), &self.ctx.job.labels, self.chip_capacity(node))
            .map_err(|e| ScheduleError::Argument(format!("task {}: {}", task.name, e)))?;
        Ok(match (resolved, template.is_some()) {
            (TaskResource::Slice(t), true) => Mode::StaticTemplate(t),
            (TaskResource::Slice(t), false) => Mode::DynamicSlice(t),
            (TaskResource::WholeCards { chips, resource }, _) => Mode::WholeCards { chips, resource },
        })
    }

    /// The resource `task` needs on `node`, derived from its request, the job labels and the node's chip capacity.
    pub fn get_task_resource(&self, task: &TaskDescriptor, node: &NodeTopology) -> Result<VResource, ScheduleError> {
        Ok(match self.mode(task, Some(node))? {
            Mode::StaticTemplate(t) | Mode::DynamicSlice(t) => t.resource,
            Mode::WholeCards { resource, .. } => resource,
        })
    }

    fn downgrade_allowed(&self) -> bool {
        self.ctx.config().allow_vnpu_downgrade
            && self.ctx.job.labels.get(DOWNGRADE_LABEL).map(String::as_str) != Some("false")
    }

    fn downgrade_of(&self, template: &VnpuTemplate) -> Option<&'static VnpuTemplate> {
        if self.downgrade_allowed() {
            downgrade_target(template.name)
        } else {
            None
        }
    }

    /// Healthy chips with no slice carved out of them.
    fn whole_free_chips(&self, node: &NodeTopology) -> Vec<ChipId> {
        let unhealthy = node.unhealthy_chips(self.ctx.accelerator());
        node.vchips()
            .iter()
            .filter(|(_, c)| c.is_fully_free())
            .map(|(id, _)| *id)
            .filter(|id| !unhealthy.is_some_and(|u| u.contains(id)))
            .collect()
    }

    /// Chip with the least room left after carving `requested`, among chips that can hold it.
    fn best_fit_chip(&self, node: &NodeTopology, requested: &VResource) -> Option<(ChipId, u32)> {
        let unhealthy = node.unhealthy_chips(self.ctx.accelerator());
        node.vchips()
            .iter()
            .filter(|(id, _)| !unhealthy.is_some_and(|u| u.contains(id)))
            .filter(|(_, c)| c.free.contains(requested))
            .map(|(id, c)| (*id, c.free.aicore - requested.aicore))
            .min_by_key(|(id, leftover)| (*leftover, *id))
    }

    /// Free resource of `node` once the shares of other in-flight tasks are set aside.
    fn idle_resource(&self, task: &TaskDescriptor, node: &NodeTopology) -> VResource {
        let reserved = self.caches().concurrency.reserved_share(&node.name, &task.key());
        node.free_vresource().saturating_sub(&reserved)
    }

    /// Checks that `node` can hold `requested` for a dynamically cut task.
    ///
    /// Requests of whole chips need that many untouched chips. Smaller requests need one chip with enough free
    /// resource, and the node as a whole must still cover the request after other in-flight tasks are accounted for.
    pub fn check_node_npu_by_dy_task(
        &self,
        task: &TaskDescriptor,
        node: &NodeTopology,
        requested: &VResource,
    ) -> Result<(), ScheduleError> {
        if node.vchips().is_empty() {
            return Err(ScheduleError::node_argument(task, node, "publishes no vNPU chips"));
        }
        let capacity = self.chip_capacity(Some(node));
        if capacity.aicore == 0 {
            return Err(ScheduleError::feasibility(
                task,
                node,
                format!("node chips report no aicore capacity for request {}", requested),
            ));
        }
        let idle = self.idle_resource(task, node);
        let insufficient = || {
            ScheduleError::feasibility(
                task,
                node,
                format!("node resource insufficient: requested {}, idle {}", requested, idle),
            )
        };
        if requested.aicore >= capacity.aicore && requested.aicore % capacity.aicore == 0 {
            let chips = (requested.aicore / capacity.aicore) as usize;
            if self.whole_free_chips(node).len() < chips {
                return Err(insufficient());
            }
            return Ok(());
        }
        if !idle.contains(requested) || self.best_fit_chip(node, requested).is_none() {
            return Err(insufficient());
        }
        Ok(())
    }

    fn card_layout(&self, node: &NodeTopology) -> RingLayout {
        let per_card = self.ctx.config().vnpu_chips_per_card.max(1);
        // A node cannot span more cards than it has chips; sparser ids fall outside the layout.
        let chips = u32::try_from(node.vchips().len()).unwrap_or(u32::MAX).max(1);
        let cards = node
            .vchips()
            .keys()
            .next_back()
            .map_or(1, |last| (last / per_card).saturating_add(1))
            .min(chips);
        RingLayout::new(
            "vnpu-card",
            per_card,
            cards,
            1..=per_card.saturating_mul(cards),
            best_fit_priorities(per_card),
        )
    }

    fn select_whole_cards(&self, node: &NodeTopology, chips: u32) -> Option<Vec<ChipId>> {
        let layout = self.card_layout(node);
        let usable = self.whole_free_chips(node);
        if chips <= layout.group_size {
            select_by_priority(&layout, &usable, chips)
        } else if chips % layout.group_size == 0 {
            select_full_groups(&layout, &usable, chips / layout.group_size)
        } else {
            None
        }
    }

    /// Available slots of `template` on `node` not claimed by another in-flight task.
    fn free_slots(&self, task: &TaskDescriptor, node: &NodeTopology, template: &VnpuTemplate) -> usize {
        let in_flight = self
            .caches()
            .concurrency
            .slots_in_flight(&node.name, template.name, &task.key());
        node.vnpu_slots(template.name).len().saturating_sub(in_flight)
    }

    /// Score of `node` for a dynamic slice, registering the task as in flight on the template it would take.
    fn score_slice(&self, task: &TaskDescriptor, node: &NodeTopology, template: &'static VnpuTemplate) -> Option<f64> {
        let key = task.key();
        let concurrency = &self.caches().concurrency;
        concurrency.register(&node.name, template.name, &key, template.resource);
        if self.idle_resource(task, node).contains(&template.resource) {
            if let Some((_, leftover)) = self.best_fit_chip(node, &template.resource) {
                return Some(SCORE_CEILING - f64::from(leftover));
            }
        }
        concurrency.deregister(&node.name, template.name, &key);
        let smaller = self.downgrade_of(template)?;
        concurrency.register(&node.name, smaller.name, &key, smaller.resource);
        if self.idle_resource(task, node).contains(&smaller.resource) {
            if let Some((_, leftover)) = self.best_fit_chip(node, &smaller.resource) {
                return Some(SCORE_CEILING - DOWNGRADE_PENALTY - f64::from(leftover));
            }
        }
        concurrency.deregister(&node.name, smaller.name, &key);
        None
    }

    fn check_node(&self, node: &NodeTopology, decision: &AllocationDecision) -> Result<(), ScheduleError> {
        if decision.node() != node.name {
            return Err(ScheduleError::Argument(format!(
                "decision for node {} applied to node {}",
                decision.node(),
                node.name
            )));
        }
        Ok(())
    }
}

impl TopologyHandler for VnpuHandler {
    fn name(&self) -> &'static str {
        "vnpu"
    }

    fn context(&self) -> &JobContext {
        &self.ctx
    }

    fn validate_job(&self) -> ValidationResult {
        for task in &self.ctx.job.tasks {
            let TaskRequest::Virtual { aicore, template } = &task.request else {
                return ValidationResult::fail(
                    REASON_INVALID_REQUEST_KIND,
                    format!("task {} of vNPU job {} requests whole chips", task.name, self.ctx.job.key()),
                );
            };
            let capacity = self.ctx.config().vnpu_chip_capacity;
            match resolve_request(*aicore, template.as_deref(), &self.ctx.job.labels, capacity) {
                Ok(TaskResource::WholeCards { chips, .. })
                    if self.ctx.job.max_chips_per_node.is_some_and(|max| chips > max) =>
                {
                    return ValidationResult::fail(
                        REASON_INVALID_NPU_NUM,
                        format!("task {} requests {} whole chips", task.name, chips),
                    );
                }
                Ok(_) => {}
                Err(e) => {
                    return ValidationResult::fail(REASON_INVALID_VNPU_LABELS, format!("task {}: {}", task.name, e));
                }
            }
        }
        ValidationResult::ok()
    }

    fn check_feasible(&self, task: &TaskDescriptor, node: &NodeTopology) -> Result<(), ScheduleError> {
        match self.mode(task, Some(node))? {
            Mode::StaticTemplate(t) => {
                if self.free_slots(task, node, t) == 0 {
                    return Err(ScheduleError::feasibility(
                        task,
                        node,
                        format!("no free {} slot", t.name),
                    ));
                }
                Ok(())
            }
            Mode::WholeCards { resource, .. } => self.check_node_npu_by_dy_task(task, node, &resource),
            Mode::DynamicSlice(t) => match self.check_node_npu_by_dy_task(task, node, &t.resource) {
                Err(e) if e.excludes_node() => match self.downgrade_of(t) {
                    Some(smaller) => self.check_node_npu_by_dy_task(task, node, &smaller.resource),
                    None => Err(e),
                },
                other => other,
            },
        }
    }

    fn score(
        &self,
        task: &TaskDescriptor,
        nodes: &[NodeTopology],
        scores: &mut HashMap<String, f64>,
    ) -> Result<(), ScheduleError> {
        ensure_score_map(task, scores)?;
        let key = task.key();
        for node in nodes {
            if self.caches().downgrade.contains(&key, &node.name) {
                trace!("vnpu: task {} already downgraded on node {}, neutral score", task.name, node.name);
                scores.insert(node.name.clone(), NEUTRAL_SCORE);
                continue;
            }
            let score = match self.mode(task, Some(node))? {
                Mode::StaticTemplate(t) => {
                    let free = self.free_slots(task, node, t);
                    if free == 0 {
                        None
                    } else {
                        self.caches()
                            .concurrency
                            .register(&node.name, t.name, &key, t.resource);
                        Some(SCORE_CEILING - free as f64)
                    }
                }
                Mode::WholeCards { chips, .. } => {
                    let free = self.whole_free_chips(node).len();
                    (free >= chips as usize).then(|| SCORE_CEILING - (free - chips as usize) as f64)
                }
                Mode::DynamicSlice(t) => self.score_slice(task, node, t),
            };
            if let Some(score) = score {
                trace!("vnpu: task {} node {} score={}", task.name, node.name, score);
                scores.insert(node.name.clone(), score);
            }
        }
        Ok(())
    }

    fn select(&self, task: &TaskDescriptor, node: &NodeTopology) -> Result<AllocationDecision, ScheduleError> {
        let accelerator = self.ctx.accelerator().to_string();
        match self.mode(task, Some(node))? {
            Mode::StaticTemplate(t) => {
                let slots = node.vnpu_slots(t.name);
                // pack: the chip with the fewest remaining slots goes first
                let mut remaining: HashMap<ChipId, usize> = HashMap::new();
                for template in templates::TEMPLATES {
                    for slot in node.vnpu_slots(template.name) {
                        *remaining.entry(slot.chip).or_default() += 1;
                    }
                }
                let slot = slots
                    .iter()
                    .min_by_key(|s| (remaining.get(&s.chip).copied().unwrap_or(0), s.chip, s.id.clone()))
                    .ok_or_else(|| ScheduleError::race(task, node, format!("no free {} slot", t.name)))?;
                debug!("vnpu: task {} takes slot {} on node {}", task.name, slot.id, node.name);
                Ok(AllocationDecision::Slot {
                    node: node.name.clone(),
                    accelerator,
                    slot: slot.clone(),
                })
            }
            Mode::WholeCards { chips, .. } => {
                let selected = self.select_whole_cards(node, chips).ok_or_else(|| {
                    ScheduleError::race(task, node, format!("no {} untouched chips left", chips))
                })?;
                debug!("vnpu: task {} takes whole chips {:?} on node {}", task.name, selected, node.name);
                Ok(AllocationDecision::Chips {
                    node: node.name.clone(),
                    accelerator,
                    chips: selected,
                })
            }
            Mode::DynamicSlice(t) => {
                let key = task.key();
                let already_downgraded = self.caches().downgrade.contains(&key, &node.name);
                let mut chosen = if already_downgraded {
                    None
                } else {
                    self.best_fit_chip(node, &t.resource).map(|(chip, _)| (chip, t))
                };
                if chosen.is_none() {
                    if let Some(smaller) = self.downgrade_of(t) {
                        chosen = self
                            .best_fit_chip(node, &smaller.resource)
                            .map(|(chip, _)| (chip, smaller));
                        if chosen.is_some() && !already_downgraded {
                            debug!(
                                "vnpu: task {} downgraded from {} to {} on node {}",
                                task.name, t.name, smaller.name, node.name
                            );
                            self.caches().downgrade.record(&key, &node.name);
                        }
                    }
                }
                let (chip, template) = chosen.ok_or_else(|| {
                    ScheduleError::race(task, node, format!("no chip has room for {}", t.resource))
                })?;
                Ok(AllocationDecision::Virtual {
                    node: node.name.clone(),
                    accelerator,
                    chip,
                    resource: template.resource,
                    template: template.name.to_string(),
                })
            }
        }
    }

    fn bind(&self, node: &mut NodeTopology, decision: &AllocationDecision) -> Result<(), ScheduleError> {
        self.check_node(node, decision)?;
        let job = self.ctx.job.key();
        match decision {
            AllocationDecision::Virtual { chip, resource, .. } => node
                .carve_vresource(*chip, resource)
                .map_err(|e| ScheduleError::topology(&job, &node.name, e)),
            AllocationDecision::Chips { chips, .. } => {
                let totals = chips
                    .iter()
                    .map(|chip| match node.vchips().get(chip) {
                        Some(c) if c.is_fully_free() => Ok((*chip, c.total)),
                        _ => Err(ScheduleError::SelectionRace {
                            task: job.clone(),
                            node: node.name.clone(),
                            reason: format!("chip {} is no longer untouched", chip),
                        }),
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                for (chip, total) in totals {
                    node.carve_vresource(chip, &total)
                        .map_err(|e| ScheduleError::topology(&job, &node.name, e))?;
                }
                Ok(())
            }
            AllocationDecision::Slot { slot, .. } => node
                .take_vnpu_slot(&slot.template, &slot.id)
                .map(|_| ())
                .map_err(|e| ScheduleError::topology(&job, &node.name, e)),
        }
    }

    fn release(&self, task: &TaskDescriptor, node: &mut NodeTopology) -> Result<(), ScheduleError> {
        let decision = task
            .allocation
            .as_ref()
            .ok_or_else(|| ScheduleError::Argument(format!("task {} has no binding to release", task.name)))?;
        self.check_node(node, decision)?;
        let result = match decision {
            AllocationDecision::Virtual { chip, resource, .. } => node.restore_vresource(*chip, resource),
            AllocationDecision::Chips { chips, .. } => chips.iter().try_for_each(|chip| {
                let total = node.vchips().get(chip).map(|c| c.total).unwrap_or_default();
                node.restore_vresource(*chip, &total)
            }),
            AllocationDecision::Slot { slot, .. } => {
                node.put_vnpu_slot(slot.clone());
                Ok(())
            }
        };
        result.map_err(|e| ScheduleError::topology(&task.name, &node.name, e))
    }

    fn forget(&self, task: &TaskDescriptor) {
        self.caches().concurrency.deregister_task(&task.key());
    }
}
