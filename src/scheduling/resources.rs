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

//! Data structures used to represent free/allocated accelerator chips on a node and the jobs asking for them.
//!
//! A node is described by a [`NodeTopology`]: for each accelerator type it exposes an ordered list of free chip ids
//! (the order follows the physical wiring, so it matters for ring hardware), and for virtualized nodes a per-chip
//! [`VChip`] record tracking the compute-core/AI-CPU capacity still available.
//!
//! Jobs and tasks are read-only snapshots handed over by the host. The only values the core produces are
//! [`AllocationDecision`]s and the in-place updates a committed decision makes to a [`NodeTopology`].

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::annotations;

/// Physical chip index on a node.
pub type ChipId = u32;

/// Label selecting the accelerator class (topology shape) of a job.
pub const ACCELERATOR_CLASS_LABEL: &str = "accelerator-type";
/// Annotation routing a job to the superpod handler regardless of its labels.
pub const SUPERPOD_ANNOTATION: &str = "huawei.com/schedule-superpod";
/// Node label carrying the superpod a node belongs to.
pub const SUPERPOD_ID_LABEL: &str = "superpod-id";
/// Job label overriding the number of faulted tasks tolerated before a restart.
pub const FAULT_TOLERANCE_LABEL: &str = "fault-tolerance";

// --------------------
// VResource
// --------------------
/// Fractional capacity of a single chip: AI cores and AI CPUs.
#[derive(Debug, Default, PartialEq, Eq, Hash, Clone, Copy, Serialize, Deserialize)]
pub struct VResource {
    pub aicore: u32,
    pub aicpu: u32,
}

impl VResource {
    pub const ZERO: VResource = VResource { aicore: 0, aicpu: 0 };

    pub const fn new(aicore: u32, aicpu: u32) -> Self {
        Self { aicore, aicpu }
    }

    pub fn is_zero(&self) -> bool {
        self.aicore == 0 && self.aicpu == 0
    }

    /// True if `other` fits inside `self` componentwise.
    pub fn contains(&self, other: &VResource) -> bool {
        self.aicore >= other.aicore && self.aicpu >= other.aicpu
    }

    pub fn add(&self, other: &VResource) -> Self {
        Self {
            aicore: self.aicore.saturating_add(other.aicore),
            aicpu: self.aicpu.saturating_add(other.aicpu),
        }
    }

    pub fn saturating_sub(&self, other: &VResource) -> Self {
        Self {
            aicore: self.aicore.saturating_sub(other.aicore),
            aicpu: self.aicpu.saturating_sub(other.aicpu),
        }
    }

    pub fn multiply_by(&self, factor: u32) -> Self {
        Self {
            aicore: self.aicore.saturating_mul(factor),
            aicpu: self.aicpu.saturating_mul(factor),
        }
    }
}

impl fmt::Display for VResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "aicore={} aicpu={}", self.aicore, self.aicpu)
    }
}

// --------------------
// VChip
// --------------------
/// Allocation state of one physical chip that can be sliced into virtual NPUs.
///
/// Invariant: `free <= total` componentwise.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub struct VChip {
    pub total: VResource,
    pub free: VResource,
}

impl VChip {
    pub fn new(total: VResource) -> Self {
        Self { total, free: total }
    }

    pub fn is_fully_free(&self) -> bool {
        self.free == self.total
    }

    pub fn used(&self) -> VResource {
        self.total.saturating_sub(&self.free)
    }
}

/// A pre-cut virtual NPU published by a node running in static-template mode.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct VnpuSlot {
    pub id: String,
    pub chip: ChipId,
    pub template: String,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TopologyError {
    #[error("node {node}: duplicate chip id {chip} in the {accelerator} list")]
    DuplicateChip {
        node: String,
        accelerator: String,
        chip: ChipId,
    },
    #[error("node {node}: chip {chip} is not free for {accelerator}")]
    ChipNotFree {
        node: String,
        accelerator: String,
        chip: ChipId,
    },
    #[error("node {node}: virtual chip {chip} not found")]
    VChipNotFound { node: String, chip: ChipId },
    #[error("node {node}: chip {chip} free resource ({free}) would exceed its total ({total})")]
    FreeExceedsTotal {
        node: String,
        chip: ChipId,
        free: VResource,
        total: VResource,
    },
    #[error("node {node}: chip {chip} has {free} idle, cannot carve {requested}")]
    NotEnoughVResource {
        node: String,
        chip: ChipId,
        requested: VResource,
        free: VResource,
    },
    #[error("node {node}: vNPU slot {slot} not found")]
    SlotNotFound { node: String, slot: String },
    #[error("node {node}: {source}")]
    Annotation {
        node: String,
        #[source]
        source: annotations::AnnotationError,
    },
}

// --------------------
// NodeTopology
// --------------------
/// Everything the placement core knows about one candidate node.
#[derive(Debug, Default, PartialEq, Clone)]
pub struct NodeTopology {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    free_chips: BTreeMap<String, Vec<ChipId>>,
    unhealthy_chips: BTreeMap<String, BTreeSet<ChipId>>,
    capacity: BTreeMap<String, usize>,
    vchips: BTreeMap<ChipId, VChip>,
    vnpu_slots: BTreeMap<String, Vec<VnpuSlot>>,
}

impl NodeTopology {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Builds a node from its annotation map, parsing the free chip list of each accelerator in `accelerators`.
    ///
    /// Accelerators without an annotation are left absent; handlers report that as an argument error.
    pub fn from_annotations(
        name: impl Into<String>,
        annotations: &BTreeMap<String, String>,
        accelerators: &[&str],
    ) -> Result<Self, TopologyError> {
        let mut node = Self::new(name);
        for accelerator in accelerators {
            let Some(text) = annotations.get(*accelerator) else {
                continue;
            };
            let chips = annotations::parse_chip_list(accelerator, text).map_err(|source| {
                TopologyError::Annotation {
                    node: node.name.clone(),
                    source,
                }
            })?;
            node = node.with_free_chips(*accelerator, chips)?;
        }
        Ok(node)
    }

    /// Sets the free chip list for `accelerator`. The healthy capacity defaults to the list length.
    pub fn with_free_chips(
        mut self,
        accelerator: impl Into<String>,
        chips: Vec<ChipId>,
    ) -> Result<Self, TopologyError> {
        let accelerator = accelerator.into();
        let mut seen = BTreeSet::new();
        for chip in &chips {
            if !seen.insert(*chip) {
                return Err(TopologyError::DuplicateChip {
                    node: self.name.clone(),
                    accelerator,
                    chip: *chip,
                });
            }
        }
        self.capacity.entry(accelerator.clone()).or_insert(chips.len());
        self.free_chips.insert(accelerator, chips);
        Ok(self)
    }

    pub fn with_capacity(mut self, accelerator: impl Into<String>, healthy_chips: usize) -> Self {
        self.capacity.insert(accelerator.into(), healthy_chips);
        self
    }

    pub fn with_unhealthy_chips(mut self, accelerator: impl Into<String>, chips: &[ChipId]) -> Self {
        self.unhealthy_chips
            .entry(accelerator.into())
            .or_default()
            .extend(chips.iter().copied());
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_vchip(mut self, chip: ChipId, vchip: VChip) -> Result<Self, TopologyError> {
        if !vchip.total.contains(&vchip.free) {
            return Err(TopologyError::FreeExceedsTotal {
                node: self.name.clone(),
                chip,
                free: vchip.free,
                total: vchip.total,
            });
        }
        self.vchips.insert(chip, vchip);
        Ok(self)
    }

    pub fn with_vnpu_slot(mut self, slot: VnpuSlot) -> Self {
        self.vnpu_slots
            .entry(slot.template.clone())
            .or_default()
            .push(slot);
        self
    }

    pub fn has_accelerator(&self, accelerator: &str) -> bool {
        self.free_chips.contains_key(accelerator)
    }

    pub fn free_chips(&self, accelerator: &str) -> &[ChipId] {
        self.free_chips
            .get(accelerator)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn unhealthy_chips(&self, accelerator: &str) -> Option<&BTreeSet<ChipId>> {
        self.unhealthy_chips.get(accelerator)
    }

    /// Number of healthy chips the node reports for `accelerator`, free or not.
    pub fn healthy_chip_count(&self, accelerator: &str) -> usize {
        self.capacity.get(accelerator).copied().unwrap_or(0)
    }

    pub fn vchips(&self) -> &BTreeMap<ChipId, VChip> {
        &self.vchips
    }

    pub fn vnpu_slots(&self, template: &str) -> &[VnpuSlot] {
        self.vnpu_slots
            .get(template)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Sum of the free virtual resource over every chip of the node.
    pub fn free_vresource(&self) -> VResource {
        self.vchips
            .values()
            .fold(VResource::ZERO, |acc, c| acc.add(&c.free))
    }

    /// Removes `chips` from the free list of `accelerator`. Either all chips are removed or none.
    pub fn remove_chips(&mut self, accelerator: &str, chips: &[ChipId]) -> Result<(), TopologyError> {
        let free = self.free_chips.get(accelerator).cloned().unwrap_or_default();
        for chip in chips {
            if !free.contains(chip) {
                return Err(TopologyError::ChipNotFree {
                    node: self.name.clone(),
                    accelerator: accelerator.to_string(),
                    chip: *chip,
                });
            }
        }
        let remaining: Vec<ChipId> = free.into_iter().filter(|c| !chips.contains(c)).collect();
        self.free_chips.insert(accelerator.to_string(), remaining);
        Ok(())
    }

    /// Puts `chips` back on the free list of `accelerator`, keeping the list in physical (ascending) order.
    pub fn restore_chips(&mut self, accelerator: &str, chips: &[ChipId]) -> Result<(), TopologyError> {
        let free = self.free_chips.entry(accelerator.to_string()).or_default();
        for chip in chips {
            if free.contains(chip) {
                return Err(TopologyError::DuplicateChip {
                    node: self.name.clone(),
                    accelerator: accelerator.to_string(),
                    chip: *chip,
                });
            }
        }
        free.extend(chips.iter().copied());
        free.sort_unstable();
        Ok(())
    }

    /// Takes `requested` out of the free resource of `chip`.
    pub fn carve_vresource(&mut self, chip: ChipId, requested: &VResource) -> Result<(), TopologyError> {
        let node = self.name.clone();
        let vchip = self
            .vchips
            .get_mut(&chip)
            .ok_or(TopologyError::VChipNotFound {
                node: node.clone(),
                chip,
            })?;
        if !vchip.free.contains(requested) {
            return Err(TopologyError::NotEnoughVResource {
                node,
                chip,
                requested: *requested,
                free: vchip.free,
            });
        }
        vchip.free = vchip.free.saturating_sub(requested);
        Ok(())
    }

    /// Gives `released` back to `chip`. Fails rather than letting free exceed total.
    pub fn restore_vresource(&mut self, chip: ChipId, released: &VResource) -> Result<(), TopologyError> {
        let node = self.name.clone();
        let vchip = self
            .vchips
            .get_mut(&chip)
            .ok_or(TopologyError::VChipNotFound {
                node: node.clone(),
                chip,
            })?;
        let free = vchip.free.add(released);
        if !vchip.total.contains(&free) {
            return Err(TopologyError::FreeExceedsTotal {
                node,
                chip,
                free,
                total: vchip.total,
            });
        }
        vchip.free = free;
        Ok(())
    }

    pub fn take_vnpu_slot(&mut self, template: &str, slot_id: &str) -> Result<VnpuSlot, TopologyError> {
        let slots = self.vnpu_slots.entry(template.to_string()).or_default();
        let Some(pos) = slots.iter().position(|s| s.id == slot_id) else {
            return Err(TopologyError::SlotNotFound {
                node: self.name.clone(),
                slot: slot_id.to_string(),
            });
        };
        Ok(slots.remove(pos))
    }

    pub fn put_vnpu_slot(&mut self, slot: VnpuSlot) {
        let slots = self.vnpu_slots.entry(slot.template.clone()).or_default();
        if !slots.iter().any(|s| s.id == slot.id) {
            slots.push(slot);
        }
    }

    /// The free chip list of `accelerator` rendered as its node annotation value.
    pub fn free_chip_annotation(&self, accelerator: &str) -> String {
        annotations::format_chip_list(accelerator, self.free_chips(accelerator))
    }
}

// --------------------
// Jobs and tasks
// --------------------
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// What a single task asks for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskRequest {
    /// A whole number of physical chips.
    Chips(u32),
    /// A virtual NPU: either a pre-declared template or a core count cut at schedule time.
    Virtual {
        aicore: u32,
        template: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaskDescriptor {
    pub name: String,
    /// Key of the owning job (`namespace/name`).
    pub job: String,
    pub rank: Option<u32>,
    pub request: TaskRequest,
    /// Node the task is currently bound to, if any.
    pub node: Option<String>,
    pub allocation: Option<AllocationDecision>,
}

impl TaskDescriptor {
    pub fn new(name: impl Into<String>, job: impl Into<String>, request: TaskRequest) -> Self {
        Self {
            name: name.into(),
            job: job.into(),
            rank: None,
            request,
            node: None,
            allocation: None,
        }
    }

    pub fn with_rank(mut self, rank: u32) -> Self {
        self.rank = Some(rank);
        self
    }

    /// Marks the task as bound by `decision`.
    pub fn with_allocation(mut self, decision: AllocationDecision) -> Self {
        self.node = Some(decision.node().to_string());
        self.allocation = Some(decision);
        self
    }

    /// Key used by the vNPU caches: unique per task across jobs.
    pub fn key(&self) -> String {
        format!("{}/{}", self.job, self.name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobDescriptor {
    pub name: String,
    pub namespace: String,
    pub status: JobStatus,
    /// Resource name of the accelerator, e.g. `huawei.com/Ascend910`.
    pub accelerator_type: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub tasks: Vec<TaskDescriptor>,
    /// Declared limits. They can only tighten what the hardware shape allows.
    pub max_chips_per_node: Option<u32>,
    pub max_chips_per_card: Option<u32>,
    pub invalid_counts: BTreeSet<u32>,
}

impl JobDescriptor {
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        accelerator_type: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            status: JobStatus::Pending,
            accelerator_type: accelerator_type.into(),
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            tasks: Vec::new(),
            max_chips_per_node: None,
            max_chips_per_card: None,
            invalid_counts: BTreeSet::new(),
        }
    }

    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    /// Adds `count` tasks with ranks `0..count`, each requesting `request`.
    pub fn with_tasks(mut self, count: u32, request: TaskRequest) -> Self {
        let key = self.key();
        for rank in 0..count {
            self.tasks.push(
                TaskDescriptor::new(format!("{}-{}", self.name, rank), key.clone(), request.clone())
                    .with_rank(rank),
            );
        }
        self
    }

    pub fn with_task(mut self, task: TaskDescriptor) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn is_running(&self) -> bool {
        self.status == JobStatus::Running
    }

    pub fn is_virtual(&self) -> bool {
        self.tasks
            .iter()
            .any(|t| matches!(t.request, TaskRequest::Virtual { .. }))
    }

    pub fn is_superpod(&self) -> bool {
        self.annotations.contains_key(SUPERPOD_ANNOTATION)
    }
}

// --------------------
// Decisions
// --------------------
/// The chips (or chip slice) chosen for one task on one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AllocationDecision {
    Chips {
        node: String,
        accelerator: String,
        chips: Vec<ChipId>,
    },
    Virtual {
        node: String,
        accelerator: String,
        chip: ChipId,
        resource: VResource,
        template: String,
    },
    Slot {
        node: String,
        accelerator: String,
        slot: VnpuSlot,
    },
}

impl AllocationDecision {
    pub fn node(&self) -> &str {
        match self {
            AllocationDecision::Chips { node, .. } => node,
            AllocationDecision::Virtual { node, .. } => node,
            AllocationDecision::Slot { node, .. } => node,
        }
    }

    pub fn accelerator(&self) -> &str {
        match self {
            AllocationDecision::Chips { accelerator, .. } => accelerator,
            AllocationDecision::Virtual { accelerator, .. } => accelerator,
            AllocationDecision::Slot { accelerator, .. } => accelerator,
        }
    }

    /// The value written to the task's binding annotation.
    pub fn to_task_annotation(&self) -> String {
        match self {
            AllocationDecision::Chips {
                accelerator, chips, ..
            } => annotations::format_chip_list(accelerator, chips),
            AllocationDecision::Virtual {
                accelerator,
                chip,
                template,
                ..
            } => format!("{}-{}-{}", annotations::short_name(accelerator), template, chip),
            AllocationDecision::Slot { slot, .. } => slot.id.clone(),
        }
    }
}

/// The chips a rank held on a node, kept across sessions so a restarted task goes back to the same slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankSlot {
    pub node: String,
    pub accelerator: String,
    pub chips: Vec<ChipId>,
}

impl RankSlot {
    pub fn from_decision(decision: &AllocationDecision) -> Option<Self> {
        match decision {
            AllocationDecision::Chips {
                node,
                accelerator,
                chips,
            } => Some(Self {
                node: node.clone(),
                accelerator: accelerator.clone(),
                chips: chips.clone(),
            }),
            _ => None,
        }
    }
}

// --------------------
// Tests
// --------------------
