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

//! The record the reschedule pass keeps between sessions.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::scheduling::resources::{ChipId, RankSlot};
use crate::scheduling::session::RecoveryState;

/// Why a node is considered faulty.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultNode {
    /// The whole node was reported unhealthy.
    pub whole_node: bool,
    /// Unhealthy chips of the managed accelerator.
    pub chips: BTreeSet<ChipId>,
}

impl FaultNode {
    /// True if a task bound to `chips` on this node is affected.
    pub fn affects(&self, chips: &[ChipId]) -> bool {
        self.whole_node || chips.iter().any(|c| self.chips.contains(c))
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultJob {
    pub faulted_tasks: BTreeSet<String>,
    pub fault_count: u32,
    /// Out of retries; the job is force deleted at the start of the next session.
    pub needs_force_delete: bool,
    /// Restarted and waiting for its ranks to be placed again.
    pub restarting: bool,
}

/// Fault and rank state carried from one session to the next. Keys are node names and job keys.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RescheduleCache {
    pub fault_nodes: BTreeMap<String, FaultNode>,
    pub fault_jobs: BTreeMap<String, FaultJob>,
    pub retry_remaining: BTreeMap<String, u32>,
    pub rank_slots: BTreeMap<String, BTreeMap<u32, RankSlot>>,
}

impl RescheduleCache {
    pub fn from_json(data: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(data)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Drops everything recorded for `job`.
    pub fn forget_job(&mut self, job: &str) {
        self.fault_jobs.remove(job);
        self.retry_remaining.remove(job);
        self.rank_slots.remove(job);
    }

    /// Keeps only the jobs in `live`.
    pub fn retain_jobs(&mut self, live: &BTreeSet<String>) {
        self.fault_jobs.retain(|job, _| live.contains(job));
        self.retry_remaining.retain(|job, _| live.contains(job));
        self.rank_slots.retain(|job, _| live.contains(job));
    }

    /// True if the slot's node or any of its chips is faulty.
    pub fn slot_is_faulty(&self, slot: &RankSlot) -> bool {
        self.fault_nodes
            .get(&slot.node)
            .is_some_and(|fault| fault.affects(&slot.chips))
    }

    pub fn recovery_state(&self) -> RecoveryState {
        RecoveryState::new(self.rank_slots.clone())
    }
}
