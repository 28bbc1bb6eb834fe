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

//! Scheduler state and the per-session placement loop.
//!
//! [`SchedulerState`] lives as long as the scheduler and owns what outlives a session: configuration, the vNPU
//! caches and the handler registry. Each scheduling cycle opens a [`Session`] carrying a [`SessionContext`] with the
//! recovery map produced by the reschedule pass. Handlers only ever see the session context, so tests build a fresh
//! one per case.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use comfy_table::{presets::UTF8_FULL, Cell, ContentArrangement, Table};
use log::{debug, info, log_enabled, warn, Level};
use thiserror::Error;
use uuid::Uuid;

use super::config::SchedulerConfig;
use super::dispatcher::{DispatchError, Dispatcher};
use super::handler::{ScheduleError, TopologyHandler, ValidationResult};
use super::resources::{AllocationDecision, ChipId, JobDescriptor, NodeTopology, RankSlot, TaskDescriptor};
use super::vnpu::VnpuCaches;

// --------------------
// Recovery
// --------------------

/// Rank slots of jobs being restarted, keyed by job key then rank.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RecoveryState {
    slots: BTreeMap<String, BTreeMap<u32, RankSlot>>,
}

impl RecoveryState {
    pub fn new(slots: BTreeMap<String, BTreeMap<u32, RankSlot>>) -> Self {
        Self { slots }
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn slots(&self) -> &BTreeMap<String, BTreeMap<u32, RankSlot>> {
        &self.slots
    }

    pub fn slot(&self, job: &str, rank: u32) -> Option<&RankSlot> {
        self.slots.get(job).and_then(|ranks| ranks.get(&rank))
    }

    /// Chips of `node` held for ranks other than the one `task` runs.
    pub fn reserved_chips(&self, node: &str, accelerator: &str, task: &TaskDescriptor) -> BTreeSet<ChipId> {
        let mut reserved = BTreeSet::new();
        for (job, ranks) in &self.slots {
            for (rank, slot) in ranks {
                if slot.node != node || slot.accelerator != accelerator {
                    continue;
                }
                if *job == task.job && Some(*rank) == task.rank {
                    continue;
                }
                reserved.extend(slot.chips.iter().copied());
            }
        }
        reserved
    }

    /// Nodes holding any rank slot of `job`.
    pub fn nodes_for_job(&self, job: &str) -> BTreeSet<String> {
        self.slots
            .get(job)
            .map(|ranks| ranks.values().map(|s| s.node.clone()).collect())
            .unwrap_or_default()
    }
}

/// Everything a handler may read about the current session.
#[derive(Debug)]
pub struct SessionContext {
    pub id: Uuid,
    pub config: Arc<SchedulerConfig>,
    pub caches: Arc<VnpuCaches>,
    pub recovery: RecoveryState,
}

impl SessionContext {
    pub fn new(config: Arc<SchedulerConfig>, caches: Arc<VnpuCaches>, recovery: RecoveryState) -> Self {
        Self {
            id: Uuid::new_v4(),
            config,
            caches,
            recovery,
        }
    }
}

// --------------------
// Scheduler state
// --------------------

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlacementError {
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error("job {job} rejected: {} ({})", .result.reason, .result.message)]
    Rejected { job: String, result: ValidationResult },
    #[error("no node can host task {task}")]
    NoFeasibleNode { task: String },
    #[error(transparent)]
    Schedule(#[from] ScheduleError),
}

#[derive(Debug)]
pub struct SchedulerState {
    config: Arc<SchedulerConfig>,
    caches: Arc<VnpuCaches>,
    dispatcher: Arc<Dispatcher>,
}

impl SchedulerState {
    pub fn new(config: SchedulerConfig) -> Self {
        let dispatcher = Dispatcher::with_default_handlers(&config);
        Self::with_dispatcher(config, dispatcher)
    }

    pub fn with_dispatcher(config: SchedulerConfig, dispatcher: Dispatcher) -> Self {
        Self {
            config: Arc::new(config),
            caches: Arc::new(VnpuCaches::default()),
            dispatcher: Arc::new(dispatcher),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn caches(&self) -> &Arc<VnpuCaches> {
        &self.caches
    }

    pub fn open_session(&self, recovery: RecoveryState) -> Session {
        let context = Arc::new(SessionContext::new(
            Arc::clone(&self.config),
            Arc::clone(&self.caches),
            recovery,
        ));
        info!("opened scheduling session {}", context.id);
        Session {
            context,
            dispatcher: Arc::clone(&self.dispatcher),
        }
    }

    /// Drops cache entries of a job that completed or was deleted.
    pub fn on_job_finished(&self, job: &JobDescriptor) {
        debug!("clearing vNPU caches of finished job {}", job.key());
        self.caches.on_job_finished(&job.key());
    }
}

// --------------------
// Session
// --------------------

/// One scheduling cycle.
#[derive(Debug)]
pub struct Session {
    context: Arc<SessionContext>,
    dispatcher: Arc<Dispatcher>,
}

impl Session {
    pub fn context(&self) -> &Arc<SessionContext> {
        &self.context
    }

    /// Dispatches `job` and runs its admission check.
    pub fn handler_for(&self, job: &Arc<JobDescriptor>) -> Result<Box<dyn TopologyHandler>, PlacementError> {
        let handler = self.dispatcher.dispatch(job, &self.context)?;
        let result = handler.validate_job();
        if !result.pass {
            return Err(PlacementError::Rejected { job: job.key(), result });
        }
        Ok(handler)
    }

    /// Places one task: filters feasible nodes, scores them, then selects and binds on the best node that still fits.
    ///
    /// # Returns
    /// The task with its allocation set. The chosen node in `nodes` is updated in place.
    pub fn place_task(
        &self,
        handler: &dyn TopologyHandler,
        task: &TaskDescriptor,
        nodes: &mut [NodeTopology],
    ) -> Result<TaskDescriptor, PlacementError> {
        let result = self.try_place_task(handler, task, nodes);
        handler.forget(task);
        result
    }

    fn try_place_task(
        &self,
        handler: &dyn TopologyHandler,
        task: &TaskDescriptor,
        nodes: &mut [NodeTopology],
    ) -> Result<TaskDescriptor, PlacementError> {
        let mut candidates = Vec::new();
        for node in nodes.iter() {
            match handler.check_feasible(task, node) {
                Ok(()) => candidates.push(node.clone()),
                Err(e) if e.excludes_node() => debug!("{}", e),
                Err(e) => return Err(e.into()),
            }
        }
        if candidates.is_empty() {
            return Err(PlacementError::NoFeasibleNode { task: task.name.clone() });
        }
        let mut scores: HashMap<String, f64> = candidates.iter().map(|n| (n.name.clone(), 0.0)).collect();
        handler.score(task, &candidates, &mut scores)?;
        let mut ranked: Vec<(&String, f64)> = scores.iter().map(|(name, score)| (name, *score)).collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(b.0)));

        for (name, score) in ranked {
            let Some(node) = nodes.iter_mut().find(|n| n.name == *name) else {
                continue;
            };
            let decision = match handler.select(task, node) {
                Ok(decision) => decision,
                Err(e) if e.excludes_node() => {
                    debug!("{}", e);
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            match handler.bind(node, &decision) {
                Ok(()) => {}
                Err(e) if e.excludes_node() => {
                    debug!("{}", e);
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
            debug!(
                "{}: task {} bound to node {} (score {}) as {}",
                handler.name(),
                task.name,
                name,
                score,
                decision.to_task_annotation()
            );
            return Ok(task.clone().with_allocation(decision));
        }
        Err(PlacementError::NoFeasibleNode { task: task.name.clone() })
    }

    /// Places every task of `job`. If any task cannot be placed, the tasks already bound are released again.
    pub fn place_job(
        &self,
        job: &Arc<JobDescriptor>,
        nodes: &mut [NodeTopology],
    ) -> Result<Vec<TaskDescriptor>, PlacementError> {
        let handler = self.handler_for(job)?;
        let mut placed: Vec<TaskDescriptor> = Vec::new();
        for task in &job.tasks {
            match self.place_task(handler.as_ref(), task, nodes) {
                Ok(bound) => placed.push(bound),
                Err(e) => {
                    warn!("job {}: {}; releasing {} bound tasks", job.key(), e, placed.len());
                    for bound in placed.iter().rev() {
                        let Some(node) = bound.node.as_deref().and_then(|n| nodes.iter_mut().find(|x| x.name == n))
                        else {
                            continue;
                        };
                        if let Err(release_error) = handler.release(bound, node) {
                            warn!("job {}: {}", job.key(), release_error);
                        }
                    }
                    return Err(e);
                }
            }
        }
        info!("job {} placed: {} tasks", job.key(), placed.len());
        if log_enabled!(Level::Debug) {
            debug!("chip usage after placing {}:\n{}", job.key(), utilization_table(nodes, &job.accelerator_type));
        }
        Ok(placed)
    }
}

// --------------------
// Reporting
// --------------------

/// Free chip annotation of every node that carries `accelerator`, keyed by node name.
pub fn node_annotations(nodes: &[NodeTopology], accelerator: &str) -> BTreeMap<String, String> {
    nodes
        .iter()
        .filter(|n| n.has_accelerator(accelerator))
        .map(|n| (n.name.clone(), n.free_chip_annotation(accelerator)))
        .collect()
}

fn create_bar_chart(used: f32, total: f32, width: usize) -> String {
    if total <= 0.0 {
        return format!("[{}] {used:.0}/{total:.0}", "-".repeat(width));
    }
    let filled = ((used / total).clamp(0.0, 1.0) * width as f32) as usize;
    format!(
        "[{}{}] {used:.0}/{total:.0}",
        "#".repeat(filled),
        "-".repeat(width - filled)
    )
}

/// Renders chip usage per node for logs.
pub fn utilization_table(nodes: &[NodeTopology], accelerator: &str) -> String {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Node"),
            Cell::new("Free chips"),
            Cell::new("Unhealthy"),
            Cell::new("Utilization"),
        ]);

    let mut sorted: Vec<&NodeTopology> = nodes.iter().filter(|n| n.has_accelerator(accelerator)).collect();
    sorted.sort_by(|a, b| a.name.cmp(&b.name));
    for node in sorted {
        let total = node.healthy_chip_count(accelerator);
        let free = node.free_chips(accelerator).len();
        let unhealthy = node.unhealthy_chips(accelerator).map_or(0, |u| u.len());
        table.add_row(vec![
            Cell::new(&node.name),
            Cell::new(node.free_chip_annotation(accelerator)),
            Cell::new(unhealthy),
            Cell::new(create_bar_chart(total.saturating_sub(free) as f32, total as f32, 20)),
        ]);
    }
    table.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduling::handler::REASON_INVALID_NPU_NUM;
    use crate::scheduling::resources::{TaskRequest, ACCELERATOR_CLASS_LABEL};

    const NPU: &str = "huawei.com/Ascend910";

    fn node(name: &str, free: Vec<ChipId>) -> NodeTopology {
        NodeTopology::new(name)
            .with_capacity(NPU, 8)
            .with_free_chips(NPU, free)
            .expect("node")
    }

    fn job(tasks: u32, chips: u32) -> Arc<JobDescriptor> {
        Arc::new(JobDescriptor::new("default", "train", NPU).with_tasks(tasks, TaskRequest::Chips(chips)))
    }

    #[test]
    fn test_reserved_chips_skip_own_rank() {
        let slot = |node: &str, chips: Vec<ChipId>| RankSlot {
            node: node.into(),
            accelerator: NPU.into(),
            chips,
        };
        let recovery = RecoveryState::new(BTreeMap::from([(
            "default/train".to_string(),
            BTreeMap::from([(0, slot("n0", vec![0, 1])), (1, slot("n0", vec![2, 3])), (2, slot("n1", vec![0]))]),
        )]));
        let task = TaskDescriptor::new("train-0", "default/train", TaskRequest::Chips(2)).with_rank(0);
        assert_eq!(recovery.reserved_chips("n0", NPU, &task), BTreeSet::from([2, 3]));
        assert_eq!(
            recovery.nodes_for_job("default/train"),
            BTreeSet::from(["n0".to_string(), "n1".to_string()])
        );
        assert!(recovery.nodes_for_job("default/other").is_empty());
    }

    #[test]
    fn test_place_job_picks_tidiest_nodes() {
        let state = SchedulerState::new(SchedulerConfig::default());
        let session = state.open_session(RecoveryState::default());
        let mut nodes = vec![node("a", (0..8).collect()), node("b", vec![4, 5, 6, 7])];
        let placed = session.place_job(&job(2, 4), &mut nodes).expect("place");
        assert_eq!(placed.len(), 2);
        assert_eq!(placed[0].node.as_deref(), Some("b"));
        assert_eq!(placed[1].node.as_deref(), Some("a"));
        assert!(nodes[1].free_chips(NPU).is_empty());
        assert_eq!(nodes[0].free_chips(NPU).len(), 4);
        assert_eq!(
            node_annotations(&nodes, NPU)["a"],
            "Ascend910-4,Ascend910-5,Ascend910-6,Ascend910-7"
        );
    }

    #[test]
    fn test_failed_job_releases_bound_tasks() {
        let state = SchedulerState::new(SchedulerConfig::default());
        let session = state.open_session(RecoveryState::default());
        let mut nodes = vec![node("a", (0..8).collect())];
        let before = nodes.clone();
        let err = session.place_job(&job(3, 4), &mut nodes).unwrap_err();
        assert!(matches!(err, PlacementError::NoFeasibleNode { .. }));
        assert_eq!(nodes, before);
    }

    #[test]
    fn test_invalid_job_is_rejected_before_placement() {
        let state = SchedulerState::new(SchedulerConfig::default());
        let session = state.open_session(RecoveryState::default());
        let mut nodes = vec![node("a", (0..8).collect())];
        match session.place_job(&job(1, 3), &mut nodes).unwrap_err() {
            PlacementError::Rejected { result, .. } => assert_eq!(result.reason, REASON_INVALID_NPU_NUM),
            err => panic!("unexpected error variant: {err:?}"),
        }
        let card = Arc::new(
            JobDescriptor::new("default", "train", NPU)
                .with_label(ACCELERATOR_CLASS_LABEL, "rack")
                .with_tasks(1, TaskRequest::Chips(1)),
        );
        assert!(matches!(
            session.place_job(&card, &mut nodes).unwrap_err(),
            PlacementError::Dispatch(DispatchError::NotSupported(_))
        ));
    }

    #[test]
    fn test_split_rings_fall_through_to_next_node() {
        let state = SchedulerState::new(SchedulerConfig::default());
        let session = state.open_session(RecoveryState::default());
        // "split" has four free chips but no full ring; it is never scored, "ring" gets the task
        let mut nodes = vec![node("split", vec![0, 1, 4, 5]), node("ring", vec![0, 1, 2, 3])];
        let placed = session.place_job(&job(1, 4), &mut nodes).expect("place");
        assert_eq!(placed[0].node.as_deref(), Some("ring"));
    }

    #[test]
    fn test_node_without_accelerator_is_skipped() {
        let state = SchedulerState::new(SchedulerConfig::default());
        let session = state.open_session(RecoveryState::default());
        let mut nodes = vec![NodeTopology::new("cpu-only"), node("good", (0..8).collect())];
        let placed = session.place_job(&job(1, 2), &mut nodes).expect("place");
        assert_eq!(placed[0].node.as_deref(), Some("good"));
        assert_eq!(nodes[0], NodeTopology::new("cpu-only"));
        assert_eq!(nodes[1].free_chips(NPU).len(), 6);

        let mut bare = vec![NodeTopology::new("cpu-only")];
        assert!(matches!(
            session.place_job(&job(1, 2), &mut bare).unwrap_err(),
            PlacementError::NoFeasibleNode { .. }
        ));
    }

    #[test]
    fn test_utilization_table() {
        let nodes = vec![node("a", vec![0, 1]).with_unhealthy_chips(NPU, &[7])];
        let table = utilization_table(&nodes, NPU);
        assert!(table.contains("Ascend910-0,Ascend910-1"));
        assert!(table.contains("6/8"));
        assert_eq!(create_bar_chart(0.0, 0.0, 4), "[----] 0/0");
    }
}
