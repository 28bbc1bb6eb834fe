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

//! The contract every topology handler implements, and the errors it reports.
//!
//! The host drives a handler through a fixed sequence for every job: [`TopologyHandler::validate_job`] once, then
//! [`TopologyHandler::check_feasible`] and [`TopologyHandler::score`] over the candidate nodes of each task, then
//! [`TopologyHandler::select`] and [`TopologyHandler::bind`] on the chosen node. [`TopologyHandler::release`] undoes
//! a bind that never turned into a running task.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use super::config::SchedulerConfig;
use super::resources::{AllocationDecision, JobDescriptor, NodeTopology, TaskDescriptor, TaskRequest, TopologyError};
use super::session::{RecoveryState, SessionContext};

/// Reason reported when a task asks for a chip count its shape cannot serve.
pub const REASON_INVALID_NPU_NUM: &str = "task req npu num is invalid";
/// Reason reported when vNPU labels do not match the requested slice.
pub const REASON_INVALID_VNPU_LABELS: &str = "task vnpu labels are invalid";
/// Reason reported when a job mixes request kinds a handler cannot serve together.
pub const REASON_INVALID_REQUEST_KIND: &str = "task request kind is invalid";

/// Job admission result handed back to the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationResult {
    pub pass: bool,
    pub reason: String,
    pub message: String,
}

impl ValidationResult {
    pub fn ok() -> Self {
        Self {
            pass: true,
            reason: String::new(),
            message: String::new(),
        }
    }

    pub fn fail(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            pass: false,
            reason: reason.into(),
            message: message.into(),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScheduleError {
    #[error("invalid argument: {0}")]
    Argument(String),
    /// The node's inventory lacks what the task needs to even be considered, e.g. the accelerator annotation.
    #[error("invalid node {node} for task {task}: {reason}")]
    NodeArgument {
        task: String,
        node: String,
        reason: String,
    },
    #[error("task {task} cannot be placed on node {node}: {reason}")]
    Feasibility {
        task: String,
        node: String,
        reason: String,
    },
    #[error("task {task} lost node {node} before selection: {reason}")]
    SelectionRace {
        task: String,
        node: String,
        reason: String,
    },
    #[error("task {task} on node {node}: {source}")]
    Topology {
        task: String,
        node: String,
        #[source]
        source: TopologyError,
    },
}

impl ScheduleError {
    pub fn feasibility(task: &TaskDescriptor, node: &NodeTopology, reason: impl Into<String>) -> Self {
        Self::Feasibility {
            task: task.name.clone(),
            node: node.name.clone(),
            reason: reason.into(),
        }
    }

    pub fn node_argument(task: &TaskDescriptor, node: &NodeTopology, reason: impl Into<String>) -> Self {
        Self::NodeArgument {
            task: task.name.clone(),
            node: node.name.clone(),
            reason: reason.into(),
        }
    }

    pub fn race(task: &TaskDescriptor, node: &NodeTopology, reason: impl Into<String>) -> Self {
        Self::SelectionRace {
            task: task.name.clone(),
            node: node.name.clone(),
            reason: reason.into(),
        }
    }

    pub fn topology(task: &str, node: &str, source: TopologyError) -> Self {
        Self::Topology {
            task: task.to_string(),
            node: node.to_string(),
            source,
        }
    }

    /// Failures scoped to one node only exclude that node; the host should try another one.
    pub fn excludes_node(&self) -> bool {
        matches!(
            self,
            ScheduleError::Feasibility { .. }
                | ScheduleError::SelectionRace { .. }
                | ScheduleError::NodeArgument { .. }
        )
    }
}

/// Job and session state a handler is constructed with. One handler instance serves one job for one cycle.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job: Arc<JobDescriptor>,
    pub session: Arc<SessionContext>,
}

impl JobContext {
    pub fn new(job: Arc<JobDescriptor>, session: Arc<SessionContext>) -> Self {
        Self { job, session }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.session.config
    }

    pub fn recovery(&self) -> &RecoveryState {
        &self.session.recovery
    }

    pub fn accelerator(&self) -> &str {
        &self.job.accelerator_type
    }
}

pub trait TopologyHandler: Send + Sync + fmt::Debug {
    /// Name of the hardware shape, for logs.
    fn name(&self) -> &'static str;

    fn context(&self) -> &JobContext;

    fn validate_job(&self) -> ValidationResult;

    fn check_feasible(&self, task: &TaskDescriptor, node: &NodeTopology) -> Result<(), ScheduleError>;

    /// Writes a score for every node of `nodes` that can host `task`. `scores` must be pre-seeded by the host.
    fn score(
        &self,
        task: &TaskDescriptor,
        nodes: &[NodeTopology],
        scores: &mut HashMap<String, f64>,
    ) -> Result<(), ScheduleError>;

    fn select(&self, task: &TaskDescriptor, node: &NodeTopology) -> Result<AllocationDecision, ScheduleError>;

    fn bind(&self, node: &mut NodeTopology, decision: &AllocationDecision) -> Result<(), ScheduleError>;

    fn release(&self, task: &TaskDescriptor, node: &mut NodeTopology) -> Result<(), ScheduleError>;

    /// Drops any in-flight state kept for `task` while it was being placed. Called once the task is bound or given up.
    fn forget(&self, _task: &TaskDescriptor) {}
}

/// Whole chip count requested by `task`.
pub fn requested_chips(task: &TaskDescriptor) -> Result<u32, ScheduleError> {
    match &task.request {
        TaskRequest::Chips(n) => Ok(*n),
        TaskRequest::Virtual { .. } => Err(ScheduleError::Argument(format!(
            "task {} requests a virtual NPU from a whole-chip handler",
            task.name
        ))),
    }
}

/// Rejects an empty score map before any node is probed.
pub fn ensure_score_map(task: &TaskDescriptor, scores: &HashMap<String, f64>) -> Result<(), ScheduleError> {
    if scores.is_empty() {
        return Err(ScheduleError::Argument(format!(
            "empty score map for task {}",
            task.name
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_result_constructors() {
        assert!(ValidationResult::ok().pass);
        let r = ValidationResult::fail(REASON_INVALID_NPU_NUM, "65 > 64");
        assert!(!r.pass);
        assert_eq!(r.reason, "task req npu num is invalid");
    }

    #[test]
    fn test_error_classification() {
        let task = TaskDescriptor::new("t0", "ns/j", TaskRequest::Chips(1));
        let node = NodeTopology::new("n0");
        assert!(ScheduleError::feasibility(&task, &node, "full").excludes_node());
        assert!(ScheduleError::race(&task, &node, "gone").excludes_node());
        assert!(ScheduleError::node_argument(&task, &node, "no annotation").excludes_node());
        assert!(!ScheduleError::Argument("x".into()).excludes_node());
        let msg = ScheduleError::feasibility(&task, &node, "full").to_string();
        assert!(msg.contains("t0") && msg.contains("n0"));
    }

    #[test]
    fn test_requested_chips() {
        let task = TaskDescriptor::new("t0", "ns/j", TaskRequest::Chips(4));
        assert_eq!(requested_chips(&task), Ok(4));
        let task = TaskDescriptor::new(
            "t1",
            "ns/j",
            TaskRequest::Virtual {
                aicore: 2,
                template: None,
            },
        );
        assert!(matches!(requested_chips(&task), Err(ScheduleError::Argument(_))));
    }

    #[test]
    fn test_empty_score_map_is_argument_error() {
        let task = TaskDescriptor::new("t0", "ns/j", TaskRequest::Chips(1));
        let err = ensure_score_map(&task, &HashMap::new()).unwrap_err();
        assert!(matches!(err, ScheduleError::Argument(_)));
    }
}
