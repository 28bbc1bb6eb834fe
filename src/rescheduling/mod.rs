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

//! Pre-session reconciliation of faulted jobs.
//!
//! Before every scheduling session the [`Reconciler`] runs a fixed sequence:
//! 1. load the record kept by the previous session,
//! 2. force delete jobs that ran out of restarts,
//! 3. collect the running jobs of the managed accelerator,
//! 4. correlate their bound tasks with faulty nodes and chips,
//! 5. restart jobs whose faults exceed their tolerance,
//! 6. rebuild the rank slot map handed to placement.
//!
//! Only a failed restart in step 5 aborts the pass, and an invalid-argument failure in step 2. Everything else is
//! logged and skipped. [`Reconciler::pre_stop`] persists the record at the end of the session.

pub mod cache;
pub mod store;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use log::{debug, info, warn};
use thiserror::Error;

use crate::scheduling::config::SchedulerConfig;
use crate::scheduling::resources::{
    AllocationDecision, JobDescriptor, JobStatus, NodeTopology, RankSlot, FAULT_TOLERANCE_LABEL,
};
use crate::scheduling::session::RecoveryState;
pub use cache::{FaultJob, FaultNode, RescheduleCache};
pub use store::{FileStore, MemoryStore, RescheduleStore, StoreError};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ControllerError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("controller unavailable: {0}")]
    Unavailable(String),
}

/// Restarts and deletes jobs on behalf of the reconciler.
#[cfg_attr(test, mockall::automock)]
pub trait JobController: Send + Sync {
    fn force_delete(&self, job: &JobDescriptor) -> Result<(), ControllerError>;

    fn restart(&self, job: &JobDescriptor) -> Result<(), ControllerError>;
}

#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("restarting faulted job {job} failed: {source}")]
    Fatal {
        job: String,
        #[source]
        source: ControllerError,
    },
    #[error("force deleting job {job} failed: {source}")]
    InvalidArgument {
        job: String,
        #[source]
        source: ControllerError,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// What the host knows at the start of a session.
#[derive(Debug, Clone, Copy)]
pub struct SessionSnapshot<'a> {
    pub jobs: &'a [JobDescriptor],
    pub nodes: &'a [NodeTopology],
    /// Nodes the host reports unhealthy as a whole.
    pub unhealthy_nodes: &'a BTreeSet<String>,
}

pub struct Reconciler {
    config: Arc<SchedulerConfig>,
    store: Box<dyn RescheduleStore>,
    controller: Box<dyn JobController>,
    cache: RescheduleCache,
}

impl Reconciler {
    pub fn new(
        config: Arc<SchedulerConfig>,
        store: Box<dyn RescheduleStore>,
        controller: Box<dyn JobController>,
    ) -> Self {
        Self {
            config,
            store,
            controller,
            cache: RescheduleCache::default(),
        }
    }

    pub fn cache(&self) -> &RescheduleCache {
        &self.cache
    }

    /// Runs the reconciliation sequence and returns the rank slots placement should honor.
    pub fn pre_session(&mut self, snapshot: &SessionSnapshot<'_>) -> Result<RecoveryState, ReconcileError> {
        self.load_record();
        let deleted = self.force_delete_marked(snapshot)?;
        let running = self.running_jobs(snapshot, &deleted);
        self.correlate_faults(snapshot, &running);
        self.restart_faulted(&running)?;
        self.rebuild_rank_slots(snapshot, &running);
        Ok(self.cache.recovery_state())
    }

    /// Persists the record, dropping jobs that are gone or finished.
    pub fn pre_stop(&mut self, jobs: &[JobDescriptor]) -> Result<(), ReconcileError> {
        let live: BTreeSet<String> = jobs
            .iter()
            .filter(|j| !matches!(j.status, JobStatus::Completed | JobStatus::Failed))
            .map(JobDescriptor::key)
            .collect();
        self.cache.retain_jobs(&live);
        self.store.save(&self.cache)?;
        Ok(())
    }

    // Step 1
    fn load_record(&mut self) {
        match self.store.load() {
            Ok(Some(record)) => self.cache = record,
            Ok(None) => debug!("no reschedule record stored yet"),
            Err(e) => warn!("keeping in-memory reschedule record: {}", e),
        }
    }

    // Step 2
    fn force_delete_marked(&mut self, snapshot: &SessionSnapshot<'_>) -> Result<BTreeSet<String>, ReconcileError> {
        let mut deleted = BTreeSet::new();
        let marked: Vec<String> = self
            .cache
            .fault_jobs
            .iter()
            .filter(|(_, fault)| fault.needs_force_delete)
            .map(|(job, _)| job.clone())
            .collect();
        for key in marked {
            let Some(job) = snapshot.jobs.iter().find(|j| j.key() == key) else {
                debug!("job {} marked for deletion is already gone", key);
                self.cache.forget_job(&key);
                continue;
            };
            match self.controller.force_delete(job) {
                Ok(()) => {
                    info!("force deleted job {} after running out of restarts", key);
                    self.cache.forget_job(&key);
                    deleted.insert(key);
                }
                Err(source @ ControllerError::InvalidArgument(_)) => {
                    return Err(ReconcileError::InvalidArgument { job: key, source });
                }
                Err(e) => warn!("force delete of job {} failed, retrying next session: {}", key, e),
            }
        }
        Ok(deleted)
    }

    // Step 3
    fn running_jobs<'a>(&self, snapshot: &SessionSnapshot<'a>, deleted: &BTreeSet<String>) -> Vec<&'a JobDescriptor> {
        snapshot
            .jobs
            .iter()
            .filter(|j| j.is_running() && j.accelerator_type == self.config.managed_accelerator)
            .filter(|j| !deleted.contains(&j.key()))
            .collect()
    }

    // Step 4
    fn correlate_faults(&mut self, snapshot: &SessionSnapshot<'_>, running: &[&JobDescriptor]) {
        let accelerator = self.config.managed_accelerator.as_str();
        self.cache.fault_nodes = snapshot
            .nodes
            .iter()
            .filter_map(|node| {
                let fault = FaultNode {
                    whole_node: snapshot.unhealthy_nodes.contains(&node.name),
                    chips: node.unhealthy_chips(accelerator).cloned().unwrap_or_default(),
                };
                (fault.whole_node || !fault.chips.is_empty()).then(|| (node.name.clone(), fault))
            })
            .collect();
        for name in snapshot.unhealthy_nodes {
            self.cache
                .fault_nodes
                .entry(name.clone())
                .or_insert_with(|| FaultNode {
                    whole_node: true,
                    chips: BTreeSet::new(),
                });
        }

        for job in running {
            let key = job.key();
            let faulted: BTreeSet<String> = job
                .tasks
                .iter()
                .filter(|task| match &task.allocation {
                    Some(AllocationDecision::Chips { node, chips, .. }) => self
                        .cache
                        .fault_nodes
                        .get(node)
                        .is_some_and(|fault| fault.affects(chips)),
                    Some(other) => snapshot.unhealthy_nodes.contains(other.node()),
                    None => false,
                })
                .map(|task| task.name.clone())
                .collect();
            let default_retries = self.config.default_retry_count;
            self.cache.retry_remaining.entry(key.clone()).or_insert(default_retries);

            let fully_bound = job.tasks.iter().all(|t| t.allocation.is_some());
            if faulted.is_empty() {
                let settled = self
                    .cache
                    .fault_jobs
                    .get(&key)
                    .is_some_and(|f| !f.needs_force_delete && (!f.restarting || fully_bound));
                if settled {
                    debug!("job {} has no faulted tasks left", key);
                    self.cache.fault_jobs.remove(&key);
                }
                continue;
            }
            debug!("job {} has faulted tasks {:?}", key, faulted);
            let entry = self.cache.fault_jobs.entry(key).or_default();
            entry.fault_count = faulted.len() as u32;
            entry.faulted_tasks = faulted;
        }
    }

    fn tolerance(&self, job: &JobDescriptor) -> u32 {
        match job.labels.get(FAULT_TOLERANCE_LABEL) {
            Some(value) => value.trim().parse().unwrap_or_else(|_| {
                warn!(
                    "job {}: ignoring invalid {} label {:?}",
                    job.key(),
                    FAULT_TOLERANCE_LABEL,
                    value
                );
                self.config.fault_tolerance
            }),
            None => self.config.fault_tolerance,
        }
    }

    // Step 5
    fn restart_faulted(&mut self, running: &[&JobDescriptor]) -> Result<(), ReconcileError> {
        for job in running {
            let key = job.key();
            let tolerance = self.tolerance(job);
            let Some(fault) = self.cache.fault_jobs.get(&key) else {
                continue;
            };
            if fault.restarting || fault.needs_force_delete || fault.fault_count <= tolerance {
                continue;
            }
            let remaining = self.cache.retry_remaining.get(&key).copied().unwrap_or(0);
            if remaining == 0 {
                warn!("job {} is out of restarts, marking it for deletion", key);
                if let Some(fault) = self.cache.fault_jobs.get_mut(&key) {
                    fault.needs_force_delete = true;
                }
                continue;
            }
            self.controller
                .restart(job)
                .map_err(|source| ReconcileError::Fatal {
                    job: key.clone(),
                    source,
                })?;
            info!("restarted job {} ({} restarts left)", key, remaining - 1);
            self.cache.retry_remaining.insert(key.clone(), remaining - 1);
            if let Some(fault) = self.cache.fault_jobs.get_mut(&key) {
                fault.restarting = true;
            }
        }
        Ok(())
    }

    // Step 6
    fn rebuild_rank_slots(&mut self, snapshot: &SessionSnapshot<'_>, running: &[&JobDescriptor]) {
        let restarting: BTreeSet<&str> = self
            .cache
            .fault_jobs
            .iter()
            .filter(|(_, f)| f.restarting)
            .map(|(job, _)| job.as_str())
            .collect();
        let mut rebuilt: BTreeMap<String, BTreeMap<u32, RankSlot>> = BTreeMap::new();

        for job in snapshot.jobs {
            let key = job.key();
            let is_running = running.iter().any(|r| r.key() == key);
            let is_restarting = restarting.contains(key.as_str());
            if !is_running && !is_restarting {
                continue;
            }
            let mut slots = BTreeMap::new();
            if is_restarting {
                if let Some(previous) = self.cache.rank_slots.get(&key) {
                    for (rank, slot) in previous {
                        if self.cache.slot_is_faulty(slot) {
                            debug!("job {} rank {} loses its slot on faulty node {}", key, rank, slot.node);
                        } else {
                            slots.insert(*rank, slot.clone());
                        }
                    }
                }
            }
            for task in &job.tasks {
                let (Some(rank), Some(decision)) = (task.rank, &task.allocation) else {
                    continue;
                };
                if let Some(slot) = RankSlot::from_decision(decision) {
                    if !self.cache.slot_is_faulty(&slot) {
                        slots.insert(rank, slot);
                    }
                }
            }
            if !slots.is_empty() {
                rebuilt.insert(key, slots);
            }
        }
        self.cache.rank_slots = rebuilt;
    }
}
