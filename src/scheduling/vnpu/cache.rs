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

//! Caches shared by the vNPU handler across the parallel node scoring of one scheduler.
//!
//! Both caches are owned by the scheduler state and handed to each session. Every method holds its lock only for
//! a map update; no placement computation runs under a lock.

use std::collections::{BTreeSet, HashMap};

use parking_lot::Mutex;

use crate::scheduling::resources::VResource;

/// Nodes on which a task was already forced onto a smaller template.
///
/// Keyed by task key (`namespace/job/task`).
#[derive(Debug, Default)]
pub struct DowngradeCache {
    entries: Mutex<HashMap<String, BTreeSet<String>>>,
}

impl DowngradeCache {
    pub fn record(&self, task_key: &str, node: &str) {
        self.entries
            .lock()
            .entry(task_key.to_string())
            .or_default()
            .insert(node.to_string());
    }

    pub fn contains(&self, task_key: &str, node: &str) -> bool {
        self.entries
            .lock()
            .get(task_key)
            .is_some_and(|nodes| nodes.contains(node))
    }

    pub fn nodes(&self, task_key: &str) -> Vec<String> {
        self.entries
            .lock()
            .get(task_key)
            .map(|nodes| nodes.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Drops every entry of the tasks of `job_key`.
    pub fn clear_job(&self, job_key: &str) {
        let prefix = format!("{job_key}/");
        self.entries.lock().retain(|task, _| !task.starts_with(&prefix));
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Tasks currently being scored against a node, per template, with the share each one would take.
#[derive(Debug, Default)]
pub struct ConcurrencyCache {
    in_flight: Mutex<HashMap<String, HashMap<String, HashMap<String, VResource>>>>,
}

impl ConcurrencyCache {
    /// Registers `task_id` as in flight on `(node, template)`. Registering the same task again replaces its share.
    pub fn register(&self, node: &str, template: &str, task_id: &str, share: VResource) {
        self.in_flight
            .lock()
            .entry(node.to_string())
            .or_default()
            .entry(template.to_string())
            .or_default()
            .insert(task_id.to_string(), share);
    }

    pub fn deregister(&self, node: &str, template: &str, task_id: &str) {
        let mut in_flight = self.in_flight.lock();
        if let Some(templates) = in_flight.get_mut(node) {
            if let Some(tasks) = templates.get_mut(template) {
                tasks.remove(task_id);
                if tasks.is_empty() {
                    templates.remove(template);
                }
            }
            if templates.is_empty() {
                in_flight.remove(node);
            }
        }
    }

    /// Removes `task_id` from every node and template.
    pub fn deregister_task(&self, task_id: &str) {
        self.retain_tasks(|task| task != task_id);
    }

    /// Removes every task of `job_key`.
    pub fn clear_job(&self, job_key: &str) {
        let prefix = format!("{job_key}/");
        self.retain_tasks(|task| !task.starts_with(&prefix));
    }

    fn retain_tasks(&self, keep: impl Fn(&str) -> bool) {
        let mut in_flight = self.in_flight.lock();
        for templates in in_flight.values_mut() {
            for tasks in templates.values_mut() {
                tasks.retain(|task, _| keep(task));
            }
            templates.retain(|_, tasks| !tasks.is_empty());
        }
        in_flight.retain(|_, templates| !templates.is_empty());
    }

    /// Capacity of `node` held by in-flight tasks other than `excluding`.
    ///
    /// A task registered under several templates of the same node is counted once, with its largest share.
    pub fn reserved_share(&self, node: &str, excluding: &str) -> VResource {
        let in_flight = self.in_flight.lock();
        let Some(templates) = in_flight.get(node) else {
            return VResource::ZERO;
        };
        let mut per_task: HashMap<&str, VResource> = HashMap::new();
        for tasks in templates.values() {
            for (task, share) in tasks.iter().filter(|(task, _)| task.as_str() != excluding) {
                let entry = per_task.entry(task.as_str()).or_default();
                if share.aicore > entry.aicore || (share.aicore == entry.aicore && share.aicpu > entry.aicpu) {
                    *entry = *share;
                }
            }
        }
        per_task
            .values()
            .fold(VResource::ZERO, |acc, share| acc.add(share))
    }

    /// Number of tasks other than `excluding` in flight on `(node, template)`.
    pub fn slots_in_flight(&self, node: &str, template: &str, excluding: &str) -> usize {
        self.in_flight
            .lock()
            .get(node)
            .and_then(|templates| templates.get(template))
            .map(|tasks| tasks.keys().filter(|t| t.as_str() != excluding).count())
            .unwrap_or(0)
    }

    pub fn is_registered(&self, node: &str, template: &str, task_id: &str) -> bool {
        self.in_flight
            .lock()
            .get(node)
            .and_then(|templates| templates.get(template))
            .is_some_and(|tasks| tasks.contains_key(task_id))
    }
}

/// The vNPU caches, shared by every session of one scheduler.
#[derive(Debug, Default)]
pub struct VnpuCaches {
    pub downgrade: DowngradeCache,
    pub concurrency: ConcurrencyCache,
}

impl VnpuCaches {
    /// Forgets everything recorded for the tasks of a finished job.
    pub fn on_job_finished(&self, job_key: &str) {
        self.downgrade.clear_job(job_key);
        self.concurrency.clear_job(job_key);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn test_downgrade_cache() {
        let cache = DowngradeCache::default();
        cache.record("ns/job/job-0", "n0");
        cache.record("ns/job/job-0", "n1");
        cache.record("ns/jobber/jobber-0", "n0");
        assert!(cache.contains("ns/job/job-0", "n1"));
        assert!(!cache.contains("ns/job/job-1", "n1"));
        assert_eq!(cache.nodes("ns/job/job-0"), vec!["n0", "n1"]);
        cache.clear_job("ns/job");
        assert!(!cache.contains("ns/job/job-0", "n0"));
        assert!(cache.contains("ns/jobber/jobber-0", "n0"));
    }

    #[test]
    fn test_same_task_scored_concurrently_is_reserved_once() {
        let cache = Arc::new(ConcurrencyCache::default());
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let cache = Arc::clone(&cache);
                thread::spawn(move || cache.register("n0", "vir04", "ns/j/t0", VResource::new(4, 4)))
            })
            .collect();
        for h in handles {
            h.join().expect("scoring thread");
        }
        assert_eq!(cache.reserved_share("n0", "ns/j/t1"), VResource::new(4, 4));
        assert_eq!(cache.reserved_share("n0", "ns/j/t0"), VResource::ZERO);
        assert_eq!(cache.slots_in_flight("n0", "vir04", "ns/j/t1"), 1);
    }

    #[test]
    fn test_task_under_two_templates_counts_largest_share() {
        let cache = ConcurrencyCache::default();
        cache.register("n0", "vir04", "ns/j/t0", VResource::new(4, 4));
        cache.register("n0", "vir04_3c", "ns/j/t0", VResource::new(4, 3));
        cache.register("n0", "vir02", "ns/j/t1", VResource::new(2, 2));
        assert_eq!(cache.reserved_share("n0", "other"), VResource::new(6, 6));
    }

    #[test]
    fn test_deregister() {
        let cache = ConcurrencyCache::default();
        cache.register("n0", "vir02", "ns/j/t0", VResource::new(2, 2));
        cache.register("n1", "vir02", "ns/j/t0", VResource::new(2, 2));
        cache.register("n1", "vir02", "ns/k/t0", VResource::new(2, 2));
        cache.deregister("n0", "vir02", "ns/j/t0");
        assert!(!cache.is_registered("n0", "vir02", "ns/j/t0"));
        cache.deregister_task("ns/j/t0");
        assert_eq!(cache.reserved_share("n1", ""), VResource::new(2, 2));

        let caches = VnpuCaches::default();
        caches.concurrency.register("n0", "vir01", "ns/k/t0", VResource::new(1, 1));
        caches.downgrade.record("ns/k/t0", "n0");
        caches.on_job_finished("ns/k");
        assert!(caches.downgrade.is_empty());
        assert_eq!(caches.concurrency.reserved_share("n0", ""), VResource::ZERO);
    }
}
