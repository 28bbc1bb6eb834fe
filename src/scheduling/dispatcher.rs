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

//! Maps a job to the topology handler of its hardware shape.
//!
//! The key is the job's accelerator type plus an accelerator class: the `accelerator-type` label when present,
//! `vnpu` for virtual jobs without one, and `module` otherwise. A job carrying the superpod annotation always goes to
//! the superpod handler. Each dispatch builds a fresh handler bound to one job and one session.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use log::debug;
use thiserror::Error;

use super::config::SchedulerConfig;
use super::handler::{JobContext, TopologyHandler};
use super::resources::{JobDescriptor, ACCELERATOR_CLASS_LABEL};
use super::session::SessionContext;
use super::topology::{CardHandler, Module16Handler, ModuleHandler, SuperpodHandler};
use super::vnpu::VnpuHandler;

pub const DEFAULT_CLASS: &str = "module";
pub const SUPERPOD_CLASS: &str = "superpod";
pub const VNPU_CLASS: &str = "vnpu";

pub type HandlerFactory = fn(JobContext) -> Box<dyn TopologyHandler>;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerKey {
    pub accelerator: String,
    pub class: String,
}

impl HandlerKey {
    pub fn new(accelerator: impl Into<String>, class: impl Into<String>) -> Self {
        Self {
            accelerator: accelerator.into(),
            class: class.into(),
        }
    }
}

impl fmt::Display for HandlerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.accelerator, self.class)
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DispatchError {
    #[error("handler not supported: {0}")]
    NotSupported(HandlerKey),
    #[error("invalid argument: {0}")]
    Argument(String),
    #[error("a handler is already registered for {0}")]
    DuplicateHandler(HandlerKey),
}

/// Registry of handler factories keyed by `(accelerator, class)`.
#[derive(Debug, Default)]
pub struct Dispatcher {
    factories: BTreeMap<HandlerKey, HandlerFactory>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in shape: the ring and card shapes under the managed accelerator and the vNPU
    /// handler under the vNPU accelerator.
    pub fn with_default_handlers(config: &SchedulerConfig) -> Self {
        let managed = config.managed_accelerator.as_str();
        let entries: [(HandlerKey, HandlerFactory); 6] = [
            (HandlerKey::new(managed, "module-4"), ModuleHandler::boxed_module4),
            (HandlerKey::new(managed, DEFAULT_CLASS), ModuleHandler::boxed_module8),
            (HandlerKey::new(managed, "module-16"), Module16Handler::boxed),
            (HandlerKey::new(managed, "card"), CardHandler::boxed),
            (HandlerKey::new(managed, SUPERPOD_CLASS), SuperpodHandler::boxed),
            (HandlerKey::new(config.vnpu_accelerator.as_str(), VNPU_CLASS), VnpuHandler::boxed),
        ];
        Self {
            factories: entries.into_iter().collect(),
        }
    }

    pub fn register(&mut self, key: HandlerKey, factory: HandlerFactory) -> Result<(), DispatchError> {
        if self.factories.contains_key(&key) {
            return Err(DispatchError::DuplicateHandler(key));
        }
        self.factories.insert(key, factory);
        Ok(())
    }

    pub fn keys(&self) -> impl Iterator<Item = &HandlerKey> {
        self.factories.keys()
    }

    pub fn handler_key(job: &JobDescriptor) -> HandlerKey {
        let class = if job.is_superpod() {
            SUPERPOD_CLASS
        } else if let Some(label) = job.labels.get(ACCELERATOR_CLASS_LABEL) {
            label.as_str()
        } else if job.is_virtual() {
            VNPU_CLASS
        } else {
            DEFAULT_CLASS
        };
        HandlerKey::new(job.accelerator_type.as_str(), class)
    }

    /// Builds the handler for `job` in `session`.
    ///
    /// This is the only place job input is checked for completeness; handlers assume a well-formed job.
    pub fn dispatch(
        &self,
        job: &Arc<JobDescriptor>,
        session: &Arc<SessionContext>,
    ) -> Result<Box<dyn TopologyHandler>, DispatchError> {
        if job.name.is_empty() || job.accelerator_type.is_empty() {
            return Err(DispatchError::Argument(format!(
                "job {:?} has no name or accelerator type",
                job.key()
            )));
        }
        if job.tasks.is_empty() {
            return Err(DispatchError::Argument(format!("job {} has no tasks", job.key())));
        }
        let key = job.key();
        if let Some(task) = job.tasks.iter().find(|t| t.job != key) {
            return Err(DispatchError::Argument(format!(
                "task {} belongs to {}, not {}",
                task.name, task.job, key
            )));
        }
        let handler_key = Self::handler_key(job);
        let factory = self
            .factories
            .get(&handler_key)
            .ok_or_else(|| DispatchError::NotSupported(handler_key.clone()))?;
        debug!("dispatching job {} to handler {}", key, handler_key);
        Ok(factory(JobContext::new(Arc::clone(job), Arc::clone(session))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduling::resources::{TaskRequest, SUPERPOD_ANNOTATION};
    use crate::scheduling::session::RecoveryState;

    const NPU: &str = "huawei.com/Ascend910";

    fn session() -> Arc<SessionContext> {
        Arc::new(SessionContext::new(
            Arc::new(SchedulerConfig::default()),
            Default::default(),
            RecoveryState::default(),
        ))
    }

    fn dispatch(job: JobDescriptor) -> Result<&'static str, DispatchError> {
        let dispatcher = Dispatcher::with_default_handlers(&SchedulerConfig::default());
        dispatcher.dispatch(&Arc::new(job), &session()).map(|h| h.name())
    }

    fn job() -> JobDescriptor {
        JobDescriptor::new("default", "train", NPU).with_tasks(1, TaskRequest::Chips(2))
    }

    #[test]
    fn test_default_class_is_module() {
        assert_eq!(dispatch(job()), Ok("module"));
        assert_eq!(dispatch(job().with_label(ACCELERATOR_CLASS_LABEL, "card")), Ok("card"));
        assert_eq!(dispatch(job().with_label(ACCELERATOR_CLASS_LABEL, "module-16")), Ok("module-16"));
        assert_eq!(dispatch(job().with_label(ACCELERATOR_CLASS_LABEL, "module-4")), Ok("module-4"));
    }

    #[test]
    fn test_superpod_annotation_wins() {
        let j = job()
            .with_label(ACCELERATOR_CLASS_LABEL, "card")
            .with_annotation(SUPERPOD_ANNOTATION, "true");
        assert_eq!(dispatch(j), Ok("superpod"));
    }

    #[test]
    fn test_virtual_jobs_go_to_vnpu() {
        let j = JobDescriptor::new("default", "infer", "huawei.com/Ascend310P").with_tasks(
            1,
            TaskRequest::Virtual {
                aicore: 2,
                template: None,
            },
        );
        assert_eq!(dispatch(j), Ok("vnpu"));
    }

    #[test]
    fn test_unknown_key_not_supported() {
        let err = dispatch(job().with_label(ACCELERATOR_CLASS_LABEL, "module-32")).unwrap_err();
        assert_eq!(err, DispatchError::NotSupported(HandlerKey::new(NPU, "module-32")));
        assert!(err.to_string().starts_with("handler not supported"));
        let err = dispatch(JobDescriptor::new("default", "train", "vendor.com/X").with_tasks(1, TaskRequest::Chips(1)))
            .unwrap_err();
        assert!(matches!(err, DispatchError::NotSupported(_)));
    }

    #[test]
    fn test_incomplete_jobs_are_argument_errors() {
        let err = dispatch(JobDescriptor::new("default", "train", NPU)).unwrap_err();
        assert!(matches!(err, DispatchError::Argument(_)));
        let foreign = crate::scheduling::resources::TaskDescriptor::new("t", "other/job", TaskRequest::Chips(1));
        let err = dispatch(JobDescriptor::new("default", "train", NPU).with_task(foreign)).unwrap_err();
        assert!(matches!(err, DispatchError::Argument(_)));
    }

    #[test]
    fn test_duplicate_registration() {
        let mut dispatcher = Dispatcher::with_default_handlers(&SchedulerConfig::default());
        assert_eq!(dispatcher.keys().count(), 6);
        let err = dispatcher
            .register(HandlerKey::new(NPU, "card"), CardHandler::boxed)
            .unwrap_err();
        assert!(matches!(err, DispatchError::DuplicateHandler(_)));
        dispatcher
            .register(HandlerKey::new(NPU, "card-2"), CardHandler::boxed)
            .expect("new key");
    }
}
