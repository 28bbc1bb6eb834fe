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

//! Durable storage of the [`RescheduleCache`] between sessions.
//!
//! Writing the same record twice must leave the store unchanged, so both stores compare against what they hold and
//! skip identical writes.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use log::{debug, trace};
use parking_lot::Mutex;
use tempfile::NamedTempFile;
use thiserror::Error;

use super::cache::RescheduleCache;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Failed to persist temporary file: {0}")]
    Persist(#[from] tempfile::PersistError),
    #[error("malformed reschedule record: {0}")]
    Json(#[from] serde_json::Error),
}

pub trait RescheduleStore: Send + Sync {
    /// The last saved record, or `None` if nothing was saved yet.
    fn load(&self) -> Result<Option<RescheduleCache>, StoreError>;

    fn save(&self, cache: &RescheduleCache) -> Result<(), StoreError>;
}

/// Store kept in process memory, for embedding and tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    record: Mutex<Option<String>>,
    writes: Mutex<usize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of saves that changed the stored record.
    pub fn writes(&self) -> usize {
        *self.writes.lock()
    }
}

impl RescheduleStore for MemoryStore {
    fn load(&self) -> Result<Option<RescheduleCache>, StoreError> {
        match self.record.lock().as_deref() {
            Some(text) => Ok(Some(RescheduleCache::from_json(text)?)),
            None => Ok(None),
        }
    }

    fn save(&self, cache: &RescheduleCache) -> Result<(), StoreError> {
        let text = cache.to_json()?;
        let mut record = self.record.lock();
        if record.as_deref() == Some(text.as_str()) {
            trace!("reschedule record unchanged, skipping write");
            return Ok(());
        }
        *record = Some(text);
        *self.writes.lock() += 1;
        Ok(())
    }
}

/// Store backed by one JSON file, replaced atomically on every change.
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn directory(&self) -> &Path {
        match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        }
    }
}

impl RescheduleStore for FileStore {
    fn load(&self) -> Result<Option<RescheduleCache>, StoreError> {
        match fs::read_to_string(&self.path) {
            Ok(text) => Ok(Some(RescheduleCache::from_json(&text)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, cache: &RescheduleCache) -> Result<(), StoreError> {
        let text = cache.to_json()?;
        match fs::read_to_string(&self.path) {
            Ok(current) if current == text => {
                trace!("{} unchanged, skipping write", self.path.display());
                return Ok(());
            }
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let mut temp_file = NamedTempFile::new_in(self.directory())?;
        temp_file.write_all(text.as_bytes())?;
        // Ensure data is written to disk before persist
        temp_file.as_file().sync_all()?;
        temp_file.persist(&self.path)?;
        debug!("saved reschedule record to {}", self.path.display());
        Ok(())
    }
}
