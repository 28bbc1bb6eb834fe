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

//! Plugin configuration.
//!
//! The host passes plugin arguments as a flat string map; embedded hosts can also load the same settings from JSON.

use std::collections::HashMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::resources::VResource;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid value {value:?} for plugin argument {key}")]
    InvalidValue { key: String, value: String },
    #[error("invalid json configuration: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Accelerator whose jobs the reschedule pass manages.
    pub managed_accelerator: String,
    /// Accelerator sliced into virtual NPUs.
    pub vnpu_accelerator: String,
    /// Faulted tasks a job tolerates before it is restarted.
    pub fault_tolerance: u32,
    /// Restarts granted to a job before it is force deleted.
    pub default_retry_count: u32,
    /// Capacity of one physical chip of the vNPU accelerator.
    pub vnpu_chip_capacity: VResource,
    pub vnpu_chips_per_card: u32,
    pub allow_vnpu_downgrade: bool,
    /// Chips per node in a superpod.
    pub superpod_size: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            managed_accelerator: "huawei.com/Ascend910".to_string(),
            vnpu_accelerator: "huawei.com/Ascend310P".to_string(),
            fault_tolerance: 0,
            default_retry_count: 3,
            vnpu_chip_capacity: VResource::new(8, 7),
            vnpu_chips_per_card: 1,
            allow_vnpu_downgrade: true,
            superpod_size: 16,
        }
    }
}

fn parse_arg<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse::<T>().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

impl SchedulerConfig {
    /// Applies the host's plugin arguments on top of the defaults.
    pub fn from_arguments(arguments: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        for (key, value) in arguments {
            match key.as_str() {
                "managed-accelerator" => config.managed_accelerator = value.trim().to_string(),
                "vnpu-accelerator" => config.vnpu_accelerator = value.trim().to_string(),
                "fault-tolerance" => config.fault_tolerance = parse_arg(key, value)?,
                "retry-count" => config.default_retry_count = parse_arg(key, value)?,
                "vnpu-chip-aicore" => config.vnpu_chip_capacity.aicore = parse_arg(key, value)?,
                "vnpu-chip-aicpu" => config.vnpu_chip_capacity.aicpu = parse_arg(key, value)?,
                "vnpu-chips-per-card" => config.vnpu_chips_per_card = parse_arg(key, value)?,
                "vnpu-downgrade" => config.allow_vnpu_downgrade = parse_arg(key, value)?,
                "superpod-size" => config.superpod_size = parse_arg(key, value)?,
                _ => log::debug!("ignoring unknown plugin argument {key}={value}"),
            }
        }
        config.check()?;
        Ok(config)
    }

    pub fn from_json(data: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(data)?;
        config.check()?;
        Ok(config)
    }

    fn check(&self) -> Result<(), ConfigError> {
        if self.vnpu_chip_capacity.aicore == 0 {
            return Err(ConfigError::InvalidValue {
                key: "vnpu-chip-aicore".to_string(),
                value: "0".to_string(),
            });
        }
        if self.vnpu_chips_per_card == 0 {
            return Err(ConfigError::InvalidValue {
                key: "vnpu-chips-per-card".to_string(),
                value: "0".to_string(),
            });
        }
        if self.superpod_size < 2 || self.superpod_size % 2 != 0 {
            return Err(ConfigError::InvalidValue {
                key: "superpod-size".to_string(),
                value: self.superpod_size.to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults() {
        let config = SchedulerConfig::from_arguments(&HashMap::new()).expect("config");
        assert_eq!(config, SchedulerConfig::default());
        assert_eq!(config.vnpu_chip_capacity, VResource::new(8, 7));
    }

    #[test]
    fn test_arguments_override_defaults() {
        let config = SchedulerConfig::from_arguments(&args(&[
            ("fault-tolerance", "2"),
            ("retry-count", " 5 "),
            ("vnpu-downgrade", "false"),
            ("vnpu-chips-per-card", "2"),
            ("unrelated", "x"),
        ]))
        .expect("config");
        assert_eq!(config.fault_tolerance, 2);
        assert_eq!(config.default_retry_count, 5);
        assert!(!config.allow_vnpu_downgrade);
        assert_eq!(config.vnpu_chips_per_card, 2);
    }

    #[test]
    fn test_malformed_argument() {
        let err = SchedulerConfig::from_arguments(&args(&[("retry-count", "three")])).unwrap_err();
        match err {
            ConfigError::InvalidValue { key, .. } => assert_eq!(key, "retry-count"),
            _ => panic!("unexpected error variant: {err:?}"),
        }
    }

    #[test]
    fn test_odd_superpod_size_rejected() {
        assert!(SchedulerConfig::from_arguments(&args(&[("superpod-size", "15")])).is_err());
    }

    #[test]
    fn test_from_json_partial() {
        let config = SchedulerConfig::from_json(r#"{"fault_tolerance": 1}"#).expect("json");
        assert_eq!(config.fault_tolerance, 1);
        assert_eq!(config.default_retry_count, 3);
        assert!(SchedulerConfig::from_json("{").is_err());
    }
}
