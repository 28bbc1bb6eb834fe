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

//! vNPU templates and the label rules that map a requested core count onto one of them.
//!
//! A job asks for a number of AI cores and qualifies the request with two labels:
//! `vnpu-dvpp` (whether the slice needs the video/image pre-processing unit) and `vnpu-level` (whether a slice may
//! give up AI CPUs). Every core count below one chip has exactly one label combination per template; any other
//! combination is rejected at admission.

use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

use crate::scheduling::resources::VResource;

pub const DVPP_LABEL: &str = "vnpu-dvpp";
pub const LEVEL_LABEL: &str = "vnpu-level";
/// Job label opting a job out of downgrades when set to `false`.
pub const DOWNGRADE_LABEL: &str = "vnpu-downgrade";

/// A named fractional slice of one chip.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct VnpuTemplate {
    pub name: &'static str,
    pub resource: VResource,
}

pub const TEMPLATES: &[VnpuTemplate] = &[
    VnpuTemplate {
        name: "vir01",
        resource: VResource::new(1, 1),
    },
    VnpuTemplate {
        name: "vir02",
        resource: VResource::new(2, 2),
    },
    VnpuTemplate {
        name: "vir02_1c",
        resource: VResource::new(2, 1),
    },
    VnpuTemplate {
        name: "vir04",
        resource: VResource::new(4, 4),
    },
    VnpuTemplate {
        name: "vir04_3c",
        resource: VResource::new(4, 3),
    },
    VnpuTemplate {
        name: "vir04_3c_ndvpp",
        resource: VResource::new(4, 3),
    },
    VnpuTemplate {
        name: "vir04_4c_dvpp",
        resource: VResource::new(4, 4),
    },
];

pub fn template(name: &str) -> Option<&'static VnpuTemplate> {
    TEMPLATES.iter().find(|t| t.name == name)
}

/// The smaller template a task falls back to when no chip has room for the one it asked for.
pub fn downgrade_target(name: &str) -> Option<&'static VnpuTemplate> {
    match name {
        "vir04" => template("vir04_3c"),
        "vir02" => template("vir02_1c"),
        _ => None,
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Dvpp {
    Yes,
    No,
    Null,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Level {
    Low,
    High,
}

impl fmt::Display for Dvpp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dvpp::Yes => write!(f, "yes"),
            Dvpp::No => write!(f, "no"),
            Dvpp::Null => write!(f, "null"),
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Level::Low => write!(f, "low"),
            Level::High => write!(f, "high"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TemplateError {
    #[error("unknown vNPU template {0}")]
    UnknownTemplate(String),
    #[error("invalid value {value:?} for label {key}")]
    InvalidLabel { key: String, value: String },
    #[error("{aicore} AI cores cannot be combined with vnpu-dvpp={dvpp} and vnpu-level={level}")]
    InvalidCombination { aicore: u32, dvpp: Dvpp, level: Level },
    #[error("{aicore} AI cores is neither a vNPU template size nor a multiple of a whole chip ({chip})")]
    UnsupportedCoreCount { aicore: u32, chip: u32 },
}

pub fn parse_dvpp(labels: &BTreeMap<String, String>) -> Result<Dvpp, TemplateError> {
    match labels.get(DVPP_LABEL).map(String::as_str) {
        None | Some("null") => Ok(Dvpp::Null),
        Some("yes") => Ok(Dvpp::Yes),
        Some("no") => Ok(Dvpp::No),
        Some(other) => Err(TemplateError::InvalidLabel {
            key: DVPP_LABEL.to_string(),
            value: other.to_string(),
        }),
    }
}

pub fn parse_level(labels: &BTreeMap<String, String>) -> Result<Level, TemplateError> {
    match labels.get(LEVEL_LABEL).map(String::as_str) {
        None | Some("low") => Ok(Level::Low),
        Some("high") => Ok(Level::High),
        Some(other) => Err(TemplateError::InvalidLabel {
            key: LEVEL_LABEL.to_string(),
            value: other.to_string(),
        }),
    }
}

/// What a virtual task resolves to once its labels are applied.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum TaskResource {
    Slice(&'static VnpuTemplate),
    /// A whole number of physical chips.
    WholeCards { chips: u32, resource: VResource },
}

impl TaskResource {
    pub fn resource(&self) -> VResource {
        match self {
            TaskResource::Slice(t) => t.resource,
            TaskResource::WholeCards { resource, .. } => *resource,
        }
    }
}

/// Maps a dynamic request of `aicore` cores to a template or to whole chips.
///
/// # Arguments
/// * `aicore` - Number of AI cores the task asks for.
/// * `labels` - Labels of the owning job.
/// * `capacity` - Capacity of one physical chip.
pub fn resolve_dynamic(
    aicore: u32,
    labels: &BTreeMap<String, String>,
    capacity: VResource,
) -> Result<TaskResource, TemplateError> {
    let dvpp = parse_dvpp(labels)?;
    let level = parse_level(labels)?;
    if aicore == 0 || capacity.aicore == 0 {
        return Err(TemplateError::UnsupportedCoreCount {
            aicore,
            chip: capacity.aicore,
        });
    }
    if aicore % capacity.aicore == 0 {
        if dvpp != Dvpp::Null {
            return Err(TemplateError::InvalidCombination { aicore, dvpp, level });
        }
        let chips = aicore / capacity.aicore;
        return Ok(TaskResource::WholeCards {
            chips,
            resource: capacity.multiply_by(chips),
        });
    }
    let name = match (aicore, dvpp, level) {
        (1, Dvpp::Null, _) => "vir01",
        (2, Dvpp::Null, Level::Low) => "vir02_1c",
        (2, Dvpp::Null, Level::High) => "vir02",
        (4, Dvpp::Yes, _) => "vir04_4c_dvpp",
        (4, Dvpp::No, _) => "vir04_3c_ndvpp",
        (4, Dvpp::Null, Level::Low) => "vir04_3c",
        (4, Dvpp::Null, Level::High) => "vir04",
        (1 | 2 | 4, _, _) => return Err(TemplateError::InvalidCombination { aicore, dvpp, level }),
        _ => {
            return Err(TemplateError::UnsupportedCoreCount {
                aicore,
                chip: capacity.aicore,
            })
        }
    };
    template(name)
        .map(TaskResource::Slice)
        .ok_or_else(|| TemplateError::UnknownTemplate(name.to_string()))
}

/// Resolves a virtual request: a named template for static jobs, the label rules otherwise.
pub fn resolve_request(
    aicore: u32,
    template_name: Option<&str>,
    labels: &BTreeMap<String, String>,
    capacity: VResource,
) -> Result<TaskResource, TemplateError> {
    match template_name {
        Some(name) => template(name)
            .map(TaskResource::Slice)
            .ok_or_else(|| TemplateError::UnknownTemplate(name.to_string())),
        None => resolve_dynamic(aicore, labels, capacity),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CAPACITY: VResource = VResource::new(8, 7);

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn slice_name(aicore: u32, pairs: &[(&str, &str)]) -> Result<&'static str, TemplateError> {
        match resolve_dynamic(aicore, &labels(pairs), CAPACITY)? {
            TaskResource::Slice(t) => Ok(t.name),
            other => panic!("unexpected resource: {other:?}"),
        }
    }

    #[test]
    fn test_four_core_label_table() {
        assert_eq!(slice_name(4, &[(DVPP_LABEL, "yes")]), Ok("vir04_4c_dvpp"));
        assert_eq!(slice_name(4, &[(DVPP_LABEL, "no")]), Ok("vir04_3c_ndvpp"));
        assert_eq!(slice_name(4, &[]), Ok("vir04_3c"));
        assert_eq!(slice_name(4, &[(LEVEL_LABEL, "high")]), Ok("vir04"));
    }

    #[test]
    fn test_small_slices_reject_dvpp() {
        assert_eq!(slice_name(1, &[]), Ok("vir01"));
        assert_eq!(slice_name(2, &[(LEVEL_LABEL, "high")]), Ok("vir02"));
        assert_eq!(slice_name(2, &[(LEVEL_LABEL, "low")]), Ok("vir02_1c"));
        let err = slice_name(2, &[(DVPP_LABEL, "yes")]).unwrap_err();
        assert!(matches!(err, TemplateError::InvalidCombination { aicore: 2, .. }));
        let err = slice_name(1, &[(DVPP_LABEL, "no")]).unwrap_err();
        assert!(matches!(err, TemplateError::InvalidCombination { aicore: 1, .. }));
    }

    #[test]
    fn test_whole_cards() {
        let r = resolve_dynamic(16, &labels(&[]), CAPACITY).expect("resolve");
        assert_eq!(
            r,
            TaskResource::WholeCards {
                chips: 2,
                resource: VResource::new(16, 14)
            }
        );
        let err = resolve_dynamic(8, &labels(&[(DVPP_LABEL, "yes")]), CAPACITY).unwrap_err();
        assert!(matches!(err, TemplateError::InvalidCombination { .. }));
    }

    #[test]
    fn test_unsupported_counts_and_labels() {
        assert!(matches!(
            resolve_dynamic(3, &labels(&[]), CAPACITY),
            Err(TemplateError::UnsupportedCoreCount { aicore: 3, chip: 8 })
        ));
        assert!(matches!(
            resolve_dynamic(0, &labels(&[]), CAPACITY),
            Err(TemplateError::UnsupportedCoreCount { .. })
        ));
        assert!(matches!(
            resolve_dynamic(4, &labels(&[(LEVEL_LABEL, "medium")]), CAPACITY),
            Err(TemplateError::InvalidLabel { .. })
        ));
    }

    #[test]
    fn test_static_template_lookup() {
        let r = resolve_request(4, Some("vir04_3c"), &labels(&[]), CAPACITY).expect("template");
        assert_eq!(r.resource(), VResource::new(4, 3));
        assert!(matches!(
            resolve_request(4, Some("vir05"), &labels(&[]), CAPACITY),
            Err(TemplateError::UnknownTemplate(_))
        ));
    }

    #[test]
    fn test_downgrade_targets() {
        assert_eq!(downgrade_target("vir04").map(|t| t.name), Some("vir04_3c"));
        assert_eq!(downgrade_target("vir02").map(|t| t.name), Some("vir02_1c"));
        assert_eq!(downgrade_target("vir04_3c"), None);
    }
}
