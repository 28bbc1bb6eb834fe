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

//! Text convention used on the wire for chip lists.
//!
//! Nodes publish their free chips and tasks record their bound chips as a comma-joined list of
//! `<short>-<index>` entries, where `<short>` is the accelerator resource name without its vendor prefix
//! (`huawei.com/Ascend910` -> `Ascend910-0,Ascend910-4`). Inside the core chip sets are plain integers; this module
//! is the only place that converts.

use std::collections::BTreeSet;

use thiserror::Error;

use super::resources::ChipId;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AnnotationError {
    #[error("malformed chip entry {entry:?} for accelerator {accelerator}")]
    MalformedChip { accelerator: String, entry: String },
    #[error("chip {chip} listed twice for accelerator {accelerator}")]
    DuplicateChip { accelerator: String, chip: ChipId },
}

/// Accelerator name without its vendor prefix.
pub fn short_name(accelerator: &str) -> &str {
    match accelerator.rfind('/') {
        Some(pos) => &accelerator[pos + 1..],
        None => accelerator,
    }
}

/// Parses `"<short>-0,<short>-4"` into `[0, 4]`, keeping the published order.
pub fn parse_chip_list(accelerator: &str, text: &str) -> Result<Vec<ChipId>, AnnotationError> {
    let prefix = format!("{}-", short_name(accelerator));
    let mut seen = BTreeSet::new();
    let mut out = Vec::new();
    for entry in text.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let chip = entry
            .strip_prefix(prefix.as_str())
            .and_then(|idx| idx.parse::<ChipId>().ok())
            .ok_or_else(|| AnnotationError::MalformedChip {
                accelerator: accelerator.to_string(),
                entry: entry.to_string(),
            })?;
        if !seen.insert(chip) {
            return Err(AnnotationError::DuplicateChip {
                accelerator: accelerator.to_string(),
                chip,
            });
        }
        out.push(chip);
    }
    Ok(out)
}

pub fn format_chip_list(accelerator: &str, chips: &[ChipId]) -> String {
    let short = short_name(accelerator);
    chips
        .iter()
        .map(|c| format!("{short}-{c}"))
        .collect::<Vec<_>>()
        .join(",")
}
