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

//! Topology-aware placement of multi-chip AI accelerator jobs.
//!
//! The crate is a placement core meant to be driven by a host batch scheduler. The host hands it already
//! materialized node inventories and job snapshots; the core decides per-node feasibility, scores candidate nodes,
//! selects the exact chips to bind and keeps enough recovery state that restarted jobs land back on their old ranks.
//!
//! - [`scheduling`] holds the descriptors, the per-shape topology handlers, the vNPU subsystem and the dispatcher.
//! - [`rescheduling`] holds the pre-session reconciliation pass and its persisted record.

pub mod rescheduling;
pub mod scheduling;
