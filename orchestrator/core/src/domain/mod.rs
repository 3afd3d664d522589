// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Domain
//!
//! Aggregates, value objects and the traits the outer layers implement.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Tasks, blobs, workloads, agents and node configuration

pub mod agent;
pub mod blob;
pub mod merger;
pub mod node_config;
pub mod path_sanitizer;
pub mod provider;
pub mod renderer;
pub mod repository;
pub mod task;
pub mod task_config;
pub mod workload;
