// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Renderfarm core
//!
//! Everything a farm node runs: the content-addressed blob cache, the task
//! state machine and its executor, the agent pool a manager splits jobs
//! across, and the REST transport nodes talk to each other through.
//!
//! # Architecture
//!
//! - **Domain:** tasks, blobs, workloads, agent and provider contracts
//! - **Application:** executor, worker pool, agent supervision, split/merge
//! - **Infrastructure:** blob storage, persistence, renderer processes,
//!   HTTPS agent client, TLS material, host probes
//! - **Presentation:** REST routing, authentication and the HTTPS listener

pub mod domain;
pub mod application;
pub mod infrastructure;
pub mod presentation;
