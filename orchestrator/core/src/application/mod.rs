// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod agent_pool;
pub mod agent_supervisor;
pub mod agent_task;
pub mod executor;
pub mod manager_task;
pub mod merger;
pub mod splitter;
pub mod task_handle;
pub mod worker_pool;
