// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod agent_client;
pub mod blob_cache;
pub mod blob_reaper;
pub mod command_merger;
pub mod log_buffer;
pub mod renderer;
pub mod repositories;
pub mod static_provider;
pub mod system_probe;
pub mod tls;
