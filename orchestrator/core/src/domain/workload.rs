// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Workload splitting
//!
//! A manager task hands its total sample count out in fixed-size slices
//! ("workloads"), one per agent at a time. The slice size is computed once
//! per task and every handed-out slice is tracked in a [`SampleLedger`] so
//! the farm never renders more samples than requested.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Slice sizing and sample accounting

use crate::domain::blob::BlobId;
use crate::domain::task_config::TaskConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Upper bound for a single slice before remainder spreading
pub const MAX_WORKLOAD_SAMPLES: u32 = 100;

/// Slices above this size are halved for responsiveness
pub const HALVING_THRESHOLD: u32 = 140;

fn div_ceil(a: u64, b: u64) -> u64 {
    if b == 0 {
        0
    } else {
        a.div_ceil(b)
    }
}

/// Compute the per-workload sample count for `total` samples over `agents`
///
/// The first pass caps slices at [`MAX_WORKLOAD_SAMPLES`]; any remainder
/// is spread evenly across the full batches, and a slice that ends up
/// larger than [`HALVING_THRESHOLD`] is halved.
pub fn calculate_workload_samples(total: u32, agents: u32) -> u32 {
    if total == 0 {
        return 0;
    }
    let total = total as u64;
    let agents = agents.max(1) as u64;

    let mut per = div_ceil(total, agents).min(MAX_WORKLOAD_SAMPLES as u64);
    let batches = total / (per * agents);
    if batches > 0 {
        per += div_ceil(total % (per * agents), batches * agents);
    }

    let per = if per > HALVING_THRESHOLD as u64 {
        div_ceil(per, 2)
    } else {
        per
    };
    per as u32
}

/// Sample accounting for one parent task
///
/// Callers serialize access (the split job keeps it behind a mutex), which
/// makes `acquire` atomic with respect to `acquired`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleLedger {
    total: u32,
    chunk: u32,
    acquired: u32,
    workloads_taken: u32,
}

impl SampleLedger {
    pub fn new(total: u32, chunk: u32) -> Self {
        Self::resume(total, chunk, 0)
    }

    /// Ledger for a resumed task; workload numbering continues at `offset`
    /// so sub-task names and seeds never repeat across executions.
    pub fn resume(total: u32, chunk: u32, offset: u32) -> Self {
        Self {
            total,
            chunk: chunk.max(1),
            acquired: 0,
            workloads_taken: offset,
        }
    }

    /// Take the next slice; returns `(samples, workload_index)`
    pub fn acquire(&mut self) -> Option<(u32, u32)> {
        let available = self.available();
        if available == 0 {
            return None;
        }
        let samples = self.chunk.min(available);
        self.acquired += samples;
        let index = self.workloads_taken;
        self.workloads_taken += 1;
        Some((samples, index))
    }

    /// Give back samples that were acquired but never rendered
    pub fn release(&mut self, samples: u32) {
        self.acquired = self.acquired.saturating_sub(samples);
    }

    pub fn available(&self) -> u32 {
        self.total.saturating_sub(self.acquired)
    }

    pub fn acquired(&self) -> u32 {
        self.acquired
    }

    pub fn total(&self) -> u32 {
        self.total
    }

    pub fn chunk(&self) -> u32 {
        self.chunk
    }

    pub fn workloads_taken(&self) -> u32 {
        self.workloads_taken
    }
}

/// An immutable slice of a parent task handed to exactly one agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workload {
    /// Name of the parent task on the manager
    pub parent: String,
    /// Sub-task name on the agent: `<parent>_<n>`
    pub name: String,
    pub config: TaskConfig,
    pub files: BTreeMap<String, BlobId>,
}

impl Workload {
    pub fn new(
        parent: &str,
        index: u32,
        samples: u32,
        parent_config: &TaskConfig,
        files: BTreeMap<String, BlobId>,
    ) -> Self {
        let mut config = parent_config.clone();
        config.samples = samples;
        config.seed = parent_config.seed.wrapping_add(index);
        config.agents_num = 1;
        config.workload_samples = samples;
        Self {
            parent: parent.to_string(),
            name: format!("{}_{}", parent, index),
            config,
            files,
        }
    }

    pub fn samples(&self) -> u32 {
        self.config.samples
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scenario_250_over_3() {
        assert_eq!(calculate_workload_samples(250, 3), 84);
    }

    #[test]
    fn test_caps_and_spreads_remainder() {
        // 1000 over 4: per=100, batches=2, remainder 200 → +25
        assert_eq!(calculate_workload_samples(1000, 4), 125);
        // 150 over 1: per=100, +50 → 150 → halved
        assert_eq!(calculate_workload_samples(150, 1), 75);
        // 140 over 1 stays at the threshold
        assert_eq!(calculate_workload_samples(140, 1), 140);
        assert_eq!(calculate_workload_samples(1, 8), 1);
    }

    #[test]
    fn test_bounds_over_grid() {
        for total in 1..=600u32 {
            for agents in 1..=12u32 {
                let v = calculate_workload_samples(total, agents);
                assert!(v >= 1, "total={} agents={}", total, agents);
                assert!(v <= HALVING_THRESHOLD, "total={} agents={} v={}", total, agents, v);
            }
        }
    }

    #[test]
    fn test_zero_agents_treated_as_one() {
        assert_eq!(
            calculate_workload_samples(50, 0),
            calculate_workload_samples(50, 1)
        );
    }

    #[test]
    fn test_ledger_never_exceeds_total() {
        let mut ledger = SampleLedger::new(250, calculate_workload_samples(250, 3));
        let mut chunks = Vec::new();
        while let Some((samples, _)) = ledger.acquire() {
            chunks.push(samples);
        }
        assert_eq!(chunks, vec![84, 84, 82]);
        assert_eq!(chunks.iter().sum::<u32>(), 250);
        assert_eq!(ledger.acquired(), 250);
        assert!(ledger.acquire().is_none());
    }

    #[test]
    fn test_ledger_release_makes_samples_acquirable_again() {
        let mut ledger = SampleLedger::new(100, 60);
        assert_eq!(ledger.acquire(), Some((60, 0)));
        assert_eq!(ledger.acquire(), Some((40, 1)));
        ledger.release(25);
        assert_eq!(ledger.available(), 25);
        assert_eq!(ledger.acquire(), Some((25, 2)));
        assert_eq!(ledger.workloads_taken(), 3);
    }

    #[test]
    fn test_workload_uniquifies_seed_and_name() {
        let config = TaskConfig {
            project: "scene.blend".to_string(),
            samples: 300,
            seed: 7,
            frame: 1,
            agents_num: 3,
            workload_samples: 100,
        };
        let workload = Workload::new("shot", 2, 100, &config, BTreeMap::new());
        assert_eq!(workload.name, "shot_2");
        assert_eq!(workload.config.seed, 9);
        assert_eq!(workload.samples(), 100);
        assert_eq!(workload.config.agents_num, 1);
    }
}
