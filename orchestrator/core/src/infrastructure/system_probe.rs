// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Host metrics for `GET status` and `GET info`

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct HostLoad {
    pub load: [f64; 3],
    pub memory_total: u64,
    pub memory_available: u64,
    pub disk_free: u64,
}

/// Static process metadata
#[derive(Debug, Clone, Serialize)]
pub struct NodeInfo {
    pub name: String,
    pub role: String,
    pub version: String,
    pub hostname: String,
    pub os: String,
    pub arch: String,
    pub pid: u32,
    pub cpus: usize,
    pub started_at: DateTime<Utc>,
}

pub struct SystemProbe {
    disk_path: PathBuf,
    proc_root: PathBuf,
}

impl SystemProbe {
    pub fn new(disk_path: impl Into<PathBuf>) -> Self {
        Self {
            disk_path: disk_path.into(),
            proc_root: PathBuf::from("/proc"),
        }
    }

    #[cfg(test)]
    fn with_proc_root(mut self, root: &Path) -> Self {
        self.proc_root = root.to_path_buf();
        self
    }

    /// Missing sources read as zero; not every platform has `/proc`
    pub fn sample(&self) -> HostLoad {
        let load = std::fs::read_to_string(self.proc_root.join("loadavg"))
            .map(|s| parse_loadavg(&s))
            .unwrap_or_default();
        let (memory_total, memory_available) =
            std::fs::read_to_string(self.proc_root.join("meminfo"))
                .map(|s| parse_meminfo(&s))
                .unwrap_or_default();
        HostLoad {
            load,
            memory_total,
            memory_available,
            disk_free: fs2::available_space(&self.disk_path).unwrap_or(0),
        }
    }

    pub fn info(name: &str, role: &str, started_at: DateTime<Utc>) -> NodeInfo {
        NodeInfo {
            name: name.to_string(),
            role: role.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            hostname: hostname::get()
                .map(|h| h.to_string_lossy().into_owned())
                .unwrap_or_default(),
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            pid: std::process::id(),
            cpus: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            started_at,
        }
    }
}

fn parse_loadavg(content: &str) -> [f64; 3] {
    let mut load = [0.0; 3];
    for (slot, value) in load.iter_mut().zip(content.split_whitespace()) {
        *slot = value.parse().unwrap_or(0.0);
    }
    load
}

/// `(MemTotal, MemAvailable)` in bytes
fn parse_meminfo(content: &str) -> (u64, u64) {
    let field = |name: &str| {
        content
            .lines()
            .find_map(|l| l.strip_prefix(name))
            .and_then(|rest| rest.trim_start_matches(':').split_whitespace().next())
            .and_then(|kb| kb.parse::<u64>().ok())
            .map(|kb| kb * 1024)
            .unwrap_or(0)
    };
    (field("MemTotal"), field("MemAvailable"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parses_proc_files() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("loadavg"), "0.52 1.10 2.00 2/431 12345\n").unwrap();
        std::fs::write(
            dir.path().join("meminfo"),
            "MemTotal:       16318412 kB\nMemFree:         1213412 kB\nMemAvailable:    8123400 kB\n",
        )
        .unwrap();

        let sample = SystemProbe::new(dir.path()).with_proc_root(dir.path()).sample();
        assert_eq!(sample.load, [0.52, 1.10, 2.00]);
        assert_eq!(sample.memory_total, 16_318_412 * 1024);
        assert_eq!(sample.memory_available, 8_123_400 * 1024);
        assert!(sample.disk_free > 0);
    }

    #[test]
    fn test_missing_sources_are_zero() {
        let dir = TempDir::new().unwrap();
        let sample = SystemProbe::new(dir.path().join("gone"))
            .with_proc_root(dir.path())
            .sample();
        assert_eq!(sample, HostLoad::default());
    }
}
