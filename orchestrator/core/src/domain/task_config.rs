// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Task Configuration Schema
//!
//! Task options are described by a static schema ([`TASK_OPTIONS`]): type,
//! bounds, default and an optional validator. Clients set options one at a
//! time; `null` resets an option to its default.
//!
//! Resolution happens in two phases. Phase one applies explicit overrides
//! and plain defaults; phase two fills computed defaults from the already
//! resolved siblings (`workload_samples` is derived from `samples` and
//! `agents_num`).
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Typed, validated task options

use crate::domain::workload::calculate_workload_samples;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Unknown option: {0}")]
    UnknownOption(String),

    #[error("Option '{name}' expects {expected}")]
    WrongType { name: String, expected: &'static str },

    #[error("Option '{name}' value {value} is below minimum {min}")]
    BelowMinimum { name: String, value: i64, min: i64 },

    #[error("Option '{name}' value {value} is above maximum {max}")]
    AboveMaximum { name: String, value: i64, max: i64 },

    #[error("Option '{name}' is invalid: {reason}")]
    Invalid { name: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OptionKind {
    Integer,
    Text,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(untagged)]
pub enum OptionDefault {
    Integer(i64),
    Text(&'static str),
    /// Derived from other resolved options
    Computed(&'static str),
}

/// Schema entry for a single task option
#[derive(Debug, Clone, Copy, Serialize)]
pub struct OptionSpec {
    pub name: &'static str,
    pub kind: OptionKind,
    pub description: &'static str,
    pub min: Option<i64>,
    pub max: Option<i64>,
    pub default: OptionDefault,
    #[serde(skip)]
    pub validator: Option<fn(&Value) -> Result<(), String>>,
}

fn validate_project(value: &Value) -> Result<(), String> {
    match value.as_str() {
        Some(s) if s.trim().is_empty() => Err("project path cannot be blank".to_string()),
        Some(_) => Ok(()),
        None => Err("project must be a string".to_string()),
    }
}

pub const TASK_OPTIONS: &[OptionSpec] = &[
    OptionSpec {
        name: "project",
        kind: OptionKind::Text,
        description: "File-map path of the scene to render",
        min: None,
        max: None,
        default: OptionDefault::Text(""),
        validator: Some(validate_project),
    },
    OptionSpec {
        name: "samples",
        kind: OptionKind::Integer,
        description: "Total number of samples to render",
        min: Some(1),
        max: Some(1_000_000),
        default: OptionDefault::Integer(128),
        validator: None,
    },
    OptionSpec {
        name: "seed",
        kind: OptionKind::Integer,
        description: "Base noise seed; workloads use seed + workload index",
        min: Some(0),
        max: Some(u32::MAX as i64),
        default: OptionDefault::Integer(0),
        validator: None,
    },
    OptionSpec {
        name: "frame",
        kind: OptionKind::Integer,
        description: "Frame to render",
        min: Some(-1_048_574),
        max: Some(1_048_574),
        default: OptionDefault::Integer(1),
        validator: None,
    },
    OptionSpec {
        name: "agents_num",
        kind: OptionKind::Integer,
        description: "Number of agents the manager distributes the task over",
        min: Some(1),
        max: Some(1000),
        default: OptionDefault::Integer(1),
        validator: None,
    },
    OptionSpec {
        name: "workload_samples",
        kind: OptionKind::Integer,
        description: "Samples per workload handed to one agent",
        min: Some(1),
        max: Some(1_000_000),
        default: OptionDefault::Computed("calculate_workload_samples(samples, agents_num)"),
        validator: None,
    },
];

pub fn option_spec(name: &str) -> Option<&'static OptionSpec> {
    TASK_OPTIONS.iter().find(|spec| spec.name == name)
}

/// Fully resolved task configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskConfig {
    pub project: String,
    pub samples: u32,
    pub seed: u32,
    pub frame: i32,
    pub agents_num: u32,
    pub workload_samples: u32,
}

impl TaskConfig {
    /// Express every resolved value as an explicit override
    pub fn to_overrides(&self) -> TaskConfigOverrides {
        TaskConfigOverrides {
            project: Some(self.project.clone()),
            samples: Some(self.samples),
            seed: Some(self.seed),
            frame: Some(self.frame),
            agents_num: Some(self.agents_num),
            workload_samples: Some(self.workload_samples),
        }
    }
}

/// Raw, user-supplied option values; `None` means "use the default"
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskConfigOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub samples: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frame: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agents_num: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workload_samples: Option<u32>,
}

impl TaskConfigOverrides {
    /// Set or reset (`None` / JSON `null`) a single option
    pub fn set(&mut self, name: &str, value: Option<Value>) -> Result<(), ConfigError> {
        let spec = option_spec(name).ok_or_else(|| ConfigError::UnknownOption(name.to_string()))?;
        let value = value.filter(|v| !v.is_null());

        if let Some(v) = &value {
            validate_value(spec, v)?;
        }

        match name {
            "project" => self.project = value.and_then(|v| v.as_str().map(str::to_string)),
            "samples" => self.samples = value.and_then(|v| v.as_i64()).map(|v| v as u32),
            "seed" => self.seed = value.and_then(|v| v.as_i64()).map(|v| v as u32),
            "frame" => self.frame = value.and_then(|v| v.as_i64()).map(|v| v as i32),
            "agents_num" => self.agents_num = value.and_then(|v| v.as_i64()).map(|v| v as u32),
            "workload_samples" => {
                self.workload_samples = value.and_then(|v| v.as_i64()).map(|v| v as u32)
            }
            _ => return Err(ConfigError::UnknownOption(name.to_string())),
        }
        Ok(())
    }

    /// Apply every key of a JSON object through [`Self::set`]
    pub fn apply(&mut self, values: &serde_json::Map<String, Value>) -> Result<(), ConfigError> {
        // Validate the whole batch before mutating anything
        let mut staged = self.clone();
        for (name, value) in values {
            staged.set(name, Some(value.clone()))?;
        }
        *self = staged;
        Ok(())
    }

    /// Two-phase resolution into a concrete [`TaskConfig`]
    pub fn resolve(&self) -> TaskConfig {
        let samples = self.samples.unwrap_or(default_int("samples") as u32);
        let agents_num = self.agents_num.unwrap_or(default_int("agents_num") as u32);
        let workload_samples = self
            .workload_samples
            .unwrap_or_else(|| calculate_workload_samples(samples, agents_num));

        TaskConfig {
            project: self.project.clone().unwrap_or_default(),
            samples,
            seed: self.seed.unwrap_or(default_int("seed") as u32),
            frame: self.frame.unwrap_or(default_int("frame") as i32),
            agents_num,
            workload_samples,
        }
    }
}

fn default_int(name: &str) -> i64 {
    match option_spec(name).map(|spec| spec.default) {
        Some(OptionDefault::Integer(v)) => v,
        _ => 0,
    }
}

fn validate_value(spec: &OptionSpec, value: &Value) -> Result<(), ConfigError> {
    match spec.kind {
        OptionKind::Integer => {
            let v = value.as_i64().ok_or_else(|| ConfigError::WrongType {
                name: spec.name.to_string(),
                expected: "an integer",
            })?;
            if let Some(min) = spec.min {
                if v < min {
                    return Err(ConfigError::BelowMinimum {
                        name: spec.name.to_string(),
                        value: v,
                        min,
                    });
                }
            }
            if let Some(max) = spec.max {
                if v > max {
                    return Err(ConfigError::AboveMaximum {
                        name: spec.name.to_string(),
                        value: v,
                        max,
                    });
                }
            }
        }
        OptionKind::Text => {
            if !value.is_string() {
                return Err(ConfigError::WrongType {
                    name: spec.name.to_string(),
                    expected: "a string",
                });
            }
        }
    }

    if let Some(validator) = spec.validator {
        validator(value).map_err(|reason| ConfigError::Invalid {
            name: spec.name.to_string(),
            reason,
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults_resolve() {
        let config = TaskConfigOverrides::default().resolve();
        assert_eq!(config.samples, 128);
        assert_eq!(config.agents_num, 1);
        assert_eq!(config.frame, 1);
        assert_eq!(config.workload_samples, calculate_workload_samples(128, 1));
    }

    #[test]
    fn test_computed_default_follows_siblings() {
        let mut overrides = TaskConfigOverrides::default();
        overrides.set("samples", Some(json!(250))).unwrap();
        overrides.set("agents_num", Some(json!(3))).unwrap();
        assert_eq!(overrides.resolve().workload_samples, 84);

        overrides.set("workload_samples", Some(json!(10))).unwrap();
        assert_eq!(overrides.resolve().workload_samples, 10);

        // Reset falls back to the computed value again
        overrides.set("workload_samples", None).unwrap();
        assert_eq!(overrides.resolve().workload_samples, 84);
    }

    #[test]
    fn test_bounds_and_types_are_enforced() {
        let mut overrides = TaskConfigOverrides::default();
        assert!(matches!(
            overrides.set("samples", Some(json!(0))),
            Err(ConfigError::BelowMinimum { .. })
        ));
        assert!(matches!(
            overrides.set("agents_num", Some(json!(5000))),
            Err(ConfigError::AboveMaximum { .. })
        ));
        assert!(matches!(
            overrides.set("samples", Some(json!("many"))),
            Err(ConfigError::WrongType { .. })
        ));
        assert!(matches!(
            overrides.set("project", Some(json!("  "))),
            Err(ConfigError::Invalid { .. })
        ));
        assert!(matches!(
            overrides.set("colour", Some(json!(1))),
            Err(ConfigError::UnknownOption(_))
        ));
        assert_eq!(overrides, TaskConfigOverrides::default());
    }

    #[test]
    fn test_apply_is_all_or_nothing() {
        let mut overrides = TaskConfigOverrides::default();
        let batch = json!({"samples": 64, "frame": "x"});
        assert!(overrides.apply(batch.as_object().unwrap()).is_err());
        assert_eq!(overrides.samples, None);

        let batch = json!({"samples": 64, "frame": 12, "seed": null});
        overrides.apply(batch.as_object().unwrap()).unwrap();
        assert_eq!(overrides.samples, Some(64));
        assert_eq!(overrides.frame, Some(12));
    }

    #[test]
    fn test_to_overrides_roundtrip() {
        let config = TaskConfigOverrides::default().resolve();
        assert_eq!(config.to_overrides().resolve(), config);
    }
}
