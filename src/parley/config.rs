// SPDX-License-Identifier: MIT

//! Engine configuration
//!
//! Loaded from an optional YAML file, then overridden by `PARLEY_*`
//! environment variables.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::parley::error::ParleyError;
use crate::parley::flow::graph::FlowMetadata;

/// Runtime knobs shared by every session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Concurrent nodes per stage (flow metadata overrides)
    pub max_fan_out: usize,
    /// Node executions allowed in one `advance` call
    pub max_steps_per_advance: usize,
    /// Sessions with no input for this long are timed out; 0 disables
    pub idle_timeout_secs: u64,
    pub tool_timeout_secs: u64,
    pub model_timeout_secs: u64,
    /// Write a full snapshot every N deltas; 0 disables periodic snapshots
    pub snapshot_interval: u64,
    /// Directory for the file-backed session store
    pub store_dir: Option<PathBuf>,
    /// Message sent to the user when a session fails
    pub failure_message: String,
    pub extraction: ExtractionConfig,
    /// Webhook tools to register at startup
    pub tools: Vec<HttpToolConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_fan_out: 4,
            max_steps_per_advance: 64,
            idle_timeout_secs: 1800,
            tool_timeout_secs: 30,
            model_timeout_secs: 60,
            snapshot_interval: 20,
            store_dir: None,
            failure_message: "Sorry, something went wrong. Please try again later.".to_string(),
            extraction: ExtractionConfig::default(),
            tools: Vec::new(),
        }
    }
}

/// Structured extraction tuning
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionConfig {
    /// Minimum model confidence to accept an extraction; unchecked when unset
    pub min_confidence: Option<f64>,
    pub low_confidence: LowConfidencePolicy,
}

/// What to do with an extraction below `min_confidence`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LowConfidencePolicy {
    /// Count it as a failed attempt
    #[default]
    Retry,
    /// Keep the value anyway
    Accept,
}

/// A webhook tool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpToolConfig {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl EngineConfig {
    /// Load from an optional YAML file, then apply environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self, ParleyError> {
        let mut config = match path {
            Some(path) => {
                log::info!("Loading engine config from {}", path.display());
                Self::parse_yaml(&fs::read_to_string(path)?)?
            }
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn parse_yaml(content: &str) -> Result<Self, ParleyError> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Apply `PARLEY_*` overrides from a key lookup
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ParleyError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("PARLEY_MAX_FAN_OUT") {
            self.max_fan_out = parse_var("PARLEY_MAX_FAN_OUT", &v)?;
        }
        if let Some(v) = lookup("PARLEY_MAX_STEPS") {
            self.max_steps_per_advance = parse_var("PARLEY_MAX_STEPS", &v)?;
        }
        if let Some(v) = lookup("PARLEY_IDLE_TIMEOUT_SECS") {
            self.idle_timeout_secs = parse_var("PARLEY_IDLE_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = lookup("PARLEY_TOOL_TIMEOUT_SECS") {
            self.tool_timeout_secs = parse_var("PARLEY_TOOL_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = lookup("PARLEY_SNAPSHOT_INTERVAL") {
            self.snapshot_interval = parse_var("PARLEY_SNAPSHOT_INTERVAL", &v)?;
        }
        if let Some(v) = lookup("PARLEY_STORE_DIR") {
            self.store_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("PARLEY_MIN_CONFIDENCE") {
            self.extraction.min_confidence = Some(parse_var("PARLEY_MIN_CONFIDENCE", &v)?);
        }

        if self.max_fan_out == 0 {
            return Err(ParleyError::Config("max_fan_out must be at least 1".into()));
        }
        if self.max_steps_per_advance == 0 {
            return Err(ParleyError::Config(
                "max_steps_per_advance must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Effective fan-out limit for a flow
    pub fn fan_out_for(&self, metadata: &FlowMetadata) -> usize {
        metadata.max_fan_out.unwrap_or(self.max_fan_out).max(1)
    }

    /// Effective idle timeout for a flow, `None` when disabled
    pub fn idle_timeout_for(&self, metadata: &FlowMetadata) -> Option<chrono::Duration> {
        let secs = metadata.idle_timeout_secs.unwrap_or(self.idle_timeout_secs);
        // a bound too large to represent never expires
        (secs > 0)
            .then(|| i64::try_from(secs).ok().and_then(chrono::Duration::try_seconds))
            .flatten()
    }
}

fn parse_var<T: FromStr>(key: &str, value: &str) -> Result<T, ParleyError> {
    value
        .trim()
        .parse()
        .map_err(|_| ParleyError::Config(format!("{} has an invalid value '{}'", key, value)))
}
