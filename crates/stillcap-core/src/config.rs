use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::ConfigError;

// MARK: - ExhaustionPolicy

/// What a session does when every attempt produced a suspect frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExhaustionPolicy {
    /// Accept the last frame anyway: guaranteed forward progress.
    #[default]
    AcceptBestEffort,
    /// End the session with `Failed(Exhausted)`.
    Fail,
}

// MARK: - ClassifierConfig

/// Sampling parameters of the occlusion heuristic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Half-width of the square sampling window around the centre, in px.
    #[serde(alias = "halfWindow")]
    pub half_window: u32,
    /// Distance between sampled pixels, in px.
    pub stride: u32,
    /// Summed absolute RGB difference below which a sample counts as uniform.
    #[serde(alias = "uniformThreshold")]
    pub uniform_threshold: u32,
    /// Fraction of uniform samples at which a frame is suspect.
    #[serde(alias = "suspectRatio")]
    pub suspect_ratio: f64,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            half_window: 50,
            stride: 10,
            uniform_threshold: 30,
            suspect_ratio: 0.8,
        }
    }
}

// MARK: - SessionConfig

/// Timing and retry policy of a capture session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    #[serde(alias = "settleDelayMs")]
    pub settle_delay_ms: u64,
    #[serde(alias = "retryIntervalMs")]
    pub retry_interval_ms: u64,
    #[serde(alias = "maxAttempts")]
    pub max_attempts: u32,
    /// Longest wait for a delivery once capturing, before aborting with `Timeout`.
    #[serde(alias = "frameTimeoutMs")]
    pub frame_timeout_ms: u64,
    #[serde(alias = "exhaustionPolicy")]
    pub exhaustion_policy: ExhaustionPolicy,
    /// Capacity of the worker → session delivery queue.
    #[serde(alias = "frameQueueDepth")]
    pub frame_queue_depth: usize,
    pub classifier: ClassifierConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            settle_delay_ms: 1_500,
            retry_interval_ms: 500,
            max_attempts: 3,
            frame_timeout_ms: 5_000,
            exhaustion_policy: ExhaustionPolicy::AcceptBestEffort,
            frame_queue_depth: 2,
            classifier: ClassifierConfig::default(),
        }
    }
}

impl SessionConfig {
    /// Load a JSON config file and validate it.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        debug!("Loaded session config from {}: {:?}", path.display(), config);
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: &str| Err(ConfigError::Invalid { reason: reason.to_owned() });
        if self.max_attempts == 0 {
            return invalid("max_attempts must be at least 1");
        }
        if self.frame_queue_depth == 0 {
            return invalid("frame_queue_depth must be at least 1");
        }
        if self.classifier.stride == 0 {
            return invalid("classifier.stride must be at least 1");
        }
        let ratio = self.classifier.suspect_ratio;
        if !(ratio > 0.0 && ratio <= 1.0) {
            return invalid("classifier.suspect_ratio must be in (0, 1]");
        }
        Ok(())
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn frame_timeout(&self) -> Duration {
        Duration::from_millis(self.frame_timeout_ms)
    }
}
