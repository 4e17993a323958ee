//! Engine configuration
//!
//! A single [`EngineConfig`] is handed to the engine, the pool manager and
//! every maintenance job. Every section carries serde defaults so a partial
//! JSON document only overrides what it names.
//!
//! Copyright (c) 2025 Mohammad Atashi <mohammadaliatashi@icloud.com>

use std::fs;
use std::io;
use std::path::Path;

use chrono::Duration;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::education::hybrid::HybridWeightSchedule;

/// Configuration loading and validation errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read configuration: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// How the next item is scored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionMode {
    /// Pure LinUCB score
    Bandit,
    /// Fisher information at the current ability
    Irt,
    /// Blend of both, weighted by the hybrid schedule
    Hybrid,
}

impl Default for SelectionMode {
    fn default() -> Self {
        SelectionMode::Bandit
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionConfig {
    /// Default exploration parameter; sessions may override it
    pub exploration_alpha: f64,
    /// Items at or above this exposure count are ineligible
    pub max_exposure: u64,
    pub mode: SelectionMode,
    pub hybrid: HybridWeightSchedule,
    /// Candidate count above which scoring runs on the rayon pool
    pub parallel_scoring_threshold: usize,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            exploration_alpha: 1.0,
            max_exposure: 200,
            mode: SelectionMode::default(),
            hybrid: HybridWeightSchedule::default(),
            parallel_scoring_threshold: 256,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AbilityConfig {
    /// Theta is clamped to [-theta_bound, theta_bound]
    pub theta_bound: f64,
    pub prior_mean: f64,
    pub prior_sd: f64,
    pub max_iterations: usize,
    pub tolerance: f64,
    /// Floor applied to discrimination when evaluating the model
    pub min_discrimination: f64,
    /// Responses considered for recent accuracy
    pub recent_window: usize,
    /// Ability below which a topic counts as weak
    pub weak_topic_theta: f64,
}

impl Default for AbilityConfig {
    fn default() -> Self {
        Self {
            theta_bound: 4.0,
            prior_mean: 0.0,
            prior_sd: 1.0,
            max_iterations: 30,
            tolerance: 1e-4,
            min_discrimination: 0.01,
            recent_window: 5,
            weak_topic_theta: -0.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    pub min_responses: u64,
    pub staleness_days: i64,
    /// Parameter change (logits) below which only the timestamp is refreshed
    pub materiality_threshold: f64,
    pub max_iterations: usize,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            min_responses: 30,
            staleness_days: 7,
            materiality_threshold: 0.1,
            max_iterations: 50,
        }
    }
}

impl CalibrationConfig {
    pub fn staleness(&self) -> Duration {
        Duration::days(self.staleness_days)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetirementConfig {
    pub min_responses: u64,
    /// Discrimination below this is negligible
    pub min_discrimination: f64,
    /// Largest plausible distance from the initial difficulty
    pub max_difficulty_drift: f64,
}

impl Default for RetirementConfig {
    fn default() -> Self {
        Self {
            min_responses: 30,
            min_discrimination: 0.1,
            max_difficulty_drift: 2.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExposureConfig {
    pub window_hours: i64,
}

impl Default for ExposureConfig {
    fn default() -> Self {
        Self { window_hours: 24 }
    }
}

impl ExposureConfig {
    pub fn window(&self) -> Duration {
        Duration::hours(self.window_hours)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub warning_active_items: usize,
    pub critical_active_items: usize,
    pub retirement_rate_warning: f64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            warning_active_items: 10,
            critical_active_items: 5,
            retirement_rate_warning: 0.2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GapAnalysisConfig {
    /// Ability minus difficulty above which a correct answer was too easy
    pub easy_correct_threshold: f64,
    /// Carried for callers; the analyzer does not use response times
    pub min_response_time_ms: u64,
}

impl Default for GapAnalysisConfig {
    fn default() -> Self {
        Self {
            easy_correct_threshold: 1.0,
            min_response_time_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    pub retention_days: i64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self { retention_days: 90 }
    }
}

impl CleanupConfig {
    pub fn retention(&self) -> Duration {
        Duration::days(self.retention_days)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BanditConfig {
    /// Optimistic write attempts before giving up on an arm
    pub max_cas_retries: usize,
    /// Updates between exact re-inversions of A; 0 disables
    pub inverse_refresh_interval: u64,
}

impl Default for BanditConfig {
    fn default() -> Self {
        Self {
            max_cas_retries: 8,
            inverse_refresh_interval: 64,
        }
    }
}

/// Complete engine configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub selection: SelectionConfig,
    pub ability: AbilityConfig,
    pub calibration: CalibrationConfig,
    pub retirement: RetirementConfig,
    pub exposure: ExposureConfig,
    pub health: HealthConfig,
    pub gap_analysis: GapAnalysisConfig,
    pub cleanup: CleanupConfig,
    pub bandit: BanditConfig,
}

impl EngineConfig {
    /// Parse and validate a JSON document
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON file
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if !(self.selection.exploration_alpha >= 0.0 && self.selection.exploration_alpha.is_finite()) {
            return invalid(format!(
                "exploration_alpha must be finite and non-negative, got {}",
                self.selection.exploration_alpha
            ));
        }
        if self.selection.max_exposure == 0 {
            return invalid("max_exposure must be positive".to_string());
        }
        if let Err(reason) = self.selection.hybrid.validate() {
            return invalid(format!("hybrid schedule: {}", reason));
        }
        if !(self.ability.theta_bound > 0.0 && self.ability.theta_bound <= 10.0) {
            return invalid(format!("theta_bound must be in (0, 10], got {}", self.ability.theta_bound));
        }
        if !(self.ability.prior_sd > 0.0) {
            return invalid("prior_sd must be positive".to_string());
        }
        if self.ability.max_iterations == 0 || self.calibration.max_iterations == 0 {
            return invalid("iteration limits must be positive".to_string());
        }
        if !(self.ability.min_discrimination > 0.0) {
            return invalid("min_discrimination floor must be positive".to_string());
        }
        if self.ability.recent_window == 0 {
            return invalid("recent_window must be positive".to_string());
        }
        if !(self.calibration.materiality_threshold >= 0.0) {
            return invalid("materiality_threshold must be non-negative".to_string());
        }
        if self.calibration.staleness_days < 0 || self.cleanup.retention_days < 0 || self.exposure.window_hours < 0 {
            return invalid("durations must be non-negative".to_string());
        }
        if self.health.critical_active_items > self.health.warning_active_items {
            return invalid(format!(
                "critical threshold {} exceeds warning threshold {}",
                self.health.critical_active_items, self.health.warning_active_items
            ));
        }
        if self.bandit.max_cas_retries == 0 {
            return invalid("max_cas_retries must be positive".to_string());
        }
        Ok(())
    }
}
