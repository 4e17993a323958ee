//! Feature extraction for the contextual bandit
//!
//! Builds normalized vectors from IRT outputs:
//!
//! | Space         | Dim | Components                                                          |
//! |---------------|-----|---------------------------------------------------------------------|
//! | `UserState`   | 6   | θ, SEM, confidence, response count, recent accuracy, session progress |
//! | `Item`        | 4   | difficulty, discrimination, guessing, exposure                      |
//! | `Interaction` | 4   | \|θ − b\|, P(θ), I(θ), topic-weakness flag                          |
//! | `Combined`    | 14  | concatenation of the three above                                    |
//!
//! Every component must land in [0, 1]. A value outside that range (or a NaN)
//! is a [`ValidationError`], never silently clamped: a corrupt feature would
//! poison the bandit's linear model for every learner sharing the arm.
//!
//! Copyright (c) 2025 Mohammad Atashi <mohammadaliatashi@icloud.com>

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::AbilityConfig;
use crate::education::irt::IrtModel;
use crate::error::ValidationError;
use crate::linalg::Vector;
use crate::types::Item;

pub const USER_STATE_DIM: usize = 6;
pub const ITEM_DIM: usize = 4;
pub const INTERACTION_DIM: usize = 4;
pub const COMBINED_DIM: usize = USER_STATE_DIM + ITEM_DIM + INTERACTION_DIM;

/// Half-saturation constant for the response-count feature
const RESPONSE_COUNT_SCALE: f64 = 20.0;

/// Half-saturation constant for the exposure feature
const EXPOSURE_SCALE: f64 = 50.0;

/// Half-saturation constant for open-ended session progress
const OPEN_SESSION_SCALE: f64 = 10.0;

/// A family of feature vectors with its own bandit state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureSpace {
    UserState,
    Item,
    Interaction,
    Combined,
}

impl FeatureSpace {
    pub fn dimension(&self) -> usize {
        match self {
            FeatureSpace::UserState => USER_STATE_DIM,
            FeatureSpace::Item => ITEM_DIM,
            FeatureSpace::Interaction => INTERACTION_DIM,
            FeatureSpace::Combined => COMBINED_DIM,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            FeatureSpace::UserState => "user_state",
            FeatureSpace::Item => "item",
            FeatureSpace::Interaction => "interaction",
            FeatureSpace::Combined => "combined",
        }
    }
}

impl fmt::Display for FeatureSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Learner state on the topic being scored
#[derive(Debug, Clone, PartialEq)]
pub struct LearnerContext<'a> {
    pub theta: f64,
    pub sem: f64,
    pub confidence: f64,
    pub response_count: u64,
    /// Session outcomes, oldest first
    pub recent_outcomes: &'a [bool],
    pub answered_in_session: u32,
    /// Planned session length; `None` for open-ended sessions
    pub session_length: Option<u32>,
}

/// All vectors extracted for one (learner, item) pair
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureSet {
    pub user_state: Vector,
    pub item: Vector,
    pub interaction: Vector,
}

impl FeatureSet {
    pub fn for_space(&self, space: FeatureSpace) -> Vector {
        match space {
            FeatureSpace::UserState => self.user_state.clone(),
            FeatureSpace::Item => self.item.clone(),
            FeatureSpace::Interaction => self.interaction.clone(),
            FeatureSpace::Combined => {
                let values: Vec<f64> = self
                    .user_state
                    .iter()
                    .chain(self.item.iter())
                    .chain(self.interaction.iter())
                    .copied()
                    .collect();
                Vector::from_vec(values)
            }
        }
    }
}

/// Reject anything outside [0, 1], including NaN
fn unit(feature: &'static str, value: f64) -> Result<f64, ValidationError> {
    if (0.0..=1.0).contains(&value) {
        Ok(value)
    } else {
        Err(ValidationError::OutOfRange { feature, value })
    }
}

/// `v / (v + scale)` for a non-negative `v`
fn saturating(feature: &'static str, value: f64, scale: f64) -> Result<f64, ValidationError> {
    if !(value >= 0.0) || !value.is_finite() {
        return Err(ValidationError::OutOfRange { feature, value });
    }
    unit(feature, value / (value + scale))
}

/// Logistic map of an unbounded logit location onto [0, 1]
fn logistic(feature: &'static str, value: f64) -> Result<f64, ValidationError> {
    if !value.is_finite() {
        return Err(ValidationError::OutOfRange { feature, value });
    }
    unit(feature, 1.0 / (1.0 + (-value).exp()))
}

/// Builds normalized feature vectors from IRT outputs
#[derive(Debug, Clone)]
pub struct FeatureExtractor {
    model: IrtModel,
    recent_window: usize,
    weak_topic_theta: f64,
}

impl Default for FeatureExtractor {
    fn default() -> Self {
        Self::new(&AbilityConfig::default())
    }
}

impl FeatureExtractor {
    pub fn new(config: &AbilityConfig) -> Self {
        Self {
            model: IrtModel::from_config(config),
            recent_window: config.recent_window,
            weak_topic_theta: config.weak_topic_theta,
        }
    }

    pub fn model(&self) -> &IrtModel {
        &self.model
    }

    fn normalize_location(&self, feature: &'static str, value: f64) -> Result<f64, ValidationError> {
        let bound = self.model.theta_bound;
        unit(feature, (value + bound) / (2.0 * bound))
    }

    /// Fraction correct over the last `recent_window` outcomes, 0.5 when empty
    pub fn recent_accuracy(&self, outcomes: &[bool]) -> f64 {
        let start = outcomes.len().saturating_sub(self.recent_window);
        let window = &outcomes[start..];
        if window.is_empty() {
            return 0.5;
        }
        window.iter().filter(|c| **c).count() as f64 / window.len() as f64
    }

    pub fn user_state(&self, learner: &LearnerContext<'_>) -> Result<Vector, ValidationError> {
        let progress = match learner.session_length {
            Some(0) | None => saturating(
                "session_progress",
                learner.answered_in_session as f64,
                OPEN_SESSION_SCALE,
            )?,
            Some(length) => unit(
                "session_progress",
                learner.answered_in_session as f64 / length as f64,
            )?,
        };

        Ok(Vector::from_vec(vec![
            self.normalize_location("theta", learner.theta)?,
            saturating("sem", learner.sem, 1.0)?,
            unit("confidence", learner.confidence)?,
            saturating("response_count", learner.response_count as f64, RESPONSE_COUNT_SCALE)?,
            unit("recent_accuracy", self.recent_accuracy(learner.recent_outcomes))?,
            progress,
        ]))
    }

    pub fn item(&self, item: &Item) -> Result<Vector, ValidationError> {
        Ok(Vector::from_vec(vec![
            logistic("difficulty", item.difficulty)?,
            saturating("discrimination", item.discrimination, 1.0)?,
            unit("guessing", item.guessing.unwrap_or(0.0))?,
            saturating("exposure", item.exposure_count as f64, EXPOSURE_SCALE)?,
        ]))
    }

    /// Interaction between a learner's topic ability and one item
    pub fn interaction(&self, theta: f64, item: &Item) -> Result<Vector, ValidationError> {
        let params = item.irt_parameters();
        let distance = (theta - params.difficulty).abs();
        let probability = self.model.probability(&params, theta);
        let information = self.model.information(&params, theta);
        let weak = if theta < self.weak_topic_theta { 1.0 } else { 0.0 };

        Ok(Vector::from_vec(vec![
            saturating("ability_distance", distance, 1.0)?,
            unit("probability", probability)?,
            saturating("information", information, 1.0)?,
            weak,
        ]))
    }

    pub fn extract(&self, learner: &LearnerContext<'_>, item: &Item) -> Result<FeatureSet, ValidationError> {
        Ok(FeatureSet {
            user_state: self.user_state(learner)?,
            item: self.item(item)?,
            interaction: self.interaction(learner.theta, item)?,
        })
    }
}
