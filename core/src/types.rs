//! Core data model: items, topics, ability estimates and response events
//!
//! Items start with neutral parameters (b = 0, a = 1, c = 0), are
//! recalibrated only once enough responses accumulate, and are retired rather
//! than deleted. Retirement is terminal: nothing in the engine reactivates a
//! retired item.
//!
//! Copyright (c) 2025 Mohammad Atashi <mohammadaliatashi@icloud.com>

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::education::irt::ItemParameters;

/// Question identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(pub u64);

/// Topic identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TopicId(pub u64);

/// Learner identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub u64);

/// Quiz attempt identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttemptId(pub Uuid);

impl AttemptId {
    pub fn new() -> Self {
        AttemptId(Uuid::new_v4())
    }
}

impl Default for AttemptId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "item#{}", self.0)
    }
}

impl fmt::Display for TopicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "topic#{}", self.0)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "user#{}", self.0)
    }
}

impl fmt::Display for AttemptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "attempt#{}", self.0)
    }
}

/// IRT model variant used for an item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelVariant {
    /// Rasch model: only difficulty is free
    #[serde(rename = "1PL")]
    OnePL,
    /// Difficulty and discrimination
    #[serde(rename = "2PL")]
    TwoPL,
    /// Difficulty, discrimination and guessing
    #[serde(rename = "3PL")]
    ThreePL,
}

impl Default for ModelVariant {
    fn default() -> Self {
        ModelVariant::ThreePL
    }
}

/// A question in the shared pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: ItemId,

    pub topic_id: TopicId,

    /// Difficulty (b), logit scale
    pub difficulty: f64,

    /// Discrimination (a). Recalibration may drive it to zero or below, which
    /// gets the item retired.
    pub discrimination: f64,

    /// Guessing floor (c); absent means 0
    pub guessing: Option<f64>,

    pub variant: ModelVariant,

    /// Difficulty the item was authored or first calibrated with
    pub initial_difficulty: f64,

    /// Responses accumulated since creation
    pub response_count: u64,

    pub last_calibrated: Option<DateTime<Utc>>,

    /// Selections inside the current exposure window
    pub exposure_count: u64,

    /// Start of the current exposure window (first selection after a reset)
    pub exposure_window_start: Option<DateTime<Utc>>,

    pub is_active: bool,

    /// Why the item was retired, if it was
    pub retirement_reason: Option<String>,
}

impl Item {
    /// New item with default parameters (b = 0, a = 1, c = 0)
    pub fn new(id: ItemId, topic_id: TopicId) -> Self {
        Self {
            id,
            topic_id,
            difficulty: 0.0,
            discrimination: 1.0,
            guessing: None,
            variant: ModelVariant::default(),
            initial_difficulty: 0.0,
            response_count: 0,
            last_calibrated: None,
            exposure_count: 0,
            exposure_window_start: None,
            is_active: true,
            retirement_reason: None,
        }
    }

    /// Builder-style difficulty, also recorded as the initial difficulty
    pub fn with_difficulty(mut self, difficulty: f64) -> Self {
        self.difficulty = difficulty;
        self.initial_difficulty = difficulty;
        self
    }

    pub fn with_discrimination(mut self, discrimination: f64) -> Self {
        self.discrimination = discrimination;
        self
    }

    pub fn with_guessing(mut self, guessing: f64) -> Self {
        self.guessing = Some(guessing);
        self
    }

    pub fn with_variant(mut self, variant: ModelVariant) -> Self {
        self.variant = variant;
        self
    }

    /// IRT parameters effective for this item's model variant
    pub fn irt_parameters(&self) -> ItemParameters {
        ItemParameters::for_variant(
            self.variant,
            self.discrimination,
            self.difficulty,
            self.guessing.unwrap_or(0.0),
        )
    }

    pub fn snapshot(&self) -> ParameterSnapshot {
        ParameterSnapshot {
            difficulty: self.difficulty,
            discrimination: self.discrimination,
            guessing: self.guessing.unwrap_or(0.0),
        }
    }
}

/// A topic with aggregate parameters over its active items
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Topic {
    pub id: TopicId,
    pub name: String,
    /// Mean difficulty of active items
    pub difficulty: f64,
    /// Mean discrimination of active items
    pub discrimination: f64,
}

impl Topic {
    pub fn new(id: TopicId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            difficulty: 0.0,
            discrimination: 1.0,
        }
    }
}

/// Learner ability on one topic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AbilityEstimate {
    pub user_id: UserId,
    pub topic_id: TopicId,
    /// Latent ability, logit scale
    pub theta: f64,
    /// Standard error of measurement, never negative
    pub sem: f64,
    /// Share of posterior precision contributed by the data, in [0, 1]
    pub confidence: f64,
    pub response_count: u64,
    pub last_estimated: DateTime<Utc>,
}

impl AbilityEstimate {
    /// Estimate before any response: the N(0, 1) prior
    pub fn prior(user_id: UserId, topic_id: TopicId, now: DateTime<Utc>) -> Self {
        Self {
            user_id,
            topic_id,
            theta: 0.0,
            sem: 1.0,
            confidence: 0.0,
            response_count: 0,
            last_estimated: now,
        }
    }
}

/// One observed answer. Immutable once logged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEvent {
    pub user_id: UserId,
    pub question_id: ItemId,
    pub topic_id: TopicId,
    pub attempt_id: Option<AttemptId>,
    pub is_correct: bool,
    pub response_time_ms: u64,
    /// Ability estimate on the item's topic just before this answer
    pub ability_at_time: f64,
    pub timestamp: DateTime<Utc>,
}

/// A quiz attempt. Completed attempts become eligible for cleanup once they
/// fall out of the retention window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attempt {
    pub id: AttemptId,
    pub user_id: UserId,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Item parameters at a point in time
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParameterSnapshot {
    pub difficulty: f64,
    pub discrimination: f64,
    pub guessing: f64,
}

/// Audit row written whenever recalibration materially changes an item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationRecord {
    pub id: Uuid,
    pub item_id: ItemId,
    pub previous: ParameterSnapshot,
    pub updated: ParameterSnapshot,
    pub response_count: usize,
    pub calibrated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_item_defaults() {
        let item = Item::new(ItemId(1), TopicId(2));
        assert_eq!(item.difficulty, 0.0);
        assert_eq!(item.discrimination, 1.0);
        assert_eq!(item.guessing, None);
        assert!(item.is_active);
        assert_eq!(item.exposure_count, 0);
        assert!(item.last_calibrated.is_none());
    }

    #[test]
    fn test_builder_records_initial_difficulty() {
        let item = Item::new(ItemId(1), TopicId(1)).with_difficulty(1.25);
        assert_eq!(item.initial_difficulty, 1.25);
    }

    #[test]
    fn test_model_variant_serializes_as_short_name() {
        let json = serde_json::to_string(&ModelVariant::TwoPL).unwrap();
        assert_eq!(json, "\"2PL\"");
    }
}
