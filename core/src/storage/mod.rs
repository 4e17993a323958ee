//! Persistence collaborators
//!
//! The engine never talks to a database directly. Everything durable goes
//! through the traits below so that a relational backend, a key-value store or
//! the in-memory maps in [`memory`] can be swapped in without touching the
//! request path.
//!
//! All traits are `Send + Sync`: one set of stores is shared by every request
//! thread and by the maintenance jobs.
//!
//! Copyright (c) 2025 Mohammad Atashi <mohammadaliatashi@icloud.com>

pub mod memory;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::education::bandit::{ArmKey, ArmState};
use crate::error::StoreError;
use crate::types::{
    AbilityEstimate, Attempt, AttemptId, CalibrationRecord, Item, ItemId, ResponseEvent, Topic,
    TopicId, UserId,
};

/// Store result type
pub type StoreResult<T> = Result<T, StoreError>;

/// New parameters written by recalibration
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParameterUpdate {
    pub difficulty: f64,
    pub discrimination: f64,
    pub guessing: Option<f64>,
    pub calibrated_at: DateTime<Utc>,
}

/// Questions and topics
pub trait ItemStore: Send + Sync {
    /// Active items of a topic, ordered by id
    fn get_active_items_by_topic(&self, topic_id: TopicId) -> StoreResult<Vec<Item>>;

    fn get_item(&self, id: ItemId) -> StoreResult<Item>;

    /// Every item, active or retired, ordered by id
    fn list_items(&self) -> StoreResult<Vec<Item>>;

    fn put_item(&self, item: Item) -> StoreResult<()>;

    fn update_item_parameters(&self, id: ItemId, update: ParameterUpdate) -> StoreResult<()>;

    /// Refresh the calibration timestamp without touching parameters
    fn touch_calibrated(&self, id: ItemId, at: DateTime<Utc>) -> StoreResult<()>;

    fn set_active(&self, id: ItemId, active: bool, reason: Option<String>) -> StoreResult<()>;

    /// Bump the exposure counter, opening a window at `now` when the counter
    /// was zero. Returns the new count.
    fn increment_exposure(&self, id: ItemId, now: DateTime<Utc>) -> StoreResult<u64>;

    /// Zero the exposure counter and close the window
    fn reset_exposure(&self, id: ItemId) -> StoreResult<()>;

    /// Returns the new response count
    fn increment_response_count(&self, id: ItemId) -> StoreResult<u64>;

    fn get_topic(&self, id: TopicId) -> StoreResult<Topic>;

    fn list_topics(&self) -> StoreResult<Vec<Topic>>;

    fn put_topic(&self, topic: Topic) -> StoreResult<()>;
}

/// Per-(user, topic) ability estimates
pub trait AbilityStore: Send + Sync {
    fn get_ability(&self, user_id: UserId, topic_id: TopicId) -> StoreResult<Option<AbilityEstimate>>;

    fn upsert_ability(&self, estimate: AbilityEstimate) -> StoreResult<()>;

    /// Returns whether an estimate existed
    fn delete_ability(&self, user_id: UserId, topic_id: TopicId) -> StoreResult<bool>;
}

/// Arm state with its optimistic-concurrency version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedArmState {
    pub state: ArmState,
    pub version: u64,
}

/// Shared bandit state keyed by feature space
pub trait BanditStateStore: Send + Sync {
    fn get_arm_state(&self, key: &ArmKey) -> StoreResult<Option<VersionedArmState>>;

    /// Compare-and-swap write
    ///
    /// Succeeds only when the stored version equals `expected_version`
    /// (`None` meaning "no state stored yet") and returns the new version.
    /// Otherwise fails with [`StoreError::VersionConflict`] and writes
    /// nothing.
    fn put_arm_state(
        &self,
        key: &ArmKey,
        state: ArmState,
        expected_version: Option<u64>,
    ) -> StoreResult<u64>;
}

/// Conjunctive filter over the response log
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResponseFilter {
    pub user_id: Option<UserId>,
    pub topic_id: Option<TopicId>,
    pub question_id: Option<ItemId>,
    pub attempt_id: Option<AttemptId>,
    /// Inclusive lower bound on the timestamp
    pub since: Option<DateTime<Utc>>,
}

impl ResponseFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn user(mut self, user_id: UserId) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn topic(mut self, topic_id: TopicId) -> Self {
        self.topic_id = Some(topic_id);
        self
    }

    pub fn question(mut self, question_id: ItemId) -> Self {
        self.question_id = Some(question_id);
        self
    }

    pub fn attempt(mut self, attempt_id: AttemptId) -> Self {
        self.attempt_id = Some(attempt_id);
        self
    }

    pub fn since(mut self, at: DateTime<Utc>) -> Self {
        self.since = Some(at);
        self
    }

    pub fn matches(&self, event: &ResponseEvent) -> bool {
        self.user_id.map_or(true, |u| event.user_id == u)
            && self.topic_id.map_or(true, |t| event.topic_id == t)
            && self.question_id.map_or(true, |q| event.question_id == q)
            && self.attempt_id.map_or(true, |a| event.attempt_id == Some(a))
            && self.since.map_or(true, |s| event.timestamp >= s)
    }
}

/// Append-only log of answers
pub trait ResponseLog: Send + Sync {
    fn append_response(&self, event: ResponseEvent) -> StoreResult<()>;

    /// Matching events in append order
    fn query_responses(&self, filter: &ResponseFilter) -> StoreResult<Vec<ResponseEvent>>;

    /// Drop every event belonging to the given attempts; returns the count
    fn purge_attempts(&self, attempts: &[AttemptId]) -> StoreResult<usize>;
}

/// Calibration audit trail
pub trait AuditLog: Send + Sync {
    fn append_calibration(&self, record: CalibrationRecord) -> StoreResult<()>;

    fn list_calibrations(&self, item_id: Option<ItemId>) -> StoreResult<Vec<CalibrationRecord>>;

    /// Remove records older than `cutoff`; returns the count
    fn purge_before(&self, cutoff: DateTime<Utc>) -> StoreResult<usize>;
}

/// Quiz attempts
pub trait AttemptStore: Send + Sync {
    fn put_attempt(&self, attempt: Attempt) -> StoreResult<()>;

    fn get_attempt(&self, id: AttemptId) -> StoreResult<Attempt>;

    /// Attempts completed strictly before `cutoff`
    fn completed_before(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<Attempt>>;

    fn delete_attempt(&self, id: AttemptId) -> StoreResult<()>;
}

/// The full set of collaborators shared by the engine and maintenance jobs
#[derive(Clone)]
pub struct Stores {
    pub items: Arc<dyn ItemStore>,
    pub abilities: Arc<dyn AbilityStore>,
    pub bandit: Arc<dyn BanditStateStore>,
    pub responses: Arc<dyn ResponseLog>,
    pub audit: Arc<dyn AuditLog>,
    pub attempts: Arc<dyn AttemptStore>,
}

impl Stores {
    /// Fresh in-memory stores
    pub fn in_memory() -> Self {
        Self {
            items: Arc::new(memory::MemoryItemStore::new()),
            abilities: Arc::new(memory::MemoryAbilityStore::new()),
            bandit: Arc::new(memory::MemoryBanditStore::new()),
            responses: Arc::new(memory::MemoryResponseLog::new()),
            audit: Arc::new(memory::MemoryAuditLog::new()),
            attempts: Arc::new(memory::MemoryAttemptStore::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(user: u64, topic: u64, question: u64, attempt: Option<AttemptId>) -> ResponseEvent {
        ResponseEvent {
            user_id: UserId(user),
            question_id: ItemId(question),
            topic_id: TopicId(topic),
            attempt_id: attempt,
            is_correct: true,
            response_time_ms: 4_000,
            ability_at_time: 0.0,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_empty_filter_matches_everything() {
        assert!(ResponseFilter::new().matches(&event(1, 2, 3, None)));
    }

    #[test]
    fn test_filter_fields_are_conjunctive() {
        let attempt = AttemptId::new();
        let filter = ResponseFilter::new().user(UserId(1)).attempt(attempt);
        assert!(filter.matches(&event(1, 2, 3, Some(attempt))));
        assert!(!filter.matches(&event(1, 2, 3, None)));
        assert!(!filter.matches(&event(2, 2, 3, Some(attempt))));
    }

    #[test]
    fn test_since_is_inclusive() {
        let e = event(1, 1, 1, None);
        assert!(ResponseFilter::new().since(e.timestamp).matches(&e));
        assert!(!ResponseFilter::new()
            .since(e.timestamp + chrono::Duration::seconds(1))
            .matches(&e));
    }
}
