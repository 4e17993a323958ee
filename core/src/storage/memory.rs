//! In-memory stores
//!
//! Keyed records live in `DashMap`s so that independent keys never contend;
//! append-only logs sit behind a `parking_lot::RwLock`. The bandit store's
//! compare-and-swap runs inside the map's entry guard, which makes the
//! version check and the write a single atomic step.
//!
//! Copyright (c) 2025 Mohammad Atashi <mohammadaliatashi@icloud.com>

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;

use super::{
    AbilityStore, AttemptStore, AuditLog, BanditStateStore, ItemStore, ParameterUpdate,
    ResponseFilter, ResponseLog, StoreResult, VersionedArmState,
};
use crate::education::bandit::{ArmKey, ArmState};
use crate::error::StoreError;
use crate::types::{
    AbilityEstimate, Attempt, AttemptId, CalibrationRecord, Item, ItemId, ResponseEvent, Topic,
    TopicId, UserId,
};

#[derive(Debug, Default)]
pub struct MemoryItemStore {
    items: DashMap<ItemId, Item>,
    topics: DashMap<TopicId, Topic>,
}

impl MemoryItemStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_item<T>(&self, id: ItemId, f: impl FnOnce(&mut Item) -> T) -> StoreResult<T> {
        let mut entry = self
            .items
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("item", id))?;
        Ok(f(entry.value_mut()))
    }

    fn sorted(mut items: Vec<Item>) -> Vec<Item> {
        items.sort_by_key(|item| item.id);
        items
    }
}

impl ItemStore for MemoryItemStore {
    fn get_active_items_by_topic(&self, topic_id: TopicId) -> StoreResult<Vec<Item>> {
        Ok(Self::sorted(
            self.items
                .iter()
                .filter(|entry| entry.topic_id == topic_id && entry.is_active)
                .map(|entry| entry.value().clone())
                .collect(),
        ))
    }

    fn get_item(&self, id: ItemId) -> StoreResult<Item> {
        self.items
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| StoreError::not_found("item", id))
    }

    fn list_items(&self) -> StoreResult<Vec<Item>> {
        Ok(Self::sorted(
            self.items.iter().map(|entry| entry.value().clone()).collect(),
        ))
    }

    fn put_item(&self, item: Item) -> StoreResult<()> {
        self.items.insert(item.id, item);
        Ok(())
    }

    fn update_item_parameters(&self, id: ItemId, update: ParameterUpdate) -> StoreResult<()> {
        self.with_item(id, |item| {
            item.difficulty = update.difficulty;
            item.discrimination = update.discrimination;
            item.guessing = update.guessing;
            item.last_calibrated = Some(update.calibrated_at);
        })
    }

    fn touch_calibrated(&self, id: ItemId, at: DateTime<Utc>) -> StoreResult<()> {
        self.with_item(id, |item| item.last_calibrated = Some(at))
    }

    fn set_active(&self, id: ItemId, active: bool, reason: Option<String>) -> StoreResult<()> {
        self.with_item(id, |item| {
            item.is_active = active;
            item.retirement_reason = reason;
        })
    }

    fn increment_exposure(&self, id: ItemId, now: DateTime<Utc>) -> StoreResult<u64> {
        self.with_item(id, |item| {
            if item.exposure_count == 0 {
                item.exposure_window_start = Some(now);
            }
            item.exposure_count += 1;
            item.exposure_count
        })
    }

    fn reset_exposure(&self, id: ItemId) -> StoreResult<()> {
        self.with_item(id, |item| {
            item.exposure_count = 0;
            item.exposure_window_start = None;
        })
    }

    fn increment_response_count(&self, id: ItemId) -> StoreResult<u64> {
        self.with_item(id, |item| {
            item.response_count += 1;
            item.response_count
        })
    }

    fn get_topic(&self, id: TopicId) -> StoreResult<Topic> {
        self.topics
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| StoreError::not_found("topic", id))
    }

    fn list_topics(&self) -> StoreResult<Vec<Topic>> {
        let mut topics: Vec<Topic> = self.topics.iter().map(|entry| entry.value().clone()).collect();
        topics.sort_by_key(|topic| topic.id);
        Ok(topics)
    }

    fn put_topic(&self, topic: Topic) -> StoreResult<()> {
        self.topics.insert(topic.id, topic);
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryAbilityStore {
    estimates: DashMap<(UserId, TopicId), AbilityEstimate>,
}

impl MemoryAbilityStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AbilityStore for MemoryAbilityStore {
    fn get_ability(&self, user_id: UserId, topic_id: TopicId) -> StoreResult<Option<AbilityEstimate>> {
        Ok(self
            .estimates
            .get(&(user_id, topic_id))
            .map(|entry| entry.value().clone()))
    }

    fn upsert_ability(&self, estimate: AbilityEstimate) -> StoreResult<()> {
        self.estimates
            .insert((estimate.user_id, estimate.topic_id), estimate);
        Ok(())
    }

    fn delete_ability(&self, user_id: UserId, topic_id: TopicId) -> StoreResult<bool> {
        Ok(self.estimates.remove(&(user_id, topic_id)).is_some())
    }
}

#[derive(Debug, Default)]
pub struct MemoryBanditStore {
    arms: DashMap<ArmKey, VersionedArmState>,
}

impl MemoryBanditStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BanditStateStore for MemoryBanditStore {
    fn get_arm_state(&self, key: &ArmKey) -> StoreResult<Option<VersionedArmState>> {
        Ok(self.arms.get(key).map(|entry| entry.value().clone()))
    }

    fn put_arm_state(
        &self,
        key: &ArmKey,
        state: ArmState,
        expected_version: Option<u64>,
    ) -> StoreResult<u64> {
        let conflict = |actual: Option<u64>| StoreError::VersionConflict {
            key: key.to_string(),
            expected: expected_version,
            actual,
        };

        match self.arms.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                let current = occupied.get().version;
                if expected_version != Some(current) {
                    return Err(conflict(Some(current)));
                }
                let version = current + 1;
                occupied.insert(VersionedArmState { state, version });
                Ok(version)
            }
            Entry::Vacant(vacant) => {
                if expected_version.is_some() {
                    return Err(conflict(None));
                }
                vacant.insert(VersionedArmState { state, version: 1 });
                Ok(1)
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryResponseLog {
    events: RwLock<Vec<ResponseEvent>>,
}

impl MemoryResponseLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }
}

impl ResponseLog for MemoryResponseLog {
    fn append_response(&self, event: ResponseEvent) -> StoreResult<()> {
        self.events.write().push(event);
        Ok(())
    }

    fn query_responses(&self, filter: &ResponseFilter) -> StoreResult<Vec<ResponseEvent>> {
        Ok(self
            .events
            .read()
            .iter()
            .filter(|event| filter.matches(event))
            .cloned()
            .collect())
    }

    fn purge_attempts(&self, attempts: &[AttemptId]) -> StoreResult<usize> {
        let mut events = self.events.write();
        let before = events.len();
        events.retain(|event| !event.attempt_id.map_or(false, |a| attempts.contains(&a)));
        Ok(before - events.len())
    }
}

#[derive(Debug, Default)]
pub struct MemoryAuditLog {
    records: RwLock<Vec<CalibrationRecord>>,
}

impl MemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AuditLog for MemoryAuditLog {
    fn append_calibration(&self, record: CalibrationRecord) -> StoreResult<()> {
        self.records.write().push(record);
        Ok(())
    }

    fn list_calibrations(&self, item_id: Option<ItemId>) -> StoreResult<Vec<CalibrationRecord>> {
        Ok(self
            .records
            .read()
            .iter()
            .filter(|record| item_id.map_or(true, |id| record.item_id == id))
            .cloned()
            .collect())
    }

    fn purge_before(&self, cutoff: DateTime<Utc>) -> StoreResult<usize> {
        let mut records = self.records.write();
        let before = records.len();
        records.retain(|record| record.calibrated_at >= cutoff);
        Ok(before - records.len())
    }
}

#[derive(Debug, Default)]
pub struct MemoryAttemptStore {
    attempts: DashMap<AttemptId, Attempt>,
}

impl MemoryAttemptStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AttemptStore for MemoryAttemptStore {
    fn put_attempt(&self, attempt: Attempt) -> StoreResult<()> {
        self.attempts.insert(attempt.id, attempt);
        Ok(())
    }

    fn get_attempt(&self, id: AttemptId) -> StoreResult<Attempt> {
        self.attempts
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| StoreError::not_found("attempt", id))
    }

    fn completed_before(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<Attempt>> {
        let mut attempts: Vec<Attempt> = self
            .attempts
            .iter()
            .filter(|entry| entry.completed_at.map_or(false, |at| at < cutoff))
            .map(|entry| entry.value().clone())
            .collect();
        attempts.sort_by_key(|attempt| attempt.completed_at);
        Ok(attempts)
    }

    fn delete_attempt(&self, id: AttemptId) -> StoreResult<()> {
        self.attempts
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| StoreError::not_found("attempt", id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::education::features::FeatureSpace;
    use chrono::Duration;

    #[test]
    fn test_active_items_exclude_retired_and_other_topics() {
        let store = MemoryItemStore::new();
        store.put_item(Item::new(ItemId(3), TopicId(1))).unwrap();
        store.put_item(Item::new(ItemId(1), TopicId(1))).unwrap();
        store.put_item(Item::new(ItemId(2), TopicId(2))).unwrap();
        store.set_active(ItemId(3), false, Some("negative discrimination".into())).unwrap();

        let active = store.get_active_items_by_topic(TopicId(1)).unwrap();
        assert_eq!(active.iter().map(|i| i.id).collect::<Vec<_>>(), vec![ItemId(1)]);
        assert_eq!(
            store.get_item(ItemId(3)).unwrap().retirement_reason.as_deref(),
            Some("negative discrimination")
        );
    }

    #[test]
    fn test_first_exposure_opens_window() {
        let store = MemoryItemStore::new();
        store.put_item(Item::new(ItemId(1), TopicId(1))).unwrap();
        let t0 = Utc::now();
        assert_eq!(store.increment_exposure(ItemId(1), t0).unwrap(), 1);
        assert_eq!(store.increment_exposure(ItemId(1), t0 + Duration::hours(1)).unwrap(), 2);
        assert_eq!(store.get_item(ItemId(1)).unwrap().exposure_window_start, Some(t0));

        store.reset_exposure(ItemId(1)).unwrap();
        let item = store.get_item(ItemId(1)).unwrap();
        assert_eq!(item.exposure_count, 0);
        assert!(item.exposure_window_start.is_none());
    }

    #[test]
    fn test_missing_item_is_not_found() {
        let store = MemoryItemStore::new();
        assert!(matches!(
            store.increment_response_count(ItemId(9)),
            Err(StoreError::NotFound { kind: "item", .. })
        ));
    }

    #[test]
    fn test_arm_cas_rejects_stale_versions() {
        let store = MemoryBanditStore::new();
        let key = ArmKey::global(FeatureSpace::Item);
        assert_eq!(store.put_arm_state(&key, ArmState::cold(4), None).unwrap(), 1);
        assert!(matches!(
            store.put_arm_state(&key, ArmState::cold(4), None),
            Err(StoreError::VersionConflict { actual: Some(1), .. })
        ));
        assert_eq!(store.put_arm_state(&key, ArmState::cold(4), Some(1)).unwrap(), 2);
        assert!(store.put_arm_state(&key, ArmState::cold(4), Some(1)).is_err());

        let other = ArmKey::for_topic(FeatureSpace::Item, TopicId(1));
        assert!(matches!(
            store.put_arm_state(&other, ArmState::cold(4), Some(3)),
            Err(StoreError::VersionConflict { actual: None, .. })
        ));
    }

    #[test]
    fn test_purge_attempts_keeps_unrelated_events() {
        let log = MemoryResponseLog::new();
        let old = AttemptId::new();
        let kept = AttemptId::new();
        for attempt in [Some(old), Some(kept), None, Some(old)] {
            log.append_response(ResponseEvent {
                user_id: UserId(1),
                question_id: ItemId(1),
                topic_id: TopicId(1),
                attempt_id: attempt,
                is_correct: false,
                response_time_ms: 1_000,
                ability_at_time: 0.0,
                timestamp: Utc::now(),
            })
            .unwrap();
        }
        assert_eq!(log.purge_attempts(&[old]).unwrap(), 2);
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn test_completed_before_skips_open_attempts() {
        let store = MemoryAttemptStore::new();
        let now = Utc::now();
        let done = Attempt {
            id: AttemptId::new(),
            user_id: UserId(1),
            started_at: now - Duration::days(100),
            completed_at: Some(now - Duration::days(99)),
        };
        let open = Attempt {
            id: AttemptId::new(),
            user_id: UserId(1),
            started_at: now - Duration::days(100),
            completed_at: None,
        };
        store.put_attempt(done.clone()).unwrap();
        store.put_attempt(open).unwrap();

        let due = store.completed_before(now - Duration::days(90)).unwrap();
        assert_eq!(due, vec![done.clone()]);
        store.delete_attempt(done.id).unwrap();
        assert!(store.get_attempt(done.id).is_err());
    }
}
