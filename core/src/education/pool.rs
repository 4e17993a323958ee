//! Question pool manager
//!
//! Owns the integrity of the shared item pool:
//!
//! - **Exposure**: every selection bumps the item's exposure counter. Items at
//!   `max_exposure` are ineligible until the rolling window expires and
//!   [`QuestionPool::reset_expired_exposure`] zeroes them again.
//! - **Retirement**: items with enough responses are retired when their
//!   discrimination is non-positive or negligible, when lower-ability
//!   learners answer them correctly more often than higher-ability ones
//!   (negative point-biserial), or when recalibrated difficulty has drifted
//!   implausibly far from where the item started. Retirement is one-way.
//! - **Health**: per-topic active/retired counts with warning/critical flags
//!   and plain-text recommendations.
//!
//! Copyright (c) 2025 Mohammad Atashi <mohammadaliatashi@icloud.com>

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::config::{EngineConfig, ExposureConfig, HealthConfig, RetirementConfig};
use crate::education::calibration::{point_biserial, CalibrationObservation};
use crate::error::StoreError;
use crate::storage::{ItemStore, ResponseFilter, ResponseLog, StoreResult};
use crate::types::{Item, ItemId, Topic, TopicId};

/// Why an item left the active pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RetirementReason {
    NonPositiveDiscrimination { discrimination: f64 },
    NegligibleDiscrimination { discrimination: f64 },
    NegativePointBiserial { correlation: f64 },
    DifficultyDrift { initial: f64, current: f64 },
}

impl fmt::Display for RetirementReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetirementReason::NonPositiveDiscrimination { discrimination } => {
                write!(f, "non-positive discrimination ({:.3})", discrimination)
            }
            RetirementReason::NegligibleDiscrimination { discrimination } => {
                write!(f, "negligible discrimination ({:.3})", discrimination)
            }
            RetirementReason::NegativePointBiserial { correlation } => {
                write!(f, "negative point-biserial correlation ({:.3})", correlation)
            }
            RetirementReason::DifficultyDrift { initial, current } => {
                write!(f, "difficulty drifted from {:.2} to {:.2}", initial, current)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetiredItem {
    pub item_id: ItemId,
    pub topic_id: TopicId,
    pub reason: RetirementReason,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetirementSummary {
    /// Active items inspected
    pub examined: usize,
    /// Active items below the response-volume threshold
    pub skipped: usize,
    pub retired: Vec<RetiredItem>,
    pub failed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExposureResetSummary {
    pub examined: usize,
    pub reset: Vec<ItemId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicHealth {
    pub topic_id: TopicId,
    pub name: String,
    pub total: usize,
    pub active: usize,
    pub retired: usize,
    pub retirement_rate: f64,
    pub mean_exposure: f64,
    pub status: HealthStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub generated_at: DateTime<Utc>,
    pub total: usize,
    pub active: usize,
    pub retired: usize,
    pub status: HealthStatus,
    pub topics: Vec<TopicHealth>,
    pub recommendations: Vec<String>,
}

/// Exposure, retirement and health over an [`ItemStore`]
pub struct QuestionPool {
    items: Arc<dyn ItemStore>,
    responses: Arc<dyn ResponseLog>,
    max_exposure: u64,
    exposure: ExposureConfig,
    retirement: RetirementConfig,
    health: HealthConfig,
}

impl QuestionPool {
    pub fn new(items: Arc<dyn ItemStore>, responses: Arc<dyn ResponseLog>, config: &EngineConfig) -> Self {
        Self {
            items,
            responses,
            max_exposure: config.selection.max_exposure,
            exposure: config.exposure.clone(),
            retirement: config.retirement.clone(),
            health: config.health.clone(),
        }
    }

    pub fn increment_exposure(&self, id: ItemId, now: DateTime<Utc>) -> StoreResult<u64> {
        let count = self.items.increment_exposure(id, now)?;
        if count == self.max_exposure {
            debug!("{} reached the exposure cap ({})", id, count);
        }
        Ok(count)
    }

    pub fn is_eligible(&self, item: &Item, exclude: &HashSet<ItemId>) -> bool {
        item.is_active && item.exposure_count < self.max_exposure && !exclude.contains(&item.id)
    }

    /// Active, not over-exposed items of the permitted topics, minus `exclude`
    pub fn eligible_candidates(&self, topics: &[TopicId], exclude: &HashSet<ItemId>) -> StoreResult<Vec<Item>> {
        let mut candidates = Vec::new();
        for topic in topics {
            candidates.extend(
                self.items
                    .get_active_items_by_topic(*topic)?
                    .into_iter()
                    .filter(|item| self.is_eligible(item, exclude)),
            );
        }
        Ok(candidates)
    }

    /// Zero exposure counters whose window opened at least one window ago
    pub fn reset_expired_exposure(&self, now: DateTime<Utc>) -> StoreResult<ExposureResetSummary> {
        let cutoff = now - self.exposure.window();
        let mut summary = ExposureResetSummary::default();

        for item in self.items.list_items()? {
            summary.examined += 1;
            if item.exposure_count == 0 {
                continue;
            }
            let expired = item.exposure_window_start.map_or(true, |start| start <= cutoff);
            if expired {
                self.items.reset_exposure(item.id)?;
                summary.reset.push(item.id);
            }
        }

        info!(
            "Exposure reset: {} of {} items re-opened",
            summary.reset.len(),
            summary.examined
        );
        Ok(summary)
    }

    /// First applicable retirement reason, checked in severity order
    pub fn retirement_reason(&self, item: &Item, observations: &[CalibrationObservation]) -> Option<RetirementReason> {
        let a = item.discrimination;
        if !(a > 0.0) {
            return Some(RetirementReason::NonPositiveDiscrimination { discrimination: a });
        }
        if a < self.retirement.min_discrimination {
            return Some(RetirementReason::NegligibleDiscrimination { discrimination: a });
        }
        if let Some(r) = point_biserial(observations) {
            if r < 0.0 {
                return Some(RetirementReason::NegativePointBiserial { correlation: r });
            }
        }
        if (item.difficulty - item.initial_difficulty).abs() > self.retirement.max_difficulty_drift {
            return Some(RetirementReason::DifficultyDrift {
                initial: item.initial_difficulty,
                current: item.difficulty,
            });
        }
        None
    }

    fn observations(&self, id: ItemId) -> StoreResult<Vec<CalibrationObservation>> {
        Ok(self
            .responses
            .query_responses(&ResponseFilter::new().question(id))?
            .iter()
            .map(CalibrationObservation::from)
            .collect())
    }

    fn review_item(&self, item: &Item) -> Result<Option<RetirementReason>, StoreError> {
        let observations = self.observations(item.id)?;
        let reason = self.retirement_reason(item, &observations);
        if let Some(reason) = &reason {
            self.items.set_active(item.id, false, Some(reason.to_string()))?;
        }
        Ok(reason)
    }

    /// Deactivate misbehaving items; never reactivates anything
    pub fn auto_retire_problematic_questions(&self) -> StoreResult<RetirementSummary> {
        let mut summary = RetirementSummary::default();

        for item in self.items.list_items()?.into_iter().filter(|i| i.is_active) {
            summary.examined += 1;
            if item.response_count < self.retirement.min_responses {
                summary.skipped += 1;
                continue;
            }

            match self.review_item(&item) {
                Ok(Some(reason)) => {
                    info!("Retired {} ({}): {}", item.id, item.topic_id, reason);
                    summary.retired.push(RetiredItem {
                        item_id: item.id,
                        topic_id: item.topic_id,
                        reason,
                    });
                }
                Ok(None) => {}
                Err(err) => {
                    warn!("Retirement review of {} failed: {}", item.id, err);
                    summary.failed += 1;
                }
            }
        }

        info!(
            "Auto-retirement: examined {}, retired {}, skipped {}, failed {}",
            summary.examined,
            summary.retired.len(),
            summary.skipped,
            summary.failed
        );
        Ok(summary)
    }

    fn topic_status(&self, active: usize, retirement_rate: f64) -> HealthStatus {
        if active < self.health.critical_active_items {
            HealthStatus::Critical
        } else if active < self.health.warning_active_items
            || retirement_rate > self.health.retirement_rate_warning
        {
            HealthStatus::Warning
        } else {
            HealthStatus::Healthy
        }
    }

    fn recommendations(&self, topic: &TopicHealth) -> Vec<String> {
        let mut out = Vec::new();
        match topic.status {
            HealthStatus::Critical => out.push(format!(
                "Topic '{}' has only {} active questions; add at least {} to restore adaptive selection",
                topic.name,
                topic.active,
                self.health.warning_active_items.saturating_sub(topic.active)
            )),
            HealthStatus::Warning if topic.active < self.health.warning_active_items => out.push(format!(
                "Topic '{}' is running low with {} active questions; consider adding {} more",
                topic.name,
                topic.active,
                self.health.warning_active_items.saturating_sub(topic.active)
            )),
            _ => {}
        }
        if topic.total > 0 && topic.retirement_rate > self.health.retirement_rate_warning {
            out.push(format!(
                "Topic '{}' has retired {:.0}% of its questions; review item quality",
                topic.name,
                topic.retirement_rate * 100.0
            ));
        }
        out
    }

    /// Per-topic and overall pool health
    pub fn generate_health_report(&self, now: DateTime<Utc>) -> StoreResult<HealthReport> {
        let mut by_topic: BTreeMap<TopicId, Vec<Item>> = BTreeMap::new();
        for item in self.items.list_items()? {
            by_topic.entry(item.topic_id).or_default().push(item);
        }

        let mut names: BTreeMap<TopicId, String> = self
            .items
            .list_topics()?
            .into_iter()
            .map(|topic| (topic.id, topic.name))
            .collect();
        for id in by_topic.keys() {
            names.entry(*id).or_insert_with(|| id.to_string());
        }

        let mut topics = Vec::with_capacity(names.len());
        for (topic_id, name) in names {
            let items = by_topic.get(&topic_id).map(Vec::as_slice).unwrap_or(&[]);
            let total = items.len();
            let active: Vec<&Item> = items.iter().filter(|i| i.is_active).collect();
            let retired = total - active.len();
            let retirement_rate = if total > 0 { retired as f64 / total as f64 } else { 0.0 };
            let mean_exposure = if active.is_empty() {
                0.0
            } else {
                active.iter().map(|i| i.exposure_count as f64).sum::<f64>() / active.len() as f64
            };

            topics.push(TopicHealth {
                topic_id,
                name,
                total,
                active: active.len(),
                retired,
                retirement_rate,
                mean_exposure,
                status: self.topic_status(active.len(), retirement_rate),
            });
        }

        let mut recommendations: Vec<String> = topics.iter().flat_map(|t| self.recommendations(t)).collect();
        if recommendations.is_empty() {
            recommendations.push("Question pool is healthy; no action required".to_string());
        }

        let report = HealthReport {
            generated_at: now,
            total: topics.iter().map(|t| t.total).sum(),
            active: topics.iter().map(|t| t.active).sum(),
            retired: topics.iter().map(|t| t.retired).sum(),
            status: topics
                .iter()
                .map(|t| t.status)
                .max()
                .unwrap_or(HealthStatus::Healthy),
            topics,
            recommendations,
        };

        info!(
            "Health report: {} active of {} items, status {:?}",
            report.active, report.total, report.status
        );
        Ok(report)
    }

    /// Recompute topic difficulty and discrimination from active items
    pub fn refresh_topic_aggregates(&self) -> StoreResult<usize> {
        let mut updated = 0;
        for topic in self.items.list_topics()? {
            let active = self.items.get_active_items_by_topic(topic.id)?;
            if active.is_empty() {
                continue;
            }
            let n = active.len() as f64;
            self.items.put_topic(Topic {
                difficulty: active.iter().map(|i| i.difficulty).sum::<f64>() / n,
                discrimination: active.iter().map(|i| i.discrimination).sum::<f64>() / n,
                ..topic
            })?;
            updated += 1;
        }
        Ok(updated)
    }
}
