//! Periodic maintenance jobs
//!
//! The orchestrator runs the pool's batch jobs in a fixed order:
//!
//! 1. exposure reset
//! 2. recalibration of items with enough responses and a stale calibration
//! 3. auto-retirement, on the freshly calibrated parameters
//! 4. health report
//! 5. cleanup of completed attempts past the retention window
//!
//! Jobs are isolated: one failing job is recorded in its summary and the next
//! job still runs. Inside recalibration each item is written on its own, so a
//! failed or interrupted run leaves the items already processed calibrated
//! and the rest untouched. Only one run may be in flight at a time.
//!
//! Copyright (c) 2025 Mohammad Atashi <mohammadaliatashi@icloud.com>

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::education::calibration::{
    CalibrationError, CalibrationObservation, FisherScoringCalibrator, ItemCalibrator,
};
use crate::education::pool::{HealthReport, QuestionPool};
use crate::error::StoreError;
use crate::storage::{ParameterUpdate, ResponseFilter, Stores};
use crate::types::{AttemptId, CalibrationRecord, Item, ParameterSnapshot};

#[derive(Debug, Error)]
pub enum MaintenanceError {
    #[error("A maintenance run is already in progress")]
    AlreadyRunning,

    #[error("Store failure: {0}")]
    Store(#[from] StoreError),
}

pub type MaintenanceResult<T> = Result<T, MaintenanceError>;

/// Per-item recalibration failure; counted, never fatal to the batch
#[derive(Debug, Error)]
enum RecalibrationFailure {
    #[error(transparent)]
    Calibration(#[from] CalibrationError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    ExposureReset,
    Recalibration,
    Retirement,
    HealthReport,
    Cleanup,
}

/// Structured outcome of one job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSummary {
    pub job: JobKind,
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub duration_ms: u64,
    /// Set when the job as a whole failed
    pub error: Option<String>,
    pub details: serde_json::Value,
}

impl JobSummary {
    fn new(job: JobKind) -> Self {
        Self {
            job,
            processed: 0,
            succeeded: 0,
            failed: 0,
            skipped: 0,
            duration_ms: 0,
            error: None,
            details: serde_json::Value::Null,
        }
    }

    fn aborted(job: JobKind, err: &MaintenanceError) -> Self {
        Self {
            error: Some(err.to_string()),
            ..Self::new(job)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaintenanceReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub jobs: Vec<JobSummary>,
    pub health: Option<HealthReport>,
}

impl MaintenanceReport {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn job(&self, kind: JobKind) -> Option<&JobSummary> {
        self.jobs.iter().find(|job| job.job == kind)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CalibrationOutcome {
    Updated,
    Unchanged,
}

/// Clears the in-flight flag when a run ends, however it ends
struct RunGuard<'a> {
    running: &'a AtomicBool,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}

/// Single-flight runner for the maintenance jobs
pub struct MaintenanceOrchestrator {
    stores: Stores,
    config: EngineConfig,
    pool: QuestionPool,
    calibrator: Arc<dyn ItemCalibrator>,
    running: AtomicBool,
}

impl MaintenanceOrchestrator {
    pub fn new(stores: Stores, config: EngineConfig) -> Self {
        Self {
            pool: QuestionPool::new(stores.items.clone(), stores.responses.clone(), &config),
            calibrator: Arc::new(FisherScoringCalibrator::new(&config.calibration)),
            running: AtomicBool::new(false),
            stores,
            config,
        }
    }

    pub fn with_calibrator(mut self, calibrator: Arc<dyn ItemCalibrator>) -> Self {
        self.calibrator = calibrator;
        self
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn begin(&self) -> MaintenanceResult<RunGuard<'_>> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| MaintenanceError::AlreadyRunning)?;
        Ok(RunGuard {
            running: &self.running,
        })
    }

    fn timed<T>(
        job: JobKind,
        body: impl FnOnce() -> MaintenanceResult<(JobSummary, T)>,
    ) -> (JobSummary, Option<T>) {
        let start = Instant::now();
        let (mut summary, value) = match body() {
            Ok((summary, value)) => (summary, Some(value)),
            Err(err) => {
                error!("Maintenance job {:?} failed: {}", job, err);
                (JobSummary::aborted(job, &err), None)
            }
        };
        summary.duration_ms = start.elapsed().as_millis() as u64;
        info!(
            "Maintenance job {:?}: processed {}, succeeded {}, failed {}, skipped {}",
            job, summary.processed, summary.succeeded, summary.failed, summary.skipped
        );
        (summary, value)
    }

    /// Run every job in order
    pub fn run_all(&self, now: DateTime<Utc>) -> MaintenanceResult<MaintenanceReport> {
        let _guard = self.begin()?;
        let started_at = Utc::now();

        let mut jobs = Vec::with_capacity(5);
        jobs.push(Self::timed(JobKind::ExposureReset, || self.exposure_job(now)).0);
        jobs.push(Self::timed(JobKind::Recalibration, || self.recalibration_job(now)).0);
        jobs.push(Self::timed(JobKind::Retirement, || self.retirement_job()).0);
        let (summary, health) = Self::timed(JobKind::HealthReport, || self.health_job(now));
        jobs.push(summary);
        jobs.push(Self::timed(JobKind::Cleanup, || self.cleanup_job(now)).0);

        Ok(MaintenanceReport {
            started_at,
            finished_at: Utc::now(),
            jobs,
            health,
        })
    }

    pub fn reset_exposure(&self, now: DateTime<Utc>) -> MaintenanceResult<JobSummary> {
        let _guard = self.begin()?;
        Ok(Self::timed(JobKind::ExposureReset, || self.exposure_job(now)).0)
    }

    pub fn recalibrate(&self, now: DateTime<Utc>) -> MaintenanceResult<JobSummary> {
        let _guard = self.begin()?;
        Ok(Self::timed(JobKind::Recalibration, || self.recalibration_job(now)).0)
    }

    pub fn retire(&self) -> MaintenanceResult<JobSummary> {
        let _guard = self.begin()?;
        Ok(Self::timed(JobKind::Retirement, || self.retirement_job()).0)
    }

    pub fn health_report(&self, now: DateTime<Utc>) -> MaintenanceResult<(JobSummary, Option<HealthReport>)> {
        let _guard = self.begin()?;
        Ok(Self::timed(JobKind::HealthReport, || self.health_job(now)))
    }

    pub fn cleanup(&self, now: DateTime<Utc>) -> MaintenanceResult<JobSummary> {
        let _guard = self.begin()?;
        Ok(Self::timed(JobKind::Cleanup, || self.cleanup_job(now)).0)
    }

    fn exposure_job(&self, now: DateTime<Utc>) -> MaintenanceResult<(JobSummary, ())> {
        let reset = self.pool.reset_expired_exposure(now)?;
        let mut summary = JobSummary::new(JobKind::ExposureReset);
        summary.processed = reset.examined;
        summary.succeeded = reset.reset.len();
        summary.skipped = reset.examined - reset.reset.len();
        summary.details = json!({ "reset": reset.reset });
        Ok((summary, ()))
    }

    fn is_due(&self, item: &Item, now: DateTime<Utc>) -> bool {
        item.response_count >= self.config.calibration.min_responses
            && item
                .last_calibrated
                .map_or(true, |at| now - at >= self.config.calibration.staleness())
    }

    fn calibrate_item(&self, item: &Item, now: DateTime<Utc>) -> Result<CalibrationOutcome, RecalibrationFailure> {
        let observations: Vec<CalibrationObservation> = self
            .stores
            .responses
            .query_responses(&ResponseFilter::new().question(item.id))?
            .iter()
            .map(CalibrationObservation::from)
            .collect();

        let fitted = self.calibrator.calibrate(item, &observations)?;
        let change = (fitted.discrimination - item.discrimination)
            .abs()
            .max((fitted.difficulty - item.difficulty).abs());

        if !(change > self.config.calibration.materiality_threshold) {
            self.stores.items.touch_calibrated(item.id, now)?;
            return Ok(CalibrationOutcome::Unchanged);
        }

        let previous = item.snapshot();
        self.stores.audit.append_calibration(CalibrationRecord {
            id: Uuid::new_v4(),
            item_id: item.id,
            previous,
            updated: ParameterSnapshot {
                difficulty: fitted.difficulty,
                discrimination: fitted.discrimination,
                guessing: item.guessing.unwrap_or(0.0),
            },
            response_count: observations.len(),
            calibrated_at: now,
        })?;
        self.stores.items.update_item_parameters(
            item.id,
            ParameterUpdate {
                difficulty: fitted.difficulty,
                discrimination: fitted.discrimination,
                guessing: item.guessing,
                calibrated_at: now,
            },
        )?;

        info!(
            "Recalibrated {}: a {:.3} → {:.3}, b {:.3} → {:.3} ({} responses)",
            item.id,
            previous.discrimination,
            fitted.discrimination,
            previous.difficulty,
            fitted.difficulty,
            observations.len()
        );
        Ok(CalibrationOutcome::Updated)
    }

    fn recalibration_job(&self, now: DateTime<Utc>) -> MaintenanceResult<(JobSummary, ())> {
        let mut summary = JobSummary::new(JobKind::Recalibration);
        let (mut updated, mut unchanged) = (0usize, 0usize);

        for item in self.stores.items.list_items()?.into_iter().filter(|i| i.is_active) {
            summary.processed += 1;
            if !self.is_due(&item, now) {
                summary.skipped += 1;
                continue;
            }
            match self.calibrate_item(&item, now) {
                Ok(CalibrationOutcome::Updated) => {
                    summary.succeeded += 1;
                    updated += 1;
                }
                Ok(CalibrationOutcome::Unchanged) => {
                    summary.succeeded += 1;
                    unchanged += 1;
                }
                Err(err) => {
                    error!("Recalibration of {} failed: {}", item.id, err);
                    summary.failed += 1;
                }
            }
        }

        summary.details = json!({ "updated": updated, "unchanged": unchanged });
        Ok((summary, ()))
    }

    fn retirement_job(&self) -> MaintenanceResult<(JobSummary, ())> {
        let retired = self.pool.auto_retire_problematic_questions()?;
        let topics = self.pool.refresh_topic_aggregates()?;

        let mut summary = JobSummary::new(JobKind::Retirement);
        summary.processed = retired.examined;
        summary.succeeded = retired.examined - retired.skipped - retired.failed;
        summary.failed = retired.failed;
        summary.skipped = retired.skipped;
        summary.details = json!({
            "retired": retired.retired,
            "topics_refreshed": topics,
        });
        Ok((summary, ()))
    }

    fn health_job(&self, now: DateTime<Utc>) -> MaintenanceResult<(JobSummary, HealthReport)> {
        let report = self.pool.generate_health_report(now)?;
        let mut summary = JobSummary::new(JobKind::HealthReport);
        summary.processed = report.topics.len();
        summary.succeeded = report.topics.len();
        summary.details = json!({
            "status": report.status,
            "recommendations": report.recommendations,
        });
        Ok((summary, report))
    }

    fn cleanup_job(&self, now: DateTime<Utc>) -> MaintenanceResult<(JobSummary, ())> {
        let cutoff = now - self.config.cleanup.retention();
        let expired = self.stores.attempts.completed_before(cutoff)?;
        let ids: Vec<AttemptId> = expired.iter().map(|attempt| attempt.id).collect();

        let responses_purged = self.stores.responses.purge_attempts(&ids)?;
        let mut summary = JobSummary::new(JobKind::Cleanup);
        for id in &ids {
            summary.processed += 1;
            match self.stores.attempts.delete_attempt(*id) {
                Ok(()) => summary.succeeded += 1,
                Err(err) => {
                    warn!("Could not delete {}: {}", id, err);
                    summary.failed += 1;
                }
            }
        }
        let audit_purged = self.stores.audit.purge_before(cutoff)?;

        summary.details = json!({
            "responses_purged": responses_purged,
            "audit_rows_purged": audit_purged,
        });
        Ok((summary, ()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::education::calibration::{CalibratedParameters, CalibrationResult};
    use crate::types::{Attempt, ItemId, ResponseEvent, TopicId, UserId};
    use chrono::Duration;

    fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    /// Shifts the current parameters by fixed amounts
    struct ShiftCalibrator {
        delta_a: f64,
        delta_b: f64,
        fail_for: Option<ItemId>,
    }

    impl ItemCalibrator for ShiftCalibrator {
        fn calibrate(
            &self,
            item: &Item,
            _observations: &[CalibrationObservation],
        ) -> CalibrationResult<CalibratedParameters> {
            if self.fail_for == Some(item.id) {
                return Err(CalibrationError::ConvergenceFailure { iterations: 50 });
            }
            Ok(CalibratedParameters {
                discrimination: item.discrimination + self.delta_a,
                difficulty: item.difficulty + self.delta_b,
                guessing: 0.0,
                iterations: 1,
                point_biserial: None,
            })
        }
    }

    fn shift(delta_a: f64, delta_b: f64) -> Arc<ShiftCalibrator> {
        Arc::new(ShiftCalibrator {
            delta_a,
            delta_b,
            fail_for: None,
        })
    }

    fn stale_item(id: u64, now: DateTime<Utc>) -> Item {
        let mut item = Item::new(ItemId(id), TopicId(1));
        item.response_count = 35;
        item.last_calibrated = Some(now - Duration::days(10));
        item
    }

    fn setup(items: Vec<Item>) -> Stores {
        let stores = Stores::in_memory();
        for item in items {
            stores.items.put_item(item).unwrap();
        }
        stores
    }

    #[test]
    fn test_material_change_updates_and_audits() {
        init_logging();
        let now = Utc::now();
        let stores = setup(vec![stale_item(1, now)]);
        let orchestrator =
            MaintenanceOrchestrator::new(stores.clone(), EngineConfig::default()).with_calibrator(shift(0.0, 0.15));

        let summary = orchestrator.recalibrate(now).unwrap();
        assert_eq!((summary.processed, summary.succeeded, summary.failed), (1, 1, 0));

        let item = stores.items.get_item(ItemId(1)).unwrap();
        assert!((item.difficulty - 0.15).abs() < 1e-12);
        assert_eq!(item.last_calibrated, Some(now));

        let audit = stores.audit.list_calibrations(Some(ItemId(1))).unwrap();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].previous.difficulty, 0.0);
        assert!((audit[0].updated.difficulty - 0.15).abs() < 1e-12);
    }

    #[test]
    fn test_immaterial_change_only_refreshes_timestamp() {
        let now = Utc::now();
        let stores = setup(vec![stale_item(1, now)]);
        let orchestrator =
            MaintenanceOrchestrator::new(stores.clone(), EngineConfig::default()).with_calibrator(shift(0.0, 0.05));

        orchestrator.recalibrate(now).unwrap();

        let item = stores.items.get_item(ItemId(1)).unwrap();
        assert_eq!(item.difficulty, 0.0);
        assert_eq!(item.last_calibrated, Some(now));
        assert!(stores.audit.list_calibrations(None).unwrap().is_empty());
    }

    #[test]
    fn test_fresh_or_thin_items_are_skipped() {
        let now = Utc::now();
        let mut recent = stale_item(1, now);
        recent.last_calibrated = Some(now - Duration::days(2));
        let mut thin = stale_item(2, now);
        thin.response_count = 29;
        let mut never = stale_item(3, now);
        never.last_calibrated = None;
        let stores = setup(vec![recent, thin, never]);
        let orchestrator =
            MaintenanceOrchestrator::new(stores, EngineConfig::default()).with_calibrator(shift(0.0, 0.5));

        let summary = orchestrator.recalibrate(now).unwrap();
        assert_eq!(summary.skipped, 2);
        assert_eq!(summary.succeeded, 1);
    }

    #[test]
    fn test_one_failing_item_does_not_abort_batch() {
        let now = Utc::now();
        let stores = setup(vec![stale_item(1, now), stale_item(2, now), stale_item(3, now)]);
        let orchestrator = MaintenanceOrchestrator::new(stores.clone(), EngineConfig::default()).with_calibrator(
            Arc::new(ShiftCalibrator {
                delta_a: 0.0,
                delta_b: 0.3,
                fail_for: Some(ItemId(2)),
            }),
        );

        let summary = orchestrator.recalibrate(now).unwrap();
        assert_eq!((summary.succeeded, summary.failed), (2, 1));
        assert_eq!(stores.items.get_item(ItemId(2)).unwrap().difficulty, 0.0);
        assert!((stores.items.get_item(ItemId(3)).unwrap().difficulty - 0.3).abs() < 1e-12);
    }

    #[test]
    fn test_negative_discrimination_retires_in_same_run() {
        let now = Utc::now();
        let stores = setup(vec![stale_item(1, now), stale_item(2, now)]);
        let orchestrator = MaintenanceOrchestrator::new(stores.clone(), EngineConfig::default())
            .with_calibrator(Arc::new(ShiftCalibrator {
                delta_a: -1.4,
                delta_b: 0.0,
                fail_for: Some(ItemId(2)),
            }));

        let report = orchestrator.run_all(now).unwrap();
        let jobs: Vec<JobKind> = report.jobs.iter().map(|j| j.job).collect();
        assert_eq!(
            jobs,
            vec![
                JobKind::ExposureReset,
                JobKind::Recalibration,
                JobKind::Retirement,
                JobKind::HealthReport,
                JobKind::Cleanup,
            ]
        );

        assert!(!stores.items.get_item(ItemId(1)).unwrap().is_active);
        let active = stores.items.get_active_items_by_topic(TopicId(1)).unwrap();
        assert_eq!(active.iter().map(|i| i.id).collect::<Vec<_>>(), vec![ItemId(2)]);

        let json = report.to_json().unwrap();
        assert!(json.contains("\"recalibration\""));
        assert!(json.contains("non_positive_discrimination"));
        assert_eq!(report.health.unwrap().active, 1);
    }

    #[test]
    fn test_runs_are_single_flight() {
        let orchestrator = MaintenanceOrchestrator::new(Stores::in_memory(), EngineConfig::default());
        {
            let _held = orchestrator.begin().unwrap();
            assert!(orchestrator.is_running());
            assert!(matches!(
                orchestrator.run_all(Utc::now()),
                Err(MaintenanceError::AlreadyRunning)
            ));
            assert!(matches!(orchestrator.cleanup(Utc::now()), Err(MaintenanceError::AlreadyRunning)));
        }
        assert!(!orchestrator.is_running());
        assert!(orchestrator.run_all(Utc::now()).is_ok());
    }

    #[test]
    fn test_cleanup_purges_expired_attempts_and_their_rows() {
        let now = Utc::now();
        let stores = setup(vec![Item::new(ItemId(1), TopicId(1))]);
        let old = Attempt {
            id: AttemptId::new(),
            user_id: UserId(1),
            started_at: now - Duration::days(120),
            completed_at: Some(now - Duration::days(119)),
        };
        let recent = Attempt {
            id: AttemptId::new(),
            user_id: UserId(1),
            started_at: now - Duration::days(3),
            completed_at: Some(now - Duration::days(3)),
        };
        for attempt in [&old, &recent] {
            stores.attempts.put_attempt(attempt.clone()).unwrap();
            stores
                .responses
                .append_response(ResponseEvent {
                    user_id: UserId(1),
                    question_id: ItemId(1),
                    topic_id: TopicId(1),
                    attempt_id: Some(attempt.id),
                    is_correct: true,
                    response_time_ms: 2_000,
                    ability_at_time: 0.0,
                    timestamp: attempt.started_at,
                })
                .unwrap();
        }
        stores
            .audit
            .append_calibration(CalibrationRecord {
                id: Uuid::new_v4(),
                item_id: ItemId(1),
                previous: Item::new(ItemId(1), TopicId(1)).snapshot(),
                updated: Item::new(ItemId(1), TopicId(1)).snapshot(),
                response_count: 30,
                calibrated_at: now - Duration::days(200),
            })
            .unwrap();

        let orchestrator = MaintenanceOrchestrator::new(stores.clone(), EngineConfig::default());
        let summary = orchestrator.cleanup(now).unwrap();
        assert_eq!((summary.processed, summary.succeeded), (1, 1));
        assert_eq!(summary.details["responses_purged"], 1);
        assert_eq!(summary.details["audit_rows_purged"], 1);

        assert!(stores.attempts.get_attempt(old.id).is_err());
        assert!(stores.attempts.get_attempt(recent.id).is_ok());
        assert_eq!(stores.responses.query_responses(&ResponseFilter::new()).unwrap().len(), 1);
    }

    #[test]
    fn test_exposure_job_summary() {
        let now = Utc::now();
        let stores = setup(vec![Item::new(ItemId(1), TopicId(1)), Item::new(ItemId(2), TopicId(1))]);
        stores.items.increment_exposure(ItemId(1), now - Duration::days(2)).unwrap();
        let orchestrator = MaintenanceOrchestrator::new(stores, EngineConfig::default());

        let summary = orchestrator.reset_exposure(now).unwrap();
        assert_eq!((summary.processed, summary.succeeded, summary.skipped), (2, 1, 1));
        assert_eq!(orchestrator.reset_exposure(now).unwrap().succeeded, 0);
    }
}
