//! Contextual bandit item selector (LinUCB)
//!
//! Each feature space owns a ridge-regression state `(A, A⁻¹, b)` that starts
//! at `(I, I, 0)`. For a candidate with context `x`:
//!
//! ```text
//! θ̂     = A⁻¹ b
//! score = xᵀθ̂ + α √(xᵀ A⁻¹ x)
//! ```
//!
//! After a reward `r ∈ [0, 1]` is observed for context `x`:
//!
//! ```text
//! A ← A + x xᵀ        (A⁻¹ via Sherman-Morrison)
//! b ← b + r x
//! ```
//!
//! Arm state is shared by every learner scored in the same feature space, so
//! updates go through the store with optimistic compare-and-swap: read the
//! versioned state, compute the update, write it back conditioned on the
//! version that was read, and retry on conflict. Two concurrent answers can
//! never both build on the same stale `A⁻¹`.
//!
//! Copyright (c) 2025 Mohammad Atashi <mohammadaliatashi@icloud.com>

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use log::{debug, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::config::BanditConfig;
use crate::education::features::FeatureSpace;
use crate::education::hybrid::HybridWeightSchedule;
use crate::error::{EngineError, EngineResult, StoreError, ValidationError};
use crate::linalg::{
    self, invert_spd, matrix_add, outer_product, quadratic_form, sherman_morrison_update, Matrix,
    NumericalInstabilityWarning, Vector,
};
use crate::storage::BanditStateStore;
use crate::types::{ItemId, TopicId};

/// Address of one shared arm state
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArmKey {
    pub space: FeatureSpace,
    /// Topic-scoped arms learn per topic; `None` shares across topics
    pub topic: Option<TopicId>,
}

impl ArmKey {
    pub fn global(space: FeatureSpace) -> Self {
        Self { space, topic: None }
    }

    pub fn for_topic(space: FeatureSpace, topic: TopicId) -> Self {
        Self {
            space,
            topic: Some(topic),
        }
    }
}

impl fmt::Display for ArmKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.topic {
            Some(topic) => write!(f, "{}:{}", self.space, topic),
            None => write!(f, "{}", self.space),
        }
    }
}

/// Ridge-regression state of one arm
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArmState {
    /// Design matrix `A`
    pub a: Matrix,
    /// Incrementally maintained `A⁻¹`
    pub a_inv: Matrix,
    /// Reward-weighted context sum `b`
    pub b: Vector,
    pub update_count: u64,
}

/// Decomposed UCB score
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ArmScore {
    /// `xᵀθ̂`
    pub expected_reward: f64,
    /// `α √(xᵀA⁻¹x)`
    pub exploration_bonus: f64,
}

impl ArmScore {
    pub fn total(&self) -> f64 {
        self.expected_reward + self.exploration_bonus
    }
}

impl ArmState {
    /// Cold-start state: `(I, I, 0)`
    pub fn cold(dimension: usize) -> Self {
        Self {
            a: linalg::identity(dimension),
            a_inv: linalg::identity(dimension),
            b: linalg::zero_vector(dimension),
            update_count: 0,
        }
    }

    pub fn dimension(&self) -> usize {
        self.b.len()
    }

    /// Shapes agree and every entry is finite
    pub fn validate(&self) -> Result<(), ValidationError> {
        linalg::validate_matrix(&self.a, "arm design matrix")?;
        linalg::validate_matrix(&self.a_inv, "arm inverse")?;
        linalg::validate_vector(&self.b, "arm reward vector")?;
        let d = self.b.len();
        for actual in [self.a.nrows(), self.a_inv.nrows()] {
            if actual != d {
                return Err(ValidationError::DimensionMismatch { expected: d, actual });
            }
        }
        Ok(())
    }

    /// Ridge estimate `A⁻¹ b`
    pub fn theta_hat(&self) -> Vector {
        &self.a_inv * &self.b
    }

    pub fn score(&self, x: &Vector, alpha: f64) -> Result<ArmScore, ValidationError> {
        if x.len() != self.dimension() {
            return Err(ValidationError::DimensionMismatch {
                expected: self.dimension(),
                actual: x.len(),
            });
        }
        linalg::validate_vector(x, "candidate context")?;
        let expected_reward = x.dot(&self.theta_hat());
        let variance = quadratic_form(&self.a_inv, x)?.max(0.0);
        Ok(ArmScore {
            expected_reward,
            exploration_bonus: alpha * variance.sqrt(),
        })
    }

    /// Next state after observing `reward` for context `x`
    ///
    /// A rejected (near-singular) update returns the current state unchanged
    /// with the warning. Every `refresh_interval` updates `A⁻¹` is recomputed
    /// exactly from `A` to bound accumulated drift.
    pub fn apply_update(
        &self,
        x: &Vector,
        reward: f64,
        refresh_interval: u64,
    ) -> Result<(ArmState, Option<NumericalInstabilityWarning>), ValidationError> {
        if !(0.0..=1.0).contains(&reward) {
            return Err(ValidationError::OutOfRange {
                feature: "reward",
                value: reward,
            });
        }

        let rank_one = sherman_morrison_update(&self.a_inv, x)?;
        if let Some(warning) = rank_one.warning {
            return Ok((self.clone(), Some(warning)));
        }

        let a = matrix_add(&self.a, &outer_product(x, x))?;
        let b = &self.b + x * reward;
        let update_count = self.update_count + 1;

        let a_inv = if refresh_interval > 0 && update_count % refresh_interval == 0 {
            match invert_spd(&a) {
                Some(exact) => exact,
                None => {
                    warn!("Exact re-inversion failed after {} updates; keeping incremental inverse", update_count);
                    rank_one.inverse
                }
            }
        } else {
            rank_one.inverse
        };

        Ok((
            ArmState {
                a,
                a_inv,
                b,
                update_count,
            },
            None,
        ))
    }
}

/// Inputs available to a reward shaping function
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RewardObservation {
    pub is_correct: bool,
    pub response_time_ms: u64,
    /// Model probability of a correct answer before responding
    pub expected_probability: f64,
}

/// Maps an observed answer to a reward in [0, 1]
pub trait RewardShaper: Send + Sync {
    fn reward(&self, observation: &RewardObservation) -> f64;
}

/// Binary correctness: 1 for correct, 0 otherwise
#[derive(Debug, Clone, Copy, Default)]
pub struct CorrectnessReward;

impl RewardShaper for CorrectnessReward {
    fn reward(&self, observation: &RewardObservation) -> f64 {
        if observation.is_correct {
            1.0
        } else {
            0.0
        }
    }
}

/// How candidate scores are formed
#[derive(Debug, Clone, PartialEq)]
pub enum ScoringPolicy {
    /// Plain LinUCB
    Ucb,
    /// Item information only
    Information,
    /// Schedule-weighted blend of UCB and information
    Hybrid {
        schedule: HybridWeightSchedule,
        answered: u32,
    },
}

/// An eligible item with its context
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub item_id: ItemId,
    pub exposure_count: u64,
    pub features: Vector,
    /// Fisher information at the learner's current ability
    pub information: f64,
}

/// Result of a selection round
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub item_id: ItemId,
    pub score: f64,
    pub arm_score: ArmScore,
    pub features: Vector,
    pub candidates_considered: usize,
}

/// Outcome of a reward update
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateReport {
    pub key: ArmKey,
    /// False when the rank-1 update was rejected and state kept
    pub applied: bool,
    pub warning: Option<NumericalInstabilityWarning>,
    pub version: Option<u64>,
    pub attempts: usize,
}

struct Scored {
    item_id: ItemId,
    exposure_count: u64,
    arm_score: ArmScore,
    score: f64,
}

/// Higher score wins; ties go to lower exposure, then lower id
fn rank(a: &Scored, b: &Scored) -> Ordering {
    a.score
        .total_cmp(&b.score)
        .then_with(|| b.exposure_count.cmp(&a.exposure_count))
        .then_with(|| b.item_id.cmp(&a.item_id))
}

/// LinUCB selector over the shared arm store
pub struct ContextualBandit {
    store: Arc<dyn BanditStateStore>,
    config: BanditConfig,
    parallel_threshold: usize,
}

impl ContextualBandit {
    pub fn new(store: Arc<dyn BanditStateStore>, config: BanditConfig, parallel_threshold: usize) -> Self {
        Self {
            store,
            config,
            parallel_threshold,
        }
    }

    /// Current state and version for `key`, rebuilding cold state when the
    /// arm is missing or its stored state is corrupt
    pub fn load(&self, key: &ArmKey, dimension: usize) -> EngineResult<(ArmState, Option<u64>)> {
        match self.store.get_arm_state(key)? {
            None => {
                debug!("Cold start for arm {} (d={})", key, dimension);
                Ok((ArmState::cold(dimension), None))
            }
            Some(stored) => {
                if let Err(err) = stored.state.validate() {
                    warn!("Arm {} state unusable ({}); rebuilding from identity", key, err);
                    return Ok((ArmState::cold(dimension), Some(stored.version)));
                }
                if stored.state.dimension() != dimension {
                    return Err(ValidationError::DimensionMismatch {
                        expected: stored.state.dimension(),
                        actual: dimension,
                    }
                    .into());
                }
                Ok((stored.state, Some(stored.version)))
            }
        }
    }

    fn score_one(
        state: &ArmState,
        candidate: &Candidate,
        alpha: f64,
        policy: &ScoringPolicy,
    ) -> Result<Scored, ValidationError> {
        let arm_score = state.score(&candidate.features, alpha)?;
        if !candidate.information.is_finite() || candidate.information < 0.0 {
            return Err(ValidationError::OutOfRange {
                feature: "information",
                value: candidate.information,
            });
        }
        let score = match policy {
            ScoringPolicy::Ucb => arm_score.total(),
            ScoringPolicy::Information => candidate.information,
            ScoringPolicy::Hybrid { schedule, answered } => {
                schedule.blend(*answered, arm_score.total(), candidate.information)
            }
        };
        Ok(Scored {
            item_id: candidate.item_id,
            exposure_count: candidate.exposure_count,
            arm_score,
            score,
        })
    }

    /// Pick the best-scoring candidate
    pub fn select(
        &self,
        key: &ArmKey,
        candidates: &[Candidate],
        alpha: f64,
        policy: &ScoringPolicy,
    ) -> EngineResult<Selection> {
        if candidates.is_empty() {
            return Err(EngineError::PoolExhausted {
                topics: key.topic.into_iter().collect(),
            });
        }
        if !(alpha >= 0.0 && alpha.is_finite()) {
            return Err(ValidationError::InvalidParameter {
                name: "exploration_alpha",
                value: alpha,
                reason: "must be finite and non-negative",
            }
            .into());
        }

        let dimension = candidates[0].features.len();
        let (state, _) = self.load(key, dimension)?;

        let scored: Vec<Scored> = if candidates.len() > self.parallel_threshold {
            candidates
                .par_iter()
                .map(|c| Self::score_one(&state, c, alpha, policy))
                .collect::<Result<_, _>>()?
        } else {
            candidates
                .iter()
                .map(|c| Self::score_one(&state, c, alpha, policy))
                .collect::<Result<_, _>>()?
        };

        let best = scored
            .iter()
            .max_by(|a, b| rank(a, b))
            .ok_or_else(|| EngineError::PoolExhausted {
                topics: key.topic.into_iter().collect(),
            })?;

        let features = candidates
            .iter()
            .find(|c| c.item_id == best.item_id)
            .map(|c| c.features.clone())
            .ok_or(EngineError::UnknownItem(best.item_id))?;

        debug!(
            "Arm {} selected {} (score {:.4}, expected {:.4}, bonus {:.4}) among {} candidates",
            key,
            best.item_id,
            best.score,
            best.arm_score.expected_reward,
            best.arm_score.exploration_bonus,
            scored.len()
        );

        Ok(Selection {
            item_id: best.item_id,
            score: best.score,
            arm_score: best.arm_score,
            features,
            candidates_considered: scored.len(),
        })
    }

    /// Fold an observed reward into the arm, retrying on version conflicts
    pub fn update(&self, key: &ArmKey, x: &Vector, reward: f64) -> EngineResult<UpdateReport> {
        for attempt in 1..=self.config.max_cas_retries {
            let (state, version) = self.load(key, x.len())?;
            let (next, warning) = state.apply_update(x, reward, self.config.inverse_refresh_interval)?;

            if warning.is_some() {
                return Ok(UpdateReport {
                    key: key.clone(),
                    applied: false,
                    warning,
                    version,
                    attempts: attempt,
                });
            }

            match self.store.put_arm_state(key, next, version) {
                Ok(new_version) => {
                    return Ok(UpdateReport {
                        key: key.clone(),
                        applied: true,
                        warning: None,
                        version: Some(new_version),
                        attempts: attempt,
                    });
                }
                Err(StoreError::VersionConflict { .. }) => {
                    debug!("Arm {} version conflict on attempt {}; retrying", key, attempt);
                }
                Err(other) => return Err(other.into()),
            }
        }

        warn!(
            "Arm {} update abandoned after {} conflicting attempts",
            key, self.config.max_cas_retries
        );
        Err(EngineError::Contention {
            key: key.to_string(),
            attempts: self.config.max_cas_retries,
        })
    }

    /// Score of a single context against the stored arm
    pub fn score(&self, key: &ArmKey, x: &Vector, alpha: f64) -> EngineResult<ArmScore> {
        let (state, _) = self.load(key, x.len())?;
        Ok(state.score(x, alpha)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryBanditStore;
    use crate::storage::VersionedArmState;
    use approx::assert_relative_eq;

    fn bandit(store: Arc<MemoryBanditStore>) -> ContextualBandit {
        ContextualBandit::new(store, BanditConfig::default(), 256)
    }

    fn candidate(id: u64, exposure: u64, features: Vec<f64>) -> Candidate {
        Candidate {
            item_id: ItemId(id),
            exposure_count: exposure,
            features: Vector::from_vec(features),
            information: 0.2,
        }
    }

    #[test]
    fn test_repeated_reward_converges_and_bonus_shrinks() {
        let store = Arc::new(MemoryBanditStore::new());
        let bandit = bandit(store);
        let key = ArmKey::global(FeatureSpace::Interaction);
        let x = Vector::from_vec(vec![1.0, 0.0]);

        let mut previous_bonus = bandit.score(&key, &x, 1.0).unwrap().exploration_bonus;
        let mut expected = 0.0;
        for _ in 0..10 {
            let report = bandit.update(&key, &x, 1.0).unwrap();
            assert!(report.applied);
            let score = bandit.score(&key, &x, 1.0).unwrap();
            assert!(score.exploration_bonus < previous_bonus);
            assert!(score.expected_reward > expected);
            previous_bonus = score.exploration_bonus;
            expected = score.expected_reward;
        }
        assert_relative_eq!(expected, 10.0 / 11.0, epsilon = 1e-12);
        assert_relative_eq!(previous_bonus, (1.0_f64 / 11.0).sqrt(), epsilon = 1e-12);
    }

    #[test]
    fn test_zero_alpha_is_pure_exploitation() {
        let state = ArmState::cold(2);
        let score = state.score(&Vector::from_vec(vec![0.5, 0.5]), 0.0).unwrap();
        assert_eq!(score.exploration_bonus, 0.0);
        assert_eq!(score.total(), 0.0);
    }

    #[test]
    fn test_ties_break_on_exposure_then_id() {
        let store = Arc::new(MemoryBanditStore::new());
        let bandit = bandit(store);
        let key = ArmKey::global(FeatureSpace::Item);
        let same = vec![0.5, 0.5, 0.0, 0.1];

        let candidates = vec![
            candidate(9, 3, same.clone()),
            candidate(4, 1, same.clone()),
            candidate(2, 1, same.clone()),
            candidate(7, 5, same),
        ];
        let selection = bandit.select(&key, &candidates, 1.0, &ScoringPolicy::Ucb).unwrap();
        assert_eq!(selection.item_id, ItemId(2));
        assert_eq!(selection.candidates_considered, 4);
    }

    #[test]
    fn test_selection_is_identical_on_the_parallel_path() {
        let store = Arc::new(MemoryBanditStore::new());
        let sequential = ContextualBandit::new(store.clone(), BanditConfig::default(), usize::MAX);
        let parallel = ContextualBandit::new(store, BanditConfig::default(), 0);
        let key = ArmKey::global(FeatureSpace::Interaction);

        let candidates: Vec<Candidate> = (0..500)
            .map(|i| candidate(i, i % 7, vec![(i % 10) as f64 / 10.0, 0.3, 0.2, 0.0]))
            .collect();

        let a = sequential.select(&key, &candidates, 0.7, &ScoringPolicy::Ucb).unwrap();
        let b = parallel.select(&key, &candidates, 0.7, &ScoringPolicy::Ucb).unwrap();
        assert_eq!(a.item_id, b.item_id);
    }

    #[test]
    fn test_empty_candidates_signal_pool_exhausted() {
        let bandit = bandit(Arc::new(MemoryBanditStore::new()));
        let key = ArmKey::for_topic(FeatureSpace::Combined, TopicId(3));
        let err = bandit.select(&key, &[], 1.0, &ScoringPolicy::Ucb).unwrap_err();
        assert!(matches!(err, EngineError::PoolExhausted { ref topics } if topics == &vec![TopicId(3)]));
    }

    #[test]
    fn test_reward_outside_unit_interval_is_rejected_before_mutation() {
        let store = Arc::new(MemoryBanditStore::new());
        let bandit = bandit(store.clone());
        let key = ArmKey::global(FeatureSpace::Interaction);
        let err = bandit.update(&key, &Vector::from_vec(vec![1.0, 0.0]), 1.5).unwrap_err();
        assert!(matches!(err, EngineError::Validation(ValidationError::OutOfRange { .. })));
        assert!(store.get_arm_state(&key).unwrap().is_none());
    }

    #[test]
    fn test_dimension_mismatch_does_not_reset_state() {
        let store = Arc::new(MemoryBanditStore::new());
        let bandit = bandit(store.clone());
        let key = ArmKey::global(FeatureSpace::Interaction);
        bandit.update(&key, &Vector::from_vec(vec![1.0, 0.0]), 1.0).unwrap();

        let err = bandit.update(&key, &Vector::from_vec(vec![1.0, 0.0, 0.0]), 1.0).unwrap_err();
        assert!(matches!(err, EngineError::Validation(ValidationError::DimensionMismatch { .. })));
        assert_eq!(store.get_arm_state(&key).unwrap().unwrap().state.update_count, 1);
    }

    #[test]
    fn test_singular_update_leaves_state_unchanged() {
        let store = Arc::new(MemoryBanditStore::new());
        let key = ArmKey::global(FeatureSpace::Interaction);
        let mut state = ArmState::cold(2);
        state.a_inv = Matrix::from_diagonal(&Vector::from_vec(vec![-1.0, 1.0]));
        store.put_arm_state(&key, state.clone(), None).unwrap();

        let report = bandit(store.clone())
            .update(&key, &Vector::from_vec(vec![1.0, 0.0]), 1.0)
            .unwrap();
        assert!(!report.applied);
        assert!(report.warning.is_some());
        assert_eq!(store.get_arm_state(&key).unwrap().unwrap().state, state);
    }

    #[test]
    fn test_corrupt_state_is_rebuilt_cold() {
        let store = Arc::new(MemoryBanditStore::new());
        let key = ArmKey::global(FeatureSpace::Interaction);
        let mut corrupt = ArmState::cold(2);
        corrupt.a_inv[(0, 0)] = f64::INFINITY;
        store.put_arm_state(&key, corrupt, None).unwrap();

        let bandit = bandit(store.clone());
        let (state, version) = bandit.load(&key, 2).unwrap();
        assert_eq!(state, ArmState::cold(2));
        assert_eq!(version, Some(1));

        bandit.update(&key, &Vector::from_vec(vec![0.0, 1.0]), 0.0).unwrap();
        let VersionedArmState { state, version } = store.get_arm_state(&key).unwrap().unwrap();
        assert_eq!(state.update_count, 1);
        assert_eq!(version, 2);
    }

    #[test]
    fn test_periodic_refresh_matches_incremental_inverse() {
        let mut state = ArmState::cold(3);
        let x = Vector::from_vec(vec![0.2, 0.7, 0.4]);
        let mut refreshed = state.clone();
        for i in 0..8 {
            let reward = (i % 2) as f64;
            state = state.apply_update(&x, reward, 0).unwrap().0;
            refreshed = refreshed.apply_update(&x, reward, 4).unwrap().0;
        }
        for (lhs, rhs) in state.a_inv.iter().zip(refreshed.a_inv.iter()) {
            assert_relative_eq!(*lhs, *rhs, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_concurrent_updates_are_not_lost() {
        let store = Arc::new(MemoryBanditStore::new());
        let config = BanditConfig {
            max_cas_retries: 10_000,
            ..BanditConfig::default()
        };
        let bandit = ContextualBandit::new(store.clone(), config, 256);
        let key = ArmKey::global(FeatureSpace::Interaction);

        std::thread::scope(|scope| {
            for t in 0..4 {
                let bandit = &bandit;
                let key = &key;
                scope.spawn(move || {
                    for i in 0..25 {
                        let x = Vector::from_vec(vec![(t as f64 + 1.0) / 4.0, (i % 5) as f64 / 5.0]);
                        bandit.update(key, &x, 1.0).unwrap();
                    }
                });
            }
        });

        let stored = store.get_arm_state(&key).unwrap().unwrap();
        assert_eq!(stored.state.update_count, 100);
        assert_eq!(stored.version, 100);
    }

    #[test]
    fn test_hybrid_policy_prefers_information_early() {
        let store = Arc::new(MemoryBanditStore::new());
        let bandit = bandit(store);
        let key = ArmKey::global(FeatureSpace::Interaction);
        let mut informative = candidate(1, 0, vec![0.1, 0.5, 0.2, 0.0]);
        informative.information = 3.0;
        let mut plain = candidate(2, 0, vec![0.1, 0.5, 0.2, 0.0]);
        plain.information = 0.01;

        let policy = ScoringPolicy::Hybrid {
            schedule: HybridWeightSchedule::default(),
            answered: 0,
        };
        let selection = bandit.select(&key, &[plain, informative], 1.0, &policy).unwrap();
        assert_eq!(selection.item_id, ItemId(1));
    }
}
