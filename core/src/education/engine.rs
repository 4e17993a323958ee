//! Per-request adaptive engine
//!
//! Composes the components for one learner request. The cycle for each
//! answer is:
//!
//! ```text
//! record_answer:     log response → bump response count → update θ from the
//!                    stored estimate (per user/topic lock) → session bookkeeping
//!                    → bandit reward update
//! select_next_item:  eligible candidates → features → score → bump exposure
//! ```
//!
//! Everything runs synchronously on the caller's thread. The context used to
//! pick an item is kept in the [`QuizSession`] so the reward update trains
//! the arm on exactly the vector that was scored.
//!
//! Copyright (c) 2025 Mohammad Atashi <mohammadaliatashi@icloud.com>

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use log::{debug, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::{EngineConfig, SelectionMode};
use crate::education::bandit::{
    ArmKey, ArmScore, Candidate, ContextualBandit, CorrectnessReward, RewardObservation,
    RewardShaper, ScoringPolicy, UpdateReport,
};
use crate::education::features::{FeatureExtractor, FeatureSpace, LearnerContext};
use crate::education::irt::{EstimationMethod, ScoredResponse};
use crate::education::knowledge_gap::{self, AnsweredQuestion, GapAnalysis};
use crate::education::pool::QuestionPool;
use crate::error::{EngineError, EngineResult, StoreError};
use crate::linalg::Vector;
use crate::storage::Stores;
use crate::types::{
    AbilityEstimate, Attempt, AttemptId, Item, ItemId, ResponseEvent, TopicId, UserId,
};

/// Context of the item handed out and not yet answered
#[derive(Debug, Clone, PartialEq)]
struct PendingSelection {
    item_id: ItemId,
    features: Vector,
    probability: f64,
}

/// State of one learner's quiz attempt
#[derive(Debug, Clone)]
pub struct QuizSession {
    pub attempt_id: AttemptId,
    pub user_id: UserId,
    /// Topics the quiz may draw from
    pub topics: Vec<TopicId>,
    pub exploration_alpha: f64,
    pub session_length: Option<u32>,
    pub started_at: DateTime<Utc>,
    answered: HashSet<ItemId>,
    outcomes: Vec<bool>,
    answers: Vec<AnsweredQuestion>,
    pending: Option<PendingSelection>,
}

impl QuizSession {
    pub fn answered_count(&self) -> u32 {
        self.outcomes.len() as u32
    }

    pub fn has_answered(&self, id: ItemId) -> bool {
        self.answered.contains(&id)
    }

    pub fn answered_items(&self) -> &HashSet<ItemId> {
        &self.answered
    }

    pub fn answers(&self) -> &[AnsweredQuestion] {
        &self.answers
    }

    pub fn with_session_length(mut self, length: u32) -> Self {
        self.session_length = Some(length);
        self
    }

    pub fn with_exploration_alpha(mut self, alpha: f64) -> Self {
        self.exploration_alpha = alpha;
        self
    }
}

/// Item chosen for the learner
#[derive(Debug, Clone, PartialEq)]
pub struct ItemSelection {
    pub item: Item,
    pub score: f64,
    pub arm_score: ArmScore,
    pub candidates_considered: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AnswerSubmission {
    pub question_id: ItemId,
    pub is_correct: bool,
    pub response_time_ms: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnswerOutcome {
    pub event: ResponseEvent,
    pub ability: AbilityEstimate,
    pub method: EstimationMethod,
    /// `None` when the answered item was not the one last selected
    pub bandit_update: Option<UpdateReport>,
}

/// Selection, ability and bandit updates for learner requests
pub struct AdaptiveEngine {
    stores: Stores,
    config: EngineConfig,
    pool: QuestionPool,
    bandit: ContextualBandit,
    extractor: FeatureExtractor,
    reward: Arc<dyn RewardShaper>,
    space: FeatureSpace,
    ability_locks: DashMap<(UserId, TopicId), Arc<Mutex<()>>>,
}

impl AdaptiveEngine {
    pub fn new(stores: Stores, config: EngineConfig) -> EngineResult<Self> {
        config
            .validate()
            .map_err(|err| EngineError::Config(err.to_string()))?;

        Ok(Self {
            pool: QuestionPool::new(stores.items.clone(), stores.responses.clone(), &config),
            bandit: ContextualBandit::new(
                stores.bandit.clone(),
                config.bandit.clone(),
                config.selection.parallel_scoring_threshold,
            ),
            extractor: FeatureExtractor::new(&config.ability),
            reward: Arc::new(CorrectnessReward),
            space: FeatureSpace::Combined,
            ability_locks: DashMap::new(),
            stores,
            config,
        })
    }

    pub fn with_reward_shaper(mut self, reward: Arc<dyn RewardShaper>) -> Self {
        self.reward = reward;
        self
    }

    pub fn with_feature_space(mut self, space: FeatureSpace) -> Self {
        self.space = space;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn pool(&self) -> &QuestionPool {
        &self.pool
    }

    pub fn arm_key(&self) -> ArmKey {
        ArmKey::global(self.space)
    }

    /// Open a new attempt for `user_id` over `topics`
    pub fn start_session(&self, user_id: UserId, topics: Vec<TopicId>) -> EngineResult<QuizSession> {
        let session = QuizSession {
            attempt_id: AttemptId::new(),
            user_id,
            topics,
            exploration_alpha: self.config.selection.exploration_alpha,
            session_length: None,
            started_at: Utc::now(),
            answered: HashSet::new(),
            outcomes: Vec::new(),
            answers: Vec::new(),
            pending: None,
        };
        self.stores.attempts.put_attempt(Attempt {
            id: session.attempt_id,
            user_id,
            started_at: session.started_at,
            completed_at: None,
        })?;
        Ok(session)
    }

    fn current_ability(&self, user_id: UserId, topic_id: TopicId) -> EngineResult<AbilityEstimate> {
        let model = self.extractor.model();
        Ok(self
            .stores
            .abilities
            .get_ability(user_id, topic_id)?
            .unwrap_or_else(|| AbilityEstimate {
                theta: model.prior_mean,
                sem: model.prior_sd,
                ..AbilityEstimate::prior(user_id, topic_id, Utc::now())
            }))
    }

    fn policy(&self, session: &QuizSession) -> ScoringPolicy {
        match self.config.selection.mode {
            SelectionMode::Bandit => ScoringPolicy::Ucb,
            SelectionMode::Irt => ScoringPolicy::Information,
            SelectionMode::Hybrid => ScoringPolicy::Hybrid {
                schedule: self.config.selection.hybrid.clone(),
                answered: session.answered_count(),
            },
        }
    }

    /// Choose the next item for the session and record its exposure
    pub fn select_next_item(&self, session: &mut QuizSession) -> EngineResult<ItemSelection> {
        if let Some(length) = session.session_length.filter(|length| *length > 0) {
            if session.answered_count() >= length {
                return Err(EngineError::SessionComplete {
                    answered: session.answered_count(),
                    length,
                });
            }
        }

        let now = Utc::now();
        let eligible = self.pool.eligible_candidates(&session.topics, &session.answered)?;
        if eligible.is_empty() {
            return Err(EngineError::PoolExhausted {
                topics: session.topics.clone(),
            });
        }

        let mut abilities: HashMap<TopicId, AbilityEstimate> = HashMap::new();
        let mut candidates = Vec::with_capacity(eligible.len());
        let mut probabilities = HashMap::with_capacity(eligible.len());

        for item in &eligible {
            if !abilities.contains_key(&item.topic_id) {
                let estimate = self.current_ability(session.user_id, item.topic_id)?;
                abilities.insert(item.topic_id, estimate);
            }
            let ability = &abilities[&item.topic_id];

            let learner = LearnerContext {
                theta: ability.theta,
                sem: ability.sem,
                confidence: ability.confidence,
                response_count: ability.response_count,
                recent_outcomes: &session.outcomes,
                answered_in_session: session.answered_count(),
                session_length: session.session_length,
            };
            let features = self.extractor.extract(&learner, item)?;
            let params = item.irt_parameters();
            let model = self.extractor.model();

            probabilities.insert(item.id, model.probability(&params, ability.theta));
            candidates.push(Candidate {
                item_id: item.id,
                exposure_count: item.exposure_count,
                features: features.for_space(self.space),
                information: model.information(&params, ability.theta),
            });
        }

        let selection = self.bandit.select(
            &self.arm_key(),
            &candidates,
            session.exploration_alpha,
            &self.policy(session),
        )?;

        let item = eligible
            .into_iter()
            .find(|item| item.id == selection.item_id)
            .ok_or(EngineError::UnknownItem(selection.item_id))?;

        self.pool.increment_exposure(item.id, now)?;

        session.pending = Some(PendingSelection {
            item_id: item.id,
            features: selection.features,
            probability: probabilities.get(&item.id).copied().unwrap_or(0.5),
        });

        debug!(
            "{} gets {} (score {:.4}, {} candidates)",
            session.user_id, item.id, selection.score, selection.candidates_considered
        );

        Ok(ItemSelection {
            item,
            score: selection.score,
            arm_score: selection.arm_score,
            candidates_considered: selection.candidates_considered,
        })
    }

    /// Run `f` under the per user/topic lock, then drop the lock entry if idle
    fn with_ability_lock<T>(
        &self,
        user_id: UserId,
        topic_id: TopicId,
        f: impl FnOnce() -> EngineResult<T>,
    ) -> EngineResult<T> {
        let key = (user_id, topic_id);
        let lock = self
            .ability_locks
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let result = {
            let _guard = lock.lock();
            f()
        };
        drop(lock);
        self.ability_locks
            .remove_if(&key, |_, lock| Arc::strong_count(lock) == 1);
        result
    }

    /// Log the answer and fold it into the stored estimate
    fn update_ability(
        &self,
        session: &QuizSession,
        item: &Item,
        submission: &AnswerSubmission,
        now: DateTime<Utc>,
    ) -> EngineResult<(ResponseEvent, AbilityEstimate, EstimationMethod)> {
        self.with_ability_lock(session.user_id, item.topic_id, || {
            let before = self.current_ability(session.user_id, item.topic_id)?;
            let event = ResponseEvent {
                user_id: session.user_id,
                question_id: item.id,
                topic_id: item.topic_id,
                attempt_id: Some(session.attempt_id),
                is_correct: submission.is_correct,
                response_time_ms: submission.response_time_ms,
                ability_at_time: before.theta,
                timestamp: now,
            };
            self.stores.responses.append_response(event.clone())?;
            self.stores.items.increment_response_count(item.id)?;

            let response = ScoredResponse {
                parameters: item.irt_parameters(),
                correct: submission.is_correct,
            };
            let estimation = self
                .extractor
                .model()
                .update_ability(before.theta, before.sem, &response);
            let estimate = AbilityEstimate {
                user_id: session.user_id,
                topic_id: item.topic_id,
                theta: estimation.theta,
                sem: estimation.sem,
                confidence: estimation.confidence,
                response_count: before.response_count + 1,
                last_estimated: now,
            };
            self.stores.abilities.upsert_ability(estimate.clone())?;

            debug!(
                "{} on {}: θ {:.3} → {:.3} (SEM {:.3}, {:?})",
                session.user_id, item.topic_id, before.theta, estimate.theta, estimate.sem, estimation.method
            );
            Ok((event, estimate, estimation.method))
        })
    }

    /// Process one answer: response log, ability, bandit reward
    ///
    /// The session records the answer as soon as the response and ability
    /// are persisted, so a failed bandit update is not retried into a second
    /// logged response.
    pub fn record_answer(
        &self,
        session: &mut QuizSession,
        submission: AnswerSubmission,
    ) -> EngineResult<AnswerOutcome> {
        if session.has_answered(submission.question_id) {
            return Err(EngineError::DuplicateAnswer(submission.question_id));
        }

        let now = Utc::now();
        let item = self.stores.items.get_item(submission.question_id)?;
        let topic_name = match self.stores.items.get_topic(item.topic_id) {
            Ok(topic) => topic.name,
            Err(StoreError::NotFound { .. }) => item.topic_id.to_string(),
            Err(err) => return Err(err.into()),
        };

        let (event, ability, method) = self.update_ability(session, &item, &submission, now)?;

        session.answered.insert(item.id);
        session.outcomes.push(submission.is_correct);
        session.answers.push(AnsweredQuestion {
            question_id: item.id,
            topic_id: item.topic_id,
            topic_name,
            cell_id: None,
            is_correct: submission.is_correct,
            ability_at_time: event.ability_at_time,
            difficulty: item.difficulty,
        });

        let pending = session
            .pending
            .take()
            .filter(|pending| pending.item_id == submission.question_id);

        let bandit_update = match pending {
            Some(pending) => {
                let reward = self.reward.reward(&RewardObservation {
                    is_correct: submission.is_correct,
                    response_time_ms: submission.response_time_ms,
                    expected_probability: pending.probability,
                });
                Some(self.bandit.update(&self.arm_key(), &pending.features, reward)?)
            }
            None => {
                warn!(
                    "{} answered {} without a matching selection; skipping bandit update",
                    session.user_id, submission.question_id
                );
                None
            }
        };

        Ok(AnswerOutcome {
            event,
            ability,
            method,
            bandit_update,
        })
    }

    /// Mark the attempt complete and analyze its answers
    pub fn complete_attempt(&self, session: &QuizSession) -> EngineResult<GapAnalysis> {
        self.stores.attempts.put_attempt(Attempt {
            id: session.attempt_id,
            user_id: session.user_id,
            started_at: session.started_at,
            completed_at: Some(Utc::now()),
        })?;
        Ok(knowledge_gap::analyze(&session.answers, &self.config.gap_analysis))
    }

    /// Drop a learner's estimate on a topic; returns whether one existed
    pub fn reset_ability(&self, user_id: UserId, topic_id: TopicId) -> EngineResult<bool> {
        self.with_ability_lock(user_id, topic_id, || {
            let existed = self.stores.abilities.delete_ability(user_id, topic_id)?;
            debug!("Ability reset for {} on {} (existed: {})", user_id, topic_id, existed);
            Ok(existed)
        })
    }
}
