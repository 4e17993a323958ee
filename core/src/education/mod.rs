//! PRAXIS Education Framework
//! Psychometric models, item selection and question-pool management
//! Copyright (c) 2025 Mohammad Atashi <mohammadaliatashi@icloud.com>

pub mod irt;
pub mod calibration;
pub mod features;
pub mod bandit;
pub mod hybrid;
pub mod pool;
pub mod knowledge_gap;
pub mod engine;

pub use self::irt::{AbilityEstimation, EstimationMethod, IrtModel, ItemParameters, ScoredResponse};
pub use self::calibration::{CalibrationError, FisherScoringCalibrator, ItemCalibrator};
pub use self::features::{FeatureExtractor, FeatureSet, FeatureSpace, LearnerContext};
pub use self::bandit::{ArmKey, ArmState, ContextualBandit, CorrectnessReward, RewardShaper};
pub use self::hybrid::HybridWeightSchedule;
pub use self::pool::{HealthReport, HealthStatus, QuestionPool, RetirementReason};
pub use self::knowledge_gap::{GapAnalysis, ReviewPriority, UncertaintySignal};
pub use self::engine::{AdaptiveEngine, AnswerSubmission, QuizSession};
