//! PRAXIS Core: adaptive assessment engine
//!
//! Selects the next quiz item for a learner, estimates per-topic ability from
//! binary responses under a 3PL IRT model, and keeps the shared item pool
//! calibrated and healthy through periodic maintenance jobs.
//!
//! Persistence is abstracted behind the traits in [`storage`]; the
//! [`storage::memory`] implementations are thread-safe and suitable for
//! embedding and tests.
//!
//! Copyright (c) 2025 Mohammad Atashi <mohammadaliatashi@icloud.com>

pub mod config;
pub mod error;
pub mod types;
pub mod linalg;
pub mod education;
pub mod storage;
pub mod maintenance;
pub mod simulation;

pub use self::config::{ConfigError, EngineConfig, SelectionMode};
pub use self::error::{EngineError, EngineResult, StoreError, ValidationError};
pub use self::education::{AdaptiveEngine, AnswerSubmission, QuizSession};
pub use self::maintenance::{MaintenanceOrchestrator, MaintenanceReport};
pub use self::storage::Stores;
pub use self::types::{AbilityEstimate, Item, ItemId, ResponseEvent, Topic, TopicId, UserId};
