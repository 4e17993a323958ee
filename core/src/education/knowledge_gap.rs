//! Knowledge gap analysis over a completed attempt
//!
//! A pure function of the attempt's answers. Each answer may raise
//! independent signals:
//!
//! | Signal         | Condition                                          | Severity |
//! |----------------|----------------------------------------------------|----------|
//! | `incorrect`    | answer was wrong                                   | high     |
//! | `easy_correct` | right, with θ_at_time − b above the threshold      | medium   |
//! | `mixed_topic`  | topic has both right and wrong answers; raised on  | medium   |
//! |                | every answer of that topic not already flagged high|          |
//!
//! Topics are then ranked for review: high when more than half the answers
//! are wrong, medium when anything was flagged, low otherwise.
//!
//! Copyright (c) 2025 Mohammad Atashi <mohammadaliatashi@icloud.com>

use std::cmp::Reverse;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::GapAnalysisConfig;
use crate::types::{ItemId, TopicId};

/// One answer of the attempt, joined with item and topic data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnsweredQuestion {
    pub question_id: ItemId,
    pub topic_id: TopicId,
    pub topic_name: String,
    /// Location of the question inside its source material, when known
    pub cell_id: Option<String>,
    pub is_correct: bool,
    pub ability_at_time: f64,
    pub difficulty: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UncertaintySignal {
    Incorrect {
        question_id: ItemId,
        cell_id: Option<String>,
        severity: Severity,
        details: String,
    },
    EasyCorrect {
        question_id: ItemId,
        cell_id: Option<String>,
        severity: Severity,
        details: String,
    },
    MixedTopic {
        question_id: ItemId,
        cell_id: Option<String>,
        severity: Severity,
        details: String,
    },
}

impl UncertaintySignal {
    pub fn question_id(&self) -> ItemId {
        match self {
            UncertaintySignal::Incorrect { question_id, .. }
            | UncertaintySignal::EasyCorrect { question_id, .. }
            | UncertaintySignal::MixedTopic { question_id, .. } => *question_id,
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            UncertaintySignal::Incorrect { severity, .. }
            | UncertaintySignal::EasyCorrect { severity, .. }
            | UncertaintySignal::MixedTopic { severity, .. } => *severity,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            UncertaintySignal::Incorrect { .. } => "incorrect",
            UncertaintySignal::EasyCorrect { .. } => "easy_correct",
            UncertaintySignal::MixedTopic { .. } => "mixed_topic",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewPriority {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicAnalysis {
    pub topic_id: TopicId,
    pub topic_name: String,
    pub total: usize,
    pub correct: usize,
    pub incorrect: usize,
    pub easy_correct: usize,
    pub review_priority: ReviewPriority,
    pub reason: String,
    pub signals: Vec<UncertaintySignal>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GapAnalysis {
    /// Highest priority first
    pub topics: Vec<TopicAnalysis>,
}

impl GapAnalysis {
    pub fn signals(&self) -> impl Iterator<Item = &UncertaintySignal> {
        self.topics.iter().flat_map(|t| t.signals.iter())
    }
}

fn topic_reason(analysis: &TopicAnalysis) -> String {
    let mixed = analysis.correct > 0 && analysis.incorrect > 0;
    if mixed {
        format!(
            "Mixed performance in {}: {} of {} correct, review the missed concepts",
            analysis.topic_name, analysis.correct, analysis.total
        )
    } else if analysis.total > 0 && analysis.incorrect == analysis.total {
        format!(
            "All {} questions in {} were answered incorrectly",
            analysis.total, analysis.topic_name
        )
    } else if analysis.incorrect > 0 {
        format!(
            "{} incorrect answers in {}",
            analysis.incorrect, analysis.topic_name
        )
    } else if analysis.easy_correct > 0 {
        format!(
            "{} questions in {} were well below your level; try harder material",
            analysis.easy_correct, analysis.topic_name
        )
    } else {
        format!("No gaps detected in {}", analysis.topic_name)
    }
}

fn analyze_topic(answers: &[&AnsweredQuestion], config: &GapAnalysisConfig) -> TopicAnalysis {
    let total = answers.len();
    let incorrect = answers.iter().filter(|a| !a.is_correct).count();
    let correct = total - incorrect;
    let mixed = correct > 0 && incorrect > 0;

    let mut signals = Vec::new();
    let mut easy_correct = 0;

    for answer in answers {
        if !answer.is_correct {
            signals.push(UncertaintySignal::Incorrect {
                question_id: answer.question_id,
                cell_id: answer.cell_id.clone(),
                severity: Severity::High,
                details: format!(
                    "Answered incorrectly at ability {:.2} against difficulty {:.2}",
                    answer.ability_at_time, answer.difficulty
                ),
            });
            continue;
        }

        let margin = answer.ability_at_time - answer.difficulty;
        if margin > config.easy_correct_threshold {
            easy_correct += 1;
            signals.push(UncertaintySignal::EasyCorrect {
                question_id: answer.question_id,
                cell_id: answer.cell_id.clone(),
                severity: Severity::Medium,
                details: format!("Ability exceeded difficulty by {:.2} logits", margin),
            });
        }

        if mixed {
            signals.push(UncertaintySignal::MixedTopic {
                question_id: answer.question_id,
                cell_id: answer.cell_id.clone(),
                severity: Severity::Medium,
                details: format!(
                    "{} of {} answers in {} were incorrect",
                    incorrect, total, answer.topic_name
                ),
            });
        }
    }

    let review_priority = if incorrect as f64 / total as f64 > 0.5 {
        ReviewPriority::High
    } else if incorrect > 0 || easy_correct > 0 {
        ReviewPriority::Medium
    } else {
        ReviewPriority::Low
    };

    let mut analysis = TopicAnalysis {
        topic_id: answers[0].topic_id,
        topic_name: answers[0].topic_name.clone(),
        total,
        correct,
        incorrect,
        easy_correct,
        review_priority,
        reason: String::new(),
        signals,
    };
    analysis.reason = topic_reason(&analysis);
    analysis
}

/// Review priorities for the topics of one attempt
pub fn analyze(answers: &[AnsweredQuestion], config: &GapAnalysisConfig) -> GapAnalysis {
    let mut by_topic: BTreeMap<TopicId, Vec<&AnsweredQuestion>> = BTreeMap::new();
    for answer in answers {
        by_topic.entry(answer.topic_id).or_default().push(answer);
    }

    let mut topics: Vec<TopicAnalysis> = by_topic
        .values()
        .map(|group| analyze_topic(group, config))
        .collect();
    topics.sort_by_key(|t| (Reverse(t.review_priority), Reverse(t.incorrect), t.topic_id));

    GapAnalysis { topics }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn answer(question: u64, topic: u64, correct: bool, ability: f64, difficulty: f64) -> AnsweredQuestion {
        AnsweredQuestion {
            question_id: ItemId(question),
            topic_id: TopicId(topic),
            topic_name: format!("Topic {}", topic),
            cell_id: Some(format!("cell-{}", question)),
            is_correct: correct,
            ability_at_time: ability,
            difficulty,
        }
    }

    #[test]
    fn test_mixed_topic_flags_every_answer() {
        let answers = vec![answer(1, 1, true, 0.0, 0.0), answer(2, 1, false, 0.0, 0.0)];
        let result = analyze(&answers, &GapAnalysisConfig::default());

        let topic = &result.topics[0];
        assert_eq!(topic.review_priority, ReviewPriority::Medium);
        assert!(topic.reason.starts_with("Mixed performance"));

        let kinds: Vec<(ItemId, &str)> = topic.signals.iter().map(|s| (s.question_id(), s.kind())).collect();
        assert_eq!(kinds, vec![(ItemId(1), "mixed_topic"), (ItemId(2), "incorrect")]);
    }

    #[test]
    fn test_easy_correct_uses_threshold() {
        let answers = vec![answer(1, 1, true, 1.5, 0.0), answer(2, 1, true, 0.9, 0.0)];
        let topic = &analyze(&answers, &GapAnalysisConfig::default()).topics[0];
        assert_eq!(topic.easy_correct, 1);
        assert_eq!(topic.review_priority, ReviewPriority::Medium);
        assert_eq!(topic.signals.len(), 1);
        assert_eq!(topic.signals[0].severity(), Severity::Medium);
        assert!(topic.reason.contains("below your level"));
    }

    #[test]
    fn test_mostly_wrong_topic_is_high_priority() {
        let answers = vec![
            answer(1, 1, false, 0.0, 0.0),
            answer(2, 1, false, 0.0, 0.0),
            answer(3, 1, true, 0.0, 0.0),
        ];
        let topic = &analyze(&answers, &GapAnalysisConfig::default()).topics[0];
        assert_eq!(topic.review_priority, ReviewPriority::High);
    }

    #[test]
    fn test_all_incorrect_reason() {
        let answers = vec![answer(1, 1, false, 0.0, 0.0), answer(2, 1, false, 0.0, 0.0)];
        let topic = &analyze(&answers, &GapAnalysisConfig::default()).topics[0];
        assert!(topic.reason.starts_with("All 2 questions"));
        assert!(topic.signals.iter().all(|s| s.kind() == "incorrect"));
    }

    #[test]
    fn test_clean_topic_is_low() {
        let answers = vec![answer(1, 1, true, 0.0, 0.2)];
        let topic = &analyze(&answers, &GapAnalysisConfig::default()).topics[0];
        assert_eq!(topic.review_priority, ReviewPriority::Low);
        assert!(topic.signals.is_empty());
        assert!(topic.reason.starts_with("No gaps"));
    }

    #[test]
    fn test_topics_sorted_by_priority_then_incorrect_count() {
        let answers = vec![
            answer(1, 1, true, 0.0, 0.0),
            answer(2, 2, false, 0.0, 0.0),
            answer(3, 2, true, 0.0, 0.0),
            answer(4, 2, true, 0.0, 0.0),
            answer(5, 3, false, 0.0, 0.0),
            answer(6, 3, false, 0.0, 0.0),
            answer(7, 3, true, 0.0, 0.0),
            answer(8, 3, true, 0.0, 0.0),
            answer(9, 3, true, 0.0, 0.0),
            answer(10, 4, false, 0.0, 0.0),
        ];
        let order: Vec<TopicId> = analyze(&answers, &GapAnalysisConfig::default())
            .topics
            .iter()
            .map(|t| t.topic_id)
            .collect();
        assert_eq!(order, vec![TopicId(4), TopicId(3), TopicId(2), TopicId(1)]);
    }

    #[test]
    fn test_signals_serialize_as_tagged_union() {
        let answers = vec![answer(1, 1, false, 0.0, 0.0)];
        let json = serde_json::to_string(&analyze(&answers, &GapAnalysisConfig::default())).unwrap();
        assert!(json.contains("\"type\":\"incorrect\""));
        assert!(json.contains("\"severity\":\"high\""));
        assert!(json.contains("\"cell_id\":\"cell-1\""));
    }

    #[test]
    fn test_empty_attempt_has_no_topics() {
        assert!(analyze(&[], &GapAnalysisConfig::default()).topics.is_empty());
    }

    proptest! {
        #[test]
        fn prop_mixed_topic_is_at_least_medium(correct_first in any::<bool>(), extra in proptest::collection::vec(any::<bool>(), 0..6)) {
            let mut answers = vec![
                answer(1, 1, correct_first, 0.0, 0.0),
                answer(2, 1, !correct_first, 0.0, 0.0),
            ];
            for (i, c) in extra.into_iter().enumerate() {
                answers.push(answer(10 + i as u64, 1, c, 0.0, 0.0));
            }
            let topic = &analyze(&answers, &GapAnalysisConfig::default()).topics[0];
            prop_assert!(topic.review_priority >= ReviewPriority::Medium);
            for a in &answers {
                prop_assert!(topic.signals.iter().any(|s| s.question_id() == a.question_id
                    && (s.kind() == "incorrect" || s.kind() == "mixed_topic")));
            }
        }
    }
}
