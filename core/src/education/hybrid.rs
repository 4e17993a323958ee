//! Hybrid weight schedule between bandit and IRT scoring
//!
//! Early in a session the bandit knows little about the learner, so item
//! information at the current ability carries more of the score. The weight
//! given to the bandit grows in three linear phases and is then capped:
//!
//! ```text
//! w(n) = initial → phase1_target          for n in [0, phase1_end)
//!        phase1_target → phase2_target    for n in [phase1_end, phase2_end)
//!        phase2_target → max_weight       over the next (phase2_end - phase1_end)
//!        max_weight                       afterwards
//! ```
//!
//! The defaults are the values selected by the schedule tuning runs.
//!
//! Copyright (c) 2025 Mohammad Atashi <mohammadaliatashi@icloud.com>

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HybridWeightSchedule {
    pub initial_weight: f64,
    pub phase1_end: u32,
    pub phase2_end: u32,
    pub phase1_target: f64,
    pub phase2_target: f64,
    pub max_weight: f64,
}

impl Default for HybridWeightSchedule {
    fn default() -> Self {
        Self {
            initial_weight: 0.403,
            phase1_end: 7,
            phase2_end: 26,
            phase1_target: 0.708,
            phase2_target: 0.871,
            max_weight: 0.97,
        }
    }
}

fn lerp(from: f64, to: f64, progress: f64) -> f64 {
    from + (to - from) * progress.clamp(0.0, 1.0)
}

impl HybridWeightSchedule {
    /// Phases must be at least four questions apart and weights strictly
    /// increasing inside (0, 1]
    pub fn validate(&self) -> Result<(), String> {
        if self.phase1_end == 0 {
            return Err("phase1_end must be positive".to_string());
        }
        if self.phase2_end <= self.phase1_end + 3 {
            return Err(format!(
                "phase2_end ({}) must exceed phase1_end ({}) by more than 3",
                self.phase2_end, self.phase1_end
            ));
        }
        let weights = [
            self.initial_weight,
            self.phase1_target,
            self.phase2_target,
            self.max_weight,
        ];
        if weights.iter().any(|w| !(*w > 0.0 && *w <= 1.0)) {
            return Err("weights must lie in (0, 1]".to_string());
        }
        if !weights.windows(2).all(|pair| pair[0] < pair[1]) {
            return Err("weights must be strictly increasing".to_string());
        }
        Ok(())
    }

    /// Bandit weight after `answered` questions in the session
    pub fn weight(&self, answered: u32) -> f64 {
        let n = answered as f64;
        let p1 = self.phase1_end as f64;
        let p2 = self.phase2_end as f64;

        if n < p1 {
            lerp(self.initial_weight, self.phase1_target, n / p1)
        } else if n < p2 {
            lerp(self.phase1_target, self.phase2_target, (n - p1) / (p2 - p1))
        } else {
            lerp(self.phase2_target, self.max_weight, (n - p2) / (p2 - p1))
        }
    }

    /// Blend a UCB score with normalized item information
    pub fn blend(&self, answered: u32, ucb_score: f64, information: f64) -> f64 {
        let w = self.weight(answered);
        w * ucb_score + (1.0 - w) * information / (1.0 + information)
    }
}
