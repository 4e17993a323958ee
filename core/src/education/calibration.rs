//! Item parameter re-estimation
//!
//! Given the logged responses to one item together with each responder's
//! ability at the time of answering, re-estimate discrimination and
//! difficulty by maximum likelihood. Abilities are treated as known, so the
//! fit is a logistic regression in `(a, b)` with the guessing floor held
//! fixed:
//!
//! ```text
//! P_i      = c + (1 − c) σ(a (θ_i − b))
//! ∂P/∂a    = (1 − c) σ(1 − σ) (θ_i − b)
//! ∂P/∂b    = −(1 − c) σ(1 − σ) a
//! score    = Σ (y_i − P_i) / (P_i (1 − P_i)) ∇P_i
//! info     = Σ ∇P_i ∇P_iᵀ / (P_i (1 − P_i))
//! ```
//!
//! Discrimination is not floored here: a validity failure shows up as a
//! negative `a`, which the pool manager then retires.
//!
//! Copyright (c) 2025 Mohammad Atashi <mohammadaliatashi@icloud.com>

use nalgebra::{Matrix2, Vector2};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::CalibrationConfig;
use crate::types::{Item, ModelVariant, ResponseEvent};

/// Largest Newton step per iteration, in logits
const MAX_STEP: f64 = 1.0;

/// Ridge added to the information matrix
const INFORMATION_RIDGE: f64 = 1e-6;

/// Parameter box the fit is confined to
const PARAMETER_BOUND: f64 = 4.0;

const CONVERGENCE_TOLERANCE: f64 = 1e-6;

/// Errors raised while recalibrating a single item
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CalibrationError {
    #[error("Insufficient responses: {available} available, {required} required")]
    InsufficientResponses { available: usize, required: usize },

    /// All-correct or all-incorrect data has no finite maximum
    #[error("Degenerate responses: {correct} of {total} correct")]
    Degenerate { correct: usize, total: usize },

    #[error("No convergence after {iterations} iterations")]
    ConvergenceFailure { iterations: usize },

    #[error("Non-finite value during calibration: {0}")]
    NonFinite(&'static str),
}

pub type CalibrationResult<T> = Result<T, CalibrationError>;

/// One response with the responder's ability at the time
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationObservation {
    pub ability: f64,
    pub correct: bool,
}

impl From<&ResponseEvent> for CalibrationObservation {
    fn from(event: &ResponseEvent) -> Self {
        Self {
            ability: event.ability_at_time,
            correct: event.is_correct,
        }
    }
}

/// Result of a successful fit
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibratedParameters {
    pub discrimination: f64,
    pub difficulty: f64,
    pub guessing: f64,
    pub iterations: usize,
    pub point_biserial: Option<f64>,
}

/// Re-estimates item parameters from observed responses
pub trait ItemCalibrator: Send + Sync {
    fn calibrate(
        &self,
        item: &Item,
        observations: &[CalibrationObservation],
    ) -> CalibrationResult<CalibratedParameters>;
}

/// Correlation between correctness and ability
///
/// `None` with fewer than three observations, when every answer has the same
/// outcome, or when abilities do not vary.
pub fn point_biserial(observations: &[CalibrationObservation]) -> Option<f64> {
    if observations.len() < 3 {
        return None;
    }

    let n = observations.len() as f64;
    let (mut correct_sum, mut correct_count) = (0.0, 0usize);
    let (mut incorrect_sum, mut incorrect_count) = (0.0, 0usize);

    for obs in observations {
        if obs.correct {
            correct_sum += obs.ability;
            correct_count += 1;
        } else {
            incorrect_sum += obs.ability;
            incorrect_count += 1;
        }
    }

    if correct_count == 0 || incorrect_count == 0 {
        return None;
    }

    let mean = (correct_sum + incorrect_sum) / n;
    let variance = observations
        .iter()
        .map(|o| (o.ability - mean).powi(2))
        .sum::<f64>()
        / n;
    if variance <= f64::EPSILON {
        return None;
    }

    let correct_mean = correct_sum / correct_count as f64;
    let incorrect_mean = incorrect_sum / incorrect_count as f64;
    let p = correct_count as f64 / n;
    let q = 1.0 - p;

    Some((correct_mean - incorrect_mean) / variance.sqrt() * (p * q).sqrt())
}

/// Fisher-scoring maximum likelihood fit of `(a, b)` with `c` fixed
#[derive(Debug, Clone)]
pub struct FisherScoringCalibrator {
    pub min_responses: usize,
    pub max_iterations: usize,
}

impl Default for FisherScoringCalibrator {
    fn default() -> Self {
        Self::new(&CalibrationConfig::default())
    }
}

impl FisherScoringCalibrator {
    pub fn new(config: &CalibrationConfig) -> Self {
        Self {
            min_responses: config.min_responses as usize,
            max_iterations: config.max_iterations,
        }
    }

    fn starting_point(item: &Item) -> (f64, f64) {
        let a = if item.discrimination.is_finite() && item.discrimination > 0.0 {
            item.discrimination.min(PARAMETER_BOUND)
        } else {
            1.0
        };
        let b = if item.difficulty.is_finite() {
            item.difficulty.clamp(-PARAMETER_BOUND, PARAMETER_BOUND)
        } else {
            0.0
        };
        (a, b)
    }
}

impl ItemCalibrator for FisherScoringCalibrator {
    fn calibrate(
        &self,
        item: &Item,
        observations: &[CalibrationObservation],
    ) -> CalibrationResult<CalibratedParameters> {
        if observations.len() < self.min_responses {
            return Err(CalibrationError::InsufficientResponses {
                available: observations.len(),
                required: self.min_responses,
            });
        }
        if observations.iter().any(|o| !o.ability.is_finite()) {
            return Err(CalibrationError::NonFinite("ability"));
        }

        let correct = observations.iter().filter(|o| o.correct).count();
        if correct == 0 || correct == observations.len() {
            return Err(CalibrationError::Degenerate {
                correct,
                total: observations.len(),
            });
        }

        let c = match item.variant {
            ModelVariant::ThreePL => item.guessing.unwrap_or(0.0).clamp(0.0, 0.99),
            _ => 0.0,
        };
        let (mut a, mut b) = Self::starting_point(item);

        for iteration in 1..=self.max_iterations {
            let mut score = Vector2::zeros();
            let mut information = Matrix2::identity() * INFORMATION_RIDGE;

            for obs in observations {
                let sigma = 1.0 / (1.0 + (-(a * (obs.ability - b))).exp());
                let p = (c + (1.0 - c) * sigma).clamp(f64::EPSILON, 1.0 - f64::EPSILON);
                let kernel = (1.0 - c) * sigma * (1.0 - sigma);
                let gradient = Vector2::new(kernel * (obs.ability - b), -kernel * a);
                let weight = 1.0 / (p * (1.0 - p));
                let y = if obs.correct { 1.0 } else { 0.0 };

                score += gradient * ((y - p) * weight);
                information += gradient * gradient.transpose() * weight;
            }

            let inverse = information
                .try_inverse()
                .ok_or(CalibrationError::ConvergenceFailure { iterations: iteration })?;
            let mut step = inverse * score;
            if !step.iter().all(|v| v.is_finite()) {
                return Err(CalibrationError::NonFinite("newton step"));
            }
            let largest = step.amax();
            if largest > MAX_STEP {
                step *= MAX_STEP / largest;
            }

            a = (a + step[0]).clamp(-PARAMETER_BOUND, PARAMETER_BOUND);
            b = (b + step[1]).clamp(-PARAMETER_BOUND, PARAMETER_BOUND);

            if largest < CONVERGENCE_TOLERANCE {
                return Ok(CalibratedParameters {
                    discrimination: a,
                    difficulty: b,
                    guessing: c,
                    iterations: iteration,
                    point_biserial: point_biserial(observations),
                });
            }
        }

        Err(CalibrationError::ConvergenceFailure {
            iterations: self.max_iterations,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ItemId, TopicId};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use rand_distr::StandardNormal;

    fn simulate(a: f64, b: f64, n: usize, seed: u64) -> Vec<CalibrationObservation> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n)
            .map(|_| {
                let ability: f64 = rng.sample(StandardNormal);
                let p = 1.0 / (1.0 + (-(a * (ability - b))).exp());
                CalibrationObservation {
                    ability,
                    correct: rng.gen::<f64>() < p,
                }
            })
            .collect()
    }

    fn item() -> Item {
        Item::new(ItemId(1), TopicId(1)).with_variant(ModelVariant::TwoPL)
    }

    #[test]
    fn test_recovers_generating_parameters() {
        let observations = simulate(1.4, 0.5, 3_000, 11);
        let fit = FisherScoringCalibrator::default()
            .calibrate(&item(), &observations)
            .unwrap();
        assert!((fit.discrimination - 1.4).abs() < 0.25, "a = {}", fit.discrimination);
        assert!((fit.difficulty - 0.5).abs() < 0.2, "b = {}", fit.difficulty);
        assert!(fit.point_biserial.unwrap() > 0.0);
    }

    #[test]
    fn test_inverted_item_fits_negative_discrimination() {
        let observations = simulate(-1.0, 0.0, 2_000, 5);
        let fit = FisherScoringCalibrator::default()
            .calibrate(&item(), &observations)
            .unwrap();
        assert!(fit.discrimination < 0.0);
        assert!(fit.point_biserial.unwrap() < 0.0);
    }

    #[test]
    fn test_requires_minimum_volume() {
        let observations = simulate(1.0, 0.0, 29, 1);
        assert_eq!(
            FisherScoringCalibrator::default().calibrate(&item(), &observations),
            Err(CalibrationError::InsufficientResponses {
                available: 29,
                required: 30
            })
        );
    }

    #[test]
    fn test_all_correct_is_degenerate() {
        let observations: Vec<_> = (0..40)
            .map(|i| CalibrationObservation {
                ability: i as f64 / 10.0 - 2.0,
                correct: true,
            })
            .collect();
        assert!(matches!(
            FisherScoringCalibrator::default().calibrate(&item(), &observations),
            Err(CalibrationError::Degenerate { correct: 40, total: 40 })
        ));
    }

    #[test]
    fn test_non_finite_ability_is_rejected() {
        let mut observations = simulate(1.0, 0.0, 40, 2);
        observations[3].ability = f64::NAN;
        assert_eq!(
            FisherScoringCalibrator::default().calibrate(&item(), &observations),
            Err(CalibrationError::NonFinite("ability"))
        );
    }

    #[test]
    fn test_point_biserial_edge_cases() {
        let flat = vec![
            CalibrationObservation { ability: 0.0, correct: true },
            CalibrationObservation { ability: 0.0, correct: false },
            CalibrationObservation { ability: 0.0, correct: true },
        ];
        assert_eq!(point_biserial(&flat), None);
        assert_eq!(point_biserial(&flat[..2]), None);

        let separated = vec![
            CalibrationObservation { ability: -1.0, correct: false },
            CalibrationObservation { ability: 1.0, correct: true },
            CalibrationObservation { ability: -1.0, correct: false },
            CalibrationObservation { ability: 1.0, correct: true },
        ];
        let r = point_biserial(&separated).unwrap();
        assert!((r - 1.0).abs() < 1e-12);
    }
}
