//! Item Response Theory model
//!
//! Implements the 3-Parameter Logistic model and ability estimation from
//! dichotomous responses.
//!
//! ## Response function
//! ```text
//! P(θ) = c + (1 - c) / (1 + exp(-a(θ - b)))
//! ```
//! Where: θ = ability, a = discrimination, b = difficulty, c = guessing
//!
//! ## Item information
//! ```text
//! I(θ) = a² (P - c)² (1 - P) / ((1 - c)² P)
//! ```
//!
//! ## Ability estimation
//! Maximum a posteriori estimation with an N(μ, σ²) prior, solved with Fisher
//! scoring (Newton-Raphson with expected information). The step is bounded
//! by the iteration limit; when it fails to converge the expected a posteriori
//! (EAP) estimate over a fixed quadrature grid is used instead. The standard
//! error of measurement is `1 / sqrt(Σ I_i(θ̂))`.
//!
//! Per-answer updates go through [`IrtModel::update_ability`], which treats
//! the stored estimate as the prior for the new response; the SEM there is
//! the posterior one, `1 / sqrt(1/SEM² + I(θ̂))`.
//!
//! Evaluation clamps θ to `[-theta_bound, theta_bound]` to keep the exponential
//! finite, floors `a` at a small positive value (information is undefined at
//! `a = 0`) and treats an absent `c` as zero.
//!
//! Copyright (c) 2025 Mohammad Atashi <mohammadaliatashi@icloud.com>

use log::debug;
use serde::{Deserialize, Serialize};

use crate::config::AbilityConfig;
use crate::error::ValidationError;
use crate::types::ModelVariant;

/// Highest guessing value the model will evaluate
const GUESSING_CEILING: f64 = 0.99;

/// Quadrature points for the EAP fallback
const EAP_QUADRATURE_POINTS: usize = 81;

/// IRT parameters (3PL model)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ItemParameters {
    /// Discrimination parameter
    pub discrimination: f64,

    /// Difficulty parameter
    pub difficulty: f64,

    /// Guessing parameter
    pub guessing: f64,
}

impl ItemParameters {
    /// Create new IRT parameters with validation
    pub fn new(discrimination: f64, difficulty: f64, guessing: f64) -> Result<Self, ValidationError> {
        if !discrimination.is_finite() || discrimination <= 0.0 {
            return Err(ValidationError::InvalidParameter {
                name: "discrimination",
                value: discrimination,
                reason: "must be positive and finite",
            });
        }
        if !difficulty.is_finite() {
            return Err(ValidationError::InvalidParameter {
                name: "difficulty",
                value: difficulty,
                reason: "must be finite",
            });
        }
        if !(0.0..1.0).contains(&guessing) {
            return Err(ValidationError::InvalidParameter {
                name: "guessing",
                value: guessing,
                reason: "must lie in [0, 1)",
            });
        }

        Ok(Self {
            discrimination,
            difficulty,
            guessing,
        })
    }

    /// Parameters as seen by a model variant: 1PL fixes a = 1 and c = 0,
    /// 2PL fixes c = 0. No validation; evaluation applies the floors.
    pub fn for_variant(variant: ModelVariant, discrimination: f64, difficulty: f64, guessing: f64) -> Self {
        match variant {
            ModelVariant::OnePL => Self {
                discrimination: 1.0,
                difficulty,
                guessing: 0.0,
            },
            ModelVariant::TwoPL => Self {
                discrimination,
                difficulty,
                guessing: 0.0,
            },
            ModelVariant::ThreePL => Self {
                discrimination,
                difficulty,
                guessing,
            },
        }
    }

    /// Probability of a correct response under the default model bounds
    pub fn probability(&self, ability: f64) -> f64 {
        IrtModel::default().probability(self, ability)
    }

    /// Fisher information under the default model bounds
    pub fn information(&self, ability: f64) -> f64 {
        IrtModel::default().information(self, ability)
    }
}

/// One scored response fed to the ability estimator
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoredResponse {
    pub parameters: ItemParameters,
    pub correct: bool,
}

/// Which estimator produced an ability value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EstimationMethod {
    /// No responses: the prior itself
    Prior,
    /// Converged Fisher-scoring MAP estimate
    NewtonRaphson,
    /// Expected a posteriori fallback
    ExpectedAPosteriori,
}

/// Ability estimate with uncertainty
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AbilityEstimation {
    pub theta: f64,
    /// Standard error of measurement
    pub sem: f64,
    /// Data precision share `I / (I + 1/σ²)`
    pub confidence: f64,
    /// Accumulated Fisher information at θ̂
    pub information: f64,
    pub iterations: usize,
    pub method: EstimationMethod,
}

/// Evaluation bounds and estimator settings
#[derive(Debug, Clone, PartialEq)]
pub struct IrtModel {
    pub theta_bound: f64,
    pub min_discrimination: f64,
    pub prior_mean: f64,
    pub prior_sd: f64,
    pub max_iterations: usize,
    pub tolerance: f64,
}

impl Default for IrtModel {
    fn default() -> Self {
        Self::from_config(&AbilityConfig::default())
    }
}

impl IrtModel {
    pub fn from_config(config: &AbilityConfig) -> Self {
        Self {
            theta_bound: config.theta_bound,
            min_discrimination: config.min_discrimination,
            prior_mean: config.prior_mean,
            prior_sd: config.prior_sd,
            max_iterations: config.max_iterations,
            tolerance: config.tolerance,
        }
    }

    /// Clamp θ into the evaluable range; NaN maps to the prior mean
    pub fn clamp_theta(&self, theta: f64) -> f64 {
        if theta.is_nan() {
            return self.prior_mean;
        }
        theta.clamp(-self.theta_bound, self.theta_bound)
    }

    fn effective(&self, params: &ItemParameters) -> (f64, f64, f64) {
        let a = if params.discrimination.is_finite() {
            params.discrimination.max(self.min_discrimination)
        } else {
            self.min_discrimination
        };
        let c = if params.guessing.is_finite() {
            params.guessing.clamp(0.0, GUESSING_CEILING)
        } else {
            0.0
        };
        (a, params.difficulty, c)
    }

    /// Calculate the probability of correct response given ability
    pub fn probability(&self, params: &ItemParameters, ability: f64) -> f64 {
        let (a, b, c) = self.effective(params);
        let theta = self.clamp_theta(ability);
        let z = a * (theta - b);
        c + (1.0 - c) / (1.0 + (-z).exp())
    }

    /// Calculate the information function value at given ability
    pub fn information(&self, params: &ItemParameters, ability: f64) -> f64 {
        let (a, _, c) = self.effective(params);
        let p = self.probability(params, ability);
        if p <= 0.0 || p >= 1.0 {
            return 0.0;
        }
        let numerator = a * a * (p - c).powi(2) * (1.0 - p);
        let denominator = (1.0 - c).powi(2) * p;
        numerator / denominator
    }

    /// dP/dθ
    fn slope(&self, params: &ItemParameters, ability: f64) -> f64 {
        let (a, _, c) = self.effective(params);
        let p = self.probability(params, ability);
        a * (p - c) * (1.0 - p) / (1.0 - c)
    }

    /// Total Fisher information of a response set at θ
    pub fn test_information(&self, responses: &[ScoredResponse], ability: f64) -> f64 {
        responses
            .iter()
            .map(|r| self.information(&r.parameters, ability))
            .sum()
    }

    fn log_likelihood(&self, responses: &[ScoredResponse], ability: f64) -> f64 {
        responses
            .iter()
            .map(|r| {
                let p = self
                    .probability(&r.parameters, ability)
                    .clamp(f64::EPSILON, 1.0 - f64::EPSILON);
                if r.correct {
                    p.ln()
                } else {
                    (1.0 - p).ln()
                }
            })
            .sum()
    }

    /// Estimate ability from a learner's responses on one topic
    pub fn estimate_ability(&self, responses: &[ScoredResponse]) -> AbilityEstimation {
        if responses.is_empty() {
            return AbilityEstimation {
                theta: self.prior_mean,
                sem: self.prior_sd,
                confidence: 0.0,
                information: 0.0,
                iterations: 0,
                method: EstimationMethod::Prior,
            };
        }

        let (theta, iterations, method) = match self.fisher_scoring(responses) {
            Some((theta, iterations)) => (theta, iterations, EstimationMethod::NewtonRaphson),
            None => {
                debug!(
                    "MAP estimate did not converge in {} iterations over {} responses; using EAP",
                    self.max_iterations,
                    responses.len()
                );
                (
                    self.expected_a_posteriori(responses),
                    self.max_iterations,
                    EstimationMethod::ExpectedAPosteriori,
                )
            }
        };

        let information = self.test_information(responses, theta);
        let sem = if information > f64::EPSILON {
            (1.0 / information.sqrt()).min(2.0 * self.theta_bound)
        } else {
            2.0 * self.theta_bound
        };
        let prior_precision = 1.0 / (self.prior_sd * self.prior_sd);
        let confidence = information / (information + prior_precision);

        AbilityEstimation {
            theta,
            sem,
            confidence,
            information,
            iterations,
            method,
        }
    }

    /// Fold one new response into a stored estimate
    ///
    /// The stored (θ, SEM) acts as an N(θ, SEM²) prior for a single-response
    /// MAP step. Posterior precision accumulates as `1/SEM² + I(θ̂)`, so the
    /// estimate never depends on how much of the response log is retained.
    pub fn update_ability(&self, theta: f64, sem: f64, response: &ScoredResponse) -> AbilityEstimation {
        let prior_sd = if sem.is_finite() && sem > 0.0 { sem } else { self.prior_sd };
        let prior_mean = if theta.is_finite() { self.clamp_theta(theta) } else { self.prior_mean };
        let local = IrtModel {
            prior_mean,
            prior_sd,
            ..self.clone()
        };
        let step = local.estimate_ability(std::slice::from_ref(response));

        let precision = 1.0 / (prior_sd * prior_sd) + self.information(&response.parameters, step.theta);
        let base_precision = 1.0 / (self.prior_sd * self.prior_sd);
        let information = (precision - base_precision).max(0.0);

        AbilityEstimation {
            theta: step.theta,
            sem: (1.0 / precision.sqrt()).min(2.0 * self.theta_bound),
            confidence: information / precision,
            information,
            iterations: step.iterations,
            method: step.method,
        }
    }

    /// Fisher scoring on the log posterior; `None` when it fails to converge
    fn fisher_scoring(&self, responses: &[ScoredResponse]) -> Option<(f64, usize)> {
        let prior_precision = 1.0 / (self.prior_sd * self.prior_sd);
        let mut theta = self.clamp_theta(self.prior_mean);

        for iteration in 1..=self.max_iterations {
            let mut gradient = -(theta - self.prior_mean) * prior_precision;
            let mut expected_information = prior_precision;

            for response in responses {
                let p = self
                    .probability(&response.parameters, theta)
                    .clamp(f64::EPSILON, 1.0 - f64::EPSILON);
                let slope = self.slope(&response.parameters, theta);
                let y = if response.correct { 1.0 } else { 0.0 };
                gradient += (y - p) * slope / (p * (1.0 - p));
                expected_information += slope * slope / (p * (1.0 - p));
            }

            let step = gradient / expected_information;
            if !step.is_finite() {
                return None;
            }

            let next = self.clamp_theta(theta + step);
            let moved = (next - theta).abs();
            theta = next;
            if moved < self.tolerance {
                return Some((theta, iteration));
            }
        }

        None
    }

    /// Posterior mean over an evenly spaced grid on the clamped θ range
    fn expected_a_posteriori(&self, responses: &[ScoredResponse]) -> f64 {
        let step = 2.0 * self.theta_bound / (EAP_QUADRATURE_POINTS - 1) as f64;
        let log_posteriors: Vec<(f64, f64)> = (0..EAP_QUADRATURE_POINTS)
            .map(|i| {
                let theta = -self.theta_bound + i as f64 * step;
                let z = (theta - self.prior_mean) / self.prior_sd;
                (theta, self.log_likelihood(responses, theta) - 0.5 * z * z)
            })
            .collect();

        let max_log = log_posteriors
            .iter()
            .map(|(_, lp)| *lp)
            .fold(f64::NEG_INFINITY, f64::max);

        let (weighted, total) = log_posteriors
            .iter()
            .fold((0.0, 0.0), |(weighted, total), (theta, lp)| {
                let w = (lp - max_log).exp();
                (weighted + theta * w, total + w)
            });

        if total > 0.0 {
            self.clamp_theta(weighted / total)
        } else {
            self.prior_mean
        }
    }
}
