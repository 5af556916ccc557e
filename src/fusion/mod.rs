//! Fusion Engine
//!
//! Combines the per-signal detection results of one content item into a single
//! probability and an aggregate confidence. The default strategy is an inspectable
//! confidence-weighted average; a learned logistic model can be selected instead and
//! falls back to the weighted average whenever it cannot serve the input.

pub mod learned;

pub use learned::{FeatureCoefficients, LogisticFusionModel};

use crate::config::FusionConfig;
use crate::error::{DetectionError, Result};
use crate::signals::core::{DetectionResult, FailureMode};
use crate::signals::registry::SignalDescriptor;
use crate::stats::{normalized_variance, weighted_mean};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Fusion strategy selected by configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FusionStrategy {
    #[default]
    WeightedAverage,
    Learned,
}

/// Result of fusing one content item
#[derive(Debug, Clone, PartialEq)]
pub struct FusionOutcome {
    /// Raw (uncalibrated) probability in [0, 1]
    pub probability: f64,
    /// Aggregate reliability in [0, 1], discounted by disagreement
    pub confidence: f64,
    /// Strategy that actually produced `probability`
    pub strategy: FusionStrategy,
    /// Contributing signal names, in input order
    pub contributing: Vec<String>,
    /// Normalized variance of contributing scores (0 = full agreement)
    pub disagreement: f64,
    /// Conditions noticed while fusing
    pub notes: Vec<FailureMode>,
}

/// One signal's share of the weighted average
#[derive(Debug, Clone, Copy)]
struct Contribution<'a> {
    name: &'a str,
    score: f64,
    confidence: f64,
    weight: f64,
}

impl Contribution<'_> {
    fn effective_weight(&self) -> f64 {
        self.weight * self.confidence
    }
}

#[derive(Debug, Clone)]
pub struct FusionEngine {
    strategy: FusionStrategy,
    disagreement_threshold: f64,
    learned_model: Option<Arc<LogisticFusionModel>>,
}

impl FusionEngine {
    pub fn new(config: &FusionConfig) -> Self {
        Self {
            strategy: config.strategy,
            disagreement_threshold: config.disagreement_warning_threshold,
            learned_model: None,
        }
    }

    pub fn with_learned_model(mut self, model: Arc<LogisticFusionModel>) -> Self {
        self.learned_model = Some(model);
        self
    }

    pub fn strategy(&self) -> FusionStrategy {
        self.strategy
    }

    pub fn learned_model(&self) -> Option<&LogisticFusionModel> {
        self.learned_model.as_deref()
    }

    /// Fuse a set of detection results.
    ///
    /// Results that are inapplicable, have zero confidence or zero weight are excluded
    /// from both numerator and denominator. When nothing is left the call fails with
    /// [`DetectionError::NoApplicableSignal`] instead of inventing a probability.
    pub fn fuse(&self, entries: &[(SignalDescriptor, DetectionResult)]) -> Result<FusionOutcome> {
        let mut contributions: Vec<Contribution<'_>> = entries
            .iter()
            .filter(|(descriptor, result)| result.contributes() && descriptor.weight > 0.0)
            .map(|(descriptor, result)| Contribution {
                name: &descriptor.name,
                score: result.score,
                confidence: result.confidence,
                weight: descriptor.weight,
            })
            .collect();

        if contributions.is_empty() {
            warn!(
                "No applicable signal among {} selected; verdict undetermined",
                entries.len()
            );
            return Err(DetectionError::NoApplicableSignal {
                selected: entries.len(),
            });
        }

        let contributing: Vec<String> = contributions.iter().map(|c| c.name.to_string()).collect();

        // Floating-point sums depend on order; summing in a canonical order makes any
        // permutation of the input produce bit-identical output.
        contributions.sort_by(|a, b| {
            a.name
                .cmp(b.name)
                .then(a.score.total_cmp(&b.score))
                .then(a.confidence.total_cmp(&b.confidence))
                .then(a.weight.total_cmp(&b.weight))
        });

        let scores: Vec<f64> = contributions.iter().map(|c| c.score).collect();
        let confidences: Vec<f64> = contributions.iter().map(|c| c.confidence).collect();
        let weights: Vec<f64> = contributions.iter().map(|c| c.weight).collect();
        let effective: Vec<f64> = contributions.iter().map(|c| c.effective_weight()).collect();

        let weighted_probability = weighted_mean(&scores, &effective).ok_or(
            DetectionError::NoApplicableSignal {
                selected: entries.len(),
            },
        )?;

        let disagreement = normalized_variance(&scores, &effective).unwrap_or(0.0);
        let mean_confidence = weighted_mean(&confidences, &weights).unwrap_or(0.0);
        let confidence = (mean_confidence * (1.0 - disagreement)).clamp(0.0, 1.0);

        let mut notes = Vec::new();
        let (probability, strategy) = match self.strategy {
            FusionStrategy::WeightedAverage => {
                (weighted_probability, FusionStrategy::WeightedAverage)
            }
            FusionStrategy::Learned => match self.learned_probability(entries, &contributing) {
                Some(probability) => (probability, FusionStrategy::Learned),
                None => {
                    notes.push(FailureMode::LearnedFusionUnavailable);
                    (weighted_probability, FusionStrategy::WeightedAverage)
                }
            },
        };

        if contributions.len() > 1 && disagreement >= self.disagreement_threshold {
            debug!(
                "Signals disagree: normalized variance {:.3} >= {:.3}",
                disagreement, self.disagreement_threshold
            );
            notes.push(FailureMode::HighDisagreement);
        }

        Ok(FusionOutcome {
            probability: probability.clamp(0.0, 1.0),
            confidence,
            strategy,
            contributing,
            disagreement,
            notes,
        })
    }

    fn learned_probability(
        &self,
        entries: &[(SignalDescriptor, DetectionResult)],
        contributing: &[String],
    ) -> Option<f64> {
        let Some(model) = self.learned_model.as_deref() else {
            warn!("Learned fusion requested but no model is loaded; using weighted average");
            return None;
        };

        if !model.supports(contributing.iter().map(String::as_str)) {
            warn!(
                "Learned fusion model {} does not cover signals {:?}; using weighted average",
                model.version, contributing
            );
            return None;
        }

        let probability = model.predict(entries);
        probability.is_finite().then_some(probability)
    }
}

impl Default for FusionEngine {
    fn default() -> Self {
        Self::new(&FusionConfig::default())
    }
}
