//! Learned fusion model
//!
//! A logistic model over per-signal `(score, confidence)` pairs, trained offline on
//! held-out labelled data and shipped as versioned JSON.

use crate::error::{DetectionError, Result};
use crate::signals::core::DetectionResult;
use crate::signals::registry::SignalDescriptor;
use crate::stats::sigmoid;
use log::info;
use ndarray::Array1;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeatureCoefficients {
    pub score: f64,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogisticFusionModel {
    pub version: String,
    pub bias: f64,
    /// Per-signal coefficients keyed by signal name
    pub coefficients: BTreeMap<String, FeatureCoefficients>,
}

impl LogisticFusionModel {
    pub fn new(version: impl Into<String>, bias: f64) -> Self {
        Self {
            version: version.into(),
            bias,
            coefficients: BTreeMap::new(),
        }
    }

    pub fn with_signal(mut self, name: impl Into<String>, score: f64, confidence: f64) -> Self {
        self.coefficients
            .insert(name.into(), FeatureCoefficients { score, confidence });
        self
    }

    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let model: LogisticFusionModel = serde_json::from_str(&fs::read_to_string(path)?)?;
        model.validate()?;
        info!(
            "Loaded learned fusion model {} ({} signals) from {}",
            model.version,
            model.coefficients.len(),
            path.display()
        );
        Ok(model)
    }

    pub fn validate(&self) -> Result<()> {
        let all_finite = self.bias.is_finite()
            && self
                .coefficients
                .values()
                .all(|c| c.score.is_finite() && c.confidence.is_finite());
        if !all_finite {
            return Err(DetectionError::Config(format!(
                "learned fusion model {} has non-finite parameters",
                self.version
            )));
        }
        Ok(())
    }

    /// Whether the model was trained on every one of the given signals
    pub fn supports<'a>(&self, names: impl IntoIterator<Item = &'a str>) -> bool {
        names
            .into_iter()
            .all(|name| self.coefficients.contains_key(name))
    }

    /// Probability for one fusion input.
    ///
    /// Signals the model knows but which did not contribute enter as a zero feature pair.
    pub fn predict(&self, entries: &[(SignalDescriptor, DetectionResult)]) -> f64 {
        let mut features = Vec::with_capacity(self.coefficients.len() * 2);
        let mut weights = Vec::with_capacity(self.coefficients.len() * 2);

        for (name, coefficients) in &self.coefficients {
            let observed = entries
                .iter()
                .find(|(descriptor, result)| descriptor.name == *name && result.contributes())
                .map(|(_, result)| (result.score, result.confidence))
                .unwrap_or((0.0, 0.0));

            features.push(observed.0);
            features.push(observed.1);
            weights.push(coefficients.score);
            weights.push(coefficients.confidence);
        }

        let logit = self.bias + Array1::from(features).dot(&Array1::from(weights));
        sigmoid(logit)
    }
}
