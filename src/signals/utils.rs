//! Shared confidence helpers for signal implementations
//!
//! Standard ways for a signal to turn its raw model output into the self-assessed
//! `confidence` of a [`DetectionResult`](super::core::DetectionResult), so that different
//! signals report comparable reliability figures.

use crate::stats::population_variance;

/// Variance of a uniform distribution on [0, 1]; the default expected spread.
pub const UNIFORM_UNIT_VARIANCE: f64 = 1.0 / 12.0;

/// Fallback confidence for heuristics without a benchmarked reliability
pub const DEFAULT_HEURISTIC_CONFIDENCE: f64 = 0.5;

/// Shared confidence calculation utilities
pub struct ConfidenceUtils;

impl ConfidenceUtils {
    /// Confidence of a classifier as its top class probability
    ///
    /// # Arguments
    /// * `probabilities` - Class probabilities
    ///
    /// # Returns
    /// * `f64` - Highest probability, 0.0 when there are no classes
    pub fn softmax(probabilities: &[f64]) -> f64 {
        probabilities
            .iter()
            .copied()
            .fold(None, |max: Option<f64>, p| Some(max.map_or(p, |m| m.max(p))))
            .unwrap_or(0.0)
    }

    /// Confidence as the gap between the two most likely classes
    ///
    /// # Arguments
    /// * `probabilities` - Class probabilities
    /// * `top_k` - Minimum number of classes required
    ///
    /// # Returns
    /// * `f64` - Top-1 minus top-2 probability, 0.0 with fewer than `top_k` classes
    pub fn margin(probabilities: &[f64], top_k: usize) -> f64 {
        if probabilities.len() < top_k.max(2) {
            return 0.0;
        }

        let mut sorted = probabilities.to_vec();
        sorted.sort_by(|a, b| b.total_cmp(a));
        sorted[0] - sorted[1]
    }

    /// Confidence as one minus the normalized entropy of the class distribution
    ///
    /// # Returns
    /// * `f64` - 1.0 for a single class, 0.0 for a uniform distribution or no classes
    pub fn entropy(probabilities: &[f64]) -> f64 {
        if probabilities.is_empty() {
            return 0.0;
        }
        if probabilities.len() == 1 {
            return 1.0;
        }

        let entropy: f64 = probabilities
            .iter()
            .filter(|&&p| p > 0.0)
            .map(|&p| -p * p.ln())
            .sum();
        let max_entropy = (probabilities.len() as f64).ln();

        (1.0 - entropy / max_entropy).clamp(0.0, 1.0)
    }

    /// Confidence from how far a value sits from a decision threshold
    ///
    /// # Arguments
    /// * `value` - Raw metric value
    /// * `threshold` - Decision threshold
    /// * `max_distance` - Upper end of the metric's range
    /// * `higher_is_better` - Add a bonus proportional to `value / max_distance`
    ///
    /// # Returns
    /// * `f64` - Confidence clipped to [0, 1]
    pub fn distance(value: f64, threshold: f64, max_distance: f64, higher_is_better: bool) -> f64 {
        let max_possible = (max_distance - threshold).abs().max(threshold.abs());
        if max_possible == 0.0 {
            return 0.0;
        }

        let mut confidence = (value - threshold).abs() / max_possible;
        if higher_is_better && max_distance > 0.0 {
            confidence += (value / max_distance) * 0.5;
        }

        confidence.clamp(0.0, 1.0)
    }

    /// Confidence from the consistency of repeated measurements
    ///
    /// # Arguments
    /// * `values` - Repeated measurements (e.g. per-chunk scores)
    /// * `expected_variance` - Spread considered typical; defaults to [`UNIFORM_UNIT_VARIANCE`]
    /// * `inverse` - When true low variance means high confidence, otherwise the reverse
    ///
    /// # Returns
    /// * `f64` - Confidence in [0, 1]; 0.5 for a single measurement
    pub fn variance(values: &[f64], expected_variance: Option<f64>, inverse: bool) -> f64 {
        if values.len() < 2 {
            return 0.5;
        }

        let variance = population_variance(values);
        let expected = expected_variance.unwrap_or(UNIFORM_UNIT_VARIANCE);

        let consistency = if expected <= 0.0 {
            if variance == 0.0 { 1.0 } else { 0.0 }
        } else {
            (-variance / expected).exp()
        };

        let confidence = if inverse { consistency } else { 1.0 - consistency };
        confidence.clamp(0.0, 1.0)
    }

    /// Benchmarked reliability of well-known heuristics
    pub fn default_for_heuristic(signal_name: &str) -> f64 {
        match signal_name {
            "c2pa_provenance" => 1.0,
            "aasist" => 0.9,
            "frequency_artifacts" => 0.3,
            // Compression ratio alone cannot separate classes without a reference corpus
            "zlib_entropy" => 0.0,
            _ => DEFAULT_HEURISTIC_CONFIDENCE,
        }
    }
}
