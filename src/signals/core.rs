//! Core signal contract and shared data structures
//!
//! Every detector implements [`Signal`]. The default [`Signal::run`] sequences the
//! contract's steps and turns any internal error into an inapplicable
//! [`DetectionResult`], so one broken signal can never take down a whole verdict.

use async_trait::async_trait;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Content type a signal operates on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    Text,
    Image,
    Audio,
}

impl Modality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Modality::Text => "text",
            Modality::Image => "image",
            Modality::Audio => "audio",
        }
    }
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One content item submitted for detection, tagged by modality
#[derive(Debug, Clone, PartialEq)]
pub enum ContentInput {
    Text(String),
    Image {
        bytes: Vec<u8>,
        width: u32,
        height: u32,
    },
    Audio {
        samples: Vec<f32>,
        sample_rate: u32,
    },
}

impl ContentInput {
    pub fn modality(&self) -> Modality {
        match self {
            ContentInput::Text(_) => Modality::Text,
            ContentInput::Image { .. } => Modality::Image,
            ContentInput::Audio { .. } => Modality::Audio,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ContentInput::Text(text) => Some(text),
            _ => None,
        }
    }
}

/// System-level failure modes reported alongside a verdict.
///
/// Signals may also trigger their own free-form tags (e.g. `short_text`); those travel
/// as plain strings next to these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FailureMode {
    NoApplicableSignals,
    MajorityInapplicable,
    HighDisagreement,
    Uncalibrated,
    LearnedFusionUnavailable,
    Timeout,
    SignalError,
}

impl FailureMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureMode::NoApplicableSignals => "no_applicable_signals",
            FailureMode::MajorityInapplicable => "majority_inapplicable",
            FailureMode::HighDisagreement => "high_disagreement",
            FailureMode::Uncalibrated => "uncalibrated",
            FailureMode::LearnedFusionUnavailable => "learned_fusion_unavailable",
            FailureMode::Timeout => "timeout",
            FailureMode::SignalError => "signal_error",
        }
    }
}

impl fmt::Display for FailureMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Features extracted from one input, consumed by [`Signal::score`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureSet {
    pub values: BTreeMap<String, f64>,
    pub metadata: BTreeMap<String, Value>,
    /// Failure modes this particular input actually triggered
    pub triggered: BTreeSet<String>,
}

impl FeatureSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_value(mut self, key: impl Into<String>, value: f64) -> Self {
        self.values.insert(key.into(), value);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn trigger(mut self, failure_mode: impl Into<String>) -> Self {
        self.triggered.insert(failure_mode.into());
        self
    }

    pub fn value(&self, key: &str) -> Option<f64> {
        self.values.get(key).copied()
    }

    /// Fetch a feature that scoring cannot proceed without
    pub fn require(&self, key: &str) -> anyhow::Result<f64> {
        self.value(key)
            .ok_or_else(|| anyhow::anyhow!("missing feature '{}'", key))
    }
}

/// Raw output of [`Signal::score`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SignalScore {
    pub score: f64,
    pub confidence: f64,
}

impl SignalScore {
    pub fn new(score: f64, confidence: f64) -> Self {
        Self { score, confidence }
    }
}

/// Value object returned by every signal invocation.
///
/// `score` and `confidence` are always populated. When a signal could not run, both are
/// 0.0 and `applicable` is false, so fusion excludes the result without branching on
/// absence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionResult {
    pub score: f64,
    pub confidence: f64,
    pub applicable: bool,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
    #[serde(default)]
    pub failure_reason: Option<String>,
    #[serde(default)]
    pub failure_modes: BTreeSet<String>,
}

impl DetectionResult {
    /// Applicable result with score and confidence clamped to [0, 1]
    pub fn new(score: f64, confidence: f64) -> Self {
        Self {
            score: score.clamp(0.0, 1.0),
            confidence: confidence.clamp(0.0, 1.0),
            applicable: true,
            metadata: BTreeMap::new(),
            failure_reason: None,
            failure_modes: BTreeSet::new(),
        }
    }

    /// The signal could not meaningfully analyse this input
    pub fn not_applicable(reason: impl Into<String>) -> Self {
        Self {
            score: 0.0,
            confidence: 0.0,
            applicable: false,
            metadata: BTreeMap::new(),
            failure_reason: Some(reason.into()),
            failure_modes: BTreeSet::new(),
        }
    }

    /// The signal raised internally; recorded instead of propagated
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::not_applicable(reason).with_failure_mode(FailureMode::SignalError.as_str())
    }

    /// The signal did not settle within its time box
    pub fn timed_out() -> Self {
        Self::not_applicable("timeout").with_failure_mode(FailureMode::Timeout.as_str())
    }

    pub fn from_features(scored: SignalScore, features: FeatureSet) -> Self {
        let mut result = Self::new(scored.score, scored.confidence);
        result.metadata = features.metadata;
        for (key, value) in features.values {
            result.metadata.insert(key, Value::from(value));
        }
        result.failure_modes = features.triggered;
        result
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_failure_mode(mut self, failure_mode: impl Into<String>) -> Self {
        self.failure_modes.insert(failure_mode.into());
        self
    }

    /// Attach a signal's declared failure modes to a degraded result
    pub fn with_known_failure_modes(self, declared: &[&str]) -> Self {
        if declared.is_empty() {
            return self;
        }
        self.with_metadata("known_failure_modes", declared.to_vec())
    }

    /// Whether the result can carry any weight in fusion
    pub fn contributes(&self) -> bool {
        self.applicable && self.confidence > 0.0
    }
}

impl Default for DetectionResult {
    /// A signal that never ran: inapplicable, zero score, zero confidence
    fn default() -> Self {
        Self::not_applicable("not_run")
    }
}

/// Contract every detector implements.
///
/// `extract_features` is the only step allowed to suspend (model inference, I/O);
/// `is_applicable` and `score` are pure.
#[async_trait]
pub trait Signal: Send + Sync {
    /// Unique identifier within the signal's modality
    fn name(&self) -> &str;

    fn modality(&self) -> Modality;

    /// Cheap predicate; returning false skips feature extraction entirely
    fn is_applicable(&self, input: &ContentInput) -> bool;

    /// Reason recorded when `is_applicable` returns false
    fn inapplicable_reason(&self, _input: &ContentInput) -> String {
        "not_applicable".to_string()
    }

    async fn extract_features(&self, input: &ContentInput) -> anyhow::Result<FeatureSet>;

    fn score(&self, features: &FeatureSet) -> anyhow::Result<SignalScore>;

    /// Static declaration of the ways this signal is known to degrade
    fn known_failure_modes(&self) -> &'static [&'static str] {
        &[]
    }

    /// Run the full contract, never failing
    async fn run(&self, input: &ContentInput) -> DetectionResult {
        if input.modality() != self.modality() {
            return DetectionResult::not_applicable(format!(
                "modality_mismatch: expected {}, got {}",
                self.modality(),
                input.modality()
            ));
        }

        if !self.is_applicable(input) {
            let reason = self.inapplicable_reason(input);
            debug!("Signal {} not applicable: {}", self.name(), reason);
            return DetectionResult::not_applicable(reason);
        }

        let declared = self.known_failure_modes();

        let features = match self.extract_features(input).await {
            Ok(features) => features,
            Err(e) => {
                warn!("Signal {} failed extracting features: {:#}", self.name(), e);
                return DetectionResult::failed(format!("feature extraction failed: {:#}", e))
                    .with_known_failure_modes(declared);
            }
        };

        let scored = match self.score(&features) {
            Ok(scored) => scored,
            Err(e) => {
                warn!("Signal {} failed scoring: {:#}", self.name(), e);
                return DetectionResult::failed(format!("scoring failed: {:#}", e))
                    .with_known_failure_modes(declared);
            }
        };

        if !scored.score.is_finite() || !scored.confidence.is_finite() {
            warn!(
                "Signal {} produced non-finite output (score={}, confidence={})",
                self.name(),
                scored.score,
                scored.confidence
            );
            return DetectionResult::failed("non-finite score or confidence")
                .with_known_failure_modes(declared);
        }

        for mode in &features.triggered {
            if !declared.contains(&mode.as_str()) {
                debug!(
                    "Signal {} triggered undeclared failure mode '{}'",
                    self.name(),
                    mode
                );
            }
        }

        DetectionResult::from_features(scored, features)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct KeywordSignal;

    #[async_trait]
    impl Signal for KeywordSignal {
        fn name(&self) -> &str {
            "keyword"
        }

        fn modality(&self) -> Modality {
            Modality::Text
        }

        fn is_applicable(&self, input: &ContentInput) -> bool {
            input.as_text().is_some_and(|t| !t.is_empty())
        }

        fn inapplicable_reason(&self, _input: &ContentInput) -> String {
            "empty text".to_string()
        }

        async fn extract_features(&self, input: &ContentInput) -> anyhow::Result<FeatureSet> {
            let text = input
                .as_text()
                .ok_or_else(|| anyhow::anyhow!("expected text"))?;
            if text.contains("PANIC_FREE_ERROR") {
                anyhow::bail!("extractor refused input");
            }
            let mut features = FeatureSet::new()
                .with_value("hits", text.matches("AI").count() as f64)
                .with_metadata("length", text.len());
            if text.len() < 10 {
                features = features.trigger("short_text");
            }
            Ok(features)
        }

        fn score(&self, features: &FeatureSet) -> anyhow::Result<SignalScore> {
            let hits = features.require("hits")?;
            Ok(SignalScore::new(if hits > 0.0 { 0.9 } else { 0.1 }, 1.0))
        }

        fn known_failure_modes(&self) -> &'static [&'static str] {
            &["short_text"]
        }
    }

    #[tokio::test]
    async fn test_run_scores_applicable_input() {
        let result = KeywordSignal.run(&ContentInput::Text("written by AI".into())).await;
        assert!(result.applicable);
        assert_eq!(result.score, 0.9);
        assert_eq!(result.confidence, 1.0);
        assert_eq!(result.metadata["hits"], Value::from(1.0));
        assert!(result.failure_reason.is_none());
        assert!(result.failure_modes.is_empty());
        assert!(!result.metadata.contains_key("known_failure_modes"));
    }

    #[tokio::test]
    async fn test_run_records_triggered_failure_modes() {
        let result = KeywordSignal.run(&ContentInput::Text("hi".into())).await;
        assert!(result.applicable);
        assert!(result.failure_modes.contains("short_text"));
    }

    #[tokio::test]
    async fn test_run_short_circuits_inapplicable_input() {
        let result = KeywordSignal.run(&ContentInput::Text(String::new())).await;
        assert!(!result.applicable);
        assert_eq!(result.failure_reason.as_deref(), Some("empty text"));
        assert_eq!(result.score, 0.0);
        assert_eq!(result.confidence, 0.0);
    }

    #[tokio::test]
    async fn test_run_isolates_extraction_errors() {
        let input = ContentInput::Text("PANIC_FREE_ERROR in the text".into());
        let result = KeywordSignal.run(&input).await;
        assert!(!result.applicable);
        assert!(result.failure_reason.unwrap().contains("extractor refused input"));
        assert!(result.failure_modes.contains("signal_error"));
        assert_eq!(
            result.metadata["known_failure_modes"],
            serde_json::json!(["short_text"])
        );
    }

    #[tokio::test]
    async fn test_run_rejects_wrong_modality() {
        let input = ContentInput::Audio {
            samples: vec![0.0; 16],
            sample_rate: 16_000,
        };
        let result = KeywordSignal.run(&input).await;
        assert!(!result.applicable);
        assert!(result.failure_reason.unwrap().starts_with("modality_mismatch"));
    }

    #[test]
    fn test_detection_result_defaults_and_clamping() {
        let default = DetectionResult::default();
        assert!(!default.applicable);
        assert_eq!(default.score, 0.0);
        assert_eq!(default.confidence, 0.0);
        assert_eq!(default.failure_reason.as_deref(), Some("not_run"));

        let clamped = DetectionResult::new(1.7, -0.2);
        assert_eq!(clamped.score, 1.0);
        assert_eq!(clamped.confidence, 0.0);
        assert!(!clamped.contributes());
    }

    #[test]
    fn test_modality_serde_lowercase() {
        assert_eq!(serde_json::to_string(&Modality::Audio).unwrap(), "\"audio\"");
        let parsed: Modality = serde_json::from_str("\"image\"").unwrap();
        assert_eq!(parsed, Modality::Image);
    }
}
