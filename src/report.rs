//! Failure-Mode Reporter and final output
//!
//! Surfaces per-signal failure reasons, triggered failure modes and global warnings.
//! Nothing here scores: the reporter only adds information next to the probability the
//! fusion and calibration steps produced.

use crate::calibration::CalibrationOutcome;
use crate::fusion::{FusionOutcome, FusionStrategy};
use crate::signals::core::{DetectionResult, FailureMode, Modality};
use crate::signals::registry::SignalDescriptor;
use log::debug;
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeSet;
use std::fmt;
use std::marker::PhantomData;

/// Name-keyed map that keeps selection order when serialised
#[derive(Debug, Clone, PartialEq)]
pub struct SignalMap<T>(Vec<(String, T)>);

impl<T> SignalMap<T> {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Insert or replace, keeping the original position of an existing key
    pub fn insert(&mut self, name: impl Into<String>, value: T) {
        let name = name.into();
        match self.0.iter_mut().find(|(key, _)| *key == name) {
            Some((_, existing)) => *existing = value,
            None => self.0.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&T> {
        self.0.iter().find(|(key, _)| key == name).map(|(_, v)| v)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(key, _)| key.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &T)> {
        self.0.iter().map(|(key, value)| (key.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<T> Default for SignalMap<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Serialize> Serialize for SignalMap<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (key, value) in &self.0 {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for SignalMap<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct SignalMapVisitor<T>(PhantomData<T>);

        impl<'de, T: Deserialize<'de>> Visitor<'de> for SignalMapVisitor<T> {
            type Value = SignalMap<T>;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map keyed by signal name")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut map = SignalMap::new();
                while let Some((key, value)) = access.next_entry::<String, T>()? {
                    map.insert(key, value);
                }
                Ok(map)
            }
        }

        deserializer.deserialize_map(SignalMapVisitor(PhantomData))
    }
}

/// Per-signal applicability as shown to the caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalNote {
    pub applicable: bool,
    pub notes: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictStatus {
    Determined,
    /// No signal could analyse the input; there is deliberately no probability
    Undetermined,
}

/// Surfacing collected for one detection request
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FailureReport {
    pub signals: SignalMap<f64>,
    pub signal_metadata: SignalMap<SignalNote>,
    pub failure_modes: BTreeSet<String>,
    pub warnings: Vec<String>,
}

impl FailureReport {
    fn flag(&mut self, mode: FailureMode, message: String) {
        self.failure_modes.insert(mode.as_str().to_string());
        self.warnings.push(format!("{}: {}", mode, message));
    }

    /// Record conditions the fusion engine noticed
    pub fn note_fusion(&mut self, outcome: &FusionOutcome) {
        for note in &outcome.notes {
            let message = match note {
                FailureMode::HighDisagreement => format!(
                    "high inter-signal disagreement (normalized score variance {:.3}); confidence reduced to {:.3}",
                    outcome.disagreement, outcome.confidence
                ),
                FailureMode::LearnedFusionUnavailable => {
                    "learned fusion model unavailable for this signal set; used weighted average"
                        .to_string()
                }
                other => other.as_str().replace('_', " "),
            };
            self.flag(*note, message);
        }
    }

    /// Record that no probability could be produced
    pub fn note_undetermined(&mut self, selected: usize) {
        self.flag(
            FailureMode::NoApplicableSignals,
            format!(
                "none of the {} selected signals could analyse this input; verdict undetermined",
                selected
            ),
        );
    }

    /// Record a calibration miss
    pub fn note_calibration(
        &mut self,
        outcome: &CalibrationOutcome,
        modality: Modality,
        fingerprint: &str,
    ) {
        if !outcome.is_calibrated() {
            self.flag(
                FailureMode::Uncalibrated,
                format!(
                    "no calibration available for {}/{}; probability is the raw fused score",
                    modality, fingerprint
                ),
            );
        }
    }
}

#[derive(Debug, Clone)]
pub struct FailureReporter {
    majority_inapplicable_ratio: f64,
}

impl FailureReporter {
    pub fn new(majority_inapplicable_ratio: f64) -> Self {
        Self {
            majority_inapplicable_ratio,
        }
    }

    /// Collect per-signal surfacing and input-level warnings from raw results
    pub fn collect(&self, entries: &[(SignalDescriptor, DetectionResult)]) -> FailureReport {
        let mut report = FailureReport::default();

        for (descriptor, result) in entries {
            report.signals.insert(descriptor.name.as_str(), result.score);
            report.signal_metadata.insert(
                descriptor.name.as_str(),
                SignalNote {
                    applicable: result.applicable,
                    notes: signal_notes(descriptor, result),
                },
            );
            report
                .failure_modes
                .extend(result.failure_modes.iter().cloned());

            if result.failure_modes.contains(FailureMode::Timeout.as_str()) {
                report.warnings.push(format!(
                    "{}: signal '{}' did not finish in time",
                    FailureMode::Timeout,
                    descriptor.name
                ));
            } else if result.failure_modes.contains(FailureMode::SignalError.as_str()) {
                report.warnings.push(format!(
                    "{}: signal '{}' failed: {}",
                    FailureMode::SignalError,
                    descriptor.name,
                    result.failure_reason.as_deref().unwrap_or("unknown error")
                ));
            }
        }

        let inapplicable = entries.iter().filter(|(_, r)| !r.applicable).count();
        if !entries.is_empty()
            && inapplicable > 0
            && inapplicable as f64 / entries.len() as f64 > self.majority_inapplicable_ratio
        {
            report.flag(
                FailureMode::MajorityInapplicable,
                format!(
                    "majority of signals inapplicable ({} of {})",
                    inapplicable,
                    entries.len()
                ),
            );
        }

        debug!(
            "Collected report for {} signals: {} failure modes, {} warnings",
            entries.len(),
            report.failure_modes.len(),
            report.warnings.len()
        );
        report
    }
}

impl Default for FailureReporter {
    fn default() -> Self {
        Self::new(0.5)
    }
}

fn signal_notes(descriptor: &SignalDescriptor, result: &DetectionResult) -> String {
    let mut notes = Vec::new();

    if let Some(reason) = &result.failure_reason {
        notes.push(reason.clone());
    } else if result.confidence == 0.0 {
        notes.push("zero confidence; excluded from fusion".to_string());
    } else if descriptor.weight == 0.0 {
        notes.push("zero weight; excluded from fusion".to_string());
    }

    let triggered: Vec<&str> = result
        .failure_modes
        .iter()
        .map(String::as_str)
        .filter(|mode| *mode != FailureMode::Timeout.as_str() && *mode != FailureMode::SignalError.as_str())
        .collect();
    if !triggered.is_empty() {
        notes.push(format!("triggered: {}", triggered.join(", ")));
    }

    notes.join("; ")
}

/// Final structured verdict for one content item. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusedOutput {
    pub status: VerdictStatus,
    /// `None` (JSON `null`) exactly when the verdict is undetermined
    pub ai_generated_probability: Option<f64>,
    pub confidence: f64,
    pub signals: SignalMap<f64>,
    pub signal_metadata: SignalMap<SignalNote>,
    pub failure_modes: BTreeSet<String>,
    pub warnings: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<FusionStrategy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calibration_version: Option<String>,
}

impl FusedOutput {
    pub fn determined(
        fusion: &FusionOutcome,
        calibration: CalibrationOutcome,
        report: FailureReport,
    ) -> Self {
        Self {
            status: VerdictStatus::Determined,
            ai_generated_probability: Some(calibration.probability),
            confidence: fusion.confidence,
            signals: report.signals,
            signal_metadata: report.signal_metadata,
            failure_modes: report.failure_modes,
            warnings: report.warnings,
            strategy: Some(fusion.strategy),
            calibration_version: calibration.table_version,
        }
    }

    pub fn undetermined(report: FailureReport) -> Self {
        Self {
            status: VerdictStatus::Undetermined,
            ai_generated_probability: None,
            confidence: 0.0,
            signals: report.signals,
            signal_metadata: report.signal_metadata,
            failure_modes: report.failure_modes,
            warnings: report.warnings,
            strategy: None,
            calibration_version: None,
        }
    }

    pub fn is_undetermined(&self) -> bool {
        self.status == VerdictStatus::Undetermined
    }

    pub fn has_failure_mode(&self, mode: FailureMode) -> bool {
        self.failure_modes.contains(mode.as_str())
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::core::{ContentInput, FeatureSet, Signal, SignalScore};
    use async_trait::async_trait;
    use std::sync::Arc;

    struct Named(&'static str);

    #[async_trait]
    impl Signal for Named {
        fn name(&self) -> &str {
            self.0
        }

        fn modality(&self) -> Modality {
            Modality::Audio
        }

        fn is_applicable(&self, _input: &ContentInput) -> bool {
            true
        }

        async fn extract_features(&self, _input: &ContentInput) -> anyhow::Result<FeatureSet> {
            Ok(FeatureSet::new())
        }

        fn score(&self, _features: &FeatureSet) -> anyhow::Result<SignalScore> {
            Ok(SignalScore::new(0.5, 0.5))
        }
    }

    fn entry(name: &'static str, result: DetectionResult) -> (SignalDescriptor, DetectionResult) {
        (
            SignalDescriptor::new(Arc::new(Named(name)), 1.0).unwrap(),
            result,
        )
    }

    #[test]
    fn test_collect_preserves_order_and_notes() {
        let reporter = FailureReporter::default();
        let report = reporter.collect(&[
            entry("spectral", DetectionResult::new(0.7, 0.8).with_failure_mode("short_clip")),
            entry("breathing", DetectionResult::not_applicable("sample rate below 16kHz")),
            entry("silence", DetectionResult::timed_out()),
        ]);

        let keys: Vec<&str> = report.signals.keys().collect();
        assert_eq!(keys, vec!["spectral", "breathing", "silence"]);

        let spectral = report.signal_metadata.get("spectral").unwrap();
        assert!(spectral.applicable);
        assert_eq!(spectral.notes, "triggered: short_clip");

        let breathing = report.signal_metadata.get("breathing").unwrap();
        assert!(!breathing.applicable);
        assert_eq!(breathing.notes, "sample rate below 16kHz");

        assert!(report.failure_modes.contains("short_clip"));
        assert!(report.failure_modes.contains("timeout"));
        assert!(report.failure_modes.contains("majority_inapplicable"));
        assert!(report.warnings.iter().any(|w| w.starts_with("timeout: signal 'silence'")));
    }

    #[test]
    fn test_half_inapplicable_is_not_majority() {
        let report = FailureReporter::default().collect(&[
            entry("a", DetectionResult::new(0.7, 0.8)),
            entry("b", DetectionResult::not_applicable("too short")),
        ]);
        assert!(!report.failure_modes.contains("majority_inapplicable"));
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn test_signal_errors_surface_as_warnings() {
        let report = FailureReporter::default().collect(&[
            entry("a", DetectionResult::new(0.7, 0.8)),
            entry("b", DetectionResult::new(0.2, 0.8)),
            entry("c", DetectionResult::failed("CUDA out of memory")),
        ]);
        assert!(report.failure_modes.contains("signal_error"));
        assert_eq!(
            report.warnings,
            vec!["signal_error: signal 'c' failed: CUDA out of memory".to_string()]
        );
    }

    #[test]
    fn test_note_calibration_only_on_miss() {
        let mut report = FailureReport::default();
        report.note_calibration(
            &CalibrationOutcome {
                probability: 0.4,
                table_version: Some("v2".into()),
            },
            Modality::Text,
            "a",
        );
        assert!(report.warnings.is_empty());

        report.note_calibration(
            &CalibrationOutcome {
                probability: 0.4,
                table_version: None,
            },
            Modality::Text,
            "a",
        );
        assert!(report.failure_modes.contains("uncalibrated"));
        assert!(report.warnings[0].starts_with("uncalibrated"));
    }

    #[test]
    fn test_output_schema_and_key_order() {
        let mut report = FailureReporter::default().collect(&[
            entry("zeta", DetectionResult::new(0.9, 1.0)),
            entry("alpha", DetectionResult::new(0.8, 1.0)),
        ]);
        let calibration = CalibrationOutcome {
            probability: 0.85,
            table_version: None,
        };
        report.note_calibration(&calibration, Modality::Audio, "alpha+zeta");
        let fusion = FusionOutcome {
            probability: 0.85,
            confidence: 0.99,
            strategy: FusionStrategy::WeightedAverage,
            contributing: vec!["zeta".into(), "alpha".into()],
            disagreement: 0.01,
            notes: vec![],
        };
        let output = FusedOutput::determined(&fusion, calibration, report);

        let json = output.to_json().unwrap();
        assert!(json.find("\"zeta\"").unwrap() < json.find("\"alpha\"").unwrap());

        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["ai_generated_probability"], 0.85);
        assert_eq!(value["signal_metadata"]["alpha"]["applicable"], true);
        assert_eq!(value["failure_modes"][0], "uncalibrated");
        assert_eq!(value["status"], "determined");

        let parsed: FusedOutput = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, output);
    }

    #[test]
    fn test_undetermined_output_has_null_probability() {
        let mut report = FailureReporter::default().collect(&[entry(
            "a",
            DetectionResult::not_applicable("silent clip"),
        )]);
        report.note_undetermined(1);
        let output = FusedOutput::undetermined(report);

        assert!(output.is_undetermined());
        assert!(output.has_failure_mode(FailureMode::NoApplicableSignals));
        let value: serde_json::Value = serde_json::to_value(&output).unwrap();
        assert!(value["ai_generated_probability"].is_null());
        assert_eq!(value["confidence"], 0.0);
    }
}
