//! Detector pipeline
//!
//! Selects signals for the input's modality, runs them concurrently, fuses the applicable
//! results, calibrates the raw probability and attaches failure-mode reporting.

use crate::calibration::{CalibrationStore, signal_set_fingerprint};
use crate::config::DetectorConfig;
use crate::error::{DetectionError, Result};
use crate::fusion::{FusionEngine, LogisticFusionModel};
use crate::report::{FailureReporter, FusedOutput};
use crate::signals::core::{ContentInput, DetectionResult, Modality};
use crate::signals::registry::{SignalDescriptor, SignalRegistry, global};
use crate::signals::runner::SignalRunner;
use log::{debug, info};
use std::collections::HashMap;
use std::sync::Arc;

/// End-to-end detector for one or more modalities
pub struct Detector {
    registry: Arc<SignalRegistry>,
    /// Selections resolved from configuration; other modalities run every registered signal
    selections: HashMap<Modality, Vec<SignalDescriptor>>,
    runner: SignalRunner,
    fusion: FusionEngine,
    calibration: Arc<CalibrationStore>,
    reporter: FailureReporter,
}

impl Detector {
    pub fn builder() -> DetectorBuilder {
        DetectorBuilder::new()
    }

    /// Signals that will run for a modality, in reporting order
    pub fn selected(&self, modality: Modality) -> Vec<SignalDescriptor> {
        match self.selections.get(&modality) {
            Some(descriptors) => descriptors.clone(),
            None => self.registry.list(modality).to_vec(),
        }
    }

    pub fn fusion(&self) -> &FusionEngine {
        &self.fusion
    }

    pub fn calibration(&self) -> &CalibrationStore {
        &self.calibration
    }

    /// Produce a verdict for one content item.
    ///
    /// Signal failures never fail the call. An input no selected signal can analyse yields
    /// an undetermined verdict rather than an error.
    pub async fn detect(&self, input: ContentInput) -> Result<FusedOutput> {
        let modality = input.modality();
        let descriptors = self.selected(modality);
        debug!(
            "Running {} signals for {} input",
            descriptors.len(),
            modality
        );

        let entries = self.runner.run_all(&descriptors, Arc::new(input)).await;
        self.assemble(modality, &entries)
    }

    /// Fuse, calibrate and report already-computed signal results
    pub fn assemble(
        &self,
        modality: Modality,
        entries: &[(SignalDescriptor, DetectionResult)],
    ) -> Result<FusedOutput> {
        let mut report = self.reporter.collect(entries);

        let outcome = match self.fusion.fuse(entries) {
            Ok(outcome) => outcome,
            Err(DetectionError::NoApplicableSignal { selected }) => {
                report.note_undetermined(selected);
                info!(
                    "Verdict for {} input undetermined ({} signals selected)",
                    modality, selected
                );
                return Ok(FusedOutput::undetermined(report));
            }
            Err(e) => return Err(e),
        };
        report.note_fusion(&outcome);

        let names: Vec<&str> = entries.iter().map(|(d, _)| d.name.as_str()).collect();
        let fingerprint = signal_set_fingerprint(&names);
        let calibration = self
            .calibration
            .calibrate(outcome.probability, modality, &fingerprint);
        report.note_calibration(&calibration, modality, &fingerprint);

        info!(
            "Verdict for {} input: probability {:.3} (raw {:.3}), confidence {:.3}, {} of {} signals contributed",
            modality,
            calibration.probability,
            outcome.probability,
            outcome.confidence,
            outcome.contributing.len(),
            entries.len()
        );

        Ok(FusedOutput::determined(&outcome, calibration, report))
    }
}

/// Builder for [`Detector`]
pub struct DetectorBuilder {
    registry: Option<Arc<SignalRegistry>>,
    config: DetectorConfig,
    calibration: Option<CalibrationStore>,
    learned_model: Option<LogisticFusionModel>,
}

impl DetectorBuilder {
    pub fn new() -> Self {
        Self {
            registry: None,
            config: DetectorConfig::default(),
            calibration: None,
            learned_model: None,
        }
    }

    pub fn with_registry(mut self, registry: Arc<SignalRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_config(mut self, config: DetectorConfig) -> Self {
        self.config = config;
        self
    }

    /// Use this store instead of loading `calibration.table_dir`
    pub fn with_calibration(mut self, store: CalibrationStore) -> Self {
        self.calibration = Some(store);
        self
    }

    /// Use this model instead of loading `fusion.learned_model_path`
    pub fn with_learned_model(mut self, model: LogisticFusionModel) -> Self {
        self.learned_model = Some(model);
        self
    }

    /// Validate configuration and resolve every configured selection.
    ///
    /// Without an explicit registry the process-wide one is used.
    pub fn build(self) -> Result<Detector> {
        self.config.validate()?;

        let registry = match self.registry {
            Some(registry) => registry,
            None => global::get().ok_or_else(|| {
                DetectionError::Config("no signal registry given or installed".to_string())
            })?,
        };

        let mut selections = HashMap::new();
        for (modality, configured) in &self.config.modalities {
            let descriptors = registry.select(configured, *modality)?;
            debug!(
                "Selected {} signals for {}: {:?}",
                descriptors.len(),
                modality,
                descriptors.iter().map(|d| d.name.as_str()).collect::<Vec<_>>()
            );
            selections.insert(*modality, descriptors);
        }

        let calibration = match (self.calibration, &self.config.calibration.table_dir) {
            (Some(store), _) => store,
            (None, Some(dir)) => CalibrationStore::load_dir(dir)?,
            (None, None) => CalibrationStore::new(),
        };

        let learned_model = match (self.learned_model, &self.config.fusion.learned_model_path) {
            (Some(model), _) => {
                model.validate()?;
                Some(model)
            }
            (None, Some(path)) => Some(LogisticFusionModel::load_from_file(path)?),
            (None, None) => None,
        };

        let mut fusion = FusionEngine::new(&self.config.fusion);
        if let Some(model) = learned_model {
            fusion = fusion.with_learned_model(Arc::new(model));
        }

        info!(
            "Detector ready: {:?} fusion, {} calibration tables, {}ms signal timeout",
            fusion.strategy(),
            calibration.len(),
            self.config.signal_timeout_ms
        );

        Ok(Detector {
            registry,
            selections,
            runner: SignalRunner::new(self.config.signal_timeout()),
            fusion,
            calibration: Arc::new(calibration),
            reporter: FailureReporter::new(self.config.majority_inapplicable_ratio),
        })
    }
}

impl Default for DetectorBuilder {
    fn default() -> Self {
        Self::new()
    }
}
