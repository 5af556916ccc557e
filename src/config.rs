use crate::error::{DetectionError, Result};
use crate::fusion::FusionStrategy;
use crate::signals::core::Modality;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_SIGNAL_TIMEOUT_MS: u64 = 30_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// Signals to run per modality, in reporting order. A modality missing here runs
    /// every signal registered for it.
    #[serde(default)]
    pub modalities: BTreeMap<Modality, Vec<SignalSelection>>,
    #[serde(default)]
    pub fusion: FusionConfig,
    #[serde(default)]
    pub calibration: CalibrationConfig,
    #[serde(default = "default_signal_timeout_ms")]
    pub signal_timeout_ms: u64,
    /// Fraction of inapplicable signals above which a warning is raised
    #[serde(default = "default_majority_inapplicable_ratio")]
    pub majority_inapplicable_ratio: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalSelection {
    pub name: String,
    /// Overrides the descriptor's default weight
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<f64>,
}

impl SignalSelection {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            weight: None,
        }
    }

    pub fn weighted(name: impl Into<String>, weight: f64) -> Self {
        Self {
            name: name.into(),
            weight: Some(weight),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FusionConfig {
    #[serde(default)]
    pub strategy: FusionStrategy,
    /// Normalized score variance at or above which signals count as disagreeing
    #[serde(default = "default_disagreement_warning_threshold")]
    pub disagreement_warning_threshold: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub learned_model_path: Option<PathBuf>,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            strategy: FusionStrategy::default(),
            disagreement_warning_threshold: default_disagreement_warning_threshold(),
            learned_model_path: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CalibrationConfig {
    /// Directory of versioned calibration table files
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table_dir: Option<PathBuf>,
}

fn default_signal_timeout_ms() -> u64 {
    DEFAULT_SIGNAL_TIMEOUT_MS
}

fn default_majority_inapplicable_ratio() -> f64 {
    0.5
}

fn default_disagreement_warning_threshold() -> f64 {
    0.25 // score standard deviation of 0.25 on a [0, 1] scale
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            modalities: BTreeMap::new(),
            fusion: FusionConfig::default(),
            calibration: CalibrationConfig::default(),
            signal_timeout_ms: default_signal_timeout_ms(),
            majority_inapplicable_ratio: default_majority_inapplicable_ratio(),
        }
    }
}

impl DetectorConfig {
    /// Load configuration from a JSON file, using defaults when the file does not exist
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let config = match fs::read_to_string(path) {
            Ok(contents) => {
                info!("Loading detector configuration from {}", path.display());
                serde_json::from_str::<DetectorConfig>(&contents)?
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!(
                    "Configuration file {} not found, using defaults",
                    path.display()
                );
                DetectorConfig::default()
            }
            Err(e) => return Err(e.into()),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: DetectorConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.signal_timeout_ms == 0 {
            return Err(DetectionError::Config(
                "signal_timeout_ms must be greater than zero".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.majority_inapplicable_ratio) {
            return Err(DetectionError::Config(format!(
                "majority_inapplicable_ratio must be between 0.0 and 1.0, got: {}",
                self.majority_inapplicable_ratio
            )));
        }

        let threshold = self.fusion.disagreement_warning_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(DetectionError::Config(format!(
                "disagreement_warning_threshold must be between 0.0 and 1.0, got: {}",
                threshold
            )));
        }

        for (modality, selections) in &self.modalities {
            let mut seen = HashSet::new();
            for selection in selections {
                if !seen.insert(selection.name.as_str()) {
                    return Err(DetectionError::Config(format!(
                        "signal '{}' selected twice for {}",
                        selection.name, modality
                    )));
                }
                if let Some(weight) = selection.weight {
                    if !weight.is_finite() || weight < 0.0 {
                        return Err(DetectionError::InvalidWeight {
                            name: selection.name.clone(),
                            weight,
                        });
                    }
                }
            }
        }

        Ok(())
    }

    pub fn signal_timeout(&self) -> Duration {
        Duration::from_millis(self.signal_timeout_ms)
    }

    pub fn selections(&self, modality: Modality) -> Option<&[SignalSelection]> {
        self.modalities.get(&modality).map(Vec::as_slice)
    }
}
