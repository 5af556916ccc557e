//! Error types for registry, fusion and calibration.
//!
//! Failures inside a single signal never surface here: `Signal::run` converts them into
//! an inapplicable `DetectionResult`. Everything in this enum makes a whole verdict (or a
//! whole configuration) meaningless and is therefore returned to the caller.

use crate::signals::core::Modality;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DetectionError {
    #[error("unknown signal '{name}' for modality {modality}")]
    UnknownSignal { name: String, modality: Modality },

    #[error("signal '{name}' is already registered for modality {modality}")]
    DuplicateName { name: String, modality: Modality },

    #[error("no applicable signal among {selected} selected")]
    NoApplicableSignal { selected: usize },

    #[error("invalid weight {weight} for signal '{name}'")]
    InvalidWeight { name: String, weight: f64 },

    #[error("invalid calibration table: {0}")]
    InvalidCalibrationTable(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, DetectionError>;
