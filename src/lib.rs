pub mod calibration;
pub mod config;
pub mod detector;
pub mod error;
pub mod fusion;
pub mod report;
pub mod signals;
pub mod stats;

pub use calibration::{CalibrationStore, CalibrationTable, signal_set_fingerprint};
pub use config::{DetectorConfig, SignalSelection};
pub use detector::{Detector, DetectorBuilder};
pub use error::{DetectionError, Result};
pub use fusion::{FusionEngine, FusionOutcome, FusionStrategy, LogisticFusionModel};
pub use report::{FailureReporter, FusedOutput, SignalNote, VerdictStatus};
pub use signals::{
    ContentInput, DetectionResult, FailureMode, FeatureSet, Modality, Signal, SignalDescriptor,
    SignalRegistry, SignalScore,
};
