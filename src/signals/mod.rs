//! Signal Module
//!
//! The contract every detector implements, the registry that composes detectors per
//! modality, and the runner that invokes them concurrently with failure isolation.

pub mod core;
pub mod registry;
pub mod runner;
pub mod utils;

// Re-export core types for easy access
pub use self::core::{
    ContentInput, DetectionResult, FailureMode, FeatureSet, Modality, Signal, SignalScore,
};
pub use self::registry::{SignalDescriptor, SignalRegistry};
pub use self::runner::SignalRunner;
pub use self::utils::ConfidenceUtils;
