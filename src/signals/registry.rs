//! Signal Registry
//!
//! Holds the available signals per modality in registration order. Lookups are pure;
//! the registry is filled during start-up and only read while requests are served.

use super::core::{Modality, Signal};
use crate::config::SignalSelection;
use crate::error::{DetectionError, Result};
use log::{debug, info};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Registry entry for one signal
#[derive(Clone)]
pub struct SignalDescriptor {
    pub name: String,
    pub modality: Modality,
    pub weight: f64,
    pub signal: Arc<dyn Signal>,
}

impl SignalDescriptor {
    /// Describe a signal with the given default fusion weight
    pub fn new(signal: Arc<dyn Signal>, weight: f64) -> Result<Self> {
        let name = signal.name().to_string();
        validate_weight(&name, weight)?;
        Ok(Self {
            modality: signal.modality(),
            name,
            weight,
            signal,
        })
    }

    /// Same signal, different fusion weight
    pub fn with_weight(&self, weight: f64) -> Result<Self> {
        validate_weight(&self.name, weight)?;
        Ok(Self {
            weight,
            ..self.clone()
        })
    }
}

impl fmt::Debug for SignalDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalDescriptor")
            .field("name", &self.name)
            .field("modality", &self.modality)
            .field("weight", &self.weight)
            .finish_non_exhaustive()
    }
}

fn validate_weight(name: &str, weight: f64) -> Result<()> {
    if !weight.is_finite() || weight < 0.0 {
        return Err(DetectionError::InvalidWeight {
            name: name.to_string(),
            weight,
        });
    }
    Ok(())
}

/// Per-modality mapping from signal name to descriptor
#[derive(Debug, Default, Clone)]
pub struct SignalRegistry {
    modalities: HashMap<Modality, Vec<SignalDescriptor>>,
}

impl SignalRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a descriptor, rejecting a name already taken in its modality
    pub fn register(&mut self, descriptor: SignalDescriptor) -> Result<()> {
        let entries = self.modalities.entry(descriptor.modality).or_default();
        if entries.iter().any(|d| d.name == descriptor.name) {
            return Err(DetectionError::DuplicateName {
                name: descriptor.name,
                modality: descriptor.modality,
            });
        }

        info!(
            "Registered signal {} for {} (weight {:.3})",
            descriptor.name, descriptor.modality, descriptor.weight
        );
        entries.push(descriptor);
        Ok(())
    }

    /// Convenience wrapper building the descriptor from the signal itself
    pub fn register_signal(&mut self, signal: Arc<dyn Signal>, weight: f64) -> Result<()> {
        self.register(SignalDescriptor::new(signal, weight)?)
    }

    /// All descriptors of a modality in registration order
    pub fn list(&self, modality: Modality) -> &[SignalDescriptor] {
        self.modalities
            .get(&modality)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn get(&self, name: &str, modality: Modality) -> Option<&SignalDescriptor> {
        self.list(modality).iter().find(|d| d.name == name)
    }

    /// Look up descriptors by name, in the order requested
    pub fn resolve<S: AsRef<str>>(
        &self,
        names: &[S],
        modality: Modality,
    ) -> Result<Vec<SignalDescriptor>> {
        names
            .iter()
            .map(|name| {
                let name = name.as_ref();
                self.get(name, modality)
                    .cloned()
                    .ok_or_else(|| DetectionError::UnknownSignal {
                        name: name.to_string(),
                        modality,
                    })
            })
            .collect()
    }

    /// Resolve a configured selection, applying per-selection weight overrides
    pub fn select(
        &self,
        selections: &[SignalSelection],
        modality: Modality,
    ) -> Result<Vec<SignalDescriptor>> {
        let names: Vec<&str> = selections.iter().map(|s| s.name.as_str()).collect();
        let resolved = self.resolve(&names, modality)?;

        resolved
            .into_iter()
            .zip(selections)
            .map(|(descriptor, selection)| match selection.weight {
                Some(weight) => {
                    debug!(
                        "Overriding weight of {} for {}: {:.3} -> {:.3}",
                        descriptor.name, modality, descriptor.weight, weight
                    );
                    descriptor.with_weight(weight)
                }
                None => Ok(descriptor),
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.modalities.values().all(Vec::is_empty)
    }
}

/// Process-wide registry: installed once at start-up, read-only afterwards.
pub mod global {
    use super::SignalRegistry;
    use crate::error::{DetectionError, Result};
    use log::info;
    use parking_lot::RwLock;
    use std::sync::Arc;

    static GLOBAL_REGISTRY: RwLock<Option<Arc<SignalRegistry>>> = RwLock::new(None);

    /// Install the process registry; fails if one is already installed
    pub fn install(registry: SignalRegistry) -> Result<Arc<SignalRegistry>> {
        let mut slot = GLOBAL_REGISTRY.write();
        if slot.is_some() {
            return Err(DetectionError::Config(
                "global signal registry already installed".to_string(),
            ));
        }
        let registry = Arc::new(registry);
        *slot = Some(Arc::clone(&registry));
        info!("Installed global signal registry");
        Ok(registry)
    }

    pub fn get() -> Option<Arc<SignalRegistry>> {
        GLOBAL_REGISTRY.read().clone()
    }

    /// Return the installed registry, building it on first use
    pub fn get_or_init<F>(init: F) -> Result<Arc<SignalRegistry>>
    where
        F: FnOnce() -> Result<SignalRegistry>,
    {
        if let Some(registry) = get() {
            return Ok(registry);
        }

        let mut slot = GLOBAL_REGISTRY.write();
        // Another caller may have initialised it between the read and the write lock.
        if let Some(registry) = slot.as_ref() {
            return Ok(Arc::clone(registry));
        }
        let registry = Arc::new(init()?);
        *slot = Some(Arc::clone(&registry));
        info!("Lazily initialised global signal registry");
        Ok(registry)
    }

    /// Drop the installed registry. Intended for test isolation.
    pub fn reset() {
        *GLOBAL_REGISTRY.write() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::core::{ContentInput, FeatureSet, SignalScore};
    use async_trait::async_trait;

    struct FixedSignal {
        name: &'static str,
        modality: Modality,
    }

    #[async_trait]
    impl Signal for FixedSignal {
        fn name(&self) -> &str {
            self.name
        }

        fn modality(&self) -> Modality {
            self.modality
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

    fn fixed(name: &'static str, modality: Modality) -> Arc<dyn Signal> {
        Arc::new(FixedSignal { name, modality })
    }

    #[test]
    fn test_register_rejects_duplicate_within_modality() {
        let mut registry = SignalRegistry::new();
        registry.register_signal(fixed("entropy", Modality::Text), 1.0).unwrap();

        let err = registry
            .register_signal(fixed("entropy", Modality::Text), 2.0)
            .unwrap_err();
        assert!(matches!(err, DetectionError::DuplicateName { .. }));

        // Same name in another modality is fine
        registry.register_signal(fixed("entropy", Modality::Audio), 1.0).unwrap();
    }

    #[test]
    fn test_list_preserves_registration_order() {
        let mut registry = SignalRegistry::new();
        for name in ["zeta", "alpha", "mid"] {
            registry.register_signal(fixed(name, Modality::Image), 1.0).unwrap();
        }

        let names: Vec<&str> = registry
            .list(Modality::Image)
            .iter()
            .map(|d| d.name.as_str())
            .collect();
        assert_eq!(names, vec!["zeta", "alpha", "mid"]);
        assert!(registry.list(Modality::Audio).is_empty());
    }

    #[test]
    fn test_resolve_unknown_name() {
        let mut registry = SignalRegistry::new();
        registry.register_signal(fixed("a", Modality::Text), 1.0).unwrap();

        let err = registry.resolve(&["a", "missing"], Modality::Text).unwrap_err();
        match err {
            DetectionError::UnknownSignal { name, modality } => {
                assert_eq!(name, "missing");
                assert_eq!(modality, Modality::Text);
            }
            other => panic!("unexpected error: {other:?}"),
        }

        // Registered under a different modality is still unknown
        assert!(registry.resolve(&["a"], Modality::Image).is_err());
    }

    #[test]
    fn test_select_applies_weight_overrides() {
        let mut registry = SignalRegistry::new();
        registry.register_signal(fixed("a", Modality::Text), 1.0).unwrap();
        registry.register_signal(fixed("b", Modality::Text), 1.0).unwrap();

        let selections = vec![
            SignalSelection {
                name: "b".into(),
                weight: Some(3.0),
            },
            SignalSelection {
                name: "a".into(),
                weight: None,
            },
        ];
        let selected = registry.select(&selections, Modality::Text).unwrap();
        assert_eq!(selected[0].name, "b");
        assert_eq!(selected[0].weight, 3.0);
        assert_eq!(selected[1].name, "a");
        assert_eq!(selected[1].weight, 1.0);
    }

    #[test]
    fn test_invalid_weight_rejected() {
        let err = SignalDescriptor::new(fixed("a", Modality::Text), -1.0).unwrap_err();
        assert!(matches!(err, DetectionError::InvalidWeight { .. }));
        assert!(SignalDescriptor::new(fixed("a", Modality::Text), f64::NAN).is_err());
    }
}
