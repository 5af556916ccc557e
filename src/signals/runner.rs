//! Concurrent, isolated signal execution
//!
//! Each selected signal runs in its own tokio task under its own time box. A panic or
//! timeout in one task becomes an inapplicable result for that signal only; siblings
//! keep running and every result is awaited before fusion starts.

use super::core::{ContentInput, DetectionResult};
use super::registry::SignalDescriptor;
use futures::future::join_all;
use log::{debug, warn};
use std::any::Any;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::{AbortHandle, JoinHandle};

#[derive(Debug, Clone)]
pub struct SignalRunner {
    timeout: Duration,
}

impl SignalRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run every descriptor's signal against the input and pair each with its result.
    ///
    /// Output order follows `descriptors`. The time box only interrupts signals at an
    /// await point; CPU-bound extraction should hand off to `spawn_blocking` itself.
    /// Dropping the returned future aborts every signal task still in flight.
    pub async fn run_all(
        &self,
        descriptors: &[SignalDescriptor],
        input: Arc<ContentInput>,
    ) -> Vec<(SignalDescriptor, DetectionResult)> {
        let handles: Vec<JoinHandle<DetectionResult>> = descriptors
            .iter()
            .map(|descriptor| {
                let signal = Arc::clone(&descriptor.signal);
                let input = Arc::clone(&input);
                let timeout = self.timeout;
                let name = descriptor.name.clone();

                tokio::spawn(async move {
                    let started = Instant::now();
                    match tokio::time::timeout(timeout, signal.run(&input)).await {
                        Ok(result) => {
                            debug!(
                                "Signal {} settled in {:?} (applicable={})",
                                name,
                                started.elapsed(),
                                result.applicable
                            );
                            result
                        }
                        Err(_) => {
                            warn!("Signal {} timed out after {:?}", name, timeout);
                            DetectionResult::timed_out()
                                .with_known_failure_modes(signal.known_failure_modes())
                        }
                    }
                })
            })
            .collect();

        let _in_flight = AbortOnDrop(handles.iter().map(JoinHandle::abort_handle).collect());

        let tasks = descriptors.iter().zip(handles).map(|(descriptor, handle)| {
            let name = descriptor.name.clone();
            let declared = descriptor.signal.known_failure_modes();
            async move {
                match handle.await {
                    Ok(result) => result,
                    Err(e) if e.is_panic() => {
                        let message = panic_message(e.into_panic());
                        warn!("Signal {} panicked: {}", name, message);
                        DetectionResult::failed(format!("panicked: {}", message))
                            .with_known_failure_modes(declared)
                    }
                    Err(e) => {
                        warn!("Signal {} task cancelled: {}", name, e);
                        DetectionResult::failed(format!("cancelled: {}", e))
                            .with_known_failure_modes(declared)
                    }
                }
            }
        });

        let results = join_all(tasks).await;
        descriptors.iter().cloned().zip(results).collect()
    }
}

/// Aborts the wrapped tasks when dropped; finished tasks are unaffected
struct AbortOnDrop(Vec<AbortHandle>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        for handle in &self.0 {
            handle.abort();
        }
    }
}

impl Default for SignalRunner {
    fn default() -> Self {
        Self::new(Duration::from_millis(crate::config::DEFAULT_SIGNAL_TIMEOUT_MS))
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::core::{FeatureSet, Modality, Signal, SignalScore};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    enum Behaviour {
        Score(f64),
        Sleep(Duration),
        Panic,
    }

    struct ScriptedSignal {
        name: &'static str,
        behaviour: Behaviour,
    }

    #[async_trait]
    impl Signal for ScriptedSignal {
        fn name(&self) -> &str {
            self.name
        }

        fn modality(&self) -> Modality {
            Modality::Text
        }

        fn is_applicable(&self, _input: &ContentInput) -> bool {
            true
        }

        async fn extract_features(&self, _input: &ContentInput) -> anyhow::Result<FeatureSet> {
            match self.behaviour {
                Behaviour::Score(score) => Ok(FeatureSet::new().with_value("score", score)),
                Behaviour::Sleep(duration) => {
                    tokio::time::sleep(duration).await;
                    Ok(FeatureSet::new().with_value("score", 0.5))
                }
                Behaviour::Panic => panic!("model weights corrupted"),
            }
        }

        fn score(&self, features: &FeatureSet) -> anyhow::Result<SignalScore> {
            Ok(SignalScore::new(features.require("score")?, 1.0))
        }
    }

    fn descriptor(name: &'static str, behaviour: Behaviour) -> SignalDescriptor {
        SignalDescriptor::new(Arc::new(ScriptedSignal { name, behaviour }), 1.0).unwrap()
    }

    #[tokio::test]
    async fn test_timeout_and_panic_do_not_affect_siblings() {
        let descriptors = vec![
            descriptor("fast", Behaviour::Score(0.8)),
            descriptor("slow", Behaviour::Sleep(Duration::from_secs(5))),
            descriptor("broken", Behaviour::Panic),
            descriptor("also_fast", Behaviour::Score(0.3)),
        ];
        let runner = SignalRunner::new(Duration::from_millis(50));
        let input = Arc::new(ContentInput::Text("some text".into()));

        let results = runner.run_all(&descriptors, input).await;
        let names: Vec<&str> = results.iter().map(|(d, _)| d.name.as_str()).collect();
        assert_eq!(names, vec!["fast", "slow", "broken", "also_fast"]);

        assert!(results[0].1.applicable);
        assert_eq!(results[0].1.score, 0.8);

        assert!(!results[1].1.applicable);
        assert_eq!(results[1].1.failure_reason.as_deref(), Some("timeout"));
        assert!(results[1].1.failure_modes.contains("timeout"));

        assert!(!results[2].1.applicable);
        let reason = results[2].1.failure_reason.clone().unwrap();
        assert!(reason.contains("model weights corrupted"), "reason: {reason}");

        assert!(results[3].1.applicable);
        assert_eq!(results[3].1.score, 0.3);
    }

    struct FlagSignal {
        finished: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Signal for FlagSignal {
        fn name(&self) -> &str {
            "flag"
        }

        fn modality(&self) -> Modality {
            Modality::Text
        }

        fn is_applicable(&self, _input: &ContentInput) -> bool {
            true
        }

        async fn extract_features(&self, _input: &ContentInput) -> anyhow::Result<FeatureSet> {
            tokio::time::sleep(Duration::from_millis(100)).await;
            self.finished.store(true, Ordering::SeqCst);
            Ok(FeatureSet::new().with_value("score", 0.5))
        }

        fn score(&self, features: &FeatureSet) -> anyhow::Result<SignalScore> {
            Ok(SignalScore::new(features.require("score")?, 1.0))
        }

        fn known_failure_modes(&self) -> &'static [&'static str] {
            &["slow_backend"]
        }
    }

    #[tokio::test]
    async fn test_dropping_run_aborts_signal_tasks() {
        let finished = Arc::new(AtomicBool::new(false));
        let descriptors = vec![
            SignalDescriptor::new(
                Arc::new(FlagSignal {
                    finished: Arc::clone(&finished),
                }),
                1.0,
            )
            .unwrap(),
        ];
        let runner = SignalRunner::new(Duration::from_secs(5));
        let input = Arc::new(ContentInput::Text("some text".into()));

        let abandoned = tokio::time::timeout(
            Duration::from_millis(20),
            runner.run_all(&descriptors, input),
        )
        .await;
        assert!(abandoned.is_err());

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_timeout_carries_declared_failure_modes() {
        let descriptors = vec![
            SignalDescriptor::new(
                Arc::new(FlagSignal {
                    finished: Arc::new(AtomicBool::new(false)),
                }),
                1.0,
            )
            .unwrap(),
        ];
        let runner = SignalRunner::new(Duration::from_millis(10));

        let results = runner
            .run_all(&descriptors, Arc::new(ContentInput::Text("text".into())))
            .await;

        assert!(results[0].1.failure_modes.contains("timeout"));
        assert_eq!(
            results[0].1.metadata["known_failure_modes"],
            serde_json::json!(["slow_backend"])
        );
    }

    #[tokio::test]
    async fn test_empty_selection() {
        let runner = SignalRunner::default();
        let results = runner
            .run_all(&[], Arc::new(ContentInput::Text(String::new())))
            .await;
        assert!(results.is_empty());
    }
}
