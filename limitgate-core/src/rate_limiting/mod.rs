//! The distributed sliding-window admission engine.
//!
//! An admission inspects three time-windowed counters for a key and commits
//! one event per counter, all in a single atomic coordination-store call.
//! The store's single-threaded script execution is the serializer: no lock
//! is acquired, and admissions for different keys never contend.

pub mod config;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db::{AdmissionRequest, CoordinationConnectionInfo, RateLimitQueries, StoreDecision, WindowUsage};
use crate::error::{Error, ErrorDetails};
use config::{ConfigResolver, RateLimitConfig};

pub const MAX_API_KEY_BYTES: usize = 256;

/// One of the three independently limited dimensions.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Dimension {
    InputTpm,
    OutputTpm,
    Rpm,
}

impl Dimension {
    pub fn as_str(&self) -> &'static str {
        match self {
            Dimension::InputTpm => "INPUT_TPM",
            Dimension::OutputTpm => "OUTPUT_TPM",
            Dimension::Rpm => "RPM",
        }
    }
}

impl std::fmt::Display for Dimension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An opaque tenant identifier: non-empty, at most 256 bytes.
///
/// The limiter never mints or revokes keys; it only validates the shape.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct ApiKey(String);

impl ApiKey {
    pub fn new(raw: &str) -> Result<Self, Error> {
        if raw.is_empty() {
            return Err(Error::new(ErrorDetails::Unauthorized {
                message: "API key must not be empty".to_string(),
            }));
        }
        if raw.len() > MAX_API_KEY_BYTES {
            return Err(Error::new(ErrorDetails::Unauthorized {
                message: format!("API key exceeds {MAX_API_KEY_BYTES} bytes"),
            }));
        }
        Ok(ApiKey(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Outcome of one admission attempt.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum AdmissionDecision {
    Admitted {
        event_id: Uuid,
        committed_input: u64,
        committed_output_estimate: u64,
    },
    Denied {
        dimension: Dimension,
        retry_after_seconds: u64,
    },
}

/// Wall-clock seconds with sub-second precision, read on the handling node
/// immediately before an admission.
pub fn now_seconds() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1e6
}

pub struct AdmissionEngine {
    store: CoordinationConnectionInfo,
    resolver: Arc<ConfigResolver>,
    window_seconds: u64,
}

impl AdmissionEngine {
    pub fn new(
        store: CoordinationConnectionInfo,
        resolver: Arc<ConfigResolver>,
        window_seconds: u64,
    ) -> Self {
        Self {
            store,
            resolver,
            window_seconds,
        }
    }

    pub fn window_seconds(&self) -> u64 {
        self.window_seconds
    }

    pub fn resolve_config(&self, api_key: &ApiKey) -> RateLimitConfig {
        self.resolver.resolve(api_key.as_str())
    }

    /// Decide admission for one request.
    ///
    /// Issues exactly one atomic store batch; there is no local pre-check in
    /// either direction, so a decision is always grounded in the global
    /// window state. Store failures surface as `CoordinationUnavailable`
    /// and never admit.
    pub async fn admit(
        &self,
        api_key: &ApiKey,
        est_in: u64,
        est_out: u64,
        now: f64,
    ) -> Result<AdmissionDecision, Error> {
        let config = self.resolver.resolve(api_key.as_str());
        let event_id = Uuid::new_v4();
        let decision = self
            .store
            .check_and_commit(&AdmissionRequest {
                api_key: api_key.as_str(),
                config,
                cost_in: est_in,
                cost_out: est_out,
                now,
                window_seconds: self.window_seconds,
                event_id,
            })
            .await?;

        Ok(match decision {
            StoreDecision::Admitted => AdmissionDecision::Admitted {
                event_id,
                committed_input: est_in,
                committed_output_estimate: est_out,
            },
            StoreDecision::Denied {
                dimension,
                oldest_event_ts,
            } => AdmissionDecision::Denied {
                dimension,
                retry_after_seconds: retry_after_seconds(
                    oldest_event_ts,
                    now,
                    self.window_seconds,
                ),
            },
        })
    }

    /// Replace a committed output estimate with the generator's actual
    /// count. Best effort: a failure here is logged and dropped, since the
    /// booked event self-expires within one window anyway.
    pub async fn reconcile(&self, api_key: &ApiKey, event_id: Uuid, old_out: u64, actual_out: u64) {
        if old_out == actual_out {
            return;
        }
        if let Err(e) = self
            .store
            .reconcile_output(api_key.as_str(), event_id, old_out, actual_out)
            .await
        {
            tracing::warn!("Dropping failed reconcile for event {event_id}: {e}");
        }
    }

    /// Current non-expired sums for the three counters. Read-only.
    pub async fn usage(&self, api_key: &ApiKey) -> Result<WindowUsage, Error> {
        self.store
            .window_usage(api_key.as_str(), now_seconds(), self.window_seconds)
            .await
    }
}

/// The earliest wall time at which a denied request could be re-admitted is
/// when the oldest surviving event leaves the window. Clamped to `[1, W]`.
fn retry_after_seconds(oldest_event_ts: f64, now: f64, window_seconds: u64) -> u64 {
    let until = (oldest_event_ts + window_seconds as f64 - now).ceil();
    until.clamp(1.0, window_seconds as f64) as u64
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::config::default_ceiling;
    use super::*;
    use crate::db::MemoryStore;

    fn engine_with(
        store: MemoryStore,
        overrides: HashMap<String, RateLimitConfig>,
    ) -> AdmissionEngine {
        AdmissionEngine::new(
            CoordinationConnectionInfo::Memory(store),
            Arc::new(ConfigResolver::new(overrides, default_ceiling())),
            60,
        )
    }

    fn pinned(input_tpm: u64, output_tpm: u64, rpm: u64) -> HashMap<String, RateLimitConfig> {
        let mut overrides = HashMap::new();
        overrides.insert(
            "sk-pinned".to_string(),
            RateLimitConfig {
                input_tpm,
                output_tpm,
                rpm,
            },
        );
        overrides
    }

    #[test]
    fn test_retry_after_clamps_to_window() {
        // Oldest event just landed: a full window remains.
        assert_eq!(retry_after_seconds(1000.0, 1000.0, 60), 60);
        // Oldest event is about to expire.
        assert_eq!(retry_after_seconds(1000.0, 1059.5, 60), 1);
        // Already past expiry (clock skew): never below 1.
        assert_eq!(retry_after_seconds(1000.0, 1070.0, 60), 1);
        // Partial seconds round up.
        assert_eq!(retry_after_seconds(1000.0, 1030.5, 60), 30);
        assert_eq!(retry_after_seconds(1000.0, 1030.1, 60), 30);
    }

    #[test]
    fn test_api_key_shape_validation() {
        assert!(ApiKey::new("").is_err());
        assert!(ApiKey::new(&"k".repeat(257)).is_err());
        assert!(ApiKey::new(&"k".repeat(256)).is_ok());
        assert_eq!(ApiKey::new("sk-test").unwrap().as_str(), "sk-test");
    }

    #[test]
    fn test_dimension_wire_format() {
        assert_eq!(
            serde_json::to_string(&Dimension::InputTpm).unwrap(),
            "\"INPUT_TPM\""
        );
        assert_eq!(
            serde_json::to_string(&Dimension::OutputTpm).unwrap(),
            "\"OUTPUT_TPM\""
        );
        assert_eq!(serde_json::to_string(&Dimension::Rpm).unwrap(), "\"RPM\"");
    }

    #[tokio::test]
    async fn test_admitted_decisions_carry_unique_event_ids() {
        let engine = engine_with(MemoryStore::new(), pinned(10_000, 10_000, 100));
        let key = ApiKey::new("sk-pinned").unwrap();
        let first = engine.admit(&key, 10, 10, 1000.0).await.unwrap();
        let second = engine.admit(&key, 10, 10, 1000.0).await.unwrap();
        match (first, second) {
            (
                AdmissionDecision::Admitted {
                    event_id: id_a,
                    committed_input,
                    committed_output_estimate,
                },
                AdmissionDecision::Admitted { event_id: id_b, .. },
            ) => {
                assert_ne!(id_a, id_b);
                assert_eq!(committed_input, 10);
                assert_eq!(committed_output_estimate, 10);
            }
            other => panic!("expected two admissions, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_admit_is_not_idempotent_on_retry() {
        let engine = engine_with(MemoryStore::new(), pinned(10_000, 10_000, 2));
        let key = ApiKey::new("sk-pinned").unwrap();
        // The same caller retrying consumes quota again.
        for _ in 0..2 {
            let decision = engine.admit(&key, 1, 1, 1000.0).await.unwrap();
            assert!(matches!(decision, AdmissionDecision::Admitted { .. }));
        }
        let decision = engine.admit(&key, 1, 1, 1000.5).await.unwrap();
        assert!(matches!(
            decision,
            AdmissionDecision::Denied {
                dimension: Dimension::Rpm,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_denial_retry_hint_is_in_bounds() {
        let engine = engine_with(MemoryStore::new(), pinned(100, 100, 100));
        let key = ApiKey::new("sk-pinned").unwrap();
        let decision = engine.admit(&key, 101, 0, 1000.0).await.unwrap();
        match decision {
            AdmissionDecision::Denied {
                dimension,
                retry_after_seconds,
            } => {
                assert_eq!(dimension, Dimension::InputTpm);
                assert!((1..=60).contains(&retry_after_seconds));
            }
            other => panic!("expected denial, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_store_failure_never_admits() {
        let store = MemoryStore::new();
        store.set_healthy(false);
        let engine = engine_with(store, pinned(10_000, 10_000, 100));
        let key = ApiKey::new("sk-pinned").unwrap();
        let result = engine.admit(&key, 1, 1, 1000.0).await;
        assert!(matches!(
            result.unwrap_err().get_details(),
            ErrorDetails::CoordinationUnavailable { .. }
        ));
    }

    #[tokio::test]
    async fn test_two_nodes_sharing_a_store_admit_exactly_the_limit() {
        // Two engines stand in for two server nodes; the shared store is
        // the single source of truth.
        let store = MemoryStore::new();
        let node1 = Arc::new(engine_with(store.clone(), pinned(1_000_000, 1_000_000, 5)));
        let node2 = Arc::new(engine_with(store, pinned(1_000_000, 1_000_000, 5)));

        let mut handles = Vec::new();
        for i in 0..10 {
            let engine = if i % 2 == 0 {
                node1.clone()
            } else {
                node2.clone()
            };
            handles.push(tokio::spawn(async move {
                let key = ApiKey::new("sk-pinned").unwrap();
                engine.admit(&key, 1, 1, 1000.0).await.unwrap()
            }));
        }

        let mut admitted = 0;
        for handle in handles {
            if matches!(handle.await.unwrap(), AdmissionDecision::Admitted { .. }) {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 5);
    }

    #[tokio::test]
    async fn test_reconcile_equal_counts_is_a_noop() {
        let store = MemoryStore::new();
        let engine = engine_with(store.clone(), pinned(10_000, 10_000, 100));
        let key = ApiKey::new("sk-pinned").unwrap();
        // `usage` reads against the real clock, so admit with it too.
        let decision = engine.admit(&key, 10, 150, now_seconds()).await.unwrap();
        let AdmissionDecision::Admitted { event_id, .. } = decision else {
            panic!("expected admission");
        };
        engine.reconcile(&key, event_id, 150, 150).await;
        let usage = engine.usage(&key).await.unwrap();
        assert_eq!(usage.output_tokens_used, 150);
    }

    #[tokio::test]
    async fn test_reconcile_failure_is_swallowed() {
        let store = MemoryStore::new();
        let engine = engine_with(store.clone(), pinned(10_000, 10_000, 100));
        let key = ApiKey::new("sk-pinned").unwrap();
        let decision = engine.admit(&key, 10, 150, 1000.0).await.unwrap();
        let AdmissionDecision::Admitted { event_id, .. } = decision else {
            panic!("expected admission");
        };
        store.set_healthy(false);
        // Must not panic or propagate.
        engine.reconcile(&key, event_id, 150, 40).await;
    }
}
