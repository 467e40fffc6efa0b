//! In-memory coordination store.
//!
//! Mirrors the Valkey function library's semantics exactly, with the mutex
//! playing the role of the server-side script serializer. Used by tests and
//! single-process experiments; it provides no cross-node consistency.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use uuid::Uuid;

use crate::db::{
    AdmissionRequest, HealthCheckable, RateLimitQueries, StoreDecision, WindowUsage,
};
use crate::error::{Error, ErrorDetails};
use crate::rate_limiting::Dimension;

const INPUT: usize = 0;
const OUTPUT: usize = 1;
const REQUESTS: usize = 2;

#[derive(Clone, Debug)]
struct Event {
    timestamp: f64,
    event_id: Uuid,
    cost: u64,
}

type Counters = [Vec<Event>; 3];

#[derive(Clone)]
pub struct MemoryStore {
    keys: Arc<Mutex<HashMap<String, Counters>>>,
    healthy: Arc<AtomicBool>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            keys: Arc::new(Mutex::new(HashMap::new())),
            healthy: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Simulate a coordination store outage (and recovery) in tests.
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), Error> {
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::new(ErrorDetails::CoordinationUnavailable {
                message: "In-memory store marked unavailable".to_string(),
            }))
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Counters>>, Error> {
        self.keys.lock().map_err(|_| {
            Error::new(ErrorDetails::InternalError {
                message: "In-memory store mutex poisoned".to_string(),
            })
        })
    }
}

fn evict(counter: &mut Vec<Event>, cutoff: f64) {
    counter.retain(|event| event.timestamp >= cutoff);
}

fn window_sum(counter: &[Event]) -> u64 {
    counter.iter().map(|event| event.cost).sum()
}

fn oldest_timestamp(counter: &[Event]) -> Option<f64> {
    counter
        .iter()
        .map(|event| event.timestamp)
        .min_by(|a, b| a.total_cmp(b))
}

#[async_trait]
impl RateLimitQueries for MemoryStore {
    async fn check_and_commit(
        &self,
        request: &AdmissionRequest<'_>,
    ) -> Result<StoreDecision, Error> {
        self.check_available()?;
        let mut keys = self.lock()?;
        let counters = keys.entry(request.api_key.to_string()).or_default();
        let cutoff = request.now - request.window_seconds as f64;

        for counter in counters.iter_mut() {
            evict(counter, cutoff);
        }

        let costs = [request.cost_in, request.cost_out, 1];
        let limits = [
            request.config.input_tpm,
            request.config.output_tpm,
            request.config.rpm,
        ];
        let dimensions = [Dimension::InputTpm, Dimension::OutputTpm, Dimension::Rpm];

        for i in [INPUT, OUTPUT, REQUESTS] {
            if window_sum(&counters[i]) + costs[i] > limits[i] {
                return Ok(StoreDecision::Denied {
                    dimension: dimensions[i],
                    oldest_event_ts: oldest_timestamp(&counters[i]).unwrap_or(request.now),
                });
            }
        }

        for i in [INPUT, OUTPUT, REQUESTS] {
            counters[i].push(Event {
                timestamp: request.now,
                event_id: request.event_id,
                cost: costs[i],
            });
        }
        Ok(StoreDecision::Admitted)
    }

    async fn reconcile_output(
        &self,
        api_key: &str,
        event_id: Uuid,
        old_cost: u64,
        new_cost: u64,
    ) -> Result<(), Error> {
        self.check_available()?;
        let mut keys = self.lock()?;
        let Some(counters) = keys.get_mut(api_key) else {
            // Everything expired; nothing to adjust.
            return Ok(());
        };
        if let Some(event) = counters[OUTPUT]
            .iter_mut()
            .find(|event| event.event_id == event_id && event.cost == old_cost)
        {
            event.cost = new_cost;
        }
        Ok(())
    }

    async fn window_usage(
        &self,
        api_key: &str,
        now: f64,
        window_seconds: u64,
    ) -> Result<WindowUsage, Error> {
        self.check_available()?;
        let keys = self.lock()?;
        let Some(counters) = keys.get(api_key) else {
            return Ok(WindowUsage::default());
        };
        let cutoff = now - window_seconds as f64;
        let sum_live = |counter: &[Event]| {
            counter
                .iter()
                .filter(|event| event.timestamp >= cutoff)
                .map(|event| event.cost)
                .sum()
        };
        Ok(WindowUsage {
            input_tokens_used: sum_live(&counters[INPUT]),
            output_tokens_used: sum_live(&counters[OUTPUT]),
            requests_used: sum_live(&counters[REQUESTS]),
        })
    }
}

#[async_trait]
impl HealthCheckable for MemoryStore {
    async fn health(&self) -> Result<(), Error> {
        self.check_available()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limiting::config::RateLimitConfig;

    fn config(input_tpm: u64, output_tpm: u64, rpm: u64) -> RateLimitConfig {
        RateLimitConfig {
            input_tpm,
            output_tpm,
            rpm,
        }
    }

    fn request<'a>(
        api_key: &'a str,
        config: RateLimitConfig,
        cost_in: u64,
        cost_out: u64,
        now: f64,
    ) -> AdmissionRequest<'a> {
        AdmissionRequest {
            api_key,
            config,
            cost_in,
            cost_out,
            now,
            window_seconds: 60,
            event_id: Uuid::new_v4(),
        }
    }

    #[tokio::test]
    async fn test_admits_exactly_at_limit() {
        let store = MemoryStore::new();
        let cfg = config(100, 100, 10);
        // 100 input tokens lands exactly on the limit: admitted.
        let decision = store
            .check_and_commit(&request("key", cfg, 100, 1, 1000.0))
            .await
            .unwrap();
        assert_eq!(decision, StoreDecision::Admitted);
    }

    #[tokio::test]
    async fn test_denies_one_past_limit() {
        let store = MemoryStore::new();
        let cfg = config(100, 100, 10);
        let decision = store
            .check_and_commit(&request("key", cfg, 101, 0, 1000.0))
            .await
            .unwrap();
        assert!(matches!(
            decision,
            StoreDecision::Denied {
                dimension: Dimension::InputTpm,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_deny_checks_dimensions_in_fixed_order() {
        let store = MemoryStore::new();
        // Both input and output would be violated; input must win.
        let cfg = config(100, 100, 100);
        let decision = store
            .check_and_commit(&request("key", cfg, 101, 101, 1000.0))
            .await
            .unwrap();
        assert!(matches!(
            decision,
            StoreDecision::Denied {
                dimension: Dimension::InputTpm,
                ..
            }
        ));

        let decision = store
            .check_and_commit(&request("key", cfg, 0, 101, 1000.0))
            .await
            .unwrap();
        assert!(matches!(
            decision,
            StoreDecision::Denied {
                dimension: Dimension::OutputTpm,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_rpm_exhaustion_and_window_slide() {
        let store = MemoryStore::new();
        let cfg = config(10_000, 10_000, 2);
        for _ in 0..2 {
            let decision = store
                .check_and_commit(&request("key", cfg, 10, 10, 1000.0))
                .await
                .unwrap();
            assert_eq!(decision, StoreDecision::Admitted);
        }
        // Second 30: still inside the window.
        let decision = store
            .check_and_commit(&request("key", cfg, 10, 10, 1030.0))
            .await
            .unwrap();
        match decision {
            StoreDecision::Denied {
                dimension,
                oldest_event_ts,
            } => {
                assert_eq!(dimension, Dimension::Rpm);
                assert!((oldest_event_ts - 1000.0).abs() < 1e-9);
            }
            other => panic!("expected denial, got {other:?}"),
        }
        // Second 61: the original events have expired.
        let decision = store
            .check_and_commit(&request("key", cfg, 10, 10, 1061.0))
            .await
            .unwrap();
        assert_eq!(decision, StoreDecision::Admitted);
    }

    #[tokio::test]
    async fn test_event_countable_until_window_edge() {
        let store = MemoryStore::new();
        let cfg = config(10_000, 10_000, 1);
        store
            .check_and_commit(&request("key", cfg, 1, 1, 1000.0))
            .await
            .unwrap();
        // Just inside the window: still counted, so the second request denies.
        let decision = store
            .check_and_commit(&request("key", cfg, 1, 1, 1059.9))
            .await
            .unwrap();
        assert!(matches!(decision, StoreDecision::Denied { .. }));
        // At exactly ts + W the event is still countable (expiry is strict).
        let usage = store.window_usage("key", 1060.0, 60).await.unwrap();
        assert_eq!(usage.requests_used, 1);
    }

    #[tokio::test]
    async fn test_reconcile_shrink_releases_quota() {
        let store = MemoryStore::new();
        let cfg = config(10_000, 500, 100);
        let first = request("key", cfg, 10, 500, 1000.0);
        let event_id = first.event_id;
        store.check_and_commit(&first).await.unwrap();

        // Borderline on output: denied while the full estimate is booked.
        let decision = store
            .check_and_commit(&request("key", cfg, 10, 400, 1001.0))
            .await
            .unwrap();
        assert!(matches!(
            decision,
            StoreDecision::Denied {
                dimension: Dimension::OutputTpm,
                ..
            }
        ));

        store
            .reconcile_output("key", event_id, 500, 100)
            .await
            .unwrap();

        let decision = store
            .check_and_commit(&request("key", cfg, 10, 400, 1002.0))
            .await
            .unwrap();
        assert_eq!(decision, StoreDecision::Admitted);
    }

    #[tokio::test]
    async fn test_reconcile_is_idempotent() {
        let store = MemoryStore::new();
        let cfg = config(10_000, 1_000, 100);
        let first = request("key", cfg, 10, 500, 1000.0);
        let event_id = first.event_id;
        store.check_and_commit(&first).await.unwrap();

        store
            .reconcile_output("key", event_id, 500, 100)
            .await
            .unwrap();
        let after_first = store.window_usage("key", 1001.0, 60).await.unwrap();

        store
            .reconcile_output("key", event_id, 500, 100)
            .await
            .unwrap();
        let after_second = store.window_usage("key", 1001.0, 60).await.unwrap();

        assert_eq!(after_first, after_second);
        assert_eq!(after_first.output_tokens_used, 100);
    }

    #[tokio::test]
    async fn test_reconcile_after_expiry_is_a_noop_success() {
        let store = MemoryStore::new();
        let cfg = config(10_000, 1_000, 100);
        let first = request("key", cfg, 10, 500, 1000.0);
        let event_id = first.event_id;
        store.check_and_commit(&first).await.unwrap();

        // Force eviction via a much later admission.
        store
            .check_and_commit(&request("key", cfg, 1, 1, 2000.0))
            .await
            .unwrap();

        store
            .reconcile_output("key", event_id, 500, 100)
            .await
            .unwrap();
        let usage = store.window_usage("key", 2000.0, 60).await.unwrap();
        assert_eq!(usage.output_tokens_used, 1);
    }

    #[tokio::test]
    async fn test_usage_read_does_not_mutate_counters() {
        let store = MemoryStore::new();
        let cfg = config(10_000, 10_000, 100);
        store
            .check_and_commit(&request("key", cfg, 7, 9, 1000.0))
            .await
            .unwrap();
        let first = store.window_usage("key", 1001.0, 60).await.unwrap();
        let second = store.window_usage("key", 1001.0, 60).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.input_tokens_used, 7);
        assert_eq!(first.output_tokens_used, 9);
        assert_eq!(first.requests_used, 1);
    }

    #[tokio::test]
    async fn test_concurrent_admissions_never_over_admit() {
        let store = MemoryStore::new();
        let cfg = config(1_000_000, 1_000_000, 50);
        let mut handles = Vec::new();
        for _ in 0..150 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .check_and_commit(&AdmissionRequest {
                        api_key: "contended",
                        config: cfg,
                        cost_in: 1,
                        cost_out: 1,
                        now: 1000.0,
                        window_seconds: 60,
                        event_id: Uuid::new_v4(),
                    })
                    .await
                    .unwrap()
            }));
        }
        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() == StoreDecision::Admitted {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 50);
    }

    #[tokio::test]
    async fn test_unhealthy_store_refuses_all_operations() {
        let store = MemoryStore::new();
        store.set_healthy(false);
        let cfg = config(10, 10, 10);
        let result = store
            .check_and_commit(&request("key", cfg, 1, 1, 1000.0))
            .await;
        assert!(matches!(
            result.unwrap_err().get_details(),
            ErrorDetails::CoordinationUnavailable { .. }
        ));
        assert!(store.health().await.is_err());
    }
}
