pub mod memory;
pub mod valkey;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Error;
use crate::rate_limiting::{config::RateLimitConfig, Dimension};

pub use memory::MemoryStore;
pub use valkey::ValkeyConnectionInfo;

/// All state for one API key lives in three sorted sets, one per limited
/// dimension, scored by event timestamp.
pub fn counter_keys(api_key: &str) -> [String; 3] {
    let base = format!("rate_limit:{api_key}");
    [
        format!("{base}:input_tokens"),
        format!("{base}:output_tokens"),
        format!("{base}:requests"),
    ]
}

/// One admission attempt, as handed to the coordination store.
#[derive(Clone, Debug)]
pub struct AdmissionRequest<'a> {
    pub api_key: &'a str,
    pub config: RateLimitConfig,
    pub cost_in: u64,
    pub cost_out: u64,
    /// Wall-clock seconds with sub-second precision, read on the handling
    /// node immediately before the call.
    pub now: f64,
    pub window_seconds: u64,
    pub event_id: Uuid,
}

/// Raw outcome of the atomic check-then-commit batch.
///
/// On denial the store reports the timestamp of the oldest surviving event
/// in the violating counter; the engine turns that into a retry hint.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum StoreDecision {
    Admitted,
    Denied {
        dimension: Dimension,
        oldest_event_ts: f64,
    },
}

/// Non-expired cost sums for one key, as seen by a read-only observer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WindowUsage {
    pub input_tokens_used: u64,
    pub output_tokens_used: u64,
    pub requests_used: u64,
}

/// Operations the admission engine needs from a coordination store.
///
/// `check_and_commit` must be atomic: evict, sum, check all three limits in
/// order, and insert, all in one linearized step. `reconcile_output` must
/// never re-check limits. `window_usage` must not mutate counters.
#[async_trait]
pub trait RateLimitQueries {
    async fn check_and_commit(&self, request: &AdmissionRequest<'_>)
        -> Result<StoreDecision, Error>;

    async fn reconcile_output(
        &self,
        api_key: &str,
        event_id: Uuid,
        old_cost: u64,
        new_cost: u64,
    ) -> Result<(), Error>;

    async fn window_usage(
        &self,
        api_key: &str,
        now: f64,
        window_seconds: u64,
    ) -> Result<WindowUsage, Error>;
}

#[async_trait]
pub trait HealthCheckable {
    async fn health(&self) -> Result<(), Error>;
}

/// Connection info for whichever coordination store backs this process.
///
/// Production always runs against Valkey; the in-memory store exists for
/// tests and single-process experiments where cross-node consistency is not
/// needed.
#[derive(Clone)]
pub enum CoordinationConnectionInfo {
    Valkey(ValkeyConnectionInfo),
    Memory(MemoryStore),
}

#[async_trait]
impl RateLimitQueries for CoordinationConnectionInfo {
    async fn check_and_commit(
        &self,
        request: &AdmissionRequest<'_>,
    ) -> Result<StoreDecision, Error> {
        match self {
            Self::Valkey(client) => client.check_and_commit(request).await,
            Self::Memory(store) => store.check_and_commit(request).await,
        }
    }

    async fn reconcile_output(
        &self,
        api_key: &str,
        event_id: Uuid,
        old_cost: u64,
        new_cost: u64,
    ) -> Result<(), Error> {
        match self {
            Self::Valkey(client) => {
                client
                    .reconcile_output(api_key, event_id, old_cost, new_cost)
                    .await
            }
            Self::Memory(store) => {
                store
                    .reconcile_output(api_key, event_id, old_cost, new_cost)
                    .await
            }
        }
    }

    async fn window_usage(
        &self,
        api_key: &str,
        now: f64,
        window_seconds: u64,
    ) -> Result<WindowUsage, Error> {
        match self {
            Self::Valkey(client) => client.window_usage(api_key, now, window_seconds).await,
            Self::Memory(store) => store.window_usage(api_key, now, window_seconds).await,
        }
    }
}

#[async_trait]
impl HealthCheckable for CoordinationConnectionInfo {
    async fn health(&self) -> Result<(), Error> {
        match self {
            Self::Valkey(client) => client.health().await,
            Self::Memory(store) => store.health().await,
        }
    }
}
