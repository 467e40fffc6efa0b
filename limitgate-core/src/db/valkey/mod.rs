use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, RedisResult, Value};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;
use uuid::Uuid;

use crate::db::{
    counter_keys, AdmissionRequest, HealthCheckable, RateLimitQueries, StoreDecision, WindowUsage,
};
use crate::error::{Error, ErrorDetails};
use crate::rate_limiting::Dimension;

/// Fixed number of multiplexed connections per node.
pub const POOL_SIZE: usize = 16;

/// Upper bound on one admission or reconcile round trip, including the wait
/// for a pooled connection.
const ADMISSION_TIMEOUT_MS: u64 = 50;

const USAGE_TIMEOUT_MS: u64 = 1000;
const HEALTH_CHECK_TIMEOUT_MS: u64 = 1000;

/// Startup handshake retry budget: 5 attempts with doubling backoff from 1 s.
const HANDSHAKE_ATTEMPTS: u32 = 5;
const HANDSHAKE_INITIAL_BACKOFF_MS: u64 = 1000;

/// Connection info for the Valkey (Redis-compatible) coordination store.
///
/// Holds a fixed pool of `ConnectionManager`s behind a FIFO semaphore:
/// acquisition waits in arrival order and is bounded by the operation
/// timeout, surfacing as `CoordinationUnavailable` when the wait expires.
/// Each manager reconnects automatically on connection loss.
#[derive(Clone)]
pub struct ValkeyConnectionInfo {
    pool: Arc<ConnectionPool>,
}

struct ConnectionPool {
    connections: Vec<ConnectionManager>,
    permits: Arc<Semaphore>,
    next: AtomicUsize,
}

/// A pooled connection; the permit is released when the guard drops, after
/// the command finishes.
struct PooledConnection {
    connection: ConnectionManager,
    _permit: OwnedSemaphorePermit,
}

impl std::ops::Deref for PooledConnection {
    type Target = ConnectionManager;

    fn deref(&self) -> &Self::Target {
        &self.connection
    }
}

impl std::ops::DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.connection
    }
}

impl ValkeyConnectionInfo {
    pub async fn new(valkey_url: &str) -> Result<Self, Error> {
        let client = Client::open(valkey_url).map_err(|e| {
            Error::new(ErrorDetails::CoordinationUnavailable {
                message: format!("Failed to create Valkey client: {e}"),
            })
        })?;

        let mut connections = Vec::with_capacity(POOL_SIZE);
        for _ in 0..POOL_SIZE {
            let connection = ConnectionManager::new(client.clone()).await.map_err(|e| {
                Error::new(ErrorDetails::CoordinationUnavailable {
                    message: format!("Failed to connect to Valkey: {e}"),
                })
            })?;
            connections.push(connection);
        }

        // Load the admission function library once per startup.
        let mut first = connections[0].clone();
        Self::load_function_library(&mut first).await?;

        Ok(Self {
            pool: Arc::new(ConnectionPool {
                connections,
                permits: Arc::new(Semaphore::new(POOL_SIZE)),
                next: AtomicUsize::new(0),
            }),
        })
    }

    /// Connect with the startup retry budget. Callers treat exhaustion as a
    /// fatal handshake failure.
    pub async fn new_with_retries(valkey_url: &str) -> Result<Self, Error> {
        let mut backoff = Duration::from_millis(HANDSHAKE_INITIAL_BACKOFF_MS);
        let mut last_error = None;
        for attempt in 1..=HANDSHAKE_ATTEMPTS {
            match Self::new(valkey_url).await {
                Ok(info) => return Ok(info),
                Err(e) => {
                    tracing::warn!(
                        "Coordination store handshake attempt {attempt}/{HANDSHAKE_ATTEMPTS} failed: {e}"
                    );
                    last_error = Some(e);
                }
            }
            if attempt < HANDSHAKE_ATTEMPTS {
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
        }
        Err(last_error.unwrap_or_else(|| {
            Error::new(ErrorDetails::CoordinationUnavailable {
                message: "Coordination store handshake failed".to_string(),
            })
        }))
    }

    /// Load the rate limiting function library into Valkey.
    async fn load_function_library(connection: &mut ConnectionManager) -> Result<(), Error> {
        let lua_code = include_str!("lua/limitgate_ratelimit.lua");

        let result: RedisResult<()> = redis::cmd("FUNCTION")
            .arg("LOAD")
            .arg("REPLACE")
            .arg(lua_code)
            .query_async(connection)
            .await;
        result.map_err(|e| {
            Error::new(ErrorDetails::CoordinationUnavailable {
                message: format!("Failed to load function library: {e}"),
            })
        })
    }

    /// Acquire a pooled connection. Waiters queue in arrival order and give
    /// up after `wait`; the permit is held until the command completes.
    async fn acquire(&self, wait: Duration) -> Result<PooledConnection, Error> {
        let permit = timeout(wait, self.pool.permits.clone().acquire_owned())
            .await
            .map_err(|_| {
                Error::new(ErrorDetails::CoordinationUnavailable {
                    message: "Timed out waiting for a coordination store connection".to_string(),
                })
            })?
            .map_err(|e| {
                Error::new(ErrorDetails::CoordinationUnavailable {
                    message: format!("Connection pool closed: {e}"),
                })
            })?;
        let index = self.pool.next.fetch_add(1, Ordering::Relaxed) % self.pool.connections.len();
        Ok(PooledConnection {
            connection: self.pool.connections[index].clone(),
            _permit: permit,
        })
    }
}

fn coordination_error(message: String) -> Error {
    Error::new(ErrorDetails::CoordinationUnavailable { message })
}

fn script_shape_error() -> Error {
    Error::new(ErrorDetails::CoordinationUnavailable {
        message: "Admission script returned an unexpected shape".to_string(),
    })
}

/// Parse the `{event_id}:{cost}` member format used in the counter sets.
fn member_cost(member: &str) -> u64 {
    member
        .rsplit_once(':')
        .and_then(|(_, cost)| cost.parse().ok())
        .unwrap_or(0)
}

#[async_trait]
impl RateLimitQueries for ValkeyConnectionInfo {
    async fn check_and_commit(
        &self,
        request: &AdmissionRequest<'_>,
    ) -> Result<StoreDecision, Error> {
        let deadline = Duration::from_millis(ADMISSION_TIMEOUT_MS);
        let operation = async {
            let mut connection = self.acquire(deadline).await?;
            let keys = counter_keys(request.api_key);
            // TTL comfortably exceeds the window so idle keys still expire.
            let ttl = request.window_seconds * 2;
            let reply: Vec<Value> = redis::cmd("FCALL")
                .arg("limitgate_check_and_commit")
                .arg(3)
                .arg(&keys[..])
                .arg(request.now)
                .arg(request.window_seconds)
                .arg(request.cost_in)
                .arg(request.cost_out)
                .arg(request.config.input_tpm)
                .arg(request.config.output_tpm)
                .arg(request.config.rpm)
                .arg(request.event_id.simple().to_string())
                .arg(ttl)
                .query_async(&mut *connection)
                .await
                .map_err(|e| coordination_error(format!("Admission script failed: {e}")))?;
            parse_admission_reply(&reply)
        };
        timeout(deadline, operation).await.map_err(|_| {
            coordination_error("Admission round trip exceeded its deadline".to_string())
        })?
    }

    async fn reconcile_output(
        &self,
        api_key: &str,
        event_id: Uuid,
        old_cost: u64,
        new_cost: u64,
    ) -> Result<(), Error> {
        let deadline = Duration::from_millis(ADMISSION_TIMEOUT_MS);
        let operation = async {
            let mut connection = self.acquire(deadline).await?;
            let [_, output_key, _] = counter_keys(api_key);
            let _replaced: i64 = redis::cmd("FCALL")
                .arg("limitgate_reconcile_output")
                .arg(1)
                .arg(&output_key)
                .arg(event_id.simple().to_string())
                .arg(old_cost)
                .arg(new_cost)
                .query_async(&mut *connection)
                .await
                .map_err(|e| coordination_error(format!("Reconcile script failed: {e}")))?;
            Ok(())
        };
        timeout(deadline, operation).await.map_err(|_| {
            coordination_error("Reconcile round trip exceeded its deadline".to_string())
        })?
    }

    async fn window_usage(
        &self,
        api_key: &str,
        now: f64,
        window_seconds: u64,
    ) -> Result<WindowUsage, Error> {
        let deadline = Duration::from_millis(USAGE_TIMEOUT_MS);
        let operation = async {
            let mut connection = self.acquire(deadline).await?;
            let keys = counter_keys(api_key);
            let cutoff = now - window_seconds as f64;
            let mut pipe = redis::pipe();
            for key in &keys {
                pipe.zrangebyscore(key, cutoff, "+inf");
            }
            let results: Vec<Vec<String>> = pipe
                .query_async(&mut *connection)
                .await
                .map_err(|e| coordination_error(format!("Usage read failed: {e}")))?;
            let mut sums = [0u64; 3];
            for (i, members) in results.iter().enumerate().take(3) {
                sums[i] = members.iter().map(|m| member_cost(m)).sum();
            }
            Ok(WindowUsage {
                input_tokens_used: sums[0],
                output_tokens_used: sums[1],
                requests_used: sums[2],
            })
        };
        timeout(deadline, operation)
            .await
            .map_err(|_| coordination_error("Usage read exceeded its deadline".to_string()))?
    }
}

fn parse_admission_reply(reply: &[Value]) -> Result<StoreDecision, Error> {
    match reply.first() {
        Some(Value::Int(1)) => Ok(StoreDecision::Admitted),
        Some(Value::Int(0)) => {
            let dimension = match reply.get(1) {
                Some(Value::Int(1)) => Dimension::InputTpm,
                Some(Value::Int(2)) => Dimension::OutputTpm,
                Some(Value::Int(3)) => Dimension::Rpm,
                _ => return Err(script_shape_error()),
            };
            let oldest_event_ts = match reply.get(2) {
                Some(Value::BulkString(bytes)) => std::str::from_utf8(bytes)
                    .ok()
                    .and_then(|s| s.parse::<f64>().ok())
                    .ok_or_else(script_shape_error)?,
                Some(Value::SimpleString(s)) => {
                    s.parse::<f64>().map_err(|_| script_shape_error())?
                }
                _ => return Err(script_shape_error()),
            };
            Ok(StoreDecision::Denied {
                dimension,
                oldest_event_ts,
            })
        }
        _ => Err(script_shape_error()),
    }
}

#[async_trait]
impl HealthCheckable for ValkeyConnectionInfo {
    async fn health(&self) -> Result<(), Error> {
        let check = async {
            let mut connection = self
                .acquire(Duration::from_millis(HEALTH_CHECK_TIMEOUT_MS))
                .await?;
            let _: String = (*connection).ping().await.map_err(|e| {
                coordination_error(format!("Coordination store health check failed: {e}"))
            })?;
            Ok(())
        };

        match timeout(Duration::from_millis(HEALTH_CHECK_TIMEOUT_MS), check).await {
            Ok(result) => result,
            Err(_) => Err(coordination_error(
                "Coordination store health check timed out".to_string(),
            )),
        }
    }
}
