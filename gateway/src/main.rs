use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use tokio::signal;

use limitgate_core::config::Config;
use limitgate_core::endpoints;
use limitgate_core::utils::gateway::AppStateData;

mod observability;

const EXIT_BAD_CONFIG: i32 = 1;
const EXIT_HANDSHAKE_FAILED: i32 = 2;

#[tokio::main]
async fn main() {
    // Set up observability
    observability::setup_logs();

    // Load config from the environment
    let config = Arc::new(
        Config::from_env().expect_pretty("Failed to load configuration", EXIT_BAD_CONFIG),
    );

    observability::setup_metrics()
        .expect_pretty("Failed to set up metrics exporter", EXIT_BAD_CONFIG);

    // Connect to the coordination store; `AppStateData::new` retries the
    // handshake with backoff before giving up.
    let app_state = AppStateData::new(config.clone()).await.expect_pretty(
        "Failed to reach the coordination store after exhausting the retry budget",
        EXIT_HANDSHAKE_FAILED,
    );

    let router = endpoints::router(app_state);

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .expect_pretty(
            &format!("Failed to bind to socket address `{}`", config.listen_addr),
            EXIT_BAD_CONFIG,
        );

    tracing::info!("Listening on {}", config.listen_addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect_pretty("Failed to start server", EXIT_BAD_CONFIG);
}

pub async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect_pretty("Failed to install Ctrl+C handler", EXIT_BAD_CONFIG);
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect_pretty("Failed to install SIGTERM handler", EXIT_BAD_CONFIG)
            .recv()
            .await;
    };

    #[cfg(unix)]
    let hangup = async {
        signal::unix::signal(signal::unix::SignalKind::hangup())
            .expect_pretty("Failed to install SIGHUP handler", EXIT_BAD_CONFIG)
            .recv()
            .await;
    };

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM signal");
        }
        _ = hangup => {
            tokio::time::sleep(Duration::from_secs(1)).await;
            tracing::info!("Received SIGHUP signal");
        }
    };
}

/// Initialization escape hatch: outside of `main.rs` all code handles
/// errors gracefully, but a process that cannot finish starting has nothing
/// graceful left to do. `expect_pretty` logs the failure and exits with the
/// documented status code (1 for bad configuration, 2 when the
/// coordination-store handshake never succeeds).
trait ExpectPretty<T> {
    fn expect_pretty(self, msg: &str, code: i32) -> T;
}

impl<T, E: Display> ExpectPretty<T> for Result<T, E> {
    fn expect_pretty(self, msg: &str, code: i32) -> T {
        match self {
            Ok(value) => value,
            Err(err) => {
                tracing::error!("{msg}: {err}");
                std::process::exit(code);
            }
        }
    }
}
