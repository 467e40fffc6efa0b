use std::net::SocketAddr;

use metrics_exporter_prometheus::PrometheusBuilder;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use limitgate_core::error::{Error, ErrorDetails};

/// Set up logs
pub fn setup_logs() {
    // Get the current log level from the environment variable `RUST_LOG`
    let log_level = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "gateway=debug,limitgate_core=debug,warn".into());

    tracing_subscriber::registry()
        .with(log_level)
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .flatten_event(true)
                .with_current_span(false)
                .with_target(false),
        )
        .init();
}

/// Set up Prometheus metrics exporter
pub fn setup_metrics() -> Result<(), Error> {
    let listener_addr = SocketAddr::from(([0, 0, 0, 0], 9090));

    PrometheusBuilder::new()
        .with_http_listener(listener_addr)
        .install()
        .map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Failed to install Prometheus exporter: {e}"),
            })
        })
}
