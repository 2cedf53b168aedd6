//! Prometheus metrics for the store runtime.
//!
//! The Store and the retry helpers record through the `metrics` facade. This
//! module installs a Prometheus recorder with an HTTP scrape endpoint and
//! registers descriptions for the runtime's metric names.
//!
//! # Example
//!
//! ```rust,no_run
//! use racetrack_runtime::metrics::MetricsServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//! // Scrape http://localhost:9090/metrics
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use thiserror::Error;

/// Errors from metrics setup.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build the Prometheus exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
}

/// Prometheus scrape endpoint.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a server that will listen on `addr` once started.
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Install the global recorder and spawn the HTTP listener.
    ///
    /// Must be called inside a Tokio runtime. If another recorder is already
    /// installed (common in tests) this logs a warning and leaves the
    /// existing recorder in place.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::Build`] if the exporter cannot be configured.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let (recorder, exporter) = PrometheusBuilder::new()
            .with_http_listener(self.addr)
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?
            .build()
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        let handle = recorder.handle();
        if metrics::set_global_recorder(recorder).is_err() {
            tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
            return Ok(());
        }

        tokio::spawn(async move {
            if exporter.await.is_err() {
                tracing::error!("Metrics endpoint stopped");
            }
        });

        tracing::info!(addr = %self.addr, "Metrics available at http://{}/metrics", self.addr);
        self.handle = Some(handle);
        Ok(())
    }

    /// Render current metrics in Prometheus text format.
    ///
    /// Returns `None` if this server did not install the recorder.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

fn register_metrics() {
    describe_counter!("store.commands.total", "Actions sent to stores");
    describe_counter!("store.effects.executed", "Effects started, labelled by type");
    describe_histogram!(
        "store.reducer.duration_seconds",
        "Time spent inside reducers"
    );
    describe_histogram!("store.effects.count", "Effects returned per action");
    describe_counter!("store.shutdown.initiated", "Store shutdowns started");
    describe_counter!("store.shutdown.completed", "Store shutdowns that drained all effects");
    describe_counter!("store.shutdown.timeout", "Store shutdowns that timed out");
    describe_counter!(
        "store.shutdown.rejected_actions",
        "Actions rejected because the store was shutting down"
    );

    describe_counter!("retry.attempts", "Retries scheduled after a failure");
    describe_counter!("retry.recovered", "Operations that succeeded after retrying");
    describe_counter!("retry.exhausted", "Operations that failed after every retry");
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn new_server_has_no_handle() {
        let server = MetricsServer::new("127.0.0.1:0".parse().unwrap());
        assert!(server.render().is_none());
    }

    #[tokio::test]
    async fn start_is_idempotent_across_servers() {
        let mut first = MetricsServer::new("127.0.0.1:0".parse().unwrap());
        let mut second = MetricsServer::new("127.0.0.1:0".parse().unwrap());

        assert!(first.start().is_ok());
        assert!(second.start().is_ok());

        metrics::counter!("store.commands.total").increment(1);

        // Only one server can own the global recorder.
        let rendered: Vec<_> = [first.render(), second.render()].into_iter().flatten().collect();
        assert!(rendered.len() <= 1);
        if let Some(text) = rendered.first() {
            assert!(text.contains("store_commands_total"));
        }
    }
}
