//! Prometheus metrics exposition server.
//!
//! Exposes eswatch metrics in Prometheus format on a configurable port.

use anyhow::Result;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::OnceLock;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Global flag to track if recorder is installed (for tests).
static RECORDER_INSTALLED: OnceLock<()> = OnceLock::new();

/// Register all metric descriptions for Prometheus.
///
/// Called once at startup after the recorder is installed; descriptions
/// provide HELP text in the Prometheus output.
pub fn register_metric_descriptions() {
    use metrics::{describe_counter, describe_gauge};

    describe_counter!(
        "eswatch_evaluations_total",
        "Total number of completed rule evaluations (query + expression)"
    );
    describe_counter!(
        "eswatch_expression_errors_total",
        "Total number of evaluation passes aborted by a match-expression error"
    );
    describe_counter!(
        "eswatch_capped_passes_total",
        "Total number of evaluation passes truncated at the match-event cap"
    );
    describe_counter!(
        "eswatch_alerts_started_total",
        "Total number of alert_start transitions"
    );
    describe_counter!(
        "eswatch_alerts_ended_total",
        "Total number of alert_end transitions"
    );
    describe_counter!(
        "eswatch_notifications_sent_total",
        "Total number of notifications successfully delivered to a channel"
    );
    describe_counter!(
        "eswatch_notifications_failed_total",
        "Total number of notifications that permanently failed after all retries"
    );
    describe_counter!(
        "eswatch_rules_skipped_total",
        "Total number of rule bundles skipped at load time"
    );
    describe_counter!(
        "eswatch_rule_errors_total",
        "Total number of fatal rule task errors (non-recoverable)"
    );
    describe_counter!(
        "eswatch_rule_panics_total",
        "Total number of rule task panics"
    );

    describe_gauge!(
        "eswatch_active_alerts",
        "Current number of alert identities in the active state"
    );
    describe_gauge!(
        "eswatch_build_info",
        "Build information with version label (always 1)"
    );
}

/// Initialize known metrics so they are visible in `/metrics` from startup.
pub fn initialize_metrics(rule_names: &[&str], channel_names: &[&str]) {
    use metrics::{counter, gauge};

    gauge!("eswatch_build_info", "version" => env!("CARGO_PKG_VERSION")).set(1.0);
    gauge!("eswatch_active_alerts").set(0.0);
    counter!("eswatch_rules_skipped_total").absolute(0);

    for rule_name in rule_names {
        counter!("eswatch_evaluations_total", "rule_name" => rule_name.to_string()).absolute(0);
        counter!("eswatch_expression_errors_total", "rule_name" => rule_name.to_string())
            .absolute(0);
        counter!("eswatch_capped_passes_total", "rule_name" => rule_name.to_string()).absolute(0);
        counter!("eswatch_alerts_started_total", "rule_name" => rule_name.to_string()).absolute(0);
        counter!("eswatch_alerts_ended_total", "rule_name" => rule_name.to_string()).absolute(0);
        counter!("eswatch_rule_errors_total", "rule_name" => rule_name.to_string()).absolute(0);
        counter!("eswatch_rule_panics_total", "rule_name" => rule_name.to_string()).absolute(0);
    }

    for channel in channel_names {
        counter!("eswatch_notifications_sent_total", "channel" => channel.to_string()).absolute(0);
        counter!("eswatch_notifications_failed_total", "channel" => channel.to_string())
            .absolute(0);
    }

    tracing::info!(
        rule_count = rule_names.len(),
        channel_count = channel_names.len(),
        "Metrics initialized to zero"
    );
}

/// Metrics server for Prometheus exposition.
pub struct MetricsServer {
    port: u16,
    /// Optional channel signalled once the recorder is installed, so
    /// callers can initialize metrics without losing them to the window
    /// before the recorder exists.
    ready_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl MetricsServer {
    /// Create a new metrics server bound to the given port.
    ///
    /// Port 0 lets the OS assign an available port (useful for testing).
    pub fn new(port: u16) -> Self {
        Self {
            port,
            ready_tx: None,
        }
    }

    /// Create a metrics server that signals `ready_tx` once the recorder
    /// is installed and ready to receive metrics.
    pub fn with_ready_signal(port: u16, ready_tx: tokio::sync::oneshot::Sender<()>) -> Self {
        Self {
            port,
            ready_tx: Some(ready_tx),
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Run the metrics server until cancelled.
    ///
    /// Installs the global metrics recorder and starts the HTTP listener.
    /// The recorder can only be installed once per process.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let addr: SocketAddr = ([0, 0, 0, 0], self.port).into();

        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .map_err(|e| anyhow::anyhow!("Failed to install Prometheus exporter: {}", e))?;

        let _ = RECORDER_INSTALLED.set(());
        register_metric_descriptions();

        if let Some(tx) = self.ready_tx {
            let _ = tx.send(());
        }

        info!(port = self.port, "Metrics server started on /metrics");

        cancel.cancelled().await;
        info!("Metrics server shutting down");
        Ok(())
    }
}

/// Check if the metrics recorder has been installed.
pub fn is_recorder_installed() -> bool {
    RECORDER_INSTALLED.get().is_some()
}
