//! eswatch - Scheduled Elasticsearch alerting with hysteresis and pluggable channels.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use eswatch::cli::{Cli, LogFormat};
use eswatch::config::Config;
use eswatch::notify::{ChannelRegistry, Dispatcher};
use eswatch::state::{AlertTable, TriggerStateStore};
use eswatch::{AlertEngine, HttpSearchClient, MetricsServer, Rule, SearchClient};

/// Initialize the tracing subscriber with the specified log format.
fn init_logging(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(tracing::Level::INFO.into());

    match format {
        LogFormat::Text => {
            tracing_subscriber::fmt()
                .with_writer(std::io::stderr)
                .with_env_filter(filter)
                .init();
        }
        LogFormat::Json => {
            tracing_subscriber::fmt()
                .with_writer(std::io::stderr)
                .json()
                .with_current_span(true)
                .with_span_list(false)
                .flatten_event(true)
                .with_env_filter(filter)
                .init();
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_format);

    info!(config_path = %cli.config.display(), "Loading configuration");
    let mut config = match Config::load(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, path = %cli.config.display(), "Failed to load configuration");
            std::process::exit(1);
        }
    };
    if let Some(rules_dir) = cli.rules_dir {
        config.rules_dir = rules_dir;
    }

    info!("Validating configuration");
    if let Err(errors) = config.validate() {
        for e in &errors {
            error!(error = %e, "Configuration validation error");
        }
        error!(error_count = errors.len(), "Configuration validation failed");
        std::process::exit(1);
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    if cli.validate {
        return runtime.block_on(validate_rules(&cli.config, config));
    }

    info!(config_path = %cli.config.display(), "eswatch starting");
    runtime.block_on(run(config))
}

/// Validate mode: load every rule bundle, print a summary, exit.
async fn validate_rules(config_path: &std::path::Path, config: Config) -> Result<()> {
    let http_client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()?;
    let registry = ChannelRegistry::builtin(http_client);
    let rules = eswatch::rule::load_rules(&config.rules_dir, &registry)
        .map_err(|e| anyhow::anyhow!("{}", e))?;

    println!("Configuration is valid: {}", config_path.display());
    println!("  Elasticsearch URL: {}", config.elasticsearch.url);
    println!("  Rules dir: {}", config.rules_dir.display());
    println!("  Rules loaded: {}", rules.len());
    for rule in &rules {
        println!(
            "    {} ({:?}, poll_count {}, {} schedule{})",
            rule.name,
            rule.kind,
            rule.poll_count,
            rule.schedule.len(),
            if rule.schedule.len() == 1 { "" } else { "s" }
        );
    }
    println!("  State file: {}", config.state_path.display());
    println!(
        "  Metrics: {} (port {})",
        if config.metrics.enabled {
            "enabled"
        } else {
            "disabled"
        },
        config.metrics.port
    );
    Ok(())
}

/// Main async entry point.
async fn run(config: Config) -> Result<()> {
    // Shared HTTP client for connection pooling across channels and search.
    let http_client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()?;

    let registry = Arc::new(ChannelRegistry::builtin(http_client.clone()));
    let rules = eswatch::rule::load_rules(&config.rules_dir, &registry)
        .map_err(|e| anyhow::anyhow!("{}", e))?;
    if rules.is_empty() {
        error!(rules_dir = %config.rules_dir.display(), "No loadable rules found");
        std::process::exit(1);
    }

    let store = TriggerStateStore::new(&config.state_path);
    let table = Arc::new(Mutex::new(AlertTable::open(store)));
    {
        let table = table.lock().await;
        info!(
            restored = table.len(),
            active = table.active_count(),
            state_path = %config.state_path.display(),
            "Trigger state loaded"
        );
    }

    let cancel = CancellationToken::new();

    let metrics_handle = if config.metrics.enabled {
        let (ready_tx, ready_rx) = tokio::sync::oneshot::channel();
        let server = MetricsServer::with_ready_signal(config.metrics.port, ready_tx);
        let cancel_metrics = cancel.clone();
        info!(port = config.metrics.port, "Starting metrics server");
        let handle = tokio::spawn(async move {
            if let Err(e) = server.run(cancel_metrics).await {
                error!(error = %e, "Metrics server error");
            }
        });

        // Initialize metrics only once the recorder exists, otherwise the
        // zero values are silently dropped.
        if ready_rx.await.is_ok() {
            let rule_names: Vec<&str> = rules.iter().map(|r: &Rule| r.name.as_str()).collect();
            let channel_names: Vec<&str> = registry.names().collect();
            eswatch::metrics::initialize_metrics(&rule_names, &channel_names);
        }
        Some(handle)
    } else {
        info!("Metrics server disabled");
        None
    };

    let search: Arc<dyn SearchClient> = Arc::new(HttpSearchClient::new(
        config.elasticsearch.url.clone(),
        http_client,
    ));
    let dispatcher = Arc::new(Dispatcher::new(registry));
    let engine = AlertEngine::new(rules, search, dispatcher, table);

    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for ctrl-c signal");
            return;
        }
        info!("Received shutdown signal, initiating graceful shutdown");
        cancel_clone.cancel();
    });

    let engine_result = engine.run(cancel.clone()).await;

    if let Some(handle) = metrics_handle {
        cancel.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;
    }

    match engine_result {
        Ok(()) => {
            info!("eswatch shutdown complete");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Engine error");
            Err(anyhow::anyhow!("Engine error: {}", e))
        }
    }
}
