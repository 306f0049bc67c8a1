//! Postwatch - Postfix metrics exporter
//!
//! Tails the logs of one or more Postfix instances, classifies every line,
//! and exposes the resulting counters and histograms - together with a
//! point-in-time snapshot of the mail queues - over a Prometheus metrics
//! endpoint.

use anyhow::Result;
use clap::Parser;
use futures::future::join_all;
use log::{error, info};
use postwatch::{
    cli::Cli,
    collector::LogCollector,
    config::Config,
    registry::LogMetrics,
    server::{MetricsServer, ScrapeContext},
    sources::FileLogSource,
};
use prometheus::Registry;
use std::sync::Arc;
use tokio::{net::TcpListener, sync::watch, task::JoinHandle};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration by layering sources: defaults, file, environment,
    // and CLI args.
    let config = Config::load(&cli).unwrap_or_else(|err| {
        // Manually initialize logger for this specific error
        env_logger::init();
        error!("Failed to load configuration: {}", err);
        // Exit if configuration fails, as it's a critical step.
        std::process::exit(1);
    });

    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&config.log_level))
        .init();

    info!("Postwatch starting up...");
    info!("-------------------- Configuration --------------------");
    info!("Log Level: {}", config.log_level);
    info!("Listen Address: {}", config.listen_address);
    info!("Telemetry Path: {}", config.telemetry_path);
    info!("Spool Directory: {}", config.spool_directory.display());
    info!("Log Unsupported Lines: {}", config.log_unsupported);
    for instance in &config.instances {
        match &instance.log_path {
            Some(path) => info!("Instance: {} (log: {})", instance.name, path.display()),
            None => info!("Instance: {} (queue metrics only)", instance.name),
        }
    }
    info!("-------------------------------------------------------");

    // =========================================================================
    // Create Shutdown Channel
    // =========================================================================
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // =========================================================================
    // Metric Registry and Collector
    // =========================================================================
    let registry = Registry::new();
    let metrics = Arc::new(LogMetrics::register(&registry)?);
    let collector = Arc::new(LogCollector::new(metrics.clone(), config.log_unsupported));

    // =========================================================================
    // Per-Instance Log Tail Tasks
    // =========================================================================
    let mut tail_tasks: Vec<(String, JoinHandle<()>)> = Vec::new();
    for instance in &config.instances {
        let Some(log_path) = &instance.log_path else {
            continue;
        };
        let source = FileLogSource::open(log_path).await?;
        let collector = collector.clone();
        let name = instance.name.clone();
        let shutdown_rx = shutdown_rx.clone();
        let handle = tokio::spawn(async move {
            collector
                .run(name, Box::new(source), shutdown_rx)
                .await;
        });
        tail_tasks.push((instance.name.clone(), handle));
    }

    // =========================================================================
    // Metrics Server
    // =========================================================================
    let listener = TcpListener::bind(config.listen_address).await?;
    info!("Listening on {}", listener.local_addr()?);

    let context = Arc::new(ScrapeContext {
        registry,
        metrics,
        instances: config.instances.iter().map(|i| i.name.clone()).collect(),
        spool_directory: config.spool_directory.clone(),
        telemetry_path: config.telemetry_path.clone(),
    });
    let server = MetricsServer::new(listener, context, shutdown_rx.clone());
    let server_task = tokio::spawn(server.run());

    info!("Postwatch initialized successfully. Collecting logs...");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received. Shutting down gracefully...");

    // Send shutdown signal to all tasks
    shutdown_tx.send(true).expect("Failed to send shutdown signal");

    // Wait for all tasks to complete
    let task_names: Vec<String> = tail_tasks.iter().map(|(name, _)| name.clone()).collect();
    let results = join_all(tail_tasks.into_iter().map(|(_, handle)| handle)).await;
    for (name, result) in task_names.iter().zip(results) {
        if let Err(e) = result {
            error!("Tail task for {} panicked: {:?}", name, e);
        }
    }
    if let Err(e) = server_task.await {
        error!("Metrics server task panicked: {:?}", e);
    }

    info!("All tasks shut down. Exiting.");

    Ok(())
}
