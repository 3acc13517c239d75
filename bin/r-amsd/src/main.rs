//! ---
//! ams_section: "01-core-functionality"
//! ams_subsection: "binary"
//! ams_type: "source"
//! ams_scope: "code"
//! ams_description: "Binary entrypoint for the R-AMS daemon."
//! ams_version: "v0.0.0-prealpha"
//! ams_owner: "tbd"
//! ---
mod seed;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use clap::{Parser, Subcommand};
use r_ams_common::config::LoadedAppConfig;
use r_ams_common::{init_tracing, AppConfig, LogFormat};
use r_ams_core::{AgentService, AssetProcessor, AssetStore, ChannelBus, InMemoryAssetStore};
use r_ams_metrics::{new_registry, spawn_http_server, DaemonMetrics, LinkingMetrics};
use tokio::signal;
use tracing::{info, warn};

use crate::seed::SeedFile;

#[derive(Debug, Parser)]
#[command(
    author,
    version = concat!("R-AMS ", env!("CARGO_PKG_VERSION")),
    about = "R-AMS daemon",
    long_about = None
)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(long, value_name = "FORMAT", help = "Override log format (structured-json|pretty)")]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Run the agent linking service")]
    Run,
    #[command(about = "Load and validate the configuration, then exit")]
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from("configs/example.dev.toml"));

    let load_started = Instant::now();
    let LoadedAppConfig {
        config: mut config,
        source,
    } = AppConfig::load_with_source(&candidates)?;
    let load_duration = load_started.elapsed();
    if let Some(format) = cli.log_format {
        config.logging.format = format;
    }

    match cli.command.unwrap_or(Commands::Run) {
        Commands::CheckConfig => {
            render_config_summary(&config, &source);
            Ok(())
        }
        Commands::Run => {
            init_tracing("r-amsd", &config.logging)?;
            info!(config_path = %source.display(), "configuration loaded");
            let registry = new_registry();
            let daemon_metrics = DaemonMetrics::new(registry.clone())?;
            daemon_metrics.observe_config_load(load_duration.as_secs_f64());
            daemon_metrics.inc_start();
            run_daemon(config, daemon_metrics).await
        }
    }
}

async fn run_daemon(config: AppConfig, daemon_metrics: DaemonMetrics) -> Result<()> {
    let registry = daemon_metrics.registry();
    let metrics_server = if config.metrics.enabled {
        info!(address = %config.metrics.listen, "metrics exporter enabled");
        Some(spawn_http_server(registry.clone(), config.metrics.listen)?)
    } else {
        info!("metrics exporter disabled by configuration");
        None
    };

    let store = Arc::new(InMemoryAssetStore::new());
    if let Some(path) = &config.seed.path {
        SeedFile::from_path(path)?.apply(store.as_ref())?;
    } else {
        info!("no asset seed configured");
    }

    let (bus, receivers) = ChannelBus::new();
    let store_handle: Arc<dyn AssetStore> = store.clone();
    let service = AgentService::builder(store_handle.clone(), Arc::new(bus))
        .metrics(LinkingMetrics::new(registry)?)
        .config(config.linking.clone())
        .build();
    let processor = Arc::new(AssetProcessor::new(store_handle, service.clone()));

    let dispatcher = service.spawn_actuator_dispatcher(receivers.actuator);
    let consumer = processor.spawn_sensor_consumer(receivers.sensor);
    service.start();

    info!(
        agents = service.agents().len(),
        assets = store.len(),
        "daemon running; waiting for termination signal"
    );
    signal::ctrl_c().await?;
    info!("ctrl-c received; shutting down");

    service.stop();
    dispatcher.abort();
    consumer.abort();

    if let Some(server) = metrics_server {
        if let Err(err) = server.shutdown().await {
            warn!(error = %err, "metrics exporter did not shut down cleanly");
        }
    }
    Ok(())
}

fn render_config_summary(config: &AppConfig, source: &Path) {
    println!("Configuration: {}", source.display());
    println!("Log directory: {}", config.logging.directory.display());
    println!("Log format: {:?}", config.logging.format);
    if config.metrics.enabled {
        println!("Metrics: enabled on {}", config.metrics.listen);
    } else {
        println!("Metrics: disabled");
    }
    match config.linking.discovery_timeout {
        Some(timeout) => println!("Discovery timeout: {}s", timeout.as_secs()),
        None => println!("Discovery timeout: none"),
    }
    println!("Actuator backlog warning: {}", config.linking.actuator_queue_warn);
    match &config.seed.path {
        Some(path) => println!("Seed: {}", path.display()),
        None => println!("Seed: none"),
    }
}
