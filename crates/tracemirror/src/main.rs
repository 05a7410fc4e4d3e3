//! tracemirror CLI (`tm`): thin wrapper over tracemirror-core.
//!
//! Surfaces the core's operational controls — one-shot and watched sync,
//! scheduler/source status, unified metrics, latency series, forecasts,
//! and scaling recommendations — as JSON on stdout for scripting and for
//! the dashboard's backend to shell out to during development.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::warn;

use tracemirror_core::aggregator::{DataSource, MetricsAggregator};
use tracemirror_core::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, SharedCircuitBreaker};
use tracemirror_core::config::Config;
use tracemirror_core::forecast::ForecastEngine;
use tracemirror_core::logging::{init_logging, LogConfig};
use tracemirror_core::remote::{HttpTraceProvider, RemoteTelemetryClient};
use tracemirror_core::scheduler::SyncScheduler;
use tracemirror_core::store::LocalStore;

#[derive(Debug, Parser)]
#[command(name = "tm", version, about = "LLM trace telemetry mirror and forecasting")]
struct Cli {
    /// Path to tracemirror.toml (defaults to the user config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run one sync cycle now and print the report
    Sync {
        /// Collection to sync
        #[arg(long, default_value = "traces")]
        collection: String,
    },
    /// Run the background scheduler until Ctrl-C
    Watch,
    /// Print scheduler and data-source status
    Status,
    /// Print unified metrics over a window
    Metrics {
        /// Window in hours (clamped to 1..=168)
        #[arg(long, default_value_t = 24)]
        hours: u32,
        /// Data source: local, remote, or all
        #[arg(long, default_value = "local")]
        source: String,
    },
    /// Print the dense hourly latency series
    Series {
        #[arg(long, default_value_t = 24)]
        hours: u32,
        #[arg(long, default_value = "local")]
        source: String,
    },
    /// Print recent traces, newest first
    Traces {
        #[arg(long, default_value_t = 20)]
        limit: usize,
        #[arg(long, default_value = "local")]
        source: String,
    },
    /// Print a load forecast
    Forecast {
        /// Hours ahead (clamped to 1..=168)
        #[arg(long, default_value_t = 24)]
        hours: u32,
    },
    /// Print a scaling recommendation
    Recommend {
        #[arg(long, default_value_t = 24)]
        hours: u32,
    },
}

/// Constructed service graph shared by the subcommands.
struct Services {
    scheduler: Arc<SyncScheduler>,
    aggregator: Arc<MetricsAggregator>,
    forecast: ForecastEngine,
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    if let Some(path) = path {
        return Config::load_from(path)
            .with_context(|| format!("loading config from {}", path.display()));
    }
    let default_path = dirs::config_dir()
        .map(|dir| dir.join("tracemirror").join("tracemirror.toml"));
    match default_path {
        Some(path) if path.exists() => {
            Config::load_from(&path).with_context(|| format!("loading {}", path.display()))
        }
        _ => Ok(Config::default()),
    }
}

fn expand_home(path: &str) -> PathBuf {
    path.strip_prefix("~/").map_or_else(
        || PathBuf::from(path),
        |rest| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(rest)
        },
    )
}

fn build_services(config: &Config) -> Result<Services> {
    let db_path = expand_home(&config.general.db_path);
    let store = Arc::new(LocalStore::open(&db_path).context("opening local store")?);

    let collection = config
        .sync
        .collections
        .first()
        .cloned()
        .unwrap_or_else(|| "traces".to_string());

    // A boot-time configuration failure disables the sync subsystem but
    // never the process: local reads keep working in degraded mode.
    let (scheduler, client) = match config.validate() {
        Ok(()) => {
            let provider = HttpTraceProvider::new(&config.remote)
                .context("building remote provider")?;
            let breaker = SharedCircuitBreaker::new(CircuitBreaker::with_name(
                "remote_provider",
                CircuitBreakerConfig::new(
                    config.breaker.failure_threshold,
                    config.breaker.recovery_timeout(),
                ),
            ));
            let client = Arc::new(RemoteTelemetryClient::new(Box::new(provider), breaker));
            let scheduler = Arc::new(SyncScheduler::new(
                Arc::clone(&store),
                Arc::clone(&client),
                config,
            ));
            (scheduler, Some(client))
        }
        Err(e) => {
            warn!(error = %e, "Configuration invalid; sync subsystem disabled");
            let scheduler = Arc::new(SyncScheduler::unavailable(
                Arc::clone(&store),
                config,
                e.to_string(),
            ));
            (scheduler, None)
        }
    };

    let aggregator = Arc::new(MetricsAggregator::new(
        store,
        client,
        collection,
        config.remote.page_size,
    ));
    let forecast = ForecastEngine::new(Arc::clone(&aggregator), config.forecast.clone());

    Ok(Services {
        scheduler,
        aggregator,
        forecast,
    })
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn parse_source(raw: &str) -> Result<DataSource> {
    raw.parse::<DataSource>().map_err(anyhow::Error::msg)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;

    init_logging(&LogConfig {
        level: config.general.log_level.clone(),
        ..LogConfig::default()
    })
    .ok();

    let services = build_services(&config)?;

    match cli.command {
        Command::Sync { collection } => {
            let report = services
                .scheduler
                .trigger_manual(&collection)
                .await
                .context("manual sync rejected")?;
            print_json(&report)?;
        }
        Command::Watch => {
            SyncScheduler::start(&services.scheduler);
            eprintln!("tm: scheduler running; press Ctrl-C to stop");
            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            eprintln!("tm: stopping (in-flight cycle will finish)");
            services.scheduler.shutdown().await;
        }
        Command::Status => {
            #[derive(Serialize)]
            struct StatusOut {
                scheduler: tracemirror_core::scheduler::SchedulerStatus,
                sources: tracemirror_core::aggregator::DataSourceStatus,
            }
            print_json(&StatusOut {
                scheduler: services.scheduler.status(),
                sources: services.aggregator.data_source_status(),
            })?;
        }
        Command::Metrics { hours, source } => {
            let source = parse_source(&source)?;
            let metrics = services.aggregator.unified_metrics(hours, source).await;
            print_json(&metrics)?;
        }
        Command::Series { hours, source } => {
            let source = parse_source(&source)?;
            let series = services.aggregator.latency_time_series(hours, source).await;
            print_json(&series)?;
        }
        Command::Traces { limit, source } => {
            let source = parse_source(&source)?;
            let traces = services.aggregator.recent_traces(limit, source).await;
            print_json(&traces)?;
        }
        Command::Forecast { hours } => {
            let points = services
                .forecast
                .generate_load_forecast(hours)
                .await
                .context("forecast unavailable")?;
            print_json(&points)?;
        }
        Command::Recommend { hours } => {
            let recommendation = services
                .forecast
                .scaling_recommendations(hours)
                .await
                .context("recommendation unavailable")?;
            print_json(&recommendation)?;
        }
    }

    Ok(())
}
