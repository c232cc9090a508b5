use anyhow::Context;
use clap::Parser;
use posguard::cli::{Cli, Commands};
use posguard::config::{AppConfig, LoggingConfig};
use posguard::coordination::LiquidationReport;
use posguard::error::{PosguardError, Result};
use posguard::exchange::build_gateway;
use posguard::PositionEngine;
use std::path::Path;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = AppConfig::load_from(&cli.config_dir).with_context(|| {
        format!("loading configuration from {}", cli.config_dir.display())
    })?;
    cli.apply_overrides(&mut config)?;
    config
        .validate()
        .map_err(|errors| PosguardError::Validation(errors.join("; ")))
        .context("invalid configuration")?;

    let _guard = init_logging(&config.logging, &config.file_stem());

    match cli.command {
        Commands::Run => run_engine(&config).await.context("run"),
        Commands::Flatten => flatten_once(config).await.context("flatten"),
        Commands::Position => show_position(&config).await.context("position"),
    }
}

/// Console logging plus an optional daily-rotated file.
///
/// The returned guard flushes the file writer on drop and must live until exit.
fn init_logging(logging: &LoggingConfig, file_stem: &str) -> Option<WorkerGuard> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},posguard=debug", logging.level)));

    let (file_layer, guard) = match logging.dir.as_deref() {
        Some(dir) => match prepare_log_dir(dir) {
            Ok(()) => {
                let file_appender =
                    tracing_appender::rolling::daily(dir, format!("{}.log", file_stem));
                let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
                let layer = tracing_subscriber::fmt::layer()
                    .with_writer(non_blocking)
                    .with_ansi(false)
                    .with_target(true);
                (Some(layer), Some(guard))
            }
            Err(e) => {
                eprintln!(
                    "Warning: Could not write to log directory {} ({}), file logging disabled",
                    dir.display(),
                    e
                );
                (None, None)
            }
        },
        None => (None, None),
    };

    let (json_layer, plain_layer) = if logging.json {
        (Some(tracing_subscriber::fmt::layer().json().with_target(true)), None)
    } else {
        (
            None,
            Some(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            ),
        )
    };

    let file_logging_enabled = file_layer.is_some();
    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(plain_layer)
        .with(file_layer)
        .init();

    if file_logging_enabled {
        info!("File logging enabled: {}.log", file_stem);
    }

    guard
}

// `rolling::daily` panics if it cannot create the first file
fn prepare_log_dir(dir: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;
    let test_file = dir.join(".posguard_write_test");
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&test_file)?;
    let _ = std::fs::remove_file(&test_file);
    Ok(())
}

async fn run_engine(config: &AppConfig) -> Result<()> {
    let engine = PositionEngine::from_config(config)?;
    engine.start().await?;
    info!(
        exchange = %config.venue.exchange,
        instrument = %config.venue.instrument,
        "Tracking position; Ctrl+C to liquidate and exit"
    );

    let mut positions = engine.ledger().subscribe();
    let watch_positions = async {
        while positions.changed().await.is_ok() {
            let position = *positions.borrow();
            info!("Position: {}", position);
        }
    };

    tokio::select! {
        _ = shutdown_signal() => info!("Shutdown signal received"),
        _ = watch_positions => warn!("Position ledger closed"),
    }

    let report = engine.stop().await?;
    log_report(&report);
    Ok(())
}

async fn flatten_once(mut config: AppConfig) -> Result<()> {
    config.venue.stream = false;
    let engine = PositionEngine::from_config(&config)?;
    engine.start().await?;
    let report = engine.stop().await?;
    log_report(&report);
    Ok(())
}

async fn show_position(config: &AppConfig) -> Result<()> {
    let gateway = build_gateway(config, None)?;
    let position = gateway.fetch_position().await?;
    println!("{} {}", gateway.instrument(), position);
    Ok(())
}

fn log_report(report: &LiquidationReport) {
    for (ack, plan) in &report.flattened {
        info!(
            order_id = %ack.order_id,
            side = %plan.side,
            size = %plan.size,
            "Settled open position"
        );
    }
    if report.flattened.is_empty() {
        info!(
            position = %report.fetched_position,
            "Liquidation complete, nothing to flatten"
        );
    } else {
        info!(orders = report.flattened.len(), "Liquidation complete");
    }
    if !report.residual_open_orders.is_empty() {
        warn!(
            "Orders still open after cancellation: {:?}",
            report.residual_open_orders
        );
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => error!("Failed to install SIGTERM handler: {}", e),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
