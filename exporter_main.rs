//! # engine-exporter
//!
//! Binary entry point: loads configuration, wires one [`EngineSource`] per
//! configured engine into a [`Collector`] and serves it on `/metrics`.
//!
//! [`EngineSource`]: engine_exporter::EngineSource
//! [`Collector`]: engine_exporter::Collector

use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result as AnyhowResult};
use clap::Parser;
use prometheus::Registry;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use engine_exporter::{
    build_collector, init_logging, render_metrics, serve, Cli, Commands,
    ExporterConfig, ExporterError, ExporterResult, EXPORTER_NAME, EXPORTER_VERSION,
};

// ----------------------------------------------------------------------------
// CLI Handler Functions
// ----------------------------------------------------------------------------

/// Handle the validate subcommand
fn handle_validate(config_path: &Path, verbose: bool) -> ExporterResult<()> {
    println!("Validating configuration file: {}", config_path.display());

    match ExporterConfig::load(config_path) {
        Ok(config) => {
            println!("✅ Configuration is valid!");

            if verbose {
                println!("\n📋 Parsed configuration:");
                println!("{}", "=".repeat(60));
                match toml::to_string_pretty(&config) {
                    Ok(s) => println!("{}", s),
                    Err(e) => println!("Failed to serialize: {}", e),
                }
            }

            println!("\n📊 Configuration Summary:");
            println!("  • Listen address: {}", config.exporter.listen_addr);
            println!("  • Ignore patterns: {}", config.exporter.ignored_metrics.len());
            println!(
                "  • Bucket table: {}",
                if config.exporter.buckets.is_some() { "custom" } else { "default" }
            );
            println!("  • Engines:");
            for engine in &config.engines {
                println!(
                    "    - index {} rank {} ({})",
                    engine.index,
                    engine.rank,
                    engine.snapshot.display()
                );
            }

            Ok(())
        }
        Err(e) => {
            println!("❌ Configuration validation failed!");
            println!("Error: {}", e);
            Err(ExporterError::Config(e))
        }
    }
}

/// Handle the generate-config subcommand
fn handle_generate_config(output: Option<&Path>) -> ExporterResult<()> {
    let config_str = ExporterConfig::generate_default_config()?;

    match output {
        Some(path) => {
            fs::write(path, &config_str)?;
            println!("✅ Starter configuration written to: {}", path.display());
        }
        None => {
            println!("{}", config_str);
        }
    }

    Ok(())
}

/// Cancel `token` on SIGINT or SIGTERM
fn spawn_signal_handler(token: CancellationToken) {
    tokio::spawn(async move {
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };

        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Received SIGINT");
            }
            _ = terminate => {
                info!("Received SIGTERM");
            }
        }

        token.cancel();
    });
}

// ----------------------------------------------------------------------------
// Main
// ----------------------------------------------------------------------------

#[tokio::main]
async fn main() -> AnyhowResult<()> {
    let cli = Cli::parse();

    // Subcommands that don't need a collector
    match &cli.command {
        Some(Commands::GenerateConfig { output }) => {
            handle_generate_config(output.as_deref())?;
            return Ok(());
        }
        Some(Commands::Validate { verbose }) => {
            handle_validate(&cli.config, *verbose)?;
            return Ok(());
        }
        _ => {}
    }

    let mut config = ExporterConfig::load(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;

    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
    if let Some(listen) = &cli.listen {
        config.exporter.listen_addr = listen.clone();
    }
    let addr = config.listen_addr()?;

    init_logging(&config.logging)?;

    info!("{} v{}", EXPORTER_NAME, EXPORTER_VERSION);

    // Cancelling the root token stops every engine source
    let shutdown = CancellationToken::new();
    let collector = build_collector(&config, &shutdown)?;
    info!(
        engines = collector.sources().len(),
        buckets = collector.buckets().len(),
        "Collector ready"
    );

    let registry = Arc::new(Registry::new());
    registry.register(Box::new(collector))?;

    match cli.command {
        Some(Commands::Dump) => {
            let registry = Arc::clone(&registry);
            let text = tokio::task::spawn_blocking(move || render_metrics(&registry)).await??;
            print!("{}", text);
        }
        Some(Commands::Run) | None => {
            spawn_signal_handler(shutdown.clone());
            serve(addr, registry, shutdown).await?;
        }
        // Handled before initialization
        Some(Commands::Validate { .. }) | Some(Commands::GenerateConfig { .. }) => {}
    }

    info!("Shutdown complete");
    Ok(())
}
