use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::oneshot;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use fleetguard::web::WebServer;
use fleetguard_core::api::FleetGuardBuilder;
use fleetguard_core::config::{Command, Config, Settings};
use fleetguard_core::rules::MetricSnapshot;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let cli = Config::parse_args();

    // Setup logging
    setup_logging(cli.debug);

    // Load settings: file, then environment, then CLI
    let mut settings = Settings::load(cli.config.as_ref())?;
    settings.merge_env();
    settings.merge_cli(&cli);
    settings.validate();

    match &cli.command {
        Some(Command::Evaluate { path }) => evaluate(settings, path),
        Some(Command::Serve) | None => serve(settings).await,
    }
}

fn setup_logging(debug: bool) {
    let filter = if debug {
        EnvFilter::new("fleetguard=debug,fleetguard_core=debug")
    } else {
        EnvFilter::new("fleetguard=info,fleetguard_core=info")
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}

/// Evaluate one snapshot and print the assessment as JSON
fn evaluate(settings: Settings, path: &Path) -> Result<()> {
    let content = if path.as_os_str() == "-" {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("Failed to read snapshot from stdin")?;
        buf
    } else {
        std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read snapshot file: {:?}", path))?
    };

    let snapshot: MetricSnapshot =
        serde_json::from_str(&content).context("Failed to parse metric snapshot")?;

    let guard = FleetGuardBuilder::new(settings).build();
    let assessment = guard.assess(&snapshot);
    println!("{}", serde_json::to_string_pretty(&assessment)?);
    Ok(())
}

/// Run background tasks and the status API until SIGINT/SIGTERM
async fn serve(settings: Settings) -> Result<()> {
    let web_settings = settings.web.clone();
    let guard = Arc::new(FleetGuardBuilder::new(settings).open()?);
    guard.start();

    let (stop_tx, stop_rx) = oneshot::channel();
    let server = web_settings
        .enabled
        .then(|| WebServer::new(web_settings.clone(), guard.clone()).start(stop_rx));

    match server {
        Some(mut handle) => {
            tokio::select! {
                _ = shutdown_signal() => {
                    info!("Shutdown signal received");
                    let _ = stop_tx.send(());
                    match handle.await {
                        Ok(Err(e)) => error!("Status API error: {:#}", e),
                        Err(e) => error!("Status API task failed: {}", e),
                        Ok(Ok(())) => {}
                    }
                }
                result = &mut handle => {
                    match result {
                        Ok(Err(e)) => error!("Status API error: {:#}", e),
                        Err(e) => error!("Status API task failed: {}", e),
                        Ok(Ok(())) => warn!("Status API exited unexpectedly"),
                    }
                }
            }
        }
        None => {
            info!("Status API disabled");
            shutdown_signal().await;
            info!("Shutdown signal received");
        }
    }

    let outcome = guard.shutdown().await;
    if outcome.is_failure() {
        anyhow::bail!("final usage flush failed; pending counters were lost");
    }
    Ok(())
}

/// Resolves on Ctrl-C or (on unix) SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
