use anyhow::{Context, Result};
use commandwave_sync::sync::{Downstream, LogNotifier, SyncCoordinator};
use commandwave_sync::transport::{Identity, TransportChannel};
use commandwave_sync::utils::journal::SyncJournal;
use commandwave_sync::{BackendClient, Config};
use std::sync::Arc;
use tracing::Level;
use tracing_subscriber::{filter::EnvFilter, fmt::format::FmtSpan, FmtSubscriber};

fn setup_logging(log_level_str: &str) -> Result<()> {
    let level = match log_level_str.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("commandwave_sync={}", level)));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_ansi(false)
        .with_writer(std::io::stderr)
        .with_level(true)
        .with_span_events(FmtSpan::CLOSE)
        .json()
        .finish();

    tracing::subscriber::set_global_default(subscriber).context("Failed to set tracing subscriber")
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load().context("Failed to load configuration")?;
    setup_logging(&config.log_level)?;

    tracing::info!(version = %env!("CARGO_PKG_VERSION"), "Starting commandwave-sync");
    tracing::debug!("Loaded configuration: {:?}", config);

    let journal = SyncJournal::from_config(&config).map(SyncJournal::spawn);
    let channel = match &journal {
        Some((handle, _)) => {
            TransportChannel::with_journal(config.server_url.clone(), config.reconnect, handle.clone())
        }
        None => TransportChannel::new(config.server_url.clone(), config.reconnect),
    };

    let backend = BackendClient::new(&config)?;
    let mut coordinator = SyncCoordinator::new(
        &config,
        Arc::new(channel.clone()),
        Arc::new(backend),
        Downstream::default().with_notifier(LogNotifier),
    );
    coordinator.attach(&channel);
    let handle = coordinator.handle();
    let store = coordinator.store();

    channel.connect(&Identity::new(config.username.clone()))?;
    let running = tokio::spawn(async move {
        coordinator.run().await;
    });

    tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl-C")?;
    tracing::info!(sessions = store.len(), "Shutting down");

    handle.shutdown();
    if let Err(e) = running.await {
        tracing::error!(error = %e, "Coordinator task failed");
    }
    channel.disconnect().await;

    if let Some((handle, writer)) = journal {
        drop(handle);
        drop(channel);
        if let Err(e) = writer.await {
            tracing::error!(error = %e, "Journal writer failed");
        }
    }

    tracing::info!("Shutdown complete.");
    Ok(())
}
