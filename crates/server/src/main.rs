mod bootstrap;
mod health;
mod transport;

use std::time::Duration;

use anyhow::Result;
use ganglion_agent::mailbox::MailboxDispatcher;
use ganglion_core::config::{AppConfig, LoadOptions};
use tokio::io::BufReader;

fn init_logging(config: &AppConfig) {
    use ganglion_core::config::LogFormat::*;
    use tracing::Level;

    let log_level = config.logging.level.parse::<Level>().unwrap_or(Level::INFO);

    // stdout carries the reply stream, so every format logs to stderr.
    match config.logging.format {
        Compact => {
            tracing_subscriber::fmt()
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_max_level(log_level)
                .compact()
                .init();
        }
        Pretty => {
            tracing_subscriber::fmt()
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_max_level(log_level)
                .pretty()
                .init();
        }
        Json => {
            tracing_subscriber::fmt()
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_max_level(log_level)
                .json()
                .init();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    run().await
}

pub async fn run() -> Result<()> {
    let config = AppConfig::load(LoadOptions::default())?;
    init_logging(&config);

    let app = bootstrap::bootstrap_with_config(config).await?;

    health::spawn(
        &app.config.server.bind_address,
        app.config.server.health_check_port,
        app.monitor.clone(),
    )
    .await?;
    let probes = app.monitor.clone().spawn_probe_loop();

    let (dispatcher, replies) =
        MailboxDispatcher::channel(app.engine.clone(), app.config.agent.persona.clone(), 64);

    tracing::info!(
        event_name = "system.server.started",
        correlation_id = "bootstrap",
        "ganglion runtime accepting messages on stdin"
    );

    let summary = transport::run(
        BufReader::new(tokio::io::stdin()),
        tokio::io::stdout(),
        &dispatcher,
        replies,
        wait_for_shutdown(),
        Duration::from_secs(app.config.server.graceful_shutdown_secs),
    )
    .await?;
    probes.abort();

    tracing::info!(
        event_name = "system.server.stopping",
        correlation_id = "shutdown",
        received = summary.received,
        rejected = summary.rejected,
        replied = summary.replied,
        abandoned = summary.abandoned,
        "ganglion runtime stopping"
    );

    Ok(())
}

async fn wait_for_shutdown() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::warn!(
            event_name = "system.server.signal_error",
            error = %error,
            "could not listen for shutdown signal; running until input closes"
        );
        std::future::pending::<()>().await;
    }
}
