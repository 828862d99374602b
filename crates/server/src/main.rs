mod bootstrap;
mod geocode;
mod health;
mod twilio;
mod voice;

use std::future::IntoFuture;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use callquote_agent::AgentRuntime;
use callquote_core::config::{AppConfig, LoadOptions};
use callquote_db::CallRecordRepository;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn init_logging(config: &AppConfig) {
    use callquote_core::config::LogFormat::*;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    let builder = tracing_subscriber::fmt().with_target(false).with_env_filter(filter);

    match config.logging.format {
        Compact => builder.compact().init(),
        Pretty => builder.pretty().init(),
        Json => builder.json().init(),
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
    let address = format!("{}:{}", app.config.server.bind_address, app.config.server.port);
    let listener = tokio::net::TcpListener::bind(&address).await?;

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let sweeper = spawn_sweeper(
        app.runtime.clone(),
        app.records.clone(),
        Duration::from_secs(app.config.conversation.sweep_interval_secs.max(1)),
        Duration::from_secs(app.config.conversation.idle_timeout_secs),
        shutdown_tx.subscribe(),
    );

    let server = tokio::spawn(
        axum::serve(listener, app.router())
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.changed().await;
            })
            .into_future(),
    );
    info!(
        event_name = "system.server.started",
        correlation_id = "bootstrap",
        bind_address = %address,
        "callquote-server listening"
    );

    tokio::signal::ctrl_c().await?;
    info!(event_name = "system.server.stopping", correlation_id = "shutdown", "shutdown requested");
    let _ = shutdown_tx.send(true);

    let grace = Duration::from_secs(app.config.server.graceful_shutdown_secs);
    match tokio::time::timeout(grace, server).await {
        Ok(joined) => joined??,
        Err(_) => warn!(
            event_name = "system.server.shutdown_timeout",
            correlation_id = "shutdown",
            grace_secs = grace.as_secs(),
            "in-flight requests did not drain before the grace period ended"
        ),
    }
    let _ = sweeper.await;

    let remaining = app.runtime.sweep_idle(Duration::ZERO).await;
    for record in &remaining {
        voice::persist_record(app.records.as_ref(), record).await;
    }
    info!(
        event_name = "system.server.stopped",
        correlation_id = "shutdown",
        abandoned_sessions = remaining.len(),
        "callquote-server stopped"
    );
    app.db_pool.close().await;
    Ok(())
}

/// Abandons idle sessions on a fixed interval and persists their records.
fn spawn_sweeper(
    runtime: Arc<AgentRuntime>,
    records: Arc<dyn CallRecordRepository>,
    every: Duration,
    max_idle: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    for record in runtime.sweep_idle(max_idle).await {
                        voice::persist_record(records.as_ref(), &record).await;
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    })
}
