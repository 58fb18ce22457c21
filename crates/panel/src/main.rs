mod api;
mod cli;
mod config;
mod events;
mod hub;
mod listener;
mod logging;
mod supervisor;
mod tasks;
#[cfg(test)]
mod test_utils;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::api::AppState;
use crate::cli::Args;
use crate::config::load_panel_config;
use crate::events::{MemoryEventStore, SystemLogger};
use crate::hub::Hub;
use crate::listener::{CredentialCache, EventListener, StaticCredential};
use crate::logging::init_tracing;
use crate::supervisor::Supervisor;
use crate::tasks::TaskRunner;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let mut config = load_panel_config(&args.config)
        .with_context(|| format!("failed to load config {}", args.config.display()))?;
    if let Some(listen_addr) = args.listen_addr {
        config.listen_addr = listen_addr;
    }
    let _log_guard = init_tracing(&config.log_dir(), args.log_to_stderr)?;
    info!(
        listen_addr = %config.listen_addr,
        config = %args.config.display(),
        agent_dir = %config.supervisor.agent_dir.display(),
        "clawpanel starting"
    );

    let shutdown = CancellationToken::new();
    let hub = Hub::spawn(shutdown.clone());
    let syslog = SystemLogger::new(Arc::new(MemoryEventStore::new()), hub.clone());
    let supervisor = Supervisor::new(config.supervisor.clone(), hub.clone());
    let tasks = TaskRunner::new(hub.clone(), config.history_limit);

    let listener = if config.listener_enabled {
        let credentials = Arc::new(CredentialCache::new(Arc::new(StaticCredential(
            config.access_token.clone(),
        ))));
        Some(EventListener::spawn(
            config.listener.clone(),
            syslog.clone(),
            credentials,
            &shutdown,
        ))
    } else {
        info!(event = "listener.disabled");
        None
    };

    let listen_addr = config.listen_addr.clone();
    let app = api::router(AppState {
        config: Arc::new(config),
        hub: hub.clone(),
        supervisor: supervisor.clone(),
        tasks,
        syslog: syslog.clone(),
    });
    syslog
        .log("system", "panel.start", &format!("ClawPanel listening on {listen_addr}"))
        .await;

    let tcp = TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("failed to bind {listen_addr}"))?;
    info!(addr = %listen_addr, "clawpanel listening");
    axum::serve(tcp, app)
        .with_graceful_shutdown(wait_for_shutdown(shutdown.clone()))
        .await?;

    info!("clawpanel shutting down");
    supervisor.stop_all().await;
    if let Some(listener) = listener {
        listener.stop().await;
    }
    shutdown.cancel();
    Ok(())
}

async fn wait_for_shutdown(shutdown: CancellationToken) {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
    shutdown.cancel();
}
