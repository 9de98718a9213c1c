// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Corral: a multi-tenant request broker fronting an interactive CLI agent.
//!
//! Clients submit prompts over HTTP with a bearer credential; the broker
//! routes each submission onto a bounded pool of CLI child processes,
//! keeping conversation continuity in a durable session store and writing
//! one usage row per admitted submission.

pub mod adapter;
pub mod config;
pub mod credential;
pub mod dispatch;
pub mod error;
pub mod instance;
pub mod pool;
pub mod ratelimit;
pub mod request;
pub mod session;
pub mod state;
pub mod storage;
pub mod transport;
pub mod usage;

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::adapter::CliCommand;
use crate::config::CorralConfig;
use crate::credential::CredentialStore;
use crate::dispatch::{DispatchConfig, Dispatcher};
use crate::instance::InstanceLimits;
use crate::pool::{Pool, PoolConfig};
use crate::ratelimit::SlidingWindow;
use crate::request::RequestRegistry;
use crate::session::SessionStore;
use crate::state::CorralState;
use crate::storage::Storage;
use crate::transport::build_router;
use crate::usage::UsageLogger;

/// Run the broker until shutdown.
pub async fn run(config: CorralConfig) -> anyhow::Result<()> {
    config.validate()?;
    let config = Arc::new(config);
    let shutdown = CancellationToken::new();

    let storage = Arc::new(Storage::open(&config.db).await?);

    let (usage, usage_writer) = UsageLogger::spawn(Arc::clone(&storage), shutdown.clone());

    let credentials =
        Arc::new(CredentialStore::new(Arc::clone(&storage), config.credential_cache_ttl()));
    CredentialStore::spawn_touch_writer(Arc::clone(&credentials), shutdown.clone());

    let sessions = Arc::new(SessionStore::new(
        Arc::clone(&storage),
        config.session_context_cap,
        config.session_ttl(),
    ));
    SessionStore::spawn_sweeper(
        Arc::clone(&sessions),
        Duration::from_secs(config.sweep_interval_secs),
        shutdown.clone(),
    );

    let limiter = Arc::new(SlidingWindow::new(config.rate_limit_window()));

    let requests = RequestRegistry::new(config.result_retention());
    RequestRegistry::spawn_gc(Arc::clone(&requests), Duration::from_secs(60), shutdown.clone());

    let mut cli = CliCommand::from_argv(&config.effective_cli_command());
    if let Some(dir) = &config.cli_config_dir {
        cli = cli.with_env("CLAUDE_CONFIG_DIR", &dir.to_string_lossy());
    }

    let pool = Pool::new(PoolConfig {
        max_instances: config.max_instances,
        limits: InstanceLimits {
            message_cap: config.max_messages_per_instance,
            idle_timeout: config.idle_timeout(),
            history_pairs: config.history_pairs,
        },
        max_age: config.max_instance_age(),
        destroy_retry: config.destroy_retry(),
        maintenance_interval: Duration::from_secs(config.maintenance_interval_secs),
        per_call_timeout: config.per_call_timeout(),
        cli,
    });
    pool.spawn_event_loop(shutdown.clone());

    let dispatcher = Dispatcher::new(
        DispatchConfig {
            queue_capacity: config.queue_capacity,
            credential_ceiling: config.credential_hourly_ceiling,
            address_ceiling: config.address_hourly_ceiling,
            default_tool_id: "claude".to_owned(),
        },
        Arc::clone(&credentials),
        limiter,
        Arc::clone(&sessions),
        Arc::clone(&pool),
        Arc::clone(&usage),
        Arc::clone(&requests),
    );
    dispatcher.spawn_drainer(shutdown.clone());

    let state = Arc::new(CorralState {
        config: Arc::clone(&config),
        storage: Arc::clone(&storage),
        dispatcher: Arc::clone(&dispatcher),
        sessions,
        credentials,
        pool: Arc::clone(&pool),
        shutdown: shutdown.clone(),
    });

    spawn_signal_handler(shutdown.clone());

    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("corral listening on {addr}");
    let router = build_router(state);
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .await?;

    // Drain: refuse new work, fail parked work, give in-flight calls the
    // grace period, then terminate whatever is left and close the store.
    let coordinator = async {
        dispatcher.begin_drain();
        dispatcher.fail_queued("service is shutting down").await;
        pool.shutdown(config.shutdown_grace()).await;
        let _ = usage_writer.await;
        if let Err(e) = (*storage).clone().close().await {
            warn!(err = %e, "storage close failed");
        }
    };
    match tokio::time::timeout(config.shutdown_hard_timeout(), coordinator).await {
        Ok(()) => info!("shutdown complete"),
        Err(_) => warn!("hard shutdown timeout reached, exiting"),
    }

    Ok(())
}

/// First signal drains gracefully; a second one forces exit.
fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).ok();
        let mut sigint =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt()).ok();

        tokio::select! {
            _ = async {
                if let Some(ref mut s) = sigterm { s.recv().await } else { std::future::pending().await }
            } => {
                info!("received SIGTERM");
            }
            _ = async {
                if let Some(ref mut s) = sigint { s.recv().await } else { std::future::pending().await }
            } => {
                info!("received SIGINT");
            }
        }
        shutdown.cancel();

        tokio::select! {
            _ = async {
                if let Some(ref mut s) = sigterm { s.recv().await } else { std::future::pending().await }
            } => {
                info!("received SIGTERM again, forcing exit");
            }
            _ = async {
                if let Some(ref mut s) = sigint { s.recv().await } else { std::future::pending().await }
            } => {
                info!("received SIGINT again, forcing exit");
            }
        }
        std::process::exit(130);
    });
}
