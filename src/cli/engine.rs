use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::core::config::RuntimeConfig;
use crate::core::dispatcher::{Invoker, WebhookDispatcher};
use crate::core::feedback::FeedbackPolicy;
use crate::core::lifecycle::LifecycleManager;
use crate::core::runtime::Runtime;
use crate::core::scheduler::Poller;
use crate::core::store::Store;
use crate::core::vault::CredentialVault;
use crate::core::worker::retry::RetryPolicy;
use crate::core::worker::{WorkerContext, WorkerPool, WorkerSettings};
use crate::interfaces::web::{ApiServer, ApiServerConfig};

/// Boot every component against `data_dir` and run until Ctrl+C or SIGTERM.
pub async fn run_engine(
    data_dir: &Path,
    api_host: Option<String>,
    api_port: Option<u16>,
) -> Result<()> {
    let mut config = RuntimeConfig::load(data_dir).await?;
    if let Some(host) = api_host {
        config.api.host = host;
    }
    if let Some(port) = api_port {
        config.api.port = port;
    }

    let log_tx = crate::logging::init(config.log_level());
    info!("Starting hookwork runtime (data dir {})", data_dir.display());

    let store = Store::open(data_dir).await?;
    let vault = Arc::new(
        CredentialVault::from_env(store.clone())?.with_prefix_rules(&config.vault.provider_prefixes),
    );
    let invoker: Arc<dyn Invoker> = Arc::new(
        WebhookDispatcher::new(
            config.default_dispatch_timeout(),
            config.dispatch.max_response_bytes,
        )
        .context("failed to build webhook client")?,
    );
    let retry = RetryPolicy::new(
        std::time::Duration::from_secs(config.retry.base_delay_secs),
        std::time::Duration::from_secs(config.retry.max_delay_secs),
    );

    let shutdown = CancellationToken::new();
    let wake = Arc::new(Notify::new());

    let pool = WorkerPool::new(
        WorkerContext {
            store: store.clone(),
            vault: vault.clone(),
            invoker,
            retry,
            feedback: FeedbackPolicy::from_config(&config),
        },
        WorkerSettings::from_config(&config),
        config.worker.count,
        wake.clone(),
        shutdown.child_token(),
    );
    let poller = Poller::new(
        store.clone(),
        wake,
        config.poll_interval(),
        shutdown.child_token(),
    );
    let runtime = Arc::new(Runtime::new(store.clone(), vault, &config));
    let api = ApiServer::new(ApiServerConfig {
        runtime,
        log_tx,
        api_host: config.api.host.clone(),
        api_port: config.api.port,
        cancel: shutdown.child_token(),
    });

    let mut lifecycle = LifecycleManager::new();
    lifecycle.attach(Arc::new(Mutex::new(store)));
    lifecycle.attach(Arc::new(Mutex::new(pool)));
    lifecycle.attach(Arc::new(Mutex::new(poller)));
    lifecycle.attach(Arc::new(Mutex::new(api)));

    if let Err(e) = lifecycle.start().await {
        shutdown.cancel();
        lifecycle.shutdown().await?;
        return Err(e);
    }
    info!(
        "hookwork is ready on http://{}:{}. Press Ctrl+C to stop.",
        config.api.host, config.api.port
    );

    wait_for_signal().await?;
    info!("Shutting down hookwork runtime...");
    shutdown.cancel();
    lifecycle.shutdown().await
}

#[cfg(unix)]
async fn wait_for_signal() -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};
    let mut term = signal(SignalKind::terminate())?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res?,
        _ = term.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_signal() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}
