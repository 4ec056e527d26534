#![doc = include_str!("../README.md")]

mod agent;

use agent::config::{AgentConfig, CliArgs};
use agent::owner::AgentOwner;
use agent::telemetry::init_telemetry;
use clap::Parser;
use secid::{Identity, IdentityAllocator, MemoryStore, TaskManager, TaskParams};
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;

// Using mimalloc for better performance under contention, especially in musl
// environments.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

const GC_TASK: &str = "identity-gc";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = AgentConfig::try_from(args)?;

    init_telemetry()?;
    log_startup_info(&config);

    let store = MemoryStore::new();
    let allocator = IdentityAllocator::new(store.clone(), config.allocator.clone())?;
    let owner = Arc::new(AgentOwner::new(config.node_name.clone()));
    allocator.init(owner.clone()).await?;

    let background = TaskManager::new();
    if let Some(interval) = config.gc_interval {
        let base_path = config.allocator.base_path.clone();
        background.update_or_create(
            GC_TASK,
            TaskParams::new(interval, move |_cancel| {
                let store = store.clone();
                let base_path = base_path.clone();
                async move {
                    let removed = store.collect_garbage(&base_path);
                    if removed > 0 {
                        tracing::info!(removed, "Collected unused identities");
                    }
                    Ok(())
                }
            }),
        );
    }

    let cancel = CancellationToken::new();
    let held = allocate_configured(&allocator, &cancel, &config).await;

    let shutdown = shutdown_signal().await;
    tracing::info!("Shutdown signal received, terminating gracefully...");

    // 1. Stop background work
    background.remove_all_and_wait().await;

    // 2. Give back everything this node holds
    if let Err(err) = allocator.release_slice(&cancel, &held).await {
        tracing::error!(%err, "Error releasing identities");
    }

    // 3. Tear down the allocator
    allocator.close().await?;
    tracing::info!(
        policy_updates = owner.policy_updates(),
        "Agent shut down successfully"
    );
    shutdown
}

async fn allocate_configured(
    allocator: &IdentityAllocator<MemoryStore>,
    cancel: &CancellationToken,
    config: &AgentConfig,
) -> Vec<Identity> {
    let mut held = Vec::with_capacity(config.label_sets.len());
    for labels in &config.label_sets {
        match allocator.allocate(cancel, labels).await {
            Ok((identity, is_new)) => {
                tracing::info!(
                    id = %identity.id(),
                    %labels,
                    is_new,
                    local = allocator.allocation_is_local(labels),
                    "Allocated identity"
                );
                held.push(identity);
            }
            Err(err) => tracing::error!(%labels, %err, "Failed to allocate identity"),
        }
    }
    held
}

fn log_startup_info(config: &AgentConfig) {
    if cfg!(debug_assertions) {
        tracing::info!("Starting identity agent with full config: {:#?}", config);
    } else {
        tracing::info!(
            node = %config.node_name,
            cluster = %config.allocator.cluster_name,
            label_sets = config.label_sets.len(),
            "Starting identity agent"
        );
    }
}

async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    let terminate = {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
        async move {
            sigterm.recv().await;
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        res = signal::ctrl_c() => {
            res?;
            tracing::info!("Received Ctrl+C signal");
        },
        () = terminate => {
            tracing::info!("Received SIGTERM signal");
        },
    }
    Ok(())
}
