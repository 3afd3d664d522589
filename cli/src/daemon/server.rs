// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Node composition root

use anyhow::{Context, Result};
use chrono::Utc;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use renderfarm_core::{
    application::{
        agent_pool::{AgentPool, LocalPool},
        agent_supervisor::SupervisorSettings,
        agent_task::AgentTaskStrategy,
        executor::{TaskExecutor, TaskStrategy},
        manager_task::{ManagerSettings, ManagerTaskStrategy},
        splitter::WorkloadBroker,
    },
    domain::{
        node_config::{NodeConfigManifest, NodeRole},
        provider::BootstrapFile,
    },
    infrastructure::{
        agent_client::HttpAgentClient,
        blob_cache::BlobCache,
        blob_reaper::BlobReaper,
        command_merger::CommandMerger,
        log_buffer::LogBuffer,
        renderer::ProcessRenderer,
        repositories::file::{FileAgentRegistry, FileTaskRepository},
        static_provider::StaticResourceProvider,
        system_probe::SystemProbe,
        tls::{self, CertificateAuthority, LeafPaths},
    },
    presentation::{
        api::{app, AppState},
        auth::BasicAuth,
        server::serve_tls,
    },
};

use super::shutdown_signal;

/// Common name stem of the farm CA
const FARM: &str = "renderfarm";
/// TLS identity of the manager
const MANAGER_IDENTITY: &str = "manager";
/// TLS identity shared by agents; provisioned agents receive it as bootstrap files
const AGENT_IDENTITY: &str = "agent";
/// Result downloads stream whole renders through one request
const AGENT_REQUEST_TIMEOUT: Duration = Duration::from_secs(600);

/// Run a node until Ctrl+C / SIGTERM
pub async fn start_node(config: NodeConfigManifest, role: NodeRole, logs: LogBuffer) -> Result<()> {
    config.validate().context("Configuration validation failed")?;
    if role != config.spec.node.role {
        warn!(
            configured = ?config.spec.node.role,
            running = ?role,
            "Command line role differs from the configured role"
        );
    }
    let (user, password) = config.credentials()?;
    let name = config.metadata.name.clone();
    let started_at = Utc::now();
    let shutdown = CancellationToken::new();

    let session = config.session_dir().to_path_buf();
    std::fs::create_dir_all(&session)
        .with_context(|| format!("Failed to create session directory {}", session.display()))?;

    let blobs = Arc::new(
        BlobCache::open(config.cache_dir(), config.cache_limit_bytes())
            .context("Failed to open blob cache")?,
    );
    let flusher = blobs.spawn_flusher(
        Duration::from_secs(config.spec.storage.metadata_flush_seconds),
        shutdown.clone(),
    );
    let (reaper, _reaper_task) = BlobReaper::spawn(blobs.clone());

    let tls_dir = session.join("tls");
    let alt_names = &config.spec.network.subject_alt_names;

    let (strategy, leaf, pool): (Arc<dyn TaskStrategy>, LeafPaths, Option<Arc<AgentPool>>) =
        match role {
            NodeRole::Agent => {
                let leaf = tls::prepare_listener(&tls_dir, FARM, AGENT_IDENTITY, alt_names)
                    .context("Failed to prepare TLS certificate")?;
                let renderer = Arc::new(ProcessRenderer::new(
                    &config.spec.agent.renderer,
                    config.spec.agent.renderer_args.clone(),
                ));
                let strategy: Arc<dyn TaskStrategy> = Arc::new(AgentTaskStrategy::new(
                    renderer,
                    blobs.clone(),
                    reaper,
                    config.stop_grace(),
                ));
                (strategy, leaf, None)
            }
            NodeRole::Manager => {
                let ca = CertificateAuthority::load_or_create(&tls_dir, FARM)
                    .context("Failed to load the farm CA")?;
                let leaf = ca
                    .ensure_leaf(&tls_dir, MANAGER_IDENTITY, alt_names)
                    .context("Failed to prepare TLS certificate")?;
                let bootstrap = agent_bootstrap(&ca).context("Failed to issue agent certificate")?;
                let pool = build_pool(
                    &config,
                    &session,
                    &ca,
                    (user.clone(), password.clone()),
                    bootstrap,
                    &blobs,
                    shutdown.clone(),
                )
                .await?;

                let settings = ManagerSettings {
                    stop_grace: config.stop_grace(),
                    ..ManagerSettings::default()
                };
                let merger = Arc::new(CommandMerger::new(&config.spec.pool.merger));
                let strategy: Arc<dyn TaskStrategy> = Arc::new(ManagerTaskStrategy::new(
                    pool.clone(),
                    blobs.clone(),
                    reaper,
                    merger,
                    settings,
                ));
                (strategy, leaf, Some(pool))
            }
        };

    let repo = Arc::new(FileTaskRepository::new(&session).context("Failed to open task store")?);
    let executor = Arc::new(TaskExecutor::new(strategy, repo, blobs.clone()));
    executor.load().await.context("Failed to restore tasks")?;
    let executor_loop = executor.spawn(shutdown.clone());

    let role_name = match role {
        NodeRole::Manager => "manager",
        NodeRole::Agent => "agent",
    };
    let info = SystemProbe::info(&name, role_name, started_at);
    let mut state = AppState::new(executor.clone(), BasicAuth::new(user, password), info)
        .context("Failed to build route table")?
        .with_logs(logs);
    if let Some(pool) = pool {
        state = state.with_pool(pool);
    }

    let bind: SocketAddr = format!("{}:{}", config.spec.network.bind_address, config.spec.network.port)
        .parse()
        .context("Invalid bind address")?;
    let listener_shutdown = CancellationToken::new();
    let mut server = tokio::spawn({
        let router = app(Arc::new(state));
        let token = listener_shutdown.clone();
        async move { serve_tls(router, bind, &leaf, token).await }
    });

    let mut server_result = None;
    tokio::select! {
        _ = shutdown_signal() => {}
        result = &mut server => {
            server_result = Some(result);
        }
    }

    info!("Node shutting down");
    executor.shutdown(config.stop_grace()).await;
    shutdown.cancel();
    listener_shutdown.cancel();

    let server_result = match server_result {
        Some(result) => result,
        None => server.await,
    };
    if let Err(e) = executor_loop.await {
        warn!(error = %e, "Executor loop panicked");
    }
    if let Err(e) = flusher.await {
        warn!(error = %e, "Blob metadata flusher panicked");
    }

    match server_result {
        Ok(Ok(())) => {
            info!("Node stopped");
            Ok(())
        }
        Ok(Err(e)) => {
            error!(error = %e, "HTTPS listener failed");
            Err(e)
        }
        Err(e) => Err(e).context("HTTPS listener task panicked"),
    }
}

/// Files every provisioned agent receives: the farm CA and the shared agent leaf
fn agent_bootstrap(ca: &CertificateAuthority) -> Result<Vec<BootstrapFile>> {
    let leaf = ca.issue(AGENT_IDENTITY, &[])?;
    Ok(vec![
        BootstrapFile {
            name: "tls/ca.pem".to_string(),
            content: ca.cert_pem().as_bytes().to_vec(),
        },
        BootstrapFile {
            name: format!("tls/{}.pem", AGENT_IDENTITY),
            content: leaf.cert_pem.into_bytes(),
        },
        BootstrapFile {
            name: format!("tls/{}.key", AGENT_IDENTITY),
            content: leaf.key_pem.into_bytes(),
        },
    ])
}

async fn build_pool(
    config: &NodeConfigManifest,
    session: &Path,
    ca: &CertificateAuthority,
    (user, password): (String, String),
    bootstrap: Vec<BootstrapFile>,
    blobs: &Arc<BlobCache>,
    shutdown: CancellationToken,
) -> Result<Arc<AgentPool>> {
    let api = HttpAgentClient::new(user, password, ca.cert_pem().as_bytes(), AGENT_REQUEST_TIMEOUT)
        .context("Failed to build agent client")?;
    let provider = Arc::new(StaticResourceProvider::new(config.spec.pool.agent_port));
    let registry = Arc::new(FileAgentRegistry::new(session).context("Failed to open agent registry")?);

    let pool = Arc::new(AgentPool::new(
        provider.clone(),
        Arc::new(api),
        Arc::new(WorkloadBroker::new()),
        blobs.clone(),
        SupervisorSettings::from(&config.spec.pool),
        bootstrap,
        Some(LocalPool { provider, registry }),
        shutdown,
    ));
    pool.load().await.context("Failed to restore registered agents")?;
    pool.add_configured(&config.spec.pool.agents);
    info!(agents = pool.workers().len(), "Agent pool ready");
    Ok(pool)
}
