//! Daemon wiring: membership, control API and the reconciliation loop.

use std::sync::Arc;

use log::{error, info};
use tokio::net::TcpListener;
use tokio::signal;

use crate::api::{self, AppState};
use crate::client::PeerClient;
use crate::config::Config;
use crate::gossip::{GossipMembership, Member, Membership, Propagator};
use crate::loader::DefinitionDir;
use crate::pull::Puller;
use crate::reconciler::{Reconciler, ReconcilerSettings};
use crate::runtime::{ContainerRuntime, DockerRuntime};
use crate::store::{DefinitionWriter, Store};

pub async fn run(cfg: Config) -> anyhow::Result<()> {
    let node_name = cfg.resolve_node_name()?;
    info!(
        "Starting convoy daemon {} (definitions in {}, control API on {}, gossip on {})",
        node_name,
        cfg.dir.display(),
        cfg.http_bind(),
        cfg.gossip_bind()
    );

    // Shared state
    let definitions = DefinitionDir::new(&cfg.dir);
    let writer: Arc<dyn DefinitionWriter> = Arc::new(definitions.clone());
    let store = Arc::new(Store::new(Some(writer)));

    // Container Runtime (Docker)
    let runtime: Arc<dyn ContainerRuntime> = Arc::new(DockerRuntime::new());
    let puller = Arc::new(Puller::new(
        runtime.clone(),
        cfg.private_registry()?,
        cfg.private_pull_command.clone(),
    ));

    // Membership
    let local = Member {
        id: node_name.clone(),
        address: cfg.advertise_addr.clone(),
        port: cfg.http_port,
    };
    let gossip = GossipMembership::bind(local, cfg.gossip_bind(), cfg.failure_timeout()).await?;
    let gossip_handle = tokio::spawn(gossip.clone().run(cfg.gossip_interval()));
    if let Some(seed) = &cfg.join {
        gossip.join(seed).await?;
    }
    let membership: Arc<dyn Membership> = gossip;

    // Control API
    let client = PeerClient::new(cfg.peer_timeout(), cfg.api_key.clone())?;
    let state = AppState {
        store: store.clone(),
        puller: puller.clone(),
        membership: membership.clone(),
        client: client.clone(),
        api_key: cfg.api_key.as_deref().map(Arc::from),
    };
    let listener = TcpListener::bind(cfg.http_bind()).await?;
    let api_handle = tokio::spawn(async move {
        if let Err(e) = api::serve(listener, state).await {
            error!("Control API failed: {}", e);
        }
    });

    // Reconciliation loop
    let propagator = Arc::new(Propagator::new(node_name.clone(), membership, client));
    let reconciler = Reconciler::new(
        store,
        definitions,
        runtime,
        puller,
        propagator,
        ReconcilerSettings {
            node_name,
            interval: cfg.interval(),
            pull_every: cfg.pull_every,
        },
    );
    let reconcile_handle = tokio::spawn(reconciler.run());

    match signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C, exiting"),
        Err(err) => error!("Unable to listen for shutdown signal: {}", err),
    }

    reconcile_handle.abort();
    api_handle.abort();
    gossip_handle.abort();
    Ok(())
}
