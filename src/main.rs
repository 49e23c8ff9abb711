//! ShardSync node runner
//!
//! Starts a small in-process cluster over the memory transport, seeds a few
//! shards and keeps it syncing until Ctrl-C.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use libp2p::PeerId;
use shardsync::crypto::generate_identity;
use shardsync::{
    ConfigHandle, MemoryNetwork, RedundancyGroup, SessionKey, ShardStore, ShardSyncNode, SyncConfig,
};

const CLUSTER_SIZE: usize = 3;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    tracing::info!("Starting ShardSync");

    let config = match std::env::var("SHARDSYNC_CONFIG") {
        Ok(path) => SyncConfig::load(&path)?,
        Err(_) => SyncConfig {
            sync_interval_ms: 5_000,
            ..Default::default()
        },
    };
    let secret = std::env::var("SHARDSYNC_CLUSTER_SECRET").unwrap_or_else(|_| "shardsync".to_string());
    let session_key = SessionKey::derive(secret.as_bytes());

    let data_dir = dirs::data_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join("shardsync");
    std::fs::create_dir_all(&data_dir)?;
    tracing::info!("Shard stores under {:?}", data_dir);

    let network = MemoryNetwork::new();
    let mut nodes = Vec::with_capacity(CLUSTER_SIZE);
    for n in 0..CLUSTER_SIZE {
        let keypair = generate_identity();
        let peer_id = PeerId::from(keypair.public());
        let store = ShardStore::open(data_dir.join(format!("node-{}", n)), config.shard_size_bytes)?;

        let node = Arc::new(
            ShardSyncNode::new(
                keypair,
                format!("/memory/{}", n).parse()?,
                session_key.clone(),
                ConfigHandle::new(config.clone())?,
                store,
                Arc::new(network.transport_for(peer_id)),
            )
            .await,
        );
        network.register(peer_id, node.service()).await;
        nodes.push(node);
    }

    // Ring bootstrap; gossip fills in the rest
    for i in 0..nodes.len() {
        let next = &nodes[(i + 1) % nodes.len()];
        nodes[i].add_peer(next.as_peer()).await?;
        next.add_peer(nodes[i].as_peer()).await?;
    }

    seed(&nodes)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handles = Vec::new();
    for node in &nodes {
        handles.push(tokio::spawn(node.clone().run(shutdown_rx.clone())));
        node.trigger();
    }

    let observer = nodes[0].clone();
    let report_every = Duration::from_millis(config.sync_interval_ms);
    loop {
        tokio::select! {
            _ = tokio::time::sleep(report_every) => {
                let metrics = observer.get_metrics().await;
                tracing::info!(
                    "Metrics: {} sessions, success rate {:.2}, {} bytes, mean {:.1}ms",
                    metrics.sessions,
                    metrics.success_rate,
                    metrics.bytes_transferred,
                    metrics.mean_duration_ms
                );
                match observer.check_data_availability().await {
                    Ok(report) => tracing::info!(
                        "Availability: {}/{} shards at redundancy ({:.2})",
                        report.available,
                        report.tracked,
                        report.fraction
                    ),
                    Err(e) => tracing::warn!("Availability check failed: {}", e),
                }
                match observer.store().total_size() {
                    Ok(bytes) => tracing::info!(
                        "Store: {} shards, {} bytes; mean peer reliability {:.2}",
                        observer.store().shard_count(),
                        bytes,
                        observer.registry().average_reliability().await
                    ),
                    Err(e) => tracing::warn!("Store size check failed: {}", e),
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    tracing::info!("Shutting down");
    shutdown_tx.send(true)?;
    for handle in handles {
        handle.await?;
    }
    Ok(())
}

fn seed(nodes: &[Arc<ShardSyncNode>]) -> Result<(), Box<dyn std::error::Error>> {
    let profile = RedundancyGroup::overwrite("profiles");
    nodes[0].create_shard(profile, br#"{"name":"node-0"}"#.to_vec())?;

    let tally = RedundancyGroup::additive("tallies");
    let empty = serde_json::to_vec(&serde_json::json!({ "records": [], "totals": {} }))?;
    let id = nodes[1].create_shard(tally, empty)?;
    let vote = serde_json::json!({ "records": [{ "voter": "node-1" }], "totals": { "yes": 1 } });
    nodes[1].update_shard(&id, serde_json::to_vec(&vote)?)?;
    Ok(())
}
