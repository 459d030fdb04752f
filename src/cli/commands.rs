//! CLI commands for the overlay
//!
//! Implements all command handlers for the CLI interface.

use crate::broker::LocalBroker;
use crate::directory::{
    BackoffUpdate, JsonPeerStore, PeerDirectory, PeerType, RandomPeerSampler, StoreConfig,
    TypeUpdate, REALLY_DEAD_NUM_FAILURES_CUTOFF,
};
use crate::identity::{FullIdentity, PeerIdentity, RandomnessSource};
use crate::overlay::{OverlayConfig, OverlayManager};
use chrono::Utc;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Result type for CLI operations
pub type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

/// Open the peer table under `data_dir`
pub fn open_directory(data_dir: &Path) -> CliResult<PeerDirectory> {
    let config = StoreConfig {
        data_dir: data_dir.to_path_buf(),
        ..Default::default()
    };
    let store = JsonPeerStore::open(config)?;
    Ok(PeerDirectory::new(
        Arc::new(store),
        RandomnessSource::from_entropy(),
    ))
}

/// Print random identities
pub fn cmd_identity(count: usize, full: bool) -> CliResult<()> {
    let rng = RandomnessSource::from_entropy();
    for _ in 0..count {
        if full {
            println!("{}", FullIdentity::generate(&rng));
        } else {
            println!("{}", PeerIdentity::generate(&rng));
        }
    }
    Ok(())
}

fn type_label(peer_type: PeerType) -> &'static str {
    match peer_type {
        PeerType::Inbound => "inbound",
        PeerType::Outbound => "outbound",
        PeerType::Preferred => "preferred",
    }
}

/// List every known peer
pub fn cmd_peers_list(directory: &PeerDirectory) -> CliResult<()> {
    let peers = directory.all_peers();
    if peers.is_empty() {
        println!("📭 No peers known. Add one with: overlay peers add <PEER>");
        return Ok(());
    }

    let now = Utc::now();
    println!("📋 Peers ({}):", peers.len());
    for (peer, record) in &peers {
        let wait = (record.next_attempt - now).num_seconds().max(0);
        println!(
            "   {} {:<9} failures: {:<4} next attempt in {}s",
            peer,
            type_label(record.peer_type),
            record.num_failures,
            wait
        );
    }
    Ok(())
}

/// Add or promote a peer
pub fn cmd_peers_add(
    directory: &PeerDirectory,
    peer: &str,
    preferred: bool,
    outbound: bool,
) -> CliResult<()> {
    let peer = PeerIdentity::parse(peer)?;
    if preferred {
        directory.update(&peer, TypeUpdate::SetPreferred, BackoffUpdate::HardReset);
    } else if outbound {
        directory.update(&peer, TypeUpdate::UpdateToOutbound, BackoffUpdate::HardReset);
    } else {
        directory.ensure_exists(&peer);
    }

    let (record, _) = directory.load(&peer);
    println!("✅ {} stored as {}", peer, type_label(record.peer_type));
    Ok(())
}

/// Delete peers that failed too often
pub fn cmd_peers_prune(
    directory: &PeerDirectory,
    min_failures: u32,
    peer: Option<&str>,
) -> CliResult<()> {
    let peer = peer.map(PeerIdentity::parse).transpose()?;
    let before = directory.all_peers().len();
    directory.remove_peers_with_many_failures(min_failures, peer.as_ref());
    let after = directory.all_peers().len();

    println!(
        "🧹 Removed {} peer(s) with {}+ failures",
        before - after,
        min_failures
    );
    Ok(())
}

/// Show what gossip fanout and outbound dialing would pick right now
pub fn cmd_peers_sample(directory: &PeerDirectory, size: usize, exclude: &str) -> CliResult<()> {
    let exclude = PeerIdentity::parse(exclude)?;

    let fanout = directory.get_peers_to_send(size, &exclude);
    println!("📣 Fanout ({}):", fanout.len());
    for peer in &fanout {
        println!("   {}", peer);
    }

    let mut dialable =
        RandomPeerSampler::new(RandomPeerSampler::next_attempt_cutoff(PeerType::Outbound));
    let dial = dialable.get_random_peers(directory, size, |p| *p != exclude);
    println!("📞 Dialable now ({}):", dial.len());
    for peer in &dial {
        println!("   {}", peer);
    }

    println!(
        "   (peers with more than {} failures are never dialed)",
        REALLY_DEAD_NUM_FAILURES_CUTOFF
    );
    Ok(())
}

/// Outcome of a simulation run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulationReport {
    pub identities: Vec<PeerIdentity>,
    /// Messages received per node, indexed like `identities`
    pub received: Vec<usize>,
    /// Directory entries summed over all nodes
    pub entries: usize,
}

/// Run `nodes` overlays on one in-process broker; node 0 dials everyone and
/// broadcasts `messages` payloads
pub async fn simulate(nodes: usize, messages: usize) -> CliResult<SimulationReport> {
    if nodes < 2 {
        return Err("simulation needs at least 2 nodes".into());
    }

    let rng = RandomnessSource::from_entropy();
    let broker = Arc::new(LocalBroker::new());
    let identities: Vec<PeerIdentity> = (0..nodes).map(|_| PeerIdentity::generate(&rng)).collect();

    let mut handles = Vec::with_capacity(nodes);
    let mut inboxes = Vec::with_capacity(nodes);
    let mut stops = Vec::with_capacity(nodes);
    let mut tasks = Vec::with_capacity(nodes);
    for (index, identity) in identities.iter().enumerate() {
        let known_peers = if index == 0 {
            identities[1..].to_vec()
        } else {
            Vec::new()
        };
        let config = OverlayConfig {
            peer_identity: *identity,
            known_peers,
            target_outbound: nodes,
            ..Default::default()
        };

        let directory = PeerDirectory::in_memory(rng.clone());
        let (mut overlay, inbox) = OverlayManager::new(config, broker.clone(), directory);
        overlay.start();

        let (stop_tx, stop_rx) = mpsc::channel(1);
        handles.push(overlay.handle());
        inboxes.push(inbox);
        stops.push(stop_tx);
        tasks.push(tokio::spawn(async move {
            overlay.run(stop_rx).await;
            overlay
        }));
    }

    // the first tick dials the known peers
    tokio::time::sleep(Duration::from_millis(200)).await;

    for i in 0..messages {
        handles[0].broadcast(format!("message {}", i).into_bytes())?;
    }

    let mut received = vec![0usize; nodes];
    for (index, inbox) in inboxes.iter_mut().enumerate() {
        while let Ok(Some(message)) =
            tokio::time::timeout(Duration::from_millis(200), inbox.recv()).await
        {
            log::debug!("node {} got {} bytes from {}", index, message.data.len(), message.from);
            received[index] += 1;
        }
    }

    for stop in &stops {
        let _ = stop.send(()).await;
    }
    let mut entries = 0;
    for joined in futures::future::join_all(tasks).await {
        entries += joined?.directory().all_peers().len();
    }

    Ok(SimulationReport {
        identities,
        received,
        entries,
    })
}

/// Run a simulation and print per-node receive counts
pub async fn cmd_simulate(nodes: usize, messages: usize) -> CliResult<()> {
    println!("🌐 Simulating {} nodes", nodes);
    let report = simulate(nodes, messages).await?;

    println!("📊 Results:");
    for (index, count) in report.received.iter().enumerate() {
        println!(
            "   ├─ node {} ({}) received {}/{}",
            index, report.identities[index], count, messages
        );
    }
    println!("   └─ {} directory entries across all nodes", report.entries);
    Ok(())
}
