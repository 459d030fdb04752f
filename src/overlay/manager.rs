//! Overlay manager
//!
//! Owns every piece of overlay state (connections, listener, directory,
//! samplers) and mutates it only from the task loop. Broker callbacks and
//! external callers reach it exclusively through [`Task`]s.

use crate::broker::MessageBroker;
use crate::directory::{
    BackoffUpdate, PeerDirectory, PeerType, RandomPeerSampler, TypeUpdate,
    REALLY_DEAD_NUM_FAILURES_CUTOFF,
};
use crate::identity::{AppIdentity, PeerIdentity, RandomnessSource};
use crate::overlay::connection::{
    Connection, ConnectionContext, ConnectionId, ConnectionState, DropDirection, DropMode,
    PeerRole, Received,
};
use crate::overlay::listener::Listener;
use crate::overlay::main_thread::{MainThread, Task};
use crate::overlay::message::{ErrorCode, MessageBody};
use crate::overlay::registry::ConnectionRegistry;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

/// Overlay errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OverlayError {
    #[error("Refusing to connect to ourselves")]
    SelfConnection,
    #[error("Already connected to {0}")]
    AlreadyConnected(PeerIdentity),
    #[error("Not connected to {0}")]
    NotConnected(PeerIdentity),
    #[error("Connection to {0} is not authenticated")]
    NotAuthenticated(PeerIdentity),
    #[error("Overlay is shutting down")]
    ShuttingDown,
    #[error("Overlay processing loop is gone")]
    LoopClosed,
}

/// Overlay configuration
#[derive(Debug, Clone)]
pub struct OverlayConfig {
    pub app_identity: AppIdentity,
    pub peer_identity: PeerIdentity,
    /// Broker channel shared by all peers
    pub channel: String,
    /// Peers stored as outbound candidates on start
    pub known_peers: Vec<PeerIdentity>,
    /// Peers stored as preferred on start
    pub preferred_peers: Vec<PeerIdentity>,
    pub target_outbound: usize,
    pub max_inbound: usize,
    /// Drop connections that receive nothing for this long
    pub idle_timeout: Option<Duration>,
    pub tick_interval: Duration,
    /// Peers gossiped to a newly authenticated connection
    pub fanout: usize,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        let rng = RandomnessSource::from_entropy();
        Self {
            app_identity: AppIdentity::generate(&rng),
            peer_identity: PeerIdentity::generate(&rng),
            channel: "overlay".to_string(),
            known_peers: Vec::new(),
            preferred_peers: Vec::new(),
            target_outbound: 8,
            max_inbound: 64,
            idle_timeout: Some(Duration::from_secs(30)),
            tick_interval: Duration::from_secs(3),
            fanout: 50,
        }
    }
}

/// Application payload received from a peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub from: PeerIdentity,
    pub data: Vec<u8>,
}

/// Cloneable command handle; commands run on the processing loop
#[derive(Debug, Clone)]
pub struct OverlayHandle {
    main: MainThread,
}

impl OverlayHandle {
    fn post(&self, task: Task) -> Result<(), OverlayError> {
        if self.main.post(task) {
            Ok(())
        } else {
            Err(OverlayError::LoopClosed)
        }
    }

    pub fn connect(&self, remote: PeerIdentity) -> Result<(), OverlayError> {
        self.post(Task::Connect(remote))
    }

    pub fn send(&self, to: PeerIdentity, data: Vec<u8>) -> Result<(), OverlayError> {
        self.post(Task::Send { to, data })
    }

    pub fn broadcast(&self, data: Vec<u8>) -> Result<(), OverlayError> {
        self.post(Task::Broadcast(data))
    }

    pub fn tick(&self) -> Result<(), OverlayError> {
        self.post(Task::Tick)
    }

    pub fn stop(&self) -> Result<(), OverlayError> {
        self.post(Task::Stop)
    }
}

pub struct OverlayManager {
    config: OverlayConfig,
    ctx: ConnectionContext,
    directory: PeerDirectory,
    registry: ConnectionRegistry,
    listener: Listener,
    preferred_sampler: RandomPeerSampler,
    outbound_sampler: RandomPeerSampler,
    tasks: mpsc::UnboundedReceiver<Task>,
    inbox: mpsc::UnboundedSender<InboundMessage>,
    next_connection: u64,
    stopping: bool,
}

impl OverlayManager {
    /// Create a manager and the receiver of its application inbox
    pub fn new(
        config: OverlayConfig,
        broker: Arc<dyn MessageBroker>,
        directory: PeerDirectory,
    ) -> (Self, mpsc::UnboundedReceiver<InboundMessage>) {
        let (main, tasks) = MainThread::channel();
        let (inbox, inbox_rx) = mpsc::unbounded_channel();

        let ctx = ConnectionContext {
            broker,
            channel: config.channel.clone(),
            main,
            idle_timeout: config.idle_timeout,
        };

        let manager = Self {
            listener: Listener::new(config.peer_identity),
            preferred_sampler: RandomPeerSampler::new(RandomPeerSampler::next_attempt_cutoff(
                PeerType::Preferred,
            )),
            outbound_sampler: RandomPeerSampler::new(RandomPeerSampler::next_attempt_cutoff(
                PeerType::Outbound,
            )),
            config,
            ctx,
            directory,
            registry: ConnectionRegistry::new(),
            tasks,
            inbox,
            next_connection: 0,
            stopping: false,
        };
        (manager, inbox_rx)
    }

    pub fn handle(&self) -> OverlayHandle {
        OverlayHandle {
            main: self.ctx.main.clone(),
        }
    }

    pub fn local_peer(&self) -> PeerIdentity {
        self.config.peer_identity
    }

    pub fn config(&self) -> &OverlayConfig {
        &self.config
    }

    pub fn directory(&self) -> &PeerDirectory {
        &self.directory
    }

    pub fn is_listening(&self) -> bool {
        self.listener.is_listening()
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping
    }

    pub fn is_connected(&self, remote: &PeerIdentity) -> bool {
        self.registry.is_connected(remote)
    }

    pub fn connection_state(&self, remote: &PeerIdentity) -> Option<ConnectionState> {
        self.registry.by_remote(remote).map(Connection::state)
    }

    pub fn connection_count(&self) -> usize {
        self.registry.live_count()
    }

    /// Dropped connections whose shutdown has not completed yet
    pub fn closing_count(&self) -> usize {
        self.registry.closing_count()
    }

    pub fn authenticated_peers(&self) -> Vec<PeerIdentity> {
        self.registry.authenticated_peers()
    }

    /// Prune dead peers, store configured peers and start listening
    pub fn start(&mut self) {
        self.directory
            .remove_peers_with_many_failures(REALLY_DEAD_NUM_FAILURES_CUTOFF, None);

        let local = self.local_peer();
        for peer in self.config.preferred_peers.iter().filter(|p| **p != local) {
            self.directory
                .update(peer, TypeUpdate::SetPreferred, BackoffUpdate::HardReset);
        }
        for peer in self.config.known_peers.iter().filter(|p| **p != local) {
            self.directory
                .update(peer, TypeUpdate::UpdateToOutbound, BackoffUpdate::HardReset);
        }

        self.listener.start(&self.ctx);
        log::info!(
            "Overlay {}{} started with {} known peers",
            self.config.app_identity,
            local,
            self.directory.all_peers().len()
        );
    }

    fn next_id(&mut self) -> ConnectionId {
        self.next_connection += 1;
        ConnectionId(self.next_connection)
    }

    // =========================================================================
    // Commands
    // =========================================================================

    /// Dial `remote`, counting the attempt as a failure until it authenticates
    pub fn connect_to(&mut self, remote: PeerIdentity) -> Result<ConnectionId, OverlayError> {
        if self.stopping {
            return Err(OverlayError::ShuttingDown);
        }
        if remote == self.local_peer() {
            return Err(OverlayError::SelfConnection);
        }
        if self.registry.is_connected(&remote) {
            return Err(OverlayError::AlreadyConnected(remote));
        }

        self.directory.update_backoff(&remote, BackoffUpdate::Increase);

        let id = self.next_id();
        let connection = Connection::initiate(&self.ctx, id, self.local_peer(), remote);
        if self.registry.add(connection).is_err() {
            return Err(OverlayError::AlreadyConnected(remote));
        }
        Ok(id)
    }

    pub fn send_to(&mut self, remote: &PeerIdentity, data: Vec<u8>) -> Result<(), OverlayError> {
        let connection = self
            .registry
            .by_remote_mut(remote)
            .ok_or(OverlayError::NotConnected(*remote))?;
        if !connection.is_authenticated() {
            return Err(OverlayError::NotAuthenticated(*remote));
        }
        connection.send_message(MessageBody::Data(data));
        Ok(())
    }

    /// Send to every authenticated connection; returns how many were sent
    pub fn broadcast(&mut self, data: &[u8]) -> usize {
        let mut sent = 0;
        for id in self.registry.live_ids() {
            if let Some(connection) = self.registry.get_mut(id) {
                if connection.is_authenticated() {
                    connection.send_message(MessageBody::Data(data.to_vec()));
                    sent += 1;
                }
            }
        }
        sent
    }

    /// Top outbound connections up to the target, preferred peers first
    pub fn tick(&mut self) {
        if self.stopping {
            return;
        }

        let outbound = self.registry.count_role(PeerRole::WeInitiated);
        if outbound >= self.config.target_outbound {
            return;
        }
        let mut needed = self.config.target_outbound - outbound;

        let local = self.local_peer();
        let registry = &self.registry;
        let preferred = self.preferred_sampler.get_random_peers(&self.directory, needed, |p| {
            *p != local && !registry.is_connected(p)
        });
        needed -= self.connect_all(preferred);
        if needed == 0 {
            return;
        }

        let registry = &self.registry;
        let outbound = self.outbound_sampler.get_random_peers(&self.directory, needed, |p| {
            *p != local && !registry.is_connected(p)
        });
        self.connect_all(outbound);
    }

    fn connect_all(&mut self, peers: Vec<PeerIdentity>) -> usize {
        let mut connected = 0;
        for peer in peers {
            match self.connect_to(peer) {
                Ok(_) => connected += 1,
                Err(e) => log::debug!("Not connecting to {}: {}", peer, e),
            }
        }
        connected
    }

    /// Drop every connection after its write queue drains and stop listening
    pub fn shutdown(&mut self) {
        if self.stopping {
            return;
        }
        log::info!("Overlay {} shutting down", self.local_peer());
        self.stopping = true;
        self.listener.close();

        for id in self.registry.live_ids() {
            self.drop_connection(
                id,
                "overlay shutting down",
                DropDirection::WeDroppedRemote,
                DropMode::FlushWriteQueue,
            );
        }
    }

    // =========================================================================
    // Task loop
    // =========================================================================

    /// Process queued tasks until the queue is empty; returns how many ran
    pub fn run_until_idle(&mut self) -> usize {
        let mut processed = 0;
        while let Ok(task) = self.tasks.try_recv() {
            self.handle_task(task);
            processed += 1;
        }
        processed
    }

    /// Process tasks and ticks until stopped by a `Stop` task or `shutdown_rx`
    pub async fn run(&mut self, mut shutdown_rx: mpsc::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.config.tick_interval);

        loop {
            tokio::select! {
                task = self.tasks.recv() => match task {
                    Some(task) => self.handle_task(task),
                    None => break,
                },
                _ = ticker.tick() => self.tick(),
                _ = shutdown_rx.recv() => self.shutdown(),
            }

            if self.stopping {
                // Let dropped connections flush and close
                self.run_until_idle();
                break;
            }
        }
    }

    fn handle_task(&mut self, task: Task) {
        log::trace!("Overlay {} running {}", self.local_peer(), task.name());
        match task {
            Task::Knock { sender } => self.handle_knock(sender),
            Task::Deliver {
                connection,
                payload,
            } => self.handle_deliver(connection, &payload),
            Task::Drain(id) => {
                if let Some(connection) = self.registry.get_mut(id) {
                    connection.drain();
                }
            }
            Task::Shutdown(id) => {
                if self.registry.get_mut(id).is_some() {
                    self.ctx.main.post(Task::Close(id));
                }
            }
            Task::Close(id) => {
                if let Some(connection) = self.registry.destroy(id) {
                    log::debug!("Closed connection {}", connection);
                }
            }
            Task::IdleTimeout {
                connection,
                generation,
            } => {
                let current = self
                    .registry
                    .live(connection)
                    .map_or(false, |c| c.is_current_idle_timer(generation));
                if current {
                    if let Some(connection) = self.registry.forget(connection) {
                        connection.send_error_and_drop(
                            ErrorCode::Misc,
                            "idle timeout",
                            DropMode::IgnoreWriteQueue,
                        );
                    }
                }
            }
            Task::Connect(remote) => {
                if let Err(e) = self.connect_to(remote) {
                    log::debug!("Connect to {} refused: {}", remote, e);
                }
            }
            Task::Send { to, data } => {
                if let Err(e) = self.send_to(&to, data) {
                    log::warn!("Send to {} failed: {}", to, e);
                }
            }
            Task::Broadcast(data) => {
                let sent = self.broadcast(&data);
                log::debug!("Broadcast {} bytes to {} peers", data.len(), sent);
            }
            Task::Tick => self.tick(),
            Task::Stop => self.shutdown(),
        }
    }

    fn handle_knock(&mut self, sender: PeerIdentity) {
        let local = self.local_peer();
        if self.stopping {
            return;
        }
        if sender == local {
            log::debug!("Ignoring knock from ourselves");
            return;
        }
        if self.registry.is_connected(&sender) {
            log::debug!("Ignoring duplicate knock from {}", sender);
            return;
        }
        if self.registry.count_role(PeerRole::TheyInitiated) >= self.config.max_inbound {
            log::info!("Rejecting knock from {}: inbound connections full", sender);
            return;
        }

        log::debug!("Accepting knock from {} @{}", sender, local);
        let id = self.next_id();
        let connection = Connection::accept(&self.ctx, id, local, sender);
        if self.registry.add(connection).is_err() {
            log::error!("Connection to {} appeared while accepting", sender);
            return;
        }
        self.on_authenticated(id);
    }

    fn handle_deliver(&mut self, id: ConnectionId, payload: &str) {
        let Some(connection) = self.registry.get_mut(id) else {
            log::trace!("Payload for unknown connection {}", id);
            return;
        };
        let remote = *connection.remote();

        match connection.recv_payload(payload) {
            Received::Ignored => {}
            Received::Authenticated => self.on_authenticated(id),
            Received::Peers(peers) => {
                let local = self.local_peer();
                for peer in peers.iter().filter(|p| **p != local) {
                    self.directory.ensure_exists(peer);
                }
            }
            Received::Data(data) => {
                if self.inbox.send(InboundMessage { from: remote, data }).is_err() {
                    log::trace!("Inbox closed; dropping message from {}", remote);
                }
            }
            Received::RemoteError { code, message } => {
                let reason = format!("{} ({})", message, code);
                self.drop_connection(
                    id,
                    &reason,
                    DropDirection::RemoteDroppedUs,
                    DropMode::IgnoreWriteQueue,
                );
            }
            Received::Malformed => {
                if let Some(connection) = self.registry.forget(id) {
                    connection.send_error_and_drop(
                        ErrorCode::Data,
                        "received corrupt message",
                        DropMode::IgnoreWriteQueue,
                    );
                }
            }
        }
    }

    /// Record the peer and gossip our view of the network to it
    fn on_authenticated(&mut self, id: ConnectionId) {
        let Some(connection) = self.registry.live(id) else {
            return;
        };
        let remote = *connection.remote();
        let role = connection.role();

        match role {
            PeerRole::WeInitiated => {
                self.directory
                    .update(&remote, TypeUpdate::UpdateToOutbound, BackoffUpdate::HardReset)
            }
            PeerRole::TheyInitiated => self.directory.ensure_exists(&remote),
        }
        log::info!("Authenticated {} ({:?})", remote, role);

        let peers = self.directory.get_peers_to_send(self.config.fanout, &remote);
        if let Some(connection) = self.registry.get_mut(id) {
            connection.send_message(MessageBody::Peers(peers));
        }
    }

    fn drop_connection(
        &mut self,
        id: ConnectionId,
        reason: &str,
        direction: DropDirection,
        mode: DropMode,
    ) {
        if let Some(connection) = self.registry.forget(id) {
            connection.close(reason, direction, mode);
        }
    }
}
