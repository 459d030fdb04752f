//! Per-peer connection state machine
//!
//! `CONNECTING -> AUTHENTICATED -> CLOSING`, with CLOSING terminal.
//!
//! A connection listens on the shared channel through a broker subscription
//! whose handler only filters frames by (sender, receiver) and posts the
//! payload to the processing loop. Everything else (decoding, state changes,
//! draining the write queue, shutdown) runs on the processing loop.

use crate::broker::{FrameHandler, MessageBroker, Subscription};
use crate::identity::PeerIdentity;
use crate::overlay::frame::Frame;
use crate::overlay::main_thread::{MainThread, Task};
use crate::overlay::message::{AuthenticatedMessage, ErrorCode, MessageBody};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Appended to log lines reporting a broken internal invariant
pub const REPORT_INTERNAL_BUG: &str =
    "please report this bug along with this log file if this was not expected";

/// Registry key of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Authenticated,
    Closing,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Authenticated => "AUTHENTICATED",
            ConnectionState::Closing => "CLOSING",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRole {
    WeInitiated,
    TheyInitiated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropDirection {
    WeDroppedRemote,
    RemoteDroppedUs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropMode {
    /// Shut down once the write queue has been published
    FlushWriteQueue,
    /// Shut down right away
    IgnoreWriteQueue,
}

/// What the processing loop must do after a payload was received
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
    /// Duplicate, premature or otherwise uninteresting
    Ignored,
    /// Our handshake was answered
    Authenticated,
    Peers(Vec<PeerIdentity>),
    Data(Vec<u8>),
    RemoteError { code: ErrorCode, message: String },
    /// Payload failed to decode
    Malformed,
}

/// Shared plumbing handed to every connection
#[derive(Clone)]
pub struct ConnectionContext {
    pub broker: Arc<dyn MessageBroker>,
    pub channel: String,
    pub main: MainThread,
    pub idle_timeout: Option<Duration>,
}

pub struct Connection {
    id: ConnectionId,
    local: PeerIdentity,
    remote: PeerIdentity,
    role: PeerRole,
    state: ConnectionState,
    ctx: ConnectionContext,

    write_queue: VecDeque<Vec<u8>>,
    writing: bool,
    delayed_shutdown: bool,
    shutdown_scheduled: bool,

    send_sequence: u64,
    recv_sequence: u64,

    subscription: Option<Subscription>,
    idle_timer: Option<JoinHandle<()>>,
    idle_generation: u64,
}

impl Connection {
    fn new(
        ctx: &ConnectionContext,
        id: ConnectionId,
        local: PeerIdentity,
        remote: PeerIdentity,
        role: PeerRole,
    ) -> Self {
        Self {
            id,
            local,
            remote,
            role,
            state: ConnectionState::Connecting,
            ctx: ctx.clone(),
            write_queue: VecDeque::new(),
            writing: false,
            delayed_shutdown: false,
            shutdown_scheduled: false,
            send_sequence: 0,
            recv_sequence: 0,
            subscription: None,
            idle_timer: None,
            idle_generation: 0,
        }
    }

    /// Start listening and knock on `remote`; the handshake completes later
    pub fn initiate(
        ctx: &ConnectionContext,
        id: ConnectionId,
        local: PeerIdentity,
        remote: PeerIdentity,
    ) -> Self {
        log::debug!("Connection::initiate {} to {}", id, remote);
        let mut connection = Self::new(ctx, id, local, remote, PeerRole::WeInitiated);
        connection.start_read();

        let init = Frame::init(local, remote).encode();
        ctx.broker.publish(&ctx.channel, &remote, &init);
        connection
    }

    /// Answer a knock from `remote` with ACCEPT
    pub fn accept(
        ctx: &ConnectionContext,
        id: ConnectionId,
        local: PeerIdentity,
        remote: PeerIdentity,
    ) -> Self {
        log::debug!("Connection::accept {} from {} @{}", id, remote, local);
        let mut connection = Self::new(ctx, id, local, remote, PeerRole::TheyInitiated);
        connection.start_read();
        connection.state = ConnectionState::Authenticated;
        connection.send_message(MessageBody::Accept);
        connection
    }

    fn start_read(&mut self) {
        log::trace!("Connection::start_read {} to {}", self.local, self);

        let local = self.local;
        let remote = self.remote;
        let connection = self.id;
        let main = self.ctx.main.clone();
        let handler: FrameHandler = Arc::new(move |raw: &[u8]| {
            let frame = match Frame::decode(raw) {
                Ok(frame) => frame,
                Err(e) => {
                    log::trace!("Ignoring undecodable frame: {}", e);
                    return;
                }
            };
            if frame.sender != remote || frame.receiver != local {
                return;
            }
            if frame.is_init() {
                log::trace!("INIT from {} but already initialized, ignoring", remote);
                return;
            }
            main.post(Task::Deliver {
                connection,
                payload: frame.payload,
            });
        });

        self.subscription = Some(Subscription::new(
            self.ctx.broker.clone(),
            &self.ctx.channel,
            handler,
        ));
        self.arm_idle_timer();
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn local(&self) -> &PeerIdentity {
        &self.local
    }

    pub fn remote(&self) -> &PeerIdentity {
        &self.remote
    }

    pub fn role(&self) -> PeerRole {
        self.role
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_authenticated(&self) -> bool {
        self.state == ConnectionState::Authenticated
    }

    pub fn is_listening(&self) -> bool {
        self.subscription.is_some()
    }

    pub fn pending_writes(&self) -> usize {
        self.write_queue.len()
    }

    pub fn is_shutdown_scheduled(&self) -> bool {
        self.shutdown_scheduled
    }

    /// Queue `body` for the remote and make sure a drain is pending
    pub fn send_message(&mut self, body: MessageBody) {
        if self.state == ConnectionState::Closing {
            log::error!("Trying to send message to {} after drop", self);
            log::error!("{}", REPORT_INTERNAL_BUG);
            return;
        }

        let message = AuthenticatedMessage::new(self.send_sequence, body);
        let payload = match message.to_payload() {
            Ok(payload) => payload,
            Err(e) => {
                log::error!("Failed to encode {} for {}: {}", message.type_name(), self, e);
                return;
            }
        };
        log::trace!("Connection::send_message {} to {}", message.type_name(), self);
        self.send_sequence += 1;

        self.write_queue
            .push_back(Frame::new(self.local, self.remote, payload).encode());
        if !self.writing {
            self.writing = true;
            self.ctx.main.post(Task::Drain(self.id));
        }
    }

    /// Publish the write queue in order, then run a deferred shutdown if one
    /// was requested while writing
    pub fn drain(&mut self) {
        let mut wrote = false;
        while let Some(frame) = self.write_queue.pop_front() {
            self.ctx.broker.publish(&self.ctx.channel, &self.remote, &frame);
            wrote = true;
        }
        self.writing = false;

        // idle means neither side has moved data
        if wrote && self.state != ConnectionState::Closing {
            self.arm_idle_timer();
        }

        if self.delayed_shutdown {
            self.shutdown();
        }
    }

    /// Decode and classify a payload that passed the frame filter
    pub fn recv_payload(&mut self, payload: &str) -> Received {
        if self.state == ConnectionState::Closing {
            return Received::Ignored;
        }

        let message = match AuthenticatedMessage::from_payload(payload) {
            Ok(message) => message,
            Err(e) => {
                log::error!("recv_payload got a corrupt message from {}: {}", self, e);
                return Received::Malformed;
            }
        };

        if message.sequence < self.recv_sequence {
            log::trace!(
                "Ignoring re-delivered message {} from {}",
                message.sequence,
                self
            );
            return Received::Ignored;
        }
        self.recv_sequence = message.sequence.saturating_add(1);
        self.arm_idle_timer();

        match message.body {
            MessageBody::Accept => {
                if self.role == PeerRole::WeInitiated && self.state == ConnectionState::Connecting {
                    self.state = ConnectionState::Authenticated;
                    Received::Authenticated
                } else {
                    log::debug!("Unexpected ACCEPT from {} in state {}", self, self.state);
                    Received::Ignored
                }
            }
            MessageBody::Error { code, message } => Received::RemoteError { code, message },
            MessageBody::Peers(peers) if self.is_authenticated() => Received::Peers(peers),
            MessageBody::Data(data) if self.is_authenticated() => Received::Data(data),
            body => {
                log::debug!(
                    "Ignoring {} from {} before authentication",
                    AuthenticatedMessage::new(message.sequence, body).type_name(),
                    self
                );
                Received::Ignored
            }
        }
    }

    /// Drop the peer: move to CLOSING and shut down now or once the write
    /// queue is drained.
    ///
    /// The caller is responsible for removing the connection from the live set.
    pub fn close(&mut self, reason: &str, direction: DropDirection, mode: DropMode) {
        if self.state == ConnectionState::Closing {
            return;
        }

        if self.state != ConnectionState::Authenticated {
            log::debug!(
                "Connection::close {} in state {} we called: {:?}",
                self,
                self.state,
                self.role
            );
        } else if direction == DropDirection::WeDroppedRemote {
            log::info!("Dropping peer {}; reason: {}", self, reason);
        } else {
            log::info!("Peer {} dropped us; reason: {}", self, reason);
        }

        self.state = ConnectionState::Closing;
        self.subscription = None;

        if mode == DropMode::IgnoreWriteQueue || !self.writing {
            self.shutdown();
        } else {
            self.delayed_shutdown = true;
        }
    }

    /// Best-effort error notice followed by a drop
    pub fn send_error_and_drop(&mut self, code: ErrorCode, message: &str, mode: DropMode) {
        self.send_message(MessageBody::Error {
            code,
            message: message.to_string(),
        });
        self.close(message, DropDirection::WeDroppedRemote, mode);
    }

    /// First shutdown phase; may only run once
    pub fn shutdown(&mut self) {
        if self.shutdown_scheduled {
            log::error!("Double schedule of shutdown {}", self);
            log::error!("{}", REPORT_INTERNAL_BUG);
            return;
        }

        self.cancel_idle_timer();
        self.shutdown_scheduled = true;
        self.subscription = None;
        self.ctx.main.post(Task::Shutdown(self.id));
    }

    /// Whether an idle timeout with `generation` belongs to the armed timer
    pub fn is_current_idle_timer(&self, generation: u64) -> bool {
        self.idle_timer.is_some() && generation == self.idle_generation
    }

    fn arm_idle_timer(&mut self) {
        let Some(timeout) = self.ctx.idle_timeout else {
            return;
        };
        self.cancel_idle_timer();

        // Timers need a runtime; synchronous drivers run without one
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };

        self.idle_generation += 1;
        let generation = self.idle_generation;
        let connection = self.id;
        let main = self.ctx.main.clone();
        self.idle_timer = Some(runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            main.post(Task::IdleTimeout {
                connection,
                generation,
            });
        }));
    }

    fn cancel_idle_timer(&mut self) {
        if let Some(timer) = self.idle_timer.take() {
            timer.abort();
        }
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.remote, self.id)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.cancel_idle_timer();
    }
}
