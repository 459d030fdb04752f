//! Single-consumer task queue feeding the overlay processing loop

use crate::identity::PeerIdentity;
use crate::overlay::connection::ConnectionId;
use tokio::sync::mpsc;

/// Work item executed by the processing loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Task {
    /// INIT frame addressed to us
    Knock { sender: PeerIdentity },
    /// Payload of a frame accepted by a connection's filter
    Deliver {
        connection: ConnectionId,
        payload: String,
    },
    /// Publish everything in a connection's write queue
    Drain(ConnectionId),
    /// First shutdown phase
    Shutdown(ConnectionId),
    /// Second shutdown phase; the connection is destroyed
    Close(ConnectionId),
    IdleTimeout {
        connection: ConnectionId,
        generation: u64,
    },

    Connect(PeerIdentity),
    Send { to: PeerIdentity, data: Vec<u8> },
    Broadcast(Vec<u8>),
    Tick,
    Stop,
}

impl Task {
    /// Task name for logging
    pub fn name(&self) -> &'static str {
        match self {
            Task::Knock { .. } => "Knock",
            Task::Deliver { .. } => "Deliver",
            Task::Drain(_) => "Drain",
            Task::Shutdown(_) => "Shutdown",
            Task::Close(_) => "Close",
            Task::IdleTimeout { .. } => "IdleTimeout",
            Task::Connect(_) => "Connect",
            Task::Send { .. } => "Send",
            Task::Broadcast(_) => "Broadcast",
            Task::Tick => "Tick",
            Task::Stop => "Stop",
        }
    }
}

/// Producer side of the task queue; any context may post, only the loop consumes
#[derive(Debug, Clone)]
pub struct MainThread {
    tx: mpsc::UnboundedSender<Task>,
}

impl MainThread {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Task>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Enqueue `task`; returns `false` once the loop is gone
    pub fn post(&self, task: Task) -> bool {
        let name = task.name();
        match self.tx.send(task) {
            Ok(()) => true,
            Err(_) => {
                log::debug!("Dropping {} task: processing loop closed", name);
                false
            }
        }
    }
}
