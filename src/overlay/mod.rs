//! Overlay networking
//!
//! Peers share one broker channel. A dialer publishes an `INIT` frame to the
//! remote, the remote's listener turns it into an accepted connection, and
//! both sides then exchange sequenced JSON messages over the same channel.
//! All connection state lives on the manager's processing loop; broker
//! callbacks only post tasks to it.

pub mod connection;
pub mod frame;
pub mod listener;
pub mod main_thread;
pub mod manager;
pub mod message;
pub mod registry;

pub use connection::{
    Connection, ConnectionContext, ConnectionId, ConnectionState, DropDirection, DropMode,
    PeerRole, Received, REPORT_INTERNAL_BUG,
};
pub use frame::{Frame, FrameError, INIT_TAG};
pub use listener::Listener;
pub use main_thread::{MainThread, Task};
pub use manager::{InboundMessage, OverlayConfig, OverlayError, OverlayHandle, OverlayManager};
pub use message::{AuthenticatedMessage, ErrorCode, MessageBody};
pub use registry::ConnectionRegistry;
