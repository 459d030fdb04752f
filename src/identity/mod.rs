//! Peer and application addressing
//!
//! Fixed-width identities used as the addressing primitive by the directory,
//! the wire frames and the connection registry.

pub mod name;
pub mod random;

pub use name::{
    session_name, App, AppIdentity, FullIdentity, Identity, IdentityError, Peer, PeerIdentity,
    Role, ALPHABET, FULL_IDENTITY_LENGTH, IDENTITY_LENGTH,
};
pub use random::RandomnessSource;
