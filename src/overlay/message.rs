//! Authenticated message envelope carried in frame payloads

use crate::identity::PeerIdentity;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Reason attached to an error notice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    Misc,
    Data,
    Conf,
    Auth,
    Load,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCode::Misc => "ERR_MISC",
            ErrorCode::Data => "ERR_DATA",
            ErrorCode::Conf => "ERR_CONF",
            ErrorCode::Auth => "ERR_AUTH",
            ErrorCode::Load => "ERR_LOAD",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageBody {
    /// Handshake reply
    Accept,

    /// Notice sent before dropping the connection
    Error { code: ErrorCode, message: String },

    /// Gossiped peer identities
    Peers(Vec<PeerIdentity>),

    /// Opaque application payload
    Data(#[serde(with = "hex_bytes")] Vec<u8>),
}

/// One message on an established connection.
///
/// `sequence` counts up from 0 per connection and direction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticatedMessage {
    pub sequence: u64,
    pub body: MessageBody,
}

impl AuthenticatedMessage {
    pub fn new(sequence: u64, body: MessageBody) -> Self {
        Self { sequence, body }
    }

    pub fn to_payload(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_payload(payload: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(payload)
    }

    /// Message type name for logging
    pub fn type_name(&self) -> &'static str {
        match self.body {
            MessageBody::Accept => "Accept",
            MessageBody::Error { .. } => "Error",
            MessageBody::Peers(_) => "Peers",
            MessageBody::Data(_) => "Data",
        }
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}
