//! Wire frames
//!
//! Every frame on the shared channel is a JSON object with a single string
//! field `data` holding `sender || receiver || payload`. Both identities are
//! fixed-width, so the split is purely positional.

use crate::identity::{IdentityError, PeerIdentity, IDENTITY_LENGTH};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Payload of a connection request ("knock")
pub const INIT_TAG: &str = "INIT";

const HEADER_LENGTH: usize = 2 * IDENTITY_LENGTH;

/// Frame decoding errors
#[derive(Error, Debug)]
pub enum FrameError {
    #[error("Invalid frame JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Frame too short: {0} bytes")]
    TooShort(usize),
    #[error("Invalid identity in frame header: {0}")]
    Identity(#[from] IdentityError),
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    data: String,
}

/// One addressed frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub sender: PeerIdentity,
    pub receiver: PeerIdentity,
    pub payload: String,
}

impl Frame {
    pub fn new(sender: PeerIdentity, receiver: PeerIdentity, payload: impl Into<String>) -> Self {
        Self {
            sender,
            receiver,
            payload: payload.into(),
        }
    }

    /// Connection request from `sender` to `receiver`
    pub fn init(sender: PeerIdentity, receiver: PeerIdentity) -> Self {
        Self::new(sender, receiver, INIT_TAG)
    }

    pub fn is_init(&self) -> bool {
        self.payload == INIT_TAG
    }

    pub fn encode(&self) -> Vec<u8> {
        let envelope = Envelope {
            data: format!("{}{}{}", self.sender, self.receiver, self.payload),
        };
        // A struct with one string field always serializes
        serde_json::to_vec(&envelope).unwrap_or_default()
    }

    pub fn decode(raw: &[u8]) -> Result<Self, FrameError> {
        let Envelope { data } = serde_json::from_slice(raw)?;
        let bytes = data.as_bytes();
        if bytes.len() < HEADER_LENGTH {
            return Err(FrameError::TooShort(bytes.len()));
        }

        let sender = PeerIdentity::from_bytes(&bytes[..IDENTITY_LENGTH])?;
        let receiver = PeerIdentity::from_bytes(&bytes[IDENTITY_LENGTH..HEADER_LENGTH])?;
        // The header is ASCII, so byte 16 is a char boundary
        let payload = data.get(HEADER_LENGTH..).unwrap_or_default().to_string();

        Ok(Self {
            sender,
            receiver,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(s: &str) -> PeerIdentity {
        PeerIdentity::parse(s).unwrap()
    }

    #[test]
    fn test_init_frame_layout() {
        let frame = Frame::init(peer("AAAAAAAA"), peer("BBBBBBBB"));
        assert!(frame.is_init());

        let raw = frame.encode();
        let value: serde_json::Value = serde_json::from_slice(&raw).unwrap();
        assert_eq!(value["data"], "AAAAAAAABBBBBBBBINIT");
        assert_eq!(Frame::decode(&raw).unwrap(), frame);
    }

    #[test]
    fn test_payload_with_unicode() {
        let frame = Frame::new(peer("AAAAAAAA"), peer("BBBBBBBB"), "h\u{e9}llo");
        let decoded = Frame::decode(&frame.encode()).unwrap();
        assert_eq!(decoded.payload, "h\u{e9}llo");
        assert!(!decoded.is_init());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(Frame::decode(b"not json"), Err(FrameError::Json(_))));
        assert!(matches!(
            Frame::decode(br#"{"data":"AAAAAAAA"}"#),
            Err(FrameError::TooShort(8))
        ));
        assert!(matches!(
            Frame::decode("{\"data\":\"AAAAAAAA\u{e9}BBBBBBBINIT\"}".as_bytes()),
            Err(FrameError::Identity(_))
        ));
    }
}
