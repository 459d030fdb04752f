//! Fixed-width identities
//!
//! Every peer and every application is addressed by an 8-character label over
//! `[0-9A-Za-z]`. The two roles share one representation; the role is a type
//! parameter so an application identity can never be passed where a peer
//! identity is expected.

use crate::identity::random::RandomnessSource;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::str::FromStr;
use thiserror::Error;

// =============================================================================
// Constants
// =============================================================================

/// Length of a single identity in bytes
pub const IDENTITY_LENGTH: usize = 8;

/// Length of an (application, peer) identity pair on the wire
pub const FULL_IDENTITY_LENGTH: usize = 2 * IDENTITY_LENGTH;

/// Base-62 digits in digit-value order
pub const ALPHABET: &[u8; 62] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

const DECIMAL_MODULUS: u64 = 100_000_000;

/// Identity construction and arithmetic errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    #[error("Invalid identity length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("Invalid identity character: {0:?}")]
    InvalidCharacter(char),
}

// =============================================================================
// Roles
// =============================================================================

/// Semantic role of an identity
pub trait Role: 'static {
    const NAME: &'static str;
}

/// Which software/network a peer belongs to
#[derive(Debug)]
pub enum App {}

/// Which node instance
#[derive(Debug)]
pub enum Peer {}

impl Role for App {
    const NAME: &'static str = "AppIdentity";
}

impl Role for Peer {
    const NAME: &'static str = "PeerIdentity";
}

pub type AppIdentity = Identity<App>;
pub type PeerIdentity = Identity<Peer>;

// =============================================================================
// Identity
// =============================================================================

/// An 8-byte ASCII label tagged with its role
pub struct Identity<R> {
    bytes: [u8; IDENTITY_LENGTH],
    role: PhantomData<fn() -> R>,
}

impl<R: Role> Identity<R> {
    fn from_raw(bytes: [u8; IDENTITY_LENGTH]) -> Self {
        Self {
            bytes,
            role: PhantomData,
        }
    }

    /// Parse an identity, failing on any length other than 8
    pub fn parse(s: &str) -> Result<Self, IdentityError> {
        Self::from_bytes(s.as_bytes())
    }

    /// Build from raw bytes (e.g. a slice of a wire frame)
    pub fn from_bytes(raw: &[u8]) -> Result<Self, IdentityError> {
        if raw.len() != IDENTITY_LENGTH {
            return Err(IdentityError::InvalidLength {
                expected: IDENTITY_LENGTH,
                actual: raw.len(),
            });
        }
        if let Some(&bad) = raw.iter().find(|b| !b.is_ascii() || b.is_ascii_control()) {
            return Err(IdentityError::InvalidCharacter(char::from(bad)));
        }

        let mut bytes = [0u8; IDENTITY_LENGTH];
        bytes.copy_from_slice(raw);
        Ok(Self::from_raw(bytes))
    }

    /// Uniformly random identity over the base-62 alphabet
    pub fn generate(rng: &RandomnessSource) -> Self {
        let mut bytes = [0u8; IDENTITY_LENGTH];
        for byte in bytes.iter_mut() {
            *byte = ALPHABET[rng.index(ALPHABET.len())];
        }
        Self::from_raw(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; IDENTITY_LENGTH] {
        &self.bytes
    }

    pub fn as_str(&self) -> &str {
        // ASCII is enforced at construction
        std::str::from_utf8(&self.bytes).unwrap_or_default()
    }

    /// Treat the identity as a base-62 number and add `n`.
    ///
    /// Only the low 8 digits are kept. Positions the sum does not reach keep
    /// their original characters.
    pub fn add(&self, n: u64) -> Result<Self, IdentityError> {
        let mut sum: u128 = 0;
        for &byte in &self.bytes {
            sum = sum * 62 + u128::from(digit_value(byte)?);
        }
        sum += u128::from(n);

        let mut bytes = self.bytes;
        let mut position = IDENTITY_LENGTH;
        while sum > 0 && position > 0 {
            position -= 1;
            bytes[position] = ALPHABET[(sum % 62) as usize];
            sum /= 62;
        }

        Ok(Self::from_raw(bytes))
    }
}

impl Identity<Peer> {
    /// Next identity in the decimal test sequence.
    ///
    /// Reads the trailing decimal digits as an integer, adds one and renders
    /// the result as an 8-digit zero-padded number.
    pub fn increment(&self) -> Self {
        let digits = self
            .bytes
            .iter()
            .rev()
            .take_while(|b| b.is_ascii_digit())
            .count();
        let value = self.bytes[IDENTITY_LENGTH - digits..]
            .iter()
            .fold(0u64, |acc, b| acc * 10 + u64::from(b - b'0'));

        let rendered = format!("{:08}", (value + 1) % DECIMAL_MODULUS);
        let mut bytes = [0u8; IDENTITY_LENGTH];
        bytes.copy_from_slice(rendered.as_bytes());
        Self::from_raw(bytes)
    }
}

fn digit_value(byte: u8) -> Result<u8, IdentityError> {
    match byte {
        b'0'..=b'9' => Ok(byte - b'0'),
        b'A'..=b'Z' => Ok(byte - b'A' + 10),
        b'a'..=b'z' => Ok(byte - b'a' + 36),
        _ => Err(IdentityError::InvalidCharacter(char::from(byte))),
    }
}

/// Canonical name for the pair of peers, independent of who asks
pub fn session_name(a: &PeerIdentity, b: &PeerIdentity) -> String {
    let (low, high) = if a <= b { (a, b) } else { (b, a) };
    format!("{}{}", low, high)
}

impl<R> Clone for Identity<R> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<R> Copy for Identity<R> {}

impl<R> PartialEq for Identity<R> {
    fn eq(&self, other: &Self) -> bool {
        self.bytes == other.bytes
    }
}

impl<R> Eq for Identity<R> {}

impl<R> PartialOrd for Identity<R> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<R> Ord for Identity<R> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.bytes.cmp(&other.bytes)
    }
}

impl<R> Hash for Identity<R> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.bytes.hash(state);
    }
}

impl<R: Role> fmt::Debug for Identity<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", R::NAME, self.as_str())
    }
}

impl<R: Role> fmt::Display for Identity<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl<R: Role> FromStr for Identity<R> {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl<R: Role> Serialize for Identity<R> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de, R: Role> Deserialize<'de> for Identity<R> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(de::Error::custom)
    }
}

// =============================================================================
// Full identity
// =============================================================================

/// (application, peer) pair; 16 characters on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FullIdentity {
    pub app: AppIdentity,
    pub peer: PeerIdentity,
}

impl FullIdentity {
    pub fn new(app: AppIdentity, peer: PeerIdentity) -> Self {
        Self { app, peer }
    }

    pub fn generate(rng: &RandomnessSource) -> Self {
        Self {
            app: AppIdentity::generate(rng),
            peer: PeerIdentity::generate(rng),
        }
    }

    /// Split a 16-character string into its two halves by position
    pub fn parse(s: &str) -> Result<Self, IdentityError> {
        let raw = s.as_bytes();
        if raw.len() != FULL_IDENTITY_LENGTH {
            return Err(IdentityError::InvalidLength {
                expected: FULL_IDENTITY_LENGTH,
                actual: raw.len(),
            });
        }

        Ok(Self {
            app: AppIdentity::from_bytes(&raw[..IDENTITY_LENGTH])?,
            peer: PeerIdentity::from_bytes(&raw[IDENTITY_LENGTH..])?,
        })
    }
}

impl fmt::Display for FullIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.app, self.peer)
    }
}

impl FromStr for FullIdentity {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for FullIdentity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for FullIdentity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(s: &str) -> PeerIdentity {
        PeerIdentity::parse(s).unwrap()
    }

    /// Reference base-62 decoder
    fn decode(id: &PeerIdentity) -> u64 {
        id.as_str().bytes().fold(0u64, |acc, b| {
            let pos = ALPHABET.iter().position(|&a| a == b).unwrap() as u64;
            acc * 62 + pos
        })
    }

    #[test]
    fn test_parse_roundtrip() {
        for s in ["00000000", "AAAAAAAA", "zZ09aY8x", "abcdefgh"] {
            assert_eq!(peer(s).to_string(), s);
        }
    }

    #[test]
    fn test_parse_wrong_length() {
        for s in ["", "1234567", "123456789", "0000000000000000"] {
            assert_eq!(
                PeerIdentity::parse(s),
                Err(IdentityError::InvalidLength {
                    expected: IDENTITY_LENGTH,
                    actual: s.len()
                })
            );
        }
    }

    #[test]
    fn test_parse_rejects_non_ascii() {
        // 8 bytes, 7 characters
        assert!(matches!(
            PeerIdentity::parse("ab\u{e9}defg"),
            Err(IdentityError::InvalidCharacter(_))
        ));
    }

    #[test]
    fn test_generate_uses_alphabet() {
        let rng = RandomnessSource::seeded(11);
        for _ in 0..100 {
            let id = PeerIdentity::generate(&rng);
            assert!(id.as_bytes().iter().all(|b| ALPHABET.contains(b)));
        }
    }

    #[test]
    fn test_increment() {
        assert_eq!(peer("00000001").increment(), peer("00000002"));
        assert_eq!(peer("00000099").increment(), peer("00000100"));
        assert_eq!(peer("00000256").increment(), peer("00000257"));
        assert_eq!(peer("99999999").increment(), peer("00000000"));
    }

    #[test]
    fn test_increment_non_numeric_prefix() {
        assert_eq!(peer("ABCD0041").increment(), peer("00000042"));
        assert_eq!(peer("ABCDEFGH").increment(), peer("00000001"));
    }

    #[test]
    fn test_add_matches_reference() {
        let bases = ["00000000", "0000000z", "AAAAAAAA", "0abcXYZ9", "10000000"];
        let offsets = [0u64, 1, 61, 62, 3843, 1_000_000, 56_800_235_583];
        for base in bases {
            let id = peer(base);
            for n in offsets {
                let expected = decode(&id) + n;
                if expected >= 62u64.pow(8) {
                    continue;
                }
                assert_eq!(decode(&id.add(n).unwrap()), expected, "{} + {}", base, n);
            }
        }
    }

    #[test]
    fn test_add_carry() {
        assert_eq!(peer("0000000z").add(1).unwrap(), peer("00000010"));
        assert_eq!(peer("00000009").add(1).unwrap(), peer("0000000A"));
    }

    #[test]
    fn test_add_keeps_untouched_prefix() {
        // a zero sum writes no digits at all
        assert_eq!(peer("00000000").add(0).unwrap(), peer("00000000"));
    }

    #[test]
    fn test_add_rejects_outside_alphabet() {
        assert_eq!(
            peer("0000-000").add(1),
            Err(IdentityError::InvalidCharacter('-'))
        );
    }

    #[test]
    fn test_ordering_and_session_name() {
        let a = peer("AAAAAAAA");
        let b = peer("BBBBBBBB");
        assert!(a < b);
        assert_eq!(session_name(&a, &b), "AAAAAAAABBBBBBBB");
        assert_eq!(session_name(&b, &a), "AAAAAAAABBBBBBBB");
    }

    #[test]
    fn test_full_identity() {
        let full = FullIdentity::parse("appappapPEERPEER").unwrap();
        assert_eq!(full.app, AppIdentity::parse("appappap").unwrap());
        assert_eq!(full.peer, peer("PEERPEER"));
        assert_eq!(full.to_string(), "appappapPEERPEER");

        assert!(matches!(
            FullIdentity::parse("appappap"),
            Err(IdentityError::InvalidLength { expected: 16, .. })
        ));
    }

    #[test]
    fn test_full_identity_ordering() {
        let a = FullIdentity::parse("AAAAAAAAzzzzzzzz").unwrap();
        let b = FullIdentity::parse("BBBBBBBB00000000").unwrap();
        let c = FullIdentity::parse("BBBBBBBB00000001").unwrap();
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_serde_as_string() {
        let id = peer("00000256");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"00000256\"");
        let back: PeerIdentity = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);

        assert!(serde_json::from_str::<PeerIdentity>("\"short\"").is_err());
    }
}
