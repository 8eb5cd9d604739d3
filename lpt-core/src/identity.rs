//! Peer identity: fixed-size opaque key, hex text form.

use std::fmt;
use std::str::FromStr;

use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Length of a peer identity in bytes.
pub const PEER_ID_LEN: usize = 32;

/// Opaque peer identifier. Immutable once a session is created for it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId([u8; PEER_ID_LEN]);

impl PeerId {
    pub fn from_bytes(bytes: [u8; PEER_ID_LEN]) -> Self {
        PeerId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; PEER_ID_LEN] {
        &self.0
    }

    /// Fresh random identity, for hosts that run without a configured one.
    pub fn random() -> Self {
        let mut bytes = [0u8; PEER_ID_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        PeerId(bytes)
    }

    /// Short form for log lines (first 4 bytes).
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.short())
    }
}

impl FromStr for PeerId {
    type Err = PeerIdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != PEER_ID_LEN * 2 {
            return Err(PeerIdParseError::Length(s.len()));
        }
        let mut bytes = [0u8; PEER_ID_LEN];
        hex::decode_to_slice(s, &mut bytes).map_err(|e| PeerIdParseError::Hex(e.to_string()))?;
        Ok(PeerId(bytes))
    }
}

impl Serialize for PeerId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PeerId {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PeerIdParseError {
    #[error("expected {} hex characters, got {0}", PEER_ID_LEN * 2)]
    Length(usize),
    #[error("invalid hex: {0}")]
    Hex(String),
}
