//! Peer identity and membership.
//!
//! `PeerId` wraps a u64 but displays as a 16-character hex string for
//! human readability. `PeerList` is the endpoint-keyed membership map
//! shared between the transport and the coordinator.

use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::RwLock;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PeerIdError {
    #[error("Peer id must be 16 hex characters")]
    WrongLength,
    #[error("Peer id contains non-hex characters")]
    NotHex,
}

/// Identity a process announces with, fixed for the process lifetime.
///
/// Wraps a random non-zero `u64` and reads as 16 lowercase hex characters
/// everywhere a human sees it: logs, the console, and the wire.
///
/// # Examples
/// ```
/// use netsync_core::PeerId;
///
/// let id: PeerId = "00c49ae2177b3f05".parse().unwrap();
/// assert_eq!(id.to_string(), "00c49ae2177b3f05");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId(u64);

impl PeerId {
    /// Draw a fresh random id. Zero stays reserved so an id can always be
    /// told apart from an unset field.
    pub fn generate() -> Self {
        use rand::Rng;
        let mut rng = rand::rng();
        loop {
            match rng.random::<u64>() {
                0 => continue,
                id => return Self(id),
            }
        }
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Display for PeerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl FromStr for PeerId {
    type Err = PeerIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 16 {
            return Err(PeerIdError::WrongLength);
        }
        // from_str_radix would accept a leading sign, which is not hex
        if !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(PeerIdError::NotHex);
        }
        let id = u64::from_str_radix(s, 16).map_err(|_| PeerIdError::NotHex)?;
        Ok(Self(id))
    }
}

impl From<u64> for PeerId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

impl From<PeerId> for u64 {
    fn from(id: PeerId) -> u64 {
        id.0
    }
}

// Ids travel as their hex form, never as raw numbers
impl serde::Serialize for PeerId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for PeerId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer)?
            .parse()
            .map_err(serde::de::Error::custom)
    }
}

/// A remote process: the id it announced and the endpoint it can be dialed
/// at.
///
/// Two peers are the same peer when they share an endpoint — the id is
/// informational (logging, self-filtering) and a restarted process with a
/// fresh id but the same endpoint replaces nothing.
#[derive(Debug, Clone)]
pub struct Peer {
    pub id: PeerId,
    pub addr: SocketAddr,
}

impl Peer {
    pub fn new(id: PeerId, addr: SocketAddr) -> Self {
        Self { id, addr }
    }
}

impl PartialEq for Peer {
    fn eq(&self, other: &Self) -> bool {
        self.addr == other.addr
    }
}

impl Eq for Peer {}

impl std::hash::Hash for Peer {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.addr.hash(state);
    }
}

impl Display for Peer {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.addr)
    }
}

/// Membership map keyed by endpoint, so the list can never hold two entries
/// for the same address.
///
/// Thread-safe; wrap in `Arc` for shared ownership.
pub struct PeerList {
    peers: RwLock<HashMap<SocketAddr, Peer>>,
}

impl Default for PeerList {
    fn default() -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
        }
    }
}

impl PeerList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add-if-absent keyed by endpoint. Returns `true` when the endpoint was
    /// not known before; a later announcement for a known endpoint is
    /// ignored.
    pub fn add(&self, peer: Peer) -> bool {
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        match peers.entry(peer.addr) {
            std::collections::hash_map::Entry::Occupied(_) => false,
            std::collections::hash_map::Entry::Vacant(entry) => {
                entry.insert(peer);
                true
            }
        }
    }

    /// Remove the peer at `addr`, returning it if it was present.
    pub fn remove(&self, addr: &SocketAddr) -> Option<Peer> {
        self.peers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(addr)
    }

    pub fn contains(&self, addr: &SocketAddr) -> bool {
        self.peers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(addr)
    }

    /// Point-in-time copy of the membership, for fan-out and introspection.
    pub fn snapshot(&self) -> Vec<Peer> {
        self.peers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.peers.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.peers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}
