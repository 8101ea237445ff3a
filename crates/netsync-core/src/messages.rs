//! Typed payloads carried inside [`Envelope`]s.
//!
//! Discovery messages (`Shout`, `Response`, `Ping`) travel over UDP; data
//! messages travel over TCP. Each type owns its envelope tag so senders
//! and receivers can never disagree on the spelling.
//!
//! [`Envelope`]: crate::envelope::Envelope

use crate::peer::{Peer, PeerId};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Announcement broadcast by a node looking for peers.
///
/// Earns a [`Response`] from every listener that isn't the sender, so two
/// nodes starting in either order still find each other.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Shout {
    pub peer_id: PeerId,
    pub addr: SocketAddr,
}

impl Shout {
    pub const TAG: &'static str = "shout";

    pub fn new(peer_id: PeerId, addr: SocketAddr) -> Self {
        Self { peer_id, addr }
    }

    /// The announced peer, as a receiver should record it.
    pub fn peer(&self) -> Peer {
        Peer::new(self.peer_id, self.addr)
    }
}

/// Reply to a [`Shout`] so the shouter learns about this node too.
///
/// Never itself answered, which bounds the handshake to two hops.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub peer_id: PeerId,
    pub addr: SocketAddr,
}

impl Response {
    pub const TAG: &'static str = "response";

    pub fn new(peer_id: PeerId, addr: SocketAddr) -> Self {
        Self { peer_id, addr }
    }

    pub fn peer(&self) -> Peer {
        Peer::new(self.peer_id, self.addr)
    }
}

/// Liveness probe. Part of the wire protocol; currently accepted and
/// ignored by every receiver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ping {}

impl Ping {
    pub const TAG: &'static str = "ping";
}

/// What a [`DataMessage`] asks the receiving store to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataAction {
    /// Upsert the carried value under the key.
    Sync,
    /// Delete the key.
    Remove,
    /// Historical bulk form; merged exactly like `Sync`. Accepted for wire
    /// compatibility, never emitted.
    Full,
}

/// A replicated mutation, one per key.
///
/// Wire format:
/// `{"key":"hello","timestamp":1724371200000,"action":"sync","typeName":"console.message","entries":[[...]]}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataMessage {
    pub key: String,
    /// Milliseconds since the Unix epoch at construction. Attached for
    /// diagnostics; receivers do not consult it when merging.
    pub timestamp: u64,
    pub action: DataAction,
    /// Registry tag of the value type; absent for removals.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub type_name: Option<String>,
    /// Ordered value payloads. Mutations carry exactly one today.
    #[serde(default)]
    pub entries: Vec<Vec<u8>>,
}

impl DataMessage {
    pub const TAG: &'static str = "data";

    /// Upsert message for one key.
    pub fn sync(key: impl Into<String>, type_name: impl Into<String>, value: Vec<u8>) -> Self {
        Self {
            key: key.into(),
            timestamp: now_millis(),
            action: DataAction::Sync,
            type_name: Some(type_name.into()),
            entries: vec![value],
        }
    }

    /// Deletion message for one key.
    pub fn remove(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            timestamp: now_millis(),
            action: DataAction::Remove,
            type_name: None,
            entries: Vec::new(),
        }
    }
}

/// Milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Envelope;

    fn test_peer_id() -> PeerId {
        "a1b2c3d4e5f67890".parse().unwrap()
    }

    fn test_addr() -> SocketAddr {
        "192.168.1.20:4100".parse().unwrap()
    }

    #[test]
    fn test_shout_roundtrip_through_envelope() {
        let shout = Shout::new(test_peer_id(), test_addr());
        let env = Envelope::pack(Shout::TAG, &shout).unwrap();
        assert_eq!(env.tag, "shout");

        let decoded: Shout = env.unpack().unwrap();
        assert_eq!(decoded, shout);
        assert_eq!(decoded.peer().addr, test_addr());
    }

    #[test]
    fn test_shout_wire_format() {
        let shout = Shout::new(test_peer_id(), test_addr());
        let json = serde_json::to_string(&shout).unwrap();
        assert!(json.contains("\"peerId\":\"a1b2c3d4e5f67890\""));
        assert!(json.contains("\"addr\":\"192.168.1.20:4100\""));
    }

    #[test]
    fn test_response_roundtrip_through_envelope() {
        let response = Response::new(test_peer_id(), test_addr());
        let env = Envelope::pack(Response::TAG, &response).unwrap();
        assert_eq!(env.tag, "response");

        let decoded: Response = env.unpack().unwrap();
        assert_eq!(decoded, response);
    }

    #[test]
    fn test_ping_is_empty_object() {
        let json = serde_json::to_string(&Ping {}).unwrap();
        assert_eq!(json, "{}");
        let _: Ping = serde_json::from_str("{}").unwrap();
    }

    #[test]
    fn test_action_spelling() {
        assert_eq!(serde_json::to_string(&DataAction::Sync).unwrap(), "\"sync\"");
        assert_eq!(
            serde_json::to_string(&DataAction::Remove).unwrap(),
            "\"remove\""
        );
        assert_eq!(serde_json::to_string(&DataAction::Full).unwrap(), "\"full\"");
    }

    #[test]
    fn test_sync_message_shape() {
        let msg = DataMessage::sync("hello", "console.message", vec![1, 2, 3]);
        assert_eq!(msg.action, DataAction::Sync);
        assert_eq!(msg.type_name.as_deref(), Some("console.message"));
        assert_eq!(msg.entries, vec![vec![1, 2, 3]]);
        assert!(msg.timestamp > 0);
    }

    #[test]
    fn test_remove_message_has_no_type() {
        let msg = DataMessage::remove("hello");
        assert_eq!(msg.action, DataAction::Remove);
        assert_eq!(msg.type_name, None);
        assert!(msg.entries.is_empty());

        let json = serde_json::to_string(&msg).unwrap();
        assert!(!json.contains("typeName"));
    }

    #[test]
    fn test_data_message_missing_optional_fields() {
        // Older senders may omit typeName and entries entirely
        let json = r#"{"key":"k","timestamp":0,"action":"remove"}"#;
        let msg: DataMessage = serde_json::from_str(json).unwrap();
        assert_eq!(msg.action, DataAction::Remove);
        assert_eq!(msg.type_name, None);
        assert!(msg.entries.is_empty());
    }

    #[test]
    fn test_data_message_roundtrip_through_envelope() {
        let msg = DataMessage::sync("greeting", "console.message", b"{}".to_vec());
        let env = Envelope::pack(DataMessage::TAG, &msg).unwrap();
        let bytes = env.to_bytes();

        let parsed = Envelope::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.tag, "data");
        let decoded: DataMessage = parsed.unpack().unwrap();
        assert_eq!(decoded, msg);
    }
}
