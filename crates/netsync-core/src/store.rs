//! Replicated key-value store.
//!
//! Every mutation commits locally first, then fans out to known peers as
//! a best-effort broadcast — unordered, unacknowledged, never retried.
//! Incoming mutations overwrite unconditionally: the winner for a key is
//! decided by arrival order at each observer, not by logical time. The
//! timestamp travels on every message for diagnostics only.
//!
//! The store outlives transport sessions. While no transport is attached
//! (before start, after stop) mutations simply stay local.

use crate::envelope::Envelope;
use crate::messages::{now_millis, DataAction, DataMessage};
use crate::peer::Peer;
use crate::registry::{CodecError, TypeRegistry};
use crate::transport::{Transport, TransportEvent};
use futures::future::join_all;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("Stored value for key {key:?} does not decode as the requested type: {source}")]
    Decode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// One stored value plus the metadata replicated alongside it.
#[derive(Debug, Clone)]
pub struct Record {
    pub value: Vec<u8>,
    pub type_name: String,
    pub timestamp: u64,
}

/// A session's transport plus the runtime it runs on. The handle is
/// captured at attach time so propagation can be spawned from threads
/// that don't belong to the runtime.
#[derive(Clone)]
struct Attachment {
    transport: Arc<Transport>,
    runtime: Handle,
}

/// Replicated mapping of unique keys to typed records.
///
/// Thread-safe; wrap in `Arc` and share between the event loop and local
/// callers.
pub struct SyncStore {
    registry: Arc<TypeRegistry>,
    data: RwLock<HashMap<String, Record>>,
    attachment: RwLock<Option<Attachment>>,
}

impl SyncStore {
    pub fn new(registry: Arc<TypeRegistry>) -> Self {
        Self {
            registry,
            data: RwLock::new(HashMap::new()),
            attachment: RwLock::new(None),
        }
    }

    /// Attach the transport mutations are broadcast through. Called by the
    /// coordinator when a session starts; must run inside the runtime,
    /// whose handle is kept so [`set`](Self::set) works from any thread.
    pub fn attach(&self, transport: Arc<Transport>) {
        let attachment = Attachment {
            transport,
            runtime: Handle::current(),
        };
        *self
            .attachment
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(attachment);
    }

    /// Drop the transport; later mutations stay local.
    pub fn detach(&self) {
        *self
            .attachment
            .write()
            .unwrap_or_else(|e| e.into_inner()) = None;
    }

    /// Whether a transport is currently attached.
    pub fn is_attached(&self) -> bool {
        self.attachment
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// Store `value` under `key`, or delete the key when `value` is `None`.
    ///
    /// The local mutation is immediate and unconditional; propagation to
    /// peers is spawned fire-and-forget so a stalled peer never blocks the
    /// caller. `T` must have been registered, or the set fails before
    /// touching anything.
    pub fn set<T>(&self, key: &str, value: Option<&T>) -> Result<()>
    where
        T: Serialize + 'static,
    {
        match value {
            Some(value) => {
                let (tag, bytes) = self.registry.encode(value)?;
                let record = Record {
                    value: bytes.clone(),
                    type_name: tag.clone(),
                    timestamp: now_millis(),
                };
                self.data
                    .write()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(key.to_string(), record);
                debug!("Set {} ({})", key, tag);
                self.broadcast(DataMessage::sync(key, tag, bytes));
            }
            None => {
                self.data
                    .write()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(key);
                debug!("Removed {}", key);
                self.broadcast(DataMessage::remove(key));
            }
        }
        Ok(())
    }

    /// Local read. `Ok(None)` when the key is absent; an error when the
    /// stored bytes don't decode as `T`.
    pub fn get<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: DeserializeOwned + 'static,
    {
        let data = self.data.read().unwrap_or_else(|e| e.into_inner());
        let Some(record) = data.get(key) else {
            return Ok(None);
        };
        let value = serde_json::from_slice(&record.value).map_err(|source| StoreError::Decode {
            key: key.to_string(),
            source,
        })?;
        Ok(Some(value))
    }

    /// Current local key set, sorted for stable output.
    pub fn list(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .data
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.data.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wipe the local mapping. Never broadcast; other peers keep their
    /// copies.
    pub fn clear(&self) {
        self.data.write().unwrap_or_else(|e| e.into_inner()).clear();
        debug!("Cleared local data");
    }

    /// Event pump: merges incoming messages and kicks off replay to
    /// joining peers, until cancelled or the transport side hangs up.
    /// Replay runs on its own task: a peer that hangs mid-connect must
    /// not stall merging or later replays.
    pub async fn run(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Store event loop shutting down");
                    break;
                }
                event = events.recv() => {
                    match event {
                        Some(TransportEvent::PeerAdded(peer)) => {
                            let store = Arc::clone(&self);
                            tokio::spawn(async move { store.replay_to(&peer).await });
                        }
                        Some(TransportEvent::MessageReceived(envelope)) => {
                            self.apply_envelope(&envelope)
                        }
                        None => break,
                    }
                }
            }
        }
    }

    /// Bring a newly joined peer up to date: one Sync per current key,
    /// all deliveries joined concurrently. Timestamps are fresh — they
    /// describe the replay, not the original mutation.
    pub async fn replay_to(&self, peer: &Peer) {
        let attachment = self
            .attachment
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let Some(Attachment { transport, .. }) = attachment else {
            return;
        };

        let messages: Vec<DataMessage> = {
            let data = self.data.read().unwrap_or_else(|e| e.into_inner());
            data.iter()
                .map(|(key, record)| {
                    DataMessage::sync(key.clone(), record.type_name.clone(), record.value.clone())
                })
                .collect()
        };
        if messages.is_empty() {
            return;
        }
        info!("Replaying {} keys to {}", messages.len(), peer);

        let mut envelopes = Vec::with_capacity(messages.len());
        for message in &messages {
            match Envelope::pack(DataMessage::TAG, message) {
                Ok(envelope) => envelopes.push(envelope),
                Err(e) => warn!("Failed to encode replay for {}: {}", message.key, e),
            }
        }
        join_all(
            envelopes
                .iter()
                .map(|envelope| transport.send_to(envelope, peer)),
        )
        .await;
    }

    /// Merge one incoming envelope. Anything but a data message is logged
    /// and ignored.
    pub fn apply_envelope(&self, envelope: &Envelope) {
        if envelope.tag != DataMessage::TAG {
            debug!("Ignoring {} message on the data channel", envelope.tag);
            return;
        }
        match envelope.unpack::<DataMessage>() {
            Ok(message) => self.apply(message),
            Err(e) => warn!("Dropping undecodable data message: {}", e),
        }
    }

    /// Merge one mutation.
    ///
    /// Remove is idempotent. Sync and Full overwrite unconditionally —
    /// arrival order decides the winner for a key. A message whose type
    /// name is unregistered, whose entries are missing, or whose payload
    /// fails the registry check is dropped whole.
    pub fn apply(&self, message: DataMessage) {
        match message.action {
            DataAction::Remove => {
                self.data
                    .write()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&message.key);
                debug!("Applied remove for {}", message.key);
            }
            DataAction::Sync | DataAction::Full => {
                let Some(type_name) = message.type_name else {
                    warn!("Dropping {}: no type name", message.key);
                    return;
                };
                let Some(value) = message.entries.into_iter().next() else {
                    warn!("Dropping {}: no entries", message.key);
                    return;
                };
                if let Err(e) = self.registry.check(&type_name, &value) {
                    warn!("Dropping {}: {}", message.key, e);
                    return;
                }
                let record = Record {
                    value,
                    type_name,
                    timestamp: message.timestamp,
                };
                self.data
                    .write()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(message.key.clone(), record);
                debug!("Applied sync for {}", message.key);
            }
        }
    }

    fn broadcast(&self, message: DataMessage) {
        let attachment = self
            .attachment
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let Some(Attachment { transport, runtime }) = attachment else {
            debug!("No transport attached; change to {} stays local", message.key);
            return;
        };
        // Spawn through the captured handle: the caller may be on a
        // plain thread
        runtime.spawn(async move {
            match Envelope::pack(DataMessage::TAG, &message) {
                Ok(envelope) => transport.send(&envelope).await,
                Err(e) => warn!("Failed to encode data message: {}", e),
            }
        });
    }
}
