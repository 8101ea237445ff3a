//! Lifecycle orchestration.
//!
//! The coordinator owns the long-lived pieces (peer id, store, config)
//! and runs everything else as a session: start binds the sockets and
//! spawns the background loops, stop cancels them. All event wiring
//! between components is channels created here, once, at composition
//! time.

use crate::config::NetSyncConfig;
use crate::discovery::Discovery;
use crate::peer::{Peer, PeerId};
use crate::registry::TypeRegistry;
use crate::store::SyncStore;
use crate::transport::Transport;
use futures::future::select_all;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Bounds for the randomized announce interval. Jitter keeps a LAN of
/// nodes started together from shouting in lockstep.
const ANNOUNCE_MIN_MS: u64 = 15_000;
const ANNOUNCE_MAX_MS: u64 = 30_000;

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    Transport(#[from] crate::transport::TransportError),
    #[error(transparent)]
    Discovery(#[from] crate::discovery::DiscoveryError),
}

pub type Result<T> = std::result::Result<T, CoordinatorError>;

/// Everything that lives exactly as long as one start/stop cycle.
struct Session {
    cancel: CancellationToken,
    transport: Arc<Transport>,
    tasks: Vec<JoinHandle<()>>,
}

/// Owns one node's lifecycle: start, stop, reset.
pub struct Coordinator {
    config: NetSyncConfig,
    peer_id: PeerId,
    store: Arc<SyncStore>,
    session: Mutex<Option<Session>>,
}

impl Coordinator {
    /// Build a node. The peer id is generated here, once per process
    /// lifetime — restarting the session keeps the identity.
    pub fn new(config: NetSyncConfig, registry: Arc<TypeRegistry>) -> Self {
        Self {
            config,
            peer_id: PeerId::generate(),
            store: Arc::new(SyncStore::new(registry)),
            session: Mutex::new(None),
        }
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// The replicated store. Usable whether or not the node is running;
    /// while stopped, mutations stay local.
    pub fn store(&self) -> &Arc<SyncStore> {
        &self.store
    }

    /// Bind the sockets and spawn the background loops.
    ///
    /// Already running is a logged no-op. A bind failure aborts the start
    /// and leaves the node stopped; there is no automatic retry.
    pub async fn start(&self) -> Result<()> {
        let mut session = self.session.lock().await;
        if session.is_some() {
            debug!("Start ignored: already running");
            return Ok(());
        }

        let cancel = CancellationToken::new();

        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let (transport, info) = match Transport::start(transport_tx).await {
            Ok(started) => started,
            Err(e) => {
                error!("Failed to start transport: {}", e);
                return Err(e.into());
            }
        };
        let transport = Arc::new(transport);

        let (found_tx, mut found_rx) = mpsc::unbounded_channel();
        let discovery = match Discovery::bind(&self.config, self.peer_id, found_tx).await {
            Ok(discovery) => Arc::new(discovery),
            Err(e) => {
                error!("Failed to start discovery: {}", e);
                return Err(e.into());
            }
        };
        // Publish before any task runs so the immediate first shout never
        // races the receive loop
        discovery.publish(info);

        self.store.attach(transport.clone());

        let mut tasks = Vec::new();

        // Data accept loop
        {
            let transport = transport.clone();
            let cancel = cancel.clone();
            tasks.push(tokio::spawn(async move { transport.run(cancel).await }));
        }

        // Discovery receive loop
        {
            let discovery = discovery.clone();
            let cancel = cancel.clone();
            tasks.push(tokio::spawn(
                async move { discovery.run(info, cancel).await },
            ));
        }

        // Periodic announcements, the first one right away so existing
        // nodes hear about us without waiting out the interval
        {
            let discovery = discovery.clone();
            let cancel = cancel.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    if let Err(e) = discovery.shout().await {
                        warn!("Announcement failed: {}", e);
                    }
                    let delay = Duration::from_millis(
                        rand::rng().random_range(ANNOUNCE_MIN_MS..ANNOUNCE_MAX_MS),
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = sleep(delay) => {}
                    }
                }
            }));
        }

        // Found peers into membership
        {
            let transport = transport.clone();
            let cancel = cancel.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        peer = found_rx.recv() => match peer {
                            Some(peer) => {
                                transport.update_client(peer);
                            }
                            None => break,
                        }
                    }
                }
            }));
        }

        // Store event loop
        {
            let store = self.store.clone();
            let cancel = cancel.clone();
            tasks.push(tokio::spawn(async move {
                store.run(transport_rx, cancel).await
            }));
        }

        info!("Node {} started", self.peer_id);
        *session = Some(Session {
            cancel,
            transport,
            tasks,
        });
        Ok(())
    }

    /// Cancel the session and wait for at least one loop to wind down;
    /// the rest observe the token on their own time. In-flight operations
    /// are never forcibly aborted, so a stalled delivery can't delay stop.
    ///
    /// The session lock is held through the whole teardown: a concurrent
    /// `start` waits and then builds its session against the detached
    /// store, never the other way around.
    pub async fn stop(&self) {
        let mut slot = self.session.lock().await;
        let Some(session) = slot.take() else {
            debug!("Stop ignored: not running");
            return;
        };
        session.cancel.cancel();
        if !session.tasks.is_empty() {
            let _ = select_all(session.tasks).await;
        }
        self.store.detach();
        info!("Node {} stopped", self.peer_id);
    }

    /// Wipe local state: the store mapping and, when running, the peer
    /// list. Nothing is broadcast; other nodes keep their copies.
    pub async fn reset(&self) {
        self.store.clear();
        if let Some(session) = self.session.lock().await.as_ref() {
            session.transport.clear_peers();
        }
        info!("Local state reset");
    }

    /// Current membership; empty while stopped.
    pub async fn peers(&self) -> Vec<Peer> {
        match self.session.lock().await.as_ref() {
            Some(session) => session.transport.peers(),
            None => Vec::new(),
        }
    }

    pub async fn is_running(&self) -> bool {
        self.session.lock().await.is_some()
    }
}
