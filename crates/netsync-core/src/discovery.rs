//! UDP broadcast peer discovery.
//!
//! Nodes shout their reachable address on a well-known port; every
//! listener that isn't the shouter records the peer and broadcasts a
//! response so the shouter learns about it too. Responses are never
//! answered, which bounds the handshake to two hops. Anyone on the
//! broadcast domain can announce — there is no authentication here.

use crate::config::NetSyncConfig;
use crate::envelope::{Envelope, EnvelopeError};
use crate::messages::{Ping, Response, Shout};
use crate::peer::{Peer, PeerId};
use crate::transport::ReachableInfo;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::OnceLock;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Largest payload a UDP datagram can carry; received datagrams never
/// exceed it.
const MAX_DATAGRAM_BYTES: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("Failed to bind discovery socket: {0}")]
    Bind(#[source] io::Error),
    #[error("Failed to send announcement: {0}")]
    Send(#[source] io::Error),
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
}

pub type Result<T> = std::result::Result<T, DiscoveryError>;

/// Broadcast announcer and listener.
///
/// Found peers are pushed on the channel handed to [`Discovery::bind`];
/// the coordinator pumps them into the transport's membership.
pub struct Discovery {
    peer_id: PeerId,
    announce_addr: SocketAddr,
    socket: UdpSocket,
    info: OnceLock<ReachableInfo>,
    found: mpsc::UnboundedSender<Peer>,
}

impl Discovery {
    /// Bind the shared discovery port.
    ///
    /// The socket takes `SO_REUSEADDR` and `SO_BROADCAST` so several
    /// processes on one host can bind the same port and all hear the same
    /// broadcasts. Bind failure is fatal to startup.
    pub async fn bind(
        config: &NetSyncConfig,
        peer_id: PeerId,
        found: mpsc::UnboundedSender<Peer>,
    ) -> Result<Self> {
        let socket = bind_broadcast_socket(config.discovery_port).map_err(DiscoveryError::Bind)?;
        let socket = UdpSocket::from_std(socket).map_err(DiscoveryError::Bind)?;
        info!("Discovery listening on UDP port {}", config.discovery_port);

        Ok(Self {
            peer_id,
            announce_addr: config.announce_addr,
            socket,
            info: OnceLock::new(),
            found,
        })
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Publish the dialable address announcements carry. The first
    /// publication wins; later calls are no-ops. Until this happens,
    /// [`shout`] has nothing to announce and skips.
    ///
    /// [`shout`]: Self::shout
    pub fn publish(&self, info: ReachableInfo) {
        let _ = self.info.set(info);
    }

    /// Receive loop. Publishes the reachable address for [`shout`] and then
    /// decodes datagrams until cancelled. Receive and decode failures drop
    /// the datagram, never the loop.
    ///
    /// [`shout`]: Self::shout
    pub async fn run(&self, info: ReachableInfo, cancel: CancellationToken) {
        self.publish(info);
        info!("I am {}", self.peer_id);

        let mut buf = vec![0u8; MAX_DATAGRAM_BYTES];
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Discovery loop shutting down");
                    break;
                }
                received = self.socket.recv_from(&mut buf) => {
                    match received {
                        Ok((len, from)) => self.handle_datagram(&buf[..len], from).await,
                        Err(e) => warn!("Discovery receive failed: {}", e),
                    }
                }
            }
        }
    }

    /// Broadcast our announcement. A logged no-op until [`run`] has
    /// published the reachable address.
    ///
    /// [`run`]: Self::run
    pub async fn shout(&self) -> Result<()> {
        let Some(info) = self.info.get() else {
            debug!("Skipping shout: reachable address not known yet");
            return Ok(());
        };
        let envelope = Envelope::pack(Shout::TAG, &Shout::new(self.peer_id, info.addr))?;
        self.send(&envelope).await
    }

    async fn handle_datagram(&self, data: &[u8], from: SocketAddr) {
        let envelope = match Envelope::from_bytes(data) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!("Undecodable datagram from {}: {}", from, e);
                return;
            }
        };
        match envelope.tag.as_str() {
            Shout::TAG => match envelope.unpack::<Shout>() {
                Ok(shout) => self.handle_shout(shout).await,
                Err(e) => debug!("Bad shout from {}: {}", from, e),
            },
            Response::TAG => match envelope.unpack::<Response>() {
                Ok(response) => self.handle_response(response),
                Err(e) => debug!("Bad response from {}: {}", from, e),
            },
            Ping::TAG => debug!("Ping from {}", from),
            other => debug!("Ignoring {} datagram from {}", other, from),
        }
    }

    async fn handle_shout(&self, shout: Shout) {
        // Broadcasts loop back to their sender; drop our own
        if shout.peer_id == self.peer_id {
            return;
        }
        debug!("Shout from {}", shout.peer());
        let _ = self.found.send(shout.peer());
        // Answer so the shouter learns about this node even though it
        // announced first
        self.respond().await;
    }

    fn handle_response(&self, response: Response) {
        if response.peer_id == self.peer_id {
            return;
        }
        debug!("Response from {}", response.peer());
        let _ = self.found.send(response.peer());
        // Responses are never answered
    }

    async fn respond(&self) {
        let Some(info) = self.info.get() else {
            return;
        };
        let envelope = match Envelope::pack(Response::TAG, &Response::new(self.peer_id, info.addr))
        {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Failed to encode response: {}", e);
                return;
            }
        };
        if let Err(e) = self.send(&envelope).await {
            warn!("Failed to answer shout: {}", e);
        }
    }

    async fn send(&self, envelope: &Envelope) -> Result<()> {
        self.socket
            .send_to(&envelope.to_bytes(), self.announce_addr)
            .await
            .map_err(DiscoveryError::Send)?;
        Ok(())
    }
}

/// Plain tokio/std bind can't set both reuse-address and broadcast before
/// binding, so the socket is built through socket2 and handed to tokio.
fn bind_broadcast_socket(port: u16) -> io::Result<std::net::UdpSocket> {
    use socket2::{Domain, Protocol, Socket, Type};

    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_broadcast(true)?;
    socket.set_nonblocking(true)?;
    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
    socket.bind(&addr.into())?;
    Ok(socket.into())
}
