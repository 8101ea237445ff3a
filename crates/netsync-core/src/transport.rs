//! TCP transport: point-to-point envelope delivery and membership.
//!
//! Each node listens on an ephemeral port advertised through discovery.
//! A connection carries exactly one envelope — the sender writes it and
//! shuts the stream down, the receiver reads to end-of-stream. There is
//! no acknowledgement and no retry; membership self-heals instead, by
//! evicting peers whose endpoints are gone.

use crate::envelope::{Envelope, EnvelopeError};
use crate::peer::{Peer, PeerList};
use futures::future::join_all;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Upper bound on a single inbound message. Connections streaming more
/// than this are dropped undecoded.
const MAX_ENVELOPE_BYTES: usize = 4 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Failed to bind listener: {0}")]
    Bind(#[source] io::Error),
    #[error("Failed to read message: {0}")]
    Read(#[from] io::Error),
    #[error("Message too large ({0} bytes)")]
    TooLarge(usize),
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// The endpoint other hosts should dial, as resolved at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReachableInfo {
    pub addr: SocketAddr,
}

/// Event emitted by the transport to whoever owns the event channel.
#[derive(Debug)]
pub enum TransportEvent {
    /// A previously unknown endpoint joined the peer list.
    PeerAdded(Peer),
    /// One complete envelope arrived on the data channel.
    MessageReceived(Envelope),
}

/// TCP listener plus the peer list it delivers to.
///
/// Wrap in `Arc`; `run` and `send` borrow freely from concurrent tasks.
pub struct Transport {
    listener: TcpListener,
    info: ReachableInfo,
    peers: PeerList,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl Transport {
    /// Bind the data listener on an ephemeral port and resolve the address
    /// other hosts should dial.
    ///
    /// Bind failure is fatal to startup; everything after this point
    /// degrades instead of failing.
    pub async fn start(
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<(Self, ReachableInfo)> {
        let listener = TcpListener::bind("0.0.0.0:0")
            .await
            .map_err(TransportError::Bind)?;
        let port = listener.local_addr().map_err(TransportError::Bind)?.port();
        let info = ReachableInfo {
            addr: SocketAddr::new(reachable_ip().await, port),
        };
        info!("Data listener on port {} (reachable at {})", port, info.addr);

        Ok((
            Self {
                listener,
                info,
                peers: PeerList::new(),
                events,
            },
            info,
        ))
    }

    /// The address announced to other hosts.
    pub fn reachable_info(&self) -> ReachableInfo {
        self.info
    }

    /// Accept loop. One spawned task per connection; a bad message drops
    /// only its own connection, never the loop.
    pub async fn run(&self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Data listener shutting down");
                    break;
                }
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            let events = self.events.clone();
                            tokio::spawn(async move {
                                match read_envelope(stream).await {
                                    Ok(envelope) => {
                                        debug!("Received {} message from {}", envelope.tag, addr);
                                        let _ = events.send(TransportEvent::MessageReceived(envelope));
                                    }
                                    Err(e) => {
                                        warn!("Dropping connection from {}: {}", addr, e);
                                    }
                                }
                            });
                        }
                        Err(e) => {
                            warn!("Failed to accept connection: {}", e);
                        }
                    }
                }
            }
        }
    }

    /// Deliver one envelope to every known peer, all branches in parallel.
    ///
    /// Completes once every branch has succeeded or failed independently;
    /// one peer's failure never blocks delivery to the others. Failures are
    /// absorbed here — classified ones evict the peer, the rest are logged.
    pub async fn send(&self, envelope: &Envelope) {
        let peers = self.peers.snapshot();
        if peers.is_empty() {
            debug!("No peers to send {} message to", envelope.tag);
            return;
        }
        let bytes = envelope.to_bytes();
        join_all(peers.iter().map(|peer| self.deliver(peer, &bytes))).await;
    }

    /// Deliver one envelope to one peer, with the same failure handling as
    /// [`send`](Self::send).
    pub async fn send_to(&self, envelope: &Envelope, peer: &Peer) {
        let bytes = envelope.to_bytes();
        self.deliver(peer, &bytes).await;
    }

    async fn deliver(&self, peer: &Peer, bytes: &[u8]) {
        match deliver_once(peer.addr, bytes).await {
            Ok(()) => debug!("Delivered {} bytes to {}", bytes.len(), peer),
            Err(e) if is_eviction_error(&e) => {
                // remove() resolves racing branches: only the one that wins
                // the removal logs the eviction.
                if self.peers.remove(&peer.addr).is_some() {
                    info!("Evicting unreachable peer {}: {}", peer, e);
                }
            }
            Err(e) => {
                warn!("Failed to deliver to {}: {}", peer, e);
            }
        }
    }

    /// Add-if-absent membership update keyed by endpoint. Emits
    /// `PeerAdded` exactly once per new endpoint; repeated announcements
    /// are ignored.
    pub fn update_client(&self, peer: Peer) -> bool {
        if self.peers.add(peer.clone()) {
            info!("Peer joined: {}", peer);
            let _ = self.events.send(TransportEvent::PeerAdded(peer));
            true
        } else {
            false
        }
    }

    /// Snapshot of current membership.
    pub fn peers(&self) -> Vec<Peer> {
        self.peers.snapshot()
    }

    pub fn clear_peers(&self) {
        self.peers.clear();
    }
}

/// One shot delivery: connect, write, shut down.
async fn deliver_once(addr: SocketAddr, bytes: &[u8]) -> io::Result<()> {
    let mut stream = TcpStream::connect(addr).await?;
    stream.write_all(bytes).await?;
    stream.shutdown().await?;
    Ok(())
}

/// Read one envelope: everything until the sender closes its end.
async fn read_envelope(stream: TcpStream) -> Result<Envelope> {
    let mut buf = Vec::new();
    let mut limited = stream.take(MAX_ENVELOPE_BYTES as u64 + 1);
    limited.read_to_end(&mut buf).await?;
    if buf.len() > MAX_ENVELOPE_BYTES {
        return Err(TransportError::TooLarge(buf.len()));
    }
    Ok(Envelope::from_bytes(&buf)?)
}

/// Errors that mean the endpoint is gone, not merely busy.
fn is_eviction_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::HostUnreachable
            | io::ErrorKind::NetworkUnreachable
            | io::ErrorKind::TimedOut
    )
}

/// Address of the interface the OS routes outbound traffic through.
///
/// Connecting a UDP socket sends nothing; it only makes the OS commit to
/// an outbound interface we can read back. Falls back to loopback on
/// isolated hosts with no route.
async fn reachable_ip() -> IpAddr {
    async fn probe() -> io::Result<IpAddr> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect("8.8.8.8:80").await?;
        Ok(socket.local_addr()?.ip())
    }
    match probe().await {
        Ok(ip) => ip,
        Err(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
    }
}
