//! Discovery handshake tests over real loopback UDP, plus full-node
//! end-to-end tests through the coordinator.
//!
//! Limited broadcast does not reliably loop back in sandboxed test
//! environments, so each node announces by unicast straight at the other
//! node's discovery port. The receive path does not care how a datagram
//! arrived.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use netsync_core::{
    Coordinator, Discovery, NetSyncConfig, Peer, PeerId, ReachableInfo, TypeRegistry,
};
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Message {
    text: String,
}

fn message(text: &str) -> Message {
    Message { text: text.into() }
}

fn registry() -> Arc<TypeRegistry> {
    let mut registry = TypeRegistry::new();
    registry.register::<Message>("message");
    Arc::new(registry)
}

/// Two distinct free UDP ports, held simultaneously so they can't collide.
async fn free_udp_ports() -> (u16, u16) {
    let first = UdpSocket::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind probe socket");
    let second = UdpSocket::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind probe socket");
    (
        first.local_addr().expect("Failed to read probe addr").port(),
        second.local_addr().expect("Failed to read probe addr").port(),
    )
}

/// Listen on `port`, announce at `announce_port` on loopback.
fn cross_config(port: u16, announce_port: u16) -> NetSyncConfig {
    let mut config = NetSyncConfig::with_port(port);
    config.announce_addr = format!("127.0.0.1:{announce_port}")
        .parse()
        .expect("Failed to parse announce address");
    config
}

/// Poll an async condition until it holds or fail the test.
async fn wait_until<F, Fut>(what: &str, check: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    timeout(Duration::from_secs(5), async {
        while !check().await {
            sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("Timed out waiting for {what}"));
}

// ============================================================================
// Handshake
// ============================================================================

/// A bound discovery socket with its receive loop running.
struct TestDiscovery {
    discovery: Arc<Discovery>,
    found: mpsc::UnboundedReceiver<Peer>,
    info: ReachableInfo,
}

async fn start_discovery(port: u16, announce_port: u16, data_port: u16) -> TestDiscovery {
    let (tx, rx) = mpsc::unbounded_channel();
    let discovery = Arc::new(
        Discovery::bind(&cross_config(port, announce_port), PeerId::generate(), tx)
            .await
            .expect("Failed to bind discovery"),
    );
    let info = ReachableInfo {
        addr: format!("127.0.0.1:{data_port}")
            .parse()
            .expect("Failed to parse data address"),
    };
    discovery.publish(info);
    {
        let discovery = discovery.clone();
        tokio::spawn(async move { discovery.run(info, CancellationToken::new()).await });
    }
    TestDiscovery {
        discovery,
        found: rx,
        info,
    }
}

#[tokio::test]
async fn test_one_shout_completes_a_two_hop_handshake() {
    let (port_a, port_b) = free_udp_ports().await;
    let mut a = start_discovery(port_a, port_b, 4100).await;
    let mut b = start_discovery(port_b, port_a, 4200).await;

    a.discovery.shout().await.expect("Failed to shout");

    // B hears the shout...
    let found_by_b = timeout(Duration::from_secs(2), b.found.recv())
        .await
        .expect("B never heard the shout")
        .expect("B's found channel closed");
    assert_eq!(found_by_b.addr, a.info.addr);

    // ...and its response teaches A about B
    let found_by_a = timeout(Duration::from_secs(2), a.found.recv())
        .await
        .expect("A never heard the response")
        .expect("A's found channel closed");
    assert_eq!(found_by_a.addr, b.info.addr);

    // The response itself is never answered: one shout, one response, done
    sleep(Duration::from_millis(200)).await;
    assert!(a.found.try_recv().is_err());
    assert!(b.found.try_recv().is_err());
}

#[tokio::test]
async fn test_own_announcements_are_filtered_end_to_end() {
    let (port, _) = free_udp_ports().await;
    // Announce straight at our own discovery port
    let mut a = start_discovery(port, port, 4100).await;

    a.discovery.shout().await.expect("Failed to shout");

    sleep(Duration::from_millis(300)).await;
    assert!(a.found.try_recv().is_err());
}

// ============================================================================
// Full node end-to-end
// ============================================================================

#[tokio::test]
async fn test_nodes_discover_each_other_and_converge() {
    let (port_a, port_b) = free_udp_ports().await;
    let a = Coordinator::new(cross_config(port_a, port_b), registry());
    let b = Coordinator::new(cross_config(port_b, port_a), registry());

    a.start().await.expect("Failed to start node A");
    a.store()
        .set("hello", Some(&message("World!")))
        .expect("Failed to set");

    // B joins later; its first announcement is immediate, so A learns
    // about it right away and replays existing state
    b.start().await.expect("Failed to start node B");

    wait_until("B to converge", || async {
        b.store().get::<Message>("hello").ok().flatten() == Some(message("World!"))
    })
    .await;
    wait_until("mutual discovery", || async {
        a.peers().await.len() == 1 && b.peers().await.len() == 1
    })
    .await;

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn test_restarted_node_is_rediscovered_and_caught_up() {
    let (port_a, port_b) = free_udp_ports().await;
    let a = Coordinator::new(cross_config(port_a, port_b), registry());
    let b = Coordinator::new(cross_config(port_b, port_a), registry());

    a.start().await.expect("Failed to start node A");
    b.start().await.expect("Failed to start node B");
    wait_until("mutual discovery", || async {
        a.peers().await.len() == 1 && b.peers().await.len() == 1
    })
    .await;

    b.stop().await;
    // Stop waits for the first loop to wind down, not all of them; give
    // B's listener a beat to actually close
    sleep(Duration::from_millis(100)).await;

    // B's endpoint is gone; the next broadcast evicts it
    a.store()
        .set("after", Some(&message("the restart")))
        .expect("Failed to set");
    wait_until("A to evict the stopped node", || async {
        a.peers().await.is_empty()
    })
    .await;

    // On restart B announces again, gets rediscovered under its new
    // endpoint, and is brought up to date by replay
    b.start().await.expect("Failed to restart node B");
    wait_until("B to be caught up", || async {
        b.store().get::<Message>("after").ok().flatten() == Some(message("the restart"))
    })
    .await;
    wait_until("A to relearn B", || async { a.peers().await.len() == 1 }).await;

    a.stop().await;
    b.stop().await;
}
