//! Teardown paths: stop, explicit disconnect, runners that ignore closure,
//! and unsubscribing.

use std::time::{Duration, Instant};

use strand_node::{NodeId, NodeIdentity, PeerEventKind, ServerError};
use tokio::sync::mpsc;

use crate::harness::{idle_protocol, stubborn_protocol, TestNodeBuilder};

#[tokio::test]
async fn test_stop_drops_peers() {
    let mut a = TestNodeBuilder::new("a").protocol(idle_protocol("chat")).build().unwrap();
    let mut b = TestNodeBuilder::new("b").protocol(idle_protocol("chat")).build().unwrap();

    a.connect(&b);
    a.events.wait_for(PeerEventKind::Add, b.id()).await.unwrap();
    b.events.wait_for(PeerEventKind::Add, a.id()).await.unwrap();

    a.stop().await;
    assert!(!a.server.is_running());
    assert!(a.server.peers().await.is_empty());
    assert!(matches!(a.server.add_peer(b.identity), Err(ServerError::Stopped)));

    // the local Drop is published before the bus closes
    let local = a.events.wait_for(PeerEventKind::Drop, b.id()).await.unwrap();
    assert_eq!(local.error.as_deref(), Some("disconnect requested"));

    // an orderly close reaches the idle runner as end of stream
    b.events.wait_for(PeerEventKind::Drop, a.id()).await.unwrap();
    assert_eq!(b.events.sequence(a.id()), vec![PeerEventKind::Add, PeerEventKind::Drop]);
    b.wait_peers(0).await.unwrap();

    // stopping twice is harmless
    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn test_disconnect_peer() {
    let mut a = TestNodeBuilder::new("a").protocol(idle_protocol("chat")).build().unwrap();
    let mut b = TestNodeBuilder::new("b").protocol(idle_protocol("chat")).build().unwrap();

    a.connect(&b);
    a.wait_peers(1).await.unwrap();

    assert!(a.server.disconnect_peer(&b.id()).await);
    let dropped = a.events.wait_for(PeerEventKind::Drop, b.id()).await.unwrap();
    assert_eq!(dropped.error.as_deref(), Some("disconnect requested"));
    b.events.wait_for(PeerEventKind::Drop, a.id()).await.unwrap();

    a.wait_peers(0).await.unwrap();
    b.wait_peers(0).await.unwrap();
    assert!(!a.server.disconnect_peer(&b.id()).await);
    assert!(a.server.is_running());

    a.stop().await;
    b.stop().await;
}

/// Runners that never look at their stream are aborted after the grace
/// period instead of holding the peer open.
#[tokio::test]
async fn test_stubborn_runner_aborted() {
    let grace = Duration::from_millis(200);
    let mut a = TestNodeBuilder::new("a").protocol(stubborn_protocol()).grace(grace).build().unwrap();
    let mut b = TestNodeBuilder::new("b").protocol(stubborn_protocol()).grace(grace).build().unwrap();

    a.connect(&b);
    a.wait_peers(1).await.unwrap();
    b.wait_peers(1).await.unwrap();

    let started = Instant::now();
    assert!(a.server.disconnect_peer(&b.id()).await);
    a.events.wait_for(PeerEventKind::Drop, b.id()).await.unwrap();
    b.events.wait_for(PeerEventKind::Drop, a.id()).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(3), "took {:?}", started.elapsed());

    let stopping = Instant::now();
    a.stop().await;
    b.stop().await;
    assert!(stopping.elapsed() < Duration::from_secs(3));
}

#[tokio::test]
async fn test_unsubscribed_sink_receives_nothing() {
    let a = TestNodeBuilder::new("a").protocol(idle_protocol("chat")).build().unwrap();
    let b = TestNodeBuilder::new("b").protocol(idle_protocol("chat")).build().unwrap();

    let (tx, mut rx) = mpsc::channel(16);
    let sub = a.server.subscribe_events(tx);
    assert!(sub.is_active());
    sub.unsubscribe();
    sub.unsubscribe();
    assert!(!sub.is_active());

    a.connect(&b);
    a.wait_peers(1).await.unwrap();
    a.stop().await;
    b.stop().await;

    // the sender was dropped on unsubscribe, so the channel just ends
    assert!(rx.recv().await.is_none());
}

/// A dial towards a silent address must not hold up stop.
#[tokio::test]
async fn test_stop_interrupts_pending_dial() {
    let a = TestNodeBuilder::new("a").protocol(idle_protocol("chat")).build().unwrap();

    // bound but never read, so the QUIC handshake gets no answer
    let silent = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    let target = NodeIdentity::new(NodeId::from_bytes([7; 32]), silent.local_addr().unwrap());
    a.server.add_peer(target).unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let started = Instant::now();
    a.stop().await;
    assert!(started.elapsed() < Duration::from_secs(3), "took {:?}", started.elapsed());
    assert!(a.server.peers().await.is_empty());
}

#[tokio::test]
async fn test_subscription_dropped_with_server_stop() {
    let a = TestNodeBuilder::new("a").build().unwrap();
    assert!(a.subscription.is_active());
    a.stop().await;

    let (tx, mut rx) = mpsc::channel(1);
    let late = a.server.subscribe_events(tx);
    assert!(!late.is_active());
    assert!(rx.recv().await.is_none());
}
