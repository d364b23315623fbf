//! Dialing, admission and rejection.

use std::time::Duration;

use strand_node::{PeerEventKind, ServerError};

use crate::harness::{echo_protocol, idle_protocol, TestNodeBuilder};

/// Long enough for a refused handshake to have fully played out.
const SETTLE: Duration = Duration::from_millis(1500);

/// add_peer leaves both sides holding each other.
#[tokio::test]
async fn test_mutual_membership() {
    let mut a = TestNodeBuilder::new("a").protocol(idle_protocol("chat")).build().unwrap();
    let mut b = TestNodeBuilder::new("b").protocol(idle_protocol("chat")).build().unwrap();

    a.connect(&b);
    a.wait_peers(1).await.unwrap();
    b.wait_peers(1).await.unwrap();
    assert!(a.has_peer(b.id()).await);
    assert!(b.has_peer(a.id()).await);

    a.events.wait_for(PeerEventKind::Add, b.id()).await.unwrap();
    b.events.wait_for(PeerEventKind::Add, a.id()).await.unwrap();

    // the listener learns the dialer's listen port from the handshake
    let seen = b.server.peers().await;
    assert_eq!(seen[0].port, a.identity.port);
    assert!(seen[0].is_dialable());

    let infos = a.server.peer_infos().await;
    assert_eq!(infos.len(), 1);
    assert!(!infos[0].inbound);
    assert_eq!(infos[0].name, "b");
    assert_eq!(infos[0].caps, vec!["chat/1".to_string()]);

    a.stop().await;
    b.stop().await;
}

/// Both nodes dial each other at once. Each end keeps the connection
/// dialed by the lower node id, so exactly one survives.
#[tokio::test]
async fn test_crossed_dials_converge() {
    for _ in 0..3 {
        let mut a = TestNodeBuilder::new("a").protocol(idle_protocol("chat")).build().unwrap();
        let mut b = TestNodeBuilder::new("b").protocol(idle_protocol("chat")).build().unwrap();

        a.connect(&b);
        b.connect(&a);
        a.wait_peers(1).await.unwrap();
        b.wait_peers(1).await.unwrap();
        tokio::time::sleep(SETTLE).await;

        assert_eq!(a.server.peer_count().await, 1);
        assert_eq!(b.server.peer_count().await, 1);
        assert!(a.has_peer(b.id()).await);
        assert!(b.has_peer(a.id()).await);

        let a_info = a.server.peer_infos().await;
        let b_info = b.server.peer_infos().await;
        assert_eq!(a_info[0].inbound, b.id() < a.id());
        assert_eq!(b_info[0].inbound, a.id() < b.id());

        let (a_id, b_id) = (a.id(), b.id());
        for (node, remote) in [(&mut a, b_id), (&mut b, a_id)] {
            let seq = node.events.sequence(remote);
            assert_eq!(seq.last(), Some(&PeerEventKind::Add), "{seq:?}");
            let adds = seq.iter().filter(|k| **k == PeerEventKind::Add).count();
            let drops = seq.iter().filter(|k| **k == PeerEventKind::Drop).count();
            assert_eq!(adds, drops + 1, "{seq:?}");
        }

        a.stop().await;
        b.stop().await;
    }
}

/// Dialing our own identity never produces a self entry or any event.
#[tokio::test]
async fn test_self_connect_rejected() {
    let mut a = TestNodeBuilder::new("a").protocol(idle_protocol("chat")).build().unwrap();

    a.server.add_peer(a.identity).unwrap();
    tokio::time::sleep(SETTLE).await;

    assert!(a.server.peers().await.is_empty());
    assert!(a.events.drain().is_empty());
    a.stop().await;
}

/// max_peers = 0 admits nobody, and neither side publishes anything.
#[tokio::test]
async fn test_zero_max_peers_rejects() {
    let mut a = TestNodeBuilder::new("a").protocol(idle_protocol("chat")).build().unwrap();
    let mut b = TestNodeBuilder::new("b")
        .protocol(idle_protocol("chat"))
        .max_peers(0)
        .build()
        .unwrap();

    a.connect(&b);
    tokio::time::sleep(SETTLE).await;

    assert!(a.server.peers().await.is_empty());
    assert!(b.server.peers().await.is_empty());
    assert!(a.events.drain().is_empty());
    assert!(b.events.drain().is_empty());

    a.stop().await;
    b.stop().await;
}

/// A full node refuses the second dialer.
#[tokio::test]
async fn test_capacity_enforced() {
    let a = TestNodeBuilder::new("a").protocol(idle_protocol("chat")).build().unwrap();
    let b = TestNodeBuilder::new("b")
        .protocol(idle_protocol("chat"))
        .max_peers(1)
        .build()
        .unwrap();
    let c = TestNodeBuilder::new("c").protocol(idle_protocol("chat")).build().unwrap();

    a.connect(&b);
    c.connect(&b);
    b.wait_peers(1).await.unwrap();
    tokio::time::sleep(SETTLE).await;

    assert_eq!(b.server.peer_count().await, 1);
    let connected = a.server.peer_count().await + c.server.peer_count().await;
    assert_eq!(connected, 1);

    for n in [&a, &b, &c] {
        n.stop().await;
    }
}

/// Nodes with no protocol in common do not stay connected.
#[tokio::test]
async fn test_no_shared_protocol_rejected() {
    let mut a = TestNodeBuilder::new("a").protocol(echo_protocol()).build().unwrap();
    let mut b = TestNodeBuilder::new("b").protocol(idle_protocol("chat")).build().unwrap();

    a.connect(&b);
    tokio::time::sleep(SETTLE).await;

    assert!(a.server.peers().await.is_empty());
    assert!(b.server.peers().await.is_empty());
    assert!(a.events.drain().is_empty());
    assert!(b.events.drain().is_empty());

    a.stop().await;
    b.stop().await;
}

/// Asking twice for the same peer yields one connection and one Add.
#[tokio::test]
async fn test_repeated_add_peer_single_connection() {
    let mut a = TestNodeBuilder::new("a").protocol(idle_protocol("chat")).build().unwrap();
    let b = TestNodeBuilder::new("b").protocol(idle_protocol("chat")).build().unwrap();

    a.connect(&b);
    a.wait_peers(1).await.unwrap();
    a.connect(&b);
    tokio::time::sleep(SETTLE).await;

    assert_eq!(a.server.peer_count().await, 1);
    assert_eq!(a.events.sequence(b.id()), vec![PeerEventKind::Add]);

    a.stop().await;
    b.stop().await;
}

/// An outbound-only node can dial out but is not dialable itself.
#[tokio::test]
async fn test_outbound_only_node() {
    let o = TestNodeBuilder::new("o")
        .protocol(idle_protocol("chat"))
        .outbound_only()
        .build()
        .unwrap();
    let l = TestNodeBuilder::new("l").protocol(idle_protocol("chat")).build().unwrap();

    o.connect(&l);
    l.wait_peers(1).await.unwrap();

    let seen = l.server.peers().await;
    assert_eq!(seen[0].id, o.id());
    assert_eq!(seen[0].port, 0);
    assert!(matches!(l.server.add_peer(seen[0]), Err(ServerError::Unreachable(_))));

    o.stop().await;
    l.stop().await;
}
