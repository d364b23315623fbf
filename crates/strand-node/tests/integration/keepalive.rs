//! The `ping/1` keep-alive protocol between live nodes.

use std::time::Duration;

use strand_node::ping::{self, PingConfig};
use strand_node::{PeerEventKind, Protocol, ProtocolStream};

use crate::harness::TestNodeBuilder;

fn fast_ping() -> Protocol {
    ping::protocol(PingConfig {
        interval: Duration::from_millis(100),
        miss_limit: 2,
    })
}

/// Speaks `ping/1` but never answers.
fn deaf_ping() -> Protocol {
    Protocol::new(ping::NAME, ping::VERSION, ping::LENGTH, |_peer, mut stream: ProtocolStream| async move {
        while stream.read_msg().await.is_ok() {}
        Ok(())
    })
}

/// Answered pings keep the connection up well past the miss limit.
#[tokio::test]
async fn test_answered_pings_keep_peer() {
    let mut a = TestNodeBuilder::new("a").protocol(fast_ping()).build().unwrap();
    let b = TestNodeBuilder::new("b").protocol(fast_ping()).build().unwrap();

    a.connect(&b);
    a.wait_peers(1).await.unwrap();
    b.wait_peers(1).await.unwrap();
    tokio::time::sleep(Duration::from_millis(800)).await;

    assert!(a.has_peer(b.id()).await);
    assert!(b.has_peer(a.id()).await);

    let events = a.events.drain();
    assert!(!events.iter().any(|e| e.kind == PeerEventKind::Drop));
    let pong = events
        .iter()
        .find(|e| e.kind == PeerEventKind::MsgRecv && e.msg_code == Some(1))
        .expect("a pong arrived");
    assert_eq!(pong.protocol.as_deref(), Some("ping/1"));

    a.stop().await;
    b.stop().await;
}

/// A peer that never answers is declared dead after miss_limit pings.
#[tokio::test]
async fn test_unanswered_pings_drop_peer() {
    let mut a = TestNodeBuilder::new("a").protocol(fast_ping()).build().unwrap();
    let mut b = TestNodeBuilder::new("b").protocol(deaf_ping()).build().unwrap();

    a.connect(&b);
    let dropped = a.events.wait_for(PeerEventKind::Drop, b.id()).await.unwrap();
    let error = dropped.error.unwrap();
    assert!(error.contains("ping/1"), "{error}");
    assert!(error.contains("2 pings unanswered"), "{error}");

    // b only ever saw pings
    b.events.wait_for(PeerEventKind::Drop, a.id()).await.unwrap();
    let received: Vec<_> = b
        .events
        .drain()
        .iter()
        .filter(|e| e.kind == PeerEventKind::MsgRecv)
        .map(|e| e.msg_code)
        .collect();
    assert!(!received.is_empty());
    assert!(received.iter().all(|code| *code == Some(0)), "{received:?}");

    a.wait_peers(0).await.unwrap();
    a.stop().await;
    b.stop().await;
}
