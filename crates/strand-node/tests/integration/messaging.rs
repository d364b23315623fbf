//! Protocol traffic and the events it produces.

use serde::{Deserialize, Serialize};
use strand_node::{PeerEventKind, PeerHandle, Protocol, ProtocolError, ProtocolStream};
use tokio::sync::mpsc;

use crate::harness::{echo_protocol, failing_protocol, idle_protocol, TestNodeBuilder};

use PeerEventKind::{Add, Drop, MsgRecv, MsgSend};

/// One round trip: each side sees one send, one receive and a clean drop.
#[tokio::test]
async fn test_echo_event_sequences() {
    let mut a = TestNodeBuilder::new("a").protocol(echo_protocol()).build().unwrap();
    let mut b = TestNodeBuilder::new("b").protocol(echo_protocol()).build().unwrap();

    a.connect(&b);
    let a_drop = a.events.wait_for(Drop, b.id()).await.unwrap();
    let b_drop = b.events.wait_for(Drop, a.id()).await.unwrap();
    assert_eq!(a_drop.error, None);
    assert_eq!(b_drop.error, None);

    assert_eq!(a.events.sequence(b.id()), vec![Add, MsgSend, MsgRecv, Drop]);
    assert_eq!(b.events.sequence(a.id()), vec![Add, MsgRecv, MsgSend, Drop]);

    let sent = a.events.drain().iter().find(|e| e.kind == MsgSend).cloned().unwrap();
    assert_eq!(sent.protocol.as_deref(), Some("echo/1"));
    assert_eq!(sent.msg_code, Some(0));
    assert_eq!(sent.msg_size, Some(5));

    a.wait_peers(0).await.unwrap();
    b.wait_peers(0).await.unwrap();
    a.stop().await;
    b.stop().await;
}

/// With message events off only Add and Drop are published.
#[tokio::test]
async fn test_msg_events_disabled() {
    let mut a = TestNodeBuilder::new("a")
        .protocol(echo_protocol())
        .msg_events(false)
        .build()
        .unwrap();
    let b = TestNodeBuilder::new("b").protocol(echo_protocol()).build().unwrap();

    a.connect(&b);
    a.events.wait_for(Drop, b.id()).await.unwrap();
    assert_eq!(a.events.sequence(b.id()), vec![Add, Drop]);

    a.stop().await;
    b.stop().await;
}

/// Protocols on one connection get disjoint code ranges.
#[tokio::test]
async fn test_protocols_share_connection() {
    // "aaa" sorts first and takes codes 0..4, echo gets code 4
    let mut a = TestNodeBuilder::new("a")
        .protocol(echo_protocol())
        .protocol(idle_protocol("aaa"))
        .build()
        .unwrap();
    let mut b = TestNodeBuilder::new("b")
        .protocol(idle_protocol("aaa"))
        .protocol(echo_protocol())
        .build()
        .unwrap();

    a.connect(&b);
    let dropped = a.events.wait_for(Drop, b.id()).await.unwrap();
    assert_eq!(dropped.error, None);
    b.events.wait_for(Drop, a.id()).await.unwrap();

    let recv = b.events.drain().iter().find(|e| e.kind == MsgRecv).cloned().unwrap();
    assert_eq!(recv.protocol.as_deref(), Some("echo/1"));
    assert_eq!(recv.msg_code, Some(0));

    a.stop().await;
    b.stop().await;
}

/// A failing runner tears the peer down and its error reaches the Drop.
#[tokio::test]
async fn test_runner_error_in_drop() {
    let mut a = TestNodeBuilder::new("a").protocol(failing_protocol()).build().unwrap();
    let mut b = TestNodeBuilder::new("b").protocol(failing_protocol()).build().unwrap();

    a.connect(&b);
    let dropped = a.events.wait_for(Drop, b.id()).await.unwrap();
    let error = dropped.error.unwrap();
    assert!(error.contains("fail/1"), "{error}");
    assert!(error.contains("boom"), "{error}");

    let remote = b.events.wait_for(Drop, a.id()).await.unwrap();
    assert!(remote.error.is_some());
    assert_eq!(a.events.sequence(b.id()), vec![Add, Drop]);

    a.stop().await;
    b.stop().await;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Greeting {
    from: String,
    n: u32,
}

fn greet_protocol(received: mpsc::Sender<(u64, Greeting)>) -> Protocol {
    Protocol::new("greet", 1, 2, move |peer: PeerHandle, mut stream: ProtocolStream| {
        let received = received.clone();
        async move {
            if peer.is_inbound() {
                let msg = stream.read_msg().await?;
                let greeting: Greeting = msg.decode()?;
                let _ = received.send((msg.code, greeting)).await;
                return Ok(());
            }

            anyhow::ensure!(stream.protocol() == "greet/1", "wrong stream");
            anyhow::ensure!(peer.caps().iter().any(|c| c.name == "greet"), "remote lacks greet");
            let sender = stream.sender();
            let bad = sender.send(2, &Greeting { from: "x".into(), n: 0 }).await;
            anyhow::ensure!(
                matches!(bad, Err(ProtocolError::InvalidCode { code: 2, length: 2 })),
                "out-of-range code accepted"
            );
            sender.send(1, &Greeting { from: peer.name().to_string(), n: 7 }).await?;
            // wait for the listener to finish with us
            while stream.read_msg().await.is_ok() {}
            Ok(())
        }
    })
}

/// Typed payloads arrive with their protocol-relative code.
#[tokio::test]
async fn test_typed_messages() {
    let (tx, mut rx) = mpsc::channel(4);
    let a = TestNodeBuilder::new("a").protocol(greet_protocol(tx.clone())).build().unwrap();
    let b = TestNodeBuilder::new("b").protocol(greet_protocol(tx)).build().unwrap();

    a.connect(&b);
    let (code, greeting) = tokio::time::timeout(crate::harness::WAIT, rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(code, 1);
    assert_eq!(greeting, Greeting { from: "b".into(), n: 7 });

    a.stop().await;
    b.stop().await;
}

/// A subscriber that never reads loses events without holding up others.
#[tokio::test]
async fn test_slow_subscriber_isolated() {
    let mut a = TestNodeBuilder::new("a").protocol(echo_protocol()).build().unwrap();
    let b = TestNodeBuilder::new("b").protocol(echo_protocol()).build().unwrap();
    let (tx, mut slow) = mpsc::channel(1);
    let _slow_sub = a.server.subscribe_events(tx);

    a.connect(&b);
    a.events.wait_for(Drop, b.id()).await.unwrap();
    assert_eq!(a.events.sequence(b.id()), vec![Add, MsgSend, MsgRecv, Drop]);

    assert_eq!(slow.try_recv().unwrap().kind, Add);
    assert!(slow.try_recv().is_err());

    a.stop().await;
    b.stop().await;
}
