//! Keep-alive protocol (`ping/1`).
//!
//! Each side pings on an interval and answers the other's pings. A peer that
//! leaves `miss_limit` pings in a row unanswered is declared dead, which
//! fails the runner and so tears the peer down.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use strand_protocol::{KEEPALIVE_INTERVAL_SECS, KEEPALIVE_MISS_LIMIT};
use tokio::time::MissedTickBehavior;

use crate::peer::PeerHandle;
use crate::protocol::{Protocol, ProtocolStream};

pub const NAME: &str = "ping";
pub const VERSION: u32 = 1;
pub const LENGTH: u64 = 2;

const PING: u64 = 0;
const PONG: u64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ping {
    pub seq: u64,
    pub sent_at_ns: u64,
}

/// Echoes the ping it answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pong {
    pub seq: u64,
    pub sent_at_ns: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct PingConfig {
    pub interval: Duration,
    pub miss_limit: u32,
}

impl Default for PingConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(KEEPALIVE_INTERVAL_SECS),
            miss_limit: KEEPALIVE_MISS_LIMIT,
        }
    }
}

pub fn protocol(config: PingConfig) -> Protocol {
    Protocol::new(NAME, VERSION, LENGTH, move |peer, stream| run(peer, stream, config))
}

async fn run(peer: PeerHandle, mut stream: ProtocolStream, config: PingConfig) -> anyhow::Result<()> {
    let mut ticker = tokio::time::interval(config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    let mut seq: u64 = 0;
    let mut missed: u32 = 0;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if missed >= config.miss_limit {
                    tracing::warn!(peer = %peer.id().short(), "peer dead: {missed} missed pings");
                    anyhow::bail!("{missed} pings unanswered");
                }
                seq += 1;
                stream.send(PING, &Ping { seq, sent_at_ns: now_ns() }).await?;
                missed += 1;
            }
            msg = stream.read_msg() => {
                let msg = msg?;
                match msg.code {
                    PING => {
                        let ping: Ping = msg.decode()?;
                        stream.send(PONG, &Pong { seq: ping.seq, sent_at_ns: ping.sent_at_ns }).await?;
                    }
                    PONG => {
                        let pong: Pong = msg.decode()?;
                        if pong.seq == seq {
                            missed = 0;
                        }
                        let rtt_ms = now_ns().saturating_sub(pong.sent_at_ns) as f64 / 1_000_000.0;
                        tracing::trace!(peer = %peer.id().short(), seq = pong.seq, rtt_ms, "peer: pong");
                    }
                    other => anyhow::bail!("unexpected ping code {other}"),
                }
            }
        }
    }
}

fn now_ns() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}
