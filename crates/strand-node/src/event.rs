//! Event bus -- fan-out of peer lifecycle and message events.
//!
//! Publishing never blocks: each subscriber owns a bounded channel and an
//! event that does not fit is dropped for that subscriber only.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

use serde::Serialize;
use strand_protocol::NodeIdentity;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerEventKind {
    Add,
    Drop,
    MsgSend,
    MsgRecv,
}

#[derive(Debug, Clone, Serialize)]
pub struct PeerEvent {
    #[serde(rename = "type")]
    pub kind: PeerEventKind,
    pub peer: NodeIdentity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub msg_code: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub msg_size: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PeerEvent {
    pub fn add(peer: NodeIdentity) -> Self {
        Self::bare(PeerEventKind::Add, peer)
    }

    pub fn drop(peer: NodeIdentity, error: Option<String>) -> Self {
        Self {
            error,
            ..Self::bare(PeerEventKind::Drop, peer)
        }
    }

    pub fn msg(kind: PeerEventKind, peer: NodeIdentity, protocol: &str, code: u64, size: u32) -> Self {
        Self {
            protocol: Some(protocol.to_string()),
            msg_code: Some(code),
            msg_size: Some(size),
            ..Self::bare(kind, peer)
        }
    }

    fn bare(kind: PeerEventKind, peer: NodeIdentity) -> Self {
        Self {
            kind,
            peer,
            protocol: None,
            msg_code: None,
            msg_size: None,
            error: None,
        }
    }
}

type Sinks = HashMap<u64, mpsc::Sender<PeerEvent>>;

struct BusInner {
    sinks: RwLock<Sinks>,
    next_id: AtomicU64,
    closed: AtomicBool,
    published: AtomicU64,
    dropped: AtomicU64,
}

/// Registry of event subscribers. Cheap to clone.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                sinks: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                closed: AtomicBool::new(false),
                published: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Register `sink`. The channel's capacity is the subscriber's buffer.
    ///
    /// On a closed bus the sink is dropped at once and the returned
    /// subscription is inactive.
    pub fn subscribe(&self, sink: mpsc::Sender<PeerEvent>) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let active = {
            let mut sinks = write_sinks(&self.inner.sinks);
            if self.inner.closed.load(Ordering::Acquire) {
                false
            } else {
                sinks.insert(id, sink);
                true
            }
        };
        tracing::debug!(subscription = id, active, "events: subscribed");
        Subscription {
            id,
            bus: Arc::downgrade(&self.inner),
            active: AtomicBool::new(active),
        }
    }

    /// Offer `event` to every subscriber without waiting.
    pub fn publish(&self, event: PeerEvent) {
        let mut gone = Vec::new();
        {
            let sinks = read_sinks(&self.inner.sinks);
            for (id, sink) in sinks.iter() {
                match sink.try_send(event.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                        tracing::debug!(subscription = id, kind = ?event.kind, "events: subscriber full, event dropped");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => gone.push(*id),
                }
            }
        }
        self.inner.published.fetch_add(1, Ordering::Relaxed);

        if !gone.is_empty() {
            let mut sinks = write_sinks(&self.inner.sinks);
            for id in gone {
                sinks.remove(&id);
                tracing::debug!(subscription = id, "events: receiver gone, pruned");
            }
        }
    }

    /// Drop every sink; later subscriptions start inactive.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        let mut sinks = write_sinks(&self.inner.sinks);
        let count = sinks.len();
        sinks.clear();
        tracing::debug!(subscribers = count, "events: bus closed");
    }

    pub fn subscriber_count(&self) -> usize {
        read_sinks(&self.inner.sinks).len()
    }

    pub fn published_count(&self) -> u64 {
        self.inner.published.load(Ordering::Relaxed)
    }

    pub fn dropped_count(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }
}

/// Handle for one registered sink. Dropping it unsubscribes.
#[must_use = "dropping the subscription unsubscribes the sink"]
pub struct Subscription {
    id: u64,
    bus: Weak<BusInner>,
    active: AtomicBool,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Stop delivery. Idempotent. Returns once any publish that could still
    /// reach this sink has finished, so nothing arrives afterwards.
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(bus) = self.bus.upgrade() {
            write_sinks(&bus.sinks).remove(&self.id);
            tracing::debug!(subscription = self.id, "events: unsubscribed");
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}

// try_send cannot panic, so a poisoned lock still holds a consistent map.
fn read_sinks(lock: &RwLock<Sinks>) -> std::sync::RwLockReadGuard<'_, Sinks> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write_sinks(lock: &RwLock<Sinks>) -> std::sync::RwLockWriteGuard<'_, Sinks> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}
