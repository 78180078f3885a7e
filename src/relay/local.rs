//! In-process relay transport

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ahash::AHashSet;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{RelayEnvelope, RelayError, RelayTransport};

struct Member {
    topics: AHashSet<String>,
    tx: mpsc::UnboundedSender<RelayEnvelope>,
}

/// Hub connecting brokers that run in the same process
#[derive(Clone, Default)]
pub struct LocalBus {
    members: Arc<DashMap<u64, Member>>,
    next_id: Arc<AtomicU64>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a new member; hand the result to one broker's relay
    pub fn join(&self) -> LocalTransport {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.members.insert(
            id,
            Member {
                topics: AHashSet::new(),
                tx,
            },
        );
        LocalTransport {
            id,
            bus: self.clone(),
            inbound: Mutex::new(Some(rx)),
        }
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }
}

/// One broker's connection to a [`LocalBus`]
pub struct LocalTransport {
    id: u64,
    bus: LocalBus,
    inbound: Mutex<Option<mpsc::UnboundedReceiver<RelayEnvelope>>>,
}

#[async_trait]
impl RelayTransport for LocalTransport {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), RelayError> {
        for member in self.bus.members.iter() {
            if member.topics.contains(topic) {
                // A member whose reader has gone away simply misses the message
                let _ = member.tx.send(RelayEnvelope {
                    topic: topic.to_string(),
                    payload: payload.clone(),
                });
            }
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<(), RelayError> {
        let mut member = self.bus.members.get_mut(&self.id).ok_or(RelayError::Closed)?;
        member.topics.insert(topic.to_string());
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), RelayError> {
        if let Some(mut member) = self.bus.members.get_mut(&self.id) {
            member.topics.remove(topic);
        }
        Ok(())
    }

    fn take_inbound(&self) -> Option<mpsc::UnboundedReceiver<RelayEnvelope>> {
        self.inbound.lock().take()
    }

    async fn close(&self) {
        self.bus.members.remove(&self.id);
    }
}

impl Drop for LocalTransport {
    fn drop(&mut self) {
        self.bus.members.remove(&self.id);
    }
}
