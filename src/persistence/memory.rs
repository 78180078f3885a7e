//! In-memory storage backend.
//!
//! All tables live behind one lock so multi-table updates (removing a
//! subscription and its pending acks) are atomic. Several brokers in one
//! process may share a single instance.

use std::collections::{BTreeMap, BTreeSet};

use ahash::{AHashMap, AHashSet};
use async_trait::async_trait;
use parking_lot::RwLock;

use super::backend::StorageBackend;
use super::error::Result;
use super::models::{PendingAck, PendingPublish, Presence, RetainedMessage, Subscription};

#[derive(Default)]
struct Tables {
    presence: AHashMap<String, Presence>,
    /// client -> channel -> subscription
    subs_by_client: AHashMap<String, BTreeMap<String, Subscription>>,
    /// channel -> clients
    subs_by_channel: AHashMap<String, BTreeSet<String>>,
    retained: AHashMap<String, RetainedMessage>,
    packets: AHashMap<String, PendingPublish>,
    /// client -> acks in insertion order
    acks: AHashMap<String, Vec<PendingAck>>,
}

impl Tables {
    fn remove_subscription(&mut self, client_id: &str, channel: &str) {
        if let Some(subs) = self.subs_by_client.get_mut(client_id) {
            subs.remove(channel);
            if subs.is_empty() {
                self.subs_by_client.remove(client_id);
            }
        }
        if let Some(clients) = self.subs_by_channel.get_mut(channel) {
            clients.remove(client_id);
            if clients.is_empty() {
                self.subs_by_channel.remove(channel);
            }
        }
        if let Some(acks) = self.acks.get_mut(client_id) {
            acks.retain(|ack| ack.channel != channel);
            if acks.is_empty() {
                self.acks.remove(client_id);
            }
        }
    }
}

/// In-memory storage backend
#[derive(Default)]
pub struct MemoryBackend {
    tables: RwLock<Tables>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored pending packets
    pub fn packet_count(&self) -> usize {
        self.tables.read().packets.len()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn upsert_presence(&self, presence: &Presence) -> Result<()> {
        self.tables
            .write()
            .presence
            .insert(presence.client_id.clone(), presence.clone());
        Ok(())
    }

    async fn remove_presence(&self, client_id: &str) -> Result<()> {
        self.tables.write().presence.remove(client_id);
        Ok(())
    }

    async fn get_presence(&self, client_id: &str) -> Result<Option<Presence>> {
        Ok(self.tables.read().presence.get(client_id).cloned())
    }

    async fn insert_subscription(
        &self,
        client_id: &str,
        channel: &str,
        persistent: bool,
    ) -> Result<()> {
        let mut tables = self.tables.write();
        tables
            .subs_by_client
            .entry(client_id.to_string())
            .or_default()
            .entry(channel.to_string())
            .and_modify(|sub| sub.persistent = persistent)
            .or_insert_with(|| Subscription::new(client_id, channel, persistent));
        tables
            .subs_by_channel
            .entry(channel.to_string())
            .or_default()
            .insert(client_id.to_string());
        Ok(())
    }

    async fn remove_subscription(&self, client_id: &str, channel: &str) -> Result<()> {
        self.tables.write().remove_subscription(client_id, channel);
        Ok(())
    }

    async fn subscriptions_by_client(&self, client_id: &str) -> Result<Vec<Subscription>> {
        Ok(self
            .tables
            .read()
            .subs_by_client
            .get(client_id)
            .map(|subs| subs.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn subscribers(&self, channel: &str) -> Result<Vec<Subscription>> {
        let tables = self.tables.read();
        let Some(clients) = tables.subs_by_channel.get(channel) else {
            return Ok(Vec::new());
        };
        Ok(clients
            .iter()
            .filter_map(|client| tables.subs_by_client.get(client)?.get(channel).cloned())
            .collect())
    }

    async fn has_subscription(&self, client_id: &str, channel: &str) -> Result<bool> {
        Ok(self
            .tables
            .read()
            .subs_by_client
            .get(client_id)
            .is_some_and(|subs| subs.contains_key(channel)))
    }

    async fn remove_non_persistent(&self, client_id: &str) -> Result<Vec<String>> {
        let mut tables = self.tables.write();
        let channels: Vec<String> = tables
            .subs_by_client
            .get(client_id)
            .map(|subs| {
                subs.values()
                    .filter(|sub| !sub.persistent)
                    .map(|sub| sub.channel.clone())
                    .collect()
            })
            .unwrap_or_default();
        for channel in &channels {
            tables.remove_subscription(client_id, channel);
        }
        Ok(channels)
    }

    async fn remove_all_non_persistent(&self) -> Result<usize> {
        let mut tables = self.tables.write();
        let doomed: Vec<(String, String)> = tables
            .subs_by_client
            .values()
            .flat_map(|subs| subs.values())
            .filter(|sub| !sub.persistent)
            .map(|sub| (sub.client_id.clone(), sub.channel.clone()))
            .collect();
        for (client_id, channel) in &doomed {
            tables.remove_subscription(client_id, channel);
        }
        Ok(doomed.len())
    }

    async fn upsert_retained(&self, message: &RetainedMessage) -> Result<()> {
        self.tables
            .write()
            .retained
            .insert(message.channel.clone(), message.clone());
        Ok(())
    }

    async fn retained_for(&self, channels: &[String]) -> Result<Vec<RetainedMessage>> {
        let tables = self.tables.read();
        Ok(channels
            .iter()
            .filter_map(|channel| tables.retained.get(channel).cloned())
            .collect())
    }

    async fn insert_packet(&self, packet: &PendingPublish) -> Result<()> {
        self.tables
            .write()
            .packets
            .insert(packet.packet_id.clone(), packet.clone());
        Ok(())
    }

    async fn get_packet(&self, packet_id: &str) -> Result<Option<PendingPublish>> {
        Ok(self.tables.read().packets.get(packet_id).cloned())
    }

    async fn insert_pending_ack(
        &self,
        client_id: &str,
        packet_id: &str,
        channel: &str,
    ) -> Result<()> {
        let mut tables = self.tables.write();
        let acks = tables.acks.entry(client_id.to_string()).or_default();
        if !acks.iter().any(|ack| ack.packet_id == packet_id) {
            acks.push(PendingAck {
                client_id: client_id.to_string(),
                packet_id: packet_id.to_string(),
                channel: channel.to_string(),
            });
        }
        Ok(())
    }

    async fn remove_pending_ack(&self, client_id: &str, packet_id: &str) -> Result<bool> {
        let mut tables = self.tables.write();
        let Some(acks) = tables.acks.get_mut(client_id) else {
            return Ok(false);
        };
        let before = acks.len();
        acks.retain(|ack| ack.packet_id != packet_id);
        let removed = acks.len() != before;
        if acks.is_empty() {
            tables.acks.remove(client_id);
        }
        Ok(removed)
    }

    async fn pending_ids(&self, client_id: &str) -> Result<Vec<String>> {
        Ok(self
            .tables
            .read()
            .acks
            .get(client_id)
            .map(|acks| acks.iter().map(|ack| ack.packet_id.clone()).collect())
            .unwrap_or_default())
    }

    async fn reclaim_orphans(&self, cutoff: u64) -> Result<usize> {
        let mut tables = self.tables.write();
        let referenced: AHashSet<String> = tables
            .acks
            .values()
            .flatten()
            .map(|ack| ack.packet_id.clone())
            .collect();
        let before = tables.packets.len();
        tables
            .packets
            .retain(|id, packet| packet.created_at > cutoff || referenced.contains(id));
        Ok(before - tables.packets.len())
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

