//! Fjall-based storage backend implementation.
//!
//! Uses fjall (an LSM-tree based embedded database) for local persistence.
//! Multi-part keys are `a\0b`; pending-ack keys end in a big-endian
//! sequence number so a prefix scan yields them in insertion order.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use ahash::AHashSet;
use async_trait::async_trait;
use fjall::{Config, Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};

use super::backend::StorageBackend;
use super::error::{PersistenceError, Result};
use super::models::{PendingAck, PendingPublish, Presence, RetainedMessage, Subscription};

const SEPARATOR: u8 = 0;

/// Fjall-based storage backend
pub struct FjallBackend {
    keyspace: Keyspace,
    presence: PartitionHandle,
    subs_by_client: PartitionHandle,
    subs_by_channel: PartitionHandle,
    retained: PartitionHandle,
    packets: PartitionHandle,
    acks: PartitionHandle,
    next_seq: AtomicU64,
}

impl FjallBackend {
    /// Open a fjall backend at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let opening = |source| PersistenceError::Open {
            path: path.to_path_buf(),
            source,
        };
        let keyspace = Config::new(path).open().map_err(opening)?;
        let partition = |name: &str| {
            keyspace
                .open_partition(name, PartitionCreateOptions::default())
                .map_err(opening)
        };

        let presence = partition("presence")?;
        let subs_by_client = partition("subs_by_client")?;
        let subs_by_channel = partition("subs_by_channel")?;
        let retained = partition("retained")?;
        let packets = partition("packets")?;
        let acks = partition("acks")?;

        let mut last_seq = 0;
        for item in acks.iter() {
            let (key, _) = item?;
            last_seq = last_seq.max(Self::ack_seq(&key)?);
        }

        Ok(Self {
            keyspace,
            presence,
            subs_by_client,
            subs_by_channel,
            retained,
            packets,
            acks,
            next_seq: AtomicU64::new(last_seq + 1),
        })
    }

    /// Serialize a value using bincode
    fn serialize<T: bincode::Encode>(value: &T) -> Result<Vec<u8>> {
        bincode::encode_to_vec(value, bincode::config::standard()).map_err(PersistenceError::from)
    }

    /// Deserialize a value using bincode
    fn deserialize<T: bincode::Decode<()>>(bytes: &[u8]) -> Result<T> {
        bincode::decode_from_slice(bytes, bincode::config::standard())
            .map(|(value, _)| value)
            .map_err(PersistenceError::from)
    }

    fn prefix(first: &str) -> Vec<u8> {
        let mut key = Vec::with_capacity(first.len() + 1);
        key.extend_from_slice(first.as_bytes());
        key.push(SEPARATOR);
        key
    }

    fn composite(first: &str, second: &[u8]) -> Vec<u8> {
        let mut key = Self::prefix(first);
        key.extend_from_slice(second);
        key
    }

    fn ack_seq(key: &[u8]) -> Result<u64> {
        let tail = key
            .len()
            .checked_sub(8)
            .map(|start| &key[start..])
            .ok_or(PersistenceError::CorruptKey { partition: "acks" })?;
        let mut seq = [0u8; 8];
        seq.copy_from_slice(tail);
        Ok(u64::from_be_bytes(seq))
    }

    fn client_acks(&self, client_id: &str) -> Result<Vec<(Vec<u8>, PendingAck)>> {
        let mut result = Vec::new();
        for item in self.acks.prefix(Self::prefix(client_id)) {
            let (key, value) = item?;
            result.push((key.to_vec(), Self::deserialize(&value)?));
        }
        Ok(result)
    }

    fn remove_subscription_rows(&self, client_id: &str, channel: &str) -> Result<()> {
        let mut batch = self.keyspace.batch();
        batch.remove(
            &self.subs_by_client,
            Self::composite(client_id, channel.as_bytes()),
        );
        batch.remove(
            &self.subs_by_channel,
            Self::composite(channel, client_id.as_bytes()),
        );
        for (key, ack) in self.client_acks(client_id)? {
            if ack.channel == channel {
                batch.remove(&self.acks, key);
            }
        }
        batch.commit()?;
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for FjallBackend {
    // ========================================================================
    // Presence
    // ========================================================================

    async fn upsert_presence(&self, presence: &Presence) -> Result<()> {
        let bytes = Self::serialize(presence)?;
        self.presence.insert(presence.client_id.as_str(), bytes)?;
        Ok(())
    }

    async fn remove_presence(&self, client_id: &str) -> Result<()> {
        self.presence.remove(client_id)?;
        Ok(())
    }

    async fn get_presence(&self, client_id: &str) -> Result<Option<Presence>> {
        match self.presence.get(client_id)? {
            Some(bytes) => Ok(Some(Self::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    // ========================================================================
    // Subscriptions
    // ========================================================================

    async fn insert_subscription(
        &self,
        client_id: &str,
        channel: &str,
        persistent: bool,
    ) -> Result<()> {
        let by_client = Self::composite(client_id, channel.as_bytes());
        let subscription = match self.subs_by_client.get(&by_client)? {
            Some(bytes) => {
                let mut existing: Subscription = Self::deserialize(&bytes)?;
                existing.persistent = persistent;
                existing
            }
            None => Subscription::new(client_id, channel, persistent),
        };
        let bytes = Self::serialize(&subscription)?;

        let mut batch = self.keyspace.batch();
        batch.insert(&self.subs_by_client, by_client, bytes.clone());
        batch.insert(
            &self.subs_by_channel,
            Self::composite(channel, client_id.as_bytes()),
            bytes,
        );
        batch.commit()?;
        Ok(())
    }

    async fn remove_subscription(&self, client_id: &str, channel: &str) -> Result<()> {
        self.remove_subscription_rows(client_id, channel)
    }

    async fn subscriptions_by_client(&self, client_id: &str) -> Result<Vec<Subscription>> {
        let mut result = Vec::new();
        for item in self.subs_by_client.prefix(Self::prefix(client_id)) {
            let (_, value) = item?;
            result.push(Self::deserialize(&value)?);
        }
        Ok(result)
    }

    async fn subscribers(&self, channel: &str) -> Result<Vec<Subscription>> {
        let mut result = Vec::new();
        for item in self.subs_by_channel.prefix(Self::prefix(channel)) {
            let (_, value) = item?;
            result.push(Self::deserialize(&value)?);
        }
        Ok(result)
    }

    async fn has_subscription(&self, client_id: &str, channel: &str) -> Result<bool> {
        Ok(self
            .subs_by_client
            .contains_key(Self::composite(client_id, channel.as_bytes()))?)
    }

    async fn remove_all_non_persistent(&self) -> Result<usize> {
        let mut doomed = Vec::new();
        for item in self.subs_by_client.iter() {
            let (_, value) = item?;
            let sub: Subscription = Self::deserialize(&value)?;
            if !sub.persistent {
                doomed.push(sub);
            }
        }
        for sub in &doomed {
            self.remove_subscription_rows(&sub.client_id, &sub.channel)?;
        }
        Ok(doomed.len())
    }

    // ========================================================================
    // Retained messages
    // ========================================================================

    async fn upsert_retained(&self, message: &RetainedMessage) -> Result<()> {
        let bytes = Self::serialize(message)?;
        self.retained.insert(message.channel.as_str(), bytes)?;
        Ok(())
    }

    async fn retained_for(&self, channels: &[String]) -> Result<Vec<RetainedMessage>> {
        let mut result = Vec::new();
        for channel in channels {
            if let Some(bytes) = self.retained.get(channel)? {
                result.push(Self::deserialize(&bytes)?);
            }
        }
        Ok(result)
    }

    // ========================================================================
    // Pending QoS 1 packets
    // ========================================================================

    async fn insert_packet(&self, packet: &PendingPublish) -> Result<()> {
        let bytes = Self::serialize(packet)?;
        self.packets.insert(packet.packet_id.as_str(), bytes)?;
        Ok(())
    }

    async fn get_packet(&self, packet_id: &str) -> Result<Option<PendingPublish>> {
        match self.packets.get(packet_id)? {
            Some(bytes) => Ok(Some(Self::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn insert_pending_ack(
        &self,
        client_id: &str,
        packet_id: &str,
        channel: &str,
    ) -> Result<()> {
        if self
            .client_acks(client_id)?
            .iter()
            .any(|(_, ack)| ack.packet_id == packet_id)
        {
            return Ok(());
        }

        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let ack = PendingAck {
            client_id: client_id.to_string(),
            packet_id: packet_id.to_string(),
            channel: channel.to_string(),
        };
        self.acks.insert(
            Self::composite(client_id, &seq.to_be_bytes()),
            Self::serialize(&ack)?,
        )?;
        Ok(())
    }

    async fn remove_pending_ack(&self, client_id: &str, packet_id: &str) -> Result<bool> {
        let mut removed = false;
        for (key, ack) in self.client_acks(client_id)? {
            if ack.packet_id == packet_id {
                self.acks.remove(key)?;
                removed = true;
            }
        }
        Ok(removed)
    }

    async fn pending_ids(&self, client_id: &str) -> Result<Vec<String>> {
        Ok(self
            .client_acks(client_id)?
            .into_iter()
            .map(|(_, ack)| ack.packet_id)
            .collect())
    }

    async fn reclaim_orphans(&self, cutoff: u64) -> Result<usize> {
        let mut referenced = AHashSet::new();
        for item in self.acks.iter() {
            let (_, value) = item?;
            let ack: PendingAck = Self::deserialize(&value)?;
            referenced.insert(ack.packet_id);
        }

        let mut batch = self.keyspace.batch();
        let mut count = 0;
        for item in self.packets.iter() {
            let (key, value) = item?;
            let packet: PendingPublish = Self::deserialize(&value)?;
            if packet.created_at <= cutoff && !referenced.contains(&packet.packet_id) {
                batch.remove(&self.packets, key);
                count += 1;
            }
        }
        batch.commit()?;
        Ok(count)
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    async fn flush(&self) -> Result<()> {
        self.keyspace.persist(PersistMode::SyncAll)?;
        Ok(())
    }
}
