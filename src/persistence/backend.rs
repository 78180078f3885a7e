//! Storage backend trait for persistence.
//!
//! The broker only talks to this interface; the memory and fjall
//! backends are interchangeable behind it.

use async_trait::async_trait;

use super::error::Result;
use super::models::{Presence, PendingPublish, RetainedMessage, Subscription};

/// Storage backend trait for persistence
#[async_trait]
pub trait StorageBackend: Send + Sync {
    // ========================================================================
    // Presence
    // ========================================================================

    /// Record a client as connected, replacing any previous record
    async fn upsert_presence(&self, presence: &Presence) -> Result<()>;

    async fn remove_presence(&self, client_id: &str) -> Result<()>;

    async fn get_presence(&self, client_id: &str) -> Result<Option<Presence>>;

    async fn has_presence(&self, client_id: &str) -> Result<bool> {
        Ok(self.get_presence(client_id).await?.is_some())
    }

    // ========================================================================
    // Subscriptions
    // ========================================================================

    /// Insert a subscription; inserting it again only updates the persistent flag
    async fn insert_subscription(&self, client_id: &str, channel: &str, persistent: bool)
        -> Result<()>;

    /// Remove a subscription together with the client's pending acks for that channel
    async fn remove_subscription(&self, client_id: &str, channel: &str) -> Result<()>;

    async fn subscriptions_by_client(&self, client_id: &str) -> Result<Vec<Subscription>>;

    /// Every subscription on a channel
    async fn subscribers(&self, channel: &str) -> Result<Vec<Subscription>>;

    async fn has_subscription(&self, client_id: &str, channel: &str) -> Result<bool>;

    /// Drop the client's non-persistent subscriptions, returning their channels
    async fn remove_non_persistent(&self, client_id: &str) -> Result<Vec<String>> {
        let mut removed = Vec::new();
        for sub in self.subscriptions_by_client(client_id).await? {
            if !sub.persistent {
                self.remove_subscription(client_id, &sub.channel).await?;
                removed.push(sub.channel);
            }
        }
        Ok(removed)
    }

    /// Drop every non-persistent subscription of every client
    async fn remove_all_non_persistent(&self) -> Result<usize>;

    // ========================================================================
    // Retained messages
    // ========================================================================

    /// Replace the channel's retained message
    async fn upsert_retained(&self, message: &RetainedMessage) -> Result<()>;

    async fn retained_for(&self, channels: &[String]) -> Result<Vec<RetainedMessage>>;

    // ========================================================================
    // Pending QoS 1 packets
    // ========================================================================

    async fn insert_packet(&self, packet: &PendingPublish) -> Result<()>;

    async fn get_packet(&self, packet_id: &str) -> Result<Option<PendingPublish>>;

    async fn insert_pending_ack(&self, client_id: &str, packet_id: &str, channel: &str)
        -> Result<()>;

    /// Returns whether a row was removed
    async fn remove_pending_ack(&self, client_id: &str, packet_id: &str) -> Result<bool>;

    /// Unacknowledged packet ids of a client, oldest first
    async fn pending_ids(&self, client_id: &str) -> Result<Vec<String>>;

    /// Delete pending packets created at or before `cutoff` (unix ms) that no
    /// pending ack references any more. Returns how many were deleted.
    async fn reclaim_orphans(&self, cutoff: u64) -> Result<usize>;

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Flush all pending writes to disk
    async fn flush(&self) -> Result<()>;
}
