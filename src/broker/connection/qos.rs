//! QoS 1 redelivery and pushAck handling
//!
//! Queued packets are pushed one at a time: the next one goes out only
//! after the client acknowledged the one in flight. Live pushes bypass
//! this queue.

use tracing::debug;

use super::Connection;
use crate::protocol::PushAck;
use crate::transport::FrameIo;

impl<T: FrameIo> Connection<T> {
    /// Load the client's unacknowledged packets and send the oldest
    pub(crate) async fn load_pending(&mut self, client_id: &str) {
        let ids = self.engine.pending_ids(client_id).await;
        if !ids.is_empty() {
            debug!("{} pending packets for {}", ids.len(), client_id);
        }
        self.redelivery.queue = ids.into();
        self.send_next_pending(client_id).await;
    }

    /// Push the next deliverable queued packet, skipping stale ones
    pub(crate) async fn send_next_pending(&mut self, client_id: &str) {
        self.redelivery.in_flight = None;
        while let Some(packet_id) = self.redelivery.queue.pop_front() {
            if self
                .engine
                .redeliver(client_id, &packet_id, &self.writer)
                .await
            {
                self.redelivery.in_flight = Some(packet_id);
                return;
            }
        }
    }

    pub(crate) async fn handle_push_ack(&mut self, ack: PushAck) {
        let Some(client_id) = self.client_id() else {
            debug!("Ignoring pushAck from unconnected {}", self.remote);
            return;
        };

        self.engine.acknowledge(&client_id, &ack.packet_id).await;

        if self.redelivery.in_flight.as_deref() == Some(ack.packet_id.as_str()) {
            self.send_next_pending(&client_id).await;
        } else {
            self.redelivery.queue.retain(|id| id != &ack.packet_id);
        }
    }
}
