//! Networked relay transport backed by the cluster manager

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use crate::config::ClusterConfig;
use crate::relay::{RelayEnvelope, RelayError, RelayTransport};

use super::manager::ClusterManager;
use super::peer::ClusterInboundCallback;

/// [`RelayTransport`] that spans brokers on different hosts
pub struct ClusterTransport {
    manager: ClusterManager,
    inbound_tx: mpsc::UnboundedSender<RelayEnvelope>,
    inbound: Mutex<Option<mpsc::UnboundedReceiver<RelayEnvelope>>>,
}

impl ClusterTransport {
    /// Join the cluster and start accepting relay links
    pub async fn start(config: &ClusterConfig, instance_id: &str) -> Result<Self, RelayError> {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let sink_tx = inbound_tx.clone();
        let sink: ClusterInboundCallback = Arc::new(move |topic, payload, origin| {
            debug!("Cluster inbound: '{}' from {}", topic, origin);
            let _ = sink_tx.send(RelayEnvelope { topic, payload });
        });

        let node_id = config.node_id_or(instance_id);
        let manager = ClusterManager::new(config.clone(), node_id, sink).await?;
        manager.start().await?;

        Ok(Self {
            manager,
            inbound_tx,
            inbound: Mutex::new(Some(inbound_rx)),
        })
    }

    pub fn manager(&self) -> &ClusterManager {
        &self.manager
    }
}

#[async_trait]
impl RelayTransport for ClusterTransport {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), RelayError> {
        if self.manager.is_local_topic(topic) {
            self.inbound_tx
                .send(RelayEnvelope {
                    topic: topic.to_string(),
                    payload: payload.clone(),
                })
                .map_err(|_| RelayError::Closed)?;
        }
        self.manager.forward(topic, payload).await;
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<(), RelayError> {
        self.manager.add_topic(topic).await;
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), RelayError> {
        self.manager.remove_topic(topic).await;
        Ok(())
    }

    fn take_inbound(&self) -> Option<mpsc::UnboundedReceiver<RelayEnvelope>> {
        self.inbound.lock().take()
    }

    async fn close(&self) {
        self.manager.stop().await;
    }
}
