//! Control channel handler and logging notifiers
//!
//! `$` channels never reach subscribers; their publishes are answered here
//! and the result travels back in the pubAck.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use crate::hooks::{
    ConnectionCloseNotifier, ControlChannelHandler, ControlResponse, DisconnectionNotifier,
    HookResult, RemoteInfo,
};
use crate::persistence::StorageBackend;

/// Lists the caller's subscriptions
pub const MY_SUBSCRIPTIONS: &str = "$mySubscriptions";

/// Store-backed control channels
pub struct ControlChannels {
    store: Arc<dyn StorageBackend>,
}

impl ControlChannels {
    pub fn new(store: Arc<dyn StorageBackend>) -> Self {
        Self { store }
    }

    async fn my_subscriptions(&self, client_id: &str) -> ControlResponse {
        match self.store.subscriptions_by_client(client_id).await {
            Ok(subs) => {
                let channels: Vec<Value> = subs
                    .into_iter()
                    .map(|sub| {
                        let kind = if sub.persistent { "persistent" } else { "temp" };
                        let mut entry = Map::new();
                        entry.insert(sub.channel, Value::from(kind));
                        Value::Object(entry)
                    })
                    .collect();
                ControlResponse::ok(json!({ "channels": channels }))
            }
            Err(e) => {
                warn!("Failed to list subscriptions of {}: {}", client_id, e);
                ControlResponse::failed()
            }
        }
    }
}

#[async_trait]
impl ControlChannelHandler for ControlChannels {
    async fn handle_control(
        &self,
        client_id: &str,
        channel: &str,
        _data: &Value,
        _remote: &RemoteInfo,
    ) -> HookResult<ControlResponse> {
        match channel {
            MY_SUBSCRIPTIONS => Ok(self.my_subscriptions(client_id).await),
            _ => Ok(ControlResponse::failed()),
        }
    }
}

/// Logs session ends
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl DisconnectionNotifier for LogNotifier {
    async fn on_disconnect(&self, client_id: &str, remote: &RemoteInfo) {
        info!("Client {} disconnected from {}", client_id, remote);
    }
}

#[async_trait]
impl ConnectionCloseNotifier for LogNotifier {
    async fn on_connection_close(&self, client_id: &str, remote: &RemoteInfo) {
        info!("Connection of client {} closed ({})", client_id, remote);
    }
}
