//! pub handling

use tracing::{debug, warn};

use super::Connection;
use crate::hooks::ControlResponse;
use crate::protocol::{validate_channel, ChannelKind, Packet, PubAck, Publish, QoS, StatusCode};
use crate::transport::FrameIo;

impl<T: FrameIo> Connection<T> {
    pub(crate) async fn handle_publish(&mut self, publish: Publish) {
        let Some(client_id) = self.client_id() else {
            self.ack_publish(publish.packet_id.as_deref(), StatusCode::NotAllowed, None);
            return;
        };
        let Some(channel) = validate_channel(&publish.channel).map(str::to_string) else {
            self.ack_publish(publish.packet_id.as_deref(), StatusCode::InvalidChannel, None);
            return;
        };

        if ChannelKind::of(&channel) == ChannelKind::Control {
            let response = match self
                .engine
                .capabilities()
                .control
                .handle_control(&client_id, &channel, &publish.data, &self.remote)
                .await
            {
                Ok(response) => response,
                Err(e) => {
                    warn!("Control handler failed on {}: {}", channel, e);
                    ControlResponse {
                        status: StatusCode::ServerError,
                        data: None,
                    }
                }
            };
            if self.writer.is_alive() {
                self.ack_publish(publish.packet_id.as_deref(), response.status, response.data);
            }
            return;
        }

        let status = match self
            .engine
            .capabilities()
            .publish
            .validate_pub(&client_id, &channel, &publish.data, publish.qos, &self.remote)
            .await
        {
            Ok(status) => status,
            Err(e) => {
                warn!("Publish validator failed for {}: {}", client_id, e);
                StatusCode::ServerError
            }
        };
        if !self.writer.is_alive() {
            return;
        }

        let status = if status.is_ok() {
            self.engine
                .publish(&client_id, &channel, &publish.data, publish.qos, publish.retain)
                .await
        } else {
            debug!("Publish of {} on {} rejected: {:?}", client_id, channel, status);
            status
        };

        if publish.qos == QoS::AtLeastOnce {
            self.ack_publish(publish.packet_id.as_deref(), status, None);
        }
    }

    /// pubAck echoing the client's packet id; without an id there is nothing to answer
    fn ack_publish(&self, packet_id: Option<&str>, status: StatusCode, data: Option<serde_json::Value>) {
        let Some(packet_id) = packet_id else {
            debug!("Publish from {} without packet id, no pubAck", self.remote);
            return;
        };
        self.reply(Packet::PubAck(PubAck {
            status,
            packet_id: packet_id.to_string(),
            data,
        }));
    }
}
