//! sub and unsub handling

use tracing::{debug, warn};

use super::Connection;
use crate::protocol::{
    validate_channel, ChannelKind, Packet, StatusCode, SubAck, Subscribe, UnsubAck, Unsubscribe,
};
use crate::transport::FrameIo;

impl<T: FrameIo> Connection<T> {
    pub(crate) async fn handle_subscribe(&mut self, sub: Subscribe) {
        let Some(client_id) = self.client_id() else {
            self.reply(sub_ack(StatusCode::NotAllowed, &sub.channel));
            return;
        };
        let Some(channel) = validate_channel(&sub.channel).map(str::to_string) else {
            self.reply(sub_ack(StatusCode::InvalidChannel, &sub.channel));
            return;
        };

        let status = match self
            .engine
            .capabilities()
            .sub
            .validate_sub(&client_id, &channel, sub.persistent, &self.remote)
            .await
        {
            Ok(status) => status,
            Err(e) => {
                warn!("Subscription validator failed for {}: {}", client_id, e);
                StatusCode::ServerError
            }
        };
        if !self.writer.is_alive() {
            return;
        }

        let status = if !status.is_ok() {
            debug!("Subscription of {} to {} rejected: {:?}", client_id, channel, status);
            status
        } else if ChannelKind::of(&channel) != ChannelKind::Plain {
            warn!(
                "Security warning: {} tried to subscribe to reserved channel {}",
                client_id, channel
            );
            StatusCode::NotAllowed
        } else {
            self.engine
                .subscribe(&client_id, &channel, sub.persistent)
                .await
        };

        self.reply(sub_ack(status, &channel));
        if status.is_ok() {
            self.engine
                .send_retained(&self.writer, std::slice::from_ref(&channel))
                .await;
        }
    }

    pub(crate) async fn handle_unsubscribe(&mut self, unsub: Unsubscribe) {
        let Some(client_id) = self.client_id() else {
            self.reply(unsub_ack(StatusCode::NotAllowed, &unsub.channel));
            return;
        };
        let Some(channel) = validate_channel(&unsub.channel).map(str::to_string) else {
            self.reply(unsub_ack(StatusCode::InvalidChannel, &unsub.channel));
            return;
        };

        let status = match self
            .engine
            .capabilities()
            .unsub
            .validate_unsub(&client_id, &channel, &self.remote)
            .await
        {
            Ok(status) => status,
            Err(e) => {
                warn!("Unsubscription validator failed for {}: {}", client_id, e);
                StatusCode::ServerError
            }
        };
        if !self.writer.is_alive() {
            return;
        }

        let status = if !status.is_ok() {
            debug!("Unsubscription of {} from {} rejected: {:?}", client_id, channel, status);
            status
        } else if ChannelKind::of(&channel) != ChannelKind::Plain {
            warn!(
                "Security warning: {} tried to unsubscribe from reserved channel {}",
                client_id, channel
            );
            StatusCode::NotAllowed
        } else {
            self.engine.unsubscribe(&client_id, &channel).await
        };

        self.reply(unsub_ack(status, &channel));
    }
}

fn sub_ack(status: StatusCode, channel: &str) -> Packet {
    Packet::SubAck(SubAck {
        status,
        channel: channel.to_string(),
    })
}

fn unsub_ack(status: StatusCode, channel: &str) -> Packet {
    Packet::UnsubAck(UnsubAck {
        status,
        channel: channel.to_string(),
    })
}
