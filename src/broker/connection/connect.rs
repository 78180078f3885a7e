//! auth and conn handling

use std::sync::Arc;

use tracing::{debug, warn};

use super::{Connection, Redelivery, State};
use crate::broker::engine::Retire;
use crate::broker::SendError;
use crate::hooks::AuthResponse;
use crate::protocol::{p2p_channel, Auth, AuthAck, Conn, ConnAck, Packet, StatusCode};
use crate::transport::FrameIo;

impl<T: FrameIo> Connection<T> {
    /// Ask the auth validator for a client id and token.
    ///
    /// Never changes the registered session; only `conn` does.
    pub(crate) async fn handle_auth(&mut self, auth: Auth) {
        let response = match self
            .engine
            .capabilities()
            .auth
            .validate_auth(&auth.data, &self.remote)
            .await
        {
            Ok(response) => response,
            Err(e) => {
                warn!("Auth validator failed for {}: {}", self.remote, e);
                AuthResponse::rejected(StatusCode::ServerError, "server error")
            }
        };

        if !self.writer.is_alive() {
            return;
        }

        let ack = AuthAck {
            status: response.status,
            client_id: response.client_id.clone(),
            token: response.token,
            message: response.message,
        };
        match self.writer.send_packet(&Packet::AuthAck(ack)) {
            Ok(()) => {}
            Err(SendError::Encoding(e)) => {
                warn!("Auth validator returned an unusable response: {}", e);
                self.reply(Packet::AuthAck(AuthAck {
                    status: StatusCode::ServerError,
                    client_id: String::new(),
                    token: String::new(),
                    message: "invalid auth response".to_string(),
                }));
                return;
            }
            Err(SendError::Closed | SendError::QueueFull) => return,
        }

        if response.status.is_ok() {
            debug!("Authenticated {} from {}", response.client_id, self.remote);
            if !matches!(self.state, State::Connected { .. }) {
                self.state = State::Authenticated {
                    client_id: response.client_id,
                };
            }
        } else {
            debug!("Auth rejected for {}: {:?}", self.remote, response.status);
        }
    }

    /// Validate the token, register the session, then dispatch queued and
    /// retained messages
    pub(crate) async fn handle_conn(&mut self, conn: Conn) {
        let timeout = self.engine.config().timeout.as_secs();
        let client_id = conn.client_id.trim().to_string();
        if client_id.is_empty() {
            self.reply(Packet::ConnAck(ConnAck {
                status: StatusCode::InvalidPacket,
                timeout,
            }));
            return;
        }

        let status = match self
            .engine
            .capabilities()
            .conn
            .validate_conn(&client_id, &conn.token, &self.remote)
            .await
        {
            Ok(status) => status,
            Err(e) => {
                warn!("Connection validator failed for {}: {}", client_id, e);
                StatusCode::ServerError
            }
        };

        if !self.writer.is_alive() {
            return;
        }
        if let State::Authenticated { client_id: authenticated } = &self.state {
            if *authenticated != client_id {
                debug!(
                    "{} authenticated as {} but connects as {}",
                    self.remote, authenticated, client_id
                );
            }
        }
        if !status.is_ok() {
            debug!("Connection of {} rejected: {:?}", client_id, status);
            self.reply(Packet::ConnAck(ConnAck { status, timeout }));
            return;
        }

        if let State::Connected { client_id: previous } = &self.state {
            let previous = previous.clone();
            self.engine
                .teardown(&previous, &self.writer, Retire::Reconnect)
                .await;
            self.state = State::Unauthenticated;
            self.redelivery = Redelivery::default();
        }

        let client_id: Arc<str> = Arc::from(client_id);
        let status = self
            .engine
            .register(client_id.clone(), self.writer.clone(), self.remote.clone())
            .await;
        if !status.is_ok() {
            self.reply(Packet::ConnAck(ConnAck { status, timeout }));
            return;
        }
        debug!("Client {} connected from {}", client_id, self.remote);
        self.state = State::Connected {
            client_id: client_id.clone(),
        };

        if self.engine.config().auto_p2p_channel {
            self.engine
                .subscribe(&client_id, &p2p_channel(&client_id), true)
                .await;
        }

        self.load_pending(&client_id).await;

        let channels: Vec<String> = self
            .engine
            .subscriptions(&client_id)
            .await
            .into_iter()
            .map(|(channel, _)| channel)
            .collect();
        self.engine.send_retained(&self.writer, &channels).await;
    }
}
