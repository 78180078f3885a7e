//! Hooks Module
//!
//! The embedder plugs its policy into the broker through eight
//! capabilities: validators for auth, conn, sub, unsub and pub, a
//! control-channel handler and two notifiers. All of them are mandatory;
//! [`CapabilitiesBuilder::build`] refuses to produce a set with a gap.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::info;

use crate::control::ControlChannels;
use crate::persistence::StorageBackend;
use crate::protocol::{QoS, StatusCode, Transport};


/// Hook error types
#[derive(Debug)]
pub enum HookError {
    /// The capability failed while deciding
    Internal(String),
    /// A required capability was not supplied
    MissingCapability(&'static str),
}

impl fmt::Display for HookError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookError::Internal(msg) => write!(f, "Internal error: {}", msg),
            HookError::MissingCapability(name) => write!(f, "Missing capability: {}", name),
        }
    }
}

impl std::error::Error for HookError {}

/// Hook result type
pub type HookResult<T> = Result<T, HookError>;

/// Where a client is connected from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteInfo {
    pub addr: SocketAddr,
    pub transport: Transport,
}

impl RemoteInfo {
    pub fn new(addr: SocketAddr, transport: Transport) -> Self {
        Self { addr, transport }
    }
}

impl fmt::Display for RemoteInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.addr, self.transport)
    }
}

/// Outcome of an authentication attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthResponse {
    pub status: StatusCode,
    pub client_id: String,
    pub token: String,
    /// Reason shown to the client when `status` is not OK
    pub message: String,
}

impl AuthResponse {
    pub fn ok(client_id: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            status: StatusCode::Ok,
            client_id: client_id.into(),
            token: token.into(),
            message: String::new(),
        }
    }

    pub fn rejected(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            client_id: String::new(),
            token: String::new(),
            message: message.into(),
        }
    }
}

/// Answer of the control-channel handler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlResponse {
    pub status: StatusCode,
    pub data: Option<Value>,
}

impl ControlResponse {
    pub fn ok(data: Value) -> Self {
        Self {
            status: StatusCode::Ok,
            data: Some(data),
        }
    }

    pub fn failed() -> Self {
        Self {
            status: StatusCode::Failed,
            data: None,
        }
    }
}

/// Decides whether an `auth` request yields a client id and token
#[async_trait]
pub trait AuthValidator: Send + Sync {
    async fn validate_auth(&self, data: &Value, remote: &RemoteInfo) -> HookResult<AuthResponse>;
}

/// Decides whether a `conn` request with a previously issued token may proceed
#[async_trait]
pub trait ConnectionValidator: Send + Sync {
    async fn validate_conn(
        &self,
        client_id: &str,
        token: &str,
        remote: &RemoteInfo,
    ) -> HookResult<StatusCode>;
}

#[async_trait]
pub trait SubscriptionValidator: Send + Sync {
    async fn validate_sub(
        &self,
        client_id: &str,
        channel: &str,
        persistent: bool,
        remote: &RemoteInfo,
    ) -> HookResult<StatusCode>;
}

#[async_trait]
pub trait UnsubscriptionValidator: Send + Sync {
    async fn validate_unsub(
        &self,
        client_id: &str,
        channel: &str,
        remote: &RemoteInfo,
    ) -> HookResult<StatusCode>;
}

#[async_trait]
pub trait PublishValidator: Send + Sync {
    async fn validate_pub(
        &self,
        client_id: &str,
        channel: &str,
        data: &Value,
        qos: QoS,
        remote: &RemoteInfo,
    ) -> HookResult<StatusCode>;
}

/// Answers publishes on `$` channels; the returned data travels back in the pubAck
#[async_trait]
pub trait ControlChannelHandler: Send + Sync {
    async fn handle_control(
        &self,
        client_id: &str,
        channel: &str,
        data: &Value,
        remote: &RemoteInfo,
    ) -> HookResult<ControlResponse>;
}

/// Fired when a client sends `disconn`
#[async_trait]
pub trait DisconnectionNotifier: Send + Sync {
    async fn on_disconnect(&self, client_id: &str, remote: &RemoteInfo);
}

/// Fired whenever a connected client's transport goes away
#[async_trait]
pub trait ConnectionCloseNotifier: Send + Sync {
    async fn on_connection_close(&self, client_id: &str, remote: &RemoteInfo);
}

/// The complete capability set handed to the broker
#[derive(Clone)]
pub struct Capabilities {
    pub auth: Arc<dyn AuthValidator>,
    pub conn: Arc<dyn ConnectionValidator>,
    pub sub: Arc<dyn SubscriptionValidator>,
    pub unsub: Arc<dyn UnsubscriptionValidator>,
    pub publish: Arc<dyn PublishValidator>,
    pub control: Arc<dyn ControlChannelHandler>,
    pub disconnect: Arc<dyn DisconnectionNotifier>,
    pub connection_close: Arc<dyn ConnectionCloseNotifier>,
}

impl Capabilities {
    pub fn builder() -> CapabilitiesBuilder {
        CapabilitiesBuilder::default()
    }
}

impl fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Capabilities").finish_non_exhaustive()
    }
}

/// Collects capabilities one by one
#[derive(Default)]
pub struct CapabilitiesBuilder {
    auth: Option<Arc<dyn AuthValidator>>,
    conn: Option<Arc<dyn ConnectionValidator>>,
    sub: Option<Arc<dyn SubscriptionValidator>>,
    unsub: Option<Arc<dyn UnsubscriptionValidator>>,
    publish: Option<Arc<dyn PublishValidator>>,
    control: Option<Arc<dyn ControlChannelHandler>>,
    disconnect: Option<Arc<dyn DisconnectionNotifier>>,
    connection_close: Option<Arc<dyn ConnectionCloseNotifier>>,
}

impl CapabilitiesBuilder {
    /// Use one object for every capability
    pub fn with_all<H>(self, hooks: Arc<H>) -> Self
    where
        H: AuthValidator
            + ConnectionValidator
            + SubscriptionValidator
            + UnsubscriptionValidator
            + PublishValidator
            + ControlChannelHandler
            + DisconnectionNotifier
            + ConnectionCloseNotifier
            + 'static,
    {
        self.auth_validator(hooks.clone())
            .connection_validator(hooks.clone())
            .subscription_validator(hooks.clone())
            .unsubscription_validator(hooks.clone())
            .publish_validator(hooks.clone())
            .control_handler(hooks.clone())
            .disconnection_notifier(hooks.clone())
            .connection_close_notifier(hooks)
    }

    pub fn auth_validator(mut self, hook: Arc<dyn AuthValidator>) -> Self {
        self.auth = Some(hook);
        self
    }

    pub fn connection_validator(mut self, hook: Arc<dyn ConnectionValidator>) -> Self {
        self.conn = Some(hook);
        self
    }

    pub fn subscription_validator(mut self, hook: Arc<dyn SubscriptionValidator>) -> Self {
        self.sub = Some(hook);
        self
    }

    pub fn unsubscription_validator(mut self, hook: Arc<dyn UnsubscriptionValidator>) -> Self {
        self.unsub = Some(hook);
        self
    }

    pub fn publish_validator(mut self, hook: Arc<dyn PublishValidator>) -> Self {
        self.publish = Some(hook);
        self
    }

    pub fn control_handler(mut self, hook: Arc<dyn ControlChannelHandler>) -> Self {
        self.control = Some(hook);
        self
    }

    pub fn disconnection_notifier(mut self, hook: Arc<dyn DisconnectionNotifier>) -> Self {
        self.disconnect = Some(hook);
        self
    }

    pub fn connection_close_notifier(mut self, hook: Arc<dyn ConnectionCloseNotifier>) -> Self {
        self.connection_close = Some(hook);
        self
    }

    /// Fails with the name of the first capability that is missing
    pub fn build(self) -> HookResult<Capabilities> {
        Ok(Capabilities {
            auth: self
                .auth
                .ok_or(HookError::MissingCapability("authentication validator"))?,
            conn: self
                .conn
                .ok_or(HookError::MissingCapability("connection validator"))?,
            sub: self
                .sub
                .ok_or(HookError::MissingCapability("subscription validator"))?,
            unsub: self
                .unsub
                .ok_or(HookError::MissingCapability("unsubscription validator"))?,
            publish: self
                .publish
                .ok_or(HookError::MissingCapability("publish validator"))?,
            control: self
                .control
                .ok_or(HookError::MissingCapability("control channel handler"))?,
            disconnect: self
                .disconnect
                .ok_or(HookError::MissingCapability("disconnection notifier"))?,
            connection_close: self
                .connection_close
                .ok_or(HookError::MissingCapability("connection close notifier"))?,
        })
    }
}

/// Permissive capability set.
///
/// Authenticates any client that names itself with `client_name`, allows
/// every channel operation and only logs notifications.
#[derive(Default)]
pub struct AllowAll {
    control: Option<ControlChannels>,
}

impl AllowAll {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer `$mySubscriptions` from the given store
    pub fn with_store(store: Arc<dyn StorageBackend>) -> Self {
        Self {
            control: Some(ControlChannels::new(store)),
        }
    }

    /// Shorthand for a capability set made only of this object
    pub fn capabilities(self) -> Capabilities {
        let hooks = Arc::new(self);
        Capabilities {
            auth: hooks.clone(),
            conn: hooks.clone(),
            sub: hooks.clone(),
            unsub: hooks.clone(),
            publish: hooks.clone(),
            control: hooks.clone(),
            disconnect: hooks.clone(),
            connection_close: hooks,
        }
    }
}

#[async_trait]
impl AuthValidator for AllowAll {
    async fn validate_auth(&self, data: &Value, _remote: &RemoteInfo) -> HookResult<AuthResponse> {
        match data.get("client_name") {
            Some(Value::String(name)) if !name.trim().is_empty() => Ok(AuthResponse::ok(
                name.trim(),
                uuid::Uuid::new_v4().to_string(),
            )),
            Some(Value::Number(n)) => Ok(AuthResponse::ok(
                n.to_string(),
                uuid::Uuid::new_v4().to_string(),
            )),
            _ => Ok(AuthResponse::rejected(
                StatusCode::InvalidPacket,
                "Invalid auth data, client_name is missing",
            )),
        }
    }
}

#[async_trait]
impl ConnectionValidator for AllowAll {
    async fn validate_conn(&self, _: &str, _: &str, _: &RemoteInfo) -> HookResult<StatusCode> {
        Ok(StatusCode::Ok)
    }
}

#[async_trait]
impl SubscriptionValidator for AllowAll {
    async fn validate_sub(&self, _: &str, _: &str, _: bool, _: &RemoteInfo) -> HookResult<StatusCode> {
        Ok(StatusCode::Ok)
    }
}

#[async_trait]
impl UnsubscriptionValidator for AllowAll {
    async fn validate_unsub(&self, _: &str, _: &str, _: &RemoteInfo) -> HookResult<StatusCode> {
        Ok(StatusCode::Ok)
    }
}

#[async_trait]
impl PublishValidator for AllowAll {
    async fn validate_pub(
        &self,
        _: &str,
        _: &str,
        _: &Value,
        _: QoS,
        _: &RemoteInfo,
    ) -> HookResult<StatusCode> {
        Ok(StatusCode::Ok)
    }
}

#[async_trait]
impl ControlChannelHandler for AllowAll {
    async fn handle_control(
        &self,
        client_id: &str,
        channel: &str,
        data: &Value,
        remote: &RemoteInfo,
    ) -> HookResult<ControlResponse> {
        match &self.control {
            Some(control) => control.handle_control(client_id, channel, data, remote).await,
            None => Ok(ControlResponse::failed()),
        }
    }
}

#[async_trait]
impl DisconnectionNotifier for AllowAll {
    async fn on_disconnect(&self, client_id: &str, remote: &RemoteInfo) {
        info!("Client {} disconnected from {}", client_id, remote);
    }
}

#[async_trait]
impl ConnectionCloseNotifier for AllowAll {
    async fn on_connection_close(&self, client_id: &str, remote: &RemoteInfo) {
        info!("Connection of client {} closed ({})", client_id, remote);
    }
}
