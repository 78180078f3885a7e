//! JMQT Broker Core
//!
//! The broker accepts client connections on its listeners, hands each one
//! to a connection task and exposes the server-side API
//! (forced subscriptions and publishes, presence queries, shutdown).

mod connection;
mod engine;
mod tls;
mod writer;

pub use connection::ConnectionError;
pub use tls::{load_tls_acceptor, TlsError};
pub use writer::{SendError, SharedWriter};

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use self::connection::Connection;
use self::engine::Engine;
use crate::codec::DEFAULT_MAX_FRAME_SIZE;
use crate::config::{Config, ServerTlsConfig};
use crate::hooks::{Capabilities, RemoteInfo};
use crate::persistence::{MemoryBackend, PersistenceError, Reconciler, StorageBackend};
use crate::protocol::{validate_channel, ChannelKind, QoS, StatusCode, Transport};
use crate::relay::{Relay, RelayError, RelayTransport};
use crate::transport::{configure_stream, FrameIo, StreamIo, WsIo};

/// TLS and WebSocket handshakes must finish within this window
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Broker configuration
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Plain TCP bind address
    pub bind: SocketAddr,
    /// TLS TCP bind address
    pub tls_bind: Option<SocketAddr>,
    /// WebSocket bind address
    pub ws_bind: Option<SocketAddr>,
    /// TLS WebSocket bind address
    pub wss_bind: Option<SocketAddr>,
    /// Certificate and key for the TLS listeners
    pub tls: Option<ServerTlsConfig>,
    /// Inactivity window, announced to clients in connAck
    pub timeout: Duration,
    /// Subscribe every client to its own peer-to-peer channel on connect
    pub auto_p2p_channel: bool,
    /// Maximum unterminated frame size
    pub max_frame_size: usize,
    /// Maximum concurrent connections (0 = unbounded)
    pub max_connections: usize,
    /// Outbound frames a connection may have waiting (0 = unbounded)
    pub max_queued_frames: usize,
    /// Orphaned pending packet reclamation interval
    pub reconcile_interval: Duration,
    /// Identifies this broker in presence records and on the relay
    pub instance_id: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 4000)),
            tls_bind: None,
            ws_bind: None,
            wss_bind: None,
            tls: None,
            timeout: Duration::from_secs(30),
            auto_p2p_channel: false,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_connections: 0,
            max_queued_frames: 1000,
            reconcile_interval: Duration::from_secs(16),
            instance_id: uuid::Uuid::new_v4().to_string(),
        }
    }
}

impl BrokerConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            bind: config.server.bind,
            tls_bind: config.server.tls_bind,
            ws_bind: config.server.ws_bind,
            wss_bind: config.server.wss_bind,
            tls: config.server.tls.clone(),
            timeout: config.session.timeout,
            auto_p2p_channel: config.session.auto_p2p_channel,
            max_frame_size: config.limits.max_frame_size,
            max_connections: config.limits.max_connections,
            max_queued_frames: config.limits.max_queued_frames,
            reconcile_interval: config.persistence.reconcile_interval,
            instance_id: config.relay.resolve_instance_id(),
        }
    }
}

/// Broker startup errors
#[derive(Debug)]
pub enum BrokerError {
    /// A listener could not bind
    Bind { addr: SocketAddr, source: std::io::Error },
    Tls(TlsError),
    Persistence(PersistenceError),
    Relay(RelayError),
}

impl fmt::Display for BrokerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrokerError::Bind { addr, source } => write!(f, "Failed to bind {}: {}", addr, source),
            BrokerError::Tls(e) => write!(f, "TLS error: {}", e),
            BrokerError::Persistence(e) => write!(f, "Persistence error: {}", e),
            BrokerError::Relay(e) => write!(f, "Relay error: {}", e),
        }
    }
}

impl std::error::Error for BrokerError {}

impl From<TlsError> for BrokerError {
    fn from(e: TlsError) -> Self {
        BrokerError::Tls(e)
    }
}

impl From<PersistenceError> for BrokerError {
    fn from(e: PersistenceError) -> Self {
        BrokerError::Persistence(e)
    }
}

impl From<RelayError> for BrokerError {
    fn from(e: RelayError) -> Self {
        BrokerError::Relay(e)
    }
}

/// State shared by the accept loops
#[derive(Clone)]
struct Acceptor {
    engine: Arc<Engine>,
    tls: Option<TlsAcceptor>,
    shutdown: broadcast::Sender<()>,
    connections: Arc<AtomicUsize>,
    max_connections: usize,
}

/// Releases a connection slot when the connection task ends
struct ConnectionSlot(Arc<AtomicUsize>);

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// The JMQT Broker
pub struct Broker {
    config: BrokerConfig,
    engine: Arc<Engine>,
    relay: Option<Arc<Relay>>,
    reconciler: Reconciler,
    tls: Option<TlsAcceptor>,
    shutdown: broadcast::Sender<()>,
    connections: Arc<AtomicUsize>,
}

impl Broker {
    /// Standalone broker with an in-memory store
    pub async fn new(config: BrokerConfig, caps: Capabilities) -> Result<Self, BrokerError> {
        Self::with_backends(config, caps, Arc::new(MemoryBackend::new()), None).await
    }

    /// Broker over the given store, relayed through `relay` when set.
    ///
    /// Clears temporary subscriptions left in the store, starts the relay
    /// reader and the reconciler, and loads the TLS acceptor when a TLS
    /// listener is configured.
    pub async fn with_backends(
        config: BrokerConfig,
        caps: Capabilities,
        store: Arc<dyn StorageBackend>,
        relay: Option<Arc<dyn RelayTransport>>,
    ) -> Result<Self, BrokerError> {
        let tls = if config.tls_bind.is_some() || config.wss_bind.is_some() {
            let tls_config = config.tls.as_ref().ok_or_else(|| {
                TlsError::ConfigError("TLS listener configured without certificate".to_string())
            })?;
            Some(load_tls_acceptor(tls_config)?)
        } else {
            None
        };

        let cleared = store.remove_all_non_persistent().await?;
        if cleared > 0 {
            debug!("Removed {} stale temporary subscriptions", cleared);
        }

        let relay = relay.map(|transport| Arc::new(Relay::new(config.instance_id.clone(), transport)));
        let engine = Arc::new(Engine::new(
            config.clone(),
            caps,
            store.clone(),
            relay.clone(),
        ));
        if let Some(relay) = &relay {
            relay.start(engine.relay_handler()).await?;
        }

        let reconciler = Reconciler::start(store, config.reconcile_interval);
        let (shutdown, _) = broadcast::channel(1);

        info!("Broker instance {} ready", config.instance_id);
        Ok(Self {
            config,
            engine,
            relay,
            reconciler,
            tls,
            shutdown,
            connections: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Bind every configured listener and serve until [`shutdown`](Self::shutdown)
    pub async fn run(&self) -> Result<(), BrokerError> {
        let mut listeners = vec![(self.config.bind, Transport::Socket)];
        listeners.extend(self.config.tls_bind.map(|a| (a, Transport::SslSocket)));
        listeners.extend(self.config.ws_bind.map(|a| (a, Transport::WebSocket)));
        listeners.extend(self.config.wss_bind.map(|a| (a, Transport::SslWebSocket)));

        let mut shutdown_rx = self.shutdown.subscribe();

        let mut bound = Vec::with_capacity(listeners.len());
        for (addr, transport) in listeners {
            let listener = TcpListener::bind(addr)
                .await
                .map_err(|source| BrokerError::Bind { addr, source })?;
            info!("JMQT/{} listening on {}", transport.as_str(), addr);
            bound.push((listener, transport));
        }

        let acceptor = Acceptor {
            engine: self.engine.clone(),
            tls: self.tls.clone(),
            shutdown: self.shutdown.clone(),
            connections: self.connections.clone(),
            max_connections: self.config.max_connections,
        };
        for (listener, transport) in bound {
            tokio::spawn(accept_loop(listener, transport, acceptor.clone()));
        }

        let _ = shutdown_rx.recv().await;
        Ok(())
    }

    // ========================================================================
    // Server-side API
    // ========================================================================

    /// `(channel, persistent)` pairs of a client
    pub async fn get_subscriptions(&self, client_id: &str) -> Vec<(String, bool)> {
        self.engine.subscriptions(client_id).await
    }

    /// Subscribe a client without consulting validators. This is how
    /// peer-to-peer subscriptions are created.
    pub async fn force_sub(&self, client_id: &str, channel: &str, persistent: bool) -> StatusCode {
        let Some(channel) = validate_channel(channel) else {
            return StatusCode::InvalidChannel;
        };
        if ChannelKind::of(channel) == ChannelKind::Control {
            return StatusCode::NotAllowed;
        }
        self.engine.subscribe(client_id, channel, persistent).await
    }

    pub async fn force_unsub(&self, client_id: &str, channel: &str) -> StatusCode {
        let Some(channel) = validate_channel(channel) else {
            return StatusCode::InvalidChannel;
        };
        self.engine.unsubscribe(client_id, channel).await
    }

    /// Publish on behalf of the server; the push carries an empty sender id
    pub async fn force_pub(&self, channel: &str, data: &Value, qos: QoS, retain: bool) -> StatusCode {
        let Some(channel) = validate_channel(channel) else {
            return StatusCode::InvalidChannel;
        };
        if ChannelKind::of(channel) == ChannelKind::Control {
            return StatusCode::NotAllowed;
        }
        self.engine.publish("", channel, data, qos, retain).await
    }

    /// Whether the client holds a session on any instance
    pub async fn is_connected(&self, client_id: &str) -> bool {
        if self.engine.is_registered(client_id) {
            return true;
        }
        match self.engine.store().has_presence(client_id).await {
            Ok(present) => present,
            Err(e) => {
                error!("Failed to read presence of {}: {}", client_id, e);
                false
            }
        }
    }

    /// Sessions registered on this instance
    pub fn local_client_count(&self) -> usize {
        self.engine.peer_count()
    }

    /// Open transport connections, registered or not
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }

    pub fn instance_id(&self) -> &str {
        self.engine.instance_id()
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Stop listeners, connections and background tasks, then flush the store
    pub async fn shutdown(&self) {
        info!("Shutting down broker {}", self.engine.instance_id());
        let _ = self.shutdown.send(());
        for writer in self.engine.writers() {
            writer.close();
        }
        if let Some(relay) = &self.relay {
            relay.shutdown().await;
        }
        self.reconciler.shutdown().await;
        if let Err(e) = self.engine.store().flush().await {
            error!("Failed to flush store: {}", e);
        }
    }
}

async fn accept_loop(listener: TcpListener, transport: Transport, acceptor: Acceptor) {
    let mut shutdown_rx = acceptor.shutdown.subscribe();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    debug!("New {} connection from {}", transport.as_str(), addr);
                    acceptor.spawn_connection(stream, addr, transport);
                }
                Err(e) => error!("Failed to accept {} connection: {}", transport.as_str(), e),
            },
            _ = shutdown_rx.recv() => break,
        }
    }
    debug!("{} accept loop stopped", transport.as_str());
}

impl Acceptor {
    fn spawn_connection(&self, stream: TcpStream, addr: SocketAddr, transport: Transport) {
        let open = self.connections.fetch_add(1, Ordering::Relaxed);
        let slot = ConnectionSlot(self.connections.clone());
        if self.max_connections > 0 && open >= self.max_connections {
            warn!("Connection limit reached, refusing {}", addr);
            return;
        }
        if let Err(e) = configure_stream(&stream) {
            debug!("Failed to configure socket for {}: {}", addr, e);
        }

        let acceptor = self.clone();
        let shutdown_rx = self.shutdown.subscribe();
        tokio::spawn(async move {
            let _slot = slot;
            let remote = RemoteInfo::new(addr, transport);
            if let Err(e) = acceptor.serve(stream, remote, shutdown_rx).await {
                debug!("Connection error from {}: {}", addr, e);
            }
            debug!("Connection from {} closed", addr);
        });
    }

    async fn serve(
        &self,
        stream: TcpStream,
        remote: RemoteInfo,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Result<(), ConnectionError> {
        match remote.transport {
            Transport::Socket => self.drive(StreamIo::new(stream), remote, shutdown_rx).await,
            Transport::WebSocket => {
                let ws = handshake(WsIo::accept(stream)).await?;
                self.drive(ws, remote, shutdown_rx).await
            }
            Transport::SslSocket => {
                let tls = self.tls_accept(stream).await?;
                self.drive(StreamIo::new(tls), remote, shutdown_rx).await
            }
            Transport::SslWebSocket => {
                let tls = self.tls_accept(stream).await?;
                let ws = handshake(WsIo::accept(tls)).await?;
                self.drive(ws, remote, shutdown_rx).await
            }
        }
    }

    async fn tls_accept(
        &self,
        stream: TcpStream,
    ) -> Result<tokio_rustls::server::TlsStream<TcpStream>, ConnectionError> {
        let acceptor = self.tls.as_ref().ok_or_else(|| {
            ConnectionError::Io(std::io::Error::other("TLS acceptor not loaded"))
        })?;
        handshake(acceptor.accept(stream)).await
    }

    async fn drive<T: FrameIo>(
        &self,
        io: T,
        remote: RemoteInfo,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Result<(), ConnectionError> {
        let mut conn = Connection::new(io, remote, self.engine.clone());
        conn.run(shutdown_rx).await
    }
}

async fn handshake<F, T>(fut: F) -> Result<T, ConnectionError>
where
    F: std::future::Future<Output = std::io::Result<T>>,
{
    match tokio::time::timeout(HANDSHAKE_TIMEOUT, fut).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(ConnectionError::Timeout),
    }
}

#[cfg(test)]
mod tests;
