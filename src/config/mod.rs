//! Configuration Module
//!
//! Provides TOML-based configuration for jmqt with support for:
//! - Listener addresses (plain TCP, TLS, WebSocket, secure WebSocket)
//! - Session timeout and automatic peer-to-peer subscriptions
//! - Frame and connection limits
//! - Persistence backend and reconciliation
//! - Relay mode and cluster membership
//! - Authentication and channel ACLs
//! - Environment variable overrides (JMQT__* prefix)

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

pub use cluster::ClusterConfig;
pub use persistence::{BackendType, PersistenceConfig};

mod cluster;
mod persistence;

/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> String {
    let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}").unwrap();
    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .to_string()
}


/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Config crate error
    Config(config::ConfigError),
    /// Validation error
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub log: LogConfig,
    /// Listener configuration
    pub server: ServerConfig,
    /// Session configuration
    pub session: SessionConfig,
    /// Frame and connection limits
    pub limits: LimitsConfig,
    /// Store backend
    pub persistence: PersistenceConfig,
    /// Cross-instance relay
    pub relay: RelayConfig,
    /// Cluster membership, used when `relay.mode = "cluster"`
    pub cluster: ClusterConfig,
    /// Authentication configuration
    pub auth: AuthConfig,
    /// Channel ACL configuration
    pub acl: AclConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Listener configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Plain TCP bind address
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,
    /// TLS bind address (optional)
    pub tls_bind: Option<SocketAddr>,
    /// WebSocket bind address (optional)
    pub ws_bind: Option<SocketAddr>,
    /// Secure WebSocket bind address (optional)
    pub wss_bind: Option<SocketAddr>,
    /// Certificate and key, required when `tls_bind` or `wss_bind` is set
    pub tls: Option<ServerTlsConfig>,
}

/// TLS configuration for the server
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ServerTlsConfig {
    /// Path to certificate chain (PEM format)
    pub cert: String,
    /// Path to private key (PEM format)
    pub key: String,
}

fn default_bind() -> SocketAddr {
    "0.0.0.0:4000".parse().unwrap()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            tls_bind: None,
            ws_bind: None,
            wss_bind: None,
            tls: None,
        }
    }
}

/// Session configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Inactivity window; also announced to clients in connAck
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Force-subscribe each client to its persistent `#<client_id>` channel on connect
    pub auto_p2p_channel: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            auto_p2p_channel: false,
        }
    }
}

/// Frame and connection limits
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Longest unterminated frame accepted before the connection is dropped
    pub max_frame_size: usize,
    /// Maximum concurrent connections (0 = unbounded)
    pub max_connections: usize,
    /// Outbound frames a connection may have waiting before it is dropped
    /// (0 = unbounded)
    pub max_queued_frames: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_frame_size: crate::codec::DEFAULT_MAX_FRAME_SIZE,
            max_connections: 0,
            max_queued_frames: 1000,
        }
    }
}

/// How publishes and subscription changes reach other broker instances
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayMode {
    /// Single instance, delivery stays in-process
    #[default]
    Disabled,
    /// Gossip membership plus TCP peer links
    Cluster,
}

/// Relay configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub mode: RelayMode,
    /// Instance tag used to ignore our own relayed events; a uuid is generated when absent
    pub instance_id: Option<String>,
}

impl RelayConfig {
    /// Resolve the instance id, generating one when none is configured.
    pub fn resolve_instance_id(&self) -> String {
        match &self.instance_id {
            Some(id) if !id.is_empty() => id.clone(),
            _ => uuid::Uuid::new_v4().to_string(),
        }
    }
}

/// Authentication configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Whether passwords are checked on `auth`
    pub enabled: bool,
    /// Allow clients that are not in the user list when auth is enabled
    pub allow_anonymous: bool,
    /// Static user list
    pub users: Vec<UserConfig>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            allow_anonymous: true,
            users: Vec::new(),
        }
    }
}

/// User configuration
#[derive(Debug, Clone, Deserialize)]
pub struct UserConfig {
    /// Client name, becomes the client id on a successful auth
    pub client_name: String,
    /// Password (plaintext) - use password_hash for production
    #[serde(default)]
    pub password: Option<String>,
    /// Password hash (argon2 PHC format: $argon2id$v=19$...)
    #[serde(default)]
    pub password_hash: Option<String>,
    /// Role name for ACL permissions
    #[serde(default)]
    pub role: Option<String>,
}

/// ACL configuration
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AclConfig {
    /// Whether role patterns are enforced
    pub enabled: bool,
    /// ACL roles
    pub roles: Vec<AclRole>,
    /// Permissions for clients without a role (including anonymous)
    pub default: AclPermissions,
    /// Channels no client may sub/unsub/pub, checked even when `enabled` is false
    pub reserved: Vec<String>,
}

/// ACL role
#[derive(Debug, Clone, Deserialize)]
pub struct AclRole {
    /// Role name
    pub name: String,
    /// Channel patterns this role can publish to
    #[serde(default)]
    pub publish: Vec<String>,
    /// Channel patterns this role can subscribe to
    #[serde(default)]
    pub subscribe: Vec<String>,
}

/// ACL permissions
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AclPermissions {
    /// Channel patterns that can be published to
    pub publish: Vec<String>,
    /// Channel patterns that can be subscribed to
    pub subscribe: Vec<String>,
}

impl Config {
    /// Load configuration from a TOML file with environment variable overrides.
    ///
    /// Supports two forms of environment variable usage:
    /// 1. In-file substitution: `${VAR}` or `${VAR:-default}` syntax in the TOML file
    /// 2. Override via env vars: `JMQT__` prefix with double underscores for nesting:
    ///    - `JMQT__SERVER__BIND=0.0.0.0:4001` overrides `server.bind`
    ///    - `JMQT__SESSION__TIMEOUT=45s` overrides `session.timeout`
    ///    - `JMQT__RELAY__MODE=cluster` overrides `relay.mode`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            .set_default("log.level", "info")?
            .set_default("server.bind", "0.0.0.0:4000")?
            .set_default("session.timeout", "30s")?
            .set_default("session.auto_p2p_channel", false)?
            .set_default(
                "limits.max_frame_size",
                crate::codec::DEFAULT_MAX_FRAME_SIZE as u64,
            )?
            .set_default("limits.max_connections", 0)?
            .set_default("limits.max_queued_frames", 1000)?
            .set_default("persistence.backend", "memory")?
            .set_default("persistence.path", "./data")?
            .set_default("persistence.reconcile_interval", "16s")?
            .set_default("relay.mode", "disabled")?
            .set_default("auth.enabled", false)?
            .set_default("auth.allow_anonymous", true)?
            .set_default("acl.enabled", false)?;

        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let substituted = substitute_env_vars(&content);
                builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // File doesn't exist, use defaults
            }
            Err(e) => return Err(ConfigError::Io(e)),
        }

        // Double underscore separates nested keys, single underscore preserved in field names
        let cfg = builder
            .add_source(
                Environment::with_prefix("JMQT")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with environment variable overrides only (no file).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(Path::new(""))
    }

    /// Parse configuration from a string (for testing, no env var support)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session.timeout.is_zero() {
            return Err(ConfigError::Validation(
                "session.timeout must be greater than zero".to_string(),
            ));
        }

        if self.limits.max_frame_size == 0 {
            return Err(ConfigError::Validation(
                "limits.max_frame_size must be greater than zero".to_string(),
            ));
        }

        if self.persistence.reconcile_interval.is_zero() {
            return Err(ConfigError::Validation(
                "persistence.reconcile_interval must be greater than zero".to_string(),
            ));
        }

        if self.persistence.backend == BackendType::Fjall
            && self.persistence.path.as_os_str().is_empty()
        {
            return Err(ConfigError::Validation(
                "persistence.path is required for the fjall backend".to_string(),
            ));
        }

        if self.auth.enabled {
            let mut seen = HashSet::new();
            for user in &self.auth.users {
                if user.client_name.is_empty() {
                    return Err(ConfigError::Validation(
                        "auth.users entries must have a client_name".to_string(),
                    ));
                }
                if !seen.insert(user.client_name.as_str()) {
                    return Err(ConfigError::Validation(format!(
                        "User '{}' is listed more than once",
                        user.client_name
                    )));
                }
                match (&user.password, &user.password_hash) {
                    (None, None) => {
                        return Err(ConfigError::Validation(format!(
                            "User '{}' must have either 'password' or 'password_hash'",
                            user.client_name
                        )));
                    }
                    (Some(_), Some(_)) => {
                        return Err(ConfigError::Validation(format!(
                            "User '{}' cannot have both 'password' and 'password_hash'",
                            user.client_name
                        )));
                    }
                    (Some(pwd), None) if pwd.is_empty() => {
                        return Err(ConfigError::Validation(format!(
                            "User '{}' has empty password",
                            user.client_name
                        )));
                    }
                    (None, Some(hash)) if !hash.starts_with("$argon2") => {
                        return Err(ConfigError::Validation(format!(
                            "User '{}' has invalid password_hash format (must be argon2 PHC format)",
                            user.client_name
                        )));
                    }
                    _ => {}
                }
            }
        }

        if self.auth.enabled && self.acl.enabled {
            let role_names: HashSet<_> = self.acl.roles.iter().map(|r| &r.name).collect();

            for user in &self.auth.users {
                if let Some(ref role) = user.role {
                    if !role_names.contains(role) {
                        return Err(ConfigError::Validation(format!(
                            "User '{}' references unknown role '{}'",
                            user.client_name, role
                        )));
                    }
                }
            }
        }

        if self.server.tls_bind.is_some() || self.server.wss_bind.is_some() {
            match &self.server.tls {
                Some(tls) => {
                    if tls.cert.is_empty() {
                        return Err(ConfigError::Validation(
                            "tls.cert is required when tls_bind or wss_bind is set".to_string(),
                        ));
                    }
                    if tls.key.is_empty() {
                        return Err(ConfigError::Validation(
                            "tls.key is required when tls_bind or wss_bind is set".to_string(),
                        ));
                    }
                }
                None => {
                    return Err(ConfigError::Validation(
                        "tls configuration is required when tls_bind or wss_bind is set"
                            .to_string(),
                    ));
                }
            }
        }

        if self.relay.mode == RelayMode::Cluster && self.cluster.cluster_id.is_empty() {
            return Err(ConfigError::Validation(
                "cluster.cluster_id must not be empty in cluster mode".to_string(),
            ));
        }

        Ok(())
    }

    /// Build a role lookup map for ACL checks
    pub fn build_role_map(&self) -> HashMap<String, &AclRole> {
        self.acl
            .roles
            .iter()
            .map(|role| (role.name.clone(), role))
            .collect()
    }

    /// Build a user lookup map for auth checks
    pub fn build_user_map(&self) -> HashMap<String, &UserConfig> {
        self.auth
            .users
            .iter()
            .map(|user| (user.client_name.clone(), user))
            .collect()
    }
}
