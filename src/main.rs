//! JMQT - publish/subscribe broker speaking NUL-terminated JSON
//!
//! Usage:
//!   jmqt [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>    Configuration file path (default: jmqt.toml)
//!   -b, --bind <ADDR>      TCP bind address (default: 0.0.0.0:4000)
//!   --ws-bind <ADDR>       WebSocket bind address
//!   -l, --log-level        Log level (error, warn, info, debug, trace)
//!   -h, --help             Print help

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use jmqt::acl::ChannelAcl;
use jmqt::auth::TokenAuthenticator;
use jmqt::broker::{Broker, BrokerConfig};
use jmqt::cluster::ClusterTransport;
use jmqt::config::{Config, RelayMode};
use jmqt::control::{ControlChannels, LogNotifier};
use jmqt::hooks::Capabilities;
use jmqt::persistence::open_backend;
use jmqt::relay::RelayTransport;

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
    Warn,
    /// Informational messages
    Info,
    /// Debug messages
    Debug,
    /// Trace messages (very verbose)
    Trace,
}

impl LogLevel {
    fn as_directive(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// JMQT - publish/subscribe broker
#[derive(Parser, Debug)]
#[command(name = "jmqt")]
#[command(version)]
#[command(about = "Publish/subscribe broker speaking NUL-terminated JSON")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long, default_value = "jmqt.toml")]
    config: PathBuf,

    /// TCP bind address
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// WebSocket bind address
    #[arg(long)]
    ws_bind: Option<SocketAddr>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // A missing default file is fine; an explicit path that fails is not
    let config = if args.config.exists() {
        Config::load(&args.config)
    } else {
        Config::from_env()
    };
    let mut config = match config {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading config: {}", e);
            std::process::exit(1);
        }
    };

    // CLI beats RUST_LOG, RUST_LOG beats the config file
    let filter = match args.log_level {
        Some(level) => EnvFilter::new(level.as_directive()),
        None => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(&config.log.level)),
    };
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if args.config.exists() {
        info!("Loaded configuration from {}", args.config.display());
    }

    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }
    if let Some(ws_bind) = args.ws_bind {
        config.server.ws_bind = Some(ws_bind);
    }

    let broker_config = BrokerConfig::from_config(&config);

    info!("Starting JMQT broker {}", broker_config.instance_id);
    info!("  Bind address: {}", broker_config.bind);
    if let Some(addr) = &broker_config.tls_bind {
        info!("  TLS address: {}", addr);
    }
    if let Some(addr) = &broker_config.ws_bind {
        info!("  WebSocket address: {}", addr);
    }
    if let Some(addr) = &broker_config.wss_bind {
        info!("  TLS WebSocket address: {}", addr);
    }
    info!("  Session timeout: {:?}", broker_config.timeout);
    if config.auth.enabled {
        info!(
            "  Authentication: enabled ({} users configured)",
            config.auth.users.len()
        );
    } else {
        info!("  Authentication: disabled");
    }
    if config.acl.enabled {
        info!("  ACL: enabled ({} roles configured)", config.acl.roles.len());
    } else {
        info!("  ACL: disabled");
    }

    let store = open_backend(&config.persistence)?;

    let auth = Arc::new(TokenAuthenticator::new(&config.auth));
    let acl = Arc::new(ChannelAcl::new(&config.acl, auth.clone()));
    let notifier = Arc::new(LogNotifier);
    let caps = Capabilities::builder()
        .auth_validator(auth.clone())
        .connection_validator(auth)
        .subscription_validator(acl.clone())
        .unsubscription_validator(acl.clone())
        .publish_validator(acl)
        .control_handler(Arc::new(ControlChannels::new(store.clone())))
        .disconnection_notifier(notifier.clone())
        .connection_close_notifier(notifier)
        .build()?;

    let relay: Option<Arc<dyn RelayTransport>> = match config.relay.mode {
        RelayMode::Disabled => {
            info!("  Relay: disabled");
            None
        }
        RelayMode::Cluster => {
            info!(
                "  Relay: cluster (gossip={}, peer={})",
                config.cluster.gossip_addr, config.cluster.peer_addr
            );
            if !config.cluster.seeds.is_empty() {
                info!("    Seeds: {}", config.cluster.seeds.join(", "));
            }
            let transport =
                ClusterTransport::start(&config.cluster, &broker_config.instance_id).await?;
            Some(Arc::new(transport))
        }
    };

    let broker = Broker::with_backends(broker_config, caps, store, relay).await?;

    tokio::select! {
        result = broker.run() => {
            if let Err(e) = result {
                error!("Broker stopped: {}", e);
                broker.shutdown().await;
                return Err(e.into());
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl-C");
        }
    }

    broker.shutdown().await;
    Ok(())
}
