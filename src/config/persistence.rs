//! Persistence configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// Backend type for persistence
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    /// In-process maps, lost on restart
    #[default]
    Memory,
    /// Fjall (local LSM-tree storage)
    Fjall,
}

fn default_reconcile_interval() -> Duration {
    Duration::from_secs(16)
}

/// Persistence configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Backend type
    pub backend: BackendType,

    /// Data directory path (for fjall)
    pub path: PathBuf,

    /// How often unreferenced pending packets are reclaimed (e.g. "16s")
    #[serde(default = "default_reconcile_interval", with = "humantime_serde")]
    pub reconcile_interval: Duration,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            backend: BackendType::Memory,
            path: PathBuf::from("./data"),
            reconcile_interval: default_reconcile_interval(),
        }
    }
}
