//! Store configuration

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Configuration for a care store instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path to the SQLite database file
    pub db_path: String,
    /// Replica id to use on first open (generated when absent)
    pub replica_id: Option<Uuid>,
    /// Maximum number of connections in the pool
    pub max_connections: u32,
    /// Whether to enable WAL mode
    pub enable_wal: bool,
    /// Whether freed pages are overwritten on delete
    pub enable_secure_delete: bool,
    /// Schedule a background sync after every successful local write
    pub auto_sync: bool,
    /// Capacity of the change and sync-event broadcast channels
    pub watch_buffer: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: "carestore.db".to_string(),
            replica_id: None,
            max_connections: 5,
            enable_wal: true,
            enable_secure_delete: true,
            auto_sync: true,
            watch_buffer: 256,
        }
    }
}

impl StoreConfig {
    /// Load configuration from the environment (and a `.env` file if present).
    ///
    /// Missing or unparseable variables fall back to the defaults.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        let defaults = Self::default();

        let db_path = std::env::var("CARESTORE_DB_PATH").unwrap_or(defaults.db_path);

        let replica_id = std::env::var("CARESTORE_REPLICA_ID")
            .ok()
            .and_then(|s| Uuid::parse_str(&s).ok());

        let max_connections = std::env::var("CARESTORE_MAX_CONNECTIONS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.max_connections);

        let enable_wal = std::env::var("CARESTORE_ENABLE_WAL")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.enable_wal);

        let enable_secure_delete = std::env::var("CARESTORE_SECURE_DELETE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.enable_secure_delete);

        let auto_sync = std::env::var("CARESTORE_AUTO_SYNC")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.auto_sync);

        let watch_buffer = std::env::var("CARESTORE_WATCH_BUFFER")
            .ok()
            .and_then(|s| s.parse().ok())
            .filter(|n: &usize| *n > 0)
            .unwrap_or(defaults.watch_buffer);

        Self {
            db_path,
            replica_id,
            max_connections,
            enable_wal,
            enable_secure_delete,
            auto_sync,
            watch_buffer,
        }
    }

    /// Configuration for a store that lives only in memory.
    pub fn in_memory() -> Self {
        Self {
            db_path: String::new(),
            auto_sync: false,
            ..Self::default()
        }
    }

    pub fn with_replica_id(mut self, replica_id: Uuid) -> Self {
        self.replica_id = Some(replica_id);
        self
    }

    pub fn with_auto_sync(mut self, auto_sync: bool) -> Self {
        self.auto_sync = auto_sync;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = StoreConfig::default();
        assert_eq!(config.max_connections, 5);
        assert!(config.enable_wal);
        assert!(config.replica_id.is_none());
        assert!(config.watch_buffer > 0);
    }

    #[test]
    fn test_in_memory_disables_auto_sync() {
        let replica = Uuid::new_v4();
        let config = StoreConfig::in_memory().with_replica_id(replica);
        assert!(!config.auto_sync);
        assert_eq!(config.replica_id, Some(replica));
    }
}
