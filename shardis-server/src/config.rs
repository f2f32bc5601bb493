use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::cluster::ClusterConfig;
use crate::core::KVConfig;

/// Main server configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub server: Server,
    pub kv_store: KVStoreConfig,
    pub logging: LoggingConfig,
    pub persistence: PersistenceConfig,
    pub cluster: ClusterConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Server {
    pub host: String,
    /// RESP port
    pub port: u16,
    /// Password clients (and peers) must send with `AUTH`
    pub requirepass: Option<String>,
    /// HTTP port for health and metrics in standalone mode; cluster nodes
    /// serve HTTP on the raft listen address
    pub http_port: u16,
}

impl Default for Server {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 6399,
            requirepass: None,
            http_port: 15500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KVStoreConfig {
    pub ttl_cleanup_interval_ms: u64,
    pub lock_shards: usize,
    pub write_feed_capacity: usize,
}

impl Default for KVStoreConfig {
    fn default() -> Self {
        let kv = KVConfig::default();
        Self {
            ttl_cleanup_interval_ms: kv.ttl_cleanup_interval_ms,
            lock_shards: kv.lock_shards,
            write_feed_capacity: kv.write_feed_capacity,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// `json` or `pretty`
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "json".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub enabled: bool,
    pub data_dir: PathBuf,
    pub snapshot_file: String,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            data_dir: PathBuf::from("./data"),
            snapshot_file: "dump.json".to_string(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: ServerConfig = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Convert to KVConfig
    pub fn to_kv_config(&self) -> KVConfig {
        KVConfig {
            ttl_cleanup_interval_ms: self.kv_store.ttl_cleanup_interval_ms,
            lock_shards: self.kv_store.lock_shards,
            write_feed_capacity: self.kv_store.write_feed_capacity,
        }
    }

    /// Get server address
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    pub fn http_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.http_port)
    }

    /// Engine snapshot location, if persistence is on
    pub fn snapshot_path(&self) -> Option<PathBuf> {
        self.persistence
            .enabled
            .then(|| self.persistence.data_dir.join(&self.persistence.snapshot_file))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::StartMode;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.server_addr(), "0.0.0.0:6399");
        assert!(!config.cluster.enabled);
        assert_eq!(
            config.snapshot_path(),
            Some(PathBuf::from("./data").join("dump.json"))
        );
        assert_eq!(config.to_kv_config().lock_shards, 1024);
    }

    #[test]
    fn test_partial_yaml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "server:\n  port: 7000\n  requirepass: secret\nlogging:\n  format: pretty\npersistence:\n  enabled: false\ncluster:\n  enabled: true\n  self_addr: 10.0.0.2:7000\n  start_mode: join\n  join_target: 10.0.0.1:7000\n  node_timeout_ms: 2000\n"
        )
        .unwrap();

        let config = ServerConfig::from_file(file.path()).unwrap();
        assert_eq!(config.server.port, 7000);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.requirepass.as_deref(), Some("secret"));
        assert_eq!(config.logging.format, "pretty");
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.snapshot_path(), None);

        assert!(config.cluster.enabled);
        assert_eq!(config.cluster.self_addr, "10.0.0.2:7000");
        assert_eq!(config.cluster.start_mode, StartMode::Join);
        assert_eq!(config.cluster.join_target.as_deref(), Some("10.0.0.1:7000"));
        assert_eq!(config.cluster.node_timeout().as_millis(), 2000);
        assert_eq!(config.cluster.heartbeat_interval_ms, 500);
    }

    #[test]
    fn test_missing_file() {
        assert!(ServerConfig::from_file("/nonexistent/shardis.yml").is_err());
    }
}
