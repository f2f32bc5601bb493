pub mod cluster;
pub mod config;
pub mod core;
pub mod metrics;
pub mod protocol;
pub mod replication;
pub mod server;

// Re-export commonly used types
pub use cluster::{Cluster, ClusterConfig, ClusterError, ClusterResult, LocalNetwork, StartMode};
pub use config::ServerConfig;
pub use core::{KVConfig, KVStore, ShardisError};
pub use protocol::{CmdLine, Reply, to_cmdline};
pub use replication::ReplicatedStore;
pub use server::{AppState, Connection, Database, RespServer, create_router};
