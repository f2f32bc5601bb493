//! Prometheus Metrics for Shardis
//!
//! Metrics collected across the node:
//! - Client commands and their latency
//! - Peer relays
//! - Cross-node transactions
//! - Slot migrations and failovers
//! - Consensus role and term
//! - Replication streams

use lazy_static::lazy_static;
use prometheus::{
    Encoder, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, TextEncoder,
    register_histogram_vec, register_int_counter_vec, register_int_gauge,
    register_int_gauge_vec,
};

lazy_static! {
    // ============================================================================
    // Command Metrics
    // ============================================================================

    /// Commands handled by name and outcome (ok, error)
    pub static ref COMMANDS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "shardis_commands_total",
        "Total number of commands by name and status",
        &["command", "status"]
    ).unwrap();

    /// Command latency in seconds
    pub static ref COMMAND_DURATION: HistogramVec = register_histogram_vec!(
        "shardis_command_duration_seconds",
        "Command latency in seconds",
        &["command"],
        vec![0.00001, 0.0001, 0.001, 0.01, 0.1, 1.0]
    ).unwrap();

    /// Keys held by the local engine
    pub static ref KEYS_TOTAL: IntGauge = register_int_gauge!(
        "shardis_keys_total",
        "Keys currently stored on this node"
    ).unwrap();

    /// Open client connections
    pub static ref CLIENT_CONNECTIONS: IntGauge = register_int_gauge!(
        "shardis_client_connections",
        "Currently open client connections"
    ).unwrap();

    // ============================================================================
    // Cluster Metrics
    // ============================================================================

    /// Commands forwarded to the owning peer
    pub static ref RELAYS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "shardis_relays_total",
        "Total number of commands relayed to peers",
        &["status"]
    ).unwrap();

    /// Cross-node transactions by outcome (committed, rolled_back, timed_out)
    pub static ref TX_TOTAL: IntCounterVec = register_int_counter_vec!(
        "shardis_transactions_total",
        "Total number of cross-node transactions by outcome",
        &["outcome"]
    ).unwrap();

    /// Slot migrations by outcome
    pub static ref MIGRATIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "shardis_migrations_total",
        "Total number of slot migrations by outcome",
        &["outcome"]
    ).unwrap();

    /// Failovers by outcome
    pub static ref FAILOVERS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "shardis_failovers_total",
        "Total number of failovers by outcome",
        &["outcome"]
    ).unwrap();

    /// Consensus role (0=follower, 1=candidate, 2=leader)
    pub static ref RAFT_ROLE: IntGauge = register_int_gauge!(
        "shardis_raft_role",
        "Current consensus role"
    ).unwrap();

    /// Consensus term
    pub static ref RAFT_TERM: IntGauge = register_int_gauge!(
        "shardis_raft_term",
        "Current consensus term"
    ).unwrap();

    /// Slots owned by this node
    pub static ref OWNED_SLOTS: IntGauge = register_int_gauge!(
        "shardis_owned_slots",
        "Number of hash slots owned by this node"
    ).unwrap();

    // ============================================================================
    // Replication Metrics
    // ============================================================================

    /// Commands streamed to or applied from replication peers
    pub static ref REPL_COMMANDS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "shardis_replication_commands_total",
        "Total number of replicated commands by direction",
        &["direction"]
    ).unwrap();

    /// Connected replicas per master
    pub static ref REPL_REPLICAS: IntGaugeVec = register_int_gauge_vec!(
        "shardis_replication_replicas",
        "Replicas currently streaming from this node",
        &["state"]
    ).unwrap();
}

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, Box<dyn std::error::Error>> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = vec![];
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

/// Record a handled command
pub fn record_command(command: &str, ok: bool, duration_secs: f64) {
    let status = if ok { "ok" } else { "error" };
    COMMANDS_TOTAL.with_label_values(&[command, status]).inc();
    COMMAND_DURATION
        .with_label_values(&[command])
        .observe(duration_secs);
}

/// Record a relayed command
pub fn record_relay(ok: bool) {
    RELAYS_TOTAL
        .with_label_values(&[if ok { "ok" } else { "error" }])
        .inc();
}

/// Record a finished transaction
pub fn record_tx(outcome: &str) {
    TX_TOTAL.with_label_values(&[outcome]).inc();
}

/// Record a finished migration
pub fn record_migration(outcome: &str) {
    MIGRATIONS_TOTAL.with_label_values(&[outcome]).inc();
}

/// Record a finished failover
pub fn record_failover(outcome: &str) {
    FAILOVERS_TOTAL.with_label_values(&[outcome]).inc();
}

/// Update consensus gauges
pub fn update_raft(role: i64, term: u64, owned_slots: usize) {
    RAFT_ROLE.set(role);
    RAFT_TERM.set(term as i64);
    OWNED_SLOTS.set(owned_slots as i64);
}

/// Update the stored key count
pub fn update_keys(total: usize) {
    KEYS_TOTAL.set(total as i64);
}

/// Record replicated commands ("sent" or "applied")
pub fn record_replication(direction: &str, count: u64) {
    REPL_COMMANDS_TOTAL
        .with_label_values(&[direction])
        .inc_by(count);
}

/// Initialize metrics with default values
pub fn init_metrics() {
    lazy_static::initialize(&COMMANDS_TOTAL);
    lazy_static::initialize(&COMMAND_DURATION);
    lazy_static::initialize(&KEYS_TOTAL);
    lazy_static::initialize(&CLIENT_CONNECTIONS);
    lazy_static::initialize(&RELAYS_TOTAL);
    lazy_static::initialize(&TX_TOTAL);
    lazy_static::initialize(&MIGRATIONS_TOTAL);
    lazy_static::initialize(&FAILOVERS_TOTAL);
    lazy_static::initialize(&RAFT_ROLE);
    lazy_static::initialize(&RAFT_TERM);
    lazy_static::initialize(&OWNED_SLOTS);
    lazy_static::initialize(&REPL_COMMANDS_TOTAL);
    lazy_static::initialize(&REPL_REPLICAS);

    tracing::info!("Prometheus metrics initialized");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_command() {
        record_command("get", true, 0.001);
        record_command("set", false, 0.002);

        let metrics = encode_metrics().unwrap();
        assert!(metrics.contains("shardis_commands_total"));
        assert!(metrics.contains("shardis_command_duration_seconds"));
    }

    #[test]
    fn test_record_cluster_events() {
        record_relay(true);
        record_tx("committed");
        record_migration("finished");
        record_failover("finished");

        let metrics = encode_metrics().unwrap();
        assert!(metrics.contains("shardis_relays_total"));
        assert!(metrics.contains("shardis_transactions_total"));
        assert!(metrics.contains("shardis_migrations_total"));
        assert!(metrics.contains("shardis_failovers_total"));
    }

    #[test]
    fn test_update_raft() {
        update_raft(2, 7, 16384);

        let metrics = encode_metrics().unwrap();
        assert!(metrics.contains("shardis_raft_role"));
        assert!(metrics.contains("shardis_raft_term"));
    }
}
