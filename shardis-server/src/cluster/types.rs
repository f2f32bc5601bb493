use crate::core::ShardisError;
use crate::protocol::Reply;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Total number of hash slots (Redis-compatible)
pub const TOTAL_SLOTS: u16 = 16384;

/// Node identifier: the node's advertised client address (`host:port`)
pub type NodeId = String;

/// Error prefix carried by replies from a node that is not the raft leader
pub const NOT_LEADER_PREFIX: &str = "NOTLEADER";

/// Role of a node in the replication topology
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Master,
    Slave,
}

/// Cluster node information, as reported by `cluster.nodes` and `/cluster`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterNode {
    /// Node ID (client address)
    pub id: NodeId,
    /// Consensus address, if the node is a voter
    pub raft_addr: Option<String>,
    pub role: NodeRole,
    /// Master node ID (if this is a replica)
    pub master_id: Option<NodeId>,
    /// Number of slots owned
    pub slot_count: usize,
    /// Owned slots collapsed into inclusive ranges
    pub slots: Vec<SlotRange>,
}

/// Slot range (inclusive start, inclusive end)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotRange {
    pub start: u16,
    pub end: u16,
}

impl SlotRange {
    pub fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, slot: u16) -> bool {
        slot >= self.start && slot <= self.end
    }

    pub fn count(&self) -> u16 {
        self.end - self.start + 1
    }

    /// Collapse a sorted slot list into ranges
    pub fn collapse(slots: &[u16]) -> Vec<SlotRange> {
        let mut ranges: Vec<SlotRange> = Vec::new();
        for &slot in slots {
            match ranges.last_mut() {
                Some(last) if last.end + 1 == slot => last.end = slot,
                _ => ranges.push(SlotRange::new(slot, slot)),
            }
        }
        ranges
    }
}

impl std::fmt::Display for SlotRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

/// Cluster error types
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("not leader (leader: {0:?})")]
    NotLeader(Option<NodeId>),
    #[error("Node not found: {0}")]
    NodeNotFound(String),
    #[error("Slot not assigned: {0}")]
    SlotNotAssigned(u16),
    #[error("CROSSSLOT Keys in request don't hash to the same node")]
    CrossSlot,
    #[error("Cluster not initialized")]
    ClusterNotInitialized,
    #[error("Raft consensus error: {0}")]
    RaftError(String),
    #[error("Migration error: {0}")]
    MigrationError(String),
    #[error("Transaction error: {0}")]
    TxError(String),
    #[error("Network error: {0}")]
    NetworkError(String),
    #[error("Timeout: {0}")]
    Timeout(String),
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Remote error: {0}")]
    Remote(String),
    #[error(transparent)]
    Storage(#[from] ShardisError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ClusterError {
    /// Interpret an error reply received from a peer
    pub fn from_reply(reply: &Reply) -> Option<ClusterError> {
        let msg = reply.error_message()?;
        if let Some(rest) = msg.strip_prefix(NOT_LEADER_PREFIX) {
            let leader = rest.trim();
            return Some(ClusterError::NotLeader(
                (!leader.is_empty()).then(|| leader.to_string()),
            ));
        }
        Some(ClusterError::Remote(msg.to_string()))
    }
}

impl From<serde_json::Error> for ClusterError {
    fn from(e: serde_json::Error) -> Self {
        ClusterError::SerializationError(e.to_string())
    }
}

impl From<ClusterError> for Reply {
    fn from(e: ClusterError) -> Self {
        match e {
            ClusterError::NotLeader(Some(leader)) => {
                Reply::error(format!("{} {}", NOT_LEADER_PREFIX, leader))
            }
            ClusterError::NotLeader(None) => Reply::error(NOT_LEADER_PREFIX),
            ClusterError::Remote(msg) => Reply::error(msg),
            ClusterError::CrossSlot => Reply::error(ClusterError::CrossSlot.to_string()),
            ClusterError::Storage(e) => e.into(),
            other => Reply::error(format!("ERR {}", other)),
        }
    }
}

/// Cluster result type
pub type ClusterResult<T> = Result<T, ClusterError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collapse_ranges() {
        let ranges = SlotRange::collapse(&[0, 1, 2, 5, 7, 8]);
        assert_eq!(
            ranges,
            vec![
                SlotRange::new(0, 2),
                SlotRange::new(5, 5),
                SlotRange::new(7, 8)
            ]
        );
        assert_eq!(ranges[0].to_string(), "0-2");
        assert_eq!(ranges[1].count(), 1);
    }

    #[test]
    fn test_not_leader_round_trip() {
        let reply: Reply = ClusterError::NotLeader(Some("10.0.0.1:6399".into())).into();
        assert_eq!(reply, Reply::error("NOTLEADER 10.0.0.1:6399"));

        match ClusterError::from_reply(&reply) {
            Some(ClusterError::NotLeader(Some(id))) => assert_eq!(id, "10.0.0.1:6399"),
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(
            ClusterError::from_reply(&Reply::error("NOTLEADER")),
            Some(ClusterError::NotLeader(None))
        ));
        assert!(ClusterError::from_reply(&Reply::ok()).is_none());
    }
}
