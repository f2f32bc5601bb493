//! Cluster Mode - sharding over CRC16 hash slots
//!
//! Slot ownership, migrations, failovers and membership live in a raft
//! replicated state machine ([`fsm`]). Every node serves clients: commands
//! whose keys live elsewhere are relayed to the owner, and commands spanning
//! nodes run as TCC transactions ([`tcc`]). The leader moves slots between
//! masters ([`rebalance`], [`migration`]) and promotes slaves of silent
//! masters ([`failover`]).

pub mod config;
pub mod coordinator;
pub mod failover;
pub mod fsm;
pub mod hash_slot;
pub mod local;
pub mod migration;
pub mod peer;
pub mod raft;
pub mod rebalance;
pub mod router;
pub mod slot_manager;
pub mod tcc;
pub mod types;

pub use config::{ClusterConfig, StartMode};
pub use coordinator::Cluster;
pub use fsm::{Event, FailoverTask, Fsm, FsmState, MigratingTask};
pub use hash_slot::hash_slot;
pub use local::LocalNetwork;
pub use peer::{PeerTransport, TcpPeerTransport};
pub use raft::{HttpRaftTransport, RaftNode};
pub use slot_manager::{SlotManager, SlotState};
pub use types::{ClusterError, ClusterNode, ClusterResult, NodeId, NodeRole, SlotRange, TOTAL_SLOTS};
