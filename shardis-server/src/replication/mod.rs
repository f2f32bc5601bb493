/// Replication module - master/replica streaming over the peer protocol
///
/// Design inspired by Redis Replication:
/// - A replica sends `cluster.sync` to its master
/// - The master answers with `FLUSHDB`, a full dump of its keyspace, then
///   every write as it happens (async, non-blocking for the master)
/// - The replica applies each command locally and reconnects after a delay
///   when the stream breaks
///
/// Who replicates from whom is decided by the cluster state machine or by
/// `SLAVEOF`; this module only moves the data.
pub mod master;
pub mod node;
pub mod replica;

pub use master::serve_sync;
pub use node::ReplicatedStore;
pub use replica::{ReplicaLink, parse_slaveof};
