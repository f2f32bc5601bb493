use super::master::serve_sync;
use super::replica::{ReplicaLink, parse_slaveof};
use crate::cluster::{NodeId, PeerTransport};
use crate::core::KVStore;
use crate::core::commands::command_name;
use crate::protocol::{CmdLine, Reply};
use crate::server::{Connection, Database, authenticate};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

/// Standalone node: the key-value store plus `SLAVEOF` and `cluster.sync`
pub struct ReplicatedStore {
    db: KVStore,
    link: ReplicaLink,
    requirepass: Option<String>,
    shutdown: watch::Sender<bool>,
}

impl ReplicatedStore {
    pub fn new(db: KVStore, peers: Arc<dyn PeerTransport>, retry: Duration) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            link: ReplicaLink::new(db.clone(), peers, retry),
            db,
            requirepass: None,
            shutdown,
        }
    }

    pub fn with_password(mut self, password: Option<String>) -> Self {
        self.requirepass = password;
        self
    }

    pub fn store(&self) -> &KVStore {
        &self.db
    }

    pub fn master(&self) -> Option<NodeId> {
        self.link.master()
    }

    async fn dispatch(self: Arc<Self>, conn: Arc<Connection>, cmdline: CmdLine) -> Reply {
        if let Some(reply) = authenticate(&conn, &cmdline, self.requirepass.as_deref()) {
            return reply;
        }
        match command_name(&cmdline).as_str() {
            "slaveof" | "replicaof" => match parse_slaveof(&cmdline) {
                Ok(master) => {
                    info!("SLAVEOF {:?}", master);
                    self.link.point_to(master);
                    Reply::ok()
                }
                Err(e) => e.into(),
            },
            "cluster.sync" => serve_sync(&self.db, &conn, self.shutdown.subscribe()).await,
            _ => self.db.exec(&cmdline).await,
        }
    }
}

impl Database for ReplicatedStore {
    fn exec(self: Arc<Self>, conn: Arc<Connection>, cmdline: CmdLine) -> BoxFuture<'static, Reply> {
        self.dispatch(conn, cmdline).boxed()
    }

    fn close(&self) {
        self.shutdown.send_replace(true);
        self.link.point_to(None);
        Database::close(&self.db);
    }
}
