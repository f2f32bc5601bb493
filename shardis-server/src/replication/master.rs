use crate::core::KVStore;
use crate::protocol::{CmdLine, Reply, to_cmdline};
use crate::server::Connection;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Serve `cluster.sync` on a master
///
/// Pushes `FLUSHDB`, a dump of every live key and then each write as it is
/// applied, until the replica disconnects or the node shuts down. A replica
/// that falls behind the write feed is cut off and has to resync.
pub async fn serve_sync(db: &KVStore, conn: &Connection, mut shutdown: watch::Receiver<bool>) -> Reply {
    let (dump, mut feed) = db.dump_and_subscribe();
    info!(
        "Replica on connection {} syncing, full dump of {} commands",
        conn.id(),
        dump.len()
    );

    let gauge = crate::metrics::REPL_REPLICAS.with_label_values(&["online"]);
    gauge.inc();
    let reply = stream(conn, dump, &mut feed, &mut shutdown).await;
    gauge.dec();
    reply
}

async fn stream(
    conn: &Connection,
    dump: Vec<CmdLine>,
    feed: &mut tokio::sync::broadcast::Receiver<CmdLine>,
    shutdown: &mut watch::Receiver<bool>,
) -> Reply {
    if !send(conn, &to_cmdline(["FLUSHDB"])) {
        return Reply::ok();
    }
    let total = dump.len() as u64;
    for cmd in &dump {
        if !send(conn, cmd) {
            return Reply::ok();
        }
    }
    crate::metrics::record_replication("sent", total);

    loop {
        tokio::select! {
            cmd = feed.recv() => match cmd {
                Ok(cmd) => {
                    if !send(conn, &cmd) {
                        break;
                    }
                    crate::metrics::record_replication("sent", 1);
                }
                Err(RecvError::Lagged(missed)) => {
                    warn!("Replica on connection {} missed {} writes", conn.id(), missed);
                    return Reply::error(format!("ERR replica fell behind by {} writes", missed));
                }
                Err(RecvError::Closed) => break,
            },
            _ = conn.closed() => break,
            _ = shutdown.changed() => break,
        }
    }
    debug!("Replication stream on connection {} closed", conn.id());
    Reply::ok()
}

fn send(conn: &Connection, cmd: &CmdLine) -> bool {
    conn.push(Reply::from_cmdline(cmd))
}
