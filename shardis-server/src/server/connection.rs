//! RESP client connections
//!
//! Every accepted socket gets a reader task that parses command lines and
//! awaits the database, and a writer task that drains the connection's
//! outbound queue. Handlers that stream (replication, slot export) push
//! intermediate replies into the same queue before returning the final one.

use crate::core::commands::command_name;
use crate::protocol::{CmdLine, Reply, RespParser};
use bytes::BytesMut;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// A client session
#[derive(Debug)]
pub struct Connection {
    id: u64,
    peer_addr: Option<SocketAddr>,
    authenticated: AtomicBool,
    outbound: Option<mpsc::UnboundedSender<Reply>>,
}

impl Connection {
    pub fn new(peer_addr: Option<SocketAddr>, outbound: mpsc::UnboundedSender<Reply>) -> Self {
        Self {
            id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
            peer_addr,
            authenticated: AtomicBool::new(false),
            outbound: Some(outbound),
        }
    }

    /// Pre-authenticated session for in-process callers; pushes are dropped
    pub fn internal() -> Self {
        Self {
            id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
            peer_addr: None,
            authenticated: AtomicBool::new(true),
            outbound: None,
        }
    }

    /// Pre-authenticated session whose pushed replies land in `outbound`
    pub fn internal_streaming(outbound: mpsc::UnboundedSender<Reply>) -> Self {
        let conn = Self::new(None, outbound);
        conn.set_authenticated(true);
        conn
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Queue a reply ahead of the command's final reply.
    ///
    /// Returns `false` once the client is gone.
    pub fn push(&self, reply: Reply) -> bool {
        match &self.outbound {
            Some(tx) => tx.send(reply).is_ok(),
            None => false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.outbound.as_ref().is_none_or(|tx| tx.is_closed())
    }

    /// Resolves once the client is gone; never for internal sessions
    pub async fn closed(&self) {
        match &self.outbound {
            Some(tx) => tx.closed().await,
            None => std::future::pending().await,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::Acquire)
    }

    pub fn set_authenticated(&self, value: bool) {
        self.authenticated.store(value, Ordering::Release);
    }
}

/// Something that executes command lines for connected clients
pub trait Database: Send + Sync + 'static {
    fn exec(self: Arc<Self>, conn: Arc<Connection>, cmdline: CmdLine) -> BoxFuture<'static, Reply>;

    /// Release per-client state
    fn after_client_close(&self, _conn: &Connection) {}

    /// Flush and stop background work on shutdown
    fn close(&self) {}
}

/// Handle `AUTH` and reject unauthenticated sessions.
///
/// Returns the reply to send when the command must not run.
pub fn authenticate(conn: &Connection, cmdline: &CmdLine, requirepass: Option<&str>) -> Option<Reply> {
    if command_name(cmdline) == "auth" {
        let Some(expected) = requirepass else {
            return Some(Reply::error(
                "ERR Client sent AUTH, but no password is set",
            ));
        };
        if cmdline.len() != 2 {
            return Some(Reply::error(
                "ERR wrong number of arguments for 'auth' command",
            ));
        }
        if cmdline[1].as_ref() == expected.as_bytes() {
            conn.set_authenticated(true);
            return Some(Reply::ok());
        }
        conn.set_authenticated(false);
        return Some(Reply::error("WRONGPASS invalid password"));
    }

    match requirepass {
        Some(_) if !conn.is_authenticated() => {
            Some(Reply::error("NOAUTH Authentication required."))
        }
        _ => None,
    }
}

/// Run one command, turning a panic into an error reply
pub async fn dispatch(db: &Arc<dyn Database>, conn: &Arc<Connection>, cmdline: CmdLine) -> Reply {
    let name = command_name(&cmdline);
    let start = Instant::now();

    let reply = match AssertUnwindSafe(Arc::clone(db).exec(Arc::clone(conn), cmdline))
        .catch_unwind()
        .await
    {
        Ok(reply) => reply,
        Err(_) => {
            error!("Panic while executing '{}' for connection {}", name, conn.id());
            Reply::error("ERR internal error")
        }
    };

    crate::metrics::record_command(
        metric_label(&name),
        !reply.is_error(),
        start.elapsed().as_secs_f64(),
    );
    reply
}

fn metric_label(name: &str) -> &str {
    if name.len() <= 32 && name.bytes().all(|b| b.is_ascii_graphic()) {
        name
    } else {
        "other"
    }
}

/// TCP front end speaking RESP2
pub struct RespServer {
    db: Arc<dyn Database>,
    shutdown: watch::Sender<bool>,
}

impl RespServer {
    pub fn new(db: Arc<dyn Database>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self { db, shutdown }
    }

    /// Accept connections until [`RespServer::shutdown`] is called
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        info!("RESP server listening on {}", listener.local_addr()?);
        let mut shutdown = self.shutdown.subscribe();

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!("Accept failed: {}", e);
                            continue;
                        }
                    };
                    let db = Arc::clone(&self.db);
                    tokio::spawn(async move {
                        handle_connection(stream, peer, db).await;
                    });
                }
                _ = shutdown.changed() => {
                    info!("RESP server stopped accepting connections");
                    break;
                }
            }
        }
        self.db.close();
        Ok(())
    }

    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, db: Arc<dyn Database>) {
    let _ = stream.set_nodelay(true);
    let (mut reader, mut writer) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Reply>();
    let conn = Arc::new(Connection::new(Some(peer), tx));
    crate::metrics::CLIENT_CONNECTIONS.inc();
    debug!("Client {} connected from {}", conn.id(), peer);

    let writer_task = tokio::spawn(async move {
        let mut out = BytesMut::with_capacity(4096);
        while let Some(reply) = rx.recv().await {
            out.clear();
            reply.encode(&mut out);
            while let Ok(more) = rx.try_recv() {
                more.encode(&mut out);
            }
            if let Err(e) = writer.write_all(&out).await {
                debug!("Write to {} failed: {}", peer, e);
                break;
            }
        }
    });

    let mut buf = BytesMut::with_capacity(4096);
    'session: loop {
        loop {
            match RespParser::parse(&mut buf) {
                Ok(Some(frame)) => {
                    let reply = match frame.into_cmdline() {
                        Some(cmdline) if !cmdline.is_empty() => dispatch(&db, &conn, cmdline).await,
                        Some(_) => continue,
                        None => Reply::error("ERR Protocol error: expected array of bulk strings"),
                    };
                    if !conn.push(reply) {
                        break 'session;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    conn.push(Reply::error(format!("ERR {}", e)));
                    break 'session;
                }
            }
        }

        match reader.read_buf(&mut buf).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("Read from {} failed: {}", peer, e);
                break;
            }
        }
    }

    db.after_client_close(&conn);
    crate::metrics::CLIENT_CONNECTIONS.dec();
    debug!("Client {} disconnected", conn.id());
    drop(conn);
    let _ = writer_task.await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::to_cmdline;

    #[test]
    fn test_authenticate_flow() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let conn = Connection::new(None, tx);
        let get = to_cmdline(["GET", "a"]);

        let denied = authenticate(&conn, &get, Some("secret")).unwrap();
        assert!(denied.error_message().unwrap().starts_with("NOAUTH"));

        let wrong = authenticate(&conn, &to_cmdline(["AUTH", "nope"]), Some("secret")).unwrap();
        assert!(wrong.error_message().unwrap().starts_with("WRONGPASS"));

        let ok = authenticate(&conn, &to_cmdline(["AUTH", "secret"]), Some("secret")).unwrap();
        assert!(ok.is_ok());
        assert!(authenticate(&conn, &get, Some("secret")).is_none());
    }

    #[test]
    fn test_no_password_configured() {
        let conn = Connection::internal();
        assert!(authenticate(&conn, &to_cmdline(["GET", "a"]), None).is_none());
        assert!(authenticate(&conn, &to_cmdline(["AUTH", "x"]), None)
            .unwrap()
            .is_error());
    }

    #[test]
    fn test_push_after_close() {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Connection::new(None, tx);
        assert!(conn.push(Reply::ok()));
        drop(rx);
        assert!(conn.is_closed());
        assert!(!conn.push(Reply::ok()));
        assert!(!Connection::internal().push(Reply::ok()));
    }

    struct Panicky;

    impl Database for Panicky {
        fn exec(self: Arc<Self>, _conn: Arc<Connection>, cmdline: CmdLine) -> BoxFuture<'static, Reply> {
            async move {
                if cmdline.is_empty() {
                    return Reply::ok();
                }
                panic!("boom")
            }
            .boxed()
        }
    }

    #[tokio::test]
    async fn test_panic_becomes_error_reply() {
        let db: Arc<dyn Database> = Arc::new(Panicky);
        let conn = Arc::new(Connection::internal());
        let reply = dispatch(&db, &conn, to_cmdline(["PING"])).await;
        assert_eq!(reply, Reply::error("ERR internal error"));
    }
}
