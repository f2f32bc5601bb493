//! Node-to-node command transport
//!
//! Peers talk RESP over the client port. Plain calls reuse pooled
//! connections; streams get a dedicated connection that stays open until the
//! receiving side is dropped.

use super::types::{ClusterError, ClusterResult};
use crate::protocol::{CmdLine, Reply, RespParser, to_cmdline};
use bytes::BytesMut;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Idle connections kept per destination
const MAX_IDLE_PER_PEER: usize = 8;

/// Sends command lines to other nodes, addressed by node id
pub trait PeerTransport: Send + Sync + 'static {
    /// One request, one reply
    fn call(&self, peer: &str, cmdline: CmdLine) -> BoxFuture<'static, ClusterResult<Reply>>;

    /// One request, every reply the peer pushes until it finishes
    fn stream(
        &self,
        peer: &str,
        cmdline: CmdLine,
    ) -> BoxFuture<'static, ClusterResult<mpsc::UnboundedReceiver<Reply>>>;
}

struct PeerConn {
    stream: TcpStream,
    buf: BytesMut,
}

impl PeerConn {
    async fn connect(addr: &str, password: Option<&str>) -> ClusterResult<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| ClusterError::NetworkError(format!("connect {}: {}", addr, e)))?;
        let _ = stream.set_nodelay(true);
        let mut conn = Self {
            stream,
            buf: BytesMut::with_capacity(4096),
        };
        if let Some(password) = password {
            let reply = conn.request(&to_cmdline(["AUTH", password])).await?;
            if let Some(msg) = reply.error_message() {
                return Err(ClusterError::NetworkError(format!("auth {}: {}", addr, msg)));
            }
        }
        Ok(conn)
    }

    async fn send(&mut self, cmdline: &CmdLine) -> ClusterResult<()> {
        self.stream
            .write_all(&Reply::from_cmdline(cmdline).to_bytes())
            .await
            .map_err(|e| ClusterError::NetworkError(e.to_string()))
    }

    async fn read_reply(&mut self) -> ClusterResult<Reply> {
        loop {
            if let Some(reply) = RespParser::parse(&mut self.buf)
                .map_err(|e| ClusterError::NetworkError(e.to_string()))?
            {
                return Ok(reply);
            }
            let n = self
                .stream
                .read_buf(&mut self.buf)
                .await
                .map_err(|e| ClusterError::NetworkError(e.to_string()))?;
            if n == 0 {
                return Err(ClusterError::NetworkError(
                    "connection closed by peer".to_string(),
                ));
            }
        }
    }

    async fn request(&mut self, cmdline: &CmdLine) -> ClusterResult<Reply> {
        self.send(cmdline).await?;
        self.read_reply().await
    }
}

struct PoolInner {
    idle: Mutex<HashMap<String, Vec<PeerConn>>>,
    timeout: Duration,
    password: Option<String>,
}

/// Pooled RESP-over-TCP transport
#[derive(Clone)]
pub struct TcpPeerTransport {
    inner: Arc<PoolInner>,
}

impl TcpPeerTransport {
    pub fn new(timeout: Duration, password: Option<String>) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                idle: Mutex::new(HashMap::new()),
                timeout,
                password,
            }),
        }
    }

    fn checkout(&self, peer: &str) -> Option<PeerConn> {
        self.inner.idle.lock().get_mut(peer).and_then(|conns| conns.pop())
    }

    fn checkin(inner: &PoolInner, peer: &str, conn: PeerConn) {
        let mut idle = inner.idle.lock();
        let conns = idle.entry(peer.to_string()).or_default();
        if conns.len() < MAX_IDLE_PER_PEER {
            conns.push(conn);
        }
    }
}

impl PeerTransport for TcpPeerTransport {
    fn call(&self, peer: &str, cmdline: CmdLine) -> BoxFuture<'static, ClusterResult<Reply>> {
        let inner = Arc::clone(&self.inner);
        let pooled = self.checkout(peer);
        let peer = peer.to_string();

        async move {
            let round_trip = async {
                let mut conn = match pooled {
                    Some(conn) => conn,
                    None => PeerConn::connect(&peer, inner.password.as_deref()).await?,
                };
                let reply = conn.request(&cmdline).await?;
                Ok::<_, ClusterError>((conn, reply))
            };

            match tokio::time::timeout(inner.timeout, round_trip).await {
                Ok(Ok((conn, reply))) => {
                    Self::checkin(&inner, &peer, conn);
                    Ok(reply)
                }
                Ok(Err(e)) => {
                    debug!("Call to {} failed: {}", peer, e);
                    Err(e)
                }
                Err(_) => Err(ClusterError::Timeout(format!("call to {}", peer))),
            }
        }
        .boxed()
    }

    fn stream(
        &self,
        peer: &str,
        cmdline: CmdLine,
    ) -> BoxFuture<'static, ClusterResult<mpsc::UnboundedReceiver<Reply>>> {
        let inner = Arc::clone(&self.inner);
        let peer = peer.to_string();

        async move {
            let mut conn = tokio::time::timeout(inner.timeout, async {
                let mut conn = PeerConn::connect(&peer, inner.password.as_deref()).await?;
                conn.send(&cmdline).await?;
                Ok::<_, ClusterError>(conn)
            })
            .await
            .map_err(|_| ClusterError::Timeout(format!("stream to {}", peer)))??;

            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        reply = conn.read_reply() => match reply {
                            Ok(reply) => {
                                if tx.send(reply).is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                warn!("Stream from {} ended: {}", peer, e);
                                break;
                            }
                        },
                        _ = tx.closed() => break,
                    }
                }
            });
            Ok(rx)
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn echo_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            loop {
                let (mut socket, _) = listener.accept().await.unwrap();
                tokio::spawn(async move {
                    let mut buf = BytesMut::new();
                    loop {
                        while let Ok(Some(frame)) = RespParser::parse(&mut buf) {
                            let cmd = frame.into_cmdline().unwrap();
                            let reply = if cmd[0].as_ref() == b"STREAM" {
                                let mut out = BytesMut::new();
                                Reply::Integer(1).encode(&mut out);
                                Reply::Integer(2).encode(&mut out);
                                Reply::ok().encode(&mut out);
                                out.freeze()
                            } else {
                                Reply::bulk(cmd[1].clone()).to_bytes()
                            };
                            socket.write_all(&reply).await.unwrap();
                        }
                        if socket.read_buf(&mut buf).await.unwrap_or(0) == 0 {
                            return;
                        }
                    }
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_call_reuses_connection() {
        let addr = echo_server().await;
        let transport = TcpPeerTransport::new(Duration::from_secs(2), None);

        let reply = transport
            .call(&addr, to_cmdline(["ECHO", "hello"]))
            .await
            .unwrap();
        assert_eq!(reply, Reply::bulk("hello"));
        assert_eq!(transport.inner.idle.lock().get(&addr).map(Vec::len), Some(1));

        let reply = transport.call(&addr, to_cmdline(["ECHO", "again"])).await.unwrap();
        assert_eq!(reply, Reply::bulk("again"));
        assert_eq!(transport.inner.idle.lock().get(&addr).map(Vec::len), Some(1));
    }

    #[tokio::test]
    async fn test_stream_yields_every_reply() {
        let addr = echo_server().await;
        let transport = TcpPeerTransport::new(Duration::from_secs(2), None);

        let mut rx = transport.stream(&addr, to_cmdline(["STREAM"])).await.unwrap();
        assert_eq!(rx.recv().await, Some(Reply::Integer(1)));
        assert_eq!(rx.recv().await, Some(Reply::Integer(2)));
        assert_eq!(rx.recv().await, Some(Reply::ok()));
    }

    #[tokio::test]
    async fn test_unreachable_peer() {
        let transport = TcpPeerTransport::new(Duration::from_millis(500), None);
        let result = transport.call("127.0.0.1:1", to_cmdline(["PING"])).await;
        assert!(result.is_err());
    }
}
