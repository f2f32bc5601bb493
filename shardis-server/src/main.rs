use anyhow::{Context, Result};
use clap::Parser;
use shardis_server::cluster::{HttpRaftTransport, PeerTransport, TcpPeerTransport};
use shardis_server::config::LoggingConfig;
use shardis_server::{
    AppState, Cluster, Database, KVStore, ReplicatedStore, RespServer, ServerConfig, StartMode,
    create_router,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "shardis-server", version, about = "Sharded Redis-protocol key-value server")]
struct Args {
    /// YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// RESP port
    #[arg(short, long)]
    port: Option<u16>,

    /// Enable cluster mode
    #[arg(long)]
    cluster: bool,

    /// Bootstrap a new cluster
    #[arg(long, conflicts_with = "join")]
    seed: bool,

    /// Join the cluster through this member (host:port)
    #[arg(long, value_name = "ADDR")]
    join: Option<String>,

    /// Join as a slave of this master (host:port)
    #[arg(long, value_name = "ADDR")]
    master: Option<String>,

    /// Consensus listen and advertise address
    #[arg(long, value_name = "ADDR")]
    raft_addr: Option<String>,

    /// Data directory for snapshots and consensus state
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

impl Args {
    fn apply(self, config: &mut ServerConfig) {
        if let Some(port) = self.port {
            config.server.port = port;
            if let Some((host, _)) = config.cluster.self_addr.rsplit_once(':') {
                config.cluster.self_addr = format!("{}:{}", host, port);
            }
        }
        if self.cluster || self.seed || self.join.is_some() {
            config.cluster.enabled = true;
        }
        if self.seed {
            config.cluster.start_mode = StartMode::Seed;
        }
        if let Some(target) = self.join {
            config.cluster.start_mode = StartMode::Join;
            config.cluster.join_target = Some(target);
        }
        if self.master.is_some() {
            config.cluster.master = self.master;
        }
        if let Some(addr) = self.raft_addr {
            config.cluster.raft_listen_addr = addr.clone();
            config.cluster.raft_advertise_addr = addr;
        }
        if let Some(dir) = self.data_dir {
            config.cluster.data_dir = dir.join("cluster");
            config.persistence.data_dir = dir;
        }
    }
}

fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if logging.format == "pretty" {
        builder.pretty().init();
    } else {
        builder.json().init();
    }
}

async fn serve_http(listener: TcpListener, state: AppState) {
    if let Err(e) = axum::serve(listener, create_router(state)).await {
        error!("HTTP server failed: {}", e);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => ServerConfig::from_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => ServerConfig::default(),
    };
    args.apply(&mut config);

    init_tracing(&config.logging);
    info!("Starting Shardis Server v{}", env!("CARGO_PKG_VERSION"));
    shardis_server::metrics::init_metrics();

    let requirepass = config.server.requirepass.clone();
    let mut store = KVStore::new(config.to_kv_config()).with_password(requirepass.clone());
    let snapshot = config.snapshot_path();
    if let Some(path) = &snapshot {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating data directory {}", dir.display()))?;
        }
        store = store.with_snapshot_path(path);
    }

    let peers: Arc<dyn PeerTransport> = Arc::new(TcpPeerTransport::new(
        config.cluster.peer_timeout(),
        requirepass.clone(),
    ));

    let cluster = if config.cluster.enabled {
        let raft_transport = Arc::new(HttpRaftTransport::new(config.cluster.peer_timeout())?);
        Some(Cluster::new(
            config.cluster.clone(),
            store.clone(),
            peers.clone(),
            raft_transport,
            requirepass.clone(),
        )
        .await?)
    } else {
        None
    };

    // after the cluster so slot bookkeeping sees every loaded key
    if let Some(path) = &snapshot {
        let loaded = store.load_rdb(path)?;
        info!("Loaded {} keys from {}", loaded, path.display());
    }
    store.start_ttl_cleanup();

    let (db, state, http_addr): (Arc<dyn Database>, AppState, String) = match &cluster {
        Some(cluster) => (
            Arc::clone(cluster) as Arc<dyn Database>,
            AppState::clustered(cluster.clone()),
            config.cluster.raft_listen_addr.clone(),
        ),
        None => (
            Arc::new(
                ReplicatedStore::new(store.clone(), peers, config.cluster.replica_retry())
                    .with_password(requirepass),
            ) as Arc<dyn Database>,
            AppState::standalone(store.clone()),
            config.http_addr(),
        ),
    };

    let http = TcpListener::bind(&http_addr)
        .await
        .with_context(|| format!("binding HTTP on {}", http_addr))?;
    info!("HTTP listening on http://{}", http_addr);
    tokio::spawn(serve_http(http, state));

    let server = Arc::new(RespServer::new(db));
    let listener = TcpListener::bind(config.server_addr())
        .await
        .with_context(|| format!("binding RESP on {}", config.server_addr()))?;
    let serving = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.serve(listener).await })
    };

    if let Some(cluster) = &cluster {
        cluster.start().await.context("starting cluster node")?;
        info!("Cluster node {} is up", cluster.id());
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    server.shutdown();
    serving.await??;
    Ok(())
}
