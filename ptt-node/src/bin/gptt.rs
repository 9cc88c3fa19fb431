//! `gptt`: run one PTT node with its JSON-RPC endpoint.
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use pttnode::config::Config;
use pttnode::me::NodeType;
use pttnode::node::Node;
use pttnode::rpc::RpcServer;

#[derive(Parser, Debug)]
#[command(name = "gptt", version = pttnode::VERSION, about = "PTT node")]
struct Cli {
    /// Data directory; omit to keep everything in memory
    #[arg(long)]
    datadir: Option<PathBuf>,

    /// Device display name
    #[arg(long, default_value = "ptt-node")]
    name: String,

    /// unknown | mobile | desktop | server
    #[arg(long, default_value = "desktop")]
    nodetype: String,

    #[arg(long, default_value = "127.0.0.1")]
    rpcaddr: String,

    #[arg(long, default_value_t = 14779)]
    rpcport: u16,

    #[arg(long, default_value = "127.0.0.1:9774")]
    httpaddr: String,

    #[arg(long)]
    exthttpaddr: Option<String>,

    #[arg(long)]
    ipcdisable: bool,

    /// Peer listen port
    #[arg(long, default_value_t = 29487)]
    port: u16,

    /// Port advertised in join URLs
    #[arg(long, default_value_t = 9487)]
    p2pport: u16,

    /// `host:port` advertised in join URLs instead of the local address
    #[arg(long)]
    webrtcsignalserver: Option<String>,

    /// 0 = off .. 5 = trace; RUST_LOG overrides
    #[arg(long, default_value_t = 3)]
    verbosity: u8,

    /// Friend sync tick bounds, seconds
    #[arg(long)]
    friendminsync: Option<u64>,

    #[arg(long)]
    friendmaxsync: Option<u64>,

    /// Seconds an unsigned oplog is kept
    #[arg(long)]
    serviceexpireoplog: Option<i64>,

    #[arg(long)]
    maxsync: Option<usize>,

    /// Clock offset in seconds
    #[arg(long = "offset-second", default_value_t = 0, allow_hyphen_values = true)]
    offset_second: i64,

    /// Shortened timers for end-to-end runs
    #[arg(long)]
    e2e: bool,
}

impl Cli {
    fn config(self) -> Result<Config> {
        let node_type: NodeType = self.nodetype.parse()?;
        let defaults = Config::default();
        Ok(Config {
            data_dir: self.datadir,
            node_name: self.name,
            node_type,
            rpc_addr: self.rpcaddr,
            rpc_port: self.rpcport,
            http_addr: self.httpaddr,
            ext_http_addr: self.exthttpaddr,
            ipc_disable: self.ipcdisable,
            port: self.port,
            p2p_port: self.p2pport,
            signal_server: self.webrtcsignalserver,
            verbosity: self.verbosity,
            friend_min_sync_secs: self.friendminsync.unwrap_or(defaults.friend_min_sync_secs),
            friend_max_sync_secs: self.friendmaxsync.unwrap_or(defaults.friend_max_sync_secs),
            expire_oplog_secs: self.serviceexpireoplog.unwrap_or(defaults.expire_oplog_secs),
            max_sync: self.maxsync.unwrap_or(defaults.max_sync),
            offset_second: self.offset_second,
            e2e: self.e2e,
            ..defaults
        })
    }
}

/// Run until ctrl-c or an RPC shutdown; `Ok(true)` asks for another round.
async fn run_once(config: Config) -> Result<bool> {
    let node = Node::start(config).await.context("starting node")?;
    let server = RpcServer::spawn(node.clone()).await.context("binding RPC endpoint")?;
    log::info!(
        "gptt {} up: me {} node {} rpc {} peer {}",
        pttnode::VERSION,
        node.me_id(),
        node.node_id(),
        server.addr(),
        node.peer_addr()
    );

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            log::info!("interrupted");
            node.request_shutdown();
        }
        _ = node.stopped() => {}
    }
    let restart = node.restart_requested();
    server.stopped().await;
    node.shutdown().await;
    Ok(restart)
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Cli::parse().config()?;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.log_filter()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    loop {
        match run_once(config.clone()).await {
            Ok(true) => log::info!("restarting"),
            Ok(false) => return Ok(()),
            Err(e) => {
                log::error!("{e:#}");
                std::process::exit(1);
            }
        }
    }
}
