/// Node configuration.
///
/// Every tunable of the node lives here. `gptt` builds one from its flags;
/// tests build one with [`Config::ephemeral`].
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use ptt_protocol::limits::{
    DEFAULT_EXPIRE_OPKEY_SECS, DEFAULT_EXPIRE_OPLOG_SECS, DEFAULT_FUTURE_TOLERANCE_SECS,
    DEFAULT_MAX_SYNC, DEFAULT_MAX_SYNC_RANDOM_SECS, DEFAULT_MIN_SYNC_RANDOM_SECS,
    DEFAULT_RENEW_JOIN_KEY_SECS, DEFAULT_RENEW_OPKEY_SECS,
};

use crate::me::NodeType;

// ─── Configuration ───────────────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// Data directory; `None` keeps everything in memory.
    pub data_dir: Option<PathBuf>,
    /// Device display name.
    pub node_name: String,
    pub node_type: NodeType,

    /// JSON-RPC listen address and port.
    pub rpc_addr: String,
    pub rpc_port: u16,
    /// Static http listen address (advertised only).
    pub http_addr: String,
    /// Externally reachable http address.
    pub ext_http_addr: Option<String>,
    /// Disable the local IPC endpoint.
    pub ipc_disable: bool,

    /// Peer listen port.
    pub port: u16,
    /// Port advertised in join URLs when no signalling server is set.
    pub p2p_port: u16,
    /// `host:port` advertised in join URLs.
    pub signal_server: Option<String>,

    /// 0 = off .. 5 = trace.
    pub verbosity: u8,

    /// Friend sync tick bounds (random in between), seconds.
    pub friend_min_sync_secs: u64,
    pub friend_max_sync_secs: u64,
    /// Merkle leaf windows pulled per sync round.
    pub max_sync: usize,
    /// Seconds an unsigned oplog is kept before it is discarded.
    pub expire_oplog_secs: i64,
    pub expire_opkey_secs: i64,
    pub renew_opkey_secs: i64,
    pub renew_join_key_secs: i64,
    /// Tolerated clock skew on inbound oplogs.
    pub future_tolerance_secs: i64,
    /// Initial clock offset.
    pub offset_second: i64,

    /// Peer handshake deadline.
    pub handshake_timeout: Duration,
    /// Per-peer send queue bound, in frames.
    pub send_queue_len: usize,
    /// Queued oplog frames beyond which the peer gets a forced sync instead.
    pub oplog_backlog: usize,
    /// Rejections from one peer before it is evicted from an entity.
    pub reputation_threshold: u32,
    /// Peers an accepted oplog is forwarded to.
    pub gossip_fanout: usize,
    /// Entity worker queue bound.
    pub entity_queue_len: usize,
    /// Raft heartbeat period; election timeouts scale from it.
    pub raft_tick: Duration,

    /// Shortened intervals for end-to-end runs.
    pub e2e: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: None,
            node_name: String::from("ptt-node"),
            node_type: NodeType::Desktop,
            rpc_addr: String::from("127.0.0.1"),
            rpc_port: 14779,
            http_addr: String::from("127.0.0.1:9774"),
            ext_http_addr: None,
            ipc_disable: false,
            port: 29487,
            p2p_port: 9487,
            signal_server: None,
            verbosity: 3,
            friend_min_sync_secs: DEFAULT_MIN_SYNC_RANDOM_SECS,
            friend_max_sync_secs: DEFAULT_MAX_SYNC_RANDOM_SECS,
            max_sync: DEFAULT_MAX_SYNC,
            expire_oplog_secs: DEFAULT_EXPIRE_OPLOG_SECS,
            expire_opkey_secs: DEFAULT_EXPIRE_OPKEY_SECS,
            renew_opkey_secs: DEFAULT_RENEW_OPKEY_SECS,
            renew_join_key_secs: DEFAULT_RENEW_JOIN_KEY_SECS,
            future_tolerance_secs: DEFAULT_FUTURE_TOLERANCE_SECS,
            offset_second: 0,
            handshake_timeout: Duration::from_secs(30),
            send_queue_len: 256,
            oplog_backlog: 192,
            reputation_threshold: 5,
            gossip_fanout: 8,
            entity_queue_len: 1024,
            raft_tick: Duration::from_millis(100),
            e2e: false,
        }
    }
}

impl Config {
    /// In-memory node listening on ephemeral loopback ports.
    pub fn ephemeral(name: &str) -> Self {
        Self {
            node_name: name.to_string(),
            rpc_port: 0,
            port: 0,
            p2p_port: 0,
            e2e: true,
            ..Self::default()
        }
    }

    /// Interval between merkle sync rounds of an entity.
    pub fn sync_interval(&self) -> (Duration, Duration) {
        if self.e2e {
            return (Duration::from_millis(200), Duration::from_millis(400));
        }
        let min = self.friend_min_sync_secs.max(1);
        let max = self.friend_max_sync_secs.max(min);
        (Duration::from_secs(min), Duration::from_secs(max))
    }

    /// Interval between pending-oplog / OpKey housekeeping passes.
    pub fn housekeeping_interval(&self) -> Duration {
        if self.e2e {
            Duration::from_millis(500)
        } else {
            Duration::from_secs(10)
        }
    }

    /// `tracing` filter directive for the configured verbosity.
    pub fn log_filter(&self) -> &'static str {
        match self.verbosity {
            0 => "off",
            1 => "error",
            2 => "warn",
            3 => "info",
            4 => "debug",
            _ => "trace",
        }
    }

    pub fn rpc_endpoint(&self) -> String {
        format!("{}:{}", self.rpc_addr, self.rpc_port)
    }

    /// Peer listen addresses: the p2p port first when it is set apart.
    pub fn peer_listen_addrs(&self) -> Vec<String> {
        let host = if self.e2e { "127.0.0.1" } else { "0.0.0.0" };
        let mut addrs = Vec::new();
        if self.p2p_port != 0 && self.p2p_port != self.port {
            addrs.push(format!("{}:{}", host, self.p2p_port));
        }
        addrs.push(format!("{}:{}", host, self.port));
        addrs
    }

    /// Signalling address written into join URLs.
    pub fn advertised_peer_addr(&self, bound_port: u16) -> String {
        if let Some(server) = &self.signal_server {
            return server.clone();
        }
        let port = if self.p2p_port != 0 { self.p2p_port } else { bound_port };
        format!("{}:{}", self.rpc_addr, port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.rpc_endpoint(), "127.0.0.1:14779");
        assert_eq!(config.max_sync, 5);
        assert_eq!(config.expire_oplog_secs, 300);
        assert_eq!(config.handshake_timeout, Duration::from_secs(30));
        assert_eq!(config.log_filter(), "info");
    }

    #[test]
    fn test_sync_interval_bounds() {
        let mut config = Config {
            friend_min_sync_secs: 40,
            friend_max_sync_secs: 10,
            ..Config::default()
        };
        let (min, max) = config.sync_interval();
        assert_eq!(min, Duration::from_secs(40));
        assert_eq!(max, Duration::from_secs(40));

        config.e2e = true;
        assert!(config.sync_interval().0 < Duration::from_secs(1));
    }

    #[test]
    fn test_peer_addresses() {
        let config = Config::default();
        assert_eq!(config.peer_listen_addrs(), vec!["0.0.0.0:9487", "0.0.0.0:29487"]);
        assert_eq!(config.advertised_peer_addr(29487), "127.0.0.1:9487");

        let config = Config::ephemeral("t0");
        assert_eq!(config.peer_listen_addrs(), vec!["127.0.0.1:0"]);
        assert_eq!(config.advertised_peer_addr(40001), "127.0.0.1:40001");

        let config = Config {
            signal_server: Some("sig.example:7000".into()),
            ..Config::default()
        };
        assert_eq!(config.advertised_peer_addr(1), "sig.example:7000");
    }
}
