/// Per-entity peer reputation.
///
/// Every oplog a peer sends that fails verification in a way the sender is
/// responsible for (bad signature, bad payload, corrupt hash) is a strike.
/// Strikes decay over a sliding window; a peer reaching the threshold is
/// evicted from the entity and ignored until its ban expires.
use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use ptt_protocol::NodeID;

// ─── Configuration ───────────────────────────────────────────────────────────

#[derive(Clone, Debug)]
pub struct ReputationConfig {
    /// Strikes inside `window` that evict a peer.
    pub threshold: u32,
    pub window: Duration,
    pub ban_duration: Duration,
}

impl Default for ReputationConfig {
    fn default() -> Self {
        Self {
            threshold: 5,
            window: Duration::from_secs(600),
            ban_duration: Duration::from_secs(1800),
        }
    }
}

impl ReputationConfig {
    pub fn with_threshold(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            ..Self::default()
        }
    }
}

// ─── Per-Peer State ──────────────────────────────────────────────────────────

#[derive(Debug)]
struct PeerRecord {
    strikes: Vec<Instant>,
    banned_until: Option<Instant>,
}

impl PeerRecord {
    fn new() -> Self {
        Self {
            strikes: Vec::new(),
            banned_until: None,
        }
    }

    fn prune(&mut self, now: Instant, window: Duration) {
        self.strikes.retain(|t| now.duration_since(*t) < window);
    }

    fn is_banned(&self, now: Instant) -> bool {
        self.banned_until.is_some_and(|until| now < until)
    }
}

// ─── Verdict ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Keep,
    /// Threshold reached; drop the peer from this entity.
    Evict,
}

// ─── Tracker ─────────────────────────────────────────────────────────────────

/// Strike counter for the peers of one entity. Owned by the entity worker.
#[derive(Debug)]
pub struct Reputation {
    config: ReputationConfig,
    peers: HashMap<NodeID, PeerRecord>,
}

impl Reputation {
    pub fn new(config: ReputationConfig) -> Self {
        Self {
            config,
            peers: HashMap::new(),
        }
    }

    /// Record `count` strikes against `peer`.
    pub fn penalise(&mut self, peer: &NodeID, count: usize) -> Verdict {
        if count == 0 {
            return Verdict::Keep;
        }
        let now = Instant::now();
        let record = self.peers.entry(*peer).or_insert_with(PeerRecord::new);
        record.prune(now, self.config.window);
        record.strikes.extend(std::iter::repeat(now).take(count));

        if record.strikes.len() as u32 >= self.config.threshold {
            record.strikes.clear();
            record.banned_until = Some(now + self.config.ban_duration);
            log::warn!(
                "Reputation: evicting peer {} ({} bad oplogs)",
                peer.short(),
                count
            );
            return Verdict::Evict;
        }
        log::debug!(
            "Reputation: peer {} at {}/{} strikes",
            peer.short(),
            record.strikes.len(),
            self.config.threshold
        );
        Verdict::Keep
    }

    pub fn is_banned(&self, peer: &NodeID) -> bool {
        self.peers
            .get(peer)
            .is_some_and(|r| r.is_banned(Instant::now()))
    }

    pub fn strikes(&self, peer: &NodeID) -> usize {
        self.peers.get(peer).map(|r| r.strikes.len()).unwrap_or(0)
    }

    /// Forget peers with no recent strikes and no ban.
    pub fn cleanup(&mut self) {
        let now = Instant::now();
        let window = self.config.window;
        self.peers.retain(|_, r| {
            r.prune(now, window);
            !r.strikes.is_empty() || r.is_banned(now)
        });
    }
}
