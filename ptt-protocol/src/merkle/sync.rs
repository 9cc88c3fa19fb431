/// Merkle diff session.
///
/// `SyncPlanner` is I/O free: the entity worker asks it for queries, sends
/// them as `MerkleRequest` frames, and feeds every `MerkleReply` back in.
/// Mismatching buckets are refined level by level until leaf windows remain;
/// at most `max_sync` leaf windows are pulled per round, the rest wait for
/// the next round.
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};

use super::{check_level, window_secs, MerkleError, MerkleIndex, MerkleNode, Result, TOP_LEVEL};
use crate::oplog::Category;
use crate::types::Timestamp;

/// `RequestMerkle(level, startTS, endTS)` for one category.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MerkleQuery {
    pub category: Category,
    pub level: u8,
    pub start: i64,
    pub end: i64,
}

/// A leaf window whose oplogs should be pulled.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LeafWindow {
    pub category: Category,
    pub start: i64,
    pub end: i64,
}

#[derive(Debug, Clone)]
pub struct SyncPlanner {
    category: Category,
    max_sync: usize,
    queue: VecDeque<MerkleQuery>,
    in_flight: BTreeSet<MerkleQuery>,
    pulls: Vec<LeafWindow>,
    saturated: bool,
}

impl SyncPlanner {
    /// Start a round: the top level over `[0, now + tolerance)`.
    pub fn start(category: Category, now: Timestamp, tolerance_secs: i64, max_sync: usize) -> Self {
        let mut queue = VecDeque::new();
        queue.push_back(MerkleQuery {
            category,
            level: TOP_LEVEL,
            start: 0,
            end: now.plus_seconds(tolerance_secs).ts,
        });
        SyncPlanner {
            category,
            max_sync: max_sync.max(1),
            queue,
            in_flight: BTreeSet::new(),
            pulls: Vec::new(),
            saturated: false,
        }
    }

    pub fn category(&self) -> Category {
        self.category
    }

    /// Queries to send now; they stay in flight until answered.
    pub fn next_queries(&mut self) -> Vec<MerkleQuery> {
        let out: Vec<MerkleQuery> = self.queue.drain(..).collect();
        self.in_flight.extend(out.iter().copied());
        out
    }

    pub fn is_in_flight(&self, query: &MerkleQuery) -> bool {
        self.in_flight.contains(query)
    }

    /// Compare a peer's reply with the local index and plan the next step.
    ///
    /// Replies to queries this planner never sent are ignored.
    pub fn on_reply(
        &mut self,
        query: &MerkleQuery,
        remote: &[MerkleNode],
        local: &MerkleIndex,
    ) -> Result<()> {
        if !self.in_flight.remove(query) {
            return Ok(());
        }
        check_level(query.level)?;
        if let Some(bad) = remote.iter().find(|n| n.level != query.level) {
            return Err(MerkleError::UnexpectedReply {
                want: query.level,
                got: bad.level,
            });
        }

        let local_nodes = local.nodes(query.level, query.start, query.end)?;
        let mut mismatched = BTreeSet::new();
        for node in remote {
            if node.start < query.start || node.start >= query.end {
                continue;
            }
            match local_nodes.iter().find(|l| l.start == node.start) {
                Some(l) if l.hash == node.hash => {}
                _ => {
                    mismatched.insert(node.start);
                }
            }
        }
        // buckets only we have: the peer pulls them in its own round
        if self.saturated {
            return Ok(());
        }

        let window = window_secs(query.level);
        for start in mismatched {
            let end = start.saturating_add(window);
            if query.level == 0 {
                if self.pulls.len() >= self.max_sync {
                    self.saturated = true;
                    self.queue.clear();
                    break;
                }
                self.pulls.push(LeafWindow {
                    category: self.category,
                    start,
                    end,
                });
            } else {
                self.queue.push_back(MerkleQuery {
                    category: self.category,
                    level: query.level - 1,
                    start,
                    end,
                });
            }
        }
        if self.pulls.len() >= self.max_sync {
            self.saturated = true;
            self.queue.clear();
        }
        Ok(())
    }

    /// Leaf windows selected so far.
    pub fn pulls(&self) -> &[LeafWindow] {
        &self.pulls
    }

    pub fn take_pulls(&mut self) -> Vec<LeafWindow> {
        std::mem::take(&mut self.pulls)
    }

    /// True once the budget of leaf windows is used up.
    pub fn is_saturated(&self) -> bool {
        self.saturated
    }

    /// No query queued or outstanding.
    pub fn is_done(&self) -> bool {
        self.queue.is_empty() && self.in_flight.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PttID;

    fn ts(s: i64) -> Timestamp {
        Timestamp::from_seconds(s)
    }

    /// Drive a planner against a remote index until it is done.
    fn run(planner: &mut SyncPlanner, local: &MerkleIndex, remote: &MerkleIndex) {
        for _ in 0..16 {
            let queries = planner.next_queries();
            if queries.is_empty() {
                break;
            }
            for q in queries {
                let reply = remote.nodes(q.level, q.start, q.end).unwrap();
                planner.on_reply(&q, &reply, local).unwrap();
            }
        }
    }

    #[test]
    fn test_equal_indexes_pull_nothing() {
        let entries = [(PttID::random(), [1u8; 32], ts(100))];
        let local = MerkleIndex::rebuild(entries);
        let remote = MerkleIndex::rebuild(entries);
        let mut planner = SyncPlanner::start(Category::Board, ts(1_000), 30, 5);
        run(&mut planner, &local, &remote);
        assert!(planner.is_done());
        assert!(planner.pulls().is_empty());
    }

    #[test]
    fn test_missing_leaf_is_found() {
        let shared = (PttID::random(), [1u8; 32], ts(100));
        let extra = (PttID::random(), [2u8; 32], ts(7_300));
        let local = MerkleIndex::rebuild([shared]);
        let remote = MerkleIndex::rebuild([shared, extra]);

        let mut planner = SyncPlanner::start(Category::Board, ts(10_000), 30, 5);
        run(&mut planner, &local, &remote);
        assert_eq!(
            planner.pulls(),
            &[LeafWindow {
                category: Category::Board,
                start: 7_260,
                end: 7_320
            }]
        );
    }

    #[test]
    fn test_pulls_bounded_by_max_sync() {
        let local = MerkleIndex::new();
        let remote =
            MerkleIndex::rebuild((0..10).map(|i| (PttID::random(), [i as u8; 32], ts(i * 60))));
        let mut planner = SyncPlanner::start(Category::User, ts(1_000), 30, 3);
        run(&mut planner, &local, &remote);
        assert_eq!(planner.pulls().len(), 3);
        assert!(planner.is_saturated());
        assert!(planner.is_done());
    }

    #[test]
    fn test_unsolicited_reply_ignored() {
        let local = MerkleIndex::new();
        let mut planner = SyncPlanner::start(Category::User, ts(1_000), 30, 3);
        let stray = MerkleQuery {
            category: Category::User,
            level: 0,
            start: 0,
            end: 60,
        };
        let node = MerkleNode {
            level: 0,
            start: 0,
            hash: [1u8; 32],
            count: 1,
        };
        planner.on_reply(&stray, &[node], &local).unwrap();
        assert!(planner.pulls().is_empty());
    }

    #[test]
    fn test_wrong_level_reply_rejected() {
        let local = MerkleIndex::new();
        let mut planner = SyncPlanner::start(Category::User, ts(1_000), 30, 3);
        let q = planner.next_queries()[0];
        let node = MerkleNode {
            level: 0,
            start: 0,
            hash: [1u8; 32],
            count: 1,
        };
        assert!(matches!(
            planner.on_reply(&q, &[node], &local),
            Err(MerkleError::UnexpectedReply { .. })
        ));
    }
}
