/// Per-object oplog chains.
///
/// Within a category, oplogs of one object form a DAG through `pre_log_id`.
/// Apply follows a single path from the root: at every fork the child with
/// the newest `update_ts` wins, then the newest `create_ts`, then the
/// lexicographically lower id. Losing branches stay stored for audit.
///
/// The oldest root fixes the object's creator: a root by anyone else is
/// never applied, nor is anything built on it.
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use super::Oplog;
use crate::types::{PttID, Timestamp};

/// The ordering-relevant projection of an oplog.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChainLink {
    pub id: PttID,
    pub pre_log_id: Option<PttID>,
    pub creator_id: PttID,
    pub create_ts: Timestamp,
    pub update_ts: Timestamp,
}

impl ChainLink {
    pub fn of(oplog: &Oplog) -> Self {
        ChainLink {
            id: oplog.id,
            pre_log_id: oplog.pre_log_id,
            creator_id: oplog.creator_id,
            create_ts: oplog.create_ts,
            update_ts: oplog.update_ts,
        }
    }
}

/// Compare two competing links; `Ordering::Greater` means `a` wins.
pub fn prefer(a: &ChainLink, b: &ChainLink) -> Ordering {
    a.update_ts
        .cmp(&b.update_ts)
        .then(a.create_ts.cmp(&b.create_ts))
        .then(b.id.cmp(&a.id))
}

/// Winner among competing links.
pub fn pick_winner<'a, I>(links: I) -> Option<&'a ChainLink>
where
    I: IntoIterator<Item = &'a ChainLink>,
{
    links.into_iter().max_by(|a, b| prefer(a, b))
}

/// Result of resolving one object chain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolution {
    /// Applied path from root to head.
    pub path: Vec<PttID>,
    /// Stored links that are not on the applied path.
    pub losers: Vec<PttID>,
    /// Links whose predecessor is not stored yet.
    pub orphans: Vec<PttID>,
}

impl Resolution {
    pub fn head(&self) -> Option<&PttID> {
        self.path.last()
    }

    pub fn root(&self) -> Option<&PttID> {
        self.path.first()
    }
}

/// All stored links of one object.
#[derive(Debug, Clone, Default)]
pub struct ObjectChain {
    links: BTreeMap<PttID, ChainLink>,
}

impl ObjectChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_links<I: IntoIterator<Item = ChainLink>>(links: I) -> Self {
        let mut chain = Self::new();
        for link in links {
            chain.insert(link);
        }
        chain
    }

    /// Insert a link; returns `false` if the id was already present.
    pub fn insert(&mut self, link: ChainLink) -> bool {
        if self.links.contains_key(&link.id) {
            return false;
        }
        self.links.insert(link.id, link);
        true
    }

    pub fn contains(&self, id: &PttID) -> bool {
        self.links.contains_key(id)
    }

    pub fn get(&self, id: &PttID) -> Option<&ChainLink> {
        self.links.get(id)
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn roots(&self) -> Vec<&ChainLink> {
        self.links.values().filter(|l| l.pre_log_id.is_none()).collect()
    }

    pub fn children_of(&self, id: &PttID) -> Vec<&ChainLink> {
        self.links
            .values()
            .filter(|l| l.pre_log_id.as_ref() == Some(id))
            .collect()
    }

    /// Creator of the oldest root.
    pub fn owner(&self) -> Option<PttID> {
        self.roots()
            .into_iter()
            .min_by(|a, b| (a.create_ts, a.id).cmp(&(b.create_ts, b.id)))
            .map(|l| l.creator_id)
    }

    /// Walk from the winning root to the winning head.
    pub fn resolve(&self) -> Resolution {
        let mut path = Vec::new();
        let mut on_path = BTreeSet::new();

        let owner = self.owner();
        let roots = self.roots().into_iter().filter(|l| Some(l.creator_id) == owner);
        let mut current = pick_winner(roots).copied();
        while let Some(link) = current {
            // A cycle can only come from forged ids; stop at the first repeat.
            if !on_path.insert(link.id) {
                break;
            }
            path.push(link.id);
            current = pick_winner(self.children_of(&link.id)).copied();
        }

        let mut losers = Vec::new();
        let mut orphans = Vec::new();
        for link in self.links.values() {
            if on_path.contains(&link.id) {
                continue;
            }
            match link.pre_log_id {
                Some(pre) if !self.links.contains_key(&pre) => orphans.push(link.id),
                _ => losers.push(link.id),
            }
        }

        Resolution {
            path,
            losers,
            orphans,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(b: u8) -> PttID {
        PttID::from_bytes([b; 32])
    }

    fn link(i: u8, pre: Option<u8>, create: i64, update: i64) -> ChainLink {
        ChainLink {
            id: id(i),
            pre_log_id: pre.map(id),
            creator_id: id(200),
            create_ts: Timestamp::from_seconds(create),
            update_ts: Timestamp::from_seconds(update),
        }
    }

    #[test]
    fn test_linear_chain() {
        let chain = ObjectChain::from_links([
            link(1, None, 10, 10),
            link(2, Some(1), 20, 20),
            link(3, Some(2), 30, 30),
        ]);
        let res = chain.resolve();
        assert_eq!(res.path, vec![id(1), id(2), id(3)]);
        assert_eq!(res.head(), Some(&id(3)));
        assert!(res.losers.is_empty());
    }

    #[test]
    fn test_fork_newer_update_wins() {
        let chain = ObjectChain::from_links([
            link(1, None, 10, 10),
            link(2, Some(1), 20, 25),
            link(3, Some(1), 30, 21),
        ]);
        let res = chain.resolve();
        assert_eq!(res.path, vec![id(1), id(2)]);
        assert_eq!(res.losers, vec![id(3)]);
    }

    #[test]
    fn test_fork_tie_on_update_uses_create_then_lower_id() {
        let a = link(5, Some(1), 20, 30);
        let b = link(4, Some(1), 25, 30);
        assert_eq!(prefer(&b, &a), Ordering::Greater);

        let c = link(7, Some(1), 20, 30);
        let d = link(6, Some(1), 20, 30);
        assert_eq!(prefer(&d, &c), Ordering::Greater);
        assert_eq!(pick_winner([&c, &d]).map(|l| l.id), Some(id(6)));
    }

    #[test]
    fn test_orphans_reported() {
        let chain = ObjectChain::from_links([link(1, None, 10, 10), link(3, Some(2), 30, 30)]);
        let res = chain.resolve();
        assert_eq!(res.path, vec![id(1)]);
        assert_eq!(res.orphans, vec![id(3)]);
    }

    #[test]
    fn test_duplicate_insert_is_noop() {
        let mut chain = ObjectChain::new();
        assert!(chain.insert(link(1, None, 10, 10)));
        assert!(!chain.insert(link(1, None, 99, 99)));
        assert_eq!(chain.get(&id(1)).map(|l| l.create_ts.ts), Some(10));
    }

    #[test]
    fn test_competing_roots_pick_one() {
        let chain = ObjectChain::from_links([link(2, None, 10, 10), link(1, None, 10, 10)]);
        let res = chain.resolve();
        assert_eq!(res.root(), Some(&id(1)));
        assert_eq!(res.losers, vec![id(2)]);
    }

    #[test]
    fn test_rival_root_by_other_creator_ignored() {
        let original = link(1, None, 10, 10);
        let rival = ChainLink {
            creator_id: id(201),
            ..link(2, None, 20, 90)
        };
        let on_rival = link(3, Some(2), 30, 95);
        let chain = ObjectChain::from_links([rival, on_rival, original]);
        assert_eq!(chain.owner(), Some(id(200)));
        let res = chain.resolve();
        assert_eq!(res.path, vec![id(1)]);
        assert_eq!(res.losers, vec![id(2), id(3)]);
    }
}
