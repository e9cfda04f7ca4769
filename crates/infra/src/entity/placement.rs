//! Placement of entity instances and workers onto cluster members.
//!
//! A consistent-hash ring with virtual nodes: a membership change only moves
//! the keys whose ring segment changed owner. Every recomputation bumps the
//! table `version`.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use super::error::DirectoryError;

/// A cluster member.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Immutable snapshot of key ownership for one membership.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacementTable {
    version: u64,
    members: Vec<NodeId>,
    ring: BTreeMap<u64, NodeId>,
}

impl PlacementTable {
    /// First table for `members` (version 1).
    pub fn new(members: Vec<NodeId>, virtual_nodes: u32) -> Result<Self, DirectoryError> {
        Self::build(1, members, virtual_nodes)
    }

    /// Table for a new membership, one version after this one.
    pub fn recompute(&self, members: Vec<NodeId>, virtual_nodes: u32) -> Result<Self, DirectoryError> {
        Self::build(self.version + 1, members, virtual_nodes)
    }

    fn build(version: u64, mut members: Vec<NodeId>, virtual_nodes: u32) -> Result<Self, DirectoryError> {
        members.sort();
        members.dedup();
        if members.is_empty() {
            return Err(DirectoryError::EmptyMembership);
        }

        let mut ring = BTreeMap::new();
        for member in &members {
            for vnode in 0..virtual_nodes.max(1) {
                ring.insert(ring_hash(&format!("{}#{vnode}", member.as_str())), member.clone());
            }
        }

        Ok(Self {
            version,
            members,
            ring,
        })
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn members(&self) -> &[NodeId] {
        &self.members
    }

    /// Member owning `key`: the first ring point at or after the key's hash.
    pub fn owner(&self, key: &str) -> &NodeId {
        let hash = ring_hash(key);
        self.ring
            .range(hash..)
            .next()
            .or_else(|| self.ring.iter().next())
            .map(|(_, node)| node)
            .unwrap_or(&self.members[0])
    }
}

/// 64-bit FNV-1a. Stable across processes and releases, unlike `DefaultHasher`.
fn ring_hash(key: &str) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    let mut hash = OFFSET_BASIS;
    for byte in key.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(PRIME);
    }
    // FNV clusters short, similar keys; finish with a 64-bit mix.
    hash ^= hash >> 33;
    hash = hash.wrapping_mul(0xff51_afd7_ed55_8ccd);
    hash ^= hash >> 33;
    hash
}

/// Shared, observable placement.
///
/// The entity directory and the worker reconciler both read the current
/// table; the reconciler also subscribes to changes.
#[derive(Debug, Clone)]
pub struct Placement {
    tx: Arc<watch::Sender<Arc<PlacementTable>>>,
    virtual_nodes: u32,
}

impl Placement {
    pub fn new(members: Vec<NodeId>, virtual_nodes: u32) -> Result<Self, DirectoryError> {
        let table = PlacementTable::new(members, virtual_nodes)?;
        let (tx, _rx) = watch::channel(Arc::new(table));
        Ok(Self {
            tx: Arc::new(tx),
            virtual_nodes,
        })
    }

    /// Single-member placement.
    pub fn single(node: NodeId) -> Self {
        let table = PlacementTable {
            version: 1,
            members: vec![node.clone()],
            ring: BTreeMap::from([(0, node)]),
        };
        let (tx, _rx) = watch::channel(Arc::new(table));
        Self {
            tx: Arc::new(tx),
            virtual_nodes: 1,
        }
    }

    pub fn current(&self) -> Arc<PlacementTable> {
        self.tx.borrow().clone()
    }

    /// Recompute the table for a new membership and publish it.
    pub fn update_membership(&self, members: Vec<NodeId>) -> Result<Arc<PlacementTable>, DirectoryError> {
        let next = Arc::new(self.current().recompute(members, self.virtual_nodes)?);
        self.tx.send_replace(next.clone());
        Ok(next)
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<PlacementTable>> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nodes(names: &[&str]) -> Vec<NodeId> {
        names.iter().map(|n| NodeId::new(*n)).collect()
    }

    #[test]
    fn owner_is_deterministic_and_a_member() {
        let a = PlacementTable::new(nodes(&["n1", "n2", "n3"]), 64).unwrap();
        let b = PlacementTable::new(nodes(&["n3", "n1", "n2"]), 64).unwrap();

        for i in 0..200 {
            let key = format!("cart-{i}");
            assert_eq!(a.owner(&key), b.owner(&key));
            assert!(a.members().contains(a.owner(&key)));
        }
    }

    #[test]
    fn every_member_gets_some_keys() {
        let table = PlacementTable::new(nodes(&["n1", "n2", "n3"]), 64).unwrap();
        for member in table.members() {
            let owned = (0..600)
                .filter(|i| table.owner(&format!("key-{i}")) == member)
                .count();
            assert!(owned > 50, "{member} owns only {owned} keys");
        }
    }

    #[test]
    fn adding_a_member_only_moves_keys_to_it() {
        let before = PlacementTable::new(nodes(&["n1", "n2"]), 64).unwrap();
        let after = before.recompute(nodes(&["n1", "n2", "n3"]), 64).unwrap();
        assert_eq!(after.version(), before.version() + 1);

        for i in 0..500 {
            let key = format!("key-{i}");
            let (old, new) = (before.owner(&key), after.owner(&key));
            if old != new {
                assert_eq!(new.as_str(), "n3");
            }
        }
    }

    #[test]
    fn empty_membership_is_rejected() {
        assert_eq!(
            PlacementTable::new(vec![], 8).unwrap_err(),
            DirectoryError::EmptyMembership
        );
        let placement = Placement::new(nodes(&["n1"]), 8).unwrap();
        assert!(placement.update_membership(vec![]).is_err());
        assert_eq!(placement.current().version(), 1);
    }

    #[test]
    fn subscribers_see_membership_changes() {
        let placement = Placement::new(nodes(&["n1"]), 8).unwrap();
        let mut rx = placement.subscribe();
        placement.update_membership(nodes(&["n1", "n2"])).unwrap();
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().version(), 2);
    }
}
