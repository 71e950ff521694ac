//! Download of the state trie at the fast sync pivot.
//!
//! Nodes are requested by hash, starting at the pivot's state root, and each delivered node
//! makes its children requestable. A node is only written once all of its children are stored,
//! so the store never holds a node with a missing subtree and an interrupted download can be
//! resumed from whatever is present.

use crate::error::SyncError;
use fbc_interfaces::provider::{KeyValueStore, ProviderError};
use fbc_primitives::{keccak256, BlockNumber, Bytes, TrieNode, B256};
use std::collections::{hash_map::Entry, HashMap, HashSet};
use tracing::{debug, trace};

#[derive(Debug)]
struct PendingNode {
    data: Bytes,
    /// Children not stored yet
    missing: usize,
}

/// Reconstruction of the state trie under a single root.
#[derive(Debug)]
pub(crate) struct StateSync {
    pivot: BlockNumber,
    root: B256,
    /// Downloaded nodes waiting for their children
    pending: HashMap<B256, PendingNode>,
    /// Parents waiting for a node, by node
    parents: HashMap<B256, Vec<B256>>,
    /// Scheduled but not downloaded
    requested: HashSet<B256>,
    pulled: u64,
    known: u64,
    done: bool,
}

impl StateSync {
    /// Starts the download of the state of the pivot block.
    ///
    /// Returns the sync together with the node hashes to schedule.
    pub(crate) fn new(
        pivot: BlockNumber,
        root: B256,
        store: &dyn KeyValueStore,
    ) -> Result<(Self, Vec<B256>), SyncError> {
        let mut sync = Self {
            pivot,
            root,
            pending: HashMap::new(),
            parents: HashMap::new(),
            requested: HashSet::new(),
            pulled: 0,
            known: 0,
            done: false,
        };
        if store.has(&root)? {
            debug!(target: "sync::state", pivot, %root, "Pivot state already present");
            sync.done = true;
            return Ok((sync, Vec::new()))
        }
        sync.requested.insert(root);
        sync.known = 1;
        Ok((sync, vec![root]))
    }

    /// Returns `true` once the root is stored.
    pub(crate) const fn is_done(&self) -> bool {
        self.done
    }

    /// Nodes downloaded so far.
    pub(crate) const fn pulled(&self) -> u64 {
        self.pulled
    }

    /// Nodes known to be needed so far.
    pub(crate) const fn known(&self) -> u64 {
        self.known
    }

    /// Processes verified nodes, returning the children that need to be scheduled.
    pub(crate) fn on_nodes(
        &mut self,
        nodes: Vec<(B256, Bytes)>,
        store: &dyn KeyValueStore,
    ) -> Result<Vec<B256>, SyncError> {
        let mut schedule = Vec::new();
        for (hash, data) in nodes {
            if !self.requested.remove(&hash) {
                continue
            }
            self.pulled += 1;
            let node = TrieNode::decode_raw(&data).map_err(|_| SyncError::CorruptNode { hash })?;

            let mut seen = HashSet::with_capacity(node.children.len());
            let mut missing = 0;
            for child in node.children {
                if !seen.insert(child) || store.has(&child)? {
                    continue
                }
                missing += 1;
                self.parents.entry(child).or_default().push(hash);
                if !self.pending.contains_key(&child) && self.requested.insert(child) {
                    schedule.push(child);
                    self.known += 1;
                }
            }

            if missing == 0 {
                self.commit(hash, data, store)?;
            } else {
                self.pending.insert(hash, PendingNode { data, missing });
            }
        }
        trace!(
            target: "sync::state",
            pulled = self.pulled,
            scheduled = schedule.len(),
            waiting = self.pending.len(),
            "Processed state nodes"
        );
        Ok(schedule)
    }

    /// Writes the node and every waiting ancestor it completes.
    fn commit(&mut self, hash: B256, data: Bytes, store: &dyn KeyValueStore) -> Result<(), SyncError> {
        let mut ready = vec![(hash, data)];
        while let Some((hash, data)) = ready.pop() {
            store.put(hash, data)?;
            if hash == self.root {
                debug!(target: "sync::state", pivot = self.pivot, root = %hash, "State root committed");
                self.done = true;
            }
            for parent in self.parents.remove(&hash).unwrap_or_default() {
                if let Entry::Occupied(mut entry) = self.pending.entry(parent) {
                    entry.get_mut().missing -= 1;
                    if entry.get().missing == 0 {
                        ready.push((parent, entry.remove().data));
                    }
                }
            }
        }
        Ok(())
    }

    /// Walks the stored trie from the root and checks that every node hashes to the key it is
    /// stored under.
    pub(crate) fn verify(&self, store: &dyn KeyValueStore) -> Result<(), SyncError> {
        let mut stack = vec![self.root];
        let mut visited = HashSet::new();
        while let Some(hash) = stack.pop() {
            if !visited.insert(hash) {
                continue
            }
            let data = store.get(&hash)?.ok_or(ProviderError::MissingState { root: hash })?;
            let got = keccak256(&data);
            if got != hash {
                return Err(SyncError::PivotStateMismatch { number: self.pivot, expected: hash, got })
            }
            let node = TrieNode::decode_raw(&data).map_err(|_| SyncError::CorruptNode { hash })?;
            stack.extend(node.children);
        }
        debug!(target: "sync::state", pivot = self.pivot, nodes = visited.len(), "Verified pivot state");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use fbc_interfaces::test_utils::{MemoryKv, TestChain, TestState};

    /// Answers every request from the chain, one node per round.
    fn download(sync: &mut StateSync, mut schedule: Vec<B256>, chain: &TestChain, kv: &MemoryKv) {
        while let Some(hash) = schedule.pop() {
            let data = chain.node(&hash).unwrap().clone();
            schedule.extend(sync.on_nodes(vec![(hash, data)], kv).unwrap());
        }
    }

    #[test]
    fn rebuilds_pivot_state() {
        let chain = TestChain::new(20, 3);
        let pivot = chain.block(15).unwrap();
        let kv = MemoryKv::default();
        kv.extend(chain.state_nodes(0));

        let (mut sync, schedule) = StateSync::new(15, pivot.state_root, &kv).unwrap();
        assert_eq!(schedule, vec![pivot.state_root]);
        download(&mut sync, schedule, &chain, &kv);

        assert!(sync.is_done());
        assert_eq!(sync.pulled(), sync.known());
        sync.verify(&kv).unwrap();
        let state = TestState::load(pivot.state_root, &kv).unwrap();
        assert_eq!(state.commit().0, pivot.state_root);
    }

    #[test]
    fn nodes_are_written_bottom_up() {
        let chain = TestChain::new(5, 3);
        let root = chain.block(5).unwrap().state_root;
        let kv = MemoryKv::default();

        let (mut sync, schedule) = StateSync::new(5, root, &kv).unwrap();
        let children = sync.on_nodes(vec![(root, chain.node(&root).unwrap().clone())], &kv).unwrap();
        assert!(!children.is_empty());
        assert!(!kv.has(&root).unwrap(), "root must wait for its children");
        assert!(!sync.is_done());

        download(&mut sync, children, &chain, &kv);
        assert!(kv.has(&root).unwrap());
        assert!(sync.is_done());
        assert_eq!(schedule.len(), 1);
    }

    #[test]
    fn present_root_needs_no_download() {
        let chain = TestChain::new(5, 3);
        let kv = MemoryKv::default();
        kv.extend(chain.state_nodes(5));

        let (sync, schedule) = StateSync::new(5, chain.block(5).unwrap().state_root, &kv).unwrap();
        assert!(sync.is_done());
        assert!(schedule.is_empty());
    }

    #[test]
    fn tampered_store_fails_verification() {
        let chain = TestChain::new(5, 3);
        let root = chain.block(5).unwrap().state_root;
        let kv = MemoryKv::default();
        let (leaf, _) = chain.state_nodes(5)[0].clone();
        kv.put(leaf, Bytes::from_static(b"garbage")).unwrap();

        let (mut sync, schedule) = StateSync::new(5, root, &kv).unwrap();
        download(&mut sync, schedule, &chain, &kv);
        assert!(sync.is_done());

        let err = sync.verify(&kv).unwrap_err();
        assert_matches!(err, SyncError::PivotStateMismatch { number: 5, expected, .. } if expected == leaf);
        assert!(err.is_fatal());
    }

    #[test]
    fn undecodable_node_is_corrupt() {
        let kv = MemoryKv::default();
        let data = Bytes::from_static(&[0xff, 0x00]);
        let hash = keccak256(&data);
        let (mut sync, _) = StateSync::new(1, hash, &kv).unwrap();
        assert_matches!(sync.on_nodes(vec![(hash, data)], &kv), Err(SyncError::CorruptNode { .. }));
    }
}
