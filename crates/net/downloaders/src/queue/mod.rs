//! The task queue of a sync session.

mod batch;
mod item;

pub use batch::{Batch, BlockResult, Delivery, Expired};
pub use item::{WorkItem, WorkKey, WorkState};

use crate::{headers::validate_header_range, metrics::DownloaderMetrics};
use fbc_config::SyncConfig;
use fbc_interfaces::{
    consensus::Consensus,
    p2p::{
        error::{DownloadError, DownloadResult},
        WorkKind,
    },
};
use fbc_primitives::{
    keccak256, receipts_root, BlockBody, BlockHash, BlockNumber, Bytes, Header, PeerId, Receipt,
    SealedBlock, SealedHeader, B256,
};
use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
    sync::Arc,
    time::Duration,
};
use tokio::time::Instant;
use tracing::{debug, trace};

/// Errors that end a session from within the queue.
#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    /// An item failed more often than the retry budget allows.
    #[error("Retry budget exhausted for {0:?}.")]
    RetriesExhausted(WorkKey),
}

/// Anchors of a header range.
#[derive(Debug, Clone)]
struct HeaderRange {
    /// The header the range continues
    parent: SealedHeader,
    /// Hash of the last header of the range, if known
    anchor: Option<B256>,
}

/// A block whose header is verified and whose parts are being downloaded.
#[derive(Debug)]
struct PendingBlock {
    header: SealedHeader,
    body: Option<BlockBody>,
    receipts: Option<Vec<Receipt>>,
    needs_receipts: bool,
    header_peer: Option<PeerId>,
    body_peer: Option<PeerId>,
}

impl PendingBlock {
    fn is_complete(&self) -> bool {
        self.body.is_some() && (!self.needs_receipts || self.receipts.is_some())
    }
}

type Verify<T> = fn(&dyn Consensus, &SealedHeader, &T) -> DownloadResult<()>;
type Attach<T> = fn(&mut PendingBlock, T, PeerId);

/// Owns the work of a sync session.
///
/// Work is scheduled as header ranges and state nodes; bodies and receipts are scheduled as soon
/// as the header they belong to is verified. Items are handed to peers with
/// [`reserve`](Self::reserve), come back through the `deliver_*` methods and are reassembled into
/// contiguous [`Batch`]es.
///
/// The queue is a plain state machine: it performs no IO and is owned by a single task, which
/// makes every method call atomic with respect to the others.
#[derive(Debug)]
pub struct TaskQueue {
    consensus: Arc<dyn Consensus>,
    max_retries: usize,
    /// Every known item by key
    items: HashMap<WorkKey, WorkItem>,
    /// Pending items per kind, oldest key first
    pending: HashMap<WorkKind, BTreeSet<(u64, WorkKey)>>,
    /// Items currently assigned to a peer
    inflight: HashSet<WorkKey>,
    /// Header ranges by start block
    ranges: HashMap<BlockNumber, HeaderRange>,
    /// Blocks with a verified header, by number
    blocks: BTreeMap<BlockNumber, PendingBlock>,
    by_hash: HashMap<BlockHash, BlockNumber>,
    /// The next block to hand out
    next_block: BlockNumber,
    /// Highest block that needs receipts
    receipts_limit: Option<BlockNumber>,
    node_seq: u64,
    exhausted: Option<WorkKey>,
    metrics: DownloaderMetrics,
}

impl TaskQueue {
    /// Creates an empty queue.
    pub fn new(consensus: Arc<dyn Consensus>, config: &SyncConfig) -> Self {
        Self {
            consensus,
            max_retries: config.max_retries as usize,
            items: HashMap::new(),
            pending: HashMap::new(),
            inflight: HashSet::new(),
            ranges: HashMap::new(),
            blocks: BTreeMap::new(),
            by_hash: HashMap::new(),
            next_block: 0,
            receipts_limit: None,
            node_seq: 0,
            exhausted: None,
            metrics: DownloaderMetrics::default(),
        }
    }

    /// Drops all work and prepares for a session whose first block is `next_block`.
    pub fn reset(&mut self, next_block: BlockNumber) {
        self.items.clear();
        self.pending.clear();
        self.inflight.clear();
        self.ranges.clear();
        self.blocks.clear();
        self.by_hash.clear();
        self.next_block = next_block;
        self.receipts_limit = None;
        self.node_seq = 0;
        self.exhausted = None;
        self.metrics.buffered_blocks.set(0.0);
    }

    /// Drops all header ranges and block parts and continues at `next_block`.
    ///
    /// State nodes are kept. Returns the number of dropped items.
    pub fn rewind(&mut self, next_block: BlockNumber) -> usize {
        let dropped = self
            .items
            .keys()
            .filter(|key| key.kind() != WorkKind::State)
            .copied()
            .collect::<Vec<_>>();
        for key in &dropped {
            self.items.remove(key);
            self.inflight.remove(key);
        }
        for kind in WorkKind::ALL.into_iter().filter(|kind| *kind != WorkKind::State) {
            self.pending.remove(&kind);
        }
        self.ranges.clear();
        self.blocks.clear();
        self.by_hash.clear();
        self.next_block = next_block;
        if self.exhausted.is_some_and(|key| key.kind() != WorkKind::State) {
            self.exhausted = None;
        }
        self.metrics.buffered_blocks.set(0.0);
        debug!(target: "downloaders::queue", next_block, dropped = dropped.len(), "Rewound queue");
        dropped.len()
    }

    /// Blocks at or below the limit are assembled with their receipts.
    ///
    /// Only affects headers delivered after the call.
    pub fn set_receipts_limit(&mut self, limit: Option<BlockNumber>) {
        self.receipts_limit = limit;
    }

    /// The download metrics.
    pub fn metrics(&self) -> &DownloaderMetrics {
        &self.metrics
    }

    /// Schedules the `count` headers following `parent`.
    ///
    /// If `anchor` is set, the last header of the range must hash to it.
    pub fn schedule_headers(
        &mut self,
        parent: SealedHeader,
        count: u64,
        anchor: Option<B256>,
    ) -> WorkKey {
        let start = parent.number + 1;
        let key = WorkKey::Headers { start, count };
        trace!(target: "downloaders::queue", start, count, ?anchor, "Scheduling header range");
        self.ranges.insert(start, HeaderRange { parent, anchor });
        self.insert_pending(WorkItem::new(key, start));
        key
    }

    /// Schedules the state nodes that are not already known to the queue.
    ///
    /// Returns the number of newly scheduled nodes.
    pub fn schedule_nodes(&mut self, hashes: impl IntoIterator<Item = B256>) -> usize {
        let mut scheduled = 0;
        for hash in hashes {
            let key = WorkKey::Node(hash);
            if self.items.contains_key(&key) {
                continue
            }
            self.node_seq += 1;
            self.insert_pending(WorkItem::new(key, self.node_seq));
            scheduled += 1;
        }
        scheduled
    }

    /// Assigns up to `max` pending items of the kind to the peer.
    ///
    /// Header ranges are handed out one at a time. Items the peer already failed to serve are
    /// skipped. Never blocks: returns an empty list if nothing is available.
    pub fn reserve(
        &mut self,
        peer_id: PeerId,
        kind: WorkKind,
        max: usize,
        timeout: Duration,
        now: Instant,
    ) -> Vec<WorkKey> {
        let max = if kind == WorkKind::Headers { max.min(1) } else { max };
        let Some(pending) = self.pending.get_mut(&kind) else { return Vec::new() };
        let items = &mut self.items;

        let picked = pending
            .iter()
            .filter(|(_, key)| items.get(key).is_some_and(|item| !item.is_lacking(&peer_id)))
            .take(max)
            .copied()
            .collect::<Vec<_>>();

        let deadline = now + timeout;
        let mut keys = Vec::with_capacity(picked.len());
        for entry in picked {
            pending.remove(&entry);
            let (_, key) = entry;
            if let Some(item) = items.get_mut(&key) {
                item.set_state(WorkState::InFlight { peer_id, deadline });
                self.inflight.insert(key);
                keys.push(key);
            }
        }
        if !keys.is_empty() {
            trace!(target: "downloaders::queue", ?peer_id, %kind, items = keys.len(), "Reserved work");
        }
        keys
    }

    /// Returns true if the peer could be assigned work of the kind.
    pub fn has_work_for(&self, peer_id: &PeerId, kind: WorkKind) -> bool {
        self.pending.get(&kind).is_some_and(|pending| {
            pending
                .iter()
                .any(|(_, key)| self.items.get(key).is_some_and(|item| !item.is_lacking(peer_id)))
        })
    }

    /// Handles a header response for a reserved range.
    ///
    /// A short response to an unanchored range is accepted as far as it goes and the rest is
    /// requeued without counting as a retry. Anchored ranges are only accepted whole: anything
    /// else returns the range to the queue and the peer is not asked for it again.
    pub fn deliver_headers(
        &mut self,
        peer_id: PeerId,
        key: WorkKey,
        headers: Vec<Header>,
    ) -> DownloadResult<Delivery> {
        let WorkKey::Headers { start, count } = key else {
            return Err(DownloadError::StaleDelivery)
        };
        let range = match self.ranges.get(&start) {
            Some(range) if self.is_inflight_at(&key, &peer_id) => range.clone(),
            _ => {
                self.metrics.headers.items_drop.increment(headers.len() as u64);
                return Err(DownloadError::StaleDelivery)
            }
        };

        let headers = match validate_header_range(
            self.consensus.as_ref(),
            &range.parent,
            headers,
            count,
            range.anchor,
        ) {
            Ok(headers) => headers,
            Err(err) => {
                debug!(target: "downloaders::queue", ?peer_id, start, %err, "Rejected headers");
                self.metrics.headers.items_drop.increment(1);
                self.reject(&peer_id, &[key], &err);
                return Err(err)
            }
        };

        let retries = self.take_inflight(&key).map(|item| item.retries()).unwrap_or_default();
        self.ranges.remove(&start);

        let served = headers.len() as u64;
        if served < count {
            if let Some(last) = headers.last() {
                let rest = WorkKey::Headers { start: start + served, count: count - served };
                self.ranges.insert(
                    start + served,
                    HeaderRange { parent: last.clone(), anchor: range.anchor },
                );
                self.insert_pending(WorkItem::new(rest, start + served).with_retries(retries));
            }
        }

        self.metrics.headers.items_in.increment(served);
        for header in headers {
            self.insert_block(header, Some(peer_id));
        }
        Ok(Delivery { accepted: served as usize, nodes: Vec::new(), batch: self.take_ready() })
    }

    /// Handles a body response for the reserved hashes, in request order.
    pub fn deliver_bodies(
        &mut self,
        peer_id: PeerId,
        requested: &[WorkKey],
        bodies: Vec<BlockBody>,
    ) -> DownloadResult<Delivery> {
        self.deliver_block_parts(
            peer_id,
            WorkKind::Bodies,
            requested,
            bodies,
            |consensus, header, body| {
                consensus
                    .validate_body(header, body)
                    .map_err(|error| DownloadError::BodyValidation { hash: header.hash(), error })
            },
            |block, body, peer_id| {
                block.body = Some(body);
                block.body_peer = Some(peer_id);
            },
        )
    }

    /// Handles a receipts response for the reserved hashes, in request order.
    pub fn deliver_receipts(
        &mut self,
        peer_id: PeerId,
        requested: &[WorkKey],
        receipts: Vec<Vec<Receipt>>,
    ) -> DownloadResult<Delivery> {
        self.deliver_block_parts(
            peer_id,
            WorkKind::Receipts,
            requested,
            receipts,
            |_, header, receipts| {
                let got = receipts_root(receipts);
                if got != header.receipts_root {
                    return Err(DownloadError::ReceiptsRootMismatch {
                        hash: header.hash(),
                        got,
                        expected: header.receipts_root,
                    })
                }
                Ok(())
            },
            |block, receipts, _| block.receipts = Some(receipts),
        )
    }

    /// Handles a state node response for the reserved hashes.
    ///
    /// Nodes may arrive in any order; every node must hash to one of the requested hashes.
    pub fn deliver_nodes(
        &mut self,
        peer_id: PeerId,
        requested: &[B256],
        nodes: Vec<Bytes>,
    ) -> DownloadResult<Delivery> {
        let keys = requested.iter().map(|hash| WorkKey::Node(*hash)).collect::<Vec<_>>();
        self.check_response(&peer_id, WorkKind::State, &keys, nodes.len())?;

        let wanted = requested.iter().collect::<HashSet<_>>();
        let mut seen = HashSet::with_capacity(nodes.len());
        let mut accepted = Vec::with_capacity(nodes.len());
        for data in nodes {
            let hash = keccak256(&data);
            if !wanted.contains(&hash) {
                let err = DownloadError::UnrequestedNode { hash };
                self.metrics.states.items_drop.increment(1);
                self.reject(&peer_id, &keys, &err);
                return Err(err)
            }
            if seen.insert(hash) && self.is_inflight_at(&WorkKey::Node(hash), &peer_id) {
                accepted.push((hash, data));
            }
        }

        for (hash, _) in &accepted {
            self.take_inflight(&WorkKey::Node(*hash));
        }
        self.release_all(&peer_id, &keys);
        self.metrics.states.items_in.increment(accepted.len() as u64);

        Ok(Delivery { accepted: accepted.len(), nodes: accepted, batch: None })
    }

    fn deliver_block_parts<T>(
        &mut self,
        peer_id: PeerId,
        kind: WorkKind,
        requested: &[WorkKey],
        payloads: Vec<T>,
        verify: Verify<T>,
        attach: Attach<T>,
    ) -> DownloadResult<Delivery> {
        self.check_response(&peer_id, kind, requested, payloads.len())?;

        let mut verified = Vec::with_capacity(payloads.len());
        for (key, payload) in requested.iter().zip(payloads) {
            let Some(hash) = key.hash().filter(|_| key.kind() == kind) else { continue };
            if !self.is_inflight_at(key, &peer_id) {
                continue
            }
            let Some(block) = self.by_hash.get(&hash).and_then(|number| self.blocks.get(number))
            else {
                continue
            };
            if let Err(err) = verify(self.consensus.as_ref(), &block.header, &payload) {
                debug!(target: "downloaders::queue", ?peer_id, %kind, %hash, %err, "Rejected delivery");
                self.metrics.kind(kind).items_drop.increment(1);
                self.reject(&peer_id, requested, &err);
                return Err(err)
            }
            verified.push((*key, hash, payload));
        }

        let accepted = verified.len();
        for (key, hash, payload) in verified {
            self.complete(&key);
            if let Some(block) = self.by_hash.get(&hash).and_then(|n| self.blocks.get_mut(n)) {
                attach(block, payload, peer_id);
            }
        }
        // whatever the peer did not serve goes back to the queue
        self.release_all(&peer_id, requested);
        self.metrics.kind(kind).items_in.increment(accepted as u64);

        Ok(Delivery { accepted, nodes: Vec::new(), batch: self.take_ready() })
    }

    /// Checks the shape of a response before its items are looked at.
    fn check_response(
        &mut self,
        peer_id: &PeerId,
        kind: WorkKind,
        requested: &[WorkKey],
        received: usize,
    ) -> DownloadResult<()> {
        let err = if !requested.iter().any(|key| self.is_inflight_at(key, peer_id)) {
            DownloadError::StaleDelivery
        } else if received > requested.len() {
            DownloadError::TooManyItems { received, expected: requested.len() }
        } else if received == 0 {
            DownloadError::EmptyResponse
        } else {
            return Ok(())
        };
        self.metrics.kind(kind).items_drop.increment(received as u64);
        self.reject(peer_id, requested, &err);
        Err(err)
    }

    /// Puts the peer's items back after a rejected response.
    ///
    /// If the peer is at fault the items are released as is, since the peer is about to be
    /// dropped; otherwise they count as failed for the peer.
    fn reject(&mut self, peer_id: &PeerId, keys: &[WorkKey], err: &DownloadError) {
        for key in keys {
            if err.is_peer_fault() {
                self.release(peer_id, key);
            } else {
                self.fail(peer_id, key);
            }
        }
    }

    /// Returns an item the peer did not serve to the queue, without counting a retry.
    pub fn release(&mut self, peer_id: &PeerId, key: &WorkKey) -> bool {
        if !self.is_inflight_at(key, peer_id) {
            return false
        }
        self.requeue(key, false, None);
        true
    }

    fn release_all(&mut self, peer_id: &PeerId, keys: &[WorkKey]) {
        for key in keys {
            self.release(peer_id, key);
        }
    }

    /// Returns an item the peer failed to serve to the queue, counting a retry.
    ///
    /// The item will not be offered to the same peer again.
    pub fn fail(&mut self, peer_id: &PeerId, key: &WorkKey) -> bool {
        if !self.is_inflight_at(key, peer_id) {
            return false
        }
        self.requeue(key, true, Some(*peer_id));
        true
    }

    /// Requeues all items whose deadline has passed, counting a retry for each.
    pub fn expire(&mut self, now: Instant) -> Expired {
        let offenders = self
            .inflight
            .iter()
            .filter_map(|key| match self.items.get(key)?.state() {
                WorkState::InFlight { peer_id, deadline } if *deadline <= now => {
                    Some((*peer_id, *key))
                }
                _ => None,
            })
            .collect::<Vec<_>>();

        for (peer_id, key) in &offenders {
            debug!(target: "downloaders::queue", ?peer_id, ?key, "Request expired");
            self.metrics.kind(key.kind()).items_timeout.increment(1);
            self.requeue(key, true, None);
        }
        Expired { offenders }
    }

    /// Returns all items assigned to the peer to the queue. Used when the peer disconnects.
    pub fn reclaim(&mut self, peer_id: &PeerId) -> usize {
        let keys = self
            .inflight
            .iter()
            .filter(|key| self.is_inflight_at(key, peer_id))
            .copied()
            .collect::<Vec<_>>();
        for key in &keys {
            self.requeue(key, false, None);
        }
        keys.len()
    }

    /// Returns every assigned item to the queue.
    pub fn reclaim_all(&mut self) -> usize {
        let keys = self.inflight.iter().copied().collect::<Vec<_>>();
        for key in &keys {
            self.requeue(key, false, None);
        }
        keys.len()
    }

    /// Fails if any item ran out of retries.
    pub fn check(&self) -> Result<(), QueueError> {
        match self.exhausted {
            Some(key) => Err(QueueError::RetriesExhausted(key)),
            None => Ok(()),
        }
    }

    /// Returns the item with the given key.
    pub fn item(&self, key: &WorkKey) -> Option<&WorkItem> {
        self.items.get(key)
    }

    /// Number of pending items of the kind.
    pub fn pending_len(&self, kind: WorkKind) -> usize {
        self.pending.get(&kind).map(BTreeSet::len).unwrap_or_default()
    }

    /// Number of items assigned to peers.
    pub fn inflight_len(&self) -> usize {
        self.inflight.len()
    }

    /// Number of blocks with a verified header that were not handed out yet.
    pub fn buffered_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// The next block that will be handed out.
    pub const fn next_block(&self) -> BlockNumber {
        self.next_block
    }

    /// Returns true if there is no work left and every block was handed out.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty() && self.blocks.is_empty()
    }

    fn is_inflight_at(&self, key: &WorkKey, peer_id: &PeerId) -> bool {
        self.items.get(key).is_some_and(|item| item.is_inflight_at(peer_id))
    }

    fn insert_pending(&mut self, item: WorkItem) {
        let key = *item.key();
        self.pending.entry(key.kind()).or_default().insert((item.order, key));
        self.items.insert(key, item);
    }

    /// Removes a delivered item.
    fn take_inflight(&mut self, key: &WorkKey) -> Option<WorkItem> {
        self.inflight.remove(key);
        self.items.remove(key)
    }

    /// Marks a delivered block part. It is dropped once its block is handed out.
    fn complete(&mut self, key: &WorkKey) {
        self.inflight.remove(key);
        if let Some(item) = self.items.get_mut(key) {
            item.set_state(WorkState::Done);
        }
    }

    fn requeue(&mut self, key: &WorkKey, bump: bool, lacking: Option<PeerId>) {
        self.inflight.remove(key);
        let Some(item) = self.items.get_mut(key) else { return };
        if let Some(peer_id) = lacking {
            item.lacking.insert(peer_id);
        }
        if bump && item.bump(self.max_retries) {
            debug!(target: "downloaders::queue", ?key, retries = item.retries(), "Retry budget exhausted");
            item.set_state(WorkState::Failed);
            self.exhausted.get_or_insert(*key);
            return
        }
        item.set_state(WorkState::Pending);
        self.pending.entry(key.kind()).or_default().insert((item.order, *key));
    }

    fn insert_block(&mut self, header: SealedHeader, peer_id: Option<PeerId>) {
        let (number, hash) = header.num_hash();
        let needs_receipts = self.receipts_limit.is_some_and(|limit| number <= limit);

        let body = if header.is_empty() {
            Some(BlockBody::default())
        } else {
            self.insert_pending(WorkItem::new(WorkKey::Body(hash), number));
            None
        };
        let receipts = if !needs_receipts {
            None
        } else if header.has_empty_receipts() {
            Some(Vec::new())
        } else {
            self.insert_pending(WorkItem::new(WorkKey::Receipts(hash), number));
            None
        };

        self.by_hash.insert(hash, number);
        self.blocks.insert(
            number,
            PendingBlock { header, body, receipts, needs_receipts, header_peer: peer_id, body_peer: None },
        );
        self.metrics.buffered_blocks.set(self.blocks.len() as f64);
    }

    /// Collects the complete blocks that continue the last handed out one.
    fn take_ready(&mut self) -> Option<Batch> {
        let mut blocks = Vec::new();
        while let Some(entry) = self.blocks.first_entry() {
            if *entry.key() != self.next_block || !entry.get().is_complete() {
                break
            }
            let block = entry.remove();
            let hash = block.header.hash();
            self.by_hash.remove(&hash);
            self.items.remove(&WorkKey::Body(hash));
            self.items.remove(&WorkKey::Receipts(hash));

            blocks.push(BlockResult {
                block: SealedBlock::new(block.header, block.body.unwrap_or_default()),
                receipts: if block.needs_receipts { block.receipts } else { None },
                header_peer: block.header_peer,
                body_peer: block.body_peer,
            });
            self.next_block += 1;
        }
        self.metrics.buffered_blocks.set(self.blocks.len() as f64);

        if blocks.is_empty() {
            return None
        }
        trace!(target: "downloaders::queue", first = blocks[0].block.number, len = blocks.len(), "Blocks ready");
        Some(Batch { blocks })
    }
}
