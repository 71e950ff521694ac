//! Fetching of blocks that are propagated after the node caught up with the network.
//!
//! Peers announce new blocks by hash, or push them in full. Announcements are collected for a
//! short grace period, since the full block often arrives by itself, and only then fetched
//! explicitly: first the header, then the body if the header says there is one. Completed
//! blocks are queued by number and imported once their parent is known.
//!
//! The [`BlockFetcher`] is a plain state machine driven with explicit timestamps. The
//! [`FetcherTask`] drives it from the network and performs the requests it asks for.

use crate::{
    cache::LruCache,
    fetch::FetchClient,
    message::{BlockHashNumber, GetBlockHeaders},
    metrics::BlockFetcherMetrics,
};
use fbc_config::FetcherConfig;
use fbc_interfaces::{
    p2p::error::RequestResult, sync::SyncStateProvider, FbcError, FbcResult,
};
use fbc_primitives::{
    BlockBody, BlockHash, BlockNumber, Head, Header, PeerId, SealedBlock, SealedHeader,
};
use futures::{future::BoxFuture, stream::FuturesUnordered, FutureExt, StreamExt};
use std::{
    collections::{hash_map::Entry, BTreeMap, HashMap, VecDeque},
    num::NonZeroUsize,
    sync::Arc,
    time::Duration,
};
use tokio::{
    sync::mpsc,
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Number of recently imported or rejected block hashes to remember.
const KNOWN_BLOCKS_LIMIT: usize = 1024;

/// Imports propagated blocks into the local chain.
#[auto_impl::auto_impl(&, Arc, Box)]
pub trait BlockImporter: Send + Sync {
    /// The current canonical head.
    fn head(&self) -> FbcResult<Head>;

    /// Returns true if the block is stored locally.
    fn has_block(&self, hash: &BlockHash) -> FbcResult<bool>;

    /// Validates, executes and stores the block. Its parent is known to be stored.
    fn import_block(&self, block: SealedBlock) -> FbcResult<()>;
}

/// What became of an announcement or a propagated block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropagationOutcome {
    /// Scheduled for fetching or import.
    Accepted,
    /// Dropped because a bulk sync is running.
    Syncing,
    /// Dropped because the block is already known or pending.
    Known,
    /// Dropped because the block is too far from the local head.
    TooFar,
    /// Dropped because the peer exceeded its allowance.
    Flooding,
}

/// Actions the [`BlockFetcher`] asks its driver to perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchAction {
    /// Request the header of the block from the peer.
    FetchHeader {
        /// The peer to ask.
        peer_id: PeerId,
        /// Hash of the block.
        hash: BlockHash,
    },
    /// Request the body of the block from the peer.
    FetchBody {
        /// The peer to ask.
        peer_id: PeerId,
        /// Hash of the block.
        hash: BlockHash,
    },
    /// A block delivered by the peer was imported.
    Imported {
        /// The peer the block came from.
        peer_id: PeerId,
        /// Hash of the block.
        hash: BlockHash,
        /// Number of the block.
        number: BlockNumber,
    },
    /// The peer delivered an invalid block.
    DropPeer {
        /// The misbehaving peer.
        peer_id: PeerId,
    },
}

/// A block hash a peer announced, or an unknown parent that needs fetching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Announcement {
    /// Hash of the block.
    pub hash: BlockHash,
    /// Number of the block.
    pub number: BlockNumber,
    /// The announcing peer.
    pub peer_id: PeerId,
    /// When the announcement arrived.
    pub arrived: Instant,
    /// Number of ancestors between this block and the originally propagated one.
    pub depth: u64,
}

#[derive(Debug)]
struct Fetching {
    announce: Announcement,
    started: Instant,
}

#[derive(Debug)]
struct Completing {
    announce: Announcement,
    header: SealedHeader,
    started: Instant,
}

#[derive(Debug)]
struct Queued {
    peer_id: PeerId,
    block: SealedBlock,
    depth: u64,
    queued_at: Instant,
    announced: bool,
}

/// State machine behind block propagation.
///
/// Inert while a bulk sync is running: everything it receives in that time is dropped.
pub struct BlockFetcher<I> {
    config: FetcherConfig,
    importer: I,
    sync_state: Arc<dyn SyncStateProvider>,
    /// Announcements waiting for the grace period to pass.
    announced: HashMap<BlockHash, Vec<Announcement>>,
    /// Blocks whose header was requested.
    fetching: HashMap<BlockHash, Fetching>,
    /// Blocks whose body was requested.
    completing: HashMap<BlockHash, Completing>,
    /// Complete blocks waiting for import, lowest first.
    queued: BTreeMap<(BlockNumber, BlockHash), Queued>,
    queued_numbers: HashMap<BlockHash, BlockNumber>,
    /// Pending announcements per peer.
    announces_per_peer: HashMap<PeerId, usize>,
    /// Queued blocks per peer.
    blocks_per_peer: HashMap<PeerId, usize>,
    /// Announcement timestamps within the rate limit window, per peer.
    windows: HashMap<PeerId, VecDeque<Instant>>,
    /// Peers whose announcements are ignored until the given time.
    flagged: HashMap<PeerId, Instant>,
    /// Measured fetch latency per peer.
    latencies: HashMap<PeerId, Duration>,
    known: LruCache<BlockHash>,
    actions: VecDeque<FetchAction>,
    metrics: BlockFetcherMetrics,
}

impl<I> std::fmt::Debug for BlockFetcher<I> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockFetcher")
            .field("announced", &self.announced.len())
            .field("fetching", &self.fetching.len())
            .field("completing", &self.completing.len())
            .field("queued", &self.queued.len())
            .finish_non_exhaustive()
    }
}

impl<I: BlockImporter> BlockFetcher<I> {
    /// Creates a new fetcher.
    pub fn new(
        config: FetcherConfig,
        importer: I,
        sync_state: Arc<dyn SyncStateProvider>,
    ) -> Self {
        Self {
            config,
            importer,
            sync_state,
            announced: Default::default(),
            fetching: Default::default(),
            completing: Default::default(),
            queued: Default::default(),
            queued_numbers: Default::default(),
            announces_per_peer: Default::default(),
            blocks_per_peer: Default::default(),
            windows: Default::default(),
            flagged: Default::default(),
            latencies: Default::default(),
            known: LruCache::new(
                NonZeroUsize::new(KNOWN_BLOCKS_LIMIT).unwrap_or(NonZeroUsize::MIN),
            ),
            actions: Default::default(),
            metrics: Default::default(),
        }
    }

    /// The configuration of the fetcher.
    pub const fn config(&self) -> &FetcherConfig {
        &self.config
    }

    /// Handles a block announcement.
    pub fn announce(
        &mut self,
        peer_id: PeerId,
        hash: BlockHash,
        number: BlockNumber,
        now: Instant,
    ) -> PropagationOutcome {
        self.metrics.announces_in.increment(1);
        let outcome = self.on_announce(peer_id, hash, number, now);
        match outcome {
            PropagationOutcome::Accepted => {}
            PropagationOutcome::Flooding => self.metrics.announces_dos.increment(1),
            _ => self.metrics.announces_drop.increment(1),
        }
        trace!(target: "net::fetcher", ?peer_id, %hash, number, ?outcome, "Block announced");
        outcome
    }

    fn on_announce(
        &mut self,
        peer_id: PeerId,
        hash: BlockHash,
        number: BlockNumber,
        now: Instant,
    ) -> PropagationOutcome {
        if self.sync_state.is_syncing() {
            return PropagationOutcome::Syncing
        }
        if !self.record_announce(peer_id, now) {
            return PropagationOutcome::Flooding
        }
        if self.announces_per_peer.get(&peer_id).copied().unwrap_or_default() >=
            self.config.hash_limit
        {
            return PropagationOutcome::Flooding
        }
        let Some(head) = self.head() else { return PropagationOutcome::Syncing };
        if !self.within_distance(number, head.number) {
            return PropagationOutcome::TooFar
        }
        if self.is_pending(&hash) || self.is_known(&hash) {
            return PropagationOutcome::Known
        }
        let announces = self.announced.entry(hash).or_default();
        if announces.iter().any(|a| a.peer_id == peer_id) {
            return PropagationOutcome::Known
        }
        announces.push(Announcement { hash, number, peer_id, arrived: now, depth: 0 });
        *self.announces_per_peer.entry(peer_id).or_default() += 1;
        PropagationOutcome::Accepted
    }

    /// Handles a block a peer propagated in full.
    pub fn inject(&mut self, peer_id: PeerId, block: SealedBlock, now: Instant) -> PropagationOutcome {
        self.metrics.broadcasts_in.increment(1);
        let hash = block.hash();
        let number = block.number;
        let outcome = self.on_inject(peer_id, block, now);
        match outcome {
            PropagationOutcome::Accepted => {}
            PropagationOutcome::Flooding => self.metrics.broadcasts_dos.increment(1),
            _ => self.metrics.broadcasts_drop.increment(1),
        }
        trace!(target: "net::fetcher", ?peer_id, %hash, number, ?outcome, "Block propagated");
        outcome
    }

    fn on_inject(&mut self, peer_id: PeerId, block: SealedBlock, now: Instant) -> PropagationOutcome {
        if self.sync_state.is_syncing() {
            return PropagationOutcome::Syncing
        }
        if self.blocks_per_peer.get(&peer_id).copied().unwrap_or_default() >=
            self.config.block_limit
        {
            return PropagationOutcome::Flooding
        }
        let Some(head) = self.head() else { return PropagationOutcome::Syncing };
        if !self.within_distance(block.number, head.number) {
            return PropagationOutcome::TooFar
        }
        let hash = block.hash();
        if self.queued_numbers.contains_key(&hash) || self.is_known(&hash) {
            return PropagationOutcome::Known
        }
        self.enqueue(peer_id, block, 0, false, now);
        PropagationOutcome::Accepted
    }

    /// Handles the outcome of a header fetch.
    pub fn on_header(
        &mut self,
        peer_id: PeerId,
        hash: BlockHash,
        result: RequestResult<Vec<Header>>,
        now: Instant,
    ) {
        let Entry::Occupied(entry) = self.fetching.entry(hash) else { return };
        if entry.get().announce.peer_id != peer_id {
            return
        }
        let Fetching { announce, started } = entry.remove();

        let header = match result {
            Ok(headers) => {
                self.metrics.filter_headers_in.increment(headers.len() as u64);
                headers.into_iter().next().map(Header::seal_slow)
            }
            Err(err) => {
                trace!(target: "net::fetcher", ?peer_id, %hash, %err, "Header fetch failed");
                None
            }
        };
        let Some(header) = header.filter(|header| header.hash() == hash) else {
            self.fetch_failed(announce);
            return
        };
        self.metrics.filter_headers_out.increment(1);
        self.latencies.insert(peer_id, now.saturating_duration_since(started));

        if header.is_empty() {
            let block = SealedBlock::new(header, BlockBody::default());
            self.enqueue(peer_id, block, announce.depth, true, now);
        } else {
            self.metrics.fetch_bodies.increment(1);
            self.actions.push_back(FetchAction::FetchBody { peer_id, hash });
            self.completing.insert(hash, Completing { announce, header, started: now });
        }
    }

    /// Handles the outcome of a body fetch.
    pub fn on_body(
        &mut self,
        peer_id: PeerId,
        hash: BlockHash,
        result: RequestResult<Vec<BlockBody>>,
        now: Instant,
    ) {
        let Entry::Occupied(entry) = self.completing.entry(hash) else { return };
        if entry.get().announce.peer_id != peer_id {
            return
        }
        let Completing { announce, header, started } = entry.remove();

        let body = match result {
            Ok(bodies) => {
                self.metrics.filter_bodies_in.increment(bodies.len() as u64);
                bodies.into_iter().next()
            }
            Err(err) => {
                trace!(target: "net::fetcher", ?peer_id, %hash, %err, "Body fetch failed");
                None
            }
        };
        let Some(body) = body.filter(|body| body.matches(&header)) else {
            self.fetch_failed(announce);
            return
        };
        self.metrics.filter_bodies_out.increment(1);
        self.latencies.insert(peer_id, now.saturating_duration_since(started));
        self.enqueue(peer_id, SealedBlock::new(header, body), announce.depth, true, now);
    }

    /// Forgets everything the peer announced.
    pub fn forget_peer(&mut self, peer_id: &PeerId) {
        self.announced.retain(|_, announces| {
            announces.retain(|a| a.peer_id != *peer_id);
            !announces.is_empty()
        });
        self.announces_per_peer.remove(peer_id);
        self.windows.remove(peer_id);
        self.latencies.remove(peer_id);
    }

    /// Advances timers, imports what can be imported and returns the resulting actions.
    pub fn poll(&mut self, now: Instant) -> Vec<FetchAction> {
        self.expire(now);
        self.import_queued(now);
        self.schedule_fetches(now);
        self.metrics.queued_blocks.set(self.queued.len() as f64);
        self.actions.drain(..).collect()
    }

    /// Number of blocks waiting for import.
    pub fn queued(&self) -> usize {
        self.queued.len()
    }

    /// Number of announcements waiting to be fetched.
    pub fn announced(&self) -> usize {
        self.announced.values().map(Vec::len).sum()
    }

    /// Returns true if the block is being fetched.
    pub fn is_fetching(&self, hash: &BlockHash) -> bool {
        self.fetching.contains_key(hash) || self.completing.contains_key(hash)
    }

    /// Slides the rate limit window of the peer, returning false if the peer is flooding.
    fn record_announce(&mut self, peer_id: PeerId, now: Instant) -> bool {
        if let Some(until) = self.flagged.get(&peer_id) {
            if *until > now {
                return false
            }
            self.flagged.remove(&peer_id);
        }
        let window = self.windows.entry(peer_id).or_default();
        while window.front().is_some_and(|t| now.saturating_duration_since(*t) >= self.config.announce_window) {
            window.pop_front();
        }
        if window.len() >= self.config.max_announcements {
            debug!(target: "net::fetcher", ?peer_id, "Peer is flooding announcements");
            self.flagged.insert(peer_id, now + self.config.announce_window);
            window.clear();
            return false
        }
        window.push_back(now);
        true
    }

    fn head(&self) -> Option<Head> {
        match self.importer.head() {
            Ok(head) => Some(head),
            Err(err) => {
                warn!(target: "net::fetcher", %err, "Failed to read chain head");
                None
            }
        }
    }

    fn within_distance(&self, number: BlockNumber, head: BlockNumber) -> bool {
        let dist = number as i128 - head as i128;
        dist >= -(self.config.max_uncle_dist as i128) && dist <= self.config.max_queue_dist as i128
    }

    /// Returns true if the block is known. Blocks the store can not look up are skipped as well.
    fn is_known(&self, hash: &BlockHash) -> bool {
        self.known.contains(hash) || self.in_store(hash).unwrap_or(true)
    }

    /// Looks the block up in the chain, `None` if the lookup failed.
    fn in_store(&self, hash: &BlockHash) -> Option<bool> {
        match self.importer.has_block(hash) {
            Ok(stored) => Some(stored),
            Err(err) => {
                warn!(target: "net::fetcher", %hash, %err, "Block lookup failed");
                None
            }
        }
    }

    fn is_pending(&self, hash: &BlockHash) -> bool {
        self.is_fetching(hash) || self.queued_numbers.contains_key(hash)
    }

    fn release_announce(&mut self, announce: &Announcement) {
        if let Entry::Occupied(mut count) = self.announces_per_peer.entry(announce.peer_id) {
            *count.get_mut() = count.get().saturating_sub(1);
            if *count.get() == 0 {
                count.remove();
            }
        }
    }

    /// Drops every announcement of the hash.
    fn forget_hash(&mut self, hash: &BlockHash) {
        for announce in self.announced.remove(hash).unwrap_or_default() {
            self.release_announce(&announce);
        }
        if let Some(fetching) = self.fetching.remove(hash) {
            self.release_announce(&fetching.announce);
        }
        if let Some(completing) = self.completing.remove(hash) {
            self.release_announce(&completing.announce);
        }
    }

    fn fetch_failed(&mut self, announce: Announcement) {
        self.metrics.fetch_timeouts.increment(1);
        self.release_announce(&announce);
        // alternative announcers stay in `announced` and are tried on the next poll
        debug!(target: "net::fetcher", peer_id = ?announce.peer_id, hash = %announce.hash, "Block fetch failed");
    }

    fn enqueue(
        &mut self,
        peer_id: PeerId,
        block: SealedBlock,
        depth: u64,
        announced: bool,
        now: Instant,
    ) {
        let hash = block.hash();
        self.forget_hash(&hash);
        self.queued_numbers.insert(hash, block.number);
        *self.blocks_per_peer.entry(peer_id).or_default() += 1;
        self.queued.insert(
            (block.number, hash),
            Queued { peer_id, block, depth, queued_at: now, announced },
        );
    }

    fn dequeue(&mut self, key: &(BlockNumber, BlockHash)) -> Option<Queued> {
        let queued = self.queued.remove(key)?;
        self.queued_numbers.remove(&key.1);
        if let Entry::Occupied(mut count) = self.blocks_per_peer.entry(queued.peer_id) {
            *count.get_mut() = count.get().saturating_sub(1);
            if *count.get() == 0 {
                count.remove();
            }
        }
        Some(queued)
    }

    fn expire(&mut self, now: Instant) {
        let fetch_timeout = self.config.fetch_timeout;

        let timed_out = self
            .fetching
            .iter()
            .filter(|(_, f)| now.saturating_duration_since(f.started) >= fetch_timeout)
            .map(|(hash, _)| *hash)
            .collect::<Vec<_>>();
        for hash in timed_out {
            if let Some(fetching) = self.fetching.remove(&hash) {
                self.fetch_failed(fetching.announce);
            }
        }
        let timed_out = self
            .completing
            .iter()
            .filter(|(_, c)| now.saturating_duration_since(c.started) >= fetch_timeout)
            .map(|(hash, _)| *hash)
            .collect::<Vec<_>>();
        for hash in timed_out {
            if let Some(completing) = self.completing.remove(&hash) {
                self.fetch_failed(completing.announce);
            }
        }

        // announcements nobody could deliver age out
        let max_age = self.config.arrive_timeout + fetch_timeout;
        let mut aged = Vec::new();
        self.announced.retain(|_, announces| {
            announces.retain(|a| {
                let keep = now.saturating_duration_since(a.arrived) <= max_age;
                if !keep {
                    aged.push(*a);
                }
                keep
            });
            !announces.is_empty()
        });
        for announce in aged {
            self.release_announce(&announce);
        }

        // blocks whose ancestry never arrived
        let max_queued = fetch_timeout * (self.config.max_lookup_depth as u32 + 1);
        let stale = self
            .queued
            .iter()
            .filter(|(_, q)| now.saturating_duration_since(q.queued_at) >= max_queued)
            .map(|(key, _)| *key)
            .collect::<Vec<_>>();
        for key in stale {
            self.dequeue(&key);
        }
    }

    fn schedule_fetches(&mut self, now: Instant) {
        let wait = self.config.arrive_timeout.saturating_sub(self.config.gather_slack);
        let ready = self
            .announced
            .iter()
            .filter(|(hash, announces)| {
                !self.is_fetching(hash) &&
                    announces.iter().any(|a| now.saturating_duration_since(a.arrived) >= wait)
            })
            .map(|(hash, _)| *hash)
            .collect::<Vec<_>>();

        for hash in ready {
            let Some(announces) = self.announced.get_mut(&hash) else { continue };
            // prefer the announcer that answered fastest so far
            let latencies = &self.latencies;
            let fetch_timeout = self.config.fetch_timeout;
            let Some((idx, _)) = announces
                .iter()
                .enumerate()
                .min_by_key(|(_, a)| latencies.get(&a.peer_id).copied().unwrap_or(fetch_timeout))
            else {
                continue
            };
            let announce = announces.swap_remove(idx);
            if announces.is_empty() {
                self.announced.remove(&hash);
            }

            self.metrics.fetch_headers.increment(1);
            self.actions.push_back(FetchAction::FetchHeader { peer_id: announce.peer_id, hash });
            self.fetching.insert(hash, Fetching { announce, started: now });
        }
    }

    fn import_queued(&mut self, now: Instant) {
        let keys = self.queued.keys().copied().collect::<Vec<_>>();
        for key in keys {
            let Some(head) = self.head() else { return };
            let (number, hash) = key;

            if number + self.config.max_uncle_dist < head.number || self.is_known(&hash) {
                self.dequeue(&key);
                continue
            }

            let Some(queued) = self.queued.get(&key) else { continue };
            let parent_hash = queued.block.parent_hash;
            let Some(parent_stored) = self.in_store(&parent_hash) else {
                self.dequeue(&key);
                continue
            };
            if !parent_stored {
                let (peer_id, depth) = (queued.peer_id, queued.depth);
                if self.is_pending(&parent_hash) {
                    continue
                }
                if depth >= self.config.max_lookup_depth || number == 0 {
                    debug!(target: "net::fetcher", %hash, number, depth, "Dropping block with unknown ancestry");
                    self.dequeue(&key);
                    continue
                }
                // fetch the parent from the same peer right away
                let arrived = now.checked_sub(self.config.arrive_timeout).unwrap_or(now);
                self.announced.entry(parent_hash).or_default().push(Announcement {
                    hash: parent_hash,
                    number: number - 1,
                    peer_id,
                    arrived,
                    depth: depth + 1,
                });
                *self.announces_per_peer.entry(peer_id).or_default() += 1;
                continue
            }

            let Some(Queued { peer_id, block, announced, .. }) = self.dequeue(&key) else {
                continue
            };
            match self.importer.import_block(block) {
                Ok(()) => {
                    debug!(target: "net::fetcher", ?peer_id, %hash, number, "Imported propagated block");
                    if announced {
                        self.metrics.announces_out.increment(1);
                    } else {
                        self.metrics.broadcasts_out.increment(1);
                    }
                    self.known.insert(hash);
                    self.actions.push_back(FetchAction::Imported { peer_id, hash, number });
                }
                Err(err) => {
                    self.metrics.import_failures.increment(1);
                    warn!(target: "net::fetcher", ?peer_id, %hash, number, %err, "Propagated block import failed");
                    // store failures leave the block eligible for another inject
                    if matches!(err, FbcError::Consensus(_) | FbcError::Execution(_)) {
                        self.known.insert(hash);
                        self.actions.push_back(FetchAction::DropPeer { peer_id });
                    }
                }
            }
        }
    }
}

/// Messages accepted by the [`FetcherTask`].
#[derive(Debug)]
pub enum FetcherMessage {
    /// Block hashes a peer announced.
    Announce {
        /// The announcing peer.
        peer_id: PeerId,
        /// The announced blocks.
        hashes: Vec<BlockHashNumber>,
    },
    /// A block a peer propagated in full.
    Block {
        /// The propagating peer.
        peer_id: PeerId,
        /// The block.
        block: SealedBlock,
    },
    /// The peer disconnected.
    PeerDropped {
        /// The peer.
        peer_id: PeerId,
    },
}

/// Events emitted by the [`FetcherTask`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetcherEvent {
    /// A propagated block was imported.
    Imported {
        /// The peer the block came from.
        peer_id: PeerId,
        /// Hash of the block.
        hash: BlockHash,
        /// Number of the block.
        number: BlockNumber,
    },
    /// A peer delivered an invalid block and should be disconnected.
    BadPeer {
        /// The peer.
        peer_id: PeerId,
    },
}

/// Handle to send messages to a running [`FetcherTask`].
#[derive(Debug, Clone)]
pub struct FetcherHandle {
    tx: mpsc::UnboundedSender<FetcherMessage>,
}

impl FetcherHandle {
    /// Forwards block announcements.
    pub fn announce(&self, peer_id: PeerId, hashes: Vec<BlockHashNumber>) {
        let _ = self.tx.send(FetcherMessage::Announce { peer_id, hashes });
    }

    /// Forwards a propagated block.
    pub fn inject(&self, peer_id: PeerId, block: SealedBlock) {
        let _ = self.tx.send(FetcherMessage::Block { peer_id, block });
    }

    /// Notifies the fetcher that the peer is gone.
    pub fn peer_dropped(&self, peer_id: PeerId) {
        let _ = self.tx.send(FetcherMessage::PeerDropped { peer_id });
    }
}

enum FetchOutcome {
    Header { peer_id: PeerId, hash: BlockHash, result: RequestResult<Vec<Header>> },
    Body { peer_id: PeerId, hash: BlockHash, result: RequestResult<Vec<BlockBody>> },
}

/// Drives a [`BlockFetcher`]: feeds it messages and request results, and performs its actions.
#[must_use = "the task does nothing unless run"]
pub struct FetcherTask<I> {
    fetcher: BlockFetcher<I>,
    client: FetchClient,
    rx: mpsc::UnboundedReceiver<FetcherMessage>,
    events: mpsc::UnboundedSender<FetcherEvent>,
    inflight: FuturesUnordered<BoxFuture<'static, FetchOutcome>>,
    cancel: CancellationToken,
}

impl<I> std::fmt::Debug for FetcherTask<I> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetcherTask").field("inflight", &self.inflight.len()).finish_non_exhaustive()
    }
}

impl<I: BlockImporter> FetcherTask<I> {
    /// Creates the task, returning the handle to feed it.
    pub fn new(
        fetcher: BlockFetcher<I>,
        client: FetchClient,
        events: mpsc::UnboundedSender<FetcherEvent>,
        cancel: CancellationToken,
    ) -> (Self, FetcherHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = Self {
            fetcher,
            client,
            rx,
            events,
            inflight: FuturesUnordered::new(),
            cancel,
        };
        (task, FetcherHandle { tx })
    }

    /// Runs until cancelled or until all handles are dropped.
    pub async fn run(mut self) {
        let mut tick = tokio::time::interval(self.fetcher.config().gather_slack);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                msg = self.rx.recv() => {
                    let Some(msg) = msg else { break };
                    self.on_message(msg);
                }
                Some(outcome) = self.inflight.next(), if !self.inflight.is_empty() => {
                    let now = Instant::now();
                    match outcome {
                        FetchOutcome::Header { peer_id, hash, result } => {
                            self.fetcher.on_header(peer_id, hash, result, now)
                        }
                        FetchOutcome::Body { peer_id, hash, result } => {
                            self.fetcher.on_body(peer_id, hash, result, now)
                        }
                    }
                }
                _ = tick.tick() => {}
            }

            for action in self.fetcher.poll(Instant::now()) {
                self.on_action(action);
            }
        }
        trace!(target: "net::fetcher", "Fetcher task stopped");
    }

    fn on_message(&mut self, msg: FetcherMessage) {
        let now = Instant::now();
        match msg {
            FetcherMessage::Announce { peer_id, hashes } => {
                for BlockHashNumber { hash, number } in hashes {
                    self.fetcher.announce(peer_id, hash, number, now);
                }
            }
            FetcherMessage::Block { peer_id, block } => {
                self.fetcher.inject(peer_id, block, now);
            }
            FetcherMessage::PeerDropped { peer_id } => self.fetcher.forget_peer(&peer_id),
        }
    }

    fn on_action(&mut self, action: FetchAction) {
        let timeout = self.fetcher.config().fetch_timeout;
        let client = self.client.clone();
        let cancel = self.cancel.child_token();
        match action {
            FetchAction::FetchHeader { peer_id, hash } => {
                self.inflight.push(
                    async move {
                        let result = client
                            .get_headers(peer_id, GetBlockHeaders::by_hash(hash), timeout, cancel)
                            .await;
                        FetchOutcome::Header { peer_id, hash, result }
                    }
                    .boxed(),
                );
            }
            FetchAction::FetchBody { peer_id, hash } => {
                self.inflight.push(
                    async move {
                        let result =
                            client.get_block_bodies(peer_id, vec![hash], timeout, cancel).await;
                        FetchOutcome::Body { peer_id, hash, result }
                    }
                    .boxed(),
                );
            }
            FetchAction::Imported { peer_id, hash, number } => {
                let _ = self.events.send(FetcherEvent::Imported { peer_id, hash, number });
            }
            FetchAction::DropPeer { peer_id } => {
                let _ = self.events.send(FetcherEvent::BadPeer { peer_id });
            }
        }
    }
}
