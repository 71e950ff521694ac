//! The synchronization controller.
//!
//! A [`Synchronizer`] owns the peer registry and the task queue and runs at most one sync
//! session at a time. A session picks the best peer as master, fetches its head, finds the
//! common ancestor, picks full or fast mode and then keeps every idle peer busy with work from
//! the queue until the target is committed.

use crate::{
    ancestor::{AncestorSearch, AncestorStep},
    commit::BlockCommitter,
    error::SyncError,
    handle::{SyncCommand, SyncHandle},
    metrics::SyncMetrics,
    progress::{SessionState, SyncEvent, SyncProgress, SyncStatus},
    skeleton::Skeleton,
    state::StateSync,
};
use fbc_config::{Config, SyncConfig, SyncMode};
use fbc_downloaders::{Batch, TaskQueue, WorkKey};
use fbc_interfaces::{
    consensus::Consensus,
    executor::BlockExecutor,
    p2p::{
        error::{DownloadError, RequestError, RequestResult},
        RequestId, WorkKind,
    },
    provider::{ChainStore, ProviderError},
    sync::{SyncState, SyncStateUpdater},
};
use fbc_network::{
    EthRequest, EthResponse, FetchClient, GetBlockHeaders, Peer, PeerRegistry, RegisterError,
    Status,
};
use fbc_primitives::{BlockHash, BlockNumber, Bytes, Head, Header, PeerId, SealedHeader, B256, U256};
use futures::{future::BoxFuture, stream::FuturesUnordered, StreamExt};
use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::Arc,
    time::Duration,
};
use tokio::{
    sync::{broadcast, mpsc, watch},
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Capacity of the event channel.
const EVENT_CHANNEL_SIZE: usize = 64;

/// Number of peers that must dispute the anchors of a skeleton source before it is banned.
const ANCHOR_DISPUTE_QUORUM: usize = 2;

/// Why a peer leaves the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DropReason {
    /// The session already closed.
    Disconnected,
    /// Too slow or unable to serve what it advertised.
    Unresponsive,
    /// Served invalid data; it is banned for the session.
    Misbehaved,
}

/// What a request was sent for.
#[derive(Debug)]
enum Work {
    /// A skeleton request of the given round
    Skeleton(u64),
    Items(Vec<WorkKey>),
}

/// A finished request of the download phase.
#[derive(Debug)]
struct Response {
    peer_id: PeerId,
    request_id: RequestId,
    work: Work,
    result: RequestResult<EthResponse>,
    elapsed: Duration,
}

/// A running sync session.
struct Session {
    mode: SyncMode,
    master: PeerId,
    target: SealedHeader,
    target_td: U256,
    starting_block: BlockNumber,
    skeleton: Skeleton,
    /// Bumped whenever the skeleton is rebuilt
    skeleton_round: u64,
    committer: BlockCommitter,
    state: Option<StateSync>,
    pivot_hash: Option<BlockHash>,
    /// Peers whose header ranges missed an anchor, by the peer that supplied the anchor
    disputes: HashMap<PeerId, HashSet<PeerId>>,
    cancel: CancellationToken,
    requests: FuturesUnordered<BoxFuture<'static, Response>>,
}

/// Drives bulk synchronization with the connected peers.
///
/// Commands arrive through the [`SyncHandle`] returned by [`Synchronizer::new`]; the
/// synchronizer runs until the shutdown token fires or every handle is dropped.
pub struct Synchronizer {
    config: SyncConfig,
    peers: PeerRegistry,
    queue: TaskQueue,
    client: FetchClient,
    store: Arc<dyn ChainStore>,
    consensus: Arc<dyn Consensus>,
    executor: Arc<dyn BlockExecutor>,
    commands: mpsc::UnboundedReceiver<SyncCommand>,
    progress: watch::Sender<SyncProgress>,
    events: broadcast::Sender<SyncEvent>,
    status: SyncStatus,
    shutdown: CancellationToken,
    /// Set once a fast session failed on the pivot state; later sessions run in full mode.
    fast_failed: bool,
    /// Set when the running session was cancelled to make room for a new one.
    restart: bool,
    /// Total difficulty of the running session's target
    session_td: Option<U256>,
    next_request_id: RequestId,
    metrics: SyncMetrics,
}

impl Synchronizer {
    /// Creates the synchronizer and the handle to control it.
    pub fn new(
        config: &Config,
        client: FetchClient,
        store: Arc<dyn ChainStore>,
        consensus: Arc<dyn Consensus>,
        executor: Arc<dyn BlockExecutor>,
        shutdown: CancellationToken,
    ) -> (Self, SyncHandle) {
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (progress, progress_rx) = watch::channel(SyncProgress::default());
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        let status = SyncStatus::default();
        let handle = SyncHandle::new(commands_tx, progress_rx, events.clone(), status.clone());

        let this = Self {
            config: config.sync.clone(),
            peers: PeerRegistry::new(config.peers.clone()),
            queue: TaskQueue::new(consensus.clone(), &config.sync),
            client,
            store,
            consensus,
            executor,
            commands,
            progress,
            events,
            status,
            shutdown,
            fast_failed: false,
            restart: false,
            session_td: None,
            next_request_id: 0,
            metrics: SyncMetrics::default(),
        };
        (this, handle)
    }

    /// Handles commands and starts sessions until shutdown.
    pub async fn run(mut self) {
        let period = self.config.force_sync_interval;
        let mut force = tokio::time::interval_at(Instant::now() + period, period);
        force.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let start = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                command = self.commands.recv() => match command {
                    Some(command) => self.on_command(command, None),
                    None => break,
                },
                _ = force.tick() => self.peers.len() >= self.config.min_desired_peers,
            };
            if start {
                self.synchronise().await;
                while std::mem::take(&mut self.restart) && !self.shutdown.is_cancelled() {
                    self.synchronise().await;
                }
            }
        }
        debug!(target: "sync::controller", "Synchronizer stopped");
    }

    /// Handles a command. `session` is the cancellation token of the running session, if any.
    ///
    /// Returns `true` if a session should be started. A running session is cancelled and
    /// replaced if a start is requested or a peer reveals a head heavier than its target.
    fn on_command(&mut self, command: SyncCommand, session: Option<&CancellationToken>) -> bool {
        match command {
            SyncCommand::Start => match session {
                Some(cancel) => {
                    self.restart(cancel, "requested");
                    false
                }
                None => true,
            },
            SyncCommand::Cancel => {
                if let Some(cancel) = session {
                    debug!(target: "sync::controller", "Cancelling sync session");
                    self.restart = false;
                    cancel.cancel();
                }
                false
            }
            SyncCommand::PeerConnected { peer_id, status } => {
                self.on_peer_connected(peer_id, status);
                session.is_none() && self.peers.len() >= self.config.min_desired_peers
            }
            SyncCommand::PeerDisconnected { peer_id } => {
                self.drop_peer(peer_id, DropReason::Disconnected);
                false
            }
            SyncCommand::PeerHead { peer_id, head, total_difficulty } => {
                if !self.peers.update_head(&peer_id, head, total_difficulty) {
                    return false
                }
                match session {
                    Some(cancel) => {
                        if self.session_td.is_some_and(|target| total_difficulty > target) {
                            self.restart(cancel, "heavier head");
                        }
                        false
                    }
                    None => {
                        self.store.head().is_ok_and(|local| total_difficulty > local.total_difficulty)
                    }
                }
            }
        }
    }

    /// Cancels the running session; a new one starts once it is cleaned up.
    fn restart(&mut self, cancel: &CancellationToken, reason: &'static str) {
        debug!(target: "sync::controller", reason, "Restarting sync session");
        self.restart = true;
        cancel.cancel();
    }

    fn on_peer_connected(&mut self, peer_id: PeerId, status: Status) {
        match self.peers.register(peer_id, status.version) {
            Ok(()) | Err(RegisterError::AlreadyRegistered) => {
                self.peers.update_status(&peer_id, status.head, status.total_difficulty);
            }
            Err(err) => {
                debug!(target: "sync::controller", ?peer_id, %err, "Rejecting peer");
                self.client.correlator().transport().disconnect(peer_id);
            }
        }
    }

    /// Removes the peer, returning its work to the queue.
    fn drop_peer(&mut self, peer_id: PeerId, reason: DropReason) {
        if reason == DropReason::Misbehaved {
            self.peers.ban(peer_id);
            self.metrics.peers_banned.increment(1);
        }
        let reclaimed = self.queue.reclaim(&peer_id);
        let known = self.peers.unregister(&peer_id).is_some();
        self.client.correlator().drop_peer(peer_id);
        if reason != DropReason::Disconnected {
            self.client.correlator().transport().disconnect(peer_id);
        }
        if known {
            debug!(target: "sync::controller", ?peer_id, ?reason, reclaimed, "Dropped peer");
        }
    }

    /// Runs one session and publishes its outcome.
    async fn synchronise(&mut self) {
        self.peers.clear_bans();
        let result = self.sync_session().await;
        self.session_td = None;
        self.status.update_sync_state(SyncState::Idle);

        match result {
            Ok(None) => {
                trace!(target: "sync::controller", "No peer with a better chain");
            }
            Ok(Some(head)) => {
                info!(target: "sync::controller", number = head.number, hash = %head.hash, "Sync complete");
                self.metrics.sessions_done.increment(1);
                self.progress.send_modify(|progress| {
                    progress.current_block = head.number;
                    progress.state = SessionState::Done;
                });
                let _ = self.events.send(SyncEvent::Done { head: head.number, hash: head.hash });
            }
            Err(error) => {
                let state = if error == SyncError::Cancelled {
                    info!(target: "sync::controller", "Sync cancelled");
                    SessionState::Cancelled
                } else if error.is_fatal() {
                    warn!(target: "sync::controller", %error, "Sync failed");
                    SessionState::Failed
                } else {
                    debug!(target: "sync::controller", %error, "Sync aborted");
                    SessionState::Failed
                };
                self.metrics.sessions_failed.increment(1);
                self.progress.send_modify(|progress| progress.state = state);
                let _ = self.events.send(SyncEvent::Failed { error });
            }
        }
    }

    /// Returns the new head, or `None` if no peer has a better chain.
    async fn sync_session(&mut self) -> Result<Option<Head>, SyncError> {
        let local = self.store.head()?;
        let cancel = self.shutdown.child_token();

        let mut candidates = false;
        let (master, target, target_td) = loop {
            // a peer on our own head has nothing to offer, whatever difficulty it claims
            let Some((peer_id, head, td)) = self
                .peers
                .best_peer()
                .filter(|peer| {
                    peer.total_difficulty() > local.total_difficulty && peer.head() != local.hash
                })
                .map(|peer| (peer.id(), peer.head(), peer.total_difficulty()))
            else {
                return if candidates { Err(SyncError::NoPeers) } else { Ok(None) }
            };
            if !candidates {
                candidates = true;
                self.status.update_sync_state(SyncState::Syncing);
                self.progress.send_replace(SyncProgress {
                    starting_block: local.number,
                    current_block: local.number,
                    state: SessionState::HeaderSync,
                    ..Default::default()
                });
            }

            match self.fetch_target(peer_id, head, &cancel).await {
                Ok(target) => break (peer_id, target, td),
                Err(SyncError::MasterPeer { peer_id, error }) => {
                    debug!(target: "sync::controller", ?peer_id, %error, "Master candidate failed");
                    self.drop_peer(peer_id, drop_reason(&error));
                }
                Err(err) => return Err(err),
            }
        };

        self.session_td = Some(target_td);
        let ancestor = self.find_ancestor(master, local.number, target.number, &cancel).await?;

        let pivot = target.number.saturating_sub(self.config.pivot_margin);
        let mode = if self.config.mode.is_fast() &&
            !self.fast_failed &&
            target.number.saturating_sub(local.number) > self.config.fast_sync_threshold &&
            pivot > ancestor.number
        {
            SyncMode::Fast
        } else {
            SyncMode::Full
        };
        let pivot = mode.is_fast().then_some(pivot);

        self.queue.reset(ancestor.number + 1);
        self.queue.set_receipts_limit(pivot);
        let mut session = Session {
            mode,
            master,
            skeleton: Skeleton::new(ancestor.clone(), target.clone(), master, &self.config),
            committer: BlockCommitter::new(
                self.store.clone(),
                self.consensus.clone(),
                self.executor.clone(),
                &ancestor,
                pivot,
                self.config.seal_check_frequency,
                self.metrics.clone(),
            ),
            target,
            target_td,
            starting_block: local.number,
            state: None,
            pivot_hash: None,
            disputes: HashMap::new(),
            skeleton_round: 0,
            cancel,
            requests: FuturesUnordered::new(),
        };

        info!(
            target: "sync::controller",
            ?master,
            %mode,
            target = session.target.number,
            ancestor = ancestor.number,
            ?pivot,
            "Starting sync"
        );
        self.metrics.sessions_started.increment(1);
        self.metrics.highest_block.set(session.target.number as f64);
        let _ = self.events.send(SyncEvent::Started {
            mode,
            target: session.target.number,
            target_hash: session.target.hash(),
            ancestor: ancestor.number,
            pivot,
        });

        let result = self.download(&mut session).await;
        self.finish(&mut session).await;

        match result {
            Ok(()) => Ok(Some(self.store.head()?)),
            Err(err) => {
                if session.mode.is_fast() && err.is_state_error() {
                    warn!(target: "sync::controller", %err, "Fast sync failed, falling back to full sync");
                    self.fast_failed = true;
                }
                Err(err)
            }
        }
    }

    /// Fetches the header the peer advertised as its head.
    async fn fetch_target(
        &mut self,
        peer_id: PeerId,
        head: BlockHash,
        cancel: &CancellationToken,
    ) -> Result<SealedHeader, SyncError> {
        let headers = self.request_headers(peer_id, GetBlockHeaders::by_hash(head), cancel).await?;
        let fault = |error| SyncError::MasterPeer { peer_id, error };
        let [header] = <[Header; 1]>::try_from(headers).map_err(|headers| {
            fault(if headers.is_empty() {
                DownloadError::EmptyResponse
            } else {
                DownloadError::TooManyHeaders { received: headers.len() as u64, expected: 1 }
            })
        })?;
        let header = header.seal_slow();
        if header.hash() != head {
            return Err(fault(DownloadError::UnrequestedHeader {
                received: header.hash(),
                expected: head,
            }))
        }
        Ok(header)
    }

    /// Runs the ancestor search against the master, returning the local ancestor header.
    async fn find_ancestor(
        &mut self,
        master: PeerId,
        local: BlockNumber,
        remote: BlockNumber,
        cancel: &CancellationToken,
    ) -> Result<SealedHeader, SyncError> {
        let mut search = AncestorSearch::new(master, local, remote, &self.config);
        let mut request = search.request();
        let hash = loop {
            let Some(next) = request.take() else {
                return Err(SyncError::MasterPeer { peer_id: master, error: DownloadError::StaleDelivery })
            };
            let step = match self.request_headers(master, next, cancel).await {
                Ok(headers) => search.on_headers(headers, self.store.as_ref()),
                Err(err) => Err(err),
            };
            match step {
                Ok(AncestorStep::Request(next)) => request = Some(next),
                Ok(AncestorStep::Found { hash, .. }) => break hash,
                Err(err) => {
                    if let SyncError::MasterPeer { peer_id, error } = &err {
                        self.drop_peer(*peer_id, drop_reason(error));
                    }
                    return Err(err)
                }
            }
        };
        Ok(self.store.header(&hash)?.ok_or(ProviderError::UnknownBlock { hash })?)
    }

    /// Sends a header request to the master and waits for it, handling commands meanwhile.
    async fn request_headers(
        &mut self,
        peer_id: PeerId,
        request: GetBlockHeaders,
        cancel: &CancellationToken,
    ) -> Result<Vec<Header>, SyncError> {
        let request_id = self.next_request_id();
        self.peers.mark_busy(&peer_id, request_id, WorkKind::Headers);
        let timeout = self.peers.request_timeout(&peer_id);
        let client = self.client.clone();
        let started = Instant::now();
        let response = client.send_request(
            peer_id,
            EthRequest::GetBlockHeaders(request),
            timeout,
            cancel.clone(),
        );
        tokio::pin!(response);

        let result = loop {
            tokio::select! {
                biased;
                result = &mut response => break result,
                command = self.commands.recv() => match command {
                    Some(command) => {
                        self.on_command(command, Some(cancel));
                    }
                    None => cancel.cancel(),
                },
            }
        };
        self.peers.mark_idle(&peer_id, request_id);

        match result {
            Ok(EthResponse::BlockHeaders(headers)) => {
                self.peers.on_response(&peer_id, WorkKind::Headers, headers.len(), started.elapsed());
                Ok(headers)
            }
            Ok(_) => Err(SyncError::MasterPeer { peer_id, error: RequestError::BadResponse.into() }),
            Err(RequestError::Cancelled) => Err(SyncError::Cancelled),
            Err(err) => Err(SyncError::MasterPeer { peer_id, error: err.into() }),
        }
    }

    /// Keeps the peers busy until the target is committed.
    async fn download(&mut self, session: &mut Session) -> Result<(), SyncError> {
        let mut expire = tokio::time::interval(self.config.expire_interval);
        expire.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let cancel = session.cancel.clone();

        loop {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled)
            }
            self.queue.check()?;
            if session.committer.is_complete(session.target.number) {
                return Ok(())
            }
            self.dispatch(session);
            self.publish_progress(session);

            if session.requests.is_empty() {
                return Err(if self.peers.is_empty() {
                    SyncError::NoPeers
                } else {
                    SyncError::PeersUnavailable
                })
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(SyncError::Cancelled),
                command = self.commands.recv() => match command {
                    Some(command) => {
                        self.on_command(command, Some(&cancel));
                    }
                    None => return Err(SyncError::Cancelled),
                },
                Some(response) = session.requests.next() => self.on_response(session, response)?,
                _ = expire.tick() => self.on_expire(),
            }
        }
    }

    /// Cancels the outstanding requests and clears the queue.
    async fn finish(&mut self, session: &mut Session) {
        session.cancel.cancel();
        while let Some(response) = session.requests.next().await {
            self.peers.mark_idle(&response.peer_id, response.request_id);
        }
        self.queue.reset(self.queue.next_block());
    }

    /// Sends the skeleton request and assigns queued work to every idle peer.
    fn dispatch(&mut self, session: &mut Session) {
        if !session.skeleton.is_done() &&
            !session.skeleton.is_inflight() &&
            self.queue.pending_len(WorkKind::Headers) == 0 &&
            self.queue.buffered_blocks() < self.config.max_buffered_blocks
        {
            if let Some(request) = session.skeleton.next_request(&mut self.queue) {
                match self.skeleton_source(session) {
                    Some(peer_id) => {
                        let timeout = self.peers.request_timeout(&peer_id);
                        let request = EthRequest::GetBlockHeaders(request);
                        let work = Work::Skeleton(session.skeleton_round);
                        self.send(session, peer_id, request, work, timeout);
                    }
                    None => session.skeleton.on_failure(),
                }
            }
        }

        for kind in WorkKind::ALL {
            let max = self.max_items(kind);
            for peer_id in self.peers.idle_peers(kind) {
                if !self.queue.has_work_for(&peer_id, kind) {
                    continue
                }
                let count = self.peers.capacity(&peer_id, kind, max);
                let timeout = self.peers.request_timeout(&peer_id);
                let keys = self.queue.reserve(peer_id, kind, count, timeout, Instant::now());
                let Some(request) = request_for(&keys) else { continue };
                trace!(target: "sync::controller", ?peer_id, %kind, items = keys.len(), "Assigned work");
                self.send(session, peer_id, request, Work::Items(keys), timeout);
            }
        }
    }

    /// The master if it is idle, otherwise any idle peer whose chain is at least as heavy.
    fn skeleton_source(&self, session: &Session) -> Option<PeerId> {
        if self.peers.can_request(&session.master, WorkKind::Headers) {
            return Some(session.master)
        }
        self.peers
            .peers_with_head(session.target_td.saturating_sub(U256::from(1)))
            .into_iter()
            .find(|peer_id| self.peers.can_request(peer_id, WorkKind::Headers))
    }

    const fn max_items(&self, kind: WorkKind) -> usize {
        match kind {
            WorkKind::Headers => 1,
            WorkKind::Bodies => self.config.max_body_fetch,
            WorkKind::Receipts => self.config.max_receipt_fetch,
            WorkKind::State => self.config.max_state_fetch,
        }
    }

    fn next_request_id(&mut self) -> RequestId {
        self.next_request_id += 1;
        self.next_request_id
    }

    fn send(
        &mut self,
        session: &mut Session,
        peer_id: PeerId,
        request: EthRequest,
        work: Work,
        timeout: Duration,
    ) {
        let request_id = self.next_request_id();
        self.peers.mark_busy(&peer_id, request_id, request.kind());
        let client = self.client.clone();
        let cancel = session.cancel.clone();
        session.requests.push(Box::pin(async move {
            let sent = Instant::now();
            let result = client.send_request(peer_id, request, timeout, cancel).await;
            Response { peer_id, request_id, work, result, elapsed: sent.elapsed() }
        }));
    }

    fn on_response(&mut self, session: &mut Session, response: Response) -> Result<(), SyncError> {
        let Response { peer_id, request_id, work, result, elapsed } = response;
        self.peers.mark_idle(&peer_id, request_id);

        let keys = match work {
            Work::Skeleton(round) if round == session.skeleton_round => {
                self.on_skeleton(session, peer_id, result, elapsed);
                return Ok(())
            }
            Work::Skeleton(_) => {
                trace!(target: "sync::controller", ?peer_id, "Response to a dropped skeleton");
                return Ok(())
            }
            Work::Items(keys) => keys,
        };
        let response = match result {
            Ok(response) => response,
            Err(RequestError::Timeout) => {
                self.on_expire();
                return Ok(())
            }
            Err(err) => {
                trace!(target: "sync::controller", ?peer_id, %err, "Request failed");
                for key in &keys {
                    self.queue.release(&peer_id, key);
                }
                if err == RequestError::BadResponse {
                    self.drop_peer(peer_id, DropReason::Misbehaved);
                }
                return Ok(())
            }
        };

        let kind = response.kind();
        let delivered = match response {
            EthResponse::BlockHeaders(headers) => match keys.first() {
                Some(key) => self.queue.deliver_headers(peer_id, *key, headers),
                None => Err(DownloadError::StaleDelivery),
            },
            EthResponse::BlockBodies(bodies) => self.queue.deliver_bodies(peer_id, &keys, bodies),
            EthResponse::Receipts(receipts) => {
                self.queue.deliver_receipts(peer_id, &keys, receipts)
            }
            EthResponse::NodeData(nodes) => {
                let hashes: Vec<B256> = keys.iter().filter_map(WorkKey::hash).collect();
                self.queue.deliver_nodes(peer_id, &hashes, nodes)
            }
        };

        match delivered {
            Ok(delivery) => {
                self.peers.on_response(&peer_id, kind, delivery.accepted, elapsed);
                self.queue.metrics().record_request(kind, elapsed);
                if !delivery.nodes.is_empty() {
                    self.on_nodes(session, delivery.nodes)?;
                }
                if let Some(batch) = delivery.batch {
                    self.commit(session, batch)?;
                }
            }
            Err(DownloadError::AnchorMismatch { number, .. }) => {
                self.on_anchor_dispute(session, peer_id, number);
            }
            Err(err) if err.is_peer_fault() => {
                debug!(target: "sync::controller", ?peer_id, %kind, %err, "Invalid response");
                self.drop_peer(peer_id, DropReason::Misbehaved);
            }
            Err(err) => {
                trace!(target: "sync::controller", ?peer_id, %kind, %err, "Response not accepted");
            }
        }
        Ok(())
    }

    fn on_skeleton(
        &mut self,
        session: &mut Session,
        peer_id: PeerId,
        result: RequestResult<EthResponse>,
        elapsed: Duration,
    ) {
        match result {
            Ok(EthResponse::BlockHeaders(headers)) => {
                let received = headers.len();
                match session.skeleton.on_headers(peer_id, headers, &mut self.queue) {
                    Ok(_) => {
                        self.peers.on_response(&peer_id, WorkKind::Headers, received, elapsed);
                    }
                    Err(err) => {
                        debug!(target: "sync::controller", ?peer_id, %err, "Invalid skeleton");
                        self.drop_peer(peer_id, drop_reason(&err));
                    }
                }
            }
            Ok(_) => {
                session.skeleton.on_failure();
                self.drop_peer(peer_id, DropReason::Misbehaved);
            }
            Err(RequestError::Timeout) => {
                session.skeleton.on_failure();
                if self.peers.record_timeout(&peer_id, WorkKind::Headers) {
                    self.drop_peer(peer_id, DropReason::Unresponsive);
                }
            }
            Err(err) => {
                trace!(target: "sync::controller", ?peer_id, %err, "Skeleton request failed");
                session.skeleton.on_failure();
            }
        }
    }

    /// Requeues expired work and strikes the peers that held it.
    fn on_expire(&mut self) {
        let expired = self.queue.expire(Instant::now());
        let mut struck = HashSet::new();
        for (peer_id, key) in expired.offenders {
            if struck.insert(peer_id) && self.peers.record_timeout(&peer_id, key.kind()) {
                self.drop_peer(peer_id, DropReason::Unresponsive);
            }
        }
    }

    /// A header range missed the anchor it was scheduled with.
    ///
    /// The queue already stopped offering the range to the filler. Only fillers that claim a
    /// chain at least as heavy as the target can dispute an anchor; a lighter peer may simply be
    /// on another fork. The peer that supplied the anchor is banned once it contradicts itself or
    /// enough such peers dispute its anchors, and the skeleton is then rebuilt from another peer.
    fn on_anchor_dispute(&mut self, session: &mut Session, filler: PeerId, number: BlockNumber) {
        let Some(source) = session.skeleton.source_of(number) else { return };
        if !self.peers.contains(&source) {
            return
        }
        let target_td = session.target_td;
        let witness = |peer: &Peer| peer.id() != source && peer.total_difficulty() >= target_td;
        if filler != source && !self.peers.get(&filler).is_some_and(witness) {
            trace!(target: "sync::controller", ?filler, number, "Anchor missed by a lighter peer");
            return
        }
        let witnesses = self.peers.iter().filter(|peer| witness(*peer)).count();
        let disputes = session.disputes.entry(source).or_default();
        disputes.insert(filler);
        let quorum = witnesses.clamp(1, ANCHOR_DISPUTE_QUORUM);
        if filler != source && disputes.len() < quorum {
            debug!(target: "sync::controller", ?filler, ?source, number, "Anchor disputed");
            return
        }
        warn!(target: "sync::controller", ?source, number, disputes = disputes.len(), "Peer served a bogus skeleton");
        self.drop_peer(source, DropReason::Misbehaved);
        self.rebuild_skeleton(session);
    }

    /// Drops every scheduled header range and restarts the skeleton on top of the last
    /// committed block.
    fn rebuild_skeleton(&mut self, session: &mut Session) {
        let last = session.committer.last_header().clone();
        let dropped = self.queue.rewind(last.number + 1);
        debug!(target: "sync::controller", from = last.number, dropped, "Rebuilding skeleton");
        session.skeleton = Skeleton::new(last, session.target.clone(), session.master, &self.config);
        session.skeleton_round += 1;
        session.disputes.clear();
    }

    fn commit(&mut self, session: &mut Session, batch: Batch) -> Result<(), SyncError> {
        let outcome = match session.committer.commit(batch) {
            Ok(outcome) => outcome,
            Err(err @ SyncError::InvalidSeal { .. }) => {
                // the supplier is banned and its headers are fetched again
                self.blame(err);
                self.rebuild_skeleton(session);
                return Ok(())
            }
            Err(err) => return Err(self.blame(err)),
        };
        trace!(target: "sync::controller", committed = outcome.committed, last = session.committer.last(), "Committed batch");
        if let Some(pivot) = outcome.pivot {
            self.start_state_sync(session, pivot)?;
        }
        Ok(())
    }

    fn start_state_sync(&mut self, session: &mut Session, pivot: SealedHeader) -> Result<(), SyncError> {
        let (state, schedule) = StateSync::new(pivot.number, pivot.state_root, &self.store)?;
        let scheduled = self.queue.schedule_nodes(schedule);
        debug!(target: "sync::controller", pivot = pivot.number, root = %pivot.state_root, scheduled, "Starting state sync");
        session.pivot_hash = Some(pivot.hash());
        session.state = Some(state);
        self.check_state(session)
    }

    fn on_nodes(&mut self, session: &mut Session, nodes: Vec<(B256, Bytes)>) -> Result<(), SyncError> {
        let Some(state) = session.state.as_mut() else { return Ok(()) };
        let schedule = state.on_nodes(nodes, &self.store)?;
        self.queue.schedule_nodes(schedule);
        self.check_state(session)
    }

    /// Verifies the pivot state once it is complete and releases the blocks after the pivot.
    fn check_state(&mut self, session: &mut Session) -> Result<(), SyncError> {
        let (Some(state), Some(pivot)) = (&session.state, session.pivot_hash) else { return Ok(()) };
        if !state.is_done() || !session.committer.is_waiting_for_state() {
            return Ok(())
        }
        state.verify(&self.store)?;
        let executed = session.committer.on_state_ready(pivot).map_err(|err| self.blame(err))?;
        info!(target: "sync::controller", %pivot, pulled = state.pulled(), executed, "Pivot state complete");
        Ok(())
    }

    /// Bans the peer that served the data behind the error.
    fn blame(&mut self, err: SyncError) -> SyncError {
        if let Some(peer_id) = err.offender() {
            warn!(target: "sync::controller", ?peer_id, %err, "Peer served invalid chain data");
            self.drop_peer(peer_id, DropReason::Misbehaved);
        }
        err
    }

    fn publish_progress(&self, session: &Session) {
        let state = if session.state.as_ref().is_some_and(|state| !state.is_done()) {
            SessionState::StatePivot
        } else if !session.skeleton.is_done() || self.queue.pending_len(WorkKind::Headers) > 0 {
            SessionState::HeaderSync
        } else if !self.queue.is_empty() {
            SessionState::BlockSync
        } else {
            SessionState::Committing
        };
        let (pulled_states, known_states) =
            session.state.as_ref().map_or((0, 0), |state| (state.pulled(), state.known()));
        let current_block = session.committer.last();
        self.metrics.current_block.set(current_block as f64);
        self.progress.send_replace(SyncProgress {
            starting_block: session.starting_block,
            current_block,
            highest_block: session.target.number,
            pulled_states,
            known_states,
            state,
        });
    }
}

impl fmt::Debug for Synchronizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Synchronizer")
            .field("config", &self.config)
            .field("peers", &self.peers.len())
            .field("fast_failed", &self.fast_failed)
            .finish_non_exhaustive()
    }
}

fn drop_reason(error: &DownloadError) -> DropReason {
    if error.is_peer_fault() {
        DropReason::Misbehaved
    } else {
        DropReason::Unresponsive
    }
}

/// Builds the request for reserved keys, which are all of one kind.
fn request_for(keys: &[WorkKey]) -> Option<EthRequest> {
    let hashes = || keys.iter().filter_map(WorkKey::hash).collect();
    Some(match keys.first()? {
        WorkKey::Headers { start, count } => {
            EthRequest::GetBlockHeaders(GetBlockHeaders::rising(*start, *count))
        }
        WorkKey::Body(_) => EthRequest::GetBlockBodies(hashes()),
        WorkKey::Receipts(_) => EthRequest::GetReceipts(hashes()),
        WorkKey::Node(_) => EthRequest::GetNodeData(hashes()),
    })
}
