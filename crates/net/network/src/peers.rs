//! Bookkeeping of the peers the sync engine can download from.

use crate::metrics::PeerRegistryMetrics;
use fbc_config::PeersConfig;
use fbc_interfaces::p2p::{RequestId, WorkKind};
use fbc_primitives::{PeerId, B256, U256};
use std::{
    collections::{HashMap, HashSet},
    time::Duration,
};
use tracing::{debug, trace};

/// How much a new measurement affects the current estimate (X percent).
const SAMPLE_IMPACT: f64 = 0.1;
/// Amount of RTTs before timeout.
const TIMEOUT_SCALING: u32 = 3;

/// The lifecycle of a registered peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Registered, but the status handshake has not completed yet.
    Connecting,
    /// Available, no request in flight.
    Idle,
    /// At least one request in flight.
    Active,
    /// Unregistered or banned, must not be assigned any work.
    Dropped,
}

impl PeerState {
    /// Returns true if the peer can be assigned work.
    pub const fn is_usable(&self) -> bool {
        matches!(self, Self::Idle | Self::Active)
    }
}

/// Errors when registering a peer.
#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum RegisterError {
    /// The peer was banned during this session.
    #[error("peer is banned")]
    Banned,
    /// The registry is full.
    #[error("too many peers")]
    TooManyPeers,
    /// The peer is already registered.
    #[error("peer is already registered")]
    AlreadyRegistered,
}

/// A peer known to the registry.
#[derive(Debug, Clone)]
pub struct Peer {
    id: PeerId,
    version: u8,
    head: B256,
    total_difficulty: U256,
    state: PeerState,
    /// Requests in flight, by kind.
    inflight: HashMap<RequestId, WorkKind>,
    /// Smoothed round trip time.
    rtt: Duration,
    /// Adaptive request timeout.
    timeout: Duration,
    /// Items per second, per [`WorkKind`].
    throughput: [f64; 4],
    /// Consecutive timeouts.
    strikes: u32,
}

// === impl Peer ===

impl Peer {
    /// The peer's id.
    pub const fn id(&self) -> PeerId {
        self.id
    }

    /// Negotiated protocol version.
    pub const fn version(&self) -> u8 {
        self.version
    }

    /// Hash of the peer's advertised best block.
    pub const fn head(&self) -> B256 {
        self.head
    }

    /// Total difficulty of the peer's advertised best chain.
    pub const fn total_difficulty(&self) -> U256 {
        self.total_difficulty
    }

    /// Current state.
    pub const fn state(&self) -> PeerState {
        self.state
    }

    /// Smoothed round trip time.
    pub const fn rtt(&self) -> Duration {
        self.rtt
    }

    /// Timeout applied to the next request sent to the peer.
    pub const fn request_timeout(&self) -> Duration {
        self.timeout
    }

    /// Measured throughput for the kind, in items per second.
    pub const fn throughput(&self, kind: WorkKind) -> f64 {
        self.throughput[kind as usize]
    }

    /// Number of requests in flight.
    pub fn inflight(&self) -> usize {
        self.inflight.len()
    }

    /// Returns true if a request of the kind is in flight.
    pub fn is_busy_with(&self, kind: WorkKind) -> bool {
        self.inflight.values().any(|k| *k == kind)
    }
}

/// Registry of peers with their advertised chain, request load and measured performance.
///
/// Bans are scoped to the registry's lifetime, or until [`PeerRegistry::clear_bans`] is called.
#[derive(Debug)]
pub struct PeerRegistry {
    config: PeersConfig,
    peers: HashMap<PeerId, Peer>,
    banned: HashSet<PeerId>,
    metrics: PeerRegistryMetrics,
}

impl PeerRegistry {
    /// Creates an empty registry.
    pub fn new(config: PeersConfig) -> Self {
        Self {
            config,
            peers: Default::default(),
            banned: Default::default(),
            metrics: Default::default(),
        }
    }

    /// The configuration of the registry.
    pub const fn config(&self) -> &PeersConfig {
        &self.config
    }

    /// Registers a new peer in [`PeerState::Connecting`].
    pub fn register(&mut self, peer_id: PeerId, version: u8) -> Result<(), RegisterError> {
        if self.banned.contains(&peer_id) {
            return Err(RegisterError::Banned)
        }
        if self.peers.contains_key(&peer_id) {
            return Err(RegisterError::AlreadyRegistered)
        }
        if self.peers.len() >= self.config.max_peers {
            return Err(RegisterError::TooManyPeers)
        }

        // new peers start with the average performance of the known ones
        let mut throughput = [0f64; 4];
        if !self.peers.is_empty() {
            for kind in WorkKind::ALL {
                throughput[kind as usize] =
                    self.peers.values().map(|p| p.throughput(kind)).sum::<f64>() /
                        self.peers.len() as f64;
            }
        }

        let rtt = self.config.initial_rtt;
        self.peers.insert(
            peer_id,
            Peer {
                id: peer_id,
                version,
                head: B256::ZERO,
                total_difficulty: U256::ZERO,
                state: PeerState::Connecting,
                inflight: HashMap::new(),
                rtt,
                timeout: (rtt * TIMEOUT_SCALING)
                    .clamp(self.config.request_timeout_min, self.config.request_timeout_max),
                throughput,
                strikes: 0,
            },
        );
        self.metrics.registered_peers.set(self.peers.len() as f64);
        trace!(target: "net::peers", ?peer_id, version, "Registered peer");
        Ok(())
    }

    /// Removes the peer.
    ///
    /// The returned peer carries the ids of the requests that were still in flight.
    pub fn unregister(&mut self, peer_id: &PeerId) -> Option<Peer> {
        let mut peer = self.peers.remove(peer_id)?;
        peer.state = PeerState::Dropped;
        self.metrics.registered_peers.set(self.peers.len() as f64);
        trace!(target: "net::peers", ?peer_id, inflight = peer.inflight(), "Unregistered peer");
        Some(peer)
    }

    /// Records the status the peer advertised.
    ///
    /// Completes the handshake of a [`PeerState::Connecting`] peer.
    pub fn update_status(&mut self, peer_id: &PeerId, head: B256, total_difficulty: U256) -> bool {
        let Some(peer) = self.peers.get_mut(peer_id) else { return false };
        peer.head = head;
        peer.total_difficulty = total_difficulty;
        if peer.state == PeerState::Connecting {
            peer.state = PeerState::Idle;
        }
        true
    }

    /// Updates the peer's head if the new total difficulty is higher than the known one.
    pub fn update_head(&mut self, peer_id: &PeerId, head: B256, total_difficulty: U256) -> bool {
        match self.peers.get_mut(peer_id) {
            Some(peer) if total_difficulty > peer.total_difficulty => {
                peer.head = head;
                peer.total_difficulty = total_difficulty;
                true
            }
            _ => false,
        }
    }

    /// Returns the peer.
    pub fn get(&self, peer_id: &PeerId) -> Option<&Peer> {
        self.peers.get(peer_id)
    }

    /// Returns true if the peer is registered.
    pub fn contains(&self, peer_id: &PeerId) -> bool {
        self.peers.contains_key(peer_id)
    }

    /// Iterates over all registered peers.
    pub fn iter(&self) -> impl Iterator<Item = &Peer> + '_ {
        self.peers.values()
    }

    /// Number of registered peers.
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Returns true if no peer is registered.
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Usable peers whose total difficulty exceeds `min_td`, best first.
    pub fn peers_with_head(&self, min_td: U256) -> Vec<PeerId> {
        let mut peers = self
            .peers
            .values()
            .filter(|p| p.state.is_usable() && p.total_difficulty > min_td)
            .collect::<Vec<_>>();
        peers.sort_by(|a, b| b.total_difficulty.cmp(&a.total_difficulty));
        peers.into_iter().map(|p| p.id).collect()
    }

    /// The idle peer with the highest advertised total difficulty.
    ///
    /// Ties are broken by the lower round trip time.
    pub fn best_peer(&self) -> Option<&Peer> {
        self.peers.values().filter(|p| p.state == PeerState::Idle).max_by(|a, b| {
            a.total_difficulty.cmp(&b.total_difficulty).then_with(|| b.rtt.cmp(&a.rtt))
        })
    }

    /// Returns true if the peer can take another request of the given kind.
    ///
    /// A peer serves at most one request per kind, and at most
    /// `max_concurrent_requests_per_peer` requests overall.
    pub fn can_request(&self, peer_id: &PeerId, kind: WorkKind) -> bool {
        self.peers.get(peer_id).is_some_and(|p| {
            p.state.is_usable() &&
                !p.is_busy_with(kind) &&
                p.inflight.len() < self.config.max_concurrent_requests_per_peer
        })
    }

    /// Peers that can take a request of the given kind, fastest first.
    pub fn idle_peers(&self, kind: WorkKind) -> Vec<PeerId> {
        let mut peers =
            self.peers.values().filter(|p| self.can_request(&p.id, kind)).collect::<Vec<_>>();
        peers.sort_by(|a, b| b.throughput(kind).total_cmp(&a.throughput(kind)));
        peers.into_iter().map(|p| p.id).collect()
    }

    /// Number of items of the kind the peer should be asked for in one request, at most `max`.
    ///
    /// Sized so that the request completes in about `target_request_time` at the measured
    /// throughput.
    pub fn capacity(&self, peer_id: &PeerId, kind: WorkKind, max: usize) -> usize {
        let Some(peer) = self.peers.get(peer_id) else { return 0 };
        let estimate = peer.throughput(kind) * self.config.target_request_time.as_secs_f64();
        ((1.0 + estimate.max(1.0)) as usize).min(max).max(1)
    }

    /// Records a request sent to the peer.
    pub fn mark_busy(&mut self, peer_id: &PeerId, request_id: RequestId, kind: WorkKind) -> bool {
        if !self.can_request(peer_id, kind) {
            return false
        }
        let Some(peer) = self.peers.get_mut(peer_id) else { return false };
        peer.inflight.insert(request_id, kind);
        peer.state = PeerState::Active;
        true
    }

    /// Records that the request was resolved, returning its kind.
    pub fn mark_idle(&mut self, peer_id: &PeerId, request_id: RequestId) -> Option<WorkKind> {
        let peer = self.peers.get_mut(peer_id)?;
        let kind = peer.inflight.remove(&request_id)?;
        if peer.inflight.is_empty() && peer.state == PeerState::Active {
            peer.state = PeerState::Idle;
        }
        Some(kind)
    }

    /// Updates the peer's performance estimates after it delivered `items` items in `elapsed`.
    pub fn on_response(
        &mut self,
        peer_id: &PeerId,
        kind: WorkKind,
        items: usize,
        elapsed: Duration,
    ) {
        let (min, max) = (self.config.request_timeout_min, self.config.request_timeout_max);
        let Some(peer) = self.peers.get_mut(peer_id) else { return };

        peer.strikes = 0;
        peer.rtt = peer.rtt.mul_f64(1.0 - SAMPLE_IMPACT) + elapsed.mul_f64(SAMPLE_IMPACT);
        peer.timeout = calculate_new_timeout(peer.timeout, peer.rtt, min, max);

        let measured = items as f64 / elapsed.as_secs_f64().max(f64::EPSILON);
        let throughput = &mut peer.throughput[kind as usize];
        *throughput = if *throughput == 0.0 {
            measured
        } else {
            *throughput * (1.0 - SAMPLE_IMPACT) + measured * SAMPLE_IMPACT
        };
    }

    /// Records that a request of the kind timed out.
    ///
    /// Returns true if the peer ran out of strikes and should be dropped.
    pub fn record_timeout(&mut self, peer_id: &PeerId, kind: WorkKind) -> bool {
        self.metrics.request_timeouts.increment(1);
        let Some(peer) = self.peers.get_mut(peer_id) else { return false };
        peer.strikes += 1;
        peer.throughput[kind as usize] = 0.0;
        debug!(target: "net::peers", ?peer_id, %kind, strikes = peer.strikes, "Request timed out");
        peer.strikes >= self.config.timeout_strikes
    }

    /// The timeout to apply to the next request to the peer.
    pub fn request_timeout(&self, peer_id: &PeerId) -> Duration {
        self.peers.get(peer_id).map_or(self.config.request_timeout_max, |p| p.timeout)
    }

    /// Bans the peer: it is marked dropped and can not be registered again.
    pub fn ban(&mut self, peer_id: PeerId) {
        if let Some(peer) = self.peers.get_mut(&peer_id) {
            peer.state = PeerState::Dropped;
        }
        if self.banned.insert(peer_id) {
            self.metrics.banned_peers.increment(1);
            debug!(target: "net::peers", ?peer_id, "Banned peer");
        }
    }

    /// Returns true if the peer is banned.
    pub fn is_banned(&self, peer_id: &PeerId) -> bool {
        self.banned.contains(peer_id)
    }

    /// Lifts all bans.
    pub fn clear_bans(&mut self) {
        self.banned.clear();
    }
}

/// Calculates a new timeout using an updated estimation of the RTT
#[inline]
fn calculate_new_timeout(
    current_timeout: Duration,
    estimated_rtt: Duration,
    min: Duration,
    max: Duration,
) -> Duration {
    let new_timeout = estimated_rtt.mul_f64(SAMPLE_IMPACT) * TIMEOUT_SCALING;

    // this dampens sudden changes by taking a weighted mean of the old and new values
    let smoothened_timeout = current_timeout.mul_f64(1.0 - SAMPLE_IMPACT) + new_timeout;

    smoothened_timeout.clamp(min, max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fbc_primitives::B512;

    fn peer(n: u8) -> PeerId {
        B512::with_last_byte(n)
    }

    fn registry_with(peers: &[(u8, u64)]) -> PeerRegistry {
        let mut registry = PeerRegistry::new(PeersConfig::default());
        for (id, td) in peers {
            registry.register(peer(*id), 66).unwrap();
            registry.update_status(&peer(*id), B256::with_last_byte(*id), U256::from(*td));
        }
        registry
    }

    #[test]
    fn timeout_calculation_sanity_tests() {
        let (min, max) = (Duration::from_secs(2), Duration::from_secs(60));
        let rtt = Duration::from_secs(5);
        // timeout for an RTT of `rtt`
        let timeout = rtt * TIMEOUT_SCALING;

        // if rtt hasn't changed, timeout shouldn't change
        assert_eq!(calculate_new_timeout(timeout, rtt, min, max), timeout);

        // if rtt changed, the new timeout should change less than it
        assert!(calculate_new_timeout(timeout, rtt / 2, min, max) < timeout);
        assert!(calculate_new_timeout(timeout, rtt / 2, min, max) > timeout / 2);
        assert!(calculate_new_timeout(timeout, rtt * 2, min, max) > timeout);
        assert!(calculate_new_timeout(timeout, rtt * 2, min, max) < timeout * 2);

        assert_eq!(calculate_new_timeout(min, Duration::ZERO, min, max), min);
    }

    #[test]
    fn register_lifecycle() {
        let mut registry = registry_with(&[]);
        registry.register(peer(1), 66).unwrap();
        assert_eq!(registry.get(&peer(1)).unwrap().state(), PeerState::Connecting);
        assert_eq!(registry.register(peer(1), 66), Err(RegisterError::AlreadyRegistered));
        assert!(!registry.can_request(&peer(1), WorkKind::Headers));

        registry.update_status(&peer(1), B256::ZERO, U256::from(10));
        assert_eq!(registry.get(&peer(1)).unwrap().state(), PeerState::Idle);

        registry.ban(peer(1));
        let dropped = registry.unregister(&peer(1)).unwrap();
        assert_eq!(dropped.state(), PeerState::Dropped);
        assert_eq!(registry.register(peer(1), 66), Err(RegisterError::Banned));

        assert!(registry.is_banned(&peer(1)));
        registry.clear_bans();
        assert!(!registry.is_banned(&peer(1)));
        assert!(registry.register(peer(1), 66).is_ok());
    }

    #[test]
    fn registry_is_bounded() {
        let config = PeersConfig { max_peers: 1, ..Default::default() };
        let mut registry = PeerRegistry::new(config);
        registry.register(peer(1), 66).unwrap();
        assert_eq!(registry.register(peer(2), 66), Err(RegisterError::TooManyPeers));
    }

    #[test]
    fn best_peer_and_heads() {
        let mut registry = registry_with(&[(1, 10), (2, 30), (3, 20)]);
        assert_eq!(registry.best_peer().unwrap().id(), peer(2));
        assert_eq!(registry.peers_with_head(U256::from(15)), vec![peer(2), peer(3)]);

        // a busy peer is not a candidate for a new session
        assert!(registry.mark_busy(&peer(2), 1, WorkKind::Headers));
        assert_eq!(registry.best_peer().unwrap().id(), peer(3));
        assert_eq!(registry.peers_with_head(U256::from(15)).len(), 2);

        assert!(registry.update_head(&peer(1), B256::ZERO, U256::from(40)));
        assert!(!registry.update_head(&peer(1), B256::ZERO, U256::from(35)));
        assert_eq!(registry.best_peer().unwrap().id(), peer(1));
    }

    #[test]
    fn one_request_per_kind() {
        let mut registry = registry_with(&[(1, 10)]);
        assert!(registry.mark_busy(&peer(1), 1, WorkKind::Bodies));
        assert!(!registry.mark_busy(&peer(1), 2, WorkKind::Bodies));
        assert!(registry.mark_busy(&peer(1), 3, WorkKind::Receipts));
        assert_eq!(registry.get(&peer(1)).unwrap().state(), PeerState::Active);
        assert_eq!(registry.idle_peers(WorkKind::Bodies), Vec::<PeerId>::new());

        assert_eq!(registry.mark_idle(&peer(1), 1), Some(WorkKind::Bodies));
        assert_eq!(registry.mark_idle(&peer(1), 1), None);
        assert_eq!(registry.mark_idle(&peer(1), 3), Some(WorkKind::Receipts));
        assert_eq!(registry.get(&peer(1)).unwrap().state(), PeerState::Idle);
    }

    #[test]
    fn capacity_follows_throughput() {
        let mut registry = registry_with(&[(1, 10), (2, 10)]);
        assert_eq!(registry.capacity(&peer(1), WorkKind::Bodies, 128), 2);

        registry.on_response(&peer(1), WorkKind::Bodies, 100, Duration::from_secs(1));
        assert_eq!(registry.capacity(&peer(1), WorkKind::Bodies, 128), 101);
        assert_eq!(registry.capacity(&peer(1), WorkKind::Bodies, 64), 64);
        assert_eq!(registry.idle_peers(WorkKind::Bodies), vec![peer(1), peer(2)]);

        // new peers inherit the average
        registry.register(peer(3), 66).unwrap();
        assert_eq!(registry.get(&peer(3)).unwrap().throughput(WorkKind::Bodies), 50.0);
    }

    #[test]
    fn timeouts_strike_out() {
        let mut registry = registry_with(&[(1, 10)]);
        registry.on_response(&peer(1), WorkKind::Headers, 10, Duration::from_millis(100));
        assert!(registry.request_timeout(&peer(1)) < Duration::from_secs(15));

        assert!(!registry.record_timeout(&peer(1), WorkKind::Headers));
        assert_eq!(registry.get(&peer(1)).unwrap().throughput(WorkKind::Headers), 0.0);
        assert!(!registry.record_timeout(&peer(1), WorkKind::Headers));
        assert!(registry.record_timeout(&peer(1), WorkKind::Headers));
    }
}
