//! A simulated network of peers serving [`TestChain`]s.

use crate::{
    message::{BlockHashNumber, EthRequest, EthResponse, GetBlockHeaders, NetworkEvent, NewBlock, Status},
    transport::PeerTransport,
};
use fbc_interfaces::{
    p2p::{
        error::{RequestError, RequestResult},
        RequestId,
    },
    test_utils::TestChain,
};
use fbc_primitives::{
    BlockHashOrNumber, Bytes, Header, HeadersDirection, PeerId, Receipt, SealedBlock, U256,
};
use parking_lot::{Mutex, RwLock};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::sync::mpsc;

/// Protocol version advertised by test peers.
pub const TEST_PROTOCOL_VERSION: u8 = 66;

/// How a simulated peer answers requests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PeerBehaviour {
    /// Serves correct data.
    #[default]
    Honest,
    /// Never answers.
    Unresponsive,
    /// Answers every request with an empty response.
    Empty,
    /// Serves only the first half of what was asked for.
    Partial,
    /// Answers with a response of the wrong kind.
    WrongKind,
    /// Tampers with the last header of every header response.
    CorruptHeaders,
    /// Tampers with every header of requests that skip blocks, i.e. skeleton requests.
    ForgedSkeleton,
    /// Adds a transaction to every body.
    CorruptBodies,
    /// Tampers with the receipts of every block.
    CorruptReceipts,
    /// Tampers with every state node.
    CorruptNodes,
}

/// Configuration of a simulated peer.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    chain: Arc<TestChain>,
    delay: Duration,
    behaviour: PeerBehaviour,
}

impl PeerConfig {
    /// An honest peer serving the chain without delay.
    pub fn new(chain: Arc<TestChain>) -> Self {
        Self { chain, delay: Duration::ZERO, behaviour: PeerBehaviour::Honest }
    }

    /// Sets the time the peer takes to answer.
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Sets how the peer answers.
    pub const fn with_behaviour(mut self, behaviour: PeerBehaviour) -> Self {
        self.behaviour = behaviour;
        self
    }

    /// The status the peer advertises for its chain.
    pub fn status(&self) -> Status {
        Status {
            version: TEST_PROTOCOL_VERSION,
            total_difficulty: self.chain.head().total_difficulty,
            head: self.chain.tip().hash(),
            genesis: self.chain.genesis().hash(),
        }
    }

    fn serve(&self, request: &EthRequest) -> EthResponse {
        let chain = &self.chain;
        let mut response = match request {
            EthRequest::GetBlockHeaders(req) => {
                EthResponse::BlockHeaders(serve_headers(chain, req))
            }
            EthRequest::GetBlockBodies(hashes) => EthResponse::BlockBodies(
                hashes
                    .iter()
                    .filter_map(|hash| chain.block_by_hash(hash))
                    .map(|block| block.block_body())
                    .collect(),
            ),
            EthRequest::GetReceipts(hashes) => EthResponse::Receipts(
                hashes.iter().filter_map(|hash| chain.receipts_by_hash(hash)).cloned().collect(),
            ),
            EthRequest::GetNodeData(hashes) => EthResponse::NodeData(
                hashes.iter().filter_map(|hash| chain.node(hash)).cloned().collect(),
            ),
        };

        match self.behaviour {
            PeerBehaviour::Honest | PeerBehaviour::Unresponsive => {}
            PeerBehaviour::Empty => truncate(&mut response, 0),
            PeerBehaviour::Partial => {
                let half = (response.len() / 2).max(1);
                truncate(&mut response, half)
            }
            PeerBehaviour::WrongKind => {
                response = match response {
                    EthResponse::NodeData(_) => EthResponse::BlockHeaders(vec![]),
                    _ => EthResponse::NodeData(vec![]),
                }
            }
            PeerBehaviour::CorruptHeaders => {
                if let EthResponse::BlockHeaders(headers) = &mut response {
                    if let Some(last) = headers.last_mut() {
                        last.extra_data = Bytes::from_static(b"corrupt");
                    }
                }
            }
            PeerBehaviour::ForgedSkeleton => {
                if let (EthRequest::GetBlockHeaders(req), EthResponse::BlockHeaders(headers)) =
                    (request, &mut response)
                {
                    if req.skip > 0 {
                        for header in headers {
                            header.extra_data = Bytes::from_static(b"forged");
                        }
                    }
                }
            }
            PeerBehaviour::CorruptBodies => {
                if let EthResponse::BlockBodies(bodies) = &mut response {
                    for body in bodies {
                        body.transactions.push(Bytes::from_static(b"corrupt"));
                    }
                }
            }
            PeerBehaviour::CorruptReceipts => {
                if let EthResponse::Receipts(receipts) = &mut response {
                    for block in receipts {
                        block.push(Receipt { success: false, ..Default::default() });
                    }
                }
            }
            PeerBehaviour::CorruptNodes => {
                if let EthResponse::NodeData(nodes) = &mut response {
                    for node in nodes.iter_mut() {
                        let mut data = node.to_vec();
                        data.push(0);
                        *node = data.into();
                    }
                }
            }
        }
        response
    }
}

fn serve_headers(chain: &TestChain, req: &GetBlockHeaders) -> Vec<Header> {
    let start = match req.start_block {
        BlockHashOrNumber::Hash(hash) => match chain.block_by_hash(&hash) {
            Some(block) => block.number,
            None => return vec![],
        },
        BlockHashOrNumber::Number(number) => number,
    };
    let step = req.skip as u64 + 1;
    let mut headers = Vec::new();
    let mut number = Some(start);
    while let Some(current) = number {
        if headers.len() as u64 >= req.limit {
            break
        }
        let Some(block) = chain.block(current) else { break };
        headers.push(block.header.header().clone());
        number = match req.direction {
            HeadersDirection::Rising => current.checked_add(step),
            HeadersDirection::Falling => current.checked_sub(step),
        };
    }
    headers
}

fn truncate(response: &mut EthResponse, len: usize) {
    match response {
        EthResponse::BlockHeaders(items) => items.truncate(len),
        EthResponse::BlockBodies(items) => items.truncate(len),
        EthResponse::Receipts(items) => items.truncate(len),
        EthResponse::NodeData(items) => items.truncate(len),
    }
}

/// A simulated network.
///
/// Implements [`PeerTransport`]: requests are answered by the addressed peer's [`PeerConfig`] and
/// delivered back as [`NetworkEvent::Response`] on the event channel returned by
/// [`Testnet::new`], like a real transport would.
#[derive(Debug)]
pub struct Testnet {
    peers: RwLock<HashMap<PeerId, PeerConfig>>,
    events: mpsc::UnboundedSender<NetworkEvent>,
    requests: Mutex<Vec<(PeerId, EthRequest)>>,
    disconnected: Mutex<Vec<PeerId>>,
}

impl Testnet {
    /// Creates an empty network, returning the stream of events it emits.
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<NetworkEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let net = Self {
            peers: Default::default(),
            events,
            requests: Default::default(),
            disconnected: Default::default(),
        };
        (Arc::new(net), rx)
    }

    /// Connects a peer, emitting [`NetworkEvent::SessionEstablished`].
    pub fn add_peer(&self, peer_id: PeerId, config: PeerConfig) {
        let status = config.status();
        self.peers.write().insert(peer_id, config);
        let _ = self.events.send(NetworkEvent::SessionEstablished { peer_id, status });
    }

    /// Disconnects a peer, emitting [`NetworkEvent::SessionClosed`].
    pub fn remove_peer(&self, peer_id: &PeerId) {
        if self.peers.write().remove(peer_id).is_some() {
            let _ = self.events.send(NetworkEvent::SessionClosed { peer_id: *peer_id });
        }
    }

    /// Replaces the chain the peer serves, without announcing it.
    pub fn set_chain(&self, peer_id: &PeerId, chain: Arc<TestChain>) {
        if let Some(config) = self.peers.write().get_mut(peer_id) {
            config.chain = chain;
        }
    }

    /// Emits a [`NetworkEvent::NewBlockHashes`] from the peer.
    pub fn announce(&self, peer_id: PeerId, block: &SealedBlock) {
        let hashes = vec![BlockHashNumber { hash: block.hash(), number: block.number }];
        let _ = self.events.send(NetworkEvent::NewBlockHashes { peer_id, hashes });
    }

    /// Emits a [`NetworkEvent::NewBlock`] from the peer.
    pub fn propagate(&self, peer_id: PeerId, block: SealedBlock, td: U256) {
        let block = NewBlock { block, td };
        let _ = self.events.send(NetworkEvent::NewBlock { peer_id, block });
    }

    /// Emits an arbitrary event.
    pub fn emit(&self, event: NetworkEvent) {
        let _ = self.events.send(event);
    }

    /// All requests sent so far.
    pub fn requests(&self) -> Vec<(PeerId, EthRequest)> {
        self.requests.lock().clone()
    }

    /// Number of requests sent to the peer so far.
    pub fn requests_to(&self, peer_id: &PeerId) -> usize {
        self.requests.lock().iter().filter(|(peer, _)| peer == peer_id).count()
    }

    /// Peers that were disconnected through [`PeerTransport::disconnect`].
    pub fn disconnected(&self) -> Vec<PeerId> {
        self.disconnected.lock().clone()
    }

    /// Returns true if the peer is connected.
    pub fn is_connected(&self, peer_id: &PeerId) -> bool {
        self.peers.read().contains_key(peer_id)
    }
}

impl PeerTransport for Testnet {
    fn send_request(
        &self,
        peer_id: PeerId,
        request_id: RequestId,
        request: EthRequest,
    ) -> RequestResult<()> {
        let config = self.peers.read().get(&peer_id).cloned().ok_or(RequestError::UnknownPeer)?;
        self.requests.lock().push((peer_id, request.clone()));
        if config.behaviour == PeerBehaviour::Unresponsive {
            return Ok(())
        }

        let response = NetworkEvent::Response { peer_id, request_id, response: config.serve(&request) };
        if config.delay.is_zero() {
            let _ = self.events.send(response);
        } else {
            let events = self.events.clone();
            tokio::spawn(async move {
                tokio::time::sleep(config.delay).await;
                let _ = events.send(response);
            });
        }
        Ok(())
    }

    fn disconnect(&self, peer_id: PeerId) {
        self.disconnected.lock().push(peer_id);
        self.remove_peer(&peer_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fbc_primitives::B512;

    #[test]
    fn serves_header_ranges() {
        let chain = Arc::new(TestChain::new(20, 1));
        let config = PeerConfig::new(chain.clone());

        let req = GetBlockHeaders {
            start_block: 18u64.into(),
            limit: 5,
            skip: 1,
            direction: HeadersDirection::Falling,
        };
        let EthResponse::BlockHeaders(headers) = config.serve(&EthRequest::GetBlockHeaders(req))
        else {
            panic!("expected headers")
        };
        assert_eq!(headers.iter().map(|h| h.number).collect::<Vec<_>>(), vec![18, 16, 14, 12, 10]);

        let req = GetBlockHeaders::rising(19, 10);
        assert_eq!(config.serve(&EthRequest::GetBlockHeaders(req)).len(), 2);
    }

    #[test]
    fn corrupt_peer_tampers() {
        let chain = Arc::new(TestChain::new(4, 1));
        let hashes = (1..=4).map(|n| chain.block(n).unwrap().hash()).collect::<Vec<_>>();
        let config =
            PeerConfig::new(chain.clone()).with_behaviour(PeerBehaviour::CorruptBodies);
        let EthResponse::BlockBodies(bodies) =
            config.serve(&EthRequest::GetBlockBodies(hashes.clone()))
        else {
            panic!("expected bodies")
        };
        for (body, hash) in bodies.iter().zip(&hashes) {
            assert!(!body.matches(chain.block_by_hash(hash).unwrap()));
        }

        let partial = PeerConfig::new(chain).with_behaviour(PeerBehaviour::Partial);
        assert_eq!(partial.serve(&EthRequest::GetReceipts(hashes)).len(), 2);
    }

    #[test]
    fn unknown_peer_is_rejected() {
        let (net, _events) = Testnet::new();
        let err = net
            .send_request(B512::with_last_byte(1), 1, EthRequest::GetBlockBodies(vec![]))
            .unwrap_err();
        assert_eq!(err, RequestError::UnknownPeer);
    }
}
