//! Matching of asynchronous responses to the requests they answer.

use crate::{
    message::{EthRequest, EthResponse},
    transport::PeerTransport,
};
use fbc_interfaces::p2p::{
    error::{RequestError, RequestResult},
    RequestId, WorkKind,
};
use fbc_primitives::PeerId;
use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::{sync::oneshot, time::Instant};
use tracing::trace;

/// Tracks every request that was sent and not yet resolved.
///
/// Each request is resolved exactly once: by the matching response, by its deadline, by
/// cancellation or because the peer's session closed. Whatever comes later for the same id is
/// treated as stale and ignored.
#[derive(Debug, Clone)]
pub struct Correlator {
    transport: Arc<dyn PeerTransport>,
    inner: Arc<Mutex<Inflight>>,
}

#[derive(Debug, Default)]
struct Inflight {
    next_id: RequestId,
    requests: HashMap<RequestId, InflightRequest>,
}

/// A request that was sent and is waiting for a response.
#[derive(Debug)]
struct InflightRequest {
    peer_id: PeerId,
    kind: WorkKind,
    sent_at: Instant,
    deadline: Instant,
    tx: oneshot::Sender<RequestResult<EthResponse>>,
}

impl InflightRequest {
    fn resolve(self, result: RequestResult<EthResponse>) {
        // the receiver may already be gone if the caller stopped waiting
        let _ = self.tx.send(result);
    }
}

/// Receiving half of a sent request.
#[derive(Debug)]
pub struct PendingRequest {
    /// Id the request was sent with.
    pub request_id: RequestId,
    /// The peer the request was sent to.
    pub peer_id: PeerId,
    /// Point in time the request times out.
    pub deadline: Instant,
    pub(crate) rx: oneshot::Receiver<RequestResult<EthResponse>>,
}

impl Correlator {
    /// Creates a new correlator sending through the given transport.
    pub fn new(transport: Arc<dyn PeerTransport>) -> Self {
        Self { transport, inner: Default::default() }
    }

    /// The transport requests are sent through.
    pub fn transport(&self) -> &Arc<dyn PeerTransport> {
        &self.transport
    }

    /// Assigns a fresh request id, records the request as pending and hands it to the transport.
    pub fn send(
        &self,
        peer_id: PeerId,
        request: EthRequest,
        timeout: Duration,
    ) -> RequestResult<PendingRequest> {
        let (tx, rx) = oneshot::channel();
        let sent_at = Instant::now();
        let deadline = sent_at + timeout;
        let request_id = {
            let mut inner = self.inner.lock();
            inner.next_id += 1;
            let request_id = inner.next_id;
            inner.requests.insert(
                request_id,
                InflightRequest { peer_id, kind: request.kind(), sent_at, deadline, tx },
            );
            request_id
        };

        // the lock must not be held here, a transport may answer synchronously
        if let Err(err) = self.transport.send_request(peer_id, request_id, request) {
            self.inner.lock().requests.remove(&request_id);
            return Err(err)
        }
        trace!(target: "net::correlator", ?peer_id, request_id, "Sent request");
        Ok(PendingRequest { request_id, peer_id, deadline, rx })
    }

    /// Resolves the pending request with the response.
    ///
    /// Returns the time it took the peer to answer, or `None` if the response is stale: the id
    /// is unknown, already resolved, or belongs to a request sent to a different peer.
    pub fn complete(
        &self,
        peer_id: PeerId,
        request_id: RequestId,
        response: EthResponse,
    ) -> Option<Duration> {
        let request = {
            let mut inner = self.inner.lock();
            if !inner.requests.get(&request_id).is_some_and(|req| req.peer_id == peer_id) {
                trace!(target: "net::correlator", ?peer_id, request_id, "Dropping stale response");
                return None
            }
            inner.requests.remove(&request_id)?
        };
        let elapsed = request.sent_at.elapsed();
        request.resolve(Ok(response));
        Some(elapsed)
    }

    /// Resolves the request with [`RequestError::Timeout`] if it is still pending.
    pub fn on_timeout(&self, request_id: RequestId) -> bool {
        self.resolve_with(request_id, RequestError::Timeout)
    }

    /// Resolves the request with [`RequestError::Cancelled`] if it is still pending.
    pub fn cancel(&self, request_id: RequestId) -> bool {
        self.resolve_with(request_id, RequestError::Cancelled)
    }

    fn resolve_with(&self, request_id: RequestId, err: RequestError) -> bool {
        let Some(request) = self.inner.lock().requests.remove(&request_id) else { return false };
        request.resolve(Err(err));
        true
    }

    /// Times out every pending request whose deadline is at or before `now`.
    pub fn expire(&self, now: Instant) -> Vec<(PeerId, RequestId)> {
        let expired = {
            let mut inner = self.inner.lock();
            let ids = inner
                .requests
                .iter()
                .filter(|(_, req)| req.deadline <= now)
                .map(|(id, _)| *id)
                .collect::<Vec<_>>();
            ids.into_iter()
                .filter_map(|id| inner.requests.remove(&id).map(|req| (id, req)))
                .collect::<Vec<_>>()
        };
        expired
            .into_iter()
            .map(|(id, req)| {
                let peer_id = req.peer_id;
                req.resolve(Err(RequestError::Timeout));
                (peer_id, id)
            })
            .collect()
    }

    /// Resolves every request pending at the peer with [`RequestError::ConnectionDropped`].
    ///
    /// Returns the number of requests that were resolved.
    pub fn drop_peer(&self, peer_id: PeerId) -> usize {
        let dropped = {
            let mut inner = self.inner.lock();
            let ids = inner
                .requests
                .iter()
                .filter(|(_, req)| req.peer_id == peer_id)
                .map(|(id, _)| *id)
                .collect::<Vec<_>>();
            ids.into_iter().filter_map(|id| inner.requests.remove(&id)).collect::<Vec<_>>()
        };
        let count = dropped.len();
        for req in dropped {
            req.resolve(Err(RequestError::ConnectionDropped));
        }
        count
    }

    /// Returns true if the request is still waiting for a response.
    pub fn is_pending(&self, request_id: RequestId) -> bool {
        self.inner.lock().requests.contains_key(&request_id)
    }

    /// Number of pending requests of the given kind at the peer.
    pub fn pending_at(&self, peer_id: PeerId, kind: WorkKind) -> usize {
        self.inner
            .lock()
            .requests
            .values()
            .filter(|req| req.peer_id == peer_id && req.kind == kind)
            .count()
    }

    /// Total number of pending requests.
    pub fn len(&self) -> usize {
        self.inner.lock().requests.len()
    }

    /// Returns true if no request is pending.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
