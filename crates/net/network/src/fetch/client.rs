//! A client implementation that can interact with the network and download data.

use crate::{
    correlator::Correlator,
    message::{EthRequest, EthResponse, GetBlockHeaders},
};
use fbc_interfaces::p2p::error::{RequestError, RequestResult};
use fbc_primitives::{BlockBody, BlockHash, Bytes, Header, PeerId, Receipt, B256};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Front-end API for fetching data from a specific peer.
///
/// Every request resolves exactly once: with the peer's response, with
/// [`RequestError::Timeout`] once the timeout elapsed, or with [`RequestError::Cancelled`] if the
/// token fires first.
#[derive(Debug, Clone)]
pub struct FetchClient {
    correlator: Correlator,
}

impl FetchClient {
    /// Creates a new client sending through the correlator.
    pub fn new(correlator: Correlator) -> Self {
        Self { correlator }
    }

    /// The correlator the client sends through.
    pub fn correlator(&self) -> &Correlator {
        &self.correlator
    }

    /// Sends the request and waits for the response.
    ///
    /// A response of the wrong kind is reported as [`RequestError::BadResponse`].
    pub async fn send_request(
        &self,
        peer_id: PeerId,
        request: EthRequest,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> RequestResult<EthResponse> {
        let kind = request.kind();
        let mut pending = self.correlator.send(peer_id, request, timeout)?;

        let resolved = tokio::select! {
            biased;
            res = &mut pending.rx => res,
            _ = cancel.cancelled() => {
                self.correlator.cancel(pending.request_id);
                (&mut pending.rx).await
            }
            _ = tokio::time::sleep_until(pending.deadline) => {
                self.correlator.on_timeout(pending.request_id);
                (&mut pending.rx).await
            }
        };

        let response = resolved??;
        if response.kind() != kind {
            return Err(RequestError::BadResponse)
        }
        Ok(response)
    }

    /// Sends a `GetBlockHeaders` request to the peer.
    pub async fn get_headers(
        &self,
        peer_id: PeerId,
        request: GetBlockHeaders,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> RequestResult<Vec<Header>> {
        match self
            .send_request(peer_id, EthRequest::GetBlockHeaders(request), timeout, cancel)
            .await?
        {
            EthResponse::BlockHeaders(headers) => Ok(headers),
            _ => Err(RequestError::BadResponse),
        }
    }

    /// Sends a `GetBlockBodies` request to the peer.
    pub async fn get_block_bodies(
        &self,
        peer_id: PeerId,
        hashes: Vec<BlockHash>,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> RequestResult<Vec<BlockBody>> {
        match self.send_request(peer_id, EthRequest::GetBlockBodies(hashes), timeout, cancel).await?
        {
            EthResponse::BlockBodies(bodies) => Ok(bodies),
            _ => Err(RequestError::BadResponse),
        }
    }

    /// Sends a `GetReceipts` request to the peer.
    pub async fn get_receipts(
        &self,
        peer_id: PeerId,
        hashes: Vec<BlockHash>,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> RequestResult<Vec<Vec<Receipt>>> {
        match self.send_request(peer_id, EthRequest::GetReceipts(hashes), timeout, cancel).await? {
            EthResponse::Receipts(receipts) => Ok(receipts),
            _ => Err(RequestError::BadResponse),
        }
    }

    /// Sends a `GetNodeData` request to the peer.
    pub async fn get_node_data(
        &self,
        peer_id: PeerId,
        hashes: Vec<B256>,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> RequestResult<Vec<Bytes>> {
        match self.send_request(peer_id, EthRequest::GetNodeData(hashes), timeout, cancel).await? {
            EthResponse::NodeData(nodes) => Ok(nodes),
            _ => Err(RequestError::BadResponse),
        }
    }
}
