use crate::message::EthRequest;
use fbc_interfaces::p2p::{error::RequestResult, RequestId};
use fbc_primitives::PeerId;
use std::fmt::Debug;

/// The outbound half of the peer-to-peer transport.
///
/// Sending is fire and forget: the answer arrives later as a
/// [`NetworkEvent::Response`](crate::NetworkEvent::Response) carrying the same [`RequestId`],
/// which is matched back to the request by the [`Correlator`](crate::Correlator).
#[auto_impl::auto_impl(&, Arc, Box)]
pub trait PeerTransport: Debug + Send + Sync {
    /// Sends the request to the peer.
    ///
    /// Returns [`RequestError::UnknownPeer`](fbc_interfaces::p2p::error::RequestError) if there
    /// is no session with the peer.
    fn send_request(
        &self,
        peer_id: PeerId,
        request_id: RequestId,
        request: EthRequest,
    ) -> RequestResult<()>;

    /// Closes the session with the peer.
    fn disconnect(&self, peer_id: PeerId);
}
