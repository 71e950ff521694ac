//! Tests for typed requests over the simulated network

use fbc_interfaces::{p2p::error::RequestError, test_utils::TestChain};
use fbc_network::{
    test_utils::{PeerBehaviour, PeerConfig, Testnet},
    Correlator, FetchClient, GetBlockHeaders, NetworkEvent,
};
use fbc_primitives::{B512, PeerId};
use std::{sync::Arc, time::Duration};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;

const TIMEOUT: Duration = Duration::from_secs(5);

/// Routes responses from the network to the correlator.
fn spawn_router(correlator: Correlator, mut events: UnboundedReceiver<NetworkEvent>) {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if let NetworkEvent::Response { peer_id, request_id, response } = event {
                correlator.complete(peer_id, request_id, response);
            }
        }
    });
}

fn setup(behaviour: PeerBehaviour) -> (Arc<Testnet>, FetchClient, Arc<TestChain>, PeerId) {
    let chain = Arc::new(TestChain::new(40, 11));
    let (net, events) = Testnet::new();
    let peer = B512::with_last_byte(1);
    net.add_peer(
        peer,
        PeerConfig::new(chain.clone())
            .with_delay(Duration::from_millis(20))
            .with_behaviour(behaviour),
    );
    let correlator = Correlator::new(net.clone());
    spawn_router(correlator.clone(), events);
    (net, FetchClient::new(correlator), chain, peer)
}

#[tokio::test(start_paused = true)]
async fn test_get_headers_and_bodies() {
    fbc_tracing::init_test_tracing();
    let (_net, client, chain, peer) = setup(PeerBehaviour::Honest);

    let headers = client
        .get_headers(peer, GetBlockHeaders::rising(5, 10), TIMEOUT, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(headers.len(), 10);
    assert_eq!(headers[0].hash_slow(), chain.block(5).unwrap().hash());

    let hashes = (5..15).map(|n| chain.block(n).unwrap().hash()).collect::<Vec<_>>();
    let bodies = client
        .get_block_bodies(peer, hashes.clone(), TIMEOUT, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(bodies.len(), 10);
    assert_eq!(bodies[3], chain.block(8).unwrap().block_body());

    let receipts =
        client.get_receipts(peer, hashes, TIMEOUT, CancellationToken::new()).await.unwrap();
    assert_eq!(&receipts[0], chain.receipts_by_hash(&chain.block(5).unwrap().hash()).unwrap());

    let root = chain.block(40).unwrap().state_root;
    let nodes =
        client.get_node_data(peer, vec![root], TIMEOUT, CancellationToken::new()).await.unwrap();
    assert_eq!(nodes.len(), 1);
    assert!(client.correlator().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_unresponsive_peer_times_out() {
    let (_net, client, _chain, peer) = setup(PeerBehaviour::Unresponsive);
    let err = client
        .get_headers(peer, GetBlockHeaders::rising(1, 1), TIMEOUT, CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err, RequestError::Timeout);
    assert!(client.correlator().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_wrong_kind_is_bad_response() {
    let (_net, client, _chain, peer) = setup(PeerBehaviour::WrongKind);
    let err = client
        .get_block_bodies(peer, vec![], TIMEOUT, CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err, RequestError::BadResponse);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_resolves_waiter() {
    let (_net, client, _chain, peer) = setup(PeerBehaviour::Unresponsive);
    let cancel = CancellationToken::new();
    let request = tokio::spawn({
        let client = client.clone();
        let cancel = cancel.clone();
        async move { client.get_headers(peer, GetBlockHeaders::rising(1, 1), TIMEOUT, cancel).await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    cancel.cancel();
    assert_eq!(request.await.unwrap().unwrap_err(), RequestError::Cancelled);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_drops_pending() {
    let (net, client, _chain, peer) = setup(PeerBehaviour::Unresponsive);
    let request = tokio::spawn({
        let client = client.clone();
        async move {
            client
                .get_headers(peer, GetBlockHeaders::rising(1, 1), TIMEOUT, CancellationToken::new())
                .await
        }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    net.remove_peer(&peer);
    assert_eq!(client.correlator().drop_peer(peer), 1);
    assert_eq!(request.await.unwrap().unwrap_err(), RequestError::ConnectionDropped);

    // no session, no request
    let err = client
        .get_headers(peer, GetBlockHeaders::rising(1, 1), TIMEOUT, CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err, RequestError::UnknownPeer);
}
