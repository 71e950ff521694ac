//! Skeleton of the target chain.
//!
//! Every `max_header_fetch`-th header between the common ancestor and the target is fetched from
//! a single trusted peer. Each of them anchors one header range in the [`TaskQueue`], so the
//! ranges can be filled by any peer and still be verified on their own. The peer each anchor came
//! from is remembered, so that it can be blamed if the fillers disagree with it.

use fbc_config::SyncConfig;
use fbc_downloaders::TaskQueue;
use fbc_interfaces::p2p::error::{DownloadError, DownloadResult};
use fbc_network::GetBlockHeaders;
use fbc_primitives::{BlockNumber, Header, HeadersDirection, PeerId, SealedHeader};
use std::collections::HashMap;
use tracing::trace;

#[derive(Debug)]
pub(crate) struct Skeleton {
    span: u64,
    max_size: u64,
    /// Parent of the next range to schedule
    last: SealedHeader,
    target: SealedHeader,
    /// The peer the target header came from
    target_source: PeerId,
    /// Peers that supplied the anchors, by anchor number
    sources: HashMap<BlockNumber, PeerId>,
    inflight: bool,
    done: bool,
}

impl Skeleton {
    pub(crate) fn new(
        ancestor: SealedHeader,
        target: SealedHeader,
        target_source: PeerId,
        config: &SyncConfig,
    ) -> Self {
        Self {
            span: config.max_header_fetch.max(1),
            max_size: config.max_skeleton_size.max(1),
            last: ancestor,
            target,
            target_source,
            sources: HashMap::new(),
            inflight: false,
            done: false,
        }
    }

    /// Returns `true` once every range up to the target is scheduled.
    pub(crate) const fn is_done(&self) -> bool {
        self.done
    }

    pub(crate) const fn is_inflight(&self) -> bool {
        self.inflight
    }

    /// The peer that supplied the anchor at `number`.
    pub(crate) fn source_of(&self, number: BlockNumber) -> Option<PeerId> {
        if number == self.target.number {
            return Some(self.target_source)
        }
        self.sources.get(&number).copied()
    }

    /// Anchors left between the last scheduled range and the target, capped to one request.
    fn anchors(&self) -> u64 {
        let remaining = self.target.number.saturating_sub(self.last.number);
        (remaining.saturating_sub(1) / self.span).min(self.max_size)
    }

    /// Returns the next skeleton request.
    ///
    /// Once the target is within one range, the final range is scheduled directly, anchored to
    /// the target itself, and `None` is returned from then on.
    pub(crate) fn next_request(&mut self, queue: &mut TaskQueue) -> Option<GetBlockHeaders> {
        if self.done || self.inflight {
            return None
        }
        let anchors = self.anchors();
        if anchors == 0 {
            let remaining = self.target.number.saturating_sub(self.last.number);
            if remaining > 0 {
                queue.schedule_headers(self.last.clone(), remaining, Some(self.target.hash()));
            }
            trace!(target: "sync::controller", target = self.target.number, "Skeleton complete");
            self.done = true;
            return None
        }
        self.inflight = true;
        Some(GetBlockHeaders {
            start_block: (self.last.number + self.span).into(),
            limit: anchors,
            skip: (self.span - 1) as u32,
            direction: HeadersDirection::Rising,
        })
    }

    /// Schedules one anchored range per skeleton header. A short answer is accepted as far as
    /// it goes.
    ///
    /// Answers to a request this skeleton did not send are stale.
    pub(crate) fn on_headers(
        &mut self,
        source: PeerId,
        headers: Vec<Header>,
        queue: &mut TaskQueue,
    ) -> DownloadResult<usize> {
        if !self.inflight {
            return Err(DownloadError::StaleDelivery)
        }
        self.inflight = false;
        let expected = self.anchors();
        if headers.is_empty() {
            return Err(DownloadError::EmptyResponse)
        }
        if headers.len() as u64 > expected {
            return Err(DownloadError::TooManyHeaders {
                received: headers.len() as u64,
                expected,
            })
        }

        let mut anchors = Vec::with_capacity(headers.len());
        for (header, idx) in headers.into_iter().zip(1..) {
            let number = self.last.number + self.span * idx;
            if header.number != number {
                return Err(DownloadError::HeadersResponseStartBlockMismatch {
                    received: header.number,
                    expected: number,
                })
            }
            anchors.push(header.seal_slow());
        }

        let scheduled = anchors.len();
        for anchor in anchors {
            queue.schedule_headers(self.last.clone(), self.span, Some(anchor.hash()));
            self.sources.insert(anchor.number, source);
            self.last = anchor;
        }
        trace!(target: "sync::controller", scheduled, last = self.last.number, "Scheduled skeleton ranges");
        Ok(scheduled)
    }

    /// The skeleton request failed; it will be sent again.
    pub(crate) fn on_failure(&mut self) {
        self.inflight = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use fbc_interfaces::{
        p2p::WorkKind,
        test_utils::{TestChain, TestConsensus},
    };
    use fbc_primitives::BlockHashOrNumber;
    use std::sync::Arc;

    fn peer(id: u8) -> PeerId {
        PeerId::with_last_byte(id)
    }

    fn serve(chain: &TestChain, request: &GetBlockHeaders) -> Vec<Header> {
        let BlockHashOrNumber::Number(start) = request.start_block else { panic!("by hash") };
        let step = request.skip as u64 + 1;
        (0..request.limit)
            .filter_map(|idx| chain.block(start + idx * step))
            .map(|block| block.header.header().clone())
            .collect()
    }

    fn setup(len: u64, config: &SyncConfig) -> (TestChain, Skeleton, TaskQueue) {
        let chain = TestChain::new(len, 1);
        let skeleton = Skeleton::new(
            chain.genesis().header.clone(),
            chain.tip().header.clone(),
            peer(1),
            config,
        );
        let queue = TaskQueue::new(Arc::new(TestConsensus::default()), config);
        (chain, skeleton, queue)
    }

    #[test]
    fn anchors_every_span() {
        let config = SyncConfig { max_header_fetch: 10, max_skeleton_size: 3, ..Default::default() };
        let (chain, mut skeleton, mut queue) = setup(45, &config);

        let request = skeleton.next_request(&mut queue).unwrap();
        assert_eq!(request.start_block, BlockHashOrNumber::Number(10));
        assert_eq!((request.limit, request.skip), (3, 9));
        assert_eq!(skeleton.next_request(&mut queue), None, "one request at a time");

        assert_eq!(skeleton.on_headers(peer(2), serve(&chain, &request), &mut queue), Ok(3));
        assert_eq!(queue.pending_len(WorkKind::Headers), 3);
        assert_eq!(skeleton.source_of(20), Some(peer(2)));
        assert_eq!(skeleton.source_of(25), None);
        // the target came with the head of the master
        assert_eq!(skeleton.source_of(45), Some(peer(1)));

        // 30..40 is the last anchored range, 40..45 ends at the target
        let request = skeleton.next_request(&mut queue).unwrap();
        assert_eq!((request.start_block, request.limit), (BlockHashOrNumber::Number(40), 1));
        assert_eq!(skeleton.on_headers(peer(3), serve(&chain, &request), &mut queue), Ok(1));
        assert_eq!(skeleton.source_of(40), Some(peer(3)));
        assert_eq!(skeleton.next_request(&mut queue), None);
        assert!(skeleton.is_done());
        assert_eq!(queue.pending_len(WorkKind::Headers), 5);
    }

    #[test]
    fn short_distance_needs_no_skeleton() {
        let config = SyncConfig { max_header_fetch: 10, ..Default::default() };
        let (_, mut skeleton, mut queue) = setup(10, &config);
        assert_eq!(skeleton.next_request(&mut queue), None);
        assert!(skeleton.is_done());
        assert_eq!(queue.pending_len(WorkKind::Headers), 1);
    }

    #[test]
    fn rejects_misplaced_anchors() {
        let config = SyncConfig { max_header_fetch: 10, max_skeleton_size: 3, ..Default::default() };
        let (chain, mut skeleton, mut queue) = setup(45, &config);

        skeleton.next_request(&mut queue).unwrap();
        let consecutive = (10..13).map(|n| chain.block(n).unwrap().header.header().clone());
        assert_matches!(
            skeleton.on_headers(peer(1), consecutive.collect(), &mut queue),
            Err(DownloadError::HeadersResponseStartBlockMismatch { received: 11, expected: 20 })
        );
        assert!(!skeleton.is_inflight());
        assert_eq!(queue.pending_len(WorkKind::Headers), 0);

        skeleton.next_request(&mut queue).unwrap();
        assert_matches!(
            skeleton.on_headers(peer(1), vec![], &mut queue),
            Err(DownloadError::EmptyResponse)
        );

        // nothing was asked for
        let late = (1..=3).map(|n| chain.block(n * 10).unwrap().header.header().clone());
        assert_matches!(
            skeleton.on_headers(peer(1), late.collect(), &mut queue),
            Err(DownloadError::StaleDelivery)
        );
        assert_eq!(queue.pending_len(WorkKind::Headers), 0);
    }
}
