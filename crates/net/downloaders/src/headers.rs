use fbc_interfaces::{
    consensus::Consensus,
    p2p::error::{DownloadError, DownloadResult},
};
use fbc_primitives::{Header, SealedHeader, B256};

/// Validate a header against its parent.
///
/// Checks linkage and sequential numbering first, then runs the cheap consensus check. Seals are
/// not verified here.
pub fn validate_header_download(
    consensus: &dyn Consensus,
    header: &SealedHeader,
    parent: &SealedHeader,
) -> DownloadResult<()> {
    ensure_parent(header, parent)?;
    consensus.validate_header(header, parent).map_err(|error| DownloadError::HeaderValidation {
        hash: header.hash(),
        number: header.number,
        error,
    })
}

/// Ensures the header links to the parent by hash and number.
pub fn ensure_parent(header: &SealedHeader, parent: &SealedHeader) -> DownloadResult<()> {
    if header.parent_hash != parent.hash() || header.number != parent.number + 1 {
        return Err(DownloadError::MismatchedHeaders {
            header_number: header.number,
            header_hash: header.hash(),
            parent_number: parent.number,
            parent_hash: parent.hash(),
        })
    }
    Ok(())
}

/// Seals and validates a contiguous header response that must continue `parent`.
///
/// The first header must be at `parent.number + 1` and link to `parent`, otherwise the parent
/// itself is disputed with [`DownloadError::AnchorMismatch`]. At most `max` headers are
/// accepted. If `anchor` is set the response must be exactly `max` headers long and the last
/// header must hash to it.
pub fn validate_header_range(
    consensus: &dyn Consensus,
    parent: &SealedHeader,
    headers: Vec<Header>,
    max: u64,
    anchor: Option<B256>,
) -> DownloadResult<Vec<SealedHeader>> {
    if headers.is_empty() {
        return Err(DownloadError::EmptyResponse)
    }
    if headers.len() as u64 > max {
        return Err(DownloadError::TooManyHeaders { received: headers.len() as u64, expected: max })
    }
    let expected_start = parent.number + 1;
    if headers[0].number != expected_start {
        return Err(DownloadError::HeadersResponseStartBlockMismatch {
            received: headers[0].number,
            expected: expected_start,
        })
    }

    // the parent may be the anchor of the previous range, so a broken first link disputes it
    if headers[0].parent_hash != parent.hash() {
        return Err(DownloadError::AnchorMismatch {
            number: parent.number,
            received: headers[0].parent_hash,
            expected: parent.hash(),
        })
    }
    if anchor.is_some() && (headers.len() as u64) < max {
        return Err(DownloadError::IncompleteRange { received: headers.len() as u64, expected: max })
    }

    let mut sealed: Vec<SealedHeader> = Vec::with_capacity(headers.len());
    for header in headers {
        let header = header.seal_slow();
        validate_header_download(consensus, &header, sealed.last().unwrap_or(parent))?;
        sealed.push(header);
    }

    if let (Some(expected), Some(last)) = (anchor, sealed.last()) {
        if last.hash() != expected {
            return Err(DownloadError::AnchorMismatch {
                number: last.number,
                received: last.hash(),
                expected,
            })
        }
    }
    Ok(sealed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use fbc_interfaces::test_utils::{TestChain, TestConsensus};

    fn raw(chain: &TestChain, range: std::ops::RangeInclusive<u64>) -> Vec<Header> {
        range.map(|n| chain.block(n).unwrap().header.header().clone()).collect()
    }

    #[test]
    fn accepts_anchored_range() {
        let chain = TestChain::new(10, 1);
        let consensus = TestConsensus::default();
        let parent = chain.block(2).unwrap().header.clone();
        let anchor = chain.block(6).unwrap().hash();

        let headers =
            validate_header_range(&consensus, &parent, raw(&chain, 3..=6), 4, Some(anchor))
                .unwrap();
        assert_eq!(headers.len(), 4);
        assert_eq!(headers.last().unwrap().hash(), anchor);

        // without an anchor a short answer is fine
        let headers =
            validate_header_range(&consensus, &parent, raw(&chain, 3..=4), 4, None).unwrap();
        assert_eq!(headers.len(), 2);
    }

    #[test]
    fn anchored_range_must_be_complete() {
        let chain = TestChain::new(4, 1);
        let fork = chain.fork(0, 4, 2, 1);
        let consensus = TestConsensus::default();
        let parent = chain.genesis().header.clone();
        let anchor = chain.block(4).unwrap().hash();

        // a prefix of another chain can not be told apart from a short honest answer
        assert_matches!(
            validate_header_range(&consensus, &parent, raw(&fork, 1..=2), 4, Some(anchor)),
            Err(DownloadError::IncompleteRange { received: 2, expected: 4 })
        );
        assert_matches!(
            validate_header_range(&consensus, &parent, raw(&chain, 1..=3), 4, Some(anchor)),
            Err(DownloadError::IncompleteRange { received: 3, expected: 4 })
        );
        assert_matches!(
            validate_header_range(&consensus, &parent, raw(&fork, 1..=4), 4, Some(anchor)),
            Err(DownloadError::AnchorMismatch { number: 4, .. })
        );
        let headers =
            validate_header_range(&consensus, &parent, raw(&chain, 1..=4), 4, Some(anchor))
                .unwrap();
        assert_eq!(headers.last().unwrap().hash(), anchor);

        // a range continuing a block of the fork disputes that block
        let forked_parent = fork.block(2).unwrap().header.clone();
        assert_matches!(
            validate_header_range(&consensus, &forked_parent, raw(&chain, 3..=4), 2, Some(anchor)),
            Err(DownloadError::AnchorMismatch { number: 2, expected, .. })
                if expected == forked_parent.hash()
        );
    }

    #[test]
    fn rejects_broken_ranges() {
        let chain = TestChain::new(10, 1);
        let fork = chain.fork(4, 6, 2, 1);
        let consensus = TestConsensus::default();
        let parent = chain.block(2).unwrap().header.clone();

        assert_matches!(
            validate_header_range(&consensus, &parent, vec![], 4, None),
            Err(DownloadError::EmptyResponse)
        );
        assert_matches!(
            validate_header_range(&consensus, &parent, raw(&chain, 3..=7), 4, None),
            Err(DownloadError::TooManyHeaders { received: 5, expected: 4 })
        );
        assert_matches!(
            validate_header_range(&consensus, &parent, raw(&chain, 4..=6), 4, None),
            Err(DownloadError::HeadersResponseStartBlockMismatch { received: 4, expected: 3 })
        );

        // the fork diverges after block 4
        let mut mixed = raw(&chain, 3..=5);
        mixed.push(fork.block(6).unwrap().header.header().clone());
        assert_matches!(
            validate_header_range(&consensus, &parent, mixed, 4, None),
            Err(DownloadError::MismatchedHeaders { header_number: 6, .. })
        );

        let anchor = chain.block(6).unwrap().hash();
        let mut forked = raw(&chain, 3..=4);
        forked.extend(raw(&fork, 5..=6));
        assert_matches!(
            validate_header_range(&consensus, &parent, forked, 4, Some(anchor)),
            Err(DownloadError::AnchorMismatch { number: 6, .. })
        );

        consensus.set_fail_validation(true);
        assert_matches!(
            validate_header_range(&consensus, &parent, raw(&chain, 3..=6), 4, None),
            Err(DownloadError::HeaderValidation { number: 3, .. })
        );
    }
}
