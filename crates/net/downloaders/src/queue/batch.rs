use fbc_primitives::{BlockNumber, Bytes, PeerId, Receipt, SealedBlock, B256};

/// A verified block ready for commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockResult {
    /// The assembled block
    pub block: SealedBlock,
    /// Downloaded receipts; only present for blocks at or below the receipts limit
    pub receipts: Option<Vec<Receipt>>,
    /// Peer that served the header, absent for anchors
    pub header_peer: Option<PeerId>,
    /// Peer that served the body, absent for empty blocks
    pub body_peer: Option<PeerId>,
}

/// A run of consecutive verified blocks.
///
/// Batches are handed out in strictly ascending order: the first block of a batch is the
/// successor of the last block of the previous one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Batch {
    /// The blocks, ascending
    pub blocks: Vec<BlockResult>,
}

impl Batch {
    /// Number of the first block.
    pub fn first_number(&self) -> Option<BlockNumber> {
        self.blocks.first().map(|result| result.block.number)
    }

    /// Number of blocks in the batch.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Returns true if the batch holds no blocks.
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

/// Outcome of an accepted delivery.
#[derive(Debug, Default)]
pub struct Delivery {
    /// Number of items accepted
    pub accepted: usize,
    /// Verified state nodes, for node deliveries
    pub nodes: Vec<(B256, Bytes)>,
    /// Blocks that became contiguous with this delivery
    pub batch: Option<Batch>,
}

/// Result of [`TaskQueue::expire`](crate::TaskQueue::expire).
#[derive(Debug, Default)]
pub struct Expired {
    /// The expired items and the peers that held them
    pub offenders: Vec<(PeerId, super::WorkKey)>,
}

impl Expired {
    /// Returns true if nothing expired.
    pub fn is_empty(&self) -> bool {
        self.offenders.is_empty()
    }
}
