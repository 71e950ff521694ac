//! Writing downloaded blocks to the chain store.

use crate::{error::SyncError, metrics::SyncMetrics};
use fbc_downloaders::{Batch, BlockResult};
use fbc_interfaces::{
    consensus::Consensus,
    executor::{BlockExecutionError, BlockExecutor, ExecutionOutcome},
    provider::{ChainStore, ProviderError, ProviderResult},
    FbcResult,
};
use fbc_network::BlockImporter;
use fbc_primitives::{receipts_root, BlockHash, BlockNumber, Head, SealedBlock, SealedHeader, B256};
use std::{collections::VecDeque, fmt, sync::Arc};
use tracing::{debug, trace};

/// Executes the block on top of `parent_state_root` and checks the outcome against the header.
pub(crate) fn execute_block(
    store: &Arc<dyn ChainStore>,
    executor: &dyn BlockExecutor,
    block: &SealedBlock,
    parent_state_root: B256,
) -> Result<ExecutionOutcome, BlockExecutionError> {
    let outcome = executor.execute(block, parent_state_root, store)?;
    if outcome.state_root != block.state_root {
        return Err(BlockExecutionError::StateRootDiff {
            got: outcome.state_root,
            expected: block.state_root,
        })
    }
    let got = receipts_root(&outcome.receipts);
    if got != block.receipts_root {
        return Err(BlockExecutionError::ReceiptsRootDiff { got, expected: block.receipts_root })
    }
    Ok(outcome)
}

/// Persists an executed block together with the trie nodes it created.
fn write_executed(
    store: &Arc<dyn ChainStore>,
    block: SealedBlock,
    outcome: ExecutionOutcome,
) -> ProviderResult<()> {
    for (hash, node) in outcome.trie_nodes {
        store.put(hash, node)?;
    }
    store.write_block(block, outcome.receipts)
}

/// What a call to [`BlockCommitter::commit`] achieved.
#[derive(Debug, Default)]
pub(crate) struct CommitOutcome {
    /// Blocks written or deferred
    pub(crate) committed: usize,
    /// The pivot header, once the pivot block is written
    pub(crate) pivot: Option<SealedHeader>,
}

/// Commits batches in order.
///
/// In full mode every block is executed and written. In fast mode blocks up to the pivot are
/// written with their downloaded receipts and without state; blocks after it are held back
/// until the pivot state is complete and then executed.
pub(crate) struct BlockCommitter {
    store: Arc<dyn ChainStore>,
    consensus: Arc<dyn Consensus>,
    executor: Arc<dyn BlockExecutor>,
    pivot: Option<BlockNumber>,
    seal_check_frequency: u64,
    last: SealedHeader,
    parent_state_root: B256,
    state_ready: bool,
    deferred: VecDeque<BlockResult>,
    metrics: SyncMetrics,
}

impl BlockCommitter {
    pub(crate) fn new(
        store: Arc<dyn ChainStore>,
        consensus: Arc<dyn Consensus>,
        executor: Arc<dyn BlockExecutor>,
        ancestor: &SealedHeader,
        pivot: Option<BlockNumber>,
        seal_check_frequency: u64,
        metrics: SyncMetrics,
    ) -> Self {
        Self {
            store,
            consensus,
            executor,
            pivot,
            seal_check_frequency: seal_check_frequency.max(1),
            last: ancestor.clone(),
            parent_state_root: ancestor.state_root,
            state_ready: pivot.is_none(),
            deferred: VecDeque::new(),
            metrics,
        }
    }

    /// The highest block written or deferred.
    pub(crate) fn last(&self) -> BlockNumber {
        self.last.number
    }

    /// Header of the highest block written or deferred.
    pub(crate) const fn last_header(&self) -> &SealedHeader {
        &self.last
    }

    /// Returns `true` if `target` is written and its state is available.
    pub(crate) fn is_complete(&self, target: BlockNumber) -> bool {
        self.last.number == target && self.state_ready && self.deferred.is_empty()
    }

    /// Returns `true` if the blocks after the pivot are waiting for the pivot state.
    pub(crate) fn is_waiting_for_state(&self) -> bool {
        !self.state_ready
    }

    /// Commits the batch.
    ///
    /// Seals are checked before anything is written, so a batch with an invalid seal leaves
    /// the committer untouched.
    pub(crate) fn commit(&mut self, batch: Batch) -> Result<CommitOutcome, SyncError> {
        for result in &batch.blocks {
            self.check_seal(result)?;
        }
        let mut outcome = CommitOutcome::default();
        for result in batch.blocks {
            let header = result.block.header.clone();
            let number = header.number;
            match self.pivot {
                Some(pivot) if number <= pivot => {
                    self.store.write_fast_block(result.block, result.receipts.unwrap_or_default())?;
                    self.parent_state_root = header.state_root;
                    if number == pivot {
                        debug!(target: "sync::controller", number, hash = %header.hash(), "Pivot block written");
                        outcome.pivot = Some(header.clone());
                    }
                }
                Some(_) if !self.state_ready => self.deferred.push_back(result),
                _ => self.execute(result)?,
            }
            self.last = header;
            outcome.committed += 1;
        }
        self.metrics.blocks_committed.increment(outcome.committed as u64);
        Ok(outcome)
    }

    /// Makes the pivot the head once its state is complete, then executes the blocks that were
    /// held back.
    pub(crate) fn on_state_ready(&mut self, pivot: BlockHash) -> Result<usize, SyncError> {
        self.store.commit_head(pivot)?;
        self.state_ready = true;
        let deferred = self.deferred.len();
        while let Some(result) = self.deferred.pop_front() {
            self.execute(result)?;
        }
        debug!(target: "sync::controller", %pivot, deferred, "Pivot committed as head");
        Ok(deferred)
    }

    fn check_seal(&self, result: &BlockResult) -> Result<(), SyncError> {
        let number = result.block.number;
        let check = self
            .pivot
            .map_or(true, |pivot| number >= pivot || number % self.seal_check_frequency == 0);
        if !check {
            return Ok(())
        }
        self.consensus.validate_seal(&result.block.header).map_err(|error| {
            SyncError::InvalidSeal {
                number,
                hash: result.block.hash(),
                peer_id: result.header_peer,
                error,
            }
        })
    }

    fn execute(&mut self, result: BlockResult) -> Result<(), SyncError> {
        let BlockResult { block, header_peer, .. } = result;
        let number = block.number;
        let outcome =
            match execute_block(&self.store, self.executor.as_ref(), &block, self.parent_state_root)
            {
                Ok(outcome) => outcome,
                Err(BlockExecutionError::StateRootDiff { got, expected }) => {
                    return Err(SyncError::StateRootMismatch {
                        number,
                        expected,
                        got,
                        peer_id: header_peer,
                    })
                }
                Err(error) => return Err(SyncError::Execution { number, error }),
            };
        trace!(target: "sync::controller", number, "Executed block");
        self.parent_state_root = block.state_root;
        write_executed(&self.store, block, outcome)?;
        Ok(())
    }
}

impl fmt::Debug for BlockCommitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockCommitter")
            .field("pivot", &self.pivot)
            .field("last", &self.last.number)
            .field("state_ready", &self.state_ready)
            .field("deferred", &self.deferred.len())
            .finish_non_exhaustive()
    }
}

/// Imports propagated blocks: full validation, execution and write.
#[derive(Clone)]
pub struct ChainImporter {
    store: Arc<dyn ChainStore>,
    consensus: Arc<dyn Consensus>,
    executor: Arc<dyn BlockExecutor>,
}

impl ChainImporter {
    /// Creates a new importer.
    pub fn new(
        store: Arc<dyn ChainStore>,
        consensus: Arc<dyn Consensus>,
        executor: Arc<dyn BlockExecutor>,
    ) -> Self {
        Self { store, consensus, executor }
    }
}

impl BlockImporter for ChainImporter {
    fn head(&self) -> FbcResult<Head> {
        Ok(self.store.head()?)
    }

    fn has_block(&self, hash: &BlockHash) -> FbcResult<bool> {
        Ok(self.store.has_block(hash)?)
    }

    fn import_block(&self, block: SealedBlock) -> FbcResult<()> {
        let parent = self.store.header(&block.parent_hash)?.ok_or(ProviderError::UnknownParent {
            number: block.number,
            parent_hash: block.parent_hash,
        })?;
        self.consensus.validate_header(&block.header, &parent)?;
        self.consensus.validate_seal(&block.header)?;
        self.consensus.validate_body(&block.header, &block.block_body())?;
        let outcome = execute_block(&self.store, self.executor.as_ref(), &block, parent.state_root)?;
        write_executed(&self.store, block, outcome)?;
        Ok(())
    }
}

impl fmt::Debug for ChainImporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainImporter").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use fbc_interfaces::test_utils::{TestChain, TestChainStore, TestConsensus, TestExecutor};
    use fbc_primitives::PeerId;

    struct Setup {
        chain: TestChain,
        store: Arc<TestChainStore>,
        consensus: Arc<TestConsensus>,
        executor: Arc<TestExecutor>,
    }

    impl Setup {
        fn new(chain: TestChain) -> Self {
            Self {
                store: Arc::new(chain.store(0)),
                chain,
                consensus: Default::default(),
                executor: Default::default(),
            }
        }

        fn committer(&self, pivot: Option<BlockNumber>, frequency: u64) -> BlockCommitter {
            BlockCommitter::new(
                self.store.clone(),
                self.consensus.clone(),
                self.executor.clone(),
                &self.chain.genesis().header,
                pivot,
                frequency,
                SyncMetrics::default(),
            )
        }

        fn batch(&self, range: std::ops::RangeInclusive<u64>, receipts_up_to: u64) -> Batch {
            let blocks = range
                .map(|number| {
                    let block = self.chain.block(number).unwrap().clone();
                    let receipts = (number <= receipts_up_to)
                        .then(|| self.chain.receipts_by_hash(&block.hash()).unwrap().clone());
                    BlockResult {
                        block,
                        receipts,
                        header_peer: Some(PeerId::with_last_byte(7)),
                        body_peer: None,
                    }
                })
                .collect();
            Batch { blocks }
        }
    }

    #[test]
    fn full_mode_executes_every_block() {
        let setup = Setup::new(TestChain::new(10, 1));
        let mut committer = setup.committer(None, 1);

        let outcome = committer.commit(setup.batch(1..=10, 0)).unwrap();
        assert_eq!(outcome.committed, 10);
        assert!(outcome.pivot.is_none());
        assert!(committer.is_complete(10));
        assert_eq!(setup.executor.executed(), 10);
        assert_eq!(setup.store.head().unwrap(), setup.chain.head());
    }

    #[test]
    fn state_root_mismatch_blames_header_peer() {
        let setup = Setup::new(TestChain::new(10, 1).with_invalid_state_root(4));
        let mut committer = setup.committer(None, 1);

        let err = committer.commit(setup.batch(1..=10, 0)).unwrap_err();
        assert_matches!(err, SyncError::StateRootMismatch { number: 4, .. });
        assert_eq!(err.offender(), Some(PeerId::with_last_byte(7)));
        assert!(err.is_fatal());
        assert_eq!(setup.store.head().unwrap().number, 3);
        assert!(!setup.store.has_block(&setup.chain.block(4).unwrap().hash()).unwrap());
    }

    #[test]
    fn fast_mode_defers_blocks_after_pivot() {
        let setup = Setup::new(TestChain::new(10, 1));
        let mut committer = setup.committer(Some(6), 100);

        let outcome = committer.commit(setup.batch(1..=10, 6)).unwrap();
        let pivot = outcome.pivot.unwrap();
        assert_eq!(pivot.number, 6);
        assert_eq!(setup.executor.executed(), 0);
        assert_eq!(setup.store.head().unwrap().number, 0);
        assert!(committer.is_waiting_for_state());
        assert!(!committer.is_complete(10));
        let hash = setup.chain.block(3).unwrap().hash();
        assert_eq!(setup.store.receipts(&hash), setup.chain.receipts_by_hash(&hash).cloned());

        setup.store.kv().extend(setup.chain.state_nodes(6));
        assert_eq!(committer.on_state_ready(pivot.hash()), Ok(4));
        assert_eq!(setup.executor.executed(), 4);
        assert!(committer.is_complete(10));
        assert_eq!(setup.store.head().unwrap(), setup.chain.head());
    }

    #[test]
    fn missing_pivot_state_is_an_error() {
        let setup = Setup::new(TestChain::new(10, 1));
        let mut committer = setup.committer(Some(6), 100);
        let pivot = committer.commit(setup.batch(1..=6, 6)).unwrap().pivot.unwrap();
        assert_matches!(
            committer.on_state_ready(pivot.hash()),
            Err(SyncError::Provider(ProviderError::MissingState { .. }))
        );
    }

    #[test]
    fn seals_are_sampled_in_fast_mode() {
        let setup = Setup::new(TestChain::new(10, 1));
        setup.consensus.set_invalid_seal(setup.chain.block(3).unwrap().hash());
        let mut committer = setup.committer(Some(8), 2);
        assert_eq!(committer.commit(setup.batch(1..=3, 8)).unwrap().committed, 3);

        setup.consensus.set_invalid_seal(setup.chain.block(4).unwrap().hash());
        let err = committer.commit(setup.batch(4..=5, 8)).unwrap_err();
        assert_matches!(err, SyncError::InvalidSeal { number: 4, .. });
        assert!(!err.is_fatal());

        // full mode checks every header
        let setup = Setup::new(TestChain::new(10, 1));
        setup.consensus.set_invalid_seal(setup.chain.block(3).unwrap().hash());
        let mut committer = setup.committer(None, 2);
        assert_matches!(
            committer.commit(setup.batch(1..=3, 0)),
            Err(SyncError::InvalidSeal { number: 3, .. })
        );
        // nothing of the batch is written
        assert_eq!(setup.store.head().unwrap().number, 0);
        assert_eq!(committer.last_header(), &setup.chain.genesis().header);

        assert_eq!(committer.commit(setup.batch(1..=2, 0)).unwrap().committed, 2);
        assert_eq!(committer.last_header(), &setup.chain.block(2).unwrap().header);
    }

    #[test]
    fn importer_runs_full_validation() {
        let chain = TestChain::new(3, 1);
        let store = Arc::new(chain.store(1));
        let consensus = Arc::new(TestConsensus::default());
        let importer =
            ChainImporter::new(store.clone(), consensus.clone(), Arc::new(TestExecutor::default()));

        importer.import_block(chain.block(2).unwrap().clone()).unwrap();
        assert_eq!(importer.head().unwrap().number, 2);

        let bad = chain.with_invalid_state_root(3);
        assert_matches!(
            importer.import_block(bad.block(3).unwrap().clone()),
            Err(fbc_interfaces::FbcError::Execution(BlockExecutionError::StateRootDiff { .. }))
        );
        assert_eq!(importer.head().unwrap().number, 2);
    }
}
