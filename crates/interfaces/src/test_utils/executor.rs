use crate::{
    executor::{BlockExecutionError, BlockExecutor, ExecutionOutcome},
    provider::KeyValueStore,
};
use fbc_primitives::{Address, Bytes, Log, Receipt, SealedBlock, TrieNode, B256};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

const ACCOUNTS: usize = 16;
const FANOUT: usize = 4;

/// A toy world state: sixteen account balances stored in a three level trie.
///
/// The root references four branch nodes, each branch references four account leaves. Every node
/// is content addressed, so identical subtrees are shared between blocks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TestState {
    /// Account balances
    pub balances: [u64; ACCOUNTS],
}

impl TestState {
    fn leaf(&self, account: usize) -> TrieNode {
        let mut value = vec![account as u8];
        value.extend_from_slice(&self.balances[account].to_be_bytes());
        TrieNode::leaf(value)
    }

    /// Builds the trie, returning the root hash and every node of it.
    pub fn commit(&self) -> (B256, Vec<(B256, Bytes)>) {
        let mut nodes = Vec::with_capacity(ACCOUNTS + FANOUT + 1);
        let mut branches = Vec::with_capacity(FANOUT);
        for branch in 0..FANOUT {
            let mut children = Vec::with_capacity(FANOUT);
            for account in branch * FANOUT..(branch + 1) * FANOUT {
                let leaf = self.leaf(account);
                let hash = leaf.hash_slow();
                nodes.push((hash, leaf.encoded()));
                children.push(hash);
            }
            let node = TrieNode { children, value: Bytes::from(vec![branch as u8]) };
            let hash = node.hash_slow();
            nodes.push((hash, node.encoded()));
            branches.push(hash);
        }
        let root = TrieNode { children: branches, value: Bytes::new() };
        let root_hash = root.hash_slow();
        nodes.push((root_hash, root.encoded()));
        (root_hash, nodes)
    }

    /// Reads the state with the given root from the store.
    pub fn load(root: B256, store: &dyn KeyValueStore) -> Result<Self, BlockExecutionError> {
        let root_node = read_node(root, store)?;
        if root_node.children.len() != FANOUT {
            return Err(BlockExecutionError::CorruptState { hash: root })
        }
        let mut state = Self::default();
        for (branch, branch_hash) in root_node.children.iter().enumerate() {
            let branch_node = read_node(*branch_hash, store)?;
            if branch_node.children.len() != FANOUT {
                return Err(BlockExecutionError::CorruptState { hash: *branch_hash })
            }
            for (idx, leaf_hash) in branch_node.children.iter().enumerate() {
                let leaf = read_node(*leaf_hash, store)?;
                let balance: [u8; 8] = leaf
                    .value
                    .get(1..9)
                    .and_then(|raw| raw.try_into().ok())
                    .ok_or(BlockExecutionError::CorruptState { hash: *leaf_hash })?;
                state.balances[branch * FANOUT + idx] = u64::from_be_bytes(balance);
            }
        }
        Ok(state)
    }

    /// Applies the transactions of a block, returning the receipts.
    ///
    /// Every transaction credits its length to the account selected by its first byte.
    pub fn apply(
        &mut self,
        block_hash: B256,
        transactions: &[Bytes],
    ) -> Result<Vec<Receipt>, BlockExecutionError> {
        let mut cumulative_gas_used = 0;
        let mut receipts = Vec::with_capacity(transactions.len());
        for (index, tx) in transactions.iter().enumerate() {
            let Some(first) = tx.first() else {
                return Err(BlockExecutionError::InvalidTransaction { block: block_hash, index })
            };
            let account = *first as usize % ACCOUNTS;
            self.balances[account] += tx.len() as u64;
            cumulative_gas_used += 21_000 + 16 * tx.len() as u64;
            receipts.push(Receipt {
                success: true,
                cumulative_gas_used,
                logs: vec![Log {
                    address: Address::with_last_byte(account as u8),
                    topics: vec![],
                    data: tx.clone(),
                }],
            });
        }
        Ok(receipts)
    }
}

fn read_node(hash: B256, store: &dyn KeyValueStore) -> Result<TrieNode, BlockExecutionError> {
    let raw = store
        .get(&hash)
        .map_err(|err| BlockExecutionError::Internal(err.to_string()))?
        .ok_or(BlockExecutionError::MissingState { root: hash })?;
    TrieNode::decode_raw(&raw).map_err(|_| BlockExecutionError::CorruptState { hash })
}

/// Executor for testing, running blocks against [`TestState`].
#[derive(Debug, Default)]
pub struct TestExecutor {
    /// Flag whether execution should purposefully fail
    fail_execution: AtomicBool,
    /// Number of executed blocks
    executed: AtomicUsize,
}

impl TestExecutor {
    /// Update the execution failure flag
    pub fn set_fail_execution(&self, val: bool) {
        self.fail_execution.store(val, Ordering::SeqCst)
    }

    /// Returns how many blocks were executed successfully.
    pub fn executed(&self) -> usize {
        self.executed.load(Ordering::SeqCst)
    }
}

impl BlockExecutor for TestExecutor {
    fn execute(
        &self,
        block: &SealedBlock,
        parent_state_root: B256,
        state: &dyn KeyValueStore,
    ) -> Result<ExecutionOutcome, BlockExecutionError> {
        if self.fail_execution.load(Ordering::SeqCst) {
            return Err(BlockExecutionError::Internal("execution disabled".to_string()))
        }
        let mut post = TestState::load(parent_state_root, state)?;
        let receipts = post.apply(block.hash(), &block.body)?;
        let (state_root, trie_nodes) = post.commit();
        self.executed.fetch_add(1, Ordering::SeqCst);
        Ok(ExecutionOutcome { receipts, state_root, trie_nodes })
    }
}
