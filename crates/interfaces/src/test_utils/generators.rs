use super::{executor::TestState, store::TestChainStore};
use fbc_primitives::{
    receipts_root, Address, BlockBody, BlockHash, BlockNumber, Bytes, Head, Header, Receipt,
    SealedBlock, SealedHeader, B256, EMPTY_LIST_HASH, U256,
};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::collections::HashMap;

/// A valid chain with executed state, used as the "remote" view of the network in tests.
///
/// Block `n` lives at index `n`; index 0 is the genesis block.
#[derive(Debug, Clone)]
pub struct TestChain {
    blocks: Vec<SealedBlock>,
    receipts: Vec<Vec<Receipt>>,
    states: Vec<TestState>,
    total_difficulties: Vec<U256>,
    index: HashMap<BlockHash, BlockNumber>,
    nodes: HashMap<B256, Bytes>,
}

impl TestChain {
    /// Creates a chain of `len` blocks on top of the genesis block.
    ///
    /// Every block has difficulty 1.
    pub fn new(len: u64, seed: u64) -> Self {
        let genesis_state = TestState::default();
        let (state_root, nodes) = genesis_state.commit();
        let genesis = Header {
            ommers_hash: EMPTY_LIST_HASH,
            state_root,
            transactions_root: EMPTY_LIST_HASH,
            receipts_root: EMPTY_LIST_HASH,
            difficulty: U256::from(1),
            gas_limit: 30_000_000,
            ..Default::default()
        }
        .seal_slow();
        let genesis = SealedBlock::new(genesis, BlockBody::default());

        let mut chain = Self {
            index: HashMap::from([(genesis.hash(), 0)]),
            total_difficulties: vec![genesis.difficulty],
            blocks: vec![genesis],
            receipts: vec![vec![]],
            states: vec![genesis_state],
            nodes: nodes.into_iter().collect(),
        };
        chain.extend(len, seed, 1);
        chain
    }

    /// Appends `len` blocks with the given difficulty.
    pub fn extend(&mut self, len: u64, seed: u64, difficulty: u64) {
        let mut rng = StdRng::seed_from_u64(seed ^ self.tip().number);
        for _ in 0..len {
            self.push_block(&mut rng, seed, difficulty);
        }
    }

    /// Returns a chain that shares the blocks up to and including `at` and then continues with
    /// `len` different blocks of the given difficulty.
    pub fn fork(&self, at: BlockNumber, len: u64, seed: u64, difficulty: u64) -> Self {
        let keep = (at + 1) as usize;
        let blocks = self.blocks[..keep].to_vec();
        let mut fork = Self {
            index: blocks.iter().map(|b| (b.hash(), b.number)).collect(),
            blocks,
            receipts: self.receipts[..keep].to_vec(),
            states: self.states[..keep].to_vec(),
            total_difficulties: self.total_difficulties[..keep].to_vec(),
            nodes: self.nodes.clone(),
        };
        fork.extend(len, seed, difficulty);
        fork
    }

    fn push_block(&mut self, rng: &mut StdRng, seed: u64, difficulty: u64) {
        let parent = self.tip().header.clone();
        let mut state = self.states[parent.number as usize];

        // a third of the blocks are empty
        let tx_count = if rng.gen_ratio(1, 3) { 0 } else { rng.gen_range(1..=4) };
        let transactions = (0..tx_count)
            .map(|_| {
                let len = rng.gen_range(1..=32);
                Bytes::from((0..len).map(|_| rng.gen::<u8>()).collect::<Vec<_>>())
            })
            .collect::<Vec<_>>();
        let body = BlockBody { transactions, ommers: vec![] };

        let receipts = state.apply(B256::ZERO, &body.transactions).unwrap_or_default();
        let (state_root, nodes) = state.commit();
        self.nodes.extend(nodes);

        let header = Header {
            parent_hash: parent.hash(),
            ommers_hash: body.calculate_ommers_root(),
            beneficiary: Address::with_last_byte(seed as u8),
            state_root,
            transactions_root: body.calculate_tx_root(),
            receipts_root: receipts_root(&receipts),
            difficulty: U256::from(difficulty),
            number: parent.number + 1,
            gas_limit: parent.gas_limit,
            gas_used: receipts.last().map(|r| r.cumulative_gas_used).unwrap_or_default(),
            timestamp: parent.timestamp + 12,
            extra_data: Bytes::copy_from_slice(&seed.to_be_bytes()),
            mix_hash: B256::ZERO,
            nonce: rng.gen(),
        }
        .seal_slow();

        let td = self.total_difficulties[parent.number as usize] + header.difficulty;
        self.index.insert(header.hash(), header.number);
        self.blocks.push(SealedBlock::new(header, body));
        self.receipts.push(receipts);
        self.states.push(state);
        self.total_difficulties.push(td);
    }

    /// Returns a copy of the chain whose block `number` declares a bogus state root.
    ///
    /// Descendants are relinked to the altered block, so the chain stays well formed and only
    /// execution reveals the fault.
    pub fn with_invalid_state_root(&self, number: BlockNumber) -> Self {
        let mut chain = self.clone();
        let mut parent_hash = None;
        for block in chain.blocks.iter_mut().skip(number as usize) {
            let mut header = block.header.header().clone();
            match parent_hash {
                Some(parent) => header.parent_hash = parent,
                None => header.state_root = B256::repeat_byte(0xee),
            }
            let header = header.seal_slow();
            parent_hash = Some(header.hash());
            *block = SealedBlock::new(header, block.block_body());
        }
        chain.index = chain.blocks.iter().map(|block| (block.hash(), block.number)).collect();
        chain
    }

    /// The genesis block.
    pub fn genesis(&self) -> &SealedBlock {
        &self.blocks[0]
    }

    /// The highest block.
    pub fn tip(&self) -> &SealedBlock {
        // the genesis block is always present
        &self.blocks[self.blocks.len() - 1]
    }

    /// The highest block as a [`Head`].
    pub fn head(&self) -> Head {
        let tip = self.tip();
        Head {
            number: tip.number,
            hash: tip.hash(),
            total_difficulty: self.total_difficulties[tip.number as usize],
        }
    }

    /// Returns the block at the given height.
    pub fn block(&self, number: BlockNumber) -> Option<&SealedBlock> {
        self.blocks.get(number as usize)
    }

    /// Returns the block with the given hash.
    pub fn block_by_hash(&self, hash: &BlockHash) -> Option<&SealedBlock> {
        self.index.get(hash).and_then(|number| self.block(*number))
    }

    /// Returns the receipts of the block with the given hash.
    pub fn receipts_by_hash(&self, hash: &BlockHash) -> Option<&Vec<Receipt>> {
        self.index.get(hash).and_then(|number| self.receipts.get(*number as usize))
    }

    /// Returns the total difficulty at the given height.
    pub fn total_difficulty(&self, number: BlockNumber) -> Option<U256> {
        self.total_difficulties.get(number as usize).copied()
    }

    /// Returns a state trie node by hash.
    pub fn node(&self, hash: &B256) -> Option<&Bytes> {
        self.nodes.get(hash)
    }

    /// Returns the state trie nodes of the state after the given block.
    pub fn state_nodes(&self, number: BlockNumber) -> Vec<(B256, Bytes)> {
        self.states.get(number as usize).map(|state| state.commit().1).unwrap_or_default()
    }

    /// All the headers of the chain, genesis first.
    pub fn headers(&self) -> impl Iterator<Item = &SealedHeader> + '_ {
        self.blocks.iter().map(|block| &block.header)
    }

    /// Returns a store that holds this chain up to and including block `up_to`, fully executed.
    pub fn store(&self, up_to: BlockNumber) -> TestChainStore {
        let store = TestChainStore::new(self.genesis().clone(), self.state_nodes(0));
        for number in 1..=up_to.min(self.tip().number) {
            store.kv().extend(self.state_nodes(number));
            let block = self.blocks[number as usize].clone();
            let receipts = self.receipts[number as usize].clone();
            if let Err(err) = crate::provider::ChainStore::write_block(&store, block, receipts) {
                panic!("failed to populate test store at {number}: {err}")
            }
        }
        store
    }
}
