use crate::provider::{ChainStore, KeyValueStore, ProviderError, ProviderResult};
use fbc_primitives::{
    BlockBody, BlockHash, BlockNumber, Bytes, Head, Receipt, SealedBlock, SealedHeader, B256, U256,
};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};

/// An in-memory key-value store.
#[derive(Debug, Default)]
pub struct MemoryKv {
    map: RwLock<HashMap<B256, Bytes>>,
}

impl MemoryKv {
    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    /// Returns true if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }

    /// Stores all the given entries.
    pub fn extend(&self, entries: impl IntoIterator<Item = (B256, Bytes)>) {
        self.map.write().extend(entries)
    }
}

impl KeyValueStore for MemoryKv {
    fn has(&self, key: &B256) -> ProviderResult<bool> {
        Ok(self.map.read().contains_key(key))
    }

    fn get(&self, key: &B256) -> ProviderResult<Option<Bytes>> {
        Ok(self.map.read().get(key).cloned())
    }

    fn put(&self, key: B256, value: Bytes) -> ProviderResult<()> {
        self.map.write().insert(key, value);
        Ok(())
    }

    fn delete(&self, key: &B256) -> ProviderResult<()> {
        self.map.write().remove(key);
        Ok(())
    }
}

#[derive(Debug, Default)]
struct ChainData {
    headers: HashMap<BlockHash, SealedHeader>,
    bodies: HashMap<BlockHash, BlockBody>,
    receipts: HashMap<BlockHash, Vec<Receipt>>,
    td: HashMap<BlockHash, U256>,
    canonical: BTreeMap<BlockNumber, BlockHash>,
    head: Head,
}

impl ChainData {
    fn insert(&mut self, block: SealedBlock, receipts: Vec<Receipt>) -> ProviderResult<U256> {
        let parent_td = self.td.get(&block.parent_hash).copied().ok_or(
            ProviderError::UnknownParent { number: block.number, parent_hash: block.parent_hash },
        )?;
        let td = parent_td + block.difficulty;
        let hash = block.hash();
        let body = block.block_body();
        self.td.insert(hash, td);
        self.bodies.insert(hash, body);
        self.receipts.insert(hash, receipts);
        self.headers.insert(hash, block.header);
        Ok(td)
    }

    fn set_head(&mut self, hash: BlockHash) -> ProviderResult<()> {
        let header = self.headers.get(&hash).cloned().ok_or(ProviderError::UnknownBlock { hash })?;
        let td = self.td.get(&hash).copied().ok_or(ProviderError::UnknownBlock { hash })?;

        // drop canonical entries of the old chain above the new head
        self.canonical.retain(|number, _| *number <= header.number);

        let mut cursor = header.clone();
        loop {
            if self.canonical.get(&cursor.number) == Some(&cursor.hash()) {
                break
            }
            self.canonical.insert(cursor.number, cursor.hash());
            if cursor.number == 0 {
                break
            }
            match self.headers.get(&cursor.parent_hash) {
                Some(parent) => cursor = parent.clone(),
                None => break,
            }
        }

        self.head = Head { number: header.number, hash, total_difficulty: td };
        Ok(())
    }
}

/// An in-memory [`ChainStore`].
#[derive(Debug)]
pub struct TestChainStore {
    kv: MemoryKv,
    chain: RwLock<ChainData>,
}

impl TestChainStore {
    /// Creates a store holding only the genesis block and its state.
    pub fn new(genesis: SealedBlock, state: impl IntoIterator<Item = (B256, Bytes)>) -> Self {
        let kv = MemoryKv::default();
        kv.extend(state);

        let hash = genesis.hash();
        let mut chain = ChainData::default();
        chain.td.insert(hash, genesis.difficulty);
        chain.canonical.insert(0, hash);
        chain.head = Head { number: 0, hash, total_difficulty: genesis.difficulty };
        chain.bodies.insert(hash, genesis.block_body());
        chain.headers.insert(hash, genesis.header);

        Self { kv, chain: RwLock::new(chain) }
    }

    /// The underlying key-value store.
    pub fn kv(&self) -> &MemoryKv {
        &self.kv
    }

    /// Returns the stored block with the given hash.
    pub fn block(&self, hash: &BlockHash) -> Option<SealedBlock> {
        let chain = self.chain.read();
        let header = chain.headers.get(hash)?.clone();
        let body = chain.bodies.get(hash)?.clone();
        Some(SealedBlock::new(header, body))
    }

    /// Returns the stored receipts of the block with the given hash.
    pub fn receipts(&self, hash: &BlockHash) -> Option<Vec<Receipt>> {
        self.chain.read().receipts.get(hash).cloned()
    }

    /// Returns the canonical chain as `(number, hash)` pairs.
    pub fn canonical_chain(&self) -> Vec<(BlockNumber, BlockHash)> {
        self.chain.read().canonical.iter().map(|(n, h)| (*n, *h)).collect()
    }
}

impl KeyValueStore for TestChainStore {
    fn has(&self, key: &B256) -> ProviderResult<bool> {
        self.kv.has(key)
    }

    fn get(&self, key: &B256) -> ProviderResult<Option<Bytes>> {
        self.kv.get(key)
    }

    fn put(&self, key: B256, value: Bytes) -> ProviderResult<()> {
        self.kv.put(key, value)
    }

    fn delete(&self, key: &B256) -> ProviderResult<()> {
        self.kv.delete(key)
    }
}

impl ChainStore for TestChainStore {
    fn head(&self) -> ProviderResult<Head> {
        Ok(self.chain.read().head)
    }

    fn header(&self, hash: &BlockHash) -> ProviderResult<Option<SealedHeader>> {
        Ok(self.chain.read().headers.get(hash).cloned())
    }

    fn canonical_hash(&self, number: BlockNumber) -> ProviderResult<Option<BlockHash>> {
        Ok(self.chain.read().canonical.get(&number).copied())
    }

    fn total_difficulty(&self, hash: &BlockHash) -> ProviderResult<Option<U256>> {
        Ok(self.chain.read().td.get(hash).copied())
    }

    fn has_block(&self, hash: &BlockHash) -> ProviderResult<bool> {
        Ok(self.chain.read().bodies.contains_key(hash))
    }

    fn write_block(&self, block: SealedBlock, receipts: Vec<Receipt>) -> ProviderResult<()> {
        if !self.kv.has(&block.state_root)? {
            return Err(ProviderError::MissingState { root: block.state_root })
        }
        let hash = block.hash();
        let mut chain = self.chain.write();
        let td = chain.insert(block, receipts)?;
        if td > chain.head.total_difficulty {
            chain.set_head(hash)?;
        }
        Ok(())
    }

    fn write_fast_block(&self, block: SealedBlock, receipts: Vec<Receipt>) -> ProviderResult<()> {
        self.chain.write().insert(block, receipts).map(|_| ())
    }

    fn commit_head(&self, hash: BlockHash) -> ProviderResult<()> {
        let mut chain = self.chain.write();
        let root = chain
            .headers
            .get(&hash)
            .map(|header| header.state_root)
            .ok_or(ProviderError::UnknownBlock { hash })?;
        if !self.kv.has(&root)? {
            return Err(ProviderError::MissingState { root })
        }
        chain.set_head(hash)
    }
}
