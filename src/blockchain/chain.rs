use chrono::{DateTime, Utc};
use log::info;
use thiserror::Error;

use super::block::Block;
use super::crypto::{Address, Bytes};
use super::params::ProtocolParams;
use super::storage::{BlockStore, StorageError};

/// Errors that can occur during blockchain operations
#[derive(Debug, Error)]
pub enum BlockchainError {
    #[error("Storage error: {0}")]
    StorageError(#[from] StorageError),

    #[error("Corrupt block data: {0}")]
    CorruptBlock(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Chain has no genesis block")]
    EmptyChain,

    #[error("Chain already holds {0} blocks")]
    AlreadyInitialized(u64),
}

/// Represents the blockchain: an append-only sequence of sealed blocks kept in
/// a [`BlockStore`].
///
/// Writes are not synchronised here; callers serialise `add_block`.
#[derive(Debug)]
pub struct Blockchain<S: BlockStore> {
    /// Backing store of serialized blocks
    store: S,

    /// Protocol constants every block is checked against
    params: ProtocolParams,
}

impl<S: BlockStore> Blockchain<S> {
    /// Creates a chain whose genesis block seeds the ledger-maintenance
    /// account and `receiver`
    pub fn create(
        store: S,
        params: ProtocolParams,
        receiver: &Address,
        timestamp: DateTime<Utc>,
    ) -> Result<Self, BlockchainError> {
        let size = store.size()?;
        if size != 0 {
            return Err(BlockchainError::AlreadyInitialized(size));
        }

        let chain = Blockchain { store, params };
        let genesis = Block::genesis(receiver, timestamp, &chain.params);
        chain.add_block(&genesis)?;

        info!("Created genesis block {} for {}", genesis.curr_hash, receiver);
        Ok(chain)
    }

    /// Loads a chain that already has a genesis block
    pub fn load(store: S, params: ProtocolParams) -> Result<Self, BlockchainError> {
        let size = store.size()?;
        if size == 0 {
            return Err(BlockchainError::EmptyChain);
        }

        info!("Loaded blockchain with {} blocks", size);
        Ok(Blockchain { store, params })
    }

    /// Loads the chain in `store`, creating genesis first if it is empty
    pub fn open(
        store: S,
        params: ProtocolParams,
        receiver: &Address,
    ) -> Result<Self, BlockchainError> {
        if store.size()? == 0 {
            Self::create(store, params, receiver, Utc::now())
        } else {
            Self::load(store, params)
        }
    }

    pub fn params(&self) -> &ProtocolParams {
        &self.params
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Number of blocks, genesis included
    pub fn size(&self) -> Result<u64, BlockchainError> {
        Ok(self.store.size()?)
    }

    /// Content hash of the most recent block
    pub fn last_hash(&self) -> Result<Bytes, BlockchainError> {
        let size = self.size()?;
        if size == 0 {
            return Err(BlockchainError::EmptyChain);
        }
        match self.block_at(size - 1)? {
            Some(block) => Ok(block.curr_hash),
            None => Err(BlockchainError::CorruptBlock(format!(
                "No block at last position {}",
                size - 1
            ))),
        }
    }

    /// Starts an empty block for `miner` on top of the current last block
    pub fn new_block(&self, miner: Address) -> Result<Block, BlockchainError> {
        Ok(Block::new(miner, self.last_hash()?, self.params.difficulty))
    }

    pub fn block_at(&self, position: u64) -> Result<Option<Block>, BlockchainError> {
        self.store
            .get_at(position)?
            .map(|data| Block::deserialize(&data))
            .transpose()
    }

    /// The block with content hash `hash`, with its position
    pub fn block_by_hash(&self, hash: &Bytes) -> Result<Option<(u64, Block)>, BlockchainError> {
        match self.store.get_by_hash(hash)? {
            Some((position, data)) => Ok(Some((position, Block::deserialize(&data)?))),
            None => Ok(None),
        }
    }

    /// Balance of `address` as of the last block.
    ///
    /// Scans backward to the most recent block whose snapshot mentions the
    /// address; zero if none does.
    pub fn balance(&self, address: &Address) -> Result<u64, BlockchainError> {
        for data in self.store.iter_rev() {
            let block = Block::deserialize(&data?)?;
            if let Some(balance) = block.mapping.get(address) {
                return Ok(*balance);
            }
        }
        Ok(0)
    }

    /// Whether any stored transaction already carries this random nonce
    pub fn contains_rand_bytes(&self, rand_bytes: &Bytes) -> Result<bool, BlockchainError> {
        for data in self.store.iter_rev() {
            let block = Block::deserialize(&data?)?;
            if block.transactions.iter().any(|tx| tx.rand_bytes == *rand_bytes) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Appends a sealed block and returns its position.
    ///
    /// Performs no validation: run [`Block::validate`] first.
    pub fn add_block(&self, block: &Block) -> Result<u64, BlockchainError> {
        let data = block.serialize()?;
        let position = self.store.append(&block.curr_hash, &data)?;
        info!(
            "Appended block {} at position {} with {} transactions",
            block.curr_hash,
            position,
            block.transactions.len()
        );
        Ok(position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::params::GENESIS_BLOCK;
    use crate::blockchain::storage::MemoryStore;
    use crate::blockchain::crypto::User;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_new_blockchain() {
        let mut rng = StdRng::seed_from_u64(21);
        let miner = User::new(&mut rng);
        let params = ProtocolParams::default();

        let chain = Blockchain::create(MemoryStore::new(), params.clone(), miner.address(), Utc::now())
            .unwrap();

        assert_eq!(chain.size().unwrap(), 1);
        let genesis = chain.block_at(0).unwrap().unwrap();
        assert_eq!(genesis.prev_hash, Bytes(GENESIS_BLOCK.as_bytes().to_vec()));
        assert_eq!(genesis.curr_hash, genesis.hash());
        assert_eq!(chain.last_hash().unwrap(), genesis.curr_hash);

        assert_eq!(chain.balance(&Address::storage_chain()).unwrap(), params.storage_value);
        assert_eq!(chain.balance(miner.address()).unwrap(), params.genesis_reward);
        assert_eq!(chain.balance(&Address("nobody".to_string())).unwrap(), 0);
    }

    #[test]
    fn test_create_refuses_existing_chain() {
        let mut rng = StdRng::seed_from_u64(22);
        let miner = User::new(&mut rng);
        let store = MemoryStore::new();
        store.append(&Bytes(vec![1]), "{}").unwrap();

        let result = Blockchain::create(store, ProtocolParams::default(), miner.address(), Utc::now());
        assert!(matches!(result, Err(BlockchainError::AlreadyInitialized(1))));
    }

    #[test]
    fn test_load_requires_genesis() {
        let result = Blockchain::load(MemoryStore::new(), ProtocolParams::default());
        assert!(matches!(result, Err(BlockchainError::EmptyChain)));
    }

    #[test]
    fn test_lookup_by_hash() {
        let mut rng = StdRng::seed_from_u64(23);
        let miner = User::new(&mut rng);
        let chain = Blockchain::create(
            MemoryStore::new(),
            ProtocolParams::default(),
            miner.address(),
            Utc::now(),
        )
        .unwrap();

        let last = chain.last_hash().unwrap();
        let (position, block) = chain.block_by_hash(&last).unwrap().unwrap();
        assert_eq!(position, 0);
        assert_eq!(block.curr_hash, last);
        assert!(chain.block_by_hash(&Bytes(vec![0; 32])).unwrap().is_none());
    }

    #[test]
    fn test_corrupt_block_is_reported() {
        let store = MemoryStore::new();
        store.append(&Bytes(vec![1]), "not json").unwrap();
        let chain = Blockchain::load(store, ProtocolParams::default()).unwrap();

        assert!(matches!(
            chain.balance(&Address::storage_chain()),
            Err(BlockchainError::CorruptBlock(_))
        ));
    }

    #[test]
    fn test_reopen_sled_chain() {
        let dir = tempfile::tempdir().unwrap();
        let mut rng = StdRng::seed_from_u64(24);
        let miner = User::new(&mut rng);
        let params = ProtocolParams::default();

        let first_hash = {
            let store = crate::blockchain::storage::SledStore::open(dir.path()).unwrap();
            let chain = Blockchain::open(store, params.clone(), miner.address()).unwrap();
            chain.last_hash().unwrap()
        };

        let store = crate::blockchain::storage::SledStore::open(dir.path()).unwrap();
        let chain = Blockchain::open(store, params, miner.address()).unwrap();
        assert_eq!(chain.size().unwrap(), 1);
        assert_eq!(chain.last_hash().unwrap(), first_hash);
    }
}
