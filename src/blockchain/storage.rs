use std::path::Path;
use std::sync::RwLock;

use log::debug;
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::{Db, IVec, Transactional, Tree};
use thiserror::Error;

use super::crypto::Bytes;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    #[error("Block with hash {0} already stored")]
    DuplicateHash(String),

    #[error("Item not found: {0}")]
    NotFound(String),

    #[error("Storage lock poisoned")]
    LockPoisoned,
}

/// Serialized blocks yielded newest first
pub type BlockIter<'a> = Box<dyn Iterator<Item = Result<String, StorageError>> + 'a>;

/// Ordered, append-only store of serialized blocks.
///
/// Positions start at 0 and grow by one per append. Every block is reachable
/// both by position and by its content hash. Implementations must make every
/// completed append visible to later reads.
pub trait BlockStore: Send + Sync {
    /// Appends a block and returns its position
    fn append(&self, hash: &Bytes, block: &str) -> Result<u64, StorageError>;

    /// Number of stored blocks
    fn size(&self) -> Result<u64, StorageError>;

    /// Position and serialized block with the given content hash
    fn get_by_hash(&self, hash: &Bytes) -> Result<Option<(u64, String)>, StorageError>;

    fn get_at(&self, position: u64) -> Result<Option<String>, StorageError>;

    /// Serialized blocks from the most recent backward
    fn iter_rev(&self) -> BlockIter<'_>;
}

/// Durable block store on top of sled
pub struct SledStore {
    /// The database instance
    db: Db,

    /// Big-endian position -> serialized block
    blocks: Tree,

    /// Base64 content hash -> position
    hashes: Tree,
}

impl std::fmt::Debug for SledStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SledStore").finish()
    }
}

impl SledStore {
    /// Opens (or creates) the store at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let db = sled::open(path)?;

        let blocks = db.open_tree("blocks")?;
        let hashes = db.open_tree("hashes")?;

        Ok(Self { db, blocks, hashes })
    }

    /// Flushes all pending writes to disk
    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}

fn decode_position(key: &[u8]) -> Result<u64, StorageError> {
    let bytes: [u8; 8] = key
        .try_into()
        .map_err(|_| StorageError::DeserializationError(format!("Bad position key of {} bytes", key.len())))?;
    Ok(u64::from_be_bytes(bytes))
}

fn decode_block(value: IVec) -> Result<String, StorageError> {
    String::from_utf8(value.to_vec()).map_err(|e| StorageError::DeserializationError(e.to_string()))
}

impl BlockStore for SledStore {
    fn append(&self, hash: &Bytes, block: &str) -> Result<u64, StorageError> {
        let key = hash.to_base64();
        let position = self.size()?;
        let position_bytes = bincode::serialize(&position)
            .map_err(|e| StorageError::SerializationError(e.to_string()))?;

        let result = (&self.blocks, &self.hashes).transaction(|(blocks, hashes)| {
            if hashes.get(key.as_bytes())?.is_some() {
                return Err(ConflictableTransactionError::Abort(StorageError::DuplicateHash(
                    key.clone(),
                )));
            }
            blocks.insert(&position.to_be_bytes()[..], block.as_bytes())?;
            hashes.insert(key.as_bytes(), position_bytes.clone())?;
            Ok(())
        });

        match result {
            Ok(()) => {}
            Err(TransactionError::Abort(err)) => return Err(err),
            Err(TransactionError::Storage(err)) => return Err(StorageError::DatabaseError(err)),
        }

        self.flush()?;
        debug!("Stored block {} at position {}", key, position);
        Ok(position)
    }

    fn size(&self) -> Result<u64, StorageError> {
        match self.blocks.last()? {
            Some((key, _)) => Ok(decode_position(&key)? + 1),
            None => Ok(0),
        }
    }

    fn get_by_hash(&self, hash: &Bytes) -> Result<Option<(u64, String)>, StorageError> {
        let Some(value) = self.hashes.get(hash.to_base64().as_bytes())? else {
            return Ok(None);
        };
        let position: u64 = bincode::deserialize(&value)
            .map_err(|e| StorageError::DeserializationError(e.to_string()))?;

        match self.get_at(position)? {
            Some(block) => Ok(Some((position, block))),
            None => Err(StorageError::NotFound(format!(
                "Block at position {} indexed by hash {}",
                position, hash
            ))),
        }
    }

    fn get_at(&self, position: u64) -> Result<Option<String>, StorageError> {
        match self.blocks.get(position.to_be_bytes())? {
            Some(value) => Ok(Some(decode_block(value)?)),
            None => Ok(None),
        }
    }

    fn iter_rev(&self) -> BlockIter<'_> {
        Box::new(self.blocks.iter().rev().map(|entry| {
            let (_, value) = entry?;
            decode_block(value)
        }))
    }
}

/// Volatile block store, used for tests and throwaway nodes
#[derive(Debug, Default)]
pub struct MemoryStore {
    blocks: RwLock<Vec<(Bytes, String)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlockStore for MemoryStore {
    fn append(&self, hash: &Bytes, block: &str) -> Result<u64, StorageError> {
        let mut blocks = self.blocks.write().map_err(|_| StorageError::LockPoisoned)?;
        if blocks.iter().any(|(stored, _)| stored == hash) {
            return Err(StorageError::DuplicateHash(hash.to_base64()));
        }
        blocks.push((hash.clone(), block.to_string()));
        Ok(blocks.len() as u64 - 1)
    }

    fn size(&self) -> Result<u64, StorageError> {
        let blocks = self.blocks.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(blocks.len() as u64)
    }

    fn get_by_hash(&self, hash: &Bytes) -> Result<Option<(u64, String)>, StorageError> {
        let blocks = self.blocks.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(blocks
            .iter()
            .position(|(stored, _)| stored == hash)
            .map(|position| (position as u64, blocks[position].1.clone())))
    }

    fn get_at(&self, position: u64) -> Result<Option<String>, StorageError> {
        let blocks = self.blocks.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(usize::try_from(position)
            .ok()
            .and_then(|index| blocks.get(index))
            .map(|(_, block)| block.clone()))
    }

    fn iter_rev(&self) -> BlockIter<'_> {
        match self.blocks.read() {
            Ok(blocks) => {
                let snapshot: Vec<String> = blocks.iter().rev().map(|(_, block)| block.clone()).collect();
                Box::new(snapshot.into_iter().map(Ok))
            }
            Err(_) => Box::new(std::iter::once(Err(StorageError::LockPoisoned))),
        }
    }
}
