//! Validation pipeline for candidate blocks.
//!
//! Every check reads the chain the block claims to extend and never writes
//! to it.

use chrono::{DateTime, Utc};
use log::debug;
use thiserror::Error;

use std::collections::HashSet;

use super::block::Block;
use super::chain::{Blockchain, BlockchainError};
use super::crypto::{verify_signature, Address};
use super::pow;
use super::storage::BlockStore;
use super::transaction::{TransactionError, TransactionKind};

/// Broad category of a rejection, telling the caller what to do next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Malformed input; do not resubmit unchanged
    MalformedInput,
    /// Insufficient balance or wrong fee
    Economic,
    /// Bad hash, signature or proof of work: tampering or corruption
    Cryptographic,
    /// Stale or forked view of the chain; re-sync before retrying
    Linkage,
    /// The block store failed
    Io,
}

/// Reasons a block fails validation
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Difficulty {got} differs from protocol difficulty {expected}")]
    DifficultyMismatch { expected: u8, got: u8 },

    #[error("Stored hash does not match block content")]
    HashMismatch,

    #[error("Previous hash does not reference a stored block")]
    UnknownParent,

    #[error("Parent is at position {got}, expected {expected}")]
    WrongPosition { expected: u64, got: u64 },

    #[error("Block is not signed")]
    MissingSignature,

    #[error("Miner signature does not verify")]
    InvalidSignature,

    #[error("Proof of work does not meet the target")]
    InvalidProof,

    #[error("Snapshot entry for {0} is not touched by any transaction")]
    UnexpectedMappingEntry(Address),

    #[error("Block has no timestamp")]
    MissingTimestamp,

    #[error("Timestamp {0} is in the future")]
    TimestampInFuture(DateTime<Utc>),

    #[error("Timestamp {block} is not after parent timestamp {parent}")]
    TimestampNotAfterParent {
        block: DateTime<Utc>,
        parent: DateTime<Utc>,
    },

    #[error("Block has no transactions")]
    EmptyBlock,

    #[error("Block holds {count} transactions, limit is {limit}")]
    TooManyTransactions { count: usize, limit: usize },

    #[error("Random nonce {0} appears twice in the block")]
    DuplicateNonce(String),

    #[error("Block holds {0} storage rewards")]
    MultipleRewards(usize),

    #[error("Transaction {0} is not a valid storage reward")]
    InvalidReward(usize),

    #[error("Transaction {0} carries the wrong fee")]
    InvalidFee(usize),

    #[error("Transaction {index}: {source}")]
    Transaction {
        index: usize,
        #[source]
        source: TransactionError,
    },

    #[error("Transaction {0} replays a random nonce already in the chain")]
    Replayed(usize),

    #[error("Transaction {index} has a {got}-byte random nonce, expected {expected}")]
    NonceLength {
        index: usize,
        expected: usize,
        got: usize,
    },

    #[error("Balance of {address} should be {expected}, snapshot holds {stored:?}")]
    BalanceMismatch {
        address: Address,
        expected: i128,
        stored: Option<u64>,
    },

    #[error("Blockchain error: {0}")]
    Chain(#[from] BlockchainError),
}

impl ValidationError {
    pub fn class(&self) -> ErrorClass {
        use ValidationError::*;
        match self {
            EmptyBlock
            | TooManyTransactions { .. }
            | DuplicateNonce(_)
            | MultipleRewards(_)
            | Replayed(_)
            | NonceLength { .. }
            | UnexpectedMappingEntry(_)
            | DifficultyMismatch { .. } => ErrorClass::MalformedInput,
            InvalidReward(_) | InvalidFee(_) | BalanceMismatch { .. } => ErrorClass::Economic,
            HashMismatch
            | MissingSignature
            | InvalidSignature
            | InvalidProof
            | Transaction { .. } => ErrorClass::Cryptographic,
            UnknownParent
            | WrongPosition { .. }
            | MissingTimestamp
            | TimestampInFuture(_)
            | TimestampNotAfterParent { .. } => ErrorClass::Linkage,
            Chain(_) => ErrorClass::Io,
        }
    }
}

impl Block {
    /// Runs every check against the chain this block extends, stopping at
    /// the first failure
    pub fn validate<S: BlockStore>(&self, chain: &Blockchain<S>) -> Result<(), ValidationError> {
        let expected = chain.params().difficulty;
        if self.difficulty != expected {
            return Err(ValidationError::DifficultyMismatch {
                expected,
                got: self.difficulty,
            });
        }
        self.hash_is_valid(chain)?;
        self.sign_is_valid()?;
        self.proof_is_valid()?;
        self.mapping_is_valid()?;
        self.time_is_valid(chain, Utc::now())?;
        self.transactions_are_valid(chain)?;
        Ok(())
    }

    pub fn is_valid<S: BlockStore>(&self, chain: &Blockchain<S>) -> bool {
        match self.validate(chain) {
            Ok(()) => true,
            Err(err) => {
                debug!("Block {} rejected: {}", self.curr_hash, err);
                false
            }
        }
    }

    /// Content hash matches and the parent is the chain's last block
    pub fn hash_is_valid<S: BlockStore>(&self, chain: &Blockchain<S>) -> Result<(), ValidationError> {
        if self.hash() != self.curr_hash {
            return Err(ValidationError::HashMismatch);
        }

        let size = chain.size()?;
        let Some((position, _)) = chain.block_by_hash(&self.prev_hash)? else {
            return Err(ValidationError::UnknownParent);
        };
        if position + 1 != size {
            return Err(ValidationError::WrongPosition {
                expected: size.saturating_sub(1),
                got: position,
            });
        }
        Ok(())
    }

    pub fn sign_is_valid(&self) -> Result<(), ValidationError> {
        let signature = self
            .signature
            .as_ref()
            .ok_or(ValidationError::MissingSignature)?;
        let public_key = self
            .miner
            .to_public_key()
            .map_err(|_| ValidationError::InvalidSignature)?;

        match verify_signature(self.curr_hash.as_slice(), signature, &public_key) {
            Ok(true) => Ok(()),
            _ => Err(ValidationError::InvalidSignature),
        }
    }

    pub fn proof_is_valid(&self) -> Result<(), ValidationError> {
        if pow::proof_is_valid(self.curr_hash.as_slice(), self.nonce, self.difficulty) {
            Ok(())
        } else {
            Err(ValidationError::InvalidProof)
        }
    }

    /// Every snapshot entry, bar the ledger-maintenance account, belongs to a
    /// sender or receiver of this block
    pub fn mapping_is_valid(&self) -> Result<(), ValidationError> {
        for address in self.mapping.keys() {
            if address.is_storage_chain() {
                continue;
            }
            let touched = self
                .transactions
                .iter()
                .any(|tx| tx.sender == *address || tx.receiver == *address);
            if !touched {
                return Err(ValidationError::UnexpectedMappingEntry(address.clone()));
            }
        }
        Ok(())
    }

    /// Timestamp is not after `now` and strictly after the parent's
    pub fn time_is_valid<S: BlockStore>(
        &self,
        chain: &Blockchain<S>,
        now: DateTime<Utc>,
    ) -> Result<(), ValidationError> {
        let timestamp = self.timestamp.ok_or(ValidationError::MissingTimestamp)?;
        if timestamp > now {
            return Err(ValidationError::TimestampInFuture(timestamp));
        }

        let Some((_, parent)) = chain.block_by_hash(&self.prev_hash)? else {
            return Err(ValidationError::UnknownParent);
        };
        let parent_timestamp = parent.timestamp.ok_or(ValidationError::MissingTimestamp)?;
        if timestamp <= parent_timestamp {
            return Err(ValidationError::TimestampNotAfterParent {
                block: timestamp,
                parent: parent_timestamp,
            });
        }
        Ok(())
    }

    /// Transaction-list rules: size, uniqueness, reward shape, transfer
    /// self-validity, replay, and balance reconciliation against the chain
    pub fn transactions_are_valid<S: BlockStore>(
        &self,
        chain: &Blockchain<S>,
    ) -> Result<(), ValidationError> {
        let params = chain.params();

        let rewards = self
            .transactions
            .iter()
            .filter(|tx| tx.kind() == TransactionKind::StorageReward)
            .count();
        let storage_count = usize::from(rewards > 0);

        if self.transactions.is_empty() {
            return Err(ValidationError::EmptyBlock);
        }
        let limit = params.txs_limit + storage_count;
        if self.transactions.len() > limit {
            return Err(ValidationError::TooManyTransactions {
                count: self.transactions.len(),
                limit,
            });
        }

        let mut seen = HashSet::new();
        for tx in &self.transactions {
            if !seen.insert(&tx.rand_bytes) {
                return Err(ValidationError::DuplicateNonce(tx.rand_bytes.to_base64()));
            }
        }
        if rewards > 1 {
            return Err(ValidationError::MultipleRewards(rewards));
        }

        for (index, tx) in self.transactions.iter().enumerate() {
            match tx.kind() {
                TransactionKind::StorageReward => {
                    if tx.receiver != self.miner
                        || tx.value != params.storage_reward
                        || tx.to_storage != 0
                    {
                        return Err(ValidationError::InvalidReward(index));
                    }
                }
                TransactionKind::Transfer => {
                    if tx.rand_bytes.len() != params.rand_bytes {
                        return Err(ValidationError::NonceLength {
                            index,
                            expected: params.rand_bytes,
                            got: tx.rand_bytes.len(),
                        });
                    }
                    tx.verify()
                        .map_err(|source| ValidationError::Transaction { index, source })?;
                    if !tx.fee_is_valid(params) {
                        return Err(ValidationError::InvalidFee(index));
                    }
                    if chain.contains_rand_bytes(&tx.rand_bytes)? {
                        return Err(ValidationError::Replayed(index));
                    }
                }
            }
            self.balance_is_valid(chain, &tx.sender)?;
            self.balance_is_valid(chain, &tx.receiver)?;
        }

        let storage = Address::storage_chain();
        if self.mapping.contains_key(&storage) {
            self.balance_is_valid(chain, &storage)?;
        }
        Ok(())
    }

    /// The snapshot entry for `address` equals its chain balance adjusted by
    /// every transaction of this block. The ledger-maintenance account is
    /// also credited each transaction's fee.
    pub fn balance_is_valid<S: BlockStore>(
        &self,
        chain: &Blockchain<S>,
        address: &Address,
    ) -> Result<(), ValidationError> {
        let stored = self.mapping.get(address).copied();

        let mut expected = i128::from(chain.balance(address)?);
        let collects_fees = address.is_storage_chain();
        for tx in &self.transactions {
            if tx.sender == *address {
                expected -= i128::from(tx.value) + i128::from(tx.to_storage);
            }
            if tx.receiver == *address {
                expected += i128::from(tx.value);
            }
            if collects_fees {
                expected += i128::from(tx.to_storage);
            }
        }

        match stored {
            Some(balance) if i128::from(balance) == expected => Ok(()),
            _ => Err(ValidationError::BalanceMismatch {
                address: address.clone(),
                expected,
                stored,
            }),
        }
    }
}
