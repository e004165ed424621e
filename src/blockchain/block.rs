use chrono::{DateTime, SecondsFormat, Utc};
use log::debug;
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

use std::collections::BTreeMap;

use super::chain::{Blockchain, BlockchainError};
use super::crypto::{hash_sum, Address, Bytes, CryptoError, DigitalSignature, User};
use super::params::{ProtocolParams, GENESIS_BLOCK};
use super::pow::{self, CancelToken, Mined};
use super::storage::BlockStore;
use super::transaction::{Transaction, TransactionError, TransactionKind};
use super::validation::ValidationError;

/// Errors that can occur while filling or sealing a block
#[derive(Debug, Error)]
pub enum BlockError {
    #[error("Transaction value must be nonzero")]
    ZeroValue,

    #[error("Block already holds {0} transactions")]
    BlockFull(usize),

    #[error("Block already holds a storage reward")]
    DuplicateReward,

    #[error("Random nonce is {got} bytes, expected {expected}")]
    NonceLength { expected: usize, got: usize },

    #[error("Fee {fee} does not match policy for value {value} (expected {expected})")]
    InvalidFee { value: u64, fee: u64, expected: u64 },

    #[error("Insufficient funds: required {required}, available {available}")]
    InsufficientFunds { required: u64, available: u64 },

    #[error("Balance overflow for {0}")]
    BalanceOverflow(Address),

    #[error("Sealing user {user} is not the block miner {miner}")]
    MinerMismatch { user: Address, miner: Address },

    #[error("Mining cancelled at nonce {0}")]
    MiningCancelled(u64),

    #[error("Nonce space exhausted at {0}")]
    MiningExhausted(u64),

    #[error("Invalid transactions: {0}")]
    Invalid(#[from] ValidationError),

    #[error("Transaction error: {0}")]
    TransactionError(#[from] TransactionError),

    #[error("Crypto error: {0}")]
    CryptoError(#[from] CryptoError),

    #[error("Blockchain error: {0}")]
    BlockchainError(#[from] BlockchainError),
}

/// Represents a block in the blockchain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Block {
    /// Content hash, set when the block is sealed
    #[schema(value_type = String, example = "base64")]
    pub curr_hash: Bytes,

    /// Content hash of the previous block
    #[schema(value_type = String, example = "base64")]
    pub prev_hash: Bytes,

    /// Proof-of-work nonce
    pub nonce: u64,

    /// Leading zero bits required by the proof of work
    pub difficulty: u8,

    /// Address credited with the storage reward
    pub miner: Address,

    /// Miner's signature over `curr_hash`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<DigitalSignature>,

    /// Sealing time
    #[schema(value_type = String, example = "2023-01-01T12:00:00.000000000Z")]
    pub timestamp: Option<DateTime<Utc>>,

    /// Transactions in insertion order
    pub transactions: Vec<Transaction>,

    /// Post-block balance of every address the block touches
    #[schema(value_type = Object)]
    pub mapping: BTreeMap<Address, u64>,
}

impl Block {
    /// Creates an empty, unsealed block
    pub fn new(miner: Address, prev_hash: Bytes, difficulty: u8) -> Self {
        Block {
            curr_hash: Bytes::default(),
            prev_hash,
            nonce: 0,
            difficulty,
            miner,
            signature: None,
            timestamp: None,
            transactions: Vec::new(),
            mapping: BTreeMap::new(),
        }
    }

    /// The first block of a chain. It carries no transactions; its snapshot
    /// seeds the ledger-maintenance account and `receiver`.
    pub fn genesis(receiver: &Address, timestamp: DateTime<Utc>, params: &ProtocolParams) -> Self {
        let mut block = Block::new(
            receiver.clone(),
            Bytes(GENESIS_BLOCK.as_bytes().to_vec()),
            params.difficulty,
        );
        block.mapping.insert(Address::storage_chain(), params.storage_value);
        block.mapping.insert(receiver.clone(), params.genesis_reward);
        block.timestamp = Some(timestamp);
        block.curr_hash = block.hash();
        block
    }

    /// Bytes of the timestamp that enter the content hash
    fn timestamp_bytes(&self) -> Vec<u8> {
        self.timestamp
            .map(|ts| ts.to_rfc3339_opts(SecondsFormat::Nanos, true).into_bytes())
            .unwrap_or_default()
    }

    /// Computes the content hash.
    ///
    /// Folds over the transaction hashes in list order, then over the snapshot
    /// in address order, then binds difficulty, parent, miner and timestamp.
    pub fn hash(&self) -> Bytes {
        let mut running: Vec<u8> = Vec::new();

        for tx in &self.transactions {
            running = hash_sum(&[running.as_slice(), tx.curr_hash.as_slice()]);
        }

        // BTreeMap iterates in address order
        for (address, balance) in &self.mapping {
            running = hash_sum(&[
                running.as_slice(),
                address.as_bytes(),
                &balance.to_be_bytes()[..],
            ]);
        }

        Bytes(hash_sum(&[
            running.as_slice(),
            &u64::from(self.difficulty).to_be_bytes()[..],
            self.prev_hash.as_slice(),
            self.miner.as_bytes(),
            self.timestamp_bytes().as_slice(),
        ]))
    }

    pub fn has_storage_reward(&self) -> bool {
        self.transactions
            .iter()
            .any(|tx| tx.kind() == TransactionKind::StorageReward)
    }

    /// Balance of `address` as this block currently sees it: the block's own
    /// snapshot entry if present, else the chain's balance.
    pub fn balance_of<S: BlockStore>(
        &self,
        chain: &Blockchain<S>,
        address: &Address,
    ) -> Result<u64, BlockchainError> {
        match self.mapping.get(address) {
            Some(balance) => Ok(*balance),
            None => chain.balance(address),
        }
    }

    /// Adds a transaction and applies it to the block's snapshot.
    ///
    /// Nothing is modified when the transaction is rejected.
    pub fn add_transaction<S: BlockStore>(
        &mut self,
        chain: &Blockchain<S>,
        tx: Transaction,
    ) -> Result<(), BlockError> {
        let params = chain.params();

        if tx.value == 0 {
            return Err(BlockError::ZeroValue);
        }
        // Rewards are fee-free whatever their value
        let expected_fee = match tx.kind() {
            TransactionKind::Transfer => {
                if self.transactions.len() >= params.txs_limit {
                    return Err(BlockError::BlockFull(self.transactions.len()));
                }
                if tx.rand_bytes.len() != params.rand_bytes {
                    return Err(BlockError::NonceLength {
                        expected: params.rand_bytes,
                        got: tx.rand_bytes.len(),
                    });
                }
                params.fee_for(tx.value)
            }
            TransactionKind::StorageReward => {
                if self.has_storage_reward() {
                    return Err(BlockError::DuplicateReward);
                }
                0
            }
        };
        if tx.to_storage != expected_fee {
            return Err(BlockError::InvalidFee {
                value: tx.value,
                fee: tx.to_storage,
                expected: expected_fee,
            });
        }

        let debit = tx
            .debit()
            .ok_or_else(|| BlockError::BalanceOverflow(tx.sender.clone()))?;
        let available = self.balance_of(chain, &tx.sender)?;
        if debit > available {
            return Err(BlockError::InsufficientFunds {
                required: debit,
                available,
            });
        }

        // Stage every update first so a failure leaves the snapshot untouched
        let mut staged: BTreeMap<Address, u64> = BTreeMap::new();
        staged.insert(tx.sender.clone(), available - debit);
        self.stage_credit(chain, &mut staged, &tx.receiver, tx.value)?;
        self.stage_credit(chain, &mut staged, &Address::storage_chain(), tx.to_storage)?;

        debug!(
            "Added transaction {} ({} -> {}, value {}, fee {})",
            tx.curr_hash, tx.sender, tx.receiver, tx.value, tx.to_storage
        );
        self.mapping.extend(staged);
        self.transactions.push(tx);
        Ok(())
    }

    fn stage_credit<S: BlockStore>(
        &self,
        chain: &Blockchain<S>,
        staged: &mut BTreeMap<Address, u64>,
        address: &Address,
        amount: u64,
    ) -> Result<(), BlockError> {
        let current = match staged.get(address) {
            Some(balance) => *balance,
            None => self.balance_of(chain, address)?,
        };
        let credited = current
            .checked_add(amount)
            .ok_or_else(|| BlockError::BalanceOverflow(address.clone()))?;
        staged.insert(address.clone(), credited);
        Ok(())
    }

    /// Seals the block at the current time. See [`Block::accept_at`].
    pub fn accept<S: BlockStore, R: RngCore + CryptoRng>(
        &mut self,
        chain: &Blockchain<S>,
        user: &User,
        rng: &mut R,
        cancel: &CancelToken,
    ) -> Result<(), BlockError> {
        self.accept_at(chain, user, Utc::now(), rng, cancel)
    }

    /// Seals the block: re-validates its transactions against the chain, adds
    /// the miner's storage reward, stamps `timestamp`, hashes, signs and mines.
    ///
    /// On cancellation the nonce reached so far is kept and
    /// [`BlockError::MiningCancelled`] is returned; such a block must not be
    /// appended.
    pub fn accept_at<S: BlockStore, R: RngCore + CryptoRng>(
        &mut self,
        chain: &Blockchain<S>,
        user: &User,
        timestamp: DateTime<Utc>,
        rng: &mut R,
        cancel: &CancelToken,
    ) -> Result<(), BlockError> {
        if user.address() != &self.miner {
            return Err(BlockError::MinerMismatch {
                user: user.address().clone(),
                miner: self.miner.clone(),
            });
        }
        self.transactions_are_valid(chain)?;

        let reward = Transaction::storage_reward(self.miner.clone(), chain.params(), rng)?;
        self.add_transaction(chain, reward)?;

        self.timestamp = Some(timestamp);
        self.curr_hash = self.hash();
        self.signature = Some(user.sign(self.curr_hash.as_slice())?);

        let seed = u64::from(rng.next_u32());
        debug!("Mining block {} from seed {}", self.curr_hash, seed);
        match pow::proof_of_work(self.curr_hash.as_slice(), self.difficulty, seed, cancel) {
            Mined::Found(nonce) => {
                self.nonce = nonce;
                Ok(())
            }
            Mined::Cancelled(nonce) => {
                self.nonce = nonce;
                Err(BlockError::MiningCancelled(nonce))
            }
            Mined::Exhausted(nonce) => {
                self.nonce = nonce;
                Err(BlockError::MiningExhausted(nonce))
            }
        }
    }

    /// Pretty JSON, the form blocks are stored and exchanged in
    pub fn serialize(&self) -> Result<String, BlockchainError> {
        serde_json::to_string_pretty(self)
            .map_err(|e| BlockchainError::SerializationError(e.to_string()))
    }

    pub fn deserialize(data: &str) -> Result<Self, BlockchainError> {
        serde_json::from_str(data).map_err(|e| BlockchainError::CorruptBlock(e.to_string()))
    }
}
