use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

use super::crypto::{hash_sum, random_bytes, verify_signature, Address, Bytes, CryptoError, DigitalSignature, User};
use super::params::ProtocolParams;

/// Errors that can occur during transaction operations
#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("Invalid hash")]
    InvalidHash,

    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Crypto error: {0}")]
    CryptoError(#[from] CryptoError),
}

/// What a transaction is, decided solely by its sender
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionKind {
    /// A user-submitted, signed value transfer
    Transfer,

    /// The per-block reward minted by the ledger-maintenance account. Exempt
    /// from hash and signature checks.
    StorageReward,
}

/// Represents a transaction in the blockchain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Transaction {
    /// Random nonce, used only for duplicate and replay detection
    #[schema(value_type = String, example = "base64")]
    pub rand_bytes: Bytes,

    /// Hash of the chain's last block when the transaction was created
    #[schema(value_type = String, example = "base64")]
    pub prev_block: Bytes,

    /// Sender's address
    pub sender: Address,

    /// Receiver's address
    pub receiver: Address,

    /// Amount being transferred
    pub value: u64,

    /// Ledger-maintenance fee
    pub to_storage: u64,

    /// Content hash
    #[schema(value_type = String, example = "base64")]
    pub curr_hash: Bytes,

    /// Sender's signature over `curr_hash`; absent on storage rewards
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<DigitalSignature>,
}

impl Transaction {
    /// Creates and signs a transfer from `user` to `receiver`.
    ///
    /// The fee is derived from `value`: transfers above the small-value
    /// threshold pay exactly the storage fee, the rest pay nothing.
    pub fn new<R: RngCore + CryptoRng>(
        user: &User,
        prev_hash: &Bytes,
        receiver: Address,
        value: u64,
        params: &ProtocolParams,
        rng: &mut R,
    ) -> Result<Self, TransactionError> {
        let mut tx = Transaction {
            rand_bytes: random_bytes(rng, params.rand_bytes)?,
            prev_block: prev_hash.clone(),
            sender: user.address().clone(),
            receiver,
            value,
            to_storage: params.fee_for(value),
            curr_hash: Bytes::default(),
            signature: None,
        };
        tx.curr_hash = tx.hash();
        tx.signature = Some(user.sign(tx.curr_hash.as_slice())?);
        Ok(tx)
    }

    /// Creates the unsigned reward the ledger-maintenance account pays `miner`
    pub fn storage_reward<R: RngCore>(
        miner: Address,
        params: &ProtocolParams,
        rng: &mut R,
    ) -> Result<Self, TransactionError> {
        let mut tx = Transaction {
            rand_bytes: random_bytes(rng, params.rand_bytes)?,
            prev_block: Bytes::default(),
            sender: Address::storage_chain(),
            receiver: miner,
            value: params.storage_reward,
            to_storage: 0,
            curr_hash: Bytes::default(),
            signature: None,
        };
        tx.curr_hash = tx.hash();
        Ok(tx)
    }

    pub fn kind(&self) -> TransactionKind {
        if self.sender.is_storage_chain() {
            TransactionKind::StorageReward
        } else {
            TransactionKind::Transfer
        }
    }

    /// Computes the content hash from the transaction fields
    pub fn hash(&self) -> Bytes {
        Bytes(hash_sum(&[
            self.rand_bytes.as_slice(),
            self.prev_block.as_slice(),
            self.sender.as_bytes(),
            self.receiver.as_bytes(),
            &self.value.to_be_bytes()[..],
            &self.to_storage.to_be_bytes()[..],
        ]))
    }

    pub fn hash_is_valid(&self) -> bool {
        self.hash() == self.curr_hash
    }

    /// Checks the signature against the public key embedded in the sender
    /// address. False when the address does not decode to a key.
    pub fn sign_is_valid(&self) -> bool {
        let Some(signature) = &self.signature else {
            return false;
        };
        let Ok(public_key) = self.sender.to_public_key() else {
            return false;
        };
        verify_signature(self.curr_hash.as_slice(), signature, &public_key).unwrap_or(false)
    }

    /// Self-validation of a transfer: content hash first, then signature
    pub fn verify(&self) -> Result<(), TransactionError> {
        if !self.hash_is_valid() {
            return Err(TransactionError::InvalidHash);
        }
        if !self.sign_is_valid() {
            return Err(TransactionError::InvalidSignature);
        }
        Ok(())
    }

    /// Whether the fee matches the fixed-fee policy for this value
    pub fn fee_is_valid(&self, params: &ProtocolParams) -> bool {
        self.to_storage == params.fee_for(self.value)
    }

    /// Total debited from the sender; `None` on overflow
    pub fn debit(&self) -> Option<u64> {
        self.value.checked_add(self.to_storage)
    }
}
