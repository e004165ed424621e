// Ledger core
//
// This module contains the ledger engine:
// - Blocks, their balance snapshots and the validation pipeline
// - The append-only chain over a pluggable block store
// - Signed transfers and storage rewards
// - Cryptography utilities and the proof-of-work search

pub mod block;
pub mod chain;
pub mod crypto;
pub mod params;
pub mod pow;
pub mod storage;
pub mod transaction;
pub mod validation;

// Re-export main components for easier access
pub use block::{Block, BlockError};
pub use chain::{Blockchain, BlockchainError};
pub use crypto::{Address, Bytes, DigitalSignature, User};
pub use params::ProtocolParams;
pub use pow::CancelToken;
pub use storage::{BlockStore, MemoryStore, SledStore};
pub use transaction::{Transaction, TransactionKind};
pub use validation::{ErrorClass, ValidationError};
