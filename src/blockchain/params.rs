use serde::{Deserialize, Serialize};

/// Sentinel stored as the previous-hash of the genesis block
pub const GENESIS_BLOCK: &str = "GENESIS-BLOCK";

/// Protocol constants shared by every party extending one chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolParams {
    /// Leading zero bits required of `H(block hash ‖ nonce)`
    pub difficulty: u8,

    /// Ordinary transactions allowed per block (the storage reward is extra)
    pub txs_limit: usize,

    /// Length of a transaction's random nonce
    pub rand_bytes: usize,

    /// Transfers above this value pay the storage fee
    pub start_percent: u64,

    /// Storage fee, also the per-block miner reward
    pub storage_reward: u64,

    /// Genesis balance of the ledger-maintenance account
    pub storage_value: u64,

    /// Genesis balance of the initial receiver
    pub genesis_reward: u64,
}

impl Default for ProtocolParams {
    fn default() -> Self {
        ProtocolParams {
            difficulty: 20,
            txs_limit: 2,
            rand_bytes: 32,
            start_percent: 10,
            storage_reward: 1,
            storage_value: 100,
            genesis_reward: 100,
        }
    }
}

impl ProtocolParams {
    /// Fee a transfer of `value` must carry
    pub fn fee_for(&self, value: u64) -> u64 {
        if value > self.start_percent {
            self.storage_reward
        } else {
            0
        }
    }
}
