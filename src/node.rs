use log::{info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use thiserror::Error;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::blockchain::{
    Address, Block, BlockError, BlockStore, Blockchain, BlockchainError, Bytes, CancelToken,
    Transaction, TransactionKind, User, ValidationError,
};
use crate::blockchain::transaction::TransactionError;

/// Errors returned by node operations
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("Block rejected: {0}")]
    Invalid(#[from] ValidationError),

    #[error("Block error: {0}")]
    Block(#[from] BlockError),

    #[error("Invalid transaction: {0}")]
    Transaction(#[from] TransactionError),

    #[error("Blockchain error: {0}")]
    Chain(#[from] BlockchainError),

    #[error("Storage rewards are created by the miner only")]
    UnexpectedReward,

    #[error("Random nonce {0} was already used")]
    Replayed(String),

    #[error("Node state lock poisoned")]
    LockPoisoned,
}

/// The block being filled and the randomness used to fill and seal it
struct Pending {
    block: Block,
    rng: StdRng,

    /// Transfers of a round preempted by an incoming block, waiting to be
    /// queued again on top of it
    carried: Vec<Transaction>,
}

/// Single writer over one chain.
///
/// The node owns the in-progress block. Incoming transfers go into it, and
/// once it holds `txs_limit` transfers it is sealed, mined and appended.
/// A valid externally mined block preempts any mining in flight; the
/// transfers it does not already contain are queued again on top of it.
pub struct Node<S: BlockStore> {
    chain: Blockchain<S>,
    miner: User,
    pending: Mutex<Pending>,
    cancel: CancelToken,

    /// Set while an incoming block waits for the lock
    preempted: AtomicBool,
}

impl<S: BlockStore> Node<S> {
    pub fn new(chain: Blockchain<S>, miner: User) -> Result<Self, NodeError> {
        Self::with_rng(chain, miner, StdRng::from_entropy())
    }

    pub fn with_rng(chain: Blockchain<S>, miner: User, rng: StdRng) -> Result<Self, NodeError> {
        let block = chain.new_block(miner.address().clone())?;
        info!("Node mining for {}", miner.address());
        Ok(Node {
            chain,
            miner,
            pending: Mutex::new(Pending {
                block,
                rng,
                carried: Vec::new(),
            }),
            cancel: CancelToken::new(),
            preempted: AtomicBool::new(false),
        })
    }

    pub fn chain(&self) -> &Blockchain<S> {
        &self.chain
    }

    pub fn miner(&self) -> &Address {
        self.miner.address()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Pending>, NodeError> {
        self.pending.lock().map_err(|_| NodeError::LockPoisoned)
    }

    fn reset_pending(&self, pending: &mut Pending) -> Result<(), NodeError> {
        pending.block = self.chain.new_block(self.miner.address().clone())?;
        Ok(())
    }

    fn is_full(&self, pending: &Pending) -> bool {
        pending.block.transactions.len() >= self.chain.params().txs_limit
    }

    /// Checks a transfer and adds it to the pending block
    fn enqueue(&self, pending: &mut Pending, tx: Transaction) -> Result<(), NodeError> {
        if tx.kind() == TransactionKind::StorageReward {
            return Err(NodeError::UnexpectedReward);
        }
        tx.verify()?;

        let queued = pending
            .block
            .transactions
            .iter()
            .chain(&pending.carried)
            .any(|queued| queued.rand_bytes == tx.rand_bytes);
        if queued || self.chain.contains_rand_bytes(&tx.rand_bytes)? {
            return Err(NodeError::Replayed(tx.rand_bytes.to_base64()));
        }

        pending.block.add_transaction(&self.chain, tx)?;
        Ok(())
    }

    /// Adds a signed transfer to the pending block.
    ///
    /// Returns the position of the newly appended block when the transfer
    /// filled the pending block and it was mined.
    pub fn submit_transaction(&self, tx: Transaction) -> Result<Option<u64>, NodeError> {
        let mut pending = self.lock()?;

        let hash = tx.curr_hash.clone();
        if let Err(err) = self.enqueue(&mut pending, tx) {
            warn!("Rejected transaction {}: {}", hash, err);
            return Err(err);
        }
        info!("Queued transaction {}", hash);

        if !self.is_full(&pending) {
            return Ok(None);
        }
        self.mine(&mut pending)
    }

    /// Seals and appends the pending block, then starts a fresh one.
    ///
    /// Returns `None` when an incoming block preempted the round; its
    /// transfers are carried over. Any other failure drops them.
    fn mine(&self, pending: &mut Pending) -> Result<Option<u64>, NodeError> {
        let mut block = pending.block.clone();
        let sealed = block.accept(&self.chain, &self.miner, &mut pending.rng, &self.cancel);
        self.cancel.reset();

        let result = match sealed {
            Ok(()) => self.chain.add_block(&block).map(Some).map_err(NodeError::from),
            Err(BlockError::MiningCancelled(_)) if self.preempted.load(Ordering::SeqCst) => {
                info!(
                    "Mining preempted by an incoming block, carrying {} transfers",
                    pending.block.transactions.len()
                );
                let transfers = std::mem::take(&mut pending.block.transactions);
                pending.carried.extend(transfers);
                Ok(None)
            }
            Err(err) => {
                for tx in &pending.block.transactions {
                    warn!("Dropped transaction {}: {}", tx.curr_hash, err);
                }
                Err(err.into())
            }
        };
        self.reset_pending(pending)?;

        if let Ok(Some(position)) = result {
            info!("Mined block {} at position {}", block.curr_hash, position);
        }
        result
    }

    /// Starts a fresh pending block on the current head and queues the
    /// waiting transfers that still apply, mining whenever the block fills
    fn requeue(&self, pending: &mut Pending) -> Result<(), NodeError> {
        let mut waiting = std::mem::take(&mut pending.carried);
        waiting.append(&mut pending.block.transactions);
        self.reset_pending(pending)?;

        for tx in waiting {
            let hash = tx.curr_hash.clone();
            if let Err(err) = self.enqueue(pending, tx) {
                warn!("Dropped queued transaction {}: {}", hash, err);
                continue;
            }
            if self.is_full(pending) {
                if let Err(err) = self.mine(pending) {
                    warn!("Mining re-queued transfers failed: {}", err);
                }
            }
        }
        Ok(())
    }

    /// Validates and appends an externally mined block.
    ///
    /// An invalid block is rejected without touching the node. A valid one
    /// preempts mining in flight and is appended if it still extends the
    /// head once the lock is held.
    pub fn add_block(&self, block: Block) -> Result<u64, NodeError> {
        if let Err(err) = block.validate(&self.chain) {
            warn!("Rejected block {}: {}", block.curr_hash, err);
            return Err(err.into());
        }

        self.preempted.store(true, Ordering::SeqCst);
        self.cancel.cancel();
        let pending = self.lock();
        self.preempted.store(false, Ordering::SeqCst);
        self.cancel.reset();
        let mut pending = pending?;

        // the head may have moved while waiting for the lock
        let appended = match block.hash_is_valid(&self.chain) {
            Ok(()) => self.chain.add_block(&block).map_err(NodeError::from),
            Err(err) => {
                warn!("Rejected block {}: {}", block.curr_hash, err);
                Err(err.into())
            }
        };
        if appended.is_ok() || !pending.carried.is_empty() {
            self.requeue(&mut pending)?;
        }
        appended
    }

    pub fn block_at(&self, position: u64) -> Result<Option<Block>, NodeError> {
        Ok(self.chain.block_at(position)?)
    }

    pub fn last_hash(&self) -> Result<Bytes, NodeError> {
        Ok(self.chain.last_hash()?)
    }

    pub fn balance(&self, address: &Address) -> Result<u64, NodeError> {
        Ok(self.chain.balance(address)?)
    }

    pub fn size(&self) -> Result<u64, NodeError> {
        Ok(self.chain.size()?)
    }

    /// Cancels the proof-of-work search in flight. When the node is idle the
    /// next search is cancelled instead. The cancelled round's transfers are
    /// dropped.
    pub fn abort_mining(&self) {
        info!("Mining abort requested");
        self.cancel.cancel();
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::{MemoryStore, ProtocolParams};
    use chrono::{Duration, Utc};
    use std::thread;
    use std::time::Duration as StdDuration;

    fn setup(seed: u64) -> (StdRng, User, Node<MemoryStore>) {
        setup_with_difficulty(seed, 8)
    }

    fn setup_with_difficulty(seed: u64, difficulty: u8) -> (StdRng, User, Node<MemoryStore>) {
        let mut rng = StdRng::seed_from_u64(seed);
        let miner = User::new(&mut rng);
        let params = ProtocolParams {
            difficulty,
            ..ProtocolParams::default()
        };
        let chain = Blockchain::create(
            MemoryStore::new(),
            params,
            miner.address(),
            Utc::now() - Duration::minutes(1),
        )
        .unwrap();
        let node = Node::with_rng(chain, miner.clone(), StdRng::seed_from_u64(seed + 1)).unwrap();
        (rng, miner, node)
    }

    fn transfer(node: &Node<MemoryStore>, from: &User, to: &Address, value: u64, rng: &mut StdRng) -> Transaction {
        let last = node.last_hash().unwrap();
        Transaction::new(from, &last, to.clone(), value, node.chain().params(), rng).unwrap()
    }

    /// A block mined outside the node on top of its current head
    fn external_block(node: &Node<MemoryStore>, miner: &User, txs: Vec<Transaction>, rng: &mut StdRng) -> Block {
        let mut block = node.chain().new_block(miner.address().clone()).unwrap();
        for tx in txs {
            block.add_transaction(node.chain(), tx).unwrap();
        }
        block
            .accept(node.chain(), miner, rng, &CancelToken::new())
            .unwrap();
        block
    }

    fn queued(node: &Node<MemoryStore>) -> usize {
        node.lock().unwrap().block.transactions.len()
    }

    #[test]
    fn test_full_block_is_mined() {
        let (mut rng, miner, node) = setup(61);
        let r1 = User::new(&mut rng);
        let r2 = User::new(&mut rng);

        let tx = transfer(&node, &miner, r1.address(), 3, &mut rng);
        assert_eq!(node.submit_transaction(tx).unwrap(), None);
        assert_eq!(node.size().unwrap(), 1);

        let tx = transfer(&node, &miner, r2.address(), 50, &mut rng);
        assert_eq!(node.submit_transaction(tx).unwrap(), Some(1));
        assert_eq!(node.size().unwrap(), 2);

        assert_eq!(node.balance(miner.address()).unwrap(), 47);
        assert_eq!(node.balance(r1.address()).unwrap(), 3);
        assert_eq!(node.balance(r2.address()).unwrap(), 50);
        assert_eq!(node.balance(&Address::storage_chain()).unwrap(), 100);

        let mined = node.block_at(1).unwrap().unwrap();
        assert_eq!(mined.curr_hash, node.last_hash().unwrap());
        assert_eq!(mined.transactions.len(), 3);
        assert!(node.block_at(2).unwrap().is_none());
    }

    #[test]
    fn test_rejects_bad_transfers() {
        let (mut rng, miner, node) = setup(62);
        let r = User::new(&mut rng);

        let mut forged = transfer(&node, &miner, r.address(), 3, &mut rng);
        forged.value = 30;
        assert!(matches!(
            node.submit_transaction(forged),
            Err(NodeError::Transaction(TransactionError::InvalidHash))
        ));

        let broke = transfer(&node, &r, miner.address(), 3, &mut rng);
        assert!(matches!(
            node.submit_transaction(broke),
            Err(NodeError::Block(BlockError::InsufficientFunds { .. }))
        ));

        let reward = Transaction::storage_reward(miner.address().clone(), node.chain().params(), &mut rng).unwrap();
        assert!(matches!(node.submit_transaction(reward), Err(NodeError::UnexpectedReward)));

        let tx = transfer(&node, &miner, r.address(), 3, &mut rng);
        node.submit_transaction(tx.clone()).unwrap();
        assert!(matches!(node.submit_transaction(tx), Err(NodeError::Replayed(_))));
    }

    #[test]
    fn test_external_block_is_validated() {
        let (mut rng, miner, node) = setup(63);
        let r = User::new(&mut rng);

        let tx = transfer(&node, &miner, r.address(), 3, &mut rng);
        let mut block = node.chain().new_block(miner.address().clone()).unwrap();
        block.add_transaction(node.chain(), tx).unwrap();
        block
            .accept(node.chain(), &miner, &mut rng, &CancelToken::new())
            .unwrap();

        let mut tampered = block.clone();
        tampered.nonce = tampered.nonce.wrapping_add(1);
        tampered.difficulty += 1;
        assert!(matches!(
            node.add_block(tampered),
            Err(NodeError::Invalid(ValidationError::DifficultyMismatch { .. }))
        ));
        assert_eq!(node.size().unwrap(), 1);

        assert_eq!(node.add_block(block.clone()).unwrap(), 1);
        assert_eq!(node.last_hash().unwrap(), block.curr_hash);

        // the same block no longer extends the chain
        assert!(matches!(
            node.add_block(block),
            Err(NodeError::Invalid(ValidationError::WrongPosition { .. }))
        ));
    }

    #[test]
    fn test_queued_transfers_survive_external_block() {
        let (mut rng, miner, node) = setup(64);
        let r = User::new(&mut rng);

        let queued_tx = transfer(&node, &miner, r.address(), 3, &mut rng);
        node.submit_transaction(queued_tx).unwrap();

        let tx = transfer(&node, &miner, r.address(), 4, &mut rng);
        let block = external_block(&node, &miner, vec![tx], &mut rng);
        assert_eq!(node.add_block(block).unwrap(), 1);
        assert_eq!(queued(&node), 1);

        // the queued transfer now sits on the new head and fills the block
        let tx = transfer(&node, &miner, r.address(), 1, &mut rng);
        assert_eq!(node.submit_transaction(tx).unwrap(), Some(2));
        assert_eq!(node.balance(r.address()).unwrap(), 4 + 3 + 1);
    }

    #[test]
    fn test_transfer_included_elsewhere_is_not_requeued() {
        let (mut rng, miner, node) = setup(66);
        let r = User::new(&mut rng);

        let tx = transfer(&node, &miner, r.address(), 3, &mut rng);
        node.submit_transaction(tx.clone()).unwrap();

        let block = external_block(&node, &miner, vec![tx], &mut rng);
        node.add_block(block).unwrap();
        assert_eq!(queued(&node), 0);
        assert_eq!(node.balance(r.address()).unwrap(), 3);
    }

    #[test]
    fn test_invalid_block_leaves_mining_alone() {
        let (mut rng, miner, node) = setup(67);
        let r = User::new(&mut rng);

        let tx = transfer(&node, &miner, r.address(), 1, &mut rng);
        node.submit_transaction(tx).unwrap();

        let garbage = Block::new(miner.address().clone(), Bytes::default(), 0);
        assert!(matches!(
            node.add_block(garbage),
            Err(NodeError::Invalid(ValidationError::DifficultyMismatch { .. }))
        ));
        assert!(!node.cancel.is_cancelled());
        assert_eq!(queued(&node), 1);

        let tx = transfer(&node, &miner, r.address(), 2, &mut rng);
        assert_eq!(node.submit_transaction(tx).unwrap(), Some(1));
    }

    #[test]
    fn test_invalid_block_during_mining() {
        let (mut rng, miner, node) = setup_with_difficulty(68, 16);
        let r = User::new(&mut rng);

        let tx1 = transfer(&node, &miner, r.address(), 1, &mut rng);
        let tx2 = transfer(&node, &miner, r.address(), 2, &mut rng);
        node.submit_transaction(tx1).unwrap();

        let mined = thread::scope(|s| {
            let worker = s.spawn(|| node.submit_transaction(tx2));
            thread::sleep(StdDuration::from_millis(5));

            let garbage = Block::new(miner.address().clone(), Bytes::default(), 0);
            assert!(node.add_block(garbage).is_err());
            worker.join().unwrap()
        });

        assert_eq!(mined.unwrap(), Some(1));
        assert_eq!(node.balance(r.address()).unwrap(), 3);
    }

    #[test]
    fn test_preempted_round_is_requeued() {
        let (mut rng, miner, node) = setup(69);
        let r = User::new(&mut rng);

        let tx1 = transfer(&node, &miner, r.address(), 1, &mut rng);
        let tx2 = transfer(&node, &miner, r.address(), 2, &mut rng);
        node.submit_transaction(tx1).unwrap();

        // an incoming block is waiting for the lock while this round mines
        node.preempted.store(true, Ordering::SeqCst);
        node.cancel.cancel();
        assert_eq!(node.submit_transaction(tx2).unwrap(), None);
        assert_eq!(node.size().unwrap(), 1);

        let tx = transfer(&node, &miner, r.address(), 4, &mut rng);
        let block = external_block(&node, &miner, vec![tx], &mut rng);
        assert_eq!(node.add_block(block).unwrap(), 1);

        // both carried transfers were queued again and mined on top
        assert_eq!(node.size().unwrap(), 3);
        assert_eq!(node.balance(r.address()).unwrap(), 4 + 1 + 2);
        assert_eq!(queued(&node), 0);
    }

    #[test]
    fn test_aborted_mining_drops_pending_block() {
        let (mut rng, miner, node) = setup(65);
        let r = User::new(&mut rng);

        node.abort_mining();
        let tx1 = transfer(&node, &miner, r.address(), 1, &mut rng);
        let tx2 = transfer(&node, &miner, r.address(), 2, &mut rng);
        node.submit_transaction(tx1).unwrap();
        assert!(matches!(
            node.submit_transaction(tx2),
            Err(NodeError::Block(BlockError::MiningCancelled(_)))
        ));
        assert_eq!(node.size().unwrap(), 1);

        let tx = transfer(&node, &miner, r.address(), 5, &mut rng);
        assert_eq!(node.submit_transaction(tx).unwrap(), None);
    }
}
