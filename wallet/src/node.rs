//! The node client contract.
//!
//! Everything the wallet and the explorer need from a node daemon, expressed
//! as an async trait. Implementations (JSON-RPC, in-process, mocks) live
//! elsewhere; [`crate::test_utils::MockNode`] ships with this crate.

use std::ops::Range;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use umb_crypto_keys::PublicKey;
use umb_transaction_core::{Block, Hash, Transaction};

use crate::error::NodeError;

/// A block together with the metadata the wallet layer needs.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BlockDetails {
    /// The block itself.
    pub block: Block,
    /// Its hash.
    pub hash: Hash,
    /// Its height.
    pub height: u32,
    /// Its timestamp.
    pub timestamp: u64,
    /// Whether the block sits on an alternative branch.
    pub is_alternative: bool,
    /// The block's transactions (coinbase first), with metadata.
    pub transactions: Vec<TransactionDetails>,
}

/// A transaction together with the metadata the wallet layer needs.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransactionDetails {
    /// The transaction itself.
    pub transaction: Transaction,
    /// Its hash.
    pub hash: Hash,
    /// Containing block height, or the unconfirmed sentinel for pool
    /// transactions.
    pub block_height: u32,
    /// Containing block timestamp; zero for pool transactions.
    pub timestamp: u64,
    /// Global index of each output, aligned with the output positions.
    /// Empty for pool transactions.
    pub output_global_indexes: Vec<u32>,
}

/// One decoy candidate.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct OutEntry {
    /// Position in the global per-amount output set.
    pub global_index: u32,
    /// The output's one-time key.
    pub output_key: PublicKey,
}

/// Decoy candidates for one amount.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RandomAmountOuts {
    /// The amount.
    pub amount: u64,
    /// The candidates.
    pub outs: Vec<OutEntry>,
}

/// The node's answer to a pool symmetric-difference query.
#[derive(Clone, Debug)]
pub struct PoolDifference {
    /// Whether the caller's known chain top is still the node's top.
    pub is_chain_actual: bool,
    /// Pool transactions the caller does not know yet.
    pub new_transactions: Vec<TransactionDetails>,
    /// Known hashes no longer in the pool.
    pub removed_hashes: Vec<Hash>,
}

/// Chain- and pool-level callbacks a node implementation delivers.
///
/// Observers are registered as non-owning `Arc`s; whoever registers one
/// removes it before dropping the receiving side.
pub trait NodeObserver: Send + Sync {
    /// The node's local chain grew to `top_index`.
    fn local_blockchain_updated(&self, _top_index: u32) {}
    /// The node finished syncing at `top_index`.
    fn blockchain_synchronized(&self, _top_index: u32) {}
    /// The node switched to another chain branch.
    fn chain_switched(&self, _new_top_index: u32, _common_root: u32, _hashes: Vec<Hash>) {}
    /// The transaction pool changed.
    fn pool_changed(&self) {}
}

/// The asynchronous node contract consumed by the wallet and the explorer.
#[async_trait]
pub trait NodeClient: Send + Sync {
    /// Blocks for a contiguous height range; one entry per height, each
    /// holding the mainchain block and any alternatives.
    async fn get_blocks_by_range(
        &self,
        heights: Range<u32>,
    ) -> Result<Vec<Vec<BlockDetails>>, NodeError>;

    /// Blocks by hash.
    async fn get_blocks_by_hashes(&self, hashes: &[Hash]) -> Result<Vec<BlockDetails>, NodeError>;

    /// Hashes of blocks whose timestamps fall into `[begin, begin + span)`.
    async fn get_block_hashes_by_timestamps(
        &self,
        begin: u64,
        span: u64,
    ) -> Result<Vec<Hash>, NodeError>;

    /// Transactions by hash.
    async fn get_transactions(
        &self,
        hashes: &[Hash],
    ) -> Result<Vec<TransactionDetails>, NodeError>;

    /// Hashes of transactions carrying `payment_id`.
    async fn get_transaction_hashes_by_payment_id(
        &self,
        payment_id: Hash,
    ) -> Result<Vec<Hash>, NodeError>;

    /// Diff the caller's pool view against the node's.
    async fn get_pool_symmetric_difference(
        &self,
        known_hashes: Vec<Hash>,
        known_top: Hash,
    ) -> Result<PoolDifference, NodeError>;

    /// `count` random decoy outputs for each amount.
    async fn get_random_outs_by_amounts(
        &self,
        amounts: Vec<u64>,
        count: usize,
    ) -> Result<Vec<RandomAmountOuts>, NodeError>;

    /// Relay a signed transaction.
    async fn relay_transaction(&self, transaction: &Transaction) -> Result<(), NodeError>;

    /// Whether the node considers itself synchronized.
    fn is_synchronized(&self) -> bool;

    /// The node's local chain height.
    fn get_last_local_block_height(&self) -> u32;

    /// Register an observer. Returns `false` if it was already registered.
    fn add_observer(&self, observer: Arc<dyn NodeObserver>) -> bool;

    /// Remove an observer. Returns `false` if it was not registered.
    fn remove_observer(&self, observer: &Arc<dyn NodeObserver>) -> bool;
}
