//! In-memory node for tests.
//!
//! `MockNode` implements the full [`crate::node::NodeClient`] contract over
//! seedable in-memory chain and pool state, and records enough about the
//! requests it serves (counts, concurrency) for the single-flight and
//! pipeline tests to make assertions.

use std::collections::HashMap;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use umb_crypto_keys::KeyPair;
use umb_transaction_core::{Block, Hash, Transaction, TransactionInput};

use crate::container::UNCONFIRMED_HEIGHT;
use crate::error::NodeError;
use crate::node::{
    BlockDetails, NodeClient, NodeObserver, OutEntry, PoolDifference, RandomAmountOuts,
    TransactionDetails,
};

struct MockState {
    blocks: Vec<BlockDetails>,
    pool: HashMap<Hash, TransactionDetails>,
    relayed: Vec<Transaction>,
    relay_error: Option<NodeError>,
    random_outs_limit: Option<usize>,
}

/// A scriptable in-memory node.
pub struct MockNode {
    state: Mutex<MockState>,
    synchronized: AtomicBool,
    next_global_index: AtomicU32,
    pool_diff_requests: AtomicUsize,
    pool_diff_in_flight: AtomicUsize,
    pool_diff_max_in_flight: AtomicUsize,
    pool_diff_delay: Mutex<Duration>,
    observers: Mutex<Vec<Arc<dyn NodeObserver>>>,
}

impl Default for MockNode {
    fn default() -> Self {
        Self::new()
    }
}

impl MockNode {
    /// A synchronized node with an empty chain.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                blocks: Vec::new(),
                pool: HashMap::new(),
                relayed: Vec::new(),
                relay_error: None,
                random_outs_limit: None,
            }),
            synchronized: AtomicBool::new(true),
            next_global_index: AtomicU32::new(1_000),
            pool_diff_requests: AtomicUsize::new(0),
            pool_diff_in_flight: AtomicUsize::new(0),
            pool_diff_max_in_flight: AtomicUsize::new(0),
            pool_diff_delay: Mutex::new(Duration::ZERO),
            observers: Mutex::new(Vec::new()),
        }
    }

    /// Append a block built from the given transactions. Global output
    /// indexes are assigned sequentially. Returns the block's details.
    pub fn add_block(&self, transactions: Vec<Transaction>) -> BlockDetails {
        let mut state = self.state.lock().unwrap();
        let height = state.blocks.len() as u32;

        let details: Vec<TransactionDetails> = transactions
            .iter()
            .map(|tx| {
                let output_global_indexes: Vec<u32> = tx
                    .prefix
                    .outputs
                    .iter()
                    .map(|_| self.next_global_index.fetch_add(1, Ordering::SeqCst))
                    .collect();
                TransactionDetails {
                    transaction: tx.clone(),
                    hash: tx.hash(),
                    block_height: height,
                    timestamp: 1_700_000_000 + u64::from(height),
                    output_global_indexes,
                }
            })
            .collect();

        let block = Block {
            major_version: 1,
            minor_version: 0,
            timestamp: 1_700_000_000 + u64::from(height),
            previous_block_hash: state
                .blocks
                .last()
                .map(|previous| previous.hash)
                .unwrap_or_default(),
            nonce: height,
            parent_block: None,
            base_transaction: transactions
                .first()
                .cloned()
                .filter(|tx| tx.prefix.is_base())
                .unwrap_or_default(),
            transaction_hashes: transactions.iter().map(|tx| tx.hash()).collect(),
        };
        let block_details = BlockDetails {
            hash: block.hash(),
            height,
            timestamp: block.timestamp,
            is_alternative: false,
            transactions: details,
            block,
        };
        state.blocks.push(block_details.clone());

        // Any pool entries mined into this block leave the pool.
        let mut pool_changed = false;
        for tx in &transactions {
            pool_changed |= state.pool.remove(&tx.hash()).is_some();
        }
        drop(state);

        self.notify_observers(|observer| observer.local_blockchain_updated(height));
        if pool_changed {
            self.notify_observers(|observer| observer.pool_changed());
        }
        block_details
    }

    /// Put a transaction into the pool.
    pub fn add_pool_transaction(&self, tx: Transaction) -> TransactionDetails {
        let details = TransactionDetails {
            hash: tx.hash(),
            block_height: UNCONFIRMED_HEIGHT,
            timestamp: 0,
            output_global_indexes: Vec::new(),
            transaction: tx,
        };
        self.state
            .lock()
            .unwrap()
            .pool
            .insert(details.hash, details.clone());
        self.notify_observers(|observer| observer.pool_changed());
        details
    }

    /// Drop a transaction from the pool.
    pub fn remove_pool_transaction(&self, hash: &Hash) {
        self.state.lock().unwrap().pool.remove(hash);
        self.notify_observers(|observer| observer.pool_changed());
    }

    /// Announce that the node finished syncing at its current top.
    pub fn notify_synchronized(&self) {
        let top = self.get_last_local_block_height();
        self.notify_observers(|observer| observer.blockchain_synchronized(top));
    }

    /// Announce a switch to another chain branch.
    pub fn notify_chain_switched(&self, new_top_index: u32, common_root: u32) {
        let hashes: Vec<Hash> = {
            let state = self.state.lock().unwrap();
            state
                .blocks
                .iter()
                .filter(|details| {
                    details.height > common_root && details.height <= new_top_index
                })
                .map(|details| details.hash)
                .collect()
        };
        self.notify_observers(|observer| {
            observer.chain_switched(new_top_index, common_root, hashes.clone())
        });
    }

    fn notify_observers(&self, notify: impl Fn(&Arc<dyn NodeObserver>)) {
        let observers: Vec<Arc<dyn NodeObserver>> =
            self.observers.lock().unwrap().clone();
        for observer in &observers {
            notify(observer);
        }
    }

    /// Make `relay_transaction` fail with `error`.
    pub fn set_relay_error(&self, error: Option<NodeError>) {
        self.state.lock().unwrap().relay_error = error;
    }

    /// Cap the number of decoys returned per amount.
    pub fn set_random_outs_limit(&self, limit: Option<usize>) {
        self.state.lock().unwrap().random_outs_limit = limit;
    }

    /// Stretch every pool-diff request by `delay`.
    pub fn set_pool_diff_delay(&self, delay: Duration) {
        *self.pool_diff_delay.lock().unwrap() = delay;
    }

    /// Mark the node synchronized or not.
    pub fn set_synchronized(&self, synchronized: bool) {
        self.synchronized.store(synchronized, Ordering::SeqCst);
    }

    /// Transactions successfully relayed so far.
    pub fn relayed_transactions(&self) -> Vec<Transaction> {
        self.state.lock().unwrap().relayed.clone()
    }

    /// Total pool-diff requests served.
    pub fn pool_diff_requests(&self) -> usize {
        self.pool_diff_requests.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously in-flight pool-diff requests.
    pub fn pool_diff_max_in_flight(&self) -> usize {
        self.pool_diff_max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NodeClient for MockNode {
    async fn get_blocks_by_range(
        &self,
        heights: Range<u32>,
    ) -> Result<Vec<Vec<BlockDetails>>, NodeError> {
        let state = self.state.lock().unwrap();
        let mut result = Vec::new();
        for height in heights {
            match state.blocks.get(height as usize) {
                Some(details) => result.push(vec![details.clone()]),
                None => break,
            }
        }
        Ok(result)
    }

    async fn get_blocks_by_hashes(&self, hashes: &[Hash]) -> Result<Vec<BlockDetails>, NodeError> {
        let state = self.state.lock().unwrap();
        hashes
            .iter()
            .map(|hash| {
                state
                    .blocks
                    .iter()
                    .find(|details| details.hash == *hash)
                    .cloned()
                    .ok_or_else(|| NodeError::BadResponse("unknown block hash".into()))
            })
            .collect()
    }

    async fn get_block_hashes_by_timestamps(
        &self,
        begin: u64,
        span: u64,
    ) -> Result<Vec<Hash>, NodeError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .blocks
            .iter()
            .filter(|details| details.timestamp >= begin && details.timestamp < begin + span)
            .map(|details| details.hash)
            .collect())
    }

    async fn get_transactions(
        &self,
        hashes: &[Hash],
    ) -> Result<Vec<TransactionDetails>, NodeError> {
        let state = self.state.lock().unwrap();
        let mut result = Vec::new();
        for hash in hashes {
            if let Some(details) = state.pool.get(hash) {
                result.push(details.clone());
                continue;
            }
            if let Some(details) = state
                .blocks
                .iter()
                .flat_map(|block| block.transactions.iter())
                .find(|details| details.hash == *hash)
            {
                result.push(details.clone());
            }
        }
        Ok(result)
    }

    async fn get_transaction_hashes_by_payment_id(
        &self,
        payment_id: Hash,
    ) -> Result<Vec<Hash>, NodeError> {
        let state = self.state.lock().unwrap();
        let matches = |details: &TransactionDetails| {
            umb_transaction_core::parse_extra(
                &details.transaction.prefix.extra,
                umb_transaction_core::UnknownTagPolicy::OpaqueTail,
            )
            .ok()
            .and_then(|fields| umb_transaction_core::get_payment_id(&fields))
                == Some(payment_id)
        };
        Ok(state
            .blocks
            .iter()
            .flat_map(|block| block.transactions.iter())
            .chain(state.pool.values())
            .filter(|details| matches(details))
            .map(|details| details.hash)
            .collect())
    }

    async fn get_pool_symmetric_difference(
        &self,
        known_hashes: Vec<Hash>,
        known_top: Hash,
    ) -> Result<PoolDifference, NodeError> {
        self.pool_diff_requests.fetch_add(1, Ordering::SeqCst);
        let in_flight = self.pool_diff_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.pool_diff_max_in_flight
            .fetch_max(in_flight, Ordering::SeqCst);

        let delay = *self.pool_diff_delay.lock().unwrap();
        if delay > Duration::ZERO {
            tokio::time::sleep(delay).await;
        }

        let result = {
            let state = self.state.lock().unwrap();
            let new_transactions = state
                .pool
                .values()
                .filter(|details| !known_hashes.contains(&details.hash))
                .cloned()
                .collect();
            let removed_hashes = known_hashes
                .iter()
                .filter(|hash| !state.pool.contains_key(*hash))
                .copied()
                .collect();
            let is_chain_actual = state
                .blocks
                .last()
                .map(|top| top.hash == known_top)
                .unwrap_or(known_top == Hash::default());
            PoolDifference {
                is_chain_actual,
                new_transactions,
                removed_hashes,
            }
        };

        self.pool_diff_in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(result)
    }

    async fn get_random_outs_by_amounts(
        &self,
        amounts: Vec<u64>,
        count: usize,
    ) -> Result<Vec<RandomAmountOuts>, NodeError> {
        let limit = self.state.lock().unwrap().random_outs_limit;
        let per_amount = limit.unwrap_or(count).min(count);
        Ok(amounts
            .into_iter()
            .map(|amount| RandomAmountOuts {
                amount,
                outs: (0..per_amount)
                    .map(|_| OutEntry {
                        global_index: self.next_global_index.fetch_add(1, Ordering::SeqCst),
                        output_key: KeyPair::generate(&mut rand_core::OsRng).public,
                    })
                    .collect(),
            })
            .collect())
    }

    async fn relay_transaction(&self, transaction: &Transaction) -> Result<(), NodeError> {
        let mut state = self.state.lock().unwrap();
        if let Some(error) = state.relay_error.clone() {
            return Err(error);
        }
        state.relayed.push(transaction.clone());
        Ok(())
    }

    fn is_synchronized(&self) -> bool {
        self.synchronized.load(Ordering::SeqCst)
    }

    fn get_last_local_block_height(&self) -> u32 {
        let state = self.state.lock().unwrap();
        state.blocks.len().saturating_sub(1) as u32
    }

    fn add_observer(&self, observer: Arc<dyn NodeObserver>) -> bool {
        let mut observers = self.observers.lock().unwrap();
        if observers.iter().any(|existing| Arc::ptr_eq(existing, &observer)) {
            return false;
        }
        observers.push(observer);
        true
    }

    fn remove_observer(&self, observer: &Arc<dyn NodeObserver>) -> bool {
        let mut observers = self.observers.lock().unwrap();
        let before = observers.len();
        observers.retain(|existing| !Arc::ptr_eq(existing, observer));
        observers.len() != before
    }
}

/// A coinbase transaction minting `amount` at `height` for nobody in
/// particular.
pub fn coinbase_at(height: u32, amount: u64) -> Transaction {
    use umb_transaction_core::{
        BaseInput, KeyOutput, OutputTarget, TransactionOutput, TransactionPrefix,
    };
    Transaction {
        prefix: TransactionPrefix {
            inputs: vec![TransactionInput::Base(BaseInput {
                block_index: height,
            })],
            outputs: vec![TransactionOutput {
                amount,
                target: OutputTarget::Key(KeyOutput {
                    key: KeyPair::generate(&mut rand_core::OsRng).public,
                }),
            }],
            ..TransactionPrefix::default()
        },
        signatures: Vec::new(),
    }
}
