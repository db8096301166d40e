//! The blockchain explorer observer.
//!
//! Watches the node's pool and chain tip and fans coalesced change
//! notifications out to registered observers. Pool polling is single-flight:
//! any number of `pool_changed` triggers while a poll is running collapse
//! into at most one follow-up poll.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, error};
use umb_transaction_core::Hash;

use crate::node::{BlockDetails, NodeClient, TransactionDetails};

const STATE_NONE: u8 = 0;
const STATE_UPDATING: u8 = 1;
const STATE_UPDATE_REQUIRED: u8 = 2;

/// Why a transaction left the pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PoolRemovalReason {
    /// The transaction was mined.
    IncludedInBlock,
    /// The pool dropped the transaction.
    Timeout,
}

/// Chain and pool notifications the explorer emits.
pub trait ExplorerObserver: Send + Sync {
    /// New and removed pool transactions.
    fn pool_updated(
        &self,
        _new_transactions: Vec<TransactionDetails>,
        _removed: Vec<(Hash, PoolRemovalReason)>,
    ) {
    }
    /// The chain grew; mainchain blocks and alternatives seen on the way.
    fn blockchain_updated(
        &self,
        _new_blocks: Vec<BlockDetails>,
        _alternative_blocks: Vec<BlockDetails>,
    ) {
    }
    /// The node finished synchronizing at this block.
    fn blockchain_synchronized(&self, _top_block: BlockDetails) {}
}

struct KnownState {
    pool: std::collections::HashMap<Hash, TransactionDetails>,
    top_block: Option<BlockDetails>,
}

/// Reorg-aware pool and chain watcher.
pub struct BlockchainExplorer {
    node: Arc<dyn NodeClient>,
    observers: Mutex<Vec<Arc<dyn ExplorerObserver>>>,
    pool_state: AtomicU8,
    known: Mutex<KnownState>,
}

impl BlockchainExplorer {
    /// Create an explorer over `node`.
    pub fn new(node: Arc<dyn NodeClient>) -> Self {
        Self {
            node,
            observers: Mutex::new(Vec::new()),
            pool_state: AtomicU8::new(STATE_NONE),
            known: Mutex::new(KnownState {
                pool: std::collections::HashMap::new(),
                top_block: None,
            }),
        }
    }

    /// Register an observer. Returns `false` if it was already registered.
    pub fn add_observer(&self, observer: Arc<dyn ExplorerObserver>) -> bool {
        let mut observers = self.observers.lock().unwrap();
        if observers.iter().any(|existing| Arc::ptr_eq(existing, &observer)) {
            return false;
        }
        observers.push(observer);
        true
    }

    /// Remove an observer. Returns `false` if it was not registered.
    pub fn remove_observer(&self, observer: &Arc<dyn ExplorerObserver>) -> bool {
        let mut observers = self.observers.lock().unwrap();
        let before = observers.len();
        observers.retain(|existing| !Arc::ptr_eq(existing, observer));
        observers.len() != before
    }

    fn observers(&self) -> Vec<Arc<dyn ExplorerObserver>> {
        self.observers.lock().unwrap().clone()
    }

    /// Try to enter the updating state. `false` means a poll is already in
    /// flight; the trigger has been recorded for a follow-up.
    fn begin_pool_update(&self) -> bool {
        let mut state = self.pool_state.load(Ordering::Acquire);
        loop {
            match state {
                STATE_NONE => match self.pool_state.compare_exchange_weak(
                    STATE_NONE,
                    STATE_UPDATING,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => return true,
                    Err(actual) => state = actual,
                },
                STATE_UPDATING => match self.pool_state.compare_exchange_weak(
                    STATE_UPDATING,
                    STATE_UPDATE_REQUIRED,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => return false,
                    Err(actual) => state = actual,
                },
                _ => return false,
            }
        }
    }

    /// Leave the updating state. `true` means triggers arrived during the
    /// poll and the caller must poll once more.
    fn end_pool_update(&self) -> bool {
        let previous = self.pool_state.swap(STATE_NONE, Ordering::AcqRel);
        debug_assert_ne!(previous, STATE_NONE);
        previous == STATE_UPDATE_REQUIRED
    }

    /// Handle a pool-changed trigger.
    ///
    /// No-op when the node is not synchronized or nobody observes. At most
    /// one symmetric-difference request is in flight at any time; triggers
    /// arriving during a poll coalesce into a single follow-up poll.
    pub async fn pool_changed(&self) {
        if !self.node.is_synchronized() || self.observers.lock().unwrap().is_empty() {
            return;
        }
        if !self.begin_pool_update() {
            debug!("pool update already in flight, coalescing");
            return;
        }

        loop {
            self.poll_pool_once().await;
            if !self.end_pool_update() {
                break;
            }
            // A trigger came in while we were polling; go again.
            if !self.node.is_synchronized() || self.observers.lock().unwrap().is_empty() {
                break;
            }
            if !self.begin_pool_update() {
                break;
            }
        }
    }

    async fn poll_pool_once(&self) {
        let (known_hashes, known_top) = {
            let known = self.known.lock().unwrap();
            let hashes: Vec<Hash> = known.pool.keys().copied().collect();
            let top = known
                .top_block
                .as_ref()
                .map(|block| block.hash)
                .unwrap_or_default();
            (hashes, top)
        };

        let diff = match self
            .node
            .get_pool_symmetric_difference(known_hashes, known_top)
            .await
        {
            Ok(diff) => diff,
            Err(err) => {
                error!(%err, "pool symmetric difference request failed");
                return;
            }
        };

        let (new_transactions, removed) = {
            let mut known = self.known.lock().unwrap();
            let new_transactions: Vec<TransactionDetails> = diff
                .new_transactions
                .into_iter()
                .filter(|tx| !known.pool.contains_key(&tx.hash))
                .collect();
            for tx in &new_transactions {
                known.pool.insert(tx.hash, tx.clone());
            }
            let removed: Vec<(Hash, PoolRemovalReason)> = diff
                .removed_hashes
                .iter()
                .filter(|hash| known.pool.remove(*hash).is_some())
                .map(|hash| (*hash, PoolRemovalReason::IncludedInBlock))
                .collect();
            (new_transactions, removed)
        };

        if new_transactions.is_empty() && removed.is_empty() {
            return;
        }
        for observer in self.observers() {
            observer.pool_updated(new_transactions.clone(), removed.clone());
        }
    }

    /// Handle the node's "synchronized" notification.
    pub async fn blockchain_synchronized(&self, top_index: u32) {
        let known_top = {
            let known = self.known.lock().unwrap();
            known.top_block.clone()
        };
        if let Some(top) = known_top {
            if top.height == top_index {
                for observer in self.observers() {
                    observer.blockchain_synchronized(top.clone());
                }
                return;
            }
        }

        let blocks = match self.node.get_blocks_by_range(top_index..top_index + 1).await {
            Ok(blocks) => blocks,
            Err(err) => {
                error!(%err, "failed to fetch the synchronized top block");
                return;
            }
        };
        let Some(top) = blocks
            .into_iter()
            .flatten()
            .find(|block| !block.is_alternative)
        else {
            return;
        };
        for observer in self.observers() {
            observer.blockchain_synchronized(top.clone());
        }
    }

    /// Handle growth of the node's local chain up to `index`.
    pub async fn local_blockchain_updated(&self, index: u32) {
        let from = {
            let known = self.known.lock().unwrap();
            match &known.top_block {
                Some(top) => top.height + 1,
                None => 0,
            }
        };
        if from > index {
            return;
        }
        self.fetch_and_emit_blocks(from, index).await;
    }

    /// Handle a switch to another chain branch.
    pub async fn chain_switched(&self, new_top_index: u32, common_root: u32) {
        self.fetch_and_emit_blocks(common_root + 1, new_top_index).await;
    }

    async fn fetch_and_emit_blocks(&self, from: u32, to: u32) {
        let blocks = match self.node.get_blocks_by_range(from..to + 1).await {
            Ok(blocks) => blocks,
            Err(err) => {
                error!(%err, from, to, "failed to fetch new blocks");
                return;
            }
        };

        let mut new_blocks = Vec::new();
        let mut alternative_blocks = Vec::new();
        let mut best: Option<BlockDetails> = None;
        for details in blocks.into_iter().flatten() {
            if details.is_alternative {
                alternative_blocks.push(details);
            } else {
                if best
                    .as_ref()
                    .map(|current| details.height > current.height)
                    .unwrap_or(true)
                {
                    best = Some(details.clone());
                }
                new_blocks.push(details);
            }
        }

        if let Some(best) = best {
            self.known.lock().unwrap().top_block = Some(best);
        }
        if new_blocks.is_empty() && alternative_blocks.is_empty() {
            return;
        }
        for observer in self.observers() {
            observer.blockchain_updated(new_blocks.clone(), alternative_blocks.clone());
        }
    }

    /// The explorer's view of the chain top.
    pub fn known_top_block(&self) -> Option<BlockDetails> {
        self.known.lock().unwrap().top_block.clone()
    }

    /// The number of pool transactions the explorer currently knows.
    pub fn known_pool_size(&self) -> usize {
        self.known.lock().unwrap().pool.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{coinbase_at, MockNode};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingObserver {
        pool_updates: StdMutex<Vec<(usize, Vec<(Hash, PoolRemovalReason)>)>>,
        chain_updates: StdMutex<Vec<(usize, usize)>>,
        synchronized_at: StdMutex<Vec<u32>>,
    }

    impl ExplorerObserver for RecordingObserver {
        fn pool_updated(
            &self,
            new_transactions: Vec<TransactionDetails>,
            removed: Vec<(Hash, PoolRemovalReason)>,
        ) {
            self.pool_updates
                .lock()
                .unwrap()
                .push((new_transactions.len(), removed));
        }

        fn blockchain_updated(
            &self,
            new_blocks: Vec<BlockDetails>,
            alternative_blocks: Vec<BlockDetails>,
        ) {
            self.chain_updates
                .lock()
                .unwrap()
                .push((new_blocks.len(), alternative_blocks.len()));
        }

        fn blockchain_synchronized(&self, top_block: BlockDetails) {
            self.synchronized_at.lock().unwrap().push(top_block.height);
        }
    }

    fn setup() -> (Arc<MockNode>, Arc<BlockchainExplorer>, Arc<RecordingObserver>) {
        let node = Arc::new(MockNode::new());
        let explorer = Arc::new(BlockchainExplorer::new(node.clone()));
        let observer = Arc::new(RecordingObserver::default());
        explorer.add_observer(observer.clone());
        (node, explorer, observer)
    }

    #[tokio::test]
    async fn pool_changes_are_reported_once() {
        let (node, explorer, observer) = setup();
        let details = node.add_pool_transaction(coinbase_at(1, 50));

        explorer.pool_changed().await;
        {
            let updates = observer.pool_updates.lock().unwrap();
            assert_eq!(updates.len(), 1);
            assert_eq!(updates[0].0, 1);
            assert!(updates[0].1.is_empty());
        }
        assert_eq!(explorer.known_pool_size(), 1);

        // Nothing changed: no further notification.
        explorer.pool_changed().await;
        assert_eq!(observer.pool_updates.lock().unwrap().len(), 1);

        // Removal is reported with its reason.
        node.remove_pool_transaction(&details.hash);
        explorer.pool_changed().await;
        {
            let updates = observer.pool_updates.lock().unwrap();
            assert_eq!(updates.len(), 2);
            assert_eq!(
                updates[1].1,
                vec![(details.hash, PoolRemovalReason::IncludedInBlock)]
            );
        }
        assert_eq!(explorer.known_pool_size(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_triggers_are_single_flight() {
        let (node, explorer, _observer) = setup();
        node.add_pool_transaction(coinbase_at(1, 50));
        node.set_pool_diff_delay(Duration::from_millis(100));

        let mut tasks = Vec::new();
        for _ in 0..5 {
            let explorer = explorer.clone();
            tasks.push(tokio::spawn(async move { explorer.pool_changed().await }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(node.pool_diff_max_in_flight(), 1);
        // The first poll plus at most one coalesced follow-up.
        assert!(node.pool_diff_requests() <= 2, "got {}", node.pool_diff_requests());
        assert!(node.pool_diff_requests() >= 1);
    }

    #[tokio::test]
    async fn unsynchronized_node_is_not_polled() {
        let (node, explorer, _observer) = setup();
        node.add_pool_transaction(coinbase_at(1, 50));
        node.set_synchronized(false);
        explorer.pool_changed().await;
        assert_eq!(node.pool_diff_requests(), 0);
    }

    #[tokio::test]
    async fn no_observers_means_no_polling() {
        let node = Arc::new(MockNode::new());
        let explorer = BlockchainExplorer::new(node.clone());
        node.add_pool_transaction(coinbase_at(1, 50));
        explorer.pool_changed().await;
        assert_eq!(node.pool_diff_requests(), 0);
    }

    #[tokio::test]
    async fn chain_updates_advance_the_known_top() {
        let (node, explorer, observer) = setup();
        node.add_block(vec![coinbase_at(0, 10)]);
        node.add_block(vec![coinbase_at(1, 10)]);

        explorer.local_blockchain_updated(1).await;
        assert_eq!(explorer.known_top_block().unwrap().height, 1);
        assert_eq!(observer.chain_updates.lock().unwrap().as_slice(), &[(2, 0)]);

        node.add_block(vec![coinbase_at(2, 10)]);
        explorer.local_blockchain_updated(2).await;
        assert_eq!(explorer.known_top_block().unwrap().height, 2);
        assert_eq!(
            observer.chain_updates.lock().unwrap().as_slice(),
            &[(2, 0), (1, 0)]
        );
    }

    #[tokio::test]
    async fn blockchain_synchronized_reports_the_top_block() {
        let (node, explorer, observer) = setup();
        node.add_block(vec![coinbase_at(0, 10)]);
        node.add_block(vec![coinbase_at(1, 10)]);

        // Without a known top the block is fetched from the node.
        explorer.blockchain_synchronized(1).await;
        assert_eq!(observer.synchronized_at.lock().unwrap().as_slice(), &[1]);

        // With a matching known top no fetch is needed.
        explorer.local_blockchain_updated(1).await;
        explorer.blockchain_synchronized(1).await;
        assert_eq!(observer.synchronized_at.lock().unwrap().as_slice(), &[1, 1]);
    }

    #[tokio::test]
    async fn chain_switch_refetches_from_common_root() {
        let (node, explorer, observer) = setup();
        node.add_block(vec![coinbase_at(0, 10)]);
        node.add_block(vec![coinbase_at(1, 10)]);
        node.add_block(vec![coinbase_at(2, 10)]);
        explorer.local_blockchain_updated(2).await;

        explorer.chain_switched(2, 0).await;
        let updates = observer.chain_updates.lock().unwrap();
        // Initial catch-up plus the post-switch refetch of heights 1..=2.
        assert_eq!(updates.as_slice(), &[(3, 0), (2, 0)]);
    }
}
