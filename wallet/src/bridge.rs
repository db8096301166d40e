//! Assembly of the push pipeline: node → explorer → wallet.
//!
//! A node implementation delivers its notifications on whatever thread it
//! likes, through the synchronous [`NodeObserver`] callbacks. The forwarder
//! turns each of them into a task driving the matching async handler of the
//! [`BlockchainExplorer`]; the explorer in turn fans its digested updates
//! out to the [`Wallet`], which implements
//! [`ExplorerObserver`](crate::explorer::ExplorerObserver).
//!
//! [`NodeBridge::connect`] registers both halves; observers are held as
//! non-owning handles and removed again on [`NodeBridge::disconnect`] (or
//! drop), so no ownership cycle forms between node, explorer and wallet.

use std::future::Future;
use std::sync::Arc;

use tracing::warn;
use umb_transaction_core::Hash;

use crate::explorer::{BlockchainExplorer, ExplorerObserver};
use crate::node::{NodeClient, NodeObserver};
use crate::wallet::Wallet;

fn spawn_on_runtime<F>(what: &'static str, future: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(future);
        }
        Err(_) => {
            warn!(what, "no async runtime available, dropping node notification");
        }
    }
}

/// Forwards a node's push notifications into an explorer.
pub struct NodeEventForwarder {
    explorer: Arc<BlockchainExplorer>,
}

impl NodeEventForwarder {
    /// Create a forwarder targeting `explorer`.
    pub fn new(explorer: Arc<BlockchainExplorer>) -> Self {
        Self { explorer }
    }
}

impl NodeObserver for NodeEventForwarder {
    fn local_blockchain_updated(&self, top_index: u32) {
        let explorer = self.explorer.clone();
        spawn_on_runtime("local_blockchain_updated", async move {
            explorer.local_blockchain_updated(top_index).await;
        });
    }

    fn blockchain_synchronized(&self, top_index: u32) {
        let explorer = self.explorer.clone();
        spawn_on_runtime("blockchain_synchronized", async move {
            explorer.blockchain_synchronized(top_index).await;
        });
    }

    fn chain_switched(&self, new_top_index: u32, common_root: u32, _hashes: Vec<Hash>) {
        let explorer = self.explorer.clone();
        spawn_on_runtime("chain_switched", async move {
            explorer.chain_switched(new_top_index, common_root).await;
        });
    }

    fn pool_changed(&self) {
        let explorer = self.explorer.clone();
        spawn_on_runtime("pool_changed", async move {
            explorer.pool_changed().await;
        });
    }
}

/// A connected node → explorer → wallet pipeline.
///
/// Keeps the registrations alive; dropping the bridge (or calling
/// [`NodeBridge::disconnect`]) detaches the wallet from the node again.
pub struct NodeBridge {
    node: Arc<dyn NodeClient>,
    explorer: Arc<BlockchainExplorer>,
    forwarder: Arc<dyn NodeObserver>,
    wallet_observer: Arc<dyn ExplorerObserver>,
}

impl NodeBridge {
    /// Build an explorer over `node`, subscribe `wallet` to it, and
    /// subscribe the explorer to the node's notifications.
    pub fn connect(node: Arc<dyn NodeClient>, wallet: Arc<Wallet>) -> Self {
        let explorer = Arc::new(BlockchainExplorer::new(node.clone()));
        let wallet_observer: Arc<dyn ExplorerObserver> = wallet;
        explorer.add_observer(wallet_observer.clone());

        let forwarder: Arc<dyn NodeObserver> =
            Arc::new(NodeEventForwarder::new(explorer.clone()));
        node.add_observer(forwarder.clone());

        Self {
            node,
            explorer,
            forwarder,
            wallet_observer,
        }
    }

    /// The explorer in the middle of the pipeline.
    pub fn explorer(&self) -> &Arc<BlockchainExplorer> {
        &self.explorer
    }

    /// Unregister both observers. Idempotent.
    pub fn disconnect(&self) {
        self.node.remove_observer(&self.forwarder);
        self.explorer.remove_observer(&self.wallet_observer);
    }
}

impl Drop for NodeBridge {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockNode;
    use crate::WalletEvent;
    use std::time::Duration;
    use umb_account_keys::Address;
    use umb_transaction_core::{Currency, Transaction, TransactionBuilder};

    fn test_currency() -> Currency {
        Currency {
            minimum_fee: 1,
            default_dust_threshold: 1,
            ..Currency::default()
        }
    }

    fn pay_to(address: &str, amounts: &[u64]) -> Transaction {
        let address = Address::from_string(address).unwrap();
        let mut builder = TransactionBuilder::new(&mut rand_core::OsRng);
        builder.add_base_input(0);
        for &amount in amounts {
            builder.add_key_output(amount, &address);
        }
        builder.build().unwrap()
    }

    fn outputs_only(address: &str, amounts: &[u64]) -> Transaction {
        let address = Address::from_string(address).unwrap();
        let mut builder = TransactionBuilder::new(&mut rand_core::OsRng);
        for &amount in amounts {
            builder.add_key_output(amount, &address);
        }
        builder.build().unwrap()
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn pool_notifications_reach_the_wallet() {
        let node = Arc::new(MockNode::new());
        let wallet = Arc::new(Wallet::new(test_currency(), node.clone(), 0));
        wallet.initialize("pw").unwrap();
        let address = wallet.create_address().unwrap();
        let _bridge = NodeBridge::connect(node.clone(), wallet.clone());

        let details = node.add_pool_transaction(outputs_only(&address, &[5]));
        {
            let wallet = wallet.clone();
            wait_for(move || wallet.pending_balance().unwrap() == 5).await;
        }

        node.remove_pool_transaction(&details.hash);
        {
            let wallet = wallet.clone();
            wait_for(move || wallet.pending_balance().unwrap() == 0).await;
        }
    }

    #[tokio::test]
    async fn block_notifications_reach_the_wallet() {
        let node = Arc::new(MockNode::new());
        let wallet = Arc::new(Wallet::new(test_currency(), node.clone(), 0));
        wallet.initialize("pw").unwrap();
        let address = wallet.create_address().unwrap();
        let _bridge = NodeBridge::connect(node.clone(), wallet.clone());

        node.add_block(vec![pay_to(&address, &[10])]);
        {
            let wallet = wallet.clone();
            wait_for(move || wallet.actual_balance().unwrap() == 10).await;
        }
        assert_eq!(
            wallet.get_event().await.unwrap(),
            WalletEvent::TransactionCreated { transaction_id: 0 }
        );

        // The node's "synchronized" push surfaces as a completion event,
        // after whatever progress events the block processing queued.
        node.notify_synchronized();
        loop {
            match tokio::time::timeout(Duration::from_millis(500), wallet.get_event()).await {
                Ok(Ok(WalletEvent::SyncCompleted)) => break,
                Ok(Ok(_)) => continue,
                other => panic!("completion event never arrived: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn disconnect_stops_the_flow() {
        let node = Arc::new(MockNode::new());
        let wallet = Arc::new(Wallet::new(test_currency(), node.clone(), 0));
        wallet.initialize("pw").unwrap();
        let address = wallet.create_address().unwrap();
        let bridge = NodeBridge::connect(node.clone(), wallet.clone());
        bridge.disconnect();

        node.add_pool_transaction(outputs_only(&address, &[5]));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(wallet.pending_balance().unwrap(), 0);
    }
}
