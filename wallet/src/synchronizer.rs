//! The blockchain synchronizer.
//!
//! Holds one subscription per wallet address and replays chain and pool
//! activity into the per-address transfer containers, reporting everything
//! it did through [`SynchronizerObserver`] callbacks. Callbacks for a given
//! subscription are serialized: one `synchronize` pass runs at a time and
//! walks blocks in order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};
use umb_account_keys::Address;
use umb_crypto_keys::{PrivateKey, PublicKey};
use umb_crypto_ring_signature::{
    derive_public_key, derive_secret_key, generate_key_derivation, generate_key_image, KeyImage,
};
use umb_transaction_core::{
    find_outputs_to_account, get_transaction_public_key, parse_extra, Hash, OutputTarget,
    UnknownTagPolicy,
};

use crate::container::{
    IncomingTransfer, OutputType, TransferBlockInfo, TransfersContainer, UNCONFIRMED_GLOBAL_INDEX,
    UNCONFIRMED_HEIGHT,
};
use crate::error::{ContainerError, NodeError};
use crate::node::{BlockDetails, NodeClient, TransactionDetails};

/// Key material of one subscription. `spend_secret` is absent for tracking
/// (view-only) wallets.
#[derive(Clone)]
pub struct SubscriptionKeys {
    /// The subscribed address.
    pub address: Address,
    /// The shared view secret.
    pub view_secret: PrivateKey,
    /// The spend secret; `None` in tracking mode.
    pub spend_secret: Option<PrivateKey>,
}

/// One subscribed address with its container.
#[derive(Clone)]
pub struct Subscription {
    /// Keys of the address.
    pub keys: SubscriptionKeys,
    /// Blocks below this height are not scanned for this address.
    pub sync_start_height: u32,
    /// Timestamp matching `sync_start_height`.
    pub sync_start_timestamp: u64,
    /// The address's output-tracking engine.
    pub container: Arc<TransfersContainer>,
}

/// Callbacks from the synchronizer into the wallet.
pub trait SynchronizerObserver: Send + Sync {
    /// `processed` of `total` blocks have been handled.
    fn on_synchronization_progress_updated(&self, processed: u32, total: u32);
    /// A synchronize pass finished.
    fn on_synchronization_completed(&self);
    /// `tx_hash` was added to or changed in the container of `subscription`.
    fn on_transaction_updated(&self, subscription: &PublicKey, tx_hash: &Hash);
    /// `tx_hash` was removed from the container of `subscription`.
    fn on_transaction_deleted(&self, subscription: &PublicKey, tx_hash: &Hash);
    /// Processing failed for `subscription` at `height`.
    fn on_error(&self, subscription: &PublicKey, height: u32, error: NodeError);
}

/// Drives transfer containers from node data.
pub struct BlockchainSynchronizer {
    node: Arc<dyn NodeClient>,
    subscriptions: Mutex<HashMap<PublicKey, Subscription>>,
    started: AtomicBool,
    batch_size: u32,
}

impl BlockchainSynchronizer {
    /// Create a synchronizer over `node`.
    pub fn new(node: Arc<dyn NodeClient>) -> Self {
        Self {
            node,
            subscriptions: Mutex::new(HashMap::new()),
            started: AtomicBool::new(false),
            batch_size: 100,
        }
    }

    /// Register or replace a subscription, keyed by the spend public key.
    pub fn subscribe(&self, subscription: Subscription) {
        let key = *subscription.keys.address.spend_public_key();
        self.subscriptions.lock().unwrap().insert(key, subscription);
    }

    /// Remove a subscription.
    pub fn unsubscribe(&self, spend_public: &PublicKey) -> bool {
        self.subscriptions
            .lock()
            .unwrap()
            .remove(spend_public)
            .is_some()
    }

    /// Number of registered subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.lock().unwrap().len()
    }

    /// Allow `synchronize` passes.
    pub fn start(&self) {
        self.started.store(true, Ordering::SeqCst);
    }

    /// Forbid further `synchronize` passes.
    pub fn stop(&self) {
        self.started.store(false, Ordering::SeqCst);
    }

    /// Whether the synchronizer is started.
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    fn snapshot_subscriptions(&self) -> Vec<(PublicKey, Subscription)> {
        self.subscriptions
            .lock()
            .unwrap()
            .iter()
            .map(|(key, sub)| (*key, sub.clone()))
            .collect()
    }

    /// One synchronization pass: walk the chain from the lowest container
    /// height to the node's top, then report completion.
    pub async fn synchronize(&self, observer: &dyn SynchronizerObserver) {
        if !self.is_started() {
            return;
        }
        let subscriptions = self.snapshot_subscriptions();
        if subscriptions.is_empty() {
            return;
        }

        let top = self.node.get_last_local_block_height();
        let mut from = u32::MAX;
        for (_, sub) in &subscriptions {
            let height = sub.container.current_height();
            let start = if height == 0 {
                self.resolve_sync_start(sub).await
            } else {
                height + 1
            };
            from = from.min(start);
        }

        let mut height = from;
        while height <= top {
            let batch_end = height
                .saturating_add(self.batch_size)
                .min(top.saturating_add(1));
            let blocks = match self.node.get_blocks_by_range(height..batch_end).await {
                Ok(blocks) => blocks,
                Err(err) => {
                    warn!(%err, height, "block fetch failed, aborting synchronize pass");
                    for (key, _) in &subscriptions {
                        observer.on_error(key, height, err.clone());
                    }
                    return;
                }
            };

            for per_height in blocks {
                for details in per_height.into_iter().filter(|block| !block.is_alternative) {
                    self.process_confirmed_block(&subscriptions, &details, observer);
                }
            }

            height = batch_end;
            observer.on_synchronization_progress_updated(height.saturating_sub(1).min(top), top);
        }

        observer.on_synchronization_completed();
    }

    /// The first height worth scanning for a fresh subscription: the oldest
    /// block at or after the subscription's start timestamp, found through
    /// the node's timestamp index. Falls back to the configured start height
    /// when the node has nothing in that range.
    async fn resolve_sync_start(&self, sub: &Subscription) -> u32 {
        if sub.sync_start_timestamp == 0 {
            return sub.sync_start_height;
        }
        let begin = sub.sync_start_timestamp;
        let hashes = match self
            .node
            .get_block_hashes_by_timestamps(begin, u64::MAX - begin)
            .await
        {
            Ok(hashes) if !hashes.is_empty() => hashes,
            _ => return sub.sync_start_height,
        };
        match self.node.get_blocks_by_hashes(&hashes).await {
            Ok(blocks) => blocks
                .iter()
                .map(|block| block.height)
                .min()
                .map(|height| height.max(sub.sync_start_height))
                .unwrap_or(sub.sync_start_height),
            Err(err) => {
                debug!(%err, "sync start resolution failed, using the configured height");
                sub.sync_start_height
            }
        }
    }

    fn process_confirmed_block(
        &self,
        subscriptions: &[(PublicKey, Subscription)],
        details: &BlockDetails,
        observer: &dyn SynchronizerObserver,
    ) {
        for (key, sub) in subscriptions {
            if details.height < sub.sync_start_height
                || (sub.container.current_height() > 0
                    && details.height <= sub.container.current_height())
            {
                continue;
            }

            for (tx_index, tx_details) in details.transactions.iter().enumerate() {
                let block_info = TransferBlockInfo {
                    height: details.height,
                    timestamp: details.timestamp,
                    transaction_index: tx_index as u32,
                };
                self.process_transaction(key, sub, &block_info, tx_details, observer);
            }
            sub.container.advance_height(details.height);
        }
    }

    /// Process blocks that were already fetched by someone else (the
    /// explorer's push notifications), oldest first.
    pub fn process_blocks(&self, blocks: &[BlockDetails], observer: &dyn SynchronizerObserver) {
        let subscriptions = self.snapshot_subscriptions();
        if subscriptions.is_empty() {
            return;
        }
        let mut mainchain: Vec<&BlockDetails> = blocks
            .iter()
            .filter(|block| !block.is_alternative)
            .collect();
        mainchain.sort_by_key(|block| block.height);
        for details in mainchain {
            self.process_confirmed_block(&subscriptions, details, observer);
        }
    }

    /// Feed pool additions into every matching container.
    pub fn process_pool_added(
        &self,
        added: &[TransactionDetails],
        observer: &dyn SynchronizerObserver,
    ) {
        let subscriptions = self.snapshot_subscriptions();
        for (key, sub) in &subscriptions {
            for tx_details in added {
                let block_info = TransferBlockInfo::unconfirmed();
                self.process_transaction(key, sub, &block_info, tx_details, observer);
            }
        }
    }

    /// Remove pool transactions which disappeared without being mined.
    pub fn process_pool_deleted(&self, hashes: &[Hash], observer: &dyn SynchronizerObserver) {
        let subscriptions = self.snapshot_subscriptions();
        for (key, sub) in &subscriptions {
            for hash in hashes {
                if sub.container.delete_unconfirmed_transaction(hash) {
                    observer.on_transaction_deleted(key, hash);
                }
            }
        }
    }

    /// Roll every container back before `height`, reporting the removed
    /// transactions.
    pub fn detach(&self, height: u32, observer: &dyn SynchronizerObserver) {
        let subscriptions = self.snapshot_subscriptions();
        for (key, sub) in &subscriptions {
            for hash in sub.container.detach(height) {
                observer.on_transaction_deleted(key, &hash);
            }
        }
    }

    fn process_transaction(
        &self,
        key: &PublicKey,
        sub: &Subscription,
        block_info: &TransferBlockInfo,
        tx_details: &TransactionDetails,
        observer: &dyn SynchronizerObserver,
    ) {
        let container = &sub.container;
        let confirmed = block_info.height != UNCONFIRMED_HEIGHT;

        // A known unconfirmed transaction showing up in a block is a
        // confirmation, not a new transaction.
        if confirmed {
            if let Some((record, _, _)) = container.get_transaction_information(&tx_details.hash) {
                if record.block_height == UNCONFIRMED_HEIGHT {
                    match container.mark_transaction_confirmed(
                        block_info,
                        &tx_details.hash,
                        &tx_details.output_global_indexes,
                    ) {
                        Ok(true) => observer.on_transaction_updated(key, &tx_details.hash),
                        Ok(false) => {}
                        Err(err) => {
                            warn!(%err, tx = %hex::encode(&tx_details.hash[..8]),
                                "confirmation failed");
                            observer.on_error(
                                key,
                                block_info.height,
                                NodeError::BadResponse(err.to_string()),
                            );
                        }
                    }
                }
                return;
            }
        }

        let transfers =
            match self.collect_transfers(&sub.keys, tx_details, confirmed) {
                Ok(transfers) => transfers,
                Err(err) => {
                    observer.on_error(key, block_info.height, err);
                    return;
                }
            };

        match container.add_transaction(block_info, &tx_details.transaction, &transfers) {
            Ok(true) => observer.on_transaction_updated(key, &tx_details.hash),
            Ok(false) => {}
            Err(ContainerError::DuplicateTransaction) => {
                debug!(tx = %hex::encode(&tx_details.hash[..8]), "transaction already tracked");
            }
            Err(err) => {
                warn!(%err, tx = %hex::encode(&tx_details.hash[..8]), "add_transaction failed");
                observer.on_error(
                    key,
                    block_info.height,
                    NodeError::BadResponse(err.to_string()),
                );
            }
        }
    }

    fn collect_transfers(
        &self,
        keys: &SubscriptionKeys,
        tx_details: &TransactionDetails,
        confirmed: bool,
    ) -> Result<Vec<IncomingTransfer>, NodeError> {
        let prefix = &tx_details.transaction.prefix;
        let found = find_outputs_to_account(
            prefix,
            keys.address.spend_public_key(),
            &keys.view_secret,
        );
        if found.is_empty() {
            return Ok(Vec::new());
        }

        let tx_public = parse_extra(&prefix.extra, UnknownTagPolicy::OpaqueTail)
            .ok()
            .and_then(|fields| get_transaction_public_key(&fields))
            .and_then(|bytes| PublicKey::try_from(&bytes[..]).ok())
            .ok_or_else(|| {
                NodeError::BadResponse("owned output in a transaction without a key".into())
            })?;

        let mut transfers = Vec::with_capacity(found.len());
        for index in found {
            let output = &prefix.outputs[index as usize];
            let global_output_index = if confirmed {
                *tx_details
                    .output_global_indexes
                    .get(index as usize)
                    .ok_or_else(|| {
                        NodeError::BadResponse("missing global output indexes".into())
                    })?
            } else {
                UNCONFIRMED_GLOBAL_INDEX
            };

            let transfer = match &output.target {
                OutputTarget::Key(key_output) => IncomingTransfer {
                    output_type: OutputType::Key,
                    amount: output.amount,
                    global_output_index,
                    output_in_transaction: index,
                    transaction_public_key: tx_public,
                    output_key: Some(key_output.key),
                    required_signatures: 0,
                    key_image: Some(self.key_image_for(keys, &tx_public, index, &key_output.key)),
                },
                OutputTarget::Multisig(multisig) => IncomingTransfer {
                    output_type: OutputType::Multisig,
                    amount: output.amount,
                    global_output_index,
                    output_in_transaction: index,
                    transaction_public_key: tx_public,
                    output_key: None,
                    required_signatures: multisig.required,
                    key_image: None,
                },
            };
            transfers.push(transfer);
        }
        Ok(transfers)
    }

    /// The key image of an owned output. Tracking wallets cannot compute the
    /// real image (that needs the spend secret), so they substitute the
    /// one-time key itself; spends of such rows are invisible to them, which
    /// is inherent to view-only wallets.
    fn key_image_for(
        &self,
        keys: &SubscriptionKeys,
        tx_public: &PublicKey,
        output_index: u32,
        output_key: &PublicKey,
    ) -> KeyImage {
        match &keys.spend_secret {
            Some(spend_secret) => {
                let derivation = generate_key_derivation(tx_public, &keys.view_secret);
                let ephemeral_secret =
                    derive_secret_key(&derivation, output_index, spend_secret);
                let ephemeral_public = derive_public_key(
                    &derivation,
                    output_index,
                    keys.address.spend_public_key(),
                );
                generate_key_image(&ephemeral_public, &ephemeral_secret)
            }
            None => KeyImage::from(output_key.to_bytes()),
        }
    }
}
