//! The wallet core.
//!
//! Orchestrates address lifecycle, the transfer pipeline, fusion
//! transactions, and the reconciliation of wallet state against blockchain
//! and pool notifications delivered by the synchronizer. At most one
//! transfer is in flight at a time; every failure after spent-output markers
//! are placed rolls them back before surfacing.

use std::collections::{HashMap, HashSet};
use std::io::{Read, Write};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use umb_account_keys::{AccountKeys, Address};
use umb_crypto_keys::{KeyPair, PrivateKey, PublicKey};
use umb_crypto_ring_signature::KeyImage;
use umb_transaction_core::{
    decompose_amount_into_digits, Currency, GlobalOutputEntry, Hash, InputKeyInfo,
    RealOutputInfo, TransactionBuilder,
};

use crate::container::{
    flags, TransferOutput, TransfersContainer, UNCONFIRMED_HEIGHT,
};
use crate::error::{NodeError, WalletError};
use crate::events::{EventQueue, WalletEvent};
use crate::explorer::{ExplorerObserver, PoolRemovalReason};
use crate::node::{BlockDetails, NodeClient};
use crate::synchronizer::{
    BlockchainSynchronizer, Subscription, SubscriptionKeys, SynchronizerObserver,
};

const WALLET_STORAGE_VERSION: u32 = 1;

/// Scan this far back in time before an address's creation.
const SYNC_GRACE_SECONDS: u64 = 60 * 60 * 24;

/// Largest output count of a fusion transaction.
const MAX_FUSION_OUTPUT_COUNT: usize = 4;

/// Lifecycle state of a wallet transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WalletTransactionState {
    /// Known to be on chain or accepted by the pool.
    Succeeded,
    /// Created but not (yet) accepted.
    Failed,
    /// Removed from the pool without being mined.
    Cancelled,
    /// Relay in progress.
    Sending,
    /// Removed from the wallet.
    Deleted,
}

/// One entry of the wallet's transaction log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WalletTransaction {
    /// Lifecycle state.
    pub state: WalletTransactionState,
    /// When the wallet first saw the transaction.
    pub creation_time: u64,
    /// The transaction's unlock time.
    pub unlock_time: u64,
    /// Containing block height, or the unconfirmed sentinel.
    pub block_height: u32,
    /// Containing block timestamp.
    pub timestamp: u64,
    /// The raw extra field.
    pub extra: Vec<u8>,
    /// The fee.
    pub fee: u64,
    /// The transaction hash.
    pub hash: Hash,
    /// Net amount from this wallet's point of view.
    pub total_amount: i64,
    /// Whether the transaction is a coinbase.
    pub is_base: bool,
}

/// One destination of an outgoing transfer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferDestination {
    /// The recipient address in its string form.
    pub address: String,
    /// The amount to send.
    pub amount: u64,
}

/// Parameters of [`Wallet::transfer`].
#[derive(Clone, Debug)]
pub struct TransferParams {
    /// Spend only from this address; `None` draws on every address.
    pub source_address: Option<String>,
    /// Where the money goes.
    pub destinations: Vec<TransferDestination>,
    /// The fee to pay.
    pub fee: u64,
    /// Decoys per ring input.
    pub mixin: usize,
    /// Raw bytes appended to the transaction extra.
    pub extra: Vec<u8>,
    /// Unlock time of the created outputs.
    pub unlock_time: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum WalletState {
    NotInitialized,
    Initialized,
}

struct WalletRecord {
    spend_public: PublicKey,
    spend_secret: Option<PrivateKey>,
    container: Arc<TransfersContainer>,
    creation_timestamp: u64,
    actual_balance: u64,
    pending_balance: u64,
}

struct UnlockJob {
    height: u32,
    wallet: PublicKey,
    tx_hash: Hash,
}

struct WalletInner {
    state: WalletState,
    password_hash: [u8; 32],
    view_keys: Option<KeyPair>,
    wallets: Vec<WalletRecord>,
    transactions: Vec<WalletTransaction>,
    transaction_index_by_hash: HashMap<Hash, usize>,
    transfers: Vec<(usize, TransferDestination)>,
    change: HashMap<Hash, u64>,
    spent_markers: HashSet<KeyImage>,
    unlock_jobs: Vec<UnlockJob>,
    fusion_txs_cache: HashMap<usize, bool>,
    stopped: bool,
}

struct SelectedOutput {
    wallet: PublicKey,
    row: TransferOutput,
}

/// The wallet.
pub struct Wallet {
    currency: Currency,
    spendable_age: u32,
    node: Arc<dyn NodeClient>,
    synchronizer: BlockchainSynchronizer,
    inner: Arc<Mutex<WalletInner>>,
    events: EventQueue,
    transfer_gate: tokio::sync::Mutex<()>,
}

fn password_hash(password: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"umbra-wallet-password");
    hasher.update(password.as_bytes());
    hasher.finalize().into()
}

fn unix_time() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

impl Wallet {
    /// Create a wallet over `node`. The wallet is unusable until
    /// [`Wallet::initialize`] or [`Wallet::load`].
    pub fn new(currency: Currency, node: Arc<dyn NodeClient>, spendable_age: u32) -> Self {
        let synchronizer = BlockchainSynchronizer::new(node.clone());
        Self {
            currency,
            spendable_age,
            node,
            synchronizer,
            inner: Arc::new(Mutex::new(WalletInner {
                state: WalletState::NotInitialized,
                password_hash: [0; 32],
                view_keys: None,
                wallets: Vec::new(),
                transactions: Vec::new(),
                transaction_index_by_hash: HashMap::new(),
                transfers: Vec::new(),
                change: HashMap::new(),
                spent_markers: HashSet::new(),
                unlock_jobs: Vec::new(),
                fusion_txs_cache: HashMap::new(),
                stopped: false,
            })),
            events: EventQueue::new(),
            transfer_gate: tokio::sync::Mutex::new(()),
        }
    }

    /// Initialize with a fresh view key pair.
    pub fn initialize(&self, password: &str) -> Result<(), WalletError> {
        let view_secret = PrivateKey::random(&mut rand_core::OsRng);
        self.initialize_with_view_key(view_secret, password)
    }

    /// Initialize, adopting an existing view secret key.
    pub fn initialize_with_view_key(
        &self,
        view_secret: PrivateKey,
        password: &str,
    ) -> Result<(), WalletError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != WalletState::NotInitialized {
            return Err(WalletError::AlreadyInitialized);
        }
        let view_public = PublicKey::from(&view_secret);
        inner.view_keys = Some(KeyPair {
            public: view_public,
            secret: view_secret,
        });
        inner.password_hash = password_hash(password);
        inner.state = WalletState::Initialized;
        info!("wallet initialized");
        Ok(())
    }

    /// Replace the password.
    pub fn change_password(&self, old: &str, new: &str) -> Result<(), WalletError> {
        let mut inner = self.lock_initialized()?;
        if inner.password_hash != password_hash(old) {
            return Err(WalletError::WrongPassword);
        }
        inner.password_hash = password_hash(new);
        Ok(())
    }

    /// Stop the wallet: wakes event waiters, public calls fail with
    /// `OperationCancelled` from here on.
    pub fn stop(&self) {
        self.inner.lock().unwrap().stopped = true;
        self.synchronizer.stop();
        self.events.stop();
    }

    fn lock_initialized(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, WalletInner>, WalletError> {
        let inner = self.inner.lock().unwrap();
        if inner.stopped {
            return Err(WalletError::OperationCancelled);
        }
        if inner.state != WalletState::Initialized {
            return Err(WalletError::NotInitialized);
        }
        Ok(inner)
    }

    // ------------------------------------------------------------------
    // Addresses
    // ------------------------------------------------------------------

    /// Create an address with a fresh spend key pair.
    pub fn create_address(&self) -> Result<String, WalletError> {
        let spend = KeyPair::generate(&mut rand_core::OsRng);
        self.do_create_address(spend.public, Some(spend.secret))
    }

    /// Create an address from an existing spend secret.
    pub fn create_address_with_spend_secret(
        &self,
        spend_secret: PrivateKey,
    ) -> Result<String, WalletError> {
        let spend_public = PublicKey::from(&spend_secret);
        self.do_create_address(spend_public, Some(spend_secret))
    }

    /// Create a tracking (view-only) address from a spend public key.
    pub fn create_address_with_spend_public(
        &self,
        spend_public: PublicKey,
    ) -> Result<String, WalletError> {
        self.do_create_address(spend_public, None)
    }

    fn do_create_address(
        &self,
        spend_public: PublicKey,
        spend_secret: Option<PrivateKey>,
    ) -> Result<String, WalletError> {
        let mut inner = self.lock_initialized()?;

        // Tracking and spending addresses never mix within one wallet.
        if let Some(first) = inner.wallets.first() {
            if first.spend_secret.is_none() != spend_secret.is_none() {
                return Err(WalletError::BadAddress);
            }
        }
        if inner
            .wallets
            .iter()
            .any(|record| record.spend_public == spend_public)
        {
            return Err(WalletError::AddressAlreadyExists);
        }

        let view_keys = inner.view_keys.clone().ok_or(WalletError::NotInitialized)?;
        let address = Address::new(spend_public, view_keys.public);
        let creation_timestamp = unix_time();
        let container = Arc::new(TransfersContainer::new(
            self.currency.clone(),
            self.spendable_age,
        ));

        inner.wallets.push(WalletRecord {
            spend_public,
            spend_secret: spend_secret.clone(),
            container: container.clone(),
            creation_timestamp,
            actual_balance: 0,
            pending_balance: 0,
        });
        drop(inner);

        let restart = self.synchronizer.subscription_count() > 0;
        if restart {
            self.synchronizer.stop();
        }
        self.synchronizer.subscribe(Subscription {
            keys: SubscriptionKeys {
                address,
                view_secret: view_keys.secret,
                spend_secret,
            },
            sync_start_height: 0,
            sync_start_timestamp: creation_timestamp.saturating_sub(SYNC_GRACE_SECONDS),
            container,
        });
        self.synchronizer.start();

        debug!(address = %address, "address created");
        Ok(address.to_string())
    }

    /// Remove an address and everything tracked for it.
    pub fn delete_address(&self, address: &str) -> Result<(), WalletError> {
        let parsed = Address::from_string(address).map_err(|_| WalletError::BadAddress)?;
        let spend_public = *parsed.spend_public_key();

        let mut inner = self.lock_initialized()?;
        let position = inner
            .wallets
            .iter()
            .position(|record| record.spend_public == spend_public)
            .ok_or(WalletError::AddressNotFound)?;
        inner.wallets.remove(position);
        drop(inner);

        self.synchronizer.stop();
        self.synchronizer.unsubscribe(&spend_public);
        if self.synchronizer.subscription_count() > 0 {
            self.synchronizer.start();
        }
        Ok(())
    }

    /// All addresses, in creation order.
    pub fn get_addresses(&self) -> Result<Vec<String>, WalletError> {
        let inner = self.lock_initialized()?;
        let view_public = inner
            .view_keys
            .as_ref()
            .map(|keys| keys.public)
            .ok_or(WalletError::NotInitialized)?;
        Ok(inner
            .wallets
            .iter()
            .map(|record| Address::new(record.spend_public, view_public).to_string())
            .collect())
    }

    /// The address at `index` in creation order.
    pub fn get_address(&self, index: usize) -> Result<String, WalletError> {
        let addresses = self.get_addresses()?;
        addresses
            .get(index)
            .cloned()
            .ok_or(WalletError::IndexOutOfRange(index))
    }

    /// Whether the wallet is in tracking (view-only) mode.
    pub fn is_tracking(&self) -> Result<bool, WalletError> {
        let inner = self.lock_initialized()?;
        Ok(inner
            .wallets
            .first()
            .map(|record| record.spend_secret.is_none())
            .unwrap_or(false))
    }

    // ------------------------------------------------------------------
    // Balances and transactions
    // ------------------------------------------------------------------

    /// Spendable balance across all addresses.
    pub fn actual_balance(&self) -> Result<u64, WalletError> {
        let inner = self.lock_initialized()?;
        Ok(inner.wallets.iter().map(|record| record.actual_balance).sum())
    }

    /// Locked and soft-locked balance across all addresses.
    pub fn pending_balance(&self) -> Result<u64, WalletError> {
        let inner = self.lock_initialized()?;
        Ok(inner
            .wallets
            .iter()
            .map(|record| record.pending_balance)
            .sum())
    }

    /// Number of entries in the transaction log.
    pub fn get_transaction_count(&self) -> Result<usize, WalletError> {
        Ok(self.lock_initialized()?.transactions.len())
    }

    /// One entry of the transaction log.
    pub fn get_transaction(&self, transaction_id: usize) -> Result<WalletTransaction, WalletError> {
        let inner = self.lock_initialized()?;
        inner
            .transactions
            .get(transaction_id)
            .cloned()
            .ok_or(WalletError::IndexOutOfRange(transaction_id))
    }

    /// Whether the transaction at `transaction_id` is a fusion transaction.
    pub fn is_fusion_transaction(&self, transaction_id: usize) -> Result<bool, WalletError> {
        let inner = self.lock_initialized()?;
        if transaction_id >= inner.transactions.len() {
            return Err(WalletError::IndexOutOfRange(transaction_id));
        }
        Ok(inner
            .fusion_txs_cache
            .get(&transaction_id)
            .copied()
            .unwrap_or(false))
    }

    /// Wait for the next wallet event.
    pub async fn get_event(&self) -> Result<WalletEvent, WalletError> {
        self.events.pop().await
    }

    /// Hashes of transactions carrying `payment_id`, as known by the node.
    pub async fn get_transaction_hashes_by_payment_id(
        &self,
        payment_id: Hash,
    ) -> Result<Vec<Hash>, WalletError> {
        self.lock_initialized()?;
        Ok(self
            .node
            .get_transaction_hashes_by_payment_id(payment_id)
            .await?)
    }

    /// Full transaction details from the node.
    pub async fn get_transactions(
        &self,
        hashes: &[Hash],
    ) -> Result<Vec<crate::node::TransactionDetails>, WalletError> {
        self.lock_initialized()?;
        Ok(self.node.get_transactions(hashes).await?)
    }

    /// Run one synchronization pass against the node.
    pub async fn synchronize(&self) {
        self.synchronizer.synchronize(self).await;
    }

    /// Feed pool changes into the wallet. The wallet's [`ExplorerObserver`]
    /// implementation routes the explorer's `pool_updated` here; callers
    /// driving the wallet without an explorer may invoke it directly.
    pub fn on_pool_updated(
        &self,
        added: &[crate::node::TransactionDetails],
        removed_hashes: &[Hash],
    ) {
        self.synchronizer.process_pool_added(added, self);
        self.synchronizer.process_pool_deleted(removed_hashes, self);
    }

    /// Roll all containers back before `height`. The wallet's
    /// [`ExplorerObserver`] implementation calls this when re-announced
    /// blocks reveal a switch to another branch.
    pub fn on_chain_switched(&self, height: u32) {
        self.synchronizer.detach(height, self);
    }

    // ------------------------------------------------------------------
    // Transfer pipeline
    // ------------------------------------------------------------------

    /// Send money. Returns the id of the new transaction log entry.
    pub async fn transfer(&self, params: TransferParams) -> Result<usize, WalletError> {
        let _gate = self.transfer_gate.lock().await;

        let (destinations, needed) = self.validate_transfer(&params)?;
        let source = match &params.source_address {
            Some(address) => Some(
                *Address::from_string(address)
                    .map_err(|_| WalletError::BadAddress)?
                    .spend_public_key(),
            ),
            None => None,
        };

        let dust_threshold = self.currency.default_dust_threshold;
        let (selected, found_money) =
            self.select_transfers(source, needed, params.mixin == 0, dust_threshold)?;
        debug_assert!(found_money >= needed);

        self.build_and_send(
            &params,
            destinations,
            needed,
            found_money,
            selected,
            dust_threshold,
            false,
        )
        .await
    }

    fn validate_transfer(
        &self,
        params: &TransferParams,
    ) -> Result<(Vec<(Address, u64)>, u64), WalletError> {
        let inner = self.lock_initialized()?;
        if inner
            .wallets
            .first()
            .map(|record| record.spend_secret.is_none())
            .unwrap_or(false)
        {
            return Err(WalletError::TrackingMode);
        }
        drop(inner);

        if params.fee < self.currency.minimum_fee {
            return Err(WalletError::FeeTooSmall);
        }
        if params.destinations.is_empty() {
            return Err(WalletError::ZeroDestination);
        }

        let mut destinations = Vec::with_capacity(params.destinations.len());
        let mut needed: u64 = params.fee;
        for destination in &params.destinations {
            if destination.amount == 0 {
                return Err(WalletError::ZeroDestination);
            }
            let address = Address::from_string(&destination.address)
                .map_err(|_| WalletError::BadAddress)?;
            needed = needed
                .checked_add(destination.amount)
                .ok_or(WalletError::SumOverflow)?;
            destinations.push((address, destination.amount));
        }
        Ok((destinations, needed))
    }

    /// Randomized source selection per the wallet policy: sample wallets and
    /// outputs uniformly, skipping dust unless allowed; at most one dust
    /// output is appended at the end to top the sum up.
    fn select_transfers(
        &self,
        source: Option<PublicKey>,
        needed: u64,
        dust_allowed: bool,
        dust_threshold: u64,
    ) -> Result<(Vec<SelectedOutput>, u64), WalletError> {
        let inner = self.lock_initialized()?;
        if let Some(source) = &source {
            if !inner
                .wallets
                .iter()
                .any(|record| record.spend_public == *source)
            {
                return Err(WalletError::AddressNotFound);
            }
        }

        let mut per_wallet: Vec<(PublicKey, Vec<TransferOutput>)> = Vec::new();
        for record in &inner.wallets {
            if let Some(source) = &source {
                if record.spend_public != *source {
                    continue;
                }
            }
            let outputs: Vec<TransferOutput> = record
                .container
                .get_outputs(flags::INCLUDE_KEY_UNLOCKED)
                .into_iter()
                .filter(|row| {
                    row.key_image
                        .map(|image| !inner.spent_markers.contains(&image))
                        .unwrap_or(false)
                })
                .collect();
            if !outputs.is_empty() {
                per_wallet.push((record.spend_public, outputs));
            }
        }
        drop(inner);

        let mut rng = rand::thread_rng();
        let mut selected = Vec::new();
        let mut dust_candidates: Vec<SelectedOutput> = Vec::new();
        let mut found: u64 = 0;

        while found < needed && !per_wallet.is_empty() {
            let wallet_index = rng.gen_range(0..per_wallet.len());
            let (wallet, outputs) = &mut per_wallet[wallet_index];
            let output_index = rng.gen_range(0..outputs.len());
            let row = outputs.swap_remove(output_index);
            let wallet = *wallet;
            if outputs.is_empty() {
                per_wallet.swap_remove(wallet_index);
            }

            if row.amount > dust_threshold || dust_allowed {
                found += row.amount;
                selected.push(SelectedOutput { wallet, row });
            } else {
                dust_candidates.push(SelectedOutput { wallet, row });
            }
        }

        if found < needed && !dust_allowed {
            if let Some(dust) = dust_candidates.pop() {
                found += dust.row.amount;
                selected.push(dust);
            }
        }

        if found < needed {
            return Err(WalletError::InsufficientFunds);
        }
        Ok((selected, found))
    }

    async fn prepare_inputs(
        &self,
        selected: &[SelectedOutput],
        mixin: usize,
    ) -> Result<Vec<InputKeyInfo>, WalletError> {
        let mut decoys_per_input: Vec<Vec<GlobalOutputEntry>> =
            vec![Vec::new(); selected.len()];

        if mixin > 0 {
            let amounts: Vec<u64> = selected.iter().map(|output| output.row.amount).collect();
            let random_outs = self
                .node
                .get_random_outs_by_amounts(amounts, mixin)
                .await?;
            if random_outs.len() != selected.len() {
                return Err(WalletError::MixinCountTooBig);
            }
            for (input_index, outs) in random_outs.into_iter().enumerate() {
                if outs.outs.len() < mixin {
                    return Err(WalletError::MixinCountTooBig);
                }
                decoys_per_input[input_index] = outs
                    .outs
                    .into_iter()
                    .map(|entry| GlobalOutputEntry {
                        index: entry.global_index,
                        key: entry.output_key,
                    })
                    .collect();
            }
        }

        let mut inputs = Vec::with_capacity(selected.len());
        for (selected_output, decoys) in selected.iter().zip(decoys_per_input) {
            let row = &selected_output.row;
            let real_key = row
                .output_key
                .ok_or_else(|| {
                    WalletError::InternalWalletError("selected row has no output key".into())
                })?;

            let mut ring: Vec<GlobalOutputEntry> = decoys
                .into_iter()
                .filter(|decoy| decoy.index != row.global_output_index)
                .take(mixin)
                .collect();
            ring.sort_by_key(|entry| entry.index);
            let position = ring
                .iter()
                .position(|entry| entry.index > row.global_output_index)
                .unwrap_or(ring.len());
            ring.insert(
                position,
                GlobalOutputEntry {
                    index: row.global_output_index,
                    key: real_key,
                },
            );

            inputs.push(InputKeyInfo {
                amount: row.amount,
                outputs: ring,
                real_output: RealOutputInfo {
                    transaction_public_key: row.transaction_public_key,
                    index_in_ring: position,
                    output_in_transaction: row.output_in_transaction,
                },
            });
        }
        Ok(inputs)
    }

    /// Shared tail of `transfer` and `create_fusion_transaction`: build,
    /// sign, persist intent, relay, commit.
    #[allow(clippy::too_many_arguments)]
    async fn build_and_send(
        &self,
        params: &TransferParams,
        destinations: Vec<(Address, u64)>,
        needed: u64,
        found_money: u64,
        selected: Vec<SelectedOutput>,
        dust_threshold: u64,
        is_fusion: bool,
    ) -> Result<usize, WalletError> {
        let inputs = self.prepare_inputs(&selected, params.mixin).await?;

        let change = found_money - needed;
        let change_address = self.change_address()?;

        let mut rng = rand_core::OsRng;
        let mut builder = TransactionBuilder::new(&mut rng);
        builder.set_unlock_time(params.unlock_time);
        if !params.extra.is_empty() {
            builder.append_extra(&params.extra);
        }

        for (address, amount) in &destinations {
            for chunk in decompose(*amount, dust_threshold) {
                builder.add_key_output(chunk, address);
            }
        }
        if change > 0 {
            for chunk in decompose(change, dust_threshold) {
                builder.add_key_output(chunk, &change_address);
            }
        }

        let accounts = self.spending_accounts(&selected)?;
        for (account, info) in accounts.iter().zip(&inputs) {
            builder.add_key_input(account, info)?;
        }
        builder.sign_inputs(&mut rng)?;
        let tx = builder.build()?;
        let tx_hash = tx.hash();

        if tx.binary_size() > self.currency.upper_transaction_size_limit {
            return Err(WalletError::TransactionSizeTooBig);
        }

        // Persist intent and place the spent-output markers; the guard rolls
        // the markers back unless the relay commits.
        let transaction_id = {
            let mut inner = self.lock_initialized()?;
            let transaction_id = inner.transactions.len();
            inner.transactions.push(WalletTransaction {
                state: WalletTransactionState::Failed,
                creation_time: unix_time(),
                unlock_time: params.unlock_time,
                block_height: UNCONFIRMED_HEIGHT,
                timestamp: 0,
                extra: params.extra.clone(),
                fee: params.fee,
                hash: tx_hash,
                total_amount: -(needed as i64),
                is_base: false,
            });
            inner.transaction_index_by_hash.insert(tx_hash, transaction_id);
            for (address, amount) in &destinations {
                inner.transfers.push((
                    transaction_id,
                    TransferDestination {
                        address: address.to_string(),
                        amount: *amount,
                    },
                ));
            }
            inner.fusion_txs_cache.insert(transaction_id, is_fusion);
            for output in &selected {
                if let Some(image) = output.row.key_image {
                    inner.spent_markers.insert(image);
                }
            }
            transaction_id
        };
        let mut marker_guard = SpentMarkerGuard::armed(
            self.inner.clone(),
            selected
                .iter()
                .filter_map(|output| output.row.key_image)
                .collect(),
        );

        if let Ok(mut inner) = self.lock_initialized() {
            inner.transactions[transaction_id].state = WalletTransactionState::Sending;
        }
        match self.node.relay_transaction(&tx).await {
            Ok(()) => {
                marker_guard.disarm();
                let mut inner = self.lock_initialized()?;
                inner.transactions[transaction_id].state = WalletTransactionState::Succeeded;
                if change > 0 {
                    inner.change.insert(tx_hash, change);
                }
                let touched: HashSet<PublicKey> =
                    selected.iter().map(|output| output.wallet).collect();
                for wallet in touched {
                    Self::refresh_balance(&mut inner, &wallet);
                }
                drop(inner);
                info!(
                    tx = %hex::encode(&tx_hash[..8]),
                    amount = needed,
                    fee = params.fee,
                    "transaction relayed"
                );
                self.events
                    .push(WalletEvent::TransactionCreated { transaction_id });
                Ok(transaction_id)
            }
            Err(err) => {
                // The guard has already dropped the markers by the time the
                // caller sees the error; the record goes back to Failed.
                drop(marker_guard);
                if let Ok(mut inner) = self.lock_initialized() {
                    inner.transactions[transaction_id].state = WalletTransactionState::Failed;
                }
                warn!(%err, tx = %hex::encode(&tx_hash[..8]), "relay failed");
                self.events
                    .push(WalletEvent::TransactionCreated { transaction_id });
                Err(WalletError::Node(err))
            }
        }
    }

    /// The address change goes back to: always the first wallet address.
    fn change_address(&self) -> Result<Address, WalletError> {
        let inner = self.lock_initialized()?;
        let view_public = inner
            .view_keys
            .as_ref()
            .ok_or(WalletError::NotInitialized)?
            .public;
        let first = inner.wallets.first().ok_or(WalletError::NotInitialized)?;
        Ok(Address::new(first.spend_public, view_public))
    }

    fn spending_accounts(
        &self,
        selected: &[SelectedOutput],
    ) -> Result<Vec<AccountKeys>, WalletError> {
        let inner = self.lock_initialized()?;
        let view_secret = inner
            .view_keys
            .as_ref()
            .ok_or(WalletError::NotInitialized)?
            .secret
            .clone();
        let mut accounts = Vec::with_capacity(selected.len());
        for output in selected {
            let record = inner
                .wallets
                .iter()
                .find(|record| record.spend_public == output.wallet)
                .ok_or(WalletError::AddressNotFound)?;
            let spend_secret = record
                .spend_secret
                .clone()
                .ok_or(WalletError::TrackingMode)?;
            accounts.push(AccountKeys::new(spend_secret, view_secret.clone()));
        }
        Ok(accounts)
    }

    // ------------------------------------------------------------------
    // Fusion transactions
    // ------------------------------------------------------------------

    /// Consolidate many small outputs into fewer large ones, fee-free.
    pub async fn create_fusion_transaction(
        &self,
        threshold: u64,
        mixin: usize,
    ) -> Result<usize, WalletError> {
        let _gate = self.transfer_gate.lock().await;

        if threshold <= self.currency.default_dust_threshold {
            return Err(WalletError::WrongAmount);
        }
        {
            let inner = self.lock_initialized()?;
            if inner.wallets.is_empty() {
                return Err(WalletError::NotInitialized);
            }
            if inner.wallets[0].spend_secret.is_none() {
                return Err(WalletError::TrackingMode);
            }
        }

        let max_inputs = Currency::approximate_maximum_input_count(
            self.currency.fusion_tx_max_size,
            MAX_FUSION_OUTPUT_COUNT,
            mixin,
        );
        if max_inputs < self.currency.fusion_tx_min_input_count {
            return Err(WalletError::MixinCountTooBig);
        }

        let mut selected =
            self.pick_random_fusion_inputs(threshold, max_inputs)?;
        if selected.len() < self.currency.fusion_tx_min_input_count {
            return Err(WalletError::WrongAmount);
        }
        // Sorted ascending so dropping the last input drops the largest.
        selected.sort_by_key(|output| output.row.amount);

        let dust_threshold = self.currency.default_dust_threshold;
        loop {
            let total: u64 = selected.iter().map(|output| output.row.amount).sum();
            let size = Self::estimate_fusion_size(&selected, total, mixin, dust_threshold);
            if size <= self.currency.fusion_tx_max_size {
                break;
            }
            selected.pop();
            if selected.len() < self.currency.fusion_tx_min_input_count {
                return Err(WalletError::InternalWalletError(
                    "unable to create fusion transaction under the size cap".into(),
                ));
            }
        }

        let total: u64 = selected.iter().map(|output| output.row.amount).sum();
        let change_address = self.change_address()?;

        let params = TransferParams {
            source_address: None,
            destinations: Vec::new(),
            fee: 0,
            mixin,
            extra: Vec::new(),
            unlock_time: 0,
        };
        self.build_and_send(
            &params,
            vec![(change_address, total)],
            total,
            total,
            selected,
            dust_threshold,
            true,
        )
        .await
    }

    /// Bucket candidate outputs by decimal magnitude and sample one bucket,
    /// mirroring the fusion input picker of the reference wallet.
    fn pick_random_fusion_inputs(
        &self,
        threshold: u64,
        max_inputs: usize,
    ) -> Result<Vec<SelectedOutput>, WalletError> {
        let inner = self.lock_initialized()?;

        let mut buckets: HashMap<u32, Vec<SelectedOutput>> = HashMap::new();
        for record in &inner.wallets {
            for row in record.container.get_outputs(flags::INCLUDE_KEY_UNLOCKED) {
                let spendable = row
                    .key_image
                    .map(|image| !inner.spent_markers.contains(&image))
                    .unwrap_or(false);
                if !spendable || row.amount >= threshold {
                    continue;
                }
                let magnitude = row.amount.ilog10();
                buckets.entry(magnitude).or_default().push(SelectedOutput {
                    wallet: record.spend_public,
                    row,
                });
            }
        }
        drop(inner);

        let mut eligible: Vec<Vec<SelectedOutput>> = buckets
            .into_values()
            .filter(|bucket| bucket.len() >= self.currency.fusion_tx_min_input_count)
            .collect();
        if eligible.is_empty() {
            return Ok(Vec::new());
        }

        let mut rng = rand::thread_rng();
        let bucket_index = rng.gen_range(0..eligible.len());
        let mut bucket = eligible.swap_remove(bucket_index);
        bucket.shuffle(&mut rng);
        bucket.truncate(max_inputs);
        Ok(bucket)
    }

    /// Approximate serialized size of the fusion transaction these inputs
    /// would build.
    fn estimate_fusion_size(
        selected: &[SelectedOutput],
        total: u64,
        mixin: usize,
        dust_threshold: u64,
    ) -> usize {
        let output_count = decompose(total, dust_threshold).len();
        Currency::approximate_transaction_size(selected.len(), output_count, mixin)
    }

    // ------------------------------------------------------------------
    // Balance maintenance
    // ------------------------------------------------------------------

    fn refresh_balance(inner: &mut WalletInner, wallet: &PublicKey) {
        let Some(position) = inner
            .wallets
            .iter()
            .position(|record| record.spend_public == *wallet)
        else {
            return;
        };
        let container = inner.wallets[position].container.clone();

        let actual: u64 = container
            .get_outputs(flags::INCLUDE_KEY_UNLOCKED)
            .into_iter()
            .filter(|row| {
                row.key_image
                    .map(|image| !inner.spent_markers.contains(&image))
                    .unwrap_or(true)
            })
            .map(|row| row.amount)
            .sum();
        let pending = container.balance(flags::INCLUDE_KEY_NOT_UNLOCKED);

        let record = &mut inner.wallets[position];
        record.actual_balance = actual;
        record.pending_balance = pending;
    }

    fn check_received_fusion(&self, inner: &WalletInner, tx_hash: &Hash) -> bool {
        let mut input_amounts = Vec::new();
        let mut output_amounts = Vec::new();
        let mut totals: Option<(u64, u64)> = None;

        for record in &inner.wallets {
            if let Some((info, _, _)) = record.container.get_transaction_information(tx_hash) {
                let fee = info.total_amount_in.saturating_sub(info.total_amount_out);
                if info.total_amount_in != 0 && fee != 0 {
                    return false;
                }
                totals = Some((info.total_amount_in, info.total_amount_out));
            }
            for row in record
                .container
                .get_transaction_outputs(tx_hash, flags::INCLUDE_ALL | flags::INCLUDE_STATE_SPENT)
            {
                output_amounts.push(row.amount);
            }
            for row in record
                .container
                .get_transaction_inputs(tx_hash, flags::INCLUDE_TYPE_ALL)
            {
                input_amounts.push(row.amount);
            }
        }

        let Some((total_in, total_out)) = totals else {
            return false;
        };
        input_amounts.sort_unstable();
        output_amounts.sort_unstable();
        input_amounts.iter().sum::<u64>() == total_in
            && output_amounts.iter().sum::<u64>() == total_out
            && self
                .currency
                .is_fusion_transaction(&input_amounts, &output_amounts, 0)
    }
}

/// Removes spent-output markers on drop unless disarmed.
struct SpentMarkerGuard {
    inner: Arc<Mutex<WalletInner>>,
    images: Vec<KeyImage>,
    armed: bool,
}

impl SpentMarkerGuard {
    fn armed(inner: Arc<Mutex<WalletInner>>, images: Vec<KeyImage>) -> Self {
        Self {
            inner,
            images,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for SpentMarkerGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        for image in &self.images {
            inner.spent_markers.remove(image);
        }
    }
}

fn decompose(amount: u64, dust_threshold: u64) -> Vec<u64> {
    let mut amounts = Vec::new();
    let mut dust = Vec::new();
    decompose_amount_into_digits(
        amount,
        dust_threshold,
        |chunk| amounts.push(chunk),
        |value| dust.push(value),
    );
    amounts.extend(dust);
    amounts
}

impl SynchronizerObserver for Wallet {
    fn on_synchronization_progress_updated(&self, processed: u32, total: u32) {
        self.events
            .push(WalletEvent::SyncProgressUpdated { processed, total });

        let mut unlocked_any = false;
        {
            let mut inner = self.inner.lock().unwrap();
            let boundary = processed.saturating_sub(1);
            let due: Vec<UnlockJob> = {
                let mut due = Vec::new();
                let mut index = 0;
                while index < inner.unlock_jobs.len() {
                    if inner.unlock_jobs[index].height <= boundary {
                        due.push(inner.unlock_jobs.swap_remove(index));
                    } else {
                        index += 1;
                    }
                }
                due
            };
            for job in due {
                Self::refresh_balance(&mut inner, &job.wallet);
                unlocked_any = true;
            }
        }
        if unlocked_any {
            self.events.push(WalletEvent::BalanceUnlocked);
        }
    }

    fn on_synchronization_completed(&self) {
        self.events.push(WalletEvent::SyncCompleted);
    }

    fn on_transaction_updated(&self, subscription: &PublicKey, tx_hash: &Hash) {
        let mut inner = self.inner.lock().unwrap();
        let Some(record) = inner
            .wallets
            .iter()
            .find(|record| record.spend_public == *subscription)
        else {
            return;
        };
        let container = record.container.clone();
        let Some((info, amount_in, amount_out)) = container.get_transaction_information(tx_hash)
        else {
            return;
        };

        // Inputs recognized by the container supersede the wallet's own
        // spent-output markers.
        for row in container.get_transaction_inputs(tx_hash, flags::INCLUDE_TYPE_ALL) {
            if let Some(image) = row.key_image {
                inner.spent_markers.remove(&image);
            }
        }

        let total_amount = amount_out as i64 - amount_in as i64;
        let fee = info.total_amount_in.saturating_sub(info.total_amount_out);
        let confirmed = info.block_height != UNCONFIRMED_HEIGHT;

        let event = match inner.transaction_index_by_hash.get(tx_hash).copied() {
            Some(transaction_id) => {
                let entry = &mut inner.transactions[transaction_id];
                entry.state = WalletTransactionState::Succeeded;
                entry.block_height = info.block_height;
                entry.timestamp = info.timestamp;
                entry.unlock_time = info.unlock_time;
                WalletEvent::TransactionUpdated { transaction_id }
            }
            None => {
                let transaction_id = inner.transactions.len();
                inner.transactions.push(WalletTransaction {
                    state: WalletTransactionState::Succeeded,
                    creation_time: unix_time(),
                    unlock_time: info.unlock_time,
                    block_height: info.block_height,
                    timestamp: info.timestamp,
                    extra: info.extra.clone(),
                    fee: if info.is_base { 0 } else { fee },
                    hash: *tx_hash,
                    total_amount,
                    is_base: info.is_base,
                });
                inner.transaction_index_by_hash.insert(*tx_hash, transaction_id);
                let is_fusion = self.check_received_fusion(&inner, tx_hash);
                inner.fusion_txs_cache.insert(transaction_id, is_fusion);
                WalletEvent::TransactionCreated { transaction_id }
            }
        };

        if confirmed {
            let unlock_height = if info.unlock_time < self.currency.max_block_height {
                info.unlock_time as u32
            } else {
                0
            };
            let job_height = (info.block_height + self.spendable_age).max(unlock_height);
            inner.unlock_jobs.push(UnlockJob {
                height: job_height,
                wallet: *subscription,
                tx_hash: *tx_hash,
            });
        }

        let wallet = *subscription;
        Self::refresh_balance(&mut inner, &wallet);
        drop(inner);
        self.events.push(event);
    }

    fn on_transaction_deleted(&self, subscription: &PublicKey, tx_hash: &Hash) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .unlock_jobs
            .retain(|job| !(job.wallet == *subscription && job.tx_hash == *tx_hash));
        inner.change.remove(tx_hash);

        let Some(transaction_id) = inner.transaction_index_by_hash.get(tx_hash).copied() else {
            let wallet = *subscription;
            Self::refresh_balance(&mut inner, &wallet);
            return;
        };
        let entry = &mut inner.transactions[transaction_id];
        entry.state = WalletTransactionState::Cancelled;
        entry.block_height = UNCONFIRMED_HEIGHT;
        entry.timestamp = 0;

        let wallet = *subscription;
        Self::refresh_balance(&mut inner, &wallet);
        drop(inner);
        self.events
            .push(WalletEvent::TransactionUpdated { transaction_id });
    }

    fn on_error(&self, subscription: &PublicKey, height: u32, error: NodeError) {
        warn!(
            wallet = %subscription,
            height,
            %error,
            "synchronizer error; will retry on the next pass"
        );
    }
}

impl ExplorerObserver for Wallet {
    fn pool_updated(
        &self,
        new_transactions: Vec<crate::node::TransactionDetails>,
        removed: Vec<(Hash, PoolRemovalReason)>,
    ) {
        let removed_hashes: Vec<Hash> = removed.into_iter().map(|(hash, _)| hash).collect();
        self.on_pool_updated(&new_transactions, &removed_hashes);
    }

    fn blockchain_updated(
        &self,
        new_blocks: Vec<BlockDetails>,
        _alternative_blocks: Vec<BlockDetails>,
    ) {
        let Some(lowest) = new_blocks.iter().map(|block| block.height).min() else {
            return;
        };

        // Re-announced heights the containers already passed mean the chain
        // switched branches; roll back to the fork point before replaying.
        let switched = lowest > 0 && {
            let inner = self.inner.lock().unwrap();
            inner.wallets.iter().any(|record| {
                record.container.transactions_count() > 0
                    && record.container.current_height() >= lowest
            })
        };
        if switched {
            self.on_chain_switched(lowest);
        }

        self.synchronizer.process_blocks(&new_blocks, self);
        if let Some(highest) = new_blocks.iter().map(|block| block.height).max() {
            self.on_synchronization_progress_updated(highest, highest);
        }
    }

    fn blockchain_synchronized(&self, _top_block: BlockDetails) {
        self.on_synchronization_completed();
    }
}

// ----------------------------------------------------------------------
// Persistence
// ----------------------------------------------------------------------

#[derive(Serialize, Deserialize)]
struct WalletRecordSnapshot {
    spend_public: PublicKey,
    spend_secret: Option<PrivateKey>,
    creation_timestamp: u64,
    container_blob: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct WalletSnapshot {
    password_hash: [u8; 32],
    view_keys: KeyPair,
    wallets: Vec<WalletRecordSnapshot>,
    transactions: Vec<WalletTransaction>,
    transfers: Vec<(usize, TransferDestination)>,
    fusion_txs_cache: HashMap<usize, bool>,
}

impl Wallet {
    /// Serialize the wallet.
    pub fn save<W: Write>(&self, sink: &mut W) -> Result<(), WalletError> {
        let inner = self.lock_initialized()?;
        let mut wallets = Vec::with_capacity(inner.wallets.len());
        for record in &inner.wallets {
            let mut container_blob = Vec::new();
            record.container.save(&mut container_blob)?;
            wallets.push(WalletRecordSnapshot {
                spend_public: record.spend_public,
                spend_secret: record.spend_secret.clone(),
                creation_timestamp: record.creation_timestamp,
                container_blob,
            });
        }
        let snapshot = WalletSnapshot {
            password_hash: inner.password_hash,
            view_keys: inner.view_keys.clone().ok_or(WalletError::NotInitialized)?,
            wallets,
            transactions: inner.transactions.clone(),
            transfers: inner.transfers.clone(),
            fusion_txs_cache: inner.fusion_txs_cache.clone(),
        };
        bincode::serialize_into(&mut *sink, &WALLET_STORAGE_VERSION)
            .map_err(|err| WalletError::InternalWalletError(err.to_string()))?;
        bincode::serialize_into(sink, &snapshot)
            .map_err(|err| WalletError::InternalWalletError(err.to_string()))
    }

    /// Load a previously saved wallet.
    pub fn load<R: Read>(&self, source: &mut R, password: &str) -> Result<(), WalletError> {
        {
            let inner = self.inner.lock().unwrap();
            if inner.state != WalletState::NotInitialized {
                return Err(WalletError::AlreadyInitialized);
            }
        }

        let version: u32 = bincode::deserialize_from(&mut *source)
            .map_err(|err| WalletError::InternalWalletError(err.to_string()))?;
        if version > WALLET_STORAGE_VERSION {
            return Err(WalletError::UnsupportedVersion(version));
        }
        let snapshot: WalletSnapshot = bincode::deserialize_from(source)
            .map_err(|err| WalletError::InternalWalletError(err.to_string()))?;
        if snapshot.password_hash != password_hash(password) {
            return Err(WalletError::WrongPassword);
        }

        let mut records = Vec::with_capacity(snapshot.wallets.len());
        let mut subscriptions = Vec::new();
        for record in snapshot.wallets {
            let container = Arc::new(TransfersContainer::new(
                self.currency.clone(),
                self.spendable_age,
            ));
            container.load(&mut record.container_blob.as_slice())?;
            let address = Address::new(record.spend_public, snapshot.view_keys.public);
            subscriptions.push(Subscription {
                keys: SubscriptionKeys {
                    address,
                    view_secret: snapshot.view_keys.secret.clone(),
                    spend_secret: record.spend_secret.clone(),
                },
                sync_start_height: 0,
                sync_start_timestamp: record
                    .creation_timestamp
                    .saturating_sub(SYNC_GRACE_SECONDS),
                container: container.clone(),
            });
            records.push(WalletRecord {
                spend_public: record.spend_public,
                spend_secret: record.spend_secret,
                container,
                creation_timestamp: record.creation_timestamp,
                actual_balance: 0,
                pending_balance: 0,
            });
        }

        {
            let mut inner = self.inner.lock().unwrap();
            inner.password_hash = snapshot.password_hash;
            inner.view_keys = Some(snapshot.view_keys);
            inner.wallets = records;
            inner.transactions = snapshot.transactions;
            let index_by_hash: HashMap<Hash, usize> = inner
                .transactions
                .iter()
                .enumerate()
                .map(|(index, tx)| (tx.hash, index))
                .collect();
            inner.transaction_index_by_hash = index_by_hash;
            inner.transfers = snapshot.transfers;
            inner.fusion_txs_cache = snapshot.fusion_txs_cache;
            inner.state = WalletState::Initialized;
            let wallets: Vec<PublicKey> = inner
                .wallets
                .iter()
                .map(|record| record.spend_public)
                .collect();
            for wallet in wallets {
                Self::refresh_balance(&mut inner, &wallet);
            }
        }
        for subscription in subscriptions {
            self.synchronizer.subscribe(subscription);
        }
        self.synchronizer.start();
        Ok(())
    }
}
