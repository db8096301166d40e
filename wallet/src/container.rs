//! The output-tracking engine.
//!
//! `TransfersContainer` is the wallet's per-address ledger of outputs. Rows
//! live in one of three disjoint sets (unconfirmed, available, spent), each
//! a small arena keyed by an opaque row id with secondary hash maps for the
//! lookups the engine needs: by spent-output descriptor (key image, or
//! `(amount, global index)` for multisig outputs), by containing
//! transaction, and for spent rows by spending transaction.
//!
//! Under chain reorganization the same key image may briefly appear in
//! several rows; the engine keeps exactly one of them `visible` (priority
//! spent > available > unconfirmed) and computes balances from visibility
//! alone.

use std::collections::{BTreeMap, HashMap};
use std::io::{Read, Write};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{error, warn};
use umb_crypto_keys::PublicKey;
use umb_crypto_ring_signature::KeyImage;
use umb_transaction_core::{
    get_payment_id, parse_extra, Currency, Hash, Transaction, TransactionInput, UnknownTagPolicy,
    NULL_HASH,
};

use crate::error::ContainerError;

/// Block height marking a transaction or transfer as unconfirmed.
pub const UNCONFIRMED_HEIGHT: u32 = u32::MAX;

/// Global output index of an output whose transaction is unconfirmed.
pub const UNCONFIRMED_GLOBAL_INDEX: u32 = u32::MAX;

const STORAGE_VERSION: u32 = 1;

/// Row filters for balance and output queries.
pub mod flags {
    /// Spendable now.
    pub const INCLUDE_STATE_UNLOCKED: u32 = 0x01;
    /// Locked by unlock time or missing confirmation.
    pub const INCLUDE_STATE_LOCKED: u32 = 0x02;
    /// Confirmed but younger than the spendable age.
    pub const INCLUDE_STATE_SOFT_LOCKED: u32 = 0x04;
    /// Already spent.
    pub const INCLUDE_STATE_SPENT: u32 = 0x08;
    /// Any state.
    pub const INCLUDE_STATE_ALL: u32 = 0xff;

    /// Key outputs.
    pub const INCLUDE_TYPE_KEY: u32 = 0x100;
    /// Multisignature outputs.
    pub const INCLUDE_TYPE_MULTISIG: u32 = 0x200;
    /// Any type.
    pub const INCLUDE_TYPE_ALL: u32 = 0xff00;

    /// Key outputs which are spendable now.
    pub const INCLUDE_KEY_UNLOCKED: u32 = INCLUDE_TYPE_KEY | INCLUDE_STATE_UNLOCKED;
    /// Key outputs which are not spendable yet.
    pub const INCLUDE_KEY_NOT_UNLOCKED: u32 =
        INCLUDE_TYPE_KEY | INCLUDE_STATE_LOCKED | INCLUDE_STATE_SOFT_LOCKED;
    /// Everything.
    pub const INCLUDE_ALL: u32 = INCLUDE_TYPE_ALL | INCLUDE_STATE_ALL;
    /// The default filter.
    pub const INCLUDE_DEFAULT: u32 = INCLUDE_KEY_UNLOCKED;
}

/// The kind of output a row tracks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OutputType {
    /// A one-time key output.
    Key,
    /// A multisignature output.
    Multisig,
}

/// The lookup key under which a row can be spent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SpentOutputDescriptor {
    /// Key outputs are identified by their key image.
    KeyImage(KeyImage),
    /// Multisignature outputs are identified by amount and global index.
    AmountGlobalIndex(u64, u32),
}

/// Where in the chain a transaction sits.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferBlockInfo {
    /// Block height, or [`UNCONFIRMED_HEIGHT`].
    pub height: u32,
    /// Block timestamp.
    pub timestamp: u64,
    /// Position of the transaction within the block.
    pub transaction_index: u32,
}

impl TransferBlockInfo {
    /// Marker for a transaction still in the pool.
    pub fn unconfirmed() -> Self {
        Self {
            height: UNCONFIRMED_HEIGHT,
            timestamp: 0,
            transaction_index: 0,
        }
    }
}

/// A newly discovered output belonging to the wallet, as reported by the
/// scanner.
#[derive(Clone, Debug)]
pub struct IncomingTransfer {
    /// The kind of output.
    pub output_type: OutputType,
    /// The amount.
    pub amount: u64,
    /// Global index, or [`UNCONFIRMED_GLOBAL_INDEX`].
    pub global_output_index: u32,
    /// Output position within its transaction.
    pub output_in_transaction: u32,
    /// The transaction public key.
    pub transaction_public_key: PublicKey,
    /// The one-time key of a key output.
    pub output_key: Option<PublicKey>,
    /// Required signatures of a multisig output; zero for key outputs.
    pub required_signatures: u32,
    /// Key image; present exactly for key outputs.
    pub key_image: Option<KeyImage>,
}

/// A tracked output row.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TransferOutput {
    /// The kind of output.
    pub output_type: OutputType,
    /// The amount.
    pub amount: u64,
    /// Global index, or [`UNCONFIRMED_GLOBAL_INDEX`].
    pub global_output_index: u32,
    /// Output position within its transaction.
    pub output_in_transaction: u32,
    /// The transaction public key.
    pub transaction_public_key: PublicKey,
    /// The one-time key of a key output.
    pub output_key: Option<PublicKey>,
    /// Required signatures of a multisig output; zero for key outputs.
    pub required_signatures: u32,
    /// Key image; present exactly for key outputs.
    pub key_image: Option<KeyImage>,
    /// Unlock time of the containing transaction.
    pub unlock_time: u64,
    /// Height of the containing block, or [`UNCONFIRMED_HEIGHT`].
    pub block_height: u32,
    /// Position of the containing transaction within its block.
    pub transaction_index: u32,
    /// Hash of the containing transaction.
    pub transaction_hash: Hash,
    /// Whether this row is the one witness of its key image.
    pub visible: bool,
}

impl TransferOutput {
    fn descriptor(&self) -> SpentOutputDescriptor {
        match self.output_type {
            OutputType::Key => SpentOutputDescriptor::KeyImage(
                self.key_image.expect("key rows always carry a key image"),
            ),
            OutputType::Multisig => {
                SpentOutputDescriptor::AmountGlobalIndex(self.amount, self.global_output_index)
            }
        }
    }
}

/// A spent row: the output plus where it was spent.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SpentTransferOutput {
    /// The spent output.
    pub output: TransferOutput,
    /// The block of the spending transaction.
    pub spending_block: TransferBlockInfo,
    /// The spending transaction.
    pub spending_transaction_hash: Hash,
    /// Input position within the spending transaction.
    pub input_in_transaction: u32,
}

/// The per-transaction record kept alongside the transfer rows.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    /// The transaction hash.
    pub transaction_hash: Hash,
    /// Block height, or [`UNCONFIRMED_HEIGHT`].
    pub block_height: u32,
    /// Block timestamp.
    pub timestamp: u64,
    /// Unlock time.
    pub unlock_time: u64,
    /// Sum of input amounts.
    pub total_amount_in: u64,
    /// Sum of output amounts.
    pub total_amount_out: u64,
    /// The raw extra field.
    pub extra: Vec<u8>,
    /// Payment id, or all zeroes.
    pub payment_id: Hash,
    /// Whether the transaction is a coinbase.
    pub is_base: bool,
}

type RowId = u64;

#[derive(Clone, Default)]
struct TransferSet {
    rows: HashMap<RowId, TransferOutput>,
    by_descriptor: HashMap<SpentOutputDescriptor, Vec<RowId>>,
    by_transaction: HashMap<Hash, Vec<RowId>>,
}

impl TransferSet {
    fn insert(&mut self, id: RowId, row: TransferOutput) {
        self.by_descriptor.entry(row.descriptor()).or_default().push(id);
        self.by_transaction
            .entry(row.transaction_hash)
            .or_default()
            .push(id);
        self.rows.insert(id, row);
    }

    fn remove(&mut self, id: RowId) -> Option<TransferOutput> {
        let row = self.rows.remove(&id)?;
        detach_index(&mut self.by_descriptor, &row.descriptor(), id);
        detach_index(&mut self.by_transaction, &row.transaction_hash, id);
        Some(row)
    }

    fn ids_by_descriptor(&self, descriptor: &SpentOutputDescriptor) -> Vec<RowId> {
        self.by_descriptor.get(descriptor).cloned().unwrap_or_default()
    }

    fn ids_by_transaction(&self, hash: &Hash) -> Vec<RowId> {
        self.by_transaction.get(hash).cloned().unwrap_or_default()
    }
}

#[derive(Clone, Default)]
struct SpentSet {
    rows: HashMap<RowId, SpentTransferOutput>,
    by_descriptor: HashMap<SpentOutputDescriptor, Vec<RowId>>,
    by_transaction: HashMap<Hash, Vec<RowId>>,
    by_spending_transaction: HashMap<Hash, Vec<RowId>>,
}

impl SpentSet {
    fn insert(&mut self, id: RowId, row: SpentTransferOutput) {
        self.by_descriptor
            .entry(row.output.descriptor())
            .or_default()
            .push(id);
        self.by_transaction
            .entry(row.output.transaction_hash)
            .or_default()
            .push(id);
        self.by_spending_transaction
            .entry(row.spending_transaction_hash)
            .or_default()
            .push(id);
        self.rows.insert(id, row);
    }

    fn remove(&mut self, id: RowId) -> Option<SpentTransferOutput> {
        let row = self.rows.remove(&id)?;
        detach_index(&mut self.by_descriptor, &row.output.descriptor(), id);
        detach_index(&mut self.by_transaction, &row.output.transaction_hash, id);
        detach_index(
            &mut self.by_spending_transaction,
            &row.spending_transaction_hash,
            id,
        );
        Some(row)
    }

    fn ids_by_descriptor(&self, descriptor: &SpentOutputDescriptor) -> Vec<RowId> {
        self.by_descriptor.get(descriptor).cloned().unwrap_or_default()
    }

    fn ids_by_spending_transaction(&self, hash: &Hash) -> Vec<RowId> {
        self.by_spending_transaction
            .get(hash)
            .cloned()
            .unwrap_or_default()
    }

    fn ids_by_transaction(&self, hash: &Hash) -> Vec<RowId> {
        self.by_transaction.get(hash).cloned().unwrap_or_default()
    }
}

fn detach_index<K: std::hash::Hash + Eq>(
    index: &mut HashMap<K, Vec<RowId>>,
    key: &K,
    id: RowId,
) {
    if let Some(ids) = index.get_mut(key) {
        ids.retain(|&existing| existing != id);
        if ids.is_empty() {
            index.remove(key);
        }
    }
}

#[derive(Clone, Default)]
struct Inner {
    current_height: u32,
    next_row_id: RowId,
    transactions: HashMap<Hash, TransactionRecord>,
    transactions_by_height: BTreeMap<u32, Vec<Hash>>,
    unconfirmed: TransferSet,
    available: TransferSet,
    spent: SpentSet,
}

#[derive(Serialize, Deserialize)]
struct Snapshot {
    current_height: u32,
    transactions: Vec<TransactionRecord>,
    unconfirmed: Vec<TransferOutput>,
    available: Vec<TransferOutput>,
    spent: Vec<SpentTransferOutput>,
}

/// The engine. All operations lock one internal mutex; none of them call
/// out while holding it.
pub struct TransfersContainer {
    currency: Currency,
    spendable_age: u32,
    inner: Mutex<Inner>,
}

impl TransfersContainer {
    /// Create an empty container.
    pub fn new(currency: Currency, spendable_age: u32) -> Self {
        Self {
            currency,
            spendable_age,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Record a transaction: its outputs belonging to this wallet and any of
    /// its inputs spending previously tracked outputs.
    ///
    /// Returns whether anything was recorded. On error every change made by
    /// this call is rolled back.
    pub fn add_transaction(
        &self,
        block: &TransferBlockInfo,
        tx: &Transaction,
        transfers: &[IncomingTransfer],
    ) -> Result<bool, ContainerError> {
        let mut inner = self.inner.lock().unwrap();
        let tx_hash = tx.hash();

        let result = Self::add_transaction_locked(&mut inner, block, tx, &tx_hash, transfers);
        if result.is_err() && !inner.transactions.contains_key(&tx_hash) {
            error!(
                tx = %hex::encode(&tx_hash[..8]),
                height = block.height,
                "failed to add transaction, removing its transfers"
            );
            Self::delete_transaction_transfers(&mut inner, &tx_hash);
        }
        result
    }

    fn add_transaction_locked(
        inner: &mut Inner,
        block: &TransferBlockInfo,
        tx: &Transaction,
        tx_hash: &Hash,
        transfers: &[IncomingTransfer],
    ) -> Result<bool, ContainerError> {
        if block.height != UNCONFIRMED_HEIGHT && block.height < inner.current_height {
            return Err(ContainerError::InvalidOrder {
                block_height: block.height,
                current_height: inner.current_height,
            });
        }
        if inner.transactions.contains_key(tx_hash) {
            return Err(ContainerError::DuplicateTransaction);
        }

        let mut added = Self::add_transaction_outputs(inner, block, tx, tx_hash, transfers)?;
        added |= Self::add_transaction_inputs(inner, block, tx, tx_hash)?;

        if added {
            Self::insert_transaction_record(inner, block, tx, tx_hash);
        }
        if block.height != UNCONFIRMED_HEIGHT {
            inner.current_height = block.height;
        }
        Ok(added)
    }

    fn insert_transaction_record(
        inner: &mut Inner,
        block: &TransferBlockInfo,
        tx: &Transaction,
        tx_hash: &Hash,
    ) {
        let payment_id = parse_extra(&tx.prefix.extra, UnknownTagPolicy::OpaqueTail)
            .ok()
            .and_then(|fields| get_payment_id(&fields))
            .unwrap_or(NULL_HASH);

        let record = TransactionRecord {
            transaction_hash: *tx_hash,
            block_height: block.height,
            timestamp: block.timestamp,
            unlock_time: tx.prefix.unlock_time,
            total_amount_in: tx.prefix.input_total_amount().unwrap_or(0),
            total_amount_out: tx.prefix.output_total_amount().unwrap_or(0),
            extra: tx.prefix.extra.clone(),
            payment_id,
            is_base: tx.prefix.is_base(),
        };
        inner.transactions.insert(*tx_hash, record);
        inner
            .transactions_by_height
            .entry(block.height)
            .or_default()
            .push(*tx_hash);
    }

    fn add_transaction_outputs(
        inner: &mut Inner,
        block: &TransferBlockInfo,
        tx: &Transaction,
        tx_hash: &Hash,
        transfers: &[IncomingTransfer],
    ) -> Result<bool, ContainerError> {
        let mut outputs_added = false;
        let transaction_is_unconfirmed = block.height == UNCONFIRMED_HEIGHT;

        for transfer in transfers {
            let transfer_is_unconfirmed =
                transfer.global_output_index == UNCONFIRMED_GLOBAL_INDEX;
            if transaction_is_unconfirmed != transfer_is_unconfirmed {
                return Err(ContainerError::InvalidGlobalIndex);
            }

            let row = TransferOutput {
                output_type: transfer.output_type,
                amount: transfer.amount,
                global_output_index: transfer.global_output_index,
                output_in_transaction: transfer.output_in_transaction,
                transaction_public_key: transfer.transaction_public_key,
                output_key: transfer.output_key,
                required_signatures: transfer.required_signatures,
                key_image: transfer.key_image,
                unlock_time: tx.prefix.unlock_time,
                block_height: block.height,
                transaction_index: block.transaction_index,
                transaction_hash: *tx_hash,
                visible: true,
            };

            if transfer_is_unconfirmed {
                let id = Self::next_id(inner);
                inner.unconfirmed.insert(id, row.clone());
            } else {
                let descriptor = row.descriptor();
                match row.output_type {
                    OutputType::Key => {
                        let duplicate = inner
                            .available
                            .ids_by_descriptor(&descriptor)
                            .into_iter()
                            .filter_map(|id| inner.available.rows.get(&id))
                            .any(|existing| {
                                existing.transaction_hash == *tx_hash
                                    && existing.output_in_transaction
                                        == row.output_in_transaction
                            })
                            || inner
                                .spent
                                .ids_by_descriptor(&descriptor)
                                .into_iter()
                                .filter_map(|id| inner.spent.rows.get(&id))
                                .any(|existing| {
                                    existing.output.transaction_hash == *tx_hash
                                        && existing.output.output_in_transaction
                                            == row.output_in_transaction
                                });
                        if duplicate {
                            return Err(ContainerError::DuplicateOutput);
                        }
                    }
                    OutputType::Multisig => {
                        if !inner.available.ids_by_descriptor(&descriptor).is_empty()
                            || !inner.spent.ids_by_descriptor(&descriptor).is_empty()
                        {
                            return Err(ContainerError::DuplicateOutput);
                        }
                    }
                }
                let id = Self::next_id(inner);
                inner.available.insert(id, row.clone());
            }

            if let Some(key_image) = row.key_image {
                Self::update_visibility(inner, &key_image);
            }
            outputs_added = true;
        }

        Ok(outputs_added)
    }

    fn add_transaction_inputs(
        inner: &mut Inner,
        block: &TransferBlockInfo,
        tx: &Transaction,
        tx_hash: &Hash,
    ) -> Result<bool, ContainerError> {
        let mut inputs_added = false;

        for (input_index, input) in tx.prefix.inputs.iter().enumerate() {
            match input {
                TransactionInput::Key(key_input) => {
                    let descriptor = SpentOutputDescriptor::KeyImage(key_input.key_image);

                    if !inner.spent.ids_by_descriptor(&descriptor).is_empty() {
                        return Err(ContainerError::DoubleSpend);
                    }

                    let available_ids = inner.available.ids_by_descriptor(&descriptor);
                    if available_ids.is_empty() {
                        if !inner.unconfirmed.ids_by_descriptor(&descriptor).is_empty() {
                            return Err(ContainerError::SpendOfUnconfirmedOutput);
                        }
                        // Not our output; nothing to track.
                        continue;
                    }

                    // Among the candidate rows, spend the chain-earliest one
                    // with the matching amount.
                    let mut candidates: Vec<RowId> = available_ids;
                    candidates.sort_by_key(|id| {
                        let row = &inner.available.rows[id];
                        (row.block_height, row.transaction_index)
                    });
                    let spending_id = candidates
                        .into_iter()
                        .find(|id| inner.available.rows[id].amount == key_input.amount)
                        .ok_or(ContainerError::AmountMismatch)?;

                    let row = inner
                        .available
                        .remove(spending_id)
                        .expect("row id was just looked up");
                    let spent = SpentTransferOutput {
                        output: row,
                        spending_block: *block,
                        spending_transaction_hash: *tx_hash,
                        input_in_transaction: input_index as u32,
                    };
                    let id = Self::next_id(inner);
                    inner.spent.insert(id, spent);
                    Self::update_visibility(inner, &key_input.key_image);
                    inputs_added = true;
                }
                TransactionInput::Multisig(multisig_input) => {
                    let descriptor = SpentOutputDescriptor::AmountGlobalIndex(
                        multisig_input.amount,
                        multisig_input.output_index,
                    );
                    if let Some(id) =
                        inner.available.ids_by_descriptor(&descriptor).first().copied()
                    {
                        let row = inner
                            .available
                            .remove(id)
                            .expect("row id was just looked up");
                        let spent = SpentTransferOutput {
                            output: row,
                            spending_block: *block,
                            spending_transaction_hash: *tx_hash,
                            input_in_transaction: input_index as u32,
                        };
                        let new_id = Self::next_id(inner);
                        inner.spent.insert(new_id, spent);
                        inputs_added = true;
                    }
                }
                TransactionInput::Base(_) => {}
            }
        }

        Ok(inputs_added)
    }

    /// Drop an unconfirmed transaction and all its rows.
    ///
    /// Returns `false` when the hash is unknown or the transaction is
    /// already confirmed.
    pub fn delete_unconfirmed_transaction(&self, tx_hash: &Hash) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let deletable = inner
            .transactions
            .get(tx_hash)
            .map(|record| record.block_height == UNCONFIRMED_HEIGHT)
            .unwrap_or(false);
        if !deletable {
            return false;
        }
        Self::delete_transaction_transfers(&mut inner, tx_hash);
        Self::remove_transaction_record(&mut inner, tx_hash);
        true
    }

    /// Promote an unconfirmed transaction to a confirmed block position,
    /// assigning global output indexes to its rows.
    ///
    /// On failure every change made by this call is rolled back.
    pub fn mark_transaction_confirmed(
        &self,
        block: &TransferBlockInfo,
        tx_hash: &Hash,
        global_indexes: &[u32],
    ) -> Result<bool, ContainerError> {
        if block.height == UNCONFIRMED_HEIGHT {
            return Err(ContainerError::UnconfirmedBlockHeight);
        }

        let mut inner = self.inner.lock().unwrap();
        match inner.transactions.get(tx_hash) {
            None => return Ok(false),
            Some(record) if record.block_height != UNCONFIRMED_HEIGHT => return Ok(false),
            Some(_) => {}
        }

        let backup = inner.clone();
        match Self::mark_confirmed_locked(&mut inner, block, tx_hash, global_indexes) {
            Ok(()) => Ok(true),
            Err(err) => {
                warn!(
                    tx = %hex::encode(&tx_hash[..8]),
                    height = block.height,
                    %err,
                    "mark_transaction_confirmed failed, rolling back"
                );
                *inner = backup;
                Err(err)
            }
        }
    }

    fn mark_confirmed_locked(
        inner: &mut Inner,
        block: &TransferBlockInfo,
        tx_hash: &Hash,
        global_indexes: &[u32],
    ) -> Result<(), ContainerError> {
        Self::remove_transaction_record_height_index(inner, tx_hash);
        let record = inner
            .transactions
            .get_mut(tx_hash)
            .expect("caller checked the record exists");
        record.block_height = block.height;
        record.timestamp = block.timestamp;
        inner
            .transactions_by_height
            .entry(block.height)
            .or_default()
            .push(*tx_hash);

        for id in inner.unconfirmed.ids_by_transaction(tx_hash) {
            let mut row = inner
                .unconfirmed
                .remove(id)
                .expect("id comes from the index");
            let global_index = *global_indexes
                .get(row.output_in_transaction as usize)
                .ok_or(ContainerError::NotEnoughGlobalIndexes)?;

            row.block_height = block.height;
            row.transaction_index = block.transaction_index;
            row.global_output_index = global_index;

            if row.output_type == OutputType::Multisig {
                let descriptor = row.descriptor();
                if !inner.available.ids_by_descriptor(&descriptor).is_empty()
                    || !inner.spent.ids_by_descriptor(&descriptor).is_empty()
                {
                    return Err(ContainerError::DuplicateOutput);
                }
            }

            let key_image = row.key_image;
            let new_id = Self::next_id(inner);
            inner.available.insert(new_id, row);
            if let Some(key_image) = key_image {
                Self::update_visibility(inner, &key_image);
            }
        }

        // Spends this transaction made while unconfirmed move to the block
        // as well.
        for id in inner.spent.ids_by_spending_transaction(tx_hash) {
            let row = inner
                .spent
                .rows
                .get_mut(&id)
                .expect("id comes from the index");
            row.spending_block = *block;
        }

        Ok(())
    }

    /// Roll the container back before `height`. Removes every transaction at
    /// or above it, and every unconfirmed transaction whose spends point at
    /// or above it. Returns the removed hashes.
    pub fn detach(&self, height: u32) -> Vec<Hash> {
        let mut inner = self.inner.lock().unwrap();
        let mut deleted = Vec::new();

        let ordered: Vec<(u32, Hash)> = inner
            .transactions_by_height
            .iter()
            .flat_map(|(height, hashes)| hashes.iter().map(|hash| (*height, *hash)))
            .collect();

        for (tx_height, tx_hash) in ordered.into_iter().rev() {
            let delete = if tx_height == UNCONFIRMED_HEIGHT {
                inner
                    .spent
                    .ids_by_spending_transaction(&tx_hash)
                    .into_iter()
                    .any(|id| inner.spent.rows[&id].output.block_height >= height)
            } else if tx_height >= height {
                true
            } else {
                break;
            };

            if delete {
                Self::delete_transaction_transfers(&mut inner, &tx_hash);
                Self::remove_transaction_record(&mut inner, &tx_hash);
                deleted.push(tx_hash);
            }
        }

        inner.current_height = height.saturating_sub(1);
        deleted
    }

    /// Raise the current height. Never lowers it.
    pub fn advance_height(&self, height: u32) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.current_height <= height {
            inner.current_height = height;
            true
        } else {
            false
        }
    }

    fn remove_transaction_record(inner: &mut Inner, tx_hash: &Hash) {
        if inner.transactions.remove(tx_hash).is_some() {
            Self::remove_transaction_record_height_index(inner, tx_hash);
        }
    }

    fn remove_transaction_record_height_index(inner: &mut Inner, tx_hash: &Hash) {
        let mut empty_heights = Vec::new();
        for (height, hashes) in inner.transactions_by_height.iter_mut() {
            hashes.retain(|hash| hash != tx_hash);
            if hashes.is_empty() {
                empty_heights.push(*height);
            }
        }
        for height in empty_heights {
            inner.transactions_by_height.remove(&height);
        }
    }

    /// Remove every transfer row belonging to `tx_hash`: outputs it created
    /// and, for spends it performed, return those rows to available.
    fn delete_transaction_transfers(inner: &mut Inner, tx_hash: &Hash) {
        for id in inner.spent.ids_by_spending_transaction(tx_hash) {
            let spent = inner.spent.remove(id).expect("id comes from the index");
            let key_image = spent.output.key_image;
            let new_id = Self::next_id(inner);
            inner.available.insert(new_id, spent.output);
            if let Some(key_image) = key_image {
                Self::update_visibility(inner, &key_image);
            }
        }

        for id in inner.unconfirmed.ids_by_transaction(tx_hash) {
            let row = inner
                .unconfirmed
                .remove(id)
                .expect("id comes from the index");
            if let Some(key_image) = row.key_image {
                Self::update_visibility(inner, &key_image);
            }
        }

        for id in inner.available.ids_by_transaction(tx_hash) {
            let row = inner
                .available
                .remove(id)
                .expect("id comes from the index");
            if let Some(key_image) = row.key_image {
                Self::update_visibility(inner, &key_image);
            }
        }

        for id in inner.spent.ids_by_transaction(tx_hash) {
            let row = inner.spent.remove(id).expect("id comes from the index");
            if let Some(key_image) = row.output.key_image {
                Self::update_visibility(inner, &key_image);
            }
        }
    }

    /// Re-elect the single visible witness of a key image.
    fn update_visibility(inner: &mut Inner, key_image: &KeyImage) {
        let descriptor = SpentOutputDescriptor::KeyImage(*key_image);

        let unconfirmed_ids = inner.unconfirmed.ids_by_descriptor(&descriptor);
        let available_ids = inner.available.ids_by_descriptor(&descriptor);
        let spent_ids = inner.spent.ids_by_descriptor(&descriptor);

        if !spent_ids.is_empty() {
            for id in &unconfirmed_ids {
                inner.unconfirmed.rows.get_mut(id).unwrap().visible = false;
            }
            for id in &available_ids {
                inner.available.rows.get_mut(id).unwrap().visible = false;
            }
            for id in &spent_ids {
                inner.spent.rows.get_mut(id).unwrap().output.visible = true;
            }
        } else if !available_ids.is_empty() {
            for id in &unconfirmed_ids {
                inner.unconfirmed.rows.get_mut(id).unwrap().visible = false;
            }
            let earliest = available_ids
                .iter()
                .copied()
                .min_by_key(|id| {
                    let row = &inner.available.rows[id];
                    (row.block_height, row.transaction_index)
                })
                .expect("non-empty");
            for id in &available_ids {
                inner.available.rows.get_mut(id).unwrap().visible = *id == earliest;
            }
        } else {
            let visible = unconfirmed_ids.len() == 1;
            for id in &unconfirmed_ids {
                inner.unconfirmed.rows.get_mut(id).unwrap().visible = visible;
            }
        }
    }

    fn next_id(inner: &mut Inner) -> RowId {
        let id = inner.next_row_id;
        inner.next_row_id += 1;
        id
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    fn is_spend_time_unlocked(&self, inner: &Inner, unlock_time: u64) -> bool {
        if unlock_time < self.currency.max_block_height {
            // Interpret as a block index.
            u64::from(inner.current_height) + self.currency.locked_tx_allowed_delta_blocks
                >= unlock_time
        } else {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|elapsed| elapsed.as_secs())
                .unwrap_or(0);
            now + self.currency.locked_tx_allowed_delta_seconds >= unlock_time
        }
    }

    fn row_state(&self, inner: &Inner, row: &TransferOutput) -> u32 {
        if row.block_height == UNCONFIRMED_HEIGHT
            || !self.is_spend_time_unlocked(inner, row.unlock_time)
        {
            flags::INCLUDE_STATE_LOCKED
        } else if inner.current_height < row.block_height + self.spendable_age {
            flags::INCLUDE_STATE_SOFT_LOCKED
        } else {
            flags::INCLUDE_STATE_UNLOCKED
        }
    }

    fn type_included(output_type: OutputType, filter: u32) -> bool {
        match output_type {
            OutputType::Key => filter & flags::INCLUDE_TYPE_KEY != 0,
            OutputType::Multisig => filter & flags::INCLUDE_TYPE_MULTISIG != 0,
        }
    }

    fn is_included(&self, inner: &Inner, row: &TransferOutput, filter: u32) -> bool {
        Self::type_included(row.output_type, filter)
            && (filter & self.row_state(inner, row)) != 0
    }

    /// Sum the amounts of visible rows matching `filter`.
    pub fn balance(&self, filter: u32) -> u64 {
        let inner = self.inner.lock().unwrap();
        let mut amount = 0u64;

        for row in inner.available.rows.values() {
            if row.visible && self.is_included(&inner, row, filter) {
                amount += row.amount;
            }
        }

        if filter & flags::INCLUDE_STATE_LOCKED != 0 {
            for row in inner.unconfirmed.rows.values() {
                if row.visible
                    && Self::type_included(row.output_type, filter)
                {
                    amount += row.amount;
                }
            }
        }

        amount
    }

    /// Visible rows matching `filter`.
    pub fn get_outputs(&self, filter: u32) -> Vec<TransferOutput> {
        let inner = self.inner.lock().unwrap();
        let mut outputs = Vec::new();

        for row in inner.available.rows.values() {
            if row.visible && self.is_included(&inner, row, filter) {
                outputs.push(row.clone());
            }
        }

        if filter & flags::INCLUDE_STATE_LOCKED != 0 {
            for row in inner.unconfirmed.rows.values() {
                if row.visible && Self::type_included(row.output_type, filter) {
                    outputs.push(row.clone());
                }
            }
        }

        outputs
    }

    /// The record of a transaction plus the amounts it moved in and out of
    /// this wallet.
    pub fn get_transaction_information(
        &self,
        tx_hash: &Hash,
    ) -> Option<(TransactionRecord, u64, u64)> {
        let inner = self.inner.lock().unwrap();
        let record = inner.transactions.get(tx_hash)?.clone();

        let mut amount_out = 0u64;
        if record.block_height == UNCONFIRMED_HEIGHT {
            for id in inner.unconfirmed.ids_by_transaction(tx_hash) {
                amount_out += inner.unconfirmed.rows[&id].amount;
            }
        } else {
            for id in inner.available.ids_by_transaction(tx_hash) {
                amount_out += inner.available.rows[&id].amount;
            }
            for id in inner.spent.ids_by_transaction(tx_hash) {
                amount_out += inner.spent.rows[&id].output.amount;
            }
        }

        let mut amount_in = 0u64;
        for id in inner.spent.ids_by_spending_transaction(tx_hash) {
            amount_in += inner.spent.rows[&id].output.amount;
        }

        Some((record, amount_in, amount_out))
    }

    /// Outputs created by `tx_hash`, filtered.
    pub fn get_transaction_outputs(&self, tx_hash: &Hash, filter: u32) -> Vec<TransferOutput> {
        let inner = self.inner.lock().unwrap();
        let mut outputs = Vec::new();

        for id in inner.available.ids_by_transaction(tx_hash) {
            let row = &inner.available.rows[&id];
            if self.is_included(&inner, row, filter) {
                outputs.push(row.clone());
            }
        }

        if filter & flags::INCLUDE_STATE_LOCKED != 0 {
            for id in inner.unconfirmed.ids_by_transaction(tx_hash) {
                let row = &inner.unconfirmed.rows[&id];
                if Self::type_included(row.output_type, filter) {
                    outputs.push(row.clone());
                }
            }
        }

        if filter & flags::INCLUDE_STATE_SPENT != 0 {
            for id in inner.spent.ids_by_transaction(tx_hash) {
                let row = &inner.spent.rows[&id].output;
                if Self::type_included(row.output_type, filter) {
                    outputs.push(row.clone());
                }
            }
        }

        outputs
    }

    /// Outputs spent by `tx_hash`. Only type filters apply.
    pub fn get_transaction_inputs(&self, tx_hash: &Hash, filter: u32) -> Vec<TransferOutput> {
        let inner = self.inner.lock().unwrap();
        inner
            .spent
            .ids_by_spending_transaction(tx_hash)
            .into_iter()
            .map(|id| inner.spent.rows[&id].output.clone())
            .filter(|row| Self::type_included(row.output_type, filter))
            .collect()
    }

    /// Hashes of all unconfirmed transactions.
    pub fn get_unconfirmed_transactions(&self) -> Vec<Hash> {
        let inner = self.inner.lock().unwrap();
        inner
            .transactions
            .values()
            .filter(|record| record.block_height == UNCONFIRMED_HEIGHT)
            .map(|record| record.transaction_hash)
            .collect()
    }

    /// All spent rows.
    pub fn get_spent_outputs(&self) -> Vec<SpentTransferOutput> {
        let inner = self.inner.lock().unwrap();
        inner.spent.rows.values().cloned().collect()
    }

    /// Number of transfer rows across all three sets.
    pub fn transfers_count(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.unconfirmed.rows.len() + inner.available.rows.len() + inner.spent.rows.len()
    }

    /// Number of tracked transactions.
    pub fn transactions_count(&self) -> usize {
        self.inner.lock().unwrap().transactions.len()
    }

    /// The engine's current height.
    pub fn current_height(&self) -> u32 {
        self.inner.lock().unwrap().current_height
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    /// Serialize the container state.
    pub fn save<W: Write>(&self, sink: &mut W) -> Result<(), ContainerError> {
        let inner = self.inner.lock().unwrap();
        let snapshot = Snapshot {
            current_height: inner.current_height,
            transactions: inner.transactions.values().cloned().collect(),
            unconfirmed: inner.unconfirmed.rows.values().cloned().collect(),
            available: inner.available.rows.values().cloned().collect(),
            spent: inner.spent.rows.values().cloned().collect(),
        };
        bincode::serialize_into(&mut *sink, &STORAGE_VERSION)
            .map_err(|err| ContainerError::Storage(err.to_string()))?;
        bincode::serialize_into(sink, &snapshot)
            .map_err(|err| ContainerError::Storage(err.to_string()))
    }

    /// Replace the container state with a previously saved snapshot.
    pub fn load<R: Read>(&self, source: &mut R) -> Result<(), ContainerError> {
        let version: u32 = bincode::deserialize_from(&mut *source)
            .map_err(|err| ContainerError::Storage(err.to_string()))?;
        if version > STORAGE_VERSION {
            return Err(ContainerError::UnsupportedVersion(version));
        }
        let snapshot: Snapshot = bincode::deserialize_from(source)
            .map_err(|err| ContainerError::Storage(err.to_string()))?;

        let mut staging = Inner {
            current_height: snapshot.current_height,
            ..Inner::default()
        };
        for record in snapshot.transactions {
            staging
                .transactions_by_height
                .entry(record.block_height)
                .or_default()
                .push(record.transaction_hash);
            staging
                .transactions
                .insert(record.transaction_hash, record);
        }
        for row in snapshot.unconfirmed {
            let id = Self::next_id(&mut staging);
            staging.unconfirmed.insert(id, row);
        }
        for row in snapshot.available {
            let id = Self::next_id(&mut staging);
            staging.available.insert(id, row);
        }
        for row in snapshot.spent {
            let id = Self::next_id(&mut staging);
            staging.spent.insert(id, row);
        }

        *self.inner.lock().unwrap() = staging;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use umb_crypto_keys::KeyPair;
    use umb_transaction_core::{KeyInput, TransactionPrefix};

    fn currency() -> Currency {
        Currency {
            minimum_fee: 1,
            default_dust_threshold: 1,
            ..Currency::default()
        }
    }

    fn container() -> TransfersContainer {
        TransfersContainer::new(currency(), 0)
    }

    fn image(n: u8) -> KeyImage {
        KeyImage::from([n; 32])
    }

    fn block_at(height: u32, transaction_index: u32) -> TransferBlockInfo {
        TransferBlockInfo {
            height,
            timestamp: 1_000 + u64::from(height),
            transaction_index,
        }
    }

    fn some_key() -> PublicKey {
        KeyPair::generate(&mut rand_core::OsRng).public
    }

    /// A transaction whose hash is unique per `seed`.
    fn tx_with_inputs(seed: u64, inputs: Vec<TransactionInput>) -> Transaction {
        Transaction {
            prefix: TransactionPrefix {
                unlock_time: 0,
                extra: seed.to_le_bytes().to_vec(),
                inputs,
                ..TransactionPrefix::default()
            },
            signatures: Vec::new(),
        }
    }

    fn funding_tx(seed: u64) -> Transaction {
        tx_with_inputs(seed, Vec::new())
    }

    fn spending_tx(seed: u64, amount: u64, key_image: KeyImage) -> Transaction {
        tx_with_inputs(
            seed,
            vec![TransactionInput::Key(KeyInput {
                amount,
                output_indexes: vec![0, 1, 2],
                key_image,
            })],
        )
    }

    fn incoming(amount: u64, key_image: KeyImage, global_index: u32) -> IncomingTransfer {
        IncomingTransfer {
            output_type: OutputType::Key,
            amount,
            global_output_index: global_index,
            output_in_transaction: 0,
            transaction_public_key: some_key(),
            output_key: Some(some_key()),
            required_signatures: 0,
            key_image: Some(key_image),
        }
    }

    fn incoming_unconfirmed(amount: u64, key_image: KeyImage) -> IncomingTransfer {
        incoming(amount, key_image, UNCONFIRMED_GLOBAL_INDEX)
    }

    #[test]
    fn add_and_spend() {
        let engine = container();
        let tx1 = funding_tx(1);
        let added = engine
            .add_transaction(&block_at(100, 0), &tx1, &[incoming(7, image(1), 42)])
            .unwrap();
        assert!(added);
        assert_eq!(engine.balance(flags::INCLUDE_KEY_UNLOCKED), 7);
        assert_eq!(engine.transfers_count(), 1);

        let tx2 = spending_tx(2, 7, image(1));
        let added = engine
            .add_transaction(&block_at(101, 0), &tx2, &[])
            .unwrap();
        assert!(added);
        assert_eq!(engine.balance(flags::INCLUDE_KEY_UNLOCKED), 0);

        let spent = engine.get_spent_outputs();
        assert_eq!(spent.len(), 1);
        assert_eq!(spent[0].spending_transaction_hash, tx2.hash());
        assert_eq!(spent[0].output.amount, 7);
        assert!(spent[0].output.visible);
    }

    #[test]
    fn double_spend_is_rejected() {
        let engine = container();
        engine
            .add_transaction(&block_at(100, 0), &funding_tx(1), &[incoming(7, image(1), 42)])
            .unwrap();
        engine
            .add_transaction(&block_at(101, 0), &spending_tx(2, 7, image(1)), &[])
            .unwrap();

        let result =
            engine.add_transaction(&block_at(102, 0), &spending_tx(3, 7, image(1)), &[]);
        assert_eq!(result, Err(ContainerError::DoubleSpend));
        // The rejected transaction left no trace.
        assert_eq!(engine.transactions_count(), 2);
    }

    #[test]
    fn detach_restores_spent_outputs() {
        let engine = container();
        let tx1 = funding_tx(1);
        let tx2 = spending_tx(2, 7, image(1));
        engine
            .add_transaction(&block_at(100, 0), &tx1, &[incoming(7, image(1), 42)])
            .unwrap();
        engine.add_transaction(&block_at(101, 0), &tx2, &[]).unwrap();
        assert_eq!(engine.balance(flags::INCLUDE_KEY_UNLOCKED), 0);

        let removed = engine.detach(101);
        assert_eq!(removed, vec![tx2.hash()]);
        assert_eq!(engine.current_height(), 100);
        assert_eq!(engine.balance(flags::INCLUDE_KEY_UNLOCKED), 7);
        assert!(engine.get_spent_outputs().is_empty());

        let outputs = engine.get_outputs(flags::INCLUDE_KEY_UNLOCKED);
        assert_eq!(outputs.len(), 1);
        assert!(outputs[0].visible);
    }

    #[test]
    fn replaying_after_detach_reaches_the_same_state() {
        let engine = container();
        let tx1 = funding_tx(1);
        let tx2 = spending_tx(2, 7, image(1));
        engine
            .add_transaction(&block_at(100, 0), &tx1, &[incoming(7, image(1), 42)])
            .unwrap();
        engine.add_transaction(&block_at(101, 0), &tx2, &[]).unwrap();

        let spent_before = engine.get_spent_outputs();
        let balance_before = engine.balance(flags::INCLUDE_ALL);

        engine.detach(101);
        engine.add_transaction(&block_at(101, 0), &tx2, &[]).unwrap();

        assert_eq!(engine.get_spent_outputs(), spent_before);
        assert_eq!(engine.balance(flags::INCLUDE_ALL), balance_before);
    }

    #[test]
    fn rejects_out_of_order_blocks_and_duplicates() {
        let engine = container();
        let tx1 = funding_tx(1);
        engine
            .add_transaction(&block_at(100, 0), &tx1, &[incoming(7, image(1), 42)])
            .unwrap();

        assert!(matches!(
            engine.add_transaction(&block_at(99, 0), &funding_tx(2), &[incoming(1, image(2), 43)]),
            Err(ContainerError::InvalidOrder { .. })
        ));
        assert_eq!(
            engine.add_transaction(&block_at(100, 0), &tx1, &[incoming(7, image(1), 42)]),
            Err(ContainerError::DuplicateTransaction)
        );
    }

    #[test]
    fn one_visible_row_per_key_image() {
        let engine = container();
        // The same key image lands in two branches' transactions.
        engine
            .add_transaction(&block_at(100, 0), &funding_tx(1), &[incoming(7, image(1), 42)])
            .unwrap();
        engine
            .add_transaction(&block_at(100, 1), &funding_tx(2), &[incoming(7, image(1), 43)])
            .unwrap();

        let visible: Vec<TransferOutput> = engine
            .get_outputs(flags::INCLUDE_ALL)
            .into_iter()
            .filter(|row| row.visible)
            .collect();
        assert_eq!(visible.len(), 1);
        // The chain-earliest row wins.
        assert_eq!(visible[0].transaction_index, 0);
        assert_eq!(engine.balance(flags::INCLUDE_KEY_UNLOCKED), 7);
    }

    #[test]
    fn unconfirmed_lifecycle() {
        let engine = container();
        let tx = funding_tx(1);
        let added = engine
            .add_transaction(
                &TransferBlockInfo::unconfirmed(),
                &tx,
                &[incoming_unconfirmed(9, image(1))],
            )
            .unwrap();
        assert!(added);
        assert_eq!(engine.balance(flags::INCLUDE_KEY_UNLOCKED), 0);
        assert_eq!(
            engine.balance(flags::INCLUDE_TYPE_KEY | flags::INCLUDE_STATE_LOCKED),
            9
        );
        assert_eq!(engine.get_unconfirmed_transactions(), vec![tx.hash()]);

        let confirmed = engine
            .mark_transaction_confirmed(&block_at(50, 2), &tx.hash(), &[77])
            .unwrap();
        assert!(confirmed);
        assert!(engine.get_unconfirmed_transactions().is_empty());
        let outputs = engine.get_outputs(flags::INCLUDE_TYPE_KEY | flags::INCLUDE_STATE_ALL);
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].global_output_index, 77);
        assert_eq!(outputs[0].block_height, 50);
    }

    #[test]
    fn sentinel_bijection_is_enforced() {
        let engine = container();
        // Confirmed block with an unconfirmed-style transfer.
        assert_eq!(
            engine.add_transaction(
                &block_at(10, 0),
                &funding_tx(1),
                &[incoming_unconfirmed(9, image(1))],
            ),
            Err(ContainerError::InvalidGlobalIndex)
        );
        // Unconfirmed block with a confirmed-style transfer.
        assert_eq!(
            engine.add_transaction(
                &TransferBlockInfo::unconfirmed(),
                &funding_tx(2),
                &[incoming(9, image(2), 5)],
            ),
            Err(ContainerError::InvalidGlobalIndex)
        );
        assert_eq!(engine.transactions_count(), 0);
        assert_eq!(engine.transfers_count(), 0);
    }

    #[test]
    fn confirmation_rolls_back_on_failure() {
        let engine = container();
        let tx = funding_tx(1);
        engine
            .add_transaction(
                &TransferBlockInfo::unconfirmed(),
                &tx,
                &[incoming_unconfirmed(9, image(1))],
            )
            .unwrap();

        // Not enough global indexes: output 0 needs an entry.
        assert_eq!(
            engine.mark_transaction_confirmed(&block_at(50, 2), &tx.hash(), &[]),
            Err(ContainerError::NotEnoughGlobalIndexes)
        );

        // Still unconfirmed, nothing leaked into the available set.
        assert_eq!(engine.get_unconfirmed_transactions(), vec![tx.hash()]);
        assert_eq!(
            engine.balance(flags::INCLUDE_TYPE_KEY | flags::INCLUDE_STATE_LOCKED),
            9
        );
        assert_eq!(engine.balance(flags::INCLUDE_KEY_UNLOCKED), 0);

        // A later, correct confirmation succeeds.
        assert!(engine
            .mark_transaction_confirmed(&block_at(50, 2), &tx.hash(), &[77])
            .unwrap());
    }

    #[test]
    fn delete_unconfirmed_transaction_is_selective() {
        let engine = container();
        let pool_tx = funding_tx(1);
        let mined_tx = funding_tx(2);
        engine
            .add_transaction(
                &TransferBlockInfo::unconfirmed(),
                &pool_tx,
                &[incoming_unconfirmed(9, image(1))],
            )
            .unwrap();
        engine
            .add_transaction(&block_at(10, 0), &mined_tx, &[incoming(5, image(2), 11)])
            .unwrap();

        assert!(!engine.delete_unconfirmed_transaction(&mined_tx.hash()));
        assert!(!engine.delete_unconfirmed_transaction(&[9u8; 32]));
        assert!(engine.delete_unconfirmed_transaction(&pool_tx.hash()));
        assert!(engine.get_unconfirmed_transactions().is_empty());
        assert_eq!(engine.transfers_count(), 1);
    }

    #[test]
    fn spending_unconfirmed_outputs_is_rejected() {
        let engine = container();
        engine
            .add_transaction(
                &TransferBlockInfo::unconfirmed(),
                &funding_tx(1),
                &[incoming_unconfirmed(9, image(1))],
            )
            .unwrap();

        assert_eq!(
            engine.add_transaction(&block_at(10, 0), &spending_tx(2, 9, image(1)), &[]),
            Err(ContainerError::SpendOfUnconfirmedOutput)
        );
    }

    #[test]
    fn amount_mismatch_is_rejected() {
        let engine = container();
        engine
            .add_transaction(&block_at(100, 0), &funding_tx(1), &[incoming(7, image(1), 42)])
            .unwrap();
        assert_eq!(
            engine.add_transaction(&block_at(101, 0), &spending_tx(2, 8, image(1)), &[]),
            Err(ContainerError::AmountMismatch)
        );
    }

    #[test]
    fn foreign_inputs_are_ignored() {
        let engine = container();
        engine
            .add_transaction(&block_at(100, 0), &funding_tx(1), &[incoming(7, image(1), 42)])
            .unwrap();
        // Spends a key image this wallet never saw.
        let added = engine
            .add_transaction(&block_at(101, 0), &spending_tx(2, 7, image(9)), &[])
            .unwrap();
        assert!(!added);
        assert_eq!(engine.transactions_count(), 1);
        assert_eq!(engine.balance(flags::INCLUDE_KEY_UNLOCKED), 7);
    }

    #[test]
    fn duplicate_outputs_are_rejected() {
        let engine = container();
        let tx = funding_tx(1);
        engine
            .add_transaction(&block_at(100, 0), &tx, &[incoming(7, image(1), 42)])
            .unwrap();

        // Same (tx, position) under the same key image in a later tx is a
        // duplicate; a different position of a different tx is not.
        let mut duplicate = incoming(7, image(1), 43);
        duplicate.output_key = Some(some_key());
        let other_tx = funding_tx(2);
        let result = engine.add_transaction(&block_at(101, 0), &other_tx, &[duplicate]);
        assert!(result.is_ok());

        let mut multisig_a = incoming(3, image(2), 7);
        multisig_a.output_type = OutputType::Multisig;
        multisig_a.key_image = None;
        multisig_a.output_key = None;
        multisig_a.required_signatures = 1;
        let multisig_b = multisig_a.clone();
        engine
            .add_transaction(&block_at(102, 0), &funding_tx(3), &[multisig_a])
            .unwrap();
        assert_eq!(
            engine.add_transaction(&block_at(103, 0), &funding_tx(4), &[multisig_b]),
            Err(ContainerError::DuplicateOutput)
        );
    }

    #[test]
    fn multisig_outputs_spend_by_amount_and_index() {
        let engine = container();
        let mut transfer = incoming(30, image(1), 12);
        transfer.output_type = OutputType::Multisig;
        transfer.key_image = None;
        transfer.output_key = None;
        transfer.required_signatures = 2;
        engine
            .add_transaction(&block_at(100, 0), &funding_tx(1), &[transfer])
            .unwrap();
        assert_eq!(
            engine.balance(flags::INCLUDE_TYPE_MULTISIG | flags::INCLUDE_STATE_UNLOCKED),
            30
        );

        let spend = tx_with_inputs(
            2,
            vec![TransactionInput::Multisig(umb_transaction_core::MultisigInput {
                amount: 30,
                signature_count: 2,
                output_index: 12,
            })],
        );
        engine.add_transaction(&block_at(101, 0), &spend, &[]).unwrap();
        assert_eq!(
            engine.balance(flags::INCLUDE_TYPE_MULTISIG | flags::INCLUDE_STATE_UNLOCKED),
            0
        );
        assert_eq!(engine.get_spent_outputs().len(), 1);
    }

    #[test]
    fn detach_removes_unconfirmed_spender_of_detached_output() {
        let engine = container();
        let funding = funding_tx(1);
        engine
            .add_transaction(&block_at(100, 0), &funding, &[incoming(7, image(1), 42)])
            .unwrap();

        // An unconfirmed transaction spending the confirmed output.
        let pool_spend = spending_tx(2, 7, image(1));
        engine
            .add_transaction(&TransferBlockInfo::unconfirmed(), &pool_spend, &[])
            .unwrap();

        // Detaching the funding block must also drop the pool spend.
        let mut removed = engine.detach(100);
        removed.sort();
        let mut expected = vec![funding.hash(), pool_spend.hash()];
        expected.sort();
        assert_eq!(removed, expected);
        assert_eq!(engine.transfers_count(), 0);
    }

    #[test]
    fn soft_lock_and_height_advance() {
        let engine = TransfersContainer::new(currency(), 10);
        engine
            .add_transaction(&block_at(100, 0), &funding_tx(1), &[incoming(7, image(1), 42)])
            .unwrap();

        // Young output: soft-locked, not spendable.
        assert_eq!(engine.balance(flags::INCLUDE_KEY_UNLOCKED), 0);
        assert_eq!(
            engine.balance(flags::INCLUDE_TYPE_KEY | flags::INCLUDE_STATE_SOFT_LOCKED),
            7
        );

        assert!(engine.advance_height(110));
        assert_eq!(engine.balance(flags::INCLUDE_KEY_UNLOCKED), 7);
        // Heights never move backwards.
        assert!(!engine.advance_height(50));
        assert_eq!(engine.current_height(), 110);
    }

    #[test]
    fn save_load_roundtrip() {
        let engine = container();
        let tx1 = funding_tx(1);
        let tx2 = spending_tx(2, 7, image(1));
        engine
            .add_transaction(&block_at(100, 0), &tx1, &[incoming(7, image(1), 42)])
            .unwrap();
        engine
            .add_transaction(&block_at(101, 0), &tx2, &[incoming(3, image(2), 43)])
            .unwrap();

        let mut blob = Vec::new();
        engine.save(&mut blob).unwrap();

        let restored = container();
        restored.load(&mut blob.as_slice()).unwrap();
        assert_eq!(restored.current_height(), engine.current_height());
        assert_eq!(restored.transactions_count(), engine.transactions_count());
        assert_eq!(restored.transfers_count(), engine.transfers_count());
        assert_eq!(
            restored.balance(flags::INCLUDE_ALL),
            engine.balance(flags::INCLUDE_ALL)
        );
        assert_eq!(restored.get_spent_outputs(), engine.get_spent_outputs());
    }

    #[test]
    fn load_rejects_newer_versions() {
        let engine = container();
        let mut blob = Vec::new();
        bincode::serialize_into(&mut blob, &(STORAGE_VERSION + 1)).unwrap();
        assert_eq!(
            engine.load(&mut blob.as_slice()),
            Err(ContainerError::UnsupportedVersion(STORAGE_VERSION + 1))
        );
    }

    #[test]
    fn transaction_information_aggregates_amounts() {
        let engine = container();
        let tx1 = funding_tx(1);
        engine
            .add_transaction(&block_at(100, 0), &tx1, &[incoming(7, image(1), 42)])
            .unwrap();

        // tx2 spends the 7 and pays 3 back to this wallet.
        let tx2 = spending_tx(2, 7, image(1));
        engine
            .add_transaction(&block_at(101, 0), &tx2, &[incoming(3, image(2), 43)])
            .unwrap();

        let (record, amount_in, amount_out) =
            engine.get_transaction_information(&tx2.hash()).unwrap();
        assert_eq!(record.block_height, 101);
        assert_eq!(amount_in, 7);
        assert_eq!(amount_out, 3);

        let inputs = engine.get_transaction_inputs(&tx2.hash(), flags::INCLUDE_TYPE_ALL);
        assert_eq!(inputs.len(), 1);
        assert_eq!(inputs[0].amount, 7);
    }
}
