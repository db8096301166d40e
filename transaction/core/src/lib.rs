// Copyright (c) 2024 The Umbra Project

//! The Umbra transaction model.
//!
//! This crate owns the on-chain data types (transactions, blocks, the tagged
//! `extra` field), the object-hash contracts, the "pretty amount"
//! decomposition, the transaction builder used by wallets, and the
//! structural validation predicates consensus relies on.

#![deny(missing_docs)]

mod amounts;
mod block;
mod builder;
mod currency;
mod error;
mod extra;
mod scan;
mod tx;
mod validation;

pub use amounts::{decompose_amount_into_digits, is_decomposed_amount};
pub use block::{Block, ParentBlock, BLOCK_MAJOR_VERSION_2};
pub use builder::{GlobalOutputEntry, InputKeyInfo, RealOutputInfo, TransactionBuilder};
pub use currency::Currency;
pub use error::{BuilderError, ExtraError};
pub use extra::{
    get_payment_id, get_transaction_public_key, parse_extra, serialize_extra, set_payment_id,
    ExtraField, UnknownTagPolicy, TX_EXTRA_NONCE_PAYMENT_ID, TX_EXTRA_TAG_MERGE_MINING,
    TX_EXTRA_TAG_NONCE, TX_EXTRA_TAG_PADDING, TX_EXTRA_TAG_PUBKEY,
};
pub use scan::find_outputs_to_account;
pub use tx::{
    absolute_output_offsets_to_relative, object_hash, relative_output_offsets_to_absolute,
    BaseInput, Hash, KeyInput, KeyOutput, MultisigInput, MultisigOutput, OutputTarget,
    Transaction, TransactionInput, TransactionOutput, TransactionPrefix, NULL_HASH,
};
pub use validation::{validate_inputs, validate_outputs, validate_signatures};
