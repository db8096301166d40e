// Copyright (c) 2024 The Umbra Project

//! Structural validation predicates.
//!
//! These check shape, not cryptography: signature verification happens in
//! `umb-crypto-ring-signature`, double-spend detection against the chain is
//! the node's job.

use std::collections::HashSet;

use crate::tx::{OutputTarget, Transaction, TransactionInput, TransactionPrefix};

/// Validate the inputs of a transaction.
///
/// Checks that input amounts sum without overflow, that no two key inputs
/// share a key image, that no two multisig inputs spend the same
/// `(amount, output_index)`, that key inputs have non-empty rings with
/// strictly monotonic ring member offsets, and that a coinbase input only
/// appears alone.
pub fn validate_inputs(prefix: &TransactionPrefix) -> bool {
    if prefix.input_total_amount().is_none() {
        return false;
    }

    let mut key_images = HashSet::new();
    let mut multisig_outputs = HashSet::new();

    for input in &prefix.inputs {
        match input {
            TransactionInput::Base(_) => {
                if prefix.inputs.len() != 1 {
                    return false;
                }
            }
            TransactionInput::Key(input) => {
                if input.output_indexes.is_empty() {
                    return false;
                }
                // Relative offsets after the first must be non-zero, which is
                // what makes the absolute indexes strictly monotonic.
                if input.output_indexes[1..].iter().any(|&offset| offset == 0) {
                    return false;
                }
                if !key_images.insert(input.key_image) {
                    return false;
                }
            }
            TransactionInput::Multisig(input) => {
                if input.signature_count == 0 {
                    return false;
                }
                if !multisig_outputs.insert((input.amount, input.output_index)) {
                    return false;
                }
            }
        }
    }
    true
}

/// Validate the outputs of a transaction.
///
/// Every amount must be non-zero, multisig outputs well formed
/// (`1 ≤ required ≤ keys.len()`), and the total must not overflow.
pub fn validate_outputs(prefix: &TransactionPrefix) -> bool {
    if prefix.output_total_amount().is_none() {
        return false;
    }
    for output in &prefix.outputs {
        if output.amount == 0 {
            return false;
        }
        if let OutputTarget::Multisig(multisig) = &output.target {
            if multisig.required == 0 || multisig.required as usize > multisig.keys.len() {
                return false;
            }
        }
    }
    true
}

/// Validate the signature layout of a transaction.
///
/// `signatures` must hold one vector per input, sized to the input's
/// requirement: the ring size for a key input, `signature_count` for a
/// multisig input, zero for a coinbase input.
pub fn validate_signatures(tx: &Transaction) -> bool {
    if tx.signatures.len() != tx.prefix.inputs.len() {
        return false;
    }
    tx.prefix
        .inputs
        .iter()
        .zip(&tx.signatures)
        .all(|(input, signatures)| signatures.len() == input.required_signatures())
}
