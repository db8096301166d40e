// Copyright (c) 2024 The Umbra Project

//! Wallet-side transaction construction.
//!
//! The builder owns the transaction key pair, derives one-time output keys
//! for recipients, recovers the ephemeral spend keys of the wallet's own
//! inputs, and ring-signs every key input over the prefix hash. Mutating
//! inputs or outputs after signing discards the signatures; `build` refuses
//! to produce a partially signed transaction.

use rand_core::CryptoRngCore;
use umb_account_keys::{AccountKeys, Address};
use umb_crypto_keys::{KeyPair, PrivateKey, PublicKey};
use umb_crypto_ring_signature::{
    derive_output_public_key, derive_public_key, derive_secret_key, generate_key_derivation,
    generate_key_image, generate_ring_signature, generate_signature, KeyImage, Signature,
};

use crate::{
    absolute_output_offsets_to_relative,
    error::BuilderError,
    extra::{serialize_extra, ExtraField},
    tx::{
        BaseInput, KeyInput, KeyOutput, MultisigInput, MultisigOutput, OutputTarget, Transaction,
        TransactionInput, TransactionOutput, TransactionPrefix,
    },
    Hash,
};

/// One ring member: a global output index and its one-time key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GlobalOutputEntry {
    /// Position in the global per-amount output set.
    pub index: u32,
    /// The output's one-time key.
    pub key: PublicKey,
}

/// Which ring member is the real one, and how to re-derive its key.
#[derive(Clone, Debug)]
pub struct RealOutputInfo {
    /// The public key of the transaction that created the real output.
    pub transaction_public_key: PublicKey,
    /// Position of the real output within the ring.
    pub index_in_ring: usize,
    /// Position of the real output within its transaction.
    pub output_in_transaction: u32,
}

/// Everything needed to add one ring-signed input.
#[derive(Clone, Debug)]
pub struct InputKeyInfo {
    /// The amount being spent.
    pub amount: u64,
    /// The ring, sorted ascending by global index.
    pub outputs: Vec<GlobalOutputEntry>,
    /// The real member of the ring.
    pub real_output: RealOutputInfo,
}

struct PendingRing {
    ring: Vec<PublicKey>,
    real_index: usize,
    ephemeral_secret: PrivateKey,
    key_image: KeyImage,
}

enum PendingSignatures {
    /// Coinbase input; carries no signatures.
    None,
    /// Ring input awaiting `sign_inputs`.
    Ring(PendingRing),
    /// Multisignature input collecting cosigner signatures.
    Multisig {
        required: u32,
        collected: Vec<Signature>,
    },
}

/// Builds and signs a transaction.
pub struct TransactionBuilder {
    prefix: TransactionPrefix,
    transaction_keys: KeyPair,
    extra_fields: Vec<ExtraField>,
    extra_tail: Vec<u8>,
    pending: Vec<PendingSignatures>,
    ring_signatures: Vec<Option<Vec<Signature>>>,
}

impl TransactionBuilder {
    /// Start a transaction with a fresh transaction key pair.
    pub fn new(rng: &mut dyn CryptoRngCore) -> Self {
        let transaction_keys = KeyPair::generate(rng);
        let extra_fields = vec![ExtraField::PublicKey {
            key: transaction_keys.public.to_bytes(),
        }];
        Self {
            prefix: TransactionPrefix::default(),
            transaction_keys,
            extra_fields,
            extra_tail: Vec::new(),
            pending: Vec::new(),
            ring_signatures: Vec::new(),
        }
    }

    /// The transaction public key committed in `extra`.
    pub fn transaction_public_key(&self) -> &PublicKey {
        &self.transaction_keys.public
    }

    /// The transaction secret key; needed for payment proofs.
    pub fn transaction_secret_key(&self) -> &PrivateKey {
        &self.transaction_keys.secret
    }

    /// Number of inputs added so far.
    pub fn input_count(&self) -> usize {
        self.prefix.inputs.len()
    }

    /// Number of outputs added so far.
    pub fn output_count(&self) -> usize {
        self.prefix.outputs.len()
    }

    /// Set the unlock time. Discards any existing signatures.
    pub fn set_unlock_time(&mut self, unlock_time: u64) {
        self.prefix.unlock_time = unlock_time;
        self.invalidate_signatures();
    }

    /// Append raw bytes to the extra field, after the tagged records.
    pub fn append_extra(&mut self, raw: &[u8]) {
        self.extra_tail.extend_from_slice(raw);
        self.invalidate_signatures();
    }

    /// Set the payment id nonce, replacing any existing nonce record.
    pub fn set_payment_id(&mut self, payment_id: Hash) {
        crate::extra::set_payment_id(&mut self.extra_fields, payment_id);
        self.invalidate_signatures();
    }

    /// Add a coinbase input.
    pub fn add_base_input(&mut self, block_index: u32) -> usize {
        self.prefix
            .inputs
            .push(TransactionInput::Base(BaseInput { block_index }));
        self.pending.push(PendingSignatures::None);
        self.invalidate_signatures();
        self.prefix.inputs.len() - 1
    }

    /// Add a ring-signed key input spending one of `account`'s outputs.
    ///
    /// Recovers the ephemeral key pair of the real output, computes its key
    /// image, and stores the ring member indexes in relative form.
    pub fn add_key_input(
        &mut self,
        account: &AccountKeys,
        info: &InputKeyInfo,
    ) -> Result<usize, BuilderError> {
        let real = info
            .outputs
            .get(info.real_output.index_in_ring)
            .ok_or(BuilderError::InvalidInputIndex(info.real_output.index_in_ring))?;

        let derivation = generate_key_derivation(
            &info.real_output.transaction_public_key,
            account.view_secret_key(),
        );
        let ephemeral_secret = derive_secret_key(
            &derivation,
            info.real_output.output_in_transaction,
            account.spend_secret_key(),
        );
        let ephemeral_public = derive_public_key(
            &derivation,
            info.real_output.output_in_transaction,
            account.address().spend_public_key(),
        );

        if ephemeral_public != real.key {
            return Err(BuilderError::InvalidSecretKey);
        }

        let key_image = generate_key_image(&ephemeral_public, &ephemeral_secret);

        let absolute: Vec<u32> = info.outputs.iter().map(|out| out.index).collect();
        self.prefix.inputs.push(TransactionInput::Key(KeyInput {
            amount: info.amount,
            output_indexes: absolute_output_offsets_to_relative(&absolute),
            key_image,
        }));
        self.pending.push(PendingSignatures::Ring(PendingRing {
            ring: info.outputs.iter().map(|out| out.key).collect(),
            real_index: info.real_output.index_in_ring,
            ephemeral_secret,
            key_image,
        }));
        self.invalidate_signatures();
        Ok(self.prefix.inputs.len() - 1)
    }

    /// Add a multisignature input. Cosigners sign it afterwards with
    /// [`TransactionBuilder::sign_multisig_input`].
    pub fn add_multisig_input(&mut self, input: MultisigInput) -> usize {
        let required = input.signature_count;
        self.prefix.inputs.push(TransactionInput::Multisig(input));
        self.pending.push(PendingSignatures::Multisig {
            required,
            collected: Vec::new(),
        });
        self.invalidate_signatures();
        self.prefix.inputs.len() - 1
    }

    /// Add a one-time key output to `recipient`.
    pub fn add_key_output(&mut self, amount: u64, recipient: &Address) -> usize {
        let index = self.prefix.outputs.len() as u32;
        let key = derive_output_public_key(&self.transaction_keys.secret, index, recipient);
        self.prefix.outputs.push(TransactionOutput {
            amount,
            target: OutputTarget::Key(KeyOutput { key }),
        });
        self.invalidate_signatures();
        index as usize
    }

    /// Add a multisignature output whose constituent keys are derived for
    /// each cosigner address.
    pub fn add_multisig_output(
        &mut self,
        amount: u64,
        cosigners: &[Address],
        required: u32,
    ) -> usize {
        let index = self.prefix.outputs.len() as u32;
        let keys = cosigners
            .iter()
            .map(|address| {
                derive_output_public_key(&self.transaction_keys.secret, index, address)
            })
            .collect();
        self.prefix.outputs.push(TransactionOutput {
            amount,
            target: OutputTarget::Multisig(MultisigOutput { keys, required }),
        });
        self.invalidate_signatures();
        index as usize
    }

    /// Ring-sign every key input over the prefix hash.
    pub fn sign_inputs(&mut self, rng: &mut dyn CryptoRngCore) -> Result<(), BuilderError> {
        self.sync_extra()?;
        let prefix_hash = self.prefix.hash();

        for (index, pending) in self.pending.iter().enumerate() {
            if let PendingSignatures::Ring(ring) = pending {
                let signatures = generate_ring_signature(
                    &prefix_hash,
                    &ring.key_image,
                    &ring.ring,
                    &ring.ephemeral_secret,
                    ring.real_index,
                    rng,
                )?;
                self.ring_signatures[index] = Some(signatures);
            }
        }
        Ok(())
    }

    /// Append one cosigner's Schnorr signature to a multisignature input.
    pub fn sign_multisig_input(
        &mut self,
        input_index: usize,
        cosigner_key: &KeyPair,
        rng: &mut dyn CryptoRngCore,
    ) -> Result<(), BuilderError> {
        self.sync_extra()?;
        let prefix_hash = self.prefix.hash();
        match self.pending.get_mut(input_index) {
            Some(PendingSignatures::Multisig { collected, .. }) => {
                collected.push(generate_signature(
                    &prefix_hash,
                    &cosigner_key.public,
                    &cosigner_key.secret,
                    rng,
                ));
                Ok(())
            }
            Some(_) => Err(BuilderError::InvalidInputIndex(input_index)),
            None => Err(BuilderError::InvalidInputIndex(input_index)),
        }
    }

    /// Assemble the final transaction.
    ///
    /// Fails with [`BuilderError::SignatureRequired`] unless every input
    /// carries its full set of signatures.
    pub fn build(mut self) -> Result<Transaction, BuilderError> {
        self.sync_extra()?;

        let mut signatures = Vec::with_capacity(self.pending.len());
        for (index, pending) in self.pending.iter_mut().enumerate() {
            match pending {
                PendingSignatures::None => signatures.push(Vec::new()),
                PendingSignatures::Ring(_) => match self.ring_signatures[index].take() {
                    Some(ring_signatures) => signatures.push(ring_signatures),
                    None => return Err(BuilderError::SignatureRequired),
                },
                PendingSignatures::Multisig {
                    required,
                    collected,
                } => {
                    if collected.len() != *required as usize {
                        return Err(BuilderError::SignatureRequired);
                    }
                    signatures.push(std::mem::take(collected));
                }
            }
        }

        Ok(Transaction {
            prefix: self.prefix,
            signatures,
        })
    }

    fn sync_extra(&mut self) -> Result<(), BuilderError> {
        let mut extra = serialize_extra(&self.extra_fields)?;
        extra.extend_from_slice(&self.extra_tail);
        self.prefix.extra = extra;
        Ok(())
    }

    fn invalidate_signatures(&mut self) {
        self.ring_signatures = vec![None; self.pending.len()];
        for pending in &mut self.pending {
            if let PendingSignatures::Multisig { collected, .. } = pending {
                collected.clear();
            }
        }
    }
}
