// Copyright (c) 2024 The Umbra Project

//! Transaction types and object hashing.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use umb_crypto_keys::PublicKey;
use umb_crypto_ring_signature::{KeyImage, Signature};

/// A 32-byte object hash.
pub type Hash = [u8; 32];

/// The all-zero hash.
pub const NULL_HASH: Hash = [0u8; 32];

const OBJECT_HASH_DOMAIN_TAG: &[u8] = b"umbra-object-hash";

/// A coinbase input. Carries the height of the block it mints for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaseInput {
    /// The height of the block this coinbase belongs to.
    pub block_index: u32,
}

/// A ring input spending one key output out of a ring of candidates.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyInput {
    /// The amount being spent.
    pub amount: u64,
    /// Ring member positions in the global per-amount output set, stored in
    /// *relative* form: each entry is the difference to the previous
    /// absolute index.
    pub output_indexes: Vec<u32>,
    /// The key image of the spent output.
    pub key_image: KeyImage,
}

impl KeyInput {
    /// Ring size of this input.
    pub fn ring_size(&self) -> usize {
        self.output_indexes.len()
    }
}

/// An input spending a multisignature output.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultisigInput {
    /// The amount being spent.
    pub amount: u64,
    /// How many cosigner signatures accompany this input.
    pub signature_count: u32,
    /// The global index of the multisignature output being spent.
    pub output_index: u32,
}

/// A transaction input.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionInput {
    /// Coinbase.
    Base(BaseInput),
    /// Ring-signed key input.
    Key(KeyInput),
    /// Multisignature input.
    Multisig(MultisigInput),
}

impl TransactionInput {
    /// The amount this input contributes.
    pub fn amount(&self) -> u64 {
        match self {
            Self::Base(_) => 0,
            Self::Key(input) => input.amount,
            Self::Multisig(input) => input.amount,
        }
    }

    /// How many signatures this input requires.
    pub fn required_signatures(&self) -> usize {
        match self {
            Self::Base(_) => 0,
            Self::Key(input) => input.ring_size(),
            Self::Multisig(input) => input.signature_count as usize,
        }
    }
}

/// An output receivable by exactly one address.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyOutput {
    /// The one-time output key.
    pub key: PublicKey,
}

/// An output spendable once `required` of the listed keys sign.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultisigOutput {
    /// The cosigner keys.
    pub keys: Vec<PublicKey>,
    /// How many signatures are required to spend.
    pub required: u32,
}

/// The destination of a transaction output.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputTarget {
    /// A one-time key output.
    Key(KeyOutput),
    /// A multisignature output.
    Multisig(MultisigOutput),
}

/// A transaction output.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionOutput {
    /// The amount.
    pub amount: u64,
    /// Where the amount goes.
    pub target: OutputTarget,
}

/// Everything in a transaction except the signatures.
///
/// The hash of the prefix is the message ring and Schnorr signatures are
/// computed over.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionPrefix {
    /// Format version.
    pub version: u8,
    /// Below `Currency::max_block_height` this is a block index, otherwise a
    /// UNIX timestamp.
    pub unlock_time: u64,
    /// Inputs.
    pub inputs: Vec<TransactionInput>,
    /// Outputs.
    pub outputs: Vec<TransactionOutput>,
    /// The tagged extra field (see [`crate::parse_extra`]).
    pub extra: Vec<u8>,
}

impl Default for TransactionPrefix {
    fn default() -> Self {
        Self {
            version: 1,
            unlock_time: 0,
            inputs: Vec::new(),
            outputs: Vec::new(),
            extra: Vec::new(),
        }
    }
}

impl TransactionPrefix {
    /// The prefix hash: the message signatures commit to.
    pub fn hash(&self) -> Hash {
        object_hash(self)
    }

    /// Sum of output amounts. `None` on overflow.
    pub fn output_total_amount(&self) -> Option<u64> {
        self.outputs
            .iter()
            .try_fold(0u64, |acc, out| acc.checked_add(out.amount))
    }

    /// Sum of input amounts. `None` on overflow.
    pub fn input_total_amount(&self) -> Option<u64> {
        self.inputs
            .iter()
            .try_fold(0u64, |acc, input| acc.checked_add(input.amount()))
    }

    /// Whether the transaction is a coinbase (single base input).
    pub fn is_base(&self) -> bool {
        matches!(self.inputs.as_slice(), [TransactionInput::Base(_)])
    }

    /// The fee: inputs minus outputs, zero for a coinbase.
    pub fn fee(&self) -> u64 {
        if self.is_base() {
            return 0;
        }
        let inputs = self.input_total_amount().unwrap_or(0);
        let outputs = self.output_total_amount().unwrap_or(0);
        inputs.saturating_sub(outputs)
    }

    /// Key images of all key inputs, in input order.
    pub fn key_images(&self) -> Vec<KeyImage> {
        self.inputs
            .iter()
            .filter_map(|input| match input {
                TransactionInput::Key(input) => Some(input.key_image),
                _ => None,
            })
            .collect()
    }
}

/// A full transaction: prefix plus one signature vector per input.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// The signed portion.
    pub prefix: TransactionPrefix,
    /// `signatures[i]` holds the signatures of input `i`: the ring for a key
    /// input, `signature_count` Schnorr signatures for a multisig input,
    /// nothing for a coinbase input.
    pub signatures: Vec<Vec<Signature>>,
}

impl Transaction {
    /// The transaction id: hash over prefix and signatures.
    pub fn hash(&self) -> Hash {
        object_hash(self)
    }

    /// The prefix hash.
    pub fn prefix_hash(&self) -> Hash {
        self.prefix.hash()
    }

    /// Serialized size in bytes.
    pub fn binary_size(&self) -> usize {
        bincode::serialized_size(self).map(|s| s as usize).unwrap_or(0)
    }
}

/// Hash a serializable object with the protocol object-hash.
pub fn object_hash<T: Serialize>(object: &T) -> Hash {
    let bytes = bincode::serialize(object).expect("in-memory serialization cannot fail");
    let mut hasher = Sha256::new();
    hasher.update(OBJECT_HASH_DOMAIN_TAG);
    hasher.update(&bytes);
    hasher.finalize().into()
}

/// Convert sorted absolute global output indexes to the relative form stored
/// in a [`KeyInput`].
pub fn absolute_output_offsets_to_relative(offsets: &[u32]) -> Vec<u32> {
    let mut relative = offsets.to_vec();
    for i in (1..relative.len()).rev() {
        relative[i] -= relative[i - 1];
    }
    relative
}

/// Reconstruct absolute global output indexes from relative offsets.
pub fn relative_output_offsets_to_absolute(offsets: &[u32]) -> Vec<u32> {
    let mut absolute = offsets.to_vec();
    for i in 1..absolute.len() {
        absolute[i] = absolute[i].wrapping_add(absolute[i - 1]);
    }
    absolute
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offsets_roundtrip() {
        let absolute = vec![3u32, 7, 20, 21, 100];
        let relative = absolute_output_offsets_to_relative(&absolute);
        assert_eq!(relative, vec![3, 4, 13, 1, 79]);
        assert_eq!(relative_output_offsets_to_absolute(&relative), absolute);
    }

    #[test]
    fn tx_hash_covers_signatures() {
        let prefix = TransactionPrefix {
            inputs: vec![TransactionInput::Base(BaseInput { block_index: 4 })],
            ..Default::default()
        };
        let a = Transaction {
            prefix: prefix.clone(),
            signatures: vec![],
        };
        let b = Transaction {
            prefix,
            signatures: vec![vec![Signature::default()]],
        };
        assert_eq!(a.prefix_hash(), b.prefix_hash());
        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    fn serialization_roundtrip() {
        let tx = Transaction {
            prefix: TransactionPrefix {
                version: 1,
                unlock_time: 99,
                inputs: vec![
                    TransactionInput::Key(KeyInput {
                        amount: 70,
                        output_indexes: vec![4, 1, 2],
                        key_image: KeyImage::from([9u8; 32]),
                    }),
                    TransactionInput::Multisig(MultisigInput {
                        amount: 30,
                        signature_count: 2,
                        output_index: 12,
                    }),
                ],
                outputs: vec![],
                extra: vec![1, 2, 3],
            },
            signatures: vec![vec![Signature::default(); 3], vec![Signature::default(); 2]],
        };

        let bytes = bincode::serialize(&tx).unwrap();
        let parsed: Transaction = bincode::deserialize(&bytes).unwrap();
        assert_eq!(parsed, tx);
        assert_eq!(parsed.hash(), tx.hash());
    }

    #[test]
    fn fee_is_inputs_minus_outputs() {
        let mut prefix = TransactionPrefix::default();
        prefix.inputs.push(TransactionInput::Key(KeyInput {
            amount: 100,
            output_indexes: vec![0],
            key_image: KeyImage::default(),
        }));
        let key = umb_crypto_keys::KeyPair::generate(&mut rand_core::OsRng).public;
        prefix.outputs.push(TransactionOutput {
            amount: 90,
            target: OutputTarget::Key(KeyOutput { key }),
        });
        assert_eq!(prefix.fee(), 10);
    }
}
