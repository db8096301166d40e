// Copyright (c) 2024 The Umbra Project

//! Block types.

use serde::{Deserialize, Serialize};

use crate::tx::{object_hash, Hash, Transaction, TransactionInput};

/// First major version with a merge-mining parent block envelope.
pub const BLOCK_MAJOR_VERSION_2: u8 = 2;

/// The parent-chain envelope of a merge-mined block.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentBlock {
    /// Parent chain major version.
    pub major_version: u8,
    /// Parent chain minor version.
    pub minor_version: u8,
    /// Hash of the parent chain's previous block.
    pub previous_block_hash: Hash,
    /// Parent chain nonce; the actual proof-of-work nonce for version ≥ 2.
    pub nonce: u32,
    /// Number of transactions in the parent block.
    pub transaction_count: u16,
    /// Merkle branch binding the parent coinbase to the parent block.
    pub base_transaction_branch: Vec<Hash>,
    /// The parent chain's coinbase, which carries the merge-mining tag.
    pub base_transaction: Transaction,
    /// Merkle branch binding this chain into the merge-mining tree.
    pub blockchain_branch: Vec<Hash>,
}

/// A block.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Major (consensus) version.
    pub major_version: u8,
    /// Minor (vote) version.
    pub minor_version: u8,
    /// UNIX timestamp chosen by the miner.
    pub timestamp: u64,
    /// Hash of the previous block.
    pub previous_block_hash: Hash,
    /// Proof-of-work nonce. Ignored when a parent block is present.
    pub nonce: u32,
    /// The merge-mining envelope; present iff `major_version ≥ 2`.
    pub parent_block: Option<ParentBlock>,
    /// The coinbase transaction.
    pub base_transaction: Transaction,
    /// Hashes of the non-coinbase transactions in the block.
    pub transaction_hashes: Vec<Hash>,
}

impl Block {
    /// The block id.
    pub fn hash(&self) -> Hash {
        object_hash(self)
    }

    /// The height this block mints for, read from the coinbase input.
    pub fn height(&self) -> Option<u32> {
        match self.base_transaction.prefix.inputs.first() {
            Some(TransactionInput::Base(base)) => Some(base.block_index),
            _ => None,
        }
    }

    /// Structural check: coinbase shape and parent-block presence match the
    /// major version.
    pub fn is_well_formed(&self) -> bool {
        if !self.base_transaction.prefix.is_base() {
            return false;
        }
        let wants_parent = self.major_version >= BLOCK_MAJOR_VERSION_2;
        wants_parent == self.parent_block.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tx::{BaseInput, TransactionPrefix};

    fn coinbase(height: u32) -> Transaction {
        Transaction {
            prefix: TransactionPrefix {
                inputs: vec![TransactionInput::Base(BaseInput {
                    block_index: height,
                })],
                ..TransactionPrefix::default()
            },
            signatures: Vec::new(),
        }
    }

    fn block_at(height: u32) -> Block {
        Block {
            major_version: 1,
            minor_version: 0,
            timestamp: 1_700_000_000,
            previous_block_hash: [height as u8; 32],
            nonce: 7,
            parent_block: None,
            base_transaction: coinbase(height),
            transaction_hashes: Vec::new(),
        }
    }

    #[test]
    fn height_comes_from_coinbase() {
        assert_eq!(block_at(42).height(), Some(42));
    }

    #[test]
    fn version_one_rejects_parent_block() {
        let block = block_at(1);
        assert!(block.is_well_formed());

        let mut merged = block.clone();
        merged.parent_block = Some(ParentBlock {
            major_version: 1,
            minor_version: 0,
            previous_block_hash: [0; 32],
            nonce: 0,
            transaction_count: 1,
            base_transaction_branch: Vec::new(),
            base_transaction: coinbase(1),
            blockchain_branch: Vec::new(),
        });
        assert!(!merged.is_well_formed());

        merged.major_version = BLOCK_MAJOR_VERSION_2;
        assert!(merged.is_well_formed());
    }

    #[test]
    fn block_hash_covers_nonce() {
        let a = block_at(5);
        let mut b = a.clone();
        b.nonce += 1;
        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    fn block_serialization_roundtrip() {
        let block = block_at(12);
        let bytes = bincode::serialize(&block).unwrap();
        let parsed: Block = bincode::deserialize(&bytes).unwrap();
        assert_eq!(parsed, block);
        assert_eq!(parsed.hash(), block.hash());
    }
}
