// Copyright (c) 2024 The Umbra Project

//! Chain-wide constants and the predicates derived from them.

use crate::amounts::decompose_amount_into_digits;

/// Parameters of the Umbra currency.
///
/// Everything the transaction layer and the wallet need to agree on lives
/// here: fee floors, dust thresholds, fusion-transaction shape limits and
/// the unlock-time interpretation boundary.
#[derive(Clone, Debug)]
pub struct Currency {
    /// Unlock times below this value are block indexes, above it timestamps.
    pub max_block_height: u64,
    /// The smallest fee a relayed transaction may pay.
    pub minimum_fee: u64,
    /// Digit chunks at or below this value count as dust.
    pub default_dust_threshold: u64,
    /// Hard cap on a serialized transaction.
    pub upper_transaction_size_limit: usize,
    /// Hard cap on a serialized fusion transaction.
    pub fusion_tx_max_size: usize,
    /// A fusion transaction must consume at least this many inputs.
    pub fusion_tx_min_input_count: usize,
    /// A fusion transaction must have at least this many times more inputs
    /// than outputs.
    pub fusion_tx_min_in_out_count_ratio: usize,
    /// Slack allowed when comparing an unlock height against the chain tip.
    pub locked_tx_allowed_delta_blocks: u64,
    /// Slack allowed when comparing an unlock timestamp against wall time.
    pub locked_tx_allowed_delta_seconds: u64,
}

impl Default for Currency {
    fn default() -> Self {
        Self {
            max_block_height: 500_000_000,
            minimum_fee: 1_000_000,
            default_dust_threshold: 1_000_000,
            upper_transaction_size_limit: 512 * 1024,
            fusion_tx_max_size: 30 * 1024,
            fusion_tx_min_input_count: 12,
            fusion_tx_min_in_out_count_ratio: 4,
            locked_tx_allowed_delta_blocks: 1,
            locked_tx_allowed_delta_seconds: 60 * 60 * 24,
        }
    }
}

impl Currency {
    /// Whether a transaction with these input/output amounts and serialized
    /// size qualifies as a fusion transaction. A `size` of zero skips the
    /// size check (used when classifying received transactions).
    pub fn is_fusion_transaction(
        &self,
        input_amounts: &[u64],
        output_amounts: &[u64],
        size: usize,
    ) -> bool {
        if size != 0 && size > self.fusion_tx_max_size {
            return false;
        }
        if input_amounts.len() < self.fusion_tx_min_input_count {
            return false;
        }
        if input_amounts.len() < output_amounts.len() * self.fusion_tx_min_in_out_count_ratio {
            return false;
        }

        let mut input_total: u64 = 0;
        for &amount in input_amounts {
            if amount <= self.default_dust_threshold {
                return false;
            }
            input_total = match input_total.checked_add(amount) {
                Some(total) => total,
                None => return false,
            };
        }

        let expected = std::cell::RefCell::new(Vec::with_capacity(output_amounts.len()));
        decompose_amount_into_digits(
            input_total,
            self.default_dust_threshold,
            |chunk| expected.borrow_mut().push(chunk),
            |dust| expected.borrow_mut().push(dust),
        );
        let mut expected = expected.into_inner();
        expected.sort_unstable();

        let mut actual = output_amounts.to_vec();
        actual.sort_unstable();
        expected == actual
    }

    /// Approximate serialized size of a transaction with the given shape,
    /// from the serialized sizes of the fixed parts.
    pub fn approximate_transaction_size(
        input_count: usize,
        output_count: usize,
        mixin: usize,
    ) -> usize {
        let (header_size, outputs_size, input_size) = Self::size_parts(output_count, mixin);
        header_size + outputs_size + input_count * input_size
    }

    /// Upper bound on how many inputs fit in a transaction of
    /// `transaction_size` bytes with `output_count` outputs and `mixin`
    /// decoys per input, from the serialized sizes of the fixed parts.
    pub fn approximate_maximum_input_count(
        transaction_size: usize,
        output_count: usize,
        mixin: usize,
    ) -> usize {
        let (header_size, outputs_size, input_size) = Self::size_parts(output_count, mixin);
        transaction_size.saturating_sub(header_size + outputs_size) / input_size
    }

    fn size_parts(output_count: usize, mixin: usize) -> (usize, usize, usize) {
        const KEY_IMAGE_SIZE: usize = 32;
        const OUTPUT_KEY_SIZE: usize = 32;
        const AMOUNT_SIZE: usize = 8 + 2;
        const GLOBAL_INDEXES_VECTOR_SIZE_SIZE: usize = 1;
        const GLOBAL_INDEXES_INITIAL_VALUE_SIZE: usize = 4;
        const GLOBAL_INDEXES_DIFFERENCE_SIZE: usize = 4;
        const SIGNATURE_SIZE: usize = 64;
        const EXTRA_TAG_SIZE: usize = 1;
        const INPUT_TAG_SIZE: usize = 1;
        const OUTPUT_TAG_SIZE: usize = 1;
        const PUBLIC_KEY_SIZE: usize = 32;
        const TRANSACTION_VERSION_SIZE: usize = 1;
        const TRANSACTION_UNLOCK_TIME_SIZE: usize = 8 + 2;

        let outputs_size = output_count * (OUTPUT_TAG_SIZE + OUTPUT_KEY_SIZE + AMOUNT_SIZE);
        let header_size = TRANSACTION_VERSION_SIZE
            + TRANSACTION_UNLOCK_TIME_SIZE
            + EXTRA_TAG_SIZE
            + PUBLIC_KEY_SIZE;
        let input_size = INPUT_TAG_SIZE
            + AMOUNT_SIZE
            + KEY_IMAGE_SIZE
            + SIGNATURE_SIZE
            + GLOBAL_INDEXES_VECTOR_SIZE_SIZE
            + GLOBAL_INDEXES_INITIAL_VALUE_SIZE
            + mixin * (GLOBAL_INDEXES_DIFFERENCE_SIZE + SIGNATURE_SIZE);

        (header_size, outputs_size, input_size)
    }
}
