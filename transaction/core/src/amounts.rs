// Copyright (c) 2024 The Umbra Project

//! "Pretty amount" decomposition.
//!
//! Splitting amounts into single-digit chunks (`d·10^k`) keeps the global
//! per-amount output sets dense, which is what makes ring mixing possible.
//! Digits at or below the dust threshold are folded into a single dust
//! output so the low digits of an amount are not leaked individually.

/// Decompose `amount` into digit chunks and at most one dust value.
///
/// Digit chunks are passed to `chunk_handler` from the least significant
/// digit upward. Low digits are accumulated into dust for as long as the
/// *running* dust sum stays within `dust_threshold`; the accumulated value
/// is handed to `dust_handler` exactly once, either right before the first
/// chunk that would push the sum over the threshold, or at the end if every
/// digit fit. The emitted values always sum back to `amount`.
pub fn decompose_amount_into_digits(
    amount: u64,
    dust_threshold: u64,
    mut chunk_handler: impl FnMut(u64),
    mut dust_handler: impl FnMut(u64),
) {
    if amount == 0 {
        return;
    }

    let mut amount = amount;
    let mut is_dust_handled = false;
    let mut dust = 0u64;
    let mut order = 1u64;

    while amount != 0 {
        let chunk = (amount % 10) * order;
        amount /= 10;
        order = order.saturating_mul(10);

        if dust + chunk <= dust_threshold {
            dust += chunk;
        } else {
            if !is_dust_handled && dust != 0 {
                dust_handler(dust);
                is_dust_handled = true;
            }
            if chunk != 0 {
                chunk_handler(chunk);
            }
        }
    }

    if !is_dust_handled && dust != 0 {
        dust_handler(dust);
    }
}

/// Whether `amount` is a single decomposed chunk, i.e. `d·10^k` for a digit
/// `1 ≤ d ≤ 9`.
pub fn is_decomposed_amount(amount: u64) -> bool {
    if amount == 0 {
        return false;
    }
    let mut amount = amount;
    while amount % 10 == 0 {
        amount /= 10;
    }
    amount < 10
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decompose(amount: u64, dust_threshold: u64) -> (Vec<u64>, Option<u64>) {
        let mut chunks = Vec::new();
        let mut dust = None;
        decompose_amount_into_digits(
            amount,
            dust_threshold,
            |chunk| chunks.push(chunk),
            |value| {
                assert!(dust.is_none(), "dust must be emitted at most once");
                dust = Some(value);
            },
        );
        (chunks, dust)
    }

    #[test]
    fn zero_amount_emits_nothing() {
        assert_eq!(decompose(0, 0), (vec![], None));
        assert_eq!(decompose(0, 10), (vec![], None));
    }

    #[test]
    fn single_digit_without_dust() {
        assert_eq!(decompose(10, 0), (vec![10], None));
    }

    #[test]
    fn amount_equal_to_threshold_is_dust() {
        assert_eq!(decompose(10, 10), (vec![], Some(10)));
    }

    #[test]
    fn amount_entirely_below_threshold() {
        assert_eq!(decompose(8100, 1_000_000), (vec![], Some(8100)));
    }

    #[test]
    fn no_dust_when_all_digits_clear_threshold() {
        assert_eq!(
            decompose(8_900_100, 10),
            (vec![100, 900_000, 8_000_000], None)
        );
    }

    #[test]
    fn low_digits_fold_into_dust() {
        assert_eq!(
            decompose(8_900_100, 1000),
            (vec![900_000, 8_000_000], Some(100))
        );
    }

    #[test]
    fn dust_is_bounded_by_the_running_sum() {
        // 9 and 10 each fit under the threshold alone, but together they
        // exceed it: the running sum stops at 9 and 10 stays a chunk.
        assert_eq!(decompose(19, 15), (vec![10], Some(9)));
        // 455_827 accumulates digit by digit without ever crossing.
        assert_eq!(
            decompose(62_387_455_827, 455_827),
            (
                vec![
                    7_000_000,
                    80_000_000,
                    300_000_000,
                    2_000_000_000,
                    60_000_000_000
                ],
                Some(455_827)
            )
        );
    }

    #[test]
    fn decomposition_sums_back_to_amount() {
        for amount in [1u64, 9, 10, 99, 1234, 8_900_100, u64::from(u32::MAX)] {
            for dust_threshold in [0u64, 1, 10, 1000, 1_000_000] {
                let (chunks, dust) = decompose(amount, dust_threshold);
                let total: u64 = chunks.iter().sum::<u64>() + dust.unwrap_or(0);
                assert_eq!(total, amount, "amount {amount} dust {dust_threshold}");
                for chunk in chunks {
                    assert!(is_decomposed_amount(chunk));
                }
            }
        }
    }

    #[test]
    fn decomposed_amount_predicate() {
        for pretty in [1u64, 9, 50, 700, 8_000_000] {
            assert!(is_decomposed_amount(pretty));
        }
        for ugly in [0u64, 11, 102, 8_900_100] {
            assert!(!is_decomposed_amount(ugly));
        }
    }
}
