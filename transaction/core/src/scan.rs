// Copyright (c) 2024 The Umbra Project

//! Recipient-side output discovery.

use umb_crypto_keys::{PrivateKey, PublicKey};
use umb_crypto_ring_signature::{derive_public_key, generate_key_derivation};

use crate::{
    extra::{get_transaction_public_key, parse_extra, UnknownTagPolicy},
    tx::{OutputTarget, TransactionPrefix},
};

/// Scan a transaction for outputs addressed to `(spend_public, view_secret)`.
///
/// Recovers the transaction public key from `extra`, computes the shared
/// derivation with the view secret, and re-derives the expected one-time key
/// of every output position. Returns the matching output indexes in order.
/// A transaction without a parseable public key yields nothing.
pub fn find_outputs_to_account(
    prefix: &TransactionPrefix,
    spend_public: &PublicKey,
    view_secret: &PrivateKey,
) -> Vec<u32> {
    let Ok(fields) = parse_extra(&prefix.extra, UnknownTagPolicy::OpaqueTail) else {
        return Vec::new();
    };
    let Some(tx_public_bytes) = get_transaction_public_key(&fields) else {
        return Vec::new();
    };
    let Ok(tx_public) = PublicKey::try_from(&tx_public_bytes[..]) else {
        return Vec::new();
    };

    let derivation = generate_key_derivation(&tx_public, view_secret);

    let mut found = Vec::new();
    for (index, output) in prefix.outputs.iter().enumerate() {
        let index = index as u32;
        let expected = derive_public_key(&derivation, index, spend_public);
        let owned = match &output.target {
            OutputTarget::Key(key_output) => key_output.key == expected,
            OutputTarget::Multisig(multisig) => {
                multisig.keys.iter().any(|key| *key == expected)
            }
        };
        if owned {
            found.push(index);
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tx::{KeyOutput, MultisigOutput, TransactionOutput};
    use rand_core::OsRng;
    use umb_account_keys::AccountKeys;
    use umb_crypto_keys::KeyPair;
    use umb_crypto_ring_signature::derive_output_public_key;

    #[test]
    fn finds_key_and_multisig_outputs() {
        let mut rng = OsRng;
        let account = AccountKeys::random(&mut rng);
        let stranger = AccountKeys::random(&mut rng);
        let tx_keys = KeyPair::generate(&mut rng);

        let mut prefix = TransactionPrefix::default();
        prefix.extra = crate::serialize_extra(&[crate::ExtraField::PublicKey {
            key: tx_keys.public.to_bytes(),
        }])
        .unwrap();

        // Output 0: ours. Output 1: someone else's. Output 2: multisig with
        // one of our keys among the cosigners.
        prefix.outputs.push(TransactionOutput {
            amount: 10,
            target: OutputTarget::Key(KeyOutput {
                key: derive_output_public_key(&tx_keys.secret, 0, account.address()),
            }),
        });
        prefix.outputs.push(TransactionOutput {
            amount: 20,
            target: OutputTarget::Key(KeyOutput {
                key: derive_output_public_key(&tx_keys.secret, 1, stranger.address()),
            }),
        });
        prefix.outputs.push(TransactionOutput {
            amount: 30,
            target: OutputTarget::Multisig(MultisigOutput {
                keys: vec![
                    derive_output_public_key(&tx_keys.secret, 2, stranger.address()),
                    derive_output_public_key(&tx_keys.secret, 2, account.address()),
                ],
                required: 2,
            }),
        });

        let found = find_outputs_to_account(
            &prefix,
            account.address().spend_public_key(),
            account.view_secret_key(),
        );
        assert_eq!(found, vec![0, 2]);
    }

    #[test]
    fn missing_tx_public_key_yields_nothing() {
        let mut rng = OsRng;
        let account = AccountKeys::random(&mut rng);
        let prefix = TransactionPrefix::default();
        assert!(find_outputs_to_account(
            &prefix,
            account.address().spend_public_key(),
            account.view_secret_key(),
        )
        .is_empty());
    }
}
