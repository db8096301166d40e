// Copyright (c) 2024 The Umbra Project

//! One-time (stealth) key derivation.
//!
//! The sender of an output with randomness `r` and recipient address
//! `(S, V)` publishes `R = r·G` in the transaction and derives the output
//! key `P_i = Hs(r·V ‖ i)·G + S` for output position `i`. The recipient
//! recognises the output with the view secret `v` (since `v·R = r·V`) and
//! spends it with `x_i = Hs(v·R ‖ i) + s`.

use core::fmt;

use curve25519_dalek::{constants::RISTRETTO_BASEPOINT_TABLE, scalar::Scalar};
use serde::{Deserialize, Serialize};
use umb_account_keys::Address;
use umb_crypto_keys::{hash_to_scalar, PrivateKey, PublicKey, KEY_LENGTH};
use zeroize::Zeroize;

const DERIVATION_DOMAIN_TAG: &[u8] = b"umbra-key-derivation";

/// The Diffie-Hellman shared secret between a transaction key and a view key.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize)]
#[zeroize(drop)]
pub struct KeyDerivation([u8; KEY_LENGTH]);

impl KeyDerivation {
    /// View the derivation as raw bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.0
    }

    /// The per-output scalar `Hs(D ‖ i)`.
    fn to_scalar(&self, output_index: u32) -> Scalar {
        hash_to_scalar(
            DERIVATION_DOMAIN_TAG,
            &[&self.0, &u64::from(output_index).to_le_bytes()],
        )
    }
}

impl fmt::Debug for KeyDerivation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyDerivation(..)")
    }
}

/// Compute the shared secret `sec·P`.
///
/// Called by the sender as `generate_key_derivation(V, r)` and by the
/// recipient as `generate_key_derivation(R, v)`; both yield the same value.
pub fn generate_key_derivation(public: &PublicKey, secret: &PrivateKey) -> KeyDerivation {
    let shared = secret.as_scalar() * public.as_point();
    KeyDerivation(shared.compress().to_bytes())
}

/// Derive the one-time public key `Hs(D ‖ i)·G + S`.
pub fn derive_public_key(
    derivation: &KeyDerivation,
    output_index: u32,
    spend_public: &PublicKey,
) -> PublicKey {
    let point =
        &derivation.to_scalar(output_index) * RISTRETTO_BASEPOINT_TABLE + spend_public.as_point();
    PublicKey::from_point(point)
}

/// Derive the one-time secret key `Hs(D ‖ i) + s`.
pub fn derive_secret_key(
    derivation: &KeyDerivation,
    output_index: u32,
    spend_secret: &PrivateKey,
) -> PrivateKey {
    PrivateKey::from_scalar(derivation.to_scalar(output_index) + spend_secret.as_scalar())
}

/// Sender-side derivation of the output key for `recipient` at `output_index`.
pub fn derive_output_public_key(
    tx_secret: &PrivateKey,
    output_index: u32,
    recipient: &Address,
) -> PublicKey {
    let derivation = generate_key_derivation(recipient.view_public_key(), tx_secret);
    derive_public_key(&derivation, output_index, recipient.spend_public_key())
}

/// Recipient-side recovery of the one-time secret key of an owned output.
pub fn derive_output_secret_key(
    tx_public: &PublicKey,
    output_index: u32,
    view_secret: &PrivateKey,
    spend_secret: &PrivateKey,
) -> PrivateKey {
    let derivation = generate_key_derivation(tx_public, view_secret);
    derive_secret_key(&derivation, output_index, spend_secret)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_core::OsRng;
    use umb_account_keys::AccountKeys;
    use umb_crypto_keys::KeyPair;

    #[test]
    fn sender_and_recipient_agree_on_derivation() {
        let mut rng = OsRng;
        let account = AccountKeys::random(&mut rng);
        let tx_keys = KeyPair::generate(&mut rng);

        let sender =
            generate_key_derivation(account.address().view_public_key(), &tx_keys.secret);
        let recipient = generate_key_derivation(&tx_keys.public, account.view_secret_key());
        assert_eq!(sender.as_bytes(), recipient.as_bytes());
    }

    #[test]
    fn recovered_secret_matches_output_key() {
        let mut rng = OsRng;
        let account = AccountKeys::random(&mut rng);
        let tx_keys = KeyPair::generate(&mut rng);

        for output_index in [0u32, 1, 7] {
            let output_key =
                derive_output_public_key(&tx_keys.secret, output_index, account.address());
            let recovered = derive_output_secret_key(
                &tx_keys.public,
                output_index,
                account.view_secret_key(),
                account.spend_secret_key(),
            );
            assert_eq!(PublicKey::from(&recovered), output_key);
        }
    }

    #[test]
    fn outputs_at_different_positions_are_unlinkable() {
        let mut rng = OsRng;
        let account = AccountKeys::random(&mut rng);
        let tx_keys = KeyPair::generate(&mut rng);

        let first = derive_output_public_key(&tx_keys.secret, 0, account.address());
        let second = derive_output_public_key(&tx_keys.secret, 1, account.address());
        assert_ne!(first, second);
    }
}
