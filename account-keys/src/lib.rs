// Copyright (c) 2024 The Umbra Project

//! Umbra account keys.
//!
//! An account is a pair of key pairs: the view pair `(v, V)` discloses which
//! outputs an account received, the spend pair `(s, S)` authorizes spending
//! them. A wallet may hold many spend pairs ("subaddresses") which all share
//! one view pair; only the public halves `(S, V)` are given to senders.

#![deny(missing_docs)]

use core::fmt;

use rand_core::CryptoRngCore;
use serde::{Deserialize, Serialize};
use umb_crypto_keys::{KeyPair, PrivateKey, PublicKey, KEY_LENGTH};

mod error;

pub use error::AddressError;

/// The human-readable prefix of a formatted address.
pub const ADDRESS_PREFIX: &str = "UMB";

/// A public address: the two public keys a sender needs.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address {
    /// The public spend key `S`.
    spend_public: PublicKey,
    /// The public view key `V`.
    view_public: PublicKey,
}

impl Address {
    /// Create an address from its two public keys.
    pub fn new(spend_public: PublicKey, view_public: PublicKey) -> Self {
        Self {
            spend_public,
            view_public,
        }
    }

    /// The public spend key.
    pub fn spend_public_key(&self) -> &PublicKey {
        &self.spend_public
    }

    /// The public view key.
    pub fn view_public_key(&self) -> &PublicKey {
        &self.view_public
    }

    /// Parse an address from its string form.
    pub fn from_string(s: &str) -> Result<Self, AddressError> {
        let hex_part = s
            .strip_prefix(ADDRESS_PREFIX)
            .ok_or(AddressError::MissingPrefix)?;
        let bytes = hex::decode(hex_part).map_err(|_| AddressError::InvalidEncoding)?;
        if bytes.len() != 2 * KEY_LENGTH {
            return Err(AddressError::InvalidLength(bytes.len()));
        }
        let spend_public =
            PublicKey::try_from(&bytes[..KEY_LENGTH]).map_err(AddressError::InvalidKey)?;
        let view_public =
            PublicKey::try_from(&bytes[KEY_LENGTH..]).map_err(AddressError::InvalidKey)?;
        Ok(Self {
            spend_public,
            view_public,
        })
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}{}",
            ADDRESS_PREFIX,
            hex::encode(self.spend_public.to_bytes()),
            hex::encode(self.view_public.to_bytes())
        )
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({self})")
    }
}

/// The full key material of one account.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AccountKeys {
    /// The account's public address.
    address: Address,
    /// The secret spend key `s`.
    spend_secret: PrivateKey,
    /// The secret view key `v`.
    view_secret: PrivateKey,
}

impl AccountKeys {
    /// Assemble account keys from the two secret keys.
    pub fn new(spend_secret: PrivateKey, view_secret: PrivateKey) -> Self {
        let address = Address::new(
            PublicKey::from(&spend_secret),
            PublicKey::from(&view_secret),
        );
        Self {
            address,
            spend_secret,
            view_secret,
        }
    }

    /// Generate a fresh account.
    pub fn random(rng: &mut dyn CryptoRngCore) -> Self {
        Self::new(PrivateKey::random(rng), PrivateKey::random(rng))
    }

    /// Generate a fresh spend pair under an existing view key.
    pub fn random_with_view_secret(
        view_secret: PrivateKey,
        rng: &mut dyn CryptoRngCore,
    ) -> Self {
        Self::new(PrivateKey::random(rng), view_secret)
    }

    /// The account's public address.
    pub fn address(&self) -> &Address {
        &self.address
    }

    /// The secret spend key.
    pub fn spend_secret_key(&self) -> &PrivateKey {
        &self.spend_secret
    }

    /// The secret view key.
    pub fn view_secret_key(&self) -> &PrivateKey {
        &self.view_secret
    }

    /// The spend key pair.
    pub fn spend_key_pair(&self) -> KeyPair {
        KeyPair {
            public: *self.address.spend_public_key(),
            secret: self.spend_secret.clone(),
        }
    }

    /// The view key pair.
    pub fn view_key_pair(&self) -> KeyPair {
        KeyPair {
            public: *self.address.view_public_key(),
            secret: self.view_secret.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_core::OsRng;

    #[test]
    fn address_string_roundtrip() {
        let keys = AccountKeys::random(&mut OsRng);
        let formatted = keys.address().to_string();
        assert!(formatted.starts_with(ADDRESS_PREFIX));
        let parsed = Address::from_string(&formatted).unwrap();
        assert_eq!(parsed, *keys.address());
    }

    #[test]
    fn address_rejects_garbage() {
        assert!(matches!(
            Address::from_string("nope"),
            Err(AddressError::MissingPrefix)
        ));
        assert!(matches!(
            Address::from_string("UMBzzzz"),
            Err(AddressError::InvalidEncoding)
        ));
        assert!(matches!(
            Address::from_string("UMBabcd"),
            Err(AddressError::InvalidLength(2))
        ));
    }

    #[test]
    fn accounts_share_view_key() {
        let mut rng = OsRng;
        let first = AccountKeys::random(&mut rng);
        let second =
            AccountKeys::random_with_view_secret(first.view_secret_key().clone(), &mut rng);
        assert_eq!(
            first.address().view_public_key(),
            second.address().view_public_key()
        );
        assert_ne!(
            first.address().spend_public_key(),
            second.address().spend_public_key()
        );
    }

    #[test]
    fn account_serde_roundtrip() {
        let keys = AccountKeys::random(&mut OsRng);
        let bytes = bincode::serialize(&keys).unwrap();
        let recovered: AccountKeys = bincode::deserialize(&bytes).unwrap();
        assert_eq!(recovered.address(), keys.address());
        assert_eq!(recovered.spend_secret_key(), keys.spend_secret_key());
    }
}
