// Copyright (c) 2024 The Umbra Project

//! Ristretto key types used throughout the Umbra protocol.
//!
//! Every key is a 32-byte value: secret keys are scalars, public keys are
//! compressed curve points. Secret material is zeroized on drop.

#![deny(missing_docs)]

use core::fmt;

use curve25519_dalek::{
    constants::RISTRETTO_BASEPOINT_TABLE,
    ristretto::{CompressedRistretto, RistrettoPoint},
    scalar::Scalar,
};
use rand_core::CryptoRngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

mod error;

pub use error::KeyError;

/// Length in bytes of a serialized key, hash or key image.
pub const KEY_LENGTH: usize = 32;

/// A secret scalar.
///
/// The scalar is zeroized when the key is dropped.
#[derive(Clone, Serialize, Deserialize, Zeroize)]
#[zeroize(drop)]
pub struct PrivateKey(Scalar);

impl PrivateKey {
    /// Generate a fresh random key.
    pub fn random(rng: &mut dyn CryptoRngCore) -> Self {
        let mut bytes = [0u8; 64];
        rng.fill_bytes(&mut bytes);
        let key = Self(Scalar::from_bytes_mod_order_wide(&bytes));
        bytes.zeroize();
        key
    }

    /// Wrap an existing scalar.
    pub fn from_scalar(scalar: Scalar) -> Self {
        Self(scalar)
    }

    /// The underlying scalar.
    pub fn as_scalar(&self) -> &Scalar {
        &self.0
    }

    /// Canonical 32-byte encoding.
    pub fn to_bytes(&self) -> [u8; KEY_LENGTH] {
        self.0.to_bytes()
    }
}

impl TryFrom<&[u8]> for PrivateKey {
    type Error = KeyError;

    fn try_from(src: &[u8]) -> Result<Self, KeyError> {
        let bytes: [u8; KEY_LENGTH] = src
            .try_into()
            .map_err(|_| KeyError::LengthMismatch(src.len()))?;
        let scalar = Option::<Scalar>::from(Scalar::from_canonical_bytes(bytes))
            .ok_or(KeyError::InvalidScalar)?;
        Ok(Self(scalar))
    }
}

impl From<Scalar> for PrivateKey {
    fn from(scalar: Scalar) -> Self {
        Self(scalar)
    }
}

impl PartialEq for PrivateKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.ct_eq(&other.0).into()
    }
}

impl Eq for PrivateKey {}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never print secret material.
        write!(f, "PrivateKey(..)")
    }
}

/// A public curve point.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKey(RistrettoPoint);

impl PublicKey {
    /// Wrap an existing point.
    pub fn from_point(point: RistrettoPoint) -> Self {
        Self(point)
    }

    /// The underlying point.
    pub fn as_point(&self) -> &RistrettoPoint {
        &self.0
    }

    /// Compressed 32-byte encoding.
    pub fn to_bytes(&self) -> [u8; KEY_LENGTH] {
        self.0.compress().to_bytes()
    }
}

impl From<&PrivateKey> for PublicKey {
    fn from(secret: &PrivateKey) -> Self {
        Self(secret.as_scalar() * RISTRETTO_BASEPOINT_TABLE)
    }
}

impl From<RistrettoPoint> for PublicKey {
    fn from(point: RistrettoPoint) -> Self {
        Self(point)
    }
}

impl TryFrom<&[u8]> for PublicKey {
    type Error = KeyError;

    fn try_from(src: &[u8]) -> Result<Self, KeyError> {
        if src.len() != KEY_LENGTH {
            return Err(KeyError::LengthMismatch(src.len()));
        }
        let compressed =
            CompressedRistretto::from_slice(src).map_err(|_| KeyError::InvalidPoint)?;
        let point = compressed.decompress().ok_or(KeyError::InvalidPoint)?;
        Ok(Self(point))
    }
}

impl core::hash::Hash for PublicKey {
    fn hash<H: core::hash::Hasher>(&self, state: &mut H) {
        self.to_bytes().hash(state);
    }
}

impl PartialOrd for PublicKey {
    fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PublicKey {
    fn cmp(&self, other: &Self) -> core::cmp::Ordering {
        self.to_bytes().cmp(&other.to_bytes())
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", hex::encode(self.to_bytes()))
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.to_bytes()))
    }
}

/// A (public, secret) pair.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeyPair {
    /// The public half.
    pub public: PublicKey,
    /// The secret half.
    pub secret: PrivateKey,
}

impl KeyPair {
    /// Generate a fresh pair.
    pub fn generate(rng: &mut dyn CryptoRngCore) -> Self {
        let secret = PrivateKey::random(rng);
        let public = PublicKey::from(&secret);
        Self { public, secret }
    }
}

/// Hash arbitrary byte parts down to a scalar, with a domain separator.
pub fn hash_to_scalar(domain: &'static [u8], parts: &[&[u8]]) -> Scalar {
    let mut hasher = Sha512::new();
    hasher.update(domain);
    for part in parts {
        hasher.update(part);
    }
    Scalar::from_hash(hasher)
}

/// Hash a public key onto the curve (the `Hp` map of the key-image scheme).
pub fn hash_to_point(public: &PublicKey) -> RistrettoPoint {
    let mut hasher = Sha512::new();
    hasher.update(b"umbra-hash-to-point");
    hasher.update(public.to_bytes());
    RistrettoPoint::from_uniform_bytes(&hasher.finalize().into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_core::OsRng;

    #[test]
    fn public_key_roundtrip() {
        let pair = KeyPair::generate(&mut OsRng);
        let bytes = pair.public.to_bytes();
        let recovered = PublicKey::try_from(&bytes[..]).unwrap();
        assert_eq!(pair.public, recovered);
    }

    #[test]
    fn private_key_rejects_wrong_length() {
        assert!(matches!(
            PrivateKey::try_from(&[0u8; 31][..]),
            Err(KeyError::LengthMismatch(31))
        ));
    }

    #[test]
    fn public_key_matches_scalar_mult() {
        let secret = PrivateKey::random(&mut OsRng);
        let public = PublicKey::from(&secret);
        assert_eq!(
            public.as_point(),
            &(secret.as_scalar() * RISTRETTO_BASEPOINT_TABLE)
        );
    }

    #[test]
    fn hash_to_scalar_is_deterministic() {
        let a = hash_to_scalar(b"test", &[b"one", b"two"]);
        let b = hash_to_scalar(b"test", &[b"one", b"two"]);
        let c = hash_to_scalar(b"other", &[b"one", b"two"]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn serde_roundtrip() {
        let pair = KeyPair::generate(&mut OsRng);
        let bytes = bincode::serialize(&pair).unwrap();
        let recovered: KeyPair = bincode::deserialize(&bytes).unwrap();
        assert_eq!(pair.public, recovered.public);
        assert_eq!(pair.secret, recovered.secret);
    }
}
