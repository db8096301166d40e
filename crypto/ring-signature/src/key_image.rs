// Copyright (c) 2024 The Umbra Project

use core::fmt;

use curve25519_dalek::ristretto::CompressedRistretto;
use serde::{Deserialize, Serialize};
use umb_crypto_keys::{hash_to_point, PrivateKey, PublicKey, KEY_LENGTH};
use zeroize::Zeroize;

use crate::Error;

/// The "image" of a one-time key `x`: `I = x·Hp(P)` where `P = x·G`.
///
/// Two spends of the same output produce the same image, which is how
/// double-spends are detected without revealing which output was spent.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Zeroize)]
pub struct KeyImage {
    point: [u8; KEY_LENGTH],
}

impl KeyImage {
    /// View the image as raw bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.point
    }

    /// The image as a compressed curve point.
    pub fn as_compressed(&self) -> CompressedRistretto {
        CompressedRistretto(self.point)
    }
}

impl From<[u8; KEY_LENGTH]> for KeyImage {
    fn from(point: [u8; KEY_LENGTH]) -> Self {
        Self { point }
    }
}

impl From<CompressedRistretto> for KeyImage {
    fn from(point: CompressedRistretto) -> Self {
        Self {
            point: point.to_bytes(),
        }
    }
}

impl TryFrom<&[u8]> for KeyImage {
    type Error = Error;

    fn try_from(src: &[u8]) -> Result<Self, Error> {
        let point: [u8; KEY_LENGTH] =
            src.try_into().map_err(|_| Error::InvalidCurvePoint)?;
        Ok(Self { point })
    }
}

impl fmt::Debug for KeyImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyImage({})", hex::encode(self.point))
    }
}

impl fmt::Display for KeyImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.point))
    }
}

/// Compute the key image of a one-time key pair.
pub fn generate_key_image(public: &PublicKey, secret: &PrivateKey) -> KeyImage {
    let Hp = hash_to_point(public);
    KeyImage::from((secret.as_scalar() * Hp).compress())
}
