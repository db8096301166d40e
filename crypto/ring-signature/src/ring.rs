// Copyright (c) 2024 The Umbra Project

//! Ring signatures over one-time keys, and the plain Schnorr signature used
//! for multisignature inputs.
//!
//! The ring scheme is the classic one-of-many proof: for each ring member a
//! pair `(L_i, R_i)` is committed on the base point and on `Hp(P_i)`, the
//! challenge is the hash of the message and all commitments, and the real
//! member's response folds the one-time secret in. Verifiers recompute the
//! commitments from the `(c_i, r_i)` pairs and check that the challenges sum
//! to the hash. The key image links the signature to the spent output
//! without identifying it within the ring.

use curve25519_dalek::{
    constants::RISTRETTO_BASEPOINT_TABLE, ristretto::RistrettoPoint, scalar::Scalar,
    traits::Identity,
};
use rand_core::CryptoRngCore;
use serde::{Deserialize, Serialize};
use umb_crypto_keys::{hash_to_point, hash_to_scalar, PrivateKey, PublicKey};
use zeroize::Zeroize;

use crate::{Error, KeyImage};

const RING_CHALLENGE_DOMAIN_TAG: &[u8] = b"umbra-ring-challenge";
const SCHNORR_CHALLENGE_DOMAIN_TAG: &[u8] = b"umbra-schnorr-challenge";

/// One `(c, r)` component of a signature. 64 bytes on the wire.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, Zeroize)]
pub struct Signature {
    /// The challenge scalar.
    pub c: Scalar,
    /// The response scalar.
    pub r: Scalar,
}

fn random_scalar(rng: &mut dyn CryptoRngCore) -> Scalar {
    let mut bytes = [0u8; 64];
    rng.fill_bytes(&mut bytes);
    let scalar = Scalar::from_bytes_mod_order_wide(&bytes);
    bytes.zeroize();
    scalar
}

/// Sign `prefix_hash` with a ring of candidate keys.
///
/// `ring[real_index]` must be the public half of `secret`; the other members
/// are decoys. The returned vector holds one `Signature` per ring member, in
/// ring order.
pub fn generate_ring_signature(
    prefix_hash: &[u8; 32],
    key_image: &KeyImage,
    ring: &[PublicKey],
    secret: &PrivateKey,
    real_index: usize,
    rng: &mut dyn CryptoRngCore,
) -> Result<Vec<Signature>, Error> {
    if ring.is_empty() {
        return Err(Error::EmptyRing);
    }
    if real_index >= ring.len() {
        return Err(Error::IndexOutOfBounds);
    }
    if PublicKey::from(secret) != ring[real_index] {
        return Err(Error::InvalidSecretKey);
    }

    let image_point = key_image
        .as_compressed()
        .decompress()
        .ok_or(Error::InvalidCurvePoint)?;

    let mut signatures = vec![Signature::default(); ring.len()];
    let mut challenge_sum = Scalar::ZERO;
    let mut k = Scalar::ZERO;

    let mut transcript = Vec::with_capacity(32 + ring.len() * 64);
    transcript.extend_from_slice(prefix_hash);

    for (i, member) in ring.iter().enumerate() {
        let (l, r) = if i == real_index {
            k = random_scalar(rng);
            (&k * RISTRETTO_BASEPOINT_TABLE, k * hash_to_point(member))
        } else {
            let sig = &mut signatures[i];
            sig.c = random_scalar(rng);
            sig.r = random_scalar(rng);
            challenge_sum += sig.c;
            (
                &sig.r * RISTRETTO_BASEPOINT_TABLE + sig.c * member.as_point(),
                sig.r * hash_to_point(member) + sig.c * image_point,
            )
        };
        transcript.extend_from_slice(l.compress().as_bytes());
        transcript.extend_from_slice(r.compress().as_bytes());
    }

    let challenge = hash_to_scalar(RING_CHALLENGE_DOMAIN_TAG, &[&transcript]);
    let real = &mut signatures[real_index];
    real.c = challenge - challenge_sum;
    real.r = k - real.c * secret.as_scalar();
    k.zeroize();

    Ok(signatures)
}

/// Verify a ring signature over `prefix_hash`.
pub fn check_ring_signature(
    prefix_hash: &[u8; 32],
    key_image: &KeyImage,
    ring: &[PublicKey],
    signatures: &[Signature],
) -> bool {
    if ring.is_empty() || ring.len() != signatures.len() {
        return false;
    }
    let Some(image_point) = key_image.as_compressed().decompress() else {
        return false;
    };

    let mut challenge_sum = Scalar::ZERO;
    let mut transcript = Vec::with_capacity(32 + ring.len() * 64);
    transcript.extend_from_slice(prefix_hash);

    for (member, sig) in ring.iter().zip(signatures) {
        let l = &sig.r * RISTRETTO_BASEPOINT_TABLE + sig.c * member.as_point();
        let r = sig.r * hash_to_point(member) + sig.c * image_point;
        challenge_sum += sig.c;
        transcript.extend_from_slice(l.compress().as_bytes());
        transcript.extend_from_slice(r.compress().as_bytes());
    }

    // The sum of per-member challenges must reproduce the transcript hash.
    hash_to_scalar(RING_CHALLENGE_DOMAIN_TAG, &[&transcript]) == challenge_sum
}

/// Produce a plain Schnorr signature over `prefix_hash`.
pub fn generate_signature(
    prefix_hash: &[u8; 32],
    public: &PublicKey,
    secret: &PrivateKey,
    rng: &mut dyn CryptoRngCore,
) -> Signature {
    let k = random_scalar(rng);
    let commitment: RistrettoPoint = &k * RISTRETTO_BASEPOINT_TABLE;
    let c = hash_to_scalar(
        SCHNORR_CHALLENGE_DOMAIN_TAG,
        &[
            prefix_hash,
            &public.to_bytes(),
            commitment.compress().as_bytes(),
        ],
    );
    let r = k - c * secret.as_scalar();
    Signature { c, r }
}

/// Verify a plain Schnorr signature over `prefix_hash`.
pub fn check_signature(prefix_hash: &[u8; 32], public: &PublicKey, sig: &Signature) -> bool {
    let commitment = &sig.r * RISTRETTO_BASEPOINT_TABLE + sig.c * public.as_point();
    if commitment == RistrettoPoint::identity() {
        return false;
    }
    let c = hash_to_scalar(
        SCHNORR_CHALLENGE_DOMAIN_TAG,
        &[
            prefix_hash,
            &public.to_bytes(),
            commitment.compress().as_bytes(),
        ],
    );
    c == sig.c
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generate_key_image;
    use rand_core::OsRng;
    use umb_crypto_keys::KeyPair;

    fn make_ring(rng: &mut OsRng, size: usize) -> Vec<PublicKey> {
        (0..size).map(|_| KeyPair::generate(rng).public).collect()
    }

    #[test]
    fn ring_signature_verifies() {
        let mut rng = OsRng;
        for real_index in [0usize, 3, 7] {
            let signer = KeyPair::generate(&mut rng);
            let mut ring = make_ring(&mut rng, 8);
            ring[real_index] = signer.public;
            let image = generate_key_image(&signer.public, &signer.secret);

            let prefix_hash = [7u8; 32];
            let sigs = generate_ring_signature(
                &prefix_hash,
                &image,
                &ring,
                &signer.secret,
                real_index,
                &mut rng,
            )
            .unwrap();

            assert_eq!(sigs.len(), ring.len());
            assert!(check_ring_signature(&prefix_hash, &image, &ring, &sigs));
        }
    }

    #[test]
    fn altered_signature_fails() {
        let mut rng = OsRng;
        let signer = KeyPair::generate(&mut rng);
        let mut ring = make_ring(&mut rng, 4);
        ring[2] = signer.public;
        let image = generate_key_image(&signer.public, &signer.secret);

        let prefix_hash = [1u8; 32];
        let mut sigs =
            generate_ring_signature(&prefix_hash, &image, &ring, &signer.secret, 2, &mut rng)
                .unwrap();

        sigs[1].r += Scalar::ONE;
        assert!(!check_ring_signature(&prefix_hash, &image, &ring, &sigs));
    }

    #[test]
    fn wrong_message_fails() {
        let mut rng = OsRng;
        let signer = KeyPair::generate(&mut rng);
        let mut ring = make_ring(&mut rng, 4);
        ring[0] = signer.public;
        let image = generate_key_image(&signer.public, &signer.secret);

        let sigs =
            generate_ring_signature(&[2u8; 32], &image, &ring, &signer.secret, 0, &mut rng)
                .unwrap();
        assert!(!check_ring_signature(&[3u8; 32], &image, &ring, &sigs));
    }

    #[test]
    fn wrong_key_image_fails() {
        let mut rng = OsRng;
        let signer = KeyPair::generate(&mut rng);
        let other = KeyPair::generate(&mut rng);
        let mut ring = make_ring(&mut rng, 4);
        ring[0] = signer.public;
        let image = generate_key_image(&signer.public, &signer.secret);
        let wrong_image = generate_key_image(&other.public, &other.secret);

        let prefix_hash = [9u8; 32];
        let sigs =
            generate_ring_signature(&prefix_hash, &image, &ring, &signer.secret, 0, &mut rng)
                .unwrap();
        assert!(!check_ring_signature(&prefix_hash, &wrong_image, &ring, &sigs));
    }

    #[test]
    fn mismatched_secret_is_rejected() {
        let mut rng = OsRng;
        let signer = KeyPair::generate(&mut rng);
        let ring = make_ring(&mut rng, 4);
        let image = generate_key_image(&signer.public, &signer.secret);

        assert_eq!(
            generate_ring_signature(&[0u8; 32], &image, &ring, &signer.secret, 0, &mut rng),
            Err(Error::InvalidSecretKey)
        );
    }

    #[test]
    fn schnorr_signature_roundtrip() {
        let mut rng = OsRng;
        let pair = KeyPair::generate(&mut rng);
        let prefix_hash = [5u8; 32];

        let sig = generate_signature(&prefix_hash, &pair.public, &pair.secret, &mut rng);
        assert!(check_signature(&prefix_hash, &pair.public, &sig));
        assert!(!check_signature(&[6u8; 32], &pair.public, &sig));

        let other = KeyPair::generate(&mut rng);
        assert!(!check_signature(&prefix_hash, &other.public, &sig));
    }
}
