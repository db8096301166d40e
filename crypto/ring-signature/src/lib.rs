// Copyright (c) 2024 The Umbra Project

//! Ring signatures, key images and one-time (stealth) keys.
//!
//! This crate implements the sender- and receiver-side cryptography of the
//! Umbra transaction model:
//!
//! - **One-time keys**: every output is sent to a fresh key
//!   `P = Hs(r·V ‖ i)·G + S`, so outputs to the same address are unlinkable.
//! - **Key images**: spending an output publishes `I = x·Hp(P)`, a tag that
//!   is unique per output but reveals neither the output nor the spender.
//! - **Ring signatures**: an input references a ring of candidate outputs
//!   and proves knowledge of the secret key of exactly one of them.

#![deny(missing_docs)]
#![allow(non_snake_case)]

mod error;
mod key_image;
mod onetime_keys;
mod ring;

pub use error::Error;
pub use key_image::{generate_key_image, KeyImage};
pub use onetime_keys::{
    derive_output_public_key, derive_output_secret_key, derive_public_key, derive_secret_key,
    generate_key_derivation, KeyDerivation,
};
pub use ring::{
    check_ring_signature, check_signature, generate_ring_signature, generate_signature, Signature,
};
