// Copyright (c) 2024 The Umbra Project

use displaydoc::Display;
use umb_crypto_keys::KeyError;

/// Errors which can occur when parsing an address.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum AddressError {
    /// The address does not start with the expected prefix
    MissingPrefix,
    /// The address body is not valid hex
    InvalidEncoding,
    /// Expected 64 bytes of key material, found {0}
    InvalidLength(usize),
    /// Invalid key material: {0}
    InvalidKey(KeyError),
}

impl std::error::Error for AddressError {}
