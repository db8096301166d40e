// Copyright (c) 2024 The Umbra Project

use displaydoc::Display;

/// Errors which can occur when handling key material.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum KeyError {
    /// The value is not a canonical curve point
    InvalidPoint,
    /// The value is not a canonical scalar
    InvalidScalar,
    /// Expected 32 bytes, found {0}
    LengthMismatch(usize),
}

impl std::error::Error for KeyError {}
