// Copyright (c) 2024 The Umbra Project

use displaydoc::Display;

/// Errors which can occur when creating a signature.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum Error {
    /// The real-output index is outside the ring
    IndexOutOfBounds,
    /// The ring is empty
    EmptyRing,
    /// A ring member is not a canonical curve point
    InvalidCurvePoint,
    /// The secret key does not match the ring member it should sign for
    InvalidSecretKey,
}

impl std::error::Error for Error {}
