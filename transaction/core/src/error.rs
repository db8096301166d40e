// Copyright (c) 2024 The Umbra Project

use thiserror::Error;

/// Errors from the `extra` field codec.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum ExtraError {
    /// A record promised more bytes than the field holds.
    #[error("extra field ends inside a record")]
    UnexpectedEnd,
    /// A padding run contained a non-zero byte.
    #[error("non-zero byte inside padding")]
    NonZeroPadding,
    /// A padding run exceeded the maximum length.
    #[error("padding longer than 255 bytes")]
    PaddingTooLong,
    /// A nonce exceeded the maximum length.
    #[error("nonce of {0} bytes exceeds the 255 byte maximum")]
    NonceTooLong(usize),
    /// A varint did not fit in 64 bits.
    #[error("malformed varint")]
    VarintOverflow,
    /// An unknown record tag under [`crate::UnknownTagPolicy::Error`].
    #[error("unknown extra tag {0:#04x}")]
    UnknownTag(u8),
}

/// Errors from the transaction builder.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum BuilderError {
    /// The supplied secret does not derive the expected public key.
    #[error("secret key does not match the expected public key")]
    InvalidSecretKey,
    /// The transaction is not fully signed.
    #[error("transaction requires signatures before it can be built")]
    SignatureRequired,
    /// An input index beyond the current input count.
    #[error("input index {0} is out of range")]
    InvalidInputIndex(usize),
    /// The ring data of an input is inconsistent.
    #[error("ring is inconsistent: {0}")]
    Ring(#[from] umb_crypto_ring_signature::Error),
    /// Output or extra data could not be encoded.
    #[error("extra field: {0}")]
    Extra(#[from] ExtraError),
}
