//! Error taxonomy of the wallet layer.

use thiserror::Error;
use umb_transaction_core::BuilderError;

/// Errors raised by the output-tracking engine.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ContainerError {
    /// A block arrived below the engine's current height.
    #[error("block {block_height} is below the current height {current_height}")]
    InvalidOrder {
        /// Height of the offending block.
        block_height: u32,
        /// The engine's current height.
        current_height: u32,
    },
    /// The transaction hash is already recorded.
    #[error("transaction is already added")]
    DuplicateTransaction,
    /// The output already exists in the container.
    #[error("output already exists")]
    DuplicateOutput,
    /// A key image was spent twice.
    #[error("key image already spent")]
    DoubleSpend,
    /// The global output index disagrees with the confirmation state.
    #[error("global output index is inconsistent with the block height")]
    InvalidGlobalIndex,
    /// An input spends an output whose transaction is still unconfirmed.
    #[error("input spends the output of an unconfirmed transaction")]
    SpendOfUnconfirmedOutput,
    /// No tracked output with the input's key image has the input's amount.
    #[error("no tracked output matches the input amount")]
    AmountMismatch,
    /// `mark_transaction_confirmed` received too few global indexes.
    #[error("not enough global indexes for the transaction outputs")]
    NotEnoughGlobalIndexes,
    /// `mark_transaction_confirmed` was called with the unconfirmed sentinel.
    #[error("confirmation block height is the unconfirmed sentinel")]
    UnconfirmedBlockHeight,
    /// A snapshot with a newer version tag.
    #[error("unsupported storage version {0}")]
    UnsupportedVersion(u32),
    /// Snapshot encoding or decoding failed.
    #[error("storage error: {0}")]
    Storage(String),
}

/// Errors surfaced by node client implementations.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum NodeError {
    /// The node rejected the request.
    #[error("node rejected the request: {0}")]
    Rejected(String),
    /// The node is unreachable or timed out.
    #[error("node unavailable: {0}")]
    Unavailable(String),
    /// The node returned a malformed response.
    #[error("malformed node response: {0}")]
    BadResponse(String),
}

/// Errors raised by wallet-public calls.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum WalletError {
    /// The wallet has not been initialized yet.
    #[error("wallet is not initialized")]
    NotInitialized,
    /// The wallet is already initialized.
    #[error("wallet is already initialized")]
    AlreadyInitialized,
    /// The password does not match.
    #[error("wrong password")]
    WrongPassword,
    /// An address failed to parse, or mixes tracking modes.
    #[error("bad address")]
    BadAddress,
    /// An address with this spend key already exists.
    #[error("address already exists")]
    AddressAlreadyExists,
    /// The address is not part of this wallet.
    #[error("address not found")]
    AddressNotFound,
    /// A destination carries a zero amount.
    #[error("destination amount is zero")]
    ZeroDestination,
    /// Destination amounts plus fee overflow.
    #[error("sum of amounts overflows")]
    SumOverflow,
    /// An amount failed validation.
    #[error("wrong amount")]
    WrongAmount,
    /// The node returned fewer decoys than requested.
    #[error("mixin count is too big")]
    MixinCountTooBig,
    /// The fee is below the configured minimum.
    #[error("fee is below the minimum")]
    FeeTooSmall,
    /// The serialized transaction exceeds the size cap.
    #[error("transaction size exceeds the limit")]
    TransactionSizeTooBig,
    /// Output selection cannot cover the requested amount.
    #[error("insufficient funds")]
    InsufficientFunds,
    /// Key generation failed.
    #[error("key generation error")]
    KeyGenerationError,
    /// An internal invariant broke.
    #[error("internal wallet error: {0}")]
    InternalWalletError(String),
    /// A query index exceeds the collection size.
    #[error("index {0} is out of range")]
    IndexOutOfRange(usize),
    /// A spend was attempted in view-only mode.
    #[error("wallet is tracking; spending is not possible")]
    TrackingMode,
    /// The wallet is shutting down.
    #[error("operation cancelled")]
    OperationCancelled,
    /// A snapshot with a newer version tag.
    #[error("unsupported snapshot version {0}")]
    UnsupportedVersion(u32),
    /// An engine invariant violation.
    #[error(transparent)]
    Container(#[from] ContainerError),
    /// The node client failed.
    #[error(transparent)]
    Node(#[from] NodeError),
    /// Transaction construction failed.
    #[error(transparent)]
    Builder(#[from] BuilderError),
}
