//! The Umbra wallet.
//!
//! Tracks outputs per address in a multi-indexed engine
//! ([`TransfersContainer`]), builds and relays transfers and fusion
//! transactions ([`Wallet`]), follows chain and pool changes
//! ([`BlockchainSynchronizer`], [`BlockchainExplorer`]), and reports
//! everything through an event queue. [`NodeBridge`] assembles the push
//! pipeline from a node's notifications through the explorer into the
//! wallet.

#![deny(missing_docs)]

mod bridge;
pub mod container;
mod error;
mod events;
mod explorer;
mod node;
mod synchronizer;
pub mod test_utils;
mod wallet;

pub use bridge::{NodeBridge, NodeEventForwarder};
pub use container::{
    IncomingTransfer, OutputType, SpentOutputDescriptor, SpentTransferOutput,
    TransactionRecord, TransferBlockInfo, TransferOutput, TransfersContainer,
    UNCONFIRMED_GLOBAL_INDEX, UNCONFIRMED_HEIGHT,
};
pub use error::{ContainerError, NodeError, WalletError};
pub use events::WalletEvent;
pub use explorer::{BlockchainExplorer, ExplorerObserver, PoolRemovalReason};
pub use node::{
    BlockDetails, NodeClient, NodeObserver, OutEntry, PoolDifference, RandomAmountOuts,
    TransactionDetails,
};
pub use synchronizer::{
    BlockchainSynchronizer, Subscription, SubscriptionKeys, SynchronizerObserver,
};
pub use wallet::{
    TransferDestination, TransferParams, Wallet, WalletTransaction, WalletTransactionState,
};
