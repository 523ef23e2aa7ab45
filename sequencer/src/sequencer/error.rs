// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use rollup_core::application::{NonceError, TxError};
use thiserror::Error;

use crate::forwarder::ForwarderError;

/// What a `publish_transaction` caller gets back. Exactly one per submitted transaction.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SubmitError {
    #[error(transparent)]
    Nonce(#[from] NonceError),
    #[error("sequencer temporarily not available")]
    NoSequencer,
    #[error("sequencer internal error")]
    Internal,
    #[error("transaction data too large")]
    OversizedData,
    #[error("transaction sender is not on the whitelist")]
    NotWhitelisted,
    #[error("transaction type not supported")]
    TxTypeNotSupported,
    #[error("intrinsic gas too low")]
    IntrinsicGas,
    #[error(transparent)]
    Execution(TxError),
    #[error(transparent)]
    Forwarding(ForwarderError),
    #[error("context canceled")]
    Cancelled,
    #[error("queue timeout exceeded")]
    QueueTimeout,
    #[error("timed out waiting for transaction result")]
    AbortDeadline,
    #[error("sequencer stopped")]
    Stopped,
    #[error("sequencer not initialized")]
    NotInitialized,
    #[error("sequencer paused")]
    Paused,
    #[error("parent chain header stale")]
    StaleParentChain,
    #[error("block build failed: {reason}")]
    Build { reason: String },
}

impl SubmitError {
    pub fn is_no_sequencer(&self) -> bool {
        matches!(
            self,
            Self::NoSequencer | Self::Forwarding(ForwarderError::NoSequencer)
        )
    }
}

impl From<ForwarderError> for SubmitError {
    fn from(err: ForwarderError) -> Self {
        match err {
            ForwarderError::NoSequencer => Self::NoSequencer,
            other => Self::Forwarding(other),
        }
    }
}

impl From<TxError> for SubmitError {
    fn from(err: TxError) -> Self {
        match err {
            TxError::Nonce(err) => Self::Nonce(err),
            // The reported amounts ignore parent-chain data gas, so only the kind is kept.
            TxError::IntrinsicGas { .. } => Self::IntrinsicGas,
            other => Self::Execution(other),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SequencerConfigError {
    #[error("sender whitelist entry {entry:?} is not a 0x-prefixed 20-byte address")]
    InvalidWhitelistEntry { entry: String },
    #[error("max tx data size {size} is above the limit of {limit}")]
    MaxTxDataSizeTooLarge { size: usize, limit: usize },
    #[error("queue size must be greater than zero")]
    ZeroQueueSize,
}
