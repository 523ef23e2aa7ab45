// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

mod ledger;

use std::collections::BTreeMap;
use std::fmt;

use alloy_primitives::Address;
use thiserror::Error;

use crate::block::{Block, BlockContext, BlockHeader, Receipt};
use crate::message::{MessageError, MessageHeader, MessageWithMetadata};
use crate::transaction::{ConditionalError, ConditionalOptions, Transaction};

pub use ledger::{LedgerConfig, LedgerStf, REVERT_MARKER, intrinsic_gas};

/// Read access to account nonces at the parent of the block being produced.
pub trait StateView {
    fn nonce(&self, address: Address) -> u64;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NonceError {
    pub sender: Address,
    pub tx_nonce: u64,
    pub state_nonce: u64,
}

impl NonceError {
    pub fn is_too_high(&self) -> bool {
        self.tx_nonce > self.state_nonce
    }

    pub fn is_too_low(&self) -> bool {
        self.tx_nonce < self.state_nonce
    }
}

impl fmt::Display for NonceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let direction = if self.is_too_low() { "low" } else { "high" };
        write!(
            f,
            "nonce too {direction}: address {}, tx: {} state: {}",
            self.sender, self.tx_nonce, self.state_nonce
        )
    }
}

impl std::error::Error for NonceError {}

/// `None` when the nonces agree.
pub fn make_nonce_error(sender: Address, tx_nonce: u64, state_nonce: u64) -> Option<NonceError> {
    (tx_nonce != state_nonce).then_some(NonceError {
        sender,
        tx_nonce,
        state_nonce,
    })
}

/// Why a single transaction was not included.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TxError {
    #[error(transparent)]
    Nonce(NonceError),
    #[error("intrinsic gas too low: have {have}, want {want}")]
    IntrinsicGas { have: u64, want: u64 },
    #[error("gas limit reached")]
    GasLimitReached,
    #[error("execution reverted")]
    Reverted { used_gas: u64 },
    #[error(transparent)]
    Conditional(ConditionalError),
    #[error("{0}")]
    Rejected(String),
}

#[derive(Debug, Error)]
pub enum StfError {
    #[error("internal: {reason}")]
    Internal { reason: String },
    #[error("cannot decode message")]
    Message {
        #[source]
        source: MessageError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionResult {
    pub used_gas: u64,
    pub reverted: bool,
}

/// Per-transaction extension points the state transition calls while building a block.
pub trait SequencingHooks: Send {
    fn discard_invalid_txs_early(&self) -> bool;

    fn conditional_options_for_tx(&self, index: usize) -> Option<&ConditionalOptions>;

    fn pre_tx_filter(
        &mut self,
        ctx: &BlockContext,
        state: &dyn StateView,
        tx: &Transaction,
        options: Option<&ConditionalOptions>,
    ) -> Result<(), TxError>;

    fn post_tx_filter(
        &mut self,
        ctx: &BlockContext,
        state: &dyn StateView,
        tx: &Transaction,
        intrinsic_gas: u64,
        result: &ExecutionResult,
    ) -> Result<(), TxError>;
}

/// Hooks that accept everything. Used when replaying or resequencing messages.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHooks {
    pub discard_invalid_txs_early: bool,
}

impl SequencingHooks for NoopHooks {
    fn discard_invalid_txs_early(&self) -> bool {
        self.discard_invalid_txs_early
    }

    fn conditional_options_for_tx(&self, _index: usize) -> Option<&ConditionalOptions> {
        None
    }

    fn pre_tx_filter(
        &mut self,
        _ctx: &BlockContext,
        _state: &dyn StateView,
        _tx: &Transaction,
        _options: Option<&ConditionalOptions>,
    ) -> Result<(), TxError> {
        Ok(())
    }

    fn post_tx_filter(
        &mut self,
        _ctx: &BlockContext,
        _state: &dyn StateView,
        _tx: &Transaction,
        _intrinsic_gas: u64,
        _result: &ExecutionResult,
    ) -> Result<(), TxError> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ProducedBlock {
    pub block: Block,
    pub receipts: Vec<Receipt>,
    // One entry per input transaction, in input order.
    pub tx_results: Vec<Result<(), TxError>>,
    pub nonce_changes: BTreeMap<Address, u64>,
}

impl ProducedBlock {
    pub fn all_failed(&self) -> bool {
        self.tx_results.iter().all(Result::is_err)
    }
}

pub trait StateTransition: Send + Sync + 'static {
    /// Executes a message that was not built by this sequencer (delayed or digested).
    fn produce_block(
        &self,
        ctx: &BlockContext,
        parent: &BlockHeader,
        state: &dyn StateView,
        message: &MessageWithMetadata,
    ) -> Result<ProducedBlock, StfError>;

    /// Executes a batch of sequencer transactions, consulting `hooks` around each one.
    fn produce_block_advanced(
        &self,
        ctx: &BlockContext,
        parent: &BlockHeader,
        state: &dyn StateView,
        header: &MessageHeader,
        txs: &[Transaction],
        hooks: &mut dyn SequencingHooks,
    ) -> Result<ProducedBlock, StfError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nonce_error_distinguishes_direction_and_formats_both_nonces() {
        let sender = Address::repeat_byte(0xab);
        assert_eq!(make_nonce_error(sender, 3, 3), None);

        let low = make_nonce_error(sender, 1, 3).expect("too low");
        assert!(low.is_too_low());
        assert_eq!(
            low.to_string(),
            format!("nonce too low: address {sender}, tx: 1 state: 3")
        );

        let high = make_nonce_error(sender, 5, 3).expect("too high");
        assert!(high.is_too_high());
        assert!(high.to_string().starts_with("nonce too high"));
    }
}
