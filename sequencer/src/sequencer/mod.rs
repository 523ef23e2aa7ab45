// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

//! The block-building side of the node.
//!
//! Flow: `publish_transaction` -> bounded queue -> block loop -> nonce precheck ->
//! `ExecutionEngine::sequence_transactions` -> one result per submitter. Transactions whose
//! nonce is ahead wait in the nonce failure cache until their predecessor commits.

mod config;
mod error;
mod hooks;
mod metrics;
mod nonce_cache;
mod nonce_failure_cache;
mod role;
mod service;
mod types;

pub use config::{
    DEFAULT_MAX_ACCEPTABLE_TIMESTAMP_DELTA, DEFAULT_MAX_BLOCK_SPEED, DEFAULT_MAX_REVERT_GAS_REJECT,
    DEFAULT_MAX_TX_DATA_SIZE, DEFAULT_NONCE_CACHE_SIZE, DEFAULT_NONCE_FAILURE_CACHE_EXPIRY,
    DEFAULT_NONCE_FAILURE_CACHE_SIZE, DEFAULT_QUEUE_SIZE, DEFAULT_QUEUE_TIMEOUT, SequencerConfig,
    SharedSequencerConfig,
};
pub use error::{SequencerConfigError, SubmitError};
pub use service::Sequencer;
