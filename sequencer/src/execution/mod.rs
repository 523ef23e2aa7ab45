// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

//! Canonical chain ownership: block production, persistence ordering and reorgs.
//!
//! The engine is the only writer of the chain. Every mutation runs while holding the
//! create-blocks permit, and a sequenced message reaches the consensus log before its block
//! is appended.

mod chain;
mod engine;
mod error;

use async_trait::async_trait;
use rollup_core::block::{BlockHeader, MessageResult};
use rollup_core::message::MessageWithMetadata;

use crate::storage::LoggedMessage;

pub use chain::{Blockchain, ChainState, DEFAULT_RETAINED_BLOCKS};
pub use engine::{CommitPermit, ExecutionEngine, SequencedBatch};
pub use error::{ChainError, ConsensusError, EngineError};

/// The durable message log and leadership oracle the engine reports to.
#[async_trait]
pub trait ConsensusClient: Send + Sync {
    /// Must succeed before the block for `message` is appended.
    async fn write_message_from_sequencer(
        &self,
        message_index: u64,
        message: &MessageWithMetadata,
        result: &MessageResult,
    ) -> Result<(), ConsensusError>;

    /// Drops logged messages with index >= `message_index`.
    async fn truncate_messages_from(&self, message_index: u64) -> Result<(), ConsensusError>;

    async fn expect_chosen_sequencer(&self) -> Result<(), ConsensusError>;

    async fn fetch_batch(&self, batch_number: u64) -> Result<Vec<u8>, ConsensusError>;

    /// Logged messages with index >= `message_index`, ascending.
    async fn messages_from(&self, message_index: u64)
    -> Result<Vec<LoggedMessage>, ConsensusError>;
}

pub trait BlockRecorder: Send + Sync {
    fn reorg_to(&self, header: &BlockHeader);
}
