// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use alloy_primitives::B256;
use rollup_core::application::StfError;
use rollup_core::message::MessageError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConsensusError {
    #[error("insert lock taken")]
    InsertLockTaken,
    #[error("not the chosen sequencer")]
    NotChosenSequencer,
    #[error("message {got} written out of order, expected at most {expected}")]
    OutOfOrder { got: u64, expected: u64 },
    #[error("batch {batch_number} not found")]
    BatchNotFound { batch_number: u64 },
    #[error("message log storage failed")]
    Storage {
        #[source]
        source: rusqlite::Error,
    },
    #[error("message log task failed: {reason}")]
    Task { reason: String },
}

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("chain storage failed")]
    Storage {
        #[source]
        source: rusqlite::Error,
    },
    #[error("block {number} does not extend head: parent {parent_hash}, head {head_hash}")]
    NotExtendingHead {
        number: u64,
        parent_hash: B256,
        head_hash: B256,
    },
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("cannot reorg out genesis")]
    CannotReorgGenesis,
    #[error("wrong delayed message sequenced got {got} expected {expected}")]
    WrongDelayedMessage { got: u64, expected: u64 },
    #[error("wrong message number in digest got {got} expected {expected}")]
    WrongDigestNumber { got: u64, expected: u64 },
    #[error("createBlock mutex held")]
    CreateBlocksMutexHeld,
    #[error("sequencer role changed during block creation")]
    RetrySequencer {
        #[source]
        source: ConsensusError,
    },
    #[error("consensus client failed")]
    Consensus {
        #[source]
        source: ConsensusError,
    },
    #[error("state transition failed")]
    Stf {
        #[source]
        source: StfError,
    },
    #[error("cannot build sequencer message")]
    Message {
        #[source]
        source: MessageError,
    },
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error("{txs} transactions produced {results} results")]
    TxResultCountMismatch { txs: usize, results: usize },
    #[error("logged message {index} expects block {logged}, re-execution produced {computed}")]
    CatchUpMismatch {
        index: u64,
        logged: B256,
        computed: B256,
    },
}

impl EngineError {
    pub fn is_insert_lock_taken(&self) -> bool {
        matches!(
            self,
            Self::Consensus {
                source: ConsensusError::InsertLockTaken
            }
        )
    }
}
