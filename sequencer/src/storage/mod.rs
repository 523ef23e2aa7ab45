// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

mod db;
mod message_log;
mod sql;

use std::collections::BTreeMap;

use alloy_primitives::Address;
use rollup_core::block::{Block, MessageResult};
use rollup_core::message::MessageWithMetadata;
use thiserror::Error;

pub use db::Storage;
pub use message_log::SqliteMessageLog;

#[derive(Debug, Error)]
pub enum StorageOpenError {
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Migration(#[from] rusqlite_migration::Error),
}

/// One persisted block together with the account nonces it changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlock {
    pub block: Block,
    pub nonce_changes: BTreeMap<Address, u64>,
}

/// The stored blocks from some height up, plus every account's nonce from the blocks below.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoredChain {
    pub base_nonces: BTreeMap<Address, u64>,
    pub blocks: Vec<StoredBlock>,
}

/// One entry of the durable message log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggedMessage {
    pub index: u64,
    pub message: MessageWithMetadata,
    pub result: MessageResult,
}
