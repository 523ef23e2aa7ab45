// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use std::collections::BTreeMap;

use alloy_primitives::Address;
use rollup_core::block::{Block, MessageResult};
use rollup_core::message::MessageWithMetadata;
use rollup_core::transaction::Transaction;
use rusqlite::types::Type;
use rusqlite::{Connection, Result, TransactionBehavior};
use rusqlite_migration::{M, Migrations};

use super::sql::{
    BlockTransactionRow, i64_to_u64, sql_delete_blocks_after, sql_delete_messages_from,
    sql_insert_batch, sql_insert_block, sql_insert_block_transactions, sql_insert_message,
    sql_insert_nonce_changes, sql_select_batch, sql_select_block, sql_select_block_transactions,
    sql_select_blocks, sql_select_chain_bounds, sql_select_messages_from_index,
    sql_select_next_message_index, sql_select_nonce_changes, sql_select_nonces_before,
    sql_select_transactions_of_block, sql_wal_checkpoint, u64_to_i64,
};
use super::{LoggedMessage, StorageOpenError, StoredBlock, StoredChain};

const MIGRATION_0001_SCHEMA: &str = include_str!("migrations/0001_schema.sql");

pub struct Storage {
    conn: Connection,
}

impl Storage {
    pub fn open(path: &str, synchronous: &str) -> std::result::Result<Self, StorageOpenError> {
        let conn = Self::open_connection_with_migrations(path, synchronous)?;
        Ok(Self { conn })
    }

    pub fn open_connection(
        path: &str,
        synchronous: &str,
    ) -> std::result::Result<Connection, StorageOpenError> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", synchronous)?;
        conn.pragma_update(None, "busy_timeout", 5000)?;
        Ok(conn)
    }

    pub fn open_connection_with_migrations(
        path: &str,
        synchronous: &str,
    ) -> std::result::Result<Connection, StorageOpenError> {
        let mut conn = Self::open_connection(path, synchronous)?;
        Self::run_migrations(&mut conn)?;
        Ok(conn)
    }

    pub fn run_migrations(conn: &mut Connection) -> std::result::Result<(), StorageOpenError> {
        Migrations::new(vec![M::up(MIGRATION_0001_SCHEMA)]).to_latest(conn)?;
        Ok(())
    }

    /// Lowest and highest stored block numbers, `None` before genesis is written.
    pub fn chain_bounds(&mut self) -> Result<Option<(u64, u64)>> {
        let bounds = sql_select_chain_bounds(&self.conn)?;
        Ok(bounds.map(|(first, last)| (i64_to_u64(first), i64_to_u64(last))))
    }

    /// Blocks numbered `from` and up in ascending order, with their transactions and nonce
    /// changes, plus the nonces left by everything below `from`.
    pub fn load_chain_from(&mut self, from: u64) -> Result<StoredChain> {
        let from = u64_to_i64(from);
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Deferred)?;
        let base_nonces = sql_select_nonces_before(&tx, from)?;
        let headers = sql_select_blocks(&tx, from)?;
        let tx_rows = sql_select_block_transactions(&tx, from)?;
        let nonce_rows = sql_select_nonce_changes(&tx, from)?;
        tx.commit()?;

        let mut blocks: Vec<StoredBlock> = headers
            .into_iter()
            .map(|header| StoredBlock {
                block: Block {
                    header,
                    transactions: Vec::new(),
                },
                nonce_changes: BTreeMap::new(),
            })
            .collect();
        let first_number = match blocks.first() {
            Some(first) => first.block.header.number,
            None => {
                return Ok(StoredChain {
                    base_nonces,
                    blocks,
                });
            }
        };

        for row in tx_rows {
            let slot = block_slot(&mut blocks, first_number, i64_to_u64(row.block_number));
            slot.block.transactions.push(decode_row(&row)?);
        }
        for row in nonce_rows {
            let slot = block_slot(&mut blocks, first_number, i64_to_u64(row.block_number));
            slot.nonce_changes.insert(row.address, i64_to_u64(row.nonce));
        }
        Ok(StoredChain {
            base_nonces,
            blocks,
        })
    }

    pub fn load_block(&mut self, number: u64) -> Result<Option<Block>> {
        let number = u64_to_i64(number);
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Deferred)?;
        let Some(header) = sql_select_block(&tx, number)? else {
            return Ok(None);
        };
        let transactions = sql_select_transactions_of_block(&tx, number)?
            .iter()
            .map(decode_row)
            .collect::<Result<Vec<_>>>()?;
        tx.commit()?;
        Ok(Some(Block {
            header,
            transactions,
        }))
    }

    pub fn insert_block(
        &mut self,
        block: &Block,
        nonce_changes: &BTreeMap<Address, u64>,
    ) -> Result<()> {
        let number = u64_to_i64(block.header.number);
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        sql_insert_block(&tx, &block.header)?;
        sql_insert_block_transactions(&tx, number, &block.transactions)?;
        sql_insert_nonce_changes(&tx, number, nonce_changes)?;
        tx.commit()?;
        Ok(())
    }

    /// Deletes every block above `block_number`. Returns how many were removed.
    pub fn truncate_blocks_after(&mut self, block_number: u64) -> Result<usize> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let removed = sql_delete_blocks_after(&tx, u64_to_i64(block_number))?;
        tx.commit()?;
        Ok(removed)
    }

    pub fn checkpoint(&mut self) -> Result<()> {
        sql_wal_checkpoint(&self.conn)
    }

    /// Writes `message` at `message_index`, dropping any previously logged message at or
    /// above that index first.
    pub fn write_message(
        &mut self,
        message_index: u64,
        message: &MessageWithMetadata,
        result: &MessageResult,
    ) -> Result<()> {
        let index = u64_to_i64(message_index);
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        sql_delete_messages_from(&tx, index)?;
        sql_insert_message(&tx, index, message, result)?;
        tx.commit()?;
        Ok(())
    }

    /// Drops every logged message at or above `message_index`. Returns how many were removed.
    pub fn truncate_messages_from(&mut self, message_index: u64) -> Result<usize> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let removed = sql_delete_messages_from(&tx, u64_to_i64(message_index))?;
        tx.commit()?;
        Ok(removed)
    }

    pub fn load_messages_from(&mut self, message_index: u64) -> Result<Vec<LoggedMessage>> {
        sql_select_messages_from_index(&self.conn, u64_to_i64(message_index))
    }

    /// One past the highest logged message index, or 0 for an empty log.
    pub fn next_message_index(&mut self) -> Result<u64> {
        let value = sql_select_next_message_index(&self.conn)?;
        Ok(i64_to_u64(value))
    }

    pub fn store_batch(&mut self, batch_number: u64, payload: &[u8]) -> Result<()> {
        sql_insert_batch(&self.conn, u64_to_i64(batch_number), payload)
    }

    pub fn load_batch(&mut self, batch_number: u64) -> Result<Option<Vec<u8>>> {
        sql_select_batch(&self.conn, u64_to_i64(batch_number))
    }
}

fn decode_row(row: &BlockTransactionRow) -> Result<Transaction> {
    Transaction::decode(row.encoded.as_slice())
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(1, Type::Blob, Box::new(err)))
}

fn block_slot(blocks: &mut [StoredBlock], first_number: u64, number: u64) -> &mut StoredBlock {
    let offset = number.saturating_sub(first_number) as usize;
    let slot = &mut blocks[offset];
    assert_eq!(
        slot.block.header.number, number,
        "non-contiguous stored chain: expected block {number} at offset {offset}"
    );
    slot
}
