// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use std::collections::BTreeMap;

use alloy_primitives::{Address, B256, Bytes};
use rollup_core::block::{BlockHeader, MessageResult};
use rollup_core::message::{Message, MessageHeader, MessageWithMetadata, kind};
use rollup_core::transaction::Transaction;
use rusqlite::{Connection, OptionalExtension, Result, Row, Transaction as DbTransaction, params};

use super::LoggedMessage;

const SQL_INSERT_BLOCK: &str = include_str!("queries/insert_block.sql");
const SQL_SELECT_BLOCKS: &str = include_str!("queries/select_blocks.sql");
const SQL_SELECT_BLOCK: &str = include_str!("queries/select_block.sql");
const SQL_SELECT_NONCES_BEFORE: &str = include_str!("queries/select_nonces_before.sql");
const SQL_INSERT_MESSAGE: &str = include_str!("queries/insert_message.sql");
const SQL_SELECT_MESSAGES_FROM_INDEX: &str = include_str!("queries/select_messages_from_index.sql");
const SQL_INSERT_BLOCK_TRANSACTION: &str = "INSERT INTO block_transactions (block_number, position, tx_hash, encoded) VALUES (?1, ?2, ?3, ?4)";
const SQL_SELECT_BLOCK_TRANSACTIONS: &str = "SELECT block_number, encoded FROM block_transactions WHERE block_number >= ?1 ORDER BY block_number ASC, position ASC";
const SQL_SELECT_TRANSACTIONS_OF_BLOCK: &str =
    "SELECT block_number, encoded FROM block_transactions WHERE block_number = ?1 ORDER BY position ASC";
const SQL_INSERT_NONCE_CHANGE: &str =
    "INSERT INTO nonce_changes (block_number, address, nonce) VALUES (?1, ?2, ?3)";
const SQL_SELECT_NONCE_CHANGES: &str = "SELECT block_number, address, nonce FROM nonce_changes WHERE block_number >= ?1 ORDER BY block_number ASC";
const SQL_SELECT_CHAIN_BOUNDS: &str = "SELECT MIN(block_number), MAX(block_number) FROM blocks";
const SQL_DELETE_BLOCKS_AFTER: &str = "DELETE FROM blocks WHERE block_number > ?1";
const SQL_DELETE_MESSAGES_FROM: &str = "DELETE FROM messages WHERE message_index >= ?1";
const SQL_SELECT_NEXT_MESSAGE_INDEX: &str =
    "SELECT COALESCE(MAX(message_index) + 1, 0) FROM messages";
const SQL_INSERT_BATCH: &str =
    "INSERT OR REPLACE INTO sequencer_batches (batch_number, payload) VALUES (?1, ?2)";
const SQL_SELECT_BATCH: &str = "SELECT payload FROM sequencer_batches WHERE batch_number = ?1";

#[derive(Debug, Clone)]
pub(super) struct BlockTransactionRow {
    pub block_number: i64,
    pub encoded: Vec<u8>,
}

#[derive(Debug, Clone)]
pub(super) struct NonceChangeRow {
    pub block_number: i64,
    pub address: Address,
    pub nonce: i64,
}

pub(super) fn sql_insert_block(tx: &DbTransaction<'_>, header: &BlockHeader) -> Result<()> {
    let mut stmt = tx.prepare_cached(SQL_INSERT_BLOCK)?;
    stmt.execute(params![
        u64_to_i64(header.number),
        header.hash.as_slice(),
        header.parent_hash.as_slice(),
        u64_to_i64(header.timestamp),
        u64_to_i64(header.l1_block_number),
        u64_to_i64(header.delayed_messages_read),
        u64_to_i64(header.gas_used),
        header.state_root.as_slice(),
    ])?;
    Ok(())
}

pub(super) fn sql_insert_block_transactions(
    tx: &DbTransaction<'_>,
    block_number: i64,
    transactions: &[Transaction],
) -> Result<()> {
    if transactions.is_empty() {
        return Ok(());
    }

    let mut stmt = tx.prepare_cached(SQL_INSERT_BLOCK_TRANSACTION)?;
    for (position, item) in transactions.iter().enumerate() {
        stmt.execute(params![
            block_number,
            u64_to_i64(position as u64),
            item.hash().as_slice(),
            &item.encoded()[..],
        ])?;
    }
    Ok(())
}

pub(super) fn sql_insert_nonce_changes(
    tx: &DbTransaction<'_>,
    block_number: i64,
    changes: &BTreeMap<Address, u64>,
) -> Result<()> {
    if changes.is_empty() {
        return Ok(());
    }

    let mut stmt = tx.prepare_cached(SQL_INSERT_NONCE_CHANGE)?;
    for (address, nonce) in changes {
        stmt.execute(params![block_number, address.as_slice(), u64_to_i64(*nonce)])?;
    }
    Ok(())
}

pub(super) fn sql_select_blocks(conn: &Connection, from: i64) -> Result<Vec<BlockHeader>> {
    let mut stmt = conn.prepare_cached(SQL_SELECT_BLOCKS)?;
    let mapped = stmt.query_map(params![from], convert_row_to_block_header)?;
    mapped.collect()
}

pub(super) fn sql_select_block(conn: &Connection, block_number: i64) -> Result<Option<BlockHeader>> {
    conn.query_row(SQL_SELECT_BLOCK, params![block_number], convert_row_to_block_header)
        .optional()
}

/// Lowest and highest stored block numbers, `None` for an empty chain.
pub(super) fn sql_select_chain_bounds(conn: &Connection) -> Result<Option<(i64, i64)>> {
    let (first, last): (Option<i64>, Option<i64>) =
        conn.query_row(SQL_SELECT_CHAIN_BOUNDS, [], |row| Ok((row.get(0)?, row.get(1)?)))?;
    Ok(first.zip(last))
}

pub(super) fn sql_select_block_transactions(
    conn: &Connection,
    from: i64,
) -> Result<Vec<BlockTransactionRow>> {
    let mut stmt = conn.prepare_cached(SQL_SELECT_BLOCK_TRANSACTIONS)?;
    let mapped = stmt.query_map(params![from], convert_row_to_block_transaction)?;
    mapped.collect()
}

pub(super) fn sql_select_transactions_of_block(
    conn: &Connection,
    block_number: i64,
) -> Result<Vec<BlockTransactionRow>> {
    let mut stmt = conn.prepare_cached(SQL_SELECT_TRANSACTIONS_OF_BLOCK)?;
    let mapped = stmt.query_map(params![block_number], convert_row_to_block_transaction)?;
    mapped.collect()
}

pub(super) fn sql_select_nonce_changes(conn: &Connection, from: i64) -> Result<Vec<NonceChangeRow>> {
    let mut stmt = conn.prepare_cached(SQL_SELECT_NONCE_CHANGES)?;
    let mapped = stmt.query_map(params![from], |row| {
        let address: [u8; 20] = row.get(1)?;
        Ok(NonceChangeRow {
            block_number: row.get(0)?,
            address: Address::from(address),
            nonce: row.get(2)?,
        })
    })?;
    mapped.collect()
}

/// Each account's latest nonce from blocks below `before`.
pub(super) fn sql_select_nonces_before(
    conn: &Connection,
    before: i64,
) -> Result<BTreeMap<Address, u64>> {
    let mut stmt = conn.prepare_cached(SQL_SELECT_NONCES_BEFORE)?;
    let mapped = stmt.query_map(params![before], |row| {
        let address: [u8; 20] = row.get(0)?;
        let nonce: i64 = row.get(1)?;
        Ok((Address::from(address), i64_to_u64(nonce)))
    })?;
    mapped.collect()
}

pub(super) fn sql_delete_blocks_after(conn: &Connection, block_number: i64) -> Result<usize> {
    // Transactions and nonce changes follow through ON DELETE CASCADE.
    conn.execute(SQL_DELETE_BLOCKS_AFTER, params![block_number])
}

pub(super) fn sql_insert_message(
    tx: &DbTransaction<'_>,
    message_index: i64,
    message: &MessageWithMetadata,
    result: &MessageResult,
) -> Result<()> {
    let header = &message.message.header;
    let mut stmt = tx.prepare_cached(SQL_INSERT_MESSAGE)?;
    stmt.execute(params![
        message_index,
        i64::from(header.kind),
        header.poster.as_slice(),
        u64_to_i64(header.block_number),
        u64_to_i64(header.timestamp),
        header.request_id.as_ref().map(|id| id.as_slice()),
        &message.message.l2_msg[..],
        u64_to_i64(message.delayed_messages_read),
        result.block_hash.as_slice(),
        result.send_root.as_slice(),
    ])?;
    Ok(())
}

pub(super) fn sql_delete_messages_from(conn: &Connection, message_index: i64) -> Result<usize> {
    conn.execute(SQL_DELETE_MESSAGES_FROM, params![message_index])
}

pub(super) fn sql_select_messages_from_index(
    conn: &Connection,
    message_index: i64,
) -> Result<Vec<LoggedMessage>> {
    let mut stmt = conn.prepare_cached(SQL_SELECT_MESSAGES_FROM_INDEX)?;
    let mapped = stmt.query_map(params![message_index], convert_row_to_logged_message)?;
    mapped.collect()
}

pub(super) fn sql_select_next_message_index(conn: &Connection) -> Result<i64> {
    conn.query_row(SQL_SELECT_NEXT_MESSAGE_INDEX, [], |row| row.get(0))
}

pub(super) fn sql_insert_batch(conn: &Connection, batch_number: i64, payload: &[u8]) -> Result<()> {
    conn.execute(SQL_INSERT_BATCH, params![batch_number, payload])?;
    Ok(())
}

pub(super) fn sql_select_batch(conn: &Connection, batch_number: i64) -> Result<Option<Vec<u8>>> {
    conn.query_row(SQL_SELECT_BATCH, params![batch_number], |row| row.get(0))
        .optional()
}

pub(super) fn sql_wal_checkpoint(conn: &Connection) -> Result<()> {
    // The pragma reports (busy, log, checkpointed); only failure matters here.
    conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))
}

fn convert_row_to_block_header(row: &Row<'_>) -> Result<BlockHeader> {
    let hash: [u8; 32] = row.get(1)?;
    let parent_hash: [u8; 32] = row.get(2)?;
    let state_root: [u8; 32] = row.get(7)?;
    Ok(BlockHeader {
        number: i64_to_u64(row.get(0)?),
        hash: B256::from(hash),
        parent_hash: B256::from(parent_hash),
        timestamp: i64_to_u64(row.get(3)?),
        l1_block_number: i64_to_u64(row.get(4)?),
        delayed_messages_read: i64_to_u64(row.get(5)?),
        gas_used: i64_to_u64(row.get(6)?),
        state_root: B256::from(state_root),
    })
}

fn convert_row_to_block_transaction(row: &Row<'_>) -> Result<BlockTransactionRow> {
    Ok(BlockTransactionRow {
        block_number: row.get(0)?,
        encoded: row.get(1)?,
    })
}

fn convert_row_to_logged_message(row: &Row<'_>) -> Result<LoggedMessage> {
    let kind_value: i64 = row.get(1)?;
    let poster: [u8; 20] = row.get(2)?;
    let request_id: Option<[u8; 32]> = row.get(5)?;
    let l2_msg: Vec<u8> = row.get(6)?;
    let block_hash: [u8; 32] = row.get(8)?;
    let send_root: [u8; 32] = row.get(9)?;
    Ok(LoggedMessage {
        index: i64_to_u64(row.get(0)?),
        message: MessageWithMetadata {
            message: Message {
                header: MessageHeader {
                    kind: u8::try_from(kind_value).unwrap_or(kind::INVALID),
                    poster: Address::from(poster),
                    block_number: i64_to_u64(row.get(3)?),
                    timestamp: i64_to_u64(row.get(4)?),
                    request_id: request_id.map(B256::from),
                },
                l2_msg: Bytes::from(l2_msg),
            },
            delayed_messages_read: i64_to_u64(row.get(7)?),
        },
        result: MessageResult {
            block_hash: B256::from(block_hash),
            send_root: B256::from(send_root),
        },
    })
}

pub(super) fn u64_to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

pub(super) fn i64_to_u64(value: i64) -> u64 {
    value.max(0) as u64
}
