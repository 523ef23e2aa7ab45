// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use std::collections::BTreeMap;

use alloy_primitives::{Address, B256, keccak256};

use crate::application::{
    ExecutionResult, NoopHooks, ProducedBlock, SequencingHooks, StateTransition, StateView,
    StfError, TxError, make_nonce_error,
};
use crate::block::{Block, BlockContext, BlockHeader, Receipt, ReceiptStatus};
use crate::message::{MessageHeader, MessageWithMetadata, kind, parse_l2_transactions};
use crate::transaction::Transaction;

pub const TX_GAS: u64 = 21_000;
pub const TX_DATA_ZERO_GAS: u64 = 4;
pub const TX_DATA_NON_ZERO_GAS: u64 = 16;
// Calldata starting with this byte reverts and burns the whole gas limit.
pub const REVERT_MARKER: u8 = 0xfd;
const DEFAULT_BLOCK_GAS_LIMIT: u64 = 32_000_000;

pub fn intrinsic_gas(data: &[u8]) -> u64 {
    data.iter().fold(TX_GAS, |gas, byte| {
        let cost = if *byte == 0 {
            TX_DATA_ZERO_GAS
        } else {
            TX_DATA_NON_ZERO_GAS
        };
        gas.saturating_add(cost)
    })
}

#[derive(Debug, Clone, Copy)]
pub struct LedgerConfig {
    pub block_gas_limit: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            block_gas_limit: DEFAULT_BLOCK_GAS_LIMIT,
        }
    }
}

/// Nonce-and-gas bookkeeping transition: tracks account nonces, charges intrinsic gas and
/// enforces the block gas limit. Transaction payloads are otherwise opaque.
#[derive(Debug, Clone, Default)]
pub struct LedgerStf {
    config: LedgerConfig,
}

impl LedgerStf {
    pub fn new(config: LedgerConfig) -> Self {
        Self { config }
    }

    fn execute(
        &self,
        ctx: &BlockContext,
        parent: &BlockHeader,
        state: &dyn StateView,
        txs: &[Transaction],
        hooks: &mut dyn SequencingHooks,
    ) -> ProducedBlock {
        let mut pending = PendingState {
            base: state,
            changes: BTreeMap::new(),
        };
        let mut included = Vec::with_capacity(txs.len());
        let mut receipts = Vec::with_capacity(txs.len());
        let mut tx_results = Vec::with_capacity(txs.len());
        let mut block_gas_used = 0_u64;

        for (index, tx) in txs.iter().enumerate() {
            let result = self.apply_tx(ctx, &mut pending, index, tx, block_gas_used, hooks);
            match result {
                Ok(receipt) => {
                    block_gas_used = block_gas_used.saturating_add(receipt.gas_used);
                    receipts.push(receipt);
                    included.push(tx.clone());
                    tx_results.push(Ok(()));
                }
                Err(err) => tx_results.push(Err(err)),
            }
        }

        let header = BlockHeader {
            number: ctx.number,
            hash: B256::ZERO,
            parent_hash: parent.hash,
            timestamp: ctx.timestamp.max(parent.timestamp),
            l1_block_number: ctx.l1_block_number,
            delayed_messages_read: ctx.delayed_messages_read,
            gas_used: block_gas_used,
            state_root: next_state_root(parent.state_root, &pending.changes),
        }
        .seal();

        ProducedBlock {
            block: Block {
                header,
                transactions: included,
            },
            receipts,
            tx_results,
            nonce_changes: pending.changes,
        }
    }

    fn apply_tx(
        &self,
        ctx: &BlockContext,
        pending: &mut PendingState<'_>,
        index: usize,
        tx: &Transaction,
        block_gas_used: u64,
        hooks: &mut dyn SequencingHooks,
    ) -> Result<Receipt, TxError> {
        let sender = tx.sender();
        if hooks.discard_invalid_txs_early() {
            if let Some(err) = make_nonce_error(sender, tx.nonce(), pending.nonce(sender)) {
                return Err(TxError::Nonce(err));
            }
        }

        let options = hooks.conditional_options_for_tx(index).cloned();
        hooks.pre_tx_filter(ctx, &*pending, tx, options.as_ref())?;

        let intrinsic = intrinsic_gas(tx.data());
        if tx.gas_limit() < intrinsic {
            return Err(TxError::IntrinsicGas {
                have: tx.gas_limit(),
                want: intrinsic,
            });
        }
        if block_gas_used.saturating_add(tx.gas_limit()) > self.config.block_gas_limit {
            return Err(TxError::GasLimitReached);
        }
        if let Some(err) = make_nonce_error(sender, tx.nonce(), pending.nonce(sender)) {
            return Err(TxError::Nonce(err));
        }

        let reverted = tx.data().first() == Some(&REVERT_MARKER);
        let result = ExecutionResult {
            used_gas: if reverted { tx.gas_limit() } else { intrinsic },
            reverted,
        };
        hooks.post_tx_filter(ctx, &*pending, tx, intrinsic, &result)?;

        pending.changes.insert(sender, tx.nonce().saturating_add(1));
        Ok(Receipt {
            tx_hash: tx.hash(),
            sender,
            status: if reverted {
                ReceiptStatus::Reverted
            } else {
                ReceiptStatus::Success
            },
            gas_used: result.used_gas,
        })
    }
}

impl StateTransition for LedgerStf {
    fn produce_block(
        &self,
        ctx: &BlockContext,
        parent: &BlockHeader,
        state: &dyn StateView,
        message: &MessageWithMetadata,
    ) -> Result<ProducedBlock, StfError> {
        let txs = if message.message.header.kind == kind::L2_MESSAGE {
            parse_l2_transactions(&message.message).unwrap_or_else(|err| {
                tracing::warn!(error = %err, block = ctx.number, "invalid l2 message, producing empty block");
                Vec::new()
            })
        } else {
            Vec::new()
        };
        let mut hooks = NoopHooks {
            discard_invalid_txs_early: true,
        };
        Ok(self.execute(ctx, parent, state, &txs, &mut hooks))
    }

    fn produce_block_advanced(
        &self,
        ctx: &BlockContext,
        parent: &BlockHeader,
        state: &dyn StateView,
        _header: &MessageHeader,
        txs: &[Transaction],
        hooks: &mut dyn SequencingHooks,
    ) -> Result<ProducedBlock, StfError> {
        Ok(self.execute(ctx, parent, state, txs, hooks))
    }
}

struct PendingState<'a> {
    base: &'a dyn StateView,
    changes: BTreeMap<Address, u64>,
}

impl StateView for PendingState<'_> {
    fn nonce(&self, address: Address) -> u64 {
        self.changes
            .get(&address)
            .copied()
            .unwrap_or_else(|| self.base.nonce(address))
    }
}

fn next_state_root(parent_root: B256, changes: &BTreeMap<Address, u64>) -> B256 {
    if changes.is_empty() {
        return parent_root;
    }
    let mut preimage = Vec::with_capacity(32 + changes.len() * 28);
    preimage.extend_from_slice(parent_root.as_slice());
    for (address, nonce) in changes {
        preimage.extend_from_slice(address.as_slice());
        preimage.extend_from_slice(&nonce.to_be_bytes());
    }
    keccak256(preimage)
}
