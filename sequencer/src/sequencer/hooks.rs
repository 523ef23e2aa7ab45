// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use std::collections::VecDeque;

use rollup_core::application::{
    ExecutionResult, SequencingHooks, StateView, TxError, make_nonce_error,
};
use rollup_core::block::BlockContext;
use rollup_core::transaction::{ConditionalOptions, Transaction};

use super::nonce_cache::NonceCache;
use super::nonce_failure_cache::NonceFailureCache;
use super::types::QueueItem;

/// Per-transaction filters the sequencer plugs into block production.
pub(crate) struct SequencerHooks<'a> {
    pub nonce_cache: &'a mut NonceCache,
    pub failures: &'a mut NonceFailureCache,
    pub retry: &'a mut VecDeque<QueueItem>,
    pub options: Vec<Option<ConditionalOptions>>,
    pub max_revert_gas_reject: u64,
}

impl SequencingHooks for SequencerHooks<'_> {
    fn discard_invalid_txs_early(&self) -> bool {
        true
    }

    fn conditional_options_for_tx(&self, index: usize) -> Option<&ConditionalOptions> {
        self.options.get(index).and_then(Option::as_ref)
    }

    fn pre_tx_filter(
        &mut self,
        ctx: &BlockContext,
        state: &dyn StateView,
        tx: &Transaction,
        options: Option<&ConditionalOptions>,
    ) -> Result<(), TxError> {
        if self.nonce_cache.caching() {
            let sender = tx.sender();
            let expected = self
                .nonce_cache
                .get(ctx.parent_hash, Some(ctx.token), state, sender);
            if let Some(err) = make_nonce_error(sender, tx.nonce(), expected) {
                return Err(TxError::Nonce(err));
            }
        }
        if let Some(options) = options {
            options
                .check(ctx.l1_block_number, ctx.timestamp, state)
                .map_err(TxError::Conditional)?;
        }
        Ok(())
    }

    fn post_tx_filter(
        &mut self,
        ctx: &BlockContext,
        _state: &dyn StateView,
        tx: &Transaction,
        intrinsic_gas: u64,
        result: &ExecutionResult,
    ) -> Result<(), TxError> {
        if result.reverted && self.max_revert_gas_reject > 0 {
            let wasted = result.used_gas.saturating_sub(intrinsic_gas);
            if wasted > self.max_revert_gas_reject {
                return Err(TxError::Reverted {
                    used_gas: result.used_gas,
                });
            }
        }

        let sender = tx.sender();
        let next_nonce = tx.nonce() + 1;
        self.nonce_cache.update(ctx, sender, next_nonce);
        if let Some(revived) = self.failures.revive(sender, next_nonce) {
            match revived.context_error() {
                Some(err) => revived.respond(Err(err)),
                None => self.retry.push_back(revived),
            }
        }
        Ok(())
    }
}
