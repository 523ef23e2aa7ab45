// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use rollup_core::transaction::{ConditionalOptions, Transaction};
use tokio::sync::oneshot;
use tokio::time::Instant;

use super::SubmitError;

pub(crate) type SubmitResult = Result<(), SubmitError>;

/// A submitted transaction waiting for its result.
///
/// The result is delivered by consuming the item, so it is sent at most once. An item dropped
/// without an answer reports an internal error to its submitter.
#[derive(Debug)]
pub(crate) struct QueueItem {
    pub tx: Transaction,
    pub tx_size: usize,
    pub options: Option<ConditionalOptions>,
    pub first_seen: Instant,
    deadline: Option<Instant>,
    respond_to: Option<oneshot::Sender<SubmitResult>>,
}

impl QueueItem {
    pub fn new(
        tx: Transaction,
        options: Option<ConditionalOptions>,
        deadline: Option<Instant>,
    ) -> (Self, oneshot::Receiver<SubmitResult>) {
        let (respond_to, result) = oneshot::channel();
        let item = Self {
            tx_size: tx.encoded_len(),
            tx,
            options,
            first_seen: Instant::now(),
            deadline,
            respond_to: Some(respond_to),
        };
        (item, result)
    }

    /// Why the submitter no longer wants a result, if it doesn't.
    pub fn context_error(&self) -> Option<SubmitError> {
        if self
            .respond_to
            .as_ref()
            .is_none_or(oneshot::Sender::is_closed)
        {
            return Some(SubmitError::Cancelled);
        }
        if self.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            return Some(SubmitError::QueueTimeout);
        }
        None
    }

    pub fn respond(mut self, result: SubmitResult) {
        if let Some(respond_to) = self.respond_to.take() {
            // The submitter may have given up already.
            let _ = respond_to.send(result);
        }
    }
}

impl Drop for QueueItem {
    fn drop(&mut self) {
        if let Some(respond_to) = self.respond_to.take() {
            tracing::warn!(tx = %self.tx.hash(), "queue item dropped without a result");
            let _ = respond_to.send(Err(SubmitError::Internal));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::{Address, U256};
    use rollup_core::transaction::{LEGACY_TX_TYPE, TxBody};
    use std::time::Duration;

    fn tx() -> Transaction {
        Transaction::new(
            LEGACY_TX_TYPE,
            TxBody {
                sender: Address::repeat_byte(7),
                nonce: 0,
                gas_limit: 21_000,
                max_fee_per_gas: 1,
                to: Address::ZERO,
                value: U256::ZERO,
                data: Vec::new().into(),
            },
        )
    }

    #[tokio::test]
    async fn dropped_item_reports_internal_error() {
        let (item, result) = QueueItem::new(tx(), None, None);
        assert_eq!(item.tx_size, item.tx.encoded_len());
        drop(item);
        assert_eq!(result.await.expect("result"), Err(SubmitError::Internal));
    }

    #[tokio::test]
    async fn context_error_tracks_cancellation_and_deadline() {
        let (item, result) = QueueItem::new(tx(), None, None);
        assert_eq!(item.context_error(), None);
        drop(result);
        assert_eq!(item.context_error(), Some(SubmitError::Cancelled));

        let deadline = Instant::now() - Duration::from_millis(1);
        let (item, _result) = QueueItem::new(tx(), None, Some(deadline));
        assert_eq!(item.context_error(), Some(SubmitError::QueueTimeout));
    }

    #[tokio::test]
    async fn respond_delivers_exactly_one_result() {
        let (item, result) = QueueItem::new(tx(), None, None);
        item.respond(Err(SubmitError::OversizedData));
        assert_eq!(result.await.expect("result"), Err(SubmitError::OversizedData));
    }
}
