// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rollup_core::block::MessageResult;
use rollup_core::message::MessageWithMetadata;

use super::{LoggedMessage, Storage};
use crate::execution::{ConsensusClient, ConsensusError};

/// Message log kept in the node's own SQLite database, for running without an external
/// consensus layer. This node is always the chosen sequencer.
#[derive(Clone)]
pub struct SqliteMessageLog {
    storage: Arc<Mutex<Storage>>,
}

impl SqliteMessageLog {
    pub fn new(storage: Storage) -> Self {
        Self {
            storage: Arc::new(Mutex::new(storage)),
        }
    }

    pub async fn store_batch(&self, batch_number: u64, payload: Vec<u8>) -> Result<(), ConsensusError> {
        self.run(move |storage| storage.store_batch(batch_number, &payload))
            .await
    }

    async fn run<R, F>(&self, f: F) -> Result<R, ConsensusError>
    where
        R: Send + 'static,
        F: FnOnce(&mut Storage) -> rusqlite::Result<R> + Send + 'static,
    {
        let storage = Arc::clone(&self.storage);
        tokio::task::spawn_blocking(move || {
            let mut storage = storage.lock().expect("message log mutex poisoned");
            f(&mut storage)
        })
        .await
        .map_err(|err| ConsensusError::Task {
            reason: err.to_string(),
        })?
        .map_err(|source| ConsensusError::Storage { source })
    }
}

#[async_trait]
impl ConsensusClient for SqliteMessageLog {
    async fn write_message_from_sequencer(
        &self,
        message_index: u64,
        message: &MessageWithMetadata,
        result: &MessageResult,
    ) -> Result<(), ConsensusError> {
        let next = self.run(|storage| storage.next_message_index()).await?;
        // Genesis (index 0) is never logged, so an empty log accepts index 1.
        let expected = next.max(1);
        if message_index > expected {
            return Err(ConsensusError::OutOfOrder {
                got: message_index,
                expected,
            });
        }
        let message = message.clone();
        let result = *result;
        self.run(move |storage| storage.write_message(message_index, &message, &result))
            .await
    }

    async fn truncate_messages_from(&self, message_index: u64) -> Result<(), ConsensusError> {
        let removed = self
            .run(move |storage| storage.truncate_messages_from(message_index))
            .await?;
        if removed > 0 {
            tracing::info!(from = message_index, removed, "truncated message log");
        }
        Ok(())
    }

    async fn expect_chosen_sequencer(&self) -> Result<(), ConsensusError> {
        Ok(())
    }

    async fn fetch_batch(&self, batch_number: u64) -> Result<Vec<u8>, ConsensusError> {
        self.run(move |storage| storage.load_batch(batch_number))
            .await?
            .ok_or(ConsensusError::BatchNotFound { batch_number })
    }

    async fn messages_from(
        &self,
        message_index: u64,
    ) -> Result<Vec<LoggedMessage>, ConsensusError> {
        self.run(move |storage| storage.load_messages_from(message_index))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::B256;
    use rollup_core::message::{Message, MessageHeader};
    use tempfile::TempDir;

    fn open_log(dir: &TempDir) -> SqliteMessageLog {
        let path = dir.path().join("log.sqlite");
        SqliteMessageLog::new(Storage::open(&path.to_string_lossy(), "NORMAL").expect("open storage"))
    }

    fn message(byte: u8) -> MessageWithMetadata {
        MessageWithMetadata {
            message: Message {
                header: MessageHeader::sequencer(1, 2),
                l2_msg: vec![0x04, byte].into(),
            },
            delayed_messages_read: 0,
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn rejects_gaps_and_overwrites_suffix() {
        let dir = TempDir::new().expect("temp dir");
        let log = open_log(&dir);
        let result = MessageResult {
            block_hash: B256::repeat_byte(1),
            send_root: B256::ZERO,
        };

        let err = log
            .write_message_from_sequencer(2, &message(1), &result)
            .await
            .expect_err("gap must be rejected");
        assert!(matches!(err, ConsensusError::OutOfOrder { got: 2, expected: 1 }));

        log.write_message_from_sequencer(1, &message(1), &result)
            .await
            .expect("write 1");
        log.write_message_from_sequencer(2, &message(2), &result)
            .await
            .expect("write 2");
        log.write_message_from_sequencer(2, &message(3), &result)
            .await
            .expect("rewrite 2");

        let logged = log.messages_from(1).await.expect("read log");
        assert_eq!(logged.len(), 2);
        assert_eq!(logged[1].message, message(3));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn fetch_batch_reports_missing_batches() {
        let dir = TempDir::new().expect("temp dir");
        let log = open_log(&dir);
        log.store_batch(4, vec![0xca, 0xfe]).await.expect("store batch");

        assert_eq!(log.fetch_batch(4).await.expect("fetch"), vec![0xca, 0xfe]);
        assert!(matches!(
            log.fetch_batch(5).await,
            Err(ConsensusError::BatchNotFound { batch_number: 5 })
        ));
    }
}
