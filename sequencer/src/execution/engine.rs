// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use rollup_core::application::{
    NoopHooks, ProducedBlock, SequencingHooks, StateTransition, TxError,
};
use rollup_core::block::{Block, BlockContext, BlockHeader, BuildToken, MessageResult};
use rollup_core::message::{
    BATCH_POSTER_ADDRESS, Message, MessageHeader, MessageWithMetadata, kind, message_from_txes,
    parse_l2_transactions,
};
use rollup_core::transaction::Transaction;
use tokio::sync::{Notify, OwnedMutexGuard, mpsc, watch};

use super::{BlockRecorder, Blockchain, ConsensusClient, EngineError};

const INSERT_LOCK_RETRIES: usize = 20;
const INSERT_LOCK_RETRY_DELAY: Duration = Duration::from_millis(100);
const BLOCK_LOG_INTERVAL: Duration = Duration::from_secs(1);

/// Proof that the caller holds the create-blocks lock. Dropping it releases the lock.
pub struct CommitPermit {
    _guard: OwnedMutexGuard<()>,
}

/// Outcome of one sequencing attempt. `block` is `None` when nothing was included.
#[derive(Debug)]
pub struct SequencedBatch {
    pub block: Option<Block>,
    pub tx_results: Vec<Result<(), TxError>>,
}

struct ResequenceJob {
    permit: CommitPermit,
    messages: Vec<MessageWithMetadata>,
}

pub struct ExecutionEngine<T: StateTransition> {
    create_blocks: Arc<tokio::sync::Mutex<()>>,
    chain: Blockchain,
    stf: T,
    consensus: Arc<dyn ConsensusClient>,
    recorder: Option<Arc<dyn BlockRecorder>>,
    reorg_sequencing: AtomicBool,
    started: AtomicBool,
    next_token: AtomicU64,
    new_blocks: watch::Sender<Option<BlockHeader>>,
    reorgs: Notify,
    resequence_tx: mpsc::UnboundedSender<ResequenceJob>,
    resequence_rx: Mutex<Option<mpsc::UnboundedReceiver<ResequenceJob>>>,
}

impl<T: StateTransition> ExecutionEngine<T> {
    pub fn new(chain: Blockchain, stf: T, consensus: Arc<dyn ConsensusClient>) -> Self {
        let (new_blocks, _) = watch::channel(Some(chain.current_header()));
        let (resequence_tx, resequence_rx) = mpsc::unbounded_channel();
        Self {
            create_blocks: Arc::new(tokio::sync::Mutex::new(())),
            chain,
            stf,
            consensus,
            recorder: None,
            reorg_sequencing: AtomicBool::new(false),
            started: AtomicBool::new(false),
            next_token: AtomicU64::new(1),
            new_blocks,
            reorgs: Notify::new(),
            resequence_tx,
            resequence_rx: Mutex::new(Some(resequence_rx)),
        }
    }

    pub fn with_recorder(mut self, recorder: Arc<dyn BlockRecorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    /// Resequences reorged-out messages from now on. Must be called before `start`.
    pub fn enable_reorg_sequencing(&self) {
        assert!(
            !self.started.load(Ordering::Acquire),
            "reorg sequencing must be enabled before the engine starts"
        );
        self.reorg_sequencing.store(true, Ordering::Release);
    }

    /// Spawns the resequencing worker and the block logger. Both exit once the engine is
    /// dropped.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::AcqRel) {
            tracing::warn!("execution engine already started");
            return;
        }
        let rx = self
            .resequence_rx
            .lock()
            .expect("resequence receiver mutex poisoned")
            .take();
        if let Some(rx) = rx {
            tokio::spawn(run_resequencer(Arc::downgrade(self), rx));
        }
        tokio::spawn(log_new_blocks(self.new_blocks.subscribe()));
    }

    pub async fn sequence_transactions(
        &self,
        header: MessageHeader,
        txs: &[Transaction],
        hooks: &mut dyn SequencingHooks,
    ) -> Result<SequencedBatch, EngineError> {
        let mut attempts = 0;
        loop {
            let permit = self.acquire_permit().await;
            let result = self
                .sequence_transactions_with_block_mutex(&permit, header.clone(), txs, hooks)
                .await;
            drop(permit);

            match result {
                Err(err) if err.is_insert_lock_taken() => {
                    attempts += 1;
                    if attempts > INSERT_LOCK_RETRIES {
                        tracing::warn!(attempts, "insert lock still taken, giving up");
                        return Err(err);
                    }
                    self.consensus
                        .expect_chosen_sequencer()
                        .await
                        .map_err(|source| EngineError::RetrySequencer { source })?;
                    tokio::time::sleep(INSERT_LOCK_RETRY_DELAY).await;
                }
                other => return other,
            }
        }
    }

    async fn sequence_transactions_with_block_mutex(
        &self,
        _permit: &CommitPermit,
        header: MessageHeader,
        txs: &[Transaction],
        hooks: &mut dyn SequencingHooks,
    ) -> Result<SequencedBatch, EngineError> {
        let parent = self.chain.current_header();
        let ctx = self.block_context(
            &parent,
            header.timestamp,
            header.block_number,
            parent.delayed_messages_read,
        );
        let produced = self.execute_batch(&ctx, &parent, &header, txs, hooks)?;

        if produced.tx_results.len() != txs.len() {
            return Err(EngineError::TxResultCountMismatch {
                txs: txs.len(),
                results: produced.tx_results.len(),
            });
        }
        if produced.receipts.is_empty() || produced.all_failed() {
            return Ok(SequencedBatch {
                block: None,
                tx_results: produced.tx_results,
            });
        }

        let message = message_from_txes(header, txs, &produced.tx_results)
            .map_err(|source| EngineError::Message { source })?;
        let message = MessageWithMetadata {
            message,
            delayed_messages_read: parent.delayed_messages_read,
        };
        self.persist_and_append(&message, &produced).await?;

        Ok(SequencedBatch {
            block: Some(produced.block),
            tx_results: produced.tx_results,
        })
    }

    pub async fn sequence_delayed_message(
        &self,
        message: Message,
        delayed_seq_num: u64,
    ) -> Result<MessageResult, EngineError> {
        let permit = self.acquire_permit().await;
        self.sequence_delayed_message_with_block_mutex(&permit, message, delayed_seq_num)
            .await
    }

    async fn sequence_delayed_message_with_block_mutex(
        &self,
        _permit: &CommitPermit,
        message: Message,
        delayed_seq_num: u64,
    ) -> Result<MessageResult, EngineError> {
        let expected = self.chain.current_header().delayed_messages_read;
        if delayed_seq_num != expected {
            return Err(EngineError::WrongDelayedMessage {
                got: delayed_seq_num,
                expected,
            });
        }

        let message = MessageWithMetadata {
            message,
            delayed_messages_read: delayed_seq_num + 1,
        };
        let produced = self.execute_message(&message)?;
        let result = produced.block.header.message_result();
        self.persist_and_append(&message, &produced).await?;
        tracing::info!(
            delayed = delayed_seq_num,
            block = produced.block.header.number,
            "sequenced delayed message"
        );
        Ok(result)
    }

    /// Applies a message supplied by someone else. Fails instead of waiting when a block is
    /// already being created.
    pub fn digest_message(
        &self,
        message_index: u64,
        message: &MessageWithMetadata,
    ) -> Result<MessageResult, EngineError> {
        let permit = self.try_acquire_permit()?;
        self.digest_message_with_block_mutex(&permit, message_index, message)
    }

    fn digest_message_with_block_mutex(
        &self,
        _permit: &CommitPermit,
        message_index: u64,
        message: &MessageWithMetadata,
    ) -> Result<MessageResult, EngineError> {
        let expected = self.head_message_index() + 1;
        if message_index != expected {
            return Err(EngineError::WrongDigestNumber {
                got: message_index,
                expected,
            });
        }
        let produced = self.execute_message(message)?;
        self.append(&produced)?;
        Ok(produced.block.header.message_result())
    }

    /// Rewinds to message `count - 1`, replays `new_messages` on top and hands
    /// `old_messages` to the resequencing worker. The message log is cut back to the same
    /// point, so a restart never replays reorged-out messages.
    pub async fn reorg(
        &self,
        count: u64,
        new_messages: Vec<MessageWithMetadata>,
        old_messages: Vec<MessageWithMetadata>,
    ) -> Result<Vec<MessageResult>, EngineError> {
        let permit = self.acquire_permit().await;
        if count == 0 {
            return Err(EngineError::CannotReorgGenesis);
        }

        let target_number = self.message_index_to_block_number(count - 1);
        let Some(target) = self.chain.header_by_number(target_number) else {
            tracing::warn!(
                target = target_number,
                head = self.chain.current_header().number,
                "reorg target block not found, nothing to do"
            );
            return Ok(Vec::new());
        };

        self.consensus
            .truncate_messages_from(count)
            .await
            .map_err(|source| EngineError::Consensus { source })?;
        let removed = self.chain.reorg_to(target_number)?;
        tracing::warn!(
            target = target_number,
            removed,
            new = new_messages.len(),
            old = old_messages.len(),
            "reorg"
        );
        if let Some(recorder) = &self.recorder {
            recorder.reorg_to(&target);
        }
        self.new_blocks.send_replace(Some(target));
        self.reorgs.notify_waiters();

        let mut results = Vec::with_capacity(new_messages.len());
        for message in &new_messages {
            let produced = self.execute_message(message)?;
            self.persist_and_append(message, &produced).await?;
            results.push(produced.block.header.message_result());
        }

        if !old_messages.is_empty() && self.reorg_sequencing.load(Ordering::Acquire) {
            let job = ResequenceJob {
                permit,
                messages: old_messages,
            };
            if self.resequence_tx.send(job).is_err() {
                tracing::error!("resequencing worker is gone, dropping reorged-out messages");
            }
        }
        Ok(results)
    }

    /// Re-executes logged messages the chain has not caught up with yet.
    pub async fn catch_up(&self) -> Result<usize, EngineError> {
        let permit = self.acquire_permit().await;
        let from = self.head_message_index() + 1;
        let logged = self
            .consensus
            .messages_from(from)
            .await
            .map_err(|source| EngineError::Consensus { source })?;

        let replayed = logged.len();
        for entry in logged {
            let result = self.digest_message_with_block_mutex(&permit, entry.index, &entry.message)?;
            if result.block_hash != entry.result.block_hash {
                return Err(EngineError::CatchUpMismatch {
                    index: entry.index,
                    logged: entry.result.block_hash,
                    computed: result.block_hash,
                });
            }
        }
        if replayed > 0 {
            tracing::info!(replayed, head = self.head_message_index(), "caught up with message log");
        }
        Ok(replayed)
    }

    pub async fn maintenance(&self) -> Result<(), EngineError> {
        let _permit = self.acquire_permit().await;
        self.chain.checkpoint()?;
        Ok(())
    }

    pub async fn fetch_batch(&self, batch_number: u64) -> Result<Vec<u8>, EngineError> {
        self.consensus
            .fetch_batch(batch_number)
            .await
            .map_err(|source| EngineError::Consensus { source })
    }

    pub fn current_header(&self) -> BlockHeader {
        self.chain.current_header()
    }

    pub fn head_message_index(&self) -> u64 {
        self.block_number_to_message_index(self.chain.current_header().number)
    }

    pub fn next_delayed_message_number(&self) -> u64 {
        self.chain.current_header().delayed_messages_read
    }

    pub fn result_at_message_index(&self, message_index: u64) -> Option<MessageResult> {
        self.chain
            .header_by_number(self.message_index_to_block_number(message_index))
            .map(|header| header.message_result())
    }

    pub fn message_index_to_block_number(&self, message_index: u64) -> u64 {
        message_index.saturating_add(self.chain.genesis_block_number())
    }

    pub fn block_number_to_message_index(&self, block_number: u64) -> u64 {
        block_number.saturating_sub(self.chain.genesis_block_number())
    }

    pub fn chain(&self) -> &Blockchain {
        &self.chain
    }

    pub fn subscribe_new_blocks(&self) -> watch::Receiver<Option<BlockHeader>> {
        self.new_blocks.subscribe()
    }

    pub async fn wait_for_reorg(&self) {
        self.reorgs.notified().await;
    }

    /// Whether some task currently holds the create-blocks lock.
    pub fn commit_lock_held(&self) -> bool {
        self.create_blocks.try_lock().is_err()
    }

    async fn acquire_permit(&self) -> CommitPermit {
        CommitPermit {
            _guard: self.create_blocks.clone().lock_owned().await,
        }
    }

    fn try_acquire_permit(&self) -> Result<CommitPermit, EngineError> {
        self.create_blocks
            .clone()
            .try_lock_owned()
            .map(|guard| CommitPermit { _guard: guard })
            .map_err(|_| EngineError::CreateBlocksMutexHeld)
    }

    fn block_context(
        &self,
        parent: &BlockHeader,
        timestamp: u64,
        l1_block_number: u64,
        delayed_messages_read: u64,
    ) -> BlockContext {
        BlockContext {
            number: parent.number + 1,
            parent_hash: parent.hash,
            timestamp,
            l1_block_number,
            delayed_messages_read,
            token: BuildToken(self.next_token.fetch_add(1, Ordering::Relaxed)),
        }
    }

    // The chain read lock lives only inside these two calls.
    fn execute_batch(
        &self,
        ctx: &BlockContext,
        parent: &BlockHeader,
        header: &MessageHeader,
        txs: &[Transaction],
        hooks: &mut dyn SequencingHooks,
    ) -> Result<ProducedBlock, EngineError> {
        let state = self.chain.state_at(parent.number);
        self.stf
            .produce_block_advanced(ctx, parent, &state, header, txs, hooks)
            .map_err(|source| EngineError::Stf { source })
    }

    fn execute_message(&self, message: &MessageWithMetadata) -> Result<ProducedBlock, EngineError> {
        let parent = self.chain.current_header();
        let header = &message.message.header;
        let ctx = self.block_context(
            &parent,
            header.timestamp,
            header.block_number,
            message.delayed_messages_read,
        );
        let state = self.chain.state_at(parent.number);
        self.stf
            .produce_block(&ctx, &parent, &state, message)
            .map_err(|source| EngineError::Stf { source })
    }

    async fn persist_and_append(
        &self,
        message: &MessageWithMetadata,
        produced: &ProducedBlock,
    ) -> Result<(), EngineError> {
        let message_index = self.block_number_to_message_index(produced.block.header.number);
        self.consensus
            .write_message_from_sequencer(
                message_index,
                message,
                &produced.block.header.message_result(),
            )
            .await
            .map_err(|source| EngineError::Consensus { source })?;
        self.append(produced)
    }

    fn append(&self, produced: &ProducedBlock) -> Result<(), EngineError> {
        self.chain
            .append_block(&produced.block, &produced.nonce_changes)?;
        self.new_blocks
            .send_replace(Some(produced.block.header.clone()));
        Ok(())
    }

    async fn resequence_reorged_out(&self, permit: &CommitPermit, messages: Vec<MessageWithMetadata>) {
        for message in messages {
            let header = &message.message.header;
            if let Some(delayed_seq_num) = header.delayed_sequence_number() {
                let next = self.next_delayed_message_number();
                if delayed_seq_num != next {
                    tracing::info!(
                        delayed = delayed_seq_num,
                        next,
                        "skipping superseded delayed message"
                    );
                    continue;
                }
                if let Err(err) = self
                    .sequence_delayed_message_with_block_mutex(
                        permit,
                        message.message.clone(),
                        delayed_seq_num,
                    )
                    .await
                {
                    tracing::error!(error = %err, delayed = delayed_seq_num, "failed to resequence delayed message");
                    return;
                }
                continue;
            }

            if header.kind != kind::L2_MESSAGE || header.poster != BATCH_POSTER_ADDRESS {
                tracing::warn!(
                    kind = header.kind,
                    poster = %header.poster,
                    "skipping non-sequencer message during resequencing"
                );
                continue;
            }
            let txs = match parse_l2_transactions(&message.message) {
                Ok(txs) => txs,
                Err(err) => {
                    tracing::warn!(error = %err, "failed to parse reorged-out sequencer message");
                    continue;
                }
            };
            let mut hooks = NoopHooks {
                discard_invalid_txs_early: true,
            };
            if let Err(err) = self
                .sequence_transactions_with_block_mutex(permit, header.clone(), &txs, &mut hooks)
                .await
            {
                tracing::error!(error = %err, "failed to resequence reorged-out transactions");
                return;
            }
        }
    }
}

async fn run_resequencer<T: StateTransition>(
    engine: Weak<ExecutionEngine<T>>,
    mut rx: mpsc::UnboundedReceiver<ResequenceJob>,
) {
    while let Some(job) = rx.recv().await {
        let Some(engine) = engine.upgrade() else {
            return;
        };
        let count = job.messages.len();
        engine
            .resequence_reorged_out(&job.permit, job.messages)
            .await;
        drop(job.permit);
        tracing::info!(count, "finished resequencing reorged-out messages");
    }
}

async fn log_new_blocks(mut rx: watch::Receiver<Option<BlockHeader>>) {
    let mut ticker = tokio::time::interval(BLOCK_LOG_INTERVAL);
    let mut last_logged = rx.borrow().as_ref().map(|header| header.number);
    loop {
        ticker.tick().await;
        if rx.has_changed().is_err() {
            return;
        }
        let Some(header) = rx.borrow_and_update().clone() else {
            continue;
        };
        if last_logged == Some(header.number) {
            continue;
        }
        let since_last = last_logged.map_or(1, |last| header.number.saturating_sub(last));
        tracing::info!(
            block = header.number,
            hash = %header.hash,
            blocks = since_last,
            "created block"
        );
        last_logged = Some(header.number);
    }
}
