// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use alloy_primitives::{Address, U256};
use async_trait::async_trait;
use rollup_core::application::{
    LedgerStf, NoopHooks, ProducedBlock, SequencingHooks, StateTransition, StateView, StfError,
};
use rollup_core::block::{BlockContext, BlockHeader, MessageResult};
use rollup_core::message::{Message, MessageHeader, MessageWithMetadata, kind};
use rollup_core::transaction::{LEGACY_TX_TYPE, Transaction, TxBody};
use rollup_sequencer::execution::{
    Blockchain, ConsensusClient, ConsensusError, EngineError, ExecutionEngine,
};
use rollup_sequencer::storage::{LoggedMessage, SqliteMessageLog, Storage};
use tempfile::TempDir;

struct TestDb {
    _dir: TempDir,
    path: String,
}

fn temp_db(name: &str) -> TestDb {
    let dir = tempfile::Builder::new()
        .prefix(format!("execution-engine-{name}-").as_str())
        .tempdir()
        .expect("create temporary test directory");
    let path = dir.path().join("chain.sqlite");
    TestDb {
        _dir: dir,
        path: path.to_string_lossy().into_owned(),
    }
}

fn open_engine<T: StateTransition>(
    chain_path: &str,
    log: &SqliteMessageLog,
    stf: T,
) -> Arc<ExecutionEngine<T>> {
    open_engine_with(chain_path, Arc::new(log.clone()), stf)
}

fn open_engine_with<T: StateTransition>(
    chain_path: &str,
    consensus: Arc<dyn ConsensusClient>,
    stf: T,
) -> Arc<ExecutionEngine<T>> {
    let chain = Blockchain::open(
        Storage::open(chain_path, "NORMAL").expect("open chain storage"),
        BlockHeader::genesis(0, 1),
    )
    .expect("open chain");
    Arc::new(ExecutionEngine::new(chain, stf, consensus))
}

fn open_log(path: &str) -> SqliteMessageLog {
    SqliteMessageLog::new(Storage::open(path, "NORMAL").expect("open log storage"))
}

fn transfer(sender: u8, nonce: u64) -> Transaction {
    Transaction::new(
        LEGACY_TX_TYPE,
        TxBody {
            sender: Address::repeat_byte(sender),
            nonce,
            gas_limit: 50_000,
            max_fee_per_gas: 1,
            to: Address::repeat_byte(0x01),
            value: U256::ZERO,
            data: vec![0x01].into(),
        },
    )
}

fn deposit(delayed_seq_num: u64) -> Message {
    Message {
        header: MessageHeader {
            kind: kind::ETH_DEPOSIT,
            poster: Address::repeat_byte(0xde),
            block_number: 3,
            timestamp: 20,
            request_id: Some(MessageHeader::request_id_for(delayed_seq_num)),
        },
        l2_msg: Vec::new().into(),
    }
}

async fn sequence<T: StateTransition>(engine: &ExecutionEngine<T>, txs: &[Transaction], ts: u64) {
    let mut hooks = NoopHooks {
        discard_invalid_txs_early: true,
    };
    let batch = engine
        .sequence_transactions(MessageHeader::sequencer(2, ts), txs, &mut hooks)
        .await
        .expect("sequence transactions");
    assert!(batch.block.is_some(), "batch produced a block");
}

async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Message log whose insert lock is taken by someone else for the first few writes.
struct ContendedLog {
    inner: SqliteMessageLog,
    lock_taken: AtomicUsize,
    not_chosen: AtomicUsize,
    write_attempts: AtomicUsize,
}

impl ContendedLog {
    fn new(inner: SqliteMessageLog, lock_taken: usize, not_chosen: usize) -> Self {
        Self {
            inner,
            lock_taken: AtomicUsize::new(lock_taken),
            not_chosen: AtomicUsize::new(not_chosen),
            write_attempts: AtomicUsize::new(0),
        }
    }

    fn write_attempts(&self) -> usize {
        self.write_attempts.load(Ordering::SeqCst)
    }
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl ConsensusClient for ContendedLog {
    async fn write_message_from_sequencer(
        &self,
        message_index: u64,
        message: &MessageWithMetadata,
        result: &MessageResult,
    ) -> Result<(), ConsensusError> {
        self.write_attempts.fetch_add(1, Ordering::SeqCst);
        if take_one(&self.lock_taken) {
            return Err(ConsensusError::InsertLockTaken);
        }
        self.inner
            .write_message_from_sequencer(message_index, message, result)
            .await
    }

    async fn truncate_messages_from(&self, message_index: u64) -> Result<(), ConsensusError> {
        self.inner.truncate_messages_from(message_index).await
    }

    async fn expect_chosen_sequencer(&self) -> Result<(), ConsensusError> {
        if take_one(&self.not_chosen) {
            return Err(ConsensusError::NotChosenSequencer);
        }
        Ok(())
    }

    async fn fetch_batch(&self, batch_number: u64) -> Result<Vec<u8>, ConsensusError> {
        self.inner.fetch_batch(batch_number).await
    }

    async fn messages_from(
        &self,
        message_index: u64,
    ) -> Result<Vec<LoggedMessage>, ConsensusError> {
        self.inner.messages_from(message_index).await
    }
}

/// Records the highest number of block productions running at once.
struct ReentrancyProbe {
    inner: LedgerStf,
    inside: AtomicUsize,
    max_inside: Arc<AtomicUsize>,
}

impl ReentrancyProbe {
    fn enter(&self) {
        let inside = self.inside.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_inside.fetch_max(inside, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(20));
    }

    fn exit(&self) {
        self.inside.fetch_sub(1, Ordering::SeqCst);
    }
}

impl StateTransition for ReentrancyProbe {
    fn produce_block(
        &self,
        ctx: &BlockContext,
        parent: &BlockHeader,
        state: &dyn StateView,
        message: &MessageWithMetadata,
    ) -> Result<ProducedBlock, StfError> {
        self.enter();
        let produced = self.inner.produce_block(ctx, parent, state, message);
        self.exit();
        produced
    }

    fn produce_block_advanced(
        &self,
        ctx: &BlockContext,
        parent: &BlockHeader,
        state: &dyn StateView,
        header: &MessageHeader,
        txs: &[Transaction],
        hooks: &mut dyn SequencingHooks,
    ) -> Result<ProducedBlock, StfError> {
        self.enter();
        let produced = self
            .inner
            .produce_block_advanced(ctx, parent, state, header, txs, hooks);
        self.exit();
        produced
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_builders_never_overlap() {
    let db = temp_db("single-writer");
    let log = open_log(&db.path);
    let max_inside = Arc::new(AtomicUsize::new(0));
    let engine = open_engine(
        &db.path,
        &log,
        ReentrancyProbe {
            inner: LedgerStf::default(),
            inside: AtomicUsize::new(0),
            max_inside: Arc::clone(&max_inside),
        },
    );

    let builders: Vec<_> = (0..6_u8)
        .map(|index| {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { sequence(&engine, &[transfer(0x10 + index, 0)], 10).await })
        })
        .collect();
    let delayed = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            engine
                .sequence_delayed_message(deposit(0), 0)
                .await
                .expect("delayed message")
        })
    };
    for builder in builders {
        builder.await.expect("join builder");
    }
    delayed.await.expect("join delayed");

    assert_eq!(max_inside.load(Ordering::SeqCst), 1);
    assert_eq!(engine.current_header().number, 7);
    assert_eq!(engine.head_message_index(), 7);
    assert!(!engine.commit_lock_held());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn delayed_messages_must_arrive_in_order() {
    let db = temp_db("delayed");
    let log = open_log(&db.path);
    let engine = open_engine(&db.path, &log, LedgerStf::default());

    let err = engine
        .sequence_delayed_message(deposit(1), 1)
        .await
        .expect_err("delayed 1 before delayed 0");
    assert_eq!(
        err.to_string(),
        "wrong delayed message sequenced got 1 expected 0"
    );

    let result = engine
        .sequence_delayed_message(deposit(0), 0)
        .await
        .expect("delayed 0");
    assert_eq!(engine.next_delayed_message_number(), 1);
    assert_eq!(engine.result_at_message_index(1), Some(result));

    sequence(&engine, &[transfer(0x31, 0)], 30).await;
    assert_eq!(engine.current_header().delayed_messages_read, 1);

    let err = engine
        .sequence_delayed_message(deposit(3), 3)
        .await
        .expect_err("gap in delayed messages");
    assert_eq!(
        err.to_string(),
        "wrong delayed message sequenced got 3 expected 1"
    );
    assert!(!engine.commit_lock_held());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn repeated_reorg_to_the_same_target_is_a_no_op() {
    let db = temp_db("reorg");
    let log = open_log(&db.path);
    let engine = open_engine(&db.path, &log, LedgerStf::default());
    for nonce in 0..3 {
        sequence(&engine, &[transfer(0x41, nonce)], 10 + nonce).await;
    }
    let target = engine.chain().header_by_number(1).expect("block 1");

    let replayed = engine
        .reorg(2, Vec::new(), Vec::new())
        .await
        .expect("first reorg");
    assert!(replayed.is_empty());
    assert_eq!(engine.current_header(), target);

    engine
        .reorg(2, Vec::new(), Vec::new())
        .await
        .expect("same reorg again");
    assert_eq!(engine.current_header(), target);

    let replayed = engine
        .reorg(10, Vec::new(), Vec::new())
        .await
        .expect("target beyond the head");
    assert!(replayed.is_empty());
    assert_eq!(engine.current_header(), target);

    let err = engine
        .reorg(0, Vec::new(), Vec::new())
        .await
        .expect_err("genesis stays");
    assert_eq!(err.to_string(), "cannot reorg out genesis");
    assert_eq!(
        engine
            .chain()
            .state_at(target.number)
            .nonce(Address::repeat_byte(0x41)),
        1
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reorg_replays_new_messages() {
    let db = temp_db("reorg-replay");
    let log = open_log(&db.path);
    let engine = open_engine(&db.path, &log, LedgerStf::default());
    sequence(&engine, &[transfer(0x51, 0)], 10).await;
    sequence(&engine, &[transfer(0x51, 1)], 11).await;
    let logged = log.messages_from(1).await.expect("read log");
    assert_eq!(logged.len(), 2);

    let replacement = MessageWithMetadata {
        message: deposit(0),
        delayed_messages_read: 1,
    };
    let results = engine
        .reorg(2, vec![replacement.clone()], Vec::new())
        .await
        .expect("reorg with replacement");
    assert_eq!(results.len(), 1);
    assert_eq!(engine.current_header().number, 2);
    assert_eq!(engine.next_delayed_message_number(), 1);
    assert_eq!(engine.result_at_message_index(2), Some(results[0]));

    let logged = log.messages_from(1).await.expect("read log");
    assert_eq!(logged.len(), 2);
    assert_eq!(logged[1].message, replacement);
    assert_eq!(logged[1].result, results[0]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reorg_cuts_the_message_log_back() {
    let log_db = temp_db("reorg-log");
    let chain_db = temp_db("reorg-log-chain");
    let replica_db = temp_db("reorg-log-replica");
    let log = open_log(&log_db.path);
    let engine = open_engine(&chain_db.path, &log, LedgerStf::default());
    for nonce in 0..3 {
        sequence(&engine, &[transfer(0x55, nonce)], 10 + nonce).await;
    }
    assert_eq!(log.messages_from(1).await.expect("read log").len(), 3);

    engine
        .reorg(2, Vec::new(), Vec::new())
        .await
        .expect("reorg to message 1");
    let target = engine.current_header();
    assert_eq!(target.number, 1);
    let logged = log.messages_from(1).await.expect("read log");
    assert_eq!(logged.len(), 1);
    assert_eq!(logged[0].result, target.message_result());

    // A node rebuilding from the log ends where the reorg left off.
    let replica = open_engine(&replica_db.path, &log, LedgerStf::default());
    assert_eq!(replica.catch_up().await.expect("catch up"), 1);
    assert_eq!(replica.current_header(), target);

    // Sequencing continues right after the cut.
    sequence(&engine, &[transfer(0x55, 1)], 20).await;
    assert_eq!(engine.current_header().number, 2);
    assert_eq!(log.messages_from(1).await.expect("read log").len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reorged_out_transactions_are_resequenced() {
    let db = temp_db("resequence");
    let log = open_log(&db.path);
    let engine = open_engine(&db.path, &log, LedgerStf::default());
    engine.enable_reorg_sequencing();
    engine.start();

    sequence(&engine, &[transfer(0x61, 0)], 10).await;
    sequence(&engine, &[transfer(0x62, 0), transfer(0x61, 1)], 11).await;
    let old_messages: Vec<MessageWithMetadata> = log
        .messages_from(1)
        .await
        .expect("read log")
        .into_iter()
        .map(|entry| entry.message)
        .collect();
    assert_eq!(old_messages.len(), 2);

    // Block 1 is replaced by a delayed deposit, so the first reorged-out message stays valid
    // and the second one follows it.
    let replacement = MessageWithMetadata {
        message: deposit(0),
        delayed_messages_read: 1,
    };
    engine
        .reorg(1, vec![replacement], old_messages)
        .await
        .expect("reorg");

    wait_until("resequenced blocks", || {
        engine.current_header().number == 3 && !engine.commit_lock_held()
    })
    .await;
    let head = engine.current_header();
    let state = engine.chain().state_at(head.number);
    assert_eq!(state.nonce(Address::repeat_byte(0x61)), 2);
    assert_eq!(state.nonce(Address::repeat_byte(0x62)), 1);
    assert_eq!(head.delayed_messages_read, 1);
    drop(state);

    let logged = log.messages_from(1).await.expect("read log");
    assert_eq!(logged.len(), 3);
    assert_eq!(logged[0].message.message, deposit(0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn catch_up_replays_logged_messages_missing_from_the_chain() {
    let log_db = temp_db("catch-up-log");
    let before_db = temp_db("catch-up-before");
    let after_db = temp_db("catch-up-after");
    let log = open_log(&log_db.path);

    let head = {
        let engine = open_engine(&before_db.path, &log, LedgerStf::default());
        sequence(&engine, &[transfer(0x71, 0)], 10).await;
        engine
            .sequence_delayed_message(deposit(0), 0)
            .await
            .expect("delayed message");
        sequence(&engine, &[transfer(0x71, 1), transfer(0x72, 0)], 12).await;
        engine.current_header()
    };

    // The log is ahead of a chain that lost its appends.
    let engine = open_engine(&after_db.path, &log, LedgerStf::default());
    assert_eq!(engine.current_header().number, 0);
    let replayed = engine.catch_up().await.expect("catch up");
    assert_eq!(replayed, 3);
    assert_eq!(engine.current_header(), head);
    assert_eq!(engine.catch_up().await.expect("nothing left"), 0);

    // Reopening the caught-up chain keeps the replayed blocks.
    drop(engine);
    let reopened = open_engine(&after_db.path, &log, LedgerStf::default());
    assert_eq!(reopened.current_header(), head);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn maintenance_checkpoints_under_the_commit_lock() {
    let db = temp_db("maintenance");
    let log = open_log(&db.path);
    let engine = open_engine(&db.path, &log, LedgerStf::default());
    sequence(&engine, &[transfer(0x81, 0)], 10).await;

    engine.maintenance().await.expect("checkpoint");
    assert!(!engine.commit_lock_held());

    let mut blocks = engine.subscribe_new_blocks();
    sequence(&engine, &[transfer(0x81, 1)], 11).await;
    blocks.changed().await.expect("block notification");
    let latest = blocks.borrow_and_update().clone().expect("latest header");
    assert_eq!(latest.number, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn taken_insert_lock_is_retried_until_the_write_lands() {
    let db = temp_db("insert-lock");
    let log = open_log(&db.path);
    let contended = Arc::new(ContendedLog::new(log.clone(), 3, 0));
    let engine = open_engine_with(&db.path, contended.clone(), LedgerStf::default());

    sequence(&engine, &[transfer(0x91, 0)], 10).await;

    assert_eq!(contended.write_attempts(), 4);
    assert_eq!(engine.current_header().number, 1);
    assert_eq!(log.messages_from(1).await.expect("read log").len(), 1);
    assert!(!engine.commit_lock_held());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn insert_lock_that_never_frees_fails_the_batch() {
    let db = temp_db("insert-lock-stuck");
    let contended = Arc::new(ContendedLog::new(open_log(&db.path), usize::MAX, 0));
    let engine = open_engine_with(&db.path, contended.clone(), LedgerStf::default());

    let mut hooks = NoopHooks {
        discard_invalid_txs_early: true,
    };
    let err = engine
        .sequence_transactions(MessageHeader::sequencer(2, 10), &[transfer(0x92, 0)], &mut hooks)
        .await
        .expect_err("lock never frees");
    assert!(err.is_insert_lock_taken());
    assert_eq!(contended.write_attempts(), 21);
    assert_eq!(engine.current_header().number, 0);
    assert!(!engine.commit_lock_held());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn losing_the_sequencer_role_while_retrying_is_reported() {
    let db = temp_db("insert-lock-role");
    let contended = Arc::new(ContendedLog::new(open_log(&db.path), 1, 1));
    let engine = open_engine_with(&db.path, contended.clone(), LedgerStf::default());

    let mut hooks = NoopHooks {
        discard_invalid_txs_early: true,
    };
    let err = engine
        .sequence_transactions(MessageHeader::sequencer(2, 10), &[transfer(0x93, 0)], &mut hooks)
        .await
        .expect_err("role lost");
    assert!(matches!(
        err,
        EngineError::RetrySequencer {
            source: ConsensusError::NotChosenSequencer
        }
    ));
    assert_eq!(contended.write_attempts(), 1);
    assert_eq!(engine.current_header().number, 0);
    assert!(!engine.commit_lock_held());

    // The role came back: the same batch now lands.
    sequence(&engine, &[transfer(0x93, 0)], 11).await;
    assert_eq!(engine.current_header().number, 1);
}
