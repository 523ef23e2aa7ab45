// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use alloy_primitives::Address;
use async_trait::async_trait;
use futures_util::FutureExt;
use futures_util::future::join_all;
use rollup_core::application::{StateTransition, TxError, make_nonce_error};
use rollup_core::message::MessageHeader;
use rollup_core::transaction::{ConditionalOptions, Transaction};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until, timeout_at};
use tracing::{error, info, warn};

use super::config::SharedSequencerConfig;
use super::hooks::SequencerHooks;
use super::metrics::{METRICS_LOG_INTERVAL, SequencerMetrics};
use super::nonce_cache::NonceCache;
use super::nonce_failure_cache::{EvictHandler, NonceFailure, NonceFailureCache};
use super::role::{RoleSnapshot, RoleState};
use super::types::QueueItem;
use super::SubmitError;
use crate::execution::{EngineError, ExecutionEngine};
use crate::forwarder::{
    ForwarderError, HttpConnector, RpcConnector, TransactionPublisher, TxForwarder,
};
use crate::l1_reader::ParentChainHeader;

const SLOW_BUILD_WARNING: Duration = Duration::from_secs(5);

/// Everything the block loop owns. Handed back to `stop_and_wait` when the loop exits.
struct BuildState {
    rx: mpsc::Receiver<QueueItem>,
    retry: VecDeque<QueueItem>,
    nonce_cache: NonceCache,
    failures: NonceFailureCache,
    metrics: SequencerMetrics,
}

enum InactiveOutcome {
    /// The role is active: the batch is for us to sequence.
    Sequence(Vec<QueueItem>),
    Handled { made_block: bool },
}

/// Latest parent chain head, when a source is configured.
struct ParentChainTracker {
    configured: bool,
    head: Mutex<ParentChainHeader>,
}

impl ParentChainTracker {
    fn latest(&self) -> Option<ParentChainHeader> {
        self.configured
            .then(|| *self.head.lock().expect("parent chain head lock poisoned"))
    }

    fn update(&self, header: ParentChainHeader) {
        let mut head = self.head.lock().expect("parent chain head lock poisoned");
        if header.is_newer_than(&head) {
            *head = header;
        }
    }
}

/// Orders submitted transactions into blocks.
///
/// Submissions go through a bounded queue to a single block loop, which prechecks nonces,
/// parks transactions whose nonce is ahead, and hands the rest to the execution engine. While
/// paused or forwarding, the loop hands batches to the role instead.
pub struct Sequencer<T: StateTransition> {
    engine: Arc<ExecutionEngine<T>>,
    config: SharedSequencerConfig,
    connector: Arc<dyn RpcConnector>,
    role: Arc<RoleState>,
    queue_tx: mpsc::Sender<QueueItem>,
    parent_chain: Arc<ParentChainTracker>,
    parent_chain_source: Option<watch::Receiver<Option<ParentChainHeader>>>,
    build_state: Mutex<Option<BuildState>>,
    block_loop: Mutex<Option<JoinHandle<BuildState>>>,
    parent_chain_listener: Mutex<Option<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl<T: StateTransition> Sequencer<T> {
    /// Starts paused. Must be created before `engine.start()`.
    pub fn new(engine: Arc<ExecutionEngine<T>>, config: SharedSequencerConfig) -> Self {
        let current = config.get();
        let role = Arc::new(RoleState::paused());
        let (queue_tx, rx) = mpsc::channel(current.queue_size);
        let (shutdown_tx, _) = watch::channel(false);
        engine.enable_reorg_sequencing();

        let build_state = BuildState {
            rx,
            retry: VecDeque::new(),
            nonce_cache: NonceCache::new(current.nonce_cache_size),
            failures: NonceFailureCache::new(
                current.nonce_failure_cache_size,
                current.nonce_failure_cache_expiry,
                eviction_handler(Arc::clone(&role)),
            ),
            metrics: SequencerMetrics::new(current.enable_profiling, METRICS_LOG_INTERVAL),
        };

        Self {
            engine,
            connector: Arc::new(HttpConnector::new(current.forwarder.clone())),
            config,
            role,
            queue_tx,
            parent_chain: Arc::new(ParentChainTracker {
                configured: false,
                head: Mutex::new(ParentChainHeader::default()),
            }),
            parent_chain_source: None,
            build_state: Mutex::new(Some(build_state)),
            block_loop: Mutex::new(None),
            parent_chain_listener: Mutex::new(None),
            shutdown_tx,
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }
    }

    /// Enables the stale parent chain guard, fed by `source`.
    pub fn with_parent_chain(mut self, source: watch::Receiver<Option<ParentChainHeader>>) -> Self {
        self.parent_chain = Arc::new(ParentChainTracker {
            configured: true,
            head: Mutex::new(ParentChainHeader::default()),
        });
        self.parent_chain_source = Some(source);
        self
    }

    pub fn with_connector(mut self, connector: Arc<dyn RpcConnector>) -> Self {
        self.connector = connector;
        self
    }

    pub fn engine(&self) -> &Arc<ExecutionEngine<T>> {
        &self.engine
    }

    pub fn config(&self) -> &SharedSequencerConfig {
        &self.config
    }

    pub async fn publish_transaction(
        &self,
        tx: Transaction,
        options: Option<ConditionalOptions>,
    ) -> Result<(), SubmitError> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(SubmitError::Stopped);
        }
        if let Some(forwarder) = self.role.forwarder() {
            match forwarder.forward(&tx, options.as_ref()).await {
                // The role changed while forwarding.
                Err(ForwarderError::NoSequencer) => {}
                result => return result.map_err(Into::into),
            }
        }

        let config = self.config.get();
        let whitelist = self.config.whitelist();
        if !whitelist.is_empty() && !whitelist.contains(&tx.sender()) {
            return Err(SubmitError::NotWhitelisted);
        }
        if !tx.is_type_supported() {
            return Err(SubmitError::TxTypeNotSupported);
        }

        let tx_hash = tx.hash();
        let now = Instant::now();
        let queue_deadline = (!config.queue_timeout.is_zero()).then(|| now + config.queue_timeout);
        let reserved = match queue_deadline {
            Some(deadline) => timeout_at(deadline, self.queue_tx.reserve())
                .await
                .map_err(|_| SubmitError::QueueTimeout)?,
            None => self.queue_tx.reserve().await,
        };
        let permit = reserved.map_err(|_| SubmitError::Stopped)?;
        let (item, result) = QueueItem::new(tx, options, queue_deadline);
        permit.send(item);

        // Give the block loop the whole queue timeout again to answer.
        let received = match queue_deadline {
            Some(_) => match timeout_at(now + config.queue_timeout * 2, result).await {
                Ok(received) => received,
                Err(_) => {
                    warn!(tx = %tx_hash, "timed out waiting for transaction result");
                    return Err(SubmitError::AbortDeadline);
                }
            },
            None => result.await,
        };
        received.unwrap_or(Err(SubmitError::Internal))
    }

    pub fn pause(&self) {
        self.role.pause();
    }

    pub fn activate(&self) {
        self.role.activate();
    }

    pub fn forward_to(&self, url: &str) -> Result<(), SubmitError> {
        let config = self.config.get();
        self.role
            .forward_to(url, &config.forwarder, Arc::clone(&self.connector))
    }

    /// Empty unless forwarding.
    pub fn forward_target(&self) -> String {
        self.role.forward_target()
    }

    pub fn update_latest_parent_chain_block(&self, number: u64, timestamp: u64) {
        self.parent_chain
            .update(ParentChainHeader { number, timestamp });
    }

    pub async fn check_health(&self) -> Result<(), SubmitError> {
        match self.role.snapshot() {
            RoleSnapshot::Forwarding(forwarder) => forwarder.health().await.map_err(Into::into),
            RoleSnapshot::Paused(_) => Err(SubmitError::Paused),
            RoleSnapshot::Active => self.check_parent_chain(),
        }
    }

    /// Waits for the first parent chain header, when a source is configured.
    pub async fn initialize(&self) -> Result<(), SubmitError> {
        let Some(mut source) = self.parent_chain_source.clone() else {
            return Ok(());
        };
        let header = *source
            .wait_for(Option::is_some)
            .await
            .map_err(|_| SubmitError::NotInitialized)?;
        if let Some(header) = header {
            self.parent_chain.update(header);
        }
        Ok(())
    }

    pub fn start(self: &Arc<Self>) -> Result<(), SubmitError> {
        if self
            .parent_chain
            .latest()
            .is_some_and(|head| head.number == 0)
        {
            return Err(SubmitError::NotInitialized);
        }
        if self.started.swap(true, Ordering::AcqRel) {
            warn!("sequencer already started");
            return Ok(());
        }
        let Some(state) = self
            .build_state
            .lock()
            .expect("build state lock poisoned")
            .take()
        else {
            return Err(SubmitError::Stopped);
        };

        if let Some(mut source) = self.parent_chain_source.clone() {
            let parent_chain = Arc::clone(&self.parent_chain);
            let mut shutdown = self.shutdown_tx.subscribe();
            let listener = tokio::spawn(async move {
                loop {
                    tokio::select! {
                        changed = source.changed() => {
                            if changed.is_err() {
                                warn!("parent chain header source closed");
                                return;
                            }
                            let header = *source.borrow_and_update();
                            if let Some(header) = header {
                                parent_chain.update(header);
                            }
                        }
                        _ = shutdown.changed() => return,
                    }
                }
            });
            *self
                .parent_chain_listener
                .lock()
                .expect("listener lock poisoned") = Some(listener);
        }

        let sequencer = Arc::clone(self);
        let shutdown = self.shutdown_tx.subscribe();
        let block_loop = tokio::spawn(async move { sequencer.run(state, shutdown).await });
        *self.block_loop.lock().expect("block loop lock poisoned") = Some(block_loop);
        info!("sequencer started");
        Ok(())
    }

    /// Stops the block loop and gives every transaction still held a result: forwarded when
    /// a forwarder is set, "no sequencer" otherwise.
    pub async fn stop_and_wait(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.shutdown_tx.send(true);

        let listener = self
            .parent_chain_listener
            .lock()
            .expect("listener lock poisoned")
            .take();
        if let Some(listener) = listener {
            let _ = listener.await;
        }
        let block_loop = self.block_loop.lock().expect("block loop lock poisoned").take();
        let state = match block_loop {
            Some(block_loop) => match block_loop.await {
                Ok(state) => Some(state),
                Err(err) => {
                    error!(error = %err, "sequencer block loop failed");
                    None
                }
            },
            None => self.build_state.lock().expect("build state lock poisoned").take(),
        };
        let Some(mut state) = state else {
            return;
        };

        state.rx.close();
        let retried = state.retry.len();
        let mut leftover: Vec<QueueItem> = state.retry.drain(..).collect();
        while let Some(item) = state.failures.pop_oldest() {
            leftover.push(item);
        }
        let parked = leftover.len() - retried;
        while let Ok(item) = state.rx.try_recv() {
            leftover.push(item);
        }
        let queued = leftover.len() - retried - parked;
        if leftover.is_empty() {
            return;
        }

        match self.role.forwarder() {
            Some(forwarder) => {
                warn!(retried, parked, queued, target = %forwarder.primary_target(), "forwarding transactions left at shutdown");
                let results = join_all(
                    leftover
                        .iter()
                        .map(|item| forwarder.forward(&item.tx, item.options.as_ref())),
                )
                .await;
                for (item, result) in leftover.into_iter().zip(results) {
                    if let Err(err) = &result {
                        warn!(tx = %item.tx.hash(), error = %err, "failed to forward transaction at shutdown");
                    }
                    item.respond(result.map_err(Into::into));
                }
            }
            None => {
                warn!(retried, parked, queued, "no forwarder for transactions left at shutdown");
                for item in leftover {
                    item.respond(Err(SubmitError::NoSequencer));
                }
            }
        }
    }

    async fn run(self: Arc<Self>, mut state: BuildState, mut shutdown: watch::Receiver<bool>) -> BuildState {
        while !is_shutdown(&shutdown) {
            let started = Instant::now();
            let made_block = self.create_block(&mut state, &mut shutdown).await;
            state.metrics.maybe_log_window();
            if made_block && !is_shutdown(&shutdown) {
                let max_block_speed = self.config.get().max_block_speed;
                tokio::select! {
                    _ = sleep_until(started + max_block_speed) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }
        state.metrics.log_final();
        state
    }

    /// Builds at most one block. Returns whether the loop should wait before the next one.
    async fn create_block(&self, state: &mut BuildState, shutdown: &mut watch::Receiver<bool>) -> bool {
        match AssertUnwindSafe(self.create_block_inner(state, shutdown))
            .catch_unwind()
            .await
        {
            Ok(made_block) => made_block,
            Err(panic) => {
                let reason = panic_message(panic.as_ref());
                // Items still held by the build answer with an internal error as they drop.
                error!(reason, "sequencer block creation panicked");
                true
            }
        }
    }

    async fn create_block_inner(
        &self,
        state: &mut BuildState,
        shutdown: &mut watch::Receiver<bool>,
    ) -> bool {
        let config = self.config.get();
        let overflowed = state.failures.resize(config.nonce_failure_cache_size);
        state.metrics.set_enabled(config.enable_profiling);
        state.metrics.on_overflow(overflowed);
        state.failures.set_expiry(config.nonce_failure_cache_expiry);
        let mut next_expiry = state.failures.expire(Instant::now());

        let max_size = config.max_tx_data_size;
        let mut batch: Vec<QueueItem> = Vec::new();
        let mut total_size = 0_usize;
        loop {
            let item = if let Some(item) = state.retry.pop_front() {
                item
            } else if batch.is_empty() {
                tokio::select! {
                    _ = shutdown.changed() => return false,
                    received = state.rx.recv() => match received {
                        Some(item) => item,
                        None => return false,
                    },
                    _ = sleep_until(next_expiry.unwrap_or_else(Instant::now)), if next_expiry.is_some() => {
                        next_expiry = state.failures.expire(Instant::now());
                        continue;
                    }
                    _ = self.role.forwarder_set.notified() => {
                        if self.role.forwarder().is_some() {
                            // Hands every parked transaction to the new forwarder.
                            state.failures.clear();
                        }
                        next_expiry = state.failures.expire(Instant::now());
                        continue;
                    }
                }
            } else {
                match state.rx.try_recv() {
                    Ok(item) => item,
                    Err(_) => break,
                }
            };

            if let Some(err) = item.context_error() {
                item.respond(Err(err));
                continue;
            }
            if item.tx_size > max_size {
                item.respond(Err(SubmitError::OversizedData));
                continue;
            }
            if total_size + item.tx_size > max_size {
                state.retry.push_back(item);
                break;
            }
            total_size += item.tx_size;
            batch.push(item);
        }

        state.nonce_cache.resize(config.nonce_cache_size);
        state.nonce_cache.begin_new_block();
        let batch = self.precheck_nonces(state, batch, total_size, max_size);
        if batch.is_empty() {
            return false;
        }
        let total_size: usize = batch.iter().map(|item| item.tx_size).sum();
        if total_size > max_size {
            error!(total_size, max_size, "prechecked batch exceeds the data size limit, requeueing");
            state.retry.extend(batch);
            return false;
        }

        let batch = match self.handle_inactive(state, batch, shutdown).await {
            InactiveOutcome::Sequence(batch) => batch,
            InactiveOutcome::Handled { made_block } => return made_block,
        };

        let head = self.parent_chain.latest().unwrap_or_default();
        if let Err(err) = self.check_parent_chain() {
            error!(
                error = %err,
                l1_block = head.number,
                l1_timestamp = head.timestamp,
                "refusing to sequence with a stale parent chain view"
            );
            state.retry.extend(batch);
            return true;
        }

        let header = MessageHeader::sequencer(head.number, unix_now());
        let txs: Vec<Transaction> = batch.iter().map(|item| item.tx.clone()).collect();
        let started = Instant::now();
        let metrics_started = state.metrics.phase_started_at();
        let result = {
            let mut hooks = SequencerHooks {
                nonce_cache: &mut state.nonce_cache,
                failures: &mut state.failures,
                retry: &mut state.retry,
                options: batch.iter().map(|item| item.options.clone()).collect(),
                max_revert_gas_reject: config.max_revert_gas_reject,
            };
            self.engine.sequence_transactions(header, &txs, &mut hooks).await
        };
        let elapsed = started.elapsed();
        if elapsed >= SLOW_BUILD_WARNING {
            warn!(elapsed_ms = elapsed.as_millis() as u64, txs = txs.len(), "took over 5 seconds to sequence a block");
        }

        let sequenced = match result {
            Ok(sequenced) => sequenced,
            Err(err @ EngineError::RetrySequencer { .. }) => {
                warn!(error = %err, "sequencer role changed while building, retrying");
                if let InactiveOutcome::Sequence(batch) =
                    self.handle_inactive(state, batch, shutdown).await
                {
                    state.retry.extend(batch);
                }
                return false;
            }
            Err(err @ EngineError::TxResultCountMismatch { .. }) => {
                error!(error = %err, "sequencing produced the wrong number of results");
                respond_all(batch, SubmitError::Internal);
                return false;
            }
            Err(err) => {
                error!(error = %err, "error sequencing transactions");
                respond_all(
                    batch,
                    SubmitError::Build {
                        reason: err.to_string(),
                    },
                );
                return false;
            }
        };

        if let Some(block) = &sequenced.block {
            state.nonce_cache.finalize(&block.header);
        }
        let stats = state.nonce_cache.take_stats();
        state.metrics.on_nonce_cache(stats);

        let batch_len = batch.len();
        let mut made_block = false;
        let mut included = 0_u64;
        for (item, result) in batch.into_iter().zip(sequenced.tx_results) {
            match result {
                Ok(()) => {
                    made_block = true;
                    included += 1;
                    item.respond(Ok(()));
                }
                // Not enough gas left in this block: try it in the next one.
                Err(TxError::GasLimitReached) if made_block => state.retry.push_back(item),
                Err(TxError::Nonce(err)) if err.is_too_high() && item.context_error().is_none() => {
                    let overflowed = state.failures.add(err, item);
                    state.metrics.on_parked(overflowed);
                }
                Err(err) => item.respond(Err(err.into())),
            }
        }
        state
            .metrics
            .on_build_end(metrics_started, batch_len, included, made_block);
        made_block
    }

    /// Drops or parks transactions whose nonce can't apply yet, and pulls in parked
    /// successors of the ones that can.
    fn precheck_nonces(
        &self,
        state: &mut BuildState,
        batch: Vec<QueueItem>,
        mut total_size: usize,
        max_size: usize,
    ) -> Vec<QueueItem> {
        let head = self.engine.current_header();
        let chain_state = self.engine.chain().state_at(head.number);
        let mut output = Vec::with_capacity(batch.len());
        let mut pending_nonces: HashMap<Address, u64> = HashMap::new();
        let mut input = batch.into_iter();
        let mut revived: Option<QueueItem> = None;

        loop {
            let Some(item) = revived.take().or_else(|| input.next()) else {
                break;
            };
            let sender = item.tx.sender();
            let tx_nonce = item.tx.nonce();
            let state_nonce = state
                .nonce_cache
                .get(head.hash, None, &chain_state, sender);
            let pending_nonce = *pending_nonces.get(&sender).unwrap_or(&state_nonce);

            if tx_nonce == pending_nonce {
                pending_nonces.insert(sender, tx_nonce + 1);
                if let Some(successor) = state.failures.revive(sender, tx_nonce + 1) {
                    if let Some(err) = successor.context_error() {
                        successor.respond(Err(err));
                    } else if total_size + successor.tx_size > max_size {
                        state.retry.push_back(successor);
                    } else {
                        total_size += successor.tx_size;
                        revived = Some(successor);
                    }
                }
            } else if tx_nonce < state_nonce || tx_nonce > pending_nonce {
                match make_nonce_error(sender, tx_nonce, state_nonce) {
                    Some(err) if err.is_too_high() => {
                        let overflowed = state.failures.add(err, item);
                        state.metrics.on_parked(overflowed);
                        continue;
                    }
                    Some(err) => {
                        item.respond(Err(err.into()));
                        continue;
                    }
                    None => warn!(
                        %sender,
                        tx_nonce,
                        pending_nonce,
                        "unreachable nonce precheck state"
                    ),
                }
            }
            output.push(item);
        }
        output
    }

    /// Takes over the batch unless the sequencer is active.
    async fn handle_inactive(
        &self,
        state: &mut BuildState,
        batch: Vec<QueueItem>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> InactiveOutcome {
        loop {
            match self.role.snapshot() {
                RoleSnapshot::Active => return InactiveOutcome::Sequence(batch),
                RoleSnapshot::Paused(mut resumed) => {
                    tokio::select! {
                        _ = resumed.changed() => continue,
                        _ = shutdown.changed() => {
                            state.retry.extend(batch);
                            return InactiveOutcome::Handled { made_block: true };
                        }
                    }
                }
                RoleSnapshot::Forwarding(forwarder) => {
                    let results = forward_all(&forwarder, &batch).await;
                    for (item, result) in batch.into_iter().zip(results) {
                        match result {
                            Err(ForwarderError::NoSequencer) => state.retry.push_back(item),
                            result => item.respond(result.map_err(Into::into)),
                        }
                    }
                    state.failures.clear();
                    return InactiveOutcome::Handled { made_block: false };
                }
            }
        }
    }

    fn check_parent_chain(&self) -> Result<(), SubmitError> {
        let Some(head) = self.parent_chain.latest() else {
            return Ok(());
        };
        let max_delta = self.config.get().max_acceptable_timestamp_delta;
        if head.number == 0 || unix_now().abs_diff(head.timestamp) > max_delta.as_secs() {
            return Err(SubmitError::StaleParentChain);
        }
        Ok(())
    }
}

#[async_trait]
impl<T: StateTransition> TransactionPublisher for Sequencer<T> {
    async fn publish_transaction(
        &self,
        tx: Transaction,
        options: Option<ConditionalOptions>,
    ) -> Result<(), SubmitError> {
        Sequencer::publish_transaction(self, tx, options).await
    }

    async fn check_health(&self) -> Result<(), SubmitError> {
        Sequencer::check_health(self).await
    }

    async fn initialize(&self) -> Result<(), SubmitError> {
        Sequencer::initialize(self).await
    }

    fn start(self: Arc<Self>) -> Result<(), SubmitError> {
        Sequencer::start(&self)
    }

    async fn stop_and_wait(&self) {
        Sequencer::stop_and_wait(self).await;
    }

    fn started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }
}

/// What happens to a parked transaction that leaves the failure cache without being revived.
fn eviction_handler(role: Arc<RoleState>) -> EvictHandler {
    Box::new(move |failure: NonceFailure| {
        let NonceFailure { item, error, .. } = failure;
        if let Some(err) = item.context_error() {
            item.respond(Err(err));
            return;
        }
        match role.forwarder() {
            Some(forwarder) => {
                tokio::spawn(async move {
                    let result = forwarder
                        .forward(&item.tx, item.options.as_ref())
                        .await
                        .map_err(SubmitError::from);
                    item.respond(result);
                });
            }
            None => item.respond(Err(error.into())),
        }
    })
}

async fn forward_all(
    forwarder: &TxForwarder,
    batch: &[QueueItem],
) -> Vec<Result<(), ForwarderError>> {
    join_all(
        batch
            .iter()
            .map(|item| forwarder.forward(&item.tx, item.options.as_ref())),
    )
    .await
}

fn respond_all(batch: Vec<QueueItem>, err: SubmitError) {
    for item in batch {
        item.respond(Err(err.clone()));
    }
}

fn is_shutdown(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow()
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default()
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
