// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use rollup_core::transaction::{ConditionalOptions, Transaction};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;

use super::{ForwarderConfig, ForwarderError, RpcConnector, TransactionPublisher, TxForwarder};
use crate::sequencer::SubmitError;

const CHOSEN_KEY: &str = "coordinator.chosen";
const PRIORITIES_KEY: &str = "coordinator.priorities";
const WANTS_LOCKOUT_KEY_PREFIX: &str = "coordinator.liveliness.";
const WANTS_LOCKOUT_VALUE: &str = "OK";

/// Source of truth for which sequencer currently holds the lockout.
#[async_trait]
pub trait SequencerCoordinator: Send + Sync {
    /// The chosen sequencer url, or an empty string when nobody holds the lockout.
    async fn current_chosen_sequencer(&self) -> Result<String, ForwarderError>;

    /// The highest-priority sequencer that is alive and wants the lockout.
    async fn recommend_sequencer_wanting_lockout(&self) -> Result<String, ForwarderError>;
}

pub struct RedisCoordinator {
    client: redis::Client,
    connection: Mutex<Option<redis::aio::ConnectionManager>>,
}

impl RedisCoordinator {
    pub fn new(url: &str) -> Result<Self, ForwarderError> {
        let client = redis::Client::open(url).map_err(coordinator_error)?;
        Ok(Self {
            client,
            connection: Mutex::new(None),
        })
    }

    async fn ensure_connection(
        &self,
    ) -> Result<tokio::sync::MutexGuard<'_, Option<redis::aio::ConnectionManager>>, redis::RedisError>
    {
        let mut guard = self.connection.lock().await;
        if guard.is_none() {
            *guard = Some(self.client.get_connection_manager().await?);
        }
        Ok(guard)
    }

    async fn get(&self, key: String) -> Result<Option<String>, ForwarderError> {
        let mut guard = self.ensure_connection().await.map_err(|err| {
            tracing::warn!("redis coordinator connection failed: {err}");
            coordinator_error(err)
        })?;
        let Some(conn) = guard.as_mut() else {
            return Err(ForwarderError::Coordinator {
                reason: "no redis connection".to_string(),
            });
        };
        let result: redis::RedisResult<Option<String>> = conn.get(key).await;
        result.map_err(|err| {
            tracing::warn!("redis coordinator get failed: {err}");
            *guard = None;
            coordinator_error(err)
        })
    }
}

#[async_trait]
impl SequencerCoordinator for RedisCoordinator {
    async fn current_chosen_sequencer(&self) -> Result<String, ForwarderError> {
        Ok(self.get(CHOSEN_KEY.to_string()).await?.unwrap_or_default())
    }

    async fn recommend_sequencer_wanting_lockout(&self) -> Result<String, ForwarderError> {
        let priorities = self
            .get(PRIORITIES_KEY.to_string())
            .await?
            .filter(|list| !list.is_empty())
            .ok_or_else(|| ForwarderError::Coordinator {
                reason: "sequencer priorities unset".to_string(),
            })?;
        for url in priorities.split(',') {
            let status = self.get(format!("{WANTS_LOCKOUT_KEY_PREFIX}{url}")).await?;
            if status.as_deref() == Some(WANTS_LOCKOUT_VALUE) {
                return Ok(url.to_string());
            }
        }
        Err(ForwarderError::Coordinator {
            reason: "no sequencer wanting lockout".to_string(),
        })
    }
}

fn coordinator_error(err: redis::RedisError) -> ForwarderError {
    ForwarderError::Coordinator {
        reason: err.to_string(),
    }
}

struct UpdateState {
    errors: u32,
    current_target: String,
}

/// Forwards to whichever sequencer the coordinator currently elects, falling back to a
/// static url when the coordinator cannot name one.
pub struct RedisTxForwarder {
    fallback_target: String,
    config: ForwarderConfig,
    connector: Arc<dyn RpcConnector>,
    coordinator: RwLock<Option<Arc<dyn SequencerCoordinator>>>,
    state: Mutex<UpdateState>,
    forwarder: RwLock<Option<Arc<TxForwarder>>>,
    shutdown: watch::Sender<bool>,
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl RedisTxForwarder {
    pub fn new(
        fallback_target: String,
        config: ForwarderConfig,
        connector: Arc<dyn RpcConnector>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            fallback_target,
            config,
            connector,
            coordinator: RwLock::new(None),
            state: Mutex::new(UpdateState {
                errors: 0,
                current_target: String::new(),
            }),
            forwarder: RwLock::new(None),
            shutdown,
            task: std::sync::Mutex::new(None),
        }
    }

    /// Uses `coordinator` instead of connecting to `redis_url` on initialize.
    pub fn with_coordinator(self, coordinator: Arc<dyn SequencerCoordinator>) -> Self {
        *self.coordinator.write().expect("coordinator lock poisoned") = Some(coordinator);
        self
    }

    pub fn current_forwarder(&self) -> Option<Arc<TxForwarder>> {
        self.forwarder.read().expect("forwarder lock poisoned").clone()
    }

    pub fn current_target(&self) -> Option<String> {
        self.current_forwarder()
            .map(|forwarder| forwarder.primary_target())
    }

    fn set_forwarder(&self, forwarder: Arc<TxForwarder>) {
        let mut slot = self.forwarder.write().expect("forwarder lock poisoned");
        if let Some(old) = slot.as_ref() {
            old.disable();
        }
        *slot = Some(forwarder);
    }

    fn coordinator(&self) -> Option<Arc<dyn SequencerCoordinator>> {
        self.coordinator
            .read()
            .expect("coordinator lock poisoned")
            .clone()
    }

    /// Re-resolves the target. Returns how long to wait before the next update.
    pub async fn update(&self) -> Duration {
        let mut state = self.state.lock().await;
        let mut backing_off = false;

        let mut url = match self.coordinator() {
            Some(coordinator) => {
                let mut resolved = coordinator.current_chosen_sequencer().await;
                if matches!(&resolved, Ok(url) if url.is_empty()) {
                    tracing::info!("no sequencer is currently chosen, using recommended sequencer instead");
                    resolved = coordinator.recommend_sequencer_wanting_lockout().await;
                }
                match resolved {
                    Ok(url) if !url.is_empty() => url,
                    resolved => {
                        let err = resolved.err();
                        if self.should_fallback_to_static(&state) && !self.fallback_target.is_empty() {
                            tracing::warn!(error = ?err, fallback = %self.fallback_target, "coordinator failed to find live sequencer, falling back to static url");
                            backing_off = true;
                            self.fallback_target.clone()
                        } else {
                            tracing::warn!(error = ?err, "coordinator failed to find live sequencer");
                            return self.retry_after_error(&mut state);
                        }
                    }
                }
            }
            None if !self.fallback_target.is_empty() => {
                tracing::warn!(fallback = %self.fallback_target, "redis coordinator not initialized, falling back to static url");
                self.fallback_target.clone()
            }
            None => {
                tracing::error!("redis coordinator not initialized, no fallback available");
                return self.retry_after_error(&mut state);
            }
        };

        if url != state.current_target {
            let forwarder = loop {
                let forwarder = Arc::new(TxForwarder::new(
                    vec![url.clone()],
                    self.config.clone(),
                    Arc::clone(&self.connector),
                ));
                match forwarder.connect() {
                    Ok(()) => break forwarder,
                    Err(err) => {
                        if self.should_fallback_to_static(&state) && url != self.fallback_target {
                            tracing::error!(error = %err, fallback = %self.fallback_target, "failed to initialize forwarder, falling back to static url");
                            url = self.fallback_target.clone();
                            backing_off = true;
                        } else {
                            tracing::error!(error = %err, "failed to initialize forwarder");
                            return self.retry_after_error(&mut state);
                        }
                    }
                }
            };
            tracing::info!(target = %url, "forwarding target changed");
            state.current_target = url;
            self.set_forwarder(forwarder);
        }

        if backing_off {
            self.retry_after_error(&mut state)
        } else {
            state.errors = 0;
            self.config.update_interval
        }
    }

    fn backoff(&self, errors: u32) -> Duration {
        let factor = 1u32.checked_shl(errors).unwrap_or(u32::MAX);
        self.config
            .retry_interval
            .saturating_mul(factor)
            .min(self.config.update_interval)
    }

    fn retry_after_error(&self, state: &mut UpdateState) -> Duration {
        state.errors = state.errors.saturating_add(1);
        self.backoff(state.errors - 1)
    }

    // True when there is nothing to lose, or when backoff is saturated and a different static
    // url is available.
    fn should_fallback_to_static(&self, state: &UpdateState) -> bool {
        state.current_target.is_empty()
            || (self.backoff(state.errors) >= self.config.update_interval
                && !self.fallback_target.is_empty()
                && self.fallback_target != state.current_target)
    }

    async fn run(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            let next = self.update().await;
            tokio::select! {
                _ = tokio::time::sleep(next) => {}
                _ = shutdown.changed() => return,
            }
        }
    }
}

#[async_trait]
impl TransactionPublisher for RedisTxForwarder {
    async fn publish_transaction(
        &self,
        tx: Transaction,
        options: Option<ConditionalOptions>,
    ) -> Result<(), SubmitError> {
        let Some(forwarder) = self.current_forwarder() else {
            return Err(ForwarderError::NoSequencer.into());
        };
        forwarder.publish_transaction(tx, options).await
    }

    async fn check_health(&self) -> Result<(), SubmitError> {
        let Some(forwarder) = self.current_forwarder() else {
            return Err(ForwarderError::NoSequencer.into());
        };
        forwarder.check_health().await
    }

    async fn initialize(&self) -> Result<(), SubmitError> {
        if self.coordinator().is_none() && !self.config.redis_url.is_empty() {
            let coordinator = RedisCoordinator::new(&self.config.redis_url)
                .map_err(SubmitError::from)?;
            *self.coordinator.write().expect("coordinator lock poisoned") =
                Some(Arc::new(coordinator));
        }
        self.update().await;
        Ok(())
    }

    fn start(self: Arc<Self>) -> Result<(), SubmitError> {
        let mut task = self.task.lock().expect("forwarder task mutex poisoned");
        if task.is_some() {
            return Err(ForwarderError::Coordinator {
                reason: "forwarder update task already started".to_string(),
            }
            .into());
        }
        *task = Some(tokio::spawn(Arc::clone(&self).run()));
        Ok(())
    }

    async fn stop_and_wait(&self) {
        self.shutdown.send_replace(true);
        let task = self.task.lock().expect("forwarder task mutex poisoned").take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                tracing::error!(error = %err, "forwarder update task failed");
            }
        }
        if let Some(forwarder) = self.current_forwarder() {
            forwarder.stop_and_wait().await;
        }
    }

    fn started(&self) -> bool {
        self.task
            .lock()
            .expect("forwarder task mutex poisoned")
            .is_some()
    }
}
