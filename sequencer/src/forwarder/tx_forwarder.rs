// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rollup_core::transaction::{ConditionalOptions, Transaction};

use super::{ForwarderConfig, ForwarderError, RpcConnector, SequencerRpc, TransactionPublisher};
use crate::sequencer::SubmitError;

const HEALTH_CACHE_TTL: Duration = Duration::from_secs(2);
const MAX_HEALTH_TIMEOUT: Duration = Duration::from_secs(10);

struct Target {
    url: String,
    rpc: Arc<dyn SequencerRpc>,
}

struct HealthCache {
    checked_at: Option<Instant>,
    result: Result<(), ForwarderError>,
}

/// Publishes to the first reachable target out of an ordered list.
pub struct TxForwarder {
    urls: Vec<String>,
    config: ForwarderConfig,
    connector: Arc<dyn RpcConnector>,
    enabled: AtomicBool,
    targets: std::sync::RwLock<Vec<Target>>,
    health: tokio::sync::Mutex<HealthCache>,
}

impl TxForwarder {
    pub fn new(urls: Vec<String>, config: ForwarderConfig, connector: Arc<dyn RpcConnector>) -> Self {
        Self {
            urls,
            config,
            connector,
            enabled: AtomicBool::new(false),
            targets: std::sync::RwLock::new(Vec::new()),
            health: tokio::sync::Mutex::new(HealthCache {
                checked_at: None,
                result: Ok(()),
            }),
        }
    }

    /// Builds a client per non-empty target. Enabled if at least one succeeds.
    pub fn connect(&self) -> Result<(), ForwarderError> {
        let mut targets = Vec::with_capacity(self.urls.len());
        let mut last_error = None;
        for url in self.urls.iter().filter(|url| !url.is_empty()) {
            match self.connector.connect(url) {
                Ok(rpc) => targets.push(Target {
                    url: url.clone(),
                    rpc,
                }),
                Err(err) => {
                    tracing::warn!(target = %url, error = %err, "cannot initialize forwarding client");
                    last_error = Some(err);
                }
            }
        }

        if targets.is_empty() {
            return Err(last_error.unwrap_or(ForwarderError::NoTarget));
        }
        *self.targets.write().expect("forwarder targets lock poisoned") = targets;
        self.enabled.store(true, Ordering::Release);
        Ok(())
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Release);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn primary_target(&self) -> String {
        self.targets
            .read()
            .expect("forwarder targets lock poisoned")
            .first()
            .map(|target| target.url.clone())
            .unwrap_or_default()
    }

    pub async fn forward(
        &self,
        tx: &Transaction,
        options: Option<&ConditionalOptions>,
    ) -> Result<(), ForwarderError> {
        if !self.is_enabled() {
            return Err(ForwarderError::NoSequencer);
        }
        let targets: Vec<(String, Arc<dyn SequencerRpc>)> = self
            .targets
            .read()
            .expect("forwarder targets lock poisoned")
            .iter()
            .map(|target| (target.url.clone(), Arc::clone(&target.rpc)))
            .collect();
        if targets.is_empty() {
            return Err(ForwarderError::NoSequencer);
        }

        for (url, rpc) in targets {
            let result = match options {
                None => rpc.send_raw_transaction(tx).await,
                Some(options) => rpc.send_raw_transaction_conditional(tx, options).await,
            };
            match result {
                Ok(_) => return Ok(()),
                Err(err) if err.is_try_next() => {
                    tracing::warn!(target = %url, error = %err, "error forwarding transaction to a backup target");
                }
                Err(err) => return Err(err),
            }
        }
        Err(ForwarderError::AllTargetsFailed)
    }

    /// Health of the primary target, cached for a short while.
    pub async fn health(&self) -> Result<(), ForwarderError> {
        let primary = {
            let targets = self.targets.read().expect("forwarder targets lock poisoned");
            targets.first().map(|target| Arc::clone(&target.rpc))
        };
        let Some(primary) = primary.filter(|_| self.is_enabled()) else {
            return Err(ForwarderError::NoSequencer);
        };

        let mut cache = self.health.lock().await;
        let fresh = cache
            .checked_at
            .is_some_and(|at| at.elapsed() <= HEALTH_CACHE_TTL);
        if !fresh {
            cache.result = primary.check_publisher_health(self.health_timeout()).await;
            cache.checked_at = Some(Instant::now());
        }
        cache.result.clone()
    }

    fn health_timeout(&self) -> Duration {
        let timeout = self.config.connection_timeout;
        if timeout.is_zero() || timeout >= MAX_HEALTH_TIMEOUT {
            MAX_HEALTH_TIMEOUT
        } else {
            timeout
        }
    }
}

#[async_trait]
impl TransactionPublisher for TxForwarder {
    async fn publish_transaction(
        &self,
        tx: Transaction,
        options: Option<ConditionalOptions>,
    ) -> Result<(), SubmitError> {
        self.forward(&tx, options.as_ref()).await.map_err(Into::into)
    }

    async fn check_health(&self) -> Result<(), SubmitError> {
        self.health().await.map_err(Into::into)
    }

    async fn initialize(&self) -> Result<(), SubmitError> {
        self.connect().map_err(Into::into)
    }

    fn start(self: Arc<Self>) -> Result<(), SubmitError> {
        Ok(())
    }

    async fn stop_and_wait(&self) {
        self.disable();
    }

    fn started(&self) -> bool {
        true
    }
}
