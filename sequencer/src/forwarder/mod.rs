// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

//! Relaying transactions to a remote sequencer.
//!
//! `TxForwarder` tries an ordered list of endpoints. `RedisTxForwarder` keeps a single
//! `TxForwarder` pointed at whichever sequencer the coordination store elects.

mod redis;
mod rpc;
mod tx_forwarder;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rollup_core::transaction::{ConditionalOptions, Transaction};
use thiserror::Error;

use crate::sequencer::SubmitError;

pub use self::redis::{RedisCoordinator, RedisTxForwarder, SequencerCoordinator};
pub use rpc::{HttpConnector, HttpRpcClient, RpcConnector, SequencerRpc};
pub use tx_forwarder::TxForwarder;

pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_IDLE_CONNECTION_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_MAX_IDLE_CONNECTIONS: usize = 100;
pub const DEFAULT_UPDATE_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwarderConfig {
    // Zero disables the per-request deadline.
    pub connection_timeout: Duration,
    pub idle_connection_timeout: Duration,
    pub max_idle_connections: usize,
    pub redis_url: String,
    pub update_interval: Duration,
    pub retry_interval: Duration,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT,
            idle_connection_timeout: DEFAULT_IDLE_CONNECTION_TIMEOUT,
            max_idle_connections: DEFAULT_MAX_IDLE_CONNECTIONS,
            redis_url: String::new(),
            update_interval: DEFAULT_UPDATE_INTERVAL,
            retry_interval: DEFAULT_RETRY_INTERVAL,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ForwarderError {
    #[error("sequencer temporarily not available")]
    NoSequencer,
    #[error("{message}")]
    Rpc { code: i64, message: String },
    #[error("transport: {reason}")]
    Transport { reason: String },
    #[error("request timed out")]
    Timeout,
    #[error("failed to publish transaction to any of the forwarding targets")]
    AllTargetsFailed,
    #[error("missing forwarding target")]
    NoTarget,
    #[error("publishing transactions not supported by this endpoint")]
    Unsupported,
    #[error("coordinator: {reason}")]
    Coordinator { reason: String },
}

impl ForwarderError {
    /// Failures after which the next forwarding target is worth trying.
    pub fn is_try_next(&self) -> bool {
        matches!(self, Self::Transport { .. } | Self::Timeout)
    }
}

/// Something transactions can be submitted to: the local sequencer, a forwarder, or a
/// dropper.
#[async_trait]
pub trait TransactionPublisher: Send + Sync {
    async fn publish_transaction(
        &self,
        tx: Transaction,
        options: Option<ConditionalOptions>,
    ) -> Result<(), SubmitError>;

    async fn check_health(&self) -> Result<(), SubmitError>;

    async fn initialize(&self) -> Result<(), SubmitError>;

    fn start(self: Arc<Self>) -> Result<(), SubmitError>;

    async fn stop_and_wait(&self);

    fn started(&self) -> bool;
}

/// Rejects everything. Used by nodes that accept no transactions.
#[derive(Debug, Clone, Copy, Default)]
pub struct TxDropper;

#[async_trait]
impl TransactionPublisher for TxDropper {
    async fn publish_transaction(
        &self,
        _tx: Transaction,
        _options: Option<ConditionalOptions>,
    ) -> Result<(), SubmitError> {
        Err(ForwarderError::Unsupported.into())
    }

    async fn check_health(&self) -> Result<(), SubmitError> {
        Err(ForwarderError::Unsupported.into())
    }

    async fn initialize(&self) -> Result<(), SubmitError> {
        Ok(())
    }

    fn start(self: Arc<Self>) -> Result<(), SubmitError> {
        Ok(())
    }

    async fn stop_and_wait(&self) {}

    fn started(&self) -> bool {
        true
    }
}
