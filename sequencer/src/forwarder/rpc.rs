// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use alloy_primitives::{B256, hex};
use async_trait::async_trait;
use rollup_core::transaction::{ConditionalOptions, Transaction};
use serde::Deserialize;
use serde_json::{Value, json};

use super::{ForwarderConfig, ForwarderError};

/// The slice of a remote sequencer's JSON-RPC surface the forwarder uses.
#[async_trait]
pub trait SequencerRpc: Send + Sync {
    async fn send_raw_transaction(&self, tx: &Transaction) -> Result<B256, ForwarderError>;

    async fn send_raw_transaction_conditional(
        &self,
        tx: &Transaction,
        options: &ConditionalOptions,
    ) -> Result<B256, ForwarderError>;

    async fn check_publisher_health(&self, timeout: Duration) -> Result<(), ForwarderError>;
}

pub trait RpcConnector: Send + Sync {
    fn connect(&self, url: &str) -> Result<Arc<dyn SequencerRpc>, ForwarderError>;
}

/// Builds pooled `reqwest` clients sized by `ForwarderConfig`.
#[derive(Debug, Clone)]
pub struct HttpConnector {
    config: ForwarderConfig,
}

impl HttpConnector {
    pub fn new(config: ForwarderConfig) -> Self {
        Self { config }
    }
}

impl RpcConnector for HttpConnector {
    fn connect(&self, url: &str) -> Result<Arc<dyn SequencerRpc>, ForwarderError> {
        let client = HttpRpcClient::new(url, &self.config)?;
        Ok(Arc::new(client))
    }
}

pub struct HttpRpcClient {
    client: reqwest::Client,
    url: reqwest::Url,
    next_id: AtomicU64,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorObject>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

impl HttpRpcClient {
    pub fn new(url: &str, config: &ForwarderConfig) -> Result<Self, ForwarderError> {
        let url = reqwest::Url::parse(url).map_err(|err| ForwarderError::Transport {
            reason: format!("invalid url {url}: {err}"),
        })?;
        let mut builder = reqwest::Client::builder()
            .pool_idle_timeout(config.idle_connection_timeout)
            .pool_max_idle_per_host(config.max_idle_connections);
        if !config.connection_timeout.is_zero() {
            builder = builder.timeout(config.connection_timeout);
        }
        let client = builder.build().map_err(transport_error)?;
        Ok(Self {
            client,
            url,
            next_id: AtomicU64::new(1),
        })
    }

    async fn call(
        &self,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, ForwarderError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        let mut request = self.client.post(self.url.clone()).json(&body);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }

        let response = request.send().await.map_err(transport_error)?;
        let status = response.status();
        if !status.is_success() {
            return Err(ForwarderError::Transport {
                reason: format!("http status {status}"),
            });
        }
        let decoded: RpcResponse = response.json().await.map_err(transport_error)?;
        if let Some(error) = decoded.error {
            return Err(ForwarderError::Rpc {
                code: error.code,
                message: error.message,
            });
        }
        Ok(decoded.result.unwrap_or(Value::Null))
    }
}

#[async_trait]
impl SequencerRpc for HttpRpcClient {
    async fn send_raw_transaction(&self, tx: &Transaction) -> Result<B256, ForwarderError> {
        let result = self
            .call(
                "eth_sendRawTransaction",
                json!([hex::encode_prefixed(tx.encoded())]),
                None,
            )
            .await?;
        decode_hash(result)
    }

    async fn send_raw_transaction_conditional(
        &self,
        tx: &Transaction,
        options: &ConditionalOptions,
    ) -> Result<B256, ForwarderError> {
        let result = self
            .call(
                "eth_sendRawTransactionConditional",
                json!([hex::encode_prefixed(tx.encoded()), options]),
                None,
            )
            .await?;
        decode_hash(result)
    }

    async fn check_publisher_health(&self, timeout: Duration) -> Result<(), ForwarderError> {
        self.call("arb_checkPublisherHealth", json!([]), Some(timeout))
            .await
            .map(|_| ())
    }
}

fn decode_hash(value: Value) -> Result<B256, ForwarderError> {
    serde_json::from_value(value).map_err(|err| ForwarderError::Transport {
        reason: format!("cannot decode transaction hash: {err}"),
    })
}

fn transport_error(err: reqwest::Error) -> ForwarderError {
    if err.is_timeout() {
        ForwarderError::Timeout
    } else {
        ForwarderError::Transport {
            reason: err.to_string(),
        }
    }
}
