// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use alloy::eips::BlockNumberOrTag::Latest;
use alloy::providers::{DynProvider, Provider, ProviderBuilder};
use tokio::runtime::Builder;
use tokio::sync::watch;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct HeaderReaderConfig {
    /// RPC URL of a parent chain node.
    pub rpc_url: String,
    pub poll_interval: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum HeaderReaderError {
    #[error("provider/transport: {0}")]
    Provider(String),
}

/// The parts of a parent chain header the sequencer needs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParentChainHeader {
    pub number: u64,
    pub timestamp: u64,
}

impl ParentChainHeader {
    /// Newer timestamps win; at equal timestamps the higher block does.
    pub fn is_newer_than(&self, other: &Self) -> bool {
        self.timestamp > other.timestamp
            || (self.timestamp == other.timestamp && self.number > other.number)
    }
}

async fn latest_header(provider: &impl Provider) -> Result<ParentChainHeader, HeaderReaderError> {
    let block = provider
        .get_block(Latest.into())
        .await
        .map_err(|e| HeaderReaderError::Provider(e.to_string()))?
        .ok_or_else(|| HeaderReaderError::Provider("get_block returned None".to_string()))?;
    Ok(ParentChainHeader {
        number: block.header.number,
        timestamp: block.header.timestamp,
    })
}

/// Stops a running `HeaderReader` thread.
#[derive(Debug, Clone)]
pub struct HeaderReaderHandle {
    stop: Arc<AtomicBool>,
}

impl HeaderReaderHandle {
    pub fn request_shutdown(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

pub struct HeaderReader {
    config: HeaderReaderConfig,
    latest: watch::Sender<Option<ParentChainHeader>>,
    stop: Arc<AtomicBool>,
    // Connected on the first poll and reused; dropped only when connecting fails.
    provider: Option<DynProvider>,
    connections: u64,
}

impl HeaderReader {
    pub fn new(config: HeaderReaderConfig) -> Self {
        let (latest, _) = watch::channel(None);
        Self {
            config,
            latest,
            stop: Arc::new(AtomicBool::new(false)),
            provider: None,
            connections: 0,
        }
    }

    /// `None` until the first header has been read.
    pub fn subscribe(&self) -> watch::Receiver<Option<ParentChainHeader>> {
        self.latest.subscribe()
    }

    /// Polls on a dedicated thread with its own current-thread runtime, like the other
    /// parent-chain readers.
    pub fn run_blocking(self) -> HeaderReaderHandle {
        let handle = HeaderReaderHandle {
            stop: Arc::clone(&self.stop),
        };
        thread::spawn(move || {
            let rt = Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("header reader runtime");
            let mut reader = self;
            while !reader.stop.load(Ordering::Relaxed) {
                if let Err(e) = rt.block_on(reader.advance_once()) {
                    tracing::warn!(error = %e, "header reader poll failed, will retry");
                }
                thread::sleep(reader.config.poll_interval);
            }
        });
        handle
    }

    pub(crate) async fn advance_once(&mut self) -> Result<(), HeaderReaderError> {
        let provider = match self.provider.take() {
            Some(provider) => provider,
            None => {
                let provider = ProviderBuilder::new()
                    .connect(self.config.rpc_url.as_str())
                    .await
                    .map_err(|e| HeaderReaderError::Provider(e.to_string()))?
                    .erased();
                self.connections += 1;
                debug!(connections = self.connections, "connected to parent chain");
                provider
            }
        };
        let polled = latest_header(&provider).await;
        self.provider = Some(provider);
        let header = polled?;
        if self.publish(header) {
            debug!(
                number = header.number,
                timestamp = header.timestamp,
                "parent chain head"
            );
        }
        Ok(())
    }

    /// Returns whether `header` replaced the published one.
    pub(crate) fn publish(&self, header: ParentChainHeader) -> bool {
        self.latest.send_if_modified(|latest| match latest {
            Some(current) if !header.is_newer_than(current) => false,
            _ => {
                *latest = Some(header);
                true
            }
        })
    }
}
