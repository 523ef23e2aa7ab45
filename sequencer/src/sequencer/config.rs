// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use alloy_primitives::{Address, hex};
use rollup_core::message::MAX_L2_MESSAGE_SIZE;

use super::SequencerConfigError;
use crate::forwarder::ForwarderConfig;

pub const DEFAULT_MAX_BLOCK_SPEED: Duration = Duration::from_millis(250);
pub const DEFAULT_MAX_REVERT_GAS_REJECT: u64 = 0;
pub const DEFAULT_MAX_ACCEPTABLE_TIMESTAMP_DELTA: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_QUEUE_SIZE: usize = 1024;
pub const DEFAULT_QUEUE_TIMEOUT: Duration = Duration::from_secs(12);
pub const DEFAULT_NONCE_CACHE_SIZE: usize = 1024;
pub const DEFAULT_MAX_TX_DATA_SIZE: usize = 95_000;
pub const DEFAULT_NONCE_FAILURE_CACHE_SIZE: usize = 1024;
pub const DEFAULT_NONCE_FAILURE_CACHE_EXPIRY: Duration = Duration::from_secs(1);
// Room left in a message for the batch framing around the transactions.
const MESSAGE_OVERHEAD_RESERVE: usize = 50_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequencerConfig {
    pub max_block_speed: Duration,
    // Zero disables the filter.
    pub max_revert_gas_reject: u64,
    pub max_acceptable_timestamp_delta: Duration,
    pub sender_whitelist: Vec<String>,
    pub queue_size: usize,
    // Zero means no queue deadline.
    pub queue_timeout: Duration,
    pub nonce_cache_size: usize,
    pub max_tx_data_size: usize,
    pub nonce_failure_cache_size: usize,
    pub nonce_failure_cache_expiry: Duration,
    pub enable_profiling: bool,
    pub forwarder: ForwarderConfig,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            max_block_speed: DEFAULT_MAX_BLOCK_SPEED,
            max_revert_gas_reject: DEFAULT_MAX_REVERT_GAS_REJECT,
            max_acceptable_timestamp_delta: DEFAULT_MAX_ACCEPTABLE_TIMESTAMP_DELTA,
            sender_whitelist: Vec::new(),
            queue_size: DEFAULT_QUEUE_SIZE,
            queue_timeout: DEFAULT_QUEUE_TIMEOUT,
            nonce_cache_size: DEFAULT_NONCE_CACHE_SIZE,
            max_tx_data_size: DEFAULT_MAX_TX_DATA_SIZE,
            nonce_failure_cache_size: DEFAULT_NONCE_FAILURE_CACHE_SIZE,
            nonce_failure_cache_expiry: DEFAULT_NONCE_FAILURE_CACHE_EXPIRY,
            enable_profiling: false,
            forwarder: ForwarderConfig::default(),
        }
    }
}

impl SequencerConfig {
    pub fn validate(&self) -> Result<(), SequencerConfigError> {
        self.parse_whitelist()?;
        let limit = MAX_L2_MESSAGE_SIZE - MESSAGE_OVERHEAD_RESERVE;
        if self.max_tx_data_size > limit {
            return Err(SequencerConfigError::MaxTxDataSizeTooLarge {
                size: self.max_tx_data_size,
                limit,
            });
        }
        if self.queue_size == 0 {
            return Err(SequencerConfigError::ZeroQueueSize);
        }
        Ok(())
    }

    /// Empty entries are skipped.
    pub fn parse_whitelist(&self) -> Result<HashSet<Address>, SequencerConfigError> {
        self.sender_whitelist
            .iter()
            .filter(|entry| !entry.is_empty())
            .map(|entry| parse_address(entry))
            .collect()
    }
}

fn parse_address(entry: &str) -> Result<Address, SequencerConfigError> {
    let invalid = || SequencerConfigError::InvalidWhitelistEntry {
        entry: entry.to_string(),
    };
    if !entry.starts_with("0x") {
        return Err(invalid());
    }
    let bytes = hex::decode(entry).map_err(|_| invalid())?;
    if bytes.len() != 20 {
        return Err(invalid());
    }
    Ok(Address::from_slice(&bytes))
}

struct Loaded {
    config: Arc<SequencerConfig>,
    whitelist: Arc<HashSet<Address>>,
}

/// Hot-reloadable sequencer configuration. Readers always see a validated snapshot.
#[derive(Clone)]
pub struct SharedSequencerConfig {
    inner: Arc<RwLock<Loaded>>,
}

impl SharedSequencerConfig {
    pub fn new(config: SequencerConfig) -> Result<Self, SequencerConfigError> {
        let loaded = load(config)?;
        Ok(Self {
            inner: Arc::new(RwLock::new(loaded)),
        })
    }

    pub fn get(&self) -> Arc<SequencerConfig> {
        Arc::clone(&self.read().config)
    }

    pub fn whitelist(&self) -> Arc<HashSet<Address>> {
        Arc::clone(&self.read().whitelist)
    }

    /// Replaces the configuration. An invalid one is rejected and the old one kept.
    pub fn update(&self, config: SequencerConfig) -> Result<(), SequencerConfigError> {
        let loaded = load(config)?;
        *self.inner.write().expect("sequencer config lock poisoned") = loaded;
        Ok(())
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Loaded> {
        self.inner.read().expect("sequencer config lock poisoned")
    }
}

fn load(config: SequencerConfig) -> Result<Loaded, SequencerConfigError> {
    config.validate()?;
    let whitelist = config.parse_whitelist()?;
    Ok(Loaded {
        config: Arc::new(config),
        whitelist: Arc::new(whitelist),
    })
}
