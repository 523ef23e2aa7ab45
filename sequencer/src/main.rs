// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use std::sync::Arc;
use std::time::Duration;

use rollup_core::application::{LedgerConfig, LedgerStf};
use rollup_core::block::BlockHeader;
use tracing_subscriber::EnvFilter;

use rollup_sequencer::execution::{Blockchain, DEFAULT_RETAINED_BLOCKS, ExecutionEngine};
use rollup_sequencer::forwarder::{
    DEFAULT_CONNECTION_TIMEOUT, DEFAULT_IDLE_CONNECTION_TIMEOUT, DEFAULT_MAX_IDLE_CONNECTIONS,
    DEFAULT_RETRY_INTERVAL, DEFAULT_UPDATE_INTERVAL, ForwarderConfig, HttpConnector,
    RedisTxForwarder, TransactionPublisher, TxDropper, TxForwarder,
};
use rollup_sequencer::l1_reader::{HeaderReader, HeaderReaderConfig};
use rollup_sequencer::sequencer::{
    DEFAULT_MAX_ACCEPTABLE_TIMESTAMP_DELTA, DEFAULT_MAX_BLOCK_SPEED, DEFAULT_MAX_REVERT_GAS_REJECT,
    DEFAULT_MAX_TX_DATA_SIZE, DEFAULT_NONCE_CACHE_SIZE, DEFAULT_NONCE_FAILURE_CACHE_EXPIRY,
    DEFAULT_NONCE_FAILURE_CACHE_SIZE, DEFAULT_QUEUE_SIZE, DEFAULT_QUEUE_TIMEOUT, Sequencer,
    SequencerConfig, SharedSequencerConfig,
};
use rollup_sequencer::storage::{SqliteMessageLog, Storage};

const DEFAULT_DB_PATH: &str = "sequencer.db";
const DEFAULT_SQLITE_SYNCHRONOUS: &str = "NORMAL";
const DEFAULT_GENESIS_BLOCK: u64 = 0;
const DEFAULT_L1_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env();
    let shared_config = SharedSequencerConfig::new(config.sequencer.clone())?;

    let chain_storage = Storage::open(&config.db_path, &config.sqlite_synchronous)?;
    let chain = Blockchain::open_retaining(
        chain_storage,
        BlockHeader::genesis(config.genesis_block, 0),
        config.retained_blocks,
    )?;
    let log_storage = Storage::open(&config.db_path, &config.sqlite_synchronous)?;
    let consensus = Arc::new(SqliteMessageLog::new(log_storage));

    let engine = Arc::new(ExecutionEngine::new(
        chain,
        LedgerStf::new(LedgerConfig {
            block_gas_limit: config.block_gas_limit,
        }),
        consensus,
    ));
    let replayed = engine.catch_up().await?;
    tracing::info!(
        replayed,
        head = engine.current_header().number,
        "execution engine caught up"
    );

    if !config.sequencer_enabled {
        return run_follower(&config).await;
    }

    let mut sequencer = Sequencer::new(Arc::clone(&engine), shared_config);
    engine.start();

    let mut header_reader = None;
    if let Some(reader_config) = config.header_reader.clone() {
        let rpc_url = reader_config.rpc_url.clone();
        let reader = HeaderReader::new(reader_config);
        sequencer = sequencer.with_parent_chain(reader.subscribe());
        header_reader = Some(reader.run_blocking());
        tracing::info!("header reader started (parent chain: {rpc_url})");
    }
    let sequencer = Arc::new(sequencer);

    sequencer.initialize().await?;
    Sequencer::start(&sequencer)?;
    match config.forward_to.as_deref() {
        Some(url) => sequencer.forward_to(url)?,
        None if config.start_paused => tracing::info!("sequencer starting paused"),
        None => sequencer.activate(),
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested");
    sequencer.stop_and_wait().await;
    if let Some(handle) = header_reader {
        handle.request_shutdown();
    }
    Ok(())
}

/// A node that does not sequence relays to the elected sequencer, to static targets, or
/// nowhere.
async fn run_follower(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let forwarder_config = config.sequencer.forwarder.clone();
    let connector = Arc::new(HttpConnector::new(forwarder_config.clone()));
    let targets: Vec<String> = config
        .forward_to
        .as_deref()
        .unwrap_or_default()
        .split(',')
        .map(|url| url.trim().to_string())
        .filter(|url| !url.is_empty())
        .collect();

    let publisher: Arc<dyn TransactionPublisher> = if !forwarder_config.redis_url.is_empty() {
        let fallback = targets.first().cloned().unwrap_or_default();
        tracing::info!(fallback = %fallback, "forwarding to the redis-elected sequencer");
        Arc::new(RedisTxForwarder::new(fallback, forwarder_config, connector))
    } else if !targets.is_empty() {
        tracing::info!(targets = ?targets, "forwarding to static targets");
        Arc::new(TxForwarder::new(targets, forwarder_config, connector))
    } else {
        tracing::info!("no forwarding target, dropping transactions");
        Arc::new(TxDropper)
    };

    publisher.initialize().await?;
    Arc::clone(&publisher).start()?;
    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested");
    publisher.stop_and_wait().await;
    Ok(())
}

struct Config {
    db_path: String,
    sqlite_synchronous: String,
    genesis_block: u64,
    /// Blocks held in memory; older ones are read back from SQLite.
    retained_blocks: usize,
    block_gas_limit: u64,
    sequencer_enabled: bool,
    forward_to: Option<String>,
    start_paused: bool,
    /// Parent chain polling, enabled by `SEQ_L1_RPC_URL`.
    header_reader: Option<HeaderReaderConfig>,
    sequencer: SequencerConfig,
}

impl Config {
    fn from_env() -> Self {
        Self {
            db_path: env_string("SEQ_DB_PATH", DEFAULT_DB_PATH),
            sqlite_synchronous: env_string("SEQ_SQLITE_SYNCHRONOUS", DEFAULT_SQLITE_SYNCHRONOUS),
            genesis_block: env_u64("SEQ_GENESIS_BLOCK", DEFAULT_GENESIS_BLOCK),
            retained_blocks: env_usize("SEQ_RETAINED_BLOCKS", DEFAULT_RETAINED_BLOCKS),
            block_gas_limit: env_u64(
                "SEQ_BLOCK_GAS_LIMIT",
                LedgerConfig::default().block_gas_limit,
            ),
            sequencer_enabled: env_bool("SEQ_SEQUENCER_ENABLED", true),
            forward_to: std::env::var("SEQ_FORWARD_TO")
                .ok()
                .filter(|url| !url.is_empty()),
            start_paused: env_bool("SEQ_START_PAUSED", false),
            header_reader: std::env::var("SEQ_L1_RPC_URL")
                .ok()
                .filter(|url| !url.is_empty())
                .map(|rpc_url| HeaderReaderConfig {
                    rpc_url,
                    poll_interval: env_millis("SEQ_L1_POLL_INTERVAL_MS", DEFAULT_L1_POLL_INTERVAL)
                        .max(Duration::from_millis(1)),
                }),
            sequencer: Config::sequencer_from_env(),
        }
    }

    fn sequencer_from_env() -> SequencerConfig {
        SequencerConfig {
            max_block_speed: env_millis("SEQ_MAX_BLOCK_SPEED_MS", DEFAULT_MAX_BLOCK_SPEED),
            max_revert_gas_reject: env_u64(
                "SEQ_MAX_REVERT_GAS_REJECT",
                DEFAULT_MAX_REVERT_GAS_REJECT,
            ),
            max_acceptable_timestamp_delta: env_millis(
                "SEQ_MAX_ACCEPTABLE_TIMESTAMP_DELTA_MS",
                DEFAULT_MAX_ACCEPTABLE_TIMESTAMP_DELTA,
            ),
            sender_whitelist: env_string("SEQ_SENDER_WHITELIST", "")
                .split(',')
                .map(|entry| entry.trim().to_string())
                .filter(|entry| !entry.is_empty())
                .collect(),
            queue_size: env_usize("SEQ_QUEUE_SIZE", DEFAULT_QUEUE_SIZE),
            queue_timeout: env_millis("SEQ_QUEUE_TIMEOUT_MS", DEFAULT_QUEUE_TIMEOUT),
            nonce_cache_size: env_usize("SEQ_NONCE_CACHE_SIZE", DEFAULT_NONCE_CACHE_SIZE),
            max_tx_data_size: env_usize("SEQ_MAX_TX_DATA_SIZE", DEFAULT_MAX_TX_DATA_SIZE),
            nonce_failure_cache_size: env_usize(
                "SEQ_NONCE_FAILURE_CACHE_SIZE",
                DEFAULT_NONCE_FAILURE_CACHE_SIZE,
            ),
            nonce_failure_cache_expiry: env_millis(
                "SEQ_NONCE_FAILURE_CACHE_EXPIRY_MS",
                DEFAULT_NONCE_FAILURE_CACHE_EXPIRY,
            ),
            enable_profiling: env_bool("SEQ_ENABLE_PROFILING", false),
            forwarder: ForwarderConfig {
                connection_timeout: env_millis(
                    "SEQ_FORWARDER_CONNECTION_TIMEOUT_MS",
                    DEFAULT_CONNECTION_TIMEOUT,
                ),
                idle_connection_timeout: env_millis(
                    "SEQ_FORWARDER_IDLE_CONNECTION_TIMEOUT_MS",
                    DEFAULT_IDLE_CONNECTION_TIMEOUT,
                ),
                max_idle_connections: env_usize(
                    "SEQ_FORWARDER_MAX_IDLE_CONNECTIONS",
                    DEFAULT_MAX_IDLE_CONNECTIONS,
                ),
                redis_url: env_string("SEQ_FORWARDER_REDIS_URL", ""),
                update_interval: env_millis(
                    "SEQ_FORWARDER_UPDATE_INTERVAL_MS",
                    DEFAULT_UPDATE_INTERVAL,
                ),
                retry_interval: env_millis(
                    "SEQ_FORWARDER_RETRY_INTERVAL_MS",
                    DEFAULT_RETRY_INTERVAL,
                ),
            },
        }
    }
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

fn env_millis(key: &str, default: Duration) -> Duration {
    Duration::from_millis(env_u64(key, default.as_millis() as u64))
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(value.trim(), "1" | "true" | "TRUE" | "yes"),
        Err(_) => default,
    }
}
