// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use alloy_primitives::{Address, B256, U256};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use rollup_core::application::LedgerStf;
use rollup_core::block::BlockHeader;
use rollup_core::transaction::{ConditionalOptions, LEGACY_TX_TYPE, Transaction, TxBody};
use rollup_sequencer::execution::{Blockchain, ExecutionEngine};
use rollup_sequencer::forwarder::{
    ForwarderConfig, ForwarderError, HttpConnector, RpcConnector, TransactionPublisher,
    TxForwarder,
};
use rollup_sequencer::sequencer::{Sequencer, SequencerConfig, SharedSequencerConfig};
use rollup_sequencer::storage::{SqliteMessageLog, Storage};
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy)]
enum Behavior {
    Accept,
    /// Answers every call with a JSON-RPC error.
    Reject,
    /// Answers every call with HTTP 500.
    Broken,
}

#[derive(Clone)]
struct NodeState {
    behavior: Behavior,
    calls: Arc<Mutex<Vec<String>>>,
}

struct FakeNode {
    addr: SocketAddr,
    calls: Arc<Mutex<Vec<String>>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    server_task: Option<JoinHandle<()>>,
}

impl FakeNode {
    fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls lock").clone()
    }
}

fn accepted_hash() -> B256 {
    B256::repeat_byte(0xab)
}

async fn handle_rpc(State(node): State<NodeState>, Json(request): Json<Value>) -> Response {
    let method = request["method"].as_str().unwrap_or_default().to_string();
    node.calls.lock().expect("calls lock").push(method.clone());
    let id = request["id"].clone();
    match node.behavior {
        Behavior::Broken => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
        Behavior::Reject => Json(json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": { "code": -32000, "message": "nonce too low" },
        }))
        .into_response(),
        Behavior::Accept => {
            let result = match method.as_str() {
                "arb_checkPublisherHealth" => Value::Null,
                _ => json!(accepted_hash().to_string()),
            };
            Json(json!({ "jsonrpc": "2.0", "id": id, "result": result })).into_response()
        }
    }
}

async fn start_node(behavior: Behavior) -> Option<FakeNode> {
    let listener = match tokio::net::TcpListener::bind("127.0.0.1:0").await {
        Ok(value) => value,
        Err(err) if err.kind() == ErrorKind::PermissionDenied => {
            eprintln!("skipping forwarder test: cannot bind test listener in this environment");
            return None;
        }
        Err(err) => panic!("bind test listener: {err}"),
    };
    let addr = listener.local_addr().expect("read listener addr");
    let calls = Arc::new(Mutex::new(Vec::new()));
    let app = Router::new().route("/", post(handle_rpc)).with_state(NodeState {
        behavior,
        calls: Arc::clone(&calls),
    });

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        let _ = shutdown_rx.await;
    });
    let server_task = tokio::spawn(async move {
        server.await.expect("run fake node");
    });
    Some(FakeNode {
        addr,
        calls,
        shutdown_tx: Some(shutdown_tx),
        server_task: Some(server_task),
    })
}

async fn shutdown_node(mut node: FakeNode) {
    if let Some(tx) = node.shutdown_tx.take() {
        let _ = tx.send(());
    }
    if let Some(task) = node.server_task.take() {
        tokio::time::timeout(Duration::from_secs(3), task)
            .await
            .expect("wait for fake node")
            .expect("join fake node");
    }
}

fn forwarder_config() -> ForwarderConfig {
    ForwarderConfig {
        connection_timeout: Duration::from_secs(2),
        ..ForwarderConfig::default()
    }
}

fn connected_forwarder(urls: Vec<String>) -> TxForwarder {
    let config = forwarder_config();
    let connector: Arc<dyn RpcConnector> = Arc::new(HttpConnector::new(config.clone()));
    let forwarder = TxForwarder::new(urls, config, connector);
    forwarder.connect().expect("connect forwarder");
    forwarder
}

fn open_sequencer(
    prefix: &str,
) -> (
    TempDir,
    Arc<ExecutionEngine<LedgerStf>>,
    Arc<Sequencer<LedgerStf>>,
) {
    let dir = tempfile::Builder::new()
        .prefix(prefix)
        .tempdir()
        .expect("create temporary test directory");
    let path = dir.path().join("sequencer.sqlite");
    let path = path.to_string_lossy();
    let chain = Blockchain::open(
        Storage::open(&path, "NORMAL").expect("open chain storage"),
        BlockHeader::genesis(0, 1),
    )
    .expect("open chain");
    let log = SqliteMessageLog::new(Storage::open(&path, "NORMAL").expect("open log storage"));
    let engine = Arc::new(ExecutionEngine::new(chain, LedgerStf::default(), Arc::new(log)));

    let config = SequencerConfig {
        max_block_speed: Duration::from_millis(10),
        forwarder: forwarder_config(),
        ..SequencerConfig::default()
    };
    let sequencer = Arc::new(Sequencer::new(
        Arc::clone(&engine),
        SharedSequencerConfig::new(config).expect("valid config"),
    ));
    engine.start();
    (dir, engine, sequencer)
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

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn fails_over_to_backup_when_primary_is_down() {
    let Some(primary) = start_node(Behavior::Broken).await else {
        return;
    };
    let Some(backup) = start_node(Behavior::Accept).await else {
        return;
    };
    let forwarder = connected_forwarder(vec![primary.url(), backup.url()]);
    assert_eq!(forwarder.primary_target(), primary.url());

    forwarder
        .forward(&transfer(0x11, 0), None)
        .await
        .expect("backup accepts");
    assert_eq!(primary.calls(), vec!["eth_sendRawTransaction"]);
    assert_eq!(backup.calls(), vec!["eth_sendRawTransaction"]);

    let options = ConditionalOptions {
        block_number_max: Some(100),
        ..ConditionalOptions::default()
    };
    forwarder
        .forward(&transfer(0x11, 1), Some(&options))
        .await
        .expect("backup accepts conditional");
    assert_eq!(
        backup.calls().last().map(String::as_str),
        Some("eth_sendRawTransactionConditional")
    );

    shutdown_node(primary).await;
    shutdown_node(backup).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rpc_error_is_final_and_not_retried_on_backup() {
    let Some(primary) = start_node(Behavior::Reject).await else {
        return;
    };
    let Some(backup) = start_node(Behavior::Accept).await else {
        return;
    };
    let forwarder = connected_forwarder(vec![primary.url(), backup.url()]);

    let err = forwarder
        .forward(&transfer(0x12, 0), None)
        .await
        .expect_err("primary rejects");
    assert_eq!(
        err,
        ForwarderError::Rpc {
            code: -32000,
            message: "nonce too low".to_string(),
        }
    );
    assert_eq!(err.to_string(), "nonce too low");
    assert!(backup.calls().is_empty());

    shutdown_node(primary).await;
    shutdown_node(backup).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reports_when_every_target_is_down() {
    let Some(first) = start_node(Behavior::Broken).await else {
        return;
    };
    let Some(second) = start_node(Behavior::Broken).await else {
        return;
    };
    let forwarder = connected_forwarder(vec![first.url(), second.url()]);

    let err = forwarder
        .forward(&transfer(0x13, 0), None)
        .await
        .expect_err("nobody accepts");
    assert_eq!(err, ForwarderError::AllTargetsFailed);
    assert_eq!(
        err.to_string(),
        "failed to publish transaction to any of the forwarding targets"
    );

    let health = forwarder.health().await;
    assert!(matches!(health, Err(ForwarderError::Transport { .. })));

    forwarder.disable();
    assert_eq!(
        forwarder.forward(&transfer(0x13, 0), None).await,
        Err(ForwarderError::NoSequencer)
    );

    shutdown_node(first).await;
    shutdown_node(second).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn health_checks_the_primary_publisher() {
    let Some(node) = start_node(Behavior::Accept).await else {
        return;
    };
    let forwarder = connected_forwarder(vec![node.url()]);

    forwarder.health().await.expect("healthy");
    forwarder.health().await.expect("cached");
    assert_eq!(node.calls(), vec!["arb_checkPublisherHealth"]);

    shutdown_node(node).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn forwarding_sequencer_publishes_over_http() {
    let Some(node) = start_node(Behavior::Accept).await else {
        return;
    };
    let (_dir, engine, sequencer) = open_sequencer("forwarder-sequencer-");
    Sequencer::start(&sequencer).expect("start sequencer");
    sequencer.forward_to(&node.url()).expect("forward target");

    sequencer
        .publish_transaction(transfer(0x14, 0), None)
        .await
        .expect("forwarded");
    sequencer.check_health().await.expect("remote publisher healthy");
    assert_eq!(
        node.calls(),
        vec!["eth_sendRawTransaction", "arb_checkPublisherHealth"]
    );
    assert_eq!(engine.current_header().number, 0);

    tokio::time::timeout(Duration::from_secs(3), sequencer.stop_and_wait())
        .await
        .expect("sequencer stops in time");
    shutdown_node(node).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sequencer_keeps_serving_after_start_through_the_publisher_trait() {
    let (_dir, engine, sequencer) = open_sequencer("publisher-sequencer-");
    // Same startup order as the node binary: the handle stays usable after start.
    Sequencer::start(&sequencer).expect("start sequencer");
    sequencer.activate();

    let publisher: Arc<dyn TransactionPublisher> = sequencer.clone();
    assert!(publisher.started());
    publisher.check_health().await.expect("active and healthy");
    publisher
        .publish_transaction(transfer(0x15, 0), None)
        .await
        .expect("sequenced");
    assert_eq!(engine.current_header().number, 1);

    tokio::time::timeout(Duration::from_secs(3), publisher.stop_and_wait())
        .await
        .expect("sequencer stops in time");
    assert!(!engine.commit_lock_held());
}
