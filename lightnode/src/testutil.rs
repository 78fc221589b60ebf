// Copyright (c) Lightnode, Inc.
// SPDX-License-Identifier: Apache-2.0

//! In-process mock darknodes for tests: a real axum server on an ephemeral
//! port speaking the JSON-RPC surface, with canned responses, per-node
//! delays and a hit counter.

use crate::chain::{Blockchain, BurnEvent, BurnLogFetcher, ChainHead, HostChainClient};
use crate::error::{LightnodeError, LightnodeResult};
use crate::jsonrpc::{Request, Response, ResponseQueryPeers, ERR_INTERNAL};
use crate::registry::{format_peer, PeerId};
use crate::tx::{Chain, Selector, TxInput};
use async_trait::async_trait;
use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, TransactionRequest, H256};
use ethers::utils::keccak256;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

struct MockState {
    peers: RwLock<Vec<String>>,
    results: RwLock<HashMap<String, Value>>,
    errors: RwLock<HashSet<String>>,
    delay: RwLock<Duration>,
    hits: AtomicUsize,
}

pub struct MockDarknode {
    id: PeerId,
    addr: SocketAddr,
    state: Arc<MockState>,
}

impl MockDarknode {
    pub async fn start() -> Self {
        let state = Arc::new(MockState {
            peers: RwLock::new(Vec::new()),
            results: RwLock::new(HashMap::new()),
            errors: RwLock::new(HashSet::new()),
            delay: RwLock::new(Duration::ZERO),
            hits: AtomicUsize::new(0),
        });

        let app = Router::new()
            .route("/", post(handle))
            .with_state(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock darknode");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Self {
            id: PeerId::derive(&addr.to_string()),
            addr,
            state,
        }
    }

    pub async fn cluster(n: usize) -> Vec<Self> {
        let mut nodes = Vec::with_capacity(n);
        for _ in 0..n {
            nodes.push(Self::start().await);
        }
        nodes
    }

    pub fn addr(&self) -> String {
        self.addr.to_string()
    }

    /// `hexid@host:port`, the form peers travel as on the wire.
    pub fn endpoint(&self) -> String {
        format_peer(self.id, &self.addr.to_string())
    }

    pub async fn set_peers(&self, peers: Vec<String>) {
        *self.state.peers.write().await = peers;
    }

    pub async fn set_result(&self, method: &str, result: Value) {
        self.state
            .results
            .write()
            .await
            .insert(method.to_string(), result);
    }

    pub async fn set_error(&self, method: &str) {
        self.state.errors.write().await.insert(method.to_string());
    }

    pub async fn set_delay(&self, delay: Duration) {
        *self.state.delay.write().await = delay;
    }

    pub fn hits(&self) -> usize {
        self.state.hits.load(Ordering::SeqCst)
    }
}

async fn handle(
    State(state): State<Arc<MockState>>,
    Json(request): Json<Request>,
) -> Json<Response> {
    let delay = *state.delay.read().await;
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
    state.hits.fetch_add(1, Ordering::SeqCst);

    if state.errors.read().await.contains(&request.method) {
        return Json(Response::err(request.id, ERR_INTERNAL, "mock error"));
    }

    if request.method == "queryPeers" {
        let peers = state.peers.read().await.clone();
        let body = serde_json::to_value(ResponseQueryPeers { peers }).expect("serialize peers");
        return Json(Response::ok(request.id, body));
    }

    if let Some(result) = state.results.read().await.get(&request.method) {
        return Json(Response::ok(request.id, result.clone()));
    }

    Json(Response::err(request.id, ERR_INTERNAL, "no canned response"))
}

/// Blockchain fake: configurable funding validity and per-txid confirmation
/// counts.
pub struct FakeBlockchain {
    utxo_valid: AtomicBool,
    confirmations: RwLock<HashMap<Vec<u8>, u64>>,
}

impl FakeBlockchain {
    pub fn new() -> Self {
        Self {
            utxo_valid: AtomicBool::new(true),
            confirmations: RwLock::new(HashMap::new()),
        }
    }

    pub fn set_utxo_valid(&self, valid: bool) {
        self.utxo_valid.store(valid, Ordering::SeqCst);
    }

    pub async fn set_confirmations(&self, txid: Vec<u8>, count: u64) {
        self.confirmations.write().await.insert(txid, count);
    }
}

#[async_trait]
impl Blockchain for FakeBlockchain {
    async fn validate_utxo(&self, _selector: Selector, input: &TxInput) -> LightnodeResult<()> {
        if self.utxo_valid.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(LightnodeError::InvalidParams(format!(
                "utxo {}:{} does not exist",
                hex::encode(&input.txid),
                input.txindex
            )))
        }
    }

    async fn confirmations_of(&self, _chain: Chain, txid: &[u8]) -> LightnodeResult<u64> {
        Ok(self
            .confirmations
            .read()
            .await
            .get(txid)
            .copied()
            .unwrap_or(0))
    }
}

/// Host-chain fake capturing everything the submitter broadcasts.
pub struct FakeHostChain {
    height: AtomicU64,
    fail_publish: AtomicBool,
    published: RwLock<Vec<TypedTransaction>>,
}

impl FakeHostChain {
    pub fn new(height: u64) -> Self {
        Self {
            height: AtomicU64::new(height),
            fail_publish: AtomicBool::new(false),
            published: RwLock::new(Vec::new()),
        }
    }

    pub fn set_height(&self, height: u64) {
        self.height.store(height, Ordering::SeqCst);
    }

    pub fn set_fail_publish(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }

    pub async fn published(&self) -> Vec<TypedTransaction> {
        self.published.read().await.clone()
    }
}

#[async_trait]
impl ChainHead for FakeHostChain {
    async fn current_height(&self) -> LightnodeResult<u64> {
        Ok(self.height.load(Ordering::SeqCst))
    }
}

#[async_trait]
impl HostChainClient for FakeHostChain {
    async fn build_tx(&self, to: Address, data: Bytes) -> LightnodeResult<TypedTransaction> {
        Ok(TransactionRequest::new().to(to).data(data).into())
    }

    async fn publish_signed_tx(&self, tx: TypedTransaction) -> LightnodeResult<H256> {
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(LightnodeError::TransientDownstream(
                "broadcast refused".into(),
            ));
        }
        let digest = H256::from(keccak256(
            tx.data().map(|d| d.to_vec()).unwrap_or_default(),
        ));
        self.published.write().await.push(tx);
        Ok(digest)
    }
}

/// Burn-log fake replaying a fixed event stream, the watcher's unit-test
/// seam.
pub struct FakeBurnLogFetcher {
    events: RwLock<Vec<BurnEvent>>,
    calls: AtomicUsize,
}

impl FakeBurnLogFetcher {
    pub fn new(events: Vec<BurnEvent>) -> Self {
        Self {
            events: RwLock::new(events),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BurnLogFetcher for FakeBurnLogFetcher {
    async fn fetch_burn_logs(&self, from: u64, to: u64) -> LightnodeResult<Vec<BurnEvent>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .events
            .read()
            .await
            .iter()
            .filter(|e| e.block > from && e.block <= to)
            .cloned()
            .collect())
    }
}
