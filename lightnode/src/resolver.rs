// Copyright (c) Lightnode, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The single entry point for `submitTx`. Every submission is validated,
//! its derived hashes recomputed, classified shift-in or shift-out, then
//! deduplicated by content hash under a lock so concurrent submissions of
//! the same transaction produce exactly one stored row.

use crate::chain::Blockchain;
use crate::codec::AddressCodec;
use crate::error::{LightnodeError, LightnodeResult};
use crate::jsonrpc::{
    Method, ParamsQueryTx, RequestWithResponder, Response, ResponseSubmitTx,
};
use crate::metrics::NodeMetrics;
use crate::store::TxStore;
use crate::tx::hash::{ghash, nhash, phash, shash, sighash, tx_hash};
use crate::tx::{Tx, TxOutput, TxStatus};
use ethers::types::{Bytes, H256};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

#[derive(Debug, Deserialize)]
struct SubmitTxParams {
    tx: Tx,
    #[serde(default)]
    gateway: bool,
}

/// Validates, completes and persists submissions.
pub struct TxChecker {
    bc: Arc<dyn Blockchain>,
    store: Arc<dyn TxStore>,
    codec: Arc<dyn AddressCodec>,
    dist_pubkey: Bytes,
    // Serializes the lookup-then-insert sequence; the store's ON CONFLICT
    // is the backstop.
    dedup: Mutex<()>,
}

impl TxChecker {
    pub fn new(
        bc: Arc<dyn Blockchain>,
        store: Arc<dyn TxStore>,
        codec: Arc<dyn AddressCodec>,
        dist_pubkey: Bytes,
    ) -> Self {
        Self {
            bc,
            store,
            codec,
            dist_pubkey,
            dedup: Mutex::new(()),
        }
    }

    /// Full submission pipeline. Returns the canonical stored record, which
    /// is the existing one when the submission is a duplicate.
    pub async fn check_and_store(&self, tx: Tx, gateway: bool) -> LightnodeResult<Tx> {
        let tx = self.verify(tx).await?;
        self.check_duplicate(tx, gateway).await
    }

    /// Validate shape, recompute the hash family and run the
    /// direction-specific checks. Validation failures never touch the
    /// store.
    async fn verify(&self, mut tx: Tx) -> LightnodeResult<Tx> {
        if tx.input.txid.is_empty() {
            return Err(LightnodeError::InvalidParams("txid is empty".into()));
        }
        if tx.input.amount.is_zero() {
            return Err(LightnodeError::InvalidParams("amount is zero".into()));
        }
        if tx.input.to.is_empty() {
            return Err(LightnodeError::InvalidParams("to is empty".into()));
        }

        // Recompute the derived hashes. A caller may leave them zeroed, but
        // a non-zero value that disagrees with the recomputation is a
        // malformed submission.
        let to_decoded = self
            .codec
            .decode(tx.selector.destination(), &tx.input.to)?;
        let expected_phash = phash(&tx.input.payload.value);
        let expected_nhash = nhash(tx.input.nonce, &tx.input.txid, tx.input.txindex);
        let expected_ghash = ghash(
            expected_phash,
            shash(tx.selector),
            &to_decoded,
            tx.input.nonce,
        );
        check_hash("phash", &mut tx.input.phash, expected_phash)?;
        check_hash("nhash", &mut tx.input.nhash, expected_nhash)?;
        check_hash("ghash", &mut tx.input.ghash, expected_ghash)?;

        let expected_hash = tx_hash(tx.version, tx.selector, &tx.input);
        check_hash("hash", &mut tx.hash, expected_hash)?;

        if tx.selector.is_shift_in() {
            if !self.dist_pubkey.is_empty() && tx.input.gpubkey != self.dist_pubkey {
                return Err(LightnodeError::InvalidParams(
                    "gpubkey does not match the distributed public key".into(),
                ));
            }
            self.bc.validate_utxo(tx.selector, &tx.input).await?;
            let sighash = sighash(
                tx.input.ghash,
                tx.input.nhash,
                tx.input.amount,
                &to_decoded,
            );
            tx.output = Some(TxOutput {
                amount: tx.input.amount,
                sighash,
                ..Default::default()
            });
        }
        // Shift-out carries its burn reference in (txid, nonce); decoding
        // the recipient above is the destination-side validation.

        Ok(tx)
    }

    async fn check_duplicate(&self, tx: Tx, gateway: bool) -> LightnodeResult<Tx> {
        let _guard = self.dedup.lock().await;
        if let Some(existing) = self.store.get(tx.hash).await? {
            debug!("[resolver] duplicate submission of {}", tx.hash);
            return Ok(existing.tx);
        }
        if !self.store.insert(&tx, gateway).await? {
            // Lost a race against another inserter; the stored row wins.
            if let Some(existing) = self.store.get(tx.hash).await? {
                return Ok(existing.tx);
            }
            return Err(LightnodeError::Persistence(format!(
                "insert of {} neither applied nor visible",
                tx.hash
            )));
        }
        Ok(tx)
    }
}

fn check_hash(name: &str, supplied: &mut H256, expected: H256) -> LightnodeResult<()> {
    if supplied.is_zero() {
        *supplied = expected;
        return Ok(());
    }
    if *supplied != expected {
        return Err(LightnodeError::InvalidParams(format!(
            "{name} mismatch: got {supplied:?}, derived {expected:?}"
        )));
    }
    Ok(())
}

/// Worker pool consuming the request pipeline: answers `submitTx` itself,
/// answers `queryTx` from the store when it can, and forwards everything
/// else to the dispatcher.
pub struct Resolver {
    checker: Arc<TxChecker>,
    store: Arc<dyn TxStore>,
    dispatcher_tx: mpsc::Sender<RequestWithResponder>,
    metrics: Arc<NodeMetrics>,
}

impl Resolver {
    pub fn new(
        checker: Arc<TxChecker>,
        store: Arc<dyn TxStore>,
        dispatcher_tx: mpsc::Sender<RequestWithResponder>,
        metrics: Arc<NodeMetrics>,
    ) -> Self {
        Self {
            checker,
            store,
            dispatcher_tx,
            metrics,
        }
    }

    fn count_error(&self, err: &LightnodeError) {
        self.metrics
            .errors_total
            .with_label_values(&[err.error_kind()])
            .inc();
    }

    /// Number of workers the node runs by default.
    pub fn default_workers() -> usize {
        2 * std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2)
    }

    pub fn spawn_workers(
        self: Arc<Self>,
        cancel: CancellationToken,
        rx: mpsc::Receiver<RequestWithResponder>,
        workers: usize,
    ) -> Vec<JoinHandle<()>> {
        let rx = Arc::new(Mutex::new(rx));
        (0..workers.max(1))
            .map(|_| {
                let resolver = self.clone();
                let rx = rx.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    loop {
                        let msg = tokio::select! {
                            _ = cancel.cancelled() => return,
                            msg = async { rx.lock().await.recv().await } => msg,
                        };
                        let Some(msg) = msg else { return };
                        resolver.handle(msg).await;
                    }
                })
            })
            .collect()
    }

    async fn handle(&self, msg: RequestWithResponder) {
        let id = msg.request.id;
        match msg.request.method() {
            Ok(Method::SubmitTx) => {
                let params: SubmitTxParams =
                    match serde_json::from_value(msg.request.params.clone()) {
                        Ok(params) => params,
                        Err(e) => {
                            let err =
                                LightnodeError::InvalidParams(format!("bad submitTx params: {e}"));
                            self.count_error(&err);
                            msg.respond(Response::from_error(id, &err));
                            return;
                        }
                    };
                match self
                    .checker
                    .check_and_store(params.tx, params.gateway)
                    .await
                {
                    Ok(tx) => {
                        let body = serde_json::to_value(ResponseSubmitTx { tx })
                            .unwrap_or(serde_json::Value::Null);
                        msg.respond(Response::ok(id, body));
                    }
                    Err(err) => {
                        if matches!(err, LightnodeError::Persistence(_)) {
                            error!("[resolver] cannot persist submission: {err}");
                        }
                        self.count_error(&err);
                        msg.respond(Response::from_error(id, &err));
                    }
                }
            }
            Ok(Method::QueryTx) => {
                let params: Result<ParamsQueryTx, _> =
                    serde_json::from_value(msg.request.params.clone());
                if let Ok(params) = params {
                    match self.store.get(params.tx_hash).await {
                        Ok(Some(record)) if record.status != TxStatus::Done => {
                            let body = serde_json::json!({
                                "tx": record.tx,
                                "txStatus": record.status,
                            });
                            msg.respond(Response::ok(id, body));
                            return;
                        }
                        _ => {}
                    }
                }
                self.forward(msg).await;
            }
            _ => self.forward(msg).await,
        }
    }

    async fn forward(&self, msg: RequestWithResponder) {
        let id = msg.request.id;
        let (downstream, rx) = RequestWithResponder::new(msg.request.clone());
        if self.dispatcher_tx.send(downstream).await.is_err() {
            let err = LightnodeError::Persistence("dispatcher closed".into());
            self.count_error(&err);
            msg.respond(Response::from_error(id, &err));
            return;
        }
        match rx.await {
            Ok(response) => msg.respond(response),
            Err(_) => {
                let err =
                    LightnodeError::TransientDownstream("dispatcher dropped request".into());
                self.count_error(&err);
                msg.respond(Response::from_error(id, &err));
            }
        }
    }
}
