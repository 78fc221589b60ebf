// Copyright (c) Lightnode, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Settlement of finalized transactions onto their destination contract
//! chain. A poll task finds `confirmed` records whose execution the
//! darknodes report as done, and a signer task rebuilds the contract call
//! from the payload ABI, signs it with the local key and broadcasts it. The
//! two are linked by a bounded channel so a backlog throttles the poll
//! instead of losing work.

use crate::chain::HostChainClient;
use crate::jsonrpc::{
    Method, ParamsQueryTx, Request, RequestWithResponder, ResponseQueryTx,
};
use crate::metrics::NodeMetrics;
use crate::store::TxStore;
use crate::tx::{Chain, Tx, TxOutput, TxStatus};
use ethers::abi::{Abi, Function, Token};
use ethers::types::{Address, Bytes, H256, U256};
use crate::error::{LightnodeError, LightnodeResult};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Parameters the gateway contract appends after the caller's own inputs.
const AUTO_APPENDED: [&str; 3] = ["_amount", "_nHash", "_sig"];

/// Window after which confirmed-but-unsettled transactions stop being
/// retried.
const SETTLE_WINDOW: Duration = Duration::from_secs(24 * 3600);

pub struct Submitter {
    store: Arc<dyn TxStore>,
    dispatcher_tx: mpsc::Sender<RequestWithResponder>,
    host: Arc<dyn HostChainClient>,
    /// The contract chain this submitter settles onto.
    destination: Chain,
    poll_rate: Duration,
    metrics: Arc<NodeMetrics>,
}

impl Submitter {
    pub fn new(
        store: Arc<dyn TxStore>,
        dispatcher_tx: mpsc::Sender<RequestWithResponder>,
        host: Arc<dyn HostChainClient>,
        destination: Chain,
        poll_rate: Duration,
        metrics: Arc<NodeMetrics>,
    ) -> Self {
        Self {
            store,
            dispatcher_tx,
            host,
            destination,
            poll_rate,
            metrics,
        }
    }

    fn count_error(&self, err: &LightnodeError) {
        self.metrics
            .errors_total
            .with_label_values(&[err.error_kind()])
            .inc();
    }

    /// One producer (the poll) and one consumer (the signer), linked by a
    /// 128-slot buffer.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        let (sink, mut source) = mpsc::channel::<Tx>(128);

        let signer = {
            let submitter = self.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        tx = source.recv() => {
                            let Some(tx) = tx else { return };
                            submitter.submit(tx).await;
                        }
                    }
                }
            })
        };

        let poller = tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.poll_rate);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("[submitter] cancelled");
                        return;
                    }
                    _ = interval.tick() => {
                        self.poll_once(&sink).await;
                    }
                }
            }
        });

        vec![poller, signer]
    }

    /// Find settleable records and queue the ones the darknodes are done
    /// with.
    pub async fn poll_once(&self, sink: &mpsc::Sender<Tx>) {
        let confirmed = match self
            .store
            .list_by_status(TxStatus::Confirmed, Some(SETTLE_WINDOW), None)
            .await
        {
            Ok(rows) => rows,
            Err(err) => {
                error!("[submitter] cannot list confirmed txs: {err}");
                self.count_error(&err);
                return;
            }
        };

        for record in confirmed {
            if record.tx.selector.destination() != self.destination {
                continue;
            }
            let (status, darknode_tx) = match self.query_status(record.tx.hash).await {
                Ok(answer) => answer,
                Err(err) => {
                    warn!("[submitter] cannot query {}: {err}", record.tx.hash);
                    self.count_error(&err);
                    continue;
                }
            };
            if status != "done" {
                debug!(
                    "[submitter] tx {} not executed yet (status {status})",
                    record.tx.hash
                );
                continue;
            }
            let Some(output) = darknode_tx.output.clone() else {
                warn!("[submitter] tx {} done without output", record.tx.hash);
                continue;
            };
            if let Err(err) = self.store.update_output(record.tx.hash, &output).await {
                error!("[submitter] cannot persist output of {}: {err}", record.tx.hash);
                self.count_error(&err);
                continue;
            }
            let mut tx = record.tx.clone();
            tx.output = Some(output);
            // A full buffer blocks here; confirmed rows are durable, so
            // waiting is safe.
            if sink.send(tx).await.is_err() {
                return;
            }
        }
    }

    async fn query_status(&self, hash: H256) -> LightnodeResult<(String, Tx)> {
        let params = serde_json::to_value(ParamsQueryTx { tx_hash: hash })
            .map_err(|e| LightnodeError::LogicViolation(format!("encode queryTx: {e}")))?;
        let request = Request::new(rand::random::<u32>() as i64, Method::QueryTx, params);
        let (msg, response_rx) = RequestWithResponder::new(request);
        self.dispatcher_tx
            .send(msg)
            .await
            .map_err(|_| LightnodeError::TransientDownstream("dispatcher closed".into()))?;
        let response = response_rx
            .await
            .map_err(|_| LightnodeError::TransientDownstream("dispatcher dropped query".into()))?;
        if let Some(err) = response.error {
            return Err(LightnodeError::TransientDownstream(format!(
                "queryTx failed: {} ({})",
                err.message, err.code
            )));
        }
        let body: ResponseQueryTx = serde_json::from_value(response.result.unwrap_or_default())
            .map_err(|e| {
                LightnodeError::TransientDownstream(format!("bad queryTx result: {e}"))
            })?;
        Ok((body.tx_status, body.tx))
    }

    /// Build, sign and broadcast the settlement call. A broadcast failure
    /// leaves the record `confirmed`; the next poll retries.
    pub async fn submit(&self, tx: Tx) {
        let (to, data) = match build_settlement_call(&tx) {
            Ok(call) => call,
            Err(err) => {
                // The payload itself is broken; skip the record, never the
                // loop.
                error!("[submitter] cannot build call for {}: {err}", tx.hash);
                self.count_error(&err);
                return;
            }
        };
        let unsigned = match self.host.build_tx(to, data).await {
            Ok(unsigned) => unsigned,
            Err(err) => {
                warn!("[submitter] cannot build tx for {}: {err}", tx.hash);
                self.count_error(&err);
                return;
            }
        };
        match self.host.publish_signed_tx(unsigned).await {
            Ok(published) => {
                info!("[submitter] settled {} as {published:?}", tx.hash);
                match self.store.update_status(tx.hash, TxStatus::Submitted).await {
                    Ok(true) => {
                        self.metrics
                            .status_transitions
                            .with_label_values(&["submitted"])
                            .inc();
                    }
                    Ok(false) => {}
                    Err(err) => {
                        error!("[submitter] cannot mark {} submitted: {err}", tx.hash);
                        self.count_error(&err);
                    }
                }
            }
            Err(err) => {
                warn!("[submitter] broadcast of {} failed, will retry: {err}", tx.hash);
                self.count_error(&err);
            }
        }
    }
}

/// The 65-byte `r || s || v` signature with `v` rebased by +27 to the
/// host-chain convention.
pub fn sig_from_rsv(output: &TxOutput) -> Vec<u8> {
    let mut sig = Vec::with_capacity(65);
    sig.extend_from_slice(output.r.as_bytes());
    sig.extend_from_slice(output.s.as_bytes());
    sig.push(output.v.wrapping_add(27));
    sig
}

/// Rebuild the settlement call for a finalized transaction: decode the
/// payload ABI, take the declared inputs minus the auto-appended trio,
/// unpack the payload bytes into named values, reassemble them positionally
/// in declared order and append `amount`, `nhash` and the signature.
pub fn build_settlement_call(tx: &Tx) -> LightnodeResult<(Address, Bytes)> {
    let payload = &tx.input.payload;
    if payload.abi.is_empty() || payload.func.is_empty() {
        return Err(LightnodeError::InvalidParams(
            "payload carries no contract call".into(),
        ));
    }
    let output = tx
        .output
        .as_ref()
        .ok_or_else(|| LightnodeError::LogicViolation("settling a tx without output".into()))?;

    let abi: Abi = serde_json::from_slice(&payload.abi)
        .map_err(|e| LightnodeError::InvalidParams(format!("bad payload abi: {e}")))?;
    let function = abi
        .function(&payload.func)
        .map_err(|e| LightnodeError::InvalidParams(format!("unknown function: {e}")))?;

    let mut args = rebuild_declared_args(function, &payload.value)?;
    args.push(Token::Uint(tx.input.amount));
    args.push(Token::FixedBytes(tx.input.nhash.as_bytes().to_vec()));
    args.push(Token::Bytes(sig_from_rsv(output)));

    let data = function
        .encode_input(&args)
        .map_err(|e| LightnodeError::InvalidParams(format!("cannot encode call: {e}")))?;
    let to = Address::from_str(&tx.input.to)
        .map_err(|e| LightnodeError::LogicViolation(format!("stored to address: {e}")))?;
    Ok((to, Bytes::from(data)))
}

fn rebuild_declared_args(function: &Function, payload_value: &[u8]) -> LightnodeResult<Vec<Token>> {
    let declared: Vec<_> = function
        .inputs
        .iter()
        .filter(|p| !AUTO_APPENDED.contains(&p.name.as_str()))
        .collect();
    let kinds: Vec<_> = declared.iter().map(|p| p.kind.clone()).collect();
    let tokens = ethers::abi::decode(&kinds, payload_value)
        .map_err(|e| LightnodeError::InvalidParams(format!("cannot unpack payload: {e}")))?;

    let mut named: HashMap<&str, Token> = declared
        .iter()
        .map(|p| p.name.as_str())
        .zip(tokens)
        .collect();

    let mut args = Vec::with_capacity(declared.len());
    for param in &declared {
        let value = named.remove(param.name.as_str()).ok_or_else(|| {
            LightnodeError::InvalidParams(format!("missing argument {}", param.name))
        })?;
        args.push(value);
    }
    Ok(args)
}
