// Copyright (c) Lightnode, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Poll loop promoting stored transactions as their funding gains
//! confirmations on the source chain. Every promotion is a guarded status
//! update, so re-scanning the same record is a no-op; the poll cadence is
//! the retry mechanism.

use crate::chain::Blockchain;
use crate::jsonrpc::{Method, ParamsSubmitTx, Request, RequestWithResponder};
use crate::metrics::NodeMetrics;
use crate::store::{TxRecord, TxStore};
use crate::tx::{Chain, TxStatus};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub struct Confirmer {
    store: Arc<dyn TxStore>,
    bc: Arc<dyn Blockchain>,
    dispatcher_tx: mpsc::Sender<RequestWithResponder>,
    confirmations: HashMap<Chain, u64>,
    poll_rate: Duration,
    expiry: Duration,
    metrics: Arc<NodeMetrics>,
}

impl Confirmer {
    pub fn new(
        store: Arc<dyn TxStore>,
        bc: Arc<dyn Blockchain>,
        dispatcher_tx: mpsc::Sender<RequestWithResponder>,
        confirmations: HashMap<Chain, u64>,
        poll_rate: Duration,
        expiry: Duration,
        metrics: Arc<NodeMetrics>,
    ) -> Self {
        Self {
            store,
            bc,
            dispatcher_tx,
            confirmations,
            poll_rate,
            expiry,
            metrics,
        }
    }

    fn count_error(&self, err: &crate::error::LightnodeError) {
        self.metrics
            .errors_total
            .with_label_values(&[err.error_kind()])
            .inc();
    }

    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.poll_rate);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("[confirmer] cancelled");
                        return;
                    }
                    _ = interval.tick() => {
                        self.scan().await;
                    }
                }
            }
        })
    }

    /// One confirmation sweep over every `pending` and `confirming` record.
    pub async fn scan(&self) {
        let pending = match self.store.list_by_status(TxStatus::Pending, None, None).await {
            Ok(rows) => rows,
            Err(err) => {
                error!("[confirmer] cannot list pending txs: {err}");
                self.count_error(&err);
                return;
            }
        };
        let confirming = match self
            .store
            .list_by_status(TxStatus::Confirming, None, None)
            .await
        {
            Ok(rows) => rows,
            Err(err) => {
                error!("[confirmer] cannot list confirming txs: {err}");
                self.count_error(&err);
                return;
            }
        };

        for record in pending {
            // A record that never started confirming and outlived the
            // expiry window is abandoned.
            let age = Utc::now().signed_duration_since(record.created_at);
            if age.to_std().map_or(false, |age| age > self.expiry) {
                match self
                    .store
                    .update_status(record.tx.hash, TxStatus::Rejected)
                    .await
                {
                    Ok(true) => {
                        info!("[confirmer] rejected expired tx {}", record.tx.hash);
                        self.metrics
                            .status_transitions
                            .with_label_values(&["rejected"])
                            .inc();
                    }
                    Ok(false) => {}
                    Err(err) => {
                        error!("[confirmer] cannot reject {}: {err}", record.tx.hash);
                        self.count_error(&err);
                    }
                }
                continue;
            }
            self.advance(&record).await;
        }
        for record in confirming {
            self.advance(&record).await;
        }
    }

    async fn advance(&self, record: &TxRecord) {
        let source = record.tx.selector.source();
        let confirmations = match self
            .bc
            .confirmations_of(source, &record.tx.input.txid)
            .await
        {
            Ok(count) => count,
            Err(err) => {
                // Transient; the next poll re-asks.
                warn!(
                    "[confirmer] cannot count confirmations of {}: {err}",
                    record.tx.hash
                );
                self.count_error(&err);
                return;
            }
        };
        let threshold = self.confirmations.get(&source).copied().unwrap_or(6);

        if confirmations >= threshold {
            if record.status == TxStatus::Pending {
                let _ = self
                    .store
                    .update_status(record.tx.hash, TxStatus::Confirming)
                    .await;
            }
            match self
                .store
                .update_status(record.tx.hash, TxStatus::Confirmed)
                .await
            {
                Ok(true) => {
                    info!(
                        "[confirmer] tx {} confirmed ({confirmations}/{threshold} on {source})",
                        record.tx.hash
                    );
                    self.metrics
                        .status_transitions
                        .with_label_values(&["confirmed"])
                        .inc();
                    self.redispatch(record).await;
                }
                Ok(false) => {}
                Err(err) => {
                    error!("[confirmer] cannot confirm {}: {err}", record.tx.hash);
                    self.count_error(&err);
                }
            }
        } else if confirmations >= 1 && record.status == TxStatus::Pending {
            match self
                .store
                .update_status(record.tx.hash, TxStatus::Confirming)
                .await
            {
                Ok(true) => {
                    debug!(
                        "[confirmer] tx {} confirming ({confirmations}/{threshold} on {source})",
                        record.tx.hash
                    );
                    self.metrics
                        .status_transitions
                        .with_label_values(&["confirming"])
                        .inc();
                }
                Ok(false) => {}
                Err(err) => {
                    error!("[confirmer] cannot promote {}: {err}", record.tx.hash);
                    self.count_error(&err);
                }
            }
        }
    }

    /// Hand the confirmed transaction back to the darknodes so consensus
    /// can begin.
    async fn redispatch(&self, record: &TxRecord) {
        let params = match serde_json::to_value(ParamsSubmitTx {
            tx: record.tx.clone(),
        }) {
            Ok(params) => params,
            Err(err) => {
                error!("[confirmer] cannot encode {}: {err}", record.tx.hash);
                return;
            }
        };
        let request = Request::new(rand::random::<u32>() as i64, Method::SubmitTx, params);
        let (msg, response_rx) = RequestWithResponder::new(request);
        if self.dispatcher_tx.send(msg).await.is_err() {
            error!("[confirmer] dispatcher closed");
            return;
        }
        let hash = record.tx.hash;
        tokio::spawn(async move {
            match response_rx.await {
                Ok(response) if response.is_ok() => {
                    debug!("[confirmer] darknodes accepted {hash}");
                }
                Ok(response) => {
                    warn!("[confirmer] darknodes rejected {hash}: {:?}", response.error);
                }
                Err(_) => warn!("[confirmer] no darknode response for {hash}"),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jsonrpc::Response;
    use crate::store::memory::MemTxStore;
    use crate::testutil::FakeBlockchain;
    use crate::tx::hash::{nonce_bytes, tx_hash};
    use crate::tx::{ContractPayload, Selector, Tx, TxInput, Version};
    use ethers::types::{Bytes, U256};
    use serde_json::json;

    fn sample_tx(nonce: u64) -> Tx {
        let selector: Selector = "BTC/toEthereum".parse().unwrap();
        let input = TxInput {
            txid: Bytes::from(vec![nonce as u8; 32]),
            txindex: 0,
            amount: U256::from(1_000u64),
            payload: ContractPayload::default(),
            phash: Default::default(),
            to: "0x00112233445566778899aabbccddeeff00112233".to_string(),
            nonce: nonce_bytes(nonce),
            nhash: Default::default(),
            gpubkey: Bytes::default(),
            ghash: Default::default(),
        };
        Tx {
            hash: tx_hash(Version::V1, selector, &input),
            version: Version::V1,
            selector,
            input,
            output: None,
        }
    }

    fn confirmer(
        store: Arc<MemTxStore>,
        bc: Arc<FakeBlockchain>,
        expiry: Duration,
    ) -> (Arc<Confirmer>, mpsc::Receiver<RequestWithResponder>) {
        let (dispatcher_tx, dispatcher_rx) = mpsc::channel(8);
        let mut confirmations = HashMap::new();
        confirmations.insert(Chain::Bitcoin, 6);
        (
            Arc::new(Confirmer::new(
                store,
                bc,
                dispatcher_tx,
                confirmations,
                Duration::from_millis(50),
                expiry,
                Arc::new(NodeMetrics::new_for_testing()),
            )),
            dispatcher_rx,
        )
    }

    #[tokio::test]
    async fn unconfirmed_transactions_stay_pending() {
        let store = Arc::new(MemTxStore::new());
        let bc = Arc::new(FakeBlockchain::new());
        let tx = sample_tx(1);
        store.insert(&tx, false).await.unwrap();

        let (confirmer, _rx) = confirmer(store.clone(), bc, Duration::from_secs(3600));
        confirmer.scan().await;
        assert_eq!(
            store.get(tx.hash).await.unwrap().unwrap().status,
            TxStatus::Pending
        );
    }

    #[tokio::test]
    async fn first_confirmation_promotes_to_confirming() {
        let store = Arc::new(MemTxStore::new());
        let bc = Arc::new(FakeBlockchain::new());
        let tx = sample_tx(2);
        store.insert(&tx, false).await.unwrap();
        bc.set_confirmations(tx.input.txid.to_vec(), 2).await;

        let (confirmer, _rx) = confirmer(store.clone(), bc, Duration::from_secs(3600));
        confirmer.scan().await;
        assert_eq!(
            store.get(tx.hash).await.unwrap().unwrap().status,
            TxStatus::Confirming
        );
    }

    #[tokio::test]
    async fn threshold_confirms_and_redispatches_once() {
        let store = Arc::new(MemTxStore::new());
        let bc = Arc::new(FakeBlockchain::new());
        let tx = sample_tx(3);
        store.insert(&tx, false).await.unwrap();
        bc.set_confirmations(tx.input.txid.to_vec(), 6).await;

        let (confirmer, mut dispatcher_rx) =
            confirmer(store.clone(), bc, Duration::from_secs(3600));
        confirmer.scan().await;
        assert_eq!(
            store.get(tx.hash).await.unwrap().unwrap().status,
            TxStatus::Confirmed
        );

        // The darknodes were handed the confirmed tx.
        let dispatched = dispatcher_rx.recv().await.unwrap();
        assert_eq!(dispatched.request.method, "submitTx");
        dispatched.respond(Response::ok(1, json!({})));

        // Idempotent: a second sweep neither regresses nor re-dispatches.
        confirmer.scan().await;
        assert_eq!(
            store.get(tx.hash).await.unwrap().unwrap().status,
            TxStatus::Confirmed
        );
        assert!(
            tokio::time::timeout(Duration::from_millis(100), dispatcher_rx.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn stale_pending_transactions_are_rejected() {
        let store = Arc::new(MemTxStore::new());
        let bc = Arc::new(FakeBlockchain::new());
        let tx = sample_tx(4);
        store.insert(&tx, false).await.unwrap();

        // Zero expiry: everything pending is immediately too old.
        let (confirmer, _rx) = confirmer(store.clone(), bc.clone(), Duration::ZERO);
        tokio::time::sleep(Duration::from_millis(10)).await;
        confirmer.scan().await;
        assert_eq!(
            store.get(tx.hash).await.unwrap().unwrap().status,
            TxStatus::Rejected
        );

        // A record that reached confirming is exempt from the age policy.
        let confirming = sample_tx(5);
        store.insert(&confirming, false).await.unwrap();
        store
            .update_status(confirming.hash, TxStatus::Confirming)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        confirmer.scan().await;
        assert_eq!(
            store.get(confirming.hash).await.unwrap().unwrap().status,
            TxStatus::Confirming
        );
    }
}
