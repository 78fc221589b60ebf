// Copyright (c) Lightnode, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Response cache. Requests are fingerprinted over (method, canonical
//! params), never the JSON-RPC id, and answered from an LRU of recent
//! responses. Concurrent misses on one fingerprint coalesce onto a single
//! downstream call by serializing on the per-fingerprint entry lock.

use crate::jsonrpc::{Method, RequestWithResponder, Response, ERR_INTERNAL};
use crate::metrics::NodeMetrics;
use lru::LruCache;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub type Fingerprint = [u8; 32];

/// Whether responses to a method may be cached. `submitTx` and `queryTx`
/// answers change as the transaction progresses; `queryEpoch` is reserved.
pub fn cacheable(method: Method) -> bool {
    match method {
        Method::SubmitTx | Method::QueryTx | Method::QueryEpoch => false,
        Method::QueryBlock
        | Method::QueryBlocks
        | Method::QueryNumPeers
        | Method::QueryPeers
        | Method::QueryStat
        | Method::QueryFees
        | Method::QueryConfig => true,
    }
}

/// Content hash over the method name and the canonical serialization of the
/// params. serde_json maps are ordered, so two requests differing only in
/// key order or id collapse onto one fingerprint.
pub fn fingerprint(method: &str, params: &Value) -> Fingerprint {
    let mut hasher = Sha256::new();
    hasher.update(method.as_bytes());
    hasher.update([0u8]);
    hasher.update(serde_json::to_vec(params).unwrap_or_default());
    hasher.finalize().into()
}

type CacheEntry = Arc<Mutex<Option<(Response, Instant)>>>;

#[derive(Clone)]
pub struct Cacher {
    next: mpsc::Sender<RequestWithResponder>,
    entries: Arc<Mutex<LruCache<Fingerprint, CacheEntry>>>,
    ttl: Duration,
    metrics: Arc<NodeMetrics>,
}

impl Cacher {
    pub fn new(
        next: mpsc::Sender<RequestWithResponder>,
        capacity: usize,
        ttl: Duration,
        metrics: Arc<NodeMetrics>,
    ) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap();
        Self {
            next,
            entries: Arc::new(Mutex::new(LruCache::new(capacity))),
            ttl,
            metrics,
        }
    }

    pub fn spawn(
        self,
        cancel: CancellationToken,
        mut rx: mpsc::Receiver<RequestWithResponder>,
    ) -> JoinHandle<()> {
        let sweeper = self.clone();
        let sweep_cancel = cancel.clone();
        tokio::spawn(async move { sweeper.sweep_loop(sweep_cancel).await });

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("[cacher] cancelled");
                        return;
                    }
                    msg = rx.recv() => {
                        let Some(msg) = msg else { return };
                        let cacher = self.clone();
                        tokio::spawn(async move { cacher.handle(msg).await });
                    }
                }
            }
        })
    }

    async fn handle(&self, msg: RequestWithResponder) {
        let method = match msg.request.method() {
            Ok(method) => method,
            // The server validates methods; anything else passes through.
            Err(_) => {
                self.forward(msg).await;
                return;
            }
        };

        if !cacheable(method) {
            self.forward(msg).await;
            return;
        }

        let fp = fingerprint(&msg.request.method, &msg.request.params);
        let entry = {
            let mut entries = self.entries.lock().await;
            entries
                .get_or_insert(fp, || Arc::new(Mutex::new(None)))
                .clone()
        };

        // Holding the entry lock across the downstream call is what gives
        // at-most-one concurrent call per fingerprint.
        let id = msg.request.id;
        let mut guard = entry.lock().await;
        if let Some((cached, inserted_at)) = guard.as_ref() {
            if inserted_at.elapsed() <= self.ttl {
                self.metrics.cache_hits.inc();
                msg.respond(cached.clone().with_id(id));
                return;
            }
        }
        self.metrics.cache_misses.inc();

        let (downstream, response_rx) = RequestWithResponder::new(msg.request.clone());
        if self.next.send(downstream).await.is_err() {
            msg.respond(Response::err(id, ERR_INTERNAL, "pipeline closed"));
            return;
        }
        match response_rx.await {
            Ok(response) => {
                *guard = Some((response.clone(), Instant::now()));
                msg.respond(response);
            }
            Err(_) => {
                msg.respond(Response::err(id, ERR_INTERNAL, "downstream dropped request"));
            }
        }
    }

    async fn forward(&self, msg: RequestWithResponder) {
        let id = msg.request.id;
        let (downstream, response_rx) = RequestWithResponder::new(msg.request.clone());
        if self.next.send(downstream).await.is_err() {
            msg.respond(Response::err(id, ERR_INTERNAL, "pipeline closed"));
            return;
        }
        match response_rx.await {
            Ok(response) => msg.respond(response),
            Err(_) => msg.respond(Response::err(id, ERR_INTERNAL, "downstream dropped request")),
        }
    }

    async fn sweep_loop(&self, cancel: CancellationToken) {
        let period = self.ttl.max(Duration::from_secs(1));
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = interval.tick() => {
                    let mut entries = self.entries.lock().await;
                    let mut expired = Vec::new();
                    for (fp, entry) in entries.iter() {
                        if let Ok(guard) = entry.try_lock() {
                            if let Some((_, inserted_at)) = guard.as_ref() {
                                if inserted_at.elapsed() > self.ttl {
                                    expired.push(*fp);
                                }
                            }
                        }
                    }
                    for fp in &expired {
                        entries.pop(fp);
                    }
                    if !expired.is_empty() {
                        debug!("[cacher] swept {} expired entries", expired.len());
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jsonrpc::Request;
    use serde_json::json;
    use tokio::time::timeout;

    fn new_cacher(
        ttl: Duration,
    ) -> (
        Cacher,
        mpsc::Sender<RequestWithResponder>,
        mpsc::Receiver<RequestWithResponder>,
        CancellationToken,
    ) {
        let (next_tx, next_rx) = mpsc::channel(16);
        let cacher = Cacher::new(
            next_tx.clone(),
            32,
            ttl,
            Arc::new(NodeMetrics::new_for_testing()),
        );
        (cacher, next_tx, next_rx, CancellationToken::new())
    }

    async fn send(
        inbound: &mpsc::Sender<RequestWithResponder>,
        request: Request,
    ) -> tokio::sync::oneshot::Receiver<Response> {
        let (msg, rx) = RequestWithResponder::new(request);
        inbound.send(msg).await.unwrap();
        rx
    }

    #[test]
    fn fingerprint_ignores_id_and_key_order() {
        let a = fingerprint("queryBlock", &json!({"height": 7, "extra": true}));
        let b = fingerprint("queryBlock", &json!({"extra": true, "height": 7}));
        assert_eq!(a, b);

        let c = fingerprint("queryBlocks", &json!({"height": 7, "extra": true}));
        assert_ne!(a, c);
    }

    #[test]
    fn policy_table_singles_out_tx_methods() {
        assert!(!cacheable(Method::SubmitTx));
        assert!(!cacheable(Method::QueryTx));
        assert!(!cacheable(Method::QueryEpoch));
        for method in [
            Method::QueryBlock,
            Method::QueryBlocks,
            Method::QueryNumPeers,
            Method::QueryPeers,
            Method::QueryStat,
            Method::QueryFees,
            Method::QueryConfig,
        ] {
            assert!(cacheable(method), "{method} should be cacheable");
        }
    }

    #[tokio::test]
    async fn second_call_is_served_from_cache() {
        let (cacher, _next_tx, mut next_rx, cancel) = new_cacher(Duration::from_secs(5));
        let (inbound_tx, inbound_rx) = mpsc::channel(16);
        cacher.spawn(cancel.clone(), inbound_rx);

        // First request goes downstream.
        let rx1 = send(
            &inbound_tx,
            Request::new(1, Method::QueryBlock, json!({"height": 9})),
        )
        .await;
        let forwarded = next_rx.recv().await.unwrap();
        assert_eq!(forwarded.request.id, 1);
        forwarded.respond(Response::ok(1, json!({"block": "b9"})));
        let first = rx1.await.unwrap();
        assert_eq!(first.result, Some(json!({"block": "b9"})));

        // Second request with a different id is a hit: no downstream call,
        // same body, readdressed id.
        let rx2 = send(
            &inbound_tx,
            Request::new(2, Method::QueryBlock, json!({"height": 9})),
        )
        .await;
        let second = rx2.await.unwrap();
        assert_eq!(second.id, 2);
        assert_eq!(second.result, Some(json!({"block": "b9"})));
        assert!(
            timeout(Duration::from_millis(100), next_rx.recv())
                .await
                .is_err(),
            "cache hit must not contact downstream"
        );
        cancel.cancel();
    }

    #[tokio::test]
    async fn non_cacheable_methods_always_pass_through() {
        let (cacher, _next_tx, mut next_rx, cancel) = new_cacher(Duration::from_secs(5));
        let (inbound_tx, inbound_rx) = mpsc::channel(16);
        cacher.spawn(cancel.clone(), inbound_rx);

        for id in [1, 2] {
            let rx = send(
                &inbound_tx,
                Request::new(id, Method::QueryTx, json!({"txHash": "0x11"})),
            )
            .await;
            let forwarded = next_rx.recv().await.unwrap();
            forwarded.respond(Response::ok(id, json!({"status": "pending"})));
            assert!(rx.await.unwrap().is_ok());
        }
        cancel.cancel();
    }

    #[tokio::test]
    async fn expired_entries_miss_again() {
        let (cacher, _next_tx, mut next_rx, cancel) = new_cacher(Duration::from_millis(50));
        let (inbound_tx, inbound_rx) = mpsc::channel(16);
        cacher.spawn(cancel.clone(), inbound_rx);

        let rx = send(&inbound_tx, Request::new(1, Method::QueryFees, json!({}))).await;
        next_rx
            .recv()
            .await
            .unwrap()
            .respond(Response::ok(1, json!({"fees": 1})));
        rx.await.unwrap();

        tokio::time::sleep(Duration::from_millis(80)).await;

        let rx = send(&inbound_tx, Request::new(2, Method::QueryFees, json!({}))).await;
        let forwarded = timeout(Duration::from_secs(1), next_rx.recv())
            .await
            .expect("expired entry must go downstream")
            .unwrap();
        forwarded.respond(Response::ok(2, json!({"fees": 2})));
        assert_eq!(rx.await.unwrap().result, Some(json!({"fees": 2})));
        cancel.cancel();
    }

    #[tokio::test]
    async fn concurrent_misses_coalesce_into_one_downstream_call() {
        let (cacher, _next_tx, mut next_rx, cancel) = new_cacher(Duration::from_secs(5));
        let (inbound_tx, inbound_rx) = mpsc::channel(16);
        cacher.spawn(cancel.clone(), inbound_rx);

        let rx1 = send(&inbound_tx, Request::new(1, Method::QueryStat, json!({}))).await;
        let rx2 = send(&inbound_tx, Request::new(2, Method::QueryStat, json!({}))).await;
        let rx3 = send(&inbound_tx, Request::new(3, Method::QueryStat, json!({}))).await;

        // Exactly one downstream call arrives for the three requests.
        let forwarded = next_rx.recv().await.unwrap();
        let first_id = forwarded.request.id;
        forwarded.respond(Response::ok(first_id, json!({"cpu": 1})));
        assert!(
            timeout(Duration::from_millis(100), next_rx.recv())
                .await
                .is_err(),
            "coalesced misses must not fan out"
        );

        for (rx, id) in [(rx1, 1), (rx2, 2), (rx3, 3)] {
            let response = rx.await.unwrap();
            assert_eq!(response.id, id);
            assert_eq!(response.result, Some(json!({"cpu": 1})));
        }
        cancel.cancel();
    }
}
