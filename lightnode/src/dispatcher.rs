// Copyright (c) Lightnode, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Fan-out of requests to darknodes. The method decides both the peer set
//! (broadcast vs targeted) and the aggregation policy that collapses the
//! peer responses into the one reply the client sees.

use crate::jsonrpc::{self, Method, Request, RequestWithResponder, Response, ERR_INTERNAL};
use crate::metrics::NodeMetrics;
use crate::registry::{Peer, PeerRegistry};
use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// How the responses from multiple peers collapse into one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregator {
    /// First non-error response wins; outstanding calls are abandoned.
    First,
    /// The value held by a strict majority of contacted peers.
    Majority,
    /// Wait for everyone; list-shaped results are concatenated and deduped.
    All,
}

/// Static method → aggregation policy table.
pub fn aggregator_for(method: Method) -> Aggregator {
    match method {
        Method::SubmitTx
        | Method::QueryTx
        | Method::QueryBlock
        | Method::QueryBlocks
        | Method::QueryStat
        | Method::QueryFees
        | Method::QueryEpoch => Aggregator::First,
        Method::QueryNumPeers | Method::QueryConfig => Aggregator::Majority,
        Method::QueryPeers => Aggregator::All,
    }
}

/// Targeted methods go to a single random peer (with failover through the
/// rest); everything else is broadcast.
pub fn is_targeted(method: Method) -> bool {
    matches!(method, Method::QueryTx)
}

pub struct Dispatcher {
    registry: Arc<PeerRegistry>,
    client: jsonrpc::Client,
    max_fanout: usize,
    metrics: Arc<NodeMetrics>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<PeerRegistry>,
        client: jsonrpc::Client,
        max_fanout: usize,
        metrics: Arc<NodeMetrics>,
    ) -> Self {
        Self {
            registry,
            client,
            max_fanout,
            metrics,
        }
    }

    pub fn spawn(
        self: Arc<Self>,
        cancel: CancellationToken,
        mut rx: mpsc::Receiver<RequestWithResponder>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("[dispatcher] cancelled");
                        return;
                    }
                    msg = rx.recv() => {
                        let Some(msg) = msg else { return };
                        let dispatcher = self.clone();
                        tokio::spawn(async move {
                            let response = dispatcher.dispatch(&msg.request).await;
                            msg.respond(response);
                        });
                    }
                }
            }
        })
    }

    /// Fan a request out to the chosen peers and aggregate. Individual peer
    /// failures only surface when the aggregator cannot produce a value at
    /// all.
    pub async fn dispatch(&self, request: &Request) -> Response {
        let method = match request.method() {
            Ok(method) => method,
            Err(_) => {
                return Response::err(
                    request.id,
                    jsonrpc::ERR_METHOD_NOT_FOUND,
                    format!("unknown method {}", request.method),
                )
            }
        };

        // Targeted methods get a shuffled failover order over every peer;
        // broadcasts get everyone, capped to a random subset.
        let peers = if is_targeted(method) {
            self.registry.random(usize::MAX).await
        } else {
            self.registry.random(self.max_fanout).await
        };
        if peers.is_empty() {
            warn!("[dispatcher] no known peers for {method}");
            self.metrics
                .dispatch_failures
                .with_label_values(&[method.as_str()])
                .inc();
            return Response::err(request.id, ERR_INTERNAL, "no known peers");
        }

        let response = match (is_targeted(method), aggregator_for(method)) {
            (true, _) => self.first_sequential(request, &peers).await,
            (false, Aggregator::First) => self.first_parallel(request, &peers).await,
            (false, Aggregator::Majority) => self.majority(request, &peers).await,
            (false, Aggregator::All) => self.all(request, &peers).await,
        };
        if !response.is_ok() {
            self.metrics
                .dispatch_failures
                .with_label_values(&[method.as_str()])
                .inc();
        }
        response
    }

    /// Try peers one at a time; the first healthy answer wins.
    async fn first_sequential(&self, request: &Request, peers: &[Peer]) -> Response {
        for peer in peers {
            match self.client.send(&jsonrpc::peer_url(&peer.addr), request).await {
                Ok(response) if response.is_ok() => return response,
                Ok(response) => {
                    debug!(
                        "[dispatcher] {} returned error for {}: {:?}",
                        peer.addr, request.method, response.error
                    );
                }
                Err(err) => {
                    debug!("[dispatcher] {} unreachable: {err}", peer.addr);
                }
            }
        }
        Response::err(request.id, ERR_INTERNAL, "all peers failed")
    }

    /// Race all peers; the first non-error response wins and the rest are
    /// dropped mid-flight.
    async fn first_parallel(&self, request: &Request, peers: &[Peer]) -> Response {
        let mut calls: FuturesUnordered<_> = peers
            .iter()
            .map(|peer| {
                let url = jsonrpc::peer_url(&peer.addr);
                let client = self.client.clone();
                let request = request.clone();
                async move { client.send(&url, &request).await }
            })
            .collect();

        let mut last_error: Option<Response> = None;
        while let Some(outcome) = calls.next().await {
            match outcome {
                Ok(response) if response.is_ok() => return response,
                Ok(response) => last_error = Some(response),
                Err(err) => {
                    debug!("[dispatcher] peer call failed: {err}");
                }
            }
        }
        last_error
            .unwrap_or_else(|| Response::err(request.id, ERR_INTERNAL, "all peers failed"))
    }

    /// Collect everything and return the result held by a strict majority
    /// of the contacted peers.
    async fn majority(&self, request: &Request, peers: &[Peer]) -> Response {
        let results = self.collect(request, peers).await;
        let contacted = peers.len();
        let mut counts: BTreeMap<String, (usize, Value)> = BTreeMap::new();
        for result in results {
            let key = result.to_string();
            counts.entry(key).or_insert((0, result)).0 += 1;
        }
        for (count, value) in counts.into_values() {
            if count * 2 > contacted {
                return Response::ok(request.id, value);
            }
        }
        Response::err(request.id, ERR_INTERNAL, "no majority response")
    }

    /// Wait for every peer and merge list-shaped results.
    async fn all(&self, request: &Request, peers: &[Peer]) -> Response {
        let results = self.collect(request, peers).await;
        if results.is_empty() {
            return Response::err(request.id, ERR_INTERNAL, "all peers failed");
        }
        Response::ok(request.id, merge_results(results))
    }

    async fn collect(&self, request: &Request, peers: &[Peer]) -> Vec<Value> {
        let calls = peers.iter().map(|peer| {
            let url = jsonrpc::peer_url(&peer.addr);
            let client = self.client.clone();
            let request = request.clone();
            async move { client.send(&url, &request).await }
        });
        futures::future::join_all(calls)
            .await
            .into_iter()
            .filter_map(|outcome| match outcome {
                Ok(response) if response.is_ok() => response.result,
                _ => None,
            })
            .collect()
    }
}

/// Merge results from multiple peers. Arrays concatenate and dedupe; objects
/// whose values are arrays merge field-wise; anything else keeps the first
/// result.
fn merge_results(results: Vec<Value>) -> Value {
    if results.iter().all(|v| v.is_array()) {
        let mut seen = std::collections::HashSet::new();
        let mut merged = Vec::new();
        for value in results.into_iter().flat_map(|v| match v {
            Value::Array(items) => items,
            _ => unreachable!(),
        }) {
            if seen.insert(value.to_string()) {
                merged.push(value);
            }
        }
        return Value::Array(merged);
    }

    if results.iter().all(|v| {
        v.as_object()
            .map(|o| o.values().all(Value::is_array))
            .unwrap_or(false)
    }) {
        let mut merged: BTreeMap<String, Vec<Value>> = BTreeMap::new();
        let mut seen: std::collections::HashSet<String> = std::collections::HashSet::new();
        for result in results {
            let Value::Object(fields) = result else {
                unreachable!()
            };
            for (key, value) in fields {
                let Value::Array(items) = value else {
                    unreachable!()
                };
                let slot = merged.entry(key.clone()).or_default();
                for item in items {
                    if seen.insert(format!("{key}\u{0}{item}")) {
                        slot.push(item);
                    }
                }
            }
        }
        return Value::Object(
            merged
                .into_iter()
                .map(|(k, v)| (k, Value::Array(v)))
                .collect(),
        );
    }

    results.into_iter().next().unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::PeerRegistry;
    use crate::testutil::MockDarknode;
    use serde_json::json;
    use std::time::{Duration, Instant};

    async fn registry_of(darknodes: &[MockDarknode]) -> Arc<PeerRegistry> {
        let endpoints: Vec<String> = darknodes.iter().map(|d| d.endpoint()).collect();
        Arc::new(PeerRegistry::new(&endpoints, Duration::from_secs(60)).unwrap())
    }

    fn dispatcher(registry: Arc<PeerRegistry>) -> Dispatcher {
        Dispatcher::new(
            registry,
            jsonrpc::Client::new(Duration::from_secs(2)),
            8,
            Arc::new(NodeMetrics::new_for_testing()),
        )
    }

    #[tokio::test]
    async fn first_policy_returns_the_fastest_peer() {
        let darknodes = MockDarknode::cluster(5).await;
        for (i, (dn, delay)) in darknodes
            .iter()
            .zip([50u64, 100, 200, 400, 800])
            .enumerate()
        {
            dn.set_delay(Duration::from_millis(delay)).await;
            dn.set_result("queryBlock", json!({"peer": i})).await;
        }

        let dispatcher = dispatcher(registry_of(&darknodes).await);
        let request = Request::new(1, Method::QueryBlock, json!({}));
        let started = Instant::now();
        let response = dispatcher.dispatch(&request).await;
        let elapsed = started.elapsed();

        assert_eq!(response.result, Some(json!({"peer": 0})));
        assert!(
            elapsed < Duration::from_millis(150),
            "first-response took {elapsed:?}"
        );
    }

    #[tokio::test]
    async fn first_policy_skips_error_envelopes() {
        let darknodes = MockDarknode::cluster(2).await;
        darknodes[0].set_error("queryBlock").await;
        darknodes[1].set_delay(Duration::from_millis(50)).await;
        darknodes[1]
            .set_result("queryBlock", json!({"peer": "slow-but-right"}))
            .await;

        let dispatcher = dispatcher(registry_of(&darknodes).await);
        let request = Request::new(1, Method::QueryBlock, json!({}));
        let response = dispatcher.dispatch(&request).await;
        assert_eq!(response.result, Some(json!({"peer": "slow-but-right"})));
    }

    #[tokio::test]
    async fn targeted_query_fails_over() {
        let darknodes = MockDarknode::cluster(3).await;
        darknodes[0].set_error("queryTx").await;
        darknodes[1].set_error("queryTx").await;
        darknodes[2]
            .set_result("queryTx", json!({"txStatus": "done"}))
            .await;

        let dispatcher = dispatcher(registry_of(&darknodes).await);
        let request = Request::new(4, Method::QueryTx, json!({"txHash": "0xab"}));
        let response = dispatcher.dispatch(&request).await;
        assert_eq!(response.result, Some(json!({"txStatus": "done"})));
    }

    #[tokio::test]
    async fn majority_requires_a_strict_majority() {
        let darknodes = MockDarknode::cluster(3).await;
        darknodes[0].set_result("queryNumPeers", json!(13)).await;
        darknodes[1].set_result("queryNumPeers", json!(13)).await;
        darknodes[2].set_result("queryNumPeers", json!(7)).await;

        let dispatcher1 = dispatcher(registry_of(&darknodes).await);
        let request = Request::new(2, Method::QueryNumPeers, json!({}));
        let response = dispatcher1.dispatch(&request).await;
        assert_eq!(response.result, Some(json!(13)));

        // Three-way split: no majority, aggregate error.
        let darknodes = MockDarknode::cluster(3).await;
        for (i, dn) in darknodes.iter().enumerate() {
            dn.set_result("queryNumPeers", json!(i)).await;
        }
        let dispatcher2 = dispatcher(registry_of(&darknodes).await);
        let response = dispatcher2.dispatch(&request).await;
        assert!(!response.is_ok());
    }

    #[tokio::test]
    async fn all_policy_merges_and_dedupes_lists() {
        let darknodes = MockDarknode::cluster(2).await;
        darknodes[0].set_peers(vec!["a:1".into(), "b:2".into()]).await;
        darknodes[1].set_peers(vec!["b:2".into(), "c:3".into()]).await;

        let dispatcher = dispatcher(registry_of(&darknodes).await);
        let request = Request::new(3, Method::QueryPeers, json!({}));
        let response = dispatcher.dispatch(&request).await;
        let peers = response.result.unwrap()["peers"].clone();
        let mut peers: Vec<String> = serde_json::from_value(peers).unwrap();
        peers.sort();
        assert_eq!(peers, vec!["a:1", "b:2", "c:3"]);
    }

    #[tokio::test]
    async fn empty_registry_is_an_internal_error() {
        let registry = Arc::new(PeerRegistry::new(&[], Duration::from_secs(60)).unwrap());
        let dispatcher = dispatcher(registry);
        let request = Request::new(9, Method::QueryBlock, json!({}));
        let response = dispatcher.dispatch(&request).await;
        assert_eq!(response.error.unwrap().code, ERR_INTERNAL);
    }

    #[test]
    fn merge_results_handles_plain_arrays_and_scalars() {
        let merged = merge_results(vec![json!([1, 2]), json!([2, 3])]);
        assert_eq!(merged, json!([1, 2, 3]));

        let merged = merge_results(vec![json!({"height": 5}), json!({"height": 6})]);
        assert_eq!(merged, json!({"height": 5}));
    }
}
