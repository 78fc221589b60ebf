// Copyright (c) Lightnode, Inc.
// SPDX-License-Identifier: Apache-2.0

//! HTTP front door: a single JSON-RPC endpoint feeding the cache → resolver
//! → dispatcher pipeline, plus a health probe. Batches are honored up to
//! the configured limit and answered in request order.

use crate::jsonrpc::{
    Request, RequestWithResponder, Response, ERR_INVALID_REQUEST, ERR_INTERNAL,
    ERR_METHOD_NOT_FOUND, ERR_PARSE,
};
use crate::metrics::NodeMetrics;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Clone)]
pub struct ServerState {
    pipeline: mpsc::Sender<RequestWithResponder>,
    max_batch_size: usize,
    server_timeout: Duration,
    metrics: Arc<NodeMetrics>,
    registry: prometheus::Registry,
}

impl ServerState {
    pub fn new(
        pipeline: mpsc::Sender<RequestWithResponder>,
        max_batch_size: usize,
        server_timeout: Duration,
        metrics: Arc<NodeMetrics>,
        registry: prometheus::Registry,
    ) -> Self {
        Self {
            pipeline,
            max_batch_size,
            server_timeout,
            metrics,
            registry,
        }
    }
}

pub fn run_server(
    addr: SocketAddr,
    state: ServerState,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let listener = match tokio::net::TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(err) => {
                warn!("[server] cannot bind {addr}: {err}");
                cancel.cancel();
                return;
            }
        };
        info!("[server] listening on {addr}");
        let result = axum::serve(listener, make_router(state).into_make_service())
            .with_graceful_shutdown(cancel.clone().cancelled_owned())
            .await;
        if let Err(err) = result {
            warn!("[server] exited: {err}");
        }
    })
}

pub(crate) fn make_router(state: ServerState) -> Router {
    Router::new()
        .route("/", post(handle_rpc))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .with_state(state)
}

async fn health() -> StatusCode {
    StatusCode::OK
}

async fn metrics(State(state): State<ServerState>) -> String {
    use prometheus::Encoder;
    let mut buf = Vec::new();
    let encoder = prometheus::TextEncoder::new();
    if encoder
        .encode(&state.registry.gather(), &mut buf)
        .is_err()
    {
        return String::new();
    }
    String::from_utf8(buf).unwrap_or_default()
}

async fn handle_rpc(State(state): State<ServerState>, body: String) -> Json<Value> {
    let parsed: Value = match serde_json::from_str(&body) {
        Ok(value) => value,
        Err(err) => {
            return Json(
                serde_json::to_value(Response::err(0, ERR_PARSE, format!("parse error: {err}")))
                    .unwrap_or(Value::Null),
            )
        }
    };

    match parsed {
        Value::Array(batch) => {
            if batch.len() > state.max_batch_size {
                return Json(
                    serde_json::to_value(Response::err(
                        0,
                        ERR_INVALID_REQUEST,
                        format!("batch exceeds limit of {}", state.max_batch_size),
                    ))
                    .unwrap_or(Value::Null),
                );
            }
            let answers = futures::future::join_all(
                batch.into_iter().map(|entry| handle_one(state.clone(), entry)),
            )
            .await;
            Json(Value::Array(
                answers
                    .into_iter()
                    .map(|r| serde_json::to_value(r).unwrap_or(Value::Null))
                    .collect(),
            ))
        }
        single => Json(
            serde_json::to_value(handle_one(state, single).await).unwrap_or(Value::Null),
        ),
    }
}

async fn handle_one(state: ServerState, raw: Value) -> Response {
    let request: Request = match serde_json::from_value(raw) {
        Ok(request) => request,
        Err(err) => return Response::err(0, ERR_INVALID_REQUEST, format!("bad request: {err}")),
    };
    if request.jsonrpc != "2.0" {
        return Response::err(
            request.id,
            ERR_INVALID_REQUEST,
            format!("unsupported jsonrpc version {}", request.jsonrpc),
        );
    }
    let method = match request.method() {
        Ok(method) => method,
        Err(_) => {
            return Response::err(
                request.id,
                ERR_METHOD_NOT_FOUND,
                format!("unknown method {}", request.method),
            )
        }
    };
    state
        .metrics
        .requests_total
        .with_label_values(&[method.as_str()])
        .inc();

    let id = request.id;
    let (msg, response_rx) = RequestWithResponder::new(request);
    if state.pipeline.send(msg).await.is_err() {
        return Response::err(id, ERR_INTERNAL, "node is shutting down");
    }
    match tokio::time::timeout(state.server_timeout, response_rx).await {
        Ok(Ok(response)) => response,
        Ok(Err(_)) => Response::err(id, ERR_INTERNAL, "request dropped"),
        Err(_) => Response::err(id, ERR_INTERNAL, "request timed out"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// Bind a server whose pipeline echoes the method name back.
    async fn echo_server(max_batch_size: usize) -> String {
        let (pipeline_tx, mut pipeline_rx) = mpsc::channel::<RequestWithResponder>(16);
        tokio::spawn(async move {
            while let Some(msg) = pipeline_rx.recv().await {
                let id = msg.request.id;
                let method = msg.request.method.clone();
                msg.respond(Response::ok(id, json!({ "echo": method })));
            }
        });
        let state = ServerState::new(
            pipeline_tx,
            max_batch_size,
            Duration::from_secs(2),
            Arc::new(NodeMetrics::new_for_testing()),
            prometheus::Registry::new(),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = make_router(state);
        tokio::spawn(async move {
            let _ = axum::serve(listener, app.into_make_service()).await;
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn single_requests_travel_the_pipeline() {
        let url = echo_server(10).await;
        let client = reqwest::Client::new();
        let response: Value = client
            .post(&url)
            .json(&json!({"jsonrpc": "2.0", "id": 5, "method": "queryBlock", "params": {}}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(response["id"], 5);
        assert_eq!(response["result"]["echo"], "queryBlock");
    }

    #[tokio::test]
    async fn unknown_methods_are_refused() {
        let url = echo_server(10).await;
        let client = reqwest::Client::new();
        let response: Value = client
            .post(&url)
            .json(&json!({"jsonrpc": "2.0", "id": 1, "method": "queryEverything", "params": {}}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(response["error"]["code"], ERR_METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn wrong_version_is_an_invalid_request() {
        let url = echo_server(10).await;
        let client = reqwest::Client::new();
        let response: Value = client
            .post(&url)
            .json(&json!({"jsonrpc": "1.0", "id": 1, "method": "queryBlock", "params": {}}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(response["error"]["code"], ERR_INVALID_REQUEST);
    }

    #[tokio::test]
    async fn batches_are_answered_in_order_and_bounded() {
        let url = echo_server(2).await;
        let client = reqwest::Client::new();

        let response: Value = client
            .post(&url)
            .json(&json!([
                {"jsonrpc": "2.0", "id": 1, "method": "queryBlock", "params": {}},
                {"jsonrpc": "2.0", "id": 2, "method": "queryFees", "params": {}}
            ]))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let batch = response.as_array().unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0]["id"], 1);
        assert_eq!(batch[1]["result"]["echo"], "queryFees");

        // Over the limit: one error envelope.
        let response: Value = client
            .post(&url)
            .json(&json!([
                {"jsonrpc": "2.0", "id": 1, "method": "queryBlock", "params": {}},
                {"jsonrpc": "2.0", "id": 2, "method": "queryFees", "params": {}},
                {"jsonrpc": "2.0", "id": 3, "method": "queryStat", "params": {}}
            ]))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(response["error"]["code"], ERR_INVALID_REQUEST);
    }

    #[tokio::test]
    async fn unparseable_bodies_get_a_parse_error() {
        let url = echo_server(10).await;
        let client = reqwest::Client::new();
        let response: Value = client
            .post(&url)
            .header("content-type", "application/json")
            .body("{nope")
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(response["error"]["code"], ERR_PARSE);
    }
}
