// Copyright (c) Lightnode, Inc.
// SPDX-License-Identifier: Apache-2.0

//! JSON-RPC 2.0 envelope types, the closed method table, and the HTTP client
//! used for all outbound darknode calls.

use crate::error::{LightnodeError, LightnodeResult};
use crate::tx::Tx;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::oneshot;

pub const ERR_PARSE: i64 = -32700;
pub const ERR_INVALID_REQUEST: i64 = -32600;
pub const ERR_METHOD_NOT_FOUND: i64 = -32601;
pub const ERR_INVALID_PARAMS: i64 = -32602;
pub const ERR_INTERNAL: i64 = -32603;

/// The closed set of methods the node accepts and multiplexes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    SubmitTx,
    QueryTx,
    QueryBlock,
    QueryBlocks,
    QueryNumPeers,
    QueryPeers,
    QueryEpoch,
    QueryStat,
    QueryFees,
    QueryConfig,
}

impl Method {
    pub const ALL: [Method; 10] = [
        Method::SubmitTx,
        Method::QueryTx,
        Method::QueryBlock,
        Method::QueryBlocks,
        Method::QueryNumPeers,
        Method::QueryPeers,
        Method::QueryEpoch,
        Method::QueryStat,
        Method::QueryFees,
        Method::QueryConfig,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::SubmitTx => "submitTx",
            Method::QueryTx => "queryTx",
            Method::QueryBlock => "queryBlock",
            Method::QueryBlocks => "queryBlocks",
            Method::QueryNumPeers => "queryNumPeers",
            Method::QueryPeers => "queryPeers",
            Method::QueryEpoch => "queryEpoch",
            Method::QueryStat => "queryStat",
            Method::QueryFees => "queryFees",
            Method::QueryConfig => "queryConfig",
        }
    }
}

impl FromStr for Method {
    type Err = LightnodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Method::ALL
            .iter()
            .copied()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| LightnodeError::InvalidParams(format!("unknown method {s}")))
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Request {
    pub jsonrpc: String,
    pub id: i64,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl Request {
    pub fn new(id: i64, method: Method, params: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.as_str().to_string(),
            params,
        }
    }

    pub fn method(&self) -> LightnodeResult<Method> {
        self.method.parse()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Response {
    pub jsonrpc: String,
    pub id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
}

impl Response {
    pub fn ok(id: i64, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: i64, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(ErrorObject {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }

    pub fn from_error(id: i64, err: &LightnodeError) -> Self {
        Self::err(id, err.rpc_code(), err.to_string())
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    /// The same response re-addressed to a different request id. Used when a
    /// cached body answers a request that arrived with a fresh id.
    pub fn with_id(mut self, id: i64) -> Self {
        self.id = id;
        self
    }
}

/// Typed params/result bodies for the methods the node itself constructs or
/// inspects. Everything else stays opaque `Value` and is passed through.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ParamsSubmitTx {
    pub tx: Tx,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResponseSubmitTx {
    pub tx: Tx,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ParamsQueryTx {
    #[serde(rename = "txHash")]
    pub tx_hash: ethers::types::H256,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResponseQueryTx {
    pub tx: Tx,
    #[serde(rename = "txStatus")]
    pub tx_status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ResponseQueryPeers {
    pub peers: Vec<String>,
}

/// A request paired with the single-use channel its answer must travel back
/// on. Every pipeline stage consumes these from a channel and either responds
/// or forwards.
#[derive(Debug)]
pub struct RequestWithResponder {
    pub request: Request,
    pub responder: oneshot::Sender<Response>,
}

impl RequestWithResponder {
    pub fn new(request: Request) -> (Self, oneshot::Receiver<Response>) {
        let (responder, rx) = oneshot::channel();
        (Self { request, responder }, rx)
    }

    pub fn respond(self, response: Response) {
        // The caller may have gone away; that is not our problem.
        let _ = self.responder.send(response);
    }
}

/// Outbound JSON-RPC client. One shared connection pool for the whole
/// process, per-call timeout supplied by the caller.
#[derive(Debug, Clone)]
pub struct Client {
    http: reqwest::Client,
    timeout: Duration,
}

fn shared_http_client() -> reqwest::Client {
    static CLIENT: OnceCell<reqwest::Client> = OnceCell::new();
    CLIENT
        .get_or_init(|| {
            reqwest::Client::builder()
                .pool_max_idle_per_host(64)
                .tcp_keepalive(Some(Duration::from_secs(30)))
                .connect_timeout(Duration::from_secs(2))
                .build()
                .expect("failed to build reqwest client")
        })
        .clone()
}

impl Client {
    pub fn new(timeout: Duration) -> Self {
        Self {
            http: shared_http_client(),
            timeout,
        }
    }

    /// Send a request to `url` and parse the response envelope. Transport
    /// and HTTP-level failures surface as transient downstream errors; a
    /// JSON-RPC error envelope is returned as a successful `Response` for
    /// the aggregator to judge.
    pub async fn send(&self, url: &str, request: &Request) -> LightnodeResult<Response> {
        let resp = self
            .http
            .post(url)
            .timeout(self.timeout)
            .json(request)
            .send()
            .await
            .map_err(|e| LightnodeError::TransientDownstream(format!("{url}: {e}")))?;

        if !resp.status().is_success() {
            return Err(LightnodeError::TransientDownstream(format!(
                "{url}: http status {}",
                resp.status()
            )));
        }

        resp.json::<Response>()
            .await
            .map_err(|e| LightnodeError::TransientDownstream(format!("{url}: bad envelope: {e}")))
    }
}

/// Base URL for a peer's JSON-RPC endpoint.
pub fn peer_url(addr: &str) -> String {
    format!("http://{addr}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_round_trip() {
        for method in Method::ALL {
            assert_eq!(method.as_str().parse::<Method>().unwrap(), method);
        }
        assert!("queryEverything".parse::<Method>().is_err());
    }

    #[test]
    fn envelope_serialization() {
        let req = Request::new(7, Method::QueryBlock, serde_json::json!({}));
        let raw = serde_json::to_value(&req).unwrap();
        assert_eq!(raw["jsonrpc"], "2.0");
        assert_eq!(raw["method"], "queryBlock");
        assert_eq!(raw["id"], 7);

        let resp = Response::err(7, ERR_METHOD_NOT_FOUND, "unknown method");
        let raw = serde_json::to_value(&resp).unwrap();
        assert_eq!(raw["error"]["code"], ERR_METHOD_NOT_FOUND);
        assert!(raw.get("result").is_none());
    }

    #[test]
    fn response_readdressing_keeps_body() {
        let resp = Response::ok(1, serde_json::json!({"height": 42}));
        let moved = resp.clone().with_id(9);
        assert_eq!(moved.id, 9);
        assert_eq!(moved.result, resp.result);
    }

    #[tokio::test]
    async fn responder_is_single_use() {
        let (req, rx) = RequestWithResponder::new(Request::new(
            1,
            Method::QueryStat,
            serde_json::json!({}),
        ));
        req.respond(Response::ok(1, Value::Null));
        assert!(rx.await.unwrap().is_ok());
    }
}
