// Copyright (c) Lightnode, Inc.
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

/// Errors surfaced by the lightnode pipeline.
///
/// Each variant maps onto one of the failure classes the node distinguishes:
/// bad requests, transient downstream failures, persistence failures, broken
/// invariants and unrecoverable configuration. `error_kind` returns a stable
/// label for metrics.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LightnodeError {
    /// The request shape is wrong: unknown selector, malformed input struct,
    /// disagreeing caller-supplied hash. No state was changed.
    #[error("invalid params: {0}")]
    InvalidParams(String),

    /// The transaction already exists; the stored record is authoritative.
    #[error("transaction {0} already exists")]
    AlreadyExists(String),

    /// A darknode or chain RPC failed or timed out. Retried on the next
    /// poll or by the aggregator's remaining peers.
    #[error("transient downstream error: {0}")]
    TransientDownstream(String),

    /// The store or cache is unavailable. The operation is abandoned and
    /// re-attempted on the next tick.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// An invariant broke (incorrectly stored address, empty registry where
    /// one is required). The offending record is skipped, never the loop.
    #[error("logic violation: {0}")]
    LogicViolation(String),

    /// Unparseable environment or missing keys. Aborts startup only.
    #[error("fatal config error: {0}")]
    FatalConfig(String),
}

impl LightnodeError {
    /// Stable label for metrics; lowercase with underscores only.
    pub fn error_kind(&self) -> &'static str {
        match self {
            LightnodeError::InvalidParams(_) => "invalid_params",
            LightnodeError::AlreadyExists(_) => "already_exists",
            LightnodeError::TransientDownstream(_) => "transient_downstream",
            LightnodeError::Persistence(_) => "persistence",
            LightnodeError::LogicViolation(_) => "logic_violation",
            LightnodeError::FatalConfig(_) => "fatal_config",
        }
    }

    /// The JSON-RPC error code this kind surfaces as.
    pub fn rpc_code(&self) -> i64 {
        match self {
            LightnodeError::InvalidParams(_) => crate::jsonrpc::ERR_INVALID_PARAMS,
            _ => crate::jsonrpc::ERR_INTERNAL,
        }
    }
}

pub type LightnodeResult<T> = Result<T, LightnodeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kinds_are_valid_metric_labels() {
        let errors = vec![
            LightnodeError::InvalidParams("x".to_string()),
            LightnodeError::AlreadyExists("x".to_string()),
            LightnodeError::TransientDownstream("x".to_string()),
            LightnodeError::Persistence("x".to_string()),
            LightnodeError::LogicViolation("x".to_string()),
            LightnodeError::FatalConfig("x".to_string()),
        ];
        for err in errors {
            let kind = err.error_kind();
            assert!(!kind.is_empty());
            assert!(kind.chars().all(|c| c.is_ascii_lowercase() || c == '_'));
            assert!(!kind.starts_with('_') && !kind.ends_with('_'));
        }
    }

    #[test]
    fn invalid_params_maps_to_rpc_code() {
        assert_eq!(
            LightnodeError::InvalidParams("bad".to_string()).rpc_code(),
            -32602
        );
        assert_eq!(
            LightnodeError::Persistence("down".to_string()).rpc_code(),
            -32603
        );
    }
}
