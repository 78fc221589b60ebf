// Copyright (c) Lightnode, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Durable store for cross-chain transactions. One logical table keyed by
//! the content hash; the hash is the dedup key and status transitions are
//! guarded by the state machine in [`crate::tx::TxStatus`].

pub mod memory;
pub mod pg;

use crate::error::{LightnodeError, LightnodeResult};
use crate::tx::{Tx, TxInput, TxOutput, TxStatus, Version};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ethers::types::H256;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A stored transaction together with its pipeline state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxRecord {
    pub tx: Tx,
    pub status: TxStatus,
    pub created_at: DateTime<Utc>,
    pub gateway: bool,
}

#[async_trait]
pub trait TxStore: Send + Sync {
    /// Insert a new record with status `pending`. Returns `false` when a
    /// record with the same hash already exists (the insert is a no-op).
    async fn insert(&self, tx: &Tx, gateway: bool) -> LightnodeResult<bool>;

    async fn get(&self, hash: H256) -> LightnodeResult<Option<TxRecord>>;

    /// Records in `status`, optionally no older than `max_age`, optionally
    /// filtered by the gateway flag.
    async fn list_by_status(
        &self,
        status: TxStatus,
        max_age: Option<Duration>,
        gateway: Option<bool>,
    ) -> LightnodeResult<Vec<TxRecord>>;

    /// Advance a record to `status`. The update only applies when the
    /// current status is a legal predecessor, which makes the call
    /// idempotent and forward-only. Returns whether a row changed.
    async fn update_status(&self, hash: H256, status: TxStatus) -> LightnodeResult<bool>;

    /// Attach the darknode-produced output to a record.
    async fn update_output(&self, hash: H256, output: &TxOutput) -> LightnodeResult<bool>;
}

/// The opaque blob stored in the `input` column: the wire version travels
/// with the input because the content hash covers both.
#[derive(Debug, Serialize, Deserialize)]
struct StoredInput {
    version: Version,
    #[serde(rename = "in")]
    input: TxInput,
}

pub(crate) fn encode_input(tx: &Tx) -> LightnodeResult<Vec<u8>> {
    serde_json::to_vec(&StoredInput {
        version: tx.version,
        input: tx.input.clone(),
    })
    .map_err(|e| LightnodeError::Persistence(format!("encode input: {e}")))
}

pub(crate) fn decode_input(raw: &[u8]) -> LightnodeResult<(Version, TxInput)> {
    let stored: StoredInput = serde_json::from_slice(raw)
        .map_err(|e| LightnodeError::LogicViolation(format!("stored input undecodable: {e}")))?;
    Ok((stored.version, stored.input))
}

pub(crate) fn encode_output(output: &TxOutput) -> LightnodeResult<Vec<u8>> {
    serde_json::to_vec(output)
        .map_err(|e| LightnodeError::Persistence(format!("encode output: {e}")))
}

pub(crate) fn decode_output(raw: &[u8]) -> LightnodeResult<TxOutput> {
    serde_json::from_slice(raw)
        .map_err(|e| LightnodeError::LogicViolation(format!("stored output undecodable: {e}")))
}
