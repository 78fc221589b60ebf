// Copyright (c) Lightnode, Inc.
// SPDX-License-Identifier: Apache-2.0

//! In-memory `TxStore`, used by tests and by nodes running without a
//! database. Single map under a RwLock; the insert-if-absent and the status
//! compare-and-set both happen under the write lock.

use super::{TxRecord, TxStore};
use crate::error::LightnodeResult;
use crate::tx::{Tx, TxOutput, TxStatus};
use async_trait::async_trait;
use chrono::Utc;
use ethers::types::H256;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;

pub struct MemTxStore {
    rows: RwLock<HashMap<H256, TxRecord>>,
}

impl MemTxStore {
    pub fn new() -> Self {
        Self {
            rows: RwLock::new(HashMap::new()),
        }
    }

    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }
}

#[async_trait]
impl TxStore for MemTxStore {
    async fn insert(&self, tx: &Tx, gateway: bool) -> LightnodeResult<bool> {
        let mut rows = self.rows.write().await;
        if rows.contains_key(&tx.hash) {
            return Ok(false);
        }
        rows.insert(
            tx.hash,
            TxRecord {
                tx: tx.clone(),
                status: TxStatus::Pending,
                created_at: Utc::now(),
                gateway,
            },
        );
        Ok(true)
    }

    async fn get(&self, hash: H256) -> LightnodeResult<Option<TxRecord>> {
        Ok(self.rows.read().await.get(&hash).cloned())
    }

    async fn list_by_status(
        &self,
        status: TxStatus,
        max_age: Option<Duration>,
        gateway: Option<bool>,
    ) -> LightnodeResult<Vec<TxRecord>> {
        let cutoff = max_age.map(|age| {
            Utc::now() - chrono::Duration::from_std(age).unwrap_or(chrono::Duration::zero())
        });
        let rows = self.rows.read().await;
        Ok(rows
            .values()
            .filter(|r| r.status == status)
            .filter(|r| cutoff.map_or(true, |c| r.created_at >= c))
            .filter(|r| gateway.map_or(true, |g| r.gateway == g))
            .cloned()
            .collect())
    }

    async fn update_status(&self, hash: H256, status: TxStatus) -> LightnodeResult<bool> {
        let mut rows = self.rows.write().await;
        match rows.get_mut(&hash) {
            Some(record) if record.status.can_transition_to(status) => {
                record.status = status;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn update_output(&self, hash: H256, output: &TxOutput) -> LightnodeResult<bool> {
        let mut rows = self.rows.write().await;
        match rows.get_mut(&hash) {
            Some(record) => {
                record.tx.output = Some(output.clone());
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
