// Copyright (c) Lightnode, Inc.
// SPDX-License-Identifier: Apache-2.0

//! One watcher per (host chain, selector): lifts gateway burn events into
//! synthetic `submitTx` submissions. The durable cursor only advances after
//! a whole batch ingested, and never into the reorg-exposed zone near the
//! head; re-ingestion after a failed batch is harmless because the resolver
//! deduplicates by content hash.

use crate::chain::{BurnEvent, BurnLogFetcher, ChainHead};
use crate::codec::{base58_fallback, AddressCodec};
use crate::error::{LightnodeError, LightnodeResult};
use crate::kv::{self, KvStore};
use crate::metrics::NodeMetrics;
use crate::resolver::TxChecker;
use crate::tx::hash::{ghash, legacy_burn_hash, nhash, nonce_bytes, phash, shash, tx_hash};
use crate::tx::{ContractPayload, Selector, Tx, TxInput, Version};
use ethers::types::{Bytes, H256, U256};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const DEFAULT_MAX_ADVANCE: u64 = 1000;
const DEFAULT_CONFIDENCE_INTERVAL: u64 = 6;

pub struct Watcher {
    selector: Selector,
    fetcher: Arc<dyn BurnLogFetcher>,
    host: Arc<dyn ChainHead>,
    checker: Arc<TxChecker>,
    kv: Arc<dyn KvStore>,
    codec: Arc<dyn AddressCodec>,
    gpubkey: Bytes,
    poll_rate: Duration,
    max_advance: u64,
    confidence_interval: u64,
    metrics: Arc<NodeMetrics>,
}

impl Watcher {
    pub fn new(
        selector: Selector,
        fetcher: Arc<dyn BurnLogFetcher>,
        host: Arc<dyn ChainHead>,
        checker: Arc<TxChecker>,
        kv: Arc<dyn KvStore>,
        codec: Arc<dyn AddressCodec>,
        gpubkey: Bytes,
        poll_rate: Duration,
        metrics: Arc<NodeMetrics>,
    ) -> Self {
        Self {
            selector,
            fetcher,
            host,
            checker,
            kv,
            codec,
            gpubkey,
            poll_rate,
            max_advance: DEFAULT_MAX_ADVANCE,
            confidence_interval: DEFAULT_CONFIDENCE_INTERVAL,
            metrics,
        }
    }

    #[cfg(test)]
    fn with_confidence_interval(mut self, blocks: u64) -> Self {
        self.confidence_interval = blocks;
        self
    }

    /// Durable cursor key for this selector.
    fn cursor_key(&self) -> String {
        format!("{}_lastCheckedBlock", self.selector)
    }

    fn count_error(&self, err: &LightnodeError) {
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
                        debug!("[watcher] {} cancelled", self.selector);
                        return;
                    }
                    _ = interval.tick() => {
                        // The batch must not outlive its poll slot.
                        if tokio::time::timeout(self.poll_rate, self.watch_once())
                            .await
                            .is_err()
                        {
                            warn!("[watcher] {} batch timed out", self.selector);
                        }
                    }
                }
            }
        })
    }

    /// One ingestion round.
    pub async fn watch_once(&self) {
        let head = match self.host.current_height().await {
            Ok(head) => head,
            Err(err) => {
                error!("[watcher] {} cannot read chain head: {err}", self.selector);
                self.count_error(&err);
                return;
            }
        };
        let last = match self.last_checked_block(head).await {
            Ok(last) => last,
            Err(err) => {
                error!(
                    "[watcher] {} cannot load last checked block: {err}",
                    self.selector
                );
                self.count_error(&err);
                return;
            }
        };

        if head <= last {
            // A rewound or resyncing node; never walk backwards.
            warn!(
                "[watcher] {} head {head} behind cursor {last}, skipping",
                self.selector
            );
            return;
        }

        // Bound the batch and keep out of the reorg-exposed zone.
        let target = head
            .min(last + self.max_advance)
            .saturating_sub(self.confidence_interval);
        if target <= last {
            debug!(
                "[watcher] {} nothing deep enough to process (head {head}, cursor {last})",
                self.selector
            );
            return;
        }

        let events = match self.fetcher.fetch_burn_logs(last, target).await {
            Ok(events) => events,
            Err(err) => {
                error!(
                    "[watcher] {} cannot fetch burn logs ({last}, {target}]: {err}",
                    self.selector
                );
                self.count_error(&err);
                return;
            }
        };

        for event in &events {
            info!(
                "[watcher] {} burn detected (to={}, amount={}, nonce={})",
                self.selector,
                event.to_string_lossy(),
                event.amount,
                event.nonce
            );
            let tx = match self.burn_to_tx(event) {
                Ok(tx) => tx,
                Err(err) => {
                    // A malformed burn can never become valid; skipping it
                    // keeps the cursor moving.
                    error!(
                        "[watcher] {} cannot build tx from burn nonce={}: {err}",
                        self.selector, event.nonce
                    );
                    self.count_error(&err);
                    continue;
                }
            };
            if let Err(err) = self.write_legacy_mappings(&tx, event.nonce).await {
                error!("[watcher] {} cannot write legacy mapping: {err}", self.selector);
                self.count_error(&err);
                return;
            }
            match self.checker.check_and_store(tx, false).await {
                Ok(stored) => {
                    debug!("[watcher] {} ingested burn as {}", self.selector, stored.hash);
                    self.metrics
                        .watcher_burns_ingested
                        .with_label_values(&[&self.selector.to_string()])
                        .inc();
                }
                Err(err @ LightnodeError::Persistence(_)) => {
                    // The store is unhealthy; abandon the batch so the
                    // cursor stays put and the whole range is re-fetched.
                    error!("[watcher] {} cannot persist burn: {err}", self.selector);
                    self.count_error(&err);
                    return;
                }
                Err(err) => {
                    error!(
                        "[watcher] {} invalid burn nonce={}: {err}",
                        self.selector, event.nonce
                    );
                    self.count_error(&err);
                    continue;
                }
            }
        }

        if let Err(err) = kv::set_u64(self.kv.as_ref(), &self.cursor_key(), target).await {
            error!(
                "[watcher] {} cannot persist cursor {target}: {err}",
                self.selector
            );
            self.count_error(&err);
            return;
        }
        self.metrics
            .watcher_last_block
            .with_label_values(&[&self.selector.to_string()])
            .set(target as i64);
    }

    async fn last_checked_block(&self, head: u64) -> LightnodeResult<u64> {
        match kv::get_u64(self.kv.as_ref(), &self.cursor_key()).await? {
            Some(last) => Ok(last),
            None => {
                warn!(
                    "[watcher] {} cursor not initialised, starting at {}",
                    self.selector,
                    head.saturating_sub(1)
                );
                let start = head.saturating_sub(1);
                kv::set_u64(self.kv.as_ref(), &self.cursor_key(), start).await?;
                Ok(start)
            }
        }
    }

    /// Construct the synthetic submission for a burn. Recipients that fail
    /// to decode as a modern address string are retried as base58-encoded
    /// legacy payloads, and the transaction is tagged version 0.
    fn burn_to_tx(&self, event: &BurnEvent) -> LightnodeResult<Tx> {
        let destination = self.selector.destination();
        let (to, version) = match std::str::from_utf8(&event.to) {
            Ok(s) if self.codec.decode(destination, s).is_ok() => (s.to_string(), Version::V1),
            _ => {
                let fallback = base58_fallback(&event.to);
                self.codec.decode(destination, &fallback)?;
                (fallback, Version::V0)
            }
        };
        let to_decoded = self.codec.decode(destination, &to)?;

        let nonce = nonce_bytes(event.nonce);
        let payload = ContractPayload::default();
        let p = phash(&payload.value);
        let n = nhash(nonce, &event.txid, 0);
        let g = ghash(p, shash(self.selector), &to_decoded, nonce);
        let input = TxInput {
            txid: Bytes::from(event.txid.clone()),
            txindex: 0,
            amount: event.amount,
            payload,
            phash: p,
            to,
            nonce,
            nhash: n,
            gpubkey: self.gpubkey.clone(),
            ghash: g,
        };
        Ok(Tx {
            hash: tx_hash(version, self.selector, &input),
            version,
            selector: self.selector,
            input,
            output: None,
        })
    }

    /// Cross-reference the legacy identifier with the current hash so old
    /// clients can still query by it. Written at synthesis time because the
    /// submission RPC itself no longer carries the data to reconstruct it.
    async fn write_legacy_mappings(&self, tx: &Tx, nonce: u64) -> LightnodeResult<()> {
        let legacy = legacy_burn_hash(self.selector, U256::from(nonce));
        self.kv
            .set(&format!("{legacy:?}"), format!("{:?}", tx.hash).into_bytes())
            .await?;
        self.kv
            .set(
                &format!("{}_{nonce}", self.selector),
                format!("{legacy:?}").into_bytes(),
            )
            .await?;
        Ok(())
    }
}
