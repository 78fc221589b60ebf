// Copyright (c) Lightnode, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Gossip loop keeping the peer registry fresh: every poll it asks one
//! random known peer for its peer list and merges the answer. A failed round
//! is logged and skipped; the next tick retries.

use crate::jsonrpc::{self, Method, Request, ResponseQueryPeers};
use crate::registry::{parse_peer, PeerRegistry};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub struct Updater {
    registry: Arc<PeerRegistry>,
    client: jsonrpc::Client,
    poll_rate: Duration,
}

impl Updater {
    pub fn new(registry: Arc<PeerRegistry>, client: jsonrpc::Client, poll_rate: Duration) -> Self {
        Self {
            registry,
            client,
            poll_rate,
        }
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.poll_rate);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("[updater] cancelled");
                        return;
                    }
                    _ = interval.tick() => {
                        self.gossip_round().await;
                    }
                }
            }
        })
    }

    async fn gossip_round(&self) {
        let Some(peer) = self.registry.random(1).await.pop() else {
            warn!("[updater] registry is empty, nothing to gossip with");
            return;
        };

        let request = Request::new(
            rand::random::<u32>() as i64,
            Method::QueryPeers,
            json!({}),
        );
        let url = jsonrpc::peer_url(&peer.addr);
        match self.client.send(&url, &request).await {
            Ok(response) if response.is_ok() => {
                let parsed: Result<ResponseQueryPeers, _> =
                    serde_json::from_value(response.result.unwrap_or_default());
                match parsed {
                    Ok(body) => {
                        let mut merged = 0usize;
                        for endpoint in &body.peers {
                            match parse_peer(endpoint) {
                                Ok((id, addr)) => {
                                    self.registry.insert(id, addr).await;
                                    merged += 1;
                                }
                                Err(err) => {
                                    warn!("[updater] skipping bad peer {endpoint}: {err}");
                                }
                            }
                        }
                        // The peer that answered is alive regardless of what
                        // it returned.
                        self.registry.insert(peer.id, peer.addr).await;
                        debug!(
                            "[updater] merged {merged} peers from {url}, registry size {}",
                            self.registry.size().await
                        );
                    }
                    Err(err) => {
                        warn!("[updater] bad queryPeers result from {url}: {err}");
                    }
                }
            }
            Ok(response) => {
                warn!(
                    "[updater] queryPeers error from {url}: {:?}",
                    response.error
                );
            }
            Err(err) => {
                warn!("[updater] cannot reach {url}: {err}");
            }
        }

        self.registry.drop_stale().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MockDarknode;

    // Thirteen darknodes that each return the full address list; a registry
    // bootstrapped with four of them converges on all thirteen.
    #[tokio::test]
    async fn gossip_converges_on_the_full_peer_set() {
        let cancel = CancellationToken::new();
        let darknodes = MockDarknode::cluster(13).await;
        let endpoints: Vec<String> = darknodes.iter().map(|d| d.endpoint()).collect();
        for dn in &darknodes {
            dn.set_peers(endpoints.clone()).await;
        }

        let registry = Arc::new(
            PeerRegistry::new(&endpoints[..4], Duration::from_secs(60)).unwrap(),
        );
        let updater = Updater::new(
            registry.clone(),
            jsonrpc::Client::new(Duration::from_secs(1)),
            Duration::from_millis(100),
        );
        let handle = updater.spawn(cancel.clone());

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if registry.size().await == 13 {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "registry never converged, size {}",
                registry.size().await
            );
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        cancel.cancel();
        let _ = handle.await;
    }

    #[tokio::test]
    async fn unreachable_peer_does_not_stop_the_loop() {
        let cancel = CancellationToken::new();
        // One real darknode plus one dead bootstrap address.
        let darknodes = MockDarknode::cluster(1).await;
        let endpoints: Vec<String> = darknodes.iter().map(|d| d.endpoint()).collect();
        darknodes[0].set_peers(endpoints.clone()).await;

        let registry = Arc::new(
            PeerRegistry::new(
                &["127.0.0.1:1".to_string(), endpoints[0].clone()],
                Duration::from_secs(60),
            )
            .unwrap(),
        );
        let updater = Updater::new(
            registry.clone(),
            jsonrpc::Client::new(Duration::from_millis(200)),
            Duration::from_millis(50),
        );
        let handle = updater.spawn(cancel.clone());

        tokio::time::sleep(Duration::from_millis(400)).await;
        // Both bootstrap entries are still present; failures were ignored.
        assert!(registry.size().await >= 2);

        cancel.cancel();
        let _ = handle.await;
    }
}
