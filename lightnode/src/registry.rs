// Copyright (c) Lightnode, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The set of reachable darknodes: identity → network address, seeded from
//! the bootstrap list and refreshed by gossip. Bootstrap entries are pinned
//! so the registry can never gossip itself empty.

use crate::error::{LightnodeError, LightnodeResult};
use rand::seq::SliceRandom;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// Opaque 32-byte peer identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId(pub [u8; 32]);

impl PeerId {
    /// Identity for a peer that advertised only an address. Deterministic so
    /// repeated bootstrap parses agree.
    pub fn derive(addr: &str) -> Self {
        let digest = Sha256::digest(addr.as_bytes());
        let mut id = [0u8; 32];
        id.copy_from_slice(&digest);
        PeerId(id)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

#[derive(Debug, Clone)]
pub struct Peer {
    pub id: PeerId,
    pub addr: String,
    pub last_seen: Instant,
}

/// Parse a peer endpoint, either `hexid@host:port` or bare `host:port` (the
/// identity is then derived from the address).
pub fn parse_peer(endpoint: &str) -> LightnodeResult<(PeerId, String)> {
    match endpoint.split_once('@') {
        Some((id_hex, addr)) => {
            let raw = hex::decode(id_hex).map_err(|e| {
                LightnodeError::InvalidParams(format!("bad peer id in {endpoint}: {e}"))
            })?;
            let id: [u8; 32] = raw.try_into().map_err(|_| {
                LightnodeError::InvalidParams(format!("peer id in {endpoint} is not 32 bytes"))
            })?;
            Ok((PeerId(id), addr.to_string()))
        }
        None => Ok((PeerId::derive(endpoint), endpoint.to_string())),
    }
}

/// Wire form of a peer, `hexid@host:port`.
pub fn format_peer(id: PeerId, addr: &str) -> String {
    format!("{id}@{addr}")
}

struct Inner {
    peers: HashMap<PeerId, Peer>,
    bootstrap: HashSet<PeerId>,
}

pub struct PeerRegistry {
    inner: RwLock<Inner>,
    grace: Duration,
}

impl PeerRegistry {
    pub fn new(bootstrap_endpoints: &[String], grace: Duration) -> LightnodeResult<Self> {
        let mut peers = HashMap::new();
        let mut bootstrap = HashSet::new();
        for endpoint in bootstrap_endpoints {
            let (id, addr) = parse_peer(endpoint)?;
            bootstrap.insert(id);
            peers.insert(
                id,
                Peer {
                    id,
                    addr,
                    last_seen: Instant::now(),
                },
            );
        }
        Ok(Self {
            inner: RwLock::new(Inner { peers, bootstrap }),
            grace,
        })
    }

    /// Insert or refresh a peer. The entry keyed by the identity is
    /// overwritten, so a peer that moved address is updated in place.
    pub async fn insert(&self, id: PeerId, addr: String) {
        let mut inner = self.inner.write().await;
        inner.peers.insert(
            id,
            Peer {
                id,
                addr,
                last_seen: Instant::now(),
            },
        );
    }

    pub async fn size(&self) -> usize {
        self.inner.read().await.peers.len()
    }

    pub async fn snapshot(&self) -> Vec<Peer> {
        self.inner.read().await.peers.values().cloned().collect()
    }

    /// `k` peers chosen uniformly without replacement; all peers when `k`
    /// exceeds the registry size.
    pub async fn random(&self, k: usize) -> Vec<Peer> {
        let inner = self.inner.read().await;
        let peers: Vec<&Peer> = inner.peers.values().collect();
        let mut rng = rand::thread_rng();
        peers
            .choose_multiple(&mut rng, k.min(peers.len()))
            .map(|p| (*p).clone())
            .collect()
    }

    /// Drop peers unseen for longer than the grace period. Bootstrap peers
    /// are retained regardless.
    pub async fn drop_stale(&self) {
        let mut inner = self.inner.write().await;
        let grace = self.grace;
        let bootstrap = inner.bootstrap.clone();
        inner
            .peers
            .retain(|id, peer| bootstrap.contains(id) || peer.last_seen.elapsed() <= grace);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoints(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("127.0.0.1:{}", 19000 + i)).collect()
    }

    #[tokio::test]
    async fn bootstrap_seeds_the_registry() {
        let registry = PeerRegistry::new(&endpoints(4), Duration::from_secs(60)).unwrap();
        assert_eq!(registry.size().await, 4);
        assert_eq!(registry.snapshot().await.len(), 4);
    }

    #[tokio::test]
    async fn insert_overwrites_by_identity() {
        let registry = PeerRegistry::new(&[], Duration::from_secs(60)).unwrap();
        let id = PeerId([7u8; 32]);
        registry.insert(id, "10.0.0.1:5000".to_string()).await;
        registry.insert(id, "10.0.0.2:5000".to_string()).await;
        assert_eq!(registry.size().await, 1);
        assert_eq!(registry.snapshot().await[0].addr, "10.0.0.2:5000");
    }

    #[tokio::test]
    async fn random_is_without_replacement() {
        let registry = PeerRegistry::new(&endpoints(8), Duration::from_secs(60)).unwrap();
        let picked = registry.random(5).await;
        assert_eq!(picked.len(), 5);
        let ids: HashSet<_> = picked.iter().map(|p| p.id).collect();
        assert_eq!(ids.len(), 5);

        // Oversized k returns everything.
        assert_eq!(registry.random(100).await.len(), 8);
    }

    #[tokio::test]
    async fn stale_peers_drop_but_bootstrap_stays() {
        let registry = PeerRegistry::new(&endpoints(2), Duration::from_millis(10)).unwrap();
        registry
            .insert(PeerId([1u8; 32]), "10.0.0.9:5000".to_string())
            .await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        registry.drop_stale().await;
        // The gossiped peer aged out; the two bootstrap entries remain.
        assert_eq!(registry.size().await, 2);
    }

    #[test]
    fn endpoint_parsing_round_trips() {
        let id = PeerId([9u8; 32]);
        let formatted = format_peer(id, "127.0.0.1:18515");
        let (parsed_id, addr) = parse_peer(&formatted).unwrap();
        assert_eq!(parsed_id, id);
        assert_eq!(addr, "127.0.0.1:18515");

        let (derived, addr) = parse_peer("127.0.0.1:18515").unwrap();
        assert_eq!(derived, PeerId::derive("127.0.0.1:18515"));
        assert_eq!(addr, "127.0.0.1:18515");

        assert!(parse_peer("zz@127.0.0.1:18515").is_err());
    }
}
