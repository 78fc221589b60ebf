// Copyright (c) Lightnode, Inc.
// SPDX-License-Identifier: Apache-2.0

//! String-keyed byte store backing the watcher cursors and the legacy hash
//! mappings. Backends are swappable behind the trait; the node runs the
//! Redis one in production and the in-memory one everywhere else.

use crate::error::{LightnodeError, LightnodeResult};
use async_trait::async_trait;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> LightnodeResult<Option<Vec<u8>>>;
    async fn set(&self, key: &str, value: Vec<u8>) -> LightnodeResult<()>;
    async fn set_with_ttl(&self, key: &str, value: Vec<u8>, ttl: Duration) -> LightnodeResult<()>;
    async fn delete(&self, key: &str) -> LightnodeResult<()>;
}

/// Decimal-string u64 accessors, the wire form of watcher cursors.
pub async fn get_u64(store: &dyn KvStore, key: &str) -> LightnodeResult<Option<u64>> {
    match store.get(key).await? {
        None => Ok(None),
        Some(raw) => {
            let text = String::from_utf8(raw).map_err(|e| {
                LightnodeError::LogicViolation(format!("non-utf8 value under {key}: {e}"))
            })?;
            let value = text.parse::<u64>().map_err(|e| {
                LightnodeError::LogicViolation(format!("non-numeric value under {key}: {e}"))
            })?;
            Ok(Some(value))
        }
    }
}

pub async fn set_u64(store: &dyn KvStore, key: &str, value: u64) -> LightnodeResult<()> {
    store.set(key, value.to_string().into_bytes()).await
}

/// In-memory backend. Values written with a TTL expire lazily on read.
pub struct MemKv {
    entries: RwLock<HashMap<String, (Vec<u8>, Option<Instant>)>>,
}

impl MemKv {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl KvStore for MemKv {
    async fn get(&self, key: &str) -> LightnodeResult<Option<Vec<u8>>> {
        let entries = self.entries.read().await;
        match entries.get(key) {
            Some((_, Some(deadline))) if *deadline <= Instant::now() => Ok(None),
            Some((value, _)) => Ok(Some(value.clone())),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> LightnodeResult<()> {
        self.entries
            .write()
            .await
            .insert(key.to_string(), (value, None));
        Ok(())
    }

    async fn set_with_ttl(&self, key: &str, value: Vec<u8>, ttl: Duration) -> LightnodeResult<()> {
        self.entries
            .write()
            .await
            .insert(key.to_string(), (value, Some(Instant::now() + ttl)));
        Ok(())
    }

    async fn delete(&self, key: &str) -> LightnodeResult<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }
}

/// Redis backend over a multiplexed async connection.
pub struct RedisKv {
    conn: redis::aio::MultiplexedConnection,
}

impl RedisKv {
    pub async fn connect(url: &str) -> LightnodeResult<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| LightnodeError::FatalConfig(format!("invalid redis url: {e}")))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| LightnodeError::Persistence(format!("redis connect: {e}")))?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl KvStore for RedisKv {
    async fn get(&self, key: &str) -> LightnodeResult<Option<Vec<u8>>> {
        let mut conn = self.conn.clone();
        conn.get(key)
            .await
            .map_err(|e| LightnodeError::Persistence(format!("redis get {key}: {e}")))
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> LightnodeResult<()> {
        let mut conn = self.conn.clone();
        conn.set(key, value)
            .await
            .map_err(|e| LightnodeError::Persistence(format!("redis set {key}: {e}")))
    }

    async fn set_with_ttl(&self, key: &str, value: Vec<u8>, ttl: Duration) -> LightnodeResult<()> {
        let mut conn = self.conn.clone();
        conn.set_ex(key, value, ttl.as_secs().max(1))
            .await
            .map_err(|e| LightnodeError::Persistence(format!("redis setex {key}: {e}")))
    }

    async fn delete(&self, key: &str) -> LightnodeResult<()> {
        let mut conn = self.conn.clone();
        conn.del(key)
            .await
            .map_err(|e| LightnodeError::Persistence(format!("redis del {key}: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mem_kv_round_trip() {
        let kv = MemKv::new();
        assert_eq!(kv.get("missing").await.unwrap(), None);

        kv.set("a", b"hello".to_vec()).await.unwrap();
        assert_eq!(kv.get("a").await.unwrap(), Some(b"hello".to_vec()));

        kv.delete("a").await.unwrap();
        assert_eq!(kv.get("a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn mem_kv_expires() {
        let kv = MemKv::new();
        kv.set_with_ttl("short", b"x".to_vec(), Duration::from_millis(20))
            .await
            .unwrap();
        assert!(kv.get("short").await.unwrap().is_some());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(kv.get("short").await.unwrap(), None);
    }

    #[tokio::test]
    async fn u64_accessors_use_decimal_strings() {
        let kv = MemKv::new();
        set_u64(&kv, "cursor", 104).await.unwrap();
        assert_eq!(kv.get("cursor").await.unwrap(), Some(b"104".to_vec()));
        assert_eq!(get_u64(&kv, "cursor").await.unwrap(), Some(104));
        assert_eq!(get_u64(&kv, "absent").await.unwrap(), None);

        kv.set("cursor", b"not-a-number".to_vec()).await.unwrap();
        assert!(get_u64(&kv, "cursor").await.is_err());
    }
}
