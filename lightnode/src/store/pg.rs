// Copyright (c) Lightnode, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Postgres `TxStore` on diesel-async with a bb8 pool. The insert-if-absent
//! race is resolved by `ON CONFLICT DO NOTHING`; the status compare-and-set
//! is a filtered UPDATE over the legal predecessor statuses.

use super::{decode_input, decode_output, encode_input, encode_output, TxRecord, TxStore};
use crate::error::{LightnodeError, LightnodeResult};
use crate::tx::{Selector, Tx, TxOutput, TxStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_async::async_connection_wrapper::AsyncConnectionWrapper;
use diesel_async::pooled_connection::bb8::Pool;
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use ethers::types::H256;
use std::time::Duration;
use tracing::info;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

pub mod schema {
    diesel::table! {
        txs (hash) {
            hash -> Bytea,
            selector -> Text,
            input -> Bytea,
            output -> Nullable<Bytea>,
            status -> Int2,
            created_at -> Timestamptz,
            gateway -> Bool,
        }
    }
}

use schema::txs;

#[derive(Debug, Queryable, Insertable)]
#[diesel(table_name = txs)]
struct TxRow {
    hash: Vec<u8>,
    selector: String,
    input: Vec<u8>,
    output: Option<Vec<u8>>,
    status: i16,
    created_at: DateTime<Utc>,
    gateway: bool,
}

impl TxRow {
    fn from_tx(tx: &Tx, gateway: bool) -> LightnodeResult<Self> {
        Ok(Self {
            hash: tx.hash.as_bytes().to_vec(),
            selector: tx.selector.to_string(),
            input: encode_input(tx)?,
            output: tx
                .output
                .as_ref()
                .map(encode_output)
                .transpose()?,
            status: TxStatus::Pending.as_i16(),
            created_at: Utc::now(),
            gateway,
        })
    }

    fn into_record(self) -> LightnodeResult<TxRecord> {
        let selector: Selector = self.selector.parse()?;
        let (version, input) = decode_input(&self.input)?;
        let output = self.output.as_deref().map(decode_output).transpose()?;
        Ok(TxRecord {
            tx: Tx {
                hash: H256::from_slice(&self.hash),
                version,
                selector,
                input,
                output,
            },
            status: TxStatus::from_i16(self.status)?,
            created_at: self.created_at,
            gateway: self.gateway,
        })
    }
}

pub struct PgTxStore {
    pool: Pool<AsyncPgConnection>,
}

impl PgTxStore {
    /// Connect a pool and run pending migrations.
    pub async fn connect(database_url: &str, pool_size: u32) -> LightnodeResult<Self> {
        run_migrations(database_url).await?;
        let manager = AsyncDieselConnectionManager::<AsyncPgConnection>::new(database_url);
        let pool = Pool::builder()
            .max_size(pool_size)
            .build(manager)
            .await
            .map_err(|e| LightnodeError::FatalConfig(format!("database pool: {e}")))?;
        Ok(Self { pool })
    }

    async fn conn(
        &self,
    ) -> LightnodeResult<diesel_async::pooled_connection::bb8::PooledConnection<'_, AsyncPgConnection>>
    {
        self.pool
            .get()
            .await
            .map_err(|e| LightnodeError::Persistence(format!("database checkout: {e}")))
    }
}

async fn run_migrations(database_url: &str) -> LightnodeResult<()> {
    let conn = AsyncPgConnection::establish(database_url)
        .await
        .map_err(|e| LightnodeError::FatalConfig(format!("database connect: {e}")))?;
    let mut wrapper: AsyncConnectionWrapper<AsyncPgConnection> = conn.into();
    let versions = tokio::task::spawn_blocking(move || {
        wrapper
            .run_pending_migrations(MIGRATIONS)
            .map(|versions| versions.len())
            .map_err(|e| LightnodeError::FatalConfig(format!("migrations: {e}")))
    })
    .await
    .map_err(|e| LightnodeError::FatalConfig(format!("migration task: {e}")))??;
    if versions > 0 {
        info!("[store] applied {versions} database migrations");
    }
    Ok(())
}

fn persistence(e: diesel::result::Error) -> LightnodeError {
    LightnodeError::Persistence(e.to_string())
}

#[async_trait]
impl TxStore for PgTxStore {
    async fn insert(&self, tx: &Tx, gateway: bool) -> LightnodeResult<bool> {
        let row = TxRow::from_tx(tx, gateway)?;
        let mut conn = self.conn().await?;
        let inserted = diesel::insert_into(txs::table)
            .values(&row)
            .on_conflict(txs::hash)
            .do_nothing()
            .execute(&mut conn)
            .await
            .map_err(persistence)?;
        Ok(inserted > 0)
    }

    async fn get(&self, hash: H256) -> LightnodeResult<Option<TxRecord>> {
        let mut conn = self.conn().await?;
        let row: Option<TxRow> = txs::table
            .find(hash.as_bytes().to_vec())
            .first(&mut conn)
            .await
            .optional()
            .map_err(persistence)?;
        row.map(TxRow::into_record).transpose()
    }

    async fn list_by_status(
        &self,
        status: TxStatus,
        max_age: Option<Duration>,
        gateway: Option<bool>,
    ) -> LightnodeResult<Vec<TxRecord>> {
        let mut conn = self.conn().await?;
        let mut query = txs::table
            .filter(txs::status.eq(status.as_i16()))
            .into_boxed::<diesel::pg::Pg>();
        if let Some(age) = max_age {
            let cutoff = Utc::now()
                - chrono::Duration::from_std(age).unwrap_or_else(|_| chrono::Duration::zero());
            query = query.filter(txs::created_at.ge(cutoff));
        }
        if let Some(gateway) = gateway {
            query = query.filter(txs::gateway.eq(gateway));
        }
        let rows: Vec<TxRow> = query.load(&mut conn).await.map_err(persistence)?;
        rows.into_iter()
            .map(TxRow::into_record)
            .collect::<LightnodeResult<Vec<_>>>()
    }

    async fn update_status(&self, hash: H256, status: TxStatus) -> LightnodeResult<bool> {
        let predecessors: Vec<i16> = status
            .predecessors()
            .iter()
            .map(TxStatus::as_i16)
            .collect();
        let mut conn = self.conn().await?;
        let changed = diesel::update(
            txs::table
                .filter(txs::hash.eq(hash.as_bytes().to_vec()))
                .filter(txs::status.eq_any(predecessors)),
        )
        .set(txs::status.eq(status.as_i16()))
        .execute(&mut conn)
        .await
        .map_err(persistence)?;
        Ok(changed > 0)
    }

    async fn update_output(&self, hash: H256, output: &TxOutput) -> LightnodeResult<bool> {
        let raw = encode_output(output)?;
        let mut conn = self.conn().await?;
        let changed = diesel::update(txs::table.filter(txs::hash.eq(hash.as_bytes().to_vec())))
            .set(txs::output.eq(Some(raw)))
            .execute(&mut conn)
            .await
            .map_err(persistence)?;
        Ok(changed > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tx::hash::{nonce_bytes, tx_hash};
    use crate::tx::{ContractPayload, TxInput, Version};
    use ethers::types::{Bytes, U256};

    fn sample_tx() -> Tx {
        let selector: Selector = "BTC/toEthereum".parse().unwrap();
        let input = TxInput {
            txid: Bytes::from(vec![1u8; 32]),
            txindex: 0,
            amount: U256::from(5u64),
            payload: ContractPayload::default(),
            phash: Default::default(),
            to: "0x3333333333333333333333333333333333333333".to_string(),
            nonce: nonce_bytes(99),
            nhash: Default::default(),
            gpubkey: Bytes::default(),
            ghash: Default::default(),
        };
        Tx {
            hash: tx_hash(Version::V1, selector, &input),
            version: Version::V1,
            selector,
            input,
            output: None,
        }
    }

    #[test]
    fn row_round_trips_through_blobs() {
        let tx = sample_tx();
        let row = TxRow::from_tx(&tx, true).unwrap();
        let record = row.into_record().unwrap();
        assert_eq!(record.tx, tx);
        assert_eq!(record.status, TxStatus::Pending);
        assert!(record.gateway);
    }

    #[tokio::test]
    #[ignore] // Requires TEST_DATABASE_URL pointing at a scratch Postgres.
    async fn pg_insert_and_promote() {
        let url = std::env::var("TEST_DATABASE_URL").expect("TEST_DATABASE_URL must be set");
        let store = PgTxStore::connect(&url, 4).await.unwrap();
        let tx = sample_tx();

        assert!(store.insert(&tx, false).await.unwrap());
        assert!(!store.insert(&tx, false).await.unwrap());

        assert!(store
            .update_status(tx.hash, TxStatus::Confirming)
            .await
            .unwrap());
        assert!(!store
            .update_status(tx.hash, TxStatus::Confirming)
            .await
            .unwrap());

        let record = store.get(tx.hash).await.unwrap().unwrap();
        assert_eq!(record.status, TxStatus::Confirming);
    }
}
