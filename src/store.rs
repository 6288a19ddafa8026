//! Read and write operations against the relational store.
//!
//! Every operation runs as its own statement/transaction. The payment ledger
//! is the only idempotent write (`tx_id` uniqueness); grain and feeding
//! updates are not, so the monitor invokes them at most once per new output.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::PgPool;

#[derive(Debug, Clone, Default, sqlx::FromRow)]
pub struct DeviceInfo {
    pub alias: Option<String>,
    pub stream_name: Option<String>,
}

/// One row of the payment ledger. `succeeded_at` is assigned server-side.
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentRecord {
    pub tx_id: String,
    pub address: String,
    pub amount_sats: i64,
    pub reference: String,
    pub description: String,
    pub euro_amount: Option<Decimal>,
    pub usd_amount: Option<Decimal>,
}

#[async_trait]
pub trait PaymentStore: Send + Sync {
    async fn lookup_username(&self, user_id: i32) -> Result<Option<String>>;
    async fn lookup_device(&self, device_id: i32) -> Result<Option<DeviceInfo>>;
    async fn lookup_device_feed_price(&self, device_id: i32) -> Result<Option<Decimal>>;
    async fn apply_grain_reward(&self, user_id: i32, grain_delta: i64) -> Result<()>;
    async fn apply_feeding(&self, device_id: i32, now: DateTime<Utc>) -> Result<()>;
    async fn insert_payment(&self, record: &PaymentRecord) -> Result<()>;
}

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PaymentStore for PgStore {
    async fn lookup_username(&self, user_id: i32) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT username FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .context("fetching username")?;
        Ok(row.map(|r| r.0))
    }

    async fn lookup_device(&self, device_id: i32) -> Result<Option<DeviceInfo>> {
        sqlx::query_as("SELECT alias, stream_name FROM devices WHERE id = $1")
            .bind(device_id)
            .fetch_optional(&self.pool)
            .await
            .context("fetching device")
    }

    async fn lookup_device_feed_price(&self, device_id: i32) -> Result<Option<Decimal>> {
        let row: Option<(Option<Decimal>,)> =
            sqlx::query_as("SELECT crypto_feed_price FROM devices WHERE id = $1")
                .bind(device_id)
                .fetch_optional(&self.pool)
                .await
                .context("fetching device feed price")?;
        Ok(row.and_then(|r| r.0))
    }

    async fn apply_grain_reward(&self, user_id: i32, grain_delta: i64) -> Result<()> {
        sqlx::query("UPDATE users SET grain_balance = COALESCE(grain_balance, 0) + $1 WHERE id = $2")
            .bind(grain_delta)
            .bind(user_id)
            .execute(&self.pool)
            .await
            .context("updating grain balance")?;
        Ok(())
    }

    async fn apply_feeding(&self, device_id: i32, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "UPDATE devices \
             SET total_feedings_today = COALESCE(total_feedings_today, 0) + 1, \
                 total_feedings = COALESCE(total_feedings, 0) + 1, \
                 last_feeding = $1 \
             WHERE id = $2",
        )
        .bind(now)
        .bind(device_id)
        .execute(&self.pool)
        .await
        .context("updating feeding counters")?;
        Ok(())
    }

    async fn insert_payment(&self, record: &PaymentRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO bchpayment \
             (tx_id, amount, reference, description, address, euro_amount, usd_amount, succeeded_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, NOW()) \
             ON CONFLICT (tx_id) DO NOTHING",
        )
        .bind(&record.tx_id)
        .bind(record.amount_sats)
        .bind(&record.reference)
        .bind(&record.description)
        .bind(&record.address)
        .bind(record.euro_amount)
        .bind(record.usd_amount)
        .execute(&self.pool)
        .await
        .context("inserting payment record")?;
        Ok(())
    }
}
