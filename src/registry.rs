//! In-memory watch list, kept in sync with the `bch` table through
//! Postgres LISTEN/NOTIFY.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::Deserialize;
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use tokio::sync::watch;
use tokio::task::JoinHandle;

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// One row of the watch table. Exactly one of `user_id` / `device_id` is set.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct WatchedAddress {
    pub address: String,
    pub user_id: Option<i32>,
    pub device_id: Option<i32>,
    pub created_at: DateTime<Utc>,
    /// Sats minimum enforced during the grace window; only meaningful on
    /// user-linked rows, and implies `euro_amount`.
    pub threshold: Option<i64>,
    pub euro_amount: Option<Decimal>,
}

/// Change event published by the watch-table trigger.
#[derive(Debug, Deserialize)]
struct ChangeEvent {
    #[serde(default)]
    action: String,
    address: Option<String>,
    user_id: Option<i32>,
    device_id: Option<i32>,
    created_at: Option<String>,
    threshold: Option<i64>,
    euro_amount: Option<Decimal>,
}

#[derive(Debug, PartialEq, Eq)]
enum Applied {
    Upserted(String),
    Removed(String),
    NeedsReload,
}

pub struct AddressRegistry {
    pool: PgPool,
    channel: String,
    addresses: RwLock<HashMap<String, WatchedAddress>>,
}

impl AddressRegistry {
    pub fn new(pool: PgPool, channel: String) -> Self {
        Self {
            pool,
            channel,
            addresses: RwLock::new(HashMap::new()),
        }
    }

    /// Replace the in-memory map with a full snapshot of the watch table.
    pub async fn load_all(&self) -> Result<usize> {
        let rows: Vec<WatchedAddress> = sqlx::query_as(
            "SELECT address, user_id, device_id, created_at, threshold, euro_amount FROM bch",
        )
        .fetch_all(&self.pool)
        .await
        .context("loading watch table")?;

        let mut map = self.addresses.write();
        map.clear();
        for row in rows {
            map.insert(row.address.clone(), row);
        }
        Ok(map.len())
    }

    /// Point-in-time copy of the watch list.
    pub fn snapshot(&self) -> Vec<WatchedAddress> {
        self.addresses.read().values().cloned().collect()
    }

    pub fn get(&self, address: &str) -> Option<WatchedAddress> {
        self.addresses.read().get(address).cloned()
    }

    pub(crate) fn upsert(&self, row: WatchedAddress) {
        self.addresses.write().insert(row.address.clone(), row);
    }

    pub(crate) fn remove(&self, address: &str) {
        self.addresses.write().remove(address);
    }

    /// Spawn the notification listener. On channel errors the connection is
    /// dropped and rebuilt after a short delay; the in-memory map is kept, the
    /// monitor converges on its next sync tick.
    pub fn start(self: &Arc<Self>, mut stop: watch::Receiver<bool>) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                if *stop.borrow() {
                    return;
                }
                let mut listener = match PgListener::connect_with(&registry.pool).await {
                    Ok(l) => l,
                    Err(e) => {
                        tracing::warn!("registry listener connect failed: {e}");
                        if sleep_or_stop(RECONNECT_DELAY, &mut stop).await {
                            return;
                        }
                        continue;
                    }
                };
                if let Err(e) = listener.listen(&registry.channel).await {
                    tracing::warn!(channel = %registry.channel, "LISTEN failed: {e}");
                    if sleep_or_stop(RECONNECT_DELAY, &mut stop).await {
                        return;
                    }
                    continue;
                }
                tracing::info!(channel = %registry.channel, "listening for watch-table changes");

                loop {
                    tokio::select! {
                        _ = stop.changed() => {
                            tracing::debug!("registry listener stopping");
                            return;
                        }
                        msg = listener.recv() => match msg {
                            Ok(n) => registry.handle_notification(n.payload()).await,
                            Err(e) => {
                                tracing::warn!("notification channel error: {e}");
                                break;
                            }
                        }
                    }
                }

                drop(listener);
                if sleep_or_stop(RECONNECT_DELAY, &mut stop).await {
                    return;
                }
            }
        })
    }

    async fn handle_notification(&self, payload: &str) {
        tracing::debug!(payload, "watch-table notification");
        match self.apply_payload(payload) {
            Applied::Upserted(address) => tracing::info!(%address, "watch list upsert"),
            Applied::Removed(address) => tracing::info!(%address, "watch list removal"),
            Applied::NeedsReload => {
                if let Err(e) = self.load_all().await {
                    tracing::warn!("fallback reload of watch table failed: {e}");
                }
            }
        }
    }

    /// Apply one change payload to the map. Anything that cannot be applied
    /// precisely degrades to a full reload.
    fn apply_payload(&self, payload: &str) -> Applied {
        let event: ChangeEvent = match serde_json::from_str(payload) {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!("invalid change payload ({e}): {payload}");
                return Applied::NeedsReload;
            }
        };

        let action = event.action.to_ascii_uppercase();
        match (action.as_str(), event.address) {
            ("INSERT" | "UPDATE", Some(address)) => {
                // A payload without created_at (a plain threshold or amount
                // edit) must not move the grace-window anchor: keep the
                // stored instant, and anchor at now only for rows we have
                // never seen.
                let created_at = parse_created_at(event.created_at.as_deref())
                    .or_else(|| self.get(&address).map(|row| row.created_at))
                    .unwrap_or_else(Utc::now);
                self.upsert(WatchedAddress {
                    address: address.clone(),
                    user_id: event.user_id,
                    device_id: event.device_id,
                    created_at,
                    threshold: event.threshold,
                    euro_amount: event.euro_amount,
                });
                Applied::Upserted(address)
            }
            ("DELETE", Some(address)) => {
                self.remove(&address);
                Applied::Removed(address)
            }
            _ => {
                tracing::warn!(action = %event.action, "unrecognized change event, reloading watch table");
                Applied::NeedsReload
            }
        }
    }
}

/// Parse the trigger's `created_at` rendering. Triggers built on
/// `row_to_json` emit RFC 3339; plain `to_char` setups emit a bare
/// timestamp, which is taken as UTC. Absent or unparseable values yield
/// `None` so the caller can keep whatever instant it already has.
fn parse_created_at(raw: Option<&str>) -> Option<DateTime<Utc>> {
    let raw = raw?;
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(naive.and_utc());
        }
    }
    tracing::warn!(raw, "unparseable created_at in change event, keeping previous value");
    None
}

async fn sleep_or_stop(delay: Duration, stop: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        _ = stop.changed() => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::lazy_pool;

    fn registry() -> AddressRegistry {
        AddressRegistry::new(lazy_pool(), "bch_table_changes".to_string())
    }

    #[tokio::test]
    async fn insert_update_delete_roundtrip() {
        let reg = registry();

        let applied = reg.apply_payload(
            r#"{"action":"INSERT","address":"bitcoincash:qq1","user_id":7,
                "created_at":"2026-08-01T10:00:00+00:00","threshold":200000,"euro_amount":"10.00"}"#,
        );
        assert_eq!(applied, Applied::Upserted("bitcoincash:qq1".to_string()));

        let row = reg.get("bitcoincash:qq1").unwrap();
        assert_eq!(row.user_id, Some(7));
        assert_eq!(row.threshold, Some(200_000));
        assert_eq!(row.euro_amount, Some(Decimal::new(1000, 2)));

        let applied = reg.apply_payload(
            r#"{"action":"update","address":"bitcoincash:qq1","user_id":7,"threshold":50000}"#,
        );
        assert_eq!(applied, Applied::Upserted("bitcoincash:qq1".to_string()));
        assert_eq!(reg.get("bitcoincash:qq1").unwrap().threshold, Some(50_000));

        let applied = reg.apply_payload(r#"{"action":"DELETE","address":"bitcoincash:qq1"}"#);
        assert_eq!(applied, Applied::Removed("bitcoincash:qq1".to_string()));
        assert!(reg.get("bitcoincash:qq1").is_none());
    }

    #[tokio::test]
    async fn malformed_payloads_degrade_to_reload() {
        let reg = registry();
        assert_eq!(reg.apply_payload("not json"), Applied::NeedsReload);
        assert_eq!(
            reg.apply_payload(r#"{"action":"TRUNCATE"}"#),
            Applied::NeedsReload
        );
        // Valid action but no address to apply it to.
        assert_eq!(
            reg.apply_payload(r#"{"action":"INSERT","user_id":7}"#),
            Applied::NeedsReload
        );
    }

    #[tokio::test]
    async fn snapshot_is_an_independent_copy() {
        let reg = registry();
        reg.upsert(WatchedAddress {
            address: "bitcoincash:qq2".to_string(),
            user_id: None,
            device_id: Some(3),
            created_at: Utc::now(),
            threshold: None,
            euro_amount: None,
        });

        let mut snap = reg.snapshot();
        assert_eq!(snap.len(), 1);
        snap.clear();
        assert!(reg.get("bitcoincash:qq2").is_some());
    }

    #[test]
    fn created_at_parsing_accepts_common_renderings() {
        let rfc = parse_created_at(Some("2026-08-01T10:00:00+02:00")).unwrap();
        assert_eq!(rfc.to_rfc3339(), "2026-08-01T08:00:00+00:00");

        let naive = parse_created_at(Some("2026-08-01 10:00:00.123")).unwrap();
        assert_eq!(naive.timestamp(), rfc.timestamp() + 7200);

        // Absent and unparseable values both leave the choice to the caller.
        assert_eq!(parse_created_at(None), None);
        assert_eq!(parse_created_at(Some("yesterday-ish")), None);
    }

    #[tokio::test]
    async fn update_without_created_at_keeps_grace_window_anchor() {
        let reg = registry();
        reg.apply_payload(
            r#"{"action":"INSERT","address":"bitcoincash:qq3","user_id":7,
                "created_at":"2026-08-01T10:00:00+00:00","threshold":200000,"euro_amount":"10.00"}"#,
        );
        let anchor = reg.get("bitcoincash:qq3").unwrap().created_at;

        // A plain threshold edit omits created_at; the stored anchor must
        // survive so the address does not look freshly created.
        reg.apply_payload(
            r#"{"action":"UPDATE","address":"bitcoincash:qq3","user_id":7,"threshold":50000}"#,
        );
        let row = reg.get("bitcoincash:qq3").unwrap();
        assert_eq!(row.created_at, anchor);
        assert_eq!(row.threshold, Some(50_000));

        // A row never seen before and carrying no created_at anchors at now.
        reg.apply_payload(r#"{"action":"INSERT","address":"bitcoincash:qq4","user_id":8}"#);
        let fresh = reg.get("bitcoincash:qq4").unwrap().created_at;
        assert!((Utc::now() - fresh).num_seconds().abs() < 5);
    }
}
