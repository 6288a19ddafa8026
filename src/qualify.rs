//! Payment qualification: decides whether a freshly observed output counts
//! as a completed payment and applies the business-side writes.
//!
//! User-linked addresses run through the grace-window / tiered-reward rules;
//! device-linked addresses are gated by a price-derived sats threshold before
//! their feeding counters move. Both branches always end in a ledger insert.

use std::fmt;
use std::sync::Arc;

use chrono::{Duration, Utc};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;

use crate::electrum::Unspent;
use crate::oracle::PriceOracle;
use crate::registry::WatchedAddress;
use crate::store::{PaymentRecord, PaymentStore};

const SATS_PER_BCH: i64 = 100_000_000;
/// Minutes after address creation during which a configured sats threshold
/// and EUR amount supersede live-price computation.
const GRACE_WINDOW_MINUTES: i64 = 30;
/// Device payments may come in up to 5% below the derived threshold.
const DEVICE_MARGIN_PERCENT: i64 = 95;

/// Identity of a single unspent output.
pub type UtxoKey = (String, u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentStatus {
    Confirmed,
    Unconfirmed,
    Unknown,
}

impl PaymentStatus {
    pub fn from_height(height: i64) -> Self {
        if height == 0 {
            PaymentStatus::Unconfirmed
        } else if height > 0 {
            PaymentStatus::Confirmed
        } else {
            PaymentStatus::Unknown
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PaymentStatus::Confirmed => "confirmed",
            PaymentStatus::Unconfirmed => "unconfirmed",
            PaymentStatus::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// A newly observed output on a watched address.
#[derive(Debug, Clone)]
pub struct PaymentEvent {
    pub address: String,
    pub tx_hash: String,
    pub tx_pos: u32,
    pub value_sats: i64,
    pub height: i64,
    pub status: PaymentStatus,
}

impl PaymentEvent {
    pub fn from_unspent(address: &str, utxo: &Unspent) -> Self {
        Self {
            address: address.to_string(),
            tx_hash: utxo.tx_hash.clone(),
            tx_pos: utxo.tx_pos,
            value_sats: utxo.value,
            height: utxo.height,
            status: PaymentStatus::from_height(utxo.height),
        }
    }

    pub fn value_bch(&self) -> f64 {
        self.value_sats as f64 / SATS_PER_BCH as f64
    }
}

/// EUR-tiered grain multiplier.
fn grain_multiplier(eur: Decimal) -> Decimal {
    if eur < Decimal::from(20) {
        Decimal::from(4)
    } else if eur < Decimal::from(50) {
        Decimal::from(5)
    } else {
        Decimal::from(6)
    }
}

/// Grain credited for a payment worth `eur`, rounded up to a whole unit.
pub(crate) fn grain_reward(eur: Decimal) -> i64 {
    (eur * grain_multiplier(eur)).ceil().to_i64().unwrap_or(0)
}

/// Fiat value of `value_sats` at `price` per BCH. Unrounded; the ledger
/// insert rounds to cents.
fn fiat_value(value_sats: i64, price: f64) -> Option<Decimal> {
    let price = Decimal::from_f64(price)?;
    Some(Decimal::from(value_sats) * price / Decimal::from(SATS_PER_BCH))
}

/// Sats equivalent of a device's EUR feed price. A missing or zero spot
/// price collapses to 0, i.e. the gate is disabled.
pub(crate) fn device_threshold_sats(feed_price_eur: Decimal, price_eur: f64) -> i64 {
    let Some(price) = Decimal::from_f64(price_eur).filter(|p| *p > Decimal::ZERO) else {
        return 0;
    };
    (feed_price_eur / price * Decimal::from(SATS_PER_BCH))
        .floor()
        .to_i64()
        .unwrap_or(0)
}

pub(crate) fn effective_device_threshold(threshold_sats: i64) -> i64 {
    (threshold_sats * DEVICE_MARGIN_PERCENT / 100).max(0)
}

fn default_description(event: &PaymentEvent) -> String {
    format!(
        "Auto-detected payment to {} ({}:{})",
        event.address, event.tx_hash, event.tx_pos
    )
}

/// Applies the qualification pipeline and the resulting store writes.
pub struct PaymentProcessor {
    store: Arc<dyn PaymentStore>,
    oracle: Arc<PriceOracle>,
}

impl PaymentProcessor {
    pub fn new(store: Arc<dyn PaymentStore>, oracle: Arc<PriceOracle>) -> Self {
        Self { store, oracle }
    }

    /// Qualify one new output and persist whatever it earns. Store failures
    /// are logged, never propagated: losing a grain update must not lose the
    /// ledger entry, and vice versa.
    pub async fn process(&self, row: &WatchedAddress, event: &PaymentEvent) {
        match (row.user_id, row.device_id) {
            (Some(user_id), _) => self.handle_user_payment(user_id, row, event).await,
            (None, Some(device_id)) => self.handle_device_candidate(device_id, event).await,
            (None, None) => {
                tracing::warn!(address = %row.address, "watched address linked to neither user nor device");
            }
        }
    }

    async fn handle_user_payment(&self, user_id: i32, row: &WatchedAddress, event: &PaymentEvent) {
        self.log_detected(event);
        let username = match self.store.lookup_username(user_id).await {
            Ok(u) => u,
            Err(e) => {
                tracing::warn!("failed to fetch username for user {user_id}: {e}");
                None
            }
        };
        let display_name = username.unwrap_or_else(|| format!("user {user_id}"));
        let reference = user_id.to_string();
        let mut description = default_description(event);
        let mut euro_amount = None;
        let mut usd_amount = None;

        let in_window = Utc::now() - row.created_at < Duration::minutes(GRACE_WINDOW_MINUTES);
        let threshold_met = row
            .threshold
            .filter(|t| *t > 0)
            .is_some_and(|t| event.value_sats >= t);
        // Inside the window with the threshold met, the configured EUR amount
        // is authoritative; everything else falls back to the live price.
        let configured = if in_window && threshold_met {
            row.euro_amount.filter(|e| *e > Decimal::ZERO)
        } else {
            None
        };

        match configured.or_else(|| {
            self.oracle
                .eur()
                .and_then(|price| fiat_value(event.value_sats, price))
        }) {
            Some(eur) => {
                euro_amount = Some(eur);
                usd_amount = self
                    .oracle
                    .usd()
                    .and_then(|price| fiat_value(event.value_sats, price));
                let delta = grain_reward(eur);
                match self.store.apply_grain_reward(user_id, delta).await {
                    Ok(()) => description = format!("{display_name} (+{delta} grain)"),
                    Err(e) => {
                        tracing::warn!("failed to update grain balance for user {user_id}: {e}")
                    }
                }
            }
            None => {
                tracing::warn!("skipping grain balance update: BCH/EUR price unavailable");
            }
        }

        self.insert_record(event, reference, description, euro_amount, usd_amount)
            .await;
    }

    async fn handle_device_candidate(&self, device_id: i32, event: &PaymentEvent) {
        let feed_price = match self.store.lookup_device_feed_price(device_id).await {
            Ok(p) => p,
            Err(e) => {
                // Cannot price the gate; process rather than drop the payment.
                tracing::warn!("failed to fetch crypto feed price for device {device_id}: {e}");
                None
            }
        };

        if let Some(feed_price) = feed_price {
            let threshold = self
                .oracle
                .eur()
                .map(|price| device_threshold_sats(feed_price, price))
                .unwrap_or(0);
            let effective = effective_device_threshold(threshold);
            if event.value_sats < effective {
                tracing::debug!(
                    address = %event.address,
                    sats = event.value_sats,
                    effective,
                    "below effective device threshold, ignoring"
                );
                return;
            }
        }

        self.record_device_payment(device_id, event).await;
    }

    async fn record_device_payment(&self, device_id: i32, event: &PaymentEvent) {
        self.log_detected(event);
        let euro_amount = self
            .oracle
            .eur()
            .and_then(|price| fiat_value(event.value_sats, price));
        let usd_amount = self
            .oracle
            .usd()
            .and_then(|price| fiat_value(event.value_sats, price));

        let device = match self.store.lookup_device(device_id).await {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!("failed to fetch alias for device {device_id}: {e}");
                None
            }
        }
        .unwrap_or_default();

        let reference = device.alias.unwrap_or_else(|| device_id.to_string());
        let description = match device.stream_name {
            Some(stream) => format!("Direct payment to {stream}"),
            None => default_description(event),
        };

        if let Err(e) = self.store.apply_feeding(device_id, Utc::now()).await {
            tracing::warn!("failed to update feeding counters for device {device_id}: {e}");
        }

        self.insert_record(event, reference, description, euro_amount, usd_amount)
            .await;
    }

    fn log_detected(&self, event: &PaymentEvent) {
        tracing::info!(
            address = %event.address,
            tx = %event.tx_hash,
            pos = event.tx_pos,
            sats = event.value_sats,
            status = %event.status,
            "🚨 payment detected"
        );
    }

    async fn insert_record(
        &self,
        event: &PaymentEvent,
        reference: String,
        description: String,
        euro_amount: Option<Decimal>,
        usd_amount: Option<Decimal>,
    ) {
        let record = PaymentRecord {
            tx_id: event.tx_hash.clone(),
            address: event.address.clone(),
            amount_sats: event.value_sats,
            reference,
            description,
            euro_amount: euro_amount.map(|d| d.round_dp(2)),
            usd_amount: usd_amount.map(|d| d.round_dp(2)),
        };
        if let Err(e) = self.store.insert_payment(&record).await {
            tracing::warn!(tx_id = %record.tx_id, "failed to insert payment record: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MemStore;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn oracle_with(eur: Option<f64>, usd: Option<f64>) -> Arc<PriceOracle> {
        let oracle = Arc::new(PriceOracle::new(reqwest::Client::new()));
        oracle.update(eur, usd);
        oracle
    }

    fn user_row(minutes_old: i64, threshold: Option<i64>, euro: Option<&str>) -> WatchedAddress {
        WatchedAddress {
            address: "bitcoincash:quser".to_string(),
            user_id: Some(7),
            device_id: None,
            created_at: Utc::now() - Duration::minutes(minutes_old),
            threshold,
            euro_amount: euro.map(dec),
        }
    }

    fn device_row() -> WatchedAddress {
        WatchedAddress {
            address: "bitcoincash:qdevice".to_string(),
            user_id: None,
            device_id: Some(3),
            created_at: Utc::now(),
            threshold: None,
            euro_amount: None,
        }
    }

    fn event(address: &str, tx_hash: &str, value_sats: i64) -> PaymentEvent {
        PaymentEvent {
            address: address.to_string(),
            tx_hash: tx_hash.to_string(),
            tx_pos: 0,
            value_sats,
            height: 0,
            status: PaymentStatus::Unconfirmed,
        }
    }

    #[test]
    fn status_follows_height() {
        assert_eq!(PaymentStatus::from_height(0), PaymentStatus::Unconfirmed);
        assert_eq!(PaymentStatus::from_height(812_345), PaymentStatus::Confirmed);
        assert_eq!(PaymentStatus::from_height(-1), PaymentStatus::Unknown);
    }

    #[test]
    fn tier_boundaries() {
        assert_eq!(grain_multiplier(dec("19.99")), Decimal::from(4));
        assert_eq!(grain_multiplier(dec("20.00")), Decimal::from(5));
        assert_eq!(grain_multiplier(dec("49.99")), Decimal::from(5));
        assert_eq!(grain_multiplier(dec("50.00")), Decimal::from(6));
    }

    #[test]
    fn rewards_are_ceilinged() {
        assert_eq!(grain_reward(dec("10.00")), 40);
        assert_eq!(grain_reward(dec("0.60")), 3); // 2.4 rounds up
        assert_eq!(grain_reward(dec("0.005")), 1);
        assert_eq!(grain_reward(dec("20.00")), 100);
        assert_eq!(grain_reward(dec("50.00")), 300);
    }

    #[test]
    fn device_threshold_math() {
        // 0.50 EUR at 500 EUR/BCH = 100k sats, 5% margin leaves 95k.
        assert_eq!(device_threshold_sats(dec("0.50"), 500.0), 100_000);
        assert_eq!(effective_device_threshold(100_000), 95_000);
        // Unusable spot price disables the gate.
        assert_eq!(device_threshold_sats(dec("0.50"), 0.0), 0);
        assert_eq!(effective_device_threshold(0), 0);
    }

    fn processor(store: &Arc<MemStore>, oracle: Arc<PriceOracle>) -> PaymentProcessor {
        PaymentProcessor::new(store.clone() as Arc<dyn PaymentStore>, oracle)
    }

    // User in the grace window with the sats threshold met: stored EUR amount
    // is authoritative, reward is tier 1.
    #[tokio::test]
    async fn user_in_window_threshold_met() {
        let store = Arc::new(MemStore::default());
        store.add_user(7, "alice");
        let p = processor(&store, oracle_with(Some(400.0), Some(430.0)));

        let row = user_row(5, Some(200_000), Some("10.00"));
        p.process(&row, &event(&row.address, "a0", 250_000)).await;

        assert_eq!(store.grain_balance(7), 40);
        let payments = store.payments();
        assert_eq!(payments.len(), 1);
        assert_eq!(payments[0].reference, "7");
        assert_eq!(payments[0].description, "alice (+40 grain)");
        assert_eq!(payments[0].euro_amount, Some(dec("10.00")));
        // 0.0025 BCH * 430 = 1.075, banker-rounded to cents.
        assert_eq!(payments[0].usd_amount, Some(dec("1.08")));
    }

    // Threshold unmet inside the window falls back to price mode.
    #[tokio::test]
    async fn user_in_window_threshold_unmet_uses_price() {
        let store = Arc::new(MemStore::default());
        store.add_user(7, "alice");
        let p = processor(&store, oracle_with(Some(400.0), None));

        let row = user_row(5, Some(200_000), Some("10.00"));
        p.process(&row, &event(&row.address, "a1", 150_000)).await;

        // 0.0015 BCH * 400 = 0.60 EUR, grain = ceil(0.60 * 4) = 3.
        assert_eq!(store.grain_balance(7), 3);
        let payments = store.payments();
        assert_eq!(payments[0].euro_amount, Some(dec("0.60")));
        assert_eq!(payments[0].usd_amount, None);
        assert_eq!(payments[0].description, "alice (+3 grain)");
    }

    // Out of the window the configured threshold is ignored entirely.
    #[tokio::test]
    async fn user_out_of_window_uses_price() {
        let store = Arc::new(MemStore::default());
        store.add_user(7, "alice");
        let p = processor(&store, oracle_with(Some(500.0), None));

        let row = user_row(40, Some(200_000), Some("10.00"));
        p.process(&row, &event(&row.address, "a2", 100_000)).await;

        // 0.001 BCH * 500 = 0.50 EUR, grain = ceil(2.0) = 2.
        assert_eq!(store.grain_balance(7), 2);
        assert_eq!(store.payments()[0].euro_amount, Some(dec("0.50")));
    }

    // No EUR price: grain update is skipped, the record is still written
    // with whatever fiat fields are known.
    #[tokio::test]
    async fn user_without_price_skips_grain_but_records() {
        let store = Arc::new(MemStore::default());
        store.add_user(7, "alice");
        let p = processor(&store, oracle_with(None, None));

        let row = user_row(40, None, None);
        p.process(&row, &event(&row.address, "a3", 100_000)).await;

        assert_eq!(store.grain_balance(7), 0);
        let payments = store.payments();
        assert_eq!(payments.len(), 1);
        assert_eq!(payments[0].euro_amount, None);
        assert_eq!(payments[0].usd_amount, None);
        assert!(payments[0].description.starts_with("Auto-detected payment to"));
    }

    #[tokio::test]
    async fn unknown_user_falls_back_to_numeric_display_name() {
        let store = Arc::new(MemStore::default());
        let p = processor(&store, oracle_with(Some(400.0), None));

        let row = user_row(40, None, None);
        p.process(&row, &event(&row.address, "a4", 150_000)).await;

        assert_eq!(store.payments()[0].description, "user 7 (+3 grain)");
    }

    // Device below the effective threshold: nothing is written at all.
    #[tokio::test]
    async fn device_below_threshold_is_ignored() {
        let store = Arc::new(MemStore::default());
        store.add_device(3, Some("coop-1"), Some("henhouse"), Some(dec("0.50")));
        let p = processor(&store, oracle_with(Some(500.0), Some(540.0)));

        p.process(&device_row(), &event("bitcoincash:qdevice", "d0", 90_000))
            .await;

        assert!(store.payments().is_empty());
        assert_eq!(store.feedings(3), 0);
    }

    #[tokio::test]
    async fn device_above_threshold_feeds_and_records() {
        let store = Arc::new(MemStore::default());
        store.add_device(3, Some("coop-1"), Some("henhouse"), Some(dec("0.50")));
        let p = processor(&store, oracle_with(Some(500.0), Some(540.0)));

        p.process(&device_row(), &event("bitcoincash:qdevice", "d1", 120_000))
            .await;

        let payments = store.payments();
        assert_eq!(payments.len(), 1);
        assert_eq!(payments[0].reference, "coop-1");
        assert_eq!(payments[0].description, "Direct payment to henhouse");
        assert_eq!(payments[0].euro_amount, Some(dec("0.60")));
        assert_eq!(payments[0].usd_amount, Some(dec("0.65"))); // 0.648
        assert_eq!(store.feedings(3), 1);
        assert!(store.last_feeding(3).is_some());
    }

    // Devices without a configured feed price are never gated.
    #[tokio::test]
    async fn device_without_feed_price_is_not_gated() {
        let store = Arc::new(MemStore::default());
        store.add_device(3, None, None, None);
        let p = processor(&store, oracle_with(Some(500.0), None));

        p.process(&device_row(), &event("bitcoincash:qdevice", "d2", 1_000))
            .await;

        let payments = store.payments();
        assert_eq!(payments.len(), 1);
        // No alias either: reference degrades to the device id.
        assert_eq!(payments[0].reference, "3");
        assert!(payments[0].description.starts_with("Auto-detected payment to"));
    }

    // Missing spot price collapses the device threshold to zero (accept-all).
    #[tokio::test]
    async fn device_with_feed_price_but_no_spot_accepts_all() {
        let store = Arc::new(MemStore::default());
        store.add_device(3, Some("coop-1"), None, Some(dec("0.50")));
        let p = processor(&store, oracle_with(None, None));

        p.process(&device_row(), &event("bitcoincash:qdevice", "d3", 1_000))
            .await;

        assert_eq!(store.payments().len(), 1);
        assert_eq!(store.payments()[0].euro_amount, None);
        assert_eq!(store.feedings(3), 1);
    }
}
