//! Cached BCH spot prices, refreshed in the background from CoinGecko.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

const PRICE_URL: &str =
    "https://api.coingecko.com/api/v3/simple/price?ids=bitcoin-cash&vs_currencies=eur,usd";
const HTTP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
struct SimplePriceResponse {
    #[serde(rename = "bitcoin-cash")]
    bitcoin_cash: Option<CoinPrice>,
}

#[derive(Debug, Deserialize)]
struct CoinPrice {
    eur: Option<f64>,
    usd: Option<f64>,
}

#[derive(Debug, Clone, Copy)]
struct PricePoint {
    price: f64,
    refreshed_at: DateTime<Utc>,
}

#[derive(Default)]
struct PriceCache {
    eur: Option<PricePoint>,
    usd: Option<PricePoint>,
}

/// BCH→EUR / BCH→USD price oracle.
///
/// Readers never touch the network: `eur()`/`usd()` return whatever the
/// background refresher cached last. A failed refresh keeps the previous
/// values.
pub struct PriceOracle {
    http: reqwest::Client,
    cache: RwLock<PriceCache>,
}

impl PriceOracle {
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            http,
            cache: RwLock::new(PriceCache::default()),
        }
    }

    /// Last cached BCH/EUR price, if any refresh has succeeded yet.
    pub fn eur(&self) -> Option<f64> {
        self.cache.read().unwrap().eur.map(|p| p.price)
    }

    /// Last cached BCH/USD price, if any refresh has succeeded yet.
    pub fn usd(&self) -> Option<f64> {
        self.cache.read().unwrap().usd.map(|p| p.price)
    }

    fn last_refreshed(&self) -> Option<DateTime<Utc>> {
        let cache = self.cache.read().unwrap();
        [cache.eur, cache.usd]
            .into_iter()
            .flatten()
            .map(|p| p.refreshed_at)
            .max()
    }

    /// Store freshly observed prices. Zero or missing values leave the
    /// previous cache entry in place.
    pub fn update(&self, eur: Option<f64>, usd: Option<f64>) {
        let now = Utc::now();
        let mut cache = self.cache.write().unwrap();
        if let Some(price) = eur.filter(|p| *p > 0.0) {
            cache.eur = Some(PricePoint {
                price,
                refreshed_at: now,
            });
        }
        if let Some(price) = usd.filter(|p| *p > 0.0) {
            cache.usd = Some(PricePoint {
                price,
                refreshed_at: now,
            });
        }
    }

    /// Fetch both currencies in a single request and update the cache.
    pub async fn refresh(&self) {
        let response = match self
            .http
            .get(PRICE_URL)
            .timeout(HTTP_TIMEOUT)
            .send()
            .await
            .and_then(|r| r.error_for_status())
        {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(
                    last_success = ?self.last_refreshed(),
                    "failed to refresh BCH prices: {e}"
                );
                return;
            }
        };

        let data: SimplePriceResponse = match response.json().await {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!("failed to decode BCH price response: {e}");
                return;
            }
        };

        match data.bitcoin_cash {
            Some(prices) => {
                self.update(prices.eur, prices.usd);
                tracing::debug!(
                    eur = ?self.eur(),
                    usd = ?self.usd(),
                    "refreshed BCH prices"
                );
            }
            None => tracing::warn!("BCH price response carried no bitcoin-cash entry"),
        }
    }

    /// Spawn the background refresher: one warm-up fetch, then a fixed
    /// interval loop until the stop flag flips.
    pub fn start(
        self: &Arc<Self>,
        interval: Duration,
        mut stop: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let oracle = Arc::clone(self);
        tokio::spawn(async move {
            oracle.refresh().await;
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => oracle.refresh().await,
                    _ = stop.changed() => {
                        tracing::debug!("price refresher stopping");
                        return;
                    }
                }
            }
        })
    }
}
