//! Subscription lifecycle and UTXO reconciliation.
//!
//! The reconcile loop converges the subscribed set onto the registry's watch
//! list. Each subscribed address gets one worker task that owns its known
//! UTXO set and drains a bounded mailbox, so notification handling is
//! serialized per address while slow lookups on one address never stall
//! another. A watchdog pings the Electrum connection and rebuilds it, plus
//! all subscriptions, when it drops.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::electrum::{ElectrumClient, Unspent};
use crate::error::ElectrumError;
use crate::oracle::PriceOracle;
use crate::qualify::{PaymentEvent, PaymentProcessor, UtxoKey};
use crate::registry::AddressRegistry;
use crate::store::PaymentStore;

/// Pending refreshes per address. Refreshes coalesce: every one re-lists the
/// full unspent set, so a queued refresh already covers later notifications.
const WORKER_MAILBOX: usize = 4;
const RECONNECT_PAUSE: Duration = Duration::from_secs(1);

enum WorkerCmd {
    /// Subscription status changed: re-list unspent outputs and diff.
    Refresh,
    /// Replace the known set after a reconnect re-prime.
    Reset(HashSet<UtxoKey>),
}

struct AddressWorker {
    tx: mpsc::Sender<WorkerCmd>,
}

pub struct Monitor {
    registry: Arc<AddressRegistry>,
    client: Arc<RwLock<ElectrumClient>>,
    processor: Arc<PaymentProcessor>,
    workers: DashMap<String, AddressWorker>,
    sync_interval: Duration,
    ping_interval: Duration,
}

impl Monitor {
    pub fn new(
        registry: Arc<AddressRegistry>,
        client: Arc<RwLock<ElectrumClient>>,
        store: Arc<dyn PaymentStore>,
        oracle: Arc<PriceOracle>,
        sync_interval: Duration,
        ping_interval: Duration,
    ) -> Self {
        Self {
            registry,
            client,
            processor: Arc::new(PaymentProcessor::new(store, oracle)),
            workers: DashMap::new(),
            sync_interval,
            ping_interval,
        }
    }

    /// Register notification handlers, subscribe to headers and spawn the
    /// long-lived loops. Fails only when the initial headers subscription
    /// cannot be placed.
    pub async fn start(
        self: &Arc<Self>,
        stop: watch::Receiver<bool>,
    ) -> Result<Vec<JoinHandle<()>>, ElectrumError> {
        let (notify_tx, notify_rx) = mpsc::unbounded_channel::<String>();
        {
            let client = self.client.read().await;
            let address_tx = notify_tx.clone();
            client.register_handler(
                "blockchain.address.subscribe",
                Arc::new(move |params: &[Value]| {
                    match params.first().and_then(Value::as_str) {
                        Some(address) => {
                            let _ = address_tx.send(address.to_string());
                        }
                        None => tracing::warn!("address notification without address param"),
                    }
                }),
            );
            client.register_handler(
                "blockchain.headers.subscribe",
                Arc::new(|params: &[Value]| {
                    let height = params
                        .first()
                        .and_then(|h| h.get("height"))
                        .and_then(Value::as_i64);
                    tracing::debug!(?height, "new block header");
                }),
            );
            client.headers_subscribe().await?;
        }

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(dispatch_loop(
            Arc::clone(self),
            notify_rx,
            stop.clone(),
        )));
        tasks.push(tokio::spawn(reconcile_loop(Arc::clone(self), stop.clone())));
        tasks.push(tokio::spawn(watchdog_loop(Arc::clone(self), stop)));
        Ok(tasks)
    }

    /// One reconciliation pass: converge the worker set onto the registry.
    pub(crate) async fn reconcile(&self) {
        let desired: HashSet<String> = self
            .registry
            .snapshot()
            .into_iter()
            .map(|row| row.address)
            .collect();
        let subscribed: HashSet<String> =
            self.workers.iter().map(|e| e.key().clone()).collect();

        let mut added = 0usize;
        let mut removed = 0usize;
        for address in subscribed.difference(&desired) {
            self.drop_address(address).await;
            removed += 1;
        }
        for address in desired.difference(&subscribed) {
            if self.add_address(address).await {
                added += 1;
            }
        }
        if added > 0 || removed > 0 {
            tracing::info!(
                watching = self.workers.len(),
                added,
                removed,
                "👀 watch set reconciled"
            );
        }
    }

    async fn drop_address(&self, address: &str) {
        {
            let client = self.client.read().await;
            // Unsubscribe errors are ignored; the server forgets us anyway
            // once the next reconnect happens.
            let _ = client.address_unsubscribe(address).await;
        }
        // Dropping the sender ends the worker and its known set with it.
        self.workers.remove(address);
        tracing::debug!(%address, "unsubscribed");
    }

    /// Prime the known set and subscribe, both under one client guard so a
    /// watchdog reconnect cannot swap the socket between the two calls.
    /// Outputs present at priming time are history, not payments.
    async fn add_address(&self, address: &str) -> bool {
        let known = {
            let client = self.client.read().await;
            let known = match client.list_unspent(address).await {
                Ok(utxos) => utxo_keys(&utxos),
                Err(e) => {
                    // Without a baseline every existing output would count as
                    // new; leave the address unsubscribed and retry next tick.
                    tracing::warn!(%address, "priming listunspent failed: {e}");
                    return false;
                }
            };
            if let Err(e) = client.address_subscribe(address).await {
                tracing::warn!(%address, "subscribe failed: {e}");
            }
            known
        };
        self.spawn_worker(address.to_string(), known);
        true
    }

    fn spawn_worker(&self, address: String, known: HashSet<UtxoKey>) {
        let (tx, rx) = mpsc::channel(WORKER_MAILBOX);
        self.workers.insert(address.clone(), AddressWorker { tx });
        tokio::spawn(run_worker(
            address,
            known,
            rx,
            Arc::clone(&self.registry),
            Arc::clone(&self.client),
            Arc::clone(&self.processor),
        ));
    }

    fn route_notification(&self, address: &str) {
        let Some(worker) = self.workers.get(address) else {
            tracing::debug!(%address, "notification for unwatched address");
            return;
        };
        match worker.tx.try_send(WorkerCmd::Refresh) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::debug!(%address, "refresh already queued, coalescing");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!(%address, "worker already stopped");
            }
        }
    }

    /// Watchdog body: ping, and rebuild the connection plus all
    /// subscriptions when the ping fails. Idempotent.
    pub(crate) async fn check_connection(&self) {
        {
            let client = self.client.read().await;
            if client.ping().await.is_ok() {
                return;
            }
        }
        tracing::warn!("🔌 electrum connection appears down, reconnecting");

        let client = self.client.write().await;
        client.disconnect().await;
        tokio::time::sleep(RECONNECT_PAUSE).await;
        match client.connect().await {
            Ok(()) => self.restore_subscriptions(&client).await,
            Err(e) => tracing::error!("electrum reconnect failed: {e}"),
        }
    }

    async fn restore_subscriptions(&self, client: &ElectrumClient) {
        if let Err(e) = client.headers_subscribe().await {
            tracing::warn!("headers re-subscribe failed: {e}");
        }
        let desired: Vec<String> = self
            .registry
            .snapshot()
            .into_iter()
            .map(|row| row.address)
            .collect();

        let mut restored = 0usize;
        for address in &desired {
            let known = match client.list_unspent(address).await {
                Ok(utxos) => utxo_keys(&utxos),
                Err(e) => {
                    tracing::warn!(%address, "re-prime listunspent failed: {e}");
                    continue;
                }
            };
            match self.workers.get(address) {
                Some(worker) => {
                    let _ = worker.tx.try_send(WorkerCmd::Reset(known));
                }
                None => self.spawn_worker(address.clone(), known),
            }
            match client.address_subscribe(address).await {
                Ok(_) => restored += 1,
                Err(e) => tracing::warn!(%address, "re-subscribe failed: {e}"),
            }
        }
        tracing::info!("🔁 restored subscriptions for {restored}/{} addresses", desired.len());
    }
}

fn utxo_keys(utxos: &[Unspent]) -> HashSet<UtxoKey> {
    utxos
        .iter()
        .map(|u| (u.tx_hash.clone(), u.tx_pos))
        .collect()
}

/// Per-address worker: drains its mailbox strictly in order, owning the
/// known UTXO set so diffing is serialized per address by construction.
async fn run_worker(
    address: String,
    mut known: HashSet<UtxoKey>,
    mut rx: mpsc::Receiver<WorkerCmd>,
    registry: Arc<AddressRegistry>,
    client: Arc<RwLock<ElectrumClient>>,
    processor: Arc<PaymentProcessor>,
) {
    tracing::debug!(%address, known = known.len(), "address worker started");
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WorkerCmd::Reset(set) => known = set,
            WorkerCmd::Refresh => {
                let listing = {
                    let client = client.read().await;
                    client.list_unspent(&address).await
                };
                let utxos = match listing {
                    Ok(u) => u,
                    Err(e) => {
                        // Transient; the next notification or the watchdog
                        // re-prime will catch the output up.
                        tracing::warn!(%address, "listunspent failed: {e}");
                        continue;
                    }
                };
                let current = utxo_keys(&utxos);
                let new_keys: HashSet<UtxoKey> =
                    current.difference(&known).cloned().collect();

                if !new_keys.is_empty() {
                    match registry.get(&address) {
                        Some(row) => {
                            for utxo in utxos
                                .iter()
                                .filter(|u| new_keys.contains(&(u.tx_hash.clone(), u.tx_pos)))
                            {
                                let event = PaymentEvent::from_unspent(&address, utxo);
                                tracing::info!(
                                    address = %event.address,
                                    tx = %event.tx_hash,
                                    pos = event.tx_pos,
                                    sats = event.value_sats,
                                    bch = event.value_bch(),
                                    status = %event.status,
                                    "✅ received new output"
                                );
                                processor.process(&row, &event).await;
                            }
                        }
                        None => tracing::debug!(%address, "address no longer watched"),
                    }
                }
                known = current;
            }
        }
    }
    tracing::debug!(%address, "address worker stopped");
}

async fn dispatch_loop(
    monitor: Arc<Monitor>,
    mut rx: mpsc::UnboundedReceiver<String>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = stop.changed() => return,
            msg = rx.recv() => match msg {
                Some(address) => monitor.route_notification(&address),
                None => return,
            }
        }
    }
}

async fn reconcile_loop(monitor: Arc<Monitor>, mut stop: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(monitor.sync_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = stop.changed() => {
                tracing::debug!("reconcile loop stopping");
                return;
            }
            _ = ticker.tick() => monitor.reconcile().await,
        }
    }
}

async fn watchdog_loop(monitor: Arc<Monitor>, mut stop: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(monitor.ping_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick fires immediately; skip it so a fresh connection is not
    // pinged before the monitor finishes starting.
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = stop.changed() => {
                tracing::debug!("watchdog stopping");
                return;
            }
            _ = ticker.tick() => monitor.check_connection().await,
        }
    }
}
