//! Line-delimited JSON-RPC 2.0 client for Fulcrum/Electrum Cash servers.
//!
//! One reader task per connection routes responses by request id into a
//! pending table of oneshot slots and dispatches id-less notifications by
//! method name. Writes are serialized through a single writer lock so
//! concurrent callers never interleave bytes on the socket.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::config::{ElectrumSettings, Transport};
use crate::error::ElectrumError;

const CLIENT_NAME: &str = "bch-paywatch";
const PROTOCOL_VERSION: &str = "1.4";

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

type PendingTable = Mutex<HashMap<u64, oneshot::Sender<Result<Value, ElectrumError>>>>;

/// Callback invoked by the reader task for server-initiated notifications.
/// Handlers must not block; the monitor uses them to forward into channels.
pub type NotificationHandler = Arc<dyn Fn(&[Value]) + Send + Sync>;

/// One unspent output as reported by `blockchain.address.listunspent`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Unspent {
    pub tx_hash: String,
    pub tx_pos: u32,
    /// Output value in satoshis.
    pub value: i64,
    /// Confirmation height; 0 means mempool.
    pub height: i64,
}

pub struct ElectrumClient {
    settings: ElectrumSettings,
    connected: Arc<AtomicBool>,
    next_id: AtomicU64,
    writer: tokio::sync::Mutex<Option<BoxedWriter>>,
    pending: Arc<PendingTable>,
    handlers: Arc<RwLock<HashMap<String, NotificationHandler>>>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
}

impl ElectrumClient {
    pub fn new(settings: ElectrumSettings) -> Self {
        Self {
            settings,
            connected: Arc::new(AtomicBool::new(false)),
            next_id: AtomicU64::new(0),
            writer: tokio::sync::Mutex::new(None),
            pending: Arc::new(Mutex::new(HashMap::new())),
            handlers: Arc::new(RwLock::new(HashMap::new())),
            reader_task: Mutex::new(None),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Register (or replace) the handler for a notification method.
    /// The table survives reconnects.
    pub fn register_handler(&self, method: &str, handler: NotificationHandler) {
        self.handlers.write().insert(method.to_string(), handler);
    }

    /// Establish the socket, spawn the reader and negotiate the protocol
    /// version. Any previous connection is torn down first.
    pub async fn connect(&self) -> Result<(), ElectrumError> {
        self.teardown().await;

        let addr = format!("{}:{}", self.settings.host, self.settings.port);
        let tcp = TcpStream::connect(&addr).await.map_err(|e| {
            tracing::warn!("electrum connect to {addr} failed: {e}");
            ElectrumError::TransportDown
        })?;
        let _ = tcp.set_nodelay(true);

        let (read_half, write_half): (BoxedReader, BoxedWriter) = match self.settings.transport {
            Transport::Tcp => {
                let (r, w) = tcp.into_split();
                (Box::new(r), Box::new(w))
            }
            Transport::Ssl => {
                let mut builder = native_tls::TlsConnector::builder();
                if !self.settings.tls_verify {
                    tracing::warn!("electrum TLS certificate verification is disabled");
                    builder
                        .danger_accept_invalid_certs(true)
                        .danger_accept_invalid_hostnames(true);
                }
                let connector = builder.build().map_err(|e| {
                    tracing::warn!("building TLS connector failed: {e}");
                    ElectrumError::TransportDown
                })?;
                let connector = tokio_native_tls::TlsConnector::from(connector);
                let tls = connector
                    .connect(&self.settings.host, tcp)
                    .await
                    .map_err(|e| {
                        tracing::warn!("TLS handshake with {addr} failed: {e}");
                        ElectrumError::TransportDown
                    })?;
                let (r, w) = tokio::io::split(tls);
                (Box::new(r), Box::new(w))
            }
        };

        *self.writer.lock().await = Some(write_half);
        self.next_id.store(0, Ordering::SeqCst);

        let pending = Arc::clone(&self.pending);
        let handlers = Arc::clone(&self.handlers);
        let connected = Arc::clone(&self.connected);
        let handle = tokio::spawn(read_loop(read_half, pending, handlers, connected));
        *self.reader_task.lock() = Some(handle);
        self.connected.store(true, Ordering::SeqCst);

        match self.negotiate_version().await {
            Ok((server, proto)) => {
                tracing::info!("connected to {server}, using protocol {proto}");
                Ok(())
            }
            Err(e) => {
                self.teardown().await;
                Err(e)
            }
        }
    }

    /// Close the socket and fail every in-flight request. Idempotent.
    pub async fn disconnect(&self) {
        self.teardown().await;
    }

    async fn teardown(&self) {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        if let Some(handle) = self.reader_task.lock().take() {
            handle.abort();
        }
        fail_pending(&self.pending);
    }

    async fn negotiate_version(&self) -> Result<(String, String), ElectrumError> {
        let result = self
            .request("server.version", json!([CLIENT_NAME, PROTOCOL_VERSION]))
            .await?;
        let pair = result.as_array().filter(|a| a.len() == 2).ok_or_else(|| {
            ElectrumError::ProtocolMismatch(format!("unexpected server.version reply: {result}"))
        })?;
        let server = pair[0].as_str().unwrap_or_default().to_string();
        let proto = pair[1].as_str().unwrap_or_default().to_string();
        Ok((server, proto))
    }

    /// Issue one JSON-RPC request and wait for the correlated response.
    ///
    /// The completion slot is registered before any bytes hit the socket, so
    /// a fast peer cannot answer an unknown id.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value, ElectrumError> {
        if !self.is_connected() {
            return Err(ElectrumError::TransportDown);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let mut line = serde_json::to_string(&json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": id,
        }))
        .map_err(|e| ElectrumError::PayloadMalformed(e.to_string()))?;
        line.push('\n');

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        {
            let mut writer = self.writer.lock().await;
            let Some(w) = writer.as_mut() else {
                self.pending.lock().remove(&id);
                return Err(ElectrumError::TransportDown);
            };
            let res = match w.write_all(line.as_bytes()).await {
                Ok(()) => w.flush().await,
                Err(e) => Err(e),
            };
            if let Err(e) = res {
                tracing::warn!(method, "electrum write failed: {e}");
                self.connected.store(false, Ordering::SeqCst);
                drop(writer);
                self.pending.lock().remove(&id);
                return Err(ElectrumError::TransportDown);
            }
        }

        match tokio::time::timeout(self.settings.request_timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            // Reader dropped the slot: connection died under us.
            Ok(Err(_)) => Err(ElectrumError::TransportDown),
            Err(_) => {
                self.pending.lock().remove(&id);
                Err(ElectrumError::RequestTimeout(self.settings.request_timeout))
            }
        }
    }

    pub async fn ping(&self) -> Result<(), ElectrumError> {
        self.request("server.ping", json!([])).await.map(|_| ())
    }

    /// Subscribe to new block headers; returns the current tip header.
    pub async fn headers_subscribe(&self) -> Result<Value, ElectrumError> {
        self.request("blockchain.headers.subscribe", json!([])).await
    }

    /// Subscribe to status changes of an address; returns the current status.
    pub async fn address_subscribe(&self, address: &str) -> Result<Option<String>, ElectrumError> {
        let result = self
            .request("blockchain.address.subscribe", json!([address]))
            .await?;
        Ok(result.as_str().map(str::to_string))
    }

    pub async fn address_unsubscribe(&self, address: &str) -> Result<bool, ElectrumError> {
        let result = self
            .request("blockchain.address.unsubscribe", json!([address]))
            .await?;
        Ok(result.as_bool().unwrap_or(false))
    }

    pub async fn list_unspent(&self, address: &str) -> Result<Vec<Unspent>, ElectrumError> {
        let result = self
            .request("blockchain.address.listunspent", json!([address]))
            .await?;
        serde_json::from_value(result)
            .map_err(|e| ElectrumError::PayloadMalformed(format!("listunspent reply: {e}")))
    }
}

fn fail_pending(pending: &PendingTable) {
    let slots: Vec<_> = {
        let mut table = pending.lock();
        table.drain().map(|(_, tx)| tx).collect()
    };
    for tx in slots {
        let _ = tx.send(Err(ElectrumError::TransportDown));
    }
}

async fn read_loop(
    reader: BoxedReader,
    pending: Arc<PendingTable>,
    handlers: Arc<RwLock<HashMap<String, NotificationHandler>>>,
    connected: Arc<AtomicBool>,
) {
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if !line.is_empty() {
                    dispatch_line(line, &pending, &handlers);
                }
            }
            Ok(None) => {
                tracing::info!("electrum server closed the connection");
                break;
            }
            Err(e) => {
                if connected.load(Ordering::SeqCst) {
                    tracing::warn!("electrum read error: {e}");
                }
                break;
            }
        }
    }
    connected.store(false, Ordering::SeqCst);
    fail_pending(&pending);
}

fn dispatch_line(
    line: &str,
    pending: &PendingTable,
    handlers: &RwLock<HashMap<String, NotificationHandler>>,
) {
    let msg: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!("discarding malformed electrum message: {e}");
            return;
        }
    };

    if let Some(id) = msg.get("id").and_then(Value::as_u64) {
        let Some(slot) = pending.lock().remove(&id) else {
            tracing::debug!(id, "response for unknown or expired request id");
            return;
        };
        let outcome = match msg.get("error") {
            Some(err) if !err.is_null() => Err(ElectrumError::PeerError(describe_peer_error(err))),
            _ => Ok(msg.get("result").cloned().unwrap_or(Value::Null)),
        };
        let _ = slot.send(outcome);
    } else if let Some(method) = msg.get("method").and_then(Value::as_str) {
        let params: Vec<Value> = msg
            .get("params")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let handler = handlers.read().get(method).cloned();
        match handler {
            Some(h) => h(&params),
            None => tracing::debug!(method, "no handler registered for notification"),
        }
    }
}

fn describe_peer_error(err: &Value) -> String {
    err.get("message")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| err.to_string())
}
