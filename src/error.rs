use std::time::Duration;
use thiserror::Error;

/// Failure modes of the Electrum client.
///
/// `TransportDown` and `RequestTimeout` are transient: the watchdog tears the
/// connection down and rebuilds it, and callers retry on the next sync tick or
/// notification. `PeerError` is a definitive answer from the server and is not
/// retried automatically.
#[derive(Debug, Error)]
pub enum ElectrumError {
    #[error("electrum transport is down")]
    TransportDown,

    #[error("request timed out after {0:?}")]
    RequestTimeout(Duration),

    #[error("server error: {0}")]
    PeerError(String),

    #[error("malformed payload: {0}")]
    PayloadMalformed(String),

    #[error("protocol mismatch: {0}")]
    ProtocolMismatch(String),
}
