//! Error taxonomy for the device core

use std::time::Duration;

/// Network-level failures: HTTP requests and the broker link
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("request to {url} timed out after {timeout:?}")]
    Timeout { url: String, timeout: Duration },

    #[error("server replied with status: {0}")]
    Status(u16),

    #[error("wifi is down")]
    WifiDown,

    #[error("no url configured")]
    EmptyUrl,

    #[error("invalid broker url: {0}")]
    BrokerUrl(String),

    #[error("broker not connected")]
    NotConnected,

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error("broker: {0}")]
    Broker(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Token acquisition failures; they delay connectivity and are never fatal
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("authorization requests are rate limited, retry in {0:?}")]
    RateLimited(Duration),

    #[error("no {0} configured")]
    Missing(&'static str),

    #[error("authorization server rejected the request with status {0}")]
    Rejected(u16),

    #[error("malformed authorization response: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Persistent store and flash write failures
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage backend: {0}")]
    Backend(String),

    #[error("not enough space for a {0} byte image")]
    NoSpace(u64),

    #[error("short write: {written} of {expected} bytes")]
    WriteMismatch { written: usize, expected: usize },

    #[error("image rejected: {0}")]
    Finalize(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Malformed input on the provisioning link or a command topic
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("json message has no command")]
    MissingCommand,

    #[error("message is neither json nor ssid:password")]
    UnknownFormat,

    #[error("invalid sha256 digest: {0}")]
    Digest(String),
}

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("config: {0}")]
    Config(String),
}

pub type Result<T, E = DeviceError> = std::result::Result<T, E>;
