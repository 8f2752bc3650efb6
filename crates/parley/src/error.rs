//! Typed errors and call results.
//!
//! Every failure a caller can observe is a value: `call_api` resolves to an
//! [`ApiReturn`] and never panics or rejects. [`RpcError`] is the wire-level
//! error carried by `err` envelopes; its `kind` separates business errors
//! (`Api`) from the infrastructural kinds the core raises itself.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Result of an API call: the response body, or a typed error.
///
/// `call_api` returns `Option<ApiReturn>` where `None` is the aborted
/// sentinel — an aborted call neither succeeds nor fails.
pub type ApiReturn<T = Value> = Result<T, RpcError>;

/// Error codes raised by the core itself.
pub mod codes {
    /// No reply within the call timeout.
    pub const TIMEOUT: &str = "TIMEOUT";
    /// Connection was lost while the call was in flight.
    pub const LOST_CONN: &str = "LOST_CONN";
    /// Remote handler did not reply within its deadline.
    pub const SERVER_TIMEOUT: &str = "SERVER_TIMEOUT";
    /// Remote handler raised an uncaught error.
    pub const INTERNAL_ERR: &str = "INTERNAL_ERR";
    /// Remote has no API registered under the requested name.
    pub const INVALID_API: &str = "INVALID_API";
}

/// Error categories.
///
/// `Api` is the only business kind (a handler rejected the request); every
/// other kind is infrastructural and raised by the core or the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Business rule violated; raised by a handler via `call.error(...)`.
    #[serde(rename = "ApiError")]
    Api,
    /// Transport failure, timeout, or lost connection.
    #[serde(rename = "NetworkError")]
    Network,
    /// Server-side handler threw or timed out.
    #[serde(rename = "ServerError")]
    Server,
    /// Client-side handler threw or timed out.
    #[serde(rename = "ClientError")]
    Client,
    /// The peer reports it failed to decode what we sent.
    #[serde(rename = "RemoteError")]
    Remote,
    /// This side failed to encode, decode, or send.
    #[serde(rename = "LocalError")]
    Local,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Api => "ApiError",
            ErrorKind::Network => "NetworkError",
            ErrorKind::Server => "ServerError",
            ErrorKind::Client => "ClientError",
            ErrorKind::Remote => "RemoteError",
            ErrorKind::Local => "LocalError",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The typed error carried by `err` envelopes and failed [`ApiReturn`]s.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct RpcError {
    pub message: String,
    #[serde(rename = "type")]
    pub kind: ErrorKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// Free-form property bag, flattened on the wire.
    #[serde(flatten)]
    pub props: serde_json::Map<String, Value>,
}

impl RpcError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind,
            code: None,
            props: serde_json::Map::new(),
        }
    }

    pub fn api(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Api, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, message)
    }

    pub fn server(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Server, message)
    }

    pub fn client(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Client, message)
    }

    pub fn remote(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Remote, message)
    }

    pub fn local(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Local, message)
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_prop(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.props.insert(key.into(), value.into());
        self
    }

    /// Check kind and code in one go, for terse assertions and matching.
    pub fn is(&self, kind: ErrorKind, code: &str) -> bool {
        self.kind == kind && self.code.as_deref() == Some(code)
    }
}

impl From<anyhow::Error> for RpcError {
    fn from(e: anyhow::Error) -> Self {
        Self::local(e.to_string())
    }
}
