//! Connection options and per-call transport options.

use std::time::Duration;

use tokio::sync::oneshot;

use crate::heartbeat::HeartbeatConfig;
use crate::proto::DataFormat;

/// Connection-wide options. A server shares one bundle across all of its
/// connections; fields are read-only after construction.
#[derive(Debug, Clone)]
pub struct ConnOptions {
    /// Short name used as the log prefix.
    pub name: String,
    /// Log connect/disconnect transitions.
    pub log_connect: bool,
    /// Log API requests and returns.
    pub log_api: bool,
    /// Log sent/received messages.
    pub log_msg: bool,
    /// Include request bodies in API logs.
    pub log_req_body: bool,
    /// Include response bodies in API logs.
    pub log_res_body: bool,
    /// Trace raw frames as they pass the transport boundary.
    pub debug_frames: bool,
    /// Default deadline for outbound calls. Zero disables the timeout.
    pub call_api_timeout: Duration,
    /// Deadline for local handlers answering inbound calls. Zero disables.
    pub api_call_timeout: Duration,
    /// Skip body validation when encoding (trusted peers only).
    pub skip_encode_validate: bool,
    /// Skip body validation when decoding (trusted peers only).
    pub skip_decode_validate: bool,
    /// Embed the original handler error in internal-error replies.
    pub return_inner_error: bool,
    pub heartbeat: HeartbeatConfig,
}

impl Default for ConnOptions {
    fn default() -> Self {
        Self {
            name: "conn".into(),
            log_connect: true,
            log_api: true,
            log_msg: true,
            log_req_body: false,
            log_res_body: false,
            debug_frames: false,
            call_api_timeout: Duration::from_secs(15),
            api_call_timeout: Duration::from_secs(30),
            skip_encode_validate: false,
            skip_decode_validate: false,
            return_inner_error: false,
            heartbeat: HeartbeatConfig::default(),
        }
    }
}

impl ConnOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_call_api_timeout(mut self, timeout: Duration) -> Self {
        self.call_api_timeout = timeout;
        self
    }

    pub fn with_api_call_timeout(mut self, timeout: Duration) -> Self {
        self.api_call_timeout = timeout;
        self
    }

    pub fn with_heartbeat(mut self, heartbeat: HeartbeatConfig) -> Self {
        self.heartbeat = heartbeat;
        self
    }
}

/// Per-call options.
#[derive(Debug, Default)]
pub struct TransportOptions {
    /// Overrides the connection's `call_api_timeout`. Zero disables.
    pub timeout: Option<Duration>,
    /// Groups this call for `abort_by_key`.
    pub abort_key: Option<String>,
    /// External cancellation: sending on the paired sender aborts the call.
    pub abort_signal: Option<oneshot::Receiver<()>>,
    /// Overrides the connection's default wire mode for this call.
    pub format: Option<DataFormat>,
    /// Carried opaquely to the transport; only HTTP-style transports read it.
    pub headers: Vec<(String, String)>,
}

impl TransportOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_abort_key(mut self, key: impl Into<String>) -> Self {
        self.abort_key = Some(key.into());
        self
    }

    pub fn with_abort_signal(mut self, signal: oneshot::Receiver<()>) -> Self {
        self.abort_signal = Some(signal);
        self
    }

    pub fn with_format(mut self, format: DataFormat) -> Self {
        self.format = Some(format);
        self
    }
}
