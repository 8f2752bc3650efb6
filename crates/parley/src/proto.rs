//! Wire-level data model.
//!
//! [`TransportData`] is the tagged union every envelope decodes into:
//! requests, responses, errors, fire-and-forget messages, heartbeats, and
//! an opaque `custom` passthrough. Bodies are `serde_json::Value` at this
//! layer; typed ergonomics live in the generic wrappers on `Connection`.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::RpcError;

/// Schema fingerprint exchanged to diagnose proto desync.
///
/// Piggybacked on the first `req` of a connection and cached from whatever
/// the peer sends; a fingerprint mismatch is not fatal but explains body
/// decode failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtoInfo {
    /// Service-map fingerprint (historically md5-shaped; any stable digest).
    pub md5: String,
    /// When the schema was last modified, epoch milliseconds.
    pub last_modified: u64,
    /// Runtime name/version of the sending side.
    pub runtime: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
}

/// Default wire mode of a connection, or a per-call override.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataFormat {
    /// JSON envelopes over a text transport.
    Text,
    /// Binary envelopes with MessagePack bodies.
    Buffer,
}

/// A raw frame as handed to or received from the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum WireData {
    Text(String),
    Binary(Bytes),
}

impl WireData {
    pub fn len(&self) -> usize {
        match self {
            WireData::Text(s) => s.len(),
            WireData::Binary(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn format(&self) -> DataFormat {
        match self {
            WireData::Text(_) => DataFormat::Text,
            WireData::Binary(_) => DataFormat::Buffer,
        }
    }
}

fn is_false(v: &bool) -> bool {
    !*v
}

/// Everything that can travel in one envelope.
///
/// The serde shape is the text wire format: one JSON object tagged by
/// `type` with camelCase fields, e.g.
/// `{"type":"req","serviceName":"Echo","sn":1,"body":{...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum TransportData {
    /// An API request. `proto_info` rides along while the remote descriptor
    /// is still unknown.
    Req {
        service_name: String,
        sn: u32,
        body: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        proto_info: Option<ProtoInfo>,
    },
    /// A successful API response. The service name is advisory on the text
    /// wire; the pending-call table is the source of truth.
    Res {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        service_name: Option<String>,
        sn: u32,
        body: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        proto_info: Option<ProtoInfo>,
    },
    /// A failed API response, or (with `sn == 0`) a global "could not
    /// decode" report not tied to any call.
    Err {
        sn: u32,
        err: RpcError,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        proto_info: Option<ProtoInfo>,
    },
    /// Fire-and-forget message. No sequence number, no reply.
    Msg { service_name: String, body: Value },
    /// Liveness probe. A ping (`is_reply == false`) is answered with the
    /// same sn and `is_reply == true`.
    Heartbeat {
        sn: u32,
        #[serde(default, skip_serializing_if = "is_false")]
        is_reply: bool,
    },
    /// Opaque passthrough for embedder extensions.
    Custom { body: Value },
}

impl TransportData {
    /// The envelope's sequence number, if its genre carries one.
    pub fn sn(&self) -> Option<u32> {
        match self {
            TransportData::Req { sn, .. }
            | TransportData::Res { sn, .. }
            | TransportData::Err { sn, .. }
            | TransportData::Heartbeat { sn, .. } => Some(*sn),
            TransportData::Msg { .. } | TransportData::Custom { .. } => None,
        }
    }

    /// Short tag for logging.
    pub fn kind_str(&self) -> &'static str {
        match self {
            TransportData::Req { .. } => "req",
            TransportData::Res { .. } => "res",
            TransportData::Err { .. } => "err",
            TransportData::Msg { .. } => "msg",
            TransportData::Heartbeat { .. } => "heartbeat",
            TransportData::Custom { .. } => "custom",
        }
    }
}
