//! The transport contract.
//!
//! A concrete transport (WebSocket, HTTP long-poll, in-memory pipe, ...)
//! implements three hooks; everything else — correlation, timeouts,
//! heartbeats, dispatch — lives in the connection. Inbound delivery is the
//! transport invoking [`Connection::recv_data`](crate::conn::Connection::recv_data).

use async_trait::async_trait;

use crate::config::TransportOptions;
use crate::proto::{TransportData, WireData};

#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish the underlying link. Server-side transports whose socket
    /// is already open keep the default no-op.
    async fn do_connect(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Hand one encoded frame to the wire. Success means accepted by the
    /// transport, not processed by the peer. `data` is the decoded form of
    /// the frame for transports that route on it; `opts` carries per-call
    /// extras such as headers.
    async fn send_raw(
        &self,
        raw: WireData,
        data: &TransportData,
        opts: &TransportOptions,
    ) -> anyhow::Result<()>;

    /// Tear down the underlying link. Bounded to 3 seconds by the caller.
    async fn do_disconnect(&self, is_manual: bool, reason: Option<&str>) -> anyhow::Result<()>;
}
