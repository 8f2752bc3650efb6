//! In-memory transport: two endpoints linked through unbounded channels.
//!
//! The reference transport for tests and examples, and the smallest
//! demonstration of the transport contract. Supports silently dropping
//! traffic to simulate a dead link that has not reset yet.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::config::TransportOptions;
use crate::conn::Connection;
use crate::proto::{TransportData, WireData};
use crate::transport::Transport;

pub struct MemoryTransport {
    outbound: mpsc::UnboundedSender<WireData>,
    inbound: Mutex<Option<mpsc::UnboundedReceiver<WireData>>>,
    drop_traffic: AtomicBool,
    closed: AtomicBool,
}

impl MemoryTransport {
    /// Two linked endpoints: what one sends, the other receives.
    pub fn pair() -> (Arc<Self>, Arc<Self>) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        let a = Arc::new(Self {
            outbound: a_tx,
            inbound: Mutex::new(Some(b_rx)),
            drop_traffic: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        let b = Arc::new(Self {
            outbound: b_tx,
            inbound: Mutex::new(Some(a_rx)),
            drop_traffic: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        (a, b)
    }

    /// Start pumping inbound frames into the connection. Call once, after
    /// the connection owning this transport is constructed.
    pub fn bind(self: &Arc<Self>, conn: &Arc<Connection>) {
        let Some(mut rx) = self
            .inbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            debug!("memory transport already bound, ignoring");
            return;
        };
        let conn = Arc::downgrade(conn);
        tokio::spawn(async move {
            while let Some(raw) = rx.recv().await {
                let Some(conn) = conn.upgrade() else { break };
                conn.recv_data(raw).await;
            }
        });
    }

    /// While set, sends succeed locally but nothing reaches the peer —
    /// a dead network that has not reset the link.
    pub fn set_drop_traffic(&self, drop: bool) {
        self.drop_traffic.store(drop, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send_raw(
        &self,
        raw: WireData,
        _data: &TransportData,
        _opts: &TransportOptions,
    ) -> anyhow::Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            anyhow::bail!("transport closed");
        }
        if self.drop_traffic.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.outbound
            .send(raw)
            .map_err(|_| anyhow::anyhow!("peer endpoint gone"))
    }

    async fn do_disconnect(&self, _is_manual: bool, _reason: Option<&str>) -> anyhow::Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
