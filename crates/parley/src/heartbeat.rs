//! Heartbeat subsystem: interval pings, latency sampling, idle-timeout
//! disconnect.
//!
//! While a connection is up and heartbeats are enabled, two tasks run under
//! one shutdown broadcast, each holding only a `Weak` reference to the
//! connection:
//!
//! - the **pinger** (only if `send_interval > 0`) sends a ping immediately,
//!   waits for the matching pong, samples the round-trip latency, and
//!   re-arms after `send_interval`;
//! - the **watchdog** disconnects the connection when no heartbeat (ping or
//!   pong) has arrived for `recv_timeout`.
//!
//! At least one side of a link must send; the other only needs to reply.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, watch, Notify};
use tracing::debug;

use crate::conn::Connection;

#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    pub enabled: bool,
    /// Interval between pings. Zero means receive-only: reply to the peer's
    /// pings but never originate one.
    pub send_interval: Duration,
    /// Idle window without any inbound heartbeat before the connection is
    /// dropped with reason "Receive heartbeat timeout".
    pub recv_timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            send_interval: Duration::from_secs(5),
            recv_timeout: Duration::from_secs(15),
        }
    }
}

impl HeartbeatConfig {
    pub fn enabled(send_interval: Duration, recv_timeout: Duration) -> Self {
        Self {
            enabled: true,
            send_interval,
            recv_timeout,
        }
    }
}

/// Live heartbeat state. Exists only while the connection is Connected with
/// heartbeats enabled.
pub(crate) struct HeartbeatState {
    shutdown: broadcast::Sender<()>,
    activity: watch::Sender<Instant>,
    pong: Arc<Notify>,
}

impl HeartbeatState {
    pub(crate) fn start(
        conn: &Arc<Connection>,
        config: &HeartbeatConfig,
        latency_ns: Arc<AtomicU64>,
    ) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        let (activity, activity_rx) = watch::channel(Instant::now());
        let pong = Arc::new(Notify::new());

        tokio::spawn(watchdog(
            Arc::downgrade(conn),
            activity_rx,
            config.recv_timeout,
            shutdown.subscribe(),
        ));

        if !config.send_interval.is_zero() {
            tokio::spawn(pinger(
                Arc::downgrade(conn),
                config.send_interval,
                pong.clone(),
                latency_ns,
                shutdown.subscribe(),
            ));
        }

        Self {
            shutdown,
            activity,
            pong,
        }
    }

    pub(crate) fn stop(&self) {
        let _ = self.shutdown.send(());
    }

    /// Any inbound heartbeat refreshes the idle watchdog.
    pub(crate) fn on_heartbeat(&self) {
        let _ = self.activity.send(Instant::now());
    }

    /// An inbound pong releases the pinger for its latency sample.
    pub(crate) fn on_pong(&self) {
        self.pong.notify_waiters();
    }
}

async fn watchdog(
    conn: Weak<Connection>,
    mut activity: watch::Receiver<Instant>,
    recv_timeout: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        let deadline = *activity.borrow() + recv_timeout;
        tokio::select! {
            _ = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)) => {
                let Some(conn) = conn.upgrade() else { break };
                debug!("{}: no heartbeat for {:?}", conn.name(), recv_timeout);
                conn.drop_connection("Receive heartbeat timeout").await;
                break;
            }
            changed = activity.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = shutdown.recv() => break,
        }
    }
}

async fn pinger(
    conn: Weak<Connection>,
    interval: Duration,
    pong: Arc<Notify>,
    latency_ns: Arc<AtomicU64>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        let Some(strong) = conn.upgrade() else { break };
        let sn = strong.next_heartbeat_sn();

        // Register pong interest before the ping leaves, so a fast reply
        // cannot slip between send and await.
        let notified = pong.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let sent_at = Instant::now();
        if let Err(e) = strong.send_heartbeat(sn, false).await {
            debug!("{}: heartbeat #{} send failed: {}", strong.name(), sn, e);
        }
        drop(strong);

        tokio::select! {
            _ = &mut notified => {
                let latency = sent_at.elapsed();
                latency_ns.store(latency.as_nanos() as u64, Ordering::Relaxed);
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown.recv() => break,
                }
            }
            // No pong within the interval: probe again. The watchdog owns
            // the decision to declare the link dead.
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.recv() => break,
        }
    }
}
