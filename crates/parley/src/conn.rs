//! The Connection: one end of a bidirectional RPC link.
//!
//! A single abstraction used identically on both sides — a server merely
//! owns many connections. The connection owns the pending-call table, the
//! message emitter, the heartbeat state and the lifecycle status, and runs
//! the send and receive pipelines:
//!
//! ```text
//! outbound: call_api/send_msg → flows → body encode → envelope encode
//!           → pre_send_data flow → transport
//! inbound:  transport → pre_recv_data flow → envelope decode → body decode
//!           → dispatch (req | res/err | msg | heartbeat | custom)
//! ```
//!
//! All failures surface as values ([`ApiReturn`]); an aborted call returns
//! `None` and nothing else, ever.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};

use regex::Regex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, trace, warn};

use crate::codec::{BodyKind, Codec};
use crate::config::{ConnOptions, TransportOptions};
use crate::emitter::{MsgEmitter, MsgHandler};
use crate::error::{codes, ApiReturn, ErrorKind, RpcError};
use crate::flow::{
    CallApiFlow, CallApiReturnFlow, ConnFlow, DisconnectFlow, Flows, MsgFlow, RecvDataFlow,
    SendDataFlow,
};
use crate::frame::{self, BodyData, Envelope};
use crate::heartbeat::HeartbeatState;
use crate::pending::{PendingCall, PendingCallTable};
use crate::proto::{DataFormat, ProtoInfo, TransportData, WireData};
use crate::seq::SeqGenerator;
use crate::service::{ApiHandlers, ServiceDef, ServiceMap};
use crate::transport::Transport;
use crate::call::ApiCall;

/// Upper bound on the transport's own disconnect hook.
const DISCONNECT_HOOK_TIMEOUT: Duration = Duration::from_secs(3);

/// Which end of the link this connection is. Selects the error kind for
/// local handler failures and nothing else — there is no inheritance split
/// between server and client connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Server,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Client => "client",
            Side::Server => "server",
        }
    }

    /// Error kind for a local handler that threw or timed out.
    pub(crate) fn handler_error_kind(self) -> ErrorKind {
        match self {
            Side::Server => ErrorKind::Server,
            Side::Client => ErrorKind::Client,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle states. Status only ever advances around the cycle; inbound
/// data is dropped and outbound sends fail unless `Connected`.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Disconnecting = 3,
}

impl ConnectionStatus {
    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => ConnectionStatus::Connecting,
            2 => ConnectionStatus::Connected,
            3 => ConnectionStatus::Disconnecting,
            _ => ConnectionStatus::Disconnected,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Disconnecting => "disconnecting",
        }
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Hook for `custom` envelopes.
pub type CustomHandler = Arc<dyn Fn(Arc<Connection>, Value) + Send + Sync>;

/// Everything a connection is built from. On a server, `opts`,
/// `service_map`, `codec`, `flows` and `handlers` are shared across
/// connections; a client owns one of each.
pub struct ConnectionConfig {
    pub side: Side,
    pub format: DataFormat,
    pub opts: Arc<ConnOptions>,
    pub service_map: Arc<ServiceMap>,
    pub codec: Arc<dyn Codec>,
    pub flows: Arc<Flows>,
    pub handlers: Arc<ApiHandlers>,
}

pub struct Connection {
    side: Side,
    format: DataFormat,
    opts: Arc<ConnOptions>,
    service_map: Arc<ServiceMap>,
    codec: Arc<dyn Codec>,
    flows: Arc<Flows>,
    handlers: Arc<ApiHandlers>,
    transport: Arc<dyn Transport>,
    status: AtomicU8,
    sn_gen: SeqGenerator,
    hb_sn_gen: SeqGenerator,
    pending: Mutex<PendingCallTable>,
    emitter: Mutex<MsgEmitter>,
    remote_proto: RwLock<Option<ProtoInfo>>,
    heartbeat: Mutex<Option<HeartbeatState>>,
    hb_latency_ns: Arc<AtomicU64>,
    /// Serializes encode→send so frames leave in issue order.
    send_gate: tokio::sync::Mutex<()>,
    custom_handler: RwLock<Option<CustomHandler>>,
}

impl Connection {
    pub fn new(transport: Arc<dyn Transport>, config: ConnectionConfig) -> Arc<Self> {
        Arc::new(Self {
            side: config.side,
            format: config.format,
            opts: config.opts,
            service_map: config.service_map,
            codec: config.codec,
            flows: config.flows,
            handlers: config.handlers,
            transport,
            status: AtomicU8::new(ConnectionStatus::Disconnected as u8),
            sn_gen: SeqGenerator::new(),
            hb_sn_gen: SeqGenerator::new(),
            pending: Mutex::new(PendingCallTable::new()),
            emitter: Mutex::new(MsgEmitter::new()),
            remote_proto: RwLock::new(None),
            heartbeat: Mutex::new(None),
            hb_latency_ns: Arc::new(AtomicU64::new(0)),
            send_gate: tokio::sync::Mutex::new(()),
            custom_handler: RwLock::new(None),
        })
    }

    // === accessors ===

    pub fn name(&self) -> &str {
        &self.opts.name
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn options(&self) -> &ConnOptions {
        &self.opts
    }

    pub fn service_map(&self) -> &Arc<ServiceMap> {
        &self.service_map
    }

    pub fn flows(&self) -> &Arc<Flows> {
        &self.flows
    }

    pub fn handlers(&self) -> &Arc<ApiHandlers> {
        &self.handlers
    }

    pub fn status(&self) -> ConnectionStatus {
        ConnectionStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    pub fn pending_count(&self) -> usize {
        self.pending_table().len()
    }

    /// Round-trip latency of the most recent heartbeat exchange. Survives
    /// heartbeat shutdown.
    pub fn last_heartbeat_latency(&self) -> Option<Duration> {
        let ns = self.hb_latency_ns.load(Ordering::Relaxed);
        (ns > 0).then(|| Duration::from_nanos(ns))
    }

    /// The peer's protocol descriptor, once learned.
    pub fn remote_proto(&self) -> Option<ProtoInfo> {
        self.remote_proto
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_custom_handler(&self, handler: CustomHandler) {
        *self
            .custom_handler
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    fn pending_table(&self) -> MutexGuard<'_, PendingCallTable> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emitter_table(&self) -> MutexGuard<'_, MsgEmitter> {
        self.emitter.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_status(&self, status: ConnectionStatus) {
        self.status.store(status as u8, Ordering::SeqCst);
    }

    fn cas_status(&self, from: ConnectionStatus, to: ConnectionStatus) -> bool {
        self.status
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    // === lifecycle ===

    /// Bring the connection up: run the transport's `do_connect`, start
    /// heartbeats, run the `post_connect` flow.
    pub async fn connect(self: &Arc<Self>) -> Result<(), RpcError> {
        if !self.cas_status(ConnectionStatus::Disconnected, ConnectionStatus::Connecting) {
            return Err(RpcError::local(format!(
                "Cannot connect while {}",
                self.status()
            )));
        }
        if self.opts.log_connect {
            info!("{}: connecting", self.name());
        }
        if let Err(e) = self.transport.do_connect().await {
            self.set_status(ConnectionStatus::Disconnected);
            return Err(RpcError::local(format!("Connect failed: {e}")));
        }
        self.set_status(ConnectionStatus::Connected);
        if self.opts.log_connect {
            info!("{}: connected", self.name());
        }
        if self.opts.heartbeat.enabled {
            let state = HeartbeatState::start(self, &self.opts.heartbeat, self.hb_latency_ns.clone());
            *self
                .heartbeat
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = Some(state);
        }
        let _ = self
            .flows
            .post_connect
            .exec(ConnFlow { conn: self.clone() })
            .await;
        Ok(())
    }

    /// Manual disconnect. A no-op when already disconnected; rejected while
    /// a transition is in flight.
    pub async fn disconnect(self: &Arc<Self>, reason: Option<&str>) -> Result<(), RpcError> {
        match self.status() {
            ConnectionStatus::Disconnected => Ok(()),
            ConnectionStatus::Connecting | ConnectionStatus::Disconnecting => Err(
                RpcError::local(format!("Cannot disconnect while {}", self.status())),
            ),
            ConnectionStatus::Connected => {
                self.disconnect_with(true, reason).await;
                Ok(())
            }
        }
    }

    /// Internal disconnect used by the heartbeat watchdog and transports.
    pub(crate) async fn drop_connection(self: &Arc<Self>, reason: &str) {
        self.disconnect_with(false, Some(reason)).await;
    }

    async fn disconnect_with(self: &Arc<Self>, is_manual: bool, reason: Option<&str>) {
        if !self.cas_status(ConnectionStatus::Connected, ConnectionStatus::Disconnecting) {
            return;
        }
        if self.opts.log_connect {
            info!(
                "{}: disconnecting ({})",
                self.name(),
                reason.unwrap_or(if is_manual { "manual" } else { "unspecified" })
            );
        }

        if let Some(hb) = self
            .heartbeat
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            hb.stop();
        }

        // Every in-flight call fails before any user-visible post hook runs.
        let drained = self.pending_table().drain();
        if !drained.is_empty() {
            debug!(
                "{}: failing {} pending calls (lost connection)",
                self.name(),
                drained.len()
            );
            for call in drained {
                call.resolve(Err(RpcError::network("Lost connection to remote")
                    .with_code(codes::LOST_CONN)));
            }
        }

        match tokio::time::timeout(
            DISCONNECT_HOOK_TIMEOUT,
            self.transport.do_disconnect(is_manual, reason),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("{}: transport disconnect failed: {}", self.name(), e),
            Err(_) => warn!("{}: transport disconnect timed out", self.name()),
        }

        self.set_status(ConnectionStatus::Disconnected);
        if self.opts.log_connect {
            info!("{}: disconnected", self.name());
        }
        let _ = self
            .flows
            .post_disconnect
            .exec(DisconnectFlow {
                conn: self.clone(),
                is_manual,
                reason: reason.map(String::from),
            })
            .await;
    }

    // === outbound: calls ===

    /// Call a remote API. Resolves to `Some(Ok)` or `Some(Err)` — never
    /// panics, never rejects — or to `None` when the call was aborted.
    pub async fn call_api(
        self: &Arc<Self>,
        api_name: &str,
        req: Value,
        mut opts: TransportOptions,
    ) -> Option<ApiReturn> {
        let sn = self.sn_gen.next();
        let timeout = opts.timeout.unwrap_or(self.opts.call_api_timeout);
        let started = Instant::now();
        if self.opts.log_api {
            if self.opts.log_req_body {
                debug!("{}: [callApi] #{} {} req={}", self.name(), sn, api_name, req);
            } else {
                debug!("{}: [callApi] #{} {}", self.name(), sn, api_name);
            }
        }

        let (ret_tx, mut ret_rx) = tokio::sync::oneshot::channel();
        let pending_call = PendingCall::new(sn, api_name, req.clone(), opts.abort_key.take(), ret_tx);
        let aborted = pending_call.aborted_flag();
        self.pending_table().insert(pending_call);

        if let Some(signal) = opts.abort_signal.take() {
            let conn = Arc::downgrade(self);
            tokio::spawn(async move {
                if signal.await.is_ok() {
                    if let Some(conn) = conn.upgrade() {
                        conn.abort(sn);
                    }
                }
            });
        }

        let item = CallApiFlow {
            conn: self.clone(),
            api_name: api_name.to_string(),
            req,
            ret: None,
        };
        let Some(item) = self.flows.pre_call_api.exec(item).await else {
            self.abort(sn);
            return None;
        };
        if aborted.load(Ordering::SeqCst) {
            return None;
        }
        let CallApiFlow {
            req,
            ret: short_circuit,
            ..
        } = item;

        let ret = if let Some(ret) = short_circuit {
            // The flow answered the call locally; nothing goes on the wire.
            self.pending_table().remove(sn);
            ret
        } else {
            let proto_info = self
                .remote_proto()
                .is_none()
                .then(|| self.service_map.proto_info());
            let data = TransportData::Req {
                service_name: api_name.to_string(),
                sn,
                body: req,
                proto_info,
            };
            if let Err(e) = self.send_transport_data(data, &opts).await {
                if aborted.load(Ordering::SeqCst) {
                    return None;
                }
                self.pending_table().remove(sn);
                return Some(Err(RpcError::local(format!("Failed to send request: {e}"))));
            }
            if aborted.load(Ordering::SeqCst) {
                return None;
            }

            let outcome = if timeout.is_zero() {
                Some(ret_rx.await)
            } else {
                let deadline = tokio::time::Instant::from_std(started) + timeout;
                let sleep = tokio::time::sleep_until(deadline);
                tokio::pin!(sleep);
                tokio::select! {
                    r = &mut ret_rx => Some(r),
                    _ = &mut sleep => {
                        let removed = self.pending_table().remove(sn);
                        match removed {
                            Some(_call) => None, // timeout wins the race
                            // A return or abort beat the deadline; take it.
                            None => Some(ret_rx.await),
                        }
                    }
                }
            };

            match outcome {
                None => {
                    if self.opts.log_api {
                        debug!(
                            "{}: [callApi] #{} {} timed out after {:?}",
                            self.name(),
                            sn,
                            api_name,
                            timeout
                        );
                    }
                    return Some(Err(
                        RpcError::network("Request Timeout").with_code(codes::TIMEOUT)
                    ));
                }
                Some(Err(_closed)) => {
                    // Resolver dropped without sending: abort, or teardown.
                    return if aborted.load(Ordering::SeqCst) {
                        None
                    } else {
                        Some(Err(RpcError::network("Lost connection to remote")
                            .with_code(codes::LOST_CONN)))
                    };
                }
                Some(Ok(ret)) => ret,
            }
        };
        if aborted.load(Ordering::SeqCst) {
            return None;
        }

        let item = CallApiReturnFlow {
            conn: self.clone(),
            api_name: api_name.to_string(),
            ret,
        };
        let Some(item) = self.flows.pre_call_api_return.exec(item).await else {
            self.abort(sn);
            return None;
        };
        if aborted.load(Ordering::SeqCst) {
            return None;
        }

        if self.opts.log_api {
            match &item.ret {
                Ok(body) => {
                    if self.opts.log_res_body {
                        debug!(
                            "{}: [ApiReturn] #{} {} succ {} ({}ms)",
                            self.name(),
                            sn,
                            api_name,
                            body,
                            started.elapsed().as_millis()
                        );
                    } else {
                        debug!(
                            "{}: [ApiReturn] #{} {} succ ({}ms)",
                            self.name(),
                            sn,
                            api_name,
                            started.elapsed().as_millis()
                        );
                    }
                }
                Err(e) => debug!(
                    "{}: [ApiReturn] #{} {} err {} ({}ms)",
                    self.name(),
                    sn,
                    api_name,
                    e,
                    started.elapsed().as_millis()
                ),
            }
        }
        Some(item.ret)
    }

    /// Typed wrapper over [`call_api`](Self::call_api). Body mapping
    /// failures surface as `LocalError`s.
    pub async fn call<Req, Res>(
        self: &Arc<Self>,
        api_name: &str,
        req: &Req,
        opts: TransportOptions,
    ) -> Option<ApiReturn<Res>>
    where
        Req: Serialize,
        Res: DeserializeOwned,
    {
        let req = match serde_json::to_value(req) {
            Ok(v) => v,
            Err(e) => {
                return Some(Err(RpcError::local(format!(
                    "Failed to serialize request: {e}"
                ))))
            }
        };
        let ret = self.call_api(api_name, req, opts).await?;
        Some(ret.and_then(|body| {
            serde_json::from_value(body)
                .map_err(|e| RpcError::local(format!("Failed to deserialize response: {e}")))
        }))
    }

    /// Abort one in-flight call. Its `call_api` future yields `None`; a
    /// late reply is dropped. Idempotent.
    pub fn abort(&self, sn: u32) -> bool {
        self.pending_table().abort(sn)
    }

    /// Abort every in-flight call registered under `key`.
    pub fn abort_by_key(&self, key: &str) -> usize {
        self.pending_table().abort_by_key(key)
    }

    pub fn abort_all(&self) -> usize {
        self.pending_table().abort_all()
    }

    // === outbound: messages ===

    /// Fire-and-forget message. `Some(Ok)` means handed to the transport;
    /// `None` means a `pre_send_msg` middleware canceled the send.
    pub async fn send_msg(
        self: &Arc<Self>,
        msg_name: &str,
        msg: Value,
        opts: TransportOptions,
    ) -> Option<Result<(), RpcError>> {
        if self.service_map.msg(msg_name).is_none() {
            return Some(Err(RpcError::local(format!(
                "Invalid msg name: {msg_name}"
            ))));
        }
        let item = MsgFlow {
            conn: self.clone(),
            name: msg_name.to_string(),
            msg,
        };
        let Some(item) = self.flows.pre_send_msg.exec(item).await else {
            debug!(
                "{}: [sendMsg] {} canceled by pre-send flow",
                self.name(),
                msg_name
            );
            return None;
        };
        let data = TransportData::Msg {
            service_name: item.name.clone(),
            body: item.msg.clone(),
        };
        if let Err(e) = self.send_transport_data(data, &opts).await {
            return Some(Err(RpcError::local(format!("Failed to send message: {e}"))));
        }
        if self.opts.log_msg {
            debug!("{}: [sendMsg] {}", self.name(), item.name);
        }
        let _ = self.flows.post_send_msg.exec(item).await;
        Some(Ok(()))
    }

    /// Send an opaque `custom` envelope. The peer passes it to its
    /// registered custom handler untouched.
    pub async fn send_custom(
        self: &Arc<Self>,
        body: Value,
        opts: TransportOptions,
    ) -> Result<(), RpcError> {
        self.send_transport_data(TransportData::Custom { body }, &opts)
            .await
            .map_err(|e| RpcError::local(format!("Failed to send custom data: {e}")))
    }

    /// Typed wrapper over [`send_msg`](Self::send_msg).
    pub async fn send<Msg: Serialize>(
        self: &Arc<Self>,
        msg_name: &str,
        msg: &Msg,
        opts: TransportOptions,
    ) -> Option<Result<(), RpcError>> {
        let msg = match serde_json::to_value(msg) {
            Ok(v) => v,
            Err(e) => {
                return Some(Err(RpcError::local(format!(
                    "Failed to serialize message: {e}"
                ))))
            }
        };
        self.send_msg(msg_name, msg, opts).await
    }

    // === message subscriptions ===

    /// Subscribe to a message by literal name.
    pub fn listen_msg(&self, name: &str, handler: MsgHandler) -> bool {
        self.emitter_table().on(name, handler)
    }

    /// Subscribe for a single delivery.
    pub fn listen_msg_once(&self, name: &str, handler: MsgHandler) -> bool {
        self.emitter_table().once(name, handler)
    }

    /// Remove one subscriber, or all subscribers of `name` when `handler`
    /// is `None`.
    pub fn unlisten_msg(&self, name: &str, handler: Option<&MsgHandler>) -> usize {
        self.emitter_table().off(name, handler)
    }

    /// Subscribe to every message service whose name matches `pattern`,
    /// enumerated from the service map at subscription time. Returns the
    /// number of names subscribed.
    pub fn listen_msg_pattern(&self, pattern: &Regex, handler: MsgHandler) -> usize {
        let mut subscribed = 0;
        for name in self.service_map.msg_names() {
            if pattern.is_match(name) && self.emitter_table().on(name, handler.clone()) {
                subscribed += 1;
            }
        }
        subscribed
    }

    // === outbound pipeline ===

    pub(crate) fn next_heartbeat_sn(&self) -> u32 {
        self.hb_sn_gen.next()
    }

    pub(crate) async fn send_heartbeat(
        self: &Arc<Self>,
        sn: u32,
        is_reply: bool,
    ) -> anyhow::Result<()> {
        if self.opts.debug_frames {
            trace!(
                "{}: [Heartbeat] send #{} {}",
                self.name(),
                sn,
                if is_reply { "pong" } else { "ping" }
            );
        }
        self.send_transport_data(
            TransportData::Heartbeat { sn, is_reply },
            &TransportOptions::default(),
        )
        .await
    }

    /// Encode and send one envelope: body codec → envelope codec →
    /// `pre_send_data` flow → transport. Sends issued in order leave in
    /// order; the gate spans encode and send.
    pub(crate) async fn send_transport_data(
        self: &Arc<Self>,
        data: TransportData,
        opts: &TransportOptions,
    ) -> anyhow::Result<()> {
        if self.status() != ConnectionStatus::Connected {
            anyhow::bail!("Connection is not connected (status: {})", self.status());
        }
        let format = opts.format.unwrap_or(self.format);
        let _gate = self.send_gate.lock().await;
        let raw = self.encode_data(&data, format)?;
        if self.opts.debug_frames {
            trace!(
                "{}: [SendFrame] {} ({} bytes)",
                self.name(),
                data.kind_str(),
                raw.len()
            );
        }
        let item = SendDataFlow {
            conn: self.clone(),
            raw,
        };
        let Some(item) = self.flows.pre_send_data.exec(item).await else {
            anyhow::bail!("Canceled by pre-send-data flow");
        };
        self.transport.send_raw(item.raw, &data, opts).await
    }

    fn api_service(&self, name: &str) -> anyhow::Result<Arc<ServiceDef>> {
        self.service_map
            .api(name)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("Invalid api name: {name}"))
    }

    fn msg_service(&self, name: &str) -> anyhow::Result<Arc<ServiceDef>> {
        self.service_map
            .msg(name)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("Invalid msg name: {name}"))
    }

    fn encode_data(&self, data: &TransportData, format: DataFormat) -> anyhow::Result<WireData> {
        let validate = !self.opts.skip_encode_validate;
        match format {
            DataFormat::Text => {
                let normalized = match data.clone() {
                    TransportData::Req {
                        service_name,
                        sn,
                        body,
                        proto_info,
                    } => {
                        let service = self.api_service(&service_name)?;
                        let body = self.codec.encode_body(&service, BodyKind::Req, body, validate)?;
                        TransportData::Req {
                            service_name,
                            sn,
                            body,
                            proto_info,
                        }
                    }
                    TransportData::Res {
                        service_name,
                        sn,
                        body,
                        proto_info,
                    } => {
                        let name = service_name
                            .as_deref()
                            .ok_or_else(|| anyhow::anyhow!("Outbound res without service name"))?;
                        let service = self.api_service(name)?;
                        let body = self.codec.encode_body(&service, BodyKind::Res, body, validate)?;
                        TransportData::Res {
                            service_name,
                            sn,
                            body,
                            proto_info,
                        }
                    }
                    TransportData::Msg { service_name, body } => {
                        let service = self.msg_service(&service_name)?;
                        let body = self.codec.encode_body(&service, BodyKind::Msg, body, validate)?;
                        TransportData::Msg { service_name, body }
                    }
                    other => other,
                };
                Ok(WireData::Text(frame::encode_box_text(&normalized)?))
            }
            DataFormat::Buffer => {
                let body = match data {
                    TransportData::Req {
                        service_name, body, ..
                    } => {
                        let service = self.api_service(service_name)?;
                        Some(self.codec.encode_body_buffer(&service, BodyKind::Req, body, validate)?)
                    }
                    TransportData::Res {
                        service_name, body, ..
                    } => {
                        let name = service_name
                            .as_deref()
                            .ok_or_else(|| anyhow::anyhow!("Outbound res without service name"))?;
                        let service = self.api_service(name)?;
                        Some(self.codec.encode_body_buffer(&service, BodyKind::Res, body, validate)?)
                    }
                    TransportData::Msg { service_name, body } => {
                        let service = self.msg_service(service_name)?;
                        Some(self.codec.encode_body_buffer(&service, BodyKind::Msg, body, validate)?)
                    }
                    TransportData::Custom { body } => {
                        Some(bytes::Bytes::from(rmp_serde::to_vec_named(body)?))
                    }
                    TransportData::Err { .. } | TransportData::Heartbeat { .. } => None,
                };
                Ok(WireData::Binary(frame::encode_box_buffer(
                    data,
                    body.as_ref(),
                    &self.service_map,
                )?))
            }
        }
    }

    // === inbound pipeline ===

    /// Sole inbound entry point, invoked by the transport for every frame.
    pub async fn recv_data(self: &Arc<Self>, raw: WireData) {
        if self.status() != ConnectionStatus::Connected {
            debug!(
                "{}: dropping inbound data while {}",
                self.name(),
                self.status()
            );
            return;
        }
        if self.opts.debug_frames {
            trace!("{}: [RecvFrame] {} bytes", self.name(), raw.len());
        }

        let item = RecvDataFlow {
            conn: self.clone(),
            raw,
            decoded: None,
        };
        let Some(item) = self.flows.pre_recv_data.exec(item).await else {
            return;
        };
        if let Some(data) = item.decoded {
            // A middleware already decoded the frame; skip the codecs.
            self.dispatch(data).await;
            return;
        }

        let decoded = match &item.raw {
            WireData::Text(s) => frame::decode_box_text(s),
            WireData::Binary(b) => {
                let pending = self.pending_table();
                frame::decode_box_buffer(b, &self.service_map, &pending)
            }
        };
        let envelope = match decoded {
            Ok(env) => env,
            Err(e) => {
                warn!("{}: failed to decode inbound envelope: {}", self.name(), e);
                // sn=0: not tied to any call; tells the peer we could not
                // read what they sent.
                let err = TransportData::Err {
                    sn: 0,
                    err: RpcError::remote(format!("Invalid request data: {e}")),
                    proto_info: None,
                };
                let _ = self
                    .send_transport_data(err, &TransportOptions::default())
                    .await;
                return;
            }
        };

        if let Some(pi) = envelope.proto_info() {
            self.cache_remote_proto(pi.clone());
        }
        self.dispatch_envelope(envelope).await;
    }

    /// Body-decode an envelope and dispatch it. Body decode failures follow
    /// the propagation policy: reply an `err` for requests, synthesize a
    /// `LocalError` for responses.
    async fn dispatch_envelope(self: &Arc<Self>, envelope: Envelope) {
        match envelope {
            Envelope::Req {
                service_name,
                sn,
                proto_info,
                body,
            } => {
                let Some(service) = self.service_map.api(&service_name).cloned() else {
                    let err = RpcError::remote(format!("Invalid api name: {service_name}"))
                        .with_code(codes::INVALID_API);
                    let _ = self
                        .send_transport_data(
                            TransportData::Err {
                                sn,
                                err,
                                proto_info: None,
                            },
                            &TransportOptions::default(),
                        )
                        .await;
                    return;
                };
                match self.decode_body_data(&service, BodyKind::Req, body) {
                    Ok(value) => {
                        self.dispatch(TransportData::Req {
                            service_name,
                            sn,
                            body: value,
                            proto_info,
                        })
                        .await;
                    }
                    Err(e) => {
                        let msg =
                            self.desync_message(format!("Failed to decode request body: {}", e.message));
                        warn!("{}: [ApiCall] #{} {}", self.name(), sn, msg);
                        let _ = self
                            .send_transport_data(
                                TransportData::Err {
                                    sn,
                                    err: RpcError::remote(msg),
                                    proto_info: None,
                                },
                                &TransportOptions::default(),
                            )
                            .await;
                    }
                }
            }
            Envelope::Res {
                service_name,
                sn,
                proto_info: _,
                body,
            } => {
                let api_name = service_name
                    .or_else(|| self.pending_table().api_name(sn).map(String::from));
                let Some(api_name) = api_name else {
                    debug!("{}: dropping response for unknown sn {}", self.name(), sn);
                    return;
                };
                let Some(service) = self.service_map.api(&api_name).cloned() else {
                    debug!(
                        "{}: dropping response for unknown service {}",
                        self.name(),
                        api_name
                    );
                    return;
                };
                match self.decode_body_data(&service, BodyKind::Res, body) {
                    Ok(value) => {
                        self.dispatch(TransportData::Res {
                            service_name: Some(api_name),
                            sn,
                            body: value,
                            proto_info: None,
                        })
                        .await;
                    }
                    Err(e) => {
                        // The caller is waiting; it sees a LocalError.
                        let msg = self
                            .desync_message(format!("Failed to decode response body: {}", e.message));
                        warn!("{}: [ApiReturn] #{} {}", self.name(), sn, msg);
                        self.resolve_pending(sn, Err(RpcError::local(msg)));
                    }
                }
            }
            Envelope::Err {
                sn,
                proto_info: _,
                err,
            } => {
                self.dispatch(TransportData::Err {
                    sn,
                    err,
                    proto_info: None,
                })
                .await;
            }
            Envelope::Msg { service_name, body } => {
                let Some(service) = self.service_map.msg(&service_name).cloned() else {
                    warn!("{}: dropping msg for unknown service {}", self.name(), service_name);
                    return;
                };
                match self.decode_body_data(&service, BodyKind::Msg, body) {
                    Ok(value) => {
                        self.dispatch(TransportData::Msg {
                            service_name,
                            body: value,
                        })
                        .await;
                    }
                    Err(e) => {
                        warn!(
                            "{}: dropping msg {}: {}",
                            self.name(),
                            service_name,
                            e.message
                        );
                    }
                }
            }
            Envelope::Heartbeat { sn, is_reply } => {
                self.dispatch(TransportData::Heartbeat { sn, is_reply }).await;
            }
            Envelope::Custom { body } => {
                let value = match body {
                    BodyData::Json(v) => v,
                    BodyData::Bin(b) => match rmp_serde::from_slice(&b) {
                        Ok(v) => v,
                        Err(e) => {
                            warn!("{}: dropping custom data: {}", self.name(), e);
                            return;
                        }
                    },
                };
                self.dispatch(TransportData::Custom { body: value }).await;
            }
        }
    }

    /// Dispatch a fully decoded envelope by tag.
    async fn dispatch(self: &Arc<Self>, data: TransportData) {
        match data {
            TransportData::Req {
                service_name,
                sn,
                body,
                proto_info,
            } => {
                let announce = proto_info.is_some();
                if let Some(pi) = proto_info {
                    self.cache_remote_proto(pi);
                }
                if self.opts.log_api {
                    if self.opts.log_req_body {
                        debug!(
                            "{}: [ApiReq] #{} {} req={}",
                            self.name(),
                            sn,
                            service_name,
                            body
                        );
                    } else {
                        debug!("{}: [ApiReq] #{} {}", self.name(), sn, service_name);
                    }
                }
                let call = ApiCall::new(self.clone(), service_name, sn, body, announce);
                // Handlers run concurrently; dispatch order is spawn order.
                tokio::spawn(call.execute());
            }
            TransportData::Res { sn, body, .. } => {
                self.resolve_pending(sn, Ok(body));
            }
            TransportData::Err { sn: 0, err, .. } => {
                // Global report: the peer could not decode something we sent.
                warn!("{}: peer-side decode failure: {}", self.name(), err);
            }
            TransportData::Err { sn, err, .. } => {
                self.resolve_pending(sn, Err(err));
            }
            TransportData::Msg { service_name, body } => {
                let item = MsgFlow {
                    conn: self.clone(),
                    name: service_name,
                    msg: body,
                };
                let Some(item) = self.flows.pre_recv_msg.exec(item).await else {
                    return;
                };
                if self.opts.log_msg {
                    debug!("{}: [recvMsg] {}", self.name(), item.name);
                }
                let delivered = self.emitter_table().emit(&item.name, &item.msg);
                if delivered == 0 {
                    debug!("{}: no listeners for msg {}", self.name(), item.name);
                }
            }
            TransportData::Heartbeat { sn, is_reply } => {
                if self.opts.debug_frames {
                    trace!(
                        "{}: [Heartbeat] recv #{} {}",
                        self.name(),
                        sn,
                        if is_reply { "pong" } else { "ping" }
                    );
                }
                {
                    let hb = self
                        .heartbeat
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner);
                    if let Some(hb) = &*hb {
                        hb.on_heartbeat();
                        if is_reply {
                            hb.on_pong();
                        }
                    }
                }
                if !is_reply {
                    // Reply even when local heartbeats are disabled: one side
                    // sends, the other only needs to answer.
                    let _ = self.send_heartbeat(sn, true).await;
                }
            }
            TransportData::Custom { body } => {
                let handler = self
                    .custom_handler
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone();
                match handler {
                    Some(h) => h(self.clone(), body),
                    None => debug!("{}: custom data dropped (no handler)", self.name()),
                }
            }
        }
    }

    fn decode_body_data(
        &self,
        service: &ServiceDef,
        kind: BodyKind,
        body: BodyData,
    ) -> Result<Value, RpcError> {
        let validate = !self.opts.skip_decode_validate;
        match body {
            BodyData::Json(v) => self.codec.decode_body(service, kind, v, validate),
            BodyData::Bin(b) => self.codec.decode_body_buffer(service, kind, &b, validate),
        }
    }

    fn resolve_pending(&self, sn: u32, ret: ApiReturn) {
        let call = self.pending_table().remove(sn);
        match call {
            Some(call) => {
                if !call.resolve(ret) {
                    debug!("{}: dropping reply for aborted call #{}", self.name(), sn);
                }
            }
            None => debug!("{}: dropping reply for unknown sn {}", self.name(), sn),
        }
    }

    fn cache_remote_proto(&self, pi: ProtoInfo) {
        let mut remote = self
            .remote_proto
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if remote.as_ref() != Some(&pi) {
            if let Some(prev) = remote.as_ref() {
                if prev.md5 != pi.md5 {
                    info!(
                        "{}: remote proto changed ({} -> {})",
                        self.name(),
                        prev.md5,
                        pi.md5
                    );
                }
            }
            *remote = Some(pi);
        }
    }

    /// Append a proto-desync explanation when the fingerprints differ,
    /// naming which side is newer by last-modified time.
    fn desync_message(&self, base: String) -> String {
        let Some(remote) = self.remote_proto() else {
            return base;
        };
        if remote.md5 == self.service_map.md5() {
            return base;
        }
        let newer = if remote.last_modified > self.service_map.last_modified() {
            "remote"
        } else {
            "local"
        };
        format!(
            "{} (proto desync: local md5 {}, remote md5 {}; {} side is newer)",
            base,
            self.service_map.md5(),
            remote.md5,
            newer
        )
    }
}
