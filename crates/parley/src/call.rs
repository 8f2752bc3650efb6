//! Server-side per-request object.
//!
//! An [`ApiCall`] is constructed for every inbound `req` envelope and
//! handed to the registered handler, which answers through
//! [`succ`](ApiCall::succ) or [`error`](ApiCall::error). Replies are
//! idempotent; uncaught handler errors and missed deadlines are converted
//! into typed error replies. The same type serves both sides of the link —
//! a client answering server-originated calls goes through it too.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::TransportOptions;
use crate::conn::Connection;
use crate::error::{codes, ApiReturn, RpcError};
use crate::flow::{ApiCallFlow, ApiCallReturnFlow};
use crate::proto::TransportData;

pub struct ApiCall {
    conn: Arc<Connection>,
    service_name: String,
    sn: u32,
    req: RwLock<Value>,
    /// The request announced the peer's proto, so the reply announces ours.
    announce_proto: bool,
    replied: AtomicBool,
    started: Instant,
}

impl ApiCall {
    pub(crate) fn new(
        conn: Arc<Connection>,
        service_name: String,
        sn: u32,
        req: Value,
        announce_proto: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            conn,
            service_name,
            sn,
            req: RwLock::new(req),
            announce_proto,
            replied: AtomicBool::new(false),
            started: Instant::now(),
        })
    }

    pub fn conn(&self) -> &Arc<Connection> {
        &self.conn
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn sn(&self) -> u32 {
        self.sn
    }

    /// The request body. Flow middlewares may have rewritten it.
    pub fn req(&self) -> Value {
        self.req
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Rewrite the request body (for `pre_api_call` middlewares).
    pub fn set_req(&self, req: Value) {
        *self.req.write().unwrap_or_else(PoisonError::into_inner) = req;
    }

    /// Parse the request body into a typed value. Failures propagate as
    /// handler errors and become internal-error replies unless caught.
    pub fn parse_req<T: DeserializeOwned>(&self) -> anyhow::Result<T> {
        Ok(serde_json::from_value(self.req())?)
    }

    pub fn is_replied(&self) -> bool {
        self.replied.load(Ordering::SeqCst)
    }

    /// Run the pre-call flow and the registered handler, bounded by the
    /// connection's `api_call_timeout`.
    pub(crate) async fn execute(self: Arc<Self>) {
        let conn = self.conn.clone();
        let flows = conn.flows();

        if flows
            .pre_api_call
            .exec(ApiCallFlow { call: self.clone() })
            .await
            .is_none()
        {
            debug!(
                "{}: [ApiCall] #{} {} dropped by pre-api-call flow",
                conn.name(),
                self.sn,
                self.service_name
            );
            return;
        }

        let Some(handler) = conn.handlers().get(&self.service_name) else {
            let _ = self
                .error(
                    RpcError::remote(format!("Invalid api name: {}", self.service_name))
                        .with_code(codes::INVALID_API),
                )
                .await;
            return;
        };

        let deadline = conn.options().api_call_timeout;
        let fut = handler(self.clone());
        let result = if deadline.is_zero() {
            Ok(fut.await)
        } else {
            tokio::time::timeout(deadline, fut).await
        };

        match result {
            Ok(Ok(())) => {
                // The handler may have kept the call for a deferred reply;
                // it still owes one before the deadline.
                if !deadline.is_zero() && !self.is_replied() {
                    let remaining = deadline.saturating_sub(self.started.elapsed());
                    tokio::time::sleep(remaining).await;
                    if !self.is_replied() {
                        self.timeout_reply().await;
                    }
                }
            }
            Ok(Err(e)) => self.internal_error(e).await,
            Err(_elapsed) => self.timeout_reply().await,
        }
    }

    async fn timeout_reply(self: &Arc<Self>) {
        let _ = self
            .reply(Err(RpcError::new(
                self.conn.side().handler_error_kind(),
                "Remote api timeout",
            )
            .with_code(codes::SERVER_TIMEOUT)))
            .await;
    }

    /// Reply with a successful response body.
    pub async fn succ(self: &Arc<Self>, res: Value) -> anyhow::Result<()> {
        self.reply(Ok(res)).await
    }

    /// Reply with a typed error.
    pub async fn error(self: &Arc<Self>, err: RpcError) -> anyhow::Result<()> {
        self.reply(Err(err)).await
    }

    /// Reply with a business (`ApiError`) failure.
    pub async fn error_msg(self: &Arc<Self>, message: impl Into<String>) -> anyhow::Result<()> {
        self.reply(Err(RpcError::api(message))).await
    }

    async fn internal_error(self: &Arc<Self>, e: anyhow::Error) {
        warn!(
            "{}: [ApiCall] #{} {} handler failed: {}",
            self.conn.name(),
            self.sn,
            self.service_name,
            e
        );
        let mut err = RpcError::new(
            self.conn.side().handler_error_kind(),
            "Internal Server Error",
        )
        .with_code(codes::INTERNAL_ERR);
        if self.conn.options().return_inner_error {
            err = err.with_prop("innerErr", e.to_string());
        }
        let _ = self.reply(Err(err)).await;
    }

    async fn reply(self: &Arc<Self>, ret: ApiReturn) -> anyhow::Result<()> {
        if self.replied.swap(true, Ordering::SeqCst) {
            warn!(
                "{}: [ApiCall] #{} {} already replied, dropping duplicate reply",
                self.conn.name(),
                self.sn,
                self.service_name
            );
            return Ok(());
        }

        let flows = self.conn.flows();
        let Some(item) = flows
            .pre_api_call_return
            .exec(ApiCallReturnFlow {
                call: self.clone(),
                ret,
            })
            .await
        else {
            debug!(
                "{}: [ApiCall] #{} {} reply suppressed by flow",
                self.conn.name(),
                self.sn,
                self.service_name
            );
            return Ok(());
        };

        let proto_info = self
            .announce_proto
            .then(|| self.conn.service_map().proto_info());
        let opts = self.conn.options();
        let (data, outcome) = match item.ret {
            Ok(body) => {
                let outcome = if opts.log_res_body {
                    format!("succ {}", body)
                } else {
                    "succ".to_string()
                };
                (
                    TransportData::Res {
                        service_name: Some(self.service_name.clone()),
                        sn: self.sn,
                        body,
                        proto_info,
                    },
                    outcome,
                )
            }
            Err(err) => {
                let outcome = format!("err {}", err);
                (
                    TransportData::Err {
                        sn: self.sn,
                        err,
                        proto_info,
                    },
                    outcome,
                )
            }
        };

        let sent = self
            .conn
            .send_transport_data(data, &TransportOptions::default())
            .await;
        if opts.log_api {
            debug!(
                "{}: [ApiRes] #{} {} {} ({}ms)",
                self.conn.name(),
                self.sn,
                self.service_name,
                outcome,
                self.started.elapsed().as_millis()
            );
        }
        sent
    }
}
