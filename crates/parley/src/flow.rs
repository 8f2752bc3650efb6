//! Ordered async middleware chains with early cancel.
//!
//! A [`Flow`] is a FIFO list of middlewares `T -> Option<T>`. `exec` runs
//! them sequentially; a middleware returning `Ok(None)` cancels the chain
//! and the enclosing action, and an error invokes the flow's error hook and
//! cancels as well. Middlewares may rewrite the value; later middlewares
//! see the rewritten one.

use std::sync::{Arc, PoisonError, RwLock};

use futures::future::BoxFuture;
use serde_json::Value;
use tracing::warn;

use crate::call::ApiCall;
use crate::conn::Connection;
use crate::error::ApiReturn;
use crate::proto::{TransportData, WireData};

/// A single middleware. Returns the (possibly rewritten) value to continue,
/// `Ok(None)` to cancel the chain, or an error (also cancels).
pub type FlowNode<T> = Arc<dyn Fn(T) -> BoxFuture<'static, anyhow::Result<Option<T>>> + Send + Sync>;

type ErrorHook = Arc<dyn Fn(&anyhow::Error) + Send + Sync>;

pub struct Flow<T> {
    nodes: RwLock<Vec<FlowNode<T>>>,
    on_error: RwLock<Option<ErrorHook>>,
}

impl<T: Send + 'static> Flow<T> {
    pub fn new() -> Self {
        Self {
            nodes: RwLock::new(Vec::new()),
            on_error: RwLock::new(None),
        }
    }

    /// Append a middleware. Execution order is registration order.
    pub fn push(&self, node: FlowNode<T>) {
        self.nodes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(node);
    }

    /// Append a middleware from an async closure.
    pub fn push_fn<F, Fut>(&self, f: F)
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<Option<T>>> + Send + 'static,
    {
        self.push(Arc::new(move |item| Box::pin(f(item))));
    }

    /// Install the hook invoked when a middleware returns an error.
    pub fn set_error_hook(&self, hook: impl Fn(&anyhow::Error) + Send + Sync + 'static) {
        *self
            .on_error
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(hook));
    }

    pub fn len(&self) -> usize {
        self.nodes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run every middleware in order. `None` means the chain was canceled
    /// and the enclosing action must cancel too.
    pub async fn exec(&self, initial: T) -> Option<T> {
        let nodes: Vec<FlowNode<T>> = self
            .nodes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let mut item = initial;
        for node in nodes {
            match node(item).await {
                Ok(Some(next)) => item = next,
                Ok(None) => return None,
                Err(e) => {
                    let hook = self
                        .on_error
                        .read()
                        .unwrap_or_else(PoisonError::into_inner)
                        .clone();
                    match hook {
                        Some(hook) => hook(&e),
                        None => warn!("flow middleware failed: {}", e),
                    }
                    return None;
                }
            }
        }
        Some(item)
    }
}

impl<T: Send + 'static> Default for Flow<T> {
    fn default() -> Self {
        Self::new()
    }
}

// === Flow item types ===

/// `pre_call_api`: before a call is serialized. Setting `ret` short-circuits
/// the wire exchange and answers the call locally.
pub struct CallApiFlow {
    pub conn: Arc<Connection>,
    pub api_name: String,
    pub req: Value,
    pub ret: Option<ApiReturn>,
}

/// `pre_call_api_return`: before a call's return is handed to the caller.
pub struct CallApiReturnFlow {
    pub conn: Arc<Connection>,
    pub api_name: String,
    pub ret: ApiReturn,
}

/// `pre_api_call`: before an inbound request is dispatched to its handler.
pub struct ApiCallFlow {
    pub call: Arc<ApiCall>,
}

/// `pre_api_call_return`: before a reply leaves the handler side.
pub struct ApiCallReturnFlow {
    pub call: Arc<ApiCall>,
    pub ret: ApiReturn,
}

/// `pre_send_msg`, `post_send_msg` and `pre_recv_msg`.
pub struct MsgFlow {
    pub conn: Arc<Connection>,
    pub name: String,
    pub msg: Value,
}

/// `pre_send_data`: the encoded frame just before it reaches the transport.
pub struct SendDataFlow {
    pub conn: Arc<Connection>,
    pub raw: WireData,
}

/// `pre_recv_data`: the raw frame just after the transport delivered it.
/// A middleware may fully decode it by filling `decoded`.
pub struct RecvDataFlow {
    pub conn: Arc<Connection>,
    pub raw: WireData,
    pub decoded: Option<TransportData>,
}

/// `post_connect`.
pub struct ConnFlow {
    pub conn: Arc<Connection>,
}

/// `post_disconnect`.
pub struct DisconnectFlow {
    pub conn: Arc<Connection>,
    pub is_manual: bool,
    pub reason: Option<String>,
}

/// The connection's flow hooks. A server shares one `Arc<Flows>` across all
/// of its connections; a client owns its own.
#[derive(Default)]
pub struct Flows {
    pub pre_call_api: Flow<CallApiFlow>,
    pub pre_call_api_return: Flow<CallApiReturnFlow>,
    pub pre_api_call: Flow<ApiCallFlow>,
    pub pre_api_call_return: Flow<ApiCallReturnFlow>,
    pub pre_send_msg: Flow<MsgFlow>,
    pub post_send_msg: Flow<MsgFlow>,
    pub pre_recv_msg: Flow<MsgFlow>,
    pub pre_send_data: Flow<SendDataFlow>,
    pub pre_recv_data: Flow<RecvDataFlow>,
    pub post_connect: Flow<ConnFlow>,
    pub post_disconnect: Flow<DisconnectFlow>,
}

impl Flows {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}
