//! parley — bidirectional typed RPC connection runtime.
//!
//! One [`Connection`] abstraction multiplexes three message genres over a
//! single reliable transport: request/response API calls, fire-and-forget
//! messages, and liveness heartbeats. The same type serves both ends of the
//! link; a server merely owns many connections.
//!
//! The crate is the connection core: correlation and cancellation of
//! in-flight calls, the send/receive codec pipelines with user-visible flow
//! hooks, the lifecycle state machine, and the heartbeat subsystem.
//! Concrete transports are collaborators implementing [`Transport`];
//! [`mem::MemoryTransport`] links two connections in-process.
//!
//! ```no_run
//! use std::sync::Arc;
//! use parley::{
//!     ApiHandlers, ConnOptions, Connection, ConnectionConfig, DataFormat, Flows, JsonCodec,
//!     MemoryTransport, ServiceMap, Side, TransportOptions,
//! };
//! use serde_json::json;
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let service_map = Arc::new(ServiceMap::builder().add_api("Echo").build()?);
//! let handlers = ApiHandlers::new();
//! handlers.register_fn("Echo", |call| async move {
//!     let req = call.req();
//!     call.succ(req).await
//! });
//!
//! let (transport, _peer) = MemoryTransport::pair();
//! let conn = Connection::new(
//!     transport.clone(),
//!     ConnectionConfig {
//!         side: Side::Client,
//!         format: DataFormat::Text,
//!         opts: Arc::new(ConnOptions::new("client")),
//!         service_map,
//!         codec: Arc::new(JsonCodec::new()),
//!         flows: Flows::new(),
//!         handlers,
//!     },
//! );
//! transport.bind(&conn);
//! conn.connect().await?;
//!
//! match conn.call_api("Echo", json!({"text": "hi"}), TransportOptions::default()).await {
//!     Some(Ok(res)) => println!("echoed: {res}"),
//!     Some(Err(e)) => println!("failed: {e}"),
//!     None => println!("aborted"),
//! }
//! # Ok(())
//! # }
//! ```

pub mod call;
pub mod codec;
pub mod config;
pub mod conn;
pub mod emitter;
pub mod error;
pub mod flow;
pub mod frame;
pub mod heartbeat;
pub mod mem;
pub mod pending;
pub mod proto;
pub mod seq;
pub mod service;
pub mod transport;

pub use call::ApiCall;
pub use codec::{BodyKind, Codec, JsonCodec, Validator};
pub use config::{ConnOptions, TransportOptions};
pub use conn::{Connection, ConnectionConfig, ConnectionStatus, CustomHandler, Side};
pub use emitter::{MsgEmitter, MsgHandler};
pub use error::{codes, ApiReturn, ErrorKind, RpcError};
pub use flow::{Flow, Flows};
pub use frame::{BodyData, Envelope, FrameError};
pub use heartbeat::HeartbeatConfig;
pub use mem::MemoryTransport;
pub use pending::{PendingCall, PendingCallTable};
pub use proto::{DataFormat, ProtoInfo, TransportData, WireData};
pub use seq::{SeqGenerator, SN_CEILING};
pub use service::{ApiHandler, ApiHandlers, ServiceDef, ServiceKind, ServiceMap, ServiceMapBuilder};
pub use transport::Transport;
