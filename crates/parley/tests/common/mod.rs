//! Shared setup for the integration suite: two connections linked through
//! the in-memory transport, with a default set of handlers on the server.

use std::sync::Arc;
use std::time::Duration;

use parley::{
    ApiHandlers, ConnOptions, Connection, ConnectionConfig, DataFormat, Flows, JsonCodec,
    MemoryTransport, ServiceMap, Side,
};
use serde_json::json;

pub struct Endpoint {
    pub conn: Arc<Connection>,
    pub transport: Arc<MemoryTransport>,
    pub flows: Arc<Flows>,
    pub handlers: Arc<ApiHandlers>,
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .try_init();
}

pub fn service_map() -> Arc<ServiceMap> {
    Arc::new(
        ServiceMap::builder()
            .add_api("Echo")
            .add_api("Slow")
            .add_api("Fail")
            .add_api("Boom")
            .add_api("NoReply")
            .add_msg("Chat")
            .add_msg("RoomJoin")
            .add_msg("RoomLeave")
            .with_last_modified(1_700_000_000_000)
            .build()
            .unwrap(),
    )
}

/// Echo replies with its request; Slow replies after a second; Fail replies
/// a business error; Boom raises; NoReply never answers.
pub fn register_default_handlers(handlers: &ApiHandlers) {
    handlers.register_fn("Echo", |call| async move {
        let req = call.req();
        call.succ(req).await
    });
    handlers.register_fn("Slow", |call| async move {
        tokio::time::sleep(Duration::from_millis(1000)).await;
        call.succ(json!({"done": true})).await
    });
    handlers.register_fn("Fail", |call| async move {
        call.error_msg("the handler said no").await
    });
    handlers.register_fn("Boom", |_call| async move { anyhow::bail!("kaput") });
    handlers.register_fn("NoReply", |_call| async move { Ok(()) });
}

pub fn endpoint(
    side: Side,
    format: DataFormat,
    opts: ConnOptions,
    map: Arc<ServiceMap>,
    transport: Arc<MemoryTransport>,
) -> Endpoint {
    endpoint_with_codec(side, format, opts, map, transport, Arc::new(JsonCodec::new()))
}

pub fn endpoint_with_codec(
    side: Side,
    format: DataFormat,
    opts: ConnOptions,
    map: Arc<ServiceMap>,
    transport: Arc<MemoryTransport>,
    codec: Arc<dyn parley::Codec>,
) -> Endpoint {
    let flows = Flows::new();
    let handlers = ApiHandlers::new();
    let conn = Connection::new(
        transport.clone(),
        ConnectionConfig {
            side,
            format,
            opts: Arc::new(opts),
            service_map: map,
            codec,
            flows: flows.clone(),
            handlers: handlers.clone(),
        },
    );
    transport.bind(&conn);
    Endpoint {
        conn,
        transport,
        flows,
        handlers,
    }
}

/// A connected client/server pair over one in-memory link, default
/// handlers registered on the server.
pub async fn linked_pair(
    format: DataFormat,
    client_opts: ConnOptions,
    server_opts: ConnOptions,
) -> (Endpoint, Endpoint) {
    let map = service_map();
    let (client_tr, server_tr) = MemoryTransport::pair();
    let client = endpoint(Side::Client, format, client_opts, map.clone(), client_tr);
    let server = endpoint(Side::Server, format, server_opts, map, server_tr);
    register_default_handlers(&server.handlers);
    server.conn.connect().await.unwrap();
    client.conn.connect().await.unwrap();
    (client, server)
}

/// Defaults tuned for tests: short call timeout, quiet logs.
pub fn test_opts(name: &str) -> ConnOptions {
    let mut opts = ConnOptions::new(name);
    opts.call_api_timeout = Duration::from_secs(5);
    opts
}
