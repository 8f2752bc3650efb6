//! Service registry: name↔id lookup, schema fingerprint, api handlers.
//!
//! The registry is compiled once (by whatever schema tooling the embedder
//! uses) and shared read-only across every connection of a server.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use futures::future::BoxFuture;

use crate::call::ApiCall;
use crate::proto::ProtoInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceKind {
    Api,
    Msg,
}

/// One registered service: a callable API or a fire-and-forget message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDef {
    /// Numeric id used by the buffer wire format in place of the name.
    pub id: u16,
    pub name: String,
    pub kind: ServiceKind,
}

/// Compiled registry mapping service names ↔ numeric ids.
pub struct ServiceMap {
    apis: HashMap<String, Arc<ServiceDef>>,
    msgs: HashMap<String, Arc<ServiceDef>>,
    by_id: HashMap<u16, Arc<ServiceDef>>,
    md5: String,
    last_modified: u64,
}

impl ServiceMap {
    pub fn builder() -> ServiceMapBuilder {
        ServiceMapBuilder::default()
    }

    pub fn api(&self, name: &str) -> Option<&Arc<ServiceDef>> {
        self.apis.get(name)
    }

    pub fn msg(&self, name: &str) -> Option<&Arc<ServiceDef>> {
        self.msgs.get(name)
    }

    pub fn by_id(&self, id: u16) -> Option<&Arc<ServiceDef>> {
        self.by_id.get(&id)
    }

    pub fn msg_names(&self) -> impl Iterator<Item = &str> {
        self.msgs.keys().map(String::as_str)
    }

    pub fn md5(&self) -> &str {
        &self.md5
    }

    pub fn last_modified(&self) -> u64 {
        self.last_modified
    }

    /// The local protocol descriptor piggybacked on first exchanges.
    pub fn proto_info(&self) -> ProtoInfo {
        ProtoInfo {
            md5: self.md5.clone(),
            last_modified: self.last_modified,
            runtime: concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")).to_string(),
            platform: None,
        }
    }
}

#[derive(Default)]
pub struct ServiceMapBuilder {
    services: Vec<(String, ServiceKind)>,
    md5: Option<String>,
    last_modified: u64,
}

impl ServiceMapBuilder {
    pub fn add_api(mut self, name: impl Into<String>) -> Self {
        self.services.push((name.into(), ServiceKind::Api));
        self
    }

    pub fn add_msg(mut self, name: impl Into<String>) -> Self {
        self.services.push((name.into(), ServiceKind::Msg));
        self
    }

    /// Use an externally computed fingerprint instead of the derived one.
    pub fn with_fingerprint(mut self, md5: impl Into<String>) -> Self {
        self.md5 = Some(md5.into());
        self
    }

    pub fn with_last_modified(mut self, epoch_ms: u64) -> Self {
        self.last_modified = epoch_ms;
        self
    }

    pub fn build(self) -> anyhow::Result<ServiceMap> {
        let mut apis = HashMap::new();
        let mut msgs = HashMap::new();
        let mut by_id = HashMap::new();
        let mut hasher = blake3::Hasher::new();

        for (i, (name, kind)) in self.services.into_iter().enumerate() {
            let id = u16::try_from(i + 1)
                .map_err(|_| anyhow::anyhow!("too many services (max {})", u16::MAX))?;
            let def = Arc::new(ServiceDef {
                id,
                name: name.clone(),
                kind,
            });
            let table = match kind {
                ServiceKind::Api => &mut apis,
                ServiceKind::Msg => &mut msgs,
            };
            if table.insert(name.clone(), def.clone()).is_some() {
                anyhow::bail!("duplicate service name: {}", name);
            }
            by_id.insert(id, def);
            hasher.update(format!("{}:{:?}:{}\n", id, kind, name).as_bytes());
        }

        let md5 = self
            .md5
            .unwrap_or_else(|| hex::encode(&hasher.finalize().as_bytes()[..16]));

        Ok(ServiceMap {
            apis,
            msgs,
            by_id,
            md5,
            last_modified: self.last_modified,
        })
    }
}

/// An API handler: receives the call object and replies through it.
pub type ApiHandler = Arc<dyn Fn(Arc<ApiCall>) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Name-keyed handler table, shared read-mostly across connections.
#[derive(Default)]
pub struct ApiHandlers {
    map: RwLock<HashMap<String, ApiHandler>>,
}

impl ApiHandlers {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a handler. Returns false (and keeps the existing one) if the
    /// name is already taken.
    pub fn register(&self, name: impl Into<String>, handler: ApiHandler) -> bool {
        let mut map = self.map.write().unwrap_or_else(PoisonError::into_inner);
        match map.entry(name.into()) {
            std::collections::hash_map::Entry::Occupied(_) => false,
            std::collections::hash_map::Entry::Vacant(v) => {
                v.insert(handler);
                true
            }
        }
    }

    /// Register from an async closure.
    pub fn register_fn<F, Fut>(&self, name: impl Into<String>, f: F) -> bool
    where
        F: Fn(Arc<ApiCall>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.register(name, Arc::new(move |call| Box::pin(f(call))))
    }

    pub fn get(&self, name: &str) -> Option<ApiHandler> {
        self.map
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn remove(&self, name: &str) -> bool {
        self.map
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
            .is_some()
    }
}
