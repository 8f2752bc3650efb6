//! In-flight call tracking.
//!
//! Each outbound call registers a [`PendingCall`] before its request is
//! serialized. A call leaves the table exactly once: when its return
//! arrives, when its timeout fires, or when it is aborted. An aborted
//! call's resolver is dropped without sending, so the awaiting side
//! observes a closed channel and yields the aborted sentinel.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::ApiReturn;

/// One outstanding request awaiting its `res` or `err`.
pub struct PendingCall {
    pub sn: u32,
    pub api_name: String,
    pub req: Value,
    pub abort_key: Option<String>,
    aborted: Arc<AtomicBool>,
    ret_tx: Option<oneshot::Sender<ApiReturn>>,
    on_abort: Option<Box<dyn FnOnce() + Send>>,
}

impl PendingCall {
    pub fn new(
        sn: u32,
        api_name: impl Into<String>,
        req: Value,
        abort_key: Option<String>,
        ret_tx: oneshot::Sender<ApiReturn>,
    ) -> Self {
        Self {
            sn,
            api_name: api_name.into(),
            req,
            abort_key,
            aborted: Arc::new(AtomicBool::new(false)),
            ret_tx: Some(ret_tx),
            on_abort: None,
        }
    }

    /// Attach a hook fired when this call is aborted.
    pub fn with_on_abort(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.on_abort = Some(Box::new(f));
        self
    }

    /// Shared flag the awaiting side re-checks after every suspension point.
    pub fn aborted_flag(&self) -> Arc<AtomicBool> {
        self.aborted.clone()
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// Hand the return to the awaiting caller. Returns false if the call was
    /// aborted or the caller is gone.
    pub(crate) fn resolve(mut self, ret: ApiReturn) -> bool {
        if self.aborted.load(Ordering::SeqCst) {
            return false;
        }
        match self.ret_tx.take() {
            Some(tx) => tx.send(ret).is_ok(),
            None => false,
        }
    }

    /// Mark aborted and drop the resolver without sending.
    pub(crate) fn abort(mut self) {
        self.aborted.store(true, Ordering::SeqCst);
        self.ret_tx.take();
        if let Some(f) = self.on_abort.take() {
            f();
        }
    }
}

/// Map of in-flight calls plus the abort-key secondary index.
#[derive(Default)]
pub struct PendingCallTable {
    calls: HashMap<u32, PendingCall>,
    by_abort_key: HashMap<String, HashSet<u32>>,
}

impl PendingCallTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, call: PendingCall) {
        if let Some(key) = &call.abort_key {
            self.by_abort_key
                .entry(key.clone())
                .or_default()
                .insert(call.sn);
        }
        self.calls.insert(call.sn, call);
    }

    pub fn remove(&mut self, sn: u32) -> Option<PendingCall> {
        let call = self.calls.remove(&sn)?;
        if let Some(key) = &call.abort_key {
            if let Some(set) = self.by_abort_key.get_mut(key) {
                set.remove(&sn);
                if set.is_empty() {
                    self.by_abort_key.remove(key);
                }
            }
        }
        Some(call)
    }

    /// Abort one call. Idempotent: aborting an unknown sn is a no-op.
    pub fn abort(&mut self, sn: u32) -> bool {
        match self.remove(sn) {
            Some(call) => {
                call.abort();
                true
            }
            None => false,
        }
    }

    /// Abort every call registered under `key`.
    pub fn abort_by_key(&mut self, key: &str) -> usize {
        let Some(sns) = self.by_abort_key.remove(key) else {
            return 0;
        };
        let mut n = 0;
        for sn in sns {
            if let Some(call) = self.calls.remove(&sn) {
                call.abort();
                n += 1;
            }
        }
        n
    }

    pub fn abort_all(&mut self) -> usize {
        let calls = std::mem::take(&mut self.calls);
        self.by_abort_key.clear();
        let n = calls.len();
        for (_, call) in calls {
            call.abort();
        }
        n
    }

    /// Take every call out of the table, e.g. to fail them on disconnect.
    pub(crate) fn drain(&mut self) -> Vec<PendingCall> {
        self.by_abort_key.clear();
        self.calls.drain().map(|(_, call)| call).collect()
    }

    /// API name of an in-flight call, used to recover the response schema
    /// for a `res` envelope that only carries an sn.
    pub fn api_name(&self, sn: u32) -> Option<&str> {
        self.calls.get(&sn).map(|c| c.api_name.as_str())
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}
