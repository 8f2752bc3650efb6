//! Name-keyed subscriber table for inbound messages.
//!
//! Handlers are `Arc`ed callbacks; registering the same `Arc` twice under
//! one name is a no-op, which is the dedup rule for subscriptions. Delivery
//! is synchronous and in registration order. A failing handler is logged
//! and does not stop delivery to the rest.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::warn;

/// Subscriber callback. Receives the message name and body.
pub type MsgHandler = Arc<dyn Fn(&str, &Value) -> anyhow::Result<()> + Send + Sync>;

struct Subscriber {
    handler: MsgHandler,
    once: bool,
}

/// Subscriber table keyed by message name.
#[derive(Default)]
pub struct MsgEmitter {
    subs: HashMap<String, Vec<Subscriber>>,
}

impl MsgEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a subscriber. Returns false if this exact handler is already
    /// registered under `name`.
    pub fn on(&mut self, name: &str, handler: MsgHandler) -> bool {
        self.attach(name, handler, false)
    }

    /// Like [`on`](Self::on), but the subscriber detaches after one delivery.
    pub fn once(&mut self, name: &str, handler: MsgHandler) -> bool {
        self.attach(name, handler, true)
    }

    fn attach(&mut self, name: &str, handler: MsgHandler, once: bool) -> bool {
        let subs = self.subs.entry(name.to_string()).or_default();
        if subs.iter().any(|s| Arc::ptr_eq(&s.handler, &handler)) {
            return false;
        }
        subs.push(Subscriber { handler, once });
        true
    }

    /// Remove subscribers under `name`. With a handler, only that handler is
    /// removed; without, every subscriber for the name goes. Returns the
    /// number removed.
    pub fn off(&mut self, name: &str, handler: Option<&MsgHandler>) -> usize {
        let Some(subs) = self.subs.get_mut(name) else {
            return 0;
        };
        let before = subs.len();
        match handler {
            Some(h) => subs.retain(|s| !Arc::ptr_eq(&s.handler, h)),
            None => subs.clear(),
        }
        let removed = before - subs.len();
        if subs.is_empty() {
            self.subs.remove(name);
        }
        removed
    }

    /// Deliver `body` to every subscriber of `name`, in registration order.
    /// Returns the number of subscribers invoked.
    pub fn emit(&mut self, name: &str, body: &Value) -> usize {
        let Some(subs) = self.subs.get_mut(name) else {
            return 0;
        };
        let snapshot: Vec<MsgHandler> = subs.iter().map(|s| s.handler.clone()).collect();
        subs.retain(|s| !s.once);
        if subs.is_empty() {
            self.subs.remove(name);
        }
        for handler in &snapshot {
            if let Err(e) = handler(name, body) {
                warn!("msg handler for '{}' failed: {}", name, e);
            }
        }
        snapshot.len()
    }

    /// Number of subscribers currently registered under `name`.
    pub fn count(&self, name: &str) -> usize {
        self.subs.get(name).map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.subs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_handler(hits: Arc<AtomicUsize>) -> MsgHandler {
        Arc::new(move |_, _| {
            hits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    #[test]
    fn emit_delivers_in_order() {
        let mut emitter = MsgEmitter::new();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = order.clone();
            emitter.on(
                "Tick",
                Arc::new(move |_, _| {
                    order.lock().unwrap().push(i);
                    Ok(())
                }),
            );
        }
        assert_eq!(emitter.emit("Tick", &json!({})), 3);
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn duplicate_registration_is_noop() {
        let mut emitter = MsgEmitter::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let handler = counting_handler(hits.clone());
        assert!(emitter.on("Tick", handler.clone()));
        assert!(!emitter.on("Tick", handler.clone()));
        emitter.emit("Tick", &json!({}));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn once_detaches_after_delivery() {
        let mut emitter = MsgEmitter::new();
        let hits = Arc::new(AtomicUsize::new(0));
        emitter.once("Tick", counting_handler(hits.clone()));
        assert_eq!(emitter.emit("Tick", &json!({})), 1);
        assert_eq!(emitter.emit("Tick", &json!({})), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn off_by_handler_and_by_name() {
        let mut emitter = MsgEmitter::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let a = counting_handler(hits.clone());
        let b = counting_handler(hits.clone());
        emitter.on("Tick", a.clone());
        emitter.on("Tick", b);
        assert_eq!(emitter.off("Tick", Some(&a)), 1);
        assert_eq!(emitter.count("Tick"), 1);
        assert_eq!(emitter.off("Tick", None), 1);
        assert!(emitter.is_empty());
    }

    #[test]
    fn failing_handler_does_not_block_others() {
        let mut emitter = MsgEmitter::new();
        let hits = Arc::new(AtomicUsize::new(0));
        emitter.on("Tick", Arc::new(|_, _| anyhow::bail!("boom")));
        emitter.on("Tick", counting_handler(hits.clone()));
        assert_eq!(emitter.emit("Tick", &json!({})), 2);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
