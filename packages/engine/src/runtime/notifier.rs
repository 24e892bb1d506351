// packages/engine/src/runtime/notifier.rs
//! Lifecycle/progress notification
//!
//! The factory never talks to a transport directly. It emits through an
//! injected [`Notifier`], and each unit receives a [`UnitEmitter`] bound to
//! its tenant and run. Notifier failures are logged and ignored.

use crate::utils::errors::{EngineError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Event payload
pub type Payload = Map<String, Value>;

/// Receives lifecycle and progress events
pub trait Notifier: Send + Sync {
    fn emit(&self, event_kind: &str, payload: Payload) -> Result<()>;
}

/// Discards every event
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn emit(&self, _event_kind: &str, _payload: Payload) -> Result<()> {
        Ok(())
    }
}

/// Logs every event at info level
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn emit(&self, event_kind: &str, payload: Payload) -> Result<()> {
        let payload = Value::Object(payload);
        info!(event = event_kind, payload = %payload, "notifier event");
        Ok(())
    }
}

/// Event forwarded by [`ChannelNotifier`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotifierEvent {
    pub kind: String,
    pub payload: Payload,
    pub emitted_at: DateTime<Utc>,
}

/// Forwards events into a bounded tokio channel
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    sender: mpsc::Sender<NotifierEvent>,
}

impl ChannelNotifier {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<NotifierEvent>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }
}

impl Notifier for ChannelNotifier {
    fn emit(&self, event_kind: &str, payload: Payload) -> Result<()> {
        let event = NotifierEvent {
            kind: event_kind.to_string(),
            payload,
            emitted_at: Utc::now(),
        };
        self.sender
            .try_send(event)
            .map_err(|e| EngineError::RuntimeError(format!("Failed to forward event: {}", e)))
    }
}

/// Notifier-backed emitter bound to one tenant run
#[derive(Clone)]
pub struct UnitEmitter {
    notifier: Arc<dyn Notifier>,
    tenant_id: Arc<str>,
    run_id: Arc<str>,
}

impl std::fmt::Debug for UnitEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitEmitter")
            .field("tenant_id", &self.tenant_id)
            .field("run_id", &self.run_id)
            .finish()
    }
}

impl UnitEmitter {
    pub fn new(notifier: Arc<dyn Notifier>, tenant_id: &str, run_id: &str) -> Self {
        Self {
            notifier,
            tenant_id: Arc::from(tenant_id),
            run_id: Arc::from(run_id),
        }
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Emit with `tenant_id`/`run_id` stamped in; never fails
    pub fn emit(&self, event_kind: &str, mut payload: Payload) {
        payload.insert("tenant_id".to_string(), Value::from(&*self.tenant_id));
        payload.insert("run_id".to_string(), Value::from(&*self.run_id));

        if let Err(e) = self.notifier.emit(event_kind, payload) {
            warn!(
                "Dropping '{}' event for tenant {} run {}: {}",
                event_kind, self.tenant_id, self.run_id, e
            );
        }
    }

    /// Emit an arbitrary JSON value; non-objects are wrapped as `{"value": ..}`
    pub fn emit_value(&self, event_kind: &str, value: Value) {
        let payload = match value {
            Value::Object(map) => map,
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        self.emit(event_kind, payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct FailingNotifier;

    impl Notifier for FailingNotifier {
        fn emit(&self, _event_kind: &str, _payload: Payload) -> Result<()> {
            Err(EngineError::RuntimeError("transport down".to_string()))
        }
    }

    #[tokio::test]
    async fn test_emitter_stamps_tenant_and_run() {
        let (notifier, mut rx) = ChannelNotifier::new(8);
        let emitter = UnitEmitter::new(Arc::new(notifier), "u1", "r1");

        emitter.emit_value("progress", json!({"step": 3}));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, "progress");
        assert_eq!(event.payload["tenant_id"], "u1");
        assert_eq!(event.payload["run_id"], "r1");
        assert_eq!(event.payload["step"], 3);
    }

    #[tokio::test]
    async fn test_non_object_values_wrapped() {
        let (notifier, mut rx) = ChannelNotifier::new(8);
        let emitter = UnitEmitter::new(Arc::new(notifier), "u1", "r1");

        emitter.emit_value("log", json!("hello"));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.payload["value"], "hello");
    }

    #[test]
    fn test_failures_are_swallowed() {
        let emitter = UnitEmitter::new(Arc::new(FailingNotifier), "u1", "r1");
        emitter.emit("unit_created", Payload::new());
    }

    #[test]
    fn test_tracing_notifier_logs_payload() {
        let mut payload = Payload::new();
        payload.insert("key".to_string(), json!("u1:r1"));
        assert!(TracingNotifier.emit("unit_created", payload).is_ok());

        let emitter = UnitEmitter::new(Arc::new(TracingNotifier), "u1", "r1");
        emitter.emit_value("progress", json!({"step": 1}));
    }

    #[test]
    fn test_full_channel_reports_error() {
        let (notifier, _rx) = ChannelNotifier::new(1);
        assert!(notifier.emit("a", Payload::new()).is_ok());
        assert!(notifier.emit("b", Payload::new()).is_err());
    }
}
