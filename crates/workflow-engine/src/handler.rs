use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration;

use crate::payload::Payload;

/// What a handler decided should happen to the work unit it was given.
#[derive(Debug, Clone)]
pub enum Outcome {
    Succeeded,
    Infeasible,
    /// Run again later; distinct from a transient failure in that it
    /// carries no exception-log entry — the handler chose this, it didn't
    /// fail.
    Reschedule(Duration),
}

/// How a handler's error should be treated by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Transient,
    Permanent,
}

/// A payload type's executable behavior.
///
/// Exactly one handler is registered per payload type (see
/// [`CommandRegistry`]); the dispatcher decodes the stored JSON into `P` and
/// calls `handle`.
#[async_trait]
pub trait Handler<P: Payload>: Send + Sync {
    async fn handle(&self, payload: &P) -> anyhow::Result<Outcome>;

    /// Classify a returned error as transient (retry later) or permanent
    /// (mark the unit, and its transitive requirers, infeasible). Defaults
    /// to transient, the conservative choice.
    fn classify(&self, _err: &anyhow::Error) -> FailureClass {
        FailureClass::Transient
    }

    /// Lease duration granted to this payload type. Must conservatively
    /// exceed the worst-case handler runtime, or workers will double-execute
    /// work via lease expiry more often than intended.
    fn lease_ttl(&self) -> Duration {
        Duration::seconds(60)
    }
}

/// Type-erased form of [`Handler`], so a [`CommandRegistry`] can hold
/// handlers for heterogeneous payload types behind one map.
#[async_trait]
trait ErasedHandler: Send + Sync {
    async fn handle_json(&self, payload: serde_json::Value) -> anyhow::Result<Outcome>;
    fn classify(&self, err: &anyhow::Error) -> FailureClass;
    fn lease_ttl(&self) -> Duration;
}

struct Erased<P: Payload, H: Handler<P>> {
    handler: H,
    _marker: std::marker::PhantomData<P>,
}

#[async_trait]
impl<P: Payload, H: Handler<P>> ErasedHandler for Erased<P, H> {
    async fn handle_json(&self, payload: serde_json::Value) -> anyhow::Result<Outcome> {
        let payload: P = serde_json::from_value(payload)?;
        self.handler.handle(&payload).await
    }

    fn classify(&self, err: &anyhow::Error) -> FailureClass {
        self.handler.classify(err)
    }

    fn lease_ttl(&self) -> Duration {
        self.handler.lease_ttl()
    }
}

/// Maps a `payload_type` tag to `{decode, handle, lease_ttl, classifier}`.
///
/// This is the data-driven stand-in for dynamic-class polymorphism: the
/// work unit only ever carries a string tag, and the registry is the single
/// place that knows how to turn that tag back into code.
#[derive(Clone, Default)]
pub struct CommandRegistry {
    handlers: HashMap<&'static str, Arc<dyn ErasedHandler>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the single handler for payload type `P`. Registering a
    /// second handler for the same `PAYLOAD_TYPE` overwrites the first —
    /// there can only be one handler per type, by contract.
    pub fn register<P: Payload, H: Handler<P> + 'static>(mut self, handler: H) -> Self {
        let erased = Erased {
            handler,
            _marker: std::marker::PhantomData::<P>,
        };
        self.handlers.insert(P::PAYLOAD_TYPE, Arc::new(erased));
        self
    }

    pub fn payload_types(&self) -> Vec<&'static str> {
        self.handlers.keys().copied().collect()
    }

    pub fn lease_ttl(&self, payload_type: &str) -> Option<Duration> {
        self.handlers.get(payload_type).map(|h| h.lease_ttl())
    }

    pub(crate) async fn dispatch(
        &self,
        payload_type: &str,
        payload: serde_json::Value,
    ) -> Option<anyhow::Result<Outcome>> {
        let handler = self.handlers.get(payload_type)?.clone();
        Some(handler.handle_json(payload).await)
    }

    pub(crate) fn classify(&self, payload_type: &str, err: &anyhow::Error) -> FailureClass {
        self.handlers
            .get(payload_type)
            .map(|h| h.classify(err))
            .unwrap_or(FailureClass::Transient)
    }
}
