//! Typed call lifecycle events and the publish/subscribe bus.
//!
//! The controller is the only publisher; any number of listeners subscribe to
//! a closed set of [`CallEventKind`]s. Handlers run synchronously on the
//! publishing task, in subscription order, outside the registry lock, so a
//! handler may subscribe or unsubscribe without deadlocking.

use crate::error::CallError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// Kinds of events published by a call session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallEventKind {
    /// Transport connected and the `init` handshake was sent.
    #[serde(rename = "call-start")]
    CallStart,
    /// Teardown complete, all resources released.
    #[serde(rename = "call-end")]
    CallEnd,
    /// Teardown initiated.
    #[serde(rename = "call-ended")]
    CallEnded,
    /// Something went wrong; may fire multiple times.
    #[serde(rename = "error")]
    Error,
    /// Conversation state pushed by the agent.
    #[serde(rename = "conversation-update")]
    ConversationUpdate,
    /// Normalized transcript-family payload.
    #[serde(rename = "final_transcript")]
    FinalTranscript,
    /// Local input level.
    #[serde(rename = "volume-level")]
    VolumeLevel,
}

impl CallEventKind {
    /// All event kinds.
    pub const ALL: [CallEventKind; 7] = [
        Self::CallStart,
        Self::CallEnd,
        Self::CallEnded,
        Self::Error,
        Self::ConversationUpdate,
        Self::FinalTranscript,
        Self::VolumeLevel,
    ];

    /// Wire name of the event.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CallStart => "call-start",
            Self::CallEnd => "call-end",
            Self::CallEnded => "call-ended",
            Self::Error => "error",
            Self::ConversationUpdate => "conversation-update",
            Self::FinalTranscript => "final_transcript",
            Self::VolumeLevel => "volume-level",
        }
    }
}

impl std::fmt::Display for CallEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event published by a call session.
#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    /// Transport connected and the `init` handshake was sent.
    CallStart,
    /// Teardown complete.
    CallEnd,
    /// Teardown initiated.
    CallEnded,
    /// An error occurred.
    Error(CallError),
    /// Conversation update payload, passed through.
    ConversationUpdate(Value),
    /// Transcript payload, passed through.
    FinalTranscript(Value),
    /// Root-mean-square deviation of the local input from silence.
    VolumeLevel(f32),
}

impl CallEvent {
    /// The kind of this event.
    pub fn kind(&self) -> CallEventKind {
        match self {
            Self::CallStart => CallEventKind::CallStart,
            Self::CallEnd => CallEventKind::CallEnd,
            Self::CallEnded => CallEventKind::CallEnded,
            Self::Error(_) => CallEventKind::Error,
            Self::ConversationUpdate(_) => CallEventKind::ConversationUpdate,
            Self::FinalTranscript(_) => CallEventKind::FinalTranscript,
            Self::VolumeLevel(_) => CallEventKind::VolumeLevel,
        }
    }
}

type Handler = Arc<dyn Fn(&CallEvent) + Send + Sync>;

/// Token returned by [`EventBus::subscribe`]; pass it to
/// [`EventBus::unsubscribe`] to stop receiving events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    id: u64,
    kind: Option<CallEventKind>,
}

impl Subscription {
    /// The kind this subscription listens to, `None` for all kinds.
    pub fn kind(&self) -> Option<CallEventKind> {
        self.kind
    }
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    handlers: Vec<(u64, Option<CallEventKind>, Handler)>,
}

/// Typed publish/subscribe channel for call events.
#[derive(Default)]
pub struct EventBus {
    registry: Mutex<Registry>,
}

impl EventBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to one event kind.
    pub fn subscribe<F>(&self, kind: CallEventKind, handler: F) -> Subscription
    where
        F: Fn(&CallEvent) + Send + Sync + 'static,
    {
        self.register(Some(kind), Arc::new(handler))
    }

    /// Subscribe to every event kind.
    pub fn subscribe_all<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&CallEvent) + Send + Sync + 'static,
    {
        self.register(None, Arc::new(handler))
    }

    fn register(&self, kind: Option<CallEventKind>, handler: Handler) -> Subscription {
        let mut registry = self.registry.lock();
        let id = registry.next_id;
        registry.next_id += 1;
        registry.handlers.push((id, kind, handler));
        Subscription { id, kind }
    }

    /// Remove a subscription. Returns `false` if it was already removed.
    pub fn unsubscribe(&self, subscription: &Subscription) -> bool {
        let mut registry = self.registry.lock();
        let before = registry.handlers.len();
        registry.handlers.retain(|(id, _, _)| *id != subscription.id);
        registry.handlers.len() != before
    }

    /// Deliver an event to every matching handler. Returns the number of
    /// handlers invoked.
    pub fn publish(&self, event: CallEvent) -> usize {
        let kind = event.kind();
        let handlers: Vec<Handler> = self
            .registry
            .lock()
            .handlers
            .iter()
            .filter(|(_, k, _)| k.is_none_or(|k| k == kind))
            .map(|(_, _, h)| h.clone())
            .collect();

        tracing::trace!(kind = %kind, listeners = handlers.len(), "Publishing call event");
        for handler in &handlers {
            handler(&event);
        }
        handlers.len()
    }

    /// Number of handlers that would receive an event of `kind`.
    pub fn listener_count(&self, kind: CallEventKind) -> usize {
        self.registry.lock().handlers.iter().filter(|(_, k, _)| k.is_none_or(|k| k == kind)).count()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus").field("handlers", &self.registry.lock().handlers.len()).finish()
    }
}
