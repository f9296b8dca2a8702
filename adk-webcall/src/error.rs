//! Error types for call sessions.

use serde_json::Value;
use thiserror::Error;

/// Result type for call session operations.
pub type Result<T> = std::result::Result<T, WebCallError>;

/// Errors that can occur while setting up or running a call session.
#[derive(Error, Debug)]
pub enum WebCallError {
    /// Missing or invalid session identity/configuration.
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// `start_call` was invoked before `init`.
    #[error("Configuration error: call session not initialized")]
    NotInitialized,

    /// Local audio capture could not be acquired.
    #[error("Media acquisition error: {0}")]
    MediaAcquisitionError(String),

    /// Signaling channel failed to open or dropped unexpectedly.
    #[error("Signaling transport error: {0}")]
    SignalingTransportError(String),

    /// Malformed or unexpected session description or candidate.
    #[error("Negotiation error: {0}")]
    NegotiationError(String),

    /// Inbound signaling message with an unknown tag.
    #[error("Unrecognized signaling message: {0}")]
    UnrecognizedMessageError(Value),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

impl WebCallError {
    /// Create a new configuration error.
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::ConfigurationError(msg.into())
    }

    /// Create a new media acquisition error.
    pub fn media<S: Into<String>>(msg: S) -> Self {
        Self::MediaAcquisitionError(msg.into())
    }

    /// Create a new signaling transport error.
    pub fn signaling<S: Into<String>>(msg: S) -> Self {
        Self::SignalingTransportError(msg.into())
    }

    /// Create a new negotiation error.
    pub fn negotiation<S: Into<String>>(msg: S) -> Self {
        Self::NegotiationError(msg.into())
    }

    /// Classify this error for the outward `error` event.
    pub fn kind(&self) -> CallErrorKind {
        match self {
            Self::ConfigurationError(_) | Self::NotInitialized => CallErrorKind::Configuration,
            Self::MediaAcquisitionError(_) => CallErrorKind::MediaAcquisition,
            Self::SignalingTransportError(_) => CallErrorKind::SignalingTransport,
            Self::NegotiationError(_) => CallErrorKind::Negotiation,
            Self::UnrecognizedMessageError(_) => CallErrorKind::UnrecognizedMessage,
            Self::SerializationError(_) => CallErrorKind::SignalingTransport,
        }
    }

    /// Convert into the payload carried by an `error` event.
    pub fn to_call_error(&self) -> CallError {
        let payload = match self {
            Self::UnrecognizedMessageError(raw) => Some(raw.clone()),
            _ => None,
        };
        CallError { kind: self.kind(), message: self.to_string(), payload }
    }
}

/// Classification of errors surfaced through `error` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallErrorKind {
    /// Missing identity fields. Never published as an event by the controller.
    Configuration,
    /// Local capture failed.
    MediaAcquisition,
    /// Signaling channel failed or dropped.
    SignalingTransport,
    /// Description or candidate rejected by the engine.
    Negotiation,
    /// Unknown inbound message tag.
    UnrecognizedMessage,
}

/// Payload of an `error` event.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct CallError {
    /// Error classification.
    pub kind: CallErrorKind,
    /// Human-readable description.
    pub message: String,
    /// The raw inbound message, for unrecognized messages.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl From<WebCallError> for CallError {
    fn from(err: WebCallError) -> Self {
        err.to_call_error()
    }
}
