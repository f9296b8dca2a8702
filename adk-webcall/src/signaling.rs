//! Signaling link: control messages exchanged with the call service.
//!
//! Messages are JSON objects discriminated by a `type` field. Outbound
//! messages are strongly typed ([`OutboundMessage`]); inbound text is
//! classified into an [`InboundMessage`] without ever failing, so unknown
//! or malformed input can be surfaced to listeners as-is.

use crate::config::SessionParams;
use crate::error::Result;
use crate::negotiation::{IceCandidate, SessionDescription};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Messages sent to the call service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum OutboundMessage {
    /// Local offer.
    #[serde(rename = "offer")]
    Offer {
        /// The offer description.
        offer: SessionDescription,
    },

    /// Local answer to a remote offer.
    #[serde(rename = "answer")]
    Answer {
        /// The answer description.
        answer: SessionDescription,
    },

    /// Locally discovered ICE candidate.
    #[serde(rename = "candidate")]
    Candidate {
        /// The candidate.
        candidate: IceCandidate,
    },

    /// Session handshake, sent once the transport is connected.
    #[serde(rename = "init")]
    Init(SessionParams),
}

impl OutboundMessage {
    /// The `type` tag of this message.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::Candidate { .. } => "candidate",
            Self::Init(_) => "init",
        }
    }
}

/// Inbound application message types normalized to a `final_transcript` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TranscriptTag {
    /// `transcript`
    Transcript,
    /// `final_transcript`
    FinalTranscript,
    /// `on_audio_chunk`
    OnAudioChunk,
    /// `text_speak_chunk`
    TextSpeakChunk,
    /// `chunk`
    Chunk,
    /// `on_tool_start`
    OnToolStart,
}

impl TranscriptTag {
    /// Every transcript-family tag.
    pub const ALL: [TranscriptTag; 6] = [
        Self::Transcript,
        Self::FinalTranscript,
        Self::OnAudioChunk,
        Self::TextSpeakChunk,
        Self::Chunk,
        Self::OnToolStart,
    ];

    /// Wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transcript => "transcript",
            Self::FinalTranscript => "final_transcript",
            Self::OnAudioChunk => "on_audio_chunk",
            Self::TextSpeakChunk => "text_speak_chunk",
            Self::Chunk => "chunk",
            Self::OnToolStart => "on_tool_start",
        }
    }

    /// Parse a wire name.
    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == tag)
    }
}

/// A classified inbound signaling message.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    /// Remote offer.
    Offer(SessionDescription),
    /// Remote answer.
    Answer(SessionDescription),
    /// Remote ICE candidate.
    Candidate(IceCandidate),
    /// `conversation-update` payload.
    ConversationUpdate(Value),
    /// A transcript-family message.
    Transcript {
        /// Original tag.
        tag: TranscriptTag,
        /// Payload, `null` when absent.
        payload: Value,
    },
    /// A known negotiation tag whose body could not be decoded.
    Malformed {
        /// The tag.
        tag: &'static str,
        /// Decoder message.
        reason: String,
        /// The raw message.
        raw: Value,
    },
    /// Unknown tag, missing tag or non-JSON text.
    Unrecognized(Value),
}

impl InboundMessage {
    /// Classify a text frame. Non-JSON text becomes `Unrecognized(Value::String)`.
    pub fn parse(text: &str) -> Self {
        match serde_json::from_str::<Value>(text) {
            Ok(value) => Self::from_value(value),
            Err(_) => Self::Unrecognized(Value::String(text.to_string())),
        }
    }

    /// Classify a decoded JSON message.
    pub fn from_value(raw: Value) -> Self {
        let Some(tag) = raw.get("type").and_then(Value::as_str).map(str::to_owned) else {
            return Self::Unrecognized(raw);
        };

        match tag.as_str() {
            "offer" => match decode_field::<SessionDescription>(&raw, "offer") {
                Ok(desc) => Self::Offer(desc),
                Err(reason) => Self::Malformed { tag: "offer", reason, raw },
            },
            "answer" => match decode_field::<SessionDescription>(&raw, "answer") {
                Ok(desc) => Self::Answer(desc),
                Err(reason) => Self::Malformed { tag: "answer", reason, raw },
            },
            "candidate" if raw.get("candidate").is_none_or(Value::is_null) => {
                Self::Candidate(IceCandidate::end_of_candidates())
            }
            "candidate" => match decode_field::<IceCandidate>(&raw, "candidate") {
                Ok(candidate) => Self::Candidate(candidate),
                Err(reason) => Self::Malformed { tag: "candidate", reason, raw },
            },
            "conversation-update" => Self::ConversationUpdate(payload_of(&raw)),
            other => match TranscriptTag::from_tag(other) {
                Some(tag) => Self::Transcript { tag, payload: payload_of(&raw) },
                None => Self::Unrecognized(raw),
            },
        }
    }

    /// The `type` tag, if the message carried a recognized one.
    pub fn tag(&self) -> Option<&'static str> {
        match self {
            Self::Offer(_) => Some("offer"),
            Self::Answer(_) => Some("answer"),
            Self::Candidate(_) => Some("candidate"),
            Self::ConversationUpdate(_) => Some("conversation-update"),
            Self::Transcript { tag, .. } => Some(tag.as_str()),
            Self::Malformed { tag, .. } => Some(*tag),
            Self::Unrecognized(_) => None,
        }
    }
}

fn decode_field<T: serde::de::DeserializeOwned>(
    raw: &Value,
    field: &str,
) -> std::result::Result<T, String> {
    let value = raw.get(field).ok_or_else(|| format!("missing `{field}` field"))?;
    serde_json::from_value(value.clone()).map_err(|e| format!("invalid `{field}`: {e}"))
}

fn payload_of(raw: &Value) -> Value {
    raw.get("payload").cloned().unwrap_or(Value::Null)
}

/// Notifications delivered by an open signaling link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// A text message, delivered once, in arrival order.
    Message(String),
    /// The transport failed.
    Error(String),
    /// The remote side closed the channel.
    Closed,
}

/// Receiver of [`LinkEvent`]s for one link.
pub type LinkEvents = mpsc::UnboundedReceiver<LinkEvent>;

/// An open signaling channel.
#[async_trait]
pub trait SignalingLink: Send + Sync {
    /// Enqueue a serialized message. No delivery acknowledgment.
    fn send_text(&self, text: String) -> Result<()>;

    /// Serialize and enqueue a control message.
    fn send(&self, message: &OutboundMessage) -> Result<()> {
        self.send_text(serde_json::to_string(message)?)
    }

    /// Close the channel. Idempotent; safe on an already closed link.
    async fn close(&self) -> Result<()>;
}

/// Shared link type.
pub type BoxedLink = Arc<dyn SignalingLink>;

/// Opens signaling links.
#[async_trait]
pub trait SignalingConnector: Send + Sync {
    /// Open a link to `url`, resolving once it can send and receive.
    ///
    /// Fails with [`WebCallError::SignalingTransportError`](crate::WebCallError::SignalingTransportError)
    /// on any transport error during setup.
    async fn connect(&self, url: &str) -> Result<(BoxedLink, LinkEvents)>;
}

/// Shared connector type.
pub type BoxedConnector = Arc<dyn SignalingConnector>;
