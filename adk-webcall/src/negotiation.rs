//! Negotiation engine abstraction and the offer/answer transition table.
//!
//! The engine itself (SDP generation, ICE, DTLS) is a capability provided by
//! an implementation of [`NegotiationEngine`]. This module owns the wire types
//! exchanged over signaling and the pure mapping from an inbound message and
//! the current [`NegotiationPhase`] to the actions the controller must run.
//!
//! | Inbound | Precondition | Actions |
//! |---|---|---|
//! | `offer` | engine exists | accept offer, send `answer` |
//! | `answer` | local offer sent | accept answer |
//! | `candidate` | engine exists | add candidate |
//! | `conversation-update` | | publish payload |
//! | transcript family | | publish `final_transcript` |
//! | anything else | | publish `error` with the raw message |

use crate::config::IceServer;
use crate::error::{CallError, CallErrorKind, Result, WebCallError};
use crate::events::CallEvent;
use crate::media::SharedTrack;
use crate::signaling::InboundMessage;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Session description type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    /// Offer.
    Offer,
    /// Provisional answer.
    Pranswer,
    /// Final answer.
    Answer,
    /// Rollback.
    Rollback,
}

/// An opaque offer or answer produced by a negotiation engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Description type.
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    /// SDP body.
    pub sdp: String,
}

impl SessionDescription {
    /// An offer description.
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self { sdp_type: SdpType::Offer, sdp: sdp.into() }
    }

    /// An answer description.
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self { sdp_type: SdpType::Answer, sdp: sdp.into() }
    }
}

/// An ICE candidate in its browser JSON form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// Candidate attribute; empty for end-of-candidates.
    pub candidate: String,
    /// Media stream identification tag.
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    /// Media line index.
    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
    /// ICE username fragment.
    #[serde(rename = "usernameFragment", default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    /// A candidate attribute without media context.
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
            username_fragment: None,
        }
    }

    /// The end-of-candidates marker.
    pub fn end_of_candidates() -> Self {
        Self::new("")
    }

    /// Whether this is the end-of-candidates marker.
    pub fn is_end_of_candidates(&self) -> bool {
        self.candidate.is_empty()
    }
}

/// Connection state reported by the negotiation engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportState {
    /// Not started.
    #[default]
    New,
    /// ICE/DTLS in progress.
    Connecting,
    /// Media can flow.
    Connected,
    /// Connectivity lost.
    Disconnected,
    /// Connectivity could not be established or recovered.
    Failed,
    /// Engine closed.
    Closed,
}

impl TransportState {
    /// States that end the call.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed | Self::Closed)
    }
}

impl std::fmt::Display for TransportState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::New => "new",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Offer/answer progress of the current session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NegotiationPhase {
    /// No description exchanged yet.
    #[default]
    Idle,
    /// Local offer set and sent; waiting for the answer.
    OfferSent,
    /// Offer and answer applied.
    Stable,
}

/// An action the controller runs in response to an inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum NegotiationAction {
    /// Set remote offer, create and set local answer, send `answer`.
    AcceptOffer(SessionDescription),
    /// Set remote answer.
    AcceptAnswer(SessionDescription),
    /// Hand a remote candidate to the engine, unmodified.
    AddCandidate(IceCandidate),
    /// Publish an event to listeners.
    Publish(CallEvent),
}

/// Map an inbound message in the given phase to the actions to run.
///
/// Pure; never touches the engine or the link.
pub fn plan(message: &InboundMessage, phase: NegotiationPhase) -> Vec<NegotiationAction> {
    let action = match message {
        InboundMessage::Offer(offer) => NegotiationAction::AcceptOffer(offer.clone()),
        InboundMessage::Answer(answer) if phase == NegotiationPhase::OfferSent => {
            NegotiationAction::AcceptAnswer(answer.clone())
        }
        InboundMessage::Answer(_) => NegotiationAction::Publish(CallEvent::Error(
            WebCallError::negotiation(format!("unexpected answer in phase {phase:?}"))
                .to_call_error(),
        )),
        InboundMessage::Candidate(candidate) => NegotiationAction::AddCandidate(candidate.clone()),
        InboundMessage::ConversationUpdate(payload) => {
            NegotiationAction::Publish(CallEvent::ConversationUpdate(payload.clone()))
        }
        InboundMessage::Transcript { payload, .. } => {
            NegotiationAction::Publish(CallEvent::FinalTranscript(payload.clone()))
        }
        InboundMessage::Malformed { tag, reason, raw } => {
            NegotiationAction::Publish(CallEvent::Error(CallError {
                kind: CallErrorKind::Negotiation,
                message: format!("Negotiation error: malformed `{tag}` message: {reason}"),
                payload: Some(raw.clone()),
            }))
        }
        InboundMessage::Unrecognized(raw) => NegotiationAction::Publish(CallEvent::Error(
            WebCallError::UnrecognizedMessageError(raw.clone()).to_call_error(),
        )),
    };
    vec![action]
}

/// Notifications from a negotiation engine.
#[derive(Clone)]
pub enum EngineEvent {
    /// A locally gathered candidate to relay to the peer.
    LocalCandidate(IceCandidate),
    /// An inbound media track.
    RemoteTrack(SharedTrack),
    /// Connection state transition.
    ConnectionStateChanged(TransportState),
}

impl std::fmt::Debug for EngineEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LocalCandidate(c) => f.debug_tuple("LocalCandidate").field(c).finish(),
            Self::RemoteTrack(t) => f.debug_tuple("RemoteTrack").field(&t.id()).finish(),
            Self::ConnectionStateChanged(s) => {
                f.debug_tuple("ConnectionStateChanged").field(s).finish()
            }
        }
    }
}

/// Receiver of [`EngineEvent`]s for one engine.
pub type EngineEvents = mpsc::UnboundedReceiver<EngineEvent>;

/// A peer-connection capability.
#[async_trait]
pub trait NegotiationEngine: Send + Sync {
    /// Produce a local offer. The caller sets it as local description.
    async fn create_offer(&self) -> Result<SessionDescription>;

    /// Produce a local answer to the applied remote offer.
    async fn create_answer(&self) -> Result<SessionDescription>;

    /// Apply a local description.
    async fn set_local_description(&self, desc: SessionDescription) -> Result<()>;

    /// Apply a remote offer or answer.
    ///
    /// Fails with [`WebCallError::NegotiationError`] when the description is
    /// malformed or unexpected in the current signaling state.
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()>;

    /// Apply or queue a remote candidate. Ordering relative to the remote
    /// description is the engine's responsibility.
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Attach an outbound track belonging to `stream_id`.
    async fn add_local_track(&self, track: SharedTrack, stream_id: &str) -> Result<()>;

    /// Release all engine resources. Idempotent.
    async fn close(&self) -> Result<()>;
}

/// Shared engine type.
pub type BoxedEngine = Arc<dyn NegotiationEngine>;

/// Creates one engine per call session.
#[async_trait]
pub trait EngineFactory: Send + Sync {
    /// Create an engine configured with the given ICE servers.
    async fn create(&self, ice_servers: &[IceServer]) -> Result<(BoxedEngine, EngineEvents)>;
}

/// Shared factory type.
pub type BoxedEngineFactory = Arc<dyn EngineFactory>;
