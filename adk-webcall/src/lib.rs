//! # adk-webcall
//!
//! Real-time voice call sessions between a client and an ADK agent.
//!
//! A [`WebCall`] drives one call: it opens a signaling link to the call
//! service, negotiates a peer connection, streams local microphone audio,
//! renders the agent's audio, and publishes lifecycle, transcript and error
//! notifications to subscribers.
//!
//! ## Architecture
//!
//! ```text
//!                 ┌──────────────────────────────────────────┐
//!                 │                 WebCall                  │
//!                 │  init · start_call · end_call · mute     │
//!                 └───┬──────────────┬──────────────┬────────┘
//!                     │              │              │
//!        ┌────────────▼───┐  ┌───────▼────────┐  ┌──▼─────────────┐
//!        │ SignalingLink  │  │ Negotiation-   │  │  MediaDevices  │
//!        │ (WebSocket)    │  │ Engine (WebRTC)│  │  local/remote  │
//!        └────────────────┘  └────────────────┘  └────────────────┘
//!                     │              │
//!                     └──────┬───────┘
//!                     ┌──────▼───────┐
//!                     │   EventBus   │──▶ call-start, call-end, error,
//!                     └──────────────┘    final_transcript, ...
//! ```
//!
//! Signaling, negotiation and media are traits, so a call can run over any
//! transport or peer connection implementation. The `websocket` feature
//! (default) provides [`websocket::WebSocketConnector`]; the `webrtc`
//! feature provides [`webrtc::WebRtcEngineFactory`].
//!
//! ## Example
//!
//! ```rust,ignore
//! use adk_webcall::{CallEventKind, CallInit, RegionEndpoint, WebCall};
//!
//! let call = WebCall::builder()
//!     .media(devices)
//!     .endpoint(RegionEndpoint::call_service("{region}.calls.example.com"))
//!     .build()?;
//!
//! call.on(CallEventKind::FinalTranscript, |event| println!("{event:?}"));
//! call.on(CallEventKind::Error, |event| eprintln!("{event:?}"));
//!
//! call.init(CallInit::new("agent-123", "eu"))?;
//! call.start_call().await?;
//! // ...
//! call.end_call().await;
//! ```

pub mod call;
pub mod config;
pub mod error;
pub mod events;
pub mod media;
pub mod metering;
pub mod negotiation;
pub mod signaling;

// Transport implementations
#[cfg(feature = "websocket")]
pub mod websocket;

#[cfg(feature = "webrtc")]
pub mod webrtc;

// Re-exports
pub use call::{CallPhase, WebCall, WebCallBuilder};
pub use config::{
    BoxedResolver, CallInit, EndpointResolver, EnvEndpoint, IceServer, RegionEndpoint,
    SessionParams, StaticEndpoint, WebCallConfig,
};
pub use error::{CallError, CallErrorKind, Result, WebCallError};
pub use events::{CallEvent, CallEventKind, EventBus, Subscription};
pub use media::{
    AudioConstraints, AudioTrackHandle, MediaDevices, MediaStream, MediaTrack, RenderSink,
    SharedTrack, TrackKind,
};
pub use metering::{LevelSource, VolumeMeter};
pub use negotiation::{
    EngineEvent, EngineFactory, IceCandidate, NegotiationEngine, SdpType, SessionDescription,
    TransportState,
};
pub use signaling::{
    InboundMessage, LinkEvent, OutboundMessage, SignalingConnector, SignalingLink, TranscriptTag,
};
