//! The call session controller.
//!
//! [`WebCall`] orchestrates one signaling link, one negotiation engine and the
//! local/remote media of a single call, translating signaling and engine
//! notifications into [`CallEvent`]s and owning teardown.
//!
//! ```text
//!   idle ──start_call──▶ connecting ──transport connected──▶ active
//!                            │                                  │
//!                            └──── setup failure / terminal ────┴──▶ ended
//!                                  transport / end_call
//! ```
//!
//! State lives behind a mutex that is never held across an `.await`. Every
//! session gets a generation number; async completions belonging to an older
//! generation, or arriving after the session ended, are released instead of
//! installed. All inbound signaling messages and engine notifications are
//! processed one at a time by a single driver task per session.

use crate::config::{BoxedResolver, CallInit, EndpointResolver, SessionParams, WebCallConfig};
use crate::error::{Result, WebCallError};
use crate::events::{CallEvent, CallEventKind, EventBus, Subscription};
use crate::media::{BoxedMediaDevices, MediaDevices, MediaStream, RenderSink, set_enabled};
use crate::metering::VolumeMeter;
use crate::negotiation::{
    BoxedEngine, BoxedEngineFactory, EngineEvent, EngineEvents, EngineFactory, IceCandidate,
    NegotiationAction, NegotiationPhase, SessionDescription, TransportState, plan,
};
use crate::signaling::{
    BoxedConnector, BoxedLink, InboundMessage, LinkEvent, LinkEvents, OutboundMessage,
    SignalingConnector,
};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Lifecycle phase of the current call session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallPhase {
    /// No session has been started.
    #[default]
    Idle,
    /// Setup or negotiation in progress.
    Connecting,
    /// Transport connected and handshake sent.
    Active,
    /// Torn down. Terminal for the session.
    Ended,
}

/// Every resource a live session may hold, each independently optional.
#[derive(Default)]
struct CallResources {
    link: Option<BoxedLink>,
    engine: Option<BoxedEngine>,
    local_media: Option<MediaStream>,
    remote_media: Option<MediaStream>,
    sink: Option<Box<dyn RenderSink>>,
    meter: Option<VolumeMeter>,
    driver_stop: Option<oneshot::Sender<()>>,
}

impl CallResources {
    /// Release everything present, in a fixed order. Never fails.
    async fn release(self, session_id: &str) {
        if let Some(meter) = self.meter {
            meter.stop();
        }
        if let Some(stop) = self.driver_stop {
            let _ = stop.send(());
        }
        if let Some(engine) = self.engine {
            if let Err(e) = engine.close().await {
                warn!(session_id, error = %e, "Failed to close negotiation engine");
            }
        }
        if let Some(link) = self.link {
            if let Err(e) = link.close().await {
                warn!(session_id, error = %e, "Failed to close signaling link");
            }
        }
        if let Some(local) = self.local_media {
            local.stop_all();
        }
        if let Some(sink) = self.sink {
            sink.destroy();
        }
        if let Some(remote) = self.remote_media {
            remote.stop_all();
        }
    }
}

#[derive(Default)]
struct CallState {
    generation: u64,
    phase: CallPhase,
    negotiation: NegotiationPhase,
    transport: TransportState,
    muted: bool,
    params: Option<SessionParams>,
    resources: CallResources,
    /// Local candidates gathered before the offer went out.
    pending_candidates: Vec<IceCandidate>,
}

impl CallState {
    fn session_id(&self) -> String {
        self.params.as_ref().map(|p| p.session_id.clone()).unwrap_or_default()
    }
}

/// Why setup stopped before completing.
enum SetupAbort {
    /// A step failed; the session must be torn down.
    Failed(WebCallError),
    /// The session ended while a step was suspended.
    Superseded,
}

struct Shared {
    config: WebCallConfig,
    connector: BoxedConnector,
    engines: BoxedEngineFactory,
    media: BoxedMediaDevices,
    endpoint: BoxedResolver,
    bus: Arc<EventBus>,
    params: RwLock<Option<SessionParams>>,
    state: Mutex<CallState>,
}

impl Shared {
    /// Run `f` against the state if `generation` is still the live session.
    fn with_current<R>(&self, generation: u64, f: impl FnOnce(&mut CallState) -> R) -> Option<R> {
        let mut state = self.state.lock();
        if state.generation != generation || state.phase == CallPhase::Ended {
            return None;
        }
        Some(f(&mut state))
    }

    fn is_current(&self, generation: u64) -> bool {
        self.with_current(generation, |_| ()).is_some()
    }

    fn publish_if_current(&self, generation: u64, event: CallEvent) {
        if self.is_current(generation) {
            self.bus.publish(event);
        }
    }

    /// Classify a setup step failure. Steps that fail because the session
    /// ended underneath them are not errors.
    fn abort(&self, generation: u64, err: WebCallError) -> SetupAbort {
        if self.is_current(generation) {
            SetupAbort::Failed(err)
        } else {
            debug!(error = %err, "Setup step failed after the call ended");
            SetupAbort::Superseded
        }
    }

    fn report(&self, generation: u64, err: WebCallError) {
        debug!(error = %err, "Reporting call error");
        self.publish_if_current(generation, CallEvent::Error(err.to_call_error()));
    }

    /// Publish the error, then tear the session down.
    async fn fail(&self, generation: u64, err: &WebCallError) {
        if !self.is_current(generation) {
            return;
        }
        warn!(error = %err, "Call failed");
        self.bus.publish(CallEvent::Error(err.to_call_error()));
        self.teardown(generation).await;
    }

    /// End the session identified by `generation`. Idempotent.
    async fn teardown(&self, generation: u64) {
        let (resources, session_id) = {
            let mut state = self.state.lock();
            if state.generation != generation
                || matches!(state.phase, CallPhase::Idle | CallPhase::Ended)
            {
                return;
            }
            state.phase = CallPhase::Ended;
            if !state.transport.is_terminal() {
                state.transport = TransportState::Closed;
            }
            (std::mem::take(&mut state.resources), state.session_id())
        };
        self.finish(resources, &session_id).await;
    }

    /// Publish `call-ended`, release `resources`, then publish `call-end`.
    async fn finish(&self, resources: CallResources, session_id: &str) {
        info!(session_id, "Ending call");
        self.bus.publish(CallEvent::CallEnded);
        resources.release(session_id).await;
        self.bus.publish(CallEvent::CallEnd);
        debug!(session_id, "Call resources released");
    }

    async fn setup(
        self: &Arc<Self>,
        generation: u64,
        params: &SessionParams,
    ) -> std::result::Result<(), SetupAbort> {
        let abort = |err: WebCallError| self.abort(generation, err);

        let url = self.endpoint.resolve(params).map_err(abort)?;
        debug!(session_id = %params.session_id, url = %url, "Opening signaling link");
        let (link, link_events) = self.connector.connect(&url).await.map_err(abort)?;
        if self.with_current(generation, |s| s.resources.link = Some(link.clone())).is_none() {
            let _ = link.close().await;
            return Err(SetupAbort::Superseded);
        }

        let (engine, engine_events) =
            self.engines.create(&self.config.ice_servers).await.map_err(abort)?;
        if self.with_current(generation, |s| s.resources.engine = Some(engine.clone())).is_none() {
            let _ = engine.close().await;
            return Err(SetupAbort::Superseded);
        }

        let remote = MediaStream::new(format!("remote-{}", params.session_id));
        let sink = self.media.attach_remote_sink(&remote).map_err(abort)?;
        let (stop_tx, stop_rx) = oneshot::channel();
        let mut pending = Some((remote, sink, stop_tx));
        let installed = self.with_current(generation, |s| {
            if let Some((remote, sink, stop_tx)) = pending.take() {
                s.resources.remote_media = Some(remote);
                s.resources.sink = Some(sink);
                s.resources.driver_stop = Some(stop_tx);
            }
        });
        if installed.is_none() {
            if let Some((remote, sink, _)) = pending {
                sink.destroy();
                remote.stop_all();
            }
            return Err(SetupAbort::Superseded);
        }
        tokio::spawn(self.clone().drive(generation, stop_rx, link_events, engine_events));

        let local = self.media.acquire_local_audio(&self.config.audio).await.map_err(abort)?;
        let installed = self.with_current(generation, |s| {
            s.resources.local_media = Some(local.clone());
        });
        if installed.is_none() {
            local.stop_all();
            return Err(SetupAbort::Superseded);
        }
        for track in local.tracks() {
            engine.add_local_track(track, local.id()).await.map_err(abort)?;
        }

        let offer = engine.create_offer().await.map_err(abort)?;
        engine.set_local_description(offer.clone()).await.map_err(abort)?;
        // Sent under the lock so the driver cannot relay a candidate ahead of the offer.
        let sent = self.with_current(generation, |s| -> Result<usize> {
            s.negotiation = NegotiationPhase::OfferSent;
            link.send(&OutboundMessage::Offer { offer })?;
            let held = s.pending_candidates.len();
            for candidate in s.pending_candidates.drain(..) {
                link.send(&OutboundMessage::Candidate { candidate })?;
            }
            Ok(held)
        });
        let held = match sent {
            Some(result) => result.map_err(SetupAbort::Failed)?,
            None => return Err(SetupAbort::Superseded),
        };
        debug!(session_id = %params.session_id, held_candidates = held, "Local offer sent");

        if self.config.volume_metering {
            if let Some(source) = self.media.level_source(&local) {
                let meter = VolumeMeter::spawn(source, self.config.meter_fps, self.bus.clone());
                // A stale meter is dropped here, which aborts it.
                let _ = self.with_current(generation, |s| s.resources.meter = Some(meter));
            }
        }
        Ok(())
    }

    /// Process link and engine notifications for one session, one at a time.
    async fn drive(
        self: Arc<Self>,
        generation: u64,
        mut stop: oneshot::Receiver<()>,
        mut link_events: LinkEvents,
        mut engine_events: EngineEvents,
    ) {
        let mut engine_open = true;
        loop {
            tokio::select! {
                biased;
                _ = &mut stop => break,
                event = link_events.recv() => match event {
                    Some(LinkEvent::Message(text)) => self.handle_message(generation, &text).await,
                    Some(LinkEvent::Error(reason)) => {
                        self.fail(generation, &WebCallError::signaling(reason)).await;
                        break;
                    }
                    Some(LinkEvent::Closed) | None => {
                        let err = WebCallError::signaling("signaling link closed unexpectedly");
                        self.fail(generation, &err).await;
                        break;
                    }
                },
                event = engine_events.recv(), if engine_open => match event {
                    Some(event) => self.handle_engine_event(generation, event).await,
                    None => engine_open = false,
                },
            }
            if !self.is_current(generation) {
                break;
            }
        }
        debug!(generation, "Call driver stopped");
    }

    async fn handle_message(&self, generation: u64, text: &str) {
        let message = InboundMessage::parse(text);
        debug!(kind = message.tag().unwrap_or("unrecognized"), "Signaling message received");

        let Some((engine, link, phase)) = self.with_current(generation, |s| {
            (s.resources.engine.clone(), s.resources.link.clone(), s.negotiation)
        }) else {
            return;
        };
        let (Some(engine), Some(link)) = (engine, link) else {
            debug!("No negotiation engine, dropping signaling message");
            return;
        };

        for action in plan(&message, phase) {
            match action {
                NegotiationAction::AcceptOffer(offer) => {
                    match accept_offer(&engine, &link, offer).await {
                        Ok(()) => self.set_stable(generation),
                        Err(e) => self.report(generation, e),
                    }
                }
                NegotiationAction::AcceptAnswer(answer) => {
                    match engine.set_remote_description(answer).await {
                        Ok(()) => self.set_stable(generation),
                        Err(e) => self.report(generation, e),
                    }
                }
                NegotiationAction::AddCandidate(candidate) => {
                    if let Err(e) = engine.add_ice_candidate(candidate).await {
                        self.report(generation, e);
                    }
                }
                NegotiationAction::Publish(event) => self.publish_if_current(generation, event),
            }
        }
    }

    fn set_stable(&self, generation: u64) {
        let _ = self.with_current(generation, |s| s.negotiation = NegotiationPhase::Stable);
    }

    async fn handle_engine_event(&self, generation: u64, event: EngineEvent) {
        match event {
            EngineEvent::LocalCandidate(candidate) => {
                if candidate.is_end_of_candidates() {
                    return;
                }
                let mut pending = Some(candidate);
                let link = self.with_current(generation, |s| {
                    if s.negotiation == NegotiationPhase::Idle {
                        s.pending_candidates.extend(pending.take());
                        return None;
                    }
                    s.resources.link.clone()
                });
                let (Some(Some(link)), Some(candidate)) = (link, pending) else {
                    return;
                };
                if let Err(e) = link.send(&OutboundMessage::Candidate { candidate }) {
                    self.report(generation, e);
                }
            }
            EngineEvent::RemoteTrack(track) => {
                debug!(track_id = track.id(), "Remote track received");
                let _ = self.with_current(generation, |s| {
                    if let Some(remote) = &s.resources.remote_media {
                        remote.add_track(track);
                    }
                });
            }
            EngineEvent::ConnectionStateChanged(transport) => {
                self.handle_transport_state(generation, transport).await;
            }
        }
    }

    async fn handle_transport_state(&self, generation: u64, transport: TransportState) {
        let activated = self.with_current(generation, |s| {
            s.transport = transport;
            if transport == TransportState::Connected && s.phase == CallPhase::Connecting {
                s.phase = CallPhase::Active;
                Some((s.resources.link.clone(), s.params.clone()))
            } else {
                None
            }
        });
        let Some(activated) = activated else {
            return;
        };
        debug!(state = %transport, "Transport state changed");

        if let Some((link, params)) = activated {
            if let (Some(link), Some(params)) = (link, params) {
                info!(session_id = %params.session_id, "Call connected");
                if let Err(e) = link.send(&OutboundMessage::Init(params)) {
                    self.report(generation, e);
                }
            }
            self.publish_if_current(generation, CallEvent::CallStart);
        } else if transport.is_terminal() {
            info!(state = %transport, "Transport ended");
            self.teardown(generation).await;
        }
    }
}

async fn accept_offer(
    engine: &BoxedEngine,
    link: &BoxedLink,
    offer: SessionDescription,
) -> Result<()> {
    engine.set_remote_description(offer).await?;
    let answer = engine.create_answer().await?;
    engine.set_local_description(answer.clone()).await?;
    link.send(&OutboundMessage::Answer { answer })
}

/// A single real-time audio call with a remote agent.
///
/// # Example
///
/// ```rust,ignore
/// use adk_webcall::{CallEventKind, CallInit, RegionEndpoint, WebCall};
///
/// let call = WebCall::builder()
///     .engine_factory(engines)
///     .media(devices)
///     .endpoint(RegionEndpoint::call_service("{region}.calls.example.com"))
///     .build()?;
///
/// call.on(CallEventKind::CallStart, |_| println!("call started"));
/// call.on(CallEventKind::FinalTranscript, |e| println!("{e:?}"));
///
/// call.init(CallInit::new("agent-123", "eu"))?;
/// call.start_call().await?;
/// call.toggle_mute();
/// call.end_call().await;
/// ```
pub struct WebCall {
    shared: Arc<Shared>,
}

impl WebCall {
    /// Create a builder.
    pub fn builder() -> WebCallBuilder {
        WebCallBuilder::new()
    }

    /// Validate and store the session parameters used by the next `start_call`.
    ///
    /// Last call wins. Calling this while a call is live does not affect the
    /// running call, which keeps the parameters it started with.
    pub fn init(&self, input: CallInit) -> Result<SessionParams> {
        let params = SessionParams::resolve(input)?;
        *self.shared.params.write() = Some(params.clone());
        Ok(params)
    }

    /// The parameters stored by the last successful `init`.
    pub fn params(&self) -> Option<SessionParams> {
        self.shared.params.read().clone()
    }

    /// Start a call.
    ///
    /// Opens the signaling link, creates the negotiation engine and remote
    /// sink, acquires local audio and sends the local offer. A live previous
    /// session is ended first. Setup failures are published as `error`
    /// events, tear the session down, and are also returned. Returns
    /// `Ok(())` without further events if `end_call` ran while setup was
    /// suspended.
    pub async fn start_call(&self) -> Result<()> {
        let params = self.params().ok_or(WebCallError::NotInitialized)?;

        // Retiring the previous session and claiming the next generation
        // happen in one critical section.
        let (generation, previous, previous_id, was_live) = {
            let mut state = self.shared.state.lock();
            let was_live = matches!(state.phase, CallPhase::Connecting | CallPhase::Active);
            let previous = std::mem::take(&mut state.resources);
            let previous_id = state.session_id();
            state.generation += 1;
            state.phase = CallPhase::Connecting;
            state.negotiation = NegotiationPhase::Idle;
            state.transport = TransportState::New;
            state.muted = false;
            state.params = Some(params.clone());
            state.pending_candidates.clear();
            (state.generation, previous, previous_id, was_live)
        };
        if was_live {
            self.shared.finish(previous, &previous_id).await;
        } else {
            previous.release(&previous_id).await;
        }
        info!(
            session_id = %params.session_id,
            agent_id = %params.agent_id,
            region = %params.region,
            "Starting call"
        );

        match self.shared.setup(generation, &params).await {
            Ok(()) => Ok(()),
            Err(SetupAbort::Superseded) => {
                debug!(session_id = %params.session_id, "Call ended during setup");
                Ok(())
            }
            Err(SetupAbort::Failed(err)) => {
                self.shared.fail(generation, &err).await;
                Err(err)
            }
        }
    }

    /// End the current call. Idempotent, safe in any state.
    ///
    /// Publishes `call-ended`, releases every resource, then publishes
    /// `call-end`. A no-op when no call was started or the call already ended.
    pub async fn end_call(&self) {
        let generation = self.shared.state.lock().generation;
        self.shared.teardown(generation).await;
    }

    /// Flip the mute flag and apply it to all local audio tracks.
    ///
    /// A no-op when no local media exists. Returns the resulting flag.
    pub fn toggle_mute(&self) -> bool {
        let mut state = self.shared.state.lock();
        let Some(local) = state.resources.local_media.clone() else {
            return state.muted;
        };
        state.muted = !state.muted;
        set_enabled(&local, !state.muted);
        debug!(muted = state.muted, "Toggled mute");
        state.muted
    }

    /// Whether local audio is muted.
    pub fn is_muted(&self) -> bool {
        self.shared.state.lock().muted
    }

    /// Lifecycle phase of the current session.
    pub fn phase(&self) -> CallPhase {
        self.shared.state.lock().phase
    }

    /// Last connection state reported by the negotiation engine.
    pub fn transport_state(&self) -> TransportState {
        self.shared.state.lock().transport
    }

    /// The event bus.
    pub fn events(&self) -> &EventBus {
        &self.shared.bus
    }

    /// Subscribe to an event kind.
    pub fn on<F>(&self, kind: CallEventKind, handler: F) -> Subscription
    where
        F: Fn(&CallEvent) + Send + Sync + 'static,
    {
        self.shared.bus.subscribe(kind, handler)
    }

    /// Remove a subscription.
    pub fn off(&self, subscription: &Subscription) -> bool {
        self.shared.bus.unsubscribe(subscription)
    }
}

impl Drop for WebCall {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        if let Some(meter) = state.resources.meter.take() {
            meter.stop();
        }
        if let Some(stop) = state.resources.driver_stop.take() {
            let _ = stop.send(());
        }
    }
}

impl std::fmt::Debug for WebCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("WebCall")
            .field("phase", &state.phase)
            .field("transport", &state.transport)
            .field("muted", &state.muted)
            .finish()
    }
}

/// Builder for [`WebCall`].
pub struct WebCallBuilder {
    config: WebCallConfig,
    connector: Option<BoxedConnector>,
    engines: Option<BoxedEngineFactory>,
    media: Option<BoxedMediaDevices>,
    endpoint: Option<BoxedResolver>,
    bus: Option<Arc<EventBus>>,
}

impl Default for WebCallBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl WebCallBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self {
            config: WebCallConfig::default(),
            connector: None,
            engines: None,
            media: None,
            endpoint: None,
            bus: None,
        }
    }

    /// Set the controller configuration.
    pub fn config(mut self, config: WebCallConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the signaling connector.
    pub fn signaling(mut self, connector: impl SignalingConnector + 'static) -> Self {
        self.connector = Some(Arc::new(connector));
        self
    }

    /// Set the negotiation engine factory.
    pub fn engine_factory(mut self, factory: impl EngineFactory + 'static) -> Self {
        self.engines = Some(Arc::new(factory));
        self
    }

    /// Set the media devices.
    pub fn media(mut self, media: impl MediaDevices + 'static) -> Self {
        self.media = Some(Arc::new(media));
        self
    }

    /// Set the signaling endpoint resolver.
    pub fn endpoint(mut self, resolver: impl EndpointResolver + 'static) -> Self {
        self.endpoint = Some(Arc::new(resolver));
        self
    }

    /// Share an existing event bus.
    pub fn event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Build the controller (does not connect yet).
    ///
    /// Without an explicit connector the WebSocket transport is used (feature
    /// `websocket`); without an engine factory the WebRTC engine is used
    /// (feature `webrtc`). Media devices are always required. The endpoint
    /// defaults to [`EnvEndpoint`](crate::EnvEndpoint).
    pub fn build(self) -> Result<WebCall> {
        let connector = match self.connector {
            Some(connector) => connector,
            None => default_connector()?,
        };
        let engines = match self.engines {
            Some(engines) => engines,
            None => default_engine_factory()?,
        };
        let media =
            self.media.ok_or_else(|| WebCallError::config("Media devices are required"))?;
        let endpoint =
            self.endpoint.unwrap_or_else(|| Arc::new(crate::config::EnvEndpoint::new()));

        Ok(WebCall {
            shared: Arc::new(Shared {
                config: self.config,
                connector,
                engines,
                media,
                endpoint,
                bus: self.bus.unwrap_or_default(),
                params: RwLock::new(None),
                state: Mutex::new(CallState::default()),
            }),
        })
    }
}

#[cfg(feature = "websocket")]
fn default_connector() -> Result<BoxedConnector> {
    Ok(Arc::new(crate::websocket::WebSocketConnector::new()))
}

#[cfg(not(feature = "websocket"))]
fn default_connector() -> Result<BoxedConnector> {
    Err(WebCallError::config("A signaling connector is required"))
}

#[cfg(feature = "webrtc")]
fn default_engine_factory() -> Result<BoxedEngineFactory> {
    Ok(Arc::new(crate::webrtc::WebRtcEngineFactory::new()))
}

#[cfg(not(feature = "webrtc"))]
fn default_engine_factory() -> Result<BoxedEngineFactory> {
    Err(WebCallError::config("A negotiation engine factory is required"))
}
