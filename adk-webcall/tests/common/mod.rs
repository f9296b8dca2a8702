//! Scripted signaling, engine and media fakes shared by the call session tests.
//!
//! Every fake records into a shared [`Hub`], and the hub keeps the sending
//! halves of the link and engine event channels so tests can inject inbound
//! messages and transport state changes.

#![allow(dead_code)]

use adk_webcall::negotiation::{BoxedEngine, EngineEvents};
use adk_webcall::signaling::{BoxedLink, LinkEvents};
use adk_webcall::{
    AudioConstraints, AudioTrackHandle, CallEvent, CallEventKind, CallInit, EngineEvent,
    EngineFactory, IceCandidate, IceServer, LinkEvent, MediaDevices, MediaStream,
    NegotiationEngine, RenderSink, Result, SdpType, SessionDescription, SharedTrack,
    SignalingConnector, SignalingLink, StaticEndpoint, TransportState, WebCall, WebCallError,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

pub const URL: &str = "wss://eu.calls.test/webrtc-call";

/// Shared record of everything the fakes observed.
#[derive(Default)]
pub struct Hub {
    pub sent: Mutex<Vec<Value>>,
    pub ops: Mutex<Vec<String>>,
    pub remote_candidates: Mutex<Vec<IceCandidate>>,
    pub local_tracks: Mutex<Vec<SharedTrack>>,
    pub connected_urls: Mutex<Vec<String>>,
    pub link_tx: Mutex<Option<mpsc::UnboundedSender<LinkEvent>>>,
    /// Every link sender ever handed out, so replaced links never read as dropped.
    pub link_senders: Mutex<Vec<mpsc::UnboundedSender<LinkEvent>>>,
    pub engine_tx: Mutex<Option<mpsc::UnboundedSender<EngineEvent>>>,
    pub media_gate: Mutex<Option<oneshot::Receiver<()>>>,
    pub offer_gate: Mutex<Option<oneshot::Receiver<()>>>,
    /// Delay applied inside every link `close`.
    pub close_delay_ms: AtomicU64,
    /// Emit a local candidate while the local offer is being applied.
    pub candidate_during_offer: AtomicBool,
    pub link_closes: AtomicUsize,
    pub engine_closes: AtomicUsize,
    pub sink_destroys: AtomicUsize,
    pub fail_connect: AtomicBool,
    pub fail_media: AtomicBool,
    pub fail_remote_description: AtomicBool,
}

impl Hub {
    pub fn op(&self, op: impl Into<String>) {
        self.ops.lock().push(op.into());
    }

    pub fn has_op(&self, op: &str) -> bool {
        self.ops.lock().iter().any(|o| o == op)
    }

    pub fn op_count(&self, op: &str) -> usize {
        self.ops.lock().iter().filter(|o| *o == op).count()
    }

    /// The `type` tags of every sent message, in wire order.
    pub fn sent_tags(&self) -> Vec<String> {
        self.sent.lock().iter().filter_map(|m| m["type"].as_str().map(str::to_string)).collect()
    }

    /// Messages sent with the given `type` tag.
    pub fn sent_of(&self, tag: &str) -> Vec<Value> {
        self.sent.lock().iter().filter(|m| m["type"] == tag).cloned().collect()
    }

    /// Deliver an inbound signaling frame.
    pub fn inbound(&self, value: Value) {
        self.link_event(LinkEvent::Message(value.to_string()));
    }

    pub fn link_event(&self, event: LinkEvent) {
        if let Some(tx) = self.link_tx.lock().as_ref() {
            let _ = tx.send(event);
        }
    }

    pub fn engine_event(&self, event: EngineEvent) {
        if let Some(tx) = self.engine_tx.lock().as_ref() {
            let _ = tx.send(event);
        }
    }

    pub fn transport(&self, state: TransportState) {
        self.engine_event(EngineEvent::ConnectionStateChanged(state));
    }

    /// Block the next local media acquisition until the returned sender fires.
    pub fn gate_media(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        *self.media_gate.lock() = Some(rx);
        tx
    }

    /// Block the next offer creation until the returned sender fires.
    pub fn gate_offer(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        *self.offer_gate.lock() = Some(rx);
        tx
    }
}

pub struct FakeConnector(pub Arc<Hub>);

#[async_trait]
impl SignalingConnector for FakeConnector {
    async fn connect(&self, url: &str) -> Result<(BoxedLink, LinkEvents)> {
        self.0.connected_urls.lock().push(url.to_string());
        if self.0.fail_connect.load(Ordering::SeqCst) {
            return Err(WebCallError::signaling("connection refused"));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.0.link_senders.lock().push(tx.clone());
        *self.0.link_tx.lock() = Some(tx);
        Ok((Arc::new(FakeLink(self.0.clone())), rx))
    }
}

pub struct FakeLink(Arc<Hub>);

#[async_trait]
impl SignalingLink for FakeLink {
    fn send_text(&self, text: String) -> Result<()> {
        let value: Value = serde_json::from_str(&text)?;
        self.0.sent.lock().push(value);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let delay = self.0.close_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.0.link_closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct FakeEngines(pub Arc<Hub>);

#[async_trait]
impl EngineFactory for FakeEngines {
    async fn create(&self, _ice_servers: &[IceServer]) -> Result<(BoxedEngine, EngineEvents)> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.0.engine_tx.lock() = Some(tx);
        let engine = FakeEngine { hub: self.0.clone(), closed: AtomicBool::new(false) };
        Ok((Arc::new(engine), rx))
    }
}

/// Fails every operation once closed, like a real peer connection.
pub struct FakeEngine {
    hub: Arc<Hub>,
    closed: AtomicBool,
}

impl FakeEngine {
    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(WebCallError::negotiation("peer connection closed"));
        }
        Ok(())
    }
}

#[async_trait]
impl NegotiationEngine for FakeEngine {
    async fn create_offer(&self) -> Result<SessionDescription> {
        self.hub.op("create_offer");
        let gate = self.hub.offer_gate.lock().take();
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        self.check_open()?;
        Ok(SessionDescription::offer("v=0 local-offer"))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        self.check_open()?;
        self.hub.op("create_answer");
        Ok(SessionDescription::answer("v=0 local-answer"))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        self.check_open()?;
        self.hub.op(format!("set_local:{}", desc.sdp));
        if desc.sdp_type == SdpType::Offer && self.hub.candidate_during_offer.load(Ordering::SeqCst)
        {
            let candidate = IceCandidate::new("candidate:9 1 udp 1 10.0.0.9 9 typ host");
            self.hub.engine_event(EngineEvent::LocalCandidate(candidate));
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        self.check_open()?;
        if self.hub.fail_remote_description.load(Ordering::SeqCst) {
            return Err(WebCallError::negotiation("bad remote description"));
        }
        self.hub.op(format!("set_remote:{}", desc.sdp));
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.check_open()?;
        self.hub.remote_candidates.lock().push(candidate);
        Ok(())
    }

    async fn add_local_track(&self, track: SharedTrack, stream_id: &str) -> Result<()> {
        self.check_open()?;
        self.hub.op(format!("add_track:{}:{}", track.id(), stream_id));
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.hub.engine_closes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

pub struct FakeMedia(pub Arc<Hub>);

#[async_trait]
impl MediaDevices for FakeMedia {
    async fn acquire_local_audio(&self, _constraints: &AudioConstraints) -> Result<MediaStream> {
        self.0.op("acquire");
        let gate = self.0.media_gate.lock().take();
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        if self.0.fail_media.load(Ordering::SeqCst) {
            return Err(WebCallError::media("Permission denied"));
        }
        let track = AudioTrackHandle::shared("mic");
        self.0.local_tracks.lock().push(track.clone());
        Ok(MediaStream::with_tracks("local", vec![track]))
    }

    fn attach_remote_sink(&self, _stream: &MediaStream) -> Result<Box<dyn RenderSink>> {
        Ok(Box::new(FakeSink(self.0.clone())))
    }
}

pub struct FakeSink(Arc<Hub>);

impl RenderSink for FakeSink {
    fn destroy(self: Box<Self>) {
        self.0.sink_destroys.fetch_add(1, Ordering::SeqCst);
    }
}

/// A controller wired to fakes, with every published event recorded.
pub struct Harness {
    pub call: Arc<WebCall>,
    pub hub: Arc<Hub>,
    pub events: Arc<Mutex<Vec<CallEvent>>>,
}

impl Harness {
    pub fn new() -> Self {
        init_tracing();
        let hub = Arc::new(Hub::default());
        let call = WebCall::builder()
            .signaling(FakeConnector(hub.clone()))
            .engine_factory(FakeEngines(hub.clone()))
            .media(FakeMedia(hub.clone()))
            .endpoint(StaticEndpoint(URL.to_string()))
            .build()
            .unwrap();

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        call.events().subscribe_all(move |event| sink.lock().push(event.clone()));

        Self { call: Arc::new(call), hub, events }
    }

    pub fn init(&self) {
        self.call
            .init(CallInit::new("agent-1", "eu").with_conversation_id("c1").with_session_id("s1"))
            .unwrap();
    }

    /// Init, start and complete the offer/answer exchange.
    pub async fn connect(&self) {
        self.init();
        self.call.start_call().await.unwrap();
        self.hub.inbound(serde_json::json!({
            "type": "answer",
            "answer": {"type": "answer", "sdp": "v=0 remote-answer"}
        }));
        eventually(|| self.hub.has_op("set_remote:v=0 remote-answer")).await;
        self.hub.transport(TransportState::Connected);
        eventually(|| self.count(CallEventKind::CallStart) == 1).await;
    }

    pub fn kinds(&self) -> Vec<CallEventKind> {
        self.events.lock().iter().map(CallEvent::kind).collect()
    }

    pub fn count(&self, kind: CallEventKind) -> usize {
        self.events.lock().iter().filter(|e| e.kind() == kind).count()
    }

    pub fn clear_events(&self) {
        self.events.lock().clear();
    }
}

/// Wait until `condition` holds, failing the test after about two seconds.
pub async fn eventually(condition: impl Fn() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

/// Let spawned tasks drain their queues.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
