//! Media I/O: local audio acquisition, remote rendering and mute.
//!
//! Capture and playback hardware live outside this crate. The controller only
//! needs three capabilities from the media layer, expressed by
//! [`MediaDevices`]: acquire a local audio stream, bind a render target to the
//! remote stream, and (optionally) expose a level source for metering.

use crate::error::Result;
use crate::metering::LevelSource;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Kind of a media track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    /// Audio track.
    Audio,
    /// Video track.
    Video,
}

/// A single local or remote media track.
pub trait MediaTrack: Send + Sync {
    /// Track identifier.
    fn id(&self) -> &str;

    /// Track kind.
    fn kind(&self) -> TrackKind;

    /// Enable or disable the track without stopping it.
    fn set_enabled(&self, enabled: bool);

    /// Whether the track is currently enabled.
    fn is_enabled(&self) -> bool;

    /// Stop the track permanently. Idempotent.
    fn stop(&self);

    /// Whether the track has been stopped.
    fn is_stopped(&self) -> bool;
}

/// Shared track handle.
pub type SharedTrack = Arc<dyn MediaTrack>;

/// Audio-only capture constraints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConstraints {
    /// Echo cancellation.
    pub echo_cancellation: bool,
    /// Noise suppression.
    pub noise_suppression: bool,
    /// Automatic gain control.
    pub auto_gain_control: bool,
}

impl Default for AudioConstraints {
    fn default() -> Self {
        Self { echo_cancellation: true, noise_suppression: true, auto_gain_control: true }
    }
}

/// An aggregate of tracks, cheap to clone.
///
/// Clones share the same track list, so a stream handed to a render sink sees
/// tracks added later by the controller.
#[derive(Clone)]
pub struct MediaStream {
    id: String,
    tracks: Arc<Mutex<Vec<SharedTrack>>>,
}

impl MediaStream {
    /// Create an empty stream.
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into(), tracks: Arc::new(Mutex::new(Vec::new())) }
    }

    /// Create a stream from existing tracks.
    pub fn with_tracks(id: impl Into<String>, tracks: Vec<SharedTrack>) -> Self {
        Self { id: id.into(), tracks: Arc::new(Mutex::new(tracks)) }
    }

    /// Stream identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Append a track.
    pub fn add_track(&self, track: SharedTrack) {
        self.tracks.lock().push(track);
    }

    /// Snapshot of all tracks.
    pub fn tracks(&self) -> Vec<SharedTrack> {
        self.tracks.lock().clone()
    }

    /// Snapshot of the audio tracks.
    pub fn audio_tracks(&self) -> Vec<SharedTrack> {
        self.tracks.lock().iter().filter(|t| t.kind() == TrackKind::Audio).cloned().collect()
    }

    /// Number of tracks.
    pub fn len(&self) -> usize {
        self.tracks.lock().len()
    }

    /// Whether the stream has no tracks.
    pub fn is_empty(&self) -> bool {
        self.tracks.lock().is_empty()
    }

    /// Stop every track.
    pub fn stop_all(&self) {
        for track in self.tracks() {
            track.stop();
        }
    }
}

impl std::fmt::Debug for MediaStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaStream").field("id", &self.id).field("tracks", &self.len()).finish()
    }
}

/// Toggle the enabled flag of all audio tracks in `stream`.
///
/// Capture keeps running; the remote side only hears silence. Returns the
/// number of tracks touched.
pub fn set_enabled(stream: &MediaStream, enabled: bool) -> usize {
    let tracks = stream.audio_tracks();
    for track in &tracks {
        track.set_enabled(enabled);
    }
    tracks.len()
}

/// A render target bound to the remote stream.
pub trait RenderSink: Send {
    /// Detach and destroy the render target.
    fn destroy(self: Box<Self>);
}

/// Capture and playback capabilities required by the controller.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Acquire an audio-only capture stream.
    ///
    /// Fails with [`WebCallError::MediaAcquisitionError`](crate::WebCallError::MediaAcquisitionError)
    /// on permission denial, missing device and similar conditions.
    async fn acquire_local_audio(&self, constraints: &AudioConstraints) -> Result<MediaStream>;

    /// Create a hidden, autoplaying render target for the remote stream.
    fn attach_remote_sink(&self, stream: &MediaStream) -> Result<Box<dyn RenderSink>>;

    /// Level source for volume metering of a local stream.
    fn level_source(&self, _stream: &MediaStream) -> Option<Arc<dyn LevelSource>> {
        None
    }
}

/// Shared media devices type.
pub type BoxedMediaDevices = Arc<dyn MediaDevices>;

/// A plain track with enabled/stopped flags.
///
/// For tracks whose samples are moved by an external capture pipeline.
#[derive(Debug)]
pub struct AudioTrackHandle {
    id: String,
    kind: TrackKind,
    enabled: AtomicBool,
    stopped: AtomicBool,
}

impl AudioTrackHandle {
    /// Create an enabled audio track.
    pub fn new(id: impl Into<String>) -> Self {
        Self::with_kind(id, TrackKind::Audio)
    }

    /// Create an enabled track of the given kind.
    pub fn with_kind(id: impl Into<String>, kind: TrackKind) -> Self {
        Self {
            id: id.into(),
            kind,
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
        }
    }

    /// Create a shared audio track.
    pub fn shared(id: impl Into<String>) -> SharedTrack {
        Arc::new(Self::new(id))
    }
}

impl MediaTrack for AudioTrackHandle {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::Relaxed);
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Relaxed)
    }
}
