//! Optional volume metering of the local input.
//!
//! A [`VolumeMeter`] samples a [`LevelSource`] at a fixed frame rate and
//! publishes `volume-level` events. It runs as its own task and must be
//! stopped during teardown.

use crate::events::{CallEvent, EventBus};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Byte value of silence in unsigned 8-bit time-domain data.
pub const SILENCE: u8 = 128;

/// Supplies time-domain samples of the local input.
pub trait LevelSource: Send + Sync {
    /// Latest unsigned 8-bit time-domain frame, centred on [`SILENCE`].
    /// `None` when no frame is available yet.
    fn time_domain_data(&self) -> Option<Vec<u8>>;
}

/// Root-mean-square deviation of `frame` from silence.
pub fn rms_level(frame: &[u8]) -> f32 {
    if frame.is_empty() {
        return 0.0;
    }
    let sum: f64 = frame
        .iter()
        .map(|&b| {
            let d = f64::from(b) - f64::from(SILENCE);
            d * d
        })
        .sum();
    (sum / frame.len() as f64).sqrt() as f32
}

/// A running metering task.
#[derive(Debug)]
pub struct VolumeMeter {
    handle: JoinHandle<()>,
}

impl VolumeMeter {
    /// Start publishing `volume-level` events at `fps` ticks per second.
    pub fn spawn(source: Arc<dyn LevelSource>, fps: u32, bus: Arc<EventBus>) -> Self {
        let period = Duration::from_secs_f64(1.0 / f64::from(fps.max(1)));
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if let Some(frame) = source.time_domain_data() {
                    bus.publish(CallEvent::VolumeLevel(rms_level(&frame)));
                }
            }
        });
        Self { handle }
    }

    /// Cancel the task.
    pub fn stop(self) {
        self.handle.abort();
    }

    /// Whether the task has finished.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for VolumeMeter {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CallEventKind;
    use parking_lot::Mutex;

    struct FixedLevel(Vec<u8>);

    impl LevelSource for FixedLevel {
        fn time_domain_data(&self) -> Option<Vec<u8>> {
            Some(self.0.clone())
        }
    }

    #[test]
    fn test_rms_level() {
        assert_eq!(rms_level(&[]), 0.0);
        assert_eq!(rms_level(&[SILENCE; 32]), 0.0);
        assert!((rms_level(&[138, 118, 138, 118]) - 10.0).abs() < 1e-6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_meter_publishes_until_stopped() {
        let bus = Arc::new(EventBus::new());
        let levels = Arc::new(Mutex::new(Vec::new()));
        let sink = levels.clone();
        bus.subscribe(CallEventKind::VolumeLevel, move |event| {
            if let CallEvent::VolumeLevel(level) = event {
                sink.lock().push(*level);
            }
        });

        let meter = VolumeMeter::spawn(Arc::new(FixedLevel(vec![148; 8])), 10, bus);
        tokio::time::sleep(Duration::from_millis(250)).await;
        meter.stop();

        let count = levels.lock().len();
        assert!(count >= 2, "expected several ticks, got {count}");
        assert!(levels.lock().iter().all(|l| (*l - 20.0).abs() < 1e-6));

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(levels.lock().len(), count);
    }
}
