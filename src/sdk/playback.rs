//! Gapless playback scheduling for streamed PCM16 audio.

use crate::Result;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{Instant, MissedTickBehavior};

use super::handlers::EventHandlers;
use super::transport::SessionToken;

/// Energy is small for normal speech; scale it into a usable meter range.
const VOLUME_GAIN: f32 = 4.0;
/// Samples examined around the playhead when measuring energy.
const ENERGY_WINDOW: usize = 512;

/// Decoded audio waiting for, or in, playback.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackBuffer {
    pub id: u64,
    pub samples: Arc<[f32]>,
    pub sample_rate: u32,
}

impl PlaybackBuffer {
    /// Length in seconds.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / f64::from(self.sample_rate)
    }
}

/// An audio output device with its own playback clock.
///
/// Times are seconds on the device clock, which must be monotonic.
pub trait AudioSink: Send {
    fn current_time(&self) -> f64;
    /// Start `buffer` at `start` on the device clock.
    ///
    /// # Errors
    /// Returns an error if the device rejects the buffer.
    fn schedule(&mut self, buffer: &PlaybackBuffer, start: f64) -> Result<()>;
    /// Stop a buffer immediately, whether or not it has started.
    fn stop(&mut self, id: u64);
    /// Current output energy, roughly in `[0, 1]`.
    fn output_energy(&self) -> f32;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledBuffer {
    pub id: u64,
    pub start: f64,
    pub duration: f64,
}

#[derive(Debug, Clone, Copy)]
struct ActiveBuffer {
    end: f64,
}

/// Places each decoded chunk directly after the previous one, or at the
/// device clock when playback has run dry.
pub struct PlaybackScheduler {
    sink: Box<dyn AudioSink>,
    sample_rate: u32,
    next_start: f64,
    active: BTreeMap<u64, ActiveBuffer>,
    next_id: u64,
}

impl PlaybackScheduler {
    #[must_use]
    pub fn new(sink: Box<dyn AudioSink>, sample_rate: u32) -> Self {
        Self {
            sink,
            sample_rate,
            next_start: 0.0,
            active: BTreeMap::new(),
            next_id: 1,
        }
    }

    /// Decode little-endian PCM16 `pcm` at the output rate and schedule it.
    ///
    /// # Errors
    /// Returns an error if the sink rejects the buffer.
    pub fn enqueue(&mut self, pcm: &[u8]) -> Result<ScheduledBuffer> {
        self.enqueue_at(pcm, self.sample_rate)
    }

    /// Like [`Self::enqueue`] for audio recorded at `sample_rate`.
    ///
    /// # Errors
    /// Returns an error if the sink rejects the buffer.
    pub fn enqueue_at(&mut self, pcm: &[u8], sample_rate: u32) -> Result<ScheduledBuffer> {
        self.prune();
        let buffer = PlaybackBuffer {
            id: self.next_id,
            samples: decode_pcm16(pcm).into(),
            sample_rate,
        };
        self.next_id += 1;

        let duration = buffer.duration();
        let start = self.next_start.max(self.sink.current_time());
        self.sink.schedule(&buffer, start)?;
        self.next_start = start + duration;
        self.active.insert(buffer.id, ActiveBuffer { end: start + duration });
        tracing::trace!(id = buffer.id, start, duration, "scheduled playback buffer");

        Ok(ScheduledBuffer { id: buffer.id, start, duration })
    }

    /// Stop everything and rewind the cursor. Used for barge-in and teardown.
    pub fn stop_all(&mut self) {
        for id in self.active.keys() {
            self.sink.stop(*id);
        }
        if !self.active.is_empty() {
            tracing::debug!(stopped = self.active.len(), "playback stopped");
        }
        self.active.clear();
        self.next_start = 0.0;
    }

    /// Drop buffers that have finished playing.
    pub fn prune(&mut self) {
        let now = self.sink.current_time();
        self.active.retain(|_, buffer| buffer.end > now);
    }

    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    #[must_use]
    pub const fn next_start(&self) -> f64 {
        self.next_start
    }

    #[must_use]
    pub fn output_level(&self) -> f32 {
        (self.sink.output_energy() * VOLUME_GAIN).clamp(0.0, 1.0)
    }
}

pub(crate) type SharedPlayback = Arc<Mutex<PlaybackScheduler>>;

/// Forward the output level to the UI until the session is superseded.
pub(crate) async fn run_volume_meter(
    playback: SharedPlayback,
    handlers: EventHandlers,
    cadence: Duration,
    token: SessionToken,
) {
    let mut ticker = tokio::time::interval(cadence);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        if !token.is_current() {
            break;
        }
        let level = {
            let mut playback = playback.lock().await;
            playback.prune();
            playback.output_level()
        };
        handlers.volume(level);
    }
    tracing::debug!(generation = token.generation(), "volume meter stopped");
}

/// Little-endian PCM16 to `[-1, 1)` floats. A trailing odd byte is ignored.
#[must_use]
pub fn decode_pcm16(pcm: &[u8]) -> Vec<f32> {
    pcm.chunks_exact(2)
        .map(|pair| f32::from(i16::from_le_bytes([pair[0], pair[1]])) / 32768.0)
        .collect()
}

/// Sink that renders nothing but keeps an accurate playhead, for headless use
/// and for metering.
pub struct SoftwareSink {
    origin: Instant,
    scheduled: Vec<(f64, PlaybackBuffer)>,
}

impl SoftwareSink {
    #[must_use]
    pub fn new() -> Self {
        Self { origin: Instant::now(), scheduled: Vec::new() }
    }
}

impl Default for SoftwareSink {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioSink for SoftwareSink {
    fn current_time(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }

    fn schedule(&mut self, buffer: &PlaybackBuffer, start: f64) -> Result<()> {
        let now = self.current_time();
        self.scheduled.retain(|(start, buffer)| start + buffer.duration() > now);
        self.scheduled.push((start, buffer.clone()));
        Ok(())
    }

    fn stop(&mut self, id: u64) {
        self.scheduled.retain(|(_, buffer)| buffer.id != id);
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
    fn output_energy(&self) -> f32 {
        let now = self.current_time();
        let Some((start, buffer)) = self
            .scheduled
            .iter()
            .find(|(start, buffer)| *start <= now && now < start + buffer.duration())
        else {
            return 0.0;
        };
        let offset = ((now - start) * f64::from(buffer.sample_rate)) as usize;
        let window = &buffer.samples[offset.min(buffer.samples.len())..];
        let window = &window[..window.len().min(ENERGY_WINDOW)];
        if window.is_empty() {
            return 0.0;
        }
        let power = window.iter().map(|s| s * s).sum::<f32>() / window.len() as f32;
        power.sqrt()
    }
}
