//! Microphone capture: device abstraction, framing and PCM16 encoding.

use crate::Result;
use crate::error::SetupError;
use crate::protocol::client_messages::ClientMessage;
use crate::protocol::models::Blob;
use async_trait::async_trait;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;

use super::transport::Outbound;

const FEEDER_CAPACITY: usize = 64;

/// A capture device. Opening it acquires the device; dropping the returned
/// stream releases it.
#[async_trait]
pub trait AudioInput: Send + Sync {
    /// # Errors
    /// Returns [`SetupError::DevicePermission`] when access is denied, or
    /// [`SetupError::Restricted`] when capture is unavailable in this context.
    async fn open(&self, sample_rate: u32) -> Result<Box<dyn AudioStream>>;
}

#[async_trait]
pub trait AudioStream: Send {
    /// Next block of mono samples in `[-1, 1]`. `None` when the device stops.
    async fn next_block(&mut self) -> Option<Vec<f32>>;
}

/// Splits arbitrarily sized device blocks into fixed-size frames.
#[derive(Debug)]
pub struct FrameAssembler {
    frame_samples: usize,
    pending: Vec<f32>,
}

impl FrameAssembler {
    #[must_use]
    pub fn new(frame_samples: usize) -> Self {
        let frame_samples = frame_samples.max(1);
        Self { frame_samples, pending: Vec::with_capacity(frame_samples) }
    }

    pub fn push(&mut self, block: &[f32]) -> Vec<Vec<f32>> {
        self.pending.extend_from_slice(block);
        let mut frames = Vec::new();
        while self.pending.len() >= self.frame_samples {
            let rest = self.pending.split_off(self.frame_samples);
            frames.push(std::mem::replace(&mut self.pending, rest));
        }
        frames
    }
}

/// Float samples to little-endian PCM16, clamping out-of-range input.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn encode_pcm16(samples: &[f32]) -> Vec<u8> {
    samples
        .iter()
        .flat_map(|s| ((s * 32768.0).clamp(-32768.0, 32767.0) as i16).to_le_bytes())
        .collect()
}

/// Forward encoded frames until the device stops or the session is superseded.
pub(crate) async fn run_capture(
    mut stream: Box<dyn AudioStream>,
    frame_samples: usize,
    sample_rate: u32,
    outbound: Outbound,
) {
    let generation = outbound.token().generation();
    let mut assembler = FrameAssembler::new(frame_samples);
    tracing::debug!(generation, frame_samples, sample_rate, "capture started");
    while let Some(block) = stream.next_block().await {
        for frame in assembler.push(&block) {
            let blob = Blob::pcm16(&encode_pcm16(&frame), sample_rate);
            if !outbound.send(ClientMessage::audio(blob)).await {
                tracing::debug!(generation, "capture stopped: session no longer current");
                return;
            }
        }
    }
    tracing::debug!(generation, "capture device ended");
}

#[derive(Default)]
struct Slot {
    tx: Option<mpsc::Sender<Vec<f32>>>,
    denied: Option<String>,
}

/// Capture input fed by the embedding application through a [`SampleFeeder`].
///
/// At most one stream is open at a time; opening again replaces the previous
/// stream's feed.
#[derive(Clone)]
pub struct ChannelInput {
    slot: Arc<Mutex<Slot>>,
}

/// Pushes device samples into the open [`ChannelInput`] stream.
#[derive(Clone)]
pub struct SampleFeeder {
    slot: Arc<Mutex<Slot>>,
}

impl ChannelInput {
    #[must_use]
    pub fn new() -> (Self, SampleFeeder) {
        let slot = Arc::new(Mutex::new(Slot::default()));
        (Self { slot: Arc::clone(&slot) }, SampleFeeder { slot })
    }
}

impl SampleFeeder {
    /// Returns `false` when no stream is open (nothing is capturing) or the
    /// stream is lagging; the samples are dropped.
    pub fn push(&self, samples: Vec<f32>) -> bool {
        let slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        slot.tx.as_ref().is_some_and(|tx| tx.try_send(samples).is_ok())
    }

    /// Whether a capture stream currently holds the device.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .tx
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }

    /// Make subsequent opens fail as if the user refused microphone access.
    /// `None` grants access again.
    pub fn set_denied(&self, reason: Option<String>) {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner).denied = reason;
    }
}

#[async_trait]
impl AudioInput for ChannelInput {
    async fn open(&self, sample_rate: u32) -> Result<Box<dyn AudioStream>> {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(reason) = &slot.denied {
            return Err(SetupError::DevicePermission(reason.clone()).into());
        }
        let (tx, rx) = mpsc::channel(FEEDER_CAPACITY);
        slot.tx = Some(tx);
        tracing::debug!(sample_rate, "channel input opened");
        Ok(Box::new(ChannelStream { rx, slot: Arc::clone(&self.slot) }))
    }
}

struct ChannelStream {
    rx: mpsc::Receiver<Vec<f32>>,
    slot: Arc<Mutex<Slot>>,
}

#[async_trait]
impl AudioStream for ChannelStream {
    async fn next_block(&mut self) -> Option<Vec<f32>> {
        self.rx.recv().await
    }
}

impl Drop for ChannelStream {
    fn drop(&mut self) {
        self.rx.close();
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        // A newer stream may already own the slot.
        if slot.tx.as_ref().is_some_and(mpsc::Sender::is_closed) {
            slot.tx = None;
        }
        tracing::debug!("channel input released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sdk::transport::SessionToken;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[test]
    fn assembler_emits_fixed_frames() {
        let mut assembler = FrameAssembler::new(4);
        assert!(assembler.push(&[0.0; 3]).is_empty());
        let frames = assembler.push(&[0.1; 6]);
        assert_eq!(frames.len(), 2);
        assert!(frames.iter().all(|f| f.len() == 4));
        assert_eq!(assembler.push(&[0.2]).len(), 0);
    }

    #[test]
    fn pcm16_encoding_clamps() {
        let bytes = encode_pcm16(&[0.0, 0.5, 1.0, -1.0, -2.0]);
        let samples: Vec<i16> = bytes.chunks_exact(2).map(|b| i16::from_le_bytes([b[0], b[1]])).collect();
        assert_eq!(samples, vec![0, 16384, 32767, -32768, -32768]);
    }

    #[tokio::test]
    async fn denied_open_is_a_permission_error() {
        let (input, feeder) = ChannelInput::new();
        feeder.set_denied(Some("user refused".to_string()));
        let err = input.open(16_000).await.err().unwrap();
        assert!(matches!(err, crate::Error::Setup(SetupError::DevicePermission(_))));
        assert!(!feeder.is_active());
    }

    #[tokio::test]
    async fn dropping_stream_releases_device() {
        let (input, feeder) = ChannelInput::new();
        assert!(!feeder.push(vec![0.0]));

        let mut stream = input.open(16_000).await.unwrap();
        assert!(feeder.is_active());
        assert!(feeder.push(vec![0.25]));
        assert_eq!(stream.next_block().await, Some(vec![0.25]));

        drop(stream);
        assert!(!feeder.is_active());
        assert!(!feeder.push(vec![0.0]));
    }

    #[tokio::test]
    async fn capture_sends_frames_until_superseded() {
        let (input, feeder) = ChannelInput::new();
        let stream = input.open(16_000).await.unwrap();
        let current = Arc::new(AtomicU64::new(3));
        let (tx, mut rx) = mpsc::channel(8);
        let outbound = Outbound::new(SessionToken::new(3, Arc::clone(&current)), tx);

        let task = tokio::spawn(run_capture(stream, 4, 16_000, outbound));
        assert!(feeder.push(vec![0.5; 8]));
        for _ in 0..2 {
            match rx.recv().await.unwrap() {
                ClientMessage::RealtimeInput(input) => {
                    let blob = input.audio.unwrap();
                    assert_eq!(blob.mime_type, "audio/pcm;rate=16000");
                    assert_eq!(blob.decode().unwrap().len(), 8);
                }
                other => panic!("unexpected message: {other:?}"),
            }
        }

        current.store(4, Ordering::Release);
        assert!(feeder.push(vec![0.5; 4]));
        task.await.unwrap();
        assert!(rx.try_recv().is_err());
        assert!(!feeder.is_active());
    }
}
