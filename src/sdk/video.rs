//! Periodic camera sampling.

use crate::Result;
use crate::protocol::client_messages::ClientMessage;
use crate::protocol::models::Blob;
use async_trait::async_trait;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::RgbImage;
use std::time::Duration;
use tokio::time::MissedTickBehavior;

use super::transport::Outbound;

#[async_trait]
pub trait VideoSource: Send {
    /// Current frame size. Zero in either dimension means no frame is available yet.
    fn dimensions(&self) -> (u32, u32);

    /// # Errors
    /// Returns an error if the frame cannot be grabbed.
    async fn capture(&mut self) -> Result<RgbImage>;
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct SamplerSettings {
    pub interval: Duration,
    pub scale: f32,
    pub quality: u8,
}

/// Downscale by `scale` and encode as JPEG.
///
/// # Errors
/// Returns an error if encoding fails.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
pub fn encode_frame(frame: &RgbImage, scale: f32, quality: u8) -> Result<Vec<u8>> {
    let width = ((frame.width() as f32 * scale).round() as u32).max(1);
    let height = ((frame.height() as f32 * scale).round() as u32).max(1);
    let small = imageops::resize(frame, width, height, FilterType::Triangle);

    let mut jpeg = Vec::new();
    JpegEncoder::new_with_quality(&mut jpeg, quality).encode_image(&small)?;
    Ok(jpeg)
}

/// Send one frame per tick. Capture, encode and send finish before the next
/// tick, so at most one frame is ever in flight.
pub(crate) async fn run_video_sampler(mut source: Box<dyn VideoSource>, settings: SamplerSettings, outbound: Outbound) {
    let generation = outbound.token().generation();
    let mut ticker = tokio::time::interval(settings.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    tracing::debug!(generation, interval = ?settings.interval, "video sampler started");

    loop {
        ticker.tick().await;
        if !outbound.is_current() {
            break;
        }
        let (width, height) = source.dimensions();
        if width == 0 || height == 0 {
            continue;
        }
        let jpeg = match source.capture().await.and_then(|frame| encode_frame(&frame, settings.scale, settings.quality)) {
            Ok(jpeg) => jpeg,
            Err(err) => {
                tracing::warn!(generation, error = %err, "skipping video frame");
                continue;
            }
        };
        if !outbound.send(ClientMessage::video(Blob::jpeg(&jpeg))).await {
            break;
        }
    }
    tracing::debug!(generation, "video sampler stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sdk::transport::SessionToken;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tokio::sync::mpsc;

    struct TestPattern {
        size: (u32, u32),
    }

    #[async_trait]
    impl VideoSource for TestPattern {
        fn dimensions(&self) -> (u32, u32) {
            self.size
        }

        async fn capture(&mut self) -> Result<RgbImage> {
            Ok(RgbImage::from_fn(self.size.0, self.size.1, |x, y| {
                image::Rgb([(x % 256) as u8, (y % 256) as u8, 128])
            }))
        }
    }

    #[test]
    fn frames_are_downscaled_jpeg() {
        let frame = RgbImage::new(640, 480);
        let jpeg = encode_frame(&frame, 0.25, 50).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);

        let decoded = image::load_from_memory_with_format(&jpeg, image::ImageFormat::Jpeg).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (160, 120));
    }

    fn settings() -> SamplerSettings {
        SamplerSettings { interval: Duration::from_millis(500), scale: 0.25, quality: 50 }
    }

    #[tokio::test(start_paused = true)]
    async fn samples_on_cadence_until_superseded() {
        let current = Arc::new(AtomicU64::new(1));
        let (tx, mut rx) = mpsc::channel(8);
        let outbound = Outbound::new(SessionToken::new(1, Arc::clone(&current)), tx);
        let source = Box::new(TestPattern { size: (64, 48) });

        let task = tokio::spawn(run_video_sampler(source, settings(), outbound));
        tokio::time::sleep(Duration::from_millis(1100)).await;

        let mut frames = 0;
        while let Ok(message) = rx.try_recv() {
            match message {
                ClientMessage::RealtimeInput(input) => {
                    assert_eq!(input.video.unwrap().mime_type, "image/jpeg");
                    frames += 1;
                }
                other => panic!("unexpected message: {other:?}"),
            }
        }
        assert_eq!(frames, 3);

        current.store(0, Ordering::Release);
        tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn empty_source_sends_nothing() {
        let current = Arc::new(AtomicU64::new(1));
        let (tx, mut rx) = mpsc::channel(8);
        let outbound = Outbound::new(SessionToken::new(1, current), tx);

        let task = tokio::spawn(run_video_sampler(Box::new(TestPattern { size: (0, 0) }), settings(), outbound));
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(rx.try_recv().is_err());
        task.abort();
    }
}
