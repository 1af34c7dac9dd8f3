//! Periodic video frame capture.
//!
//! A ticker grabs the freshest frame from the source at a fixed cadence,
//! JPEG-encodes it, and forwards it to the session driver. Ticks missed
//! while a grab or encode is still running are skipped, and a busy driver
//! drops frames: at most one frame is ever in flight.

use super::CaptureError;
use crate::media_event::MediaEvent;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct VideoConfig {
    pub frame_interval: Duration,
    pub jpeg_quality: u8,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            frame_interval: Duration::from_millis(500), // 2 fps
            jpeg_quality: 50,
        }
    }
}

/// A device that can produce the most recent video frame on demand. The
/// shipped implementation is [`super::ScreenSource`]; tests use synthetic
/// sources.
pub trait VideoSource: Send + 'static {
    fn grab(&mut self) -> Result<RawFrame, CaptureError>;
}

pub struct RawFrame {
    pub width: u32,
    pub height: u32,
    pub rgba: Vec<u8>,
}

pub fn spawn_video_capture<S: VideoSource>(
    mut source: S,
    cfg: VideoConfig,
    tx: mpsc::Sender<MediaEvent>,
) -> JoinHandle<()> {
    info!(
        "video capture every {} ms, jpeg quality {}",
        cfg.frame_interval.as_millis(),
        cfg.jpeg_quality
    );

    tokio::spawn(async move {
        let mut ticker = interval(cfg.frame_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;

            let frame = match source.grab() {
                Ok(frame) => frame,
                Err(e) => {
                    debug!("frame grab failed: {}", e);
                    continue;
                }
            };

            let jpeg = match encode_jpeg(&frame, cfg.jpeg_quality) {
                Ok(jpeg) => jpeg,
                Err(e) => {
                    warn!("jpeg encode failed: {}", e);
                    continue;
                }
            };

            match tx.try_send(MediaEvent::VideoFrame { jpeg }) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!("session driver busy, frame dropped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => break,
            }
        }

        info!("video capture stopped");
    })
}

fn encode_jpeg(frame: &RawFrame, quality: u8) -> Result<Vec<u8>, CaptureError> {
    let rgba = image::RgbaImage::from_raw(frame.width, frame.height, frame.rgba.clone())
        .ok_or_else(|| CaptureError::VideoUnavailable("frame buffer size mismatch".into()))?;
    let rgb = image::DynamicImage::ImageRgba8(rgba).to_rgb8();

    let mut jpeg = Vec::new();
    let mut encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut jpeg, quality);
    encoder
        .encode(
            rgb.as_raw(),
            frame.width,
            frame.height,
            image::ExtendedColorType::Rgb8,
        )
        .map_err(|e| CaptureError::VideoUnavailable(e.to_string()))?;

    Ok(jpeg)
}
