//! Capture pipeline: microphone sample blocks and periodic video frames.

mod audio;
mod screen;
mod video;

pub use audio::{MicCapture, MicConfig};
pub use screen::ScreenSource;
pub use video::{spawn_video_capture, RawFrame, VideoConfig, VideoSource};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("capture device access denied")]
    Permission,

    #[error("capture device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("video source unavailable: {0}")]
    VideoUnavailable(String),
}
