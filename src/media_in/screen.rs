//! Screen-backed video source using the `xcap` recorder.
//!
//! The tutoring session streams whatever the user is showing: with no
//! portable camera device layer available, the shipped source records the
//! primary monitor. Any other grabber can stand in behind [`VideoSource`].

use super::video::{RawFrame, VideoSource};
use super::CaptureError;
use std::sync::mpsc::Receiver;
use std::time::Duration;
use tracing::info;
use xcap::{Frame, Monitor, VideoRecorder};

pub struct ScreenSource {
    // Held so the recorder keeps running.
    _recorder: VideoRecorder,
    frame_rx: Receiver<Frame>,
}

impl ScreenSource {
    /// Start recording the primary monitor (or the first one found).
    pub fn open() -> Result<Self, CaptureError> {
        let monitors =
            Monitor::all().map_err(|e| CaptureError::VideoUnavailable(e.to_string()))?;
        if monitors.is_empty() {
            return Err(CaptureError::VideoUnavailable("no monitors found".into()));
        }

        let monitor = monitors
            .iter()
            .find(|m| m.is_primary().unwrap_or(false))
            .unwrap_or(&monitors[0])
            .clone();

        info!(
            "screen source: {} ({}x{})",
            monitor.name().unwrap_or_else(|_| "unknown".to_string()),
            monitor.width().unwrap_or(0),
            monitor.height().unwrap_or(0)
        );

        let (recorder, frame_rx) = monitor
            .video_recorder()
            .map_err(|e| CaptureError::VideoUnavailable(e.to_string()))?;
        recorder
            .start()
            .map_err(|e| CaptureError::VideoUnavailable(e.to_string()))?;

        Ok(Self {
            _recorder: recorder,
            frame_rx,
        })
    }
}

impl VideoSource for ScreenSource {
    /// Return the freshest frame the recorder has produced, discarding any
    /// backlog so a slow tick never replays stale frames.
    fn grab(&mut self) -> Result<RawFrame, CaptureError> {
        let mut latest = None;
        while let Ok(frame) = self.frame_rx.try_recv() {
            latest = Some(frame);
        }

        let frame = match latest {
            Some(frame) => frame,
            None => self
                .frame_rx
                .recv_timeout(Duration::from_millis(400))
                .map_err(|e| CaptureError::VideoUnavailable(e.to_string()))?,
        };

        Ok(RawFrame {
            width: frame.width,
            height: frame.height,
            rgba: frame.raw,
        })
    }
}
