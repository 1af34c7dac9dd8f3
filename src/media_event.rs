//! Events emitted by the capture pipeline.

/// One unit of captured media, pushed from the capture tasks to the session
/// driver. Blocks and frames are transient: at most one is in flight, and
/// overflow is dropped rather than queued.
#[derive(Clone, Debug)]
pub enum MediaEvent {
    /// Fixed-size block of normalized microphone samples (16 kHz mono).
    AudioBlock(Vec<f32>),
    /// JPEG-encoded video frame.
    VideoFrame { jpeg: Vec<u8> },
}
