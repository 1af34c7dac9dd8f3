//! TutorLive - AI learning studio core.
//!
//! Expandable mind-maps through a text-generation endpoint, image
//! generation and editing, and a real-time audio/video tutoring session
//! over a bidirectional streaming connection. The live session engine
//! captures microphone and video input, transcodes it into the streaming
//! wire format, schedules inbound model speech for gapless playback, and
//! supports mid-utterance interruption.

#![forbid(unsafe_code)]

/// PCM and wire-envelope transcoding
pub mod codec;
/// Generative REST glue (mind-map expansion, image generation)
pub mod genai;
/// Live streaming transport
pub mod live;
/// Capture pipeline event types
pub mod media_event;
/// Microphone and video capture
pub mod media_in;
/// Arena-backed mind-map tree
pub mod mindmap;
/// Gapless playback scheduling
pub mod playback;
/// PulseAudio output device
pub mod pulse_out;
/// Diagnostic WAV recorder
pub mod recorder;
/// Session state machine and driver
pub mod session;
