//! Session lifecycle for one live tutoring connection.
//!
//! The state machine is a pure core: every capture, transport, and user
//! event goes through [`SessionCore::handle`], which returns the actions to
//! perform. A driver task owns the real components and runs the core from a
//! single `select!` loop, so handlers interleave but never run concurrently;
//! stale completions are discarded by phase checks rather than locks.

use crate::codec;
use crate::live::{self, LiveClient, LiveConfig, LiveEvent, MediaChunk};
use crate::media_event::MediaEvent;
use crate::media_in::{
    spawn_video_capture, CaptureError, MicCapture, MicConfig, ScreenSource, VideoConfig,
};
use crate::playback::{AudioOutput, PlaybackScheduler};
use crate::pulse_out::{OutputError, PulseOutput};
use crate::recorder::DebugRecorder;
use base64::engine::general_purpose;
use base64::Engine;
use smallvec::SmallVec;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Only one live session may exist at a time; the previous one must finish
/// tearing down before a new one can start.
static SESSION_ACTIVE: AtomicBool = AtomicBool::new(false);

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("a live session is already active")]
    AlreadyActive,

    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error(transparent)]
    Output(#[from] OutputError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Connecting,
    Open,
    Closing,
    Closed,
    Errored,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub mic: MicConfig,
    pub video: VideoConfig,
    pub output_sample_rate: u32,
    /// When set, outbound mic audio and inbound model speech are also
    /// written as WAV files under this directory.
    pub record_dir: Option<PathBuf>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            mic: MicConfig::default(),
            video: VideoConfig::default(),
            output_sample_rate: 24_000,
            record_dir: None,
        }
    }
}

/// Everything that can happen to a session, from any direction.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Start,
    TransportOpened,
    TransportMessage {
        audio: Option<String>,
        interrupted: bool,
    },
    TransportClosed,
    TransportError(String),
    MicBlock(Vec<f32>),
    Frame(Vec<u8>),
    ToggleMute,
    ToggleVideo,
    Stop,
}

/// What the driver should do in response to an event.
#[derive(Debug)]
pub enum Action {
    Send(MediaChunk),
    Play(codec::AudioBuffer),
    InterruptPlayback,
    Teardown { error: Option<String> },
    Status(&'static str),
}

pub type Actions = SmallVec<[Action; 4]>;

/// Pure session state machine.
pub struct SessionCore {
    phase: Phase,
    muted: bool,
    video_enabled: bool,
    output_sample_rate: u32,
}

impl SessionCore {
    pub fn new(output_sample_rate: u32) -> Self {
        Self {
            phase: Phase::Idle,
            muted: false,
            video_enabled: true,
            output_sample_rate,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn muted(&self) -> bool {
        self.muted
    }

    pub fn video_enabled(&self) -> bool {
        self.video_enabled
    }

    pub fn handle(&mut self, event: SessionEvent) -> Actions {
        let mut out = Actions::new();
        match event {
            SessionEvent::Start => {
                if self.phase == Phase::Idle {
                    self.phase = Phase::Connecting;
                    out.push(Action::Status("connecting"));
                }
            }

            SessionEvent::TransportOpened => {
                if self.phase == Phase::Connecting {
                    self.phase = Phase::Open;
                    info!("session open");
                    out.push(Action::Status("connected, say hello"));
                } else {
                    debug!("stale transport-open in {:?}", self.phase);
                }
            }

            SessionEvent::TransportMessage { audio, interrupted } => {
                if self.phase != Phase::Open {
                    debug!("stale transport message in {:?}", self.phase);
                    return out;
                }
                if let Some(envelope) = audio {
                    match codec::decode(&envelope).and_then(|raw| {
                        codec::decode_audio_data(&raw, self.output_sample_rate, 1)
                    }) {
                        Ok(buffer) => out.push(Action::Play(buffer)),
                        Err(e) => warn!("dropping malformed audio payload: {}", e),
                    }
                }
                if interrupted {
                    info!("barge-in: cancelling queued speech");
                    out.push(Action::InterruptPlayback);
                }
            }

            SessionEvent::MicBlock(samples) => {
                if self.phase != Phase::Open || self.muted {
                    return out;
                }
                match codec::encode(&samples) {
                    Ok(data) => out.push(Action::Send(MediaChunk {
                        data,
                        mime_type: live::AUDIO_MIME.to_string(),
                    })),
                    Err(e) => warn!("dropping unencodable mic block: {}", e),
                }
            }

            SessionEvent::Frame(jpeg) => {
                if self.phase != Phase::Open || !self.video_enabled {
                    return out;
                }
                out.push(Action::Send(MediaChunk {
                    data: general_purpose::STANDARD.encode(&jpeg),
                    mime_type: live::JPEG_MIME.to_string(),
                }));
            }

            SessionEvent::ToggleMute => {
                self.muted = !self.muted;
                info!("microphone {}", if self.muted { "muted" } else { "live" });
            }

            SessionEvent::ToggleVideo => {
                self.video_enabled = !self.video_enabled;
                info!(
                    "video {}",
                    if self.video_enabled { "enabled" } else { "disabled" }
                );
            }

            SessionEvent::Stop => self.begin_close(None, &mut out),
            SessionEvent::TransportClosed => self.begin_close(None, &mut out),
            SessionEvent::TransportError(e) => self.begin_close(Some(e), &mut out),
        }
        out
    }

    fn begin_close(&mut self, error: Option<String>, out: &mut Actions) {
        match self.phase {
            // Already torn down (or tearing down); nothing left to do.
            Phase::Closing | Phase::Closed | Phase::Errored => {}
            _ => {
                self.phase = Phase::Closing;
                let errored = error.is_some();
                out.push(Action::Teardown { error });
                self.phase = if errored { Phase::Errored } else { Phase::Closed };
            }
        }
    }
}

/// Status snapshot observable by the UI layer.
#[derive(Debug, Clone)]
pub struct SessionStatus {
    pub phase: Phase,
    pub message: String,
    pub error: Option<String>,
}

/// Control handle for a running session. All triggers are synchronous and
/// safe to call at any point in the lifecycle.
pub struct SessionHandle {
    cmd_tx: mpsc::UnboundedSender<SessionEvent>,
    status_rx: watch::Receiver<SessionStatus>,
    driver: JoinHandle<()>,
}

impl SessionHandle {
    pub fn stop(&self) {
        let _ = self.cmd_tx.send(SessionEvent::Stop);
    }

    pub fn toggle_mute(&self) {
        let _ = self.cmd_tx.send(SessionEvent::ToggleMute);
    }

    pub fn toggle_video(&self) {
        let _ = self.cmd_tx.send(SessionEvent::ToggleVideo);
    }

    pub fn status(&self) -> watch::Receiver<SessionStatus> {
        self.status_rx.clone()
    }

    /// Wait for the session to finish tearing down.
    pub async fn wait(self) {
        let _ = self.driver.await;
    }
}

/// Start the one live session: acquire capture devices and the output
/// device, then connect the transport asynchronously. Must be called from
/// within a tokio runtime. Fails without retaining any resources.
pub fn start_session(
    cfg: SessionConfig,
    live_cfg: LiveConfig,
) -> Result<SessionHandle, SessionError> {
    if SESSION_ACTIVE.swap(true, Ordering::SeqCst) {
        return Err(SessionError::AlreadyActive);
    }

    match open_session(cfg, live_cfg) {
        Ok(handle) => Ok(handle),
        Err(e) => {
            SESSION_ACTIVE.store(false, Ordering::SeqCst);
            Err(e)
        }
    }
}

fn open_session(
    cfg: SessionConfig,
    live_cfg: LiveConfig,
) -> Result<SessionHandle, SessionError> {
    let (media_tx, media_rx) = mpsc::channel(8);

    let mic = MicCapture::open(cfg.mic.clone(), media_tx.clone())?;

    let screen = match ScreenSource::open() {
        Ok(screen) => screen,
        Err(e) => {
            mic.close();
            return Err(e.into());
        }
    };
    let video_task = spawn_video_capture(screen, cfg.video.clone(), media_tx);

    let (ended_tx, ended_rx) = mpsc::unbounded_channel();
    let output = match PulseOutput::open(cfg.output_sample_rate, ended_tx) {
        Ok(output) => output,
        Err(e) => {
            mic.close();
            video_task.abort();
            return Err(e.into());
        }
    };
    let scheduler = PlaybackScheduler::new(output);

    let recorder = cfg
        .record_dir
        .as_deref()
        .and_then(|dir| DebugRecorder::create(dir, cfg.mic.sample_rate, cfg.output_sample_rate));

    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (status_tx, status_rx) = watch::channel(SessionStatus {
        phase: Phase::Idle,
        message: "starting".to_string(),
        error: None,
    });

    let core = SessionCore::new(cfg.output_sample_rate);
    let driver = tokio::spawn(drive(
        core, live_cfg, mic, video_task, scheduler, recorder, media_rx, ended_rx, cmd_rx,
        status_tx,
    ));

    Ok(SessionHandle {
        cmd_tx,
        status_rx,
        driver,
    })
}

struct Driver<O: AudioOutput> {
    core: SessionCore,
    mic: MicCapture,
    video_task: JoinHandle<()>,
    scheduler: PlaybackScheduler<O>,
    recorder: Option<DebugRecorder>,
    client: Option<LiveClient>,
    status_tx: watch::Sender<SessionStatus>,
    done: bool,
}

impl<O: AudioOutput> Driver<O> {
    fn apply(&mut self, actions: Actions) {
        for action in actions {
            match action {
                Action::Send(chunk) => {
                    if let Some(client) = &self.client {
                        client.send_realtime(chunk);
                    } else {
                        debug!("transport not ready, dropping outbound chunk");
                    }
                }
                Action::Play(buffer) => {
                    if let Some(recorder) = self.recorder.as_mut() {
                        recorder.tap_model(&buffer);
                    }
                    self.scheduler.schedule(buffer);
                }
                Action::InterruptPlayback => self.scheduler.interrupt(),
                Action::Status(message) => self.publish(message.to_string(), None),
                Action::Teardown { error } => self.teardown(error),
            }
        }
    }

    fn teardown(&mut self, error: Option<String>) {
        info!("tearing down session");
        self.video_task.abort();
        self.mic.close();
        self.scheduler.teardown();
        if let Some(client) = self.client.take() {
            client.close();
        }
        if let Some(recorder) = self.recorder.as_mut() {
            recorder.finish();
        }
        SESSION_ACTIVE.store(false, Ordering::SeqCst);

        let message = if error.is_some() {
            "connection error"
        } else {
            "session ended"
        };
        self.publish(message.to_string(), error);
        self.done = true;
    }

    fn publish(&self, message: String, error: Option<String>) {
        let _ = self.status_tx.send(SessionStatus {
            phase: self.core.phase(),
            message,
            error,
        });
    }
}

#[allow(clippy::too_many_arguments)]
async fn drive(
    core: SessionCore,
    live_cfg: LiveConfig,
    mic: MicCapture,
    video_task: JoinHandle<()>,
    scheduler: PlaybackScheduler<PulseOutput>,
    recorder: Option<DebugRecorder>,
    mut media_rx: mpsc::Receiver<MediaEvent>,
    mut ended_rx: mpsc::UnboundedReceiver<crate::playback::VoiceId>,
    mut cmd_rx: mpsc::UnboundedReceiver<SessionEvent>,
    status_tx: watch::Sender<SessionStatus>,
) {
    let (live_tx, mut live_rx) = mpsc::channel::<LiveEvent>(64);
    let (client_tx, mut client_rx) = mpsc::channel::<LiveClient>(1);
    tokio::spawn(async move {
        match LiveClient::connect(live_cfg, live_tx.clone()).await {
            Ok(client) => {
                // If the session is already gone the client drops here,
                // which closes the socket.
                let _ = client_tx.send(client).await;
            }
            Err(e) => {
                let _ = live_tx.send(LiveEvent::Error(e.to_string())).await;
            }
        }
    });

    let mut driver = Driver {
        core,
        mic,
        video_task,
        scheduler,
        recorder,
        client: None,
        status_tx,
        done: false,
    };

    let actions = driver.core.handle(SessionEvent::Start);
    driver.apply(actions);

    while !driver.done {
        tokio::select! {
            Some(event) = cmd_rx.recv() => {
                let actions = driver.core.handle(event);
                driver.apply(actions);
            }
            Some(event) = media_rx.recv() => {
                let event = match event {
                    MediaEvent::AudioBlock(samples) => {
                        if driver.core.phase() == Phase::Open && !driver.core.muted() {
                            if let Some(recorder) = driver.recorder.as_mut() {
                                recorder.tap_mic(&samples);
                            }
                        }
                        SessionEvent::MicBlock(samples)
                    }
                    MediaEvent::VideoFrame { jpeg } => SessionEvent::Frame(jpeg),
                };
                let actions = driver.core.handle(event);
                driver.apply(actions);
            }
            Some(event) = live_rx.recv() => {
                let event = match event {
                    LiveEvent::Opened => SessionEvent::TransportOpened,
                    LiveEvent::Message(msg) => SessionEvent::TransportMessage {
                        audio: msg.audio,
                        interrupted: msg.interrupted,
                    },
                    LiveEvent::Closed => SessionEvent::TransportClosed,
                    LiveEvent::Error(e) => SessionEvent::TransportError(e),
                };
                let actions = driver.core.handle(event);
                driver.apply(actions);
            }
            Some(client) = client_rx.recv() => {
                driver.client = Some(client);
            }
            Some(voice) = ended_rx.recv() => {
                driver.scheduler.voice_ended(voice);
            }
            else => {
                // Every channel closed underneath us; make sure resources go.
                let actions = driver.core.handle(SessionEvent::Stop);
                driver.apply(actions);
                break;
            }
        }
    }

    info!("session driver finished");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_core() -> SessionCore {
        let mut core = SessionCore::new(24_000);
        core.handle(SessionEvent::Start);
        core.handle(SessionEvent::TransportOpened);
        assert_eq!(core.phase(), Phase::Open);
        core
    }

    fn send_count(actions: &Actions) -> usize {
        actions
            .iter()
            .filter(|a| matches!(a, Action::Send(_)))
            .count()
    }

    #[test]
    fn start_connect_open() {
        let mut core = SessionCore::new(24_000);
        assert_eq!(core.phase(), Phase::Idle);

        core.handle(SessionEvent::Start);
        assert_eq!(core.phase(), Phase::Connecting);

        core.handle(SessionEvent::TransportOpened);
        assert_eq!(core.phase(), Phase::Open);
    }

    #[test]
    fn mic_blocks_are_encoded_and_sent_while_open() {
        let mut core = open_core();
        let actions = core.handle(SessionEvent::MicBlock(vec![0.1; 4096]));
        assert_eq!(send_count(&actions), 1);
        match &actions[0] {
            Action::Send(chunk) => assert_eq!(chunk.mime_type, live::AUDIO_MIME),
            other => panic!("unexpected action: {:?}", other),
        }
    }

    #[test]
    fn mute_suppresses_encoding_until_unmuted() {
        let mut core = open_core();

        core.handle(SessionEvent::ToggleMute);
        assert!(core.muted());
        for _ in 0..5 {
            let actions = core.handle(SessionEvent::MicBlock(vec![0.1; 512]));
            assert_eq!(send_count(&actions), 0);
        }

        core.handle(SessionEvent::ToggleMute);
        let actions = core.handle(SessionEvent::MicBlock(vec![0.1; 512]));
        assert_eq!(send_count(&actions), 1);
    }

    #[test]
    fn mic_blocks_before_open_are_dropped() {
        let mut core = SessionCore::new(24_000);
        core.handle(SessionEvent::Start);
        let actions = core.handle(SessionEvent::MicBlock(vec![0.1; 512]));
        assert!(actions.is_empty());
    }

    #[test]
    fn frames_respect_the_video_flag() {
        let mut core = open_core();

        let actions = core.handle(SessionEvent::Frame(vec![0xFF, 0xD8]));
        assert_eq!(send_count(&actions), 1);
        match &actions[0] {
            Action::Send(chunk) => assert_eq!(chunk.mime_type, live::JPEG_MIME),
            other => panic!("unexpected action: {:?}", other),
        }

        core.handle(SessionEvent::ToggleVideo);
        let actions = core.handle(SessionEvent::Frame(vec![0xFF, 0xD8]));
        assert_eq!(send_count(&actions), 0);
    }

    #[test]
    fn inbound_audio_is_decoded_for_playback() {
        let mut core = open_core();

        let envelope = codec::encode(&vec![0.25; 2_400]).unwrap(); // 0.1 s at 24 kHz
        let actions = core.handle(SessionEvent::TransportMessage {
            audio: Some(envelope),
            interrupted: false,
        });

        assert_eq!(actions.len(), 1);
        match &actions[0] {
            Action::Play(buffer) => {
                assert!((buffer.duration() - 0.1).abs() < 1e-9);
                assert_eq!(buffer.sample_rate, 24_000);
            }
            other => panic!("unexpected action: {:?}", other),
        }
    }

    #[test]
    fn malformed_audio_is_dropped_without_ending_the_session() {
        let mut core = open_core();
        let actions = core.handle(SessionEvent::TransportMessage {
            audio: Some("!!!not base64!!!".to_string()),
            interrupted: false,
        });
        assert!(actions.is_empty());
        assert_eq!(core.phase(), Phase::Open);
    }

    #[test]
    fn interruption_triggers_playback_cancellation() {
        let mut core = open_core();
        let actions = core.handle(SessionEvent::TransportMessage {
            audio: None,
            interrupted: true,
        });
        assert!(matches!(actions[0], Action::InterruptPlayback));
        assert_eq!(core.phase(), Phase::Open);
    }

    #[test]
    fn stop_is_idempotent() {
        let mut core = open_core();

        let actions = core.handle(SessionEvent::Stop);
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::Teardown { error: None })));
        assert_eq!(core.phase(), Phase::Closed);

        let actions = core.handle(SessionEvent::Stop);
        assert!(actions.is_empty());
        assert_eq!(core.phase(), Phase::Closed);
    }

    #[test]
    fn stop_before_connect_resolves_is_safe() {
        let mut core = SessionCore::new(24_000);
        core.handle(SessionEvent::Start);
        assert_eq!(core.phase(), Phase::Connecting);

        let actions = core.handle(SessionEvent::Stop);
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::Teardown { .. })));
        assert_eq!(core.phase(), Phase::Closed);

        // A late transport-open must not resurrect the session.
        let actions = core.handle(SessionEvent::TransportOpened);
        assert!(actions.is_empty());
        assert_eq!(core.phase(), Phase::Closed);
    }

    #[test]
    fn transport_error_ends_in_errored() {
        let mut core = open_core();
        let actions = core.handle(SessionEvent::TransportError("tls handshake".to_string()));
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::Teardown { error: Some(_) })));
        assert_eq!(core.phase(), Phase::Errored);

        // Further events are stale.
        assert!(core.handle(SessionEvent::Stop).is_empty());
        assert!(core
            .handle(SessionEvent::MicBlock(vec![0.0; 16]))
            .is_empty());
    }

    #[test]
    fn remote_close_tears_down_cleanly() {
        let mut core = open_core();
        let actions = core.handle(SessionEvent::TransportClosed);
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::Teardown { error: None })));
        assert_eq!(core.phase(), Phase::Closed);
    }
}
