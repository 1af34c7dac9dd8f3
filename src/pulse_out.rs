//! PulseAudio playback device behind the [`AudioOutput`] seam.
//!
//! A dedicated writer thread owns the blocking PulseAudio stream. The
//! output clock is the number of samples written (silence included) divided
//! by the sample rate, so scheduled start times line up exactly with what
//! has reached the sink. Buffers are written in ~20 ms slices with command
//! polling in between, which keeps barge-in latency to about one slice.

use crate::codec::AudioBuffer;
use crate::playback::{AudioOutput, VoiceId};
use libpulse_binding as pulse;
use libpulse_simple_binding as psimple;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, Sender, TryRecvError};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{error, info};

const SLICE_MS: u64 = 20;

#[derive(Debug, Error)]
pub enum OutputError {
    #[error("audio output unavailable: {0}")]
    Unavailable(String),
}

enum Cmd {
    Begin { voice: VoiceId, pcm: Vec<f32>, at: f64 },
    Stop(VoiceId),
    Close,
}

struct OutputClock {
    samples: AtomicU64,
    rate: u32,
}

impl OutputClock {
    fn seconds(&self) -> f64 {
        self.samples.load(Ordering::Relaxed) as f64 / f64::from(self.rate)
    }

    fn advance(&self, samples: usize) {
        self.samples.fetch_add(samples as u64, Ordering::Relaxed);
    }
}

pub struct PulseOutput {
    cmd_tx: Sender<Cmd>,
    clock: Arc<OutputClock>,
    closed: bool,
    next_voice: u64,
}

impl PulseOutput {
    /// Open the default playback device (mono f32 at `sample_rate`).
    /// Natural voice completions are reported through `ended_tx`. The sink
    /// lives on its own thread; this call waits for the device to open.
    pub fn open(
        sample_rate: u32,
        ended_tx: UnboundedSender<VoiceId>,
    ) -> Result<Self, OutputError> {
        let clock = Arc::new(OutputClock {
            samples: AtomicU64::new(0),
            rate: sample_rate,
        });
        let (cmd_tx, cmd_rx) = std::sync::mpsc::channel();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();

        let writer_clock = clock.clone();
        std::thread::Builder::new()
            .name("audio-out".to_string())
            .spawn(move || {
                let sink = match open_sink(sample_rate) {
                    Ok(sink) => {
                        let _ = ready_tx.send(Ok(()));
                        sink
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                writer_loop(sink, writer_clock, cmd_rx, ended_tx);
            })
            .map_err(|e| OutputError::Unavailable(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                cmd_tx,
                clock,
                closed: false,
                next_voice: 0,
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(OutputError::Unavailable(
                "output thread died during open".into(),
            )),
        }
    }
}

impl AudioOutput for PulseOutput {
    fn now(&self) -> f64 {
        self.clock.seconds()
    }

    fn begin(&mut self, buffer: AudioBuffer, at: f64) -> Option<VoiceId> {
        if self.closed {
            return None;
        }

        let voice = VoiceId(self.next_voice);
        self.next_voice += 1;
        let pcm = downmix(buffer);
        if self.cmd_tx.send(Cmd::Begin { voice, pcm, at }).is_err() {
            // Writer thread died; treat the output as closed.
            self.closed = true;
            return None;
        }
        Some(voice)
    }

    fn stop(&mut self, voice: VoiceId) {
        let _ = self.cmd_tx.send(Cmd::Stop(voice));
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            let _ = self.cmd_tx.send(Cmd::Close);
        }
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

fn open_sink(sample_rate: u32) -> Result<psimple::Simple, OutputError> {
    let spec = pulse::sample::Spec {
        format: pulse::sample::Format::F32le,
        channels: 1,
        rate: sample_rate,
    };

    let sink = psimple::Simple::new(
        None, // default server
        "tutorlive",
        pulse::stream::Direction::Playback,
        None, // default device
        "model-speech",
        &spec,
        None, // default channel map
        None, // default buffering
    )
    .map_err(|e| OutputError::Unavailable(e.to_string()))?;

    info!("audio output open at {} Hz", sample_rate);
    Ok(sink)
}

/// Collapse a buffer to the mono stream the sink plays.
fn downmix(buffer: AudioBuffer) -> Vec<f32> {
    let frames = buffer.frames();
    let mut channels = buffer.channels;
    if channels.len() == 1 {
        return channels.pop().unwrap_or_default();
    }

    let scale = 1.0 / channels.len() as f32;
    let mut out = vec![0.0f32; frames];
    for channel in &channels {
        for (acc, sample) in out.iter_mut().zip(channel) {
            *acc += *sample;
        }
    }
    for sample in &mut out {
        *sample *= scale;
    }
    out
}

fn apply(
    cmd: Cmd,
    queue: &mut VecDeque<(VoiceId, Vec<f32>, f64)>,
    cancelled: &mut HashSet<VoiceId>,
) -> bool {
    match cmd {
        Cmd::Begin { voice, pcm, at } => {
            queue.push_back((voice, pcm, at));
            false
        }
        Cmd::Stop(voice) => {
            let before = queue.len();
            queue.retain(|(id, _, _)| *id != voice);
            if queue.len() == before {
                // Not queued: either currently playing or already gone.
                cancelled.insert(voice);
            }
            false
        }
        Cmd::Close => true,
    }
}

fn write_samples(
    sink: &psimple::Simple,
    clock: &OutputClock,
    samples: &[f32],
) -> Result<(), pulse::error::PAErr> {
    let mut bytes = Vec::with_capacity(samples.len() * 4);
    for sample in samples {
        bytes.extend_from_slice(&sample.to_le_bytes());
    }
    sink.write(&bytes)?;
    clock.advance(samples.len());
    Ok(())
}

fn writer_loop(
    sink: psimple::Simple,
    clock: Arc<OutputClock>,
    rx: Receiver<Cmd>,
    ended_tx: UnboundedSender<VoiceId>,
) {
    let slice_samples = (u64::from(clock.rate) * SLICE_MS / 1000) as usize;
    let silence = vec![0.0f32; slice_samples];
    let mut queue: VecDeque<(VoiceId, Vec<f32>, f64)> = VecDeque::new();
    let mut cancelled: HashSet<VoiceId> = HashSet::new();
    let mut closing = false;

    'run: loop {
        if queue.is_empty() {
            // Idle: nothing left that a stale stop could refer to.
            cancelled.clear();
            match rx.recv() {
                Ok(cmd) => {
                    if apply(cmd, &mut queue, &mut cancelled) {
                        break 'run;
                    }
                }
                Err(_) => break 'run,
            }
        }
        loop {
            match rx.try_recv() {
                Ok(cmd) => {
                    if apply(cmd, &mut queue, &mut cancelled) {
                        break 'run;
                    }
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => break 'run,
            }
        }

        let Some((voice, pcm, at)) = queue.pop_front() else {
            continue;
        };
        if cancelled.remove(&voice) {
            continue;
        }

        // Fill the gap up to the scheduled start with silence.
        let mut lead = ((at - clock.seconds()).max(0.0) * f64::from(clock.rate)) as usize;
        let mut aborted = false;
        while lead > 0 && !aborted {
            let n = lead.min(slice_samples);
            if write_samples(&sink, &clock, &silence[..n]).is_err() {
                error!("audio sink write failed");
                break 'run;
            }
            lead -= n;
            aborted = poll_during_play(&rx, voice, &mut queue, &mut cancelled, &mut closing);
        }

        let mut pos = 0;
        while pos < pcm.len() && !aborted {
            let end = (pos + slice_samples).min(pcm.len());
            if write_samples(&sink, &clock, &pcm[pos..end]).is_err() {
                error!("audio sink write failed");
                break 'run;
            }
            pos = end;
            aborted = poll_during_play(&rx, voice, &mut queue, &mut cancelled, &mut closing);
        }

        if aborted {
            // Cut whatever is still buffered in the server.
            let _ = sink.flush();
        } else {
            let _ = ended_tx.send(voice);
        }

        if closing {
            break 'run;
        }
    }

    let _ = sink.flush();
    info!("audio output stopped");
}

/// Drain commands between slices. Returns true when the current voice has
/// been cancelled; a close request or a lost command channel also cancels
/// it and flags the loop for shutdown.
fn poll_during_play(
    rx: &Receiver<Cmd>,
    current: VoiceId,
    queue: &mut VecDeque<(VoiceId, Vec<f32>, f64)>,
    cancelled: &mut HashSet<VoiceId>,
    closing: &mut bool,
) -> bool {
    loop {
        match rx.try_recv() {
            Ok(Cmd::Close) => {
                *closing = true;
                queue.clear();
                cancelled.insert(current);
            }
            Ok(cmd) => {
                apply(cmd, queue, cancelled);
            }
            Err(TryRecvError::Empty) => break,
            Err(TryRecvError::Disconnected) => {
                *closing = true;
                queue.clear();
                cancelled.insert(current);
                break;
            }
        }
    }
    cancelled.remove(&current)
}
