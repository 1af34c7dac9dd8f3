//! Microphone capture over PulseAudio.
//!
//! A dedicated thread reads fixed-size blocks of normalized f32 samples and
//! pushes them into a bounded channel. If the session driver falls behind,
//! blocks are dropped rather than queued; the live stream never backs up.

use super::CaptureError;
use crate::media_event::MediaEvent;
use libpulse_binding as pulse;
use libpulse_simple_binding as psimple;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
pub struct MicConfig {
    pub app_name: String,
    pub sample_rate: u32,
    pub block_samples: usize,
}

impl Default for MicConfig {
    fn default() -> Self {
        Self {
            app_name: "tutorlive".to_string(),
            sample_rate: 16_000,
            block_samples: 4_096,
        }
    }
}

/// Handle to a running microphone capture thread. Closing stops the thread
/// after its current read; the handle is safe to close repeatedly and on a
/// capture that never fully opened.
pub struct MicCapture {
    stop: Arc<AtomicBool>,
}

impl MicCapture {
    /// Acquire the default input device and start streaming blocks into
    /// `tx`. The stream lives on its own thread; this call waits for the
    /// device to open and fails without retaining anything if it cannot.
    pub fn open(cfg: MicConfig, tx: mpsc::Sender<MediaEvent>) -> Result<Self, CaptureError> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();

        std::thread::Builder::new()
            .name("mic-capture".to_string())
            .spawn(move || {
                let capture = match open_stream(&cfg) {
                    Ok(capture) => {
                        let _ = ready_tx.send(Ok(()));
                        capture
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                capture_loop(capture, cfg.block_samples, tx, flag);
            })
            .map_err(|e| CaptureError::DeviceUnavailable(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self { stop }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(CaptureError::DeviceUnavailable(
                "capture thread died during open".into(),
            )),
        }
    }

    /// Stop capturing. Idempotent.
    pub fn close(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

impl Drop for MicCapture {
    fn drop(&mut self) {
        self.close();
    }
}

fn open_stream(cfg: &MicConfig) -> Result<psimple::Simple, CaptureError> {
    let spec = pulse::sample::Spec {
        format: pulse::sample::Format::F32le,
        channels: 1,
        rate: cfg.sample_rate,
    };

    let capture = psimple::Simple::new(
        None, // default server
        &cfg.app_name,
        pulse::stream::Direction::Record,
        None, // default device
        "microphone",
        &spec,
        None, // default channel map
        None, // default buffering
    )
    .map_err(map_pa_err)?;

    info!(
        "microphone capture open: {} Hz, {}-sample blocks",
        cfg.sample_rate, cfg.block_samples
    );
    Ok(capture)
}

fn capture_loop(
    capture: psimple::Simple,
    block_samples: usize,
    tx: mpsc::Sender<MediaEvent>,
    stop: Arc<AtomicBool>,
) {
    let mut bytes = vec![0u8; block_samples * 4];
    let mut dropped: u64 = 0;

    while !stop.load(Ordering::SeqCst) {
        if let Err(e) = capture.read(&mut bytes) {
            if !stop.load(Ordering::SeqCst) {
                error!("microphone read failed: {}", e);
            }
            break;
        }

        let mut samples = Vec::with_capacity(block_samples);
        for chunk in bytes.chunks_exact(4) {
            samples.push(f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
        }

        match tx.try_send(MediaEvent::AudioBlock(samples)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                dropped += 1;
                if dropped % 50 == 1 {
                    warn!("session driver busy, {} mic blocks dropped so far", dropped);
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => break,
        }
    }

    info!("microphone capture stopped");
}

fn map_pa_err(e: pulse::error::PAErr) -> CaptureError {
    match pulse::error::Code::try_from(e) {
        Ok(pulse::error::Code::Access) => CaptureError::Permission,
        _ => CaptureError::DeviceUnavailable(e.to_string()),
    }
}
