//! Session recorder for diagnosis - taps both audio directions to WAV.

use crate::codec::AudioBuffer;
use hound::{SampleFormat, WavSpec, WavWriter};
use std::fs;
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use tracing::{error, info};

type Writer = WavWriter<BufWriter<File>>;

/// Writes outbound microphone blocks and inbound model speech under the
/// given directory. Any write failure logs once and disables the tap; the
/// session itself is never disturbed.
pub struct DebugRecorder {
    mic: Option<Writer>,
    model: Option<Writer>,
}

impl DebugRecorder {
    /// Returns `None` (with a log line) when the directory or files cannot
    /// be created.
    pub fn create(dir: &Path, mic_rate: u32, model_rate: u32) -> Option<Self> {
        if let Err(e) = fs::create_dir_all(dir) {
            error!("cannot create recording directory {:?}: {}", dir, e);
            return None;
        }

        let spec = |rate| WavSpec {
            channels: 1,
            sample_rate: rate,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };

        let mic = WavWriter::create(dir.join("mic.wav"), spec(mic_rate));
        let model = WavWriter::create(dir.join("model.wav"), spec(model_rate));
        match (mic, model) {
            (Ok(mic), Ok(model)) => {
                info!("session recording under {:?}", dir);
                Some(Self {
                    mic: Some(mic),
                    model: Some(model),
                })
            }
            (mic, model) => {
                if let Err(e) = mic.and(model) {
                    error!("cannot create recording files: {}", e);
                }
                None
            }
        }
    }

    pub fn tap_mic(&mut self, samples: &[f32]) {
        if let Some(writer) = self.mic.as_mut() {
            for &sample in samples {
                let v = (f64::from(sample) * 32768.0).clamp(-32768.0, 32767.0) as i16;
                if let Err(e) = writer.write_sample(v) {
                    error!("mic tap failed, disabling: {}", e);
                    self.mic = None;
                    return;
                }
            }
        }
    }

    pub fn tap_model(&mut self, buffer: &AudioBuffer) {
        let Some(channel) = buffer.channels.first() else {
            return;
        };
        if let Some(writer) = self.model.as_mut() {
            for &sample in channel {
                let v = (f64::from(sample) * 32768.0).clamp(-32768.0, 32767.0) as i16;
                if let Err(e) = writer.write_sample(v) {
                    error!("model tap failed, disabling: {}", e);
                    self.model = None;
                    return;
                }
            }
        }
    }

    /// Flush and close both files.
    pub fn finish(&mut self) {
        if let Some(writer) = self.mic.take() {
            if let Err(e) = writer.finalize() {
                error!("failed to finalize mic recording: {}", e);
            }
        }
        if let Some(writer) = self.model.take() {
            if let Err(e) = writer.finalize() {
                error!("failed to finalize model recording: {}", e);
            }
        }
    }
}
