//! PCM transcoding for the live audio path.
//!
//! The streaming endpoint speaks 16-bit little-endian PCM wrapped in a
//! base64 envelope. Captured microphone samples are normalized f32, so the
//! outbound direction quantizes to i16 before packing; the inbound direction
//! unpacks model speech back into normalized sample buffers for playback.

use base64::engine::general_purpose;
use base64::Engine;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("encoding error: {0}")]
    Encoding(String),

    #[error("decoding error: {0}")]
    Decoding(String),
}

pub type Result<T> = std::result::Result<T, CodecError>;

/// A decoded, playable block of audio. Channels are stored de-interleaved.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    pub channels: Vec<Vec<f32>>,
    pub sample_rate: u32,
}

impl AudioBuffer {
    /// Samples per channel.
    pub fn frames(&self) -> usize {
        self.channels.first().map(|c| c.len()).unwrap_or(0)
    }

    /// Play time in seconds: frames / sample_rate.
    pub fn duration(&self) -> f64 {
        self.frames() as f64 / f64::from(self.sample_rate)
    }
}

/// Quantize normalized samples to s16le and wrap them in the transport's
/// base64 envelope. Values outside [-1, 1] are clamped.
pub fn encode(samples: &[f32]) -> Result<String> {
    if samples.is_empty() {
        return Err(CodecError::Encoding("empty sample block".into()));
    }

    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        let v = (f64::from(sample) * 32768.0).clamp(-32768.0, 32767.0) as i16;
        bytes.extend_from_slice(&v.to_le_bytes());
    }

    Ok(general_purpose::STANDARD.encode(&bytes))
}

/// Strip the base64 envelope. Does not reconstruct samples.
pub fn decode(envelope: &str) -> Result<Vec<u8>> {
    general_purpose::STANDARD
        .decode(envelope)
        .map_err(|e| CodecError::Decoding(e.to_string()))
}

/// Rebuild a playable buffer from raw s16le bytes, de-interleaving if the
/// stream carries more than one channel.
pub fn decode_audio_data(raw: &[u8], sample_rate: u32, channels: u16) -> Result<AudioBuffer> {
    if sample_rate == 0 || channels == 0 {
        return Err(CodecError::Decoding(
            "sample rate and channel count must be non-zero".into(),
        ));
    }
    if raw.is_empty() {
        return Err(CodecError::Decoding("empty payload".into()));
    }
    if raw.len() % 2 != 0 {
        return Err(CodecError::Decoding(format!(
            "odd byte count {}, expected whole s16 samples",
            raw.len()
        )));
    }

    let total_samples = raw.len() / 2;
    let channels = usize::from(channels);
    if total_samples % channels != 0 {
        return Err(CodecError::Decoding(format!(
            "{} samples do not divide into {} channels",
            total_samples, channels
        )));
    }

    let frames = total_samples / channels;
    let mut out = vec![Vec::with_capacity(frames); channels];
    for (i, chunk) in raw.chunks_exact(2).enumerate() {
        let v = i16::from_le_bytes([chunk[0], chunk[1]]);
        out[i % channels].push(f32::from(v) / 32768.0);
    }

    Ok(AudioBuffer {
        channels: out,
        sample_rate,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn round_trip_within_quantization_error() {
        let mut rng = rand::rng();
        let samples: Vec<f32> = (0..4096).map(|_| rng.random_range(-1.0..=1.0)).collect();

        let envelope = encode(&samples).unwrap();
        let raw = decode(&envelope).unwrap();
        let buffer = decode_audio_data(&raw, 16_000, 1).unwrap();

        assert_eq!(buffer.frames(), samples.len());
        for (original, restored) in samples.iter().zip(&buffer.channels[0]) {
            assert!(
                (original - restored).abs() <= 1.0 / 32768.0,
                "sample drifted: {} vs {}",
                original,
                restored
            );
        }
    }

    #[test]
    fn encode_clamps_out_of_range() {
        let envelope = encode(&[2.0, -2.0]).unwrap();
        let raw = decode(&envelope).unwrap();
        assert_eq!(i16::from_le_bytes([raw[0], raw[1]]), i16::MAX);
        assert_eq!(i16::from_le_bytes([raw[2], raw[3]]), i16::MIN);
    }

    #[test]
    fn encode_rejects_empty_input() {
        assert!(matches!(encode(&[]), Err(CodecError::Encoding(_))));
    }

    #[test]
    fn decode_rejects_malformed_envelope() {
        assert!(matches!(decode("not@base64!"), Err(CodecError::Decoding(_))));
    }

    #[test]
    fn buffer_duration_matches_sample_count() {
        let raw: Vec<u8> = vec![0; 24_000 * 2]; // one second of silence
        let buffer = decode_audio_data(&raw, 24_000, 1).unwrap();
        assert!((buffer.duration() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn stereo_payload_deinterleaves() {
        // Frames: (L=1, R=-1), (L=2, R=-2)
        let mut raw = Vec::new();
        for v in [1i16, -1, 2, -2] {
            raw.extend_from_slice(&v.to_le_bytes());
        }

        let buffer = decode_audio_data(&raw, 24_000, 2).unwrap();
        assert_eq!(buffer.frames(), 2);
        assert_eq!(buffer.channels.len(), 2);
        assert!(buffer.channels[0][0] > 0.0 && buffer.channels[0][1] > 0.0);
        assert!(buffer.channels[1][0] < 0.0 && buffer.channels[1][1] < 0.0);
    }

    #[test]
    fn decode_audio_data_rejects_bad_shapes() {
        assert!(decode_audio_data(&[], 24_000, 1).is_err());
        assert!(decode_audio_data(&[0], 24_000, 1).is_err());
        assert!(decode_audio_data(&[0, 0], 0, 1).is_err());
        assert!(decode_audio_data(&[0, 0], 24_000, 0).is_err());
        // Three samples cannot form whole stereo frames.
        assert!(decode_audio_data(&[0, 0, 0, 0, 0, 0], 24_000, 2).is_err());
    }
}
