//! PCM16 wire encoding
//!
//! Converts captured f32 frames into base64 little-endian PCM16 packets and
//! decodes inbound payloads back into normalized f32 samples.

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;

use super::capture::CapturedFrame;
use crate::errors::SessionError;

/// Sample rate of outbound microphone audio
pub const INPUT_SAMPLE_RATE: u32 = 16000;

/// Sample rate of inbound model audio
pub const OUTPUT_SAMPLE_RATE: u32 = 24000;

/// MIME descriptor attached to every outbound packet
pub const INPUT_MIME_TYPE: &str = "audio/pcm;rate=16000";

const PCM16_SCALE: f32 = 32768.0;

/// One encoded capture frame, ready for the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedAudioPacket {
    /// Base64 of the little-endian PCM16 bytes
    pub data: String,
    pub mime_type: &'static str,
}

/// Quantize a normalized sample to PCM16.
///
/// Computes `round(s * 32768)` and clamps to the i16 range, so `+1.0` maps
/// to `32767` and `-1.0` to `-32768`. Out-of-range input saturates; NaN
/// maps to silence.
pub fn quantize(sample: f32) -> i16 {
    if sample.is_nan() {
        return 0;
    }
    (sample * PCM16_SCALE)
        .round()
        .clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

/// Encode a captured frame into a wire packet
pub fn encode_frame(frame: &CapturedFrame) -> EncodedAudioPacket {
    encode_samples(&frame.samples)
}

/// Encode raw samples into a wire packet
pub fn encode_samples(samples: &[f32]) -> EncodedAudioPacket {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        bytes.extend_from_slice(&quantize(sample).to_le_bytes());
    }

    EncodedAudioPacket {
        data: B64.encode(&bytes),
        mime_type: INPUT_MIME_TYPE,
    }
}

/// Decode a base64 PCM16 payload into samples in [-1.0, 1.0)
pub fn decode_pcm16(payload: &str) -> Result<Vec<f32>, SessionError> {
    let bytes = B64
        .decode(payload)
        .map_err(|e| SessionError::DecodeFailure(format!("invalid base64: {}", e)))?;

    if bytes.len() % 2 != 0 {
        return Err(SessionError::DecodeFailure(format!(
            "odd PCM16 byte count: {}",
            bytes.len()
        )));
    }

    Ok(bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / PCM16_SCALE)
        .collect())
}

/// Parse the `rate=` parameter out of a MIME descriptor such as
/// `audio/pcm;rate=24000`
pub fn mime_sample_rate(mime_type: &str) -> Option<u32> {
    mime_type
        .split(';')
        .skip(1)
        .filter_map(|param| param.trim().strip_prefix("rate="))
        .find_map(|rate| rate.trim().parse().ok())
}
