//! Audio capture, encoding and playback using PipeWire
//!
//! This module provides:
//! - Microphone capture at 16kHz mono, cut into fixed-size frames
//! - PCM16 base64 encoding/decoding for the wire
//! - Gapless scheduling of inbound 24kHz audio on the output clock
//! - Optional WAV dumps of session audio via hound

pub mod capture;
pub mod pcm;
pub mod playback;
pub mod recorder;

pub use capture::{
    CaptureConfig, CapturePipeline, CapturedFrame, FrameSender, InputDevice, InputTrack,
    PipeWireInput,
};
pub use pcm::{decode_pcm16, encode_frame, EncodedAudioPacket};
pub use playback::{
    EndedSender, OutputSink, PipeWireOutput, PlaybackBuffer, PlaybackConfig, PlaybackScheduler,
    UnitId,
};
pub use recorder::{SessionRecording, WavRecorder};
