//! Decoded-audio plumbing: the SPSC ring between decode and DAC pacing, and
//! the streaming codec variants feeding it.

pub mod decoder;
pub mod ring;

pub use decoder::{CodecHeader, Decoder, DecoderError, DecoderKind};
pub use ring::AudioRing;

/// Interleaved stereo 16-bit PCM, the only format that crosses the ring.
pub type Frame = [i16; 2];
