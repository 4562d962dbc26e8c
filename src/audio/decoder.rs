//! Streaming decoder: PCM passthrough, Opus (FFI to libopus), FLAC (via
//! `symphonia`). Mirrors the uniform configure/decode/flush/release contract
//! `bass-webrtc/src/codec/opus.rs` and `bass-srt/src/codec/flac.rs` already
//! expose, collapsed behind one enum instead of one struct per crate since
//! this receiver only ever decodes.

use thiserror::Error;

use crate::audio::Frame;

#[derive(Debug, Error)]
pub enum DecoderError {
    #[error("failed to initialize {codec} decoder: {reason}")]
    InitFailed { codec: &'static str, reason: String },
    #[error("failed to decode chunk: {0}")]
    DecodeFailed(String),
    #[error("both the primary codec and the PCM fallback failed to configure")]
    Fatal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderKind {
    Pcm,
    Opus,
    Flac,
}

pub struct CodecHeader {
    pub sample_rate_hz: u32,
    pub channels: u8,
    pub bit_depth: u8,
    pub kind: DecoderKind,
    pub extra: Option<Vec<u8>>,
}

enum Backend {
    Pcm(pcm::PcmDecoder),
    Opus(opus::OpusDecoder),
    Flac(flac::FlacDecoder),
}

/// Owns exactly one configured codec backend; stream start falls back to
/// PCM if the server-named codec fails to initialize, per the documented
/// prior bug where raw compressed bytes were once passed through as PCM
/// and produced loud noise.
pub struct Decoder {
    backend: Backend,
    active_kind: DecoderKind,
}

impl Decoder {
    /// Attempts to configure the codec named by `header`; on failure, falls
    /// back to PCM passthrough. Returns `Err(DecoderError::Fatal)` only if
    /// the fallback also fails, which should not happen for PCM.
    pub fn configure(header: &CodecHeader) -> Result<Decoder, DecoderError> {
        let primary = match header.kind {
            DecoderKind::Pcm => pcm::PcmDecoder::new(header).map(Backend::Pcm),
            DecoderKind::Opus => opus::OpusDecoder::new(header).map(Backend::Opus),
            DecoderKind::Flac => flac::FlacDecoder::new(header).map(Backend::Flac),
        };

        match primary {
            Ok(backend) => Ok(Decoder {
                backend,
                active_kind: header.kind,
            }),
            Err(primary_err) => {
                if header.kind == DecoderKind::Pcm {
                    return Err(primary_err);
                }
                log::warn!(
                    target: "sendspin::decoder",
                    "primary decoder {:?} failed to configure ({}), falling back to PCM",
                    header.kind,
                    primary_err
                );
                let pcm_header = CodecHeader {
                    sample_rate_hz: header.sample_rate_hz,
                    channels: header.channels,
                    bit_depth: header.bit_depth,
                    kind: DecoderKind::Pcm,
                    extra: None,
                };
                match pcm::PcmDecoder::new(&pcm_header) {
                    Ok(backend) => Ok(Decoder {
                        backend: Backend::Pcm(backend),
                        active_kind: DecoderKind::Pcm,
                    }),
                    Err(_) => Err(DecoderError::Fatal),
                }
            }
        }
    }

    pub fn active_kind(&self) -> DecoderKind {
        self.active_kind
    }

    pub fn decode(&mut self, compressed: &[u8]) -> Result<Vec<Frame>, DecoderError> {
        match &mut self.backend {
            Backend::Pcm(d) => d.decode(compressed),
            Backend::Opus(d) => d.decode(compressed),
            Backend::Flac(d) => d.decode(compressed),
        }
    }

    pub fn flush(&mut self) -> Result<Vec<Frame>, DecoderError> {
        match &mut self.backend {
            Backend::Pcm(d) => d.flush(),
            Backend::Opus(d) => d.flush(),
            Backend::Flac(d) => d.flush(),
        }
    }

    pub fn release(&mut self) {
        match &mut self.backend {
            Backend::Pcm(d) => d.release(),
            Backend::Opus(d) => d.release(),
            Backend::Flac(d) => d.release(),
        }
    }
}

mod pcm {
    use super::*;

    pub struct PcmDecoder {
        channels: u8,
        bit_depth: u8,
    }

    impl PcmDecoder {
        pub fn new(header: &CodecHeader) -> Result<Self, DecoderError> {
            if header.channels != 2 {
                return Err(DecoderError::InitFailed {
                    codec: "pcm",
                    reason: format!("unsupported channel count {}", header.channels),
                });
            }
            Ok(PcmDecoder {
                channels: header.channels,
                bit_depth: header.bit_depth,
            })
        }

        pub fn decode(&mut self, compressed: &[u8]) -> Result<Vec<Frame>, DecoderError> {
            match self.bit_depth {
                16 => {
                    let bytes_per_frame = 2 * self.channels as usize;
                    let frame_count = compressed.len() / bytes_per_frame;
                    let mut out = Vec::with_capacity(frame_count);
                    for i in 0..frame_count {
                        let base = i * bytes_per_frame;
                        let l = i16::from_le_bytes([compressed[base], compressed[base + 1]]);
                        let r = i16::from_le_bytes([compressed[base + 2], compressed[base + 3]]);
                        out.push([l, r]);
                    }
                    Ok(out)
                }
                other => Err(DecoderError::DecodeFailed(format!(
                    "unsupported PCM bit depth {other}"
                ))),
            }
        }

        pub fn flush(&mut self) -> Result<Vec<Frame>, DecoderError> {
            Ok(Vec::new())
        }

        pub fn release(&mut self) {}
    }
}

mod opus {
    use super::*;
    use std::os::raw::{c_int, c_void};

    #[allow(non_camel_case_types)]
    enum OpusDecoderHandle {}

    #[link(name = "opus")]
    extern "C" {
        fn opus_decoder_create(
            fs: i32,
            channels: c_int,
            error: *mut c_int,
        ) -> *mut OpusDecoderHandle;
        fn opus_decode(
            st: *mut OpusDecoderHandle,
            data: *const u8,
            len: i32,
            pcm: *mut i16,
            frame_size: c_int,
            decode_fec: c_int,
        ) -> c_int;
        fn opus_decoder_destroy(st: *mut OpusDecoderHandle);
    }

    const OPUS_MAX_FRAME_SAMPLES: usize = 5760; // 120ms @ 48kHz, the libopus ceiling.

    pub struct OpusDecoder {
        handle: *mut OpusDecoderHandle,
        channels: u8,
        scratch: Vec<i16>,
    }

    // The handle is only ever touched through `&mut self`, matching the
    // FFI ownership pattern in `bass-webrtc/src/codec/opus.rs`.
    unsafe impl Send for OpusDecoder {}

    impl OpusDecoder {
        pub fn new(header: &CodecHeader) -> Result<Self, DecoderError> {
            let mut error: c_int = 0;
            let handle = unsafe {
                opus_decoder_create(header.sample_rate_hz as i32, header.channels as c_int, &mut error)
            };
            if handle.is_null() || error != 0 {
                return Err(DecoderError::InitFailed {
                    codec: "opus",
                    reason: format!("opus_decoder_create failed with error {error}"),
                });
            }
            Ok(OpusDecoder {
                handle,
                channels: header.channels,
                scratch: vec![0i16; OPUS_MAX_FRAME_SAMPLES * header.channels as usize],
            })
        }

        pub fn decode(&mut self, compressed: &[u8]) -> Result<Vec<Frame>, DecoderError> {
            let samples = unsafe {
                opus_decode(
                    self.handle,
                    compressed.as_ptr(),
                    compressed.len() as i32,
                    self.scratch.as_mut_ptr(),
                    (self.scratch.len() / self.channels as usize) as c_int,
                    0,
                )
            };
            if samples < 0 {
                return Err(DecoderError::DecodeFailed(format!(
                    "opus_decode returned error {samples}"
                )));
            }
            let samples = samples as usize;
            let mut out = Vec::with_capacity(samples);
            for i in 0..samples {
                let base = i * self.channels as usize;
                let l = self.scratch[base];
                let r = if self.channels > 1 {
                    self.scratch[base + 1]
                } else {
                    l
                };
                out.push([l, r]);
            }
            Ok(out)
        }

        /// Packet-loss concealment: decodes a missing packet by passing a
        /// null payload, per libopus's `opus_decode` PLC convention.
        pub fn decode_lost_packet(&mut self, frame_size: usize) -> Result<Vec<Frame>, DecoderError> {
            let samples = unsafe {
                opus_decode(
                    self.handle,
                    std::ptr::null(),
                    0,
                    self.scratch.as_mut_ptr(),
                    frame_size as c_int,
                    0,
                )
            };
            if samples < 0 {
                return Err(DecoderError::DecodeFailed(
                    "opus PLC decode failed".to_string(),
                ));
            }
            let samples = samples as usize;
            Ok((0..samples)
                .map(|i| {
                    let base = i * self.channels as usize;
                    [self.scratch[base], self.scratch[base.min(self.scratch.len() - 2) + 1]]
                })
                .collect())
        }

        pub fn flush(&mut self) -> Result<Vec<Frame>, DecoderError> {
            Ok(Vec::new())
        }

        pub fn release(&mut self) {
            if !self.handle.is_null() {
                unsafe { opus_decoder_destroy(self.handle) };
                self.handle = std::ptr::null_mut();
            }
        }
    }

    impl Drop for OpusDecoder {
        fn drop(&mut self) {
            self.release();
        }
    }

    #[allow(dead_code)]
    fn silence_unused_import(_: *const c_void) {}
}

mod flac {
    use super::*;
    use std::io::Cursor;

    use symphonia::core::audio::{AudioBufferRef, Signal};
    use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_FLAC};
    use symphonia::core::formats::FormatOptions;
    use symphonia::core::io::MediaSourceStream;
    use symphonia::core::meta::MetadataOptions;
    use symphonia::core::probe::Hint;

    /// Streaming FLAC decode via `symphonia`, mirroring
    /// `bass-srt/src/codec/flac.rs`'s decode path: buffer incoming bytes,
    /// probe once enough is available, then decode packets as they appear.
    pub struct FlacDecoder {
        channels: u8,
        pending: Vec<u8>,
    }

    impl FlacDecoder {
        pub fn new(header: &CodecHeader) -> Result<Self, DecoderError> {
            if header.channels != 1 && header.channels != 2 {
                return Err(DecoderError::InitFailed {
                    codec: "flac",
                    reason: format!("unsupported channel count {}", header.channels),
                });
            }
            Ok(FlacDecoder {
                channels: header.channels,
                pending: Vec::new(),
            })
        }

        pub fn decode(&mut self, compressed: &[u8]) -> Result<Vec<Frame>, DecoderError> {
            self.pending.extend_from_slice(compressed);

            let cursor = Cursor::new(self.pending.clone());
            let mss = MediaSourceStream::new(Box::new(cursor), Default::default());

            let mut hint = Hint::new();
            hint.with_extension("flac");

            let probed = symphonia::default::get_probe()
                .format(
                    &hint,
                    mss,
                    &FormatOptions::default(),
                    &MetadataOptions::default(),
                )
                .map_err(|e| DecoderError::DecodeFailed(format!("flac probe failed: {e}")))?;

            let mut format = probed.format;
            let track = format
                .tracks()
                .iter()
                .find(|t| t.codec_params.codec == CODEC_TYPE_FLAC)
                .ok_or_else(|| DecoderError::DecodeFailed("no FLAC track found".to_string()))?;
            let track_id = track.id;

            let mut decoder = symphonia::default::get_codecs()
                .make(&track.codec_params, &DecoderOptions::default())
                .map_err(|e| DecoderError::DecodeFailed(format!("flac decoder init: {e}")))?;

            let mut out = Vec::new();
            loop {
                let packet = match format.next_packet() {
                    Ok(p) => p,
                    Err(_) => break,
                };
                if packet.track_id() != track_id {
                    continue;
                }
                match decoder.decode(&packet) {
                    Ok(decoded) => out.extend(copy_audio_to_frames(decoded, self.channels)),
                    Err(_) => continue,
                }
            }

            self.pending.clear();
            Ok(out)
        }

        pub fn flush(&mut self) -> Result<Vec<Frame>, DecoderError> {
            self.pending.clear();
            Ok(Vec::new())
        }

        pub fn release(&mut self) {
            self.pending.clear();
        }
    }

    fn copy_audio_to_frames(buf: AudioBufferRef<'_>, channels: u8) -> Vec<Frame> {
        match buf {
            AudioBufferRef::S16(b) => {
                let left = b.chan(0);
                let right = if channels > 1 { b.chan(1) } else { b.chan(0) };
                left.iter().zip(right.iter()).map(|(&l, &r)| [l, r]).collect()
            }
            AudioBufferRef::S32(b) => {
                let left = b.chan(0);
                let right = if channels > 1 { b.chan(1) } else { b.chan(0) };
                left.iter()
                    .zip(right.iter())
                    .map(|(&l, &r)| [(l >> 16) as i16, (r >> 16) as i16])
                    .collect()
            }
            AudioBufferRef::F32(b) => {
                let left = b.chan(0);
                let right = if channels > 1 { b.chan(1) } else { b.chan(0) };
                left.iter()
                    .zip(right.iter())
                    .map(|(&l, &r)| [f32_to_i16(l), f32_to_i16(r)])
                    .collect()
            }
            _ => Vec::new(),
        }
    }

    fn f32_to_i16(sample: f32) -> i16 {
        (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pcm_roundtrips_interleaved_samples() {
        let header = CodecHeader {
            sample_rate_hz: 48_000,
            channels: 2,
            bit_depth: 16,
            kind: DecoderKind::Pcm,
            extra: None,
        };
        let mut decoder = Decoder::configure(&header).unwrap();
        let samples: [i16; 4] = [100, -100, 200, -200];
        let mut bytes = Vec::new();
        for s in samples {
            bytes.extend_from_slice(&s.to_le_bytes());
        }
        let frames = decoder.decode(&bytes).unwrap();
        assert_eq!(frames, vec![[100, -100], [200, -200]]);
    }

    #[test]
    fn pcm_rejects_bad_channel_count_and_is_the_fallback_target() {
        let header = CodecHeader {
            sample_rate_hz: 48_000,
            channels: 3,
            bit_depth: 16,
            kind: DecoderKind::Pcm,
            extra: None,
        };
        let result = Decoder::configure(&header);
        assert!(result.is_err());
    }
}
