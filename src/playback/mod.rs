//! The hardest subsystem: decodes incoming chunks, schedules them through
//! the [`AudioRing`], and steers a dedicated audio-sink loop against the
//! [`TimeFilter`]-anchored server clock without ever feeding filter noise
//! back into the correction loop — that decoupling is what keeps the
//! correction logic from chasing its own measurement jitter.
//!
//! The sink loop's non-blocking, single-dedicated-thread shape is grounded
//! on the DAC-pacing loop in `bass-rtp/src/output_new/stream.rs`; unlike
//! that file's continuous PI-controller resampling, this engine performs
//! discrete 1-in-N insert/drop corrections instead of continuous resampling.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use thiserror::Error;

use crate::audio::{AudioRing, CodecHeader, Decoder, DecoderError, Frame};
use crate::config::ReceiverConfig;
use crate::time_filter::TimeFilter;

#[derive(Debug, Error)]
pub enum PlaybackError {
    #[error("decoder failed to configure: {0}")]
    DecoderInit(#[from] DecoderError),
    #[error("audio sink failed: {0}")]
    SinkFailed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Initializing,
    WaitingForStart,
    Playing,
    Draining,
    Reanchoring,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CorrectionMode {
    None,
    Insert { every_n: u64 },
    Drop { every_n: u64 },
}

#[derive(Debug, Default)]
pub struct PlaybackStats {
    pub overlaps_trimmed: AtomicU64,
    pub gaps_filled: AtomicU64,
    pub frames_inserted: AtomicU64,
    pub frames_dropped: AtomicU64,
    pub sync_corrections: AtomicU64,
    pub reanchor_count: AtomicU64,
    pub buffer_underrun_count: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PlaybackStatsSnapshot {
    pub overlaps_trimmed: u64,
    pub gaps_filled: u64,
    pub frames_inserted: u64,
    pub frames_dropped: u64,
    pub sync_corrections: u64,
    pub reanchor_count: u64,
    pub buffer_underrun_count: u64,
}

impl PlaybackStats {
    fn snapshot(&self) -> PlaybackStatsSnapshot {
        PlaybackStatsSnapshot {
            overlaps_trimmed: self.overlaps_trimmed.load(Ordering::Relaxed),
            gaps_filled: self.gaps_filled.load(Ordering::Relaxed),
            frames_inserted: self.frames_inserted.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            sync_corrections: self.sync_corrections.load(Ordering::Relaxed),
            reanchor_count: self.reanchor_count.load(Ordering::Relaxed),
            buffer_underrun_count: self.buffer_underrun_count.load(Ordering::Relaxed),
        }
    }
}

/// Abstraction over the platform audio sink. `frames_written` is the sink's
/// own monotonic DAC frame counter; `write` never blocks longer than the
/// hardware buffer and returns the number of frames actually accepted.
pub trait AudioSink: Send + Sync {
    fn sample_rate_hz(&self) -> u32;
    fn frames_written(&self) -> u64;
    fn headroom_frames(&self) -> usize;
    fn write(&self, frames: &[Frame]) -> Result<usize, PlaybackError>;
}

struct LastChunkEnd {
    server_us: i64,
}

struct EngineState {
    state: PlaybackState,
    calibrated: bool,
    anchor_server_us: i64,
    anchor_dac_frame: u64,
    smoothed_sync_error_us: f64,
    grace_until: Option<Instant>,
    correction_mode: CorrectionMode,
    correction_counter: u64,
    last_chunk_end: Option<LastChunkEnd>,
    decoder: Option<Decoder>,
}

const EMA_ALPHA: f64 = 0.1;

/// Pacing quantum for the dedicated sink thread: 10 ms is 480 frames at
/// 48 kHz, small enough that `headroom_frames()` rarely starves between
/// ticks without spinning the CPU for a sink that buffers more deeply.
const PUMP_INTERVAL: Duration = Duration::from_millis(10);

pub struct PlaybackEngine {
    config: ReceiverConfig,
    filter: Arc<Mutex<TimeFilter>>,
    ring: Arc<AudioRing>,
    sink: Arc<dyn AudioSink>,
    stats: Arc<PlaybackStats>,
    inner: Mutex<EngineState>,
    running: AtomicBool,
    sink_thread: Mutex<Option<JoinHandle<()>>>,
}

impl PlaybackEngine {
    pub fn new(
        config: ReceiverConfig,
        filter: Arc<Mutex<TimeFilter>>,
        sink: Arc<dyn AudioSink>,
    ) -> Self {
        let ring = Arc::new(AudioRing::new(config.ring_high_water_frames, sink.sample_rate_hz()));
        PlaybackEngine {
            config,
            filter,
            ring,
            sink,
            stats: Arc::new(PlaybackStats::default()),
            inner: Mutex::new(EngineState {
                state: PlaybackState::Initializing,
                calibrated: false,
                anchor_server_us: 0,
                anchor_dac_frame: 0,
                smoothed_sync_error_us: 0.0,
                grace_until: None,
                correction_mode: CorrectionMode::None,
                correction_counter: 0,
                last_chunk_end: None,
                decoder: None,
            }),
            running: AtomicBool::new(false),
            sink_thread: Mutex::new(None),
        }
    }

    /// Spawns the dedicated, thread-priority-bumped audio sink thread that
    /// drives [`pump`](Self::pump) on a hybrid sleep-spin schedule, the same
    /// shape `transmitter_loop` in `bass-rtp/src/output_new/stream.rs` uses
    /// for its own DAC-paced thread. No-op if already running.
    pub fn start_sink_thread(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let engine = self.clone();
        let handle = thread::Builder::new()
            .name("sendspin-audio-sink".into())
            .spawn(move || {
                bump_thread_priority();
                let mut next_tick = Instant::now();
                while engine.running.load(Ordering::SeqCst) {
                    engine.pump();
                    next_tick += PUMP_INTERVAL;
                    let now = Instant::now();
                    if next_tick > now {
                        let wait = next_tick - now;
                        if wait > Duration::from_millis(2) {
                            thread::sleep(wait - Duration::from_millis(1));
                        }
                        while Instant::now() < next_tick {
                            std::hint::spin_loop();
                        }
                    } else {
                        next_tick = now;
                    }
                }
            })
            .expect("failed to spawn audio sink thread");
        *self.sink_thread.lock() = Some(handle);
    }

    /// Stops the sink thread and joins it. Safe to call even if it was never
    /// started.
    pub fn stop_sink_thread(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.sink_thread.lock().take() {
            let _ = handle.join();
        }
    }

    pub fn stats(&self) -> PlaybackStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn state(&self) -> PlaybackState {
        self.inner.lock().state
    }

    /// Configures the decoder and resets ring/correction/anchor state for a
    /// fresh stream. On total decoder failure the stream does not start.
    pub fn start_stream(&self, header: &CodecHeader) -> Result<(), PlaybackError> {
        let decoder = Decoder::configure(header)?;
        self.ring.clear();
        let mut inner = self.inner.lock();
        inner.decoder = Some(decoder);
        inner.calibrated = false;
        inner.correction_mode = CorrectionMode::None;
        inner.correction_counter = 0;
        inner.smoothed_sync_error_us = 0.0;
        inner.grace_until = None;
        inner.last_chunk_end = None;
        inner.state = PlaybackState::WaitingForStart;
        Ok(())
    }

    /// Feeds one `(server_us, compressed_bytes)` chunk: decode, overlap-trim
    /// or gap-fill, then enqueue into the ring.
    pub fn on_audio_chunk(&self, server_us: i64, bytes: &[u8]) {
        let pcm = {
            let mut inner = self.inner.lock();
            let Some(decoder) = inner.decoder.as_mut() else {
                return;
            };
            match decoder.decode(bytes) {
                Ok(pcm) => pcm,
                Err(err) => {
                    log::warn!(target: "sendspin::playback", "dropping chunk, decode failed: {}", err);
                    return;
                }
            }
        };

        let dac_cursor_us = self.current_dac_server_us();

        let mut frames = pcm;
        let mut presentation_us = server_us;

        {
            let mut inner = self.inner.lock();
            if let Some(last_end) = inner.last_chunk_end.as_ref() {
                if server_us > last_end.server_us {
                    let gap_us = server_us - last_end.server_us;
                    let ceiling_us = self.config.gap_fill_ceiling_ms as i64 * 1_000;
                    if gap_us < ceiling_us {
                        let sample_rate = self.sink.sample_rate_hz() as i64;
                        let silence_frames = (gap_us * sample_rate / 1_000_000).max(0) as usize;
                        if silence_frames > 0 {
                            let mut filled = vec![[0i16, 0i16]; silence_frames];
                            filled.extend(frames);
                            frames = filled;
                            presentation_us = last_end.server_us;
                            self.stats.gaps_filled.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
            }
            let duration_us = (frames.len() as i64 * 1_000_000) / self.sink.sample_rate_hz() as i64;
            inner.last_chunk_end = Some(LastChunkEnd {
                server_us: presentation_us + duration_us,
            });
        }

        let before = self.ring.overlaps_trimmed();
        self.ring.push_chunk(presentation_us, &frames, dac_cursor_us);
        let trimmed = self.ring.overlaps_trimmed() - before;
        if trimmed > 0 {
            self.stats.overlaps_trimmed.fetch_add(trimmed, Ordering::Relaxed);
        }
    }

    /// Splits a raw binary audio-chunk frame and feeds it
    /// through [`on_audio_chunk`](Self::on_audio_chunk). Malformed frames are
    /// dropped and logged, the same treatment as a decode failure.
    pub fn on_audio_chunk_frame(&self, bytes: &[u8]) {
        match crate::wire::decode_audio_chunk_frame(bytes) {
            Some((server_us, payload)) => self.on_audio_chunk(server_us, payload),
            None => log::warn!(target: "sendspin::playback", "dropping undersized audio chunk frame"),
        }
    }

    fn current_dac_server_us(&self) -> i64 {
        let inner = self.inner.lock();
        if !inner.calibrated {
            return i64::MIN;
        }
        let f = self.sink.frames_written();
        expected_server_us(
            inner.anchor_server_us,
            inner.anchor_dac_frame,
            f,
            self.sink.sample_rate_hz(),
        )
    }

    /// Runs the non-blocking sink pacing step once; intended to be called in
    /// a tight loop from the dedicated audio thread. Never awaits.
    pub fn pump(&self) {
        let sample_rate = self.sink.sample_rate_hz();
        let f = self.sink.frames_written();

        let mut inner = self.inner.lock();
        if inner.state == PlaybackState::Stopped {
            return;
        }

        if !inner.calibrated {
            let Some(front_us) = self.ring.front_server_us() else {
                self.emit_silence();
                self.stats.buffer_underrun_count.fetch_add(1, Ordering::Relaxed);
                return;
            };
            inner.anchor_server_us = front_us;
            inner.anchor_dac_frame = f;
            inner.calibrated = true;
            inner.state = PlaybackState::Playing;
            inner.grace_until = Some(Instant::now() + Duration::from_millis(self.config.grace_period_ms));
        }

        let expected_server_us = expected_server_us(inner.anchor_server_us, inner.anchor_dac_frame, f, sample_rate);

        let target_server_us = match self.ring.front_server_us() {
            Some(v) => v,
            None => {
                self.emit_silence();
                self.stats.buffer_underrun_count.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        let raw_error = (expected_server_us - target_server_us) as f64;
        inner.smoothed_sync_error_us =
            inner.smoothed_sync_error_us * (1.0 - EMA_ALPHA) + raw_error * EMA_ALPHA;
        let smoothed = inner.smoothed_sync_error_us;

        let in_grace = inner.grace_until.map(|t| Instant::now() < t).unwrap_or(false);

        if !in_grace && smoothed.abs() > self.config.reanchor_threshold_us as f64 {
            self.ring.discard_until(expected_server_us);
            let new_target_server_us = self.ring.front_server_us().unwrap_or(expected_server_us);
            inner.anchor_dac_frame = f;
            inner.anchor_server_us = new_target_server_us;
            inner.grace_until = Some(Instant::now() + Duration::from_millis(self.config.grace_period_ms));
            inner.smoothed_sync_error_us = 0.0;
            inner.correction_mode = CorrectionMode::None;
            inner.state = PlaybackState::Reanchoring;
            self.stats.reanchor_count.fetch_add(1, Ordering::Relaxed);
        } else if !in_grace && smoothed.abs() > self.config.correction_threshold_us as f64 {
            let denom = (smoothed.abs() * self.config.correction_gain / 1_000_000.0).max(1e-9);
            let every_n = ((sample_rate as f64) / denom).round().max(1.0) as u64;
            inner.correction_mode = if smoothed > 0.0 {
                CorrectionMode::Drop { every_n }
            } else {
                CorrectionMode::Insert { every_n }
            };
            if inner.state == PlaybackState::Reanchoring {
                inner.state = PlaybackState::Playing;
            }
        } else {
            inner.correction_mode = CorrectionMode::None;
            if inner.state == PlaybackState::Reanchoring {
                inner.state = PlaybackState::Playing;
            }
        }

        let headroom = self.sink.headroom_frames();
        self.drain_into_sink(&mut inner, headroom);
    }

    fn drain_into_sink(&self, inner: &mut EngineState, mut headroom: usize) {
        while headroom > 0 {
            let available = self.ring.frames_queued();
            if available == 0 {
                self.stats.buffer_underrun_count.fetch_add(1, Ordering::Relaxed);
                self.emit_silence();
                return;
            }
            let batch = self.ring.pop_frames(1.min(available));
            let Some(frame) = batch.first().copied() else { return };

            inner.correction_counter += 1;
            match inner.correction_mode {
                CorrectionMode::Drop { every_n } if inner.correction_counter % every_n == 0 => {
                    self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                    self.stats.sync_corrections.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                CorrectionMode::Insert { every_n } if inner.correction_counter % every_n == 0 => {
                    let _ = self.sink.write(&[frame, frame]);
                    headroom = headroom.saturating_sub(2.min(headroom));
                    self.stats.frames_inserted.fetch_add(1, Ordering::Relaxed);
                    self.stats.sync_corrections.fetch_add(1, Ordering::Relaxed);
                }
                _ => {
                    let _ = self.sink.write(&[frame]);
                    headroom = headroom.saturating_sub(1);
                }
            }
        }
    }

    fn emit_silence(&self) {
        let _ = self.sink.write(&[[0i16, 0i16]]);
    }
}

fn expected_server_us(anchor_server_us: i64, anchor_dac_frame: u64, f: u64, sample_rate: u32) -> i64 {
    let elapsed_frames = f.saturating_sub(anchor_dac_frame) as f64;
    anchor_server_us + (elapsed_frames * 1_000_000.0 / sample_rate as f64).round() as i64
}

#[cfg(windows)]
fn bump_thread_priority() {
    use windows_sys::Win32::System::Threading::{
        GetCurrentThread, SetThreadPriority, THREAD_PRIORITY_TIME_CRITICAL,
    };
    unsafe {
        SetThreadPriority(GetCurrentThread(), THREAD_PRIORITY_TIME_CRITICAL);
    }
}

#[cfg(unix)]
fn bump_thread_priority() {
    unsafe {
        libc::setpriority(libc::PRIO_PROCESS, 0, -10);
    }
}

#[cfg(not(any(windows, unix)))]
fn bump_thread_priority() {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expected_server_us_advances_linearly_with_dac_frames() {
        let t0 = expected_server_us(1_000_000, 0, 0, 48_000);
        assert_eq!(t0, 1_000_000);
        let t1 = expected_server_us(1_000_000, 0, 48_000, 48_000);
        assert_eq!(t1, 2_000_000);
    }

    struct FakeSink {
        sample_rate: u32,
        frames_written: AtomicU64,
    }

    impl AudioSink for FakeSink {
        fn sample_rate_hz(&self) -> u32 {
            self.sample_rate
        }
        fn frames_written(&self) -> u64 {
            self.frames_written.load(Ordering::Relaxed)
        }
        fn headroom_frames(&self) -> usize {
            256
        }
        fn write(&self, frames: &[Frame]) -> Result<usize, PlaybackError> {
            self.frames_written.fetch_add(frames.len() as u64, Ordering::Relaxed);
            Ok(frames.len())
        }
    }

    #[test]
    fn first_pump_calibrates_from_ring_front_and_enters_playing() {
        let filter = Arc::new(Mutex::new(TimeFilter::new()));
        let sink = Arc::new(FakeSink { sample_rate: 48_000, frames_written: AtomicU64::new(0) });
        let engine = PlaybackEngine::new(ReceiverConfig::default(), filter, sink);
        let frames: Vec<Frame> = (0..480).map(|i| [i as i16, i as i16]).collect();
        engine.ring.push_chunk(5_000_000, &frames, i64::MIN);
        engine.pump();
        assert_eq!(engine.state(), PlaybackState::Playing);
    }

    #[test]
    fn audio_chunk_frame_decodes_header_and_reaches_the_ring() {
        let filter = Arc::new(Mutex::new(TimeFilter::new()));
        let sink = Arc::new(FakeSink { sample_rate: 48_000, frames_written: AtomicU64::new(0) });
        let engine = PlaybackEngine::new(ReceiverConfig::default(), filter, sink);
        let header = CodecHeader {
            sample_rate_hz: 48_000,
            channels: 2,
            bit_depth: 16,
            kind: crate::audio::DecoderKind::Pcm,
            extra: None,
        };
        engine.start_stream(&header).unwrap();
        let pcm_bytes: Vec<u8> = (0..480i16).flat_map(|i| [i, i]).flat_map(|s| s.to_le_bytes()).collect();
        let frame = crate::wire::encode_audio_chunk_frame(5_000_000, &pcm_bytes);
        engine.on_audio_chunk_frame(&frame);
        assert_eq!(engine.ring.frames_queued(), 480);
        assert_eq!(engine.ring.front_server_us(), Some(5_000_000));
    }

    #[test]
    fn underrun_on_empty_ring_increments_counter() {
        let filter = Arc::new(Mutex::new(TimeFilter::new()));
        let sink = Arc::new(FakeSink { sample_rate: 48_000, frames_written: AtomicU64::new(0) });
        let engine = PlaybackEngine::new(ReceiverConfig::default(), filter, sink);
        engine.pump();
        assert_eq!(engine.stats().buffer_underrun_count, 1);
    }

    #[test]
    fn drop_correction_engages_above_threshold_and_clears_once_error_settles() {
        let filter = Arc::new(Mutex::new(TimeFilter::new()));
        let sink = Arc::new(FakeSink { sample_rate: 48_000, frames_written: AtomicU64::new(0) });
        let config = ReceiverConfig {
            grace_period_ms: 0,
            correction_threshold_us: 10,
            reanchor_threshold_us: 1_000_000,
            correction_gain: 1_000_000_000.0,
            ..ReceiverConfig::default()
        };
        let engine = PlaybackEngine::new(config, filter, sink);
        let frames: Vec<Frame> = (0..500).map(|i| [i as i16, i as i16]).collect();
        engine.ring.push_chunk(0, &frames, i64::MIN);

        // Calibrates and drains the first headroom's worth with no error.
        engine.pump();
        assert_eq!(engine.state(), PlaybackState::Playing);
        assert_eq!(engine.inner.lock().correction_mode, CorrectionMode::None);

        // Seed a smoothed error above the correction threshold, as if several
        // prior pump cycles had already accumulated it.
        engine.inner.lock().smoothed_sync_error_us = 50.0;
        engine.pump();
        assert!(matches!(engine.inner.lock().correction_mode, CorrectionMode::Drop { .. }));
        let dropped_after_engaging = engine.stats().frames_dropped;
        assert!(dropped_after_engaging > 0);

        // Once the error settles back down, the very next pump call clears
        // correction mode without any additional delay.
        let frames: Vec<Frame> = (0..500).map(|i| [i as i16, i as i16]).collect();
        let next_server_us = engine.current_dac_server_us();
        engine.ring.push_chunk(next_server_us, &frames, i64::MIN);
        engine.inner.lock().smoothed_sync_error_us = 0.0;
        engine.pump();
        assert_eq!(engine.inner.lock().correction_mode, CorrectionMode::None);
        assert_eq!(engine.stats().frames_dropped, dropped_after_engaging);
    }

    #[test]
    fn reanchors_when_a_chunk_lands_far_ahead_of_the_dac_cursor() {
        let filter = Arc::new(Mutex::new(TimeFilter::new()));
        let sink = Arc::new(FakeSink { sample_rate: 48_000, frames_written: AtomicU64::new(0) });
        let engine = PlaybackEngine::new(ReceiverConfig::default(), filter, sink);

        let frames: Vec<Frame> = (0..10).map(|i| [i as i16, i as i16]).collect();
        engine.ring.push_chunk(0, &frames, i64::MIN);
        engine.pump();
        assert_eq!(engine.stats().reanchor_count, 0);

        // Clear grace and fast-forward the smoothed error past the re-anchor
        // threshold, as a single chunk arriving ~600ms ahead of the DAC
        // cursor would over a few pump cycles.
        let expected_now = engine.current_dac_server_us();
        {
            let mut inner = engine.inner.lock();
            inner.grace_until = None;
            inner.smoothed_sync_error_us = 350_000.0;
        }
        let frames: Vec<Frame> = (0..10).map(|i| [i as i16, i as i16]).collect();
        engine.ring.push_chunk(expected_now, &frames, i64::MIN);

        engine.pump();

        assert_eq!(engine.stats().reanchor_count, 1);
        assert_eq!(engine.state(), PlaybackState::Reanchoring);
        let inner = engine.inner.lock();
        assert!(inner.grace_until.map(|t| t > Instant::now()).unwrap_or(false));
    }
}
