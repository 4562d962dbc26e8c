//! SPSC-style ring of decoded, presentation-timestamped stereo frames.
//!
//! Grounded on the ordering/overlap/dedup bookkeeping in
//! `bass-aes67/src/input/jitter.rs`'s `JitterBuffer` (`VecDeque`-backed,
//! binary-search insert, a `*Stats` struct of named counters) but simplified:
//! this ring never reorders (the decode task hands it frames in arrival
//! order already) and instead of sequence numbers it tracks server-clock
//! microseconds per frame. Held behind a `parking_lot::Mutex` rather than a
//! truly lock-free structure, the same trade `JitterBuffer` makes — contention is negligible at audio buffer sizes, and the variable-
//! length overlap/trim logic below isn't expressible with a fixed-slot
//! lock-free queue.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use super::Frame;

#[derive(Debug, Clone, Copy)]
struct TimedFrame {
    server_us: i64,
    frame: Frame,
}

#[derive(Debug, Default)]
pub struct AudioRingStats {
    pub overlaps_trimmed: AtomicU64,
}

struct RingInner {
    queue: VecDeque<TimedFrame>,
    high_water_frames: usize,
    sample_rate_hz: u32,
    last_pushed_end_us: Option<i64>,
}

pub struct AudioRing {
    inner: Mutex<RingInner>,
    stats: AudioRingStats,
}

impl AudioRing {
    pub fn new(high_water_frames: usize, sample_rate_hz: u32) -> Self {
        AudioRing {
            inner: Mutex::new(RingInner {
                queue: VecDeque::with_capacity(high_water_frames.min(1 << 20)),
                high_water_frames,
                sample_rate_hz,
                last_pushed_end_us: None,
            }),
            stats: AudioRingStats::default(),
        }
    }

    fn frame_duration_us(sample_rate_hz: u32) -> f64 {
        1_000_000.0 / sample_rate_hz as f64
    }

    /// Enqueues `frames` presented starting at `server_us`, trimming any
    /// overlap with already-queued content and any leading frames that have
    /// already passed `dac_cursor_us`. Returns the number of frames actually
    /// pushed.
    pub fn push_chunk(&self, server_us: i64, frames: &[Frame], dac_cursor_us: i64) -> usize {
        let mut inner = self.inner.lock();
        let dur = Self::frame_duration_us(inner.sample_rate_hz);

        // Overlap trim: a chunk whose start precedes what's already queued
        // supersedes it — the ring can only drop whole slots from the front,
        // so on overlap the entire stale backlog is discarded.
        if let Some(last_end) = inner.last_pushed_end_us {
            if server_us < last_end {
                let dropped = inner.queue.len() as u64;
                inner.queue.clear();
                self.stats.overlaps_trimmed.fetch_add(dropped, Ordering::Relaxed);
                inner.last_pushed_end_us = None;
            }
        }

        // Trim leading frames of the incoming chunk that the DAC cursor has
        // already passed.
        let mut start_index = 0usize;
        if server_us < dac_cursor_us {
            let behind_us = (dac_cursor_us - server_us) as f64;
            let to_trim = (behind_us / dur).floor() as usize;
            start_index = to_trim.min(frames.len());
            if start_index > 0 {
                self.stats
                    .overlaps_trimmed
                    .fetch_add(start_index as u64, Ordering::Relaxed);
            }
        }

        let remaining = &frames[start_index..];
        let room = inner.high_water_frames.saturating_sub(inner.queue.len());
        let to_push = remaining.len().min(room);

        for (i, frame) in remaining.iter().take(to_push).enumerate() {
            let offset_frames = (start_index + i) as f64;
            let ts = server_us as f64 + offset_frames * dur;
            inner.queue.push_back(TimedFrame {
                server_us: ts.round() as i64,
                frame: *frame,
            });
        }

        if !remaining.is_empty() {
            let last_offset = (start_index + remaining.len() - 1) as f64;
            inner.last_pushed_end_us =
                Some((server_us as f64 + (last_offset + 1.0) * dur).round() as i64);
        }

        to_push
    }

    pub fn front_server_us(&self) -> Option<i64> {
        self.inner.lock().queue.front().map(|f| f.server_us)
    }

    /// Pops up to `n` frames; never blocks, returns fewer if the ring has
    /// less than `n` queued.
    pub fn pop_frames(&self, n: usize) -> Vec<Frame> {
        let mut inner = self.inner.lock();
        let count = n.min(inner.queue.len());
        inner.queue.drain(..count).map(|f| f.frame).collect()
    }

    pub fn frames_queued(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// Drops queued frames whose timestamp precedes `server_us`, used by a
    /// re-anchor to catch the ring up to the DAC's new reference point.
    pub fn discard_until(&self, server_us: i64) {
        let mut inner = self.inner.lock();
        while let Some(front) = inner.queue.front() {
            if front.server_us < server_us {
                inner.queue.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.queue.clear();
        inner.last_pushed_end_us = None;
    }

    pub fn overlaps_trimmed(&self) -> u64 {
        self.stats.overlaps_trimmed.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(v: i16) -> Frame {
        [v, v]
    }

    #[test]
    fn push_preserves_monotonic_order_and_reports_queued_count() {
        let ring = AudioRing::new(1000, 48_000);
        let frames: Vec<Frame> = (0..10).map(frame).collect();
        let pushed = ring.push_chunk(1_000_000, &frames, 0);
        assert_eq!(pushed, 10);
        assert_eq!(ring.frames_queued(), 10);
        assert_eq!(ring.front_server_us(), Some(1_000_000));
    }

    #[test]
    fn pop_never_blocks_and_returns_fewer_when_short() {
        let ring = AudioRing::new(1000, 48_000);
        let frames: Vec<Frame> = (0..5).map(frame).collect();
        ring.push_chunk(0, &frames, 0);
        let popped = ring.pop_frames(10);
        assert_eq!(popped.len(), 5);
        assert_eq!(ring.frames_queued(), 0);
    }

    #[test]
    fn overlapping_chunk_trims_stale_backlog_down_to_new_start() {
        // Sample rate chosen so 200us == 20 frames: 100_000 Hz -> 10us per frame.
        let ring = AudioRing::new(10_000, 100_000);
        let chunk_a: Vec<Frame> = (0..100).map(frame).collect();
        let chunk_b: Vec<Frame> = (0..100).map(frame).collect();

        ring.push_chunk(1_000_000, &chunk_a, 1_000_700);
        ring.push_chunk(1_000_500, &chunk_b, 1_000_700);

        assert_eq!(ring.overlaps_trimmed(), 120);
        assert_eq!(ring.frames_queued(), 80);
        assert_eq!(ring.front_server_us(), Some(1_000_700));
    }

    #[test]
    fn clear_resets_queue_and_monotonic_tracking() {
        let ring = AudioRing::new(1000, 48_000);
        ring.push_chunk(0, &[frame(1), frame(2)], 0);
        ring.clear();
        assert_eq!(ring.frames_queued(), 0);
        assert_eq!(ring.front_server_us(), None);
    }

    #[test]
    fn high_water_mark_caps_queued_frames() {
        let ring = AudioRing::new(5, 48_000);
        let frames: Vec<Frame> = (0..10).map(frame).collect();
        let pushed = ring.push_chunk(0, &frames, 0);
        assert_eq!(pushed, 5);
        assert_eq!(ring.frames_queued(), 5);
    }
}
