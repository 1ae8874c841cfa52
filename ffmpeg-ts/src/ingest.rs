use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, TryLockError};

use crate::frame::{AudioChunk, VideoFrame};

/// Log the first drop and then every Nth.
pub const DROP_LOG_INTERVAL: u64 = 120;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Single-slot hand-off from the capture thread to the encoding thread.
///
/// A producer never waits: if the consumer holds the slot the frame is
/// dropped. A newer frame overwrites an unconsumed one.
#[derive(Default)]
pub struct VideoSlot {
    slot: Mutex<Option<VideoFrame>>,
    dropped: AtomicU64,
    replaced: AtomicU64,
}

impl VideoSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` when the frame was dropped because the slot was busy.
    pub fn offer(&self, frame: VideoFrame) -> bool {
        let mut slot = match self.slot.try_lock() {
            Ok(slot) => slot,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped == 1 || dropped % DROP_LOG_INTERVAL == 0 {
                    log::debug!("video slot busy, dropped {} frames so far", dropped);
                }
                return false;
            }
        };
        if slot.replace(frame).is_some() {
            self.replaced.fetch_add(1, Ordering::Relaxed);
        }
        true
    }

    pub fn take(&self) -> Option<VideoFrame> {
        lock(&self.slot).take()
    }

    pub fn is_pending(&self) -> bool {
        lock(&self.slot).is_some()
    }

    pub fn clear(&self) {
        lock(&self.slot).take();
    }

    /// Frames dropped on contention.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Frames overwritten before the encoder consumed them.
    pub fn replaced(&self) -> u64 {
        self.replaced.load(Ordering::Relaxed)
    }
}

struct AccumulatorState {
    samples: VecDeque<i16>,
    capacity: usize,
    channels: usize,
    eviction_fraction: f64,
}

/// Bounded FIFO of interleaved PCM. Overflow evicts the oldest samples so
/// the newest audio always survives.
pub struct AudioAccumulator {
    state: Mutex<AccumulatorState>,
    evicted: AtomicU64,
    evictions: AtomicU64,
}

impl AudioAccumulator {
    pub fn new(capacity: usize, channels: u32, eviction_fraction: f64) -> Self {
        Self {
            state: Mutex::new(AccumulatorState {
                samples: VecDeque::with_capacity(capacity),
                capacity,
                channels: channels.max(1) as usize,
                eviction_fraction,
            }),
            evicted: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Changes the bound and channel count, discarding buffered audio.
    pub fn reconfigure(&self, capacity: usize, channels: u32, eviction_fraction: f64) {
        let mut state = lock(&self.state);
        state.samples.clear();
        state.samples.reserve(capacity);
        state.capacity = capacity;
        state.channels = channels.max(1) as usize;
        state.eviction_fraction = eviction_fraction;
    }

    /// Appends `samples`, returning how many samples were discarded to stay
    /// within the bound. Returns `None` and keeps nothing if `samples` is not
    /// a whole number of interleaved frames.
    pub fn push(&self, samples: &[i16]) -> Option<usize> {
        if samples.is_empty() {
            return Some(0);
        }
        let mut state = lock(&self.state);
        if samples.len() % state.channels != 0 {
            return None;
        }
        let len = state.samples.len();
        let mut skip = 0;
        let mut evicted = 0;
        if len + samples.len() > state.capacity {
            let overflow = len + samples.len() - state.capacity;
            let chunk = (state.capacity as f64 * state.eviction_fraction).ceil() as usize;
            let evict = round_up(overflow.max(chunk), state.channels);
            let from_buffer = evict.min(len);
            state.samples.drain(..from_buffer);
            // only reached when the push alone exceeds the bound
            skip = (evict - from_buffer).min(samples.len());
            evicted = from_buffer + skip;
        }
        state.samples.extend(&samples[skip..]);
        drop(state);

        if evicted > 0 {
            self.evicted.fetch_add(evicted as u64, Ordering::Relaxed);
            let evictions = self.evictions.fetch_add(1, Ordering::Relaxed) + 1;
            if evictions == 1 || evictions % DROP_LOG_INTERVAL == 0 {
                log::warn!(
                    "audio buffer overflow, evicted {} oldest samples ({} overflows so far)",
                    evicted,
                    evictions
                );
            }
        }
        Some(evicted)
    }

    /// Removes exactly `samples_per_frame` samples, or nothing if fewer are
    /// buffered.
    pub fn take_frame(&self, samples_per_frame: usize) -> Option<AudioChunk> {
        if samples_per_frame == 0 {
            return None;
        }
        let mut state = lock(&self.state);
        if state.samples.len() < samples_per_frame {
            return None;
        }
        let channels = state.channels as u32;
        let samples: Vec<i16> = state.samples.drain(..samples_per_frame).collect();
        Some(AudioChunk::new(samples, channels))
    }

    pub fn len(&self) -> usize {
        lock(&self.state).samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        lock(&self.state).capacity
    }

    pub fn clear(&self) {
        lock(&self.state).samples.clear();
    }

    /// Total samples discarded by overflow.
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

fn round_up(value: usize, multiple: usize) -> usize {
    value.div_ceil(multiple) * multiple
}

/// Everything the capture side hands to the encoding thread.
pub struct Ingest {
    pub video: VideoSlot,
    pub audio: AudioAccumulator,
}

impl Ingest {
    pub fn new(channels: u32, eviction_fraction: f64) -> Self {
        Self {
            video: VideoSlot::new(),
            audio: AudioAccumulator::new(0, channels, eviction_fraction),
        }
    }

    pub fn clear(&self) {
        self.video.clear();
        self.audio.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(value: u8) -> VideoFrame {
        VideoFrame::new(&[value; 12], 2, 2).unwrap()
    }

    #[test]
    fn newer_frame_replaces_pending_one() {
        let slot = VideoSlot::new();
        assert!(slot.offer(frame(1)));
        assert!(slot.offer(frame(2)));
        assert_eq!(slot.replaced(), 1);
        let taken = slot.take().unwrap();
        assert_eq!(taken.data()[0], 2);
        assert!(slot.take().is_none());
    }

    #[test]
    fn busy_slot_drops_without_blocking() {
        let slot = VideoSlot::new();
        let guard = slot.slot.lock().unwrap();
        assert!(!slot.offer(frame(1)));
        drop(guard);
        assert_eq!(slot.dropped(), 1);
        assert!(!slot.is_pending());
    }

    #[test]
    fn accumulator_releases_whole_frames_only() {
        let audio = AudioAccumulator::new(64, 2, 0.1);
        audio.push(&[1; 6]);
        assert!(audio.take_frame(8).is_none());
        audio.push(&[2; 6]);
        let chunk = audio.take_frame(8).unwrap();
        assert_eq!(chunk.samples(), &[1, 1, 1, 1, 1, 1, 2, 2]);
        assert_eq!(chunk.frames(), 4);
        assert_eq!(audio.len(), 4);
    }

    #[test]
    fn overflow_evicts_oldest_and_keeps_newest() {
        let audio = AudioAccumulator::new(100, 2, 0.1);
        let first: Vec<i16> = (0..100).collect();
        assert_eq!(audio.push(&first), Some(0));
        let evicted = audio.push(&[500, 501]).unwrap();
        // at least the overflow, rounded to a tenth of the bound
        assert_eq!(evicted, 10);
        assert_eq!(audio.len(), 92);
        assert!(audio.len() <= audio.capacity());
        let everything = audio.take_frame(92).unwrap();
        assert_eq!(everything.samples()[0], 10);
        assert_eq!(&everything.samples()[90..], &[500, 501]);
        assert_eq!(audio.evicted(), 10);
    }

    #[test]
    fn oversized_push_keeps_its_tail() {
        let audio = AudioAccumulator::new(10, 2, 0.1);
        audio.push(&[1, 2]);
        let big: Vec<i16> = (0..20).collect();
        audio.push(&big);
        assert!(audio.len() <= 10);
        let rest = audio.take_frame(audio.len()).unwrap();
        assert_eq!(*rest.samples().last().unwrap(), 19);
    }

    #[test]
    fn eviction_keeps_channel_alignment() {
        let audio = AudioAccumulator::new(30, 2, 0.1);
        // left = even, right = odd
        let stereo: Vec<i16> = (0..30).map(|i| if i % 2 == 0 { 0 } else { 1 }).collect();
        audio.push(&stereo);
        audio.push(&[0, 1, 0, 1]);
        let chunk = audio.take_frame(audio.len()).unwrap();
        assert_eq!(chunk.samples()[0], 0);
        assert_eq!(chunk.samples()[1], 1);
    }

    #[test]
    fn partial_sample_frame_is_refused() {
        let audio = AudioAccumulator::new(4096, 2, 0.1);
        assert_eq!(audio.push(&[1]), None);
        assert!(audio.is_empty());
        for _ in 0..4 {
            assert_eq!(audio.push(&[1, 2, 1, 2]), Some(0));
        }
        let chunk = audio.take_frame(16).unwrap();
        for pair in chunk.samples().chunks_exact(2) {
            assert_eq!(pair, &[1, 2]);
        }
    }

    #[test]
    fn reconfigure_discards_buffered_audio() {
        let audio = AudioAccumulator::new(16, 2, 0.1);
        audio.push(&[1; 8]);
        audio.reconfigure(32, 1, 0.25);
        assert!(audio.is_empty());
        assert_eq!(audio.capacity(), 32);
        audio.push(&[3; 4]);
        assert_eq!(audio.take_frame(4).unwrap().channels(), 1);
    }
}
