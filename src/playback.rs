//! Gapless, in-order scheduling of model speech on the output clock.
//!
//! Inbound buffers arrive as a stream of short chunks. Each is scheduled at
//! `max(device clock, next_start_time)` so chunks play back-to-back with no
//! gap and no overlap, in arrival order. A barge-in stops everything that is
//! queued or sounding and releases the cursor so the next chunk starts
//! immediately instead of queuing behind cancelled audio.

use crate::codec::AudioBuffer;
use std::collections::HashSet;
use tracing::debug;

/// Identifier for one scheduled buffer ("voice") on the output device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VoiceId(pub u64);

/// Seam to the output device. `now` is the device clock in seconds since
/// the output was opened.
pub trait AudioOutput {
    fn now(&self) -> f64;

    /// Begin playing `buffer` at clock time `at`. Returns `None` once the
    /// output has been closed.
    fn begin(&mut self, buffer: AudioBuffer, at: f64) -> Option<VoiceId>;

    fn stop(&mut self, voice: VoiceId);

    fn close(&mut self);

    fn is_closed(&self) -> bool;
}

pub struct PlaybackScheduler<O: AudioOutput> {
    out: O,
    next_start: f64,
    active: HashSet<VoiceId>,
}

impl<O: AudioOutput> PlaybackScheduler<O> {
    pub fn new(out: O) -> Self {
        Self {
            out,
            next_start: 0.0,
            active: HashSet::new(),
        }
    }

    /// Schedule a buffer in arrival order: never before the device clock,
    /// never overlapping the previously scheduled buffer.
    ///
    /// A closed output makes this a no-op; teardown may race a final
    /// inbound message.
    pub fn schedule(&mut self, buffer: AudioBuffer) {
        if self.out.is_closed() {
            debug!("output closed, dropping late buffer");
            return;
        }

        let duration = buffer.duration();
        let start = self.out.now().max(self.next_start);
        if let Some(voice) = self.out.begin(buffer, start) {
            self.active.insert(voice);
            self.next_start = start + duration;
        }
    }

    /// Natural completion of one voice.
    pub fn voice_ended(&mut self, voice: VoiceId) {
        self.active.remove(&voice);
    }

    /// Barge-in: stop every queued or sounding voice and release the cursor.
    pub fn interrupt(&mut self) {
        for voice in self.active.drain() {
            self.out.stop(voice);
        }
        self.next_start = 0.0;
    }

    /// Stop everything and close the output. Tolerates an empty set and
    /// repeated calls.
    pub fn teardown(&mut self) {
        for voice in self.active.drain() {
            self.out.stop(voice);
        }
        self.next_start = 0.0;
        self.out.close();
    }

    pub fn active_voices(&self) -> usize {
        self.active.len()
    }

    pub fn next_start_time(&self) -> f64 {
        self.next_start
    }

    pub fn output(&self) -> &O {
        &self.out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct MockOutput {
        clock: f64,
        next_id: u64,
        closed: bool,
        begun: Vec<(VoiceId, f64, f64)>, // (voice, start, duration)
        stopped: Vec<VoiceId>,
    }

    impl AudioOutput for MockOutput {
        fn now(&self) -> f64 {
            self.clock
        }

        fn begin(&mut self, buffer: AudioBuffer, at: f64) -> Option<VoiceId> {
            if self.closed {
                return None;
            }
            let voice = VoiceId(self.next_id);
            self.next_id += 1;
            self.begun.push((voice, at, buffer.duration()));
            Some(voice)
        }

        fn stop(&mut self, voice: VoiceId) {
            self.stopped.push(voice);
        }

        fn close(&mut self) {
            self.closed = true;
        }

        fn is_closed(&self) -> bool {
            self.closed
        }
    }

    fn buffer(duration_s: f64) -> AudioBuffer {
        let rate = 1_000u32;
        AudioBuffer {
            channels: vec![vec![0.0; (duration_s * f64::from(rate)) as usize]],
            sample_rate: rate,
        }
    }

    #[test]
    fn back_to_back_buffers_play_contiguously() {
        let mut scheduler = PlaybackScheduler::new(MockOutput::default());

        scheduler.schedule(buffer(0.5));
        scheduler.schedule(buffer(0.3));
        scheduler.schedule(buffer(0.4));

        let starts: Vec<f64> = scheduler.output().begun.iter().map(|(_, at, _)| *at).collect();
        assert_eq!(starts, vec![0.0, 0.5, 0.8]);
        assert!((scheduler.next_start_time() - 1.2).abs() < 1e-9);
        assert_eq!(scheduler.active_voices(), 3);
    }

    #[test]
    fn start_times_never_precede_the_clock() {
        let mut scheduler = PlaybackScheduler::new(MockOutput::default());

        scheduler.schedule(buffer(0.2));
        // Playback ran dry; the clock is past the cursor when the next
        // buffer arrives.
        scheduler.out.clock = 5.0;
        scheduler.schedule(buffer(0.2));

        let starts: Vec<f64> = scheduler.output().begun.iter().map(|(_, at, _)| *at).collect();
        assert_eq!(starts, vec![0.0, 5.0]);
        assert!((scheduler.next_start_time() - 5.2).abs() < 1e-9);
        // Non-decreasing and non-overlapping throughout.
        for pair in scheduler.output().begun.windows(2) {
            let (_, a_start, a_dur) = pair[0];
            let (_, b_start, _) = pair[1];
            assert!(b_start >= a_start + a_dur);
        }
    }

    #[test]
    fn interrupt_stops_all_and_resets_cursor() {
        let mut scheduler = PlaybackScheduler::new(MockOutput::default());

        scheduler.schedule(buffer(0.5));
        scheduler.schedule(buffer(0.5));
        assert_eq!(scheduler.active_voices(), 2);

        scheduler.interrupt();

        assert_eq!(scheduler.active_voices(), 0);
        assert_eq!(scheduler.output().stopped.len(), 2);
        assert_eq!(scheduler.next_start_time(), 0.0);
    }

    #[test]
    fn post_interrupt_buffer_starts_immediately() {
        let mut scheduler = PlaybackScheduler::new(MockOutput::default());

        scheduler.schedule(buffer(10.0));
        scheduler.out.clock = 3.0;
        scheduler.interrupt();
        scheduler.schedule(buffer(0.5));

        let (_, start, _) = *scheduler.output().begun.last().unwrap();
        assert!(start <= scheduler.output().now());
        assert!((start - 3.0).abs() < 1e-9);
    }

    #[test]
    fn voice_ended_removes_from_active_set() {
        let mut scheduler = PlaybackScheduler::new(MockOutput::default());

        scheduler.schedule(buffer(0.5));
        let voice = scheduler.output().begun[0].0;
        scheduler.voice_ended(voice);

        assert_eq!(scheduler.active_voices(), 0);
        // A late notification for an unknown voice is harmless.
        scheduler.voice_ended(VoiceId(999));
    }

    #[test]
    fn schedule_after_teardown_is_a_noop() {
        let mut scheduler = PlaybackScheduler::new(MockOutput::default());

        scheduler.teardown();
        scheduler.schedule(buffer(0.5));

        assert!(scheduler.output().begun.is_empty());
        assert_eq!(scheduler.active_voices(), 0);
    }

    #[test]
    fn teardown_is_idempotent_and_tolerates_empty_set() {
        let mut scheduler = PlaybackScheduler::new(MockOutput::default());

        scheduler.teardown();
        scheduler.teardown();
        assert!(scheduler.output().is_closed());

        let mut scheduler = PlaybackScheduler::new(MockOutput::default());
        scheduler.schedule(buffer(0.5));
        scheduler.teardown();
        assert_eq!(scheduler.output().stopped.len(), 1);
        assert!(scheduler.output().is_closed());
    }
}
