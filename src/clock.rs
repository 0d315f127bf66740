use crate::error::SchedulerError;
use arc_swap::ArcSwap;
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};

pub fn seconds_per_beat(bpm: f64) -> f64 {
    60.0 / bpm
}

pub fn validate_bpm(bpm: f64) -> Result<f64, SchedulerError> {
    if bpm.is_finite() && bpm > 0.0 {
        Ok(bpm)
    } else {
        Err(SchedulerError::InvalidTempo(bpm))
    }
}

/// Read-only view of the audio clock and global transport.
pub trait ClockSource: Send + Sync {
    /// Current audio-clock time in seconds.
    fn now(&self) -> f64;
    fn current_bpm(&self) -> f64;
    /// Current position of the global beat counter.
    fn now_in_beats(&self) -> f64;
}

#[derive(Debug, Clone, Copy)]
struct Tempo {
    bpm: f64,
    anchor_time: f64,
    anchor_beats: f64,
}

/// Sample-counting clock shared between the audio thread and schedulers.
///
/// The audio callback advances the frame counter; readers never lock. Tempo
/// changes re-anchor the beat counter at the current time so beat positions
/// stay continuous.
pub struct AudioClock {
    frames: AtomicU64,
    sample_rate: f64,
    tempo: ArcSwap<Tempo>,
}

impl AudioClock {
    pub fn new(sample_rate: f64, bpm: f64) -> Result<Self, SchedulerError> {
        let bpm = validate_bpm(bpm)?;
        Ok(Self {
            frames: AtomicU64::new(0),
            sample_rate,
            tempo: ArcSwap::from_pointee(Tempo {
                bpm,
                anchor_time: 0.0,
                anchor_beats: 0.0,
            }),
        })
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Acquire)
    }

    /// Called from the audio callback once per rendered buffer.
    pub fn advance(&self, frames: u64) {
        self.frames.fetch_add(frames, Ordering::AcqRel);
    }

    pub fn advance_seconds(&self, seconds: f64) {
        self.advance((seconds * self.sample_rate).round() as u64);
    }

    pub fn set_bpm(&self, bpm: f64) -> Result<(), SchedulerError> {
        let bpm = validate_bpm(bpm)?;
        let now = self.now();
        let anchor_beats = self.now_in_beats();
        self.tempo.store(std::sync::Arc::new(Tempo {
            bpm,
            anchor_time: now,
            anchor_beats,
        }));
        tracing::debug!(bpm, at = now, "tempo changed");
        Ok(())
    }
}

impl ClockSource for AudioClock {
    fn now(&self) -> f64 {
        self.frames() as f64 / self.sample_rate
    }

    fn current_bpm(&self) -> f64 {
        self.tempo.load().bpm
    }

    fn now_in_beats(&self) -> f64 {
        let tempo = self.tempo.load();
        tempo.anchor_beats + (self.now() - tempo.anchor_time) / seconds_per_beat(tempo.bpm)
    }
}

/// A beat index pinned to the clock time it was resolved at.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Anchor {
    pub beat: i64,
    pub time: f64,
}

/// Resolves logical beat indices to absolute clock timestamps.
pub trait BeatTiming: Send + Sync {
    /// Timestamps for `beats`, which start after `anchor.beat`. May return
    /// fewer entries than requested when the tempo curve does not reach that
    /// far yet; an empty result means nothing can be resolved right now.
    fn beats_to_seconds(&self, anchor: Anchor, beats: Range<i64>, bpm: f64) -> Vec<f64>;
}

/// Constant tempo from the anchor onwards.
///
/// Because each request starts from the last resolved beat, a tempo change
/// only affects beats that have not been resolved yet.
#[derive(Debug, Clone, Copy, Default)]
pub struct SteadyTempo;

impl BeatTiming for SteadyTempo {
    fn beats_to_seconds(&self, anchor: Anchor, beats: Range<i64>, bpm: f64) -> Vec<f64> {
        if validate_bpm(bpm).is_err() {
            return Vec::new();
        }
        debug_assert!(beats.start > anchor.beat, "beat range must follow the anchor");
        let spb = seconds_per_beat(bpm);
        beats
            .map(|beat| anchor.time + (beat - anchor.beat) as f64 * spb)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_counts_frames() {
        let clock = AudioClock::new(1000.0, 120.0).unwrap();
        clock.advance(1500);
        assert_eq!(clock.now(), 1.5);
        assert_eq!(clock.now_in_beats(), 3.0);
    }

    #[test]
    fn tempo_change_keeps_beat_position_continuous() {
        let clock = AudioClock::new(1000.0, 120.0).unwrap();
        clock.advance_seconds(1.0);
        clock.set_bpm(60.0).unwrap();
        assert_eq!(clock.now_in_beats(), 2.0);
        clock.advance_seconds(1.0);
        assert_eq!(clock.now_in_beats(), 3.0);
    }

    #[test]
    fn rejects_bad_tempo() {
        assert!(AudioClock::new(48_000.0, 0.0).is_err());
        let clock = AudioClock::new(48_000.0, 90.0).unwrap();
        assert_eq!(
            clock.set_bpm(f64::NAN).map_err(|e| matches!(e, SchedulerError::InvalidTempo(_))),
            Err(true)
        );
    }

    #[test]
    fn steady_tempo_resolves_from_anchor() {
        let anchor = Anchor { beat: 3, time: 10.0 };
        let times = SteadyTempo.beats_to_seconds(anchor, 4..7, 120.0);
        assert_eq!(times, vec![10.5, 11.0, 11.5]);
    }

    #[test]
    fn steady_tempo_underruns_on_invalid_bpm() {
        let anchor = Anchor { beat: 0, time: 0.0 };
        assert!(SteadyTempo.beats_to_seconds(anchor, 1..4, 0.0).is_empty());
    }
}
