use std::sync::Arc;

use super::EventSource;
use crate::clock::{Anchor, BeatTiming, ClockSource, seconds_per_beat, validate_bpm};
use crate::dispatch::{CommandSink, Dispatcher};
use crate::error::SchedulerError;
use crate::registry::CancellationRegistry;
use crate::timing::TimerQueue;

/// Half-open span of clock time `[start_time, end_time)` resolved by one tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SchedulingWindow {
    pub start_time: f64,
    pub end_time: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SchedulerConfig {
    /// Seconds between ticks.
    pub poll_interval: f64,
    /// How many poll intervals ahead of now each tick resolves.
    pub lookahead_factor: f64,
}

impl SchedulerConfig {
    /// Rejects settings under which ticks would never advance the clock or
    /// windows would leave gaps between ticks.
    pub fn validate(&self) -> Result<(), SchedulerError> {
        if !(self.poll_interval.is_finite() && self.poll_interval > 0.0) {
            return Err(SchedulerError::InvalidConfig(format!(
                "poll_interval must be a positive number of seconds, got {}",
                self.poll_interval
            )));
        }
        if !(self.lookahead_factor.is_finite() && self.lookahead_factor >= 1.0) {
            return Err(SchedulerError::InvalidConfig(format!(
                "lookahead_factor must be at least 1, got {}",
                self.lookahead_factor
            )));
        }
        Ok(())
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: 3.2,
            lookahead_factor: 3.0,
        }
    }
}

/// Mutable state of one lookahead run.
#[derive(Debug)]
pub struct SchedulerSession {
    generation: u64,
    start_time: f64,
    start_beat_offset: f64,
    /// Last resolved beat and its timestamp; later beats are resolved from here.
    anchor: Anchor,
    last_scheduled_beat_index: i64,
    total_processed_beats: u64,
    /// Clock time up to which every beat has been resolved.
    covered_until: f64,
    last_window: Option<SchedulingWindow>,
    finished: bool,
    pub registry: CancellationRegistry,
}

impl SchedulerSession {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn start_time(&self) -> f64 {
        self.start_time
    }

    pub fn last_scheduled_beat_index(&self) -> i64 {
        self.last_scheduled_beat_index
    }

    pub fn total_processed_beats(&self) -> u64 {
        self.total_processed_beats
    }

    pub fn last_window(&self) -> Option<SchedulingWindow> {
        self.last_window
    }

    /// True once a finite source has had every beat resolved.
    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

/// Resolves the requested first-beat time against the clock.
pub(crate) fn resolve_start_time(
    clock: &dyn ClockSource,
    first_beat_start_time: Option<f64>,
) -> Result<f64, SchedulerError> {
    let now = clock.now();
    match first_beat_start_time {
        Some(requested) if requested < now || !requested.is_finite() => {
            Err(SchedulerError::StartInPast { requested, now })
        }
        Some(requested) => Ok(requested),
        None => Ok(now),
    }
}

/// Bridges beat time to clock time with a bounded lookahead.
///
/// Every tick resolves the beats that fall before `now + lookahead`, hands
/// their events to the dispatcher with exact timestamps and asks to be
/// polled again one interval later.
pub struct LookaheadScheduler {
    clock: Arc<dyn ClockSource>,
    timing: Arc<dyn BeatTiming>,
    config: SchedulerConfig,
}

impl LookaheadScheduler {
    pub fn new(
        clock: Arc<dyn ClockSource>,
        timing: Arc<dyn BeatTiming>,
        config: SchedulerConfig,
    ) -> Result<Self, SchedulerError> {
        config.validate()?;
        Ok(Self {
            clock,
            timing,
            config,
        })
    }

    pub fn config(&self) -> SchedulerConfig {
        self.config
    }

    /// Creates a session whose first beat (`start_beat_offset`) plays at
    /// `first_beat_start_time`, or now. The first tick runs before this
    /// returns. Returns the session and when to tick next.
    pub fn start<S: CommandSink + ?Sized>(
        &self,
        first_beat_start_time: Option<f64>,
        start_beat_offset: f64,
        source: &dyn EventSource,
        dispatcher: &mut Dispatcher<'_, S>,
    ) -> Result<(SchedulerSession, Option<f64>), SchedulerError> {
        let start_time = resolve_start_time(self.clock.as_ref(), first_beat_start_time)?;
        self.start_resolved(start_time, start_beat_offset, source, dispatcher)
    }

    /// Like `start`, for a start time that was already checked against the
    /// clock, so sessions started together share one first-beat time.
    pub(crate) fn start_resolved<S: CommandSink + ?Sized>(
        &self,
        start_time: f64,
        start_beat_offset: f64,
        source: &dyn EventSource,
        dispatcher: &mut Dispatcher<'_, S>,
    ) -> Result<(SchedulerSession, Option<f64>), SchedulerError> {
        let bpm = validate_bpm(self.clock.current_bpm())?;
        let start_beat_offset = start_beat_offset.max(0.0);

        let first_index = start_beat_offset.floor() as i64;
        let anchor_beat = first_index - 1;
        let anchor = Anchor {
            beat: anchor_beat,
            time: start_time - (start_beat_offset - anchor_beat as f64) * seconds_per_beat(bpm),
        };

        let mut session = SchedulerSession {
            generation: dispatcher.generation(),
            start_time,
            start_beat_offset,
            anchor,
            last_scheduled_beat_index: anchor_beat,
            total_processed_beats: 0,
            covered_until: start_time,
            last_window: None,
            finished: false,
            registry: CancellationRegistry::new(),
        };

        match self.tick(&mut session, source, dispatcher) {
            Ok(next) => Ok((session, next)),
            Err(e) => {
                let now = self.clock.now();
                if let Err(teardown) = session
                    .registry
                    .cancel_all(now, dispatcher, &mut TimerQueue::<()>::new())
                {
                    tracing::warn!(error = %teardown, "teardown after failed start was incomplete");
                }
                Err(e)
            }
        }
    }

    /// One scheduling pass. Returns when to tick again, or `None` once a
    /// finite source is exhausted.
    pub fn tick<S: CommandSink + ?Sized>(
        &self,
        session: &mut SchedulerSession,
        source: &dyn EventSource,
        dispatcher: &mut Dispatcher<'_, S>,
    ) -> Result<Option<f64>, SchedulerError> {
        let now = self.clock.now();
        session.registry.prune(now);
        if session.finished {
            return Ok(None);
        }

        let interval = self.config.poll_interval;
        let next_tick = Some(now + interval);

        if now > session.covered_until {
            tracing::warn!(
                now,
                covered_until = session.covered_until,
                "tick ran late; beats in the gap are dropped"
            );
        }
        let window = SchedulingWindow {
            start_time: session.covered_until.max(now),
            end_time: now + interval * self.config.lookahead_factor,
        };
        if window.end_time <= window.start_time {
            // Playback starts beyond this tick's lookahead.
            return Ok(next_tick);
        }

        let bpm = self.clock.current_bpm();
        if validate_bpm(bpm).is_err() {
            tracing::warn!(bpm, "clock reports an unusable tempo; skipping tick");
            return Ok(next_tick);
        }

        let first = session.last_scheduled_beat_index + 1;
        let times = self.resolve_beats(session.anchor, first, bpm, window.end_time);
        let reached_end = times.last().is_some_and(|t| *t >= window.end_time);

        let end_index = source.end_beat().map(|b| b.floor() as i64);
        let spb = seconds_per_beat(bpm);
        let mut events = Vec::new();
        let mut processed = 0u64;

        for (offset, &beat_time) in times.iter().enumerate() {
            if beat_time >= window.end_time {
                break;
            }
            let beat_index = first + offset as i64;
            if end_index.is_some_and(|end| beat_index > end) {
                session.finished = true;
                break;
            }

            let next_beat_time = times.get(offset + 1).copied().unwrap_or(beat_time + spb);
            events.clear();
            source.events_in_beat(beat_index, session.total_processed_beats, &mut events);

            // Commit the beat before dispatching so a failed dispatch can
            // never cause it to be dispatched twice.
            debug_assert!(beat_index > session.last_scheduled_beat_index);
            session.last_scheduled_beat_index = beat_index;
            session.anchor = Anchor {
                beat: beat_index,
                time: beat_time,
            };
            session.total_processed_beats += 1;
            processed += 1;

            for event in &events {
                if event.beat < session.start_beat_offset {
                    continue;
                }
                let time = beat_time + (event.beat - beat_index as f64) * (next_beat_time - beat_time);
                if time < window.start_time {
                    tracing::debug!(beat = event.beat, time, "dropping late event");
                    continue;
                }
                dispatcher.dispatch(&mut session.registry, &event.payload, time, bpm)?;
            }

            if end_index.is_some_and(|end| beat_index >= end) {
                session.finished = true;
                break;
            }
        }

        session.covered_until = if reached_end || session.finished {
            window.end_time
        } else {
            session.anchor.time.max(window.start_time)
        };
        debug_assert!(session.covered_until >= window.start_time);
        session.last_window = Some(window);

        tracing::trace!(
            generation = session.generation,
            start = window.start_time,
            end = window.end_time,
            processed,
            last_beat = session.last_scheduled_beat_index,
            "tick"
        );

        if session.finished {
            tracing::debug!(generation = session.generation, "oneshot content exhausted");
            Ok(None)
        } else {
            Ok(next_tick)
        }
    }

    /// Resolves beats from `first` on until one lands at or past `until`.
    /// Tempo can be arbitrarily low, so this keeps extending the request.
    /// Stops early when the timing source has nothing more to give.
    fn resolve_beats(&self, anchor: Anchor, first: i64, bpm: f64, until: f64) -> Vec<f64> {
        let batch = (self.config.poll_interval / seconds_per_beat(bpm)).ceil() as i64 + 1;
        let mut times: Vec<f64> = Vec::new();

        loop {
            let from = first + times.len() as i64;
            let from_anchor = match times.last() {
                Some(&time) => Anchor {
                    beat: from - 1,
                    time,
                },
                None => anchor,
            };
            let resolved = self
                .timing
                .beats_to_seconds(from_anchor, from..from + batch, bpm);
            let Some(&last) = resolved.last() else {
                tracing::debug!(from, "beat timing underrun; waiting for next tick");
                break;
            };
            if times.last().is_some_and(|prev| last <= *prev) {
                tracing::debug!(from, "beat timing stalled; waiting for next tick");
                break;
            }
            times.extend(resolved);
            if last >= until {
                break;
            }
        }

        times
    }
}
