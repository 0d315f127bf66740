use std::sync::Arc;

use super::EventSource;
use super::scheduler::resolve_start_time;
use crate::clock::{ClockSource, seconds_per_beat, validate_bpm};
use crate::dispatch::{CommandSink, Dispatcher};
use crate::error::SchedulerError;
use crate::events::ScheduledEvent;
use crate::registry::CancellationRegistry;
use crate::timing::TimerQueue;

/// Longest lead time between arming the next iteration and the end of the
/// current one, in seconds.
pub const MAX_REARM_MARGIN: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoopState {
    pub loop_length_beats: f64,
    /// Generation captured when the loop started.
    pub generation: u64,
}

/// A running loop: its template and where the next iteration lands.
#[derive(Debug)]
pub struct LoopSession {
    state: LoopState,
    template: Vec<ScheduledEvent>,
    /// Cursor position inside the loop when playback started.
    start_offset: f64,
    start_time: f64,
    /// Clock time of loop beat 0 for the next iteration to dispatch.
    iteration_start: f64,
    next_iteration: u64,
    pub registry: CancellationRegistry,
}

impl LoopSession {
    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn template(&self) -> &[ScheduledEvent] {
        &self.template
    }

    pub fn start_time(&self) -> f64 {
        self.start_time
    }

    pub fn next_iteration(&self) -> u64 {
        self.next_iteration
    }
}

/// Lead time before an iteration ends at which the next one is dispatched:
/// a quarter of the loop, but never more than a second.
pub fn rearm_margin(loop_length_beats: f64, seconds_per_beat: f64) -> f64 {
    (loop_length_beats / 4.0 * seconds_per_beat).min(MAX_REARM_MARGIN)
}

/// Repeats `[0, loop_length)` of a source forever.
///
/// The template is resolved once. Each iteration dispatches one loop's
/// worth of events and asks for a single wake-up shortly before it ends, so
/// at most one iteration and one re-arm are ever outstanding.
pub struct LoopPlaybackController {
    clock: Arc<dyn ClockSource>,
}

impl LoopPlaybackController {
    pub fn new(clock: Arc<dyn ClockSource>) -> Self {
        Self { clock }
    }

    /// Starts looping with the cursor at `cursor_beats` (taken modulo the
    /// loop length). Dispatches iteration 0 and returns when to dispatch
    /// iteration 1.
    pub fn start<S: CommandSink + ?Sized>(
        &self,
        loop_length_beats: f64,
        cursor_beats: f64,
        first_beat_start_time: Option<f64>,
        source: &dyn EventSource,
        dispatcher: &mut Dispatcher<'_, S>,
    ) -> Result<(LoopSession, f64), SchedulerError> {
        if !(loop_length_beats.is_finite() && loop_length_beats > 0.0) {
            return Err(SchedulerError::InvalidLoopLength(loop_length_beats));
        }
        let start_time = resolve_start_time(self.clock.as_ref(), first_beat_start_time)?;
        let bpm = validate_bpm(self.clock.current_bpm())?;

        let template = resolve_template(source, loop_length_beats);
        let start_offset = cursor_beats.max(0.0).rem_euclid(loop_length_beats);
        let generation = dispatcher.generation();

        let mut session = LoopSession {
            state: LoopState {
                loop_length_beats,
                generation,
            },
            template,
            start_offset,
            start_time,
            iteration_start: start_time - start_offset * seconds_per_beat(bpm),
            next_iteration: 0,
            registry: CancellationRegistry::new(),
        };

        match self.dispatch_iteration(&mut session, 0, dispatcher) {
            Ok(rearm_at) => Ok((session, rearm_at)),
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

    /// Dispatches iteration `loop_index` and returns when to dispatch the
    /// next one, which is `session.next_iteration()`. Returns `None` without
    /// dispatching anything if the loop was cancelled, i.e.
    /// `live_generation` no longer matches.
    ///
    /// A late wake skips every iteration that has already ended and drops
    /// the events of the current one that are already in the past.
    pub fn schedule_iteration<S: CommandSink + ?Sized>(
        &self,
        session: &mut LoopSession,
        loop_index: u64,
        live_generation: u64,
        dispatcher: &mut Dispatcher<'_, S>,
    ) -> Result<Option<f64>, SchedulerError> {
        if session.state.generation != live_generation {
            tracing::debug!(
                loop_generation = session.state.generation,
                live_generation,
                loop_index,
                "loop cancelled; not re-arming"
            );
            return Ok(None);
        }
        self.dispatch_iteration(session, loop_index, dispatcher)
            .map(Some)
    }

    fn dispatch_iteration<S: CommandSink + ?Sized>(
        &self,
        session: &mut LoopSession,
        loop_index: u64,
        dispatcher: &mut Dispatcher<'_, S>,
    ) -> Result<f64, SchedulerError> {
        debug_assert_eq!(loop_index, session.next_iteration, "loop iterations must be consecutive");

        let now = self.clock.now();
        session.registry.prune(now);

        let bpm = validate_bpm(self.clock.current_bpm())?;
        let spb = seconds_per_beat(bpm);
        let loop_length = session.state.loop_length_beats;
        let loop_span = loop_length * spb;

        let mut loop_index = loop_index;
        let mut iteration_start = session.iteration_start;
        if loop_index > 0 && iteration_start + loop_span <= now {
            let missed = ((now - iteration_start) / loop_span).floor();
            tracing::warn!(
                generation = session.state.generation,
                loop_index,
                missed,
                "loop wake ran late; skipping elapsed iterations"
            );
            iteration_start += missed * loop_span;
            loop_index += missed as u64;
        }

        for event in &session.template {
            if loop_index == 0 && event.beat < session.start_offset {
                continue;
            }
            let time = iteration_start + event.beat * spb;
            if loop_index > 0 && time < now {
                tracing::debug!(beat = event.beat, time, "dropping late loop event");
                continue;
            }
            dispatcher.dispatch(&mut session.registry, &event.payload, time, bpm)?;
        }

        let iteration_end = iteration_start + loop_span;
        session.iteration_start = iteration_end;
        session.next_iteration = loop_index + 1;

        let rearm_at = (iteration_end - rearm_margin(loop_length, spb)).max(now);
        tracing::trace!(
            generation = session.state.generation,
            loop_index,
            iteration_start,
            iteration_end,
            rearm_at,
            "loop iteration dispatched"
        );
        Ok(rearm_at)
    }
}

/// Every event in `[0, loop_length)`, in beat order.
fn resolve_template(source: &dyn EventSource, loop_length_beats: f64) -> Vec<ScheduledEvent> {
    let mut template = Vec::new();
    let beats = loop_length_beats.ceil() as i64;
    for beat_index in 0..beats {
        source.events_in_beat(beat_index, beat_index as u64, &mut template);
    }
    template.retain(|e| e.beat >= 0.0 && e.beat < loop_length_beats);
    template
}
