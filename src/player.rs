use std::sync::Arc;

use crate::clock::{BeatTiming, ClockSource, seconds_per_beat};
use crate::dispatch::{CommandSink, Dispatcher, TargetConfig};
use crate::error::SchedulerError;
use crate::events::{Handle, TargetId};
use crate::registry::CancellationRegistry;
use crate::timing::{
    EventSource, LookaheadScheduler, LoopPlaybackController, LoopSession, Metronome,
    SchedulerConfig, SchedulerSession, TimerQueue, Wake, WakeKind,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackMode {
    Oneshot,
    Looping,
}

enum Session {
    Oneshot(SchedulerSession),
    Looping(LoopSession),
}

struct Running {
    session: Session,
    click: Option<SchedulerSession>,
    start_cursor: f64,
    /// Global beat position at which `start_cursor` plays.
    start_clock_beats: f64,
    loop_length: Option<f64>,
}

impl Running {
    fn mode(&self) -> PlaybackMode {
        match self.session {
            Session::Oneshot(_) => PlaybackMode::Oneshot,
            Session::Looping(_) => PlaybackMode::Looping,
        }
    }

    fn registries(&self) -> impl Iterator<Item = &CancellationRegistry> {
        let main = match &self.session {
            Session::Oneshot(s) => &s.registry,
            Session::Looping(s) => &s.registry,
        };
        std::iter::once(main).chain(self.click.as_ref().map(|c| &c.registry))
    }

    fn registry_for(&mut self, kind: WakeKind) -> Option<&mut CancellationRegistry> {
        match (kind, &mut self.session) {
            (WakeKind::Metronome, _) => self.click.as_mut().map(|c| &mut c.registry),
            (WakeKind::Tick, Session::Oneshot(s)) => Some(&mut s.registry),
            (WakeKind::LoopIteration(_), Session::Looping(s)) => Some(&mut s.registry),
            _ => None,
        }
    }
}

fn arm(
    timers: &mut TimerQueue<Wake>,
    registry: &mut CancellationRegistry,
    due: f64,
    wake: Wake,
) {
    let handle = Handle::next();
    timers.arm(handle, due, wake);
    registry.track_timer(handle, due);
}

/// Transport for one piece of content: start, stop, loop and cursor.
///
/// `Stopped -(start)-> Running -(stop)-> Stopped`. Whether a run loops is
/// fixed when it starts. Pausing is a stop that remembers the cursor.
///
/// Nothing here sleeps. The host calls `poll` whenever the clock reaches
/// `next_wake_time`.
pub struct Player<S: CommandSink> {
    clock: Arc<dyn ClockSource>,
    scheduler: LookaheadScheduler,
    looper: LoopPlaybackController,
    content: Box<dyn EventSource>,
    targets: TargetConfig,
    metronome: Option<Metronome>,
    sink: S,
    timers: TimerQueue<Wake>,
    generation: u64,
    cursor_beats: f64,
    loop_point: Option<f64>,
    running: Option<Running>,
}

impl<S: CommandSink> Player<S> {
    /// Fails if `config` could never advance playback.
    pub fn new(
        clock: Arc<dyn ClockSource>,
        timing: Arc<dyn BeatTiming>,
        config: SchedulerConfig,
        targets: TargetConfig,
        content: Box<dyn EventSource>,
        sink: S,
    ) -> Result<Self, SchedulerError> {
        Ok(Self {
            scheduler: LookaheadScheduler::new(clock.clone(), timing, config)?,
            looper: LoopPlaybackController::new(clock.clone()),
            clock,
            content,
            targets,
            metronome: None,
            sink,
            timers: TimerQueue::new(),
            generation: 0,
            cursor_beats: 0.0,
            loop_point: None,
            running: None,
        })
    }

    /// Clicks `voice_index` on every beat while playing.
    pub fn with_metronome(mut self, voice_index: u32) -> Self {
        self.metronome = Some(Metronome { voice_index });
        self
    }

    pub fn set_metronome(&mut self, voice_index: Option<u32>) {
        self.metronome = voice_index.map(|voice_index| Metronome { voice_index });
    }

    pub fn start_playback(&mut self, cursor_beats: f64) -> Result<(), SchedulerError> {
        self.start_playback_at(cursor_beats, None)
    }

    /// Plays from wherever the last stop left the cursor.
    pub fn resume_playback(&mut self) -> Result<(), SchedulerError> {
        self.start_playback_at(self.cursor_beats, None)
    }

    /// Starts playing `cursor_beats` at `first_beat_start_time`, or now.
    pub fn start_playback_at(
        &mut self,
        cursor_beats: f64,
        first_beat_start_time: Option<f64>,
    ) -> Result<(), SchedulerError> {
        if self.running.is_some() {
            return Err(SchedulerError::AlreadyPlaying);
        }
        let cursor = if cursor_beats.is_finite() {
            cursor_beats.max(0.0)
        } else {
            0.0
        };

        self.generation += 1;
        let generation = self.generation;
        let mut dispatcher = Dispatcher::new(&mut self.sink, &self.targets, generation);

        let (mut session, start_time, first_wake) = match self.loop_point {
            Some(loop_length) => {
                let (session, rearm_at) = self.looper.start(
                    loop_length,
                    cursor,
                    first_beat_start_time,
                    self.content.as_ref(),
                    &mut dispatcher,
                )?;
                let start_time = session.start_time();
                let wake = (rearm_at, WakeKind::LoopIteration(1));
                (Session::Looping(session), start_time, Some(wake))
            }
            None => {
                let (session, next) = self.scheduler.start(
                    first_beat_start_time,
                    cursor,
                    self.content.as_ref(),
                    &mut dispatcher,
                )?;
                let start_time = session.start_time();
                let wake = next.map(|at| (at, WakeKind::Tick));
                (Session::Oneshot(session), start_time, wake)
            }
        };

        let click_offset = match self.loop_point {
            Some(loop_length) => cursor.rem_euclid(loop_length),
            None => cursor,
        };
        let click = match &self.metronome {
            Some(metronome) => {
                match self
                    .scheduler
                    .start_resolved(start_time, click_offset, metronome, &mut dispatcher)
                {
                    Ok(click) => Some(click),
                    Err(e) => {
                        let registry = match &mut session {
                            Session::Oneshot(s) => &mut s.registry,
                            Session::Looping(s) => &mut s.registry,
                        };
                        if let Err(teardown) =
                            registry.cancel_all(self.clock.now(), &mut dispatcher, &mut self.timers)
                        {
                            tracing::warn!(error = %teardown, "teardown after failed start was incomplete");
                        }
                        return Err(e);
                    }
                }
            }
            None => None,
        };

        let mut running = Running {
            session,
            click: None,
            start_cursor: cursor,
            start_clock_beats: self.clock.now_in_beats()
                + (start_time - self.clock.now()) / seconds_per_beat(self.clock.current_bpm()),
            loop_length: self.loop_point,
        };

        if let Some((due, kind)) = first_wake {
            if let Some(registry) = running.registry_for(kind) {
                arm(&mut self.timers, registry, due, Wake { generation, kind });
            }
        }
        if let Some((mut click, next)) = click {
            if let Some(due) = next {
                arm(
                    &mut self.timers,
                    &mut click.registry,
                    due,
                    Wake {
                        generation,
                        kind: WakeKind::Metronome,
                    },
                );
            }
            running.click = Some(click);
        }

        tracing::info!(
            generation,
            cursor,
            start_time,
            mode = ?running.mode(),
            loop_length = ?self.loop_point,
            "playback started"
        );
        self.running = Some(running);
        Ok(())
    }

    /// Stops playback: invalidates every outstanding wake, cancels every
    /// armed command and releases every held target at the current time.
    /// The cursor is remembered for `resume_playback`.
    ///
    /// Playback is stopped even when an error is returned.
    pub fn stop_playback(&mut self) -> Result<(), SchedulerError> {
        if self.running.is_none() {
            return Ok(());
        }
        let cursor = self.get_cursor_beats();
        let Some(running) = self.running.take() else {
            return Ok(());
        };

        let stopped_generation = self.generation;
        self.generation += 1;

        let now = self.clock.now();
        let mut dispatcher = Dispatcher::new(&mut self.sink, &self.targets, stopped_generation);
        let mut registries = vec![match running.session {
            Session::Oneshot(s) => s.registry,
            Session::Looping(s) => s.registry,
        }];
        registries.extend(running.click.map(|c| c.registry));

        let mut cancelled = 0;
        let mut released = 0;
        let mut first_error = None;
        for mut registry in registries {
            match registry.cancel_all(now, &mut dispatcher, &mut self.timers) {
                Ok(teardown) => {
                    cancelled += teardown.cancelled;
                    released += teardown.released;
                }
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }

        self.cursor_beats = cursor;
        tracing::info!(
            generation = stopped_generation,
            cursor,
            cancelled,
            released,
            "playback stopped"
        );

        match first_error {
            Some(e) => {
                tracing::warn!(error = %e, "stop could not reach the realtime layer");
                Err(e)
            }
            None => Ok(()),
        }
    }

    /// Sets or clears the loop length. Only allowed while stopped.
    pub fn set_loop_point(&mut self, loop_length_beats: Option<f64>) -> Result<(), SchedulerError> {
        if self.running.is_some() {
            return Err(SchedulerError::LoopPointWhilePlaying);
        }
        if let Some(length) = loop_length_beats {
            if !(length.is_finite() && length > 0.0) {
                return Err(SchedulerError::InvalidLoopLength(length));
            }
        }
        self.loop_point = loop_length_beats;
        Ok(())
    }

    pub fn loop_point(&self) -> Option<f64> {
        self.loop_point
    }

    /// The beat being heard now. While looping this wraps at the loop
    /// length; otherwise it grows without bound.
    pub fn get_cursor_beats(&self) -> f64 {
        let Some(running) = &self.running else {
            return self.cursor_beats;
        };
        let elapsed = (self.clock.now_in_beats() - running.start_clock_beats).max(0.0);
        let position = running.start_cursor + elapsed;
        match running.loop_length {
            Some(length) => position.rem_euclid(length),
            None => position,
        }
    }

    /// Moves the cursor. While playing, playback restarts from the new
    /// position in the same mode.
    pub fn set_cursor_beats(&mut self, cursor_beats: f64) -> Result<(), SchedulerError> {
        let cursor = if cursor_beats.is_finite() {
            cursor_beats.max(0.0)
        } else {
            0.0
        };
        if self.running.is_none() {
            self.cursor_beats = cursor;
            return Ok(());
        }
        tracing::debug!(cursor, "cursor moved while playing; restarting");
        let stopped = self.stop_playback();
        self.cursor_beats = cursor;
        self.start_playback(cursor)?;
        stopped
    }

    /// Replaces the content. A running oneshot session picks it up for the
    /// beats it has not resolved yet; a running loop keeps its template.
    pub fn set_content(&mut self, content: Box<dyn EventSource>) {
        self.content = content;
    }

    /// Handles every wake due at the current clock time. Returns how many
    /// were handled.
    pub fn poll(&mut self) -> Result<usize, SchedulerError> {
        let now = self.clock.now();
        let mut handled = 0;
        while let Some((handle, wake)) = self.timers.pop_due(now) {
            self.handle_wake(handle, wake)?;
            handled += 1;
        }
        Ok(handled)
    }

    /// Runs one fired timer. Wakes from an earlier generation are ignored.
    pub fn handle_wake(&mut self, handle: Handle, wake: Wake) -> Result<(), SchedulerError> {
        if wake.generation != self.generation {
            tracing::debug!(
                wake_generation = wake.generation,
                generation = self.generation,
                kind = ?wake.kind,
                "ignoring stale wake"
            );
            return Ok(());
        }
        let Some(running) = self.running.as_mut() else {
            return Ok(());
        };
        if let Some(registry) = running.registry_for(wake.kind) {
            registry.forget(handle);
        }

        let generation = self.generation;
        let mut dispatcher = Dispatcher::new(&mut self.sink, &self.targets, generation);
        let result = match (wake.kind, &mut running.session) {
            (WakeKind::Tick, Session::Oneshot(session)) => self
                .scheduler
                .tick(session, self.content.as_ref(), &mut dispatcher)
                .map(|next| {
                    if let Some(due) = next {
                        arm(&mut self.timers, &mut session.registry, due, wake);
                    }
                }),
            (WakeKind::LoopIteration(index), Session::Looping(session)) => self
                .looper
                .schedule_iteration(session, index, generation, &mut dispatcher)
                .map(|next| {
                    if let Some(due) = next {
                        let wake = Wake {
                            generation,
                            kind: WakeKind::LoopIteration(session.next_iteration()),
                        };
                        arm(&mut self.timers, &mut session.registry, due, wake);
                    }
                }),
            (WakeKind::Metronome, _) => match (&mut running.click, &self.metronome) {
                (Some(click), Some(metronome)) => self
                    .scheduler
                    .tick(click, metronome, &mut dispatcher)
                    .map(|next| {
                        if let Some(due) = next {
                            arm(&mut self.timers, &mut click.registry, due, wake);
                        }
                    }),
                _ => Ok(()),
            },
            (kind, _) => {
                tracing::debug!(?kind, "wake does not match the running mode");
                Ok(())
            }
        };

        if let Err(e) = result {
            tracing::warn!(error = %e, generation, "scheduling failed; stopping playback");
            if let Err(stop_error) = self.stop_playback() {
                tracing::warn!(error = %stop_error, "teardown after failure was incomplete");
            }
            return Err(e);
        }
        Ok(())
    }

    /// Clock time of the earliest armed wake.
    pub fn next_wake_time(&self) -> Option<f64> {
        self.timers.next_due()
    }

    pub fn is_playing(&self) -> bool {
        self.running.is_some()
    }

    pub fn mode(&self) -> Option<PlaybackMode> {
        self.running.as_ref().map(Running::mode)
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Armed commands and timers across the running sessions.
    pub fn pending_handles(&self) -> usize {
        self.running
            .as_ref()
            .map_or(0, |r| r.registries().map(CancellationRegistry::pending_len).sum())
    }

    pub fn held_targets(&self) -> Vec<TargetId> {
        let mut held: Vec<TargetId> = self
            .running
            .iter()
            .flat_map(|r| r.registries())
            .flat_map(|registry| registry.held_targets().copied())
            .collect();
        held.sort();
        held.dedup();
        held
    }

    pub fn clock(&self) -> &Arc<dyn ClockSource> {
        &self.clock
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }
}

impl<S: CommandSink> Drop for Player<S> {
    fn drop(&mut self) {
        if let Err(e) = self.stop_playback() {
            tracing::warn!(error = %e, "failed to stop playback on drop");
        }
    }
}
