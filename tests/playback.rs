use beatline::timing::{NoteTimeline, SchedulerConfig, StepMark, StepPattern, StepVoice, Wake, WakeKind};
use beatline::{
    Action, AudioClock, ClockSource, EventPayload, GateTarget, Handle, Player, RealtimeMessage,
    RealtimeQueue, ScheduledEvent, SteadyTempo, TargetConfig, TargetId, TimedCommand,
};
use std::collections::BTreeSet;
use std::sync::Arc;

const STEP: f64 = 0.01;

/// A player wired to a queue standing in for the audio thread.
struct Rig {
    clock: Arc<AudioClock>,
    player: Player<Vec<RealtimeMessage>>,
    queue: RealtimeQueue,
    fired: Vec<TimedCommand>,
}

impl Rig {
    fn new(bpm: f64, targets: TargetConfig, content: impl beatline::timing::EventSource + 'static) -> Self {
        let clock = Arc::new(AudioClock::new(1000.0, bpm).unwrap());
        let player = Player::new(
            clock.clone(),
            Arc::new(SteadyTempo),
            SchedulerConfig {
                poll_interval: 0.25,
                lookahead_factor: 3.0,
            },
            targets,
            Box::new(content),
            Vec::new(),
        )
        .unwrap();
        Self {
            clock,
            player,
            queue: RealtimeQueue::new(),
            fired: Vec::new(),
        }
    }

    fn flush(&mut self) {
        for message in self.player.sink_mut().drain(..) {
            self.queue.receive(message);
        }
        self.queue.drain_due(self.clock.now() + 1e-6, &mut self.fired);
    }

    fn run_until(&mut self, until: f64) {
        self.flush();
        while self.clock.now() < until {
            self.clock.advance_seconds(STEP);
            self.player.poll().unwrap();
            self.flush();
        }
    }

    fn stop(&mut self) {
        self.player.stop_playback().unwrap();
        self.flush();
    }

    fn times_of(&self, wanted: impl Fn(&Action) -> bool) -> Vec<f64> {
        self.fired
            .iter()
            .filter(|c| wanted(&c.action))
            .map(|c| c.time)
            .collect()
    }
}

fn note(beat: f64, is_attack: bool, line_index: u32) -> ScheduledEvent {
    ScheduledEvent::new(
        beat,
        EventPayload::NoteEvent {
            is_attack,
            line_index,
        },
    )
}

fn sample(beat: f64, voice_index: u32) -> ScheduledEvent {
    ScheduledEvent::new(beat, EventPayload::SampleEvent { voice_index })
}

fn assert_close(actual: &[f64], expected: &[f64]) {
    assert_eq!(actual.len(), expected.len(), "{actual:?} vs {expected:?}");
    for (a, e) in actual.iter().zip(expected) {
        assert!((a - e).abs() < 1e-9, "{actual:?} vs {expected:?}");
    }
}

/// Replays fired commands and returns the targets left on.
fn left_on(fired: &[TimedCommand]) -> BTreeSet<TargetId> {
    let mut on = BTreeSet::new();
    for command in fired {
        match command.action.transition() {
            Some((target, true)) => {
                on.insert(target);
            }
            Some((target, false)) => {
                on.remove(&target);
            }
            None => {}
        }
    }
    on
}

#[test]
fn loop_repeats_every_iteration_and_stop_releases() {
    let timeline = NoteTimeline::from_events(vec![note(0.0, true, 0), note(3.0, false, 0)]);
    let mut rig = Rig::new(120.0, TargetConfig::explicit_notes(), timeline);
    rig.player.set_loop_point(Some(4.0)).unwrap();
    rig.player.start_playback(0.0).unwrap();

    rig.run_until(6.5);
    rig.stop();
    let fired_at_stop = rig.fired.len();
    rig.run_until(12.0);

    let on = |a: &Action| *a == Action::NoteOn { line_index: 0 };
    let off = |a: &Action| *a == Action::NoteOff { line_index: 0 };
    assert_close(&rig.times_of(on), &[0.0, 2.0, 4.0, 6.0]);
    assert_close(&rig.times_of(off), &[1.5, 3.5, 5.5, 6.5]);
    assert_eq!(rig.fired.len(), fired_at_stop);
    assert!(rig.queue.is_empty());
    assert_eq!(rig.player.next_wake_time(), None);
}

#[test]
fn oneshot_fires_once_from_cursor() {
    let timeline = NoteTimeline::from_events(vec![sample(12.0, 5)]);
    let mut rig = Rig::new(120.0, TargetConfig::default(), timeline);
    rig.player.start_playback(10.0).unwrap();

    rig.run_until(8.0);
    assert_close(&rig.times_of(|a| *a == Action::StartSample { voice_index: 5 }), &[1.0]);
    assert!(rig.player.is_playing());
    assert_eq!(rig.player.next_wake_time(), None);
}

fn busy_pattern() -> StepPattern {
    let mark = || Some(StepMark::default());
    StepPattern {
        voices: vec![
            StepVoice {
                payload: EventPayload::NoteEvent {
                    is_attack: true,
                    line_index: 2,
                },
                marks: vec![mark(), None, mark()],
            },
            StepVoice {
                payload: EventPayload::GateEvent {
                    gate_index: GateTarget::RisingEdge,
                },
                marks: vec![mark(), mark()],
            },
            StepVoice {
                payload: EventPayload::MidiEvent {
                    synth_index: 1,
                    note: 60,
                    velocity: 90,
                    hold_beats: 1.5,
                },
                marks: vec![mark(), None, None, Some(StepMark { note: Some(63) })],
            },
            StepVoice {
                payload: EventPayload::SampleEvent { voice_index: 0 },
                marks: vec![mark()],
            },
        ],
    }
}

#[test]
fn nothing_is_left_on_after_stop() {
    for looping in [false, true] {
        for stop_at in [0.0, 0.3, 0.77, 1.01, 2.5, 3.33, 7.2] {
            let mut rig = Rig::new(120.0, TargetConfig::default(), busy_pattern());
            if looping {
                rig.player.set_loop_point(Some(3.0)).unwrap();
            }
            rig.player.start_playback(0.0).unwrap();
            rig.run_until(stop_at);
            rig.stop();

            assert!(rig.player.held_targets().is_empty());
            assert_eq!(rig.player.pending_handles(), 0);
            assert!(
                left_on(&rig.fired).is_empty(),
                "looping={looping} stop_at={stop_at}: {:?}",
                left_on(&rig.fired)
            );

            let fired = rig.fired.len();
            rig.run_until(stop_at + 3.0);
            assert_eq!(rig.fired.len(), fired, "fired after stop at {stop_at}");
        }
    }
}

#[test]
fn restarting_never_dispatches_for_the_old_generation() {
    let timeline = NoteTimeline::from_events(vec![sample(0.0, 0), sample(1.0, 1), sample(1.5, 2)]);
    let mut rig = Rig::new(120.0, TargetConfig::default(), timeline);
    rig.player.set_loop_point(Some(2.0)).unwrap();
    rig.player.start_playback(0.0).unwrap();
    let old = rig.player.generation();

    rig.run_until(1.2);
    rig.stop();
    rig.player.start_playback(0.0).unwrap();
    let new = rig.player.generation();
    assert_ne!(old, new);
    let boundary = rig.fired.len();
    let sent = rig.player.sink().len();

    let stale = Wake {
        generation: old,
        kind: WakeKind::LoopIteration(1),
    };
    rig.player.handle_wake(Handle::next(), stale).unwrap();
    assert_eq!(rig.player.sink().len(), sent);

    rig.run_until(6.0);
    assert!(rig.fired.len() > boundary);
    assert!(rig.fired[boundary..].iter().all(|c| c.generation == new));
}

#[test]
fn loop_stays_continuous_through_extreme_tempo_ramp() {
    let timeline = NoteTimeline::from_events((0..4).map(|b| sample(b as f64, b)).collect());
    let mut rig = Rig::new(120.0, TargetConfig::default(), timeline);
    rig.player.set_loop_point(Some(4.0)).unwrap();
    rig.player.start_playback(0.0).unwrap();

    let mut bpm = 120.0;
    let mut t = 0.0;
    while bpm < 900.0 {
        t += 0.1;
        rig.run_until(t);
        bpm *= 1.1;
        rig.clock.set_bpm(bpm).unwrap();
    }
    rig.clock.set_bpm(40.0).unwrap();
    let slow_from = rig.clock.now();
    rig.run_until(slow_from + 20.0);

    let downbeats = rig.times_of(|a| *a == Action::StartSample { voice_index: 0 });
    assert!(downbeats.windows(2).all(|w| w[1] > w[0]), "{downbeats:?}");
    assert!(downbeats.iter().any(|t| *t > slow_from + 10.0));

    // Every iteration plays its beats in order.
    let voices: Vec<u32> = rig
        .fired
        .iter()
        .filter_map(|c| match c.action {
            Action::StartSample { voice_index } => Some(voice_index),
            _ => None,
        })
        .collect();
    for (i, voice) in voices.iter().enumerate() {
        assert_eq!(*voice as usize, i % 4, "{voices:?}");
    }
}

#[test]
fn long_loops_keep_a_bounded_number_of_handles() {
    let timeline = NoteTimeline::from_events((0..4).map(|i| sample(i as f64 * 0.5, i)).collect());
    let mut rig = Rig::new(120.0, TargetConfig::default(), timeline);
    rig.player.set_loop_point(Some(2.0)).unwrap();
    rig.player.start_playback(0.0).unwrap();

    let mut most = 0;
    let mut t = 0.0;
    while t < 300.0 {
        t += 0.5;
        rig.run_until(t);
        most = most.max(rig.player.pending_handles());
    }
    // One iteration of four samples plus the re-arm, with one more
    // iteration in flight around each boundary.
    assert!(most <= 9, "{most}");
    assert!(rig.queue.len() <= 8);
}

#[test]
fn late_loop_wake_never_dispatches_into_the_past() {
    let timeline = NoteTimeline::from_events(vec![sample(0.0, 0)]);
    let mut rig = Rig::new(120.0, TargetConfig::default(), timeline);
    rig.player.set_loop_point(Some(2.0)).unwrap();
    rig.player.start_playback(0.0).unwrap();
    rig.run_until(0.5);

    // The host stalls for several loop lengths.
    rig.clock.advance_seconds(5.0);
    let now = rig.clock.now();
    rig.player.poll().unwrap();

    let sent: Vec<f64> = rig
        .player
        .sink()
        .iter()
        .filter_map(|m| match m {
            RealtimeMessage::Schedule(c) => Some(c.time),
            RealtimeMessage::Cancel(_) => None,
        })
        .collect();
    // Iterations 1 to 4 are over and the downbeat of iteration 5 has passed.
    assert!(sent.is_empty(), "{sent:?}");
    assert!(rig.player.next_wake_time().is_some_and(|t| t > now));

    rig.run_until(5.8);
    assert_eq!(rig.queue.next_due(), Some(6.0));
    rig.run_until(8.5);
    assert_close(
        &rig.times_of(|a| *a == Action::StartSample { voice_index: 0 }),
        &[0.0, 6.0, 7.0, 8.0],
    );
}

#[test]
fn resume_continues_from_the_stopped_cursor() {
    let timeline = NoteTimeline::from_events((0..32).map(|b| sample(b as f64, b)).collect());
    let mut rig = Rig::new(120.0, TargetConfig::default(), timeline);
    rig.player.start_playback(0.0).unwrap();
    rig.run_until(2.0);
    rig.stop();
    assert_eq!(rig.player.get_cursor_beats(), 4.0);

    rig.run_until(3.0);
    let boundary = rig.fired.len();
    rig.player.resume_playback().unwrap();
    rig.run_until(3.6);

    let resumed: Vec<(f64, Action)> = rig.fired[boundary..]
        .iter()
        .map(|c| (c.time, c.action.clone()))
        .collect();
    assert_eq!(
        resumed,
        vec![
            (3.0, Action::StartSample { voice_index: 4 }),
            (3.5, Action::StartSample { voice_index: 5 }),
        ]
    );
}

#[test]
fn loop_point_cannot_change_while_playing() {
    let mut rig = Rig::new(120.0, TargetConfig::default(), NoteTimeline::default());
    rig.player.start_playback(0.0).unwrap();
    assert!(rig.player.set_loop_point(Some(4.0)).is_err());
    rig.stop();
    assert!(rig.player.set_loop_point(Some(4.0)).is_ok());
    assert!(rig.player.set_loop_point(Some(-1.0)).is_err());
}

#[test]
fn metronome_clicks_every_beat_alongside_content() {
    let timeline = NoteTimeline::from_events(vec![sample(1.0, 0)]);
    let mut rig = Rig::new(120.0, TargetConfig::default(), timeline);
    rig.player.set_metronome(Some(7));
    rig.player.start_playback(0.0).unwrap();
    rig.run_until(2.1);

    assert_close(
        &rig.times_of(|a| *a == Action::StartSample { voice_index: 7 }),
        &[0.0, 0.5, 1.0, 1.5, 2.0],
    );
    assert_close(&rig.times_of(|a| *a == Action::StartSample { voice_index: 0 }), &[0.5]);

    rig.stop();
    let fired = rig.fired.len();
    rig.run_until(5.0);
    assert_eq!(rig.fired.len(), fired);
}
