use crate::clock::seconds_per_beat;
use crate::error::SchedulerError;
use crate::events::{Action, EventPayload, Handle, RealtimeMessage, TargetId, TimedCommand};
use crate::registry::CancellationRegistry;
use ringbuf::traits::Producer;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Fraction of a beat that notes and gates stay on by default.
pub const DEFAULT_HOLD_FRACTION: f64 = 0.72;

/// Where timestamped commands go. The realtime layer accepts future
/// timestamps, so nothing here waits.
pub trait CommandSink {
    fn send(&mut self, message: RealtimeMessage) -> Result<(), SchedulerError>;
}

impl CommandSink for ringbuf::HeapProd<RealtimeMessage> {
    fn send(&mut self, message: RealtimeMessage) -> Result<(), SchedulerError> {
        self.try_push(message)
            .map_err(|_| SchedulerError::BufferFull)
    }
}

impl CommandSink for Vec<RealtimeMessage> {
    fn send(&mut self, message: RealtimeMessage) -> Result<(), SchedulerError> {
        self.push(message);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum NoteRelease {
    /// Lines are released by their own release events.
    Explicit,
    /// Every attack schedules its own release this fraction of a beat later.
    HoldFraction(f64),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetConfig {
    pub note_release: NoteRelease,
    pub line_overrides: BTreeMap<u32, NoteRelease>,
    pub gate_hold_fraction: f64,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            note_release: NoteRelease::HoldFraction(DEFAULT_HOLD_FRACTION),
            line_overrides: BTreeMap::new(),
            gate_hold_fraction: DEFAULT_HOLD_FRACTION,
        }
    }
}

impl TargetConfig {
    pub fn explicit_notes() -> Self {
        Self {
            note_release: NoteRelease::Explicit,
            ..Self::default()
        }
    }

    pub fn note_release_for(&self, line_index: u32) -> NoteRelease {
        self.line_overrides
            .get(&line_index)
            .copied()
            .unwrap_or(self.note_release)
    }
}

/// Turns payloads into timestamped realtime commands, one handler per
/// payload variant, and records every armed command for cancellation.
pub struct Dispatcher<'a, S: CommandSink + ?Sized> {
    sink: &'a mut S,
    targets: &'a TargetConfig,
    generation: u64,
}

impl<'a, S: CommandSink + ?Sized> Dispatcher<'a, S> {
    pub fn new(sink: &'a mut S, targets: &'a TargetConfig, generation: u64) -> Self {
        Self {
            sink,
            targets,
            generation,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn dispatch(
        &mut self,
        registry: &mut CancellationRegistry,
        payload: &EventPayload,
        time: f64,
        bpm: f64,
    ) -> Result<(), SchedulerError> {
        match *payload {
            EventPayload::NoteEvent {
                is_attack,
                line_index,
            } => self.note(registry, is_attack, line_index, time, bpm),
            EventPayload::SampleEvent { voice_index } => self.sample(registry, voice_index, time),
            EventPayload::GateEvent { gate_index } => {
                let hold = seconds_per_beat(bpm) * self.targets.gate_hold_fraction;
                self.schedule(
                    registry,
                    time,
                    Action::SetGate {
                        gate: gate_index,
                        value: 1.0,
                    },
                )?;
                self.schedule(
                    registry,
                    time + hold,
                    Action::SetGate {
                        gate: gate_index,
                        value: 0.0,
                    },
                )?;
                Ok(())
            }
            EventPayload::MidiEvent {
                synth_index,
                note,
                velocity,
                hold_beats,
            } => {
                self.schedule(
                    registry,
                    time,
                    Action::MidiAttack {
                        synth_index,
                        note,
                        velocity,
                    },
                )?;
                let release_time = time + hold_beats.max(0.0) * seconds_per_beat(bpm);
                self.schedule(
                    registry,
                    release_time,
                    Action::MidiRelease { synth_index, note },
                )?;
                Ok(())
            }
        }
    }

    fn note(
        &mut self,
        registry: &mut CancellationRegistry,
        is_attack: bool,
        line_index: u32,
        time: f64,
        bpm: f64,
    ) -> Result<(), SchedulerError> {
        if !is_attack {
            self.schedule(registry, time, Action::NoteOff { line_index })?;
            return Ok(());
        }

        self.schedule(registry, time, Action::NoteOn { line_index })?;
        if let NoteRelease::HoldFraction(fraction) = self.targets.note_release_for(line_index) {
            let hold = seconds_per_beat(bpm) * fraction;
            self.schedule(registry, time + hold, Action::NoteOff { line_index })?;
        }
        Ok(())
    }

    fn sample(
        &mut self,
        registry: &mut CancellationRegistry,
        voice_index: u32,
        time: f64,
    ) -> Result<(), SchedulerError> {
        self.schedule(registry, time, Action::StartSample { voice_index })?;
        Ok(())
    }

    fn schedule(
        &mut self,
        registry: &mut CancellationRegistry,
        time: f64,
        action: Action,
    ) -> Result<Handle, SchedulerError> {
        let handle = Handle::next();
        let transition = action.transition();
        self.sink.send(RealtimeMessage::Schedule(TimedCommand {
            handle,
            time,
            generation: self.generation,
            action,
        }))?;
        registry.track_command(handle, time, transition);
        Ok(handle)
    }

    /// Switches `target` off at `time` without tracking the command.
    pub fn release(&mut self, target: TargetId, time: f64) -> Result<(), SchedulerError> {
        self.sink.send(RealtimeMessage::Schedule(TimedCommand {
            handle: Handle::next(),
            time,
            generation: self.generation,
            action: Action::release(target),
        }))
    }

    pub fn cancel(&mut self, handle: Handle) -> Result<(), SchedulerError> {
        self.sink.send(RealtimeMessage::Cancel(handle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::GateTarget;

    fn scheduled(messages: &[RealtimeMessage]) -> Vec<(f64, Action)> {
        messages
            .iter()
            .filter_map(|m| match m {
                RealtimeMessage::Schedule(cmd) => Some((cmd.time, cmd.action.clone())),
                RealtimeMessage::Cancel(_) => None,
            })
            .collect()
    }

    #[test]
    fn note_attack_schedules_held_release() {
        let mut sink: Vec<RealtimeMessage> = Vec::new();
        let targets = TargetConfig::default();
        let mut registry = CancellationRegistry::new();
        let mut dispatcher = Dispatcher::new(&mut sink, &targets, 1);

        let attack = EventPayload::NoteEvent {
            is_attack: true,
            line_index: 2,
        };
        dispatcher.dispatch(&mut registry, &attack, 4.0, 120.0).unwrap();

        let out = scheduled(&sink);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0], (4.0, Action::NoteOn { line_index: 2 }));
        assert_eq!(out[1].1, Action::NoteOff { line_index: 2 });
        assert!((out[1].0 - (4.0 + 0.5 * DEFAULT_HOLD_FRACTION)).abs() < 1e-9);
        assert_eq!(registry.pending_len(), 2);
    }

    #[test]
    fn explicit_lines_wait_for_their_release() {
        let mut sink: Vec<RealtimeMessage> = Vec::new();
        let mut targets = TargetConfig::default();
        targets.line_overrides.insert(5, NoteRelease::Explicit);
        let mut registry = CancellationRegistry::new();
        let mut dispatcher = Dispatcher::new(&mut sink, &targets, 1);

        let attack = EventPayload::NoteEvent {
            is_attack: true,
            line_index: 5,
        };
        dispatcher.dispatch(&mut registry, &attack, 0.0, 120.0).unwrap();
        assert_eq!(scheduled(&sink), vec![(0.0, Action::NoteOn { line_index: 5 })]);
    }

    #[test]
    fn gate_uses_value_automation() {
        let mut sink: Vec<RealtimeMessage> = Vec::new();
        let targets = TargetConfig::default();
        let mut registry = CancellationRegistry::new();
        let mut dispatcher = Dispatcher::new(&mut sink, &targets, 1);

        let gate = EventPayload::GateEvent {
            gate_index: GateTarget::Output(1),
        };
        dispatcher.dispatch(&mut registry, &gate, 1.0, 60.0).unwrap();

        let out = scheduled(&sink);
        assert_eq!(
            out[0],
            (
                1.0,
                Action::SetGate {
                    gate: GateTarget::Output(1),
                    value: 1.0
                }
            )
        );
        assert!((out[1].0 - 1.72).abs() < 1e-9);
    }

    #[test]
    fn midi_release_follows_hold_beats() {
        let mut sink: Vec<RealtimeMessage> = Vec::new();
        let targets = TargetConfig::default();
        let mut registry = CancellationRegistry::new();
        let mut dispatcher = Dispatcher::new(&mut sink, &targets, 1);

        let midi = EventPayload::MidiEvent {
            synth_index: 0,
            note: 64,
            velocity: 100,
            hold_beats: 2.0,
        };
        dispatcher.dispatch(&mut registry, &midi, 1.0, 120.0).unwrap();

        let out = scheduled(&sink);
        assert_eq!(
            out[1],
            (
                2.0,
                Action::MidiRelease {
                    synth_index: 0,
                    note: 64
                }
            )
        );
    }

    #[test]
    fn full_ring_buffer_is_reported() {
        use ringbuf::{HeapRb, traits::Split};

        let (mut producer, _consumer) = HeapRb::<RealtimeMessage>::new(1).split();
        let targets = TargetConfig::default();
        let mut registry = CancellationRegistry::new();
        let mut dispatcher = Dispatcher::new(&mut producer, &targets, 1);

        let attack = EventPayload::NoteEvent {
            is_attack: true,
            line_index: 0,
        };
        assert_eq!(
            dispatcher.dispatch(&mut registry, &attack, 0.0, 120.0),
            Err(SchedulerError::BufferFull)
        );
    }
}
