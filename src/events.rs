use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// An event on the musical timeline. `beat` is logical time, never seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledEvent {
    pub beat: f64,
    pub payload: EventPayload,
}

impl ScheduledEvent {
    pub fn new(beat: f64, payload: EventPayload) -> Self {
        Self { beat, payload }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum GateTarget {
    Output(u32),
    /// The shared rising-edge utility output.
    RisingEdge,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EventPayload {
    NoteEvent {
        is_attack: bool,
        line_index: u32,
    },
    SampleEvent {
        voice_index: u32,
    },
    GateEvent {
        gate_index: GateTarget,
    },
    MidiEvent {
        synth_index: u32,
        note: u32,
        velocity: u8,
        hold_beats: f64,
    },
}

/// A logical sink that can be left "on" and must be released on stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TargetId {
    NoteLine(u32),
    Gate(GateTarget),
    Midi { synth_index: u32, note: u32 },
}

/// Identifies one armed command or timer so it can be cancelled.
///
/// Handles are unique for the whole process, so several players may share
/// one realtime queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Handle(u64);

static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

impl Handle {
    pub fn next() -> Self {
        Handle(NEXT_HANDLE.fetch_add(1, Ordering::Relaxed))
    }
}

/// What the realtime layer does when a command comes due.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    NoteOn { line_index: u32 },
    NoteOff { line_index: u32 },
    StartSample { voice_index: u32 },
    SetGate { gate: GateTarget, value: f32 },
    MidiAttack { synth_index: u32, note: u32, velocity: u8 },
    MidiRelease { synth_index: u32, note: u32 },
}

impl Action {
    /// The target this action switches on or off, if any.
    pub fn transition(&self) -> Option<(TargetId, bool)> {
        match *self {
            Action::NoteOn { line_index } => Some((TargetId::NoteLine(line_index), true)),
            Action::NoteOff { line_index } => Some((TargetId::NoteLine(line_index), false)),
            Action::StartSample { .. } => None,
            Action::SetGate { gate, value } => Some((TargetId::Gate(gate), value > 0.0)),
            Action::MidiAttack {
                synth_index, note, ..
            } => Some((TargetId::Midi { synth_index, note }, true)),
            Action::MidiRelease { synth_index, note } => {
                Some((TargetId::Midi { synth_index, note }, false))
            }
        }
    }

    /// The action that switches `target` off.
    pub fn release(target: TargetId) -> Self {
        match target {
            TargetId::NoteLine(line_index) => Action::NoteOff { line_index },
            TargetId::Gate(gate) => Action::SetGate { gate, value: 0.0 },
            TargetId::Midi { synth_index, note } => Action::MidiRelease { synth_index, note },
        }
    }
}

/// A command stamped with an absolute audio-clock time in seconds.
#[derive(Debug, Clone, PartialEq)]
pub struct TimedCommand {
    pub handle: Handle,
    pub time: f64,
    /// Playback generation that produced the command.
    pub generation: u64,
    pub action: Action,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RealtimeMessage {
    Schedule(TimedCommand),
    Cancel(Handle),
}
