use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::events::{EventPayload, ScheduledEvent};

/// Musical content the schedulers pull events from.
pub trait EventSource: Send {
    /// Appends the events with `beat_index <= beat < beat_index + 1`, in
    /// dispatch order. `processed_beats` counts the beats the session has
    /// already walked through, for content that repeats a fixed pattern.
    fn events_in_beat(&self, beat_index: i64, processed_beats: u64, out: &mut Vec<ScheduledEvent>);

    /// Beat of the last event, or `None` for content that never ends.
    fn end_beat(&self) -> Option<f64>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
    pub line_index: u32,
    pub start_beat: f64,
    pub duration_beats: f64,
}

/// Merges overlapping notes on the same line so a line is never attacked
/// twice without a release in between. Notes that merely touch are kept
/// apart so they re-trigger.
fn normalize_notes(notes: Vec<Note>) -> Vec<Note> {
    let mut by_line: BTreeMap<u32, Vec<Note>> = BTreeMap::new();
    for note in notes {
        if note.duration_beats > 0.0 && note.start_beat.is_finite() {
            by_line.entry(note.line_index).or_default().push(note);
        }
    }

    let mut result = Vec::new();

    for (_line, mut group) in by_line {
        group.sort_by(|a, b| a.start_beat.total_cmp(&b.start_beat));

        let mut notes = group.into_iter();
        let Some(mut current) = notes.next() else {
            continue;
        };

        for note in notes {
            let current_end = current.start_beat + current.duration_beats;
            let note_end = note.start_beat + note.duration_beats;

            if note.start_beat < current_end {
                current.duration_beats = current_end.max(note_end) - current.start_beat;
            } else {
                result.push(current);
                current = note;
            }
        }

        result.push(current);
    }

    result
}

/// A fixed list of events, as edited in a piano roll.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NoteTimeline {
    events: Vec<ScheduledEvent>,
}

impl NoteTimeline {
    pub fn from_notes(notes: Vec<Note>) -> Self {
        let mut events = Vec::new();
        for note in normalize_notes(notes) {
            events.push(ScheduledEvent::new(
                note.start_beat,
                EventPayload::NoteEvent {
                    is_attack: true,
                    line_index: note.line_index,
                },
            ));
            events.push(ScheduledEvent::new(
                note.start_beat + note.duration_beats,
                EventPayload::NoteEvent {
                    is_attack: false,
                    line_index: note.line_index,
                },
            ));
        }

        // Releases go first so a line that ends and restarts on the same
        // beat is re-triggered rather than cut off.
        events.sort_by(|a, b| {
            a.beat
                .total_cmp(&b.beat)
                .then(is_attack(&a.payload).cmp(&is_attack(&b.payload)))
        });
        Self { events }
    }

    /// Keeps the given order for events on the same beat.
    pub fn from_events(mut events: Vec<ScheduledEvent>) -> Self {
        events.retain(|e| e.beat.is_finite());
        events.sort_by(|a, b| a.beat.total_cmp(&b.beat));
        Self { events }
    }

    pub fn events(&self) -> &[ScheduledEvent] {
        &self.events
    }
}

fn is_attack(payload: &EventPayload) -> bool {
    matches!(payload, EventPayload::NoteEvent { is_attack: true, .. })
}

impl EventSource for NoteTimeline {
    fn events_in_beat(&self, beat_index: i64, _processed_beats: u64, out: &mut Vec<ScheduledEvent>) {
        let lo = beat_index as f64;
        let hi = lo + 1.0;
        let start = self.events.partition_point(|e| e.beat < lo);
        let end = self.events.partition_point(|e| e.beat < hi);
        out.extend_from_slice(&self.events[start..end]);
    }

    fn end_beat(&self) -> Option<f64> {
        self.events.last().map(|e| e.beat)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepMark {
    /// Replaces the voice's note number for MIDI voices.
    pub note: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepVoice {
    pub payload: EventPayload,
    pub marks: Vec<Option<StepMark>>,
}

/// Step-sequencer content: one step per beat, repeating forever. Voices fire
/// in registration order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepPattern {
    pub voices: Vec<StepVoice>,
}

impl EventSource for StepPattern {
    fn events_in_beat(&self, beat_index: i64, processed_beats: u64, out: &mut Vec<ScheduledEvent>) {
        for voice in &self.voices {
            if voice.marks.is_empty() {
                continue;
            }
            let step = (processed_beats % voice.marks.len() as u64) as usize;
            let Some(mark) = &voice.marks[step] else {
                continue;
            };

            let mut payload = voice.payload.clone();
            if let (EventPayload::MidiEvent { note, .. }, Some(mark_note)) = (&mut payload, mark.note)
            {
                *note = mark_note;
            }
            out.push(ScheduledEvent::new(beat_index as f64, payload));
        }
    }

    fn end_beat(&self) -> Option<f64> {
        None
    }
}

/// Clicks a sample voice on every beat.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Metronome {
    pub voice_index: u32,
}

impl EventSource for Metronome {
    fn events_in_beat(&self, beat_index: i64, _processed_beats: u64, out: &mut Vec<ScheduledEvent>) {
        out.push(ScheduledEvent::new(
            beat_index as f64,
            EventPayload::SampleEvent {
                voice_index: self.voice_index,
            },
        ));
    }

    fn end_beat(&self) -> Option<f64> {
        None
    }
}
