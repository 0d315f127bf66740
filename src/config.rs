use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::sync::Arc;

use crate::clock::{AudioClock, ClockSource, SteadyTempo};
use crate::dispatch::{CommandSink, NoteRelease, TargetConfig};
use crate::error::ConfigError;
use crate::events::{EventPayload, GateTarget};
use crate::player::Player;
use crate::timing::{EventSource, Note, NoteTimeline, SchedulerConfig, StepMark, StepPattern, StepVoice};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ContentConfig {
    /// Piano-roll notes.
    Notes(Vec<Note>),
    /// Step-sequencer voices.
    Steps(StepPattern),
}

impl ContentConfig {
    pub fn build(&self) -> Box<dyn EventSource> {
        match self {
            ContentConfig::Notes(notes) => Box::new(NoteTimeline::from_notes(notes.clone())),
            ContentConfig::Steps(pattern) => Box::new(pattern.clone()),
        }
    }
}

impl Default for ContentConfig {
    fn default() -> Self {
        ContentConfig::Notes(Vec::new())
    }
}

fn default_bpm() -> f64 {
    120.0
}

fn default_sample_rate() -> u32 {
    48_000
}

fn default_poll_interval() -> f64 {
    3.2
}

fn default_lookahead_factor() -> f64 {
    3.0
}

/// A playback session as stored on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub name: String,
    #[serde(default = "default_bpm")]
    pub bpm: f64,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: f64,
    #[serde(default = "default_lookahead_factor")]
    pub lookahead_factor: f64,
    #[serde(default)]
    pub targets: TargetConfig,
    #[serde(default)]
    pub loop_point: Option<f64>,
    #[serde(default)]
    pub cursor_beats: f64,
    /// Sample voice clicked on every beat.
    #[serde(default)]
    pub metronome: Option<u32>,
    #[serde(default)]
    pub content: ContentConfig,
}

impl SessionConfig {
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let ron_string = ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())?;
        fs::write(path, ron_string)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let ron_string = fs::read_to_string(path)?;
        let session: SessionConfig = ron::from_str(&ron_string)?;
        session.validate()?;
        tracing::debug!(name = %session.name, path = %path.display(), "session loaded");
        Ok(session)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        fn positive(name: &str, value: f64) -> Result<(), ConfigError> {
            if value.is_finite() && value > 0.0 {
                Ok(())
            } else {
                Err(ConfigError::Invalid(format!("{name} must be positive, got {value}")))
            }
        }
        fn fraction(name: &str, value: f64) -> Result<(), ConfigError> {
            if value > 0.0 && value <= 1.0 {
                Ok(())
            } else {
                Err(ConfigError::Invalid(format!("{name} must be in (0, 1], got {value}")))
            }
        }

        positive("bpm", self.bpm)?;
        self.scheduler_config()
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        if self.sample_rate == 0 {
            return Err(ConfigError::Invalid("sample_rate must be positive".into()));
        }
        if let Some(loop_point) = self.loop_point {
            positive("loop_point", loop_point)?;
        }
        if !self.cursor_beats.is_finite() || self.cursor_beats < 0.0 {
            return Err(ConfigError::Invalid(format!(
                "cursor_beats must be a non-negative beat, got {}",
                self.cursor_beats
            )));
        }

        fraction("gate_hold_fraction", self.targets.gate_hold_fraction)?;
        let releases = std::iter::once(&self.targets.note_release).chain(self.targets.line_overrides.values());
        for release in releases {
            if let NoteRelease::HoldFraction(f) = *release {
                fraction("note hold fraction", f)?;
            }
        }
        Ok(())
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            poll_interval: self.poll_interval_secs,
            lookahead_factor: self.lookahead_factor,
        }
    }

    pub fn clock(&self) -> Result<Arc<AudioClock>, ConfigError> {
        AudioClock::new(f64::from(self.sample_rate), self.bpm)
            .map(Arc::new)
            .map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    /// A stopped player for this session, with the loop point and cursor
    /// already applied.
    pub fn build_player<S: CommandSink>(
        &self,
        clock: Arc<dyn ClockSource>,
        sink: S,
    ) -> Result<Player<S>, ConfigError> {
        self.validate()?;
        let mut player = Player::new(
            clock,
            Arc::new(SteadyTempo),
            self.scheduler_config(),
            self.targets.clone(),
            self.content.build(),
            sink,
        )
        .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        player.set_metronome(self.metronome);
        player
            .set_loop_point(self.loop_point)
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        player
            .set_cursor_beats(self.cursor_beats)
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        Ok(player)
    }

    /// Four beats of kick, hat and a gate on the off-beat, looped.
    pub fn demo() -> Self {
        let mark = || Some(StepMark::default());
        Self {
            name: "demo".into(),
            bpm: default_bpm(),
            sample_rate: default_sample_rate(),
            poll_interval_secs: 0.25,
            lookahead_factor: default_lookahead_factor(),
            targets: TargetConfig::default(),
            loop_point: Some(4.0),
            cursor_beats: 0.0,
            metronome: None,
            content: ContentConfig::Steps(StepPattern {
                voices: vec![
                    StepVoice {
                        payload: EventPayload::SampleEvent { voice_index: 0 },
                        marks: vec![mark(), None, mark(), None],
                    },
                    StepVoice {
                        payload: EventPayload::SampleEvent { voice_index: 1 },
                        marks: vec![mark(), mark(), mark(), mark()],
                    },
                    StepVoice {
                        payload: EventPayload::GateEvent {
                            gate_index: GateTarget::Output(0),
                        },
                        marks: vec![None, mark(), None, mark()],
                    },
                    StepVoice {
                        payload: EventPayload::MidiEvent {
                            synth_index: 0,
                            note: 48,
                            velocity: 100,
                            hold_beats: 0.5,
                        },
                        marks: vec![
                            Some(StepMark { note: Some(48) }),
                            None,
                            Some(StepMark { note: Some(55) }),
                            None,
                        ],
                    },
                ],
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RealtimeMessage;

    #[test]
    fn demo_is_valid() {
        SessionConfig::demo().validate().unwrap();
    }

    #[test]
    fn minimal_file_uses_defaults() {
        let session: SessionConfig = ron::from_str("(name: \"empty\")").unwrap();
        assert_eq!(session.bpm, 120.0);
        assert_eq!(session.poll_interval_secs, 3.2);
        assert_eq!(session.lookahead_factor, 3.0);
        assert_eq!(session.targets, TargetConfig::default());
        assert_eq!(session.loop_point, None);
        assert_eq!(session.content, ContentConfig::Notes(Vec::new()));
    }

    #[test]
    fn rejects_bad_values() {
        let mut session = SessionConfig::demo();
        session.loop_point = Some(0.0);
        assert!(matches!(session.validate(), Err(ConfigError::Invalid(_))));

        let mut session = SessionConfig::demo();
        session.targets.gate_hold_fraction = 1.5;
        assert!(matches!(session.validate(), Err(ConfigError::Invalid(_))));

        let mut session = SessionConfig::demo();
        session.bpm = -1.0;
        assert!(matches!(session.validate(), Err(ConfigError::Invalid(_))));

        let mut session = SessionConfig::demo();
        session.poll_interval_secs = 0.0;
        assert!(matches!(session.validate(), Err(ConfigError::Invalid(_))));
        let clock = session.clock().unwrap();
        assert!(session.build_player(clock, Vec::<RealtimeMessage>::new()).is_err());
    }

    #[test]
    fn save_then_load() {
        let dir = std::env::temp_dir().join(format!("beatline-config-{}", std::process::id()));
        let path = dir.join("session.ron");
        let session = SessionConfig::demo();
        session.save(&path).unwrap();
        assert_eq!(SessionConfig::load(&path).unwrap(), session);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn unparsable_file_is_a_parse_error() {
        let path = std::env::temp_dir().join(format!("beatline-bad-{}.ron", std::process::id()));
        fs::write(&path, "(name: ").unwrap();
        assert!(matches!(SessionConfig::load(&path), Err(ConfigError::Parse(_))));
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn builds_a_stopped_player() {
        let session = SessionConfig::demo();
        let clock = session.clock().unwrap();
        let player = session
            .build_player(clock, Vec::<RealtimeMessage>::new()).unwrap();
        assert!(!player.is_playing());
        assert_eq!(player.loop_point(), Some(4.0));
    }
}
