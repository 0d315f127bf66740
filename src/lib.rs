pub mod clock;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod events;
pub mod player;
pub mod realtime;
pub mod registry;
pub mod timing;

pub use clock::{AudioClock, BeatTiming, ClockSource, SteadyTempo};
pub use config::{ContentConfig, SessionConfig};
pub use dispatch::{CommandSink, NoteRelease, TargetConfig};
pub use engine::{EngineCommand, EngineHandle, EngineUpdate, spawn_engine};
pub use error::{ConfigError, SchedulerError};
pub use events::{Action, EventPayload, GateTarget, Handle, RealtimeMessage, ScheduledEvent, TargetId, TimedCommand};
pub use player::{PlaybackMode, Player};
pub use realtime::RealtimeQueue;
