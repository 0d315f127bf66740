use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SchedulerError {
    #[error("loop length must be a positive number of beats, got {0}")]
    InvalidLoopLength(f64),
    #[error("cannot change the loop point while playing; stop playback first")]
    LoopPointWhilePlaying,
    #[error("playback is already running")]
    AlreadyPlaying,
    #[error("requested start time {requested}s is before the current clock time {now}s")]
    StartInPast { requested: f64, now: f64 },
    #[error("tempo must be a positive number of beats per minute, got {0}")]
    InvalidTempo(f64),
    #[error("realtime command buffer is full")]
    BufferFull,
    #[error("invalid scheduler configuration: {0}")]
    InvalidConfig(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to access session file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse session file: {0}")]
    Parse(#[from] ron::error::SpannedError),
    #[error("failed to serialize session: {0}")]
    Serialize(#[from] ron::Error),
    #[error("invalid session configuration: {0}")]
    Invalid(String),
}
