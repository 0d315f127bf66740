mod looping;
mod scheduler;
mod sequence;
mod timers;

pub use looping::{LoopPlaybackController, LoopSession, LoopState, MAX_REARM_MARGIN, rearm_margin};
pub use scheduler::{LookaheadScheduler, SchedulerConfig, SchedulerSession, SchedulingWindow};
pub use sequence::{EventSource, Metronome, Note, NoteTimeline, StepMark, StepPattern, StepVoice};
pub use timers::{TimerQueue, Wake, WakeKind};
