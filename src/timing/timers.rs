use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::events::Handle;

/// Why a timer was armed. The generation is the playback generation that
/// armed it; a wake from an older generation is ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Wake {
    pub generation: u64,
    pub kind: WakeKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeKind {
    /// Poll the lookahead scheduler.
    Tick,
    /// Poll the metronome's lookahead session.
    Metronome,
    /// Dispatch loop iteration `n`.
    LoopIteration(u64),
}

#[derive(Debug)]
struct Timer<W> {
    due: f64,
    handle: Handle,
    wake: W,
}

impl<W> PartialEq for Timer<W> {
    fn eq(&self, other: &Timer<W>) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<W> Eq for Timer<W> {}

impl<W> PartialOrd for Timer<W> {
    fn partial_cmp(&self, other: &Timer<W>) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<W> Ord for Timer<W> {
    /// Reversed so the heap's top is the earliest timer. Handles are issued
    /// in order, so ties go to the timer armed first.
    fn cmp(&self, other: &Timer<W>) -> Ordering {
        self.due
            .total_cmp(&other.due)
            .then(self.handle.cmp(&other.handle))
            .reverse()
    }
}

/// Future wake-ups keyed by audio-clock time.
///
/// This holds no callbacks: the host pops due entries and hands them back to
/// the player, which keeps the scheduling logic independent of any timer API.
#[derive(Debug)]
pub struct TimerQueue<W> {
    timers: BinaryHeap<Timer<W>>,
}

impl<W> Default for TimerQueue<W> {
    fn default() -> Self {
        Self {
            timers: BinaryHeap::new(),
        }
    }
}

impl<W> TimerQueue<W> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arm(&mut self, handle: Handle, due: f64, wake: W) {
        self.timers.push(Timer { due, handle, wake });
    }

    pub fn cancel(&mut self, handle: Handle) -> bool {
        let before = self.timers.len();
        self.timers.retain(|timer| timer.handle != handle);
        self.timers.len() != before
    }

    pub fn next_due(&self) -> Option<f64> {
        self.timers.peek().map(|timer| timer.due)
    }

    /// Removes and returns the earliest timer due at or before `now`.
    pub fn pop_due(&mut self, now: f64) -> Option<(Handle, W)> {
        if self.timers.peek()?.due > now {
            return None;
        }
        self.timers.pop().map(|timer| (timer.handle, timer.wake))
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }
}
