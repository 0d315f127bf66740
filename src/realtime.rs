use ringbuf::HeapCons;
use ringbuf::traits::Consumer;

use crate::clock::AudioClock;
use crate::events::{Handle, RealtimeMessage, TimedCommand};

/// The audio thread's side of the command ring buffer.
///
/// Commands arrive ahead of time and wait here, ordered by time, until the
/// buffer that contains them is rendered. A `Cancel` drops a waiting command
/// for good.
#[derive(Debug, Default)]
pub struct RealtimeQueue {
    pending: Vec<TimedCommand>,
}

impl RealtimeQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            pending: Vec::with_capacity(capacity),
        }
    }

    pub fn receive(&mut self, message: RealtimeMessage) {
        match message {
            RealtimeMessage::Schedule(command) => {
                let key = (command.time, command.handle);
                let idx = self
                    .pending
                    .partition_point(|c| c.time.total_cmp(&key.0).then(c.handle.cmp(&key.1)).is_lt());
                self.pending.insert(idx, command);
            }
            RealtimeMessage::Cancel(handle) => self.cancel(handle),
        }
    }

    fn cancel(&mut self, handle: Handle) {
        if let Some(idx) = self.pending.iter().position(|c| c.handle == handle) {
            self.pending.remove(idx);
        }
    }

    /// Moves everything waiting in the ring buffer into the queue.
    pub fn pump(&mut self, consumer: &mut HeapCons<RealtimeMessage>) -> usize {
        let mut received = 0;
        while let Some(message) = consumer.try_pop() {
            self.receive(message);
            received += 1;
        }
        received
    }

    /// Moves every command due before `until` into `out`, in time order.
    pub fn drain_due(&mut self, until: f64, out: &mut Vec<TimedCommand>) -> usize {
        let due = self.pending.partition_point(|c| c.time < until);
        out.extend(self.pending.drain(..due));
        due
    }

    /// One audio callback: advances the clock past the next `num_frames`
    /// frames, then collects the commands that land inside them, paired with
    /// their frame offset in the buffer.
    ///
    /// The clock moves before the ring buffer is read. A stop that sees the
    /// old clock time has its cancels read in this block; one that sees the
    /// new time already counts this block's commands as played and releases
    /// what they turn on.
    pub fn process_block(
        &mut self,
        consumer: &mut HeapCons<RealtimeMessage>,
        clock: &AudioClock,
        num_frames: u64,
        fired: &mut Vec<(usize, TimedCommand)>,
    ) {
        let sample_rate = clock.sample_rate();
        let current_frame = clock.frames();
        let buffer_end = current_frame + num_frames;
        clock.advance(num_frames);

        self.pump(consumer);
        let mut due = Vec::new();
        self.drain_due(buffer_end as f64 / sample_rate, &mut due);
        fired.extend(due.into_iter().map(|command| {
            let frame = ((command.time * sample_rate).round().max(0.0) as u64)
                .saturating_sub(current_frame)
                .min(num_frames.saturating_sub(1));
            (frame as usize, command)
        }));
    }

    pub fn next_due(&self) -> Option<f64> {
        self.pending.first().map(|c| c.time)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
