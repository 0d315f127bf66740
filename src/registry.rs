use crate::dispatch::{CommandSink, Dispatcher};
use crate::error::SchedulerError;
use crate::events::{Handle, TargetId};
use crate::timing::TimerQueue;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Copy)]
enum Pending {
    Command {
        due: f64,
        transition: Option<(TargetId, bool)>,
    },
    Timer {
        due: f64,
    },
}

/// What a teardown did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Teardown {
    pub cancelled: usize,
    pub released: usize,
}

/// Everything one session has armed, and which targets it has left on.
///
/// Commands are sent with future timestamps, so a target only counts as held
/// once its "on" command's time has passed. `prune` moves elapsed commands
/// out of the pending set and applies their on/off transitions in time order.
#[derive(Debug, Default)]
pub struct CancellationRegistry {
    pending: BTreeMap<Handle, Pending>,
    held: BTreeSet<TargetId>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track_command(&mut self, handle: Handle, due: f64, transition: Option<(TargetId, bool)>) {
        self.pending
            .insert(handle, Pending::Command { due, transition });
    }

    pub fn track_timer(&mut self, handle: Handle, due: f64) {
        self.pending.insert(handle, Pending::Timer { due });
    }

    /// Drops a timer that has fired.
    pub fn forget(&mut self, handle: Handle) {
        self.pending.remove(&handle);
    }

    /// Retires every command due at or before `now`. Returns how many were
    /// retired. Timers stay until they fire or are cancelled.
    pub fn prune(&mut self, now: f64) -> usize {
        let mut elapsed: Vec<(f64, Handle, Option<(TargetId, bool)>)> = self
            .pending
            .iter()
            .filter_map(|(handle, pending)| match *pending {
                Pending::Command { due, transition } if due <= now => {
                    Some((due, *handle, transition))
                }
                _ => None,
            })
            .collect();
        elapsed.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));

        for (_, handle, transition) in &elapsed {
            self.pending.remove(handle);
            match transition {
                Some((target, true)) => {
                    self.held.insert(*target);
                }
                Some((target, false)) => {
                    self.held.remove(target);
                }
                None => {}
            }
        }
        elapsed.len()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn held_targets(&self) -> impl Iterator<Item = &TargetId> {
        self.held.iter()
    }

    pub fn is_held(&self, target: &TargetId) -> bool {
        self.held.contains(target)
    }

    /// Cancels everything still armed and releases every held target at
    /// `now`. Leaves the registry empty even if the sink rejects a message;
    /// the first such error is returned.
    pub fn cancel_all<S, W>(
        &mut self,
        now: f64,
        dispatcher: &mut Dispatcher<'_, S>,
        timers: &mut TimerQueue<W>,
    ) -> Result<Teardown, SchedulerError>
    where
        S: CommandSink + ?Sized,
    {
        self.prune(now);

        let mut first_error = None;
        let mut teardown = Teardown::default();

        for (handle, pending) in std::mem::take(&mut self.pending) {
            match pending {
                Pending::Timer { .. } => {
                    timers.cancel(handle);
                }
                Pending::Command { .. } => {
                    if let Err(e) = dispatcher.cancel(handle) {
                        first_error.get_or_insert(e);
                    }
                }
            }
            teardown.cancelled += 1;
        }

        for target in std::mem::take(&mut self.held) {
            tracing::debug!(?target, at = now, "releasing held target");
            if let Err(e) = dispatcher.release(target, now) {
                first_error.get_or_insert(e);
            }
            teardown.released += 1;
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(teardown),
        }
    }
}
