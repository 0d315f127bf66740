use crate::clock::ClockSource;
use crate::dispatch::CommandSink;
use crate::player::Player;
use crossbeam::channel::{Receiver, RecvTimeoutError, Sender};
use std::thread::JoinHandle;
use std::time::Duration;

/// Longest the engine sleeps before re-checking the clock. The audio clock
/// only moves while the audio thread runs, so a wake is never slept past by
/// more than this.
const MAX_SLEEP: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq)]
pub enum EngineCommand {
    /// Starts from `cursor_beats`, or from the remembered cursor. Restarts
    /// if already playing.
    Play { cursor_beats: Option<f64> },
    Stop,
    SetLoopPoint(Option<f64>),
    SetCursor(f64),
    QueryCursor,
    Shutdown,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EngineUpdate {
    PlaybackState { playing: bool, generation: u64 },
    Cursor { beats: f64 },
    Error { message: String },
}

pub struct EngineHandle {
    pub command_tx: Sender<EngineCommand>,
    pub update_rx: Receiver<EngineUpdate>,
    thread: Option<JoinHandle<()>>,
}

impl EngineHandle {
    pub fn send(&self, command: EngineCommand) {
        if self.command_tx.send(command).is_err() {
            tracing::warn!("engine thread has exited; command dropped");
        }
    }

    /// Stops playback and waits for the engine thread to exit.
    pub fn shutdown(mut self) {
        let _ = self.command_tx.send(EngineCommand::Shutdown);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::warn!("engine thread panicked");
            }
        }
    }
}

/// Runs `player` on its own thread, polling it whenever a wake comes due.
pub fn spawn_engine<S>(player: Player<S>) -> EngineHandle
where
    S: CommandSink + Send + 'static,
{
    let (command_tx, command_rx) = crossbeam::channel::unbounded();
    let (update_tx, update_rx) = crossbeam::channel::unbounded();

    let thread = std::thread::Builder::new()
        .name("beatline-engine".into())
        .spawn(move || engine_thread(player, command_rx, update_tx));

    let thread = match thread {
        Ok(thread) => Some(thread),
        Err(e) => {
            tracing::warn!(error = %e, "failed to spawn engine thread");
            None
        }
    };

    EngineHandle {
        command_tx,
        update_rx,
        thread,
    }
}

fn engine_thread<S: CommandSink>(
    mut player: Player<S>,
    command_rx: Receiver<EngineCommand>,
    update_tx: Sender<EngineUpdate>,
) {
    tracing::debug!("engine thread started");

    loop {
        let command = match player.next_wake_time() {
            Some(due) => {
                let wait = (due - player.clock().now()).max(0.0);
                let wait = Duration::from_secs_f64(wait).min(MAX_SLEEP);
                match command_rx.recv_timeout(wait) {
                    Ok(command) => Some(command),
                    Err(RecvTimeoutError::Timeout) => None,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            None => match command_rx.recv() {
                Ok(command) => Some(command),
                Err(crossbeam::channel::RecvError) => break,
            },
        };

        if let Some(command) = command {
            if command == EngineCommand::Shutdown {
                break;
            }
            handle_command(&mut player, command, &update_tx);
        }

        if let Err(e) = player.poll() {
            let _ = update_tx.send(EngineUpdate::Error {
                message: format!("Playback stopped: {}", e),
            });
            send_state(&player, &update_tx);
        }
    }

    if let Err(e) = player.stop_playback() {
        tracing::warn!(error = %e, "stop on shutdown was incomplete");
    }
    tracing::debug!("engine thread exiting");
}

fn handle_command<S: CommandSink>(
    player: &mut Player<S>,
    command: EngineCommand,
    update_tx: &Sender<EngineUpdate>,
) {
    let result = match command {
        EngineCommand::Play { cursor_beats } => {
            let stopped = player.stop_playback();
            let started = match cursor_beats {
                Some(beats) => player.start_playback(beats),
                None => player.resume_playback(),
            };
            let result = stopped.and(started);
            send_state(player, update_tx);
            result
        }
        EngineCommand::Stop => {
            let result = player.stop_playback();
            send_state(player, update_tx);
            result
        }
        EngineCommand::SetLoopPoint(loop_point) => player.set_loop_point(loop_point),
        EngineCommand::SetCursor(beats) => {
            let result = player.set_cursor_beats(beats);
            let _ = update_tx.send(EngineUpdate::Cursor {
                beats: player.get_cursor_beats(),
            });
            result
        }
        EngineCommand::QueryCursor => {
            let _ = update_tx.send(EngineUpdate::Cursor {
                beats: player.get_cursor_beats(),
            });
            Ok(())
        }
        EngineCommand::Shutdown => Ok(()),
    };

    if let Err(e) = result {
        let _ = update_tx.send(EngineUpdate::Error {
            message: e.to_string(),
        });
    }
}

fn send_state<S: CommandSink>(player: &Player<S>, update_tx: &Sender<EngineUpdate>) {
    let _ = update_tx.send(EngineUpdate::PlaybackState {
        playing: player.is_playing(),
        generation: player.generation(),
    });
}
