use beatline::{EngineCommand, EngineUpdate, RealtimeMessage, RealtimeQueue, SessionConfig, spawn_engine};
use ringbuf::HeapRb;
use ringbuf::traits::Split;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const BLOCK_FRAMES: u64 = 256;
const PLAY_SECONDS: u32 = 6;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let session = match std::env::args_os().nth(1) {
        Some(path) => SessionConfig::load(Path::new(&path))?,
        None => SessionConfig::demo(),
    };
    tracing::info!(name = %session.name, bpm = session.bpm, loop_point = ?session.loop_point, "session ready");

    let clock = session.clock()?;
    let (producer, mut consumer) = HeapRb::<RealtimeMessage>::new(4096).split();
    let player = session.build_player(clock.clone(), producer)?;

    // Stands in for the audio callback: renders fixed blocks in real time.
    let running = Arc::new(AtomicBool::new(true));
    let running_audio = running.clone();
    let clock_audio = clock.clone();
    let block_duration = Duration::from_secs_f64(BLOCK_FRAMES as f64 / clock.sample_rate());
    let audio = std::thread::spawn(move || {
        let mut queue = RealtimeQueue::with_capacity(1024);
        let mut fired = Vec::with_capacity(64);
        while running_audio.load(Ordering::Acquire) {
            queue.process_block(&mut consumer, &clock_audio, BLOCK_FRAMES, &mut fired);
            for (frame, command) in fired.drain(..) {
                tracing::info!(
                    time = format_args!("{:.3}", command.time),
                    frame,
                    generation = command.generation,
                    action = ?command.action,
                    "fired"
                );
            }
            std::thread::sleep(block_duration);
        }
    });

    let engine = spawn_engine(player);
    engine.send(EngineCommand::Play { cursor_beats: None });

    for _ in 0..PLAY_SECONDS {
        std::thread::sleep(Duration::from_secs(1));
        engine.send(EngineCommand::QueryCursor);
        for update in engine.update_rx.try_iter() {
            match update {
                EngineUpdate::Error { message } => tracing::warn!(%message, "engine error"),
                other => tracing::info!(update = ?other, "engine"),
            }
        }
    }

    engine.send(EngineCommand::Stop);
    engine.shutdown();

    // Let the forced releases reach the audio side.
    std::thread::sleep(Duration::from_millis(100));
    running.store(false, Ordering::Release);
    if audio.join().is_err() {
        tracing::warn!("audio thread panicked");
    }
    Ok(())
}
