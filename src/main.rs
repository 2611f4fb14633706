//! Layerdeck - a pocket multi-track recorder
//!
//! This is the command-line entry point driving the engine.

mod cli;
mod tokio_runtime;

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::info;
use std::sync::Arc;
use std::time::Duration;

use layerdeck::audio::{select_backend, split_file, AudioBackend, StopOutcome};
use layerdeck::models::total_duration_ms;
use layerdeck::settings::{DconfPreferences, JsonPreferences, Preferences};
use layerdeck::state::{AudioStorage, JsonTrackStore, RecordingsDir, TrackStore};
use layerdeck::{Engine, EngineConfig, EngineError};

use cli::{Args, Command};

/// How often the overdub loop polls the engine
const POLL_INTERVAL: Duration = Duration::from_millis(100);

fn main() -> Result<()> {
    // Parse command-line arguments and initialize logging
    let args = Args::parse();
    cli::init_logging(&args);

    info!("Starting Layerdeck");

    let mut config = match &args.config {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => EngineConfig::default(),
    };
    if let Some(dir) = &args.recordings_dir {
        config.recordings_dir = dir.clone();
    }

    match &args.command {
        Command::Split {
            file,
            boundaries_ms,
            out,
        } => {
            let out_dir = out
                .clone()
                .or_else(|| file.parent().map(|p| p.to_path_buf()))
                .unwrap_or_default();
            for path in split_file(file, boundaries_ms, &out_dir)? {
                println!("{}", path.display());
            }
            Ok(())
        }
        Command::Tracks { project } => list_tracks(project),
        _ => run_engine(&args, config),
    }
}

fn preferences(args: &Args) -> Result<Box<dyn Preferences>> {
    let prefs: Box<dyn Preferences> = match &args.prefs_file {
        Some(path) => Box::new(JsonPreferences::open(path)?),
        None => Box::new(DconfPreferences::new()),
    };
    Ok(prefs)
}

fn list_tracks(project: &std::path::Path) -> Result<()> {
    let store = JsonTrackStore::open(project)?;
    let tracks = store.list();
    for track in &tracks {
        println!(
            "{:>3}  {}  {:>8}ms..{:>8}ms  trim {}/{}ms{}  vol {:.2}  {}",
            track.display_order,
            track.id,
            track.offset_ms,
            track.end_ms(),
            track.trim_start_ms,
            track.trim_end_ms,
            if track.muted { "  muted" } else { "" },
            track.volume,
            track.audio_ref
        );
    }
    println!("timeline: {}ms", total_duration_ms(&tracks));
    Ok(())
}

fn run_engine(args: &Args, config: EngineConfig) -> Result<()> {
    let runtime = tokio_runtime::build()?;
    let backend: Arc<dyn AudioBackend> = select_backend(args.backend)?;
    let storage = RecordingsDir::new(&config.recordings_dir);

    let prefs = preferences(args)?;
    let mut engine = Engine::initialize(config, backend, prefs, runtime.handle().clone())
        .context("initializing audio engine")?;

    let result = runtime.block_on(dispatch(args, &mut engine, &storage));
    engine.shutdown();
    result
}

async fn dispatch(args: &Args, engine: &mut Engine, storage: &RecordingsDir) -> Result<()> {
    match &args.command {
        Command::Record { seconds } => {
            let path = engine.start_recording(storage).await?;
            println!("recording to {}", path.display());
            tokio::time::sleep(Duration::from_secs(*seconds)).await;
            match engine.stop_recording()? {
                StopOutcome::Captured(take) => {
                    println!("{} ({}ms)", take.path.display(), take.duration_ms)
                }
                _ => println!("nothing captured"),
            }
        }
        Command::Overdub {
            project,
            seconds,
            from_ms,
        } => overdub(engine, storage, project, *seconds, *from_ms).await?,
        Command::Latency => {
            let diagnostics = engine.latency_diagnostics();
            println!("{}", serde_json::to_string_pretty(&diagnostics)?);
        }
        Command::Offset { offset_ms } => {
            let stored = engine.set_manual_offset_ms(*offset_ms)?;
            println!("manual latency offset: {}ms", stored);
        }
        Command::Split { .. } | Command::Tracks { .. } => {}
    }
    Ok(())
}

async fn overdub(
    engine: &mut Engine,
    storage: &RecordingsDir,
    project: &std::path::Path,
    seconds: u64,
    from_ms: i64,
) -> Result<()> {
    let mut store = JsonTrackStore::open(project)?;
    engine.prepare(&store.list(), storage)?;
    engine.seek_to(from_ms);

    let diagnostics = engine.start_overdub(storage).await?;
    println!(
        "overdubbing over {} tracks, compensation {}ms",
        store.list().len(),
        diagnostics.compensation_ms
    );

    let deadline = tokio::time::Instant::now() + Duration::from_secs(seconds);
    while tokio::time::Instant::now() < deadline {
        tokio::time::sleep(POLL_INTERVAL).await;
        match engine.poll(&mut store, storage) {
            Ok(()) => {}
            Err(EngineError::StreamInterrupted { reason, salvaged }) => {
                match salvaged {
                    Some(path) => println!("salvaged partial take {}", path.display()),
                    None => println!("nothing salvaged"),
                }
                bail!("input stream interrupted: {}", reason);
            }
            Err(e) => return Err(e.into()),
        }
        let snapshot = engine.snapshot();
        log::debug!(
            "at {}ms, recorded {}ms, peak {:.2}",
            snapshot.position_ms,
            snapshot.recorded_ms,
            snapshot.peak
        );
    }

    match engine.stop_overdub(&mut store, storage)? {
        Some(track) => println!(
            "added track {} at {}ms ({}ms trimmed) -> {}",
            track.id,
            track.offset_ms,
            track.trim_start_ms,
            storage.resolve(&track.audio_ref)?.display()
        ),
        None => println!("nothing captured"),
    }
    Ok(())
}
