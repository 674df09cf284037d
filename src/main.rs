//! bt-engine - command line entry point
//!
//! Adds one task for the given torrent or magnet link, runs it to an end
//! state and renders progress from the engine's events.

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use bt_engine::{
    CliArgs, DownloadStats, Downloader, Engine, EngineConfig, EngineEvent, EventSink, ProgressDisplay, Protocol,
    TaskRepository, TaskStatus, TorrentParser,
};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// Set up panic handler for unexpected errors
fn setup_panic_handler() {
    std::panic::set_hook(Box::new(|panic_info| {
        let backtrace = std::backtrace::Backtrace::capture();
        if let Some(location) = panic_info.location() {
            error!("PANIC at {}:{}:{}", location.file(), location.line(), location.column());
        }
        let payload = panic_info.payload();
        if let Some(s) = payload.downcast_ref::<&str>() {
            error!("Panic message: {}", s);
        } else if let Some(s) = payload.downcast_ref::<String>() {
            error!("Panic message: {}", s);
        }
        error!("Backtrace:\n{:?}", backtrace);
    }));
}

/// `RUST_LOG` wins over the verbosity flags
fn init_logging(args: &CliArgs) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.log_level().to_string().to_lowercase()));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if args.is_verbose() {
        subscriber.pretty().init();
    } else {
        subscriber.compact().init();
    }
}

async fn load_config(args: &CliArgs) -> Result<EngineConfig> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::load(path).await?,
        None => EngineConfig::default(),
    };
    config.apply_args(args);
    config.validate().context("Invalid configuration")?;
    debug!("Effective config: {:?}", config);
    Ok(config)
}

async fn display_torrent_info(source: &str, progress: &ProgressDisplay) -> Result<()> {
    let Protocol::Torrent(path) = Protocol::detect(source)? else {
        progress.print_status(&format!("Magnet link: {}", source))?;
        return Ok(());
    };
    let metadata = TorrentParser::parse_file(Path::new(&path)).await?;
    progress.print_status(&format!(
        "{} | {} in {} file(s) | {} pieces of {} | {}",
        metadata.name,
        DownloadStats::format_bytes(metadata.total_size()),
        metadata.files.len(),
        metadata.piece_count(),
        DownloadStats::format_bytes(metadata.piece_length),
        metadata.info_hash,
    ))?;
    Ok(())
}

async fn sample_progress(engine: &Engine) -> Option<DownloadStats> {
    let info_hash = engine.torrents().info_hashes().await.into_iter().next()?;
    let session = engine.torrents().get(&info_hash).await?;
    Some(DownloadStats::sample(&session).await)
}

async fn run(args: CliArgs) -> Result<TaskStatus> {
    let config = load_config(&args).await?;
    let mut progress = ProgressDisplay::new(args.is_quiet());
    display_torrent_info(&args.source, &progress).await?;

    let (events_tx, mut events) = mpsc::unbounded_channel::<EngineEvent>();
    let sink: Arc<dyn EventSink> = Arc::new(events_tx);
    let repository = Arc::new(TaskRepository::load(config.task_file()).await?);
    let engine = Engine::start(config, sink).await?;
    let downloader = Arc::new(Downloader::new(Arc::clone(&engine), repository));

    let task = downloader.add(&args.source, Vec::new()).await?;
    progress.print_status(&format!("Task {} ({}) started", task.id, task.name))?;

    let mut handle = {
        let downloader = Arc::clone(&downloader);
        let id = task.id.clone();
        tokio::spawn(async move { downloader.run(&id).await })
    };

    let mut ticker = tokio::time::interval(Duration::from_millis(500));
    let mut previous = DownloadStats::default();
    let mut sampled_at = Instant::now();
    let status = loop {
        tokio::select! {
            finished = &mut handle => break finished??,
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted, pausing task {}", task.id);
                downloader.pause(&task.id).await?;
            }
            Some(event) = events.recv() => match event {
                EngineEvent::TaskFailed { task_id, cause } => progress.print_task_failed(&task_id, &cause)?,
                EngineEvent::PeerConnected { addr, .. } => debug!("Peer {} connected", addr),
                other => debug!("Event: {:?}", other),
            },
            _ = ticker.tick() => {
                if let Some(stats) = sample_progress(&engine).await {
                    let stats = stats.with_rates(&previous, sampled_at.elapsed());
                    progress.update(&stats)?;
                    previous = stats;
                    sampled_at = Instant::now();
                }
            }
        }
    };

    // events raced with the end of the run
    while let Ok(event) = events.try_recv() {
        if let EngineEvent::TaskFailed { task_id, cause } = event {
            progress.print_task_failed(&task_id, &cause)?;
        }
    }
    if status == TaskStatus::Completed {
        progress.print_complete(&previous)?;
    } else {
        progress.print_status(&format!("Task {} is {}", task.id, status))?;
    }

    engine.shutdown().await;
    Ok(status)
}

#[tokio::main]
async fn main() -> ExitCode {
    setup_panic_handler();
    let args = CliArgs::parse_args();
    init_logging(&args);
    info!("bt-engine starting");

    match run(args).await {
        Ok(TaskStatus::Completed) => ExitCode::SUCCESS,
        Ok(TaskStatus::Fail) => ExitCode::FAILURE,
        Ok(status) => {
            info!("Stopped with task {}", status);
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
