//! Posture Agent CLI
//!
//! Privacy-first forward-head-posture tracker with resilient daily sync.

use chrono::Utc;
use clap::{Parser, Subcommand};
use posture_agent::{
    config::Config,
    core::{AngleComputer, LocalAggregator, SyncState},
    remote::{BlockingRemoteClient, RemoteConfig},
    source::StdinFrameSource,
    stats::create_shared_stats,
    store::LocalStore,
    sync::{RetryPolicy, SyncScheduler},
    DailyAggregate, PRIVACY_DECLARATION, VERSION,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "posture-agent")]
#[command(version = VERSION)]
#[command(about = "Privacy-first forward-head-posture tracker", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start measuring posture from landmark frames on stdin
    Start {
        /// Remote summary store base URL (overrides config)
        #[arg(long)]
        remote_url: Option<String>,

        /// Bearer token for the remote store (or POSTURE_AGENT_TOKEN env)
        #[arg(long)]
        token: Option<String>,

        /// Sync interval in seconds (how often pending days are flushed)
        #[arg(long)]
        sync_interval: Option<u64>,

        /// Classification threshold in degrees (overrides config)
        #[arg(long)]
        threshold: Option<f64>,

        /// IANA timezone name for daily boundaries (overrides config)
        #[arg(long)]
        timezone: Option<String>,
    },

    /// Pause measurement
    Pause,

    /// Resume measurement
    Resume,

    /// Show current measurement and sync status
    Status,

    /// Display privacy declaration
    Privacy,

    /// Flush pending daily summaries to the remote store now
    Flush {
        /// Remote summary store base URL (overrides config)
        #[arg(long)]
        remote_url: Option<String>,

        /// Bearer token for the remote store (or POSTURE_AGENT_TOKEN env)
        #[arg(long)]
        token: Option<String>,
    },

    /// Calibrate the neutral angle from a few seconds of upright frames
    Calibrate {
        /// How long to sample frames, in seconds
        #[arg(long, default_value = "5")]
        duration: u64,
    },

    /// Show configuration
    Config,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Start {
            remote_url,
            token,
            sync_interval,
            threshold,
            timezone,
        } => {
            cmd_start(remote_url, token, sync_interval, threshold, timezone);
        }
        Commands::Pause => {
            cmd_pause();
        }
        Commands::Resume => {
            cmd_resume();
        }
        Commands::Status => {
            cmd_status();
        }
        Commands::Privacy => {
            println!("{PRIVACY_DECLARATION}");
        }
        Commands::Flush { remote_url, token } => {
            cmd_flush(remote_url, token);
        }
        Commands::Calibrate { duration } => {
            cmd_calibrate(duration);
        }
        Commands::Config => {
            cmd_config();
        }
    }
}

/// Stable principal id for aggregate keys: configured, or derived from the
/// hostname so it survives restarts.
fn resolve_user_id(config: &Config) -> String {
    if let Some(id) = &config.user_id {
        return id.clone();
    }
    let hostname = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    format!("device-{hostname}")
}

/// Build a remote client from CLI args, environment, and config.
/// Returns `None` when no remote URL is configured (sync disabled).
fn create_remote_client(
    remote_url: Option<String>,
    token: Option<String>,
    config: &Config,
) -> Option<BlockingRemoteClient> {
    let url = remote_url.or_else(|| config.remote_url.clone())?;
    // A missing token is not a silent no-op: upserts will surface an
    // authentication-required failure in the status indicator.
    let token = token
        .or_else(|| std::env::var("POSTURE_AGENT_TOKEN").ok())
        .unwrap_or_default();

    match BlockingRemoteClient::new(RemoteConfig::new(url, token)) {
        Ok(client) => Some(client),
        Err(e) => {
            eprintln!("Warning: remote client initialization failed: {e}");
            eprintln!("Continuing without remote sync.");
            None
        }
    }
}

fn cmd_start(
    remote_url: Option<String>,
    token: Option<String>,
    sync_interval: Option<u64>,
    threshold: Option<f64>,
    timezone: Option<String>,
) {
    println!("Posture Agent v{VERSION}");
    println!();

    // Load or create configuration, with CLI overrides
    let mut config = Config::load().unwrap_or_default();
    if let Some(t) = threshold {
        config.threshold_degrees = t;
    }
    if let Some(tz) = timezone {
        config.timezone = tz;
    }
    if let Some(s) = sync_interval {
        config.sync_interval_secs = s;
    }
    if let Err(e) = config.ensure_directories() {
        eprintln!("Warning: Could not create directories: {e}");
    }

    let tz = match config.tz() {
        Ok(tz) => tz,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    let user_id = resolve_user_id(&config);

    // Open the durable store and recover any flush that was cut off by the
    // previous shutdown.
    let store = match LocalStore::open(&config.data_path) {
        Ok(store) => store,
        Err(e) => {
            eprintln!("Error opening local store: {e}");
            std::process::exit(1);
        }
    };
    match store.recover(&user_id) {
        Ok(demoted) if !demoted.is_empty() => {
            tracing::info!("recovered {} interrupted sync(s), will retry", demoted.len());
        }
        Ok(_) => {}
        Err(e) => eprintln!("Warning: store recovery failed: {e}"),
    }

    println!("Starting measurement...");
    println!("  User: {user_id}");
    println!("  Threshold: {} degrees", config.threshold_degrees);
    println!("  Neutral angle: {} degrees", config.neutral_angle_degrees);
    println!("  Timezone: {}", config.timezone);
    println!("  Persist interval: {}s", config.persist_interval_secs);

    // Remote sync setup
    let remote_client = create_remote_client(remote_url, token, &config);
    match &remote_client {
        Some(client) => {
            println!(
                "  Remote sync: enabled (interval: {}s)",
                config.sync_interval_secs
            );
            println!("  Device ID: {}", client.device_id());
            match client.test_connection() {
                Ok(true) => println!("  Remote connection: OK"),
                Ok(false) => eprintln!("Warning: remote health check failed"),
                Err(e) => eprintln!("Warning: could not reach remote store: {e}"),
            }
        }
        None => println!("  Remote sync: disabled"),
    }

    println!();
    println!("Reading landmark frames from stdin. Press Ctrl+C to stop.");
    println!();

    // Pipeline state
    let stats = create_shared_stats(config.stats_path());
    let mut angles = AngleComputer::new(
        config.threshold_degrees,
        config.neutral_angle_degrees,
        config.min_landmark_visibility,
        config.session_gap_secs,
        config.resume_weight_secs,
    );
    let mut aggregator = LocalAggregator::new(user_id.clone(), tz);

    // Resume today's aggregate so a restart mid-day continues it.
    let today = Utc::now().with_timezone(&tz).date_naive();
    match store.get(&user_id, today) {
        Ok(Some(existing)) => {
            tracing::info!(
                "resuming day {} ({} samples so far)",
                existing.date_iso(),
                existing.count
            );
            aggregator.resume_from(existing);
        }
        Ok(None) => {}
        Err(e) => eprintln!("Warning: could not load today's aggregate: {e}"),
    }

    let mut scheduler = SyncScheduler::new(user_id.clone(), RetryPolicy::default());

    // Sealed days whose persist failed; kept in memory and retried.
    let mut persist_backlog: Vec<DailyAggregate> = Vec::new();

    // Set up Ctrl+C handler
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })
    .expect("Error setting Ctrl+C handler");

    // Support pause/resume from another process by polling the config file.
    let mut paused = config.paused;
    if paused {
        println!("Measurement is currently paused.");
        println!("Run `posture-agent resume` to start measuring.");
        println!();
    }

    let mut frames = StdinFrameSource::new();
    if let Err(e) = frames.start() {
        eprintln!("Error starting frame source: {e}");
        std::process::exit(1);
    }
    let receiver = frames.receiver().clone();

    let mut last_config_check = Instant::now();
    let mut last_tick = Instant::now();
    let mut last_persist = Instant::now();
    let mut last_sync = Instant::now();
    let mut auth_prompted = false;

    // Main event loop: a single serialized pipeline. Frame delivery and
    // timer ticks are independent event sources, but folds and sync state
    // transitions never interleave mid-update.
    while running.load(Ordering::SeqCst) {
        // Poll config so `posture-agent pause/resume` controls a running agent.
        if last_config_check.elapsed() >= Duration::from_secs(1) {
            if let Ok(cfg) = Config::load() {
                if cfg.paused != paused {
                    paused = cfg.paused;
                    if paused {
                        println!();
                        println!("Pausing measurement...");
                        // The pause gap must not be attributed to a sample.
                        angles.reset_session();
                    } else {
                        println!();
                        println!("Resuming measurement...");
                        // Resume doubles as the operator-intervention signal:
                        // days parked by auth or validation failures get a
                        // fresh attempt on the next sync interval.
                        scheduler.clear_blocked();
                        auth_prompted = false;
                    }
                }
            }
            last_config_check = Instant::now();
        }

        // Process frames with timeout so timers keep firing during silence.
        match receiver.recv_timeout(Duration::from_millis(100)) {
            Ok(frame) => {
                stats.record_frame_received();
                if !paused {
                    match angles.process(&frame) {
                        Some(sample) => {
                            aggregator.fold(&sample);
                            stats.record_sample_folded();
                        }
                        None => stats.record_frame_dropped(),
                    }
                }
            }
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                // Silence is absence of signal, not an error.
            }
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                tracing::info!("frame source closed, shutting down");
                break;
            }
        }

        // Lazy day-rollover check; also covers suspension across midnight.
        if last_tick.elapsed() >= Duration::from_secs(1) {
            aggregator.tick(Utc::now());
            last_tick = Instant::now();
        }

        // Bounded-cadence persistence: a crash loses at most this window.
        if last_persist.elapsed() >= Duration::from_secs(config.persist_interval_secs)
            || aggregator.has_sealed()
        {
            persist_dirty(&store, &mut aggregator, &mut persist_backlog);
            last_persist = Instant::now();
        }

        // Interval-gated sync of pending days.
        if let Some(client) = &remote_client {
            if last_sync.elapsed() >= Duration::from_secs(config.sync_interval_secs) {
                // Checkpoint before any flush attempt.
                persist_dirty(&store, &mut aggregator, &mut persist_backlog);

                // Days the store could not record, plus the live day, flush
                // from memory even while local persistence is failing.
                let in_memory = flush_candidates(&aggregator, &persist_backlog);
                let report =
                    scheduler.run_flush_pass(&store, &in_memory, Instant::now(), |a| {
                        client.upsert(a)
                    });

                for date in &report.synced {
                    stats.record_day_synced();
                    // Reflect the ack onto the live aggregate, unless more
                    // folds landed in the meantime.
                    match store.get(&user_id, *date) {
                        Ok(Some(stored)) => aggregator.apply_sync_state(
                            *date,
                            SyncState::Synced,
                            stored.last_synced_at,
                            stored.count,
                        ),
                        _ => {
                            // Store unreadable: fall back to the copy that
                            // was actually sent.
                            if let Some(sent) = in_memory.iter().find(|a| a.date == *date) {
                                aggregator.apply_sync_state(
                                    *date,
                                    SyncState::Synced,
                                    Some(Utc::now()),
                                    sent.count,
                                );
                            }
                        }
                    }
                    // Acked backlog entries stop being re-sent once they
                    // finally reach the store.
                    for kept in persist_backlog.iter_mut().filter(|a| a.date == *date) {
                        kept.sync_state = SyncState::Synced;
                        kept.last_synced_at = Some(Utc::now());
                    }
                }
                if !report.failed.is_empty() {
                    if let Some(err) = scheduler.last_error() {
                        stats.record_sync_failure(err);
                    }
                }
                if report.auth_required && !auth_prompted {
                    eprintln!();
                    eprintln!("Sync requires re-authentication. Measurement continues;");
                    eprintln!("run `posture-agent flush --token <token>` once signed in.");
                    auth_prompted = true;
                }

                last_sync = Instant::now();
            }
        }
    }

    // Teardown: drain to the durable store first, then try the network.
    println!();
    println!("Stopping measurement...");
    frames.stop();
    stats.record_lines_rejected(frames.rejected_lines());

    aggregator.tick(Utc::now());
    persist_dirty(&store, &mut aggregator, &mut persist_backlog);

    // Best-effort opportunistic flush; a dead network must not block exit.
    if let Some(client) = &remote_client {
        println!("Syncing pending days to remote store...");
        let in_memory = flush_candidates(&aggregator, &persist_backlog);
        let report =
            scheduler.run_flush_pass(&store, &in_memory, Instant::now(), |a| client.upsert(a));
        for _ in &report.synced {
            stats.record_day_synced();
        }
        if report.is_clean() && !report.synced.is_empty() {
            println!("Final sync complete ({} day(s))", report.synced.len());
        } else if let Some(err) = scheduler.last_error() {
            stats.record_sync_failure(err);
            eprintln!("Final sync incomplete: {err}");
            eprintln!("Pending days remain in the local store and will sync next run.");
        }
    }

    if let Err(e) = stats.save() {
        eprintln!("Warning: Could not save stats: {e}");
    }

    println!();
    println!("{}", stats.summary());
}

/// Persist sealed days and the live snapshot. Failed writes stay in the
/// backlog (or in the aggregator) and are retried on the next cadence; local
/// persistence problems never stop measurement.
fn persist_dirty(
    store: &LocalStore,
    aggregator: &mut LocalAggregator,
    backlog: &mut Vec<DailyAggregate>,
) {
    backlog.extend(aggregator.take_sealed());
    backlog.retain(|aggregate| match store.put(aggregate) {
        Ok(()) => false,
        Err(e) => {
            tracing::warn!(
                "persist of {} failed, keeping in memory: {e}",
                aggregate.date_iso()
            );
            true
        }
    });

    if let Some(snapshot) = aggregator.snapshot() {
        if snapshot.count > 0 {
            if let Err(e) = store.put(&snapshot) {
                tracing::warn!("persist of live day failed: {e}");
            }
        }
    }
}

/// Copies of everything still held in memory, for the flush pass. Covers the
/// live day and any backlog days whose persist keeps failing, so sync does
/// not depend on a healthy local store.
fn flush_candidates(
    aggregator: &LocalAggregator,
    backlog: &[DailyAggregate],
) -> Vec<DailyAggregate> {
    let mut candidates = backlog.to_vec();
    if let Some(snapshot) = aggregator.snapshot() {
        if snapshot.count > 0 {
            candidates.push(snapshot);
        }
    }
    candidates
}

fn cmd_pause() {
    let mut config = Config::load().unwrap_or_default();
    config.paused = true;
    if let Err(e) = config.save() {
        eprintln!("Error saving config: {e}");
        std::process::exit(1);
    }
    println!("Measurement paused. Use 'posture-agent resume' to continue.");
}

fn cmd_resume() {
    let mut config = Config::load().unwrap_or_default();
    config.paused = false;
    if let Err(e) = config.save() {
        eprintln!("Error saving config: {e}");
        std::process::exit(1);
    }
    println!("Measurement resumed.");
}

fn cmd_status() {
    let config = Config::load().unwrap_or_default();
    let user_id = resolve_user_id(&config);

    println!("Posture Agent Status");
    println!("====================");
    println!();
    println!("Configuration:");
    println!("  User: {user_id}");
    println!("  Threshold: {} degrees", config.threshold_degrees);
    println!("  Neutral angle: {} degrees", config.neutral_angle_degrees);
    println!("  Timezone: {}", config.timezone);
    println!(
        "  Remote sync: {}",
        match &config.remote_url {
            Some(url) => url.as_str(),
            None => "disabled",
        }
    );
    println!("  Paused: {}", config.paused);
    println!();

    // Pending days owed to the remote store
    match LocalStore::open(&config.data_path).and_then(|store| store.list_pending(&user_id)) {
        Ok(pending) if pending.is_empty() => println!("Pending days: none"),
        Ok(pending) => {
            println!("Pending days ({}):", pending.len());
            for day in pending {
                println!(
                    "  {} - {} samples, {:.0}s observed ({:?})",
                    day.date_iso(),
                    day.count,
                    day.weight_seconds,
                    day.sync_state
                );
            }
        }
        Err(e) => eprintln!("Could not scan local store: {e}"),
    }
    println!();

    // Cumulative stats, if a previous session saved any
    let stats_path = config.stats_path();
    if stats_path.exists() {
        if let Ok(content) = std::fs::read_to_string(&stats_path) {
            if let Ok(stats) = serde_json::from_str::<serde_json::Value>(&content) {
                println!("Cumulative Statistics:");
                for (label, key) in [
                    ("Frames received", "frames_received"),
                    ("Frames dropped", "frames_dropped"),
                    ("Lines rejected", "lines_rejected"),
                    ("Samples folded", "samples_folded"),
                    ("Days synced", "days_synced"),
                    ("Sync failures", "sync_failures"),
                ] {
                    if let Some(v) = stats.get(key) {
                        println!("  {label}: {v}");
                    }
                }
            }
        }
    } else {
        println!("No previous session data found.");
    }
}

fn cmd_flush(remote_url: Option<String>, token: Option<String>) {
    let config = Config::load().unwrap_or_default();
    let user_id = resolve_user_id(&config);

    let store = match LocalStore::open(&config.data_path) {
        Ok(store) => store,
        Err(e) => {
            eprintln!("Error opening local store: {e}");
            std::process::exit(1);
        }
    };
    if let Err(e) = store.recover(&user_id) {
        eprintln!("Warning: store recovery failed: {e}");
    }

    let client = match create_remote_client(remote_url, token, &config) {
        Some(client) => client,
        None => {
            eprintln!("Error: no remote URL configured (use --remote-url or config)");
            std::process::exit(1);
        }
    };

    let pending = store.list_pending(&user_id).unwrap_or_default();
    if pending.is_empty() {
        println!("Nothing to flush.");
        return;
    }
    println!("Flushing {} pending day(s)...", pending.len());

    // An explicit flush is operator intervention: a fresh scheduler has no
    // backoff gates or blocked days, so every pending day gets an attempt.
    let mut scheduler = SyncScheduler::new(user_id, RetryPolicy::default());
    let report = scheduler.run_flush_pass(&store, &[], Instant::now(), |a| client.upsert(a));

    for date in &report.synced {
        println!("  {date} synced");
    }
    for (date, kind) in &report.failed {
        println!("  {date} failed ({kind:?})");
    }
    // Any failed day makes the flush a failure, even if a later day synced
    // and cleared the scheduler's last-error slot.
    if !report.failed.is_empty() {
        if let Some(err) = scheduler.last_error() {
            eprintln!("Last error: {err}");
        }
        std::process::exit(1);
    }
    println!("Flush complete.");
}

fn cmd_calibrate(duration: u64) {
    let mut config = Config::load().unwrap_or_default();

    println!("Calibrating neutral angle for {duration}s.");
    println!("Sit upright and keep landmark frames flowing on stdin...");

    let angles = AngleComputer::new(
        config.threshold_degrees,
        0.0,
        config.min_landmark_visibility,
        config.session_gap_secs,
        config.resume_weight_secs,
    );

    let mut frames = StdinFrameSource::new();
    if let Err(e) = frames.start() {
        eprintln!("Error starting frame source: {e}");
        std::process::exit(1);
    }
    let receiver = frames.receiver().clone();

    let deadline = Instant::now() + Duration::from_secs(duration);
    let mut observed: Vec<f64> = Vec::new();
    while Instant::now() < deadline {
        match receiver.recv_timeout(Duration::from_millis(100)) {
            Ok(frame) => {
                if let Some(angle) = angles.raw_angle(&frame) {
                    observed.push(angle);
                }
            }
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
        }
    }
    frames.stop();

    if observed.is_empty() {
        eprintln!("Error: no usable frames observed; calibration unchanged.");
        std::process::exit(1);
    }

    let neutral = observed.iter().sum::<f64>() / observed.len() as f64;
    config.neutral_angle_degrees = neutral;
    if let Err(e) = config.save() {
        eprintln!("Error saving config: {e}");
        std::process::exit(1);
    }

    println!(
        "Calibrated neutral angle: {:.2} degrees ({} frames)",
        neutral,
        observed.len()
    );
}

fn cmd_config() {
    let config = Config::load().unwrap_or_default();

    println!("Configuration");
    println!("=============");
    println!();
    println!("Config file: {:?}", Config::config_path());
    println!();
    println!(
        "{}",
        serde_json::to_string_pretty(&config).unwrap_or_else(|_| "Error".to_string())
    );
}
