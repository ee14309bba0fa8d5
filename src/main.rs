use clap::Parser;
use colored::*;
use eyre::{Context, Result};
use log::info;
use std::fs;
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::Arc;

mod cli;
mod config;

use akari::compose::{CommandComposer, ComposeRetryController};
use akari::dispatch::{CycleReport, Dispatcher, Reply, RequestHandler, WorkerPool};
use akari::intake::{Author, InboundPost, Intake, Request, Route};
use akari::post::build_poster;
use akari::queue::CandidateQueue;
use akari::ratelimit::{CounterStore, MemoryCounterStore, RateLimiter, SqliteCounterStore};
use akari::scoring::Scorer;
use akari::search::build_provider;
use akari::shutdown::{self, Shutdown};
use akari::text::{CleanOptions, clean};
use cli::Cli;
use cli::commands::Commands;
use config::Config;

fn setup_logging(level: Option<&str>) -> Result<()> {
    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("akari")
        .join("logs");

    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    let log_file = log_dir.join("akari.log");

    let target = Box::new(
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)
            .context("Failed to open log file")?,
    );

    // RUST_LOG wins over the config
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level.unwrap_or("info")))
        .target(env_logger::Target::Pipe(target))
        .init();

    info!("Logging initialized, writing to: {}", log_file.display());
    Ok(())
}

fn run_application(cli: &Cli, config: &Config) -> Result<()> {
    info!("Starting application");

    if cli.is_verbose() {
        println!("{}", "Verbose mode enabled".yellow());
    }

    let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;

    match &cli.command {
        None => handle_queue_command(false, config),
        Some(Commands::Enqueue { input }) => handle_enqueue_command(input.as_deref(), config),
        Some(Commands::Cycle) => runtime.block_on(handle_cycle_command(config)),
        Some(Commands::Run { interval }) => runtime.block_on(handle_run_command(*interval, config)),
        Some(Commands::Listen) => runtime.block_on(handle_listen_command(config)),
        Some(Commands::Request {
            text,
            handle,
            followers,
            image,
        }) => runtime.block_on(handle_request_command(text, handle, *followers, image.clone(), config)),
        Some(Commands::Queue { all }) => handle_queue_command(*all, config),
        Some(Commands::Limit {
            scope,
            identity,
            hit,
            max,
            ttl,
        }) => handle_limit_command(scope, identity, *hit, *max, *ttl, config),
    }
}

fn open_queue(config: &Config) -> Result<Arc<CandidateQueue>> {
    let path = config.storage.queue_path();
    let queue = CandidateQueue::open(&path).context(format!("Failed to open queue at {}", path.display()))?;
    Ok(Arc::new(queue))
}

fn open_limiter(config: &Config) -> Result<RateLimiter> {
    let store: Arc<dyn CounterStore> = if config.rate_limit.in_memory {
        Arc::new(MemoryCounterStore::new())
    } else {
        let path = config.storage.ratelimit_path();
        Arc::new(
            SqliteCounterStore::open(&path)
                .context(format!("Failed to open rate limit store at {}", path.display()))?,
        )
    };
    Ok(RateLimiter::new(store).with_op_timeout(config.rate_limit.op_timeout()))
}

fn build_controller(config: &Config) -> Result<Arc<ComposeRetryController>> {
    let provider = build_provider(&config.search).context("Failed to set up image search")?;
    let composer = CommandComposer::new(provider, config.compose.clone(), config.storage.images_path())
        .context("Failed to set up composer")?;
    Ok(Arc::new(ComposeRetryController::from_config(Arc::new(composer), &config.compose)))
}

fn build_dispatcher(config: &Config) -> Result<Dispatcher> {
    let poster = build_poster(&config.post).context("Failed to set up poster")?;
    Ok(Dispatcher::new(
        open_queue(config)?,
        Scorer::new(config.scoring.clone()),
        build_controller(config)?,
        open_limiter(config)?,
        poster,
        config.dispatch.clone(),
    )
    .with_post_retry(config.post.retry_policy())
    .with_phrase_picker(config.compose.phrase_picker()))
}

fn build_request_handler(config: &Config, shutdown: Shutdown) -> Result<RequestHandler> {
    let poster = build_poster(&config.post).context("Failed to set up poster")?;
    let handler = RequestHandler::new(
        config.requests.clone(),
        open_limiter(config)?,
        build_controller(config)?,
        poster,
    )
    .context("Invalid request settings")?;
    Ok(handler.with_post_retry(config.post.retry_policy()).with_shutdown(shutdown))
}

/// Shutdown that fires on Ctrl-C. Must be called inside the runtime.
fn shutdown_on_ctrl_c() -> Shutdown {
    let (trigger, shutdown) = shutdown::channel();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, shutting down");
            trigger.trigger();
        }
    });
    shutdown
}

fn print_report(report: &CycleReport) {
    match report {
        CycleReport::Posted { .. } => println!("{} {}", "Posted:".green(), report),
        CycleReport::PostFailed { .. } => println!("{} {}", "Failed:".red(), report),
        CycleReport::RateLimited { .. } | CycleReport::Missed { .. } => {
            println!("{} {}", "Skipped:".yellow(), report)
        }
        _ => println!("{} {}", "Cycle:".cyan(), report),
    }
}

fn handle_enqueue_command(input: Option<&Path>, config: &Config) -> Result<()> {
    let reader: Box<dyn BufRead> = match input {
        Some(path) => Box::new(std::io::BufReader::new(
            fs::File::open(path).context(format!("Failed to open {}", path.display()))?,
        )),
        None => Box::new(std::io::stdin().lock()),
    };

    let queue = open_queue(config)?;
    let intake = Intake::new(config.intake.clone());
    let (mut queued, mut duplicates, mut ignored, mut requests, mut malformed) = (0, 0, 0, 0, 0);

    for line in reader.lines() {
        let line = line.context("Failed to read input")?;
        if line.trim().is_empty() {
            continue;
        }
        let post: InboundPost = match serde_json::from_str(&line) {
            Ok(post) => post,
            Err(e) => {
                log::warn!("Skipping malformed post: {}", e);
                malformed += 1;
                continue;
            }
        };

        match intake.classify(&post) {
            Route::Timeline(candidate) => {
                if queue.append(&candidate).context("Failed to append to queue")? {
                    queued += 1;
                } else {
                    duplicates += 1;
                }
            }
            Route::Request(request) => {
                log::info!("Request {} from @{} not handled by enqueue", request.id, request.author.handle);
                requests += 1;
            }
            Route::Ignore(reason) => {
                log::debug!("Ignoring post {}: {}", post.id, reason);
                ignored += 1;
            }
        }
    }

    println!(
        "{} {} queued, {} duplicate, {} ignored, {} requests skipped, {} malformed",
        "Enqueue:".green(),
        queued,
        duplicates,
        ignored,
        requests,
        malformed
    );
    println!("  Queue: {} ({} pending)", queue.path().display(), queue.len()?);
    Ok(())
}

async fn handle_cycle_command(config: &Config) -> Result<()> {
    let dispatcher = build_dispatcher(config)?;
    let shutdown = shutdown_on_ctrl_c();
    let report = dispatcher.run_cycle(&shutdown).await.context("Cycle failed")?;
    print_report(&report);
    Ok(())
}

async fn handle_run_command(interval: Option<u64>, config: &Config) -> Result<()> {
    let mut config = config.clone();
    if let Some(secs) = interval {
        config.dispatch.cycle_interval_secs = secs;
    }
    println!(
        "{} every {}s, Ctrl-C to stop",
        "Running cycles".cyan(),
        config.dispatch.cycle_interval_secs
    );

    let dispatcher = build_dispatcher(&config)?;
    dispatcher.run(shutdown_on_ctrl_c()).await;
    Ok(())
}

async fn handle_listen_command(config: &Config) -> Result<()> {
    use tokio::io::AsyncBufReadExt;

    let mut shutdown = shutdown_on_ctrl_c();
    let queue = open_queue(config)?;
    let intake = Intake::new(config.intake.clone());
    let handler = Arc::new(build_request_handler(config, shutdown.clone())?);

    let pool = WorkerPool::spawn(config.requests.workers, config.requests.queue_capacity, move |request: Request| {
        let handler = handler.clone();
        async move {
            let reply = handler.handle(&request).await;
            log::info!("Request {} from @{}: {:?}", request.id, request.author.handle, reply);
        }
    });
    println!("{} {} workers, reading posts from stdin", "Listening:".cyan(), pool.size());

    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = shutdown.wait() => break,
            line = lines.next_line() => line.context("Failed to read stdin")?,
        };
        let Some(line) = line else {
            info!("Input closed");
            break;
        };
        if line.trim().is_empty() {
            continue;
        }

        let post: InboundPost = match serde_json::from_str(&line) {
            Ok(post) => post,
            Err(e) => {
                log::warn!("Skipping malformed post: {}", e);
                continue;
            }
        };

        match intake.classify(&post) {
            Route::Timeline(candidate) => {
                if let Err(e) = queue.append(&candidate) {
                    log::error!("Failed to queue {}: {}", candidate.id, e);
                }
            }
            Route::Request(request) => {
                pool.submit(request);
            }
            Route::Ignore(reason) => log::debug!("Ignoring post {}: {}", post.id, reason),
        }
    }

    pool.shutdown().await;
    println!("{}", "Listener stopped".cyan());
    Ok(())
}

async fn handle_request_command(
    text: &str,
    handle: &str,
    followers: u64,
    image: Option<String>,
    config: &Config,
) -> Result<()> {
    let handler = build_request_handler(config, shutdown_on_ctrl_c())?;
    let request = Request {
        id: format!("cli-{}", chrono::Utc::now().timestamp_millis()),
        text: clean(text, CleanOptions::plain()),
        author: Author {
            handle: handle.to_string(),
            followers,
            lang: None,
        },
        image_url: image,
        conversation: None,
    };

    match handler.handle(&request).await {
        Reply::Posted {
            url,
            text,
            with_media,
            fallback,
        } => {
            let label = if fallback { "Fallback:".yellow() } else { "Replied:".green() };
            println!("{} {}", label, text);
            println!("  URL: {}", url);
            println!("  Media: {}", if with_media { "yes" } else { "no" });
        }
        Reply::Ignored { reason } => println!("{} {}", "Ignored:".yellow(), reason),
        Reply::Dropped { tier, reset_secs } => {
            println!("{} tier {} closed for {}s", "Dropped:".yellow(), tier, reset_secs)
        }
        Reply::PostFailed(e) => println!("{} {}", "Failed:".red(), e),
        Reply::Cancelled => println!("{}", "Cancelled".red()),
    }
    Ok(())
}

fn handle_queue_command(all: bool, config: &Config) -> Result<()> {
    let queue = open_queue(config)?;
    let pending = queue.read_all().context("Failed to read queue")?;
    let ranked = Scorer::new(config.scoring.clone()).score(&pending, chrono::Utc::now());

    println!(
        "{} {} pending, {} eligible",
        "Queue:".cyan(),
        pending.len(),
        ranked.len()
    );
    for scored in &ranked {
        println!(
            "  {:>10.4}  {}  {}",
            scored.score,
            scored.candidate.id.bold(),
            scored.candidate.cleaned_text
        );
    }

    if all {
        for candidate in pending.iter().filter(|c| !ranked.iter().any(|s| s.candidate.id == c.id)) {
            println!(
                "  {:>10}  {}  {}",
                "ineligible".dimmed(),
                candidate.id,
                candidate.cleaned_text
            );
        }
    }
    Ok(())
}

fn handle_limit_command(scope: &str, identity: &str, hit: bool, max: u32, ttl: u64, config: &Config) -> Result<()> {
    let limiter = open_limiter(config)?;

    if hit {
        let result = limiter.hit(scope, identity, max, std::time::Duration::from_secs(ttl));
        let verdict = if result.allowed { "allowed".green() } else { "denied".red() };
        println!(
            "{} {} ({} left, resets in {}s{})",
            "Hit:".cyan(),
            verdict,
            result.left,
            result.reset_secs,
            if result.backend_unavailable { ", backend unavailable" } else { "" }
        );
    }

    match limiter.peek(scope, identity).context("Failed to read rate limit")? {
        Some(row) => {
            println!("{} {}:{}", "Limit:".cyan(), scope, identity);
            println!("  Count: {}/{}", row.count, row.max);
            println!("  Window start: {}", row.window_start);
            match row.expires_at() {
                Some(expires) => println!("  Expires: {}", expires),
                None => println!("  Expires: {}", "never (will reset on next hit)".yellow()),
            }
        }
        None => println!("{} no counter for {}:{}", "Limit:".cyan(), scope, identity),
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;

    let level = if cli.is_verbose() {
        Some("debug")
    } else {
        config.log_level.as_deref()
    };
    setup_logging(level).context("Failed to setup logging")?;

    info!("Starting with config from: {:?}", cli.config);

    run_application(&cli, &config).context("Application failed")?;

    Ok(())
}
