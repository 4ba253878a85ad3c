use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use ferry_client::{HttpCaptchaSolver, ReqwestExecutor};
use ferry_core::captcha::Challenge;
use ferry_core::job::CancelOutcome;
use ferry_core::{
    AppError, CaptchaConfig, CaptchaGate, CaptchaSolver, Dispatcher, DispatcherConfig,
    DomainLimitConfig, DomainRateLimiter, EnqueueRequest, JobQueue, JobState, MemoryJobQueue,
    MetricsReporter, Priority, ProxyPool, ProxyPoolConfig, QueueDepth, RetryPolicy,
    TracingReporter, enqueue_batch,
};
use ferry_db::{Database, DatabaseConfig, FetchJobRepository};

#[derive(Parser)]
#[command(name = "ferry", version, about = "Fetch job orchestrator with retries, proxies and CAPTCHA handling")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Queue one URL, or a CSV batch (columns: url, priority, max_attempts)
    Submit {
        /// Target URL
        #[arg(short, long, conflicts_with = "file", required_unless_present = "file")]
        url: Option<String>,

        /// Priority, 1 (highest) to 5 (lowest)
        #[arg(short, long, default_value_t = 3)]
        priority: u8,

        /// CSV file with one job per row
        #[arg(short, long)]
        file: Option<PathBuf>,

        /// Attempt ceiling for jobs that do not set their own
        #[arg(long, env = "FERRY_MAX_ATTEMPTS", default_value_t = 3)]
        max_attempts: u32,

        /// Largest accepted batch
        #[arg(long, env = "FERRY_MAX_BATCH", default_value_t = 1000)]
        max_batch: usize,
    },

    /// Show one job
    Status {
        /// Job id
        id: Uuid,
    },

    /// List recent jobs
    List {
        /// Only jobs in this state (pending, in_flight, retry_scheduled, succeeded, failed)
        #[arg(short, long)]
        state: Option<String>,

        /// Number of jobs to show
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },

    /// Cancel a job
    Cancel {
        /// Job id
        id: Uuid,
    },

    /// Return in-flight jobs with no progress back to pending
    Recover {
        /// Seconds without progress before a job counts as abandoned
        #[arg(long, env = "FERRY_STALE_AFTER_SECS", default_value_t = 300)]
        stale_after_secs: u64,
    },

    /// Run the dispatcher until interrupted
    Run(RunArgs),
}

#[derive(Args)]
struct RunArgs {
    /// Number of concurrent workers
    #[arg(short, long, env = "FERRY_WORKERS", default_value_t = 4)]
    workers: usize,

    /// File with one proxy address per line (http, https, socks5, socks5h)
    #[arg(long, env = "FERRY_PROXY_FILE")]
    proxies: Option<PathBuf>,

    /// Re-read the proxy file this often
    #[arg(
        long,
        env = "FERRY_PROXY_REFRESH_SECS",
        default_value_t = 60,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    proxy_refresh_secs: u64,

    /// Fetch without a proxy when the inventory is empty
    #[arg(long, env = "FERRY_ALLOW_DIRECT", default_value_t = false)]
    allow_direct: bool,

    /// Consecutive failures before a proxy is quarantined
    #[arg(long, env = "FERRY_QUARANTINE_AFTER", default_value_t = 3)]
    quarantine_after: u32,

    /// Quarantine cool-down in seconds
    #[arg(long, env = "FERRY_PROXY_COOL_DOWN_SECS", default_value_t = 60)]
    proxy_cool_down_secs: u64,

    /// CAPTCHA solving service endpoint
    #[arg(long, env = "FERRY_CAPTCHA_ENDPOINT")]
    captcha_endpoint: Option<String>,

    /// Bearer token for the CAPTCHA service
    #[arg(long, env = "FERRY_CAPTCHA_API_KEY")]
    captcha_api_key: Option<String>,

    /// Solve attempts per job before it fails
    #[arg(long, env = "FERRY_CAPTCHA_MAX_ATTEMPTS", default_value_t = 2)]
    captcha_max_attempts: u32,

    /// Upper bound for one solve call, in seconds
    #[arg(long, env = "FERRY_SOLVE_TIMEOUT_SECS", default_value_t = 120)]
    solve_timeout_secs: u64,

    /// Upper bound for one fetch, in seconds
    #[arg(long, env = "FERRY_ATTEMPT_TIMEOUT_SECS", default_value_t = 30)]
    attempt_timeout_secs: u64,

    /// Seconds without progress before an in-flight job is recovered
    #[arg(long, env = "FERRY_STALE_AFTER_SECS", default_value_t = 300)]
    stale_after_secs: u64,

    /// Concurrent requests per domain
    #[arg(long, env = "FERRY_DOMAIN_CONCURRENCY", default_value_t = 2)]
    domain_concurrency: usize,

    /// Minimum milliseconds between dispatches to one domain
    #[arg(long, env = "FERRY_DOMAIN_SPACING_MS", default_value_t = 500)]
    domain_spacing_ms: u64,

    /// Attempt ceiling; also caps jobs queued with a higher limit
    #[arg(long, env = "FERRY_MAX_ATTEMPTS", default_value_t = 3)]
    max_attempts: u32,

    /// Use a process-local queue instead of PostgreSQL
    #[arg(long, default_value_t = false)]
    in_memory: bool,

    /// CSV batch to enqueue before dispatching
    #[arg(long)]
    seed: Option<PathBuf>,

    /// Stop once no job is outstanding
    #[arg(long, default_value_t = false)]
    exit_when_idle: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("ferry=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Submit {
            url,
            priority,
            file,
            max_attempts,
            max_batch,
        } => {
            let repo = connect_db().await?.with_default_max_attempts(max_attempts);
            let requests = match (url, file) {
                (Some(url), _) => vec![EnqueueRequest::with_raw_priority(url, priority)?],
                (None, Some(path)) => read_batch(&path)?,
                (None, None) => bail!("Either --url or --file is required"),
            };
            cmd_submit(&repo, requests, max_batch).await?;
        }
        Commands::Status { id } => {
            let repo = connect_db().await?;
            cmd_status(&repo, id).await?;
        }
        Commands::List { state, limit } => {
            let repo = connect_db().await?;
            let state = state
                .map(|s| s.parse::<JobState>().map_err(anyhow::Error::msg))
                .transpose()?;
            cmd_list(&repo, state, limit).await?;
        }
        Commands::Cancel { id } => {
            let repo = connect_db().await?;
            cmd_cancel(&repo, id).await?;
        }
        Commands::Recover { stale_after_secs } => {
            let repo = connect_db().await?;
            let count = repo
                .recover_stale(Duration::from_secs(stale_after_secs))
                .await?;
            println!("Recovered {count} stale job(s)");
        }
        Commands::Run(args) => {
            if args.in_memory {
                let queue = MemoryJobQueue::with_default_max_attempts(args.max_attempts);
                cmd_run(queue, &args).await?;
            } else {
                let repo = connect_db().await?.with_default_max_attempts(args.max_attempts);
                cmd_run(repo, &args).await?;
            }
        }
    }

    Ok(())
}

/// Connect to PostgreSQL using DATABASE_URL and apply migrations.
async fn connect_db() -> Result<FetchJobRepository> {
    let config = DatabaseConfig::from_env()?;
    let db = Database::connect(&config).await?;
    db.apply_schema().await?;
    Ok(db.queue())
}

// ---- Input files ----

#[derive(Debug, Deserialize)]
struct BatchRow {
    url: String,
    priority: Option<u8>,
    max_attempts: Option<u32>,
}

/// Parse a CSV submission batch. `priority` defaults to 3.
fn read_batch(path: &Path) -> Result<Vec<EnqueueRequest>> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("Failed to open batch file: {}", path.display()))?;

    let mut requests = Vec::new();
    for (line, row) in reader.deserialize::<BatchRow>().enumerate() {
        let row = row.with_context(|| format!("Invalid row {} in {}", line + 1, path.display()))?;
        let priority = match row.priority {
            Some(p) => Priority::new(p)?,
            None => Priority::default(),
        };
        let mut request = EnqueueRequest::new(row.url, priority);
        if let Some(max) = row.max_attempts {
            request = request.with_max_attempts(max);
        }
        requests.push(request);
    }
    Ok(requests)
}

/// One proxy address per line; blank lines and `#` comments are skipped.
fn read_proxy_file(path: &Path) -> Result<Vec<String>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read proxy file: {}", path.display()))?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect())
}

// ---- Commands ----

async fn cmd_submit<Q: JobQueue>(
    queue: &Q,
    requests: Vec<EnqueueRequest>,
    max_batch: usize,
) -> Result<()> {
    let jobs = enqueue_batch(queue, requests, max_batch).await?;
    for job in &jobs {
        println!("{}\t{}\t{}", job.id, job.priority, job.url);
    }
    tracing::info!(count = jobs.len(), "Jobs submitted");
    Ok(())
}

async fn cmd_status<Q: JobQueue>(queue: &Q, id: Uuid) -> Result<()> {
    let job = queue
        .get_status(id)
        .await?
        .ok_or(AppError::JobNotFound(id))?;
    println!("{}", serde_json::to_string_pretty(&job)?);
    Ok(())
}

async fn cmd_list<Q: JobQueue>(queue: &Q, state: Option<JobState>, limit: usize) -> Result<()> {
    let jobs = queue.list_jobs(state, limit).await?;
    if jobs.is_empty() {
        println!("No jobs found.");
        return Ok(());
    }

    println!(
        "{:<36}  {:<15}  {:>3}  {:>8}  URL",
        "ID", "STATE", "PRI", "ATTEMPTS"
    );
    for job in &jobs {
        println!(
            "{:<36}  {:<15}  {:>3}  {:>3}/{:<4}  {}",
            job.id, job.state, job.priority, job.attempt_count, job.max_attempts, job.url
        );
    }

    let depth = QueueDepth::collect(queue).await?;
    println!(
        "\npending={} in_flight={} retry_scheduled={} succeeded={} failed={}",
        depth.pending, depth.in_flight, depth.retry_scheduled, depth.succeeded, depth.failed
    );
    Ok(())
}

async fn cmd_cancel<Q: JobQueue>(queue: &Q, id: Uuid) -> Result<()> {
    match queue.cancel(id).await? {
        CancelOutcome::Removed => println!("Job {id} removed from the queue"),
        CancelOutcome::Flagged => println!("Job {id} is in flight; it will not be retried"),
        CancelOutcome::AlreadyTerminal => println!("Job {id} already finished"),
        CancelOutcome::NotFound => bail!("Job {id} not found"),
    }
    Ok(())
}

async fn cmd_run<Q: JobQueue + 'static>(queue: Q, args: &RunArgs) -> Result<()> {
    if let Some(path) = &args.seed {
        let requests = read_batch(path)?;
        let jobs = enqueue_batch(&queue, requests, usize::MAX).await?;
        tracing::info!(count = jobs.len(), "Seed batch enqueued");
    }

    let addresses = match &args.proxies {
        Some(path) => read_proxy_file(path)?,
        None => Vec::new(),
    };
    let proxies = ProxyPool::new(
        addresses,
        ProxyPoolConfig::default()
            .with_allow_direct(args.allow_direct)
            .with_quarantine_after(args.quarantine_after)
            .with_cool_down(Duration::from_secs(args.proxy_cool_down_secs)),
    )?;

    let limiter = DomainRateLimiter::new(DomainLimitConfig::default().with_default_limit(
        args.domain_concurrency,
        Duration::from_millis(args.domain_spacing_ms),
    ))?;

    let captcha_config =
        CaptchaConfig::default().with_solve_timeout(Duration::from_secs(args.solve_timeout_secs));
    let solver = match &args.captcha_endpoint {
        Some(endpoint) => CliSolver::Http(
            HttpCaptchaSolver::new(endpoint, args.captcha_api_key.as_deref())?
                .with_timeout(Duration::from_secs(args.solve_timeout_secs))?,
        ),
        None => CliSolver::Disabled,
    };

    let attempt_timeout = Duration::from_secs(args.attempt_timeout_secs);
    let executor = ReqwestExecutor::with_timeout(attempt_timeout)?;

    let dispatcher = Dispatcher::new(
        queue,
        executor.clone(),
        proxies.clone(),
        limiter,
        CaptchaGate::new(solver, &captcha_config)?,
        RetryPolicy::default()
            .with_max_attempts(args.max_attempts)
            .with_captcha_max_attempts(args.captcha_max_attempts),
        DispatcherConfig::default()
            .with_workers(args.workers)
            .with_attempt_timeout(attempt_timeout)
            .with_stale_after(Duration::from_secs(args.stale_after_secs)),
    )?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Interrupt received, finishing current attempts");
                cancel.cancel();
            }
        });
    }

    if let Some(path) = args.proxies.clone() {
        spawn_proxy_refresh(
            proxies,
            executor,
            path,
            Duration::from_secs(args.proxy_refresh_secs),
            cancel.clone(),
        );
    }

    if args.exit_when_idle {
        let queue = dispatcher.queue().clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(1));
            loop {
                tokio::select! {
                    _ = tick.tick() => {}
                    () = cancel.cancelled() => break,
                }
                match QueueDepth::collect(&queue).await {
                    Ok(depth) if depth.outstanding() == 0 => {
                        tracing::info!("Queue drained, stopping");
                        cancel.cancel();
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!(error = %e, "Failed to read queue depth"),
                }
            }
        });
    }

    let metrics = Arc::new(MetricsReporter::new());
    let reporter = Arc::new((TracingReporter, metrics.clone()));
    dispatcher.run(cancel, reporter).await?;

    let health = dispatcher.health(Some(metrics.as_ref())).await?;
    println!("{}", serde_json::to_string_pretty(&health)?);
    Ok(())
}

fn spawn_proxy_refresh(
    proxies: ProxyPool,
    executor: ReqwestExecutor,
    path: PathBuf,
    every: Duration,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(every);
        tick.tick().await;
        loop {
            tokio::select! {
                _ = tick.tick() => {}
                () = cancel.cancelled() => break,
            }
            let result = read_proxy_file(&path)
                .and_then(|addresses| proxies.replace_inventory(addresses).map_err(Into::into));
            match result {
                Ok(()) => {
                    let snapshot = proxies.snapshot();
                    executor.retain_proxies(snapshot.iter().map(|p| p.address.as_str()));
                    tracing::debug!(stats = ?proxies.stats(), "Proxy inventory refreshed");
                }
                Err(e) => tracing::warn!(error = %e, "Proxy inventory refresh failed; keeping the old list"),
            }
        }
    });
}

/// Solver used by `run`: the HTTP service when configured, otherwise every
/// challenge stays unresolved.
#[derive(Clone)]
enum CliSolver {
    Http(HttpCaptchaSolver),
    Disabled,
}

impl CaptchaSolver for CliSolver {
    async fn solve(&self, challenge: &Challenge) -> Result<String, AppError> {
        match self {
            CliSolver::Http(solver) => solver.solve(challenge).await,
            CliSolver::Disabled => Err(AppError::CaptchaSolver(
                "No CAPTCHA endpoint configured".into(),
            )),
        }
    }
}
