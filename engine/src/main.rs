use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use tokio::sync::RwLock;
use tracing::info;

use visor_config::{load_config, LoadedConfig, LoaderOptions};
use visor_core::engine::{Engine, EngineOptions, Invocation, WorkflowProvider};
use visor_core::{
    DimensionLimits, EventBus, PoolConfig, PromptStore, ProviderRegistry, RateLimitConfig,
};
use visor_host::{
    webhook_router, EngineExecutor, TriggerService, WebhookConfig, WebhookOutputAdapter,
};
use visor_schedule::scheduler::{Scheduler, SchedulerOptions};
use visor_schedule::{FileBackend, MemoryBackend, ScheduleStore, SqlBackend};
use visor_types::{
    HaConfig, InvocationInput, OutputKind, OutputTarget, Schedule, ScheduleStatus, TagFilter,
    VisorConfig,
};

mod output;

#[derive(Parser, Debug)]
#[command(name = "visor")]
#[command(about = "Declarative workflow automation engine")]
#[command(version)]
struct Cli {
    /// Path to the configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true, default_value_t = false)]
    debug: bool,
    #[arg(long, global = true, default_value_t = false)]
    quiet: bool,

    #[command(flatten)]
    run: RunArgs,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Execute steps from the configuration (the default).
    Run(RunArgs),
    /// Load and validate the configuration without executing anything.
    Validate,
    /// Serve webhook ingress and the scheduler as a daemon.
    Serve {
        #[arg(long, alias = "host", default_value = "127.0.0.1")]
        hostname: String,
        #[arg(long, default_value_t = 8080)]
        port: u16,
        /// Shared HMAC secret for inbound webhooks.
        #[arg(long, env = "VISOR_WEBHOOK_SECRET")]
        webhook_secret: Option<String>,
    },
    /// Manage dynamic schedules.
    Schedule {
        #[command(subcommand)]
        action: ScheduleAction,
    },
}

#[derive(Args, Debug, Clone, Default)]
struct RunArgs {
    /// Root steps to run; repeatable. Empty runs every step.
    #[arg(long = "check")]
    checks: Vec<String>,
    #[arg(long, value_parser = ["table", "json"])]
    output: Option<String>,
    #[arg(long)]
    output_file: Option<PathBuf>,
    /// Per-step timeout in milliseconds.
    #[arg(long)]
    timeout: Option<u64>,
    #[arg(long)]
    max_parallelism: Option<usize>,
    #[arg(long, default_value_t = false)]
    fail_fast: bool,
    /// Comma-separated tags a step must carry.
    #[arg(long)]
    tags: Option<String>,
    /// Comma-separated tags that exclude a step.
    #[arg(long)]
    exclude_tags: Option<String>,
    /// Trigger event type steps are filtered against.
    #[arg(long, default_value = "all")]
    event: String,
}

#[derive(Subcommand, Debug)]
enum ScheduleAction {
    /// Run the scheduler daemon in the foreground.
    Start,
    List,
    Create {
        /// Cron expression (`*/5 * * * *`) or RFC3339 instant.
        #[arg(long)]
        at: String,
        /// Step to execute; omitted runs every step.
        #[arg(long)]
        workflow: Option<String>,
        /// Delivery target as `type:target`, e.g. `webhook:https://…`.
        #[arg(long)]
        output: Option<String>,
        /// JSON payload passed to the workflow.
        #[arg(long)]
        inputs: Option<String>,
        #[arg(long)]
        timezone: Option<String>,
        /// Fire immediately after creation as well.
        #[arg(long, default_value_t = false)]
        force: bool,
    },
    Cancel {
        id: String,
    },
    Pause {
        id: String,
    },
    Resume {
        id: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let _log_guard = init_logging(&cli);
    let code = match run_cli(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            1
        }
    };
    std::process::exit(code);
}

/// Daemon modes log to daily JSONL files under `.visor/logs`; one-shot
/// commands log to the console only. The returned guard must live for the
/// whole process.
fn init_logging(cli: &Cli) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let debug = cli.debug || env_flag("VISOR_DEBUG");
    let filter = if debug {
        "debug"
    } else if cli.quiet {
        "warn"
    } else {
        "info"
    };
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", filter);
    }

    let daemon = matches!(
        cli.command,
        Some(Command::Serve { .. })
            | Some(Command::Schedule {
                action: ScheduleAction::Start,
            })
    );
    if daemon {
        if let Ok((guard, _info)) = visor_observability::init_process_logging(
            visor_observability::ProcessKind::Engine,
            std::path::Path::new(".visor/logs"),
            14,
        ) {
            return Some(guard);
        }
    }
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .init();
    None
}

async fn run_cli(cli: Cli) -> anyhow::Result<i32> {
    let config_path = resolve_config_path(cli.config.clone());
    match cli.command {
        None => run_checks(&config_path, cli.run, cli.quiet).await,
        Some(Command::Run(args)) => run_checks(&config_path, args, cli.quiet).await,
        Some(Command::Validate) => validate(&config_path).await,
        Some(Command::Serve {
            hostname,
            port,
            webhook_secret,
        }) => serve(&config_path, &hostname, port, webhook_secret).await,
        Some(Command::Schedule { action }) => schedule(&config_path, action).await,
    }
}

// ---------------------------------------------------------------------------
// Option resolution — the only place environment variables are read.
// ---------------------------------------------------------------------------

fn resolve_config_path(flag: Option<PathBuf>) -> PathBuf {
    if let Some(path) = flag {
        return path;
    }
    if let Ok(path) = std::env::var("VISOR_CONFIG_PATH") {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }
    PathBuf::from(".visor.yaml")
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|value| matches!(value.trim(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}

fn loader_options() -> LoaderOptions {
    LoaderOptions {
        allow_remote_extends: !env_flag("VISOR_NO_REMOTE_EXTENDS"),
        ..LoaderOptions::default()
    }
}

fn parse_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn engine_options(config: &VisorConfig, args: &RunArgs) -> EngineOptions {
    let mut options = EngineOptions::from_config(config);
    if let Some(max) = args.max_parallelism {
        options.max_parallelism = max.max(1);
    }
    if args.fail_fast {
        options.fail_fast = true;
    }
    if let Some(timeout) = args.timeout {
        options.default_step_timeout = Some(Duration::from_millis(timeout));
    }
    if args.tags.is_some() || args.exclude_tags.is_some() {
        options.tag_filter = Some(TagFilter {
            include: args.tags.as_deref().map(parse_csv).unwrap_or_default(),
            exclude: args
                .exclude_tags
                .as_deref()
                .map(parse_csv)
                .unwrap_or_default(),
        });
    }
    options
}

// ---------------------------------------------------------------------------
// Runtime assembly
// ---------------------------------------------------------------------------

fn build_engine(config: Arc<VisorConfig>, options: EngineOptions) -> (Engine, EventBus) {
    let bus = EventBus::new();
    let prompts = PromptStore::new();
    let providers = ProviderRegistry::with_builtins(bus.clone(), prompts);
    let workflow = Arc::new(WorkflowProvider::new());
    providers.register(Arc::clone(&workflow) as Arc<dyn visor_core::Provider>);
    let engine = Engine::new(config, providers, bus.clone(), options);
    workflow.wire(engine.clone());
    (engine, bus)
}

async fn load(config_path: &PathBuf, quiet: bool) -> anyhow::Result<LoadedConfig> {
    let loaded = load_config(config_path, &loader_options())
        .await
        .with_context(|| format!("loading {}", config_path.display()))?;
    if !quiet {
        for warning in &loaded.warnings {
            eprintln!("warning: {warning}");
        }
    }
    Ok(loaded)
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

async fn run_checks(config_path: &PathBuf, args: RunArgs, quiet: bool) -> anyhow::Result<i32> {
    let loaded = load(config_path, quiet).await?;
    let options = engine_options(&loaded.config, &args);
    let (engine, _bus) = build_engine(Arc::new(loaded.config), options);

    let input = InvocationInput {
        run_id: String::new(),
        event_type: args.event.clone(),
        payload: serde_json::Value::Null,
        env: std::env::vars().collect(),
    };
    let results = engine.run(Invocation::new(args.checks.clone(), input)).await;

    let format = args
        .output
        .or_else(|| std::env::var("VISOR_OUTPUT_FORMAT").ok())
        .unwrap_or_else(|| "table".to_string());
    let rendered = match format.as_str() {
        "json" => output::render_json(&results)?,
        _ => output::render_table(&results),
    };
    match &args.output_file {
        Some(path) => tokio::fs::write(path, rendered).await?,
        None => println!("{rendered}"),
    }

    let any_failed = results
        .all_results()
        .any(|result| result.conclusion.is_failed());
    let failed = results.has_critical_issues()
        || any_failed
        || results.conclusion == visor_types::RunConclusion::Error;
    Ok(if failed { 1 } else { 0 })
}

async fn validate(config_path: &PathBuf) -> anyhow::Result<i32> {
    match load_config(config_path, &loader_options()).await {
        Ok(loaded) => {
            for warning in &loaded.warnings {
                println!("warning: {warning}");
            }
            println!(
                "{} is valid ({} steps)",
                config_path.display(),
                loaded.config.steps.len()
            );
            Ok(0)
        }
        Err(err) => {
            eprintln!("{err}");
            Ok(1)
        }
    }
}

async fn open_store(config: &VisorConfig) -> anyhow::Result<Arc<ScheduleStore>> {
    let spec = config
        .scheduler
        .as_ref()
        .and_then(|s| s.store.as_deref())
        .unwrap_or("file");
    let store = match spec {
        "memory" => ScheduleStore::new(Box::new(MemoryBackend::new())),
        "file" => ScheduleStore::new(Box::new(
            FileBackend::open(visor_schedule::backend::file::DEFAULT_SCHEDULES_PATH).await?,
        )),
        url if url.starts_with("postgres://") || url.starts_with("postgresql://") => {
            ScheduleStore::new(Box::new(SqlBackend::connect(url).await?))
        }
        path => ScheduleStore::new(Box::new(FileBackend::open(path).await?)),
    };
    Ok(Arc::new(store))
}

fn build_scheduler(
    config: &Arc<VisorConfig>,
    engine: Engine,
    store: Arc<ScheduleStore>,
) -> Scheduler {
    let scheduler_config = config.scheduler.clone().unwrap_or_default();
    let scheduler = Scheduler::new(
        store,
        Arc::new(EngineExecutor::new(engine)),
        SchedulerOptions {
            node_id: format!("visor-{}", uuid::Uuid::new_v4()),
            check_interval: Duration::from_millis(scheduler_config.check_interval_ms),
            ha: HaConfig {
                enabled: scheduler_config.ha.enabled,
                heartbeat_interval_sec: scheduler_config.ha.heartbeat_interval_sec,
                lock_ttl_sec: scheduler_config.ha.lock_ttl_sec,
            },
        },
    );
    if let Ok(adapter) = WebhookOutputAdapter::new(Duration::from_secs(30)) {
        scheduler.register_adapter(OutputKind::Webhook, Arc::new(adapter));
    }
    scheduler
}

async fn serve(
    config_path: &PathBuf,
    hostname: &str,
    port: u16,
    webhook_secret: Option<String>,
) -> anyhow::Result<i32> {
    let loaded = load(config_path, false).await?;
    let config = Arc::new(loaded.config);
    let options = EngineOptions::from_config(&config);
    let (engine, _bus) = build_engine(Arc::clone(&config), options);

    let service = TriggerService::new(
        engine.clone(),
        RateLimitConfig {
            global: Some(DimensionLimits {
                requests_per_minute: 600,
                requests_per_hour: 10_000,
                concurrent_requests: 0,
            }),
            channel: Some(DimensionLimits {
                requests_per_minute: 60,
                requests_per_hour: 1_000,
                concurrent_requests: 8,
            }),
            ..RateLimitConfig::default()
        },
        PoolConfig::default(),
        Arc::new(RwLock::new(HashMap::new())),
    );

    let store = open_store(&config).await?;
    let scheduler = build_scheduler(&config, engine.clone(), store);
    let static_jobs = config
        .scheduler
        .as_ref()
        .map(|s| s.jobs.clone())
        .unwrap_or_default();
    scheduler.start(&static_jobs).await?;

    let router = webhook_router(
        Arc::clone(&service),
        WebhookConfig {
            secret: webhook_secret,
            ..WebhookConfig::default()
        },
    );
    let addr: SocketAddr = format!("{hostname}:{port}")
        .parse()
        .context("invalid hostname or port")?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("visor serving on http://{addr}");

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    scheduler.stop().await;
    service.shutdown().await;
    Ok(0)
}

async fn schedule(config_path: &PathBuf, action: ScheduleAction) -> anyhow::Result<i32> {
    let loaded = load(config_path, true).await?;
    let config = Arc::new(loaded.config);
    let store = open_store(&config).await?;

    match action {
        ScheduleAction::Start => {
            let options = EngineOptions::from_config(&config);
            let (engine, _bus) = build_engine(Arc::clone(&config), options);
            let scheduler = build_scheduler(&config, engine, store);
            let static_jobs = config
                .scheduler
                .as_ref()
                .map(|s| s.jobs.clone())
                .unwrap_or_default();
            scheduler.start(&static_jobs).await?;
            info!("scheduler running; press ctrl-c to stop");
            let _ = tokio::signal::ctrl_c().await;
            scheduler.stop().await;
            Ok(0)
        }
        ScheduleAction::List => {
            let schedules = store.get_all().await?;
            if schedules.is_empty() {
                println!("no schedules");
                return Ok(0);
            }
            for schedule in schedules {
                println!(
                    "{}  {:<9}  {}  next={}  runs={} failures={}",
                    schedule.id,
                    format!("{:?}", schedule.status).to_lowercase(),
                    schedule
                        .cron
                        .clone()
                        .unwrap_or_else(|| schedule
                            .run_at
                            .map(|at| at.to_rfc3339())
                            .unwrap_or_else(|| "-".to_string())),
                    schedule
                        .next_run_at
                        .map(|at| at.to_rfc3339())
                        .unwrap_or_else(|| "-".to_string()),
                    schedule.run_count,
                    schedule.failure_count,
                );
            }
            Ok(0)
        }
        ScheduleAction::Create {
            at,
            workflow,
            output,
            inputs,
            timezone,
            force,
        } => {
            let mut schedule = parse_schedule_expr(&at)?;
            schedule.workflow = workflow;
            if let Some(tz) = timezone {
                visor_schedule::cron::parse_tz(&tz)?;
                schedule.timezone = tz;
            }
            if let Some(raw) = inputs {
                schedule.inputs =
                    serde_json::from_str(&raw).context("--inputs must be valid JSON")?;
            }
            if let Some(raw) = output {
                schedule.output = parse_output_target(&raw)?;
            }
            if let Some(expr) = &schedule.cron {
                schedule.next_run_at =
                    visor_schedule::cron::next_after(expr, Utc::now(), &schedule.timezone)?;
            }
            let id = schedule.id.clone();
            store.create(schedule).await?;
            println!("created schedule {id}");
            if force {
                let options = EngineOptions::from_config(&config);
                let (engine, _bus) = build_engine(Arc::clone(&config), options);
                let scheduler = build_scheduler(&config, engine, store);
                scheduler.fire(&id).await;
                println!("fired schedule {id}");
            }
            Ok(0)
        }
        ScheduleAction::Cancel { id } => {
            if store.delete(&id).await? {
                println!("cancelled schedule {id}");
                Ok(0)
            } else {
                eprintln!("schedule {id} not found");
                Ok(1)
            }
        }
        ScheduleAction::Pause { id } => {
            store
                .update(&id, |s| s.status = ScheduleStatus::Paused)
                .await?;
            println!("paused schedule {id}");
            Ok(0)
        }
        ScheduleAction::Resume { id } => {
            store
                .update(&id, |s| {
                    s.status = ScheduleStatus::Active;
                    s.failure_count = 0;
                })
                .await?;
            println!("resumed schedule {id}");
            Ok(0)
        }
    }
}

/// `--at` accepts a 5-field cron expression (recurring) or an RFC3339
/// instant (one-shot).
fn parse_schedule_expr(at: &str) -> anyhow::Result<Schedule> {
    if visor_schedule::cron::validate(at).is_ok() {
        return Ok(Schedule::recurring(at));
    }
    if let Ok(instant) = chrono::DateTime::parse_from_rfc3339(at) {
        return Ok(Schedule::one_shot(instant.with_timezone(&Utc)));
    }
    anyhow::bail!("--at '{at}' is neither a cron expression nor an RFC3339 timestamp")
}

fn parse_output_target(raw: &str) -> anyhow::Result<OutputTarget> {
    let (kind, target) = raw
        .split_once(':')
        .map(|(kind, target)| (kind, Some(target.to_string())))
        .unwrap_or((raw, None));
    let kind = match kind {
        "slack" => OutputKind::Slack,
        "github" => OutputKind::Github,
        "webhook" => OutputKind::Webhook,
        "none" => OutputKind::None,
        other => anyhow::bail!("unknown output type '{other}'"),
    };
    Ok(OutputTarget { kind, target })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_expr_distinguishes_cron_from_instant() {
        let recurring = parse_schedule_expr("*/5 * * * *").unwrap();
        assert!(recurring.cron.is_some());
        assert!(recurring.run_at.is_none());

        let one_shot = parse_schedule_expr("2026-09-01T12:00:00Z").unwrap();
        assert!(one_shot.cron.is_none());
        assert!(one_shot.run_at.is_some());

        assert!(parse_schedule_expr("whenever").is_err());
    }

    #[test]
    fn output_target_parses_kind_and_target() {
        let webhook = parse_output_target("webhook:https://example.com/sink").unwrap();
        assert_eq!(webhook.kind, OutputKind::Webhook);
        assert_eq!(webhook.target.as_deref(), Some("https://example.com/sink"));

        let none = parse_output_target("none").unwrap();
        assert_eq!(none.kind, OutputKind::None);
        assert!(parse_output_target("carrier-pigeon:coop").is_err());
    }

    #[test]
    fn csv_parsing_trims_and_drops_empties() {
        assert_eq!(parse_csv("fast, unit ,,"), vec!["fast", "unit"]);
    }
}
