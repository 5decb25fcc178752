use std::error::Error;
use std::io::Read;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use runvisor::cli::{Cli, Commands, RegistryAction};
use runvisor::db::Database;
use runvisor::telemetry::{CachedEventSource, EventSource, HttpEventSource, RunState, RunWatcher, WatchEvent, WatchSettings};
use runvisor::tracing::{init_tracing, shutdown_tracing, TracingOptions};
use runvisor::{runner, JobQueue, RunnerConfig, VmRegistry};

type BoxError = Box<dyn Error + Send + Sync>;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let options = TracingOptions {
        json: cli.json,
        otlp_endpoint: cli.otlp_endpoint.clone(),
    };
    if let Err(e) = init_tracing("runvisor", &options) {
        eprintln!("failed to initialise tracing: {}", e);
        return ExitCode::FAILURE;
    }

    let code = match dispatch(cli.command).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "command failed");
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    };
    shutdown_tracing();
    code
}

fn load_config(path: &Path) -> Result<RunnerConfig, BoxError> {
    Ok(RunnerConfig::load(path)?)
}

fn read_context(path: Option<&Path>) -> Result<serde_json::Value, BoxError> {
    let text = match path {
        None => return Ok(serde_json::Value::Null),
        Some(p) if p == Path::new("-") => {
            let mut buf = String::new();
            std::io::stdin().read_to_string(&mut buf)?;
            buf
        }
        Some(p) => std::fs::read_to_string(p)?,
    };
    Ok(serde_json::from_str(&text)?)
}

async fn dispatch(command: Commands) -> Result<ExitCode, BoxError> {
    match command {
        Commands::Start { config, token } => {
            let mut config = load_config(&config)?;
            if let Some(token) = token {
                config.server.token = token;
            }
            config.validate()?;
            runner::run(config).await?;
        }

        Commands::Submit {
            config,
            run_id,
            context,
            group,
            ttl_secs,
        } => {
            let config = load_config(&config)?;
            let context = read_context(context.as_deref())?;
            let queue = JobQueue::new(Database::open(config.database_path())?);
            let group = group.unwrap_or_else(|| config.group.clone());
            let ttl = ttl_secs.map(Duration::from_secs).unwrap_or_else(|| config.lease_ttl());
            let lease = tokio::task::spawn_blocking(move || queue.enqueue(&run_id, &group, &context, ttl)).await??;
            println!("{}", serde_json::to_string_pretty(&lease)?);
        }

        Commands::Sweep { config } => {
            let config = load_config(&config)?;
            let queue = JobQueue::new(Database::open(config.database_path())?);
            let purged = tokio::task::spawn_blocking(move || queue.sweep_expired()).await??;
            info!(purged, "sweep finished");
            println!("purged {} expired lease(s)", purged);
        }

        Commands::Registry {
            action: RegistryAction::List { config },
        } => {
            let config = load_config(&config)?;
            let registry = VmRegistry::sqlite(Database::open(config.database_path())?);
            let registrations = tokio::task::spawn_blocking(move || registry.list()).await??;
            println!("{}", serde_json::to_string_pretty(&registrations)?);
        }

        Commands::CheckConfig { config } => {
            let config = load_config(&config)?;
            config.validate()?;
            println!("{}", serde_yaml::to_string(&config)?);
        }

        Commands::Watch {
            url,
            run_id,
            token,
            poll_interval_ms,
        } => return watch(url, run_id, token, poll_interval_ms).await,
    }
    Ok(ExitCode::SUCCESS)
}

/// Print a remote run's events as JSON lines until it ends
async fn watch(url: String, run_id: String, token: Option<String>, poll_interval_ms: u64) -> Result<ExitCode, BoxError> {
    let source: Arc<dyn EventSource> = Arc::new(CachedEventSource::new(HttpEventSource::new(url, token)));
    let settings = WatchSettings {
        poll_interval: Duration::from_millis(poll_interval_ms),
        ..WatchSettings::default()
    };

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    let (mut events, handle) = RunWatcher::new(run_id, source, settings).spawn(cancel);
    let mut final_state = None;
    while let Some(item) = events.recv().await {
        match item {
            WatchEvent::Event(event) => println!("{}", serde_json::to_string(&event)?),
            WatchEvent::Terminal(status) => {
                println!("{}", serde_json::to_string(&status)?);
                final_state = Some(status.state);
            }
        }
    }
    let outcome = handle.await?;
    if outcome.gaps > 0 {
        eprintln!("warning: {} sequence gap(s) in the event stream", outcome.gaps);
    }

    Ok(match final_state {
        Some(RunState::Completed) => ExitCode::SUCCESS,
        _ => ExitCode::FAILURE,
    })
}
