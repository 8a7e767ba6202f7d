//! taskbridge CLI: run payloads through a worker script and print the results.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use futures::future::join_all;
use serde_json::{Value, json};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use taskbridge::{CrashPolicy, DispatcherConfig, DispatcherRegistry};

/// Send tasks to a long-lived worker subprocess.
#[derive(Parser, Debug)]
#[command(name = "taskbridge", version, about)]
struct Args {
    /// Worker script.
    script: PathBuf,

    /// Task payloads. Each is parsed as JSON, or sent as a JSON string if it
    /// does not parse.
    payloads: Vec<String>,

    /// Interpreter used to run the script.
    #[arg(long, default_value = taskbridge::config::DEFAULT_INTERPRETER)]
    interpreter: String,

    /// Maximum tasks in flight at once.
    #[arg(long, default_value_t = taskbridge::config::DEFAULT_MAX_CONCURRENCY)]
    max_concurrency: usize,

    /// Per-task timeout in milliseconds.
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Re-send in-flight tasks after a worker crash instead of failing them.
    #[arg(long)]
    redeliver: bool,

    /// Don't log task start/finish.
    #[arg(short, long)]
    quiet: bool,
}

/// Initialize tracing with TASKBRIDGE_LOG and LOG_FORMAT support.
fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("TASKBRIDGE_LOG").as_deref() {
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!("taskbridge={level}"))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

fn parse_payload(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let mut config = DispatcherConfig::new(&args.script)
        .with_interpreter(args.interpreter)
        .with_max_concurrency(args.max_concurrency)
        .with_logging(!args.quiet);
    if args.redeliver {
        config = config.with_crash_policy(CrashPolicy::Redeliver);
    }
    if let Some(ms) = args.timeout_ms {
        config = config.with_request_timeout(Duration::from_millis(ms));
    }

    let registry = DispatcherRegistry::new();
    let dispatcher = registry
        .get_or_start(config)
        .with_context(|| format!("failed to start worker {}", args.script.display()))?;

    let tasks: Vec<Value> = args.payloads.iter().map(|p| parse_payload(p)).collect();
    let results = join_all(
        tasks
            .iter()
            .map(|task| dispatcher.submit::<Value, Value>(task)),
    )
    .await;

    let mut failed = 0;
    for (task, result) in tasks.iter().zip(results) {
        let line = match result {
            Ok(value) => json!({ "task": task, "result": value }),
            Err(e) => {
                failed += 1;
                json!({ "task": task, "error": e.to_string() })
            }
        };
        println!("{line}");
    }

    registry.shutdown_all().await;

    if failed > 0 {
        anyhow::bail!("{failed} of {} tasks failed", tasks.len());
    }
    Ok(())
}
