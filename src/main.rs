use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use serde_json::Value;
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use resilient_gateway::config::{self, Config};
use resilient_gateway::{Gateway, Params, ReadOptions, WriteMethod, WriteOptions};

#[derive(Parser, Debug)]
#[command(name = "rgw")]
#[command(about = "Cache-first, offline-tolerant client for a remote HTTP API")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/rgw/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Probe the server and show queue state
  Status,
  /// Read an endpoint through the cache
  Get {
    endpoint: String,
    /// Query parameter as key=value; values are parsed as JSON when possible
    #[arg(short, long = "param")]
    params: Vec<String>,
    /// Skip the cache lookup
    #[arg(long)]
    fresh: bool,
    /// Neither read nor populate the cache
    #[arg(long)]
    no_cache: bool,
  },
  /// Send a mutation, queueing it if the server is unreachable
  Send {
    method: WriteMethod,
    endpoint: String,
    /// JSON request body
    #[arg(short, long)]
    body: Option<String>,
    /// Fail instead of queueing when offline
    #[arg(long)]
    no_queue: bool,
  },
  /// Replay queued operations now
  Sync,
  /// List queued operations
  Pending,
  /// List failed operations
  Failed {
    /// Move failed operations back to the queue
    #[arg(long, conflicts_with = "clear")]
    retry: bool,
    /// Delete failed operations
    #[arg(long)]
    clear: bool,
  },
  /// Drop cached responses matching a pattern, or all of them
  Clear { pattern: Option<String> },
  /// Show cache statistics
  Metrics,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _log_guard = init_logging()?;

  // Load configuration
  let config = Config::load(args.config.as_deref())?;
  let gateway = Gateway::from_config(&config, Config::credentials_from_env())?;

  match args.command {
    Command::Status => {
      let reachable = gateway.check_connectivity().await;
      print_json(&serde_json::json!({
        "connectivity": gateway.connectivity_state().to_string(),
        "reachable": reachable,
        "pending": gateway.pending_offline_count()?,
        "failed": gateway.failed_operations()?.len(),
      }))?;
    }
    Command::Get {
      endpoint,
      params,
      fresh,
      no_cache,
    } => {
      let options = ReadOptions {
        use_cache: !no_cache,
        force_refresh: fresh,
        ttl: None,
      };
      let response = gateway.read(&endpoint, parse_params(&params)?, options).await?;
      print_json(&response)?;
    }
    Command::Send {
      method,
      endpoint,
      body,
      no_queue,
    } => {
      let body = match body {
        Some(raw) => serde_json::from_str(&raw).map_err(|e| eyre!("Invalid JSON body: {}", e))?,
        None => Value::Null,
      };
      // A previous run may have left the server marked unreachable
      gateway.check_connectivity().await;
      let options = WriteOptions {
        queue_when_offline: !no_queue,
      };
      let outcome = gateway.write(&endpoint, method, body, options).await?;
      print_json(&outcome)?;
    }
    Command::Sync => {
      if !gateway.check_connectivity().await {
        return Err(eyre!("Server unreachable; nothing replayed"));
      }
      let report = gateway.force_sync().await?;
      println!("{}", report);
    }
    Command::Pending => print_json(&gateway.pending_operations()?)?,
    Command::Failed { retry, clear } => {
      if retry {
        println!("{} operations re-queued", gateway.retry_failed()?);
      } else if clear {
        println!("{} operations removed", gateway.clear_failed()?);
      } else {
        print_json(&gateway.failed_operations()?)?;
      }
    }
    Command::Clear { pattern } => {
      let removed = gateway.clear_cache(pattern.as_deref());
      println!("{} cache entries removed", removed);
    }
    Command::Metrics => print_json(&gateway.cache_metrics())?,
  }

  Ok(())
}

/// Log to a daily file under the data directory; stdout is for command output.
fn init_logging() -> Result<WorkerGuard> {
  let log_dir = config::data_dir()?.join("logs");
  std::fs::create_dir_all(&log_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;

  let appender = tracing_appender::rolling::daily(&log_dir, "rgw.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);

  let filter = EnvFilter::try_from_env("RGW_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
  tracing_subscriber::registry()
    .with(fmt::layer().with_writer(writer).with_ansi(false))
    .with(filter)
    .try_init()
    .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;

  Ok(guard)
}

fn parse_params(raw: &[String]) -> Result<Params> {
  raw
    .iter()
    .map(|pair| -> Result<(String, Value)> {
      let (key, value) = pair
        .split_once('=')
        .ok_or_else(|| eyre!("Expected key=value, got {}", pair))?;
      let value =
        serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
      Ok((key.to_string(), value))
    })
    .collect()
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
  println!("{}", serde_json::to_string_pretty(value)?);
  Ok(())
}
