use clap::{Parser, Subcommand, ValueEnum};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use ledgersync::cache::{Cacheable, Request};
use ledgersync::ledger::{HttpBroadcaster, HttpProbe, HttpTransport, Market, Position};
use ledgersync::queue::OperationKind;
use ledgersync::store::SqliteStore;
use ledgersync::sync::{probe_loop, ConnectivityMonitor, HealthProbe, NetworkState};
use ledgersync::{Config, OfflineLayer};

type Layer = OfflineLayer<SqliteStore, HttpTransport, HttpBroadcaster>;

#[derive(Parser, Debug)]
#[command(name = "ledgersync")]
#[command(about = "Offline cache and write queue for ledger clients")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/ledgersync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Show queued operations
  Status,
  /// Queue a write operation
  Enqueue {
    /// create, stake-yes, stake-no, resolve or claim
    kind: String,
    /// Operation parameters as JSON
    #[arg(short, long, default_value = "{}")]
    params: String,
  },
  /// Probe the network and drain the queue once
  Sync,
  /// Fetch a URL through the response cache
  Fetch { url: String },
  /// List cached snapshots of one entity type
  Snapshots {
    #[arg(value_enum)]
    entity: EntityType,
  },
  /// Probe connectivity and drain on reconnect until Ctrl-C
  Watch,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum EntityType {
  Market,
  Position,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _guard = init_tracing()?;

  let config = Config::load(args.config.as_deref())?;
  let store = Arc::new(SqliteStore::open(&config.database_path()?)?);
  let connectivity = ConnectivityMonitor::new(NetworkState::Offline);
  let layer = OfflineLayer::new(
    store,
    Arc::new(HttpTransport::new(&config)?),
    Arc::new(HttpBroadcaster::new(&config)?),
    connectivity,
    &config,
  )?;

  match args.command {
    Command::Status => status(&layer),
    Command::Enqueue { kind, params } => {
      let kind: OperationKind = kind.parse()?;
      let params: serde_json::Value = serde_json::from_str(&params)
        .map_err(|e| eyre!("Failed to parse params as JSON: {}", e))?;
      let id = layer.enqueue(kind, params)?;
      println!("queued operation {} ({})", id, kind);
      Ok(())
    }
    Command::Sync => sync_once(&layer, &config).await,
    Command::Fetch { url } => fetch(&layer, &url).await,
    Command::Snapshots { entity } => match entity {
      EntityType::Market => print_snapshots::<Market>(&layer),
      EntityType::Position => print_snapshots::<Position>(&layer),
    },
    Command::Watch => watch(&layer, &config).await,
  }
}

/// Log to a daily file under the data directory. The guard flushes on drop.
fn init_tracing() -> Result<WorkerGuard> {
  let log_dir = dirs::data_dir()
    .ok_or_else(|| eyre!("Could not determine data directory"))?
    .join("ledgersync")
    .join("logs");
  std::fs::create_dir_all(&log_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;

  let appender = tracing_appender::rolling::daily(log_dir, "ledgersync.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);

  let filter =
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ledgersync=info"));

  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(writer)
    .with_ansi(false)
    .try_init()
    .map_err(|e| eyre!("Failed to install tracing subscriber: {}", e))?;

  Ok(guard)
}

fn status(layer: &Layer) -> Result<()> {
  let operations = layer.list_pending()?;
  println!(
    "{} pending, {} failed",
    layer.pending_count()?,
    layer.failed_count()?
  );
  for op in operations {
    let error = op.last_error.as_deref().unwrap_or("");
    println!(
      "{:>6}  {:<9}  {:<7}  attempts={}  {}  {}",
      op.id,
      op.kind.as_str(),
      op.status.as_str(),
      op.attempts,
      op.enqueued_at.format("%Y-%m-%d %H:%M:%S"),
      error
    );
  }
  Ok(())
}

async fn sync_once(layer: &Layer, config: &Config) -> Result<()> {
  let probe = HttpProbe::new(config)?;
  let state = if probe.is_reachable().await {
    NetworkState::Online
  } else {
    NetworkState::Offline
  };
  layer.connectivity().set(state);

  match layer.sync_now().await? {
    Some(report) => println!(
      "attempted {}, succeeded {}, failed {}",
      report.attempted, report.succeeded, report.failed
    ),
    None => println!("offline: {} operations stay queued", layer.pending_count()?),
  }
  Ok(())
}

async fn fetch(layer: &Layer, url: &str) -> Result<()> {
  let request = Request::parse_get(url)?;
  let result = layer.intercept(&request).await?;
  eprintln!(
    "{} ({:?}{})",
    result.data.status,
    result.source,
    result
      .cached_at
      .map(|at| format!(", cached {}", at.to_rfc3339()))
      .unwrap_or_default()
  );
  println!("{}", result.data.text());
  Ok(())
}

fn print_snapshots<E: Cacheable>(layer: &Layer) -> Result<()> {
  let snapshots = layer.cached_snapshots::<E>()?;
  for snapshot in snapshots {
    let json = serde_json::to_string(&snapshot.entity)
      .map_err(|e| eyre!("Failed to serialize {}: {}", E::entity_type(), e))?;
    println!("{}  {}", snapshot.cached_at.to_rfc3339(), json);
  }
  Ok(())
}

async fn watch(layer: &Layer, config: &Config) -> Result<()> {
  let probe = HttpProbe::new(config)?;
  let prober = tokio::spawn(probe_loop(
    layer.connectivity().clone(),
    probe,
    config.sync.probe_interval(),
  ));
  layer.start();

  let mut status = layer.subscribe();
  let shutdown = tokio::signal::ctrl_c();
  tokio::pin!(shutdown);
  info!("watching for connectivity changes");
  loop {
    tokio::select! {
      changed = status.changed() => {
        if changed.is_err() {
          break;
        }
        let s = status.borrow_and_update().clone();
        println!(
          "{}  draining={}  {}/{}  pending={}  failed={}",
          if s.online { "online " } else { "offline" },
          s.draining,
          s.processed,
          s.total,
          s.pending,
          s.failed
        );
      }
      _ = &mut shutdown => break,
    }
  }

  prober.abort();
  Ok(())
}
