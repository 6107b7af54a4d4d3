use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use usedb::binding::{Binding, HttpBinding, MemoryBinding, SqliteBinding};
use usedb::cache::Store;
use usedb::config::{BindingConfig, Config, LogConfig};
use usedb::{Connection, FetchPolicy, Operation, QueryDescriptor, QueryOptions};

#[derive(Parser, Debug)]
#[command(name = "usedb")]
#[command(about = "Run queries through a normalized, cached data layer")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/usedb/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Perform one query and print the denormalized result
  Query {
    /// Collection name, e.g. Post
    collection: String,
    /// findOne, findMany, count, create, update, updateMany, delete,
    /// deleteMany or action:<name>
    operation: Operation,
    /// JSON payload (where, data, cursor, take, ...)
    payload: Option<String>,
    /// Fetch policy; defaults per operation
    #[arg(long)]
    policy: Option<FetchPolicy>,
    /// Apply an update to the local store before the backend answers
    #[arg(long)]
    optimistic: bool,
  },
  /// List collections known to the binding
  Collections,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;
  let _log_guard = init_logging(&config.log)?;

  let store = Store::new(config.schema()?);
  let connection = Connection::with_binding(open_binding(&config.binding)?, store);

  match args.command {
    Command::Query {
      collection,
      operation,
      payload,
      policy,
      optimistic,
    } => {
      let payload = match payload {
        Some(raw) => {
          serde_json::from_str(&raw).map_err(|e| eyre!("Invalid payload JSON: {}", e))?
        }
        None => Value::Object(Default::default()),
      };
      let options = QueryOptions {
        fetch_policy: policy,
        optimistic,
        ..Default::default()
      };

      let query = connection.query(QueryDescriptor::new(collection, operation, payload), options);
      let data = query.run().await?;
      println!("{}", serde_json::to_string_pretty(&data.unwrap_or(Value::Null))?);
    }
    Command::Collections => {
      let collections = connection.get_all_collections().await?;
      println!("{}", serde_json::to_string_pretty(&collections)?);
    }
  }

  Ok(())
}

fn open_binding(config: &BindingConfig) -> Result<Arc<dyn Binding>> {
  let binding: Arc<dyn Binding> = match config {
    BindingConfig::Memory { seed: None } => Arc::new(MemoryBinding::new()),
    BindingConfig::Memory { seed: Some(path) } => Arc::new(load_seed(path)?),
    BindingConfig::Sqlite { path } => Arc::new(SqliteBinding::open(path.as_deref())?),
    BindingConfig::Http { url } => Arc::new(HttpBinding::new(url, Config::get_token())?),
  };
  Ok(binding)
}

fn load_seed(path: &Path) -> Result<MemoryBinding> {
  let contents = std::fs::read_to_string(path)
    .map_err(|e| eyre!("Failed to read seed file {}: {}", path.display(), e))?;
  let seed: Value = serde_json::from_str(&contents)
    .map_err(|e| eyre!("Failed to parse seed file {}: {}", path.display(), e))?;
  MemoryBinding::from_seed(&seed).map_err(|e| eyre!("Invalid seed file {}: {}", path.display(), e))
}

/// Log to stderr, or to a daily file under $XDG_DATA_HOME/usedb. RUST_LOG
/// overrides the configured filter.
fn init_logging(log: &LogConfig) -> Result<Option<WorkerGuard>> {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log.filter));

  if !log.file {
    tracing_subscriber::fmt()
      .with_env_filter(filter)
      .with_writer(std::io::stderr)
      .init();
    return Ok(None);
  }

  let dir = dirs::data_dir()
    .ok_or_else(|| eyre!("Could not determine data directory"))?
    .join("usedb");
  std::fs::create_dir_all(&dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", dir.display(), e))?;

  let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, "usedb.log"));
  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(writer)
    .with_ansi(false)
    .init();
  Ok(Some(guard))
}
