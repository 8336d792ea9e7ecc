use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use daemon::{Daemon, DaemonConfig, HtmlRenderer, LocalReader, ScanLoader, Worker};
use db::{DbAdapter, IndexWriter, JobQueue, SqliteAdapter, ensure_schema};
use index::Operation;
use realm_core::RealmConfig;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "realmdex")]
#[command(about = "Content realm search indexer")]
struct Cli {
  /// Config file (TOML); defaults to ./realmdex.toml when present
  #[arg(long, global = true)]
  config: Option<PathBuf>,

  /// Realm base URL override
  #[arg(long, global = true)]
  realm_url: Option<String>,

  /// Realm directory override
  #[arg(long, global = true)]
  realm_dir: Option<PathBuf>,

  /// Index store path override
  #[arg(long, global = true)]
  db_path: Option<PathBuf>,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Run the indexing worker daemon for a realm
  Serve,
  /// Queue a full re-index of the realm and wait for it
  Reindex,
  /// Queue re-indexing for one changed file and wait for it
  Update {
    /// Absolute URL of the changed file
    url: String,
  },
  /// Queue removal of a deleted file from the index and wait for it
  Remove {
    /// Absolute URL of the deleted file
    url: String,
  },
}

fn load_config(cli: &Cli) -> Result<RealmConfig> {
  let path = cli.config.clone().unwrap_or_else(|| PathBuf::from("realmdex.toml"));
  let mut config = RealmConfig::load(&path).with_context(|| format!("loading config from {}", path.display()))?;
  if let Some(realm_url) = &cli.realm_url {
    config.realm_url = realm_url.clone();
  }
  if let Some(realm_dir) = &cli.realm_dir {
    config.realm_dir = realm_dir.clone();
  }
  if let Some(db_path) = &cli.db_path {
    config.db_path = Some(db_path.clone());
  }
  Ok(config)
}

/// One-shot commands spin up an in-process worker against the configured
/// store, publish their job, and wait for the result.
async fn run_job(config: RealmConfig, command: &Commands) -> Result<()> {
  let db_path = config.db_path.clone().unwrap_or_else(|| db::default_data_dir().join("index.db"));
  let adapter: Arc<dyn DbAdapter> = Arc::new(SqliteAdapter::open(&db_path)?);
  ensure_schema(adapter.as_ref()).await?;

  let queue = Arc::new(
    JobQueue::new(adapter.clone()).with_poll_interval(Duration::from_millis(config.queue.poll_interval_ms)),
  );
  let writer = Arc::new(IndexWriter::new(adapter.clone()));
  let reader = Arc::new(LocalReader::new(config.realm_dir.clone()));
  let loader = Arc::new(ScanLoader::new(&config.realm_url, config.realm_dir.clone())?);
  let worker = Worker::new(queue.clone(), writer, reader, loader, Arc::new(HtmlRenderer));
  worker.run().await;

  let job = match command {
    Commands::Reindex => worker.enqueue_from_scratch(&config.realm_url).await?,
    Commands::Update { url } => worker.enqueue_incremental(&config.realm_url, url, Operation::Update).await?,
    Commands::Remove { url } => worker.enqueue_incremental(&config.realm_url, url, Operation::Delete).await?,
    Commands::Serve => unreachable!("serve is handled by the daemon"),
  };

  match job.done().await {
    Ok(result) => {
      println!("{}", serde_json::to_string_pretty(&result)?);
      queue.destroy().await;
      Ok(())
    }
    Err(err) => {
      queue.destroy().await;
      Err(anyhow::anyhow!("job failed: {err}"))
    }
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  let (writer, _guard) = tracing_appender::non_blocking(std::io::stderr());
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .with_writer(writer)
    .init();

  let cli = Cli::parse();
  let config = load_config(&cli)?;

  match &cli.command {
    Commands::Serve => {
      let data_dir = db::default_data_dir();
      Daemon::new(DaemonConfig {
        realm: config,
        data_dir,
      })
      .run()
      .await?;
      Ok(())
    }
    command => run_job(config, command).await,
  }
}
