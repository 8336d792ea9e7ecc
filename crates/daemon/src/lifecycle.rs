use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

use db::{DbAdapter, IndexWriter, JobQueue, SqliteAdapter, ensure_schema};
use realm_core::RealmConfig;

use crate::loader::ScanLoader;
use crate::reader::LocalReader;
use crate::render::HtmlRenderer;
use crate::worker::Worker;

#[derive(Error, Debug)]
pub enum LifecycleError {
  #[error("IO error: {0}")]
  Io(#[from] std::io::Error),
  #[error("Database: {0}")]
  Db(#[from] db::DbError),
  #[error("Config: {0}")]
  Config(String),
}

/// Daemon configuration
#[derive(Debug, Clone)]
pub struct DaemonConfig {
  /// Realm served by this worker
  pub realm: RealmConfig,
  /// Data directory holding the index store when no db_path is set
  pub data_dir: PathBuf,
}

impl Default for DaemonConfig {
  fn default() -> Self {
    Self {
      realm: RealmConfig::default(),
      data_dir: db::default_data_dir(),
    }
  }
}

impl DaemonConfig {
  pub fn db_path(&self) -> PathBuf {
    self
      .realm
      .db_path
      .clone()
      .unwrap_or_else(|| self.data_dir.join("index.db"))
  }
}

/// Worker daemon lifecycle: open the store, start the worker, run until a
/// termination signal, then shut the queue down cooperatively.
pub struct Daemon {
  config: DaemonConfig,
}

impl Daemon {
  pub fn new(config: DaemonConfig) -> Self {
    Self { config }
  }

  pub async fn run(&mut self) -> Result<(), LifecycleError> {
    info!("Starting realmdex worker");
    info!("Realm: {}", self.config.realm.realm_url);
    info!("Realm dir: {:?}", self.config.realm.realm_dir);
    let db_path = self.config.db_path();
    info!("Index store: {:?}", db_path);

    let adapter: Arc<dyn DbAdapter> = Arc::new(SqliteAdapter::open(&db_path)?);
    ensure_schema(adapter.as_ref()).await?;

    let queue = Arc::new(
      JobQueue::new(adapter.clone())
        .with_poll_interval(Duration::from_millis(self.config.realm.queue.poll_interval_ms)),
    );
    let writer = Arc::new(IndexWriter::new(adapter.clone()));
    let reader = Arc::new(LocalReader::new(self.config.realm.realm_dir.clone()));
    let loader = Arc::new(
      ScanLoader::new(&self.config.realm.realm_url, self.config.realm.realm_dir.clone())
        .map_err(|err| LifecycleError::Config(err.to_string()))?,
    );
    let worker = Worker::new(queue.clone(), writer, reader, loader, Arc::new(HtmlRenderer));
    worker.run().await;

    wait_for_shutdown().await;

    info!("Shutting down");
    queue.destroy().await;
    adapter.close().await?;
    Ok(())
  }
}

async fn wait_for_shutdown() {
  #[cfg(unix)]
  {
    use tokio::signal::unix::{SignalKind, signal};
    let mut term = match signal(SignalKind::terminate()) {
      Ok(term) => term,
      Err(_) => {
        let _ = tokio::signal::ctrl_c().await;
        return;
      }
    };
    tokio::select! {
      _ = tokio::signal::ctrl_c() => {}
      _ = term.recv() => {}
    }
  }
  #[cfg(not(unix))]
  {
    let _ = tokio::signal::ctrl_c().await;
  }
}
