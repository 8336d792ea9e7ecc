// Worker loop.
//
// Binds the durable queue to the indexing run: registers the two indexing
// categories and starts the dequeue loop. All control flows through job
// publication; the worker exposes no other surface beyond the enqueue
// helpers used by the CLI and tests. Jobs are published on a queue named
// after the realm, so the queue's admission gate serializes runs per
// realm.

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::info;

use db::{HandlerResult, IndexWriter, Job, JobQueue, PublishOptions};
use index::{CardRenderer, CurrentRun, ModuleLoader, Operation, Reader, RunOptions};
use realm_core::IndexResults;

pub const FROM_SCRATCH_CATEGORY: &str = "from-scratch-index";
pub const INCREMENTAL_CATEGORY: &str = "incremental-index";

/// Args for a full re-index of a realm.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FromScratchArgs {
  pub realm_url: String,
}

/// Args for re-indexing the dependents of one changed or deleted file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncrementalArgs {
  pub realm_url: String,
  pub url: String,
  pub operation: Operation,
}

/// Long-running indexing worker bound to one store and one set of
/// collaborators.
pub struct Worker {
  queue: Arc<JobQueue>,
  writer: Arc<IndexWriter>,
  reader: Arc<dyn Reader>,
  loader: Arc<dyn ModuleLoader>,
  renderer: Arc<dyn CardRenderer>,
  /// Ignore-file data from each realm's last run, carried into the next.
  ignore_data: Mutex<HashMap<String, HashMap<String, String>>>,
}

impl Worker {
  pub fn new(
    queue: Arc<JobQueue>,
    writer: Arc<IndexWriter>,
    reader: Arc<dyn Reader>,
    loader: Arc<dyn ModuleLoader>,
    renderer: Arc<dyn CardRenderer>,
  ) -> Arc<Self> {
    Arc::new(Self {
      queue,
      writer,
      reader,
      loader,
      renderer,
      ignore_data: Mutex::new(HashMap::new()),
    })
  }

  /// Register category handlers and start the queue's dequeue loop.
  pub async fn run(self: &Arc<Self>) {
    let worker = self.clone();
    self.queue.register(
      FROM_SCRATCH_CATEGORY,
      Arc::new(move |args| {
        let worker = worker.clone();
        async move { worker.handle_from_scratch(args).await }.boxed()
      }),
    );
    let worker = self.clone();
    self.queue.register(
      INCREMENTAL_CATEGORY,
      Arc::new(move |args| {
        let worker = worker.clone();
        async move { worker.handle_incremental(args).await }.boxed()
      }),
    );
    self.queue.start().await;
    info!("indexing worker started");
  }

  /// Queue a full re-index of a realm.
  pub async fn enqueue_from_scratch(&self, realm_url: &str) -> Result<Job, db::DbError> {
    let args = serde_json::to_value(FromScratchArgs {
      realm_url: realm_url.to_string(),
    })?;
    self
      .queue
      .publish(FROM_SCRATCH_CATEGORY, args, PublishOptions::on_queue(realm_url))
      .await
  }

  /// Queue an incremental run for one changed or deleted file.
  pub async fn enqueue_incremental(
    &self,
    realm_url: &str,
    url: &str,
    operation: Operation,
  ) -> Result<Job, db::DbError> {
    let args = serde_json::to_value(IncrementalArgs {
      realm_url: realm_url.to_string(),
      url: url.to_string(),
      operation,
    })?;
    self
      .queue
      .publish(INCREMENTAL_CATEGORY, args, PublishOptions::on_queue(realm_url))
      .await
  }

  async fn handle_from_scratch(&self, args: Value) -> HandlerResult {
    let args: FromScratchArgs = serde_json::from_value(args)?;
    let options = self.options(&args.realm_url);
    let results = CurrentRun::from_scratch(&self.writer, options).await?;
    self.remember_ignore_data(&args.realm_url, &results);
    Ok(serde_json::to_value(results)?)
  }

  async fn handle_incremental(&self, args: Value) -> HandlerResult {
    let args: IncrementalArgs = serde_json::from_value(args)?;
    let options = self.options(&args.realm_url);
    let results = CurrentRun::incremental(&self.writer, options, &args.url, args.operation).await?;
    self.remember_ignore_data(&args.realm_url, &results);
    Ok(serde_json::to_value(results)?)
  }

  fn options(&self, realm_url: &str) -> RunOptions {
    RunOptions {
      realm_url: realm_url.to_string(),
      reader: self.reader.clone(),
      loader: self.loader.clone(),
      renderer: self.renderer.clone(),
      ignore_data: self
        .ignore_data
        .lock()
        .unwrap()
        .get(realm_url)
        .cloned()
        .unwrap_or_default(),
    }
  }

  fn remember_ignore_data(&self, realm_url: &str, results: &IndexResults) {
    self
      .ignore_data
      .lock()
      .unwrap()
      .insert(realm_url.to_string(), results.ignore_data.clone());
  }
}
