// Durable job queue.
//
// Jobs are rows; the per-(queue,category) record in job_queues is the
// admission-control gate: at most one execution in flight per pair, across
// every worker process sharing the store. No in-process locks participate
// in cross-worker coordination -- claims are transactions, completion is a
// transaction, and wakeups are store notifications racing a bounded poll.
//
// The claim commits before the handler runs, so a crash mid-execution
// leaves the job visibly claimed (queue record 'working') rather than
// re-dequeued.

use futures::future::BoxFuture;
use realm_core::{ErrorReporter, LogReporter, serializable_error};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::adapter::{DbAdapter, DbError, Row};
use crate::work_loop::WorkLoop;

const JOBS_CHANNEL: &str = "jobs";
const JOBS_FINISHED_CHANNEL: &str = "jobs_finished";
const DEFAULT_QUEUE_NAME: &str = "default";
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
  Unfulfilled,
  Resolved,
  Rejected,
}

impl JobStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      JobStatus::Unfulfilled => "unfulfilled",
      JobStatus::Resolved => "resolved",
      JobStatus::Rejected => "rejected",
    }
  }
}

#[derive(Error, Debug)]
pub enum JobError {
  #[error("job rejected: {0}")]
  Rejected(Value),

  #[error("queue destroyed before job completion")]
  QueueDestroyed,
}

/// Handle to a published job. `done()` resolves when some worker completes
/// the job (possibly coalesced with others). Dropping the handle abandons
/// the wait; the job still runs.
pub struct Job {
  pub id: i64,
  receiver: oneshot::Receiver<JobOutcome>,
}

impl Job {
  pub async fn done(self) -> std::result::Result<Value, JobError> {
    match self.receiver.await {
      Ok(Ok(result)) => Ok(result),
      Ok(Err(result)) => Err(JobError::Rejected(result)),
      Err(_) => Err(JobError::QueueDestroyed),
    }
  }
}

type JobOutcome = std::result::Result<Value, Value>;

pub type HandlerResult = std::result::Result<Value, Box<dyn std::error::Error + Send + Sync>>;

/// Category handler: receives the job args, returns the job result.
pub type JobHandler = Arc<dyn Fn(Value) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
  pub queue_name: Option<String>,
}

impl PublishOptions {
  pub fn on_queue(name: impl Into<String>) -> Self {
    Self {
      queue_name: Some(name.into()),
    }
  }
}

struct QueueInner {
  adapter: Arc<dyn DbAdapter>,
  handlers: std::sync::Mutex<HashMap<String, JobHandler>>,
  notifiers: std::sync::Mutex<HashMap<i64, oneshot::Sender<JobOutcome>>>,
  reporter: Arc<dyn ErrorReporter>,
}

struct Runner {
  work_loop: Arc<WorkLoop>,
  task: JoinHandle<()>,
  listener: JoinHandle<()>,
}

impl Runner {
  async fn shut_down(self) {
    self.work_loop.shut_down();
    let _ = self.task.await;
    let _ = self.listener.await;
  }
}

#[derive(Clone, Copy)]
enum RunnerKind {
  Jobs,
  Notifications,
}

pub struct JobQueue {
  inner: Arc<QueueInner>,
  poll_interval: Duration,
  job_runner: Mutex<Option<Runner>>,
  notification_runner: Mutex<Option<Runner>>,
  destroyed: AtomicBool,
}

impl JobQueue {
  pub fn new(adapter: Arc<dyn DbAdapter>) -> Self {
    Self::with_reporter(adapter, Arc::new(LogReporter))
  }

  pub fn with_reporter(adapter: Arc<dyn DbAdapter>, reporter: Arc<dyn ErrorReporter>) -> Self {
    Self {
      inner: Arc::new(QueueInner {
        adapter,
        handlers: std::sync::Mutex::new(HashMap::new()),
        notifiers: std::sync::Mutex::new(HashMap::new()),
        reporter,
      }),
      poll_interval: DEFAULT_POLL_INTERVAL,
      job_runner: Mutex::new(None),
      notification_runner: Mutex::new(None),
      destroyed: AtomicBool::new(false),
    }
  }

  pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
    self.poll_interval = poll_interval;
    self
  }

  pub fn is_destroyed(&self) -> bool {
    self.destroyed.load(Ordering::SeqCst)
  }

  /// Insert a job and return a handle resolving on completion. The queue
  /// record for (queue, category) is created idle when missing; concurrent
  /// publishes race harmlessly on the upsert.
  pub async fn publish(&self, category: &str, args: Value, opts: PublishOptions) -> Result<Job, DbError> {
    if self.is_destroyed() {
      return Err(DbError::Closed);
    }
    let queue = opts.queue_name.unwrap_or_else(|| DEFAULT_QUEUE_NAME.to_string());
    let adapter = &self.inner.adapter;
    adapter
      .execute(
        "INSERT INTO job_queues (queue_name, category, status) VALUES (?1, ?2, 'idle')
         ON CONFLICT (queue_name, category) DO NOTHING",
        &[json!(queue), json!(category)],
      )
      .await?;

    let created_at = chrono::Utc::now().timestamp_millis();
    let rows = adapter
      .execute(
        "INSERT INTO jobs (category, args, status, queue, created_at)
         VALUES (?1, ?2, 'unfulfilled', ?3, ?4) RETURNING id",
        &[json!(category), json!(args.to_string()), json!(queue), json!(created_at)],
      )
      .await?;
    let id = row_i64(&rows[0], "id");
    debug!("job {id} created, notify jobs");
    adapter.notify(JOBS_CHANNEL).await?;

    let (sender, receiver) = oneshot::channel();
    self.inner.notifiers.lock().unwrap().insert(id, sender);
    self.ensure_notification_runner().await;
    Ok(Job { id, receiver })
  }

  /// Associate an in-process handler with a category. One handler per
  /// category; a later registration replaces the earlier one.
  pub fn register(&self, category: &str, handler: JobHandler) {
    self.inner.handlers.lock().unwrap().insert(category.to_string(), handler);
  }

  /// Begin the dequeue loop. Idempotent.
  pub async fn start(&self) {
    if self.is_destroyed() {
      return;
    }
    let mut slot = self.job_runner.lock().await;
    if slot.is_none() {
      *slot = Some(self.spawn_runner("job-runner", JOBS_CHANNEL, RunnerKind::Jobs));
    }
  }

  /// Cooperative shutdown: wakes both loops and waits for them to exit.
  /// In-flight handler executions complete; pending job handles resolve
  /// with `QueueDestroyed`.
  pub async fn destroy(&self) {
    self.destroyed.store(true, Ordering::SeqCst);
    if let Some(runner) = self.job_runner.lock().await.take() {
      runner.shut_down().await;
    }
    if let Some(runner) = self.notification_runner.lock().await.take() {
      runner.shut_down().await;
    }
    self.inner.notifiers.lock().unwrap().clear();
  }

  async fn ensure_notification_runner(&self) {
    if self.is_destroyed() {
      return;
    }
    let mut slot = self.notification_runner.lock().await;
    if slot.is_none() {
      *slot = Some(self.spawn_runner("notification-runner", JOBS_FINISHED_CHANNEL, RunnerKind::Notifications));
    }
  }

  fn spawn_runner(&self, label: &'static str, channel: &str, kind: RunnerKind) -> Runner {
    let work_loop = WorkLoop::new(label, self.poll_interval);

    let inner = self.inner.clone();
    let runner_loop = work_loop.clone();
    let task = tokio::spawn(async move {
      while !runner_loop.shutting_down() {
        let outcome = match kind {
          RunnerKind::Jobs => inner.drain_queues(&runner_loop).await,
          RunnerKind::Notifications => inner.drain_notifications(&runner_loop).await,
        };
        if let Err(err) = outcome {
          inner.reporter.capture(label, &err);
          warn!("[{label}] drain failed: {err}");
        }
        runner_loop.sleep().await;
      }
    });

    let mut notifications = self.inner.adapter.subscribe(channel);
    let mut shutdown = work_loop.shutdown_signal();
    let waker = work_loop.clone();
    let listener = tokio::spawn(async move {
      loop {
        tokio::select! {
          received = notifications.recv() => match received {
            Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => waker.wake(),
            Err(broadcast::error::RecvError::Closed) => break,
          },
          _ = shutdown.changed() => break,
        }
      }
    });

    Runner {
      work_loop,
      task,
      listener,
    }
  }
}

impl QueueInner {
  /// One claim/execute/complete cycle per iteration, looping until no
  /// claimable work remains.
  async fn drain_queues(&self, work_loop: &WorkLoop) -> Result<(), DbError> {
    while !work_loop.shutting_down() {
      debug!("draining queues");
      let mut txn = self.adapter.begin().await?;
      let jobs = txn
        .execute(
          "SELECT id, category, args, queue FROM jobs WHERE status = 'unfulfilled'
           ORDER BY created_at, id LIMIT 1 FOR UPDATE SKIP LOCKED",
          &[],
        )
        .await?;
      let Some(first) = jobs.first() else {
        debug!("found no work");
        txn.rollback().await?;
        return Ok(());
      };
      let job_id = row_i64(first, "id");
      let category = row_str(first, "category").to_string();
      let queue = row_str(first, "queue").to_string();
      let args = row_json(first, "args");

      // admission control: at most one in-flight execution per
      // (queue, category), even with many workers on one store
      let idle = txn
        .execute(
          "SELECT queue_name FROM job_queues WHERE queue_name = ?1 AND category = ?2
           AND status = 'idle' FOR UPDATE SKIP LOCKED",
          &[json!(queue), json!(category)],
        )
        .await?;
      if idle.is_empty() {
        debug!("queue/category for job {job_id}, '{queue}/{category}' is not idle");
        txn.rollback().await?;
        return Ok(());
      }

      txn
        .execute(
          "UPDATE job_queues SET status = 'working' WHERE queue_name = ?1 AND category = ?2",
          &[json!(queue), json!(category)],
        )
        .await?;

      // coalesce every still-unfulfilled job with the same category and
      // deep-equal args; one execution satisfies all of them
      let candidates = txn
        .execute(
          "SELECT id, args FROM jobs WHERE status = 'unfulfilled' AND queue = ?1 AND category = ?2 ORDER BY id",
          &[json!(queue), json!(category)],
        )
        .await?;
      let coalesced: Vec<i64> = candidates
        .iter()
        .filter(|row| row_json(row, "args") == args)
        .map(|row| row_i64(row, "id"))
        .collect();

      // the claim must be durable before execution starts
      txn.commit().await?;
      debug!("claimed queue {queue}/{category}, running {coalesced:?}");

      let handler = self.handlers.lock().unwrap().get(&category).cloned();
      let outcome: HandlerResult = match handler {
        Some(handler) => handler(args.clone()).await,
        None => Err(format!("unknown job handler {category}").into()),
      };
      let (status, result) = match outcome {
        Ok(value) => (JobStatus::Resolved, value),
        Err(err) => {
          self.reporter.capture("job execution", &err);
          error!("error running job {job_id}: category={category} queue={queue} args={args}: {err}");
          let err_ref: &(dyn std::error::Error + 'static) = err.as_ref();
          (JobStatus::Rejected, serializable_error(err_ref))
        }
      };
      debug!("finished {coalesced:?} as {}", status.as_str());

      let mut txn = self.adapter.begin().await?;
      let finished_at = chrono::Utc::now().timestamp_millis();
      for id in &coalesced {
        txn
          .execute(
            "UPDATE jobs SET result = ?1, status = ?2, finished_at = ?3 WHERE id = ?4",
            &[
              json!(result.to_string()),
              json!(status.as_str()),
              json!(finished_at),
              json!(id),
            ],
          )
          .await?;
      }
      txn
        .execute(
          "UPDATE job_queues SET status = 'idle' WHERE queue_name = ?1 AND category = ?2",
          &[json!(queue), json!(category)],
        )
        .await?;
      txn.commit().await?;
      self.adapter.notify(JOBS_FINISHED_CHANNEL).await?;
      debug!("committed job completions, notified jobs_finished");
    }
    Ok(())
  }

  /// Resolve the futures of any awaited jobs that are no longer
  /// unfulfilled.
  async fn drain_notifications(&self, work_loop: &WorkLoop) -> Result<(), DbError> {
    while !work_loop.shutting_down() {
      let waiting: Vec<i64> = self.notifiers.lock().unwrap().keys().copied().collect();
      if waiting.is_empty() {
        return Ok(());
      }
      debug!("jobs waiting for notification: {waiting:?}");
      let placeholders: Vec<String> = (1..=waiting.len()).map(|i| format!("?{i}")).collect();
      let sql = format!(
        "SELECT id, status, result FROM jobs WHERE status != 'unfulfilled' AND id IN ({})",
        placeholders.join(", ")
      );
      let bind: Vec<Value> = waiting.iter().map(|id| json!(id)).collect();
      let rows = self.adapter.execute(&sql, &bind).await?;
      if rows.is_empty() {
        debug!("no jobs to notify");
        return Ok(());
      }
      for row in rows {
        let id = row_i64(&row, "id");
        let status = row_str(&row, "status");
        debug!("notifying caller that job {id} finished with {status}");
        if let Some(sender) = self.notifiers.lock().unwrap().remove(&id) {
          let result = row_json(&row, "result");
          let outcome = if status == "resolved" { Ok(result) } else { Err(result) };
          let _ = sender.send(outcome);
        }
      }
    }
    Ok(())
  }
}

fn row_i64(row: &Row, key: &str) -> i64 {
  row.get(key).and_then(|v| v.as_i64()).unwrap_or_default()
}

fn row_str<'a>(row: &'a Row, key: &str) -> &'a str {
  row.get(key).and_then(|v| v.as_str()).unwrap_or_default()
}

/// Columns holding JSON text are parsed back into values.
fn row_json(row: &Row, key: &str) -> Value {
  row
    .get(key)
    .and_then(|v| v.as_str())
    .and_then(|s| serde_json::from_str(s).ok())
    .unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::adapter::SqliteAdapter;
  use crate::schema::ensure_schema;
  use futures::FutureExt;
  use std::sync::atomic::AtomicUsize;

  async fn test_queue() -> (Arc<dyn DbAdapter>, JobQueue) {
    let adapter: Arc<dyn DbAdapter> = Arc::new(SqliteAdapter::memory().unwrap());
    ensure_schema(adapter.as_ref()).await.unwrap();
    let queue = JobQueue::new(adapter.clone()).with_poll_interval(Duration::from_millis(50));
    (adapter, queue)
  }

  fn counting_handler(executions: Arc<AtomicUsize>) -> JobHandler {
    Arc::new(move |args: Value| {
      let executions = executions.clone();
      async move {
        executions.fetch_add(1, Ordering::SeqCst);
        let result: HandlerResult = Ok(json!({ "indexed": args["url"] }));
        result
      }
      .boxed()
    })
  }

  #[tokio::test]
  async fn test_publish_and_resolve() {
    let (_adapter, queue) = test_queue().await;
    let executions = Arc::new(AtomicUsize::new(0));
    queue.register("index", counting_handler(executions.clone()));

    let job = queue.publish("index", json!({ "url": "a" }), PublishOptions::default()).await.unwrap();
    queue.start().await;

    let result = job.done().await.unwrap();
    assert_eq!(result, json!({ "indexed": "a" }));
    assert_eq!(executions.load(Ordering::SeqCst), 1);
    queue.destroy().await;
  }

  #[tokio::test]
  async fn test_coalescing_identical_jobs() {
    let (adapter, queue) = test_queue().await;
    let executions = Arc::new(AtomicUsize::new(0));
    queue.register("index", counting_handler(executions.clone()));

    // five identical jobs published before the queue starts
    let mut jobs = Vec::new();
    for _ in 0..5 {
      jobs.push(
        queue
          .publish("index", json!({ "url": "a" }), PublishOptions::default())
          .await
          .unwrap(),
      );
    }
    queue.start().await;

    let mut results = Vec::new();
    for job in jobs {
      results.push(job.done().await.unwrap());
    }
    assert_eq!(executions.load(Ordering::SeqCst), 1, "one execution satisfies all waiters");
    assert!(results.iter().all(|r| *r == results[0]));

    // queue record ends idle
    let rows = adapter
      .execute("SELECT status FROM job_queues WHERE category = 'index'", &[])
      .await
      .unwrap();
    assert_eq!(rows[0]["status"], json!("idle"));
    queue.destroy().await;
  }

  #[tokio::test]
  async fn test_distinct_args_are_not_coalesced() {
    let (_adapter, queue) = test_queue().await;
    let executions = Arc::new(AtomicUsize::new(0));
    queue.register("index", counting_handler(executions.clone()));

    let a = queue.publish("index", json!({ "url": "a" }), PublishOptions::default()).await.unwrap();
    let b = queue.publish("index", json!({ "url": "b" }), PublishOptions::default()).await.unwrap();
    queue.start().await;

    assert_eq!(a.done().await.unwrap(), json!({ "indexed": "a" }));
    assert_eq!(b.done().await.unwrap(), json!({ "indexed": "b" }));
    assert_eq!(executions.load(Ordering::SeqCst), 2);
    queue.destroy().await;
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
  async fn test_admission_control_across_workers() {
    let adapter: Arc<dyn DbAdapter> = Arc::new(SqliteAdapter::memory().unwrap());
    ensure_schema(adapter.as_ref()).await.unwrap();
    let queue_a = JobQueue::new(adapter.clone()).with_poll_interval(Duration::from_millis(20));
    let queue_b = JobQueue::new(adapter.clone()).with_poll_interval(Duration::from_millis(20));

    let in_flight = Arc::new(AtomicUsize::new(0));
    let max_in_flight = Arc::new(AtomicUsize::new(0));
    let handler: JobHandler = {
      let in_flight = in_flight.clone();
      let max_in_flight = max_in_flight.clone();
      Arc::new(move |args: Value| {
        let in_flight = in_flight.clone();
        let max_in_flight = max_in_flight.clone();
        async move {
          let current = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
          max_in_flight.fetch_max(current, Ordering::SeqCst);
          tokio::time::sleep(Duration::from_millis(50)).await;
          in_flight.fetch_sub(1, Ordering::SeqCst);
          let result: HandlerResult = Ok(args);
          result
        }
        .boxed()
      })
    };
    queue_a.register("index", handler.clone());
    queue_b.register("index", handler);

    let j1 = queue_a.publish("index", json!({ "url": "a" }), PublishOptions::default()).await.unwrap();
    let j2 = queue_a.publish("index", json!({ "url": "b" }), PublishOptions::default()).await.unwrap();
    queue_a.start().await;
    queue_b.start().await;

    j1.done().await.unwrap();
    j2.done().await.unwrap();
    assert_eq!(
      max_in_flight.load(Ordering::SeqCst),
      1,
      "same (queue, category) never runs concurrently"
    );
    queue_a.destroy().await;
    queue_b.destroy().await;
  }

  #[tokio::test]
  async fn test_handler_error_rejects_job_without_killing_loop() {
    let (_adapter, queue) = test_queue().await;
    queue.register(
      "explode",
      Arc::new(|_args| {
        async {
          let result: HandlerResult = Err("handler blew up".into());
          result
        }
        .boxed()
      }),
    );
    let executions = Arc::new(AtomicUsize::new(0));
    queue.register("index", counting_handler(executions.clone()));

    let bad = queue.publish("explode", json!({}), PublishOptions::default()).await.unwrap();
    let good = queue.publish("index", json!({ "url": "a" }), PublishOptions::default()).await.unwrap();
    queue.start().await;

    match bad.done().await {
      Err(JobError::Rejected(payload)) => {
        assert!(payload["message"].as_str().unwrap().contains("handler blew up"));
      }
      other => panic!("expected rejection, got {other:?}"),
    }
    // the loop survived and ran the next job
    good.done().await.unwrap();
    assert_eq!(executions.load(Ordering::SeqCst), 1);
    queue.destroy().await;
  }

  #[tokio::test]
  async fn test_unknown_category_rejects() {
    let (_adapter, queue) = test_queue().await;
    let job = queue.publish("mystery", json!({}), PublishOptions::default()).await.unwrap();
    queue.start().await;

    match job.done().await {
      Err(JobError::Rejected(payload)) => {
        assert!(payload["message"].as_str().unwrap().contains("unknown job handler"));
      }
      other => panic!("expected rejection, got {other:?}"),
    }
    queue.destroy().await;
  }

  #[tokio::test]
  async fn test_destroy_resolves_pending_waiters() {
    let (_adapter, queue) = test_queue().await;
    // never started, so the job can't complete
    let job = queue.publish("index", json!({}), PublishOptions::default()).await.unwrap();
    queue.destroy().await;
    assert!(matches!(job.done().await, Err(JobError::QueueDestroyed)));
  }

  #[tokio::test]
  async fn test_jobs_run_in_creation_order() {
    let (_adapter, queue) = test_queue().await;
    let order = Arc::new(std::sync::Mutex::new(Vec::new()));
    let handler: JobHandler = {
      let order = order.clone();
      Arc::new(move |args: Value| {
        let order = order.clone();
        async move {
          order.lock().unwrap().push(args["n"].as_i64().unwrap());
          let result: HandlerResult = Ok(json!(null));
          result
        }
        .boxed()
      })
    };
    queue.register("ordered", handler);

    let mut jobs = Vec::new();
    for n in 0..4 {
      jobs.push(
        queue
          .publish("ordered", json!({ "n": n }), PublishOptions::default())
          .await
          .unwrap(),
      );
    }
    queue.start().await;
    for job in jobs {
      job.done().await.unwrap();
    }
    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
    queue.destroy().await;
  }
}
