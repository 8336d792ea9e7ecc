// Relational store abstraction.
//
// The queue and the index writer speak to the store exclusively through
// `DbAdapter`: parameterized statements, explicit transaction scopes, and a
// LISTEN/NOTIFY-style notification primitive. The shipped implementation is
// SQLite (rusqlite); a server-grade backend only needs to implement this
// trait. SQL is written in the portable subset both dialects accept, except
// for the row-locking hint which `adjust_sql` strips for SQLite, where the
// single writer connection already provides the same guarantee.

use async_trait::async_trait;
use rusqlite::Connection;
use rusqlite::types::ValueRef;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard, broadcast};
use tracing::debug;

#[derive(Error, Debug)]
pub enum DbError {
  #[error("SQL: {0}")]
  Sql(String),

  #[error("Connection closed")]
  Closed,

  #[error("Generation conflict for realm {0}")]
  GenerationConflict(String),

  #[error("Serialization: {0}")]
  Serialization(#[from] serde_json::Error),

  #[error("IO: {0}")]
  Io(#[from] std::io::Error),
}

impl From<rusqlite::Error> for DbError {
  fn from(err: rusqlite::Error) -> Self {
    DbError::Sql(err.to_string())
  }
}

pub type Result<T> = std::result::Result<T, DbError>;

/// One result row: column name to JSON-compatible value.
pub type Row = serde_json::Map<String, Value>;

#[async_trait]
pub trait DbAdapter: Send + Sync {
  /// Run a single autocommit statement; returns any result rows.
  async fn execute(&self, sql: &str, bind: &[Value]) -> Result<Vec<Row>>;

  /// Open an exclusive transaction scope. Dropping an uncommitted
  /// transaction rolls it back.
  async fn begin(&self) -> Result<Box<dyn DbTransaction>>;

  /// Subscribe to a notification channel (LISTEN equivalent).
  fn subscribe(&self, channel: &str) -> broadcast::Receiver<()>;

  /// Emit a notification on a channel (NOTIFY equivalent).
  async fn notify(&self, channel: &str) -> Result<()>;

  async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait DbTransaction: Send {
  async fn execute(&mut self, sql: &str, bind: &[Value]) -> Result<Vec<Row>>;
  async fn commit(self: Box<Self>) -> Result<()>;
  async fn rollback(self: Box<Self>) -> Result<()>;
}

/// SQLite-backed adapter. All statements funnel through one connection
/// behind an async mutex; transactions hold the connection for their whole
/// scope, which serializes writers the way row locks do on a server.
pub struct SqliteAdapter {
  conn: Arc<Mutex<Connection>>,
  channels: std::sync::Mutex<HashMap<String, broadcast::Sender<()>>>,
  closed: AtomicBool,
}

impl SqliteAdapter {
  pub fn open(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)?;
    }
    debug!("opening sqlite index store at {:?}", path);
    Ok(Self::from_connection(Connection::open(path)?))
  }

  /// Ephemeral in-memory store, used by tests.
  pub fn memory() -> Result<Self> {
    Ok(Self::from_connection(Connection::open_in_memory()?))
  }

  fn from_connection(conn: Connection) -> Self {
    Self {
      conn: Arc::new(Mutex::new(conn)),
      channels: std::sync::Mutex::new(HashMap::new()),
      closed: AtomicBool::new(false),
    }
  }

  fn assert_open(&self) -> Result<()> {
    if self.closed.load(Ordering::SeqCst) {
      return Err(DbError::Closed);
    }
    Ok(())
  }

  fn sender(&self, channel: &str) -> broadcast::Sender<()> {
    let mut channels = self.channels.lock().unwrap();
    channels
      .entry(channel.to_string())
      .or_insert_with(|| broadcast::channel(64).0)
      .clone()
  }

  fn run(conn: &Connection, sql: &str, bind: &[Value]) -> Result<Vec<Row>> {
    let sql = adjust_sql(sql);
    let mut stmt = conn.prepare(&sql)?;
    let column_names: Vec<String> = stmt.column_names().iter().map(|n| n.to_string()).collect();
    let params: Vec<Box<dyn rusqlite::ToSql>> = bind.iter().map(to_sql_value).collect();
    let param_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();

    let mut rows = stmt.query(&param_refs[..])?;
    let mut results = Vec::new();
    while let Some(row) = rows.next()? {
      let mut object = Row::new();
      for (i, name) in column_names.iter().enumerate() {
        object.insert(name.clone(), from_sql_value(row.get_ref(i)?));
      }
      results.push(object);
    }
    Ok(results)
  }
}

#[async_trait]
impl DbAdapter for SqliteAdapter {
  async fn execute(&self, sql: &str, bind: &[Value]) -> Result<Vec<Row>> {
    self.assert_open()?;
    let conn = self.conn.lock().await;
    Self::run(&conn, sql, bind)
  }

  async fn begin(&self) -> Result<Box<dyn DbTransaction>> {
    self.assert_open()?;
    let guard = self.conn.clone().lock_owned().await;
    guard.execute_batch("BEGIN IMMEDIATE")?;
    Ok(Box::new(SqliteTransaction { guard, open: true }))
  }

  fn subscribe(&self, channel: &str) -> broadcast::Receiver<()> {
    self.sender(channel).subscribe()
  }

  async fn notify(&self, channel: &str) -> Result<()> {
    self.assert_open()?;
    // send fails only when nobody is listening, which is fine
    let _ = self.sender(channel).send(());
    Ok(())
  }

  async fn close(&self) -> Result<()> {
    self.closed.store(true, Ordering::SeqCst);
    Ok(())
  }
}

struct SqliteTransaction {
  guard: OwnedMutexGuard<Connection>,
  open: bool,
}

#[async_trait]
impl DbTransaction for SqliteTransaction {
  async fn execute(&mut self, sql: &str, bind: &[Value]) -> Result<Vec<Row>> {
    SqliteAdapter::run(&self.guard, sql, bind)
  }

  async fn commit(mut self: Box<Self>) -> Result<()> {
    self.guard.execute_batch("COMMIT")?;
    self.open = false;
    Ok(())
  }

  async fn rollback(mut self: Box<Self>) -> Result<()> {
    self.guard.execute_batch("ROLLBACK")?;
    self.open = false;
    Ok(())
  }
}

impl Drop for SqliteTransaction {
  fn drop(&mut self) {
    if self.open {
      let _ = self.guard.execute_batch("ROLLBACK");
    }
  }
}

/// Rewrite the server-dialect locking hint for SQLite. The single writer
/// connection gives claim statements the same skip-past-in-flight behavior
/// the hint asks a server for.
fn adjust_sql(sql: &str) -> String {
  sql.replace("FOR UPDATE SKIP LOCKED", "")
}

fn to_sql_value(value: &Value) -> Box<dyn rusqlite::ToSql> {
  match value {
    Value::Null => Box::new(rusqlite::types::Null),
    Value::Bool(b) => Box::new(*b),
    Value::Number(n) => {
      if let Some(i) = n.as_i64() {
        Box::new(i)
      } else {
        Box::new(n.as_f64().unwrap_or(0.0))
      }
    }
    Value::String(s) => Box::new(s.clone()),
    // arrays/objects are stored as JSON text
    other => Box::new(other.to_string()),
  }
}

fn from_sql_value(value: ValueRef<'_>) -> Value {
  match value {
    ValueRef::Null => Value::Null,
    ValueRef::Integer(i) => Value::from(i),
    ValueRef::Real(f) => Value::from(f),
    ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
    ValueRef::Blob(_) => Value::Null,
  }
}

/// Default location for the on-disk index store.
///
/// Respects DATA_DIR, then XDG_DATA_HOME, then the platform default.
pub fn default_data_dir() -> PathBuf {
  if let Ok(dir) = std::env::var("DATA_DIR") {
    return PathBuf::from(dir);
  }
  if let Ok(xdg_data) = std::env::var("XDG_DATA_HOME") {
    return PathBuf::from(xdg_data).join("realmdex");
  }
  dirs::data_local_dir()
    .unwrap_or_else(|| PathBuf::from("."))
    .join("realmdex")
}
