// Store schema.
//
// Four tables: two for the durable queue (jobs + per-(queue,category)
// admission records) and two for the versioned index (entries keyed by
// (url, generation) + the production generation pointer per realm).
// Timestamps are unix epoch milliseconds.

use crate::adapter::{DbAdapter, Result};

pub const SCHEMA_STATEMENTS: &[&str] = &[
  "CREATE TABLE IF NOT EXISTS jobs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    category TEXT NOT NULL,
    args TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'unfulfilled',
    queue TEXT NOT NULL,
    result TEXT,
    created_at INTEGER NOT NULL,
    finished_at INTEGER
  )",
  "CREATE INDEX IF NOT EXISTS jobs_status_created ON jobs (status, created_at, id)",
  "CREATE TABLE IF NOT EXISTS job_queues (
    queue_name TEXT NOT NULL,
    category TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'idle',
    PRIMARY KEY (queue_name, category)
  )",
  "CREATE TABLE IF NOT EXISTS index_entries (
    url TEXT NOT NULL,
    realm_url TEXT NOT NULL,
    generation INTEGER NOT NULL,
    entry_type TEXT NOT NULL,
    entry TEXT NOT NULL,
    deps TEXT NOT NULL DEFAULT '[]',
    types TEXT NOT NULL DEFAULT '[]',
    is_invalidated INTEGER NOT NULL DEFAULT 0,
    last_modified INTEGER,
    indexed_at INTEGER NOT NULL,
    PRIMARY KEY (url, generation)
  )",
  "CREATE INDEX IF NOT EXISTS index_entries_realm_generation ON index_entries (realm_url, generation)",
  "CREATE TABLE IF NOT EXISTS realm_generations (
    realm_url TEXT PRIMARY KEY,
    production_generation INTEGER NOT NULL
  )",
];

/// Create any missing tables. Safe to call on every startup.
pub async fn ensure_schema(adapter: &dyn DbAdapter) -> Result<()> {
  for statement in SCHEMA_STATEMENTS {
    adapter.execute(statement, &[]).await?;
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::adapter::SqliteAdapter;
  use serde_json::json;

  #[tokio::test]
  async fn test_ensure_schema_is_idempotent() {
    let adapter = SqliteAdapter::memory().unwrap();
    ensure_schema(&adapter).await.unwrap();
    ensure_schema(&adapter).await.unwrap();

    let rows = adapter
      .execute(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        &[],
      )
      .await
      .unwrap();
    let names: Vec<&str> = rows.iter().filter_map(|r| r["name"].as_str()).collect();
    assert_eq!(names, vec!["index_entries", "job_queues", "jobs", "realm_generations"]);
  }

  #[tokio::test]
  async fn test_jobs_default_status() {
    let adapter = SqliteAdapter::memory().unwrap();
    ensure_schema(&adapter).await.unwrap();
    adapter
      .execute(
        "INSERT INTO jobs (category, args, queue, created_at) VALUES (?1, ?2, ?3, ?4)",
        &[json!("index"), json!("{}"), json!("default"), json!(0)],
      )
      .await
      .unwrap();
    let rows = adapter.execute("SELECT status FROM jobs", &[]).await.unwrap();
    assert_eq!(rows[0]["status"], json!("unfulfilled"));
  }
}
