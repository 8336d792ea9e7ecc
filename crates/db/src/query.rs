// Reader surface over the versioned index.
//
// Every lookup resolves through the realm's production generation pointer,
// so readers never observe a half-written generation. Rows flagged
// invalidated are treated as absent until their run re-visits them.

use serde_json::json;
use std::sync::Arc;

use realm_core::{ErrorDetail, IndexEntry};

use crate::adapter::{DbAdapter, Result};

pub struct IndexQueryEngine {
  adapter: Arc<dyn DbAdapter>,
}

impl IndexQueryEngine {
  pub fn new(adapter: Arc<dyn DbAdapter>) -> Self {
    Self { adapter }
  }

  /// Entry for a URL at its realm's production generation.
  pub async fn get_entry(&self, url: &str) -> Result<Option<IndexEntry>> {
    let rows = self
      .adapter
      .execute(
        "SELECT e.entry FROM index_entries e
         JOIN realm_generations g
           ON g.realm_url = e.realm_url AND g.production_generation = e.generation
         WHERE e.url = ?1 AND e.is_invalidated = 0",
        &[json!(url)],
      )
      .await?;
    match rows.first().and_then(|r| r["entry"].as_str()) {
      Some(entry) => Ok(Some(serde_json::from_str(entry)?)),
      None => Ok(None),
    }
  }

  /// Error detail for a URL whose indexing failed; `None` when the entry
  /// is absent or healthy.
  pub async fn get_error(&self, url: &str) -> Result<Option<ErrorDetail>> {
    match self.get_entry(url).await? {
      Some(IndexEntry::Error(entry)) => Ok(Some(entry.error)),
      _ => Ok(None),
    }
  }

  /// Instances whose declared type ancestry contains `type_key` (an
  /// internal code-ref key, e.g. "http://realm/person/Person").
  pub async fn entries_by_type(&self, realm_url: &str, type_key: &str) -> Result<Vec<(String, IndexEntry)>> {
    let rows = self
      .adapter
      .execute(
        "SELECT e.url, e.entry FROM index_entries e
         JOIN realm_generations g
           ON g.realm_url = e.realm_url AND g.production_generation = e.generation
         WHERE e.realm_url = ?1 AND e.is_invalidated = 0
           AND EXISTS (SELECT 1 FROM json_each(e.types) WHERE json_each.value = ?2)
         ORDER BY e.url",
        &[json!(realm_url), json!(type_key)],
      )
      .await?;
    parse_url_entry_rows(rows)
  }

  /// Every readable entry for a realm; diagnostics and tests.
  pub async fn all_entries(&self, realm_url: &str) -> Result<Vec<(String, IndexEntry)>> {
    let rows = self
      .adapter
      .execute(
        "SELECT e.url, e.entry FROM index_entries e
         JOIN realm_generations g
           ON g.realm_url = e.realm_url AND g.production_generation = e.generation
         WHERE e.realm_url = ?1 AND e.is_invalidated = 0
         ORDER BY e.url",
        &[json!(realm_url)],
      )
      .await?;
    parse_url_entry_rows(rows)
  }
}

fn parse_url_entry_rows(rows: Vec<crate::adapter::Row>) -> Result<Vec<(String, IndexEntry)>> {
  let mut entries = Vec::with_capacity(rows.len());
  for row in rows {
    let url = row["url"].as_str().unwrap_or_default().to_string();
    let entry: IndexEntry = serde_json::from_str(row["entry"].as_str().unwrap_or_default())?;
    entries.push((url, entry));
  }
  Ok(entries)
}
