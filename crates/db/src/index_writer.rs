// Versioned index store.
//
// Entries are keyed by (url, generation). Readers resolve exclusively
// through the realm's production generation pointer, so a from-scratch run
// can populate generation N+1 invisibly and flip the pointer atomically at
// the end. Incremental runs write in place at the production generation;
// the invalidation flag hides affected rows from readers until they are
// re-visited (or removed at `done()` when their file is gone).

use serde_json::{Value, json};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

use realm_core::{IndexEntry, trim_executable_extension};

use crate::adapter::{DbAdapter, DbError, Result};

pub struct IndexWriter {
  adapter: Arc<dyn DbAdapter>,
}

impl IndexWriter {
  pub fn new(adapter: Arc<dyn DbAdapter>) -> Self {
    Self { adapter }
  }

  /// Open a batch bound to the realm's current production generation. The
  /// realm's generation pointer is created at 0 on first contact.
  pub async fn create_batch(&self, realm_url: &str) -> Result<Batch> {
    self
      .adapter
      .execute(
        "INSERT INTO realm_generations (realm_url, production_generation) VALUES (?1, 0)
         ON CONFLICT (realm_url) DO NOTHING",
        &[json!(realm_url)],
      )
      .await?;
    let production = current_production(self.adapter.as_ref(), realm_url).await?;
    Ok(Batch {
      adapter: self.adapter.clone(),
      realm_url: realm_url.to_string(),
      base_generation: production,
      generation: production,
      made_new_generation: false,
    })
  }
}

async fn current_production(adapter: &dyn DbAdapter, realm_url: &str) -> Result<i64> {
  let rows = adapter
    .execute(
      "SELECT production_generation FROM realm_generations WHERE realm_url = ?1",
      &[json!(realm_url)],
    )
    .await?;
  Ok(rows.first().and_then(|r| r["production_generation"].as_i64()).unwrap_or(0))
}

/// Write scope for one indexing run; discarded after `done()`.
pub struct Batch {
  adapter: Arc<dyn DbAdapter>,
  realm_url: String,
  base_generation: i64,
  generation: i64,
  made_new_generation: bool,
}

impl Batch {
  pub fn generation(&self) -> i64 {
    self.generation
  }

  pub fn is_from_scratch(&self) -> bool {
    self.made_new_generation
  }

  /// Target a fresh generation, invisible to readers until `done()`
  /// promotes it. Entries not rewritten during the batch are retired at
  /// promotion.
  pub fn make_new_generation(&mut self) {
    self.generation = self.base_generation + 1;
    self.made_new_generation = true;
    debug!("batch for {} now writing generation {}", self.realm_url, self.generation);
  }

  /// Upsert the entry for a URL in the batch's generation, recording its
  /// deps and type ancestry for later invalidation queries.
  pub async fn update_entry(&self, url: &str, entry: &IndexEntry) -> Result<()> {
    let deps = serde_json::to_string(entry.deps())?;
    let types = serde_json::to_string(entry.types())?;
    let last_modified = match entry {
      IndexEntry::Instance(e) => json!(e.last_modified),
      IndexEntry::Module(e) => json!(e.last_modified),
      IndexEntry::Css(e) => json!(e.last_modified),
      IndexEntry::Error(_) => Value::Null,
    };
    let indexed_at = chrono::Utc::now().timestamp_millis();
    self
      .adapter
      .execute(
        "INSERT INTO index_entries
           (url, realm_url, generation, entry_type, entry, deps, types, is_invalidated, last_modified, indexed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8, ?9)
         ON CONFLICT (url, generation) DO UPDATE SET
           entry_type = excluded.entry_type,
           entry = excluded.entry,
           deps = excluded.deps,
           types = excluded.types,
           is_invalidated = 0,
           last_modified = excluded.last_modified,
           indexed_at = excluded.indexed_at",
        &[
          json!(url),
          json!(self.realm_url),
          json!(self.generation),
          json!(entry.type_name()),
          json!(serde_json::to_string(entry)?),
          json!(deps),
          json!(types),
          last_modified,
          json!(indexed_at),
        ],
      )
      .await?;
    Ok(())
  }

  /// Compute and flag every entry transitively dependent on `url`
  /// (including `url` itself). Reverse-BFS over recorded deps with a
  /// visited set, so dependency cycles terminate and each node appears
  /// exactly once. Deps may record a module URL with or without its
  /// executable extension; both aliases are matched.
  pub async fn invalidate(&self, url: &str) -> Result<Vec<String>> {
    let mut txn = self.adapter.begin().await?;

    let mut visited: BTreeSet<String> = BTreeSet::new();
    let mut result: Vec<String> = Vec::new();
    visited.insert(url.to_string());
    result.push(url.to_string());
    let mut frontier = vec![url.to_string()];

    while !frontier.is_empty() {
      let mut keys: BTreeSet<String> = BTreeSet::new();
      for file_url in &frontier {
        keys.insert(file_url.clone());
        keys.insert(trim_executable_extension(file_url));
      }
      let keys: Vec<String> = keys.into_iter().collect();
      let placeholders: Vec<String> = (3..3 + keys.len()).map(|i| format!("?{i}")).collect();
      let sql = format!(
        "SELECT url FROM index_entries WHERE realm_url = ?1 AND generation = ?2
         AND EXISTS (SELECT 1 FROM json_each(index_entries.deps) WHERE json_each.value IN ({}))",
        placeholders.join(", ")
      );
      let mut bind = vec![json!(self.realm_url), json!(self.generation)];
      bind.extend(keys.iter().map(|k| json!(k)));
      let rows = txn.execute(&sql, &bind).await?;

      let mut next = Vec::new();
      for row in &rows {
        let dependent = row["url"].as_str().unwrap_or_default().to_string();
        if visited.insert(dependent.clone()) {
          result.push(dependent.clone());
          next.push(dependent);
        }
      }
      frontier = next;
    }

    let placeholders: Vec<String> = (3..3 + result.len()).map(|i| format!("?{i}")).collect();
    let sql = format!(
      "UPDATE index_entries SET is_invalidated = 1 WHERE realm_url = ?1 AND generation = ?2 AND url IN ({})",
      placeholders.join(", ")
    );
    let mut bind = vec![json!(self.realm_url), json!(self.generation)];
    bind.extend(result.iter().map(|u| json!(u)));
    txn.execute(&sql, &bind).await?;
    txn.commit().await?;

    debug!("invalidated {} entries for {url}", result.len());
    Ok(result)
  }

  /// Finalize the batch. From-scratch batches atomically promote their
  /// generation (compare-and-swap on the production pointer; a lost race
  /// is a `GenerationConflict`) and retire prior generations. Incremental
  /// batches drop rows still flagged invalidated -- their files no longer
  /// exist.
  pub async fn done(self) -> Result<()> {
    let mut txn = self.adapter.begin().await?;
    if self.made_new_generation {
      let rows = txn
        .execute(
          "UPDATE realm_generations SET production_generation = ?1
           WHERE realm_url = ?2 AND production_generation = ?3
           RETURNING production_generation",
          &[json!(self.generation), json!(self.realm_url), json!(self.base_generation)],
        )
        .await?;
      if rows.is_empty() {
        txn.rollback().await?;
        return Err(DbError::GenerationConflict(self.realm_url));
      }
      txn
        .execute(
          "DELETE FROM index_entries WHERE realm_url = ?1 AND generation < ?2",
          &[json!(self.realm_url), json!(self.generation)],
        )
        .await?;
    } else {
      txn
        .execute(
          "DELETE FROM index_entries WHERE realm_url = ?1 AND generation = ?2 AND is_invalidated = 1",
          &[json!(self.realm_url), json!(self.generation)],
        )
        .await?;
    }
    txn.commit().await?;
    Ok(())
  }
}
