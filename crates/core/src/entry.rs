use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::error::ErrorDetail;

/// One indexed resource, keyed by (url, generation) in the store.
///
/// `deps` is always the set of absolute URLs this entry depends on: the
/// transitively consumed modules, plus the adopted module for instances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IndexEntry {
  Instance(InstanceEntry),
  Module(ModuleEntry),
  Css(CssEntry),
  Error(ErrorEntry),
}

/// A rendered document instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceEntry {
  /// Adjusted resource as serialized for readers.
  pub resource: Value,
  /// Flattened searchable projection of the resource.
  pub search_doc: Value,
  /// Raw file source.
  pub source: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub isolated_html: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub atom_html: Option<String>,
  /// Embedded-format HTML keyed by ancestor type ref URL.
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub embedded_html: BTreeMap<String, String>,
  /// Declared type ancestry, most specific first.
  pub types: Vec<String>,
  pub deps: BTreeSet<String>,
  pub last_modified: i64,
}

/// An executable module, stored as its transpiled source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleEntry {
  pub source: String,
  pub deps: BTreeSet<String>,
  pub last_modified: i64,
}

/// Scoped CSS extracted from a module's transpiled output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CssEntry {
  pub source: String,
  pub deps: BTreeSet<String>,
  pub last_modified: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEntry {
  pub error: ErrorDetail,
}

impl IndexEntry {
  pub fn type_name(&self) -> &'static str {
    match self {
      IndexEntry::Instance(_) => "instance",
      IndexEntry::Module(_) => "module",
      IndexEntry::Css(_) => "css",
      IndexEntry::Error(_) => "error",
    }
  }

  pub fn deps(&self) -> &BTreeSet<String> {
    match self {
      IndexEntry::Instance(entry) => &entry.deps,
      IndexEntry::Module(entry) => &entry.deps,
      IndexEntry::Css(entry) => &entry.deps,
      IndexEntry::Error(entry) => &entry.error.deps,
    }
  }

  /// Declared type ancestry (instances only).
  pub fn types(&self) -> &[String] {
    match self {
      IndexEntry::Instance(entry) => &entry.types,
      _ => &[],
    }
  }
}

/// Counters accumulated over one indexing run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
  pub instances_indexed: usize,
  pub instance_errors: usize,
  pub module_errors: usize,
}

/// Outcome of an indexing run, reported back through the job result.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexResults {
  /// URLs invalidated by this run (empty for from-scratch runs).
  pub invalidations: Vec<String>,
  /// Ignore-file contents discovered during the run, keyed by directory
  /// URL; carried into subsequent incremental runs.
  pub ignore_data: HashMap<String, String>,
  pub stats: Stats,
}
