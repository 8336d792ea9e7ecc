// Collaborator interfaces consumed by the indexing run.
//
// The surrounding system owns the implementations: the worker daemon wires
// a filesystem reader and a registry-backed module loader, tests wire
// in-memory doubles. The run treats all of them as black boxes.

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use realm_core::{CardResource, CodeRef, LocalPath};

use crate::run::RunError;

/// A file read through the Reader: content plus last-modified epoch millis.
#[derive(Debug, Clone)]
pub struct TextFile {
  pub content: String,
  pub last_modified: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
  File,
  Directory,
}

#[derive(Debug, Clone)]
pub struct DirEntry {
  /// Realm-local path of the entry.
  pub path: LocalPath,
  pub kind: EntryKind,
}

/// Filesystem access for an indexing run. Paths are realm-local.
#[async_trait]
pub trait Reader: Send + Sync {
  /// `Ok(None)` when the file does not exist.
  async fn read_file_as_text(&self, path: &str) -> std::io::Result<Option<TextFile>>;
  async fn readdir(&self, path: &str) -> std::io::Result<Vec<DirEntry>>;
}

/// Module execution failure; carries whatever dependencies the loader had
/// already resolved, so the resulting error entry re-indexes when an
/// upstream module is fixed.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct LoaderError {
  pub message: String,
  pub deps: Vec<String>,
}

impl LoaderError {
  pub fn new(message: impl Into<String>) -> Self {
    Self {
      message: message.into(),
      deps: Vec::new(),
    }
  }

  pub fn with_deps(mut self, deps: impl IntoIterator<Item = String>) -> Self {
    self.deps = deps.into_iter().collect();
    self
  }
}

/// One card definition exported by a module.
#[derive(Debug, Clone, PartialEq)]
pub struct CardDefinition {
  /// Absolute module URL + export name.
  pub code_ref: CodeRef,
  pub display_name: String,
  /// The definition this one adopts from; `None` at the root of an
  /// ancestry chain.
  pub ancestor: Option<CodeRef>,
  /// Declared field names, in declaration order.
  pub field_names: Vec<String>,
}

/// The executed shape of a module: its exported card definitions keyed by
/// export name.
#[derive(Debug, Clone, Default)]
pub struct ModuleNamespace {
  pub definitions: BTreeMap<String, CardDefinition>,
}

/// Transpiled output for a module.
#[derive(Debug, Clone)]
pub struct TranspiledModule {
  pub source: String,
  /// Scoped CSS extracted during transpilation, when present.
  pub scoped_css: Option<String>,
}

/// Module execution and dependency discovery. Backed by a precompiled
/// registry or an interpreter boundary; never by ambient dynamic loading.
#[async_trait]
pub trait ModuleLoader: Send + Sync {
  /// Execute the module at `url`, yielding its exported definitions.
  async fn import(&self, url: &str) -> Result<ModuleNamespace, LoaderError>;

  /// Modules transitively consumed by `url`.
  async fn consumed_modules(&self, url: &str) -> Vec<String>;

  /// Transpiled source for `url`.
  async fn transpiled_source(&self, url: &str) -> Result<TranspiledModule, LoaderError>;
}

/// Presentation formats rendered into the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
  Isolated,
  Embedded,
  Atom,
}

impl Format {
  pub fn as_str(&self) -> &'static str {
    match self {
      Format::Isolated => "isolated",
      Format::Embedded => "embedded",
      Format::Atom => "atom",
    }
  }
}

/// Re-entrant callback into the indexing run: a renderer may trigger
/// nested indexing of cards it references.
pub trait Visitor: Send + Sync {
  fn visit<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<(), RunError>>;
}

pub struct RenderRequest<'a> {
  pub resource: &'a CardResource,
  pub instance_url: &'a str,
  pub format: Format,
  /// Type to render as; differs from the declared type when rendering
  /// embedded formats for ancestor types.
  pub type_ref: &'a CodeRef,
  pub definition: &'a CardDefinition,
  pub realm_url: &'a str,
  pub visit: &'a dyn Visitor,
}

#[derive(Debug, Clone, Error)]
#[error("render failed: {message}")]
pub struct RenderError {
  pub message: String,
}

impl RenderError {
  pub fn new(message: impl Into<String>) -> Self {
    Self {
      message: message.into(),
    }
  }
}

/// Renders a card instance to an HTML fragment in a given format.
#[async_trait]
pub trait CardRenderer: Send + Sync {
  async fn render(&self, request: RenderRequest<'_>) -> Result<String, RenderError>;
}
