// One indexing run.
//
// A run is either from-scratch (walk the whole realm into a fresh
// generation, promote atomically at the end) or incremental (invalidate
// the transitive dependents of one changed URL and re-visit them in
// place). The failure domain is the single file: per-entity problems
// become error entries, never run aborts. Store faults do abort.

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use db::{Batch, DbError, IndexWriter};
use realm_core::{
  CardResource, CodeRef, CssEntry, ErrorDetail, ErrorEntry, IndexEntry, IndexResults, InstanceEntry, ModuleEntry,
  RealmPaths, Stats, has_executable_extension, parse_card_document, trim_executable_extension,
};

use crate::ignore_rules::{IGNORE_FILE, IgnoreIndex};
use crate::interfaces::{
  CardDefinition, CardRenderer, EntryKind, Format, ModuleLoader, Reader, RenderRequest, TextFile, Visitor,
};
use crate::types::{TypeWalker, TypesResult};

#[derive(Error, Debug)]
pub enum RunError {
  #[error("missing file {0}")]
  FileNotFound(String),

  #[error("Database: {0}")]
  Db(#[from] DbError),

  #[error(transparent)]
  Core(#[from] realm_core::Error),

  #[error("IO: {0}")]
  Io(#[from] std::io::Error),

  #[error("{0}")]
  Internal(String),
}

/// The file event behind an incremental run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
  Update,
  Delete,
}

/// Collaborators and carried state for one run.
pub struct RunOptions {
  pub realm_url: String,
  pub reader: Arc<dyn Reader>,
  pub loader: Arc<dyn ModuleLoader>,
  pub renderer: Arc<dyn CardRenderer>,
  /// Ignore-file contents discovered by a prior run.
  pub ignore_data: HashMap<String, String>,
}

type InFlight = Shared<BoxFuture<'static, ()>>;

pub struct CurrentRun {
  realm: RealmPaths,
  reader: Arc<dyn Reader>,
  loader: Arc<dyn ModuleLoader>,
  renderer: Arc<dyn CardRenderer>,
  batch: Batch,
  ignore: Mutex<IgnoreIndex>,
  types: TypeWalker,
  /// Concurrent indexing requests for the same instance URL within one
  /// run are deduplicated: later callers await the first.
  indexing_instances: Mutex<HashMap<String, InFlight>>,
  stats: Mutex<Stats>,
}

impl CurrentRun {
  fn new(batch: Batch, options: RunOptions) -> Result<Self, RunError> {
    let realm = RealmPaths::new(&options.realm_url)?;
    let ignore = IgnoreIndex::new(realm.url(), options.ignore_data);
    Ok(Self {
      realm,
      reader: options.reader,
      loader: options.loader,
      renderer: options.renderer,
      batch,
      ignore: Mutex::new(ignore),
      types: TypeWalker::new(),
      indexing_instances: Mutex::new(HashMap::new()),
      stats: Mutex::new(Stats::default()),
    })
  }

  /// Full re-index into a fresh generation. Readers keep seeing the prior
  /// generation until the final promotion.
  pub async fn from_scratch(writer: &IndexWriter, options: RunOptions) -> Result<IndexResults, RunError> {
    let start = Instant::now();
    debug!("starting from scratch indexing");
    let mut batch = writer.create_batch(&options.realm_url).await?;
    batch.make_new_generation();
    let run = Self::new(batch, options)?;
    let realm_url = run.realm.url().to_string();
    run.visit_directory(realm_url).await?;
    let results = run.finish(Vec::new()).await?;
    debug!("completed from scratch indexing in {:?}", start.elapsed());
    Ok(results)
  }

  /// Re-index the transitive dependents of one changed or deleted file.
  pub async fn incremental(
    writer: &IndexWriter,
    options: RunOptions,
    url: &str,
    operation: Operation,
  ) -> Result<IndexResults, RunError> {
    let start = Instant::now();
    debug!("starting incremental indexing for {url}");
    let batch = writer.create_batch(&options.realm_url).await?;
    let invalidations = batch.invalidate(url).await?;
    let run = Self::new(batch, options)?;
    for invalidation in &invalidations {
      if operation == Operation::Delete && invalidation.as_str() == url {
        // the file itself is gone; only dependents get re-visited
        continue;
      }
      run.try_to_visit(invalidation).await?;
    }
    let results = run.finish(invalidations).await?;
    debug!("completed incremental indexing for {url} in {:?}", start.elapsed());
    Ok(results)
  }

  async fn finish(self, invalidations: Vec<String>) -> Result<IndexResults, RunError> {
    let CurrentRun {
      batch, ignore, stats, ..
    } = self;
    batch.done().await?;
    Ok(IndexResults {
      invalidations,
      ignore_data: ignore.into_inner().unwrap().into_data(),
      stats: stats.into_inner().unwrap(),
    })
  }

  /// A tracked visit tolerates a vanished file; store faults abort the
  /// run; anything else becomes an error entry for that URL alone.
  async fn try_to_visit(&self, url: &str) -> Result<(), RunError> {
    match self.visit_file(url).await {
      Ok(()) => Ok(()),
      Err(RunError::FileNotFound(_)) => {
        info!("tried to visit file {url}, but it no longer exists");
        Ok(())
      }
      Err(RunError::Db(err)) => Err(RunError::Db(err)),
      Err(err) => {
        warn!("error revisiting {url}: {err}");
        let detail = ErrorDetail::new(500, err.to_string());
        self
          .batch
          .update_entry(url, &IndexEntry::Error(ErrorEntry { error: detail }))
          .await?;
        Ok(())
      }
    }
  }

  fn visit_directory<'a>(&'a self, url: String) -> BoxFuture<'a, Result<(), RunError>> {
    async move {
      let local = self.realm.local(&url)?;
      let ignore_path = format!("{local}{IGNORE_FILE}");
      if let Some(patterns) = self.reader.read_file_as_text(&ignore_path).await? {
        self.ignore.lock().unwrap().add(&url, &patterns.content);
      }

      for entry in self.reader.readdir(&local).await? {
        match entry.kind {
          EntryKind::File => {
            let file_url = self.realm.file_url(&entry.path)?;
            if self.ignore.lock().unwrap().is_ignored(&file_url, false) {
              continue;
            }
            self.visit_file(&file_url).await?;
          }
          EntryKind::Directory => {
            let dir_url = self.realm.directory_url(&entry.path)?;
            if self.ignore.lock().unwrap().is_ignored(&dir_url, true) {
              continue;
            }
            self.visit_directory(dir_url).await?;
          }
        }
      }
      Ok(())
    }
    .boxed()
  }

  pub(crate) fn visit_file<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<(), RunError>> {
    async move {
      if self.ignore.lock().unwrap().is_ignored(url, false) {
        return Ok(());
      }
      debug!("begin visiting file {url}");
      let local = self.realm.local(url)?;
      let Some(file) = self.reader.read_file_as_text(&local).await? else {
        return Err(RunError::FileNotFound(url.to_string()));
      };

      if has_executable_extension(url) {
        self.index_module(url, &file).await?;
      } else if url.ends_with(".json") {
        match parse_card_document(&file.content) {
          Some(resource) => self.index_instance(url, &file, resource).await?,
          None => debug!("unable to parse {url} as card JSON"),
        }
      }
      debug!("completed visiting file {url}");
      Ok(())
    }
    .boxed()
  }

  async fn index_module(&self, url: &str, file: &TextFile) -> Result<(), RunError> {
    if let Err(err) = self.loader.import(url).await {
      self.stats.lock().unwrap().module_errors += 1;
      warn!("encountered error loading module \"{url}\": {}", err.message);
      let deps: BTreeSet<String> = err.deps.iter().filter(|d| d.as_str() != url).cloned().collect();
      let detail = ErrorDetail::new(500, format!("encountered error loading module \"{url}\": {}", err.message))
        .with_deps(deps);
      self
        .batch
        .update_entry(url, &IndexEntry::Error(ErrorEntry { error: detail }))
        .await?;
      return Ok(());
    }

    let consumes = self.loader.consumed_modules(url).await;
    let deps: BTreeSet<String> = consumes
      .iter()
      .filter(|d| d.as_str() != url)
      .map(|d| trim_executable_extension(d))
      .collect();

    let transpiled = match self.loader.transpiled_source(url).await {
      Ok(transpiled) => transpiled,
      Err(err) => {
        self.stats.lock().unwrap().module_errors += 1;
        warn!("could not transpile module \"{url}\": {}", err.message);
        let detail =
          ErrorDetail::new(500, format!("could not transpile module \"{url}\": {}", err.message)).with_deps(deps);
        self
          .batch
          .update_entry(url, &IndexEntry::Error(ErrorEntry { error: detail }))
          .await?;
        return Ok(());
      }
    };

    self
      .batch
      .update_entry(
        url,
        &IndexEntry::Module(ModuleEntry {
          source: transpiled.source,
          deps: deps.clone(),
          last_modified: file.last_modified,
        }),
      )
      .await?;

    // scoped CSS shares the module's deps and lives under its own URL
    if let Some(css) = transpiled.scoped_css {
      let css_url = format!("{}.css", trim_executable_extension(url));
      self
        .batch
        .update_entry(
          &css_url,
          &IndexEntry::Css(CssEntry {
            source: css,
            deps,
            last_modified: file.last_modified,
          }),
        )
        .await?;
    }
    Ok(())
  }

  async fn index_instance(&self, url: &str, file: &TextFile, resource: CardResource) -> Result<(), RunError> {
    let entry_url = if url.ends_with(".json") {
      url.to_string()
    } else {
      format!("{url}.json")
    };

    let existing = self.indexing_instances.lock().unwrap().get(&entry_url).cloned();
    if let Some(in_flight) = existing {
      in_flight.await;
      return Ok(());
    }
    let (done_tx, done_rx) = oneshot::channel::<()>();
    let in_flight: InFlight = done_rx.map(|_| ()).boxed().shared();
    self.indexing_instances.lock().unwrap().insert(entry_url.clone(), in_flight);

    let outcome = self.index_instance_inner(url, &entry_url, file, &resource).await;
    let _ = done_tx.send(());
    outcome
  }

  async fn index_instance_inner(
    &self,
    url: &str,
    entry_url: &str,
    file: &TextFile,
    resource: &CardResource,
  ) -> Result<(), RunError> {
    match self.build_instance(url, file, resource).await {
      Ok(entry) => {
        self.batch.update_entry(entry_url, &IndexEntry::Instance(entry)).await?;
        self.stats.lock().unwrap().instances_indexed += 1;
      }
      Err(detail) => {
        warn!("encountered error indexing card instance {url}: {}", detail.message);
        self
          .batch
          .update_entry(entry_url, &IndexEntry::Error(ErrorEntry { error: detail }))
          .await?;
        self.stats.lock().unwrap().instance_errors += 1;
      }
    }
    Ok(())
  }

  async fn build_instance(
    &self,
    url: &str,
    file: &TextFile,
    resource: &CardResource,
  ) -> Result<InstanceEntry, ErrorDetail> {
    let instance_url = url.strip_suffix(".json").unwrap_or(url).to_string();
    let module_url = resource
      .meta
      .adopts_from
      .module_url(Some(url))
      .map_err(|err| ErrorDetail::new(400, err.to_string()))?;
    let code_ref = CodeRef::new(module_url.clone(), resource.meta.adopts_from.name.clone());

    let definition = self.definition_for(&code_ref).await?;

    let types = match self.types.types_for(&code_ref, self.loader.as_ref()).await {
      TypesResult::Types(types) => types,
      TypesResult::Error(mut detail) => {
        detail.deps.insert(module_url.clone());
        return Err(detail);
      }
    };
    let mut type_definitions = Vec::new();
    for card_type in &types {
      type_definitions.push((card_type, self.definition_for(&card_type.code_ref).await?));
    }

    // serialize against the declared fields, own first then inherited;
    // attributes no definition in the ancestry knows about are dropped
    let mut field_names: Vec<String> = Vec::new();
    for (_, type_definition) in &type_definitions {
      for field in &type_definition.field_names {
        if !field_names.contains(field) {
          field_names.push(field.clone());
        }
      }
    }
    let mut attributes = serde_json::Map::new();
    for field in &field_names {
      attributes.insert(
        field.clone(),
        resource.attributes.get(field).cloned().unwrap_or(Value::Null),
      );
    }

    let mut search_doc = attributes.clone();
    search_doc.insert("id".to_string(), json!(instance_url));
    // "_" prefix keeps the pseudo field out of the userland namespace
    search_doc.insert("_cardType".to_string(), json!(definition.display_name));

    let mut relationships = resource.relationships.clone();
    for value in relationships.values_mut() {
      if let Some(object) = value.as_object_mut() {
        object.remove("data");
      }
    }

    let mut resource_doc = serde_json::Map::new();
    resource_doc.insert("id".to_string(), json!(instance_url));
    resource_doc.insert("type".to_string(), json!("card"));
    resource_doc.insert("attributes".to_string(), Value::Object(attributes));
    if !relationships.is_empty() {
      resource_doc.insert("relationships".to_string(), Value::Object(relationships));
    }
    resource_doc.insert(
      "meta".to_string(),
      json!({
        "adoptsFrom": resource.meta.adopts_from,
        "lastModified": file.last_modified,
        "realmURL": self.realm.url(),
      }),
    );

    let isolated_html = self
      .render(resource, &instance_url, Format::Isolated, &code_ref, &definition)
      .await?;
    let atom_html = self
      .render(resource, &instance_url, Format::Atom, &code_ref, &definition)
      .await?;

    // embedded format renders once per ancestor type, keyed by type ref
    let mut embedded_html = BTreeMap::new();
    for (card_type, type_definition) in &type_definitions {
      let html = self
        .render(resource, &instance_url, Format::Embedded, &card_type.code_ref, type_definition)
        .await?;
      embedded_html.insert(card_type.ref_url.clone(), html);
    }

    let mut deps: BTreeSet<String> = BTreeSet::new();
    deps.insert(module_url.clone());
    for consumed in self.loader.consumed_modules(&module_url).await {
      deps.insert(consumed);
    }

    Ok(InstanceEntry {
      resource: Value::Object(resource_doc),
      search_doc: Value::Object(search_doc),
      source: file.content.clone(),
      isolated_html: Some(isolated_html),
      atom_html: Some(atom_html),
      embedded_html,
      types: types.iter().map(|t| t.ref_url.clone()).collect(),
      deps,
      last_modified: file.last_modified,
    })
  }

  async fn definition_for(&self, code_ref: &CodeRef) -> Result<CardDefinition, ErrorDetail> {
    let namespace = self.loader.import(&code_ref.module).await.map_err(|err| {
      let mut deps = vec![code_ref.module.clone()];
      deps.extend(err.deps.iter().cloned());
      ErrorDetail::new(
        500,
        format!("encountered error loading module \"{}\": {}", code_ref.module, err.message),
      )
      .with_deps(deps)
    })?;
    namespace.definitions.get(&code_ref.name).cloned().ok_or_else(|| {
      ErrorDetail::new(
        500,
        format!("module \"{}\" has no definition \"{}\"", code_ref.module, code_ref.name),
      )
      .with_deps([code_ref.module.clone()])
    })
  }

  async fn render(
    &self,
    resource: &CardResource,
    instance_url: &str,
    format: Format,
    type_ref: &CodeRef,
    definition: &CardDefinition,
  ) -> Result<String, ErrorDetail> {
    self
      .renderer
      .render(RenderRequest {
        resource,
        instance_url,
        format,
        type_ref,
        definition,
        realm_url: self.realm.url(),
        visit: self,
      })
      .await
      .map_err(|err| ErrorDetail::new(500, err.message).with_deps([type_ref.module.clone()]))
  }
}

impl Visitor for CurrentRun {
  fn visit<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<(), RunError>> {
    self.visit_file(url)
  }
}
