// Type ancestry resolution.
//
// An instance's full type list is its declared definition followed by every
// ancestor reachable through adopts-from links. The walk can fail (an
// ancestor module may not load) and reports a structured error instead of
// throwing past the caller. Results are cached per run, keyed by the
// code ref's internal key string.

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

use realm_core::{CodeRef, ErrorDetail, resolve_module};

use crate::interfaces::ModuleLoader;

#[derive(Debug, Clone, PartialEq)]
pub struct CardType {
  /// Internal key of the type, e.g. "http://realm/person/Person".
  pub ref_url: String,
  pub code_ref: CodeRef,
}

#[derive(Debug, Clone)]
pub enum TypesResult {
  Types(Vec<CardType>),
  Error(ErrorDetail),
}

#[derive(Default)]
pub struct TypeWalker {
  cache: Mutex<HashMap<String, TypesResult>>,
}

impl TypeWalker {
  pub fn new() -> Self {
    Self::default()
  }

  /// Resolve the ancestry chain for a definition. `code_ref` must carry an
  /// absolute module URL.
  pub async fn types_for(&self, code_ref: &CodeRef, loader: &dyn ModuleLoader) -> TypesResult {
    let key = match code_ref.internal_key(None) {
      Ok(key) => key,
      Err(err) => return TypesResult::Error(ErrorDetail::new(400, err.to_string())),
    };
    if let Some(cached) = self.cache.lock().unwrap().get(&key) {
      return cached.clone();
    }

    let result = walk(code_ref, loader).await;
    self.cache.lock().unwrap().insert(key, result.clone());
    result
  }
}

async fn walk(code_ref: &CodeRef, loader: &dyn ModuleLoader) -> TypesResult {
  let mut types = Vec::new();
  let mut seen = BTreeSet::new();
  let mut current = code_ref.clone();

  loop {
    let module_url = current.module.clone();
    let ref_url = match current.internal_key(None) {
      Ok(key) => key,
      Err(err) => return TypesResult::Error(ErrorDetail::new(400, err.to_string())),
    };
    if !seen.insert(ref_url.clone()) {
      return TypesResult::Error(
        ErrorDetail::new(500, format!("cyclic ancestry at {ref_url}")).with_deps([module_url]),
      );
    }

    let namespace = match loader.import(&module_url).await {
      Ok(namespace) => namespace,
      Err(err) => {
        let mut deps = vec![module_url.clone()];
        deps.extend(err.deps.iter().cloned());
        return TypesResult::Error(
          ErrorDetail::new(500, format!("could not load ancestor module \"{module_url}\": {}", err.message))
            .with_deps(deps),
        );
      }
    };
    let Some(definition) = namespace.definitions.get(&current.name) else {
      return TypesResult::Error(
        ErrorDetail::new(
          500,
          format!("module \"{module_url}\" has no definition \"{}\"", current.name),
        )
        .with_deps([module_url]),
      );
    };

    types.push(CardType {
      ref_url,
      code_ref: current.clone(),
    });

    match &definition.ancestor {
      Some(ancestor) => {
        let module = match resolve_module(&ancestor.module, Some(&module_url)) {
          Ok(module) => module,
          Err(err) => return TypesResult::Error(ErrorDetail::new(400, err.to_string()).with_deps([module_url])),
        };
        current = CodeRef::new(module, ancestor.name.clone());
      }
      None => break,
    }
  }

  TypesResult::Types(types)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::interfaces::{CardDefinition, LoaderError, ModuleNamespace, TranspiledModule};
  use async_trait::async_trait;
  use std::collections::BTreeMap;

  struct FakeLoader {
    modules: BTreeMap<String, ModuleNamespace>,
  }

  #[async_trait]
  impl ModuleLoader for FakeLoader {
    async fn import(&self, url: &str) -> Result<ModuleNamespace, LoaderError> {
      self
        .modules
        .get(url)
        .cloned()
        .ok_or_else(|| LoaderError::new(format!("module not found: {url}")))
    }

    async fn consumed_modules(&self, _url: &str) -> Vec<String> {
      Vec::new()
    }

    async fn transpiled_source(&self, _url: &str) -> Result<TranspiledModule, LoaderError> {
      Err(LoaderError::new("not transpilable"))
    }
  }

  fn definition(module: &str, name: &str, ancestor: Option<CodeRef>) -> CardDefinition {
    CardDefinition {
      code_ref: CodeRef::new(module, name),
      display_name: name.to_string(),
      ancestor,
      field_names: Vec::new(),
    }
  }

  fn loader_with_chain() -> FakeLoader {
    let mut modules = BTreeMap::new();
    modules.insert(
      "http://realm/employee.gts".to_string(),
      ModuleNamespace {
        definitions: BTreeMap::from([(
          "Employee".to_string(),
          definition(
            "http://realm/employee.gts",
            "Employee",
            Some(CodeRef::new("./person.gts", "Person")),
          ),
        )]),
      },
    );
    modules.insert(
      "http://realm/person.gts".to_string(),
      ModuleNamespace {
        definitions: BTreeMap::from([(
          "Person".to_string(),
          definition("http://realm/person.gts", "Person", None),
        )]),
      },
    );
    FakeLoader { modules }
  }

  #[tokio::test]
  async fn test_walks_ancestor_chain() {
    let loader = loader_with_chain();
    let walker = TypeWalker::new();
    let result = walker
      .types_for(&CodeRef::new("http://realm/employee.gts", "Employee"), &loader)
      .await;

    match result {
      TypesResult::Types(types) => {
        let refs: Vec<&str> = types.iter().map(|t| t.ref_url.as_str()).collect();
        assert_eq!(refs, vec!["http://realm/employee/Employee", "http://realm/person/Person"]);
      }
      TypesResult::Error(err) => panic!("unexpected error: {err}"),
    }
  }

  #[tokio::test]
  async fn test_missing_ancestor_is_structured_error() {
    let mut loader = loader_with_chain();
    loader.modules.remove("http://realm/person.gts");
    let walker = TypeWalker::new();
    let result = walker
      .types_for(&CodeRef::new("http://realm/employee.gts", "Employee"), &loader)
      .await;

    match result {
      TypesResult::Error(err) => {
        assert_eq!(err.status, 500);
        assert!(err.deps.contains("http://realm/person.gts"));
      }
      TypesResult::Types(_) => panic!("expected an error"),
    }
  }

  #[tokio::test]
  async fn test_cyclic_ancestry_terminates() {
    let mut modules = BTreeMap::new();
    modules.insert(
      "http://realm/a.gts".to_string(),
      ModuleNamespace {
        definitions: BTreeMap::from([(
          "A".to_string(),
          definition("http://realm/a.gts", "A", Some(CodeRef::new("http://realm/b.gts", "B"))),
        )]),
      },
    );
    modules.insert(
      "http://realm/b.gts".to_string(),
      ModuleNamespace {
        definitions: BTreeMap::from([(
          "B".to_string(),
          definition("http://realm/b.gts", "B", Some(CodeRef::new("http://realm/a.gts", "A"))),
        )]),
      },
    );
    let loader = FakeLoader { modules };
    let walker = TypeWalker::new();

    match walker.types_for(&CodeRef::new("http://realm/a.gts", "A"), &loader).await {
      TypesResult::Error(err) => assert!(err.message.contains("cyclic ancestry")),
      TypesResult::Types(_) => panic!("expected cycle error"),
    }
  }

  #[tokio::test]
  async fn test_results_are_cached_per_walker() {
    let loader = loader_with_chain();
    let walker = TypeWalker::new();
    let code_ref = CodeRef::new("http://realm/employee.gts", "Employee");
    let first = walker.types_for(&code_ref, &loader).await;
    // remove the backing modules; the cache must still answer
    let empty = FakeLoader {
      modules: BTreeMap::new(),
    };
    let second = walker.types_for(&code_ref, &empty).await;
    match (first, second) {
      (TypesResult::Types(a), TypesResult::Types(b)) => assert_eq!(a, b),
      _ => panic!("expected cached types"),
    }
  }
}
