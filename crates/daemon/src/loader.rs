// Registry-backed module loader.
//
// Card modules are never executed in-process. The loader derives a
// module's exported definitions, import graph, and scoped CSS from its
// source text, acting as the registry side of the module-execution
// boundary. Anything the scan cannot prove is treated conservatively: a
// base class imported from outside the realm roots the ancestry chain,
// and out-of-realm imports are recorded as consumed but never resolved.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::PathBuf;

use index::{CardDefinition, LoaderError, ModuleLoader, ModuleNamespace, TranspiledModule};
use realm_core::{CodeRef, EXECUTABLE_EXTENSIONS, RealmPaths, has_executable_extension, resolve_module};

pub struct ScanLoader {
  realm: RealmPaths,
  root: PathBuf,
}

impl ScanLoader {
  pub fn new(realm_url: &str, root: PathBuf) -> realm_core::Result<Self> {
    Ok(Self {
      realm: RealmPaths::new(realm_url)?,
      root,
    })
  }

  /// Resolve a module URL, possibly extensionless, to its file on disk.
  /// Returns the canonical URL (with extension) and the path.
  fn resolve_file(&self, url: &str) -> Option<(String, PathBuf)> {
    if !self.realm.in_realm(url) {
      return None;
    }
    let local = self.realm.local(url).ok()?;
    if has_executable_extension(&local) {
      let path = self.root.join(&local);
      return path.is_file().then(|| (url.to_string(), path));
    }
    for ext in EXECUTABLE_EXTENSIONS {
      let path = self.root.join(format!("{local}{ext}"));
      if path.is_file() {
        return Some((format!("{url}{ext}"), path));
      }
    }
    None
  }

  fn read_module(&self, url: &str) -> Result<(String, String), LoaderError> {
    let (canonical, path) = self
      .resolve_file(url)
      .ok_or_else(|| LoaderError::new(format!("module not found: {url}")))?;
    let source =
      std::fs::read_to_string(&path).map_err(|err| LoaderError::new(format!("could not read module {url}: {err}")))?;
    Ok((canonical, source))
  }
}

#[async_trait]
impl ModuleLoader for ScanLoader {
  async fn import(&self, url: &str) -> Result<ModuleNamespace, LoaderError> {
    let (canonical, source) = self.read_module(url)?;
    let imports = scan_imports(&source);

    // execution fails when an in-realm import cannot be resolved; the
    // error carries the deps discovered so far
    let mut resolved: Vec<String> = Vec::new();
    for import in &imports {
      let Ok(absolute) = resolve_module(&import.spec, Some(&canonical)) else {
        continue;
      };
      if self.realm.in_realm(&absolute) {
        match self.resolve_file(&absolute) {
          Some((dep_url, _)) => resolved.push(dep_url),
          None => {
            resolved.push(absolute);
            return Err(
              LoaderError::new(format!("unresolved import \"{}\" in {canonical}", import.spec)).with_deps(resolved),
            );
          }
        }
      } else {
        resolved.push(absolute);
      }
    }

    Ok(ModuleNamespace {
      definitions: scan_definitions(&source, &canonical, &imports, &self.realm),
    })
  }

  async fn consumed_modules(&self, url: &str) -> Vec<String> {
    let mut visited = BTreeSet::new();
    let mut consumed: Vec<String> = Vec::new();
    let mut queue = VecDeque::from([url.to_string()]);

    while let Some(current) = queue.pop_front() {
      let Ok((canonical, source)) = self.read_module(&current) else {
        continue;
      };
      if !visited.insert(canonical.clone()) {
        continue;
      }
      for import in scan_imports(&source) {
        let Ok(absolute) = resolve_module(&import.spec, Some(&canonical)) else {
          continue;
        };
        if self.realm.in_realm(&absolute) {
          if let Some((dep_url, _)) = self.resolve_file(&absolute) {
            if !consumed.contains(&dep_url) {
              consumed.push(dep_url.clone());
            }
            if !visited.contains(&dep_url) {
              queue.push_back(dep_url);
            }
          } else if !consumed.contains(&absolute) {
            consumed.push(absolute);
          }
        } else if !consumed.contains(&absolute) {
          consumed.push(absolute);
        }
      }
    }
    consumed
  }

  async fn transpiled_source(&self, url: &str) -> Result<TranspiledModule, LoaderError> {
    let (_canonical, source) = self.read_module(url)?;
    Ok(TranspiledModule {
      scoped_css: extract_scoped_css(&source),
      source,
    })
  }
}

#[derive(Debug, Clone)]
struct ImportDecl {
  names: Vec<String>,
  spec: String,
}

fn scan_imports(source: &str) -> Vec<ImportDecl> {
  let mut imports = Vec::new();
  for line in source.lines() {
    let line = line.trim();
    let is_import = line.starts_with("import ");
    let is_reexport = line.starts_with("export ") && line.contains(" from ");
    if !is_import && !is_reexport {
      continue;
    }
    let Some(spec) = quoted_after_from(line) else { continue };
    imports.push(ImportDecl {
      names: imported_names(line),
      spec,
    });
  }
  imports
}

fn quoted_after_from(line: &str) -> Option<String> {
  let from_idx = line.rfind(" from ")?;
  let rest = line[from_idx + 6..].trim();
  let quote = rest.chars().next()?;
  if quote != '"' && quote != '\'' {
    return None;
  }
  let rest = &rest[1..];
  let end = rest.find(quote)?;
  Some(rest[..end].to_string())
}

fn imported_names(line: &str) -> Vec<String> {
  if let (Some(open), Some(close)) = (line.find('{'), line.find('}'))
    && open < close
  {
    return line[open + 1..close]
      .split(',')
      .filter_map(|part| {
        let part = part.trim();
        // "A as B" binds B
        (!part.is_empty()).then(|| part.split_whitespace().last().unwrap_or(part).to_string())
      })
      .collect();
  }
  let mut parts = line.split_whitespace();
  if parts.next() == Some("import")
    && let Some(name) = parts.next()
    && name != "from"
    && !name.starts_with('"')
    && !name.starts_with('\'')
  {
    return vec![name.trim_end_matches(',').to_string()];
  }
  Vec::new()
}

fn scan_definitions(
  source: &str,
  module_url: &str,
  imports: &[ImportDecl],
  realm: &RealmPaths,
) -> BTreeMap<String, CardDefinition> {
  let mut import_map: BTreeMap<&str, &str> = BTreeMap::new();
  for import in imports {
    for name in &import.names {
      import_map.insert(name.as_str(), import.spec.as_str());
    }
  }

  let mut definitions = BTreeMap::new();
  let mut current: Option<CardDefinition> = None;
  for line in source.lines() {
    let trimmed = line.trim();
    if let Some(rest) = trimmed.strip_prefix("export class ") {
      if let Some(finished) = current.take() {
        definitions.insert(finished.code_ref.name.clone(), finished);
      }
      let Some(name) = rest.split_whitespace().next().map(|n| n.trim_end_matches('{').to_string()) else {
        continue;
      };
      let base = rest
        .split_once(" extends ")
        .and_then(|(_, b)| b.split_whitespace().next())
        .map(|b| b.trim_end_matches('{').to_string());
      let ancestor = base
        .as_deref()
        .and_then(|base| ancestor_ref(base, module_url, &import_map, realm, source));
      current = Some(CardDefinition {
        code_ref: CodeRef::new(module_url, name.clone()),
        display_name: name,
        ancestor,
        field_names: Vec::new(),
      });
    } else if trimmed == "}" {
      if let Some(finished) = current.take() {
        definitions.insert(finished.code_ref.name.clone(), finished);
      }
    } else if let Some(current_def) = current.as_mut() {
      if let Some(rest) = trimmed.strip_prefix("static displayName") {
        if let Some(value) = quoted(rest) {
          current_def.display_name = value;
        }
      } else if let Some(rest) = trimmed.strip_prefix("@field ") {
        if let Some(field) = rest.split_whitespace().next() {
          current_def.field_names.push(field.trim_end_matches(['=', ':', ';']).to_string());
        }
      }
    }
  }
  if let Some(finished) = current.take() {
    definitions.insert(finished.code_ref.name.clone(), finished);
  }
  definitions
}

fn ancestor_ref(
  base: &str,
  module_url: &str,
  import_map: &BTreeMap<&str, &str>,
  realm: &RealmPaths,
  source: &str,
) -> Option<CodeRef> {
  if let Some(spec) = import_map.get(base) {
    let absolute = resolve_module(spec, Some(module_url)).ok()?;
    if realm.in_realm(&absolute) {
      Some(CodeRef::new((*spec).to_string(), base.to_string()))
    } else {
      // provided by the environment; roots the ancestry chain
      None
    }
  } else if source.contains(&format!("class {base}")) {
    Some(CodeRef::new(module_url.to_string(), base.to_string()))
  } else {
    None
  }
}

fn quoted(text: &str) -> Option<String> {
  let start = text.find('"')?;
  let rest = &text[start + 1..];
  let end = rest.find('"')?;
  Some(rest[..end].to_string())
}

fn extract_scoped_css(source: &str) -> Option<String> {
  let start = source.find("<style scoped>")?;
  let rest = &source[start + "<style scoped>".len()..];
  let end = rest.find("</style>")?;
  let css = rest[..end].trim();
  (!css.is_empty()).then(|| css.to_string())
}
