// Code references identify a card definition exported from a module.
//
// Dependency sets and type ancestry keys always use the trimmed module URL
// (no executable extension) so that `person.gts` and `person` refer to the
// same module identity.

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Error, Result};

/// Extensions that mark a file as an executable module rather than a
/// document instance.
pub const EXECUTABLE_EXTENSIONS: &[&str] = &[".js", ".gjs", ".ts", ".gts"];

pub fn has_executable_extension(path: &str) -> bool {
  EXECUTABLE_EXTENSIONS
    .iter()
    .any(|ext| path.ends_with(ext) && !path.ends_with(".d.ts"))
}

/// Strip a trailing executable extension, if any.
pub fn trim_executable_extension(url: &str) -> String {
  for ext in EXECUTABLE_EXTENSIONS {
    if let Some(trimmed) = url.strip_suffix(ext) {
      return trimmed.to_string();
    }
  }
  url.to_string()
}

/// Resolve a possibly-relative module specifier against a base URL.
pub fn resolve_module(specifier: &str, base: Option<&str>) -> Result<String> {
  match Url::parse(specifier) {
    Ok(url) => Ok(url.to_string()),
    Err(url::ParseError::RelativeUrlWithoutBase) => {
      let base = base.ok_or_else(|| Error::InvalidUrl(format!("relative module '{specifier}' with no base")))?;
      let base = Url::parse(base).map_err(|e| Error::InvalidUrl(format!("{base}: {e}")))?;
      let joined = base
        .join(specifier)
        .map_err(|e| Error::InvalidUrl(format!("{specifier}: {e}")))?;
      Ok(joined.to_string())
    }
    Err(e) => Err(Error::InvalidUrl(format!("{specifier}: {e}"))),
  }
}

/// Reference to a named card definition inside a module.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CodeRef {
  pub module: String,
  pub name: String,
}

impl CodeRef {
  pub fn new(module: impl Into<String>, name: impl Into<String>) -> Self {
    Self {
      module: module.into(),
      name: name.into(),
    }
  }

  /// Absolute module URL for this ref, resolved against `relative_to`.
  pub fn module_url(&self, relative_to: Option<&str>) -> Result<String> {
    resolve_module(&self.module, relative_to)
  }

  /// Stable identity key: trimmed absolute module URL + export name. Used
  /// for type ancestry lists and the per-run type cache.
  pub fn internal_key(&self, relative_to: Option<&str>) -> Result<String> {
    let module = self.module_url(relative_to)?;
    Ok(format!("{}/{}", trim_executable_extension(&module), self.name))
  }
}

impl std::fmt::Display for CodeRef {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}#{}", self.module, self.name)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_executable_extensions() {
    assert!(has_executable_extension("http://realm/person.gts"));
    assert!(has_executable_extension("http://realm/util.js"));
    assert!(!has_executable_extension("http://realm/person-1.json"));
    assert!(!has_executable_extension("http://realm/types.d.ts"));
  }

  #[test]
  fn test_trim_executable_extension() {
    assert_eq!(trim_executable_extension("http://realm/person.gts"), "http://realm/person");
    assert_eq!(trim_executable_extension("http://realm/person"), "http://realm/person");
  }

  #[test]
  fn test_resolve_relative_module() {
    let resolved = resolve_module("./contact.gts", Some("http://realm/people/person.gts")).unwrap();
    assert_eq!(resolved, "http://realm/people/contact.gts");

    let resolved = resolve_module("../base.gts", Some("http://realm/people/person.gts")).unwrap();
    assert_eq!(resolved, "http://realm/base.gts");
  }

  #[test]
  fn test_resolve_absolute_module() {
    let resolved = resolve_module("http://other-realm/card.gts", Some("http://realm/person.gts")).unwrap();
    assert_eq!(resolved, "http://other-realm/card.gts");
  }

  #[test]
  fn test_internal_key_trims_extension() {
    let code_ref = CodeRef::new("./person.gts", "Person");
    let key = code_ref.internal_key(Some("http://realm/")).unwrap();
    assert_eq!(key, "http://realm/person/Person");
  }
}
