use url::Url;

use crate::error::{Error, Result};

/// A realm-relative path, forward-slash separated, no leading slash.
pub type LocalPath = String;

/// Maps between a realm's base URL and realm-local paths.
#[derive(Debug, Clone)]
pub struct RealmPaths {
  base: Url,
}

impl RealmPaths {
  /// The base URL is normalized to carry a trailing slash so joins behave.
  pub fn new(realm_url: &str) -> Result<Self> {
    let mut normalized = realm_url.to_string();
    if !normalized.ends_with('/') {
      normalized.push('/');
    }
    let base = Url::parse(&normalized).map_err(|e| Error::InvalidUrl(format!("{realm_url}: {e}")))?;
    Ok(Self { base })
  }

  pub fn url(&self) -> &str {
    self.base.as_str()
  }

  pub fn in_realm(&self, url: &str) -> bool {
    url.starts_with(self.base.as_str())
  }

  /// Realm-local path for an absolute URL inside this realm.
  pub fn local(&self, url: &str) -> Result<LocalPath> {
    url
      .strip_prefix(self.base.as_str())
      .map(|p| p.to_string())
      .ok_or_else(|| Error::InvalidUrl(format!("{url} is not in realm {}", self.base)))
  }

  /// Absolute URL of a file at a realm-local path.
  pub fn file_url(&self, local: &str) -> Result<String> {
    let joined = self
      .base
      .join(local.trim_start_matches('/'))
      .map_err(|e| Error::InvalidUrl(format!("{local}: {e}")))?;
    Ok(joined.to_string())
  }

  /// Absolute URL of a directory at a realm-local path, with the trailing
  /// slash directories carry.
  pub fn directory_url(&self, local: &str) -> Result<String> {
    let mut url = self.file_url(local)?;
    if !url.ends_with('/') {
      url.push('/');
    }
    Ok(url)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_base_normalization() {
    let paths = RealmPaths::new("http://realm.example/demo").unwrap();
    assert_eq!(paths.url(), "http://realm.example/demo/");
  }

  #[test]
  fn test_local_and_file_url_roundtrip() {
    let paths = RealmPaths::new("http://realm.example/demo/").unwrap();
    let url = paths.file_url("people/person-1.json").unwrap();
    assert_eq!(url, "http://realm.example/demo/people/person-1.json");
    assert_eq!(paths.local(&url).unwrap(), "people/person-1.json");
  }

  #[test]
  fn test_local_rejects_foreign_url() {
    let paths = RealmPaths::new("http://realm.example/demo/").unwrap();
    assert!(paths.local("http://other.example/x.json").is_err());
  }

  #[test]
  fn test_directory_url_has_trailing_slash() {
    let paths = RealmPaths::new("http://realm.example/demo/").unwrap();
    assert_eq!(paths.directory_url("people").unwrap(), "http://realm.example/demo/people/");
  }
}
