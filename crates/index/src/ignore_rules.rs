// Nested ignore-file handling.
//
// Each directory may carry a .gitignore whose patterns apply to everything
// beneath it; a file is skipped when any ancestor directory's patterns
// match it. Pattern files are loaded lazily as the run walks into a
// directory and cached for the rest of the run. The raw pattern text is
// carried between runs so incremental visits honor rules discovered by an
// earlier walk.

use ignore::gitignore::{Gitignore, GitignoreBuilder};
use std::collections::HashMap;

pub const IGNORE_FILE: &str = ".gitignore";

pub struct IgnoreIndex {
  realm_url: String,
  compiled: HashMap<String, Gitignore>,
  data: HashMap<String, String>,
}

impl IgnoreIndex {
  pub fn new(realm_url: &str, data: HashMap<String, String>) -> Self {
    let compiled = data
      .iter()
      .map(|(dir_url, content)| (dir_url.clone(), compile(content)))
      .collect();
    Self {
      realm_url: realm_url.to_string(),
      compiled,
      data,
    }
  }

  /// Register the pattern text found in a directory's ignore file.
  pub fn add(&mut self, dir_url: &str, content: &str) {
    self.compiled.insert(dir_url.to_string(), compile(content));
    self.data.insert(dir_url.to_string(), content.to_string());
  }

  /// Raw pattern text per directory URL, for carry-over between runs.
  pub fn into_data(self) -> HashMap<String, String> {
    self.data
  }

  /// Whether any ancestor directory's patterns match this URL. The realm
  /// root itself is never ignored.
  pub fn is_ignored(&self, url: &str, is_dir: bool) -> bool {
    if url == self.realm_url {
      return false;
    }
    for (dir_url, gitignore) in &self.compiled {
      if let Some(relative) = url.strip_prefix(dir_url.as_str()) {
        let relative = relative.trim_end_matches('/');
        if !relative.is_empty() && gitignore.matched_path_or_any_parents(relative, is_dir).is_ignore() {
          return true;
        }
      }
    }
    false
  }
}

fn compile(content: &str) -> Gitignore {
  let mut builder = GitignoreBuilder::new("");
  for line in content.lines() {
    // a malformed pattern line is skipped, matching git's behavior
    let _ = builder.add_line(None, line);
  }
  builder.build().unwrap_or_else(|_| Gitignore::empty())
}
