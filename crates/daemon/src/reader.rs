use async_trait::async_trait;
use std::io;
use std::path::PathBuf;
use std::time::UNIX_EPOCH;

use index::{DirEntry, EntryKind, Reader, TextFile};

/// Filesystem reader rooted at a realm's directory. Paths are realm-local;
/// directory paths carry a trailing slash.
pub struct LocalReader {
  root: PathBuf,
}

impl LocalReader {
  pub fn new(root: PathBuf) -> Self {
    Self { root }
  }
}

#[async_trait]
impl Reader for LocalReader {
  async fn read_file_as_text(&self, path: &str) -> io::Result<Option<TextFile>> {
    let full = self.root.join(path);
    match tokio::fs::read_to_string(&full).await {
      Ok(content) => {
        let metadata = tokio::fs::metadata(&full).await?;
        let last_modified = metadata
          .modified()
          .ok()
          .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
          .map(|duration| duration.as_millis() as i64)
          .unwrap_or_default();
        Ok(Some(TextFile { content, last_modified }))
      }
      Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
      Err(err) => Err(err),
    }
  }

  async fn readdir(&self, path: &str) -> io::Result<Vec<DirEntry>> {
    let full = self.root.join(path);
    let mut read_dir = tokio::fs::read_dir(&full).await?;
    let mut entries = Vec::new();
    while let Some(entry) = read_dir.next_entry().await? {
      let file_type = entry.file_type().await?;
      let name = entry.file_name().to_string_lossy().into_owned();
      let local = format!("{path}{name}");
      if file_type.is_dir() {
        entries.push(DirEntry {
          path: format!("{local}/"),
          kind: EntryKind::Directory,
        });
      } else if file_type.is_file() {
        entries.push(DirEntry {
          path: local,
          kind: EntryKind::File,
        });
      }
    }
    entries.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(entries)
  }
}
