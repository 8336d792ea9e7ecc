use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeSet;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
  #[error("Not found: {0}")]
  NotFound(String),

  #[error("Invalid realm URL: {0}")]
  InvalidUrl(String),

  #[error("Invalid resource: {0}")]
  InvalidResource(String),

  #[error("Config: {0}")]
  Config(String),

  #[error("IO: {0}")]
  Io(#[from] std::io::Error),

  #[error("Serialization: {0}")]
  Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Structured error detail carried by `error` index entries and rejected
/// jobs. `deps` records the dependencies known at the time of failure so
/// that fixing an upstream file re-triggers indexing of this one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
  pub status: u16,
  pub message: String,
  #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
  pub deps: BTreeSet<String>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub additional_errors: Vec<String>,
}

impl ErrorDetail {
  pub fn new(status: u16, message: impl Into<String>) -> Self {
    Self {
      status,
      message: message.into(),
      deps: BTreeSet::new(),
      additional_errors: Vec::new(),
    }
  }

  pub fn with_deps(mut self, deps: impl IntoIterator<Item = String>) -> Self {
    self.deps = deps.into_iter().collect();
    self
  }

  pub fn not_found(url: &str) -> Self {
    Self::new(404, format!("missing file {url}")).with_deps([url.to_string()])
  }

  pub fn is_not_found(&self) -> bool {
    self.status == 404
  }
}

impl std::fmt::Display for ErrorDetail {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{} ({})", self.message, self.status)
  }
}

/// Serialize an arbitrary error into a JSON payload for a rejected job.
/// Records the message plus the full source chain; if the error refuses to
/// serialize, falls back to a minimal stringified shape.
pub fn serializable_error(err: &(dyn std::error::Error + 'static)) -> Value {
  let mut chain = Vec::new();
  let mut source = err.source();
  while let Some(cause) = source {
    chain.push(cause.to_string());
    source = cause.source();
  }
  match serde_json::to_value(json!({
    "message": err.to_string(),
    "stack": chain,
  })) {
    Ok(value) => value,
    Err(_) => json!({
      "failedToSerializeError": true,
      "string": err.to_string(),
    }),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_error_detail_roundtrip() {
    let detail = ErrorDetail::new(500, "module blew up").with_deps(["http://realm/a.gts".to_string()]);
    let value = serde_json::to_value(&detail).unwrap();
    let back: ErrorDetail = serde_json::from_value(value).unwrap();
    assert_eq!(back, detail);
    assert!(!back.is_not_found());
  }

  #[test]
  fn test_not_found_detail() {
    let detail = ErrorDetail::not_found("http://realm/gone.json");
    assert!(detail.is_not_found());
    assert!(detail.deps.contains("http://realm/gone.json"));
  }

  #[test]
  fn test_serializable_error_includes_chain() {
    let io = std::io::Error::other("disk on fire");
    let err = Error::Io(io);
    let value = serializable_error(&err);
    assert!(value["message"].as_str().unwrap().contains("disk on fire"));
    assert_eq!(value["stack"].as_array().unwrap().len(), 1);
  }
}
