use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::code_ref::CodeRef;

/// The JSON envelope of a card document file: `{"data": {...}}` with a
/// declared type under `meta.adoptsFrom`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CardResource {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub id: Option<String>,
  #[serde(default)]
  pub attributes: Map<String, Value>,
  #[serde(default, skip_serializing_if = "Map::is_empty")]
  pub relationships: Map<String, Value>,
  pub meta: Meta,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Meta {
  #[serde(rename = "adoptsFrom")]
  pub adopts_from: CodeRef,
  #[serde(default, rename = "lastModified", skip_serializing_if = "Option::is_none")]
  pub last_modified: Option<i64>,
}

/// Parse file content as a card document. Returns `None` when the file is
/// not JSON or lacks the card envelope; only well-formed card resources are
/// indexed as instances.
pub fn parse_card_document(content: &str) -> Option<CardResource> {
  let doc: Value = serde_json::from_str(content).ok()?;
  let data = doc.get("data")?;
  serde_json::from_value(data.clone()).ok()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_parse_card_document() {
    let content = r#"{
      "data": {
        "attributes": { "firstName": "Hassan" },
        "meta": { "adoptsFrom": { "module": "./person", "name": "Person" } }
      }
    }"#;
    let resource = parse_card_document(content).unwrap();
    assert_eq!(resource.meta.adopts_from.name, "Person");
    assert_eq!(resource.attributes["firstName"], "Hassan");
  }

  #[test]
  fn test_parse_rejects_plain_json() {
    assert!(parse_card_document(r#"{"hello": "world"}"#).is_none());
    assert!(parse_card_document(r#"{"data": {"attributes": {}}}"#).is_none());
    assert!(parse_card_document("not json at all").is_none());
  }
}
