use async_trait::async_trait;
use serde_json::Value;

use index::{CardRenderer, Format, RenderError, RenderRequest};

/// Default renderer: deterministic HTML fragments built from the
/// instance's attributes. Presentation templates belong to the
/// surrounding application; the index only needs stable fragments per
/// format.
pub struct HtmlRenderer;

#[async_trait]
impl CardRenderer for HtmlRenderer {
  async fn render(&self, request: RenderRequest<'_>) -> Result<String, RenderError> {
    let type_name = escape(&request.definition.display_name);
    match request.format {
      Format::Atom => {
        let title = request
          .definition
          .field_names
          .first()
          .and_then(|field| request.resource.attributes.get(field))
          .map(display_value)
          .filter(|title| !title.is_empty())
          .unwrap_or_else(|| type_name.clone());
        Ok(format!("<span class=\"atom-card\" data-type=\"{type_name}\">{title}</span>"))
      }
      Format::Isolated | Format::Embedded => {
        let mut rows = String::new();
        for field in &request.definition.field_names {
          let value = request.resource.attributes.get(field).map(display_value).unwrap_or_default();
          rows.push_str(&format!(
            "<div class=\"field\"><span class=\"field-name\">{}</span><span class=\"field-value\">{}</span></div>",
            escape(field),
            value
          ));
        }
        Ok(format!(
          "<div class=\"{}-card\" data-type=\"{type_name}\">{rows}</div>",
          request.format.as_str()
        ))
      }
    }
  }
}

fn display_value(value: &Value) -> String {
  match value {
    Value::String(text) => escape(text),
    Value::Null => String::new(),
    other => escape(&other.to_string()),
  }
}

fn escape(text: &str) -> String {
  text.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}
