//! Templated response payloads.
//!
//! Any string inside a response payload may reference the inbound request with Handlebars
//! syntax, e.g. `{"text": "echo: {{request.text}}"}`. The rendering context is:
//!
//! * `request`: the decoded request message (a JSON array for assembled request streams).
//! * `method`: the called method as `package.Service/Method`.
//!
//! Strings without `{{` are returned untouched.
use handlebars::{Handlebars, Template, TemplateError};
use serde::Serialize;
use serde_json::Value;
use std::sync::LazyLock;
use tracing::warn;

static ENGINE: LazyLock<Handlebars<'static>> = LazyLock::new(|| {
    let mut engine = Handlebars::new();
    // Payloads are protobuf JSON, not HTML.
    engine.register_escape_fn(handlebars::no_escape);
    engine
});

/// Data made available to payload templates.
#[derive(Debug, Serialize)]
pub struct TemplateContext<'a> {
    pub request: &'a Value,
    pub method: String,
}

fn is_template(value: &str) -> bool {
    value.contains("{{")
}

/// Compiles every templated string in `payload`.
///
/// Returns whether the payload contains any template at all.
pub fn check(payload: &Value) -> Result<bool, TemplateError> {
    match payload {
        Value::String(s) if is_template(s) => Template::compile(s).map(|_| true),
        Value::Array(items) => items
            .iter()
            .try_fold(false, |found, item| Ok(check(item)? || found)),
        Value::Object(fields) => fields
            .values()
            .try_fold(false, |found, item| Ok(check(item)? || found)),
        _ => Ok(false),
    }
}

/// Renders every templated string in `payload` against `context`.
pub fn render(payload: &Value, context: &TemplateContext<'_>) -> Value {
    match payload {
        Value::String(s) if is_template(s) => match ENGINE.render_template(s, context) {
            Ok(rendered) => Value::String(rendered),
            Err(err) => {
                warn!(template = %s, error = %err, "Failed to render payload template");
                payload.clone()
            }
        },
        Value::Array(items) => Value::Array(items.iter().map(|v| render(v, context)).collect()),
        Value::Object(fields) => Value::Object(
            fields
                .iter()
                .map(|(k, v)| (k.clone(), render(v, context)))
                .collect(),
        ),
        other => other.clone(),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn renders_request_fields() {
        let request = json!({ "text": "hi", "meta": { "origin": "cli" } });
        let context = TemplateContext {
            request: &request,
            method: "echo.Echo/Say".to_string(),
        };

        let payload = json!({
            "text": "echo: {{request.text}} from {{request.meta.origin}}",
            "seq": 3,
            "nested": ["{{method}}"]
        });

        assert_eq!(
            render(&payload, &context),
            json!({
                "text": "echo: hi from cli",
                "seq": 3,
                "nested": ["echo.Echo/Say"]
            })
        );
    }

    #[test]
    fn missing_fields_render_empty() {
        let request = json!({});
        let context = TemplateContext {
            request: &request,
            method: String::new(),
        };

        assert_eq!(
            render(&json!("[{{request.text}}]"), &context),
            json!("[]")
        );
    }

    #[test]
    fn check_reports_templates_and_syntax_errors() {
        assert!(!check(&json!({ "text": "plain" })).unwrap());
        assert!(check(&json!({ "list": [1, "{{request.text}}"] })).unwrap());
        assert!(check(&json!({ "text": "{{#if}}" })).is_err());
    }
}
