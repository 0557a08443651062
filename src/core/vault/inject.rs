//! Pure credential templating and request assembly. No I/O happens here.

use serde_json::{Map, Value};
use std::fmt;

use super::ResolvedCredentials;
use crate::core::store::types::InjectionMethod;

pub const VALUE_PLACEHOLDER: &str = "{{value}}";

/// Substitute the secret into the template's single placeholder. An empty
/// template means the bare value.
pub fn render_template(template: &str, secret: &str) -> String {
    if template.is_empty() {
        return secret.to_string();
    }
    template.replacen(VALUE_PLACEHOLDER, secret, 1)
}

/// A template must be empty or contain the placeholder exactly once.
pub fn validate_template(template: &str) -> Result<(), String> {
    if template.is_empty() {
        return Ok(());
    }
    match template.matches(VALUE_PLACEHOLDER).count() {
        1 => Ok(()),
        0 => Err(format!("template '{}' has no {} placeholder", template, VALUE_PLACEHOLDER)),
        n => Err(format!(
            "template '{}' has {} placeholders, expected exactly one",
            template, n
        )),
    }
}

/// Everything the dispatcher sends besides the URL.
#[derive(Clone, Default)]
pub struct PreparedRequest {
    pub headers: Vec<(String, String)>,
    pub query: Vec<(String, String)>,
    pub body: Value,
}

impl fmt::Debug for PreparedRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let header_names: Vec<&str> = self.headers.iter().map(|(k, _)| k.as_str()).collect();
        let query_names: Vec<&str> = self.query.iter().map(|(k, _)| k.as_str()).collect();
        f.debug_struct("PreparedRequest")
            .field("headers", &header_names)
            .field("query", &query_names)
            .finish_non_exhaustive()
    }
}

/// Merge the job payload with rendered credentials. A non-object payload is
/// wrapped as `{"payload": ...}` so body injections have somewhere to go.
pub fn prepare_request(payload: &Value, credentials: &ResolvedCredentials) -> PreparedRequest {
    let mut body = match payload {
        Value::Object(map) => Value::Object(map.clone()),
        Value::Null => Value::Object(Map::new()),
        other => {
            let mut map = Map::new();
            map.insert("payload".to_string(), other.clone());
            Value::Object(map)
        }
    };

    let mut prepared = PreparedRequest::default();
    for entry in credentials.iter() {
        let rendered = render_template(
            &entry.requirement.format_template,
            entry.secret.expose(),
        );
        let key = entry.requirement.target_key();
        match entry.requirement.injection_method {
            InjectionMethod::Header => prepared.headers.push((key, rendered)),
            InjectionMethod::Query => prepared.query.push((key, rendered)),
            InjectionMethod::Body => set_path(&mut body, &key, Value::String(rendered)),
        }
    }
    prepared.body = body;
    prepared
}

/// Set a dotted path, creating intermediate objects and replacing any
/// non-object value in the way.
fn set_path(root: &mut Value, path: &str, value: Value) {
    let mut segments: Vec<&str> = path.split('.').filter(|s| !s.is_empty()).collect();
    let Some(last) = segments.pop() else {
        return;
    };
    let mut cursor = root;
    for segment in segments {
        if !cursor.is_object() {
            *cursor = Value::Object(Map::new());
        }
        let Value::Object(map) = cursor else {
            return;
        };
        cursor = map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    if !cursor.is_object() {
        *cursor = Value::Object(Map::new());
    }
    if let Value::Object(map) = cursor {
        map.insert(last.to_string(), value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::store::types::RequiredCredential;
    use crate::core::vault::{ResolvedCredential, SecretValue};
    use proptest::prelude::*;
    use serde_json::json;

    fn cred(provider: &str, method: InjectionMethod, key: Option<&str>, template: &str, secret: &str) -> ResolvedCredential {
        ResolvedCredential {
            requirement: RequiredCredential {
                provider: provider.to_string(),
                required: true,
                injection_method: method,
                key: key.map(str::to_string),
                format_template: template.to_string(),
            },
            secret: SecretValue::new(secret),
        }
    }

    #[test]
    fn renders_single_placeholder() {
        assert_eq!(render_template("Bearer {{value}}", "abc"), "Bearer abc");
        assert_eq!(render_template("", "abc"), "abc");
        assert_eq!(render_template("{{value}}", "a{{value}}b"), "a{{value}}b");
    }

    #[test]
    fn template_validation() {
        assert!(validate_template("Bearer {{value}}").is_ok());
        assert!(validate_template("").is_ok());
        assert!(validate_template("Bearer").is_err());
        assert!(validate_template("{{value}}:{{value}}").is_err());
    }

    #[test]
    fn injects_headers_query_and_body() {
        let creds = ResolvedCredentials::new(vec![
            cred("openai", InjectionMethod::Header, None, "Bearer {{value}}", "sk-1"),
            cred("maps", InjectionMethod::Query, Some("key"), "{{value}}", "m-2"),
            cred("github", InjectionMethod::Body, None, "token {{value}}", "gh-3"),
            cred("db", InjectionMethod::Body, Some("config.db.password"), "{{value}}", "pw"),
        ]);
        let prepared = prepare_request(&json!({ "input": "hi" }), &creds);

        assert_eq!(
            prepared.headers,
            vec![("Authorization".to_string(), "Bearer sk-1".to_string())]
        );
        assert_eq!(prepared.query, vec![("key".to_string(), "m-2".to_string())]);
        assert_eq!(
            prepared.body,
            json!({
                "input": "hi",
                "credentials": { "github": "token gh-3" },
                "config": { "db": { "password": "pw" } }
            })
        );
    }

    #[test]
    fn scalar_payload_is_wrapped() {
        let prepared = prepare_request(&json!("hello"), &ResolvedCredentials::default());
        assert_eq!(prepared.body, json!({ "payload": "hello" }));
        let prepared = prepare_request(&Value::Null, &ResolvedCredentials::default());
        assert_eq!(prepared.body, json!({}));
    }

    #[test]
    fn body_path_overwrites_scalar_in_the_way() {
        let mut body = json!({ "credentials": "oops" });
        set_path(&mut body, "credentials.github", json!("x"));
        assert_eq!(body, json!({ "credentials": { "github": "x" } }));
    }

    #[test]
    fn debug_hides_values() {
        let creds = ResolvedCredentials::new(vec![cred(
            "openai",
            InjectionMethod::Header,
            None,
            "Bearer {{value}}",
            "sk-secret",
        )]);
        let prepared = prepare_request(&json!({}), &creds);
        let debug = format!("{:?}", prepared);
        assert!(debug.contains("Authorization"));
        assert!(!debug.contains("sk-secret"));
    }

    proptest! {
        #[test]
        fn substitution_is_exact(
            prefix in "[a-zA-Z :]{0,12}",
            suffix in "[a-zA-Z :]{0,12}",
            secret in "[a-zA-Z0-9_-]{1,48}",
        ) {
            let template = format!("{}{}{}", prefix, VALUE_PLACEHOLDER, suffix);
            prop_assert!(validate_template(&template).is_ok());
            prop_assert_eq!(
                render_template(&template, &secret),
                format!("{}{}{}", prefix, secret, suffix)
            );
        }
    }
}
