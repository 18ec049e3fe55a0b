// Placeholder expansion for job-definition config.
//
// `{key-name}` tokens inside definition strings are replaced with the value
// of the kv entry whose normalized key matches. Unknown tokens are left
// intact so legitimate curly-brace content survives; each miss logs one
// warning. Resolution happens at load time only; rotating a secret means
// re-seeding the definitions that reference it.

use crate::models::normalize_key;
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::OnceLock;
use tracing::warn;

fn placeholder_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{([A-Za-z0-9_][A-Za-z0-9_\-.]*)\}").expect("valid regex"))
}

/// VariableResolver expands `{name}` placeholders against a kv snapshot.
///
/// The map is expected to be keyed by normalized form (the kv repository's
/// `snapshot()` returns it that way); lookups normalize the token before
/// searching.
pub struct VariableResolver {
    variables: HashMap<String, String>,
}

impl VariableResolver {
    pub fn new(variables: HashMap<String, String>) -> Self {
        Self { variables }
    }

    /// Expand placeholders in one string. Unknown tokens stay as-is.
    pub fn resolve_str(&self, template: &str) -> String {
        let mut result = String::with_capacity(template.len());
        let mut last_end = 0;

        for cap in placeholder_regex().captures_iter(template) {
            let whole = cap.get(0).unwrap();
            let token = cap.get(1).unwrap().as_str();

            result.push_str(&template[last_end..whole.start()]);
            match self.variables.get(&normalize_key(token)) {
                Some(value) => result.push_str(value),
                None => {
                    warn!(token = token, "Unknown placeholder left unresolved");
                    result.push_str(whole.as_str());
                }
            }
            last_end = whole.end();
        }
        result.push_str(&template[last_end..]);
        result
    }

    /// Expand placeholders recursively through strings, arrays, and maps.
    /// Non-string leaves pass through untouched.
    pub fn resolve_value(&self, value: &Value) -> Value {
        match value {
            Value::String(s) => Value::String(self.resolve_str(s)),
            Value::Array(items) => {
                Value::Array(items.iter().map(|v| self.resolve_value(v)).collect())
            }
            Value::Object(map) => Value::Object(self.resolve_map(map)),
            other => other.clone(),
        }
    }

    /// Expand placeholders in every value of a config map.
    pub fn resolve_map(&self, map: &Map<String, Value>) -> Map<String, Value> {
        map.iter()
            .map(|(k, v)| (k.clone(), self.resolve_value(v)))
            .collect()
    }

    /// Whether any placeholder token appears in the template.
    pub fn has_placeholders(template: &str) -> bool {
        placeholder_regex().is_match(template)
    }
}
