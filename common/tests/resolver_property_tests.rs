// Property-based tests for placeholder resolution.

use common::models::normalize_key;
use common::resolver::VariableResolver;
use proptest::prelude::*;
use serde_json::json;
use std::collections::HashMap;

fn key_strategy() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9_-]{0,20}"
}

fn value_strategy() -> impl Strategy<Value = String> {
    // Values without brace characters, so a substituted value can never be
    // mistaken for another placeholder.
    "[a-zA-Z0-9 ._:/-]{0,30}"
}

proptest! {
    /// *For any* known key/value pair, a template consisting of that
    /// placeholder resolves to exactly the value.
    #[test]
    fn property_known_placeholder_resolves(key in key_strategy(), value in value_strategy()) {
        let mut vars = HashMap::new();
        vars.insert(normalize_key(&key), value.clone());
        let resolver = VariableResolver::new(vars);

        prop_assert_eq!(resolver.resolve_str(&format!("{{{}}}", key)), value);
    }

    /// *For any* template, resolving against an empty kv map is the
    /// identity: unknown tokens are left intact.
    #[test]
    fn property_empty_map_is_identity(template in "[a-zA-Z0-9 {}._-]{0,60}") {
        let resolver = VariableResolver::new(HashMap::new());
        prop_assert_eq!(resolver.resolve_str(&template), template);
    }

    /// *For any* kv map whose values contain no braces, resolution is
    /// idempotent: resolve(resolve(x)) == resolve(x).
    #[test]
    fn property_resolution_idempotent(
        entries in proptest::collection::hash_map(key_strategy(), value_strategy(), 0..8),
        template in "[a-zA-Z0-9 {}._-]{0,60}",
    ) {
        let vars: HashMap<String, String> = entries
            .into_iter()
            .map(|(k, v)| (normalize_key(&k), v))
            .collect();
        let resolver = VariableResolver::new(vars);

        let once = resolver.resolve_str(&template);
        let twice = resolver.resolve_str(&once);
        prop_assert_eq!(once, twice);
    }

    /// *For any* key casing, lookup is case-insensitive.
    #[test]
    fn property_lookup_normalizes_case(key in "[a-z][a-z0-9-]{0,12}", value in value_strategy()) {
        let mut vars = HashMap::new();
        vars.insert(normalize_key(&key), value.clone());
        let resolver = VariableResolver::new(vars);

        let upper = format!("{{{}}}", key.to_uppercase());
        prop_assert_eq!(resolver.resolve_str(&upper), value);
    }

    /// *For any* nested config, non-string leaves survive resolution
    /// unchanged.
    #[test]
    fn property_non_string_leaves_untouched(n in any::<i64>(), flag in any::<bool>()) {
        let resolver = VariableResolver::new(HashMap::new());
        let config = json!({ "n": n, "flag": flag, "nested": { "list": [n, flag] } });
        prop_assert_eq!(resolver.resolve_value(&config), config);
    }
}
