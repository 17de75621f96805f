//! Maps a client-requested model name or alias onto a configured recipe.

use crate::recipes::Recipe;
use serde_json::Value;

/// Last `/` segment, lowercased, alphanumerics only.
pub fn normalize_key(name: &str) -> String {
    let last = name.rsplit('/').next().unwrap_or(name);
    last.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

/// First recipe matching `requested`, trying in order: exact
/// (case-insensitive) served name or id, normalized prefix of served name or
/// id, normalized recipe name.
pub fn resolve<'a>(requested: &str, recipes: &'a [Recipe]) -> Option<&'a Recipe> {
    let key = normalize_key(requested);

    let exact = recipes.iter().find(|recipe| {
        recipe
            .served_model_name
            .as_deref()
            .is_some_and(|served| served.eq_ignore_ascii_case(requested))
            || recipe.id.eq_ignore_ascii_case(requested)
    });
    if exact.is_some() {
        return exact;
    }

    if !key.is_empty() {
        let prefixed = recipes.iter().find(|recipe| {
            let served_key = recipe
                .served_model_name
                .as_deref()
                .map(normalize_key)
                .unwrap_or_default();
            let id_key = normalize_key(&recipe.id);
            (!served_key.is_empty() && key.starts_with(&served_key))
                || (!id_key.is_empty() && key.starts_with(&id_key))
        });
        if prefixed.is_some() {
            return prefixed;
        }
    }

    recipes
        .iter()
        .find(|recipe| !key.is_empty() && normalize_key(&recipe.name) == key)
}

/// Replaces the body's `model` field. Returns whether anything changed.
pub fn rewrite_model(body: &mut Value, canonical: &str) -> bool {
    let Some(obj) = body.as_object_mut() else {
        return false;
    };
    if obj.get("model").and_then(|v| v.as_str()) == Some(canonical) {
        return false;
    }
    obj.insert("model".to_string(), Value::String(canonical.to_string()));
    true
}
