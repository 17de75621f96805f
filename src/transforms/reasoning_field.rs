use serde_json::{Map, Value};

/// Some backends send the reasoning text twice, as `reasoning` and as
/// `reasoning_content`. Keeps a single `reasoning_content` field.
pub fn fold_reasoning_field(body: &mut Map<String, Value>) -> bool {
    let Some(reasoning) = body.remove("reasoning") else {
        return false;
    };
    if !body.contains_key("reasoning_content") {
        body.insert("reasoning_content".to_string(), reasoning);
    }
    true
}
