use serde_json::Value;

/// Score a union branch. Richer branches win: schemas with concrete
/// properties beat bare objects, which beat arrays, which beat scalars;
/// null-typed branches lose to everything.
fn score_schema_option(val: &Value) -> i32 {
    if let Value::Object(obj) = val {
        let type_str = obj.get("type").and_then(|t| t.as_str()).map(|s| s.to_ascii_lowercase());
        if obj.contains_key("properties") {
            return 4;
        }
        if type_str.as_deref() == Some("object") {
            return 3;
        }
        if obj.contains_key("items") || type_str.as_deref() == Some("array") {
            return 2;
        }
        if let Some(t) = type_str {
            if t != "null" {
                return 1;
            }
        }
    }
    0
}

/// Select the best non-null branch from an anyOf/oneOf union.
pub(super) fn extract_best_schema_from_union(union_array: &[Value]) -> Option<Value> {
    let mut best_option: Option<&Value> = None;
    let mut best_score = -1;

    for item in union_array {
        let score = score_schema_option(item);
        if score > best_score {
            best_score = score;
            best_option = Some(item);
        }
    }

    best_option.cloned()
}
