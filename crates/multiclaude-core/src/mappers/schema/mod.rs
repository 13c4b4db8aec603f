//! JSON Schema cleaning for the Google v1internal tool interface.
//!
//! The upstream API accepts a narrow schema dialect: no `$ref`, no validation
//! keywords, no unions, and SCREAMING-case type names. Cleaning runs in five
//! phases: reference flattening, constraint-to-hint conversion, union
//! resolution, keyword pruning, and type normalization. The pipeline is
//! idempotent.

mod merge;
mod recursive;
mod union;

#[cfg(test)]
mod tests;

use serde_json::Value;

pub use recursive::clean_json_schema_recursive;

/// Clean a tool parameter schema in place.
pub fn clean_json_schema(value: &mut Value) {
    // Phase 0: collect $defs/definitions from every nesting level, then
    // expand $ref nodes. Unresolvable refs degrade to string with a hint.
    let mut all_defs = serde_json::Map::new();
    collect_all_defs(value, &mut all_defs);

    if let Value::Object(map) = value {
        map.remove("$defs");
        map.remove("definitions");
    }

    if let Value::Object(map) = value {
        flatten_refs(map, &all_defs);
    }

    clean_json_schema_recursive(value);

    ensure_object_placeholder(value);
}

/// Empty object schemas are rejected upstream; give them a single required
/// `reason` field so the declaration stays valid.
fn ensure_object_placeholder(value: &mut Value) {
    if let Value::Object(map) = value {
        let is_empty_object = map.get("type").and_then(|t| t.as_str()) == Some("OBJECT")
            && map
                .get("properties")
                .and_then(|p| p.as_object())
                .map(|p| p.is_empty())
                .unwrap_or(true);
        if is_empty_object {
            map.insert(
                "properties".to_string(),
                serde_json::json!({
                    "reason": {
                        "type": "STRING",
                        "description": "Why this tool is being invoked"
                    }
                }),
            );
            map.insert("required".to_string(), serde_json::json!(["reason"]));
        }
    }
}

/// Collect `$defs` and `definitions` maps from every nesting level. First
/// definition of a name wins.
fn collect_all_defs(value: &Value, defs: &mut serde_json::Map<String, Value>) {
    match value {
        Value::Object(map) => {
            for key in ["$defs", "definitions"] {
                if let Some(Value::Object(d)) = map.get(key) {
                    for (k, v) in d {
                        defs.entry(k.clone()).or_insert_with(|| v.clone());
                    }
                }
            }
            for (key, v) in map {
                if key != "$defs" && key != "definitions" {
                    collect_all_defs(v, defs);
                }
            }
        }
        Value::Array(arr) => {
            for item in arr {
                collect_all_defs(item, defs);
            }
        }
        _ => {}
    }
}

/// Replace `$ref` nodes with their definitions, recursively. A resolved
/// definition gets a `See: <name>` description hint so cross-references stay
/// legible after flattening.
fn flatten_refs(map: &mut serde_json::Map<String, Value>, defs: &serde_json::Map<String, Value>) {
    if let Some(Value::String(ref_path)) = map.remove("$ref") {
        let ref_name = ref_path.split('/').next_back().unwrap_or(&ref_path).to_string();

        if let Some(Value::Object(def_map)) = defs.get(&ref_name) {
            for (k, v) in def_map {
                map.entry(k.clone()).or_insert_with(|| v.clone());
            }
            append_description_hint(map, &format!("See: {}", ref_name));
            // The merged definition may itself contain refs. Tool schemas
            // are DAGs in practice, so this terminates.
            flatten_refs(map, defs);
        } else {
            map.insert("type".to_string(), serde_json::json!("string"));
            append_description_hint(map, &format!("(Unresolved $ref: {})", ref_path));
        }
    }

    for (_, v) in map.iter_mut() {
        match v {
            Value::Object(child) => flatten_refs(child, defs),
            Value::Array(arr) => {
                for item in arr {
                    if let Value::Object(item_map) = item {
                        flatten_refs(item_map, defs);
                    }
                }
            }
            _ => {}
        }
    }
}

pub(crate) fn append_description_hint(map: &mut serde_json::Map<String, Value>, hint: &str) {
    let desc_val = map
        .entry("description".to_string())
        .or_insert_with(|| Value::String(String::new()));
    if let Value::String(s) = desc_val {
        if !s.contains(hint) {
            if !s.is_empty() {
                s.push(' ');
            }
            s.push_str(hint);
        }
    }
}
