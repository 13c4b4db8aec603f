//! Recursive schema cleaning and type normalization.

use serde_json::Value;
use std::collections::HashSet;

use super::append_description_hint;
use super::merge::merge_all_of;
use super::union::extract_best_schema_from_union;

/// Keywords the upstream schema dialect understands. Everything else is
/// folded into description hints or removed.
const ALLOWED_FIELDS: [&str; 7] =
    ["type", "description", "properties", "required", "items", "enum", "title"];

/// Validation keywords converted to description hints before removal.
const CONSTRAINT_HINTS: [(&str, &str); 13] = [
    ("minLength", "minLen"),
    ("maxLength", "maxLen"),
    ("pattern", "pattern"),
    ("minimum", "min"),
    ("maximum", "max"),
    ("multipleOf", "multipleOf"),
    ("exclusiveMinimum", "exclMin"),
    ("exclusiveMaximum", "exclMax"),
    ("minItems", "minItems"),
    ("maxItems", "maxItems"),
    ("default", "default"),
    ("format", "format"),
    ("additionalProperties", "additionalProperties"),
];

/// Recursively clean a schema node.
///
/// Returns `true` if the node is effectively nullable (its type set
/// contained null).
pub fn clean_json_schema_recursive(value: &mut Value) -> bool {
    let mut is_effectively_nullable = false;

    match value {
        Value::Object(map) => {
            merge_all_of(map);

            if let Some(Value::Object(props)) = map.get_mut("properties") {
                let mut nullable_keys = HashSet::new();
                for (k, v) in props {
                    if clean_json_schema_recursive(v) {
                        nullable_keys.insert(k.clone());
                    }
                }

                // Nullable properties cannot stay required.
                if !nullable_keys.is_empty() {
                    if let Some(Value::Array(req_arr)) = map.get_mut("required") {
                        req_arr.retain(|r| {
                            r.as_str().map(|s| !nullable_keys.contains(s)).unwrap_or(true)
                        });
                        if req_arr.is_empty() {
                            map.remove("required");
                        }
                    }
                }
            } else if let Some(items) = map.get_mut("items") {
                clean_json_schema_recursive(items);
            } else {
                for v in map.values_mut() {
                    clean_json_schema_recursive(v);
                }
            }

            for union_key in ["anyOf", "oneOf"] {
                if let Some(Value::Array(branches)) = map.get_mut(union_key) {
                    for branch in branches.iter_mut() {
                        clean_json_schema_recursive(branch);
                    }
                }
            }

            let mut union_to_merge = None;
            if map.get("type").is_none()
                || map.get("type").and_then(|t| t.as_str()).map(|t| t.eq_ignore_ascii_case("object"))
                    == Some(true)
            {
                if let Some(Value::Array(any_of)) = map.get("anyOf") {
                    union_to_merge = Some(any_of.clone());
                } else if let Some(Value::Array(one_of)) = map.get("oneOf") {
                    union_to_merge = Some(one_of.clone());
                }
            }

            if let Some(union_array) = union_to_merge {
                if let Some(Value::Object(branch_obj)) = extract_best_schema_from_union(&union_array)
                {
                    for (k, v) in branch_obj {
                        if k == "properties" {
                            if let Some(target_props) = map
                                .entry("properties".to_string())
                                .or_insert_with(|| Value::Object(serde_json::Map::new()))
                                .as_object_mut()
                            {
                                if let Some(source_props) = v.as_object() {
                                    for (pk, pv) in source_props {
                                        target_props.entry(pk.clone()).or_insert_with(|| pv.clone());
                                    }
                                }
                            }
                        } else if k == "required" {
                            if let Some(target_req) = map
                                .entry("required".to_string())
                                .or_insert_with(|| Value::Array(Vec::new()))
                                .as_array_mut()
                            {
                                if let Some(source_req) = v.as_array() {
                                    for rv in source_req {
                                        if !target_req.contains(rv) {
                                            target_req.push(rv.clone());
                                        }
                                    }
                                }
                            }
                        } else if !map.contains_key(&k) {
                            map.insert(k, v);
                        }
                    }
                }
            }

            let looks_like_schema = map.contains_key("type")
                || map.contains_key("properties")
                || map.contains_key("items")
                || map.contains_key("enum")
                || map.contains_key("anyOf")
                || map.contains_key("oneOf")
                || map.contains_key("allOf");

            if looks_like_schema {
                let mut hints = Vec::new();
                for (field, label) in CONSTRAINT_HINTS {
                    if let Some(val) = map.get(field) {
                        if !val.is_null() {
                            let val_str = match val.as_str() {
                                Some(s) => s.to_string(),
                                None => val.to_string(),
                            };
                            hints.push(format!("{}: {}", label, val_str));
                        }
                    }
                }
                if !hints.is_empty() {
                    let suffix = format!("[Constraint: {}]", hints.join(", "));
                    append_description_hint(map, &suffix);
                }

                let allowed: HashSet<&str> = ALLOWED_FIELDS.into_iter().collect();
                let keys_to_remove: Vec<String> =
                    map.keys().filter(|k| !allowed.contains(k.as_str())).cloned().collect();
                for k in keys_to_remove {
                    map.remove(&k);
                }

                // Keep `required` consistent with the surviving properties.
                let valid_prop_keys: Option<HashSet<String>> = map
                    .get("properties")
                    .and_then(|p| p.as_object())
                    .map(|obj| obj.keys().cloned().collect());

                if let Some(Value::Array(req_arr)) = map.get_mut("required") {
                    if let Some(keys) = &valid_prop_keys {
                        req_arr.retain(|k| k.as_str().map(|s| keys.contains(s)).unwrap_or(false));
                    } else {
                        req_arr.clear();
                    }
                }

                if let Some(type_val) = map.get_mut("type") {
                    let mut selected_type = None;
                    match type_val {
                        Value::String(s) => {
                            let lower = s.to_lowercase();
                            if lower == "null" {
                                is_effectively_nullable = true;
                            } else {
                                selected_type = Some(lower);
                            }
                        }
                        Value::Array(arr) => {
                            for item in arr.iter() {
                                if let Value::String(s) = item {
                                    let lower = s.to_lowercase();
                                    if lower == "null" {
                                        is_effectively_nullable = true;
                                    } else if selected_type.is_none() {
                                        selected_type = Some(lower);
                                    }
                                }
                            }
                        }
                        _ => {}
                    }
                    *type_val = Value::String(to_google_type(
                        selected_type.as_deref().unwrap_or("string"),
                    ));
                }

                if is_effectively_nullable {
                    append_description_hint(map, "(nullable)");
                }

                if map.get("type").and_then(|t| t.as_str()) == Some("ARRAY")
                    && !map.contains_key("items")
                {
                    map.insert("items".to_string(), serde_json::json!({ "type": "STRING" }));
                }

                if map.get("type").and_then(|t| t.as_str()) == Some("OBJECT")
                    && !map.contains_key("properties")
                {
                    map.insert("properties".to_string(), serde_json::json!({}));
                }

                if let Some(Value::Array(arr)) = map.get_mut("enum") {
                    for item in arr {
                        if !item.is_string() {
                            *item = Value::String(if item.is_null() {
                                "null".to_string()
                            } else {
                                item.to_string()
                            });
                        }
                    }
                }
            }
        }
        Value::Array(arr) => {
            for item in arr.iter_mut() {
                clean_json_schema_recursive(item);
            }
        }
        _ => {}
    }

    is_effectively_nullable
}

/// Map a JSON Schema type to the upstream SCREAMING-case enum.
fn to_google_type(type_name: &str) -> String {
    match type_name {
        "string" => "STRING",
        "number" => "NUMBER",
        "integer" => "INTEGER",
        "boolean" => "BOOLEAN",
        "array" => "ARRAY",
        "object" => "OBJECT",
        other => {
            // Already normalized or unknown; unknown degrades to STRING.
            return if ["STRING", "NUMBER", "INTEGER", "BOOLEAN", "ARRAY", "OBJECT"]
                .contains(&other.to_ascii_uppercase().as_str())
            {
                other.to_ascii_uppercase()
            } else {
                "STRING".to_string()
            };
        }
    }
    .to_string()
}
