use super::clean_json_schema;
use serde_json::json;

#[test]
fn flattens_refs_from_defs() {
    let mut schema = json!({
        "type": "object",
        "properties": {
            "loc": { "$ref": "#/$defs/Location" }
        },
        "$defs": {
            "Location": {
                "type": "object",
                "properties": { "city": { "type": "string" } }
            }
        }
    });
    clean_json_schema(&mut schema);

    assert!(schema.get("$defs").is_none());
    let loc = &schema["properties"]["loc"];
    assert_eq!(loc["type"], "OBJECT");
    assert_eq!(loc["properties"]["city"]["type"], "STRING");
    assert!(loc["description"].as_str().unwrap().contains("See: Location"));
}

#[test]
fn unresolved_ref_degrades_to_string_with_hint() {
    let mut schema = json!({
        "type": "object",
        "properties": {
            "x": { "$ref": "#/$defs/Missing" }
        }
    });
    clean_json_schema(&mut schema);
    assert_eq!(schema["properties"]["x"]["type"], "STRING");
    assert!(schema["properties"]["x"]["description"]
        .as_str()
        .unwrap()
        .contains("Unresolved $ref"));
}

#[test]
fn constraints_become_description_hints() {
    let mut schema = json!({
        "type": "string",
        "minLength": 3,
        "format": "email",
        "description": "user email"
    });
    clean_json_schema(&mut schema);

    assert!(schema.get("minLength").is_none());
    assert!(schema.get("format").is_none());
    let desc = schema["description"].as_str().unwrap();
    assert!(desc.contains("user email"));
    assert!(desc.contains("minLen: 3"));
    assert!(desc.contains("format: email"));
}

#[test]
fn all_of_is_merged() {
    let mut schema = json!({
        "allOf": [
            { "type": "object", "properties": { "a": { "type": "string" } }, "required": ["a"] },
            { "properties": { "b": { "type": "integer" } }, "required": ["b"] }
        ]
    });
    clean_json_schema(&mut schema);

    assert!(schema.get("allOf").is_none());
    assert_eq!(schema["properties"]["a"]["type"], "STRING");
    assert_eq!(schema["properties"]["b"]["type"], "INTEGER");
    let required = schema["required"].as_array().unwrap();
    assert!(required.contains(&json!("a")) && required.contains(&json!("b")));
}

#[test]
fn any_of_collapses_to_richest_branch() {
    let mut schema = json!({
        "anyOf": [
            { "type": "null" },
            { "type": "object", "properties": { "name": { "type": "string" } } }
        ]
    });
    clean_json_schema(&mut schema);

    assert!(schema.get("anyOf").is_none());
    assert_eq!(schema["properties"]["name"]["type"], "STRING");
}

#[test]
fn nullable_type_array_collapses_with_hint() {
    let mut schema = json!({
        "type": "object",
        "properties": {
            "note": { "type": ["string", "null"] }
        },
        "required": ["note"]
    });
    clean_json_schema(&mut schema);

    assert_eq!(schema["properties"]["note"]["type"], "STRING");
    assert!(schema["properties"]["note"]["description"]
        .as_str()
        .unwrap()
        .contains("nullable"));
    // Nullable fields are no longer required.
    assert!(schema.get("required").is_none());
}

#[test]
fn unsupported_keywords_are_removed() {
    let mut schema = json!({
        "$schema": "http://json-schema.org/draft-07/schema#",
        "type": "object",
        "additionalProperties": false,
        "properties": { "a": { "type": "string", "uniqueItems": true } }
    });
    clean_json_schema(&mut schema);

    assert!(schema.get("$schema").is_none());
    assert!(schema.get("additionalProperties").is_none());
    assert!(schema["properties"]["a"].get("uniqueItems").is_none());
}

#[test]
fn empty_object_gets_placeholder() {
    let mut schema = json!({ "type": "object" });
    clean_json_schema(&mut schema);

    assert_eq!(schema["type"], "OBJECT");
    assert_eq!(schema["properties"]["reason"]["type"], "STRING");
    assert_eq!(schema["required"], json!(["reason"]));
}

#[test]
fn arrays_without_items_default_to_string_items() {
    let mut schema = json!({
        "type": "object",
        "properties": { "tags": { "type": "array" } }
    });
    clean_json_schema(&mut schema);
    assert_eq!(schema["properties"]["tags"]["items"]["type"], "STRING");
}

#[test]
fn cleaning_is_idempotent() {
    let mut once = json!({
        "type": "object",
        "additionalProperties": false,
        "properties": {
            "q": { "type": ["string", "null"], "minLength": 1 },
            "opts": { "anyOf": [{ "type": "null" }, { "type": "object", "properties": { "k": { "type": "integer" } } }] },
            "tags": { "type": "array" }
        },
        "required": ["q"]
    });
    clean_json_schema(&mut once);
    let mut twice = once.clone();
    clean_json_schema(&mut twice);
    assert_eq!(once, twice);
}
