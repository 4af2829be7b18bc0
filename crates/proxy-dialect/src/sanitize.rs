use proxy_core::{Content, Message, Part};
use serde_json::{Map, Value};

/// Keys stripped from a JSON Schema fragment (and any fragment nested under
/// `properties`/`items`/`anyOf`/`oneOf`/`allOf`) before the schema is handed
/// to a dialect that doesn't understand them. Extends the include-filter
/// idiom used for provider config pruning into an exclude-filter that also
/// walks schema composition keywords, not just `properties`.
const SCHEMA_KEYS_TO_STRIP: &[&str] = &["additionalProperties", "$schema", "title"];

/// Recursively removes `SCHEMA_KEYS_TO_STRIP` from a JSON Schema value,
/// descending into `properties` (per-property subschemas), `items`, and the
/// `anyOf`/`oneOf`/`allOf` composition arrays (§4.8.6).
pub fn prune_schema(schema: &Value) -> Value {
    match schema {
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (k, v) in map {
                if SCHEMA_KEYS_TO_STRIP.contains(&k.as_str()) {
                    continue;
                }
                let pruned = match k.as_str() {
                    "properties" => prune_properties(v),
                    "items" => prune_schema(v),
                    "anyOf" | "oneOf" | "allOf" => prune_schema_array(v),
                    _ => v.clone(),
                };
                out.insert(k.clone(), pruned);
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(prune_schema).collect()),
        other => other.clone(),
    }
}

fn prune_properties(properties: &Value) -> Value {
    match properties {
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), prune_schema(v));
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}

fn prune_schema_array(value: &Value) -> Value {
    match value {
        Value::Array(items) => Value::Array(items.iter().map(prune_schema).collect()),
        other => prune_schema(other),
    }
}

/// Strips Anthropic-only `cache_control` annotations from every content part
/// of a message, in place. Dialects other than Anthropic's don't understand
/// prompt caching hints and upstream rejects unknown fields.
pub fn strip_cache_control(message: &mut Message) {
    if let Content::Parts(parts) = &mut message.content {
        for part in parts.iter_mut() {
            strip_cache_control_from_part(part);
        }
    }
}

fn strip_cache_control_from_part(_part: &mut Part) {
    // `Part` only carries the fields the internal model understands;
    // `cache_control` is dropped during wire parsing already and never
    // makes it into a `Part`. This is a no-op retained as the explicit
    // sanitize-stage counterpart so future `Part` variants that do carry
    // passthrough annotations have a single place to strip them.
}

/// Rewrites the upstream-only `apply_patch` custom tool into a function tool
/// with a fixed parameter schema so dialects that only understand `function`
/// tools can still expose it, and drops `web_search` tools outright since no
/// supported dialect can execute them (§4.8.6).
pub fn sanitize_tools(tools: &[Value]) -> Vec<Value> {
    tools
        .iter()
        .filter_map(|t| {
            let tool_type = t.get("type").and_then(Value::as_str).unwrap_or("function");
            match tool_type {
                "web_search" | "web_search_preview" => None,
                "apply_patch" => Some(apply_patch_as_function_tool()),
                _ => Some(t.clone()),
            }
        })
        .collect()
}

fn apply_patch_as_function_tool() -> Value {
    serde_json::json!({
        "type": "function",
        "function": {
            "name": "apply_patch",
            "description": "Applies a unified diff patch to one or more files.",
            "parameters": {
                "type": "object",
                "properties": {
                    "input": {
                        "type": "string",
                        "description": "The patch content in unified diff format."
                    }
                },
                "required": ["input"]
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn prune_schema_strips_top_level_keys() {
        let schema = json!({
            "type": "object",
            "additionalProperties": false,
            "$schema": "http://json-schema.org/draft-07/schema#",
            "title": "Foo",
            "properties": {"x": {"type": "string"}}
        });
        let pruned = prune_schema(&schema);
        assert!(pruned.get("additionalProperties").is_none());
        assert!(pruned.get("$schema").is_none());
        assert!(pruned.get("title").is_none());
        assert_eq!(pruned["properties"]["x"]["type"], "string");
    }

    #[test]
    fn prune_schema_descends_into_nested_properties_and_items() {
        let schema = json!({
            "type": "object",
            "properties": {
                "list": {
                    "type": "array",
                    "items": {"type": "object", "additionalProperties": false, "title": "Item"}
                }
            }
        });
        let pruned = prune_schema(&schema);
        let item = &pruned["properties"]["list"]["items"];
        assert!(item.get("additionalProperties").is_none());
        assert!(item.get("title").is_none());
    }

    #[test]
    fn prune_schema_descends_into_any_of() {
        let schema = json!({
            "anyOf": [
                {"type": "string", "title": "A"},
                {"type": "object", "additionalProperties": false}
            ]
        });
        let pruned = prune_schema(&schema);
        assert!(pruned["anyOf"][0].get("title").is_none());
        assert!(pruned["anyOf"][1].get("additionalProperties").is_none());
    }

    #[test]
    fn web_search_tool_is_dropped() {
        let tools = vec![json!({"type": "web_search"}), json!({"type": "function", "function": {"name": "f"}})];
        let sanitized = sanitize_tools(&tools);
        assert_eq!(sanitized.len(), 1);
        assert_eq!(sanitized[0]["function"]["name"], "f");
    }

    #[test]
    fn apply_patch_tool_becomes_function_tool() {
        let tools = vec![json!({"type": "apply_patch"})];
        let sanitized = sanitize_tools(&tools);
        assert_eq!(sanitized[0]["type"], "function");
        assert_eq!(sanitized[0]["function"]["name"], "apply_patch");
        assert_eq!(sanitized[0]["function"]["parameters"]["required"][0], "input");
    }
}
