use super::SchemaRegistry;
use serde_json::Value;

/// Renders the registry as one `name = <compact json>` line per schema.
/// References stay as `$ref` so shared shapes are printed once.
pub fn render_schema_reference(registry: &SchemaRegistry) -> String {
    registry
        .iter()
        .map(|(name, schema)| format!("{name} = {}", compact(schema)))
        .collect::<Vec<_>>()
        .join("\n")
}

/// One line per allowed output transition: `["from","to"] = <compact json>`.
pub fn render_transition_schemas<'a>(
    transitions: impl IntoIterator<Item = (&'a str, &'a str, &'a Value)>,
) -> String {
    transitions
        .into_iter()
        .map(|(from, to, schema)| format!("[\"{from}\",\"{to}\"] = {}", compact(schema)))
        .collect::<Vec<_>>()
        .join("\n")
}

fn compact(schema: &Value) -> String {
    serde_json::to_string(schema).unwrap_or_else(|_| "{}".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn registry_renders_sorted_compact_lines() {
        let mut registry = SchemaRegistry::new();
        registry.insert("tool-call", json!({"type": "object", "required": ["name"]}));
        registry.insert("answer", json!({"type": "string"}));
        assert_eq!(
            render_schema_reference(&registry),
            "answer = {\"type\":\"string\"}\ntool-call = {\"required\":[\"name\"],\"type\":\"object\"}"
        );
    }

    #[test]
    fn transitions_render_with_pair_prefix() {
        let schema = json!({"$ref": "answer"});
        let rendered = render_transition_schemas([("llm", "end", &schema)]);
        assert_eq!(rendered, "[\"llm\",\"end\"] = {\"$ref\":\"answer\"}");
    }
}
