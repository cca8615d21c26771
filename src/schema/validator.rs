use super::{SchemaRegistry, SchemaValidator, SchemaViolation};
use serde_json::{Map, Value};

const MAX_REF_DEPTH: usize = 64;

/// Validator for the subset of JSON Schema used by FSM definitions:
/// `type`, `const`, `enum`, `required`, `properties`, `additionalProperties`,
/// `items`, `prefixItems`, `minItems`, `maxItems`, `minLength`, `maxLength`,
/// `minimum`, `maximum`, `allOf`, `anyOf`, `oneOf`, `not` and `$ref`.
#[derive(Debug, Clone, Copy, Default)]
pub struct BasicSchemaValidator;

impl SchemaValidator for BasicSchemaValidator {
    fn validate(
        &self,
        registry: &SchemaRegistry,
        schema: &Value,
        document: &Value,
    ) -> Result<(), SchemaViolation> {
        let mut errors = Vec::new();
        check(registry, schema, document, "$", 0, &mut errors);
        if errors.is_empty() {
            Ok(())
        } else {
            Err(SchemaViolation { errors })
        }
    }
}

fn check(
    registry: &SchemaRegistry,
    schema: &Value,
    doc: &Value,
    path: &str,
    depth: usize,
    errors: &mut Vec<String>,
) {
    if depth > MAX_REF_DEPTH {
        errors.push(format!("{path}: schema nesting exceeds {MAX_REF_DEPTH} levels"));
        return;
    }
    let schema = match schema {
        Value::Bool(true) => return,
        Value::Bool(false) => {
            errors.push(format!("{path}: no value is allowed here"));
            return;
        }
        Value::Object(map) => map,
        other => {
            errors.push(format!("{path}: schema must be an object or boolean, got {other}"));
            return;
        }
    };

    if let Some(reference) = schema.get("$ref").and_then(Value::as_str) {
        match registry.resolve(reference) {
            Some(target) => check(registry, target, doc, path, depth + 1, errors),
            None => errors.push(format!("{path}: unknown schema reference `{reference}`")),
        }
    }

    if let Some(expected) = schema.get("type") {
        check_type(expected, doc, path, errors);
    }
    if let Some(expected) = schema.get("const") {
        if expected != doc {
            errors.push(format!("{path}: expected constant {expected}, got {doc}"));
        }
    }
    if let Some(options) = schema.get("enum").and_then(Value::as_array) {
        if !options.contains(doc) {
            errors.push(format!("{path}: {doc} is not one of {}", Value::Array(options.clone())));
        }
    }

    match doc {
        Value::Object(fields) => check_object(registry, schema, fields, path, depth, errors),
        Value::Array(items) => check_array(registry, schema, items, path, depth, errors),
        Value::String(text) => {
            let len = text.chars().count() as u64;
            if let Some(min) = schema.get("minLength").and_then(Value::as_u64) {
                if len < min {
                    errors.push(format!("{path}: string shorter than {min}"));
                }
            }
            if let Some(max) = schema.get("maxLength").and_then(Value::as_u64) {
                if len > max {
                    errors.push(format!("{path}: string longer than {max}"));
                }
            }
        }
        Value::Number(number) => {
            let value = number.as_f64().unwrap_or(f64::NAN);
            if let Some(min) = schema.get("minimum").and_then(Value::as_f64) {
                if value < min {
                    errors.push(format!("{path}: {value} is below minimum {min}"));
                }
            }
            if let Some(max) = schema.get("maximum").and_then(Value::as_f64) {
                if value > max {
                    errors.push(format!("{path}: {value} is above maximum {max}"));
                }
            }
        }
        _ => {}
    }

    if let Some(all) = schema.get("allOf").and_then(Value::as_array) {
        for sub in all {
            check(registry, sub, doc, path, depth + 1, errors);
        }
    }
    if let Some(any) = schema.get("anyOf").and_then(Value::as_array) {
        let mut branch_errors = Vec::new();
        let matched = any.iter().any(|sub| {
            let mut local = Vec::new();
            check(registry, sub, doc, path, depth + 1, &mut local);
            let ok = local.is_empty();
            branch_errors.extend(local);
            ok
        });
        if !matched {
            errors.push(format!(
                "{path}: matches none of anyOf ({})",
                branch_errors.join(" | ")
            ));
        }
    }
    if let Some(one) = schema.get("oneOf").and_then(Value::as_array) {
        let matches = one
            .iter()
            .filter(|sub| {
                let mut local = Vec::new();
                check(registry, sub, doc, path, depth + 1, &mut local);
                local.is_empty()
            })
            .count();
        if matches != 1 {
            errors.push(format!("{path}: matches {matches} of oneOf, expected exactly 1"));
        }
    }
    if let Some(not) = schema.get("not") {
        let mut local = Vec::new();
        check(registry, not, doc, path, depth + 1, &mut local);
        if local.is_empty() {
            errors.push(format!("{path}: must not match schema {not}"));
        }
    }
}

fn check_type(expected: &Value, doc: &Value, path: &str, errors: &mut Vec<String>) {
    let names: Vec<&str> = match expected {
        Value::String(name) => vec![name.as_str()],
        Value::Array(names) => names.iter().filter_map(Value::as_str).collect(),
        _ => return,
    };
    if names.iter().any(|name| type_matches(name, doc)) {
        return;
    }
    errors.push(format!(
        "{path}: expected type {}, got {}",
        names.join("|"),
        type_name(doc)
    ));
}

fn type_matches(name: &str, doc: &Value) -> bool {
    match name {
        "object" => doc.is_object(),
        "array" => doc.is_array(),
        "string" => doc.is_string(),
        "boolean" => doc.is_boolean(),
        "null" => doc.is_null(),
        "number" => doc.is_number(),
        "integer" => {
            doc.is_i64() || doc.is_u64() || doc.as_f64().is_some_and(|v| v.fract() == 0.0)
        }
        _ => false,
    }
}

fn type_name(doc: &Value) -> &'static str {
    match doc {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn check_object(
    registry: &SchemaRegistry,
    schema: &Map<String, Value>,
    fields: &Map<String, Value>,
    path: &str,
    depth: usize,
    errors: &mut Vec<String>,
) {
    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for key in required.iter().filter_map(Value::as_str) {
            if !fields.contains_key(key) {
                errors.push(format!("{path}: missing required field `{key}`"));
            }
        }
    }
    let properties = schema.get("properties").and_then(Value::as_object);
    for (key, value) in fields {
        let child = format!("{path}.{key}");
        match properties.and_then(|props| props.get(key)) {
            Some(sub) => check(registry, sub, value, &child, depth + 1, errors),
            None => match schema.get("additionalProperties") {
                Some(Value::Bool(false)) => {
                    errors.push(format!("{path}: unexpected field `{key}`"));
                }
                Some(sub @ Value::Object(_)) => {
                    check(registry, sub, value, &child, depth + 1, errors)
                }
                _ => {}
            },
        }
    }
}

fn check_array(
    registry: &SchemaRegistry,
    schema: &Map<String, Value>,
    items: &[Value],
    path: &str,
    depth: usize,
    errors: &mut Vec<String>,
) {
    let len = items.len() as u64;
    if let Some(min) = schema.get("minItems").and_then(Value::as_u64) {
        if len < min {
            errors.push(format!("{path}: expected at least {min} items, got {len}"));
        }
    }
    if let Some(max) = schema.get("maxItems").and_then(Value::as_u64) {
        if len > max {
            errors.push(format!("{path}: expected at most {max} items, got {len}"));
        }
    }
    let prefix = schema
        .get("prefixItems")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[]);
    for (index, item) in items.iter().enumerate() {
        let child = format!("{path}[{index}]");
        if let Some(sub) = prefix.get(index) {
            check(registry, sub, item, &child, depth + 1, errors);
        } else if let Some(sub) = schema.get("items") {
            check(registry, sub, item, &child, depth + 1, errors);
        }
    }
}
