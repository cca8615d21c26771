use super::ModelError;
use serde_json::Value;

/// Pulls the JSON document out of a model reply. Accepts a bare document,
/// a fenced ```json block, or a document surrounded by prose.
pub fn extract_json_document(raw: &str) -> Result<Value, ModelError> {
    let trimmed = raw.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Ok(value);
    }

    if let Some(fenced) = fenced_block(trimmed) {
        if let Ok(value) = serde_json::from_str::<Value>(fenced) {
            return Ok(value);
        }
    }

    let start = trimmed.find('{');
    let end = trimmed.rfind('}');
    match (start, end) {
        (Some(start), Some(end)) if end > start => {
            serde_json::from_str::<Value>(&trimmed[start..=end]).map_err(|err| {
                ModelError::Malformed {
                    raw: raw.to_string(),
                    reason: format!("invalid json: {err}"),
                }
            })
        }
        _ => Err(ModelError::Malformed {
            raw: raw.to_string(),
            reason: "no json object found in model output".to_string(),
        }),
    }
}

fn fenced_block(text: &str) -> Option<&str> {
    let open = text.find("```")?;
    let after_open = &text[open + 3..];
    let body_start = after_open.find('\n')? + 1;
    let body = &after_open[body_start..];
    let close = body.find("```")?;
    Some(body[..close].trim())
}
