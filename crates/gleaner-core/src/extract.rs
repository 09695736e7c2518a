//! Phase-specific extractors.
//!
//! An extractor turns the content of the resources produced for one document
//! into the fields its phase declares. Every declared field is present in the
//! output, `null` when no resource supplied it.

use serde_json::{Map, Value};

use crate::models::PipelinePhase;

/// Builds the merge values for one document.
///
/// `contents` holds the retrieved content of every successful result for the
/// document, in result order; the first non-null value of a field wins.
pub fn extract(phase: PipelinePhase, fields: &[String], contents: &[Value]) -> Map<String, Value> {
    fields
        .iter()
        .map(|field| {
            let raw = contents
                .iter()
                .filter_map(|content| lookup(content, field))
                .find(|value| !value.is_null());
            let value = match (phase, field.as_str()) {
                (PipelinePhase::Extraction, "text") => joined_text(contents),
                (PipelinePhase::Video, "duration") => raw.and_then(duration_seconds),
                _ => raw.cloned(),
            };
            (field.clone(), value.unwrap_or(Value::Null))
        })
        .collect()
}

/// Finds a field at the top level or one level down in `previews`/`video`.
fn lookup<'a>(content: &'a Value, field: &str) -> Option<&'a Value> {
    content.get(field).or_else(|| {
        ["previews", "video"]
            .iter()
            .find_map(|nested| content.get(nested).and_then(|inner| inner.get(field)))
    })
}

/// Text of every part, whitespace collapsed, parts separated by blank lines.
fn joined_text(contents: &[Value]) -> Option<Value> {
    let parts: Vec<String> = contents
        .iter()
        .filter_map(|content| content.get("text").and_then(Value::as_str))
        .map(|text| text.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|text| !text.is_empty())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(Value::String(parts.join("\n\n")))
    }
}

/// Accepts seconds, `HH:MM:SS` or an ISO 8601 duration such as `PT1H2M3S`.
fn duration_seconds(value: &Value) -> Option<Value> {
    if let Some(seconds) = value.as_u64() {
        return Some(Value::from(seconds));
    }
    if let Some(seconds) = value.as_f64() {
        return Some(Value::from(seconds.round() as u64));
    }
    let text = value.as_str()?.trim();

    if let Some(iso) = text.strip_prefix("PT") {
        let mut total = 0u64;
        let mut number = String::new();
        for c in iso.chars() {
            if c.is_ascii_digit() || c == '.' {
                number.push(c);
                continue;
            }
            let amount = number.parse::<f64>().ok()?;
            number.clear();
            total += match c {
                'H' => amount * 3600.0,
                'M' => amount * 60.0,
                'S' => amount,
                _ => return None,
            }
            .round() as u64;
        }
        return number.is_empty().then_some(Value::from(total));
    }

    let mut total = 0u64;
    for part in text.split(':') {
        total = total * 60 + part.parse::<u64>().ok()?;
    }
    Some(Value::from(total))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_declared_fields_are_always_present() {
        let values = extract(
            PipelinePhase::Preview,
            &fields(&["full_size", "preview", "preview_small"]),
            &[json!({"preview": "p.png"})],
        );
        assert_eq!(values.len(), 3);
        assert_eq!(values["preview"], json!("p.png"));
        assert_eq!(values["full_size"], Value::Null);
    }

    #[test]
    fn test_no_content_gives_nulls() {
        let values = extract(PipelinePhase::Extraction, &fields(&["text"]), &[]);
        assert_eq!(values["text"], Value::Null);
    }

    #[test]
    fn test_text_parts_are_joined() {
        let values = extract(
            PipelinePhase::Extraction,
            &fields(&["text"]),
            &[json!({"text": " first\n page "}), json!({"text": "second"})],
        );
        assert_eq!(values["text"], json!("first page\n\nsecond"));
    }

    #[test]
    fn test_nested_preview_lookup() {
        let values = extract(
            PipelinePhase::Preview,
            &fields(&["preview_small"]),
            &[json!({"previews": {"preview_small": "s.png"}})],
        );
        assert_eq!(values["preview_small"], json!("s.png"));
    }

    #[test]
    fn test_video_duration_formats() {
        let phase = PipelinePhase::Video;
        let duration = |content: Value| extract(phase, &fields(&["duration"]), &[content]);
        assert_eq!(duration(json!({"duration": "PT1H2M3S"}))["duration"], json!(3723));
        assert_eq!(duration(json!({"duration": "01:30"}))["duration"], json!(90));
        assert_eq!(duration(json!({"duration": 42}))["duration"], json!(42));
        assert_eq!(duration(json!({"duration": "soon"}))["duration"], Value::Null);
    }

    #[test]
    fn test_first_non_null_wins() {
        let values = extract(
            PipelinePhase::Video,
            &fields(&["embed_url"]),
            &[json!({"embed_url": null}), json!({"embed_url": "b"}), json!({"embed_url": "c"})],
        );
        assert_eq!(values["embed_url"], json!("b"));
    }
}
