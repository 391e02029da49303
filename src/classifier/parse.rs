//! Ordered fallback response parsing: a raw model response almost never
//! arrives as bare JSON, so each stage tries a looser extraction than the
//! last before giving up. Order is fixed: raw parse, then substring
//! extraction, then fenced-block stripping, because a response that
//! happens to parse raw should never be re-interpreted by a looser stage.

use super::ClassificationResponse;
use crate::error::{Error, Result};
use crate::profile::types::{Profile, ResponseSchema};

/// Run the fallback chain and schema-validate the result against `profile`.
pub fn parse_response(raw: &str, profile: &Profile) -> Result<ClassificationResponse> {
    let value = extract_json_value(raw).ok_or_else(|| {
        Error::schema_error(
            profile.id.clone(),
            "response did not contain a recognizable JSON object after raw parse, substring extraction, and fenced-block stripping",
        )
    })?;

    validate_schema(&value, &profile.response_schema, &profile.id)?;

    serde_json::from_value(value)
        .map_err(|e| Error::schema_error(profile.id.clone(), format!("response did not deserialize: {e}")))
}

fn extract_json_value(raw: &str) -> Option<serde_json::Value> {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(raw.trim()) {
        return Some(value);
    }

    if let Some(substring) = extract_braced_substring(raw) {
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(&substring) {
            return Some(value);
        }
    }

    if let Some(fenced) = strip_fenced_block(raw) {
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(fenced.trim()) {
            return Some(value);
        }
    }

    None
}

fn extract_braced_substring(raw: &str) -> Option<String> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    if end <= start {
        return None;
    }
    Some(raw[start..=end].to_string())
}

fn strip_fenced_block(raw: &str) -> Option<&str> {
    let fence_start = raw.find("```")?;
    let after_fence = &raw[fence_start + 3..];
    let content_start = match after_fence.find('\n') {
        Some(newline_idx) => &after_fence[newline_idx + 1..],
        None => after_fence,
    };
    let fence_end = content_start.find("```")?;
    Some(&content_start[..fence_end])
}

fn validate_schema(value: &serde_json::Value, schema: &ResponseSchema, profile_id: &str) -> Result<()> {
    let object = value
        .as_object()
        .ok_or_else(|| Error::schema_error(profile_id, "response is not a JSON object"))?;

    for field in &schema.required_fields {
        if !object.contains_key(field) {
            return Err(Error::schema_error(profile_id, format!("missing required field '{field}'")));
        }
    }

    if !schema.allowed_actions.is_empty() {
        let action = object
            .get("action")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::schema_error(profile_id, "missing or non-string 'action' field"))?;
        if !schema.allowed_actions.iter().any(|a| a == action) {
            return Err(Error::schema_error(
                profile_id,
                format!("action '{action}' is not one of {:?}", schema.allowed_actions),
            ));
        }
    }

    let (low, high) = schema.confidence_range.unwrap_or((0.0, 1.0));
    if let Some(confidence) = object.get("confidence").and_then(|v| v.as_f64()) {
        if confidence < low || confidence > high {
            return Err(Error::schema_error(
                profile_id,
                format!("confidence {confidence} outside range [{low}, {high}]"),
            ));
        }
    } else {
        return Err(Error::schema_error(profile_id, "missing or non-numeric 'confidence' field"));
    }

    if let Some(max_reasons) = schema.max_reasons {
        if let Some(reasons) = object.get("reasons").and_then(|v| v.as_array()) {
            if reasons.len() as u32 > max_reasons {
                return Err(Error::schema_error(
                    profile_id,
                    format!("{} reasons exceeds max_reasons {max_reasons}", reasons.len()),
                ));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClassifierConfig;
    use crate::profile::merge::merge_root;
    use crate::profile::types::ProfileSource;

    fn profile_with_schema(schema: ResponseSchema) -> Profile {
        let mut source = ProfileSource {
            id: "spam".to_string(),
            version: "1.0.0".to_string(),
            inherits_from: None,
            depends_on: Vec::new(),
            conditional_execution: None,
            model_params: Default::default(),
            system: None,
            few_shot: Vec::new(),
            response_schema: Some(schema),
            policy: Vec::new(),
            default_action: None,
            calibration: Default::default(),
            tags: Vec::new(),
        };
        source.response_schema.get_or_insert_with(Default::default);
        merge_root(&source, &ClassifierConfig::default())
    }

    fn schema() -> ResponseSchema {
        ResponseSchema {
            required_fields: vec!["action".to_string(), "confidence".to_string()],
            allowed_actions: vec!["archive".to_string(), "none".to_string()],
            confidence_range: Some((0.0, 1.0)),
            max_reasons: Some(3),
        }
    }

    #[test]
    fn parses_raw_json() {
        let profile = profile_with_schema(schema());
        let raw = r#"{"action": "archive", "confidence": 0.9, "reasons": ["bulk mail"]}"#;
        let response = parse_response(raw, &profile).unwrap();
        assert_eq!(response.action, "archive");
    }

    #[test]
    fn falls_back_to_substring_extraction() {
        let profile = profile_with_schema(schema());
        let raw = r#"Sure, here's my answer: {"action": "none", "confidence": 0.2} — let me know if you need more."#;
        let response = parse_response(raw, &profile).unwrap();
        assert_eq!(response.action, "none");
    }

    #[test]
    fn falls_back_to_fenced_block() {
        let profile = profile_with_schema(schema());
        let raw = "```json\n{\"action\": \"archive\", \"confidence\": 0.95}\n```";
        let response = parse_response(raw, &profile).unwrap();
        assert_eq!(response.confidence, 0.95);
    }

    #[test]
    fn rejects_disallowed_action() {
        let profile = profile_with_schema(schema());
        let raw = r#"{"action": "delete", "confidence": 0.9}"#;
        assert!(parse_response(raw, &profile).is_err());
    }

    #[test]
    fn rejects_confidence_out_of_range() {
        let profile = profile_with_schema(schema());
        let raw = r#"{"action": "archive", "confidence": 1.5}"#;
        assert!(parse_response(raw, &profile).is_err());
    }

    #[test]
    fn rejects_unparseable_response() {
        let profile = profile_with_schema(schema());
        let raw = "I cannot classify this message.";
        assert!(parse_response(raw, &profile).is_err());
    }
}
