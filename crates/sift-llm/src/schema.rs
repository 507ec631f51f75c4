//! JSON-schema helpers for structured output.

use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::LlmError;

/// Schema for `T` with `additionalProperties: false` on every object, as
/// strict structured-output endpoints require.
///
/// # Errors
///
/// Returns `LlmError::Json` if the generated schema cannot be converted.
pub fn strict_schema<T: JsonSchema>() -> Result<Value, LlmError> {
    let mut value = serde_json::to_value(schemars::schema_for!(T))?;
    forbid_additional_properties(&mut value);
    Ok(value)
}

/// Short type name used as the schema name in requests.
#[must_use]
pub fn schema_name<T>() -> &'static str {
    std::any::type_name::<T>()
        .rsplit("::")
        .next()
        .unwrap_or("Output")
}

fn forbid_additional_properties(value: &mut Value) {
    match value {
        Value::Object(map) => {
            if map.get("type").and_then(Value::as_str) == Some("object") {
                map.insert("additionalProperties".into(), Value::Bool(false));
            }
            for child in map.values_mut() {
                forbid_additional_properties(child);
            }
        }
        Value::Array(items) => {
            for child in items {
                forbid_additional_properties(child);
            }
        }
        _ => {}
    }
}

/// Locate the JSON payload in a model reply that may be wrapped in a code
/// fence or surrounded by prose.
#[must_use]
pub fn extract_json(content: &str) -> &str {
    let trimmed = content.trim();
    let unfenced = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .map_or(trimmed, str::trim);
    if unfenced.starts_with('{') || unfenced.starts_with('[') {
        return unfenced;
    }
    match (unfenced.find('{'), unfenced.rfind('}')) {
        (Some(start), Some(end)) if start < end => &unfenced[start..=end],
        _ => unfenced,
    }
}

/// Parse a model reply into `T`.
///
/// # Errors
///
/// Returns `LlmError::StructuredParse` if no valid payload is found.
pub fn parse_structured<T: DeserializeOwned>(content: &str) -> Result<T, LlmError> {
    serde_json::from_str(extract_json(content)).map_err(|e| LlmError::StructuredParse(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, JsonSchema)]
    struct Ranking {
        id: usize,
        score: f32,
    }

    #[derive(Debug, Deserialize, JsonSchema)]
    struct Rankings {
        rankings: Vec<Ranking>,
    }

    #[test]
    fn strict_schema_closes_nested_objects() {
        let schema = strict_schema::<Rankings>().unwrap();
        assert_eq!(schema["additionalProperties"], Value::Bool(false));
        let text = schema.to_string();
        assert_eq!(
            text.matches("\"additionalProperties\":false").count(),
            2,
            "{text}"
        );
    }

    #[test]
    fn schema_name_is_short() {
        assert_eq!(schema_name::<Rankings>(), "Rankings");
    }

    #[test]
    fn extract_json_strips_fence() {
        assert_eq!(extract_json("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(extract_json("```\n[1]\n```"), "[1]");
    }

    #[test]
    fn extract_json_finds_object_in_prose() {
        assert_eq!(extract_json("Sure! {\"a\": 2} hope this helps"), "{\"a\": 2}");
    }

    #[test]
    fn parse_structured_reports_garbage() {
        let err = parse_structured::<Rankings>("no json here").unwrap_err();
        assert!(matches!(err, LlmError::StructuredParse(_)));
    }

    #[test]
    fn parse_structured_reads_rankings() {
        let parsed: Rankings =
            parse_structured(r#"{"rankings":[{"id":0,"score":7.5}]}"#).unwrap();
        assert_eq!(parsed.rankings.len(), 1);
        assert_eq!(parsed.rankings[0].id, 0);
        assert!((parsed.rankings[0].score - 7.5).abs() < f32::EPSILON);
    }
}
