mod fallback;

pub use fallback::{FALLBACK_REASONING, fallback_selection, heuristic_arguments};

use crate::infrastructure::model::ModelError;
use crate::types::{CatalogServer, ParamType, Selection, ToolDescriptor};
use async_trait::async_trait;
use serde_json::{Map as JsonMap, Value};
use thiserror::Error;
use tracing::debug;

pub type ArgumentSet = JsonMap<String, Value>;

#[derive(Debug, Error)]
pub enum DeciderError {
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error("decider returned output that is not the expected structure: {0}")]
    Malformed(String),
}

/// The pluggable semantic component: maps free text to a tool selection and
/// an argument set. Implementations may be model-backed or rule-based; the
/// engine validates every post-condition and recovers through the fallbacks
/// in this module, so an implementation is allowed to fail or hallucinate.
#[async_trait]
pub trait Decider: Send + Sync {
    async fn select_tool(
        &self,
        catalog: &[CatalogServer],
        request: &str,
    ) -> Result<Selection, DeciderError>;

    async fn extract_arguments(
        &self,
        tool: &ToolDescriptor,
        request: &str,
    ) -> Result<ArgumentSet, DeciderError>;
}

/// Cleans a raw argument set against the tool's schema: unknown keys are
/// dropped, scalar values are coerced to the declared type where the
/// conversion is lossless, and declared defaults fill absent optional
/// parameters. Returns the cleaned set and the required parameters that are
/// still missing.
pub fn validate_arguments(tool: &ToolDescriptor, raw: ArgumentSet) -> (ArgumentSet, Vec<String>) {
    let mut cleaned = ArgumentSet::new();
    for (key, value) in raw {
        match tool.parameter(&key) {
            Some(spec) => {
                cleaned.insert(key, coerce(spec.kind, value));
            }
            None => {
                debug!(tool = %tool.name, parameter = %key, "Dropping argument not in schema");
            }
        }
    }

    let mut missing = Vec::new();
    for spec in &tool.parameters {
        if cleaned.contains_key(&spec.name) {
            continue;
        }
        if let Some(default) = &spec.default {
            cleaned.insert(spec.name.clone(), default.clone());
        } else if spec.required {
            missing.push(spec.name.clone());
        }
    }
    (cleaned, missing)
}

fn coerce(kind: ParamType, value: Value) -> Value {
    match kind {
        ParamType::Integer => match value {
            Value::String(text) => match text.trim().parse::<i64>() {
                Ok(number) => Value::from(number),
                Err(_) => Value::String(text),
            },
            other => other,
        },
        ParamType::Number => match value {
            Value::String(text) => match text.trim().parse::<f64>() {
                Ok(number) => serde_json::Number::from_f64(number)
                    .map(Value::Number)
                    .unwrap_or(Value::String(text)),
                Err(_) => Value::String(text),
            },
            other => other,
        },
        ParamType::Boolean => match value {
            Value::String(text) => match text.trim() {
                "true" => Value::Bool(true),
                "false" => Value::Bool(false),
                _ => Value::String(text),
            },
            other => other,
        },
        ParamType::String => match value {
            Value::Number(number) => Value::String(number.to_string()),
            Value::Bool(flag) => Value::String(flag.to_string()),
            other => other,
        },
        ParamType::Array | ParamType::Object => value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ParameterSpec;
    use serde_json::json;

    fn weather_tool() -> ToolDescriptor {
        ToolDescriptor {
            name: "get_current_weather".to_string(),
            description: "Current weather for a city".to_string(),
            parameters: vec![
                ParameterSpec {
                    name: "city".to_string(),
                    kind: ParamType::String,
                    description: "City name".to_string(),
                    required: true,
                    default: None,
                },
                ParameterSpec {
                    name: "units".to_string(),
                    kind: ParamType::String,
                    description: String::new(),
                    required: false,
                    default: Some(json!("metric")),
                },
            ],
        }
    }

    #[test]
    fn drops_unknown_keys_and_applies_defaults() {
        let mut raw = ArgumentSet::new();
        raw.insert("city".to_string(), json!("Paris"));
        raw.insert("hallucinated".to_string(), json!(true));

        let (cleaned, missing) = validate_arguments(&weather_tool(), raw);
        assert_eq!(cleaned.get("city"), Some(&json!("Paris")));
        assert_eq!(cleaned.get("units"), Some(&json!("metric")));
        assert!(!cleaned.contains_key("hallucinated"));
        assert!(missing.is_empty());
    }

    #[test]
    fn reports_missing_required_parameters() {
        let (cleaned, missing) = validate_arguments(&weather_tool(), ArgumentSet::new());
        assert!(!cleaned.contains_key("city"));
        assert_eq!(missing, vec!["city"]);
    }

    #[test]
    fn coerces_scalar_strings_to_declared_types() {
        let tool = ToolDescriptor {
            name: "get_placeholder_posts".to_string(),
            description: String::new(),
            parameters: vec![ParameterSpec {
                name: "limit".to_string(),
                kind: ParamType::Integer,
                description: String::new(),
                required: false,
                default: None,
            }],
        };

        let mut raw = ArgumentSet::new();
        raw.insert("limit".to_string(), json!("5"));
        let (cleaned, _) = validate_arguments(&tool, raw);
        assert_eq!(cleaned.get("limit"), Some(&json!(5)));

        let mut unparseable = ArgumentSet::new();
        unparseable.insert("limit".to_string(), json!("several"));
        let (cleaned, _) = validate_arguments(&tool, unparseable);
        assert_eq!(cleaned.get("limit"), Some(&json!("several")));
    }
}
