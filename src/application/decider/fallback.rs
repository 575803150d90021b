use super::ArgumentSet;
use crate::types::{CatalogServer, ParamType, Selection, ToolDescriptor};
use serde_json::Value;

pub const FALLBACK_REASONING: &str = "fallback: selection error";

const PLACE_HINTS: [&str; 3] = ["city", "location", "place"];
const PLACE_PREPOSITIONS: [&str; 3] = ["in", "for", "at"];

/// Deterministic recovery when a decider's selection violates its contract:
/// the first tool in catalog order. `None` only for an empty catalog.
pub fn fallback_selection(catalog: &[CatalogServer]) -> Option<Selection> {
    catalog.iter().find_map(|server| {
        server.tools.first().map(|tool| Selection {
            server: server.server.clone(),
            tool: tool.name.clone(),
            reasoning: FALLBACK_REASONING.to_string(),
        })
    })
}

/// Rule-based argument extraction. Never fails; a parameter that cannot be
/// determined from the request text or a declared default is omitted, and
/// rejecting the call for a missing argument is the tool's job.
pub fn heuristic_arguments(tool: &ToolDescriptor, request: &str) -> ArgumentSet {
    let mut arguments = ArgumentSet::new();
    for spec in &tool.parameters {
        let extracted = match spec.kind {
            ParamType::String => extract_string(&spec.name, request).map(Value::String),
            ParamType::Integer | ParamType::Number => first_integer(request).map(Value::from),
            ParamType::Boolean | ParamType::Array | ParamType::Object => None,
        };
        match extracted {
            Some(value) => {
                arguments.insert(spec.name.clone(), value);
            }
            None => {
                if let Some(default) = &spec.default {
                    arguments.insert(spec.name.clone(), default.clone());
                }
            }
        }
    }
    arguments
}

fn extract_string(param: &str, request: &str) -> Option<String> {
    let lowered = param.to_ascii_lowercase();
    if PLACE_HINTS.iter().any(|hint| lowered.contains(hint)) {
        return place_after_preposition(request);
    }
    let trimmed = request.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Matches the "<something> in <Place>" phrasing: the word following the
/// first "in"/"for"/"at", stripped of punctuation and capitalized.
fn place_after_preposition(request: &str) -> Option<String> {
    let words: Vec<&str> = request.split_whitespace().collect();
    for (index, word) in words.iter().enumerate() {
        if PLACE_PREPOSITIONS.contains(&word.to_ascii_lowercase().as_str()) {
            if let Some(next) = words.get(index + 1) {
                let cleaned: String = next
                    .chars()
                    .filter(|ch| ch.is_alphanumeric() || *ch == '-')
                    .collect();
                if !cleaned.is_empty() {
                    return Some(capitalize(&cleaned));
                }
            }
        }
    }
    None
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

fn first_integer(request: &str) -> Option<i64> {
    let mut digits = String::new();
    for ch in request.chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
        } else if !digits.is_empty() {
            break;
        }
    }
    digits.parse().ok()
}
