//! Recovery of structured JSON from free-form agent replies.
//!
//! Agents are asked for JSON but often wrap it in prose or code fences.
//! Extraction tries, in order: the whole reply, the first fenced block, then
//! every balanced top-level `{...}` span.

use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

/// Keys that identify the object an agent meant as its answer
pub const DISCRIMINATOR_KEYS: &[&str] = &["decision", "agent", "workflow_determination"];

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("No valid JSON found in response")]
    NoStructuredData,

    #[error("Response JSON is not a valid {expected}: {source}")]
    Schema {
        expected: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// Extract the most plausible JSON value from an agent reply
pub fn extract_json(text: &str) -> Result<Value, DecodeError> {
    let trimmed = text.trim();

    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Ok(value);
    }

    if let Some(block) = fenced_block(trimmed) {
        if let Ok(value) = serde_json::from_str::<Value>(block) {
            return Ok(value);
        }
    }

    let candidates: Vec<(usize, Value)> = brace_spans(trimmed)
        .into_iter()
        .filter_map(|span| {
            serde_json::from_str::<Value>(span)
                .ok()
                .filter(Value::is_object)
                .map(|v| (span.len(), v))
        })
        .collect();

    if let Some(pos) = candidates.iter().position(|(_, v)| has_discriminator(v)) {
        return Ok(candidates[pos].1.clone());
    }

    if candidates.len() > 1 {
        warn!(
            candidates = candidates.len(),
            "Ambiguous agent reply, choosing the largest JSON object"
        );
    }

    candidates
        .into_iter()
        .max_by_key(|(len, _)| *len)
        .map(|(_, v)| v)
        .ok_or(DecodeError::NoStructuredData)
}

/// Extract and deserialize into a typed stage result
pub fn decode<T: DeserializeOwned>(text: &str, expected: &'static str) -> Result<T, DecodeError> {
    let value = extract_json(text)?;
    serde_json::from_value(value).map_err(|source| DecodeError::Schema { expected, source })
}

fn has_discriminator(value: &Value) -> bool {
    DISCRIMINATOR_KEYS.iter().any(|k| value.get(k).is_some())
}

/// Body of the first ``` fence, skipping an optional `json` language tag
fn fenced_block(text: &str) -> Option<&str> {
    let start = text.find("```")? + 3;
    let rest = &text[start..];
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    let end = rest.find("```")?;
    Some(rest[..end].trim())
}

/// Top-level balanced `{...}` spans. Braces inside JSON strings are ignored.
fn brace_spans(text: &str) -> Vec<&str> {
    let mut spans = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, ch) in text.char_indices() {
        if depth > 0 && in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }

        match ch {
            '"' if depth > 0 => in_string = true,
            '{' => {
                if depth == 0 {
                    start = i;
                }
                depth += 1;
            }
            '}' if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    spans.push(&text[start..=i]);
                }
            }
            _ => {}
        }
    }

    spans
}
