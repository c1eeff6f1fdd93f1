//! Parse-or-fallback boundary for structured reasoning responses.
//!
//! Responses are expected to hold one JSON object but routinely arrive
//! wrapped in markdown fences, with trailing commas, raw control characters
//! or cut off mid-value when the token budget runs out. [`parse_json`] tries
//! progressively more forgiving readings before giving up with a
//! [`ParseError`]; callers then apply their phase's documented fallback.

use std::sync::LazyLock;

use regex::Regex;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::errors::ParseError;
use crate::util::extract_json_object;

static FENCE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"```(?:json|JSON)?").unwrap());

static TRAILING_COMMA_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r",\s*([}\]])").unwrap());

/// Strip fences, keep the span from the first `{` to the last `}`, drop
/// trailing commas and blank out control characters.
pub fn clean_json(raw: &str) -> Option<String> {
    let unfenced = FENCE_REGEX.replace_all(raw, "");
    let start = unfenced.find('{')?;
    let end = unfenced.rfind('}')?;
    if end < start {
        return None;
    }
    let sliced = &unfenced[start..=end];
    let without_commas = TRAILING_COMMA_REGEX.replace_all(sliced, "$1");
    Some(blank_control_chars(&without_commas))
}

fn blank_control_chars(text: &str) -> String {
    text.chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect()
}

/// Close a response that was cut off mid-object.
///
/// Tries the text as-is with its open brackets closed, then progressively
/// shorter prefixes ending just before a top-level-or-nested comma, so a
/// trailing partial member like `,"name": "Cut` is dropped.
pub fn repair_truncated(raw: &str) -> Option<Value> {
    let unfenced = FENCE_REGEX.replace_all(raw, "");
    let start = unfenced.find('{')?;
    let text = blank_control_chars(&unfenced[start..]);

    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    // (byte offset of a comma outside strings, closers needed at that point)
    let mut cut_points: Vec<(usize, String)> = Vec::new();

    for (i, ch) in text.char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => stack.push('}'),
            '[' => stack.push(']'),
            '}' | ']' => {
                stack.pop();
                if stack.is_empty() {
                    // Complete object already; nothing to repair.
                    return serde_json::from_str(&text[..=i]).ok();
                }
            }
            ',' => cut_points.push((i, closers(&stack))),
            _ => {}
        }
    }

    if !in_string {
        let trimmed = text.trim_end().trim_end_matches(',');
        let candidate = format!("{}{}", trimmed, closers(&stack));
        if let Ok(value) = serde_json::from_str(&candidate) {
            return Some(value);
        }
    }

    for (offset, closing) in cut_points.iter().rev().take(16) {
        let candidate = format!("{}{}", &text[..*offset], closing);
        if let Ok(value) = serde_json::from_str(&candidate) {
            return Some(value);
        }
    }
    None
}

fn closers(stack: &[char]) -> String {
    stack.iter().rev().collect()
}

/// Parse a structured response into `T`.
pub fn parse_json<T: DeserializeOwned>(raw: &str) -> Result<T, ParseError> {
    if !raw.contains('{') {
        return Err(ParseError::NoJsonObject);
    }

    let mut last_error = String::from("no candidate object");
    if let Some(cleaned) = clean_json(raw) {
        match serde_json::from_str::<T>(&cleaned) {
            Ok(value) => return Ok(value),
            Err(e) => last_error = e.to_string(),
        }
    }
    if let Some(balanced) = extract_json_object(raw) {
        match serde_json::from_str::<T>(&balanced) {
            Ok(value) => return Ok(value),
            Err(e) => last_error = e.to_string(),
        }
    }
    if let Some(repaired) = repair_truncated(raw) {
        match serde_json::from_value::<T>(repaired) {
            Ok(value) => return Ok(value),
            Err(e) => last_error = e.to_string(),
        }
    }

    Err(ParseError::Malformed {
        message: last_error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Sample {
        name: String,
        #[serde(default)]
        items: Vec<String>,
    }

    #[test]
    fn test_parse_plain_object() {
        let parsed: Sample = parse_json(r#"{"name": "a", "items": ["x"]}"#).unwrap();
        assert_eq!(parsed.items, vec!["x"]);
    }

    #[test]
    fn test_parse_fenced_object_with_trailing_commas() {
        let raw = "Sure!\n```json\n{\"name\": \"a\", \"items\": [\"x\", \"y\",],}\n```";
        let parsed: Sample = parse_json(raw).unwrap();
        assert_eq!(parsed.name, "a");
        assert_eq!(parsed.items.len(), 2);
    }

    #[test]
    fn test_parse_with_raw_newline_in_string() {
        let raw = "{\"name\": \"line one\nline two\"}";
        let parsed: Sample = parse_json(raw).unwrap();
        assert_eq!(parsed.name, "line one line two");
    }

    #[test]
    fn test_parse_prefers_first_balanced_object() {
        let raw = r#"{"name": "first"} and also {"name": "second"}"#;
        let parsed: Sample = parse_json(raw).unwrap();
        assert_eq!(parsed.name, "first");
    }

    #[test]
    fn test_repair_truncated_drops_partial_member() {
        let raw = r#"{"name": "a", "items": ["x", "y"], "note": "cut of"#;
        let repaired = repair_truncated(raw).unwrap();
        assert_eq!(repaired, json!({"name": "a", "items": ["x", "y"]}));
    }

    #[test]
    fn test_repair_truncated_inside_array() {
        let raw = r#"{"name": "a", "items": ["x", "y", "z"#;
        let parsed: Sample = parse_json(raw).unwrap();
        assert_eq!(parsed.items, vec!["x", "y"]);
    }

    #[test]
    fn test_no_object_is_distinct_error() {
        assert!(matches!(
            parse_json::<Sample>("I cannot help with that"),
            Err(ParseError::NoJsonObject)
        ));
    }

    #[test]
    fn test_wrong_shape_is_malformed() {
        assert!(matches!(
            parse_json::<Sample>(r#"{"unexpected": 1}"#),
            Err(ParseError::Malformed { .. })
        ));
    }

    #[test]
    fn test_clean_json_none_without_braces() {
        assert_eq!(clean_json("nothing"), None);
        assert_eq!(clean_json("} backwards {"), None);
    }
}
