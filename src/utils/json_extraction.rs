//! JSON extraction from LLM responses.
//!
//! Model output often wraps JSON in markdown fences or surrounds it with
//! prose. [`extract_json`] tries, in order:
//!
//! 1. a fenced code block (```json or bare ```) holding valid JSON
//! 2. the whole response, if it starts with `{` or `[`
//! 3. the largest valid object or array anywhere in the text, preferring the
//!    later one on ties
//!
//! ```
//! use devloop::utils::json_extraction::extract_json;
//!
//! let response = "Here you go:\n```json\n{\"tasks\": []}\n```";
//! assert_eq!(extract_json(response).unwrap(), "{\"tasks\": []}");
//! ```

use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

static FENCED_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"```(?:[A-Za-z0-9_+-]+)?[ \t]*\n?([\s\S]*?)\n?```")
        .expect("Invalid regex for fenced code blocks")
});

#[derive(Debug, Clone, Error, PartialEq)]
pub enum JsonExtractionError {
    #[error("JSON appears truncated: {unclosed} unclosed delimiters. Partial: {partial_preview}...")]
    Truncated {
        partial_preview: String,
        unclosed: usize,
    },
    #[error("No JSON content found in response. Content starts with: '{content_preview}'")]
    NotFound { content_preview: String },
}

/// Extracts the JSON document embedded in `content`.
pub fn extract_json(content: &str) -> Result<String, JsonExtractionError> {
    let trimmed = content.trim();

    for caps in FENCED_BLOCK.captures_iter(trimmed) {
        if let Some(block) = caps.get(1) {
            let block = block.as_str().trim();
            if is_valid_json(block) {
                return Ok(block.to_string());
            }
        }
    }

    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        if let Some(end) = find_closing(trimmed) {
            let candidate = &trimmed[..=end];
            if is_valid_json(candidate) {
                return Ok(candidate.to_string());
            }
        }
    }

    if let Some(json) = largest_embedded_json(trimmed) {
        return Ok(json);
    }

    if let Some(start) = trimmed.find(['{', '[']) {
        let unclosed = unclosed_delimiters(&trimmed[start..]);
        if unclosed > 0 {
            return Err(JsonExtractionError::Truncated {
                partial_preview: preview(&trimmed[start..], 100),
                unclosed,
            });
        }
    }

    Err(JsonExtractionError::NotFound {
        content_preview: preview(trimmed, 50),
    })
}

/// Index of the delimiter closing the `{` or `[` that `s` starts with.
///
/// String literals and escapes are honoured, so braces inside strings do not
/// count.
pub fn find_closing(s: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escape_next = false;

    for (i, c) in s.char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }
        match c {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            '{' | '[' if !in_string => depth += 1,
            '}' | ']' if !in_string => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

fn largest_embedded_json(content: &str) -> Option<String> {
    content
        .char_indices()
        .filter(|(_, c)| *c == '{' || *c == '[')
        .filter_map(|(start, _)| {
            let rest = &content[start..];
            let end = find_closing(rest)?;
            let candidate = &rest[..=end];
            is_valid_json(candidate).then_some((start, candidate))
        })
        .max_by(|(pos_a, a), (pos_b, b)| a.len().cmp(&b.len()).then(pos_a.cmp(pos_b)))
        .map(|(_, json)| json.to_string())
}

fn unclosed_delimiters(s: &str) -> usize {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escape_next = false;
    for c in s.chars() {
        if escape_next {
            escape_next = false;
            continue;
        }
        match c {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            '{' | '[' if !in_string => depth += 1,
            '}' | ']' if !in_string => depth = depth.saturating_sub(1),
            _ => {}
        }
    }
    depth
}

fn is_valid_json(candidate: &str) -> bool {
    (candidate.starts_with('{') || candidate.starts_with('['))
        && serde_json::from_str::<serde_json::Value>(candidate).is_ok()
}

fn preview(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direct_object() {
        assert_eq!(extract_json(r#"{"a": 1}"#).unwrap(), r#"{"a": 1}"#);
    }

    #[test]
    fn test_direct_array() {
        assert_eq!(extract_json("[1, 2, 3]").unwrap(), "[1, 2, 3]");
    }

    #[test]
    fn test_json_fence() {
        let content = "Sure.\n```json\n{\"actions\": []}\n```\nDone.";
        assert_eq!(extract_json(content).unwrap(), "{\"actions\": []}");
    }

    #[test]
    fn test_bare_fence_with_array() {
        let content = "```\n[{\"id\": \"t1\"}]\n```";
        assert_eq!(extract_json(content).unwrap(), "[{\"id\": \"t1\"}]");
    }

    #[test]
    fn test_prefers_largest_embedded_object() {
        let content = r#"Consider {"x": 1}. The answer: {"tasks": [{"id": "a"}]}"#;
        assert_eq!(
            extract_json(content).unwrap(),
            r#"{"tasks": [{"id": "a"}]}"#
        );
    }

    #[test]
    fn test_braces_inside_strings() {
        let content = r#"{"code": "fn main() { }", "n": 2}"#;
        assert_eq!(extract_json(content).unwrap(), content);
    }

    #[test]
    fn test_truncated() {
        let err = extract_json(r#"{"tasks": [{"id": "a""#).unwrap_err();
        assert!(matches!(err, JsonExtractionError::Truncated { unclosed: 3, .. }));
    }

    #[test]
    fn test_not_found() {
        let err = extract_json("no json here").unwrap_err();
        assert_eq!(
            err,
            JsonExtractionError::NotFound {
                content_preview: "no json here".to_string()
            }
        );
    }

    #[test]
    fn test_find_closing_unbalanced() {
        assert_eq!(find_closing("{\"a\": [1, 2]}"), Some(12));
        assert_eq!(find_closing("{\"a\": "), None);
        assert_eq!(find_closing("}"), None);
    }
}
