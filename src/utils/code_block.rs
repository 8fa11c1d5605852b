//! Source code extraction from LLM responses.

use std::sync::LazyLock;

use regex::Regex;

static CODE_FENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"```([A-Za-z0-9_+-]*)[ \t]*\n([\s\S]*?)```")
        .expect("Invalid regex for code fences")
});

/// Returns the code a model produced.
///
/// When the response holds fenced blocks, the first block tagged with
/// `language` wins, then the first block of any kind. Unfenced responses are
/// returned trimmed.
pub fn extract_code(content: &str, language: &str) -> String {
    let blocks: Vec<(&str, &str)> = CODE_FENCE
        .captures_iter(content)
        .filter_map(|caps| Some((caps.get(1)?.as_str(), caps.get(2)?.as_str())))
        .collect();

    blocks
        .iter()
        .find(|(tag, _)| tag.eq_ignore_ascii_case(language))
        .or_else(|| blocks.first())
        .map(|(_, body)| body.trim_end().to_string() + "\n")
        .unwrap_or_else(|| content.trim().to_string())
}
