use regex::Regex;
use std::sync::LazyLock;

pub const MAX_CONTENT_CHARS: usize = 1000;
const ELLIPSIS: &str = "...";

static URL_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"https?://\S+|www\.\S+").expect("URL pattern is valid")
});
static WHITESPACE_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("whitespace pattern is valid"));

/// Strips URLs, collapses whitespace and caps the length of chat content.
pub fn sanitize_content(raw: &str) -> String {
    if raw.is_empty() {
        return String::new();
    }
    let without_urls = URL_PATTERN.replace_all(raw, "");
    let collapsed = WHITESPACE_RUN.replace_all(&without_urls, " ");
    let trimmed = collapsed.trim();

    if trimmed.chars().count() > MAX_CONTENT_CHARS {
        let mut truncated: String = trimmed
            .chars()
            .take(MAX_CONTENT_CHARS - ELLIPSIS.len())
            .collect();
        truncated.push_str(ELLIPSIS);
        truncated
    } else {
        trimmed.to_string()
    }
}
