use once_cell::sync::Lazy;
use regex::Regex;

static VERSION_SUFFIX_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"/v\d+$").expect("valid regex for version suffix"));

fn has_version(url: &str) -> bool {
    VERSION_SUFFIX_RE.is_match(url) || url.contains("/v1")
}

fn append_v1(url: &str) -> String {
    format!("{}/v1", url.trim_end_matches('/'))
}

/// Normalizes a chat-completions base URL. A trailing `#` means "use as
/// written" and is stripped; otherwise `/v1` is appended when the URL names
/// no API version.
pub fn check_base_url(input: &str) -> String {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    if let Some(verbatim) = trimmed.strip_suffix('#') {
        return verbatim.trim_end_matches('#').to_string();
    }
    if has_version(trimmed) {
        trimmed.to_string()
    } else {
        append_v1(trimmed)
    }
}

pub fn ensure_openai_base_url_has_v1(input: &str) -> String {
    let trimmed = input.trim();
    if trimmed.is_empty() || has_version(trimmed) {
        trimmed.to_string()
    } else {
        append_v1(trimmed)
    }
}

/// The profile's base URL, or `default` when the profile leaves it empty.
pub(crate) fn or_default<'a>(base_url: &'a str, default: &'a str) -> &'a str {
    let trimmed = base_url.trim();
    if trimmed.is_empty() {
        default
    } else {
        trimmed
    }
}
