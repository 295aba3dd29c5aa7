//! Text helpers for namespaces and token accounting

use std::borrow::Cow;
use regex::Regex;
use lazy_static::lazy_static;

lazy_static! {
    static ref NON_KEY_CHAR: Regex = Regex::new(r"[^a-zA-Z0-9_]").unwrap();
}

/// Separator between the owner and file parts of a namespace.
pub const NAMESPACE_SEPARATOR: &str = "::";

/// Replaces every character outside `[a-zA-Z0-9_]` with `_`.
pub fn sanitize_key_part(text: &str) -> Cow<'_, str> {
    NON_KEY_CHAR.replace_all(text, "_")
}

/// Vector-index namespace for a user's upload: `U1` + `report.pdf` -> `U1::report_pdf`.
pub fn document_namespace(user_key: &str, filename: &str) -> String {
    format!(
        "{}{}{}",
        sanitize_key_part(user_key),
        NAMESPACE_SEPARATOR,
        sanitize_key_part(filename)
    )
}

/// Rough token estimate: one token per four characters, rounded down.
pub fn approx_tokens(text: &str) -> u64 {
    (text.chars().count() / 4) as u64
}

/// Cuts `text` to at most `max_chars` characters on a char boundary.
pub fn truncate_chars(text: &str, max_chars: usize) -> Cow<'_, str> {
    match text.char_indices().nth(max_chars) {
        Some((byte_index, _)) => Cow::Owned(text[..byte_index].to_string()),
        None => Cow::Borrowed(text),
    }
}
