//! Utilities module - text helpers shared by the stores, workers and chat

pub mod text_utils;

pub use text_utils::{approx_tokens, document_namespace, sanitize_key_part, truncate_chars};
