//! Chat module - question answering over indexed documents with synchronized history
pub mod chain;
pub mod history;
pub mod service;

pub use chain::{format_context, AnswerChain, ChainAnswer, RagChain};
pub use history::{ChatHistorySync, HistoryHandle};
pub use service::{validate_message, ChatError, ChatReply, ChatService, MAX_MESSAGE_CHARS};
