//! Chat turns for document sessions
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{error, info};

use super::chain::AnswerChain;
use super::history::ChatHistorySync;
use crate::record_store::{
    DocumentStatus, Message, MessageMetadata, NewSession, RecordStore, Session, SessionMetadata,
    SessionStatus, SessionSummary, StoreError,
};
use crate::utils::approx_tokens;
use crate::workers::DocumentWorker;

pub const MAX_MESSAGE_CHARS: usize = 1000;

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("{0}")]
    InvalidMessage(String),

    #[error("session '{0}' not found")]
    SessionNotFound(String),

    #[error("document '{0}' not found")]
    DocumentNotFound(String),

    #[error("document '{document_id}' is {status}, not ready for questions")]
    DocumentNotReady {
        document_id: String,
        status: DocumentStatus,
    },

    #[error("answer generation failed: {0:#}")]
    Chain(anyhow::Error),

    #[error("failed to save chat turn: {0:#}")]
    History(anyhow::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct ChatReply {
    pub session_id: String,
    pub user_message: Message,
    pub assistant_message: Message,
    pub metadata: SessionMetadata,
}

/// Trims `message` and checks it is between 1 and [`MAX_MESSAGE_CHARS`] characters.
pub fn validate_message(message: &str) -> Result<&str, ChatError> {
    let trimmed = message.trim();
    if trimmed.is_empty() {
        return Err(ChatError::InvalidMessage("Message is required".to_string()));
    }
    if trimmed.chars().count() > MAX_MESSAGE_CHARS {
        return Err(ChatError::InvalidMessage(format!(
            "Message must be between 1 and {} characters",
            MAX_MESSAGE_CHARS
        )));
    }
    Ok(trimmed)
}

pub struct ChatService {
    records: Arc<RecordStore>,
    history: Arc<ChatHistorySync>,
    chain: Arc<dyn AnswerChain>,
}

impl ChatService {
    pub fn new(records: Arc<RecordStore>, history: Arc<ChatHistorySync>, chain: Arc<dyn AnswerChain>) -> Self {
        Self { records, history, chain }
    }

    fn owned_session(&self, session_id: &str, user_id: &str) -> Result<Session, ChatError> {
        self.records
            .sessions
            .get_session_for_owner(session_id, user_id)?
            .ok_or_else(|| ChatError::SessionNotFound(session_id.to_string()))
    }

    /// Answers `message` in the context of the session's document and
    /// records the turn. Turns on one session run one at a time.
    pub async fn send_message(&self, session_id: &str, user_id: &str, message: &str) -> Result<ChatReply, ChatError> {
        let content = validate_message(message)?;
        let session = self.owned_session(session_id, user_id)?;
        let document = self
            .records
            .documents
            .get_document(&session.document_id)?
            .ok_or_else(|| ChatError::DocumentNotFound(session.document_id.clone()))?;
        if document.status != DocumentStatus::Indexed {
            return Err(ChatError::DocumentNotReady {
                document_id: document.id,
                status: document.status,
            });
        }

        let _turn = self.history.lock_session(session_id).await;
        let history = self.history.get_history(session_id).await;

        let started = Instant::now();
        let answer = self
            .chain
            .answer(&document.namespace, content, &history)
            .await
            .map_err(|e| {
                error!(session_id, document_id = %document.id, "Answer generation failed: {:#}", e);
                ChatError::Chain(e)
            })?;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let user_message = Message::user(content).with_metadata(MessageMetadata {
            tokens: Some(approx_tokens(content)),
            ..Default::default()
        });
        let assistant_message = Message::assistant(answer.text.clone()).with_metadata(MessageMetadata {
            tokens: Some(approx_tokens(&answer.text)),
            processing_time_ms: Some(elapsed_ms),
            sources: answer.sources,
        });

        let metadata = self
            .history
            .append_turn(session_id, user_message.clone(), assistant_message.clone())
            .await
            .map_err(ChatError::History)?;

        info!(
            session_id,
            history = history.len(),
            processing_time_ms = elapsed_ms,
            total_tokens = metadata.total_tokens,
            "Chat turn completed"
        );
        Ok(ChatReply {
            session_id: session_id.to_string(),
            user_message,
            assistant_message,
            metadata,
        })
    }

    /// Opens another session on a document the user owns.
    pub fn create_session(&self, user_id: &str, document_id: &str, title: Option<&str>) -> Result<Session, ChatError> {
        let document = self
            .records
            .documents
            .get_document_for_owner(document_id, user_id)?
            .ok_or_else(|| ChatError::DocumentNotFound(document_id.to_string()))?;
        let title = title
            .map(str::trim)
            .filter(|title| !title.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| DocumentWorker::session_title(&document.original_name));
        let session = self.records.sessions.create_session(NewSession {
            user_id: user_id.to_string(),
            document_id: document.id,
            title,
        })?;
        info!(session_id = %session.id, document_id, "Session created");
        Ok(session)
    }

    /// Full message list from the record store.
    pub fn get_chat_history(&self, session_id: &str, user_id: &str) -> Result<Vec<Message>, ChatError> {
        Ok(self.owned_session(session_id, user_id)?.messages)
    }

    pub fn list_sessions(&self, user_id: &str) -> Result<Vec<SessionSummary>, ChatError> {
        Ok(self.records.sessions.list_sessions_for_user(user_id)?)
    }

    pub fn rename_session(&self, session_id: &str, user_id: &str, title: &str) -> Result<(), ChatError> {
        self.owned_session(session_id, user_id)?;
        let title = title.trim();
        if title.is_empty() {
            return Err(ChatError::InvalidMessage("Title is required".to_string()));
        }
        Ok(self.records.sessions.rename_session(session_id, title)?)
    }

    pub fn set_pinned(&self, session_id: &str, user_id: &str, pinned: bool) -> Result<(), ChatError> {
        self.owned_session(session_id, user_id)?;
        Ok(self.records.sessions.set_pinned(session_id, pinned)?)
    }

    pub fn archive_session(&self, session_id: &str, user_id: &str) -> Result<(), ChatError> {
        self.owned_session(session_id, user_id)?;
        Ok(self.records.sessions.set_session_status(session_id, SessionStatus::Archived)?)
    }

    /// Deletes the session with its messages and drops the cached history.
    pub async fn delete_session(&self, session_id: &str, user_id: &str) -> Result<(), ChatError> {
        self.owned_session(session_id, user_id)?;
        self.records.sessions.delete_session(session_id)?;
        self.history.forget(session_id).await;
        info!(session_id, "Session deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache_store::{HistoryCache, MokaHistoryCache};
    use crate::chat::chain::ChainAnswer;
    use crate::record_store::{Role, SourceCitation};
    use crate::test_support::{memory_records, seed_document};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Echoes the question and remembers the history length it was given.
    #[derive(Default)]
    struct EchoChain {
        seen_history: Mutex<Vec<usize>>,
        fail: bool,
    }

    #[async_trait]
    impl AnswerChain for EchoChain {
        async fn answer(&self, namespace: &str, question: &str, history: &[Message]) -> anyhow::Result<ChainAnswer> {
            self.seen_history.lock().unwrap().push(history.len());
            if self.fail {
                return Err(anyhow::anyhow!("backend unavailable"));
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
            Ok(ChainAnswer {
                text: format!("[{}] {}", namespace, question),
                standalone_question: question.to_string(),
                sources: vec![SourceCitation { page: Some(1), content: "source".to_string() }],
            })
        }
    }

    struct Fixture {
        records: Arc<RecordStore>,
        cache: Arc<MokaHistoryCache>,
        chain: Arc<EchoChain>,
        service: ChatService,
        session_id: String,
        user_id: String,
    }

    fn fixture(chain: EchoChain) -> Fixture {
        let records = memory_records();
        let (user, mut document) = seed_document(&records, "U1", "report.pdf");
        document.status = DocumentStatus::Indexed;
        records.documents.save_document(&mut document).unwrap();
        let (session, _) = records
            .sessions
            .create_initial_session(NewSession {
                user_id: user.id.clone(),
                document_id: document.id.clone(),
                title: "Chat about report.pdf".to_string(),
            })
            .unwrap();

        let cache = Arc::new(MokaHistoryCache::new(Duration::from_secs(3600), 100));
        let history = Arc::new(ChatHistorySync::new(Arc::clone(&records), cache.clone(), true, 50));
        let chain = Arc::new(chain);
        let service = ChatService::new(Arc::clone(&records), history, chain.clone());
        Fixture {
            records,
            cache,
            chain,
            service,
            session_id: session.id,
            user_id: user.id,
        }
    }

    #[test]
    fn test_validate_message() {
        assert_eq!(validate_message("  hello  ").unwrap(), "hello");
        assert!(validate_message("   ").is_err());
        assert!(validate_message(&"a".repeat(MAX_MESSAGE_CHARS)).is_ok());
        assert!(validate_message(&format!("  {}  ", "a".repeat(MAX_MESSAGE_CHARS))).is_ok());
        assert!(validate_message(&"a".repeat(MAX_MESSAGE_CHARS + 1)).is_err());
    }

    #[tokio::test]
    async fn test_send_message_records_turn() {
        let f = fixture(EchoChain::default());

        let reply = f
            .service
            .send_message(&f.session_id, &f.user_id, "  What is on page one?  ")
            .await
            .unwrap();

        assert_eq!(reply.user_message.content, "What is on page one?");
        assert_eq!(reply.assistant_message.content, "[U1::report_pdf] What is on page one?");
        let metadata = reply.assistant_message.metadata.clone().unwrap();
        assert_eq!(metadata.sources.len(), 1);
        assert!(metadata.processing_time_ms.is_some());
        assert_eq!(reply.metadata.total_tokens, approx_tokens("What is on page one?"));

        let session = f.records.sessions.get_session(&f.session_id).unwrap().unwrap();
        assert_eq!(session.messages.len(), 2);
        assert_eq!(session.messages[0].role, Role::User);
        assert_eq!(f.cache.get(&f.session_id).await.unwrap().unwrap(), session.messages);
    }

    #[tokio::test]
    async fn test_history_is_passed_to_chain() {
        let f = fixture(EchoChain::default());
        for question in ["first", "second", "third"] {
            f.service.send_message(&f.session_id, &f.user_id, question).await.unwrap();
        }
        assert_eq!(*f.chain.seen_history.lock().unwrap(), vec![0, 2, 4]);
    }

    #[tokio::test]
    async fn test_invalid_message_persists_nothing() {
        let f = fixture(EchoChain::default());
        let err = f.service.send_message(&f.session_id, &f.user_id, "   ").await.unwrap_err();
        assert!(matches!(err, ChatError::InvalidMessage(_)));
        let too_long = "x".repeat(MAX_MESSAGE_CHARS + 1);
        let err = f.service.send_message(&f.session_id, &f.user_id, &too_long).await.unwrap_err();
        assert!(matches!(err, ChatError::InvalidMessage(_)));

        assert!(f.service.get_chat_history(&f.session_id, &f.user_id).unwrap().is_empty());
        assert!(f.chain.seen_history.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_other_users_session_is_not_found() {
        let f = fixture(EchoChain::default());
        let stranger = f.records.users.ensure_user("U2", None).unwrap();
        let err = f
            .service
            .send_message(&f.session_id, &stranger.id, "hi")
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn test_deleted_document_is_reported() {
        let f = fixture(EchoChain::default());
        let session = f.records.sessions.get_session(&f.session_id).unwrap().unwrap();
        f.records.documents.delete_document(&session.document_id).unwrap();

        let err = f.service.send_message(&f.session_id, &f.user_id, "hi").await.unwrap_err();
        assert!(matches!(err, ChatError::DocumentNotFound(_)));
    }

    #[tokio::test]
    async fn test_chain_failure_records_nothing() {
        let f = fixture(EchoChain { fail: true, ..Default::default() });
        let err = f.service.send_message(&f.session_id, &f.user_id, "hi").await.unwrap_err();
        assert!(matches!(err, ChatError::Chain(_)));
        assert!(f.service.get_chat_history(&f.session_id, &f.user_id).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_turns_stay_paired() {
        let f = fixture(EchoChain::default());
        let service = Arc::new(f.service);

        let tasks: Vec<_> = (0..6)
            .map(|i| {
                let service = Arc::clone(&service);
                let session_id = f.session_id.clone();
                let user_id = f.user_id.clone();
                tokio::spawn(async move {
                    service
                        .send_message(&session_id, &user_id, &format!("question {}", i))
                        .await
                        .map(|_| ())
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let messages = f.records.sessions.get_session(&f.session_id).unwrap().unwrap().messages;
        assert_eq!(messages.len(), 12);
        for pair in messages.chunks(2) {
            assert_eq!(pair[0].role, Role::User);
            assert_eq!(pair[1].role, Role::Assistant);
            assert!(pair[1].content.ends_with(&pair[0].content));
        }
        let mut seen = f.chain.seen_history.lock().unwrap().clone();
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 2, 4, 6, 8, 10]);
        assert_eq!(f.cache.get(&f.session_id).await.unwrap().unwrap(), messages);
    }

    #[tokio::test]
    async fn test_session_management() {
        let f = fixture(EchoChain::default());
        f.service.rename_session(&f.session_id, &f.user_id, "Q3 questions").unwrap();
        f.service.set_pinned(&f.session_id, &f.user_id, true).unwrap();
        f.service.archive_session(&f.session_id, &f.user_id).unwrap();

        let sessions = f.service.list_sessions(&f.user_id).unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].title, "Q3 questions");
        assert!(sessions[0].is_pinned);
        assert_eq!(sessions[0].status, SessionStatus::Archived);
    }

    #[tokio::test]
    async fn test_create_session_for_owned_document() {
        let f = fixture(EchoChain::default());
        let document_id = f.records.sessions.get_session(&f.session_id).unwrap().unwrap().document_id;

        let session = f.service.create_session(&f.user_id, &document_id, None).unwrap();
        assert_eq!(session.title, "Chat about report.pdf");
        let named = f.service.create_session(&f.user_id, &document_id, Some(" Risks ")).unwrap();
        assert_eq!(named.title, "Risks");
        assert_eq!(f.service.list_sessions(&f.user_id).unwrap().len(), 3);

        let stranger = f.records.users.ensure_user("U2", None).unwrap();
        let err = f.service.create_session(&stranger.id, &document_id, None).unwrap_err();
        assert!(matches!(err, ChatError::DocumentNotFound(_)));
    }

    #[tokio::test]
    async fn test_delete_session_clears_cache() {
        let f = fixture(EchoChain::default());
        f.service.send_message(&f.session_id, &f.user_id, "hi").await.unwrap();
        assert!(f.cache.get(&f.session_id).await.unwrap().is_some());

        f.service.delete_session(&f.session_id, &f.user_id).await.unwrap();

        assert!(f.cache.get(&f.session_id).await.unwrap().is_none());
        assert!(f.records.sessions.get_session(&f.session_id).unwrap().is_none());
        let err = f.service.delete_session(&f.session_id, &f.user_id).await.unwrap_err();
        assert!(matches!(err, ChatError::SessionNotFound(_)));
    }
}
