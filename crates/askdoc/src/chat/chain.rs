//! Retrieval-augmented answer chain over an OpenAI-compatible chat endpoint
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::ingestion::{Retriever, ScoredChunk};
use crate::record_store::{Message, Role, SourceCitation};

const REPHRASE_SYSTEM_PROMPT: &str = "Given the following conversation and a follow up question, \
rephrase the follow up question to be a standalone question.";

const ANSWER_SYSTEM_PROMPT: &str = "You are an experienced researcher, expert at interpreting and \
answering questions based on provided sources. Using the context below and the chat history, \
answer the user's question as thoroughly as you can using only the resources provided.";

#[derive(Debug, Clone, PartialEq)]
pub struct ChainAnswer {
    pub text: String,
    /// The question actually used for retrieval.
    pub standalone_question: String,
    pub sources: Vec<SourceCitation>,
}

/// (namespace, question, history) -> answer.
#[async_trait]
pub trait AnswerChain: Send + Sync {
    async fn answer(&self, namespace: &str, question: &str, history: &[Message]) -> anyhow::Result<ChainAnswer>;
}

/// Renders retrieved chunks as `<doc>` blocks, one per chunk.
pub fn format_context(chunks: &[ScoredChunk]) -> String {
    chunks
        .iter()
        .map(|chunk| format!("<doc>\n{}\n</doc>", chunk.content))
        .collect::<Vec<_>>()
        .join("\n")
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    temperature: f32,
    stream: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct ChatMessage {
    role: String,
    content: String,
}

impl ChatMessage {
    fn new(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: Option<ChatMessage>,
}

pub struct RagChain {
    backend_url: String,
    model: String,
    http_client: reqwest::Client,
    retriever: Arc<dyn Retriever>,
    top_k: usize,
}

impl RagChain {
    pub fn new(
        backend_url: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
        retriever: Arc<dyn Retriever>,
        top_k: usize,
    ) -> Self {
        Self {
            backend_url: backend_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            http_client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
            retriever,
            top_k,
        }
    }

    fn completions_url(&self) -> String {
        format!("{}/v1/chat/completions", self.backend_url)
    }

    fn to_chat_messages(history: &[Message]) -> Vec<ChatMessage> {
        history
            .iter()
            .map(|m| {
                let role = match m.role {
                    Role::User => "user",
                    Role::Assistant => "assistant",
                };
                ChatMessage::new(role, m.content.clone())
            })
            .collect()
    }

    async fn complete(&self, messages: Vec<ChatMessage>) -> anyhow::Result<String> {
        let request = ChatCompletionRequest {
            model: &self.model,
            messages,
            max_tokens: 2000,
            temperature: 0.0,
            stream: false,
        };
        let response = self.http_client
            .post(self.completions_url())
            .json(&request)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("LLM backend request failed: {}", e))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!("LLM backend returned {}: {}", status, body));
        }
        let completion: ChatCompletionResponse = response.json().await
            .map_err(|e| anyhow::anyhow!("Failed to parse LLM response: {}", e))?;
        completion
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message)
            .map(|message| message.content.trim().to_string())
            .ok_or_else(|| anyhow::anyhow!("LLM backend returned no choices"))
    }

    /// A follow-up only makes sense against its history; the first question
    /// is already standalone.
    async fn rephrase(&self, question: &str, history: &[Message]) -> anyhow::Result<String> {
        if history.is_empty() {
            return Ok(question.to_string());
        }
        let mut messages = vec![ChatMessage::new("system", REPHRASE_SYSTEM_PROMPT)];
        messages.extend(Self::to_chat_messages(history));
        messages.push(ChatMessage::new(
            "user",
            format!("Rephrase the following question as a standalone question:\n{}", question),
        ));
        let rephrased = self.complete(messages).await?;
        Ok(if rephrased.is_empty() { question.to_string() } else { rephrased })
    }
}

#[async_trait]
impl AnswerChain for RagChain {
    async fn answer(&self, namespace: &str, question: &str, history: &[Message]) -> anyhow::Result<ChainAnswer> {
        let standalone_question = self.rephrase(question, history).await?;
        let chunks = self.retriever.retrieve(namespace, &standalone_question, self.top_k).await?;
        debug!(namespace, retrieved = chunks.len(), "Retrieved context for question");

        let mut messages = vec![ChatMessage::new(
            "system",
            format!("{}\n\n<context>\n{}\n</context>", ANSWER_SYSTEM_PROMPT, format_context(&chunks)),
        )];
        messages.extend(Self::to_chat_messages(history));
        messages.push(ChatMessage::new(
            "user",
            format!(
                "Now, answer this question using the previous context and chat history:\n\n{}",
                standalone_question
            ),
        ));
        let text = self.complete(messages).await?;

        Ok(ChainAnswer {
            text,
            standalone_question,
            sources: chunks
                .into_iter()
                .map(|chunk| SourceCitation {
                    page: Some(chunk.page),
                    content: chunk.content,
                })
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakePipeline;
    use mockito::Matcher;
    use serde_json::json;

    fn completion(content: &str) -> String {
        json!({ "choices": [{ "message": { "role": "assistant", "content": content } }] }).to_string()
    }

    fn chain(url: &str) -> RagChain {
        RagChain::new(url, "test-chat", Duration::from_secs(5), Arc::new(FakePipeline::new(1, 1)), 4)
    }

    #[test]
    fn test_format_context() {
        let chunks = vec![
            ScoredChunk { content: "alpha".into(), page: 1, score: 0.9 },
            ScoredChunk { content: "beta".into(), page: 2, score: 0.5 },
        ];
        assert_eq!(format_context(&chunks), "<doc>\nalpha\n</doc>\n<doc>\nbeta\n</doc>");
        assert_eq!(format_context(&[]), "");
    }

    #[tokio::test]
    async fn test_first_question_skips_rephrase() {
        let mut server = mockito::Server::new_async().await;
        let answer_mock = server
            .mock("POST", "/v1/chat/completions")
            .match_body(Matcher::Regex("<context>".to_string()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(completion(" Revenue grew 12%. "))
            .expect(1)
            .create_async()
            .await;

        let answer = chain(&server.url())
            .answer("U1::report_pdf", "How did revenue change?", &[])
            .await
            .unwrap();

        assert_eq!(answer.text, "Revenue grew 12%.");
        assert_eq!(answer.standalone_question, "How did revenue change?");
        assert_eq!(answer.sources.len(), 1);
        assert_eq!(answer.sources[0].page, Some(4));
        answer_mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_follow_up_is_rephrased_before_retrieval() {
        let mut server = mockito::Server::new_async().await;
        let rephrase_mock = server
            .mock("POST", "/v1/chat/completions")
            .match_body(Matcher::Regex("Rephrase the following question".to_string()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(completion("How did revenue change in Q3?"))
            .expect(1)
            .create_async()
            .await;
        let answer_mock = server
            .mock("POST", "/v1/chat/completions")
            .match_body(Matcher::AllOf(vec![
                Matcher::Regex("<context>".to_string()),
                Matcher::Regex("How did revenue change in Q3".to_string()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(completion("It grew."))
            .expect(1)
            .create_async()
            .await;

        let history = vec![Message::user("Summarize Q3."), Message::assistant("Q3 was strong.")];
        let answer = chain(&server.url())
            .answer("U1::report_pdf", "And revenue?", &history)
            .await
            .unwrap();

        assert_eq!(answer.standalone_question, "How did revenue change in Q3?");
        assert_eq!(answer.text, "It grew.");
        rephrase_mock.assert_async().await;
        answer_mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_backend_error_is_propagated() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/v1/chat/completions")
            .with_status(500)
            .with_body("boom")
            .create_async()
            .await;

        let err = chain(&server.url()).answer("ns", "q", &[]).await.unwrap_err();
        assert!(err.to_string().contains("500"));
    }
}
