//! Agent provider seam.
//!
//! The core never talks to a model vendor directly: execution goes through
//! [`AgentProvider`], and a [`ProviderRouter`] picks the provider for a
//! persona. The scripted provider backs tests and offline demos.

use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use ensemble_core::{CoreError, Result};
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_stream::wrappers::ReceiverStream;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// One streamed chunk of a chat response.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChatChunk {
    pub delta_text: Option<String>,
    pub tool_use: Option<Value>,
    pub usage: Option<Usage>,
}

pub type ChatStream = Pin<Box<dyn Stream<Item = Result<ChatChunk>> + Send>>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderCapabilities {
    pub name: String,
    pub supports_tools: bool,
    pub max_context_tokens: u64,
}

/// Streaming chat surface every provider adapter implements.
#[async_trait]
pub trait AgentProvider: Send + Sync {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        max_tokens: u32,
        tools: Option<&Value>,
    ) -> Result<ChatStream>;

    async fn health_check(&self) -> Result<()>;

    fn capabilities(&self) -> ProviderCapabilities;
}

/// Routes personas to providers, falling back to a default.
pub struct ProviderRouter {
    default: Arc<dyn AgentProvider>,
    per_persona: HashMap<String, Arc<dyn AgentProvider>>,
}

impl ProviderRouter {
    pub fn new(default: Arc<dyn AgentProvider>) -> Self {
        Self {
            default,
            per_persona: HashMap::new(),
        }
    }

    pub fn route(mut self, persona_id: impl Into<String>, provider: Arc<dyn AgentProvider>) -> Self {
        self.per_persona.insert(persona_id.into(), provider);
        self
    }

    pub fn provider_for(&self, persona_id: &str) -> Arc<dyn AgentProvider> {
        self.per_persona
            .get(persona_id)
            .cloned()
            .unwrap_or_else(|| Arc::clone(&self.default))
    }

    /// Health-check every distinct provider, returning the unhealthy names.
    pub async fn unhealthy(&self) -> Vec<String> {
        let mut failing = Vec::new();
        let mut seen = Vec::new();
        let providers = std::iter::once(&self.default).chain(self.per_persona.values());
        for provider in providers {
            let name = provider.capabilities().name;
            if seen.contains(&name) {
                continue;
            }
            seen.push(name.clone());
            if provider.health_check().await.is_err() {
                failing.push(name);
            }
        }
        failing
    }
}

/// Deterministic provider that replays canned responses word by word.
pub struct ScriptedProvider {
    responses: Mutex<VecDeque<String>>,
}

impl ScriptedProvider {
    pub fn new(responses: Vec<String>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
        }
    }

    /// Provider that echoes the last user message back.
    pub fn echo() -> Self {
        Self::new(Vec::new())
    }
}

#[async_trait]
impl AgentProvider for ScriptedProvider {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        max_tokens: u32,
        _tools: Option<&Value>,
    ) -> Result<ChatStream> {
        if max_tokens == 0 {
            return Err(CoreError::Validation("max_tokens must be positive".into()));
        }
        let scripted = self.responses.lock().unwrap().pop_front();
        let text = scripted.unwrap_or_else(|| {
            messages
                .iter()
                .rev()
                .find(|m| m.role == "user")
                .map(|m| m.content.clone())
                .unwrap_or_default()
        });
        let (sender, receiver) = tokio::sync::mpsc::channel(16);
        tokio::spawn(async move {
            let words: Vec<String> = text.split_whitespace().map(str::to_string).collect();
            let count = words.len() as u64;
            for word in words {
                let chunk = ChatChunk {
                    delta_text: Some(format!("{word} ")),
                    ..ChatChunk::default()
                };
                if sender.send(Ok(chunk)).await.is_err() {
                    return;
                }
            }
            let _ = sender
                .send(Ok(ChatChunk {
                    usage: Some(Usage {
                        input_tokens: 0,
                        output_tokens: count,
                    }),
                    ..ChatChunk::default()
                }))
                .await;
        });
        Ok(Box::pin(ReceiverStream::new(receiver)))
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            name: "scripted".into(),
            supports_tools: false,
            max_context_tokens: 128_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn scripted_provider_streams_deltas_then_usage() {
        let provider = ScriptedProvider::new(vec!["design complete".into()]);
        let mut stream = provider
            .chat(&[ChatMessage::user("produce the design")], 512, None)
            .await
            .unwrap();
        let mut text = String::new();
        let mut usage = None;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.unwrap();
            if let Some(delta) = chunk.delta_text {
                text.push_str(&delta);
            }
            if chunk.usage.is_some() {
                usage = chunk.usage;
            }
        }
        assert_eq!(text.trim(), "design complete");
        assert_eq!(usage.unwrap().output_tokens, 2);
    }

    #[tokio::test]
    async fn router_prefers_persona_binding() {
        let default: Arc<dyn AgentProvider> = Arc::new(ScriptedProvider::echo());
        let special: Arc<dyn AgentProvider> =
            Arc::new(ScriptedProvider::new(vec!["special".into()]));
        let router = ProviderRouter::new(default).route("security_specialist", special);
        let provider = router.provider_for("security_specialist");
        let mut stream = provider
            .chat(&[ChatMessage::user("hello")], 64, None)
            .await
            .unwrap();
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.delta_text.as_deref(), Some("special "));
        assert!(router.unhealthy().await.is_empty());
    }
}
