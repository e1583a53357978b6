//! Model-completion collaborator.
//!
//! The engine only needs "text in, text out". Backends implement
//! [`ModelClient`]; the planner and the model step both go through it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelErrorKind {
    RateLimit,
    Auth,
    Timeout,
    Other,
}

/// Provider failure. The engine treats it opaquely apart from `kind`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ModelError {
    pub kind: ModelErrorKind,
    pub message: String,
}

impl ModelError {
    pub fn new(kind: ModelErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(ModelErrorKind::Other, message)
    }

    pub fn cancelled() -> Self {
        Self::other("Model call cancelled")
    }

    pub fn is_rate_limited(&self) -> bool {
        self.kind == ModelErrorKind::RateLimit
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

impl ChatRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// Text-completion backend. Implementations should return promptly once
/// `cancel` fires.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn complete(&self, prompt: &str, cancel: CancellationToken) -> Result<String, ModelError>;

    /// Backends without a native chat endpoint get the transcript folded
    /// into a single prompt.
    async fn chat(
        &self,
        messages: &[ChatMessage],
        cancel: CancellationToken,
    ) -> Result<String, ModelError> {
        let prompt = messages
            .iter()
            .map(|m| format!("{}: {}", m.role.as_str(), m.content))
            .collect::<Vec<_>>()
            .join("\n\n");
        self.complete(&prompt, cancel).await
    }
}

/// Backend for setups that never call a model (e.g. running a prepared
/// plan file made only of tool steps).
#[derive(Debug, Clone, Copy, Default)]
pub struct NoModel;

#[async_trait]
impl ModelClient for NoModel {
    async fn complete(&self, _prompt: &str, _cancel: CancellationToken) -> Result<String, ModelError> {
        Err(ModelError::other("No model backend configured"))
    }
}
