use crate::error::ProviderError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A logical completion request, independent of any provider's wire format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub system_prompt: Option<String>,
    pub prompt: String,
    pub max_tokens: u32,
    #[serde(default)]
    pub temperature: Option<f32>,
}

impl CompletionRequest {
    /// A request with no system prompt and a default token budget.
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            system_prompt: None,
            prompt: prompt.into(),
            max_tokens: 1024,
            temperature: None,
        }
    }

    /// Set the system prompt.
    pub fn with_system(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(system_prompt.into());
        self
    }

    /// Set the token budget.
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Hex SHA-256 of the normalized request. Equivalent requests share it.
    ///
    /// Whitespace at either end is ignored; temperature is not part of the key.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.system_prompt.as_deref().unwrap_or("").trim().as_bytes());
        hasher.update([0u8]);
        hasher.update(self.prompt.trim().as_bytes());
        hasher.update([0u8]);
        hasher.update(self.max_tokens.to_le_bytes());
        hex::encode(hasher.finalize())
    }
}

/// A provider's answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    pub text: String,
    /// Model that produced the text, as reported by the provider.
    pub model: Option<String>,
}

impl Completion {
    /// A completion with text only.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            model: None,
        }
    }
}

/// An interchangeable backend able to fulfil a [`CompletionRequest`].
///
/// Implementations report failures by class so the router can choose between
/// retry, failover and quarantine.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Stable id used for health tracking.
    fn id(&self) -> &str;

    /// Run one completion.
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, ProviderError>;
}
