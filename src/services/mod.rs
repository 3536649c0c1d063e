pub mod claude;
pub mod http;
pub mod local;
pub mod openai;
pub mod registry;

use crate::error::{ProviderError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

pub use claude::{ClaudeModel, ClaudeService};
pub use local::{LocalModelOptions, LocalModelService, LocalProgressFn};
pub use openai::OpenAIService;
pub use registry::ServiceRegistry;

/// Temperature used when neither the request nor the service sets one
pub const DEFAULT_TEMPERATURE: f32 = 0.7;

/// Origin of a model service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Provider {
    Anthropic,
    OpenAI,
    Local,
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Anthropic => "Anthropic",
            Self::OpenAI => "OpenAI",
            Self::Local => "Local",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// One message in a conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelMessage {
    pub role: Role,
    pub content: String,
}

impl ModelMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelType {
    Chat,
    Completion,
    Embedding,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Ready,
    Loading,
    Error,
}

/// Registry-facing description of a service
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceDescriptor {
    pub id: String,
    pub name: String,
    pub provider: Provider,
    pub is_available: bool,
    pub is_local: bool,
    pub model_type: ModelType,
    pub status: ServiceStatus,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub description: Option<String>,
}

impl ServiceDescriptor {
    /// Descriptor for a freshly constructed, not yet initialized chat service
    pub fn new(id: impl Into<String>, name: impl Into<String>, provider: Provider) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            provider,
            is_available: false,
            is_local: provider == Provider::Local,
            model_type: ModelType::Chat,
            status: ServiceStatus::Loading,
            temperature: Some(DEFAULT_TEMPERATURE),
            max_tokens: None,
            description: None,
        }
    }

    pub(crate) fn mark_ready(&mut self) -> ServiceStatus {
        self.is_available = true;
        self.status = ServiceStatus::Ready;
        self.status
    }

    pub(crate) fn mark_unavailable(&mut self) -> ServiceStatus {
        self.is_available = false;
        self.status = ServiceStatus::Error;
        self.status
    }

    /// Error for a `send_message` call on a service that can't serve it
    pub(crate) fn unavailable_error(&self) -> ProviderError {
        if self.status == ServiceStatus::Loading {
            ProviderError::NotInitialized(self.id.clone())
        } else {
            ProviderError::Unavailable(self.id.clone())
        }
    }
}

/// Per-request sampling and prompting options
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestOptions {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    /// Replaces any system messages in the conversation
    pub system_prompt: Option<String>,
    pub top_p: Option<f32>,
    pub top_k: Option<u32>,
    /// Tool/function definitions, passed through as JSON
    pub tools: Vec<serde_json::Value>,
}

impl RequestOptions {
    /// Effective temperature, clamped into 0.0-1.0
    #[must_use]
    pub fn temperature_or(&self, fallback: Option<f32>) -> f32 {
        self.temperature
            .or(fallback)
            .unwrap_or(DEFAULT_TEMPERATURE)
            .clamp(0.0, 1.0)
    }
}

/// Normalized chat response
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ModelResponse {
    pub content: String,
    pub model: Option<String>,
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
    pub total_tokens: Option<u32>,
    pub finish_reason: Option<String>,
}

/// Unified interface for chat model services
#[async_trait]
pub trait ModelService: Send + Sync {
    fn descriptor(&self) -> &ServiceDescriptor;

    /// Prepare the service. Never fails: problems are reported through the
    /// returned status and the descriptor's `is_available` flag.
    async fn initialize(&mut self) -> ServiceStatus;

    /// Send a conversation and get the model's reply
    async fn send_message(
        &self,
        messages: &[ModelMessage],
        options: &RequestOptions,
    ) -> Result<ModelResponse>;

    /// Fetch the model so it can serve requests
    async fn download_model(&mut self, _on_progress: Option<LocalProgressFn>) -> Result<()> {
        let descriptor = self.descriptor();
        Err(ProviderError::Unsupported(format!(
            "{} is served by {}; there is nothing to download",
            descriptor.id, descriptor.provider
        ))
        .into())
    }

    /// Abandon an interrupted [`ModelService::download_model`].
    ///
    /// Fails when there is nothing to cancel.
    async fn cancel_download(&mut self) -> Result<()> {
        Err(ProviderError::Unsupported(format!(
            "{} has no download to cancel",
            self.descriptor().id
        ))
        .into())
    }
}

/// Backend enum wrapper for dynamic dispatch
#[derive(Debug)]
pub enum ModelBackend {
    Claude(ClaudeService),
    OpenAI(OpenAIService),
    Local(LocalModelService),
}

impl ModelBackend {
    fn service(&self) -> &dyn ModelService {
        match self {
            Self::Claude(s) => s,
            Self::OpenAI(s) => s,
            Self::Local(s) => s,
        }
    }

    fn service_mut(&mut self) -> &mut dyn ModelService {
        match self {
            Self::Claude(s) => s,
            Self::OpenAI(s) => s,
            Self::Local(s) => s,
        }
    }

    #[must_use]
    pub fn descriptor(&self) -> &ServiceDescriptor {
        self.service().descriptor()
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.descriptor().id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.descriptor().name
    }

    #[must_use]
    pub fn provider(&self) -> Provider {
        self.descriptor().provider
    }

    #[must_use]
    pub fn is_available(&self) -> bool {
        self.descriptor().is_available
    }

    #[must_use]
    pub fn is_local(&self) -> bool {
        self.descriptor().is_local
    }

    pub async fn initialize(&mut self) -> ServiceStatus {
        self.service_mut().initialize().await
    }

    pub async fn send_message(
        &self,
        messages: &[ModelMessage],
        options: &RequestOptions,
    ) -> Result<ModelResponse> {
        self.service().send_message(messages, options).await
    }

    pub async fn download_model(&mut self, on_progress: Option<LocalProgressFn>) -> Result<()> {
        self.service_mut().download_model(on_progress).await
    }

    pub async fn cancel_download(&mut self) -> Result<()> {
        self.service_mut().cancel_download().await
    }

    /// Handle that stops a running download from another task.
    ///
    /// `None` for services with nothing to download.
    #[must_use]
    pub fn cancellation_handle(&self) -> Option<CancellationToken> {
        match self {
            Self::Local(s) => Some(s.cancellation_handle()),
            Self::Claude(_) | Self::OpenAI(_) => None,
        }
    }
}

impl From<ClaudeService> for ModelBackend {
    fn from(service: ClaudeService) -> Self {
        Self::Claude(service)
    }
}

impl From<OpenAIService> for ModelBackend {
    fn from(service: OpenAIService) -> Self {
        Self::OpenAI(service)
    }
}

impl From<LocalModelService> for ModelBackend {
    fn from(service: LocalModelService) -> Self {
        Self::Local(service)
    }
}

/// Normalize a chat-completions style payload into a [`ModelResponse`]
#[must_use]
pub fn format_response(raw: &serde_json::Value, model_id: &str) -> ModelResponse {
    let mut response = ModelResponse {
        model: Some(model_id.to_string()),
        ..ModelResponse::default()
    };

    if let Some(text) = raw.as_str() {
        response.content = text.to_string();
        return response;
    }

    if let Some(content) = raw["content"].as_str() {
        response.content = content.to_string();
    } else if let Some(choice) = raw["choices"].get(0) {
        response.content = choice["message"]["content"]
            .as_str()
            .or_else(|| choice["text"].as_str())
            .unwrap_or_default()
            .to_string();
        response.finish_reason = choice["finish_reason"].as_str().map(str::to_string);
    }

    let usage = &raw["usage"];
    response.prompt_tokens = token_count(&usage["prompt_tokens"]);
    response.completion_tokens = token_count(&usage["completion_tokens"]);
    response.total_tokens = token_count(&usage["total_tokens"]);

    response
}

fn token_count(value: &serde_json::Value) -> Option<u32> {
    value.as_u64().and_then(|n| u32::try_from(n).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_temperature_clamped() {
        let options = RequestOptions {
            temperature: Some(1.7),
            ..RequestOptions::default()
        };
        assert!((options.temperature_or(None) - 1.0).abs() < f32::EPSILON);

        let options = RequestOptions::default();
        assert!((options.temperature_or(Some(0.2)) - 0.2).abs() < f32::EPSILON);
        assert!((options.temperature_or(None) - DEFAULT_TEMPERATURE).abs() < f32::EPSILON);
    }

    #[test]
    fn test_format_chat_completion() {
        let raw = json!({
            "choices": [{
                "message": { "role": "assistant", "content": "Hi there" },
                "finish_reason": "stop"
            }],
            "usage": { "prompt_tokens": 9, "completion_tokens": 3, "total_tokens": 12 }
        });

        let response = format_response(&raw, "gpt-4o");
        assert_eq!(response.content, "Hi there");
        assert_eq!(response.model.as_deref(), Some("gpt-4o"));
        assert_eq!(response.finish_reason.as_deref(), Some("stop"));
        assert_eq!(response.prompt_tokens, Some(9));
        assert_eq!(response.completion_tokens, Some(3));
        assert_eq!(response.total_tokens, Some(12));
    }

    #[test]
    fn test_format_legacy_completion_and_plain_string() {
        let raw = json!({ "choices": [{ "text": "legacy", "finish_reason": "length" }] });
        let response = format_response(&raw, "m");
        assert_eq!(response.content, "legacy");
        assert_eq!(response.finish_reason.as_deref(), Some("length"));
        assert!(response.total_tokens.is_none());

        let response = format_response(&json!("just text"), "m");
        assert_eq!(response.content, "just text");
    }

    #[test]
    fn test_descriptor_unavailable_error() {
        let mut descriptor = ServiceDescriptor::new("gpt-4", "GPT-4", Provider::OpenAI);
        assert!(!descriptor.is_local);
        assert!(matches!(
            descriptor.unavailable_error(),
            ProviderError::NotInitialized(_)
        ));

        descriptor.mark_unavailable();
        assert!(matches!(
            descriptor.unavailable_error(),
            ProviderError::Unavailable(_)
        ));
    }

    #[test]
    fn test_provider_ordering_and_display() {
        assert!(Provider::Anthropic < Provider::Local);
        assert_eq!(Provider::OpenAI.to_string(), "OpenAI");
    }
}
