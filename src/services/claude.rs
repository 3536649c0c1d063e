use crate::config::ProviderConfig;
use crate::error::{ProviderError, Result};
use crate::services::http::{resolve_api_key, send_json};
use crate::services::{
    ModelMessage, ModelResponse, ModelService, Provider, RequestOptions, Role, ServiceDescriptor,
    ServiceStatus,
};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const DEFAULT_API_KEY_ENV: &str = "ANTHROPIC_API_KEY";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Claude model family members exposed as services
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaudeModel {
    Opus,
    Sonnet,
    Haiku,
}

impl ClaudeModel {
    pub const ALL: [Self; 3] = [Self::Opus, Self::Sonnet, Self::Haiku];

    /// Registry id
    #[must_use]
    pub const fn id(self) -> &'static str {
        match self {
            Self::Opus => "claude-3-opus",
            Self::Sonnet => "claude-3-sonnet",
            Self::Haiku => "claude-3-haiku",
        }
    }

    #[must_use]
    pub const fn display_name(self) -> &'static str {
        match self {
            Self::Opus => "Claude 3 Opus",
            Self::Sonnet => "Claude 3 Sonnet",
            Self::Haiku => "Claude 3 Haiku",
        }
    }

    /// Model name sent to the Messages API
    #[must_use]
    pub const fn api_model(self) -> &'static str {
        match self {
            Self::Opus => "claude-3-opus-20240229",
            Self::Sonnet => "claude-3-sonnet-20240229",
            Self::Haiku => "claude-3-haiku-20240307",
        }
    }

    #[must_use]
    pub fn from_id(id: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.id() == id)
    }
}

/// Anthropic Messages API chat service
pub struct ClaudeService {
    descriptor: ServiceDescriptor,
    model: ClaudeModel,
    client: Option<reqwest::Client>,
    api_key: Option<String>,
    explicit_key: Option<String>,
    api_key_env: String,
    base_url: String,
    timeout: Option<Duration>,
    verify_on_init: bool,
}

impl std::fmt::Debug for ClaudeService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClaudeService")
            .field("model", &self.model)
            .field("client", &self.client.as_ref().map(|_| "Client { ... }"))
            .field("api_key", &"***")
            .field("api_key_env", &self.api_key_env)
            .field("base_url", &self.base_url)
            .field("timeout", &self.timeout)
            .field("status", &self.descriptor.status)
            .finish()
    }
}

impl ClaudeService {
    #[must_use]
    pub fn new(model: ClaudeModel) -> Self {
        let mut descriptor =
            ServiceDescriptor::new(model.id(), model.display_name(), Provider::Anthropic);
        descriptor.max_tokens = Some(DEFAULT_MAX_TOKENS);
        descriptor.description = Some(format!("Anthropic {}", model.display_name()));

        Self {
            descriptor,
            model,
            client: None,
            api_key: None,
            explicit_key: None,
            api_key_env: DEFAULT_API_KEY_ENV.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: None,
            verify_on_init: false,
        }
    }

    /// Create from the `[anthropic]` config section
    #[must_use]
    pub fn from_config(model: ClaudeModel, config: &ProviderConfig) -> Self {
        let mut service = Self::new(model);
        if let Some(env) = &config.api_key_env {
            service.api_key_env.clone_from(env);
        }
        if let Some(base_url) = &config.base_url {
            service.base_url.clone_from(base_url);
        }
        service.timeout = config.timeout_secs.map(Duration::from_secs);
        service.verify_on_init = config.verify_on_init;
        service
    }

    #[must_use]
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.explicit_key = Some(api_key.into());
        self
    }

    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Use a preconfigured HTTP client instead of building one on initialize
    #[must_use]
    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = Some(client);
        self
    }

    #[must_use]
    pub const fn model(&self) -> ClaudeModel {
        self.model
    }

    /// Build a Messages API request body.
    ///
    /// System messages (or the options' system prompt, which replaces them)
    /// go into the top-level `system` field.
    fn build_request(&self, messages: &[ModelMessage], options: &RequestOptions) -> Value {
        let system = options.system_prompt.clone().unwrap_or_else(|| {
            messages
                .iter()
                .filter(|m| m.role == Role::System)
                .map(|m| m.content.as_str())
                .collect::<Vec<_>>()
                .join("\n\n")
        });

        let turns: Vec<Value> = messages
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|m| json!({ "role": m.role.as_str(), "content": m.content }))
            .collect();

        let mut body = json!({
            "model": self.model.api_model(),
            "max_tokens": options
                .max_tokens
                .or(self.descriptor.max_tokens)
                .unwrap_or(DEFAULT_MAX_TOKENS),
            "temperature": options.temperature_or(self.descriptor.temperature),
            "messages": turns,
        });

        if !system.is_empty() {
            body["system"] = json!(system);
        }
        if let Some(top_p) = options.top_p {
            body["top_p"] = json!(top_p);
        }
        if let Some(top_k) = options.top_k {
            body["top_k"] = json!(top_k);
        }
        if !options.tools.is_empty() {
            body["tools"] = json!(options.tools);
        }

        body
    }

    /// Normalize a Messages API response
    fn parse_response(raw: &Value, fallback_model: &str) -> Result<ModelResponse> {
        let blocks = raw["content"].as_array().ok_or_else(|| {
            ProviderError::ApiError("Missing 'content' field in API response".to_string())
        })?;

        let content = blocks
            .iter()
            .filter(|block| block["type"] == "text")
            .filter_map(|block| block["text"].as_str())
            .collect::<String>();

        let token = |v: &Value| v.as_u64().and_then(|n| u32::try_from(n).ok());
        let prompt_tokens = token(&raw["usage"]["input_tokens"]);
        let completion_tokens = token(&raw["usage"]["output_tokens"]);

        Ok(ModelResponse {
            content,
            model: Some(
                raw["model"]
                    .as_str()
                    .unwrap_or(fallback_model)
                    .to_string(),
            ),
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens
                .zip(completion_tokens)
                .and_then(|(p, c)| p.checked_add(c)),
            finish_reason: raw["stop_reason"].as_str().map(str::to_string),
        })
    }

    async fn post(&self, body: &Value) -> Result<Value> {
        let (Some(client), Some(api_key)) = (&self.client, &self.api_key) else {
            return Err(ProviderError::NotInitialized(self.descriptor.id.clone()).into());
        };

        let request = client
            .post(format!("{}/v1/messages", self.base_url.trim_end_matches('/')))
            .header("x-api-key", api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(body);

        send_json(request, self.timeout).await
    }
}

#[async_trait]
impl ModelService for ClaudeService {
    fn descriptor(&self) -> &ServiceDescriptor {
        &self.descriptor
    }

    async fn initialize(&mut self) -> ServiceStatus {
        if self.descriptor.status == ServiceStatus::Ready {
            return ServiceStatus::Ready;
        }

        let Some(api_key) = resolve_api_key(self.explicit_key.as_deref(), &self.api_key_env) else {
            let err = ProviderError::MissingApiKey {
                provider: Provider::Anthropic.to_string(),
                env: self.api_key_env.clone(),
                section: "anthropic".to_string(),
            };
            tracing::warn!("{} unavailable: {err}", self.descriptor.id);
            return self.descriptor.mark_unavailable();
        };

        self.client.get_or_insert_with(reqwest::Client::new);
        self.api_key = Some(api_key);

        if self.verify_on_init {
            let probe = json!({
                "model": self.model.api_model(),
                "max_tokens": 1,
                "messages": [{ "role": "user", "content": "Hello" }],
            });
            if let Err(e) = self.post(&probe).await {
                tracing::warn!("Failed to initialize {}: {e}", self.descriptor.id);
                return self.descriptor.mark_unavailable();
            }
        }

        tracing::debug!("{} ready", self.descriptor.id);
        self.descriptor.mark_ready()
    }

    async fn send_message(
        &self,
        messages: &[ModelMessage],
        options: &RequestOptions,
    ) -> Result<ModelResponse> {
        if !self.descriptor.is_available {
            return Err(self.descriptor.unavailable_error().into());
        }

        let body = self.build_request(messages, options);
        let raw = self.post(&body).await?;
        Self::parse_response(&raw, self.model.api_model())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AssistantError;
    use serial_test::serial;

    #[test]
    fn test_model_variants() {
        assert_eq!(ClaudeModel::from_id("claude-3-haiku"), Some(ClaudeModel::Haiku));
        assert_eq!(ClaudeModel::from_id("claude-2"), None);
        assert_eq!(ClaudeModel::Opus.display_name(), "Claude 3 Opus");

        let service = ClaudeService::new(ClaudeModel::Sonnet);
        assert_eq!(service.descriptor().id, "claude-3-sonnet");
        assert_eq!(service.descriptor().provider, Provider::Anthropic);
        assert_eq!(service.descriptor().status, ServiceStatus::Loading);
        assert!(!service.descriptor().is_available);
    }

    #[test]
    fn test_build_request_moves_system_messages() {
        let service = ClaudeService::new(ClaudeModel::Haiku);
        let messages = vec![
            ModelMessage::system("Be brief."),
            ModelMessage::user("Hi"),
            ModelMessage::assistant("Hello!"),
            ModelMessage::user("What's 2+2?"),
        ];
        let options = RequestOptions {
            top_k: Some(40),
            ..RequestOptions::default()
        };

        let body = service.build_request(&messages, &options);
        assert_eq!(body["model"], "claude-3-haiku-20240307");
        assert_eq!(body["system"], "Be brief.");
        assert_eq!(body["max_tokens"], 4096);
        assert_eq!(body["top_k"], 40);
        assert!(body.get("top_p").is_none());
        assert!(body.get("tools").is_none());

        let turns = body["messages"].as_array().unwrap();
        assert_eq!(turns.len(), 3);
        assert_eq!(turns[0]["role"], "user");
        assert_eq!(turns[1]["role"], "assistant");
    }

    #[test]
    fn test_build_request_system_prompt_override() {
        let service = ClaudeService::new(ClaudeModel::Opus);
        let messages = vec![ModelMessage::system("ignored"), ModelMessage::user("Hi")];
        let options = RequestOptions {
            system_prompt: Some("You are a pirate.".to_string()),
            max_tokens: Some(100),
            tools: vec![json!({ "name": "lookup", "input_schema": { "type": "object" } })],
            ..RequestOptions::default()
        };

        let body = service.build_request(&messages, &options);
        assert_eq!(body["system"], "You are a pirate.");
        assert_eq!(body["max_tokens"], 100);
        assert_eq!(body["tools"][0]["name"], "lookup");
    }

    #[test]
    fn test_parse_response() {
        let raw = json!({
            "id": "msg_01",
            "model": "claude-3-haiku-20240307",
            "content": [
                { "type": "text", "text": "Four" },
                { "type": "tool_use", "id": "t1", "name": "calc", "input": {} },
                { "type": "text", "text": "." }
            ],
            "stop_reason": "end_turn",
            "usage": { "input_tokens": 12, "output_tokens": 2 }
        });

        let response = ClaudeService::parse_response(&raw, "fallback").unwrap();
        assert_eq!(response.content, "Four.");
        assert_eq!(response.model.as_deref(), Some("claude-3-haiku-20240307"));
        assert_eq!(response.finish_reason.as_deref(), Some("end_turn"));
        assert_eq!(response.prompt_tokens, Some(12));
        assert_eq!(response.completion_tokens, Some(2));
        assert_eq!(response.total_tokens, Some(14));

        assert!(ClaudeService::parse_response(&json!({ "error": {} }), "m").is_err());
    }

    #[test]
    fn test_parse_response_usage_overflow() {
        let raw = json!({
            "content": [{ "type": "text", "text": "ok" }],
            "usage": { "input_tokens": u32::MAX, "output_tokens": 5 }
        });

        let response = ClaudeService::parse_response(&raw, "m").unwrap();
        assert_eq!(response.prompt_tokens, Some(u32::MAX));
        assert_eq!(response.completion_tokens, Some(5));
        assert_eq!(response.total_tokens, None);
    }

    #[tokio::test]
    #[serial]
    async fn test_initialize_without_key_is_soft_failure() {
        let original = std::env::var("ANTHROPIC_API_KEY_TEST").ok();
        std::env::remove_var("ANTHROPIC_API_KEY_TEST");

        let config = ProviderConfig {
            api_key_env: Some("ANTHROPIC_API_KEY_TEST".to_string()),
            ..ProviderConfig::default()
        };
        let mut service = ClaudeService::from_config(ClaudeModel::Haiku, &config);

        let status = service.initialize().await;
        assert_eq!(status, ServiceStatus::Error);
        assert!(!service.descriptor().is_available);

        let result = service
            .send_message(&[ModelMessage::user("Hi")], &RequestOptions::default())
            .await;
        assert!(matches!(
            result,
            Err(AssistantError::Provider(ProviderError::Unavailable(_)))
        ));

        // Restore original env var
        if let Some(val) = original {
            std::env::set_var("ANTHROPIC_API_KEY_TEST", val);
        }
    }

    #[tokio::test]
    async fn test_initialize_with_key_is_idempotent() {
        let mut service = ClaudeService::new(ClaudeModel::Sonnet).with_api_key("sk-ant-test");
        assert_eq!(service.initialize().await, ServiceStatus::Ready);
        assert_eq!(service.initialize().await, ServiceStatus::Ready);
        assert!(service.descriptor().is_available);
    }

    #[tokio::test]
    async fn test_send_before_initialize() {
        let service = ClaudeService::new(ClaudeModel::Opus).with_api_key("sk-ant-test");
        let result = service
            .send_message(&[ModelMessage::user("Hi")], &RequestOptions::default())
            .await;
        assert!(matches!(
            result,
            Err(AssistantError::Provider(ProviderError::NotInitialized(_)))
        ));
    }

    #[test]
    fn test_debug_hides_api_key() {
        let service = ClaudeService::new(ClaudeModel::Opus).with_api_key("sk-ant-secret");
        let debug = format!("{service:?}");
        assert!(!debug.contains("sk-ant-secret"));
        assert!(debug.contains("***"));
    }
}
